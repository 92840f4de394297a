use super::*;
use crate::parameter_reader::ParameterIndex;
use crate::parameter_store::{ParameterNaming, Scope};
use anyhow::Result;
use std::collections::HashMap;
use tempfile::TempDir;

fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= tolerance, "index {i}: {a} vs {e} (actual {actual:?})");
    }
}

fn linear(weight: Matrix, bias: Option<Vec<f32>>, layout: WeightLayout) -> Linear {
    let (in_features, out_features) = match layout {
        WeightLayout::Straight => (weight.rows(), weight.cols()),
        WeightLayout::Transposed => (weight.cols(), weight.rows()),
    };
    Linear { weight, bias, layout, in_features, out_features }
}

#[test]
fn test_linear_layouts_agree() {
    // [in = 3, out = 2] and its transpose
    let straight = linear(Matrix::new(3, 2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]), Some(vec![0.5, -0.5]), WeightLayout::Straight);
    let transposed =
        linear(Matrix::new(2, 3, vec![1.0, 3.0, 5.0, 2.0, 4.0, 6.0]), Some(vec![0.5, -0.5]), WeightLayout::Transposed);

    let input = [1.0, -1.0, 2.0];
    assert_eq!(straight.forward(&input), vec![8.5, 9.5]);
    assert_eq!(transposed.forward(&input), vec![8.5, 9.5]);
}

#[test]
fn test_feed_forward() {
    let up = linear(Matrix::new(2, 2, vec![1.0, 0.0, 0.0, 1.0]), Some(vec![0.0, 0.0]), WeightLayout::Straight);
    let down = linear(Matrix::new(2, 1, vec![1.0, 1.0]), None, WeightLayout::Straight);
    let ffn = FeedForward::new(up, down);

    let output = ffn.forward(&[2.0, -2.0]);

    // gelu(2) + gelu(-2)
    assert_close(&output, &[tensor::gelu(2.0) + tensor::gelu(-2.0)], 1e-6);
}

#[test]
fn test_gated_feed_forward() {
    let identity = || linear(Matrix::new(2, 2, vec![1.0, 0.0, 0.0, 1.0]), None, WeightLayout::Transposed);
    let down = linear(Matrix::new(1, 2, vec![1.0, 2.0]), None, WeightLayout::Transposed);
    let ffn = GatedFeedForward::new(identity(), identity(), down);

    let output = ffn.forward(&[1.0, 3.0]);

    let expected = tensor::swiglu(1.0) * 1.0 + 2.0 * tensor::swiglu(3.0) * 3.0;
    assert_close(&output, &[expected], 1e-5);
}

#[test]
fn test_sinusoidal_position() {
    assert_eq!(sinusoidal_position(0, 4), vec![0.0, 1.0, 0.0, 1.0]);

    let position = sinusoidal_position(3, 4);
    assert_close(&position, &[3f32.sin(), 3f32.cos(), 0.03f32.sin(), 0.03f32.cos()], 1e-6);
}

#[test]
fn test_norms() {
    let norm = LayerNorm { weight: vec![1.0, 2.0], bias: vec![0.0, 1.0], epsilon: 0.0 };
    assert_close(&norm.forward(&[1.0, 3.0]), &[-1.0, 3.0], 1e-6);

    let rms = RmsNorm { weight: vec![1.0, 1.0], epsilon: 0.0 };
    assert_close(&rms.forward(&[3.0, 4.0]), &[3.0 / 12.5f32.sqrt(), 4.0 / 12.5f32.sqrt()], 1e-6);
}

#[test]
fn test_load_layers_from_store() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let tensors = [
        ("h.0.ln.weight", vec![2usize], vec![1.0f32, 1.0]),
        ("h.0.ln.bias", vec![2], vec![0.0, 0.0]),
        ("h.0.proj.weight", vec![3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
        ("h.0.proj.bias", vec![3], vec![1.0, 1.0, 1.0]),
        ("wpe.weight", vec![2, 2], vec![0.1, 0.2, 0.3, 0.4]),
    ];

    let mut offset = 0;
    let mut entries = Vec::new();
    let mut data = Vec::new();
    for (name, shape, values) in &tensors {
        let end = offset + values.len() * 4;
        entries.push(format!(r#""{name}":{{"dtype":"F32","shape":{shape:?},"data_offsets":[{offset},{end}]}}"#));
        data.extend(values.iter().flat_map(|v| v.to_le_bytes()));
        offset = end;
    }
    let header = format!("{{{}}}", entries.join(","));
    let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(&data);
    std::fs::write(temp_dir.path().join("model.safetensors"), bytes)?;

    let index = ParameterIndex::load(temp_dir.path())?;
    let naming = ParameterNaming::new("{name}", "h.{decoderId}.{name}", HashMap::new());
    let mut store = ParameterStore::new(&index, &naming, Scope::Decoder(0));

    let norm = LayerNorm::load(&mut store, "ln", 2, 1e-5)?;
    let proj = Linear::load(&mut store, "proj", 2, 3, WeightLayout::Transposed)?;
    assert_eq!(proj.forward(&[1.0, 1.0]), vec![4.0, 8.0, 12.0]);
    assert_eq!(norm.weight, vec![1.0, 1.0]);
    assert_eq!(store.parameter_count(), 4 + 6 + 3);

    let mut model = store.with_scope(Scope::Model);
    let positions = LearnedPositions::load(&mut model, "wpe.weight", 2, 2)?;
    assert_close(&positions.add_to(1, &[1.0, 1.0]), &[1.3, 1.4], 1e-6);

    // the layout only decides how rows are read, the element count still has to match
    let straight = Linear::load_without_bias(&mut store, "proj", 2, 3, WeightLayout::Straight)?;
    assert_eq!(straight.forward(&[1.0, 1.0]), vec![5.0, 7.0, 9.0]);
    assert!(Linear::load_without_bias(&mut store, "proj", 2, 4, WeightLayout::Straight).is_err());

    Ok(())
}
