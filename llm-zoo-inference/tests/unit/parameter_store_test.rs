use super::*;
use anyhow::Result;
use std::fs;
use tempfile::TempDir;

fn overrides(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(from, to)| (from.to_string(), to.to_string())).collect()
}

/// Writes a single-file model holding `f32` tensors laid out back to back.
fn write_model(dir: &std::path::Path, tensors: &[(&str, Vec<usize>, Vec<f32>)]) -> Result<()> {
    let mut offset = 0;
    let mut entries = Vec::new();
    let mut data = Vec::new();

    for (name, shape, values) in tensors {
        let end = offset + values.len() * 4;
        entries.push(format!(r#""{name}":{{"dtype":"F32","shape":{shape:?},"data_offsets":[{offset},{end}]}}"#));
        data.extend(values.iter().flat_map(|v| v.to_le_bytes()));
        offset = end;
    }

    let header = format!("{{{}}}", entries.join(","));
    let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(&data);
    fs::write(dir.join("model.safetensors"), bytes)?;

    Ok(())
}

#[test]
fn test_default_templates() {
    let naming = ParameterNaming::new("{name}", "h.{decoderId}.{name}", HashMap::new());

    assert_eq!(naming.model_name("wte.weight"), "wte.weight");
    assert_eq!(naming.decoder_name(3, "ln_1.weight"), "h.3.ln_1.weight");
}

#[test]
fn test_prefixed_templates() {
    let naming = ParameterNaming::new("transformer.{name}", "transformer.h.{decoderId}.{name}", HashMap::new());

    assert_eq!(naming.model_name("ln_f.bias"), "transformer.ln_f.bias");
    assert_eq!(naming.decoder_name(0, "attn.attention.q_proj.weight"), "transformer.h.0.attn.attention.q_proj.weight");
}

#[test]
fn test_overrides_apply_before_and_after_formatting() {
    let naming = ParameterNaming::new(
        "{name}",
        "layers.{decoderId}.{name}",
        overrides(&[
            ("tokens_embed.weight", "embeddings.word.weight"),
            ("ln_1.weight", "norm.{decoderId}.scale"),
            ("layers.2.ln_2.bias", "special.bias"),
        ]),
    );

    assert_eq!(naming.model_name("tokens_embed.weight"), "embeddings.word.weight");
    assert_eq!(naming.model_name("other"), "other");
    assert_eq!(naming.decoder_name(1, "ln_1.weight"), "layers.1.norm.1.scale");
    assert_eq!(naming.decoder_name(2, "ln_2.bias"), "special.bias");
    assert_eq!(naming.decoder_name(1, "ln_2.bias"), "layers.1.ln_2.bias");
}

#[test]
fn test_store_reads_and_counts() -> Result<()> {
    let temp_dir = TempDir::new()?;
    write_model(
        temp_dir.path(),
        &[
            ("embed", vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]),
            ("h.0.norm", vec![2], vec![0.5, 0.25]),
            ("h.0.extra", vec![2], vec![7.0, 8.0]),
        ],
    )?;
    let index = ParameterIndex::load(temp_dir.path())?;
    let naming = ParameterNaming::new("{name}", "h.{decoderId}.{name}", HashMap::new());

    let mut store = ParameterStore::new(&index, &naming, Scope::Model);
    let embed = store.matrix("embed", 2, 2)?;
    assert_eq!(embed.row(0), &[1.0, 2.0]);
    assert_eq!(store.parameter_count(), 4);

    let mut decoder = store.with_scope(Scope::Decoder(0));
    assert_eq!(decoder.vector("norm", 2)?, vec![0.5, 0.25]);
    assert_eq!(decoder.vector_optional("extra", 2)?, Some(vec![7.0, 8.0]));
    assert_eq!(decoder.vector_optional("missing", 2)?, None);
    assert_eq!(decoder.parameter_count(), 4);

    let err = decoder.vector("missing", 2).unwrap_err();
    assert!(err.to_string().contains("h.0.missing"), "{err}");
    assert!(matches!(err.downcast_ref::<crate::error::ParameterFileError>(), Some(_)));

    Ok(())
}

#[test]
fn test_calculation_only_counts_without_reading() -> Result<()> {
    let naming = ParameterNaming::new("{name}", "{decoderId}.{name}", HashMap::new());
    let mut store = ParameterStore::calculation_only(None, &naming, Scope::Decoder(0));

    assert!(store.is_calculation_only());
    assert!(store.vector("ln_1.weight", 16)?.is_empty());
    assert_eq!(store.matrix("attn.c_attn.weight", 16, 48)?.rows(), 0);
    // presence of optional tensors is unknown without an index
    assert_eq!(store.vector_optional("rotary.inv_freq", 4)?, None);
    assert_eq!(store.parameter_count(), 16 + 16 * 48);

    Ok(())
}

#[test]
fn test_calculation_only_with_index_counts_present_optional_tensors() -> Result<()> {
    let temp_dir = TempDir::new()?;
    write_model(temp_dir.path(), &[("lm_head.weight", vec![3, 2], vec![0.0; 6])])?;
    let index = ParameterIndex::load(temp_dir.path())?;
    let naming = ParameterNaming::new("{name}", "{decoderId}.{name}", HashMap::new());

    let mut store = ParameterStore::calculation_only(Some(&index), &naming, Scope::Model);

    assert!(store.matrix_optional("lm_head.weight", 3, 2)?.is_some());
    assert!(store.matrix_optional("lm_head.bias", 3, 1)?.is_none());
    assert_eq!(store.parameter_count(), 6);

    Ok(())
}
