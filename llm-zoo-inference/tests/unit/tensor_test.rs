use super::*;

fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= tolerance, "index {i}: {a} != {e}");
    }
}

#[test]
fn test_softmax_known_values() {
    let mut values = vec![1.0, 2.0, 3.0, 4.0, 1.0, 2.0, 3.0];
    softmax(&mut values);

    assert_close(
        &values,
        &[0.023640543, 0.06426166, 0.1746813, 0.474833, 0.023640543, 0.06426166, 0.1746813],
        1e-6,
    );
}

#[test]
fn test_softmax_sums_to_one_and_is_shift_invariant() {
    let original = vec![-3.5, 0.25, 7.0, 2.0, -0.5, 11.0];

    let mut plain = original.clone();
    softmax(&mut plain);
    let total: f32 = plain.iter().sum();
    assert!((total - 1.0).abs() < 1e-6, "sum is {total}");

    let mut shifted = original.iter().map(|v| v + 100.0).collect::<Vec<_>>();
    softmax(&mut shifted);
    assert_close(&plain, &shifted, 1e-6);
}

#[test]
fn test_softmax_handles_large_values() {
    let mut values = vec![1000.0, 1000.0];
    softmax(&mut values);
    assert_close(&values, &[0.5, 0.5], 1e-7);
}

#[test]
fn test_activations() {
    assert!((gelu(2.0) - 1.9545977).abs() < 1e-6);
    assert!((gelu(0.01) - 0.0050398936).abs() < 1e-8);
    assert!((gelu(-0.045) - -0.021692416).abs() < 1e-8);
    assert_eq!(gelu(0.0), 0.0);

    assert!((swiglu(2.0) - 1.7615942).abs() < 1e-6);
    assert!((swiglu(-0.045) - -0.021993836).abs() < 1e-8);
}

#[test]
fn test_matrix_vector_products() {
    // [[1, 2, 3], [4, 5, 6]]
    let matrix = Matrix::new(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

    assert_eq!(mul_vector_by_matrix(&[1.0, -1.0], &matrix), vec![-3.0, -3.0, -3.0]);
    assert_eq!(mul_vector_by_transposed_matrix(&[1.0, 0.0, 2.0], &matrix), vec![7.0, 16.0]);
    assert_eq!(matrix.row(1), &[4.0, 5.0, 6.0]);
}

#[test]
#[should_panic(expected = "Vector length must match matrix rows")]
fn test_matrix_vector_product_rejects_wrong_size() {
    let matrix = Matrix::new(2, 2, vec![1.0; 4]);
    mul_vector_by_matrix(&[1.0, 2.0, 3.0], &matrix);
}

#[test]
fn test_layer_norm_uses_population_variance() {
    let x = [1.0, 2.0, 3.0, 4.0];
    let result = layer_norm(&x, &[1.0; 4], &[0.0; 4], 0.0);

    // mean 2.5, population variance 1.25
    let deviation = 1.25f32.sqrt();
    assert_close(&result, &[-1.5 / deviation, -0.5 / deviation, 0.5 / deviation, 1.5 / deviation], 1e-6);

    let shifted = layer_norm(&x, &[2.0; 4], &[1.0; 4], 0.0);
    assert_close(&shifted, &result.iter().map(|v| v * 2.0 + 1.0).collect::<Vec<_>>(), 1e-6);
}

#[test]
fn test_rms_norm() {
    let result = rms_norm(&[3.0, 4.0], &[1.0, 0.5], 0.0);
    let rms = 12.5f32.sqrt();
    assert_close(&result, &[3.0 / rms, 0.5 * 4.0 / rms], 1e-6);
}

#[test]
fn test_split_and_flatten() {
    let values = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let pieces = split(&values, 3);

    assert_eq!(pieces, vec![&[1.0, 2.0][..], &[3.0, 4.0][..], &[5.0, 6.0][..]]);
    assert_eq!(flatten(&pieces), values.to_vec());
}

#[test]
fn test_vector_helpers() {
    assert_eq!(add(&[1.0, 2.0], &[0.5, -2.0]), vec![1.5, 0.0]);
    assert_eq!(dot(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]), 32.0);
    assert_eq!(average(&[1.0, 2.0, 3.0]), 2.0);
    assert_eq!(average_difference(&[1.0, 3.0], 2.0, 0.0), 1.0);
}
