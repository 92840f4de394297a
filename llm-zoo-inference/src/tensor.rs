#[cfg(test)]
#[path = "../tests/unit/tensor_test.rs"]
mod tensor_test;

use rayon::prelude::*;

/// Dense row-major matrix of `f32` values.
#[derive(Clone, Default, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Matrix {
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), rows * cols, "Matrix data must hold {rows}x{cols} values, got {}", data.len());
        Self { rows, cols, data }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row(&self, index: usize) -> &[f32] {
        assert!(index < self.rows, "Row {index} is out of range for a matrix with {} rows", self.rows);
        &self.data[index * self.cols..(index + 1) * self.cols]
    }
}

impl std::fmt::Debug for Matrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matrix").field("rows", &self.rows).field("cols", &self.cols).finish()
    }
}

pub fn add(a: &[f32], b: &[f32]) -> Vec<f32> {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(&x, &y)| x + y).collect()
}

pub fn add_inplace(a: &mut [f32], b: &[f32]) {
    debug_assert_eq!(a.len(), b.len());
    a.iter_mut().zip(b).for_each(|(x, &y)| *x += y);
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(&x, &y)| x * y).sum()
}

/// Computes `v · M` where `M` is stored as `[v.len(), out]`.
pub fn mul_vector_by_matrix(vector: &[f32], matrix: &Matrix) -> Vec<f32> {
    assert_eq!(vector.len(), matrix.rows, "Vector length must match matrix rows");

    (0..matrix.cols)
        .into_par_iter()
        .map(|col| {
            vector.iter().enumerate().map(|(row, &value)| value * matrix.data[row * matrix.cols + col]).sum::<f32>()
        })
        .collect()
}

/// Computes `M · v` where `M` is stored as `[out, v.len()]`.
pub fn mul_vector_by_transposed_matrix(vector: &[f32], matrix: &Matrix) -> Vec<f32> {
    assert_eq!(vector.len(), matrix.cols, "Vector length must match matrix columns");

    matrix.data.par_chunks(matrix.cols).map(|row| dot(vector, row)).collect()
}

/// Splits a vector into `parts` contiguous pieces of equal length.
pub fn split(vector: &[f32], parts: usize) -> Vec<&[f32]> {
    assert!(parts > 0 && vector.len() % parts == 0, "Cannot split {} values into {parts} parts", vector.len());
    vector.chunks(vector.len() / parts).collect()
}

pub fn flatten<T: AsRef<[f32]>>(pieces: &[T]) -> Vec<f32> {
    pieces.iter().flat_map(|piece| piece.as_ref().iter().copied()).collect()
}

pub fn average(values: &[f32]) -> f32 {
    values.iter().sum::<f32>() / values.len() as f32
}

/// Square root of the mean squared deviation from `mean` plus `epsilon` (population variance).
pub fn average_difference(values: &[f32], mean: f32, epsilon: f32) -> f32 {
    let squared = values.iter().map(|&x| (x - mean) * (x - mean)).sum::<f32>();
    (squared / values.len() as f32 + epsilon).sqrt()
}

/// Applies softmax normalization to a slice in-place.
pub fn softmax(x: &mut [f32]) {
    let max_val = x.iter().fold(f32::NEG_INFINITY, |acc, &val| acc.max(val));
    let sum = x
        .iter_mut()
        .map(|val| {
            *val = (*val - max_val).exp();
            *val
        })
        .sum::<f32>();
    let inv_sum = sum.recip();
    x.iter_mut().for_each(|val| *val *= inv_sum);
}

pub fn layer_norm(x: &[f32], weight: &[f32], bias: &[f32], epsilon: f32) -> Vec<f32> {
    debug_assert_eq!(x.len(), weight.len());
    debug_assert_eq!(x.len(), bias.len());

    let mean = average(x);
    let deviation = average_difference(x, mean, epsilon);

    x.iter().zip(weight).zip(bias).map(|((&value, &w), &b)| (value - mean) / deviation * w + b).collect()
}

pub fn rms_norm(x: &[f32], weight: &[f32], epsilon: f32) -> Vec<f32> {
    debug_assert_eq!(x.len(), weight.len());

    let sum_of_squares = x.iter().map(|&val| val * val).sum::<f32>();
    let factor = 1.0f32 / ((sum_of_squares / x.len() as f32) + epsilon).sqrt();

    x.iter().zip(weight).map(|(&val, &w)| w * (factor * val)).collect()
}

/// GELU with the tanh approximation, evaluated in double precision.
pub fn gelu(value: f32) -> f32 {
    let x = value as f64;
    let inner = (2.0 / std::f64::consts::PI).sqrt() * (x + 0.044715 * x * x * x);
    (0.5 * x * (1.0 + inner.tanh())) as f32
}

/// SiLU gate used by SwiGLU feed-forward blocks: `x * sigmoid(x)`.
pub fn swiglu(value: f32) -> f32 {
    let x = value as f64;
    (x * (1.0 / (1.0 + (-x).exp()))) as f32
}
