#[cfg(test)]
#[path = "../tests/unit/layers_test.rs"]
mod layers_test;

use anyhow::Result;

use crate::parameter_store::ParameterStore;
use crate::tensor::{self, Matrix};

/// Layer Normalization with trained scale and shift.
///
/// **Mathematical Formula**:
/// ```text
/// LayerNorm(x) = (x - mean(x)) / sqrt(var(x) + ε) * γ + β
/// ```
/// The variance is the population variance (divided by N).
pub struct LayerNorm {
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
    pub epsilon: f32,
}

impl LayerNorm {
    /// Loads `{prefix}.weight` and `{prefix}.bias`.
    pub fn load(store: &mut ParameterStore, prefix: &str, size: usize, epsilon: f32) -> Result<Self> {
        Ok(Self {
            weight: store.vector(&format!("{prefix}.weight"), size)?,
            bias: store.vector(&format!("{prefix}.bias"), size)?,
            epsilon,
        })
    }

    pub fn forward(&self, input: &[f32]) -> Vec<f32> {
        tensor::layer_norm(input, &self.weight, &self.bias, self.epsilon)
    }
}

impl std::fmt::Debug for LayerNorm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerNorm").field("dim", &self.weight.len()).field("epsilon", &self.epsilon).finish()
    }
}

/// RMS Layer Normalization - alternative to LayerNorm used in LLaMA
///
/// **Mathematical Formula**:
/// ```text
/// RMSNorm(x) = x / RMS(x) * γ
/// where RMS(x) = sqrt(mean(x²) + ε)
/// ```
pub struct RmsNorm {
    pub weight: Vec<f32>,
    pub epsilon: f32,
}

impl RmsNorm {
    pub fn load(store: &mut ParameterStore, prefix: &str, size: usize, epsilon: f32) -> Result<Self> {
        Ok(Self { weight: store.vector(&format!("{prefix}.weight"), size)?, epsilon })
    }

    pub fn forward(&self, input: &[f32]) -> Vec<f32> {
        tensor::rms_norm(input, &self.weight, self.epsilon)
    }
}

impl std::fmt::Debug for RmsNorm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RmsNorm").field("dim", &self.weight.len()).field("epsilon", &self.epsilon).finish()
    }
}

/// How a checkpoint stores a projection matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightLayout {
    /// `[in, out]`, the Conv1D layout of the OpenAI checkpoints: `y = x · W`.
    Straight,
    /// `[out, in]`, the `nn.Linear` layout: `y = W · x`.
    Transposed,
}

/// Affine projection with an optional bias.
pub struct Linear {
    pub weight: Matrix,
    pub bias: Option<Vec<f32>>,
    pub layout: WeightLayout,
    pub in_features: usize,
    pub out_features: usize,
}

impl Linear {
    /// Loads `{prefix}.weight` and `{prefix}.bias`.
    pub fn load(
        store: &mut ParameterStore,
        prefix: &str,
        in_features: usize,
        out_features: usize,
        layout: WeightLayout,
    ) -> Result<Self> {
        let mut linear = Self::load_without_bias(store, prefix, in_features, out_features, layout)?;
        linear.bias = Some(store.vector(&format!("{prefix}.bias"), out_features)?);
        Ok(linear)
    }

    /// Loads `{prefix}.weight` only.
    pub fn load_without_bias(
        store: &mut ParameterStore,
        prefix: &str,
        in_features: usize,
        out_features: usize,
        layout: WeightLayout,
    ) -> Result<Self> {
        let name = format!("{prefix}.weight");
        let weight = match layout {
            WeightLayout::Straight => store.matrix(&name, in_features, out_features)?,
            WeightLayout::Transposed => store.matrix(&name, out_features, in_features)?,
        };

        Ok(Self { weight, bias: None, layout, in_features, out_features })
    }

    /// Loads `{prefix}.weight` and, when present, `{prefix}.bias`; `None` without a weight.
    pub fn load_optional(
        store: &mut ParameterStore,
        prefix: &str,
        in_features: usize,
        out_features: usize,
        layout: WeightLayout,
    ) -> Result<Option<Self>> {
        let name = format!("{prefix}.weight");
        let weight = match layout {
            WeightLayout::Straight => store.matrix_optional(&name, in_features, out_features)?,
            WeightLayout::Transposed => store.matrix_optional(&name, out_features, in_features)?,
        };

        let Some(weight) = weight else {
            return Ok(None);
        };

        let bias = store.vector_optional(&format!("{prefix}.bias"), out_features)?;

        Ok(Some(Self { weight, bias, layout, in_features, out_features }))
    }

    pub fn forward(&self, input: &[f32]) -> Vec<f32> {
        let mut output = match self.layout {
            WeightLayout::Straight => tensor::mul_vector_by_matrix(input, &self.weight),
            WeightLayout::Transposed => tensor::mul_vector_by_transposed_matrix(input, &self.weight),
        };

        if let Some(bias) = &self.bias {
            tensor::add_inplace(&mut output, bias);
        }

        output
    }
}

impl std::fmt::Debug for Linear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linear")
            .field("in_features", &self.in_features)
            .field("out_features", &self.out_features)
            .field("layout", &self.layout)
            .field("bias", &self.bias.is_some())
            .finish()
    }
}

/// Two-layer MLP with GELU activation used by the GPT family and BLOOM.
///
/// ```text
/// FFN(x) = W2 · GELU(W1 · x + b1) + b2
/// ```
#[derive(Debug)]
pub struct FeedForward {
    pub up: Linear,
    pub down: Linear,
}

impl FeedForward {
    pub fn new(up: Linear, down: Linear) -> Self {
        Self { up, down }
    }

    pub fn forward(&self, input: &[f32]) -> Vec<f32> {
        let hidden = self.up.forward(input).into_iter().map(tensor::gelu).collect::<Vec<_>>();
        self.down.forward(&hidden)
    }
}

/// Feed-Forward Network with SwiGLU activation
///
/// **Formula**: `FFN(x) = W_down · (SiLU(W_gate · x) ⊙ (W_up · x))`
#[derive(Debug)]
pub struct GatedFeedForward {
    pub gate: Linear,
    pub up: Linear,
    pub down: Linear,
}

impl GatedFeedForward {
    pub fn new(gate: Linear, up: Linear, down: Linear) -> Self {
        Self { gate, up, down }
    }

    pub fn forward(&self, input: &[f32]) -> Vec<f32> {
        let gate = self.gate.forward(input);
        let up = self.up.forward(input);

        let hidden = gate.into_iter().zip(up).map(|(gate, up)| tensor::swiglu(gate) * up).collect::<Vec<_>>();
        self.down.forward(&hidden)
    }
}

/// Fixed sinusoidal position encoding of the original transformer.
///
/// ```text
/// PE(pos, 2k)   = sin(pos / 10000^(2k/d))
/// PE(pos, 2k+1) = cos(pos / 10000^(2k/d))
/// ```
pub fn sinusoidal_position(position: usize, size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| {
            let exponent = (i - i % 2) as f64 / size as f64;
            let angle = position as f64 / 10000f64.powf(exponent);
            if i % 2 == 0 { angle.sin() as f32 } else { angle.cos() as f32 }
        })
        .collect()
}

/// Learned absolute position embeddings, one row per position.
pub struct LearnedPositions {
    pub table: Matrix,
}

impl LearnedPositions {
    pub fn load(store: &mut ParameterStore, name: &str, context_size: usize, size: usize) -> Result<Self> {
        Ok(Self { table: store.matrix(name, context_size, size)? })
    }

    pub fn add_to(&self, position: usize, embedding: &[f32]) -> Vec<f32> {
        assert!(
            position < self.table.rows(),
            "Position {position} is beyond the {} learned positions",
            self.table.rows()
        );
        tensor::add(embedding, self.table.row(position))
    }
}

impl std::fmt::Debug for LearnedPositions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LearnedPositions").field("positions", &self.table.rows()).finish()
    }
}
