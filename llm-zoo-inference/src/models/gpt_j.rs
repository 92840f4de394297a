use anyhow::Result;

use super::{Decoder, DecoderSettings, Embeddings, Transformer};
use crate::attention::{Attention, PositionEncoding, RotaryEmbedding, RotaryStyle};
use crate::configuration::ModelConfig;
use crate::layers::{FeedForward, LayerNorm, Linear, WeightLayout};
use crate::parameter_store::ParameterStore;
use crate::tensor;

/// EleutherAI GPT-J model boundary: no additive positions, final LayerNorm and an
/// untied (optionally biased) output head.
pub struct GptJTransformer {
    embeddings: Embeddings,
    final_norm: LayerNorm,
}

impl GptJTransformer {
    pub(super) fn load(store: &mut ParameterStore, config: &ModelConfig) -> Result<Self> {
        let head = Linear::load_optional(store, "lm_head", config.hidden_size, config.vocab_size, WeightLayout::Transposed)?;

        Ok(Self {
            embeddings: Embeddings::load(store, "transformer.wte.weight", config)?.with_head(head),
            final_norm: LayerNorm::load(store, "transformer.ln_f", config.hidden_size, config.epsilon)?,
        })
    }
}

impl Transformer for GptJTransformer {
    fn embeddings(&self) -> &Embeddings {
        &self.embeddings
    }

    fn prepare(&self, _position: usize, embedding: &[f32]) -> Vec<f32> {
        embedding.to_vec()
    }

    fn finalize(&self, hidden: Vec<f32>) -> Vec<f32> {
        self.final_norm.forward(&hidden)
    }
}

/// GPT-J decoder with a single LayerNorm feeding attention and feed-forward in parallel:
///
/// ```text
/// out = x + Attn(LN(x)) + FFN(LN(x))
/// ```
/// Rotary embeddings rotate adjacent dimension pairs of the first `rotary_dim` dimensions.
#[derive(Debug)]
pub struct GptJDecoder {
    norm: LayerNorm,
    query: Linear,
    key: Linear,
    value: Linear,
    projection: Linear,
    attention: Attention,
    feed_forward: FeedForward,
    last: bool,
}

impl GptJDecoder {
    pub(super) fn load(store: &mut ParameterStore, settings: DecoderSettings) -> Result<Self> {
        let config = settings.config;
        let (hidden_size, feed_forward_size) = (config.hidden_size, config.feed_forward_size);
        let transposed = WeightLayout::Transposed;

        let rotary = RotaryEmbedding::new(RotaryStyle::Adjacent, config.rotary_dim, config.rope_theta);
        let attention = Attention::new(config.head_count, config.head_count, config.head_size, settings.context_size)
            .with_positions(PositionEncoding::Rotary(rotary));

        Ok(Self {
            norm: LayerNorm::load(store, "ln_1", hidden_size, config.epsilon)?,
            query: Linear::load_without_bias(store, "attn.q_proj", hidden_size, hidden_size, transposed)?,
            key: Linear::load_without_bias(store, "attn.k_proj", hidden_size, hidden_size, transposed)?,
            value: Linear::load_without_bias(store, "attn.v_proj", hidden_size, hidden_size, transposed)?,
            projection: Linear::load_without_bias(store, "attn.out_proj", hidden_size, hidden_size, transposed)?,
            attention,
            feed_forward: FeedForward::new(
                Linear::load(store, "mlp.fc_in", hidden_size, feed_forward_size, transposed)?,
                Linear::load(store, "mlp.fc_out", feed_forward_size, hidden_size, transposed)?,
            ),
            last: settings.last,
        })
    }
}

impl Decoder for GptJDecoder {
    fn execute(&mut self, hidden: &[f32], is_output_step: bool) -> Vec<f32> {
        let normalized = self.norm.forward(hidden);

        let output =
            self.attention.attend(self.query.forward(&normalized), self.key.forward(&normalized), self.value.forward(&normalized));
        let mut result = tensor::add(hidden, &self.projection.forward(&output));

        if !self.last || is_output_step {
            tensor::add_inplace(&mut result, &self.feed_forward.forward(&normalized));
        }

        result
    }

    fn clear(&mut self) {
        self.attention.clear();
    }

    fn cached_positions(&self) -> usize {
        self.attention.cached_positions()
    }
}
