use anyhow::Result;

use super::{Decoder, DecoderSettings};
use crate::attention::Attention;
use crate::layers::{FeedForward, LayerNorm, Linear, WeightLayout};
use crate::parameter_store::ParameterStore;
use crate::tensor;

/// Prefix of the model-level tensors (`transformer.wte.weight`, ...).
pub(super) const MODEL_PREFIX: &str = "transformer.";

/// EleutherAI GPT-Neo decoder: GPT-2 shaped, with separate unbiased query/key/value
/// projections, unscaled scores and local attention on every odd layer.
#[derive(Debug)]
pub struct GptNeoDecoder {
    attention_norm: LayerNorm,
    query: Linear,
    key: Linear,
    value: Linear,
    projection: Linear,
    attention: Attention,
    feed_forward_norm: LayerNorm,
    feed_forward: FeedForward,
    last: bool,
}

impl GptNeoDecoder {
    pub(super) fn load(store: &mut ParameterStore, settings: DecoderSettings) -> Result<Self> {
        let config = settings.config;
        let (hidden_size, feed_forward_size) = (config.hidden_size, config.feed_forward_size);
        let transposed = WeightLayout::Transposed;

        let mut attention =
            Attention::new(config.head_count, config.head_count, config.head_size, settings.context_size)
                .without_dividend();
        if settings.decoder_id % 2 == 1 {
            attention = attention.with_window(config.window_size);
        }

        Ok(Self {
            attention_norm: LayerNorm::load(store, "ln_1", hidden_size, config.epsilon)?,
            query: Linear::load_without_bias(store, "attn.attention.q_proj", hidden_size, hidden_size, transposed)?,
            key: Linear::load_without_bias(store, "attn.attention.k_proj", hidden_size, hidden_size, transposed)?,
            value: Linear::load_without_bias(store, "attn.attention.v_proj", hidden_size, hidden_size, transposed)?,
            projection: Linear::load(store, "attn.attention.out_proj", hidden_size, hidden_size, transposed)?,
            attention,
            feed_forward_norm: LayerNorm::load(store, "ln_2", hidden_size, config.epsilon)?,
            feed_forward: FeedForward::new(
                Linear::load(store, "mlp.c_fc", hidden_size, feed_forward_size, transposed)?,
                Linear::load(store, "mlp.c_proj", feed_forward_size, hidden_size, transposed)?,
            ),
            last: settings.last,
        })
    }

    fn attend(&mut self, input: &[f32]) -> Vec<f32> {
        let output = self.attention.attend(self.query.forward(input), self.key.forward(input), self.value.forward(input));
        self.projection.forward(&output)
    }
}

impl Decoder for GptNeoDecoder {
    fn execute(&mut self, hidden: &[f32], is_output_step: bool) -> Vec<f32> {
        let normalized = self.attention_norm.forward(hidden);
        let hidden = tensor::add(hidden, &self.attend(&normalized));

        if self.last && !is_output_step {
            return hidden;
        }

        let feed_forward = self.feed_forward.forward(&self.feed_forward_norm.forward(&hidden));
        tensor::add(&hidden, &feed_forward)
    }

    fn clear(&mut self) {
        self.attention.clear();
    }

    fn cached_positions(&self) -> usize {
        self.attention.cached_positions()
    }
}
