use anyhow::Result;

use super::original::{FusedAttention, load_conv_feed_forward};
use super::{Decoder, DecoderSettings, Embeddings, Transformer};
use crate::configuration::ModelConfig;
use crate::layers::{FeedForward, LayerNorm, LearnedPositions};
use crate::parameter_store::ParameterStore;
use crate::tensor;

/// Learned positions plus a final LayerNorm; used by GPT-2 and, with a
/// `transformer.` prefix, by GPT-Neo.
pub struct Gpt2Transformer {
    embeddings: Embeddings,
    positions: LearnedPositions,
    final_norm: LayerNorm,
}

impl Gpt2Transformer {
    pub(super) fn load(store: &mut ParameterStore, config: &ModelConfig, prefix: &str) -> Result<Self> {
        Ok(Self {
            embeddings: Embeddings::load(store, &format!("{prefix}wte.weight"), config)?,
            positions: LearnedPositions::load(
                store,
                &format!("{prefix}wpe.weight"),
                config.context_size.unwrap_or_default(),
                config.hidden_size,
            )?,
            final_norm: LayerNorm::load(store, &format!("{prefix}ln_f"), config.hidden_size, config.epsilon)?,
        })
    }
}

impl Transformer for Gpt2Transformer {
    fn embeddings(&self) -> &Embeddings {
        &self.embeddings
    }

    fn prepare(&self, position: usize, embedding: &[f32]) -> Vec<f32> {
        self.positions.add_to(position, embedding)
    }

    fn finalize(&self, hidden: Vec<f32>) -> Vec<f32> {
        self.final_norm.forward(&hidden)
    }
}

/// Pre-norm GPT-2 decoder:
///
/// ```text
/// h   = x + Attn(LN1(x))
/// out = h + FFN(LN2(h))
/// ```
#[derive(Debug)]
pub struct Gpt2Decoder {
    attention_norm: LayerNorm,
    attention: FusedAttention,
    feed_forward_norm: LayerNorm,
    feed_forward: FeedForward,
    last: bool,
}

impl Gpt2Decoder {
    pub(super) fn load(store: &mut ParameterStore, settings: DecoderSettings) -> Result<Self> {
        let config = settings.config;

        Ok(Self {
            attention_norm: LayerNorm::load(store, "ln_1", config.hidden_size, config.epsilon)?,
            attention: FusedAttention::load(store, settings)?,
            feed_forward_norm: LayerNorm::load(store, "ln_2", config.hidden_size, config.epsilon)?,
            feed_forward: load_conv_feed_forward(store, config)?,
            last: settings.last,
        })
    }
}

impl Decoder for Gpt2Decoder {
    fn execute(&mut self, hidden: &[f32], is_output_step: bool) -> Vec<f32> {
        let attention = self.attention.forward(&self.attention_norm.forward(hidden));
        let hidden = tensor::add(hidden, &attention);

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
