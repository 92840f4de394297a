//! The decoder-only variant of the original transformer, and the building blocks it
//! shares with the OpenAI models (fused Conv1D attention, GELU feed-forward).

use anyhow::Result;

use super::{Decoder, DecoderSettings, Embeddings, Transformer};
use crate::attention::Attention;
use crate::configuration::ModelConfig;
use crate::layers::{FeedForward, LayerNorm, Linear, WeightLayout, sinusoidal_position};
use crate::parameter_store::ParameterStore;
use crate::tensor;

/// Token table shared by the original transformer and GPT-1.
pub(super) const TOKEN_EMBEDDINGS: &str = "tokens_embed.weight";

/// Adds fixed sinusoidal positions to the token embeddings; no final normalization.
pub struct OriginalTransformer {
    embeddings: Embeddings,
}

impl OriginalTransformer {
    pub(super) fn load(store: &mut ParameterStore, config: &ModelConfig) -> Result<Self> {
        Ok(Self { embeddings: Embeddings::load(store, TOKEN_EMBEDDINGS, config)? })
    }
}

impl Transformer for OriginalTransformer {
    fn embeddings(&self) -> &Embeddings {
        &self.embeddings
    }

    fn prepare(&self, position: usize, embedding: &[f32]) -> Vec<f32> {
        tensor::add(embedding, &sinusoidal_position(position, embedding.len()))
    }

    fn finalize(&self, hidden: Vec<f32>) -> Vec<f32> {
        hidden
    }
}

/// Self-attention with a fused query/key/value Conv1D projection (`[hidden, 3 * hidden]`).
#[derive(Debug)]
pub(super) struct FusedAttention {
    qkv: Linear,
    projection: Linear,
    attention: Attention,
}

impl FusedAttention {
    pub(super) fn load(store: &mut ParameterStore, settings: DecoderSettings) -> Result<Self> {
        let config = settings.config;
        let hidden_size = config.hidden_size;

        Ok(Self {
            qkv: Linear::load(store, "attn.c_attn", hidden_size, hidden_size * 3, WeightLayout::Straight)?,
            projection: Linear::load(store, "attn.c_proj", hidden_size, hidden_size, WeightLayout::Straight)?,
            attention: Attention::new(config.head_count, config.head_count, config.head_size, settings.context_size),
        })
    }

    pub(super) fn forward(&mut self, input: &[f32]) -> Vec<f32> {
        let qkv = self.qkv.forward(input);
        let parts = tensor::split(&qkv, 3);

        let output = self.attention.attend(parts[0].to_vec(), parts[1].to_vec(), parts[2].to_vec());
        self.projection.forward(&output)
    }

    pub(super) fn clear(&mut self) {
        self.attention.clear();
    }

    pub(super) fn cached_positions(&self) -> usize {
        self.attention.cached_positions()
    }
}

/// `mlp.c_fc` / `mlp.c_proj` Conv1D pair with GELU.
pub(super) fn load_conv_feed_forward(store: &mut ParameterStore, config: &ModelConfig) -> Result<FeedForward> {
    let (hidden_size, feed_forward_size) = (config.hidden_size, config.feed_forward_size);

    Ok(FeedForward::new(
        Linear::load(store, "mlp.c_fc", hidden_size, feed_forward_size, WeightLayout::Straight)?,
        Linear::load(store, "mlp.c_proj", feed_forward_size, hidden_size, WeightLayout::Straight)?,
    ))
}

/// Post-norm decoder of the original transformer and GPT-1:
///
/// ```text
/// h   = LN1(x + Attn(x))
/// out = LN2(h + FFN(h))
/// ```
#[derive(Debug)]
pub struct PostNormDecoder {
    attention: FusedAttention,
    attention_norm: LayerNorm,
    feed_forward: FeedForward,
    feed_forward_norm: LayerNorm,
    last: bool,
}

impl PostNormDecoder {
    pub(super) fn load(store: &mut ParameterStore, settings: DecoderSettings) -> Result<Self> {
        let config = settings.config;

        Ok(Self {
            attention: FusedAttention::load(store, settings)?,
            attention_norm: LayerNorm::load(store, "ln_1", config.hidden_size, config.epsilon)?,
            feed_forward: load_conv_feed_forward(store, config)?,
            feed_forward_norm: LayerNorm::load(store, "ln_2", config.hidden_size, config.epsilon)?,
            last: settings.last,
        })
    }
}

impl Decoder for PostNormDecoder {
    fn execute(&mut self, hidden: &[f32], is_output_step: bool) -> Vec<f32> {
        let attention = self.attention.forward(hidden);
        let hidden = self.attention_norm.forward(&tensor::add(hidden, &attention));

        if self.last && !is_output_step {
            return hidden;
        }

        let feed_forward = self.feed_forward.forward(&hidden);
        self.feed_forward_norm.forward(&tensor::add(&hidden, &feed_forward))
    }

    fn clear(&mut self) {
        self.attention.clear();
    }

    fn cached_positions(&self) -> usize {
        self.attention.cached_positions()
    }
}
