use anyhow::Result;

use super::{Decoder, DecoderSettings, Embeddings, Transformer};
use crate::attention::{Attention, PositionEncoding, RotaryEmbedding, RotaryStyle};
use crate::configuration::ModelConfig;
use crate::layers::{GatedFeedForward, Linear, RmsNorm, WeightLayout};
use crate::parameter_store::ParameterStore;
use crate::tensor;

/// Meta LLaMA model boundary: final RMSNorm and an optional untied output head.
pub struct LlamaTransformer {
    embeddings: Embeddings,
    final_norm: RmsNorm,
}

impl LlamaTransformer {
    pub(super) fn load(store: &mut ParameterStore, config: &ModelConfig) -> Result<Self> {
        let head = Linear::load_optional(store, "lm_head", config.hidden_size, config.vocab_size, WeightLayout::Transposed)?;

        Ok(Self {
            embeddings: Embeddings::load(store, "model.embed_tokens.weight", config)?.with_head(head),
            final_norm: RmsNorm::load(store, "model.norm", config.hidden_size, config.epsilon)?,
        })
    }
}

impl Transformer for LlamaTransformer {
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

/// LLaMA decoder: RMSNorm, rotary embeddings over half-split pairs, grouped-query
/// attention and a SwiGLU feed-forward block.
///
/// Key/value projections are `[kv_heads * head_size, hidden]`; query head `h` reads
/// key/value group `h % kv_heads`.
#[derive(Debug)]
pub struct LlamaDecoder {
    attention_norm: RmsNorm,
    query: Linear,
    key: Linear,
    value: Linear,
    projection: Linear,
    attention: Attention,
    feed_forward_norm: RmsNorm,
    feed_forward: GatedFeedForward,
    last: bool,
}

impl LlamaDecoder {
    pub(super) fn load(store: &mut ParameterStore, settings: DecoderSettings) -> Result<Self> {
        let config = settings.config;
        let (hidden_size, feed_forward_size) = (config.hidden_size, config.feed_forward_size);
        let query_size = config.head_count * config.head_size;
        let kv_size = config.kv_head_count * config.head_size;
        let transposed = WeightLayout::Transposed;

        let rotary = match store.vector_optional("self_attn.rotary_emb.inv_freq", config.rotary_dim / 2)? {
            Some(inv_freq) if !store.is_calculation_only() => {
                RotaryEmbedding::with_frequencies(RotaryStyle::HalfSplit, config.rotary_dim, inv_freq)
            }
            _ => RotaryEmbedding::new(RotaryStyle::HalfSplit, config.rotary_dim, config.rope_theta),
        };

        let attention =
            Attention::new(config.head_count, config.kv_head_count, config.head_size, settings.context_size)
                .with_positions(PositionEncoding::Rotary(rotary));

        Ok(Self {
            attention_norm: RmsNorm::load(store, "input_layernorm", hidden_size, config.epsilon)?,
            query: Linear::load_without_bias(store, "self_attn.q_proj", hidden_size, query_size, transposed)?,
            key: Linear::load_without_bias(store, "self_attn.k_proj", hidden_size, kv_size, transposed)?,
            value: Linear::load_without_bias(store, "self_attn.v_proj", hidden_size, kv_size, transposed)?,
            projection: Linear::load_without_bias(store, "self_attn.o_proj", query_size, hidden_size, transposed)?,
            attention,
            feed_forward_norm: RmsNorm::load(store, "post_attention_layernorm", hidden_size, config.epsilon)?,
            feed_forward: GatedFeedForward::new(
                Linear::load_without_bias(store, "mlp.gate_proj", hidden_size, feed_forward_size, transposed)?,
                Linear::load_without_bias(store, "mlp.up_proj", hidden_size, feed_forward_size, transposed)?,
                Linear::load_without_bias(store, "mlp.down_proj", feed_forward_size, hidden_size, transposed)?,
            ),
            last: settings.last,
        })
    }

    fn attend(&mut self, input: &[f32]) -> Vec<f32> {
        let output = self.attention.attend(self.query.forward(input), self.key.forward(input), self.value.forward(input));
        self.projection.forward(&output)
    }
}

impl Decoder for LlamaDecoder {
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
