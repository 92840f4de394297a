use anyhow::Result;

use super::{Decoder, DecoderSettings, Embeddings, Transformer};
use crate::attention::{Attention, PositionEncoding, alibi_slopes};
use crate::configuration::ModelConfig;
use crate::layers::{FeedForward, LayerNorm, Linear, WeightLayout};
use crate::parameter_store::ParameterStore;
use crate::tensor;

/// BigScience BLOOM model boundary: a LayerNorm on every input embedding and a final
/// LayerNorm; positions enter through ALiBi inside attention.
pub struct BloomTransformer {
    embeddings: Embeddings,
    input_norm: LayerNorm,
    final_norm: LayerNorm,
}

impl BloomTransformer {
    pub(super) fn load(store: &mut ParameterStore, config: &ModelConfig) -> Result<Self> {
        Ok(Self {
            embeddings: Embeddings::load(store, "word_embeddings.weight", config)?,
            input_norm: LayerNorm::load(store, "word_embeddings_layernorm", config.hidden_size, config.epsilon)?,
            final_norm: LayerNorm::load(store, "ln_f", config.hidden_size, config.epsilon)?,
        })
    }
}

impl Transformer for BloomTransformer {
    fn embeddings(&self) -> &Embeddings {
        &self.embeddings
    }

    fn prepare(&self, _position: usize, embedding: &[f32]) -> Vec<f32> {
        self.input_norm.forward(embedding)
    }

    fn finalize(&self, hidden: Vec<f32>) -> Vec<f32> {
        self.final_norm.forward(&hidden)
    }
}

/// Pre-norm BLOOM decoder. The fused query/key/value projection is laid out head-major:
/// each head owns a contiguous `[query, key, value]` block.
#[derive(Debug)]
pub struct BloomDecoder {
    attention_norm: LayerNorm,
    qkv: Linear,
    projection: Linear,
    attention: Attention,
    feed_forward_norm: LayerNorm,
    feed_forward: FeedForward,
    last: bool,
}

impl BloomDecoder {
    pub(super) fn load(store: &mut ParameterStore, settings: DecoderSettings) -> Result<Self> {
        let config = settings.config;
        let (hidden_size, feed_forward_size) = (config.hidden_size, config.feed_forward_size);
        let transposed = WeightLayout::Transposed;

        let attention = Attention::new(config.head_count, config.head_count, config.head_size, settings.context_size)
            .with_positions(PositionEncoding::Alibi(alibi_slopes(config.head_count)));

        Ok(Self {
            attention_norm: LayerNorm::load(store, "input_layernorm", hidden_size, config.epsilon)?,
            qkv: Linear::load(store, "self_attention.query_key_value", hidden_size, hidden_size * 3, transposed)?,
            projection: Linear::load(store, "self_attention.dense", hidden_size, hidden_size, transposed)?,
            attention,
            feed_forward_norm: LayerNorm::load(store, "post_attention_layernorm", hidden_size, config.epsilon)?,
            feed_forward: FeedForward::new(
                Linear::load(store, "mlp.dense_h_to_4h", hidden_size, feed_forward_size, transposed)?,
                Linear::load(store, "mlp.dense_4h_to_h", feed_forward_size, hidden_size, transposed)?,
            ),
            last: settings.last,
        })
    }

    fn attend(&mut self, input: &[f32]) -> Vec<f32> {
        let qkv = self.qkv.forward(input);

        let head_count = self.attention.head_count;
        let capacity = head_count * self.attention.head_size;
        let (mut query, mut key, mut value) =
            (Vec::with_capacity(capacity), Vec::with_capacity(capacity), Vec::with_capacity(capacity));

        for head in tensor::split(&qkv, head_count) {
            let parts = tensor::split(head, 3);
            query.extend_from_slice(parts[0]);
            key.extend_from_slice(parts[1]);
            value.extend_from_slice(parts[2]);
        }

        let output = self.attention.attend(query, key, value);
        self.projection.forward(&output)
    }
}

impl Decoder for BloomDecoder {
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
