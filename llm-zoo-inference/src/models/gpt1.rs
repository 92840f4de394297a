use anyhow::Result;

use super::original::TOKEN_EMBEDDINGS;
use super::{Embeddings, Transformer};
use crate::configuration::ModelConfig;
use crate::layers::LearnedPositions;
use crate::parameter_store::ParameterStore;

/// OpenAI GPT-1 model boundary: learned positions, post-norm decoders, no final norm.
pub struct Gpt1Transformer {
    embeddings: Embeddings,
    positions: LearnedPositions,
}

impl Gpt1Transformer {
    pub(super) fn load(store: &mut ParameterStore, config: &ModelConfig) -> Result<Self> {
        Ok(Self {
            embeddings: Embeddings::load(store, TOKEN_EMBEDDINGS, config)?,
            positions: LearnedPositions::load(
                store,
                "positions_embed.weight",
                config.context_size.unwrap_or_default(),
                config.hidden_size,
            )?,
        })
    }
}

impl Transformer for Gpt1Transformer {
    fn embeddings(&self) -> &Embeddings {
        &self.embeddings
    }

    fn prepare(&self, position: usize, embedding: &[f32]) -> Vec<f32> {
        self.positions.add_to(position, embedding)
    }

    fn finalize(&self, hidden: Vec<f32>) -> Vec<f32> {
        hidden
    }
}
