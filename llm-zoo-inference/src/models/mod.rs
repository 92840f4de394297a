use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info};

use crate::configuration::{ModelConfig, TransformerType};
use crate::layers::Linear;
use crate::parameter_reader::ParameterIndex;
use crate::parameter_store::{ParameterStore, Scope};
use crate::tensor::{self, Matrix};

mod bloom;
mod gpt1;
mod gpt2;
mod gpt_j;
mod gpt_neo;
mod llama;
mod original;

/// One decoder layer of the stack.
pub trait Decoder {
    /// Runs the layer on the hidden state of the next position, appending to its cache.
    ///
    /// When `is_output_step` is false the last decoder skips its feed-forward block.
    fn execute(&mut self, hidden: &[f32], is_output_step: bool) -> Vec<f32>;

    /// Drops every cached position.
    fn clear(&mut self);

    fn cached_positions(&self) -> usize;
}

/// The model boundary: embeddings in, final normalization and output head out.
pub trait Transformer {
    fn embeddings(&self) -> &Embeddings;

    /// Turns a token embedding at `position` into the input of the first decoder.
    fn prepare(&self, position: usize, embedding: &[f32]) -> Vec<f32>;

    /// Applies the final normalization of an output step.
    fn finalize(&self, hidden: Vec<f32>) -> Vec<f32>;
}

#[non_exhaustive]
pub enum Decoders {
    PostNorm(original::PostNormDecoder),
    Gpt2(gpt2::Gpt2Decoder),
    GptNeo(gpt_neo::GptNeoDecoder),
    GptJ(gpt_j::GptJDecoder),
    Bloom(bloom::BloomDecoder),
    Llama(llama::LlamaDecoder),
}

impl Decoder for Decoders {
    fn execute(&mut self, hidden: &[f32], is_output_step: bool) -> Vec<f32> {
        match self {
            Decoders::PostNorm(decoder) => decoder.execute(hidden, is_output_step),
            Decoders::Gpt2(decoder) => decoder.execute(hidden, is_output_step),
            Decoders::GptNeo(decoder) => decoder.execute(hidden, is_output_step),
            Decoders::GptJ(decoder) => decoder.execute(hidden, is_output_step),
            Decoders::Bloom(decoder) => decoder.execute(hidden, is_output_step),
            Decoders::Llama(decoder) => decoder.execute(hidden, is_output_step),
        }
    }

    fn clear(&mut self) {
        match self {
            Decoders::PostNorm(decoder) => decoder.clear(),
            Decoders::Gpt2(decoder) => decoder.clear(),
            Decoders::GptNeo(decoder) => decoder.clear(),
            Decoders::GptJ(decoder) => decoder.clear(),
            Decoders::Bloom(decoder) => decoder.clear(),
            Decoders::Llama(decoder) => decoder.clear(),
        }
    }

    fn cached_positions(&self) -> usize {
        match self {
            Decoders::PostNorm(decoder) => decoder.cached_positions(),
            Decoders::Gpt2(decoder) => decoder.cached_positions(),
            Decoders::GptNeo(decoder) => decoder.cached_positions(),
            Decoders::GptJ(decoder) => decoder.cached_positions(),
            Decoders::Bloom(decoder) => decoder.cached_positions(),
            Decoders::Llama(decoder) => decoder.cached_positions(),
        }
    }
}

impl std::fmt::Debug for Decoders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decoders::PostNorm(decoder) => std::fmt::Debug::fmt(decoder, f),
            Decoders::Gpt2(decoder) => std::fmt::Debug::fmt(decoder, f),
            Decoders::GptNeo(decoder) => std::fmt::Debug::fmt(decoder, f),
            Decoders::GptJ(decoder) => std::fmt::Debug::fmt(decoder, f),
            Decoders::Bloom(decoder) => std::fmt::Debug::fmt(decoder, f),
            Decoders::Llama(decoder) => std::fmt::Debug::fmt(decoder, f),
        }
    }
}

#[non_exhaustive]
pub enum Transformers {
    Original(original::OriginalTransformer),
    Gpt1(gpt1::Gpt1Transformer),
    /// GPT-2 and GPT-Neo share the learned-position boundary.
    Gpt2(gpt2::Gpt2Transformer),
    GptJ(gpt_j::GptJTransformer),
    Bloom(bloom::BloomTransformer),
    Llama(llama::LlamaTransformer),
}

impl Transformer for Transformers {
    fn embeddings(&self) -> &Embeddings {
        match self {
            Transformers::Original(model) => model.embeddings(),
            Transformers::Gpt1(model) => model.embeddings(),
            Transformers::Gpt2(model) => model.embeddings(),
            Transformers::GptJ(model) => model.embeddings(),
            Transformers::Bloom(model) => model.embeddings(),
            Transformers::Llama(model) => model.embeddings(),
        }
    }

    fn prepare(&self, position: usize, embedding: &[f32]) -> Vec<f32> {
        match self {
            Transformers::Original(model) => model.prepare(position, embedding),
            Transformers::Gpt1(model) => model.prepare(position, embedding),
            Transformers::Gpt2(model) => model.prepare(position, embedding),
            Transformers::GptJ(model) => model.prepare(position, embedding),
            Transformers::Bloom(model) => model.prepare(position, embedding),
            Transformers::Llama(model) => model.prepare(position, embedding),
        }
    }

    fn finalize(&self, hidden: Vec<f32>) -> Vec<f32> {
        match self {
            Transformers::Original(model) => model.finalize(hidden),
            Transformers::Gpt1(model) => model.finalize(hidden),
            Transformers::Gpt2(model) => model.finalize(hidden),
            Transformers::GptJ(model) => model.finalize(hidden),
            Transformers::Bloom(model) => model.finalize(hidden),
            Transformers::Llama(model) => model.finalize(hidden),
        }
    }
}

/// Token embedding table and the output head scoring hidden states against the vocabulary.
pub struct Embeddings {
    pub tokens: Matrix,
    /// Untied output head; the token table is reused when absent.
    pub head: Option<Linear>,
}

impl Embeddings {
    pub fn load(store: &mut ParameterStore, name: &str, config: &ModelConfig) -> Result<Self> {
        Ok(Self { tokens: store.matrix(name, config.vocab_size, config.hidden_size)?, head: None })
    }

    pub fn with_head(mut self, head: Option<Linear>) -> Self {
        self.head = head;
        self
    }

    pub fn token(&self, token: usize) -> Vec<f32> {
        assert!(token < self.tokens.rows(), "Token {token} is outside the vocabulary of {} tokens", self.tokens.rows());
        self.tokens.row(token).to_vec()
    }

    pub fn logits(&self, hidden: &[f32]) -> Vec<f32> {
        match &self.head {
            Some(head) => head.forward(hidden),
            None => tensor::mul_vector_by_transposed_matrix(hidden, &self.tokens),
        }
    }
}

impl std::fmt::Debug for Embeddings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embeddings").field("tokens", &self.tokens).field("head", &self.head).finish()
    }
}

/// Construction parameters of one decoder.
#[derive(Debug, Clone, Copy)]
pub struct DecoderSettings<'a> {
    pub config: &'a ModelConfig,
    /// Capacity of the key/value cache.
    pub context_size: Option<usize>,
    pub decoder_id: usize,
    pub last: bool,
}

/// The full decoder stack of a loaded model.
pub struct DecoderStack {
    config: Arc<ModelConfig>,
    transformer: Transformers,
    decoders: Vec<Decoders>,
    context_size: Option<usize>,
    parameter_count: usize,
    calculation_only: bool,
}

impl DecoderStack {
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Effective context: the configured one, narrowed by the builder override.
    pub fn context_size(&self) -> Option<usize> {
        self.context_size
    }

    pub fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    pub fn is_calculation_only(&self) -> bool {
        self.calculation_only
    }

    /// Positions cached by the stack (every decoder caches the same number).
    pub fn cached_positions(&self) -> usize {
        self.decoders.first().map_or(0, |decoder| decoder.cached_positions())
    }

    pub fn embedding(&self, token: usize) -> Vec<f32> {
        self.assert_loaded();
        self.transformer.embeddings().token(token)
    }

    /// Runs every decoder on `embedding` at `position`.
    ///
    /// The final normalization is applied only on output steps; the returned hidden state
    /// of a non-output step is not meant for scoring.
    pub fn execute(&mut self, position: usize, embedding: &[f32], is_output_step: bool) -> Vec<f32> {
        self.assert_loaded();

        let mut hidden = self.transformer.prepare(position, embedding);
        for decoder in &mut self.decoders {
            hidden = decoder.execute(&hidden, is_output_step);
        }

        if is_output_step { self.transformer.finalize(hidden) } else { hidden }
    }

    pub fn execute_token(&mut self, position: usize, token: usize, is_output_step: bool) -> Vec<f32> {
        let embedding = self.embedding(token);
        self.execute(position, &embedding, is_output_step)
    }

    /// Scores a final hidden state against every vocabulary entry.
    pub fn logits(&self, hidden: &[f32]) -> Vec<f32> {
        self.assert_loaded();
        self.transformer.embeddings().logits(hidden)
    }

    /// Resets every key/value cache.
    pub fn clear(&mut self) {
        self.decoders.iter_mut().for_each(|decoder| decoder.clear());
    }

    fn assert_loaded(&self) {
        assert!(!self.calculation_only, "Cannot execute a calculation-only decoder stack");
    }
}

impl std::fmt::Debug for DecoderStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        struct BlocksSummary<'a, T>(&'a [T]);

        impl<'a, T: std::fmt::Debug> std::fmt::Debug for BlocksSummary<'a, T> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_list()
                    .entries(self.0.iter().take(1))
                    .entry(&format_args!("... and {} more", self.0.len().saturating_sub(1)))
                    .finish()
            }
        }

        f.debug_struct("DecoderStack")
            .field("name", &self.config.name)
            .field("transformer_type", &self.config.transformer_type)
            .field("embeddings", self.transformer.embeddings())
            .field("decoders", &BlocksSummary(&self.decoders))
            .field("context_size", &self.context_size)
            .field("parameter_count", &self.parameter_count)
            .field("calculation_only", &self.calculation_only)
            .finish()
    }
}

/// Builder pattern for creating decoder stacks
pub struct TransformerBuilder {
    config: Arc<ModelConfig>,
    model_path: Option<PathBuf>,
    index: Option<Arc<ParameterIndex>>,
    calculation_only: bool,
    context_size: Option<usize>,
}

impl TransformerBuilder {
    pub fn new(config: Arc<ModelConfig>) -> Self {
        Self { config, model_path: None, index: None, calculation_only: false, context_size: None }
    }

    /// Directory holding the `.safetensors` files.
    pub fn with_model_path(mut self, path: &Path) -> Self {
        self.model_path = Some(path.to_path_buf());
        self
    }

    /// Shares an index already built for another stack.
    pub fn with_parameter_index(mut self, index: Arc<ParameterIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Counts parameters without reading any tensor data.
    pub fn calculation_only(mut self, calculation_only: bool) -> Self {
        self.calculation_only = calculation_only;
        self
    }

    /// Narrows the context (never widens a bounded one).
    pub fn with_context_size(mut self, context_size: Option<usize>) -> Self {
        self.context_size = context_size;
        self
    }

    pub fn build(self) -> Result<DecoderStack> {
        let config = self.config;

        let index = match (self.index, &self.model_path) {
            (Some(index), _) => Some(index),
            // headers only tell which optional tensors exist, a missing directory is fine here
            (None, Some(path)) if self.calculation_only && !path.is_dir() => None,
            (None, Some(path)) => Some(Arc::new(ParameterIndex::load(path)?)),
            (None, None) if self.calculation_only => None,
            (None, None) => anyhow::bail!("A model path is required to load {}", config.name),
        };

        let context_size = match (config.context_size, self.context_size) {
            (Some(configured), Some(requested)) => Some(configured.min(requested)),
            (configured, requested) => configured.or(requested),
        };

        let mut store = match &index {
            Some(index) if !self.calculation_only => ParameterStore::new(index, &config.naming, Scope::Model),
            index => ParameterStore::calculation_only(index.as_deref(), &config.naming, Scope::Model),
        };

        let transformer = load_transformer(&mut store, &config)
            .with_context(|| format!("Failed to load the {} model boundary", config.transformer_type))?;
        let mut parameter_count = store.parameter_count();

        let mut decoders = Vec::with_capacity(config.decoder_count);
        for decoder_id in 0..config.decoder_count {
            let mut decoder_store = store.with_scope(Scope::Decoder(decoder_id));
            let settings = DecoderSettings {
                config: &config,
                context_size,
                decoder_id,
                last: decoder_id + 1 == config.decoder_count,
            };

            decoders.push(load_decoder(&mut decoder_store, settings)?);
            debug!("Decoder {decoder_id}: {} parameters", decoder_store.parameter_count());
            parameter_count += decoder_store.parameter_count();
        }

        info!(
            "{} {}: {} decoders, {parameter_count} parameters",
            if self.calculation_only { "Calculated" } else { "Loaded" },
            config.name,
            decoders.len()
        );

        Ok(DecoderStack {
            config,
            transformer,
            decoders,
            context_size,
            parameter_count,
            calculation_only: self.calculation_only,
        })
    }
}

fn load_transformer(store: &mut ParameterStore, config: &ModelConfig) -> Result<Transformers> {
    Ok(match config.transformer_type {
        TransformerType::OriginalTransformer => {
            Transformers::Original(original::OriginalTransformer::load(store, config)?)
        }
        TransformerType::OpenAiGpt1 => Transformers::Gpt1(gpt1::Gpt1Transformer::load(store, config)?),
        TransformerType::OpenAiGpt2 => Transformers::Gpt2(gpt2::Gpt2Transformer::load(store, config, "")?),
        TransformerType::EleutherAiGptNeo => {
            Transformers::Gpt2(gpt2::Gpt2Transformer::load(store, config, gpt_neo::MODEL_PREFIX)?)
        }
        TransformerType::EleutherAiGptJ => Transformers::GptJ(gpt_j::GptJTransformer::load(store, config)?),
        TransformerType::BigScienceBloom => Transformers::Bloom(bloom::BloomTransformer::load(store, config)?),
        TransformerType::MetaLlama => Transformers::Llama(llama::LlamaTransformer::load(store, config)?),
    })
}

fn load_decoder(store: &mut ParameterStore, settings: DecoderSettings) -> Result<Decoders> {
    Ok(match settings.config.transformer_type {
        TransformerType::OriginalTransformer | TransformerType::OpenAiGpt1 => {
            Decoders::PostNorm(original::PostNormDecoder::load(store, settings)?)
        }
        TransformerType::OpenAiGpt2 => Decoders::Gpt2(gpt2::Gpt2Decoder::load(store, settings)?),
        TransformerType::EleutherAiGptNeo => Decoders::GptNeo(gpt_neo::GptNeoDecoder::load(store, settings)?),
        TransformerType::EleutherAiGptJ => Decoders::GptJ(gpt_j::GptJDecoder::load(store, settings)?),
        TransformerType::BigScienceBloom => Decoders::Bloom(bloom::BloomDecoder::load(store, settings)?),
        TransformerType::MetaLlama => Decoders::Llama(llama::LlamaDecoder::load(store, settings)?),
    })
}
