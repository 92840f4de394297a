//! Inference engine for decoder-only transformer models.
//!
//! Supports the original decoder-only transformer, OpenAI GPT-1 and GPT-2, EleutherAI
//! GPT-Neo and GPT-J, BigScience BLOOM and Meta LLaMA (multi-head and grouped-query
//! attention) checkpoints stored as `.safetensors` files.

mod attention;
mod configuration;
mod data_type;
mod error;
mod generation;
mod layers;
mod models;
mod parameter_reader;
mod parameter_store;
mod sampler;
mod tensor;
mod utils;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use log::debug;

pub use crate::configuration::{CONFIG_FILE, MODEL_FILE, ModelConfig, TransformerType};
pub use crate::data_type::DataType;
pub use crate::error::{ConfigurationError, GenerationError, ParameterFileError};
pub use crate::generation::{GenerationEvent, GenerationSession, Generator};
pub use crate::models::{DecoderStack, TransformerBuilder};
pub use crate::parameter_reader::{ParameterIndex, TensorDescriptor};
pub use crate::parameter_store::ParameterNaming;
pub use crate::sampler::Sampler;

const DEFAULT_LENGTH_LIMIT: usize = 25;
const DEFAULT_TOP_K: usize = 40;
/// Fixed overhead added to the weight memory by [`estimate_memory_mb`].
const BASE_MEMORY_MB: usize = 2048;

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub model_path: PathBuf,
    pub config_path: PathBuf,
    pub length_limit: usize,
    pub top_k: usize,
    pub calculation_only: bool,
    pub context_size: Option<usize>,
    pub seed: u64,
}

impl InferenceConfig {
    pub fn builder() -> InferenceConfigBuilder {
        InferenceConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct InferenceConfigBuilder {
    model_path: Option<PathBuf>,
    config_path: Option<PathBuf>,
    length_limit: Option<usize>,
    top_k: Option<usize>,
    calculation_only: Option<bool>,
    context_size: Option<usize>,
    seed: Option<u64>,
}

impl InferenceConfigBuilder {
    pub fn model_path(mut self, path: Option<&Path>) -> Self {
        self.model_path = path.map(Path::to_path_buf);
        self
    }
    pub fn config_path(mut self, path: Option<&Path>) -> Self {
        self.config_path = path.map(Path::to_path_buf);
        self
    }
    pub fn length_limit(mut self, length_limit: Option<usize>) -> Self {
        self.length_limit = length_limit;
        self
    }
    pub fn top_k(mut self, top_k: Option<usize>) -> Self {
        self.top_k = top_k;
        self
    }
    pub fn calculation_only(mut self, calculation_only: Option<bool>) -> Self {
        self.calculation_only = calculation_only;
        self
    }
    pub fn context_size(mut self, context_size: Option<usize>) -> Self {
        self.context_size = context_size;
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
    pub fn build(self) -> Result<InferenceConfig, ConfigurationError> {
        let model_path = self.model_path.ok_or(ConfigurationError::MissingValue("model path"))?;

        let top_k = self.top_k.unwrap_or(DEFAULT_TOP_K);
        if top_k == 0 {
            return Err(ConfigurationError::InvalidValue { name: "top-K", message: "must be positive".to_string() });
        }

        let length_limit = self.length_limit.unwrap_or(DEFAULT_LENGTH_LIMIT);
        if length_limit == 0 {
            return Err(ConfigurationError::InvalidValue {
                name: "length limit",
                message: "must be positive".to_string(),
            });
        }

        Ok(InferenceConfig {
            config_path: self.config_path.unwrap_or_else(|| model_path.clone()),
            model_path,
            length_limit,
            top_k,
            calculation_only: self.calculation_only.unwrap_or(false),
            context_size: self.context_size,
            seed: self.seed.unwrap_or_else(|| {
                SystemTime::now().duration_since(UNIX_EPOCH).map(|duration| duration.as_secs()).unwrap_or(1)
            }),
        })
    }
}

/// Loads the configuration and builds the decoder stack it describes.
pub fn load_model(inference_config: &InferenceConfig) -> Result<DecoderStack> {
    debug!("{inference_config:#?}");

    let config = ModelConfig::load(&inference_config.config_path, &inference_config.model_path)?;

    let stack = TransformerBuilder::new(Arc::new(config))
        .with_model_path(&inference_config.model_path)
        .calculation_only(inference_config.calculation_only)
        .with_context_size(inference_config.context_size)
        .build()?;

    debug!("{stack:#?}");

    Ok(stack)
}

/// Loads the model and wraps it into a generator using the configured sampling settings.
pub fn create_generator(inference_config: &InferenceConfig) -> Result<Generator> {
    let stack = load_model(inference_config)?;
    let sampler = Sampler::new(inference_config.top_k, inference_config.seed);

    Ok(Generator::new(stack, sampler, inference_config.length_limit))
}

/// Rough memory requirement in megabytes: four bytes per parameter plus a fixed overhead.
pub fn estimate_memory_mb(parameter_count: usize) -> usize {
    (parameter_count as f64 / 1_000_000.0 * 4.0).round() as usize + BASE_MEMORY_MB
}
