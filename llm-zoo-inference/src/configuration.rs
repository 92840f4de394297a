#[cfg(test)]
#[path = "../tests/unit/configuration_test.rs"]
mod configuration_test;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use log::{info, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ConfigurationError;
use crate::parameter_store::{NAME_PLACEHOLDER, ParameterNaming};

/// File holding the architecture hyperparameters.
pub const CONFIG_FILE: &str = "config.json";
/// File holding the model-level settings (transformer type, naming).
pub const MODEL_FILE: &str = "model.json";

const DEFAULT_EPSILON: f32 = 1e-5;
const DEFAULT_ROPE_THETA: f32 = 10000.0;
const DEFAULT_WINDOW_SIZE: usize = 256;
const DEFAULT_FEED_FORWARD_FACTOR: usize = 4;

/// Supported decoder-only architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformerType {
    OriginalTransformer,
    OpenAiGpt1,
    OpenAiGpt2,
    EleutherAiGptNeo,
    EleutherAiGptJ,
    BigScienceBloom,
    MetaLlama,
}

impl TransformerType {
    pub const ALL: [TransformerType; 7] = [
        Self::OriginalTransformer,
        Self::OpenAiGpt1,
        Self::OpenAiGpt2,
        Self::EleutherAiGptNeo,
        Self::EleutherAiGptJ,
        Self::BigScienceBloom,
        Self::MetaLlama,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::OriginalTransformer => "ORIGINAL_TRANSFORMER",
            Self::OpenAiGpt1 => "OPENAI_GPT_1",
            Self::OpenAiGpt2 => "OPENAI_GPT_2",
            Self::EleutherAiGptNeo => "ELEUTHERAI_GPT_NEO",
            Self::EleutherAiGptJ => "ELEUTHERAI_GPT_J",
            Self::BigScienceBloom => "BIG_SCIENCE_BLOOM",
            Self::MetaLlama => "META_LLAMA",
        }
    }

    /// Maps the `model_type` field of a Hugging Face `config.json`.
    pub fn from_model_type(model_type: &str) -> Option<Self> {
        match model_type {
            "openai-gpt" => Some(Self::OpenAiGpt1),
            "gpt2" => Some(Self::OpenAiGpt2),
            "gpt_neo" => Some(Self::EleutherAiGptNeo),
            "gptj" => Some(Self::EleutherAiGptJ),
            "bloom" => Some(Self::BigScienceBloom),
            "llama" => Some(Self::MetaLlama),
            _ => None,
        }
    }

    /// Template turning a logical decoder tensor name into a file tensor id.
    pub const fn default_decoder_naming(self) -> &'static str {
        match self {
            Self::OriginalTransformer | Self::OpenAiGpt1 | Self::OpenAiGpt2 | Self::BigScienceBloom => {
                "h.{decoderId}.{name}"
            }
            Self::EleutherAiGptNeo | Self::EleutherAiGptJ => "transformer.h.{decoderId}.{name}",
            Self::MetaLlama => "model.layers.{decoderId}.{name}",
        }
    }

    /// Architectures with a learned position table need a bounded context.
    pub const fn has_learned_positions(self) -> bool {
        matches!(self, Self::OpenAiGpt1 | Self::OpenAiGpt2 | Self::EleutherAiGptNeo)
    }

    pub const fn has_rotary_positions(self) -> bool {
        matches!(self, Self::EleutherAiGptJ | Self::MetaLlama)
    }
}

impl TryFrom<&str> for TransformerType {
    type Error = ConfigurationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| ConfigurationError::UnknownTransformerType(value.to_string()))
    }
}

impl fmt::Display for TransformerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable architecture hyperparameters of a loaded model.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub name: String,
    pub transformer_type: TransformerType,
    pub hidden_size: usize,
    pub feed_forward_size: usize,
    pub decoder_count: usize,
    pub head_count: usize,
    pub kv_head_count: usize,
    pub head_size: usize,
    pub epsilon: f32,
    /// Maximum number of positions, `None` when the model does not limit it.
    pub context_size: Option<usize>,
    pub vocab_size: usize,
    pub end_of_text_token: usize,
    /// Number of leading dimensions of every head rotated by rotary position embeddings.
    pub rotary_dim: usize,
    pub rope_theta: f32,
    /// Number of most recent positions attended by local attention layers.
    pub window_size: usize,
    pub naming: ParameterNaming,
}

impl ModelConfig {
    /// Loads `model.json` and `config.json`.
    ///
    /// `config.json` is looked up in the model directory first, then in the configuration
    /// directory; `model.json` the other way around. `model.json` is optional when the
    /// transformer type can be derived from `config.json`.
    pub fn load(config_path: &Path, model_path: &Path) -> Result<Self> {
        let config_file = find_file(&[model_path, config_path], CONFIG_FILE)
            .ok_or_else(|| ConfigurationError::MissingFile(model_path.join(CONFIG_FILE)))?;
        let config_json = read_file(&config_file)?;

        let model_json = match find_file(&[config_path, model_path], MODEL_FILE) {
            Some(model_file) => Some((read_file(&model_file)?, model_file)),
            None => None,
        };

        let settings = match &model_json {
            Some((content, file)) => parse_settings(content, file)?,
            None => ModelSettings::default(),
        };

        let hyperparameters = serde_json::from_str::<HashMap<String, Value>>(&config_json)
            .map_err(|err| ConfigurationError::Parse { file: config_file.clone(), message: err.to_string() })?;

        let config = build_config(settings, &hyperparameters)?;
        log_config(&config);

        Ok(config)
    }

    /// Builds a configuration from in-memory `model.json` (optional) and `config.json` documents.
    pub fn from_json(model_json: Option<&str>, config_json: &str) -> Result<Self> {
        let settings = match model_json {
            Some(content) => parse_settings(content, Path::new(MODEL_FILE))?,
            None => ModelSettings::default(),
        };

        let hyperparameters = serde_json::from_str::<HashMap<String, Value>>(config_json)
            .map_err(|err| ConfigurationError::Parse { file: PathBuf::from(CONFIG_FILE), message: err.to_string() })?;

        build_config(settings, &hyperparameters)
    }

    /// Context size used to bound generation and caches (`usize::MAX` when unbounded).
    pub fn context_limit(&self) -> usize {
        self.context_size.unwrap_or(usize::MAX)
    }
}

/// Model-level settings read from `model.json`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelSettings {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, alias = "transformer_type")]
    transformer_type: Option<String>,
    #[serde(default, alias = "parameter_naming")]
    parameter_naming: Option<String>,
    #[serde(default, alias = "decoder_parameter_naming")]
    decoder_parameter_naming: Option<String>,
    #[serde(default, alias = "parameter_name_overrides")]
    parameter_name_overrides: HashMap<String, String>,
}

fn find_file(directories: &[&Path], file_name: &str) -> Option<PathBuf> {
    directories.iter().map(|directory| directory.join(file_name)).find(|path| path.is_file())
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|err| ConfigurationError::Parse { file: path.to_path_buf(), message: err.to_string() }.into())
}

fn parse_settings(content: &str, file: &Path) -> Result<ModelSettings> {
    serde_json::from_str(content)
        .map_err(|err| ConfigurationError::Parse { file: file.to_path_buf(), message: err.to_string() }.into())
}

/// Reads the first present key among `aliases` as a non-negative integer.
fn read_usize(values: &HashMap<String, Value>, name: &'static str, aliases: &[&str]) -> Result<Option<usize>> {
    match aliases.iter().find_map(|alias| values.get(*alias).filter(|value| !value.is_null())) {
        Some(value) => {
            // a list (for example several end-of-text ids) contributes its first element
            let first = match value {
                Value::Array(items) => items.first(),
                other => Some(other),
            };

            first
                .and_then(Value::as_u64)
                .and_then(|number| usize::try_from(number).ok())
                .map(Some)
                .ok_or_else(|| {
                    ConfigurationError::InvalidValue { name, message: format!("expected an integer, got {value}") }
                        .into()
                })
        }
        None => Ok(None),
    }
}

fn read_f32(values: &HashMap<String, Value>, name: &'static str, aliases: &[&str]) -> Result<Option<f32>> {
    match aliases.iter().find_map(|alias| values.get(*alias).filter(|value| !value.is_null())) {
        Some(value) => value.as_f64().map(|value| Some(value as f32)).ok_or_else(|| {
            ConfigurationError::InvalidValue { name, message: format!("expected a number, got {value}") }.into()
        }),
        None => Ok(None),
    }
}

fn build_config(settings: ModelSettings, values: &HashMap<String, Value>) -> Result<ModelConfig> {
    macro_rules! required {
        ($name:literal, $($alias:literal),+) => {
            read_usize(values, $name, &[$($alias),+])?.ok_or(ConfigurationError::MissingValue($name))?
        };
    }

    macro_rules! optional {
        ($reader:ident, $name:literal, $($alias:literal),+) => {
            $reader(values, $name, &[$($alias),+])?
        };
    }

    let transformer_type = match (&settings.transformer_type, values.get("model_type").and_then(Value::as_str)) {
        (Some(name), _) => TransformerType::try_from(name.as_str())?,
        (None, Some(model_type)) => TransformerType::from_model_type(model_type)
            .ok_or_else(|| ConfigurationError::UnknownTransformerType(model_type.to_string()))?,
        (None, None) => return Err(ConfigurationError::MissingValue("transformer type").into()),
    };

    let hidden_size = required!("hidden size", "n_embd", "hidden_size", "n_embed", "d_model");
    let decoder_count = required!("decoder count", "n_layer", "num_hidden_layers", "num_layers");
    let head_count = required!("head count", "n_head", "num_attention_heads", "num_heads");
    let vocab_size = required!("vocabulary size", "vocab_size");

    let feed_forward_size = optional!(read_usize, "feed-forward size", "intermediate_size", "n_inner", "ffn_dim")
        .unwrap_or(hidden_size * DEFAULT_FEED_FORWARD_FACTOR);
    let kv_head_count =
        optional!(read_usize, "key/value head count", "num_key_value_heads", "n_kv_heads").unwrap_or(head_count);
    let context_size =
        optional!(read_usize, "context size", "n_ctx", "max_position_embeddings", "n_positions", "seq_length")
            .filter(|&size| size > 0);
    let epsilon = optional!(read_f32, "epsilon", "layer_norm_epsilon", "rms_norm_eps", "layer_norm_eps")
        .unwrap_or_else(|| {
            warn!("Normalization epsilon is not configured, using {DEFAULT_EPSILON}");
            DEFAULT_EPSILON
        });
    let end_of_text_token = optional!(read_usize, "end-of-text token", "eos_token_id").unwrap_or_else(|| {
        warn!("End-of-text token is not configured, using 0");
        0
    });
    let rope_theta = optional!(read_f32, "rotary base", "rope_theta").unwrap_or(DEFAULT_ROPE_THETA);
    let window_size = optional!(read_usize, "window size", "window_size").unwrap_or(DEFAULT_WINDOW_SIZE);

    // the head size is only meaningful once the head count is known to be positive
    let head_size = if head_count > 0 { hidden_size / head_count } else { 0 };
    let rotary_dim = optional!(read_usize, "rotary dimension", "rotary_dim").unwrap_or(head_size);

    let naming = ParameterNaming::new(
        settings.parameter_naming.as_deref().unwrap_or(NAME_PLACEHOLDER),
        settings.decoder_parameter_naming.as_deref().unwrap_or(transformer_type.default_decoder_naming()),
        settings.parameter_name_overrides,
    );

    let config = ModelConfig {
        name: settings.name.unwrap_or_else(|| transformer_type.name().to_string()),
        transformer_type,
        hidden_size,
        feed_forward_size,
        decoder_count,
        head_count,
        kv_head_count,
        head_size,
        epsilon,
        context_size,
        vocab_size,
        end_of_text_token,
        rotary_dim,
        rope_theta,
        window_size,
        naming,
    };

    validate_config(&config)?;

    Ok(config)
}

/// Validates the model configuration to ensure it's supported.
fn validate_config(config: &ModelConfig) -> Result<(), ConfigurationError> {
    let invalid = |name: &'static str, message: String| ConfigurationError::InvalidValue { name, message };

    // Validate positive dimensions
    let dimensions = [
        ("hidden size", config.hidden_size),
        ("feed-forward size", config.feed_forward_size),
        ("decoder count", config.decoder_count),
        ("head count", config.head_count),
        ("key/value head count", config.kv_head_count),
        ("vocabulary size", config.vocab_size),
    ];

    for (name, value) in dimensions {
        if value == 0 {
            return Err(invalid(name, format!("must be positive, got {value}")));
        }
    }

    if config.hidden_size % config.head_count != 0 {
        return Err(invalid(
            "head count",
            format!("hidden size {} is not divisible by {} heads", config.hidden_size, config.head_count),
        ));
    }

    if config.head_count % config.kv_head_count != 0 {
        return Err(invalid(
            "key/value head count",
            format!("{} heads cannot be grouped into {} key/value heads", config.head_count, config.kv_head_count),
        ));
    }

    if config.transformer_type.has_rotary_positions()
        && (config.rotary_dim == 0 || config.rotary_dim % 2 != 0 || config.rotary_dim > config.head_size)
    {
        return Err(invalid(
            "rotary dimension",
            format!("must be even and at most the head size {}, got {}", config.head_size, config.rotary_dim),
        ));
    }

    if config.epsilon.is_nan() || config.epsilon < 0.0 {
        return Err(invalid("epsilon", format!("must be non-negative, got {}", config.epsilon)));
    }

    if config.transformer_type.has_learned_positions() && config.context_size.is_none() {
        return Err(ConfigurationError::MissingValue("context size"));
    }

    if config.end_of_text_token >= config.vocab_size {
        return Err(invalid(
            "end-of-text token",
            format!("{} is outside the vocabulary of {} tokens", config.end_of_text_token, config.vocab_size),
        ));
    }

    Ok(())
}

fn log_config(config: &ModelConfig) {
    info!("Model configuration loaded:");
    info!("   • Name: {}", config.name);
    info!("   • Transformer type: {}", config.transformer_type);
    info!("   • Hidden size: {}", config.hidden_size);
    info!("   • Feed-forward size: {}", config.feed_forward_size);
    info!("   • Decoders: {}", config.decoder_count);
    info!("   • Attention heads: {}", config.head_count);
    info!("   • KV heads: {}", config.kv_head_count);
    info!("   • Vocabulary size: {}", config.vocab_size);
    match config.context_size {
        Some(size) => info!("   • Context size: {size}"),
        None => info!("   • Context size: unbounded"),
    }
    info!("");
}
