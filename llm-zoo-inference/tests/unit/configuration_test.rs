use super::*;
use anyhow::Result;
use std::fs;
use tempfile::TempDir;

const GPT2_CONFIG: &str = r#"{
    "model_type": "gpt2",
    "n_embd": 768,
    "n_layer": 12,
    "n_head": 12,
    "n_ctx": 1024,
    "n_positions": 1024,
    "vocab_size": 50257,
    "layer_norm_epsilon": 1e-5,
    "eos_token_id": 50256
}"#;

const LLAMA_CONFIG: &str = r#"{
    "hidden_size": 4096,
    "intermediate_size": 11008,
    "num_hidden_layers": 32,
    "num_attention_heads": 32,
    "num_key_value_heads": 8,
    "max_position_embeddings": 4096,
    "rms_norm_eps": 1e-6,
    "rope_theta": 500000.0,
    "vocab_size": 32000,
    "eos_token_id": [2, 3]
}"#;

fn configuration_error(result: Result<ModelConfig>) -> ConfigurationError {
    match result {
        Ok(config) => panic!("expected a configuration error, got {config:?}"),
        Err(err) => match err.downcast::<ConfigurationError>() {
            Ok(err) => err,
            Err(err) => panic!("unexpected error: {err:?}"),
        },
    }
}

#[test]
fn test_transformer_type_names() -> Result<()> {
    for kind in TransformerType::ALL {
        assert_eq!(TransformerType::try_from(kind.name())?, kind);
    }

    assert_eq!(TransformerType::try_from("meta_llama")?, TransformerType::MetaLlama);
    assert!(matches!(
        TransformerType::try_from("GOOGLE_T5"),
        Err(ConfigurationError::UnknownTransformerType(name)) if name == "GOOGLE_T5"
    ));

    Ok(())
}

#[test]
fn test_gpt2_config_with_model_type() -> Result<()> {
    let config = ModelConfig::from_json(None, GPT2_CONFIG)?;

    assert_eq!(config.transformer_type, TransformerType::OpenAiGpt2);
    assert_eq!(config.name, "OPENAI_GPT_2");
    assert_eq!(config.hidden_size, 768);
    assert_eq!(config.feed_forward_size, 3072);
    assert_eq!(config.decoder_count, 12);
    assert_eq!(config.head_count, 12);
    assert_eq!(config.kv_head_count, 12);
    assert_eq!(config.head_size, 64);
    assert_eq!(config.context_size, Some(1024));
    assert_eq!(config.vocab_size, 50257);
    assert_eq!(config.end_of_text_token, 50256);
    assert!((config.epsilon - 1e-5).abs() < 1e-12);
    assert_eq!(config.naming.decoder_name(0, "ln_1.weight"), "h.0.ln_1.weight");

    Ok(())
}

#[test]
fn test_llama_config_with_model_settings() -> Result<()> {
    let model_json = r#"{
        "name": "Llama 2 7B",
        "transformerType": "META_LLAMA",
        "decoderParameterNaming": "layers.{decoderId}.{name}",
        "parameterNameOverrides": {"model.norm.weight": "norm.weight"}
    }"#;

    let config = ModelConfig::from_json(Some(model_json), LLAMA_CONFIG)?;

    assert_eq!(config.name, "Llama 2 7B");
    assert_eq!(config.transformer_type, TransformerType::MetaLlama);
    assert_eq!(config.kv_head_count, 8);
    assert_eq!(config.head_size, 128);
    assert_eq!(config.rotary_dim, 128);
    assert_eq!(config.rope_theta, 500000.0);
    assert_eq!(config.end_of_text_token, 2);
    assert_eq!(config.naming.model_name("model.norm.weight"), "norm.weight");
    assert_eq!(config.naming.decoder_name(5, "mlp.up_proj.weight"), "layers.5.mlp.up_proj.weight");

    Ok(())
}

#[test]
fn test_snake_case_model_settings() -> Result<()> {
    let model_json = r#"{"transformer_type": "big_science_bloom", "parameter_naming": "transformer.{name}"}"#;
    let config_json = r#"{"hidden_size": 64, "n_layer": 2, "n_head": 4, "vocab_size": 100}"#;

    let config = ModelConfig::from_json(Some(model_json), config_json)?;

    assert_eq!(config.transformer_type, TransformerType::BigScienceBloom);
    assert_eq!(config.context_size, None);
    assert_eq!(config.context_limit(), usize::MAX);
    assert_eq!(config.epsilon, 1e-5);
    assert_eq!(config.end_of_text_token, 0);
    assert_eq!(config.naming.model_name("ln_f.weight"), "transformer.ln_f.weight");

    Ok(())
}

#[test]
fn test_missing_and_invalid_values() {
    let err = configuration_error(ModelConfig::from_json(None, r#"{"model_type": "gpt2", "n_layer": 2}"#));
    assert!(matches!(err, ConfigurationError::MissingValue("hidden size")));

    let err = configuration_error(ModelConfig::from_json(None, r#"{"n_embd": 8, "n_layer": 1, "n_head": 2}"#));
    assert!(matches!(err, ConfigurationError::MissingValue("transformer type")));

    let err = configuration_error(ModelConfig::from_json(
        None,
        r#"{"model_type": "gpt2", "n_embd": "wide", "n_layer": 1, "n_head": 2, "vocab_size": 4}"#,
    ));
    assert!(matches!(err, ConfigurationError::InvalidValue { name: "hidden size", .. }));

    let err = configuration_error(ModelConfig::from_json(
        None,
        r#"{"model_type": "gpt2", "n_embd": 10, "n_layer": 1, "n_head": 3, "n_ctx": 8, "vocab_size": 4}"#,
    ));
    assert!(matches!(err, ConfigurationError::InvalidValue { name: "head count", .. }));

    let err = configuration_error(ModelConfig::from_json(
        None,
        r#"{"model_type": "llama", "hidden_size": 16, "num_hidden_layers": 1, "num_attention_heads": 4,
            "num_key_value_heads": 3, "vocab_size": 4}"#,
    ));
    assert!(matches!(err, ConfigurationError::InvalidValue { name: "key/value head count", .. }));

    let err = configuration_error(ModelConfig::from_json(
        None,
        r#"{"model_type": "gpt2", "n_embd": 8, "n_layer": 0, "n_head": 2, "n_ctx": 8, "vocab_size": 4}"#,
    ));
    assert!(matches!(err, ConfigurationError::InvalidValue { name: "decoder count", .. }));

    // learned position tables need a context size
    let err = configuration_error(ModelConfig::from_json(
        None,
        r#"{"model_type": "gpt2", "n_embd": 8, "n_layer": 1, "n_head": 2, "vocab_size": 4}"#,
    ));
    assert!(matches!(err, ConfigurationError::MissingValue("context size")));

    let err = configuration_error(ModelConfig::from_json(
        None,
        r#"{"model_type": "gptj", "n_embd": 8, "n_layer": 1, "n_head": 2, "rotary_dim": 3, "vocab_size": 4}"#,
    ));
    assert!(matches!(err, ConfigurationError::InvalidValue { name: "rotary dimension", .. }));

    let err = configuration_error(ModelConfig::from_json(
        Some(r#"{"transformerType": "GOOGLE_T5"}"#),
        r#"{"n_embd": 8, "n_layer": 1, "n_head": 2, "vocab_size": 4}"#,
    ));
    assert!(matches!(err, ConfigurationError::UnknownTransformerType(_)));

    let err = configuration_error(ModelConfig::from_json(None, "invalid json"));
    assert!(matches!(err, ConfigurationError::Parse { .. }));
}

#[test]
fn test_load_from_directories() -> Result<()> {
    let config_dir = TempDir::new()?;
    let model_dir = TempDir::new()?;

    fs::write(config_dir.path().join(MODEL_FILE), r#"{"name": "GPT-2 small", "transformerType": "OPENAI_GPT_2"}"#)?;
    fs::write(model_dir.path().join(CONFIG_FILE), GPT2_CONFIG)?;

    let config = ModelConfig::load(config_dir.path(), model_dir.path())?;

    assert_eq!(config.name, "GPT-2 small");
    assert_eq!(config.hidden_size, 768);

    Ok(())
}

#[test]
fn test_load_without_config_file() -> Result<()> {
    let config_dir = TempDir::new()?;
    let model_dir = TempDir::new()?;

    let err = configuration_error(ModelConfig::load(config_dir.path(), model_dir.path()));
    assert!(matches!(err, ConfigurationError::MissingFile(_)));

    Ok(())
}
