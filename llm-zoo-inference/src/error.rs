use std::path::PathBuf;

use thiserror::Error;

/// Failures related to model configuration files and hyperparameters.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Configuration file not found: {0}")]
    MissingFile(PathBuf),

    #[error("Failed to parse {file}: {message}")]
    Parse { file: PathBuf, message: String },

    #[error("Missing required hyperparameter: {0}")]
    MissingValue(&'static str),

    #[error("Invalid {name}: {message}")]
    InvalidValue { name: &'static str, message: String },

    #[error("Unknown transformer type: {0}")]
    UnknownTransformerType(String),
}

/// Failures related to tensor container files and tensor reads.
#[derive(Error, Debug)]
pub enum ParameterFileError {
    #[error("Parameter directory not found: {0}")]
    MissingDirectory(PathBuf),

    #[error("No safetensors files found in {0}")]
    NoParameterFiles(PathBuf),

    #[error("Malformed header in {file}: {message}")]
    MalformedHeader { file: PathBuf, message: String },

    #[error("Tensor {id} in {file} has malformed data offsets: {message}")]
    MalformedOffsets { file: PathBuf, id: String, message: String },

    #[error("Tensor {id} has unknown data type {dtype}")]
    UnknownDataType { id: String, dtype: String },

    #[error("Tensor {id} declares shape {shape:?} ({expected} elements) but holds {actual} elements")]
    ShapeMismatch { id: String, shape: Vec<usize>, expected: usize, actual: usize },

    #[error("Tensor {id} is defined in both {first} and {second}")]
    DuplicateTensor { id: String, first: PathBuf, second: PathBuf },

    #[error("Tensor not found: {0}")]
    NotFound(String),

    #[error("Tensor {id} size mismatch. Expected {expected} elements, got {actual}")]
    SizeMismatch { id: String, expected: usize, actual: usize },

    #[error("Tensor {id} has unsupported data type {dtype}")]
    UnsupportedDataType { id: String, dtype: String },
}

/// Input rejected by the generation loop before any cache is touched.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Token {token} is outside the vocabulary of {vocab_size} tokens")]
    TokenOutOfRange { token: usize, vocab_size: usize },

    #[error("{input} input tokens at position {position} do not fit into the context of {context} positions")]
    ContextExceeded { position: usize, input: usize, context: usize },

    #[error("Session is at position {session} but the decoder stack caches {cached} positions")]
    SessionMismatch { session: usize, cached: usize },

    #[error("The session has no generated token to continue from")]
    NothingToContinue,
}
