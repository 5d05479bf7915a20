use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("HuggingFace API error: {0}")]
    HuggingFace(#[from] hf_hub::api::sync::ApiError),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Embedding provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Embedding provider error: {0}")]
    Provider(String),

    #[error("Embedding provider timed out after {attempts} attempt(s) of {timeout_ms} ms")]
    ProviderTimeout { attempts: u32, timeout_ms: u64 },

    #[error("Corpus directory not found: {}", .0.display())]
    CorpusNotFound(PathBuf),

    #[error("Index not found at {}; run `docvec index <path>` first", .0.display())]
    IndexNotFound(PathBuf),

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),
}

impl Error {
    /// Whether a failed provider call may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Provider(_) | Error::ProviderTimeout { .. } | Error::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
