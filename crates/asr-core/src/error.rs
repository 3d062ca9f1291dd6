//! Error types for RustASR.

use thiserror::Error;

/// Main error type for ASR operations.
#[derive(Error, Debug)]
pub enum AsrError {
    /// Invalid model or layer configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// Model loading errors.
    #[error("Model error: {0}")]
    Model(String),

    /// Inference errors.
    #[error("Inference error: {0}")]
    Inference(String),

    /// Checkpoint discovery / averaging errors.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle tensor errors.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<AsrError> for candle_core::Error {
    fn from(err: AsrError) -> Self {
        match err {
            AsrError::Candle(e) => e,
            other => candle_core::Error::Msg(other.to_string()),
        }
    }
}

/// Result type alias for ASR operations.
pub type AsrResult<T> = Result<T, AsrError>;
