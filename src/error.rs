//! Error types for shardvit-rs.

use thiserror::Error;

/// Result type alias for shardvit-rs operations.
pub type Result<T> = std::result::Result<T, ShardVitError>;

/// Errors that can occur during model construction, sharding, or training.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ShardVitError {
    /// Tensor operation failed
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Image/patch dimension mismatch or positional-embedding length mismatch.
    /// Raised synchronously at the failing forward call; aborts the run.
    #[error("shape mismatch: expected {expected}, got {got}")]
    Shape { expected: String, got: String },

    /// Process-group or device initialization failure. Fatal at startup.
    #[error("bootstrap error: {0}")]
    Bootstrap(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Training error
    #[error("training error: {0}")]
    Training(String),

    /// Data loading error
    #[error("data error: {0}")]
    Data(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ShardVitError {
    /// Create a shape mismatch error
    pub fn shape(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::Shape {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create a bootstrap error
    pub fn bootstrap(msg: impl Into<String>) -> Self {
        Self::Bootstrap(msg.into())
    }

    /// Create an invalid config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a training error
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    /// Create a data loading error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }
}
