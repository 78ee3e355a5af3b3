//! Error types for RFWave Core.

use thiserror::Error;

/// Result type alias for RFWave layer operations.
pub type Result<T> = std::result::Result<T, RfwaveError>;

/// Errors that can occur while building or running RFWave layers.
#[derive(Error, Debug)]
pub enum RfwaveError {
    /// Layer or table configuration is invalid (checked at construction).
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Shape mismatch error.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Tensor rank not supported by a broadcast helper.
    #[error("unsupported rank {0}, expected 3 or 4")]
    UnsupportedRank(usize),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

impl RfwaveError {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
