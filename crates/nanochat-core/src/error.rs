//! Error types for nanochat core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for nanochat operations.
pub type Result<T> = std::result::Result<T, NanochatError>;

/// Structural problems with a [`ModelConfig`](crate::model::ModelConfig).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A dimension that must be positive is zero.
    #[error("{field} must be positive")]
    ZeroDimension {
        /// Name of the offending field.
        field: &'static str,
    },

    /// Two dimensions violate a divisibility or ordering constraint.
    #[error("invalid dimensions ({lhs}, {rhs}): {reason}")]
    InvalidDimensions {
        /// First field of the violated pair.
        lhs: &'static str,
        /// Second field of the violated pair.
        rhs: &'static str,
        /// Human readable description including the values.
        reason: String,
    },
}

impl ConfigError {
    /// The pair of field names involved, if this is a pairwise violation.
    pub fn pair(&self) -> Option<(&'static str, &'static str)> {
        match self {
            Self::InvalidDimensions { lhs, rhs, .. } => Some((lhs, rhs)),
            Self::ZeroDimension { .. } => None,
        }
    }
}

/// Errors that can occur in nanochat operations.
#[derive(Error, Debug)]
pub enum NanochatError {
    /// Invalid model architecture.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Tensor with an unexpected rank or shape.
    #[error("shape error: {0}")]
    Shape(String),

    /// Requested positions exceed the precomputed rotary table.
    #[error("sequence length {len} exceeds rotary capacity {max}")]
    SequenceTooLong {
        /// Last position (exclusive) that was requested.
        len: usize,
        /// Number of positions the rotary table covers.
        max: usize,
    },

    /// Tensors live on different devices.
    #[error("device mismatch: {0}")]
    DeviceMismatch(String),

    /// A checkpoint or tokenizer file does not exist.
    #[error("not found: {}", path.display())]
    NotFound {
        /// The path that was looked up.
        path: PathBuf,
    },

    /// KV cache or forward pass internal inconsistency.
    #[error("state error: {0}")]
    State(String),

    /// Rejected sampling parameters.
    #[error("invalid sampling parameters: {0}")]
    InvalidSampling(String),

    /// Tokenizer failure.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Malformed checkpoint contents.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl NanochatError {
    /// Build a [`NanochatError::NotFound`] for `path`.
    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::NotFound { path: path.into() }
    }
}
