//! Error Types
//!
//! Every fallible operation in the crate returns [`Result<T>`], whose error
//! side is [`QuillError`]. Errors are raised at the call that violates a
//! precondition and propagated unchanged to the caller.
//!
//! ## Taxonomy
//!
//! - **ShapeMismatch**: token id ≥ vocab size, sequence longer than the
//!   context window, empty sequence, ragged batch, checkpoint tensor with the
//!   wrong shape
//! - **InvalidParameter**: a hyperparameter outside its valid range
//!   (temperature, top-p, head count, learning rate, ...)
//! - **NumericInstability**: non-finite logits or loss. Softmax always
//!   subtracts the row maximum, so this only surfaces when the parameters
//!   themselves have diverged
//! - **Io / Serialization**: file and JSON failures from checkpoints,
//!   tokenizers and training logs

use thiserror::Error;

/// Error type for model construction, training and generation
#[derive(Debug, Error)]
pub enum QuillError {
    /// Input shape or token id out of bounds
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Hyperparameter outside its valid range
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Non-finite values in logits or loss
    #[error("Numeric instability: {0}")]
    NumericInstability(String),

    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, QuillError>;

impl QuillError {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        QuillError::ShapeMismatch(msg.into())
    }

    pub(crate) fn param(msg: impl Into<String>) -> Self {
        QuillError::InvalidParameter(msg.into())
    }

    pub(crate) fn numeric(msg: impl Into<String>) -> Self {
        QuillError::NumericInstability(msg.into())
    }
}
