//! Error types for the backdoor-core crate.

use thiserror::Error;

/// Top-level error type for trigger injection and training-state operations.
#[derive(Debug, Error)]
pub enum BackdoorError {
    /// The sample handed to a transform is not a pixel array.
    #[error("Type error: {0}")]
    Type(String),

    /// The pixel array does not have the layout the operation needs.
    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported {kind}: {config}")]
    UnsupportedVariant { kind: &'static str, config: String },

    #[error("Checkpoint is missing key `{0}`")]
    MissingKey(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl BackdoorError {
    pub fn type_error(msg: impl Into<String>) -> Self {
        Self::Type(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn unsupported(kind: &'static str, config: impl Into<String>) -> Self {
        Self::UnsupportedVariant {
            kind,
            config: config.into(),
        }
    }

    pub fn missing_key(key: impl Into<String>) -> Self {
        Self::MissingKey(key.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}
