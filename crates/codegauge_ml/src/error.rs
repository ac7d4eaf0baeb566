//! ML error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MlError>;

#[derive(Error, Debug)]
pub enum MlError {
    #[error("Unsupported model type: '{0}'")]
    UnsupportedModelType(String),

    #[error("Unsupported XAI type for this model: '{0}'")]
    UnsupportedXaiType(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Model is not fitted")]
    NotFitted,

    #[error("Artifact error: {0}")]
    Artifact(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MlError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}
