//! Pipeline error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Db(#[from] codegauge_db::DbError),

    #[error("Store error: {0}")]
    Store(#[from] codegauge_store::StoreError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Frame error: {0}")]
    Frame(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cancellation observed at a step or batch boundary.
    #[error("Job cancelled")]
    Cancelled,

    /// A step raised; the engine records the failed step's name.
    #[error("Step [{step}] failed: {message}")]
    Step { step: String, message: String },
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}
