//! Crate-wide error hierarchy for the judging pipeline.
//!
//! Single root [`JudgeError`] for all public functions; `From` impls give
//! `?` ergonomics over the storage, vector, and LLM layers.

use thiserror::Error;

/// Convenient alias for pipeline results.
pub type JudgeResult<T> = Result<T, JudgeError>;

/// Root error type for the judging pipeline.
#[derive(Debug, Error)]
pub enum JudgeError {
    /// Bad or missing configuration; fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// SQLite persistence failure.
    #[error(transparent)]
    Store(#[from] text_store::StoreError),

    /// Vector search or embedding failure.
    #[error(transparent)]
    Vector(#[from] vector_store::VectorError),

    /// LLM transport or decode failure.
    #[error(transparent)]
    Llm(#[from] llm_service::LlmError),

    /// JSON (de)serialization issues outside the LLM response path.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The model's response could not be parsed against the contract.
    #[error("malformed model output: {0}")]
    MalformedModelOutput(String),

    /// The run was cancelled cooperatively.
    #[error("run cancelled")]
    Cancelled,
}

impl JudgeError {
    /// Process exit code for this error: `2` configuration, `3` external
    /// service, `4` database, `1` anything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            JudgeError::Config(_) => 2,
            JudgeError::Vector(_) | JudgeError::Llm(_) => 3,
            JudgeError::Store(_) => 4,
            _ => 1,
        }
    }
}
