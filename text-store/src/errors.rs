//! Error types for the text store.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("work not found: {0}")]
    MissingWork(String),

    #[error("scene not found: {0}")]
    MissingScene(String),

    #[error("chunk integrity violation in {chunk_id}: {reason}")]
    Integrity { chunk_id: String, reason: String },

    #[error("invalid span [{start}, {end}) for {what}")]
    BadSpan {
        what: &'static str,
        start: usize,
        end: usize,
    },
}

impl StoreError {
    /// Unique-index hits are benign dedup under the write discipline.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}
