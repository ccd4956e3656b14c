//! Error types for vector search and embedding.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VectorError {
    #[error("config error: {0}")]
    Config(String),

    #[error("qdrant error: {0}")]
    Qdrant(String),

    #[error("embedding service unavailable: {0}")]
    EmbedUnavailable(String),

    #[error("embedding service returned an empty vector")]
    EmbedEmpty,

    #[error("vector size mismatch: got={got}, want={want}")]
    VectorSizeMismatch { got: usize, want: usize },

    #[error("{op} timed out after {secs}s")]
    Timeout { op: &'static str, secs: u64 },
}
