//! Library configuration for the Qdrant-backed vector layer.

use crate::errors::VectorError;

/// High-level configuration for vector search.
#[derive(Clone, Debug)]
pub struct VectorConfig {
    pub qdrant_url: String,
    pub qdrant_api_key: Option<String>,
    /// Base name of the chunk collection (`CHUNK_COLL`).
    pub chunk_collection: String,
    /// Base name of the trope catalog collection (`TROPE_COLL`).
    pub trope_collection: String,
    /// When set, collections resolve to `base + "__" + work_id` and no
    /// work filter is sent; otherwise the global collection is filtered.
    pub per_work_collections: bool,
    /// Expected embedding dimensionality, if known up front.
    pub embedding_dim: Option<usize>,
    /// Deadline for a single KNN query.
    pub query_timeout_secs: u64,
}

impl VectorConfig {
    /// Build from environment variables with the pipeline defaults.
    ///
    /// Recognized vars: `QDRANT_URL`, `QDRANT_API_KEY`, `CHUNK_COLL`,
    /// `TROPE_COLL`, `PER_WORK_COLLECTIONS`, `EMBEDDING_DIM`.
    pub fn from_env() -> Result<Self, VectorError> {
        use std::env;

        let qdrant_url =
            env::var("QDRANT_URL").unwrap_or_else(|_| "http://127.0.0.1:6334".to_string());
        let qdrant_api_key = env::var("QDRANT_API_KEY").ok().filter(|s| !s.is_empty());

        let chunk_collection = env::var("CHUNK_COLL").unwrap_or_else(|_| "chunk".to_string());
        let trope_collection =
            env::var("TROPE_COLL").unwrap_or_else(|_| "trope_catalog".to_string());

        let per_work_collections = env::var("PER_WORK_COLLECTIONS")
            .ok()
            .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let embedding_dim = env::var("EMBEDDING_DIM")
            .ok()
            .and_then(|s| s.parse::<usize>().ok());

        let cfg = Self {
            qdrant_url,
            qdrant_api_key,
            chunk_collection,
            trope_collection,
            per_work_collections,
            embedding_dim,
            query_timeout_secs: 10,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates mandatory fields.
    pub fn validate(&self) -> Result<(), VectorError> {
        if self.qdrant_url.trim().is_empty() {
            return Err(VectorError::Config("empty QDRANT_URL".into()));
        }
        if self.chunk_collection.trim().is_empty() {
            return Err(VectorError::Config("empty CHUNK_COLL".into()));
        }
        if self.trope_collection.trim().is_empty() {
            return Err(VectorError::Config("empty TROPE_COLL".into()));
        }
        Ok(())
    }

    /// Resolve the effective collection name for one work.
    pub fn effective_collection(&self, base: &str, work_id: &str) -> String {
        if self.per_work_collections {
            format!("{base}__{work_id}")
        } else {
            base.to_string()
        }
    }
}
