//! Thin adapter around `qdrant-client` to isolate API usage.
//!
//! All Qdrant interactions live behind this facade: collection bootstrap,
//! point upserts, and cosine KNN with a `work_id` metadata filter. The
//! facade resolves per-work collection names when that mode is enabled and
//! converts Qdrant scores into the `distance = 1 − similarity` form used
//! throughout the pipeline.
//!
//! Payload contract: every point carries `id` (the source row id) and
//! `work_id`; chunk points additionally carry `scene_id`.

use std::time::Duration;

use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, Distance, FieldCondition, Filter, Match, PointId,
    PointStruct, SearchPointsBuilder, UpsertPointsBuilder, Value as QValue, Vector,
    VectorParamsBuilder, Vectors, condition, r#match::MatchValue, point_id, vectors,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::VectorConfig;
use crate::errors::VectorError;

/// One point to upsert: stable source id, vector, and JSON metadata.
#[derive(Debug, Clone)]
pub struct PointRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
}

/// One KNN hit. `distance ∈ [0, 2]` in cosine space.
#[derive(Debug, Clone)]
pub struct VectorHit {
    /// Source row id recovered from the payload.
    pub id: String,
    pub distance: f32,
    pub payload: serde_json::Value,
}

impl VectorHit {
    /// Cosine similarity, `1 − distance`.
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }
}

/// Facade over the Qdrant client.
pub struct QdrantFacade {
    client: Qdrant,
    cfg: VectorConfig,
}

impl QdrantFacade {
    /// Creates a new facade from the given configuration.
    pub fn new(cfg: &VectorConfig) -> Result<Self, VectorError> {
        cfg.validate()?;

        let mut builder = Qdrant::from_url(&cfg.qdrant_url);
        if let Some(key) = &cfg.qdrant_api_key {
            builder = builder.api_key(key.clone());
        }
        let client = builder
            .build()
            .map_err(|e| VectorError::Qdrant(e.to_string()))?;

        Ok(Self {
            client,
            cfg: cfg.clone(),
        })
    }

    pub fn config(&self) -> &VectorConfig {
        &self.cfg
    }

    /// Ensures the effective collection for `(base, work_id)` exists,
    /// creating it with cosine distance when missing.
    pub async fn ensure_collection(
        &self,
        base: &str,
        work_id: &str,
        dim: usize,
    ) -> Result<(), VectorError> {
        let name = self.cfg.effective_collection(base, work_id);

        if self.client.collection_info(&name).await.is_ok() {
            debug!(collection = %name, "collection already present");
            return Ok(());
        }

        warn!(collection = %name, dim, "collection missing, creating it in cosine space");
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&name)
                    .vectors_config(VectorParamsBuilder::new(dim as u64, Distance::Cosine)),
            )
            .await
            .map_err(|e| VectorError::Qdrant(e.to_string()))?;

        info!(collection = %name, "collection created");
        Ok(())
    }

    /// Upserts a batch of points into the effective collection.
    ///
    /// Point ids are deterministic UUIDv5 digests of the source id, so
    /// re-running a seed pass overwrites rather than duplicates.
    pub async fn upsert(
        &self,
        base: &str,
        work_id: &str,
        points: Vec<PointRecord>,
    ) -> Result<u64, VectorError> {
        if points.is_empty() {
            debug!("no points provided for upsert");
            return Ok(0);
        }
        let name = self.cfg.effective_collection(base, work_id);
        info!("upserting {} points into '{}'", points.len(), name);

        let mut qpoints = Vec::with_capacity(points.len());
        for p in points {
            if let Some(want) = self.cfg.embedding_dim {
                if p.vector.len() != want {
                    return Err(VectorError::VectorSizeMismatch {
                        got: p.vector.len(),
                        want,
                    });
                }
            }

            let mut payload = json_to_qpayload(&p.payload);
            payload.insert("id".to_string(), qvalue_string(p.id.clone()));

            let vectors = Vectors {
                vectors_options: Some(vectors::VectorsOptions::Vector(Vector {
                    data: p.vector,
                    ..Default::default()
                })),
            };
            let point_id = PointId {
                point_id_options: Some(point_id::PointIdOptions::Uuid(stable_point_id(&p.id))),
            };
            qpoints.push(PointStruct {
                id: Some(point_id),
                payload,
                vectors: Some(vectors),
                ..Default::default()
            });
        }

        let res = self
            .client
            .upsert_points(UpsertPointsBuilder::new(&name, qpoints))
            .await
            .map_err(|e| VectorError::Qdrant(e.to_string()))?;

        debug!("upsert operation result={:?}", res.result);
        Ok(res.result.and_then(|r| r.operation_id).unwrap_or(0))
    }

    /// Cosine KNN over the effective collection for one work.
    ///
    /// In global mode a `work_id` equality filter is sent; in per-work mode
    /// the collection name itself scopes the search. Both paths return
    /// identical candidate sets for identical inputs.
    pub async fn query(
        &self,
        base: &str,
        work_id: &str,
        vector: Vec<f32>,
        k: u64,
    ) -> Result<Vec<VectorHit>, VectorError> {
        let name = self.cfg.effective_collection(base, work_id);
        let filter = if self.cfg.per_work_collections {
            None
        } else {
            Some(work_filter(work_id))
        };

        debug!(
            "query '{}' k={} filtered={} dim={}",
            name,
            k,
            filter.is_some(),
            vector.len()
        );

        let mut builder = SearchPointsBuilder::new(&name, vector, k).with_payload(true);
        if let Some(f) = filter {
            builder = builder.filter(f);
        }

        let secs = self.cfg.query_timeout_secs;
        let fut = self.client.search_points(builder);
        let res = tokio::time::timeout(Duration::from_secs(secs), fut)
            .await
            .map_err(|_| VectorError::Timeout {
                op: "vector query",
                secs,
            })?
            .map_err(|e| VectorError::Qdrant(e.to_string()))?;

        let mut out = Vec::with_capacity(res.result.len());
        for r in res.result.into_iter() {
            let payload = qpayload_to_json(r.payload);
            let id = payload
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            out.push(VectorHit {
                id,
                distance: 1.0 - r.score,
                payload,
            });
        }

        debug!("query completed: {} hits", out.len());
        Ok(out)
    }
}

/// Deterministic UUIDv5 from an arbitrary source row id.
fn stable_point_id(id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, id.as_bytes()).to_string()
}

/// Equality filter on the `work_id` payload key.
fn work_filter(work_id: &str) -> Filter {
    Filter {
        must: vec![Condition {
            condition_one_of: Some(condition::ConditionOneOf::Field(FieldCondition {
                key: "work_id".to_string(),
                r#match: Some(Match {
                    match_value: Some(MatchValue::Keyword(work_id.to_string())),
                }),
                ..Default::default()
            })),
        }],
        ..Default::default()
    }
}

/// Lower a Qdrant payload map into plain JSON for downstream callers.
///
/// Only the scalar kinds this pipeline writes are lowered; anything else
/// (lists, nested structs) is outside the payload contract and collapses
/// to `Null`.
fn qpayload_to_json(payload: std::collections::HashMap<String, QValue>) -> serde_json::Value {
    let fields: serde_json::Map<String, serde_json::Value> = payload
        .into_iter()
        .map(|(key, value)| (key, qvalue_to_json(value)))
        .collect();
    serde_json::Value::Object(fields)
}

fn qvalue_to_json(value: QValue) -> serde_json::Value {
    use qdrant_client::qdrant::value::Kind as K;
    match value.kind {
        Some(K::BoolValue(b)) => serde_json::Value::Bool(b),
        Some(K::IntegerValue(i)) => serde_json::Value::from(i),
        Some(K::DoubleValue(f)) => serde_json::Value::from(f),
        Some(K::StringValue(s)) => serde_json::Value::String(s),
        _ => serde_json::Value::Null,
    }
}

fn qvalue_string(s: String) -> QValue {
    use qdrant_client::qdrant::value::Kind as K;
    QValue {
        kind: Some(K::StringValue(s)),
    }
}

/// Converts flat JSON metadata into a Qdrant payload map.
fn json_to_qpayload(v: &serde_json::Value) -> std::collections::HashMap<String, QValue> {
    use qdrant_client::qdrant::value::Kind as K;
    use serde_json::Value as J;

    let mut out = std::collections::HashMap::new();
    if let J::Object(m) = v {
        for (k, v) in m {
            let kind = match v {
                J::String(s) => Some(K::StringValue(s.clone())),
                J::Bool(b) => Some(K::BoolValue(*b)),
                J::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Some(K::IntegerValue(i))
                    } else {
                        n.as_f64().map(K::DoubleValue)
                    }
                }
                // Nested payloads are not part of the contract.
                _ => None,
            };
            if let Some(kind) = kind {
                out.insert(k.clone(), QValue { kind: Some(kind) });
            }
        }
    }
    out
}
