//! Two-stage per-scene support selection.
//!
//! Stage 1 retrieves `RERANK_TOP_K` chunks by scene-embedding KNN; stage 2
//! asks the reasoner for the `RERANK_KEEP_M` snippets that most directly
//! support trope judgment. The response is parsed strictly; anything
//! malformed falls back to the top-M by stage-1 similarity. Every stage-1
//! row is persisted, picked or not.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, warn};

use text_store::{Chunk, Scene, SupportRow};
use vector_store::QdrantFacade;

use crate::cfg::JudgeConfig;
use crate::errors::JudgeError;
use crate::prompt::{self, RerankSnippet};
use crate::reasoner::Reasoner;
use crate::retry::{is_transient_judge, is_transient_vector, with_retry};

/// Strict stage-2 response schema.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RerankResponse {
    pub picked: Vec<String>,
    #[serde(default)]
    pub notes: String,
}

/// Result of support selection for one scene.
#[derive(Debug, Clone, Default)]
pub struct SupportOutcome {
    /// All stage-1 rows, in stage-1 score order.
    pub rows: Vec<SupportRow>,
    /// Picked chunks, in rank order.
    pub picked: Vec<Chunk>,
}

/// Select supports for one scene.
///
/// # Errors
/// Propagates stage-1 retrieval failures (after retries); stage-2 failures
/// never propagate, they degrade to the σ₁ fallback.
pub async fn select_supports(
    cfg: &JudgeConfig,
    facade: &QdrantFacade,
    reasoner: &dyn Reasoner,
    work_id: &str,
    scene: &Scene,
    scene_text: &str,
    scene_vector: &[f32],
    chunks_by_id: &HashMap<String, Chunk>,
) -> Result<SupportOutcome, JudgeError> {
    let base = facade.config().chunk_collection.clone();
    let hits = with_retry(
        "support stage-1 query",
        3,
        || async {
            facade
                .query(&base, work_id, scene_vector.to_vec(), cfg.rerank_top_k)
                .await
        },
        is_transient_vector,
    )
    .await?;

    let mut stage1: Vec<(Chunk, f32)> = Vec::with_capacity(hits.len());
    for hit in &hits {
        let Some(chunk) = chunks_by_id.get(&hit.id) else {
            warn!(chunk_id = %hit.id, "stage-1 hit references unknown chunk");
            continue;
        };
        stage1.push((chunk.clone(), hit.similarity()));
    }

    if stage1.is_empty() {
        debug!(scene_id = %scene.id, "no stage-1 supports retrieved");
        return Ok(SupportOutcome::default());
    }

    let snippets: Vec<RerankSnippet<'_>> = stage1
        .iter()
        .map(|(c, sim)| RerankSnippet {
            chunk_id: &c.id,
            stage1_score: *sim,
            text: &c.text,
        })
        .collect();
    let prompt = prompt::build_rerank_prompt(scene_text, &snippets, cfg.rerank_keep_m);

    let parsed = match with_retry(
        "support rerank",
        3,
        || async { reasoner.complete_json(&prompt).await },
        is_transient_judge,
    )
    .await
    {
        Ok(raw) => match parse_rerank(&raw) {
            Ok(resp) => Some(resp),
            Err(e) => {
                warn!(scene_id = %scene.id, error = %e, "rerank response malformed, falling back to stage-1 order");
                None
            }
        },
        Err(e) => {
            warn!(scene_id = %scene.id, error = %e, "rerank call failed, falling back to stage-1 order");
            None
        }
    };

    Ok(apply_stage2(&scene.id, &stage1, parsed, cfg.rerank_keep_m))
}

/// Parse the stage-2 response strictly against [`RerankResponse`].
pub fn parse_rerank(raw: &str) -> Result<RerankResponse, JudgeError> {
    serde_json::from_str::<RerankResponse>(raw.trim())
        .map_err(|e| JudgeError::MalformedModelOutput(format!("rerank: {e}")))
}

/// Merge stage-1 scores with the reranker's picks into persistent rows.
///
/// Unknown picked ids are dropped; `None` (malformed or failed stage 2)
/// falls back to the top-`m` by σ₁.
pub fn apply_stage2(
    scene_id: &str,
    stage1: &[(Chunk, f32)],
    parsed: Option<RerankResponse>,
    m: usize,
) -> SupportOutcome {
    let picked_ids: Vec<String> = match parsed {
        Some(resp) => {
            let mut seen = std::collections::HashSet::new();
            resp.picked
                .into_iter()
                .filter(|id| stage1.iter().any(|(c, _)| &c.id == id))
                .filter(|id| seen.insert(id.clone()))
                .take(m)
                .collect()
        }
        None => stage1.iter().take(m).map(|(c, _)| c.id.clone()).collect(),
    };

    let rows: Vec<SupportRow> = stage1
        .iter()
        .map(|(chunk, sim)| {
            let rank = picked_ids
                .iter()
                .position(|id| id == &chunk.id)
                .map(|i| (i + 1) as u32);
            SupportRow {
                scene_id: scene_id.to_string(),
                chunk_id: chunk.id.clone(),
                rank,
                stage1_score: *sim,
                stage2_score: if rank.is_some() { 1.0 } else { 0.0 },
                picked: rank.is_some(),
            }
        })
        .collect();

    let picked: Vec<Chunk> = picked_ids
        .iter()
        .filter_map(|id| stage1.iter().find(|(c, _)| &c.id == id).map(|(c, _)| c.clone()))
        .collect();

    debug!(
        scene_id,
        stage1 = stage1.len(),
        picked = picked.len(),
        "support selection complete"
    );
    SupportOutcome { rows, picked }
}

#[cfg(test)]
mod tests {
    use super::*;
    use text_store::sha256_hex;

    fn chunk(id: &str) -> Chunk {
        Chunk {
            id: id.into(),
            work_id: "w1".into(),
            scene_id: "s1".into(),
            idx: 0,
            char_start: 0,
            char_end: 1,
            text: "x".into(),
            sha256: sha256_hex("x"),
        }
    }

    fn stage1() -> Vec<(Chunk, f32)> {
        vec![
            (chunk("c1"), 0.9),
            (chunk("c2"), 0.8),
            (chunk("c3"), 0.7),
            (chunk("c4"), 0.6),
        ]
    }

    #[test]
    fn valid_response_orders_picks_by_preference() {
        let parsed = parse_rerank(r#"{"picked": ["c3", "c1"], "notes": "c3 is decisive"}"#).unwrap();
        let out = apply_stage2("s1", &stage1(), Some(parsed), 3);

        let picked: Vec<_> = out.picked.iter().map(|c| c.id.clone()).collect();
        assert_eq!(picked, vec!["c3", "c1"]);

        let c3 = out.rows.iter().find(|r| r.chunk_id == "c3").unwrap();
        assert_eq!(c3.rank, Some(1));
        assert_eq!(c3.stage2_score, 1.0);
        let c2 = out.rows.iter().find(|r| r.chunk_id == "c2").unwrap();
        assert_eq!(c2.rank, None);
        assert_eq!(c2.stage2_score, 0.0);
        assert_eq!(out.rows.len(), 4, "all stage-1 rows persist");
    }

    #[test]
    fn unknown_ids_are_dropped() {
        let parsed = parse_rerank(r#"{"picked": ["nope", "c2"], "notes": ""}"#).unwrap();
        let out = apply_stage2("s1", &stage1(), Some(parsed), 2);
        let picked: Vec<_> = out.picked.iter().map(|c| c.id.clone()).collect();
        assert_eq!(picked, vec!["c2"]);
    }

    #[test]
    fn malformed_json_falls_back_to_top_m() {
        assert!(parse_rerank("not json at all").is_err());
        assert!(parse_rerank(r#"{"picked": ["c1"], "extra": 1}"#).is_err());

        let out = apply_stage2("s1", &stage1(), None, 3);
        let picked: Vec<_> = out.picked.iter().map(|c| c.id.clone()).collect();
        assert_eq!(picked, vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn notes_field_is_optional() {
        let parsed = parse_rerank(r#"{"picked": []}"#).unwrap();
        assert!(parsed.picked.is_empty());
        assert!(parsed.notes.is_empty());
    }
}
