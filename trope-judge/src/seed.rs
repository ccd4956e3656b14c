//! Semantic seeding: per-trope nearest-chunk retrieval.
//!
//! Each trope's definition text (`name + ". " + summary`) is embedded and
//! queried against the chunk collection, filtered to the current work.
//! Hits at or above `SEM_TAU` become candidates carrying the chunk's span.
//! Per `(trope, scene)` the best `SEM_PER_SCENE_CAP` survive, ties broken
//! by lower chunk index.

use std::collections::HashMap;

use tracing::{debug, warn};
use uuid::Uuid;

use text_store::{CandidateSource, Chunk, TropeCandidate, TropeDef};
use vector_store::{PointRecord, QdrantFacade, VectorHit};

use crate::cfg::JudgeConfig;
use crate::errors::JudgeError;
use crate::retry::{is_transient_vector, with_retry};

/// Mirror the trope catalog into its collection so external tools share
/// the same geometry. Point ids derive from trope ids, so re-runs
/// overwrite in place.
pub async fn upsert_trope_catalog(
    facade: &QdrantFacade,
    work_id: &str,
    tropes: &[TropeDef],
    vectors: &HashMap<String, Vec<f32>>,
) -> Result<u64, JudgeError> {
    let mut points = Vec::with_capacity(tropes.len());
    for t in tropes {
        let Some(vec) = vectors.get(&t.id) else {
            continue;
        };
        points.push(PointRecord {
            id: t.id.clone(),
            vector: vec.clone(),
            payload: serde_json::json!({
                "trope_id": t.id,
                "name": t.name,
                "work_id": work_id,
            }),
        });
    }
    let base = facade.config().trope_collection.clone();
    if let Some(dim) = points.first().map(|p| p.vector.len()) {
        facade.ensure_collection(&base, work_id, dim).await?;
    }
    let n = facade.upsert(&base, work_id, points).await?;
    debug!(points = n, "trope catalog mirrored");
    Ok(n)
}

/// Run semantic seeding for every trope. Fatal on persistent query
/// failure: without seeds there is nothing to judge.
pub async fn seed_semantic(
    cfg: &JudgeConfig,
    facade: &QdrantFacade,
    work_id: &str,
    tropes: &[TropeDef],
    trope_vectors: &HashMap<String, Vec<f32>>,
    chunks_by_id: &HashMap<String, Chunk>,
) -> Result<Vec<TropeCandidate>, JudgeError> {
    let base = facade.config().chunk_collection.clone();
    let mut out = Vec::new();

    for trope in tropes {
        let Some(vector) = trope_vectors.get(&trope.id) else {
            warn!(trope_id = %trope.id, "no vector for trope, skipping semantic seed");
            continue;
        };

        let hits = with_retry(
            "semantic seed query",
            3,
            || async {
                facade
                    .query(&base, work_id, vector.clone(), cfg.sem_top_n)
                    .await
            },
            is_transient_vector,
        )
        .await?;

        out.extend(hits_to_candidates(cfg, work_id, &trope.id, &hits, chunks_by_id));
    }

    debug!(candidates = out.len(), "semantic seeding complete");
    Ok(out)
}

/// Convert KNN hits for one trope into capped candidates.
///
/// Pure so the tau filter and per-scene cap are testable without a vector
/// store.
pub fn hits_to_candidates(
    cfg: &JudgeConfig,
    work_id: &str,
    trope_id: &str,
    hits: &[VectorHit],
    chunks_by_id: &HashMap<String, Chunk>,
) -> Vec<TropeCandidate> {
    // Group accepted hits per scene.
    let mut per_scene: HashMap<String, Vec<(&Chunk, f32)>> = HashMap::new();
    for hit in hits {
        let sim = hit.similarity();
        if sim < cfg.sem_tau {
            continue;
        }
        let Some(chunk) = chunks_by_id.get(&hit.id) else {
            warn!(chunk_id = %hit.id, "semantic hit references unknown chunk");
            continue;
        };
        per_scene
            .entry(chunk.scene_id.clone())
            .or_default()
            .push((chunk, sim));
    }

    let mut out = Vec::new();
    for (_, mut scored) in per_scene {
        // Highest score first; ties broken by lower chunk idx.
        scored.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| a.0.idx.cmp(&b.0.idx))
        });
        scored.truncate(cfg.sem_per_scene_cap);

        for (chunk, sim) in scored {
            out.push(TropeCandidate {
                id: Uuid::new_v4().to_string(),
                work_id: work_id.to_string(),
                scene_id: chunk.scene_id.clone(),
                chunk_id: Some(chunk.id.clone()),
                trope_id: trope_id.to_string(),
                start: chunk.char_start,
                end: chunk.char_end,
                source: CandidateSource::Semantic,
                score: sim,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use text_store::sha256_hex;

    fn cfg() -> JudgeConfig {
        JudgeConfig {
            threshold: 0.25,
            rerank_top_k: 8,
            rerank_keep_m: 3,
            trope_top_k: 16,
            downweight_no_mention: 0.55,
            sem_sim_threshold: 0.36,
            sem_tau: 0.70,
            sem_top_n: 8,
            sem_per_scene_cap: 2,
            span_verifier_threshold: 0.25,
            span_verifier_max_sent: 2,
            negation_mode: crate::cfg::NegationMode::Downweight,
            neg_downweight: 0.6,
            meta_downweight: 0.75,
            aa_downweight: 0.5,
            anti_window: 60,
            calibration_version: None,
            n_embed: 4,
            n_scenes: 2,
        }
    }

    fn chunk(id: &str, scene: &str, idx: i64, start: usize, end: usize) -> Chunk {
        Chunk {
            id: id.into(),
            work_id: "w1".into(),
            scene_id: scene.into(),
            idx,
            char_start: start,
            char_end: end,
            text: "x".into(),
            sha256: sha256_hex("x"),
        }
    }

    fn hit(id: &str, similarity: f32) -> VectorHit {
        VectorHit {
            id: id.into(),
            distance: 1.0 - similarity,
            payload: serde_json::json!({ "id": id }),
        }
    }

    #[test]
    fn hits_below_tau_are_dropped() {
        let chunks: HashMap<String, Chunk> =
            [("c1".to_string(), chunk("c1", "s1", 0, 0, 10))].into();
        let out = hits_to_candidates(&cfg(), "w1", "t1", &[hit("c1", 0.69)], &chunks);
        assert!(out.is_empty());
    }

    #[test]
    fn accepted_hit_uses_chunk_span_and_score() {
        let chunks: HashMap<String, Chunk> =
            [("c1".to_string(), chunk("c1", "s1", 0, 5, 42))].into();
        let out = hits_to_candidates(&cfg(), "w1", "t1", &[hit("c1", 0.82)], &chunks);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].start, 5);
        assert_eq!(out[0].end, 42);
        assert_eq!(out[0].source, CandidateSource::Semantic);
        assert!((out[0].score - 0.82).abs() < 1e-6);
    }

    #[test]
    fn per_scene_cap_keeps_best_with_idx_tiebreak() {
        let chunks: HashMap<String, Chunk> = [
            ("c1".to_string(), chunk("c1", "s1", 0, 0, 10)),
            ("c2".to_string(), chunk("c2", "s1", 1, 10, 20)),
            ("c3".to_string(), chunk("c3", "s1", 2, 20, 30)),
        ]
        .into();
        // c2 and c3 tie; the lower chunk idx (c2) must survive the cap.
        let hits = vec![hit("c1", 0.90), hit("c3", 0.80), hit("c2", 0.80)];
        let out = hits_to_candidates(&cfg(), "w1", "t1", &hits, &chunks);
        assert_eq!(out.len(), 2);
        let ids: Vec<_> = out.iter().filter_map(|c| c.chunk_id.clone()).collect();
        assert!(ids.contains(&"c1".to_string()));
        assert!(ids.contains(&"c2".to_string()));
    }
}
