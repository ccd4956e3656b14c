//! Per-(scene, trope) sanity priors: a lexical gate plus a semantic gate.
//!
//! `lex_ok` reuses the gazetteer matcher read-only (no anti-suppression);
//! `sem_sim` is the best cosine between the trope definition vector and
//! the scene/support vectors. A trope failing both gates gets the
//! `DOWNWEIGHT_NO_MENTION` prior; everything else keeps weight 1.0.

use tracing::debug;

use text_store::{Chunk, TropeSanity};
use vector_store::cosine;

use crate::cfg::JudgeConfig;
use crate::gazetteer::GazetteerSet;

/// Everything needed to compute priors for one scene.
pub struct SanityInput<'a> {
    pub scene_id: &'a str,
    pub scene_text: &'a str,
    pub scene_vector: &'a [f32],
    /// Picked supports with their embedding vectors.
    pub supports: &'a [(Chunk, Vec<f32>)],
}

/// Compute priors for the given candidate tropes of one scene.
pub fn compute_sanity(
    cfg: &JudgeConfig,
    gazetteer: &GazetteerSet,
    input: &SanityInput<'_>,
    tropes: &[(&str, &[f32])],
) -> Vec<TropeSanity> {
    let mut out = Vec::with_capacity(tropes.len());
    for (trope_id, trope_vector) in tropes {
        let lex_ok = match gazetteer.matcher_for(trope_id) {
            Some(matcher) => {
                matcher.mentions(input.scene_text)
                    || input
                        .supports
                        .iter()
                        .any(|(chunk, _)| matcher.mentions(&chunk.text))
            }
            None => false,
        };

        let mut sem_sim = cosine(trope_vector, input.scene_vector);
        for (_, support_vector) in input.supports {
            sem_sim = sem_sim.max(cosine(trope_vector, support_vector));
        }

        let weight = if !lex_ok && sem_sim < cfg.sem_sim_threshold {
            cfg.downweight_no_mention
        } else {
            1.0
        };

        out.push(TropeSanity {
            scene_id: input.scene_id.to_string(),
            trope_id: trope_id.to_string(),
            lex_ok,
            sem_sim,
            weight,
        });
    }

    debug!(
        scene_id = input.scene_id,
        tropes = out.len(),
        downweighted = out.iter().filter(|s| s.weight < 1.0).count(),
        "sanity priors computed"
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use text_store::{TropeDef, sha256_hex};

    fn cfg_with_threshold(sem_sim_threshold: f32) -> JudgeConfig {
        JudgeConfig {
            threshold: 0.25,
            rerank_top_k: 8,
            rerank_keep_m: 3,
            trope_top_k: 16,
            downweight_no_mention: 0.55,
            sem_sim_threshold,
            sem_tau: 0.70,
            sem_top_n: 8,
            sem_per_scene_cap: 3,
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

    fn trope(id: &str, name: &str) -> TropeDef {
        TropeDef {
            id: id.into(),
            name: name.into(),
            summary: "s".into(),
            aliases: vec![],
            anti_aliases: vec![],
            source_url: None,
            group: None,
        }
    }

    fn support(text: &str) -> (Chunk, Vec<f32>) {
        (
            Chunk {
                id: "c1".into(),
                work_id: "w1".into(),
                scene_id: "s1".into(),
                idx: 0,
                char_start: 0,
                char_end: text.chars().count(),
                text: text.into(),
                sha256: sha256_hex(text),
            },
            vec![0.0, 1.0],
        )
    }

    #[test]
    fn mention_in_support_sets_lex_ok() {
        let tropes = vec![trope("t1", "Whodunit")];
        let gaz = GazetteerSet::compile(&tropes).unwrap();
        let supports = vec![support("a classic whodunit setup")];
        let input = SanityInput {
            scene_id: "s1",
            scene_text: "no mention here",
            scene_vector: &[1.0, 0.0],
            supports: &supports,
        };
        let out = compute_sanity(&cfg_with_threshold(0.36), &gaz, &input, &[("t1", &[1.0, 0.0])]);
        assert!(out[0].lex_ok);
        assert_eq!(out[0].weight, 1.0);
    }

    #[test]
    fn no_mention_low_similarity_downweights() {
        let tropes = vec![trope("t1", "Whodunit")];
        let gaz = GazetteerSet::compile(&tropes).unwrap();
        let input = SanityInput {
            scene_id: "s1",
            scene_text: "a quiet dinner",
            scene_vector: &[0.0, 1.0],
            supports: &[],
        };
        // Orthogonal vectors: sem_sim = 0 < 0.36.
        let out = compute_sanity(&cfg_with_threshold(0.36), &gaz, &input, &[("t1", &[1.0, 0.0])]);
        assert!(!out[0].lex_ok);
        assert!((out[0].weight - 0.55).abs() < 1e-6);
    }

    #[test]
    fn semantic_gate_alone_keeps_full_weight() {
        let tropes = vec![trope("t1", "Whodunit")];
        let gaz = GazetteerSet::compile(&tropes).unwrap();
        let input = SanityInput {
            scene_id: "s1",
            scene_text: "a quiet dinner",
            scene_vector: &[1.0, 0.0],
            supports: &[],
        };
        // Identical vectors: sem_sim = 1.0 >= threshold.
        let out = compute_sanity(&cfg_with_threshold(0.36), &gaz, &input, &[("t1", &[1.0, 0.0])]);
        assert!(!out[0].lex_ok);
        assert_eq!(out[0].weight, 1.0);
    }

    #[test]
    fn raising_threshold_only_shrinks_full_weight_set() {
        let tropes = vec![trope("t1", "Whodunit"), trope("t2", "Red Herring")];
        let gaz = GazetteerSet::compile(&tropes).unwrap();
        let input = SanityInput {
            scene_id: "s1",
            scene_text: "a quiet dinner",
            scene_vector: &[1.0, 0.0],
            supports: &[],
        };
        let t1v = [1.0f32, 0.0];
        let t2v = [0.8f32, 0.6];
        let tropes_in: Vec<(&str, &[f32])> = vec![("t1", &t1v), ("t2", &t2v)];

        let mut prev_full = usize::MAX;
        for threshold in [0.0f32, 0.5, 0.9, 1.0] {
            let out = compute_sanity(&cfg_with_threshold(threshold), &gaz, &input, &tropes_in);
            let full = out.iter().filter(|s| s.weight == 1.0).count();
            assert!(full <= prev_full, "weight=1 count must be monotonic");
            prev_full = full;
        }
    }
}
