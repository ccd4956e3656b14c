//! The judge: prompt the reasoner with a scene, its supports, and the
//! shortlisted candidates, then accept findings under the priors.
//!
//! The model's confidences are never trusted as-is: each is multiplied by
//! the sanity weight, and only `adjusted >= threshold_used` survives.
//! A span outside the scene rejects that finding with a `bad_span` audit;
//! malformed output fails the whole scene with no partial findings.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use text_store::{AuditRow, Chunk, FindingLevel, Scene, TropeFinding};

use crate::cfg::JudgeConfig;
use crate::errors::JudgeError;
use crate::prompt::{self, JudgeCandidateView};
use crate::reasoner::Reasoner;
use crate::retry::{is_transient_judge, with_retry};

/// One shortlist entry: the trope, its best seed score, and its priors.
#[derive(Debug, Clone)]
pub struct SceneCandidate {
    pub trope_id: String,
    pub name: String,
    pub summary: String,
    pub seed_score: f32,
    pub lex_ok: bool,
    pub sem_sim: f32,
    pub weight: f32,
}

/// Everything the judge needs for one scene.
pub struct JudgeContext<'a> {
    pub cfg: &'a JudgeConfig,
    pub run_id: &'a str,
    pub model: &'a str,
    pub work_id: &'a str,
    pub scene: &'a Scene,
    pub scene_text: &'a str,
    pub supports: &'a [Chunk],
    pub candidates: &'a [SceneCandidate],
    /// Per-trope thresholds from active learning; absent tropes use the
    /// global threshold.
    pub per_trope_thresholds: &'a HashMap<String, f32>,
    /// Chunks of this scene, for evidence→chunk attribution.
    pub scene_chunks: &'a [Chunk],
}

/// Findings accepted for the scene plus audits for rejected ones.
#[derive(Debug, Default)]
pub struct JudgeOutcome {
    pub findings: Vec<TropeFinding>,
    pub audits: Vec<AuditRow>,
}

/// One raw entry of the model's JSON list.
#[derive(Debug, Deserialize)]
pub struct RawFinding {
    pub trope_id: String,
    pub confidence: f32,
    pub evidence_start: i64,
    pub evidence_end: i64,
    pub rationale: String,
}

#[derive(Debug, Deserialize)]
struct WrappedFindings {
    findings: Vec<RawFinding>,
}

/// Judge one scene end to end.
///
/// # Errors
/// - transport failures after retries propagate;
/// - [`JudgeError::MalformedModelOutput`] when the response violates the
///   contract — the caller must skip the scene with one audit row.
pub async fn judge_scene(
    ctx: &JudgeContext<'_>,
    reasoner: &dyn Reasoner,
) -> Result<JudgeOutcome, JudgeError> {
    let shortlist = shortlist(ctx.cfg, ctx.candidates);
    if shortlist.is_empty() {
        debug!(scene_id = %ctx.scene.id, "no candidates to judge");
        return Ok(JudgeOutcome::default());
    }

    let views: Vec<JudgeCandidateView<'_>> = shortlist
        .iter()
        .map(|c| JudgeCandidateView {
            trope_id: &c.trope_id,
            name: &c.name,
            summary: &c.summary,
            lex_ok: c.lex_ok,
            sem_sim: c.sem_sim,
            weight: c.weight,
        })
        .collect();
    let supports: Vec<(&str, &str)> = ctx
        .supports
        .iter()
        .map(|c| (c.id.as_str(), c.text.as_str()))
        .collect();
    let prompt = prompt::build_judge_prompt(
        ctx.scene_text,
        ctx.scene.char_start,
        ctx.scene.char_end,
        &supports,
        &views,
    );

    let raw = with_retry(
        "judge",
        3,
        || async { reasoner.complete_json(&prompt).await },
        is_transient_judge,
    )
    .await?;

    let parsed = parse_findings(&raw)?;
    Ok(evaluate_findings(ctx, &shortlist, parsed))
}

/// Cap the candidate set at `TROPE_TOP_K` by `weight * (score + sem_sim)`.
pub fn shortlist(cfg: &JudgeConfig, candidates: &[SceneCandidate]) -> Vec<SceneCandidate> {
    let mut out: Vec<SceneCandidate> = candidates.to_vec();
    out.sort_by(|a, b| {
        let ka = a.weight * (a.seed_score + a.sem_sim);
        let kb = b.weight * (b.seed_score + b.sem_sim);
        kb.total_cmp(&ka).then_with(|| a.trope_id.cmp(&b.trope_id))
    });
    out.truncate(cfg.trope_top_k);
    out
}

/// Parse the judge response: a bare JSON list, or an object wrapping it
/// under `findings` (common in constrained JSON mode).
pub fn parse_findings(raw: &str) -> Result<Vec<RawFinding>, JudgeError> {
    let trimmed = raw.trim();
    if let Ok(list) = serde_json::from_str::<Vec<RawFinding>>(trimmed) {
        return Ok(list);
    }
    serde_json::from_str::<WrappedFindings>(trimmed)
        .map(|w| w.findings)
        .map_err(|e| JudgeError::MalformedModelOutput(format!("judge: {e}")))
}

/// Validate raw findings against spans and priors; build rows.
pub fn evaluate_findings(
    ctx: &JudgeContext<'_>,
    shortlist: &[SceneCandidate],
    raw: Vec<RawFinding>,
) -> JudgeOutcome {
    let mut out = JudgeOutcome::default();

    for rf in raw {
        let Some(candidate) = shortlist.iter().find(|c| c.trope_id == rf.trope_id) else {
            warn!(scene_id = %ctx.scene.id, trope_id = %rf.trope_id, "judge returned trope outside the shortlist");
            continue;
        };

        // Span arithmetic: reject, never abort.
        let start = rf.evidence_start;
        let end = rf.evidence_end;
        let in_scene = start >= 0
            && end >= start
            && (start as usize) >= ctx.scene.char_start
            && (end as usize) <= ctx.scene.char_end;
        if !in_scene {
            out.audits.push(AuditRow {
                run_id: ctx.run_id.to_string(),
                scene_id: Some(ctx.scene.id.clone()),
                kind: "bad_span".to_string(),
                detail: format!(
                    "trope={} span=[{start}, {end}) scene=[{}, {})",
                    rf.trope_id, ctx.scene.char_start, ctx.scene.char_end
                ),
            });
            continue;
        }
        let (start, end) = (start as usize, end as usize);

        let confidence = rf.confidence.clamp(0.0, 1.0);
        let adjusted = confidence * candidate.weight;
        let threshold_used = ctx
            .per_trope_thresholds
            .get(&rf.trope_id)
            .copied()
            .unwrap_or(ctx.cfg.threshold);

        if adjusted < threshold_used {
            debug!(
                scene_id = %ctx.scene.id,
                trope_id = %rf.trope_id,
                adjusted,
                threshold_used,
                "finding below threshold, dropped"
            );
            continue;
        }

        let chunk_id = ctx
            .scene_chunks
            .iter()
            .find(|c| c.char_start <= start && start < c.char_end)
            .map(|c| c.id.clone());

        out.findings.push(TropeFinding {
            id: Uuid::new_v4().to_string(),
            work_id: ctx.work_id.to_string(),
            scene_id: ctx.scene.id.clone(),
            chunk_id,
            trope_id: rf.trope_id,
            level: FindingLevel::Span,
            confidence: adjusted,
            rationale: rf.rationale,
            evidence_start: start,
            evidence_end: end,
            model: ctx.model.to_string(),
            verifier_score: None,
            verifier_flag: None,
            calibration_version: ctx.cfg.calibration_version.clone(),
            threshold_used,
            run_id: ctx.run_id.to_string(),
        });
    }

    debug!(
        scene_id = %ctx.scene.id,
        accepted = out.findings.len(),
        rejected = out.audits.len(),
        "judge evaluation complete"
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(threshold: f32) -> JudgeConfig {
        JudgeConfig {
            threshold,
            rerank_top_k: 8,
            rerank_keep_m: 3,
            trope_top_k: 2,
            downweight_no_mention: 0.55,
            sem_sim_threshold: 0.36,
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

    fn scene() -> Scene {
        Scene {
            id: "s1".into(),
            work_id: "w1".into(),
            idx: 0,
            char_start: 100,
            char_end: 400,
        }
    }

    fn candidate(trope_id: &str, weight: f32) -> SceneCandidate {
        SceneCandidate {
            trope_id: trope_id.into(),
            name: trope_id.into(),
            summary: "s".into(),
            seed_score: 1.0,
            lex_ok: true,
            sem_sim: 0.5,
            weight,
        }
    }

    fn ctx<'a>(
        cfg: &'a JudgeConfig,
        scene: &'a Scene,
        candidates: &'a [SceneCandidate],
        thresholds: &'a HashMap<String, f32>,
    ) -> JudgeContext<'a> {
        JudgeContext {
            cfg,
            run_id: "r1",
            model: "test-model",
            work_id: "w1",
            scene,
            scene_text: "text",
            supports: &[],
            candidates,
            per_trope_thresholds: thresholds,
            scene_chunks: &[],
        }
    }

    fn raw(trope_id: &str, confidence: f32, start: i64, end: i64) -> RawFinding {
        RawFinding {
            trope_id: trope_id.into(),
            confidence,
            evidence_start: start,
            evidence_end: end,
            rationale: "because".into(),
        }
    }

    #[test]
    fn span_outside_scene_is_rejected_with_audit() {
        let cfg = cfg(0.25);
        let scene = scene();
        let cands = vec![candidate("t1", 1.0)];
        let thresholds = HashMap::new();
        let out = evaluate_findings(
            &ctx(&cfg, &scene, &cands, &thresholds),
            &cands,
            vec![raw("t1", 0.9, 50, 120)],
        );
        assert!(out.findings.is_empty());
        assert_eq!(out.audits.len(), 1);
        assert_eq!(out.audits[0].kind, "bad_span");
    }

    #[test]
    fn adjusted_confidence_is_compared_to_threshold() {
        let scene = scene();
        let cands = vec![candidate("t1", 0.55)];
        let thresholds = HashMap::new();

        // 0.8 * 0.55 = 0.44: written at threshold 0.25, dropped at 0.5.
        let low = cfg(0.25);
        let out = evaluate_findings(
            &ctx(&low, &scene, &cands, &thresholds),
            &cands,
            vec![raw("t1", 0.8, 120, 160)],
        );
        assert_eq!(out.findings.len(), 1);
        assert!((out.findings[0].confidence - 0.44).abs() < 1e-6);
        assert_eq!(out.findings[0].threshold_used, 0.25);

        let high = cfg(0.5);
        let out = evaluate_findings(
            &ctx(&high, &scene, &cands, &thresholds),
            &cands,
            vec![raw("t1", 0.8, 120, 160)],
        );
        assert!(out.findings.is_empty());
    }

    #[test]
    fn per_trope_threshold_overrides_global() {
        let cfg = cfg(0.25);
        let scene = scene();
        let cands = vec![candidate("t1", 1.0)];
        let thresholds: HashMap<String, f32> = [("t1".to_string(), 0.95)].into();
        let out = evaluate_findings(
            &ctx(&cfg, &scene, &cands, &thresholds),
            &cands,
            vec![raw("t1", 0.9, 120, 160)],
        );
        assert!(out.findings.is_empty(), "0.9 < per-trope 0.95");
    }

    #[test]
    fn shortlist_caps_by_prior_weighted_score() {
        let cfg = cfg(0.25);
        let cands = vec![
            candidate("a", 1.0),
            candidate("b", 0.55),
            candidate("c", 0.9),
        ];
        let short = shortlist(&cfg, &cands);
        assert_eq!(short.len(), 2);
        assert_eq!(short[0].trope_id, "a");
        assert_eq!(short[1].trope_id, "c");
    }

    #[test]
    fn parse_accepts_bare_list_and_wrapper() {
        let bare = r#"[{"trope_id":"t","confidence":0.5,"evidence_start":0,"evidence_end":2,"rationale":"r"}]"#;
        assert_eq!(parse_findings(bare).unwrap().len(), 1);

        let wrapped = format!(r#"{{"findings": {bare}}}"#);
        assert_eq!(parse_findings(&wrapped).unwrap().len(), 1);

        assert!(matches!(
            parse_findings("sorry, I cannot"),
            Err(JudgeError::MalformedModelOutput(_))
        ));
    }

    #[test]
    fn empty_list_is_a_valid_answer() {
        assert!(parse_findings("[]").unwrap().is_empty());
    }
}
