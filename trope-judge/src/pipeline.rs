//! Serial per-work driver wiring the whole judging pipeline.
//!
//! Stage order per run:
//! 1) integrity check + run stamping
//! 2) gazetteer seeding, then semantic seeding (both fatal on failure)
//! 3) per-scene support selection → sanity priors → judge, fanned out with
//!    `buffer_unordered(N_SCENES)`; each scene's rows commit in a single
//!    transaction applied by this (single-writer) task
//! 4) span verification, then the negation post-pass, per finding
//!
//! Per-scene and per-finding failures degrade to audit rows or flags;
//! cancellation is cooperative and checked between units of work, so the
//! database never holds a half-written scene.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use text_store::{
    AuditRow, Chunk, Scene, SceneWrite, TextIndex, TropeDef, TropeStore, VerifierFlag,
    sha256_hex,
};
use vector_store::{EmbeddingsProvider, QdrantFacade, embed_many};

use crate::cfg::JudgeConfig;
use crate::errors::JudgeError;
use crate::gazetteer::GazetteerSet;
use crate::judge::{self, JudgeContext, SceneCandidate};
use crate::negation::{self, NegationAction};
use crate::prompt::PROMPT_VERSION;
use crate::reasoner::Reasoner;
use crate::retry::{is_transient_vector, with_retry};
use crate::sanity::{self, SanityInput};
use crate::seed;
use crate::support;
use crate::verify;

/// Cooperative whole-run cancellation signal.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn checkpoint(&self) -> Result<(), JudgeError> {
        if self.is_cancelled() {
            Err(JudgeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Counters reported after a run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub run_id: String,
    pub scenes_total: usize,
    pub scenes_with_candidates: usize,
    pub candidates_inserted: u64,
    pub findings_written: u64,
    pub findings_flagged: usize,
    pub findings_deleted: usize,
}

/// Run the judging pipeline for one work.
pub async fn run_work(
    store: &mut TropeStore,
    cfg: &JudgeConfig,
    facade: &QdrantFacade,
    embedder: &dyn EmbeddingsProvider,
    reasoner: &dyn Reasoner,
    work_id: &str,
    cancel: &CancelFlag,
) -> Result<RunSummary, JudgeError> {
    let t0 = std::time::Instant::now();

    // ---------------------------------------------------------------
    // Load + integrity. A chunk that disagrees with norm_text is fatal.
    // ---------------------------------------------------------------
    info!(work_id, "run: loading work");
    let work = store.load_work(work_id)?;
    store.verify_chunk_integrity(&work)?;
    let index = TextIndex::new(&work);
    let scenes = store.scenes_for_work(work_id)?;
    let chunks = store.chunks_for_work(work_id)?;
    let tropes = store.all_tropes()?;
    let thresholds = store.trope_thresholds()?;
    info!(
        scenes = scenes.len(),
        chunks = chunks.len(),
        tropes = tropes.len(),
        "run: inputs loaded"
    );

    let chunks_by_id: HashMap<String, Chunk> =
        chunks.iter().map(|c| (c.id.clone(), c.clone())).collect();
    let mut scene_chunks: HashMap<String, Vec<Chunk>> = HashMap::new();
    for c in &chunks {
        scene_chunks.entry(c.scene_id.clone()).or_default().push(c.clone());
    }

    // ---------------------------------------------------------------
    // Stamp the run before anything observable happens.
    // ---------------------------------------------------------------
    cancel.checkpoint()?;
    let run_id = stamp_run(store, cfg, facade, embedder, reasoner, &tropes, work_id)?;
    info!(run_id = %run_id, "run: stamped");

    // ---------------------------------------------------------------
    // Seeding. Both seeders are fatal: no candidates, nothing to judge.
    // ---------------------------------------------------------------
    let gazetteer = GazetteerSet::compile(&tropes)?;
    let gazetteer_cands = gazetteer.scan_work(&index, &chunks, cfg.anti_window);
    let mut candidates_inserted = store.insert_candidates(&gazetteer_cands)?;
    info!(
        emitted = gazetteer_cands.len(),
        "run: gazetteer seeding done"
    );

    cancel.checkpoint()?;
    let definition_texts: Vec<String> = tropes.iter().map(|t| t.definition_text()).collect();
    let vectors = embed_many(embedder, &definition_texts, cfg.n_embed).await?;
    let trope_vectors: HashMap<String, Vec<f32>> = tropes
        .iter()
        .zip(vectors)
        .map(|(t, v)| (t.id.clone(), v))
        .collect();

    // Catalog mirror is best-effort; the run keeps its in-memory vectors.
    if let Err(e) = seed::upsert_trope_catalog(facade, work_id, &tropes, &trope_vectors).await {
        warn!(error = %e, "trope catalog mirror failed, continuing");
    }

    cancel.checkpoint()?;
    let semantic_cands = seed::seed_semantic(
        cfg,
        facade,
        work_id,
        &tropes,
        &trope_vectors,
        &chunks_by_id,
    )
    .await?;
    candidates_inserted += store.insert_candidates(&semantic_cands)?;
    info!(emitted = semantic_cands.len(), "run: semantic seeding done");

    let per_scene = group_candidates(gazetteer_cands.iter().chain(semantic_cands.iter()));

    // ---------------------------------------------------------------
    // Per-scene pipeline: supports → sanity → judge, then one commit.
    // ---------------------------------------------------------------
    let defs_by_id: HashMap<String, TropeDef> =
        tropes.iter().map(|t| (t.id.clone(), t.clone())).collect();

    let ctx = SceneCtx {
        cfg,
        facade,
        embedder,
        reasoner,
        gazetteer: &gazetteer,
        index: &index,
        work_id,
        run_id: &run_id,
        chunks_by_id: &chunks_by_id,
        scene_chunks: &scene_chunks,
        defs_by_id: &defs_by_id,
        trope_vectors: &trope_vectors,
        thresholds: &thresholds,
    };

    let jobs: Vec<(Scene, HashMap<String, f32>)> = scenes
        .iter()
        .filter_map(|s| per_scene.get(&s.id).map(|c| (s.clone(), c.clone())))
        .collect();
    let scenes_with_candidates = jobs.len();
    info!(
        scenes = scenes.len(),
        with_candidates = scenes_with_candidates,
        "run: judging scenes"
    );

    let mut findings_written = 0u64;
    {
        let mut writes = stream::iter(jobs.into_iter().map(|(scene, cands)| {
            let ctx = &ctx;
            async move { scene_task(ctx, scene, cands).await }
        }))
        .buffer_unordered(cfg.n_scenes);

        while let Some(write) = writes.next().await {
            cancel.checkpoint()?;
            findings_written += store.apply_scene(&write)?;
        }
    }
    info!(findings = findings_written, "run: judging complete");

    // ---------------------------------------------------------------
    // Span verification. Per-finding failures leave a flag, not a hole.
    // ---------------------------------------------------------------
    let scenes_by_id: HashMap<String, Scene> =
        scenes.iter().map(|s| (s.id.clone(), s.clone())).collect();

    for finding in store.findings_for_run(&run_id)? {
        cancel.checkpoint()?;
        let (Some(scene), Some(trope_vector)) = (
            scenes_by_id.get(&finding.scene_id),
            trope_vectors.get(&finding.trope_id),
        ) else {
            continue;
        };

        let scene_text = index.slice(scene.char_start, scene.char_end);
        let verified = async {
            let scene_vector = embedder.embed(scene_text).await?;
            verify::verify_span(
                cfg,
                embedder,
                &index,
                scene,
                finding.evidence_start,
                finding.evidence_end,
                trope_vector,
                &scene_vector,
            )
            .await
        }
        .await;

        match verified {
            Ok(v) => {
                let update = store.update_finding_verification(
                    &finding.id,
                    v.evidence_start,
                    v.evidence_end,
                    v.verifier_score,
                    None,
                );
                match update {
                    Ok(()) => {}
                    // A snapped span may collide with an existing finding's
                    // unique span index; keep the original span then.
                    Err(e) if e.is_constraint_violation() => {
                        store.update_finding_verification(
                            &finding.id,
                            finding.evidence_start,
                            finding.evidence_end,
                            v.verifier_score,
                            None,
                        )?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => {
                warn!(finding_id = %finding.id, error = %e, "span verification failed");
                // Leave the finding as-is, only flagged.
                store.update_finding_confidence(
                    &finding.id,
                    finding.confidence,
                    Some(VerifierFlag::VerifyError),
                )?;
                store.insert_audit(&AuditRow {
                    run_id: run_id.clone(),
                    scene_id: Some(finding.scene_id.clone()),
                    kind: "verify_error".into(),
                    detail: format!("finding={} {e}", finding.id),
                })?;
            }
        }
    }
    info!("run: span verification complete");

    // ---------------------------------------------------------------
    // Negation / meta / anti-alias post-pass.
    // ---------------------------------------------------------------
    let mut findings_flagged = 0usize;
    let mut findings_deleted = 0usize;
    for finding in store.findings_for_run(&run_id)? {
        cancel.checkpoint()?;
        let matcher = gazetteer.matcher_for(&finding.trope_id);
        let cues = negation::scan_cues(cfg, &index, finding.evidence_start, matcher);
        match negation::apply_policy(cfg.negation_mode, finding.confidence, cues) {
            NegationAction::Keep => {}
            NegationAction::Flag(flag) => {
                store.update_finding_confidence(&finding.id, finding.confidence, Some(flag))?;
                findings_flagged += 1;
            }
            NegationAction::Downweight { confidence, flag } => {
                // Retained even when it drops below threshold_used.
                store.update_finding_confidence(&finding.id, confidence, Some(flag))?;
                findings_flagged += 1;
            }
            NegationAction::Delete => {
                store.delete_finding(&finding.id)?;
                findings_deleted += 1;
            }
        }
    }
    info!(
        flagged = findings_flagged,
        deleted = findings_deleted,
        elapsed_ms = t0.elapsed().as_millis(),
        "run: complete"
    );

    Ok(RunSummary {
        run_id,
        scenes_total: scenes.len(),
        scenes_with_candidates,
        candidates_inserted,
        findings_written,
        findings_flagged,
        findings_deleted,
    })
}

/// Group candidates per scene, keeping each trope's best seed score.
pub fn group_candidates<'a>(
    candidates: impl Iterator<Item = &'a text_store::TropeCandidate>,
) -> HashMap<String, HashMap<String, f32>> {
    let mut out: HashMap<String, HashMap<String, f32>> = HashMap::new();
    for c in candidates {
        let entry = out
            .entry(c.scene_id.clone())
            .or_default()
            .entry(c.trope_id.clone())
            .or_insert(f32::MIN);
        *entry = entry.max(c.score);
    }
    out
}

/// Canonical SHA-256 over the trope catalog, stamped into run params.
pub fn catalog_sha(tropes: &[TropeDef]) -> String {
    let mut sorted: Vec<&TropeDef> = tropes.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    let mut acc = String::new();
    for t in sorted {
        acc.push_str(&t.id);
        acc.push('\x1f');
        acc.push_str(&t.name);
        acc.push('\x1f');
        acc.push_str(&t.summary);
        acc.push('\x1f');
        acc.push_str(&t.aliases.join("\x1e"));
        acc.push('\x1f');
        acc.push_str(&t.anti_aliases.join("\x1e"));
        acc.push('\n');
    }
    sha256_hex(&acc)
}

/// Insert the `run` row capturing every input that shapes the output.
fn stamp_run(
    store: &TropeStore,
    cfg: &JudgeConfig,
    facade: &QdrantFacade,
    embedder: &dyn EmbeddingsProvider,
    reasoner: &dyn Reasoner,
    tropes: &[TropeDef],
    work_id: &str,
) -> Result<String, JudgeError> {
    let run_id = Uuid::new_v4().to_string();
    let vcfg = facade.config();
    let params = serde_json::json!({
        "work_id": work_id,
        "prompt_version": PROMPT_VERSION,
        "reasoner_model": reasoner.model(),
        "embedding_model": embedder.model(),
        "chunk_collection": vcfg.chunk_collection,
        "trope_collection": vcfg.trope_collection,
        "per_work_collections": vcfg.per_work_collections,
        "catalog_sha": catalog_sha(tropes),
        "threshold": cfg.threshold,
        "rerank_top_k": cfg.rerank_top_k,
        "rerank_keep_m": cfg.rerank_keep_m,
        "trope_top_k": cfg.trope_top_k,
        "downweight_no_mention": cfg.downweight_no_mention,
        "sem_sim_threshold": cfg.sem_sim_threshold,
        "sem_tau": cfg.sem_tau,
        "sem_top_n": cfg.sem_top_n,
        "sem_per_scene_cap": cfg.sem_per_scene_cap,
        "span_verifier_threshold": cfg.span_verifier_threshold,
        "span_verifier_max_sent": cfg.span_verifier_max_sent,
        "negation_mode": cfg.negation_mode.as_str(),
        "neg_downweight": cfg.neg_downweight,
        "meta_downweight": cfg.meta_downweight,
        "aa_downweight": cfg.aa_downweight,
        "anti_window": cfg.anti_window,
        "calibration_version": cfg.calibration_version,
        "n_embed": cfg.n_embed,
        "n_scenes": cfg.n_scenes,
    });
    store.insert_run(
        &run_id,
        &chrono::Utc::now().to_rfc3339(),
        &serde_json::to_string(&params)?,
    )?;
    Ok(run_id)
}

/// Shared references for the per-scene tasks.
struct SceneCtx<'a> {
    cfg: &'a JudgeConfig,
    facade: &'a QdrantFacade,
    embedder: &'a dyn EmbeddingsProvider,
    reasoner: &'a dyn Reasoner,
    gazetteer: &'a GazetteerSet,
    index: &'a TextIndex,
    work_id: &'a str,
    run_id: &'a str,
    chunks_by_id: &'a HashMap<String, Chunk>,
    scene_chunks: &'a HashMap<String, Vec<Chunk>>,
    defs_by_id: &'a HashMap<String, TropeDef>,
    trope_vectors: &'a HashMap<String, Vec<f32>>,
    thresholds: &'a HashMap<String, f32>,
}

fn audit(ctx: &SceneCtx<'_>, scene_id: &str, kind: &str, detail: String) -> AuditRow {
    AuditRow {
        run_id: ctx.run_id.to_string(),
        scene_id: Some(scene_id.to_string()),
        kind: kind.to_string(),
        detail,
    }
}

/// Compute one scene's full output. Never fails: errors degrade to audit
/// rows inside the returned write.
async fn scene_task(
    ctx: &SceneCtx<'_>,
    scene: Scene,
    cand_scores: HashMap<String, f32>,
) -> SceneWrite {
    let mut write = SceneWrite {
        scene_id: scene.id.clone(),
        ..Default::default()
    };
    let scene_text = ctx.index.slice(scene.char_start, scene.char_end);
    debug!(scene_id = %scene.id, idx = scene.idx, tropes = cand_scores.len(), "scene: start");

    // Scene embedding feeds both support retrieval and the sanity prior.
    let scene_vector = match with_retry(
        "scene embed",
        3,
        || async { ctx.embedder.embed(scene_text).await },
        is_transient_vector,
    )
    .await
    {
        Ok(v) => v,
        Err(e) => {
            warn!(scene_id = %scene.id, error = %e, "scene embedding failed, skipping scene");
            write.audits.push(audit(ctx, &scene.id, "scene_embed_error", e.to_string()));
            return write;
        }
    };

    // Support selection (stage-2 failures degrade internally).
    let supports = match support::select_supports(
        ctx.cfg,
        ctx.facade,
        ctx.reasoner,
        ctx.work_id,
        &scene,
        scene_text,
        &scene_vector,
        ctx.chunks_by_id,
    )
    .await
    {
        Ok(s) => s,
        Err(e) => {
            warn!(scene_id = %scene.id, error = %e, "support selection failed, skipping scene");
            write.audits.push(audit(ctx, &scene.id, "support_error", e.to_string()));
            return write;
        }
    };
    write.supports = supports.rows.clone();

    // Vectors for the picked supports feed the semantic sanity gate.
    let picked_texts: Vec<String> = supports.picked.iter().map(|c| c.text.clone()).collect();
    let picked_vectors = match embed_many(ctx.embedder, &picked_texts, ctx.cfg.n_embed).await {
        Ok(v) => v,
        Err(e) => {
            warn!(scene_id = %scene.id, error = %e, "support embedding failed, skipping scene");
            write.audits.push(audit(ctx, &scene.id, "sanity_error", e.to_string()));
            return write;
        }
    };
    let support_pairs: Vec<(Chunk, Vec<f32>)> = supports
        .picked
        .iter()
        .cloned()
        .zip(picked_vectors)
        .collect();

    let trope_vec_pairs: Vec<(&str, &[f32])> = cand_scores
        .keys()
        .filter_map(|id| {
            ctx.trope_vectors
                .get(id)
                .map(|v| (id.as_str(), v.as_slice()))
        })
        .collect();
    let sanity_rows = sanity::compute_sanity(
        ctx.cfg,
        ctx.gazetteer,
        &SanityInput {
            scene_id: &scene.id,
            scene_text,
            scene_vector: &scene_vector,
            supports: &support_pairs,
        },
        &trope_vec_pairs,
    );
    write.sanity = sanity_rows.clone();

    // Assemble the judge's candidate set from seeds + priors.
    let candidates: Vec<SceneCandidate> = sanity_rows
        .iter()
        .filter_map(|s| {
            let def = ctx.defs_by_id.get(&s.trope_id)?;
            Some(SceneCandidate {
                trope_id: s.trope_id.clone(),
                name: def.name.clone(),
                summary: def.summary.clone(),
                seed_score: cand_scores.get(&s.trope_id).copied().unwrap_or(0.0),
                lex_ok: s.lex_ok,
                sem_sim: s.sem_sim,
                weight: s.weight,
            })
        })
        .collect();

    let empty = Vec::new();
    let jctx = JudgeContext {
        cfg: ctx.cfg,
        run_id: ctx.run_id,
        model: ctx.reasoner.model(),
        work_id: ctx.work_id,
        scene: &scene,
        scene_text,
        supports: &supports.picked,
        candidates: &candidates,
        per_trope_thresholds: ctx.thresholds,
        scene_chunks: ctx.scene_chunks.get(&scene.id).unwrap_or(&empty),
    };

    match judge::judge_scene(&jctx, ctx.reasoner).await {
        Ok(outcome) => {
            write.findings = outcome.findings;
            write.audits.extend(outcome.audits);
        }
        Err(JudgeError::MalformedModelOutput(detail)) => {
            // The whole scene is skipped; no partial findings.
            warn!(scene_id = %scene.id, %detail, "judge output malformed, scene skipped");
            write.audits.push(audit(ctx, &scene.id, "judge_parse_error", detail));
        }
        Err(e) => {
            warn!(scene_id = %scene.id, error = %e, "judge failed, scene skipped");
            write.audits.push(audit(ctx, &scene.id, "judge_error", e.to_string()));
        }
    }

    debug!(
        scene_id = %scene.id,
        findings = write.findings.len(),
        audits = write.audits.len(),
        "scene: done"
    );
    write
}

#[cfg(test)]
mod tests {
    use super::*;
    use text_store::{CandidateSource, TropeCandidate};

    fn cand(scene: &str, trope: &str, score: f32) -> TropeCandidate {
        TropeCandidate {
            id: Uuid::new_v4().to_string(),
            work_id: "w1".into(),
            scene_id: scene.into(),
            chunk_id: None,
            trope_id: trope.into(),
            start: 0,
            end: 1,
            source: CandidateSource::Gazetteer,
            score,
        }
    }

    #[test]
    fn grouping_keeps_best_score_per_trope() {
        let cands = vec![
            cand("s1", "t1", 1.0),
            cand("s1", "t1", 0.8),
            cand("s1", "t2", 0.75),
            cand("s2", "t1", 0.9),
        ];
        let grouped = group_candidates(cands.iter());
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["s1"]["t1"], 1.0);
        assert_eq!(grouped["s1"]["t2"], 0.75);
        assert_eq!(grouped["s2"]["t1"], 0.9);
    }

    #[test]
    fn catalog_sha_is_order_independent() {
        let a = TropeDef {
            id: "a".into(),
            name: "A".into(),
            summary: "sa".into(),
            aliases: vec!["x".into()],
            anti_aliases: vec![],
            source_url: None,
            group: None,
        };
        let b = TropeDef {
            id: "b".into(),
            name: "B".into(),
            summary: "sb".into(),
            aliases: vec![],
            anti_aliases: vec!["y".into()],
            source_url: None,
            group: None,
        };
        assert_eq!(
            catalog_sha(&[a.clone(), b.clone()]),
            catalog_sha(&[b, a])
        );
    }

    #[test]
    fn catalog_sha_changes_with_content() {
        let mut t = TropeDef {
            id: "a".into(),
            name: "A".into(),
            summary: "sa".into(),
            aliases: vec![],
            anti_aliases: vec![],
            source_url: None,
            group: None,
        };
        let before = catalog_sha(std::slice::from_ref(&t));
        t.aliases.push("new alias".into());
        assert_ne!(before, catalog_sha(&[t]));
    }

    #[test]
    fn cancel_flag_trips_checkpoint() {
        let flag = CancelFlag::new();
        assert!(flag.checkpoint().is_ok());
        flag.cancel();
        assert!(matches!(flag.checkpoint(), Err(JudgeError::Cancelled)));
    }
}
