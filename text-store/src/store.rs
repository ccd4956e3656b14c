//! The store facade: all reads and writes against the SQLite database.
//!
//! Write discipline:
//! - Everything produced for one scene (support rows, sanity priors,
//!   findings, audits) commits in a **single transaction**, so a crash or
//!   cancellation never leaves a half-written scene behind.
//! - Candidate and finding inserts use `INSERT OR IGNORE`; a unique-index
//!   hit is benign dedup, not an error.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Row, params};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::errors::StoreError;
use crate::index::slice_codepoints;
use crate::models::{
    AuditRow, CandidateSource, Chunk, FindingLevel, Scene, SupportRow, TropeCandidate, TropeDef,
    TropeFinding, TropeSanity, VerifierFlag, Work,
};
use crate::schema;

/// Everything the pipeline produced for one scene, committed atomically.
#[derive(Debug, Clone, Default)]
pub struct SceneWrite {
    pub scene_id: String,
    pub supports: Vec<SupportRow>,
    pub sanity: Vec<TropeSanity>,
    pub findings: Vec<TropeFinding>,
    pub audits: Vec<AuditRow>,
}

/// Facade over the SQLite connection. Single writer; readers may attach
/// their own connections under WAL.
pub struct TropeStore {
    conn: Connection,
}

impl TropeStore {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        schema::init_schema(&conn)?;
        info!("store opened at {:?}", path.as_ref());
        Ok(Self { conn })
    }

    /// In-memory store, used by tests and fixtures.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    /* ---------------------------- reads ---------------------------- */

    pub fn load_work(&self, work_id: &str) -> Result<Work, StoreError> {
        self.conn
            .query_row(
                "SELECT id, title, author, norm_text, char_count FROM work WHERE id = ?1",
                params![work_id],
                |row| {
                    Ok(Work {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        author: row.get(2)?,
                        norm_text: row.get(3)?,
                        char_count: row.get::<_, i64>(4)? as usize,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::MissingWork(work_id.to_string()))
    }

    pub fn scenes_for_work(&self, work_id: &str) -> Result<Vec<Scene>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, work_id, idx, char_start, char_end
             FROM scene WHERE work_id = ?1 ORDER BY idx",
        )?;
        let rows = stmt.query_map(params![work_id], scene_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn chunks_for_work(&self, work_id: &str) -> Result<Vec<Chunk>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, work_id, scene_id, idx, char_start, char_end, text, sha256
             FROM chunk WHERE work_id = ?1 ORDER BY char_start",
        )?;
        let rows = stmt.query_map(params![work_id], chunk_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn chunks_for_scene(&self, scene_id: &str) -> Result<Vec<Chunk>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, work_id, scene_id, idx, char_start, char_end, text, sha256
             FROM chunk WHERE scene_id = ?1 ORDER BY idx",
        )?;
        let rows = stmt.query_map(params![scene_id], chunk_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn all_tropes(&self) -> Result<Vec<TropeDef>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, summary, aliases, anti_aliases, source_url, grp
             FROM trope ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, name, summary, aliases, anti_aliases, source_url, group) = row?;
            out.push(TropeDef {
                id,
                name,
                summary,
                aliases: serde_json::from_str(&aliases)?,
                anti_aliases: serde_json::from_str(&anti_aliases)?,
                source_url,
                group,
            });
        }
        Ok(out)
    }

    /// Per-trope acceptance thresholds written by active learning.
    pub fn trope_thresholds(&self) -> Result<HashMap<String, f32>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT trope_id, threshold FROM trope_threshold")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)? as f32))
        })?;
        Ok(rows.collect::<Result<HashMap<_, _>, _>>()?)
    }

    pub fn findings_for_run(&self, run_id: &str) -> Result<Vec<TropeFinding>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT f.id, f.work_id, f.scene_id, f.chunk_id, f.trope_id, f.level,
                    f.confidence, f.rationale, f.evidence_start, f.evidence_end,
                    f.model, f.verifier_score, f.verifier_flag, f.calibration_version,
                    f.threshold_used, f.run_id
             FROM trope_finding f
             JOIN scene s ON s.id = f.scene_id
             WHERE f.run_id = ?1
             ORDER BY s.idx, f.evidence_start",
        )?;
        let rows = stmt.query_map(params![run_id], finding_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Verify that every chunk of the work is byte-for-byte consistent with
    /// `norm_text` and its stored hash. Any mismatch is fatal for the work.
    pub fn verify_chunk_integrity(&self, work: &Work) -> Result<(), StoreError> {
        let chunks = self.chunks_for_work(&work.id)?;
        for c in &chunks {
            let expected = slice_codepoints(&work.norm_text, c.char_start, c.char_end);
            if expected != c.text {
                return Err(StoreError::Integrity {
                    chunk_id: c.id.clone(),
                    reason: format!(
                        "text differs from norm_text[{}..{}]",
                        c.char_start, c.char_end
                    ),
                });
            }
            let digest = sha256_hex(&c.text);
            if digest != c.sha256 {
                return Err(StoreError::Integrity {
                    chunk_id: c.id.clone(),
                    reason: format!("sha256 mismatch: stored={} computed={}", c.sha256, digest),
                });
            }
        }
        debug!(work_id = %work.id, chunks = chunks.len(), "chunk integrity verified");
        Ok(())
    }

    /* ---------------------------- writes ---------------------------- */

    pub fn insert_run(
        &self,
        run_id: &str,
        created_at: &str,
        params_json: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO run (id, created_at, params_json) VALUES (?1, ?2, ?3)",
            params![run_id, created_at, params_json],
        )?;
        Ok(())
    }

    /// Insert candidates in one transaction, ignoring unique-span duplicates.
    /// Returns the number of rows actually inserted.
    pub fn insert_candidates(
        &mut self,
        candidates: &[TropeCandidate],
    ) -> Result<u64, StoreError> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0u64;
        {
            let mut stmt = tx.prepare(
                r#"INSERT OR IGNORE INTO trope_candidate
                   (id, work_id, scene_id, chunk_id, trope_id, "start", "end", source, score)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            )?;
            for c in candidates {
                inserted += stmt.execute(params![
                    c.id,
                    c.work_id,
                    c.scene_id,
                    c.chunk_id,
                    c.trope_id,
                    c.start as i64,
                    c.end as i64,
                    c.source.as_str(),
                    c.score as f64,
                ])? as u64;
            }
        }
        tx.commit()?;
        debug!(
            total = candidates.len(),
            inserted, "candidate batch committed"
        );
        Ok(inserted)
    }

    /// Commit one scene's output atomically: supports and sanity first,
    /// then findings, then audits.
    pub fn apply_scene(&mut self, write: &SceneWrite) -> Result<u64, StoreError> {
        let tx = self.conn.transaction()?;
        for s in &write.supports {
            tx.execute(
                "INSERT OR REPLACE INTO support_selection
                 (scene_id, chunk_id, rank, stage1_score, stage2_score, picked)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    s.scene_id,
                    s.chunk_id,
                    s.rank.map(|r| r as i64),
                    s.stage1_score as f64,
                    s.stage2_score as f64,
                    s.picked as i64,
                ],
            )?;
        }
        for s in &write.sanity {
            tx.execute(
                "INSERT OR REPLACE INTO trope_sanity
                 (scene_id, trope_id, lex_ok, sem_sim, weight)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    s.scene_id,
                    s.trope_id,
                    s.lex_ok as i64,
                    s.sem_sim as f64,
                    s.weight as f64,
                ],
            )?;
        }
        let mut inserted = 0u64;
        for f in &write.findings {
            inserted += insert_finding(&tx, f)? as u64;
        }
        for a in &write.audits {
            insert_audit(&tx, a)?;
        }
        tx.commit()?;
        debug!(
            scene_id = %write.scene_id,
            supports = write.supports.len(),
            sanity = write.sanity.len(),
            findings = inserted,
            audits = write.audits.len(),
            "scene committed"
        );
        Ok(inserted)
    }

    pub fn insert_audit(&self, audit: &AuditRow) -> Result<(), StoreError> {
        insert_audit(&self.conn, audit)?;
        Ok(())
    }

    /// Post-verification update: possibly a new span, always a score.
    pub fn update_finding_verification(
        &self,
        finding_id: &str,
        evidence_start: usize,
        evidence_end: usize,
        verifier_score: f32,
        verifier_flag: Option<VerifierFlag>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE trope_finding
             SET evidence_start = ?2, evidence_end = ?3,
                 verifier_score = ?4,
                 verifier_flag = COALESCE(?5, verifier_flag)
             WHERE id = ?1",
            params![
                finding_id,
                evidence_start as i64,
                evidence_end as i64,
                verifier_score as f64,
                verifier_flag.map(|f| f.as_str()),
            ],
        )?;
        Ok(())
    }

    /// Negation post-pass update: adjusted confidence plus cue flag.
    pub fn update_finding_confidence(
        &self,
        finding_id: &str,
        confidence: f32,
        verifier_flag: Option<VerifierFlag>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE trope_finding
             SET confidence = ?2, verifier_flag = COALESCE(?3, verifier_flag)
             WHERE id = ?1",
            params![finding_id, confidence as f64, verifier_flag.map(|f| f.as_str())],
        )?;
        Ok(())
    }

    /// Removal under the explicit delete policy. The only code path that
    /// ever deletes a finding.
    pub fn delete_finding(&self, finding_id: &str) -> Result<(), StoreError> {
        let n = self
            .conn
            .execute("DELETE FROM trope_finding WHERE id = ?1", params![finding_id])?;
        if n == 0 {
            warn!(finding_id, "delete requested for missing finding");
        }
        Ok(())
    }

    /* ------------------- ingestion-side inserts ------------------- */
    // Segmentation and catalog loading live outside this core; these
    // inserts exist for ingest tooling and test fixtures.

    pub fn insert_work(&self, work: &Work) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO work (id, title, author, norm_text, char_count)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                work.id,
                work.title,
                work.author,
                work.norm_text,
                work.char_count as i64
            ],
        )?;
        Ok(())
    }

    pub fn insert_scene(&self, scene: &Scene) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO scene (id, work_id, idx, char_start, char_end)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                scene.id,
                scene.work_id,
                scene.idx,
                scene.char_start as i64,
                scene.char_end as i64
            ],
        )?;
        Ok(())
    }

    pub fn insert_chunk(&self, chunk: &Chunk) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO chunk (id, work_id, scene_id, idx, char_start, char_end, text, sha256)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                chunk.id,
                chunk.work_id,
                chunk.scene_id,
                chunk.idx,
                chunk.char_start as i64,
                chunk.char_end as i64,
                chunk.text,
                chunk.sha256
            ],
        )?;
        Ok(())
    }

    pub fn insert_trope(&self, trope: &TropeDef) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO trope (id, name, summary, aliases, anti_aliases, source_url, grp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                trope.id,
                trope.name,
                trope.summary,
                serde_json::to_string(&trope.aliases)?,
                serde_json::to_string(&trope.anti_aliases)?,
                trope.source_url,
                trope.group
            ],
        )?;
        Ok(())
    }

    pub fn set_trope_threshold(&self, trope_id: &str, threshold: f32) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO trope_threshold (trope_id, threshold) VALUES (?1, ?2)",
            params![trope_id, threshold as f64],
        )?;
        Ok(())
    }
}

/// Hex-encoded SHA-256, the canonical content hash across the pipeline.
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn insert_finding(conn: &Connection, f: &TropeFinding) -> Result<usize, StoreError> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO trope_finding
         (id, work_id, scene_id, chunk_id, trope_id, level, confidence, rationale,
          evidence_start, evidence_end, model, verifier_score, verifier_flag,
          calibration_version, threshold_used, run_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            f.id,
            f.work_id,
            f.scene_id,
            f.chunk_id,
            f.trope_id,
            f.level.as_str(),
            f.confidence as f64,
            f.rationale,
            f.evidence_start as i64,
            f.evidence_end as i64,
            f.model,
            f.verifier_score.map(|v| v as f64),
            f.verifier_flag.map(|v| v.as_str()),
            f.calibration_version,
            f.threshold_used as f64,
            f.run_id,
        ],
    )?;
    Ok(n)
}

fn insert_audit(conn: &Connection, a: &AuditRow) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO audit (id, run_id, scene_id, kind, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            uuid::Uuid::new_v4().to_string(),
            a.run_id,
            a.scene_id,
            a.kind,
            a.detail,
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn scene_from_row(row: &Row<'_>) -> rusqlite::Result<Scene> {
    Ok(Scene {
        id: row.get(0)?,
        work_id: row.get(1)?,
        idx: row.get(2)?,
        char_start: row.get::<_, i64>(3)? as usize,
        char_end: row.get::<_, i64>(4)? as usize,
    })
}

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<Chunk> {
    Ok(Chunk {
        id: row.get(0)?,
        work_id: row.get(1)?,
        scene_id: row.get(2)?,
        idx: row.get(3)?,
        char_start: row.get::<_, i64>(4)? as usize,
        char_end: row.get::<_, i64>(5)? as usize,
        text: row.get(6)?,
        sha256: row.get(7)?,
    })
}

fn finding_from_row(row: &Row<'_>) -> rusqlite::Result<TropeFinding> {
    let level: String = row.get(5)?;
    let flag: Option<String> = row.get(12)?;
    Ok(TropeFinding {
        id: row.get(0)?,
        work_id: row.get(1)?,
        scene_id: row.get(2)?,
        chunk_id: row.get(3)?,
        trope_id: row.get(4)?,
        level: FindingLevel::parse(&level).unwrap_or(FindingLevel::Span),
        confidence: row.get::<_, f64>(6)? as f32,
        rationale: row.get(7)?,
        evidence_start: row.get::<_, i64>(8)? as usize,
        evidence_end: row.get::<_, i64>(9)? as usize,
        model: row.get(10)?,
        verifier_score: row.get::<_, Option<f64>>(11)?.map(|v| v as f32),
        verifier_flag: flag.as_deref().and_then(VerifierFlag::parse),
        calibration_version: row.get(13)?,
        threshold_used: row.get::<_, f64>(14)? as f32,
        run_id: row.get(15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::char_len;

    fn fixture_store() -> TropeStore {
        let store = TropeStore::open_in_memory().unwrap();
        let text = "It was a dark and stormy night. She opened the door.";
        let work = Work {
            id: "w1".into(),
            title: "Fixture".into(),
            author: Some("Nobody".into()),
            norm_text: text.into(),
            char_count: char_len(text),
        };
        store.insert_work(&work).unwrap();
        store
            .insert_scene(&Scene {
                id: "s1".into(),
                work_id: "w1".into(),
                idx: 0,
                char_start: 0,
                char_end: work.char_count,
            })
            .unwrap();
        store
            .insert_chunk(&Chunk {
                id: "c1".into(),
                work_id: "w1".into(),
                scene_id: "s1".into(),
                idx: 0,
                char_start: 0,
                char_end: work.char_count,
                text: text.into(),
                sha256: sha256_hex(text),
            })
            .unwrap();
        store
            .insert_trope(&TropeDef {
                id: "t1".into(),
                name: "Dark And Stormy Night".into(),
                summary: "An ominous weather opening.".into(),
                aliases: vec!["dark and stormy".into()],
                anti_aliases: vec![],
                source_url: None,
                group: None,
            })
            .unwrap();
        store
    }

    fn fixture_finding(id: &str, start: usize, end: usize) -> TropeFinding {
        TropeFinding {
            id: id.into(),
            work_id: "w1".into(),
            scene_id: "s1".into(),
            chunk_id: Some("c1".into()),
            trope_id: "t1".into(),
            level: FindingLevel::Span,
            confidence: 0.8,
            rationale: "the opening line names the storm".into(),
            evidence_start: start,
            evidence_end: end,
            model: "test-model".into(),
            verifier_score: None,
            verifier_flag: None,
            calibration_version: None,
            threshold_used: 0.25,
            run_id: "r1".into(),
        }
    }

    #[test]
    fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("miner.db");
        {
            let store = TropeStore::open(&path).unwrap();
            store
                .insert_work(&Work {
                    id: "w1".into(),
                    title: "Persisted".into(),
                    author: None,
                    norm_text: "abc".into(),
                    char_count: 3,
                })
                .unwrap();
        }
        let reopened = TropeStore::open(&path).unwrap();
        let work = reopened.load_work("w1").unwrap();
        assert_eq!(work.title, "Persisted");
        assert_eq!(work.char_count, 3);
    }

    #[test]
    fn integrity_check_accepts_consistent_chunks() {
        let store = fixture_store();
        let work = store.load_work("w1").unwrap();
        store.verify_chunk_integrity(&work).unwrap();
    }

    #[test]
    fn integrity_check_rejects_tampered_text() {
        let store = fixture_store();
        store
            .conn
            .execute("UPDATE chunk SET text = 'tampered' WHERE id = 'c1'", [])
            .unwrap();
        let work = store.load_work("w1").unwrap();
        assert!(matches!(
            store.verify_chunk_integrity(&work),
            Err(StoreError::Integrity { .. })
        ));
    }

    #[test]
    fn duplicate_candidates_are_benign() {
        let mut store = fixture_store();
        let cand = TropeCandidate {
            id: "cand1".into(),
            work_id: "w1".into(),
            scene_id: "s1".into(),
            chunk_id: Some("c1".into()),
            trope_id: "t1".into(),
            start: 9,
            end: 24,
            source: CandidateSource::Gazetteer,
            score: 1.0,
        };
        let mut dup = cand.clone();
        dup.id = "cand2".into();
        let inserted = store.insert_candidates(&[cand, dup]).unwrap();
        assert_eq!(inserted, 1);
    }

    #[test]
    fn scene_write_commits_findings_with_dedup() {
        let mut store = fixture_store();
        store
            .insert_run("r1", "2025-01-01T00:00:00Z", "{}")
            .unwrap();

        let write = SceneWrite {
            scene_id: "s1".into(),
            supports: vec![SupportRow {
                scene_id: "s1".into(),
                chunk_id: "c1".into(),
                rank: Some(1),
                stage1_score: 0.91,
                stage2_score: 1.0,
                picked: true,
            }],
            sanity: vec![TropeSanity {
                scene_id: "s1".into(),
                trope_id: "t1".into(),
                lex_ok: true,
                sem_sim: 0.7,
                weight: 1.0,
            }],
            findings: vec![fixture_finding("f1", 0, 31), fixture_finding("f2", 0, 31)],
            audits: vec![],
        };
        let inserted = store.apply_scene(&write).unwrap();
        assert_eq!(inserted, 1, "same span must dedup via unique index");

        let findings = store.findings_for_run("r1").unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].evidence_end, 31);
    }

    #[test]
    fn latest_human_decision_wins() {
        let mut store = fixture_store();
        store
            .insert_run("r1", "2025-01-01T00:00:00Z", "{}")
            .unwrap();
        store
            .apply_scene(&SceneWrite {
                scene_id: "s1".into(),
                findings: vec![fixture_finding("f1", 0, 31)],
                ..Default::default()
            })
            .unwrap();

        for (decision, at) in [("reject", "2025-01-02T00:00:00Z"), ("accept", "2025-01-03T00:00:00Z")] {
            store
                .conn
                .execute(
                    "INSERT INTO human_decision (finding_id, decision, created_at)
                     VALUES ('f1', ?1, ?2)",
                    params![decision, at],
                )
                .unwrap();
        }
        let latest: String = store
            .conn
            .query_row(
                "SELECT decision FROM v_latest_human WHERE finding_id = 'f1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(latest, "accept");
    }
}
