//! Schema bootstrap: tables, unique indices, and the latest-decision view.
//!
//! `init_schema` is idempotent. Foreign keys are enforced; deleting a work
//! cascades through scenes, chunks, candidates, and findings. The judging
//! pipeline never deletes human decisions.

use rusqlite::Connection;
use tracing::debug;

use crate::errors::StoreError;

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS work (
    id          TEXT PRIMARY KEY,
    title       TEXT NOT NULL,
    author      TEXT,
    norm_text   TEXT NOT NULL,
    char_count  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS scene (
    id          TEXT PRIMARY KEY,
    work_id     TEXT NOT NULL REFERENCES work(id) ON DELETE CASCADE,
    idx         INTEGER NOT NULL,
    char_start  INTEGER NOT NULL,
    char_end    INTEGER NOT NULL CHECK (char_end >= char_start)
);
CREATE INDEX IF NOT EXISTS idx_scene_work ON scene(work_id, idx);

CREATE TABLE IF NOT EXISTS chunk (
    id          TEXT PRIMARY KEY,
    work_id     TEXT NOT NULL REFERENCES work(id) ON DELETE CASCADE,
    scene_id    TEXT NOT NULL REFERENCES scene(id) ON DELETE CASCADE,
    idx         INTEGER NOT NULL,
    char_start  INTEGER NOT NULL,
    char_end    INTEGER NOT NULL CHECK (char_end >= char_start),
    text        TEXT NOT NULL,
    sha256      TEXT NOT NULL,
    UNIQUE (work_id, sha256)
);
CREATE INDEX IF NOT EXISTS idx_chunk_scene ON chunk(scene_id, idx);

CREATE TABLE IF NOT EXISTS trope (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL UNIQUE,
    summary       TEXT NOT NULL,
    aliases       TEXT NOT NULL DEFAULT '[]',
    anti_aliases  TEXT NOT NULL DEFAULT '[]',
    source_url    TEXT,
    grp           TEXT
);

CREATE TABLE IF NOT EXISTS run (
    id          TEXT PRIMARY KEY,
    created_at  TEXT NOT NULL,
    params_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trope_candidate (
    id        TEXT PRIMARY KEY,
    work_id   TEXT NOT NULL REFERENCES work(id) ON DELETE CASCADE,
    scene_id  TEXT NOT NULL REFERENCES scene(id) ON DELETE CASCADE,
    chunk_id  TEXT REFERENCES chunk(id) ON DELETE SET NULL,
    trope_id  TEXT NOT NULL REFERENCES trope(id),
    "start"   INTEGER NOT NULL,
    "end"     INTEGER NOT NULL CHECK ("end" >= "start"),
    source    TEXT NOT NULL CHECK (source IN ('gazetteer', 'semantic')),
    score     REAL NOT NULL,
    UNIQUE (work_id, trope_id, "start", "end")
);
CREATE INDEX IF NOT EXISTS idx_candidate_scene ON trope_candidate(scene_id);

CREATE TABLE IF NOT EXISTS support_selection (
    scene_id      TEXT NOT NULL REFERENCES scene(id) ON DELETE CASCADE,
    chunk_id      TEXT NOT NULL REFERENCES chunk(id) ON DELETE CASCADE,
    rank          INTEGER,
    stage1_score  REAL NOT NULL,
    stage2_score  REAL NOT NULL,
    picked        INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (scene_id, chunk_id)
);

CREATE TABLE IF NOT EXISTS trope_sanity (
    scene_id  TEXT NOT NULL REFERENCES scene(id) ON DELETE CASCADE,
    trope_id  TEXT NOT NULL REFERENCES trope(id),
    lex_ok    INTEGER NOT NULL CHECK (lex_ok IN (0, 1)),
    sem_sim   REAL NOT NULL,
    weight    REAL NOT NULL,
    PRIMARY KEY (scene_id, trope_id)
);

CREATE TABLE IF NOT EXISTS trope_finding (
    id                  TEXT PRIMARY KEY,
    work_id             TEXT NOT NULL REFERENCES work(id) ON DELETE CASCADE,
    scene_id            TEXT NOT NULL REFERENCES scene(id) ON DELETE CASCADE,
    chunk_id            TEXT REFERENCES chunk(id) ON DELETE SET NULL,
    trope_id            TEXT NOT NULL REFERENCES trope(id),
    level               TEXT NOT NULL CHECK (level IN ('span', 'scene', 'work')),
    confidence          REAL NOT NULL,
    rationale           TEXT NOT NULL,
    evidence_start      INTEGER NOT NULL,
    evidence_end        INTEGER NOT NULL CHECK (evidence_end >= evidence_start),
    model               TEXT NOT NULL,
    verifier_score      REAL,
    verifier_flag       TEXT,
    calibration_version TEXT,
    threshold_used      REAL NOT NULL,
    run_id              TEXT NOT NULL REFERENCES run(id),
    UNIQUE (work_id, trope_id, evidence_start, evidence_end)
);
CREATE INDEX IF NOT EXISTS idx_finding_scene ON trope_finding(scene_id);

CREATE TABLE IF NOT EXISTS trope_threshold (
    trope_id   TEXT PRIMARY KEY REFERENCES trope(id),
    threshold  REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS human_decision (
    finding_id         TEXT NOT NULL REFERENCES trope_finding(id),
    decision           TEXT NOT NULL CHECK (decision IN ('accept', 'reject', 'edit')),
    corrected_start    INTEGER,
    corrected_end      INTEGER,
    corrected_trope_id TEXT REFERENCES trope(id),
    created_at         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_decision_finding ON human_decision(finding_id);

CREATE TABLE IF NOT EXISTS audit (
    id          TEXT PRIMARY KEY,
    run_id      TEXT NOT NULL REFERENCES run(id),
    scene_id    TEXT,
    kind        TEXT NOT NULL,
    detail      TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE VIEW IF NOT EXISTS v_latest_human AS
SELECT hd.finding_id,
       hd.decision,
       hd.corrected_start,
       hd.corrected_end,
       hd.corrected_trope_id,
       hd.created_at
FROM human_decision hd
WHERE hd.rowid = (
    SELECT hd2.rowid
    FROM human_decision hd2
    WHERE hd2.finding_id = hd.finding_id
    ORDER BY hd2.created_at DESC, hd2.rowid DESC
    LIMIT 1
);
"#;

/// Creates all tables, indices, and views if missing, and switches the
/// connection into WAL mode with foreign keys enforced.
pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    // journal_mode reports the resulting mode back; accept whatever the
    // backend supports (in-memory databases stay on `memory`).
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(DDL)?;
    debug!("schema initialized");
    Ok(())
}
