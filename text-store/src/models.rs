//! Row models for the core tables.
//!
//! Closed sets (`source`, `level`, verifier flags) are represented as enums
//! and converted to their stored string form only at the SQL boundary.

use serde::{Deserialize, Serialize};

/// One ingested work. Immutable after ingest.
#[derive(Debug, Clone)]
pub struct Work {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub norm_text: String,
    /// Code-point length of `norm_text`, stamped at ingest.
    pub char_count: usize,
}

/// One scene: a contiguous `[char_start, char_end)` region of the work.
#[derive(Debug, Clone)]
pub struct Scene {
    pub id: String,
    pub work_id: String,
    pub idx: i64,
    pub char_start: usize,
    pub char_end: usize,
}

/// One chunk of a scene, carrying its own copy of the sliced text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub work_id: String,
    pub scene_id: String,
    pub idx: i64,
    pub char_start: usize,
    pub char_end: usize,
    pub text: String,
    pub sha256: String,
}

/// A trope definition from the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TropeDef {
    pub id: String,
    pub name: String,
    pub summary: String,
    pub aliases: Vec<String>,
    pub anti_aliases: Vec<String>,
    pub source_url: Option<String>,
    pub group: Option<String>,
}

impl TropeDef {
    /// The text embedded for this trope everywhere in the pipeline.
    pub fn definition_text(&self) -> String {
        format!("{}. {}", self.name, self.summary)
    }
}

/// Where a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    Gazetteer,
    Semantic,
}

impl CandidateSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CandidateSource::Gazetteer => "gazetteer",
            CandidateSource::Semantic => "semantic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gazetteer" => Some(CandidateSource::Gazetteer),
            "semantic" => Some(CandidateSource::Semantic),
            _ => None,
        }
    }
}

/// A pre-judgment hypothesis that a trope fires at a span.
#[derive(Debug, Clone)]
pub struct TropeCandidate {
    pub id: String,
    pub work_id: String,
    pub scene_id: String,
    pub chunk_id: Option<String>,
    pub trope_id: String,
    pub start: usize,
    pub end: usize,
    pub source: CandidateSource,
    pub score: f32,
}

/// One row of the per-scene support selection (all stage-1 hits persist).
#[derive(Debug, Clone)]
pub struct SupportRow {
    pub scene_id: String,
    pub chunk_id: String,
    /// 1..=M for picked rows, `None` otherwise.
    pub rank: Option<u32>,
    pub stage1_score: f32,
    pub stage2_score: f32,
    pub picked: bool,
}

/// Per-(scene, trope) sanity prior.
#[derive(Debug, Clone)]
pub struct TropeSanity {
    pub scene_id: String,
    pub trope_id: String,
    pub lex_ok: bool,
    pub sem_sim: f32,
    /// Multiplied into the judge's raw confidence; always in `(0, 1]`.
    pub weight: f32,
}

/// Granularity of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingLevel {
    Span,
    Scene,
    Work,
}

impl FindingLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            FindingLevel::Span => "span",
            FindingLevel::Scene => "scene",
            FindingLevel::Work => "work",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "span" => Some(FindingLevel::Span),
            "scene" => Some(FindingLevel::Scene),
            "work" => Some(FindingLevel::Work),
            _ => None,
        }
    }
}

/// Flags attached by the verifier and the negation post-pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierFlag {
    Negation,
    Meta,
    AntiAlias,
    VerifyError,
}

impl VerifierFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            VerifierFlag::Negation => "negation",
            VerifierFlag::Meta => "meta",
            VerifierFlag::AntiAlias => "anti_alias",
            VerifierFlag::VerifyError => "verify_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "negation" => Some(VerifierFlag::Negation),
            "meta" => Some(VerifierFlag::Meta),
            "anti_alias" => Some(VerifierFlag::AntiAlias),
            "verify_error" => Some(VerifierFlag::VerifyError),
            _ => None,
        }
    }
}

/// One evidence-grounded trope finding.
#[derive(Debug, Clone)]
pub struct TropeFinding {
    pub id: String,
    pub work_id: String,
    pub scene_id: String,
    pub chunk_id: Option<String>,
    pub trope_id: String,
    pub level: FindingLevel,
    pub confidence: f32,
    pub rationale: String,
    pub evidence_start: usize,
    pub evidence_end: usize,
    pub model: String,
    pub verifier_score: Option<f32>,
    pub verifier_flag: Option<VerifierFlag>,
    pub calibration_version: Option<String>,
    pub threshold_used: f32,
    pub run_id: String,
}

/// One structured audit row for a failed or skipped unit of work.
#[derive(Debug, Clone)]
pub struct AuditRow {
    pub run_id: String,
    pub scene_id: Option<String>,
    pub kind: String,
    pub detail: String,
}
