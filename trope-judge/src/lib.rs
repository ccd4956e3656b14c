//! The judging pipeline: from seeded candidates to stamped findings.
//!
//! Single high-level entry: [`pipeline::run_work`]. For one work it runs:
//!
//! 1) **Seeding** — boundary-aware gazetteer matching with anti-phrase
//!    suppression, plus semantic nearest-chunk retrieval per trope.
//! 2) **Per-scene judging** — two-stage support selection (KNN → LLM
//!    rerank), lexical+semantic sanity priors, then the judge prompt.
//!    The judge's confidences are multiplied by the priors; findings below
//!    the active threshold are dropped before they are written.
//! 3) **Post-passes** — embedding-based span verification with sentence
//!    snapping, then the negation/meta/anti-alias cue pass.
//!
//! Every finding carries the id of a stamped `run` row, so a result set is
//! reproducible from its recorded parameters. Scene output commits in one
//! transaction; a cancelled run never leaves a half-written scene.

pub mod cfg;
pub mod errors;
pub mod gazetteer;
pub mod judge;
pub mod negation;
pub mod pipeline;
pub mod prompt;
pub mod reasoner;
pub mod retry;
pub mod sanity;
pub mod seed;
pub mod support;
pub mod verify;

pub use cfg::{JudgeConfig, NegationMode};
pub use errors::JudgeError;
pub use pipeline::{CancelFlag, RunSummary, run_work};
pub use reasoner::{OllamaReasoner, Reasoner};
