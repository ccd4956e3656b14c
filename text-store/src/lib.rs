//! SQLite persistence and text access for the trope mining pipeline.
//!
//! This crate provides:
//! - Schema creation for all core tables (works, scenes, chunks, tropes,
//!   candidates, support selections, sanity priors, findings, runs, audits)
//! - A code-point-safe [`TextIndex`] over a work's normalized text
//! - A [`TropeStore`] facade for all reads and scene-scoped writes
//!
//! Every span persisted through this crate is a half-open **code point**
//! interval into `work.norm_text`. Byte and UTF-16 offsets never leak out.

mod errors;
mod index;
mod models;
mod schema;
mod store;

pub use errors::StoreError;
pub use index::{TextIndex, char_len, char_to_utf16_units, slice_codepoints};
pub use models::{
    AuditRow, CandidateSource, Chunk, FindingLevel, Scene, SupportRow, TropeCandidate, TropeDef,
    TropeFinding, TropeSanity, VerifierFlag, Work,
};
pub use store::{SceneWrite, TropeStore, sha256_hex};
