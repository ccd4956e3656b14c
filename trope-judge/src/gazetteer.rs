//! Boundary-aware gazetteer matching with anti-phrase suppression.
//!
//! Per trope, one compiled matcher over `name ∪ aliases`:
//! - surfaces are lowercased, whitespace-collapsed, and hyphen/space
//!   equivalent (`dark-and-stormy` matches `dark and stormy`)
//! - an optional trailing `s` is allowed unless the surface already ends
//!   in `s`
//! - alternatives are ordered longest-first inside Unicode word
//!   boundaries, so the longest surface wins at any position
//!
//! A match is suppressed when, within `ANTI_WINDOW` code points:
//! 1. an anti-alias phrase of the trope matches (whole-word),
//! 2. `anti-<alias>` / `non-<alias>` appears, or
//! 3. a literal negation cue sits at most 3 tokens before the surface.
//!
//! All emitted offsets are **absolute** code points into the work text.

use std::collections::HashSet;

use regex::{Regex, RegexBuilder};
use tracing::{debug, trace};
use uuid::Uuid;

use text_store::{CandidateSource, Chunk, TextIndex, TropeCandidate, TropeDef};

use crate::errors::JudgeError;

/// Negation cues recognized immediately before a surface.
const NEGATION_CUES: [&str; 7] = ["no", "not", "never", "without", "isn't", "wasn't", "anti"];

/// Why a match was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    AntiAlias,
    AntiPrefix,
    NegationCue,
}

/// Compiled matcher for one trope.
pub struct TropeMatcher {
    pub trope_id: String,
    surface_re: Regex,
    anti_re: Option<Regex>,
    anti_prefix_re: Option<Regex>,
}

impl TropeMatcher {
    fn compile(trope: &TropeDef) -> Result<Self, JudgeError> {
        let mut surfaces: Vec<&str> = Vec::with_capacity(trope.aliases.len() + 1);
        surfaces.push(trope.name.as_str());
        surfaces.extend(trope.aliases.iter().map(|s| s.as_str()));

        let surface_re = build_boundary_regex(&surfaces, true).ok_or_else(|| {
            JudgeError::Config(format!("trope '{}' has no usable surfaces", trope.name))
        })?;

        let antis: Vec<&str> = trope.anti_aliases.iter().map(|s| s.as_str()).collect();
        let anti_re = build_boundary_regex(&antis, false);

        // `anti-foo` / `non-foo` over the trope's own aliases.
        let anti_prefix_re = {
            let alts: Vec<String> = surfaces.iter().filter_map(|s| surface_pattern(s, false)).collect();
            if alts.is_empty() {
                None
            } else {
                let pat = format!(r"\b(?:anti|non)[\s\-]+(?:{})", alts.join("|"));
                RegexBuilder::new(&pat).case_insensitive(true).build().ok()
            }
        };

        Ok(Self {
            trope_id: trope.id.clone(),
            surface_re,
            anti_re,
            anti_prefix_re,
        })
    }

    /// All surface matches in `text`, as code-point offsets into `text`.
    pub fn find_in(&self, text: &str) -> Vec<(usize, usize)> {
        self.surface_re
            .find_iter(text)
            .map(|m| {
                let start = text[..m.start()].chars().count();
                let end = start + m.as_str().chars().count();
                (start, end)
            })
            .collect()
    }

    /// Read-only lexical gate: does `text` mention this trope at all?
    pub fn mentions(&self, text: &str) -> bool {
        self.surface_re.is_match(text)
    }

    /// Whole-word anti-alias hit anywhere in `text`.
    pub fn has_anti_alias(&self, text: &str) -> bool {
        self.anti_re.as_ref().is_some_and(|re| re.is_match(text))
    }

    /// Check a match at absolute `[start, end)` against the suppression
    /// rules, looking at `±window` code points of the surrounding work text.
    pub fn suppression(
        &self,
        index: &TextIndex,
        start: usize,
        end: usize,
        window: usize,
    ) -> Option<Suppression> {
        let ctx = index.window(start, end, window);
        if let Some(re) = &self.anti_re {
            if re.is_match(ctx) {
                return Some(Suppression::AntiAlias);
            }
        }
        if let Some(re) = &self.anti_prefix_re {
            if re.is_match(ctx) {
                return Some(Suppression::AntiPrefix);
            }
        }
        let prefix = index.slice(start.saturating_sub(window), start);
        if negation_cue_before(prefix) {
            return Some(Suppression::NegationCue);
        }
        None
    }
}

/// All compiled matchers for the active trope catalog.
pub struct GazetteerSet {
    matchers: Vec<TropeMatcher>,
}

impl GazetteerSet {
    /// Compile matchers for every trope. A trope whose surfaces are all
    /// empty is a catalog defect and fails the run.
    pub fn compile(tropes: &[TropeDef]) -> Result<Self, JudgeError> {
        let matchers = tropes
            .iter()
            .map(TropeMatcher::compile)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(tropes = matchers.len(), "gazetteer compiled");
        Ok(Self { matchers })
    }

    pub fn matcher_for(&self, trope_id: &str) -> Option<&TropeMatcher> {
        self.matchers.iter().find(|m| m.trope_id == trope_id)
    }

    /// Scan every chunk once and emit surviving candidates with absolute
    /// spans. Deterministic: same inputs yield identical rows (up to ids).
    pub fn scan_work(
        &self,
        index: &TextIndex,
        chunks: &[Chunk],
        anti_window: usize,
    ) -> Vec<TropeCandidate> {
        let mut out: Vec<TropeCandidate> = Vec::new();
        let mut seen: HashSet<(String, usize, usize)> = HashSet::new();

        for chunk in chunks {
            for matcher in &self.matchers {
                let mut spans: Vec<(usize, usize)> = matcher
                    .find_in(&chunk.text)
                    .into_iter()
                    .map(|(s, e)| (chunk.char_start + s, chunk.char_start + e))
                    .collect();
                collapse_overlaps(&mut spans);

                for (start, end) in spans {
                    if let Some(reason) = matcher.suppression(index, start, end, anti_window) {
                        trace!(
                            trope_id = %matcher.trope_id,
                            start,
                            end,
                            ?reason,
                            "gazetteer match suppressed"
                        );
                        continue;
                    }
                    if !seen.insert((matcher.trope_id.clone(), start, end)) {
                        continue;
                    }
                    out.push(TropeCandidate {
                        id: Uuid::new_v4().to_string(),
                        work_id: chunk.work_id.clone(),
                        scene_id: chunk.scene_id.clone(),
                        chunk_id: Some(chunk.id.clone()),
                        trope_id: matcher.trope_id.clone(),
                        start,
                        end,
                        source: CandidateSource::Gazetteer,
                        score: 1.0,
                    });
                }
            }
        }

        debug!(candidates = out.len(), "gazetteer scan complete");
        out
    }
}

/// Collapse overlapping spans of one trope, keeping the longest.
fn collapse_overlaps(spans: &mut Vec<(usize, usize)>) {
    if spans.len() < 2 {
        return;
    }
    spans.sort_by_key(|&(s, e)| (s, std::cmp::Reverse(e)));
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(spans.len());
    for &(s, e) in spans.iter() {
        match merged.last().copied() {
            Some((ps, pe)) if s < pe => {
                // Overlap: keep whichever span is longer.
                if e - s > pe - ps {
                    if let Some(last) = merged.last_mut() {
                        *last = (s, e);
                    }
                }
            }
            _ => merged.push((s, e)),
        }
    }
    *spans = merged;
}

/// Build `\b(?:alt1|alt2)\b` over the given surfaces, longest first.
fn build_boundary_regex(surfaces: &[&str], allow_plural: bool) -> Option<Regex> {
    let mut alts: Vec<(usize, String)> = surfaces
        .iter()
        .filter_map(|s| surface_pattern(s, allow_plural).map(|p| (s.chars().count(), p)))
        .collect();
    if alts.is_empty() {
        return None;
    }
    alts.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    alts.dedup_by(|a, b| a.1 == b.1);

    let pat = format!(
        r"\b(?:{})\b",
        alts.into_iter().map(|(_, p)| p).collect::<Vec<_>>().join("|")
    );
    RegexBuilder::new(&pat).case_insensitive(true).build().ok()
}

/// Normalize one surface into a regex fragment: tokens separated by
/// `[\s-]+`, optional plural `s` on the last token.
fn surface_pattern(surface: &str, allow_plural: bool) -> Option<String> {
    let tokens: Vec<String> = surface
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|t| !t.is_empty())
        .map(|t| regex::escape(t))
        .collect();
    if tokens.is_empty() {
        return None;
    }

    let plural = allow_plural && !surface.trim_end().to_lowercase().ends_with('s');
    let mut pat = tokens.join(r"[\s\-]+");
    if plural {
        pat.push_str("s?");
    }
    Some(pat)
}

/// True when one of the literal negation cues sits at most 3 tokens
/// before the end of `prefix`.
pub(crate) fn negation_cue_before(prefix: &str) -> bool {
    prefix
        .split_whitespace()
        .rev()
        .take(3)
        .map(|t| {
            t.trim_matches(|c: char| !(c.is_alphanumeric() || c == '\'' || c == '\u{2019}'))
                .replace('\u{2019}', "'")
                .to_lowercase()
        })
        .any(|t| NEGATION_CUES.contains(&t.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use text_store::{Work, char_len, sha256_hex};

    fn trope(id: &str, name: &str, aliases: &[&str], antis: &[&str]) -> TropeDef {
        TropeDef {
            id: id.into(),
            name: name.into(),
            summary: "summary".into(),
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
            anti_aliases: antis.iter().map(|s| s.to_string()).collect(),
            source_url: None,
            group: None,
        }
    }

    fn fixture(text: &str) -> (TextIndex, Vec<Chunk>) {
        let work = Work {
            id: "w1".into(),
            title: "t".into(),
            author: None,
            norm_text: text.into(),
            char_count: char_len(text),
        };
        let index = TextIndex::new(&work);
        let chunk = Chunk {
            id: "c1".into(),
            work_id: "w1".into(),
            scene_id: "s1".into(),
            idx: 0,
            char_start: 0,
            char_end: char_len(text),
            text: text.into(),
            sha256: sha256_hex(text),
        };
        (index, vec![chunk])
    }

    #[test]
    fn emits_candidate_at_absolute_offsets() {
        let text = "It was a dark and stormy night.";
        let (index, chunks) = fixture(text);
        let set = GazetteerSet::compile(&[trope(
            "t1",
            "Dark And Stormy Night",
            &["dark and stormy"],
            &[],
        )])
        .unwrap();

        let cands = set.scan_work(&index, &chunks, 60);
        assert_eq!(cands.len(), 1);
        // "dark and stormy night" starts at code point 9.
        assert_eq!(cands[0].start, 9);
        assert_eq!(cands[0].end, 9 + "dark and stormy night".chars().count());
        assert_eq!(cands[0].source, CandidateSource::Gazetteer);
    }

    #[test]
    fn longest_surface_wins_over_alias() {
        let text = "a dark and stormy night indeed";
        let (index, chunks) = fixture(text);
        let set = GazetteerSet::compile(&[trope(
            "t1",
            "Dark And Stormy Night",
            &["dark and stormy"],
            &[],
        )])
        .unwrap();
        let cands = set.scan_work(&index, &chunks, 60);
        assert_eq!(cands.len(), 1);
        assert_eq!(
            index.slice(cands[0].start, cands[0].end),
            "dark and stormy night"
        );
    }

    #[test]
    fn hyphen_and_space_are_equivalent() {
        let text = "the dark-and-stormy opening";
        let (index, chunks) = fixture(text);
        let set =
            GazetteerSet::compile(&[trope("t1", "Dark And Stormy", &[], &[])]).unwrap();
        assert_eq!(set.scan_work(&index, &chunks, 60).len(), 1);
    }

    #[test]
    fn plural_matches_unless_surface_ends_in_s() {
        let (index, chunks) = fixture("two dream sequences later");
        let set = GazetteerSet::compile(&[trope("t1", "Dream Sequence", &[], &[])]).unwrap();
        assert_eq!(set.scan_work(&index, &chunks, 60).len(), 1);

        // A surface already ending in `s` gets no extra plural.
        let (index2, chunks2) = fixture("a chekhovs gunss here");
        let set2 = GazetteerSet::compile(&[trope("t2", "chekhovs guns", &[], &[])]).unwrap();
        assert!(set2.scan_work(&index2, &chunks2, 60).is_empty());
    }

    #[test]
    fn word_boundaries_prevent_substring_hits() {
        let (index, chunks) = fixture("he was undarkened by it");
        let set = GazetteerSet::compile(&[trope("t1", "dark", &[], &[])]).unwrap();
        assert!(set.scan_work(&index, &chunks, 60).is_empty());
    }

    #[test]
    fn negation_cue_within_three_tokens_suppresses() {
        let text = "This isn't a dark and stormy night.";
        let (index, chunks) = fixture(text);
        let set = GazetteerSet::compile(&[trope(
            "t1",
            "Dark And Stormy Night",
            &["dark and stormy"],
            &[],
        )])
        .unwrap();
        assert!(set.scan_work(&index, &chunks, 60).is_empty());
    }

    #[test]
    fn anti_alias_in_window_suppresses() {
        let text = "her dream-like prose carried the dream sequence away";
        let (index, chunks) = fixture(text);
        let set = GazetteerSet::compile(&[trope(
            "t1",
            "Dream Sequence",
            &[],
            &["dream-like prose"],
        )])
        .unwrap();
        assert!(set.scan_work(&index, &chunks, 60).is_empty());
    }

    #[test]
    fn anti_prefix_suppresses() {
        let text = "an anti-hero walked in, not a hero at all";
        let (index, chunks) = fixture(text);
        let set = GazetteerSet::compile(&[trope("t1", "Hero", &[], &[])]).unwrap();
        // Both mentions die: the first to `anti-`, the second to `not a`.
        assert!(set.scan_work(&index, &chunks, 60).is_empty());
    }

    #[test]
    fn scan_is_idempotent_modulo_ids() {
        let text = "a dark and stormy night; later, another dark and stormy night";
        let (index, chunks) = fixture(text);
        let set = GazetteerSet::compile(&[trope(
            "t1",
            "Dark And Stormy Night",
            &["dark and stormy"],
            &[],
        )])
        .unwrap();

        let key = |c: &TropeCandidate| (c.trope_id.clone(), c.start, c.end);
        let a: Vec<_> = set.scan_work(&index, &chunks, 60).iter().map(key).collect();
        let b: Vec<_> = set.scan_work(&index, &chunks, 60).iter().map(key).collect();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn collapse_keeps_longest_overlap() {
        let mut spans = vec![(5, 10), (5, 20), (30, 35)];
        collapse_overlaps(&mut spans);
        assert_eq!(spans, vec![(5, 20), (30, 35)]);
    }
}
