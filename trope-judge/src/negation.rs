//! Negation / meta / anti-alias post-pass over persisted findings.
//!
//! Scans ±40 code points around each finding's evidence start for cues:
//! - **negation**: `no|not|never|without|isn't|wasn't` at most 3 tokens
//!   before a lexical mention of the trope
//! - **meta**: `deconstructs|subverts|parody of|isn't a` in the window
//!   alongside a mention
//! - **anti-alias**: any of the trope's anti-alias phrases
//!
//! Cues are checked in that order; the first hit provides the flag, the
//! minimum factor across all hits provides the downweight.

use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use tracing::debug;

use text_store::{TextIndex, VerifierFlag, slice_codepoints};

use crate::cfg::{JudgeConfig, NegationMode};
use crate::gazetteer::{TropeMatcher, negation_cue_before};

/// Scan radius around `evidence_start`, in code points.
const CUE_WINDOW: usize = 40;

fn meta_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        RegexBuilder::new(r"\b(deconstructs|subverts|parody of|isn't a)\b")
            .case_insensitive(true)
            .build()
            .unwrap()
    })
}

/// Which cues fired around a finding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CueOutcome {
    pub flag: Option<VerifierFlag>,
    /// Minimum downweight factor across fired cues; 1.0 when none fired.
    pub factor: f32,
}

impl CueOutcome {
    pub fn none() -> Self {
        Self {
            flag: None,
            factor: 1.0,
        }
    }

    pub fn fired(&self) -> bool {
        self.flag.is_some()
    }
}

/// What the policy decided for one finding.
#[derive(Debug, Clone, PartialEq)]
pub enum NegationAction {
    /// No cues fired; nothing to do.
    Keep,
    /// `flag-only`: record the cue kind, confidence untouched.
    Flag(VerifierFlag),
    /// `downweight`: new confidence plus the cue flag. The finding is
    /// retained even when it falls under its threshold.
    Downweight {
        confidence: f32,
        flag: VerifierFlag,
    },
    /// `delete`: remove the finding.
    Delete,
}

/// Scan the window around `evidence_start` for cues against this trope.
pub fn scan_cues(
    cfg: &JudgeConfig,
    index: &TextIndex,
    evidence_start: usize,
    matcher: Option<&TropeMatcher>,
) -> CueOutcome {
    let window_start = evidence_start.saturating_sub(CUE_WINDOW);
    let window = index.slice(window_start, evidence_start + CUE_WINDOW);

    let mention = matcher.and_then(|m| m.find_in(window).into_iter().next());

    let mut flag: Option<VerifierFlag> = None;
    let mut factor = 1.0f32;
    let mut hit = |f: VerifierFlag, fac: f32, flag: &mut Option<VerifierFlag>| {
        if flag.is_none() {
            *flag = Some(f);
        }
        factor = factor.min(fac);
    };

    if let Some((mention_start, _)) = mention {
        let prefix = slice_codepoints(window, 0, mention_start);
        if negation_cue_before(prefix) {
            hit(VerifierFlag::Negation, cfg.neg_downweight, &mut flag);
        }
        if meta_re().is_match(window) {
            hit(VerifierFlag::Meta, cfg.meta_downweight, &mut flag);
        }
    }
    if matcher.is_some_and(|m| m.has_anti_alias(window)) {
        hit(VerifierFlag::AntiAlias, cfg.aa_downweight, &mut flag);
    }

    if flag.is_some() {
        debug!(evidence_start, ?flag, factor, "cue fired near finding");
    }
    CueOutcome { flag, factor }
}

/// Apply the configured policy to one finding's cue scan.
pub fn apply_policy(mode: NegationMode, confidence: f32, cues: CueOutcome) -> NegationAction {
    let Some(flag) = cues.flag else {
        return NegationAction::Keep;
    };
    match mode {
        NegationMode::FlagOnly => NegationAction::Flag(flag),
        NegationMode::Downweight => NegationAction::Downweight {
            confidence: confidence * cues.factor,
            flag,
        },
        NegationMode::Delete => NegationAction::Delete,
    }
}
