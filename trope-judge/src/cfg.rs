//! Runtime configuration for the judging pipeline.
//!
//! One immutable config bag built from environment variables at startup.
//! Every knob has a default; `validate()` rejects out-of-range values
//! before any external call is made.

use crate::errors::JudgeError;

/// What to do when negation/meta/anti-alias cues fire near a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegationMode {
    /// Record the cue kind; leave confidence untouched.
    FlagOnly,
    /// Multiply confidence by the cue factor and flag. Findings that drop
    /// below threshold are retained but flagged, never silently deleted.
    Downweight,
    /// Remove the finding. Unconditional; calibration cannot resurrect it.
    Delete,
}

impl NegationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            NegationMode::FlagOnly => "flag-only",
            NegationMode::Downweight => "downweight",
            NegationMode::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "flag-only" => Some(NegationMode::FlagOnly),
            "downweight" => Some(NegationMode::Downweight),
            "delete" => Some(NegationMode::Delete),
            _ => None,
        }
    }
}

/// Config bag for one judging run. All fields have defaults via `from_env`.
#[derive(Debug, Clone)]
pub struct JudgeConfig {
    /// Global acceptance threshold for adjusted confidence.
    pub threshold: f32,

    // Support selection
    pub rerank_top_k: u64,
    pub rerank_keep_m: usize,

    // Judge shortlist
    pub trope_top_k: usize,

    // Sanity priors
    pub downweight_no_mention: f32,
    pub sem_sim_threshold: f32,

    // Semantic seeding
    pub sem_tau: f32,
    pub sem_top_n: u64,
    pub sem_per_scene_cap: usize,

    // Span verification
    pub span_verifier_threshold: f32,
    pub span_verifier_max_sent: usize,

    // Negation post-pass
    pub negation_mode: NegationMode,
    pub neg_downweight: f32,
    pub meta_downweight: f32,
    pub aa_downweight: f32,

    /// Window (code points) around a gazetteer match for anti-suppression.
    pub anti_window: usize,

    /// Opaque calibration tag stamped onto findings.
    pub calibration_version: Option<String>,

    // Bounded parallelism
    pub n_embed: usize,
    pub n_scenes: usize,
}

impl JudgeConfig {
    /// Build from environment variables with the documented defaults.
    pub fn from_env() -> Result<Self, JudgeError> {
        let negation_mode_raw = env("NEGATION_MODE", "downweight");
        let negation_mode = NegationMode::parse(&negation_mode_raw).ok_or_else(|| {
            JudgeError::Config(format!(
                "NEGATION_MODE must be flag-only|downweight|delete, got '{negation_mode_raw}'"
            ))
        })?;

        let cfg = Self {
            threshold: parse("THRESHOLD", 0.25f32),
            rerank_top_k: parse("RERANK_TOP_K", 8u64),
            rerank_keep_m: parse("RERANK_KEEP_M", 3usize),
            trope_top_k: parse("TROPE_TOP_K", 16usize),
            downweight_no_mention: parse("DOWNWEIGHT_NO_MENTION", 0.55f32),
            sem_sim_threshold: parse("SEM_SIM_THRESHOLD", 0.36f32),
            sem_tau: parse("SEM_TAU", 0.70f32),
            sem_top_n: parse("SEM_TOP_N", 8u64),
            sem_per_scene_cap: parse("SEM_PER_SCENE_CAP", 3usize),
            span_verifier_threshold: parse("SPAN_VERIFIER_THRESHOLD", 0.25f32),
            span_verifier_max_sent: parse("SPAN_VERIFIER_MAX_SENT", 2usize),
            negation_mode,
            neg_downweight: parse("NEG_DOWNWEIGHT", 0.6f32),
            meta_downweight: parse("META_DOWNWEIGHT", 0.75f32),
            aa_downweight: parse("AA_DOWNWEIGHT", 0.5f32),
            anti_window: parse("ANTI_WINDOW", 60usize),
            calibration_version: std::env::var("CALIBRATION_VERSION")
                .ok()
                .filter(|s| !s.is_empty()),
            n_embed: parse("N_EMBED", 4usize),
            n_scenes: parse("N_SCENES", 2usize),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects values a run could not honor.
    pub fn validate(&self) -> Result<(), JudgeError> {
        for (name, value) in [
            ("THRESHOLD", self.threshold),
            ("SEM_TAU", self.sem_tau),
            ("SPAN_VERIFIER_THRESHOLD", self.span_verifier_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(JudgeError::Config(format!(
                    "{name} must be in [0,1], got {value}"
                )));
            }
        }
        for (name, value) in [
            ("DOWNWEIGHT_NO_MENTION", self.downweight_no_mention),
            ("NEG_DOWNWEIGHT", self.neg_downweight),
            ("META_DOWNWEIGHT", self.meta_downweight),
            ("AA_DOWNWEIGHT", self.aa_downweight),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(JudgeError::Config(format!(
                    "{name} must be in (0,1], got {value}"
                )));
            }
        }
        if !(-1.0..=1.0).contains(&self.sem_sim_threshold) {
            return Err(JudgeError::Config(format!(
                "SEM_SIM_THRESHOLD must be in [-1,1], got {}",
                self.sem_sim_threshold
            )));
        }
        if self.rerank_keep_m == 0 || self.rerank_keep_m as u64 > self.rerank_top_k {
            return Err(JudgeError::Config(format!(
                "RERANK_KEEP_M must be in [1, RERANK_TOP_K={}], got {}",
                self.rerank_top_k, self.rerank_keep_m
            )));
        }
        if self.trope_top_k == 0 {
            return Err(JudgeError::Config("TROPE_TOP_K must be >= 1".into()));
        }
        if self.n_embed == 0 || self.n_scenes == 0 {
            return Err(JudgeError::Config(
                "N_EMBED and N_SCENES must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

fn env(k: &str, dflt: &str) -> String {
    std::env::var(k).unwrap_or_else(|_| dflt.to_string())
}

fn parse<T: std::str::FromStr>(k: &str, dflt: T) -> T {
    std::env::var(k)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(dflt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_cfg() -> JudgeConfig {
        JudgeConfig {
            threshold: 0.25,
            rerank_top_k: 8,
            rerank_keep_m: 3,
            trope_top_k: 16,
            downweight_no_mention: 0.55,
            sem_sim_threshold: 0.36,
            sem_tau: 0.70,
            sem_top_n: 8,
            sem_per_scene_cap: 3,
            span_verifier_threshold: 0.25,
            span_verifier_max_sent: 2,
            negation_mode: NegationMode::Downweight,
            neg_downweight: 0.6,
            meta_downweight: 0.75,
            aa_downweight: 0.5,
            anti_window: 60,
            calibration_version: None,
            n_embed: 4,
            n_scenes: 2,
        }
    }

    #[test]
    fn defaults_are_valid() {
        default_cfg().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut cfg = default_cfg();
        cfg.threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_keep_m_above_top_k() {
        let mut cfg = default_cfg();
        cfg.rerank_keep_m = 9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn negation_mode_round_trips() {
        for mode in [
            NegationMode::FlagOnly,
            NegationMode::Downweight,
            NegationMode::Delete,
        ] {
            assert_eq!(NegationMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(NegationMode::parse("remove"), None);
    }
}
