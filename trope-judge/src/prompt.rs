//! Prompt builders for the rerank and judge stages.
//!
//! Prompts are versioned: the literal first line is [`PROMPT_VERSION`],
//! and the run parameters capture it, so changing any wording here means
//! bumping the version.

/// Literal version header; first line of every prompt.
pub const PROMPT_VERSION: &str = "TROPE-MINER-PROMPT-V1";

/// Scene text budget inside prompts (code points).
const MAX_SCENE_CHARS: usize = 6000;
/// Per-snippet budget inside prompts (code points).
const MAX_SNIPPET_CHARS: usize = 700;

/// One stage-1 snippet offered to the reranker.
pub struct RerankSnippet<'a> {
    pub chunk_id: &'a str,
    pub stage1_score: f32,
    pub text: &'a str,
}

/// One shortlisted trope offered to the judge.
pub struct JudgeCandidateView<'a> {
    pub trope_id: &'a str,
    pub name: &'a str,
    pub summary: &'a str,
    pub lex_ok: bool,
    pub sem_sim: f32,
    pub weight: f32,
}

/// Build the stage-2 rerank prompt: scene plus tagged snippets, asking for
/// the `keep_m` most directly supporting chunk ids.
pub fn build_rerank_prompt(
    scene_text: &str,
    snippets: &[RerankSnippet<'_>],
    keep_m: usize,
) -> String {
    let mut out = String::new();
    out.push_str(PROMPT_VERSION);
    out.push_str("\n\nYou select supporting evidence for narrative-trope analysis.\n\n");
    out.push_str("# Scene\n");
    out.push_str(truncate_chars(scene_text, MAX_SCENE_CHARS));
    out.push_str("\n\n# Snippets\n");
    for s in snippets {
        out.push_str(&format!(
            "==[{}]== (knn score {:.3})\n{}\n",
            s.chunk_id,
            s.stage1_score,
            truncate_chars(s.text, MAX_SNIPPET_CHARS)
        ));
    }
    out.push_str(&format!(
        "\n# Task\n\
         Pick the {keep_m} snippets that most directly support judging which \
         narrative tropes fire in this scene.\n\
         - Penalize generic background, scenery, and connective tissue.\n\
         - Prefer snippets whose events or phrasing narratively entail a trope.\n\
         - Order picks from strongest to weakest.\n\
         Respond with JSON only: {{\"picked\": [\"<chunk_id>\", ...], \"notes\": \"<short rationale>\"}}\n"
    ));
    out
}

/// Build the judge prompt: scene, picked supports, shortlisted candidates
/// with their priors, and the exact output contract.
pub fn build_judge_prompt(
    scene_text: &str,
    scene_start: usize,
    scene_end: usize,
    supports: &[(&str, &str)],
    candidates: &[JudgeCandidateView<'_>],
) -> String {
    let mut out = String::new();
    out.push_str(PROMPT_VERSION);
    out.push_str("\n\nYou judge which narrative tropes fire in a scene, grounded in its text.\n\n");
    out.push_str(&format!(
        "# Scene (absolute character span [{scene_start}, {scene_end}))\n"
    ));
    out.push_str(truncate_chars(scene_text, MAX_SCENE_CHARS));
    out.push('\n');

    if !supports.is_empty() {
        out.push_str("\n# Supporting snippets\n");
        for (chunk_id, text) in supports {
            out.push_str(&format!(
                "==[{}]==\n{}\n",
                chunk_id,
                truncate_chars(text, MAX_SNIPPET_CHARS)
            ));
        }
    }

    out.push_str("\n# Candidate tropes (with prior weights; advisory only)\n");
    for c in candidates {
        out.push_str(&format!(
            "- id={} name=\"{}\" lex_ok={} sem_sim={:.3} weight={:.2}\n  {}\n",
            c.trope_id,
            c.name,
            c.lex_ok as u8,
            c.sem_sim,
            c.weight,
            truncate_chars(c.summary, 300)
        ));
    }

    out.push_str(&format!(
        "\n# Task\n\
         For each candidate trope that genuinely fires in the scene, report it.\n\
         - confidence is your own estimate in [0,1]; the priors are context, not answers.\n\
         - evidence_start/evidence_end are ABSOLUTE character offsets into the work,\n\
           must lie inside [{scene_start}, {scene_end}), and should cover the tightest \
           span of text that evidences the trope.\n\
         - rationale is one or two sentences quoting or paraphrasing the evidence.\n\
         - Omit tropes that do not fire. An empty list is a valid answer.\n\
         Respond with JSON only: a list of\n\
         {{\"trope_id\": \"...\", \"confidence\": 0.0, \"evidence_start\": 0, \
         \"evidence_end\": 0, \"rationale\": \"...\"}}\n"
    ));
    out
}

/// Truncate to a code-point budget without splitting a character.
fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((byte, _)) => &s[..byte],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_lead_with_the_version_header() {
        let rerank = build_rerank_prompt("scene", &[], 3);
        assert!(rerank.starts_with(PROMPT_VERSION));

        let judge = build_judge_prompt("scene", 0, 5, &[], &[]);
        assert!(judge.starts_with(PROMPT_VERSION));
    }

    #[test]
    fn judge_prompt_states_scene_bounds() {
        let p = build_judge_prompt("scene text", 120, 480, &[], &[]);
        assert!(p.contains("[120, 480)"));
    }

    #[test]
    fn truncate_chars_respects_code_points() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("ab", 10), "ab");
    }
}
