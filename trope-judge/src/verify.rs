//! Embedding-based span verification with sentence snapping.
//!
//! A finding's span is scored against the trope definition and the scene
//! (`0.7 · sim_def + 0.3 · sim_scene`). When either similarity falls under
//! `SPAN_VERIFIER_THRESHOLD`, candidate windows snapped to sentence
//! boundaries within `±SPAN_VERIFIER_MAX_SENT` sentences are scored, and
//! the span is replaced only when the best window beats the original by at
//! least [`MIN_GAIN`]. The verifier never crosses scene boundaries.

use tracing::{debug, trace};

use text_store::{Scene, TextIndex};
use vector_store::{EmbeddingsProvider, cosine, embed_many};

use crate::cfg::JudgeConfig;
use crate::errors::JudgeError;

/// A replacement must beat the original combined score by this much.
pub const MIN_GAIN: f32 = 0.05;

/// Window length cap in code points.
const MAX_WINDOW_CHARS: usize = 280;

/// Outcome of verifying one finding's span.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanVerification {
    pub evidence_start: usize,
    pub evidence_end: usize,
    pub verifier_score: f32,
    pub replaced: bool,
}

/// Sentence boundaries of one scene, as absolute code-point positions.
///
/// A boundary sits at every position `i` where the previous character is
/// `.`, `!`, or `?` and the character at `i` is whitespace (or the scene
/// ends), plus the scene start and end themselves.
pub fn sentence_boundaries(scene_text: &str, scene_start: usize, scene_end: usize) -> Vec<usize> {
    let mut bounds = vec![scene_start];
    let mut prev: Option<char> = None;
    for (rel, ch) in scene_text.chars().enumerate() {
        if let Some(p) = prev {
            if matches!(p, '.' | '!' | '?') && ch.is_whitespace() {
                bounds.push(scene_start + rel);
            }
        }
        prev = Some(ch);
    }
    bounds.push(scene_end);
    bounds.sort_unstable();
    bounds.dedup();
    bounds
}

/// Enumerate candidate windows around `[orig_start, orig_end)` by moving
/// the edges up to `max_sent` sentence boundaries in either direction.
/// Windows are whitespace-trimmed and capped at [`MAX_WINDOW_CHARS`].
pub fn candidate_windows(
    index: &TextIndex,
    bounds: &[usize],
    orig_start: usize,
    orig_end: usize,
    max_sent: usize,
) -> Vec<(usize, usize)> {
    if bounds.len() < 2 {
        return Vec::new();
    }
    // Nearest boundary at or before the span start / at or after its end.
    let si = bounds
        .iter()
        .rposition(|&b| b <= orig_start)
        .unwrap_or(0);
    let sj = bounds
        .iter()
        .position(|&b| b >= orig_end)
        .unwrap_or(bounds.len() - 1);

    let a_lo = si.saturating_sub(max_sent);
    let a_hi = (si + max_sent).min(bounds.len() - 1);
    let b_lo = sj.saturating_sub(max_sent);
    let b_hi = (sj + max_sent).min(bounds.len() - 1);

    let mut out = Vec::new();
    for a in a_lo..=a_hi {
        for b in b_lo..=b_hi {
            if bounds[a] >= bounds[b] {
                continue;
            }
            let (start, end) = trim_window(index, bounds[a], bounds[b]);
            if end <= start || end - start > MAX_WINDOW_CHARS {
                continue;
            }
            if (start, end) == (orig_start, orig_end) {
                continue;
            }
            if !out.contains(&(start, end)) {
                out.push((start, end));
            }
        }
    }
    out
}

/// Advance/retract window edges over whitespace so snapped spans do not
/// start with the separator that defined the boundary.
fn trim_window(index: &TextIndex, start: usize, end: usize) -> (usize, usize) {
    let text = index.slice(start, end);
    let leading = text.chars().take_while(|c| c.is_whitespace()).count();
    let trailing = text
        .chars()
        .rev()
        .take_while(|c| c.is_whitespace())
        .count();
    let new_start = start + leading;
    let new_end = end.saturating_sub(trailing);
    if new_end <= new_start {
        (start, start)
    } else {
        (new_start, new_end)
    }
}

/// Verify one span; returns the (possibly tightened) span and its score.
pub async fn verify_span(
    cfg: &JudgeConfig,
    embedder: &dyn EmbeddingsProvider,
    index: &TextIndex,
    scene: &Scene,
    orig_start: usize,
    orig_end: usize,
    trope_vector: &[f32],
    scene_vector: &[f32],
) -> Result<SpanVerification, JudgeError> {
    let span_text = index.slice(orig_start, orig_end);
    if span_text.trim().is_empty() {
        return Ok(SpanVerification {
            evidence_start: orig_start,
            evidence_end: orig_end,
            verifier_score: 0.0,
            replaced: false,
        });
    }

    let span_vector = embedder.embed(span_text).await?;
    let sim_def = cosine(&span_vector, trope_vector);
    let sim_scene = cosine(&span_vector, scene_vector);
    let original_score = 0.7 * sim_def + 0.3 * sim_scene;

    if sim_def.min(sim_scene) >= cfg.span_verifier_threshold {
        trace!(orig_start, orig_end, original_score, "span accepted as-is");
        return Ok(SpanVerification {
            evidence_start: orig_start,
            evidence_end: orig_end,
            verifier_score: original_score,
            replaced: false,
        });
    }

    let scene_text = index.slice(scene.char_start, scene.char_end);
    let bounds = sentence_boundaries(scene_text, scene.char_start, scene.char_end);
    let windows = candidate_windows(
        index,
        &bounds,
        orig_start,
        orig_end,
        cfg.span_verifier_max_sent,
    );
    if windows.is_empty() {
        return Ok(SpanVerification {
            evidence_start: orig_start,
            evidence_end: orig_end,
            verifier_score: original_score,
            replaced: false,
        });
    }

    let texts: Vec<String> = windows
        .iter()
        .map(|&(s, e)| index.slice(s, e).to_string())
        .collect();
    let vectors = embed_many(embedder, &texts, cfg.n_embed).await?;

    let mut best: Option<(usize, f32)> = None;
    for (i, v) in vectors.iter().enumerate() {
        let score = 0.7 * cosine(v, trope_vector) + 0.3 * cosine(v, scene_vector);
        if best.map(|(_, b)| score > b).unwrap_or(true) {
            best = Some((i, score));
        }
    }

    match best {
        Some((i, score)) if score >= original_score + MIN_GAIN => {
            let (start, end) = windows[i];
            debug!(
                orig_start,
                orig_end,
                new_start = start,
                new_end = end,
                original_score,
                score,
                "span replaced by sentence-snapped window"
            );
            Ok(SpanVerification {
                evidence_start: start,
                evidence_end: end,
                verifier_score: score,
                replaced: true,
            })
        }
        _ => Ok(SpanVerification {
            evidence_start: orig_start,
            evidence_end: orig_end,
            verifier_score: original_score,
            replaced: false,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use text_store::{Work, char_len};
    use vector_store::VectorError;

    fn index_for(text: &str) -> TextIndex {
        TextIndex::new(&Work {
            id: "w1".into(),
            title: "t".into(),
            author: None,
            norm_text: text.into(),
            char_count: char_len(text),
        })
    }

    #[test]
    fn boundaries_follow_terminal_punctuation() {
        let text = "One. Two! Three? Four";
        let bounds = sentence_boundaries(text, 0, char_len(text));
        // After '.', '!', '?' (positions 4, 9, 16) plus scene edges.
        assert_eq!(bounds, vec![0, 4, 9, 16, 21]);
    }

    #[test]
    fn no_boundary_without_following_whitespace() {
        let text = "e.g.continue until the end";
        let bounds = sentence_boundaries(text, 0, char_len(text));
        assert_eq!(bounds, vec![0, char_len(text)]);
    }

    #[test]
    fn windows_never_cross_scene_bounds() {
        let text = "Alpha one. Beta two. Gamma three.";
        let index = index_for(text);
        let bounds = sentence_boundaries(text, 0, char_len(text));
        for (s, e) in candidate_windows(&index, &bounds, 11, 19, 2) {
            assert!(e <= char_len(text));
            assert!(s < e);
        }
    }

    #[test]
    fn windows_are_trimmed_and_capped() {
        let text = "Alpha one. Beta two. Gamma three.";
        let index = index_for(text);
        let bounds = sentence_boundaries(text, 0, char_len(text));
        let windows = candidate_windows(&index, &bounds, 11, 19, 1);
        assert!(!windows.is_empty());
        for (s, e) in windows {
            let w = index.slice(s, e);
            assert_eq!(w, w.trim(), "window must not carry edge whitespace");
            assert!(e - s <= 280);
        }
    }

    /// Embeds to one of two orthogonal axes depending on a marker word.
    struct MarkerEmbedder;

    impl EmbeddingsProvider for MarkerEmbedder {
        fn model(&self) -> &str {
            "marker"
        }

        fn embed<'a>(
            &'a self,
            text: &'a str,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<Vec<f32>, VectorError>> + Send + 'a>,
        > {
            let v = if text.contains("storm") {
                vec![1.0, 0.0]
            } else {
                vec![0.0, 1.0]
            };
            Box::pin(async move { Ok(v) })
        }
    }

    fn test_cfg() -> JudgeConfig {
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
            negation_mode: crate::cfg::NegationMode::Downweight,
            neg_downweight: 0.6,
            meta_downweight: 0.75,
            aa_downweight: 0.5,
            anti_window: 60,
            calibration_version: None,
            n_embed: 2,
            n_scenes: 2,
        }
    }

    #[tokio::test]
    async fn good_span_is_left_alone() {
        let text = "The storm broke. A calm followed.";
        let index = index_for(text);
        let scene = Scene {
            id: "s1".into(),
            work_id: "w1".into(),
            idx: 0,
            char_start: 0,
            char_end: char_len(text),
        };
        let out = verify_span(
            &test_cfg(),
            &MarkerEmbedder,
            &index,
            &scene,
            0,
            16,
            &[1.0, 0.0],
            &[1.0, 0.0],
        )
        .await
        .unwrap();
        assert!(!out.replaced);
        assert!((out.verifier_score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn weak_span_snaps_to_a_better_sentence() {
        let text = "A calm morning came. The storm broke over the bay. Nothing else moved.";
        let index = index_for(text);
        let scene = Scene {
            id: "s1".into(),
            work_id: "w1".into(),
            idx: 0,
            char_start: 0,
            char_end: char_len(text),
        };
        // Original span is the (irrelevant) first sentence.
        let out = verify_span(
            &test_cfg(),
            &MarkerEmbedder,
            &index,
            &scene,
            0,
            19,
            &[1.0, 0.0],
            &[1.0, 0.0],
        )
        .await
        .unwrap();
        assert!(out.replaced);
        assert!(
            index
                .slice(out.evidence_start, out.evidence_end)
                .contains("storm")
        );
        assert!(out.verifier_score >= MIN_GAIN);
    }
}
