use std::cmp::Ordering;

use thiserror::Error;
use tracing::debug;

use veriscan_core::Confidence;

use crate::config::{FusionWeights, ReliabilityPriors};
use crate::extract;
use crate::types::{EngineResult, EngineWeight, FusedResult};

#[derive(Debug, Error)]
pub enum FusionError {
    #[error("no successful engine results to fuse")]
    EmptyInput,
}

struct Scored<'a> {
    result: &'a EngineResult,
    score: f32,
    prior: f32,
}

/// Combine engine outputs into one ranked text. Deterministic and
/// commutative over input order: the same set of results always fuses to the
/// same `FusedResult`. The highest-scoring candidate's text is taken whole —
/// no character-level merging, which would manufacture hybrid nonsense
/// words where engines disagree.
pub fn fuse(
    results: &[EngineResult],
    weights: &FusionWeights,
    priors: &ReliabilityPriors,
) -> Result<FusedResult, FusionError> {
    let mut scored: Vec<Scored> = results
        .iter()
        .filter(|r| r.is_ok())
        .map(|r| {
            let prior = priors.for_engine(r.engine_id).clamp(0.0, 1.0);
            Scored { result: r, score: score(r, prior, weights), prior }
        })
        .collect();

    if scored.is_empty() {
        return Err(FusionError::EmptyInput);
    }

    // Total order: exact score, then prior, then text length, then engine id
    // as the backstop. Sorting by it erases any trace of completion order.
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(b.prior.partial_cmp(&a.prior).unwrap_or(Ordering::Equal))
            .then(b.result.extracted_text.len().cmp(&a.result.extracted_text.len()))
            .then(a.result.engine_id.cmp(&b.result.engine_id))
    });

    // Near-ties within epsilon go to the historically more reliable engine,
    // then to the longer text.
    let top_score = scored[0].score;
    let winner_index = scored
        .iter()
        .enumerate()
        .take_while(|(_, s)| top_score - s.score <= weights.epsilon)
        .max_by(|(_, a), (_, b)| {
            a.prior
                .partial_cmp(&b.prior)
                .unwrap_or(Ordering::Equal)
                .then(a.result.extracted_text.len().cmp(&b.result.extracted_text.len()))
                .then(b.result.engine_id.cmp(&a.result.engine_id))
        })
        .map(|(i, _)| i)
        .unwrap_or(0);

    let winner = scored.remove(winner_index);
    let score_sum: f32 = winner.score + scored.iter().map(|s| s.score).sum::<f32>();

    let mut contributing = Vec::with_capacity(scored.len() + 1);
    contributing.push(EngineWeight {
        engine_id: winner.result.engine_id,
        weight: share(winner.score, score_sum),
    });
    for s in &scored {
        contributing.push(EngineWeight {
            engine_id: s.result.engine_id,
            weight: share(s.score, score_sum),
        });
    }

    debug!(
        winner = %winner.result.engine_id,
        score = winner.score,
        candidates = contributing.len(),
        "fusion selected winner"
    );

    Ok(FusedResult {
        combined_text: winner.result.extracted_text.clone(),
        fusion_confidence: Confidence::new(winner.score),
        contributing_engines: contributing,
    })
}

fn share(score: f32, total: f32) -> f32 {
    if total > 0.0 {
        score / total
    } else {
        0.0
    }
}

/// Weighted blend of four independent factors, each in `[0,1]`. Weights are
/// re-normalized by their sum so configuration mistakes degrade gracefully.
fn score(result: &EngineResult, prior: f32, weights: &FusionWeights) -> f32 {
    let total = weights.confidence + weights.length + weights.pattern_density + weights.reliability;
    if total <= 0.0 {
        return 0.0;
    }

    let chars = result.extracted_text.chars().count() as f32;
    let half = weights.length_half_point.max(1.0);
    // Saturating curve: near-empty extractions score close to zero, but a
    // wall of text cannot dominate the confidence factor either.
    let length_factor = chars / (chars + half);

    let density = extract::domain_token_density(&result.extracted_text);

    (weights.confidence * result.confidence.get()
        + weights.length * length_factor
        + weights.pattern_density * density
        + weights.reliability * prior.clamp(0.0, 1.0))
        / total
}
