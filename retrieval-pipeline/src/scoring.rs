use std::cmp::Ordering;

use common::storage::types::text_chunk::TextChunk;
use serde::Serialize;

use crate::pipeline::Normalization;

/// A chunk returned by one source with that source's raw, unnormalized score.
#[derive(Debug, Clone)]
pub struct RawHit {
    pub chunk: TextChunk,
    pub raw_score: f32,
}

/// Sorts hits by raw score, best first, ties by chunk id.
pub fn sort_hits_desc(hits: &mut [RawHit]) {
    hits.sort_by(|a, b| compare_scored(a.raw_score, &a.chunk.id, b.raw_score, &b.chunk.id));
}

/// Optional per-source scores gathered for one chunk, already normalized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SourceScores {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<f32>,
}

impl SourceScores {
    /// Combined vector/lexical evidence. `lexical_blend` is the lexical share when both exist.
    pub fn text_channel(&self, lexical_blend: f32) -> Option<f32> {
        match (self.vector, self.lexical) {
            (Some(vector), Some(lexical)) => {
                let blend = clamp_unit(lexical_blend);
                Some(vector.mul_add(1.0 - blend, lexical * blend))
            }
            (Some(vector), None) => Some(vector),
            (None, Some(lexical)) => Some(lexical),
            (None, None) => None,
        }
    }
}

pub fn clamp_unit(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

/// Graph evidence for a chunk reached after `hops` relation steps.
pub fn hop_to_similarity(hops: u32) -> f32 {
    1.0 / (1.0 + hops as f32)
}

pub fn sigmoid(value: f32) -> f32 {
    1.0 / (1.0 + (-value).exp())
}

pub fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }

    let mut min = f32::MAX;
    let mut max = f32::MIN;

    for s in scores {
        if !s.is_finite() {
            continue;
        }
        if *s < min {
            min = *s;
        }
        if *s > max {
            max = *s;
        }
    }

    if min > max {
        return vec![0.0; scores.len()];
    }

    if (max - min).abs() < f32::EPSILON {
        return scores
            .iter()
            .map(|score| if score.is_finite() { 1.0 } else { 0.0 })
            .collect();
    }

    scores
        .iter()
        .map(|score| {
            if score.is_finite() {
                clamp_unit((score - min) / (max - min))
            } else {
                0.0
            }
        })
        .collect()
}

/// Population z-score squashed through the logistic function into (0, 1).
pub fn z_score_normalize(scores: &[f32]) -> Vec<f32> {
    if scores.len() < 2 {
        return vec![0.5; scores.len()];
    }

    let count = scores.len() as f32;
    let mean = scores.iter().sum::<f32>() / count;
    let variance = scores
        .iter()
        .map(|score| (score - mean).powi(2))
        .sum::<f32>()
        / count;
    let std_dev = variance.sqrt();

    if !std_dev.is_finite() || std_dev < f32::EPSILON {
        return vec![0.5; scores.len()];
    }

    scores
        .iter()
        .map(|score| sigmoid((score - mean) / std_dev))
        .collect()
}

pub fn normalize(method: Normalization, scores: &[f32]) -> Vec<f32> {
    match method {
        Normalization::MinMax => min_max_normalize(scores),
        Normalization::ZScore => z_score_normalize(scores),
    }
}

/// Cosine similarity, `0.0` for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot = x.mul_add(*y, dot);
        norm_a = x.mul_add(*x, norm_a);
        norm_b = y.mul_add(*y, norm_b);
    }

    let denominator = norm_a.sqrt() * norm_b.sqrt();
    if denominator <= f32::EPSILON {
        return 0.0;
    }
    dot / denominator
}

/// Descending by score, ascending by id on ties.
pub fn compare_scored(a_score: f32, a_id: &str, b_score: f32, b_id: &str) -> Ordering {
    b_score
        .partial_cmp(&a_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a_id.cmp(b_id))
}
