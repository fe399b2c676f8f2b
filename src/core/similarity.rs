//! Pairwise similarity scores in [0, 1].
//!
//! Embeddings are compared by cosine similarity with negative values clamped
//! to 0: `score = clamp(cos, 0, 1)`. Anti-correlated and orthogonal vectors
//! both score 0, identical directions score 1. A zero vector has no direction
//! and always scores 0.
//!
//! Hashes are compared by normalised inverse Hamming distance,
//! `1 - differing_bits / total_bits`, per hash kind. When several hash kinds
//! are available on both sides they are combined with [`HashAggregate`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core::error::EngineError;
use crate::core::fingerprint::{FingerprintRecord, HashKind};
use crate::core::hash::hamming_distance;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonMode {
    /// Embedding similarity when both sides have one, hash distance otherwise.
    #[default]
    Auto,
    Embedding,
    Hash,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAggregate {
    /// Average over every hash kind present on both sides.
    #[default]
    Mean,
    /// Highest single-kind score.
    Best,
}

impl FromStr for ComparisonMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "embedding" => Ok(Self::Embedding),
            "hash" => Ok(Self::Hash),
            other => Err(format!(
                "unknown comparison mode '{}' (expected auto, embedding or hash)",
                other
            )),
        }
    }
}

impl fmt::Display for ComparisonMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Embedding => "embedding",
            Self::Hash => "hash",
        })
    }
}

impl FromStr for HashAggregate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mean" => Ok(Self::Mean),
            "best" => Ok(Self::Best),
            other => Err(format!(
                "unknown hash aggregate '{}' (expected mean or best)",
                other
            )),
        }
    }
}

/// Cosine similarity of two embeddings, clamped into [0, 1].
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64, EngineError> {
    if a.len() != b.len() {
        return Err(EngineError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
            images: None,
        });
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }

    // sqrt of the product keeps self-similarity exact: sqrt(n * n) == n.
    let cos = dot / (norm_a * norm_b).sqrt();
    if !cos.is_finite() {
        return Ok(0.0);
    }
    Ok(cos.clamp(0.0, 1.0))
}

fn has_direction(v: &[f32]) -> bool {
    v.iter().any(|x| *x != 0.0)
}

/// `1 - hamming / bits` for two hashes of the same kind.
pub fn hash_similarity(kind: HashKind, a: &str, b: &str) -> Result<f64, EngineError> {
    let (distance, bits) = hamming_distance(kind, a, b)?;
    Ok(1.0 - distance as f64 / bits as f64)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimilarityEngine {
    pub mode: ComparisonMode,
    pub aggregate: HashAggregate,
}

impl SimilarityEngine {
    pub fn new(mode: ComparisonMode, aggregate: HashAggregate) -> Self {
        Self { mode, aggregate }
    }

    /// Score two fingerprints, or `None` when they share no comparable signal.
    ///
    /// Errors are tagged with both filenames.
    pub fn compare(
        &self,
        a: &FingerprintRecord,
        b: &FingerprintRecord,
    ) -> Result<Option<f64>, EngineError> {
        self.compare_inner(a, b)
            .map_err(|e| e.for_pair(&a.filename, &b.filename))
    }

    fn compare_inner(
        &self,
        a: &FingerprintRecord,
        b: &FingerprintRecord,
    ) -> Result<Option<f64>, EngineError> {
        let embeddings = a.embedding().zip(b.embedding());

        match self.mode {
            ComparisonMode::Embedding => embeddings
                .map(|(x, y)| cosine_similarity(x, y))
                .transpose(),
            ComparisonMode::Hash => self.compare_hashes(a, b),
            // A directionless embedding (e.g. a uniform image) says nothing
            // about similarity, so auto mode uses the hashes instead.
            ComparisonMode::Auto => match embeddings {
                Some((x, y)) if x.len() != y.len() || (has_direction(x) && has_direction(y)) => {
                    cosine_similarity(x, y).map(Some)
                }
                _ => self.compare_hashes(a, b),
            },
        }
    }

    fn compare_hashes(
        &self,
        a: &FingerprintRecord,
        b: &FingerprintRecord,
    ) -> Result<Option<f64>, EngineError> {
        let mut scores = Vec::with_capacity(HashKind::ALL.len());
        for kind in HashKind::ALL {
            if let (Some(x), Some(y)) = (a.hash(kind), b.hash(kind)) {
                scores.push(hash_similarity(kind, x, y)?);
            }
        }

        if scores.is_empty() {
            return Ok(None);
        }

        let score = match self.aggregate {
            HashAggregate::Mean => scores.iter().sum::<f64>() / scores.len() as f64,
            HashAggregate::Best => scores.iter().copied().fold(0.0, f64::max),
        };
        Ok(Some(score))
    }
}
