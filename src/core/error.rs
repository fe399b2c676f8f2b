use std::time::Duration;
use thiserror::Error;

use crate::core::fingerprint::HashKind;

/// Failures raised by the duplicate-detection engine.
///
/// None of these are retried internally; the caller decides whether to reject
/// the input, abort, or try again.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to decode image {image}: {reason}")]
    Decode { image: String, reason: String },

    #[error("Image encoder unavailable: {reason}")]
    EncoderUnavailable { reason: String },

    #[error("Encoder failed on image {image}: {reason}")]
    Encode { image: String, reason: String },

    #[error("Dimension mismatch{}: {left} vs {right}", describe_pair(.images))]
    DimensionMismatch {
        left: usize,
        right: usize,
        images: Option<(String, String)>,
    },

    #[error("Malformed {kind} hash {value:?}")]
    MalformedHash { kind: HashKind, value: String },

    #[error("Threshold {threshold} is outside [0, 1]")]
    InvalidThreshold { threshold: f64 },

    #[error("Duplicate scan exceeded its deadline of {limit:?}")]
    DeadlineExceeded { limit: Duration },

    #[error("Duplicate scan cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn decode(image: impl Into<String>, reason: impl ToString) -> Self {
        Self::Decode {
            image: image.into(),
            reason: reason.to_string(),
        }
    }

    pub fn encoder_unavailable(reason: impl ToString) -> Self {
        Self::EncoderUnavailable {
            reason: reason.to_string(),
        }
    }

    /// Attach the pair of image identifiers to a dimension mismatch raised
    /// by a raw vector comparison. Other variants pass through untouched.
    pub fn for_pair(self, image1: &str, image2: &str) -> Self {
        match self {
            Self::DimensionMismatch {
                left,
                right,
                images: None,
            } => Self::DimensionMismatch {
                left,
                right,
                images: Some((image1.to_string(), image2.to_string())),
            },
            other => other,
        }
    }

    /// True for failures that should stop the whole process rather than a
    /// single image.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::EncoderUnavailable { .. })
    }
}

fn describe_pair(images: &Option<(String, String)>) -> String {
    match images {
        Some((a, b)) => format!(" between {} and {}", a, b),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_mismatch_message_names_images() {
        let err = EngineError::DimensionMismatch {
            left: 512,
            right: 768,
            images: None,
        }
        .for_pair("a.jpg", "b.jpg");

        let msg = err.to_string();
        assert!(msg.contains("a.jpg"));
        assert!(msg.contains("b.jpg"));
        assert!(msg.contains("512 vs 768"));
    }

    #[test]
    fn test_only_encoder_unavailable_is_fatal() {
        assert!(EngineError::encoder_unavailable("missing weights").is_fatal());
        assert!(!EngineError::decode("x.png", "zero-byte input").is_fatal());
        assert!(!EngineError::InvalidThreshold { threshold: 1.5 }.is_fatal());
    }
}
