pub mod clip;
pub mod duplicate;
pub mod embedding;
pub mod error;
pub mod fingerprint;
pub mod hash;
pub mod image;
pub mod similarity;

pub use duplicate::{DuplicateDetector, MatchOptions};
pub use embedding::{EmbeddingExtractor, EncoderHandle, ImageEncoder};
pub use error::EngineError;
pub use fingerprint::{DuplicatePair, DuplicateReport, FingerprintRecord, HashKind};
pub use hash::HashExtractor;
pub use similarity::{ComparisonMode, HashAggregate, SimilarityEngine};
