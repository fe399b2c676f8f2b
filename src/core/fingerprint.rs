use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    Average,
    Difference,
    Perceptual,
}

impl HashKind {
    pub const ALL: [HashKind; 3] = [HashKind::Perceptual, HashKind::Average, HashKind::Difference];

    pub fn short_name(&self) -> &'static str {
        match self {
            HashKind::Average => "ahash",
            HashKind::Difference => "dhash",
            HashKind::Perceptual => "phash",
        }
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// The three perceptual hashes of one image, each a hex-encoded bit vector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerceptualHashes {
    pub phash: Option<String>,
    pub ahash: Option<String>,
    pub dhash: Option<String>,
}

impl PerceptualHashes {
    pub fn is_empty(&self) -> bool {
        self.phash.is_none() && self.ahash.is_none() && self.dhash.is_none()
    }
}

/// Everything the matcher knows about one stored image.
///
/// Absent hashes or embedding are typed `None`, never missing keys. A record
/// is created once per ingestion and replaced wholesale on re-ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub id: Uuid,
    pub filename: String,
    #[serde(default)]
    pub phash: Option<String>,
    #[serde(default)]
    pub ahash: Option<String>,
    #[serde(default)]
    pub dhash: Option<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// blake3 digest of the source bytes, used to skip unchanged files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FingerprintRecord {
    pub fn new(
        filename: impl Into<String>,
        hashes: PerceptualHashes,
        embedding: Option<Vec<f32>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            filename: filename.into(),
            phash: hashes.phash,
            ahash: hashes.ahash,
            dhash: hashes.dhash,
            embedding,
            digest: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    pub fn hash(&self, kind: HashKind) -> Option<&str> {
        match kind {
            HashKind::Average => self.ahash.as_deref(),
            HashKind::Difference => self.dhash.as_deref(),
            HashKind::Perceptual => self.phash.as_deref(),
        }
    }

    /// The embedding, if present and non-empty.
    pub fn embedding(&self) -> Option<&[f32]> {
        self.embedding.as_deref().filter(|e| !e.is_empty())
    }

    /// A record with neither hashes nor an embedding carries no signal and is
    /// never compared.
    pub fn has_signal(&self) -> bool {
        self.embedding().is_some() || HashKind::ALL.iter().any(|k| self.hash(*k).is_some())
    }
}

/// Two distinct images whose similarity met the threshold.
///
/// Filenames need not be unique across records, so the record ids are
/// carried alongside them; `id1 != id2` always holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicatePair {
    pub image1: String,
    pub image2: String,
    pub id1: Uuid,
    pub id2: Uuid,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateReport {
    pub duplicates: Vec<DuplicatePair>,
}
