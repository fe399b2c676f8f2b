use image::DynamicImage;
use image_hasher::{HashAlg, Hasher, HasherConfig, ImageHash};

use crate::core::error::EngineError;
use crate::core::fingerprint::{HashKind, PerceptualHashes};
use crate::core::image::decode_image;

pub const DEFAULT_HASH_SIZE: u32 = 8;

/// Computes average, difference and DCT-based perceptual hashes.
///
/// Each hash is `hash_size * hash_size` bits, hex-encoded. The three hashers
/// are built once and shared across threads.
pub struct HashExtractor {
    average: Hasher,
    difference: Hasher,
    perceptual: Hasher,
}

impl HashExtractor {
    pub fn new(hash_size: u32) -> Self {
        let hash_size = hash_size.max(2);
        let average = HasherConfig::new()
            .hash_size(hash_size, hash_size)
            .hash_alg(HashAlg::Mean)
            .to_hasher();
        let difference = HasherConfig::new()
            .hash_size(hash_size, hash_size)
            .hash_alg(HashAlg::Gradient)
            .to_hasher();
        let perceptual = HasherConfig::new()
            .hash_size(hash_size, hash_size)
            .hash_alg(HashAlg::Median)
            .preproc_dct()
            .to_hasher();

        Self {
            average,
            difference,
            perceptual,
        }
    }

    /// Hash an already decoded image. Blank images are valid input and
    /// produce a (near) uniform hash.
    pub fn hash_image(&self, img: &DynamicImage) -> PerceptualHashes {
        PerceptualHashes {
            phash: Some(to_hex(self.perceptual.hash_image(img).as_bytes())),
            ahash: Some(to_hex(self.average.hash_image(img).as_bytes())),
            dhash: Some(to_hex(self.difference.hash_image(img).as_bytes())),
        }
    }

    pub fn hash_bytes(&self, image: &str, bytes: &[u8]) -> Result<PerceptualHashes, EngineError> {
        let img = decode_image(image, bytes)?;
        Ok(self.hash_image(&img))
    }
}

impl Default for HashExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_SIZE)
    }
}

pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

pub fn from_hex(kind: HashKind, value: &str) -> Result<Vec<u8>, EngineError> {
    match hex::decode(value) {
        Ok(bytes) if !bytes.is_empty() => Ok(bytes),
        _ => Err(EngineError::MalformedHash {
            kind,
            value: value.to_string(),
        }),
    }
}

fn parse_hash(kind: HashKind, value: &str) -> Result<ImageHash, EngineError> {
    let bytes = from_hex(kind, value)?;
    ImageHash::from_bytes(&bytes).map_err(|_| EngineError::MalformedHash {
        kind,
        value: value.to_string(),
    })
}

/// Number of differing bits and total bit length of two hex hashes.
///
/// Hashes of different lengths are a `DimensionMismatch` (in bits).
pub fn hamming_distance(kind: HashKind, a: &str, b: &str) -> Result<(u32, u32), EngineError> {
    let a = parse_hash(kind, a)?;
    let b = parse_hash(kind, b)?;

    let (left, right) = (a.as_bytes().len() * 8, b.as_bytes().len() * 8);
    if left != right {
        return Err(EngineError::DimensionMismatch {
            left,
            right,
            images: None,
        });
    }

    Ok((a.dist(&b), left as u32))
}
