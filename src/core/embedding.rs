//! Dense image embeddings.
//!
//! Encoders are expensive to construct, so they live behind an
//! [`EncoderHandle`]: the handle runs its loader at most once, caches either
//! the encoder or the load failure for the rest of the process, and serializes
//! calls into encoders that are not known to be reentrant. Extractors share the
//! handle through an `Arc`, which also lets tests inject a stub encoder.

use image::{DynamicImage, imageops::FilterType};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;

use crate::core::error::EngineError;
use crate::core::image::decode_image;

/// Failure reported by an encoder while running on one image.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct EncoderError(pub String);

pub trait ImageEncoder: Send + Sync {
    fn name(&self) -> &str;

    /// Output dimensionality, when known before the first call.
    fn dimension(&self) -> Option<usize>;

    fn encode(&self, image: &DynamicImage) -> Result<Vec<f32>, EncoderError>;

    /// Whether concurrent `encode` calls are safe without external locking.
    fn is_reentrant(&self) -> bool {
        false
    }
}

type Loader = Box<dyn Fn() -> Result<Box<dyn ImageEncoder>, EngineError> + Send + Sync>;

pub struct EncoderHandle {
    loader: Loader,
    state: OnceLock<Result<Box<dyn ImageEncoder>, String>>,
    call_gate: Mutex<()>,
}

impl EncoderHandle {
    /// Defer loading until the first encode.
    pub fn lazy<F>(loader: F) -> Self
    where
        F: Fn() -> Result<Box<dyn ImageEncoder>, EngineError> + Send + Sync + 'static,
    {
        Self {
            loader: Box::new(loader),
            state: OnceLock::new(),
            call_gate: Mutex::new(()),
        }
    }

    /// Load immediately, failing fast if the encoder cannot be initialised.
    pub fn eager<F>(loader: F) -> Result<Self, EngineError>
    where
        F: Fn() -> Result<Box<dyn ImageEncoder>, EngineError> + Send + Sync + 'static,
    {
        let handle = Self::lazy(loader);
        handle.ensure_loaded()?;
        Ok(handle)
    }

    /// Wrap an encoder that is already constructed.
    pub fn ready<E: ImageEncoder + 'static>(encoder: E) -> Self {
        let handle = Self::lazy(|| {
            Err(EngineError::encoder_unavailable("encoder was supplied pre-loaded"))
        });
        let encoder: Box<dyn ImageEncoder> = Box::new(encoder);
        let _ = handle.state.set(Ok(encoder));
        handle
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state.get(), Some(Ok(_)))
    }

    pub fn ensure_loaded(&self) -> Result<(), EngineError> {
        self.encoder().map(|_| ())
    }

    /// Name of the loaded encoder, loading it if needed.
    pub fn name(&self) -> Result<String, EngineError> {
        Ok(self.encoder()?.name().to_string())
    }

    fn encoder(&self) -> Result<&dyn ImageEncoder, EngineError> {
        let state = self.state.get_or_init(|| match (self.loader)() {
            Ok(encoder) => {
                info!("Loaded image encoder {}", encoder.name());
                Ok(encoder)
            }
            Err(e) => {
                warn!("Image encoder failed to load: {}", e);
                Err(match e {
                    EngineError::EncoderUnavailable { reason } => reason,
                    other => other.to_string(),
                })
            }
        });

        match state {
            Ok(encoder) => Ok(encoder.as_ref()),
            Err(reason) => Err(EngineError::encoder_unavailable(reason)),
        }
    }

    pub fn encode(&self, image: &str, img: &DynamicImage) -> Result<Vec<f32>, EngineError> {
        let encoder = self.encoder()?;

        let result = if encoder.is_reentrant() {
            encoder.encode(img)
        } else {
            let _guard = self
                .call_gate
                .lock()
                .map_err(|_| EngineError::encoder_unavailable("encoder call lock poisoned"))?;
            encoder.encode(img)
        };

        let embedding = result.map_err(|e| EngineError::Encode {
            image: image.to_string(),
            reason: e.to_string(),
        })?;

        if let Some(expected) = encoder.dimension() {
            if embedding.len() != expected {
                return Err(EngineError::Encode {
                    image: image.to_string(),
                    reason: format!(
                        "{} returned {} values, expected {}",
                        encoder.name(),
                        embedding.len(),
                        expected
                    ),
                });
            }
        }

        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::Encode {
                image: image.to_string(),
                reason: "embedding contains non-finite values".to_string(),
            });
        }

        debug!("Embedded {} into {} dims", image, embedding.len());
        Ok(embedding)
    }
}

/// Produces embeddings from decoded images or raw bytes using a shared encoder.
#[derive(Clone)]
pub struct EmbeddingExtractor {
    handle: Arc<EncoderHandle>,
}

impl EmbeddingExtractor {
    pub fn new(handle: Arc<EncoderHandle>) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &Arc<EncoderHandle> {
        &self.handle
    }

    pub fn embed_image(&self, image: &str, img: &DynamicImage) -> Result<Vec<f32>, EngineError> {
        self.handle.encode(image, img)
    }

    pub fn embed_bytes(&self, image: &str, bytes: &[u8]) -> Result<Vec<f32>, EngineError> {
        let img = decode_image(image, bytes)?;
        self.embed_image(image, &img)
    }
}

pub const THUMBNAIL_SIDE: u32 = 16;

/// Model-free encoder: a mean-centred grayscale thumbnail, L2-normalised.
///
/// Cosine similarity between two of these is the pixel correlation of the
/// downscaled images, which is enough to catch resized or recompressed copies.
pub struct ThumbnailEncoder {
    side: u32,
}

impl ThumbnailEncoder {
    pub fn new() -> Self {
        Self {
            side: THUMBNAIL_SIDE,
        }
    }
}

impl Default for ThumbnailEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageEncoder for ThumbnailEncoder {
    fn name(&self) -> &str {
        "thumbnail"
    }

    fn dimension(&self) -> Option<usize> {
        Some((self.side * self.side) as usize)
    }

    fn encode(&self, image: &DynamicImage) -> Result<Vec<f32>, EncoderError> {
        let small = image
            .resize_exact(self.side, self.side, FilterType::Triangle)
            .to_luma8();

        let total: u32 = small.pixels().map(|p| p[0] as u32).sum();
        let mean = total as f32 / (self.side * self.side) as f32;
        let centred: Vec<f32> = small.pixels().map(|p| p[0] as f32 - mean).collect();

        Ok(l2_normalize(&centred))
    }

    fn is_reentrant(&self) -> bool {
        true
    }
}

/// Scale to unit length. Zero or non-finite norms yield a zero vector.
pub fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm.is_finite() && norm > 1e-10 {
        v.iter().map(|x| x / norm).collect()
    } else {
        vec![0.0; v.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::image::test_support::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ConstantEncoder {
        value: Vec<f32>,
    }

    impl ImageEncoder for ConstantEncoder {
        fn name(&self) -> &str {
            "constant"
        }

        fn dimension(&self) -> Option<usize> {
            Some(self.value.len())
        }

        fn encode(&self, _image: &DynamicImage) -> Result<Vec<f32>, EncoderError> {
            Ok(self.value.clone())
        }
    }

    struct WrongSizeEncoder;

    impl ImageEncoder for WrongSizeEncoder {
        fn name(&self) -> &str {
            "wrong-size"
        }

        fn dimension(&self) -> Option<usize> {
            Some(512)
        }

        fn encode(&self, _image: &DynamicImage) -> Result<Vec<f32>, EncoderError> {
            Ok(vec![0.5; 3])
        }
    }

    /// Records how many `encode` calls overlap.
    struct TrackingEncoder {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    impl ImageEncoder for TrackingEncoder {
        fn name(&self) -> &str {
            "tracking"
        }

        fn dimension(&self) -> Option<usize> {
            Some(2)
        }

        fn encode(&self, _image: &DynamicImage) -> Result<Vec<f32>, EncoderError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(5));
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![1.0, 0.0])
        }
    }

    #[test]
    fn test_non_reentrant_encoder_calls_are_serialized() {
        let peak = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = Arc::new(EncoderHandle::ready(TrackingEncoder {
            active: Arc::new(AtomicUsize::new(0)),
            peak: peak.clone(),
            calls: calls.clone(),
        }));

        let img = gradient(8, 8, 0);
        std::thread::scope(|scope| {
            for t in 0..8 {
                let handle = handle.clone();
                let img = &img;
                scope.spawn(move || {
                    for i in 0..4 {
                        let name = format!("t{t}-{i}.png");
                        assert_eq!(handle.encode(&name, img).unwrap(), vec![1.0, 0.0]);
                    }
                });
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 32);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lazy_handle_loads_exactly_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let handle = EncoderHandle::lazy(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ConstantEncoder {
                value: vec![1.0, 0.0],
            }) as Box<dyn ImageEncoder>)
        });

        assert!(!handle.is_loaded());
        assert_eq!(loads.load(Ordering::SeqCst), 0);

        let img = gradient(8, 8, 0);
        for _ in 0..3 {
            assert_eq!(handle.encode("a.png", &img).unwrap(), vec![1.0, 0.0]);
        }

        assert!(handle.is_loaded());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_load_failure_is_cached_and_not_retried() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let handle = EncoderHandle::lazy(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::encoder_unavailable("weights missing"))
        });

        let img = gradient(8, 8, 0);
        for _ in 0..2 {
            let err = handle.encode("a.png", &img).unwrap_err();
            assert!(matches!(err, EngineError::EncoderUnavailable { ref reason } if reason == "weights missing"));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(!handle.is_loaded());
    }

    #[test]
    fn test_eager_handle_fails_fast() {
        let result = EncoderHandle::eager(|| Err(EngineError::encoder_unavailable("no model")));
        assert!(matches!(result, Err(EngineError::EncoderUnavailable { .. })));
    }

    #[test]
    fn test_unexpected_dimension_is_encode_error() {
        let handle = EncoderHandle::ready(WrongSizeEncoder);
        let err = handle.encode("odd.png", &gradient(8, 8, 0)).unwrap_err();
        assert!(matches!(err, EngineError::Encode { ref image, .. } if image == "odd.png"));
    }

    #[test]
    fn test_extractor_rejects_undecodable_bytes() {
        let extractor = EmbeddingExtractor::new(Arc::new(EncoderHandle::ready(ThumbnailEncoder::new())));
        let err = extractor.embed_bytes("bad.jpg", &[]).unwrap_err();
        assert!(matches!(err, EngineError::Decode { .. }));
    }

    #[test]
    fn test_thumbnail_encoder_is_unit_length() {
        let extractor = EmbeddingExtractor::new(Arc::new(EncoderHandle::ready(ThumbnailEncoder::new())));
        let embedding = extractor
            .embed_bytes("grad.png", &png_bytes(&gradient(64, 64, 0)))
            .unwrap();

        assert_eq!(embedding.len(), 256);
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_thumbnail_encoder_blank_image_is_zero_vector() {
        let embedding = ThumbnailEncoder::new().encode(&solid(32, 32, 128)).unwrap();
        assert!(embedding.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_l2_normalize() {
        assert_eq!(l2_normalize(&[3.0, 4.0]), vec![0.6, 0.8]);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
