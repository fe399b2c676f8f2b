//! CLIP ViT-B/32 visual encoder running through ONNX Runtime.
//!
//! Only available with the `clip` cargo feature. Without it, [`ClipEncoder::load`]
//! reports the encoder as unavailable so callers can fall back to hashes or the
//! thumbnail encoder.

use std::path::{Path, PathBuf};

use crate::core::embedding::ImageEncoder;
use crate::core::error::EngineError;

pub const CLIP_INPUT_SIZE: u32 = 224;
pub const CLIP_EMBEDDING_DIM: usize = 512;

/// Per-channel normalisation used when CLIP was trained.
pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

#[derive(Debug, Clone)]
pub struct ClipConfig {
    pub model_path: PathBuf,
    pub intra_threads: usize,
}

impl ClipConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            intra_threads: 4,
        }
    }
}

fn check_model_file(path: &Path) -> Result<(), EngineError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(EngineError::encoder_unavailable(format!(
            "CLIP vision model not found at {}",
            path.display()
        )))
    }
}

#[cfg(feature = "clip")]
pub use model::ClipEncoder;

#[cfg(feature = "clip")]
mod model {
    use super::*;
    use crate::core::embedding::{EncoderError, l2_normalize};
    use image::{DynamicImage, GenericImageView, imageops::FilterType};
    use log::debug;
    use ndarray::Array4;
    use ort::session::{Session, builder::GraphOptimizationLevel};
    use ort::value::Tensor;
    use std::sync::Mutex;

    pub struct ClipEncoder {
        session: Mutex<Session>,
        input_name: String,
        output_name: String,
    }

    impl ClipEncoder {
        pub fn load(config: &ClipConfig) -> Result<Self, EngineError> {
            check_model_file(&config.model_path)?;

            debug!("Loading CLIP vision model from {}", config.model_path.display());

            let session = Session::builder()
                .map_err(EngineError::encoder_unavailable)?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(EngineError::encoder_unavailable)?
                .with_intra_threads(config.intra_threads)
                .map_err(EngineError::encoder_unavailable)?
                .commit_from_file(&config.model_path)
                .map_err(|e| {
                    EngineError::encoder_unavailable(format!("failed to load vision model: {}", e))
                })?;

            let input_name = session
                .inputs
                .first()
                .map(|i| i.name.clone())
                .unwrap_or_else(|| "pixel_values".into());
            let output_name = session
                .outputs
                .first()
                .map(|o| o.name.clone())
                .unwrap_or_else(|| "image_embeds".into());

            Ok(Self {
                session: Mutex::new(session),
                input_name,
                output_name,
            })
        }

        /// Shortest edge to 224, centre crop, CLIP mean/std, NCHW.
        fn preprocess(&self, image: &DynamicImage) -> Array4<f32> {
            let size = CLIP_INPUT_SIZE;
            let (w, h) = image.dimensions();

            let scale = size as f32 / w.min(h) as f32;
            let new_w = ((w as f32) * scale).round().max(size as f32) as u32;
            let new_h = ((h as f32) * scale).round().max(size as f32) as u32;
            let resized = image
                .resize_exact(new_w, new_h, FilterType::CatmullRom)
                .to_rgb8();

            let start_x = (new_w - size) / 2;
            let start_y = (new_h - size) / 2;

            let mut array = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
            for y in 0..size as usize {
                for x in 0..size as usize {
                    let pixel = resized.get_pixel(start_x + x as u32, start_y + y as u32);
                    for c in 0..3 {
                        array[[0, c, y, x]] = (pixel[c] as f32 / 255.0 - CLIP_MEAN[c]) / CLIP_STD[c];
                    }
                }
            }
            array
        }
    }

    impl ImageEncoder for ClipEncoder {
        fn name(&self) -> &str {
            "clip-vit-b-32"
        }

        fn dimension(&self) -> Option<usize> {
            Some(CLIP_EMBEDDING_DIM)
        }

        fn encode(&self, image: &DynamicImage) -> Result<Vec<f32>, EncoderError> {
            let pixel_values = self.preprocess(image);

            let input_tensor = Tensor::from_array(pixel_values)
                .map_err(|e| EncoderError(format!("failed to create input tensor: {}", e)))?;

            let mut session = self
                .session
                .lock()
                .map_err(|_| EncoderError("vision session lock poisoned".to_string()))?;

            let outputs = session
                .run(ort::inputs![self.input_name.as_str() => input_tensor])
                .map_err(|e| EncoderError(format!("vision inference failed: {}", e)))?;

            let output = outputs
                .get(self.output_name.as_str())
                .ok_or_else(|| EncoderError(format!("no output '{}'", self.output_name)))?;

            let (_shape, data) = output
                .try_extract_tensor::<f32>()
                .map_err(|e| EncoderError(format!("failed to extract embedding: {}", e)))?;

            Ok(l2_normalize(data))
        }
    }
}

/// Uninhabited without the `clip` feature: loading always fails.
#[cfg(not(feature = "clip"))]
pub enum ClipEncoder {}

#[cfg(not(feature = "clip"))]
impl ClipEncoder {
    pub fn load(config: &ClipConfig) -> Result<Self, EngineError> {
        check_model_file(&config.model_path)?;
        Err(EngineError::encoder_unavailable(
            "neardup was built without the `clip` feature",
        ))
    }
}

/// Load the CLIP encoder boxed for an [`EncoderHandle`](crate::core::embedding::EncoderHandle).
pub fn load_encoder(config: &ClipConfig) -> Result<Box<dyn ImageEncoder>, EngineError> {
    #[cfg(feature = "clip")]
    {
        let encoder: Box<dyn ImageEncoder> = Box::new(ClipEncoder::load(config)?);
        Ok(encoder)
    }
    #[cfg(not(feature = "clip"))]
    {
        ClipEncoder::load(config).map(|never| match never {})
    }
}
