use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use walkdir::WalkDir;

use crate::core::embedding::EmbeddingExtractor;
use crate::core::error::EngineError;
use crate::core::fingerprint::FingerprintRecord;
use crate::core::hash::HashExtractor;
use crate::core::image::decode_image;

pub const DEFAULT_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tiff", "tif", "webp"];

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Recursively collect image files under `dir` whose extension is in
/// `extensions` (case-insensitive), sorted by path.
pub fn discover_images(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>, ScanError> {
    if !dir.is_dir() {
        return Err(ScanError::InvalidPath {
            path: dir.to_string_lossy().to_string(),
        });
    }

    let mut images: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(err) => {
                warn!("Skipping unreadable entry: {}", err);
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext)))
                .unwrap_or(false)
        })
        .collect();

    images.sort();
    Ok(images)
}

/// Decodes an image once and produces its full fingerprint record.
pub struct Fingerprinter {
    hasher: HashExtractor,
    embedder: Option<EmbeddingExtractor>,
}

impl Fingerprinter {
    pub fn new(hasher: HashExtractor, embedder: Option<EmbeddingExtractor>) -> Self {
        Self { hasher, embedder }
    }

    pub fn embedder(&self) -> Option<&EmbeddingExtractor> {
        self.embedder.as_ref()
    }

    pub fn fingerprint_bytes(
        &self,
        filename: &str,
        bytes: &[u8],
    ) -> Result<FingerprintRecord, EngineError> {
        let img = decode_image(filename, bytes)?;
        let hashes = self.hasher.hash_image(&img);
        let embedding = match &self.embedder {
            Some(embedder) => Some(embedder.embed_image(filename, &img)?),
            None => None,
        };

        Ok(FingerprintRecord::new(filename, hashes, embedding).with_digest(content_digest(bytes)))
    }

    pub fn fingerprint_file(&self, path: &Path) -> Result<FingerprintRecord, EngineError> {
        let filename = path.to_string_lossy().to_string();
        let bytes = read_image(&filename, path)?;
        self.fingerprint_bytes(&filename, &bytes)
    }
}

pub fn content_digest(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

fn read_image(filename: &str, path: &Path) -> Result<Vec<u8>, EngineError> {
    fs::read(path).map_err(|e| EngineError::decode(filename, format!("unreadable file: {}", e)))
}

#[derive(Debug)]
pub struct Rejection {
    pub filename: String,
    pub error: EngineError,
}

#[derive(Debug, Default)]
pub struct IngestOutcome {
    /// New or re-fingerprinted records, in discovery order.
    pub records: Vec<FingerprintRecord>,
    pub unchanged: usize,
    pub rejected: Vec<Rejection>,
}

enum FileOutcome {
    Fingerprinted(FingerprintRecord),
    Unchanged,
    Rejected(Rejection),
}

pub struct Ingestor {
    fingerprinter: Fingerprinter,
    show_progress: bool,
    force: bool,
}

impl Ingestor {
    pub fn new(fingerprinter: Fingerprinter) -> Self {
        Self {
            fingerprinter,
            show_progress: false,
            force: false,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Re-fingerprint files even when their content digest is unchanged.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Fingerprint `paths` in parallel.
    ///
    /// A file already in `existing` (matched by filename) keeps its id; if its
    /// digest is unchanged it is skipped unless forced. Per-file decode and
    /// encode failures are collected as rejections. An unavailable encoder
    /// aborts before any file is read.
    pub fn ingest(
        &self,
        paths: &[PathBuf],
        existing: &[FingerprintRecord],
    ) -> Result<IngestOutcome, ScanError> {
        if let Some(embedder) = self.fingerprinter.embedder() {
            embedder.handle().ensure_loaded()?;
        }

        let known: HashMap<&str, &FingerprintRecord> =
            existing.iter().map(|r| (r.filename.as_str(), r)).collect();

        let progress = if self.show_progress {
            let pb = ProgressBar::new(paths.len() as u64);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
            ) {
                pb.set_style(style.progress_chars("#>-"));
            }
            pb.set_message("fingerprinting");
            pb
        } else {
            ProgressBar::hidden()
        };

        let started = Instant::now();
        let outcomes: Vec<FileOutcome> = paths
            .par_iter()
            .map(|path| {
                let outcome = self.ingest_one(path, &known);
                progress.inc(1);
                outcome
            })
            .collect();
        progress.finish_and_clear();

        let mut result = IngestOutcome::default();
        for outcome in outcomes {
            match outcome {
                FileOutcome::Fingerprinted(record) => result.records.push(record),
                FileOutcome::Unchanged => result.unchanged += 1,
                FileOutcome::Rejected(rejection) => {
                    if rejection.error.is_fatal() {
                        return Err(ScanError::Engine(rejection.error));
                    }
                    result.rejected.push(rejection);
                }
            }
        }

        info!(
            "Fingerprinted {} file(s) in {:.2?}: {} new/updated, {} unchanged, {} rejected",
            paths.len(),
            started.elapsed(),
            result.records.len(),
            result.unchanged,
            result.rejected.len()
        );
        Ok(result)
    }

    fn ingest_one(&self, path: &Path, known: &HashMap<&str, &FingerprintRecord>) -> FileOutcome {
        let filename = path.to_string_lossy().to_string();
        let reject = |error: EngineError| {
            warn!("Rejected {}: {}", filename, error);
            FileOutcome::Rejected(Rejection {
                filename: filename.clone(),
                error,
            })
        };

        let bytes = match read_image(&filename, path) {
            Ok(b) => b,
            Err(e) => return reject(e),
        };

        let previous = known.get(filename.as_str()).copied();
        if let Some(prev) = previous {
            if !self.force && prev.digest.as_deref() == Some(content_digest(&bytes).as_str()) {
                debug!("Unchanged: {}", filename);
                return FileOutcome::Unchanged;
            }
        }

        match self.fingerprinter.fingerprint_bytes(&filename, &bytes) {
            Ok(mut record) => {
                if let Some(prev) = previous {
                    record.id = prev.id;
                }
                FileOutcome::Fingerprinted(record)
            }
            Err(e) => reject(e),
        }
    }
}
