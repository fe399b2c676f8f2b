use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::core::duplicate::DEFAULT_THRESHOLD;
use crate::core::hash::DEFAULT_HASH_SIZE;
use crate::core::similarity::{ComparisonMode, HashAggregate};
use crate::services::scanner::DEFAULT_EXTENSIONS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    Clip,
    #[default]
    Thumbnail,
    None,
}

impl FromStr for EncoderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "clip" => Ok(Self::Clip),
            "thumbnail" => Ok(Self::Thumbnail),
            "none" => Ok(Self::None),
            other => Err(format!(
                "unknown encoder '{}' (expected clip, thumbnail or none)",
                other
            )),
        }
    }
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Clip => "clip",
            Self::Thumbnail => "thumbnail",
            Self::None => "none",
        })
    }
}

/// User settings, read from `config.json`. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Fingerprint store; `<data_dir>/neardup/fingerprints.jsonl` when unset.
    pub store_path: Option<PathBuf>,
    pub threshold: f64,
    pub mode: ComparisonMode,
    pub hash_aggregate: HashAggregate,
    pub encoder: EncoderKind,
    /// ONNX vision model, required when `encoder` is `clip`.
    pub model_path: Option<PathBuf>,
    pub hash_size: u32,
    pub timeout_secs: Option<u64>,
    pub extensions: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: None,
            threshold: DEFAULT_THRESHOLD,
            mode: ComparisonMode::default(),
            hash_aggregate: HashAggregate::default(),
            encoder: EncoderKind::default(),
            model_path: None,
            hash_size: DEFAULT_HASH_SIZE,
            timeout_secs: None,
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Config {
    /// `<config_dir>/neardup/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("neardup").join("config.json"))
    }

    /// Load from `path` if given, else from the default location. A missing
    /// default file yields defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::from_file(&path),
                _ => {
                    debug!("No config file found, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ConfigError::Invalid(format!(
                "threshold {} is outside [0, 1]",
                self.threshold
            )));
        }
        if self.hash_size < 2 {
            return Err(ConfigError::Invalid(format!(
                "hash_size must be at least 2, got {}",
                self.hash_size
            )));
        }
        if self.extensions.is_empty() {
            return Err(ConfigError::Invalid("no image extensions configured".into()));
        }
        if self.encoder == EncoderKind::Clip && self.model_path.is_none() {
            return Err(ConfigError::Invalid(
                "encoder 'clip' requires model_path".into(),
            ));
        }
        Ok(())
    }
}
