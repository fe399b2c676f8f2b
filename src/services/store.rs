use log::{debug, warn};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::core::fingerprint::FingerprintRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Could not determine a data directory for the fingerprint store")]
    NoDataDir,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub replaced: usize,
}

/// Fingerprint records kept as JSON Lines, one record per line, in insertion order.
pub struct FingerprintStore {
    path: PathBuf,
}

impl FingerprintStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path })
    }

    /// `<data_dir>/neardup/fingerprints.jsonl`
    pub fn default_path() -> Result<PathBuf, StoreError> {
        let data_dir = dirs::data_dir().ok_or(StoreError::NoDataDir)?;
        Ok(data_dir.join("neardup").join("fingerprints.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records in file order. Malformed lines are logged and skipped.
    pub fn load(&self) -> Result<Vec<FingerprintRecord>, StoreError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<FingerprintRecord>(&line) {
                Ok(record) => records.push(record),
                Err(err) => warn!(
                    "Skipping malformed record on line {} of {}: {}",
                    i + 1,
                    self.path.display(),
                    err
                ),
            }
        }

        debug!("Loaded {} record(s) from {}", records.len(), self.path.display());
        Ok(records)
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.load()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<FingerprintRecord>, StoreError> {
        Ok(self.load()?.into_iter().find(|r| r.id == id))
    }

    pub fn find_by_filename(&self, filename: &str) -> Result<Option<FingerprintRecord>, StoreError> {
        Ok(self.load()?.into_iter().find(|r| r.filename == filename))
    }

    /// Replace records with a matching `id` in place and append the rest.
    pub fn upsert_all(&self, incoming: Vec<FingerprintRecord>) -> Result<UpsertSummary, StoreError> {
        let mut records = self.load()?;
        let mut position: HashMap<Uuid, usize> =
            records.iter().enumerate().map(|(i, r)| (r.id, i)).collect();

        let mut summary = UpsertSummary::default();
        for record in incoming {
            match position.get(&record.id) {
                Some(&i) => {
                    records[i] = record;
                    summary.replaced += 1;
                }
                None => {
                    position.insert(record.id, records.len());
                    records.push(record);
                    summary.inserted += 1;
                }
            }
        }

        self.write_all(&records)?;
        Ok(summary)
    }

    pub fn upsert(&self, record: FingerprintRecord) -> Result<UpsertSummary, StoreError> {
        self.upsert_all(vec![record])
    }

    fn write_all(&self, records: &[FingerprintRecord]) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for record in records {
                serde_json::to_writer(&mut out, record)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
