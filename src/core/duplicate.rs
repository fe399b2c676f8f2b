// Exhaustive pairwise duplicate detection.
//
// Every unordered pair (i, j), i < j, of comparable records is scored once.
// Results keep input order: all pairs of row i precede those of row i + 1,
// and within a row j ascends. Rows are scanned in parallel but collected in
// index order, so repeated runs return identical output.

use log::{debug, info};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::core::error::EngineError;
use crate::core::fingerprint::{DuplicatePair, FingerprintRecord};
use crate::core::similarity::SimilarityEngine;

pub const DEFAULT_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone)]
pub struct MatchOptions {
    pub threshold: f64,
    pub engine: SimilarityEngine,
    /// Abort the scan once this much time has elapsed.
    pub deadline: Option<Duration>,
    pub cancel: Option<Arc<AtomicBool>>,
    pub parallel: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            engine: SimilarityEngine::default(),
            deadline: None,
            cancel: None,
            parallel: true,
        }
    }
}

pub struct DuplicateDetector {
    options: MatchOptions,
}

impl DuplicateDetector {
    pub fn new(options: MatchOptions) -> Self {
        Self { options }
    }

    pub fn with_threshold(threshold: f64) -> Self {
        Self::new(MatchOptions {
            threshold,
            ..MatchOptions::default()
        })
    }

    /// Find every pair of records scoring at or above the threshold.
    ///
    /// Records with neither hashes nor an embedding are skipped, as are pairs
    /// that share no comparable signal. Any other comparison failure aborts the
    /// scan and is returned with both image names attached.
    pub fn find_duplicates(
        &self,
        records: &[FingerprintRecord],
    ) -> Result<Vec<DuplicatePair>, EngineError> {
        let threshold = self.options.threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(EngineError::InvalidThreshold { threshold });
        }

        let candidates: Vec<&FingerprintRecord> = records
            .iter()
            .filter(|r| {
                let keep = r.has_signal();
                if !keep {
                    debug!("Skipping {} ({}): no hashes or embedding", r.filename, r.id);
                }
                keep
            })
            .collect();

        if candidates.len() < 2 {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let n = candidates.len();
        let scan_row = |i: usize| -> Result<Vec<DuplicatePair>, EngineError> {
            self.check_interrupted(started)?;

            let a = candidates[i];
            let mut row = Vec::new();
            for b in &candidates[i + 1..] {
                if a.id == b.id {
                    debug!("Record {} ({}) listed twice, not pairing it with itself", a.id, a.filename);
                    continue;
                }
                if let Some(score) = self.options.engine.compare(a, b)? {
                    if score >= threshold {
                        row.push(DuplicatePair {
                            image1: a.filename.clone(),
                            image2: b.filename.clone(),
                            id1: a.id,
                            id2: b.id,
                            score,
                        });
                    }
                }
            }
            Ok(row)
        };

        let rows: Vec<Vec<DuplicatePair>> = if self.options.parallel {
            (0..n).into_par_iter().map(scan_row).collect::<Result<_, _>>()?
        } else {
            (0..n).map(scan_row).collect::<Result<_, _>>()?
        };

        let pairs: Vec<DuplicatePair> = rows.into_iter().flatten().collect();
        info!(
            "Compared {} records ({} pairs) in {:.2?}: {} duplicate pair(s) at threshold {}",
            n,
            n * (n - 1) / 2,
            started.elapsed(),
            pairs.len(),
            threshold
        );
        Ok(pairs)
    }

    fn check_interrupted(&self, started: Instant) -> Result<(), EngineError> {
        if let Some(cancel) = &self.options.cancel {
            if cancel.load(Ordering::Relaxed) {
                return Err(EngineError::Cancelled);
            }
        }
        if let Some(limit) = self.options.deadline {
            if started.elapsed() > limit {
                return Err(EngineError::DeadlineExceeded { limit });
            }
        }
        Ok(())
    }
}

/// `find_duplicates` with default options and the given threshold.
pub fn find_duplicates(
    records: &[FingerprintRecord],
    threshold: f64,
) -> Result<Vec<DuplicatePair>, EngineError> {
    DuplicateDetector::with_threshold(threshold).find_duplicates(records)
}

/// Merge pairs into connected groups of filenames.
///
/// Records are joined by id. Groups are ordered by their first appearance in
/// `pairs`, members likewise.
pub fn group_pairs(pairs: &[DuplicatePair]) -> Vec<Vec<String>> {
    let mut index: HashMap<Uuid, usize> = HashMap::new();
    let mut names: Vec<&str> = Vec::new();
    for pair in pairs {
        for (id, name) in [(pair.id1, pair.image1.as_str()), (pair.id2, pair.image2.as_str())] {
            index.entry(id).or_insert_with(|| {
                names.push(name);
                names.len() - 1
            });
        }
    }

    let mut parent: Vec<usize> = (0..names.len()).collect();
    fn root(parent: &mut [usize], mut x: usize) -> usize {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }

    for pair in pairs {
        let a = root(&mut parent, index[&pair.id1]);
        let b = root(&mut parent, index[&pair.id2]);
        if a != b {
            let (keep, merge) = if a < b { (a, b) } else { (b, a) };
            parent[merge] = keep;
        }
    }

    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut group_of_root: HashMap<usize, usize> = HashMap::new();
    for (i, name) in names.iter().enumerate() {
        let r = root(&mut parent, i);
        let slot = *group_of_root.entry(r).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(name.to_string());
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fingerprint::PerceptualHashes;
    use crate::core::similarity::{ComparisonMode, HashAggregate};

    fn embedded(name: &str, embedding: Vec<f32>) -> FingerprintRecord {
        FingerprintRecord::new(name, PerceptualHashes::default(), Some(embedding))
    }

    fn hashed(name: &str, hash: &str) -> FingerprintRecord {
        FingerprintRecord::new(
            name,
            PerceptualHashes {
                phash: Some(hash.to_string()),
                ahash: Some(hash.to_string()),
                dhash: Some(hash.to_string()),
            },
            None,
        )
    }

    fn bare(name: &str) -> FingerprintRecord {
        FingerprintRecord::new(name, PerceptualHashes::default(), None)
    }

    #[test]
    fn test_empty_and_single_inputs() {
        assert!(find_duplicates(&[], 0.5).unwrap().is_empty());
        assert!(find_duplicates(&[embedded("a", vec![1.0, 0.0])], 0.0).unwrap().is_empty());
    }

    #[test]
    fn test_identical_pair_found_orthogonal_excluded() {
        let records = vec![
            embedded("img0", vec![0.6, 0.8, 0.0]),
            embedded("img1", vec![0.6, 0.8, 0.0]),
            embedded("img2", vec![0.0, 0.0, 1.0]),
        ];

        let pairs = find_duplicates(&records, 0.99).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].image1, "img0");
        assert_eq!(pairs[0].image2, "img1");
        assert_eq!(pairs[0].score, 1.0);
    }

    #[test]
    fn test_threshold_out_of_range() {
        let records = vec![embedded("a", vec![1.0]), embedded("b", vec![1.0])];
        for threshold in [1.5, -0.1, f64::NAN] {
            let err = find_duplicates(&records, threshold).unwrap_err();
            assert!(matches!(err, EngineError::InvalidThreshold { .. }));
        }
    }

    #[test]
    fn test_threshold_checked_even_for_empty_input() {
        assert!(matches!(
            find_duplicates(&[], 1.5),
            Err(EngineError::InvalidThreshold { .. })
        ));
    }

    #[test]
    fn test_boundary_scores_are_inclusive() {
        let records = vec![embedded("a", vec![1.0, 0.0]), embedded("b", vec![0.0, 1.0])];
        // Orthogonal vectors score exactly 0.
        assert_eq!(find_duplicates(&records, 0.0).unwrap().len(), 1);
        assert!(find_duplicates(&records, 0.01).unwrap().is_empty());
    }

    #[test]
    fn test_output_preserves_input_order() {
        let records = vec![
            hashed("a", "ff"),
            hashed("b", "ff"),
            hashed("c", "ff"),
            hashed("d", "00"),
        ];

        let pairs = find_duplicates(&records, 0.9).unwrap();
        let names: Vec<(&str, &str)> = pairs
            .iter()
            .map(|p| (p.image1.as_str(), p.image2.as_str()))
            .collect();
        assert_eq!(names, vec![("a", "b"), ("a", "c"), ("b", "c")]);
    }

    #[test]
    fn test_repeated_runs_are_identical() {
        let records: Vec<FingerprintRecord> = (0..40)
            .map(|i| {
                let angle = (i % 7) as f32 * 0.05;
                embedded(&format!("img{i}"), vec![angle.cos(), angle.sin(), 0.1])
            })
            .collect();

        let first = find_duplicates(&records, 0.995).unwrap();
        let second = find_duplicates(&records, 0.995).unwrap();
        assert!(!first.is_empty());
        assert_eq!(first, second);

        let sequential = DuplicateDetector::new(MatchOptions {
            threshold: 0.995,
            parallel: false,
            ..MatchOptions::default()
        })
        .find_duplicates(&records)
        .unwrap();
        assert_eq!(first, sequential);
    }

    #[test]
    fn test_records_without_signal_are_skipped() {
        let records = vec![bare("ghost1"), hashed("a", "ff"), bare("ghost2"), hashed("b", "ff")];

        let pairs = find_duplicates(&records, 0.0).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!((pairs[0].image1.as_str(), pairs[0].image2.as_str()), ("a", "b"));
    }

    #[test]
    fn test_never_pairs_record_with_itself() {
        let records = vec![hashed("only", "ff"), bare("nothing")];
        assert!(find_duplicates(&records, 0.0).unwrap().is_empty());
    }

    #[test]
    fn test_same_filename_pairs_are_told_apart_by_id() {
        let records = vec![hashed("photo.png", "ff"), hashed("photo.png", "ff")];

        let pairs = find_duplicates(&records, 0.9).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].id1, records[0].id);
        assert_eq!(pairs[0].id2, records[1].id);
        assert_ne!(pairs[0].id1, pairs[0].id2);

        assert_eq!(group_pairs(&pairs), vec![vec!["photo.png", "photo.png"]]);
    }

    #[test]
    fn test_record_listed_twice_is_not_self_paired() {
        let record = hashed("a", "ff");
        let records = vec![record.clone(), record, hashed("b", "ff")];

        let pairs = find_duplicates(&records, 0.9).unwrap();
        let names: Vec<(&str, &str)> = pairs
            .iter()
            .map(|p| (p.image1.as_str(), p.image2.as_str()))
            .collect();
        assert_eq!(names, vec![("a", "b"), ("a", "b")]);
        assert!(pairs.iter().all(|p| p.id1 != p.id2));
    }

    #[test]
    fn test_dimension_mismatch_aborts_scan() {
        let records = vec![embedded("a", vec![1.0, 0.0]), embedded("b", vec![1.0, 0.0, 0.0])];
        let err = find_duplicates(&records, 0.5).unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { images: Some(_), .. }));
    }

    #[test]
    fn test_hash_fallback_mixed_collection() {
        let mut with_embedding = hashed("a", "ff");
        with_embedding.embedding = Some(vec![1.0, 0.0]);
        let records = vec![with_embedding, hashed("b", "ff")];

        let pairs = find_duplicates(&records, 1.0).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].score, 1.0);

        let embedding_only = DuplicateDetector::new(MatchOptions {
            threshold: 0.0,
            engine: SimilarityEngine::new(ComparisonMode::Embedding, HashAggregate::Mean),
            ..MatchOptions::default()
        });
        assert!(embedding_only.find_duplicates(&records).unwrap().is_empty());
    }

    #[test]
    fn test_cancelled_scan() {
        let cancel = Arc::new(AtomicBool::new(true));
        let detector = DuplicateDetector::new(MatchOptions {
            cancel: Some(cancel),
            ..MatchOptions::default()
        });
        let records = vec![hashed("a", "ff"), hashed("b", "ff")];

        assert!(matches!(
            detector.find_duplicates(&records),
            Err(EngineError::Cancelled)
        ));
    }

    #[test]
    fn test_expired_deadline() {
        let detector = DuplicateDetector::new(MatchOptions {
            deadline: Some(Duration::ZERO),
            parallel: false,
            ..MatchOptions::default()
        });
        let records = vec![hashed("a", "ff"), hashed("b", "ff"), hashed("c", "ff")];

        // A zero deadline trips on the second row at the latest.
        let result = detector.find_duplicates(&records);
        assert!(matches!(result, Err(EngineError::DeadlineExceeded { .. })));
    }

    #[test]
    fn test_group_pairs() {
        let id = |name: &str| Uuid::from_u128(name.as_bytes()[0] as u128);
        let pair = |a: &str, b: &str| DuplicatePair {
            image1: a.to_string(),
            image2: b.to_string(),
            id1: id(a),
            id2: id(b),
            score: 1.0,
        };
        let pairs = vec![pair("a", "b"), pair("c", "d"), pair("b", "e"), pair("d", "a")];
        assert_eq!(group_pairs(&pairs), vec![vec!["a", "b", "c", "d", "e"]]);

        let pairs = vec![pair("x", "y"), pair("p", "q")];
        assert_eq!(group_pairs(&pairs), vec![vec!["x", "y"], vec!["p", "q"]]);
    }
}
