//! Segment assembly and leakage-free partitioning.
//!
//! Records are split by name before any segment is cut, so a recording never
//! contributes to both sides of a train/test boundary.

use crate::{
    config::{DatasetConfig, N_CLASSES},
    error::{ApneaError, Result},
    signal::segment,
};
use log::{info, warn};
use ndarray::{Array2, Axis};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

/// Anything that can enumerate records and hand back each record's primary
/// (RR interval) sequence.
pub trait SequenceSource {
    fn list_records(&self) -> Vec<String>;
    /// `None` when the record could not be loaded; the source logs why.
    fn load_sequence(&self, name: &str) -> Option<Vec<f64>>;
}

/// Record-level labeling policy: names starting with the control prefix are
/// Normal (0), everything else Apnea (1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLabeler {
    pub control_prefix: String,
}

impl RecordLabeler {
    pub fn new(control_prefix: impl Into<String>) -> Self {
        Self {
            control_prefix: control_prefix.into(),
        }
    }

    pub fn from_config(cfg: &DatasetConfig) -> Self {
        Self::new(cfg.control_prefix.clone())
    }

    pub fn label(&self, record_name: &str) -> u8 {
        if record_name.starts_with(&self.control_prefix) {
            0
        } else {
            1
        }
    }
}

impl Default for RecordLabeler {
    fn default() -> Self {
        Self::new("C")
    }
}

/// Segments of every record in `record_names`, stacked row-wise, with the
/// record's label repeated per segment. Records that fail to load or are
/// shorter than one segment are skipped.
pub fn get_segmented_dataset<S: SequenceSource + ?Sized>(
    source: &S,
    record_names: &[String],
    segment_len: usize,
    labeler: &RecordLabeler,
) -> Result<(Array2<f64>, Vec<u8>)> {
    if segment_len == 0 {
        return Err(ApneaError::InvalidArgument(
            "segment length must be positive".into(),
        ));
    }
    let mut x = Array2::<f64>::zeros((0, segment_len));
    let mut y = Vec::new();
    for name in record_names {
        let Some(sequence) = source.load_sequence(name) else {
            warn!("skipping {name}: no data");
            continue;
        };
        if sequence.len() < segment_len {
            info!(
                "skipping {name}: {} samples is shorter than one segment of {segment_len}",
                sequence.len()
            );
            continue;
        }
        let label = labeler.label(name);
        let segments = segment(&sequence, segment_len, 0)?;
        y.extend(std::iter::repeat(label).take(segments.nrows()));
        x.append(Axis(0), segments.view())
            .map_err(|e| ApneaError::InvalidArgument(e.to_string()))?;
    }
    info!(
        "assembled {} segments from {} records",
        x.nrows(),
        record_names.len()
    );
    Ok((x, y))
}

/// Disjoint record-name partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordSplit {
    pub train: Vec<String>,
    pub validation: Vec<String>,
    pub test: Vec<String>,
}

fn take_fraction(pool: &mut Vec<String>, fraction: f64) -> Vec<String> {
    // keep at least one record behind so no class vanishes from training
    let n = ((pool.len() as f64) * fraction).round() as usize;
    let n = n.min(pool.len().saturating_sub(1));
    pool.split_off(pool.len() - n)
}

/// Stratified split of record names: per class, a seeded shuffle, then the
/// test share, then the validation share of what remains.
pub fn split_records(
    names: &[String],
    labeler: &RecordLabeler,
    test_fraction: f64,
    validation_fraction: f64,
    seed: u64,
) -> Result<RecordSplit> {
    for frac in [test_fraction, validation_fraction] {
        if !(0.0..1.0).contains(&frac) {
            return Err(ApneaError::InvalidArgument(format!(
                "split fraction {frac} must be in [0, 1)"
            )));
        }
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut split = RecordSplit::default();
    for class in 0..N_CLASSES as u8 {
        let mut pool: Vec<String> = names
            .iter()
            .filter(|n| labeler.label(n) == class)
            .cloned()
            .collect();
        pool.sort();
        pool.shuffle(&mut rng);
        split.test.extend(take_fraction(&mut pool, test_fraction));
        split
            .validation
            .extend(take_fraction(&mut pool, validation_fraction));
        split.train.extend(pool);
    }
    for part in [&mut split.train, &mut split.validation, &mut split.test] {
        part.sort();
    }
    Ok(split)
}

/// Stratified k-fold over row labels: each class is shuffled with `seed` and
/// dealt round-robin into `k` folds. Returns `(train_idx, val_idx)` per fold.
pub fn stratified_kfold(labels: &[u8], k: usize, seed: u64) -> Result<Vec<(Vec<usize>, Vec<usize>)>> {
    if k < 2 {
        return Err(ApneaError::InvalidArgument(format!(
            "k-fold needs at least 2 folds, got {k}"
        )));
    }
    if labels.len() < k {
        return Err(ApneaError::InvalidArgument(format!(
            "cannot split {} samples into {k} folds",
            labels.len()
        )));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut fold_of = vec![0usize; labels.len()];
    let mut offset = 0;
    for class in 0..N_CLASSES as u8 {
        let mut idx: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == class).collect();
        idx.shuffle(&mut rng);
        for (pos, &i) in idx.iter().enumerate() {
            fold_of[i] = (offset + pos) % k;
        }
        // continue dealing where the previous class stopped to balance fold sizes
        offset = (offset + idx.len()) % k;
    }
    Ok((0..k)
        .map(|fold| {
            let (val, train): (Vec<usize>, Vec<usize>) =
                (0..labels.len()).partition(|&i| fold_of[i] == fold);
            (train, val)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    struct InMemory(BTreeMap<String, Vec<f64>>);

    impl SequenceSource for InMemory {
        fn list_records(&self) -> Vec<String> {
            self.0.keys().cloned().collect()
        }
        fn load_sequence(&self, name: &str) -> Option<Vec<f64>> {
            self.0.get(name).cloned()
        }
    }

    fn source() -> InMemory {
        let mut map = BTreeMap::new();
        // value encodes the record so segments can be traced back
        for (i, name) in ["C01", "C02", "C03", "D01", "D02", "D03", "D04"].iter().enumerate() {
            map.insert(name.to_string(), vec![i as f64; 25]);
        }
        map.insert("D05".into(), vec![99.0; 5]);
        InMemory(map)
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn labels_follow_control_prefix() {
        let labeler = RecordLabeler::default();
        assert_eq!(labeler.label("C12"), 0);
        assert_eq!(labeler.label("D12"), 1);
        assert_eq!(labeler.label("ND3"), 1);
    }

    #[test]
    fn assembles_zero_overlap_segments_with_record_labels() {
        let src = source();
        let (x, y) =
            get_segmented_dataset(&src, &names(&["C01", "D01", "D05", "missing"]), 10, &RecordLabeler::default())
                .unwrap();
        // 25 samples -> 2 segments each; D05 too short; missing skipped
        assert_eq!(x.dim(), (4, 10));
        assert_eq!(y, vec![0, 0, 1, 1]);
        assert!(x.row(0).iter().all(|&v| v == 0.0));
        assert!(x.row(3).iter().all(|&v| v == 3.0));
    }

    #[test]
    fn empty_assembly_keeps_segment_width() {
        let (x, y) = get_segmented_dataset(&source(), &[], 10, &RecordLabeler::default()).unwrap();
        assert_eq!(x.dim(), (0, 10));
        assert!(y.is_empty());
    }

    #[test]
    fn split_is_disjoint_and_stratified() {
        let src = source();
        let all = src.list_records();
        let labeler = RecordLabeler::default();
        let split = split_records(&all, &labeler, 0.2, 0.2, 42).unwrap();
        let train: BTreeSet<_> = split.train.iter().collect();
        let val: BTreeSet<_> = split.validation.iter().collect();
        let test: BTreeSet<_> = split.test.iter().collect();
        assert!(train.is_disjoint(&test));
        assert!(train.is_disjoint(&val));
        assert!(val.is_disjoint(&test));
        assert_eq!(train.len() + val.len() + test.len(), all.len());
        for part in [&split.train, &split.test] {
            assert!(part.iter().any(|n| labeler.label(n) == 0));
            assert!(part.iter().any(|n| labeler.label(n) == 1));
        }
        assert_eq!(split, split_records(&all, &labeler, 0.2, 0.2, 42).unwrap());
    }

    #[test]
    fn segments_never_cross_the_split() {
        let src = source();
        let labeler = RecordLabeler::default();
        let split = split_records(&src.list_records(), &labeler, 0.3, 0.0, 7).unwrap();
        let (x_train, _) = get_segmented_dataset(&src, &split.train, 10, &labeler).unwrap();
        let (x_test, _) = get_segmented_dataset(&src, &split.test, 10, &labeler).unwrap();
        let train_ids: BTreeSet<i64> = x_train.column(0).iter().map(|&v| v as i64).collect();
        let test_ids: BTreeSet<i64> = x_test.column(0).iter().map(|&v| v as i64).collect();
        assert!(!test_ids.is_empty());
        assert!(train_ids.is_disjoint(&test_ids));
    }

    #[test]
    fn kfold_covers_every_row_once() {
        let labels = vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1];
        let folds = stratified_kfold(&labels, 5, 42).unwrap();
        assert_eq!(folds.len(), 5);
        let mut seen = vec![0; labels.len()];
        for (train, val) in &folds {
            assert_eq!(train.len() + val.len(), labels.len());
            for &i in val {
                seen[i] += 1;
                assert!(!train.contains(&i));
            }
        }
        assert!(seen.iter().all(|&c| c == 1));
        let sizes: Vec<usize> = folds.iter().map(|(_, v)| v.len()).collect();
        assert!(sizes.iter().max().unwrap() - sizes.iter().min().unwrap() <= 1);
    }

    #[test]
    fn kfold_rejects_bad_arguments() {
        assert!(stratified_kfold(&[0, 1], 1, 0).is_err());
        assert!(stratified_kfold(&[0, 1], 3, 0).is_err());
    }
}
