//! # Resample Partition
//!
//! A partition is an ordered list of train/held-out splits over a dataset with
//! a fixed number of rows. Every candidate registered with a stack must have
//! produced its held-out predictions under the same partition, so the
//! partition carries an identity ([`PartitionId`]) computed from its contents
//! and is passed around explicitly as an immutable value.

use ahash::RandomState;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;

// Fixed seeds so that the same splits always produce the same fingerprint.
const FINGERPRINT_SEEDS: [u64; 4] = [
    0x9e37_79b9_7f4a_7c15,
    0xc2b2_ae3d_27d4_eb4f,
    0x1656_67b1_9e37_79f9,
    0x85eb_ca77_c2b2_ae63,
];

/// Identity of a resampling partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionId(u64);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// One train/held-out split. Indices refer to rows of the training data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub train: Vec<usize>,
    pub held_out: Vec<usize>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PartitionError {
    #[error("A partition needs at least one fold.")]
    NoFolds,
    #[error("Fold {fold} has an empty held-out set.")]
    EmptyHeldOut { fold: usize },
    #[error("Fold {fold} has an empty training set.")]
    EmptyTrain { fold: usize },
    #[error("Fold {fold} refers to row {row}, but the dataset only has {n_rows} rows.")]
    RowOutOfRange { fold: usize, row: usize, n_rows: usize },
    #[error("Fold {fold} uses row {row} for both training and held-out prediction.")]
    OverlappingSplit { fold: usize, row: usize },
    #[error("Cannot split {n_rows} rows into {folds} folds; need 2 <= folds <= rows.")]
    InvalidFoldCount { n_rows: usize, folds: usize },
    #[error("Expected {expected} fold labels but found {found}.")]
    LabelCountMismatch { expected: usize, found: usize },
}

/// Configuration for generating a v-fold partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResampleConfig {
    pub folds: usize,
    pub seed: u64,
}

impl Default for ResampleConfig {
    fn default() -> Self {
        Self { folds: 5, seed: 42 }
    }
}

/// An immutable, cheaply clonable resampling partition.
#[derive(Debug, Clone)]
pub struct ResamplePartition {
    id: PartitionId,
    n_rows: usize,
    folds: Arc<[Fold]>,
}

impl PartialEq for ResamplePartition {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.n_rows == other.n_rows && self.folds == other.folds
    }
}

impl ResamplePartition {
    /// Validates the splits and computes the partition identity.
    pub fn new(n_rows: usize, folds: Vec<Fold>) -> Result<Self, PartitionError> {
        if folds.is_empty() {
            return Err(PartitionError::NoFolds);
        }

        let mut seen = vec![usize::MAX; n_rows];
        for (fold_idx, fold) in folds.iter().enumerate() {
            if fold.held_out.is_empty() {
                return Err(PartitionError::EmptyHeldOut { fold: fold_idx });
            }
            if fold.train.is_empty() {
                return Err(PartitionError::EmptyTrain { fold: fold_idx });
            }
            for &row in fold.train.iter().chain(fold.held_out.iter()) {
                if row >= n_rows {
                    return Err(PartitionError::RowOutOfRange {
                        fold: fold_idx,
                        row,
                        n_rows,
                    });
                }
            }
            for &row in &fold.held_out {
                seen[row] = fold_idx;
            }
            if let Some(&row) = fold.train.iter().find(|&&row| seen[row] == fold_idx) {
                return Err(PartitionError::OverlappingSplit {
                    fold: fold_idx,
                    row,
                });
            }
        }

        let id = fingerprint(n_rows, &folds);
        Ok(Self {
            id,
            n_rows,
            folds: folds.into(),
        })
    }

    /// Shuffled v-fold cross-validation splits. Fold sizes differ by at most one.
    pub fn v_fold(n_rows: usize, folds: usize, seed: u64) -> Result<Self, PartitionError> {
        if folds < 2 || folds > n_rows {
            return Err(PartitionError::InvalidFoldCount { n_rows, folds });
        }

        let mut order: Vec<usize> = (0..n_rows).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);

        let base = n_rows / folds;
        let remainder = n_rows % folds;
        let mut splits = Vec::with_capacity(folds);
        let mut start = 0;
        for fold_idx in 0..folds {
            let size = if fold_idx < remainder { base + 1 } else { base };
            let mut held_out = order[start..start + size].to_vec();
            let mut train: Vec<usize> = order[..start]
                .iter()
                .chain(order[start + size..].iter())
                .copied()
                .collect();
            held_out.sort_unstable();
            train.sort_unstable();
            splits.push(Fold { train, held_out });
            start += size;
        }

        Self::new(n_rows, splits)
    }

    /// Builds a partition from one fold label per row: rows sharing a label form
    /// that fold's held-out set and every other row is used for training.
    /// Folds are ordered by label.
    pub fn from_fold_labels(labels: &[usize]) -> Result<Self, PartitionError> {
        let n_rows = labels.len();
        let mut distinct: Vec<usize> = labels.to_vec();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.len() < 2 {
            return Err(PartitionError::InvalidFoldCount {
                n_rows,
                folds: distinct.len(),
            });
        }

        let folds = distinct
            .iter()
            .map(|&label| {
                let (held_out, train): (Vec<usize>, Vec<usize>) =
                    (0..n_rows).partition(|&row| labels[row] == label);
                Fold { train, held_out }
            })
            .collect();
        Self::new(n_rows, folds)
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn folds(&self) -> &[Fold] {
        &self.folds
    }

    pub fn num_folds(&self) -> usize {
        self.folds.len()
    }

    /// Total number of held-out observations across folds, which is the row
    /// count of any stacked prediction matrix built over this partition.
    pub fn held_out_len(&self) -> usize {
        self.folds.iter().map(|fold| fold.held_out.len()).sum()
    }

    /// Training-data row index of every stacked row, fold-major.
    pub fn held_out_rows(&self) -> Vec<usize> {
        self.folds
            .iter()
            .flat_map(|fold| fold.held_out.iter().copied())
            .collect()
    }
}

fn fingerprint(n_rows: usize, folds: &[Fold]) -> PartitionId {
    let [k0, k1, k2, k3] = FINGERPRINT_SEEDS;
    let mut hasher = RandomState::with_seeds(k0, k1, k2, k3).build_hasher();
    n_rows.hash(&mut hasher);
    folds.len().hash(&mut hasher);
    for fold in folds {
        fold.train.hash(&mut hasher);
        fold.held_out.hash(&mut hasher);
    }
    PartitionId(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v_fold_holds_out_every_row_exactly_once() {
        let partition = ResamplePartition::v_fold(23, 5, 7).unwrap();
        assert_eq!(partition.num_folds(), 5);
        assert_eq!(partition.held_out_len(), 23);

        let mut rows = partition.held_out_rows();
        rows.sort_unstable();
        assert_eq!(rows, (0..23).collect::<Vec<_>>());

        let sizes: Vec<usize> = partition
            .folds()
            .iter()
            .map(|fold| fold.held_out.len())
            .collect();
        assert_eq!(sizes, vec![5, 5, 5, 4, 4]);
        for fold in partition.folds() {
            assert_eq!(fold.train.len() + fold.held_out.len(), 23);
        }
    }

    #[test]
    fn identity_follows_contents() {
        let a = ResamplePartition::v_fold(40, 4, 11).unwrap();
        let b = ResamplePartition::v_fold(40, 4, 11).unwrap();
        let c = ResamplePartition::v_fold(40, 4, 12).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a, b);
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn rejects_invalid_splits() {
        let overlapping = vec![Fold {
            train: vec![0, 1, 2],
            held_out: vec![2, 3],
        }];
        assert_eq!(
            ResamplePartition::new(4, overlapping),
            Err(PartitionError::OverlappingSplit { fold: 0, row: 2 })
        );

        let out_of_range = vec![Fold {
            train: vec![0],
            held_out: vec![9],
        }];
        assert_eq!(
            ResamplePartition::new(4, out_of_range),
            Err(PartitionError::RowOutOfRange {
                fold: 0,
                row: 9,
                n_rows: 4
            })
        );

        assert_eq!(
            ResamplePartition::v_fold(3, 5, 0),
            Err(PartitionError::InvalidFoldCount {
                n_rows: 3,
                folds: 5
            })
        );
    }

    #[test]
    fn fold_labels_define_held_out_sets() {
        let partition = ResamplePartition::from_fold_labels(&[2, 1, 2, 1, 3, 3]).unwrap();
        let held: Vec<Vec<usize>> = partition
            .folds()
            .iter()
            .map(|fold| fold.held_out.clone())
            .collect();
        assert_eq!(held, vec![vec![1, 3], vec![0, 2], vec![4, 5]]);
        assert_eq!(partition.folds()[0].train, vec![0, 2, 4, 5]);
    }
}
