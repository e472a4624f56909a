//! # Candidate Registry
//!
//! Accumulates held-out predictions from candidates into the stacked
//! prediction matrix. Rows of the matrix are the held-out observations of the
//! registry's partition, fold-major; columns are every candidate's prediction
//! columns in registration order. A registration either appends all of its
//! columns or leaves the registry exactly as it was.

use crate::blend::{BlendConfig, BlendModel};
use crate::candidate::Candidate;
use crate::data::Outcome;
use crate::parallel::WorkerPool;
use crate::partition::{PartitionId, ResamplePartition};
use crate::solver::{BlendingSolver, SolverError};
use ahash::AHashSet;
use ndarray::{Array2, ArrayView2, Axis, concatenate};
use std::ops::Range;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error(
        "Candidate '{candidate}' was resampled under partition {found}, but the stack uses partition {expected}."
    )]
    PartitionMismatch {
        candidate: String,
        expected: PartitionId,
        found: PartitionId,
    },
    #[error("A candidate named '{0}' is already registered.")]
    DuplicateCandidate(String),
    #[error("Candidate '{candidate}' has predictions for {found} folds; the partition has {expected}.")]
    FoldCountMismatch {
        candidate: String,
        expected: usize,
        found: usize,
    },
    #[error(
        "Candidate '{candidate}' fold {fold} predictions have shape {found:?}; expected {expected:?}."
    )]
    ShapeMismatch {
        candidate: String,
        fold: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("Candidate '{0}' has non-finite held-out predictions.")]
    NonFinitePredictions(String),
    #[error("The outcome has {found} rows but the partition covers {expected}.")]
    OutcomeLength { expected: usize, found: usize },
}

/// Handle to a registered candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryHandle {
    pub index: usize,
    pub columns: Range<usize>,
}

/// Describes one column of the stacked matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackedColumn {
    /// Index of the owning candidate in registration order.
    pub candidate: usize,
    /// Class level index for classification outcomes.
    pub level: Option<usize>,
    /// `name` for regression, `name:level` for classification.
    pub label: String,
}

#[derive(Debug)]
pub struct Registry {
    partition: ResamplePartition,
    outcome: Outcome,
    candidates: Vec<Candidate>,
    names: AHashSet<String>,
    columns: Vec<StackedColumn>,
    matrix: Array2<f64>,
}

impl Registry {
    /// Starts an empty stack over `partition`. `outcome` holds one value per
    /// training row; it is stacked along the partition's held-out rows.
    pub fn new(partition: ResamplePartition, outcome: &Outcome) -> Result<Self, RegistryError> {
        if outcome.len() != partition.n_rows() {
            return Err(RegistryError::OutcomeLength {
                expected: partition.n_rows(),
                found: outcome.len(),
            });
        }
        let stacked_outcome = outcome.select(&partition.held_out_rows());
        let matrix = Array2::zeros((partition.held_out_len(), 0));
        Ok(Self {
            partition,
            outcome: stacked_outcome,
            candidates: Vec::new(),
            names: AHashSet::new(),
            columns: Vec::new(),
            matrix,
        })
    }

    /// Registers a candidate and appends its columns to the stacked matrix.
    pub fn register(&mut self, candidate: Candidate) -> Result<RegistryHandle, RegistryError> {
        self.validate(&candidate)?;

        let views: Vec<ArrayView2<f64>> = candidate
            .fold_predictions()
            .iter()
            .map(|block| block.view())
            .collect();
        let block = concatenate(Axis(0), &views).map_err(|_| RegistryError::ShapeMismatch {
            candidate: candidate.name().to_string(),
            fold: 0,
            expected: (self.partition.held_out_len(), candidate.width()),
            found: (0, 0),
        })?;

        let index = self.candidates.len();
        let start = self.matrix.ncols();
        let appended = concatenate(Axis(1), &[self.matrix.view(), block.view()]).map_err(|_| {
            RegistryError::ShapeMismatch {
                candidate: candidate.name().to_string(),
                fold: 0,
                expected: (self.matrix.nrows(), candidate.width()),
                found: block.dim(),
            }
        })?;
        self.matrix = appended;

        let levels = self.outcome.levels().to_vec();
        if levels.is_empty() {
            self.columns.push(StackedColumn {
                candidate: index,
                level: None,
                label: candidate.name().to_string(),
            });
        } else {
            for (level_idx, level) in levels.iter().enumerate() {
                self.columns.push(StackedColumn {
                    candidate: index,
                    level: Some(level_idx),
                    label: format!("{}:{}", candidate.name(), level),
                });
            }
        }

        log::info!(
            "Registered candidate '{}' with {} column(s); stack now has {} columns.",
            candidate.name(),
            candidate.width(),
            self.matrix.ncols()
        );
        self.names.insert(candidate.name().to_string());
        self.candidates.push(candidate);

        Ok(RegistryHandle {
            index,
            columns: start..self.matrix.ncols(),
        })
    }

    fn validate(&self, candidate: &Candidate) -> Result<(), RegistryError> {
        let name = candidate.name().to_string();
        if candidate.partition() != self.partition.id() {
            return Err(RegistryError::PartitionMismatch {
                candidate: name,
                expected: self.partition.id(),
                found: candidate.partition(),
            });
        }
        if self.names.contains(candidate.name()) {
            return Err(RegistryError::DuplicateCandidate(name));
        }

        let folds = self.partition.folds();
        let blocks = candidate.fold_predictions();
        if blocks.len() != folds.len() {
            return Err(RegistryError::FoldCountMismatch {
                candidate: name,
                expected: folds.len(),
                found: blocks.len(),
            });
        }

        let width = self.outcome.prediction_width();
        for (fold_idx, (fold, block)) in folds.iter().zip(blocks).enumerate() {
            let expected = (fold.held_out.len(), width);
            if block.dim() != expected {
                return Err(RegistryError::ShapeMismatch {
                    candidate: name,
                    fold: fold_idx,
                    expected,
                    found: block.dim(),
                });
            }
            if block.iter().any(|v| !v.is_finite()) {
                return Err(RegistryError::NonFinitePredictions(name));
            }
        }
        Ok(())
    }

    /// Fits the blend model on the current stack.
    pub fn blend(&self, config: &BlendConfig, pool: &WorkerPool) -> Result<BlendModel, SolverError> {
        let names: Vec<String> = self
            .candidates
            .iter()
            .map(|candidate| candidate.name().to_string())
            .collect();
        BlendingSolver::new(config, pool).fit(
            self.matrix.view(),
            &self.outcome,
            &self.columns,
            &names,
        )
    }

    pub fn partition(&self) -> &ResamplePartition {
        &self.partition
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// The stacked prediction matrix, `[held-out rows, columns]`.
    pub fn matrix(&self) -> ArrayView2<'_, f64> {
        self.matrix.view()
    }

    /// The outcome aligned with the stacked rows.
    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn columns(&self) -> &[StackedColumn] {
        &self.columns
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }
}
