//! Candidate model specifications and their held-out predictions.
//!
//! A model specification is anything that can be fit on a [`TrainingData`]
//! and then predict feature rows. The stack never inspects a specification;
//! it only calls `fit` again on the full training data when the candidate is
//! selected as an ensemble member.

use crate::data::TrainingData;
use crate::partition::PartitionId;
use ndarray::{Array2, ArrayView2};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by a model specification while fitting or predicting.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model fitting failed: {0}")]
    Fit(String),
    #[error("Prediction failed: {0}")]
    Predict(String),
    #[error("This model does not support {0} outcomes.")]
    UnsupportedTask(&'static str),
    #[error("Feature '{0}' is not present in the training data.")]
    MissingFeature(String),
    #[error("A linear system solve failed: {0}")]
    LinearSystemSolveFailed(#[from] ndarray_linalg::error::LinalgError),
}

/// The capability every candidate model provides: a complete fitting
/// procedure, including any preprocessing it needs.
pub trait ModelSpec: Send + Sync + fmt::Debug {
    fn fit(&self, data: &TrainingData) -> Result<Box<dyn FittedModel>, ModelError>;
}

/// A fitted model. Predictions have one column for numeric outcomes and one
/// probability column per class level for class outcomes.
pub trait FittedModel: Send + Sync + fmt::Debug {
    fn predict(&self, features: ArrayView2<f64>) -> Result<Array2<f64>, ModelError>;
}

/// A named model specification plus its held-out predictions, one block per
/// fold of the partition they were produced under.
#[derive(Debug, Clone)]
pub struct Candidate {
    name: String,
    spec: Arc<dyn ModelSpec>,
    partition: PartitionId,
    fold_predictions: Vec<Array2<f64>>,
}

impl Candidate {
    pub fn new(
        name: impl Into<String>,
        spec: Arc<dyn ModelSpec>,
        partition: PartitionId,
        fold_predictions: Vec<Array2<f64>>,
    ) -> Self {
        Self {
            name: name.into(),
            spec,
            partition,
            fold_predictions,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &Arc<dyn ModelSpec> {
        &self.spec
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn fold_predictions(&self) -> &[Array2<f64>] {
        &self.fold_predictions
    }

    /// Number of prediction columns, taken from the first fold.
    pub fn width(&self) -> usize {
        self.fold_predictions.first().map_or(0, Array2::ncols)
    }
}
