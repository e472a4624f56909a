//! Held-out prediction collection.
//!
//! Fits a model specification on the training rows of every fold of a
//! partition and predicts the fold's held-out rows. The folds run in parallel
//! on the worker pool; the result is a [`Candidate`] ready for registration.

use crate::candidate::{Candidate, ModelError, ModelSpec};
use crate::data::TrainingData;
use crate::parallel::WorkerPool;
use crate::partition::{Fold, ResamplePartition};
use ndarray::{Array2, Axis};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResampleError {
    #[error("Candidate '{candidate}' failed on resampling fold {fold}: {source}")]
    Fold {
        candidate: String,
        fold: usize,
        #[source]
        source: ModelError,
    },
    #[error(
        "Candidate '{candidate}' returned predictions of shape {found:?} on fold {fold}; expected {expected:?}."
    )]
    PredictionShape {
        candidate: String,
        fold: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("The training data has {found} rows but the partition covers {expected}.")]
    RowCountMismatch { expected: usize, found: usize },
}

/// Collects held-out predictions for `spec` over every fold of `partition`.
pub fn fit_resamples(
    name: impl Into<String>,
    spec: Arc<dyn ModelSpec>,
    data: &TrainingData,
    partition: &ResamplePartition,
    pool: &WorkerPool,
) -> Result<Candidate, ResampleError> {
    let name = name.into();
    if data.n_rows() != partition.n_rows() {
        return Err(ResampleError::RowCountMismatch {
            expected: partition.n_rows(),
            found: data.n_rows(),
        });
    }

    let width = data.outcome.prediction_width();
    let results = pool.map_join(partition.folds(), |fold: &Fold| {
        let model = spec.fit(&data.select_rows(&fold.train))?;
        model.predict(data.features.select(Axis(0), &fold.held_out).view())
    });

    let mut blocks: Vec<Array2<f64>> = Vec::with_capacity(results.len());
    for (index, (fold, result)) in partition.folds().iter().zip(results).enumerate() {
        let block = result.map_err(|source| ResampleError::Fold {
            candidate: name.clone(),
            fold: index,
            source,
        })?;
        let expected = (fold.held_out.len(), width);
        if block.dim() != expected {
            return Err(ResampleError::PredictionShape {
                candidate: name,
                fold: index,
                expected,
                found: block.dim(),
            });
        }
        log::debug!(
            "Candidate '{}' fold {}: trained on {} rows, predicted {}",
            name,
            index,
            fold.train.len(),
            fold.held_out.len()
        );
        blocks.push(block);
    }

    log::info!(
        "Collected held-out predictions for '{}' over {} folds.",
        name,
        blocks.len()
    );
    Ok(Candidate::new(name, spec, partition.id(), blocks))
}

/// Collects held-out predictions for each specification of a tuning grid,
/// naming the candidates `prefix_1`, `prefix_2`, ...
pub fn fit_resample_grid(
    prefix: &str,
    specs: Vec<Arc<dyn ModelSpec>>,
    data: &TrainingData,
    partition: &ResamplePartition,
    pool: &WorkerPool,
) -> Result<Vec<Candidate>, ResampleError> {
    specs
        .into_iter()
        .enumerate()
        .map(|(index, spec)| {
            fit_resamples(format!("{prefix}_{}", index + 1), spec, data, partition, pool)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::FittedModel;
    use crate::data::Outcome;
    use crate::models::ridge::RidgeSpec;
    use ndarray::{Array1, ArrayView2};

    #[derive(Debug)]
    struct MeanSpec;

    #[derive(Debug)]
    struct MeanModel(f64);

    impl FittedModel for MeanModel {
        fn predict(&self, features: ArrayView2<f64>) -> Result<Array2<f64>, ModelError> {
            Ok(Array2::from_elem((features.nrows(), 1), self.0))
        }
    }

    impl ModelSpec for MeanSpec {
        fn fit(&self, data: &TrainingData) -> Result<Box<dyn FittedModel>, ModelError> {
            match &data.outcome {
                Outcome::Numeric(y) => Ok(Box::new(MeanModel(y.mean().unwrap_or(0.0)))),
                Outcome::Class { .. } => Err(ModelError::UnsupportedTask("classification")),
            }
        }
    }

    fn data(n: usize) -> TrainingData {
        let features = Array2::from_shape_fn((n, 2), |(i, j)| (i * (j + 1)) as f64);
        let outcome = Outcome::Numeric(Array1::from_shape_fn(n, |i| i as f64));
        TrainingData::new(features, vec!["a".into(), "b".into()], outcome).unwrap()
    }

    #[test]
    fn held_out_predictions_come_from_the_training_rows_only() {
        let pool = WorkerPool::new(Some(2)).unwrap();
        let data = data(10);
        let partition = ResamplePartition::v_fold(10, 5, 3).unwrap();
        let candidate = fit_resamples("mean", Arc::new(MeanSpec), &data, &partition, &pool).unwrap();

        assert_eq!(candidate.partition(), partition.id());
        for (fold, block) in partition.folds().iter().zip(candidate.fold_predictions()) {
            let train_mean =
                fold.train.iter().map(|&r| r as f64).sum::<f64>() / fold.train.len() as f64;
            assert_eq!(block.dim(), (fold.held_out.len(), 1));
            assert!(block.iter().all(|&p| (p - train_mean).abs() < 1e-12));
        }
    }

    #[test]
    fn fold_failures_name_the_candidate_and_fold() {
        let pool = WorkerPool::new(Some(2)).unwrap();
        let labels: Vec<&str> = (0..8).map(|i| if i % 2 == 0 { "x" } else { "y" }).collect();
        let data = TrainingData::new(
            Array2::zeros((8, 1)),
            vec!["f".into()],
            Outcome::from_labels(&labels).unwrap(),
        )
        .unwrap();
        let partition = ResamplePartition::v_fold(8, 2, 1).unwrap();
        let err = fit_resamples("mean", Arc::new(MeanSpec), &data, &partition, &pool).unwrap_err();
        assert!(matches!(err, ResampleError::Fold { candidate, fold: 0, .. } if candidate == "mean"));
    }

    #[test]
    fn grid_candidates_are_numbered() {
        let pool = WorkerPool::new(Some(2)).unwrap();
        let data = data(12);
        let partition = ResamplePartition::v_fold(12, 3, 8).unwrap();
        let specs: Vec<Arc<dyn ModelSpec>> = vec![
            Arc::new(RidgeSpec { penalty: 0.1 }),
            Arc::new(RidgeSpec { penalty: 1.0 }),
        ];
        let candidates = fit_resample_grid("ridge", specs, &data, &partition, &pool).unwrap();
        let names: Vec<&str> = candidates.iter().map(Candidate::name).collect();
        assert_eq!(names, vec!["ridge_1", "ridge_2"]);
    }

    #[test]
    fn partition_must_cover_the_training_rows() {
        let pool = WorkerPool::new(Some(1)).unwrap();
        let partition = ResamplePartition::v_fold(6, 2, 1).unwrap();
        let err = fit_resamples("mean", Arc::new(MeanSpec), &data(7), &partition, &pool).unwrap_err();
        assert!(matches!(
            err,
            ResampleError::RowCountMismatch { expected: 6, found: 7 }
        ));
    }
}
