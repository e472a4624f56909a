//! # Prediction Dispatcher
//!
//! Turns a [`FittedEnsemble`] and new feature rows into predictions, either
//! the blended ensemble prediction or one unweighted block per member.

use crate::candidate::ModelError;
use crate::family::Family;
use crate::refit::FittedEnsemble;
use ndarray::{Array2, ArrayView2, Axis, concatenate};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PredictMode {
    /// One prediction combined through the blend coefficients.
    #[default]
    Ensemble,
    /// One unweighted prediction block per surviving member.
    Members,
}

impl FromStr for PredictMode {
    type Err = PredictError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ensemble" => Ok(PredictMode::Ensemble),
            "members" => Ok(PredictMode::Members),
            other => Err(PredictError::UnknownMode(other.to_string())),
        }
    }
}

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("The ensemble has no members left to predict with.")]
    EmptyEnsemble,
    #[error("New data has {found} feature columns; the ensemble was trained on {expected}.")]
    FeatureMismatch { expected: usize, found: usize },
    #[error("Member '{member}' failed to predict: {source}")]
    Model {
        member: String,
        #[source]
        source: ModelError,
    },
    #[error("Member '{member}' returned predictions of shape {found:?}; expected {expected:?}.")]
    ShapeMismatch {
        member: String,
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("Unknown prediction mode '{0}'. Expected 'ensemble' or 'members'.")]
    UnknownMode(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predictions {
    /// `[n_rows, 1]` for numeric outcomes, `[n_rows, n_levels]` probabilities
    /// for class outcomes.
    Ensemble {
        values: Array2<f64>,
        levels: Vec<String>,
    },
    /// Each member's own predictions, in registration order.
    Members {
        blocks: Vec<(String, Array2<f64>)>,
        levels: Vec<String>,
    },
}

impl Predictions {
    pub fn levels(&self) -> &[String] {
        match self {
            Predictions::Ensemble { levels, .. } | Predictions::Members { levels, .. } => levels,
        }
    }

    /// The most probable class of each row for classification ensembles.
    pub fn classes(&self) -> Option<Vec<String>> {
        match self {
            Predictions::Ensemble { values, levels } if !levels.is_empty() => Some(
                values
                    .axis_iter(Axis(0))
                    .map(|row| {
                        let best = row
                            .iter()
                            .enumerate()
                            .fold((0, f64::NEG_INFINITY), |best, (index, &p)| {
                                if p > best.1 { (index, p) } else { best }
                            })
                            .0;
                        levels[best].clone()
                    })
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Output column names matching [`Predictions::to_matrix`].
    pub fn column_names(&self) -> Vec<String> {
        let suffixed = |prefix: &str, levels: &[String]| -> Vec<String> {
            if levels.is_empty() {
                vec![prefix.to_string()]
            } else {
                levels.iter().map(|level| format!("{prefix}:{level}")).collect()
            }
        };
        match self {
            Predictions::Ensemble { levels, .. } => suffixed("prediction", levels),
            Predictions::Members { blocks, levels } => blocks
                .iter()
                .flat_map(|(name, _)| suffixed(name, levels))
                .collect(),
        }
    }

    /// All prediction columns side by side.
    pub fn to_matrix(&self) -> Array2<f64> {
        match self {
            Predictions::Ensemble { values, .. } => values.clone(),
            Predictions::Members { blocks, .. } => {
                let views: Vec<ArrayView2<f64>> = blocks.iter().map(|(_, b)| b.view()).collect();
                let rows = blocks.first().map_or(0, |(_, b)| b.nrows());
                concatenate(Axis(1), &views).unwrap_or_else(|_| Array2::zeros((rows, 0)))
            }
        }
    }
}

impl FittedEnsemble {
    pub fn predict(
        &self,
        features: ArrayView2<f64>,
        mode: PredictMode,
    ) -> Result<Predictions, PredictError> {
        predict(self, features, mode)
    }
}

/// Predicts `features` (columns in training order) with the ensemble.
pub fn predict(
    ensemble: &FittedEnsemble,
    features: ArrayView2<f64>,
    mode: PredictMode,
) -> Result<Predictions, PredictError> {
    if ensemble.members().is_empty() {
        return Err(PredictError::EmptyEnsemble);
    }
    let expected = ensemble.feature_names().len();
    if features.ncols() != expected {
        return Err(PredictError::FeatureMismatch {
            expected,
            found: features.ncols(),
        });
    }

    let blend = ensemble.blend();
    let levels = blend.levels.clone();
    let shape = (features.nrows(), levels.len().max(1));
    let blocks = ensemble
        .members()
        .iter()
        .map(|member| {
            let block = member
                .model()
                .predict(features)
                .map_err(|source| PredictError::Model {
                    member: member.name().to_string(),
                    source,
                })?;
            if block.dim() != shape {
                return Err(PredictError::ShapeMismatch {
                    member: member.name().to_string(),
                    expected: shape,
                    found: block.dim(),
                });
            }
            Ok((member.name().to_string(), block, member.weight()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    match mode {
        PredictMode::Members => Ok(Predictions::Members {
            blocks: blocks
                .into_iter()
                .map(|(name, block, _)| (name, block))
                .collect(),
            levels,
        }),
        PredictMode::Ensemble => {
            let values = match blend.family {
                Family::Gaussian => {
                    let intercept = blend.intercepts.first().copied().unwrap_or(0.0);
                    let mut combined = Array2::from_elem(shape, intercept);
                    for (_, block, weight) in &blocks {
                        combined.scaled_add(*weight, block);
                    }
                    combined
                }
                Family::Binomial | Family::Multinomial => {
                    let mut combined = Array2::zeros(shape);
                    for (_, block, weight) in &blocks {
                        combined.scaled_add(*weight, block);
                    }
                    normalize_probabilities(&mut combined);
                    combined
                }
            };
            Ok(Predictions::Ensemble { values, levels })
        }
    }
}

/// Clamps negative entries to zero and rescales each row to sum to one; a
/// row with nothing left becomes uniform.
fn normalize_probabilities(probs: &mut Array2<f64>) {
    let width = probs.ncols() as f64;
    for mut row in probs.axis_iter_mut(Axis(0)) {
        row.mapv_inplace(|p| p.max(0.0));
        let total = row.sum();
        if total > 0.0 {
            row.mapv_inplace(|p| p / total);
        } else {
            row.fill(1.0 / width);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn modes_parse_from_strings() {
        assert_eq!("ensemble".parse::<PredictMode>().unwrap(), PredictMode::Ensemble);
        assert_eq!(" Members ".parse::<PredictMode>().unwrap(), PredictMode::Members);
        assert!(matches!(
            "average".parse::<PredictMode>(),
            Err(PredictError::UnknownMode(_))
        ));
    }

    #[test]
    fn rows_are_clamped_and_renormalized() {
        let mut probs = array![[0.2, -0.1, 0.6], [-0.3, 0.0, -0.2]];
        normalize_probabilities(&mut probs);
        assert_abs_diff_eq!(probs[[0, 0]], 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(probs[[0, 1]], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(probs[[0, 2]], 0.75, epsilon = 1e-12);
        for p in probs.row(1) {
            assert_abs_diff_eq!(*p, 1.0 / 3.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn classes_take_the_most_probable_level() {
        let predictions = Predictions::Ensemble {
            values: array![[0.1, 0.9], [0.7, 0.3]],
            levels: vec!["no".into(), "yes".into()],
        };
        assert_eq!(
            predictions.classes(),
            Some(vec!["yes".to_string(), "no".to_string()])
        );
        assert_eq!(predictions.column_names(), vec!["prediction:no", "prediction:yes"]);

        let members = Predictions::Members {
            blocks: vec![
                ("a".to_string(), array![[1.0], [2.0]]),
                ("b".to_string(), array![[3.0], [4.0]]),
            ],
            levels: Vec::new(),
        };
        assert_eq!(members.classes(), None);
        assert_eq!(members.column_names(), vec!["a", "b"]);
        assert_eq!(members.to_matrix(), array![[1.0, 3.0], [2.0, 4.0]]);
    }
}
