//! Ridge regression candidate.
//!
//! Solves the centered normal equations `(X'X + penalty * n * I) b = X'y`. For
//! class outcomes one ridge fit per class indicator gives a linear probability
//! model whose predictions are clipped to `[0, 1]` and rescaled per row.

use crate::candidate::{FittedModel, ModelError, ModelSpec};
use crate::data::{Outcome, TrainingData};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_linalg::Solve;

#[derive(Debug, Clone, PartialEq)]
pub struct RidgeSpec {
    pub penalty: f64,
}

#[derive(Debug)]
struct RidgeModel {
    feature_means: Array1<f64>,
    /// Shape: [n_features, n_outputs].
    coefficients: Array2<f64>,
    intercepts: Array1<f64>,
    probabilities: bool,
}

impl ModelSpec for RidgeSpec {
    fn fit(&self, data: &TrainingData) -> Result<Box<dyn FittedModel>, ModelError> {
        if !self.penalty.is_finite() || self.penalty < 0.0 {
            return Err(ModelError::Fit(format!(
                "ridge penalty must be finite and >= 0, got {}",
                self.penalty
            )));
        }
        let x = data.features();
        let n = x.nrows();
        if n == 0 {
            return Err(ModelError::Fit("no training rows".to_string()));
        }

        let (targets, probabilities) = match &data.outcome {
            Outcome::Numeric(y) => (y.clone().insert_axis(Axis(1)), false),
            Outcome::Class { .. } => match data.outcome.indicators() {
                Some(onehot) => (onehot, true),
                None => return Err(ModelError::UnsupportedTask("classification")),
            },
        };

        let feature_means = x
            .mean_axis(Axis(0))
            .ok_or_else(|| ModelError::Fit("no training rows".to_string()))?;
        let target_means = targets
            .mean_axis(Axis(0))
            .ok_or_else(|| ModelError::Fit("no training rows".to_string()))?;
        let centered_x = &x - &feature_means;
        let centered_y = &targets - &target_means;

        let mut gram = centered_x.t().dot(&centered_x);
        let ridge = self.penalty * n as f64;
        for d in gram.diag_mut() {
            *d += ridge;
        }
        let cross = centered_x.t().dot(&centered_y);

        let mut coefficients = Array2::zeros((x.ncols(), targets.ncols()));
        for (output, rhs) in cross.axis_iter(Axis(1)).enumerate() {
            let solution = gram.solve(&rhs)?;
            coefficients.column_mut(output).assign(&solution);
        }
        let intercepts = &target_means - &feature_means.dot(&coefficients);

        log::debug!(
            "Fitted ridge (penalty {}) on {} rows x {} features",
            self.penalty,
            n,
            x.ncols()
        );
        Ok(Box::new(RidgeModel {
            feature_means,
            coefficients,
            intercepts,
            probabilities,
        }))
    }
}

impl FittedModel for RidgeModel {
    fn predict(&self, features: ArrayView2<f64>) -> Result<Array2<f64>, ModelError> {
        if features.ncols() != self.feature_means.len() {
            return Err(ModelError::Predict(format!(
                "expected {} feature columns, got {}",
                self.feature_means.len(),
                features.ncols()
            )));
        }
        let mut predictions = features.dot(&self.coefficients);
        predictions += &self.intercepts;
        if self.probabilities {
            let width = predictions.ncols() as f64;
            for mut row in predictions.axis_iter_mut(Axis(0)) {
                row.mapv_inplace(|p| p.clamp(0.0, 1.0));
                let total = row.sum();
                if total > 0.0 {
                    row.mapv_inplace(|p| p / total);
                } else {
                    row.fill(1.0 / width);
                }
            }
        }
        Ok(predictions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn line_data() -> TrainingData {
        let x = Array2::from_shape_fn((20, 2), |(i, j)| {
            if j == 0 { i as f64 } else { ((i * 7) % 5) as f64 }
        });
        let y = x
            .axis_iter(Axis(0))
            .map(|row| 3.0 + 2.0 * row[0] - 0.5 * row[1])
            .collect();
        TrainingData::new(x, vec!["a".into(), "b".into()], Outcome::Numeric(y)).unwrap()
    }

    #[test]
    fn zero_penalty_is_least_squares() {
        let data = line_data();
        let model = RidgeSpec { penalty: 0.0 }.fit(&data).unwrap();
        let predictions = model.predict(array![[10.0, 1.0], [0.0, 0.0]].view()).unwrap();
        assert_abs_diff_eq!(predictions[[0, 0]], 22.5, epsilon = 1e-8);
        assert_abs_diff_eq!(predictions[[1, 0]], 3.0, epsilon = 1e-8);
    }

    #[test]
    fn penalty_shrinks_towards_the_mean() {
        let data = line_data();
        let light = RidgeSpec { penalty: 1e-3 }.fit(&data).unwrap();
        let heavy = RidgeSpec { penalty: 1e3 }.fit(&data).unwrap();
        let row = array![[19.0, 2.0]];
        let mean = match &data.outcome {
            Outcome::Numeric(y) => y.mean().unwrap(),
            Outcome::Class { .. } => unreachable!(),
        };
        let light_gap = (light.predict(row.view()).unwrap()[[0, 0]] - mean).abs();
        let heavy_gap = (heavy.predict(row.view()).unwrap()[[0, 0]] - mean).abs();
        assert!(heavy_gap < light_gap);
    }

    #[test]
    fn class_outcomes_give_probability_rows() {
        let x = Array2::from_shape_fn((12, 1), |(i, _)| i as f64);
        let labels: Vec<&str> = (0..12).map(|i| if i < 6 { "low" } else { "high" }).collect();
        let data = TrainingData::new(x, vec!["x".into()], Outcome::from_labels(&labels).unwrap())
            .unwrap();
        let model = RidgeSpec { penalty: 0.01 }.fit(&data).unwrap();
        let probs = model.predict(array![[-5.0], [2.0], [30.0]].view()).unwrap();
        assert_eq!(probs.ncols(), 2);
        for row in probs.axis_iter(Axis(0)) {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
            assert!(row.iter().all(|&p| (0.0..=1.0).contains(&p)));
        }
        // Levels are "high", "low"; large x belongs to "high".
        assert!(probs[[2, 0]] > probs[[2, 1]]);
    }

    #[test]
    fn wrong_feature_count_is_rejected() {
        let model = RidgeSpec { penalty: 0.1 }.fit(&line_data()).unwrap();
        assert!(matches!(
            model.predict(array![[1.0]].view()),
            Err(ModelError::Predict(_))
        ));
    }
}
