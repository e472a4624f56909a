//! GLM families used by the blending regression.
//!
//! The working-response helpers mirror a penalized IRLS step: given the current
//! linear predictor they return the fitted mean, the IRLS weights and the
//! working response that the weighted coordinate-descent core regresses on.

use crate::data::Outcome;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::fmt;

const MIN_WEIGHT: f64 = 1e-6;
const PROB_EPS: f64 = 1e-8;
const ETA_LIMIT: f64 = 700.0;

/// Response distribution of the blend model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Family {
    /// Identity link, squared-error loss. Used for numeric outcomes.
    Gaussian,
    /// Logit link on the probability of the second class level.
    Binomial,
    /// Softmax over one linear predictor per class level.
    Multinomial,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Family::Gaussian => "gaussian",
            Family::Binomial => "binomial",
            Family::Multinomial => "multinomial",
        };
        f.write_str(name)
    }
}

impl Family {
    pub fn for_outcome(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Numeric(_) => Family::Gaussian,
            Outcome::Class { levels, .. } if levels.len() == 2 => Family::Binomial,
            Outcome::Class { .. } => Family::Multinomial,
        }
    }
}

/// Logistic function with the linear predictor clamped against overflow.
pub fn sigmoid(eta: f64) -> f64 {
    let eta = eta.clamp(-ETA_LIMIT, ETA_LIMIT);
    1.0 / (1.0 + (-eta).exp())
}

/// Row-wise softmax of a `[n_rows, n_classes]` matrix of linear predictors.
pub fn softmax_rows(eta: ArrayView2<f64>) -> Array2<f64> {
    let mut probs = eta.to_owned();
    for mut row in probs.axis_iter_mut(Axis(0)) {
        let max = row.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let total = row.sum();
        row.mapv_inplace(|v| v / total);
    }
    probs
}

/// IRLS vectors for a logit model: `(mu, weights, z)`.
pub fn binomial_working_vectors(
    y: ArrayView1<f64>,
    eta: ArrayView1<f64>,
) -> (Array1<f64>, Array1<f64>, Array1<f64>) {
    let eta_clamped = eta.mapv(|e| e.clamp(-ETA_LIMIT, ETA_LIMIT));
    let mu = eta_clamped.mapv(|e| sigmoid(e).clamp(PROB_EPS, 1.0 - PROB_EPS));
    let weights = mu.mapv(|m| (m * (1.0 - m)).max(MIN_WEIGHT));
    let z = Zip::from(&eta_clamped)
        .and(y)
        .and(&mu)
        .and(&weights)
        .map_collect(|&e, &yi, &m, &w| e + (yi - m) / w);
    (mu, weights, z)
}

/// IRLS vectors for class `k` of a multinomial model, holding the other
/// classes' predictors fixed (a partial Newton step).
pub fn multinomial_working_vectors(
    indicators: ArrayView1<f64>,
    eta_k: ArrayView1<f64>,
    probs_k: ArrayView1<f64>,
) -> (Array1<f64>, Array1<f64>) {
    let p = probs_k.mapv(|v| v.clamp(PROB_EPS, 1.0 - PROB_EPS));
    let weights = p.mapv(|m| (m * (1.0 - m)).max(MIN_WEIGHT));
    let z = Zip::from(eta_k)
        .and(indicators)
        .and(&p)
        .and(&weights)
        .map_collect(|&e, &yi, &m, &w| e + (yi - m) / w);
    (weights, z)
}

/// Mean squared error.
pub fn gaussian_loss(y: ArrayView1<f64>, mu: ArrayView1<f64>) -> f64 {
    let n = y.len().max(1) as f64;
    Zip::from(y)
        .and(mu)
        .fold(0.0, |acc, &yi, &mi| acc + (yi - mi) * (yi - mi))
        / n
}

/// Mean binomial deviance for 0/1 outcomes and fitted probabilities.
pub fn binomial_deviance(y: ArrayView1<f64>, mu: ArrayView1<f64>) -> f64 {
    let n = y.len().max(1) as f64;
    let total = Zip::from(y).and(mu).fold(0.0, |acc, &yi, &mi| {
        let m = mi.clamp(PROB_EPS, 1.0 - PROB_EPS);
        acc - (yi * m.ln() + (1.0 - yi) * (1.0 - m).ln())
    });
    2.0 * total / n
}

/// Mean multinomial deviance for class labels and fitted probabilities.
pub fn multinomial_deviance(labels: ArrayView1<usize>, probs: ArrayView2<f64>) -> f64 {
    let n = labels.len().max(1) as f64;
    let total: f64 = labels
        .iter()
        .zip(probs.axis_iter(Axis(0)))
        .map(|(&label, row)| -row[label].clamp(PROB_EPS, 1.0).ln())
        .sum();
    2.0 * total / n
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn family_follows_outcome() {
        let numeric = Outcome::Numeric(array![1.0, 2.0]);
        let binary = Outcome::from_labels(&["a", "b"]).unwrap();
        let three = Outcome::from_labels(&["a", "b", "c"]).unwrap();
        assert_eq!(Family::for_outcome(&numeric), Family::Gaussian);
        assert_eq!(Family::for_outcome(&binary), Family::Binomial);
        assert_eq!(Family::for_outcome(&three), Family::Multinomial);
    }

    #[test]
    fn softmax_rows_sum_to_one_without_overflow() {
        let probs = softmax_rows(array![[1000.0, 1000.0], [0.0, 2.0f64.ln()]].view());
        assert_abs_diff_eq!(probs[[0, 0]], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(probs[[1, 1]], 2.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn working_response_at_zero_predictor() {
        let y = array![1.0, 0.0];
        let eta = array![0.0, 0.0];
        let (mu, w, z) = binomial_working_vectors(y.view(), eta.view());
        assert_abs_diff_eq!(mu[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(w[0], 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(z[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(z[1], -2.0, epsilon = 1e-12);
    }

    #[test]
    fn deviances_match_hand_computation() {
        let y = array![1.0, 0.0];
        let mu = array![0.8, 0.4];
        let expected = -(0.8f64.ln() + 0.6f64.ln());
        assert_abs_diff_eq!(
            binomial_deviance(y.view(), mu.view()),
            expected,
            epsilon = 1e-12
        );

        let labels = array![0usize, 2];
        let probs = array![[0.5, 0.25, 0.25], [0.1, 0.1, 0.8]];
        let expected = -(0.5f64.ln() + 0.8f64.ln());
        assert_abs_diff_eq!(
            multinomial_deviance(labels.view(), probs.view()),
            expected,
            epsilon = 1e-12
        );

        assert_abs_diff_eq!(
            gaussian_loss(array![1.0, 3.0].view(), array![2.0, 3.0].view()),
            0.5,
            epsilon = 1e-12
        );
    }
}
