//! K-nearest-neighbour candidate.
//!
//! Features are standardized with the training means and standard deviations;
//! distances are Euclidean and ties go to the lower training row index. Numeric
//! outcomes average the neighbours' values, class outcomes report the share of
//! neighbours in each class.

use crate::candidate::{FittedModel, ModelError, ModelSpec};
use crate::data::{Outcome, TrainingData};
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

#[derive(Debug, Clone, PartialEq)]
pub struct KnnSpec {
    pub neighbors: usize,
}

#[derive(Debug)]
struct KnnModel {
    means: Array1<f64>,
    scales: Array1<f64>,
    /// Standardized training features.
    reference: Array2<f64>,
    outcome: Outcome,
    neighbors: usize,
}

impl ModelSpec for KnnSpec {
    fn fit(&self, data: &TrainingData) -> Result<Box<dyn FittedModel>, ModelError> {
        if self.neighbors == 0 {
            return Err(ModelError::Fit("knn needs at least one neighbour".to_string()));
        }
        let x = data.features();
        let means = x
            .mean_axis(Axis(0))
            .ok_or_else(|| ModelError::Fit("no training rows".to_string()))?;
        // Constant columns keep a unit scale; centering already zeroes them.
        let scales = x
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > 1e-12 { s } else { 1.0 });
        let reference = (&x - &means) / &scales;
        Ok(Box::new(KnnModel {
            means,
            scales,
            reference,
            outcome: data.outcome.clone(),
            neighbors: self.neighbors.min(data.n_rows()),
        }))
    }
}

impl KnnModel {
    fn width(&self) -> usize {
        self.outcome.prediction_width()
    }

    fn predict_row(&self, query: ArrayView1<f64>) -> Array1<f64> {
        let mut distances: Vec<(f64, usize)> = self
            .reference
            .axis_iter(Axis(0))
            .enumerate()
            .map(|(index, row)| {
                let squared = row
                    .iter()
                    .zip(query.iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f64>();
                (squared, index)
            })
            .collect();
        distances.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        let nearest = &distances[..self.neighbors];

        let k = nearest.len() as f64;
        match &self.outcome {
            Outcome::Numeric(y) => {
                Array1::from_elem(1, nearest.iter().map(|&(_, i)| y[i]).sum::<f64>() / k)
            }
            Outcome::Class { labels, levels } => {
                let mut shares = Array1::zeros(levels.len());
                for &(_, i) in nearest {
                    shares[labels[i]] += 1.0 / k;
                }
                shares
            }
        }
    }
}

impl FittedModel for KnnModel {
    fn predict(&self, features: ArrayView2<f64>) -> Result<Array2<f64>, ModelError> {
        if features.ncols() != self.means.len() {
            return Err(ModelError::Predict(format!(
                "expected {} feature columns, got {}",
                self.means.len(),
                features.ncols()
            )));
        }
        let standardized = (&features - &self.means) / &self.scales;
        let rows: Vec<Array1<f64>> = standardized
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|row| self.predict_row(row))
            .collect();

        let mut out = Array2::zeros((rows.len(), self.width()));
        for (i, row) in rows.into_iter().enumerate() {
            out.row_mut(i).assign(&row);
        }
        Ok(out)
    }
}
