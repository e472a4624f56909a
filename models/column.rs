//! Single-column candidate: a feature column taken as the prediction itself.
//!
//! Useful for blending scores that were computed elsewhere (an existing risk
//! score, another model's output) alongside fitted candidates. For a two-level
//! outcome the column is read as the probability of the second level.

use crate::candidate::{FittedModel, ModelError, ModelSpec};
use crate::data::{Outcome, TrainingData};
use ndarray::{Array2, ArrayView2};

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub column: String,
}

#[derive(Debug)]
struct ColumnModel {
    index: usize,
    n_features: usize,
    binary: bool,
}

impl ModelSpec for ColumnSpec {
    fn fit(&self, data: &TrainingData) -> Result<Box<dyn FittedModel>, ModelError> {
        let index = data
            .feature_index(&self.column)
            .ok_or_else(|| ModelError::MissingFeature(self.column.clone()))?;
        let binary = match &data.outcome {
            Outcome::Numeric(_) => false,
            Outcome::Class { levels, .. } if levels.len() == 2 => true,
            Outcome::Class { .. } => return Err(ModelError::UnsupportedTask("multiclass")),
        };
        Ok(Box::new(ColumnModel {
            index,
            n_features: data.feature_names.len(),
            binary,
        }))
    }
}

impl FittedModel for ColumnModel {
    fn predict(&self, features: ArrayView2<f64>) -> Result<Array2<f64>, ModelError> {
        if features.ncols() != self.n_features {
            return Err(ModelError::Predict(format!(
                "expected {} feature columns, got {}",
                self.n_features,
                features.ncols()
            )));
        }
        let column = features.column(self.index);
        if self.binary {
            Ok(Array2::from_shape_fn((features.nrows(), 2), |(i, j)| {
                if j == 1 { column[i] } else { 1.0 - column[i] }
            }))
        } else {
            Ok(Array2::from_shape_fn((features.nrows(), 1), |(i, _)| column[i]))
        }
    }
}
