//! Built-in candidate model specifications.
//!
//! Each built-in implements [`ModelSpec`] on its own; [`BuiltinSpec`] gathers
//! them into one serde-tagged value so they can be listed in a TOML file or on
//! the command line as `ridge:0.1`, `knn:5` or `column:score`.

pub mod column;
pub mod knn;
pub mod ridge;

use crate::candidate::{FittedModel, ModelError, ModelSpec};
use crate::data::TrainingData;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use column::ColumnSpec;
use knn::KnnSpec;
use ridge::RidgeSpec;

#[derive(Error, Debug, PartialEq)]
pub enum SpecParseError {
    #[error("Unknown model kind '{0}'. Expected one of: ridge, knn, column.")]
    UnknownKind(String),
    #[error("Model '{0}' needs a value, e.g. ridge:0.1, knn:5 or column:score.")]
    MissingValue(String),
    #[error("Invalid value '{value}' for model '{kind}'.")]
    InvalidValue { kind: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuiltinSpec {
    /// Ridge regression on the features with the given penalty.
    Ridge { penalty: f64 },
    /// K-nearest-neighbour averaging on standardized features.
    Knn { neighbors: usize },
    /// A single feature column used as the prediction.
    Column { column: String },
}

impl BuiltinSpec {
    /// Default candidate name, e.g. `ridge_0.1` or `knn_5`.
    pub fn name(&self) -> String {
        match self {
            BuiltinSpec::Ridge { penalty } => format!("ridge_{penalty}"),
            BuiltinSpec::Knn { neighbors } => format!("knn_{neighbors}"),
            BuiltinSpec::Column { column } => format!("column_{column}"),
        }
    }
}

impl fmt::Display for BuiltinSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuiltinSpec::Ridge { penalty } => write!(f, "ridge:{penalty}"),
            BuiltinSpec::Knn { neighbors } => write!(f, "knn:{neighbors}"),
            BuiltinSpec::Column { column } => write!(f, "column:{column}"),
        }
    }
}

impl FromStr for BuiltinSpec {
    type Err = SpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| SpecParseError::MissingValue(s.to_string()))?;
        let (kind, value) = (kind.trim().to_ascii_lowercase(), value.trim());
        let invalid = || SpecParseError::InvalidValue {
            kind: kind.clone(),
            value: value.to_string(),
        };
        match kind.as_str() {
            "ridge" => {
                let penalty: f64 = value.parse().map_err(|_| invalid())?;
                if !penalty.is_finite() || penalty < 0.0 {
                    return Err(invalid());
                }
                Ok(BuiltinSpec::Ridge { penalty })
            }
            "knn" => {
                let neighbors: usize = value.parse().map_err(|_| invalid())?;
                if neighbors == 0 {
                    return Err(invalid());
                }
                Ok(BuiltinSpec::Knn { neighbors })
            }
            "column" if !value.is_empty() => Ok(BuiltinSpec::Column {
                column: value.to_string(),
            }),
            "column" => Err(SpecParseError::MissingValue(s.to_string())),
            _ => Err(SpecParseError::UnknownKind(kind.clone())),
        }
    }
}

impl ModelSpec for BuiltinSpec {
    fn fit(&self, data: &TrainingData) -> Result<Box<dyn FittedModel>, ModelError> {
        match self {
            BuiltinSpec::Ridge { penalty } => RidgeSpec { penalty: *penalty }.fit(data),
            BuiltinSpec::Knn { neighbors } => KnnSpec {
                neighbors: *neighbors,
            }
            .fit(data),
            BuiltinSpec::Column { column } => ColumnSpec {
                column: column.clone(),
            }
            .fit(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specs_parse_from_short_strings() {
        assert_eq!(
            "ridge:0.5".parse::<BuiltinSpec>(),
            Ok(BuiltinSpec::Ridge { penalty: 0.5 })
        );
        assert_eq!(
            "KNN: 3".parse::<BuiltinSpec>(),
            Ok(BuiltinSpec::Knn { neighbors: 3 })
        );
        assert_eq!(
            "column:score".parse::<BuiltinSpec>(),
            Ok(BuiltinSpec::Column {
                column: "score".to_string()
            })
        );
        assert_eq!(
            "forest:100".parse::<BuiltinSpec>(),
            Err(SpecParseError::UnknownKind("forest".to_string()))
        );
        assert!(matches!(
            "knn:0".parse::<BuiltinSpec>(),
            Err(SpecParseError::InvalidValue { .. })
        ));
        assert!(matches!(
            "ridge".parse::<BuiltinSpec>(),
            Err(SpecParseError::MissingValue(_))
        ));
    }

    #[test]
    fn display_and_parse_agree() {
        for spec in [
            BuiltinSpec::Ridge { penalty: 0.25 },
            BuiltinSpec::Knn { neighbors: 9 },
            BuiltinSpec::Column {
                column: "x1".to_string(),
            },
        ] {
            assert_eq!(spec.to_string().parse::<BuiltinSpec>(), Ok(spec.clone()));
        }
        assert_eq!(BuiltinSpec::Knn { neighbors: 9 }.name(), "knn_9");
    }
}
