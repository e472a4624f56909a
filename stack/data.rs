//! # Training data and tabular loading
//!
//! In-memory shapes for training data (feature matrix, feature names and an
//! outcome) and the TSV loaders used by the command-line front end. Loading
//! goes through the polars CSV reader with a tab separator; every numeric
//! column must be complete and finite.

use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView2, Axis, ShapeBuilder};
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// The column that, when present, labels prediction rows.
pub const SAMPLE_ID_COLUMN: &str = "sample_id";

/// What kind of outcome a stack is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Task {
    Regression,
    Classification,
}

/// The observed outcome for every training row.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Numeric(Array1<f64>),
    /// Class labels as indices into `levels`.
    Class {
        labels: Array1<usize>,
        levels: Vec<String>,
    },
}

impl Outcome {
    /// Builds a class outcome from raw labels; levels follow natural ordering.
    pub fn from_labels<S: AsRef<str>>(raw: &[S]) -> Result<Self, DataError> {
        let levels: Vec<String> = raw
            .iter()
            .map(|label| label.as_ref().to_string())
            .unique()
            .sorted_by(|a, b| natord::compare(a, b))
            .collect();
        if levels.len() < 2 {
            return Err(DataError::TooFewClasses(levels.len()));
        }
        let labels = raw
            .iter()
            .map(|label| {
                levels
                    .iter()
                    .position(|level| level == label.as_ref())
                    .ok_or_else(|| DataError::UnknownLevel(label.as_ref().to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Outcome::Class {
            labels: Array1::from_vec(labels),
            levels,
        })
    }

    pub fn len(&self) -> usize {
        match self {
            Outcome::Numeric(values) => values.len(),
            Outcome::Class { labels, .. } => labels.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Class levels; empty for numeric outcomes.
    pub fn levels(&self) -> &[String] {
        match self {
            Outcome::Numeric(_) => &[],
            Outcome::Class { levels, .. } => levels,
        }
    }

    /// Number of prediction columns a model must produce for this outcome.
    pub fn prediction_width(&self) -> usize {
        match self {
            Outcome::Numeric(_) => 1,
            Outcome::Class { levels, .. } => levels.len(),
        }
    }

    /// The outcome restricted to `rows`, in that order.
    pub fn select(&self, rows: &[usize]) -> Outcome {
        match self {
            Outcome::Numeric(values) => Outcome::Numeric(values.select(Axis(0), rows)),
            Outcome::Class { labels, levels } => Outcome::Class {
                labels: labels.select(Axis(0), rows),
                levels: levels.clone(),
            },
        }
    }

    /// One-hot indicator matrix for class outcomes, `[n_rows, n_levels]`.
    pub fn indicators(&self) -> Option<Array2<f64>> {
        match self {
            Outcome::Numeric(_) => None,
            Outcome::Class { labels, levels } => {
                let mut onehot = Array2::zeros((labels.len(), levels.len()));
                for (row, &label) in labels.iter().enumerate() {
                    onehot[[row, label]] = 1.0;
                }
                Some(onehot)
            }
        }
    }
}

/// A validated training set.
#[derive(Debug, Clone)]
pub struct TrainingData {
    /// Shape: [n_rows, n_features].
    pub features: Array2<f64>,
    pub feature_names: Vec<String>,
    pub outcome: Outcome,
}

impl TrainingData {
    pub fn new(
        features: Array2<f64>,
        feature_names: Vec<String>,
        outcome: Outcome,
    ) -> Result<Self, DataError> {
        if features.nrows() != outcome.len() {
            return Err(DataError::RowCountMismatch {
                features: features.nrows(),
                outcome: outcome.len(),
            });
        }
        if features.ncols() != feature_names.len() {
            return Err(DataError::FeatureNameMismatch {
                columns: features.ncols(),
                names: feature_names.len(),
            });
        }
        if features.iter().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound("features".to_string()));
        }
        Ok(Self {
            features,
            feature_names,
            outcome,
        })
    }

    pub fn n_rows(&self) -> usize {
        self.features.nrows()
    }

    pub fn features(&self) -> ArrayView2<'_, f64> {
        self.features.view()
    }

    /// The subset of rows used to train one resampling fold.
    pub fn select_rows(&self, rows: &[usize]) -> TrainingData {
        TrainingData {
            features: self.features.select(Axis(0), rows),
            feature_names: self.feature_names.clone(),
            outcome: self.outcome.select(rows),
        }
    }

    /// Index of a named feature column.
    pub fn feature_index(&self, name: &str) -> Option<usize> {
        self.feature_names.iter().position(|n| n == name)
    }
}

/// Feature rows to predict, with identifiers for the output file.
#[derive(Debug)]
pub struct FeatureData {
    pub features: Array2<f64>,
    pub sample_ids: Vec<String>,
}

/// A precomputed table of held-out predictions: the outcome, each row's fold
/// label and one numeric column per prediction.
#[derive(Debug)]
pub struct HeldOutTable {
    pub outcome: Outcome,
    pub fold_labels: Vec<usize>,
    pub predictions: Array2<f64>,
    pub prediction_names: Vec<String>,
}

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the required column '{0}'. Complete data is required."
    )]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("A classification outcome needs at least two classes, found {0}.")]
    TooFewClasses(usize),
    #[error("Label '{0}' is not one of the outcome levels.")]
    UnknownLevel(String),
    #[error("Feature matrix has {features} rows but the outcome has {outcome}.")]
    RowCountMismatch { features: usize, outcome: usize },
    #[error("Feature matrix has {columns} columns but {names} feature names were given.")]
    FeatureNameMismatch { columns: usize, names: usize },
    #[error("The input file has no feature columns besides the outcome.")]
    NoFeatures,
}

/// Loads training data: `outcome_column` is the outcome and every other
/// column (except `sample_id`) is a numeric feature.
pub fn load_training_data(
    path: &str,
    outcome_column: &str,
    task: Task,
) -> Result<TrainingData, DataError> {
    let df = internal::read_tsv(path)?;
    internal::require_columns(&df, &[outcome_column])?;

    let outcome = internal::extract_outcome(&df, outcome_column, task)?;
    let feature_names: Vec<String> = internal::column_names(&df)
        .into_iter()
        .filter(|name| name != outcome_column && name != SAMPLE_ID_COLUMN)
        .collect();
    if feature_names.is_empty() {
        return Err(DataError::NoFeatures);
    }
    let features = internal::extract_matrix(&df, &feature_names)?;
    log::info!(
        "Loaded {} training rows with {} features from '{}'",
        features.nrows(),
        features.ncols(),
        path
    );
    TrainingData::new(features, feature_names, outcome)
}

/// Loads feature rows for prediction, in the column order of `feature_names`.
pub fn load_feature_data(path: &str, feature_names: &[String]) -> Result<FeatureData, DataError> {
    let df = internal::read_tsv(path)?;
    let required: Vec<&str> = feature_names.iter().map(String::as_str).collect();
    internal::require_columns(&df, &required)?;
    let features = internal::extract_matrix(&df, feature_names)?;
    let sample_ids = internal::build_sample_ids(&df, features.nrows())?;
    Ok(FeatureData {
        features,
        sample_ids,
    })
}

/// Loads a precomputed held-out prediction table.
pub fn load_held_out_table(
    path: &str,
    outcome_column: &str,
    fold_column: &str,
    task: Task,
) -> Result<HeldOutTable, DataError> {
    let df = internal::read_tsv(path)?;
    internal::require_columns(&df, &[outcome_column, fold_column])?;

    let outcome = internal::extract_outcome(&df, outcome_column, task)?;
    let fold_labels = internal::extract_numeric_column(&df, fold_column)?
        .into_iter()
        .map(|value| {
            if value < 0.0 || value.fract() != 0.0 {
                Err(DataError::ColumnWrongType {
                    column_name: fold_column.to_string(),
                    expected_type: "non-negative integer fold labels",
                    found_type: value.to_string(),
                })
            } else {
                Ok(value as usize)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    let prediction_names: Vec<String> = internal::column_names(&df)
        .into_iter()
        .filter(|name| name != outcome_column && name != fold_column && name != SAMPLE_ID_COLUMN)
        .collect();
    if prediction_names.is_empty() {
        return Err(DataError::NoFeatures);
    }
    let predictions = internal::extract_matrix(&df, &prediction_names)?;
    Ok(HeldOutTable {
        outcome,
        fold_labels,
        predictions,
        prediction_names,
    })
}

mod internal {
    use super::*;

    pub(super) fn read_tsv(path: &str) -> Result<DataFrame, DataError> {
        let df = CsvReader::new(File::open(Path::new(path))?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
            )
            .finish()?;
        log::debug!("Read {} rows and {} columns from '{}'", df.height(), df.width(), path);
        Ok(df)
    }

    pub(super) fn column_names(df: &DataFrame) -> Vec<String> {
        df.get_column_names()
            .into_iter()
            .map(|name| name.to_string())
            .collect()
    }

    pub(super) fn require_columns(df: &DataFrame, required: &[&str]) -> Result<(), DataError> {
        let present: HashSet<String> = column_names(df).into_iter().collect();
        for name in required {
            if !present.contains(*name) {
                return Err(DataError::ColumnNotFound(name.to_string()));
            }
        }
        Ok(())
    }

    pub(super) fn extract_numeric_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }

        let wrong_type = || DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        };
        let casted = series.cast(&DataType::Float64).map_err(|_| wrong_type())?;
        if casted.null_count() > 0 {
            return Err(wrong_type());
        }

        let values: Vec<f64> = casted.f64()?.rechunk().into_no_null_iter().collect();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }

    pub(super) fn extract_matrix(
        df: &DataFrame,
        names: &[String],
    ) -> Result<Array2<f64>, DataError> {
        let n_rows = df.height();
        let mut buffer = Vec::with_capacity(n_rows * names.len());
        for name in names {
            buffer.append(&mut extract_numeric_column(df, name)?);
        }
        // Columns were appended one after another, so the buffer is column-major.
        Array2::from_shape_vec((n_rows, names.len()).f(), buffer)
            .map_err(|e| DataError::ColumnWrongType {
                column_name: names.join(","),
                expected_type: "rectangular numeric table",
                found_type: e.to_string(),
            })
    }

    pub(super) fn extract_outcome(
        df: &DataFrame,
        column_name: &str,
        task: Task,
    ) -> Result<Outcome, DataError> {
        match task {
            Task::Regression => Ok(Outcome::Numeric(Array1::from_vec(extract_numeric_column(
                df,
                column_name,
            )?))),
            Task::Classification => {
                let column = df.column(column_name)?;
                if column.null_count() > 0 {
                    return Err(DataError::MissingValuesFound(column_name.to_string()));
                }
                let as_text = column.cast(&DataType::String)?;
                let labels: Vec<String> = as_text
                    .as_materialized_series()
                    .str()?
                    .into_iter()
                    .map(|value| value.unwrap_or_default().to_string())
                    .collect();
                Outcome::from_labels(&labels)
            }
        }
    }

    pub(super) fn build_sample_ids(df: &DataFrame, n: usize) -> Result<Vec<String>, DataError> {
        let sequential = || (1..=n).map(|i| i.to_string()).collect::<Vec<_>>();
        if !column_names(df).iter().any(|name| name == SAMPLE_ID_COLUMN) {
            return Ok(sequential());
        }
        let column = df.column(SAMPLE_ID_COLUMN)?;
        if column.null_count() > 0 {
            return Ok(sequential());
        }
        let as_text = column.cast(&DataType::String)?;
        let ids = as_text
            .as_materialized_series()
            .str()?
            .into_iter()
            .enumerate()
            .map(|(i, value)| match value {
                Some(text) if !text.is_empty() => text.to_string(),
                _ => (i + 1).to_string(),
            })
            .collect();
        Ok(ids)
    }
}
