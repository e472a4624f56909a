//! # Blend Model
//!
//! The configuration of the blending regression and its fitted result. The
//! fitted [`BlendModel`] is a self-contained, human-readable artifact: it
//! names every candidate, holds one coefficient per (linear predictor,
//! stacked column) term, and keeps the cross-validated penalty path that the
//! penalty was selected from. It is saved to and loaded from TOML.

use crate::family::Family;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

/// Coefficients whose magnitude falls below this are reported as zero.
pub const ZERO_COEFFICIENT: f64 = 1e-12;

/// The penalty values the blend is cross-validated over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PenaltyGrid {
    /// The given penalty values, in any order.
    Explicit { values: Vec<f64> },
    /// `count` values spaced geometrically from the smallest penalty that
    /// zeroes every coefficient down to `min_ratio` times that penalty.
    Auto { count: usize, min_ratio: f64 },
}

impl Default for PenaltyGrid {
    fn default() -> Self {
        PenaltyGrid::Explicit {
            values: (-6..=-1).map(|e| 10f64.powi(e)).collect(),
        }
    }
}

/// Held-out error used to compare penalties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CvMetric {
    /// Mean squared error for numeric outcomes, mean deviance for classes.
    Deviance,
    /// Fraction of misclassified rows. Classification only.
    Misclassification,
}

impl fmt::Display for CvMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CvMetric::Deviance => f.write_str("deviance"),
            CvMetric::Misclassification => f.write_str("misclassification"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlendConfig {
    pub penalty: PenaltyGrid,
    /// Elastic-net mixing: 1 is the lasso, 0 is ridge.
    pub mixture: f64,
    /// Constrain every coefficient to be non-negative.
    pub non_negative: bool,
    pub metric: CvMetric,
    /// Folds of the internal cross-validation over stacked rows.
    pub cv_folds: usize,
    pub seed: u64,
    /// Coordinate-descent sweeps allowed per sub-problem.
    pub max_iterations: usize,
    /// IRLS steps allowed per penalty for binomial and multinomial blends.
    pub max_outer_iterations: usize,
    /// Coordinate descent stops once the largest weighted squared
    /// coefficient change in a sweep is below this.
    pub tolerance: f64,
    /// IRLS stops once the relative deviance change is below this.
    pub outer_tolerance: f64,
}

impl Default for BlendConfig {
    fn default() -> Self {
        Self {
            penalty: PenaltyGrid::default(),
            mixture: 1.0,
            non_negative: true,
            metric: CvMetric::Deviance,
            cv_folds: 5,
            seed: 42,
            max_iterations: 100_000,
            max_outer_iterations: 100,
            tolerance: 1e-10,
            outer_tolerance: 1e-8,
        }
    }
}

/// One coefficient of the blend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlendTerm {
    pub candidate: String,
    /// Stacked column label (`name` or `name:level`).
    pub column: String,
    /// Class whose linear predictor this term belongs to (multinomial only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    pub coefficient: f64,
}

/// Cross-validated error of one penalty value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenaltyResult {
    pub penalty: f64,
    pub mean_error: f64,
    pub std_error: f64,
    /// Non-zero coefficients of the full-data fit at this penalty.
    pub num_nonzero: usize,
}

/// The fitted blending regression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlendModel {
    pub family: Family,
    pub metric: CvMetric,
    pub mixture: f64,
    pub non_negative: bool,
    /// The selected penalty.
    pub penalty: f64,
    /// Outcome class levels; empty for numeric outcomes.
    pub levels: Vec<String>,
    /// Every registered candidate, in registration order.
    pub candidates: Vec<String>,
    /// One intercept per linear predictor.
    pub intercepts: Vec<f64>,
    pub terms: Vec<BlendTerm>,
    /// Cross-validation results, ordered by increasing penalty.
    pub path: Vec<PenaltyResult>,
}

#[derive(Error, Debug)]
pub enum BlendIoError {
    #[error("Failed to read or write blend file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML blend file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize blend to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

impl BlendModel {
    /// Candidates with at least one non-zero coefficient, in registration order.
    pub fn members(&self) -> Vec<String> {
        self.candidates
            .iter()
            .filter(|name| self.has_nonzero_term(name))
            .cloned()
            .collect()
    }

    fn has_nonzero_term(&self, name: &str) -> bool {
        self.terms
            .iter()
            .any(|term| term.candidate == name && term.coefficient.abs() > ZERO_COEFFICIENT)
    }

    /// Sum of each candidate's coefficients, in registration order.
    pub fn member_weights(&self) -> Vec<(String, f64)> {
        self.candidates
            .iter()
            .map(|name| {
                let weight = self
                    .terms
                    .iter()
                    .filter(|term| &term.candidate == name)
                    .map(|term| term.coefficient)
                    .sum::<f64>();
                let weight = if self.has_nonzero_term(name) { weight } else { 0.0 };
                (name.clone(), weight)
            })
            .collect()
    }

    /// True when every coefficient is zero.
    pub fn is_empty(&self) -> bool {
        self.terms
            .iter()
            .all(|term| term.coefficient.abs() <= ZERO_COEFFICIENT)
    }

    /// Rows of the coefficient table with a non-zero coefficient.
    pub fn coefficient_table(&self) -> Vec<&BlendTerm> {
        self.terms
            .iter()
            .filter(|term| term.coefficient.abs() > ZERO_COEFFICIENT)
            .collect()
    }

    /// The path entry of the selected penalty.
    pub fn selected(&self) -> Option<&PenaltyResult> {
        self.path.iter().find(|result| result.penalty == self.penalty)
    }

    /// Saves the blend in a human-readable TOML format.
    pub fn save(&self, path: &str) -> Result<(), BlendIoError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: &str) -> Result<Self, BlendIoError> {
        let toml_string = fs::read_to_string(path)?;
        Ok(toml::from_str(&toml_string)?)
    }
}

impl fmt::Display for BlendModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members = self.members();
        writeln!(
            f,
            "Out of {} possible candidate members, the ensemble retained {}.",
            self.candidates.len(),
            members.len()
        )?;
        writeln!(
            f,
            "Penalty: {:e}. Mixture: {}. Family: {}. Metric: {}.",
            self.penalty, self.mixture, self.family, self.metric
        )?;
        for (name, weight) in self.member_weights() {
            if members.contains(&name) {
                writeln!(f, "  {name:<24} {weight:>12.6}")?;
            }
        }
        Ok(())
    }
}

/// One-standard-error rule: among penalties whose mean error is within one
/// standard error of the best mean error, the index of the largest penalty.
pub fn select_one_se(path: &[PenaltyResult]) -> Option<usize> {
    let best = path
        .iter()
        .min_by(|a, b| a.mean_error.total_cmp(&b.mean_error))?;
    let threshold = best.mean_error + best.std_error;
    path.iter()
        .enumerate()
        .filter(|(_, result)| result.mean_error <= threshold)
        .max_by(|a, b| a.1.penalty.total_cmp(&b.1.penalty))
        .map(|(index, _)| index)
}
