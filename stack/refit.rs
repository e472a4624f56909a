//! # Member Refitter
//!
//! Re-executes the complete fitting procedure of every candidate the blend
//! kept, on the full training data. A member whose fit fails, or runs over
//! the optional time budget, is dropped: its coefficients are zeroed, the
//! survivors are renormalized according to [`RenormalizePolicy`] and the
//! failure is kept on the [`FittedEnsemble`] for the caller to report.

use crate::blend::{BlendModel, ZERO_COEFFICIENT};
use crate::candidate::{Candidate, FittedModel, ModelError};
use crate::data::TrainingData;
use crate::parallel::WorkerPool;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

/// How surviving coefficients change when a member is dropped.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum RenormalizePolicy {
    /// Scale survivors so the coefficient total is unchanged.
    #[default]
    PreserveTotal,
    /// Leave survivors as they are.
    Zero,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RefitConfig {
    pub renormalize: RenormalizePolicy,
    /// Wall-clock seconds a single member refit may take.
    pub time_budget_secs: Option<f64>,
}

#[derive(Error, Debug)]
pub enum RefitError {
    #[error("Refitting member '{candidate}' failed: {source}")]
    RefitFailure {
        candidate: String,
        #[source]
        source: ModelError,
    },
    #[error("The blend selected candidate '{0}', which was not supplied for refitting.")]
    UnknownCandidate(String),
}

/// A refit member and its weight in the ensemble.
#[derive(Debug)]
pub struct Member {
    name: String,
    weight: f64,
    model: Box<dyn FittedModel>,
}

impl Member {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sum of the member's blend coefficients.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn model(&self) -> &dyn FittedModel {
        self.model.as_ref()
    }
}

/// The blend together with its members refit on the full training data.
#[derive(Debug)]
pub struct FittedEnsemble {
    blend: BlendModel,
    members: Vec<Member>,
    dropped: Vec<RefitError>,
    feature_names: Vec<String>,
}

impl FittedEnsemble {
    /// The blend after any renormalization caused by dropped members.
    pub fn blend(&self) -> &BlendModel {
        &self.blend
    }

    /// Surviving members in registration order.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Members dropped because their refit failed.
    pub fn dropped(&self) -> &[RefitError] {
        &self.dropped
    }

    /// Feature columns new data must provide, in training order.
    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }
}

/// Refits the members selected by `blend` on `data`.
pub fn refit(
    candidates: &[Candidate],
    blend: &BlendModel,
    data: &TrainingData,
    config: &RefitConfig,
    pool: &WorkerPool,
) -> Result<FittedEnsemble, RefitError> {
    let selected: Vec<&Candidate> = blend
        .members()
        .into_iter()
        .map(|name| {
            candidates
                .iter()
                .find(|candidate| candidate.name() == name)
                .ok_or(RefitError::UnknownCandidate(name))
        })
        .collect::<Result<_, _>>()?;

    log::info!(
        "Refitting {} of {} candidates on {} training rows.",
        selected.len(),
        blend.candidates.len(),
        data.n_rows()
    );
    let budget = config.time_budget_secs.map(Duration::from_secs_f64);

    let results = pool.map_join(&selected, |candidate| {
        let started = Instant::now();
        let fitted = candidate.spec().fit(data)?;
        let elapsed = started.elapsed();
        match budget {
            Some(limit) if elapsed > limit => Err(ModelError::Fit(format!(
                "took {:.2}s, over the refit time budget of {:.2}s",
                elapsed.as_secs_f64(),
                limit.as_secs_f64()
            ))),
            _ => {
                log::debug!(
                    "Refit '{}' in {:.3}s",
                    candidate.name(),
                    elapsed.as_secs_f64()
                );
                Ok(fitted)
            }
        }
    });

    let mut fitted_models = Vec::with_capacity(selected.len());
    let mut dropped = Vec::new();
    for (candidate, result) in selected.iter().zip(results) {
        match result {
            Ok(model) => fitted_models.push((candidate.name().to_string(), model)),
            Err(source) => {
                log::warn!(
                    "Dropping member '{}' from the ensemble: {}",
                    candidate.name(),
                    source
                );
                dropped.push(RefitError::RefitFailure {
                    candidate: candidate.name().to_string(),
                    source,
                });
            }
        }
    }

    let mut adjusted = blend.clone();
    let dropped_names: Vec<&str> = dropped
        .iter()
        .filter_map(|error| match error {
            RefitError::RefitFailure { candidate, .. } => Some(candidate.as_str()),
            RefitError::UnknownCandidate(_) => None,
        })
        .collect();
    drop_members(&mut adjusted, &dropped_names, config.renormalize);

    let weights = adjusted.member_weights();
    let members = fitted_models
        .into_iter()
        .map(|(name, model)| {
            let weight = weights
                .iter()
                .find(|(candidate, _)| *candidate == name)
                .map_or(0.0, |(_, weight)| *weight);
            Member {
                name,
                weight,
                model,
            }
        })
        .collect();

    Ok(FittedEnsemble {
        blend: adjusted,
        members,
        dropped,
        feature_names: data.feature_names.clone(),
    })
}

/// Zeroes every coefficient of the named candidates and renormalizes the rest.
pub fn drop_members(blend: &mut BlendModel, names: &[&str], policy: RenormalizePolicy) {
    if names.is_empty() {
        return;
    }
    let total_before: f64 = blend.terms.iter().map(|term| term.coefficient).sum();
    for term in blend
        .terms
        .iter_mut()
        .filter(|term| names.contains(&term.candidate.as_str()))
    {
        term.coefficient = 0.0;
    }

    if policy == RenormalizePolicy::PreserveTotal {
        let survivors = || {
            blend
                .terms
                .iter()
                .map(|term| term.coefficient)
                .filter(|c| c.abs() > ZERO_COEFFICIENT)
        };
        if survivors().next().is_none() {
            log::warn!(
                "No surviving coefficients to renormalize after dropping {}; leaving them unscaled.",
                names.join(", ")
            );
            return;
        }
        // Only a same-signed set of survivors has a total that scaling can preserve.
        let mixed_signs = survivors().any(|c| c > 0.0) && survivors().any(|c| c < 0.0);
        let total_after: f64 = survivors().sum();
        let scale = total_before / total_after;
        if mixed_signs || !scale.is_finite() || scale <= 0.0 {
            log::warn!(
                "Surviving coefficients after dropping {} cannot be rescaled to the previous total {:.6} without changing sign; leaving them unscaled.",
                names.join(", "),
                total_before
            );
            return;
        }
        for term in blend.terms.iter_mut() {
            term.coefficient *= scale;
        }
        log::info!("Rescaled surviving coefficients by {scale:.6} to preserve their total.");
    }
}
