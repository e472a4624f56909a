//! # Blending Solver
//!
//! Fits the sparse, optionally non-negative elastic-net regression that maps
//! stacked candidate predictions to the outcome.
//!
//! Columns are standardized to zero mean and unit (population) variance before
//! fitting and the coefficients are mapped back to the original prediction
//! scale afterwards. Intercepts are never penalized. For every penalty in the
//! grid the coefficients are found by cyclic coordinate descent, warm-started
//! from the next stronger penalty; binomial and multinomial blends wrap the
//! coordinate descent in a penalized IRLS loop with step halving. The penalty
//! is picked by v-fold cross-validation over the stacked rows and the
//! one-standard-error rule.

use crate::blend::{
    BlendConfig, BlendModel, BlendTerm, CvMetric, PenaltyGrid, PenaltyResult, ZERO_COEFFICIENT,
    select_one_se,
};
use crate::data::Outcome;
use crate::family::{
    Family, binomial_deviance, binomial_working_vectors, gaussian_loss, multinomial_deviance,
    multinomial_working_vectors, sigmoid, softmax_rows,
};
use crate::parallel::WorkerPool;
use crate::partition::{Fold, PartitionError, ResamplePartition};
use crate::registry::StackedColumn;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, Axis, Zip};
use thiserror::Error;

/// Columns with a smaller standard deviation are treated as constant.
const MIN_SCALE: f64 = 1e-12;
const MAX_STEP_HALVINGS: usize = 30;
/// Clamp for the null-model class frequency used to start the IRLS loop.
const MIN_NULL_PROB: f64 = 1e-5;

#[derive(Error, Debug)]
pub enum SolverError {
    #[error("The blend did not converge within {iterations} iterations at penalty {penalty:e}.")]
    SolverNonConvergence { penalty: f64, iterations: usize },
    #[error("Invalid blend configuration: {0}")]
    InvalidConfig(String),
    #[error("The stack has no candidate columns to blend.")]
    NoColumns,
    #[error("Failed to split the stacked rows for cross-validation: {0}")]
    Partition(#[from] PartitionError),
}

/// The numerical settings shared by every sub-problem.
#[derive(Debug, Clone, Copy)]
struct SolverSettings {
    mixture: f64,
    non_negative: bool,
    tolerance: f64,
    max_iterations: usize,
    max_outer_iterations: usize,
    outer_tolerance: f64,
}

impl SolverSettings {
    fn from_config(config: &BlendConfig) -> Self {
        Self {
            mixture: config.mixture,
            non_negative: config.non_negative,
            tolerance: config.tolerance,
            max_iterations: config.max_iterations,
            max_outer_iterations: config.max_outer_iterations,
            outer_tolerance: config.outer_tolerance,
        }
    }

    /// The elastic-net penalty of a coefficient matrix.
    fn penalty_value(&self, beta: ArrayView2<f64>, penalty: f64) -> f64 {
        let alpha = self.mixture;
        penalty
            * beta.fold(0.0, |acc, &b| {
                acc + alpha * b.abs() + 0.5 * (1.0 - alpha) * b * b
            })
    }
}

/// The response the solver regresses on.
#[derive(Debug, Clone)]
enum Target {
    /// Numeric outcome, or 0/1 indicator of the second level for binomial.
    Response(Array1<f64>),
    Classes {
        labels: Array1<usize>,
        indicators: Array2<f64>,
    },
}

impl Target {
    fn from_outcome(outcome: &Outcome, family: Family) -> Self {
        match (outcome, family) {
            (Outcome::Numeric(values), _) => Target::Response(values.clone()),
            (Outcome::Class { labels, .. }, Family::Binomial) => {
                Target::Response(labels.mapv(|label| if label == 1 { 1.0 } else { 0.0 }))
            }
            (Outcome::Class { labels, levels }, _) => {
                let mut indicators = Array2::zeros((labels.len(), levels.len()));
                for (row, &label) in labels.iter().enumerate() {
                    indicators[[row, label]] = 1.0;
                }
                Target::Classes {
                    labels: labels.clone(),
                    indicators,
                }
            }
        }
    }

    fn select(&self, rows: &[usize]) -> Self {
        match self {
            Target::Response(y) => Target::Response(y.select(Axis(0), rows)),
            Target::Classes { labels, indicators } => Target::Classes {
                labels: labels.select(Axis(0), rows),
                indicators: indicators.select(Axis(0), rows),
            },
        }
    }
}

/// Coefficients at one point of the penalty path.
#[derive(Debug, Clone)]
struct PathPoint {
    intercepts: Array1<f64>,
    /// Shape: [n_predictors, n_columns].
    beta: Array2<f64>,
}

impl PathPoint {
    /// The intercept-only model: coefficients zero, intercepts at the null fit.
    fn null(target: &Target, family: Family, n_columns: usize) -> Self {
        let intercepts = match (target, family) {
            (Target::Response(y), Family::Binomial) => {
                let p = y.mean().unwrap_or(0.5).clamp(MIN_NULL_PROB, 1.0 - MIN_NULL_PROB);
                Array1::from_elem(1, (p / (1.0 - p)).ln())
            }
            (Target::Response(y), _) => Array1::from_elem(1, y.mean().unwrap_or(0.0)),
            (Target::Classes { indicators, .. }, _) => indicators
                .mean_axis(Axis(0))
                .unwrap_or_else(|| Array1::zeros(indicators.ncols()))
                .mapv(|p| p.max(MIN_NULL_PROB).ln()),
        };
        let beta = Array2::zeros((intercepts.len(), n_columns));
        Self { intercepts, beta }
    }

    /// Linear predictors, `[n_rows, n_predictors]`.
    fn linear_predictors(&self, x: ArrayView2<f64>) -> Array2<f64> {
        let mut eta = x.dot(&self.beta.t());
        eta += &self.intercepts;
        eta
    }

    fn num_nonzero(&self) -> usize {
        self.beta
            .iter()
            .filter(|b| b.abs() > ZERO_COEFFICIENT)
            .count()
    }

    /// Moves halfway back towards `previous`.
    fn halve_towards(&mut self, previous: &PathPoint) {
        Zip::from(&mut self.beta)
            .and(&previous.beta)
            .for_each(|b, &old| *b = 0.5 * (*b + old));
        Zip::from(&mut self.intercepts)
            .and(&previous.intercepts)
            .for_each(|b, &old| *b = 0.5 * (*b + old));
    }
}

/// Column centering and scaling learned on one set of stacked rows.
#[derive(Debug, Clone)]
struct Standardizer {
    means: Array1<f64>,
    /// Zero marks a constant column.
    scales: Array1<f64>,
}

impl Standardizer {
    fn fit(x: ArrayView2<f64>) -> Self {
        let means = x
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(x.ncols()));
        let scales = x
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > MIN_SCALE { s } else { 0.0 });
        Self { means, scales }
    }

    fn apply(&self, x: ArrayView2<f64>) -> Array2<f64> {
        let mut standardized = x.to_owned();
        for ((mut column, &mean), &scale) in standardized
            .axis_iter_mut(Axis(1))
            .zip(&self.means)
            .zip(&self.scales)
        {
            if scale > 0.0 {
                column.mapv_inplace(|v| (v - mean) / scale);
            } else {
                column.fill(0.0);
            }
        }
        standardized
    }

    /// Maps standardized-scale coefficients back to the prediction scale.
    fn to_original_scale(&self, point: &PathPoint) -> PathPoint {
        let mut beta = point.beta.clone();
        for (mut column, &scale) in beta.axis_iter_mut(Axis(1)).zip(&self.scales) {
            if scale > 0.0 {
                column.mapv_inplace(|b| b / scale);
            } else {
                column.fill(0.0);
            }
        }
        let intercepts = &point.intercepts - &beta.dot(&self.means);
        PathPoint { intercepts, beta }
    }
}

pub struct BlendingSolver<'a> {
    config: &'a BlendConfig,
    pool: &'a WorkerPool,
}

impl<'a> BlendingSolver<'a> {
    pub fn new(config: &'a BlendConfig, pool: &'a WorkerPool) -> Self {
        Self { config, pool }
    }

    /// Fits the blend on the stacked matrix.
    ///
    /// * `matrix` - `[stacked rows, stacked columns]` held-out predictions.
    /// * `outcome` - the outcome aligned with the stacked rows.
    /// * `columns` - one descriptor per stacked column.
    /// * `candidate_names` - candidate names in registration order.
    pub fn fit(
        &self,
        matrix: ArrayView2<f64>,
        outcome: &Outcome,
        columns: &[StackedColumn],
        candidate_names: &[String],
    ) -> Result<BlendModel, SolverError> {
        if columns.is_empty() || matrix.ncols() == 0 {
            return Err(SolverError::NoColumns);
        }
        if matrix.ncols() != columns.len() || matrix.nrows() != outcome.len() {
            return Err(SolverError::InvalidConfig(format!(
                "stacked matrix is {}x{} but there are {} outcome rows and {} column descriptors",
                matrix.nrows(),
                matrix.ncols(),
                outcome.len(),
                columns.len()
            )));
        }

        let family = Family::for_outcome(outcome);
        self.validate(family, matrix.nrows())?;
        let settings = SolverSettings::from_config(self.config);

        // Binomial blends regress on each candidate's event-level column only.
        let used: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter(|(_, column)| family != Family::Binomial || column.level == Some(1))
            .map(|(index, _)| index)
            .collect();
        if used.is_empty() {
            return Err(SolverError::NoColumns);
        }
        let design = matrix.select(Axis(1), &used);
        let target = Target::from_outcome(outcome, family);

        let standardizer = Standardizer::fit(design.view());
        for (position, &scale) in standardizer.scales.iter().enumerate() {
            if scale == 0.0 {
                log::warn!(
                    "Stacked column '{}' is constant; its coefficient is fixed at zero.",
                    columns[used[position]].label
                );
            }
        }
        let standardized = standardizer.apply(design.view());
        let penalties = self.penalty_values(standardized.view(), &target, &settings)?;
        log::info!(
            "Blending {} stacked rows x {} columns ({} family) over {} penalty values with {}-fold cross-validation.",
            design.nrows(),
            design.ncols(),
            family,
            penalties.len(),
            self.config.cv_folds
        );

        let cv_errors = self.cross_validate(design.view(), &target, family, &penalties, &settings)?;
        let full_path = fit_path(standardized.view(), &target, family, &penalties, &settings)?;

        // Penalties run strongest first; the stored path runs weakest first.
        let n_folds = cv_errors.len() as f64;
        let path: Vec<PenaltyResult> = penalties
            .iter()
            .enumerate()
            .map(|(index, &penalty)| {
                let errors: Array1<f64> = cv_errors.iter().map(|fold| fold[index]).collect();
                let result = PenaltyResult {
                    penalty,
                    mean_error: errors.mean().unwrap_or(f64::NAN),
                    std_error: errors.std(1.0) / n_folds.sqrt(),
                    num_nonzero: full_path[index].num_nonzero(),
                };
                log::debug!(
                    "penalty {:e}: cv error {:.6} (se {:.6}), {} non-zero",
                    result.penalty,
                    result.mean_error,
                    result.std_error,
                    result.num_nonzero
                );
                result
            })
            .rev()
            .collect();

        let selected = select_one_se(&path).ok_or(SolverError::NoColumns)?;
        let penalty = path[selected].penalty;
        let point = standardizer.to_original_scale(&full_path[penalties.len() - 1 - selected]);

        let levels = outcome.levels().to_vec();
        let mut terms = Vec::with_capacity(point.beta.len());
        for (predictor, row) in point.beta.axis_iter(Axis(0)).enumerate() {
            let class = (family == Family::Multinomial).then(|| levels[predictor].clone());
            for (&column_index, &coefficient) in used.iter().zip(row.iter()) {
                let column = &columns[column_index];
                terms.push(BlendTerm {
                    candidate: candidate_names[column.candidate].clone(),
                    column: column.label.clone(),
                    class: class.clone(),
                    coefficient: if coefficient.abs() > ZERO_COEFFICIENT {
                        coefficient
                    } else {
                        0.0
                    },
                });
            }
        }

        let blend = BlendModel {
            family,
            metric: self.config.metric,
            mixture: self.config.mixture,
            non_negative: self.config.non_negative,
            penalty,
            levels,
            candidates: candidate_names.to_vec(),
            intercepts: point.intercepts.to_vec(),
            terms,
            path,
        };
        log::info!(
            "Selected penalty {:e}; {} of {} candidates have non-zero coefficients.",
            penalty,
            blend.members().len(),
            candidate_names.len()
        );
        Ok(blend)
    }

    fn validate(&self, family: Family, n_rows: usize) -> Result<(), SolverError> {
        let config = self.config;
        let invalid = |message: String| Err(SolverError::InvalidConfig(message));
        if !(0.0..=1.0).contains(&config.mixture) {
            return invalid(format!("mixture must lie in [0, 1], got {}", config.mixture));
        }
        if config.cv_folds < 2 {
            return invalid(format!(
                "cross-validation needs at least 2 folds, got {}",
                config.cv_folds
            ));
        }
        if config.cv_folds > n_rows {
            return invalid(format!(
                "{} cross-validation folds requested for {} stacked rows",
                config.cv_folds, n_rows
            ));
        }
        if !(config.tolerance > 0.0 && config.outer_tolerance > 0.0) {
            return invalid("convergence tolerances must be positive".to_string());
        }
        if config.max_iterations == 0 || config.max_outer_iterations == 0 {
            return invalid("iteration limits must be positive".to_string());
        }
        if config.metric == CvMetric::Misclassification && family == Family::Gaussian {
            return invalid("misclassification is only defined for class outcomes".to_string());
        }
        match &config.penalty {
            PenaltyGrid::Explicit { values } => {
                if values.is_empty() {
                    return invalid("the penalty grid is empty".to_string());
                }
                if let Some(bad) = values.iter().find(|v| !v.is_finite() || **v < 0.0) {
                    return invalid(format!("penalty values must be finite and >= 0, got {bad}"));
                }
            }
            PenaltyGrid::Auto { count, min_ratio } => {
                if *count == 0 {
                    return invalid("the automatic penalty grid needs at least one value".to_string());
                }
                if !(*min_ratio > 0.0 && *min_ratio < 1.0) {
                    return invalid(format!("min_ratio must lie in (0, 1), got {min_ratio}"));
                }
            }
        }
        Ok(())
    }

    /// The penalty grid, strongest penalty first, without duplicates.
    fn penalty_values(
        &self,
        standardized: ArrayView2<f64>,
        target: &Target,
        settings: &SolverSettings,
    ) -> Result<Vec<f64>, SolverError> {
        let mut values = match &self.config.penalty {
            PenaltyGrid::Explicit { values } => values.clone(),
            PenaltyGrid::Auto { count, min_ratio } => {
                let largest = largest_useful_penalty(standardized, target, settings);
                if *count == 1 {
                    vec![largest]
                } else {
                    let steps = (*count - 1) as f64;
                    (0..*count)
                        .map(|i| largest * min_ratio.powf(i as f64 / steps))
                        .collect()
                }
            }
        };
        values.sort_by(|a, b| b.total_cmp(a));
        values.dedup();
        if values.is_empty() {
            return Err(SolverError::InvalidConfig("the penalty grid is empty".to_string()));
        }
        Ok(values)
    }

    /// Held-out error of every penalty on every internal fold.
    fn cross_validate(
        &self,
        design: ArrayView2<f64>,
        target: &Target,
        family: Family,
        penalties: &[f64],
        settings: &SolverSettings,
    ) -> Result<Vec<Array1<f64>>, SolverError> {
        let partition =
            ResamplePartition::v_fold(design.nrows(), self.config.cv_folds, self.config.seed)?;
        let metric = self.config.metric;
        self.pool
            .map_join(partition.folds(), |fold| {
                fold_errors(design, target, family, metric, penalties, fold, settings)
            })
            .into_iter()
            .collect()
    }
}

/// Fits the training rows of one internal fold and scores its held-out rows.
fn fold_errors(
    design: ArrayView2<f64>,
    target: &Target,
    family: Family,
    metric: CvMetric,
    penalties: &[f64],
    fold: &Fold,
    settings: &SolverSettings,
) -> Result<Array1<f64>, SolverError> {
    let train = design.select(Axis(0), &fold.train);
    let standardizer = Standardizer::fit(train.view());
    let path = fit_path(
        standardizer.apply(train.view()).view(),
        &target.select(&fold.train),
        family,
        penalties,
        settings,
    )?;

    let held_out = standardizer.apply(design.select(Axis(0), &fold.held_out).view());
    let held_out_target = target.select(&fold.held_out);
    Ok(path
        .iter()
        .map(|point| held_out_error(family, metric, held_out.view(), &held_out_target, point))
        .collect())
}

/// Solutions along the penalty path, each warm-started from the previous one.
fn fit_path(
    x: ArrayView2<f64>,
    target: &Target,
    family: Family,
    penalties: &[f64],
    settings: &SolverSettings,
) -> Result<Vec<PathPoint>, SolverError> {
    let mut point = PathPoint::null(target, family, x.ncols());
    let mut path = Vec::with_capacity(penalties.len());
    for &penalty in penalties {
        match (target, family) {
            (Target::Response(y), Family::Gaussian) => {
                let weights = Array1::ones(y.len());
                coordinate_descent(
                    x,
                    y.view(),
                    weights.view(),
                    point.beta.row_mut(0),
                    &mut point.intercepts[0],
                    penalty,
                    settings,
                )?;
            }
            (Target::Response(y), _) => {
                fit_binomial(x, y.view(), &mut point, penalty, settings)?;
            }
            (Target::Classes { labels, indicators }, _) => {
                fit_multinomial(x, labels.view(), indicators.view(), &mut point, penalty, settings)?;
            }
        }
        path.push(point.clone());
    }
    Ok(path)
}

fn soft_threshold(value: f64, threshold: f64) -> f64 {
    if value > threshold {
        value - threshold
    } else if value < -threshold {
        value + threshold
    } else {
        0.0
    }
}

/// Weighted elastic-net coordinate descent on `z`:
///
/// minimizes `1/(2n) sum_i w_i (z_i - b0 - x_i.beta)^2 + penalty * P(beta)`
/// with `P(beta) = mixture * |beta|_1 + (1 - mixture)/2 * |beta|_2^2`, updating
/// `beta` and `intercept` in place. Returns the number of sweeps used.
fn coordinate_descent(
    x: ArrayView2<f64>,
    z: ArrayView1<f64>,
    weights: ArrayView1<f64>,
    mut beta: ArrayViewMut1<f64>,
    intercept: &mut f64,
    penalty: f64,
    settings: &SolverSettings,
) -> Result<usize, SolverError> {
    let n = x.nrows() as f64;
    let weight_total = weights.sum();
    let l1 = penalty * settings.mixture;
    let l2 = penalty * (1.0 - settings.mixture);

    let curvature: Array1<f64> = x
        .axis_iter(Axis(1))
        .map(|column| {
            Zip::from(column)
                .and(weights)
                .fold(0.0, |acc, &xij, &wi| acc + wi * xij * xij)
                / n
        })
        .collect();

    let mut residual = &z - &x.dot(&beta);
    residual.mapv_inplace(|r| r - *intercept);

    for sweep in 1..=settings.max_iterations {
        let mut largest_change: f64 = 0.0;
        for (j, column) in x.axis_iter(Axis(1)).enumerate() {
            if curvature[j] <= 0.0 {
                continue;
            }
            let old = beta[j];
            let gradient = Zip::from(column)
                .and(weights)
                .and(&residual)
                .fold(0.0, |acc, &xij, &wi, &ri| acc + wi * xij * ri)
                / n;
            let mut updated =
                soft_threshold(gradient + curvature[j] * old, l1) / (curvature[j] + l2);
            if settings.non_negative {
                updated = updated.max(0.0);
            }
            let delta = updated - old;
            if delta != 0.0 {
                residual.scaled_add(-delta, &column);
                beta[j] = updated;
                largest_change = largest_change.max(curvature[j] * delta * delta);
            }
        }

        if weight_total > 0.0 {
            let shift = weights.dot(&residual) / weight_total;
            if shift != 0.0 {
                *intercept += shift;
                residual.mapv_inplace(|r| r - shift);
                largest_change = largest_change.max(weight_total / n * shift * shift);
            }
        }

        if !largest_change.is_finite() {
            break;
        }
        if largest_change < settings.tolerance {
            return Ok(sweep);
        }
    }
    Err(SolverError::SolverNonConvergence {
        penalty,
        iterations: settings.max_iterations,
    })
}

/// Penalized binomial objective: mean negative log-likelihood plus penalty.
fn binomial_objective(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    point: &PathPoint,
    penalty: f64,
    settings: &SolverSettings,
) -> (f64, f64) {
    let mu = point.linear_predictors(x).column(0).mapv(sigmoid);
    let deviance = binomial_deviance(y, mu.view());
    (
        0.5 * deviance + settings.penalty_value(point.beta.view(), penalty),
        deviance,
    )
}

fn multinomial_objective(
    x: ArrayView2<f64>,
    labels: ArrayView1<usize>,
    point: &PathPoint,
    penalty: f64,
    settings: &SolverSettings,
) -> (f64, f64) {
    let probs = softmax_rows(point.linear_predictors(x).view());
    let deviance = multinomial_deviance(labels, probs.view());
    (
        0.5 * deviance + settings.penalty_value(point.beta.view(), penalty),
        deviance,
    )
}

/// Halves the step from `previous` until the objective does not increase.
fn enforce_descent<F>(
    previous: &PathPoint,
    point: &mut PathPoint,
    previous_objective: f64,
    objective: F,
) -> (f64, f64)
where
    F: Fn(&PathPoint) -> (f64, f64),
{
    let allowed = previous_objective + 1e-12 * previous_objective.abs().max(1.0);
    let mut current = objective(&*point);
    let mut halvings = 0;
    while (current.0.is_nan() || current.0 > allowed) && halvings < MAX_STEP_HALVINGS {
        point.halve_towards(previous);
        current = objective(&*point);
        halvings += 1;
    }
    if halvings > 0 {
        log::debug!("IRLS step halved {halvings} time(s)");
    }
    current
}

fn deviance_converged(old: f64, new: f64, tolerance: f64) -> bool {
    (old - new).abs() / (new.abs() + 0.1) < tolerance
}

fn fit_binomial(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    point: &mut PathPoint,
    penalty: f64,
    settings: &SolverSettings,
) -> Result<(), SolverError> {
    let objective = |candidate: &PathPoint| binomial_objective(x, y, candidate, penalty, settings);
    let (mut current_objective, mut deviance) = objective(&*point);

    for _ in 0..settings.max_outer_iterations {
        let eta = point.linear_predictors(x).column(0).to_owned();
        let (_, weights, z) = binomial_working_vectors(y, eta.view());
        let previous = point.clone();
        coordinate_descent(
            x,
            z.view(),
            weights.view(),
            point.beta.row_mut(0),
            &mut point.intercepts[0],
            penalty,
            settings,
        )?;
        let (next_objective, next_deviance) =
            enforce_descent(&previous, point, current_objective, &objective);
        let converged = deviance_converged(deviance, next_deviance, settings.outer_tolerance);
        current_objective = next_objective;
        deviance = next_deviance;
        if converged {
            return Ok(());
        }
    }
    Err(SolverError::SolverNonConvergence {
        penalty,
        iterations: settings.max_outer_iterations,
    })
}

fn fit_multinomial(
    x: ArrayView2<f64>,
    labels: ArrayView1<usize>,
    indicators: ArrayView2<f64>,
    point: &mut PathPoint,
    penalty: f64,
    settings: &SolverSettings,
) -> Result<(), SolverError> {
    let objective =
        |candidate: &PathPoint| multinomial_objective(x, labels, candidate, penalty, settings);
    let (mut current_objective, mut deviance) = objective(&*point);

    for _ in 0..settings.max_outer_iterations {
        let start_deviance = deviance;
        for class in 0..point.intercepts.len() {
            let eta = point.linear_predictors(x);
            let probs = softmax_rows(eta.view());
            let (weights, z) = multinomial_working_vectors(
                indicators.column(class),
                eta.column(class),
                probs.column(class),
            );
            let previous = point.clone();
            coordinate_descent(
                x,
                z.view(),
                weights.view(),
                point.beta.row_mut(class),
                &mut point.intercepts[class],
                penalty,
                settings,
            )?;
            (current_objective, deviance) =
                enforce_descent(&previous, point, current_objective, &objective);
        }
        // Softmax is invariant to a common intercept shift; keep them centered.
        let center = point.intercepts.mean().unwrap_or(0.0);
        point.intercepts.mapv_inplace(|b| b - center);

        if deviance_converged(start_deviance, deviance, settings.outer_tolerance) {
            return Ok(());
        }
    }
    Err(SolverError::SolverNonConvergence {
        penalty,
        iterations: settings.max_outer_iterations,
    })
}

/// The smallest penalty at which every coefficient is zero.
fn largest_useful_penalty(x: ArrayView2<f64>, target: &Target, settings: &SolverSettings) -> f64 {
    let n = x.nrows().max(1) as f64;
    let residuals: Array2<f64> = match target {
        Target::Response(y) => {
            let mean = y.mean().unwrap_or(0.0);
            y.mapv(|v| v - mean).insert_axis(Axis(1))
        }
        Target::Classes { indicators, .. } => {
            let means = indicators
                .mean_axis(Axis(0))
                .unwrap_or_else(|| Array1::zeros(indicators.ncols()));
            indicators - &means
        }
    };
    let gradients = x.t().dot(&residuals) / n;
    let largest = gradients.iter().fold(0.0f64, |acc, &g| {
        acc.max(if settings.non_negative { g } else { g.abs() })
    });
    let largest = if largest > 0.0 {
        largest
    } else {
        gradients.iter().fold(0.0f64, |acc, &g| acc.max(g.abs())).max(1.0)
    };
    largest / settings.mixture.max(1e-3)
}

/// Held-out error of one path point under `metric`.
fn held_out_error(
    family: Family,
    metric: CvMetric,
    x: ArrayView2<f64>,
    target: &Target,
    point: &PathPoint,
) -> f64 {
    let eta = point.linear_predictors(x);
    match (target, family, metric) {
        (Target::Response(y), Family::Gaussian, _) => gaussian_loss(y.view(), eta.column(0)),
        (Target::Response(y), _, CvMetric::Deviance) => {
            binomial_deviance(y.view(), eta.column(0).mapv(sigmoid).view())
        }
        (Target::Response(y), _, CvMetric::Misclassification) => {
            let wrong = Zip::from(y)
                .and(eta.column(0))
                .fold(0usize, |acc, &yi, &e| {
                    acc + usize::from((e > 0.0) != (yi > 0.5))
                });
            wrong as f64 / y.len().max(1) as f64
        }
        (Target::Classes { labels, .. }, _, CvMetric::Deviance) => {
            multinomial_deviance(labels.view(), softmax_rows(eta.view()).view())
        }
        (Target::Classes { labels, .. }, _, CvMetric::Misclassification) => {
            let wrong = labels
                .iter()
                .zip(eta.axis_iter(Axis(0)))
                .filter(|(label, row)| argmax(*row) != **label)
                .count();
            wrong as f64 / labels.len().max(1) as f64
        }
    }
}

fn argmax(row: ArrayView1<f64>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (index, &value)| {
            if value > best.1 { (index, value) } else { best }
        })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn regression_columns(names: &[&str]) -> (Vec<StackedColumn>, Vec<String>) {
        let columns = names
            .iter()
            .enumerate()
            .map(|(candidate, name)| StackedColumn {
                candidate,
                level: None,
                label: name.to_string(),
            })
            .collect();
        (columns, names.iter().map(|n| n.to_string()).collect())
    }

    fn config_with(penalties: Vec<f64>) -> BlendConfig {
        BlendConfig {
            penalty: PenaltyGrid::Explicit { values: penalties },
            cv_folds: 3,
            tolerance: 1e-14,
            ..BlendConfig::default()
        }
    }

    fn coefficient(blend: &BlendModel, column: &str) -> f64 {
        blend
            .terms
            .iter()
            .find(|term| term.column == column)
            .map(|term| term.coefficient)
            .unwrap()
    }

    /// Two informative columns, one constant column; `y = 1 + 2 a - b + 0.5 c`.
    fn linear_stack(n: usize) -> (Array2<f64>, Outcome) {
        let x = Array2::from_shape_fn((n, 3), |(i, j)| {
            let t = i as f64 / n as f64;
            match j {
                0 => t,
                1 => (7.0 * t).sin(),
                _ => 4.0,
            }
        });
        let y = x
            .axis_iter(Axis(0))
            .map(|row| 1.0 + 2.0 * row[0] - row[1] + 0.5 * row[2])
            .collect();
        (x, Outcome::Numeric(y))
    }

    #[test]
    fn soft_threshold_shrinks_towards_zero() {
        assert_eq!(soft_threshold(3.0, 1.0), 2.0);
        assert_eq!(soft_threshold(-3.0, 1.0), -2.0);
        assert_eq!(soft_threshold(0.5, 1.0), 0.0);
    }

    #[test]
    fn unconstrained_blend_recovers_exact_linear_weights() {
        let pool = WorkerPool::new(Some(2)).unwrap();
        let (x, outcome) = linear_stack(60);
        let (columns, names) = regression_columns(&["a", "b", "flat"]);
        let config = BlendConfig {
            non_negative: false,
            ..config_with(vec![0.0])
        };
        let blend = BlendingSolver::new(&config, &pool)
            .fit(x.view(), &outcome, &columns, &names)
            .unwrap();

        assert_abs_diff_eq!(coefficient(&blend, "a"), 2.0, epsilon = 1e-5);
        assert_abs_diff_eq!(coefficient(&blend, "b"), -1.0, epsilon = 1e-5);
        assert_eq!(coefficient(&blend, "flat"), 0.0);
        // The constant column's contribution folds into the intercept.
        assert_abs_diff_eq!(blend.intercepts[0], 3.0, epsilon = 1e-5);
    }

    #[test]
    fn non_negative_blend_never_reports_negative_weights() {
        let pool = WorkerPool::new(Some(2)).unwrap();
        let (x, outcome) = linear_stack(60);
        let (columns, names) = regression_columns(&["a", "b", "flat"]);
        let blend = BlendingSolver::new(&config_with(vec![0.0, 1e-4, 1e-2]), &pool)
            .fit(x.view(), &outcome, &columns, &names)
            .unwrap();

        assert!(blend.terms.iter().all(|term| term.coefficient >= 0.0));
        assert_eq!(coefficient(&blend, "b"), 0.0);
        assert!(coefficient(&blend, "a") > 0.0);
        assert_eq!(blend.members(), vec!["a".to_string()]);
    }

    #[test]
    fn path_is_reported_weakest_penalty_first() {
        let pool = WorkerPool::new(Some(2)).unwrap();
        let (x, outcome) = linear_stack(40);
        let (columns, names) = regression_columns(&["a", "b", "flat"]);
        let blend = BlendingSolver::new(&config_with(vec![1e-2, 1e-4, 1e-3, 1e-3]), &pool)
            .fit(x.view(), &outcome, &columns, &names)
            .unwrap();
        let penalties: Vec<f64> = blend.path.iter().map(|r| r.penalty).collect();
        assert_eq!(penalties, vec![1e-4, 1e-3, 1e-2]);
        assert!(blend.selected().is_some());
    }

    #[test]
    fn overwhelming_penalty_yields_an_empty_blend() {
        let pool = WorkerPool::new(Some(1)).unwrap();
        let (x, outcome) = linear_stack(30);
        let (columns, names) = regression_columns(&["a", "b", "flat"]);
        let blend = BlendingSolver::new(&config_with(vec![100.0]), &pool)
            .fit(x.view(), &outcome, &columns, &names)
            .unwrap();
        assert!(blend.is_empty());
        assert!(blend.members().is_empty());
    }

    #[test]
    fn automatic_grid_starts_where_everything_is_zero() {
        let pool = WorkerPool::new(Some(2)).unwrap();
        let (x, outcome) = linear_stack(50);
        let (columns, names) = regression_columns(&["a", "b", "flat"]);
        let config = BlendConfig {
            penalty: PenaltyGrid::Auto {
                count: 8,
                min_ratio: 1e-3,
            },
            ..config_with(Vec::new())
        };
        let blend = BlendingSolver::new(&config, &pool)
            .fit(x.view(), &outcome, &columns, &names)
            .unwrap();
        assert_eq!(blend.path.len(), 8);
        let strongest = blend.path.last().unwrap();
        assert_eq!(strongest.num_nonzero, 0);
        assert!(blend.path[0].num_nonzero > 0);
    }

    #[test]
    fn invalid_configurations_are_rejected() {
        let pool = WorkerPool::new(Some(1)).unwrap();
        let (x, outcome) = linear_stack(20);
        let (columns, names) = regression_columns(&["a", "b", "flat"]);
        let attempts = vec![
            config_with(Vec::new()),
            config_with(vec![-1.0]),
            config_with(vec![f64::NAN]),
            BlendConfig {
                mixture: 1.5,
                ..config_with(vec![0.1])
            },
            BlendConfig {
                cv_folds: 21,
                ..config_with(vec![0.1])
            },
            BlendConfig {
                cv_folds: 1,
                ..config_with(vec![0.1])
            },
            BlendConfig {
                metric: CvMetric::Misclassification,
                ..config_with(vec![0.1])
            },
        ];
        for config in attempts {
            let result = BlendingSolver::new(&config, &pool).fit(x.view(), &outcome, &columns, &names);
            assert!(
                matches!(result, Err(SolverError::InvalidConfig(_))),
                "config {config:?} was accepted"
            );
        }
    }

    #[test]
    fn empty_stack_has_no_columns() {
        let pool = WorkerPool::new(Some(1)).unwrap();
        let outcome = Outcome::Numeric(Array1::zeros(10));
        let result = BlendingSolver::new(&BlendConfig::default(), &pool).fit(
            Array2::<f64>::zeros((10, 0)).view(),
            &outcome,
            &[],
            &[],
        );
        assert!(matches!(result, Err(SolverError::NoColumns)));
    }

    #[test]
    fn iteration_budget_is_enforced() {
        let pool = WorkerPool::new(Some(1)).unwrap();
        let (x, outcome) = linear_stack(40);
        let (columns, names) = regression_columns(&["a", "b", "flat"]);
        let config = BlendConfig {
            non_negative: false,
            max_iterations: 1,
            ..config_with(vec![0.0])
        };
        let result = BlendingSolver::new(&config, &pool).fit(x.view(), &outcome, &columns, &names);
        assert!(matches!(
            result,
            Err(SolverError::SolverNonConvergence { iterations: 1, .. })
        ));
    }

    /// Class-probability columns for a `good` and a `noise` candidate.
    fn class_stack(n: usize, n_levels: usize, seed: u64) -> (Array2<f64>, Outcome, Vec<StackedColumn>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let levels: Vec<String> = (0..n_levels).map(|l| format!("c{l}")).collect();
        let mut x = Array2::zeros((n, 2 * n_levels));
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let label = rng.gen_range(0..n_levels);
            labels.push(levels[label].clone());
            for candidate in 0..2 {
                let mut row: Vec<f64> = (0..n_levels).map(|_| rng.gen_range(0.05..1.0)).collect();
                if candidate == 0 {
                    row[label] += 0.6;
                }
                let total: f64 = row.iter().sum();
                for (l, value) in row.iter().enumerate() {
                    x[[i, candidate * n_levels + l]] = value / total;
                }
            }
        }
        let columns = (0..2)
            .flat_map(|candidate| {
                let levels = levels.clone();
                (0..n_levels).map(move |l| StackedColumn {
                    candidate,
                    level: Some(l),
                    label: format!("{}:{}", ["good", "noise"][candidate], levels[l]),
                })
            })
            .collect();
        (x, Outcome::from_labels(&labels).unwrap(), columns)
    }

    #[test]
    fn binomial_blend_uses_event_columns_and_finds_the_signal() {
        let pool = WorkerPool::new(Some(2)).unwrap();
        let (x, outcome, columns) = class_stack(200, 2, 11);
        let names = vec!["good".to_string(), "noise".to_string()];
        let blend = BlendingSolver::new(&BlendConfig::default(), &pool)
            .fit(x.view(), &outcome, &columns, &names)
            .unwrap();

        assert_eq!(blend.family, Family::Binomial);
        assert_eq!(blend.intercepts.len(), 1);
        let labels: Vec<&str> = blend.terms.iter().map(|t| t.column.as_str()).collect();
        assert_eq!(labels, vec!["good:c1", "noise:c1"]);
        assert!(coefficient(&blend, "good:c1") > 0.0);
    }

    #[test]
    fn multinomial_blend_has_one_predictor_per_class() {
        let pool = WorkerPool::new(Some(2)).unwrap();
        let (x, outcome, columns) = class_stack(150, 3, 5);
        let names = vec!["good".to_string(), "noise".to_string()];
        let config = BlendConfig {
            metric: CvMetric::Misclassification,
            ..BlendConfig::default()
        };
        let blend = BlendingSolver::new(&config, &pool)
            .fit(x.view(), &outcome, &columns, &names)
            .unwrap();

        assert_eq!(blend.family, Family::Multinomial);
        assert_eq!(blend.intercepts.len(), 3);
        assert_eq!(blend.terms.len(), 3 * 6);
        assert!(blend.terms.iter().all(|t| t.class.is_some()));
        assert!(blend.members().contains(&"good".to_string()));
    }

    #[test]
    fn irls_budget_is_enforced_for_class_outcomes() {
        let pool = WorkerPool::new(Some(1)).unwrap();
        let names = vec!["good".to_string(), "noise".to_string()];
        let config = BlendConfig {
            max_outer_iterations: 1,
            ..config_with(vec![1e-3])
        };
        for n_levels in [2, 3] {
            let (x, outcome, columns) = class_stack(120, n_levels, 3);
            let result =
                BlendingSolver::new(&config, &pool).fit(x.view(), &outcome, &columns, &names);
            assert!(
                matches!(
                    result,
                    Err(SolverError::SolverNonConvergence { iterations: 1, .. })
                ),
                "{n_levels} levels converged in one IRLS step"
            );
        }
    }
}
