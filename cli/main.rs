#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use itertools::Itertools;
use ndarray::Axis;
use std::error::Error;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::process;
use std::sync::Arc;

use stacks::blend::BlendModel;
use stacks::candidate::{Candidate, FittedModel, ModelError, ModelSpec};
use stacks::config::StackConfig;
use stacks::data::{
    HeldOutTable, Task, TrainingData, load_feature_data, load_held_out_table, load_training_data,
};
use stacks::models::BuiltinSpec;
use stacks::parallel::WorkerPool;
use stacks::partition::ResamplePartition;
use stacks::predict::{PredictMode, Predictions};
use stacks::refit::refit;
use stacks::registry::Registry;
use stacks::resample::fit_resamples;

#[derive(Args)]
pub struct BlendArgs {
    /// Path to a TSV of held-out predictions with outcome and fold columns
    pub held_out: String,

    /// Name of the outcome column
    #[arg(long)]
    pub outcome: String,

    /// Name of the column holding each row's fold label
    #[arg(long)]
    pub fold: String,

    #[arg(long, value_enum, default_value_t = Task::Regression)]
    pub task: Task,

    /// Optional TOML configuration file
    #[arg(long)]
    pub config: Option<String>,

    /// Where to write the blend model
    #[arg(long, default_value = "blend.toml")]
    pub output: String,

    /// Worker threads (defaults to the configuration, then one per CPU)
    #[arg(long)]
    pub threads: Option<usize>,
}

#[derive(Args)]
pub struct RunArgs {
    /// Path to training TSV with the outcome and numeric feature columns
    pub training_data: String,

    /// Name of the outcome column
    #[arg(long)]
    pub outcome: String,

    #[arg(long, value_enum, default_value_t = Task::Regression)]
    pub task: Task,

    /// Candidate models, e.g. ridge:0.1,knn:5,column:score
    #[arg(long, value_delimiter = ',')]
    pub candidates: Vec<BuiltinSpec>,

    /// Number of resampling folds
    #[arg(long)]
    pub folds: Option<usize>,

    /// Seed for the resampling partition
    #[arg(long)]
    pub seed: Option<u64>,

    /// Optional TOML configuration file
    #[arg(long)]
    pub config: Option<String>,

    /// TSV of new feature rows to predict after refitting
    #[arg(long)]
    pub predict: Option<String>,

    #[arg(long, value_enum, default_value_t = PredictMode::Ensemble)]
    pub mode: PredictMode,

    /// Where to write the blend model
    #[arg(long, default_value = "blend.toml")]
    pub output: String,

    /// Where to write predictions when --predict is given
    #[arg(long, default_value = "predictions.tsv")]
    pub predictions_output: String,

    /// Worker threads (defaults to the configuration, then one per CPU)
    #[arg(long)]
    pub threads: Option<usize>,
}

/// Candidates read from a held-out table carry predictions but no fitting
/// procedure.
#[derive(Debug)]
struct HeldOutOnly;

impl ModelSpec for HeldOutOnly {
    fn fit(&self, data: &TrainingData) -> Result<Box<dyn FittedModel>, ModelError> {
        Err(ModelError::Fit(format!(
            "candidate was read from a held-out table and cannot be refit on {} rows",
            data.n_rows()
        )))
    }
}

fn load_config(path: Option<&str>) -> Result<StackConfig, Box<dyn Error>> {
    match path {
        Some(path) => {
            println!("Loading configuration from: {path}");
            Ok(StackConfig::load(path)?)
        }
        None => Ok(StackConfig::default()),
    }
}

/// Groups held-out table columns into candidates. Classification columns are
/// named `candidate:level` and need one column per outcome level.
fn held_out_candidates(
    table: &HeldOutTable,
    partition: &ResamplePartition,
) -> Result<Vec<Candidate>, Box<dyn Error>> {
    let levels = table.outcome.levels();
    let groups: Vec<(String, Vec<usize>)> = if levels.is_empty() {
        table
            .prediction_names
            .iter()
            .enumerate()
            .map(|(index, name)| (name.clone(), vec![index]))
            .collect()
    } else {
        let mut names = Vec::with_capacity(table.prediction_names.len());
        for column in &table.prediction_names {
            match column.rsplit_once(':') {
                Some((candidate, _)) => names.push(candidate.to_string()),
                None => {
                    return Err(format!(
                        "column '{column}' is not named candidate:level for a class outcome"
                    )
                    .into());
                }
            }
        }
        names
            .into_iter()
            .unique()
            .map(|candidate| {
                let columns = levels
                    .iter()
                    .map(|level| {
                        let wanted = format!("{candidate}:{level}");
                        table
                            .prediction_names
                            .iter()
                            .position(|name| *name == wanted)
                            .ok_or_else(|| format!("the held-out table has no column '{wanted}'"))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((candidate, columns))
            })
            .collect::<Result<Vec<_>, String>>()?
    };

    Ok(groups
        .into_iter()
        .map(|(name, columns)| {
            let block = table.predictions.select(Axis(1), &columns);
            let folds = partition
                .folds()
                .iter()
                .map(|fold| block.select(Axis(0), &fold.held_out))
                .collect();
            Candidate::new(name, Arc::new(HeldOutOnly), partition.id(), folds)
        })
        .collect())
}

fn print_blend(blend: &BlendModel) {
    println!("{blend}");
    println!("{:<28} {:<12} {:>12}", "column", "class", "coefficient");
    for term in blend.coefficient_table() {
        println!(
            "{:<28} {:<12} {:>12.6}",
            term.column,
            term.class.as_deref().unwrap_or("-"),
            term.coefficient
        );
    }
}

pub fn blend(args: BlendArgs) -> Result<(), Box<dyn Error>> {
    let config = load_config(args.config.as_deref())?;
    let pool = WorkerPool::new(args.threads.or(config.threads))?;

    println!("Loading held-out predictions from: {}", args.held_out);
    let table = load_held_out_table(&args.held_out, &args.outcome, &args.fold, args.task)?;
    let partition = ResamplePartition::from_fold_labels(&table.fold_labels)?;
    println!(
        "Loaded {} rows over {} folds with {} prediction columns",
        table.fold_labels.len(),
        partition.num_folds(),
        table.prediction_names.len()
    );

    let mut registry = Registry::new(partition.clone(), &table.outcome)?;
    for candidate in held_out_candidates(&table, &partition)? {
        registry.register(candidate)?;
    }

    let blend = registry.blend(&config.blend, &pool)?;
    print_blend(&blend);
    blend.save(&args.output)?;
    println!("Blend model saved to: {}", args.output);
    Ok(())
}

pub fn run(args: RunArgs) -> Result<(), Box<dyn Error>> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(folds) = args.folds {
        config.resample.folds = folds;
    }
    if let Some(seed) = args.seed {
        config.resample.seed = seed;
    }
    if !args.candidates.is_empty() {
        config.candidates = args.candidates.clone();
    }
    if config.candidates.is_empty() {
        return Err("no candidate models given; pass --candidates or add [[candidates]] to the configuration".into());
    }
    let pool = WorkerPool::new(args.threads.or(config.threads))?;

    println!("Loading training data from: {}", args.training_data);
    let data = load_training_data(&args.training_data, &args.outcome, args.task)?;
    println!(
        "Loaded {} samples with {} features",
        data.n_rows(),
        data.feature_names.len()
    );

    let partition = ResamplePartition::v_fold(
        data.n_rows(),
        config.resample.folds,
        config.resample.seed,
    )?;
    println!(
        "Resampling {} candidates over {} folds (partition {})",
        config.candidates.len(),
        partition.num_folds(),
        partition.id()
    );

    let mut registry = Registry::new(partition.clone(), &data.outcome)?;
    for spec in &config.candidates {
        println!("  fitting {spec}");
        let candidate = fit_resamples(spec.name(), Arc::new(spec.clone()), &data, &partition, &pool)?;
        registry.register(candidate)?;
    }

    let blend = registry.blend(&config.blend, &pool)?;
    print_blend(&blend);
    blend.save(&args.output)?;
    println!("Blend model saved to: {}", args.output);

    let ensemble = refit(registry.candidates(), &blend, &data, &config.refit, &pool)?;
    for failure in ensemble.dropped() {
        println!("Dropped member: {failure}");
    }
    println!(
        "Refit {} member(s): {}",
        ensemble.members().len(),
        ensemble.members().iter().map(|m| m.name()).join(", ")
    );

    if let Some(path) = &args.predict {
        println!("Loading new data from: {path}");
        let new_data = load_feature_data(path, ensemble.feature_names())?;
        let predictions = ensemble.predict(new_data.features.view(), args.mode)?;
        save_predictions(&new_data.sample_ids, &predictions, &args.predictions_output)?;
        println!("Predictions saved to: {}", args.predictions_output);
    }
    Ok(())
}

fn save_predictions(
    sample_ids: &[String],
    predictions: &Predictions,
    output_path: &str,
) -> Result<(), std::io::Error> {
    let mut file = BufWriter::new(File::create(output_path)?);
    let classes = predictions.classes();

    let mut header = vec!["sample_id".to_string()];
    header.extend(predictions.column_names());
    if classes.is_some() {
        header.push("class".to_string());
    }
    writeln!(file, "{}", header.join("\t"))?;

    let matrix = predictions.to_matrix();
    for (i, (id, row)) in sample_ids.iter().zip(matrix.axis_iter(Axis(0))).enumerate() {
        let values = row.iter().map(|v| format!("{v:.6}")).join("\t");
        match &classes {
            Some(labels) => writeln!(file, "{id}\t{values}\t{}", labels[i])?,
            None => writeln!(file, "{id}\t{values}")?,
        }
    }
    file.flush()
}

#[derive(Parser)]
#[command(
    name = "stacks",
    version,
    about = "Regularized model stacking",
    long_about = "Blend held-out predictions from candidate models with a sparse, non-negative \
                 elastic net, refit the selected members and predict new data."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Blend a precomputed table of held-out predictions
    #[command(about = "Blend precomputed held-out predictions (outputs: blend.toml)")]
    Blend(BlendArgs),
    /// Resample built-in candidates, blend, refit and optionally predict
    #[command(about = "Build a full stack from training data (outputs: blend.toml, predictions.tsv)")]
    Run(RunArgs),
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Blend(args)) => blend(args),
        Some(Commands::Run(args)) => run(args),
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
