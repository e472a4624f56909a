// Class-outcome stacks: probability blends over knn and ridge candidates.

use approx::assert_abs_diff_eq;
use ndarray::{Array2, array};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use stacks::blend::BlendConfig;
use stacks::candidate::ModelSpec;
use stacks::data::{Outcome, TrainingData};
use stacks::family::Family;
use stacks::models::BuiltinSpec;
use stacks::models::knn::KnnSpec;
use stacks::models::ridge::RidgeSpec;
use stacks::parallel::WorkerPool;
use stacks::partition::ResamplePartition;
use stacks::predict::{PredictMode, Predictions};
use stacks::refit::{RefitConfig, refit};
use stacks::registry::Registry;
use stacks::resample::{fit_resample_grid, fit_resamples};
use std::sync::Arc;

/// Overlapping Gaussian clusters, one per label, interleaved row by row.
fn clustered(centers: &[(&str, [f64; 2])], per_class: usize, seed: u64) -> TrainingData {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let rows = centers.len() * per_class;
    let mut features = Array2::zeros((rows, 2));
    let mut labels = Vec::with_capacity(rows);
    for i in 0..per_class {
        for (k, (label, center)) in centers.iter().enumerate() {
            let row = i * centers.len() + k;
            features[[row, 0]] = center[0] + normal.sample(&mut rng);
            features[[row, 1]] = center[1] + normal.sample(&mut rng);
            labels.push(*label);
        }
    }
    TrainingData::new(
        features,
        vec!["x".into(), "y".into()],
        Outcome::from_labels(&labels).unwrap(),
    )
    .unwrap()
}

fn assert_rows_are_distributions(values: &Array2<f64>) {
    for row in values.rows() {
        assert!(row.iter().all(|&p| (0.0..=1.0).contains(&p)));
        assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-9);
    }
}

#[test]
fn three_class_stack_predicts_probabilities_and_classes() {
    let centers = [("a", [0.0, 0.0]), ("b", [2.5, 0.0]), ("c", [0.0, 2.5])];
    let data = clustered(&centers, 60, 13);
    let pool = WorkerPool::new(Some(2)).unwrap();
    let partition = ResamplePartition::v_fold(data.n_rows(), 5, 21).unwrap();

    let mut registry = Registry::new(partition.clone(), &data.outcome).unwrap();
    let knn: Arc<dyn ModelSpec> = Arc::new(KnnSpec { neighbors: 15 });
    let ridge: Arc<dyn ModelSpec> = Arc::new(RidgeSpec { penalty: 1.0 });
    for (name, spec) in [("knn", knn), ("ridge", ridge)] {
        let candidate = fit_resamples(name, spec, &data, &partition, &pool).unwrap();
        assert_eq!(candidate.width(), 3);
        registry.register(candidate).unwrap();
    }
    assert_eq!(registry.columns().len(), 6);

    let blend = registry.blend(&BlendConfig::default(), &pool).unwrap();
    assert_eq!(blend.family, Family::Multinomial);
    assert_eq!(blend.levels, vec!["a", "b", "c"]);
    assert_eq!(blend.intercepts.len(), 3);
    assert!(!blend.is_empty());
    assert!(blend.terms.iter().all(|term| term.class.is_some()));

    let ensemble = refit(registry.candidates(), &blend, &data, &RefitConfig::default(), &pool).unwrap();
    assert!(!ensemble.members().is_empty());

    let at_centers = array![[0.0, 0.0], [2.5, 0.0], [0.0, 2.5]];
    let predictions = ensemble
        .predict(at_centers.view(), PredictMode::Ensemble)
        .unwrap();
    assert_eq!(
        predictions.column_names(),
        vec!["prediction:a", "prediction:b", "prediction:c"]
    );
    assert_rows_are_distributions(&predictions.to_matrix());
    assert_eq!(
        predictions.classes(),
        Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
    );

    match ensemble.predict(at_centers.view(), PredictMode::Members).unwrap() {
        Predictions::Members { blocks, levels } => {
            assert_eq!(levels, vec!["a", "b", "c"]);
            assert_eq!(blocks.len(), ensemble.members().len());
            for (_, block) in &blocks {
                assert_eq!(block.dim(), (3, 3));
            }
        }
        Predictions::Ensemble { .. } => panic!("expected member predictions"),
    }
}

#[test]
fn two_class_stack_blends_event_probabilities() {
    let centers = [("no", [0.0, 0.0]), ("yes", [2.0, 2.0])];
    let data = clustered(&centers, 80, 4);
    let pool = WorkerPool::new(Some(2)).unwrap();
    let partition = ResamplePartition::v_fold(data.n_rows(), 4, 8).unwrap();

    let specs: Vec<Arc<dyn ModelSpec>> = ["knn:5", "knn:25", "ridge:0.1"]
        .iter()
        .map(|text| Arc::new(text.parse::<BuiltinSpec>().unwrap()) as Arc<dyn ModelSpec>)
        .collect();
    let candidates = fit_resample_grid("model", specs, &data, &partition, &pool).unwrap();
    let names: Vec<&str> = candidates.iter().map(|c| c.name()).collect();
    assert_eq!(names, vec!["model_1", "model_2", "model_3"]);

    let mut registry = Registry::new(partition.clone(), &data.outcome).unwrap();
    for candidate in candidates {
        registry.register(candidate).unwrap();
    }

    let blend = registry.blend(&BlendConfig::default(), &pool).unwrap();
    assert_eq!(blend.family, Family::Binomial);
    assert_eq!(blend.intercepts.len(), 1);
    // Only the event-level column of each candidate enters a two-class blend.
    assert_eq!(blend.terms.len(), 3);
    assert!(!blend.is_empty());
    assert!(blend.terms.iter().all(|term| term.coefficient >= 0.0));

    let ensemble = refit(registry.candidates(), &blend, &data, &RefitConfig::default(), &pool).unwrap();
    let new_rows = array![[-1.0, -1.0], [3.0, 3.0], [1.0, 1.0]];
    let predictions = ensemble
        .predict(new_rows.view(), PredictMode::Ensemble)
        .unwrap();
    let values = predictions.to_matrix();
    assert_eq!(values.dim(), (3, 2));
    assert_rows_are_distributions(&values);
    assert!(values[[0, 0]] > 0.5);
    assert!(values[[1, 1]] > 0.5);
    let classes = predictions.classes().unwrap();
    assert_eq!(&classes[..2], &["no".to_string(), "yes".to_string()]);
}
