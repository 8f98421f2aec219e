use ndarray_rand::rand::SeedableRng;
use rand_isaac::Isaac64Rng;

use voltammetry::calibration::ModelMetrics;
use voltammetry::config::ModelConfig;
use voltammetry::predict::predict_features;
use voltammetry::synthetic::SyntheticCv;
use voltammetry::{
    Analyzer, CalibrationPoint, CalibrationSet, Config, Error, ModelBuilder, ModelRegistry,
    PlsModel, Predictor, Result,
};

const CONCENTRATIONS: [f64; 5] = [0.5, 1.0, 2.0, 5.0, 10.0];

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn calibration_points<R: ndarray_rand::rand::Rng>(
    analyzer: &Analyzer,
    concentrations: &[f64],
    rng: &mut R,
) -> Result<Vec<CalibrationPoint>> {
    generated_points(&SyntheticCv::default(), analyzer, concentrations, rng)
}

fn generated_points<R: ndarray_rand::rand::Rng>(
    generator: &SyntheticCv,
    analyzer: &Analyzer,
    concentrations: &[f64],
    rng: &mut R,
) -> Result<Vec<CalibrationPoint>> {
    let mut set = CalibrationSet::from_config(&ModelConfig::default());
    for &concentration in concentrations {
        let trace = generator.generate(concentration, rng)?;
        set.add_trace(analyzer, &trace, concentration)?;
    }
    Ok(set.into_points())
}

fn rmse(residuals: &[f64]) -> f64 {
    (residuals.iter().map(|r| r * r).sum::<f64>() / residuals.len() as f64).sqrt()
}

#[test]
fn synthetic_series_calibrates_and_predicts_a_held_out_concentration() -> Result<()> {
    init_logging();
    let seed = 40;
    let mut rng = Isaac64Rng::seed_from_u64(seed);
    let config = Config::default();
    let analyzer = Analyzer::new(&config);

    let points = calibration_points(&analyzer, &CONCENTRATIONS, &mut rng)?;
    assert!(points.iter().all(|point| point.quality_score >= 30.0));

    let model = ModelBuilder::new(config.model.clone())
        .with_points(points)
        .build()?;
    let ModelMetrics { r2, n_samples, .. } = *model.metrics();
    assert!(r2 > 0.95, "r² = {r2}");
    assert_eq!(n_samples, 5);
    assert!(model.optimal_components() >= 1);
    assert!(model.model_id().starts_with("pls_"));

    let held_out = SyntheticCv::default().generate(3.0, &mut rng)?;
    let prediction = Predictor::new(analyzer).predict(&held_out, &model)?;

    let relative_error = (prediction.predicted_concentration - 3.0).abs() / 3.0;
    assert!(
        relative_error < 0.2,
        "predicted {} for 3 µM",
        prediction.predicted_concentration
    );
    let (lower, upper) = prediction.confidence_interval;
    assert!((lower..=upper).contains(&prediction.predicted_concentration));
    assert!((0.0..=100.0).contains(&prediction.prediction_confidence));
    assert_eq!(prediction.model_id, model.model_id());
    Ok(())
}

#[test]
fn held_out_predictions_stay_within_tolerance_across_seeds() -> Result<()> {
    init_logging();
    let generator = SyntheticCv {
        noise_std: 3e-3,
        ..SyntheticCv::default()
    };
    let analyzer = Analyzer::default();

    for seed in 0..8 {
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let points = generated_points(&generator, &analyzer, &CONCENTRATIONS, &mut rng)?;
        let model = voltammetry::build(&points, None, &ModelConfig::default())?;
        assert!(model.metrics().r2 > 0.95, "seed {seed}: r² = {}", model.metrics().r2);
        assert!(model
            .feature_names()
            .iter()
            .all(|name| !matches!(name.as_str(), "peak_separation" | "peak_symmetry")));

        let held_out = generator.generate(3.0, &mut rng)?;
        let predicted = Predictor::new(analyzer.clone())
            .predict(&held_out, &model)?
            .predicted_concentration;
        assert!(
            (predicted - 3.0).abs() / 3.0 < 0.2,
            "seed {seed}: predicted {predicted} for 3 µM"
        );
    }
    Ok(())
}

#[test]
fn model_needs_the_configured_number_of_points() -> Result<()> {
    init_logging();
    let mut rng = Isaac64Rng::seed_from_u64(40);
    let analyzer = Analyzer::default();
    let config = ModelConfig::default();
    let points = calibration_points(&analyzer, &CONCENTRATIONS, &mut rng)?;
    assert_eq!(points.len(), config.min_calibration_points);

    let too_few = voltammetry::build(&points[..points.len() - 1], None, &config);
    assert!(matches!(too_few, Err(Error::InsufficientData(_))));

    let enough = voltammetry::build(&points, None, &config)?;
    assert_eq!(enough.metrics().n_samples, config.min_calibration_points);
    Ok(())
}

#[test]
fn predictions_on_calibration_points_reproduce_the_reported_rmse() -> Result<()> {
    init_logging();
    let mut rng = Isaac64Rng::seed_from_u64(40);
    let analyzer = Analyzer::default();
    let points = calibration_points(&analyzer, &[0.5, 1.0, 2.0, 4.0, 6.0, 8.0, 10.0], &mut rng)?;
    let model = voltammetry::build(&points, None, &ModelConfig::default())?;

    let residuals = model
        .calibration_points()
        .iter()
        .map(|point| {
            let prediction = predict_features(&point.features, point.quality_score, &model)?;
            Ok(prediction.predicted_concentration - point.concentration)
        })
        .collect::<Result<Vec<_>>>()?;

    approx::assert_relative_eq!(rmse(&residuals), model.metrics().rmse, epsilon = 1e-9);
    Ok(())
}

#[test]
fn feature_subset_restricts_the_model_schema() -> Result<()> {
    let mut rng = Isaac64Rng::seed_from_u64(40);
    let analyzer = Analyzer::default();
    let points = calibration_points(&analyzer, &CONCENTRATIONS, &mut rng)?;

    let model = ModelBuilder::new(ModelConfig::default())
        .with_feature_subset(["oxidation_height", "reduction_height", "peak_separation"])
        .with_points(points)
        .build()?;

    // Peak separation is fixed by the redox couple, so it carries no variance
    assert_eq!(model.feature_names(), ["oxidation_height", "reduction_height"]);
    assert_eq!(model.feature_importance().len(), 2);
    Ok(())
}

#[test]
fn model_survives_a_toml_round_trip_and_registry_lookup() -> Result<()> {
    let mut rng = Isaac64Rng::seed_from_u64(40);
    let analyzer = Analyzer::default();
    let points = calibration_points(&analyzer, &CONCENTRATIONS, &mut rng)?;
    let model = ModelBuilder::new(ModelConfig::default())
        .with_points(points)
        .with_model_id("electrode-7")
        .build()?;

    let text = toml::to_string(&model).expect("model serialises to toml");
    let restored: PlsModel = toml::from_str(&text)?;
    assert_eq!(restored, model);

    let mut registry = ModelRegistry::new();
    registry.insert(restored);

    let trace = SyntheticCv::default().generate(3.0, &mut rng)?;
    let predictor = Predictor::new(analyzer);
    let from_registry = predictor.predict_with(&trace, &registry, None)?;
    let direct = predictor.predict(&trace, &model)?;
    approx::assert_relative_eq!(
        from_registry.predicted_concentration,
        direct.predicted_concentration
    );

    let empty = ModelRegistry::new();
    assert!(matches!(
        predictor.predict_with(&trace, &empty, None),
        Err(Error::ModelNotTrained)
    ));
    assert!(matches!(
        predictor.predict_with(&trace, &registry, Some("electrode-8")),
        Err(Error::ModelNotFound(_))
    ));
    Ok(())
}

#[test]
fn batch_prediction_reports_each_trace() -> Result<()> {
    let mut rng = Isaac64Rng::seed_from_u64(40);
    let analyzer = Analyzer::default();
    let points = calibration_points(&analyzer, &CONCENTRATIONS, &mut rng)?;
    let model = voltammetry::build(&points, None, &ModelConfig::default())?;

    let good = SyntheticCv::default().generate(2.0, &mut rng)?;
    let short = voltammetry::Trace::new(vec![0.0; 5], vec![0.0; 5], Some("truncated".into()))?;
    let report = Predictor::new(analyzer).predict_batch([&good, &short], &model);

    assert_eq!(report.success_count(), 1);
    assert_eq!(report.failure_count(), 1);
    assert_eq!(report.items[1].label.as_deref(), Some("truncated"));
    Ok(())
}
