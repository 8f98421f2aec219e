//! Calibration points and the PLS model builder.
//!
//! A model is built once from a frozen copy of its calibration points. Features with no variance
//! across the points are dropped, the remaining ones are standardised, and the number of latent
//! components is chosen by cross-validation before the final fit on all points.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use itertools::Itertools;
use log::{debug, info, warn};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::analysis::Analyzer;
use crate::config::{ModelConfig, SearchBudget};
use crate::features::{FeatureVector, FEATURE_NAMES};
use crate::math::{mean, r_squared, std_dev, variance};
use crate::pls::{cross_validate, PlsRegression, Scaler};
use crate::trace::Trace;
use crate::{Error, Result};

/// Milliseconds since the Unix epoch
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
        })
}

/// A feature vector measured at a known concentration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub concentration: f64,
    /// Quality of the trace the features came from, in `[0, 100]`
    pub quality_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub timestamp_ms: u64,
    pub features: FeatureVector,
}

impl CalibrationPoint {
    #[must_use]
    pub fn new(
        concentration: f64,
        features: FeatureVector,
        quality_score: f64,
        source: Option<String>,
    ) -> Self {
        Self {
            concentration,
            quality_score,
            source,
            timestamp_ms: now_ms(),
            features,
        }
    }
}

/// Calibration points accepted so far
///
/// Adding points is a write: callers sharing a set between threads serialise access themselves.
#[derive(Clone, Debug, Default)]
pub struct CalibrationSet {
    min_quality_score: f64,
    points: Vec<CalibrationPoint>,
}

impl CalibrationSet {
    #[must_use]
    pub const fn new(min_quality_score: f64) -> Self {
        Self {
            min_quality_score,
            points: vec![],
        }
    }

    #[must_use]
    pub const fn from_config(config: &ModelConfig) -> Self {
        Self::new(config.min_quality_score)
    }

    /// Accept `point` if its quality reaches the minimum
    ///
    /// # Errors
    /// - [`Error::CalibrationPointRejected`] if the quality score is too low; the point is not kept
    pub fn add(&mut self, point: CalibrationPoint) -> Result<()> {
        if point.quality_score < self.min_quality_score {
            warn!(
                "rejecting calibration point {} at {}: quality {:.1} below {:.1}",
                point.source.as_deref().unwrap_or("<unlabelled>"),
                point.concentration,
                point.quality_score,
                self.min_quality_score
            );
            return Err(Error::CalibrationPointRejected {
                quality: point.quality_score,
                minimum: self.min_quality_score,
            });
        }
        self.points.push(point);
        Ok(())
    }

    /// Analyse `trace` and add it as a calibration point at `concentration`
    ///
    /// # Errors
    /// - any analysis error of the trace
    /// - [`Error::CalibrationPointRejected`] if the trace quality is too low
    pub fn add_trace(
        &mut self,
        analyzer: &Analyzer,
        trace: &Trace,
        concentration: f64,
    ) -> Result<()> {
        let analysis = analyzer.analyze(trace)?;
        let quality = analysis.quality_score();
        let point = CalibrationPoint::new(
            concentration,
            analysis.features,
            quality,
            trace.label().map(str::to_owned),
        );
        self.add(point)
    }

    #[must_use]
    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[must_use]
    pub fn into_points(self) -> Vec<CalibrationPoint> {
        self.points
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub r2: f64,
    pub rmse: f64,
    pub mae: f64,
    pub relative_rmse_percent: f64,
    /// Pooled predictive R² of the cross-validated fit
    pub cv_r2_mean: f64,
    pub cv_r2_std: f64,
    pub n_samples: usize,
    pub n_features: usize,
}

/// A trained calibration model in a flat, storage-agnostic layout
///
/// Nothing here changes after [`ModelBuilder::build`]; a model can be shared between any number of
/// concurrent predictions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlsModel {
    model_id: String,
    created_ms: u64,
    optimal_components: usize,
    intercept: f64,
    feature_names: Vec<String>,
    scaler_mean: Vec<f64>,
    scaler_scale: Vec<f64>,
    /// Coefficients in the standardised feature space
    coefficients: Vec<f64>,
    metrics: ModelMetrics,
    feature_importance: BTreeMap<String, f64>,
    calibration_points: Vec<CalibrationPoint>,
}

impl PlsModel {
    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    #[must_use]
    pub const fn created_ms(&self) -> u64 {
        self.created_ms
    }

    #[must_use]
    pub const fn optimal_components(&self) -> usize {
        self.optimal_components
    }

    #[must_use]
    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    #[must_use]
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    #[must_use]
    pub const fn metrics(&self) -> &ModelMetrics {
        &self.metrics
    }

    #[must_use]
    pub const fn feature_importance(&self) -> &BTreeMap<String, f64> {
        &self.feature_importance
    }

    #[must_use]
    pub fn calibration_points(&self) -> &[CalibrationPoint] {
        &self.calibration_points
    }

    #[must_use]
    pub fn scaler(&self) -> Scaler {
        Scaler {
            mean: self.scaler_mean.clone(),
            scale: self.scaler_scale.clone(),
        }
    }

    /// Features in the order of [`Self::feature_names`], zero for names the vector lacks
    #[must_use]
    pub fn align(&self, features: &FeatureVector) -> Vec<f64> {
        self.feature_names
            .iter()
            .map(|name| features.get_or_default(name))
            .collect()
    }

    /// Predict the concentration of a row already aligned to [`Self::feature_names`]
    ///
    /// # Errors
    /// - [`Error::FeatureMismatch`] if the row, scaler and coefficients disagree in length, or a
    ///   value cannot be scaled
    pub fn predict_row(&self, row: &[f64]) -> Result<f64> {
        let expected = self.feature_names.len();
        for (what, len) in [
            ("row", row.len()),
            ("scaler mean", self.scaler_mean.len()),
            ("scaler scale", self.scaler_scale.len()),
            ("coefficients", self.coefficients.len()),
        ] {
            if len != expected {
                return Err(Error::FeatureMismatch {
                    feature: what.to_owned(),
                    reason: format!("has {len} values, model expects {expected}"),
                });
            }
        }

        let mut prediction = self.intercept;
        for (((name, value), (mu, sigma)), coefficient) in self
            .feature_names
            .iter()
            .zip(row)
            .zip(self.scaler_mean.iter().zip(&self.scaler_scale))
            .zip(&self.coefficients)
        {
            let scaled = (value - mu) / sigma;
            if !scaled.is_finite() {
                return Err(Error::FeatureMismatch {
                    feature: name.clone(),
                    reason: format!("value {value} does not scale to a finite number"),
                });
            }
            prediction += coefficient * scaled;
        }
        Ok(prediction)
    }

    /// Predict the concentration described by `features`
    ///
    /// # Errors
    /// See [`Self::predict_row`].
    pub fn predict_features(&self, features: &FeatureVector) -> Result<f64> {
        self.predict_row(&self.align(features))
    }
}

pub enum Set {}
pub enum Unset {}

/// Builder for a [`PlsModel`]; `build` only exists once calibration points are set
pub struct ModelBuilder<N> {
    config: ModelConfig,
    points: Vec<CalibrationPoint>,
    feature_subset: Option<Vec<String>>,
    model_id: Option<String>,
    phantom_data: PhantomData<N>,
}

impl<N> ModelBuilder<N> {
    /// Restrict the candidate features to `names`
    #[must_use]
    pub fn with_feature_subset<S: Into<String>>(
        mut self,
        names: impl IntoIterator<Item = S>,
    ) -> Self {
        self.feature_subset = Some(names.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    #[must_use]
    pub fn with_budget(mut self, budget: SearchBudget) -> Self {
        self.config.budget = budget;
        self
    }
}

impl ModelBuilder<Unset> {
    #[must_use]
    pub const fn new(config: ModelConfig) -> Self {
        Self {
            config,
            points: vec![],
            feature_subset: None,
            model_id: None,
            phantom_data: PhantomData,
        }
    }

    #[must_use]
    pub fn with_points(
        self,
        points: impl IntoIterator<Item = CalibrationPoint>,
    ) -> ModelBuilder<Set> {
        ModelBuilder {
            config: self.config,
            points: points.into_iter().collect(),
            feature_subset: self.feature_subset,
            model_id: self.model_id,
            phantom_data: PhantomData,
        }
    }
}

impl ModelBuilder<Set> {
    /// Select features, choose the number of components and fit the final model
    ///
    /// # Errors
    /// - [`Error::InsufficientData`] with fewer points than configured, no variation in the
    ///   concentrations, or no feature with enough variance
    /// - [`Error::FeatureMismatch`] if the feature subset names an unknown feature
    /// - any error of the final fit
    pub fn build(self) -> Result<PlsModel> {
        let config = &self.config;
        let n = self.points.len();
        if n < config.min_calibration_points {
            return Err(Error::InsufficientData(format!(
                "{n} calibration points, at least {} are required",
                config.min_calibration_points
            )));
        }

        let candidates = match &self.feature_subset {
            Some(names) => {
                let unknown = names
                    .iter()
                    .find(|name| !FEATURE_NAMES.contains(&name.as_str()));
                if let Some(unknown) = unknown {
                    return Err(Error::FeatureMismatch {
                        feature: unknown.clone(),
                        reason: "not a known feature".into(),
                    });
                }
                names.clone()
            }
            None => FEATURE_NAMES.iter().map(|&name| name.to_owned()).collect(),
        };

        let concentrations = self.points.iter().map(|point| point.concentration).collect_vec();
        if variance(&concentrations).map_or(true, |v| v <= 0.0) {
            return Err(Error::InsufficientData(
                "calibration concentrations do not vary".into(),
            ));
        }

        let feature_names = candidates
            .into_iter()
            .filter(|name| {
                let column = self
                    .points
                    .iter()
                    .map(|point| point.features.get_or_default(name))
                    .collect_vec();
                let Some(spread) = variance(&column) else {
                    return false;
                };
                if spread < config.variance_threshold {
                    debug!("dropping feature {name}: variance {spread:.3e} below threshold");
                    return false;
                }
                let relative = relative_variance(&column, spread);
                if relative < config.min_relative_variance {
                    debug!(
                        "dropping feature {name}: relative variance {relative:.3e} below threshold"
                    );
                    return false;
                }
                true
            })
            .collect_vec();
        if feature_names.is_empty() {
            return Err(Error::InsufficientData(
                "no feature varies across the calibration points".into(),
            ));
        }

        let p = feature_names.len();
        let x = Array2::from_shape_fn((n, p), |(row, column)| {
            self.points[row].features.get_or_default(&feature_names[column])
        });
        let y = Array1::from(concentrations.clone());

        let max_components = config.max_components.min(p).min(n - 1);
        if max_components == 0 {
            return Err(Error::InsufficientData(format!(
                "{n} points and {p} features leave no room for a latent component"
            )));
        }
        let folds = config.cv_folds.min(n);
        let optimal_components = select_components(max_components, config.budget, |components| {
            cross_validate(&x, &y, components, folds).map(|cv| cv.q_squared)
        });

        let scaler = Scaler::fit(&x)?;
        let scaled = scaler.transform(&x);
        let regression = PlsRegression::fit(&scaled, &y, optimal_components)?;
        let fitted = regression.predict(&scaled).to_vec();

        let metrics = self.metrics(&x, &concentrations, &fitted, optimal_components, p);
        let feature_importance = importance(
            &feature_names,
            regression.coefficients.as_slice().unwrap_or(&[]),
        );

        let created_ms = now_ms();
        let model_id = self
            .model_id
            .unwrap_or_else(|| format!("pls_{created_ms:x}_{n}"));
        info!(
            "built model {model_id}: {optimal_components} components over {p} features, \
             r² {:.4}, rmse {:.4}",
            metrics.r2,
            metrics.rmse
        );

        Ok(PlsModel {
            model_id,
            created_ms,
            optimal_components,
            intercept: regression.intercept,
            feature_names,
            scaler_mean: scaler.mean,
            scaler_scale: scaler.scale,
            coefficients: regression.coefficients.to_vec(),
            metrics,
            feature_importance,
            calibration_points: self.points,
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn metrics(
        &self,
        x: &Array2<f64>,
        observed: &[f64],
        fitted: &[f64],
        components: usize,
        n_features: usize,
    ) -> ModelMetrics {
        let n = observed.len();
        let residuals = observed.iter().zip(fitted).map(|(y, f)| y - f).collect_vec();
        let rmse = (residuals.iter().map(|r| r * r).sum::<f64>() / n as f64).sqrt();
        let mae = residuals.iter().map(|r| r.abs()).sum::<f64>() / n as f64;
        let mean_concentration = mean(observed).unwrap_or(0.0);
        let relative_rmse_percent = if mean_concentration == 0.0 {
            0.0
        } else {
            rmse / mean_concentration.abs() * 100.0
        };

        let y = Array1::from(observed.to_vec());
        let (cv_r2_mean, cv_r2_std) =
            match cross_validate(x, &y, components, self.config.metrics_cv_folds) {
                Ok(cv) => (cv.q_squared, std_dev(&cv.fold_r_squared).unwrap_or(0.0)),
                Err(error) => {
                    warn!("cross-validated metrics unavailable: {error}");
                    (0.0, 0.0)
                }
            };

        ModelMetrics {
            r2: r_squared(observed, fitted),
            rmse,
            mae,
            relative_rmse_percent,
            cv_r2_mean,
            cv_r2_std,
            n_samples: n,
            n_features,
        }
    }
}

/// Build a model from `points` with the given configuration
///
/// # Errors
/// See [`ModelBuilder::build`].
pub fn build(
    points: &[CalibrationPoint],
    feature_subset: Option<&[String]>,
    config: &ModelConfig,
) -> Result<PlsModel> {
    let builder = ModelBuilder::new(config.clone()).with_points(points.to_vec());
    match feature_subset {
        Some(names) => builder.with_feature_subset(names.iter().cloned()).build(),
        None => builder.build(),
    }
}

/// Choose the number of components with the best score, trying counts in ascending order
///
/// Only strictly better scores replace the incumbent, so ties go to fewer components. A count
/// whose evaluation fails is skipped. Once the budget runs out the best count so far is returned,
/// or one if nothing was evaluated.
pub fn select_components<F>(max_components: usize, budget: SearchBudget, mut evaluate: F) -> usize
where
    F: FnMut(usize) -> Result<f64>,
{
    let started = Instant::now();
    let mut best: Option<(usize, f64)> = None;

    for (evaluations, components) in (1..=max_components).enumerate() {
        if budget.max_evaluations.is_some_and(|max| evaluations >= max) {
            warn!("component search stopped after {evaluations} evaluations");
            break;
        }
        if budget
            .time_limit_ms
            .is_some_and(|limit| started.elapsed().as_millis() >= u128::from(limit))
        {
            warn!("component search ran out of time after {evaluations} evaluations");
            break;
        }

        match evaluate(components) {
            Ok(score) if score.is_finite() => {
                debug!("{components} components score {score:.4}");
                match best {
                    Some((_, incumbent)) if score <= incumbent => {}
                    _ => best = Some((components, score)),
                }
            }
            Ok(score) => warn!("skipping {components} components: score {score}"),
            Err(error) => warn!("skipping {components} components: {error}"),
        }
    }

    best.map_or(1, |(components, _)| components)
}

/// Variance over the squared mean; unbounded for a column centred on zero
fn relative_variance(column: &[f64], spread: f64) -> f64 {
    let centre = mean(column).unwrap_or(0.0);
    if centre.abs() <= f64::MIN_POSITIVE {
        f64::INFINITY
    } else {
        spread / (centre * centre)
    }
}

/// Absolute coefficients normalised to sum to one, or uniform if that is impossible
#[allow(clippy::cast_precision_loss)]
fn importance(names: &[String], coefficients: &[f64]) -> BTreeMap<String, f64> {
    let total: f64 = coefficients.iter().map(|c| c.abs()).sum();
    if coefficients.len() != names.len() || !(total.is_finite() && total > 0.0) {
        let uniform = 1.0 / names.len() as f64;
        return names.iter().map(|name| (name.clone(), uniform)).collect();
    }
    names
        .iter()
        .zip(coefficients)
        .map(|(name, c)| (name.clone(), c.abs() / total))
        .collect()
}
