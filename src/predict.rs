//! Concentration prediction against a trained model.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::analysis::{Analyzer, BatchReport};
use crate::calibration::{now_ms, PlsModel};
use crate::features::FeatureVector;
use crate::trace::Trace;
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConcentrationPrediction {
    pub predicted_concentration: f64,
    /// Lower and upper bound, two model RMSEs either side and never below zero
    pub confidence_interval: (f64, f64),
    /// `[0, 100]`
    pub prediction_confidence: f64,
    pub model_id: String,
    pub timestamp_ms: u64,
    pub features: FeatureVector,
}

/// Caller-owned collection of trained models
///
/// Models are immutable once inserted and handed out as shared references. Replacing a model under
/// an existing id is a write the caller serialises.
#[derive(Clone, Debug, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, Arc<PlsModel>>,
}

impl ModelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `model` under its id, returning the model it replaced
    pub fn insert(&mut self, model: PlsModel) -> Option<Arc<PlsModel>> {
        info!("registering model {}", model.model_id());
        self.models
            .insert(model.model_id().to_owned(), Arc::new(model))
    }

    pub fn remove(&mut self, model_id: &str) -> Option<Arc<PlsModel>> {
        self.models.remove(model_id)
    }

    /// # Errors
    /// - [`Error::ModelNotFound`] if no model has this id
    pub fn get(&self, model_id: &str) -> Result<Arc<PlsModel>> {
        self.models
            .get(model_id)
            .cloned()
            .ok_or_else(|| Error::ModelNotFound(model_id.to_owned()))
    }

    /// The model with the highest in-sample r²
    ///
    /// # Errors
    /// - [`Error::ModelNotTrained`] if the registry is empty
    pub fn best(&self) -> Result<Arc<PlsModel>> {
        self.models
            .values()
            .max_by(|a, b| a.metrics().r2.total_cmp(&b.metrics().r2))
            .cloned()
            .ok_or(Error::ModelNotTrained)
    }

    /// The named model, or the best one when no name is given
    ///
    /// # Errors
    /// See [`Self::get`] and [`Self::best`].
    pub fn select(&self, model_id: Option<&str>) -> Result<Arc<PlsModel>> {
        model_id.map_or_else(|| self.best(), |id| self.get(id))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Runs traces through the analyzer and scores them with a model
#[derive(Clone, Debug, Default)]
pub struct Predictor {
    analyzer: Analyzer,
}

impl Predictor {
    #[must_use]
    pub const fn new(analyzer: Analyzer) -> Self {
        Self { analyzer }
    }

    #[must_use]
    pub const fn analyzer(&self) -> &Analyzer {
        &self.analyzer
    }

    /// Predict the concentration measured in `trace`
    ///
    /// # Errors
    /// - any analysis error of the trace
    /// - [`Error::FeatureMismatch`] if the features cannot be scored by `model`
    pub fn predict(&self, trace: &Trace, model: &PlsModel) -> Result<ConcentrationPrediction> {
        let analysis = self.analyzer.analyze(trace)?;
        predict_features(&analysis.features, analysis.quality_score(), model)
    }

    /// Predict with a model from `registry`, the best one unless `model_id` names another
    ///
    /// # Errors
    /// - [`Error::ModelNotTrained`] if the registry is empty
    /// - [`Error::ModelNotFound`] if `model_id` is unknown
    /// - anything [`Self::predict`] returns
    pub fn predict_with(
        &self,
        trace: &Trace,
        registry: &ModelRegistry,
        model_id: Option<&str>,
    ) -> Result<ConcentrationPrediction> {
        let model = registry.select(model_id)?;
        self.predict(trace, &model)
    }

    /// Predict every trace with the same model, recording failures per item
    pub fn predict_batch<'a>(
        &self,
        traces: impl IntoIterator<Item = &'a Trace>,
        model: &PlsModel,
    ) -> BatchReport<ConcentrationPrediction> {
        BatchReport::from_traces("prediction", traces, |trace| self.predict(trace, model))
    }
}

/// Score an already extracted feature vector
///
/// `trace_quality` is the `[0, 100]` quality of the trace the features came from.
///
/// # Errors
/// - [`Error::FeatureMismatch`] if the features cannot be scored by `model`
pub fn predict_features(
    features: &FeatureVector,
    trace_quality: f64,
    model: &PlsModel,
) -> Result<ConcentrationPrediction> {
    let predicted_concentration = model.predict_features(features)?;
    let rmse = model.metrics().rmse;
    let confidence_interval = (
        (predicted_concentration - 2.0 * rmse).max(0.0),
        predicted_concentration + 2.0 * rmse,
    );
    let model_confidence = (model.metrics().r2 * 100.0).clamp(0.0, 100.0);
    let prediction_confidence = (model_confidence + trace_quality.clamp(0.0, 100.0)) / 2.0;
    debug!(
        "model {} predicts {predicted_concentration:.4} ({prediction_confidence:.1}%)",
        model.model_id()
    );

    Ok(ConcentrationPrediction {
        predicted_concentration,
        confidence_interval,
        prediction_confidence,
        model_id: model.model_id().to_owned(),
        timestamp_ms: now_ms(),
        features: features.clone(),
    })
}
