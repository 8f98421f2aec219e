//! Tunable constants for every stage of the pipeline.
//!
//! The voltage windows, penalty multipliers and confidence tiers below are empirically tuned for
//! the redox couple being measured. They are defaults, not physics, and any of them can be
//! overridden from TOML.

use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub preprocess: PreprocessConfig,
    pub peaks: PeakConfig,
    pub baseline: BaselineConfig,
    pub features: FeatureConfig,
    pub model: ModelConfig,
    pub instrument: InstrumentConfig,
}

impl Config {
    /// Parse a configuration from TOML text. Missing keys take their default values.
    ///
    /// # Errors
    /// Returns [`crate::Error::Config`] if the text is not valid TOML for this schema.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// Scaling applied to the raw dynamic range in one signal regime.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegimeProfile {
    pub prominence_factor: f64,
    pub height_factor: f64,
    pub width_factor: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Fraction of the voltage span, at either end, whose currents estimate the baseline
    pub edge_fraction: f64,
    /// Window of the moving average removed before estimating noise
    pub noise_window: usize,
    /// Samples per unit of width threshold
    pub width_divisor: f64,
    /// Dynamic range (µA) below which the signal is treated as low
    pub low_signal_max: f64,
    /// Dynamic range (µA) at or above which the signal is treated as high
    pub high_signal_min: f64,
    /// Turning point is clamped into `[clamp_min * n, clamp_max * n]`
    pub turning_point_clamp_min: f64,
    pub turning_point_clamp_max: f64,
    pub low: RegimeProfile,
    pub medium: RegimeProfile,
    pub high: RegimeProfile,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            edge_fraction: 0.1,
            noise_window: 5,
            width_divisor: 100.0,
            low_signal_max: 1.0,
            high_signal_min: 10.0,
            turning_point_clamp_min: 0.1,
            turning_point_clamp_max: 0.9,
            low: RegimeProfile {
                prominence_factor: 0.05,
                height_factor: 0.05,
                width_factor: 0.5,
            },
            medium: RegimeProfile {
                prominence_factor: 0.08,
                height_factor: 0.08,
                width_factor: 1.0,
            },
            high: RegimeProfile {
                prominence_factor: 0.1,
                height_factor: 0.1,
                width_factor: 1.0,
            },
        }
    }
}

/// Closed voltage interval in volts.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoltageWindow {
    pub min: f64,
    pub max: f64,
}

impl VoltageWindow {
    #[must_use]
    pub fn contains(&self, voltage: f64) -> bool {
        (self.min..=self.max).contains(&voltage)
    }
}

/// Multiplicative penalties applied to a candidate's score, one per failed check.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PenaltyFactors {
    pub outside_window: f64,
    pub wrong_side: f64,
    pub low_height: f64,
    pub low_snr: f64,
    pub poor_shape: f64,
}

impl Default for PenaltyFactors {
    fn default() -> Self {
        Self {
            outside_window: 0.5,
            wrong_side: 0.3,
            low_height: 0.6,
            low_snr: 0.7,
            poor_shape: 0.8,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakConfig {
    pub min_points: usize,
    /// Candidate thresholds are the adaptive thresholds times this factor
    pub recall_factor: f64,
    pub window_radius: usize,
    /// Points closer than this (V) to a candidate are excluded from its local baseline
    pub local_baseline_tolerance: f64,
    /// Width (V) of the band beyond the tolerance that forms the local baseline
    pub local_baseline_window: f64,
    pub min_height_fraction: f64,
    pub min_snr: f64,
    pub shape_window: usize,
    pub min_shape_score: f64,
    pub confidence_threshold: f64,
    pub oxidation_window: VoltageWindow,
    pub reduction_window: VoltageWindow,
    pub penalties: PenaltyFactors,
}

impl Default for PeakConfig {
    fn default() -> Self {
        Self {
            min_points: 20,
            recall_factor: 0.6,
            window_radius: 5,
            local_baseline_tolerance: 0.1,
            local_baseline_window: 0.15,
            min_height_fraction: 0.05,
            min_snr: 3.0,
            shape_window: 5,
            min_shape_score: 0.9,
            confidence_threshold: 50.0,
            oxidation_window: VoltageWindow {
                min: -0.1,
                max: 0.5,
            },
            reduction_window: VoltageWindow {
                min: -0.3,
                max: 0.4,
            },
            penalties: PenaltyFactors::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    pub segments: usize,
    pub min_region_points: usize,
    /// Half width (V) of the window around each accepted peak that baseline points avoid
    pub peak_exclusion: f64,
    pub target_fraction: f64,
    pub min_total_points: usize,
    /// Tolerance, as a fraction of the current range, around the quartiles in the fallback
    pub fallback_tolerance: f64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            segments: 4,
            min_region_points: 5,
            peak_exclusion: 0.05,
            target_fraction: 0.2,
            min_total_points: 10,
            fallback_tolerance: 0.05,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Half width, in samples, of the integration window around a peak
    pub area_window: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self { area_window: 20 }
    }
}

/// Limits on the component search. `None` means unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchBudget {
    pub max_evaluations: Option<usize>,
    pub time_limit_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub min_calibration_points: usize,
    pub max_components: usize,
    pub cv_folds: usize,
    pub metrics_cv_folds: usize,
    /// Features whose variance across the calibration points is below this are dropped
    pub variance_threshold: f64,
    /// Features whose variance relative to their squared mean is below this are dropped, so a
    /// feature that only jitters around a fixed value never reaches the regression
    pub min_relative_variance: f64,
    pub min_quality_score: f64,
    pub budget: SearchBudget,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            min_calibration_points: 5,
            max_components: 10,
            cv_folds: 5,
            metrics_cv_folds: 5,
            variance_threshold: 1e-6,
            min_relative_variance: 1e-2,
            min_quality_score: 30.0,
            budget: SearchBudget::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    pub high_r_squared: f64,
    pub medium_r_squared: f64,
    /// Fits below this are rejected and never stored
    pub low_r_squared: f64,
    /// Stored records below this are ignored by `apply` in favour of the default map
    pub min_apply_r_squared: f64,
    pub default_gain: f64,
    pub default_offset: f64,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            high_r_squared: 0.6,
            medium_r_squared: 0.4,
            low_r_squared: 0.3,
            min_apply_r_squared: 0.3,
            default_gain: 1.0,
            default_offset: 0.0,
        }
    }
}
