//! Fixed-order feature vector extracted from detected peaks and baseline.

use serde::{Deserialize, Serialize};

use crate::baseline::BaselineEstimate;
use crate::config::FeatureConfig;
use crate::math::trapezoid;
use crate::peaks::{best_peak, Peak, PeakKind};
use crate::preprocess::Thresholds;
use crate::trace::Trace;

/// Feature names in the order they appear in [`FeatureVector::to_vec`]
pub const FEATURE_NAMES: [&str; 13] = [
    "oxidation_height",
    "reduction_height",
    "peak_separation",
    "peak_ratio",
    "total_area",
    "oxidation_area",
    "reduction_area",
    "area_ratio",
    "peak_symmetry",
    "baseline_quality",
    "signal_noise_ratio",
    "oxidation_fwhm",
    "reduction_fwhm",
];

/// Numeric description of one trace
///
/// Every field defaults to zero when its peak or region is absent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureVector {
    /// µA above the local baseline
    pub oxidation_height: f64,
    pub reduction_height: f64,
    /// Distance between the oxidation and reduction potentials (V)
    pub peak_separation: f64,
    pub peak_ratio: f64,
    /// Sum of both peak areas (µA·V)
    pub total_area: f64,
    pub oxidation_area: f64,
    pub reduction_area: f64,
    pub area_ratio: f64,
    /// Smaller over larger half-area around the dominant peak, in `[0, 1]`
    pub peak_symmetry: f64,
    pub baseline_quality: f64,
    pub signal_noise_ratio: f64,
    /// Full width at half height (V)
    pub oxidation_fwhm: f64,
    pub reduction_fwhm: f64,
}

impl FeatureVector {
    /// Value of the feature called `name`, if there is one
    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        let value = match name {
            "oxidation_height" => self.oxidation_height,
            "reduction_height" => self.reduction_height,
            "peak_separation" => self.peak_separation,
            "peak_ratio" => self.peak_ratio,
            "total_area" => self.total_area,
            "oxidation_area" => self.oxidation_area,
            "reduction_area" => self.reduction_area,
            "area_ratio" => self.area_ratio,
            "peak_symmetry" => self.peak_symmetry,
            "baseline_quality" => self.baseline_quality,
            "signal_noise_ratio" => self.signal_noise_ratio,
            "oxidation_fwhm" => self.oxidation_fwhm,
            "reduction_fwhm" => self.reduction_fwhm,
            _ => return None,
        };
        Some(value)
    }

    /// Value of the feature called `name`, or zero for names this vector does not carry
    #[must_use]
    pub fn get_or_default(&self, name: &str) -> f64 {
        self.get(name).unwrap_or_default()
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<f64> {
        FEATURE_NAMES.iter().map(|name| self.get_or_default(name)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        FEATURE_NAMES
            .iter()
            .map(|&name| (name, self.get_or_default(name)))
    }
}

#[derive(Clone, Debug, Default)]
pub struct FeatureExtractor {
    config: FeatureConfig,
}

impl FeatureExtractor {
    #[must_use]
    pub const fn new(config: FeatureConfig) -> Self {
        Self { config }
    }

    /// Build the feature vector of a trace from its best peak of each kind
    ///
    /// Deterministic; missing peaks leave their features at zero.
    #[must_use]
    pub fn extract(
        &self,
        trace: &Trace,
        peaks: &[Peak],
        baseline: &BaselineEstimate,
        thresholds: &Thresholds,
    ) -> FeatureVector {
        let (voltage, current) = (trace.voltage(), trace.current());
        let oxidation = best_peak(peaks, PeakKind::Oxidation);
        let reduction = best_peak(peaks, PeakKind::Reduction);

        let oxidation_height = oxidation.map_or(0.0, Peak::height);
        let reduction_height = reduction.map_or(0.0, Peak::height);
        let area = |peak: Option<&Peak>| {
            peak.map_or(0.0, |peak| self.peak_areas(peak, voltage, current).total())
        };
        let oxidation_area = area(oxidation);
        let reduction_area = area(reduction);

        let peak_separation = match (oxidation, reduction) {
            (Some(ox), Some(red)) => (ox.voltage - red.voltage).abs(),
            _ => 0.0,
        };

        let peak_symmetry = oxidation
            .or(reduction)
            .map_or(0.0, |peak| self.peak_areas(peak, voltage, current).symmetry());

        FeatureVector {
            oxidation_height,
            reduction_height,
            peak_separation,
            peak_ratio: ratio(oxidation_height, reduction_height),
            total_area: oxidation_area + reduction_area,
            oxidation_area,
            reduction_area,
            area_ratio: ratio(oxidation_area, reduction_area),
            peak_symmetry,
            baseline_quality: baseline.quality,
            signal_noise_ratio: thresholds.snr,
            oxidation_fwhm: oxidation.map_or(0.0, |peak| fwhm(peak, voltage, current)),
            reduction_fwhm: reduction.map_or(0.0, |peak| fwhm(peak, voltage, current)),
        }
    }

    /// Baseline-corrected areas either side of the peak, within the integration window
    fn peak_areas(&self, peak: &Peak, voltage: &[f64], current: &[f64]) -> PeakAreas {
        let n = voltage.len();
        if n == 0 {
            return PeakAreas {
                left: 0.0,
                right: 0.0,
            };
        }
        let index = peak.index.min(n - 1);
        let lo = index.saturating_sub(self.config.area_window);
        let hi = (index + self.config.area_window + 1).min(n);
        let corrected = current[lo..hi]
            .iter()
            .map(|i| i - peak.baseline)
            .collect::<Vec<_>>();
        let split = index - lo;

        PeakAreas {
            left: trapezoid(&voltage[lo..=index], &corrected[..=split]).abs(),
            right: trapezoid(&voltage[index..hi], &corrected[split..]).abs(),
        }
    }
}

struct PeakAreas {
    left: f64,
    right: f64,
}

impl PeakAreas {
    fn total(&self) -> f64 {
        self.left + self.right
    }

    fn symmetry(&self) -> f64 {
        ratio(self.left.min(self.right), self.left.max(self.right))
    }
}

/// `numerator / denominator`, or zero when the denominator is zero
fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Full width at half height, with linear interpolation of both crossings
fn fwhm(peak: &Peak, voltage: &[f64], current: &[f64]) -> f64 {
    let half = peak.height() / 2.0;
    if half <= 0.0 || peak.index >= current.len() {
        return 0.0;
    }
    let excess = |ii: usize| (current[ii] - peak.baseline).abs();
    let crossing = |inside: usize, outside: usize| {
        let (a, b) = (excess(inside), excess(outside));
        let fraction = if (a - b).abs() > 0.0 { (a - half) / (a - b) } else { 0.0 };
        voltage[inside] + (voltage[outside] - voltage[inside]) * fraction
    };

    let mut left = peak.index;
    while left > 0 && excess(left - 1) >= half {
        left -= 1;
    }
    let left_v = if left > 0 {
        crossing(left, left - 1)
    } else {
        voltage[0]
    };

    let mut right = peak.index;
    while right + 1 < current.len() && excess(right + 1) >= half {
        right += 1;
    }
    let right_v = if right + 1 < current.len() {
        crossing(right, right + 1)
    } else {
        voltage[right]
    };

    (right_v - left_v).abs()
}
