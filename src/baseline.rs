//! Baseline estimation from locally stable regions of a trace.
//!
//! The voltage span is cut into equal segments, separately for each branch of the sweep, so the
//! capacitive offset between forward and reverse currents never mixes inside a region. Points
//! close to the segment median are kept, points near an accepted peak are not.

use itertools::Itertools;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::{BaselineConfig, PreprocessConfig};
use crate::math::{mean, median, min_max, percentile, std_dev};
use crate::peaks::Peak;
use crate::preprocess::{Branch, Preprocessor};
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BaselineRegion {
    pub name: String,
    /// Sample indices, ascending
    pub indices: Vec<usize>,
    pub mean_current: f64,
    pub std_current: f64,
    /// Lower and upper voltage bound of the region
    pub voltage_range: (f64, f64),
}

impl BaselineRegion {
    fn from_indices(
        name: String,
        indices: Vec<usize>,
        voltage_range: (f64, f64),
        current: &[f64],
    ) -> Self {
        let currents = indices.iter().map(|&ii| current[ii]).collect_vec();
        Self {
            name,
            mean_current: mean(&currents).unwrap_or(0.0),
            std_current: std_dev(&currents).unwrap_or(0.0),
            indices,
            voltage_range,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BaselineEstimate {
    pub regions: Vec<BaselineRegion>,
    /// Fraction of the target number of baseline points that was found, in `[0, 1]`
    pub quality: f64,
}

impl BaselineEstimate {
    #[must_use]
    pub fn point_count(&self) -> usize {
        self.regions.iter().map(|region| region.indices.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Mean current over all region points, weighted by region size
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean_current(&self) -> Option<f64> {
        let count = self.point_count();
        if count == 0 {
            return None;
        }
        let total: f64 = self
            .regions
            .iter()
            .map(|region| region.mean_current * region.indices.len() as f64)
            .sum();
        Some(total / count as f64)
    }
}

#[derive(Clone, Debug, Default)]
pub struct BaselineEstimator {
    preprocessor: Preprocessor,
    config: BaselineConfig,
}

impl BaselineEstimator {
    #[must_use]
    pub const fn new(preprocess: PreprocessConfig, config: BaselineConfig) -> Self {
        Self {
            preprocessor: Preprocessor::new(preprocess),
            config,
        }
    }

    /// Estimate baseline regions of a trace, avoiding the neighbourhood of accepted peaks
    ///
    /// Rejected peaks in `peaks` are ignored. Finding no baseline is not an error: the estimate
    /// is then empty with a quality of zero.
    ///
    /// # Errors
    /// - [`Error::InvalidTrace`] if the arrays differ in length
    #[allow(clippy::cast_precision_loss)]
    pub fn estimate(
        &self,
        voltage: &[f64],
        current: &[f64],
        peaks: &[Peak],
    ) -> Result<BaselineEstimate> {
        if voltage.len() != current.len() {
            return Err(Error::InvalidTrace(format!(
                "voltage has {} samples but current has {}",
                voltage.len(),
                current.len()
            )));
        }
        let n = voltage.len();
        let Some((v_min, v_max)) = min_max(voltage) else {
            return Ok(BaselineEstimate::default());
        };

        let excluded = peaks
            .iter()
            .filter(|peak| peak.is_accepted())
            .map(|peak| peak.voltage)
            .collect_vec();
        let near_peak =
            |v: f64| excluded.iter().any(|pv| (v - pv).abs() <= self.config.peak_exclusion);

        let mut regions = self.segment_regions(voltage, current, (v_min, v_max), &near_peak);
        let kept: usize = regions.iter().map(|region| region.indices.len()).sum();
        if kept < self.config.min_total_points {
            warn!(
                "only {kept} stable baseline points in {n} samples, falling back to quartile levels"
            );
            regions = self.quartile_regions(voltage, current, &near_peak);
        }

        let kept: usize = regions.iter().map(|region| region.indices.len()).sum();
        let target = n as f64 * self.config.target_fraction;
        let quality = if target > 0.0 {
            (kept as f64 / target).min(1.0)
        } else {
            0.0
        };
        debug!("baseline: {} regions, {kept} points, quality {quality:.2}", regions.len());

        Ok(BaselineEstimate { regions, quality })
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn segment_regions(
        &self,
        voltage: &[f64],
        current: &[f64],
        (v_min, v_max): (f64, f64),
        near_peak: &impl Fn(f64) -> bool,
    ) -> Vec<BaselineRegion> {
        let config = &self.config;
        let segments = config.segments.max(1);
        let width = (v_max - v_min) / segments as f64;
        let segment_of = |v: f64| {
            if width > 0.0 {
                (((v - v_min) / width).floor() as usize).min(segments - 1)
            } else {
                0
            }
        };

        let scan = self.preprocessor.detect_scan_direction(voltage);
        let mut regions = vec![];
        for branch in [Branch::Forward, Branch::Reverse] {
            let span = scan.range_of(branch);
            for segment in 0..segments {
                let members = span
                    .clone()
                    .filter(|&ii| segment_of(voltage[ii]) == segment)
                    .collect_vec();
                if members.len() < config.min_region_points {
                    continue;
                }

                let currents = members.iter().map(|&ii| current[ii]).collect_vec();
                let (Some(centre), Some(q1), Some(q3)) = (
                    median(&currents),
                    percentile(&currents, 25.0),
                    percentile(&currents, 75.0),
                ) else {
                    continue;
                };
                let tolerance = (q3 - q1) / 2.0;

                let stable = members
                    .into_iter()
                    .filter(|&ii| (current[ii] - centre).abs() <= tolerance)
                    .filter(|&ii| !near_peak(voltage[ii]))
                    .collect_vec();
                let name = format!("{}_{segment}", branch_name(branch));
                if stable.len() < config.min_region_points {
                    debug!("dropping baseline region {name}: {} stable points", stable.len());
                    continue;
                }

                let lower = v_min + width * segment as f64;
                regions.push(BaselineRegion::from_indices(
                    name,
                    stable,
                    (lower, lower + width),
                    current,
                ));
            }
        }
        regions
    }

    /// Points whose current sits close to the lower or upper quartile
    fn quartile_regions(
        &self,
        voltage: &[f64],
        current: &[f64],
        near_peak: &impl Fn(f64) -> bool,
    ) -> Vec<BaselineRegion> {
        let (Some(q1), Some(q3), Some((i_min, i_max))) = (
            percentile(current, 25.0),
            percentile(current, 75.0),
            min_max(current),
        ) else {
            return vec![];
        };
        let tolerance = self.config.fallback_tolerance * (i_max - i_min);

        let (mut lower, mut upper) = (vec![], vec![]);
        for (ii, (&v, &i)) in voltage.iter().zip(current).enumerate() {
            if near_peak(v) {
                continue;
            }
            let (to_lower, to_upper) = ((i - q1).abs(), (i - q3).abs());
            if to_lower <= tolerance && to_lower <= to_upper {
                lower.push(ii);
            } else if to_upper <= tolerance {
                upper.push(ii);
            }
        }

        [("lower_quartile", lower), ("upper_quartile", upper)]
            .into_iter()
            .filter(|(_, indices)| !indices.is_empty())
            .map(|(name, indices)| {
                let voltages = indices.iter().map(|&ii| voltage[ii]).collect_vec();
                let range = min_max(&voltages).unwrap_or((0.0, 0.0));
                BaselineRegion::from_indices(name.to_owned(), indices, range, current)
            })
            .collect()
    }
}

const fn branch_name(branch: Branch) -> &'static str {
    match branch {
        Branch::Forward => "forward",
        Branch::Reverse => "reverse",
    }
}
