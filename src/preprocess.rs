//! Scan direction and adaptive thresholds derived from a raw trace.

use std::ops::Range;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::config::{PreprocessConfig, RegimeProfile};
use crate::math::{median, min_max, moving_average, std_dev};

/// Number of consecutive reversed steps needed to accept a turning point
const TURN_PERSISTENCE: usize = 3;

/// Which half of the cycle a sample belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Branch {
    Forward,
    Reverse,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanDirection {
    pub turning_point: usize,
    /// Indices of the forward sweep, turning point included
    pub forward: Range<usize>,
    pub reverse: Range<usize>,
    /// Whether the forward sweep moves towards positive voltage
    pub forward_increasing: bool,
}

impl ScanDirection {
    #[must_use]
    pub fn branch_of(&self, index: usize) -> Branch {
        if self.forward.contains(&index) {
            Branch::Forward
        } else {
            Branch::Reverse
        }
    }

    #[must_use]
    pub fn range_of(&self, branch: Branch) -> Range<usize> {
        match branch {
            Branch::Forward => self.forward.clone(),
            Branch::Reverse => self.reverse.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalRegime {
    Low,
    Medium,
    High,
}

/// Detection thresholds scaled to one trace's dynamic range
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Baseline current estimated from the voltage extremes (µA)
    pub baseline: f64,
    /// Standard deviation of the high-frequency residual (µA)
    pub noise: f64,
    /// Max minus min current (µA)
    pub range: f64,
    pub regime: SignalRegime,
    pub prominence: f64,
    pub height: f64,
    /// Minimum peak width in samples
    pub width: f64,
    pub snr: f64,
}

impl Thresholds {
    /// The same thresholds multiplied by `factor`, favouring recall during candidate search
    #[must_use]
    pub fn relaxed(&self, factor: f64) -> Self {
        Self {
            prominence: self.prominence * factor,
            height: self.height * factor,
            width: self.width * factor,
            ..*self
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    #[must_use]
    pub const fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// Locate the turning point of the sweep
    ///
    /// The turning point is the first index after which the voltage gradient reverses sign for
    /// several steps. Sweeps without a reversal fall back to the extremum they are heading for.
    /// The result is clamped into the central part of the trace.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn detect_scan_direction(&self, voltage: &[f64]) -> ScanDirection {
        let n = voltage.len();
        let steps = voltage
            .iter()
            .tuple_windows()
            .map(|(a, b)| sign(b - a))
            .collect_vec();
        let initial = steps.iter().copied().find(|s| *s != 0).unwrap_or(1);

        let reversal = (0..steps.len()).find(|&jj| {
            steps[jj] == -initial
                && steps[jj..steps.len().min(jj + TURN_PERSISTENCE)]
                    .iter()
                    .all(|s| *s == -initial)
        });

        let raw = reversal.unwrap_or_else(|| sweep_extremum(voltage, initial > 0));

        let turning_point = if n == 0 {
            0
        } else {
            let lo = (self.config.turning_point_clamp_min * n as f64).ceil() as usize;
            let hi = (self.config.turning_point_clamp_max * n as f64).floor() as usize;
            raw.clamp(lo.min(n - 1), hi.clamp(lo.min(n - 1), n - 1))
        };

        ScanDirection {
            turning_point,
            forward: 0..(turning_point + 1).min(n),
            reverse: (turning_point + 1).min(n)..n,
            forward_increasing: initial > 0,
        }
    }

    /// Derive baseline, noise and detection thresholds from the trace's dynamic range
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn calculate_adaptive_thresholds(&self, current: &[f64], voltage: &[f64]) -> Thresholds {
        let config = &self.config;
        let (i_min, i_max) = min_max(current).unwrap_or((0.0, 0.0));
        let range = i_max - i_min;

        let baseline = self.edge_baseline(current, voltage);

        let smoothed = moving_average(current, config.noise_window.max(1));
        let residual = current
            .iter()
            .zip(&smoothed)
            .map(|(i, s)| i - s)
            .collect_vec();
        let noise = std_dev(&residual).unwrap_or(0.0).max(f64::MIN_POSITIVE);

        let regime = if range < config.low_signal_max {
            SignalRegime::Low
        } else if range < config.high_signal_min {
            SignalRegime::Medium
        } else {
            SignalRegime::High
        };
        let profile: RegimeProfile = match regime {
            SignalRegime::Low => config.low,
            SignalRegime::Medium => config.medium,
            SignalRegime::High => config.high,
        };

        let density = current.len() as f64 / config.width_divisor;

        Thresholds {
            baseline,
            noise,
            range,
            regime,
            prominence: range * profile.prominence_factor,
            height: range * profile.height_factor,
            width: (density * profile.width_factor).max(1.0),
            snr: range / noise,
        }
    }

    /// Median current near the voltage extremes, where no faradaic response is expected
    fn edge_baseline(&self, current: &[f64], voltage: &[f64]) -> f64 {
        let overall = median(current).unwrap_or(0.0);
        let Some((v_min, v_max)) = min_max(voltage) else {
            return overall;
        };
        let margin = (v_max - v_min) * self.config.edge_fraction;
        let edge = voltage
            .iter()
            .zip(current)
            .filter(|(v, _)| **v <= v_min + margin || **v >= v_max - margin)
            .map(|(_, i)| *i)
            .collect_vec();
        if edge.len() < 3 {
            return overall;
        }
        median(&edge).unwrap_or(overall)
    }
}

fn sign(value: f64) -> i8 {
    if value > 0.0 {
        1
    } else if value < 0.0 {
        -1
    } else {
        0
    }
}

/// Extremum the sweep is heading towards: the maximum of an ascending sweep, else the minimum
fn sweep_extremum(voltage: &[f64], ascending: bool) -> usize {
    let by_value = |a: &(usize, &f64), b: &(usize, &f64)| {
        a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal)
    };
    let extremum = if ascending {
        voltage.iter().enumerate().max_by(by_value)
    } else {
        voltage.iter().enumerate().min_by(by_value)
    };
    extremum.map_or(0, |(ii, _)| ii)
}

#[cfg(test)]
mod test {
    use super::{Branch, Preprocessor, SignalRegime};
    use crate::config::PreprocessConfig;
    use crate::math::linspace;

    fn cycle(n_per_sweep: usize) -> Vec<f64> {
        let forward = linspace(-0.2, 0.6, n_per_sweep);
        let reverse = forward.iter().rev().skip(1).copied().collect::<Vec<_>>();
        forward.into_iter().chain(reverse).collect()
    }

    #[test]
    fn turning_point_of_a_full_cycle_is_the_vertex() {
        let voltage = cycle(100);
        let scan = Preprocessor::default().detect_scan_direction(&voltage);

        assert_eq!(scan.turning_point, 99);
        assert_eq!(scan.forward, 0..100);
        assert_eq!(scan.reverse, 100..199);
        assert!(scan.forward_increasing);
        assert_eq!(scan.branch_of(10), Branch::Forward);
        assert_eq!(scan.branch_of(150), Branch::Reverse);
    }

    #[test]
    fn monotonic_sweep_is_clamped_away_from_the_end() {
        let voltage = linspace(0.6, -0.2, 100);
        let scan = Preprocessor::default().detect_scan_direction(&voltage);

        assert_eq!(scan.turning_point, 90);
        assert!(!scan.forward_increasing);
    }

    #[test]
    fn early_reversal_is_clamped_to_the_minimum_fraction() {
        let mut voltage = linspace(0.0, 0.05, 3);
        voltage.extend(linspace(0.04, -0.5, 97));
        let scan = Preprocessor::default().detect_scan_direction(&voltage);

        assert_eq!(scan.turning_point, 10);
    }

    #[test]
    fn flat_trace_has_low_regime_and_unit_width() {
        let voltage = linspace(-0.2, 0.6, 50);
        let current = vec![0.2; 50];
        let thresholds = Preprocessor::default().calculate_adaptive_thresholds(&current, &voltage);

        assert_eq!(thresholds.regime, SignalRegime::Low);
        approx::assert_relative_eq!(thresholds.baseline, 0.2);
        approx::assert_relative_eq!(thresholds.range, 0.0);
        approx::assert_relative_eq!(thresholds.width, 1.0);
    }

    #[test]
    fn regime_scales_thresholds_with_dynamic_range() {
        let config = PreprocessConfig::default();
        let voltage = linspace(-0.2, 0.6, 400);
        let current = voltage
            .iter()
            .map(|v| 0.1 + 20.0 * (-(v - 0.2_f64).powi(2) / (2.0 * 0.03_f64.powi(2))).exp())
            .collect::<Vec<_>>();
        let thresholds =
            Preprocessor::new(config.clone()).calculate_adaptive_thresholds(&current, &voltage);

        assert_eq!(thresholds.regime, SignalRegime::High);
        approx::assert_relative_eq!(thresholds.baseline, 0.1, epsilon = 1e-9);
        approx::assert_relative_eq!(
            thresholds.prominence,
            thresholds.range * config.high.prominence_factor
        );
        approx::assert_relative_eq!(thresholds.width, 4.0);
        assert!(thresholds.snr > 100.0);

        let relaxed = thresholds.relaxed(0.5);
        approx::assert_relative_eq!(relaxed.height, thresholds.height * 0.5);
        approx::assert_relative_eq!(relaxed.noise, thresholds.noise);
    }
}
