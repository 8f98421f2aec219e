//! Oxidation and reduction peak detection.
//!
//! Candidates come from three independent heuristics run with relaxed thresholds, are fused per
//! peak type, and are then scored against the baseline local to each candidate. Scoring only ever
//! multiplies penalties into the confidence; a candidate is rejected when its final confidence
//! falls below the configured threshold.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;

use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::{PeakConfig, PreprocessConfig, VoltageWindow};
use crate::math::{median, min_max};
use crate::preprocess::{Branch, Preprocessor, ScanDirection, Thresholds};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeakKind {
    Oxidation,
    Reduction,
}

impl PeakKind {
    /// Orientation that turns this kind of peak into a local maximum
    const fn sign(self) -> f64 {
        match self {
            Self::Oxidation => 1.0,
            Self::Reduction => -1.0,
        }
    }
}

impl fmt::Display for PeakKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oxidation => write!(f, "oxidation"),
            Self::Reduction => write!(f, "reduction"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    pub kind: PeakKind,
    pub voltage: f64,
    pub current: f64,
    pub index: usize,
    /// Score in `[0, 100]`
    pub confidence: f64,
    /// Relative position of the current within the min/max of a small window, in `[0, 1]`
    pub shape_score: f64,
    /// Local baseline current the candidate was scored against
    pub baseline: f64,
    pub branch: Branch,
    /// Failed checks, present only on rejected peaks
    pub rejection_reason: Option<String>,
}

impl Peak {
    /// Distance of the peak current from its local baseline
    #[must_use]
    pub fn height(&self) -> f64 {
        (self.current - self.baseline).abs()
    }

    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        self.rejection_reason.is_none()
    }
}

#[derive(Clone, Debug)]
pub struct Detection {
    /// Accepted peaks ordered by sample index
    pub peaks: Vec<Peak>,
    pub rejected: Vec<Peak>,
    pub thresholds: Thresholds,
    pub scan: ScanDirection,
}

impl Detection {
    /// Highest-confidence accepted peak of `kind`; ties go to the taller peak
    #[must_use]
    pub fn best(&self, kind: PeakKind) -> Option<&Peak> {
        best_peak(&self.peaks, kind)
    }
}

pub(crate) fn best_peak(peaks: &[Peak], kind: PeakKind) -> Option<&Peak> {
    peaks
        .iter()
        .filter(|peak| peak.kind == kind && peak.is_accepted())
        .max_by(|a, b| {
            a.confidence
                .total_cmp(&b.confidence)
                .then(a.height().total_cmp(&b.height()))
        })
}

#[derive(Clone, Debug, Default)]
pub struct PeakDetector {
    preprocessor: Preprocessor,
    config: PeakConfig,
}

impl PeakDetector {
    #[must_use]
    pub const fn new(preprocess: PreprocessConfig, config: PeakConfig) -> Self {
        Self {
            preprocessor: Preprocessor::new(preprocess),
            config,
        }
    }

    #[must_use]
    pub const fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    /// Detect oxidation and reduction peaks in a trace
    ///
    /// # Errors
    /// - [`Error::InvalidTrace`] if the arrays differ in length or contain non-finite values
    /// - [`Error::InsufficientData`] if the trace is shorter than the configured minimum
    pub fn detect(&self, voltage: &[f64], current: &[f64]) -> Result<Detection> {
        if voltage.len() != current.len() {
            return Err(Error::InvalidTrace(format!(
                "voltage has {} samples but current has {}",
                voltage.len(),
                current.len()
            )));
        }
        if voltage.iter().chain(current).any(|x| !x.is_finite()) {
            return Err(Error::InvalidTrace("trace contains non-finite samples".into()));
        }
        if voltage.len() < self.config.min_points {
            return Err(Error::InsufficientData(format!(
                "trace has {} samples, at least {} are required",
                voltage.len(),
                self.config.min_points
            )));
        }

        let scan = self.preprocessor.detect_scan_direction(voltage);
        let thresholds = self
            .preprocessor
            .calculate_adaptive_thresholds(current, voltage);

        let mut peaks = vec![];
        let mut rejected = vec![];
        for kind in [PeakKind::Oxidation, PeakKind::Reduction] {
            for index in self.candidates(kind, current, &thresholds) {
                let peak = self.validate(kind, index, voltage, current, &scan, &thresholds);
                if let Some(reason) = &peak.rejection_reason {
                    debug!(
                        "rejected {kind} candidate at {:.3} V ({:.1}%): {reason}",
                        peak.voltage, peak.confidence
                    );
                }
                if peak.is_accepted() {
                    peaks.push(peak);
                } else {
                    rejected.push(peak);
                }
            }
        }
        peaks.sort_by_key(|peak| peak.index);
        rejected.sort_by_key(|peak| peak.index);

        Ok(Detection {
            peaks,
            rejected,
            thresholds,
            scan,
        })
    }

    /// Fused candidate indices for one peak type
    fn candidates(&self, kind: PeakKind, current: &[f64], thresholds: &Thresholds) -> Vec<usize> {
        let signal = current.iter().map(|i| kind.sign() * i).collect_vec();
        let baseline = kind.sign() * thresholds.baseline;
        let relaxed = thresholds.relaxed(self.config.recall_factor);
        let radius = self.config.window_radius.max(1);

        let by_prominence = prominence_candidates(&signal, baseline, &relaxed);
        let by_window = window_candidates(&signal, baseline, &relaxed, radius);
        let by_gradient = gradient_candidates(&signal, baseline, &relaxed, radius);
        debug!(
            "{kind} candidates: {} by prominence, {} by window, {} by gradient",
            by_prominence.len(),
            by_window.len(),
            by_gradient.len()
        );

        let union: BTreeSet<usize> = by_prominence
            .into_iter()
            .chain(by_window)
            .chain(by_gradient)
            .collect();

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let merge_distance = thresholds.width.round().max(1.0) as usize;
        merge_clusters(&union, &signal, merge_distance)
    }

    fn validate(
        &self,
        kind: PeakKind,
        index: usize,
        voltage: &[f64],
        current: &[f64],
        scan: &ScanDirection,
        thresholds: &Thresholds,
    ) -> Peak {
        let config = &self.config;
        let penalties = &config.penalties;
        let branch = scan.branch_of(index);
        let span = scan.range_of(branch);
        let (v, i) = (voltage[index], current[index]);

        let baseline = self.local_baseline(index, voltage, current, span.clone(), thresholds);
        let mut score = 100.0;
        let mut violations = vec![];

        let window = match kind {
            PeakKind::Oxidation => config.oxidation_window,
            PeakKind::Reduction => config.reduction_window,
        };
        if !window.contains(v) {
            score *= penalties.outside_window;
            violations.push(outside_window_reason(kind, v, window));
        }

        if kind.sign() * (i - baseline) <= 0.0 {
            score *= penalties.wrong_side;
            let side = match kind {
                PeakKind::Oxidation => "at or below",
                PeakKind::Reduction => "at or above",
            };
            violations.push(format!(
                "current {i:.4} µA {side} local baseline {baseline:.4} µA"
            ));
        }

        let height = (i - baseline).abs();
        let min_height = config.min_height_fraction * thresholds.range;
        if height < min_height {
            score *= penalties.low_height;
            violations.push(format!(
                "height {height:.4} µA below minimum {min_height:.4} µA"
            ));
        }

        let snr = height / thresholds.noise;
        if snr < config.min_snr {
            score *= penalties.low_snr;
            violations.push(format!("snr {snr:.2} below minimum {:.2}", config.min_snr));
        }

        let shape_score = shape_score(kind, index, current, &span, config.shape_window);
        if shape_score < config.min_shape_score {
            score *= penalties.poor_shape;
            violations.push(format!(
                "not a local extremum (shape score {shape_score:.2})"
            ));
        }

        let confidence = f64::clamp(score, 0.0, 100.0);
        let rejection_reason = (confidence < config.confidence_threshold).then(|| {
            if violations.is_empty() {
                format!(
                    "confidence {confidence:.1} below threshold {:.1}",
                    config.confidence_threshold
                )
            } else {
                violations.join("; ")
            }
        });

        Peak {
            kind,
            voltage: v,
            current: i,
            index,
            confidence,
            shape_score,
            baseline,
            branch,
            rejection_reason,
        }
    }

    /// Median current of the same branch in a band of voltages around, but not at, the candidate
    fn local_baseline(
        &self,
        index: usize,
        voltage: &[f64],
        current: &[f64],
        span: Range<usize>,
        thresholds: &Thresholds,
    ) -> f64 {
        let tolerance = self.config.local_baseline_tolerance;
        let outer = tolerance + self.config.local_baseline_window;
        let centre = voltage[index];

        let distant = span
            .map(|jj| ((voltage[jj] - centre).abs(), current[jj]))
            .filter(|(dv, _)| *dv > tolerance)
            .collect_vec();
        let band = distant
            .iter()
            .filter(|(dv, _)| *dv <= outer)
            .map(|(_, i)| *i)
            .collect_vec();

        if band.len() >= 3 {
            return median(&band).unwrap_or(thresholds.baseline);
        }
        let distant = distant.into_iter().map(|(_, i)| i).collect_vec();
        median(&distant).unwrap_or(thresholds.baseline)
    }
}

fn outside_window_reason(kind: PeakKind, voltage: f64, window: VoltageWindow) -> String {
    format!(
        "voltage {voltage:.3} V outside {kind} window [{:.3}, {:.3}] V",
        window.min, window.max
    )
}

/// Relative position of the candidate within the min/max of its neighbourhood
///
/// 1.0 means the candidate is the extremum of its window in the direction of its peak type.
fn shape_score(
    kind: PeakKind,
    index: usize,
    current: &[f64],
    span: &Range<usize>,
    half_window: usize,
) -> f64 {
    let lo = index.saturating_sub(half_window).max(span.start);
    let hi = (index + half_window + 1).min(span.end).max(index + 1);
    let Some((min, max)) = min_max(&current[lo..hi]) else {
        return 0.0;
    };
    if max - min <= 0.0 {
        return 0.0;
    }
    match kind {
        PeakKind::Oxidation => (current[index] - min) / (max - min),
        PeakKind::Reduction => (max - current[index]) / (max - min),
    }
}

/// Strict local maxima that pass prominence, height and half-prominence width thresholds
pub(crate) fn prominence_candidates(
    signal: &[f64],
    baseline: f64,
    thresholds: &Thresholds,
) -> Vec<usize> {
    if signal.len() < 3 {
        return vec![];
    }
    (1..signal.len() - 1)
        .filter(|&ii| signal[ii] > signal[ii - 1] && signal[ii] > signal[ii + 1])
        .filter(|&ii| signal[ii] - baseline >= thresholds.height)
        .filter(|&ii| {
            let prominence = prominence(signal, ii);
            prominence >= thresholds.prominence
                && width_at(signal, ii, signal[ii] - prominence / 2.0) >= thresholds.width
        })
        .collect()
}

/// Samples strictly greater than every other sample within `radius`
pub(crate) fn window_candidates(
    signal: &[f64],
    baseline: f64,
    thresholds: &Thresholds,
    radius: usize,
) -> Vec<usize> {
    if signal.len() <= 2 * radius {
        return vec![];
    }
    (radius..signal.len() - radius)
        .filter(|&ii| {
            let window = &signal[ii - radius..=ii + radius];
            let others_below = window
                .iter()
                .enumerate()
                .all(|(jj, s)| jj == radius || *s < signal[ii]);
            let floor = window.iter().copied().fold(f64::INFINITY, f64::min);
            others_below
                && signal[ii] - floor >= thresholds.prominence
                && signal[ii] - baseline >= thresholds.height
        })
        .collect()
}

/// Positive-to-negative sign changes of the forward difference
pub(crate) fn gradient_candidates(
    signal: &[f64],
    baseline: f64,
    thresholds: &Thresholds,
    radius: usize,
) -> Vec<usize> {
    if signal.len() < 3 {
        return vec![];
    }
    let diffs = signal.iter().tuple_windows().map(|(a, b)| b - a).collect_vec();
    (1..signal.len() - 1)
        .filter(|&ii| diffs[ii - 1] > 0.0 && diffs[ii] < 0.0)
        .filter(|&ii| signal[ii] - baseline >= thresholds.height)
        .filter(|&ii| {
            let lo = ii.saturating_sub(radius);
            let hi = (ii + radius + 1).min(signal.len());
            let floor = signal[lo..hi].iter().copied().fold(f64::INFINITY, f64::min);
            signal[ii] - floor >= thresholds.prominence
        })
        .collect()
}

/// Height of a maximum above the higher of the lowest points on either side before the signal
/// climbs above it again
fn prominence(signal: &[f64], peak: usize) -> f64 {
    let height = signal[peak];
    let left_min = signal[..peak]
        .iter()
        .rev()
        .take_while(|s| **s <= height)
        .copied()
        .fold(height, f64::min);
    let right_min = signal[peak + 1..]
        .iter()
        .take_while(|s| **s <= height)
        .copied()
        .fold(height, f64::min);
    height - left_min.max(right_min)
}

/// Width in samples of the peak at `level`, interpolating the crossings
#[allow(clippy::cast_precision_loss)]
fn width_at(signal: &[f64], peak: usize, level: f64) -> f64 {
    let mut left = peak;
    while left > 0 && signal[left] > level {
        left -= 1;
    }
    let left_pos = if signal[left] <= level && left < peak {
        left as f64 + (level - signal[left]) / (signal[left + 1] - signal[left])
    } else {
        left as f64
    };

    let last = signal.len() - 1;
    let mut right = peak;
    while right < last && signal[right] > level {
        right += 1;
    }
    let right_pos = if signal[right] <= level && right > peak {
        right as f64 - (level - signal[right]) / (signal[right - 1] - signal[right])
    } else {
        right as f64
    };

    right_pos - left_pos
}

/// Collapse candidates closer than `distance` samples to their most extreme member
fn merge_clusters(candidates: &BTreeSet<usize>, signal: &[f64], distance: usize) -> Vec<usize> {
    let mut merged: Vec<usize> = vec![];
    let mut previous: Option<usize> = None;
    for &index in candidates {
        match (previous, merged.last_mut()) {
            (Some(prev), Some(kept)) if index - prev <= distance => {
                if signal[index] > signal[*kept] {
                    *kept = index;
                }
            }
            _ => merged.push(index),
        }
        previous = Some(index);
    }
    merged
}
