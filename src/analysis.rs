//! The detection, baseline and feature stages chained over one trace.

use log::{info, warn};

use crate::baseline::{BaselineEstimate, BaselineEstimator};
use crate::config::Config;
use crate::features::{FeatureExtractor, FeatureVector};
use crate::peaks::{Detection, Peak, PeakDetector};
use crate::trace::Trace;
use crate::Result;

/// Everything learned about one trace
#[derive(Clone, Debug)]
pub struct TraceAnalysis {
    pub label: Option<String>,
    pub detection: Detection,
    pub baseline: BaselineEstimate,
    pub features: FeatureVector,
}

impl TraceAnalysis {
    #[must_use]
    pub fn peaks(&self) -> &[Peak] {
        &self.detection.peaks
    }

    #[must_use]
    pub fn rejected(&self) -> &[Peak] {
        &self.detection.rejected
    }

    /// Trace quality in `[0, 100]`, taken from the baseline quality
    #[must_use]
    pub fn quality_score(&self) -> f64 {
        (self.baseline.quality * 100.0).clamp(0.0, 100.0)
    }
}

/// Outcome of one item of a batch
#[derive(Debug)]
pub struct BatchItem<T> {
    pub label: Option<String>,
    pub outcome: Result<T>,
}

/// Per-item results of a batch; a failed item never prevents the others from running
#[derive(Debug)]
pub struct BatchReport<T> {
    pub items: Vec<BatchItem<T>>,
}

impl<T> BatchReport<T> {
    pub fn succeeded(&self) -> impl Iterator<Item = &T> {
        self.items.iter().filter_map(|item| item.outcome.as_ref().ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &BatchItem<T>> {
        self.items.iter().filter(|item| item.outcome.is_err())
    }

    #[must_use]
    pub fn success_count(&self) -> usize {
        self.succeeded().count()
    }

    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.failed().count()
    }

    /// Run `process` over every trace, logging each failure
    pub(crate) fn from_traces<'a, F>(
        stage: &str,
        traces: impl IntoIterator<Item = &'a Trace>,
        mut process: F,
    ) -> Self
    where
        F: FnMut(&Trace) -> Result<T>,
    {
        let items = traces
            .into_iter()
            .map(|trace| {
                let outcome = process(trace);
                if let Err(error) = &outcome {
                    warn!(
                        "{stage} of {} failed: {error}",
                        trace.label().unwrap_or("<unlabelled>")
                    );
                }
                BatchItem {
                    label: trace.label().map(str::to_owned),
                    outcome,
                }
            })
            .collect();

        let report = Self { items };
        info!(
            "{stage} batch: {} succeeded, {} failed",
            report.success_count(),
            report.failure_count()
        );
        report
    }
}

/// Caller-owned analysis context: peak detector, baseline estimator and feature extractor
/// configured once and reused for every trace.
#[derive(Clone, Debug, Default)]
pub struct Analyzer {
    detector: PeakDetector,
    baseline: BaselineEstimator,
    extractor: FeatureExtractor,
}

impl Analyzer {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            detector: PeakDetector::new(config.preprocess.clone(), config.peaks.clone()),
            baseline: BaselineEstimator::new(config.preprocess.clone(), config.baseline.clone()),
            extractor: FeatureExtractor::new(config.features.clone()),
        }
    }

    /// Detect peaks, estimate the baseline and extract features
    ///
    /// # Errors
    /// - [`crate::Error::InsufficientData`] if the trace is too short for peak detection
    pub fn analyze(&self, trace: &Trace) -> Result<TraceAnalysis> {
        let detection = self.detector.detect(trace.voltage(), trace.current())?;
        let baseline = self
            .baseline
            .estimate(trace.voltage(), trace.current(), &detection.peaks)?;
        let features =
            self.extractor
                .extract(trace, &detection.peaks, &baseline, &detection.thresholds);

        Ok(TraceAnalysis {
            label: trace.label().map(str::to_owned),
            detection,
            baseline,
            features,
        })
    }

    /// Analyse every trace, recording failures per item
    pub fn analyze_batch<'a>(
        &self,
        traces: impl IntoIterator<Item = &'a Trace>,
    ) -> BatchReport<TraceAnalysis> {
        BatchReport::from_traces("analysis", traces, |trace| self.analyze(trace))
    }
}

#[cfg(test)]
mod test {
    use super::Analyzer;
    use crate::config::Config;
    use crate::synthetic::SyntheticCv;
    use crate::trace::Trace;
    use crate::{Error, Result};

    use ndarray_rand::rand::SeedableRng;
    use rand_isaac::isaac64::Isaac64Rng;

    #[test]
    fn synthetic_trace_yields_both_peaks_and_a_full_baseline() -> Result<()> {
        let mut rng = Isaac64Rng::seed_from_u64(40);
        let trace = SyntheticCv::default().generate(2.0, &mut rng)?;
        let analysis = Analyzer::new(&Config::default()).analyze(&trace)?;

        let features = &analysis.features;
        assert!(features.oxidation_height > 3.5);
        assert!(features.reduction_height > 3.0);
        approx::assert_relative_eq!(features.peak_separation, 0.12, epsilon = 0.01);
        approx::assert_relative_eq!(analysis.quality_score(), 100.0);
        Ok(())
    }

    #[test]
    fn one_bad_trace_does_not_abort_the_batch() -> Result<()> {
        let mut rng = Isaac64Rng::seed_from_u64(40);
        let good = SyntheticCv::default().generate(1.0, &mut rng)?;
        let short = Trace::new(vec![0.0, 0.1, 0.2], vec![0.0, 1.0, 0.0], Some("short".into()))?;

        let report = Analyzer::default().analyze_batch([&good, &short, &good]);

        assert_eq!(report.items.len(), 3);
        assert_eq!(report.success_count(), 2);
        let failed = report.failed().collect::<Vec<_>>();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].label.as_deref(), Some("short"));
        assert!(matches!(failed[0].outcome, Err(Error::InsufficientData(_))));
        Ok(())
    }
}
