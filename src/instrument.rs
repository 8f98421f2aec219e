//! Linear cross-calibration of current readings between two instruments.
//!
//! Each fit maps reference-instrument currents onto target-instrument currents with a gain and
//! offset, stored per measurement condition. Lookups that find no trustworthy record fall back to
//! the mean of every stored record, then to the configured default.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use itertools::Itertools;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::InstrumentConfig;
use crate::math::{interpolate, linear_fit, linspace, mean, min_max};
use crate::trace::Trace;
use crate::{Error, Result};

/// Measurement condition a calibration applies to
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionKey {
    /// Analyte concentration (mM)
    pub concentration: f64,
    /// Sweep rate (mV/s)
    pub scan_rate: f64,
}

impl ConditionKey {
    #[must_use]
    pub const fn new(concentration: f64, scan_rate: f64) -> Self {
        Self {
            concentration,
            scan_rate,
        }
    }
}

impl fmt::Display for ConditionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}mM_{}mVs", self.concentration, self.scan_rate)
    }
}

impl FromStr for ConditionKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed =
            || Error::InvalidCondition(format!("`{s}` is not of the form `<c>mM_<s>mVs`"));
        let (concentration, scan_rate) = s
            .strip_suffix("mVs")
            .and_then(|rest| rest.split_once("mM_"))
            .ok_or_else(malformed)?;
        Ok(Self {
            concentration: concentration.parse().map_err(|_| malformed())?,
            scan_rate: scan_rate.parse().map_err(|_| malformed())?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfidenceTier {
    Low,
    Medium,
    High,
}

impl ConfidenceTier {
    /// Tier of a fit with this r², or `None` below the lowest cut point
    #[must_use]
    pub fn classify(r_squared: f64, config: &InstrumentConfig) -> Option<Self> {
        if r_squared >= config.high_r_squared {
            Some(Self::High)
        } else if r_squared >= config.medium_r_squared {
            Some(Self::Medium)
        } else if r_squared >= config.low_r_squared {
            Some(Self::Low)
        } else {
            None
        }
    }
}

/// A stored linear map for one condition. The tier always agrees with the r².
#[derive(Clone, Debug, PartialEq)]
pub struct InstrumentCalibrationRecord {
    condition: ConditionKey,
    gain_factor: f64,
    offset: f64,
    r_squared: f64,
    rmse: f64,
    sample_size: usize,
    tier: ConfidenceTier,
}

impl InstrumentCalibrationRecord {
    #[must_use]
    pub const fn condition(&self) -> ConditionKey {
        self.condition
    }

    #[must_use]
    pub const fn gain_factor(&self) -> f64 {
        self.gain_factor
    }

    #[must_use]
    pub const fn offset(&self) -> f64 {
        self.offset
    }

    #[must_use]
    pub const fn r_squared(&self) -> f64 {
        self.r_squared
    }

    #[must_use]
    pub const fn rmse(&self) -> f64 {
        self.rmse
    }

    #[must_use]
    pub const fn sample_size(&self) -> usize {
        self.sample_size
    }

    #[must_use]
    pub const fn tier(&self) -> ConfidenceTier {
        self.tier
    }

    /// Replace the r² and recompute the tier
    ///
    /// # Errors
    /// - [`Error::InstrumentFitRejected`] if the new r² falls below every tier; the record is
    ///   left unchanged
    pub fn set_r_squared(&mut self, r_squared: f64, config: &InstrumentConfig) -> Result<()> {
        self.tier = ConfidenceTier::classify(r_squared, config).ok_or_else(|| {
            Error::InstrumentFitRejected {
                condition: self.condition.to_string(),
                r_squared,
                minimum: config.low_r_squared,
            }
        })?;
        self.r_squared = r_squared;
        Ok(())
    }

    #[must_use]
    pub fn calibrate(&self, value: f64) -> f64 {
        self.gain_factor.mul_add(value, self.offset)
    }
}

/// One row of the persisted calibration table
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTableEntry {
    pub gain_factor: f64,
    pub offset: f64,
    pub r_squared: f64,
    pub sample_size: usize,
    /// Fit RMSE; tables written without it load as zero
    #[serde(default)]
    pub rmse: f64,
}

/// Calibration table keyed by `"<c>mM_<s>mVs"`
pub type CalibrationTable = BTreeMap<String, CalibrationTableEntry>;

#[derive(Clone, Debug, Default)]
pub struct InstrumentCalibrator {
    config: InstrumentConfig,
    records: BTreeMap<String, InstrumentCalibrationRecord>,
}

impl InstrumentCalibrator {
    #[must_use]
    pub const fn new(config: InstrumentConfig) -> Self {
        Self {
            config,
            records: BTreeMap::new(),
        }
    }

    /// Fit `target ≈ gain · reference + offset` and store it under `condition`
    ///
    /// Arrays of different length are resampled onto a common normalised index grid.
    ///
    /// # Errors
    /// - [`Error::InsufficientData`] with fewer than two samples or no spread in `reference`
    /// - [`Error::InstrumentFitRejected`] if the fit is too poor to store
    pub fn fit(
        &mut self,
        reference: &[f64],
        target: &[f64],
        condition: ConditionKey,
    ) -> Result<&InstrumentCalibrationRecord> {
        if reference.len() == target.len() {
            return self.store_fit(reference, target, condition);
        }
        let len = reference.len().min(target.len());
        let (reference, target) = (resample(reference, len), resample(target, len));
        self.store_fit(&reference, &target, condition)
    }

    /// Fit two voltage-indexed curves by interpolating both onto their overlapping voltage range
    ///
    /// Each curve is sorted by voltage first, so this suits single sweeps or branch-averaged data.
    ///
    /// # Errors
    /// - [`Error::InsufficientData`] if the voltage ranges do not overlap
    /// - anything [`Self::fit`] returns
    pub fn fit_curves(
        &mut self,
        reference: &Trace,
        target: &Trace,
        condition: ConditionKey,
    ) -> Result<&InstrumentCalibrationRecord> {
        let (ref_v, ref_i) = sorted_by_voltage(reference);
        let (tgt_v, tgt_i) = sorted_by_voltage(target);
        let (Some((ref_lo, ref_hi)), Some((tgt_lo, tgt_hi))) = (min_max(&ref_v), min_max(&tgt_v))
        else {
            return Err(Error::InsufficientData(format!("empty curve for {condition}")));
        };

        let (lo, hi) = (ref_lo.max(tgt_lo), ref_hi.min(tgt_hi));
        if hi <= lo {
            return Err(Error::InsufficientData(format!(
                "voltage ranges of the two curves for {condition} do not overlap"
            )));
        }

        let grid = linspace(lo, hi, ref_v.len().min(tgt_v.len()));
        let on_grid = |xs: &[f64], ys: &[f64]| {
            grid.iter()
                .filter_map(|&v| interpolate(xs, ys, v))
                .collect_vec()
        };
        let (reference, target) = (on_grid(&ref_v, &ref_i), on_grid(&tgt_v, &tgt_i));
        self.store_fit(&reference, &target, condition)
    }

    fn store_fit(
        &mut self,
        reference: &[f64],
        target: &[f64],
        condition: ConditionKey,
    ) -> Result<&InstrumentCalibrationRecord> {
        let fit = linear_fit(reference, target).ok_or_else(|| {
            Error::InsufficientData(format!(
                "{} paired samples with no spread cannot calibrate {condition}",
                reference.len()
            ))
        })?;

        let Some(tier) = ConfidenceTier::classify(fit.r_squared, &self.config) else {
            warn!(
                "rejecting calibration for {condition}: r² {:.3} below {:.3}",
                fit.r_squared, self.config.low_r_squared
            );
            return Err(Error::InstrumentFitRejected {
                condition: condition.to_string(),
                r_squared: fit.r_squared,
                minimum: self.config.low_r_squared,
            });
        };

        info!(
            "calibrated {condition}: gain {:.6}, offset {:.3e}, r² {:.4} ({tier:?})",
            fit.slope, fit.intercept, fit.r_squared
        );
        let record = InstrumentCalibrationRecord {
            condition,
            gain_factor: fit.slope,
            offset: fit.intercept,
            r_squared: fit.r_squared,
            rmse: fit.rmse,
            sample_size: reference.len(),
            tier,
        };
        Ok(match self.records.entry(condition.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.insert(record);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(record),
        })
    }

    #[must_use]
    pub fn record(&self, condition: &ConditionKey) -> Option<&InstrumentCalibrationRecord> {
        self.records.get(&condition.to_string())
    }

    pub fn records(&self) -> impl Iterator<Item = &InstrumentCalibrationRecord> {
        self.records.values()
    }

    /// Gain and offset used when no stored record applies
    #[must_use]
    pub fn default_map(&self) -> (f64, f64) {
        let gains = self.records.values().map(|r| r.gain_factor).collect_vec();
        let offsets = self.records.values().map(|r| r.offset).collect_vec();
        match (mean(&gains), mean(&offsets)) {
            (Some(gain), Some(offset)) => (gain, offset),
            _ => (self.config.default_gain, self.config.default_offset),
        }
    }

    /// Gain and offset for `condition`: its own record if trustworthy, otherwise the default map
    #[must_use]
    pub fn map_for(&self, condition: Option<&ConditionKey>) -> (f64, f64) {
        let exact = condition
            .and_then(|condition| self.record(condition))
            .filter(|record| record.r_squared >= self.config.min_apply_r_squared);
        if let Some(record) = exact {
            return (record.gain_factor, record.offset);
        }
        let fallback = self.default_map();
        debug!(
            "no usable calibration for {}, using gain {:.6} offset {:.3e}",
            condition.map_or_else(|| "<unspecified>".to_owned(), ToString::to_string),
            fallback.0,
            fallback.1
        );
        fallback
    }

    #[must_use]
    pub fn apply(&self, value: f64, condition: Option<&ConditionKey>) -> f64 {
        let (gain, offset) = self.map_for(condition);
        gain.mul_add(value, offset)
    }

    #[must_use]
    pub fn apply_values(&self, values: &[f64], condition: Option<&ConditionKey>) -> Vec<f64> {
        let (gain, offset) = self.map_for(condition);
        values.iter().map(|value| gain.mul_add(*value, offset)).collect()
    }

    /// Calibrate every current sample of `trace`; voltages pass through unchanged
    ///
    /// # Errors
    /// - [`Error::InvalidTrace`] if calibration produces non-finite currents
    pub fn apply_curve(&self, trace: &Trace, condition: Option<&ConditionKey>) -> Result<Trace> {
        Trace::new(
            trace.voltage().to_vec(),
            self.apply_values(trace.current(), condition),
            trace.label().map(str::to_owned),
        )
    }

    #[must_use]
    pub fn export_table(&self) -> CalibrationTable {
        self.records
            .iter()
            .map(|(key, record)| {
                (
                    key.clone(),
                    CalibrationTableEntry {
                        gain_factor: record.gain_factor,
                        offset: record.offset,
                        r_squared: record.r_squared,
                        sample_size: record.sample_size,
                        rmse: record.rmse,
                    },
                )
            })
            .collect()
    }

    /// Load records from a table, recomputing each tier from its r²
    ///
    /// Entries below the lowest tier are skipped. Nothing is stored unless every key parses.
    /// Returns the number of records loaded.
    ///
    /// # Errors
    /// - [`Error::InvalidCondition`] if a key is not a `<c>mM_<s>mVs` condition
    pub fn import_table(&mut self, table: &CalibrationTable) -> Result<usize> {
        let mut parsed = Vec::with_capacity(table.len());
        for (key, entry) in table {
            let condition: ConditionKey = key.parse()?;
            let Some(tier) = ConfidenceTier::classify(entry.r_squared, &self.config) else {
                warn!("skipping table entry {key}: r² {:.3} below every tier", entry.r_squared);
                continue;
            };
            parsed.push(InstrumentCalibrationRecord {
                condition,
                gain_factor: entry.gain_factor,
                offset: entry.offset,
                r_squared: entry.r_squared,
                rmse: entry.rmse,
                sample_size: entry.sample_size,
                tier,
            });
        }

        let loaded = parsed.len();
        self.records.extend(
            parsed
                .into_iter()
                .map(|record| (record.condition.to_string(), record)),
        );
        info!("imported {loaded} calibration records");
        Ok(loaded)
    }
}

/// Linearly resample `values` to `len` points over the same normalised index span
#[allow(clippy::cast_precision_loss)]
fn resample(values: &[f64], len: usize) -> Vec<f64> {
    if values.len() == len {
        return values.to_vec();
    }
    let positions = linspace(0.0, 1.0, values.len());
    linspace(0.0, 1.0, len)
        .into_iter()
        .filter_map(|t| interpolate(&positions, values, t))
        .collect()
}

fn sorted_by_voltage(trace: &Trace) -> (Vec<f64>, Vec<f64>) {
    trace
        .voltage()
        .iter()
        .copied()
        .zip(trace.current().iter().copied())
        .sorted_by(|a, b| a.0.total_cmp(&b.0))
        .unzip()
}

#[cfg(test)]
mod test {
    use super::{ConditionKey, ConfidenceTier, InstrumentCalibrator};
    use crate::config::InstrumentConfig;
    use crate::{Error, Result};

    #[test]
    fn condition_keys_round_trip_through_their_string_form() -> Result<()> {
        let key = ConditionKey::new(0.5, 100.0);
        assert_eq!(key.to_string(), "0.5mM_100mVs");
        assert_eq!("0.5mM_100mVs".parse::<ConditionKey>()?, key);
        assert!("fast".parse::<ConditionKey>().is_err());
        Ok(())
    }

    #[test]
    fn tiers_follow_the_cut_points() {
        let config = InstrumentConfig::default();
        assert_eq!(ConfidenceTier::classify(0.95, &config), Some(ConfidenceTier::High));
        assert_eq!(ConfidenceTier::classify(0.6, &config), Some(ConfidenceTier::High));
        assert_eq!(ConfidenceTier::classify(0.45, &config), Some(ConfidenceTier::Medium));
        assert_eq!(ConfidenceTier::classify(0.3, &config), Some(ConfidenceTier::Low));
        assert_eq!(ConfidenceTier::classify(0.29, &config), None);
    }

    #[test]
    fn changing_r_squared_recomputes_the_tier() -> Result<()> {
        let config = InstrumentConfig::default();
        let mut calibrator = InstrumentCalibrator::new(config.clone());
        let key = ConditionKey::new(1.0, 50.0);
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        let b = [2.1, 3.9, 6.2, 7.8, 10.1];
        let mut record = calibrator.fit(&a, &b, key)?.clone();
        assert_eq!(record.tier(), ConfidenceTier::High);

        record.set_r_squared(0.42, &config)?;
        assert_eq!(record.tier(), ConfidenceTier::Medium);
        assert!(record.set_r_squared(0.1, &config).is_err());
        assert_eq!(record.tier(), ConfidenceTier::Medium);
        Ok(())
    }

    #[test]
    fn uncorrelated_readings_are_not_stored() {
        let mut calibrator = InstrumentCalibrator::default();
        let key = ConditionKey::new(1.0, 50.0);
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [1.0, -1.0, 1.0, -1.0, 1.0, -1.0];

        let result = calibrator.fit(&a, &b, key);
        assert!(matches!(result, Err(Error::InstrumentFitRejected { .. })));
        assert!(calibrator.record(&key).is_none());
    }

    #[test]
    fn unknown_conditions_use_the_mean_of_stored_maps() -> Result<()> {
        let mut calibrator = InstrumentCalibrator::default();
        approx::assert_relative_eq!(calibrator.apply(3.0, None), 3.0);

        let a = [0.0, 1.0, 2.0, 3.0];
        let doubled = a.map(|x| 2.0 * x + 1.0);
        let quadrupled = a.map(|x| 4.0 * x - 1.0);
        calibrator.fit(&a, &doubled, ConditionKey::new(1.0, 50.0))?;
        calibrator.fit(&a, &quadrupled, ConditionKey::new(2.0, 50.0))?;

        let unknown = ConditionKey::new(9.0, 10.0);
        approx::assert_relative_eq!(calibrator.apply(1.0, Some(&unknown)), 3.0, epsilon = 1e-12);
        approx::assert_relative_eq!(
            calibrator.apply(2.0, Some(&ConditionKey::new(2.0, 50.0))),
            7.0,
            epsilon = 1e-12
        );
        Ok(())
    }

    #[test]
    fn different_lengths_are_resampled() -> Result<()> {
        let mut calibrator = InstrumentCalibrator::default();
        let a = crate::math::linspace(0.0, 1.0, 11);
        let b = crate::math::linspace(0.0, 1.0, 21)
            .into_iter()
            .map(|x| 3.0 * x + 0.5)
            .collect::<Vec<_>>();

        let record = calibrator.fit(&a, &b, ConditionKey::new(1.0, 100.0))?;
        approx::assert_relative_eq!(record.gain_factor(), 3.0, epsilon = 1e-9);
        approx::assert_relative_eq!(record.offset(), 0.5, epsilon = 1e-9);
        assert_eq!(record.sample_size(), 11);
        Ok(())
    }

    #[test]
    fn table_import_skips_untrustworthy_entries() -> Result<()> {
        let mut source = InstrumentCalibrator::default();
        let a = [1.0, 2.0, 3.0, 4.0];
        source.fit(&a, &a.map(|x| 1.5 * x), ConditionKey::new(1.0, 20.0))?;
        let mut table = source.export_table();
        let mut poor = table["1mM_20mVs"].clone();
        poor.r_squared = 0.1;
        table.insert("5mM_20mVs".to_owned(), poor);

        let mut restored = InstrumentCalibrator::default();
        assert_eq!(restored.import_table(&table)?, 1);
        let record = restored.record(&ConditionKey::new(1.0, 20.0)).unwrap();
        assert_eq!(record.tier(), ConfidenceTier::High);
        approx::assert_relative_eq!(record.gain_factor(), 1.5, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn a_malformed_key_imports_nothing() -> Result<()> {
        let mut source = InstrumentCalibrator::default();
        let a = [1.0, 2.0, 3.0, 4.0];
        source.fit(&a, &a.map(|x| 2.0 * x), ConditionKey::new(1.0, 50.0))?;
        let mut table = source.export_table();
        let entry = table["1mM_50mVs"].clone();
        table.insert("zz-bad-key".to_owned(), entry);

        let mut restored = InstrumentCalibrator::default();
        assert!(matches!(
            restored.import_table(&table),
            Err(Error::InvalidCondition(_))
        ));
        assert_eq!(restored.records().count(), 0);
        approx::assert_relative_eq!(
            restored.apply(1.0, Some(&ConditionKey::new(1.0, 50.0))),
            1.0
        );
        Ok(())
    }

    #[test]
    fn exported_tables_keep_the_fit_rmse() -> Result<()> {
        let mut source = InstrumentCalibrator::default();
        let key = ConditionKey::new(1.0, 50.0);
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        let b = [2.1, 3.9, 6.2, 7.8, 10.1];
        let rmse = source.fit(&a, &b, key)?.rmse();
        assert!(rmse > 0.0);

        let mut restored = InstrumentCalibrator::default();
        restored.import_table(&source.export_table())?;
        approx::assert_relative_eq!(restored.record(&key).unwrap().rmse(), rmse);

        let legacy: super::CalibrationTableEntry =
            toml::from_str("gain_factor = 2.0\noffset = 0.0\nr_squared = 0.9\nsample_size = 4")?;
        approx::assert_relative_eq!(legacy.rmse, 0.0);
        Ok(())
    }

    #[test]
    fn records_below_the_apply_threshold_use_the_default_map() -> Result<()> {
        let config = InstrumentConfig {
            min_apply_r_squared: 0.95,
            ..InstrumentConfig::default()
        };
        let mut calibrator = InstrumentCalibrator::new(config);
        let a = (1..=10).map(f64::from).collect::<Vec<_>>();
        let noisy = a
            .iter()
            .enumerate()
            .map(|(ii, x)| 2.0 * x + if ii % 2 == 0 { 1.5 } else { -1.5 })
            .collect::<Vec<_>>();
        let exact = a.iter().map(|x| 4.0 * x).collect::<Vec<_>>();

        let weak_key = ConditionKey::new(1.0, 50.0);
        let record = calibrator.fit(&a, &noisy, weak_key)?.clone();
        assert!(record.r_squared() > 0.6 && record.r_squared() < 0.95);
        assert_eq!(record.tier(), ConfidenceTier::High);
        let strong_key = ConditionKey::new(2.0, 50.0);
        calibrator.fit(&a, &exact, strong_key)?;

        let (gain, offset) = calibrator.default_map();
        let applied = calibrator.apply(1.0, Some(&weak_key));
        approx::assert_relative_eq!(applied, gain + offset, epsilon = 1e-12);
        assert!((applied - record.calibrate(1.0)).abs() > 0.5);
        approx::assert_relative_eq!(calibrator.apply(1.0, Some(&strong_key)), 4.0, epsilon = 1e-9);
        Ok(())
    }
}
