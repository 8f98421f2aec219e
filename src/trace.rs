use log::warn;

use crate::{Error, Result};

/// A single cyclic-voltammetry recording: voltage in volts, current in microamps.
///
/// Constructed through [`Trace::new`], which guarantees equal lengths and finite samples. The
/// arrays are not mutable afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct Trace {
    voltage: Vec<f64>,
    current: Vec<f64>,
    label: Option<String>,
}

impl Trace {
    /// Validate and wrap a pair of sample arrays
    ///
    /// Samples where either value is non-finite are dropped pairwise, as long as they are a
    /// minority of the recording.
    ///
    /// # Errors
    /// - [`Error::InvalidTrace`] if the arrays differ in length or most samples are non-finite
    pub fn new(voltage: Vec<f64>, current: Vec<f64>, label: Option<String>) -> Result<Self> {
        if voltage.len() != current.len() {
            return Err(Error::InvalidTrace(format!(
                "voltage has {} samples but current has {}",
                voltage.len(),
                current.len()
            )));
        }

        let total = voltage.len();
        let non_finite = voltage
            .iter()
            .zip(&current)
            .filter(|(v, i)| !v.is_finite() || !i.is_finite())
            .count();

        if non_finite == 0 {
            return Ok(Self {
                voltage,
                current,
                label,
            });
        }

        if non_finite * 2 > total {
            return Err(Error::InvalidTrace(format!(
                "{non_finite} of {total} samples are not finite"
            )));
        }

        warn!(
            "dropping {non_finite} non-finite samples from trace {}",
            label.as_deref().unwrap_or("<unlabelled>")
        );
        let (voltage, current) = voltage
            .into_iter()
            .zip(current)
            .filter(|(v, i)| v.is_finite() && i.is_finite())
            .unzip();

        Ok(Self {
            voltage,
            current,
            label,
        })
    }

    #[must_use]
    pub fn voltage(&self) -> &[f64] {
        &self.voltage
    }

    #[must_use]
    pub fn current(&self) -> &[f64] {
        &self.current
    }

    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.voltage.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.voltage.is_empty()
    }
}
