//! Synthetic cyclic voltammograms for tests and demonstrations.
//!
//! The only source of randomness in the crate; every call takes an explicit RNG so results are
//! reproducible from a seed.

use ndarray::Array1;
use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand_isaac::isaac64::Isaac64Rng;

use crate::math::linspace;
use crate::trace::Trace;
use crate::{Error, Result};

/// Shape of a generated cycle: a forward sweep to the vertex and back, with one Gaussian
/// oxidation peak on the forward sweep and one reduction peak on the reverse sweep.
#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticCv {
    pub start_voltage: f64,
    pub vertex_voltage: f64,
    pub points_per_sweep: usize,
    pub oxidation_potential: f64,
    pub reduction_potential: f64,
    /// Reduction peak height relative to the oxidation peak
    pub reduction_ratio: f64,
    /// Standard deviation of both peaks (V)
    pub peak_width: f64,
    /// Peak height per unit concentration (µA/µM)
    pub sensitivity: f64,
    /// Charging current, positive on the forward sweep and negative on the reverse
    pub capacitive_current: f64,
    pub noise_std: f64,
}

impl Default for SyntheticCv {
    fn default() -> Self {
        Self {
            start_voltage: -0.2,
            vertex_voltage: 0.6,
            points_per_sweep: 201,
            oxidation_potential: 0.24,
            reduction_potential: 0.12,
            reduction_ratio: 0.9,
            peak_width: 0.04,
            sensitivity: 2.0,
            capacitive_current: 0.5,
            noise_std: 2e-4,
        }
    }
}

impl SyntheticCv {
    /// Generate one cycle at `concentration`, labelled with it
    ///
    /// # Errors
    /// - [`Error::InvalidTrace`] if the noise level is negative or not finite
    pub fn generate<R: Rng>(&self, concentration: f64, rng: &mut R) -> Result<Trace> {
        let forward = linspace(self.start_voltage, self.vertex_voltage, self.points_per_sweep);
        let reverse = forward.iter().rev().skip(1).copied().collect::<Vec<_>>();

        let height = self.sensitivity * concentration;
        let gaussian = |v: f64, centre: f64| {
            (-(v - centre).powi(2) / (2.0 * self.peak_width.powi(2))).exp()
        };

        let forward_current = forward.iter().map(|&v| {
            self.capacitive_current + height * gaussian(v, self.oxidation_potential)
        });
        let reverse_current = reverse.iter().map(|&v| {
            -self.capacitive_current
                - self.reduction_ratio * height * gaussian(v, self.reduction_potential)
        });
        let clean = forward_current.chain(reverse_current).collect::<Array1<f64>>();

        let normal = Normal::new(0.0, self.noise_std)
            .map_err(|error| Error::InvalidTrace(format!("noise level: {error}")))?;
        let noise = Array1::random_using(clean.len(), normal, rng);

        let voltage = forward.into_iter().chain(reverse).collect();
        let current = (clean + noise).to_vec();
        Trace::new(voltage, current, Some(format!("synthetic_{concentration}uM")))
    }

    /// [`Self::generate`] with a fresh ISAAC-64 generator seeded from `seed`
    ///
    /// # Errors
    /// See [`Self::generate`].
    pub fn generate_seeded(&self, concentration: f64, seed: u64) -> Result<Trace> {
        self.generate(concentration, &mut Isaac64Rng::seed_from_u64(seed))
    }
}

#[cfg(test)]
mod test {
    use ndarray_rand::rand::SeedableRng;
    use rand_isaac::isaac64::Isaac64Rng;

    use super::SyntheticCv;
    use crate::Result;

    #[test]
    fn cycle_returns_to_its_start() -> Result<()> {
        let mut rng = Isaac64Rng::seed_from_u64(40);
        let trace = SyntheticCv::default().generate(1.0, &mut rng)?;

        assert_eq!(trace.len(), 401);
        approx::assert_relative_eq!(trace.voltage()[200], 0.6);
        approx::assert_relative_eq!(trace.voltage()[400], -0.2, epsilon = 1e-12);
        assert_eq!(trace.label(), Some("synthetic_1uM"));
        Ok(())
    }

    #[test]
    fn same_seed_gives_the_same_trace() -> Result<()> {
        let generator = SyntheticCv::default();
        let first = generator.generate(2.0, &mut Isaac64Rng::seed_from_u64(40))?;
        let second = generator.generate_seeded(2.0, 40)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn peak_height_scales_with_concentration() -> Result<()> {
        let generator = SyntheticCv {
            noise_std: 0.0,
            ..SyntheticCv::default()
        };
        let mut rng = Isaac64Rng::seed_from_u64(40);
        let trace = generator.generate(3.0, &mut rng)?;
        // 0.24 V sits on sample 110 of the forward sweep
        approx::assert_relative_eq!(trace.current()[110], 0.5 + 6.0, epsilon = 1e-9);
        Ok(())
    }
}
