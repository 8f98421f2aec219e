use ndarray_rand::rand::SeedableRng;
use proptest::prelude::*;
use rand_isaac::Isaac64Rng;

use voltammetry::math::linspace;
use voltammetry::peaks::{PeakDetector, PeakKind};
use voltammetry::synthetic::SyntheticCv;
use voltammetry::{Analyzer, Result, FEATURE_NAMES};

#[test]
fn synthetic_cycle_yields_one_peak_of_each_kind_at_the_expected_potentials() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut rng = Isaac64Rng::seed_from_u64(40);
    let analyzer = Analyzer::default();

    for concentration in [0.5, 2.0, 10.0] {
        let trace = SyntheticCv::default().generate(concentration, &mut rng)?;
        let analysis = analyzer.analyze(&trace)?;

        let oxidation = analysis.detection.best(PeakKind::Oxidation).expect("oxidation peak");
        let reduction = analysis.detection.best(PeakKind::Reduction).expect("reduction peak");
        approx::assert_relative_eq!(oxidation.voltage, 0.24, epsilon = 0.01);
        approx::assert_relative_eq!(reduction.voltage, 0.12, epsilon = 0.01);
        assert!(oxidation.index < 201 && reduction.index > 200);

        let features = &analysis.features;
        approx::assert_relative_eq!(features.peak_separation, 0.12, epsilon = 0.02);
        assert!(features.oxidation_height > 0.0 && features.reduction_height > 0.0);
        assert_eq!(features.to_vec().len(), FEATURE_NAMES.len());
    }
    Ok(())
}

#[test]
fn noisy_single_sweep_keeps_one_oxidation_peak() -> Result<()> {
    let mut rng = Isaac64Rng::seed_from_u64(40);
    let generator = SyntheticCv {
        points_per_sweep: 401,
        vertex_voltage: 0.6,
        oxidation_potential: 0.2,
        reduction_ratio: 0.0,
        capacitive_current: 0.05,
        noise_std: 5e-4,
        ..SyntheticCv::default()
    };
    let cycle = generator.generate(2.5, &mut rng)?;
    // Forward sweep only
    let voltage = &cycle.voltage()[..401];
    let current = &cycle.current()[..401];

    let detection = PeakDetector::default().detect(voltage, current)?;
    let oxidation = detection
        .peaks
        .iter()
        .filter(|peak| peak.kind == PeakKind::Oxidation)
        .collect::<Vec<_>>();

    assert_eq!(oxidation.len(), 1);
    approx::assert_relative_eq!(oxidation[0].voltage, 0.2, epsilon = 0.01);
    assert!(oxidation[0].confidence >= 50.0);
    assert!(detection.peaks.iter().all(|peak| peak.kind != PeakKind::Reduction));
    Ok(())
}

proptest! {
    #[test]
    fn detection_partitions_candidates_by_confidence(
        current in prop::collection::vec(-10.0f64..10.0, 20..200),
    ) {
        let voltage = linspace(-0.2, 0.6, current.len());
        let detector = PeakDetector::default();
        let detection = detector.detect(&voltage, &current).unwrap();

        for peak in &detection.peaks {
            prop_assert!(peak.confidence >= 50.0);
            prop_assert!(peak.rejection_reason.is_none());
        }
        for peak in &detection.rejected {
            prop_assert!(peak.confidence < 50.0);
            prop_assert!(peak.rejection_reason.is_some());
        }
        for peak in detection.peaks.iter().chain(&detection.rejected) {
            prop_assert!((0.0..=100.0).contains(&peak.confidence));
            prop_assert!((0.0..=1.0).contains(&peak.shape_score));
            prop_assert!(peak.index < current.len());
        }
        prop_assert!(detection.peaks.windows(2).all(|w| w[0].index <= w[1].index));
    }
}
