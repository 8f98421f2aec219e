use thiserror::Error;

/// Failures surfaced by the analysis and calibration pipeline.
///
/// "No peaks" and "no baseline" are not errors: detection and feature extraction return explicit
/// empty results instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("invalid trace: {0}")]
    InvalidTrace(String),
    #[error("no calibration model has been trained")]
    ModelNotTrained,
    #[error("model `{0}` not found")]
    ModelNotFound(String),
    #[error("feature `{feature}` cannot be aligned to the model schema: {reason}")]
    FeatureMismatch { feature: String, reason: String },
    #[error("calibration point rejected: quality {quality:.1} below minimum {minimum:.1}")]
    CalibrationPointRejected { quality: f64, minimum: f64 },
    #[error("instrument fit for `{condition}` rejected: r² {r_squared:.3} below {minimum:.3}")]
    InstrumentFitRejected {
        condition: String,
        r_squared: f64,
        minimum: f64,
    },
    #[error("invalid condition key: {0}")]
    InvalidCondition(String),
    #[error("latent component {component} has vanishing norm")]
    DegenerateComponent { component: usize },
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
    #[error("linear algebra failure: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),
    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),
}
