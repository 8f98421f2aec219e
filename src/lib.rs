#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// #![warn(clippy::cargo)]

//! Cyclic-voltammetry analysis: peak detection, baseline estimation, feature extraction, PLS
//! concentration calibration and linear cross-instrument calibration.
//!
//! Everything operates on in-memory arrays. Reading traces, persisting models and installing a
//! logger are left to the caller.

extern crate blas_src;

pub mod analysis;
pub mod baseline;
pub mod calibration;
pub mod config;
mod error;
pub mod features;
pub mod instrument;
pub mod math;
pub mod peaks;
pub mod pls;
pub mod predict;
pub mod preprocess;
pub mod synthetic;
pub mod trace;

pub use analysis::{Analyzer, BatchItem, BatchReport, TraceAnalysis};
pub use calibration::{build, CalibrationPoint, CalibrationSet, ModelBuilder, PlsModel};
pub use config::Config;
pub use error::Error;
pub use features::{FeatureVector, FEATURE_NAMES};
pub use instrument::{ConditionKey, InstrumentCalibrator};
pub use predict::{ConcentrationPrediction, ModelRegistry, Predictor};
pub use trace::Trace;

pub type Result<T> = ::std::result::Result<T, Error>;
