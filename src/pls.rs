//! Single-response partial least squares regression.
//!
//! Latent components are extracted with NIPALS on standardised features. The regression
//! coefficients are expressed in the standardised space, so callers always pass rows through the
//! same [`Scaler`] the model was fitted with.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::Solve;
use serde::{Deserialize, Serialize};

use crate::math::{mean, outer_product, r_squared, std_dev};
use crate::{Error, Result};

/// Norms below this are treated as a vanishing latent component
const DEGENERATE_NORM: f64 = 1e-10;

/// Zero-mean, unit-variance scaling fitted once on training rows
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scaler {
    pub mean: Vec<f64>,
    /// Population standard deviation per column; constant columns scale by one
    pub scale: Vec<f64>,
}

impl Scaler {
    /// # Errors
    /// - [`Error::InsufficientData`] if `x` has no rows
    pub fn fit(x: &Array2<f64>) -> Result<Self> {
        if x.nrows() == 0 {
            return Err(Error::InsufficientData("cannot fit a scaler to zero rows".into()));
        }
        let (mean, scale): (Vec<f64>, Vec<f64>) = x
            .axis_iter(Axis(1))
            .map(|column| {
                let column = column.to_vec();
                let mu = mean(&column).unwrap_or(0.0);
                let sigma = std_dev(&column).unwrap_or(0.0);
                (mu, if sigma > 0.0 { sigma } else { 1.0 })
            })
            .unzip();
        Ok(Self { mean, scale })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mean.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }

    #[must_use]
    pub fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        let mut scaled = x.clone();
        for (mut column, (mu, sigma)) in scaled
            .axis_iter_mut(Axis(1))
            .zip(self.mean.iter().zip(&self.scale))
        {
            column.mapv_inplace(|value| (value - mu) / sigma);
        }
        scaled
    }

    #[must_use]
    pub fn transform_row(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(value, (mu, sigma))| (value - mu) / sigma)
            .collect()
    }
}

/// Fitted PLS1 model over standardised features
#[derive(Clone, Debug, PartialEq)]
pub struct PlsRegression {
    pub n_components: usize,
    /// One coefficient per standardised feature
    pub coefficients: Array1<f64>,
    pub intercept: f64,
}

impl PlsRegression {
    /// Fit `n_components` latent components of `x` (already standardised) against `y`
    ///
    /// # Errors
    /// - [`Error::InsufficientData`] if the shapes disagree or `n_components` is zero
    /// - [`Error::DegenerateComponent`] if a component has no remaining variance to explain
    /// - [`Error::Linalg`] if the rotation `PᵀW` cannot be inverted
    pub fn fit(x: &Array2<f64>, y: &Array1<f64>, n_components: usize) -> Result<Self> {
        let (n, p) = x.dim();
        if n != y.len() || n == 0 {
            return Err(Error::InsufficientData(format!(
                "{n} feature rows against {} responses",
                y.len()
            )));
        }
        if n_components == 0 || n_components > p {
            return Err(Error::InsufficientData(format!(
                "cannot extract {n_components} components from {p} features"
            )));
        }

        let y_mean = y.mean().unwrap_or(0.0);
        let mut x_residual = x.clone();
        let mut y_residual = y.mapv(|value| value - y_mean);

        let mut weights = Array2::<f64>::zeros((p, n_components));
        let mut loadings = Array2::<f64>::zeros((p, n_components));
        let mut y_loadings = Array1::<f64>::zeros(n_components);

        for component in 0..n_components {
            let w = x_residual.t().dot(&y_residual);
            let w_norm = w.dot(&w).sqrt();
            if w_norm < DEGENERATE_NORM {
                return Err(Error::DegenerateComponent { component });
            }
            let w = w / w_norm;

            let t = x_residual.dot(&w);
            let tt = t.dot(&t);
            if tt < DEGENERATE_NORM * DEGENERATE_NORM {
                return Err(Error::DegenerateComponent { component });
            }
            let loading = x_residual.t().dot(&t) / tt;
            let q = y_residual.dot(&t) / tt;

            x_residual = x_residual - outer_product(&t, &loading)?;
            y_residual = y_residual - &t * q;

            weights.column_mut(component).assign(&w);
            loadings.column_mut(component).assign(&loading);
            y_loadings[component] = q;
        }

        let rotation = loadings.t().dot(&weights).solve(&y_loadings)?;
        let coefficients = weights.dot(&rotation);

        Ok(Self {
            n_components,
            coefficients,
            intercept: y_mean,
        })
    }

    #[must_use]
    pub fn predict(&self, x: &Array2<f64>) -> Array1<f64> {
        x.dot(&self.coefficients) + self.intercept
    }

    #[must_use]
    pub fn predict_row(&self, row: ArrayView1<'_, f64>) -> f64 {
        row.dot(&self.coefficients) + self.intercept
    }
}

/// Out-of-fold predictions of a cross-validated fit
#[derive(Clone, Debug, PartialEq)]
pub struct CrossValidation {
    /// Predictive coefficient of determination, `1 - PRESS / SST`
    pub q_squared: f64,
    /// R² of each fold with at least two samples of differing response
    pub fold_r_squared: Vec<f64>,
    pub predictions: Array1<f64>,
}

/// Cross-validate a PLS fit of `n_components` on raw (unscaled) rows
///
/// Rows are dealt into `folds` interleaved folds (`row % folds`), so the split is deterministic.
/// Each training fold gets its own scaler.
///
/// # Errors
/// - [`Error::InsufficientData`] with fewer than two folds
/// - any error of [`PlsRegression::fit`] on a training fold
pub fn cross_validate(
    x: &Array2<f64>,
    y: &Array1<f64>,
    n_components: usize,
    folds: usize,
) -> Result<CrossValidation> {
    let n = x.nrows();
    let folds = folds.min(n);
    if folds < 2 {
        return Err(Error::InsufficientData(format!(
            "cross-validation needs two folds, {n} samples allow {folds}"
        )));
    }

    let mut predictions = Array1::<f64>::zeros(n);
    let mut fold_r_squared = vec![];
    for fold in 0..folds {
        let (test, train): (Vec<usize>, Vec<usize>) = (0..n).partition(|row| row % folds == fold);

        let x_train = x.select(Axis(0), &train);
        let y_train = y.select(Axis(0), &train);
        let scaler = Scaler::fit(&x_train)?;
        let model = PlsRegression::fit(&scaler.transform(&x_train), &y_train, n_components)?;

        let x_test = scaler.transform(&x.select(Axis(0), &test));
        let fold_predictions = model.predict(&x_test);
        for (&row, &prediction) in test.iter().zip(&fold_predictions) {
            predictions[row] = prediction;
        }

        let observed = test.iter().map(|&row| y[row]).collect::<Vec<_>>();
        if observed.len() >= 2 && std_dev(&observed).is_some_and(|sigma| sigma > 0.0) {
            fold_r_squared.push(r_squared(&observed, &fold_predictions.to_vec()));
        }
    }

    let y_mean = y.mean().unwrap_or(0.0);
    let sst: f64 = y.iter().map(|value| (value - y_mean).powi(2)).sum();
    let press: f64 = y
        .iter()
        .zip(&predictions)
        .map(|(observed, predicted)| (observed - predicted).powi(2))
        .sum();
    let q_squared = if sst > 0.0 { 1.0 - press / sst } else { 0.0 };

    Ok(CrossValidation {
        q_squared,
        fold_r_squared,
        predictions,
    })
}
