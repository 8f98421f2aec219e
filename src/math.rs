use std::cmp::Ordering;

use itertools::Itertools;
use ndarray::{Array1, Array2, LinalgScalar};
use num_traits::Float;

use crate::Result;

/// Compute the outer product of two one-dimensional vectors of length (m x 1) and (n x 1)
///
/// The outer product is the (m x n) matrix whose elements are products of elements in the first
/// vector with those in the second. PLS deflation subtracts `t ⊗ p` from the score matrix.
///
/// # Examples
///
/// ```
/// use voltammetry::math::outer_product;
/// use ndarray::{arr1, arr2, Array1};
///
/// let u: Array1<f64> = arr1(&[1., 2., 3.]);
/// let v = arr1(&[4., 5., 6.]);
/// let outer_product = outer_product(&u, &v).unwrap();
///
/// let expected = arr2(&[[4., 5., 6.], [8., 10., 12.], [12., 15., 18.]]);
/// assert_eq!(outer_product, expected);
///```
///
/// # Errors
/// Only fails if `ndarray` cannot reshape the inputs, which does not happen for owned vectors.
pub fn outer_product<T: LinalgScalar>(u: &Array1<T>, v: &Array1<T>) -> Result<Array2<T>> {
    let u: Array2<T> = u.clone().into_shape((u.len(), 1))?;
    let v: Array2<T> = v.clone().into_shape((1, v.len()))?;

    Ok(ndarray::linalg::kron(&u, &v))
}

fn total_order<F: Float>(a: &F, b: &F) -> Ordering {
    a.partial_cmp(b).unwrap_or(Ordering::Equal)
}

/// Arithmetic mean, `None` for an empty slice
pub fn mean<F: Float>(values: &[F]) -> Option<F> {
    if values.is_empty() {
        return None;
    }
    let n = F::from(values.len())?;
    Some(values.iter().fold(F::zero(), |acc, &v| acc + v) / n)
}

/// Population variance (divides by `n`)
pub fn variance<F: Float>(values: &[F]) -> Option<F> {
    let mu = mean(values)?;
    let n = F::from(values.len())?;
    Some(
        values
            .iter()
            .fold(F::zero(), |acc, &v| acc + (v - mu).powi(2))
            / n,
    )
}

/// Population standard deviation
pub fn std_dev<F: Float>(values: &[F]) -> Option<F> {
    variance(values).map(Float::sqrt)
}

/// Percentile `q` in `[0, 100]` with linear interpolation between order statistics
pub fn percentile<F: Float>(values: &[F], q: F) -> Option<F> {
    if values.is_empty() {
        return None;
    }
    let sorted = values.iter().copied().sorted_by(total_order).collect_vec();
    let hundred = F::from(100)?;
    let rank = (q.max(F::zero()).min(hundred) / hundred) * F::from(sorted.len() - 1)?;
    let lower = rank.floor().to_usize()?;
    let upper = rank.ceil().to_usize()?;
    let fraction = rank - rank.floor();
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

pub fn median<F: Float>(values: &[F]) -> Option<F> {
    percentile(values, F::from(50)?)
}

/// Smallest and largest value, ignoring NaN ordering issues
pub fn min_max<F: Float>(values: &[F]) -> Option<(F, F)> {
    values
        .iter()
        .copied()
        .minmax_by(total_order)
        .into_option()
}

/// Trapezoidal integral of `y` against `x`
///
/// The sign follows the direction of `x`: a decreasing abscissa yields the negated area.
pub fn trapezoid<F: Float>(x: &[F], y: &[F]) -> F {
    let two = F::one() + F::one();
    x.iter()
        .zip(y)
        .tuple_windows()
        .fold(F::zero(), |acc, ((x0, y0), (x1, y1))| {
            acc + (*x1 - *x0) * (*y0 + *y1) / two
        })
}

/// Centered moving average; windows are truncated at the edges
pub fn moving_average<F: Float>(values: &[F], window: usize) -> Vec<F> {
    let half = window / 2;
    (0..values.len())
        .map(|ii| {
            let lo = ii.saturating_sub(half);
            let hi = (ii + half + 1).min(values.len());
            mean(&values[lo..hi]).unwrap_or_else(F::zero)
        })
        .collect()
}

/// Linear interpolation of `(xs, ys)` at `x`, with `xs` ascending
///
/// Points outside the tabulated range take the nearest end value.
pub fn interpolate(xs: &[f64], ys: &[f64], x: f64) -> Option<f64> {
    let (first, last) = (xs.first()?, xs.last()?);
    if x <= *first {
        return ys.first().copied();
    }
    if x >= *last {
        return ys.last().copied();
    }
    let upper = xs.partition_point(|&xi| xi < x);
    let (x0, x1) = (xs[upper - 1], xs[upper]);
    let (y0, y1) = (ys[upper - 1], ys[upper]);
    if (x1 - x0).abs() < f64::EPSILON {
        return Some(y0);
    }
    Some(y0 + (y1 - y0) * (x - x0) / (x1 - x0))
}

/// `n` evenly spaced values from `start` to `end` inclusive
#[allow(clippy::cast_precision_loss)]
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![start],
        n => (0..n)
            .map(|ii| start + (end - start) * ii as f64 / (n - 1) as f64)
            .collect(),
    }
}

/// Coefficient of determination of `predicted` against `observed`
///
/// Returns zero when the observations have no variance.
pub fn r_squared(observed: &[f64], predicted: &[f64]) -> f64 {
    let Some(mu) = mean(observed) else {
        return 0.0;
    };
    let ss_tot: f64 = observed.iter().map(|y| (y - mu).powi(2)).sum();
    let ss_res: f64 = observed
        .iter()
        .zip(predicted)
        .map(|(y, yhat)| (y - yhat).powi(2))
        .sum();
    if ss_tot <= f64::EPSILON * f64::EPSILON {
        return 0.0;
    }
    1.0 - ss_res / ss_tot
}

/// Ordinary least squares fit of `y = slope * x + intercept`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
    pub rmse: f64,
}

/// Fit a straight line through `(x, y)`
///
/// Returns `None` with fewer than two points or when `x` has no spread.
#[allow(clippy::cast_precision_loss)]
pub fn linear_fit(x: &[f64], y: &[f64]) -> Option<LinearFit> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let (mx, my) = (mean(x)?, mean(y)?);
    let sxx: f64 = x.iter().map(|xi| (xi - mx).powi(2)).sum();
    if sxx <= 0.0 {
        return None;
    }
    let sxy: f64 = x.iter().zip(y).map(|(xi, yi)| (xi - mx) * (yi - my)).sum();
    let slope = sxy / sxx;
    let intercept = my - slope * mx;

    let predicted = x.iter().map(|xi| slope * xi + intercept).collect_vec();
    let rmse = (y
        .iter()
        .zip(&predicted)
        .map(|(yi, pi)| (yi - pi).powi(2))
        .sum::<f64>()
        / y.len() as f64)
        .sqrt();

    Some(LinearFit {
        slope,
        intercept,
        r_squared: r_squared(y, &predicted),
        rmse,
    })
}
