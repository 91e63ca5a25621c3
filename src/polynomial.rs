//! # Polynomials and interpolation
//!
//! Least-squares polynomial fits used for traces, fiber-model bins and wavelength
//! solutions, plus the piecewise-linear interpolation shared by every resampling step.
//!
//! Polynomials are expressed in a **normalized abscissa** `u = column / D`, where `D` is
//! the number of columns of the amplifier being processed. A solution fitted on one
//! binning therefore evaluates unchanged on another.
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::panacea_errors::PanaceaError;

/// Polynomial with coefficients stored from the constant term upwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polynomial {
    pub coeffs: Vec<f64>,
}

impl Polynomial {
    pub fn new(coeffs: Vec<f64>) -> Self {
        Polynomial { coeffs }
    }

    pub fn order(&self) -> usize {
        self.coeffs.len().saturating_sub(1)
    }

    /// Evaluate the polynomial at `u` (Horner scheme).
    #[inline]
    pub fn eval(&self, u: f64) -> f64 {
        self.coeffs.iter().rev().fold(0.0, |acc, c| acc * u + c)
    }

    /// First derivative at `u`.
    pub fn derivative(&self, u: f64) -> f64 {
        self.coeffs
            .iter()
            .enumerate()
            .skip(1)
            .rev()
            .fold(0.0, |acc, (k, c)| acc * u + k as f64 * c)
    }

    /// Evaluate at every column `0..columns`, using `u = column / columns`.
    pub fn eval_columns(&self, columns: usize) -> Vec<f64> {
        let d = columns as f64;
        (0..columns).map(|c| self.eval(c as f64 / d)).collect()
    }

    /// Least-squares fit of `y = Σ c_k x^k` with `k <= order`.
    ///
    /// The order is lowered to `x.len() - 1` when fewer points than coefficients are
    /// available.
    ///
    /// Arguments
    /// -----------------
    /// * `x`, `y`: Abscissa (normalized) and ordinate, same length.
    /// * `order`: Requested polynomial order.
    ///
    /// Return
    /// ----------
    /// * The fitted [`Polynomial`], or [`PanaceaError::SingularSystem`] if no point is given
    ///   or the design matrix cannot be solved.
    pub fn fit(x: &[f64], y: &[f64], order: usize) -> Result<Self, PanaceaError> {
        Self::fit_weighted(x, y, None, order)
    }

    /// Weighted least-squares fit; `weights` multiplies each residual.
    pub fn fit_weighted(
        x: &[f64],
        y: &[f64],
        weights: Option<&[f64]>,
        order: usize,
    ) -> Result<Self, PanaceaError> {
        if x.is_empty() || x.len() != y.len() {
            return Err(PanaceaError::SingularSystem(format!(
                "polynomial fit with {} abscissae and {} ordinates",
                x.len(),
                y.len()
            )));
        }
        let ncoef = (order + 1).min(x.len());
        let w = |i: usize| weights.map_or(1.0, |w| w[i]);

        let design = DMatrix::from_fn(x.len(), ncoef, |i, k| w(i) * x[i].powi(k as i32));
        let rhs = DVector::from_fn(y.len(), |i, _| w(i) * y[i]);

        let coeffs = design
            .svd(true, true)
            .solve(&rhs, 1e-14)
            .map_err(|e| PanaceaError::SingularSystem(e.to_string()))?;

        Ok(Polynomial::new(coeffs.iter().copied().collect()))
    }
}

/// Piecewise-linear interpolation of `(xp, fp)` at `x`.
///
/// `xp` must be non-decreasing. Values outside the tabulated range are clamped to the
/// first/last ordinate.
pub fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let n = xp.len();
    if n == 0 {
        return f64::NAN;
    }
    if x <= xp[0] {
        return fp[0];
    }
    if x >= xp[n - 1] {
        return fp[n - 1];
    }
    // First index with xp[i] > x.
    let hi = xp.partition_point(|&v| v <= x);
    let lo = hi - 1;
    let dx = xp[hi] - xp[lo];
    if dx == 0.0 {
        return fp[lo];
    }
    fp[lo] + (fp[hi] - fp[lo]) * (x - xp[lo]) / dx
}

/// Vectorized [`interp`].
pub fn interp_many(x: &[f64], xp: &[f64], fp: &[f64]) -> Vec<f64> {
    x.iter().map(|&v| interp(v, xp, fp)).collect()
}

#[cfg(test)]
mod polynomial_test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_fit_recovers_cubic() {
        let x: Vec<f64> = (0..50).map(|i| i as f64 / 50.0).collect();
        let truth = Polynomial::new(vec![1.0, -2.0, 0.5, 3.0]);
        let y: Vec<f64> = x.iter().map(|&u| truth.eval(u)).collect();

        let fit = Polynomial::fit(&x, &y, 3).unwrap();
        for (a, b) in fit.coeffs.iter().zip(truth.coeffs.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
        assert_relative_eq!(fit.derivative(0.5), -2.0 + 0.5 + 9.0 * 0.25, epsilon = 1e-9);
    }

    #[test]
    fn test_fit_lowers_order() {
        let fit = Polynomial::fit(&[0.0, 1.0], &[1.0, 3.0], 3).unwrap();
        assert_eq!(fit.order(), 1);
        assert_relative_eq!(fit.eval(0.5), 2.0, epsilon = 1e-12);
        assert!(Polynomial::fit(&[], &[], 2).is_err());
    }

    #[test]
    fn test_interp() {
        let xp = [0.0, 1.0, 2.0];
        let fp = [0.0, 10.0, 30.0];
        assert_eq!(interp(-1.0, &xp, &fp), 0.0);
        assert_eq!(interp(0.5, &xp, &fp), 5.0);
        assert_eq!(interp(1.5, &xp, &fp), 20.0);
        assert_eq!(interp(5.0, &xp, &fp), 30.0);
        assert_eq!(interp_many(&[1.0, 2.0], &xp, &fp), vec![10.0, 30.0]);
    }
}
