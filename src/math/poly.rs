//! Power-series polynomials over a normalized domain.
//!
//! Trace polynomials map a detector column to a row center. Columns are mapped
//! from `domain = (lo, hi)` onto `[-1, 1]` before evaluation so that the design
//! matrix stays well conditioned even for 4k-wide detectors and degree 5+.
//! Evaluation outside the domain is plain extrapolation.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::math::solve_least_squares;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polynomial {
    /// Coefficients in increasing power of the normalized coordinate.
    pub coefficients: Vec<f64>,
    pub domain: (f64, f64),
}

impl Polynomial {
    pub fn new(coefficients: Vec<f64>, domain: (f64, f64)) -> Self {
        Self {
            coefficients,
            domain,
        }
    }

    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    /// Map `x` from the domain onto `[-1, 1]`.
    pub fn normalize(&self, x: f64) -> f64 {
        normalize(x, self.domain)
    }

    pub fn eval(&self, x: f64) -> f64 {
        let t = self.normalize(x);
        self.coefficients
            .iter()
            .rev()
            .fold(0.0, |acc, &c| acc * t + c)
    }

    /// Least squares fit of `y = p(x)`.
    ///
    /// Returns `None` when there are fewer points than coefficients or the
    /// system cannot be solved.
    pub fn fit(x: &[f64], y: &[f64], degree: usize, domain: (f64, f64)) -> Option<Self> {
        let n = x.len();
        let p = degree + 1;
        if n != y.len() || n < p {
            return None;
        }

        let mut design = DMatrix::<f64>::zeros(n, p);
        let mut obs = DVector::<f64>::zeros(n);
        for i in 0..n {
            let t = normalize(x[i], domain);
            let mut tp = 1.0;
            for j in 0..p {
                design[(i, j)] = tp;
                tp *= t;
            }
            obs[i] = y[i];
        }

        let beta = solve_least_squares(&design, &obs)?;
        Some(Self {
            coefficients: beta.iter().copied().collect(),
            domain,
        })
    }
}

fn normalize(x: f64, (lo, hi): (f64, f64)) -> f64 {
    if hi > lo {
        (2.0 * x - (lo + hi)) / (hi - lo)
    } else {
        x - lo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn fit_recovers_cubic() {
        let truth = |x: f64| 120.0 + 0.05 * x - 2.0e-5 * x * x + 3.0e-9 * x * x * x;
        let x: Vec<f64> = (0..2048).step_by(16).map(|c| c as f64).collect();
        let y: Vec<f64> = x.iter().map(|&c| truth(c)).collect();

        let poly = Polynomial::fit(&x, &y, 3, (0.0, 2047.0)).unwrap();
        for c in [0.0, 500.0, 1024.5, 2047.0] {
            assert_abs_diff_eq!(poly.eval(c), truth(c), epsilon = 1e-6);
        }
        // Extrapolation stays on the same curve.
        assert_abs_diff_eq!(poly.eval(2100.0), truth(2100.0), epsilon = 1e-5);
    }

    #[test]
    fn underdetermined_fit_is_rejected() {
        assert!(Polynomial::fit(&[1.0, 2.0], &[1.0, 2.0], 2, (0.0, 10.0)).is_none());
    }
}
