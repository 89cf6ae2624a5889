//! Outlier-resistant polynomial fit of trace samples.

use crate::domain::TraceSample;
use crate::error::ReduceError;
use crate::math::{Polynomial, clip_until_stable, mean, std_dev};

/// Residual deviations below this many pixels are never clipped.
const RESIDUAL_FLOOR: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct TraceFit {
    pub position: Polynomial,
    /// RMS residual of the samples kept by the fit.
    pub rms: f64,
    pub iterations: usize,
}

/// Fit `row = p(column)` to the measured samples, clipping outliers.
///
/// Interpolated samples never constrain the fit. `rejected` is rewritten on
/// every measured sample to reflect the final mask.
pub fn robust_fit(
    samples: &mut [TraceSample],
    degree: usize,
    clipping: f64,
    max_iter: usize,
    domain: (f64, f64),
) -> Result<TraceFit, ReduceError> {
    let usable: Vec<usize> = (0..samples.len())
        .filter(|&i| !samples[i].interpolated)
        .collect();
    let min_points = degree + 1;
    if usable.len() < min_points {
        return Err(ReduceError::FitFailure {
            points: usable.len(),
            degree,
        });
    }

    let x: Vec<f64> = usable.iter().map(|&i| samples[i].column as f64).collect();
    let y: Vec<f64> = usable.iter().map(|&i| samples[i].row).collect();

    let fit_masked = |mask: &[bool]| -> Option<Polynomial> {
        let (xs, ys): (Vec<f64>, Vec<f64>) = x
            .iter()
            .zip(&y)
            .zip(mask)
            .filter(|(_, m)| !**m)
            .map(|((a, b), _)| (*a, *b))
            .unzip();
        Polynomial::fit(&xs, &ys, degree, domain)
    };

    let outcome = clip_until_stable(vec![false; x.len()], max_iter, min_points, |mask| {
        let Some(poly) = fit_masked(mask) else {
            return vec![false; mask.len()];
        };
        let residuals: Vec<f64> = x.iter().zip(&y).map(|(c, r)| r - poly.eval(*c)).collect();
        let kept: Vec<f64> = residuals
            .iter()
            .zip(mask)
            .filter(|(_, m)| !**m)
            .map(|(r, _)| *r)
            .collect();
        let (Some(m), Some(s)) = (mean(&kept), std_dev(&kept, 1)) else {
            return vec![false; mask.len()];
        };
        residuals
            .iter()
            .map(|r| {
                let dev = (r - m).abs();
                dev > clipping * s && dev > RESIDUAL_FLOOR
            })
            .collect()
    });

    let position = fit_masked(&outcome.excluded).ok_or(ReduceError::FitFailure {
        points: outcome.kept(),
        degree,
    })?;

    let mut ss = 0.0;
    let mut n = 0usize;
    for (k, &i) in usable.iter().enumerate() {
        let excluded = outcome.excluded[k];
        samples[i].rejected = excluded;
        if !excluded {
            let r = samples[i].row - position.eval(samples[i].column as f64);
            ss += r * r;
            n += 1;
        }
    }
    let rms = if n > 0 { (ss / n as f64).sqrt() } else { 0.0 };

    Ok(TraceFit {
        position,
        rms,
        iterations: outcome.iterations,
    })
}
