//! Profile-weighted (optimal) extraction with cosmic-ray rejection.
//!
//! Per column the aperture pixels `d_i` (already multiplied by their aperture
//! weight) are modelled as `F * P_i`, where the spatial profile `P` is the
//! median of the normalized cross-sections of neighbouring columns, taken
//! at the same offsets from the trace center. The flux
//! estimate is
//!
//! ```text
//! F = sum(P_i d_i / v_i) / sum(P_i^2 / v_i),    var(F) = 1 / sum(P_i^2 / v_i)
//! ```
//!
//! The pixel furthest from the model is masked when it deviates by more than
//! `cosmic_clip * sqrt(v_i)`, and the estimate is repeated until no new pixel
//! is masked.

use ndarray::Array2;

use crate::extract::ExtractOptions;
use crate::extract::aperture::Aperture;
use crate::math::{clip_until_stable, median};

/// Smallest per-pixel variance used in the weights.
const VARIANCE_FLOOR: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimalFlux {
    pub flux: f64,
    pub variance: f64,
    pub masked: usize,
}

/// Spatial profile for the aperture at `column`, normalized to unit sum.
///
/// Each neighbouring column within `window` is resampled onto the pixel
/// offsets of `column` from its own trace center (`centers[c]`), divided by
/// its aperture flux, and the per-offset median is taken. Returns `None`
/// when the neighbourhood carries no positive flux.
pub fn spatial_profile(
    image: &Array2<f64>,
    apertures: &[Option<Aperture>],
    centers: &[f64],
    column: usize,
    window: usize,
) -> Option<Vec<f64>> {
    let aperture = apertures[column].as_ref()?;
    let half = window / 2;
    let lo = column.saturating_sub(half);
    let hi = (column + half).min(apertures.len() - 1);

    let offsets: Vec<(f64, f64)> = aperture
        .rows()
        .map(|(r, w)| (r as f64 - centers[column], w))
        .collect();
    let mut fractions: Vec<Vec<f64>> = vec![Vec::with_capacity(hi - lo + 1); offsets.len()];
    for c in lo..=hi {
        let Some(neighbour) = apertures[c].as_ref() else {
            continue;
        };
        let total: f64 = neighbour.rows().map(|(r, w)| w * image[[r, c]]).sum();
        if !(total > 0.0) {
            continue;
        }
        for (k, (offset, w)) in offsets.iter().enumerate() {
            if let Some(value) = sample_column(image, c, centers[c] + offset) {
                fractions[k].push(w * value / total);
            }
        }
    }

    let mut profile: Vec<f64> = fractions
        .iter()
        .map(|f| median(f).unwrap_or(0.0).max(0.0))
        .collect();
    let sum: f64 = profile.iter().sum();
    if !(sum > 0.0) {
        return None;
    }
    for p in &mut profile {
        *p /= sum;
    }
    Some(profile)
}

/// Cubic (Catmull-Rom) interpolation of `column` at a fractional `row`.
///
/// Whole rows return the pixel itself; rows off the image give `None`.
fn sample_column(image: &Array2<f64>, column: usize, row: f64) -> Option<f64> {
    let rows = image.nrows();
    if rows == 0 || !(row >= 0.0 && row <= (rows - 1) as f64) {
        return None;
    }
    let r1 = row.floor() as usize;
    let t = row - r1 as f64;
    if t == 0.0 {
        return Some(image[[r1, column]]);
    }
    let at = |r: isize| image[[r.clamp(0, rows as isize - 1) as usize, column]];
    let i = r1 as isize;
    let (p0, p1, p2, p3) = (at(i - 1), at(i), at(i + 1), at(i + 2));
    Some(p1 + 0.5 * t * (p2 - p0 + t * (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3 + t * (3.0 * (p1 - p2) + p3 - p0))))
}

/// Optimal flux of one column.
///
/// `data` and `variance` are aperture-weighted pixel values; without a
/// variance map the noise model `read_noise^2 + model / gain` is used.
pub fn optimal_column(
    data: &[f64],
    weights: &[f64],
    variance: Option<&[f64]>,
    profile: &[f64],
    options: &ExtractOptions,
) -> OptimalFlux {
    let sum_flux: f64 = data.iter().sum();

    let pixel_variance = |flux: f64| -> Vec<f64> {
        match variance {
            Some(v) => v.iter().map(|x| x.max(VARIANCE_FLOOR)).collect(),
            None => weights
                .iter()
                .zip(profile)
                .map(|(w, p)| {
                    let model = (flux * p).max(0.0);
                    (w * w * options.read_noise * options.read_noise + w * model / options.gain)
                        .max(VARIANCE_FLOOR)
                })
                .collect(),
        }
    };

    let estimate = |mask: &[bool], v: &[f64]| -> Option<(f64, f64)> {
        let mut num = 0.0;
        let mut den = 0.0;
        for i in 0..data.len() {
            if mask[i] {
                continue;
            }
            num += profile[i] * data[i] / v[i];
            den += profile[i] * profile[i] / v[i];
        }
        (den > 0.0).then(|| (num / den, 1.0 / den))
    };

    // Flux of the previous round drives the noise model.
    let mut current = sum_flux;
    let clip = options.cosmic_clip;
    let outcome = clip_until_stable(vec![false; data.len()], options.max_iter, 1, |mask| {
        let v = pixel_variance(current);
        let Some((flux, _)) = estimate(mask, &v) else {
            return vec![false; mask.len()];
        };
        current = flux;
        let v = pixel_variance(flux);
        // At most one pixel per round.
        let worst = (0..data.len())
            .filter(|&i| !mask[i])
            .map(|i| (i, (data[i] - flux * profile[i]).abs() / v[i].sqrt()))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        let mut flagged = vec![false; data.len()];
        if let Some((i, deviation)) = worst {
            flagged[i] = deviation > clip;
        }
        flagged
    });

    let v = pixel_variance(current);
    match estimate(&outcome.excluded, &v) {
        Some((flux, var)) => OptimalFlux {
            flux,
            variance: var,
            masked: outcome.excluded.iter().filter(|m| **m).count(),
        },
        None => OptimalFlux {
            flux: sum_flux,
            variance: v.iter().sum(),
            masked: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn gaussian(n: usize, center: f64, sigma: f64) -> Vec<f64> {
        let raw: Vec<f64> = (0..n)
            .map(|i| (-0.5 * ((i as f64 - center) / sigma).powi(2)).exp())
            .collect();
        let s: f64 = raw.iter().sum();
        raw.into_iter().map(|v| v / s).collect()
    }

    #[test]
    fn recovers_flux_and_ignores_cosmic() {
        let profile = gaussian(9, 4.0, 1.2);
        let mut data: Vec<f64> = profile.iter().map(|p| 5000.0 * p).collect();
        let weights = vec![1.0; 9];
        let variance: Vec<f64> = data.iter().map(|d| 25.0 + d).collect();

        let clean = optimal_column(&data, &weights, Some(&variance), &profile, &ExtractOptions::default());
        assert_abs_diff_eq!(clean.flux, 5000.0, epsilon = 1e-6);
        assert_eq!(clean.masked, 0);

        data[6] += 4000.0;
        let hit = optimal_column(&data, &weights, Some(&variance), &profile, &ExtractOptions::default());
        assert_eq!(hit.masked, 1);
        assert_abs_diff_eq!(hit.flux, 5000.0, epsilon = 1e-6);
        assert!(hit.variance > clean.variance);
    }

    #[test]
    fn noise_model_without_variance_map() {
        let profile = gaussian(7, 3.0, 1.0);
        let data: Vec<f64> = profile.iter().map(|p| 1000.0 * p).collect();
        let options = ExtractOptions {
            read_noise: 3.0,
            gain: 2.0,
            ..ExtractOptions::default()
        };
        let out = optimal_column(&data, &[1.0; 7], None, &profile, &options);
        assert_abs_diff_eq!(out.flux, 1000.0, epsilon = 1e-6);
        assert!(out.variance > 0.0);
    }

    #[test]
    fn profile_follows_a_tilted_trace() {
        let (rows, cols) = (40, 30);
        let centers: Vec<f64> = (0..cols).map(|c| 10.0 + 0.3 * c as f64).collect();
        let image = Array2::from_shape_fn((rows, cols), |(r, c)| {
            1000.0 * (-0.5 * ((r as f64 - centers[c]) / 1.3).powi(2)).exp()
        });
        let apertures: Vec<Option<Aperture>> = centers
            .iter()
            .enumerate()
            .map(|(c, &y)| crate::extract::aperture::column_aperture(y, 6.0, 6.0, rows, 0, c).ok())
            .collect();

        let column = 15;
        let profile = spatial_profile(&image, &apertures, &centers, column, 15).unwrap();
        let ap = apertures[column].as_ref().unwrap();
        let own: Vec<f64> = ap.rows().map(|(r, w)| w * image[[r, column]]).collect();
        let total: f64 = own.iter().sum();
        for (p, d) in profile.iter().zip(&own) {
            assert_abs_diff_eq!(*p, d / total, epsilon = 5e-3);
        }
    }

    #[test]
    fn whole_rows_sample_exactly() {
        let image = Array2::from_shape_fn((5, 1), |(r, _)| (r * r) as f64);
        assert_eq!(sample_column(&image, 0, 3.0), Some(9.0));
        assert!(sample_column(&image, 0, -0.1).is_none());
        assert!(sample_column(&image, 0, 4.5).is_none());
        // Catmull-Rom reproduces a quadratic between interior nodes.
        assert_abs_diff_eq!(sample_column(&image, 0, 1.5).unwrap(), 2.25, epsilon = 1e-12);
    }
}
