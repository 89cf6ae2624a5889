//! Ridge detection in 1D cross-dispersion profiles.

use ndarray::{Array2, ArrayView1, aview1};

use crate::math::median;
use crate::trace::SeparationProfile;

/// Half width of the column window averaged into a seed cross-section.
pub const SEED_HALF_WINDOW: usize = 2;

/// What makes a local maximum an order candidate.
#[derive(Debug, Clone, Copy)]
pub struct PeakCriteria<'a> {
    pub threshold: f64,
    pub noise: f64,
    pub min_width: f64,
    pub separation: &'a SeparationProfile,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    /// Row of the maximum pixel.
    pub index: usize,
    /// Sub-pixel row center.
    pub center: f64,
    /// Height above the local background.
    pub height: f64,
    /// Contiguous pixels at or above half height.
    pub width: f64,
}

/// Per-row median of the columns `column ± SEED_HALF_WINDOW`.
pub fn cross_section(image: &Array2<f64>, column: usize) -> Vec<f64> {
    let (rows, cols) = image.dim();
    let lo = column.saturating_sub(SEED_HALF_WINDOW);
    let hi = (column + SEED_HALF_WINDOW).min(cols.saturating_sub(1));
    let mut buf = Vec::with_capacity(hi - lo + 1);
    (0..rows)
        .map(|r| {
            buf.clear();
            buf.extend((lo..=hi).map(|c| image[[r, c]]));
            median(&buf).unwrap_or(0.0)
        })
        .collect()
}

/// All qualifying peaks of `profile`, by increasing row.
pub fn find_peaks(profile: &[f64], criteria: &PeakCriteria) -> Vec<Peak> {
    let view = aview1(profile);
    if profile.len() < 3 {
        return Vec::new();
    }
    local_maxima(view, 1, profile.len() - 2)
        .filter_map(|i| qualify(view, i, criteria))
        .collect()
}

/// Interior local maxima with index in `[lo, hi]`.
///
/// A plateau reports its first pixel.
pub fn local_maxima(profile: ArrayView1<'_, f64>, lo: usize, hi: usize) -> impl Iterator<Item = usize> + '_ {
    let n = profile.len();
    let lo = lo.max(1);
    let hi = hi.min(n.saturating_sub(2));
    (lo..=hi).filter(move |&i| profile[i] > profile[i - 1] && profile[i] >= profile[i + 1])
}

/// Check the local maximum at `i` against `criteria`.
pub fn qualify(profile: ArrayView1<'_, f64>, i: usize, criteria: &PeakCriteria) -> Option<Peak> {
    let n = profile.len();
    let half_sep = (criteria.separation.at(i as f64) / 2.0).ceil().max(1.0) as usize;
    let lo = i.saturating_sub(half_sep);
    let hi = (i + half_sep).min(n - 1);
    let background = (lo..=hi).map(|j| profile[j]).fold(f64::INFINITY, f64::min);

    let height = profile[i] - background;
    if !(height > criteria.threshold * criteria.noise) || height <= 0.0 {
        return None;
    }

    let half_level = background + 0.5 * height;
    let width = half_max_width(profile, i, half_level);
    if width < criteria.min_width {
        return None;
    }

    Some(Peak {
        index: i,
        center: subpixel_center(profile, i, background),
        height,
        width,
    })
}

fn half_max_width(profile: ArrayView1<'_, f64>, i: usize, level: f64) -> f64 {
    let mut left = i;
    while left > 0 && profile[left - 1] >= level {
        left -= 1;
    }
    let mut right = i;
    while right + 1 < profile.len() && profile[right + 1] >= level {
        right += 1;
    }
    (right - left + 1) as f64
}

/// Three-point interpolation of the peak position.
///
/// Uses a parabola through the logarithms of the background-subtracted values
/// (exact for a Gaussian), falling back to a parabola through the values.
pub fn subpixel_center(profile: ArrayView1<'_, f64>, i: usize, background: f64) -> f64 {
    if i == 0 || i + 1 >= profile.len() {
        return i as f64;
    }
    let a = profile[i - 1] - background;
    let b = profile[i] - background;
    let c = profile[i + 1] - background;

    let offset = if a > 0.0 && b > 0.0 && c > 0.0 {
        let (la, lb, lc) = (a.ln(), b.ln(), c.ln());
        parabola_vertex(la, lb, lc)
    } else {
        None
    }
    .or_else(|| parabola_vertex(a, b, c))
    .unwrap_or(0.0);

    i as f64 + offset.clamp(-0.5, 0.5)
}

fn parabola_vertex(a: f64, b: f64, c: f64) -> Option<f64> {
    let denom = a - 2.0 * b + c;
    if denom < 0.0 && denom.is_finite() {
        Some(0.5 * (a - c) / denom)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn gaussian_profile(n: usize, centers: &[f64], sigma: f64) -> Vec<f64> {
        (0..n)
            .map(|r| {
                centers
                    .iter()
                    .map(|c| 100.0 * (-0.5 * ((r as f64 - c) / sigma).powi(2)).exp())
                    .sum()
            })
            .collect()
    }

    #[test]
    fn gaussian_center_is_recovered_exactly() {
        let profile = gaussian_profile(40, &[17.3], 1.6);
        let center = subpixel_center(aview1(&profile), 17, 0.0);
        assert_abs_diff_eq!(center, 17.3, epsilon = 1e-9);
    }

    #[test]
    fn finds_separated_peaks_and_skips_narrow_spikes() {
        let mut profile = gaussian_profile(100, &[20.4, 50.0, 80.7], 1.5);
        profile[65] = 80.0;
        let sep = SeparationProfile::constant(20.0);
        let criteria = PeakCriteria {
            threshold: 5.0,
            noise: 1.0,
            min_width: 2.0,
            separation: &sep,
        };
        let peaks = find_peaks(&profile, &criteria);
        let centers: Vec<f64> = peaks.iter().map(|p| p.center).collect();
        assert_eq!(centers.len(), 3, "{centers:?}");
        assert_abs_diff_eq!(centers[0], 20.4, epsilon = 1e-6);
        assert_abs_diff_eq!(centers[2], 80.7, epsilon = 1e-6);
    }

    #[test]
    fn flat_profile_has_no_peaks() {
        let sep = SeparationProfile::constant(10.0);
        let criteria = PeakCriteria {
            threshold: 5.0,
            noise: 0.0,
            min_width: 2.0,
            separation: &sep,
        };
        assert!(find_peaks(&[3.0; 50], &criteria).is_empty());
    }

    #[test]
    fn cross_section_is_column_median() {
        let mut img = Array2::<f64>::zeros((3, 10));
        for c in 0..10 {
            img[[1, c]] = c as f64;
        }
        img[[1, 5]] = 1000.0;
        let xs = cross_section(&img, 5);
        // Columns 3..=7 on row 1: 3, 4, 1000, 6, 7.
        assert_eq!(xs[1], 6.0);
        let edge = cross_section(&img, 0);
        assert_eq!(edge[1], 1.0);
    }
}
