//! Small robust-statistics helpers over `f64` slices.

/// Conversion from median absolute deviation to Gaussian sigma.
pub const MAD_TO_SIGMA: f64 = 1.4826;

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Standard deviation with `ddof` delta degrees of freedom.
///
/// Returns `None` when `values.len() <= ddof`.
pub fn std_dev(values: &[f64], ddof: usize) -> Option<f64> {
    let n = values.len();
    if n <= ddof {
        return None;
    }
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    Some((ss / (n - ddof) as f64).sqrt())
}

/// Median; sorts `values` in place.
pub fn median_mut(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}

pub fn median(values: &[f64]) -> Option<f64> {
    let mut buf: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    median_mut(&mut buf)
}

/// Robust Gaussian sigma from the median absolute deviation.
pub fn mad_sigma(values: &[f64]) -> Option<f64> {
    let med = median(values)?;
    let mut dev: Vec<f64> = values
        .iter()
        .filter(|v| !v.is_nan())
        .map(|v| (v - med).abs())
        .collect();
    median_mut(&mut dev).map(|mad| mad * MAD_TO_SIGMA)
}

/// Noise sigma of a 1D profile estimated from its first differences.
///
/// Differencing removes smooth structure (orders, scattered light), so the
/// estimate tracks pixel-to-pixel noise only. Differences of two independent
/// samples carry `sqrt(2)` times the per-pixel sigma.
pub fn difference_noise(profile: &[f64]) -> f64 {
    if profile.len() < 3 {
        return 0.0;
    }
    let diffs: Vec<f64> = profile.windows(2).map(|w| w[1] - w[0]).collect();
    mad_sigma(&diffs).unwrap_or(0.0) / std::f64::consts::SQRT_2
}
