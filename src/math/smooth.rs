//! Separable Gaussian smoothing for master calibration frames.

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

/// How samples beyond the array edge are filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeMode {
    /// Repeat the edge sample (`a a | a b c d | d d`).
    Nearest,
    /// Mirror including the edge sample (`b a | a b c d | d c`).
    Reflect,
}

impl std::str::FromStr for EdgeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nearest" => Ok(EdgeMode::Nearest),
            "reflect" => Ok(EdgeMode::Reflect),
            other => Err(format!("unknown edge mode '{other}' (expected nearest or reflect)")),
        }
    }
}

/// Normalized Gaussian kernel truncated at 4 sigma.
pub fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    if !(sigma.is_finite() && sigma > 0.0) {
        return vec![1.0];
    }
    let radius = (4.0 * sigma).ceil() as isize;
    let mut kernel: Vec<f64> = (-radius..=radius)
        .map(|i| (-0.5 * (i as f64 / sigma).powi(2)).exp())
        .collect();
    let total: f64 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= total;
    }
    kernel
}

fn edge_index(i: isize, n: usize, mode: EdgeMode) -> usize {
    let n = n as isize;
    match mode {
        EdgeMode::Nearest => i.clamp(0, n - 1) as usize,
        EdgeMode::Reflect => {
            let mut j = i;
            while j < 0 || j >= n {
                if j < 0 {
                    j = -j - 1;
                } else {
                    j = 2 * n - j - 1;
                }
            }
            j as usize
        }
    }
}

fn convolve_axis(data: &Array2<f64>, kernel: &[f64], axis: Axis, mode: EdgeMode) -> Array2<f64> {
    let radius = (kernel.len() / 2) as isize;
    let mut out = Array2::<f64>::zeros(data.dim());
    for (src, mut dst) in data.lanes(axis).into_iter().zip(out.lanes_mut(axis)) {
        let n = src.len();
        if n == 0 {
            continue;
        }
        for i in 0..n {
            let mut acc = 0.0;
            for (k, w) in kernel.iter().enumerate() {
                let j = edge_index(i as isize + k as isize - radius, n, mode);
                acc += w * src[j];
            }
            dst[i] = acc;
        }
    }
    out
}

/// Smooth `data` with a 2D Gaussian of width `sigma` (pixels).
pub fn gaussian_smooth(data: &Array2<f64>, sigma: f64, mode: EdgeMode) -> Array2<f64> {
    let kernel = gaussian_kernel(sigma);
    let rows = convolve_axis(data, &kernel, Axis(0), mode);
    convolve_axis(&rows, &kernel, Axis(1), mode)
}

/// Propagate a variance map through [`gaussian_smooth`].
///
/// Pixels are treated as independent, so each output variance is the input
/// variance convolved with the squared kernel.
pub fn gaussian_smooth_variance(variance: &Array2<f64>, sigma: f64, mode: EdgeMode) -> Array2<f64> {
    let kernel: Vec<f64> = gaussian_kernel(sigma).iter().map(|w| w * w).collect();
    let rows = convolve_axis(variance, &kernel, Axis(0), mode);
    convolve_axis(&rows, &kernel, Axis(1), mode)
}
