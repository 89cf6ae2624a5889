//! Frame combiner: robust per-pixel stacking of calibration exposures.
//!
//! Every pixel is combined independently:
//!
//! - optionally drop the largest value up front (`reject_max`, flats only)
//! - iteratively mask values that deviate from the mean of the *other*
//!   unmasked values by more than `clip_sigma` times their spread
//! - average the survivors; variance is the variance of that mean
//!
//! Rows are processed in parallel and reassembled by index, so the output does
//! not depend on scheduling.

use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::domain::{CombineStats, MasterFrame, RawFrame};
use crate::error::ReduceError;
use crate::math::{EdgeMode, clip_until_stable, gaussian_smooth, gaussian_smooth_variance, median, std_dev};

/// Leave-one-out statistics need two other values besides the one tested.
const MIN_CLIP_CONTRIBUTORS: usize = 3;

/// Lower bound on the leave-one-out sigma: digitization noise of one count,
/// `1 / sqrt(12)`. Identical integer readouts otherwise give `sigma = 0`.
const QUANTIZATION_SIGMA: f64 = 0.288_675_134_594_812_9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombineMode {
    Mean,
    /// Mean scaled back up to the number of input frames.
    Sum,
    Median,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CombineOptions {
    pub clip_sigma: f64,
    pub max_iter: usize,
    pub mode: CombineMode,
    /// Exclude the per-pixel maximum before clipping when more than three
    /// frames are combined.
    pub reject_max: bool,
}

impl Default for CombineOptions {
    fn default() -> Self {
        Self {
            clip_sigma: 10.0,
            max_iter: 5,
            mode: CombineMode::Mean,
            reject_max: false,
        }
    }
}

/// Result for one pixel.
struct PixelStack {
    value: f64,
    variance: f64,
    survivors: u32,
    iterations: usize,
    reverted: bool,
    excluded: Vec<bool>,
}

struct RowStack {
    data: Vec<f64>,
    variance: Vec<f64>,
    contributors: Vec<u32>,
    max_iterations: usize,
    reverted: usize,
    rejected_per_frame: Vec<usize>,
}

/// Combine `frames` into a master frame.
///
/// All frames must share one shape. The master's `exposure_time` is left unset;
/// callers that know the header key fill it with [`mean_exposure_time`].
pub fn combine(frames: &[RawFrame], options: &CombineOptions) -> Result<MasterFrame, ReduceError> {
    let first = frames.first().ok_or(ReduceError::EmptyInput)?;
    let (rows, cols) = first.shape();
    for (index, frame) in frames.iter().enumerate().skip(1) {
        if frame.shape() != (rows, cols) {
            return Err(ReduceError::ShapeMismatch {
                index,
                name: frame.name.clone(),
                expected: (rows, cols),
                found: frame.shape(),
            });
        }
    }

    let n = frames.len();
    log::info!(
        "Combining {n} frames of {rows}x{cols} (mode {:?}, clip {} sigma, max {} rounds)",
        options.mode,
        options.clip_sigma,
        options.max_iter
    );

    let row_stacks: Vec<RowStack> = (0..rows)
        .into_par_iter()
        .map(|r| {
            let mut row = RowStack {
                data: Vec::with_capacity(cols),
                variance: Vec::with_capacity(cols),
                contributors: Vec::with_capacity(cols),
                max_iterations: 0,
                reverted: 0,
                rejected_per_frame: vec![0; n],
            };
            let mut values = vec![0.0; n];
            for c in 0..cols {
                for (slot, frame) in values.iter_mut().zip(frames) {
                    *slot = frame.data[[r, c]];
                }
                let px = stack_pixel(&values, options);
                row.data.push(px.value);
                row.variance.push(px.variance);
                row.contributors.push(px.survivors);
                row.max_iterations = row.max_iterations.max(px.iterations);
                if px.reverted {
                    row.reverted += 1;
                }
                for (count, excluded) in row.rejected_per_frame.iter_mut().zip(&px.excluded) {
                    if *excluded {
                        *count += 1;
                    }
                }
            }
            row
        })
        .collect();

    let mut data = Array2::<f64>::zeros((rows, cols));
    let mut variance = Array2::<f64>::zeros((rows, cols));
    let mut contributors = Array2::<u32>::zeros((rows, cols));
    let mut stats = CombineStats {
        rejected_per_frame: vec![0; n],
        ..CombineStats::default()
    };
    for (r, row) in row_stacks.into_iter().enumerate() {
        for c in 0..cols {
            data[[r, c]] = row.data[c];
            variance[[r, c]] = row.variance[c];
            contributors[[r, c]] = row.contributors[c];
        }
        stats.max_iterations = stats.max_iterations.max(row.max_iterations);
        stats.reverted_pixels += row.reverted;
        for (total, count) in stats.rejected_per_frame.iter_mut().zip(row.rejected_per_frame) {
            *total += count;
        }
    }

    if stats.reverted_pixels > 0 {
        log::warn!(
            "{} pixels reverted to the unclipped mean (clipping removed every value)",
            stats.reverted_pixels
        );
    }
    log::debug!(
        "Combine finished: {} values rejected, at most {} rounds per pixel",
        stats.rejected_total(),
        stats.max_iterations
    );

    Ok(MasterFrame {
        data,
        variance,
        contributors,
        n_frames: n,
        exposure_time: None,
        stats,
    })
}

/// Mean exposure time of the frames that carry `key`.
pub fn mean_exposure_time(frames: &[RawFrame], key: &str) -> Option<f64> {
    let times: Vec<f64> = frames.iter().filter_map(|f| f.header.exposure_time(key)).collect();
    crate::math::mean(&times)
}

/// Replace a master frame by its Gaussian-smoothed version.
pub fn smooth_master(master: &mut MasterFrame, sigma: f64, mode: EdgeMode) {
    log::info!("Smoothing master frame (sigma {sigma} px, edge mode {mode:?})");
    master.data = gaussian_smooth(&master.data, sigma, mode);
    master.variance = gaussian_smooth_variance(&master.variance, sigma, mode);
}

fn stack_pixel(values: &[f64], options: &CombineOptions) -> PixelStack {
    let n = values.len();
    let mut initial = vec![false; n];
    if options.reject_max && n > 3 {
        let mut imax = 0;
        for (i, v) in values.iter().enumerate() {
            if *v > values[imax] {
                imax = i;
            }
        }
        initial[imax] = true;
    }

    let clip_sigma = options.clip_sigma;
    let outcome = clip_until_stable(initial, options.max_iter, 1, |mask| {
        flag_leave_one_out(values, mask, clip_sigma)
    });

    let (excluded, reverted) = if outcome.exhausted {
        (vec![false; n], true)
    } else {
        (outcome.excluded, false)
    };

    let survivors: Vec<f64> = values
        .iter()
        .zip(&excluded)
        .filter(|(_, e)| !**e)
        .map(|(v, _)| *v)
        .collect();
    let m = survivors.len();
    let mean = survivors.iter().sum::<f64>() / m as f64;
    let var_of_mean = match std_dev(&survivors, 1) {
        Some(s) => s * s / m as f64,
        None => 0.0,
    };

    let (value, variance) = match options.mode {
        CombineMode::Mean => (mean, var_of_mean),
        CombineMode::Sum => {
            let scale = n as f64;
            (mean * scale, var_of_mean * scale * scale)
        }
        CombineMode::Median => (
            median(&survivors).unwrap_or(mean),
            var_of_mean * std::f64::consts::FRAC_PI_2,
        ),
    };

    PixelStack {
        value,
        variance,
        survivors: m as u32,
        iterations: outcome.iterations,
        reverted,
        excluded,
    }
}

/// Flag every unmasked value that sits more than `clip_sigma` standard
/// deviations from the mean of the remaining unmasked values. The standard
/// deviation is floored at [`QUANTIZATION_SIGMA`].
fn flag_leave_one_out(values: &[f64], mask: &[bool], clip_sigma: f64) -> Vec<bool> {
    let live: Vec<usize> = (0..values.len()).filter(|&i| !mask[i]).collect();
    let mut flagged = vec![false; values.len()];
    if live.len() < MIN_CLIP_CONTRIBUTORS {
        return flagged;
    }

    let mut others = Vec::with_capacity(live.len() - 1);
    for &i in &live {
        others.clear();
        others.extend(live.iter().filter(|&&j| j != i).map(|&j| values[j]));
        let m = others.iter().sum::<f64>() / others.len() as f64;
        let s = std_dev(&others, 1).unwrap_or(0.0).max(QUANTIZATION_SIGMA);
        flagged[i] = (values[i] - m).abs() > clip_sigma * s;
    }
    flagged
}
