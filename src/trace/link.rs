//! Following one order from its seed across the detector.
//!
//! The walk steps one column at a time in each direction, predicting the next
//! center from the recent accepted samples and taking the nearest qualifying
//! peak within the search window. Misses are gaps; more than `max_gap`
//! consecutive misses end that direction.

use ndarray::Array2;

use crate::domain::TraceSample;
use crate::trace::TraceOptions;
use crate::trace::peaks::{PeakCriteria, local_maxima, qualify};

/// Accepted samples looked back over when predicting the next center.
const SLOPE_BASELINE: usize = 10;

/// Measured samples of one order, sorted by column.
pub fn link_from_seed(
    image: &Array2<f64>,
    seed_column: usize,
    seed_row: f64,
    noise: f64,
    options: &TraceOptions,
) -> Vec<TraceSample> {
    let criteria = PeakCriteria {
        threshold: options.threshold,
        noise,
        min_width: options.minimum_width,
        separation: &options.separation,
    };

    let mut backward = walk(image, seed_column, seed_row, Direction::Backward, &criteria, options);
    let forward = walk(image, seed_column, seed_row, Direction::Forward, &criteria, options);
    backward.reverse();
    backward.extend(forward);
    backward
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

fn walk(
    image: &Array2<f64>,
    seed_column: usize,
    seed_row: f64,
    direction: Direction,
    criteria: &PeakCriteria,
    options: &TraceOptions,
) -> Vec<TraceSample> {
    let (rows, cols) = image.dim();
    let mut samples: Vec<TraceSample> = Vec::new();
    let mut anchors: Vec<(f64, f64)> = vec![(seed_column as f64, seed_row)];
    let mut misses = 0usize;

    let mut column = match direction {
        Direction::Forward => Some(seed_column),
        Direction::Backward => seed_column.checked_sub(1),
    };

    while let Some(c) = column.filter(|&c| c < cols) {
        let predicted = predict(&anchors, c as f64);
        let lo = (predicted - options.search_window).floor().max(0.0) as usize;
        let hi = ((predicted + options.search_window).ceil().max(0.0) as usize).min(rows.saturating_sub(1));

        let profile = image.column(c);
        let best = local_maxima(profile, lo, hi)
            .filter_map(|i| qualify(profile, i, criteria))
            .map(|p| (p, (p.center - predicted).abs()))
            .filter(|(_, d)| *d <= options.search_window)
            .min_by(|a, b| a.1.total_cmp(&b.1));

        match best {
            Some((peak, distance)) if distance <= options.tolerance => {
                samples.push(TraceSample::measured(c, peak.center, peak.width));
                anchors.push((c as f64, peak.center));
                misses = 0;
            }
            _ => {
                misses += 1;
                if misses > options.max_gap {
                    break;
                }
            }
        }

        column = match direction {
            Direction::Forward => c.checked_add(1),
            Direction::Backward => c.checked_sub(1),
        };
    }
    samples
}

fn predict(anchors: &[(f64, f64)], column: f64) -> f64 {
    let Some(&(c1, r1)) = anchors.last() else {
        return 0.0;
    };
    if anchors.len() < 2 {
        return r1;
    }
    let back = anchors.len().saturating_sub(SLOPE_BASELINE + 1);
    let (c0, r0) = anchors[back];
    if c1 == c0 {
        return r1;
    }
    r1 + (r1 - r0) / (c1 - c0) * (column - c1)
}

/// Fill interior gaps of at most `max_gap` columns by linear interpolation.
///
/// Longer gaps are left open.
pub fn bridge(samples: &[TraceSample], max_gap: usize) -> Vec<TraceSample> {
    let mut out: Vec<TraceSample> = Vec::with_capacity(samples.len());
    for pair in samples.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        out.push(a);
        let gap = b.column.saturating_sub(a.column + 1);
        if gap == 0 || gap > max_gap {
            continue;
        }
        let span = (b.column - a.column) as f64;
        for column in a.column + 1..b.column {
            let t = (column - a.column) as f64 / span;
            out.push(TraceSample {
                column,
                row: a.row + t * (b.row - a.row),
                width: a.width + t * (b.width - a.width),
                interpolated: true,
                rejected: false,
            });
        }
    }
    if let Some(last) = samples.last() {
        out.push(*last);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn order_image(rows: usize, cols: usize, center: impl Fn(f64) -> f64) -> Array2<f64> {
        Array2::from_shape_fn((rows, cols), |(r, c)| {
            1000.0 * (-0.5 * ((r as f64 - center(c as f64)) / 1.5).powi(2)).exp()
        })
    }

    #[test]
    fn walks_a_tilted_order_end_to_end() {
        let img = order_image(60, 200, |c| 20.0 + 0.08 * c);
        let samples = link_from_seed(&img, 100, 28.0, 1.0, &TraceOptions::default());
        assert_eq!(samples.len(), 200);
        assert_eq!(samples[0].column, 0);
        assert_eq!(samples[199].column, 199);
        for s in &samples {
            assert_abs_diff_eq!(s.row, 20.0 + 0.08 * s.column as f64, epsilon = 0.05);
        }
    }

    #[test]
    fn long_gap_stops_the_walk() {
        let mut img = order_image(40, 120, |_| 15.0);
        for c in 40..60 {
            for r in 0..40 {
                img[[r, c]] = 0.0;
            }
        }
        let samples = link_from_seed(&img, 90, 15.0, 1.0, &TraceOptions::default());
        assert_eq!(samples.first().map(|s| s.column), Some(60));
        assert_eq!(samples.last().map(|s| s.column), Some(119));
    }

    #[test]
    fn bridge_fills_short_gaps_only() {
        let mut samples: Vec<TraceSample> = [0usize, 1, 2, 6, 7, 20]
            .iter()
            .map(|&c| TraceSample::measured(c, c as f64 * 0.5, 3.0))
            .collect();
        samples[3].row = 3.0;
        let bridged = bridge(&samples, 5);
        let cols: Vec<usize> = bridged.iter().map(|s| s.column).collect();
        assert_eq!(cols, vec![0, 1, 2, 3, 4, 5, 6, 7, 20]);
        assert!(bridged[3].interpolated && bridged[5].interpolated);
        assert_abs_diff_eq!(bridged[4].row, 2.0, epsilon = 1e-12);
    }
}
