//! Extractor: collapse each traced order into a 1D spectrum.
//!
//! For every order and column the trace gives a row center; the aperture
//! `[center - lower, center + upper]` is integrated either as a weighted sum
//! or with profile weighting ([`ExtractMethod::Optimal`]). Apertures clipped by
//! the image edge are flagged per column and reported, never fatal.

pub mod aperture;
pub mod optimal;

use ndarray::Array2;
use rayon::prelude::*;

use crate::domain::{ColumnFlag, ExtractMethod, ExtractedSpectrum, Issue, OrderTrace, TraceSet};
use crate::error::ReduceError;

use aperture::{Aperture, column_aperture};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractOptions {
    pub method: ExtractMethod,
    /// Aperture extent below the trace center (pixels).
    pub lower: f64,
    /// Aperture extent above the trace center (pixels).
    pub upper: f64,
    /// Electrons per count.
    pub gain: f64,
    /// Read noise in counts.
    pub read_noise: f64,
    pub cosmic_clip: f64,
    pub max_iter: usize,
    /// Columns contributing to the optimal-extraction profile.
    pub profile_window: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            method: ExtractMethod::Sum,
            lower: 6.0,
            upper: 6.0,
            gain: 1.0,
            read_noise: 0.0,
            cosmic_clip: 5.0,
            max_iter: 5,
            profile_window: 15,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractOutcome {
    pub spectra: Vec<ExtractedSpectrum>,
    pub issues: Vec<Issue>,
}

/// Extract every order of `traces` from `image`.
pub fn extract(
    image: &Array2<f64>,
    variance: Option<&Array2<f64>>,
    traces: &TraceSet,
    options: &ExtractOptions,
) -> Result<ExtractOutcome, ReduceError> {
    let shape = image.dim();
    if shape != (traces.rows, traces.columns) {
        return Err(ReduceError::ShapeMismatch {
            index: 0,
            name: "image".to_string(),
            expected: (traces.rows, traces.columns),
            found: shape,
        });
    }
    if let Some(v) = variance {
        if v.dim() != shape {
            return Err(ReduceError::ShapeMismatch {
                index: 1,
                name: "variance".to_string(),
                expected: shape,
                found: v.dim(),
            });
        }
    }

    let spectra: Vec<ExtractedSpectrum> = traces
        .orders
        .par_iter()
        .enumerate()
        .map(|(index, order)| extract_order(image, variance, index, order, options))
        .collect();

    let mut issues = Vec::new();
    for spectrum in &spectra {
        let partial = spectrum.columns_flagged(ColumnFlag::Partial);
        let empty = spectrum.columns_flagged(ColumnFlag::Empty);
        if partial.is_empty() && empty.is_empty() {
            continue;
        }
        log::warn!(
            "Order {}: aperture clipped on {} columns, outside the image on {}",
            spectrum.order,
            partial.len(),
            empty.len()
        );
        issues.push(Issue::PartialColumns {
            order: spectrum.order,
            partial,
            empty,
        });
    }

    log::info!(
        "Extracted {} orders x {} columns ({:?})",
        spectra.len(),
        traces.columns,
        options.method
    );
    Ok(ExtractOutcome { spectra, issues })
}

fn extract_order(
    image: &Array2<f64>,
    variance: Option<&Array2<f64>>,
    index: usize,
    order: &OrderTrace,
    options: &ExtractOptions,
) -> ExtractedSpectrum {
    let (rows, cols) = image.dim();
    let centers: Vec<f64> = (0..cols).map(|c| order.center(c as f64)).collect();
    let apertures: Vec<Option<Aperture>> = (0..cols)
        .map(|c| {
            column_aperture(centers[c], options.lower, options.upper, rows, index, c)
                .map_err(|err| log::debug!("{err}"))
                .ok()
        })
        .collect();

    let mut flux = Vec::with_capacity(cols);
    let mut var = variance.map(|_| Vec::with_capacity(cols));
    let mut flags = Vec::with_capacity(cols);
    let mut masked = 0usize;

    for (c, aperture) in apertures.iter().enumerate() {
        let Some(ap) = aperture else {
            flux.push(f64::NAN);
            if let Some(v) = var.as_mut() {
                v.push(f64::NAN);
            }
            flags.push(ColumnFlag::Empty);
            continue;
        };

        let data: Vec<f64> = ap.rows().map(|(r, w)| w * image[[r, c]]).collect();
        let weighted_var: Option<Vec<f64>> =
            variance.map(|vm| ap.rows().map(|(r, w)| w * w * vm[[r, c]]).collect());

        let (f, v) = match options.method {
            ExtractMethod::Sum => (
                data.iter().sum::<f64>(),
                weighted_var.as_ref().map(|wv| wv.iter().sum::<f64>()),
            ),
            ExtractMethod::Optimal => {
                match optimal::spatial_profile(image, &apertures, &centers, c, options.profile_window) {
                    Some(profile) => {
                        let out = optimal::optimal_column(
                            &data,
                            &ap.weights,
                            weighted_var.as_deref(),
                            &profile,
                            options,
                        );
                        masked += out.masked;
                        (out.flux, Some(out.variance))
                    }
                    None => (
                        data.iter().sum::<f64>(),
                        weighted_var.as_ref().map(|wv| wv.iter().sum::<f64>()),
                    ),
                }
            }
        };

        flux.push(f);
        if let Some(vs) = var.as_mut() {
            vs.push(v.unwrap_or(f64::NAN));
        }
        flags.push(ap.flag);
    }

    if masked > 0 {
        log::debug!("Order {index}: {masked} pixels rejected as cosmics");
    }

    ExtractedSpectrum {
        order: index,
        flux,
        variance: var,
        flags,
    }
}

/// Per-pixel variance of a bias-subtracted science frame:
/// `bias_variance + max(signal, 0) / gain + read_noise^2`.
pub fn variance_map(
    signal: &Array2<f64>,
    bias_variance: Option<&Array2<f64>>,
    gain: f64,
    read_noise: f64,
) -> Array2<f64> {
    let rn2 = read_noise * read_noise;
    let mut out = signal.mapv(|s| s.max(0.0) / gain + rn2);
    if let Some(bv) = bias_variance {
        out += bv;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderStats, TraceSample};
    use crate::math::Polynomial;
    use approx::assert_abs_diff_eq;

    fn flat_order(row: f64, cols: usize) -> OrderTrace {
        OrderTrace {
            samples: (0..cols).map(|c| TraceSample::measured(c, row, 3.0)).collect(),
            position: Polynomial::new(vec![row], (0.0, cols as f64 - 1.0)),
            rms: 0.0,
            fit_iterations: 1,
            seed: (cols / 2, row),
            stats: OrderStats::default(),
        }
    }

    fn trace_set(rows: usize, cols: usize, orders: Vec<OrderTrace>) -> TraceSet {
        TraceSet {
            rows,
            columns: cols,
            reference_column: cols / 2,
            orders,
        }
    }

    fn gaussian_image(rows: usize, cols: usize, centers: &[f64], flux: f64) -> Array2<f64> {
        let sigma: f64 = 1.3;
        let norm = flux / (sigma * (2.0 * std::f64::consts::PI).sqrt());
        Array2::from_shape_fn((rows, cols), |(r, _)| {
            centers
                .iter()
                .map(|c| norm * (-0.5 * ((r as f64 - c) / sigma).powi(2)).exp())
                .sum()
        })
    }

    #[test]
    fn sum_extraction_integrates_aperture() {
        let img = Array2::from_elem((40, 10), 2.0);
        let var = Array2::from_elem((40, 10), 3.0);
        let ts = trace_set(40, 10, vec![flat_order(20.25, 10)]);
        let options = ExtractOptions {
            lower: 2.0,
            upper: 3.0,
            ..ExtractOptions::default()
        };
        let out = extract(&img, Some(&var), &ts, &options).unwrap();
        let s = &out.spectra[0];
        assert!(out.issues.is_empty());
        for c in 0..10 {
            assert_abs_diff_eq!(s.flux[c], 10.0, epsilon = 1e-12);
            assert_eq!(s.flags[c], ColumnFlag::Full);
        }
        // [18.25, 23.25]: weights 0.25, 1, 1, 1, 1, 0.75.
        let expected_var = 3.0 * (0.25f64.powi(2) + 4.0 + 0.75f64.powi(2));
        assert_abs_diff_eq!(s.variance.as_ref().unwrap()[0], expected_var, epsilon = 1e-12);
    }

    #[test]
    fn top_edge_aperture_is_partial_then_full() {
        let cols = 30;
        let img = Array2::from_elem((50, cols), 1.0);
        let mut order = flat_order(0.0, cols);
        // Starts at row 1 and climbs away from the edge.
        order.position = Polynomial::new(vec![1.0 + 0.5 * 29.0, 0.5 * 29.0], (0.0, 29.0));
        let ts = trace_set(50, cols, vec![order]);
        let options = ExtractOptions {
            lower: 4.0,
            upper: 4.0,
            ..ExtractOptions::default()
        };
        let out = extract(&img, None, &ts, &options).unwrap();
        let s = &out.spectra[0];
        assert_eq!(s.flags[0], ColumnFlag::Partial);
        assert_abs_diff_eq!(s.flux[0], 5.5, epsilon = 1e-12);
        assert_eq!(s.flags[10], ColumnFlag::Full);
        assert_abs_diff_eq!(s.flux[10], 8.0, epsilon = 1e-12);
        assert!(s.variance.is_none());
        assert!(matches!(&out.issues[0], Issue::PartialColumns { order: 0, partial, empty } if partial.contains(&0) && empty.is_empty()));
    }

    #[test]
    fn order_off_image_gives_empty_nan_columns() {
        let img = Array2::from_elem((20, 5), 1.0);
        let ts = trace_set(20, 5, vec![flat_order(-30.0, 5)]);
        let out = extract(&img, None, &ts, &ExtractOptions::default()).unwrap();
        assert!(out.spectra[0].flux.iter().all(|f| f.is_nan()));
        assert_eq!(out.spectra[0].columns_flagged(ColumnFlag::Empty).len(), 5);
    }

    #[test]
    fn repeated_extraction_is_bit_identical() {
        let img = gaussian_image(60, 80, &[15.3, 40.8], 900.0);
        let var = variance_map(&img, None, 1.5, 4.0);
        let ts = trace_set(60, 80, vec![flat_order(15.3, 80), flat_order(40.8, 80)]);
        let options = ExtractOptions {
            method: ExtractMethod::Optimal,
            ..ExtractOptions::default()
        };
        let a = extract(&img, Some(&var), &ts, &options).unwrap();
        let b = extract(&img, Some(&var), &ts, &options).unwrap();
        for (x, y) in a.spectra.iter().zip(&b.spectra) {
            let xb: Vec<u64> = x.flux.iter().map(|f| f.to_bits()).collect();
            let yb: Vec<u64> = y.flux.iter().map(|f| f.to_bits()).collect();
            assert_eq!(xb, yb);
        }
    }

    #[test]
    fn optimal_rejects_cosmic_that_sum_keeps() {
        let mut img = gaussian_image(40, 60, &[20.0], 2000.0);
        let var = variance_map(&img, None, 1.0, 5.0);
        img[[21, 30]] += 3000.0;
        let ts = trace_set(40, 60, vec![flat_order(20.0, 60)]);

        let sum = extract(&img, Some(&var), &ts, &ExtractOptions::default()).unwrap();
        let opt = extract(
            &img,
            Some(&var),
            &ts,
            &ExtractOptions {
                method: ExtractMethod::Optimal,
                ..ExtractOptions::default()
            },
        )
        .unwrap();

        let clean = sum.spectra[0].flux[10];
        assert!(sum.spectra[0].flux[30] > clean + 2500.0);
        assert_abs_diff_eq!(opt.spectra[0].flux[30], opt.spectra[0].flux[10], epsilon = 1.0);
        assert_abs_diff_eq!(opt.spectra[0].flux[10], clean, epsilon = 1.0);
    }

    #[test]
    fn optimal_matches_sum_on_a_tilted_order() {
        let (rows, cols) = (80, 200);
        let slope = 0.25;
        let sigma: f64 = 1.3;
        let norm = 10000.0 / (sigma * (2.0 * std::f64::consts::PI).sqrt());
        let img = Array2::from_shape_fn((rows, cols), |(r, c)| {
            let center = 15.0 + slope * c as f64;
            norm * (-0.5 * ((r as f64 - center) / sigma).powi(2)).exp()
        });
        let var = variance_map(&img, None, 1.0, 5.0);
        let half = (cols - 1) as f64 / 2.0;
        let mut order = flat_order(0.0, cols);
        order.position = Polynomial::new(vec![15.0 + slope * half, slope * half], (0.0, (cols - 1) as f64));
        let ts = trace_set(rows, cols, vec![order]);

        let sum = extract(&img, Some(&var), &ts, &ExtractOptions::default()).unwrap();
        let opt = extract(
            &img,
            Some(&var),
            &ts,
            &ExtractOptions {
                method: ExtractMethod::Optimal,
                ..ExtractOptions::default()
            },
        )
        .unwrap();
        for c in [50, 100, 101, 150] {
            let s = sum.spectra[0].flux[c];
            let o = opt.spectra[0].flux[c];
            assert!(((o - s) / s).abs() < 0.005, "column {c}: sum {s} optimal {o}");
        }
    }

    #[test]
    fn mismatched_variance_is_rejected() {
        let img = Array2::from_elem((10, 10), 1.0);
        let var = Array2::from_elem((10, 9), 1.0);
        let ts = trace_set(10, 10, vec![]);
        let err = extract(&img, Some(&var), &ts, &ExtractOptions::default()).unwrap_err();
        assert!(matches!(err, ReduceError::ShapeMismatch { index: 1, .. }));
    }

    #[test]
    fn variance_map_combines_terms() {
        let signal = Array2::from_shape_vec((1, 2), vec![100.0, -5.0]).unwrap();
        let bias_var = Array2::from_elem((1, 2), 0.5);
        let v = variance_map(&signal, Some(&bias_var), 2.0, 3.0);
        assert_abs_diff_eq!(v[[0, 0]], 0.5 + 50.0 + 9.0, epsilon = 1e-12);
        assert_abs_diff_eq!(v[[0, 1]], 0.5 + 9.0, epsilon = 1e-12);
    }
}
