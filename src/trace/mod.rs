//! Order tracer: locate every echelle order on a (master flat) image.
//!
//! Stages, in order:
//!
//! - seeds: qualifying peaks of median cross-sections at regularly spaced
//!   columns, starting from the middle of the detector
//! - linking: follow each seed column by column in both directions
//! - bridging: interpolate short gaps
//! - fitting: robust polynomial `row = p(column)` per candidate
//! - merging: union of candidates that trace the same order
//! - separation: sort by row and drop too-close or crossing orders
//!
//! Linking and fitting are independent per seed and run on the rayon pool;
//! everything after the merge barrier is sequential. Candidates carry their
//! seed index, so the result does not depend on scheduling.

pub mod fit;
pub mod link;
pub mod merge;
pub mod peaks;
pub mod separation;

use ndarray::Array2;
use rayon::prelude::*;

use crate::domain::{DropReason, Issue, OrderStats, OrderTrace, TraceSample, TraceSet};
use crate::error::ReduceError;
use crate::math::{difference_noise, mean, median};

pub use fit::TraceFit;
pub use separation::SeparationProfile;

use peaks::{PeakCriteria, cross_section, find_peaks};

#[derive(Debug, Clone, PartialEq)]
pub struct TraceOptions {
    /// Column spacing of seed cross-sections.
    pub scan_step: usize,
    /// Minimum peak width (pixels at or above half height).
    pub minimum_width: f64,
    /// Peak height above local background, in units of the noise.
    pub threshold: f64,
    pub separation: SeparationProfile,
    pub degree: usize,
    pub search_window: f64,
    pub tolerance: f64,
    pub max_gap: usize,
    /// Fraction of detector columns an order must be measured on.
    pub filling: f64,
    pub clipping: f64,
    pub max_iter: usize,
    pub merge_tolerance: f64,
    /// Defaults to the middle column.
    pub reference_column: Option<usize>,
    /// Pixels at or above this level count as saturated.
    pub saturation: Option<f64>,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            scan_step: 100,
            minimum_width: 2.0,
            threshold: 5.0,
            separation: SeparationProfile::default(),
            degree: 3,
            search_window: 3.0,
            tolerance: 2.0,
            max_gap: 5,
            filling: 0.3,
            clipping: 3.0,
            max_iter: 5,
            merge_tolerance: 2.0,
            reference_column: None,
            saturation: None,
        }
    }
}

impl TraceOptions {
    /// Accepted samples a candidate needs to survive.
    pub fn required_samples(&self, columns: usize) -> usize {
        let filled = (self.filling * columns as f64).ceil() as usize;
        filled.max(self.degree + 1)
    }
}

/// One traced order before it becomes an [`OrderTrace`].
#[derive(Debug, Clone)]
pub struct Candidate {
    pub seed: (usize, f64),
    pub samples: Vec<TraceSample>,
    pub fit: TraceFit,
}

impl Candidate {
    pub fn center(&self, column: f64) -> f64 {
        self.fit.position.eval(column)
    }

    pub fn accepted_count(&self) -> usize {
        self.samples.iter().filter(|s| s.is_accepted()).count()
    }

    pub fn column_span(&self) -> Option<(usize, usize)> {
        Some((self.samples.first()?.column, self.samples.last()?.column))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceDiagnostics {
    pub seed_columns: Vec<usize>,
    pub seeds: usize,
    /// Candidates that survived linking and fitting.
    pub candidates: usize,
    pub merges: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone)]
pub struct TraceOutcome {
    pub traces: TraceSet,
    pub issues: Vec<Issue>,
    pub diagnostics: TraceDiagnostics,
}

struct Seed {
    column: usize,
    row: f64,
    noise: f64,
}

/// Trace all orders on `image`.
///
/// An image without detectable orders yields an empty trace set.
pub fn trace(image: &Array2<f64>, options: &TraceOptions) -> Result<TraceOutcome, ReduceError> {
    let (rows, cols) = image.dim();
    if options.scan_step == 0 {
        return Err(ReduceError::invalid_config("reduce.trace.scan_step", "must be > 0"));
    }
    let reference_column = options
        .reference_column
        .unwrap_or(cols / 2)
        .min(cols.saturating_sub(1));

    let mut diagnostics = TraceDiagnostics::default();
    if rows < 3 || cols == 0 {
        log::warn!("Image of {rows}x{cols} is too small to trace");
        return Ok(TraceOutcome {
            traces: TraceSet::empty(rows, cols, reference_column),
            issues: Vec::new(),
            diagnostics,
        });
    }

    diagnostics.seed_columns = seed_columns(cols, options.scan_step);
    let seeds: Vec<Seed> = diagnostics
        .seed_columns
        .iter()
        .flat_map(|&column| {
            let profile = cross_section(image, column);
            let noise = difference_noise(&profile);
            let criteria = PeakCriteria {
                threshold: options.threshold,
                noise,
                min_width: options.minimum_width,
                separation: &options.separation,
            };
            let peaks = find_peaks(&profile, &criteria);
            log::debug!("Seed column {column}: {} peaks (noise {noise:.3})", peaks.len());
            peaks.into_iter().map(move |p| Seed {
                column,
                row: p.center,
                noise,
            })
        })
        .collect();
    diagnostics.seeds = seeds.len();

    let domain = (0.0, cols.saturating_sub(1) as f64);
    let required = options.required_samples(cols);

    let linked: Vec<Result<Candidate, Issue>> = seeds
        .par_iter()
        .map(|seed| {
            let measured = link::link_from_seed(image, seed.column, seed.row, seed.noise, options);
            let dropped = |reason| Issue::CandidateDropped {
                seed_column: seed.column,
                seed_row: seed.row,
                reason,
            };
            if measured.len() < required {
                return Err(dropped(DropReason::TooFewColumns {
                    accepted: measured.len(),
                    required,
                }));
            }
            let mut samples = link::bridge(&measured, options.max_gap);
            match fit::robust_fit(&mut samples, options.degree, options.clipping, options.max_iter, domain) {
                Ok(fit) => Ok(Candidate {
                    seed: (seed.column, seed.row),
                    samples,
                    fit,
                }),
                Err(ReduceError::FitFailure { points, degree }) => {
                    Err(dropped(DropReason::FitFailure { points, degree }))
                }
                Err(_) => Err(dropped(DropReason::FitFailure {
                    points: measured.len(),
                    degree: options.degree,
                })),
            }
        })
        .collect();

    let mut issues = Vec::new();
    let mut candidates = Vec::new();
    for result in linked {
        match result {
            Ok(c) => candidates.push(c),
            Err(issue) => {
                log::debug!("{issue}");
                issues.push(issue);
            }
        }
    }
    diagnostics.candidates = candidates.len();

    let (merged, merge_issues, merges) = merge::merge_duplicates(candidates, options, domain);
    diagnostics.merges = merges;
    issues.extend(merge_issues);

    let (kept, separation_issues) =
        separation::enforce_separation(merged, &options.separation, reference_column, cols);
    issues.extend(separation_issues);
    diagnostics.dropped = issues.len();

    let orders: Vec<OrderTrace> = kept
        .into_iter()
        .map(|c| {
            let stats = order_stats(image, &c, options.saturation);
            OrderTrace {
                samples: c.samples,
                position: c.fit.position,
                rms: c.fit.rms,
                fit_iterations: c.fit.iterations,
                seed: c.seed,
                stats,
            }
        })
        .collect();

    log::info!(
        "Traced {} orders from {} seeds ({} candidates, {} merges, {} dropped)",
        orders.len(),
        diagnostics.seeds,
        diagnostics.candidates,
        diagnostics.merges,
        diagnostics.dropped
    );

    Ok(TraceOutcome {
        traces: TraceSet {
            rows,
            columns: cols,
            reference_column,
            orders,
        },
        issues,
        diagnostics,
    })
}

/// Middle column first, then alternating `step` outwards.
pub fn seed_columns(columns: usize, step: usize) -> Vec<usize> {
    if columns == 0 || step == 0 {
        return Vec::new();
    }
    let mid = columns / 2;
    let mut out = vec![mid];
    let mut k = 1;
    loop {
        let right = mid + k * step;
        let left = mid.checked_sub(k * step);
        if right >= columns && left.is_none() {
            break;
        }
        if right < columns {
            out.push(right);
        }
        if let Some(l) = left {
            out.push(l);
        }
        k += 1;
    }
    out
}

fn order_stats(image: &Array2<f64>, candidate: &Candidate, saturation: Option<f64>) -> OrderStats {
    let (rows, _) = image.dim();
    let Some((first, last)) = candidate.column_span() else {
        return OrderStats::default();
    };

    let mut peaks = Vec::with_capacity(last - first + 1);
    let mut saturated_columns = 0;
    for c in first..=last {
        let center = candidate.center(c as f64).round();
        if center < 0.0 || center >= rows as f64 {
            continue;
        }
        let r = center as usize;
        peaks.push(image[[r, c]]);
        if let Some(level) = saturation {
            let lo = r.saturating_sub(1);
            let hi = (r + 1).min(rows - 1);
            if (lo..=hi).any(|k| image[[k, c]] >= level) {
                saturated_columns += 1;
            }
        }
    }

    OrderStats {
        peak_mean: mean(&peaks).unwrap_or(0.0),
        peak_median: median(&peaks).unwrap_or(0.0),
        peak_max: peaks.iter().copied().fold(0.0, f64::max),
        saturated_columns,
    }
}
