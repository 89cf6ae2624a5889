//! Reporting utilities: per-order quality rows, issue tallies and formatted
//! terminal output.

pub mod format;

use crate::domain::{ColumnFlag, ExtractedSpectrum, Issue, TraceSet};
use crate::math::median;

/// One line of the trace table shown after tracing.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderQuality {
    pub order: usize,
    /// Row at the reference column.
    pub row: f64,
    pub rms: f64,
    pub accepted: usize,
    pub interpolated: usize,
    pub first_column: usize,
    pub last_column: usize,
}

pub fn order_quality(traces: &TraceSet) -> Vec<OrderQuality> {
    let reference = traces.reference_column as f64;
    traces
        .orders
        .iter()
        .enumerate()
        .map(|(order, t)| {
            let (first_column, last_column) = t.column_range().unwrap_or((0, 0));
            OrderQuality {
                order,
                row: t.center(reference),
                rms: t.rms,
                accepted: t.accepted_count(),
                interpolated: t.interpolated_count(),
                first_column,
                last_column,
            }
        })
        .collect()
}

/// Issue counts by kind, in a fixed order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IssueTally {
    pub unknown_keys: usize,
    pub dropped_candidates: usize,
    pub partial_orders: usize,
    pub failed_frames: usize,
}

pub fn tally_issues(issues: &[Issue]) -> IssueTally {
    let mut tally = IssueTally::default();
    for issue in issues {
        match issue {
            Issue::UnknownConfigKey { .. } => tally.unknown_keys += 1,
            Issue::CandidateDropped { .. } => tally.dropped_candidates += 1,
            Issue::PartialColumns { .. } => tally.partial_orders += 1,
            Issue::FrameFailed { .. } => tally.failed_frames += 1,
        }
    }
    tally
}

/// Median flux of the full columns of a spectrum.
pub fn median_full_flux(spectrum: &ExtractedSpectrum) -> Option<f64> {
    let values: Vec<f64> = spectrum
        .flux
        .iter()
        .zip(&spectrum.flags)
        .filter(|(f, flag)| **flag == ColumnFlag::Full && f.is_finite())
        .map(|(f, _)| *f)
        .collect();
    median(&values)
}
