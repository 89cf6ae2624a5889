//! Formatted terminal output for each stage.
//!
//! Formatting lives here so the stage code only returns data, and output
//! changes stay in one file.

use crate::app::pipeline::{FrameSpectra, ReductionOutput};
use crate::domain::{ColumnFlag, Issue, MasterFrame, TraceSet};
use crate::trace::TraceDiagnostics;

use super::{median_full_flux, order_quality, tally_issues};

/// Combination summary for one master frame.
pub fn format_master_summary(label: &str, master: &MasterFrame) -> String {
    let mut out = String::new();
    let (rows, columns) = master.shape();
    out.push_str(&format!("=== master {label} ===\n"));
    out.push_str(&format!("Frames: {} | shape={rows}x{columns}\n", master.n_frames));
    match master.exposure_time {
        Some(t) => out.push_str(&format!("Exposure: {t:.2}s (mean)\n")),
        None => out.push_str("Exposure: unknown\n"),
    }
    let finite: Vec<f64> = master.data.iter().copied().filter(|v| v.is_finite()).collect();
    let level = crate::math::median(&finite).unwrap_or(f64::NAN);
    out.push_str(&format!("Median level: {level:.3}\n"));
    out.push_str(&format!(
        "Clipping: {} rejected | {} reverted pixels | max {} rounds\n",
        master.stats.rejected_total(),
        master.stats.reverted_pixels,
        master.stats.max_iterations
    ));
    if !master.stats.rejected_per_frame.is_empty() {
        out.push_str(&format!("Per frame: {:?}\n", master.stats.rejected_per_frame));
    }
    out
}

/// Trace table plus the tracing diagnostics, when known.
pub fn format_trace_summary(traces: &TraceSet, diagnostics: Option<&TraceDiagnostics>) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "=== traces: {} orders on {}x{} (reference column {}) ===\n",
        traces.len(),
        traces.rows,
        traces.columns,
        traces.reference_column
    ));
    if let Some(d) = diagnostics {
        out.push_str(&format!(
            "Seeds: {} over {} columns | candidates={} merges={} dropped={}\n",
            d.seeds,
            d.seed_columns.len(),
            d.candidates,
            d.merges,
            d.dropped
        ));
    }
    if traces.is_empty() {
        out.push_str("(no orders)\n");
        return out;
    }

    push_line(
        &mut out,
        format!(
            "{:>5} {:>9} {:>8} {:>8} {:>6} {:>11}",
            "order", "row", "rms", "accepted", "filled", "columns"
        ),
    );
    push_line(
        &mut out,
        format!("{:-<5} {:-<9} {:-<8} {:-<8} {:-<6} {:-<11}", "", "", "", "", "", ""),
    );
    for q in order_quality(traces) {
        push_line(
            &mut out,
            format!(
                "{:>5} {:>9.2} {:>8.4} {:>8} {:>6} {:>11}",
                q.order,
                q.row,
                q.rms,
                q.accepted,
                q.interpolated,
                format!("{}-{}", q.first_column, q.last_column)
            ),
        );
    }
    out
}

/// Per-order flag counts and median flux of one science frame.
pub fn format_extraction_summary(frame: &FrameSpectra) -> String {
    let mut out = String::new();
    out.push_str(&format!("=== spectra: {} ===\n", frame.frame));
    if let Some(t) = frame.observation_time {
        out.push_str(&format!("Observed: {}\n", t.format("%Y-%m-%d %H:%M:%S")));
    }
    if let Some(t) = frame.exposure_time {
        out.push_str(&format!("Exposure: {t:.2}s\n"));
    }
    push_line(
        &mut out,
        format!("{:>5} {:>6} {:>7} {:>6} {:>14}", "order", "full", "partial", "empty", "median flux"),
    );
    for s in &frame.spectra {
        let count = |flag: ColumnFlag| s.flags.iter().filter(|f| **f == flag).count();
        let median = median_full_flux(s).map_or_else(|| "-".to_string(), |m| format!("{m:.2}"));
        push_line(
            &mut out,
            format!(
                "{:>5} {:>6} {:>7} {:>6} {:>14}",
                s.order,
                count(ColumnFlag::Full),
                count(ColumnFlag::Partial),
                count(ColumnFlag::Empty),
                median
            ),
        );
    }
    out
}

/// Issue list, grouped totals first.
pub fn format_issues(issues: &[Issue]) -> String {
    let mut out = String::new();
    if issues.is_empty() {
        out.push_str("Issues: none\n");
        return out;
    }
    let t = tally_issues(issues);
    out.push_str(&format!(
        "Issues: {} (unknown keys={}, dropped candidates={}, partial orders={}, failed frames={})\n",
        issues.len(),
        t.unknown_keys,
        t.dropped_candidates,
        t.partial_orders,
        t.failed_frames
    ));
    for issue in issues {
        out.push_str(&format!("- {issue}\n"));
    }
    out
}

/// Everything a `reduce` run prints.
pub fn format_reduction(output: &ReductionOutput, issues: &[Issue]) -> String {
    let mut out = String::new();
    if let Some(bias) = &output.master_bias {
        out.push_str(&format_master_summary("bias", bias));
        out.push('\n');
    }
    if let Some(flat) = &output.master_flat {
        out.push_str(&format_master_summary("flat", flat));
        out.push('\n');
    }
    out.push_str(&format_trace_summary(&output.traces, output.trace_diagnostics.as_ref()));
    out.push('\n');
    for frame in &output.science {
        out.push_str(&format_extraction_summary(frame));
        out.push('\n');
    }
    if !output.unknown.is_empty() {
        out.push_str(&format!("Skipped (unknown type): {}\n", output.unknown.join(", ")));
    }
    out.push_str(&format_issues(issues));
    out
}

fn push_line(out: &mut String, line: String) {
    out.push_str(line.trim_end());
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CombineStats, ExtractedSpectrum, OrderStats, OrderTrace, TraceSample};
    use crate::math::Polynomial;
    use ndarray::Array2;

    #[test]
    fn master_summary_reports_clipping() {
        let master = MasterFrame {
            data: Array2::from_elem((4, 6), 300.0),
            variance: Array2::from_elem((4, 6), 1.0),
            contributors: Array2::from_elem((4, 6), 5),
            n_frames: 5,
            exposure_time: Some(0.0),
            stats: CombineStats {
                max_iterations: 2,
                reverted_pixels: 1,
                rejected_per_frame: vec![0, 3, 0, 0, 1],
            },
        };
        let text = format_master_summary("bias", &master);
        assert!(text.contains("Frames: 5 | shape=4x6"));
        assert!(text.contains("Median level: 300.000"));
        assert!(text.contains("4 rejected | 1 reverted pixels | max 2 rounds"));
    }

    #[test]
    fn trace_summary_lists_every_order() {
        let order = |row: f64| OrderTrace {
            samples: vec![TraceSample::measured(0, row, 3.0), TraceSample::measured(99, row, 3.0)],
            position: Polynomial::new(vec![row], (0.0, 99.0)),
            rms: 0.01,
            fit_iterations: 1,
            seed: (50, row),
            stats: OrderStats::default(),
        };
        let set = TraceSet {
            rows: 80,
            columns: 100,
            reference_column: 50,
            orders: vec![order(20.0), order(50.0)],
        };
        let text = format_trace_summary(&set, None);
        assert!(text.starts_with("=== traces: 2 orders on 80x100"));
        assert!(text.contains("0-99"));
        assert_eq!(text.lines().count(), 1 + 2 + 2);

        let empty = format_trace_summary(&TraceSet::empty(10, 10, 5), None);
        assert!(empty.contains("(no orders)"));
    }

    #[test]
    fn extraction_summary_and_issues() {
        let frame = FrameSpectra {
            frame: "sci_001".into(),
            observation_time: None,
            exposure_time: Some(600.0),
            spectra: vec![ExtractedSpectrum {
                order: 0,
                flux: vec![f64::NAN, 4.0, 6.0],
                variance: None,
                flags: vec![ColumnFlag::Empty, ColumnFlag::Full, ColumnFlag::Full],
            }],
        };
        let text = format_extraction_summary(&frame);
        assert!(text.contains("Exposure: 600.00s"));
        assert!(text.lines().last().unwrap().ends_with("5.00"));

        assert_eq!(format_issues(&[]), "Issues: none\n");
        let issues = vec![Issue::FrameFailed {
            frame: "sci_002".into(),
            error: "bad shape".into(),
        }];
        let text = format_issues(&issues);
        assert!(text.contains("failed frames=1"));
        assert!(text.contains("- frame 'sci_002' failed: bad shape"));
    }
}
