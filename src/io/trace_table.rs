//! Trace-set persistence as a single CSV table.
//!
//! Every row carries a `record` kind:
//!
//! - `set`: detector shape and reference column (exactly one, first)
//! - `fit`: one per order (polynomial, RMS, seed, peak statistics)
//! - `sample`: one per trace sample, after the `fit` row of its order
//!
//! Columns a record kind does not use are left empty. Coefficients are
//! `;`-separated in increasing power of the normalized column.

use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::{OrderStats, OrderTrace, TraceSample, TraceSet};
use crate::error::ReduceError;
use crate::math::Polynomial;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RecordKind {
    Set,
    Fit,
    Sample,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TraceRecord {
    record: Option<RecordKind>,
    order: Option<usize>,
    rows: Option<usize>,
    columns: Option<usize>,
    reference_column: Option<usize>,
    domain_lo: Option<f64>,
    domain_hi: Option<f64>,
    coefficients: Option<String>,
    rms: Option<f64>,
    iterations: Option<usize>,
    seed_column: Option<usize>,
    seed_row: Option<f64>,
    peak_mean: Option<f64>,
    peak_median: Option<f64>,
    peak_max: Option<f64>,
    saturated_columns: Option<usize>,
    column: Option<usize>,
    row: Option<f64>,
    width: Option<f64>,
    interpolated: Option<bool>,
    rejected: Option<bool>,
}

pub fn write_trace_csv(path: &Path, traces: &TraceSet) -> Result<(), ReduceError> {
    let context = || format!("failed to write trace table '{}'", path.display());
    let file = File::create(path).map_err(|e| ReduceError::io(context(), e))?;
    let mut writer = csv::Writer::from_writer(file);

    let mut put = |rec: TraceRecord| writer.serialize(rec).map_err(|e| ReduceError::format(context(), e));

    put(TraceRecord {
        record: Some(RecordKind::Set),
        rows: Some(traces.rows),
        columns: Some(traces.columns),
        reference_column: Some(traces.reference_column),
        ..TraceRecord::default()
    })?;

    for (index, order) in traces.orders.iter().enumerate() {
        let coefficients = order
            .position
            .coefficients
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(";");
        put(TraceRecord {
            record: Some(RecordKind::Fit),
            order: Some(index),
            domain_lo: Some(order.position.domain.0),
            domain_hi: Some(order.position.domain.1),
            coefficients: Some(coefficients),
            rms: Some(order.rms),
            iterations: Some(order.fit_iterations),
            seed_column: Some(order.seed.0),
            seed_row: Some(order.seed.1),
            peak_mean: Some(order.stats.peak_mean),
            peak_median: Some(order.stats.peak_median),
            peak_max: Some(order.stats.peak_max),
            saturated_columns: Some(order.stats.saturated_columns),
            ..TraceRecord::default()
        })?;
        for s in &order.samples {
            put(TraceRecord {
                record: Some(RecordKind::Sample),
                order: Some(index),
                column: Some(s.column),
                row: Some(s.row),
                width: Some(s.width),
                interpolated: Some(s.interpolated),
                rejected: Some(s.rejected),
                ..TraceRecord::default()
            })?;
        }
    }

    writer.flush().map_err(|e| ReduceError::io(context(), e))?;
    log::info!("Wrote {} orders to {}", traces.len(), path.display());
    Ok(())
}

pub fn read_trace_csv(path: &Path) -> Result<TraceSet, ReduceError> {
    let file = File::open(path)
        .map_err(|e| ReduceError::io(format!("failed to open trace table '{}'", path.display()), e))?;
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(file);

    let mut set: Option<TraceSet> = None;
    for (idx, result) in reader.deserialize::<TraceRecord>().enumerate() {
        let line = idx + 2;
        let bad = |msg: &str| ReduceError::format(format!("{}:{line}", path.display()), msg);
        let rec = result.map_err(|e| ReduceError::format(format!("{}:{line}", path.display()), e))?;

        match rec.record {
            Some(RecordKind::Set) => {
                if set.is_some() {
                    return Err(bad("duplicate set record"));
                }
                let (Some(rows), Some(columns), Some(reference_column)) = (rec.rows, rec.columns, rec.reference_column)
                else {
                    return Err(bad("set record needs rows, columns and reference_column"));
                };
                set = Some(TraceSet::empty(rows, columns, reference_column));
            }
            Some(RecordKind::Fit) => {
                let set = set.as_mut().ok_or_else(|| bad("fit record before set record"))?;
                if rec.order != Some(set.orders.len()) {
                    return Err(bad("fit records must be numbered 0, 1, 2, ..."));
                }
                let coefficients = rec
                    .coefficients
                    .as_deref()
                    .unwrap_or("")
                    .split(';')
                    .map(|c| c.trim().parse::<f64>())
                    .collect::<Result<Vec<f64>, _>>()
                    .map_err(|_| bad("unparseable coefficients"))?;
                let (Some(lo), Some(hi)) = (rec.domain_lo, rec.domain_hi) else {
                    return Err(bad("fit record needs domain_lo and domain_hi"));
                };
                set.orders.push(OrderTrace {
                    samples: Vec::new(),
                    position: Polynomial::new(coefficients, (lo, hi)),
                    rms: rec.rms.unwrap_or(0.0),
                    fit_iterations: rec.iterations.unwrap_or(0),
                    seed: (rec.seed_column.unwrap_or(0), rec.seed_row.unwrap_or(0.0)),
                    stats: OrderStats {
                        peak_mean: rec.peak_mean.unwrap_or(0.0),
                        peak_median: rec.peak_median.unwrap_or(0.0),
                        peak_max: rec.peak_max.unwrap_or(0.0),
                        saturated_columns: rec.saturated_columns.unwrap_or(0),
                    },
                });
            }
            Some(RecordKind::Sample) => {
                let set = set.as_mut().ok_or_else(|| bad("sample record before set record"))?;
                let order = rec
                    .order
                    .and_then(|o| set.orders.get_mut(o))
                    .ok_or_else(|| bad("sample record for unknown order"))?;
                let (Some(column), Some(row)) = (rec.column, rec.row) else {
                    return Err(bad("sample record needs column and row"));
                };
                order.samples.push(TraceSample {
                    column,
                    row,
                    width: rec.width.unwrap_or(0.0),
                    interpolated: rec.interpolated.unwrap_or(false),
                    rejected: rec.rejected.unwrap_or(false),
                });
            }
            None => return Err(bad("missing record kind")),
        }
    }

    let set = set.ok_or_else(|| ReduceError::format(path.display().to_string(), "no set record"))?;
    log::info!("Read {} orders from {}", set.len(), path.display());
    Ok(set)
}
