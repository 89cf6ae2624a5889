//! Shared domain types.
//!
//! Arrays are `ndarray::Array2<f64>` indexed `[[row, column]]`, where rows run
//! along the cross-dispersion axis and columns along the dispersion axis.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::math::Polynomial;

/// One header value as delivered by the image reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl HeaderValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HeaderValue::Int(v) => Some(*v as f64),
            HeaderValue::Float(v) => Some(*v),
            HeaderValue::Text(s) => s.trim().parse().ok(),
            HeaderValue::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Header key-value metadata of a frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameHeader {
    pub entries: BTreeMap<String, HeaderValue>,
}

impl FrameHeader {
    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: HeaderValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn exposure_time(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(HeaderValue::as_f64)
    }

    pub fn frame_kind(&self, key: &str) -> Option<FrameKind> {
        self.get(key)
            .and_then(HeaderValue::as_str)
            .and_then(FrameKind::from_header_value)
    }

    /// Observation start time, ISO-8601 without time zone.
    pub fn observation_time(&self, key: &str) -> Option<NaiveDateTime> {
        let raw = self.get(key)?.as_str()?.trim();
        ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
    }
}

/// Calibration role of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Bias,
    Flat,
    Science,
}

impl FrameKind {
    /// Interpret a frame-type header value (`BIAS`, `Flat Red`, `OBJECT`, ...).
    pub fn from_header_value(value: &str) -> Option<Self> {
        let v = value.trim().to_ascii_lowercase();
        if v.starts_with("bias") || v == "zero" {
            Some(FrameKind::Bias)
        } else if v.starts_with("flat") {
            Some(FrameKind::Flat)
        } else if v.starts_with("sci") || v.starts_with("obj") || v == "star" {
            Some(FrameKind::Science)
        } else {
            None
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FrameKind::Bias => "bias",
            FrameKind::Flat => "flat",
            FrameKind::Science => "science",
        }
    }
}

/// Immutable detector exposure as read from disk.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub name: String,
    pub data: Array2<f64>,
    pub header: FrameHeader,
}

impl RawFrame {
    pub fn new(name: impl Into<String>, data: Array2<f64>) -> Self {
        Self {
            name: name.into(),
            data,
            header: FrameHeader::default(),
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }
}

/// Diagnostics of one combination run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CombineStats {
    /// Largest number of clipping rounds any pixel needed.
    pub max_iterations: usize,
    /// Pixels where clipping would have removed every contributor.
    pub reverted_pixels: usize,
    /// Rejected values per input frame (same order as the inputs).
    pub rejected_per_frame: Vec<usize>,
}

impl CombineStats {
    pub fn rejected_total(&self) -> usize {
        self.rejected_per_frame.iter().sum()
    }
}

/// Combined calibration frame with its per-pixel variance.
#[derive(Debug, Clone)]
pub struct MasterFrame {
    pub data: Array2<f64>,
    pub variance: Array2<f64>,
    /// Surviving contributors per pixel.
    pub contributors: Array2<u32>,
    pub n_frames: usize,
    pub exposure_time: Option<f64>,
    pub stats: CombineStats,
}

impl MasterFrame {
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }
}

/// One point along an order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraceSample {
    pub column: usize,
    pub row: f64,
    /// Width of the cross-section above half maximum, in pixels.
    pub width: f64,
    /// Filled by gap bridging rather than measured.
    pub interpolated: bool,
    /// Excluded by the robust polynomial fit.
    pub rejected: bool,
}

impl TraceSample {
    pub fn measured(column: usize, row: f64, width: f64) -> Self {
        Self {
            column,
            row,
            width,
            interpolated: false,
            rejected: false,
        }
    }

    /// Measured and kept by the fit.
    pub fn is_accepted(&self) -> bool {
        !self.interpolated && !self.rejected
    }
}

/// Peak flux statistics along a trace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderStats {
    pub peak_mean: f64,
    pub peak_median: f64,
    pub peak_max: f64,
    /// Columns whose aperture core contains a saturated pixel.
    pub saturated_columns: usize,
}

/// Location of one echelle order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderTrace {
    /// Samples sorted by column.
    pub samples: Vec<TraceSample>,
    pub position: Polynomial,
    /// RMS of the fit residuals over accepted samples (pixels).
    pub rms: f64,
    pub fit_iterations: usize,
    /// Column and row of the seed this order was linked from.
    pub seed: (usize, f64),
    pub stats: OrderStats,
}

impl OrderTrace {
    /// Row center at `column`; extrapolates outside the sampled range.
    pub fn center(&self, column: f64) -> f64 {
        self.position.eval(column)
    }

    pub fn accepted_count(&self) -> usize {
        self.samples.iter().filter(|s| s.is_accepted()).count()
    }

    pub fn interpolated_count(&self) -> usize {
        self.samples.iter().filter(|s| s.interpolated).count()
    }

    pub fn column_range(&self) -> Option<(usize, usize)> {
        Some((self.samples.first()?.column, self.samples.last()?.column))
    }
}

/// All orders found on one detector, sorted by row at `reference_column`.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceSet {
    pub rows: usize,
    pub columns: usize,
    pub reference_column: usize,
    pub orders: Vec<OrderTrace>,
}

impl TraceSet {
    pub fn empty(rows: usize, columns: usize, reference_column: usize) -> Self {
        Self {
            rows,
            columns,
            reference_column,
            orders: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

/// Quality of one extracted column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnFlag {
    Full,
    /// Aperture clipped at the image edge.
    Partial,
    /// Aperture entirely outside the image.
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractMethod {
    Sum,
    Optimal,
}

impl std::str::FromStr for ExtractMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sum" => Ok(ExtractMethod::Sum),
            "optimal" => Ok(ExtractMethod::Optimal),
            other => Err(format!("unknown extraction method '{other}' (expected sum or optimal)")),
        }
    }
}

/// 1D spectrum of one order, indexed by detector column.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedSpectrum {
    pub order: usize,
    pub flux: Vec<f64>,
    pub variance: Option<Vec<f64>>,
    pub flags: Vec<ColumnFlag>,
}

impl ExtractedSpectrum {
    pub fn columns_flagged(&self, flag: ColumnFlag) -> Vec<usize> {
        self.flags
            .iter()
            .enumerate()
            .filter(|(_, f)| **f == flag)
            .map(|(c, _)| c)
            .collect()
    }
}

/// Why a candidate order did not make it into the trace set.
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    /// Too few accepted columns after linking.
    TooFewColumns { accepted: usize, required: usize },
    /// Polynomial could not be fitted.
    FitFailure { points: usize, degree: usize },
    /// Closer than the minimum separation to a better-sampled neighbour.
    Separation { kept_row: f64, distance: f64, minimum: f64 },
    /// Crosses a better-sampled neighbour somewhere along the detector.
    Crossing { kept_row: f64, column: usize },
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::TooFewColumns { accepted, required } => {
                write!(f, "only {accepted} accepted columns (need {required})")
            }
            DropReason::FitFailure { points, degree } => {
                write!(f, "{points} points cannot constrain degree {degree}")
            }
            DropReason::Separation {
                kept_row,
                distance,
                minimum,
            } => write!(
                f,
                "{distance:.2} px from order at row {kept_row:.2} (minimum {minimum:.2})"
            ),
            DropReason::Crossing { kept_row, column } => {
                write!(f, "crosses order at row {kept_row:.2} near column {column}")
            }
        }
    }
}

/// A recoverable condition attached to a best-effort result.
#[derive(Debug, Clone, PartialEq)]
pub enum Issue {
    UnknownConfigKey {
        key: String,
    },
    CandidateDropped {
        seed_column: usize,
        seed_row: f64,
        reason: DropReason,
    },
    PartialColumns {
        order: usize,
        partial: Vec<usize>,
        empty: Vec<usize>,
    },
    FrameFailed {
        frame: String,
        error: String,
    },
}

impl std::fmt::Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Issue::UnknownConfigKey { key } => write!(f, "unrecognized configuration key `{key}`"),
            Issue::CandidateDropped {
                seed_column,
                seed_row,
                reason,
            } => write!(
                f,
                "dropped candidate seeded at column {seed_column}, row {seed_row:.2}: {reason}"
            ),
            Issue::PartialColumns {
                order,
                partial,
                empty,
            } => write!(
                f,
                "order {order}: {} partial and {} empty columns",
                partial.len(),
                empty.len()
            ),
            Issue::FrameFailed { frame, error } => write!(f, "frame '{frame}' failed: {error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_kind_from_common_header_values() {
        assert_eq!(FrameKind::from_header_value("BIAS"), Some(FrameKind::Bias));
        assert_eq!(FrameKind::from_header_value("Flat Red"), Some(FrameKind::Flat));
        assert_eq!(FrameKind::from_header_value("object"), Some(FrameKind::Science));
        assert_eq!(FrameKind::from_header_value("ThAr"), None);
    }

    #[test]
    fn header_parses_numbers_and_dates() {
        let mut header = FrameHeader::default();
        header.insert("EXPTIME", HeaderValue::Text("300.5".into()));
        header.insert("DATE-OBS", HeaderValue::Text("2019-03-02T21:14:05.5".into()));
        assert_eq!(header.exposure_time("EXPTIME"), Some(300.5));
        let t = header.observation_time("DATE-OBS").unwrap();
        assert_eq!(t.format("%H:%M:%S").to_string(), "21:14:05");
        assert!(header.exposure_time("MISSING").is_none());
    }
}
