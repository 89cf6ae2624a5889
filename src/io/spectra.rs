//! Export of extracted spectra.
//!
//! - long-format CSV: one row per (order, column)
//! - JSON summary per science frame

use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::{ColumnFlag, ExtractMethod, ExtractedSpectrum};
use crate::error::ReduceError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumRow {
    pub order: usize,
    pub column: usize,
    pub flux: f64,
    pub variance: Option<f64>,
    pub flag: ColumnFlag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub order: usize,
    pub full: usize,
    pub partial: usize,
    pub empty: usize,
    /// Median flux over columns with a finite value.
    pub median_flux: Option<f64>,
}

/// Per-frame record written next to the spectra CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectraSummary {
    pub frame: String,
    pub observation_time: Option<String>,
    pub exposure_time: Option<f64>,
    pub method: ExtractMethod,
    pub orders: Vec<OrderSummary>,
}

impl SpectraSummary {
    pub fn new(
        frame: &str,
        observation_time: Option<String>,
        exposure_time: Option<f64>,
        method: ExtractMethod,
        spectra: &[ExtractedSpectrum],
    ) -> Self {
        let orders = spectra
            .iter()
            .map(|s| {
                let count = |flag: ColumnFlag| s.flags.iter().filter(|f| **f == flag).count();
                let finite: Vec<f64> = s.flux.iter().copied().filter(|f| f.is_finite()).collect();
                OrderSummary {
                    order: s.order,
                    full: count(ColumnFlag::Full),
                    partial: count(ColumnFlag::Partial),
                    empty: count(ColumnFlag::Empty),
                    median_flux: crate::math::median(&finite),
                }
            })
            .collect();
        Self {
            frame: frame.to_string(),
            observation_time,
            exposure_time,
            method,
            orders,
        }
    }
}

pub fn write_spectra_csv(path: &Path, spectra: &[ExtractedSpectrum]) -> Result<(), ReduceError> {
    let context = || format!("failed to write spectra '{}'", path.display());
    let file = File::create(path).map_err(|e| ReduceError::io(context(), e))?;
    let mut writer = csv::Writer::from_writer(file);
    for s in spectra {
        for (column, (&flux, &flag)) in s.flux.iter().zip(&s.flags).enumerate() {
            writer
                .serialize(SpectrumRow {
                    order: s.order,
                    column,
                    flux,
                    variance: s.variance.as_ref().map(|v| v[column]),
                    flag,
                })
                .map_err(|e| ReduceError::format(context(), e))?;
        }
    }
    writer.flush().map_err(|e| ReduceError::io(context(), e))
}

pub fn read_spectra_csv(path: &Path) -> Result<Vec<SpectrumRow>, ReduceError> {
    let file =
        File::open(path).map_err(|e| ReduceError::io(format!("failed to open spectra '{}'", path.display()), e))?;
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(file);
    reader
        .deserialize()
        .enumerate()
        .map(|(idx, row)| row.map_err(|e| ReduceError::format(format!("{}:{}", path.display(), idx + 2), e)))
        .collect()
}

pub fn write_summary_json(path: &Path, summary: &SpectraSummary) -> Result<(), ReduceError> {
    let file = File::create(path)
        .map_err(|e| ReduceError::io(format!("failed to create summary '{}'", path.display()), e))?;
    serde_json::to_writer_pretty(file, summary)
        .map_err(|e| ReduceError::format(format!("failed to write summary '{}'", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spectrum() -> ExtractedSpectrum {
        ExtractedSpectrum {
            order: 2,
            flux: vec![f64::NAN, 10.5, 12.0],
            variance: Some(vec![f64::NAN, 1.5, 2.0]),
            flags: vec![ColumnFlag::Empty, ColumnFlag::Partial, ColumnFlag::Full],
        }
    }

    #[test]
    fn csv_has_one_row_per_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spec.csv");
        write_spectra_csv(&path, &[spectrum()]).unwrap();
        let rows = read_spectra_csv(&path).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].flux.is_nan());
        assert_eq!(rows[0].flag, ColumnFlag::Empty);
        assert_eq!(rows[2].flux, 12.0);
        assert_eq!(rows[1].variance, Some(1.5));
        assert_eq!(rows[1].order, 2);
    }

    #[test]
    fn summary_counts_flags() {
        let summary = SpectraSummary::new("sci_001", None, Some(600.0), ExtractMethod::Sum, &[spectrum()]);
        let o = &summary.orders[0];
        assert_eq!((o.full, o.partial, o.empty), (1, 1, 1));
        assert_eq!(o.median_flux, Some(11.25));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sum.json");
        write_summary_json(&path, &summary).unwrap();
        let back: SpectraSummary = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, summary);
    }
}
