//! Frame interchange documents.
//!
//! Frames travel as JSON: `{ name, header, rows, columns, data, variance? }`
//! with `data` (and `variance`) stored row-major. Reading goes through the
//! [`FrameReader`] seam so other image formats can be plugged in without
//! touching the reduction stages.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::domain::{CombineStats, FrameHeader, HeaderValue, MasterFrame, RawFrame};
use crate::error::ReduceError;

/// Header key recording how many frames went into a master.
pub const NCOMBINE_KEY: &str = "NCOMBINE";

/// Source of raw frames.
pub trait FrameReader {
    fn read_frame(&self, path: &Path) -> Result<RawFrame, ReduceError>;

    fn read_frames(&self, paths: &[PathBuf]) -> Result<Vec<RawFrame>, ReduceError> {
        paths.iter().map(|p| self.read_frame(p)).collect()
    }
}

/// Reads the JSON interchange format.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFrameReader;

impl FrameReader for JsonFrameReader {
    fn read_frame(&self, path: &Path) -> Result<RawFrame, ReduceError> {
        let (frame, _) = read_frame_json(path)?;
        Ok(frame)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameFile {
    pub name: String,
    #[serde(default)]
    pub header: FrameHeader,
    pub rows: usize,
    pub columns: usize,
    pub data: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variance: Option<Vec<f64>>,
}

impl FrameFile {
    pub fn new(name: &str, header: &FrameHeader, data: &Array2<f64>, variance: Option<&Array2<f64>>) -> Self {
        let (rows, columns) = data.dim();
        Self {
            name: name.to_string(),
            header: header.clone(),
            rows,
            columns,
            data: data.iter().copied().collect(),
            variance: variance.map(|v| v.iter().copied().collect()),
        }
    }

    fn array(&self, values: Vec<f64>, what: &str) -> Result<Array2<f64>, ReduceError> {
        Array2::from_shape_vec((self.rows, self.columns), values).map_err(|e| {
            ReduceError::format(
                format!("frame '{}'", self.name),
                format!("{what} does not match {}x{}: {e}", self.rows, self.columns),
            )
        })
    }

    /// Split into the frame and its optional variance map.
    pub fn into_parts(mut self) -> Result<(RawFrame, Option<Array2<f64>>), ReduceError> {
        let variance = match self.variance.take() {
            Some(v) => Some(self.array(v, "variance")?),
            None => None,
        };
        let data = std::mem::take(&mut self.data);
        let data = self.array(data, "data")?;
        Ok((
            RawFrame {
                name: self.name,
                data,
                header: self.header,
            },
            variance,
        ))
    }
}

pub fn read_frame_json(path: &Path) -> Result<(RawFrame, Option<Array2<f64>>), ReduceError> {
    let file = File::open(path).map_err(|e| ReduceError::io(format!("failed to open frame '{}'", path.display()), e))?;
    let doc: FrameFile = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| ReduceError::format(format!("invalid frame JSON '{}'", path.display()), e))?;
    log::debug!("Read frame '{}' ({}x{}) from {}", doc.name, doc.rows, doc.columns, path.display());
    doc.into_parts()
}

pub fn write_frame_json(path: &Path, doc: &FrameFile) -> Result<(), ReduceError> {
    let file =
        File::create(path).map_err(|e| ReduceError::io(format!("failed to create frame '{}'", path.display()), e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, doc)
        .map_err(|e| ReduceError::format(format!("failed to write frame '{}'", path.display()), e))?;
    writer
        .flush()
        .map_err(|e| ReduceError::io(format!("failed to write frame '{}'", path.display()), e))
}

/// Write a master frame with its variance map.
pub fn write_master_json(path: &Path, name: &str, master: &MasterFrame, exptime_key: &str) -> Result<(), ReduceError> {
    let mut header = FrameHeader::default();
    header.insert(NCOMBINE_KEY, HeaderValue::Int(master.n_frames as i64));
    if let Some(t) = master.exposure_time {
        header.insert(exptime_key, HeaderValue::Float(t));
    }
    write_frame_json(path, &FrameFile::new(name, &header, &master.data, Some(&master.variance)))
}

/// Read a master frame written by [`write_master_json`].
///
/// Frames without a variance map get zero variance.
pub fn read_master_json(path: &Path, exptime_key: &str) -> Result<MasterFrame, ReduceError> {
    let (frame, variance) = read_frame_json(path)?;
    let n_frames = frame
        .header
        .get(NCOMBINE_KEY)
        .and_then(HeaderValue::as_f64)
        .map(|n| n.max(1.0) as usize)
        .unwrap_or(1);
    let shape = frame.shape();
    Ok(MasterFrame {
        variance: variance.unwrap_or_else(|| Array2::zeros(shape)),
        contributors: Array2::from_elem(shape, n_frames as u32),
        n_frames,
        exposure_time: frame.header.exposure_time(exptime_key),
        stats: CombineStats::default(),
        data: frame.data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.json");
        let data = Array2::from_shape_fn((3, 4), |(r, c)| (r * 10 + c) as f64 + 0.25);
        let mut header = FrameHeader::default();
        header.insert("IMAGETYP", HeaderValue::Text("FLAT".into()));
        write_frame_json(&path, &FrameFile::new("flat_001", &header, &data, None)).unwrap();

        let frame = JsonFrameReader.read_frame(&path).unwrap();
        assert_eq!(frame.name, "flat_001");
        assert_eq!(frame.data, data);
        assert_eq!(frame.data[[2, 3]], 23.25);
        assert_eq!(frame.header, header);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_flush_is_reported() {
        // Writes to /dev/full fail with ENOSPC once the buffer is flushed.
        let data = Array2::from_elem((2, 2), 1.0);
        let doc = FrameFile::new("small", &FrameHeader::default(), &data, None);
        let err = write_frame_json(Path::new("/dev/full"), &doc).unwrap_err();
        assert!(matches!(err, ReduceError::Io { .. }), "{err}");
    }

    #[test]
    fn wrong_length_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"name":"x","rows":2,"columns":2,"data":[1,2,3]}"#).unwrap();
        let err = read_frame_json(&path).unwrap_err();
        assert!(matches!(err, ReduceError::Format { .. }), "{err}");
    }

    #[test]
    fn master_keeps_variance_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bias.json");
        let master = MasterFrame {
            data: Array2::from_elem((2, 2), 300.0),
            variance: Array2::from_elem((2, 2), 0.5),
            contributors: Array2::from_elem((2, 2), 5),
            n_frames: 5,
            exposure_time: Some(0.0),
            stats: CombineStats::default(),
        };
        write_master_json(&path, "master_bias", &master, "EXPTIME").unwrap();
        let back = read_master_json(&path, "EXPTIME").unwrap();
        assert_eq!(back.n_frames, 5);
        assert_eq!(back.variance, master.variance);
        assert_eq!(back.exposure_time, Some(0.0));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = read_frame_json(Path::new("/nonexistent/frame.json")).unwrap_err();
        assert!(matches!(err, ReduceError::Io { .. }));
    }
}
