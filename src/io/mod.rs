//! Input/output at the stage boundaries.
//!
//! - frame JSON documents and the `FrameReader` seam (`frame`)
//! - trace-set CSV table (`trace_table`)
//! - spectra CSV + per-frame JSON summary (`spectra`)
//! - configuration JSON flattened to dotted keys (`config`)

pub mod config;
pub mod frame;
pub mod spectra;
pub mod trace_table;

pub use config::*;
pub use frame::*;
pub use spectra::*;
pub use trace_table::*;
