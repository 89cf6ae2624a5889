//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - frames and headers (`RawFrame`, `FrameHeader`, `FrameKind`)
//! - stage outputs (`MasterFrame`, `TraceSet`, `ExtractedSpectrum`)
//! - the recoverable-issue list attached to best-effort results (`Issue`)

pub mod types;

pub use types::*;
