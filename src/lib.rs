//! `echelle-reduce` library crate.
//!
//! The binary (`ered`) is a thin wrapper around this library. The stages are:
//!
//! - `combine`: bias and flat frames into master frames
//! - `trace`: echelle orders located on the master flat
//! - `extract`: 1D spectra from science frames along the traces
//! - `app::pipeline`: the stages chained over a night of frames

pub mod app;
pub mod cli;
pub mod combine;
pub mod config;
pub mod data;
pub mod domain;
pub mod error;
pub mod extract;
pub mod io;
pub mod math;
pub mod report;
pub mod trace;
