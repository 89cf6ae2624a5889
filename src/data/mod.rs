//! Frame sources that do not come from disk.

pub mod synthetic;
