//! Numerical building blocks shared by the combiner, tracer and extractor.

pub mod clip;
pub mod ols;
pub mod poly;
pub mod smooth;
pub mod stats;

pub use clip::*;
pub use ols::*;
pub use poly::*;
pub use smooth::*;
pub use stats::*;
