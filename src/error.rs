//! Error types.
//!
//! - `ReduceError`: everything the reduction core can fail with, grouped into
//!   input / fit / boundary / I/O kinds.
//! - `AppError`: what the `ered` binary reports (message + process exit code).

use thiserror::Error;

/// Broad classification of a [`ReduceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing input; fatal to the current stage.
    Input,
    /// Not enough points for the requested polynomial; recoverable per order.
    Fit,
    /// Aperture past the image edge; recoverable per column.
    Boundary,
    /// Reading or writing interchange files.
    Io,
}

#[derive(Debug, Error)]
pub enum ReduceError {
    #[error("frame set is empty")]
    EmptyInput,

    #[error("frame {index} ('{name}') has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        index: usize,
        name: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("configuration key `{key}`: {reason}")]
    InvalidConfig { key: String, reason: String },

    #[error("no {0} frames available")]
    MissingFrames(&'static str),

    #[error("{points} usable samples cannot constrain a degree-{degree} polynomial")]
    FitFailure { points: usize, degree: usize },

    #[error("aperture of order {order} at column {column} lies outside the image")]
    OutOfBounds { order: usize, column: usize },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {message}")]
    Format { context: String, message: String },
}

impl ReduceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReduceError::EmptyInput
            | ReduceError::ShapeMismatch { .. }
            | ReduceError::InvalidConfig { .. }
            | ReduceError::MissingFrames(_) => ErrorKind::Input,
            ReduceError::FitFailure { .. } => ErrorKind::Fit,
            ReduceError::OutOfBounds { .. } => ErrorKind::Boundary,
            ReduceError::Io { .. } | ReduceError::Format { .. } => ErrorKind::Io,
        }
    }

    pub fn invalid_config(key: &str, reason: impl Into<String>) -> Self {
        ReduceError::InvalidConfig {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ReduceError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn format(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        ReduceError::Format {
            context: context.into(),
            message: message.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl From<ReduceError> for AppError {
    fn from(err: ReduceError) -> Self {
        let exit_code = match err.kind() {
            ErrorKind::Input => 2,
            ErrorKind::Fit | ErrorKind::Boundary => 3,
            ErrorKind::Io => 4,
        };
        AppError::new(exit_code, err.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}
