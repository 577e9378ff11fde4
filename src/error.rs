//! Error types shared by every stage of the scan.
//!
//! Structural problems (bad files, misaligned samples, bad parameters) are fatal and surface
//! as `MqtlError`. Per-pair regression failures are not errors: the engine records them as
//! [`crate::engine::PairStatus`] values instead.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MqtlError {
    /// Malformed input file (wrong column count, unparsable value, duplicate id).
    #[error("Input format error in {path}:{line}: {message}")]
    InputFormat {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// Sample identifiers differ in set or order between inputs.
    #[error("Sample alignment error: {message}")]
    Alignment { message: String },

    /// Zero-variance or all-missing column.
    #[error("Degenerate column '{column}': {reason}")]
    DegenerateColumn { column: String, reason: String },

    #[error("Variant '{variant_id}' has no entry in the position map")]
    MissingVariantMapping { variant_id: String },

    #[error("Numeric error: {message}")]
    Numeric { message: String },

    #[error("Invalid threshold: {message}")]
    InvalidThreshold { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Association scan cancelled")]
    Cancelled,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, MqtlError>;

impl MqtlError {
    pub fn input_format(path: impl AsRef<Path>, line: usize, message: impl Into<String>) -> Self {
        Self::InputFormat {
            path: path.as_ref().to_path_buf(),
            line,
            message: message.into(),
        }
    }

    pub fn alignment(message: impl Into<String>) -> Self {
        Self::Alignment {
            message: message.into(),
        }
    }

    pub fn degenerate(column: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DegenerateColumn {
            column: column.into(),
            reason: reason.into(),
        }
    }

    pub fn numeric(message: impl Into<String>) -> Self {
        Self::Numeric {
            message: message.into(),
        }
    }

    pub fn invalid_threshold(message: impl Into<String>) -> Self {
        Self::InvalidThreshold {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}
