//! Error types shared by the transfer engine.
//!
//! Only validation problems are reported as errors. Numerical degeneracies
//! (singular eigenmode matrices) propagate as NaN values confined to the
//! affected frequency bins, and normalization factors are clamped silently.

use thiserror::Error;

/// Errors raised before any numerical work starts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// An array does not have the shape an operation requires.
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// Optical or field data is inconsistent.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A scalar parameter is out of range.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// A string could not be parsed into one of the known variants.
    #[error("unknown {kind} '{value}'")]
    UnknownVariant { kind: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Error::InvalidShape(msg.into())
    }

    pub(crate) fn data(msg: impl Into<String>) -> Self {
        Error::InvalidData(msg.into())
    }

    pub(crate) fn parameter(name: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}
