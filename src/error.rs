//! Error types used by this crate.

use thiserror::Error;

/// Error that can be raised by the methods of this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Inconsistent construction parameters or mismatched objects.
    #[error("{0}")]
    Config(String),
    /// An index was out of bounds.
    #[error("index {index} is out of range for {object} with length {len}")]
    Range {
        /// Name of the indexed object.
        object: &'static str,
        /// The offending index.
        index: usize,
        /// Length of the indexed object.
        len: usize,
    },
    /// A fill coordinate fell outside an interpolation domain that rejects
    /// out-of-range values.
    #[error("value {value} is outside the domain [{min}, {max}]")]
    Domain {
        /// The offending coordinate.
        value: f64,
        /// Lower end of the domain.
        min: f64,
        /// Upper end of the domain.
        max: f64,
    },
    /// A computation produced a non-finite number.
    #[error("{0}")]
    Numeric(String),
    /// An I/O operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A byte stream is not a supported grid container.
    #[error("{0}")]
    Format(String),
    /// Any other error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
