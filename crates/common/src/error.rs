//! Common error type for lumen crates.

use thiserror::Error;

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad error categories shared across crates.
///
/// Crate-specific errors wrap these where a lower-level failure surfaces.
#[derive(Error, Debug)]
pub enum Error {
    /// Encoding or decoding a value failed.
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration is invalid or cannot be parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Data failed validation.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}
