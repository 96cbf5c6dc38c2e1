//! Error types for Herder operations.
//!
//! Validation never produces these: rejected values, ballots and
//! transactions are reported through return values. Errors are reserved for
//! misconfiguration and broken internal invariants.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HerderError {
    /// An error from the SCP layer, such as an insane local quorum set.
    #[error("SCP error: {0}")]
    Scp(#[from] lumen_scp::ScpError),

    /// A value could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] lumen_common::Error),

    /// Operation requires a validating node.
    #[error("not in validating state")]
    NotValidating,

    /// A value that passed validation could not be decoded once it
    /// externalized. Continuing would close a ledger on garbage.
    #[error("externalized value for slot {slot} is malformed")]
    MalformedExternalizedValue { slot: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

pub type Result<T> = std::result::Result<T, HerderError>;
