//! Error types for SCP operations.
//!
//! Message processing itself never fails with an error: invalid statements
//! are reported through [`crate::EnvelopeState::Invalid`]. Errors cover
//! configuration problems such as an unusable local quorum set.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScpError {
    #[error("invalid quorum set: {0}")]
    InvalidQuorumSet(String),

    #[error("slot {slot} already externalized a different value")]
    ConflictingExternalize { slot: u64 },
}

pub type Result<T> = std::result::Result<T, ScpError>;
