//! Shared primitives for the lumen validator core.
//!
//! This crate holds the small set of types every other lumen crate speaks:
//!
//! - [`Hash256`]: SHA-256 content hashes used for ledger headers, tx sets,
//!   quorum sets and buckets
//! - [`NodeId`]: a validator's 32-byte public identity
//! - [`Clock`]: a time source, with [`SystemClock`] for production and
//!   [`ManualClock`] for deterministic tests
//! - [`enum@Error`] / [`Result`]: the common error type

pub mod error;
pub mod time;
pub mod types;

pub use error::{Error, Result};
pub use time::{current_timestamp, Clock, ManualClock, SystemClock};
pub use types::{Hash256, NodeId};
