//! Where the Herder believes consensus is.

use std::fmt;

use crate::value::ConsensusValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HerderState {
    /// Waiting to learn the network's current slot.
    Syncing,
    /// Following consensus slot by slot.
    Tracking,
}

impl fmt::Display for HerderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HerderState::Syncing => f.write_str("syncing"),
            HerderState::Tracking => f.write_str("tracking"),
        }
    }
}

/// The last slot the node saw externalize and its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingState {
    pub consensus_index: u64,
    pub value: ConsensusValue,
}

impl TrackingState {
    /// The slot consensus is working on now.
    pub fn next_index(&self) -> u64 {
        self.consensus_index + 1
    }
}
