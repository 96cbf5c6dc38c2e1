//! Herder configuration.

use std::time::Duration;

use crate::error::{HerderError, Result};
use crate::pending::PendingConfig;
use crate::tx_pool::DEFAULT_POOL_TIERS;

/// Maximum slots ahead of the tracked one that envelopes are accepted for.
pub const LEDGER_VALIDITY_BRACKET: u64 = 100;

/// Externalized slots kept in SCP behind the latest one.
pub const MAX_SLOTS_TO_REMEMBER: u64 = 12;

/// Slots a peer may stay silent before its bookkeeping is dropped.
pub const NODE_EXPIRATION_SLOTS: u64 = 240;

/// How far a proposed close time may run ahead of the local clock.
pub const MAX_TIME_SLIP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct HerderConfig {
    /// Whether this node votes. Observers only track consensus.
    pub is_validator: bool,

    /// Ledgers close only when the operator asks; peer envelopes are
    /// ignored.
    pub manual_close: bool,

    /// Base fee this node proposes, in stroops.
    pub desired_base_fee: u64,

    /// Maximum transactions in a proposed set.
    pub max_tx_set_size: usize,

    /// Target time between consecutive ledger triggers.
    pub target_round_duration: Duration,

    /// No externalize for this long means consensus was lost.
    pub consensus_stuck_timeout: Duration,

    /// Period between re-sends of the latest local envelopes.
    pub rebroadcast_interval: Duration,

    pub ledger_validity_bracket: u64,
    pub max_slots_to_remember: u64,
    pub node_expiration_slots: u64,
    pub max_time_slip: Duration,
    pub pool_tiers: usize,
    pub pending: PendingConfig,
}

impl Default for HerderConfig {
    fn default() -> Self {
        Self {
            is_validator: false,
            manual_close: false,
            desired_base_fee: 100,
            max_tx_set_size: 1000,
            target_round_duration: Duration::from_secs(5),
            consensus_stuck_timeout: Duration::from_secs(35),
            rebroadcast_interval: Duration::from_secs(2),
            ledger_validity_bracket: LEDGER_VALIDITY_BRACKET,
            max_slots_to_remember: MAX_SLOTS_TO_REMEMBER,
            node_expiration_slots: NODE_EXPIRATION_SLOTS,
            max_time_slip: MAX_TIME_SLIP,
            pool_tiers: DEFAULT_POOL_TIERS,
            pending: PendingConfig::default(),
        }
    }
}

impl HerderConfig {
    pub fn validator() -> Self {
        Self {
            is_validator: true,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("target_round_duration", self.target_round_duration),
            ("consensus_stuck_timeout", self.consensus_stuck_timeout),
            ("rebroadcast_interval", self.rebroadcast_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(HerderError::InvalidConfiguration(format!("{name} must be positive")));
            }
        }
        if self.desired_base_fee == 0 {
            return Err(HerderError::InvalidConfiguration(
                "desired_base_fee must be positive".into(),
            ));
        }
        if self.max_tx_set_size == 0 {
            return Err(HerderError::InvalidConfiguration(
                "max_tx_set_size must be positive".into(),
            ));
        }
        if self.pool_tiers < 2 {
            return Err(HerderError::InvalidConfiguration(format!(
                "pool_tiers must be at least 2, got {}",
                self.pool_tiers
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(HerderConfig::default().validate().is_ok());
        assert!(HerderConfig::validator().is_validator);
    }

    #[test]
    fn test_zero_durations_are_rejected() {
        let config = HerderConfig {
            consensus_stuck_timeout: Duration::ZERO,
            ..HerderConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("consensus_stuck_timeout"));

        let config = HerderConfig {
            pool_tiers: 1,
            ..HerderConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
