//! Consensus coordination for lumen.
//!
//! The Herder drives SCP one ledger at a time. It owns:
//!
//! - a [`TransactionPool`] of transactions waiting for a ledger, aged in
//!   tiers and evicted when they sit out too many closes
//! - a [`PendingEnvelopes`] store that holds envelopes until the quorum
//!   sets and transaction sets they cite are known, and caches those
//!   payloads by hash
//! - the SCP driver that validates and combines [`ConsensusValue`]s
//! - a [`TimerQueue`] of deadlines the host fires through
//!   [`Herder::fire_due_timers`]
//!
//! The ledger and the network are collaborators behind the
//! [`LedgerManager`] and [`Overlay`] traits.
//!
//! ```ignore
//! let mut herder = Herder::new(node, qset, HerderConfig::validator(), ledger, overlay, clock, metrics)?;
//! herder.bootstrap()?;
//! loop {
//!     herder.fire_due_timers(clock.now())?;
//!     // feed envelopes, tx sets and transactions from the overlay
//! }
//! ```

mod config;
mod error;
mod herder;
mod ledger;
mod metrics;
mod pending;
mod scp_driver;
mod state;
mod timer;
mod tx;
mod tx_pool;
mod value;

pub use config::{
    HerderConfig, LEDGER_VALIDITY_BRACKET, MAX_SLOTS_TO_REMEMBER, MAX_TIME_SLIP,
    NODE_EXPIRATION_SLOTS,
};
pub use error::{HerderError, Result};
pub use herder::Herder;
pub use ledger::{AccountState, LastClosedLedger, LedgerCloseData, LedgerManager, Overlay};
pub use metrics::{Counter, HerderMetrics, HerderMetricsSnapshot};
pub use pending::{
    FetchRequest, PendingConfig, PendingEnvelopes, PendingStats, RecvResult,
    DEFAULT_MAX_CACHED_QUORUM_SETS, DEFAULT_MAX_CACHED_TX_SETS,
};
pub use state::{HerderState, TrackingState};
pub use timer::{FiredTimer, HerderTimer, TimerQueue};
pub use tx::{AccountId, Transaction, TransactionSet, TxError};
pub use tx_pool::{TransactionPool, TransactionStatus, DEFAULT_POOL_TIERS};
pub use value::ConsensusValue;
