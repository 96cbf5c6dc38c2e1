//! Node configuration.
//!
//! Loaded from a TOML file, every section optional:
//!
//! ```toml
//! [node]
//! name = "alpha"
//! is_validator = true
//!
//! [herder]
//! target_round_secs = 5
//!
//! [quorum]
//! threshold = 2
//! validators = ["alpha", "beta", "gamma"]
//!
//! [history]
//! checkpoint_frequency = 64
//! archives = ["local"]
//!
//! [logging]
//! level = "info"
//! format = "text"
//! ```
//!
//! Validators in `[quorum]` are either 64-character hex node ids or seed
//! strings hashed into an id, the same way `[node].name` names the local
//! node when no `seed` is given.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use lumen_common::NodeId;
use lumen_herder::{
    HerderConfig, PendingConfig, LEDGER_VALIDITY_BRACKET, MAX_SLOTS_TO_REMEMBER,
    NODE_EXPIRATION_SLOTS,
};
use lumen_history::{Checkpoints, DEFAULT_CHECKPOINT_FREQUENCY};
use lumen_scp::{check_quorum_set_sane, QuorumSet};
use serde::{Deserialize, Serialize};

use crate::logging::{LogConfig, LogFormat};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub herder: HerderSection,
    pub quorum: QuorumSetConfig,
    pub history: HistorySection,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    /// Overrides `name` as the source of the node id.
    pub seed: Option<String>,
    pub is_validator: bool,
    pub manual_close: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "lumen".to_string(),
            seed: None,
            is_validator: false,
            manual_close: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HerderSection {
    pub desired_base_fee: u64,
    pub max_tx_set_size: usize,
    pub target_round_secs: u64,
    pub consensus_stuck_secs: u64,
    pub rebroadcast_secs: u64,
    pub ledger_validity_bracket: u64,
    pub max_slots_to_remember: u64,
    pub node_expiration_slots: u64,
    pub pool_tiers: usize,
    pub max_cached_quorum_sets: usize,
    pub max_cached_tx_sets: usize,
}

impl Default for HerderSection {
    fn default() -> Self {
        let herder = HerderConfig::default();
        Self {
            desired_base_fee: herder.desired_base_fee,
            max_tx_set_size: herder.max_tx_set_size,
            target_round_secs: herder.target_round_duration.as_secs(),
            consensus_stuck_secs: herder.consensus_stuck_timeout.as_secs(),
            rebroadcast_secs: herder.rebroadcast_interval.as_secs(),
            ledger_validity_bracket: LEDGER_VALIDITY_BRACKET,
            max_slots_to_remember: MAX_SLOTS_TO_REMEMBER,
            node_expiration_slots: NODE_EXPIRATION_SLOTS,
            pool_tiers: herder.pool_tiers,
            max_cached_quorum_sets: herder.pending.max_quorum_sets,
            max_cached_tx_sets: herder.pending.max_tx_sets,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumSetConfig {
    pub threshold: u32,
    pub validators: Vec<String>,
    pub inner_sets: Vec<QuorumSetConfig>,
}

impl QuorumSetConfig {
    pub fn to_quorum_set(&self) -> anyhow::Result<QuorumSet> {
        let validators = self
            .validators
            .iter()
            .map(String::as_str)
            .map(parse_node_id)
            .collect::<anyhow::Result<Vec<_>>>()?;
        let inner_sets = self
            .inner_sets
            .iter()
            .map(QuorumSetConfig::to_quorum_set)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(QuorumSet::new(self.threshold, validators).with_inner_sets(inner_sets))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    pub checkpoint_frequency: u32,
    pub archives: Vec<String>,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            checkpoint_frequency: DEFAULT_CHECKPOINT_FREQUENCY,
            archives: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `text` or `json`.
    pub format: String,
    pub colors: bool,
    /// Partition name to level, e.g. `SCP = "trace"`.
    pub partitions: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            colors: true,
            partitions: BTreeMap::new(),
        }
    }
}

impl LoggingConfig {
    pub fn to_log_config(&self) -> anyhow::Result<LogConfig> {
        let format: LogFormat = self.format.parse()?;
        let mut config = LogConfig::default()
            .with_level(&self.level)?
            .with_format(format)
            .with_colors(self.colors);
        for (partition, level) in &self.partitions {
            config = config.with_partition(partition, level)?;
        }
        Ok(config)
    }
}

/// A 64-character hex string is taken as a raw id, anything else as a seed.
pub fn parse_node_id(s: &str) -> anyhow::Result<NodeId> {
    if s.is_empty() {
        anyhow::bail!("empty validator entry");
    }
    if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()) {
        return NodeId::from_hex(s).map_err(|e| anyhow::anyhow!("bad node id {s}: {e}"));
    }
    Ok(NodeId::from_seed(s))
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration, then apply `LUMEN_*` environment overrides.
    pub fn from_file_with_env(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Overrides read through `lookup`:
    /// - LUMEN_LOG_LEVEL
    /// - LUMEN_LOG_FORMAT
    /// - LUMEN_MANUAL_CLOSE
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("LUMEN_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Some(val) = lookup("LUMEN_LOG_FORMAT") {
            self.logging.format = val;
        }
        if let Some(val) = lookup("LUMEN_MANUAL_CLOSE") {
            self.node.manual_close = matches!(val.as_str(), "1" | "true" | "yes");
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node.name.is_empty() && self.node.seed.is_none() {
            anyhow::bail!("node needs a name or a seed");
        }
        let has_quorum = !self.quorum.validators.is_empty() || !self.quorum.inner_sets.is_empty();
        if self.node.is_validator && !has_quorum {
            anyhow::bail!("validators must configure a quorum set");
        }
        if has_quorum {
            let qset = self.quorum.to_quorum_set()?;
            check_quorum_set_sane(&qset, false)
                .map_err(|e| anyhow::anyhow!("quorum set rejected: {e}"))?;
        }
        if self.history.checkpoint_frequency == 0 {
            anyhow::bail!("checkpoint_frequency must be > 0");
        }
        self.herder_config().validate().context("[herder]")?;
        self.logging.to_log_config().context("[logging]")?;
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_seed(self.node.seed.as_deref().unwrap_or(&self.node.name))
    }

    /// The configured quorum set, or `{1, [self]}` when none is given.
    pub fn quorum_set(&self) -> anyhow::Result<QuorumSet> {
        if self.quorum.validators.is_empty() && self.quorum.inner_sets.is_empty() {
            return Ok(QuorumSet::singleton(self.node_id()));
        }
        self.quorum.to_quorum_set()
    }

    pub fn herder_config(&self) -> HerderConfig {
        let h = &self.herder;
        HerderConfig {
            is_validator: self.node.is_validator,
            manual_close: self.node.manual_close,
            desired_base_fee: h.desired_base_fee,
            max_tx_set_size: h.max_tx_set_size,
            target_round_duration: Duration::from_secs(h.target_round_secs),
            consensus_stuck_timeout: Duration::from_secs(h.consensus_stuck_secs),
            rebroadcast_interval: Duration::from_secs(h.rebroadcast_secs),
            ledger_validity_bracket: h.ledger_validity_bracket,
            max_slots_to_remember: h.max_slots_to_remember,
            node_expiration_slots: h.node_expiration_slots,
            pool_tiers: h.pool_tiers,
            pending: PendingConfig {
                max_quorum_sets: h.max_cached_quorum_sets,
                max_tx_sets: h.max_cached_tx_sets,
            },
            ..HerderConfig::default()
        }
    }

    pub fn checkpoints(&self) -> anyhow::Result<Checkpoints> {
        Checkpoints::new(self.history.checkpoint_frequency)
            .ok_or_else(|| anyhow::anyhow!("checkpoint_frequency must be > 0"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use lumen_scp::hash_quorum_set;

    use super::*;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("lumen.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(!config.node.is_validator);
        assert_eq!(config.history.checkpoint_frequency, 64);
        assert_eq!(config.herder_config().ledger_validity_bracket, 100);
        assert_eq!(
            config.quorum_set().unwrap(),
            QuorumSet::singleton(NodeId::from_seed("lumen"))
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
            [node]
            name = "alpha"
            is_validator = true

            [herder]
            target_round_secs = 1
            max_tx_set_size = 50

            [quorum]
            threshold = 2
            validators = ["alpha", "beta", "gamma"]
            "#,
        );

        let config = AppConfig::from_file(&path).unwrap();
        config.validate().unwrap();
        let herder = config.herder_config();
        assert!(herder.is_validator);
        assert_eq!(herder.target_round_duration, Duration::from_secs(1));
        assert_eq!(herder.max_tx_set_size, 50);
        assert_eq!(herder.consensus_stuck_timeout, Duration::from_secs(35));

        let qset = config.quorum_set().unwrap();
        assert_eq!(qset.threshold, 2);
        assert_eq!(qset.validators[0], NodeId::from_seed("alpha"));
        assert_eq!(config.node_id(), NodeId::from_seed("alpha"));
        assert_eq!(
            hash_quorum_set(&qset),
            hash_quorum_set(&config.quorum.to_quorum_set().unwrap())
        );
    }

    #[test]
    fn test_hex_validator_ids() {
        let id = NodeId::from_seed("beta");
        assert_eq!(parse_node_id(&id.to_hex()).unwrap(), id);
        assert_eq!(parse_node_id("beta").unwrap(), id);
        assert!(parse_node_id("").is_err());
    }

    #[test]
    fn test_insane_quorum_set_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
            [quorum]
            threshold = 3
            validators = ["alpha", "beta"]
            "#,
        );
        let config = AppConfig::from_file(&path).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validator_needs_quorum_set() {
        let mut config = AppConfig::default();
        config.node.is_validator = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_durations_rejected() {
        let mut config = AppConfig::default();
        config.herder.consensus_stuck_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.history.checkpoint_frequency = 0;
        assert!(config.validate().is_err());
        assert!(config.checkpoints().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("LUMEN_LOG_LEVEL", "debug"),
            ("LUMEN_LOG_FORMAT", "json"),
            ("LUMEN_MANUAL_CLOSE", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
        assert!(config.node.manual_close);
        assert!(config.herder_config().manual_close);
    }

    #[test]
    fn test_bad_log_format_rejected() {
        let mut config = AppConfig::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_logging_partitions() {
        let config: AppConfig = toml::from_str(
            r#"
            [logging]
            level = "warn"
            partitions = { SCP = "trace" }
            "#,
        )
        .unwrap();
        let log = config.logging.to_log_config().unwrap();
        assert_eq!(log.directives(), "warn,lumen_scp=trace");

        let mut config = config;
        config.logging.partitions.insert("Bucket".into(), "info".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unparseable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[node\nname = ");
        assert!(AppConfig::from_file(&path).is_err());
        assert!(AppConfig::from_file(dir.path().join("missing.toml")).is_err());
    }
}
