//! Subcommand bodies. Each returns the report it would print so the CLI
//! stays a thin shell over them.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::Context;
use lumen_history::{CatchupConfiguration, CatchupRange, CatchupTarget, Checkpoints};
use lumen_scp::hash_quorum_set;
use tracing::{debug, info};

use crate::config::AppConfig;

/// Load, override and validate a config file.
pub fn check_config(path: &Path) -> anyhow::Result<String> {
    let config = AppConfig::from_file_with_env(path)?;
    config
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    let qset = config.quorum_set()?;
    info!(path = %path.display(), "configuration is valid");

    let mut out = String::new();
    writeln!(out, "node: {}", config.node_id())?;
    writeln!(
        out,
        "mode: {}{}",
        if config.node.is_validator { "validator" } else { "observer" },
        if config.node.manual_close { ", manual close" } else { "" }
    )?;
    writeln!(
        out,
        "quorum set: {} of {} validators, {} inner sets",
        qset.threshold,
        qset.validators.len(),
        qset.inner_sets.len()
    )?;
    writeln!(out, "quorum set hash: {}", hash_quorum_set(&qset).to_hex())?;
    Ok(out)
}

/// Parse a replay count: a number or `complete`.
pub fn parse_count(s: &str) -> anyhow::Result<u32> {
    if s.eq_ignore_ascii_case("complete") {
        return Ok(CatchupConfiguration::COMPLETE);
    }
    s.parse()
        .map_err(|_| anyhow::anyhow!("count '{s}' is neither a number nor 'complete'"))
}

/// Plan a catch-up run without touching any archive.
///
/// A `current` target needs `current_ledger`, standing in for what an
/// archive would report.
pub fn plan_catchup(
    last_closed: u32,
    target: CatchupTarget,
    count: u32,
    frequency: u32,
    current_ledger: Option<u32>,
) -> anyhow::Result<CatchupRange> {
    let checkpoints = Checkpoints::new(frequency)
        .ok_or_else(|| anyhow::anyhow!("checkpoint frequency must be > 0"))?;
    let mut config = CatchupConfiguration::new(target, count);
    if target == CatchupTarget::Current {
        let Some(current) = current_ledger else {
            anyhow::bail!("target 'current' needs --current-ledger");
        };
        config = config.resolve(current);
    }
    debug!(last_closed, to = %config.target, count, frequency, "planning catch-up");
    CatchupRange::new(last_closed, &config, &checkpoints).context("cannot plan catch-up")
}

pub fn format_plan(range: &CatchupRange) -> String {
    let ledgers = range.ledgers();
    let mut out = String::new();
    if ledgers.is_empty() {
        out.push_str("replay: none\n");
    } else {
        out.push_str(&format!(
            "replay: {}..={} ({} ledgers)\n",
            ledgers.first,
            ledgers.last(),
            ledgers.count
        ));
    }
    out.push_str(&format!(
        "apply buckets: {}\n",
        if range.apply_buckets() { "yes" } else { "no" }
    ));
    match range.bucket_apply_ledger() {
        Some(at) => out.push_str(&format!("bucket apply ledger: {at}\n")),
        None => out.push_str("bucket apply ledger: none\n"),
    }
    out
}

/// Checkpoint boundaries whose ledgers intersect `from..=to`.
pub fn print_checkpoints(from: u32, to: u32, frequency: u32) -> anyhow::Result<Vec<u32>> {
    if to < from {
        anyhow::bail!("--to {to} is before --from {from}");
    }
    let checkpoints = Checkpoints::new(frequency)
        .ok_or_else(|| anyhow::anyhow!("checkpoint frequency must be > 0"))?;
    Ok(checkpoints.checkpoints_covering(from, to))
}
