//! Logging setup.
//!
//! Everything logs through `tracing`. Each library crate is one
//! partition, named as operators know them:
//!
//! | Partition | Target |
//! |-----------|--------|
//! | SCP | `lumen_scp` |
//! | Herder | `lumen_herder` |
//! | History | `lumen_history` |
//! | Work | `lumen_work` |
//! | Process | `lumen_app` |
//!
//! `RUST_LOG`, when set, replaces the configured filter entirely.

use std::fmt;
use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const LOG_PARTITIONS: &[(&str, &str)] = &[
    ("SCP", "lumen_scp"),
    ("Herder", "lumen_herder"),
    ("History", "lumen_history"),
    ("Work", "lumen_work"),
    ("Process", "lumen_app"),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => anyhow::bail!("unknown log format '{other}', expected text or json"),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => f.write_str("text"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    pub ansi_colors: bool,
    /// Per-partition levels overriding `level`.
    pub partitions: Vec<(String, Level)>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Text,
            ansi_colors: true,
            partitions: Vec::new(),
        }
    }
}

impl LogConfig {
    pub fn with_level(mut self, level: &str) -> anyhow::Result<Self> {
        self.level = parse_level(level)?;
        Ok(self)
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_colors(mut self, ansi_colors: bool) -> Self {
        self.ansi_colors = ansi_colors;
        self
    }

    /// Set one partition's level, e.g. `("SCP", "trace")`.
    pub fn with_partition(mut self, partition: &str, level: &str) -> anyhow::Result<Self> {
        let known = LOG_PARTITIONS
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case(partition));
        if !known {
            anyhow::bail!("unknown log partition '{partition}'");
        }
        self.partitions.push((partition.to_string(), parse_level(level)?));
        Ok(self)
    }

    /// The filter string this configuration stands for.
    pub fn directives(&self) -> String {
        let mut directives = vec![self.level.as_str().to_lowercase()];
        for (partition, level) in &self.partitions {
            if let Some((_, target)) = LOG_PARTITIONS
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(partition))
            {
                directives.push(format!("{target}={}", level.as_str().to_lowercase()));
            }
        }
        directives.join(",")
    }
}

fn parse_level(level: &str) -> anyhow::Result<Level> {
    Level::from_str(level).map_err(|_| anyhow::anyhow!("invalid log level '{level}'"))
}

/// Install the global subscriber. Call once at startup.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.directives())?,
    };

    match config.format {
        LogFormat::Text => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_ansi(config.ansi_colors)
                .with_target(true);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_span_list(true)
                .with_current_span(true);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_partition_directives() {
        let config = LogConfig::default()
            .with_level("warn")
            .unwrap()
            .with_partition("scp", "trace")
            .unwrap()
            .with_partition("Herder", "debug")
            .unwrap();
        assert_eq!(
            config.directives(),
            "warn,lumen_scp=trace,lumen_herder=debug"
        );
        assert!(EnvFilter::try_new(config.directives()).is_ok());
    }

    #[test]
    fn test_unknown_partition_and_level_rejected() {
        assert!(LogConfig::default().with_partition("Overlay", "info").is_err());
        assert!(LogConfig::default().with_level("loud").is_err());
    }
}
