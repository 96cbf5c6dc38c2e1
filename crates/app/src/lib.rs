//! Operator-facing pieces of the `lumen` binary: configuration loading,
//! logging setup and the read-only planning commands.

pub mod commands;
pub mod config;
pub mod logging;

pub use config::AppConfig;
pub use logging::{LogConfig, LogFormat};
