//! Tracing setup for the daemon.
//!
//! Structured, async-aware logging via `tracing` + `tracing-subscriber`.
//! `RUST_LOG` takes precedence over the configured level so operators can
//! turn up verbosity per-module without touching the config file.

use crate::config::Settings;
use anyhow::{bail, Result};
use tracing_subscriber::EnvFilter;

/// Output format for log lines.
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-oriented, colored (development).
    Pretty,
    /// Single-line, no colors (production consoles).
    Compact,
    /// JSON lines for log aggregation.
    Json,
}

impl OutputFormat {
    fn parse(s: &str) -> Result<Self> {
        Ok(match s.to_lowercase().as_str() {
            "pretty" => OutputFormat::Pretty,
            "compact" => OutputFormat::Compact,
            "json" => OutputFormat::Json,
            other => bail!("Unknown log format '{}'", other),
        })
    }
}

/// Install the global subscriber from settings. Call once, early.
pub fn init(settings: &Settings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    match OutputFormat::parse(&settings.log_format)? {
        OutputFormat::Pretty => builder.pretty().init(),
        OutputFormat::Compact => builder.compact().with_ansi(false).init(),
        OutputFormat::Json => builder.json().init(),
    }
    Ok(())
}
