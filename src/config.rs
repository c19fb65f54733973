//! Configuration for the device manager daemon.
//!
//! Loaded from `devman.toml` (or an explicit path) with environment
//! overrides (`DEVMAN_*`, `__` as section separator), deserialized with
//! serde and validated before anything starts. A config that parses but is
//! semantically wrong (bad bind address, zero payload size, unknown log
//! level) refuses to start rather than failing at runtime.
//!
//! ## Schema
//!
//! - `log_level` - tracing verbosity (`trace`..`error`)
//! - `log_format` - `pretty`, `compact` or `json`
//! - `tick_interval_ms` - event-loop tick period
//! - `server.bind_addr` - REST listen address
//! - `offline.max_per_publish` - per-device cap for one publish batch
//! - `offline.ram_budget_bytes` - RAM budget across the drain selection
//!   (0 = unconstrained)
//! - `offline.import_max_entries` - persistent-replay cap at device
//!   creation (0 = ring capacity)
//! - `offline.persist_dir` - directory for persistent rings (absent =
//!   RAM-only buffering)
//! - `[[device_types]]` - the gateway's known device types (name, poll
//!   schedule, payload geometry); see [`crate::types`]

use crate::types::DeviceTypeDef;
use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const VALID_LOG_FORMATS: &[&str] = &["pretty", "compact", "json"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineSettings {
    pub max_per_publish: u32,
    pub ram_budget_bytes: u32,
    pub import_max_entries: u32,
    pub persist_dir: Option<PathBuf>,
}

impl Default for OfflineSettings {
    fn default() -> Self {
        Self {
            max_per_publish: 32,
            ram_budget_bytes: 0,
            import_max_entries: 0,
            persist_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    pub log_format: String,
    pub tick_interval_ms: u64,
    pub server: ServerSettings,
    pub offline: OfflineSettings,
    pub device_types: Vec<DeviceTypeDef>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            tick_interval_ms: 20,
            server: ServerSettings::default(),
            offline: OfflineSettings::default(),
            device_types: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings: defaults, then `devman.toml` (or `path` when given),
    /// then `DEVMAN_*` environment overrides. Validates before returning.
    pub fn new(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        builder = match path {
            Some(path) => builder.add_source(File::with_name(path)),
            None => builder.add_source(File::with_name("devman").required(false)),
        };
        builder = builder.add_source(Environment::with_prefix("DEVMAN").separator("__"));

        let loaded = builder.build().context("Failed to load configuration")?;
        let settings: Settings = loaded
            .try_deserialize()
            .context("Failed to parse configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check semantic constraints that parsing cannot.
    pub fn validate(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            bail!(
                "Invalid log_level '{}'. Valid levels: {}",
                self.log_level,
                VALID_LOG_LEVELS.join(", ")
            );
        }
        if !VALID_LOG_FORMATS.contains(&self.log_format.to_lowercase().as_str()) {
            bail!(
                "Invalid log_format '{}'. Valid formats: {}",
                self.log_format,
                VALID_LOG_FORMATS.join(", ")
            );
        }
        if self.tick_interval_ms == 0 {
            bail!("tick_interval_ms must be non-zero");
        }
        self.server
            .bind_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid server.bind_addr '{}'", self.server.bind_addr))?;
        for def in &self.device_types {
            def.validate()
                .with_context(|| format!("Invalid device type '{}'", def.name))?;
        }
        let mut names: Vec<&str> = self.device_types.iter().map(|d| d.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.device_types.len() {
            bail!("Duplicate device type names in configuration");
        }
        Ok(())
    }

    /// Offline settings in the shape the manager core wants.
    pub fn offline_settings(&self) -> devman_bus::OfflineSettings {
        devman_bus::OfflineSettings {
            max_per_publish: self.offline.max_per_publish,
            ram_budget_bytes: self.offline.ram_budget_bytes,
            import_max_entries: self.offline.import_max_entries,
        }
    }
}
