//! Config-driven device type registry.
//!
//! Gateways declare the device types they expect in `devman.toml`
//! (`[[device_types]]` tables). This module turns those declarations into a
//! [`TypeRegistry`] the manager core can consult for names, poll schedules
//! and buffer geometry. Type indices are the declaration order, so a given
//! configuration always yields the same indices.

use anyhow::{bail, Context, Result};
use devman_core::poll::{BufferSpec, PollRequest, PollingInfo};
use devman_core::{TypeIndex, TypeRegistry};
use serde::{Deserialize, Serialize};

/// One poll request fragment as declared in configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PollRequestDef {
    /// Bytes to write, hex-encoded (`"10a0"`).
    pub command_hex: String,
    /// Bytes expected back.
    pub read_len: u32,
    /// Settle pause after this fragment (splits the poll when non-zero).
    pub pause_after_send_ms: u32,
}

/// One device type declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceTypeDef {
    pub name: String,
    pub poll_interval_ms: u64,
    pub poll_requests: Vec<PollRequestDef>,
    /// Fixed size of one assembled sample.
    pub payload_size: u32,
    /// Leading payload bytes carrying the device timestamp (1, 2 or 4).
    pub timestamp_bytes: u32,
    pub timestamp_resolution_us: u32,
    /// RAM ring capacity in entries.
    pub max_entries: u32,
    /// Mirror samples into the persistent store.
    pub persist: bool,
    /// Schema/decode information served by the typeinfo API, verbatim.
    pub info: Option<serde_json::Value>,
}

impl Default for DeviceTypeDef {
    fn default() -> Self {
        Self {
            name: String::new(),
            poll_interval_ms: 1000,
            poll_requests: Vec::new(),
            payload_size: 0,
            timestamp_bytes: 2,
            timestamp_resolution_us: 1000,
            max_entries: 128,
            persist: false,
            info: None,
        }
    }
}

impl DeviceTypeDef {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("device type name must not be empty");
        }
        if self.payload_size == 0 {
            bail!("payload_size must be non-zero");
        }
        if !matches!(self.timestamp_bytes, 1 | 2 | 4) {
            bail!("timestamp_bytes must be 1, 2 or 4");
        }
        if self.max_entries == 0 {
            bail!("max_entries must be non-zero");
        }
        for req in &self.poll_requests {
            hex::decode(&req.command_hex)
                .with_context(|| format!("bad command_hex '{}'", req.command_hex))?;
        }
        Ok(())
    }

    fn polling_info(&self) -> PollingInfo {
        PollingInfo {
            poll_interval_us: self.poll_interval_ms * 1000,
            poll_reqs: self
                .poll_requests
                .iter()
                .map(|req| PollRequest {
                    command: hex::decode(&req.command_hex).unwrap_or_default(),
                    read_len: req.read_len,
                    pause_after_send_ms: req.pause_after_send_ms,
                })
                .collect(),
        }
    }

    fn buffer_spec(&self) -> BufferSpec {
        BufferSpec {
            max_entries: self.max_entries,
            payload_size: self.payload_size,
            timestamp_bytes: self.timestamp_bytes,
            timestamp_resolution_us: self.timestamp_resolution_us,
            persist: self.persist,
        }
    }
}

/// [`TypeRegistry`] over a fixed list of configured device types.
pub struct StaticTypeRegistry {
    defs: Vec<DeviceTypeDef>,
}

impl StaticTypeRegistry {
    pub fn new(defs: Vec<DeviceTypeDef>) -> Self {
        Self { defs }
    }

    fn def(&self, type_index: TypeIndex) -> Option<&DeviceTypeDef> {
        self.defs.get(type_index as usize)
    }
}

impl TypeRegistry for StaticTypeRegistry {
    fn type_name(&self, type_index: TypeIndex) -> Option<String> {
        self.def(type_index).map(|d| d.name.clone())
    }

    fn type_index(&self, name: &str) -> Option<TypeIndex> {
        self.defs
            .iter()
            .position(|d| d.name.eq_ignore_ascii_case(name))
            .map(|i| i as TypeIndex)
    }

    fn polling_info(&self, type_index: TypeIndex) -> Option<PollingInfo> {
        self.def(type_index).map(|d| d.polling_info())
    }

    fn buffer_spec(&self, type_index: TypeIndex) -> Option<BufferSpec> {
        self.def(type_index).map(|d| d.buffer_spec())
    }

    fn type_info_json(&self, type_index: TypeIndex) -> Option<String> {
        self.def(type_index)
            .and_then(|d| d.info.as_ref())
            .map(|v| v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str) -> DeviceTypeDef {
        DeviceTypeDef {
            name: name.to_string(),
            poll_interval_ms: 100,
            poll_requests: vec![PollRequestDef {
                command_hex: "10a0".into(),
                read_len: 4,
                pause_after_send_ms: 0,
            }],
            payload_size: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_lookup_by_name_and_index() {
        let reg = StaticTypeRegistry::new(vec![def("VL53L4CD"), def("LSM6DS")]);
        assert_eq!(reg.type_index("LSM6DS"), Some(1));
        assert_eq!(reg.type_index("lsm6ds"), Some(1));
        assert_eq!(reg.type_name(0).as_deref(), Some("VL53L4CD"));
        assert_eq!(reg.type_name(5), None);
        assert_eq!(reg.type_index("NOPE"), None);
    }

    #[test]
    fn test_polling_info_decodes_commands() {
        let reg = StaticTypeRegistry::new(vec![def("VL53L4CD")]);
        let polling = reg.polling_info(0).unwrap();
        assert_eq!(polling.poll_interval_us, 100_000);
        assert_eq!(polling.poll_reqs[0].command, vec![0x10, 0xa0]);
    }

    #[test]
    fn test_validate_catches_bad_defs() {
        assert!(def("X").validate().is_ok());
        let mut bad = def("");
        assert!(bad.validate().is_err());
        bad = def("X");
        bad.payload_size = 0;
        assert!(bad.validate().is_err());
        bad = def("X");
        bad.timestamp_bytes = 3;
        assert!(bad.validate().is_err());
        bad = def("X");
        bad.poll_requests[0].command_hex = "zz".into();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_type_info_json_passthrough() {
        let mut d = def("SHT40");
        d.info = Some(serde_json::json!({"unit": "C", "fields": ["temp", "rh"]}));
        let reg = StaticTypeRegistry::new(vec![d]);
        let info = reg.type_info_json(0).unwrap();
        assert!(info.contains("\"unit\":\"C\""));
        assert_eq!(reg.type_info_json(1), None);
    }
}
