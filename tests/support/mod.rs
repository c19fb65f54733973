//! Shared fixtures for integration tests: a scripted bus transport and
//! device-type definitions.
#![allow(dead_code)] // each test binary uses a different subset

use async_trait::async_trait;
use devman_core::poll::{PollRequest, PollResult};
use devman_core::transport::{AddrScan, BusTransport};
use devman_core::{Addr, TransportError};
use rust_devman::types::{DeviceTypeDef, PollRequestDef};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// One simulated device on the mock bus.
pub struct MockDevice {
    pub responding: bool,
    pub type_index: Option<u16>,
    /// Device-origin timestamp counter (raw units, wraps at 16 bits).
    pub ts: u16,
    /// Timestamp advance per completed fragment read.
    pub ts_step: u16,
    /// Filler byte for non-timestamp payload bytes.
    pub fill: u8,
}

impl MockDevice {
    pub fn online(type_index: u16) -> Self {
        Self {
            responding: true,
            type_index: Some(type_index),
            ts: 0,
            ts_step: 100,
            fill: 0x5a,
        }
    }
}

/// Scripted single-bus transport: tests flip `responding` flags and the
/// shared clock; polls synthesize payloads with an advancing embedded
/// timestamp.
pub struct MockBus {
    name: String,
    pub now_us: AtomicU64,
    devices: Mutex<BTreeMap<Addr, MockDevice>>,
}

impl MockBus {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            now_us: AtomicU64::new(1_000_000_000),
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn add_device(&self, addr: Addr, device: MockDevice) {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, device);
    }

    pub fn set_responding(&self, addr: Addr, responding: bool) {
        if let Some(dev) = self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&addr)
        {
            dev.responding = responding;
        }
    }

    pub fn advance_us(&self, delta: u64) -> u64 {
        self.now_us.fetch_add(delta, Ordering::SeqCst) + delta
    }

    pub fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BusTransport for MockBus {
    fn bus_name(&self) -> &str {
        &self.name
    }

    async fn scan(&self) -> Result<Vec<AddrScan>, TransportError> {
        Ok(self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(addr, dev)| AddrScan {
                addr: *addr,
                responding: dev.responding,
                type_index: dev.type_index,
            })
            .collect())
    }

    async fn poll(&self, addr: Addr, req: &PollRequest) -> Result<PollResult, TransportError> {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        let dev = devices
            .get_mut(&addr)
            .filter(|d| d.responding)
            .ok_or_else(|| TransportError::no_response(&self.name))?;

        // Fragment payload: embedded BE16 timestamp then filler.
        let mut payload = vec![dev.fill; req.read_len as usize];
        if payload.len() >= 2 {
            payload[0..2].copy_from_slice(&dev.ts.to_be_bytes());
        }
        dev.ts = dev.ts.wrapping_add(dev.ts_step);
        Ok(PollResult {
            payload,
            capture_time_us: self.now_us.load(Ordering::SeqCst),
        })
    }

    fn last_ident_scan_ms(&self) -> u32 {
        (self.now_us.load(Ordering::SeqCst) / 1000) as u32
    }
}

/// A ranging sensor: single-fragment polls, 4-byte samples, 100 ms cadence.
pub fn dist_sensor(max_entries: u32, persist: bool) -> DeviceTypeDef {
    DeviceTypeDef {
        name: "DIST4".into(),
        poll_interval_ms: 100,
        poll_requests: vec![PollRequestDef {
            command_hex: "10".into(),
            read_len: 4,
            pause_after_send_ms: 0,
        }],
        payload_size: 4,
        timestamp_bytes: 2,
        timestamp_resolution_us: 1000,
        max_entries,
        persist,
        info: Some(serde_json::json!({"fields": ["mm"]})),
    }
}

/// A humidity sensor with a split poll: trigger write, 5 ms settle, then
/// the 4-byte result read (6-byte assembled sample).
pub fn split_poll_sensor() -> DeviceTypeDef {
    DeviceTypeDef {
        name: "HUM6".into(),
        poll_interval_ms: 100,
        poll_requests: vec![
            PollRequestDef {
                command_hex: "a0".into(),
                read_len: 2,
                pause_after_send_ms: 5,
            },
            PollRequestDef {
                command_hex: "a1".into(),
                read_len: 4,
                pause_after_send_ms: 0,
            },
        ],
        payload_size: 6,
        timestamp_bytes: 2,
        timestamp_resolution_us: 1000,
        max_entries: 16,
        persist: false,
        info: None,
    }
}
