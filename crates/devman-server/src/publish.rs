//! Publish-channel source: batches of buffered samples plus change hash.
//!
//! The publish layer polls [`PublishSource`] on its own schedule. The
//! 2-byte state hash changes whenever any bus completes an identification
//! scan or any device captures a sample, so the layer can skip batch
//! assembly entirely while nothing moved. Batches drain from the per-device
//! rings through the drain controller's selection and caps; the `remaining`
//! count is the backlog hint telling the channel to come straight back.

use devman_bus::{DeviceManager, PublishSlice};
use std::sync::{Arc, Mutex, PoisonError};

/// One assembled publish message.
#[derive(Debug, Clone)]
pub struct PublishBatch {
    pub payload: Vec<u8>,
    /// Samples still buffered across all devices after this batch.
    pub remaining: u32,
}

/// Drain-side adapter feeding the publish channel.
pub struct PublishSource {
    manager: Arc<DeviceManager>,
    last_hash: Mutex<Option<[u8; 2]>>,
}

impl PublishSource {
    pub fn new(manager: Arc<DeviceManager>) -> Self {
        Self {
            manager,
            last_hash: Mutex::new(None),
        }
    }

    /// Whether device state changed since the last produced batch.
    pub fn changed(&self) -> bool {
        let hash = self.manager.devices_hash();
        *self
            .last_hash
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            != Some(hash)
    }

    fn record_hash(&self) {
        let hash = self.manager.devices_hash();
        *self
            .last_hash
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(hash);
    }

    /// Drain a JSON batch: `{bus: {addr: {"t", "seq", "hex", "ms"}}}` with
    /// per-device status under `"status"`. Returns `None` when nothing is
    /// drainable.
    pub fn next_json(&self, max_per_device: u32) -> Option<PublishBatch> {
        let (slices, remaining) = self.manager.drain_publish_batch(max_per_device);
        self.record_hash();
        if slices.is_empty() {
            return None;
        }

        let mut root = serde_json::Map::new();
        for slice in &slices {
            let bus = root
                .entry(slice.bus.clone())
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
            if let serde_json::Value::Object(bus) = bus {
                let payload_size = slice.payload_size as usize;
                let hex_samples: Vec<serde_json::Value> = slice
                    .metas
                    .iter()
                    .enumerate()
                    .map(|(i, _)| {
                        let at = i * payload_size;
                        serde_json::Value::String(hex::encode(
                            &slice.payloads[at..at + payload_size],
                        ))
                    })
                    .collect();
                let adjusted_ms: Vec<serde_json::Value> = slice
                    .metas
                    .iter()
                    .map(|m| serde_json::json!(m.ts_base_ms + m.ts as u64))
                    .collect();
                bus.insert(
                    format!("0x{:x}", slice.addr.0),
                    serde_json::json!({
                        "t": slice.type_name,
                        "seq": slice.metas.first().map(|m| m.seq).unwrap_or(0),
                        "hex": hex_samples,
                        "ms": adjusted_ms,
                    }),
                );
            }
        }

        let mut status = serde_json::Map::new();
        for device in self.manager.registry().snapshot() {
            if let Ok(v) = serde_json::from_str(&device.status_json()) {
                status.insert(device.unique_id(), v);
            }
        }
        if !status.is_empty() {
            root.insert("status".into(), serde_json::Value::Object(status));
        }

        Some(PublishBatch {
            payload: serde_json::Value::Object(root).to_string().into_bytes(),
            remaining,
        })
    }

    /// Drain a binary batch. Wire format, all integers big-endian, one
    /// frame per device:
    ///
    /// ```text
    /// u8  bus index (order of bus registration)
    /// u32 address
    /// u16 payload size
    /// u16 sample count
    /// count × { u32 seq, u32 adjustedTsMs, payload bytes }
    /// ```
    pub fn next_binary(&self, max_per_device: u32) -> Option<PublishBatch> {
        let bus_index: Vec<String> = self
            .manager
            .buses()
            .iter()
            .map(|b| b.bus_name().to_string())
            .collect();
        let (slices, remaining) = self.manager.drain_publish_batch(max_per_device);
        self.record_hash();
        if slices.is_empty() {
            return None;
        }

        let mut out = Vec::with_capacity(512);
        for slice in &slices {
            let bus_idx = bus_index
                .iter()
                .position(|name| *name == slice.bus)
                .unwrap_or(0) as u8;
            out.push(bus_idx);
            out.extend_from_slice(&slice.addr.0.to_be_bytes());
            out.extend_from_slice(&(slice.payload_size as u16).to_be_bytes());
            out.extend_from_slice(&(slice.metas.len() as u16).to_be_bytes());
            let payload_size = slice.payload_size as usize;
            for (i, meta) in slice.metas.iter().enumerate() {
                out.extend_from_slice(&meta.seq.to_be_bytes());
                let adjusted = (meta.ts_base_ms + meta.ts as u64) as u32;
                out.extend_from_slice(&adjusted.to_be_bytes());
                let at = i * payload_size;
                out.extend_from_slice(&slice.payloads[at..at + payload_size]);
            }
        }
        Some(PublishBatch {
            payload: out,
            remaining,
        })
    }

    /// Raw slices for custom encodings.
    pub fn drain_slices(&self, max_per_device: u32) -> (Vec<PublishSlice>, u32) {
        let result = self.manager.drain_publish_batch(max_per_device);
        self.record_hash();
        result
    }
}
