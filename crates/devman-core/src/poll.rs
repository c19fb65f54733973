//! Poll transaction and buffer-geometry types.

use serde::{Deserialize, Serialize};

/// Index into the device-type registry.
pub type TypeIndex = u16;

/// One request fragment of a device poll.
///
/// A poll is an ordered list of these; a fragment with a non-zero
/// `pause_after_send_ms` that is not the last fragment splits the poll into
/// parts with a mandatory gap between them (some sensors need settle time
/// between a trigger write and the result read).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRequest {
    /// Bytes written to the device to initiate this fragment.
    pub command: Vec<u8>,
    /// Number of bytes expected back.
    pub read_len: u32,
    /// Pause required after this fragment before the next one may be sent.
    #[serde(default)]
    pub pause_after_send_ms: u32,
}

/// Poll schedule for one device type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollingInfo {
    /// Interval between polls in microseconds.
    pub poll_interval_us: u64,
    /// Ordered request fragments making up one logical poll.
    pub poll_reqs: Vec<PollRequest>,
}

/// Result of one poll transaction fragment.
///
/// The first `timestamp_bytes` of the payload (big-endian) carry a
/// device-origin timestamp in units of the type's timestamp resolution; the
/// rest is sensor data, decoded elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResult {
    pub payload: Vec<u8>,
    /// Gateway wall-clock capture time in microseconds.
    pub capture_time_us: u64,
}

/// Offline-buffer geometry for one device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSpec {
    /// RAM ring capacity in entries.
    pub max_entries: u32,
    /// Fixed size of one assembled poll payload in bytes.
    pub payload_size: u32,
    /// Number of leading payload bytes holding the device timestamp (1, 2 or 4).
    pub timestamp_bytes: u32,
    /// Resolution of the device timestamp in microseconds per tick.
    pub timestamp_resolution_us: u32,
    /// Whether samples are mirrored into the persistent store.
    #[serde(default)]
    pub persist: bool,
}
