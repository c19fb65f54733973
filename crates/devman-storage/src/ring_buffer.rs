//! Fixed-capacity RAM ring of poll payloads with promoted timestamps.
//!
//! Each device gets one of these. Entries are fixed-size payloads as
//! captured from the bus; alongside every payload the ring stores the
//! device timestamp promoted to an absolute millisecond base (see
//! [`devman_core::timebase`]), so consumers can recover per-sample absolute
//! time without replaying wrap history, while the raw timestamp stays
//! embedded in the payload bytes for downstream echo.
//!
//! # Overflow policy
//!
//! Drop-oldest: writers never block. The only loss signal is the `drops`
//! counter in [`RingStats`].
//!
//! # Thread Safety
//!
//! All operations serialise on an internal mutex; critical sections are
//! bounded by one payload copy. `get` may legitimately return fewer entries
//! than requested.

use devman_core::timebase::{extract_raw_timestamp, TimestampTracker};
use devman_core::{DevmanError, DevmanResult};
use std::sync::{Mutex, PoisonError};

/// Bytes of side metadata accounted per entry (the promoted `u32` timestamp).
pub const META_STORAGE_BYTES: u32 = 4;

/// Per-sample metadata returned by [`RingBuffer::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleMeta {
    /// Sequence number of this sample.
    pub seq: u32,
    /// Raw device timestamp as embedded in the returned payload bytes.
    pub ts: u32,
    /// Millisecond base such that `ts_base_ms + ts * resolution_ms` is the
    /// absolute capture time of the sample.
    pub ts_base_ms: u64,
}

/// Snapshot of ring state for stats/diagnostics surfaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct RingStats {
    pub depth: u32,
    pub drops: u32,
    pub max_entries: u32,
    pub payload_size: u32,
    pub meta_size: u32,
    pub wrap_count: u32,
    pub first_seq: u32,
    pub timestamp_bytes: u32,
    pub timestamp_resolution_us: u32,
    pub oldest_capture_ms: u64,
}

impl RingStats {
    /// RAM currently occupied by buffered entries (payload + side metadata).
    pub fn bytes_in_use(&self) -> u32 {
        let meta_bytes = if self.meta_size > 0 {
            self.meta_size
        } else {
            META_STORAGE_BYTES
        };
        self.depth * (self.payload_size + meta_bytes)
    }
}

#[derive(Default)]
struct RingInner {
    payloads: Vec<u8>,
    adj_timestamp_ms: Vec<u32>,
    head: u32,
    count: u32,
    max_entries: u32,
    payload_size: u32,
    timestamp_bytes: u32,
    timestamp_resolution_us: u32,
    tracker: Option<TimestampTracker>,
    drops: u32,
    next_seq: u32,
}

impl RingInner {
    fn is_configured(&self) -> bool {
        self.max_entries > 0 && self.payload_size > 0
    }

    fn first_seq(&self) -> u32 {
        if self.next_seq > self.count {
            self.next_seq - self.count
        } else {
            0
        }
    }

    fn tail_idx(&self) -> u32 {
        (self.head + self.max_entries - self.count) % self.max_entries
    }
}

/// Fixed-capacity ring of fixed-size payloads (drop-oldest on overflow).
pub struct RingBuffer {
    inner: Mutex<RingInner>,
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RingBuffer {
    /// Create an unconfigured ring. All operations except [`RingBuffer::init`]
    /// reject or no-op until `init` is called.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RingInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate storage for `max_entries` payloads of `payload_size` bytes
    /// and reset all counters. Any prior storage is released first.
    ///
    /// The first `timestamp_bytes` of each payload (big-endian, 1/2/4 bytes)
    /// carry the device timestamp at `timestamp_resolution_us` per tick.
    pub fn init(
        &self,
        max_entries: u32,
        payload_size: u32,
        timestamp_bytes: u32,
        timestamp_resolution_us: u32,
    ) -> DevmanResult<()> {
        if max_entries == 0 || payload_size == 0 {
            return Err(DevmanError::invalid_config(format!(
                "ring geometry max_entries {} payload_size {}",
                max_entries, payload_size
            )));
        }
        if !matches!(timestamp_bytes, 1 | 2 | 4) {
            return Err(DevmanError::invalid_config(format!(
                "timestamp_bytes {} (expected 1, 2 or 4)",
                timestamp_bytes
            )));
        }
        let mut inner = self.lock();
        *inner = RingInner {
            payloads: vec![0u8; (max_entries * payload_size) as usize],
            adj_timestamp_ms: vec![0u32; max_entries as usize],
            max_entries,
            payload_size,
            timestamp_bytes,
            timestamp_resolution_us,
            tracker: Some(TimestampTracker::new(
                timestamp_bytes,
                timestamp_resolution_us,
            )),
            ..RingInner::default()
        };
        Ok(())
    }

    /// Drop all buffered entries and counters, keeping the configuration.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.head = 0;
        inner.count = 0;
        inner.drops = 0;
        inner.next_seq = 0;
        if let Some(tracker) = inner.tracker.as_mut() {
            tracker.reset();
        }
    }

    pub fn is_configured(&self) -> bool {
        self.lock().is_configured()
    }

    pub fn max_entries(&self) -> u32 {
        self.lock().max_entries
    }

    pub fn payload_size(&self) -> u32 {
        self.lock().payload_size
    }

    /// Total RAM reserved by this ring (payloads plus side metadata).
    pub fn capacity_bytes(&self) -> u32 {
        let inner = self.lock();
        inner.max_entries * (inner.payload_size + META_STORAGE_BYTES)
    }

    /// Store one captured payload.
    ///
    /// `capture_time_us` is the gateway wall clock at capture; `seq` is the
    /// device's sample sequence number. On success returns the promoted
    /// millisecond timestamp stored alongside the payload.
    ///
    /// If the ring is full the oldest entry is overwritten and `drops`
    /// increments by one.
    pub fn put(&self, capture_time_us: u64, seq: u32, payload: &[u8]) -> DevmanResult<u32> {
        let mut inner = self.lock();
        if !inner.is_configured() {
            return Err(DevmanError::invalid_config("ring not configured"));
        }
        if payload.len() != inner.payload_size as usize {
            return Err(DevmanError::PayloadSizeMismatch {
                expected: inner.payload_size as usize,
                actual: payload.len(),
            });
        }

        let raw = extract_raw_timestamp(payload, inner.timestamp_bytes);
        let adjusted_ms = inner
            .tracker
            .as_mut()
            .map(|t| t.observe(raw, capture_time_us / 1000))
            .unwrap_or(0) as u32;

        let head = inner.head;
        let write_at = (head * inner.payload_size) as usize;
        let payload_size = inner.payload_size as usize;
        inner.payloads[write_at..write_at + payload_size].copy_from_slice(payload);
        inner.adj_timestamp_ms[head as usize] = adjusted_ms;

        if inner.count < inner.max_entries {
            inner.count += 1;
        } else {
            inner.drops += 1;
        }
        inner.head = (head + 1) % inner.max_entries;
        inner.next_seq = seq.wrapping_add(1);
        Ok(adjusted_ms)
    }

    /// Read up to `max_responses` oldest entries (0 = all) starting at
    /// logical offset `start_idx` from the tail.
    ///
    /// `max_bytes` (0 = unlimited) additionally caps the count at
    /// `max_bytes / (payload_size + META_STORAGE_BYTES)`. When `consume` is
    /// set the returned entries are popped and `start_idx` is forced to 0;
    /// a non-consuming read may start anywhere.
    ///
    /// Returns the concatenated payload bytes and one [`SampleMeta`] per
    /// returned entry, oldest first.
    pub fn get(
        &self,
        max_responses: u32,
        max_bytes: u32,
        start_idx: u32,
        consume: bool,
    ) -> (Vec<u8>, Vec<SampleMeta>) {
        let mut inner = self.lock();
        if !inner.is_configured() {
            return (Vec::new(), Vec::new());
        }

        let start_idx = if consume { 0 } else { start_idx };
        if inner.count == 0 || start_idx >= inner.count {
            return (Vec::new(), Vec::new());
        }

        let available = inner.count - start_idx;
        let mut num = if max_responses == 0 || available < max_responses {
            available
        } else {
            max_responses
        };
        if max_bytes > 0 {
            let bytes_per_entry = inner.payload_size + META_STORAGE_BYTES;
            let max_from_bytes = max_bytes / bytes_per_entry;
            if max_from_bytes == 0 {
                return (Vec::new(), Vec::new());
            }
            num = num.min(max_from_bytes);
        }

        let payload_size = inner.payload_size as usize;
        let resolution_ms = (inner.timestamp_resolution_us / 1000) as u64;
        let seq_start = if inner.next_seq > inner.count {
            inner.next_seq - inner.count + start_idx
        } else {
            start_idx
        };

        let mut data = Vec::with_capacity(num as usize * payload_size);
        let mut metas = Vec::with_capacity(num as usize);
        let mut idx = (inner.tail_idx() + start_idx) % inner.max_entries;
        for i in 0..num {
            let at = idx as usize * payload_size;
            let payload = &inner.payloads[at..at + payload_size];
            data.extend_from_slice(payload);

            let ts = extract_raw_timestamp(payload, inner.timestamp_bytes) as u32;
            let adjusted_ms = inner.adj_timestamp_ms[idx as usize] as u64;
            let ts_component_ms = ts as u64 * resolution_ms;
            metas.push(SampleMeta {
                seq: seq_start + i,
                ts,
                ts_base_ms: adjusted_ms.saturating_sub(ts_component_ms),
            });
            idx = (idx + 1) % inner.max_entries;
        }

        if consume {
            inner.count -= num;
        }
        (data, metas)
    }

    /// Pop up to `n` oldest entries without copying them out. Returns the
    /// number actually popped.
    pub fn consume(&self, n: u32) -> u32 {
        let mut inner = self.lock();
        if !inner.is_configured() {
            return 0;
        }
        let popped = n.min(inner.count);
        inner.count -= popped;
        popped
    }

    /// Current ring statistics.
    pub fn stats(&self) -> RingStats {
        let inner = self.lock();
        if !inner.is_configured() {
            return RingStats::default();
        }
        RingStats {
            depth: inner.count,
            drops: inner.drops,
            max_entries: inner.max_entries,
            payload_size: inner.payload_size,
            meta_size: META_STORAGE_BYTES,
            wrap_count: inner.tracker.as_ref().map(|t| t.wrap_count()).unwrap_or(0),
            first_seq: inner.first_seq(),
            timestamp_bytes: inner.timestamp_bytes,
            timestamp_resolution_us: inner.timestamp_resolution_us,
            oldest_capture_ms: if inner.count > 0 {
                inner.adj_timestamp_ms[inner.tail_idx() as usize] as u64
            } else {
                0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Payload with a big-endian 16-bit timestamp followed by filler.
    fn payload16(ts: u16, size: usize, fill: u8) -> Vec<u8> {
        let mut p = vec![fill; size];
        p[0..2].copy_from_slice(&ts.to_be_bytes());
        p
    }

    fn ring(max_entries: u32, payload_size: u32) -> RingBuffer {
        let rb = RingBuffer::new();
        rb.init(max_entries, payload_size, 2, 1000).unwrap();
        rb
    }

    #[test]
    fn test_put_rejects_wrong_payload_size() {
        let rb = ring(4, 8);
        let err = rb.put(0, 0, &[0u8; 5]).unwrap_err();
        assert!(matches!(
            err,
            DevmanError::PayloadSizeMismatch {
                expected: 8,
                actual: 5
            }
        ));
        assert_eq!(rb.stats().depth, 0);
    }

    #[test]
    fn test_unconfigured_ring_rejects_put() {
        let rb = RingBuffer::new();
        assert!(rb.put(0, 0, &[0u8; 4]).is_err());
        assert_eq!(rb.get(0, 0, 0, true).1.len(), 0);
    }

    #[test]
    fn test_init_validates_geometry() {
        let rb = RingBuffer::new();
        assert!(rb.init(0, 8, 2, 1000).is_err());
        assert!(rb.init(4, 0, 2, 1000).is_err());
        assert!(rb.init(4, 8, 3, 1000).is_err());
        assert!(rb.init(4, 8, 2, 1000).is_ok());
    }

    #[test]
    fn test_drop_oldest_keeps_newest_and_counts_drops() {
        // Capacity 3, five puts with seqs 10..=14: the two oldest are lost.
        let rb = ring(3, 4);
        for (i, seq) in (10u32..15).enumerate() {
            rb.put(1_000_000 + i as u64 * 1000, seq, &payload16(i as u16, 4, 0xee))
                .unwrap();
        }
        let stats = rb.stats();
        assert_eq!(stats.depth, 3);
        assert_eq!(stats.drops, 2);
        assert_eq!(stats.first_seq, 12);

        let (data, metas) = rb.get(0, 0, 0, true);
        assert_eq!(metas.len(), 3);
        assert_eq!(
            metas.iter().map(|m| m.seq).collect::<Vec<_>>(),
            vec![12, 13, 14]
        );
        assert_eq!(data.len(), 3 * 4);
        assert_eq!(rb.stats().depth, 0);
    }

    #[test]
    fn test_drops_increment_one_per_overflowing_put() {
        let rb = ring(2, 4);
        rb.put(0, 0, &payload16(0, 4, 0)).unwrap();
        rb.put(0, 1, &payload16(1, 4, 0)).unwrap();
        assert_eq!(rb.stats().drops, 0);
        rb.put(0, 2, &payload16(2, 4, 0)).unwrap();
        assert_eq!(rb.stats().drops, 1);
        rb.put(0, 3, &payload16(3, 4, 0)).unwrap();
        assert_eq!(rb.stats().drops, 2);
    }

    #[test]
    fn test_timestamp_promotion_monotonic_across_wrap() {
        // 16-bit ms timestamps wrap at 65536 ms.
        let rb = ring(8, 4);
        let raws: [u16; 4] = [60000, 65535, 0, 500];
        let walls: [u64; 4] = [1_000_000, 1_005_000, 1_010_000, 1_010_500];
        for (i, (&raw, &wall)) in raws.iter().zip(walls.iter()).enumerate() {
            rb.put(wall, i as u32, &payload16(raw, 4, 0)).unwrap();
        }
        let (_, metas) = rb.get(0, 0, 0, false);
        let absolute: Vec<u64> = metas.iter().map(|m| m.ts_base_ms + m.ts as u64).collect();
        assert!(
            absolute.windows(2).all(|w| w[0] < w[1]),
            "expected strictly increasing: {:?}",
            absolute
        );
        assert_eq!(rb.stats().wrap_count, 1);
        // Raw timestamps are echoed verbatim
        assert_eq!(
            metas.iter().map(|m| m.ts).collect::<Vec<_>>(),
            vec![60000, 65535, 0, 500]
        );
    }

    #[test]
    fn test_get_max_bytes_caps_count() {
        let rb = ring(8, 4);
        for i in 0..6u32 {
            rb.put(0, i, &payload16(i as u16, 4, 0)).unwrap();
        }
        // bytes per entry = 4 payload + 4 meta = 8; 20 bytes -> 2 entries
        let (data, metas) = rb.get(0, 20, 0, false);
        assert_eq!(metas.len(), 2);
        assert_eq!(data.len(), 8);
        // too small for even one entry
        let (data, metas) = rb.get(0, 7, 0, false);
        assert!(data.is_empty() && metas.is_empty());
    }

    #[test]
    fn test_peek_with_start_idx_and_consume_forces_zero() {
        let rb = ring(8, 4);
        for i in 0..5u32 {
            rb.put(0, i + 100, &payload16(i as u16, 4, 0)).unwrap();
        }
        let (_, metas) = rb.get(2, 0, 2, false);
        assert_eq!(
            metas.iter().map(|m| m.seq).collect::<Vec<_>>(),
            vec![102, 103]
        );
        assert_eq!(rb.stats().depth, 5); // peek does not consume

        // A consuming read starts at the tail regardless of start_idx.
        let (_, metas) = rb.get(2, 0, 3, true);
        assert_eq!(
            metas.iter().map(|m| m.seq).collect::<Vec<_>>(),
            vec![100, 101]
        );
        assert_eq!(rb.stats().depth, 3);
    }

    #[test]
    fn test_consume_clamps_to_depth() {
        let rb = ring(4, 4);
        for i in 0..3u32 {
            rb.put(0, i, &payload16(i as u16, 4, 0)).unwrap();
        }
        assert_eq!(rb.consume(2), 2);
        assert_eq!(rb.consume(5), 1);
        assert_eq!(rb.consume(1), 0);
    }

    #[test]
    fn test_first_seq_tracks_next_seq_minus_count() {
        let rb = ring(4, 4);
        for i in 0..6u32 {
            rb.put(0, i + 50, &payload16(i as u16, 4, 0)).unwrap();
            let stats = rb.stats();
            assert_eq!(stats.first_seq, (i + 51) - stats.depth);
            assert!(stats.depth <= 4);
        }
    }

    #[test]
    fn test_reinit_releases_and_resets() {
        let rb = ring(4, 4);
        rb.put(0, 7, &payload16(1, 4, 0)).unwrap();
        rb.init(2, 6, 2, 1000).unwrap();
        let stats = rb.stats();
        assert_eq!((stats.depth, stats.drops, stats.first_seq), (0, 0, 0));
        assert_eq!(stats.payload_size, 6);
        assert_eq!(rb.capacity_bytes(), 2 * (6 + 4));
    }
}
