//! Device timestamp reconstruction.
//!
//! Device payloads carry a small big-endian timestamp that wraps modulo its
//! field width (a 16-bit millisecond counter wraps every ~65 s). The tracker
//! here promotes those raw values to an absolute millisecond epoch base by
//! counting wraps, so consumers get monotonic per-sample capture times
//! without replaying the whole wrap history.
//!
//! The wrap step itself is the pure function [`advance_base`] so it can be
//! exercised without any buffer machinery around it.

/// Gateway wall clock in microseconds since the Unix epoch.
///
/// Poll capture times and the scheduler tick use this one clock so promoted
/// timestamps line up with what upstream consumers expect.
pub fn wall_clock_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Extract the raw device timestamp from the leading bytes of a payload.
///
/// The field is big-endian and 1, 2 or 4 bytes wide. The value is narrowed
/// to 16 bits in all cases: 4-byte fields only contribute their low half.
/// This matches the established on-wire interpretation and must not change
/// without a coordinated payload-format revision.
pub fn extract_raw_timestamp(payload: &[u8], timestamp_bytes: u32) -> u16 {
    match timestamp_bytes {
        1 if !payload.is_empty() => payload[0] as u16,
        2 if payload.len() >= 2 => u16::from_be_bytes([payload[0], payload[1]]),
        4 if payload.len() >= 4 => {
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as u16
        }
        _ => 0,
    }
}

/// Advance the millisecond base across a possible timestamp wrap.
///
/// Returns the new base and whether a wrap was detected (raw value moved
/// backwards).
pub fn advance_base(last_val: u16, base_ms: u64, new_val: u16, wrap_ms: u64) -> (u64, bool) {
    if new_val < last_val {
        (base_ms + wrap_ms, true)
    } else {
        (base_ms, false)
    }
}

/// Stateful per-device timestamp promotion.
#[derive(Debug, Clone)]
pub struct TimestampTracker {
    resolution_ms: u32,
    wrap_ms: u64,
    base_ms: u64,
    last_val: u16,
    valid: bool,
    wrap_count: u32,
}

impl TimestampTracker {
    /// Create a tracker for a timestamp field of `timestamp_bytes` width
    /// with `timestamp_resolution_us` microseconds per tick.
    pub fn new(timestamp_bytes: u32, timestamp_resolution_us: u32) -> Self {
        let resolution_ms = timestamp_resolution_us / 1000;
        let wrap_ms = (1u64 << (timestamp_bytes * 8)) * resolution_ms as u64;
        Self {
            resolution_ms,
            wrap_ms,
            base_ms: 0,
            last_val: 0,
            valid: false,
            wrap_count: 0,
        }
    }

    /// Promote a raw device timestamp captured at `capture_time_ms`
    /// (gateway wall clock) to an absolute millisecond value.
    ///
    /// The first observation anchors the base so that the promoted value
    /// lands on the capture time; later observations reuse the base and
    /// bump it by one wrap period whenever the raw value moves backwards.
    pub fn observe(&mut self, raw: u16, capture_time_ms: u64) -> u64 {
        if !self.valid {
            let ticks_ms = raw as u64 * self.resolution_ms as u64;
            self.base_ms = if self.resolution_ms > 0 && capture_time_ms > ticks_ms {
                capture_time_ms - ticks_ms
            } else {
                0
            };
        } else {
            let (base, wrapped) = advance_base(self.last_val, self.base_ms, raw, self.wrap_ms);
            self.base_ms = base;
            if wrapped {
                self.wrap_count += 1;
            }
        }
        self.last_val = raw;
        self.valid = true;
        self.base_ms + raw as u64 * self.resolution_ms as u64
    }

    /// Number of wraps seen since [`TimestampTracker::reset`] (or creation).
    pub fn wrap_count(&self) -> u32 {
        self.wrap_count
    }

    /// Wrap period in milliseconds for this field width/resolution.
    pub fn wrap_ms(&self) -> u64 {
        self.wrap_ms
    }

    /// Forget the base and wrap history (buffer cleared or reconfigured).
    pub fn reset(&mut self) {
        self.base_ms = 0;
        self.last_val = 0;
        self.valid = false;
        self.wrap_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_widths() {
        assert_eq!(extract_raw_timestamp(&[0xab, 0x01], 1), 0xab);
        assert_eq!(extract_raw_timestamp(&[0x12, 0x34, 0x00], 2), 0x1234);
        // 4-byte fields are narrowed to the low 16 bits
        assert_eq!(extract_raw_timestamp(&[0xde, 0xad, 0x12, 0x34], 4), 0x1234);
        assert_eq!(extract_raw_timestamp(&[], 2), 0);
    }

    #[test]
    fn test_advance_base_wraps_on_backstep() {
        assert_eq!(advance_base(60000, 0, 65535, 65536), (0, false));
        assert_eq!(advance_base(65535, 0, 0, 65536), (65536, true));
        assert_eq!(advance_base(10, 65536, 10, 65536), (65536, false));
    }

    #[test]
    fn test_first_observation_anchors_to_capture_time() {
        let mut tracker = TimestampTracker::new(2, 1000);
        // raw = 60000 ms tick at wall clock 1_000_000 ms
        let adjusted = tracker.observe(60000, 1_000_000);
        assert_eq!(adjusted, 1_000_000);
        // base clamps at zero when the raw value exceeds the wall clock
        let mut early = TimestampTracker::new(2, 1000);
        assert_eq!(early.observe(500, 100), 500);
    }

    #[test]
    fn test_monotonic_across_wrap() {
        let mut tracker = TimestampTracker::new(2, 1000);
        let a = tracker.observe(60000, 1_000_000);
        let b = tracker.observe(65535, 1_005_535);
        let c = tracker.observe(0, 1_005_536);
        let d = tracker.observe(500, 1_006_036);
        assert!(a < b && b < c && c < d);
        assert_eq!(tracker.wrap_count(), 1);
        assert_eq!(c - b, 1); // 65535 -> 0 is one tick with wrap_ms = 65536
    }

    #[test]
    fn test_sub_millisecond_resolution_zeroes_base() {
        // 100 us resolution: resolution_ms == 0, so promoted values stay raw
        let mut tracker = TimestampTracker::new(2, 100);
        assert_eq!(tracker.observe(1234, 1_000_000), 0);
    }
}
