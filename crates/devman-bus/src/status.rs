//! Per-address online/offline hysteresis.
//!
//! Bus scans are noisy: a device can miss one transaction without being
//! gone, and electrical glitches can make an empty address ACK once. The
//! hysteresis here requires `ok_max` consecutive successes before an address
//! is declared online and `fail_max` consecutive failures before it is
//! declared offline, and it distinguishes a real offline transition from a
//! *spurious record* - an address that briefly appeared but never made it to
//! online. Spurious transitions are reported so the owner can drop the
//! record without emitting status callbacks for a device that never existed.

use devman_core::Addr;

/// Consecutive successful responses before an address is declared online.
pub const RESP_COUNT_OK_MAX_DEFAULT: u32 = 2;

/// Consecutive failed responses before an address is declared offline.
pub const RESP_COUNT_FAIL_MAX_DEFAULT: u32 = 3;

/// Lifecycle state of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnlineState {
    /// Seen but not yet past the online threshold.
    #[default]
    Initial,
    Online,
    Offline,
}

impl OnlineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnlineState::Initial => "INITIAL",
            OnlineState::Online => "ONLINE",
            OnlineState::Offline => "OFFLINE",
        }
    }
}

/// Result of one [`AddrStatus::observe`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObserveOutcome {
    /// An online/offline transition happened on this observation.
    pub changed: bool,
    /// The transition was a phantom disappearing (never confirmed online);
    /// status callbacks should be suppressed.
    pub spurious: bool,
}

/// Liveness record for one bus address.
#[derive(Debug, Clone)]
pub struct AddrStatus {
    pub addr: Addr,
    /// Hysteresis counter: counts up towards `ok_max` while responding,
    /// down towards `-fail_max` while not.
    pub count: i32,
    pub is_online: bool,
    pub was_once_online: bool,
    pub is_newly_identified: bool,
    /// Set on the offline transition so the owner can report the change
    /// before dropping the record.
    pub flag_for_deletion: bool,
    pub online_state: OnlineState,
}

impl AddrStatus {
    pub fn new(addr: Addr) -> Self {
        Self {
            addr,
            count: 0,
            is_online: false,
            was_once_online: false,
            is_newly_identified: false,
            flag_for_deletion: false,
            online_state: OnlineState::Initial,
        }
    }

    /// Feed one scan/poll observation through the hysteresis.
    ///
    /// Uses the default thresholds; see [`AddrStatus::observe_with`] for
    /// custom ones.
    pub fn observe(&mut self, is_responding: bool) -> ObserveOutcome {
        self.observe_with(
            is_responding,
            RESP_COUNT_OK_MAX_DEFAULT,
            RESP_COUNT_FAIL_MAX_DEFAULT,
        )
    }

    /// Feed one observation with explicit thresholds.
    ///
    /// Counting down continues for records that are online, never reached
    /// online, or are already flagged for deletion; a confirmed-offline
    /// record that once was online sits inert until it responds again.
    pub fn observe_with(&mut self, is_responding: bool, ok_max: u32, fail_max: u32) -> ObserveOutcome {
        let ok_max = ok_max as i32;
        let fail_max = fail_max as i32;

        if is_responding {
            if !self.is_online {
                self.count = (self.count + 1).min(ok_max);
                if self.count >= ok_max {
                    self.count = 0;
                    self.is_online = true;
                    self.online_state = OnlineState::Online;
                    self.was_once_online = true;
                    self.flag_for_deletion = false;
                    return ObserveOutcome {
                        changed: true,
                        spurious: false,
                    };
                }
            }
        } else if self.is_online || !self.was_once_online || self.flag_for_deletion {
            self.count = (self.count - 1).max(-fail_max);
            if self.count <= -fail_max {
                self.count = 0;
                let spurious = !self.was_once_online || self.flag_for_deletion;
                self.is_online = false;
                self.online_state = OnlineState::Offline;
                self.flag_for_deletion = true;
                return ObserveOutcome {
                    changed: true,
                    spurious,
                };
            }
        }
        ObserveOutcome::default()
    }

    /// Status JSON as published upstream: address plus the three state
    /// flags Online / WasOnceOnline / NewlyIdentified (`X` when unset).
    pub fn status_json(&self) -> String {
        format!(
            "{{\"a\":\"0x{:04X}\",\"s\":\"{}{}{}\"}}",
            self.addr.0,
            if self.is_online { 'O' } else { 'X' },
            if self.was_once_online { 'W' } else { 'X' },
            if self.is_newly_identified { 'N' } else { 'X' },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_after_ok_max_successes() {
        let mut st = AddrStatus::new(Addr(0x48));
        let first = st.observe_with(true, 2, 3);
        assert!(!first.changed);
        assert!(!st.is_online);

        let second = st.observe_with(true, 2, 3);
        assert!(second.changed && !second.spurious);
        assert!(st.is_online && st.was_once_online);
        assert_eq!(st.online_state, OnlineState::Online);
        assert_eq!(st.count, 0);
    }

    #[test]
    fn test_offline_after_fail_max_failures() {
        let mut st = AddrStatus::new(Addr(0x48));
        st.observe_with(true, 2, 3);
        st.observe_with(true, 2, 3);

        for _ in 0..2 {
            assert!(!st.observe_with(false, 2, 3).changed);
        }
        let outcome = st.observe_with(false, 2, 3);
        assert!(outcome.changed);
        assert!(!outcome.spurious, "a confirmed device going away is real");
        assert!(!st.is_online);
        assert!(st.flag_for_deletion);
        assert_eq!(st.online_state, OnlineState::Offline);
    }

    #[test]
    fn test_phantom_detection_is_spurious() {
        // Address acked during a scan glitch, then nothing: never online.
        let mut st = AddrStatus::new(Addr(0x51));
        st.observe_with(true, 2, 3);
        let outcomes: Vec<_> = (0..3).map(|_| st.observe_with(false, 2, 3)).collect();
        assert!(!outcomes[0].changed && !outcomes[1].changed);
        assert!(outcomes[2].changed && outcomes[2].spurious);
        assert!(!st.was_once_online);
    }

    #[test]
    fn test_flagged_record_goes_spurious_again() {
        let mut st = AddrStatus::new(Addr(0x51));
        for _ in 0..3 {
            st.observe_with(false, 2, 3);
        }
        assert!(st.flag_for_deletion);
        // Still not responding while awaiting deletion: spurious again.
        let outcome = (0..3).map(|_| st.observe_with(false, 2, 3)).last().unwrap();
        assert!(outcome.changed && outcome.spurious);
    }

    #[test]
    fn test_offline_once_online_record_is_inert() {
        let mut st = AddrStatus::new(Addr(0x48));
        st.observe_with(true, 2, 3);
        st.observe_with(true, 2, 3);
        for _ in 0..3 {
            st.observe_with(false, 2, 3);
        }
        st.flag_for_deletion = false; // owner reported and kept the record
        let outcome = st.observe_with(false, 2, 3);
        assert!(!outcome.changed);
        assert_eq!(st.count, 0);
    }

    #[test]
    fn test_reonline_clears_deletion_flag() {
        let mut st = AddrStatus::new(Addr(0x48));
        st.observe_with(true, 2, 3);
        st.observe_with(true, 2, 3);
        for _ in 0..3 {
            st.observe_with(false, 2, 3);
        }
        assert!(st.flag_for_deletion);
        st.observe_with(true, 2, 3);
        let outcome = st.observe_with(true, 2, 3);
        assert!(outcome.changed && st.is_online && !st.flag_for_deletion);
    }

    #[test]
    fn test_responding_counter_saturates() {
        let mut st = AddrStatus::new(Addr(0x48));
        st.observe_with(true, 2, 3);
        st.observe_with(true, 2, 3);
        // Already online: further successes change nothing.
        for _ in 0..5 {
            assert!(!st.observe_with(true, 2, 3).changed);
        }
        assert!(st.is_online);
    }

    #[test]
    fn test_status_json_flags() {
        let mut st = AddrStatus::new(Addr(0x48));
        assert_eq!(st.status_json(), "{\"a\":\"0x0048\",\"s\":\"XXX\"}");
        st.observe_with(true, 1, 3);
        st.is_newly_identified = true;
        assert_eq!(st.status_json(), "{\"a\":\"0x0048\",\"s\":\"OWN\"}");
    }
}
