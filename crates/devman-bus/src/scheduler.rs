//! Poll timing and partial-poll assembly for one device.
//!
//! A device is polled every `poll_interval_us`. A poll may be split into
//! fragments when a request carries a `pause_after_send_ms` (sensor settle
//! time): the scheduler then comes due again after the pause rather than the
//! full interval, and accumulated fragments concatenate into one logical
//! sample when the final fragment lands.
//!
//! Time is passed in by the caller (microseconds, wrap-safe comparison) so
//! the schedule is fully deterministic under test.

use devman_core::poll::{PollRequest, PollingInfo};

/// What the bus should execute when a poll is due.
#[derive(Debug, Clone)]
pub struct PollPlan {
    /// Full ordered request list for the poll.
    pub reqs: Vec<PollRequest>,
    /// Index of the first request still to run (non-zero while resuming a
    /// partial poll).
    pub start_req_idx: u32,
}

/// Per-device poll schedule state.
#[derive(Debug)]
pub struct PollScheduler {
    poll_interval_us: u64,
    configured_interval_us: u64,
    pause_after_send_ms: u32,
    next_req_idx: u32,
    last_poll_time_us: Option<u64>,
    poll_reqs: Vec<PollRequest>,
    partial: Vec<u8>,
}

impl PollScheduler {
    pub fn new(polling: PollingInfo) -> Self {
        Self {
            poll_interval_us: polling.poll_interval_us,
            configured_interval_us: polling.poll_interval_us,
            pause_after_send_ms: 0,
            next_req_idx: 0,
            last_poll_time_us: None,
            poll_reqs: polling.poll_reqs,
            partial: Vec::new(),
        }
    }

    /// Effective poll interval in microseconds (override applied).
    pub fn poll_interval_us(&self) -> u64 {
        self.poll_interval_us
    }

    /// Apply or clear a poll-rate override. `None` restores the configured
    /// interval.
    pub fn set_rate_override_us(&mut self, interval_us: Option<u64>) {
        self.poll_interval_us = interval_us.unwrap_or(self.configured_interval_us);
    }

    /// Check whether a poll (or partial-poll resumption) is due.
    ///
    /// The first call anchors the schedule to `time_now_us`. While a partial
    /// poll is in flight the effective interval is the recorded
    /// inter-fragment pause instead of the poll interval. The comparison is
    /// wrap-safe.
    pub fn pending(&mut self, time_now_us: u64) -> Option<PollPlan> {
        let last = *self.last_poll_time_us.get_or_insert(time_now_us);

        let is_start_of_poll = self.next_req_idx == 0;
        let interval_us = if is_start_of_poll {
            self.poll_interval_us
        } else {
            self.pause_after_send_ms as u64 * 1000
        };
        if time_now_us.wrapping_sub(last) < interval_us {
            return None;
        }

        if is_start_of_poll {
            self.partial.clear();
        }
        self.last_poll_time_us = Some(time_now_us);

        if self.poll_reqs.is_empty() {
            return None;
        }
        Some(PollPlan {
            reqs: self.poll_reqs.clone(),
            start_req_idx: self.next_req_idx,
        })
    }

    /// Record a fragment that is *not* the end of the poll. The next
    /// [`PollScheduler::pending`] comes due after `pause_after_send_ms`.
    pub fn record_partial(&mut self, next_req_idx: u32, fragment: &[u8], pause_after_send_ms: u32) {
        self.partial.extend_from_slice(fragment);
        self.pause_after_send_ms = pause_after_send_ms;
        self.next_req_idx = next_req_idx;
    }

    /// Complete the poll: concatenate any accumulated fragments with the
    /// final one and reset to start-of-poll state. Returns the assembled
    /// logical sample.
    pub fn finish(&mut self, fragment: &[u8]) -> Vec<u8> {
        let mut assembled = std::mem::take(&mut self.partial);
        assembled.extend_from_slice(fragment);
        self.next_req_idx = 0;
        assembled
    }

    /// Whether a partial poll is currently in flight.
    pub fn mid_poll(&self) -> bool {
        self.next_req_idx != 0
    }
}
