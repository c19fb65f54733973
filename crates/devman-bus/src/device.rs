//! Per-device composition: liveness, schedule, RAM ring, persistence.
//!
//! One [`DeviceState`] exists per identified device. It ties together the
//! address hysteresis, the poll scheduler, the RAM offline ring and (when
//! the device type asks for it) a persistent ring, plus the live aggregator
//! feed for the publish path.
//!
//! Every completed sample that is not buffer-paused is either delivered via
//! the aggregator channel or retained in the RAM ring until consumed or
//! overwritten under drop-oldest - buffered data is only ever lost to
//! capacity, never silently.

use crate::scheduler::{PollPlan, PollScheduler};
use crate::status::{AddrStatus, ObserveOutcome};
use devman_core::poll::{BufferSpec, PollingInfo};
use devman_core::{Addr, DevmanResult, TypeIndex};
use devman_storage::ring_buffer::{RingStats, SampleMeta};
use devman_storage::{PersistentRing, RingBuffer};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::warn;

/// Capacity of the per-device aggregator channel; slow subscribers lose
/// samples (the ring is the lossless path).
const AGGREGATOR_CHANNEL_CAPACITY: usize = 16;

/// One assembled poll sample on the live publish path.
#[derive(Debug, Clone)]
pub struct PollSample {
    pub addr: Addr,
    pub seq: u32,
    pub payload: Vec<u8>,
    pub capture_time_us: u64,
}

/// State for one identified device on a bus.
pub struct DeviceState {
    bus_name: String,
    addr: Addr,
    type_index: TypeIndex,
    type_name: String,
    spec: BufferSpec,
    status: Mutex<AddrStatus>,
    scheduler: Mutex<PollScheduler>,
    ring: RingBuffer,
    persistent: Option<PersistentRing>,
    offline_seq: AtomicU32,
    buffer_paused: AtomicBool,
    drain_paused: AtomicBool,
    aggregator: broadcast::Sender<Arc<PollSample>>,
    last_data_time_ms: AtomicU32,
}

impl DeviceState {
    /// Build the device from its identified type's schedule and buffer
    /// geometry. The RAM ring is allocated immediately; call
    /// [`DeviceState::restore_persistent`] afterwards to open the persistent
    /// ring and replay its backlog.
    pub fn new(
        bus_name: impl Into<String>,
        status: AddrStatus,
        type_index: TypeIndex,
        type_name: impl Into<String>,
        polling: PollingInfo,
        spec: BufferSpec,
        persistent: Option<PersistentRing>,
    ) -> DevmanResult<Self> {
        let ring = RingBuffer::new();
        ring.init(
            spec.max_entries,
            spec.payload_size,
            spec.timestamp_bytes,
            spec.timestamp_resolution_us,
        )?;
        let (aggregator, _) = broadcast::channel(AGGREGATOR_CHANNEL_CAPACITY);
        Ok(Self {
            bus_name: bus_name.into(),
            addr: status.addr,
            type_index,
            type_name: type_name.into(),
            spec,
            status: Mutex::new(status),
            scheduler: Mutex::new(PollScheduler::new(polling)),
            ring,
            persistent,
            offline_seq: AtomicU32::new(0),
            buffer_paused: AtomicBool::new(false),
            drain_paused: AtomicBool::new(false),
            aggregator,
            last_data_time_ms: AtomicU32::new(0),
        })
    }

    fn status_lock(&self) -> MutexGuard<'_, AddrStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scheduler_lock(&self) -> MutexGuard<'_, PollScheduler> {
        self.scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    pub fn addr(&self) -> Addr {
        self.addr
    }

    pub fn type_index(&self) -> TypeIndex {
        self.type_index
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn buffer_spec(&self) -> BufferSpec {
        self.spec
    }

    /// Unique ID of this device across buses.
    pub fn unique_id(&self) -> String {
        devman_core::addr::unique_device_id(&self.bus_name, self.addr)
    }

    // =========================================================================
    // Liveness
    // =========================================================================

    /// Feed a responding/not-responding observation through the hysteresis.
    pub fn observe_responding(&self, is_responding: bool) -> ObserveOutcome {
        self.status_lock().observe(is_responding)
    }

    pub fn is_online(&self) -> bool {
        self.status_lock().is_online
    }

    /// Status JSON (`{"a":"0xHHHH","s":"OWN"}`) for the publish layer.
    pub fn status_json(&self) -> String {
        self.status_lock().status_json()
    }

    // =========================================================================
    // Polling
    // =========================================================================

    /// Check whether this device's poll (or partial-poll resume) is due.
    pub fn pending_poll(&self, time_now_us: u64) -> Option<PollPlan> {
        self.scheduler_lock().pending(time_now_us)
    }

    /// Store a poll result fragment.
    ///
    /// `next_req_idx > 0` records a partial fragment and arms the
    /// inter-fragment pause. `next_req_idx == 0` completes the poll: the
    /// assembled sample goes to the aggregator and, unless buffering is
    /// paused, into the RAM ring (and onward to the persistent ring for
    /// persisted types).
    pub fn store_poll_result(
        &self,
        next_req_idx: u32,
        time_now_us: u64,
        fragment: &[u8],
        pause_after_send_ms: u32,
    ) -> DevmanResult<()> {
        if next_req_idx != 0 {
            self.scheduler_lock()
                .record_partial(next_req_idx, fragment, pause_after_send_ms);
            return Ok(());
        }

        let assembled = self.scheduler_lock().finish(fragment);
        let seq = self.offline_seq.fetch_add(1, Ordering::SeqCst);
        self.last_data_time_ms
            .store((time_now_us / 1000) as u32, Ordering::Relaxed);

        // Live path first; a lagging (or absent) subscriber is fine, the
        // ring below is the lossless path.
        let _ = self.aggregator.send(Arc::new(PollSample {
            addr: self.addr,
            seq,
            payload: assembled.clone(),
            capture_time_us: time_now_us,
        }));

        if !self.ring.is_configured() || self.buffer_paused.load(Ordering::Relaxed) {
            return Ok(());
        }
        let adjusted_ts_ms = self.ring.put(time_now_us, seq, &assembled)?;

        if self.spec.persist {
            if let Some(persistent) = &self.persistent {
                if persistent.is_ready() {
                    if let Err(e) =
                        persistent.append_batch(&assembled, &[adjusted_ts_ms], seq, 1)
                    {
                        warn!(
                            device = %self.unique_id(),
                            seq,
                            error = %e,
                            "persist mirror failed, sample retained in RAM only"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply or clear a poll-rate override (`None` restores the configured
    /// rate).
    pub fn set_rate_override_us(&self, interval_us: Option<u64>) {
        self.scheduler_lock().set_rate_override_us(interval_us);
    }

    /// Subscribe to the live sample feed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PollSample>> {
        self.aggregator.subscribe()
    }

    /// Wall-clock milliseconds (truncated) of the last completed sample.
    pub fn last_data_time_ms(&self) -> u32 {
        self.last_data_time_ms.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Offline buffer
    // =========================================================================

    /// Reinitialise the RAM ring with new geometry. Paused flags are left
    /// as they are; reconfiguration must not resume a paused capture.
    pub fn configure_offline(
        &self,
        max_entries: u32,
        payload_size: u32,
        timestamp_bytes: u32,
        timestamp_resolution_us: u32,
    ) -> DevmanResult<()> {
        self.ring
            .init(max_entries, payload_size, timestamp_bytes, timestamp_resolution_us)
    }

    /// Open the persistent ring (if this device type persists) and replay
    /// its backlog into the RAM ring, aligning the sample counter with the
    /// store.
    pub async fn restore_persistent(&self, import_max_entries: u32) -> DevmanResult<()> {
        let Some(persistent) = &self.persistent else {
            return Ok(());
        };
        persistent.configure(
            &self.unique_id(),
            self.spec.payload_size,
            self.spec.timestamp_bytes,
            self.spec.timestamp_resolution_us,
            self.spec.max_entries,
        )?;
        let next_seq = persistent.import_to(&self.ring, import_max_entries).await?;
        self.set_offline_seq(next_seq);
        Ok(())
    }

    pub fn persistent(&self) -> Option<&PersistentRing> {
        self.persistent.as_ref()
    }

    /// Drain up to `max_responses` buffered samples (oldest first,
    /// consuming). Returns nothing while draining is paused.
    pub fn drain(&self, max_responses: u32, max_bytes: u32) -> (Vec<u8>, Vec<SampleMeta>) {
        if self.drain_paused.load(Ordering::Relaxed) || !self.ring.is_configured() {
            return (Vec::new(), Vec::new());
        }
        self.ring.get(max_responses, max_bytes, 0, true)
    }

    /// Non-destructive window over the buffered samples. Ignores the drain
    /// pause: peeking is how operators inspect a paused backlog.
    pub fn peek_offline(
        &self,
        start_idx: u32,
        max_responses: u32,
        max_bytes: u32,
    ) -> (Vec<u8>, Vec<SampleMeta>) {
        if !self.ring.is_configured() {
            return (Vec::new(), Vec::new());
        }
        self.ring.get(max_responses, max_bytes, start_idx, false)
    }

    pub fn offline_stats(&self) -> RingStats {
        self.ring.stats()
    }

    /// Drop the RAM backlog and restart sample numbering; optionally wipe
    /// the persistent backlog too.
    pub fn clear_offline(&self, include_persistent: bool) {
        self.ring.clear();
        self.offline_seq.store(0, Ordering::SeqCst);
        if include_persistent {
            if let Some(persistent) = &self.persistent {
                if let Err(e) = persistent.clear() {
                    warn!(device = %self.unique_id(), error = %e, "persistent clear failed");
                }
            }
        }
    }

    pub fn set_buffer_paused(&self, paused: bool) {
        self.buffer_paused.store(paused, Ordering::Relaxed);
    }

    pub fn is_buffer_paused(&self) -> bool {
        self.buffer_paused.load(Ordering::Relaxed)
    }

    pub fn set_drain_paused(&self, paused: bool) {
        self.drain_paused.store(paused, Ordering::Relaxed);
    }

    pub fn is_drain_paused(&self) -> bool {
        self.drain_paused.load(Ordering::Relaxed)
    }

    /// Align the sample counter (used after persistent replay).
    pub fn set_offline_seq(&self, next_seq: u32) {
        self.offline_seq.store(next_seq, Ordering::SeqCst);
    }

    pub fn offline_seq(&self) -> u32 {
        self.offline_seq.load(Ordering::SeqCst)
    }
}
