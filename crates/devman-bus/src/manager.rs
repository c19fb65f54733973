//! Event-loop glue: scans, polls and the control operations behind the
//! publish and REST surfaces.
//!
//! [`DeviceManager`] owns the registry, the drain controller and the set of
//! bus transports. One cooperative `tick` per interval drives every bus:
//! scan results feed the liveness hysteresis (creating and retiring
//! devices), then each live device's scheduler is consulted and due polls
//! are executed fragment by fragment. Nothing in the tick blocks beyond the
//! transports' own awaits.

pub use crate::registry::KvFactory;

use crate::device::DeviceState;
use crate::drain::DrainController;
use crate::registry::DeviceRegistry;
use devman_core::transport::BusTransport;
use devman_core::{Addr, TransportErrorKind, TypeRegistry};
use devman_storage::ring_buffer::SampleMeta;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Offline-buffer tuning from configuration.
#[derive(Debug, Clone, Copy)]
pub struct OfflineSettings {
    /// Default per-device response cap for one publish batch.
    pub max_per_publish: u32,
    /// RAM budget for offline buffers across the drain selection
    /// (0 = unconstrained).
    pub ram_budget_bytes: u32,
    /// Cap on entries replayed from a device's persistent backlog at
    /// creation (0 = ring capacity).
    pub import_max_entries: u32,
}

impl Default for OfflineSettings {
    fn default() -> Self {
        Self {
            max_per_publish: 32,
            ram_budget_bytes: 0,
            import_max_entries: 0,
        }
    }
}

/// One device's contribution to a publish batch.
#[derive(Debug, Clone)]
pub struct PublishSlice {
    pub bus: String,
    pub addr: Addr,
    pub type_name: String,
    pub payload_size: u32,
    pub payloads: Vec<u8>,
    pub metas: Vec<SampleMeta>,
}

/// Devices on one bus resolved from a control request's filters.
pub struct TargetSet {
    pub bus: String,
    /// Every live device on the bus.
    pub all: Vec<Arc<DeviceState>>,
    /// The devices matching the address/type filters (all of them when no
    /// filter was given).
    pub targets: Vec<Arc<DeviceState>>,
}

impl TargetSet {
    pub fn target_addrs(&self) -> Vec<Addr> {
        self.targets.iter().map(|d| d.addr()).collect()
    }
}

/// Top-level device manager: buses, registry, drain control.
pub struct DeviceManager {
    buses: Mutex<Vec<Arc<dyn BusTransport>>>,
    types: Arc<dyn TypeRegistry>,
    registry: DeviceRegistry,
    drain: DrainController,
}

impl DeviceManager {
    pub fn new(types: Arc<dyn TypeRegistry>, settings: OfflineSettings) -> Self {
        Self::with_kv_factory(types, settings, None)
    }

    /// Build with a key-value factory so persisted device types get a
    /// persistent ring (namespaced per device).
    pub fn with_kv_factory(
        types: Arc<dyn TypeRegistry>,
        settings: OfflineSettings,
        kv_factory: Option<KvFactory>,
    ) -> Self {
        Self {
            buses: Mutex::new(Vec::new()),
            registry: DeviceRegistry::new(types.clone(), kv_factory, settings.import_max_entries),
            types,
            drain: DrainController::new(settings.max_per_publish, settings.ram_budget_bytes),
        }
    }

    pub fn add_bus(&self, bus: Arc<dyn BusTransport>) {
        self.buses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bus);
    }

    pub fn buses(&self) -> Vec<Arc<dyn BusTransport>> {
        self.buses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn drain_controller(&self) -> &DrainController {
        &self.drain
    }

    pub fn type_registry(&self) -> &Arc<dyn TypeRegistry> {
        &self.types
    }

    // =========================================================================
    // Event loop
    // =========================================================================

    /// Run ticks forever at `tick_interval`. Spawn this on the runtime;
    /// drop the task to stop.
    pub async fn run(self: Arc<Self>, tick_interval: Duration) {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick(devman_core::timebase::wall_clock_us()).await;
        }
    }

    /// One scheduler pass: scan every bus, then execute due polls.
    /// Time is injected for determinism under test.
    pub async fn tick(&self, time_now_us: u64) {
        for bus in self.buses() {
            match bus.scan().await {
                Ok(scans) => self.registry.handle_scan(bus.bus_name(), &scans).await,
                Err(e) => {
                    warn!(bus = bus.bus_name(), error = %e, "bus scan failed");
                    continue;
                }
            }
            for device in self.registry.snapshot_bus(bus.bus_name()) {
                self.poll_device(&bus, &device, time_now_us).await;
            }
        }
    }

    /// Execute a due poll for one device, fragment by fragment. A fragment
    /// with a settle pause suspends the poll; the scheduler resumes it on a
    /// later tick. A non-responding device feeds the hysteresis instead.
    async fn poll_device(
        &self,
        bus: &Arc<dyn BusTransport>,
        device: &Arc<DeviceState>,
        time_now_us: u64,
    ) {
        let Some(plan) = device.pending_poll(time_now_us) else {
            return;
        };
        let mut assembled: Vec<u8> = Vec::new();
        let mut idx = plan.start_req_idx as usize;
        while idx < plan.reqs.len() {
            let req = &plan.reqs[idx];
            let result = match bus.poll(device.addr(), req).await {
                Ok(result) => result,
                Err(e) if e.kind == TransportErrorKind::NoResponse => {
                    debug!(device = %device.unique_id(), "poll unanswered");
                    self.registry.handle_poll_failure(device);
                    return;
                }
                Err(e) => {
                    warn!(device = %device.unique_id(), error = %e, "poll transaction failed");
                    return;
                }
            };
            assembled.extend_from_slice(&result.payload);
            let is_last = idx + 1 == plan.reqs.len();
            if is_last {
                if let Err(e) =
                    device.store_poll_result(0, result.capture_time_us, &assembled, 0)
                {
                    warn!(device = %device.unique_id(), error = %e, "poll result rejected");
                }
            } else if req.pause_after_send_ms > 0 {
                let _ = device.store_poll_result(
                    idx as u32 + 1,
                    result.capture_time_us,
                    &assembled,
                    req.pause_after_send_ms,
                );
                return;
            }
            idx += 1;
        }
    }

    // =========================================================================
    // Target resolution (control surface)
    // =========================================================================

    /// Resolve the devices a control request addresses.
    ///
    /// `bus_filter` empty matches all buses (case-insensitive otherwise).
    /// With no address/type filter every device on the bus is targeted;
    /// otherwise a device matches by address or (case-insensitive) type
    /// name, and buses where nothing matches are skipped. The second return
    /// is whether any bus matched the filter at all.
    pub fn resolve_targets(
        &self,
        bus_filter: &str,
        addrs: &[Addr],
        type_names: &[String],
    ) -> (Vec<TargetSet>, bool) {
        let types_lower: Vec<String> = type_names.iter().map(|t| t.to_ascii_lowercase()).collect();
        let mut sets = Vec::new();
        let mut bus_matched = false;
        for bus in self.buses() {
            let bus_name = bus.bus_name();
            if !bus_filter.is_empty() && !bus_name.eq_ignore_ascii_case(bus_filter) {
                continue;
            }
            bus_matched = true;
            let all = self.registry.snapshot_bus(bus_name);
            if all.is_empty() {
                continue;
            }
            let unfiltered = addrs.is_empty() && types_lower.is_empty();
            let targets: Vec<_> = all
                .iter()
                .filter(|d| {
                    unfiltered
                        || addrs.contains(&d.addr())
                        || types_lower.contains(&d.type_name().to_ascii_lowercase())
                })
                .cloned()
                .collect();
            if targets.is_empty() {
                continue;
            }
            sets.push(TargetSet {
                bus: bus_name.to_string(),
                all,
                targets,
            });
        }
        (sets, bus_matched)
    }

    /// Re-derive each device's pause flags from the controller state.
    fn sync_pause_flags(&self, devices: &[Arc<DeviceState>]) {
        for device in devices {
            device.set_buffer_paused(self.drain.effective_buffer_paused(device.addr()));
            device.set_drain_paused(self.drain.base_drain_paused(device.addr()));
        }
    }

    // =========================================================================
    // Control actions
    // =========================================================================

    /// Begin an offline capture session on the targets: buffering enabled
    /// for targets (paused for everything else on the bus), draining held
    /// until an explicit drain or link-up auto-resume, buffers rebalanced
    /// across the selection.
    pub fn start_capture(&self, set: &TargetSet, type_names: &[String], rate_ms: u32) {
        let target_addrs = set.target_addrs();
        self.drain.set_buffer_paused(&[], false);
        if set.targets.len() < set.all.len() {
            let pause_addrs: Vec<Addr> = set
                .all
                .iter()
                .map(|d| d.addr())
                .filter(|a| !target_addrs.contains(a))
                .collect();
            if !pause_addrs.is_empty() {
                self.drain.set_buffer_paused(&pause_addrs, true);
            }
        }
        // Hold the backlog: capture fills buffers, delivery is a separate
        // decision (explicit fetch or link-up auto-resume).
        self.drain.set_drain_paused(&[], true);
        if rate_ms > 0 {
            self.apply_rate_override(&set.targets, rate_ms);
        }
        self.drain.set_buffer_paused(&target_addrs, false);
        self.drain
            .set_drain_selection(&target_addrs, type_names, false);
        self.drain.rebalance(&set.targets);
        self.drain.set_auto_resume(true);
        self.sync_pause_flags(&set.all);
    }

    /// Stop a capture session: buffering paused (globally when every device
    /// on the bus was targeted), draining held, overrides and selection
    /// cleared, optionally wiping the buffers.
    pub fn stop_capture(&self, set: &TargetSet, clear: bool) {
        let target_addrs = set.target_addrs();
        if set.targets.len() == set.all.len() {
            self.drain.set_buffer_paused(&[], true);
        } else {
            self.drain.set_buffer_paused(&target_addrs, true);
        }
        self.drain.set_drain_paused(&[], true);
        self.clear_rate_override(&set.targets);
        self.drain.set_drain_selection(&[], &[], false);
        self.drain.set_auto_resume(false);
        if clear {
            self.reset_buffers(set);
        }
        self.sync_pause_flags(&set.all);
    }

    /// Wipe the targets' RAM and persistent backlogs.
    pub fn reset_buffers(&self, set: &TargetSet) {
        for device in &set.targets {
            device.clear_offline(true);
        }
        self.drain.set_auto_resume(false);
    }

    /// Override the poll rate for the targets and record it for status.
    pub fn apply_rate_override(&self, targets: &[Arc<DeviceState>], rate_ms: u32) {
        let interval_us = rate_ms as u64 * 1000;
        for device in targets {
            device.set_rate_override_us(Some(interval_us));
        }
        let addrs: Vec<Addr> = targets.iter().map(|d| d.addr()).collect();
        self.drain.record_rate_override(&addrs, interval_us);
    }

    /// Restore the configured poll rate for the targets.
    pub fn clear_rate_override(&self, targets: &[Arc<DeviceState>]) {
        for device in targets {
            device.set_rate_override_us(None);
        }
        let addrs: Vec<Addr> = targets.iter().map(|d| d.addr()).collect();
        self.drain.clear_rate_override(&addrs);
    }

    /// Upstream link state changed. With auto-resume armed, link-up lets
    /// the held backlog drain.
    pub fn set_drain_link_paused(&self, paused: bool) {
        self.drain.set_link_paused(paused);
        self.sync_pause_flags(&self.registry.snapshot());
    }

    // =========================================================================
    // Publish surface
    // =========================================================================

    /// Drain one publish batch across all buses.
    ///
    /// Each unpaused, selected device contributes up to the controller's
    /// per-device cap (`max_per_device` tightens it further when non-zero).
    /// The second return is the backlog remaining after the batch, the
    /// publish channel's hint to come back soon.
    pub fn drain_publish_batch(&self, max_per_device: u32) -> (Vec<PublishSlice>, u32) {
        let mut cap = self.drain.max_per_publish();
        if max_per_device > 0 {
            cap = cap.min(max_per_device);
        }
        let mut slices = Vec::new();
        let mut remaining = 0u32;
        for bus in self.buses() {
            for device in self.registry.snapshot_bus(bus.bus_name()) {
                if self
                    .drain
                    .effective_drain_paused(device.addr(), Some(device.type_name()))
                {
                    continue;
                }
                let (payloads, metas) = device.drain(cap, 0);
                remaining += device.offline_stats().depth;
                if metas.is_empty() {
                    continue;
                }
                slices.push(PublishSlice {
                    bus: bus.bus_name().to_string(),
                    addr: device.addr(),
                    type_name: device.type_name().to_string(),
                    payload_size: device.buffer_spec().payload_size,
                    payloads,
                    metas,
                });
            }
        }
        (slices, remaining)
    }

    /// 2-byte XOR fold over every bus's last identification-scan time and
    /// every device's last data time. The publish layer diffs this to
    /// detect change without draining anything.
    pub fn devices_hash(&self) -> [u8; 2] {
        let mut hash = [0u8; 2];
        for bus in self.buses() {
            let t = bus.last_ident_scan_ms();
            hash[0] ^= (t & 0xff) as u8;
            hash[1] ^= ((t >> 8) & 0xff) as u8;
        }
        for device in self.registry.snapshot() {
            let t = device.last_data_time_ms();
            hash[0] ^= (t & 0xff) as u8;
            hash[1] ^= ((t >> 8) & 0xff) as u8;
        }
        hash
    }

    /// Type information JSON by name or decimal index, passed through from
    /// the type registry.
    pub fn type_info_json(&self, name_or_index: &str) -> Option<String> {
        let by_index = name_or_index
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
            .then(|| name_or_index.parse::<u16>().ok())
            .flatten()
            .and_then(|idx| self.types.type_info_json(idx));
        by_index.or_else(|| {
            self.types
                .type_index(name_or_index)
                .and_then(|idx| self.types.type_info_json(idx))
        })
    }
}
