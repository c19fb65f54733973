//! Drain/publish selection: pause flags, filters, rate overrides, budgets.
//!
//! Process-wide control state consulted by the publish path when it builds
//! a batch, and mutated by the control API. A device is skipped for
//! draining when any of these hold:
//!
//! - the global drain pause (or upstream-link pause) is set
//! - its address is in the per-address drain-pause set
//! - drain-only-selected mode is on and neither its address nor its type is
//!   selected
//!
//! The controller also owns the RAM budget used to rebalance per-device
//! buffer allocations across the current selection.

use crate::device::DeviceState;
use devman_core::Addr;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Per-address allocation estimate (no allocation performed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocEstimate {
    pub alloc_bytes: u32,
    pub bytes_per_entry: u32,
    pub payload_size: u32,
    pub meta_size: u32,
}

/// Read-only copy of the control state for status surfaces.
#[derive(Debug, Clone, Default)]
pub struct ControlSnapshot {
    pub buffer_paused: BTreeSet<Addr>,
    pub drain_paused: BTreeSet<Addr>,
    pub selected_addrs: BTreeSet<Addr>,
    pub selected_types: BTreeSet<String>,
    pub drain_only_selected: bool,
    pub max_per_publish_override: u32,
    pub global_buffer_paused: bool,
    pub global_drain_paused: bool,
    pub rate_overrides_us: BTreeMap<Addr, u64>,
}

#[derive(Debug, Default)]
struct DrainState {
    max_per_publish_override: u32,
    drain_only_selected: bool,
    selected_addrs: BTreeSet<Addr>,
    selected_types_lower: BTreeSet<String>,
    selected_types: BTreeSet<String>,
    global_buffer_paused: bool,
    global_drain_paused: bool,
    link_paused: bool,
    buffer_paused: BTreeSet<Addr>,
    drain_paused: BTreeSet<Addr>,
    rate_overrides_us: BTreeMap<Addr, u64>,
    auto_resume: bool,
}

/// Process-wide drain/publish control state.
pub struct DrainController {
    max_per_publish_global: u32,
    ram_budget_bytes: u32,
    state: Mutex<DrainState>,
}

impl DrainController {
    pub fn new(max_per_publish_global: u32, ram_budget_bytes: u32) -> Self {
        Self {
            max_per_publish_global,
            ram_budget_bytes,
            state: Mutex::new(DrainState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DrainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Responses per device allowed in one publish batch (override wins
    /// when set).
    pub fn max_per_publish(&self) -> u32 {
        let st = self.lock();
        if st.max_per_publish_override > 0 {
            st.max_per_publish_override
        } else {
            self.max_per_publish_global
        }
    }

    pub fn set_max_per_publish_override(&self, max_per_publish: u32) {
        self.lock().max_per_publish_override = max_per_publish;
    }

    // =========================================================================
    // Pause flags
    // =========================================================================

    /// Pause/resume buffering. An empty address list targets the global
    /// flag; otherwise the per-address set is updated.
    pub fn set_buffer_paused(&self, addrs: &[Addr], paused: bool) {
        let mut st = self.lock();
        if addrs.is_empty() {
            st.global_buffer_paused = paused;
        } else {
            for addr in addrs {
                if paused {
                    st.buffer_paused.insert(*addr);
                } else {
                    st.buffer_paused.remove(addr);
                }
            }
        }
    }

    /// Pause/resume draining with the same global/per-address convention.
    pub fn set_drain_paused(&self, addrs: &[Addr], paused: bool) {
        let mut st = self.lock();
        if addrs.is_empty() {
            st.global_drain_paused = paused;
        } else {
            for addr in addrs {
                if paused {
                    st.drain_paused.insert(*addr);
                } else {
                    st.drain_paused.remove(addr);
                }
            }
        }
    }

    /// Upstream link state. Arriving link-up clears the drain pause when
    /// auto-resume was armed by a capture start, so the backlog flows as
    /// soon as the link is back.
    pub fn set_link_paused(&self, paused: bool) {
        let mut st = self.lock();
        if st.link_paused == paused {
            return;
        }
        st.link_paused = paused;
        if !paused && st.auto_resume {
            info!("upstream link restored, auto-resuming offline drain");
            st.global_drain_paused = false;
            st.drain_paused.clear();
        }
    }

    pub fn set_auto_resume(&self, enabled: bool) {
        self.lock().auto_resume = enabled;
    }

    pub fn effective_buffer_paused(&self, addr: Addr) -> bool {
        let st = self.lock();
        st.global_buffer_paused || st.buffer_paused.contains(&addr)
    }

    /// Drain pause ignoring the selection filter: the global flag, link
    /// state and per-address set. This is what gets mirrored onto device
    /// flags; the selection filter stays dynamic at publish time.
    pub fn base_drain_paused(&self, addr: Addr) -> bool {
        let st = self.lock();
        st.global_drain_paused || st.link_paused || st.drain_paused.contains(&addr)
    }

    /// Whether draining is paused for this device, combining the global
    /// flag, link state, the per-address set and the selection filter.
    pub fn effective_drain_paused(&self, addr: Addr, type_name: Option<&str>) -> bool {
        let st = self.lock();
        if st.global_drain_paused || st.link_paused || st.drain_paused.contains(&addr) {
            return true;
        }
        if st.drain_only_selected {
            let by_addr = st.selected_addrs.contains(&addr);
            let by_type = type_name
                .map(|t| st.selected_types_lower.contains(&t.to_ascii_lowercase()))
                .unwrap_or(false);
            return !(by_addr || by_type);
        }
        false
    }

    // =========================================================================
    // Selection and rate overrides
    // =========================================================================

    /// Record the address/type selection; with `drain_only_selected`,
    /// unselected devices are excluded from publish batches.
    pub fn set_drain_selection(&self, addrs: &[Addr], type_names: &[String], drain_only_selected: bool) {
        let mut st = self.lock();
        st.selected_addrs = addrs.iter().copied().collect();
        st.selected_types = type_names.iter().cloned().collect();
        st.selected_types_lower = type_names
            .iter()
            .map(|t| t.to_ascii_lowercase())
            .collect();
        st.drain_only_selected = drain_only_selected;
    }

    pub fn record_rate_override(&self, addrs: &[Addr], interval_us: u64) {
        let mut st = self.lock();
        for addr in addrs {
            st.rate_overrides_us.insert(*addr, interval_us);
        }
    }

    pub fn clear_rate_override(&self, addrs: &[Addr]) {
        let mut st = self.lock();
        for addr in addrs {
            st.rate_overrides_us.remove(addr);
        }
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        let st = self.lock();
        ControlSnapshot {
            buffer_paused: st.buffer_paused.clone(),
            drain_paused: st.drain_paused.clone(),
            selected_addrs: st.selected_addrs.clone(),
            selected_types: st.selected_types.clone(),
            drain_only_selected: st.drain_only_selected,
            max_per_publish_override: st.max_per_publish_override,
            global_buffer_paused: st.global_buffer_paused,
            global_drain_paused: st.global_drain_paused || st.link_paused,
            rate_overrides_us: st.rate_overrides_us.clone(),
        }
    }

    // =========================================================================
    // RAM budgeting
    // =========================================================================

    /// Entry cap for each device so the selection fits the RAM budget:
    /// an even byte split, floored by one entry, capped at the type's
    /// configured maximum.
    fn budgeted_entries(&self, device: &DeviceState, selected_count: u32) -> u32 {
        let spec = device.buffer_spec();
        let bytes_per_entry =
            spec.payload_size + devman_storage::ring_buffer::META_STORAGE_BYTES;
        if selected_count == 0 || bytes_per_entry == 0 || self.ram_budget_bytes == 0 {
            return spec.max_entries;
        }
        let share = self.ram_budget_bytes / selected_count / bytes_per_entry;
        share.max(1).min(spec.max_entries)
    }

    /// Recompute per-device buffer allocations so the selection fits the
    /// RAM budget. Shrinks (or restores) each device's RAM ring and lowers
    /// the persistent ring's effective cap to match.
    ///
    /// Reinitialising a ring discards its RAM backlog; callers run this at
    /// capture start, before samples accumulate.
    pub fn rebalance(&self, devices: &[Arc<DeviceState>]) {
        let selected_count = devices.len() as u32;
        for device in devices {
            let spec = device.buffer_spec();
            let entries = self.budgeted_entries(device, selected_count);
            if entries != device.offline_stats().max_entries {
                debug!(
                    device = %device.unique_id(),
                    entries,
                    configured = spec.max_entries,
                    "rebalancing offline buffer"
                );
                if let Err(e) = device.configure_offline(
                    entries,
                    spec.payload_size,
                    spec.timestamp_bytes,
                    spec.timestamp_resolution_us,
                ) {
                    debug!(device = %device.unique_id(), error = %e, "rebalance skipped");
                    continue;
                }
            }
            if let Some(persistent) = device.persistent() {
                let _ = persistent.set_effective_max_entries(entries);
            }
        }
    }

    /// Allocation each device in the selection would get, without touching
    /// anything - backs the control API's simulate mode.
    pub fn estimate_allocations(
        &self,
        devices: &[Arc<DeviceState>],
    ) -> BTreeMap<Addr, AllocEstimate> {
        let selected_count = devices.len() as u32;
        devices
            .iter()
            .map(|device| {
                let spec = device.buffer_spec();
                let meta_size = devman_storage::ring_buffer::META_STORAGE_BYTES;
                let bytes_per_entry = spec.payload_size + meta_size;
                let entries = self.budgeted_entries(device, selected_count);
                (
                    device.addr(),
                    AllocEstimate {
                        alloc_bytes: entries * bytes_per_entry,
                        bytes_per_entry,
                        payload_size: spec.payload_size,
                        meta_size,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::AddrStatus;
    use devman_core::poll::{BufferSpec, PollingInfo};

    fn dev(addr: u32, max_entries: u32, payload_size: u32) -> Arc<DeviceState> {
        Arc::new(
            DeviceState::new(
                "I2CA",
                AddrStatus::new(Addr(addr)),
                1,
                "LSM6DS",
                PollingInfo::default(),
                BufferSpec {
                    max_entries,
                    payload_size,
                    timestamp_bytes: 2,
                    timestamp_resolution_us: 1000,
                    persist: false,
                },
                None,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_max_per_publish_override() {
        let ctl = DrainController::new(32, 0);
        assert_eq!(ctl.max_per_publish(), 32);
        ctl.set_max_per_publish_override(8);
        assert_eq!(ctl.max_per_publish(), 8);
        ctl.set_max_per_publish_override(0);
        assert_eq!(ctl.max_per_publish(), 32);
    }

    #[test]
    fn test_global_and_per_addr_pause() {
        let ctl = DrainController::new(32, 0);
        let a = Addr(0x48);
        let b = Addr(0x49);
        assert!(!ctl.effective_drain_paused(a, None));

        ctl.set_drain_paused(&[a], true);
        assert!(ctl.effective_drain_paused(a, None));
        assert!(!ctl.effective_drain_paused(b, None));

        ctl.set_drain_paused(&[], true);
        assert!(ctl.effective_drain_paused(b, None));
        ctl.set_drain_paused(&[], false);
        assert!(!ctl.effective_drain_paused(b, None));
        assert!(ctl.effective_drain_paused(a, None), "per-addr pause persists");
    }

    #[test]
    fn test_selection_filter_by_addr_and_type() {
        let ctl = DrainController::new(32, 0);
        let a = Addr(0x48);
        let b = Addr(0x49);
        ctl.set_drain_selection(&[a], &["VL53L4CD".to_string()], true);
        assert!(!ctl.effective_drain_paused(a, None), "selected by addr");
        assert!(
            !ctl.effective_drain_paused(b, Some("vl53l4cd")),
            "type match is case-insensitive"
        );
        assert!(ctl.effective_drain_paused(b, Some("LSM6DS")));
        assert!(ctl.effective_drain_paused(b, None));

        ctl.set_drain_selection(&[], &[], false);
        assert!(!ctl.effective_drain_paused(b, None));
    }

    #[test]
    fn test_link_pause_auto_resume() {
        let ctl = DrainController::new(32, 0);
        ctl.set_drain_paused(&[], true);
        ctl.set_auto_resume(true);
        ctl.set_link_paused(true);
        assert!(ctl.effective_drain_paused(Addr(1), None));

        ctl.set_link_paused(false);
        assert!(
            !ctl.effective_drain_paused(Addr(1), None),
            "link-up with auto-resume clears the drain pause"
        );

        // Without auto-resume the pause sticks.
        ctl.set_auto_resume(false);
        ctl.set_drain_paused(&[], true);
        ctl.set_link_paused(true);
        ctl.set_link_paused(false);
        assert!(ctl.effective_drain_paused(Addr(1), None));
    }

    #[test]
    fn test_rebalance_splits_budget_across_selection() {
        // 2 devices, payload 6 + meta 4 = 10 bytes/entry, budget 100 bytes:
        // 5 entries each despite a configured max of 50.
        let ctl = DrainController::new(32, 100);
        let devices = vec![dev(0x48, 50, 6), dev(0x49, 50, 6)];
        ctl.rebalance(&devices);
        assert_eq!(devices[0].offline_stats().max_entries, 5);
        assert_eq!(devices[1].offline_stats().max_entries, 5);

        // A single selected device gets the whole budget (still capped).
        ctl.rebalance(&devices[..1].to_vec());
        assert_eq!(devices[0].offline_stats().max_entries, 10);
    }

    #[test]
    fn test_estimate_matches_rebalance_without_side_effects() {
        let ctl = DrainController::new(32, 100);
        let devices = vec![dev(0x48, 50, 6), dev(0x49, 50, 6)];
        let estimates = ctl.estimate_allocations(&devices);
        assert_eq!(estimates[&Addr(0x48)].alloc_bytes, 5 * 10);
        assert_eq!(estimates[&Addr(0x48)].bytes_per_entry, 10);
        assert_eq!(estimates[&Addr(0x48)].payload_size, 6);
        assert_eq!(estimates[&Addr(0x48)].meta_size, 4);
        // No allocation happened.
        assert_eq!(devices[0].offline_stats().max_entries, 50);
    }

    #[test]
    fn test_zero_budget_means_unconstrained() {
        let ctl = DrainController::new(32, 0);
        let devices = vec![dev(0x48, 50, 6)];
        ctl.rebalance(&devices);
        assert_eq!(devices[0].offline_stats().max_entries, 50);
    }

    #[test]
    fn test_snapshot_reflects_state() {
        let ctl = DrainController::new(32, 0);
        ctl.set_buffer_paused(&[Addr(1)], true);
        ctl.set_drain_selection(&[Addr(2)], &["SHT40".to_string()], true);
        ctl.record_rate_override(&[Addr(2)], 250_000);
        ctl.set_max_per_publish_override(4);

        let snap = ctl.snapshot();
        assert!(snap.buffer_paused.contains(&Addr(1)));
        assert!(snap.selected_addrs.contains(&Addr(2)));
        assert!(snap.selected_types.contains("SHT40"));
        assert!(snap.drain_only_selected);
        assert_eq!(snap.max_per_publish_override, 4);
        assert_eq!(snap.rate_overrides_us[&Addr(2)], 250_000);

        ctl.clear_rate_override(&[Addr(2)]);
        assert!(ctl.snapshot().rate_overrides_us.is_empty());
    }
}
