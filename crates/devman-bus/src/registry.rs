//! Device lifecycle: creation on identification, removal on offline.
//!
//! The registry keeps a liveness record for every address a bus has ever
//! scanned, drives each record through the online/offline hysteresis, and
//! materialises a [`DeviceState`] the moment an address is both confirmed
//! online and identified. On the offline transition, status callbacks run
//! first (on a snapshot, outside the registry lock) and the record is
//! removed afterwards; spurious phantoms come and go without any callback.
//!
//! Iteration is snapshot-based: device pointers are copied under a
//! short-held mutex and walked lock-free, so callback code can safely touch
//! the registry again.

use crate::device::DeviceState;
use crate::status::AddrStatus;
use devman_core::addr::unique_device_id;
use devman_core::transport::AddrScan;
use devman_core::{Addr, DevmanResult, TypeRegistry};
use devman_storage::{KvStore, PersistentRing};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Builds a namespaced key-value store for a device's persistent ring.
pub type KvFactory = Box<dyn Fn(&str) -> DevmanResult<Arc<dyn KvStore>> + Send + Sync>;

/// What happened to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    /// Confirmed online; `newly_identified` is set when the record was
    /// created by this event.
    Online { newly_identified: bool },
    /// Confirmed offline; the record is removed right after callbacks run.
    Offline,
}

/// Status-change notification delivered to registered callbacks.
#[derive(Clone)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub device: Arc<DeviceState>,
}

type StatusChangeCallback = Arc<dyn Fn(&DeviceEvent) + Send + Sync>;

/// Registry of identified devices plus pre-identification liveness records.
pub struct DeviceRegistry {
    types: Arc<dyn TypeRegistry>,
    kv_factory: Option<KvFactory>,
    /// Replay cap applied when a device's persistent backlog is imported.
    import_max_entries: u32,
    devices: Mutex<HashMap<String, Arc<DeviceState>>>,
    /// Addresses seen on a bus but not (yet) materialised as devices.
    pending: Mutex<HashMap<String, AddrStatus>>,
    callbacks: Mutex<Vec<StatusChangeCallback>>,
}

impl DeviceRegistry {
    pub fn new(
        types: Arc<dyn TypeRegistry>,
        kv_factory: Option<KvFactory>,
        import_max_entries: u32,
    ) -> Self {
        Self {
            types,
            kv_factory,
            import_max_entries,
            devices: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    fn devices_lock(&self) -> MutexGuard<'_, HashMap<String, Arc<DeviceState>>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending_lock(&self) -> MutexGuard<'_, HashMap<String, AddrStatus>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a status-change callback. Callbacks run on the scan path,
    /// outside the registry lock; they may re-enter the registry.
    pub fn register_status_callback(&self, callback: StatusChangeCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    fn emit(&self, event: &DeviceEvent) {
        let callbacks: Vec<StatusChangeCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(event);
        }
    }

    /// Copy the current device list under a short-held lock.
    pub fn snapshot(&self) -> Vec<Arc<DeviceState>> {
        self.devices_lock().values().cloned().collect()
    }

    /// Devices on one bus, sorted by address for stable output.
    pub fn snapshot_bus(&self, bus_name: &str) -> Vec<Arc<DeviceState>> {
        let mut devices: Vec<_> = self
            .devices_lock()
            .values()
            .filter(|d| d.bus_name() == bus_name)
            .cloned()
            .collect();
        devices.sort_by_key(|d| d.addr());
        devices
    }

    pub fn get(&self, bus_name: &str, addr: Addr) -> Option<Arc<DeviceState>> {
        self.devices_lock()
            .get(&unique_device_id(bus_name, addr))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.devices_lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices_lock().is_empty()
    }

    /// Process one bus scan: run every observation through the hysteresis,
    /// create devices for newly identified online addresses, and retire
    /// devices (and phantoms) that went offline.
    pub async fn handle_scan(&self, bus_name: &str, scans: &[AddrScan]) {
        for scan in scans {
            let id = unique_device_id(bus_name, scan.addr);
            let existing = self.devices_lock().get(&id).cloned();
            match existing {
                Some(device) => self.observe_device(&id, &device, scan.responding),
                None => self.observe_pending(bus_name, &id, scan).await,
            }
        }
    }

    /// A poll transaction failed for an identified device; count it against
    /// the hysteresis exactly like a failed scan.
    pub fn handle_poll_failure(&self, device: &Arc<DeviceState>) {
        self.observe_device(&device.unique_id(), device, false);
    }

    fn observe_device(&self, id: &str, device: &Arc<DeviceState>, responding: bool) {
        let outcome = device.observe_responding(responding);
        if !outcome.changed {
            return;
        }
        if device.is_online() {
            // Re-confirmed online after a dip below the offline threshold.
            self.emit(&DeviceEvent {
                kind: DeviceEventKind::Online {
                    newly_identified: false,
                },
                device: device.clone(),
            });
            return;
        }
        // Offline: report before the record disappears so callbacks can
        // still read it.
        info!(device = %id, "device offline, removing");
        self.emit(&DeviceEvent {
            kind: DeviceEventKind::Offline,
            device: device.clone(),
        });
        self.devices_lock().remove(id);
    }

    async fn observe_pending(&self, bus_name: &str, id: &str, scan: &AddrScan) {
        let (outcome, mut status) = {
            let mut pending = self.pending_lock();
            let status = pending
                .entry(id.to_string())
                .or_insert_with(|| AddrStatus::new(scan.addr));
            let outcome = status.observe(scan.responding);
            (outcome, status.clone())
        };
        if !status.is_online {
            if outcome.changed {
                // Came and went without ever being confirmed online: a
                // spurious record. No callbacks, just forget it.
                if outcome.spurious {
                    debug!(addr = %scan.addr, bus = bus_name, "spurious address record dropped");
                }
                self.pending_lock().remove(id);
            }
            return;
        }

        // Online: materialise a device as soon as identification is known
        // (which may arrive on a later scan than the online transition).
        let Some(type_index) = scan.type_index.filter(|_| scan.responding) else {
            if outcome.changed {
                debug!(addr = %scan.addr, bus = bus_name, "online but not yet identified");
            }
            return;
        };
        status.is_newly_identified = true;
        match self.create_device(bus_name, status, type_index).await {
            Ok(device) => {
                self.pending_lock().remove(id);
                self.devices_lock()
                    .insert(id.to_string(), device.clone());
                info!(
                    device = %id,
                    r#type = device.type_name(),
                    "new device identified"
                );
                self.emit(&DeviceEvent {
                    kind: DeviceEventKind::Online {
                        newly_identified: true,
                    },
                    device,
                });
            }
            Err(e) => {
                warn!(device = %id, error = %e, "device creation failed");
            }
        }
    }

    async fn create_device(
        &self,
        bus_name: &str,
        status: AddrStatus,
        type_index: u16,
    ) -> DevmanResult<Arc<DeviceState>> {
        let type_name = self
            .types
            .type_name(type_index)
            .ok_or_else(|| {
                devman_core::DevmanError::invalid_config(format!(
                    "unknown device type index {}",
                    type_index
                ))
            })?;
        let polling = self.types.polling_info(type_index).unwrap_or_default();
        let spec = self.types.buffer_spec(type_index).ok_or_else(|| {
            devman_core::DevmanError::invalid_config(format!(
                "no buffer spec for device type {}",
                type_name
            ))
        })?;

        let persistent = if spec.persist {
            match &self.kv_factory {
                Some(factory) => {
                    let namespace = unique_device_id(bus_name, status.addr);
                    Some(PersistentRing::new(factory(&namespace)?))
                }
                None => None,
            }
        } else {
            None
        };

        let device = Arc::new(DeviceState::new(
            bus_name, status, type_index, type_name, polling, spec, persistent,
        )?);
        device.restore_persistent(self.import_max_entries).await?;
        Ok(device)
    }
}
