//! External collaborator seams: bus transports and the device-type registry.
//!
//! Bus arbitration, transaction I/O and slot muxing live behind
//! [`BusTransport`]; device-type knowledge (names, poll schedules, buffer
//! geometry, JSON schemas) lives behind [`TypeRegistry`]. The manager core
//! only ever talks to these traits, which keeps it testable against scripted
//! fakes.

use crate::addr::Addr;
use crate::error::TransportError;
use crate::poll::{BufferSpec, PollRequest, PollResult, PollingInfo, TypeIndex};
use async_trait::async_trait;

/// Liveness/identification observation for one address from a bus scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrScan {
    pub addr: Addr,
    /// Whether the address acknowledged during this scan cycle.
    pub responding: bool,
    /// Device type, once the transport's identification sequence has
    /// resolved it. `None` while the address is merely acknowledging.
    pub type_index: Option<TypeIndex>,
}

/// A single-initiator serial bus with addressable devices.
///
/// Implementations own all bus-level concerns: address scanning, transaction
/// framing, retries below the liveness threshold, slot muxing. The manager
/// drives them from its event loop; `poll` failures with kind `NoResponse`
/// feed the per-address hysteresis rather than erroring upward.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Stable bus name used in configuration, APIs and unique device IDs.
    fn bus_name(&self) -> &str;

    /// Report the current liveness/identification state of every address
    /// this bus knows about (attached now or recently).
    async fn scan(&self) -> Result<Vec<AddrScan>, TransportError>;

    /// Execute one poll request fragment against a device.
    async fn poll(&self, addr: Addr, req: &PollRequest) -> Result<PollResult, TransportError>;

    /// Wall-clock milliseconds of the last completed identification scan.
    /// Feeds the publish-layer change hash.
    fn last_ident_scan_ms(&self) -> u32 {
        0
    }
}

/// Device-type knowledge: index/name mapping, poll schedules and buffer
/// geometry. Decode routines and schema rendering are owned by
/// implementations; the manager only passes their JSON through.
pub trait TypeRegistry: Send + Sync {
    /// Name for a type index (e.g. `"VL53L4CD"`).
    fn type_name(&self, type_index: TypeIndex) -> Option<String>;

    /// Index for a type name (case-insensitive).
    fn type_index(&self, name: &str) -> Option<TypeIndex>;

    /// Poll schedule for a type.
    fn polling_info(&self, type_index: TypeIndex) -> Option<PollingInfo>;

    /// Offline-buffer geometry for a type.
    fn buffer_spec(&self, type_index: TypeIndex) -> Option<BufferSpec>;

    /// Rendered JSON type information (schema, decode hints) for a type.
    fn type_info_json(&self, type_index: TypeIndex) -> Option<String> {
        let _ = type_index;
        None
    }
}
