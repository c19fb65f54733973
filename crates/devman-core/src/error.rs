//! Error types for the device manager library crates.
//!
//! Library code uses [`DevmanError`] (a `thiserror` enum) so callers can
//! match on the failure class; the application boundary wraps these in
//! `anyhow` with context. Buffer saturation is deliberately *not* an error -
//! the rings drop oldest and count drops instead.

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type DevmanResult<T> = std::result::Result<T, DevmanError>;

/// Primary error type for the device manager library crates.
#[derive(Error, Debug)]
pub enum DevmanError {
    /// Invalid configuration: zero payload size, empty namespace, bad
    /// buffer geometry. Reported to the caller with no state mutation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A payload handed to `put` did not match the configured fixed size.
    /// The ring is not advanced.
    #[error("payload size mismatch: expected {expected} bytes, got {actual}")]
    PayloadSizeMismatch { expected: usize, actual: usize },

    /// Key-value store read/write/commit failure. RAM state is unaffected;
    /// persistent state may be retried on the next batch.
    #[error("persistence I/O failure on key '{key}': {source}")]
    PersistenceIo {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Persisted metadata does not match the requested schema. Recovery is
    /// destructive (erase and re-init) so recording can continue after an
    /// on-wire layout change.
    #[error("persistent store schema mismatch ({0})")]
    SchemaMismatch(String),

    /// Batch sequence numbering jumped ahead of the persisted watermark,
    /// indicating loss between RAM and the store.
    #[error("sequence gap: store next seq {next_seq}, batch first seq {first_seq}")]
    SequenceGap { next_seq: u32, first_seq: u32 },
}

impl DevmanError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        DevmanError::InvalidConfig(msg.into())
    }
}

// =============================================================================
// Transport Errors
// =============================================================================

/// Classification of a bus transaction failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Device did not acknowledge / respond within the bus timeout.
    NoResponse,
    /// Bus-level fault (arbitration loss, mux failure, driver error).
    Bus,
    /// The request itself was malformed for this transport.
    InvalidRequest,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TransportErrorKind::NoResponse => "no_response",
            TransportErrorKind::Bus => "bus",
            TransportErrorKind::InvalidRequest => "invalid_request",
        };
        write!(f, "{}", label)
    }
}

/// Error returned by [`crate::BusTransport`] operations.
///
/// A `NoResponse` failure is normal bus life (devices unplug); it feeds the
/// address liveness hysteresis rather than propagating upward.
#[derive(Error, Debug, Clone)]
#[error("bus '{bus}' {kind} error: {message}")]
pub struct TransportError {
    pub bus: String,
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(
        bus: impl Into<String>,
        kind: TransportErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            bus: bus.into(),
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for the common "device absent" case.
    pub fn no_response(bus: impl Into<String>) -> Self {
        Self::new(bus, TransportErrorKind::NoResponse, "device not responding")
    }
}
