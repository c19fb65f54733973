//! Core types and trait seams for the gateway device manager.
//!
//! This crate holds the vocabulary shared by the storage, bus-management and
//! server crates:
//!
//! - [`Addr`] - bus-scoped device address (opaque to everything above the
//!   transport)
//! - [`PollRequest`] / [`PollResult`] / [`PollingInfo`] - the poll transaction
//!   shapes exchanged with a [`BusTransport`]
//! - [`BusTransport`] and [`TypeRegistry`] - the two external collaborator
//!   seams (bus I/O and device-type knowledge live behind these)
//! - [`DevmanError`] - the library error taxonomy
//! - [`timebase`] - device-timestamp reconstruction (wrap tracking)

pub mod addr;
pub mod error;
pub mod poll;
pub mod timebase;
pub mod transport;

pub use addr::Addr;
pub use error::{DevmanError, DevmanResult, TransportError, TransportErrorKind};
pub use poll::{BufferSpec, PollRequest, PollResult, PollingInfo, TypeIndex};
pub use timebase::TimestampTracker;
pub use transport::{AddrScan, BusTransport, TypeRegistry};
