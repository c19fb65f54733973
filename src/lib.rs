//! Bus-attached device manager for embedded gateways.
//!
//! Scans serial buses for attached sensors, polls them on per-type
//! schedules, and delivers captured samples upstream - buffering in RAM
//! (and optionally a persistent key-value store) whenever the upstream link
//! is down, then draining the backlog in order when it returns.
//!
//! The workspace splits along the natural seams:
//!
//! - [`devman_core`] - shared types and the [`devman_core::BusTransport`] /
//!   [`devman_core::TypeRegistry`] collaborator traits
//! - [`devman_storage`] - RAM ring buffer and segmented persistent ring
//! - [`devman_bus`] - liveness hysteresis, poll scheduling, per-device
//!   state, drain control, device lifecycle
//! - [`devman_server`] - REST control surface and publish source
//!
//! This crate is the application shell: configuration, logging, a
//! config-driven device-type registry, and the `devmand` binary wiring it
//! all together.

pub mod config;
pub mod logging;
pub mod types;

pub use config::Settings;
pub use types::StaticTypeRegistry;

pub use devman_bus;
pub use devman_core;
pub use devman_server;
pub use devman_storage;
