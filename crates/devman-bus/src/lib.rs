//! Per-device polling, liveness, buffering and drain control.
//!
//! This crate is the management core sitting between bus transports and the
//! upstream surfaces (publish channel, REST control API):
//!
//! - [`AddrStatus`] - per-address online/offline hysteresis with phantom
//!   (spurious record) suppression
//! - [`PollScheduler`] - poll/partial-poll timing and fragment assembly
//! - [`DeviceState`] - one device's composition of status, scheduler, RAM
//!   ring and optional persistent ring
//! - [`DrainController`] - selection filters, pause flags, rate overrides
//!   and publish batch caps
//! - [`DeviceRegistry`] - device lifecycle (create on identification,
//!   remove on offline) with snapshot iteration
//! - [`DeviceManager`] - the event-loop glue driving scans and polls across
//!   buses

pub mod device;
pub mod drain;
pub mod manager;
pub mod registry;
pub mod scheduler;
pub mod status;

pub use device::{DeviceState, PollSample};
pub use drain::{AllocEstimate, ControlSnapshot, DrainController};
pub use manager::{DeviceManager, KvFactory, OfflineSettings, PublishSlice};
pub use registry::{DeviceEvent, DeviceEventKind, DeviceRegistry};
pub use scheduler::{PollPlan, PollScheduler};
pub use status::{AddrStatus, ObserveOutcome, OnlineState};
