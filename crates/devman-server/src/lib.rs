//! Upstream surfaces over the device manager core.
//!
//! - [`rest`] - the `/devman/...` HTTP control API (offline buffer stats and
//!   control, device type info), thin axum handlers over
//!   [`devman_bus::DeviceManager`]
//! - [`publish`] - batch/hash source for the publish channel

pub mod publish;
pub mod rest;

pub use publish::{PublishBatch, PublishSource};
pub use rest::router;
