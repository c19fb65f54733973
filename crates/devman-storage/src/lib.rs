//! Offline sample storage for the gateway device manager.
//!
//! Two layers, composable per device:
//!
//! - [`RingBuffer`] - a fixed-capacity RAM ring of fixed-size poll payloads
//!   with per-entry promoted timestamps. Writers never block: the ring drops
//!   oldest on overflow and counts the loss.
//! - [`PersistentRing`] - the same ring shape laid out over a segmented
//!   key-value blob store so buffered samples survive restarts. Metadata is
//!   written last so a crash leaves either the pre-batch or post-batch view.
//!
//! The key-value substrate is the [`KvStore`] trait with an in-memory
//! implementation for tests and a file-per-key directory store for gateways
//! with real filesystems.

pub mod kv;
pub mod persistent;
pub mod ring_buffer;

pub use kv::{FileKvStore, KvStore, MemKvStore};
pub use persistent::PersistentRing;
pub use ring_buffer::{RingBuffer, RingStats, SampleMeta};
