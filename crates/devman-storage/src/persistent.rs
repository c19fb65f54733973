//! Persisted ring of poll samples over a segmented key-value store.
//!
//! Samples buffered in RAM can be mirrored here so they survive restarts.
//! The layout mirrors the RAM ring: fixed-size records in a circular index
//! space, grouped into fixed-size segment blobs (one KV page each) keyed
//! `s00000`..`s99999`, with a packed metadata blob under `meta`.
//!
//! # Crash safety
//!
//! The only atomic persisted unit is a single `set_blob` + `commit`.
//! [`PersistentRing::append_batch`] therefore writes all touched segments
//! first and the metadata blob last: a reader after restart sees either the
//! pre-batch or post-batch state. Partially written segments may exist but
//! are unreachable until metadata points at them.
//!
//! # Recovery policy
//!
//! Incompatible metadata (schema changed, e.g. after a firmware update that
//! altered payload layout) and sequence gaps (samples lost between RAM and
//! store) both recover destructively: erase and re-initialise. Refusing to
//! record new samples would be worse than losing the backlog.

use crate::kv::KvStore;
use crate::ring_buffer::RingBuffer;
use devman_core::{DevmanError, DevmanResult};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Magic for the metadata blob ("OBNV").
const META_MAGIC: u32 = 0x4f42_4e56;
/// Metadata layout version.
const META_VERSION: u32 = 2;
/// Nominal segment blob size - one KV page.
const SEGMENT_BYTES: u32 = 4000;
/// Key of the metadata blob.
const META_KEY: &str = "meta";
/// Records imported between cooperative yields.
const IMPORT_YIELD_EVERY: u32 = 512;

/// Key of the segment blob holding record index `seg_idx * records_per_segment`.
pub fn segment_key(seg_idx: u32) -> String {
    format!("s{:05}", seg_idx)
}

// =============================================================================
// Metadata blob
// =============================================================================

/// Packed ring metadata, persisted under [`META_KEY`] as 14 little-endian
/// `u32` values in field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct RingMeta {
    magic: u32,
    version: u32,
    payload_size: u32,
    record_size: u32,
    timestamp_bytes: u32,
    timestamp_resolution_us: u32,
    max_entries: u32,
    head: u32,
    count: u32,
    next_seq: u32,
    import_seq: u32,
    records_per_segment: u32,
    segment_bytes: u32,
    drops: u32,
}

impl RingMeta {
    const ENCODED_LEN: usize = 14 * 4;

    fn fresh(
        payload_size: u32,
        timestamp_bytes: u32,
        timestamp_resolution_us: u32,
        max_entries: u32,
    ) -> Self {
        let record_size = payload_size + 4;
        Self {
            magic: META_MAGIC,
            version: META_VERSION,
            payload_size,
            record_size,
            timestamp_bytes,
            timestamp_resolution_us,
            max_entries,
            head: 0,
            count: 0,
            next_seq: 0,
            import_seq: 0,
            records_per_segment: SEGMENT_BYTES / record_size,
            segment_bytes: SEGMENT_BYTES,
            drops: 0,
        }
    }

    fn fields(&self) -> [u32; 14] {
        [
            self.magic,
            self.version,
            self.payload_size,
            self.record_size,
            self.timestamp_bytes,
            self.timestamp_resolution_us,
            self.max_entries,
            self.head,
            self.count,
            self.next_seq,
            self.import_seq,
            self.records_per_segment,
            self.segment_bytes,
            self.drops,
        ]
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        for field in self.fields() {
            out.extend_from_slice(&field.to_le_bytes());
        }
        out
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        let mut fields = [0u32; 14];
        for (i, field) in fields.iter_mut().enumerate() {
            let at = i * 4;
            *field = u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        }
        let meta = Self {
            magic: fields[0],
            version: fields[1],
            payload_size: fields[2],
            record_size: fields[3],
            timestamp_bytes: fields[4],
            timestamp_resolution_us: fields[5],
            max_entries: fields[6],
            head: fields[7],
            count: fields[8],
            next_seq: fields[9],
            import_seq: fields[10],
            records_per_segment: fields[11],
            segment_bytes: fields[12],
            drops: fields[13],
        };
        (meta.magic == META_MAGIC && meta.version == META_VERSION).then_some(meta)
    }

    /// Whether the stored schema exactly matches the requested geometry.
    fn compatible_with(
        &self,
        payload_size: u32,
        timestamp_bytes: u32,
        timestamp_resolution_us: u32,
    ) -> bool {
        self.magic == META_MAGIC
            && self.version == META_VERSION
            && self.payload_size == payload_size
            && self.timestamp_bytes == timestamp_bytes
            && self.timestamp_resolution_us == timestamp_resolution_us
            && self.record_size == payload_size + 4
            && self.records_per_segment > 0
            && self.segment_bytes > 0
    }

    fn first_seq(&self) -> u32 {
        if self.next_seq >= self.count {
            self.next_seq - self.count
        } else {
            0
        }
    }

    fn tail(&self) -> u32 {
        (self.head + self.max_entries - self.count) % self.max_entries
    }
}

// =============================================================================
// Persistent ring
// =============================================================================

struct PersistentInner {
    namespace: String,
    meta: Option<RingMeta>,
    effective_max_entries: u32,
}

/// Segmented blob-store ring with crash-safe metadata.
pub struct PersistentRing {
    store: Arc<dyn KvStore>,
    inner: Mutex<PersistentInner>,
}

impl PersistentRing {
    /// Wrap a key-value store. The ring is unusable until
    /// [`PersistentRing::configure`] succeeds.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            inner: Mutex::new(PersistentInner {
                namespace: String::new(),
                meta: None,
                effective_max_entries: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PersistentInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save_meta(&self, meta: &RingMeta) -> DevmanResult<()> {
        self.store.set_blob(META_KEY, &meta.encode())?;
        self.store.commit()
    }

    /// Open or initialise the ring for the given geometry.
    ///
    /// Loads existing metadata if present; if its schema does not exactly
    /// match the requested geometry the whole namespace is erased and
    /// re-initialised (destructive recovery - see module docs).
    pub fn configure(
        &self,
        namespace: &str,
        payload_size: u32,
        timestamp_bytes: u32,
        timestamp_resolution_us: u32,
        max_entries: u32,
    ) -> DevmanResult<()> {
        if namespace.is_empty() {
            return Err(DevmanError::invalid_config("empty persistence namespace"));
        }
        if payload_size == 0 || max_entries == 0 {
            return Err(DevmanError::invalid_config(format!(
                "persistent ring geometry payload_size {} max_entries {}",
                payload_size, max_entries
            )));
        }
        let fresh = RingMeta::fresh(
            payload_size,
            timestamp_bytes,
            timestamp_resolution_us,
            max_entries,
        );
        if fresh.records_per_segment == 0 {
            return Err(DevmanError::invalid_config(format!(
                "record size {} exceeds segment size {}",
                fresh.record_size, SEGMENT_BYTES
            )));
        }

        let loaded = self
            .store
            .get_blob(META_KEY)?
            .and_then(|bytes| RingMeta::decode(&bytes));
        let meta = match loaded {
            Some(existing)
                if existing.compatible_with(
                    payload_size,
                    timestamp_bytes,
                    timestamp_resolution_us,
                ) =>
            {
                existing
            }
            Some(existing) => {
                warn!(
                    namespace,
                    stored_payload = existing.payload_size,
                    requested_payload = payload_size,
                    "persistent ring schema mismatch, erasing store"
                );
                self.store.erase_all()?;
                self.store.commit()?;
                self.save_meta(&fresh)?;
                fresh
            }
            None => {
                debug!(namespace, "initialising persistent ring metadata");
                self.save_meta(&fresh)?;
                fresh
            }
        };

        let mut inner = self.lock();
        inner.namespace = namespace.to_string();
        inner.effective_max_entries = meta.max_entries;
        inner.meta = Some(meta);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.lock().meta.is_some()
    }

    pub fn count(&self) -> u32 {
        self.lock().meta.map(|m| m.count).unwrap_or(0)
    }

    pub fn next_seq(&self) -> u32 {
        self.lock().meta.map(|m| m.next_seq).unwrap_or(0)
    }

    pub fn drops(&self) -> u32 {
        self.lock().meta.map(|m| m.drops).unwrap_or(0)
    }

    /// Lower the retained-entry cap below the stored `max_entries` (to match
    /// the RAM budget). Entries beyond the cap are dropped oldest-first.
    pub fn set_effective_max_entries(&self, max_entries: u32) -> DevmanResult<()> {
        let mut inner = self.lock();
        let Some(mut meta) = inner.meta else {
            return Ok(());
        };
        inner.effective_max_entries = if max_entries == 0 || max_entries > meta.max_entries {
            meta.max_entries
        } else {
            max_entries
        };
        if meta.count > inner.effective_max_entries {
            meta.drops += meta.count - inner.effective_max_entries;
            meta.count = inner.effective_max_entries;
            inner.meta = Some(meta);
            drop(inner);
            return self.save_meta(&meta);
        }
        inner.meta = Some(meta);
        Ok(())
    }

    /// Append a batch of records. `payloads` is `count` concatenated
    /// payloads; `adjusted_ts_ms[i]` is the promoted timestamp of entry `i`;
    /// `first_seq` is the sequence number of entry 0.
    ///
    /// Entries older than the store's watermark are skipped; a sequence gap
    /// (loss between RAM and store) resets the store and realigns. Segments
    /// are flushed before metadata so a crash can only lose the whole batch.
    ///
    /// Returns the last sequence number accounted for.
    pub fn append_batch(
        &self,
        payloads: &[u8],
        adjusted_ts_ms: &[u32],
        first_seq: u32,
        count: u32,
    ) -> DevmanResult<u32> {
        let mut inner = self.lock();
        let Some(mut meta) = inner.meta else {
            return Err(DevmanError::invalid_config("persistent ring not configured"));
        };
        if count == 0
            || adjusted_ts_ms.len() < count as usize
            || payloads.len() < (count * meta.payload_size) as usize
        {
            return Err(DevmanError::invalid_config(format!(
                "append batch shape count {} payloads {} ts {}",
                count,
                payloads.len(),
                adjusted_ts_ms.len()
            )));
        }
        let effective_max = if inner.effective_max_entries > 0 {
            inner.effective_max_entries
        } else {
            meta.max_entries
        };

        if meta.count == 0 {
            meta.next_seq = first_seq;
        } else if first_seq > meta.next_seq {
            warn!(
                namespace = %inner.namespace,
                next_seq = meta.next_seq,
                first_seq,
                "sequence gap ahead of store, resetting"
            );
            self.store.erase_all()?;
            self.store.commit()?;
            let mut fresh = RingMeta::fresh(
                meta.payload_size,
                meta.timestamp_bytes,
                meta.timestamp_resolution_us,
                meta.max_entries,
            );
            fresh.next_seq = first_seq;
            self.save_meta(&fresh)?;
            meta = fresh;
        }

        let skip = if first_seq < meta.next_seq {
            let diff = meta.next_seq - first_seq;
            if diff >= count {
                // Whole batch already stored.
                inner.meta = Some(meta);
                return Ok(meta.next_seq.saturating_sub(1));
            }
            diff
        } else {
            0
        };

        let record_size = meta.record_size as usize;
        let seg_len = (meta.records_per_segment * meta.record_size) as usize;
        let mut seg_buf = vec![0u8; seg_len];
        let mut current_seg: Option<u32> = None;
        let mut seg_dirty = false;
        let mut last_seq = meta.next_seq.saturating_sub(1);

        for i in skip..count {
            let seq = first_seq + i;
            let seg_idx = meta.head / meta.records_per_segment;
            let offset = (meta.head % meta.records_per_segment) as usize * record_size;

            if current_seg != Some(seg_idx) {
                if let (Some(prev), true) = (current_seg, seg_dirty) {
                    self.store.set_blob(&segment_key(prev), &seg_buf)?;
                    seg_dirty = false;
                }
                current_seg = Some(seg_idx);
                match self.store.get_blob(&segment_key(seg_idx))? {
                    Some(existing) if existing.len() == seg_len => {
                        seg_buf.copy_from_slice(&existing)
                    }
                    _ => seg_buf.fill(0),
                }
            }

            seg_buf[offset..offset + 4].copy_from_slice(&adjusted_ts_ms[i as usize].to_le_bytes());
            let src = (i * meta.payload_size) as usize;
            seg_buf[offset + 4..offset + record_size]
                .copy_from_slice(&payloads[src..src + meta.payload_size as usize]);
            seg_dirty = true;

            meta.head = (meta.head + 1) % meta.max_entries;
            if meta.count < effective_max {
                meta.count += 1;
            } else {
                meta.drops += 1;
            }
            meta.next_seq = seq.wrapping_add(1);
            last_seq = seq;
        }

        if let (Some(seg_idx), true) = (current_seg, seg_dirty) {
            self.store.set_blob(&segment_key(seg_idx), &seg_buf)?;
        }
        // Metadata goes last: a crash before this point leaves the
        // pre-batch state fully intact.
        self.save_meta(&meta)?;
        inner.meta = Some(meta);
        Ok(last_seq)
    }

    /// Replay records newer than the import watermark into a RAM ring,
    /// oldest first, capped by the destination capacity and
    /// `import_max_entries` (0 = no extra cap).
    ///
    /// Yields to the scheduler every few hundred records so a long replay
    /// does not starve the event loop. Returns the store's next sequence
    /// number so the caller can align its sample counter.
    pub async fn import_to(
        &self,
        dest: &RingBuffer,
        import_max_entries: u32,
    ) -> DevmanResult<u32> {
        // Snapshot under the lock; segment reads happen without it.
        let (meta, namespace) = {
            let inner = self.lock();
            let Some(meta) = inner.meta else {
                return Err(DevmanError::invalid_config("persistent ring not configured"));
            };
            (meta, inner.namespace.clone())
        };
        let next_seq = meta.next_seq;
        if meta.count == 0 {
            return Ok(next_seq);
        }

        let first_in_store = meta.first_seq();
        let start_seq = (meta.import_seq.wrapping_add(1)).max(first_in_store);
        if start_seq >= next_seq {
            return Ok(next_seq);
        }

        let mut cap = dest.max_entries();
        if import_max_entries > 0 && import_max_entries < cap {
            cap = import_max_entries;
        }
        if cap == 0 {
            return Ok(next_seq);
        }
        let available = next_seq - start_seq;
        let import_count = available.min(cap);

        let record_size = meta.record_size as usize;
        let seg_len = (meta.records_per_segment * meta.record_size) as usize;
        let mut seg_buf = vec![0u8; seg_len];
        let mut current_seg: Option<u32> = None;
        let start_idx = (meta.tail() + (start_seq - first_in_store)) % meta.max_entries;

        for i in 0..import_count {
            let record_idx = (start_idx + i) % meta.max_entries;
            let seg_idx = record_idx / meta.records_per_segment;
            let offset = (record_idx % meta.records_per_segment) as usize * record_size;

            if current_seg != Some(seg_idx) {
                let blob = self.store.get_blob(&segment_key(seg_idx))?.ok_or_else(|| {
                    DevmanError::SchemaMismatch(format!(
                        "segment {} missing in namespace {}",
                        seg_idx, namespace
                    ))
                })?;
                if blob.len() != seg_len {
                    return Err(DevmanError::SchemaMismatch(format!(
                        "segment {} length {} (expected {})",
                        seg_idx,
                        blob.len(),
                        seg_len
                    )));
                }
                seg_buf.copy_from_slice(&blob);
                current_seg = Some(seg_idx);
            }

            let record = &seg_buf[offset..offset + record_size];
            let adj_ts_ms = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
            dest.put(
                adj_ts_ms as u64 * 1000,
                start_seq + i,
                &record[4..],
            )?;

            if i > 0 && i % IMPORT_YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }

        // Merge only the watermark back: appends may have advanced the rest
        // of the metadata while segment reads were in flight.
        let import_seq = start_seq + import_count - 1;
        let merged = {
            let mut inner = self.lock();
            let Some(mut current) = inner.meta else {
                return Err(DevmanError::invalid_config("persistent ring not configured"));
            };
            current.import_seq = import_seq;
            inner.meta = Some(current);
            current
        };
        self.save_meta(&merged)?;
        debug!(
            namespace = %namespace,
            imported = import_count,
            import_seq,
            "replayed persisted samples into RAM ring"
        );
        Ok(merged.next_seq)
    }

    /// Erase everything in the namespace and invalidate the metadata.
    pub fn clear(&self) -> DevmanResult<()> {
        self.store.erase_all()?;
        self.store.commit()?;
        self.lock().meta = None;
        Ok(())
    }
}
