//! Key-value blob substrate for the persistent ring.
//!
//! Modelled on flash KV stores found on gateway hardware: flat string keys,
//! opaque blob values, each `set_blob`+`commit` pair atomic on its own. Two
//! implementations:
//!
//! - [`MemKvStore`] - in-memory, for tests and diskless configurations.
//! - [`FileKvStore`] - one file per key in a directory, writes going through
//!   a temp file + rename so a crash never exposes a torn blob.

use devman_core::{DevmanError, DevmanResult};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Blob store with per-call atomicity.
///
/// Keys are short flat names (`meta`, `s00042`); implementations may reject
/// keys containing path separators.
pub trait KvStore: Send + Sync {
    /// Read a blob. `Ok(None)` when the key does not exist.
    fn get_blob(&self, key: &str) -> DevmanResult<Option<Vec<u8>>>;

    /// Write a blob, replacing any existing value.
    fn set_blob(&self, key: &str, value: &[u8]) -> DevmanResult<()>;

    /// Remove every key in the store.
    fn erase_all(&self) -> DevmanResult<()>;

    /// Make prior writes durable.
    fn commit(&self) -> DevmanResult<()>;
}

// =============================================================================
// In-memory store
// =============================================================================

/// In-memory [`KvStore`]; contents die with the process.
#[derive(Default)]
pub struct MemKvStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemKvStore {
    fn get_blob(&self, key: &str) -> DevmanResult<Option<Vec<u8>>> {
        Ok(self
            .blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set_blob(&self, key: &str, value: &[u8]) -> DevmanResult<()> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn erase_all(&self) -> DevmanResult<()> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    fn commit(&self) -> DevmanResult<()> {
        Ok(())
    }
}

// =============================================================================
// File-backed store
// =============================================================================

/// Directory-backed [`KvStore`], one file per key.
///
/// `set_blob` writes the value to `<key>.tmp` and renames it over `<key>`,
/// so readers (including a post-crash restart) see either the old or the
/// new blob, never a partial write.
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    /// Open (creating if necessary) the store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> DevmanResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| DevmanError::PersistenceIo {
            key: dir.display().to_string(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key: &str) -> DevmanResult<PathBuf> {
        if key.is_empty()
            || key.contains(['/', '\\'])
            || key.starts_with('.')
        {
            return Err(DevmanError::invalid_config(format!("kv key '{}'", key)));
        }
        Ok(self.dir.join(key))
    }
}

impl KvStore for FileKvStore {
    fn get_blob(&self, key: &str) -> DevmanResult<Option<Vec<u8>>> {
        let path = self.key_path(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(DevmanError::PersistenceIo {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn set_blob(&self, key: &str, value: &[u8]) -> DevmanResult<()> {
        let path = self.key_path(key)?;
        let tmp = self.dir.join(format!("{}.tmp", key));
        let io_err = |source| DevmanError::PersistenceIo {
            key: key.to_string(),
            source,
        };
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(value).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)
    }

    fn erase_all(&self) -> DevmanResult<()> {
        let io_err = |source| DevmanError::PersistenceIo {
            key: self.dir.display().to_string(),
            source,
        };
        for entry in fs::read_dir(&self.dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if entry.path().is_file() {
                fs::remove_file(entry.path()).map_err(io_err)?;
            }
        }
        Ok(())
    }

    fn commit(&self) -> DevmanResult<()> {
        // Individual blob writes are already durable (fsync + rename); sync
        // the directory so renames survive power loss as well.
        if let Ok(dir) = fs::File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_store_roundtrip_and_erase() {
        let kv = MemKvStore::new();
        assert_eq!(kv.get_blob("meta").unwrap(), None);
        kv.set_blob("meta", b"abc").unwrap();
        kv.set_blob("s00000", b"xyz").unwrap();
        kv.commit().unwrap();
        assert_eq!(kv.get_blob("meta").unwrap().as_deref(), Some(&b"abc"[..]));
        assert_eq!(kv.len(), 2);
        kv.erase_all().unwrap();
        assert!(kv.is_empty());
        assert_eq!(kv.get_blob("s00000").unwrap(), None);
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let kv = FileKvStore::open(dir.path().join("dev0")).unwrap();
        kv.set_blob("meta", &[1, 2, 3]).unwrap();
        kv.commit().unwrap();
        assert_eq!(kv.get_blob("meta").unwrap(), Some(vec![1, 2, 3]));
        kv.set_blob("meta", &[9]).unwrap();
        assert_eq!(kv.get_blob("meta").unwrap(), Some(vec![9]));
        assert_eq!(kv.get_blob("s00001").unwrap(), None);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let kv = FileKvStore::open(dir.path()).unwrap();
            kv.set_blob("s00000", b"segment").unwrap();
            kv.commit().unwrap();
        }
        let kv = FileKvStore::open(dir.path()).unwrap();
        assert_eq!(kv.get_blob("s00000").unwrap(), Some(b"segment".to_vec()));
        kv.erase_all().unwrap();
        assert_eq!(kv.get_blob("s00000").unwrap(), None);
    }

    #[test]
    fn test_file_store_rejects_path_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let kv = FileKvStore::open(dir.path()).unwrap();
        assert!(kv.set_blob("../escape", b"x").is_err());
        assert!(kv.set_blob("a/b", b"x").is_err());
        assert!(kv.set_blob("", b"x").is_err());
    }
}
