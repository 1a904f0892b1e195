//! The client-side existence cache (spec.md §4.6, §9: "modelled as a
//! concurrent set backed by the same index primitive; treat insertion
//! and membership as the only operations").

use std::path::Path;

use crate::error::Result;
use crate::index::Index;
use crate::key::Key;

const DEFAULT_CAPACITY: u64 = 1 << 16;
const DEFAULT_PARTITIONS: u64 = 256;

/// An additive-only set of observed keys. Never evicts (spec.md's
/// Non-goals: "no eviction from the client cache").
pub struct ExistenceCache {
    index: Index,
}

impl ExistenceCache {
    /// In-memory-backed cache, scoped to one process.
    pub fn in_memory() -> Result<Self> {
        Self::open_tmp()
    }

    fn open_tmp() -> Result<Self> {
        let path = std::env::temp_dir().join(format!("blobstore-cache-{}.db", std::process::id()));
        Self::open(path)
    }

    /// Persistent, file-backed cache so it can be shared across
    /// sessions (and, via the file's own locking, across clients).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            index: Index::open(path, DEFAULT_CAPACITY, DEFAULT_PARTITIONS)?,
        })
    }

    pub fn contains(&self, key: &Key) -> bool {
        matches!(self.index.find(key), Some(guard) if guard.value() != 0)
    }

    /// Records that `key` is known to exist on the server. Idempotent.
    pub fn insert(&self, key: &Key) {
        if let Ok((mut guard, _existed)) = self.index.insert_lock(key, 1) {
            guard.set_value(1);
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.index.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key_of(byte: u8) -> Key {
        Key([byte; 32])
    }

    #[test]
    fn empty_cache_reports_miss() {
        let dir = tempdir().unwrap();
        let cache = ExistenceCache::open(dir.path().join("cache.db")).unwrap();
        assert!(!cache.contains(&key_of(1)));
    }

    #[test]
    fn insert_then_contains() {
        let dir = tempdir().unwrap();
        let cache = ExistenceCache::open(dir.path().join("cache.db")).unwrap();
        let key = key_of(2);
        cache.insert(&key);
        assert!(cache.contains(&key));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let key = key_of(3);
        {
            let cache = ExistenceCache::open(&path).unwrap();
            cache.insert(&key);
            cache.flush().unwrap();
        }
        {
            let cache = ExistenceCache::open(&path).unwrap();
            assert!(cache.contains(&key));
        }
    }
}
