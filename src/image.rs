//! The block store engine: composes the [`Index`] and [`DataFile`]
//! into `Write`/`Allocate`/`Read`/`Map`/`Is`/`Many`/`Validate`/
//! `Enumerate`, a background flusher, and a cross-process lock-file
//! guard (spec.md §4.3).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};

use crate::datafile::DataFile;
use crate::digest::Digest;
use crate::error::{Result, StoreError};
use crate::index::{Index, DEFAULT_CAPACITY, DEFAULT_PARTITIONS};
use crate::key::Key;
use crate::limits::{MAX_BLOCK_SIZE, MAX_MANY_KEYS, MAX_SANE_BLOCK_SIZE};
use crate::stats::{StatsSnapshot, Statistics};

const LOCK_FILE: &str = "lock.db";
const INDEX_FILE: &str = "index.db";
const DATA_FILE: &str = "image.dat";

/// Tuning knobs for [`Image::open_with`]. `Default` matches
/// `Image::open`'s behaviour.
#[derive(Clone, Copy, Debug)]
pub struct ImageOptions {
    pub index_capacity: u64,
    pub index_partitions: u64,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            index_capacity: DEFAULT_CAPACITY,
            index_partitions: DEFAULT_PARTITIONS,
        }
    }
}

pub struct Image {
    index: Arc<Index>,
    data: Arc<DataFile>,
    stats: Arc<Statistics>,
    lock_path: PathBuf,
    running: Arc<AtomicBool>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Image {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Arc<Self>> {
        Self::open_with(root, ImageOptions::default())
    }

    pub fn open_with<P: AsRef<Path>>(root: P, opts: ImageOptions) -> Result<Arc<Self>> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;

        let lock_path = root.join(LOCK_FILE);
        if lock_path.exists() {
            return Err(StoreError::StartupLocked(lock_path));
        }

        let index = Arc::new(Index::open(
            root.join(INDEX_FILE),
            opts.index_capacity,
            opts.index_partitions,
        )?);
        let data = Arc::new(DataFile::open(root.join(DATA_FILE))?);

        // Create the lock file only after both backing files opened
        // cleanly, so a failed open never leaves a stray lock behind.
        std::fs::File::create(&lock_path)?;

        let stats = Arc::new(Statistics::default());
        let running = Arc::new(AtomicBool::new(true));

        let flusher = spawn_flusher(index.clone(), data.clone(), running.clone());

        info!("image opened at {:?}", root);

        Ok(Arc::new(Self {
            index,
            data,
            stats,
            lock_path,
            running,
            flusher: Mutex::new(Some(flusher)),
        }))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// `true` iff `key` is present and published (spec.md §4.3).
    pub fn is(&self, key: &Key) -> bool {
        self.stats.record_query();
        match self.index.find(key) {
            Some(guard) => guard.value() != 0,
            None => false,
        }
    }

    /// Bit `i` set iff `is(keys[i])`. Rejects more than 64 keys.
    pub fn many(&self, keys: &[Key]) -> Result<u64> {
        if keys.len() > MAX_MANY_KEYS {
            return Err(StoreError::OverLimit(format!(
                "many() called with {} keys, max is {}",
                keys.len(),
                MAX_MANY_KEYS
            )));
        }

        self.stats.record_queries(keys.len() as u64);

        let mut bitmap: u64 = 0;
        for (i, key) in keys.iter().enumerate() {
            let found = match self.index.find(key) {
                Some(guard) => guard.value() != 0,
                None => false,
            };
            if found {
                bitmap |= 1 << i;
            }
        }
        Ok(bitmap)
    }

    /// Zero-copy view of a block's payload, directly into the mapped
    /// data file. Empty if missing or not yet published.
    pub fn map(&self, key: &Key) -> Result<Option<crate::datafile::Span>> {
        let offset = match self.index.find(key) {
            Some(guard) => guard.value(),
            None => return Ok(None),
        };

        if offset == 0 {
            // Reserved but not yet published (spec.md invariant 2).
            return Ok(None);
        }

        let span = self.data.payload_at(offset)?;
        if let Some(ref span) = span {
            Self::check_sane_size(span.len() as u64)?;
            self.stats.record_read(span.len() as u64);
        }
        Ok(span)
    }

    /// Owned copy of a block's payload.
    pub fn read(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        Ok(self.map(key)?.map(|span| span.to_vec()))
    }

    /// The concurrency-critical primitive (spec.md §4.3).
    ///
    /// Returns `None` if the key is a duplicate of an already
    /// published block, or if the data file couldn't grow to fit the
    /// request — both are benign per spec.md §4.3 step 2-3.
    pub fn allocate(&self, key: &Key, size: u64) -> Result<Option<crate::datafile::SpanMut>> {
        if size > MAX_BLOCK_SIZE {
            return Err(StoreError::OverLimit(format!(
                "block of {} bytes exceeds the {} byte cap",
                size, MAX_BLOCK_SIZE
            )));
        }

        self.stats.record_write(size);

        let (mut guard, existed) = self.index.insert_lock(key, 0)?;

        if existed && guard.value() != 0 {
            // Duplicate block insert: the client skipped its local
            // existence cache. Not an error — silently drop.
            debug!("duplicate write for key {}", key);
            return Ok(None);
        }

        // Between here and the `set_value` below, any concurrent
        // reader sees value == 0 and reports a miss. That's the race
        // spec.md §4.3 calls out as benign: 0 always means
        // "not yet available".
        let (span, offset) = self.data.allocate(size + 4)?;
        let mut span = span;
        DataFile::write_size_prefix(&mut span, size as u32);
        guard.set_value(offset);

        Ok(Some(span))
    }

    /// `allocate` + copy; silently drops on duplicate or
    /// out-of-space, matching spec.md §4.3.
    pub fn write(&self, key: &Key, payload: &[u8]) -> Result<()> {
        let span = match self.allocate(key, payload.len() as u64)? {
            Some(span) => span,
            None => return Ok(()),
        };

        let mut span = span;
        span.payload_mut().copy_from_slice(payload);
        let payload_offset = span.payload_offset();
        drop(span);

        // Best-effort durability for the region just written (spec.md
        // §4.3); the periodic flusher thread still covers everything
        // else, and a successful write is visible to readers
        // immediately via the index regardless of when it hits disk.
        if let Err(err) = self.data.flush_range(payload_offset, payload.len()) {
            warn!("write: flush_range failed for key {}: {}", key, err);
        }

        Ok(())
    }

    /// Verifies `key` is the digest of its own payload using digest
    /// scheme `D` (spec.md §9: the exact hash is a caller choice).
    pub fn validate_standard<D: Digest>(&self, key: &Key) -> Result<bool> {
        match self.read(key)? {
            Some(payload) => Ok(D::verify(key, &payload)),
            None => Ok(false),
        }
    }

    /// Runs a caller-supplied predicate over the payload bytes.
    pub fn validate<V: FnOnce(&[u8]) -> bool>(&self, key: &Key, v: V) -> Result<bool> {
        match self.read(key)? {
            Some(payload) => Ok(v(&payload)),
            None => Ok(false),
        }
    }

    /// Zero-copy scan from `start_offset`; `f` gets each payload span
    /// in write order. Returns the resumable next offset.
    pub fn enumerate_map<F: FnMut(&[u8]) -> bool>(&self, start_offset: u64, f: F) -> Result<u64> {
        self.data.enumerate_map(start_offset, f)
    }

    /// Owned-copy scan, layered over `enumerate_map`.
    pub fn enumerate<F: FnMut(Vec<u8>) -> bool>(
        &self,
        start_offset: u64,
        mut f: F,
    ) -> Result<u64> {
        self.enumerate_map(start_offset, |span| f(span.to_vec()))
    }

    /// Sanity-checks a size prefix read off the wire/disk against the
    /// "plainly invalid" bound from spec.md §7 (distinct from the
    /// 8 MiB write cap: a pre-existing, already-published block is
    /// allowed to be read even if outside normal write limits, up to
    /// this much larger bound, past which it's treated as corruption).
    pub fn check_sane_size(size: u64) -> Result<()> {
        if size > MAX_SANE_BLOCK_SIZE {
            return Err(StoreError::Corrupt(format!(
                "block size {} exceeds sane bound {}",
                size, MAX_SANE_BLOCK_SIZE
            )));
        }
        Ok(())
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.flusher.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Err(err) = self.index.flush() {
            warn!("index flush on close failed: {}", err);
        }
        if let Err(err) = self.data.flush() {
            warn!("data file flush on close failed: {}", err);
        }
        if let Err(err) = std::fs::remove_file(&self.lock_path) {
            warn!("failed to remove lock file {:?}: {}", self.lock_path, err);
        }
    }
}

fn spawn_flusher(index: Arc<Index>, data: Arc<DataFile>, running: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut counter: u64 = 0;
        while running.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(1000));
            if !running.load(Ordering::Acquire) {
                break;
            }
            if counter % 10 == 0 {
                if let Err(err) = index.flush() {
                    warn!("index flush failed: {}", err);
                }
                if let Err(err) = data.flush() {
                    warn!("data file flush failed: {}", err);
                }
            }
            counter = counter.wrapping_add(1);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Sha256Digest;
    use tempfile::tempdir;

    fn key_of(byte: u8) -> Key {
        Key([byte; 32])
    }

    #[test]
    fn s1_write_then_read() {
        let dir = tempdir().unwrap();
        let image = Image::open(dir.path()).unwrap();

        let key = Key([0u8; 32]);
        image.write(&key, b"hello").unwrap();

        assert!(image.is(&key));
        assert_eq!(image.read(&key).unwrap().unwrap(), b"hello");
    }

    #[test]
    fn s2_duplicate_write_is_idempotent() {
        let dir = tempdir().unwrap();
        let image = Image::open(dir.path()).unwrap();

        let key = key_of(1);
        image.write(&key, b"hello").unwrap();
        image.write(&key, b"world").unwrap();

        assert_eq!(image.read(&key).unwrap().unwrap(), b"hello");
    }

    #[test]
    fn is_false_before_write() {
        let dir = tempdir().unwrap();
        let image = Image::open(dir.path()).unwrap();
        assert!(!image.is(&key_of(2)));
        assert!(image.read(&key_of(2)).unwrap().is_none());
    }

    #[test]
    fn s5_many_reports_each_key() {
        let dir = tempdir().unwrap();
        let image = Image::open(dir.path()).unwrap();

        let mut keys = Vec::new();
        for i in 0..64u8 {
            let mut bytes = [0u8; 32];
            bytes[0] = i;
            bytes[1] = 0xAA; // disambiguate from other tests' keys
            keys.push(Key(bytes));
        }
        for key in &keys[..10] {
            image.write(key, b"x").unwrap();
        }

        let bitmap = image.many(&keys).unwrap();
        assert_eq!(bitmap, (1u64 << 10) - 1);
    }

    #[test]
    fn many_rejects_over_64() {
        let dir = tempdir().unwrap();
        let image = Image::open(dir.path()).unwrap();
        let keys: Vec<Key> = (0..65u8)
            .map(|i| {
                let mut b = [0u8; 32];
                b[0] = i;
                Key(b)
            })
            .collect();
        assert!(image.many(&keys).is_err());
    }

    #[test]
    fn write_rejects_oversized_block() {
        let dir = tempdir().unwrap();
        let image = Image::open(dir.path()).unwrap();
        let big = vec![0u8; (MAX_BLOCK_SIZE + 1) as usize];
        assert!(image.write(&key_of(3), &big).is_err());
    }

    #[test]
    fn validate_standard_checks_digest() {
        use sha2::{Digest as _, Sha256};

        let dir = tempdir().unwrap();
        let image = Image::open(dir.path()).unwrap();

        let payload = b"content";
        let mut hasher = Sha256::new();
        hasher.update(payload);
        let digest: [u8; 32] = hasher.finalize().into();
        let key = Key(digest);

        image.write(&key, payload).unwrap();
        assert!(image.validate_standard::<Sha256Digest>(&key).unwrap());
        assert!(!image
            .validate_standard::<Sha256Digest>(&key_of(99))
            .unwrap());
    }

    #[test]
    fn s6_lock_file_blocks_second_open() {
        let dir = tempdir().unwrap();
        let image = Image::open(dir.path()).unwrap();

        let err = Image::open(dir.path()).unwrap_err();
        assert!(matches!(err, StoreError::StartupLocked(_)));

        drop(image);
        // Clean shutdown removed lock.db; a fresh open now succeeds.
        let reopened = Image::open(dir.path()).unwrap();
        drop(reopened);
    }

    #[test]
    fn s8_concurrent_writers_all_readable() {
        use std::thread;

        let dir = tempdir().unwrap();
        let image = Image::open(dir.path()).unwrap();

        let threads = 8;
        let per_thread = 50;

        thread::scope(|scope| {
            for t in 0..threads {
                let image = &image;
                scope.spawn(move || {
                    for n in 0..per_thread {
                        let mut bytes = [0u8; 32];
                        bytes[0] = t as u8;
                        bytes[1..5].copy_from_slice(&(n as u32).to_le_bytes());
                        let key = Key(bytes);
                        let payload = format!("t{}-n{}", t, n).into_bytes();
                        image.write(&key, &payload).unwrap();
                    }
                });
            }
        });

        let mut found = 0;
        for t in 0..threads {
            for n in 0..per_thread {
                let mut bytes = [0u8; 32];
                bytes[0] = t as u8;
                bytes[1..5].copy_from_slice(&(n as u32).to_le_bytes());
                let key = Key(bytes);
                let expected = format!("t{}-n{}", t, n).into_bytes();
                assert_eq!(image.read(&key).unwrap().unwrap(), expected);
                found += 1;
            }
        }
        assert_eq!(found, threads * per_thread);
    }

    #[test]
    fn s4_crossing_book_boundaries() {
        let dir = tempdir().unwrap();
        let image = Image::open(dir.path()).unwrap();

        let block = vec![0xABu8; 200 * 1024 * 1024];
        let mut keys = Vec::new();
        for i in 0..3u8 {
            let mut bytes = [0u8; 32];
            bytes[0] = i;
            bytes[1] = 0xFE;
            let key = Key(bytes);
            image.write(&key, &block).unwrap();
            keys.push(key);
        }

        for key in &keys {
            let read_back = image.read(key).unwrap().unwrap();
            assert_eq!(read_back.len(), block.len());
        }

        let mut count = 0;
        image
            .enumerate(0, |payload| {
                assert_eq!(payload.len(), block.len());
                count += 1;
                true
            })
            .unwrap();
        assert_eq!(count, 3);
    }
}
