//! Concurrent key-offset index: a file-backed, bucketed hash table
//! mapping 32-byte keys to 64-bit values (spec.md §4.1).
//!
//! The table is partitioned into a fixed number of buckets selected by
//! a hash of the key (power-of-two modulus, per spec.md §4.1: "a
//! fixed-size array of bucket mutexes selected by key hash"). Each
//! bucket is itself a small open-addressing table (linear probing, no
//! tombstones — the store never deletes a key). Collision resolution
//! never crosses a bucket boundary, so a single `Mutex` per bucket is
//! sufficient to make `find`/`insert_lock` safe: two keys hashing to
//! different buckets touch disjoint byte ranges of the backing mmap.

use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::hash::Hasher;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use memmap2::MmapMut;
use siphasher::sip::SipHasher13;

use crate::error::{Result, StoreError};
use crate::key::{Key, KEY_SIZE};

const MAGIC: u64 = 0x424c_4f42_4958_4432; // "BLOBIX2" truncated, arbitrary

// Header layout, little-endian:
// [0..8)   magic
// [8..16)  n_partitions
// [16..24) partition_capacity
// [24..32) count (best-effort persisted, not authoritative)
const HEADER_SIZE: usize = 64;
const OFF_MAGIC: usize = 0;
const OFF_PARTITIONS: usize = 8;
const OFF_PART_CAP: usize = 16;
const OFF_COUNT: usize = 24;

// key(32) + value(8, LE) + state(1): 0 = empty, 1 = occupied.
const SLOT_SIZE: usize = KEY_SIZE + 8 + 1;
const STATE_EMPTY: u8 = 0;
const STATE_OCCUPIED: u8 = 1;

/// Default total slot capacity for a freshly created index.
pub const DEFAULT_CAPACITY: u64 = 1 << 20;
/// Default number of lock-partitions (also the bucket count).
pub const DEFAULT_PARTITIONS: u64 = 4096;

pub struct Index {
    mmap: UnsafeCell<MmapMut>,
    _file: File,
    n_partitions: u64,
    partition_capacity: u64,
    locks: Vec<Mutex<()>>,
    count: AtomicU64,
}

// SAFETY: all mutation of `mmap` happens either (a) at construction,
// before the Index is shared, or (b) under the per-partition `Mutex`
// that owns the byte range being touched. Disjoint partitions never
// alias, so concurrent access from multiple threads is sound.
unsafe impl Sync for Index {}
unsafe impl Send for Index {}

impl Index {
    pub fn open<P: AsRef<Path>>(path: P, capacity: u64, n_partitions: u64) -> Result<Self> {
        let path = path.as_ref();
        let n_partitions = n_partitions.next_power_of_two().max(1);
        let partition_capacity = (capacity / n_partitions).max(1).next_power_of_two();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let required_len = HEADER_SIZE as u64 + n_partitions * partition_capacity * SLOT_SIZE as u64;
        let existing_len = file.metadata()?.len();

        if existing_len < required_len {
            file.set_len(required_len)?;
        }

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        let existing_magic = u64::from_le_bytes(mmap[OFF_MAGIC..OFF_MAGIC + 8].try_into().unwrap());

        let (n_partitions, partition_capacity, count) = if existing_magic == MAGIC {
            let p = u64::from_le_bytes(mmap[OFF_PARTITIONS..OFF_PARTITIONS + 8].try_into().unwrap());
            let c = u64::from_le_bytes(mmap[OFF_PART_CAP..OFF_PART_CAP + 8].try_into().unwrap());
            let n = u64::from_le_bytes(mmap[OFF_COUNT..OFF_COUNT + 8].try_into().unwrap());
            if existing_len < HEADER_SIZE as u64 + p * c * SLOT_SIZE as u64 {
                return Err(StoreError::Corrupt(format!(
                    "index file {:?} shorter than its own header declares",
                    path
                )));
            }
            (p, c, n)
        } else if existing_len == 0 || existing_len == required_len {
            mmap[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(&MAGIC.to_le_bytes());
            mmap[OFF_PARTITIONS..OFF_PARTITIONS + 8].copy_from_slice(&n_partitions.to_le_bytes());
            mmap[OFF_PART_CAP..OFF_PART_CAP + 8].copy_from_slice(&partition_capacity.to_le_bytes());
            mmap[OFF_COUNT..OFF_COUNT + 8].copy_from_slice(&0u64.to_le_bytes());
            (n_partitions, partition_capacity, 0)
        } else {
            return Err(StoreError::Corrupt(format!(
                "index file {:?} has an unrecognised header",
                path
            )));
        };

        let locks = (0..n_partitions).map(|_| Mutex::new(())).collect();

        Ok(Self {
            mmap: UnsafeCell::new(mmap),
            _file: file,
            n_partitions,
            partition_capacity,
            locks,
            count: AtomicU64::new(count),
        })
    }

    fn hash_key(key: &Key) -> u64 {
        // Keys are content-derived digests (spec.md §3): the low 64
        // bits double as a seed for a cheap SipHash pass over the
        // rest, which spreads bucket/slot selection evenly even if a
        // caller's digest scheme has low entropy in its low bits.
        let seed = key.hash64();
        let mut hasher = SipHasher13::new_with_keys(seed, 0);
        hasher.write(key.as_ref());
        hasher.finish()
    }

    fn partition_and_home(&self, key: &Key) -> (usize, usize) {
        let h = Self::hash_key(key);
        let partition = (h & (self.n_partitions - 1)) as usize;
        let home = ((h >> 32) & (self.partition_capacity - 1)) as usize;
        (partition, home)
    }

    #[inline]
    fn slot_index(&self, partition: usize, local: usize) -> u64 {
        partition as u64 * self.partition_capacity + local as u64
    }

    #[inline]
    fn slot_offset(&self, slot_idx: u64) -> usize {
        HEADER_SIZE + slot_idx as usize * SLOT_SIZE
    }

    /// SAFETY: caller holds the partition lock covering `slot_idx`.
    unsafe fn read_slot(&self, slot_idx: u64) -> ([u8; KEY_SIZE], u64, u8) {
        let mmap = &*self.mmap.get();
        let off = self.slot_offset(slot_idx);
        let b = &mmap[off..off + SLOT_SIZE];
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&b[0..KEY_SIZE]);
        let value = u64::from_le_bytes(b[KEY_SIZE..KEY_SIZE + 8].try_into().unwrap());
        let state = b[KEY_SIZE + 8];
        (key, value, state)
    }

    /// SAFETY: caller holds the partition lock covering `slot_idx`.
    unsafe fn write_slot(&self, slot_idx: u64, key: &[u8; KEY_SIZE], value: u64, state: u8) {
        let mmap = &mut *self.mmap.get();
        let off = self.slot_offset(slot_idx);
        let b = &mut mmap[off..off + SLOT_SIZE];
        b[0..KEY_SIZE].copy_from_slice(key);
        b[KEY_SIZE..KEY_SIZE + 8].copy_from_slice(&value.to_le_bytes());
        b[KEY_SIZE + 8] = state;
    }

    /// SAFETY: caller holds the partition lock covering `slot_idx`.
    unsafe fn write_value(&self, slot_idx: u64, value: u64) {
        let mmap = &mut *self.mmap.get();
        let off = self.slot_offset(slot_idx) + KEY_SIZE;
        mmap[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Look up `key`, returning a lock-scoped handle to its value cell
    /// if present. `None` if the key has never been inserted.
    pub fn find(&self, key: &Key) -> Option<IndexGuard<'_>> {
        let (partition, home) = self.partition_and_home(key);
        let guard = self.locks[partition].lock().unwrap();

        for step in 0..self.partition_capacity {
            let local = (home + step as usize) % self.partition_capacity as usize;
            let slot_idx = self.slot_index(partition, local);
            // SAFETY: partition lock held.
            let (slot_key, _value, state) = unsafe { self.read_slot(slot_idx) };
            match state {
                STATE_EMPTY => return None,
                STATE_OCCUPIED if slot_key == key.0 => {
                    return Some(IndexGuard {
                        _lock: guard,
                        index: self,
                        slot_idx,
                    });
                }
                _ => continue,
            }
        }
        None
    }

    /// Atomically find-or-insert. Returns the value cell (held under
    /// its bucket lock) and whether the key already existed.
    pub fn insert_lock(&self, key: &Key, default_value: u64) -> Result<(IndexGuard<'_>, bool)> {
        let (partition, home) = self.partition_and_home(key);
        let guard = self.locks[partition].lock().unwrap();

        for step in 0..self.partition_capacity {
            let local = (home + step as usize) % self.partition_capacity as usize;
            let slot_idx = self.slot_index(partition, local);
            // SAFETY: partition lock held.
            let (slot_key, _value, state) = unsafe { self.read_slot(slot_idx) };

            match state {
                STATE_EMPTY => {
                    unsafe { self.write_slot(slot_idx, &key.0, default_value, STATE_OCCUPIED) };
                    self.count.fetch_add(1, Ordering::Relaxed);
                    return Ok((
                        IndexGuard {
                            _lock: guard,
                            index: self,
                            slot_idx,
                        },
                        false,
                    ));
                }
                STATE_OCCUPIED if slot_key == key.0 => {
                    return Ok((
                        IndexGuard {
                            _lock: guard,
                            index: self,
                            slot_idx,
                        },
                        true,
                    ));
                }
                _ => continue,
            }
        }

        Err(StoreError::Corrupt(format!(
            "index bucket {} is full (capacity {} slots); increase capacity at creation time",
            partition, self.partition_capacity
        )))
    }

    pub fn flush(&self) -> Result<()> {
        // SAFETY: no partition lock is held by the flusher; the count
        // field lives outside the slot array, and a racing insert can
        // only ever move `count` forward, so a stale read here is a
        // benign, accepted-as-stale statistic (spec.md §3).
        let count = self.count.load(Ordering::Relaxed);
        unsafe {
            let mmap = &mut *self.mmap.get();
            mmap[OFF_COUNT..OFF_COUNT + 8].copy_from_slice(&count.to_le_bytes());
        }
        let mmap = unsafe { &*self.mmap.get() };
        mmap.flush().map_err(StoreError::IoFailure)
    }

    pub fn len(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// A lock-scoped handle to one index slot's value cell. The bucket
/// mutex is released when this is dropped (spec.md §4.1).
pub struct IndexGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    index: &'a Index,
    slot_idx: u64,
}

impl<'a> IndexGuard<'a> {
    pub fn value(&self) -> u64 {
        // SAFETY: the bucket lock backing this guard is still held.
        unsafe { self.index.read_slot(self.slot_idx).1 }
    }

    pub fn set_value(&mut self, value: u64) {
        // SAFETY: the bucket lock backing this guard is still held.
        unsafe { self.index.write_value(self.slot_idx, value) }
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
    fn find_missing_is_none() {
        let dir = tempdir().unwrap();
        let idx = Index::open(dir.path().join("index.db"), 1024, 16).unwrap();
        assert!(idx.find(&key_of(1)).is_none());
    }

    #[test]
    fn insert_then_find() {
        let dir = tempdir().unwrap();
        let idx = Index::open(dir.path().join("index.db"), 1024, 16).unwrap();

        let (mut guard, existed) = idx.insert_lock(&key_of(1), 0).unwrap();
        assert!(!existed);
        guard.set_value(42);
        drop(guard);

        let found = idx.find(&key_of(1)).unwrap();
        assert_eq!(found.value(), 42);
    }

    #[test]
    fn reinsert_reports_existed() {
        let dir = tempdir().unwrap();
        let idx = Index::open(dir.path().join("index.db"), 1024, 16).unwrap();

        let (mut guard, _) = idx.insert_lock(&key_of(5), 0).unwrap();
        guard.set_value(99);
        drop(guard);

        let (guard, existed) = idx.insert_lock(&key_of(5), 0).unwrap();
        assert!(existed);
        assert_eq!(guard.value(), 99);
    }

    #[test]
    fn zero_key_is_not_special() {
        let dir = tempdir().unwrap();
        let idx = Index::open(dir.path().join("index.db"), 1024, 16).unwrap();
        let zero = key_of(0);

        let (mut guard, existed) = idx.insert_lock(&zero, 0).unwrap();
        assert!(!existed);
        guard.set_value(7);
        drop(guard);

        assert_eq!(idx.find(&zero).unwrap().value(), 7);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.db");
        {
            let idx = Index::open(&path, 1024, 16).unwrap();
            let (mut guard, _) = idx.insert_lock(&key_of(9), 0).unwrap();
            guard.set_value(123);
            drop(guard);
            idx.flush().unwrap();
        }
        {
            let idx = Index::open(&path, 1024, 16).unwrap();
            assert_eq!(idx.find(&key_of(9)).unwrap().value(), 123);
            assert_eq!(idx.len(), 1);
        }
    }

    #[test]
    fn many_keys_in_same_bucket_do_not_collide() {
        let dir = tempdir().unwrap();
        // small partition count forces overlaps into a bucket.
        let idx = Index::open(dir.path().join("index.db"), 256, 2).unwrap();

        for i in 0..100u8 {
            let mut bytes = [0u8; 32];
            bytes[0] = i;
            let key = Key(bytes);
            let (mut guard, existed) = idx.insert_lock(&key, 0).unwrap();
            assert!(!existed);
            guard.set_value(i as u64 + 1);
        }

        for i in 0..100u8 {
            let mut bytes = [0u8; 32];
            bytes[0] = i;
            let key = Key(bytes);
            assert_eq!(idx.find(&key).unwrap().value(), i as u64 + 1);
        }
    }
}
