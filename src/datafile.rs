//! Append-only, memory-mapped data file (spec.md §4.2).
//!
//! The file is conceptually partitioned into fixed-size 256MiB "books"
//! (spec.md GLOSSARY). Allocations never cross a book boundary: if a
//! request doesn't fit in what's left of the current book, the
//! allocator leaves a zero-size alignment gap and starts the next
//! book fresh. The whole file is kept mapped as one growing `MmapMut`;
//! when a write needs bytes beyond the current mapping, the file is
//! extended and remapped. Old mappings are kept alive (via `Arc`) for
//! as long as any `Span`/`SpanMut` still borrows them, matching the
//! "old windows are retained while any span into them is live"
//! requirement from spec.md §5.

use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use memmap2::MmapMut;

use crate::error::{Result, StoreError};

/// Allocation quantum; allocations never span this boundary.
pub const BOOK_SIZE: u64 = 256 * 1024 * 1024;

/// `u32` size prefix + payload, per spec.md §3.
const SIZE_PREFIX: u64 = 4;

/// Reserved leading region of the data file: magic + persisted
/// logical tail (spec.md §9 design note — "reserve offset 0... by
/// either starting the data file with a one-byte padding or by
/// initialising the allocator's tail to a nonzero value"; this takes
/// the second option and additionally persists the tail so a reopen
/// doesn't have to fall back to the file's physical length, which is
/// rounded up far past the real high-water mark by `ensure_mapped`).
/// Sized and laid out the same way as `index.rs`'s own header.
const HEADER_MAGIC: u64 = 0x424c_4f42_4441_5431; // "BLOBDAT1" truncated
const HEADER_SIZE: u64 = 64;
const OFF_MAGIC: usize = 0;
const OFF_TAIL: usize = 8;

struct MappedRegion(UnsafeCell<MmapMut>);

// SAFETY: see `DataFile`'s own safety note — all mutation happens
// either before the region is published into `current`, or into a
// byte range the caller obtained exclusively from `allocate`.
unsafe impl Sync for MappedRegion {}
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    fn len(&self) -> usize {
        unsafe { (*self.0.get()).len() }
    }

    fn as_ptr(&self) -> *const u8 {
        unsafe { (*self.0.get()).as_ptr() }
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        unsafe { (*self.0.get()).as_mut_ptr() }
    }
}

pub struct DataFile {
    file: Mutex<File>,
    current: Mutex<Arc<MappedRegion>>,
    tail: AtomicU64,
}

impl DataFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;

        let existing_len = file.metadata()?.len();
        let initial_len = existing_len.max(HEADER_SIZE);
        if existing_len < initial_len {
            file.set_len(initial_len)?;
        }

        let region = Self::map_at_least(&file, initial_len)?;

        // Offset 0 is the "reserved, unpublished" sentinel (spec.md §3
        // invariant 2): the header reserves the whole leading region,
        // so no legitimate payload is ever placed there, and on reopen
        // the logical tail is read back from it rather than mis-derived
        // from the physical (book-rounded) file length.
        let tail = {
            // SAFETY: these header bytes are touched only here (before
            // the DataFile is shared) and in `persist_tail` (under no
            // lock, but disjoint from every payload region a `Span`
            // could borrow).
            let mmap = unsafe { &mut *region.0.get() };
            let magic = u64::from_le_bytes(mmap[OFF_MAGIC..OFF_MAGIC + 8].try_into().unwrap());
            if magic == HEADER_MAGIC {
                u64::from_le_bytes(mmap[OFF_TAIL..OFF_TAIL + 8].try_into().unwrap()).max(HEADER_SIZE)
            } else if existing_len == 0 {
                mmap[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
                mmap[OFF_TAIL..OFF_TAIL + 8].copy_from_slice(&HEADER_SIZE.to_le_bytes());
                HEADER_SIZE
            } else {
                return Err(StoreError::Corrupt(format!(
                    "data file {:?} has an unrecognised header",
                    path.as_ref()
                )));
            }
        };

        Ok(Self {
            tail: AtomicU64::new(tail),
            file: Mutex::new(file),
            current: Mutex::new(Arc::new(region)),
        })
    }

    fn map_at_least(file: &File, min_len: u64) -> Result<MappedRegion> {
        if file.metadata()?.len() < min_len {
            file.set_len(min_len)?;
        }
        let mmap = unsafe { MmapMut::map_mut(file)? };
        Ok(MappedRegion(UnsafeCell::new(mmap)))
    }

    fn current_region(&self) -> Arc<MappedRegion> {
        self.current.lock().unwrap().clone()
    }

    /// Ensures the live mapping covers at least `min_len` bytes,
    /// growing the underlying file and remapping if necessary.
    fn ensure_mapped(&self, min_len: u64) -> Result<Arc<MappedRegion>> {
        {
            let guard = self.current.lock().unwrap();
            if guard.len() as u64 >= min_len {
                return Ok(guard.clone());
            }
        }

        let file = self.file.lock().unwrap();
        let mut guard = self.current.lock().unwrap();
        if (guard.len() as u64) < min_len {
            // Round up generously so repeated small allocations don't
            // each force a remap.
            let new_len = min_len.max(guard.len() as u64 * 2).max(BOOK_SIZE);
            let region = Self::map_at_least(&file, new_len)?;
            *guard = Arc::new(region);
        }
        Ok(guard.clone())
    }

    /// High-water mark of the logical file length.
    pub fn size(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    /// Reserves `n` contiguous bytes that do not cross a book
    /// boundary, returning a writable span and its logical offset.
    pub fn allocate(&self, n: u64) -> Result<(SpanMut, u64)> {
        loop {
            let cur_tail = self.tail.load(Ordering::Acquire);
            let in_book = cur_tail % BOOK_SIZE;
            let remaining = BOOK_SIZE - in_book;

            if n > remaining {
                // Leave an alignment gap: a zero size-prefix at the
                // current tail, then jump straight to the next book.
                let next_book = cur_tail + remaining;
                if self
                    .tail
                    .compare_exchange(cur_tail, next_book, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    let region = self.ensure_mapped(cur_tail + SIZE_PREFIX)?;
                    let off = cur_tail as usize;
                    // SAFETY: bytes [cur_tail, cur_tail+4) were just
                    // reserved exclusively by the CAS above; no other
                    // allocation can observe or touch them.
                    unsafe {
                        let ptr = region.as_mut_ptr().add(off);
                        std::ptr::write_bytes(ptr, 0, SIZE_PREFIX as usize);
                    }
                }
                continue;
            }

            let new_tail = cur_tail + n;
            if self
                .tail
                .compare_exchange(cur_tail, new_tail, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            let region = self.ensure_mapped(new_tail)?;
            let off = cur_tail as usize;
            let len = n as usize;
            return Ok((
                SpanMut {
                    _region: region.clone(),
                    ptr: unsafe { region.as_mut_ptr().add(off) },
                    len,
                    payload_offset: cur_tail + SIZE_PREFIX,
                },
                cur_tail,
            ));
        }
    }

    /// Translates a logical offset into a read-only span covering the
    /// `u32` size prefix plus its payload, or `None` if the mapping
    /// doesn't (yet) reach that far.
    fn raw_at(&self, offset: u64) -> Result<Option<Arc<MappedRegion>>> {
        if offset == 0 {
            return Ok(None);
        }
        let region = self.current_region();
        if (region.len() as u64) < offset + SIZE_PREFIX {
            return Ok(None);
        }
        Ok(Some(region))
    }

    /// Reads the `u32` size prefix and returns a span over just the
    /// payload bytes at `offset`. `None` if unreachable or the
    /// prefix declares a payload past the mapped length.
    pub fn payload_at(&self, offset: u64) -> Result<Option<Span>> {
        let region = match self.raw_at(offset)? {
            Some(r) => r,
            None => return Ok(None),
        };

        let off = offset as usize;
        // SAFETY: `raw_at` verified the mapping covers [off, off+4).
        let size = unsafe {
            let ptr = region.as_ptr().add(off) as *const u32;
            u32::from_le(std::ptr::read_unaligned(ptr))
        } as u64;

        if (region.len() as u64) < offset + SIZE_PREFIX + size {
            return Ok(None);
        }

        Ok(Some(Span {
            _region: region.clone(),
            ptr: unsafe { region.as_ptr().add(off + SIZE_PREFIX as usize) },
            len: size as usize,
        }))
    }

    /// Writes `size` into the first 4 bytes of the span returned by
    /// `allocate` (the allocation already reserved `size + 4` bytes).
    pub fn write_size_prefix(span: &mut SpanMut, size: u32) {
        debug_assert!(span.len >= SIZE_PREFIX as usize);
        unsafe {
            std::ptr::write_unaligned(span.ptr as *mut u32, size.to_le());
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.persist_tail();
        let region = self.current_region();
        // SAFETY: flushing is a read-only operation on the mapping.
        unsafe { (*region.0.get()).flush() }.map_err(StoreError::IoFailure)
    }

    pub fn flush_range(&self, offset: u64, len: usize) -> Result<()> {
        let region = self.current_region();
        unsafe { (*region.0.get()).flush_range(offset as usize, len) }
            .map_err(StoreError::IoFailure)
    }

    /// Writes the current high-water mark into the header so a reopen
    /// can recover it instead of mis-deriving it from the physical
    /// (book-rounded) file length. Best-effort, like every other
    /// flush in this store — the header's persisted value always
    /// trails the real tail by at most one flush interval.
    fn persist_tail(&self) {
        let tail = self.tail.load(Ordering::Acquire);
        let region = self.current_region();
        // SAFETY: [OFF_TAIL, OFF_TAIL+8) is part of the reserved
        // header region, never touched by `allocate`'s payload writes.
        unsafe {
            let mmap = &mut *region.0.get();
            mmap[OFF_TAIL..OFF_TAIL + 8].copy_from_slice(&tail.to_le_bytes());
        }
    }

    /// Linear scan from `start`, invoking `f` with each payload span
    /// in write order. Stops when `f` returns `false` or the
    /// high-water mark is reached. Returns the offset to resume from.
    pub fn enumerate_map<F: FnMut(&[u8]) -> bool>(&self, start: u64, mut f: F) -> Result<u64> {
        let mut cursor = start.max(HEADER_SIZE);
        let high_water = self.size();

        while cursor < high_water {
            let region = self.current_region();
            let off = cursor as usize;
            if (region.len() as u64) < cursor + SIZE_PREFIX {
                break;
            }
            let size = unsafe {
                let ptr = region.as_ptr().add(off) as *const u32;
                u32::from_le(std::ptr::read_unaligned(ptr))
            } as u64;

            if size == 0 {
                // Alignment gap: jump to the next book boundary.
                cursor += BOOK_SIZE - (cursor % BOOK_SIZE);
                continue;
            }

            if (region.len() as u64) < cursor + SIZE_PREFIX + size {
                break;
            }

            let payload = unsafe {
                std::slice::from_raw_parts(region.as_ptr().add(off + SIZE_PREFIX as usize), size as usize)
            };

            if !f(payload) {
                cursor += SIZE_PREFIX + size;
                break;
            }

            cursor += SIZE_PREFIX + size;
        }

        Ok(cursor.min(high_water))
    }
}

/// A read-only, zero-copy view into the data file. Keeps its backing
/// mapping alive for as long as it exists, even if the file has since
/// grown and been remapped elsewhere.
pub struct Span {
    _region: Arc<MappedRegion>,
    ptr: *const u8,
    len: usize,
}

unsafe impl Send for Span {}
unsafe impl Sync for Span {}

impl Deref for Span {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// A writable, zero-copy view into a freshly allocated region.
pub struct SpanMut {
    _region: Arc<MappedRegion>,
    ptr: *mut u8,
    len: usize,
    payload_offset: u64,
}

unsafe impl Send for SpanMut {}
unsafe impl Sync for SpanMut {}

impl SpanMut {
    /// The writable payload region (excludes the 4-byte size prefix
    /// that precedes it in the underlying allocation).
    pub fn payload_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.add(SIZE_PREFIX as usize), self.len - SIZE_PREFIX as usize)
        }
    }

    /// Logical offset of the payload bytes (i.e. past the 4-byte size
    /// prefix), suitable for passing straight to `DataFile::flush_range`.
    pub fn payload_offset(&self) -> u64 {
        self.payload_offset
    }
}

impl Deref for SpanMut {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl DerefMut for SpanMut {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocate_and_read_back() {
        let dir = tempdir().unwrap();
        let df = DataFile::open(dir.path().join("image.dat")).unwrap();

        let (mut span, offset) = df.allocate(4 + 5).unwrap();
        assert!(offset >= 1);
        DataFile::write_size_prefix(&mut span, 5);
        span.payload_mut().copy_from_slice(b"hello");
        drop(span);

        let payload = df.payload_at(offset).unwrap().unwrap();
        assert_eq!(&payload[..], b"hello");
    }

    #[test]
    fn offset_zero_is_never_valid() {
        let dir = tempdir().unwrap();
        let df = DataFile::open(dir.path().join("image.dat")).unwrap();
        assert!(df.payload_at(0).unwrap().is_none());
    }

    #[test]
    fn crosses_book_boundary_with_gap() {
        let dir = tempdir().unwrap();
        let df = DataFile::open(dir.path().join("image.dat")).unwrap();

        // Force the tail close to a book boundary, then allocate
        // something that can't fit in what's left.
        let near_end = BOOK_SIZE - 10;
        df.tail.store(near_end, Ordering::Relaxed);

        let (mut span, offset) = df.allocate(4 + 100).unwrap();
        assert_eq!(offset, BOOK_SIZE);
        DataFile::write_size_prefix(&mut span, 100);
        span.payload_mut().copy_from_slice(&[9u8; 100]);
        drop(span);

        let mut seen = Vec::new();
        df.enumerate_map(near_end, |data| {
            seen.push(data.to_vec());
            true
        })
        .unwrap();

        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], vec![9u8; 100]);
    }

    #[test]
    fn enumerate_yields_writes_in_order() {
        let dir = tempdir().unwrap();
        let df = DataFile::open(dir.path().join("image.dat")).unwrap();

        let mut offsets = Vec::new();
        for i in 0..5u8 {
            let payload = vec![i; 10];
            let (mut span, offset) = df.allocate(4 + payload.len() as u64).unwrap();
            DataFile::write_size_prefix(&mut span, payload.len() as u32);
            span.payload_mut().copy_from_slice(&payload);
            offsets.push(offset);
        }

        let mut seen = Vec::new();
        df.enumerate_map(0, |data| {
            seen.push(data[0]);
            true
        })
        .unwrap();

        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }
}
