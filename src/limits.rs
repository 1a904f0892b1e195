//! Shared size limits from spec.md §3 invariants 5 and 6.

/// Maximum payload size for a single block (8 MiB).
pub const MAX_BLOCK_SIZE: u64 = 8 * 1024 * 1024;

/// Maximum keys accepted by a single `Many` call.
pub const MAX_MANY_KEYS: usize = 64;

/// `Read::load_chunk`-style sanity bound: a size prefix above this is
/// treated as corruption rather than a legitimate (if oversized) block.
pub const MAX_SANE_BLOCK_SIZE: u64 = 32 * 1024 * 1024;
