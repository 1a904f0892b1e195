//! Pluggable content-verification for `Image::validate_standard`
//! (spec.md §9: "this becomes a trait/interface `Digest`... supplied
//! by the caller; the core stores bytes only").

use sha2::{Digest as _, Sha256};

use crate::key::Key;

/// Verifies that a key is the digest of its own payload. The core
/// never hard-codes a hash algorithm; callers pick one (or roll their
/// own) via this trait.
pub trait Digest {
    fn verify(key: &Key, payload: &[u8]) -> bool;
}

/// The store's default: SHA-256 over the raw payload bytes.
pub struct Sha256Digest;

impl Digest for Sha256Digest {
    fn verify(key: &Key, payload: &[u8]) -> bool {
        let mut hasher = Sha256::new();
        hasher.update(payload);
        hasher.finalize().as_slice() == key.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_round_trips() {
        let payload = b"hello world";
        let mut hasher = Sha256::new();
        hasher.update(payload);
        let digest: [u8; 32] = hasher.finalize().into();
        let key = Key(digest);

        assert!(Sha256Digest::verify(&key, payload));
        assert!(!Sha256Digest::verify(&key, b"tampered"));
    }
}
