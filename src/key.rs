//! The 32-byte content-derived key used to address a block.

use std::fmt;

/// Exactly 32 opaque bytes. Equality and hashing use the raw bytes;
/// the low 64 bits double as the key's own hash (spec.md §3 — keys
/// are content-derived digests, so they are already well distributed
/// and do not need re-hashing for bucket selection).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key(pub [u8; 32]);

pub const KEY_SIZE: usize = 32;

impl Key {
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        if data.len() != KEY_SIZE {
            return None;
        }
        let mut buf = [0u8; KEY_SIZE];
        buf.copy_from_slice(data);
        Some(Key(buf))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Low 64 bits of the key, used directly as a table/bucket hash.
    pub fn hash64(&self) -> u64 {
        u64::from_le_bytes(self.0[0..8].try_into().unwrap())
    }
}

impl From<[u8; 32]> for Key {
    fn from(b: [u8; 32]) -> Self {
        Key(b)
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", hex::encode(self.0))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_slice() {
        let bytes = [7u8; 32];
        let key = Key::from_slice(&bytes).unwrap();
        assert_eq!(key.as_bytes(), &bytes);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Key::from_slice(&[0u8; 31]).is_none());
        assert!(Key::from_slice(&[0u8; 33]).is_none());
    }

    #[test]
    fn hash64_is_low_bytes() {
        let mut bytes = [0u8; 32];
        bytes[0..8].copy_from_slice(&42u64.to_le_bytes());
        let key = Key::from_slice(&bytes).unwrap();
        assert_eq!(key.hash64(), 42);
    }
}
