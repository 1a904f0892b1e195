//! Wire constants and framing helpers shared by the server and client
//! halves of the three channels (spec.md §4.4-4.6, §6).
//!
//! All integers are little-endian. This module only knows about byte
//! layout; it has no notion of sockets or the `Image` engine.

use std::io::{self, Read, Write};

use crate::key::{Key, KEY_SIZE};
use crate::limits::MAX_BLOCK_SIZE;

pub const DEFAULT_QUERY_PORT: u16 = 9009;
pub const DEFAULT_READ_PORT: u16 = 1010;
pub const DEFAULT_WRITE_PORT: u16 = 1111;

/// Leading byte of a `Validate` request on the query channel.
pub const VALIDATE_TAG: u8 = 0x01;

/// A decoded request on the query channel.
pub enum QueryRequest {
    Is(Key),
    Validate(Key),
    Many(Vec<Key>),
}

/// Decodes a query-channel message body per spec.md §4.5's table.
/// `None` means the framing was well-formed but the payload doesn't
/// match any known request shape — the caller should drop the
/// connection.
pub fn decode_query(body: &[u8]) -> Option<QueryRequest> {
    if body.len() == KEY_SIZE {
        return Some(QueryRequest::Is(Key::from_slice(body)?));
    }

    if body.len() == KEY_SIZE + 1 && body[0] == VALIDATE_TAG {
        return Some(QueryRequest::Validate(Key::from_slice(&body[1..])?));
    }

    if body.len() % KEY_SIZE == 0 {
        let n = body.len() / KEY_SIZE;
        if (2..=64).contains(&n) {
            let keys = body
                .chunks_exact(KEY_SIZE)
                .map(|c| Key::from_slice(c).expect("chunk is exactly KEY_SIZE"))
                .collect();
            return Some(QueryRequest::Many(keys));
        }
    }

    None
}

pub fn encode_is_request(key: &Key) -> Vec<u8> {
    key.as_bytes().to_vec()
}

pub fn encode_validate_request(key: &Key) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + KEY_SIZE);
    body.push(VALIDATE_TAG);
    body.extend_from_slice(key.as_bytes());
    body
}

pub fn encode_many_request(keys: &[Key]) -> Vec<u8> {
    let mut body = Vec::with_capacity(keys.len() * KEY_SIZE);
    for key in keys {
        body.extend_from_slice(key.as_bytes());
    }
    body
}

pub fn encode_buffered_write_request(key: &Key, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(KEY_SIZE + payload.len());
    body.extend_from_slice(key.as_bytes());
    body.extend_from_slice(payload);
    body
}

pub fn encode_unbuffered_write_header(size: u32, key: &Key) -> [u8; UNBUFFERED_WRITE_HEADER_LEN] {
    let mut buf = [0u8; UNBUFFERED_WRITE_HEADER_LEN];
    buf[0..4].copy_from_slice(&size.to_le_bytes());
    buf[4..].copy_from_slice(key.as_bytes());
    buf
}

pub fn encode_is_reply(found: bool) -> Vec<u8> {
    vec![found as u8]
}

pub fn encode_many_reply(bitmap: u64) -> Vec<u8> {
    bitmap.to_le_bytes().to_vec()
}

/// `Write` channel, buffered framing: `key || payload`, decoded from a
/// single length-prefixed message body.
pub fn decode_buffered_write(body: &[u8]) -> Option<(Key, &[u8])> {
    if body.len() < KEY_SIZE {
        return None;
    }
    let key = Key::from_slice(&body[..KEY_SIZE])?;
    Some((key, &body[KEY_SIZE..]))
}

pub fn encode_write_ack(bytes_written: u32) -> Vec<u8> {
    bytes_written.to_le_bytes().to_vec()
}

/// `Write` channel, unbuffered framing: `u32 size || 32-byte key`,
/// read off the socket ahead of the raw body.
pub struct UnbufferedWriteHeader {
    pub size: u32,
    pub key: Key,
}

pub const UNBUFFERED_WRITE_HEADER_LEN: usize = 4 + KEY_SIZE;

pub fn decode_unbuffered_header(bytes: &[u8; UNBUFFERED_WRITE_HEADER_LEN]) -> UnbufferedWriteHeader {
    let size = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let key = Key::from_slice(&bytes[4..]).expect("slice is KEY_SIZE bytes");
    UnbufferedWriteHeader { size, key }
}

/// `true` iff `size` fits the 8 MiB cap enforced on the unbuffered
/// write path (spec.md §9: "no payload above 8 MiB is ever
/// published").
pub fn unbuffered_size_in_bounds(size: u32) -> bool {
    (size as u64) <= MAX_BLOCK_SIZE
}

/// Reads one length-prefixed message: `u32 len || len bytes`.
pub fn read_message<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    Ok(body)
}

/// Writes one length-prefixed message.
pub fn write_message<W: Write>(w: &mut W, body: &[u8]) -> io::Result<()> {
    w.write_all(&(body.len() as u32).to_le_bytes())?;
    w.write_all(body)?;
    Ok(())
}

/// Reads a fixed-size frame (the read-channel request, or an
/// unbuffered write header) with no length prefix.
pub fn read_fixed<R: Read, const N: usize>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_is_request() {
        let body = [7u8; KEY_SIZE];
        match decode_query(&body).unwrap() {
            QueryRequest::Is(key) => assert_eq!(key.as_bytes(), &body),
            _ => panic!("expected Is"),
        }
    }

    #[test]
    fn decodes_validate_request() {
        let mut body = vec![VALIDATE_TAG];
        body.extend_from_slice(&[3u8; KEY_SIZE]);
        match decode_query(&body).unwrap() {
            QueryRequest::Validate(key) => assert_eq!(key.as_bytes(), &[3u8; KEY_SIZE]),
            _ => panic!("expected Validate"),
        }
    }

    #[test]
    fn decodes_many_request() {
        let body = vec![9u8; KEY_SIZE * 5];
        match decode_query(&body).unwrap() {
            QueryRequest::Many(keys) => assert_eq!(keys.len(), 5),
            _ => panic!("expected Many"),
        }
    }

    #[test]
    fn rejects_many_over_64() {
        let body = vec![9u8; KEY_SIZE * 65];
        assert!(decode_query(&body).is_none());
    }

    #[test]
    fn rejects_short_read_request() {
        // spec.md §8 property 9: a 31-byte read request is malformed.
        let body = [0u8; 31];
        assert_ne!(body.len(), KEY_SIZE);
    }

    #[test]
    fn rejects_short_write_header() {
        let body = [0u8; 10];
        assert!(decode_buffered_write(&body).is_none());
    }

    #[test]
    fn buffered_write_splits_key_and_payload() {
        let mut body = vec![1u8; KEY_SIZE];
        body.extend_from_slice(b"hello");
        let (key, payload) = decode_buffered_write(&body).unwrap();
        assert_eq!(key.as_bytes(), &[1u8; KEY_SIZE]);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn oversized_unbuffered_write_is_rejected() {
        assert!(!unbuffered_size_in_bounds((MAX_BLOCK_SIZE + 1) as u32));
        assert!(unbuffered_size_in_bounds(MAX_BLOCK_SIZE as u32));
    }
}
