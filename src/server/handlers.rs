//! Per-channel request handlers (spec.md §4.5). Each function owns a
//! connection for its whole lifetime, looping over requests until the
//! peer disconnects or sends something malformed, at which point the
//! connection is silently dropped.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, warn};

use crate::digest::Sha256Digest;
use crate::image::Image;
use crate::key::KEY_SIZE;
use crate::protocol::{
    self, decode_buffered_write, decode_query, decode_unbuffered_header, encode_is_reply,
    encode_many_reply, encode_write_ack, read_fixed, read_message, unbuffered_size_in_bounds,
    QueryRequest, UNBUFFERED_WRITE_HEADER_LEN,
};

use super::ServerCounters;

pub fn handle_query(mut stream: TcpStream, image: &Arc<Image>, counters: &Arc<ServerCounters>) {
    counters.connection_count.fetch_add(1, Ordering::Relaxed);

    loop {
        let body = match read_message(&mut stream) {
            Ok(b) => b,
            Err(_) => break, // disconnect or malformed framing
        };
        counters.message_count.fetch_add(1, Ordering::Relaxed);
        counters.events_started.fetch_add(1, Ordering::Relaxed);

        let request = match decode_query(&body) {
            Some(r) => r,
            None => {
                debug!("query: malformed request of {} bytes, dropping", body.len());
                break;
            }
        };

        let reply = match request {
            QueryRequest::Is(key) => encode_is_reply(image.is(&key)),
            QueryRequest::Validate(key) => {
                let ok = image.validate_standard::<Sha256Digest>(&key).unwrap_or(false);
                encode_is_reply(ok)
            }
            QueryRequest::Many(keys) => match image.many(&keys) {
                Ok(bitmap) => encode_many_reply(bitmap),
                Err(err) => {
                    warn!("query: many() rejected: {}", err);
                    break;
                }
            },
        };

        if protocol::write_message(&mut stream, &reply).is_err() {
            break;
        }
        counters.reply_count.fetch_add(1, Ordering::Relaxed);
        counters.events_finished.fetch_add(1, Ordering::Relaxed);
    }
}

/// Read channel: fixed 32-byte key in, length-prefixed payload out (4
/// zero bytes if missing — spec.md §4.5).
pub fn handle_read(mut stream: TcpStream, image: &Arc<Image>, counters: &Arc<ServerCounters>) {
    counters.connection_count.fetch_add(1, Ordering::Relaxed);

    loop {
        let key_bytes: [u8; KEY_SIZE] = match read_fixed(&mut stream) {
            Ok(b) => b,
            Err(_) => break,
        };
        counters.message_count.fetch_add(1, Ordering::Relaxed);
        counters.events_started.fetch_add(1, Ordering::Relaxed);

        let key = crate::key::Key(key_bytes);
        let span = match image.map(&key) {
            Ok(span) => span,
            Err(err) => {
                warn!("read: image.map failed: {}", err);
                break;
            }
        };

        let write_result = match span {
            Some(span) => protocol::write_message(&mut stream, &span),
            None => stream.write_all(&0u32.to_le_bytes()),
        };

        if write_result.is_err() {
            break;
        }
        counters.reply_count.fetch_add(1, Ordering::Relaxed);
        counters.events_finished.fetch_add(1, Ordering::Relaxed);
    }
}

/// Write channel: buffered (message framing) or unbuffered (split
/// header + raw body straight into the target mapped region).
pub fn handle_write(
    mut stream: TcpStream,
    image: &Arc<Image>,
    counters: &Arc<ServerCounters>,
    buffered: bool,
) {
    counters.connection_count.fetch_add(1, Ordering::Relaxed);

    loop {
        counters.events_started.fetch_add(1, Ordering::Relaxed);

        let written = if buffered {
            match handle_buffered_write(&mut stream, image) {
                Some(n) => n,
                None => break,
            }
        } else {
            match handle_unbuffered_write(&mut stream, image) {
                Some(n) => n,
                None => break,
            }
        };
        counters.message_count.fetch_add(1, Ordering::Relaxed);

        if stream.write_all(&encode_write_ack(written)).is_err() {
            break;
        }
        counters.reply_count.fetch_add(1, Ordering::Relaxed);
        counters.events_finished.fetch_add(1, Ordering::Relaxed);
    }
}

fn handle_buffered_write(stream: &mut TcpStream, image: &Arc<Image>) -> Option<u32> {
    let body = read_message(stream).ok()?;
    if body.len() < KEY_SIZE {
        debug!("write: header shorter than {} bytes, dropping", KEY_SIZE);
        return None;
    }
    let (key, payload) = decode_buffered_write(&body)?;
    if let Err(err) = image.write(&key, payload) {
        warn!("write: image.write failed: {}", err);
        return None;
    }
    Some(payload.len() as u32)
}

fn handle_unbuffered_write(stream: &mut TcpStream, image: &Arc<Image>) -> Option<u32> {
    let header_bytes: [u8; UNBUFFERED_WRITE_HEADER_LEN] = read_fixed(stream).ok()?;
    let header = decode_unbuffered_header(&header_bytes);

    if !unbuffered_size_in_bounds(header.size) {
        // The client already believes the body follows the header;
        // drain it before replying so the next request on this
        // connection doesn't desync (spec.md §9 treats oversized
        // unbuffered writes as "reply 0", not a dropped connection).
        let mut sink = vec![0u8; header.size as usize];
        if stream.read_exact(&mut sink).is_err() {
            return None;
        }
        return Some(0);
    }

    let span = match image.allocate(&header.key, header.size as u64) {
        Ok(span) => span,
        Err(err) => {
            warn!("write: allocate failed: {}", err);
            return None;
        }
    };

    match span {
        Some(mut span) => {
            // A disconnect mid-body leaves the slot permanently
            // published at its offset with whatever partial bytes
            // landed — the index already reserved it. This matches
            // the original's unbuffered path, which has no rollback.
            if stream.read_exact(span.payload_mut()).is_err() {
                return None;
            }
            Some(header.size)
        }
        // Duplicate key or the data file couldn't grow: still need to
        // drain `size` bytes off the wire so the connection doesn't
        // desync on the next request.
        None => {
            let mut sink = vec![0u8; header.size as usize];
            if stream.read_exact(&mut sink).is_err() {
                return None;
            }
            Some(header.size)
        }
    }
}
