//! Client with a local existence cache (spec.md §4.6).
//!
//! Three independent connections — query, read, write — mirror the
//! server's three channels. Every observed-true `Is`/`Many` result is
//! recorded in the [`cache::ExistenceCache`] so a later `is` for the
//! same key never touches the network.

pub mod cache;
pub mod event;

use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::{Result, StoreError};
use crate::key::Key;
use crate::limits::MAX_MANY_KEYS;
use crate::protocol::{
    self, encode_buffered_write_request, encode_is_request, encode_many_request,
    encode_unbuffered_write_header, encode_validate_request, read_message,
};

use cache::ExistenceCache;

#[derive(Clone, Debug)]
pub struct ClientAddrs<A: ToSocketAddrs + Clone> {
    pub query: A,
    pub read: A,
    pub write: A,
}

/// A connected client. Each of the three channels is a single,
/// reused `TcpStream` — requests on one channel are strictly ordered
/// (spec.md §5: "request i receives reply i in order").
pub struct Client {
    query: TcpStream,
    read: TcpStream,
    write: TcpStream,
    cache: ExistenceCache,
}

impl Client {
    pub fn connect<A: ToSocketAddrs>(
        query_addr: A,
        read_addr: A,
        write_addr: A,
    ) -> Result<Self> {
        Ok(Self {
            query: TcpStream::connect(query_addr).map_err(StoreError::TransportFailure)?,
            read: TcpStream::connect(read_addr).map_err(StoreError::TransportFailure)?,
            write: TcpStream::connect(write_addr).map_err(StoreError::TransportFailure)?,
            cache: ExistenceCache::in_memory()?,
        })
    }

    pub fn connect_with_cache<A: ToSocketAddrs>(
        query_addr: A,
        read_addr: A,
        write_addr: A,
        cache: ExistenceCache,
    ) -> Result<Self> {
        Ok(Self {
            query: TcpStream::connect(query_addr).map_err(StoreError::TransportFailure)?,
            read: TcpStream::connect(read_addr).map_err(StoreError::TransportFailure)?,
            write: TcpStream::connect(write_addr).map_err(StoreError::TransportFailure)?,
            cache,
        })
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.query
            .set_read_timeout(timeout)
            .map_err(StoreError::TransportFailure)?;
        self.read
            .set_read_timeout(timeout)
            .map_err(StoreError::TransportFailure)?;
        self.write
            .set_read_timeout(timeout)
            .map_err(StoreError::TransportFailure)
    }

    /// `true` without network I/O if the cache already knows about
    /// `key` (spec.md §8 property 7: "a client that has observed
    /// is(K) == true ... returns true ... with the server down").
    pub fn is(&mut self, key: &Key) -> Result<bool> {
        if self.cache.contains(key) {
            return Ok(true);
        }

        let request = encode_is_request(key);
        protocol::write_message(&mut self.query, &request).map_err(StoreError::TransportFailure)?;
        let reply = read_message(&mut self.query).map_err(StoreError::TransportFailure)?;

        let found = reply.first().map(|b| *b != 0).unwrap_or(false);
        if found {
            self.cache.insert(key);
        }
        Ok(found)
    }

    /// Probes the local cache first; only falls back to the network
    /// when at least one key is an unknown (spec.md §4.6 admits either
    /// behaviour — this client takes the short-circuit when it can).
    pub fn many(&mut self, keys: &[Key]) -> Result<u64> {
        if keys.len() > MAX_MANY_KEYS {
            return Err(StoreError::OverLimit(format!(
                "many() called with {} keys, max is {}",
                keys.len(),
                MAX_MANY_KEYS
            )));
        }

        let mut local_bitmap: u64 = 0;
        let mut all_cached = true;
        for (i, key) in keys.iter().enumerate() {
            if self.cache.contains(key) {
                local_bitmap |= 1 << i;
            } else {
                all_cached = false;
            }
        }

        if all_cached {
            return Ok(local_bitmap);
        }

        let request = encode_many_request(keys);
        protocol::write_message(&mut self.query, &request).map_err(StoreError::TransportFailure)?;
        let reply = read_message(&mut self.query).map_err(StoreError::TransportFailure)?;

        if reply.len() != 8 {
            return Err(StoreError::ProtocolViolation(format!(
                "many reply was {} bytes, expected 8",
                reply.len()
            )));
        }
        let remote_bitmap = u64::from_le_bytes(reply.try_into().unwrap());
        let bitmap = remote_bitmap | local_bitmap;

        for (i, key) in keys.iter().enumerate() {
            if bitmap & (1 << i) != 0 {
                self.cache.insert(key);
            }
        }

        Ok(bitmap)
    }

    pub fn validate(&mut self, key: &Key) -> Result<bool> {
        let request = encode_validate_request(key);
        protocol::write_message(&mut self.query, &request).map_err(StoreError::TransportFailure)?;
        let reply = read_message(&mut self.query).map_err(StoreError::TransportFailure)?;
        Ok(reply.first().map(|b| *b != 0).unwrap_or(false))
    }

    /// `NotFound` if the server replies with the 4-zero-byte sentinel
    /// (spec.md §4.6).
    pub fn read(&mut self, key: &Key) -> Result<Vec<u8>> {
        self.read
            .write_all(key.as_bytes())
            .map_err(StoreError::TransportFailure)?;
        let reply = read_message(&mut self.read).map_err(StoreError::TransportFailure)?;
        if reply.is_empty() {
            return Err(StoreError::NotFound);
        }
        Ok(reply)
    }

    pub fn write(&mut self, key: &Key, payload: &[u8]) -> Result<u32> {
        let request = encode_buffered_write_request(key, payload);
        protocol::write_message(&mut self.write, &request).map_err(StoreError::TransportFailure)?;
        let mut ack = [0u8; 4];
        std::io::Read::read_exact(&mut self.write, &mut ack).map_err(StoreError::TransportFailure)?;
        self.cache.insert(key);
        Ok(u32::from_le_bytes(ack))
    }

    /// Unbuffered write: header first, then the raw payload with no
    /// framing (spec.md §4.4/§4.5).
    pub fn write_unbuffered(&mut self, key: &Key, payload: &[u8]) -> Result<u32> {
        let header = encode_unbuffered_write_header(payload.len() as u32, key);
        self.write
            .write_all(&header)
            .map_err(StoreError::TransportFailure)?;
        self.write
            .write_all(payload)
            .map_err(StoreError::TransportFailure)?;
        let mut ack = [0u8; 4];
        std::io::Read::read_exact(&mut self.write, &mut ack).map_err(StoreError::TransportFailure)?;
        let written = u32::from_le_bytes(ack);
        if written > 0 {
            self.cache.insert(key);
        }
        Ok(written)
    }
}

/// How a [`ReconnectingClient`] responds to a transport failure.
/// Spec.md §9: "the source retry block is structurally present but
/// gated by an unconditional rethrow" — default behaviour here
/// matches that observed default, with retry kept as an opt-in hook.
#[derive(Clone, Copy, Debug)]
pub enum RetryPolicy {
    FailFast,
    Retry { attempts: u32, backoff: Duration },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::FailFast
    }
}

/// Wraps a [`Client`] with a configurable retry policy around
/// transport failures. Non-transport errors (e.g. `NotFound`,
/// `OverLimit`) are never retried.
pub struct ReconnectingClient {
    inner: Client,
    policy: RetryPolicy,
}

impl ReconnectingClient {
    pub fn new(inner: Client, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    fn with_retry<T>(&mut self, mut op: impl FnMut(&mut Client) -> Result<T>) -> Result<T> {
        match self.policy {
            RetryPolicy::FailFast => op(&mut self.inner),
            RetryPolicy::Retry { attempts, backoff } => {
                let mut last_err = None;
                for _ in 0..attempts.max(1) {
                    match op(&mut self.inner) {
                        Ok(v) => return Ok(v),
                        Err(StoreError::TransportFailure(e)) => {
                            last_err = Some(StoreError::TransportFailure(e));
                            std::thread::sleep(backoff);
                        }
                        Err(other) => return Err(other),
                    }
                }
                Err(last_err.unwrap_or(StoreError::NotFound))
            }
        }
    }

    pub fn is(&mut self, key: &Key) -> Result<bool> {
        self.with_retry(|c| c.is(key))
    }

    pub fn read(&mut self, key: &Key) -> Result<Vec<u8>> {
        self.with_retry(|c| c.read(key))
    }

    pub fn write(&mut self, key: &Key, payload: &[u8]) -> Result<u32> {
        self.with_retry(|c| c.write(key, payload))
    }
}
