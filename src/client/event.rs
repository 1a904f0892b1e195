//! Callback-driven client variant (spec.md §4.6, §9: "naturally
//! re-expressed as request futures/promises over a single I/O reactor
//! thread; the external contract (submit, await completion) is
//! unchanged"). The local-cache logic mirrors [`super::Client`]
//! exactly; only the transport is asynchronous.

use std::collections::VecDeque;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::error::{Result, StoreError};
use crate::key::Key;
use crate::protocol::{self, read_fixed, read_message};

type Callback = Box<dyn FnOnce(Vec<u8>) + Send>;

/// Wire framing of a channel's replies. The query and read channels
/// reply with a length-prefixed message; the write channel replies
/// with a bare 4-byte ack (`encode_write_ack`/`handle_write` in
/// `server/handlers.rs`), matching the blocking `Client::write`'s
/// `read_exact`-4-bytes behaviour in `client/mod.rs`.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Framing {
    Message,
    FixedAck,
}

/// One request/reply channel with pipelined callbacks: writes queue
/// immediately, a dedicated reader thread matches each reply to the
/// oldest pending callback (connection order is preserved per
/// spec.md §5).
struct EventChannel {
    stream: TcpStream,
    pending: Arc<Mutex<VecDeque<Callback>>>,
    reader: Option<JoinHandle<()>>,
}

impl EventChannel {
    fn connect<A: ToSocketAddrs>(addr: A, framing: Framing) -> Result<Self> {
        let stream = TcpStream::connect(addr).map_err(StoreError::TransportFailure)?;
        let reader_stream = stream.try_clone().map_err(StoreError::TransportFailure)?;
        let pending: Arc<Mutex<VecDeque<Callback>>> = Arc::new(Mutex::new(VecDeque::new()));

        let reader_pending = pending.clone();
        let reader = std::thread::spawn(move || {
            let mut stream = reader_stream;
            loop {
                let reply = match framing {
                    Framing::Message => match read_message(&mut stream) {
                        Ok(r) => r,
                        Err(_) => break,
                    },
                    Framing::FixedAck => match read_fixed::<_, 4>(&mut stream) {
                        Ok(b) => b.to_vec(),
                        Err(_) => break,
                    },
                };
                let callback = reader_pending.lock().unwrap().pop_front();
                if let Some(callback) = callback {
                    callback(reply);
                }
            }
        });

        Ok(Self {
            stream,
            pending,
            reader: Some(reader),
        })
    }

    fn send<F: FnOnce(Vec<u8>) + Send + 'static>(&mut self, body: &[u8], callback: F) -> Result<()> {
        self.pending.lock().unwrap().push_back(Box::new(callback));
        protocol::write_message(&mut self.stream, body).map_err(StoreError::TransportFailure)
    }

    /// Blocks until every outstanding callback on this channel has
    /// run.
    fn flush(&self) {
        while !self.pending.lock().unwrap().is_empty() {
            std::thread::yield_now();
        }
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

pub struct EventClient {
    query: EventChannel,
    read: EventChannel,
    write: EventChannel,
}

impl EventClient {
    pub fn connect<A: ToSocketAddrs>(query_addr: A, read_addr: A, write_addr: A) -> Result<Self> {
        Ok(Self {
            query: EventChannel::connect(query_addr, Framing::Message)?,
            read: EventChannel::connect(read_addr, Framing::Message)?,
            write: EventChannel::connect(write_addr, Framing::FixedAck)?,
        })
    }

    pub fn flush(&self) {
        self.query.flush();
        self.read.flush();
        self.write.flush();
    }

    pub fn is<F: FnOnce(bool) + Send + 'static>(&mut self, key: &Key, f: F) -> Result<()> {
        let request = protocol::encode_is_request(key);
        self.query.send(&request, move |reply| {
            f(reply.first().map(|b| *b != 0).unwrap_or(false))
        })
    }

    pub fn many<F: FnOnce(u64) + Send + 'static>(&mut self, keys: &[Key], f: F) -> Result<()> {
        let request = protocol::encode_many_request(keys);
        self.query.send(&request, move |reply| {
            let bitmap = if reply.len() == 8 {
                u64::from_le_bytes(reply.try_into().unwrap())
            } else {
                0
            };
            f(bitmap)
        })
    }

    pub fn read<F: FnOnce(Vec<u8>) + Send + 'static>(&mut self, key: &Key, f: F) -> Result<()> {
        // The read channel's request is a bare 32-byte key, not a
        // length-prefixed message — write it directly.
        self.read
            .stream
            .write_all(key.as_bytes())
            .map_err(StoreError::TransportFailure)?;
        self.read.pending.lock().unwrap().push_back(Box::new(f));
        Ok(())
    }

    pub fn write<F: FnOnce() + Send + 'static>(
        &mut self,
        key: &Key,
        payload: &[u8],
        f: F,
    ) -> Result<()> {
        let request = protocol::encode_buffered_write_request(key, payload);
        self.write.send(&request, move |_reply| f())
    }
}
