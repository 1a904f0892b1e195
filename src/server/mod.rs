//! Multi-threaded TCP framing server (spec.md §4.4).
//!
//! Three independent channels — query, read, write — each bind their
//! own listening socket and dispatch accepted connections to a small
//! worker pool via a `crossbeam_channel`. Workers block on socket I/O;
//! that's acceptable per spec.md §5 ("handlers are non-suspending from
//! the engine's perspective").

mod handlers;

use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{info, warn};

use crate::image::Image;
use crate::protocol::{DEFAULT_QUERY_PORT, DEFAULT_READ_PORT, DEFAULT_WRITE_PORT};

/// Poll interval used while waiting for a new connection, so the
/// accept loop can notice `shutdown` without blocking forever.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug)]
pub struct ServerOptions {
    pub query_port: u16,
    pub read_port: u16,
    pub write_port: u16,
    /// Worker threads per channel (spec.md §4.4: "default 1").
    pub threads: usize,
    /// Write channel framing. `true` selects message framing
    /// (buffered, the default); `false` selects the unbuffered
    /// split-header path that reads straight into a mapped region.
    pub buffered_writes: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            query_port: DEFAULT_QUERY_PORT,
            read_port: DEFAULT_READ_PORT,
            write_port: DEFAULT_WRITE_PORT,
            threads: 1,
            buffered_writes: true,
        }
    }
}

/// Best-effort, racy counters exposed for observability (spec.md
/// §4.4): "connection_count, message_count, events_started,
/// events_finished, reply_count".
#[derive(Default)]
pub struct ServerCounters {
    pub connection_count: AtomicU64,
    pub message_count: AtomicU64,
    pub events_started: AtomicU64,
    pub events_finished: AtomicU64,
    pub reply_count: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub connection_count: u64,
    pub message_count: u64,
    pub events_started: u64,
    pub events_finished: u64,
    pub reply_count: u64,
}

impl ServerCounters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            connection_count: self.connection_count.load(Ordering::Relaxed),
            message_count: self.message_count.load(Ordering::Relaxed),
            events_started: self.events_started.load(Ordering::Relaxed),
            events_finished: self.events_finished.load(Ordering::Relaxed),
            reply_count: self.reply_count.load(Ordering::Relaxed),
        }
    }
}

struct Channel {
    running: Arc<AtomicBool>,
    accept_thread: JoinHandle<()>,
    worker_threads: Vec<JoinHandle<()>>,
}

impl Channel {
    fn spawn<F>(
        name: &'static str,
        addr: impl ToSocketAddrs,
        threads: usize,
        handle: F,
    ) -> std::io::Result<Self>
    where
        F: Fn(TcpStream) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let running = Arc::new(AtomicBool::new(true));
        let handle = Arc::new(handle);

        let (tx, rx) = crossbeam_channel::unbounded::<TcpStream>();
        let worker_threads = (0..threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                let handle = handle.clone();
                std::thread::Builder::new()
                    .name(format!("{}-worker-{}", name, i))
                    .spawn(move || {
                        for stream in rx {
                            handle(stream);
                        }
                    })
                    .expect("spawning worker thread")
            })
            .collect();

        let accept_running = running.clone();
        let accept_thread = std::thread::Builder::new()
            .name(format!("{}-accept", name))
            .spawn(move || {
                while accept_running.load(Ordering::Acquire) {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            info!("{}: accepted connection from {}", name, peer);
                            if tx.send(stream).is_err() {
                                break;
                            }
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(ACCEPT_POLL);
                        }
                        Err(e) => {
                            warn!("{}: accept failed: {}", name, e);
                            std::thread::sleep(ACCEPT_POLL);
                        }
                    }
                }
                drop(tx);
            })
            .expect("spawning accept thread");

        Ok(Self {
            running,
            accept_thread,
            worker_threads,
        })
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn join(self) {
        let _ = self.accept_thread.join();
        for worker in self.worker_threads {
            let _ = worker.join();
        }
    }
}

/// Owns the three channel listeners fronting an [`Image`].
pub struct Server {
    query: Channel,
    read: Channel,
    write: Channel,
    counters: Arc<ServerCounters>,
}

impl Server {
    pub fn start(image: Arc<Image>, opts: ServerOptions) -> std::io::Result<Self> {
        let counters = Arc::new(ServerCounters::default());

        let query = {
            let image = image.clone();
            let counters = counters.clone();
            Channel::spawn(
                "query",
                ("0.0.0.0", opts.query_port),
                opts.threads,
                move |stream| handlers::handle_query(stream, &image, &counters),
            )?
        };

        let read = {
            let image = image.clone();
            let counters = counters.clone();
            Channel::spawn(
                "read",
                ("0.0.0.0", opts.read_port),
                opts.threads,
                move |stream| handlers::handle_read(stream, &image, &counters),
            )?
        };

        let write = {
            let image = image.clone();
            let counters = counters.clone();
            let buffered = opts.buffered_writes;
            Channel::spawn(
                "write",
                ("0.0.0.0", opts.write_port),
                opts.threads,
                move |stream| handlers::handle_write(stream, &image, &counters, buffered),
            )?
        };

        Ok(Self {
            query,
            read,
            write,
            counters,
        })
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    /// Cooperative: stops accepting new connections on all three
    /// channels. In-flight handlers finish their current request
    /// (spec.md §5).
    pub fn shutdown(&self) {
        self.query.shutdown();
        self.read.shutdown();
        self.write.shutdown();
    }

    pub fn join(self) {
        self.query.join();
        self.read.join();
        self.write.join();
    }
}
