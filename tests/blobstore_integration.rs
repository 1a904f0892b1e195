//! End-to-end scenarios from spec.md §8 (S1-S9), driven over real TCP
//! connections rather than in-process `Image` calls (those are
//! covered by the unit tests colocated with `image.rs`).

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use blobstore::client::event::EventClient;
use blobstore::client::Client;
use blobstore::image::Image;
use blobstore::key::Key;
use blobstore::server::{Server, ServerOptions};

/// Binds an ephemeral port and immediately releases it so a `Server`
/// can bind the same number. Racy in the general case, but fine for
/// a single-process test run.
fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn start_server(dir: &std::path::Path) -> (std::sync::Arc<Image>, Server, u16, u16, u16) {
    let image = Image::open(dir).unwrap();
    let query_port = free_port();
    let read_port = free_port();
    let write_port = free_port();

    let opts = ServerOptions {
        query_port,
        read_port,
        write_port,
        threads: 2,
        buffered_writes: true,
    };
    let server = Server::start(image.clone(), opts).unwrap();
    // Give the accept threads a moment to start listening.
    std::thread::sleep(Duration::from_millis(50));
    (image, server, query_port, read_port, write_port)
}

fn connect(query_port: u16, read_port: u16, write_port: u16) -> Client {
    Client::connect(
        ("127.0.0.1", query_port),
        ("127.0.0.1", read_port),
        ("127.0.0.1", write_port),
    )
    .unwrap()
}

fn key_of(byte: u8, tag: u8) -> Key {
    let mut bytes = [0u8; 32];
    bytes[0] = byte;
    bytes[1] = tag;
    Key(bytes)
}

#[test]
fn s1_write_then_read_over_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let (_image, server, qp, rp, wp) = start_server(dir.path());
    let mut client = connect(qp, rp, wp);

    let key = key_of(0, 1);
    client.write(&key, b"hello").unwrap();

    assert!(client.is(&key).unwrap());
    assert_eq!(client.read(&key).unwrap(), b"hello");

    server.shutdown();
}

#[test]
fn s5_many_reply_bitmap_matches_written_subset() {
    let dir = tempfile::tempdir().unwrap();
    let (_image, server, qp, rp, wp) = start_server(dir.path());
    let mut client = connect(qp, rp, wp);

    let keys: Vec<Key> = (0..64u8).map(|i| key_of(i, 2)).collect();
    for key in &keys[..10] {
        client.write(key, b"x").unwrap();
    }

    // Bypass the client's local cache to exercise the real wire reply:
    // a fresh, cache-less client sees exactly the server's bitmap.
    let mut fresh = connect(qp, rp, wp);
    let bitmap = fresh.many(&keys).unwrap();
    assert_eq!(bitmap, (1u64 << 10) - 1);

    server.shutdown();
}

#[test]
fn s7_cache_short_circuits_when_server_is_down() {
    let dir = tempfile::tempdir().unwrap();
    let (_image, server, qp, rp, wp) = start_server(dir.path());
    let mut client = connect(qp, rp, wp);

    let key = key_of(7, 3);
    client.write(&key, b"payload").unwrap();
    assert!(client.is(&key).unwrap());

    server.shutdown();
    drop(server);

    // The write() call above already populated the client's cache, so
    // this must not touch the network at all.
    assert!(client.is(&key).unwrap());
}

#[test]
fn s9_oversized_many_request_closes_connection_without_corrupting_state() {
    let dir = tempfile::tempdir().unwrap();
    let (_image, server, qp, rp, wp) = start_server(dir.path());

    // Hand-craft a 65-key `Many` request directly on the wire: 65 * 32
    // bytes of body, length-prefixed.
    let mut stream = TcpStream::connect(("127.0.0.1", qp)).unwrap();
    let body = vec![0xABu8; 32 * 65];
    stream.write_all(&(body.len() as u32).to_le_bytes()).unwrap();
    stream.write_all(&body).unwrap();

    // The server drops the connection rather than replying.
    let mut buf = [0u8; 8];
    let n = stream.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "server must not reply to an over-limit Many request");

    // The server itself is unharmed: a fresh connection still works.
    let mut client = connect(qp, rp, wp);
    let key = key_of(9, 4);
    client.write(&key, b"still alive").unwrap();
    assert_eq!(client.read(&key).unwrap(), b"still alive");

    server.shutdown();
}

#[test]
fn s9_short_write_header_closes_connection_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let (_image, server, qp, rp, wp) = start_server(dir.path());

    // A buffered write message shorter than the 32-byte key is
    // malformed; the server must drop the connection rather than
    // panic or desync.
    let mut stream = TcpStream::connect(("127.0.0.1", wp)).unwrap();
    let short_header = vec![0u8; 10];
    stream
        .write_all(&(short_header.len() as u32).to_le_bytes())
        .unwrap();
    stream.write_all(&short_header).unwrap();

    let mut buf = [0u8; 4];
    let n = stream.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "server must not ack a malformed write header");

    // Server remains healthy for a new connection (spec.md §8 S7).
    let mut client = connect(qp, rp, wp);
    let key = key_of(11, 5);
    client.write(&key, b"ok").unwrap();
    assert!(client.is(&key).unwrap());

    server.shutdown();
}

#[test]
fn duplicate_write_over_the_wire_keeps_first_payload() {
    let dir = tempfile::tempdir().unwrap();
    let (_image, server, qp, rp, wp) = start_server(dir.path());
    let mut client = connect(qp, rp, wp);

    let key = key_of(13, 6);
    client.write(&key, b"first").unwrap();
    client.write(&key, b"second").unwrap();

    assert_eq!(client.read(&key).unwrap(), b"first");

    server.shutdown();
}

#[test]
fn read_of_unknown_key_maps_to_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (_image, server, qp, rp, wp) = start_server(dir.path());
    let mut client = connect(qp, rp, wp);

    let key = key_of(17, 7);
    let err = client.read(&key).unwrap_err();
    assert!(matches!(err, blobstore::StoreError::NotFound));

    server.shutdown();
}

#[test]
fn validate_over_the_wire_checks_digest() {
    use sha2::{Digest as _, Sha256};

    let dir = tempfile::tempdir().unwrap();
    let (_image, server, qp, rp, wp) = start_server(dir.path());
    let mut client = connect(qp, rp, wp);

    let payload = b"validate me";
    let mut hasher = Sha256::new();
    hasher.update(payload);
    let digest: [u8; 32] = hasher.finalize().into();
    let key = Key(digest);

    client.write(&key, payload).unwrap();
    assert!(client.validate(&key).unwrap());
    assert!(!client.validate(&key_of(19, 8)).unwrap());

    server.shutdown();
}

#[test]
fn unbuffered_write_path_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let image = Image::open(dir.path()).unwrap();
    let qp = free_port();
    let rp = free_port();
    let wp = free_port();
    let opts = ServerOptions {
        query_port: qp,
        read_port: rp,
        write_port: wp,
        threads: 1,
        buffered_writes: false,
    };
    let server = Server::start(image, opts).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let mut client = connect(qp, rp, wp);
    let key = key_of(23, 9);
    let written = client.write_unbuffered(&key, b"unbuffered payload").unwrap();
    assert_eq!(written as usize, b"unbuffered payload".len());
    assert_eq!(client.read(&key).unwrap(), b"unbuffered payload");

    server.shutdown();
}

#[test]
fn event_client_write_then_read_completes_promptly() {
    use std::sync::mpsc;

    let dir = tempfile::tempdir().unwrap();
    let (_image, server, qp, rp, wp) = start_server(dir.path());

    let mut client = EventClient::connect(
        ("127.0.0.1", qp),
        ("127.0.0.1", rp),
        ("127.0.0.1", wp),
    )
    .unwrap();

    let key = key_of(29, 10);

    // The write channel's server-side reply is a bare 4-byte ack, not
    // a length-prefixed message; `write`'s callback must still fire
    // (regression test: it used to hang forever misreading the ack
    // as a message length prefix).
    let (write_tx, write_rx) = mpsc::channel();
    client
        .write(&key, b"event payload", move || {
            write_tx.send(()).unwrap();
        })
        .unwrap();
    write_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("write callback must fire instead of hanging");

    client.flush();

    let (read_tx, read_rx) = mpsc::channel();
    client
        .read(&key, move |payload| {
            read_tx.send(payload).unwrap();
        })
        .unwrap();
    let payload = read_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("read callback must fire");
    assert_eq!(payload, b"event payload");

    client.flush();
    server.shutdown();
}
