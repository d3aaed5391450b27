//! Transport callback integration tests over loopback TCP
//!
//! These tests exercise the transport callbacks against a real socket:
//! - Blocking send of a full buffer
//! - Polling receive with timeout
//! - Timeout when the peer stays silent
//! - Peer shutdown detection, on direct and polled reads

use sslclient::transport::{lock, ConnectionIo};
use sslclient::{net_recv, net_recv_timeout, net_send, shared, Connection, TcpConnection, TransportError};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

/// Helper to start a server that runs `handler` on one accepted connection
fn spawn_server<F>(handler: F) -> SocketAddr
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        handler(stream);
    });

    addr
}

fn connect(addr: SocketAddr) -> TcpConnection {
    TcpConnection::connect(addr, Duration::from_secs(5)).unwrap()
}

#[test]
fn test_send_and_receive_echo() {
    let addr = spawn_server(|mut stream| {
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        stream.write_all(&buf).unwrap();
    });

    let mut conn = connect(addr);
    assert_eq!(net_send(Some(&mut conn), b"hello"), Ok(5));

    let mut buf = [0u8; 16];
    let n = net_recv_timeout(Some(&mut conn), &mut buf, Duration::from_secs(2)).unwrap();
    assert_eq!(&buf[..n], b"hello");
}

#[test]
fn test_large_send_is_complete() {
    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let (tx, rx) = std::sync::mpsc::channel();

    let addr = spawn_server(move |mut stream| {
        let mut received = Vec::new();
        stream.read_to_end(&mut received).unwrap();
        tx.send(received).unwrap();
    });

    let mut conn = connect(addr);
    assert_eq!(net_send(Some(&mut conn), &payload), Ok(payload.len()));
    conn.close();

    let received = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(received, expected);
}

#[test]
fn test_recv_timeout_on_silent_peer() {
    let addr = spawn_server(|stream| {
        thread::sleep(Duration::from_millis(500));
        drop(stream);
    });

    let mut conn = connect(addr);
    let mut buf = [0u8; 16];

    let start = Instant::now();
    let result = net_recv_timeout(Some(&mut conn), &mut buf, Duration::from_millis(100));

    assert_eq!(result, Err(TransportError::WouldBlock));
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(start.elapsed() < Duration::from_millis(450));
}

#[test]
fn test_recv_waits_for_late_data() {
    let addr = spawn_server(|mut stream| {
        thread::sleep(Duration::from_millis(50));
        stream.write_all(b"late").unwrap();
        thread::sleep(Duration::from_millis(100));
    });

    let mut conn = connect(addr);
    let mut buf = [0u8; 16];

    let n = net_recv_timeout(Some(&mut conn), &mut buf, Duration::from_secs(2)).unwrap();
    assert_eq!(&buf[..n], b"late");
}

#[test]
fn test_peer_close_detected() {
    let addr = spawn_server(drop);

    let mut conn = connect(addr);
    let mut buf = [0u8; 16];

    // The orderly shutdown shows up as a zero-length read
    thread::sleep(Duration::from_millis(50));
    assert_eq!(net_recv(Some(&mut conn), &mut buf), Ok(0));
    assert!(!conn.is_connected());
    assert_eq!(net_send(Some(&mut conn), b"data"), Err(TransportError::Disconnected));
}

#[test]
fn test_connection_io_over_shared_connection() {
    let addr = spawn_server(|mut stream| {
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        stream.write_all(b"pong").unwrap();
    });

    let conn = shared(connect(addr));
    let mut io = ConnectionIo::new(conn.clone(), Duration::from_secs(2));

    io.write_all(b"ping").unwrap();
    let mut buf = [0u8; 4];
    io.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"pong");

    lock(&conn).close();
    assert!(!lock(&conn).is_connected());
}

#[test]
fn test_recv_timeout_sees_peer_close() {
    let addr = spawn_server(drop);

    let mut conn = connect(addr);
    let mut buf = [0u8; 16];

    let start = Instant::now();
    let result = net_recv_timeout(Some(&mut conn), &mut buf, Duration::from_secs(5));

    assert_eq!(result, Err(TransportError::Disconnected));
    assert!(!conn.is_connected());
    assert!(start.elapsed() < Duration::from_secs(2));
}
