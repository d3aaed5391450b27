//! Transport I/O adapter
//!
//! The TLS engine moves bytes through three callbacks: a blocking send that
//! loops over short writes, a single best-effort receive, and a receive that
//! polls the connection until a deadline. This module implements them over
//! any [`Connection`].

use crate::error::TransportError;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Delay between two `available()` checks in [`net_recv_timeout`]
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Byte-stream connection consumed by the adapter
///
/// Modelled on a simple client object: writes report how many bytes were
/// accepted (0 meaning no progress), reads may return fewer bytes than asked.
pub trait Connection {
    /// Whether the connection is currently established
    fn is_connected(&mut self) -> bool;

    /// Number of bytes that can be read without blocking
    fn available(&mut self) -> usize;

    /// Read into `buf`, returning the number of bytes read
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `buf`, returning the number of bytes accepted
    fn write(&mut self, buf: &[u8]) -> usize;

    /// Close the connection
    fn close(&mut self);
}

/// Connection shared between the caller and a session
pub type SharedConnection<C> = Arc<Mutex<C>>;

/// Wrap a connection so it can be bound to a session
pub fn shared<C: Connection>(connection: C) -> SharedConnection<C> {
    Arc::new(Mutex::new(connection))
}

/// Lock a shared connection, recovering from a poisoned lock
pub fn lock<C>(connection: &SharedConnection<C>) -> MutexGuard<'_, C> {
    connection.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Send the whole of `buf`, looping over short writes.
///
/// A write that makes no progress fails the whole call with
/// [`TransportError::SendFailed`]; the partial count is not reported.
pub fn net_send<C: Connection + ?Sized>(
    connection: Option<&mut C>,
    buf: &[u8],
) -> Result<usize, TransportError> {
    let Some(connection) = connection else {
        return Err(TransportError::InvalidContext);
    };

    if !connection.is_connected() {
        error!("net_send: connection is not established");
        return Err(TransportError::Disconnected);
    }

    let mut sent = 0;
    while sent < buf.len() {
        let written = connection.write(&buf[sent..]);
        if written == 0 {
            return Err(TransportError::SendFailed);
        }
        sent += written.min(buf.len() - sent);
    }

    Ok(sent)
}

/// Perform one read attempt and return its result as is.
pub fn net_recv<C: Connection + ?Sized>(
    connection: Option<&mut C>,
    buf: &mut [u8],
) -> Result<usize, TransportError> {
    let Some(connection) = connection else {
        return Err(TransportError::InvalidContext);
    };

    if !connection.is_connected() {
        return Err(TransportError::Disconnected);
    }

    connection.read(buf).map_err(|e| {
        debug!(error = %e, "net_recv: read failed");
        TransportError::RecvFailed
    })
}

/// Wait up to `timeout` for data, then read what is available.
///
/// Running out of time, or a read that yields nothing even though bytes were
/// reported, returns [`TransportError::WouldBlock`] so the engine retries.
pub fn net_recv_timeout<C: Connection + ?Sized>(
    connection: Option<&mut C>,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<usize, TransportError> {
    trace!(len = buf.len(), timeout_ms = timeout.as_millis() as u64, "net_recv_timeout");

    let Some(connection) = connection else {
        error!("net_recv_timeout: no connection");
        return Err(TransportError::InvalidContext);
    };

    if buf.is_empty() {
        warn!("net_recv_timeout: zero-length read requested");
        return Ok(0);
    }

    if !connection.is_connected() {
        return Err(TransportError::Disconnected);
    }

    let deadline = Instant::now() + timeout;
    let available = loop {
        let available = connection.available();
        if available > 0 {
            break available;
        }

        if !connection.is_connected() {
            trace!("net_recv_timeout: peer closed the connection");
            return Err(TransportError::Disconnected);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(TransportError::WouldBlock);
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    };

    let len = available.min(buf.len());
    match connection.read(&mut buf[..len]) {
        Ok(0) => Err(TransportError::WouldBlock),
        Ok(n) => {
            trace!(read = n, "net_recv_timeout: received");
            Ok(n)
        }
        Err(e) => {
            debug!(error = %e, "net_recv_timeout: read failed");
            Err(TransportError::RecvFailed)
        }
    }
}

/// `Read`/`Write` view of a shared connection
///
/// Reads go through [`net_recv_timeout`] and writes through [`net_send`], so
/// an engine that drives a `Read + Write` stream (such as OpenSSL) sees the
/// same callback semantics. A closed connection reads as end of stream.
pub struct ConnectionIo<C> {
    connection: SharedConnection<C>,
    read_timeout: Duration,
    deadline: Option<Instant>,
}

impl<C: Connection> ConnectionIo<C> {
    pub fn new(connection: SharedConnection<C>, read_timeout: Duration) -> Self {
        ConnectionIo {
            connection,
            read_timeout,
            deadline: None,
        }
    }

    /// Cap every read wait so it ends by `deadline`
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    fn wait_limit(&self) -> Duration {
        match self.deadline {
            Some(deadline) => self
                .read_timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.read_timeout,
        }
    }

    /// Get a reference to the shared connection
    pub fn connection(&self) -> &SharedConnection<C> {
        &self.connection
    }
}

impl<C: Connection> Read for ConnectionIo<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = self.wait_limit();
        let mut guard = lock(&self.connection);
        match net_recv_timeout(Some(&mut *guard), buf, timeout) {
            Ok(n) => Ok(n),
            Err(TransportError::Disconnected) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl<C: Connection> Write for ConnectionIo<C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = lock(&self.connection);
        net_send(Some(&mut *guard), buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// TCP implementation of [`Connection`]
pub struct TcpConnection {
    stream: TcpStream,
    connected: bool,
}

impl TcpConnection {
    /// Connect to `addr`, giving up after `timeout`
    pub fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        use socket2::{Domain, Protocol, Socket, Type};

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nodelay(true)?;
        socket.connect_timeout(&addr.into(), timeout)?;

        Ok(Self::from_stream(socket.into()))
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: TcpStream) -> Self {
        TcpConnection {
            stream,
            connected: true,
        }
    }

    /// Get a reference to the underlying stream
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Whether the peer has shut down its side, checked without blocking
    fn peer_closed(&self) -> bool {
        let mut byte = 0u8;
        let result = unsafe {
            libc::recv(
                self.stream.as_raw_fd(),
                &mut byte as *mut u8 as *mut libc::c_void,
                1,
                libc::MSG_PEEK | libc::MSG_DONTWAIT,
            )
        };

        match result {
            0 => true,
            n if n > 0 => false,
            _ => {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => false,
                    _ => {
                        debug!(error = %err, "tcp peek failed");
                        true
                    }
                }
            }
        }
    }
}

impl Connection for TcpConnection {
    fn is_connected(&mut self) -> bool {
        self.connected
    }

    fn available(&mut self) -> usize {
        let mut pending: libc::c_int = 0;
        let result = unsafe {
            libc::ioctl(
                self.stream.as_raw_fd(),
                libc::FIONREAD,
                &mut pending as *mut libc::c_int,
            )
        };

        if result < 0 {
            debug!(error = %io::Error::last_os_error(), "FIONREAD failed");
            return 0;
        }
        if pending <= 0 {
            if self.connected && self.peer_closed() {
                self.connected = false;
            }
            return 0;
        }
        pending as usize
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stream.read(buf)?;
        if n == 0 && !buf.is_empty() {
            // Orderly shutdown by the peer
            self.connected = false;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        match self.stream.write(buf) {
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "tcp write failed");
                self.connected = false;
                0
            }
        }
    }

    fn close(&mut self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!(error = %e, "tcp shutdown failed");
        }
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{LogCapture, MockConnection};
    use tracing::Level;

    #[test]
    fn test_send_null_context() {
        let buf = [0u8; 100];
        let result = net_send::<MockConnection>(None, &buf);
        assert_eq!(result, Err(TransportError::InvalidContext));
        assert_eq!(result.unwrap_err().code(), -1);
    }

    #[test]
    fn test_send_in_chunks() {
        let mut conn = MockConnection::connected().with_writes(&[1024, 1024, 1024]);
        let buf = [0x5Au8; 3072];

        let result = net_send(Some(&mut conn), &buf);

        assert_eq!(result, Ok(3072));
        assert_eq!(conn.write_calls, 3);
        assert_eq!(conn.written.len(), 3072);
    }

    #[test]
    fn test_send_zero_write_fails() {
        let mut conn = MockConnection::connected().with_writes(&[1024, 1024, 0]);
        let buf = [0u8; 3000];

        let result = net_send(Some(&mut conn), &buf);

        assert_eq!(result, Err(TransportError::SendFailed));
        assert_eq!(result.unwrap_err().code(), crate::EngineError::NET_SEND_FAILED.code());
    }

    #[test]
    fn test_send_zero_length() {
        let mut conn = MockConnection::connected();
        assert_eq!(net_send(Some(&mut conn), &[]), Ok(0));
        assert_eq!(conn.write_calls, 0);
    }

    #[test]
    fn test_send_single_chunk() {
        let mut conn = MockConnection::connected().with_writes(&[1024]);
        let buf = [0u8; 1024];
        assert_eq!(net_send(Some(&mut conn), &buf), Ok(1024));
    }

    #[test]
    fn test_send_disconnected() {
        let mut conn = MockConnection::disconnected().with_writes(&[1000]);
        let buf = [0u8; 1000];

        let (result, logs) = LogCapture::capture(|| net_send(Some(&mut conn), &buf));

        assert_eq!(result, Err(TransportError::Disconnected));
        assert_eq!(result.unwrap_err().code(), -2);
        assert_eq!(logs.count(Level::ERROR), 1);
        assert_eq!(conn.write_calls, 0);
    }

    #[test]
    fn test_recv_null_context() {
        let mut buf = [0u8; 100];
        assert_eq!(
            net_recv::<MockConnection>(None, &mut buf),
            Err(TransportError::InvalidContext)
        );
    }

    #[test]
    fn test_recv_disconnected() {
        let mut conn = MockConnection::disconnected().with_reads(&[50]);
        let mut buf = [0u8; 100];

        assert_eq!(net_recv(Some(&mut conn), &mut buf), Err(TransportError::Disconnected));
        assert_eq!(conn.read_calls, 0);
    }

    #[test]
    fn test_recv_returns_read_count() {
        let mut conn = MockConnection::connected().with_reads(&[50]);
        let mut buf = [0u8; 100];

        assert_eq!(net_recv(Some(&mut conn), &mut buf), Ok(50));
        assert_eq!(conn.read_calls, 1);
    }

    #[test]
    fn test_recv_zero_is_not_an_error() {
        let mut conn = MockConnection::connected().with_reads(&[0]);
        let mut buf = [0u8; 100];

        assert_eq!(net_recv(Some(&mut conn), &mut buf), Ok(0));
    }

    #[test]
    fn test_recv_io_error() {
        let mut conn = MockConnection::connected().failing_reads();
        let mut buf = [0u8; 100];

        assert_eq!(net_recv(Some(&mut conn), &mut buf), Err(TransportError::RecvFailed));
    }

    #[test]
    fn test_recv_timeout_null_context() {
        let mut buf = [0u8; 10];

        let (result, logs) = LogCapture::capture(|| {
            net_recv_timeout::<MockConnection>(None, &mut buf, Duration::from_millis(1000))
        });

        assert_eq!(result, Err(TransportError::InvalidContext));
        assert_eq!(logs.count(Level::TRACE), 1);
        assert_eq!(logs.count(Level::ERROR), 1);
    }

    #[test]
    fn test_recv_timeout_reads_available() {
        let mut conn = MockConnection::connected().with_available(&[10]).with_reads(&[10]);
        let mut buf = [0u8; 10];

        let (result, logs) = LogCapture::capture(|| {
            net_recv_timeout(Some(&mut conn), &mut buf, Duration::from_millis(1000))
        });

        assert_eq!(result, Ok(10));
        assert_eq!(logs.count(Level::TRACE), 2);
    }

    #[test]
    fn test_recv_timeout_after_delay() {
        let mut conn = MockConnection::connected()
            .with_available(&[0, 0, 0, 4])
            .with_reads(&[4]);
        let mut buf = [0u8; 10];

        let result = net_recv_timeout(Some(&mut conn), &mut buf, Duration::from_millis(1000));

        assert_eq!(result, Ok(4));
        assert_eq!(conn.available_calls, 4);
    }

    #[test]
    fn test_recv_timeout_short_read_is_success() {
        let mut conn = MockConnection::connected().with_available(&[100]).with_reads(&[3]);
        let mut buf = [0u8; 10];

        let result = net_recv_timeout(Some(&mut conn), &mut buf, Duration::from_millis(100));
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_recv_timeout_expires() {
        let mut conn = MockConnection::connected().with_available(&[0]).with_reads(&[0]);
        let mut buf = [0u8; 10];

        let start = Instant::now();
        let (result, logs) = LogCapture::capture(|| {
            net_recv_timeout(Some(&mut conn), &mut buf, Duration::from_millis(100))
        });

        assert_eq!(result, Err(TransportError::WouldBlock));
        assert_eq!(result.unwrap_err().code(), crate::EngineError::SSL_WANT_READ.code());
        assert_eq!(logs.count(Level::TRACE), 1);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(conn.read_calls, 0);
    }

    #[test]
    fn test_recv_timeout_zero_read() {
        let mut conn = MockConnection::connected().with_available(&[10]).with_reads(&[0]);
        let mut buf = [0u8; 10];

        let (result, logs) = LogCapture::capture(|| {
            net_recv_timeout(Some(&mut conn), &mut buf, Duration::from_millis(1000))
        });

        assert_eq!(result, Err(TransportError::WouldBlock));
        assert_eq!(logs.count(Level::TRACE), 1);
    }

    #[test]
    fn test_recv_timeout_zero_length() {
        let mut conn = MockConnection::connected().with_available(&[10]);
        let mut buf = [0u8; 10];

        let (result, logs) = LogCapture::capture(|| {
            net_recv_timeout(Some(&mut conn), &mut buf[..0], Duration::from_millis(1000))
        });

        assert_eq!(result, Ok(0));
        assert_eq!(logs.count(Level::WARN), 1);
        assert_eq!(conn.available_calls, 0);
    }

    #[test]
    fn test_recv_timeout_disconnected() {
        let mut conn = MockConnection::disconnected().with_available(&[10]);
        let mut buf = [0u8; 10];

        let result = net_recv_timeout(Some(&mut conn), &mut buf, Duration::from_millis(100));

        assert_eq!(result, Err(TransportError::Disconnected));
        assert_eq!(conn.available_calls, 0);
        assert_eq!(conn.read_calls, 0);
    }

    #[test]
    fn test_recv_timeout_peer_closes_while_waiting() {
        let mut conn = MockConnection::connected().with_available(&[0]).closing_after_polls(3);
        let mut buf = [0u8; 10];

        let start = Instant::now();
        let result = net_recv_timeout(Some(&mut conn), &mut buf, Duration::from_secs(5));

        assert_eq!(result, Err(TransportError::Disconnected));
        assert_eq!(conn.available_calls, 3);
        assert_eq!(conn.read_calls, 0);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_connection_io_reads_eof_after_close() {
        let conn = shared(MockConnection::connected().with_available(&[0]).closing_after_polls(1));
        let mut io = ConnectionIo::new(conn, Duration::from_secs(5));
        let mut buf = [0u8; 4];

        assert_eq!(Read::read(&mut io, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_connection_io_deadline_caps_wait() {
        let conn = shared(MockConnection::connected().with_available(&[0]));
        let mut io = ConnectionIo::new(conn, Duration::from_secs(5));
        io.set_deadline(Some(Instant::now() + Duration::from_millis(20)));
        let mut buf = [0u8; 4];

        let start = Instant::now();
        let err = Read::read(&mut io, &mut buf).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_connection_io_maps_would_block() {
        let conn = shared(MockConnection::connected().with_available(&[0]));
        let mut io = ConnectionIo::new(conn, Duration::from_millis(5));
        let mut buf = [0u8; 4];

        let err = Read::read(&mut io, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_connection_io_write() {
        let conn = shared(MockConnection::connected().with_writes(&[2, 2]));
        let mut io = ConnectionIo::new(conn.clone(), Duration::from_millis(5));

        assert_eq!(Write::write(&mut io, b"abcd").unwrap(), 4);
        assert_eq!(lock(&conn).written, b"abcd");
    }
}
