//! sslclient - TLS transport and trust adapter
//!
//! Glues a byte-stream [`Connection`] to a TLS engine: the transport
//! callbacks the engine moves ciphertext through, the session lifecycle
//! (init, record I/O, teardown) and post-handshake peer checks by pinned
//! fingerprint or hostname.
//!
//! ```no_run
//! use sslclient::{shared, verify_ssl_dn, OpenSslEngine, Session, SessionConfig, TcpConnection};
//! use std::time::Duration;
//!
//! # fn main() -> sslclient::Result<()> {
//! let addr = "93.184.216.34:443".parse().unwrap();
//! let conn = shared(TcpConnection::connect(addr, Duration::from_secs(5))?);
//!
//! let mut session = Session::new(OpenSslEngine::new(), SessionConfig::default());
//! session.init(Some(conn))?;
//! session.handshake("example.com")?;
//! assert!(verify_ssl_dn(&session, "example.com"));
//!
//! session.send_ssl_data(b"GET / HTTP/1.0\r\n\r\n")?;
//! session.teardown();
//! # Ok(())
//! # }
//! ```

pub mod cert;
pub mod config;
pub mod engine;
pub mod error;
pub mod mock;
pub mod observability;
pub mod session;
pub mod transport;
pub mod verify;

pub use cert::{CertInfo, ClientIdentity, TrustAnchor};
pub use config::{SessionConfig, SessionConfigBuilder};
pub use engine::{OpenSslEngine, TlsEngine};
pub use error::{handle_error, EngineError, TlsError, TransportError};
pub use session::{Ownership, Session};
pub use transport::{net_recv, net_recv_timeout, net_send, shared, Connection, SharedConnection, TcpConnection};
pub use verify::{match_name, parse_hex_nibble, verify_ssl_dn, verify_ssl_fingerprint};

/// Result type for session operations
pub type Result<T> = std::result::Result<T, TlsError>;
