//! Error types and the engine error translator
//!
//! The TLS engine reports failures as negative `i32` codes. [`EngineError`]
//! wraps those codes, [`TransportError`] is the typed result of the transport
//! and record layers, and [`TlsError`] covers lifecycle, configuration and
//! verification failures.

use std::fmt;
use tracing::error;

/// A negative status code reported by the TLS engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineError(i32);

impl EngineError {
    /// Sending information through the socket failed
    pub const NET_SEND_FAILED: EngineError = EngineError(-0x004E);
    /// Reading information from the socket failed
    pub const NET_RECV_FAILED: EngineError = EngineError(-0x004C);
    /// Connection was reset by peer
    pub const NET_CONN_RESET: EngineError = EngineError(-0x0050);
    /// Pre-2.0 "would block on read" code, superseded by `SSL_WANT_READ`
    pub const LEGACY_NET_WANT_READ: EngineError = EngineError(-0x0052);
    /// Certificate verification failed
    pub const X509_CERT_VERIFY_FAILED: EngineError = EngineError(-0x2700);
    /// Read timed out
    pub const SSL_TIMEOUT: EngineError = EngineError(-0x6800);
    /// Operation must be retried once the transport can be written
    pub const SSL_WANT_WRITE: EngineError = EngineError(-0x6880);
    /// Operation must be retried once the transport has data
    pub const SSL_WANT_READ: EngineError = EngineError(-0x6900);
    /// Handshake failed
    pub const SSL_HANDSHAKE_FAILURE: EngineError = EngineError(-0x6E00);
    /// Requested feature is not available
    pub const SSL_FEATURE_UNAVAILABLE: EngineError = EngineError(-0x7080);
    /// Bad input parameters to function
    pub const SSL_BAD_INPUT_DATA: EngineError = EngineError(-0x7100);
    /// Connection closed without close_notify
    pub const SSL_CONN_EOF: EngineError = EngineError(-0x7280);
    /// A fatal alert message was received from the peer
    pub const SSL_FATAL_ALERT_MESSAGE: EngineError = EngineError(-0x7780);
    /// The peer notified us that the connection is going to be closed
    pub const SSL_PEER_CLOSE_NOTIFY: EngineError = EngineError(-0x7880);
    /// Memory allocation failed
    pub const SSL_ALLOC_FAILED: EngineError = EngineError(-0x7F00);

    /// Wrap a raw engine code
    pub const fn new(code: i32) -> Self {
        EngineError(code)
    }

    /// Raw numeric code
    pub const fn code(self) -> i32 {
        self.0
    }

    /// Whether this is a flow-control signal rather than a failure
    pub fn is_want_read_or_write(self) -> bool {
        self == Self::SSL_WANT_READ || self == Self::SSL_WANT_WRITE
    }

    /// Human readable description, if the code is a known one
    pub fn description(self) -> Option<&'static str> {
        let msg = match self {
            Self::NET_SEND_FAILED => "NET - Sending information through the socket failed",
            Self::NET_RECV_FAILED => "NET - Reading information from the socket failed",
            Self::NET_CONN_RESET => "NET - Connection was reset by peer",
            Self::X509_CERT_VERIFY_FAILED => "X509 - Certificate verification failed",
            Self::SSL_TIMEOUT => "SSL - The operation timed out",
            Self::SSL_WANT_WRITE => "SSL - Connection requires a write call",
            Self::SSL_WANT_READ => "SSL - Connection requires a read call",
            Self::SSL_HANDSHAKE_FAILURE => "SSL - A fatal alert was sent during the handshake",
            Self::SSL_BAD_INPUT_DATA => "SSL - Bad input parameters to function",
            Self::SSL_CONN_EOF => "SSL - The connection indicated an EOF",
            Self::SSL_FATAL_ALERT_MESSAGE => "SSL - A fatal alert message was received from our peer",
            Self::SSL_PEER_CLOSE_NOTIFY => "SSL - The peer notified us that the connection is going to be closed",
            Self::SSL_ALLOC_FAILED => "SSL - Memory allocation failed",
            _ => return None,
        };
        Some(msg)
    }

    /// Renumber legacy codes to their current equivalent
    pub fn modernize(self) -> Self {
        match self {
            Self::LEGACY_NET_WANT_READ => Self::SSL_WANT_READ,
            other => other,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        write!(f, "{}0x{:04X}", sign, self.0.unsigned_abs())?;
        if let Some(msg) = self.description() {
            write!(f, " ({})", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for EngineError {}

/// Codes that are expected during normal operation and never logged
const SILENT_CODES: &[EngineError] = &[EngineError::SSL_PEER_CLOSE_NOTIFY];

/// Classify an engine error and log it once.
///
/// Silent codes pass through untouched. Everything else is logged at error
/// level with the calling function and line, and returned (renumbered only
/// when it is a legacy code).
pub fn handle_error(err: EngineError, function: &str, line: u32) -> EngineError {
    if SILENT_CODES.contains(&err) {
        return err;
    }

    let err = err.modernize();
    match err.description() {
        Some(msg) => error!(function, line, code = err.code(), "[{}():{}]: ({}) {}", function, line, err.code(), msg),
        None => error!(function, line, code = err.code(), "[{}():{}]: code {}", function, line, err.code()),
    }
    err
}

/// Call [`handle_error`] with the current source line.
#[macro_export]
macro_rules! handle_error {
    ($err:expr, $function:expr) => {
        $crate::error::handle_error($err, $function, line!())
    };
}

/// Typed failure of the transport and record layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("invalid context: no connection or session")]
    InvalidContext,

    #[error("transport is not connected")]
    Disconnected,

    #[error("transport send failed")]
    SendFailed,

    #[error("transport receive failed")]
    RecvFailed,

    #[error("operation would block")]
    WouldBlock,

    #[error("operation timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    ProtocolFatal(EngineError),
}

impl TransportError {
    /// Numeric view of the failure, as seen by a C-style engine callback
    pub fn code(&self) -> i32 {
        match self {
            TransportError::InvalidContext => -1,
            TransportError::Disconnected => -2,
            TransportError::SendFailed => EngineError::NET_SEND_FAILED.code(),
            TransportError::RecvFailed => EngineError::NET_RECV_FAILED.code(),
            TransportError::WouldBlock => EngineError::SSL_WANT_READ.code(),
            TransportError::Timeout => EngineError::SSL_TIMEOUT.code(),
            TransportError::ProtocolFatal(err) => err.code(),
        }
    }
}

impl From<TransportError> for std::io::Error {
    fn from(err: TransportError) -> Self {
        use std::io::ErrorKind;

        let kind = match err {
            TransportError::WouldBlock => ErrorKind::WouldBlock,
            TransportError::Timeout => ErrorKind::TimedOut,
            TransportError::Disconnected => ErrorKind::NotConnected,
            TransportError::InvalidContext => ErrorKind::InvalidInput,
            TransportError::SendFailed => ErrorKind::WriteZero,
            TransportError::RecvFailed => ErrorKind::ConnectionAborted,
            TransportError::ProtocolFatal(_) => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

/// Session level errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Peer verification failed: {0}")]
    VerificationFailed(String),

    #[error("Session is not initialized")]
    NotInitialized,

    #[error("Session is already initialized")]
    AlreadyInitialized,

    #[error("Logging setup failed: {0}")]
    Logging(String),
}
