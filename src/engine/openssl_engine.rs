//! OpenSSL engine
//!
//! Drives an OpenSSL `SslStream` whose underlying stream is a
//! [`ConnectionIo`], so every byte OpenSSL moves goes through the transport
//! callbacks. The handshake is started with [`Session::handshake`].

use super::{EngineResult, TlsEngine};
use crate::error::{EngineError, TlsError, TransportError};
use crate::session::Session;
use crate::transport::{Connection, ConnectionIo};
use openssl::ssl::{
    ErrorCode, HandshakeError, Ssl, SslContext, SslContextBuilder, SslMethod, SslStream,
    SslVerifyMode,
};
use openssl::x509::{X509VerifyResult, X509};
use std::marker::PhantomData;
use std::thread;
use std::time::Instant;
use tracing::trace;

/// TLS engine backed by OpenSSL
pub struct OpenSslEngine<C> {
    _connection: PhantomData<fn() -> C>,
}

impl<C> OpenSslEngine<C> {
    pub fn new() -> Self {
        OpenSslEngine {
            _connection: PhantomData,
        }
    }
}

impl<C> Default for OpenSslEngine<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Protocol state: the TLS stream once the handshake has completed
pub struct OpenSslState<C> {
    stream: Option<SslStream<ConnectionIo<C>>>,
}

impl<C> OpenSslState<C> {
    pub fn is_established(&self) -> bool {
        self.stream.is_some()
    }

    /// Negotiated protocol version, e.g. "TLSv1.3"
    pub fn version(&self) -> Option<&'static str> {
        self.stream.as_ref().map(|s| s.ssl().version_str())
    }

    /// Negotiated ALPN protocol
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.stream.as_ref()?.ssl().selected_alpn_protocol()
    }
}

/// Protocol configuration: the context the stream was created from
pub struct OpenSslConfig {
    context: Option<SslContext>,
}

impl OpenSslConfig {
    pub fn context(&self) -> Option<&SslContext> {
        self.context.as_ref()
    }
}

/// Translate an OpenSSL failure into the engine code space
fn map_ssl_error(err: &openssl::ssl::Error) -> EngineError {
    match err.code() {
        ErrorCode::WANT_READ => EngineError::SSL_WANT_READ,
        ErrorCode::WANT_WRITE => EngineError::SSL_WANT_WRITE,
        ErrorCode::ZERO_RETURN => EngineError::SSL_PEER_CLOSE_NOTIFY,
        ErrorCode::SYSCALL => match err.io_error().map(|e| e.kind()) {
            Some(std::io::ErrorKind::WouldBlock) => EngineError::SSL_WANT_READ,
            Some(std::io::ErrorKind::WriteZero) => EngineError::NET_SEND_FAILED,
            Some(std::io::ErrorKind::ConnectionAborted) => EngineError::NET_RECV_FAILED,
            None => EngineError::SSL_CONN_EOF,
            Some(_) => EngineError::NET_CONN_RESET,
        },
        ErrorCode::SSL if is_unexpected_eof(err) => EngineError::SSL_CONN_EOF,
        ErrorCode::SSL => EngineError::SSL_FATAL_ALERT_MESSAGE,
        _ => EngineError::SSL_BAD_INPUT_DATA,
    }
}

/// OpenSSL 3 reports a transport EOF without close_notify as a protocol error
fn is_unexpected_eof(err: &openssl::ssl::Error) -> bool {
    err.ssl_error().is_some_and(|stack| {
        stack
            .errors()
            .iter()
            .any(|e| e.reason() == Some("unexpected eof while reading"))
    })
}

impl<C: Connection> TlsEngine for OpenSslEngine<C> {
    type State = OpenSslState<C>;
    type Config = OpenSslConfig;
    // OpenSSL seeds and owns its own DRBG
    type Entropy = ();

    fn new_state(&mut self) -> OpenSslState<C> {
        OpenSslState { stream: None }
    }

    fn new_config(&mut self) -> OpenSslConfig {
        OpenSslConfig { context: None }
    }

    fn new_entropy(&mut self) {}

    fn write(&mut self, state: &mut OpenSslState<C>, buf: &[u8]) -> EngineResult {
        let stream = state.stream.as_mut().ok_or(EngineError::SSL_BAD_INPUT_DATA)?;
        stream.ssl_write(buf).map_err(|e| map_ssl_error(&e))
    }

    fn read(&mut self, state: &mut OpenSslState<C>, buf: &mut [u8]) -> EngineResult {
        let stream = state.stream.as_mut().ok_or(EngineError::SSL_BAD_INPUT_DATA)?;
        if buf.is_empty() {
            // Peeking processes incoming records without consuming plaintext
            let mut probe = [0u8; 1];
            return stream.ssl_peek(&mut probe).map(|_| 0).map_err(|e| map_ssl_error(&e));
        }
        stream.ssl_read(buf).map_err(|e| map_ssl_error(&e))
    }

    fn set_deadline(&mut self, state: &mut OpenSslState<C>, deadline: Option<Instant>) {
        if let Some(stream) = state.stream.as_mut() {
            stream.get_mut().set_deadline(deadline);
        }
    }

    fn bytes_available(&self, state: &OpenSslState<C>) -> usize {
        state.stream.as_ref().map_or(0, |s| s.ssl().pending())
    }

    fn peer_certificate(&self, state: &OpenSslState<C>) -> Option<X509> {
        state.stream.as_ref()?.ssl().peer_certificate()
    }
}

impl<C: Connection> Session<C, OpenSslEngine<C>> {
    /// Run the client handshake against `host`.
    ///
    /// The context is built from the session's trust anchor, client identity
    /// and ALPN list. Blocked handshake steps are retried until the
    /// handshake timeout expires.
    pub fn handshake(&mut self, host: &str) -> Result<(), TlsError> {
        let parts = self.parts_mut().ok_or(TlsError::NotInitialized)?;
        let connection = parts
            .connection
            .cloned()
            .ok_or(TlsError::Transport(TransportError::InvalidContext))?;
        let config = parts.config;

        trace!(host, "Starting SSL handshake");

        let mut ctx_builder = SslContextBuilder::new(SslMethod::tls_client())?;
        if let Some(anchor) = parts.trust_anchor {
            for cert in anchor.certs() {
                ctx_builder.cert_store_mut().add_cert(cert.clone())?;
            }
            ctx_builder.set_verify(SslVerifyMode::PEER);
        } else if config.verify_peer() {
            ctx_builder.set_default_verify_paths()?;
            ctx_builder.set_verify(SslVerifyMode::PEER);
        } else {
            ctx_builder.set_verify(SslVerifyMode::NONE);
        }

        if let Some(identity) = parts.client_identity {
            ctx_builder.set_certificate(&identity.certificate)?;
            ctx_builder.set_private_key(&identity.key)?;
            ctx_builder.check_private_key()?;
        }

        if !config.alpn().is_empty() {
            ctx_builder.set_alpn_protos(&config.alpn_wire())?;
        }

        let context = ctx_builder.build();
        let mut ssl = Ssl::new(&context)?;
        ssl.set_hostname(config.servername().unwrap_or(host))?;
        parts.protocol_config.context = Some(context);

        let deadline = Instant::now() + config.handshake_timeout();
        let mut io = ConnectionIo::new(connection, config.read_timeout());
        io.set_deadline(Some(deadline));
        let mut result = ssl.connect(io);

        let mut stream = loop {
            match result {
                Ok(stream) => break stream,
                Err(HandshakeError::WouldBlock(mid)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let err = crate::handle_error!(EngineError::SSL_TIMEOUT, "handshake");
                        return Err(TlsError::HandshakeFailed(format!("timed out: {}", err)));
                    }
                    thread::sleep(config.poll_interval().min(deadline - now));
                    result = mid.handshake();
                }
                Err(HandshakeError::SetupFailure(stack)) => return Err(stack.into()),
                Err(HandshakeError::Failure(mid)) => {
                    let verify = mid.ssl().verify_result();
                    let code = if verify != X509VerifyResult::OK {
                        EngineError::X509_CERT_VERIFY_FAILED
                    } else {
                        map_ssl_error(mid.error())
                    };
                    let code = crate::handle_error!(code, "handshake");
                    return Err(TlsError::HandshakeFailed(format!(
                        "{} ({})",
                        code,
                        verify.error_string()
                    )));
                }
            }
        };

        trace!(
            version = stream.ssl().version_str(),
            cipher = stream.ssl().current_cipher().map(|c| c.name()).unwrap_or("<undef>"),
            "SSL handshake done"
        );
        stream.get_mut().set_deadline(None);
        parts.state.stream = Some(stream);
        Ok(())
    }
}
