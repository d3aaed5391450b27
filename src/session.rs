//! TLS session lifecycle and record I/O
//!
//! A [`Session`] binds a shared connection to the protocol state of a TLS
//! engine. `init` allocates the engine objects, the record I/O methods move
//! application data, and `teardown` releases exactly what the session owns.

use crate::cert::{ClientIdentity, TrustAnchor};
use crate::config::SessionConfig;
use crate::engine::TlsEngine;
use crate::error::{EngineError, TlsError, TransportError};
use crate::transport::{lock, Connection, SharedConnection};
use openssl::x509::X509;
use std::mem;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{error, trace};

/// Who is responsible for releasing a piece of trust material
#[derive(Debug, Clone)]
pub enum Ownership<T> {
    /// Nothing configured
    NotSet,
    /// Allocated by the session, released at teardown
    OwnedBySession(T),
    /// Supplied by the caller, never released by the session
    Borrowed(Arc<T>),
}

impl<T> Default for Ownership<T> {
    fn default() -> Self {
        Ownership::NotSet
    }
}

impl<T> Ownership<T> {
    pub fn get(&self) -> Option<&T> {
        match self {
            Ownership::NotSet => None,
            Ownership::OwnedBySession(value) => Some(value),
            Ownership::Borrowed(value) => Some(value),
        }
    }

    pub fn is_set(&self) -> bool {
        !matches!(self, Ownership::NotSet)
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Ownership::OwnedBySession(_))
    }
}

/// Engine objects allocated together by `init` and released together
struct Protocol<E: TlsEngine> {
    state: E::State,
    config: E::Config,
    entropy: E::Entropy,
}

/// Borrowed view of a session handed to engine-specific handshake code
pub(crate) struct SessionParts<'a, C, E: TlsEngine> {
    pub state: &'a mut E::State,
    pub protocol_config: &'a mut E::Config,
    pub config: &'a SessionConfig,
    pub connection: Option<&'a SharedConnection<C>>,
    pub trust_anchor: Option<&'a TrustAnchor>,
    pub client_identity: Option<&'a ClientIdentity>,
}

/// One TLS session over one connection
///
/// Callers serialize access; a session is driven by one flow at a time.
pub struct Session<C, E: TlsEngine> {
    engine: E,
    config: SessionConfig,
    connection: Option<SharedConnection<C>>,
    protocol: Option<Protocol<E>>,
    trust_anchor: Ownership<TrustAnchor>,
    client_identity: Ownership<ClientIdentity>,
}

impl<C: Connection, E: TlsEngine> Session<C, E> {
    /// Create an empty session
    pub fn new(engine: E, config: SessionConfig) -> Self {
        Session {
            engine,
            config,
            connection: None,
            protocol: None,
            trust_anchor: Ownership::NotSet,
            client_identity: Ownership::NotSet,
        }
    }

    /// Bind `connection` and allocate the engine state.
    ///
    /// Must be called once, before any record I/O. The connection may be
    /// absent; I/O then fails with [`TransportError::InvalidContext`].
    pub fn init(&mut self, connection: Option<SharedConnection<C>>) -> Result<(), TlsError> {
        if self.protocol.is_some() {
            return Err(TlsError::AlreadyInitialized);
        }

        trace!("Init SSL");
        self.connection = connection;
        self.protocol = Some(Protocol {
            state: self.engine.new_state(),
            config: self.engine.new_config(),
            entropy: self.engine.new_entropy(),
        });
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.protocol.is_some()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn connection(&self) -> Option<&SharedConnection<C>> {
        self.connection.as_ref()
    }

    /// Detach the connection without closing it
    pub fn detach_connection(&mut self) -> Option<SharedConnection<C>> {
        self.connection.take()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Protocol state, once initialized
    pub fn state(&self) -> Option<&E::State> {
        self.protocol.as_ref().map(|p| &p.state)
    }

    pub fn trust_anchor(&self) -> &Ownership<TrustAnchor> {
        &self.trust_anchor
    }

    pub fn client_identity(&self) -> &Ownership<ClientIdentity> {
        &self.client_identity
    }

    /// Parse CA certificates owned by this session
    pub fn load_trust_anchor_pem(&mut self, pem: &[u8]) -> Result<(), TlsError> {
        let anchor = TrustAnchor::from_pem(pem)?;
        self.replace_trust_anchor(Ownership::OwnedBySession(anchor));
        Ok(())
    }

    /// Load CA certificates owned by this session from a PEM file
    pub fn load_trust_anchor_file<P: AsRef<std::path::Path>>(&mut self, path: P) -> Result<(), TlsError> {
        let anchor = TrustAnchor::from_file(path)?;
        self.replace_trust_anchor(Ownership::OwnedBySession(anchor));
        Ok(())
    }

    /// Attach CA certificates shared with other sessions
    pub fn set_trust_anchor(&mut self, anchor: Arc<TrustAnchor>) {
        self.replace_trust_anchor(Ownership::Borrowed(anchor));
    }

    /// Parse a client certificate and key owned by this session
    pub fn load_client_identity_pem(&mut self, cert_pem: &[u8], key_pem: &[u8]) -> Result<(), TlsError> {
        let identity = ClientIdentity::from_pem(cert_pem, key_pem)?;
        self.replace_client_identity(Ownership::OwnedBySession(identity));
        Ok(())
    }

    /// Attach a client identity shared with other sessions
    pub fn set_client_identity(&mut self, identity: Arc<ClientIdentity>) {
        self.replace_client_identity(Ownership::Borrowed(identity));
    }

    fn replace_trust_anchor(&mut self, anchor: Ownership<TrustAnchor>) {
        let previous = mem::replace(&mut self.trust_anchor, anchor);
        self.release_trust_anchor(previous);
    }

    fn replace_client_identity(&mut self, identity: Ownership<ClientIdentity>) {
        let previous = mem::replace(&mut self.client_identity, identity);
        self.release_client_identity(previous);
    }

    fn release_trust_anchor(&mut self, anchor: Ownership<TrustAnchor>) {
        if let Ownership::OwnedBySession(anchor) = anchor {
            self.engine.free_certificate(anchor.into_certs());
            trace!("Freed CA certificates");
        }
    }

    fn release_client_identity(&mut self, identity: Ownership<ClientIdentity>) {
        if let Ownership::OwnedBySession(identity) = identity {
            self.engine.free_certificate(vec![identity.certificate]);
            self.engine.free_private_key(identity.key);
            trace!("Freed client certificate and key");
        }
    }

    /// Close the connection and release everything this session allocated.
    ///
    /// Safe to call on an empty session, on a session without connection and
    /// more than once.
    pub fn teardown(&mut self) {
        trace!("Cleaning SSL connection");

        if let Some(connection) = self.connection.take() {
            lock(&connection).close();
            trace!("Stopping SSL client");
        }

        if let Some(protocol) = self.protocol.take() {
            self.engine.free_state(protocol.state);
            self.engine.free_config(protocol.config);
            self.engine.free_entropy(protocol.entropy);
            trace!("Freed SSL state and configuration");
        }

        let anchor = mem::take(&mut self.trust_anchor);
        self.release_trust_anchor(anchor);
        let identity = mem::take(&mut self.client_identity);
        self.release_client_identity(identity);
    }

    /// Number of decrypted bytes ready to be read.
    ///
    /// Probes the engine so pending records get processed; "no data yet" is
    /// reported as zero.
    pub fn data_available(&mut self) -> Result<usize, TransportError> {
        let Some(protocol) = self.protocol.as_mut() else {
            error!("data_available: session is not initialized");
            return Err(TransportError::InvalidContext);
        };

        trace!("Checking for available data");
        let probe = self.engine.read(&mut protocol.state, &mut []);
        let available = self.engine.bytes_available(&protocol.state);

        match probe {
            Ok(_) => {}
            Err(err) if err == EngineError::SSL_WANT_READ => {}
            Err(err) => {
                trace!(code = err.code(), "Data check failed");
                let err = crate::handle_error!(err, "data_available");
                return Err(TransportError::ProtocolFatal(err));
            }
        }

        trace!(available, "Data check done");
        Ok(available)
    }

    /// Encrypt and send `data`, retrying while the engine is blocked.
    ///
    /// "Want read" and "want write" are retried until the handshake timeout
    /// runs out. Returns the number of plaintext bytes consumed.
    pub fn send_ssl_data(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let Some(protocol) = self.protocol.as_mut() else {
            error!("send_ssl_data: session is not initialized");
            return Err(TransportError::InvalidContext);
        };

        trace!(len = data.len(), "Writing SSL data");
        if data.is_empty() {
            error!("send_ssl_data: zero-length write");
        }

        let deadline = Instant::now() + self.config.handshake_timeout;
        self.engine.set_deadline(&mut protocol.state, Some(deadline));
        let result = loop {
            match self.engine.write(&mut protocol.state, data) {
                Ok(written) => {
                    trace!(written, "SSL data written");
                    break Ok(written);
                }
                Err(err) if err.is_want_read_or_write() => {
                    let now = Instant::now();
                    if now >= deadline {
                        error!("send_ssl_data: timed out waiting for the transport");
                        break Err(TransportError::Timeout);
                    }
                    thread::sleep(self.config.poll_interval.min(deadline - now));
                }
                Err(err) => {
                    trace!(code = err.code(), "SSL write failed");
                    let err = crate::handle_error!(err, "send_ssl_data");
                    break Err(TransportError::ProtocolFatal(err));
                }
            }
        };
        self.engine.set_deadline(&mut protocol.state, None);
        result
    }

    /// Read decrypted data once; the engine result is returned untouched.
    pub fn get_ssl_receive(&mut self, buf: &mut [u8]) -> Result<usize, EngineError> {
        let Some(protocol) = self.protocol.as_mut() else {
            return Err(EngineError::SSL_BAD_INPUT_DATA);
        };

        self.engine.read(&mut protocol.state, buf)
    }

    /// Leaf certificate presented by the peer
    pub fn peer_certificate(&self) -> Option<X509> {
        let protocol = self.protocol.as_ref()?;
        self.engine.peer_certificate(&protocol.state)
    }

    /// Run the fingerprint and/or hostname checks that are requested
    pub fn verify_peer(&self, fingerprint: Option<&str>, domain: Option<&str>) -> Result<(), TlsError> {
        if let Some(fingerprint) = fingerprint {
            if !crate::verify::verify_ssl_fingerprint(self, fingerprint, domain) {
                return Err(TlsError::VerificationFailed(
                    "certificate fingerprint mismatch".to_string(),
                ));
            }
        }

        if let Some(domain) = domain {
            if !crate::verify::verify_ssl_dn(self, domain) {
                return Err(TlsError::VerificationFailed(format!(
                    "certificate does not match {}",
                    domain
                )));
            }
        }

        Ok(())
    }

    pub(crate) fn parts_mut(&mut self) -> Option<SessionParts<'_, C, E>> {
        let protocol = self.protocol.as_mut()?;
        Some(SessionParts {
            state: &mut protocol.state,
            protocol_config: &mut protocol.config,
            config: &self.config,
            connection: self.connection.as_ref(),
            trust_anchor: self.trust_anchor.get(),
            client_identity: self.client_identity.get(),
        })
    }
}
