//! Session configuration
//!
//! Timeouts bounding the poll and retry loops, plus the handshake options
//! handed to the engine.

use crate::error::TlsError;
use std::time::Duration;

/// Default bound on handshake and record-layer retry loops
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time a transport read waits for data
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Default sleep between two retries of a blocked engine call
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Session configuration (immutable after building)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub(crate) handshake_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) poll_interval: Duration,
    pub(crate) verify_peer: bool,
    pub(crate) servername: Option<String>,
    pub(crate) alpn: Vec<String>,
}

impl SessionConfig {
    /// Create a new configuration builder
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn verify_peer(&self) -> bool {
        self.verify_peer
    }

    pub fn servername(&self) -> Option<&str> {
        self.servername.as_deref()
    }

    pub fn alpn(&self) -> &[String] {
        &self.alpn
    }

    /// ALPN protocols in wire format (each entry length-prefixed)
    pub fn alpn_wire(&self) -> Vec<u8> {
        let mut alpn_bytes = Vec::new();
        for proto in &self.alpn {
            alpn_bytes.push(proto.len() as u8);
            alpn_bytes.extend_from_slice(proto.as_bytes());
        }
        alpn_bytes
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            verify_peer: false,
            servername: None,
            alpn: Vec::new(),
        }
    }
}

/// Session configuration builder
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    fn new() -> Self {
        SessionConfigBuilder {
            config: SessionConfig::default(),
        }
    }

    /// Bound on the handshake and on `send_ssl_data` retries
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Time a transport read waits for bytes before reporting "want read"
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Sleep between retries of a blocked engine call
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Enable/disable chain verification against the system trust store
    /// when no trust anchor is attached
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.config.verify_peer = verify;
        self
    }

    /// Set SNI servername (defaults to the host given to the handshake)
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.config.servername = Some(name.into());
        self
    }

    /// Set ALPN protocols, most preferred first
    pub fn alpn(mut self, protocols: &[&str]) -> Self {
        self.config.alpn = protocols.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<SessionConfig, TlsError> {
        let config = self.config;

        if config.handshake_timeout.is_zero() {
            return Err(TlsError::InvalidConfig("handshake timeout must be non-zero".to_string()));
        }
        if config.read_timeout.is_zero() {
            return Err(TlsError::InvalidConfig("read timeout must be non-zero".to_string()));
        }
        if config.poll_interval > config.handshake_timeout {
            return Err(TlsError::InvalidConfig(
                "poll interval exceeds handshake timeout".to_string(),
            ));
        }
        if let Some(proto) = config.alpn.iter().find(|p| p.is_empty() || p.len() > 255) {
            return Err(TlsError::InvalidConfig(format!("invalid ALPN protocol: {:?}", proto)));
        }

        Ok(config)
    }
}
