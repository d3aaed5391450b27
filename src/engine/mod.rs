//! TLS engine capability
//!
//! The session never implements TLS itself. It drives an engine through the
//! [`TlsEngine`] trait: the engine owns the protocol state, the record
//! encryption and the handshake, and reports failures as [`EngineError`]
//! codes.

pub mod openssl_engine;

pub use openssl_engine::{OpenSslConfig, OpenSslEngine, OpenSslState};

use crate::error::EngineError;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use std::time::Instant;

/// Result of an engine read or write: a byte count or an engine code
pub type EngineResult = Result<usize, EngineError>;

/// Operations a session needs from a TLS engine
pub trait TlsEngine {
    /// Per-connection protocol state
    type State;
    /// Protocol configuration, always paired with a `State`
    type Config;
    /// Randomness source
    type Entropy;

    fn new_state(&mut self) -> Self::State;

    fn new_config(&mut self) -> Self::Config;

    fn new_entropy(&mut self) -> Self::Entropy;

    /// Encrypt and send `buf`, returning the number of plaintext bytes consumed
    fn write(&mut self, state: &mut Self::State, buf: &[u8]) -> EngineResult;

    /// Read and decrypt into `buf`.
    ///
    /// An empty `buf` is a probe: it processes pending records without
    /// consuming application data.
    fn read(&mut self, state: &mut Self::State, buf: &mut [u8]) -> EngineResult;

    /// Bound transport waits made by the engine until `deadline`; `None`
    /// restores the configured read timeout
    fn set_deadline(&mut self, _state: &mut Self::State, _deadline: Option<Instant>) {}

    /// Decrypted bytes buffered inside the engine
    fn bytes_available(&self, state: &Self::State) -> usize;

    /// Leaf certificate presented by the peer, if any
    fn peer_certificate(&self, state: &Self::State) -> Option<X509>;

    fn free_state(&mut self, state: Self::State) {
        drop(state);
    }

    fn free_config(&mut self, config: Self::Config) {
        drop(config);
    }

    fn free_entropy(&mut self, entropy: Self::Entropy) {
        drop(entropy);
    }

    fn free_certificate(&mut self, chain: Vec<X509>) {
        drop(chain);
    }

    fn free_private_key(&mut self, key: PKey<Private>) {
        drop(key);
    }
}
