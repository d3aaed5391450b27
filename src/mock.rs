//! Mock implementations for testing.
//!
//! Scripted connection and engine doubles, a log capture layer for asserting
//! which diagnostics were emitted, and a self-signed certificate generator.

use crate::engine::{EngineResult, TlsEngine};
use crate::error::{EngineError, TlsError};
use crate::transport::Connection;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

/// Take the next scripted value; the last one repeats once the script runs out
fn next_sticky<T: Copy>(script: &mut VecDeque<T>) -> Option<T> {
    if script.len() > 1 {
        script.pop_front()
    } else {
        script.front().copied()
    }
}

/// Scripted [`Connection`]
///
/// Write results are consumed in order and return 0 once exhausted. Read
/// and `available()` results repeat their last value.
#[derive(Debug, Default)]
pub struct MockConnection {
    connected: bool,
    writes: VecDeque<usize>,
    reads: VecDeque<usize>,
    available: VecDeque<usize>,
    fail_reads: bool,
    close_after_polls: Option<usize>,
    /// Every byte accepted by `write`
    pub written: Vec<u8>,
    pub write_calls: usize,
    pub read_calls: usize,
    pub available_calls: usize,
    pub close_calls: usize,
}

impl MockConnection {
    pub fn connected() -> Self {
        MockConnection {
            connected: true,
            ..Default::default()
        }
    }

    pub fn disconnected() -> Self {
        MockConnection::default()
    }

    /// Number of bytes each successive `write` accepts
    pub fn with_writes(mut self, writes: &[usize]) -> Self {
        self.writes = writes.iter().copied().collect();
        self
    }

    /// Number of bytes each successive `read` produces
    pub fn with_reads(mut self, reads: &[usize]) -> Self {
        self.reads = reads.iter().copied().collect();
        self
    }

    /// Values reported by successive `available()` calls
    pub fn with_available(mut self, available: &[usize]) -> Self {
        self.available = available.iter().copied().collect();
        self
    }

    /// Drop the connection once `available()` has been polled `polls` times
    pub fn closing_after_polls(mut self, polls: usize) -> Self {
        self.close_after_polls = Some(polls);
        self
    }

    /// Make every `read` fail with an I/O error
    pub fn failing_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }
}

impl Connection for MockConnection {
    fn is_connected(&mut self) -> bool {
        self.connected
    }

    fn available(&mut self) -> usize {
        self.available_calls += 1;
        if self.close_after_polls.is_some_and(|polls| self.available_calls >= polls) {
            self.connected = false;
        }
        next_sticky(&mut self.available).unwrap_or(0)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_calls += 1;
        if self.fail_reads {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "scripted read failure"));
        }
        let n = next_sticky(&mut self.reads).unwrap_or(0).min(buf.len());
        buf[..n].fill(0xA5);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        self.write_calls += 1;
        let n = self.writes.pop_front().unwrap_or(0).min(buf.len());
        self.written.extend_from_slice(&buf[..n]);
        n
    }

    fn close(&mut self) {
        self.close_calls += 1;
        self.connected = false;
    }
}

/// Calls made on a [`MockEngine`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineCalls {
    pub states_created: usize,
    pub configs_created: usize,
    pub entropy_created: usize,
    pub writes: usize,
    pub reads: usize,
    pub deadlines_set: usize,
    pub deadlines_cleared: usize,
    pub states_freed: usize,
    pub configs_freed: usize,
    pub entropy_freed: usize,
    pub certificates_freed: usize,
    pub keys_freed: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub struct MockState(pub usize);

#[derive(Debug, PartialEq, Eq)]
pub struct MockConfig;

#[derive(Debug, PartialEq, Eq)]
pub struct MockEntropy;

/// Scripted [`TlsEngine`]
///
/// Write and read results repeat their last value once the script runs out;
/// an empty script succeeds with the full buffer length.
#[derive(Default)]
pub struct MockEngine {
    writes: VecDeque<EngineResult>,
    reads: VecDeque<EngineResult>,
    bytes_available: usize,
    peer: Option<X509>,
    peer_lookups: Cell<usize>,
    pub calls: EngineCalls,
}

impl MockEngine {
    pub fn new() -> Self {
        MockEngine::default()
    }

    pub fn with_writes(mut self, writes: Vec<Result<usize, EngineError>>) -> Self {
        self.writes = writes.into();
        self
    }

    pub fn with_reads(mut self, reads: Vec<Result<usize, EngineError>>) -> Self {
        self.reads = reads.into();
        self
    }

    pub fn with_bytes_available(mut self, bytes: usize) -> Self {
        self.bytes_available = bytes;
        self
    }

    pub fn with_peer_certificate(mut self, peer: Option<X509>) -> Self {
        self.peer = peer;
        self
    }

    /// How many times the peer certificate was asked for
    pub fn peer_lookups(&self) -> usize {
        self.peer_lookups.get()
    }
}

impl TlsEngine for MockEngine {
    type State = MockState;
    type Config = MockConfig;
    type Entropy = MockEntropy;

    fn new_state(&mut self) -> MockState {
        self.calls.states_created += 1;
        MockState(self.calls.states_created)
    }

    fn new_config(&mut self) -> MockConfig {
        self.calls.configs_created += 1;
        MockConfig
    }

    fn new_entropy(&mut self) -> MockEntropy {
        self.calls.entropy_created += 1;
        MockEntropy
    }

    fn write(&mut self, _state: &mut MockState, buf: &[u8]) -> EngineResult {
        self.calls.writes += 1;
        next_sticky(&mut self.writes).unwrap_or(Ok(buf.len()))
    }

    fn read(&mut self, _state: &mut MockState, buf: &mut [u8]) -> EngineResult {
        self.calls.reads += 1;
        next_sticky(&mut self.reads).unwrap_or(Ok(buf.len()))
    }

    fn set_deadline(&mut self, _state: &mut MockState, deadline: Option<Instant>) {
        match deadline {
            Some(_) => self.calls.deadlines_set += 1,
            None => self.calls.deadlines_cleared += 1,
        }
    }

    fn bytes_available(&self, _state: &MockState) -> usize {
        self.bytes_available
    }

    fn peer_certificate(&self, _state: &MockState) -> Option<X509> {
        self.peer_lookups.set(self.peer_lookups.get() + 1);
        self.peer.clone()
    }

    fn free_state(&mut self, _state: MockState) {
        self.calls.states_freed += 1;
    }

    fn free_config(&mut self, _config: MockConfig) {
        self.calls.configs_freed += 1;
    }

    fn free_entropy(&mut self, _entropy: MockEntropy) {
        self.calls.entropy_freed += 1;
    }

    fn free_certificate(&mut self, _chain: Vec<X509>) {
        self.calls.certificates_freed += 1;
    }

    fn free_private_key(&mut self, _key: PKey<Private>) {
        self.calls.keys_freed += 1;
    }
}

/// A diagnostic recorded by [`LogCapture`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedEvent {
    pub level: Level,
    pub message: String,
}

/// `tracing` layer recording every event emitted while it is installed
#[derive(Clone, Default)]
pub struct LogCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl LogCapture {
    /// Run `f` with a capturing subscriber installed on this thread
    pub fn capture<T>(f: impl FnOnce() -> T) -> (T, LogCapture) {
        let capture = LogCapture::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());
        let result = tracing::subscriber::with_default(subscriber, f);
        (result, capture)
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of events emitted at exactly `level`
    pub fn count(&self, level: Level) -> usize {
        self.events().iter().filter(|e| e.level == level).count()
    }

    /// Messages of the events emitted at exactly `level`
    pub fn messages(&self, level: Level) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.level == level)
            .map(|e| e.message)
            .collect()
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0 = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        }
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CapturedEvent {
                level: *event.metadata().level(),
                message: visitor.0,
            });
    }
}

/// Certificate and key produced by [`self_signed`]
pub struct TestCert {
    pub cert: X509,
    pub key: PKey<Private>,
}

/// Generate a self-signed P-256 certificate with the given CN and DNS SANs
pub fn self_signed(common_name: Option<&str>, dns_names: &[&str]) -> Result<TestCert, TlsError> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let key = PKey::from_ec_key(EcKey::generate(&group)?)?;

    let mut name = X509NameBuilder::new()?;
    if let Some(cn) = common_name {
        name.append_entry_by_nid(Nid::COMMONNAME, cn)?;
    }
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = serial.to_asn1_integer()?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(30)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    if !dns_names.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for dns in dns_names {
            san.dns(dns);
        }
        let extension = san.build(&builder.x509v3_context(None, None))?;
        builder.append_extension(extension)?;
    }

    builder.sign(&key, MessageDigest::sha256())?;
    Ok(TestCert {
        cert: builder.build(),
        key,
    })
}
