//! Peer identity verification
//!
//! Two independent checks run once the handshake is done: a pinned SHA-256
//! fingerprint of the peer's leaf certificate, and a hostname match against
//! the certificate's DNS Subject Alternative Names, falling back to its
//! Common Name.

use crate::cert::{fingerprint_sha256, CertInfo, FINGERPRINT_LEN};
use crate::engine::TlsEngine;
use crate::session::Session;
use crate::transport::Connection;
use tracing::{debug, error};

/// Value of one ASCII hex digit, either case
pub fn parse_hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Decode a 64 character hex string into a SHA-256 fingerprint
pub fn decode_fingerprint(hex: &str) -> Option<[u8; FINGERPRINT_LEN]> {
    let bytes = hex.as_bytes();
    if bytes.len() != FINGERPRINT_LEN * 2 {
        return None;
    }

    let mut out = [0u8; FINGERPRINT_LEN];
    for (byte, pair) in out.iter_mut().zip(bytes.chunks_exact(2)) {
        let high = parse_hex_nibble(pair[0])?;
        let low = parse_hex_nibble(pair[1])?;
        *byte = (high << 4) | low;
    }
    Some(out)
}

/// Match a certificate name against a hostname.
///
/// A wildcard is only honoured as the whole leftmost label (`*.example.com`)
/// and stands for exactly one non-empty label; it never matches the bare
/// parent domain. The remaining labels compare byte for byte.
pub fn match_name(pattern: &str, hostname: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == hostname;
    }

    let Some(suffix) = pattern.strip_prefix("*.") else {
        return false;
    };
    if suffix.is_empty() || suffix.contains('*') {
        return false;
    }

    match hostname.split_once('.') {
        Some((label, rest)) => !label.is_empty() && rest == suffix,
        None => false,
    }
}

/// Compare the peer certificate's SHA-256 digest with a pinned fingerprint.
///
/// The fingerprint is validated before the peer certificate is looked at.
/// `_domain` is accepted for call compatibility and has no effect.
pub fn verify_ssl_fingerprint<C: Connection, E: TlsEngine>(
    session: &Session<C, E>,
    fingerprint: &str,
    _domain: Option<&str>,
) -> bool {
    let Some(expected) = decode_fingerprint(fingerprint) else {
        debug!("fingerprint is not {} hex digits", FINGERPRINT_LEN * 2);
        return false;
    };

    let Some(cert) = session.peer_certificate() else {
        debug!("could not fetch peer certificate");
        return false;
    };

    match fingerprint_sha256(&cert) {
        Ok(actual) => openssl::memcmp::eq(&actual, &expected),
        Err(e) => {
            error!(error = %e, "could not compute certificate fingerprint");
            false
        }
    }
}

/// Check that the peer certificate is valid for `domain`.
pub fn verify_ssl_dn<C: Connection, E: TlsEngine>(session: &Session<C, E>, domain: &str) -> bool {
    if domain.is_empty() {
        return false;
    }

    let Some(cert) = session.peer_certificate() else {
        debug!("could not fetch peer certificate");
        return false;
    };

    let info = CertInfo::from_x509(&cert);
    if info.dns_names.iter().any(|name| match_name(name, domain)) {
        return true;
    }

    info.common_name
        .as_deref()
        .is_some_and(|cn| match_name(cn, domain))
}
