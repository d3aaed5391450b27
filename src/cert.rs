//! Certificate material and peer certificate inspection
//!
//! Trust anchors and client identities are parsed from PEM with OpenSSL.
//! [`CertInfo`] pulls the names used for hostname verification out of a peer
//! certificate.

use crate::error::TlsError;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509NameRef, X509Ref, X509};
use std::fs::File;
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;

/// Length of a SHA-256 certificate fingerprint
pub const FINGERPRINT_LEN: usize = 32;

/// Names extracted from a certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Subject Common Name
    pub common_name: Option<String>,
    /// Issuer Common Name
    pub issuer: Option<String>,
    /// DNS entries of the Subject Alternative Name extension
    pub dns_names: Vec<String>,
    /// IP entries of the Subject Alternative Name extension
    pub ip_addresses: Vec<IpAddr>,
}

impl CertInfo {
    /// Extract certificate information from an X.509 certificate
    pub fn from_x509(cert: &X509Ref) -> Self {
        let (dns_names, ip_addresses) = Self::get_subject_alt_names(cert);
        CertInfo {
            common_name: Self::get_cn(cert.subject_name()),
            issuer: Self::get_cn(cert.issuer_name()),
            dns_names,
            ip_addresses,
        }
    }

    fn get_cn(name: &X509NameRef) -> Option<String> {
        name.entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| entry.data().as_utf8().ok())
            .map(|s| s.to_string())
    }

    fn get_subject_alt_names(cert: &X509Ref) -> (Vec<String>, Vec<IpAddr>) {
        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();

        if let Some(sans) = cert.subject_alt_names() {
            for name in &sans {
                if let Some(dns) = name.dnsname() {
                    dns_names.push(dns.to_string());
                } else if let Some(ip) = name.ipaddress() {
                    if let Ok(octets) = <[u8; 4]>::try_from(ip) {
                        ip_addresses.push(IpAddr::from(octets));
                    } else if let Ok(octets) = <[u8; 16]>::try_from(ip) {
                        ip_addresses.push(IpAddr::from(octets));
                    }
                }
            }
        }

        (dns_names, ip_addresses)
    }
}

/// SHA-256 digest of the DER encoding of `cert`
pub fn fingerprint_sha256(cert: &X509Ref) -> Result<[u8; FINGERPRINT_LEN], TlsError> {
    let digest = cert.digest(MessageDigest::sha256())?;
    let mut out = [0u8; FINGERPRINT_LEN];
    if digest.len() != FINGERPRINT_LEN {
        return Err(TlsError::Certificate(format!(
            "unexpected digest length {}",
            digest.len()
        )));
    }
    out.copy_from_slice(&digest);
    Ok(out)
}

/// Lowercase hex rendering of a fingerprint, as accepted by
/// [`verify_ssl_fingerprint`](crate::verify::verify_ssl_fingerprint)
pub fn fingerprint_hex(cert: &X509Ref) -> Result<String, TlsError> {
    let digest = fingerprint_sha256(cert)?;
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Certificates trusted to sign the peer's chain
#[derive(Debug, Clone)]
pub struct TrustAnchor {
    certs: Vec<X509>,
}

impl TrustAnchor {
    /// Parse one or more PEM certificates
    pub fn from_pem(pem: &[u8]) -> Result<Self, TlsError> {
        let certs = X509::stack_from_pem(pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load CA certificate: {}", e)))?;
        if certs.is_empty() {
            return Err(TlsError::Certificate("No CA certificate found".to_string()));
        }
        Ok(TrustAnchor { certs })
    }

    /// Load a PEM bundle from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TlsError> {
        let mut pem = Vec::new();
        File::open(path.as_ref())?.read_to_end(&mut pem)?;
        Self::from_pem(&pem)
    }

    pub fn from_certs(certs: Vec<X509>) -> Self {
        TrustAnchor { certs }
    }

    pub fn certs(&self) -> &[X509] {
        &self.certs
    }

    pub fn into_certs(self) -> Vec<X509> {
        self.certs
    }
}

/// Client certificate and its private key
#[derive(Clone)]
pub struct ClientIdentity {
    pub certificate: X509,
    pub key: PKey<Private>,
}

impl ClientIdentity {
    /// Build an identity, checking that the key belongs to the certificate
    pub fn new(certificate: X509, key: PKey<Private>) -> Result<Self, TlsError> {
        let public = certificate.public_key()?;
        if !public.public_eq(&key) {
            return Err(TlsError::Certificate(
                "Private key does not match client certificate".to_string(),
            ));
        }
        Ok(ClientIdentity { certificate, key })
    }

    /// Parse a PEM certificate and a PEM private key
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        let certificate = X509::from_pem(cert_pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load certificate: {}", e)))?;
        let key = PKey::private_key_from_pem(key_pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load private key: {}", e)))?;
        Self::new(certificate, key)
    }
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("subject", &CertInfo::from_x509(&self.certificate).common_name)
            .finish_non_exhaustive()
    }
}
