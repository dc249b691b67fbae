//! Certificate pinning for the backend TLS transport.
//!
//! A pin is the SHA-256 digest of a DER certificate, written `sha256/<base64>`. A handshake
//! passes when the presented chain contains at least one pinned certificate *and* the chain
//! verifies against the bundled web PKI roots. Every rejection is recorded in a
//! [`PinViolationLog`] so the transport can tell a security failure apart from an ordinary
//! connection error without inspecting error messages.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};

use crate::error::{SinomanError, SinomanResult};

const PIN_PREFIX: &str = "sha256/";

/// SHA-256 fingerprint of a DER encoded certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CertificatePin([u8; 32]);

impl CertificatePin {
    /// Computes the pin of a DER encoded certificate.
    #[must_use]
    pub fn from_der(der: &[u8]) -> Self {
        Self(Sha256::digest(der).into())
    }

    /// Raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for CertificatePin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PIN_PREFIX}{}", STANDARD.encode(self.0))
    }
}

impl FromStr for CertificatePin {
    type Err = SinomanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s.trim().strip_prefix(PIN_PREFIX).ok_or_else(|| {
            SinomanError::configuration("cert_pins", format!("pin must start with `{PIN_PREFIX}`"))
        })?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|err| SinomanError::configuration("cert_pins", err.to_string()))?;
        let digest: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            SinomanError::configuration(
                "cert_pins",
                format!("pin must be a 32 byte digest, got {} bytes", bytes.len()),
            )
        })?;
        Ok(Self(digest))
    }
}

/// The set of certificates the client accepts for the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinSet {
    pins: HashSet<CertificatePin>,
}

impl PinSet {
    /// Builds a set from individual pins.
    #[must_use]
    pub fn new(pins: impl IntoIterator<Item = CertificatePin>) -> Self {
        Self {
            pins: pins.into_iter().collect(),
        }
    }

    /// Parses a comma separated list of `sha256/<base64>` pins. Blank entries are ignored.
    ///
    /// # Errors
    /// Returns a configuration error if any entry is malformed.
    pub fn parse_list(list: &str) -> SinomanResult<Self> {
        let pins = list
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(CertificatePin::from_str)
            .collect::<SinomanResult<HashSet<_>>>()?;
        Ok(Self { pins })
    }

    /// Number of pins in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pins.len()
    }

    /// Whether the set holds no pins.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    /// Whether `pin` is part of the set.
    #[must_use]
    pub fn contains(&self, pin: &CertificatePin) -> bool {
        self.pins.contains(pin)
    }

    /// Whether the leaf or any intermediate of a presented chain is pinned.
    #[must_use]
    pub fn matches_chain(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
    ) -> bool {
        std::iter::once(end_entity)
            .chain(intermediates)
            .any(|cert| self.contains(&CertificatePin::from_der(cert.as_ref())))
    }
}

/// Hosts whose certificates were rejected, with the verifier's reason.
///
/// A host stays flagged until a request to it succeeds again, so every failure in between is
/// reported as a security error.
#[derive(Debug, Default)]
pub struct PinViolationLog {
    entries: Mutex<HashMap<String, String>>,
}

impl PinViolationLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags `host` as having presented an unacceptable certificate.
    pub fn record(&self, host: &str, reason: impl Into<String>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(normalize_host(host), reason.into());
        }
    }

    /// Returns the recorded reason if `host` is flagged.
    #[must_use]
    pub fn violation_for(&self, host: &str) -> Option<String> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(&normalize_host(host)).cloned())
    }

    /// Clears the flag for `host` after a successful pinned exchange.
    pub fn clear(&self, host: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&normalize_host(host));
        }
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase()
}

/// `rustls` verifier enforcing the pin set on top of standard web PKI validation.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    pins: PinSet,
    inner: Arc<WebPkiServerVerifier>,
    violations: Arc<PinViolationLog>,
}

impl PinnedCertVerifier {
    /// Creates a verifier backed by the bundled web PKI roots.
    ///
    /// # Errors
    /// Returns a configuration error if the pin set is empty or the root store cannot be built.
    pub fn new(pins: PinSet, violations: Arc<PinViolationLog>) -> SinomanResult<Self> {
        if pins.is_empty() {
            return Err(SinomanError::configuration(
                "cert_pins",
                "at least one certificate pin is required",
            ));
        }
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let inner = WebPkiServerVerifier::builder_with_provider(
            Arc::new(roots),
            Arc::new(rustls::crypto::ring::default_provider()),
        )
        .build()
        .map_err(|err| SinomanError::configuration("cert_pins", err.to_string()))?;

        Ok(Self {
            pins,
            inner,
            violations,
        })
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let host = server_host(server_name);

        if !self.pins.matches_chain(end_entity, intermediates) {
            let presented = CertificatePin::from_der(end_entity.as_ref());
            log::error!("certificate for {host} is not pinned (presented {presented})");
            self.violations.record(
                &host,
                format!("certificate {presented} is not in the pinned set"),
            );
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ));
        }

        self.inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            .inspect_err(|err| {
                log::error!("certificate chain for {host} rejected: {err}");
                self.violations.record(&host, err.to_string());
            })
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Builds a `rustls` client configuration that only completes handshakes with pinned servers.
///
/// # Errors
/// Returns a configuration error if the verifier or protocol versions cannot be set up.
pub fn pinned_tls_config(
    pins: PinSet,
    violations: Arc<PinViolationLog>,
) -> SinomanResult<rustls::ClientConfig> {
    let verifier = PinnedCertVerifier::new(pins, violations)?;
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|err| SinomanError::configuration("tls", err.to_string()))?
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(verifier))
    .with_no_client_auth();
    Ok(config)
}

fn server_host(server_name: &ServerName<'_>) -> String {
    match server_name {
        ServerName::DnsName(name) => name.as_ref().to_ascii_lowercase(),
        ServerName::IpAddress(ip) => std::net::IpAddr::from(*ip).to_string(),
        _ => "<unknown>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEAF: &[u8] = b"not really a certificate, but hashable";

    fn verifier(pins: PinSet) -> (PinnedCertVerifier, Arc<PinViolationLog>) {
        let log = Arc::new(PinViolationLog::new());
        let verifier = PinnedCertVerifier::new(pins, Arc::clone(&log)).unwrap();
        (verifier, log)
    }

    #[test]
    fn test_pin_display_round_trips_through_parse() {
        let pin = CertificatePin::from_der(LEAF);
        let rendered = pin.to_string();
        assert!(rendered.starts_with("sha256/"));
        assert_eq!(rendered.parse::<CertificatePin>().unwrap(), pin);
    }

    #[test]
    fn test_parse_rejects_malformed_pins() {
        assert!("md5/abcd".parse::<CertificatePin>().is_err());
        assert!("sha256/!!!".parse::<CertificatePin>().is_err());
        // valid base64, wrong digest length
        assert!("sha256/AAAA".parse::<CertificatePin>().is_err());
    }

    #[test]
    fn test_parse_list_skips_blank_entries() {
        let a = CertificatePin::from_der(b"a");
        let b = CertificatePin::from_der(b"b");
        let set = PinSet::parse_list(&format!(" {a}, ,{b},")).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&a));
        assert!(set.contains(&b));
    }

    #[test]
    fn test_matches_chain_on_intermediate() {
        let set = PinSet::new([CertificatePin::from_der(b"intermediate")]);
        let leaf = CertificateDer::from(b"leaf".to_vec());
        let intermediate = CertificateDer::from(b"intermediate".to_vec());
        assert!(set.matches_chain(&leaf, &[intermediate]));
        assert!(!set.matches_chain(&leaf, &[]));
    }

    #[test]
    fn test_empty_pin_set_is_rejected() {
        let err = PinnedCertVerifier::new(PinSet::default(), Arc::new(PinViolationLog::new()))
            .unwrap_err();
        assert!(matches!(err, SinomanError::Configuration { .. }));
    }

    #[test]
    fn test_unpinned_certificate_fails_closed_and_is_recorded() {
        let (verifier, log) = verifier(PinSet::new([CertificatePin::from_der(b"other")]));
        let server_name = ServerName::try_from("api.example.org").unwrap();

        let result = verifier.verify_server_cert(
            &CertificateDer::from(LEAF.to_vec()),
            &[],
            &server_name,
            &[],
            UnixTime::now(),
        );

        assert!(matches!(
            result,
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure
            ))
        ));
        assert!(log.violation_for("API.example.org").is_some());
    }

    #[test]
    fn test_pinned_but_invalid_chain_is_still_a_violation() {
        let (verifier, log) = verifier(PinSet::new([CertificatePin::from_der(LEAF)]));
        let server_name = ServerName::try_from("api.example.org").unwrap();

        let result = verifier.verify_server_cert(
            &CertificateDer::from(LEAF.to_vec()),
            &[],
            &server_name,
            &[],
            UnixTime::now(),
        );

        let err = result.unwrap_err();
        assert!(!matches!(
            err,
            rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
        ));
        assert!(log.violation_for("api.example.org").is_some());
    }

    #[test]
    fn test_violation_log_clear() {
        let log = PinViolationLog::new();
        log.record("[::1]", "bad cert");
        assert_eq!(log.violation_for("::1").as_deref(), Some("bad cert"));
        log.clear("::1");
        assert!(log.violation_for("::1").is_none());
    }

    #[test]
    fn test_pinned_tls_config_builds() {
        let pins = PinSet::new([CertificatePin::from_der(LEAF)]);
        assert!(pinned_tls_config(pins, Arc::new(PinViolationLog::new())).is_ok());
    }
}
