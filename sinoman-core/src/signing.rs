//! HMAC request signing.
//!
//! Every request to the backend carries an `x-signature` header: the lower-case hex
//! HMAC-SHA256 over the canonical message
//!
//! ```text
//! METHOD "\n" URL "\n" BODY
//! ```
//!
//! where `METHOD` is upper-case, `URL` is the full request URL exactly as sent and `BODY`
//! is the raw serialized body (empty when the request has none).

use hmac::{Hmac, Mac};
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use crate::error::{SinomanError, SinomanResult};

/// Header carrying the request signature.
pub const SIGNATURE_HEADER: &str = "x-signature";

type HmacSha256 = Hmac<Sha256>;

/// Signs outgoing requests with the shared backend key.
#[derive(Clone)]
pub struct RequestSigner {
    mac: HmacSha256,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner").finish_non_exhaustive()
    }
}

impl RequestSigner {
    /// Creates a signer from the shared signing key.
    ///
    /// # Errors
    /// Returns a configuration error if the key is empty. A missing key is a startup failure,
    /// not something to discover on the first request.
    pub fn new(key: &SecretString) -> SinomanResult<Self> {
        Self::from_bytes(key.expose_secret().as_bytes())
    }

    /// Creates a signer from raw key bytes.
    ///
    /// # Errors
    /// Returns a configuration error if the key is empty.
    pub fn from_bytes(key: &[u8]) -> SinomanResult<Self> {
        if key.is_empty() {
            return Err(SinomanError::configuration(
                "signing_key",
                "signing key must not be empty",
            ));
        }
        let mac = HmacSha256::new_from_slice(key)
            .map_err(|err| SinomanError::configuration("signing_key", err.to_string()))?;
        Ok(Self { mac })
    }

    /// Computes the signature header value for a request.
    #[must_use]
    pub fn sign(&self, method: &Method, url: &str, body: Option<&[u8]>) -> String {
        let mut mac = self.mac.clone();
        mac.update(&canonical_message(method, url, body));
        hex::encode(mac.finalize().into_bytes())
    }

    /// Checks a signature header value in constant time.
    #[must_use]
    pub fn verify(
        &self,
        method: &Method,
        url: &str,
        body: Option<&[u8]>,
        signature: &str,
    ) -> bool {
        let Ok(expected) = hex::decode(signature.trim()) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(&canonical_message(method, url, body));
        mac.verify_slice(&expected).is_ok()
    }
}

/// Builds the byte string covered by the signature.
#[must_use]
pub fn canonical_message(method: &Method, url: &str, body: Option<&[u8]>) -> Vec<u8> {
    let method = method.as_str().to_ascii_uppercase();
    let body = body.unwrap_or_default();
    let mut message = Vec::with_capacity(method.len() + url.len() + body.len() + 2);
    message.extend_from_slice(method.as_bytes());
    message.push(b'\n');
    message.extend_from_slice(url.as_bytes());
    message.push(b'\n');
    message.extend_from_slice(body);
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> RequestSigner {
        RequestSigner::new(&SecretString::from("test-signing-key".to_string())).unwrap()
    }

    #[test]
    fn test_hmac_sha256_known_vector() {
        // RFC 4231, test case 2
        let signer = RequestSigner::from_bytes(b"Jefe").unwrap();
        let mut mac = signer.mac.clone();
        mac.update(b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(mac.finalize().into_bytes()),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_canonical_message_layout() {
        let message = canonical_message(
            &Method::POST,
            "https://api.example.org/rest/v1/transactions",
            Some(br#"{"amount":"10.00"}"#),
        );
        assert_eq!(
            message,
            b"POST\nhttps://api.example.org/rest/v1/transactions\n{\"amount\":\"10.00\"}".to_vec()
        );

        let message = canonical_message(&Method::GET, "https://api.example.org/x", None);
        assert_eq!(message, b"GET\nhttps://api.example.org/x\n".to_vec());
    }

    #[test]
    fn test_sign_then_verify() {
        let signer = signer();
        let body = br#"{"merchant_id":"m-1"}"#;
        let url = "https://api.example.org/functions/v1/process-qr-payment";
        let signature = signer.sign(&Method::POST, url, Some(body));

        assert_eq!(signature.len(), 64);
        assert!(signer.verify(&Method::POST, url, Some(body), &signature));
        assert!(!signer.verify(&Method::PUT, url, Some(body), &signature));
        assert!(!signer.verify(&Method::POST, url, Some(b"{}"), &signature));
        assert!(!signer.verify(&Method::POST, url, Some(body), "not-hex"));
    }

    #[test]
    fn test_missing_body_equals_empty_body() {
        let signer = signer();
        let url = "https://api.example.org/rest/v1/profiles";
        assert_eq!(
            signer.sign(&Method::GET, url, None),
            signer.sign(&Method::GET, url, Some(b""))
        );
    }

    #[test]
    fn test_different_keys_produce_different_signatures() {
        let other = RequestSigner::from_bytes(b"another-key").unwrap();
        let url = "https://api.example.org/rest/v1/profiles";
        assert_ne!(
            signer().sign(&Method::GET, url, None),
            other.sign(&Method::GET, url, None)
        );
    }

    #[test]
    fn test_empty_key_is_configuration_error() {
        let err = RequestSigner::new(&SecretString::from(String::new())).unwrap_err();
        assert!(matches!(err, SinomanError::Configuration { .. }));
    }
}
