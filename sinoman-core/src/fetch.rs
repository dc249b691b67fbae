//! The signing and pinning fetch wrapper every backend call goes through.

use std::sync::Arc;

use crate::error::{SinomanError, SinomanResult};
use crate::signing::{RequestSigner, SIGNATURE_HEADER};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

/// Signs each request and sends it over the pinned transport.
///
/// A certificate rejection on the pinned transport surfaces as
/// [`SinomanError::Security`](crate::SinomanError::Security) and is never followed by a
/// request over the fallback transport. Other transport failures are retried by the transport
/// itself and, only when a fallback is configured, sent once more over the fallback.
pub struct SecureFetch {
    signer: RequestSigner,
    pinned: Arc<dyn HttpTransport>,
    fallback: Option<Arc<dyn HttpTransport>>,
}

impl SecureFetch {
    /// Creates a wrapper that never leaves the pinned transport.
    #[must_use]
    pub fn new(signer: RequestSigner, pinned: Arc<dyn HttpTransport>) -> Self {
        Self {
            signer,
            pinned,
            fallback: None,
        }
    }

    /// Allows non-security transport failures to be retried over `fallback`.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn HttpTransport>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Returns `request` with its URL in canonical form and the signature header attached.
    ///
    /// The URL is rewritten the way the HTTP client would serialize it (percent-encoded path
    /// and query, lower-case host, no default port), so the signed string is the one sent.
    ///
    /// # Errors
    /// Returns an input error if the URL cannot be parsed.
    pub fn sign(&self, mut request: HttpRequest) -> SinomanResult<HttpRequest> {
        request.url = reqwest::Url::parse(&request.url)
            .map_err(|err| SinomanError::invalid_input("url", err.to_string()))?
            .to_string();
        let signature =
            self.signer
                .sign(&request.method, &request.url, request.body.as_deref());
        request.set_header(SIGNATURE_HEADER, signature);
        Ok(request)
    }

    /// Signs and sends a request.
    ///
    /// # Errors
    /// Returns [`SinomanError::Security`](crate::SinomanError::Security) on certificate
    /// rejection, [`SinomanError::Network`](crate::SinomanError::Network) when the request
    /// could not be delivered and an input error for an unparseable URL.
    pub async fn fetch(&self, request: HttpRequest) -> SinomanResult<HttpResponse> {
        let request = self.sign(request)?;

        let err = match self.pinned.execute(&request).await {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };

        if err.is_security() {
            log::error!(
                "refusing {} {}: {err}; not falling back to an unpinned transport",
                request.method,
                request.url
            );
            return Err(err.into());
        }

        let Some(fallback) = &self.fallback else {
            return Err(err.into());
        };

        log::warn!(
            "pinned transport failed for {} {} ({err}); retrying over fallback transport",
            request.method,
            request.url
        );
        fallback.execute(&request).await.map_err(Into::into)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use std::time::Duration;

    use async_trait::async_trait;
    use mockito::Matcher;
    use reqwest::Method;

    use super::*;
    use crate::pinning::{CertificatePin, PinSet};
    use crate::transport::tests::self_signed_server;
    use crate::transport::{ReqwestTransport, TransportError};

    /// Records every request and answers from a scripted list (default: empty 200).
    #[derive(Default)]
    pub struct RecordingTransport {
        pub requests: Mutex<Vec<HttpRequest>>,
        pub script: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    }

    impl RecordingTransport {
        pub fn with_script(
            script: impl IntoIterator<Item = Result<HttpResponse, TransportError>>,
        ) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                script: Mutex::new(script.into_iter().collect()),
            }
        }

        pub fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub fn last(&self) -> HttpRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl HttpTransport for RecordingTransport {
        async fn execute(
            &self,
            request: &HttpRequest,
        ) -> Result<HttpResponse, TransportError> {
            self.requests.lock().unwrap().push(request.clone());
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(HttpResponse {
                status: 200,
                body: b"{}".to_vec(),
            }))
        }
    }

    fn signer() -> RequestSigner {
        RequestSigner::from_bytes(b"shared-secret").unwrap()
    }

    fn pin_violation() -> TransportError {
        TransportError::PinViolation {
            host: "api.example.org".to_string(),
            reason: "certificate not pinned".to_string(),
        }
    }

    fn connect_error() -> TransportError {
        TransportError::Connect {
            url: "https://api.example.org/rest/v1/transactions".to_string(),
            error: "connection refused".to_string(),
        }
    }

    #[tokio::test]
    async fn test_every_request_carries_a_verifiable_signature() {
        let pinned = Arc::new(RecordingTransport::default());
        let fetch = SecureFetch::new(signer(), pinned.clone());

        let requests = [
            HttpRequest::new(Method::GET, "https://api.example.org/rest/v1/profiles?id=eq.1"),
            HttpRequest::new(Method::POST, "https://api.example.org/rest/v1/transactions")
                .json(&serde_json::json!({ "amount": "15000.00" }))
                .unwrap(),
            HttpRequest::new(Method::DELETE, "https://api.example.org/rest/v1/cart?id=eq.9"),
        ];
        for request in requests {
            fetch.fetch(request).await.unwrap();
            let sent = pinned.last();
            let header = sent.header_value(SIGNATURE_HEADER).expect("signature header");
            assert!(signer().verify(&sent.method, &sent.url, sent.body.as_deref(), header));
        }
        assert_eq!(pinned.calls(), 3);
    }

    #[tokio::test]
    async fn test_existing_signature_header_is_replaced() {
        let pinned = Arc::new(RecordingTransport::default());
        let fetch = SecureFetch::new(signer(), pinned.clone());

        let request = HttpRequest::new(Method::GET, "https://api.example.org/x")
            .header(SIGNATURE_HEADER, "forged");
        fetch.fetch(request).await.unwrap();

        let sent = pinned.last();
        let values: Vec<_> = sent
            .headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case(SIGNATURE_HEADER))
            .collect();
        assert_eq!(values.len(), 1);
        assert_ne!(values[0].1, "forged");
    }

    #[tokio::test]
    async fn test_pin_violation_never_reaches_fallback() {
        let pinned = Arc::new(RecordingTransport::with_script([Err(pin_violation())]));
        let fallback = Arc::new(RecordingTransport::default());
        let fetch = SecureFetch::new(signer(), pinned.clone()).with_fallback(fallback.clone());

        let err = fetch
            .fetch(HttpRequest::new(Method::GET, "https://api.example.org/rest/v1/x"))
            .await
            .unwrap_err();

        assert!(matches!(err, SinomanError::Security { .. }));
        assert_eq!(pinned.calls(), 1);
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_falls_back_with_signature() {
        let pinned = Arc::new(RecordingTransport::with_script([Err(connect_error())]));
        let fallback = Arc::new(RecordingTransport::default());
        let fetch = SecureFetch::new(signer(), pinned.clone()).with_fallback(fallback.clone());

        let response = fetch
            .fetch(HttpRequest::new(Method::GET, "https://api.example.org/rest/v1/x"))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(fallback.calls(), 1);
        let sent = fallback.last();
        assert!(sent.header_value(SIGNATURE_HEADER).is_some());
    }

    #[tokio::test]
    async fn test_connect_failure_without_fallback_is_network_error() {
        let pinned = Arc::new(RecordingTransport::with_script([Err(connect_error())]));
        let fetch = SecureFetch::new(signer(), pinned.clone());

        let err = fetch
            .fetch(HttpRequest::new(Method::GET, "https://api.example.org/rest/v1/x"))
            .await
            .unwrap_err();

        assert!(err.is_transport());
    }

    #[test]
    fn test_sign_canonicalizes_the_url() {
        let fetch = SecureFetch::new(signer(), Arc::new(RecordingTransport::default()));
        let signed = fetch
            .sign(HttpRequest::new(
                Method::GET,
                "HTTPS://API.Example.org:443/rest/v1/my table?id=eq.ä",
            ))
            .unwrap();

        assert_eq!(
            signed.url,
            "https://api.example.org/rest/v1/my%20table?id=eq.%C3%A4"
        );
        let header = signed.header_value(SIGNATURE_HEADER).unwrap();
        assert!(signer().verify(&Method::GET, &signed.url, None, header));
    }

    #[test]
    fn test_sign_rejects_unparseable_url() {
        let fetch = SecureFetch::new(signer(), Arc::new(RecordingTransport::default()));
        let err = fetch
            .sign(HttpRequest::new(Method::GET, "not a url"))
            .unwrap_err();
        assert!(matches!(err, SinomanError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_server_verifies_signature_of_the_received_url() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let mock = server
            .mock("GET", Matcher::Any)
            .with_body_from_request({
                let base = base.clone();
                move |request| {
                    let url = format!("{base}{}", request.path_and_query());
                    let verified = request
                        .header(SIGNATURE_HEADER)
                        .first()
                        .and_then(|value| value.to_str().ok())
                        .is_some_and(|value| signer().verify(&Method::GET, &url, None, value));
                    if verified {
                        b"verified".to_vec()
                    } else {
                        b"rejected".to_vec()
                    }
                }
            })
            .create_async()
            .await;

        let transport = ReqwestTransport::standard(Duration::from_secs(2), 0).unwrap();
        let fetch = SecureFetch::new(signer(), Arc::new(transport));
        let response = fetch
            .fetch(HttpRequest::new(
                Method::GET,
                format!("{base}/rest/v1/my table?id=eq.ä"),
            ))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.text(), "verified");
    }

    #[tokio::test]
    async fn test_rejected_certificate_never_reaches_fallback() {
        let (port, _) = self_signed_server().await;
        let pins = PinSet::new([CertificatePin::from_der(b"some other certificate")]);
        let pinned = ReqwestTransport::pinned(pins, Duration::from_secs(5), 2).unwrap();
        let fallback = Arc::new(RecordingTransport::default());
        let fetch = SecureFetch::new(signer(), Arc::new(pinned)).with_fallback(fallback.clone());

        let err = fetch
            .fetch(HttpRequest::new(
                Method::GET,
                format!("https://localhost:{port}/rest/v1/profiles"),
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, SinomanError::Security { .. }), "{err:?}");
        assert_eq!(fallback.calls(), 0);
    }
}
