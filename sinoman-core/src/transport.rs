use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::error::{SinomanError, SinomanResult};
use crate::pinning::{pinned_tls_config, PinSet, PinViolationLog};

/// An outgoing HTTP request, before or after signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// HTTP method
    pub method: Method,
    /// Full request URL
    pub url: String,
    /// Header name/value pairs, in insertion order
    pub headers: Vec<(String, String)>,
    /// Raw body bytes
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Creates a request without headers or body.
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Adds (or replaces) a header.
    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Serializes `body` as JSON and sets the content type.
    ///
    /// # Errors
    /// Returns a serialization error if `body` cannot be encoded.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> SinomanResult<Self> {
        self.body = Some(serde_json::to_vec(body)?);
        self.set_header(CONTENT_TYPE.as_str(), "application/json");
        Ok(self)
    }

    /// Replaces any header with the same (case-insensitive) name.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    /// Looks up a header by case-insensitive name.
    #[must_use]
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Host component of the URL, if it parses.
    #[must_use]
    pub fn host(&self) -> Option<String> {
        reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
    }
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Whether the status is 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decodes the body as JSON.
    ///
    /// # Errors
    /// Returns a serialization error if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> SinomanResult<T> {
        serde_json::from_slice(&self.body).map_err(|e| SinomanError::Serialization {
            error: format!("failed to parse response body: {e}"),
        })
    }

    /// Body as text, with invalid UTF-8 replaced.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Failures below the HTTP layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The server's certificate was rejected during the TLS handshake, either by the pinning
    /// verifier or by standard validation.
    #[error("certificate rejected for {host}: {reason}")]
    PinViolation {
        /// Host whose certificate was rejected
        host: String,
        /// Verifier output
        reason: String,
    },
    /// The request timed out.
    #[error("request to {url} timed out")]
    Timeout {
        /// Request URL
        url: String,
    },
    /// DNS resolution or connection establishment failed.
    #[error("could not connect to {url}: {error}")]
    Connect {
        /// Request URL
        url: String,
        /// Underlying failure
        error: String,
    },
    /// The server kept answering with a transient error status (429 or 5xx).
    #[error("request to {url} failed with status {status}")]
    Status {
        /// Request URL
        url: String,
        /// Last status received
        status: u16,
    },
    /// Any other failure building or sending the request.
    #[error("request to {url} failed: {error}")]
    Request {
        /// Request URL
        url: String,
        /// Underlying failure
        error: String,
    },
}

impl TransportError {
    /// Whether this is a certificate rejection.
    #[must_use]
    pub const fn is_security(&self) -> bool {
        matches!(self, Self::PinViolation { .. })
    }

    /// Whether retrying the same request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Connect { .. } | Self::Status { .. }
        )
    }
}

/// Something that can carry an [`HttpRequest`] to the network.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends the request and buffers the response.
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// `reqwest` backed transport. Sets a timeout and user agent on every request and retries
/// transient failures with exponential backoff. Certificate rejections are never retried.
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
    violations: Option<Arc<PinViolationLog>>,
}

impl ReqwestTransport {
    /// A transport whose TLS handshakes only succeed against pinned certificates.
    ///
    /// # Errors
    /// Returns a configuration error if the pin set is empty or the TLS stack cannot be built.
    pub fn pinned(pins: PinSet, timeout: Duration, max_retries: u32) -> SinomanResult<Self> {
        install_crypto_provider();
        let violations = Arc::new(PinViolationLog::new());
        let tls = pinned_tls_config(pins, Arc::clone(&violations))?;
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .build()
            .map_err(|err| SinomanError::configuration("tls", err.to_string()))?;
        Ok(Self {
            client,
            timeout,
            max_retries,
            violations: Some(violations),
        })
    }

    /// A transport using the platform's standard certificate validation, without pinning.
    ///
    /// # Errors
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn standard(timeout: Duration, max_retries: u32) -> SinomanResult<Self> {
        install_crypto_provider();
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| SinomanError::configuration("http_client", err.to_string()))?;
        Ok(Self {
            client,
            timeout,
            max_retries,
            violations: None,
        })
    }

    /// The violation log shared with the pinning verifier, if this transport is pinned.
    #[must_use]
    pub const fn violations(&self) -> Option<&Arc<PinViolationLog>> {
        self.violations.as_ref()
    }

    async fn send_once(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        #[cfg(not(test))]
        if !request.url.starts_with("https") {
            return Err(TransportError::Request {
                url: request.url.clone(),
                error: "only https requests are allowed".to_string(),
            });
        }

        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .timeout(self.timeout)
            .header(USER_AGENT, format!("sinoman-core/{}", env!("CARGO_PKG_VERSION")));
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => return Err(self.classify(request, &err)),
        };

        // a response means the handshake, if any, passed the verifier
        if let (Some(violations), Some(host)) = (&self.violations, request.host()) {
            violations.clear(&host);
        }

        let status = response.status().as_u16();
        if status == 429 || (500..600).contains(&status) {
            return Err(TransportError::Status {
                url: request.url.clone(),
                status,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| TransportError::Request {
                url: request.url.clone(),
                error: format!("failed to read response body: {err}"),
            })?;

        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }

    fn classify(&self, request: &HttpRequest, err: &reqwest::Error) -> TransportError {
        let url = request.url.clone();
        let host = request.host();

        // the verifier's own reason is more useful than the handshake error text
        let logged = match (&self.violations, &host) {
            (Some(violations), Some(host)) => violations.violation_for(host),
            _ => None,
        };
        let rejection = certificate_rejection(err);
        if rejection.is_some() || logged.is_some() {
            return TransportError::PinViolation {
                host: host.unwrap_or_else(|| url.clone()),
                reason: logged.or(rejection).unwrap_or_default(),
            };
        }

        if err.is_timeout() {
            TransportError::Timeout { url }
        } else if err.is_connect() {
            TransportError::Connect {
                url,
                error: err.to_string(),
            }
        } else {
            TransportError::Request {
                url,
                error: err.to_string(),
            }
        }
    }
}

/// Walks the source chain of `err` for a `rustls` certificate rejection and returns its text.
///
/// The handshake error reaches us wrapped in an `io::Error`, whose `source` skips the wrapped
/// value, so each level is also checked through `io::Error::get_ref`.
fn certificate_rejection(err: &(dyn std::error::Error + 'static)) -> Option<String> {
    let mut current = Some(err);
    while let Some(err) = current {
        let tls = err.downcast_ref::<rustls::Error>().or_else(|| {
            err.downcast_ref::<std::io::Error>()
                .and_then(std::io::Error::get_ref)
                .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        });
        if let Some(tls) = tls.filter(|tls| matches!(tls, rustls::Error::InvalidCertificate(_))) {
            return Some(tls.to_string());
        }
        current = err.source();
    }
    None
}

/// Makes `ring` the process-wide `rustls` provider unless the host already chose one.
fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(self.max_retries as usize);

        (|| async { self.send_once(request).await })
            .retry(backoff)
            .when(TransportError::is_retryable)
            .notify(|err: &TransportError, delay: Duration| {
                log::debug!("retrying in {delay:?} after transient failure: {err}");
            })
            .await
    }
}
