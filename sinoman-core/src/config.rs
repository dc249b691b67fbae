//! Client configuration.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::{SinomanError, SinomanResult};
use crate::pinning::PinSet;

/// Environment variable holding the backend base URL.
pub const ENV_BACKEND_URL: &str = "SINOMAN_BACKEND_URL";
/// Environment variable holding the public (anon) API key.
pub const ENV_ANON_KEY: &str = "SINOMAN_ANON_KEY";
/// Environment variable holding the shared request signing key.
pub const ENV_SIGNING_KEY: &str = "SINOMAN_SIGNING_KEY";
/// Environment variable holding comma separated `sha256/<base64>` certificate pins.
pub const ENV_CERT_PINS: &str = "SINOMAN_CERT_PINS";
/// Environment variable enabling the unpinned fallback transport (`true`/`1`).
pub const ENV_ALLOW_UNPINNED_FALLBACK: &str = "SINOMAN_ALLOW_UNPINNED_FALLBACK";

/// Everything needed to build a [`BackendClient`](crate::BackendClient).
#[derive(Debug)]
pub struct ClientConfig {
    backend_url: String,
    anon_key: String,
    signing_key: SecretString,
    pins: PinSet,
    allow_unpinned_fallback: bool,
    request_timeout: Duration,
    max_retries: u32,
}

impl ClientConfig {
    /// Creates a configuration with default timeouts and no fallback transport.
    #[must_use]
    pub fn new(
        backend_url: impl Into<String>,
        anon_key: impl Into<String>,
        signing_key: SecretString,
        pins: PinSet,
    ) -> Self {
        Self {
            backend_url: backend_url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            signing_key,
            pins,
            allow_unpinned_fallback: false,
            request_timeout: Duration::from_secs(10),
            max_retries: 3, // total attempts = 4
        }
    }

    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    /// Returns a configuration error if a required variable is missing or invalid.
    pub fn from_env() -> SinomanResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps variable names to values.
    ///
    /// # Errors
    /// Returns a configuration error if a required variable is missing or invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> SinomanResult<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| SinomanError::configuration(key, "missing"))
        };

        let backend_url = required(ENV_BACKEND_URL)?;
        let anon_key = required(ENV_ANON_KEY)?;
        let signing_key = SecretString::from(required(ENV_SIGNING_KEY)?);
        let pins = PinSet::parse_list(&required(ENV_CERT_PINS)?)?;
        let allow_unpinned_fallback = lookup(ENV_ALLOW_UNPINNED_FALLBACK)
            .is_some_and(|value| matches!(value.trim(), "1" | "true" | "TRUE" | "yes"));

        let config = Self::new(backend_url, anon_key, signing_key, pins)
            .with_unpinned_fallback(allow_unpinned_fallback);
        config.validate()?;
        Ok(config)
    }

    /// Enables or disables the unpinned fallback for non-security transport failures.
    #[must_use]
    pub fn with_unpinned_fallback(mut self, allow: bool) -> Self {
        self.allow_unpinned_fallback = allow;
        self
    }

    /// Overrides the per-request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Overrides the number of retries for transient failures.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Checks that every required value is present and well formed.
    ///
    /// # Errors
    /// Returns the first configuration problem found.
    pub fn validate(&self) -> SinomanResult<()> {
        let url = reqwest::Url::parse(&self.backend_url)
            .map_err(|err| SinomanError::configuration("backend_url", err.to_string()))?;
        #[cfg(not(test))]
        if url.scheme() != "https" {
            return Err(SinomanError::configuration(
                "backend_url",
                "backend must be reached over https",
            ));
        }
        if url.host_str().is_none() {
            return Err(SinomanError::configuration("backend_url", "missing host"));
        }
        if self.anon_key.trim().is_empty() {
            return Err(SinomanError::configuration("anon_key", "missing"));
        }
        if self.signing_key.expose_secret().is_empty() {
            return Err(SinomanError::configuration("signing_key", "missing"));
        }
        if self.pins.is_empty() {
            return Err(SinomanError::configuration(
                "cert_pins",
                "at least one certificate pin is required",
            ));
        }
        Ok(())
    }

    /// Backend base URL without a trailing slash.
    #[must_use]
    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    /// Public API key sent as `apikey`.
    #[must_use]
    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    /// Shared request signing key.
    #[must_use]
    pub const fn signing_key(&self) -> &SecretString {
        &self.signing_key
    }

    /// Pinned certificates for the backend host.
    #[must_use]
    pub const fn pins(&self) -> &PinSet {
        &self.pins
    }

    /// Whether non-security failures may be retried without pinning.
    #[must_use]
    pub const fn allow_unpinned_fallback(&self) -> bool {
        self.allow_unpinned_fallback
    }

    /// Per-request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Retries for transient failures.
    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }
}
