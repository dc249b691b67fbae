use thiserror::Error;

use crate::transport::TransportError;

/// Result alias used throughout `sinoman-core`.
pub type SinomanResult<T, E = SinomanError> = std::result::Result<T, E>;

/// Error outputs from `sinoman-core`
#[derive(Debug, Error)]
#[cfg_attr(feature = "ffi", derive(uniffi::Error))]
#[cfg_attr(feature = "ffi", uniffi(flat_error))]
pub enum SinomanError {
    /// Required configuration is missing or malformed. Raised at construction, never deferred.
    #[error("configuration_error: {attribute}: {reason}")]
    Configuration {
        /// The configuration attribute at fault
        attribute: String,
        /// Why it was rejected
        reason: String,
    },
    /// The server presented a certificate outside the pinned set, or the TLS chain did not verify.
    /// Requests failing this way are never retried or sent over a weaker transport.
    #[error("security_error: {host}: {reason}")]
    Security {
        /// Host whose certificate was rejected
        host: String,
        /// Verifier output
        reason: String,
    },
    /// Timeout, DNS or connection failure. Eligible for retry, fallback or queueing.
    #[error("network_error: {url}: {error}")]
    Network {
        /// Request URL
        url: String,
        /// Underlying failure
        error: String,
    },
    /// The backend answered with a non-success status.
    #[error("backend_error ({status}): {message}")]
    Backend {
        /// HTTP status code
        status: u16,
        /// Message extracted from the response body
        message: String,
    },
    /// No valid session is available, or the backend rejected the credentials.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    /// A queued transaction could not be submitted during an offline queue sync.
    #[error("sync_error: transaction {transaction_id}: {reason}")]
    Sync {
        /// Identifier of the queued transaction that failed
        transaction_id: String,
        /// Why the submission failed
        reason: String,
    },
    /// The presented input is not valid for the requested operation
    #[error("invalid_input_{attribute}: {reason}")]
    InvalidInput {
        /// The attribute that is invalid
        attribute: String,
        /// The reason the input is invalid
        reason: String,
    },
    /// Unexpected error serializing information
    #[error("serialization_error: {error}")]
    Serialization {
        /// The error message from the serialization
        error: String,
    },
    /// The key-value store failed
    #[error("storage_error: {0}")]
    Storage(String),
}

impl SinomanError {
    /// Whether this is a security failure that must not be retried with weaker guarantees.
    #[must_use]
    pub const fn is_security(&self) -> bool {
        matches!(self, Self::Security { .. })
    }

    /// Whether this is a recoverable connectivity failure.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    pub(crate) fn configuration(attribute: &str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            attribute: attribute.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_input(attribute: &str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            attribute: attribute.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<TransportError> for SinomanError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::PinViolation { host, reason } => Self::Security { host, reason },
            TransportError::Timeout { url } => Self::Network {
                url,
                error: "request timed out".to_string(),
            },
            TransportError::Connect { url, error }
            | TransportError::Request { url, error } => Self::Network { url, error },
            TransportError::Status { url, status } => Self::Network {
                url,
                error: format!("request error with bad status code {status}"),
            },
        }
    }
}

impl From<serde_json::Error> for SinomanError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization {
            error: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_violation_maps_to_security() {
        let err: SinomanError = TransportError::PinViolation {
            host: "api.example.org".to_string(),
            reason: "certificate not pinned".to_string(),
        }
        .into();
        assert!(err.is_security());
        assert!(!err.is_transport());
    }

    #[test]
    fn test_timeout_maps_to_network() {
        let err: SinomanError = TransportError::Timeout {
            url: "https://api.example.org/rest/v1/transactions".to_string(),
        }
        .into();
        assert!(err.is_transport());
        assert!(!err.is_security());
        assert!(err.to_string().contains("timed out"));
    }
}
