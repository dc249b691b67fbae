use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// An authenticated backend session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Bearer token for authenticated requests
    pub access_token: String,
    /// Token used to obtain a new access token
    pub refresh_token: String,
    /// Unix timestamp (seconds) at which the access token expires
    pub expires_at: u64,
    /// The signed-in user
    pub user: SessionUser,
}

/// Identity of the signed-in member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    /// Backend user id
    pub id: String,
    /// Email, when the account has one
    #[serde(default)]
    pub email: Option<String>,
}

impl Session {
    /// Whether the access token expires within `margin_secs` of `now`.
    #[must_use]
    pub const fn expires_within(&self, now: u64, margin_secs: u64) -> bool {
        self.expires_at <= now.saturating_add(margin_secs)
    }
}

/// Body returned by the auth token endpoints.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: u64,
    #[serde(default)]
    expires_at: Option<u64>,
    user: SessionUser,
}

impl TokenResponse {
    pub(crate) fn into_session(self, now: u64) -> Session {
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: self
                .expires_at
                .unwrap_or_else(|| now.saturating_add(self.expires_in)),
            user: self.user,
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}
