//! The backend client: auth, table access and edge functions over the secure fetch wrapper.

use std::sync::{Arc, OnceLock, RwLock};

use reqwest::header::AUTHORIZATION;
use reqwest::Method;
use serde::{de::DeserializeOwned, Serialize};

use crate::config::ClientConfig;
use crate::error::{SinomanError, SinomanResult};
use crate::fetch::SecureFetch;
use crate::session::{unix_now, Session, TokenResponse};
use crate::signing::RequestSigner;
use crate::storage::KeyValueStore;
use crate::transport::{HttpRequest, HttpResponse, ReqwestTransport};

/// Store key under which the session is persisted.
pub const SESSION_STORAGE_KEY: &str = "sinoman.auth.session";

/// Access tokens this close to expiry are refreshed before use.
const REFRESH_MARGIN_SECS: u64 = 60;

static SHARED_CLIENT: OnceLock<Arc<BackendClient>> = OnceLock::new();

/// Backend client with persistent sessions, automatic token refresh and signed, pinned
/// requests.
pub struct BackendClient {
    base_url: String,
    anon_key: String,
    fetch: SecureFetch,
    store: Arc<dyn KeyValueStore>,
    session: RwLock<Option<Session>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl BackendClient {
    /// Builds a client from validated configuration, restoring any persisted session.
    ///
    /// # Errors
    /// Returns a configuration error if the configuration is incomplete or the TLS stack cannot
    /// be built, and a storage error if the persisted session cannot be read.
    pub fn new(config: &ClientConfig, store: Arc<dyn KeyValueStore>) -> SinomanResult<Self> {
        config.validate()?;

        let signer = RequestSigner::new(config.signing_key())?;
        let pinned = ReqwestTransport::pinned(
            config.pins().clone(),
            config.request_timeout(),
            config.max_retries(),
        )?;
        let mut fetch = SecureFetch::new(signer, Arc::new(pinned));
        if config.allow_unpinned_fallback() {
            log::warn!("unpinned fallback transport enabled for non-security failures");
            let fallback =
                ReqwestTransport::standard(config.request_timeout(), config.max_retries())?;
            fetch = fetch.with_fallback(Arc::new(fallback));
        }

        Self::with_fetch(config.backend_url(), config.anon_key(), fetch, store)
    }

    /// Builds a client from the process environment.
    ///
    /// # Errors
    /// See [`ClientConfig::from_env`] and [`BackendClient::new`].
    pub fn from_env(store: Arc<dyn KeyValueStore>) -> SinomanResult<Self> {
        Self::new(&ClientConfig::from_env()?, store)
    }

    /// Builds a client around an already assembled fetch wrapper.
    ///
    /// # Errors
    /// Returns a storage or serialization error if the persisted session cannot be restored.
    pub fn with_fetch(
        backend_url: &str,
        anon_key: &str,
        fetch: SecureFetch,
        store: Arc<dyn KeyValueStore>,
    ) -> SinomanResult<Self> {
        let session = match store.get(SESSION_STORAGE_KEY)? {
            Some(raw) => Some(serde_json::from_str::<Session>(&raw)?),
            None => None,
        };
        if let Some(session) = &session {
            log::debug!("restored session for user {}", session.user.id);
        }

        Ok(Self {
            base_url: backend_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            fetch,
            store,
            session: RwLock::new(session),
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Installs `self` as the process-wide client and returns it. If a client was already
    /// installed, that one is kept and returned.
    #[must_use]
    pub fn install_shared(self) -> Arc<Self> {
        let client = Arc::new(self);
        if SHARED_CLIENT.set(Arc::clone(&client)).is_err() {
            log::warn!("shared backend client already installed; keeping the existing one");
        }
        SHARED_CLIENT.get().cloned().unwrap_or(client)
    }

    /// The process-wide client.
    ///
    /// # Errors
    /// Returns a configuration error if [`BackendClient::install_shared`] was never called.
    pub fn shared() -> SinomanResult<Arc<Self>> {
        SHARED_CLIENT.get().cloned().ok_or_else(|| {
            SinomanError::configuration("backend_client", "shared client not initialized")
        })
    }

    /// Backend base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The current session, if signed in.
    #[must_use]
    pub fn current_session(&self) -> Option<Session> {
        self.session.read().ok().and_then(|session| session.clone())
    }

    /// Signs in with email and password and persists the new session.
    ///
    /// # Errors
    /// Returns [`SinomanError::Unauthenticated`] when the credentials are rejected.
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> SinomanResult<Session> {
        let request = HttpRequest::new(
            Method::POST,
            format!("{}/auth/v1/token?grant_type=password", self.base_url),
        )
        .json(&serde_json::json!({ "email": email, "password": password }))?;

        let session = self.request_token(request).await?;
        self.store_session(Some(session.clone()))?;
        log::info!("signed in as {}", session.user.id);
        Ok(session)
    }

    /// Exchanges the refresh token for a new session.
    ///
    /// # Errors
    /// Returns [`SinomanError::Unauthenticated`] if there is no session or the refresh token
    /// was rejected, in which case the stored session is cleared.
    pub async fn refresh_session(&self) -> SinomanResult<Session> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    /// Signs out remotely and always forgets the local session.
    ///
    /// # Errors
    /// Returns the remote failure, after the local session has been cleared.
    pub async fn sign_out(&self) -> SinomanResult<()> {
        let Some(session) = self.current_session() else {
            return Ok(());
        };
        self.store_session(None)?;

        let request =
            HttpRequest::new(Method::POST, format!("{}/auth/v1/logout", self.base_url))
                .header(AUTHORIZATION.as_str(), format!("Bearer {}", session.access_token));
        let response = self.send(request).await?;
        if !response.is_success() && response.status != 401 {
            return Err(backend_error(&response));
        }
        Ok(())
    }

    /// Inserts `row` into `table` and returns the inserted rows.
    ///
    /// # Errors
    /// Returns a backend error for non-success responses.
    pub async fn insert<T, R>(&self, table: &str, row: &T) -> SinomanResult<Vec<R>>
    where
        T: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        let request = HttpRequest::new(Method::POST, format!("{}/rest/v1/{table}", self.base_url))
            .header("Prefer", "return=representation")
            .json(row)?;
        self.authenticated(request).await?.json()
    }

    /// Selects rows of `table` matching every `column = value` filter.
    ///
    /// # Errors
    /// Returns a backend error for non-success responses.
    pub async fn select<R: DeserializeOwned>(
        &self,
        table: &str,
        filters: &[(&str, &str)],
    ) -> SinomanResult<Vec<R>> {
        let mut url = reqwest::Url::parse(&format!("{}/rest/v1/{table}", self.base_url))
            .map_err(|err| SinomanError::invalid_input("table", err.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("select", "*");
            for (column, value) in filters {
                query.append_pair(column, &format!("eq.{value}"));
            }
        }
        self.authenticated(HttpRequest::new(Method::GET, url.to_string()))
            .await?
            .json()
    }

    /// Invokes the edge function `name` with a JSON body and extra headers.
    ///
    /// # Errors
    /// Returns a backend error for non-success responses.
    pub async fn invoke_function<T, R>(
        &self,
        name: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> SinomanResult<R>
    where
        T: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        let mut request =
            HttpRequest::new(Method::POST, format!("{}/functions/v1/{name}", self.base_url))
                .json(body)?;
        for (header, value) in headers {
            request.set_header(header, *value);
        }
        self.authenticated(request).await?.json()
    }

    async fn authenticated(&self, mut request: HttpRequest) -> SinomanResult<HttpResponse> {
        let token = self.access_token().await?;
        request.set_header(AUTHORIZATION.as_str(), format!("Bearer {token}"));

        let response = self.send(request).await?;
        if response.status == 401 {
            return Err(SinomanError::Unauthenticated(error_message(&response)));
        }
        if !response.is_success() {
            return Err(backend_error(&response));
        }
        Ok(response)
    }

    /// Adds the API key header and sends through the secure fetch wrapper.
    async fn send(&self, mut request: HttpRequest) -> SinomanResult<HttpResponse> {
        request.set_header("apikey", self.anon_key.clone());
        if request.header_value(AUTHORIZATION.as_str()).is_none() {
            request.set_header(AUTHORIZATION.as_str(), format!("Bearer {}", self.anon_key));
        }
        self.fetch.fetch(request).await
    }

    /// Bearer token for the next request: the access token when signed in (refreshed if close
    /// to expiry), the anon key otherwise.
    async fn access_token(&self) -> SinomanResult<String> {
        let Some(session) = self.current_session() else {
            return Ok(self.anon_key.clone());
        };
        if !session.expires_within(unix_now(), REFRESH_MARGIN_SECS) {
            return Ok(session.access_token);
        }

        let _guard = self.refresh_lock.lock().await;
        // another caller may have refreshed while we waited
        match self.current_session() {
            Some(current) if !current.expires_within(unix_now(), REFRESH_MARGIN_SECS) => {
                Ok(current.access_token)
            }
            _ => Ok(self.refresh_locked().await?.access_token),
        }
    }

    async fn refresh_locked(&self) -> SinomanResult<Session> {
        let refresh_token = self
            .current_session()
            .map(|session| session.refresh_token)
            .ok_or_else(|| SinomanError::Unauthenticated("no session to refresh".to_string()))?;

        let request = HttpRequest::new(
            Method::POST,
            format!("{}/auth/v1/token?grant_type=refresh_token", self.base_url),
        )
        .json(&serde_json::json!({ "refresh_token": refresh_token }))?;

        match self.request_token(request).await {
            Ok(session) => {
                self.store_session(Some(session.clone()))?;
                log::debug!("refreshed session for user {}", session.user.id);
                Ok(session)
            }
            Err(err @ SinomanError::Unauthenticated(_)) => {
                log::warn!("refresh token rejected; clearing session");
                self.store_session(None)?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn request_token(&self, request: HttpRequest) -> SinomanResult<Session> {
        let response = self.send(request).await?;
        match response.status {
            400 | 401 | 403 => Err(SinomanError::Unauthenticated(error_message(&response))),
            _ if !response.is_success() => Err(backend_error(&response)),
            _ => Ok(response.json::<TokenResponse>()?.into_session(unix_now())),
        }
    }

    fn store_session(&self, session: Option<Session>) -> SinomanResult<()> {
        match &session {
            Some(session) => self
                .store
                .set(SESSION_STORAGE_KEY, &serde_json::to_string(session)?)?,
            None => self.store.delete(SESSION_STORAGE_KEY)?,
        }
        let mut current = self
            .session
            .write()
            .map_err(|_| SinomanError::Storage("session lock poisoned".to_string()))?;
        *current = session;
        Ok(())
    }
}

fn backend_error(response: &HttpResponse) -> SinomanError {
    SinomanError::Backend {
        status: response.status,
        message: error_message(response),
    }
}

/// Pulls a human readable message out of the different error shapes the backend uses.
fn error_message(response: &HttpResponse) -> String {
    serde_json::from_slice::<serde_json::Value>(&response.body)
        .ok()
        .and_then(|body| {
            ["message", "msg", "error_description", "error"]
                .iter()
                .find_map(|field| body.get(field).and_then(|v| v.as_str()).map(str::to_string))
        })
        .unwrap_or_else(|| response.text())
}
