//! Shared state for CLI commands: the data directory, the store and the backend client.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use eyre::{eyre, WrapErr};
use sinoman_core::{
    BackendClient, BackendPayments, ClientConfig, FileStore, OfflineQueue, PaymentIntent,
    PaymentReceipt, PaymentSubmitter, SinomanError, SinomanResult,
};

pub struct Context {
    data_dir: PathBuf,
    store: Arc<FileStore>,
    pub json: bool,
}

impl Context {
    pub fn open(data_dir: Option<PathBuf>, json: bool) -> eyre::Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => default_data_dir()?,
        };
        let store = FileStore::open(&data_dir)
            .wrap_err_with(|| format!("failed to open data directory {}", data_dir.display()))?;
        tracing::debug!(data_dir = %data_dir.display(), "opened store");
        Ok(Self {
            data_dir,
            store: Arc::new(store),
            json,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config() -> eyre::Result<ClientConfig> {
        ClientConfig::from_env().wrap_err("backend configuration is incomplete (see SINOMAN_* variables)")
    }

    pub fn client(&self) -> eyre::Result<Arc<BackendClient>> {
        let client = BackendClient::new(&Self::config()?, self.store.clone())?;
        Ok(Arc::new(client))
    }

    /// Loads the offline queue. Without backend configuration the queue can still be inspected
    /// and edited; only submissions fail.
    pub fn queue(&self) -> eyre::Result<Arc<OfflineQueue>> {
        let submitter: Arc<dyn PaymentSubmitter> = match self.client() {
            Ok(client) => Arc::new(BackendPayments::new(client)),
            Err(err) => {
                tracing::debug!("backend unavailable: {err:#}");
                Arc::new(Unconfigured {
                    reason: format!("{err:#}"),
                })
            }
        };
        self.queue_with(submitter)
    }

    pub fn queue_with(&self, submitter: Arc<dyn PaymentSubmitter>) -> eyre::Result<Arc<OfflineQueue>> {
        let queue = OfflineQueue::load(self.store.clone(), submitter)
            .wrap_err("failed to load the offline queue")?;
        Ok(Arc::new(queue))
    }
}

/// Submitter used when the backend is not configured.
struct Unconfigured {
    reason: String,
}

#[async_trait]
impl PaymentSubmitter for Unconfigured {
    async fn submit(&self, _intent: &PaymentIntent) -> SinomanResult<PaymentReceipt> {
        Err(SinomanError::Configuration {
            attribute: "backend".to_string(),
            reason: self.reason.clone(),
        })
    }
}

fn default_data_dir() -> eyre::Result<PathBuf> {
    dirs::data_local_dir()
        .map(|dir| dir.join("sinoman"))
        .ok_or_else(|| eyre!("no local data directory on this platform; pass --data-dir"))
}
