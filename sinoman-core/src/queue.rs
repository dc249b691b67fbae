//! The offline payment queue.
//!
//! Payments made without connectivity are stored here and replayed in order once the device is
//! back online. The queue is persisted to the [`KeyValueStore`] on every change, before the
//! changing call returns.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SinomanError, SinomanResult};
use crate::network::ReconnectHandler;
use crate::payment::{PaymentIntent, PaymentSubmitter};
use crate::session::unix_now;
use crate::storage::KeyValueStore;

/// Store key holding the serialized queue.
pub const QUEUE_STORAGE_KEY: &str = "sinoman.offline_queue.v1";

/// A payment waiting for connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTransaction {
    /// Queue entry id
    pub id: String,
    /// The payment to submit
    pub payload: PaymentIntent,
    /// Unix timestamp (seconds) at which the payment was queued
    pub created_at: u64,
    /// Failed submission attempts so far
    #[serde(default)]
    pub attempts: u32,
    /// The most recent submission failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Outcome of [`OfflineQueue::sync_offline_queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    /// Transactions submitted and removed during this pass
    pub submitted: usize,
    /// Transactions still queued after the pass
    pub remaining: usize,
    /// Another pass was already running, so this call did nothing
    pub already_running: bool,
}

/// FIFO queue of payments made while offline.
pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    submitter: Arc<dyn PaymentSubmitter>,
    items: Mutex<VecDeque<QueuedTransaction>>,
    syncing: AtomicBool,
}

/// Clears the syncing flag when a pass ends, however it ends.
struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl OfflineQueue {
    /// Loads the queue persisted in `store`.
    ///
    /// # Errors
    /// Returns a storage error if the store cannot be read and a serialization error if the
    /// persisted queue is corrupt.
    pub fn load(
        store: Arc<dyn KeyValueStore>,
        submitter: Arc<dyn PaymentSubmitter>,
    ) -> SinomanResult<Self> {
        let items: VecDeque<QueuedTransaction> = match store.get(QUEUE_STORAGE_KEY)? {
            Some(raw) => serde_json::from_str(&raw).map_err(|err| SinomanError::Serialization {
                error: format!("offline queue snapshot is corrupt: {err}"),
            })?,
            None => VecDeque::new(),
        };
        if !items.is_empty() {
            log::info!("restored {} queued transaction(s)", items.len());
        }

        Ok(Self {
            store,
            submitter,
            items: Mutex::new(items),
            syncing: AtomicBool::new(false),
        })
    }

    /// Appends `intent` to the queue. Does not touch the network.
    ///
    /// # Errors
    /// Returns a storage error if the queue cannot be persisted; the intent is then not queued.
    pub fn enqueue(&self, intent: PaymentIntent) -> SinomanResult<QueuedTransaction> {
        let transaction = QueuedTransaction {
            id: Uuid::new_v4().to_string(),
            payload: intent,
            created_at: unix_now(),
            attempts: 0,
            last_error: None,
        };

        let mut items = self.lock()?;
        items.push_back(transaction.clone());
        if let Err(err) = self.persist(&items) {
            items.pop_back();
            return Err(err);
        }
        log::info!(
            "queued transaction {} ({} pending)",
            transaction.id,
            items.len()
        );
        Ok(transaction)
    }

    /// Submits queued transactions oldest first, one at a time.
    ///
    /// Each success is removed and persisted before the next submission starts. The first
    /// failure stops the pass and leaves that transaction and everything after it queued. If a
    /// pass is already running this returns immediately with `already_running` set.
    ///
    /// # Errors
    /// Returns [`SinomanError::Security`] if a submission hit a certificate rejection,
    /// [`SinomanError::Sync`] for any other submission failure, and storage errors from
    /// persisting progress.
    pub async fn sync_offline_queue(&self) -> SinomanResult<SyncReport> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("offline queue sync already running");
            return Ok(SyncReport {
                submitted: 0,
                remaining: self.queued_transactions_count(),
                already_running: true,
            });
        }
        let _guard = SyncGuard(&self.syncing);

        let mut submitted = 0;
        while let Some(next) = self.front()? {
            match self.submitter.submit(&next.payload).await {
                Ok(receipt) => {
                    self.complete(&next.id)?;
                    submitted += 1;
                    log::info!(
                        "submitted queued transaction {} as {}",
                        next.id,
                        receipt.transaction_id
                    );
                }
                Err(err) => {
                    log::warn!(
                        "queued transaction {} failed after {submitted} submitted: {err}",
                        next.id
                    );
                    self.record_failure(&next.id, &err)?;
                    return Err(if err.is_security() {
                        err
                    } else {
                        SinomanError::Sync {
                            transaction_id: next.id,
                            reason: err.to_string(),
                        }
                    });
                }
            }
        }

        Ok(SyncReport {
            submitted,
            remaining: self.queued_transactions_count(),
            already_running: false,
        })
    }

    /// Number of queued transactions.
    #[must_use]
    pub fn queued_transactions_count(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    /// Snapshot of the queue, oldest first.
    #[must_use]
    pub fn queued_transactions(&self) -> Vec<QueuedTransaction> {
        self.items
            .lock()
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a sync pass is running.
    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Removes the transaction `id`, returning it if it was queued.
    ///
    /// # Errors
    /// Returns a storage error if the queue cannot be persisted.
    pub fn remove(&self, id: &str) -> SinomanResult<Option<QueuedTransaction>> {
        let mut items = self.lock()?;
        let Some(position) = items.iter().position(|item| item.id == id) else {
            return Ok(None);
        };
        let removed = items.remove(position);
        self.persist(&items)?;
        Ok(removed)
    }

    /// Drops every queued transaction and returns how many there were.
    ///
    /// # Errors
    /// Returns a storage error if the queue cannot be persisted.
    pub fn clear(&self) -> SinomanResult<usize> {
        let mut items = self.lock()?;
        let count = items.len();
        self.store.delete(QUEUE_STORAGE_KEY)?;
        items.clear();
        Ok(count)
    }

    fn lock(&self) -> SinomanResult<MutexGuard<'_, VecDeque<QueuedTransaction>>> {
        self.items
            .lock()
            .map_err(|_| SinomanError::Storage("offline queue lock poisoned".to_string()))
    }

    fn front(&self) -> SinomanResult<Option<QueuedTransaction>> {
        Ok(self.lock()?.front().cloned())
    }

    /// Removes a submitted transaction. It is normally at the front, but may have been removed
    /// or reordered by a concurrent `remove`.
    fn complete(&self, id: &str) -> SinomanResult<()> {
        let mut items = self.lock()?;
        if items.front().is_some_and(|item| item.id == id) {
            items.pop_front();
        } else if let Some(position) = items.iter().position(|item| item.id == id) {
            items.remove(position);
        } else {
            return Ok(());
        }
        self.persist(&items)
    }

    fn record_failure(&self, id: &str, err: &SinomanError) -> SinomanResult<()> {
        let mut items = self.lock()?;
        let Some(item) = items.iter_mut().find(|item| item.id == id) else {
            return Ok(());
        };
        item.attempts = item.attempts.saturating_add(1);
        item.last_error = Some(err.to_string());
        self.persist(&items)
    }

    fn persist(&self, items: &VecDeque<QueuedTransaction>) -> SinomanResult<()> {
        let snapshot = serde_json::to_string(items)?;
        self.store.set(QUEUE_STORAGE_KEY, &snapshot)
    }
}

#[async_trait]
impl ReconnectHandler for OfflineQueue {
    fn queued_count(&self) -> usize {
        self.queued_transactions_count()
    }

    async fn sync_queue(&self) -> SinomanResult<()> {
        let report = self.sync_offline_queue().await?;
        if !report.already_running {
            log::info!(
                "reconnect sync submitted {} transaction(s), {} remaining",
                report.submitted,
                report.remaining
            );
        }
        Ok(())
    }
}
