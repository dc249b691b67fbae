//! QR payments: intents, backend submission and the online/offline payment flow.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::client::BackendClient;
use crate::error::{SinomanError, SinomanResult};
use crate::money::Amount;
use crate::network::NetworkStatus;
use crate::queue::{OfflineQueue, QueuedTransaction};

/// Edge function that settles QR payments.
pub const PROCESS_QR_PAYMENT_FUNCTION: &str = "process-qr-payment";

/// Header carrying the payment reference so a replayed submission is not charged twice.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// A payment the member has confirmed after scanning a merchant QR code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// Client generated reference, also used as the idempotency key
    pub reference: Uuid,
    /// Merchant identifier from the QR payload
    pub merchant_id: String,
    /// Merchant display name, when the QR code carries one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_name: Option<String>,
    /// Amount to pay
    pub amount: Amount,
    /// Free-form note
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PaymentIntent {
    /// Creates an intent with a fresh reference.
    #[must_use]
    pub fn new(merchant_id: impl Into<String>, amount: Amount) -> Self {
        Self {
            reference: Uuid::new_v4(),
            merchant_id: merchant_id.into(),
            merchant_name: None,
            amount,
            description: None,
        }
    }

    /// Sets the merchant display name.
    #[must_use]
    pub fn with_merchant_name(mut self, name: impl Into<String>) -> Self {
        self.merchant_name = Some(name.into());
        self
    }

    /// Sets the note.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Checks the intent can be submitted.
    ///
    /// # Errors
    /// Returns an invalid input error for a blank merchant or a non-positive amount.
    pub fn validate(&self) -> SinomanResult<()> {
        if self.merchant_id.trim().is_empty() {
            return Err(SinomanError::invalid_input("merchant_id", "must not be empty"));
        }
        if !self.amount.is_positive() {
            return Err(SinomanError::invalid_input(
                "amount",
                format!("must be positive, got {}", self.amount),
            ));
        }
        Ok(())
    }
}

/// What the backend returns for a settled payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    /// Backend transaction id
    pub transaction_id: String,
    /// Reference of the intent that was settled
    pub reference: Uuid,
    /// Settlement status as reported by the backend
    pub status: String,
}

/// Submits payment intents to the backend.
#[async_trait]
pub trait PaymentSubmitter: Send + Sync {
    /// Submits one intent.
    async fn submit(&self, intent: &PaymentIntent) -> SinomanResult<PaymentReceipt>;
}

/// Submits payments through the `process-qr-payment` edge function.
pub struct BackendPayments {
    client: Arc<BackendClient>,
}

impl BackendPayments {
    /// Creates a submitter using `client`.
    #[must_use]
    pub const fn new(client: Arc<BackendClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PaymentSubmitter for BackendPayments {
    async fn submit(&self, intent: &PaymentIntent) -> SinomanResult<PaymentReceipt> {
        let reference = intent.reference.to_string();
        self.client
            .invoke_function(
                PROCESS_QR_PAYMENT_FUNCTION,
                intent,
                &[(IDEMPOTENCY_KEY_HEADER, reference.as_str())],
            )
            .await
    }
}

/// Result of [`QrPayments::pay`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    /// The backend settled the payment.
    Completed(PaymentReceipt),
    /// The payment was stored for submission once connectivity returns.
    Queued(QueuedTransaction),
}

/// Pays immediately when online and falls back to the offline queue otherwise.
pub struct QrPayments {
    submitter: Arc<dyn PaymentSubmitter>,
    queue: Arc<OfflineQueue>,
    status: watch::Receiver<NetworkStatus>,
}

impl QrPayments {
    /// Creates the flow. `status` is usually [`NetworkMonitor::subscribe`](crate::NetworkMonitor::subscribe).
    #[must_use]
    pub const fn new(
        submitter: Arc<dyn PaymentSubmitter>,
        queue: Arc<OfflineQueue>,
        status: watch::Receiver<NetworkStatus>,
    ) -> Self {
        Self {
            submitter,
            queue,
            status,
        }
    }

    /// Validates and pays `intent`.
    ///
    /// Offline, or when the submission cannot reach the backend, the intent is queued and
    /// [`PaymentOutcome::Queued`] is returned.
    ///
    /// # Errors
    /// Returns invalid input for a malformed intent, and propagates security, configuration,
    /// authentication and backend errors from the submission.
    pub async fn pay(&self, intent: PaymentIntent) -> SinomanResult<PaymentOutcome> {
        intent.validate()?;

        if *self.status.borrow() == NetworkStatus::Offline {
            log::info!("offline; queueing payment {}", intent.reference);
            return Ok(PaymentOutcome::Queued(self.queue.enqueue(intent)?));
        }

        match self.submitter.submit(&intent).await {
            Ok(receipt) => {
                log::info!(
                    "payment {} settled as {}",
                    receipt.reference,
                    receipt.transaction_id
                );
                Ok(PaymentOutcome::Completed(receipt))
            }
            Err(err) if err.is_transport() => {
                log::warn!("payment {} not delivered ({err}); queueing", intent.reference);
                Ok(PaymentOutcome::Queued(self.queue.enqueue(intent)?))
            }
            Err(err) => Err(err),
        }
    }

    /// The offline queue payments fall back to.
    #[must_use]
    pub const fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }
}
