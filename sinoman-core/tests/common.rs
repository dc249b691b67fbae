//! Test doubles shared across integration tests.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sinoman_core::{
    Amount, NetworkStatus, PaymentIntent, PaymentReceipt, PaymentSubmitter, ReconnectHandler,
    SinomanError, SinomanResult,
};
use tokio::sync::{watch, Notify, Semaphore};

pub fn intent(merchant: &str) -> PaymentIntent {
    PaymentIntent::new(merchant, Amount::from_minor(25_000))
}

/// Pauses a submission until the test releases it.
pub struct Gate {
    pub entered: Notify,
    pub release: Semaphore,
}

/// Records the merchants it is asked to pay, in order, and fails for selected merchants.
#[derive(Default)]
pub struct RecordingSubmitter {
    attempted: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    gate: Option<Gate>,
}

impl RecordingSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> Self {
        Self {
            gate: Some(Gate {
                entered: Notify::new(),
                release: Semaphore::new(0),
            }),
            ..Self::default()
        }
    }

    pub fn fail_for(&self, merchant: &str) {
        self.failing.lock().unwrap().insert(merchant.to_string());
    }

    pub fn succeed_for(&self, merchant: &str) {
        self.failing.lock().unwrap().remove(merchant);
    }

    pub fn attempted(&self) -> Vec<String> {
        self.attempted.lock().unwrap().clone()
    }

    pub fn gate(&self) -> &Gate {
        self.gate.as_ref().unwrap()
    }
}

#[async_trait]
impl PaymentSubmitter for RecordingSubmitter {
    async fn submit(&self, intent: &PaymentIntent) -> SinomanResult<PaymentReceipt> {
        self.attempted
            .lock()
            .unwrap()
            .push(intent.merchant_id.clone());

        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.acquire().await.unwrap().forget();
        }

        if self.failing.lock().unwrap().contains(&intent.merchant_id) {
            return Err(SinomanError::Network {
                url: "https://project.supabase.co/functions/v1/process-qr-payment".to_string(),
                error: "connection reset".to_string(),
            });
        }
        Ok(PaymentReceipt {
            transaction_id: format!("tx-{}", intent.merchant_id),
            reference: intent.reference,
            status: "completed".to_string(),
        })
    }
}

/// Reconnect handler that counts sync requests.
pub struct CountingHandler {
    pub queued: AtomicUsize,
    pub syncs: AtomicUsize,
    pub fail: bool,
}

impl CountingHandler {
    pub fn new(queued: usize) -> Self {
        Self {
            queued: AtomicUsize::new(queued),
            syncs: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn failing(queued: usize) -> Self {
        Self {
            fail: true,
            ..Self::new(queued)
        }
    }

    pub fn syncs(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReconnectHandler for CountingHandler {
    fn queued_count(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    async fn sync_queue(&self) -> SinomanResult<()> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(SinomanError::Sync {
                transaction_id: "t-1".to_string(),
                reason: "backend unavailable".to_string(),
            });
        }
        Ok(())
    }
}

pub async fn wait_for_status(status: &mut watch::Receiver<NetworkStatus>, expected: NetworkStatus) {
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|current| *current == expected),
    )
    .await
    .expect("status change timed out")
    .expect("monitor stopped");
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition timed out");
}
