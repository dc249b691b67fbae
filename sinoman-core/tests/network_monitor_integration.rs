mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{intent, wait_for_status, wait_until, CountingHandler, RecordingSubmitter};
use sinoman_core::{ManualConnectivity, MemoryStore, NetworkMonitor, NetworkStatus, OfflineQueue};

#[tokio::test]
async fn test_reconnect_with_queued_items_syncs_exactly_once() {
    let provider = Arc::new(ManualConnectivity::new(false));
    let handler = Arc::new(CountingHandler::new(3));
    let monitor = NetworkMonitor::start(provider.clone(), handler.clone());
    let mut status = monitor.subscribe();
    wait_for_status(&mut status, NetworkStatus::Offline).await;

    provider.set_connected(true);
    // repeated reports of the same state are ignored
    provider.set_connected(true);
    provider.set_connected(true);
    wait_for_status(&mut status, NetworkStatus::Connected).await;
    wait_until(|| handler.syncs() == 1).await;

    provider.set_connected(false);
    wait_for_status(&mut status, NetworkStatus::Offline).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(handler.syncs(), 1);
}

#[tokio::test]
async fn test_reconnect_with_empty_queue_never_syncs() {
    let provider = Arc::new(ManualConnectivity::new(false));
    let handler = Arc::new(CountingHandler::new(0));
    let monitor = NetworkMonitor::start(provider.clone(), handler.clone());
    let mut status = monitor.subscribe();
    wait_for_status(&mut status, NetworkStatus::Offline).await;

    // the queue is checked while the report is applied, so no sync can be pending afterwards
    provider.set_connected(true);
    wait_for_status(&mut status, NetworkStatus::Connected).await;
    provider.set_connected(false);
    wait_for_status(&mut status, NetworkStatus::Offline).await;

    assert_eq!(handler.syncs(), 0);
}

#[tokio::test]
async fn test_initial_connected_check_does_not_sync() {
    let provider = Arc::new(ManualConnectivity::new(true));
    let handler = Arc::new(CountingHandler::new(5));
    let monitor = NetworkMonitor::start(provider.clone(), handler.clone());
    let mut status = monitor.subscribe();
    wait_for_status(&mut status, NetworkStatus::Connected).await;

    provider.set_connected(false);
    wait_for_status(&mut status, NetworkStatus::Offline).await;

    assert_eq!(handler.syncs(), 0);
}

#[tokio::test]
async fn test_sync_failure_does_not_stop_the_monitor() {
    let provider = Arc::new(ManualConnectivity::new(false));
    let handler = Arc::new(CountingHandler::failing(1));
    let monitor = NetworkMonitor::start(provider.clone(), handler.clone());
    let mut status = monitor.subscribe();
    wait_for_status(&mut status, NetworkStatus::Offline).await;

    for cycle in 1..=2 {
        provider.set_connected(true);
        wait_for_status(&mut status, NetworkStatus::Connected).await;
        wait_until(|| handler.syncs() == cycle).await;
        provider.set_connected(false);
        wait_for_status(&mut status, NetworkStatus::Offline).await;
    }

    assert_eq!(handler.syncs(), 2);
    assert!(monitor.is_offline());
}

#[tokio::test]
async fn test_reconnect_drains_the_offline_queue() {
    let submitter = Arc::new(RecordingSubmitter::new());
    let queue = Arc::new(OfflineQueue::load(Arc::new(MemoryStore::new()), submitter.clone()).unwrap());
    queue.enqueue(intent("a")).unwrap();
    queue.enqueue(intent("b")).unwrap();

    let provider = Arc::new(ManualConnectivity::new(false));
    let monitor = NetworkMonitor::start(provider.clone(), queue.clone());
    let mut status = monitor.subscribe();
    wait_for_status(&mut status, NetworkStatus::Offline).await;

    provider.set_connected(true);
    wait_for_status(&mut status, NetworkStatus::Connected).await;
    wait_until(|| queue.queued_transactions_count() == 0).await;

    assert_eq!(submitter.attempted(), vec!["a", "b"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_offline_report_during_sync_updates_status() {
    let submitter = Arc::new(RecordingSubmitter::gated());
    let queue = Arc::new(OfflineQueue::load(Arc::new(MemoryStore::new()), submitter.clone()).unwrap());
    queue.enqueue(intent("a")).unwrap();

    let provider = Arc::new(ManualConnectivity::new(false));
    let monitor = NetworkMonitor::start(provider.clone(), queue.clone());
    let mut status = monitor.subscribe();
    wait_for_status(&mut status, NetworkStatus::Offline).await;

    provider.set_connected(true);
    wait_for_status(&mut status, NetworkStatus::Connected).await;
    submitter.gate().entered.notified().await;
    assert!(queue.is_syncing());

    // the submission is still held, yet the offline report must be applied
    provider.set_connected(false);
    wait_for_status(&mut status, NetworkStatus::Offline).await;
    assert!(monitor.is_offline());
    assert!(queue.is_syncing());

    submitter.gate().release.add_permits(1);
    wait_until(|| queue.queued_transactions_count() == 0).await;
    assert!(!queue.is_syncing());
    assert_eq!(submitter.attempted(), vec!["a"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_cancels_a_running_sync() {
    let submitter = Arc::new(RecordingSubmitter::gated());
    let queue = Arc::new(OfflineQueue::load(Arc::new(MemoryStore::new()), submitter.clone()).unwrap());
    queue.enqueue(intent("a")).unwrap();

    let provider = Arc::new(ManualConnectivity::new(false));
    let monitor = NetworkMonitor::start(provider.clone(), queue.clone());
    let mut status = monitor.subscribe();
    wait_for_status(&mut status, NetworkStatus::Offline).await;

    provider.set_connected(true);
    submitter.gate().entered.notified().await;

    monitor.stop();
    // the aborted pass releases its guard and leaves the item queued
    wait_until(|| !queue.is_syncing()).await;
    assert_eq!(queue.queued_transactions_count(), 1);
}

#[tokio::test]
async fn test_stop_detaches_from_provider() {
    let provider = Arc::new(ManualConnectivity::new(true));
    let monitor = NetworkMonitor::start(provider.clone(), Arc::new(CountingHandler::new(0)));
    let mut status = monitor.subscribe();
    wait_for_status(&mut status, NetworkStatus::Connected).await;

    monitor.stop();
    provider.set_connected(false);

    assert_eq!(provider.listener_count(), 0);
    assert_eq!(monitor.status(), NetworkStatus::Connected);
}
