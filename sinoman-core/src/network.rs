//! Connectivity tracking and the reconnect trigger for the offline queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use strum::{Display, EnumString};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{SinomanError, SinomanResult};

/// Connectivity as seen by the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum NetworkStatus {
    /// The first connectivity check has not resolved yet.
    Checking,
    /// The device can reach the network.
    Connected,
    /// The device is offline.
    Offline,
}

/// Callback invoked with `true` when connectivity is gained and `false` when it is lost.
pub type ConnectivityListener = Arc<dyn Fn(bool) + Send + Sync>;

/// Handle for a listener registration. Dropping it (or calling [`Subscription::unsubscribe`])
/// detaches the listener.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Creates a handle that runs `cancel` once when detached.
    #[must_use]
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Detaches the listener now.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Source of connectivity information, usually the OS.
#[async_trait]
pub trait ConnectivityProvider: Send + Sync {
    /// Resolves the current connectivity.
    async fn current_status(&self) -> bool;

    /// Registers `listener` for connectivity changes.
    fn on_change(&self, listener: ConnectivityListener) -> Subscription;
}

type Listeners = Mutex<HashMap<u64, ConnectivityListener>>;

/// Listener bookkeeping shared by the bundled providers.
#[derive(Default)]
struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Arc<Listeners>,
}

impl ListenerRegistry {
    fn register(&self, listener: ConnectivityListener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.insert(id, listener);
        }
        let registry: Weak<Listeners> = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = registry.upgrade() {
                if let Ok(mut listeners) = listeners.lock() {
                    listeners.remove(&id);
                }
            }
        })
    }

    /// Calls every listener outside the lock so a listener may unsubscribe itself.
    fn notify(&self, connected: bool) {
        let listeners: Vec<ConnectivityListener> = match self.listeners.lock() {
            Ok(listeners) => listeners.values().cloned().collect(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(connected);
        }
    }

    fn len(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }
}

/// Provider driven by the host: the app forwards OS connectivity events through
/// [`ManualConnectivity::set_connected`].
#[derive(Default)]
pub struct ManualConnectivity {
    connected: AtomicBool,
    listeners: ListenerRegistry,
}

impl ManualConnectivity {
    /// Creates a provider reporting `connected` until told otherwise.
    #[must_use]
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            listeners: ListenerRegistry::default(),
        }
    }

    /// Records a connectivity report and notifies listeners. Repeated reports are delivered
    /// as-is; the monitor ignores them.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        self.listeners.notify(connected);
    }

    /// Number of attached listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

#[async_trait]
impl ConnectivityProvider for ManualConnectivity {
    async fn current_status(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn on_change(&self, listener: ConnectivityListener) -> Subscription {
        self.listeners.register(listener)
    }
}

/// Provider that periodically opens a TCP connection to the backend host.
///
/// Must be created inside a tokio runtime; the probe task stops when the provider is dropped.
pub struct TcpProbeConnectivity {
    address: String,
    timeout: Duration,
    listeners: Arc<ListenerRegistry>,
    task: JoinHandle<()>,
}

impl TcpProbeConnectivity {
    /// Starts probing `address` (`host:port`) every `interval`.
    #[must_use]
    pub fn start(address: impl Into<String>, interval: Duration, timeout: Duration) -> Self {
        let address = address.into();
        let listeners = Arc::new(ListenerRegistry::default());

        let task = {
            let address = address.clone();
            let listeners = Arc::clone(&listeners);
            tokio::spawn(async move {
                let mut last = None;
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let reachable = is_reachable(&address, timeout).await;
                    if last != Some(reachable) {
                        log::debug!("probe of {address}: reachable={reachable}");
                        last = Some(reachable);
                        listeners.notify(reachable);
                    }
                }
            })
        };

        Self {
            address,
            timeout,
            listeners,
            task,
        }
    }

    /// Starts probing the host of `url`, using the scheme's default port if none is given.
    ///
    /// # Errors
    /// Returns a configuration error if the URL has no host or port.
    pub fn for_url(url: &str, interval: Duration, timeout: Duration) -> SinomanResult<Self> {
        Ok(Self::start(probe_address(url)?, interval, timeout))
    }

    /// The `host:port` being probed.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Drop for TcpProbeConnectivity {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl ConnectivityProvider for TcpProbeConnectivity {
    async fn current_status(&self) -> bool {
        is_reachable(&self.address, self.timeout).await
    }

    fn on_change(&self, listener: ConnectivityListener) -> Subscription {
        self.listeners.register(listener)
    }
}

/// `host:port` to probe for a backend URL.
///
/// # Errors
/// Returns a configuration error if the URL has no host or port.
pub fn probe_address(url: &str) -> SinomanResult<String> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|err| SinomanError::configuration("backend_url", err.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| SinomanError::configuration("backend_url", "missing host"))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| SinomanError::configuration("backend_url", "missing port"))?;
    // literal IPv6 hosts keep their brackets from `host_str`
    Ok(format!("{host}:{port}"))
}

/// Opens one TCP connection to `address` (`host:port`) and reports whether it succeeded
/// within `timeout`.
pub async fn is_reachable(address: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(address)).await,
        Ok(Ok(_))
    )
}

/// What the monitor does when connectivity comes back.
#[async_trait]
pub trait ReconnectHandler: Send + Sync {
    /// Number of transactions waiting to be submitted.
    fn queued_count(&self) -> usize;

    /// Submits the waiting transactions.
    async fn sync_queue(&self) -> SinomanResult<()>;
}

/// The status that follows `current` after a report, or `None` if nothing changes.
#[must_use]
pub const fn next_status(current: NetworkStatus, connected: bool) -> Option<NetworkStatus> {
    let next = if connected {
        NetworkStatus::Connected
    } else {
        NetworkStatus::Offline
    };
    match (current, next) {
        (NetworkStatus::Connected, NetworkStatus::Connected)
        | (NetworkStatus::Offline, NetworkStatus::Offline) => None,
        _ => Some(next),
    }
}

/// The reconnect sync in flight, if any. Once stopped, no new sync is started.
#[derive(Default)]
struct SyncState {
    running: Option<JoinHandle<()>>,
    stopped: bool,
}

type SyncSlot = Arc<Mutex<SyncState>>;

/// Tracks connectivity and syncs the offline queue on every offline to connected transition.
///
/// Reports are applied one at a time in arrival order and never wait on the network: a
/// reconnect sync runs in its own task, so the status stays current while the sync is in
/// flight. A reconnect that arrives while the previous sync is still running does not start
/// another one.
pub struct NetworkMonitor {
    status: watch::Receiver<NetworkStatus>,
    subscription: Mutex<Option<Subscription>>,
    task: Mutex<Option<JoinHandle<()>>>,
    sync: SyncSlot,
}

impl NetworkMonitor {
    /// Subscribes to `provider`, resolves the initial status and starts tracking.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(
        provider: Arc<dyn ConnectivityProvider>,
        handler: Arc<dyn ReconnectHandler>,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(NetworkStatus::Checking);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<bool>();
        let sync = SyncSlot::default();

        // subscribe before the first check so no change is missed
        let subscription = provider.on_change(Arc::new(move |connected| {
            let _ = events_tx.send(connected);
        }));

        let task = {
            let sync = Arc::clone(&sync);
            tokio::spawn(async move {
                let initial = provider.current_status().await;
                apply_report(&status_tx, &handler, &sync, initial);
                while let Some(connected) = events_rx.recv().await {
                    apply_report(&status_tx, &handler, &sync, connected);
                }
            })
        };

        Self {
            status: status_rx,
            subscription: Mutex::new(Some(subscription)),
            task: Mutex::new(Some(task)),
            sync,
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    /// A receiver that observes every status change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status.clone()
    }

    /// Whether the device is known to be online.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status() == NetworkStatus::Connected
    }

    /// Whether the device is known to be offline.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.status() == NetworkStatus::Offline
    }

    /// Detaches from the provider, stops processing reports and cancels a running reconnect
    /// sync. The last status stays readable.
    pub fn stop(&self) {
        if let Some(subscription) = self.subscription.lock().ok().and_then(|mut s| s.take()) {
            subscription.unsubscribe();
        }
        if let Some(task) = self.task.lock().ok().and_then(|mut t| t.take()) {
            task.abort();
        }
        if let Ok(mut sync) = self.sync.lock() {
            sync.stopped = true;
            if let Some(running) = sync.running.take() {
                running.abort();
            }
        }
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn apply_report(
    status: &watch::Sender<NetworkStatus>,
    handler: &Arc<dyn ReconnectHandler>,
    sync: &SyncSlot,
    connected: bool,
) {
    let previous = *status.borrow();
    let Some(next) = next_status(previous, connected) else {
        return;
    };
    status.send_replace(next);
    log::info!("network status: {previous} -> {next}");

    if previous == NetworkStatus::Offline && next == NetworkStatus::Connected {
        on_reconnect(handler, sync);
    }
}

fn on_reconnect(handler: &Arc<dyn ReconnectHandler>, sync: &SyncSlot) {
    let queued = handler.queued_count();
    if queued == 0 {
        log::debug!("reconnected with an empty offline queue");
        return;
    }

    let Ok(mut sync) = sync.lock() else {
        return;
    };
    if sync.stopped {
        return;
    }
    if sync.running.as_ref().is_some_and(|running| !running.is_finished()) {
        log::debug!("reconnected while the previous sync is still running");
        return;
    }

    log::info!("reconnected; syncing {queued} queued transaction(s)");
    let handler = Arc::clone(handler);
    sync.running = Some(tokio::spawn(async move {
        if let Err(err) = handler.sync_queue().await {
            log::error!("offline queue sync after reconnect failed: {err}");
        }
    }));
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use test_case::test_case;

    use super::*;

    #[test_case(NetworkStatus::Checking, true => Some(NetworkStatus::Connected))]
    #[test_case(NetworkStatus::Checking, false => Some(NetworkStatus::Offline))]
    #[test_case(NetworkStatus::Offline, true => Some(NetworkStatus::Connected))]
    #[test_case(NetworkStatus::Connected, false => Some(NetworkStatus::Offline))]
    #[test_case(NetworkStatus::Connected, true => None)]
    #[test_case(NetworkStatus::Offline, false => None)]
    fn test_next_status(current: NetworkStatus, connected: bool) -> Option<NetworkStatus> {
        next_status(current, connected)
    }

    #[test]
    fn test_status_names() {
        assert_eq!(NetworkStatus::Checking.to_string(), "checking");
        assert_eq!(
            NetworkStatus::from_str("offline").unwrap(),
            NetworkStatus::Offline
        );
    }

    #[test]
    fn test_subscription_detaches_on_drop_and_unsubscribe() {
        let provider = ManualConnectivity::new(true);
        let first = provider.on_change(Arc::new(|_| {}));
        let second = provider.on_change(Arc::new(|_| {}));
        assert_eq!(provider.listener_count(), 2);

        drop(first);
        assert_eq!(provider.listener_count(), 1);
        second.unsubscribe();
        assert_eq!(provider.listener_count(), 0);
    }

    #[test]
    fn test_manual_provider_notifies_listeners() {
        let provider = ManualConnectivity::new(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _subscription = {
            let seen = Arc::clone(&seen);
            provider.on_change(Arc::new(move |connected| seen.lock().unwrap().push(connected)))
        };

        provider.set_connected(true);
        provider.set_connected(false);
        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[test_case("https://project.supabase.co" => "project.supabase.co:443")]
    #[test_case("http://localhost:54321/rest" => "localhost:54321")]
    #[test_case("https://[::1]:8443" => "[::1]:8443")]
    fn test_probe_address(url: &str) -> String {
        probe_address(url).unwrap()
    }

    #[tokio::test]
    async fn test_is_reachable_detects_listening_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        assert!(is_reachable(&address, Duration::from_secs(1)).await);

        drop(listener);
        assert!(!is_reachable("127.0.0.1:1", Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_monitor_stop_unsubscribes() {
        struct Idle;

        #[async_trait]
        impl ReconnectHandler for Idle {
            fn queued_count(&self) -> usize {
                0
            }

            async fn sync_queue(&self) -> SinomanResult<()> {
                Ok(())
            }
        }

        let provider = Arc::new(ManualConnectivity::new(true));
        let monitor = NetworkMonitor::start(provider.clone(), Arc::new(Idle));
        let mut status = monitor.subscribe();
        status
            .wait_for(|status| *status == NetworkStatus::Connected)
            .await
            .unwrap();
        assert_eq!(provider.listener_count(), 1);

        monitor.stop();
        assert_eq!(provider.listener_count(), 0);
        assert!(monitor.is_connected());
    }
}
