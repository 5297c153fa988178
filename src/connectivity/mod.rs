use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::export::health::HealthMetrics;
use crate::remote::{ping_with_timeout, RemoteStore};

/// Last known reachability of the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
    pub online: bool,
    /// `None` until the first probe completes.
    pub last_checked: Option<SystemTime>,
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self {
            online: true,
            last_checked: None,
        }
    }
}

/// Probes the remote store and publishes the result to subscribers.
///
/// The state starts optimistic (online). Only the monitor writes it.
pub struct ConnectivityMonitor<R> {
    remote: Arc<R>,
    probe_timeout: Duration,
    tx: watch::Sender<ConnectivityState>,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<R: RemoteStore> ConnectivityMonitor<R> {
    pub fn new(remote: Arc<R>, probe_timeout: Duration) -> Self {
        let (tx, _) = watch::channel(ConnectivityState::default());
        Self {
            remote,
            probe_timeout,
            tx,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Cached state, never blocks on the network.
    pub fn state(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.tx.borrow().online
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }

    /// Probes once and publishes the result.
    pub async fn check_now(&self) -> bool {
        let online = ping_with_timeout(self.remote.as_ref(), self.probe_timeout).await;
        let previous = self.tx.send_replace(ConnectivityState {
            online,
            last_checked: Some(SystemTime::now()),
        });

        if previous.online != online {
            if online {
                info!(remote = self.remote.name(), "remote store reachable again");
            } else {
                warn!(remote = self.remote.name(), "remote store unreachable, switching to offline mode");
            }
        } else {
            debug!(online, "connectivity probe");
        }

        if let Some(ref m) = self.metrics {
            m.online.set(if online { 1.0 } else { 0.0 });
        }

        online
    }

    /// Spawns the periodic probe. The first probe runs one interval after
    /// start.
    pub fn spawn(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        monitor.check_now().await;
                    }
                }
            }
        })
    }
}
