//! Connectivity monitor.
//!
//! Raw online/offline reports (from the health probe or the host platform)
//! are debounced before they are published, so a flapping link produces one
//! transition instead of a burst of drain triggers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::remote::RemoteStore;

struct Inner {
    raw: watch::Sender<bool>,
    online: watch::Sender<bool>,
    syncing: AtomicBool,
    debounce: Duration,
}

/// Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool, debounce: Duration) -> Self {
        let (raw, _) = watch::channel(initially_online);
        let (online, _) = watch::channel(initially_online);
        Self {
            inner: Arc::new(Inner {
                raw,
                online,
                syncing: AtomicBool::new(false),
                debounce,
            }),
        }
    }

    /// Feed a raw observation. Published after it has held for the debounce
    /// interval. Repeating the current reading does not restart the wait.
    pub fn report(&self, online: bool) {
        self.inner.raw.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    /// Debounced online flag.
    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    /// Change notifications for the debounced flag.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.online.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::SeqCst)
    }

    pub(crate) fn set_syncing(&self, syncing: bool) {
        self.inner.syncing.store(syncing, Ordering::SeqCst);
    }

    fn publish(&self, online: bool) {
        let changed = self.inner.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            if online {
                info!("Network restored");
            } else {
                info!("Network offline; outbox entries stay queued");
            }
        }
    }

    /// Spawn the task that turns raw reports into debounced transitions.
    pub fn spawn_debouncer(&self, tracker: &TaskTracker, cancel: CancellationToken) {
        let monitor = self.clone();
        let mut raw_rx = self.inner.raw.subscribe();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = raw_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }

                // Wait for the reading to hold still.
                loop {
                    let candidate = *raw_rx.borrow_and_update();
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(monitor.inner.debounce) => {
                            monitor.publish(candidate);
                            break;
                        }
                        changed = raw_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawn a periodic reachability probe against the remote store.
    pub fn spawn_probe(
        &self,
        remote: Arc<dyn RemoteStore>,
        interval: Duration,
        timeout: Duration,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) {
        let monitor = self.clone();
        tracker.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let reachable = match tokio::time::timeout(timeout, remote.ping()).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        debug!(error = %e, "Health probe failed");
                        false
                    }
                    Err(_) => {
                        debug!("Health probe timed out");
                        false
                    }
                };
                monitor.report(reachable);
            }
            debug!("Health probe stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryRemote;

    const DEBOUNCE: Duration = Duration::from_millis(30);

    #[tokio::test]
    async fn brief_flap_is_not_published() {
        let monitor = ConnectivityMonitor::new(true, DEBOUNCE);
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        monitor.spawn_debouncer(&tracker, cancel.clone());
        let mut rx = monitor.subscribe();

        monitor.report(false);
        tokio::time::sleep(Duration::from_millis(5)).await;
        monitor.report(true);
        tokio::time::sleep(DEBOUNCE * 3).await;

        assert!(monitor.is_online());
        assert!(!rx.has_changed().unwrap());
        cancel.cancel();
    }

    #[tokio::test]
    async fn sustained_change_is_published_once() {
        let monitor = ConnectivityMonitor::new(true, DEBOUNCE);
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        monitor.spawn_debouncer(&tracker, cancel.clone());
        let mut rx = monitor.subscribe();

        monitor.report(false);
        monitor.report(false);
        tokio::time::sleep(DEBOUNCE * 3).await;

        assert!(!monitor.is_online());
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());
        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn steady_repeated_reading_is_published() {
        let monitor = ConnectivityMonitor::new(true, DEBOUNCE);
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        monitor.spawn_debouncer(&tracker, cancel.clone());

        // Reported faster than the debounce interval, for well over it.
        for _ in 0..10 {
            monitor.report(false);
            tokio::time::sleep(DEBOUNCE / 3).await;
        }

        assert!(!monitor.is_online());
        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn probe_reports_unreachable_store() {
        let remote = Arc::new(MemoryRemote::new());
        remote.set_reachable(false);
        let monitor = ConnectivityMonitor::new(true, Duration::from_millis(10));
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        monitor.spawn_debouncer(&tracker, cancel.clone());
        monitor.spawn_probe(
            remote.clone(),
            Duration::from_millis(10),
            Duration::from_millis(100),
            &tracker,
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!monitor.is_online());

        remote.set_reachable(true);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(monitor.is_online());
        cancel.cancel();
    }

    #[test]
    fn syncing_flag_is_shared_between_clones() {
        let monitor = ConnectivityMonitor::new(false, DEBOUNCE);
        let other = monitor.clone();
        monitor.set_syncing(true);
        assert!(other.is_syncing());
    }
}
