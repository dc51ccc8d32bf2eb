//! The Small POS - local-first outbox and sync engine
//!
//! Every user action writes an optimistic row to the local mirror and an
//! entry to a durable outbox in one SQLite transaction. A background engine
//! drains the outbox to the remote store in creation order whenever the
//! terminal is online, reconciling server ids back into the mirror.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod config;
pub mod connectivity;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod ids;
pub mod mirror;
pub mod models;
pub mod mutations;
pub mod outbox;
pub mod remote;
pub mod side_effects;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod testing;

pub use config::SyncConfig;
pub use connectivity::ConnectivityMonitor;
pub use db::DbState;
pub use error::{RemoteError, Result, SyncError};
pub use ids::EntityId;
pub use models::{EntityKind, EntityRecord};
pub use outbox::{Operation, RetryPolicy};
pub use remote::{HttpRemoteStore, RemoteStore};
pub use sync::{DrainOutcome, DrainReport, SyncEngine, SyncStatus};

// ============================================================================
// Logging
// ============================================================================

/// Install structured logging: console plus a daily rolling file in
/// `log_dir` (normally [`SyncConfig::log_dir`]). Keep the returned guard
/// alive; dropping it flushes the file.
pub fn init_logging(log_dir: &Path) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pos_offline_sync=debug"));

    // Prune old log files before setting up the appender
    std::fs::create_dir_all(log_dir).ok();
    diagnostics::prune_old_logs(log_dir);

    let file_appender = tracing_appender::rolling::daily(log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    if let Err(e) = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
    {
        warn!("Logging already initialized: {e}");
    }

    guard
}

// ============================================================================
// Runtime bootstrap
// ============================================================================

/// Handle to the running engine and its background tasks.
pub struct SyncRuntime {
    pub engine: Arc<SyncEngine>,
    pub connectivity: ConnectivityMonitor,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl SyncRuntime {
    pub fn db(&self) -> &Arc<DbState> {
        self.engine.db()
    }

    pub fn status(&self) -> Result<SyncStatus> {
        self.engine.sync_status()
    }

    /// Stop the sync loop, probe and debouncer and wait for them to exit.
    /// Queued entries stay in the outbox for the next start.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Sync runtime stopped");
    }
}

/// Open the database, connect the remote store and spawn the connectivity
/// debouncer, health probe and sync loop. Must be called from within a
/// Tokio runtime.
///
/// The engine starts offline; the first successful probe flips it online,
/// which triggers the start-up drain.
pub fn start(config: SyncConfig) -> Result<SyncRuntime> {
    config.validate()?;
    let api_key = config
        .api_key
        .clone()
        .ok_or_else(|| SyncError::Config("remote API key is not configured".into()))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_sha = env!("BUILD_GIT_SHA"),
        built = env!("BUILD_TIMESTAMP"),
        organization_id = %config.organization_id,
        "Starting POS sync engine"
    );

    let db = Arc::new(db::init(&config.data_dir)?);
    let remote: Arc<dyn RemoteStore> = Arc::new(HttpRemoteStore::new(
        &config.remote_url,
        api_key,
        config.remote_timeout(),
    )?);

    let connectivity = ConnectivityMonitor::new(false, config.debounce());
    let engine = Arc::new(SyncEngine::new(
        db,
        remote.clone(),
        config.organization_id.clone(),
        config.retry_policy(),
        config.remote_timeout(),
        connectivity.clone(),
    ));

    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();
    connectivity.spawn_debouncer(&tracker, cancel.clone());
    connectivity.spawn_probe(
        remote,
        config.probe_interval(),
        config.remote_timeout(),
        &tracker,
        cancel.clone(),
    );
    sync::start_sync_loop(engine.clone(), config.drain_interval(), &tracker, cancel.clone());

    Ok(SyncRuntime {
        engine,
        connectivity,
        cancel,
        tracker,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::client;
    use zeroize::Zeroizing;

    fn config(dir: &Path) -> SyncConfig {
        SyncConfig {
            remote_url: "http://127.0.0.1:9".into(),
            organization_id: "org-1".into(),
            api_key: Some(Zeroizing::new("test-key".into())),
            remote_timeout_secs: 1,
            debounce_ms: 10,
            ..SyncConfig::with_data_dir(dir)
        }
    }

    #[test]
    fn start_requires_an_api_key() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            api_key: None,
            ..config(dir.path())
        };
        assert!(matches!(start(config), Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn runtime_starts_offline_and_keeps_queue_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = start(config(dir.path())).unwrap();

        mutations::create_client(runtime.db(), "org-1", client("Ana")).unwrap();
        runtime.engine.request_drain();

        let status = runtime.status().unwrap();
        assert!(!status.is_online);
        assert_eq!(status.pending, 1);
        runtime.shutdown().await;

        let reopened = db::init(dir.path()).unwrap();
        let conn = reopened.conn.lock().unwrap();
        assert_eq!(outbox::pending_count(&conn, "org-1").unwrap(), 1);
    }
}
