//! Monitor supervisor.
//!
//! Owns the map of application id to running [`RemoteMonitor`]. Startup
//! spawns one monitor per registered application; a rescan loop then picks
//! up applications registered while the daemon runs. Monitors spawned by
//! the rescan get the new-application treatment: their remotes are
//! recorded on first sight but never auto-built.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MonitorConfig;
use crate::monitor::poller::RemotePoller;
use crate::monitor::remote::RemoteMonitor;
use crate::queue::BuildQueue;
use crate::status::StatusHub;
use crate::store::Store;
use crate::store::models::Application;

struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct MonitorSupervisor {
    store: Arc<dyn Store>,
    poller: Arc<dyn RemotePoller>,
    queue: Arc<BuildQueue>,
    hub: StatusHub,
    config: MonitorConfig,
    monitors: Mutex<HashMap<i64, MonitorHandle>>,
}

impl MonitorSupervisor {
    pub fn new(
        store: Arc<dyn Store>,
        poller: Arc<dyn RemotePoller>,
        queue: Arc<BuildQueue>,
        hub: StatusHub,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            poller,
            queue,
            hub,
            config,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Drive the supervisor until cancelled: spawn monitors for every
    /// known application, then rescan on a fixed interval for new ones.
    /// On cancellation all monitors are stopped before this returns.
    pub async fn run(&self, cancel: CancellationToken) {
        let Some(applications) = self.load_initial(&cancel).await else {
            return;
        };
        for application in applications {
            self.spawn_monitor(application.id, false).await;
        }
        let monitors = self.monitor_count().await;
        tracing::info!(monitors, "Supervisor started");

        let period = self.config.rescan_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.rescan().await,
            }
        }
        self.shutdown().await;
    }

    /// The startup application list, retried with linear backoff. The
    /// rescan path must not absorb this load: applications that existed
    /// before the restart need the crash-recovery pass, not the
    /// new-application one.
    async fn load_initial(&self, cancel: &CancellationToken) -> Option<Vec<Application>> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.store.list_applications().await {
                Ok(applications) => return Some(applications),
                Err(e) => {
                    let backoff = self.config.init_backoff_base() * attempt;
                    tracing::warn!(
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        error = %e,
                        "Failed to load applications, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    /// One rescan pass. A failed pass is logged and dropped; the next
    /// tick tries again.
    async fn rescan(&self) {
        let applications = match self.store.list_applications().await {
            Ok(applications) => applications,
            Err(e) => {
                tracing::warn!(error = %e, "Application rescan failed");
                return;
            }
        };
        for application in applications {
            self.spawn_monitor(application.id, true).await;
        }
    }

    /// Spawn a monitor unless one is already running for the application.
    async fn spawn_monitor(&self, application_id: i64, is_new_application: bool) {
        let mut monitors = self.monitors.lock().await;
        if monitors.contains_key(&application_id) {
            return;
        }
        let cancel = CancellationToken::new();
        let monitor = RemoteMonitor::new(
            application_id,
            self.store.clone(),
            self.poller.clone(),
            self.queue.clone(),
            self.hub.clone(),
            self.config.clone(),
        );
        let task = tokio::spawn(monitor.run(is_new_application, cancel.clone()));
        monitors.insert(application_id, MonitorHandle { cancel, task });
        tracing::info!(application_id, is_new_application, "Monitor spawned");
    }

    /// Stop and remove one application's monitor. Returns false when the
    /// application had none.
    pub async fn stop(&self, application_id: i64) -> bool {
        let handle = self.monitors.lock().await.remove(&application_id);
        match handle {
            Some(handle) => {
                handle.cancel.cancel();
                if let Err(e) = handle.task.await {
                    tracing::warn!(application_id, error = %e, "Monitor task ended abnormally");
                }
                tracing::info!(application_id, "Monitor stopped");
                true
            }
            None => false,
        }
    }

    /// Stop every monitor and wait for them to finish.
    pub async fn shutdown(&self) {
        let handles: Vec<(i64, MonitorHandle)> =
            self.monitors.lock().await.drain().collect();
        for (_, handle) in &handles {
            handle.cancel.cancel();
        }
        for (application_id, handle) in handles {
            if let Err(e) = handle.task.await {
                tracing::warn!(application_id, error = %e, "Monitor task ended abnormally");
            }
        }
        tracing::info!("All monitors stopped");
    }

    pub async fn monitor_count(&self) -> usize {
        self.monitors.lock().await.len()
    }

    /// Ids of the applications currently monitored.
    pub async fn tracked_applications(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.monitors.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

// ── Tests ────────────────────────────────────────────────────────────
