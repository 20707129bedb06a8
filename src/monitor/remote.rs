//! Remote monitor.
//!
//! One monitor owns one application: it polls the repository, reconciles
//! what it sees against the tracked rows, and submits buildable branches
//! to the queue. The lifecycle has two stages. Initialisation retries the
//! first reconciliation with linearly growing backoff until it succeeds,
//! so a transient git or auth failure never drops an application from
//! tracking. Tracking then polls on a fixed interval for the life of the
//! process; a failed cycle is logged and the next tick runs regardless.
//!
//! The first successful reconciliation runs with the just-started flag
//! set, which drives crash recovery: rows left `Waiting` are re-queued
//! and rows left `Building` are marked failed, since neither survives a
//! restart.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::MonitorConfig;
use crate::errors::{MonitorError, StoreError};
use crate::monitor::classify::{classify, is_buildable, BranchAction, ClassifyFlags};
use crate::monitor::poller::RemotePoller;
use crate::queue::{BuildQueue, BuildRequest};
use crate::status::{BranchStatus, StatusHub};
use crate::store::models::{Application, ObservedRemote, RemotePatch, RemoteState, TrackedRemote};
use crate::store::Store;

pub struct RemoteMonitor {
    application_id: i64,
    store: Arc<dyn Store>,
    poller: Arc<dyn RemotePoller>,
    queue: Arc<BuildQueue>,
    hub: StatusHub,
    config: MonitorConfig,
}

impl RemoteMonitor {
    pub fn new(
        application_id: i64,
        store: Arc<dyn Store>,
        poller: Arc<dyn RemotePoller>,
        queue: Arc<BuildQueue>,
        hub: StatusHub,
        config: MonitorConfig,
    ) -> Self {
        Self {
            application_id,
            store,
            poller,
            queue,
            hub,
            config,
        }
    }

    /// Drive the monitor until cancelled. `is_new_application` marks an
    /// application discovered after startup, whose remotes are recorded
    /// but never auto-built on first sight.
    pub async fn run(self, is_new_application: bool, cancel: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.reconcile(true, is_new_application).await {
                Ok(()) => break,
                Err(e) => {
                    let backoff = self.config.init_backoff_base() * attempt;
                    tracing::warn!(
                        application_id = self.application_id,
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        error = %e,
                        "Monitor initialisation failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
        tracing::info!(application_id = self.application_id, "Tracking remotes");

        let period = self.config.poll_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(application_id = self.application_id, "Monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile(false, false).await {
                        tracing::warn!(
                            application_id = self.application_id,
                            error = %e,
                            "Reconciliation failed"
                        );
                    }
                }
            }
        }
    }

    /// One reconciliation cycle: reload the application (its auto-build
    /// flag may have changed), poll the repository, classify every remote
    /// on both sides, and apply the outcomes. Observed refs are processed
    /// before unmatched tracked refs, so one fetched snapshot resolves a
    /// ref that changed and disappeared between polls deterministically.
    async fn reconcile(
        &self,
        just_started: bool,
        is_new_application: bool,
    ) -> Result<(), MonitorError> {
        let app = self
            .store
            .get_application(self.application_id)
            .await?
            .ok_or(StoreError::ApplicationNotFound {
                id: self.application_id,
            })?;
        let tracked = self.store.list_tracked_remotes(app.id).await?;
        let observed = tokio::time::timeout(
            self.config.poll_timeout(),
            self.poller.list_remote_refs(&app, true),
        )
        .await
        .map_err(|_| MonitorError::PollTimeout {
            seconds: self.config.poll_timeout_secs,
        })??;

        let now = Utc::now();
        let threshold = self.config.activity_threshold();
        let flags = ClassifyFlags {
            is_new_application,
            monitor_just_started: just_started,
            auto_build: app.auto_build,
        };

        for current in &observed {
            let existing = tracked.iter().find(|t| t.remote == current.remote);
            let action = classify(existing, Some(current), flags, now, threshold)?;
            self.apply(&app, existing, current, action, now, threshold)
                .await?;
        }

        for existing in &tracked {
            if observed.iter().any(|o| o.remote == existing.remote) {
                continue;
            }
            let action = classify(Some(existing), None, flags, now, threshold)?;
            if action == BranchAction::Deleted {
                self.store
                    .remove_tracked_remote(app.id, &existing.remote)
                    .await?;
                tracing::info!(
                    application_id = app.id,
                    remote = %existing.remote,
                    "Remote deleted upstream"
                );
                self.hub.branch(BranchStatus {
                    application_id: app.id,
                    remote: existing.remote.clone(),
                    sha: existing.sha.clone(),
                    state: RemoteState::Deleted,
                    age: existing.age,
                    seen: now,
                });
            }
        }
        Ok(())
    }

    async fn apply(
        &self,
        app: &Application,
        existing: Option<&TrackedRemote>,
        current: &ObservedRemote,
        action: BranchAction,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> Result<(), MonitorError> {
        match action {
            BranchAction::New => {
                self.store
                    .insert_tracked_remote(TrackedRemote {
                        application_id: app.id,
                        remote: current.remote.clone(),
                        sha: current.sha.clone(),
                        age: current.age,
                        seen: current.seen,
                        state: RemoteState::NotDetermined,
                    })
                    .await?;
                tracing::info!(
                    application_id = app.id,
                    remote = %current.remote,
                    sha = %current.sha,
                    "Tracking new remote"
                );
                if is_buildable(current, app.auto_build, now, threshold) {
                    self.store
                        .update_tracked_remote(
                            app.id,
                            &current.remote,
                            RemotePatch::state(RemoteState::Waiting),
                        )
                        .await?;
                    self.submit_build(app, current);
                }
            }
            BranchAction::Change => {
                let buildable = is_buildable(current, app.auto_build, now, threshold);
                // Writing the new sha and the Waiting state in one patch
                // keeps restart recovery airtight: a crash right after
                // this write still re-queues the build on the next start.
                let patch = RemotePatch {
                    sha: Some(current.sha.clone()),
                    age: current.age,
                    seen: Some(current.seen),
                    state: buildable.then_some(RemoteState::Waiting),
                };
                self.store
                    .update_tracked_remote(app.id, &current.remote, patch)
                    .await?;
                if buildable {
                    self.submit_build(app, current);
                }
            }
            BranchAction::Failed => {
                self.store
                    .update_tracked_remote(
                        app.id,
                        &current.remote,
                        RemotePatch::state(RemoteState::Failed),
                    )
                    .await?;
                let sha = existing.map_or_else(|| current.sha.clone(), |e| e.sha.clone());
                tracing::warn!(
                    application_id = app.id,
                    remote = %current.remote,
                    sha = %sha,
                    "Build was in flight before restart, marking failed"
                );
                self.hub.branch(BranchStatus {
                    application_id: app.id,
                    remote: current.remote.clone(),
                    sha,
                    state: RemoteState::Failed,
                    age: existing.and_then(|e| e.age),
                    seen: now,
                });
            }
            // Deletions are applied by the unmatched-tracked pass; the
            // remaining outcomes carry no mutation.
            BranchAction::Inactive | BranchAction::Done | BranchAction::Deleted => {}
        }
        Ok(())
    }

    /// Hand a buildable branch to the queue and announce the Waiting
    /// state. The row was already moved to `Waiting` by the caller.
    fn submit_build(&self, app: &Application, current: &ObservedRemote) {
        let item = self.queue.submit(BuildRequest {
            application_id: app.id,
            application_name: app.name.clone(),
            repository: app.repository.clone(),
            remote: current.remote.clone(),
            sha: current.sha.clone(),
            age: current.age,
        });
        tracing::info!(
            application_id = app.id,
            remote = %current.remote,
            sha = %current.sha,
            queue_id = %item.id,
            "Build submitted"
        );
        self.hub.branch(BranchStatus {
            application_id: app.id,
            remote: current.remote.clone(),
            sha: current.sha.clone(),
            state: RemoteState::Waiting,
            age: current.age,
            seen: current.seen,
        });
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{BuildError, PollError};
    use crate::queue::BuildRunner;
    use crate::status::StatusEvent;
    use crate::store::models::{NewApplication, RefKind};
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct NoopRunner;

    #[async_trait]
    impl BuildRunner for NoopRunner {
        async fn run(&self, _request: &BuildRequest) -> Result<(), BuildError> {
            Ok(())
        }
    }

    /// Returns scripted snapshots in order; repeats the last one.
    struct ScriptedPoller {
        script: Mutex<VecDeque<Result<Vec<ObservedRemote>, PollError>>>,
        last: Mutex<Vec<ObservedRemote>>,
    }

    impl ScriptedPoller {
        fn new(script: Vec<Result<Vec<ObservedRemote>, PollError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(Vec::new()),
            })
        }

        fn observing(refs: Vec<ObservedRemote>) -> Arc<Self> {
            Self::new(vec![Ok(refs)])
        }
    }

    #[async_trait]
    impl RemotePoller for ScriptedPoller {
        async fn list_remote_refs(
            &self,
            _application: &Application,
            _active_only: bool,
        ) -> Result<Vec<ObservedRemote>, PollError> {
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(refs)) => {
                    *self.last.lock().unwrap() = refs.clone();
                    Ok(refs)
                }
                Some(Err(e)) => Err(e),
                None => Ok(self.last.lock().unwrap().clone()),
            }
        }
    }

    /// Never answers within any reasonable timeout.
    struct StalledPoller;

    #[async_trait]
    impl RemotePoller for StalledPoller {
        async fn list_remote_refs(
            &self,
            _application: &Application,
            _active_only: bool,
        ) -> Result<Vec<ObservedRemote>, PollError> {
            tokio::time::sleep(std::time::Duration::from_secs(600)).await;
            Ok(Vec::new())
        }
    }

    /// Counts every mutating store call, delegating to a real store.
    struct RecordingStore {
        inner: Arc<SqliteStore>,
        mutations: AtomicUsize,
    }

    impl RecordingStore {
        fn new(inner: Arc<SqliteStore>) -> Arc<Self> {
            Arc::new(Self {
                inner,
                mutations: AtomicUsize::new(0),
            })
        }

        fn mutation_count(&self) -> usize {
            self.mutations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Store for RecordingStore {
        async fn list_applications(&self) -> Result<Vec<Application>, StoreError> {
            self.inner.list_applications().await
        }

        async fn get_application(&self, id: i64) -> Result<Option<Application>, StoreError> {
            self.inner.get_application(id).await
        }

        async fn create_application(
            &self,
            new: NewApplication,
        ) -> Result<Application, StoreError> {
            self.mutations.fetch_add(1, Ordering::SeqCst);
            self.inner.create_application(new).await
        }

        async fn update_application(
            &self,
            id: i64,
            patch: crate::store::models::ApplicationPatch,
        ) -> Result<Application, StoreError> {
            self.mutations.fetch_add(1, Ordering::SeqCst);
            self.inner.update_application(id, patch).await
        }

        async fn delete_application(&self, id: i64) -> Result<(), StoreError> {
            self.mutations.fetch_add(1, Ordering::SeqCst);
            self.inner.delete_application(id).await
        }

        async fn list_tracked_remotes(
            &self,
            application_id: i64,
        ) -> Result<Vec<TrackedRemote>, StoreError> {
            self.inner.list_tracked_remotes(application_id).await
        }

        async fn insert_tracked_remote(&self, row: TrackedRemote) -> Result<(), StoreError> {
            self.mutations.fetch_add(1, Ordering::SeqCst);
            self.inner.insert_tracked_remote(row).await
        }

        async fn update_tracked_remote(
            &self,
            application_id: i64,
            remote: &str,
            patch: RemotePatch,
        ) -> Result<(), StoreError> {
            self.mutations.fetch_add(1, Ordering::SeqCst);
            self.inner
                .update_tracked_remote(application_id, remote, patch)
                .await
        }

        async fn remove_tracked_remote(
            &self,
            application_id: i64,
            remote: &str,
        ) -> Result<(), StoreError> {
            self.mutations.fetch_add(1, Ordering::SeqCst);
            self.inner.remove_tracked_remote(application_id, remote).await
        }
    }

    fn test_config() -> MonitorConfig {
        MonitorConfig {
            poll_interval_secs: 60,
            rescan_interval_secs: 60,
            activity_threshold_days: 7,
            poll_timeout_secs: 60,
            init_backoff_base_secs: 0,
        }
    }

    async fn create_app(store: &Arc<SqliteStore>, auto_build: bool) -> Application {
        store
            .create_application(NewApplication {
                name: "demo".to_string(),
                label: Some("Demo".to_string()),
                repository: "/tmp/demo.git".to_string(),
                credentials_id: None,
                auto_build,
            })
            .await
            .unwrap()
    }

    fn observed(remote: &str, sha: &str) -> ObservedRemote {
        ObservedRemote {
            remote: remote.to_string(),
            kind: RefKind::Branch,
            sha: sha.to_string(),
            age: Some(Utc::now()),
            seen: Utc::now(),
        }
    }

    fn tracked_row(app_id: i64, remote: &str, sha: &str, state: RemoteState) -> TrackedRemote {
        TrackedRemote {
            application_id: app_id,
            remote: remote.to_string(),
            sha: sha.to_string(),
            age: Some(Utc::now()),
            seen: Utc::now(),
            state,
        }
    }

    struct Harness {
        store: Arc<SqliteStore>,
        queue: Arc<BuildQueue>,
        hub: StatusHub,
        monitor: RemoteMonitor,
        app: Application,
    }

    async fn harness(auto_build: bool, poller: Arc<dyn RemotePoller>) -> Harness {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let app = create_app(&store, auto_build).await;
        let hub = StatusHub::new();
        let queue = Arc::new(BuildQueue::new(
            store.clone(),
            hub.clone(),
            Arc::new(NoopRunner),
            crate::config::QueueConfig::default(),
        ));
        let monitor = RemoteMonitor::new(
            app.id,
            store.clone(),
            poller,
            queue.clone(),
            hub.clone(),
            test_config(),
        );
        Harness {
            store,
            queue,
            hub,
            monitor,
            app,
        }
    }

    #[tokio::test]
    async fn test_new_branch_is_tracked_and_submitted() {
        let poller = ScriptedPoller::observing(vec![observed("main", "abc123")]);
        let h = harness(true, poller).await;

        h.monitor.reconcile(false, false).await.unwrap();

        let remotes = h.store.list_tracked_remotes(h.app.id).await.unwrap();
        assert_eq!(remotes.len(), 1);
        assert_eq!(remotes[0].sha, "abc123");
        assert_eq!(remotes[0].state, RemoteState::Waiting);

        let progress = h.queue.snapshot().progress;
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].sha, "abc123");
        assert_eq!(progress[0].remote, "main");
    }

    #[tokio::test]
    async fn test_new_application_records_nothing_on_first_sight() {
        let poller = ScriptedPoller::observing(vec![observed("main", "abc123")]);
        let h = harness(true, poller).await;

        // Discovery pass of a freshly registered application.
        h.monitor.reconcile(true, true).await.unwrap();
        assert!(h.store.list_tracked_remotes(h.app.id).await.unwrap().is_empty());
        assert!(h.queue.snapshot().progress.is_empty());

        // The next ordinary tick picks the branch up.
        h.monitor.reconcile(false, false).await.unwrap();
        let remotes = h.store.list_tracked_remotes(h.app.id).await.unwrap();
        assert_eq!(remotes.len(), 1);
        assert_eq!(remotes[0].state, RemoteState::Waiting);
        assert_eq!(h.queue.snapshot().progress.len(), 1);
    }

    #[tokio::test]
    async fn test_changed_sha_updates_row_and_resubmits() {
        let poller = ScriptedPoller::observing(vec![observed("main", "def456")]);
        let h = harness(true, poller).await;
        h.store
            .insert_tracked_remote(tracked_row(h.app.id, "main", "abc123", RemoteState::Done))
            .await
            .unwrap();

        h.monitor.reconcile(false, false).await.unwrap();

        let remotes = h.store.list_tracked_remotes(h.app.id).await.unwrap();
        assert_eq!(remotes[0].sha, "def456");
        assert_eq!(remotes[0].state, RemoteState::Waiting);
        assert_eq!(h.queue.snapshot().progress.len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent_without_external_change() {
        let sqlite = Arc::new(SqliteStore::open_in_memory().unwrap());
        let app = create_app(&sqlite, true).await;
        let recording = RecordingStore::new(sqlite.clone());
        let hub = StatusHub::new();
        let queue = Arc::new(BuildQueue::new(
            recording.clone(),
            hub.clone(),
            Arc::new(NoopRunner),
            crate::config::QueueConfig::default(),
        ));
        let poller = ScriptedPoller::observing(vec![observed("main", "abc123")]);
        let monitor = RemoteMonitor::new(
            app.id,
            recording.clone(),
            poller,
            queue.clone(),
            hub,
            test_config(),
        );

        monitor.reconcile(false, false).await.unwrap();
        let mutations_after_first = recording.mutation_count();
        let submissions_after_first = queue.snapshot().progress.len();
        assert!(mutations_after_first > 0);
        assert_eq!(submissions_after_first, 1);

        // Nothing changed upstream; the second cycle must be a no-op.
        monitor.reconcile(false, false).await.unwrap();
        assert_eq!(recording.mutation_count(), mutations_after_first);
        assert_eq!(queue.snapshot().progress.len(), submissions_after_first);
    }

    #[tokio::test]
    async fn test_deleted_branch_removes_row_and_emits_original_sha() {
        let poller = ScriptedPoller::observing(vec![]);
        let h = harness(true, poller).await;
        h.store
            .insert_tracked_remote(tracked_row(h.app.id, "feature-x", "abc123", RemoteState::Done))
            .await
            .unwrap();
        let mut rx = h.hub.subscribe();

        h.monitor.reconcile(false, false).await.unwrap();

        assert!(h.store.list_tracked_remotes(h.app.id).await.unwrap().is_empty());
        let event = rx.recv().await.unwrap();
        match event {
            StatusEvent::Branch(status) => {
                assert_eq!(status.remote, "feature-x");
                assert_eq!(status.sha, "abc123");
                assert_eq!(status.state, RemoteState::Deleted);
            }
            other => panic!("Expected Branch event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_restart_requeues_waiting_rows() {
        let poller = ScriptedPoller::observing(vec![observed("main", "abc123")]);
        let h = harness(true, poller).await;
        h.store
            .insert_tracked_remote(tracked_row(h.app.id, "main", "abc123", RemoteState::Waiting))
            .await
            .unwrap();

        // Same sha, but the first cycle after a restart re-queues it.
        h.monitor.reconcile(true, false).await.unwrap();

        let progress = h.queue.snapshot().progress;
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].sha, "abc123");
        let remotes = h.store.list_tracked_remotes(h.app.id).await.unwrap();
        assert_eq!(remotes[0].state, RemoteState::Waiting);
    }

    #[tokio::test]
    async fn test_restart_fails_rows_left_building() {
        let poller = ScriptedPoller::observing(vec![observed("main", "abc123")]);
        let h = harness(true, poller).await;
        h.store
            .insert_tracked_remote(tracked_row(h.app.id, "main", "abc123", RemoteState::Building))
            .await
            .unwrap();
        let mut rx = h.hub.subscribe();

        h.monitor.reconcile(true, false).await.unwrap();

        let remotes = h.store.list_tracked_remotes(h.app.id).await.unwrap();
        assert_eq!(remotes[0].state, RemoteState::Failed);
        assert!(h.queue.snapshot().progress.is_empty());

        match rx.recv().await.unwrap() {
            StatusEvent::Branch(status) => assert_eq!(status.state, RemoteState::Failed),
            other => panic!("Expected Branch event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_auto_build_disabled_submits_nothing() {
        let poller = ScriptedPoller::observing(vec![observed("main", "abc123")]);
        let h = harness(false, poller).await;

        h.monitor.reconcile(false, false).await.unwrap();

        assert!(h.store.list_tracked_remotes(h.app.id).await.unwrap().is_empty());
        assert!(h.queue.snapshot().progress.is_empty());
    }

    #[tokio::test]
    async fn test_tags_are_tracked_but_never_submitted() {
        let tag = ObservedRemote {
            kind: RefKind::Tag,
            ..observed("v1.0", "abc123")
        };
        let poller = ScriptedPoller::observing(vec![tag]);
        let h = harness(true, poller).await;

        h.monitor.reconcile(false, false).await.unwrap();

        let remotes = h.store.list_tracked_remotes(h.app.id).await.unwrap();
        assert_eq!(remotes.len(), 1);
        assert_eq!(remotes[0].state, RemoteState::NotDetermined);
        assert!(h.queue.snapshot().progress.is_empty());
    }

    #[tokio::test]
    async fn test_stale_branch_is_tracked_without_submission() {
        let stale = ObservedRemote {
            age: Some(Utc::now() - Duration::days(30)),
            ..observed("old-branch", "abc123")
        };
        let poller = ScriptedPoller::observing(vec![stale]);
        let h = harness(true, poller).await;

        h.monitor.reconcile(false, false).await.unwrap();

        // New remote, but inactive: recorded, not queued.
        let remotes = h.store.list_tracked_remotes(h.app.id).await.unwrap();
        assert_eq!(remotes.len(), 1);
        assert_eq!(remotes[0].state, RemoteState::NotDetermined);
        assert!(h.queue.snapshot().progress.is_empty());
    }

    #[tokio::test]
    async fn test_hung_poller_times_out() {
        let mut config = test_config();
        config.poll_timeout_secs = 0;
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let app = create_app(&store, true).await;
        let hub = StatusHub::new();
        let queue = Arc::new(BuildQueue::new(
            store.clone(),
            hub.clone(),
            Arc::new(NoopRunner),
            crate::config::QueueConfig::default(),
        ));
        let monitor = RemoteMonitor::new(
            app.id,
            store,
            Arc::new(StalledPoller),
            queue,
            hub,
            config,
        );

        let err = monitor.reconcile(false, false).await.unwrap_err();
        assert!(matches!(err, MonitorError::PollTimeout { .. }));
    }

    #[tokio::test]
    async fn test_initialisation_retries_until_poll_succeeds() {
        let poller = ScriptedPoller::new(vec![
            Err(PollError::Aborted("network down".to_string())),
            Err(PollError::Aborted("network down".to_string())),
            Ok(vec![observed("main", "abc123")]),
        ]);
        let h = harness(true, poller).await;
        let cancel = CancellationToken::new();

        let store = h.store.clone();
        let app_id = h.app.id;
        let handle = tokio::spawn(h.monitor.run(false, cancel.clone()));

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if !store.list_tracked_remotes(app_id).await.unwrap().is_empty() {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("Monitor never finished initialising");
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        cancel.cancel();
        handle.await.unwrap();
    }
}
