//! Build queue.
//!
//! Accepts build submissions from the monitors and drives them through a
//! bounded worker pool. Two policies shape dispatch:
//!
//! - at most one build per application runs at a time, so image tags and
//!   checkouts for one application never race each other
//! - a resubmission for a ref that is still waiting coalesces onto the
//!   waiting entry (latest sha wins) instead of queueing a second build
//!
//! The queue is observability and scheduling only; the tracked remote row
//! in the store remains the source of truth for build state.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::errors::BuildError;
use crate::queue::runner::{BuildRequest, BuildRunner};
use crate::status::{BranchStatus, StatusHub};
use crate::store::Store;
use crate::store::models::{RemotePatch, RemoteState};

/// Where a queue item sits: in flight (waiting or building) or finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemState {
    Progress,
    Done,
}

/// One submitted build, as exposed to the API and dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub application_id: i64,
    pub application_name: String,
    pub remote: String,
    pub sha: String,
    pub age: Option<DateTime<Utc>>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: QueueItemState,
    pub success: Option<bool>,
    pub error: Option<String>,
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub progress: Vec<QueueItem>,
    pub done: Vec<QueueItem>,
}

struct PendingBuild {
    item: QueueItem,
    request: BuildRequest,
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<PendingBuild>,
    running: Vec<QueueItem>,
    done: VecDeque<QueueItem>,
}

pub struct BuildQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    store: Arc<dyn Store>,
    hub: StatusHub,
    runner: Arc<dyn BuildRunner>,
    config: QueueConfig,
}

impl BuildQueue {
    pub fn new(
        store: Arc<dyn Store>,
        hub: StatusHub,
        runner: Arc<dyn BuildRunner>,
        config: QueueConfig,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            store,
            hub,
            runner,
            config,
        }
    }

    /// Queue state is plain data; a poisoned lock still holds a consistent
    /// snapshot, so recover it instead of propagating the panic.
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit a build. If the same application/ref pair is already waiting,
    /// the waiting entry is updated to the submitted sha and no second
    /// entry is queued. Returns the queue item covering this submission.
    pub fn submit(&self, request: BuildRequest) -> QueueItem {
        let mut state = self.state();
        if let Some(pending) = state.waiting.iter_mut().find(|p| {
            p.request.application_id == request.application_id
                && p.request.remote == request.remote
        }) {
            pending.item.sha = request.sha.clone();
            pending.item.age = request.age;
            pending.item.submitted_at = Utc::now();
            pending.request = request;
            let item = pending.item.clone();
            drop(state);
            self.notify.notify_one();
            return item;
        }

        let item = QueueItem {
            id: Uuid::new_v4(),
            application_id: request.application_id,
            application_name: request.application_name.clone(),
            remote: request.remote.clone(),
            sha: request.sha.clone(),
            age: request.age,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            state: QueueItemState::Progress,
            success: None,
            error: None,
        };
        state.waiting.push_back(PendingBuild {
            item: item.clone(),
            request,
        });
        drop(state);
        self.notify.notify_one();
        item
    }

    /// In-flight items (building first, then waiting) and the bounded
    /// recent-history done list, newest first.
    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state();
        let mut progress = state.running.clone();
        progress.extend(state.waiting.iter().map(|p| p.item.clone()));
        QueueSnapshot {
            progress,
            done: state.done.iter().cloned().collect(),
        }
    }

    /// Spawn the worker pool. Workers drain the queue until cancelled. A
    /// build in flight when the token fires is abandoned, not awaited: its
    /// child processes die with the dropped task and the tracked row is
    /// recovered on the next daemon start.
    pub fn start_workers(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.config.max_concurrent_builds)
            .map(|worker_id| {
                let queue = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(queue.run_worker(worker_id, cancel))
            })
            .collect()
    }

    async fn run_worker(self: Arc<Self>, worker_id: usize, cancel: CancellationToken) {
        tracing::debug!(worker_id, "Build worker started");
        loop {
            match self.take_next() {
                Some(pending) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::info!(worker_id, "Build abandoned for shutdown");
                            break;
                        }
                        _ = self.execute(pending, worker_id) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.notify.notified() => {}
                    }
                }
            }
            if cancel.is_cancelled() {
                break;
            }
        }
        tracing::debug!(worker_id, "Build worker stopped");
    }

    /// Pop the first waiting build whose application has nothing running.
    fn take_next(&self) -> Option<PendingBuild> {
        let mut state = self.state();
        let running = &state.running;
        let index = state.waiting.iter().position(|p| {
            !running
                .iter()
                .any(|r| r.application_id == p.item.application_id)
        })?;
        let mut pending = state.waiting.remove(index)?;
        pending.item.started_at = Some(Utc::now());
        state.running.push(pending.item.clone());
        if !state.waiting.is_empty() {
            // Another worker may have eligible work too.
            self.notify.notify_one();
        }
        Some(pending)
    }

    async fn execute(&self, pending: PendingBuild, worker_id: usize) {
        let PendingBuild { mut item, request } = pending;
        tracing::info!(
            worker_id,
            application_id = item.application_id,
            remote = %item.remote,
            sha = %item.sha,
            "Dispatching build"
        );
        self.mark_remote(&request, RemoteState::Building).await;

        let timeout = self.config.build_timeout();
        let result = match tokio::time::timeout(timeout, self.runner.run(&request)).await {
            Ok(result) => result,
            Err(_) => Err(BuildError::Timeout {
                seconds: self.config.build_timeout_secs,
            }),
        };

        let (remote_state, success, error) = match result {
            Ok(()) => (RemoteState::Done, true, None),
            Err(e) => {
                tracing::warn!(
                    application_id = item.application_id,
                    remote = %item.remote,
                    error = %e,
                    "Build failed"
                );
                (RemoteState::Failed, false, Some(e.to_string()))
            }
        };
        self.mark_remote(&request, remote_state).await;

        item.finished_at = Some(Utc::now());
        item.state = QueueItemState::Done;
        item.success = Some(success);
        item.error = error;

        let mut state = self.state();
        state.running.retain(|r| r.id != item.id);
        state.done.push_front(item);
        while state.done.len() > self.config.done_history {
            state.done.pop_back();
        }
        drop(state);
        // The freed application slot may unblock a queued follow-up.
        self.notify.notify_one();
    }

    /// Record a build-state transition on the tracked remote row and fan it
    /// out. A missing row (ref deleted mid-build) is logged, not fatal.
    async fn mark_remote(&self, request: &BuildRequest, state: RemoteState) {
        let result = self
            .store
            .update_tracked_remote(
                request.application_id,
                &request.remote,
                RemotePatch::state(state),
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(
                application_id = request.application_id,
                remote = %request.remote,
                error = %e,
                "Failed to record build state"
            );
        }
        self.hub.branch(BranchStatus {
            application_id: request.application_id,
            remote: request.remote.clone(),
            sha: request.sha.clone(),
            state,
            age: request.age,
            seen: Utc::now(),
        });
    }
}

// ── Tests ────────────────────────────────────────────────────────────
