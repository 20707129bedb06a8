//! Typed error hierarchy for the slipway daemon.
//!
//! Four top-level enums cover the four subsystems:
//! - `StoreError` — datastore failures
//! - `PollError` — remote ref listing failures
//! - `MonitorError` — per-application reconciliation failures
//! - `BuildError` — build runner failures
//!
//! Errors never cross application boundaries: a failing poll or store call
//! fails the current reconciliation cycle of one monitor and nothing else.

use thiserror::Error;

/// Errors from the datastore.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Application {id} not found")]
    ApplicationNotFound { id: i64 },

    #[error("Tracked remote '{remote}' not found for application {application_id}")]
    RemoteNotFound { application_id: i64, remote: String },

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

/// Errors from listing the refs of an application's git remote.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("Failed to fetch {repository}: {source}")]
    Fetch {
        repository: String,
        #[source]
        source: git2::Error,
    },

    #[error("Failed to prepare ref cache at {path}: {source}")]
    Cache {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Poll task aborted: {0}")]
    Aborted(String),
}

/// Errors from a single reconciliation cycle of a remote monitor.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Branch classified with neither a tracked nor an observed remote")]
    InvariantViolation,

    #[error("Remote poll timed out after {seconds}s")]
    PollTimeout { seconds: u64 },

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from running one queued build.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Failed to prepare build workspace at {path}: {source}")]
    Workspace {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Clone of {repository} failed with exit code {exit_code}")]
    CloneFailed { repository: String, exit_code: i32 },

    #[error("Checkout of {sha} failed with exit code {exit_code}")]
    CheckoutFailed { sha: String, exit_code: i32 },

    #[error("Image build failed with exit code {exit_code}")]
    ImageBuildFailed { exit_code: i32 },

    #[error("Build timed out after {seconds}s")]
    Timeout { seconds: u64 },
}
