//! Persistence layer for applications and their tracked remotes.
//!
//! ## Structure
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `models` | `Application`, `TrackedRemote`, `ObservedRemote`, enums |
//! | `sqlite` | `SqliteStore`: rusqlite behind a blocking-pool handle |
//!
//! The `Store` trait is the seam between the reconciliation engine and the
//! database: monitors and the build queue only ever see `Arc<dyn Store>`,
//! which keeps reconciliation tests free of SQLite plumbing when they want
//! to be (and lets them run against the real in-memory store when they
//! don't).

pub mod models;
pub mod sqlite;

pub use models::*;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::errors::StoreError;

/// Datastore contract for the reconciliation engine and the HTTP API.
///
/// All write operations are serialized by the implementation; callers never
/// coordinate row-level locking themselves.
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_applications(&self) -> Result<Vec<Application>, StoreError>;

    async fn get_application(&self, id: i64) -> Result<Option<Application>, StoreError>;

    async fn create_application(&self, new: NewApplication) -> Result<Application, StoreError>;

    /// Applies the present fields of `patch`. Fails with
    /// `ApplicationNotFound` when the id does not exist.
    async fn update_application(
        &self,
        id: i64,
        patch: ApplicationPatch,
    ) -> Result<Application, StoreError>;

    /// Removes the application and, by cascade, all its tracked remotes.
    async fn delete_application(&self, id: i64) -> Result<(), StoreError>;

    async fn list_tracked_remotes(
        &self,
        application_id: i64,
    ) -> Result<Vec<TrackedRemote>, StoreError>;

    async fn insert_tracked_remote(&self, row: TrackedRemote) -> Result<(), StoreError>;

    /// Applies the present fields of `patch` to one (application, remote)
    /// row. Fails with `RemoteNotFound` when no such row exists.
    async fn update_tracked_remote(
        &self,
        application_id: i64,
        remote: &str,
        patch: RemotePatch,
    ) -> Result<(), StoreError>;

    /// Fails with `RemoteNotFound` when no such row exists.
    async fn remove_tracked_remote(
        &self,
        application_id: i64,
        remote: &str,
    ) -> Result<(), StoreError>;
}
