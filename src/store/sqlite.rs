use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use super::Store;
use super::models::*;
use crate::errors::StoreError;

/// Async-safe SQLite store.
///
/// Wraps `SlipwayDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads. The mutex also serializes row
/// writes, which is what lets several monitors and queue workers share one
/// store without further coordination.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<std::sync::Mutex<SlipwayDb>>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::wrap(SlipwayDb::new(path)?))
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::wrap(SlipwayDb::new_in_memory()?))
    }

    fn wrap(db: SlipwayDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&SlipwayDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard).map_err(StoreError::Database)
        })
        .await
        .map_err(|e| StoreError::Database(anyhow::anyhow!("DB task panicked: {}", e)))?
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn list_applications(&self) -> Result<Vec<Application>, StoreError> {
        self.call(|db| db.list_applications()).await
    }

    async fn get_application(&self, id: i64) -> Result<Option<Application>, StoreError> {
        self.call(move |db| db.get_application(id)).await
    }

    async fn create_application(&self, new: NewApplication) -> Result<Application, StoreError> {
        self.call(move |db| db.create_application(&new)).await
    }

    async fn update_application(
        &self,
        id: i64,
        patch: ApplicationPatch,
    ) -> Result<Application, StoreError> {
        self.call(move |db| db.update_application(id, &patch))
            .await?
            .ok_or(StoreError::ApplicationNotFound { id })
    }

    async fn delete_application(&self, id: i64) -> Result<(), StoreError> {
        let deleted = self.call(move |db| db.delete_application(id)).await?;
        if deleted {
            Ok(())
        } else {
            Err(StoreError::ApplicationNotFound { id })
        }
    }

    async fn list_tracked_remotes(
        &self,
        application_id: i64,
    ) -> Result<Vec<TrackedRemote>, StoreError> {
        self.call(move |db| db.list_tracked_remotes(application_id))
            .await
    }

    async fn insert_tracked_remote(&self, row: TrackedRemote) -> Result<(), StoreError> {
        self.call(move |db| db.insert_tracked_remote(&row)).await
    }

    async fn update_tracked_remote(
        &self,
        application_id: i64,
        remote: &str,
        patch: RemotePatch,
    ) -> Result<(), StoreError> {
        let remote = remote.to_string();
        let name = remote.clone();
        let updated = self
            .call(move |db| db.update_tracked_remote(application_id, &remote, &patch))
            .await?;
        if updated {
            Ok(())
        } else {
            Err(StoreError::RemoteNotFound {
                application_id,
                remote: name,
            })
        }
    }

    async fn remove_tracked_remote(
        &self,
        application_id: i64,
        remote: &str,
    ) -> Result<(), StoreError> {
        let remote = remote.to_string();
        let name = remote.clone();
        let removed = self
            .call(move |db| db.remove_tracked_remote(application_id, &remote))
            .await?;
        if removed {
            Ok(())
        } else {
            Err(StoreError::RemoteNotFound {
                application_id,
                remote: name,
            })
        }
    }
}

pub struct SlipwayDb {
    conn: Connection,
}

impl SlipwayDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS applications (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    label TEXT,
                    repository TEXT NOT NULL,
                    credentials_id INTEGER,
                    auto_build INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tracked_remotes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    application_id INTEGER NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
                    remote TEXT NOT NULL,
                    sha TEXT NOT NULL,
                    age TEXT,
                    seen TEXT NOT NULL,
                    state TEXT NOT NULL DEFAULT 'not_determined',
                    UNIQUE(application_id, remote)
                );

                CREATE INDEX IF NOT EXISTS idx_tracked_remotes_app ON tracked_remotes(application_id);
                CREATE INDEX IF NOT EXISTS idx_tracked_remotes_state ON tracked_remotes(application_id, state);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Application CRUD ──────────────────────────────────────────────

    pub fn create_application(&self, new: &NewApplication) -> Result<Application> {
        self.conn
            .execute(
                "INSERT INTO applications (name, label, repository, credentials_id, auto_build, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    new.name,
                    new.label,
                    new.repository,
                    new.credentials_id,
                    new.auto_build,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to insert application")?;
        let id = self.conn.last_insert_rowid();
        self.get_application(id)?
            .context("Application not found after insert")
    }

    pub fn list_applications(&self) -> Result<Vec<Application>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, label, repository, credentials_id, auto_build, created_at
                 FROM applications ORDER BY id",
            )
            .context("Failed to prepare list_applications")?;
        let rows = stmt
            .query_map([], application_row)
            .context("Failed to query applications")?;
        let mut applications = Vec::new();
        for row in rows {
            let r = row.context("Failed to read application row")?;
            applications.push(r.into_application()?);
        }
        Ok(applications)
    }

    pub fn get_application(&self, id: i64) -> Result<Option<Application>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, label, repository, credentials_id, auto_build, created_at
                 FROM applications WHERE id = ?1",
            )
            .context("Failed to prepare get_application")?;
        let mut rows = stmt
            .query_map(params![id], application_row)
            .context("Failed to query application")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read application row")?;
                Ok(Some(r.into_application()?))
            }
            None => Ok(None),
        }
    }

    pub fn update_application(
        &self,
        id: i64,
        patch: &ApplicationPatch,
    ) -> Result<Option<Application>> {
        if self.get_application(id)?.is_none() {
            return Ok(None);
        }

        // Use unchecked_transaction so all updates are atomic.
        // Safety: the store mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if let Some(name) = &patch.name {
            tx.execute(
                "UPDATE applications SET name = ?1 WHERE id = ?2",
                params![name, id],
            )
            .context("Failed to update application name")?;
        }
        if let Some(label) = &patch.label {
            tx.execute(
                "UPDATE applications SET label = ?1 WHERE id = ?2",
                params![label, id],
            )
            .context("Failed to update application label")?;
        }
        if let Some(repository) = &patch.repository {
            tx.execute(
                "UPDATE applications SET repository = ?1 WHERE id = ?2",
                params![repository, id],
            )
            .context("Failed to update application repository")?;
        }
        if let Some(credentials_id) = patch.credentials_id {
            tx.execute(
                "UPDATE applications SET credentials_id = ?1 WHERE id = ?2",
                params![credentials_id, id],
            )
            .context("Failed to update application credentials_id")?;
        }
        if let Some(auto_build) = patch.auto_build {
            tx.execute(
                "UPDATE applications SET auto_build = ?1 WHERE id = ?2",
                params![auto_build, id],
            )
            .context("Failed to update application auto_build")?;
        }

        tx.commit().context("Failed to commit application update")?;
        self.get_application(id)
    }

    pub fn delete_application(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM applications WHERE id = ?1", params![id])
            .context("Failed to delete application")?;
        Ok(count > 0)
    }

    // ── Tracked remotes ───────────────────────────────────────────────

    pub fn list_tracked_remotes(&self, application_id: i64) -> Result<Vec<TrackedRemote>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT application_id, remote, sha, age, seen, state
                 FROM tracked_remotes WHERE application_id = ?1 ORDER BY remote",
            )
            .context("Failed to prepare list_tracked_remotes")?;
        let rows = stmt
            .query_map(params![application_id], |row| {
                Ok(RemoteRow {
                    application_id: row.get(0)?,
                    remote: row.get(1)?,
                    sha: row.get(2)?,
                    age: row.get(3)?,
                    seen: row.get(4)?,
                    state: row.get(5)?,
                })
            })
            .context("Failed to query tracked remotes")?;
        let mut remotes = Vec::new();
        for row in rows {
            let r = row.context("Failed to read tracked remote row")?;
            remotes.push(r.into_tracked_remote()?);
        }
        Ok(remotes)
    }

    pub fn insert_tracked_remote(&self, row: &TrackedRemote) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO tracked_remotes (application_id, remote, sha, age, seen, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.application_id,
                    row.remote,
                    row.sha,
                    row.age.map(|t| t.to_rfc3339()),
                    row.seen.to_rfc3339(),
                    row.state.as_str(),
                ],
            )
            .context("Failed to insert tracked remote")?;
        Ok(())
    }

    pub fn update_tracked_remote(
        &self,
        application_id: i64,
        remote: &str,
        patch: &RemotePatch,
    ) -> Result<bool> {
        let exists: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM tracked_remotes WHERE application_id = ?1 AND remote = ?2",
                params![application_id, remote],
                |row| row.get(0),
            )
            .context("Failed to check tracked remote existence")?;
        if !exists {
            return Ok(false);
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if let Some(sha) = &patch.sha {
            tx.execute(
                "UPDATE tracked_remotes SET sha = ?1 WHERE application_id = ?2 AND remote = ?3",
                params![sha, application_id, remote],
            )
            .context("Failed to update remote sha")?;
        }
        if let Some(age) = patch.age {
            tx.execute(
                "UPDATE tracked_remotes SET age = ?1 WHERE application_id = ?2 AND remote = ?3",
                params![age.to_rfc3339(), application_id, remote],
            )
            .context("Failed to update remote age")?;
        }
        if let Some(seen) = patch.seen {
            tx.execute(
                "UPDATE tracked_remotes SET seen = ?1 WHERE application_id = ?2 AND remote = ?3",
                params![seen.to_rfc3339(), application_id, remote],
            )
            .context("Failed to update remote seen")?;
        }
        if let Some(state) = &patch.state {
            tx.execute(
                "UPDATE tracked_remotes SET state = ?1 WHERE application_id = ?2 AND remote = ?3",
                params![state.as_str(), application_id, remote],
            )
            .context("Failed to update remote state")?;
        }

        tx.commit().context("Failed to commit remote update")?;
        Ok(true)
    }

    pub fn remove_tracked_remote(&self, application_id: i64, remote: &str) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "DELETE FROM tracked_remotes WHERE application_id = ?1 AND remote = ?2",
                params![application_id, remote],
            )
            .context("Failed to delete tracked remote")?;
        Ok(count > 0)
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Intermediate row struct for applications before converting timestamps.
struct ApplicationRow {
    id: i64,
    name: String,
    label: Option<String>,
    repository: String,
    credentials_id: Option<i64>,
    auto_build: bool,
    created_at: String,
}

fn application_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApplicationRow> {
    Ok(ApplicationRow {
        id: row.get(0)?,
        name: row.get(1)?,
        label: row.get(2)?,
        repository: row.get(3)?,
        credentials_id: row.get(4)?,
        auto_build: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl ApplicationRow {
    fn into_application(self) -> Result<Application> {
        Ok(Application {
            id: self.id,
            name: self.name,
            label: self.label,
            repository: self.repository,
            credentials_id: self.credentials_id,
            auto_build: self.auto_build,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

/// Intermediate row struct for tracked_remotes before converting the state
/// string and timestamps into typed values.
struct RemoteRow {
    application_id: i64,
    remote: String,
    sha: String,
    age: Option<String>,
    seen: String,
    state: String,
}

impl RemoteRow {
    fn into_tracked_remote(self) -> Result<TrackedRemote> {
        let state = RemoteState::from_str(&self.state)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse remote state")?;
        Ok(TrackedRemote {
            application_id: self.application_id,
            remote: self.remote,
            sha: self.sha,
            age: self.age.as_deref().map(parse_timestamp).transpose()?,
            seen: parse_timestamp(&self.seen)?,
            state,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp in database: '{}'", s))?
        .with_timezone(&Utc))
}

// ── Tests ─────────────────────────────────────────────────────────────
