use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered application: a git repository slipway watches and builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: i64,
    pub name: String,
    pub label: Option<String>,
    pub repository: String,
    pub credentials_id: Option<i64>,
    pub auto_build: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields required to register an application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewApplication {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    pub repository: String,
    #[serde(default)]
    pub credentials_id: Option<i64>,
    #[serde(default = "default_auto_build")]
    pub auto_build: bool,
}

fn default_auto_build() -> bool {
    true
}

/// Partial update of an application; absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub credentials_id: Option<i64>,
    #[serde(default)]
    pub auto_build: Option<bool>,
}

/// Lifecycle of a tracked remote, as persisted and as published to clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    NotDetermined,
    Waiting,
    Building,
    Done,
    Failed,
    Deleted,
}

impl RemoteState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotDetermined => "not_determined",
            Self::Waiting => "waiting",
            Self::Building => "building",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for RemoteState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RemoteState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_determined" => Ok(Self::NotDetermined),
            "waiting" => Ok(Self::Waiting),
            "building" => Ok(Self::Building),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "deleted" => Ok(Self::Deleted),
            _ => Err(format!("Invalid remote state: {}", s)),
        }
    }
}

/// Kind of git ref a remote entry refers to. Only branches are buildable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    Branch,
    Tag,
}

impl RefKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Branch => "branch",
            Self::Tag => "tag",
        }
    }
}

impl std::fmt::Display for RefKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "branch" => Ok(Self::Branch),
            "tag" => Ok(Self::Tag),
            _ => Err(format!("Invalid ref kind: {}", s)),
        }
    }
}

/// The persisted record of a remote ref slipway has decided to track.
///
/// `age` is the last commit time of the ref (None when the ref does not
/// resolve to a commit), `seen` the last time the monitor observed it.
/// One row per (application, remote name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedRemote {
    pub application_id: i64,
    pub remote: String,
    pub sha: String,
    pub age: Option<DateTime<Utc>>,
    pub seen: DateTime<Utc>,
    pub state: RemoteState,
}

/// Partial update of a tracked remote; present fields are written.
#[derive(Debug, Clone, Default)]
pub struct RemotePatch {
    pub sha: Option<String>,
    pub age: Option<DateTime<Utc>>,
    pub seen: Option<DateTime<Utc>>,
    pub state: Option<RemoteState>,
}

impl RemotePatch {
    pub fn state(state: RemoteState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }
}

/// A ref as listed from the application's git remote on one poll.
/// Ephemeral: produced by the poller, consumed by the same reconciliation
/// cycle, never persisted as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedRemote {
    pub remote: String,
    pub kind: RefKind,
    pub sha: String,
    pub age: Option<DateTime<Utc>>,
    pub seen: DateTime<Utc>,
}

// API view types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationDetail {
    pub application: Application,
    pub remotes: Vec<TrackedRemote>,
}
