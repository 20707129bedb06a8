//! Configuration for the slipway daemon.
//!
//! Settings are read from a `slipway.toml` file; every section and key is
//! optional and falls back to a default, so a missing file yields a fully
//! usable configuration. CLI flags (and their env fallbacks) override file
//! values in `cmd::serve`.
//!
//! # Configuration File Format
//!
//! ```toml
//! [daemon]
//! db_path = "slipway.db"
//! listen_addr = "127.0.0.1:7070"
//! workspace_dir = ".slipway"
//!
//! [monitor]
//! poll_interval_secs = 15
//! rescan_interval_secs = 30
//! activity_threshold_days = 7
//! poll_timeout_secs = 60
//! init_backoff_base_secs = 5
//!
//! [queue]
//! max_concurrent_builds = 2
//! done_history = 50
//! build_timeout_secs = 1800
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon-level settings: storage, listener, working directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Address the HTTP API binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Directory holding ref caches and build workspaces
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("slipway.db")
}

fn default_listen_addr() -> String {
    "127.0.0.1:7070".to_string()
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from(".slipway")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            listen_addr: default_listen_addr(),
            workspace_dir: default_workspace_dir(),
        }
    }
}

/// Remote monitor timing and classification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between steady-state reconciliation ticks of one monitor
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Seconds between supervisor rescans for newly registered applications
    #[serde(default = "default_rescan_interval_secs")]
    pub rescan_interval_secs: u64,
    /// Days without a commit before a branch counts as inactive
    #[serde(default = "default_activity_threshold_days")]
    pub activity_threshold_days: i64,
    /// Upper bound on a single remote poll
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// Base of the linear initialisation backoff (attempt n waits n * base)
    #[serde(default = "default_init_backoff_base_secs")]
    pub init_backoff_base_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    15
}

fn default_rescan_interval_secs() -> u64 {
    30
}

fn default_activity_threshold_days() -> i64 {
    7
}

fn default_poll_timeout_secs() -> u64 {
    60
}

fn default_init_backoff_base_secs() -> u64 {
    5
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            rescan_interval_secs: default_rescan_interval_secs(),
            activity_threshold_days: default_activity_threshold_days(),
            poll_timeout_secs: default_poll_timeout_secs(),
            init_backoff_base_secs: default_init_backoff_base_secs(),
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn init_backoff_base(&self) -> Duration {
        Duration::from_secs(self.init_backoff_base_secs)
    }

    /// The activity window as a chrono duration, for timestamp arithmetic.
    pub fn activity_threshold(&self) -> chrono::Duration {
        chrono::Duration::days(self.activity_threshold_days)
    }
}

/// Build queue sizing and timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Global worker pool size (builds running at once, across applications)
    #[serde(default = "default_max_concurrent_builds")]
    pub max_concurrent_builds: usize,
    /// Completed builds kept in the done list
    #[serde(default = "default_done_history")]
    pub done_history: usize,
    /// Upper bound on a single build (clone + image build)
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,
}

fn default_max_concurrent_builds() -> usize {
    2
}

fn default_done_history() -> usize {
    50
}

fn default_build_timeout_secs() -> u64 {
    1800
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_builds: default_max_concurrent_builds(),
            done_history: default_done_history(),
            build_timeout_secs: default_build_timeout_secs(),
        }
    }
}

impl QueueConfig {
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }
}

/// The complete slipway.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlipwayConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl SlipwayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse slipway.toml")
    }

    /// Load from an explicit path, or from `slipway.toml` in the working
    /// directory when none is given. A missing file yields the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let fallback = Path::new("slipway.toml");
                if fallback.exists() {
                    Self::load(fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Directory holding the bare ref-cache repositories.
    pub fn refs_dir(&self) -> PathBuf {
        self.daemon.workspace_dir.join("refs")
    }

    /// Directory holding per-build clone workspaces.
    pub fn builds_dir(&self) -> PathBuf {
        self.daemon.workspace_dir.join("builds")
    }
}
