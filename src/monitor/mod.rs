//! Remote-branch reconciliation.
//!
//! Everything between a registered application and a submitted build:
//!
//! - [`classify`]: the pure decision table mapping persisted vs. observed
//!   remote state to one action
//! - [`poller`]: fetching live branch and tag refs from git
//! - [`remote`]: the per-application monitor loop that reconciles and
//!   applies those decisions
//! - [`supervisor`]: lifecycle management of one monitor per application

pub mod classify;
pub mod poller;
pub mod remote;
pub mod supervisor;

pub use classify::{classify, is_active, is_buildable, BranchAction, ClassifyFlags};
pub use poller::{GitPoller, RemotePoller};
pub use remote::RemoteMonitor;
pub use supervisor::MonitorSupervisor;
