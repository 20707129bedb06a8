//! Build queue and execution.
//!
//! Monitors submit buildable branches here; a bounded worker pool drains
//! the queue and hands each build to a [`BuildRunner`].
//!
//! ## Components
//!
//! - [`build`]: the queue itself with its coalescing and dispatch policy
//! - [`runner`]: build execution through `git` and `docker` processes

pub mod build;
pub mod runner;

pub use build::{BuildQueue, QueueItem, QueueItemState, QueueSnapshot};
pub use runner::{BuildRequest, BuildRunner, ProcessBuildRunner};
