//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module  | Commands handled            |
//! |---------|-----------------------------|
//! | `serve` | `Serve`                     |
//! | `apps`  | `Register`, `Applications`  |

pub mod apps;
pub mod serve;

pub use apps::{cmd_applications, cmd_register};
pub use serve::cmd_serve;
