pub mod config;
pub mod errors;
pub mod monitor;
pub mod queue;
pub mod server;
pub mod status;
pub mod store;
