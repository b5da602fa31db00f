//! CLI command implementations.

mod server;
mod service;
mod start;

pub use server::{run_server, ServerArgs};
pub use service::{run_service, ServiceArgs};
pub use start::{run_start, StartArgs};
