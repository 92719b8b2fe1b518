//! HTTP service for the tool sandbox.

pub mod server;

pub use sandbox_host::cli::CliArgs;
pub use server::{router, run_with_args, serve, ApiState};
