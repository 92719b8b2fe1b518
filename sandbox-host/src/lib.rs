//! Sandbox host: tool registry, safety validation, egress control, package
//! provisioning and the execution engine behind the sandbox API.

pub mod actors;
pub mod app_state;
pub mod cli;
pub mod code_safety;
pub mod egress;
pub mod egress_client;
pub mod error;
pub mod installer;
pub mod package_index;
pub mod redaction;
pub mod schema;
pub mod settings;
pub mod stdlib_modules;
pub mod tool_execution;
pub mod tool_registry;

pub use app_state::{HealthStatus, HostError, SandboxHost};
pub use error::{ErrorBody, ErrorKind, SandboxError};
pub use settings::SandboxSettings;
pub use tool_execution::ExecutionResult;
