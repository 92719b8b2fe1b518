//! Error types shared across the sandbox host.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::code_safety::CodeSafetyError;
use crate::egress::EgressError;
use crate::installer::InstallError;
use crate::tool_registry::RegistryError;

/// Stable, machine-readable error kinds reported to API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    NotFound,
    Timeout,
    SsrfError,
    ExecutionError,
    InstallError,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SsrfError => "ssrf_error",
            ErrorKind::ExecutionError => "execution_error",
            ErrorKind::InstallError => "install_error",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

/// Errors surfaced by the registry and the execution engine.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Input or tool source failed validation; nothing was executed.
    #[error("{0}")]
    Validation(String),

    /// Unknown server, unknown tool or disabled tool.
    #[error("{0}")]
    NotFound(String),

    /// Execution ran past its deadline.
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Outbound request refused by the egress guard.
    #[error("{0}")]
    Ssrf(String),

    /// Tool code raised, or a passthrough upstream failed.
    #[error("{0}")]
    Execution(String),

    /// Package provisioning failed.
    #[error("{0}")]
    Install(String),

    /// Fault in the engine itself, not caused by the tool.
    #[error("{0}")]
    Internal(String),
}

/// Wire form of an error: `{"kind": ..., "message": ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl SandboxError {
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Validation(_) => ErrorKind::ValidationError,
            SandboxError::NotFound(_) => ErrorKind::NotFound,
            SandboxError::Timeout { .. } => ErrorKind::Timeout,
            SandboxError::Ssrf(_) => ErrorKind::SsrfError,
            SandboxError::Execution(_) => ErrorKind::ExecutionError,
            SandboxError::Install(_) => ErrorKind::InstallError,
            SandboxError::Internal(_) => ErrorKind::InternalError,
        }
    }
}

impl From<CodeSafetyError> for SandboxError {
    fn from(err: CodeSafetyError) -> Self {
        SandboxError::Validation(err.to_string())
    }
}

impl From<EgressError> for SandboxError {
    fn from(err: EgressError) -> Self {
        SandboxError::Ssrf(err.to_string())
    }
}

impl From<InstallError> for SandboxError {
    fn from(err: InstallError) -> Self {
        SandboxError::Install(err.to_string())
    }
}

impl From<RegistryError> for SandboxError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::ServerNotFound(_) | RegistryError::ToolNotFound { .. } => {
                SandboxError::NotFound(err.to_string())
            }
            RegistryError::InvalidTool { .. } | RegistryError::InvalidServer(_) => {
                SandboxError::Validation(err.to_string())
            }
        }
    }
}
