//! Protocol types for host-sandbox communication
//!
//! These types define the data exchanged between the host service and the
//! sandboxed Python execution environment.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Request from host to execute a tool's Python source
#[derive(Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Full module source of the tool
    pub source: String,
    /// Name used for compile errors (e.g. `<tool:weather.lookup>`)
    pub source_name: String,
    /// Candidate entry point names, tried in order
    pub entry_points: Vec<String>,
    /// Validated keyword arguments for the entry point
    pub arguments: Map<String, Value>,
    /// Top-level modules tool code may import
    pub allowed_modules: Vec<String>,
    /// Extra directories placed on the interpreter's module search path
    #[serde(default)]
    pub module_paths: Vec<String>,
    /// Secrets reachable through `get_secret(name)`
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    /// Upper bound on captured stdout, in bytes
    pub max_output_bytes: usize,
}

impl std::fmt::Debug for ExecutionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionRequest")
            .field("source_name", &self.source_name)
            .field("source_len", &self.source.len())
            .field("entry_points", &self.entry_points)
            .field("allowed_modules", &self.allowed_modules)
            .field("secrets", &self.secrets.len())
            .finish()
    }
}

/// Status of execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ExecutionStatus {
    /// Entry point returned normally
    Complete,
    /// Tool code raised; message is `ExceptionType: message`, never a traceback
    Error(String),
    /// Tool code tried to import a module outside its allowlist
    ImportDenied(String),
    /// Execution was interrupted by the host (deadline exceeded)
    Interrupted,
    /// The sandbox could not be prepared; not caused by tool code
    SetupFailed(String),
}

/// Result returned from the sandbox to the host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Status of execution
    pub status: ExecutionStatus,
    /// Captured `print` output
    pub stdout: String,
    /// True when stdout hit the configured limit
    pub stdout_truncated: bool,
    /// Return value of the entry point, as JSON
    pub result: Option<Value>,
}

impl Default for ExecutionResult {
    fn default() -> Self {
        Self {
            status: ExecutionStatus::Complete,
            stdout: String::new(),
            stdout_truncated: false,
            result: None,
        }
    }
}

impl ExecutionResult {
    /// Create a result indicating an error raised by tool code
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Error(message.into()),
            ..Default::default()
        }
    }

    /// Create a result for a sandbox that could not be set up
    pub fn setup_failed(message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::SetupFailed(message.into()),
            ..Default::default()
        }
    }

    /// Create a result for an interrupted run; output is intentionally empty
    pub fn interrupted() -> Self {
        Self {
            status: ExecutionStatus::Interrupted,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_result_default() {
        let result = ExecutionResult::default();
        assert_eq!(result.status, ExecutionStatus::Complete);
        assert!(result.result.is_none());
        assert!(!result.stdout_truncated);
    }

    #[test]
    fn test_debug_hides_secret_values() {
        let mut secrets = HashMap::new();
        secrets.insert("API_KEY".to_string(), "sk-live-123".to_string());
        let request = ExecutionRequest {
            source: "def main():\n    return 1\n".to_string(),
            source_name: "<tool:t>".to_string(),
            entry_points: vec!["main".to_string()],
            arguments: Map::new(),
            allowed_modules: vec![],
            module_paths: vec![],
            secrets,
            max_output_bytes: 1024,
        };

        let rendered = format!("{:?}", request);
        assert!(!rendered.contains("sk-live-123"));
        assert!(!rendered.contains("API_KEY"));
    }
}
