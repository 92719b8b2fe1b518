//! Tool Registry - In-memory map of servers to their tools and policy
//!
//! Each server registers a complete context at once: its tools, secrets,
//! allowed modules and allowed hosts. Registration is all-or-nothing: every
//! tool is validated before the context replaces the previous one, so a
//! single bad tool leaves the server exactly as it was.
//!
//! Contexts are stored behind `Arc` so executions hold a consistent snapshot
//! even if the server is re-registered or removed while they run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::code_safety::{collect_imports, CodeSafetyValidator};

/// Python reserved keywords that cannot be used as identifiers
const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await",
    "break", "class", "continue", "def", "del", "elif", "else", "except",
    "finally", "for", "from", "global", "if", "import", "in", "is",
    "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("invalid tool '{tool}': {reason}")]
    InvalidTool { tool: String, reason: String },

    #[error("invalid registration: {0}")]
    InvalidServer(String),

    #[error("server '{0}' is not registered")]
    ServerNotFound(String),

    #[error("tool '{tool}' not found on server '{server_id}'")]
    ToolNotFound { server_id: String, tool: String },
}

/// How a tool is run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    /// Python source executed in the sandbox
    #[default]
    Code,
    /// Proxied as an HTTP call to an external service
    Passthrough,
}

/// External endpoint for a passthrough tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassthroughTarget {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Header values may reference secrets as `${NAME}`
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// A tool as submitted at registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_input_schema")]
    pub input_schema: Value,
    #[serde(default)]
    pub source_code: Option<String>,
    /// Seconds; the configured default applies when unset
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub kind: ToolKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Function to call; defaults to the tool name, then `main`
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub target: Option<PassthroughTarget>,
}

fn default_input_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

fn default_enabled() -> bool {
    true
}

impl ToolDefinition {
    /// Entry point names to try, in order
    pub fn entry_points(&self) -> Vec<String> {
        match &self.entry_point {
            Some(name) => vec![name.clone()],
            None if self.name == "main" => vec!["main".to_string()],
            None => vec![self.name.clone(), "main".to_string()],
        }
    }
}

/// A validated tool with its precomputed import list
#[derive(Debug, Clone)]
pub struct RegisteredTool {
    pub definition: ToolDefinition,
    /// Top-level modules imported anywhere in the source (`"."` for relative)
    pub imports: Vec<String>,
}

/// Everything registered for one server
pub struct ServerContext {
    pub server_id: String,
    pub tools: BTreeMap<String, RegisteredTool>,
    pub secrets: HashMap<String, String>,
    /// Empty means the global default module set applies
    pub allowed_modules: Vec<String>,
    /// Empty means no egress at all
    pub allowed_hosts: Vec<String>,
    pub registered_at: DateTime<Utc>,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let masked = format!("{} masked", self.secrets.len());
        f.debug_struct("ServerContext")
            .field("server_id", &self.server_id)
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .field("secrets", &masked)
            .field("allowed_modules", &self.allowed_modules)
            .field("allowed_hosts", &self.allowed_hosts)
            .field("registered_at", &self.registered_at)
            .finish()
    }
}

/// Body of a registration
#[derive(Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub server_id: String,
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    #[serde(default)]
    pub allowed_modules: Vec<String>,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

impl std::fmt::Debug for RegistrationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationRequest")
            .field("server_id", &self.server_id)
            .field("tools", &self.tools.len())
            .field("secrets", &self.secrets.len())
            .field("allowed_modules", &self.allowed_modules)
            .field("allowed_hosts", &self.allowed_hosts)
            .finish()
    }
}

/// Listing entry for `list_tools`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
    pub kind: ToolKind,
    pub enabled: bool,
    pub input_schema: Value,
}

/// A resolved tool and the context it belongs to
#[derive(Debug, Clone)]
pub struct ToolLookup {
    pub context: Arc<ServerContext>,
    pub tool: RegisteredTool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub servers: usize,
    pub tools: usize,
}

/// Central registry of all server contexts
pub struct ToolRegistry {
    servers: HashMap<String, Arc<ServerContext>>,
    validator: CodeSafetyValidator,
    max_timeout_secs: f64,
}

/// Thread-safe wrapper for the tool registry
pub type SharedToolRegistry = Arc<RwLock<ToolRegistry>>;

impl ToolRegistry {
    pub fn new(validator: CodeSafetyValidator, max_timeout_secs: f64) -> Self {
        Self {
            servers: HashMap::new(),
            validator,
            max_timeout_secs,
        }
    }

    pub fn into_shared(self) -> SharedToolRegistry {
        Arc::new(RwLock::new(self))
    }

    /// Register (or replace) a server's complete context.
    ///
    /// Returns the number of tools registered. On any error the previous
    /// context, if any, is left untouched.
    pub fn register(&mut self, request: RegistrationRequest) -> Result<usize, RegistryError> {
        let server_id = request.server_id.trim().to_string();
        if server_id.is_empty() {
            return Err(RegistryError::InvalidServer("server_id must not be empty".to_string()));
        }

        let mut tools = BTreeMap::new();
        for definition in request.tools {
            let registered = self.validate_tool(&server_id, definition)?;
            let name = registered.definition.name.clone();
            if tools.contains_key(&name) {
                return Err(RegistryError::InvalidTool {
                    tool: name,
                    reason: "duplicate tool name".to_string(),
                });
            }
            tools.insert(name, registered);
        }

        let count = tools.len();
        let context = ServerContext {
            server_id: server_id.clone(),
            tools,
            secrets: request.secrets,
            allowed_modules: dedupe(request.allowed_modules),
            allowed_hosts: dedupe(request.allowed_hosts),
            registered_at: Utc::now(),
        };

        let replaced = self.servers.insert(server_id.clone(), Arc::new(context)).is_some();
        tracing::info!(server_id = %server_id, tools = count, replaced, "server registered");
        Ok(count)
    }

    fn validate_tool(&self, server_id: &str, definition: ToolDefinition) -> Result<RegisteredTool, RegistryError> {
        let invalid = |reason: String| RegistryError::InvalidTool {
            tool: definition.name.clone(),
            reason,
        };

        validate_identifier(&definition.name).map_err(invalid)?;
        if let Some(entry_point) = &definition.entry_point {
            validate_identifier(entry_point).map_err(|e| invalid(format!("entry_point: {e}")))?;
        }
        if !definition.input_schema.is_object() {
            return Err(invalid("input_schema must be a JSON object".to_string()));
        }
        if let Some(timeout) = definition.timeout {
            if !timeout.is_finite() || timeout <= 0.0 {
                return Err(invalid("timeout must be a positive number of seconds".to_string()));
            }
            if timeout > self.max_timeout_secs {
                return Err(invalid(format!(
                    "timeout {timeout}s exceeds the maximum of {}s",
                    self.max_timeout_secs
                )));
            }
        }

        let imports = match definition.kind {
            ToolKind::Code => {
                let source = definition
                    .source_code
                    .as_deref()
                    .ok_or_else(|| invalid("code tools require source_code".to_string()))?;
                let source_name = format!("<tool:{}.{}>", server_id, definition.name);
                self.validator
                    .validate(source, &source_name)
                    .map_err(|e| invalid(e.to_string()))?;
                collect_imports(source, &source_name).map_err(|e| invalid(e.to_string()))?
            }
            ToolKind::Passthrough => {
                let target = definition
                    .target
                    .as_ref()
                    .ok_or_else(|| invalid("passthrough tools require a target".to_string()))?;
                let url = url::Url::parse(&target.url)
                    .map_err(|e| invalid(format!("target url: {e}")))?;
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(invalid("target url must use http or https".to_string()));
                }
                if reqwest::Method::from_bytes(target.method.to_ascii_uppercase().as_bytes()).is_err() {
                    return Err(invalid(format!("invalid target method '{}'", target.method)));
                }
                Vec::new()
            }
        };

        Ok(RegisteredTool {
            definition,
            imports,
        })
    }

    /// Remove a server. Returns whether it was registered.
    pub fn deregister(&mut self, server_id: &str) -> bool {
        let removed = self.servers.remove(server_id).is_some();
        tracing::info!(server_id = %server_id, removed, "server deregistered");
        removed
    }

    /// Look up a tool together with a snapshot of its server context
    pub fn get(&self, server_id: &str, tool_name: &str) -> Result<ToolLookup, RegistryError> {
        let context = self
            .servers
            .get(server_id)
            .ok_or_else(|| RegistryError::ServerNotFound(server_id.to_string()))?;
        let tool = context
            .tools
            .get(tool_name)
            .ok_or_else(|| RegistryError::ToolNotFound {
                server_id: server_id.to_string(),
                tool: tool_name.to_string(),
            })?;
        Ok(ToolLookup {
            context: Arc::clone(context),
            tool: tool.clone(),
        })
    }

    /// Tools registered for a server, ordered by name
    pub fn list_tools(&self, server_id: &str) -> Result<Vec<ToolSummary>, RegistryError> {
        let context = self
            .servers
            .get(server_id)
            .ok_or_else(|| RegistryError::ServerNotFound(server_id.to_string()))?;
        Ok(context
            .tools
            .values()
            .map(|t| ToolSummary {
                name: t.definition.name.clone(),
                description: t.definition.description.clone(),
                kind: t.definition.kind,
                enabled: t.definition.enabled,
                input_schema: t.definition.input_schema.clone(),
            })
            .collect())
    }

    pub fn clear_all(&mut self) {
        let count = self.servers.len();
        self.servers.clear();
        tracing::info!(servers = count, "registry cleared");
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            servers: self.servers.len(),
            tools: self.servers.values().map(|c| c.tools.len()).sum(),
        }
    }
}

fn dedupe(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && seen.insert(v.clone()))
        .collect()
}

/// Validate that a string is a usable Python identifier.
///
/// ASCII letters, digits and underscores; must not start with a digit or be
/// a reserved keyword.
pub fn validate_identifier(name: &str) -> Result<(), String> {
    let first_char = name
        .chars()
        .next()
        .ok_or_else(|| "name cannot be empty".to_string())?;
    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(format!(
            "name must start with a letter or underscore, got '{}'",
            first_char
        ));
    }
    if let Some((i, c)) = name
        .chars()
        .enumerate()
        .find(|(_, c)| !c.is_ascii_alphanumeric() && *c != '_')
    {
        return Err(format!(
            "name can only contain letters, digits, and underscores. Invalid character '{}' at position {}",
            c, i
        ));
    }
    if PYTHON_KEYWORDS.contains(&name) {
        return Err(format!("'{}' is a Python reserved keyword", name));
    }
    Ok(())
}
