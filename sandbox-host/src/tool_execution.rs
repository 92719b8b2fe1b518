//! Tool execution engine.
//!
//! Resolves a tool from the registry, validates its arguments, and runs it
//! either in a fresh RustPython sandbox on a blocking worker thread (code
//! tools) or as a pinned outbound HTTP call (passthrough tools). Every
//! outcome, including infrastructure faults, comes back as an
//! [`ExecutionResult`]; nothing propagates out of an execution.

use python_sandbox::bridge::{BridgeErrorKind, HostBridge, HttpRequest};
use python_sandbox::interrupt::InterruptHandle;
use python_sandbox::protocol::{self as sandbox_protocol, ExecutionStatus};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::egress::EgressGuard;
use crate::egress_client::{ExecutionHttpClient, HttpLimits};
use crate::error::{ErrorBody, SandboxError};
use crate::redaction::Redactor;
use crate::schema::validate_arguments;
use crate::settings::SandboxSettings;
use crate::stdlib_modules::{stdlib_module_names, top_level_module};
use crate::tool_registry::{SharedToolRegistry, ToolKind, ToolLookup};

/// Modules no configuration can make importable. Every other standard
/// library module is available to every tool; any name starting with `_` is
/// denied as well.
pub const HOST_DENIED_MODULES: &[&str] = &[
    // process, interpreter and loader control
    "os", "sys", "posix", "nt", "subprocess", "signal", "pty", "tty", "termios",
    "fcntl", "resource", "atexit", "faulthandler", "gc", "builtins", "importlib",
    "imp", "pkgutil", "runpy", "zipimport", "modulefinder", "site", "sysconfig",
    "platform", "threading", "multiprocessing", "concurrent", "asyncio",
    "ctypes", "cffi", "types", "copyreg", "warnings", "locale", "venv",
    "ensurepip", "distutils", "lib2to3", "idlelib", "msilib", "msvcrt",
    "winreg", "winsound",
    // code objects, introspection and string evaluation
    "inspect", "code", "codeop", "dis", "opcode", "ast", "symtable",
    "traceback", "linecache", "tokenize", "tabnanny", "pyclbr", "py_compile",
    "compileall", "timeit", "trace", "profile", "cProfile", "pstats",
    "tracemalloc", "pdb", "bdb", "pydoc", "pydoc_data", "doctest", "unittest",
    "cmd", "readline", "rlcompleter", "this", "antigravity",
    // file system and anything that opens a path
    "io", "pathlib", "posixpath", "ntpath", "genericpath", "nturl2path",
    "shutil", "tempfile", "glob", "fnmatch", "fileinput", "filecmp", "mmap",
    "codecs", "logging", "gzip", "bz2", "lzma", "zipfile", "tarfile", "zipapp",
    "configparser", "netrc", "mailbox", "mailcap", "mimetypes", "gettext",
    "argparse", "xml", "aifc", "sunau", "wave", "chunk", "imghdr", "sndhdr",
    "uu", "ossaudiodev", "audioop", "sqlite3", "dbm", "shelve",
    // by-name serialization
    "pickle", "cPickle", "pickletools", "marshal", "dill",
    // raw networking and servers
    "socket", "ssl", "select", "selectors", "socketserver", "http", "urllib",
    "ftplib", "smtplib", "smtpd", "telnetlib", "imaplib", "poplib", "nntplib",
    "asynchat", "asyncore", "xmlrpc", "wsgiref", "cgi", "cgitb", "webbrowser",
    "email", "pipes",
    // host accounts and terminals
    "getpass", "pwd", "grp", "spwd", "crypt", "nis", "syslog", "curses",
    "tkinter", "turtle", "turtledemo",
];

/// Interval between repeated interrupts while waiting for a cancelled run.
const REFIRE_INTERVAL: Duration = Duration::from_millis(50);

static SECRET_REFERENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Default allowed-module list shared with the settings poller
pub type SharedDefaultModules = Arc<RwLock<Vec<String>>>;

pub fn is_host_denied(module: &str) -> bool {
    let top = top_level_module(module);
    top.starts_with('_') || HOST_DENIED_MODULES.contains(&top)
}

/// Outcome of one invocation, as returned to API callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub stdout: String,
    pub duration_ms: u64,
}

/// Engine limits derived from [`SandboxSettings`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub cancellation_grace: Duration,
    pub max_concurrent: usize,
    pub max_output_bytes: usize,
    pub http_limits: HttpLimits,
    pub packages_dir: PathBuf,
}

impl EngineConfig {
    pub fn from_settings(settings: &SandboxSettings) -> Self {
        Self {
            default_timeout: settings.default_timeout(),
            max_timeout: settings.max_timeout(),
            cancellation_grace: settings.cancellation_grace(),
            max_concurrent: settings.max_concurrent_executions.max(1),
            max_output_bytes: settings.max_output_bytes,
            http_limits: HttpLimits {
                max_response_bytes: settings.max_response_bytes,
                max_request_timeout: settings.max_http_timeout(),
            },
            packages_dir: settings.packages_dir.clone(),
        }
    }
}

struct Completed {
    value: Value,
    stdout: String,
    stdout_truncated: bool,
}

struct Failure {
    error: SandboxError,
    stdout: String,
    stdout_truncated: bool,
}

impl From<SandboxError> for Failure {
    fn from(error: SandboxError) -> Self {
        Self {
            error,
            stdout: String::new(),
            stdout_truncated: false,
        }
    }
}

pub struct ExecutionEngine {
    registry: SharedToolRegistry,
    guard: Arc<EgressGuard>,
    default_modules: SharedDefaultModules,
    permits: Arc<Semaphore>,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(
        registry: SharedToolRegistry,
        guard: Arc<EgressGuard>,
        default_modules: SharedDefaultModules,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            guard,
            default_modules,
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
        }
    }

    /// Execute a registered tool with the given arguments.
    pub async fn execute(&self, server_id: &str, tool_name: &str, arguments: Value) -> ExecutionResult {
        let started = Instant::now();
        let execution_id = uuid::Uuid::new_v4();
        tracing::debug!(%execution_id, server_id, tool = tool_name, "execution requested");

        let (outcome, redactor) = match self.lookup(server_id, tool_name).await {
            Ok(lookup) => {
                let redactor = Redactor::new(lookup.context.secrets.values());
                (self.invoke(&lookup, arguments, started).await, redactor)
            }
            Err(error) => (Err(Failure::from(error)), Redactor::default()),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(Completed {
                value,
                stdout,
                stdout_truncated,
            }) => ExecutionResult {
                success: true,
                result: Some(redactor.redact_value(value)),
                error: None,
                stdout: truncation_marked(redactor.redact_output(&stdout, stdout_truncated), stdout_truncated),
                duration_ms,
            },
            Err(Failure {
                error,
                stdout,
                stdout_truncated,
            }) => ExecutionResult {
                success: false,
                result: None,
                error: Some(ErrorBody {
                    kind: error.kind(),
                    message: redactor.sanitize_error(&error.to_string()),
                }),
                stdout: truncation_marked(redactor.redact_output(&stdout, stdout_truncated), stdout_truncated),
                duration_ms,
            },
        };

        match &result.error {
            None => tracing::info!(%execution_id, server_id, tool = tool_name, duration_ms, "execution succeeded"),
            Some(error) => tracing::info!(
                %execution_id,
                server_id,
                tool = tool_name,
                duration_ms,
                kind = error.kind.as_str(),
                "execution failed"
            ),
        }
        result
    }

    async fn lookup(&self, server_id: &str, tool_name: &str) -> Result<ToolLookup, SandboxError> {
        let lookup = self.registry.read().await.get(server_id, tool_name)?;
        if !lookup.tool.definition.enabled {
            return Err(SandboxError::NotFound(format!(
                "tool '{tool_name}' on server '{server_id}' is disabled"
            )));
        }
        Ok(lookup)
    }

    async fn invoke(&self, lookup: &ToolLookup, arguments: Value, started: Instant) -> Result<Completed, Failure> {
        let definition = &lookup.tool.definition;
        let input = if arguments.is_null() {
            Value::Object(Map::new())
        } else {
            arguments
        };
        validate_arguments(&input, &definition.input_schema)
            .map_err(|e| SandboxError::Validation(format!("invalid arguments: {e}")))?;
        let Value::Object(arguments) = input else {
            return Err(SandboxError::Validation("arguments must be a JSON object".to_string()).into());
        };

        let timeout = self.effective_timeout(definition.timeout);
        let timeout_ms = timeout.as_millis() as u64;
        let deadline = started + timeout;

        let permit = match tokio::time::timeout_at(deadline, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(SandboxError::Internal("execution slots are closed".to_string()).into()),
            Err(_) => return Err(SandboxError::Timeout { timeout_ms }.into()),
        };

        match definition.kind {
            ToolKind::Code => self.run_code(lookup, arguments, deadline, timeout_ms, permit).await,
            ToolKind::Passthrough => {
                let outcome = self.run_passthrough(lookup, arguments, deadline, timeout_ms).await;
                drop(permit);
                outcome
            }
        }
    }

    fn effective_timeout(&self, requested: Option<f64>) -> Duration {
        requested
            .filter(|t| t.is_finite() && *t > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(self.config.default_timeout)
            .min(self.config.max_timeout)
    }

    /// Server modules (or the global default) plus the standard library,
    /// with the host deny list removed. Declared modules come first.
    pub async fn effective_modules(&self, declared: &[String]) -> Vec<String> {
        let base = if declared.is_empty() {
            self.default_modules.read().await.clone()
        } else {
            declared.to_vec()
        };
        let mut seen = HashSet::new();
        base.iter()
            .map(|m| top_level_module(m).to_string())
            .chain(stdlib_module_names().map(str::to_string))
            .filter(|m| !m.is_empty() && !is_host_denied(m))
            .filter(|m| seen.insert(m.clone()))
            .collect()
    }

    fn http_client(&self, lookup: &ToolLookup, deadline: Instant) -> ExecutionHttpClient {
        ExecutionHttpClient::new(
            Arc::clone(&self.guard),
            lookup.context.allowed_hosts.clone(),
            deadline,
            self.config.http_limits,
            Handle::current(),
            lookup.context.server_id.clone(),
        )
    }

    async fn run_code(
        &self,
        lookup: &ToolLookup,
        arguments: Map<String, Value>,
        deadline: Instant,
        timeout_ms: u64,
        permit: OwnedSemaphorePermit,
    ) -> Result<Completed, Failure> {
        let context = &lookup.context;
        let definition = &lookup.tool.definition;

        let allowed_modules = self.effective_modules(&context.allowed_modules).await;
        for module in &lookup.tool.imports {
            if module == "." {
                return Err(SandboxError::Validation("relative imports are not allowed".to_string()).into());
            }
            if !allowed_modules.contains(module) {
                return Err(SandboxError::Validation(format!("import of module '{module}' is not allowed")).into());
            }
        }

        let source = definition
            .source_code
            .clone()
            .ok_or_else(|| SandboxError::Internal("code tool has no source".to_string()))?;
        let request = sandbox_protocol::ExecutionRequest {
            source_name: format!("<tool:{}.{}>", context.server_id, definition.name),
            source,
            entry_points: definition.entry_points(),
            arguments,
            allowed_modules,
            module_paths: vec![self.config.packages_dir.to_string_lossy().into_owned()],
            secrets: context.secrets.clone(),
            max_output_bytes: self.config.max_output_bytes,
        };
        tracing::debug!(
            server_id = %context.server_id,
            tool = %definition.name,
            source_bytes = request.source.len(),
            "starting sandboxed execution"
        );

        let client = Arc::new(self.http_client(lookup, deadline));
        let bridge: Arc<dyn HostBridge> = client.clone();
        let interrupt = InterruptHandle::new();
        let worker_interrupt = interrupt.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            python_sandbox::execute(&request, bridge, &worker_interrupt)
        });

        let joined = match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                self.cancel(task, interrupt, permit, &context.server_id, &definition.name)
                    .await;
                return Err(SandboxError::Timeout { timeout_ms }.into());
            }
        };
        drop(permit);

        let outcome = joined.map_err(|e| SandboxError::Internal(format!("execution worker failed: {e}")))?;

        let stdout = outcome.stdout;
        let stdout_truncated = outcome.stdout_truncated;

        if let Some(denial) = client.denial() {
            return Err(Failure {
                error: SandboxError::Ssrf(denial.to_string()),
                stdout,
                stdout_truncated,
            });
        }

        let error = match outcome.status {
            ExecutionStatus::Complete => {
                return Ok(Completed {
                    value: outcome.result.unwrap_or(Value::Null),
                    stdout,
                    stdout_truncated,
                })
            }
            ExecutionStatus::Error(message) => SandboxError::Execution(message),
            ExecutionStatus::ImportDenied(message) => SandboxError::Validation(message),
            ExecutionStatus::Interrupted => return Err(SandboxError::Timeout { timeout_ms }.into()),
            ExecutionStatus::SetupFailed(message) => SandboxError::Internal(message),
        };
        Err(Failure {
            error,
            stdout,
            stdout_truncated,
        })
    }

    /// Interrupt a run past its deadline and wait a bounded grace period.
    ///
    /// A worker still running after the grace keeps its permit and is
    /// interrupted repeatedly in the background until it unwinds.
    async fn cancel(
        &self,
        mut task: JoinHandle<sandbox_protocol::ExecutionResult>,
        interrupt: InterruptHandle,
        permit: OwnedSemaphorePermit,
        server_id: &str,
        tool: &str,
    ) {
        interrupt.interrupt();
        let grace_deadline = Instant::now() + self.config.cancellation_grace;
        let mut ticker = tokio::time::interval(REFIRE_INTERVAL);
        loop {
            tokio::select! {
                _ = &mut task => return,
                _ = tokio::time::sleep_until(grace_deadline) => break,
                _ = ticker.tick() => interrupt.interrupt(),
            }
        }

        tracing::warn!(server_id, tool, "execution did not unwind within the grace period");
        tokio::spawn(async move {
            let _permit = permit;
            let mut ticker = tokio::time::interval(REFIRE_INTERVAL);
            loop {
                tokio::select! {
                    _ = &mut task => break,
                    _ = ticker.tick() => interrupt.interrupt(),
                }
            }
        });
    }

    async fn run_passthrough(
        &self,
        lookup: &ToolLookup,
        arguments: Map<String, Value>,
        deadline: Instant,
        timeout_ms: u64,
    ) -> Result<Completed, Failure> {
        let target = lookup
            .tool
            .definition
            .target
            .as_ref()
            .ok_or_else(|| SandboxError::Internal("passthrough tool has no target".to_string()))?;

        let method = target.method.to_ascii_uppercase();
        let mut headers = BTreeMap::new();
        for (name, template) in &target.headers {
            headers.insert(name.clone(), substitute_secrets(template, &lookup.context.secrets)?);
        }
        let body = if method == "GET" || method == "HEAD" {
            None
        } else {
            if !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
                headers.insert("content-type".to_string(), "application/json".to_string());
            }
            Some(Value::Object(arguments).to_string())
        };

        let client = self.http_client(lookup, deadline);
        let request = HttpRequest {
            method,
            url: target.url.clone(),
            headers,
            body,
            timeout_secs: None,
        };

        let response = match tokio::time::timeout_at(deadline, client.send(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                let error = match err.kind {
                    BridgeErrorKind::Denied => SandboxError::Ssrf(err.message),
                    BridgeErrorKind::TimedOut => SandboxError::Timeout { timeout_ms },
                    BridgeErrorKind::Failed => {
                        SandboxError::Execution(format!("upstream request failed: {}", err.message))
                    }
                };
                return Err(error.into());
            }
            Err(_) => return Err(SandboxError::Timeout { timeout_ms }.into()),
        };

        if response.status >= 400 {
            return Err(SandboxError::Execution(format!("upstream returned HTTP {}", response.status)).into());
        }
        let value = serde_json::from_str(&response.body).unwrap_or(Value::String(response.body));
        Ok(Completed {
            value,
            stdout: String::new(),
            stdout_truncated: false,
        })
    }
}

/// Append the truncation marker to already-redacted stdout
fn truncation_marked(mut stdout: String, truncated: bool) -> String {
    if truncated {
        stdout.push_str("\n[output truncated]");
    }
    stdout
}

/// Replace `${NAME}` references with the server's secret values
fn substitute_secrets(template: &str, secrets: &HashMap<String, String>) -> Result<String, SandboxError> {
    let mut missing = None;
    let rendered = SECRET_REFERENCE_RE.replace_all(template, |caps: &regex::Captures<'_>| {
        match secrets.get(&caps[1]) {
            Some(value) => value.clone(),
            None => {
                missing.get_or_insert_with(|| caps[1].to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(SandboxError::Validation(format!(
            "header references unknown secret '{name}'"
        ))),
        None => Ok(rendered.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_safety::CodeSafetyValidator;
    use crate::egress::StaticResolver;
    use crate::error::ErrorKind;
    use crate::tool_registry::{PassthroughTarget, RegistrationRequest, ToolDefinition, ToolRegistry};
    use serde_json::json;

    fn code_tool(name: &str, source: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: String::new(),
            input_schema: json!({"type": "object"}),
            source_code: Some(source.to_string()),
            timeout: None,
            kind: ToolKind::Code,
            enabled: true,
            entry_point: None,
            target: None,
        }
    }

    fn test_settings() -> SandboxSettings {
        SandboxSettings {
            default_timeout_secs: 5.0,
            cancellation_grace_ms: 1_000,
            packages_dir: std::env::temp_dir().join("sandbox-engine-tests"),
            ..Default::default()
        }
    }

    fn engine_with(registry: SharedToolRegistry) -> ExecutionEngine {
        engine_with_settings(registry, test_settings())
    }

    fn engine_with_settings(registry: SharedToolRegistry, settings: SandboxSettings) -> ExecutionEngine {
        let guard = EgressGuard::new(Arc::new(StaticResolver::new()), Duration::from_millis(200));
        ExecutionEngine::new(
            registry,
            Arc::new(guard),
            Arc::new(RwLock::new(settings.default_allowed_modules.clone())),
            EngineConfig::from_settings(&settings),
        )
    }

    async fn register(registry: &SharedToolRegistry, request: RegistrationRequest) {
        registry.write().await.register(request).unwrap();
    }

    fn request(server_id: &str, tools: Vec<ToolDefinition>) -> RegistrationRequest {
        RegistrationRequest {
            server_id: server_id.to_string(),
            tools,
            secrets: HashMap::new(),
            allowed_modules: vec![],
            allowed_hosts: vec![],
        }
    }

    fn registry() -> SharedToolRegistry {
        ToolRegistry::new(CodeSafetyValidator::default(), 60.0).into_shared()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_echo_succeeds() {
        let reg = registry();
        let mut tool = code_tool("echo", "def echo(text):\n    print('echoing')\n    return {'text': text}\n");
        tool.input_schema = json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        });
        register(&reg, request("s1", vec![tool])).await;
        let engine = engine_with(reg);

        let result = engine.execute("s1", "echo", json!({"text": "hi"})).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.result, Some(json!({"text": "hi"})));
        assert_eq!(result.stdout.trim(), "echoing");

        let invalid = engine.execute("s1", "echo", json!({"text": 3})).await;
        assert_eq!(invalid.error.unwrap().kind, ErrorKind::ValidationError);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_and_disabled_are_not_found() {
        let reg = registry();
        let mut disabled = code_tool("off", "def off():\n    return 1\n");
        disabled.enabled = false;
        register(&reg, request("s1", vec![disabled])).await;
        let engine = engine_with(reg);

        for (server, tool) in [("nope", "off"), ("s1", "nope"), ("s1", "off")] {
            let result = engine.execute(server, tool, Value::Null).await;
            assert!(!result.success);
            assert_eq!(result.error.unwrap().kind, ErrorKind::NotFound, "{server}/{tool}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_denied_module_rejected_before_run() {
        let reg = registry();
        let mut req = request(
            "s1",
            vec![code_tool("leak", "import os\n\ndef leak():\n    print('ran')\n    return 1\n")],
        );
        req.allowed_modules = vec!["os".to_string(), "json".to_string()];
        register(&reg, req).await;
        let engine = engine_with(reg);

        let result = engine.execute("s1", "leak", json!({})).await;
        assert_eq!(result.error.unwrap().kind, ErrorKind::ValidationError);
        assert!(result.stdout.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_effective_modules() {
        let engine = engine_with(registry());
        let defaults = engine.effective_modules(&[]).await;
        assert!(defaults.contains(&"json".to_string()));
        assert!(defaults.contains(&"uuid".to_string()));

        let declared = vec!["os.path".to_string(), "_thread".to_string(), "yaml".to_string(), "yaml".to_string()];
        let effective = engine.effective_modules(&declared).await;
        assert_eq!(effective[0], "yaml");
        assert_eq!(effective.iter().filter(|m| *m == "yaml").count(), 1);
        // The standard library stays available alongside a declared list
        for module in ["json", "math", "re", "datetime", "collections"] {
            assert!(effective.contains(&module.to_string()), "{module}");
        }
        for module in ["os", "_thread", "logging", "linecache", "types", "sys"] {
            assert!(!effective.contains(&module.to_string()), "{module}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_declared_modules_keep_stdlib_importable() {
        let reg = registry();
        let mut req = request(
            "s1",
            vec![code_tool("stamp", "import json, math\n\ndef stamp():\n    return json.dumps({'r': math.floor(2.7)})\n")],
        );
        req.allowed_modules = vec!["requests".to_string()];
        register(&reg, req).await;
        let engine = engine_with(reg);

        let result = engine.execute("s1", "stamp", json!({})).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.result, Some(json!("{\"r\": 2}")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stdlib_helpers_work_in_tools() {
        let reg = registry();
        let source = r#"
import json, re, datetime, enum, dataclasses
from collections import namedtuple

Pair = namedtuple('Pair', ['left', 'right'])


class Level(enum.Enum):
    LOW = 1
    HIGH = 2


@dataclasses.dataclass
class Order:
    sku: str
    qty: int = 1


def report(text=''):
    order = Order('A-7', 4)
    stamp = datetime.datetime(2024, 5, 6, 7, 8) + datetime.timedelta(days=1)
    return {
        'digits': re.sub(r'\D', '', 'a1b2c3'),
        'stamp': stamp.isoformat(),
        'pair': list(Pair(1, 2)._replace(right=9)),
        'level': Level['HIGH'].value,
        'order': json.loads(json.dumps(dataclasses.asdict(order))),
    }
"#;
        register(&reg, request("s1", vec![code_tool("report", source)])).await;
        let engine = engine_with(reg);

        let result = engine.execute("s1", "report", json!({})).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(
            result.result,
            Some(json!({
                "digits": "123",
                "stamp": "2024-05-07T07:08:00",
                "pair": [1, 9],
                "level": 2,
                "order": {"sku": "A-7", "qty": 4},
            }))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_allowed_modules_do_not_expose_host_modules() {
        let cases = [
            ("via_typing", "import typing\n\ndef via_typing():\n    return typing.sys.modules['posix'].getcwd()\n"),
            ("via_uuid", "import uuid\n\ndef via_uuid():\n    return uuid.os.getcwd()\n"),
            (
                "via_operator",
                "import operator\n\ndef via_operator():\n    return str(operator.attrgetter('__class__')(1))\n",
            ),
        ];
        let reg = registry();
        let tools = cases.iter().map(|(name, source)| code_tool(name, source)).collect();
        register(&reg, request("s1", tools)).await;
        let engine = engine_with(reg);

        for (name, _) in cases {
            let result = engine.execute("s1", name, json!({})).await;
            assert!(!result.success, "{name} escaped: {:?}", result.result);
            let error = result.error.unwrap();
            assert_eq!(error.kind, ErrorKind::ExecutionError, "{name}");
            assert!(error.message.starts_with("AttributeError"), "{name}: {}", error.message);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_numeric_secret_redacted_from_result() {
        let reg = registry();
        let mut req = request(
            "s1",
            vec![code_tool("pin", "def pin():\n    return {'pin': int(get_secret('PIN')), 'ok': True}\n")],
        );
        req.secrets.insert("PIN".to_string(), "482913".to_string());
        register(&reg, req).await;
        let engine = engine_with(reg);

        let result = engine.execute("s1", "pin", json!({})).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.result, Some(json!({"pin": "[REDACTED]", "ok": true})));
        assert!(!serde_json::to_string(&result).unwrap().contains("482913"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_truncation_inside_secret_leaves_no_fragment() {
        let reg = registry();
        let mut req = request(
            "s1",
            vec![code_tool("chatty", "def chatty():\n    print('0123456789' + get_secret('API_KEY'))\n    return 1\n")],
        );
        req.secrets.insert("API_KEY".to_string(), "sk-live-abcdef123456".to_string());
        register(&reg, req).await;
        let settings = SandboxSettings {
            max_output_bytes: 20,
            ..test_settings()
        };
        let engine = engine_with_settings(reg, settings);

        let result = engine.execute("s1", "chatty", json!({})).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.stdout, "0123456789\n[output truncated]");
        assert!(!result.stdout.contains("sk-live"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_secrets_redacted_everywhere() {
        let reg = registry();
        let mut req = request(
            "s1",
            vec![code_tool(
                "whoami",
                "def whoami():\n    key = get_secret('API_KEY')\n    print('key is', key)\n    return {'key': key, 'nested': [key + '!']}\n",
            )],
        );
        req.secrets.insert("API_KEY".to_string(), "sk-live-abc123".to_string());
        register(&reg, req).await;
        let engine = engine_with(reg);

        let result = engine.execute("s1", "whoami", json!({})).await;
        assert!(result.success, "{:?}", result.error);
        let rendered = serde_json::to_string(&result).unwrap();
        assert!(!rendered.contains("sk-live-abc123"));
        assert!(result.stdout.contains("[REDACTED]"));
        assert_eq!(result.result.unwrap()["nested"][0], json!("[REDACTED]!"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_caught_egress_denial_is_ssrf() {
        let reg = registry();
        let source = "def echo(text=''):\n    try:\n        http_get('http://169.254.169.254/latest/meta-data')\n    except PermissionError:\n        return 'swallowed'\n    return text\n";
        register(&reg, request("S1", vec![code_tool("echo", source)])).await;
        let engine = engine_with(reg);

        let result = engine.execute("S1", "echo", json!({})).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind, ErrorKind::SsrfError);
        assert!(result.result.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_exception_is_execution_error() {
        let reg = registry();
        register(
            &reg,
            request("s1", vec![code_tool("boom", "def boom():\n    raise ValueError('bad input')\n")]),
        )
        .await;
        let engine = engine_with(reg);

        let error = engine.execute("s1", "boom", json!({})).await.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ExecutionError);
        assert_eq!(error.message, "ValueError: bad input");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_discards_output() {
        let reg = registry();
        let mut tool = code_tool("spin", "def spin():\n    print('started')\n    while True:\n        pass\n");
        tool.timeout = Some(0.5);
        register(&reg, request("s1", vec![tool])).await;
        let engine = engine_with(reg);

        let started = std::time::Instant::now();
        let result = engine.execute("s1", "spin", json!({})).await;
        assert_eq!(result.error.unwrap().kind, ErrorKind::Timeout);
        assert!(result.stdout.is_empty());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_passthrough_without_allowlist_is_ssrf() {
        let reg = registry();
        let mut tool = code_tool("proxy", "");
        tool.kind = ToolKind::Passthrough;
        tool.source_code = None;
        tool.target = Some(PassthroughTarget {
            url: "https://api.example.com/hook".to_string(),
            method: "POST".to_string(),
            headers: BTreeMap::new(),
        });
        register(&reg, request("s1", vec![tool])).await;
        let engine = engine_with(reg);

        let result = engine.execute("s1", "proxy", json!({"q": 1})).await;
        assert_eq!(result.error.unwrap().kind, ErrorKind::SsrfError);
    }

    #[test]
    fn test_substitute_secrets() {
        let mut secrets = HashMap::new();
        secrets.insert("TOKEN".to_string(), "t0k".to_string());
        assert_eq!(substitute_secrets("Bearer ${TOKEN}", &secrets).unwrap(), "Bearer t0k");
        assert_eq!(substitute_secrets("plain", &secrets).unwrap(), "plain");
        let err = substitute_secrets("${MISSING}", &secrets).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[test]
    fn test_host_denied_modules() {
        assert!(is_host_denied("os"));
        assert!(is_host_denied("os.path"));
        assert!(is_host_denied("_sandbox"));
        assert!(is_host_denied("logging.handlers"));
        assert!(is_host_denied("xml.etree.ElementTree"));
        assert!(!is_host_denied("json"));
        assert!(!is_host_denied("collections.abc"));
    }
}
