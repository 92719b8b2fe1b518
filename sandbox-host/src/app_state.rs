//! Host service state.
//!
//! [`SandboxHost`] owns the registry, the execution engine, the egress guard
//! and the background actors. It is constructed explicitly, started once and
//! stopped once; nothing here lives in a process-wide static.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::actors::{InstallerActor, InstallerMsg, SettingsPollerActor};
use crate::code_safety::CodeSafetyValidator;
use crate::egress::{EgressGuard, Resolver};
use crate::error::SandboxError;
use crate::installer::{InstallReport, InstallerConfig, PackageInstaller};
use crate::package_index::{IndexError, PackageIndexClient};
use crate::settings::SandboxSettings;
use crate::tool_execution::{EngineConfig, ExecutionEngine, ExecutionResult, SharedDefaultModules};
use crate::tool_registry::{RegistrationRequest, SharedToolRegistry, ToolRegistry, ToolSummary};

/// How long `stop` waits for a background task before aborting it
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const BACKEND_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const INDEX_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to create package index client: {0}")]
    Index(#[from] IndexError),
    #[error("host has already been stopped")]
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub servers: usize,
    pub tools: usize,
    pub uptime_secs: u64,
}

struct BackgroundTasks {
    installer_tx: mpsc::Sender<InstallerMsg>,
    installer: JoinHandle<()>,
    poller: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

enum Lifecycle {
    Idle {
        report_tx: watch::Sender<Option<InstallReport>>,
    },
    Running(BackgroundTasks),
    Stopped,
}

pub struct SandboxHost {
    settings: SandboxSettings,
    registry: SharedToolRegistry,
    engine: Arc<ExecutionEngine>,
    default_modules: SharedDefaultModules,
    index: Arc<PackageIndexClient>,
    report_rx: watch::Receiver<Option<InstallReport>>,
    lifecycle: Mutex<Lifecycle>,
    started_at: Instant,
}

impl SandboxHost {
    pub fn new(settings: SandboxSettings, resolver: Arc<dyn Resolver>) -> Result<Self, HostError> {
        let validator = CodeSafetyValidator::new(settings.max_source_bytes);
        let registry = ToolRegistry::new(validator, settings.max_timeout_secs).into_shared();
        let guard = Arc::new(EgressGuard::new(resolver, settings.dns_timeout()));
        let default_modules: SharedDefaultModules =
            Arc::new(RwLock::new(settings.default_allowed_modules.clone()));
        let engine = Arc::new(ExecutionEngine::new(
            Arc::clone(&registry),
            guard,
            Arc::clone(&default_modules),
            EngineConfig::from_settings(&settings),
        ));
        let index = Arc::new(PackageIndexClient::new(
            &settings.package_index_url,
            &settings.vulnerability_feed_url,
            settings.vulnerability_cache_ttl(),
            settings.vulnerability_cache_size,
            INDEX_REQUEST_TIMEOUT,
        )?);
        let (report_tx, report_rx) = watch::channel(None);

        Ok(Self {
            settings,
            registry,
            engine,
            default_modules,
            index,
            report_rx,
            lifecycle: Mutex::new(Lifecycle::Idle { report_tx }),
            started_at: Instant::now(),
        })
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn registry(&self) -> &SharedToolRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    /// Spawn the installer and, when a backend is configured, the settings
    /// poller. Calling it again while running is a no-op.
    pub async fn start(&self) -> Result<(), HostError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let report_tx = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Idle { report_tx } => report_tx,
            running @ Lifecycle::Running(_) => {
                *lifecycle = running;
                return Ok(());
            }
            Lifecycle::Stopped => return Err(HostError::Stopped),
        };

        let installer = PackageInstaller::new(
            InstallerConfig::from_settings(&self.settings),
            Arc::clone(&self.index),
        );
        let (installer_tx, installer_rx) = mpsc::channel(8);
        let installer_handle = tokio::spawn(InstallerActor::new(installer_rx, installer, report_tx).run());

        let initial = self.default_modules.read().await.clone();
        if let Err(e) = installer_tx.try_send(InstallerMsg::Provision {
            modules: initial,
            respond_to: None,
        }) {
            tracing::warn!(error = %e, "could not queue initial provisioning");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = match self.settings.backend_url.as_deref() {
            Some(backend_url) => match SettingsPollerActor::new(
                backend_url,
                self.settings.settings_poll_interval(),
                BACKEND_REQUEST_TIMEOUT,
                Arc::clone(&self.default_modules),
                installer_tx.clone(),
                shutdown_rx,
            ) {
                Ok(actor) => Some(tokio::spawn(actor.run())),
                Err(e) => {
                    tracing::warn!(error = %e, "settings poller disabled");
                    None
                }
            },
            None => {
                tracing::info!("no backend configured; using configured default modules");
                None
            }
        };

        *lifecycle = Lifecycle::Running(BackgroundTasks {
            installer_tx,
            installer: installer_handle,
            poller,
            shutdown_tx,
        });
        tracing::info!("sandbox host started");
        Ok(())
    }

    /// Stop background tasks and drop every registered server.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Lifecycle::Running(tasks) = std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            let BackgroundTasks {
                installer_tx,
                installer,
                poller,
                shutdown_tx,
            } = tasks;

            let _ = shutdown_tx.send(true);
            if let Some(poller) = poller {
                join_or_abort("settings poller", poller).await;
            }
            drop(installer_tx);
            join_or_abort("installer", installer).await;
        }
        drop(lifecycle);

        self.registry.write().await.clear_all();
        tracing::info!("sandbox host stopped");
    }

    pub async fn register(&self, request: RegistrationRequest) -> Result<usize, SandboxError> {
        Ok(self.registry.write().await.register(request)?)
    }

    pub async fn deregister(&self, server_id: &str) -> bool {
        self.registry.write().await.deregister(server_id)
    }

    pub async fn list_tools(&self, server_id: &str) -> Result<Vec<ToolSummary>, SandboxError> {
        Ok(self.registry.read().await.list_tools(server_id)?)
    }

    pub async fn execute(&self, server_id: &str, tool_name: &str, arguments: Value) -> ExecutionResult {
        self.engine.execute(server_id, tool_name, arguments).await
    }

    pub async fn health(&self) -> HealthStatus {
        let stats = self.registry.read().await.stats();
        HealthStatus {
            status: "ok".to_string(),
            servers: stats.servers,
            tools: stats.tools,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Report of the most recent provisioning run, if one has finished
    pub fn last_install_report(&self) -> Option<InstallReport> {
        self.report_rx.borrow().clone()
    }
}

async fn join_or_abort(name: &str, mut handle: JoinHandle<()>) {
    if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
        tracing::warn!(task = name, "background task did not stop in time; aborting");
        handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::egress::StaticResolver;
    use crate::error::ErrorKind;
    use crate::tool_registry::{ToolDefinition, ToolKind};
    use serde_json::json;
    use std::collections::HashMap;

    fn host(dir: &std::path::Path) -> SandboxHost {
        let settings = SandboxSettings {
            packages_dir: dir.to_path_buf(),
            package_index_url: "http://127.0.0.1:9".to_string(),
            vulnerability_feed_url: "http://127.0.0.1:9".to_string(),
            ..Default::default()
        };
        SandboxHost::new(settings, Arc::new(StaticResolver::new())).unwrap()
    }

    fn echo_request() -> RegistrationRequest {
        RegistrationRequest {
            server_id: "s1".to_string(),
            tools: vec![ToolDefinition {
                name: "echo".to_string(),
                description: "Echo text".to_string(),
                input_schema: json!({"type": "object"}),
                source_code: Some("def echo(text='hi'):\n    return text\n".to_string()),
                timeout: None,
                kind: ToolKind::Code,
                enabled: true,
                entry_point: None,
                target: None,
            }],
            secrets: HashMap::new(),
            allowed_modules: vec![],
            allowed_hosts: vec![],
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lifecycle_and_health() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(dir.path());
        host.start().await.unwrap();
        host.start().await.unwrap();

        assert_eq!(host.register(echo_request()).await.unwrap(), 1);
        let health = host.health().await;
        assert_eq!((health.status.as_str(), health.servers, health.tools), ("ok", 1, 1));

        let result = host.execute("s1", "echo", json!({"text": "yo"})).await;
        assert_eq!(result.result, Some(json!("yo")));

        host.stop().await;
        assert_eq!(host.health().await.servers, 0);
        assert!(matches!(host.start().await, Err(HostError::Stopped)));
    }

    #[tokio::test]
    async fn test_register_list_deregister() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(dir.path());
        host.register(echo_request()).await.unwrap();

        let names: Vec<String> = host.list_tools("s1").await.unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["echo"]);

        assert!(host.deregister("s1").await);
        let err = host.list_tools("s1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_initial_provisioning_report() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(dir.path());
        let mut report_rx = host.report_rx.clone();
        host.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), report_rx.changed())
            .await
            .unwrap()
            .unwrap();
        let report = host.last_install_report().unwrap();
        // Default modules are all standard library
        assert!(report.records.is_empty());
        assert!(report.stdlib.contains(&"json".to_string()));
        host.stop().await;
    }
}
