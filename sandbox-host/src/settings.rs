use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Modules every server may import unless it declares its own list.
fn default_allowed_modules() -> Vec<String> {
    [
        "json", "math", "re", "datetime", "time", "collections", "itertools",
        "functools", "random", "string", "decimal", "fractions", "statistics",
        "textwrap", "base64", "hashlib", "hmac", "uuid", "typing", "dataclasses",
        "enum", "copy", "operator", "bisect", "heapq", "calendar", "unicodedata",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Service configuration.
///
/// Every field has a default so a partial (or missing) config file works.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxSettings {
    // ============ API ============
    pub host: String,
    pub port: u16,
    /// Shared secret required on every request; the service refuses to start without one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_secret: Option<String>,
    pub secret_header: String,

    // ============ Backend settings poll ============
    pub backend_url: Option<String>,
    pub settings_poll_interval_secs: u64,
    pub default_allowed_modules: Vec<String>,

    // ============ Execution ============
    pub default_timeout_secs: f64,
    pub max_timeout_secs: f64,
    pub cancellation_grace_ms: u64,
    pub max_concurrent_executions: usize,
    pub max_output_bytes: usize,
    pub max_source_bytes: usize,

    // ============ Egress ============
    pub dns_timeout_ms: u64,
    pub max_response_bytes: usize,
    pub max_http_timeout_secs: f64,

    // ============ Packages ============
    pub packages_dir: PathBuf,
    pub python_program: String,
    pub install_timeout_secs: u64,
    pub package_index_url: String,
    pub vulnerability_feed_url: String,
    pub vulnerability_cache_ttl_secs: u64,
    pub vulnerability_cache_size: usize,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            shared_secret: None,
            secret_header: "X-Sandbox-Secret".to_string(),
            backend_url: None,
            settings_poll_interval_secs: 300,
            default_allowed_modules: default_allowed_modules(),
            default_timeout_secs: 30.0,
            max_timeout_secs: 120.0,
            cancellation_grace_ms: 2_000,
            max_concurrent_executions: 16,
            max_output_bytes: 1024 * 1024,
            max_source_bytes: crate::code_safety::DEFAULT_MAX_SOURCE_BYTES,
            dns_timeout_ms: 2_000,
            max_response_bytes: 5 * 1024 * 1024,
            max_http_timeout_secs: 30.0,
            packages_dir: get_config_dir().join("packages"),
            python_program: "python3".to_string(),
            install_timeout_secs: 300,
            package_index_url: "https://pypi.org".to_string(),
            vulnerability_feed_url: "https://api.osv.dev".to_string(),
            vulnerability_cache_ttl_secs: 3_600,
            vulnerability_cache_size: 512,
        }
    }
}

impl SandboxSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.default_timeout_secs)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.max_timeout_secs)
    }

    pub fn cancellation_grace(&self) -> Duration {
        Duration::from_millis(self.cancellation_grace_ms)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }

    pub fn max_http_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.max_http_timeout_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn settings_poll_interval(&self) -> Duration {
        Duration::from_secs(self.settings_poll_interval_secs.max(1))
    }

    pub fn vulnerability_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.vulnerability_cache_ttl_secs)
    }

    /// Reject values that would make the service unsafe or unusable
    pub fn validate(&self) -> Result<(), SettingsError> {
        let positive = |name: &str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(SettingsError::Invalid(format!("{name} must be a positive number")))
            }
        };
        positive("default_timeout_secs", self.default_timeout_secs)?;
        positive("max_timeout_secs", self.max_timeout_secs)?;
        positive("max_http_timeout_secs", self.max_http_timeout_secs)?;
        if self.default_timeout_secs > self.max_timeout_secs {
            return Err(SettingsError::Invalid(
                "default_timeout_secs must not exceed max_timeout_secs".to_string(),
            ));
        }
        if self.max_concurrent_executions == 0 {
            return Err(SettingsError::Invalid(
                "max_concurrent_executions must be at least 1".to_string(),
            ));
        }
        if self.secret_header.trim().is_empty() {
            return Err(SettingsError::Invalid("secret_header must not be empty".to_string()));
        }
        if self.vulnerability_cache_size == 0 {
            return Err(SettingsError::Invalid(
                "vulnerability_cache_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Directory holding the config file and installed packages
pub fn get_config_dir() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".tool-sandbox")
}

/// Get the path to the default config file
pub fn get_config_path() -> PathBuf {
    get_config_dir().join("config.json")
}

/// Load settings from a config file.
///
/// A missing file at the default location yields defaults; an explicitly
/// given path must exist. A file that does not parse is always an error.
pub async fn load_settings(explicit_path: Option<&Path>) -> Result<SandboxSettings, SettingsError> {
    let config_path = explicit_path
        .map(Path::to_path_buf)
        .unwrap_or_else(get_config_path);

    let contents = match fs::read_to_string(&config_path).await {
        Ok(contents) => contents,
        Err(e) if explicit_path.is_none() && e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = ?config_path, "no config file found, using defaults");
            return Ok(SandboxSettings::default());
        }
        Err(source) => {
            return Err(SettingsError::Read {
                path: config_path,
                source,
            })
        }
    };

    let settings: SandboxSettings =
        serde_json::from_str(&contents).map_err(|source| SettingsError::Parse {
            path: config_path.clone(),
            source,
        })?;
    tracing::info!(path = ?config_path, "settings loaded");
    Ok(settings)
}
