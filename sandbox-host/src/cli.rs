//! Command-line argument parsing and launch configuration.
//!
//! This module handles CLI argument parsing using clap, and applies
//! launch-time overrides on top of the settings file. Every flag can also be
//! given through a `SANDBOX_*` environment variable.

use crate::settings::{load_settings, SandboxSettings, SettingsError};
use clap::Parser;
use std::path::PathBuf;

/// CLI arguments for the sandbox service
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "sandbox-api", about = "Tool execution sandbox service")]
pub struct CliArgs {
    /// Path to the JSON config file (default: ~/.tool-sandbox/config.json)
    #[arg(long, value_name = "PATH", env = "SANDBOX_CONFIG")]
    pub config: Option<PathBuf>,
    /// Address to bind
    #[arg(long, value_name = "HOST", env = "SANDBOX_HOST")]
    pub host: Option<String>,
    /// Port to bind
    #[arg(long, value_name = "PORT", env = "SANDBOX_PORT")]
    pub port: Option<u16>,
    /// Shared secret required on every request
    #[arg(long, value_name = "SECRET", env = "SANDBOX_SHARED_SECRET", hide_env_values = true)]
    pub shared_secret: Option<String>,
    /// Header carrying the shared secret
    #[arg(long, value_name = "NAME", env = "SANDBOX_SECRET_HEADER")]
    pub secret_header: Option<String>,
    /// Backend base URL polled for the global allowed-module list
    #[arg(long, value_name = "URL", env = "SANDBOX_BACKEND_URL")]
    pub backend_url: Option<String>,
    /// Seconds between backend settings polls
    #[arg(long, value_name = "SECS", env = "SANDBOX_SETTINGS_POLL_INTERVAL")]
    pub settings_poll_interval: Option<u64>,
    /// Comma-separated default allowed modules
    #[arg(long, value_delimiter = ',', value_name = "MODULE[,MODULE...]", env = "SANDBOX_DEFAULT_ALLOWED_MODULES")]
    pub default_allowed_modules: Option<Vec<String>>,
    /// Default execution timeout in seconds
    #[arg(long, value_name = "SECS", env = "SANDBOX_DEFAULT_TIMEOUT")]
    pub default_timeout: Option<f64>,
    /// Maximum execution timeout in seconds
    #[arg(long, value_name = "SECS", env = "SANDBOX_MAX_TIMEOUT")]
    pub max_timeout: Option<f64>,
    /// Grace period for an interrupted execution to unwind, in milliseconds
    #[arg(long, value_name = "MS", env = "SANDBOX_CANCELLATION_GRACE_MS")]
    pub cancellation_grace_ms: Option<u64>,
    /// Maximum number of simultaneous executions
    #[arg(long, value_name = "INT", env = "SANDBOX_MAX_CONCURRENT")]
    pub max_concurrent: Option<usize>,
    /// Maximum captured stdout per execution, in bytes
    #[arg(long, value_name = "BYTES", env = "SANDBOX_MAX_OUTPUT_BYTES")]
    pub max_output_bytes: Option<usize>,
    /// Maximum tool source size, in bytes
    #[arg(long, value_name = "BYTES", env = "SANDBOX_MAX_SOURCE_BYTES")]
    pub max_source_bytes: Option<usize>,
    /// DNS resolution timeout for outbound requests, in milliseconds
    #[arg(long, value_name = "MS", env = "SANDBOX_DNS_TIMEOUT_MS")]
    pub dns_timeout_ms: Option<u64>,
    /// Maximum outbound response body, in bytes
    #[arg(long, value_name = "BYTES", env = "SANDBOX_MAX_RESPONSE_BYTES")]
    pub max_response_bytes: Option<usize>,
    /// Maximum timeout of a single outbound request, in seconds
    #[arg(long, value_name = "SECS", env = "SANDBOX_MAX_HTTP_TIMEOUT")]
    pub max_http_timeout: Option<f64>,
    /// Directory third-party packages are installed into
    #[arg(long, value_name = "DIR", env = "SANDBOX_PACKAGES_DIR")]
    pub packages_dir: Option<PathBuf>,
    /// Python program used to run the package installer
    #[arg(long, value_name = "PROGRAM", env = "SANDBOX_PYTHON")]
    pub python: Option<String>,
    /// Timeout of one package install, in seconds
    #[arg(long, value_name = "SECS", env = "SANDBOX_INSTALL_TIMEOUT")]
    pub install_timeout: Option<u64>,
    /// Package index base URL
    #[arg(long, value_name = "URL", env = "SANDBOX_PACKAGE_INDEX_URL")]
    pub package_index_url: Option<String>,
    /// Vulnerability feed base URL
    #[arg(long, value_name = "URL", env = "SANDBOX_VULNERABILITY_FEED_URL")]
    pub vulnerability_feed_url: Option<String>,
    /// Vulnerability cache TTL, in seconds
    #[arg(long, value_name = "SECS", env = "SANDBOX_VULNERABILITY_CACHE_TTL")]
    pub vulnerability_cache_ttl: Option<u64>,
}

/// Apply CLI overrides to settings loaded from the config file
pub fn apply_cli_overrides(settings: &mut SandboxSettings, args: &CliArgs) {
    fn set<T: Clone>(target: &mut T, value: &Option<T>) {
        if let Some(v) = value {
            *target = v.clone();
        }
    }

    set(&mut settings.host, &args.host);
    set(&mut settings.port, &args.port);
    if args.shared_secret.is_some() {
        settings.shared_secret = args.shared_secret.clone();
    }
    set(&mut settings.secret_header, &args.secret_header);
    if args.backend_url.is_some() {
        settings.backend_url = args.backend_url.clone();
    }
    set(&mut settings.settings_poll_interval_secs, &args.settings_poll_interval);
    if let Some(modules) = &args.default_allowed_modules {
        settings.default_allowed_modules = modules
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
    }
    set(&mut settings.default_timeout_secs, &args.default_timeout);
    set(&mut settings.max_timeout_secs, &args.max_timeout);
    set(&mut settings.cancellation_grace_ms, &args.cancellation_grace_ms);
    set(&mut settings.max_concurrent_executions, &args.max_concurrent);
    set(&mut settings.max_output_bytes, &args.max_output_bytes);
    set(&mut settings.max_source_bytes, &args.max_source_bytes);
    set(&mut settings.dns_timeout_ms, &args.dns_timeout_ms);
    set(&mut settings.max_response_bytes, &args.max_response_bytes);
    set(&mut settings.max_http_timeout_secs, &args.max_http_timeout);
    set(&mut settings.packages_dir, &args.packages_dir);
    set(&mut settings.python_program, &args.python);
    set(&mut settings.install_timeout_secs, &args.install_timeout);
    set(&mut settings.package_index_url, &args.package_index_url);
    set(&mut settings.vulnerability_feed_url, &args.vulnerability_feed_url);
    set(&mut settings.vulnerability_cache_ttl_secs, &args.vulnerability_cache_ttl);
}

/// Load the config file named by the arguments, apply overrides and validate
pub async fn resolve_settings(args: &CliArgs) -> Result<SandboxSettings, SettingsError> {
    let mut settings = load_settings(args.config.as_deref()).await?;
    apply_cli_overrides(&mut settings, args);
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_applied() {
        let args = CliArgs::parse_from([
            "sandbox-api",
            "--port",
            "9100",
            "--shared-secret",
            "s3cret",
            "--default-allowed-modules",
            "json, math,,re",
            "--max-timeout",
            "45",
        ]);
        let mut settings = SandboxSettings::default();
        apply_cli_overrides(&mut settings, &args);

        assert_eq!(settings.port, 9100);
        assert_eq!(settings.shared_secret.as_deref(), Some("s3cret"));
        assert_eq!(settings.default_allowed_modules, vec!["json", "math", "re"]);
        assert_eq!(settings.max_timeout_secs, 45.0);
        // Untouched values keep their defaults
        assert_eq!(settings.secret_header, "X-Sandbox-Secret");
    }

    #[test]
    fn test_no_overrides_keeps_settings() {
        let mut settings = SandboxSettings::default();
        apply_cli_overrides(&mut settings, &CliArgs::default());
        assert_eq!(settings, SandboxSettings::default());
    }

    #[tokio::test]
    async fn test_resolve_settings_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{"default_timeout_secs": 5}"#).await.unwrap();

        let mut args = CliArgs {
            config: Some(path),
            ..Default::default()
        };
        assert_eq!(resolve_settings(&args).await.unwrap().default_timeout_secs, 5.0);

        args.max_timeout = Some(1.0);
        assert!(resolve_settings(&args).await.is_err());
    }
}
