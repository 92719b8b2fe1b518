//! Package installer for third-party modules named in the allowed-module list.
//!
//! Import names are mapped to distributions through a static alias table,
//! checked against the package directory, looked up on the package index and
//! the vulnerability feed, then installed binary-only with pip into the
//! package directory. Findings are recorded but never block an install, and
//! a failed package never aborts the rest of the batch.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

use crate::error::{ErrorBody, SandboxError};
use crate::package_index::{normalize_distribution, IndexError, PackageIndexClient, VulnerabilityFinding};
use crate::settings::SandboxSettings;
use crate::stdlib_modules::classify;

static MODULE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").unwrap());

/// Import name → distribution name, where they differ
const DISTRIBUTION_ALIASES: &[(&str, &str)] = &[
    ("yaml", "PyYAML"),
    ("PIL", "Pillow"),
    ("bs4", "beautifulsoup4"),
    ("sklearn", "scikit-learn"),
    ("cv2", "opencv-python"),
    ("dateutil", "python-dateutil"),
    ("dotenv", "python-dotenv"),
    ("jwt", "PyJWT"),
    ("Crypto", "pycryptodome"),
    ("attr", "attrs"),
    ("magic", "python-magic"),
    ("docx", "python-docx"),
    ("pptx", "python-pptx"),
    ("serial", "pyserial"),
    ("usb", "pyusb"),
    ("OpenSSL", "pyOpenSSL"),
    ("google", "protobuf"),
    ("dns", "dnspython"),
    ("jose", "python-jose"),
    ("slugify", "python-slugify"),
    ("multipart", "python-multipart"),
    ("markdown", "Markdown"),
    ("tomli_w", "tomli-w"),
];

/// Longest tail of pip's stderr kept in a failure message
const MAX_ERROR_CHARS: usize = 600;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("invalid module name '{0}'")]
    InvalidName(String),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("failed to prepare package directory {path}: {source}")]
    PackagesDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start installer '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("install of {0} timed out after {1}s")]
    TimedOut(String, u64),
    #[error("pip exited with {code}: {stderr}")]
    Pip { code: String, stderr: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallStatus {
    Installed,
    Failed,
    SkippedAlreadyPresent,
}

/// Outcome for one requested module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageInstallRecord {
    pub module_name: String,
    pub resolved_package_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_version: Option<String>,
    pub status: InstallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default)]
    pub vulnerability_findings: Vec<VulnerabilityFinding>,
}

/// Summary of one provisioning run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Requested names that are part of the standard library
    pub stdlib: Vec<String>,
    pub records: Vec<PackageInstallRecord>,
}

#[derive(Debug, Clone)]
pub struct InstallerConfig {
    pub packages_dir: PathBuf,
    pub python_program: String,
    pub install_timeout: Duration,
}

impl InstallerConfig {
    pub fn from_settings(settings: &SandboxSettings) -> Self {
        Self {
            packages_dir: settings.packages_dir.clone(),
            python_program: settings.python_program.clone(),
            install_timeout: settings.install_timeout(),
        }
    }
}

/// Distribution name for an import name
pub fn distribution_for(module: &str) -> String {
    DISTRIBUTION_ALIASES
        .iter()
        .find(|(import, _)| *import == module)
        .map(|(_, dist)| dist.to_string())
        .unwrap_or_else(|| module.to_string())
}

/// Module names reach a subprocess argv; only a strict character set passes
pub fn validate_module_name(name: &str) -> Result<(), InstallError> {
    if name.is_empty() || name.starts_with('-') || !MODULE_NAME_RE.is_match(name) {
        return Err(InstallError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub struct PackageInstaller {
    config: InstallerConfig,
    index: Arc<PackageIndexClient>,
}

impl PackageInstaller {
    pub fn new(config: InstallerConfig, index: Arc<PackageIndexClient>) -> Self {
        Self { config, index }
    }

    pub fn packages_dir(&self) -> &Path {
        &self.config.packages_dir
    }

    /// Install every third-party module among `names`.
    pub async fn install(&self, names: &[String]) -> InstallReport {
        let started_at = Utc::now();
        let classification = classify(names);
        let mut records = Vec::with_capacity(classification.third_party.len());

        for module in &classification.third_party {
            let record = self.install_one(module).await;
            match record.status {
                InstallStatus::Failed => tracing::warn!(
                    module = %module,
                    package = %record.resolved_package_name,
                    error = record.error.as_ref().map(|e| e.message.as_str()).unwrap_or_default(),
                    "package install failed"
                ),
                status => tracing::info!(
                    module = %module,
                    package = %record.resolved_package_name,
                    version = record.resolved_version.as_deref().unwrap_or_default(),
                    findings = record.vulnerability_findings.len(),
                    ?status,
                    "package provisioned"
                ),
            }
            records.push(record);
        }

        InstallReport {
            started_at,
            finished_at: Utc::now(),
            stdlib: classification.stdlib,
            records,
        }
    }

    async fn install_one(&self, module: &str) -> PackageInstallRecord {
        let distribution = distribution_for(module);
        let mut record = PackageInstallRecord {
            module_name: module.to_string(),
            resolved_package_name: distribution.clone(),
            resolved_version: None,
            status: InstallStatus::Failed,
            error: None,
            vulnerability_findings: Vec::new(),
        };

        if let Err(e) = validate_module_name(module).and_then(|_| validate_module_name(&distribution)) {
            record.error = Some(SandboxError::from(e).to_body());
            return record;
        }

        if self.is_installed(module, &distribution).await {
            record.status = InstallStatus::SkippedAlreadyPresent;
            return record;
        }

        let metadata = match self.index.package_metadata(&distribution).await {
            Ok(metadata) => metadata,
            Err(e) => {
                record.error = Some(SandboxError::from(InstallError::from(e)).to_body());
                return record;
            }
        };
        record.resolved_package_name = metadata.name.clone();
        record.resolved_version = Some(metadata.version.clone());

        match self
            .index
            .vulnerabilities(&metadata.name, Some(&metadata.version))
            .await
        {
            Ok(findings) => {
                if !findings.is_empty() {
                    tracing::warn!(
                        package = %metadata.name,
                        version = %metadata.version,
                        count = findings.len(),
                        "known vulnerabilities in package"
                    );
                }
                record.vulnerability_findings = findings;
            }
            Err(e) => {
                tracing::warn!(package = %metadata.name, error = %e, "vulnerability lookup failed");
            }
        }

        match self.run_pip(&metadata.name, &metadata.version).await {
            Ok(()) => record.status = InstallStatus::Installed,
            Err(e) => record.error = Some(SandboxError::from(e).to_body()),
        }
        record
    }

    /// Whether a module is already importable from the package directory
    pub async fn is_installed(&self, module: &str, distribution: &str) -> bool {
        let dir = &self.config.packages_dir;
        if tokio::fs::metadata(dir.join(module)).await.is_ok()
            || tokio::fs::metadata(dir.join(format!("{module}.py"))).await.is_ok()
        {
            return true;
        }

        let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
            return false;
        };
        let wanted = normalize_distribution(distribution);
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".dist-info")) else {
                continue;
            };
            let dist_name = stem.rsplit_once('-').map_or(stem, |(name, _version)| name);
            if normalize_distribution(dist_name) == wanted {
                return true;
            }
        }
        false
    }

    async fn run_pip(&self, distribution: &str, version: &str) -> Result<(), InstallError> {
        let dir = &self.config.packages_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| InstallError::PackagesDir {
                path: dir.clone(),
                source,
            })?;

        let requirement = format!("{distribution}=={version}");
        let mut cmd = Command::new(&self.config.python_program);
        cmd.args(["-m", "pip", "install", "--only-binary=:all:", "--no-input", "--disable-pip-version-check", "--target"])
            .arg(dir)
            .arg(&requirement)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(requirement = %requirement, dir = ?dir, "running pip");
        let output = match tokio::time::timeout(self.config.install_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(InstallError::Spawn {
                    program: self.config.python_program.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(InstallError::TimedOut(
                    requirement,
                    self.config.install_timeout.as_secs(),
                ))
            }
        };

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let tail_start = stderr
            .char_indices()
            .rev()
            .nth(MAX_ERROR_CHARS)
            .map_or(0, |(i, _)| i);
        Err(InstallError::Pip {
            code: output
                .status
                .code()
                .map_or_else(|| "a signal".to_string(), |c| format!("status {c}")),
            stderr: stderr[tail_start..].to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installer(dir: &Path) -> PackageInstaller {
        let index = PackageIndexClient::new(
            "http://127.0.0.1:9",
            "http://127.0.0.1:9",
            Duration::from_secs(60),
            8,
            Duration::from_millis(500),
        )
        .unwrap();
        PackageInstaller::new(
            InstallerConfig {
                packages_dir: dir.to_path_buf(),
                python_program: "python3".to_string(),
                install_timeout: Duration::from_secs(5),
            },
            Arc::new(index),
        )
    }

    #[test]
    fn test_distribution_aliases() {
        assert_eq!(distribution_for("yaml"), "PyYAML");
        assert_eq!(distribution_for("bs4"), "beautifulsoup4");
        assert_eq!(distribution_for("requests"), "requests");
    }

    #[test]
    fn test_module_name_validation() {
        assert!(validate_module_name("python-dateutil").is_ok());
        assert!(validate_module_name("zope.interface").is_ok());
        for bad in ["", "-e", "--index-url", "pkg; rm -rf /", "a b", "pkg==1.0"] {
            assert!(validate_module_name(bad).is_err(), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn test_is_installed_detection() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join("requests")).await.unwrap();
        tokio::fs::write(dir.path().join("six.py"), "").await.unwrap();
        tokio::fs::create_dir(dir.path().join("PyYAML-6.0.1.dist-info")).await.unwrap();
        let installer = installer(dir.path());

        assert!(installer.is_installed("requests", "requests").await);
        assert!(installer.is_installed("six", "six").await);
        assert!(installer.is_installed("yaml", "pyyaml").await);
        assert!(!installer.is_installed("numpy", "numpy").await);
    }

    #[tokio::test]
    async fn test_present_package_skipped_without_network() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join("requests")).await.unwrap();
        let installer = installer(dir.path());

        let names = vec!["json".to_string(), "requests".to_string(), "requests.adapters".to_string()];
        let report = installer.install(&names).await;

        assert_eq!(report.stdlib, vec!["json"]);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].status, InstallStatus::SkippedAlreadyPresent);
        assert_eq!(installer.index.request_count(), 0);
    }

    #[tokio::test]
    async fn test_failures_do_not_abort_batch() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join("requests")).await.unwrap();
        let installer = installer(dir.path());

        // Index is unreachable, so the first package fails; the second is present
        let names = vec!["not_a_real_pkg_xyz".to_string(), "requests".to_string()];
        let report = installer.install(&names).await;

        assert_eq!(report.records.len(), 2);
        assert_eq!(report.records[0].status, InstallStatus::Failed);
        let error = report.records[0].error.as_ref().unwrap();
        assert_eq!(error.kind, crate::error::ErrorKind::InstallError);
        assert_eq!(report.records[1].status, InstallStatus::SkippedAlreadyPresent);
    }

    #[test]
    fn test_status_serializes_kebab_case() {
        let json = serde_json::to_string(&InstallStatus::SkippedAlreadyPresent).unwrap();
        assert_eq!(json, "\"skipped-already-present\"");
    }
}
