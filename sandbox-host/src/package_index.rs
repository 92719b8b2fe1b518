//! Package index and vulnerability feed clients.
//!
//! Metadata comes from the PyPI JSON API (`/pypi/{name}/json`); known
//! vulnerabilities come from OSV (`POST /v1/query`). Vulnerability results are
//! cached per package and version with a TTL; the cache is read under a
//! shared lock so concurrent lookups do not serialize.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("package '{0}' was not found on the package index")]
    NotFound(String),
    #[error("request to {service} failed: {message}")]
    Request { service: &'static str, message: String },
    #[error("unexpected response from {service}: {message}")]
    Response { service: &'static str, message: String },
}

/// Latest release information for a distribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub name: String,
    pub version: String,
}

/// One known vulnerability affecting a package version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnerabilityFinding {
    pub id: String,
    pub severity: Option<String>,
    pub fixed_version: Option<String>,
    pub link: String,
}

struct CachedFindings {
    fetched_at: Instant,
    findings: Vec<VulnerabilityFinding>,
}

pub struct PackageIndexClient {
    http: reqwest::Client,
    index_url: String,
    feed_url: String,
    ttl: Duration,
    cache: RwLock<LruCache<String, CachedFindings>>,
    requests: AtomicUsize,
}

impl PackageIndexClient {
    pub fn new(
        index_url: &str,
        feed_url: &str,
        ttl: Duration,
        cache_size: usize,
        request_timeout: Duration,
    ) -> Result<Self, IndexError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| IndexError::Request {
                service: "package index",
                message: e.to_string(),
            })?;
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            http,
            index_url: index_url.trim_end_matches('/').to_string(),
            feed_url: feed_url.trim_end_matches('/').to_string(),
            ttl,
            cache: RwLock::new(LruCache::new(capacity)),
            requests: AtomicUsize::new(0),
        })
    }

    /// Number of network requests issued so far
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    /// Fetch the latest release of a distribution from the index
    pub async fn package_metadata(&self, distribution: &str) -> Result<PackageMetadata, IndexError> {
        const SERVICE: &str = "package index";
        let url = format!("{}/pypi/{}/json", self.index_url, distribution);
        self.requests.fetch_add(1, Ordering::Relaxed);

        let response = self.http.get(&url).send().await.map_err(|e| IndexError::Request {
            service: SERVICE,
            message: e.without_url().to_string(),
        })?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(IndexError::NotFound(distribution.to_string()));
        }
        if !response.status().is_success() {
            return Err(IndexError::Response {
                service: SERVICE,
                message: format!("HTTP {}", response.status()),
            });
        }
        let body: Value = response.json().await.map_err(|e| IndexError::Response {
            service: SERVICE,
            message: e.without_url().to_string(),
        })?;
        parse_metadata(&body).ok_or_else(|| IndexError::Response {
            service: SERVICE,
            message: "missing info.name or info.version".to_string(),
        })
    }

    /// Known vulnerabilities for a distribution (optionally at a version)
    pub async fn vulnerabilities(
        &self,
        distribution: &str,
        version: Option<&str>,
    ) -> Result<Vec<VulnerabilityFinding>, IndexError> {
        const SERVICE: &str = "vulnerability feed";
        let key = format!("{}@{}", distribution.to_ascii_lowercase(), version.unwrap_or("*"));
        if let Some(findings) = self.cached(&key) {
            return Ok(findings);
        }

        let mut query = json!({ "package": { "name": distribution, "ecosystem": "PyPI" } });
        if let Some(version) = version {
            query["version"] = json!(version);
        }
        self.requests.fetch_add(1, Ordering::Relaxed);
        let response = self
            .http
            .post(format!("{}/v1/query", self.feed_url))
            .json(&query)
            .send()
            .await
            .map_err(|e| IndexError::Request {
                service: SERVICE,
                message: e.without_url().to_string(),
            })?;
        if !response.status().is_success() {
            return Err(IndexError::Response {
                service: SERVICE,
                message: format!("HTTP {}", response.status()),
            });
        }
        let body: Value = response.json().await.map_err(|e| IndexError::Response {
            service: SERVICE,
            message: e.without_url().to_string(),
        })?;
        let findings = parse_findings(&body, distribution);

        if let Ok(mut cache) = self.cache.write() {
            cache.put(
                key,
                CachedFindings {
                    fetched_at: Instant::now(),
                    findings: findings.clone(),
                },
            );
        }
        Ok(findings)
    }

    fn cached(&self, key: &str) -> Option<Vec<VulnerabilityFinding>> {
        let cache = self.cache.read().ok()?;
        let entry = cache.peek(key)?;
        if entry.fetched_at.elapsed() < self.ttl {
            Some(entry.findings.clone())
        } else {
            None
        }
    }
}

fn parse_metadata(body: &Value) -> Option<PackageMetadata> {
    let info = body.get("info")?;
    Some(PackageMetadata {
        name: info.get("name")?.as_str()?.to_string(),
        version: info.get("version")?.as_str()?.to_string(),
    })
}

/// Extract findings from an OSV query response.
///
/// Severity prefers `database_specific.severity` and falls back to the first
/// `severity[].score`; the fixed version is the first `fixed` event of a range
/// for this package; the link is the advisory reference, else the OSV page.
pub fn parse_findings(body: &Value, distribution: &str) -> Vec<VulnerabilityFinding> {
    let Some(vulns) = body.get("vulns").and_then(Value::as_array) else {
        return Vec::new();
    };

    vulns
        .iter()
        .filter_map(|vuln| {
            let id = vuln.get("id")?.as_str()?.to_string();
            let severity = vuln
                .pointer("/database_specific/severity")
                .and_then(Value::as_str)
                .or_else(|| vuln.pointer("/severity/0/score").and_then(Value::as_str))
                .map(str::to_string);
            let fixed_version = fixed_version(vuln, distribution);
            let link = vuln
                .get("references")
                .and_then(Value::as_array)
                .and_then(|refs| {
                    refs.iter()
                        .find(|r| r.get("type").and_then(Value::as_str) == Some("ADVISORY"))
                })
                .and_then(|r| r.get("url"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("https://osv.dev/vulnerability/{id}"));
            Some(VulnerabilityFinding {
                id,
                severity,
                fixed_version,
                link,
            })
        })
        .collect()
}

fn fixed_version(vuln: &Value, distribution: &str) -> Option<String> {
    let affected = vuln.get("affected")?.as_array()?;
    affected
        .iter()
        .filter(|a| {
            a.pointer("/package/name")
                .and_then(Value::as_str)
                .map_or(true, |n| normalize_distribution(n) == normalize_distribution(distribution))
        })
        .filter_map(|a| a.get("ranges")?.as_array())
        .flatten()
        .filter_map(|range| range.get("events")?.as_array())
        .flatten()
        .find_map(|event| event.get("fixed").and_then(Value::as_str).map(str::to_string))
}

/// PEP 503 normalisation: lowercase, runs of `-_.` collapse to `-`
pub fn normalize_distribution(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = false;
    for c in name.chars() {
        if c == '-' || c == '_' || c == '.' {
            if !last_sep {
                out.push('-');
            }
            last_sep = true;
        } else {
            out.push(c.to_ascii_lowercase());
            last_sep = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metadata() {
        let body = json!({"info": {"name": "PyYAML", "version": "6.0.1"}, "releases": {}});
        assert_eq!(
            parse_metadata(&body),
            Some(PackageMetadata {
                name: "PyYAML".to_string(),
                version: "6.0.1".to_string()
            })
        );
        assert_eq!(parse_metadata(&json!({"info": {}})), None);
    }

    #[test]
    fn test_parse_findings() {
        let body = json!({
            "vulns": [
                {
                    "id": "GHSA-xxxx",
                    "database_specific": { "severity": "HIGH" },
                    "severity": [{ "type": "CVSS_V3", "score": "CVSS:3.1/AV:N" }],
                    "affected": [{
                        "package": { "name": "pyyaml", "ecosystem": "PyPI" },
                        "ranges": [{ "type": "ECOSYSTEM", "events": [{ "introduced": "0" }, { "fixed": "5.4" }] }]
                    }],
                    "references": [
                        { "type": "WEB", "url": "https://example.com/blog" },
                        { "type": "ADVISORY", "url": "https://github.com/advisories/GHSA-xxxx" }
                    ]
                },
                {
                    "id": "PYSEC-2020-1",
                    "severity": [{ "type": "CVSS_V3", "score": "CVSS:3.1/AV:L" }]
                }
            ]
        });

        let findings = parse_findings(&body, "PyYAML");
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity.as_deref(), Some("HIGH"));
        assert_eq!(findings[0].fixed_version.as_deref(), Some("5.4"));
        assert_eq!(findings[0].link, "https://github.com/advisories/GHSA-xxxx");
        assert_eq!(findings[1].severity.as_deref(), Some("CVSS:3.1/AV:L"));
        assert_eq!(findings[1].fixed_version, None);
        assert_eq!(findings[1].link, "https://osv.dev/vulnerability/PYSEC-2020-1");
    }

    #[test]
    fn test_no_vulns() {
        assert!(parse_findings(&json!({}), "requests").is_empty());
    }

    #[test]
    fn test_normalize_distribution() {
        assert_eq!(normalize_distribution("Python_Dateutil"), "python-dateutil");
        assert_eq!(normalize_distribution("zope..interface"), "zope-interface");
    }

    #[tokio::test]
    async fn test_cached_findings_skip_network() {
        let client = PackageIndexClient::new(
            "http://127.0.0.1:9",
            "http://127.0.0.1:9",
            Duration::from_secs(60),
            4,
            Duration::from_millis(200),
        )
        .unwrap();
        client.cache.write().unwrap().put(
            "requests@2.0".to_string(),
            CachedFindings {
                fetched_at: Instant::now(),
                findings: vec![],
            },
        );
        let findings = client.vulnerabilities("Requests", Some("2.0")).await.unwrap();
        assert!(findings.is_empty());
        assert_eq!(client.request_count(), 0);
    }
}
