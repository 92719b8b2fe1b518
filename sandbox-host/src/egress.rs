//! Network egress guard.
//!
//! Decides whether an outbound request from tool code is permitted and to
//! which literal address the connection must go. Two layers must both pass:
//!
//! 1. the server's host allowlist, matched on the hostname as written;
//! 2. SSRF protection: scheme, blocked hostnames, a single bounded DNS
//!    resolution and a private/reserved range check on every address.
//!
//! The first resolved address is returned and the HTTP client is pinned to
//! it, so a second lookup cannot rebind the name to an internal address.
//! Resolution results are never cached.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::{Host, Url};

/// Hostnames rejected before any DNS lookup.
const BLOCKED_HOSTNAMES: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "ip6-localhost",
    "ip6-loopback",
    "metadata",
    "metadata.google.internal",
    "metadata.goog",
    "instance-data",
    "instance-data.ec2.internal",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EgressError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("scheme '{0}' is not allowed (only http and https)")]
    SchemeNotAllowed(String),

    #[error("host '{0}' is not in the server's allowed hosts")]
    HostNotAllowed(String),

    #[error("host '{0}' is blocked")]
    BlockedHost(String),

    #[error("DNS resolution failed for '{host}': {message}")]
    Resolution { host: String, message: String },

    #[error("host '{host}' resolves to blocked address {ip}")]
    BlockedAddress { host: String, ip: IpAddr },
}

/// A URL that passed every egress check, with the address to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUrl {
    pub url: Url,
    pub scheme: String,
    /// Host as written in the URL (lowercased, no brackets)
    pub host: String,
    pub port: u16,
    pub resolved_ip: IpAddr,
    /// True when the URL named a domain (the client must pin it)
    pub is_domain: bool,
}

/// Name resolution used by the guard.
pub trait Resolver: Send + Sync {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<Vec<IpAddr>>>;
}

/// Resolver backed by the operating system (`getaddrinfo` via tokio).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<Vec<IpAddr>>> {
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host, port)).await?;
            Ok(addrs.map(|a| a.ip()).collect())
        })
    }
}

/// Fixed name table, for tests and air-gapped deployments.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, host: &str, ips: &[IpAddr]) -> Self {
        self.entries.insert(host.to_ascii_lowercase(), ips.to_vec());
        self
    }
}

impl Resolver for StaticResolver {
    fn resolve<'a>(&'a self, host: &'a str, _port: u16) -> BoxFuture<'a, io::Result<Vec<IpAddr>>> {
        let result = self
            .entries
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such host"));
        Box::pin(async move { result })
    }
}

/// Egress policy shared by every execution.
#[derive(Clone)]
pub struct EgressGuard {
    resolver: Arc<dyn Resolver>,
    dns_timeout: Duration,
}

impl EgressGuard {
    pub fn new(resolver: Arc<dyn Resolver>, dns_timeout: Duration) -> Self {
        Self {
            resolver,
            dns_timeout,
        }
    }

    /// Full check for a tool request: allowlist on the original hostname,
    /// then SSRF validation of the resolved addresses.
    pub async fn check(&self, raw_url: &str, allowed_hosts: &[String]) -> Result<ValidatedUrl, EgressError> {
        let url = parse_url(raw_url)?;
        authorize(&url, allowed_hosts)?;
        self.validate_parsed(url).await
    }

    /// SSRF validation without the allowlist.
    pub async fn validate(&self, raw_url: &str) -> Result<ValidatedUrl, EgressError> {
        let url = parse_url(raw_url)?;
        self.validate_parsed(url).await
    }

    async fn validate_parsed(&self, url: Url) -> Result<ValidatedUrl, EgressError> {
        let scheme = url.scheme().to_string();
        if scheme != "http" && scheme != "https" {
            return Err(EgressError::SchemeNotAllowed(scheme));
        }
        let port = url
            .port_or_known_default()
            .ok_or_else(|| EgressError::InvalidUrl("URL has no port".to_string()))?;

        let (host, literal) = match url.host() {
            Some(Host::Domain(domain)) => (normalize_domain(domain), None),
            Some(Host::Ipv4(ip)) => (ip.to_string(), Some(IpAddr::V4(ip))),
            Some(Host::Ipv6(ip)) => (ip.to_string(), Some(IpAddr::V6(ip))),
            None => return Err(EgressError::InvalidUrl("URL has no host".to_string())),
        };

        if is_blocked_hostname(&host) {
            return Err(EgressError::BlockedHost(host));
        }

        if let Some(ip) = literal {
            if is_blocked_ip(&ip) {
                return Err(EgressError::BlockedAddress { host, ip });
            }
            return Ok(ValidatedUrl {
                url,
                scheme,
                host,
                port,
                resolved_ip: ip,
                is_domain: false,
            });
        }

        let addrs = match tokio::time::timeout(self.dns_timeout, self.resolver.resolve(&host, port)).await {
            Ok(Ok(addrs)) => addrs,
            Ok(Err(e)) => {
                return Err(EgressError::Resolution {
                    host,
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(EgressError::Resolution {
                    host,
                    message: format!("timed out after {}ms", self.dns_timeout.as_millis()),
                })
            }
        };

        let resolved_ip = match addrs.first() {
            Some(ip) => *ip,
            None => {
                return Err(EgressError::Resolution {
                    host,
                    message: "no addresses returned".to_string(),
                })
            }
        };

        // Every address must be public, not only the one we connect to
        if let Some(ip) = addrs.iter().find(|ip| is_blocked_ip(ip)) {
            return Err(EgressError::BlockedAddress { host, ip: *ip });
        }

        Ok(ValidatedUrl {
            url,
            scheme,
            host,
            port,
            resolved_ip,
            is_domain: true,
        })
    }
}

fn parse_url(raw_url: &str) -> Result<Url, EgressError> {
    Url::parse(raw_url.trim()).map_err(|e| EgressError::InvalidUrl(e.to_string()))
}

fn normalize_domain(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

/// Allowlist check on the hostname as written in the URL.
///
/// Entries match exactly (case-insensitive), `*.example.com` matches any
/// subdomain of `example.com` but not the apex, and IP literals match
/// literally. An empty allowlist denies everything.
pub fn authorize(url: &Url, allowed_hosts: &[String]) -> Result<(), EgressError> {
    let host = match url.host() {
        Some(Host::Domain(domain)) => normalize_domain(domain),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        None => return Err(EgressError::InvalidUrl("URL has no host".to_string())),
    };

    let permitted = allowed_hosts.iter().any(|entry| host_matches(&host, entry));
    if permitted {
        Ok(())
    } else {
        Err(EgressError::HostNotAllowed(host))
    }
}

fn host_matches(host: &str, entry: &str) -> bool {
    let entry = entry
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if entry.is_empty() {
        return false;
    }
    if let Some(suffix) = entry.strip_prefix("*.") {
        return host.len() > suffix.len() + 1
            && host.ends_with(suffix)
            && host.as_bytes()[host.len() - suffix.len() - 1] == b'.';
    }
    if let (Ok(host_ip), Ok(entry_ip)) = (host.parse::<IpAddr>(), entry.parse::<IpAddr>()) {
        return host_ip == entry_ip;
    }
    host == entry
}

fn is_blocked_hostname(host: &str) -> bool {
    BLOCKED_HOSTNAMES.contains(&host) || host.ends_with(".localhost")
}

/// Check if an IP address is in a private or reserved range.
pub fn is_blocked_ip(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(ip) => is_blocked_ipv4(ip),
        IpAddr::V6(ip) => is_blocked_ipv6(ip),
    }
}

fn is_blocked_ipv4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        // 0.0.0.0/8 (current network)
        || octets[0] == 0
        // 100.64.0.0/10 (carrier-grade NAT)
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
        // 192.0.0.0/24 (IETF protocol assignments)
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 0)
        // 198.18.0.0/15 (benchmarking)
        || (octets[0] == 198 && (octets[1] & 0xfe) == 18)
        // 240.0.0.0/4 (reserved)
        || octets[0] >= 240
}

fn is_blocked_ipv6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
        return true;
    }
    let segments = ip.segments();
    // fc00::/7 (unique local)
    if segments[0] & 0xfe00 == 0xfc00 {
        return true;
    }
    // fe80::/10 (link-local) and fec0::/10 (deprecated site-local)
    if segments[0] & 0xffc0 == 0xfe80 || segments[0] & 0xffc0 == 0xfec0 {
        return true;
    }
    // IPv4-mapped IPv6: ::ffff:a.b.c.d
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_ipv4(&v4);
    }
    // 64:ff9b::/96 (NAT64) and ::/96 (IPv4-compatible, deprecated) carry
    // an IPv4 address in the low 32 bits
    if segments[..6] == [0x64, 0xff9b, 0, 0, 0, 0] || segments[..6] == [0; 6] {
        return is_blocked_ipv4(&embedded_ipv4(segments[6], segments[7]));
    }
    // 2002::/16 (6to4) carries it in bits 16..48
    if segments[0] == 0x2002 {
        return is_blocked_ipv4(&embedded_ipv4(segments[1], segments[2]));
    }
    false
}

fn embedded_ipv4(high: u16, low: u16) -> Ipv4Addr {
    Ipv4Addr::from((u32::from(high) << 16) | u32::from(low))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> EgressGuard {
        let resolver = StaticResolver::new()
            .with("api.example.com", &["93.184.216.34".parse().unwrap()])
            .with("internal.example.com", &["10.1.2.3".parse().unwrap()])
            .with(
                "mixed.example.com",
                &["93.184.216.34".parse().unwrap(), "169.254.169.254".parse().unwrap()],
            )
            .with("empty.example.com", &[]);
        EgressGuard::new(Arc::new(resolver), Duration::from_secs(1))
    }

    fn hosts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_private_ipv4_ranges() {
        for ip in [
            "127.0.0.1", "10.0.0.1", "172.16.5.4", "172.31.255.255", "192.168.1.1",
            "169.254.169.254", "0.0.0.0", "100.64.0.1", "100.127.255.255",
            "255.255.255.255", "224.0.0.1",
        ] {
            assert!(is_blocked_ip(&ip.parse().unwrap()), "{ip} should be blocked");
        }
    }

    #[test]
    fn test_public_ipv4() {
        for ip in ["8.8.8.8", "93.184.216.34", "172.32.0.1", "100.128.0.1"] {
            assert!(!is_blocked_ip(&ip.parse().unwrap()), "{ip} should be allowed");
        }
    }

    #[test]
    fn test_ipv6_ranges() {
        for ip in ["::1", "::", "fc00::1", "fd12:3456::1", "fe80::1", "ff02::1", "::ffff:127.0.0.1", "::ffff:10.0.0.1", "64:ff9b::a00:1"] {
            assert!(is_blocked_ip(&ip.parse().unwrap()), "{ip} should be blocked");
        }
        assert!(!is_blocked_ip(&"2606:4700:4700::1111".parse().unwrap()));
        assert!(!is_blocked_ip(&"::ffff:8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_ipv6_embedded_ipv4() {
        for ip in ["::127.0.0.1", "::10.0.0.1", "::169.254.169.254", "2002:7f00:1::", "2002:a9fe:a9fe::1", "2002:c0a8:101::"] {
            assert!(is_blocked_ip(&ip.parse().unwrap()), "{ip} should be blocked");
        }
        for ip in ["::8.8.8.8", "2002:808:808::1"] {
            assert!(!is_blocked_ip(&ip.parse().unwrap()), "{ip} should be allowed");
        }
    }

    #[test]
    fn test_allowlist_matching() {
        let url = Url::parse("https://API.Example.com/v1").unwrap();
        assert!(authorize(&url, &hosts(&["api.example.com"])).is_ok());
        assert!(authorize(&url, &hosts(&["*.example.com"])).is_ok());
        assert!(authorize(&url, &hosts(&["example.com"])).is_err());

        let apex = Url::parse("https://example.com/").unwrap();
        assert!(authorize(&apex, &hosts(&["*.example.com"])).is_err());

        let lookalike = Url::parse("https://badexample.com/").unwrap();
        assert!(authorize(&lookalike, &hosts(&["*.example.com"])).is_err());
    }

    #[test]
    fn test_empty_allowlist_denies() {
        let url = Url::parse("https://api.example.com/").unwrap();
        assert_eq!(
            authorize(&url, &[]),
            Err(EgressError::HostNotAllowed("api.example.com".to_string()))
        );
    }

    #[test]
    fn test_ip_literal_allowlist() {
        let url = Url::parse("http://[2606:4700::1111]:8080/").unwrap();
        assert!(authorize(&url, &hosts(&["[2606:4700::1111]"])).is_ok());
        let url = Url::parse("http://93.184.216.34/").unwrap();
        assert!(authorize(&url, &hosts(&["93.184.216.34"])).is_ok());
    }

    #[tokio::test]
    async fn test_public_resolution_is_pinned() {
        let validated = guard()
            .check("https://api.example.com/data", &hosts(&["api.example.com"]))
            .await
            .unwrap();
        assert_eq!(validated.resolved_ip, "93.184.216.34".parse::<IpAddr>().unwrap());
        assert_eq!(validated.port, 443);
        assert_eq!(validated.scheme, "https");
        assert_eq!(validated.host, "api.example.com");
        assert!(validated.is_domain);
    }

    #[tokio::test]
    async fn test_bad_scheme_rejected() {
        let err = guard().validate("ftp://api.example.com/file").await.unwrap_err();
        assert!(matches!(err, EgressError::SchemeNotAllowed(_)));
        let err = guard().validate("file:///etc/passwd").await.unwrap_err();
        assert!(matches!(err, EgressError::SchemeNotAllowed(_)));
    }

    #[tokio::test]
    async fn test_blocked_hostnames_rejected_before_dns() {
        for url in ["http://localhost:8080/", "http://app.localhost/", "http://metadata.google.internal/"] {
            let err = guard().validate(url).await.unwrap_err();
            assert!(matches!(err, EgressError::BlockedHost(_)), "{url}");
        }
    }

    #[tokio::test]
    async fn test_private_resolution_rejected() {
        let err = guard().validate("http://internal.example.com/").await.unwrap_err();
        assert!(matches!(err, EgressError::BlockedAddress { .. }));
        // One bad address among good ones still rejects
        let err = guard().validate("http://mixed.example.com/").await.unwrap_err();
        assert!(matches!(err, EgressError::BlockedAddress { .. }));
    }

    #[tokio::test]
    async fn test_ip_literals_checked_without_dns() {
        for url in ["http://127.0.0.1/", "http://[::1]/", "http://169.254.169.254/latest", "http://0x7f.1/", "http://[::ffff:192.168.0.1]/"] {
            let err = guard().validate(url).await.unwrap_err();
            assert!(matches!(err, EgressError::BlockedAddress { .. }), "{url}");
        }
    }

    #[tokio::test]
    async fn test_resolution_failures() {
        let err = guard().validate("https://empty.example.com/").await.unwrap_err();
        assert!(matches!(err, EgressError::Resolution { .. }));
        let err = guard().validate("https://unknown.example.com/").await.unwrap_err();
        assert!(matches!(err, EgressError::Resolution { .. }));
    }

    #[tokio::test]
    async fn test_allowlist_runs_before_resolution() {
        let err = guard()
            .check("https://internal.example.com/", &hosts(&["api.example.com"]))
            .await
            .unwrap_err();
        assert!(matches!(err, EgressError::HostNotAllowed(_)));
    }
}
