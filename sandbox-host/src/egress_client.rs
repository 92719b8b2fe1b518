//! Outbound HTTP for a single execution.
//!
//! [`ExecutionHttpClient`] is the host side of `http_request()` inside the
//! sandbox and the transport for passthrough tools. Every call goes through
//! the [`EgressGuard`] with the server's allowlist, connects to the pinned
//! address, never follows redirects, is bounded by the execution deadline and
//! reads at most `max_response_bytes` of body.

use python_sandbox::bridge::{BridgeError, HostBridge, HttpRequest, HttpResponse};
use reqwest::redirect::Policy;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;

use crate::egress::EgressGuard;

/// Limits applied to every outbound call of an execution.
#[derive(Debug, Clone, Copy)]
pub struct HttpLimits {
    pub max_response_bytes: usize,
    pub max_request_timeout: Duration,
}

pub struct ExecutionHttpClient {
    guard: Arc<EgressGuard>,
    allowed_hosts: Vec<String>,
    deadline: Instant,
    limits: HttpLimits,
    runtime: Handle,
    server_id: String,
    /// First egress denial seen during the execution
    denial: OnceLock<String>,
}

impl ExecutionHttpClient {
    pub fn new(
        guard: Arc<EgressGuard>,
        allowed_hosts: Vec<String>,
        deadline: Instant,
        limits: HttpLimits,
        runtime: Handle,
        server_id: String,
    ) -> Self {
        Self {
            guard,
            allowed_hosts,
            deadline,
            limits,
            runtime,
            server_id,
            denial: OnceLock::new(),
        }
    }

    /// Denial recorded during the execution, if any.
    ///
    /// Tool code may catch the in-sandbox `PermissionError`; the engine still
    /// fails the execution when this is set.
    pub fn denial(&self) -> Option<&str> {
        self.denial.get().map(String::as_str)
    }

    fn record_denial(&self, message: &str) {
        let _ = self.denial.set(message.to_string());
    }

    /// Perform one request on behalf of the execution.
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse, BridgeError> {
        let validated = match self.guard.check(&request.url, &self.allowed_hosts).await {
            Ok(validated) => validated,
            Err(err) => {
                let message = err.to_string();
                tracing::warn!(server_id = %self.server_id, reason = %message, "egress denied");
                self.record_denial(&message);
                return Err(BridgeError::denied(message));
            }
        };

        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(BridgeError::timed_out("execution deadline reached before request"));
        }
        let mut timeout = remaining.min(self.limits.max_request_timeout);
        if let Some(requested) = request.timeout_secs.filter(|t| t.is_finite() && *t > 0.0) {
            timeout = timeout.min(Duration::from_secs_f64(requested));
        }

        let mut builder = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(timeout);
        if validated.is_domain {
            builder = builder.resolve(
                &validated.host,
                SocketAddr::new(validated.resolved_ip, validated.port),
            );
        }
        let client = builder
            .build()
            .map_err(|e| BridgeError::failed(format!("failed to build HTTP client: {e}")))?;

        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| BridgeError::failed(format!("invalid HTTP method '{}'", request.method)))?;
        let mut outbound = client.request(method, validated.url.clone());
        for (name, value) in &request.headers {
            outbound = outbound.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            outbound = outbound.body(body);
        }

        tracing::debug!(
            server_id = %self.server_id,
            host = %validated.host,
            ip = %validated.resolved_ip,
            "outbound request"
        );

        match tokio::time::timeout(timeout, self.read_response(outbound)).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::timed_out(format!(
                "request to {} timed out",
                validated.host
            ))),
        }
    }

    async fn read_response(&self, outbound: reqwest::RequestBuilder) -> Result<HttpResponse, BridgeError> {
        let mut response = outbound.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }

        let max = self.limits.max_response_bytes;
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(map_reqwest_error)? {
            if body.len() + chunk.len() > max {
                return Err(BridgeError::failed(format!(
                    "response body exceeds {max} bytes"
                )));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(HttpResponse {
            status,
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> BridgeError {
    if err.is_timeout() {
        BridgeError::timed_out(err.to_string())
    } else {
        BridgeError::failed(err.without_url().to_string())
    }
}

impl HostBridge for ExecutionHttpClient {
    /// Called from the interpreter's blocking worker thread.
    fn http_request(&self, request: HttpRequest) -> Result<HttpResponse, BridgeError> {
        self.runtime.block_on(self.send(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::egress::StaticResolver;
    use python_sandbox::bridge::BridgeErrorKind;

    fn client(allowed: &[&str], deadline: Instant) -> ExecutionHttpClient {
        let guard = EgressGuard::new(Arc::new(StaticResolver::new()), Duration::from_millis(200));
        ExecutionHttpClient::new(
            Arc::new(guard),
            allowed.iter().map(|s| s.to_string()).collect(),
            deadline,
            HttpLimits {
                max_response_bytes: 1024,
                max_request_timeout: Duration::from_secs(5),
            },
            Handle::current(),
            "s1".to_string(),
        )
    }

    fn get(url: &str) -> HttpRequest {
        HttpRequest {
            method: "GET".to_string(),
            url: url.to_string(),
            headers: BTreeMap::new(),
            body: None,
            timeout_secs: None,
        }
    }

    #[tokio::test]
    async fn test_empty_allowlist_records_denial() {
        let client = client(&[], Instant::now() + Duration::from_secs(5));
        let err = client.send(get("https://api.example.com/")).await.unwrap_err();
        assert_eq!(err.kind, BridgeErrorKind::Denied);
        assert!(client.denial().unwrap().contains("api.example.com"));
    }

    #[tokio::test]
    async fn test_first_denial_is_kept() {
        let client = client(&["*.example.com"], Instant::now() + Duration::from_secs(5));
        let _ = client.send(get("http://127.0.0.1/")).await;
        let _ = client.send(get("http://10.0.0.1/")).await;
        assert!(client.denial().unwrap().contains("127.0.0.1"));
    }

    #[tokio::test]
    async fn test_expired_deadline_times_out_without_connecting() {
        let client = client(&["93.184.216.34"], Instant::now());
        let err = client.send(get("http://93.184.216.34/")).await.unwrap_err();
        assert_eq!(err.kind, BridgeErrorKind::TimedOut);
        assert!(client.denial().is_none());
    }
}
