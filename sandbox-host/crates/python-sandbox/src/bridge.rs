//! Host bridge for network access from tool code
//!
//! Tool code never opens sockets itself. `http_request()` and friends are
//! native functions that hand the request to a [`HostBridge`] supplied by the
//! host, which decides whether the destination is permitted and performs the
//! call on the tool's behalf.

use std::collections::BTreeMap;

/// An outbound HTTP request issued by tool code
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    /// Per-call timeout requested by the tool, in seconds
    pub timeout_secs: Option<f64>,
}

/// Response handed back to tool code
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Why the host refused or failed a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeErrorKind {
    /// Egress policy refused the destination (raised as `PermissionError`)
    Denied,
    /// The call ran past its deadline (raised as `TimeoutError`)
    TimedOut,
    /// Transport failure (raised as `ConnectionError`)
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeError {
    pub kind: BridgeErrorKind,
    pub message: String,
}

impl BridgeError {
    pub fn denied(message: impl Into<String>) -> Self {
        Self {
            kind: BridgeErrorKind::Denied,
            message: message.into(),
        }
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self {
            kind: BridgeErrorKind::TimedOut,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            kind: BridgeErrorKind::Failed,
            message: message.into(),
        }
    }
}

/// Host-side implementation of network access for one execution.
///
/// Called synchronously from the interpreter thread.
pub trait HostBridge: Send + Sync {
    fn http_request(&self, request: HttpRequest) -> Result<HttpResponse, BridgeError>;
}

/// Bridge that refuses every request. Used when a server has no egress.
pub struct DenyAllBridge;

impl HostBridge for DenyAllBridge {
    fn http_request(&self, request: HttpRequest) -> Result<HttpResponse, BridgeError> {
        Err(BridgeError::denied(format!(
            "network access is disabled (requested {})",
            request.url
        )))
    }
}
