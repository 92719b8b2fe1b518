//! HTTP API for the tool sandbox
//!
//! - Every route requires the shared secret header
//! - Registration, execution and deregistration of tools
//! - Health and installer report endpoints for operators

use anyhow::{anyhow, Context};
use axum::{
    extract::{rejection::JsonRejection, Path, Request, State},
    http::{HeaderName, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use sandbox_host::cli::{resolve_settings, CliArgs};
use sandbox_host::egress::SystemResolver;
use sandbox_host::tool_registry::RegistrationRequest;
use sandbox_host::{ErrorBody, ErrorKind, SandboxError, SandboxHost};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

// -----------------------------------------------------------------------------
// State
// -----------------------------------------------------------------------------

pub struct ApiState {
    host: Arc<SandboxHost>,
    secret_header: HeaderName,
    secret_digest: [u8; 32],
}

impl ApiState {
    pub fn new(host: Arc<SandboxHost>, shared_secret: &str, secret_header: &str) -> anyhow::Result<Self> {
        if shared_secret.is_empty() {
            return Err(anyhow!("shared secret must not be empty"));
        }
        let secret_header = HeaderName::try_from(secret_header)
            .with_context(|| format!("invalid secret header name '{secret_header}'"))?;
        Ok(Self {
            host,
            secret_header,
            secret_digest: digest(shared_secret.as_bytes()),
        })
    }
}

fn digest(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// Compare digests so timing does not depend on the secret's length or prefix
fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

// -----------------------------------------------------------------------------
// Errors
// -----------------------------------------------------------------------------

/// Error response: `{"error": {"kind", "message"}}`
pub struct ApiError(SandboxError);

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(SandboxError::Validation(rejection.body_text()))
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = self.0.to_body();
        let status = match body.kind {
            ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            kind => status_for(kind),
        };
        (status, Json(json!({ "error": body }))).into_response()
    }
}

// -----------------------------------------------------------------------------
// Router
// -----------------------------------------------------------------------------

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/register", post(register_handler))
        .route("/execute", post(execute_handler))
        .route("/deregister", post(deregister_handler))
        .route("/health", get(health_handler))
        .route("/servers/:server_id/tools", get(list_tools_handler))
        .route("/packages", get(packages_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_secret))
        .with_state(state)
}

async fn require_secret(State(state): State<Arc<ApiState>>, request: Request, next: Next) -> Response {
    let provided = request
        .headers()
        .get(&state.secret_header)
        .map(|v| digest(v.as_bytes()));
    match provided {
        Some(provided) if constant_time_eq(&provided, &state.secret_digest) => next.run(request).await,
        _ => {
            tracing::warn!(path = %request.uri().path(), "rejected request without valid shared secret");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": {"kind": "unauthorized", "message": "missing or invalid shared secret"}})),
            )
                .into_response()
        }
    }
}

// -----------------------------------------------------------------------------
// Handlers
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub server_id: String,
    pub tools_registered: usize,
}

async fn register_handler(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<RegistrationRequest>, JsonRejection>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let Json(request) = body?;
    let server_id = request.server_id.trim().to_string();
    let tools_registered = state.host.register(request).await.map_err(|e| {
        tracing::warn!(server_id = %server_id, error = %e, "registration rejected");
        e
    })?;
    Ok(Json(RegisterResponse {
        server_id,
        tools_registered,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub server_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
}

async fn execute_handler(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    let result = state
        .host
        .execute(&request.server_id, &request.tool_name, request.arguments)
        .await;
    let status = result
        .error
        .as_ref()
        .map_or(StatusCode::OK, |e: &ErrorBody| status_for(e.kind));
    Ok((status, Json(result)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct DeregisterRequest {
    pub server_id: String,
}

async fn deregister_handler(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<DeregisterRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = body?;
    let removed = state.host.deregister(&request.server_id).await;
    Ok(Json(json!({ "server_id": request.server_id, "removed": removed })))
}

async fn health_handler(State(state): State<Arc<ApiState>>) -> Json<Value> {
    Json(json!(state.host.health().await))
}

async fn list_tools_handler(
    State(state): State<Arc<ApiState>>,
    Path(server_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let tools = state.host.list_tools(&server_id).await?;
    Ok(Json(json!({ "server_id": server_id, "tools": tools })))
}

async fn packages_handler(State(state): State<Arc<ApiState>>) -> Json<Value> {
    Json(json!({ "report": state.host.last_install_report() }))
}

// -----------------------------------------------------------------------------
// Entry point
// -----------------------------------------------------------------------------

/// Serve the API on `listener` until `shutdown` resolves
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<ApiState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")
}

pub async fn run_with_args(args: CliArgs) -> anyhow::Result<()> {
    let settings = resolve_settings(&args).await.context("failed to load settings")?;
    let shared_secret = settings
        .shared_secret
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("a shared secret is required (--shared-secret or SANDBOX_SHARED_SECRET)"))?;

    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", settings.host, settings.port))?;
    let secret_header = settings.secret_header.clone();

    let host = Arc::new(SandboxHost::new(settings, Arc::new(SystemResolver))?);
    let state = Arc::new(ApiState::new(host.clone(), &shared_secret, &secret_header)?);
    host.start().await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "sandbox API listening");

    let served = serve(listener, state, shutdown_signal()).await;
    host.stop().await;
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_host::egress::StaticResolver;
    use sandbox_host::SandboxSettings;

    const SECRET: &str = "test-secret";

    struct TestServer {
        base: String,
        client: reqwest::Client,
        _dir: tempfile::TempDir,
    }

    impl TestServer {
        async fn start() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let settings = SandboxSettings {
                packages_dir: dir.path().to_path_buf(),
                package_index_url: "http://127.0.0.1:9".to_string(),
                vulnerability_feed_url: "http://127.0.0.1:9".to_string(),
                ..Default::default()
            };
            let host = Arc::new(SandboxHost::new(settings, Arc::new(StaticResolver::new())).unwrap());
            let state = Arc::new(ApiState::new(host, SECRET, "X-Sandbox-Secret").unwrap());

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(serve(listener, state, std::future::pending()));

            Self {
                base: format!("http://{addr}"),
                client: reqwest::Client::new(),
                _dir: dir,
            }
        }

        async fn post(&self, path: &str, body: Value) -> (u16, Value) {
            let response = self
                .client
                .post(format!("{}{}", self.base, path))
                .header("X-Sandbox-Secret", SECRET)
                .json(&body)
                .send()
                .await
                .unwrap();
            (response.status().as_u16(), response.json().await.unwrap())
        }

        async fn get(&self, path: &str) -> (u16, Value) {
            let response = self
                .client
                .get(format!("{}{}", self.base, path))
                .header("X-Sandbox-Secret", SECRET)
                .send()
                .await
                .unwrap();
            (response.status().as_u16(), response.json().await.unwrap())
        }
    }

    fn echo_tool() -> Value {
        json!({
            "name": "echo",
            "description": "Echo the input",
            "input_schema": {
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            },
            "source_code": "def echo(text):\n    print('got', text)\n    return {'echo': text}\n"
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_secret_required() {
        let server = TestServer::start().await;
        let missing = server.client.get(format!("{}/health", server.base)).send().await.unwrap();
        assert_eq!(missing.status().as_u16(), 401);

        let wrong = server
            .client
            .get(format!("{}/health", server.base))
            .header("X-Sandbox-Secret", "nope")
            .send()
            .await
            .unwrap();
        assert_eq!(wrong.status().as_u16(), 401);

        let (status, body) = server.get("/health").await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_register_execute_deregister() {
        let server = TestServer::start().await;

        let (status, body) = server
            .post("/register", json!({"server_id": "s1", "tools": [echo_tool()]}))
            .await;
        assert_eq!(status, 200);
        assert_eq!(body, json!({"server_id": "s1", "tools_registered": 1}));

        let (status, body) = server.get("/servers/s1/tools").await;
        assert_eq!(status, 200);
        assert_eq!(body["tools"][0]["name"], "echo");

        let (status, body) = server
            .post("/execute", json!({"server_id": "s1", "tool_name": "echo", "arguments": {"text": "hi"}}))
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["success"], true);
        assert_eq!(body["result"], json!({"echo": "hi"}));
        assert_eq!(body["stdout"], "got hi\n");

        let (status, body) = server
            .post("/execute", json!({"server_id": "s1", "tool_name": "echo", "arguments": {}}))
            .await;
        assert_eq!(status, 400);
        assert_eq!(body["error"]["kind"], "validation_error");

        let (_, body) = server.post("/deregister", json!({"server_id": "s1"})).await;
        assert_eq!(body["removed"], true);

        let (status, body) = server
            .post("/execute", json!({"server_id": "s1", "tool_name": "echo", "arguments": {"text": "hi"}}))
            .await;
        assert_eq!(status, 404);
        assert_eq!(body["error"]["kind"], "not_found");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalid_registration_is_atomic() {
        let server = TestServer::start().await;
        let bad = json!({
            "name": "sneaky",
            "source_code": "def sneaky():\n    return ().__class__.__bases__\n"
        });

        let (status, body) = server
            .post("/register", json!({"server_id": "s1", "tools": [echo_tool(), bad]}))
            .await;
        assert_eq!(status, 400);
        assert_eq!(body["error"]["kind"], "validation_error");
        assert!(body["error"]["message"].as_str().unwrap().contains("sneaky"));

        let (_, health) = server.get("/health").await;
        assert_eq!(health["tools"], 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_egress_without_allowlist_is_ssrf() {
        let server = TestServer::start().await;
        let tool = json!({
            "name": "echo",
            "source_code": "def echo(text='x'):\n    return http_get('https://example.com/')\n"
        });
        server
            .post("/register", json!({"server_id": "S1", "tools": [tool], "allowed_hosts": []}))
            .await;

        let (status, body) = server
            .post("/execute", json!({"server_id": "S1", "tool_name": "echo"}))
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["kind"], "ssrf_error");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_malformed_body_and_packages() {
        let server = TestServer::start().await;
        let response = server
            .client
            .post(format!("{}/register", server.base))
            .header("X-Sandbox-Secret", SECRET)
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"]["kind"], "validation_error");

        // Host was never started, so no provisioning has run
        let (status, body) = server.get("/packages").await;
        assert_eq!(status, 200);
        assert_eq!(body["report"], Value::Null);
    }

    #[tokio::test]
    async fn test_refuses_to_start_without_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{"port": 0}"#).await.unwrap();
        let args = CliArgs {
            config: Some(path),
            ..Default::default()
        };
        let err = run_with_args(args).await.unwrap_err();
        assert!(err.to_string().contains("shared secret"));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::ValidationError), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::Timeout), StatusCode::OK);
        assert_eq!(status_for(ErrorKind::SsrfError), StatusCode::OK);
    }
}
