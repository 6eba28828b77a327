//! HTTP control API.
//!
//! The daemon's invocation surface: session lifecycle under `/api/session`,
//! worker lifecycle under `/api/worker`, and a `/healthz` self-check. User
//! identity arrives in the `x-dbo-user` header; resolving it is an upstream
//! concern, a request without it is rejected with 401.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;

use dbo_common::errors::OrchestratorError;
use dbo_common::types::{Credentials, UserId};

use crate::config::RemoteLayout;
use crate::deploy::Deployer;
use crate::monitor::Monitor;
use crate::sessions::SessionRegistry;
use crate::supervisor::Supervisor;
use crate::targets::{TargetCatalog, build_auth};

const USER_HEADER: &str = "x-dbo-user";
/// Command-log entries included in the session view.
const SESSION_VIEW_RECENT: usize = 20;

/// Shared state for HTTP handlers.
pub struct HttpState {
    pub sessions: Arc<SessionRegistry>,
    pub deployer: Arc<Deployer>,
    pub supervisor: Arc<Supervisor>,
    pub monitor: Arc<Monitor>,
    pub targets: Arc<TargetCatalog>,
    pub remote: RemoteLayout,
    /// Daemon version.
    pub version: &'static str,
    /// Daemon start time.
    pub started_at: Instant,
    /// Daemon PID.
    pub pid: u32,
}

/// Create the daemon's HTTP router.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/api/session/connect", post(connect_handler))
        .route("/api/session/execute", post(execute_handler))
        .route("/api/session/disconnect", post(disconnect_handler))
        .route("/api/session", get(session_handler))
        .route("/api/worker/deploy", post(deploy_handler))
        .route("/api/worker/start", post(start_handler))
        .route("/api/worker/stop", post(stop_handler))
        .route("/api/worker/status", get(status_handler))
        .route("/api/worker/health", get(health_handler))
        .route(
            "/api/worker/monitor",
            post(monitor_start_handler).delete(monitor_stop_handler),
        )
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

#[derive(Debug, Deserialize)]
struct ConnectRequest {
    /// Resolve everything from the target catalog.
    project: Option<String>,
    // Explicit credentials, used when no project is given.
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    private_key_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    command: String,
}

#[derive(Debug, Default, Deserialize)]
struct DeployRequest {
    /// Local artifact override; defaults to the project target's artifact.
    artifact: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    /// Port override; defaults to the project target's worker port.
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct MonitorRequest {
    interval_ms: Option<u64>,
    max_retries: Option<u32>,
}

fn require_user(headers: &HeaderMap) -> Result<UserId, Response> {
    match headers.get(USER_HEADER).and_then(|v| v.to_str().ok()) {
        Some(value) if !value.trim().is_empty() => Ok(UserId::new(value.trim())),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": "authentication",
                "message": format!("{} header required", USER_HEADER),
            })),
        )
            .into_response()),
    }
}

fn error_response(err: &OrchestratorError) -> Response {
    let status = match err {
        OrchestratorError::Authentication(_) => StatusCode::UNAUTHORIZED,
        OrchestratorError::Connection(_)
        | OrchestratorError::CommandExecution(_)
        | OrchestratorError::ProcessStartup { .. } => StatusCode::BAD_GATEWAY,
        OrchestratorError::Deployment(_) => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestratorError::PortConflict { .. } => StatusCode::CONFLICT,
        OrchestratorError::NotRunning => StatusCode::NOT_FOUND,
        OrchestratorError::HealthCheckTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        OrchestratorError::UnknownTarget(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::RecoveryExhausted { .. } | OrchestratorError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let mut body = json!({
        "error": err.kind(),
        "message": err.to_string(),
    });
    if let OrchestratorError::ProcessStartup {
        log_tail: Some(tail),
        ..
    } = err
    {
        body["log_tail"] = json!(tail);
    }
    (status, Json(body)).into_response()
}

fn resolve_connect(
    state: &HttpState,
    req: &ConnectRequest,
) -> Result<(Credentials, Option<crate::targets::ResolvedTarget>), OrchestratorError> {
    if let Some(project) = &req.project {
        let target = state.targets.resolve(project)?;
        return Ok((target.credentials.clone(), Some(target)));
    }
    let host = req.host.clone().ok_or_else(|| {
        OrchestratorError::Authentication("host is required without a project".to_string())
    })?;
    let username = req.username.clone().ok_or_else(|| {
        OrchestratorError::Authentication("username is required without a project".to_string())
    })?;
    let auth = build_auth(req.password.as_deref(), req.private_key_path.clone())?;
    Ok((
        Credentials {
            host,
            port: req.port.unwrap_or(22),
            username,
            auth,
        },
        None,
    ))
}

async fn connect_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    Json(req): Json<ConnectRequest>,
) -> Response {
    let user = match require_user(&headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let (credentials, target) = match resolve_connect(&state, &req) {
        Ok(resolved) => resolved,
        Err(e) => return error_response(&e),
    };
    match state.sessions.connect(&user, credentials, target).await {
        Ok(outcome) => Json(json!({
            "connected": true,
            "reused": outcome.reused,
            "cwd": outcome.cwd,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn execute_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    Json(req): Json<ExecuteRequest>,
) -> Response {
    let user = match require_user(&headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    match state.sessions.execute(&user, &req.command).await {
        Ok(out) => Json(json!({
            "stdout": out.stdout,
            "stderr": out.stderr,
            "exit_code": out.exit_code,
            "success": out.success(),
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn disconnect_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
) -> Response {
    let user = match require_user(&headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    state.sessions.disconnect(&user).await;
    Json(json!({ "disconnected": true })).into_response()
}

async fn session_handler(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> Response {
    let user = match require_user(&headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let view = state.sessions.session_view(&user, SESSION_VIEW_RECENT).await;
    Json(view).into_response()
}

async fn deploy_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Option<Json<DeployRequest>>,
) -> Response {
    let user = match require_user(&headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let artifact = match req.artifact {
        Some(path) => path,
        None => match state.sessions.target_of(&user).await {
            Some(target) => target.artifact,
            None => {
                return error_response(&OrchestratorError::Deployment(
                    "no artifact path: connect with a project or pass one explicitly".to_string(),
                ));
            }
        },
    };
    match state
        .deployer
        .deploy(&user, &artifact, &state.remote.worker_path)
        .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn start_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Option<Json<StartRequest>>,
) -> Response {
    let user = match require_user(&headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let port = match req.port {
        Some(port) => port,
        None => match state.sessions.target_of(&user).await {
            Some(target) => target.worker_port,
            None => {
                return error_response(&OrchestratorError::UnknownTarget(
                    "no port given and no project target to take it from".to_string(),
                ));
            }
        },
    };
    match state.supervisor.start(&user, port).await {
        Ok(process) => Json(process).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn stop_handler(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> Response {
    let user = match require_user(&headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    match state.supervisor.stop(&user).await {
        Ok(process) => Json(process).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn status_handler(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> Response {
    let user = match require_user(&headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    match state.supervisor.status(&user).await {
        Ok(process) => Json(process).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn health_handler(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> Response {
    let user = match require_user(&headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    match state.monitor.check_health(&user).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn monitor_start_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Option<Json<MonitorRequest>>,
) -> Response {
    let user = match require_user(&headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let settings = state.monitor.settings();
    let interval = Duration::from_millis(req.interval_ms.unwrap_or(settings.interval_ms));
    let max_retries = req.max_retries.unwrap_or(settings.max_retries);
    match state.monitor.start(&user, interval, max_retries).await {
        Ok(ack) => Json(ack).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn monitor_stop_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
) -> Response {
    let user = match require_user(&headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let stopped = state.monitor.stop(&user).await;
    Json(json!({ "monitoring_stopped": stopped })).into_response()
}

/// Daemon self-health, not to be confused with worker health checks.
async fn healthz_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let sessions = state.sessions.list_sessions().await;
    let connected = sessions.iter().filter(|s| s.connected).count();
    Json(json!({
        "status": "healthy",
        "version": state.version,
        "pid": state.pid,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "sessions": sessions.len(),
        "connected_sessions": connected,
        "active_monitors": state.monitor.active_count().await,
    }))
}
