//! HTTP exposure server (v0.1)
//!
//! Routes `POST {base}/task/{id}` and `POST {base}/event/{id}` onto the
//! runtime surface. Task bodies are JSON (`{input}`) or multipart with a
//! required `__manifest` JSON field; remaining file parts are drained.
//! Status mapping: 401 bad token, 403 outside the tunnel allow-list,
//! 404 unknown id or path, 405 wrong method (axum's method router),
//! 400 malformed bodies, 499 client abort, 500 runtime errors.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{FromRequest, Multipart, Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::WeftError;
use crate::surface::Runtime;

use super::{
    server_allow_list, AllowList, EventRequestBody, TaskRequestBody, DEFAULT_BASE_PATH,
    DEFAULT_TOKEN_HEADER, MANIFEST_FIELD,
};

/// Client closed the request stream mid-body
const CLIENT_CLOSED_REQUEST: u16 = 499;

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct ExposureConfig {
    pub base_path: String,
    /// Shared secret; `None` disables auth
    pub token: Option<String>,
    pub header_name: String,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            base_path: DEFAULT_BASE_PATH.into(),
            token: None,
            header_name: DEFAULT_TOKEN_HEADER.into(),
        }
    }
}

impl ExposureConfig {
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_path(mut self, path: impl Into<String>) -> Self {
        self.base_path = path.into();
        self
    }
}

struct ExposureState {
    runtime: Runtime,
    config: ExposureConfig,
    allow: Option<AllowList>,
}

// ============================================================================
// ROUTER
// ============================================================================

/// Build the exposure router over a runtime surface
pub fn router(runtime: Runtime, config: ExposureConfig) -> Router {
    let allow = server_allow_list(runtime.store());
    let base = config.base_path.trim_end_matches('/').to_string();
    let state = Arc::new(ExposureState {
        runtime,
        config,
        allow,
    });

    Router::new()
        .route(&format!("{base}/task/{{id}}"), post(handle_task))
        .route(&format!("{base}/event/{{id}}"), post(handle_event))
        .fallback(handle_unknown_path)
        .with_state(state)
}

/// Bind and serve; returns the bound address and the server task
pub async fn serve(
    runtime: Runtime,
    config: ExposureConfig,
    addr: SocketAddr,
) -> Result<(SocketAddr, JoinHandle<()>), WeftError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| WeftError::User(e.into()))?;
    let local = listener
        .local_addr()
        .map_err(|e| WeftError::User(e.into()))?;
    let app = router(runtime, config);
    let handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!(error = %err, "exposure server stopped");
        }
    });
    debug!(addr = %local, "exposure server listening");
    Ok((local, handle))
}

// ============================================================================
// HANDLERS
// ============================================================================

async fn handle_unknown_path() -> Response {
    error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "unknown path")
}

async fn handle_task(
    State(state): State<Arc<ExposureState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    request: Request,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    if let Some(allow) = &state.allow {
        if !allow.allows_task(&id) {
            return error_response(
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                "task is not in the tunnel allow-list",
            );
        }
    }
    let unit_id = match id.parse::<crate::types::UnitId>() {
        Ok(unit_id) => unit_id,
        Err(_) => return error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "unknown task id"),
    };
    if state.runtime.store().task(&unit_id).is_err() {
        return error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "unknown task id");
    }

    let input = match read_task_input(request).await {
        Ok(input) => input,
        Err(resp) => return resp,
    };

    match state.runtime.run_task(id.as_str(), input).await {
        Ok(result) => (StatusCode::OK, Json(json!({"ok": true, "result": result})))
            .into_response(),
        Err(err) => runtime_error_response(&err),
    }
}

async fn handle_event(
    State(state): State<Arc<ExposureState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    if let Some(allow) = &state.allow {
        if !allow.allows_event(&id) {
            return error_response(
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                "event is not in the tunnel allow-list",
            );
        }
    }

    let payload = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice::<EventRequestBody>(&body) {
            Ok(body) => body.payload.unwrap_or(Value::Null),
            Err(err) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "INVALID_JSON",
                    &format!("body is not valid JSON: {err}"),
                )
            }
        }
    };
    match state.runtime.emit_event(id.as_str(), payload).await {
        Ok(()) => (StatusCode::OK, Json(json!({"ok": true, "result": null}))).into_response(),
        Err(err) => runtime_error_response(&err),
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn authorize(state: &ExposureState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.config.token else {
        return Ok(());
    };
    let presented = headers
        .get(state.config.header_name.as_str())
        .and_then(|v| v.to_str().ok());
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(error_response(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "missing or invalid token",
        ))
    }
}

/// Parse the task input from a JSON or multipart request
async fn read_task_input(request: Request) -> Result<Value, Response> {
    let is_multipart = request
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    if is_multipart {
        return read_multipart_input(request).await;
    }

    let bytes = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => {
            // The client went away mid-stream.
            return Err(error_response(
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
                    .unwrap_or(StatusCode::BAD_REQUEST),
                "CLIENT_ABORT",
                "request stream error",
            ));
        }
    };

    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    match serde_json::from_slice::<TaskRequestBody>(&bytes) {
        Ok(body) => Ok(body.input.unwrap_or(Value::Null)),
        Err(err) => Err(error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_JSON",
            &format!("body is not valid JSON: {err}"),
        )),
    }
}

/// Multipart contract: a required `__manifest` JSON field; file parts are
/// drained so the request stream never backs up.
async fn read_multipart_input(request: Request) -> Result<Value, Response> {
    let mut multipart = match Multipart::from_request(request, &()).await {
        Ok(multipart) => multipart,
        Err(_) => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_MULTIPART",
                "malformed multipart body",
            ))
        }
    };

    let mut manifest: Option<Value> = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() == Some(MANIFEST_FIELD) {
                    let text = field.text().await.map_err(|_| {
                        error_response(
                            StatusCode::BAD_REQUEST,
                            "INVALID_MULTIPART",
                            "unreadable manifest field",
                        )
                    })?;
                    let value: Value = serde_json::from_str(&text).map_err(|_| {
                        error_response(
                            StatusCode::BAD_REQUEST,
                            "INVALID_MULTIPART",
                            "manifest is not valid JSON",
                        )
                    })?;
                    manifest = Some(value);
                } else {
                    // Drain ignored file parts.
                    let mut field = field;
                    while let Ok(Some(_)) = field.chunk().await {}
                }
            }
            Ok(None) => break,
            Err(_) => {
                return Err(error_response(
                    StatusCode::BAD_REQUEST,
                    "INVALID_MULTIPART",
                    "malformed multipart body",
                ))
            }
        }
    }

    match manifest {
        Some(manifest) => Ok(manifest.get("input").cloned().unwrap_or(Value::Null)),
        None => Err(error_response(
            StatusCode::BAD_REQUEST,
            "MISSING_MANIFEST",
            "multipart body has no __manifest field",
        )),
    }
}

fn runtime_error_response(err: &WeftError) -> Response {
    let status = match err {
        WeftError::UnknownUnit { .. } => StatusCode::NOT_FOUND,
        WeftError::AccessViolation { .. } => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.kind(), &err.to_string())
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({"ok": false, "error": {"code": code, "message": message}})),
    )
        .into_response()
}
