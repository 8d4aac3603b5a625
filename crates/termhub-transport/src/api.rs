//! HTTP routes over the session registry.

use std::{collections::HashMap, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use termhub_core::SessionId;
use termhub_session::{
    ExpectResult, ScriptStep, Session, SessionDescriptor, SessionError, TemplateError,
    builtin_templates, find_template,
};
use thiserror::Error;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{context::AppContext, websocket::ws_handler};

/// Error returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        let message = e.to_string();
        match e {
            SessionError::NotFound(_) => Self::NotFound("Session not found".to_string()),
            SessionError::Capacity { .. } => Self::Unavailable(message),
            SessionError::AutomationDisabled(_) => {
                Self::BadRequest("Session does not have automation enabled".to_string())
            }
            SessionError::Automation(
                termhub_session::AutomationError::InvalidPattern(_)
                | termhub_session::AutomationError::NoPatterns,
            ) => Self::BadRequest(message),
            SessionError::Connection { .. } | SessionError::Automation(_) => Self::Internal(message),
        }
    }
}

impl From<TemplateError> for ApiError {
    fn from(e: TemplateError) -> Self {
        match e {
            TemplateError::UnknownTemplate(_) => Self::NotFound("Template not found".to_string()),
            TemplateError::MissingVariable(_) | TemplateError::Unterminated(_) => {
                Self::BadRequest(e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn parse_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::NotFound("Session not found".to_string()))
}

async fn session(ctx: &AppContext, raw: &str) -> Result<std::sync::Arc<Session>, ApiError> {
    Ok(ctx.registry().require(parse_id(raw)?).await?)
}

fn timeout_from(secs: Option<f64>) -> Result<Option<Duration>, ApiError> {
    secs.map(|s| {
        Duration::try_from_secs_f64(s)
            .map_err(|_| ApiError::BadRequest(format!("Invalid timeout: {s}")))
    })
    .transpose()
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub container_id: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub use_automation: bool,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
    pub container_id: String,
    pub created: bool,
}

#[derive(Debug, Deserialize)]
pub struct InputRequest {
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Deserialize)]
pub struct OutputQuery {
    pub lines: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct OutputResponse {
    pub session_id: SessionId,
    pub output: Vec<String>,
    pub lines: usize,
}

#[derive(Debug, Deserialize)]
pub struct ScriptRequest {
    pub session_id: String,
    pub commands: Vec<String>,
    #[serde(default)]
    pub expect_prompts: Vec<String>,
    /// Seconds per command.
    pub timeout: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct ScriptResponse {
    pub session_id: SessionId,
    pub results: Vec<ScriptStep>,
}

#[derive(Debug, Deserialize)]
pub struct ExpectRequest {
    pub session_id: String,
    pub patterns: Vec<String>,
    #[serde(default)]
    pub regex: bool,
    /// Seconds.
    pub timeout: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct TemplateRequest {
    pub session_id: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub timeout: Option<f64>,
}

async fn health(State(ctx): State<AppContext>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "sessions": ctx.registry().count().await,
        "max_sessions": ctx.registry().settings().max_sessions,
        "connected_sessions": ctx.hub().session_count(),
    }))
}

async fn list_sessions(State(ctx): State<AppContext>) -> Json<Vec<SessionDescriptor>> {
    Json(ctx.registry().list().await)
}

async fn create_session(
    State(ctx): State<AppContext>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<CreateSessionResponse> {
    let command = req.command.as_deref().filter(|c| !c.trim().is_empty());
    let session = ctx
        .registry()
        .create(&req.container_id, command, req.use_automation)
        .await?;
    Ok(Json(CreateSessionResponse {
        session_id: session.id(),
        container_id: req.container_id,
        created: true,
    }))
}

async fn get_session(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<SessionDescriptor> {
    Ok(Json(session(&ctx, &id).await?.descriptor()))
}

async fn close_session(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let session_id = parse_id(&id)?;
    if !ctx.registry().close(session_id).await {
        return Err(ApiError::NotFound("Session not found".to_string()));
    }
    Ok(Json(json!({ "success": true, "session_id": session_id })))
}

async fn send_input(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Json(req): Json<InputRequest>,
) -> ApiResult<Value> {
    session(&ctx, &id).await?.send_input(req.data.as_bytes()).await;
    Ok(Json(json!({ "success": true })))
}

async fn resize_session(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> ApiResult<Value> {
    session(&ctx, &id).await?.resize(req.rows, req.cols).await;
    Ok(Json(json!({ "success": true })))
}

async fn session_output(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Query(query): Query<OutputQuery>,
) -> ApiResult<OutputResponse> {
    let session = session(&ctx, &id).await?;
    let output = session.history().tail_lines(query.lines);
    Ok(Json(OutputResponse {
        session_id: session.id(),
        lines: output.len(),
        output,
    }))
}

async fn execute_script(
    State(ctx): State<AppContext>,
    Json(req): Json<ScriptRequest>,
) -> ApiResult<ScriptResponse> {
    let session = session(&ctx, &req.session_id).await?;
    let results = session
        .run_script(&req.commands, &req.expect_prompts, timeout_from(req.timeout)?)
        .await?;
    Ok(Json(ScriptResponse {
        session_id: session.id(),
        results,
    }))
}

async fn expect_pattern(
    State(ctx): State<AppContext>,
    Json(req): Json<ExpectRequest>,
) -> ApiResult<ExpectResult> {
    let session = session(&ctx, &req.session_id).await?;
    let result = session
        .expect_any(&req.patterns, req.regex, timeout_from(req.timeout)?)
        .await?;
    Ok(Json(result))
}

async fn list_templates() -> Json<Value> {
    Json(json!(builtin_templates()))
}

async fn execute_template(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
    Json(req): Json<TemplateRequest>,
) -> ApiResult<ScriptResponse> {
    let commands = find_template(&name)?.render(&req.variables)?;
    let session = session(&ctx, &req.session_id).await?;
    let results = session
        .run_script(&commands, &[], timeout_from(req.timeout)?)
        .await?;
    Ok(Json(ScriptResponse {
        session_id: session.id(),
        results,
    }))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(origin = %o, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Build the application router.
pub fn router(ctx: AppContext) -> Router {
    let cors = cors_layer(&ctx.config().server.allowed_origins);
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/{id}", get(get_session).delete(close_session))
        .route("/api/sessions/{id}/input", post(send_input))
        .route("/api/sessions/{id}/resize", post(resize_session))
        .route("/api/sessions/{id}/output", get(session_output))
        .route("/api/automation/execute", post(execute_script))
        .route("/api/automation/expect", post(expect_pattern))
        .route("/api/automation/templates", get(list_templates))
        .route(
            "/api/automation/templates/{name}/execute",
            post(execute_template),
        )
        .route("/ws/{session_id}", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{body::Body, http::Request};
    use termhub_core::{Config, runtime::MemoryRuntime};
    use tower::ServiceExt;

    use super::*;

    fn app(max_sessions: usize) -> (Router, AppContext, Arc<MemoryRuntime>) {
        let runtime = Arc::new(MemoryRuntime::new());
        let mut config = Config::default();
        config.sessions.max_sessions = max_sessions;
        let ctx = AppContext::new(config, Arc::clone(&runtime) as Arc<dyn termhub_core::ContainerRuntime>);
        (router(ctx.clone()), ctx, runtime)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _, _) = app(5);
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let (app, ctx, runtime) = app(5);

        let (status, created) = call(
            &app,
            "POST",
            "/api/sessions",
            Some(json!({"container_id": "web-1", "command": "/bin/sh"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["created"], true);
        let id = created["session_id"].as_str().unwrap().to_string();

        let (status, list) = call(&app, "GET", "/api/sessions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, details) = call(&app, "GET", &format!("/api/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(details["container_id"], "web-1");
        assert_eq!(details["active"], true);

        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/sessions/{id}/input"),
            Some(json!({"data": "ls\n"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(runtime.last_handle().unwrap().written_string(), "ls\n");

        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/sessions/{id}/resize"),
            Some(json!({"rows": 40, "cols": 100})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(runtime.last_handle().unwrap().resizes(), vec![(40, 100)]);

        let (status, _) = call(&app, "DELETE", &format!("/api/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&app, "DELETE", &format!("/api/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Session not found");

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_capacity_maps_to_503() {
        let (app, ctx, _) = app(1);
        let body = json!({"container_id": "a"});

        let (status, _) = call(&app, "POST", "/api/sessions", Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&app, "POST", "/api/sessions", Some(body)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("Maximum sessions"));

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_connection_failure_maps_to_500() {
        let (app, _, runtime) = app(5);
        runtime.reject("stopped");

        let (status, _) = call(
            &app,
            "POST",
            "/api/sessions",
            Some(json!({"container_id": "stopped"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_ids() {
        let (app, _, _) = app(5);
        let (status, _) = call(&app, "GET", "/api/sessions/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let uri = format!("/api/sessions/{}", SessionId::new_v4());
        let (status, _) = call(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_output_history() {
        let (app, ctx, runtime) = app(5);
        let session = ctx.registry().create("c1", None, false).await.unwrap();
        runtime.last_handle().unwrap().emit(b"one\ntwo\nthree\n");

        tokio::time::timeout(Duration::from_secs(2), async {
            while session.history().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let uri = format!("/api/sessions/{}/output?lines=2", session.id());
        let (status, body) = call(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["output"], json!(["two", "three"]));
        assert_eq!(body["lines"], 2);

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_automation_requires_engine() {
        let (app, ctx, _) = app(5);
        let session = ctx.registry().create("c1", None, false).await.unwrap();

        let (status, body) = call(
            &app,
            "POST",
            "/api/automation/expect",
            Some(json!({"session_id": session.id(), "patterns": ["$"], "timeout": 0.1})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Session does not have automation enabled");

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_expect_timeout_is_unmatched() {
        let (app, ctx, _) = app(5);
        let session = ctx.registry().create("c1", None, true).await.unwrap();

        let (status, body) = call(
            &app,
            "POST",
            "/api/automation/expect",
            Some(json!({"session_id": session.id(), "patterns": ["never"], "timeout": 0.1})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"matched": false, "pattern_index": -1, "pattern": null}));

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_script() {
        let (app, ctx, runtime) = app(5);
        let session = ctx.registry().create("c1", None, true).await.unwrap();
        let handle = runtime.last_handle().unwrap();

        let responder = tokio::spawn(async move {
            while !handle.written_string().contains("pwd\n") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            handle.emit(b"pwd\r\n/workspace\r\n$ ");
        });

        let (status, body) = call(
            &app,
            "POST",
            "/api/automation/execute",
            Some(json!({"session_id": session.id(), "commands": ["pwd"], "timeout": 2.0})),
        )
        .await;
        responder.await.unwrap();

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"][0]["output"], "pwd\r\n/workspace\r\n");
        assert_eq!(body["results"][0]["success"], true);

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_templates() {
        let (app, ctx, _) = app(5);
        let (status, body) = call(&app, "GET", "/api/automation/templates", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 3);
        assert_eq!(body[0]["name"], "git-clone");

        let (status, _) = call(
            &app,
            "POST",
            "/api/automation/templates/nope/execute",
            Some(json!({"session_id": SessionId::new_v4()})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let session = ctx.registry().create("c1", None, true).await.unwrap();
        let (status, body) = call(
            &app,
            "POST",
            "/api/automation/templates/docker-build/execute",
            Some(json!({"session_id": session.id(), "variables": {"image_name": "api"}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing template variable: tag");

        ctx.shutdown().await;
    }

    #[test]
    fn test_cors_layer_variants() {
        let _ = cors_layer(&[]);
        let _ = cors_layer(&["*".to_string()]);
        let _ = cors_layer(&["http://localhost:3000".to_string(), "bad\norigin".to_string()]);
    }
}
