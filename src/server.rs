//! HTTP server.
//!
//! A thin JSON layer over [`ChatService`]. Every route except `/health`
//! requires `Authorization: Bearer <session token>`; the token is resolved
//! to a user id by [`SessionKeys`] and the handler acts on that user only.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `POST`   | `/chat` | Answer a message from the user's knowledge base |
//! | `GET`    | `/history` | The user's conversation, oldest first |
//! | `DELETE` | `/history` | Clear the conversation and seed the greeting |
//! | `POST`   | `/ingest/url` | Add a web page to the knowledge base |
//! | `POST`   | `/ingest/document` | Add an uploaded document (base64) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401),
//! `provider_unavailable` / `retrieval_unavailable` / `generation_failed`
//! (503), `persistence` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted for browser clients.

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use kbchat_core::{ChatMessage, Error, UserId};

use crate::config::Config;
use crate::extract;
use crate::identity::SessionKeys;
use crate::ingest::{IngestOutcome, IngestSource};
use crate::service::ChatService;

/// Largest accepted request body (base64 document uploads).
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ChatService>,
    pub keys: SessionKeys,
}

/// Build the router. Exposed so tests can serve it on an ephemeral port.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/chat", post(handle_chat))
        .route("/history", get(handle_get_history).delete(handle_clear_history))
        .route("/ingest/url", post(handle_ingest_url))
        .route("/ingest/document", post(handle_ingest_document))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind`. Runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let keys = SessionKeys::from_env(&config.server.session_secret_env)?;
    let service = Arc::new(ChatService::from_config(config).await?);
    let app = router(AppState { service, keys });

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "server listening");
    println!("kbchat server listening on http://{}", config.server.bind);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    retryable: bool,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    retryable: bool,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                retryable: self.retryable,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let retryable = err.is_retryable();
        let status = match &err {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            _ if retryable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if retryable {
            tracing::warn!(code = err.code(), error = %err, "request failed, retryable");
        } else if status.is_server_error() {
            tracing::error!(code = err.code(), error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
            retryable,
        }
    }
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<UserId, AppError> {
    let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    Ok(state.keys.resolve_header(header)?)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    timestamp: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

// ============ POST /chat ============

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
}

#[derive(Serialize)]
struct ChatResponse {
    response: String,
    standalone_question: String,
    grounded: bool,
    sources: Vec<String>,
}

async fn handle_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let user = authenticate(&state, &headers)?;
    let answer = state.service.respond(&user, &req.message).await?;
    Ok(Json(ChatResponse {
        grounded: answer.grounding.is_grounded(),
        sources: answer.grounding.sources().to_vec(),
        response: answer.text,
        standalone_question: answer.standalone_question,
    }))
}

// ============ /history ============

#[derive(Serialize)]
struct HistoryResponse {
    messages: Vec<ChatMessage>,
}

async fn handle_get_history(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<HistoryResponse>, AppError> {
    let user = authenticate(&state, &headers)?;
    let messages = state.service.get_history(&user).await?;
    Ok(Json(HistoryResponse { messages }))
}

async fn handle_clear_history(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<HistoryResponse>, AppError> {
    let user = authenticate(&state, &headers)?;
    let messages = state.service.clear(&user).await?;
    Ok(Json(HistoryResponse { messages }))
}

// ============ /ingest ============

#[derive(Serialize)]
struct IngestResponse {
    success: bool,
    chunks: usize,
}

impl From<IngestOutcome> for IngestResponse {
    fn from(outcome: IngestOutcome) -> Self {
        IngestResponse {
            success: outcome.is_ingested(),
            chunks: outcome.chunks(),
        }
    }
}

#[derive(Deserialize)]
struct IngestUrlRequest {
    url: String,
}

async fn handle_ingest_url(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<IngestUrlRequest>,
) -> Result<Json<IngestResponse>, AppError> {
    let user = authenticate(&state, &headers)?;
    let outcome = state
        .service
        .ingest(&user, IngestSource::Url(req.url))
        .await?;
    Ok(Json(outcome.into()))
}

#[derive(Deserialize)]
struct IngestDocumentRequest {
    name: String,
    #[serde(default)]
    content_type: Option<String>,
    content_base64: String,
}

async fn handle_ingest_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<IngestDocumentRequest>,
) -> Result<Json<IngestResponse>, AppError> {
    let user = authenticate(&state, &headers)?;
    let content_type = req
        .content_type
        .as_deref()
        .or_else(|| extract::content_type_for(&req.name))
        .ok_or_else(|| Error::Validation(format!("cannot tell the type of '{}'", req.name)))?
        .to_string();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(req.content_base64.trim())
        .map_err(|e| Error::Validation(format!("content_base64 is not valid base64: {}", e)))?;

    let source = IngestSource::document(&req.name, &content_type, bytes)?;
    let outcome = state.service.ingest(&user, source).await?;
    Ok(Json(outcome.into()))
}
