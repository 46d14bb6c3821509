//! HTTP surface.
//!
//! Serves a small HTML page plus a JSON API for the public verification
//! flow and the admin document workflow.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | HTML page |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/api/ask` | Verify a claim, returns an answer record |
//! | `POST` | `/api/export` | Render an answer record as a text attachment |
//! | `GET`  | `/api/documents` | Knowledge-base file names |
//! | `POST` | `/api/admin/login` | Exchange the admin password for a token |
//! | `POST` | `/api/admin/logout` | Revoke the token |
//! | `POST` | `/api/admin/upload` | Store a base64-encoded document in uploads |
//! | `POST` | `/api/admin/rebuild` | Rebuild the index from the corpus |
//! | `GET`  | `/api/admin/documents` | Corpus files and index status |
//!
//! Admin routes other than login require `Authorization: Bearer <token>`.
//! When `CPF_APP_PASSWORD` is set, every `/api` route also requires the
//! `x-app-password` header.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "input_too_long", "message": "The claim is too long: 2400 characters (maximum 2000)" } }
//! ```
//!
//! | Status | Codes |
//! |--------|-------|
//! | 400 | `bad_request`, `input_too_long`, `unsupported_format`, `empty_document`, `bad_export` |
//! | 401 | `unauthorized` |
//! | 403 | `admin_not_configured` |
//! | 409 | `empty_index`, `embedding_model_mismatch` |
//! | 422 | `input_blocked` |
//! | 502 | `embedding_service_error`, `generation_service_error` |
//! | 500 | `persistence_error`, `internal` |

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::answer::{AskRequest, Verifier};
use crate::auth::{check_app_password, AdminSessions};
use crate::config::Config;
use crate::error::VerifyError;
use crate::export;
use crate::ingest::IndexReport;
use crate::loader;
use crate::models::{AnswerRecord, CollectionInfo, DocumentEntry};

/// Request header carrying the app-wide password.
pub const APP_PASSWORD_HEADER: &str = "x-app-password";

const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

const INDEX_HTML: &str = include_str!("ui.html");

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    verifier: Arc<Verifier>,
    sessions: Arc<AdminSessions>,
}

/// Start the HTTP server on `[server].bind`. Runs until the process exits.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let verifier = Arc::new(Verifier::open(config).await?);

    if verifier.config().auth.admin_password().is_none() {
        tracing::warn!("no admin password configured; admin routes are disabled");
    }

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("cpfbot listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(verifier)).await?;
    Ok(())
}

/// Build the application router.
pub fn router(verifier: Arc<Verifier>) -> Router {
    let sessions = Arc::new(AdminSessions::from_config(&verifier.config().auth));
    let state = AppState { verifier, sessions };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/ask", post(handle_ask))
        .route("/export", post(handle_export))
        .route("/documents", get(handle_documents))
        .route("/admin/login", post(handle_login))
        .route("/admin/logout", post(handle_logout))
        .route("/admin/upload", post(handle_upload))
        .route("/admin/rebuild", post(handle_rebuild))
        .route("/admin/documents", get(handle_admin_documents))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_app_password,
        ));

    Router::new()
        .route("/", get(handle_index))
        .route("/health", get(handle_health))
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(state)
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
}

/// Error type that converts into an HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<VerifyError> for AppError {
    fn from(err: VerifyError) -> Self {
        let status = match &err {
            VerifyError::InvalidArgument(_)
            | VerifyError::InputTooLong { .. }
            | VerifyError::UnsupportedFormat(_)
            | VerifyError::EmptyDocument(_)
            | VerifyError::Export(_) => StatusCode::BAD_REQUEST,
            VerifyError::InjectionBlocked { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            VerifyError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            VerifyError::AdminNotConfigured => StatusCode::FORBIDDEN,
            VerifyError::EmptyIndex | VerifyError::EmbeddingModelMismatch { .. } => {
                StatusCode::CONFLICT
            }
            VerifyError::EmbeddingService { .. } | VerifyError::GenerationService { .. } => {
                StatusCode::BAD_GATEWAY
            }
            VerifyError::Persistence(_) | VerifyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(code = err.code(), error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

// ============ Middleware ============

async fn require_app_password(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let entered = request
        .headers()
        .get(APP_PASSWORD_HEADER)
        .and_then(|v| v.to_str().ok());
    check_app_password(&state.verifier.config().auth, entered)?;
    Ok(next.run(request).await)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn require_admin<'a>(state: &AppState, headers: &'a HeaderMap) -> Result<&'a str, AppError> {
    if state.verifier.config().auth.admin_password().is_none() {
        return Err(VerifyError::AdminNotConfigured.into());
    }
    let token = bearer_token(headers)
        .ok_or_else(|| VerifyError::Unauthorized("admin session required".to_string()))?;
    state.sessions.validate(token)?;
    Ok(token)
}

// ============ GET / and /health ============

async fn handle_index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Public routes ============

#[derive(Deserialize)]
struct AskBody {
    claim: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    evidence: Option<String>,
    #[serde(default)]
    summarize: bool,
}

async fn handle_ask(
    State(state): State<AppState>,
    Json(body): Json<AskBody>,
) -> Result<Json<AnswerRecord>, AppError> {
    let request = AskRequest {
        claim: body.claim,
        top_k: body.top_k,
        evidence: body.evidence,
        summarize: body.summarize,
    };
    Ok(Json(state.verifier.ask(&request).await?))
}

#[derive(Deserialize)]
struct ExportBody {
    #[serde(flatten)]
    record: AnswerRecord,
    #[serde(default)]
    filename: Option<String>,
}

async fn handle_export(Json(body): Json<ExportBody>) -> Response {
    let filename = export::sanitize_filename(body.filename.as_deref().unwrap_or_default());
    let text = export::render(&body.record);
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        text,
    )
        .into_response()
}

#[derive(Serialize)]
struct DocumentNames {
    documents: Vec<String>,
}

async fn handle_documents(State(state): State<AppState>) -> Result<Json<DocumentNames>, AppError> {
    let entries = loader::list_documents(state.verifier.config())?;
    Ok(Json(DocumentNames {
        documents: entries.into_iter().map(|e| e.file).collect(),
    }))
}

// ============ Admin routes ============

#[derive(Deserialize)]
struct LoginBody {
    password: String,
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
    expires_in_secs: u64,
}

async fn handle_login(
    State(state): State<AppState>,
    Json(body): Json<LoginBody>,
) -> Result<Json<LoginResponse>, AppError> {
    let auth = &state.verifier.config().auth;
    let token = state.sessions.login(auth, &body.password)?;
    Ok(Json(LoginResponse {
        token,
        expires_in_secs: auth.session_ttl_secs,
    }))
}

#[derive(Serialize)]
struct LogoutResponse {
    revoked: bool,
}

async fn handle_logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<LogoutResponse>, AppError> {
    let token = require_admin(&state, &headers)?;
    Ok(Json(LogoutResponse {
        revoked: state.sessions.logout(token),
    }))
}

#[derive(Deserialize)]
struct UploadBody {
    filename: String,
    content_base64: String,
    /// Also add the file to the index.
    #[serde(default)]
    index: bool,
}

#[derive(Serialize)]
struct UploadResponse {
    file: String,
    bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<IndexReport>,
}

async fn handle_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UploadBody>,
) -> Result<Json<UploadResponse>, AppError> {
    require_admin(&state, &headers)?;

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(body.content_base64.trim())
        .map_err(|e| bad_request(format!("content_base64 is not valid base64: {}", e)))?;

    let config = state.verifier.config();
    let path = loader::save_upload(config, &body.filename, &bytes)?;
    let file = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let report = if body.index {
        let doc = loader::load_file(&path, &config.corpus.uploads, "uploads")?;
        Some(state.verifier.append(&[doc]).await?)
    } else {
        None
    };

    Ok(Json(UploadResponse {
        file,
        bytes: bytes.len(),
        report,
    }))
}

async fn handle_rebuild(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<IndexReport>, AppError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.verifier.rebuild().await?))
}

#[derive(Serialize)]
struct IndexedSource {
    source_id: String,
    chunks: i64,
}

#[derive(Serialize)]
struct AdminDocumentsResponse {
    documents: Vec<DocumentEntry>,
    collection: Option<CollectionInfo>,
    indexed: Vec<IndexedSource>,
}

async fn handle_admin_documents(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AdminDocumentsResponse>, AppError> {
    require_admin(&state, &headers)?;

    let verifier = &state.verifier;
    let documents = loader::list_documents(verifier.config())?;
    let collection = verifier.collection_info().await?;
    let indexed = verifier
        .store()
        .indexed_sources(&verifier.config().index.collection)
        .await?
        .into_iter()
        .map(|(source_id, chunks)| IndexedSource { source_id, chunks })
        .collect();

    Ok(Json(AdminDocumentsResponse {
        documents,
        collection,
        indexed,
    }))
}
