//! HTTP API for sessions, documents, chat, and settings.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/sessions/` | List sessions |
//! | `POST`   | `/sessions/` | Create a session (`?name=`) |
//! | `PATCH`  | `/sessions/{session_id}` | Rename a session (`?name=`) |
//! | `DELETE` | `/sessions/{session_id}` | Delete a session (cascades) |
//! | `GET`    | `/sessions/{session_id}/messages/{offset}` | Messages with `seqno > offset` |
//! | `POST`   | `/sessions/{session_id}/messages/` | Post a message |
//! | `GET`    | `/sessions/{session_id}/stream` | SSE token stream (`?prompt=`) |
//! | `GET`    | `/sessions/{session_id}/export` | Markdown transcript |
//! | `GET`    | `/sessions/{session_id}/documents/` | List session documents |
//! | `POST`   | `/documents/upload` | Upload a raw file (`?filename=`) |
//! | `DELETE` | `/documents/{doc_id}` | Delete a document |
//! | `POST`   | `/documents/{doc_id}/summarize` | Summarize |
//! | `POST`   | `/documents/compare` | Compare documents |
//! | `POST`   | `/documents/{doc_id}/mindmap` | Mind map |
//! | `POST`   | `/documents/{doc_id}/audio-overview` | Audio overview |
//! | `POST`   | `/process_documents/` | Run the ingestion pipeline |
//! | `GET`    | `/llm` | Current LLM settings |
//! | `POST`   | `/set_llm/` | Update LLM settings (`?model=&temperature=`) |
//! | `GET`    | `/health` | Health check |
//!
//! # Error Contract
//!
//! All error responses use the same JSON shape:
//!
//! ```json
//! { "error": { "code": "not_found", "message": "document not found" } }
//! ```
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser
//! clients.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use base64::Engine;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::actions::ActionPipelines;
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::DocChatError;
use crate::export::render_transcript;
use crate::index::{purge_chunks, DocFilter, VectorIndex};
use crate::ingest;
use crate::llm::Generator;
use crate::models::{LlmSettings, Session, StoredMessage};
use crate::pipeline::{AnswerEvent, AnswerPipeline};
use crate::store::Store;
use crate::tts::Synthesizer;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub index: Arc<RwLock<VectorIndex>>,
    pub embedder: Arc<dyn Embedder>,
    pub pipeline: Arc<AnswerPipeline>,
    pub actions: Arc<ActionPipelines>,
}

impl AppState {
    /// Wire the pipelines from injected capabilities. Used by `serve` with
    /// real HTTP backends and by tests with in-process mocks.
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        index: Arc<RwLock<VectorIndex>>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Self {
        let pipeline = Arc::new(AnswerPipeline::new(
            store.clone(),
            index.clone(),
            embedder.clone(),
            generator,
            config.retrieval.top_k,
            config.llm.max_tokens,
            config.llm.title_model.clone(),
        ));
        let actions = Arc::new(ActionPipelines::new(pipeline.clone(), synthesizer));
        Self {
            config,
            store,
            index,
            embedder,
            pipeline,
            actions,
        }
    }
}

/// Build the router with all routes and permissive CORS.
pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/sessions/", get(list_sessions).post(create_session))
        .route("/sessions/{session_id}", patch(rename_session))
        .route("/sessions/{session_id}", delete(delete_session))
        .route("/sessions/{session_id}/messages/{offset}", get(get_messages))
        .route("/sessions/{session_id}/messages/", post(post_message))
        .route("/sessions/{session_id}/stream", get(stream_answer))
        .route("/sessions/{session_id}/export", get(export_session))
        .route("/sessions/{session_id}/documents/", get(list_documents))
        .route("/documents/upload", post(upload_document))
        .route("/documents/{doc_id}", delete(delete_document))
        .route("/documents/{doc_id}/summarize", post(summarize_document))
        .route("/documents/compare", post(compare_documents))
        .route("/documents/{doc_id}/mindmap", post(mindmap_document))
        .route("/documents/{doc_id}/audio-overview", post(audio_overview))
        .route("/process_documents/", post(process_documents))
        .route("/llm", get(get_llm_settings))
        .route("/set_llm/", post(set_llm_settings))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server. Runs until the process is terminated.
pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let bind_addr = state.config.server.bind.clone();
    let app = build_app(state);

    info!("docchat API listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
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
}

/// Internal error type that converts into an HTTP response.
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

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        internal(err.to_string())
    }
}

impl From<DocChatError> for AppError {
    fn from(err: DocChatError) -> Self {
        let (status, code) = match &err {
            DocChatError::Ingestion(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ingestion_error"),
            DocChatError::RetrievalUnavailable => (StatusCode::BAD_REQUEST, "retrieval_unavailable"),
            DocChatError::Generation(_) => (StatusCode::INTERNAL_SERVER_ERROR, "generation_error"),
            DocChatError::Config(_) => (StatusCode::BAD_REQUEST, "config_error"),
            DocChatError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
        };
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

// ============ Health ============

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

// ============ Sessions ============

async fn list_sessions(State(state): State<AppState>) -> Result<Json<Vec<Session>>, AppError> {
    Ok(Json(state.store.list_sessions().await?))
}

#[derive(Deserialize)]
struct CreateSessionParams {
    #[serde(default = "default_session_name")]
    name: String,
}

fn default_session_name() -> String {
    "New Chat".to_string()
}

async fn create_session(
    State(state): State<AppState>,
    Query(params): Query<CreateSessionParams>,
) -> Result<Json<Session>, AppError> {
    Ok(Json(state.store.create_session(&params.name).await?))
}

#[derive(Deserialize)]
struct RenameSessionParams {
    name: String,
}

async fn rename_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(params): Query<RenameSessionParams>,
) -> Result<Json<Session>, AppError> {
    state
        .store
        .rename_session(&session_id, &params.name)
        .await?
        .map(Json)
        .ok_or_else(|| not_found("session not found"))
}

#[derive(Serialize)]
struct DeletedResponse {
    message: String,
}

async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<DeletedResponse>, AppError> {
    let owned = state
        .store
        .delete_session(&session_id)
        .await?
        .ok_or_else(|| not_found("session not found"))?;

    let mut all_chunk_ids = Vec::new();
    for (chunk_ids, filename) in owned {
        all_chunk_ids.extend(chunk_ids);
        remove_uploaded_file(&state.config, &filename);
    }
    if !all_chunk_ids.is_empty() {
        purge_chunks(&state.index, &state.config.storage.index_dir, &all_chunk_ids).await?;
    }

    Ok(Json(DeletedResponse {
        message: "deleted".to_string(),
    }))
}

// ============ Messages ============

async fn get_messages(
    State(state): State<AppState>,
    Path((session_id, offset)): Path<(String, i64)>,
) -> Result<Json<Vec<StoredMessage>>, AppError> {
    Ok(Json(state.store.messages_since(&session_id, offset).await?))
}

#[derive(Deserialize)]
struct PostMessageBody {
    username: String,
    message: String,
    /// The caller will open a streaming channel instead; suppress the
    /// background blocking generation.
    #[serde(default)]
    stream: bool,
}

async fn post_message(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<PostMessageBody>,
) -> Result<Json<StoredMessage>, AppError> {
    let msg = state
        .store
        .append_message(&session_id, &body.username, &body.message, &[])
        .await?;

    // Auto-title on the first user message.
    if msg.seqno == 0 && body.username != "assistant" {
        let pipeline = state.pipeline.clone();
        let sid = session_id.clone();
        let text = body.message.clone();
        tokio::spawn(async move {
            pipeline.auto_title(&sid, &text).await;
        });
    }

    if !body.stream {
        let filter = session_filter(&state, &session_id).await?;
        let pipeline = state.pipeline.clone();
        let prompt = body.message.clone();
        tokio::spawn(async move {
            pipeline.respond(&session_id, &prompt, &filter).await;
        });
    }

    Ok(Json(msg))
}

/// Scope retrieval to the documents attached to the session; an empty
/// document set means no restriction, matching the pre-session behavior.
async fn session_filter(state: &AppState, session_id: &str) -> Result<DocFilter, AppError> {
    let docs = state.store.list_documents(session_id).await?;
    if docs.is_empty() {
        Ok(DocFilter::all())
    } else {
        Ok(DocFilter::documents(docs.into_iter().map(|d| d.doc_id)))
    }
}

// ============ Streaming ============

#[derive(Deserialize)]
struct StreamParams {
    prompt: String,
}

async fn stream_answer(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, AppError> {
    let filter = session_filter(&state, &session_id).await?;
    let rx = state.pipeline.stream(session_id, params.prompt, filter);

    let stream = rx.map(|event| {
        let data = match event {
            AnswerEvent::Token(token) => serde_json::json!({ "token": token }),
            AnswerEvent::Done(sources) => serde_json::json!({ "done": true, "sources": sources }),
        };
        Ok(Event::default().data(data.to_string()))
    });

    Ok(Sse::new(stream))
}

// ============ Export ============

async fn export_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, AppError> {
    let messages = state.store.messages_since(&session_id, -1).await?;
    let content = render_transcript(&messages);
    Ok((
        [
            (header::CONTENT_TYPE, "text/markdown"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=chat_export.md",
            ),
        ],
        content,
    )
        .into_response())
}

// ============ Documents ============

async fn list_documents(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<crate::models::Document>>, AppError> {
    Ok(Json(state.store.list_documents(&session_id).await?))
}

#[derive(Deserialize)]
struct UploadParams {
    filename: String,
}

#[derive(Serialize)]
struct UploadResponse {
    message: String,
    filename: String,
}

async fn upload_document(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<Json<UploadResponse>, AppError> {
    let filename = params.filename.trim();
    if filename.is_empty()
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains("..")
    {
        return Err(bad_request("invalid filename"));
    }

    let files_dir = &state.config.storage.files_dir;
    std::fs::create_dir_all(files_dir).map_err(|e| internal(e.to_string()))?;
    std::fs::write(files_dir.join(filename), &body).map_err(|e| internal(e.to_string()))?;

    Ok(Json(UploadResponse {
        message: "uploaded".to_string(),
        filename: filename.to_string(),
    }))
}

async fn delete_document(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<Json<DeletedResponse>, AppError> {
    let doc = state
        .store
        .delete_document(&doc_id)
        .await?
        .ok_or_else(|| not_found("document not found"))?;

    purge_chunks(&state.index, &state.config.storage.index_dir, &doc.chunk_ids).await?;
    remove_uploaded_file(&state.config, &doc.filename);

    Ok(Json(DeletedResponse {
        message: "deleted".to_string(),
    }))
}

fn remove_uploaded_file(config: &Config, filename: &str) {
    let path = config.storage.files_dir.join(filename);
    if path.exists() {
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(filename, error = %e, "failed to remove uploaded file");
        }
    }
}

// ============ Document actions ============

#[derive(Serialize)]
struct SummaryResponse {
    summary: String,
}

async fn summarize_document(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<Json<SummaryResponse>, AppError> {
    let summary = state.actions.summarize(&doc_id).await?;
    Ok(Json(SummaryResponse { summary }))
}

#[derive(Deserialize)]
struct CompareBody {
    doc_ids: Vec<String>,
}

#[derive(Serialize)]
struct ComparisonResponse {
    comparison: String,
}

async fn compare_documents(
    State(state): State<AppState>,
    Json(body): Json<CompareBody>,
) -> Result<Json<ComparisonResponse>, AppError> {
    if body.doc_ids.len() < 2 {
        return Err(bad_request("compare requires at least two doc_ids"));
    }
    let comparison = state.actions.compare(&body.doc_ids).await?;
    Ok(Json(ComparisonResponse { comparison }))
}

#[derive(Serialize)]
struct MindmapResponse {
    mindmap: String,
}

async fn mindmap_document(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<Json<MindmapResponse>, AppError> {
    let mindmap = state.actions.mindmap(&doc_id).await?;
    Ok(Json(MindmapResponse { mindmap }))
}

#[derive(Serialize)]
struct AudioOverviewResponse {
    audio_base64: String,
    script: String,
}

async fn audio_overview(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<Json<AudioOverviewResponse>, AppError> {
    let (script, audio) = state.actions.audio_overview(&doc_id).await?;
    Ok(Json(AudioOverviewResponse {
        audio_base64: base64::engine::general_purpose::STANDARD.encode(audio),
        script,
    }))
}

// ============ Ingestion ============

#[derive(Deserialize, Default)]
struct ProcessDocumentsBody {
    #[serde(default)]
    session_id: String,
}

#[derive(Serialize)]
struct ProcessDocumentsResponse {
    message: String,
    documents_indexed: u64,
    chunks_indexed: u64,
    failures: Vec<ProcessFailure>,
}

#[derive(Serialize)]
struct ProcessFailure {
    filename: String,
    error: String,
}

async fn process_documents(
    State(state): State<AppState>,
    body: Option<Json<ProcessDocumentsBody>>,
) -> Result<Json<ProcessDocumentsResponse>, AppError> {
    let session_id = body.map(|Json(b)| b.session_id).unwrap_or_default();
    let outcome = ingest::process_documents(
        &state.config,
        &state.store,
        &state.index,
        state.embedder.as_ref(),
        &session_id,
    )
    .await?;

    Ok(Json(ProcessDocumentsResponse {
        message: "success".to_string(),
        documents_indexed: outcome.documents_indexed,
        chunks_indexed: outcome.chunks_indexed,
        failures: outcome
            .failures
            .into_iter()
            .map(|(filename, error)| ProcessFailure { filename, error })
            .collect(),
    }))
}

// ============ LLM settings ============

async fn get_llm_settings(State(state): State<AppState>) -> Result<Json<LlmSettings>, AppError> {
    Ok(Json(state.store.get_llm_settings().await?))
}

#[derive(Deserialize)]
struct SetLlmParams {
    model: String,
    temperature: f64,
}

#[derive(Serialize)]
struct SetLlmResponse {
    message: String,
    settings: LlmSettings,
}

async fn set_llm_settings(
    State(state): State<AppState>,
    Query(params): Query<SetLlmParams>,
) -> Result<Json<SetLlmResponse>, AppError> {
    let settings = state
        .store
        .set_llm_settings(&params.model, params.temperature)
        .await?;
    Ok(Json(SetLlmResponse {
        message: "success".to_string(),
        settings,
    }))
}
