use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Router,
    extract::{DefaultBodyLimit, Multipart, Path, Request, State, multipart::MultipartError},
    http::{HeaderValue, StatusCode},
    middleware::{Next, from_fn},
    response::{
        IntoResponse, Json, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use crate::config::DEFAULT_MAX_UPLOAD_BYTES;
use crate::documents::{DocumentExtractor, guess_content_type};
use crate::models::DocumentRecord;
use crate::streaming::{PipelineEvent, TURN_FAILED, TurnReply};
use crate::workflow::ConsultationPipeline;

const UPLOAD_PREVIEW_CHARS: usize = 180;
const CORRELATION_HEADER: &str = "x-correlation-id";

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;
type ApiError = (StatusCode, Json<Value>);

fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found_error(message: &str, id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": message,
            "session_id": id
        })),
    )
}

fn multipart_error(e: MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        warn!(error = %e, "Upload exceeds the body limit");
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({ "error": "上传文件过大" })),
        );
    }
    warn!(error = %e, "Malformed multipart body");
    bad_request_error("无法解析上传内容")
}

fn internal_error(message: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message })),
    )
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ConsultationPipeline>,
    pub extractor: Arc<dyn DocumentExtractor>,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(pipeline: Arc<ConsultationPipeline>, extractor: Arc<dyn DocumentExtractor>) -> Self {
        Self {
            pipeline,
            extractor,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn with_upload_limit(mut self, max_upload_bytes: usize) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self
    }
}

#[derive(Debug, Deserialize)]
struct ConsultRequest {
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    user_input: String,
}

#[derive(Debug, Serialize)]
struct UploadedDocument {
    doc_id: String,
    filename: String,
    content_type: String,
    char_count: usize,
    preview: String,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    session_id: String,
    documents: Vec<UploadedDocument>,
    total_documents: usize,
}

pub fn build_router(app_state: AppState) -> Router {
    let upload_limit = DefaultBodyLimit::max(app_state.max_upload_bytes);

    Router::new()
        .route("/api/health", get(health_check))
        .route(
            "/api/documents/upload",
            post(upload_documents).layer(upload_limit),
        )
        .route("/api/consult/stream", post(consult_stream))
        .route("/api/consult", post(consult))
        .route(
            "/api/sessions/{session_id}",
            get(get_session).delete(reset_session),
        )
        .layer(from_fn(correlation_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Tag every request with a correlation id and run it inside a span carrying it
async fn correlation_id_middleware(mut request: Request, next: Next) -> Response {
    let correlation_id = Uuid::new_v4().to_string();
    let header = HeaderValue::from_str(&correlation_id).ok();

    if let Some(value) = &header {
        request.headers_mut().insert(CORRELATION_HEADER, value.clone());
    }

    let span = tracing::info_span!("http_request", correlation_id = %correlation_id);
    let mut response = next.run(request).instrument(span).await;

    if let Some(value) = header {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

async fn health_check() -> Json<Value> {
    Json(json!({ "ok": true }))
}

fn validate_turn(request: &ConsultRequest) -> Result<(String, String), ApiError> {
    let session_id = request.session_id.trim();
    if session_id.is_empty() {
        return Err(bad_request_error("session_id 不能为空"));
    }
    let user_input = request.user_input.trim();
    if user_input.is_empty() {
        return Err(bad_request_error("user_input 不能为空"));
    }
    Ok((session_id.to_string(), user_input.to_string()))
}

async fn consult_stream(
    State(state): State<AppState>,
    Json(request): Json<ConsultRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (session_id, user_input) = validate_turn(&request)?;
    info!(session_id = %session_id, "Streaming consultation turn");

    let events = state.pipeline.stream_turn(&session_id, &user_input);
    let sse = Sse::new(sse_frames(events)).keep_alive(KeepAlive::default());

    Ok(([("x-accel-buffering", "no")], sse))
}

fn sse_frames(
    events: mpsc::Receiver<PipelineEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(events, |mut rx| async move {
        let event = rx.recv().await?;
        Some((Ok(sse_frame(&event)), rx))
    })
}

fn sse_frame(event: &PipelineEvent) -> Event {
    if let PipelineEvent::Done = event {
        return Event::default().data("[DONE]");
    }
    match serde_json::to_string(event) {
        Ok(data) => Event::default().data(data),
        Err(e) => {
            error!(error = %e, "Failed to encode pipeline event");
            Event::default().data(json!({ "type": "error", "message": TURN_FAILED }).to_string())
        }
    }
}

async fn consult(
    State(state): State<AppState>,
    Json(request): Json<ConsultRequest>,
) -> ApiResult<TurnReply> {
    let (session_id, user_input) = validate_turn(&request)?;
    info!(session_id = %session_id, "Consultation turn");

    state
        .pipeline
        .run_turn(&session_id, &user_input)
        .await
        .map(Json)
        .map_err(|e| internal_error(&e.0))
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<TurnReply> {
    match state.pipeline.snapshot(&session_id).await {
        Ok(Some(snapshot)) => Ok(Json(snapshot)),
        Ok(None) => Err(not_found_error("Session not found", &session_id)),
        Err(e) => {
            error!(session_id = %session_id, error = %e, "Failed to load session");
            Err(internal_error("Failed to load session"))
        }
    }
}

async fn reset_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Value> {
    state.pipeline.reset(&session_id).await.map_err(|e| {
        error!(session_id = %session_id, error = %e, "Failed to reset session");
        internal_error("Failed to reset session")
    })?;

    Ok(Json(json!({ "session_id": session_id, "reset": true })))
}

struct UploadedFile {
    filename: String,
    content_type: String,
    bytes: Vec<u8>,
}

async fn upload_documents(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<UploadResponse> {
    let mut session_id = String::new();
    let mut files = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "session_id" => {
                session_id = field
                    .text()
                    .await
                    .map_err(|_| bad_request_error("无法读取 session_id"))?
                    .trim()
                    .to_string();
            }
            "files" => {
                let filename = field
                    .file_name()
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .unwrap_or("unnamed")
                    .to_string();
                let content_type = field
                    .content_type()
                    .map(str::to_string)
                    .unwrap_or_else(|| guess_content_type(&filename).to_string());
                let bytes = field.bytes().await.map_err(multipart_error)?;
                files.push(UploadedFile {
                    filename,
                    content_type,
                    bytes: bytes.to_vec(),
                });
            }
            _ => {}
        }
    }

    if session_id.is_empty() {
        return Err(bad_request_error("session_id 不能为空"));
    }
    if files.is_empty() {
        return Err(bad_request_error("files 不能为空"));
    }

    let mut records = Vec::with_capacity(files.len());
    for file in files {
        let extracted_text = state
            .extractor
            .extract(&file.filename, file.bytes)
            .await
            .map_err(|e| {
                error!(filename = %file.filename, error = %e, "Document extraction failed");
                internal_error("文档解析失败，请稍后重试")
            })?;

        records.push(DocumentRecord {
            doc_id: Uuid::new_v4().to_string(),
            filename: file.filename,
            content_type: file.content_type,
            extracted_text: extracted_text.trim().to_string(),
        });
    }

    let documents = records
        .iter()
        .map(|record| UploadedDocument {
            doc_id: record.doc_id.clone(),
            filename: record.filename.clone(),
            content_type: record.content_type.clone(),
            char_count: record.extracted_text.chars().count(),
            preview: record
                .extracted_text
                .chars()
                .take(UPLOAD_PREVIEW_CHARS)
                .collect(),
        })
        .collect();

    let total_documents = state
        .pipeline
        .attach_documents(&session_id, records)
        .await
        .map_err(|e| {
            error!(session_id = %session_id, error = %e, "Failed to store documents");
            internal_error("Failed to store documents")
        })?;

    Ok(Json(UploadResponse {
        session_id,
        documents,
        total_documents,
    }))
}
