use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc as StdArc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};

use crate::analysis::{analysis_request, chat_request, AnalysisGateway, ReplyTarget};
use crate::config::ServerConfig;
use crate::constants::{
    generate_video_file_name, STREAM_PROTOCOL_HEADER, STREAM_PROTOCOL_VERSION, VIDEO_FORM_FIELD,
};
use crate::db::{self, NewVideo};
use crate::error::{AnalysisError, ApiError};
use crate::models::{ChatHistory, ChatMessage, GatewayResult, Role, SessionList};
use crate::poll::PollPolicy;
use crate::prompts::ANALYZE_REQUEST_TEXT;
use crate::provider::gemini::GeminiProvider;
use crate::provider::GenerativeProvider;
use crate::stream_protocol::{self, StreamEvent};
use crate::video_path::{content_type_for, resolve_video_path};

// State shared by all handlers
pub struct AppState {
    pub pool: SqlitePool,
    pub gateway: AnalysisGateway,
    /// Canonical storage directory; its name is the allow-listed path segment
    pub uploads_dir: PathBuf,
}

impl AppState {
    /// Create the uploads directory if needed and wire the gateway
    pub fn new(
        pool: SqlitePool,
        provider: StdArc<dyn GenerativeProvider>,
        uploads_dir: &FsPath,
        poll_policy: PollPolicy,
    ) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(uploads_dir)?;
        let uploads_dir = uploads_dir.canonicalize()?;
        Ok(Self {
            gateway: AnalysisGateway::new(provider, pool.clone(), poll_policy),
            pool,
            uploads_dir,
        })
    }

    fn stored_video(&self, raw: &str) -> Result<PathBuf, ApiError> {
        resolve_video_path(&self.uploads_dir, raw).map_err(|e| {
            warn!("Rejected video path '{}': {}", raw, e);
            ApiError::Forbidden(e.to_string())
        })
    }
}

pub fn build_router(state: StdArc<AppState>, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/upload-video", post(upload_handler))
        .route("/analyze-video", post(analyze_handler))
        .route("/chat", post(chat_handler))
        .route("/video/{*path}", get(video_handler))
        .route("/api/sessions", get(list_sessions_handler))
        .route(
            "/api/sessions/{id}",
            get(session_history_handler).delete(delete_session_handler),
        )
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .with_state(state)
}

/// Run the HTTP server (for serve command)
pub fn serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let api_key = config.api_key()?;

    println!("Starting articulator server");
    println!("Uploads directory: {}", config.uploads_dir.display());
    println!("Database: {}", config.database_path.display());
    println!("Model: {}", config.provider.model);
    println!("Listening on: http://[::]:{} (IPv4 + IPv6)", config.port);
    println!("Endpoints:");
    println!("  POST /upload-video  - Store a recording (multipart field 'video')");
    println!("  POST /analyze-video  - Stream feedback for a stored recording");
    println!("  POST /chat  - Stream a reply in a session");
    println!("  GET /video/{{*path}}  - Serve a stored recording");
    println!("  GET /api/sessions  - List chat sessions");
    println!("  GET /api/sessions/{{id}}  - Session history");
    println!("  DELETE /api/sessions/{{id}}  - Delete a session");
    println!("  GET /health  - Health check");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let pool = db::open_database(&config.database_path)
            .await
            .map_err(|e| format!("Failed to open database: {}", e))?;
        let provider: StdArc<dyn GenerativeProvider> = StdArc::new(GeminiProvider::from_config(
            &config.provider,
            api_key,
        ));
        let app_state = StdArc::new(
            AppState::new(
                pool,
                provider,
                &config.uploads_dir,
                config.polling.policy(),
            )
            .map_err(|e| {
                format!(
                    "Failed to prepare uploads directory '{}': {}",
                    config.uploads_dir.display(),
                    e
                )
            })?,
        );

        let app = build_router(app_state, config.max_upload_bytes);

        let listener = tokio::net::TcpListener::bind(format!("[::]:{}", config.port))
            .await
            .map_err(|e| format!("Failed to bind to port {}: {}", config.port, e))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| format!("Server error: {}", e))?;

        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

async fn health_handler() -> &'static str {
    "OK"
}

/// Wrap protocol events into a streaming response
fn stream_response(events: ReceiverStream<StreamEvent>) -> Response {
    let body = Body::from_stream(events.map(|event| event.encode()));
    (
        StatusCode::OK,
        [
            ("content-type", stream_protocol::CONTENT_TYPE.to_string()),
            ("cache-control", "no-cache".to_string()),
            (STREAM_PROTOCOL_HEADER, STREAM_PROTOCOL_VERSION.to_string()),
        ],
        body,
    )
        .into_response()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    success: bool,
    file_path: String,
    file_name: String,
    mime_type: String,
    chat_session_id: String,
}

async fn upload_handler(
    State(state): State<StdArc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut video = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Invalid multipart body: {}", e)))?
    {
        if field.name() != Some(VIDEO_FORM_FIELD) {
            continue;
        }
        let client_name = field.file_name().unwrap_or_default().to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to read video field: {}", e)))?;
        video = Some((client_name, data));
    }

    let (client_name, data) =
        video.ok_or_else(|| ApiError::BadRequest("No video file provided".to_string()))?;
    if data.is_empty() {
        return Err(ApiError::BadRequest("Video file is empty".to_string()));
    }

    let (extension, mime_type) = if client_name.to_ascii_lowercase().ends_with(".webm") {
        ("webm", "video/webm")
    } else {
        ("mp4", "video/mp4")
    };
    let file_name = generate_video_file_name(extension);
    let path = state.uploads_dir.join(&file_name);
    tokio::fs::write(&path, &data)
        .await
        .map_err(|e| ApiError::internal("Failed to upload video", e))?;
    let file_path = path.to_string_lossy().to_string();
    info!("Stored {} ({} bytes)", file_path, data.len());

    let new_video = NewVideo {
        file_name: file_name.clone(),
        file_path: file_path.clone(),
        mime_type: mime_type.to_string(),
    };
    match db::create_session_with_video(&state.pool, &new_video).await {
        Ok(session) => Ok(Json(UploadResponse {
            success: true,
            file_path,
            file_name,
            mime_type: mime_type.to_string(),
            chat_session_id: session.id,
        })),
        Err(e) => {
            // No session references the file, so it must not stay behind
            if let Err(rm) = tokio::fs::remove_file(&path).await {
                warn!("Failed to remove orphaned upload {}: {}", file_path, rm);
            }
            Err(ApiError::internal("Failed to create chat session", e))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest {
    file_path: Option<String>,
    mime_type: Option<String>,
    chat_session_id: Option<String>,
}

async fn ensure_session(pool: &SqlitePool, session_id: &str) -> Result<(), ApiError> {
    match db::session_exists(pool, session_id).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(ApiError::NotFound("Chat session not found".to_string())),
        Err(e) => Err(ApiError::internal("Failed to look up chat session", e)),
    }
}

async fn analyze_handler(
    State(state): State<StdArc<AppState>>,
    Json(body): Json<AnalyzeRequest>,
) -> Result<Response, ApiError> {
    const FAILURE: &str = "Failed to analyze video";

    let raw_path = body
        .file_path
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ApiError::from_analysis(FAILURE, AnalysisError::MissingFilePath))?;
    if let Some(session_id) = &body.chat_session_id {
        ensure_session(&state.pool, session_id).await?;
    }
    let path = state.stored_video(raw_path)?;

    let file = state
        .gateway
        .prepare_file(Some(&path), body.mime_type.as_deref())
        .await
        .map_err(|e| ApiError::from_analysis(FAILURE, e))?;

    // A stored reply is always preceded by the request it answers
    let target = match body.chat_session_id {
        Some(session_id) => {
            let request =
                db::insert_message(&state.pool, &session_id, Role::User, ANALYZE_REQUEST_TEXT)
                    .await
                    .map_err(|e| ApiError::internal("Failed to save message", e))?;
            Some(ReplyTarget {
                session_id,
                user_message_id: Some(request.id),
            })
        }
        None => None,
    };
    let events = state
        .gateway
        .open_stream(analysis_request(&file), target)
        .await
        .map_err(|e| ApiError::from_analysis(FAILURE, e))?;
    Ok(stream_response(events))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    #[serde(default)]
    messages: Vec<ChatMessage>,
    chat_session_id: Option<String>,
    file_path: Option<String>,
    mime_type: Option<String>,
}

/// Validate a chat body, returning it with the session id
fn parse_chat_request(body: serde_json::Value) -> Result<(ChatRequest, String), ApiError> {
    let request: ChatRequest = serde_json::from_value(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid messages format: {}", e)))?;
    match request.messages.last() {
        Some(last) if last.role == Role::User => {}
        _ => {
            return Err(ApiError::BadRequest(
                "Messages must be a non-empty list ending with a user message".to_string(),
            ))
        }
    }
    let session_id = request
        .chat_session_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("Chat session ID is required".to_string()))?;
    Ok((request, session_id))
}

async fn chat_handler(
    State(state): State<StdArc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    const FAILURE: &str = "Failed to process chat request";

    let (request, session_id) = parse_chat_request(body)?;
    ensure_session(&state.pool, &session_id).await?;
    let path = match request.file_path.as_deref().filter(|p| !p.trim().is_empty()) {
        Some(raw) => Some(state.stored_video(raw)?),
        None => None,
    };

    let file = match path {
        Some(path) => Some(
            state
                .gateway
                .prepare_file(Some(&path), request.mime_type.as_deref())
                .await
                .map_err(|e| ApiError::from_analysis(FAILURE, e))?,
        ),
        None => None,
    };

    // The user turn is stored before the model is called
    let user_message_id = match request.messages.last() {
        Some(latest) => Some(
            db::insert_message(&state.pool, &session_id, Role::User, &latest.content)
                .await
                .map_err(|e| ApiError::internal("Failed to save message", e))?
                .id,
        ),
        None => None,
    };
    let target = ReplyTarget {
        session_id,
        user_message_id,
    };
    let events = state
        .gateway
        .open_stream(chat_request(&request.messages, file.as_ref()), Some(target))
        .await
        .map_err(|e| ApiError::from_analysis(FAILURE, e))?;
    Ok(stream_response(events))
}

async fn video_handler(
    State(state): State<StdArc<AppState>>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let file_path = state.stored_video(&path)?;
    let not_found = || ApiError::NotFound("Video not found".to_string());
    let file = tokio::fs::File::open(&file_path).await.map_err(|_| not_found())?;
    let metadata = file.metadata().await.map_err(|_| not_found())?;
    if !metadata.is_file() {
        return Err(not_found());
    }

    Ok((
        StatusCode::OK,
        [
            ("content-type", content_type_for(&file_path).to_string()),
            ("content-length", metadata.len().to_string()),
            (
                "cache-control",
                "public, max-age=31536000, immutable".to_string(),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

async fn list_sessions_handler(State(state): State<StdArc<AppState>>) -> Response {
    match db::list_sessions(&state.pool).await {
        Ok(chat_sessions) => Json(GatewayResult::ok(SessionList { chat_sessions })).into_response(),
        Err(e) => {
            error!("Failed to fetch chat sessions: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(GatewayResult::<SessionList>::err("Failed to fetch chat sessions")),
            )
                .into_response()
        }
    }
}

async fn session_history_handler(
    State(state): State<StdArc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match db::get_chat_history(&state.pool, &id).await {
        Ok(Some(history)) => Json(GatewayResult::ok(history)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(GatewayResult::<ChatHistory>::err("Chat session not found")),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to fetch chat history for {}: {}", id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(GatewayResult::<ChatHistory>::err("Failed to fetch chat history")),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeletedSession {
    deleted_id: String,
}

async fn delete_session_handler(
    State(state): State<StdArc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match db::delete_session(&state.pool, &id).await {
        Ok(Some(session)) => {
            if let Some(video) = session.video {
                match resolve_video_path(&state.uploads_dir, &video.file_path) {
                    Ok(path) => {
                        if let Err(e) = tokio::fs::remove_file(&path).await {
                            warn!("Failed to remove {}: {}", path.display(), e);
                        }
                    }
                    Err(e) => warn!("Not removing {}: {}", video.file_path, e),
                }
            }
            info!("Deleted chat session {}", id);
            Json(GatewayResult::ok(DeletedSession { deleted_id: id })).into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(GatewayResult::<DeletedSession>::err("Chat session not found")),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to delete chat session {}: {}", id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(GatewayResult::<DeletedSession>::err("Failed to delete chat session")),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_body_must_end_with_user_turn() {
        let err = parse_chat_request(json!({
            "messages": [{"role": "user", "content": "hi"}, {"role": "assistant", "content": "yo"}],
            "chatSessionId": "s1"
        }))
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = parse_chat_request(json!({"messages": [], "chatSessionId": "s1"})).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn malformed_messages_are_rejected_before_session_id() {
        let err = parse_chat_request(json!({"messages": "hello"})).unwrap_err();
        match err {
            ApiError::BadRequest(msg) => assert!(msg.contains("messages"), "got {}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn session_id_is_required() {
        let err = parse_chat_request(json!({
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap_err();
        match err {
            ApiError::BadRequest(msg) => assert_eq!(msg, "Chat session ID is required"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn valid_chat_body_is_accepted() {
        let (request, session_id) = parse_chat_request(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "chatSessionId": "s1",
            "filePath": "/srv/uploads/video_1.webm"
        }))
        .unwrap();
        assert_eq!(session_id, "s1");
        assert_eq!(request.messages.len(), 1);
        assert!(request.file_path.is_some());
    }
}
