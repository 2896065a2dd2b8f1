//! # HTTP Server Tests
//!
//! These tests start the real router on a random local port, backed by a
//! temporary SQLite file and a scripted generative provider, and drive it over
//! HTTP with reqwest.
//!
//! ## Running the Tests
//!
//! ```bash
//! cargo test --test server_test
//! ```

use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use articulator::db;
use articulator::models::Role;
use articulator::poll::PollPolicy;
use articulator::prompts::ANALYZE_REQUEST_TEXT;
use articulator::provider::mock::ScriptedProvider;
use articulator::provider::{FileState, FinishReason, Part as ProviderPart};
use articulator::server::{build_router, AppState};
use articulator::stream_protocol::{StreamDecoder, StreamEvent};
use articulator::video_path::playback_url;

const VIDEO_BYTES: &[u8] = b"\x1a\x45\xdf\xa3fake-webm-payload";

struct TestServer {
    base: String,
    pool: sqlx::SqlitePool,
    uploads: PathBuf,
    provider: Arc<ScriptedProvider>,
    client: reqwest::Client,
    _guard: tempfile::TempDir,
}

fn fast_policy(max_attempts: u32) -> PollPolicy {
    PollPolicy {
        interval: Duration::from_millis(1),
        max_attempts,
        deadline: Duration::from_secs(10),
    }
}

async fn start_server_with_policy(provider: ScriptedProvider, policy: PollPolicy) -> TestServer {
    let (pool, guard) = db::create_test_connection_in_temporary_file()
        .await
        .unwrap();
    db::init_database_schema(&pool).await.unwrap();

    let provider = Arc::new(provider);
    let state = Arc::new(
        AppState::new(pool.clone(), provider.clone(), &guard.path().join("uploads"), policy)
            .unwrap(),
    );
    let uploads = state.uploads_dir.clone();
    let app = build_router(state, 10 * 1024 * 1024);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    // Give the server a moment to start accepting
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base: format!("http://{}", addr),
        pool,
        uploads,
        provider,
        client: reqwest::Client::new(),
        _guard: guard,
    }
}

async fn start_server(provider: ScriptedProvider) -> TestServer {
    start_server_with_policy(provider, fast_policy(20)).await
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn upload(&self) -> Value {
        let form = Form::new().part(
            "video",
            Part::bytes(VIDEO_BYTES.to_vec())
                .file_name("recording.webm")
                .mime_str("video/webm")
                .unwrap(),
        );
        let response = self
            .client
            .post(self.url("/upload-video"))
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        response.json().await.unwrap()
    }

    async fn message_count(&self) -> i64 {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }

    fn stored_files(&self) -> usize {
        std::fs::read_dir(&self.uploads).unwrap().count()
    }
}

async fn read_events(response: reqwest::Response) -> Vec<StreamEvent> {
    let body = response.bytes().await.unwrap();
    let mut decoder = StreamDecoder::new();
    let mut events = decoder.push(&body).unwrap();
    events.extend(decoder.finish().unwrap());
    events
}

fn streamed_text(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::TextDelta(delta) => Some(delta.text.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_upload_then_analyze_persists_reply() {
    let server = start_server(
        ScriptedProvider::new()
            .with_file_states([FileState::Processing, FileState::Processing, FileState::Active])
            .with_chunks(&["Clear ", "delivery."]),
    )
    .await;

    let upload = server.upload().await;
    assert_eq!(upload["success"], true);
    assert_eq!(upload["mimeType"], "video/webm");
    let file_path = upload["filePath"].as_str().unwrap().to_string();
    let session_id = upload["chatSessionId"].as_str().unwrap().to_string();
    assert!(upload["fileName"].as_str().unwrap().ends_with(".webm"));
    assert_eq!(std::fs::read(&file_path).unwrap(), VIDEO_BYTES);

    let response = server
        .client
        .post(server.url("/analyze-video"))
        .json(&json!({
            "filePath": file_path,
            "mimeType": "video/webm",
            "chatSessionId": session_id,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    assert_eq!(response.headers()["x-stream-protocol"].to_str().unwrap(), "1");

    let events = read_events(response).await;
    assert!(matches!(events.first(), Some(StreamEvent::Start(_))));
    assert!(matches!(events.last(), Some(StreamEvent::Finish(_))));
    assert_eq!(streamed_text(&events), "Clear delivery.");
    assert_eq!(server.provider.poll_count(), 2);

    let request = &server.provider.requests()[0];
    assert!(matches!(request.turns[0].parts[0], ProviderPart::File { .. }));

    match events.last() {
        Some(StreamEvent::Finish(finish)) => assert_eq!(finish.finish_reason, "stop"),
        other => panic!("expected finish frame, got {:?}", other),
    }

    let history = db::get_chat_history(&server.pool, &session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(history.messages.len(), 2);
    assert_eq!(history.messages[0].role, Role::User);
    assert_eq!(history.messages[0].content, ANALYZE_REQUEST_TEXT);
    assert_eq!(history.messages[1].role, Role::Assistant);
    assert_eq!(history.messages[1].content, "Clear delivery.");
}

#[tokio::test]
async fn test_finish_frame_reports_truncated_reply() {
    let server = start_server(
        ScriptedProvider::new()
            .with_chunks(&["Your opening was"])
            .with_finish_reason(FinishReason::Length),
    )
    .await;
    let upload = server.upload().await;

    let response = server
        .client
        .post(server.url("/analyze-video"))
        .json(&json!({ "filePath": upload["filePath"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let events = read_events(response).await;
    match events.last() {
        Some(StreamEvent::Finish(finish)) => {
            assert_eq!(finish.finish_reason, "length");
            assert!(finish.usage.completion_tokens > 0);
        }
        other => panic!("expected finish frame, got {:?}", other),
    }
    // No session given, nothing is stored
    assert_eq!(server.message_count().await, 0);
}

#[tokio::test]
async fn test_upload_without_video_field_writes_nothing() {
    let server = start_server(ScriptedProvider::new()).await;

    let form = Form::new().part("attachment", Part::bytes(VIDEO_BYTES.to_vec()).file_name("a.webm"));
    let response = server
        .client
        .post(server.url("/upload-video"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "No video file provided");
    assert!(body["timestamp"].is_string());

    assert_eq!(server.stored_files(), 0);
    assert!(db::list_sessions(&server.pool).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_chat_with_unknown_session_is_not_found() {
    let server = start_server(ScriptedProvider::new()).await;

    let response = server
        .client
        .post(server.url("/chat"))
        .json(&json!({
            "messages": [{"role": "user", "content": "How was my pacing?"}],
            "chatSessionId": "no-such-session",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    assert_eq!(server.message_count().await, 0);
    assert!(server.provider.requests().is_empty());
}

#[tokio::test]
async fn test_failed_processing_aborts_without_reply() {
    let server = start_server(
        ScriptedProvider::new().with_file_states([FileState::Processing, FileState::Failed]),
    )
    .await;
    let upload = server.upload().await;

    let response = server
        .client
        .post(server.url("/analyze-video"))
        .json(&json!({
            "filePath": upload["filePath"],
            "chatSessionId": upload["chatSessionId"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Failed to analyze video");
    assert!(body["details"].as_str().unwrap().contains("failed to process"));

    assert_eq!(server.message_count().await, 0);
    assert!(server.provider.requests().is_empty());
}

#[tokio::test]
async fn test_processing_that_never_finishes_times_out() {
    let server = start_server_with_policy(
        ScriptedProvider::new().with_file_states([FileState::Processing]),
        fast_policy(3),
    )
    .await;
    let upload = server.upload().await;

    let response = server
        .client
        .post(server.url("/analyze-video"))
        .json(&json!({ "filePath": upload["filePath"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert!(body["details"].as_str().unwrap().contains("still processing"));
    assert_eq!(server.provider.poll_count(), 3);
}

#[tokio::test]
async fn test_analyze_requires_file_path() {
    let server = start_server(ScriptedProvider::new()).await;

    let response = server
        .client
        .post(server.url("/analyze-video"))
        .json(&json!({ "mimeType": "video/webm" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "File path is required");
    assert!(server.provider.uploads().is_empty());
}

#[tokio::test]
async fn test_analyze_refuses_paths_outside_storage() {
    let server = start_server(ScriptedProvider::new()).await;

    for path in ["/etc/passwd", "/srv/uploads/../../etc/passwd"] {
        let response = server
            .client
            .post(server.url("/analyze-video"))
            .json(&json!({ "filePath": path }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 403, "path {}", path);
    }
    assert!(server.provider.uploads().is_empty());
}

#[tokio::test]
async fn test_chat_streams_and_persists_both_turns() {
    let server = start_server(ScriptedProvider::new().with_chunks(&["Slow ", "down."])).await;
    let upload = server.upload().await;
    let session_id = upload["chatSessionId"].as_str().unwrap();

    let response = server
        .client
        .post(server.url("/chat"))
        .json(&json!({
            "messages": [{"role": "user", "content": "How was my pacing?"}],
            "chatSessionId": session_id,
            "filePath": upload["filePath"],
            "mimeType": upload["mimeType"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let events = read_events(response).await;
    assert_eq!(streamed_text(&events), "Slow down.");

    let history = db::get_chat_history(&server.pool, session_id)
        .await
        .unwrap()
        .unwrap();
    let turns: Vec<(Role, &str)> = history
        .messages
        .iter()
        .map(|m| (m.role, m.content.as_str()))
        .collect();
    assert_eq!(
        turns,
        vec![(Role::User, "How was my pacing?"), (Role::Assistant, "Slow down.")]
    );

    let request = &server.provider.requests()[0];
    assert!(request.system_prompt.is_some());
    assert!(matches!(request.turns[0].parts[0], ProviderPart::File { .. }));
}

#[tokio::test]
async fn test_mid_stream_failure_sends_error_frame() {
    let server = start_server(
        ScriptedProvider::new()
            .with_chunks(&["Partial ", "reply"])
            .failing_stream_after(1, "connection reset"),
    )
    .await;
    let upload = server.upload().await;
    let session_id = upload["chatSessionId"].as_str().unwrap();

    let response = server
        .client
        .post(server.url("/chat"))
        .json(&json!({
            "messages": [{"role": "user", "content": "Any tips?"}],
            "chatSessionId": session_id,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let events = read_events(response).await;
    assert_eq!(streamed_text(&events), "Partial ");
    match events.last() {
        Some(StreamEvent::Error(body)) => {
            assert_eq!(body.error, "Stream failed");
            assert!(body.details.as_deref().unwrap().contains("connection reset"));
        }
        other => panic!("expected error frame, got {:?}", other),
    }

    // The unanswered user turn is removed again
    assert_eq!(server.message_count().await, 0);
}

#[tokio::test]
async fn test_failed_reply_then_follow_up_keeps_turns_alternating() {
    let server = start_server(
        ScriptedProvider::new()
            .with_file_states([FileState::Processing, FileState::Failed])
            .with_chunks(&["Speak ", "up."]),
    )
    .await;
    let upload = server.upload().await;
    let session_id = upload["chatSessionId"].as_str().unwrap();

    let first = server
        .client
        .post(server.url("/chat"))
        .json(&json!({
            "messages": [{"role": "user", "content": ANALYZE_REQUEST_TEXT}],
            "chatSessionId": session_id,
            "filePath": upload["filePath"],
            "mimeType": upload["mimeType"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 500);
    assert_eq!(server.message_count().await, 0);

    let second = server
        .client
        .post(server.url("/chat"))
        .json(&json!({
            "messages": [{"role": "user", "content": "Was I loud enough?"}],
            "chatSessionId": session_id,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    let events = read_events(second).await;
    assert_eq!(streamed_text(&events), "Speak up.");

    let history = db::get_chat_history(&server.pool, session_id)
        .await
        .unwrap()
        .unwrap();
    let turns: Vec<(Role, &str)> = history
        .messages
        .iter()
        .map(|m| (m.role, m.content.as_str()))
        .collect();
    assert_eq!(
        turns,
        vec![(Role::User, "Was I loud enough?"), (Role::Assistant, "Speak up.")]
    );
}

#[tokio::test]
async fn test_stream_that_cannot_open_leaves_no_user_turn() {
    let server =
        start_server(ScriptedProvider::new().failing_stream_open("model overloaded")).await;
    let upload = server.upload().await;

    let response = server
        .client
        .post(server.url("/analyze-video"))
        .json(&json!({
            "filePath": upload["filePath"],
            "chatSessionId": upload["chatSessionId"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert!(body["details"].as_str().unwrap().contains("model overloaded"));
    assert_eq!(server.provider.requests().len(), 1);
    assert_eq!(server.message_count().await, 0);
}

#[tokio::test]
async fn test_chat_rejects_malformed_bodies() {
    let server = start_server(ScriptedProvider::new()).await;
    let upload = server.upload().await;

    let cases = [
        json!({ "messages": "hello", "chatSessionId": upload["chatSessionId"] }),
        json!({ "messages": [], "chatSessionId": upload["chatSessionId"] }),
        json!({
            "messages": [{"role": "assistant", "content": "hi"}],
            "chatSessionId": upload["chatSessionId"],
        }),
        json!({ "messages": [{"role": "user", "content": "hi"}] }),
    ];
    for body in cases {
        let response = server
            .client
            .post(server.url("/chat"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400, "body {}", body);
    }
    assert_eq!(server.message_count().await, 0);
}

#[tokio::test]
async fn test_video_serving_allow_list() {
    let server = start_server(ScriptedProvider::new()).await;
    let upload = server.upload().await;
    let file_path = upload["filePath"].as_str().unwrap();

    let response = server
        .client
        .get(server.url(&playback_url(file_path)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"].to_str().unwrap(), "video/webm");
    assert!(response.headers()["cache-control"]
        .to_str()
        .unwrap()
        .contains("immutable"));
    assert_eq!(&response.bytes().await.unwrap()[..], VIDEO_BYTES);

    std::fs::write(server.uploads.parent().unwrap().join("secret.txt"), b"secret").unwrap();
    for (path, status) in [
        ("/video/etc/passwd", 403),
        ("/video/uploads/..%2F..%2Fsecret.txt", 403),
        ("/video/uploads/missing.webm", 404),
    ] {
        let response = server.client.get(server.url(path)).send().await.unwrap();
        assert_eq!(response.status(), status, "path {}", path);
    }
}

#[tokio::test]
async fn test_session_endpoints() {
    let server = start_server(ScriptedProvider::new()).await;
    let upload = server.upload().await;
    let session_id = upload["chatSessionId"].as_str().unwrap();
    db::insert_message(&server.pool, session_id, Role::User, "hello")
        .await
        .unwrap();

    let list: Value = server
        .client
        .get(server.url("/api/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["success"], true);
    assert_eq!(list["chatSessions"][0]["id"], session_id);
    assert_eq!(list["chatSessions"][0]["messageCount"], 1);
    assert_eq!(list["chatSessions"][0]["video"]["filePath"], upload["filePath"]);

    let response = server
        .client
        .get(server.url(&format!("/api/sessions/{}", session_id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let history: Value = response.json().await.unwrap();
    assert_eq!(history["chatSession"]["id"], session_id);
    assert_eq!(history["messages"][0]["content"], "hello");

    let response = server
        .client
        .get(server.url("/api/sessions/unknown"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Chat session not found");

    let response = server
        .client
        .delete(server.url(&format!("/api/sessions/{}", session_id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(server.stored_files(), 0);
    assert!(db::list_sessions(&server.pool).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_health() {
    let server = start_server(ScriptedProvider::new()).await;
    let response = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");
}
