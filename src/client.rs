use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use log::{debug, info};
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{STREAM_PROTOCOL_HEADER, STREAM_PROTOCOL_VERSION, VIDEO_FORM_FIELD};
use crate::error::ClientError;
use crate::models::{ChatHistory, ChatMessage, SessionList, SessionSummary};
use crate::recorder::RecordedVideo;
use crate::stream_protocol::{ProtocolError, StreamDecoder, StreamEvent};
use crate::video_path::playback_url;

pub const DEFAULT_SERVER_URL: &str = "http://localhost:3000";

/// What the upload endpoint hands back for a stored recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub file_path: String,
    pub file_name: String,
    pub mime_type: String,
    pub chat_session_id: String,
}

/// Body of a chat request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub messages: Vec<ChatMessage>,
    pub chat_session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ClientError>> + Send>>;

/// The server surface the orchestrator talks to
#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn upload_video(
        &self,
        video: &RecordedVideo,
        file_name: &str,
    ) -> Result<UploadReceipt, ClientError>;

    /// Send a chat turn and receive the streamed reply
    async fn chat(&self, payload: &ChatPayload) -> Result<EventStream, ClientError>;

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ClientError>;

    async fn chat_history(&self, session_id: &str) -> Result<ChatHistory, ClientError>;

    /// Playback URL for a stored recording
    fn video_url(&self, file_path: &str) -> String;
}

/// `BackendApi` over HTTP
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn upload_video(
        &self,
        video: &RecordedVideo,
        file_name: &str,
    ) -> Result<UploadReceipt, ClientError> {
        let part = Part::bytes(video.bytes.to_vec())
            .file_name(file_name.to_string())
            .mime_str(&video.mime_type)?;
        let form = Form::new().part(VIDEO_FORM_FIELD, part);

        info!("Uploading {} ({} bytes)", file_name, video.bytes.len());
        let response = self
            .client
            .post(self.url("/upload-video"))
            .multipart(form)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json::<UploadReceipt>().await?)
    }

    async fn chat(&self, payload: &ChatPayload) -> Result<EventStream, ClientError> {
        let response = self
            .client
            .post(self.url("/chat"))
            .json(payload)
            .send()
            .await?;
        let response = check_status(response).await?;

        let announced = response
            .headers()
            .get(STREAM_PROTOCOL_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u32>().ok());
        if let Some(version) = announced {
            if version != STREAM_PROTOCOL_VERSION {
                return Err(ProtocolError::UnsupportedVersion(version).into());
            }
        }

        Ok(decode_event_stream(response.bytes_stream()))
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ClientError> {
        let response = self.client.get(self.url("/api/sessions")).send().await?;
        let list: SessionList = read_envelope(response).await?;
        Ok(list.chat_sessions)
    }

    async fn chat_history(&self, session_id: &str) -> Result<ChatHistory, ClientError> {
        let response = self
            .client
            .get(self.url(&format!("/api/sessions/{}", session_id)))
            .send()
            .await?;
        read_envelope(response).await
    }

    fn video_url(&self, file_path: &str) -> String {
        self.url(&playback_url(file_path))
    }
}

/// Turn a non-success response into `ClientError::Status`, preferring the
/// `error` field of a JSON body as the message
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(text);
    Err(ClientError::Status {
        status: status.as_u16(),
        message,
    })
}

/// Unwrap a `{success, ...}` envelope
async fn read_envelope<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let status = response.status();
    let text = response.text().await?;
    let value: Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(_) if !status.is_success() => {
            return Err(ClientError::Status {
                status: status.as_u16(),
                message: text,
            })
        }
        Err(e) => return Err(ClientError::Rejected(format!("invalid response body: {}", e))),
    };

    if value.get("success").and_then(Value::as_bool) != Some(true) {
        let message = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("request failed")
            .to_string();
        return Err(ClientError::Rejected(message));
    }
    serde_json::from_value(value)
        .map_err(|e| ClientError::Rejected(format!("unexpected response shape: {}", e)))
}

struct DecodeState<S> {
    body: Pin<Box<S>>,
    decoder: StreamDecoder,
    pending: VecDeque<StreamEvent>,
    done: bool,
}

/// Decode a streamed response body into protocol events
///
/// The first transport or protocol error is yielded and ends the stream.
pub fn decode_event_stream<S>(body: S) -> EventStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let state = DecodeState {
        body: Box::pin(body),
        decoder: StreamDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => match state.decoder.push(&chunk) {
                    Ok(events) => state.pending.extend(events),
                    Err(e) => {
                        state.done = true;
                        return Some((Err(e.into()), state));
                    }
                },
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e.into()), state));
                }
                None => {
                    state.done = true;
                    debug!("Event stream body ended");
                    match state.decoder.finish() {
                        Ok(events) => state.pending.extend(events),
                        Err(e) => return Some((Err(e.into()), state)),
                    }
                }
            }
        }
    }))
}
