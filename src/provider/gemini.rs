use std::path::Path;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use super::{
    FileState, FinishReason, Fragment, GenerationRequest, GenerativeProvider, Part, RemoteFile,
    TextStream,
};
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::models::Role;

/// Google Generative Language API with API key authentication
pub struct GeminiProvider {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl GeminiProvider {
    pub fn new(api_base: &str, api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            model,
        }
    }

    pub fn from_config(config: &ProviderConfig, api_key: String) -> Self {
        Self::new(&config.api_base, api_key, config.model.clone())
    }
}

#[derive(Serialize)]
struct StartUpload<'a> {
    file: DisplayName<'a>,
}

#[derive(Serialize)]
struct DisplayName<'a> {
    display_name: &'a str,
}

#[derive(Deserialize)]
struct UploadResponse {
    file: Option<FileResource>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileResource {
    name: Option<String>,
    uri: Option<String>,
    mime_type: Option<String>,
    state: Option<String>,
}

impl FileResource {
    fn into_remote(self, fallback_mime: &str) -> Result<RemoteFile, ProviderError> {
        Ok(RemoteFile {
            name: self.name.ok_or(ProviderError::MissingField("file name"))?,
            uri: self.uri,
            mime_type: self.mime_type.unwrap_or_else(|| fallback_mime.to_string()),
            state: self
                .state
                .as_deref()
                .map(FileState::parse)
                .unwrap_or(FileState::Unspecified),
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<ContentBody<'a>>,
    contents: Vec<ContentBody<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct ContentBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<PartBody<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum PartBody<'a> {
    Text {
        text: &'a str,
    },
    File {
        #[serde(rename = "fileData")]
        file_data: FileData<'a>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileData<'a> {
    mime_type: &'a str,
    file_uri: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<ApiErrorBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<ChunkContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChunkContent {
    #[serde(default)]
    parts: Vec<ChunkPart>,
}

#[derive(Deserialize)]
struct ChunkPart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "model",
    }
}

fn part_body(part: &Part) -> PartBody<'_> {
    match part {
        Part::Text(text) => PartBody::Text { text },
        Part::File { uri, mime_type } => PartBody::File {
            file_data: FileData {
                mime_type,
                file_uri: uri,
            },
        },
    }
}

fn request_body(request: &GenerationRequest) -> GenerateContentBody<'_> {
    GenerateContentBody {
        system_instruction: request.system_prompt.as_deref().map(|text| ContentBody {
            role: None,
            parts: vec![PartBody::Text { text }],
        }),
        contents: request
            .turns
            .iter()
            .map(|turn| ContentBody {
                role: Some(wire_role(turn.role)),
                parts: turn.parts.iter().map(part_body).collect(),
            })
            .collect(),
        generation_config: GenerationConfig {
            max_output_tokens: request.max_output_tokens,
            temperature: request.temperature,
        },
    }
}

/// Map a Gemini `finishReason` onto the event label
fn finish_reason(value: &str) -> FinishReason {
    match value {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            FinishReason::ContentFilter
        }
        _ => FinishReason::Other,
    }
}

/// Fragments carried by one streamed chunk: its text, then its finish reason
fn chunk_fragments(data: &str) -> Result<Vec<Fragment>, ProviderError> {
    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|e| ProviderError::Malformed(format!("stream chunk: {}", e)))?;
    if let Some(err) = chunk.error {
        return Err(ProviderError::Other(err.message));
    }
    let mut fragments = Vec::new();
    if let Some(candidate) = chunk.candidates.into_iter().next() {
        let text: String = candidate
            .content
            .into_iter()
            .flat_map(|content| content.parts)
            .filter_map(|part| part.text)
            .collect();
        if !text.is_empty() {
            fragments.push(Fragment::Text(text));
        }
        if let Some(reason) = candidate.finish_reason.as_deref() {
            fragments.push(Fragment::Finish(finish_reason(reason)));
        }
    }
    Ok(fragments)
}

fn api_error_message(body: &str) -> String {
    serde_json::from_str::<ApiErrorEnvelope>(body)
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| body.to_string())
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = api_error_message(&body);
    error!("Provider returned HTTP {}: {}", status.as_u16(), message);
    Err(ProviderError::Status {
        status: status.as_u16(),
        body: message,
    })
}

fn extract_sse_data(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }
    let data = trimmed.strip_prefix("data:")?.trim_start();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    Some(data.to_string())
}

/// Split a byte stream into SSE `data:` payloads
fn sse_data_lines<S>(byte_stream: S) -> impl Stream<Item = Result<String, ProviderError>> + Send
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    futures::stream::unfold(
        (byte_stream, BytesMut::with_capacity(8192), false),
        |(mut stream, mut buffer, done)| async move {
            if done {
                return None;
            }
            loop {
                if let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                    let line_bytes = buffer.split_to(newline + 1);
                    let line = String::from_utf8_lossy(&line_bytes);
                    if let Some(data) = extract_sse_data(&line) {
                        return Some((Ok(data), (stream, buffer, false)));
                    }
                    continue;
                }
                match stream.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        return Some((Err(ProviderError::Http(e)), (stream, buffer, true)));
                    }
                    None => {
                        // The last event may arrive without a trailing newline
                        let rest = buffer.split();
                        let line = String::from_utf8_lossy(&rest);
                        return extract_sse_data(&line)
                            .map(|data| (Ok(data), (stream, buffer, true)));
                    }
                }
            }
        },
    )
}

#[async_trait]
impl GenerativeProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn upload_file(&self, path: &Path, mime_type: &str) -> Result<RemoteFile, ProviderError> {
        let io_error = |source: std::io::Error| ProviderError::Io {
            path: path.display().to_string(),
            source,
        };
        let file = tokio::fs::File::open(path).await.map_err(io_error)?;
        let size = file.metadata().await.map_err(io_error)?.len();
        let display_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("recording");

        let start = self
            .client
            .post(format!("{}/upload/v1beta/files", self.api_base))
            .query(&[("key", &self.api_key)])
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", size.to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&StartUpload {
                file: DisplayName { display_name },
            })
            .send()
            .await?;
        let start = check_status(start).await?;
        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .ok_or(ProviderError::MissingField("x-goog-upload-url header"))?
            .to_string();

        debug!("Uploading {} ({} bytes) to provider", path.display(), size);
        let response = self
            .client
            .post(&upload_url)
            .header("Content-Length", size.to_string())
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;
        let uploaded: UploadResponse = check_status(response).await?.json().await?;
        let remote = uploaded
            .file
            .ok_or(ProviderError::MissingField("file"))?
            .into_remote(mime_type)?;
        info!("Uploaded {} as {} ({:?})", path.display(), remote.name, remote.state);
        Ok(remote)
    }

    async fn get_file(&self, name: &str) -> Result<RemoteFile, ProviderError> {
        let response = self
            .client
            .get(format!("{}/v1beta/{}", self.api_base, name))
            .query(&[("key", &self.api_key)])
            .send()
            .await?;
        let resource: FileResource = check_status(response).await?.json().await?;
        resource.into_remote("application/octet-stream")
    }

    async fn stream_generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<TextStream, ProviderError> {
        debug!(
            "Starting {} stream with {} turns",
            self.model,
            request.turns.len()
        );
        let response = self
            .client
            .post(format!(
                "{}/v1beta/models/{}:streamGenerateContent",
                self.api_base, self.model
            ))
            .query(&[("alt", "sse"), ("key", self.api_key.as_str())])
            .json(&request_body(request))
            .send()
            .await?;
        let response = check_status(response).await?;

        let fragments = sse_data_lines(Box::pin(response.bytes_stream())).flat_map(|item| {
            let items: Vec<Result<Fragment, ProviderError>> =
                match item.and_then(|data| chunk_fragments(&data)) {
                    Ok(fragments) => fragments.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
            futures::stream::iter(items)
        });
        Ok(Box::pin(fragments))
    }
}
