//! Seam to the generative-AI service.
//!
//! The analysis pipeline only needs three things from a provider: ingest a
//! local file, report the ingestion state of a file handle, and stream a text
//! completion. [`gemini::GeminiProvider`] talks to the Google Generative
//! Language API; [`mock::ScriptedProvider`] replays scripted answers in tests.

pub mod gemini;
pub mod mock;

use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::ProviderError;
use crate::models::Role;

/// Boxed stream of fragments returned by [`GenerativeProvider::stream_generate`]
pub type TextStream = Pin<Box<dyn Stream<Item = Result<Fragment, ProviderError>> + Send>>;

/// One item of a streamed completion
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Text(String),
    /// The provider reported why generation stopped
    Finish(FinishReason),
}

/// Why a completion ended, in the labels used by the `finish` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinishReason {
    #[default]
    Stop,
    Length,
    ContentFilter,
    Other,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content-filter",
            FinishReason::Other => "other",
        }
    }
}

/// Ingestion state of an uploaded file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Processing,
    Active,
    Failed,
    Unspecified,
}

impl FileState {
    pub fn parse(value: &str) -> Self {
        match value {
            "PROCESSING" => FileState::Processing,
            "ACTIVE" => FileState::Active,
            "FAILED" => FileState::Failed,
            _ => FileState::Unspecified,
        }
    }
}

/// Handle to a file held by the provider
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFile {
    /// Resource name used to re-fetch the state, e.g. `files/abc123`
    pub name: String,
    /// Reference attached to completion requests, present once ingested
    pub uri: Option<String>,
    pub mime_type: String,
    pub state: FileState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    File { uri: String, mime_type: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Turn {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![Part::Text(text.into())],
        }
    }
}

/// A streamed completion request
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub system_prompt: Option<String>,
    pub turns: Vec<Turn>,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

impl GenerationRequest {
    /// All text sent to the model, used for the usage estimate
    pub fn prompt_text(&self) -> String {
        let mut text = self.system_prompt.clone().unwrap_or_default();
        for turn in &self.turns {
            for part in &turn.parts {
                if let Part::Text(t) = part {
                    text.push_str(t);
                }
            }
        }
        text
    }
}

/// Generative-AI backend used by the analysis pipeline
///
/// Implementors must be `Send + Sync`; one instance is shared by all requests.
#[async_trait]
pub trait GenerativeProvider: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &str;

    /// Upload a local file; the returned handle is usually still processing
    async fn upload_file(&self, path: &Path, mime_type: &str) -> Result<RemoteFile, ProviderError>;

    /// Re-fetch a file handle by resource name
    async fn get_file(&self, name: &str) -> Result<RemoteFile, ProviderError>;

    /// Open a streamed text completion
    async fn stream_generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<TextStream, ProviderError>;
}
