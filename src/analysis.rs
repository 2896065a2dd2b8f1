//! Bridge from a stored recording to a streamed model reply.
//!
//! A request goes through three phases. The file is uploaded to the provider
//! and polled until ingested, the completion stream is opened, and a spawned
//! task forwards text fragments as protocol events. Anything failing before
//! the stream opens is returned to the caller; later failures become a
//! terminal `error` event. The assistant reply is persisted only after the
//! provider stream completes and ahead of the `finish` event. When no reply
//! gets stored, the user turn it answers is removed again so a session's
//! messages keep alternating.

use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use log::{debug, error, info, warn};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::constants::{
    generate_message_id, DEFAULT_VIDEO_MIME_TYPE, MAX_OUTPUT_TOKENS, TEMPERATURE,
};
use crate::db;
use crate::error::AnalysisError;
use crate::models::{ChatMessage, Role};
use crate::poll::{wait_until_active, PollPolicy};
use crate::prompts::{ANALYSIS_PROMPT, CHAT_PROMPT};
use crate::provider::{FinishReason, Fragment, GenerationRequest, GenerativeProvider, Part, Turn};
use crate::stream_protocol::{StreamEvent, Usage};

const EVENT_BUFFER: usize = 32;

/// Provider file reference ready to attach to a request
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedFile {
    pub uri: String,
    pub mime_type: String,
}

impl PreparedFile {
    fn part(&self) -> Part {
        Part::File {
            uri: self.uri.clone(),
            mime_type: self.mime_type.clone(),
        }
    }
}

/// Session a streamed reply is stored against
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyTarget {
    pub session_id: String,
    /// Stored user turn this reply answers
    pub user_message_id: Option<String>,
}

/// Drop the user turn of a reply that will not be stored
async fn retract_user_turn(pool: &SqlitePool, target: &ReplyTarget) {
    let Some(message_id) = target.user_message_id.as_deref() else {
        return;
    };
    match db::delete_message(pool, message_id).await {
        Ok(_) => info!(
            "Removed unanswered message {} from session {}",
            message_id, target.session_id
        ),
        Err(e) => error!(
            "Failed to remove unanswered message {} from session {}: {}",
            message_id, target.session_id, e
        ),
    }
}

async fn store_reply(pool: &SqlitePool, target: &ReplyTarget, content: &str) {
    if content.is_empty() {
        warn!("Empty reply for session {}, nothing stored", target.session_id);
        retract_user_turn(pool, target).await;
        return;
    }
    if let Err(e) = db::insert_message(pool, &target.session_id, Role::Assistant, content).await {
        error!(
            "Failed to save assistant message for session {}: {}",
            target.session_id, e
        );
        retract_user_turn(pool, target).await;
    }
}

#[derive(Clone)]
pub struct AnalysisGateway {
    provider: Arc<dyn GenerativeProvider>,
    pool: SqlitePool,
    poll_policy: PollPolicy,
}

impl AnalysisGateway {
    pub fn new(
        provider: Arc<dyn GenerativeProvider>,
        pool: SqlitePool,
        poll_policy: PollPolicy,
    ) -> Self {
        Self {
            provider,
            pool,
            poll_policy,
        }
    }

    /// Upload a stored recording and wait until the provider can use it
    pub async fn prepare_file(
        &self,
        file_path: Option<&Path>,
        mime_type: Option<&str>,
    ) -> Result<PreparedFile, AnalysisError> {
        let path = file_path
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(AnalysisError::MissingFilePath)?;
        let mime_type = mime_type
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(DEFAULT_VIDEO_MIME_TYPE);

        info!(
            "Uploading {} ({}) to {}",
            path.display(),
            mime_type,
            self.provider.name()
        );
        let uploaded = self.provider.upload_file(path, mime_type).await?;
        let ready = wait_until_active(self.provider.as_ref(), uploaded, &self.poll_policy).await?;
        let uri = ready
            .uri
            .ok_or_else(|| AnalysisError::MissingUri(ready.name.clone()))?;
        Ok(PreparedFile {
            uri,
            mime_type: ready.mime_type,
        })
    }

    /// Open the completion and forward it as protocol events
    ///
    /// With a `target`, the assembled reply is stored as an assistant message
    /// once the provider stream ends cleanly, before the `finish` event goes
    /// out. Storage failures are logged and do not affect the stream. If the
    /// stream cannot be opened, fails, or loses its client, the target's user
    /// turn is removed.
    pub async fn open_stream(
        &self,
        request: GenerationRequest,
        target: Option<ReplyTarget>,
    ) -> Result<ReceiverStream<StreamEvent>, AnalysisError> {
        let pool = self.pool.clone();
        let mut fragments = match self.provider.stream_generate(&request).await {
            Ok(fragments) => fragments,
            Err(e) => {
                if let Some(target) = &target {
                    retract_user_turn(&pool, target).await;
                }
                return Err(e.into());
            }
        };
        let prompt_text = request.prompt_text();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(async move {
            let message_id = generate_message_id();
            let mut content = String::new();
            let mut finish_reason = FinishReason::default();

            let completed = 'stream: {
                if tx.send(StreamEvent::start(&message_id)).await.is_err() {
                    break 'stream false;
                }
                while let Some(item) = fragments.next().await {
                    match item {
                        Ok(Fragment::Text(text)) => {
                            content.push_str(&text);
                            if tx.send(StreamEvent::text(text)).await.is_err() {
                                warn!("Client disconnected from {}, dropping reply", message_id);
                                break 'stream false;
                            }
                        }
                        Ok(Fragment::Finish(reason)) => finish_reason = reason,
                        Err(e) => {
                            let err = AnalysisError::Stream(e.to_string());
                            error!("Stream {} failed: {}", message_id, err);
                            let _ = tx.send(StreamEvent::error("Stream failed", err)).await;
                            break 'stream false;
                        }
                    }
                }
                true
            };

            if !completed {
                if let Some(target) = &target {
                    retract_user_turn(&pool, target).await;
                }
                return;
            }
            if let Some(target) = &target {
                store_reply(&pool, target, &content).await;
            }

            let usage = Usage::estimate(&prompt_text, &content);
            info!(
                "Stream {} finished ({}): {} chars, ~{} completion tokens",
                message_id,
                finish_reason.as_str(),
                content.len(),
                usage.completion_tokens
            );
            if tx
                .send(StreamEvent::finish(finish_reason.as_str(), usage))
                .await
                .is_err()
            {
                debug!("Client left before finish of {}", message_id);
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}

/// One-shot analysis: the video followed by the coaching prompt
pub fn analysis_request(file: &PreparedFile) -> GenerationRequest {
    GenerationRequest {
        system_prompt: None,
        turns: vec![Turn {
            role: Role::User,
            parts: vec![file.part(), Part::Text(ANALYSIS_PROMPT.to_string())],
        }],
        max_output_tokens: MAX_OUTPUT_TOKENS,
        temperature: TEMPERATURE,
    }
}

/// Conversation request; a prepared file is attached to the latest user turn
pub fn chat_request(messages: &[ChatMessage], file: Option<&PreparedFile>) -> GenerationRequest {
    let mut turns: Vec<Turn> = messages
        .iter()
        .map(|m| Turn::text(m.role, m.content.clone()))
        .collect();

    if let Some(file) = file {
        if let Some(last_user) = turns.iter_mut().rev().find(|t| t.role == Role::User) {
            last_user.parts.insert(0, file.part());
        }
    }

    GenerationRequest {
        system_prompt: Some(CHAT_PROMPT.to_string()),
        turns,
        max_output_tokens: MAX_OUTPUT_TOKENS,
        temperature: TEMPERATURE,
    }
}
