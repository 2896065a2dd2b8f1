//! Client-side coordinator for capture, recording, analysis and chat.
//!
//! The orchestrator is an ordinary value owned by its caller. It holds the
//! transcript, the active session and the recorder; every failure leaves the
//! recorder in `stopped` or `idle`.

use bytes::Bytes;
use futures::StreamExt;
use log::{info, warn};

use crate::capture::CaptureAdapter;
use crate::client::{BackendApi, ChatPayload, UploadReceipt};
use crate::constants::generate_video_file_name;
use crate::error::ClientError;
use crate::models::{ChatMessage, Role, SessionSummary};
use crate::prompts::ANALYZE_REQUEST_TEXT;
use crate::recorder::{format_elapsed, RecordedVideo, Recorder, RecordingState};
use crate::stream_protocol::StreamEvent;

/// One rendered chat line
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    pub timestamp_ms: i64,
}

impl TranscriptEntry {
    fn now(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// What the video pane is showing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackSource {
    LivePreview,
    /// The recording that was just finalized
    Recording,
    /// A stored recording from a resumed session
    Remote(String),
}

type StateListener = Box<dyn Fn(RecordingState) + Send + Sync>;

pub struct Orchestrator<B: BackendApi> {
    backend: B,
    capture: CaptureAdapter,
    recorder: Recorder,
    messages: Vec<TranscriptEntry>,
    session_id: Option<String>,
    uploaded: Option<UploadReceipt>,
    has_analyzed_video: bool,
    is_loading: bool,
    show_chat: bool,
    playback: PlaybackSource,
    listeners: Vec<StateListener>,
}

impl<B: BackendApi> Orchestrator<B> {
    pub fn new(backend: B, capture: CaptureAdapter, mime_type: impl Into<String>) -> Self {
        Self {
            backend,
            capture,
            recorder: Recorder::new(mime_type),
            messages: Vec::new(),
            session_id: None,
            uploaded: None,
            has_analyzed_video: false,
            is_loading: false,
            show_chat: false,
            playback: PlaybackSource::LivePreview,
            listeners: Vec::new(),
        }
    }

    /// Start the live preview with the remembered devices
    pub async fn initialize(&mut self) -> Result<(), ClientError> {
        self.capture.initialize(None).await?;
        Ok(())
    }

    /// Register a callback for recorder state changes
    pub fn subscribe(&mut self, listener: impl Fn(RecordingState) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    fn notify(&self) {
        let state = self.recorder.state();
        for listener in &self.listeners {
            listener(state);
        }
    }

    fn clear_session(&mut self) {
        self.messages.clear();
        self.session_id = None;
        self.uploaded = None;
        self.has_analyzed_video = false;
        self.show_chat = false;
    }

    /// Begin a fresh recording; a no-op unless idle
    pub fn start_recording(&mut self) -> Result<bool, ClientError> {
        if self.recorder.state() != RecordingState::Idle {
            return Ok(false);
        }
        if self.capture.stream().is_none() {
            return Err(ClientError::InvalidState("no live stream to record"));
        }
        self.clear_session();
        self.recorder.start();
        self.playback = PlaybackSource::LivePreview;
        self.notify();
        Ok(true)
    }

    pub fn push_chunk(&mut self, chunk: Bytes) -> bool {
        self.recorder.push_chunk(chunk)
    }

    pub fn tick(&mut self) {
        self.recorder.tick();
    }

    /// Elapsed recording time as `MM:SS`
    pub fn recording_time(&self) -> String {
        format_elapsed(self.recorder.elapsed_secs())
    }

    /// Finalize the recording and switch the view to its playback
    pub fn stop_recording(&mut self) -> Option<RecordedVideo> {
        if self.recorder.state() != RecordingState::Recording {
            return None;
        }
        let video = self.recorder.stop();
        self.playback = PlaybackSource::Recording;
        self.notify();
        video
    }

    /// Upload the finalized recording and stream its analysis
    pub async fn analyze(&mut self) -> Result<(), ClientError> {
        if self.is_loading {
            return Err(ClientError::InvalidState("a request is already in flight"));
        }
        let video = self
            .recorder
            .begin_upload()
            .ok_or(ClientError::InvalidState("nothing recorded to analyze"))?;
        self.notify();
        self.is_loading = true;

        let file_name = generate_video_file_name(video.extension());
        let receipt = match self.backend.upload_video(&video, &file_name).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!("Upload failed: {}", e);
                self.is_loading = false;
                self.recorder.rollback();
                self.notify();
                return Err(e);
            }
        };
        info!("Uploaded recording to session {}", receipt.chat_session_id);

        self.recorder.mark_processing();
        self.notify();
        self.messages.clear();
        self.session_id = Some(receipt.chat_session_id.clone());
        self.has_analyzed_video = true;
        self.show_chat = true;
        self.messages
            .push(TranscriptEntry::now(Role::User, ANALYZE_REQUEST_TEXT));

        let payload = ChatPayload {
            messages: self.chat_messages(),
            chat_session_id: receipt.chat_session_id.clone(),
            file_path: Some(receipt.file_path.clone()),
            mime_type: Some(receipt.mime_type.clone()),
        };
        self.uploaded = Some(receipt);

        let result = self.stream_reply(&payload).await;
        self.is_loading = false;
        if result.is_ok() {
            self.recorder.finish_processing();
        } else {
            // Nothing was stored for this session, a retry uploads afresh
            self.clear_session();
            self.recorder.rollback();
        }
        self.notify();
        result
    }

    /// Continue the conversation in the active session
    pub async fn send_message(&mut self, text: &str) -> Result<(), ClientError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClientError::InvalidState("message is empty"));
        }
        if self.is_loading {
            return Err(ClientError::InvalidState("a request is already in flight"));
        }
        let session_id = self
            .session_id
            .clone()
            .ok_or(ClientError::InvalidState("no active chat session"))?;

        let user_index = self.messages.len();
        self.messages.push(TranscriptEntry::now(Role::User, text));
        let payload = ChatPayload {
            messages: self.chat_messages(),
            chat_session_id: session_id,
            file_path: None,
            mime_type: None,
        };
        self.is_loading = true;
        let result = self.stream_reply(&payload).await;
        self.is_loading = false;
        if result.is_err() {
            // The server keeps no unanswered turn either
            self.messages.truncate(user_index);
        }
        result
    }

    /// Stream an assistant reply into a new transcript entry
    ///
    /// A reply that errors or ends without `finish` is removed again.
    async fn stream_reply(&mut self, payload: &ChatPayload) -> Result<(), ClientError> {
        let mut events = self.backend.chat(payload).await?;
        let index = self.messages.len();
        self.messages
            .push(TranscriptEntry::now(Role::Assistant, String::new()));

        let outcome = loop {
            match events.next().await {
                Some(Ok(StreamEvent::Start(_))) => {}
                Some(Ok(StreamEvent::TextDelta(delta))) => {
                    if let Some(entry) = self.messages.last_mut() {
                        entry.content.push_str(&delta.text);
                    }
                }
                Some(Ok(StreamEvent::Finish(_))) => break Ok(()),
                Some(Ok(StreamEvent::Error(body))) => {
                    let message = match body.details {
                        Some(details) => format!("{}: {}", body.error, details),
                        None => body.error,
                    };
                    break Err(ClientError::Remote(message));
                }
                Some(Err(e)) => break Err(e),
                None => break Err(ClientError::Truncated),
            }
        };

        if let Err(e) = &outcome {
            warn!("Reply stream failed: {}", e);
            self.messages.truncate(index);
        }
        outcome
    }

    fn chat_messages(&self) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .map(|entry| ChatMessage {
                role: entry.role,
                content: entry.content.clone(),
            })
            .collect()
    }

    /// Discard everything and restart the live preview
    ///
    /// An in-flight recording is abandoned.
    pub async fn reset(&mut self) -> Result<(), ClientError> {
        if self.recorder.state() == RecordingState::Recording {
            self.recorder.stop();
        }
        self.recorder.reset();
        self.clear_session();
        self.is_loading = false;
        self.playback = PlaybackSource::LivePreview;
        self.notify();
        self.capture.initialize(None).await?;
        Ok(())
    }

    /// Resume a stored session, showing its recording if it has one
    pub async fn load_session(&mut self, session_id: &str) -> Result<(), ClientError> {
        if self.recorder.state() == RecordingState::Recording {
            return Err(ClientError::InvalidState("cannot load a session while recording"));
        }
        let history = self.backend.chat_history(session_id).await?;

        self.messages = history
            .messages
            .iter()
            .map(|m| TranscriptEntry {
                role: m.role,
                content: m.content.clone(),
                timestamp_ms: m.created_at_ms,
            })
            .collect();
        self.session_id = Some(history.chat_session.id.clone());
        self.has_analyzed_video = true;
        self.show_chat = true;
        self.is_loading = false;
        self.uploaded = history.chat_session.video.as_ref().map(|video| UploadReceipt {
            file_path: video.file_path.clone(),
            file_name: video.file_name.clone(),
            mime_type: video.mime_type.clone(),
            chat_session_id: history.chat_session.id.clone(),
        });

        if let Some(video) = history
            .chat_session
            .video
            .as_ref()
            .filter(|v| !v.file_path.is_empty())
        {
            self.playback = PlaybackSource::Remote(self.backend.video_url(&video.file_path));
            self.recorder.enter_playback();
            self.notify();
        }
        info!(
            "Loaded session {} with {} messages",
            session_id,
            self.messages.len()
        );
        Ok(())
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ClientError> {
        self.backend.list_sessions().await
    }

    pub fn state(&self) -> RecordingState {
        self.recorder.state()
    }

    pub fn messages(&self) -> &[TranscriptEntry] {
        &self.messages
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn has_analyzed_video(&self) -> bool {
        self.has_analyzed_video
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn show_chat(&self) -> bool {
        self.show_chat
    }

    pub fn playback(&self) -> &PlaybackSource {
        &self.playback
    }

    pub fn video_url(&self) -> Option<&str> {
        match &self.playback {
            PlaybackSource::Remote(url) => Some(url),
            _ => None,
        }
    }

    pub fn recorded(&self) -> Option<&RecordedVideo> {
        self.recorder.recorded()
    }

    pub fn uploaded(&self) -> Option<&UploadReceipt> {
        self.uploaded.as_ref()
    }

    pub fn capture(&self) -> &CaptureAdapter {
        &self.capture
    }

    pub fn capture_mut(&mut self) -> &mut CaptureAdapter {
        &mut self.capture
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}
