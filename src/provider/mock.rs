use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    FileState, FinishReason, Fragment, GenerationRequest, GenerativeProvider, RemoteFile,
    TextStream,
};
use crate::error::ProviderError;

/// In-memory provider replaying a script
///
/// `upload_file` reports the first scripted state and every `get_file` call
/// advances one step; the last state repeats forever. Streams yield the
/// scripted chunks and a finish reason, optionally failing part way.
pub struct ScriptedProvider {
    states: Mutex<VecDeque<FileState>>,
    chunks: Vec<String>,
    finish_reason: FinishReason,
    upload_failure: Option<String>,
    open_failure: Option<String>,
    stream_failure: Option<(usize, String)>,
    uploads: Mutex<Vec<PathBuf>>,
    polls: Mutex<u32>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(VecDeque::from([FileState::Active])),
            chunks: vec![
                "**Overall**: clear delivery. ".to_string(),
                "Watch the filler words.".to_string(),
            ],
            finish_reason: FinishReason::Stop,
            upload_failure: None,
            open_failure: None,
            stream_failure: None,
            uploads: Mutex::new(Vec::new()),
            polls: Mutex::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_file_states(mut self, states: impl IntoIterator<Item = FileState>) -> Self {
        let states: VecDeque<FileState> = states.into_iter().collect();
        if !states.is_empty() {
            self.states = Mutex::new(states);
        }
        self
    }

    pub fn with_chunks(mut self, chunks: &[&str]) -> Self {
        self.chunks = chunks.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = reason;
        self
    }

    pub fn failing_upload(mut self, message: &str) -> Self {
        self.upload_failure = Some(message.to_string());
        self
    }

    /// Refuse to open the completion stream at all
    pub fn failing_stream_open(mut self, message: &str) -> Self {
        self.open_failure = Some(message.to_string());
        self
    }

    /// Yield `chunks` scripted chunks, then fail
    pub fn failing_stream_after(mut self, chunks: usize, message: &str) -> Self {
        self.stream_failure = Some((chunks, message.to_string()));
        self
    }

    pub fn uploads(&self) -> Vec<PathBuf> {
        lock(&self.uploads).clone()
    }

    pub fn poll_count(&self) -> u32 {
        *lock(&self.polls)
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        lock(&self.requests).clone()
    }

    fn current_state(&self) -> FileState {
        lock(&self.states)
            .front()
            .copied()
            .unwrap_or(FileState::Active)
    }

    fn advance_state(&self) -> FileState {
        let mut states = lock(&self.states);
        if states.len() > 1 {
            states.pop_front();
        }
        states.front().copied().unwrap_or(FileState::Active)
    }

    fn remote(&self, state: FileState) -> RemoteFile {
        let index = lock(&self.uploads).len();
        let name = format!("files/scripted-{}", index);
        RemoteFile {
            uri: (state == FileState::Active).then(|| format!("mock://{}", name)),
            name,
            mime_type: "video/webm".to_string(),
            state,
        }
    }
}

#[async_trait]
impl GenerativeProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn upload_file(&self, path: &Path, mime_type: &str) -> Result<RemoteFile, ProviderError> {
        if let Some(message) = &self.upload_failure {
            return Err(ProviderError::Other(message.clone()));
        }
        tokio::fs::metadata(path)
            .await
            .map_err(|source| ProviderError::Io {
                path: path.display().to_string(),
                source,
            })?;
        lock(&self.uploads).push(path.to_path_buf());
        let mut remote = self.remote(self.current_state());
        remote.mime_type = mime_type.to_string();
        Ok(remote)
    }

    async fn get_file(&self, name: &str) -> Result<RemoteFile, ProviderError> {
        *lock(&self.polls) += 1;
        let mut remote = self.remote(self.advance_state());
        remote.uri = remote.uri.map(|_| format!("mock://{}", name));
        remote.name = name.to_string();
        Ok(remote)
    }

    async fn stream_generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<TextStream, ProviderError> {
        lock(&self.requests).push(request.clone());
        if let Some(message) = &self.open_failure {
            return Err(ProviderError::Other(message.clone()));
        }

        let take = match &self.stream_failure {
            Some((after, _)) => *after,
            None => self.chunks.len(),
        };
        let mut items: Vec<Result<Fragment, ProviderError>> = self
            .chunks
            .iter()
            .take(take)
            .map(|chunk| Ok(Fragment::Text(chunk.clone())))
            .collect();
        match &self.stream_failure {
            Some((_, message)) => items.push(Err(ProviderError::Other(message.clone()))),
            None => items.push(Ok(Fragment::Finish(self.finish_reason))),
        }
        Ok(Box::pin(futures::stream::iter(items)))
    }
}
