use bytes::{Bytes, BytesMut};
use log::debug;
use serde::Serialize;

/// Where the record/analyze cycle currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    Idle,
    Recording,
    Stopped,
    Uploading,
    Processing,
}

/// A finalized recording
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedVideo {
    pub bytes: Bytes,
    pub mime_type: String,
}

impl RecordedVideo {
    pub fn extension(&self) -> &'static str {
        if self.mime_type.contains("webm") {
            "webm"
        } else {
            "mp4"
        }
    }
}

/// Accumulates encoded chunks between start and stop
///
/// idle -> recording -> stopped -> uploading -> processing -> stopped, with
/// reset back to idle from any state except recording.
#[derive(Debug)]
pub struct Recorder {
    state: RecordingState,
    mime_type: String,
    chunks: Vec<Bytes>,
    elapsed_secs: u64,
    recorded: Option<RecordedVideo>,
}

impl Recorder {
    pub fn new(mime_type: impl Into<String>) -> Self {
        Self {
            state: RecordingState::Idle,
            mime_type: mime_type.into(),
            chunks: Vec::new(),
            elapsed_secs: 0,
            recorded: None,
        }
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed_secs
    }

    pub fn recorded(&self) -> Option<&RecordedVideo> {
        self.recorded.as_ref()
    }

    /// Begin buffering; ignored unless idle
    pub fn start(&mut self) -> bool {
        if self.state != RecordingState::Idle {
            return false;
        }
        self.chunks.clear();
        self.elapsed_secs = 0;
        self.recorded = None;
        self.state = RecordingState::Recording;
        true
    }

    /// Buffer an encoded chunk; empty chunks are dropped
    pub fn push_chunk(&mut self, chunk: Bytes) -> bool {
        if self.state != RecordingState::Recording || chunk.is_empty() {
            return false;
        }
        self.chunks.push(chunk);
        true
    }

    /// Advance the elapsed counter by one second while recording
    pub fn tick(&mut self) {
        if self.state == RecordingState::Recording {
            self.elapsed_secs += 1;
        }
    }

    /// Finalize the buffered chunks into one video
    ///
    /// Returns None when not recording or when nothing was captured; the
    /// state still moves to stopped in the latter case.
    pub fn stop(&mut self) -> Option<RecordedVideo> {
        if self.state != RecordingState::Recording {
            return None;
        }
        self.state = RecordingState::Stopped;

        let size: usize = self.chunks.iter().map(Bytes::len).sum();
        if size == 0 {
            return None;
        }
        let mut buffer = BytesMut::with_capacity(size);
        for chunk in self.chunks.drain(..) {
            buffer.extend_from_slice(&chunk);
        }
        debug!("Finalized {} byte recording", size);
        let video = RecordedVideo {
            bytes: buffer.freeze(),
            mime_type: self.mime_type.clone(),
        };
        self.recorded = Some(video.clone());
        Some(video)
    }

    /// stopped -> uploading, only with a non-empty recording
    pub fn begin_upload(&mut self) -> Option<RecordedVideo> {
        if self.state != RecordingState::Stopped {
            return None;
        }
        let video = self.recorded.clone()?;
        self.state = RecordingState::Uploading;
        Some(video)
    }

    /// uploading -> processing
    pub fn mark_processing(&mut self) -> bool {
        if self.state != RecordingState::Uploading {
            return false;
        }
        self.state = RecordingState::Processing;
        true
    }

    /// processing -> stopped
    pub fn finish_processing(&mut self) -> bool {
        if self.state != RecordingState::Processing {
            return false;
        }
        self.state = RecordingState::Stopped;
        true
    }

    /// Return to stopped after a failed upload or analysis
    pub fn rollback(&mut self) {
        if matches!(
            self.state,
            RecordingState::Uploading | RecordingState::Processing
        ) {
            self.state = RecordingState::Stopped;
        }
    }

    /// Show a previously stored recording instead of a fresh one
    pub fn enter_playback(&mut self) -> bool {
        if self.state == RecordingState::Recording {
            return false;
        }
        self.chunks.clear();
        self.recorded = None;
        self.elapsed_secs = 0;
        self.state = RecordingState::Stopped;
        true
    }

    /// Clear everything and go back to idle; refused while recording
    pub fn reset(&mut self) -> bool {
        if self.state == RecordingState::Recording {
            return false;
        }
        self.chunks.clear();
        self.recorded = None;
        self.elapsed_secs = 0;
        self.state = RecordingState::Idle;
        true
    }
}

/// Elapsed time as zero-padded MM:SS
pub fn format_elapsed(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_is_ignored_while_recording() {
        let mut recorder = Recorder::new("video/webm");
        assert!(recorder.start());
        recorder.push_chunk(Bytes::from_static(b"abc"));
        assert!(!recorder.start());
        // The buffered chunk survives the ignored start
        assert_eq!(recorder.stop().unwrap().bytes, Bytes::from_static(b"abc"));
    }

    #[test]
    fn stop_concatenates_chunks_in_order() {
        let mut recorder = Recorder::new("video/webm");
        recorder.start();
        recorder.push_chunk(Bytes::from_static(b"12"));
        recorder.push_chunk(Bytes::new());
        recorder.push_chunk(Bytes::from_static(b"34"));
        let video = recorder.stop().unwrap();
        assert_eq!(&video.bytes[..], b"1234");
        assert_eq!(video.extension(), "webm");
        assert_eq!(recorder.state(), RecordingState::Stopped);
    }

    #[test]
    fn upload_cycle_returns_to_stopped() {
        let mut recorder = Recorder::new("video/mp4");
        recorder.start();
        recorder.push_chunk(Bytes::from_static(b"x"));
        recorder.stop();
        assert!(recorder.begin_upload().is_some());
        assert_eq!(recorder.state(), RecordingState::Uploading);
        assert!(recorder.mark_processing());
        assert!(recorder.finish_processing());
        assert_eq!(recorder.state(), RecordingState::Stopped);
        // The recording can be analyzed again
        assert!(recorder.begin_upload().is_some());
        recorder.rollback();
        assert_eq!(recorder.state(), RecordingState::Stopped);
    }

    #[test]
    fn empty_recording_cannot_be_uploaded() {
        let mut recorder = Recorder::new("video/webm");
        recorder.start();
        assert!(recorder.stop().is_none());
        assert_eq!(recorder.state(), RecordingState::Stopped);
        assert!(recorder.begin_upload().is_none());
    }

    #[test]
    fn upload_requires_stopped_state() {
        let mut recorder = Recorder::new("video/webm");
        assert!(recorder.begin_upload().is_none());
        assert!(!recorder.mark_processing());
        recorder.start();
        assert!(recorder.begin_upload().is_none());
    }

    #[test]
    fn reset_is_refused_while_recording() {
        let mut recorder = Recorder::new("video/webm");
        recorder.start();
        assert!(!recorder.reset());
        recorder.stop();
        assert!(recorder.reset());
        assert_eq!(recorder.state(), RecordingState::Idle);
        assert!(recorder.recorded().is_none());
    }

    #[test]
    fn timer_only_runs_while_recording() {
        let mut recorder = Recorder::new("video/webm");
        recorder.tick();
        recorder.start();
        for _ in 0..65 {
            recorder.tick();
        }
        recorder.stop();
        recorder.tick();
        assert_eq!(recorder.elapsed_secs(), 65);
        assert_eq!(format_elapsed(recorder.elapsed_secs()), "01:05");
        assert_eq!(format_elapsed(0), "00:00");
        assert_eq!(format_elapsed(3599), "59:59");
    }
}
