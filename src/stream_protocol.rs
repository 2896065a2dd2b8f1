//! Framed event protocol spoken by the streaming endpoints.
//!
//! Responses are `text/event-stream` bodies. Every frame is
//!
//! ```text
//! event: <type>
//! data: <json>
//!
//! ```
//!
//! A stream opens with `start` (carrying the protocol version), carries any
//! number of `text-delta` frames and ends with exactly one of `finish` or
//! `error`. Lines starting with `:` are comments.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::STREAM_PROTOCOL_VERSION;
use crate::error::ErrorBody;

pub const CONTENT_TYPE: &str = "text/event-stream";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Start {
    pub version: u32,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextDelta {
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    /// Approximate usage at four characters per token
    pub fn estimate(prompt: &str, completion: &str) -> Self {
        Self {
            prompt_tokens: estimate_tokens(prompt),
            completion_tokens: estimate_tokens(completion),
        }
    }
}

pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    (chars + 3) / 4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finish {
    pub finish_reason: String,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start(Start),
    TextDelta(TextDelta),
    Finish(Finish),
    Error(ErrorBody),
}

impl StreamEvent {
    pub fn start(message_id: impl Into<String>) -> Self {
        StreamEvent::Start(Start {
            version: STREAM_PROTOCOL_VERSION,
            message_id: message_id.into(),
        })
    }

    pub fn text(text: impl Into<String>) -> Self {
        StreamEvent::TextDelta(TextDelta { text: text.into() })
    }

    pub fn finish(finish_reason: impl Into<String>, usage: Usage) -> Self {
        StreamEvent::Finish(Finish {
            finish_reason: finish_reason.into(),
            usage,
        })
    }

    pub fn error(error: impl Into<String>, details: impl ToString) -> Self {
        StreamEvent::Error(ErrorBody::new(error, Some(details.to_string())))
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            StreamEvent::Start(_) => "start",
            StreamEvent::TextDelta(_) => "text-delta",
            StreamEvent::Finish(_) => "finish",
            StreamEvent::Error(_) => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Finish(_) | StreamEvent::Error(_))
    }

    /// Render one frame
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        let data = match self {
            StreamEvent::Start(p) => serde_json::to_string(p)?,
            StreamEvent::TextDelta(p) => serde_json::to_string(p)?,
            StreamEvent::Finish(p) => serde_json::to_string(p)?,
            StreamEvent::Error(p) => serde_json::to_string(p)?,
        };
        Ok(Bytes::from(format!(
            "event: {}\ndata: {}\n\n",
            self.event_type(),
            data
        )))
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("stream frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("unknown stream event '{0}'")]
    UnknownEvent(String),
    #[error("unsupported stream protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid '{event}' payload: {source}")]
    InvalidPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("stream ended in the middle of a frame")]
    IncompleteFrame,
}

/// Incremental decoder, accepts the body split at arbitrary byte offsets
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every frame completed by them
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<StreamEvent>, ProtocolError> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8(line).map_err(|_| ProtocolError::InvalidUtf8)?;
            if let Some(event) = self.process_line(&line)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Flush at end of body; a half-received frame is an error
    pub fn finish(&mut self) -> Result<Vec<StreamEvent>, ProtocolError> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8(rest).map_err(|_| ProtocolError::InvalidUtf8)?;
            if let Some(event) = self.process_line(&line)? {
                events.push(event);
            }
        }
        if !self.data.is_empty() {
            if let Some(event) = self.dispatch()? {
                events.push(event);
            }
        } else if self.event.is_some() {
            return Err(ProtocolError::IncompleteFrame);
        }
        Ok(events)
    }

    fn process_line(&mut self, line: &str) -> Result<Option<StreamEvent>, ProtocolError> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return Ok(None);
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // id and retry are not used
            _ => {}
        }
        Ok(None)
    }

    fn dispatch(&mut self) -> Result<Option<StreamEvent>, ProtocolError> {
        let event = self.event.take();
        if self.data.is_empty() {
            return Ok(None);
        }
        let data = std::mem::take(&mut self.data).join("\n");
        let event = event.unwrap_or_else(|| "message".to_string());

        let invalid = |source: serde_json::Error| ProtocolError::InvalidPayload {
            event: event.clone(),
            source,
        };
        let decoded = match event.as_str() {
            "start" => {
                let start: Start = serde_json::from_str(&data).map_err(invalid)?;
                if start.version != STREAM_PROTOCOL_VERSION {
                    return Err(ProtocolError::UnsupportedVersion(start.version));
                }
                StreamEvent::Start(start)
            }
            "text-delta" => StreamEvent::TextDelta(serde_json::from_str(&data).map_err(invalid)?),
            "finish" => StreamEvent::Finish(serde_json::from_str(&data).map_err(invalid)?),
            "error" => StreamEvent::Error(serde_json::from_str(&data).map_err(invalid)?),
            _ => return Err(ProtocolError::UnknownEvent(event.clone())),
        };
        Ok(Some(decoded))
    }
}
