use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Error type used by the database layer
pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// Failures talking to the generative-AI provider
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP request to provider failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("provider response is missing {0}")]
    MissingField(&'static str),
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Other(String),
}

/// Failures of the upload-poll-stream pipeline
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("File path is required")]
    MissingFilePath,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("Provider failed to process file {name}")]
    ProcessingFailed { name: String },
    #[error("File {name} is still processing after {attempts} attempts ({elapsed:?})")]
    Timeout {
        name: String,
        attempts: u32,
        elapsed: Duration,
    },
    #[error("File {0} became ready without a uri")]
    MissingUri(String),
    #[error("Stream failed: {0}")]
    Stream(String),
}

/// JSON body of every error response and of the terminal `error` stream event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub timestamp: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, details: Option<String>) -> Self {
        Self {
            error: error.into(),
            details,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Errors returned across the HTTP boundary
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{error}: {details}")]
    Internal { error: String, details: String },
}

impl ApiError {
    pub fn internal(error: impl Into<String>, details: impl ToString) -> Self {
        ApiError::Internal {
            error: error.into(),
            details: details.to_string(),
        }
    }

    /// Map a pipeline failure, keeping input errors as 400
    pub fn from_analysis(error: &str, err: AnalysisError) -> Self {
        match err {
            AnalysisError::MissingFilePath => ApiError::BadRequest(err.to_string()),
            other => ApiError::internal(error, other),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::BadRequest(msg) | ApiError::NotFound(msg) | ApiError::Forbidden(msg) => {
                ErrorBody::new(msg, None)
            }
            ApiError::Internal { error, details } => {
                log::error!("{}: {}", error, details);
                ErrorBody::new(error, Some(details))
            }
        };
        (status, Json(body)).into_response()
    }
}

/// Camera and microphone acquisition failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("permission to use camera or microphone was denied")]
    PermissionDenied,
    #[error("device is already in use")]
    DeviceBusy,
    #[error("requested device was not found")]
    NotFound,
    #[error("stream is missing a {0} track")]
    MissingTrack(&'static str),
    #[error("{0}")]
    Other(String),
}

/// Failures seen by the client side of the pipeline
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("server rejected request: {0}")]
    Rejected(String),
    #[error(transparent)]
    Protocol(#[from] crate::stream_protocol::ProtocolError),
    #[error("stream reported an error: {0}")]
    Remote(String),
    #[error("stream ended without a finish event")]
    Truncated,
    #[error("{0}")]
    InvalidState(&'static str),
    #[error(transparent)]
    Capture(#[from] CaptureError),
}
