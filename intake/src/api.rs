use axum::http::header::{CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sinks::ProcessorError;
use crate::stream::{InvalidInputError, StreamError, StreamResult};

#[derive(Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct IngestResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorEntry>,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ErrorEntry {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
}

impl From<&InvalidInputError> for ErrorEntry {
    fn from(err: &InvalidInputError) -> Self {
        ErrorEntry {
            message: err.message.clone(),
            document: Some(err.document.clone()),
        }
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("invalid content type: '{0}'")]
    InvalidContentType(String),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl IngestError {
    pub fn status(&self) -> StatusCode {
        match self {
            IngestError::InvalidContentType(_) => StatusCode::BAD_REQUEST,
            IngestError::Stream(StreamError::InvalidInput(err)) if err.is_too_large() => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            IngestError::Stream(StreamError::InvalidInput(_) | StreamError::Read(_)) => {
                StatusCode::BAD_REQUEST
            }
            IngestError::Stream(StreamError::Cancelled)
            | IngestError::Stream(StreamError::Processor(
                ProcessorError::Full | ProcessorError::Closed,
            )) => StatusCode::SERVICE_UNAVAILABLE,
            IngestError::Stream(StreamError::Processor(ProcessorError::Failed(_))) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn to_metric_tag(&self) -> &'static str {
        match self {
            IngestError::InvalidContentType(_) => "invalid_content_type",
            IngestError::Stream(err) => err.to_metric_tag(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReplyBody {
    Empty,
    Message(String),
    Result(IngestResponse),
}

/// Response to an intake request. Rendered as pretty JSON when the client accepts it,
/// as plain text otherwise.
#[derive(Debug, PartialEq, Eq)]
pub struct Reply {
    pub status: StatusCode,
    pub body: ReplyBody,
    pub json: bool,
}

impl Reply {
    pub fn new(outcome: Result<(), IngestError>, result: &StreamResult, verbose: bool) -> Self {
        let (status, body) = match outcome {
            Ok(()) if !result.errors().is_empty() => {
                let status = if result.too_large() {
                    StatusCode::PAYLOAD_TOO_LARGE
                } else {
                    StatusCode::BAD_REQUEST
                };
                (
                    status,
                    ReplyBody::Result(IngestResponse {
                        accepted: Some(result.accepted()),
                        errors: result.errors().iter().map(ErrorEntry::from).collect(),
                    }),
                )
            }
            Ok(()) if verbose => (
                StatusCode::ACCEPTED,
                ReplyBody::Result(IngestResponse {
                    accepted: Some(result.accepted()),
                    errors: Vec::new(),
                }),
            ),
            Ok(()) => (StatusCode::ACCEPTED, ReplyBody::Empty),
            Err(err) => {
                let status = err.status();
                match err {
                    IngestError::Stream(StreamError::InvalidInput(invalid)) => (
                        status,
                        ReplyBody::Result(IngestResponse {
                            accepted: Some(result.accepted()),
                            errors: vec![ErrorEntry::from(&invalid)],
                        }),
                    ),
                    err => (status, ReplyBody::Message(err.to_string())),
                }
            }
        };
        Reply {
            status,
            body,
            json: false,
        }
    }

    pub fn json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

/// Clients get JSON if they ask for it, or for anything.
pub fn accepts_json(headers: &HeaderMap) -> bool {
    headers
        .get_all(axum::http::header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|accept| accept.contains("*/*") || accept.contains("application/json"))
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        let content_type = if self.json {
            "application/json"
        } else {
            "text/plain; charset=utf-8"
        };
        let rendered = match (&self.body, self.json) {
            (ReplyBody::Empty, _) => Ok(String::new()),
            (ReplyBody::Message(message), true) => {
                serde_json::to_string_pretty(&serde_json::json!({ "error": message }))
            }
            (ReplyBody::Message(message), false) => Ok(format!("{message}\n")),
            (ReplyBody::Result(response), true) => serde_json::to_string_pretty(response),
            (ReplyBody::Result(response), false) => serde_json::to_string(response),
        };
        let (status, body) = match rendered {
            Ok(body) => (self.status, body),
            Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };

        let mut response = (status, body).into_response();
        let headers = response.headers_mut();
        headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        if !matches!(self.body, ReplyBody::Empty) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        response
    }
}
