//! Document classification and the per-dialect decoders.
//!
//! A document is routed by its root key, which is found with a cheap scan of the raw
//! bytes rather than a full parse. The chosen decoder then parses and validates the
//! whole document.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

use crate::model::{apply_tags, Batch, BaseEvent, EventKind};

pub mod rumv3;
pub mod v2;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("decode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{0}: did not recognize object type")]
    UnrecognizedObject(String),
}

impl DecodeError {
    /// True when the document ended before the JSON value was complete.
    pub fn is_truncated(&self) -> bool {
        matches!(self, DecodeError::Json(err) if err.is_eof())
    }
}

/// Wire format of the stream metadata, fixed per endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    V2,
    RumV3,
}

impl Dialect {
    pub fn decode_metadata(&self, line: &[u8], base: &mut BaseEvent) -> Result<(), DecodeError> {
        match self {
            Dialect::V2 => v2::decode_metadata(line, base),
            Dialect::RumV3 => rumv3::decode_metadata(line, base),
        }
    }
}

/// Every root key a document may start with, across both dialects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentType {
    V2(EventKind),
    RumV3Error,
    RumV3Transaction,
}

impl DocumentType {
    pub fn from_token(token: &[u8]) -> Option<Self> {
        let document_type = match token {
            b"error" => DocumentType::V2(EventKind::Error),
            b"metricset" => DocumentType::V2(EventKind::Metricset),
            b"span" => DocumentType::V2(EventKind::Span),
            b"transaction" => DocumentType::V2(EventKind::Transaction),
            b"e" => DocumentType::RumV3Error,
            b"x" => DocumentType::RumV3Transaction,
            _ => return None,
        };
        Some(document_type)
    }
}

/// Returns the bytes between the first quote character (`"` or `'`) and the next
/// occurrence of the same character, or an empty slice if there is none.
///
/// This assumes the root key is the first token of the document and holds no escaped
/// quotes. Decoders validate the full structure afterwards.
pub fn identify_event_type(body: &[u8]) -> &[u8] {
    let Some(start) = body.iter().position(|b| *b == b'"' || *b == b'\'') else {
        return &[];
    };
    let quote = body[start];
    let key = &body[start + 1..];
    match key.iter().position(|b| *b == quote) {
        Some(end) => &key[..end],
        None => &[],
    }
}

/// Decodes one document and appends the resulting events to `batch`. Nothing is
/// appended when an error is returned.
pub fn decode_document(line: &[u8], base: BaseEvent, batch: &mut Batch) -> Result<(), DecodeError> {
    let token = identify_event_type(line);
    match DocumentType::from_token(token) {
        Some(DocumentType::V2(EventKind::Error)) => v2::decode_error(line, base, batch),
        Some(DocumentType::V2(EventKind::Metricset)) => v2::decode_metricset(line, base, batch),
        Some(DocumentType::V2(EventKind::Span)) => v2::decode_span(line, base, batch),
        Some(DocumentType::V2(EventKind::Transaction)) => {
            v2::decode_transaction(line, base, batch)
        }
        Some(DocumentType::RumV3Error) => rumv3::decode_error(line, base, batch),
        Some(DocumentType::RumV3Transaction) => rumv3::decode_transaction(line, base, batch),
        None => Err(DecodeError::UnrecognizedObject(
            String::from_utf8_lossy(token).into_owned(),
        )),
    }
}

pub(crate) fn required<T>(value: Option<T>, field: &str) -> Result<T, DecodeError> {
    value.ok_or_else(|| DecodeError::Validation(format!("'{field}' required")))
}

pub(crate) fn timestamp_from_micros(micros: i64) -> Result<OffsetDateTime, DecodeError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1000)
        .map_err(|err| DecodeError::Validation(format!("timestamp: {err}")))
}

/// Request time shifted by an offset in milliseconds, for events that only carry a
/// start relative to their parent.
pub(crate) fn offset_timestamp(
    base: Option<OffsetDateTime>,
    offset_ms: Option<f64>,
) -> Option<OffsetDateTime> {
    let base = base?;
    match offset_ms {
        Some(ms) if ms.is_finite() => {
            let micros = (ms * 1000.0).round() as i64;
            base.checked_add(Duration::microseconds(micros))
        }
        _ => Some(base),
    }
}

pub(crate) fn apply_context_tags(
    base: &mut BaseEvent,
    tags: Option<&HashMap<String, Value>>,
    field: &str,
) -> Result<(), DecodeError> {
    let Some(tags) = tags else {
        return Ok(());
    };
    apply_tags(&mut base.labels, &mut base.numeric_labels, tags).map_err(|err| {
        DecodeError::Validation(format!(
            "{field}: unsupported value for label '{}'",
            err.key
        ))
    })
}

/// Identifiers may be sent as strings or numbers.
pub(crate) fn string_or_number(value: Option<Value>, field: &str) -> Result<Option<String>, DecodeError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(DecodeError::Validation(format!(
            "'{field}' must be a string or a number"
        ))),
    }
}
