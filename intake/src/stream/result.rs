use thiserror::Error;

use crate::decoder::DecodeError;

/// Number of per-document errors kept by default. Further errors are counted as
/// dropped but not recorded.
pub const ERRORS_LIMIT: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidInputKind {
    Decode,
    /// The document ended before it was complete.
    Truncated,
    TooLarge,
}

/// A malformed document, kept with the raw line that caused it.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
#[error("{message} [{document}]")]
pub struct InvalidInputError {
    pub kind: InvalidInputKind,
    pub message: String,
    pub document: String,
}

impl InvalidInputError {
    pub fn too_large(document: &[u8]) -> Self {
        Self {
            kind: InvalidInputKind::TooLarge,
            message: "event exceeded the permitted size.".to_string(),
            document: String::from_utf8_lossy(document).into_owned(),
        }
    }

    pub fn eof_metadata(document: &[u8]) -> Self {
        Self {
            kind: InvalidInputKind::Truncated,
            message: "EOF while reading metadata".to_string(),
            document: String::from_utf8_lossy(document).into_owned(),
        }
    }

    pub fn from_decode(err: &DecodeError, document: &[u8]) -> Self {
        let kind = if err.is_truncated() {
            InvalidInputKind::Truncated
        } else {
            InvalidInputKind::Decode
        };
        Self {
            kind,
            message: err.to_string(),
            document: String::from_utf8_lossy(document).into_owned(),
        }
    }

    pub fn is_too_large(&self) -> bool {
        self.kind == InvalidInputKind::TooLarge
    }
}

/// Outcome of one stream: how many events were handed downstream, and the first few
/// documents that were rejected.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamResult {
    accepted: usize,
    errors: Vec<InvalidInputError>,
    dropped_errors: usize,
    limit: usize,
}

impl Default for StreamResult {
    fn default() -> Self {
        Self::with_limit(ERRORS_LIMIT)
    }
}

impl StreamResult {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            accepted: 0,
            errors: Vec::new(),
            dropped_errors: 0,
            limit,
        }
    }

    /// Records `err` unless the limit has been reached. Returns whether it was kept.
    pub fn limited_add(&mut self, err: InvalidInputError) -> bool {
        if self.errors.len() >= self.limit {
            self.dropped_errors += 1;
            return false;
        }
        self.errors.push(err);
        true
    }

    pub fn add_accepted(&mut self, count: usize) {
        self.accepted += count;
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }

    pub fn errors(&self) -> &[InvalidInputError] {
        &self.errors
    }

    /// Rejected documents, including the ones past the limit.
    pub fn invalid(&self) -> usize {
        self.errors.len() + self.dropped_errors
    }

    pub fn too_large(&self) -> bool {
        self.errors.iter().any(InvalidInputError::is_too_large)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_message_and_document() {
        let err = InvalidInputError::too_large(b"{\"span\":");
        assert_eq!(err.to_string(), "event exceeded the permitted size. [{\"span\":]");
        assert!(err.is_too_large());
    }

    #[test]
    fn stops_recording_at_the_limit() {
        let mut result = StreamResult::default();
        for i in 0..ERRORS_LIMIT + 3 {
            let kept = result.limited_add(InvalidInputError::eof_metadata(i.to_string().as_bytes()));
            assert_eq!(kept, i < ERRORS_LIMIT);
        }

        assert_eq!(result.errors().len(), ERRORS_LIMIT);
        assert_eq!(result.invalid(), ERRORS_LIMIT + 3);
        assert_eq!(result.errors()[0].document, "0");
    }

    #[test]
    fn custom_limit() {
        let mut result = StreamResult::with_limit(1);
        result.limited_add(InvalidInputError::too_large(b"a"));
        result.limited_add(InvalidInputError::too_large(b"b"));

        assert_eq!(result.errors().len(), 1);
        assert!(result.too_large());
    }

    #[test]
    fn accepted_accumulates() {
        let mut result = StreamResult::default();
        result.add_accepted(3);
        result.add_accepted(2);
        assert_eq!(result.accepted(), 5);
        assert!(!result.too_large());
    }
}
