//! Internal event representation produced by the decoders.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

pub mod error;
pub mod labels;
pub mod metadata;
pub mod metricset;
pub mod span;
pub mod transaction;

pub use error::{ErrorEvent, Exception, Log};
pub use labels::{apply_tags, Labels, NumericLabels};
pub use metadata::{Agent, Client, Host, Metadata, NameVersion, Process, Service, User};
pub use metricset::{Metricset, MetricsetSample, SpanRef, TransactionRef};
pub use span::Span;
pub use transaction::{SpanCount, Transaction, TransactionMark, TransactionMarks, UserExperience};

/// Decoded events forwarded together. Ownership moves to the batch processor.
pub type Batch = Vec<Event>;

/// Stream-scoped template copied into every event decoded from one stream.
///
/// The metadata is shared behind an `Arc` since nothing mutates it after the metadata
/// line has been read. The label maps are owned: each decoded document starts from its
/// own clone so that per-event tags never leak into sibling events.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BaseEvent {
    pub metadata: Arc<Metadata>,
    /// Time the request was received, used when a document carries no timestamp.
    pub timestamp: Option<OffsetDateTime>,
    pub client: Option<Client>,
    pub labels: Labels,
    pub numeric_labels: NumericLabels,
}

impl BaseEvent {
    pub fn new(timestamp: OffsetDateTime) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..Default::default()
        }
    }

    pub fn into_event(self, data: EventData) -> Event {
        Event {
            timestamp: self.timestamp,
            metadata: self.metadata,
            client: self.client,
            trace_id: None,
            parent_id: None,
            labels: self.labels,
            numeric_labels: self.numeric_labels,
            data,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Event {
    #[serde(with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
    pub metadata: Arc<Metadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<Client>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Labels::is_empty")]
    pub labels: Labels,
    #[serde(skip_serializing_if = "NumericLabels::is_empty")]
    pub numeric_labels: NumericLabels,
    #[serde(flatten)]
    pub data: EventData,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self.data {
            EventData::Error(_) => EventKind::Error,
            EventData::Metricset(_) => EventKind::Metricset,
            EventData::Span(_) => EventKind::Span,
            EventData::Transaction(_) => EventKind::Transaction,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventData {
    Error(ErrorEvent),
    Metricset(Metricset),
    Span(Span),
    Transaction(Transaction),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Error,
    Metricset,
    Span,
    Transaction,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Error => "error",
            EventKind::Metricset => "metricset",
            EventKind::Span => "span",
            EventKind::Transaction => "transaction",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events sampled at `rate` stand in for `1 / rate` events. A rate of 0 means the
/// event was not sampled at all and represents nothing.
pub fn representative_count(sample_rate: Option<f64>) -> f64 {
    match sample_rate {
        Some(rate) if rate > 0.0 => 1.0 / rate,
        Some(_) => 0.0,
        None => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[test]
    fn into_event_carries_base_fields() {
        let mut base = BaseEvent::new(datetime!(2024-01-02 03:04:05 UTC));
        base.labels.set("env", "prod");

        let event = base.into_event(EventData::Span(Span {
            id: "s1".into(),
            name: "SELECT".into(),
            r#type: "db".into(),
            ..Default::default()
        }));

        assert_eq!(event.kind(), EventKind::Span);
        assert_eq!(event.labels.get("env"), Some("prod"));
        assert_eq!(event.timestamp, Some(datetime!(2024-01-02 03:04:05 UTC)));
    }

    #[test]
    fn serializes_payload_under_kind_key() {
        let event = BaseEvent::default().into_event(EventData::Transaction(Transaction {
            id: "t1".into(),
            r#type: "request".into(),
            ..Default::default()
        }));

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["transaction"]["id"], json!("t1"));
        assert!(value.get("labels").is_none());
    }

    #[test]
    fn representative_count_follows_sample_rate() {
        assert_eq!(representative_count(None), 1.0);
        assert_eq!(representative_count(Some(0.5)), 2.0);
        assert_eq!(representative_count(Some(0.0)), 0.0);
    }
}
