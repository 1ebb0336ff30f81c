#![allow(dead_code)]

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use time::macros::datetime;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, ReadBuf};

use intake::admission::AdmissionSemaphore;
use intake::model::{Batch, Event, EventData};
use intake::sinks::{BatchProcessor, ProcessorError};
use intake::time::TimeSource;

pub const METADATA: &str = r#"{"metadata": {"service": {"name": "checkout", "environment": "test", "agent": {"name": "go", "version": "2.5.0"}}, "labels": {"team": "payments"}}}"#;

pub const RUM_V3_METADATA: &str =
    r#"{"m": {"se": {"n": "storefront", "a": {"n": "rum-js", "ve": "5.16.0"}}}}"#;

pub const REQUEST_TIME: OffsetDateTime = datetime!(2024-03-01 09:30 UTC);

#[derive(Clone)]
pub struct FixedTime {
    pub time: OffsetDateTime,
}

impl Default for FixedTime {
    fn default() -> Self {
        Self { time: REQUEST_TIME }
    }
}

impl TimeSource for FixedTime {
    fn current_time(&self) -> OffsetDateTime {
        self.time
    }
}

/// Records every batch it receives. Can be made slow, or made to fail after a number of
/// batches, to exercise backpressure and downstream failures.
#[derive(Clone, Default)]
pub struct MemorySink {
    batches: Arc<Mutex<Vec<Batch>>>,
    delay: Option<Duration>,
    fail_after: Option<usize>,
    failure: Option<ProcessorError>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    admission: Option<AdmissionSemaphore>,
    admitted: Arc<Mutex<Vec<usize>>>,
}

impl MemorySink {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    /// Slow sink that also records how many admission slots are taken whenever a batch
    /// arrives.
    pub fn watching(admission: AdmissionSemaphore, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            admission: Some(admission),
            ..Default::default()
        }
    }

    /// Accepts `batches` batches, then fails every call with `failure`.
    pub fn failing_after(batches: usize, failure: ProcessorError) -> Self {
        Self {
            fail_after: Some(batches),
            failure: Some(failure),
            ..Default::default()
        }
    }

    pub fn batches(&self) -> Vec<Batch> {
        self.batches.lock().unwrap().clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches().iter().map(Vec::len).collect()
    }

    pub fn events(&self) -> Vec<Event> {
        self.batches().into_iter().flatten().collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Slots in use at each observed batch.
    pub fn admitted(&self) -> Vec<usize> {
        self.admitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchProcessor for MemorySink {
    async fn process_batch(&self, batch: Batch) -> Result<(), ProcessorError> {
        if let Some(admission) = &self.admission {
            let taken = admission.capacity() - admission.available();
            self.admitted.lock().unwrap().push(taken);
        }
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut batches = self.batches.lock().unwrap();
        if let (Some(limit), Some(failure)) = (self.fail_after, &self.failure) {
            if batches.len() >= limit {
                return Err(failure.clone());
            }
        }
        batches.push(batch);
        Ok(())
    }
}

/// Serves `data`, then fails every further read.
pub struct FailingReader {
    data: Vec<u8>,
    pos: usize,
}

impl FailingReader {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
        }
    }
}

impl AsyncRead for FailingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos >= self.data.len() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        let end = self.data.len().min(self.pos + buf.remaining());
        buf.put_slice(&self.data[self.pos..end]);
        self.pos = end;
        Poll::Ready(Ok(()))
    }
}

pub fn span(id: &str) -> String {
    format!(
        r#"{{"span": {{"id": "{id}", "trace_id": "trace-1", "parent_id": "tx-1", "transaction_id": "tx-1", "name": "SELECT FROM orders", "type": "db", "subtype": "postgresql", "start": 1.5, "duration": 3.2}}}}"#
    )
}

pub fn transaction(id: &str) -> String {
    format!(
        r#"{{"transaction": {{"id": "{id}", "trace_id": "trace-1", "type": "request", "name": "POST /checkout", "duration": 42.0, "span_count": {{"started": 1}}}}}}"#
    )
}

pub fn tagged_transaction(id: &str, key: &str, value: &str) -> String {
    format!(
        r#"{{"transaction": {{"id": "{id}", "trace_id": "trace-1", "type": "request", "duration": 1.0, "span_count": {{"started": 0}}, "context": {{"tags": {{"{key}": "{value}"}}}}}}}}"#
    )
}

/// Joins documents into an NDJSON body.
pub fn ndjson<S: AsRef<str>>(lines: &[S]) -> String {
    let mut body = lines
        .iter()
        .map(|line| line.as_ref())
        .collect::<Vec<_>>()
        .join("\n");
    body.push('\n');
    body
}

/// Identifier of the decoded payload, whatever its kind.
pub fn event_id(event: &Event) -> &str {
    match &event.data {
        EventData::Error(error) => &error.id,
        EventData::Span(span) => &span.id,
        EventData::Transaction(transaction) => &transaction.id,
        EventData::Metricset(_) => "",
    }
}
