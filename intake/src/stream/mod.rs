//! Streaming NDJSON decoding.
//!
//! A [`Processor`] turns one request body into batches of events: it waits for an
//! admission slot, reads the mandatory metadata line, then decodes documents in
//! batches and forwards each batch before reading further. Malformed documents are
//! recorded in the [`StreamResult`] and skipped. Only a bad metadata line,
//! cancellation, a failing source or a failing downstream end the stream early.

use std::io;
use std::num::NonZeroUsize;

use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn, Span};

use crate::admission::{AdmissionCancelled, AdmissionSemaphore};
use crate::decoder::{self, Dialect};
use crate::model::{Batch, BaseEvent};
use crate::sinks::{BatchProcessor, ProcessorError};

pub mod reader;
pub mod result;

pub use reader::{ReadError, ReaderPool, StreamReader};
pub use result::{InvalidInputError, InvalidInputKind, StreamResult, ERRORS_LIMIT};

/// Idle readers kept per processor.
const MAX_IDLE_READERS: usize = 64;

/// Errors that end a stream. Everything decoded and forwarded before the error stays
/// accepted.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("request cancelled")]
    Cancelled,
    #[error(transparent)]
    InvalidInput(InvalidInputError),
    #[error("failed to read stream: {0}")]
    Read(#[source] io::Error),
    #[error(transparent)]
    Processor(#[from] ProcessorError),
}

impl From<AdmissionCancelled> for StreamError {
    fn from(_: AdmissionCancelled) -> Self {
        StreamError::Cancelled
    }
}

impl StreamError {
    pub fn to_metric_tag(&self) -> &'static str {
        match self {
            StreamError::Cancelled => "cancelled",
            StreamError::InvalidInput(_) => "invalid_metadata",
            StreamError::Read(_) => "read",
            StreamError::Processor(ProcessorError::Full) => "queue_full",
            StreamError::Processor(ProcessorError::Closed) => "shutting_down",
            StreamError::Processor(ProcessorError::Failed(_)) => "processor",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BatchStatus {
    More,
    Eof,
}

pub struct Processor {
    readers: ReaderPool,
    dialect: Dialect,
    semaphore: AdmissionSemaphore,
}

impl Processor {
    pub fn new(dialect: Dialect, max_event_size: usize, semaphore: AdmissionSemaphore) -> Self {
        Self {
            readers: ReaderPool::new(max_event_size, MAX_IDLE_READERS),
            dialect,
            semaphore,
        }
    }

    /// Processor for backend agents.
    pub fn backend(max_event_size: usize, semaphore: AdmissionSemaphore) -> Self {
        Self::new(Dialect::V2, max_event_size, semaphore)
    }

    pub fn rum_v2(max_event_size: usize, semaphore: AdmissionSemaphore) -> Self {
        Self::new(Dialect::V2, max_event_size, semaphore)
    }

    pub fn rum_v3(max_event_size: usize, semaphore: AdmissionSemaphore) -> Self {
        Self::new(Dialect::RumV3, max_event_size, semaphore)
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn readers(&self) -> &ReaderPool {
        &self.readers
    }

    /// Decodes `reader` into batches of up to `batch_size` documents and hands them to
    /// `processor` one at a time.
    ///
    /// `result` reflects exactly the events accepted downstream, whether or not an
    /// error is returned. The admission slot and the pooled reader are released on
    /// every exit path.
    #[instrument(skip_all, fields(dialect = ?self.dialect, accepted, invalid))]
    pub async fn handle_stream<R>(
        &self,
        cancel: &CancellationToken,
        base: BaseEvent,
        reader: R,
        batch_size: NonZeroUsize,
        processor: &dyn BatchProcessor,
        result: &mut StreamResult,
    ) -> Result<(), StreamError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let outcome = self
            .run(cancel, base, reader, batch_size, processor, result)
            .await;

        let span = Span::current();
        span.record("accepted", result.accepted());
        span.record("invalid", result.invalid());
        if let Err(err) = &outcome {
            warn!(error = %err, "stream aborted");
        }
        outcome
    }

    async fn run<R>(
        &self,
        cancel: &CancellationToken,
        mut base: BaseEvent,
        reader: R,
        batch_size: NonZeroUsize,
        processor: &dyn BatchProcessor,
        result: &mut StreamResult,
    ) -> Result<(), StreamError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let _permit = self.semaphore.acquire(cancel).await?;
        let mut reader = self.readers.get(Box::new(reader));

        self.read_metadata(&mut reader, &mut base).await?;

        loop {
            if cancel.is_cancelled() {
                return Err(StreamError::Cancelled);
            }

            let mut batch = Batch::with_capacity(batch_size.get());
            let (decoded, status) = self
                .read_batch(&base, batch_size, &mut batch, &mut reader, result)
                .await;
            if decoded > 0 {
                processor.process_batch(batch).await?;
                result.add_accepted(decoded);
            }
            match status? {
                BatchStatus::Eof => return Ok(()),
                BatchStatus::More => continue,
            }
        }
    }

    /// Decodes the first non-empty line into `base`. Any failure here ends the stream:
    /// events cannot be attributed without their metadata.
    async fn read_metadata(&self, reader: &mut StreamReader, base: &mut BaseEvent) -> Result<(), StreamError> {
        loop {
            let line = match reader.read_ahead().await {
                Ok(line) => line,
                Err(ReadError::LineTooLong) => {
                    return Err(StreamError::InvalidInput(InvalidInputError::too_large(
                        reader.latest_line(),
                    )))
                }
                Err(ReadError::Io(err)) => return Err(StreamError::Read(err)),
            };
            if line.is_empty() {
                if reader.is_eof() {
                    return Err(StreamError::InvalidInput(InvalidInputError::eof_metadata(
                        reader.latest_line(),
                    )));
                }
                continue;
            }

            return self.dialect.decode_metadata(line, base).map_err(|err| {
                let err = if err.is_truncated() {
                    InvalidInputError::eof_metadata(line)
                } else {
                    InvalidInputError::from_decode(&err, line)
                };
                StreamError::InvalidInput(err)
            });
        }
    }

    /// Decodes up to `batch_size` documents into `batch`, stopping early at the end of
    /// the stream. Before the end, every call consumes at least one line. Blank lines
    /// are skipped and do not count towards the batch size.
    ///
    /// The number of events appended is returned alongside the status: callers must
    /// forward those events before acting on an error.
    async fn read_batch(
        &self,
        base: &BaseEvent,
        batch_size: NonZeroUsize,
        batch: &mut Batch,
        reader: &mut StreamReader,
        result: &mut StreamResult,
    ) -> (usize, Result<BatchStatus, StreamError>) {
        let start = batch.len();
        let mut documents = 0;

        while documents < batch_size.get() && !reader.is_eof() {
            let line = match reader.read_ahead().await {
                Ok(line) => line,
                Err(ReadError::LineTooLong) => {
                    documents += 1;
                    let err = InvalidInputError::too_large(reader.latest_line());
                    debug!(error = %err.message, "rejected document");
                    result.limited_add(err);
                    continue;
                }
                Err(ReadError::Io(err)) => {
                    return (batch.len() - start, Err(StreamError::Read(err)));
                }
            };
            if line.is_empty() {
                continue;
            }
            documents += 1;

            // Each document starts from its own copy of the base so that labels set by
            // one event never show up on another.
            if let Err(err) = decoder::decode_document(line, base.clone(), batch) {
                let err = InvalidInputError::from_decode(&err, line);
                debug!(error = %err.message, "rejected document");
                result.limited_add(err);
            }
        }

        let status = if reader.is_eof() {
            BatchStatus::Eof
        } else {
            BatchStatus::More
        };
        (batch.len() - start, Ok(status))
    }
}
