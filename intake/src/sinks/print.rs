use async_trait::async_trait;
use metrics::{counter, histogram};
use tracing::info;

use crate::model::Batch;
use crate::sinks::{BatchProcessor, ProcessorError};

/// Logs every event it receives. Used when no other downstream is configured.
pub struct PrintSink {}

#[async_trait]
impl BatchProcessor for PrintSink {
    async fn process_batch(&self, batch: Batch) -> Result<(), ProcessorError> {
        let span = tracing::span!(tracing::Level::INFO, "batch of events");
        let _enter = span.enter();

        histogram!("intake_batch_size").record(batch.len() as f64);
        counter!("intake_events_published_total").increment(batch.len() as u64);
        for event in batch {
            match serde_json::to_string(&event) {
                Ok(json) => info!(kind = %event.kind(), "event: {json}"),
                Err(err) => info!(kind = %event.kind(), "event could not be serialized: {err}"),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BaseEvent, EventData, Span};

    #[tokio::test]
    async fn accepts_any_batch() {
        let event = BaseEvent::default().into_event(EventData::Span(Span::default()));
        let sink = PrintSink {};

        assert_eq!(sink.process_batch(vec![event]).await, Ok(()));
        assert_eq!(sink.process_batch(Batch::new()).await, Ok(()));
    }
}
