use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::model::Batch;
use crate::prometheus::report_dropped_events;
use crate::sinks::{BatchProcessor, ProcessorError};

/// Bounded buffer in front of a slower processor.
///
/// Request handlers enqueue batches and return as soon as there is room. A single
/// drain task forwards them downstream in FIFO order. When the buffer stays full for
/// longer than `send_timeout`, the batch is refused with [`ProcessorError::Full`].
pub struct QueueSink {
    sender: mpsc::Sender<Batch>,
    capacity: usize,
    send_timeout: Duration,
}

/// Handle on the drain task. Resolves once every queued batch has been forwarded.
pub struct QueueDrain {
    handle: JoinHandle<()>,
}

impl QueueSink {
    pub fn spawn(
        downstream: Arc<dyn BatchProcessor>,
        capacity: usize,
        send_timeout: Duration,
    ) -> (Self, QueueDrain) {
        let (sender, mut receiver) = mpsc::channel::<Batch>(capacity);

        let handle = tokio::spawn(async move {
            while let Some(batch) = receiver.recv().await {
                let size = batch.len();
                if let Err(err) = downstream.process_batch(batch).await {
                    error!("failed to publish batch of {size} events: {err}");
                    report_dropped_events("publish_failed", size as u64);
                }
            }
            info!("publish queue drained");
        });

        let sink = Self {
            sender,
            capacity,
            send_timeout,
        };
        (sink, QueueDrain { handle })
    }
}

#[async_trait]
impl BatchProcessor for QueueSink {
    async fn process_batch(&self, batch: Batch) -> Result<(), ProcessorError> {
        let size = batch.len();
        match tokio::time::timeout(self.send_timeout, self.sender.send(batch)).await {
            Ok(Ok(())) => {
                counter!("intake_events_queued_total").increment(size as u64);
                let depth = self.capacity.saturating_sub(self.sender.capacity());
                gauge!("intake_queue_depth").set(depth as f64);
                Ok(())
            }
            Ok(Err(_)) => Err(ProcessorError::Closed),
            Err(_) => {
                report_dropped_events("queue_full", size as u64);
                Err(ProcessorError::Full)
            }
        }
    }
}

impl QueueDrain {
    /// Waits for the drain task to finish. It only finishes once every [`QueueSink`]
    /// feeding it has been dropped.
    pub async fn wait(self) {
        if let Err(err) = self.handle.await {
            error!("publish queue task failed: {err}");
        }
    }
}
