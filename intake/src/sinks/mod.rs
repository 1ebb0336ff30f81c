use async_trait::async_trait;
use thiserror::Error;

use crate::model::Batch;

pub mod print;
pub mod queue;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    #[error("queue is full")]
    Full,
    #[error("server is shutting down")]
    Closed,
    #[error("failed to process batch: {0}")]
    Failed(String),
}

/// Downstream consumer of decoded batches.
///
/// Implementations take ownership of the batch and may block to apply backpressure.
/// Errors are reserved for conditions that make the whole stream fail; malformed
/// documents never reach this point.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process_batch(&self, batch: Batch) -> Result<(), ProcessorError>;
}
