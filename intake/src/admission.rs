use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("cancelled while waiting for a decoder slot")]
pub struct AdmissionCancelled;

/// Process-wide cap on the number of streams being decoded at once.
///
/// Forwarding a batch downstream can block for a while under backpressure, so the
/// number of in-flight decodes is bounded here, independently of how many connections
/// the server accepts. Clones share the same slots: build one at startup and hand it to
/// every processor.
#[derive(Clone, Debug)]
pub struct AdmissionSemaphore {
    inner: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionSemaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Waits for a free slot. Waiters are served in FIFO order. Returns early, holding
    /// nothing, if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<AdmissionPermit, AdmissionCancelled> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AdmissionCancelled),
            permit = self.inner.clone().acquire_owned() => permit.map_err(|_| AdmissionCancelled)?,
        };
        self.report_saturation();
        Ok(AdmissionPermit {
            permit: Some(permit),
            semaphore: self.clone(),
        })
    }

    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn report_saturation(&self) {
        if self.capacity == 0 {
            return;
        }
        let in_use = self.capacity.saturating_sub(self.available());
        metrics::gauge!("intake_decoder_saturation_percent")
            .set(in_use as f64 / self.capacity as f64);
    }
}

/// A held slot. The slot is returned when this is dropped, whatever the exit path.
#[derive(Debug)]
pub struct AdmissionPermit {
    permit: Option<OwnedSemaphorePermit>,
    semaphore: AdmissionSemaphore,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        drop(self.permit.take());
        self.semaphore.report_saturation();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn permit_returns_slot_on_drop() {
        let semaphore = AdmissionSemaphore::new(2);
        let cancel = CancellationToken::new();

        let first = semaphore.acquire(&cancel).await.unwrap();
        let second = semaphore.acquire(&cancel).await.unwrap();
        assert_eq!(semaphore.available(), 0);

        drop(first);
        assert_eq!(semaphore.available(), 1);
        drop(second);
        assert_eq!(semaphore.available(), semaphore.capacity());
    }

    #[tokio::test]
    async fn cancellation_aborts_a_blocked_acquire() {
        let semaphore = AdmissionSemaphore::new(1);
        let cancel = CancellationToken::new();
        let held = semaphore.acquire(&cancel).await.unwrap();

        let waiter = {
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { semaphore.acquire(&cancel).await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert_eq!(waiter.await.unwrap(), Err(AdmissionCancelled));
        drop(held);
        assert_eq!(semaphore.available(), 1);
    }

    #[tokio::test]
    async fn already_cancelled_token_never_takes_a_slot() {
        let semaphore = AdmissionSemaphore::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(semaphore.acquire(&cancel).await.is_err());
        assert_eq!(semaphore.available(), 1);
    }
}
