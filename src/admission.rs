use crate::error::{ProximityError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Load shedding in front of the engine.
///
/// At most `max_in_flight` requests run at once. Up to `max_queued` more
/// may wait, each for at most `queue_wait`; anything beyond that is
/// rejected immediately with [`ProximityError::Overloaded`].
pub struct Admission {
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    queued: AtomicUsize,
    max_queued: usize,
    queue_wait: Duration,
}

/// Held for the lifetime of an admitted request
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Admission {
    pub fn new(max_in_flight: usize, max_queued: usize, queue_wait: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            queued: AtomicUsize::new(0),
            max_queued,
            queue_wait,
        }
    }

    pub async fn acquire(&self) -> Result<AdmissionPermit> {
        if let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() {
            return Ok(AdmissionPermit { _permit: permit });
        }

        if self.queued.fetch_add(1, Ordering::AcqRel) >= self.max_queued {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            debug!(max_queued = self.max_queued, "admission queue full");
            return Err(ProximityError::Overloaded);
        }
        let _slot = QueueSlot(&self.queued);

        match tokio::time::timeout(self.queue_wait, Arc::clone(&self.permits).acquire_owned()).await
        {
            Ok(Ok(permit)) => Ok(AdmissionPermit { _permit: permit }),
            Ok(Err(_)) => Err(ProximityError::Closed),
            Err(_) => {
                debug!(wait = ?self.queue_wait, "admission wait expired");
                Err(ProximityError::Overloaded)
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.permits.available_permits()
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Stop admitting; waiters fail with `Closed`
    pub fn close(&self) {
        self.permits.close();
    }
}
