//! A writer-wide bound on outstanding batches.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds the number of batches submitted to the write client but not yet
/// resolved, across every bucket of a writer.
///
/// A bucket consumer MUST obtain an [`InFlightPermit`] before submitting a
/// batch, and holds it until the batch result is known. Once the limit is
/// reached, consumers wait for a permit, which in turn stops them draining
/// their queues and pushes back on producers.
#[derive(Debug)]
pub(crate) struct ConcurrencyGovernor {
    sem: Arc<Semaphore>,
    max: usize,
}

impl ConcurrencyGovernor {
    pub(crate) fn new(max: usize) -> Self {
        assert_ne!(max, 0, "in-flight limit must be non-zero");
        Self {
            sem: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Wait for a free in-flight slot.
    pub(crate) async fn acquire(&self) -> InFlightPermit {
        let permit = Arc::clone(&self.sem)
            .acquire_owned()
            .await
            .expect("in-flight semaphore is never closed");
        InFlightPermit { _permit: permit }
    }

    /// The number of batches currently holding a permit.
    pub(crate) fn in_flight(&self) -> usize {
        self.max - self.sem.available_permits()
    }

    #[cfg(test)]
    pub(crate) fn max(&self) -> usize {
        self.max
    }
}

/// An in-flight slot, released on drop.
#[derive(Debug)]
pub(crate) struct InFlightPermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::FutureExt;

    use super::*;

    #[tokio::test]
    async fn test_bounds_permits() {
        let g = ConcurrencyGovernor::new(2);
        assert_eq!(g.max(), 2);

        let a = g.acquire().await;
        let _b = g.acquire().await;
        assert_eq!(g.in_flight(), 2);

        // A third acquire cannot complete until a permit is released.
        let mut third = Box::pin(g.acquire());
        assert!((&mut third).now_or_never().is_none());

        drop(a);
        let _c = tokio::time::timeout(Duration::from_secs(5), third)
            .await
            .expect("permit released");
        assert_eq!(g.in_flight(), 2);
    }
}
