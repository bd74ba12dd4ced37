//! The flush barrier shared by every bucket taking part in a flush.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tokio::sync::Notify;

/// Counts down as each bucket reaches a flush barrier.
///
/// A flush creates one [`FlushBarrier`] and places a [`BarrierMarker`] in the
/// queue of every bucket. A bucket consumer drops its marker once every entry
/// ahead of it has been submitted and resolved, and [`FlushBarrier::wait()`]
/// returns once every marker is gone.
///
/// Markers arrive on drop, so a marker discarded with its queue (for example
/// because the consumer stopped) never leaves a flush waiting forever.
#[derive(Debug)]
pub(crate) struct FlushBarrier {
    remaining: AtomicUsize,
    notify: Notify,
}

impl FlushBarrier {
    /// Create a barrier expecting `n` markers, returning the markers.
    pub(crate) fn new(n: usize) -> (Arc<Self>, Vec<BarrierMarker>) {
        let barrier = Arc::new(Self {
            remaining: AtomicUsize::new(n),
            notify: Notify::new(),
        });
        let markers = (0..n)
            .map(|_| BarrierMarker(Arc::clone(&barrier)))
            .collect();
        (barrier, markers)
    }

    /// The number of markers that have not yet arrived.
    pub(crate) fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Wait for every marker to arrive.
    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before checking the count, so an arrival
            // between the check and the await is not missed.
            notified.as_mut().enable();

            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn arrive(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }
}

/// One bucket's share of a [`FlushBarrier`].
#[derive(Debug)]
pub(crate) struct BarrierMarker(Arc<FlushBarrier>);

impl Drop for BarrierMarker {
    fn drop(&mut self) {
        self.0.arrive();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::FutureExt;

    use super::*;

    #[tokio::test]
    async fn test_waits_for_every_marker() {
        let (barrier, mut markers) = FlushBarrier::new(3);

        let mut wait = Box::pin(barrier.wait());
        assert!((&mut wait).now_or_never().is_none());

        markers.pop();
        markers.pop();
        assert_eq!(barrier.remaining(), 1);

        let m = markers.pop().unwrap();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(m);
        });

        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("barrier completes once every marker is dropped");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_barrier_is_complete() {
        let (barrier, markers) = FlushBarrier::new(0);
        assert!(markers.is_empty());
        barrier.wait().now_or_never().expect("nothing to wait for");
    }
}
