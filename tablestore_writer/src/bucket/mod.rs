//! Buckets: independent FIFO queues, each drained into batches by a single
//! consumer task.
//!
//! ```text
//!      producers
//!          │
//!          ▼
//!   ┌────────────┐   bounded queue    ┌──────────────┐    ┌─────────────┐
//!   │   Bucket   ├───────────────────▶│BucketConsumer├───▶│ BatchBuilder│
//!   └────────────┘  rows & barriers   └──────┬───────┘    └─────────────┘
//!                                            │ closed batch
//!                                            ▼
//!                                   governor permit ─▶ send task ─▶ fan-out
//! ```

pub(crate) mod batcher;
pub(crate) mod consumer;

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{barrier::BarrierMarker, result::PendingRow};

/// An entry in a bucket queue.
#[derive(Debug)]
pub(crate) enum BucketEntry {
    Row(PendingRow),
    /// Everything queued ahead of this marker must be resolved before it is
    /// dropped.
    Barrier(BarrierMarker),
}

/// The consumer of a bucket has stopped and the entry was not queued.
#[derive(Debug)]
pub(crate) struct BucketClosed(pub(crate) BucketEntry);

/// The reason an entry could not be queued without waiting.
#[derive(Debug)]
pub(crate) enum TryEnqueueError {
    Full(BucketEntry),
    Closed(BucketEntry),
}

/// The producer side of a bucket queue.
///
/// The queue holds at most `capacity` entries; producers wait (or fail, for
/// the non-waiting variants) once it is full.
#[derive(Debug)]
pub(crate) struct Bucket {
    index: usize,
    tx: mpsc::Sender<BucketEntry>,
}

impl Bucket {
    pub(crate) fn new(index: usize, capacity: usize) -> (Self, mpsc::Receiver<BucketEntry>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { index, tx }, rx)
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Queue `entry`, waiting for space if the queue is full.
    pub(crate) async fn enqueue(&self, entry: BucketEntry) -> Result<(), BucketClosed> {
        self.tx.send(entry).await.map_err(|e| BucketClosed(e.0))
    }

    /// Queue `entry` only if there is space right now.
    pub(crate) fn try_enqueue(&self, entry: BucketEntry) -> Result<(), TryEnqueueError> {
        self.tx.try_send(entry).map_err(|e| match e {
            TrySendError::Full(v) => TryEnqueueError::Full(v),
            TrySendError::Closed(v) => TryEnqueueError::Closed(v),
        })
    }

    /// Queue `entry`, blocking the calling thread until there is space.
    ///
    /// # Panics
    ///
    /// Panics if called from within an async execution context.
    pub(crate) fn blocking_enqueue(&self, entry: BucketEntry) -> Result<(), BucketClosed> {
        self.tx.blocking_send(entry).map_err(|e| BucketClosed(e.0))
    }

    /// The number of entries waiting in the queue.
    pub(crate) fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}
