//! Running counters describing the work a writer has done.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters, updated lock-free from every stage of the pipeline.
#[derive(Debug, Default)]
pub struct WriterStatistics {
    rows_accepted: AtomicU64,
    rows_dirty: AtomicU64,
    rows_flushed: AtomicU64,
    rows_succeeded: AtomicU64,
    rows_failed: AtomicU64,
    batches_sent: AtomicU64,
    batches_failed: AtomicU64,
    flushes: AtomicU64,
}

impl WriterStatistics {
    pub(crate) fn row_accepted(&self) {
        self.rows_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn row_dirty(&self) {
        self.rows_dirty.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn row_succeeded(&self) {
        self.rows_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn row_failed(&self) {
        self.rows_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn batch_sent(&self, n_rows: usize) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.rows_flushed.fetch_add(n_rows as u64, Ordering::Relaxed);
    }

    pub(crate) fn batch_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn flushed(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// A point-in-time copy of every counter.
    ///
    /// Counters are read individually, so a snapshot taken while rows are
    /// moving may not be perfectly consistent across fields.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            rows_accepted: self.rows_accepted.load(Ordering::Relaxed),
            rows_dirty: self.rows_dirty.load(Ordering::Relaxed),
            rows_flushed: self.rows_flushed.load(Ordering::Relaxed),
            rows_succeeded: self.rows_succeeded.load(Ordering::Relaxed),
            rows_failed: self.rows_failed.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

/// See [`WriterStatistics::snapshot()`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    /// Rows that passed validation and were enqueued.
    pub rows_accepted: u64,
    /// Rows rejected by validation.
    pub rows_dirty: u64,
    /// Rows handed to the write client as part of a batch.
    pub rows_flushed: u64,
    pub rows_succeeded: u64,
    pub rows_failed: u64,
    /// Batches handed to the write client.
    pub batches_sent: u64,
    /// Batches whose submission failed as a whole.
    pub batches_failed: u64,
    pub flushes: u64,
}

impl StatisticsSnapshot {
    /// Accepted rows with no outcome yet.
    pub fn rows_pending(&self) -> u64 {
        self.rows_accepted
            .saturating_sub(self.rows_succeeded + self.rows_failed)
    }
}
