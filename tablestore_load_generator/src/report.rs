//! The summary printed at the end of a run.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use tablestore_writer::{RowAck, RowChange, RowFailure, StatisticsSnapshot, WriterConfig};

/// Counts row outcomes as they arrive through the result callback.
#[derive(Debug, Default)]
pub(crate) struct OutcomeTally {
    succeeded: AtomicU64,
    consumed_write_units: AtomicU64,
    failures: Mutex<BTreeMap<String, u64>>,
}

impl OutcomeTally {
    pub(crate) fn record(&self, _row: &RowChange, outcome: Result<&RowAck, &RowFailure>) {
        match outcome {
            Ok(ack) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                self.consumed_write_units
                    .fetch_add(ack.consumed_write_units, Ordering::Relaxed);
            }
            Err(e) => {
                let code = match e {
                    RowFailure::Remote(e) => e.code.clone(),
                    RowFailure::Submission(_) => "submission".to_string(),
                    RowFailure::Dropped => "dropped".to_string(),
                };
                *self.failures.lock().entry(code).or_default() += 1;
            }
        }
    }

    pub(crate) fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub(crate) fn failed(&self) -> u64 {
        self.failures.lock().values().sum()
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Report {
    pub(crate) config: WriterConfig,
    pub(crate) producers: usize,
    pub(crate) rows_generated: u64,
    pub(crate) rows_rejected_by_validation: u64,
    pub(crate) elapsed_ms: u128,
    pub(crate) rows_per_second: f64,
    pub(crate) callback_succeeded: u64,
    pub(crate) callback_failed: u64,
    pub(crate) consumed_write_units: u64,
    pub(crate) failures_by_code: BTreeMap<String, u64>,
    pub(crate) requests: usize,
    pub(crate) mean_batch_rows: f64,
    pub(crate) peak_concurrent_requests: usize,
    pub(crate) statistics: StatisticsSnapshot,
}

impl Report {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: WriterConfig,
        producers: usize,
        rows_generated: u64,
        rows_rejected_by_validation: u64,
        elapsed: Duration,
        tally: &OutcomeTally,
        batch_sizes: &[usize],
        peak_concurrent_requests: usize,
        statistics: StatisticsSnapshot,
    ) -> Self {
        let secs = elapsed.as_secs_f64();
        let rows_per_second = if secs > 0.0 {
            rows_generated as f64 / secs
        } else {
            0.0
        };
        let mean_batch_rows = if batch_sizes.is_empty() {
            0.0
        } else {
            batch_sizes.iter().sum::<usize>() as f64 / batch_sizes.len() as f64
        };

        Self {
            config,
            producers,
            rows_generated,
            rows_rejected_by_validation,
            elapsed_ms: elapsed.as_millis(),
            rows_per_second,
            callback_succeeded: tally.succeeded(),
            callback_failed: tally.failed(),
            consumed_write_units: tally.consumed_write_units.load(Ordering::Relaxed),
            failures_by_code: tally.failures.lock().clone(),
            requests: batch_sizes.len(),
            mean_batch_rows,
            peak_concurrent_requests,
            statistics,
        }
    }

    /// Every accepted row has exactly one outcome.
    pub(crate) fn is_consistent(&self) -> bool {
        let s = &self.statistics;
        s.rows_pending() == 0
            && s.rows_accepted == s.rows_succeeded + s.rows_failed
            && self.callback_succeeded == s.rows_succeeded
            && self.callback_failed == s.rows_failed
            && s.rows_accepted + s.rows_dirty == self.rows_generated
    }

    pub(crate) fn to_json_string_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
