//! Delivery of batch results to row futures, statistics and the result
//! callback.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::{error, warn};

use crate::{
    callback::{CallbackExecutor, ResultCallback},
    result::{PendingRow, RowOutcome},
    row::RowChange,
    statistics::WriterStatistics,
};

/// The result callback currently registered with a writer, if any.
pub(crate) type CallbackSlot = Arc<RwLock<Option<Arc<dyn ResultCallback>>>>;

#[derive(Debug)]
pub(crate) struct ResultFanout {
    statistics: Arc<WriterStatistics>,
    callback: CallbackSlot,
    executor: Arc<CallbackExecutor>,
}

impl ResultFanout {
    pub(crate) fn new(
        statistics: Arc<WriterStatistics>,
        callback: CallbackSlot,
        executor: Arc<CallbackExecutor>,
    ) -> Self {
        Self {
            statistics,
            callback,
            executor,
        }
    }

    /// Record the outcome of every row of a batch, complete any row futures
    /// and schedule the result callback.
    ///
    /// `outcomes` matches `rows` positionally. The callback registered at the
    /// time of this call receives every row of the batch, in batch order.
    ///
    /// If a callback was scheduled, the returned receiver completes once it
    /// has been invoked for every row.
    pub(crate) fn deliver(
        &self,
        rows: Vec<PendingRow>,
        outcomes: Vec<RowOutcome>,
    ) -> Option<oneshot::Receiver<()>> {
        debug_assert_eq!(rows.len(), outcomes.len());

        let callback = self.callback.read().clone();

        let mut results: Vec<(Arc<RowChange>, RowOutcome)> = Vec::with_capacity(rows.len());
        for (row, outcome) in rows.into_iter().zip(outcomes) {
            match &outcome {
                Ok(_) => self.statistics.row_succeeded(),
                Err(_) => self.statistics.row_failed(),
            }
            if let Some(sink) = row.sink {
                // The caller may have dropped the future.
                let _ = sink.send(outcome.clone());
            }
            if callback.is_some() {
                results.push((row.row, outcome));
            }
        }

        let callback = callback?;
        let (done_tx, done_rx) = oneshot::channel();
        let job = Box::new(move || {
            for (row, outcome) in &results {
                // A panic on one row must not cost the rest of the batch its
                // callback.
                let invoke = AssertUnwindSafe(|| match outcome {
                    Ok(ack) => callback.on_completed(row, ack),
                    Err(e) => callback.on_failed(row, e),
                });
                if catch_unwind(invoke).is_err() {
                    error!(
                        table = row.table_name(),
                        succeeded = outcome.is_ok(),
                        "result callback panicked"
                    );
                }
            }
            let _ = done_tx.send(());
        });

        if let Err(job) = self.executor.submit(job) {
            warn!("callback executor is shut down, invoking result callback inline");
            job();
        }

        Some(done_rx)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        callback::FnCallback,
        client::RemoteRowError,
        result::{RowAck, RowFailure},
        row::PrimaryKey,
    };

    fn pending(id: i64) -> (PendingRow, oneshot::Receiver<RowOutcome>) {
        let (tx, rx) = oneshot::channel();
        let row = Arc::new(RowChange::delete("t", PrimaryKey::new([("id", id)])));
        (PendingRow::new(row, Some(tx)), rx)
    }

    fn outcomes() -> Vec<RowOutcome> {
        vec![
            Ok(RowAck::default()),
            Err(RowFailure::Remote(RemoteRowError::new("E", "rejected"))),
        ]
    }

    #[tokio::test]
    async fn test_deliver_without_callback() {
        let stats = Arc::new(WriterStatistics::default());
        let fanout = ResultFanout::new(
            Arc::clone(&stats),
            Default::default(),
            Arc::new(CallbackExecutor::new(1)),
        );

        let (a, a_rx) = pending(1);
        let (b, b_rx) = pending(2);
        assert!(fanout.deliver(vec![a, b], outcomes()).is_none());

        assert_matches!(a_rx.await, Ok(Ok(_)));
        assert_matches!(b_rx.await, Ok(Err(RowFailure::Remote(_))));
        let s = stats.snapshot();
        assert_eq!((s.rows_succeeded, s.rows_failed), (1, 1));
    }

    #[tokio::test]
    async fn test_deliver_with_callback() {
        let calls = Arc::new(parking_lot::Mutex::new(vec![]));
        let cb: Arc<dyn ResultCallback> = Arc::new(FnCallback::new({
            let calls = Arc::clone(&calls);
            move |row, outcome| calls.lock().push((row.primary_key().clone(), outcome.is_ok()))
        }));

        let executor = Arc::new(CallbackExecutor::new(1));
        let fanout = ResultFanout::new(
            Default::default(),
            Arc::new(RwLock::new(Some(cb))),
            Arc::clone(&executor),
        );

        let (a, _a_rx) = pending(1);
        let (b, _b_rx) = pending(2);
        let done = fanout.deliver(vec![a, b], outcomes()).unwrap();
        done.await.unwrap();

        assert_eq!(
            *calls.lock(),
            [
                (PrimaryKey::new([("id", 1_i64)]), true),
                (PrimaryKey::new([("id", 2_i64)]), false)
            ]
        );

        // Once the executor is gone the callback still runs, on this thread.
        executor.shutdown();
        let (c, _c_rx) = pending(3);
        let done = fanout.deliver(vec![c], vec![Ok(RowAck::default())]).unwrap();
        done.await.unwrap();
        assert_eq!(calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_skip_rows() {
        let calls = Arc::new(parking_lot::Mutex::new(vec![]));
        let cb: Arc<dyn ResultCallback> = Arc::new(FnCallback::new({
            let calls = Arc::clone(&calls);
            move |row, _| {
                let key = row.primary_key().clone();
                calls.lock().push(key.clone());
                if key == PrimaryKey::new([("id", 0_i64)]) {
                    panic!("callback failure");
                }
            }
        }));

        let executor = Arc::new(CallbackExecutor::new(1));
        let fanout = ResultFanout::new(
            Default::default(),
            Arc::new(RwLock::new(Some(cb))),
            Arc::clone(&executor),
        );

        let (rows, _rxs): (Vec<_>, Vec<_>) = (0..5).map(pending).unzip();
        let done = fanout
            .deliver(rows, (0..5).map(|_| Ok(RowAck::default())).collect())
            .unwrap();
        done.await.unwrap();
        assert_eq!(calls.lock().len(), 5);

        // The inline path after shutdown is guarded the same way.
        executor.shutdown();
        let (rows, _rxs): (Vec<_>, Vec<_>) = [0, 1].into_iter().map(pending).unzip();
        let done = fanout
            .deliver(rows, vec![Ok(RowAck::default()), Ok(RowAck::default())])
            .unwrap();
        done.await.unwrap();
        assert_eq!(calls.lock().len(), 7);
    }
}
