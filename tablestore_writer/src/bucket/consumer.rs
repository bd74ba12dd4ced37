use std::{future::Future, sync::Arc};

use tokio::{
    sync::{mpsc, oneshot},
    task::{JoinError, JoinSet},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::{
    BucketEntry,
    batcher::{Batch, BatchBuilder, BatchLimits, CloseReason},
};
use crate::{
    barrier::BarrierMarker,
    client::{BatchWriteRequest, SubmitError, WriteClient},
    config::{BatchRequestType, WriteMode},
    fanout::ResultFanout,
    governor::{ConcurrencyGovernor, InFlightPermit},
    result::{RowFailure, RowOutcome},
    statistics::WriterStatistics,
};

/// The dependencies shared by every bucket consumer of a writer.
#[derive(Debug, Clone)]
pub(crate) struct ConsumerContext {
    pub(crate) client: Arc<dyn WriteClient>,
    pub(crate) governor: Arc<ConcurrencyGovernor>,
    pub(crate) fanout: Arc<ResultFanout>,
    pub(crate) statistics: Arc<WriterStatistics>,
    pub(crate) write_mode: WriteMode,
    pub(crate) request_type: BatchRequestType,
    pub(crate) limits: BatchLimits,
    pub(crate) shutdown: CancellationToken,
}

/// Drains one bucket queue into batches and submits them.
///
/// Entries are processed strictly in queue order. Each closed batch is sent
/// by its own task, spawned only once an in-flight permit is held; in
/// [`WriteMode::Sequential`] the consumer also waits for the batch result
/// before taking the next entry.
///
/// On shutdown the consumer stops accepting entries, submits everything
/// still queued and waits for every outstanding batch to resolve.
#[derive(Debug)]
pub(crate) struct BucketConsumer {
    index: usize,
    rx: mpsc::Receiver<BucketEntry>,
    builder: BatchBuilder,
    ctx: ConsumerContext,
    in_flight: JoinSet<()>,
}

impl BucketConsumer {
    pub(crate) fn new(index: usize, rx: mpsc::Receiver<BucketEntry>, ctx: ConsumerContext) -> Self {
        Self {
            index,
            rx,
            builder: BatchBuilder::new(ctx.limits),
            ctx,
            in_flight: JoinSet::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(bucket = self.index, "bucket consumer started");

        loop {
            let linger = self.builder.linger_deadline();

            tokio::select! {
                biased;

                _ = self.ctx.shutdown.cancelled() => break,

                entry = self.rx.recv() => match entry {
                    Some(entry) => self.on_entry(entry).await,
                    None => break,
                },

                _ = sleep_until(linger) => {
                    self.close_batch(CloseReason::Linger).await;
                }

                Some(res) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    log_join(self.index, res);
                }
            }
        }

        // Refuse new entries, then submit everything that made it into the
        // queue.
        self.rx.close();
        while let Some(entry) = self.rx.recv().await {
            self.on_entry(entry).await;
        }
        self.close_batch(CloseReason::Shutdown).await;
        self.drain_in_flight().await;

        debug!(bucket = self.index, "bucket consumer stopped");
    }

    async fn on_entry(&mut self, entry: BucketEntry) {
        match entry {
            BucketEntry::Row(row) => {
                if let Some(reason) = self.builder.must_close_before(&row) {
                    self.close_batch(reason).await;
                }
                self.builder.push(row);
                if let Some(reason) = self.builder.full() {
                    self.close_batch(reason).await;
                }
            }
            BucketEntry::Barrier(marker) => self.on_barrier(marker).await,
        }
    }

    /// Submit the open batch and wait for every outstanding batch of this
    /// bucket to resolve, then release `marker`.
    async fn on_barrier(&mut self, marker: BarrierMarker) {
        self.close_batch(CloseReason::Barrier).await;
        self.drain_in_flight().await;
        trace!(bucket = self.index, "bucket reached flush barrier");
        drop(marker);
    }

    /// Close the open batch, if it holds any rows, and submit it.
    async fn close_batch(&mut self, reason: CloseReason) {
        let Some(batch) = self.builder.close(reason) else {
            return;
        };

        debug!(
            bucket = self.index,
            n_rows = batch.rows.len(),
            n_bytes = batch.bytes,
            n_columns = batch.columns,
            reason = %batch.reason,
            "submitting batch"
        );

        // Hold a permit before the batch leaves this consumer; waiting here
        // stops the queue draining when too many batches are outstanding.
        let permit = self.ctx.governor.acquire().await;

        let (result_tx, result_rx) = oneshot::channel();
        self.in_flight.spawn(send_batch(
            Arc::clone(&self.ctx.client),
            Arc::clone(&self.ctx.fanout),
            Arc::clone(&self.ctx.statistics),
            self.ctx.request_type,
            batch,
            permit,
            result_tx,
        ));

        if self.ctx.write_mode == WriteMode::Sequential {
            // An error means the send task panicked, which is logged when it
            // is reaped.
            let _ = result_rx.await;
        }

        // The queue arm of the select loop wins while rows keep arriving, so
        // finished sends are also reaped here.
        while let Some(res) = self.in_flight.try_join_next() {
            log_join(self.index, res);
        }
    }

    async fn drain_in_flight(&mut self) {
        while let Some(res) = self.in_flight.join_next().await {
            log_join(self.index, res);
        }
    }
}

/// Send `batch` and deliver its results.
///
/// `result_tx` fires once the outcome of every row is known, after which the
/// task waits for the result callback to finish with the batch.
async fn send_batch(
    client: Arc<dyn WriteClient>,
    fanout: Arc<ResultFanout>,
    statistics: Arc<WriterStatistics>,
    request_type: BatchRequestType,
    batch: Batch,
    permit: InFlightPermit,
    result_tx: oneshot::Sender<()>,
) {
    let Batch { rows, .. } = batch;
    let n_rows = rows.len();
    let request = BatchWriteRequest::new(
        request_type,
        rows.iter().map(|r| Arc::clone(&r.row)).collect(),
    );

    statistics.batch_sent(n_rows);
    let response = client.write_batch(request).await;
    drop(permit);

    let response = response.and_then(|resp| {
        if resp.len() == n_rows {
            Ok(resp)
        } else {
            Err(SubmitError::ResponseMismatch {
                want: n_rows,
                got: resp.len(),
            })
        }
    });

    let outcomes: Vec<RowOutcome> = match response {
        Ok(resp) => resp
            .into_results()
            .into_iter()
            .map(|r| r.map_err(RowFailure::from))
            .collect(),
        Err(e) => {
            warn!(error=%e, n_rows, "batch submission failed");
            statistics.batch_failed();
            let e = Arc::new(e);
            (0..n_rows)
                .map(|_| Err(RowFailure::Submission(Arc::clone(&e))))
                .collect()
        }
    };

    let callbacks_done = fanout.deliver(rows, outcomes);
    let _ = result_tx.send(());

    if let Some(done) = callbacks_done {
        // Dropped only if the callback job dies outside a callback.
        let _ = done.await;
    }
}

fn log_join(bucket: usize, res: Result<(), JoinError>) {
    if let Err(e) = res {
        error!(bucket, error=%e, "batch send task failed");
    }
}

fn sleep_until(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(d) => tokio::time::sleep_until(d).await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        barrier::FlushBarrier,
        bucket::Bucket,
        callback::CallbackExecutor,
        client::memory::InMemoryTableStore,
        result::PendingRow,
        row::{PrimaryKey, RowChange},
    };

    struct Harness {
        store: Arc<InMemoryTableStore>,
        bucket: Bucket,
        shutdown: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn context(
        store: &Arc<InMemoryTableStore>,
        write_mode: WriteMode,
        limits: BatchLimits,
        shutdown: &CancellationToken,
    ) -> ConsumerContext {
        ConsumerContext {
            client: Arc::clone(store) as _,
            governor: Arc::new(ConcurrencyGovernor::new(4)),
            fanout: Arc::new(ResultFanout::new(
                Default::default(),
                Default::default(),
                Arc::new(CallbackExecutor::new(1)),
            )),
            statistics: Default::default(),
            write_mode,
            request_type: BatchRequestType::BatchWriteRow,
            limits,
            shutdown: shutdown.clone(),
        }
    }

    fn harness(store: InMemoryTableStore, write_mode: WriteMode, limits: BatchLimits) -> Harness {
        let store = Arc::new(store);
        let shutdown = CancellationToken::new();
        let ctx = context(&store, write_mode, limits, &shutdown);
        let (bucket, rx) = Bucket::new(0, 16);
        let task = tokio::spawn(BucketConsumer::new(0, rx, ctx).run());
        Harness {
            store,
            bucket,
            shutdown,
            task,
        }
    }

    fn limits(max_rows: usize) -> BatchLimits {
        BatchLimits {
            max_rows,
            max_bytes: 1024 * 1024,
            max_columns: 1024,
            allow_duplicate_keys: true,
            max_linger: None,
        }
    }

    fn row(id: i64) -> BucketEntry {
        BucketEntry::Row(PendingRow::new(
            Arc::new(RowChange::put("t", PrimaryKey::new([("id", id)])).with_column("v", id)),
            None,
        ))
    }

    async fn flush(bucket: &Bucket) {
        let (barrier, mut markers) = FlushBarrier::new(1);
        bucket
            .enqueue(BucketEntry::Barrier(markers.pop().unwrap()))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), barrier.wait())
            .await
            .expect("flush completes");
    }

    #[tokio::test]
    async fn test_barrier_closes_partial_batch() {
        let h = harness(InMemoryTableStore::default(), WriteMode::Parallel, limits(3));
        for id in 0..5 {
            h.bucket.enqueue(row(id)).await.unwrap();
        }
        flush(&h.bucket).await;

        // Batches may reach the store in any order in parallel mode.
        let mut sizes = h.store.batch_sizes();
        sizes.sort_unstable();
        assert_eq!(sizes, [2, 3]);
        assert_eq!(h.store.row_count("t"), 5);
        assert!(h.store.requests().iter().all(|r| r.finished.is_some()));
    }

    #[tokio::test]
    async fn test_shutdown_submits_queued_rows() {
        let h = harness(InMemoryTableStore::default(), WriteMode::Parallel, limits(100));
        for id in 0..5 {
            h.bucket.enqueue(row(id)).await.unwrap();
        }
        h.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), h.task)
            .await
            .expect("consumer stops")
            .unwrap();

        assert_eq!(h.store.row_count("t"), 5);
        assert!(h.bucket.enqueue(row(6)).await.is_err());
    }

    #[tokio::test]
    async fn test_sequential_batches_do_not_overlap() {
        let h = harness(
            InMemoryTableStore::default().with_latency(Duration::from_millis(5)),
            WriteMode::Sequential,
            limits(1),
        );
        for id in 0..4 {
            h.bucket.enqueue(row(id)).await.unwrap();
        }
        flush(&h.bucket).await;

        assert_eq!(h.store.peak_in_progress(), 1);
        let requests = h.store.requests();
        for pair in requests.windows(2) {
            assert!(pair[1].started >= pair[0].finished.unwrap());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_linger_closes_batch() {
        let h = harness(
            InMemoryTableStore::default(),
            WriteMode::Parallel,
            BatchLimits {
                max_linger: Some(Duration::from_millis(20)),
                ..limits(100)
            },
        );
        h.bucket.enqueue(row(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.store.batch_sizes(), [1]);
    }

    #[tokio::test]
    async fn test_finished_sends_are_reaped_between_barriers() {
        let store = Arc::new(InMemoryTableStore::default());
        let shutdown = CancellationToken::new();
        let ctx = context(&store, WriteMode::Sequential, limits(1), &shutdown);
        let (_bucket, rx) = Bucket::new(0, 16);
        let mut consumer = BucketConsumer::new(0, rx, ctx);

        for id in 0..10 {
            consumer.on_entry(row(id)).await;
        }

        assert!(consumer.in_flight.len() <= 1, "{}", consumer.in_flight.len());
        while consumer.in_flight.join_next().await.is_some() {}
        assert_eq!(store.batch_sizes().len(), 10);
    }
}
