//! The writer: admission, flush and close.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    barrier::FlushBarrier,
    bucket::{
        Bucket, BucketEntry, TryEnqueueError,
        batcher::BatchLimits,
        consumer::{BucketConsumer, ConsumerContext},
    },
    callback::{CallbackExecutor, ResultCallback},
    client::WriteClient,
    config::{ConfigError, WriterConfig},
    dispatcher::Dispatcher,
    error::{Result, WriterError},
    fanout::{CallbackSlot, ResultFanout},
    governor::ConcurrencyGovernor,
    result::{GroupFuture, PendingRow, RowFuture},
    row::RowChange,
    statistics::{StatisticsSnapshot, WriterStatistics},
    validator::{RowLimits, RowValidator, TableSchema, ValidationError},
};

/// The lifecycle state of a [`TableStoreWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Running,
    /// At least one flush (explicit or scheduled) is waiting on its barrier.
    Flushing,
    /// Terminal.
    Closed,
}

/// A row rejected by validation, returned to the caller of
/// [`TableStoreWriter::add_rows()`].
#[derive(Debug, Clone)]
pub struct DirtyRow {
    pub row: RowChange,
    pub error: ValidationError,
}

/// Whether the writer is responsible for shutting a dependency down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
    Owned,
    Shared,
}

/// Configures and starts a [`TableStoreWriter`].
#[derive(Debug)]
pub struct WriterBuilder {
    config: WriterConfig,
    client: Option<(Arc<dyn WriteClient>, Ownership)>,
    executor: Option<Arc<CallbackExecutor>>,
    schemas: Vec<TableSchema>,
    callback: Option<Arc<dyn ResultCallback>>,
}

impl WriterBuilder {
    pub fn new(config: WriterConfig) -> Self {
        Self {
            config,
            client: None,
            executor: None,
            schemas: vec![],
            callback: None,
        }
    }

    /// Send batches through `client`, which the caller keeps ownership of:
    /// closing the writer leaves it running.
    pub fn with_client(self, client: Arc<dyn WriteClient>) -> Self {
        Self {
            client: Some((client, Ownership::Shared)),
            ..self
        }
    }

    /// Send batches through `client`, shutting it down when the writer is
    /// closed.
    pub fn with_owned_client(self, client: Arc<dyn WriteClient>) -> Self {
        Self {
            client: Some((client, Ownership::Owned)),
            ..self
        }
    }

    /// Run result callbacks on `executor`, which the caller keeps ownership
    /// of.
    ///
    /// Without this, the writer starts its own executor of
    /// [`WriterConfig::callback_pool_size`] threads and stops it on close.
    pub fn with_callback_executor(self, executor: Arc<CallbackExecutor>) -> Self {
        Self {
            executor: Some(executor),
            ..self
        }
    }

    /// Register the primary key layout of a table. Once any schema is
    /// registered, rows for unregistered tables are rejected.
    pub fn with_table_schema(mut self, schema: TableSchema) -> Self {
        self.schemas.push(schema);
        self
    }

    pub fn with_result_callback(self, callback: Arc<dyn ResultCallback>) -> Self {
        Self {
            callback: Some(callback),
            ..self
        }
    }

    /// Start the writer's bucket consumers and background tasks.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn build(self) -> Result<TableStoreWriter> {
        let config = self.config;
        config.validate()?;

        let (client, client_ownership) = self.client.ok_or(ConfigError::MissingClient)?;
        let (executor, executor_ownership) = match self.executor {
            Some(e) => (e, Ownership::Shared),
            None => (
                Arc::new(CallbackExecutor::new(config.callback_pool_size)),
                Ownership::Owned,
            ),
        };

        let statistics = Arc::new(WriterStatistics::default());
        let callback: CallbackSlot = Arc::new(RwLock::new(self.callback));
        let governor = Arc::new(ConcurrencyGovernor::new(config.max_in_flight_batches));
        let shutdown = CancellationToken::new();

        let ctx = ConsumerContext {
            client: Arc::clone(&client),
            governor: Arc::clone(&governor),
            fanout: Arc::new(ResultFanout::new(
                Arc::clone(&statistics),
                Arc::clone(&callback),
                Arc::clone(&executor),
            )),
            statistics: Arc::clone(&statistics),
            write_mode: config.write_mode,
            request_type: config.batch_request_type,
            limits: BatchLimits::from(&config),
            shutdown: shutdown.clone(),
        };

        let mut tasks = Vec::with_capacity(config.bucket_count + 2);
        let buckets = (0..config.bucket_count)
            .map(|index| {
                let (bucket, rx) = Bucket::new(index, config.queue_capacity);
                let consumer = BucketConsumer::new(index, rx, ctx.clone());
                tasks.push(tokio::spawn(consumer.run()));
                bucket
            })
            .collect();

        let shared = Arc::new(Shared {
            buckets,
            statistics: Arc::clone(&statistics),
            flushes_in_progress: AtomicUsize::new(0),
        });

        tasks.push(tokio::spawn(background_flush(
            Arc::clone(&shared),
            config.flush_interval,
            shutdown.clone(),
        )));
        if let Some(interval) = config.statistics_log_interval {
            tasks.push(tokio::spawn(background_statistics_log(
                Arc::clone(&shared),
                Arc::clone(&governor),
                interval,
                shutdown.clone(),
            )));
        }

        // Log the important configuration parameters of the writer.
        info!(
            bucket_count = config.bucket_count,
            dispatch_policy = ?config.dispatch_policy,
            write_mode = ?config.write_mode,
            max_in_flight_batches = config.max_in_flight_batches,
            max_batch_rows = config.max_batch_rows,
            max_batch_bytes = config.max_batch_bytes,
            queue_capacity = config.queue_capacity,
            flush_interval = ?config.flush_interval,
            owned_client = client_ownership == Ownership::Owned,
            owned_executor = executor_ownership == Ownership::Owned,
            "started table store writer"
        );

        Ok(TableStoreWriter {
            validator: RowValidator::new(RowLimits::from(&config), self.schemas),
            dispatcher: Dispatcher::new(config.dispatch_policy, config.bucket_count),
            config,
            shared,
            callback,
            governor,
            client,
            client_ownership,
            executor,
            executor_ownership,
            closed: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }
}

/// State shared between the writer and its scheduled flush task.
#[derive(Debug)]
struct Shared {
    buckets: Box<[Bucket]>,
    statistics: Arc<WriterStatistics>,
    flushes_in_progress: AtomicUsize,
}

impl Shared {
    /// Place a barrier in every bucket and wait until every row queued ahead
    /// of it has a result and its callbacks have run.
    async fn flush(&self) {
        let _guard = FlushGuard::new(&self.flushes_in_progress);

        let (barrier, markers) = FlushBarrier::new(self.buckets.len());
        for (bucket, marker) in self.buckets.iter().zip(markers) {
            // The marker of a stopped bucket is dropped with the error, which
            // counts as its arrival.
            if bucket.enqueue(BucketEntry::Barrier(marker)).await.is_err() {
                debug!(bucket = bucket.index(), "bucket stopped before flush");
            }
        }
        barrier.wait().await;

        self.statistics.flushed();
    }

    fn queued(&self) -> usize {
        self.buckets.iter().map(Bucket::queued).sum()
    }
}

struct FlushGuard<'a>(&'a AtomicUsize);

impl<'a> FlushGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A batching writer for a remote table store.
///
/// Rows are validated synchronously, mapped to one of
/// [`WriterConfig::bucket_count`] buckets and queued. Each bucket drains its
/// queue into batches which are sent through the [`WriteClient`], with at most
/// [`WriterConfig::max_in_flight_batches`] outstanding across the writer.
///
/// ```text
///        add_row / try_add_row / add_rows_with_future ...
///                          │
///                    RowValidator ──▶ dirty rows returned to the caller
///                          │
///                     Dispatcher
///              ┌───────────┼───────────┐
///              ▼           ▼           ▼
///         ┌────────┐  ┌────────┐  ┌────────┐
///         │Bucket 0│  │Bucket 1│  │Bucket N│   bounded queues
///         └───┬────┘  └───┬────┘  └───┬────┘
///             └───────────┼───────────┘
///                         ▼
///               ConcurrencyGovernor ──▶ WriteClient
///                         │
///                         ▼
///                    ResultFanout ──▶ row futures
///                                 ──▶ CallbackExecutor ──▶ ResultCallback
/// ```
///
/// Every accepted row gets exactly one outcome, delivered through its
/// [`RowFuture`] (if requested) and the registered [`ResultCallback`] (if
/// any). Under [`DispatchPolicy::HashPrimaryKey`] all changes to a row share a
/// bucket, so they are submitted in the order they were added; in
/// [`WriteMode::Sequential`] they are also applied in that order.
///
/// The writer should be shut down with [`TableStoreWriter::close()`].
/// Dropping an open writer stops it accepting rows; rows already queued are
/// still submitted in the background.
///
/// [`DispatchPolicy::HashPrimaryKey`]: crate::DispatchPolicy::HashPrimaryKey
/// [`WriteMode::Sequential`]: crate::WriteMode::Sequential
#[derive(Debug)]
pub struct TableStoreWriter {
    config: WriterConfig,
    validator: RowValidator,
    dispatcher: Dispatcher,
    shared: Arc<Shared>,
    callback: CallbackSlot,
    governor: Arc<ConcurrencyGovernor>,

    client: Arc<dyn WriteClient>,
    client_ownership: Ownership,
    executor: Arc<CallbackExecutor>,
    executor_ownership: Ownership,

    closed: AtomicBool,
    shutdown: CancellationToken,
    /// Bucket consumers and background tasks, joined on close.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TableStoreWriter {
    pub fn builder(config: WriterConfig) -> WriterBuilder {
        WriterBuilder::new(config)
    }

    /// Add `row`, waiting for queue space if its bucket is full.
    pub async fn add_row(&self, row: RowChange) -> Result<()> {
        let bucket = self.admit(&row)?;
        self.enqueue(bucket, PendingRow::new(Arc::new(row), None))
            .await
    }

    /// Add `row` only if its bucket has queue space right now.
    ///
    /// Returns `Ok(false)` if the queue is full, in which case nothing was
    /// queued and the caller may retry with the same row.
    pub fn try_add_row(&self, row: &RowChange) -> Result<bool> {
        let bucket = self.admit(row)?;
        let entry = BucketEntry::Row(PendingRow::new(Arc::new(row.clone()), None));

        match self.shared.buckets[bucket].try_enqueue(entry) {
            Ok(()) => {
                self.shared.statistics.row_accepted();
                Ok(true)
            }
            Err(TryEnqueueError::Full(_)) => Ok(false),
            Err(TryEnqueueError::Closed(_)) => Err(WriterError::Closed),
        }
    }

    /// Add `row`, blocking the current thread until its bucket has queue
    /// space.
    ///
    /// # Panics
    ///
    /// Panics if called from within an async execution context.
    pub fn blocking_add_row(&self, row: RowChange) -> Result<()> {
        let bucket = self.admit(&row)?;
        let entry = BucketEntry::Row(PendingRow::new(Arc::new(row), None));

        self.shared.buckets[bucket]
            .blocking_enqueue(entry)
            .map_err(|_| WriterError::Closed)?;
        self.shared.statistics.row_accepted();
        Ok(())
    }

    /// Add `row`, returning a future that resolves to its outcome.
    pub async fn add_row_with_future(&self, row: RowChange) -> Result<RowFuture> {
        let bucket = self.admit(&row)?;
        let (tx, rx) = oneshot::channel();
        let row = Arc::new(row);

        self.enqueue(bucket, PendingRow::new(Arc::clone(&row), Some(tx)))
            .await?;
        Ok(RowFuture::new(row, rx))
    }

    /// Add every valid row of `rows`, returning the rows rejected by
    /// validation.
    pub async fn add_rows(&self, rows: Vec<RowChange>) -> Result<Vec<DirtyRow>> {
        self.ensure_open()?;

        let mut dirty = vec![];
        for row in rows {
            match self.admit(&row) {
                Ok(bucket) => {
                    self.enqueue(bucket, PendingRow::new(Arc::new(row), None))
                        .await?
                }
                Err(WriterError::Validation(error)) => dirty.push(DirtyRow { row, error }),
                Err(e) => return Err(e),
            }
        }

        if !dirty.is_empty() {
            debug!(n_dirty = dirty.len(), "rejected dirty rows");
        }
        Ok(dirty)
    }

    /// Add every row of `rows`, returning a future that resolves once all of
    /// them have an outcome.
    ///
    /// If any row fails validation, none are added.
    pub async fn add_rows_with_future(&self, rows: Vec<RowChange>) -> Result<GroupFuture> {
        self.ensure_open()?;

        let mut admitted = Vec::with_capacity(rows.len());
        for (index, row) in rows.into_iter().enumerate() {
            match self.admit(&row) {
                Ok(bucket) => admitted.push((bucket, row)),
                Err(WriterError::Validation(source)) => {
                    return Err(WriterError::GroupValidation { index, source });
                }
                Err(e) => return Err(e),
            }
        }

        let mut futures = Vec::with_capacity(admitted.len());
        for (bucket, row) in admitted {
            let (tx, rx) = oneshot::channel();
            let row = Arc::new(row);
            self.enqueue(bucket, PendingRow::new(Arc::clone(&row), Some(tx)))
                .await?;
            futures.push(RowFuture::new(row, rx));
        }

        Ok(GroupFuture::new(futures))
    }

    /// Replace the result callback. Batches resolving while the swap happens
    /// may be reported to either callback, never both.
    pub fn set_result_callback(&self, callback: Arc<dyn ResultCallback>) {
        *self.callback.write() = Some(callback);
    }

    pub fn clear_result_callback(&self) {
        *self.callback.write() = None;
    }

    pub fn result_callback(&self) -> Option<Arc<dyn ResultCallback>> {
        self.callback.read().clone()
    }

    /// Wait until every row added before this call has an outcome and has
    /// been reported to the result callback.
    ///
    /// Rows added concurrently with, or after, this call are not waited for.
    pub async fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.flush().await;
        Ok(())
    }

    /// Flush, then stop the writer.
    ///
    /// An owned client is shut down, as is an owned callback executor, once
    /// every callback has run. Shared ones are left running.
    ///
    /// Closing a closed writer returns [`WriterError::AlreadyClosed`] and has
    /// no effect.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(WriterError::AlreadyClosed);
        }

        info!("closing table store writer");

        self.shared.flush().await;
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for res in futures::future::join_all(tasks).await {
            if let Err(e) = res {
                error!(error=%e, "writer task failed");
            }
        }

        if self.client_ownership == Ownership::Owned {
            self.client.shutdown().await;
        }
        if self.executor_ownership == Ownership::Owned {
            let executor = Arc::clone(&self.executor);
            if let Err(e) = tokio::task::spawn_blocking(move || executor.shutdown()).await {
                error!(error=%e, "failed to stop callback executor");
            }
        }

        let s = self.statistics();
        info!(
            rows_accepted = s.rows_accepted,
            rows_dirty = s.rows_dirty,
            rows_succeeded = s.rows_succeeded,
            rows_failed = s.rows_failed,
            batches_sent = s.batches_sent,
            batches_failed = s.batches_failed,
            "closed table store writer"
        );

        Ok(())
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.shared.statistics.snapshot()
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    pub fn state(&self) -> WriterState {
        if self.closed.load(Ordering::Acquire) {
            WriterState::Closed
        } else if self.shared.flushes_in_progress.load(Ordering::Acquire) > 0 {
            WriterState::Flushing
        } else {
            WriterState::Running
        }
    }

    /// The number of batches submitted and not yet resolved.
    pub fn in_flight_batches(&self) -> usize {
        self.governor.in_flight()
    }

    /// The number of entries waiting across every bucket queue.
    pub fn queued_entries(&self) -> usize {
        self.shared.queued()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WriterError::Closed);
        }
        Ok(())
    }

    /// Validate `row` and pick its bucket.
    fn admit(&self, row: &RowChange) -> Result<usize> {
        self.ensure_open()?;
        if let Err(e) = self.validator.validate(row) {
            self.shared.statistics.row_dirty();
            return Err(e.into());
        }
        Ok(self.dispatcher.dispatch(row))
    }

    async fn enqueue(&self, bucket: usize, row: PendingRow) -> Result<()> {
        self.shared.buckets[bucket]
            .enqueue(BucketEntry::Row(row))
            .await
            .map_err(|_| WriterError::Closed)?;
        self.shared.statistics.row_accepted();
        Ok(())
    }
}

impl Drop for TableStoreWriter {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            warn!("table store writer dropped without being closed");
            self.shutdown.cancel();
        }
    }
}

/// Flush every bucket on a fixed cadence until `shutdown` is cancelled.
async fn background_flush(shared: Arc<Shared>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {},
            _ = shutdown.cancelled() => break,
        }

        debug!("scheduled flush");
        tokio::select! {
            _ = shared.flush() => {},
            _ = shutdown.cancelled() => break,
        }
    }
}

/// Log a statistics snapshot on a fixed cadence until `shutdown` is
/// cancelled.
async fn background_statistics_log(
    shared: Arc<Shared>,
    governor: Arc<ConcurrencyGovernor>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {},
            _ = shutdown.cancelled() => break,
        }

        let s = shared.statistics.snapshot();
        info!(
            rows_accepted = s.rows_accepted,
            rows_pending = s.rows_pending(),
            rows_succeeded = s.rows_succeeded,
            rows_failed = s.rows_failed,
            rows_dirty = s.rows_dirty,
            batches_sent = s.batches_sent,
            batches_failed = s.batches_failed,
            in_flight_batches = governor.in_flight(),
            queued_entries = shared.queued(),
            "table store writer statistics"
        );
    }
}
