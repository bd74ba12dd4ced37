//! An in-memory [`WriteClient`] that applies row changes to a local map.
//!
//! Useful for tests and for generating load without a remote store: it
//! records every request it sees, can simulate latency, pause writes, fail
//! submissions and reject individual rows or batches that repeat a row.

use std::{
    collections::BTreeMap,
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use super::{BatchWriteRequest, BatchWriteResponse, RemoteRowError, SubmitError, WriteClient};
use crate::{
    config::BatchRequestType,
    result::RowAck,
    row::{ColumnUpdate, ColumnValue, PrimaryKey, RowChange, RowChangeKind, RowExistenceExpectation},
};

/// Size of one write capacity unit.
const WRITE_UNIT_SIZE: usize = 4 * 1024;

/// Error code returned when a row's existence condition does not hold.
pub const CONDITION_CHECK_FAIL: &str = "OTSConditionCheckFail";

/// Error code returned when a batch carries invalid input.
pub const PARAMETER_INVALID: &str = "OTSParameterInvalid";

type RowRejection = Box<dyn Fn(&RowChange) -> Option<RemoteRowError> + Send + Sync>;

type StoredRow = BTreeMap<String, ColumnValue>;

/// A request observed by an [`InMemoryTableStore`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request_type: BatchRequestType,
    pub n_rows: usize,
    /// Empty unless row recording is enabled.
    pub rows: Vec<Arc<RowChange>>,
    pub started: Instant,
    /// Unset while the request is still being processed.
    pub finished: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, HashMap<PrimaryKey, StoredRow>>,
    requests: Vec<RecordedRequest>,
}

/// An in-memory table store.
pub struct InMemoryTableStore {
    state: Mutex<State>,
    latency: Option<Duration>,
    paused: watch::Sender<bool>,
    fail_next_submissions: AtomicUsize,
    reject_row: Option<RowRejection>,
    reject_duplicates: bool,
    record_rows: bool,
    in_progress: AtomicUsize,
    peak_in_progress: AtomicUsize,
    is_shutdown: AtomicBool,
}

impl Debug for InMemoryTableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTableStore")
            .field("latency", &self.latency)
            .field("reject_duplicates", &self.reject_duplicates)
            .field("record_rows", &self.record_rows)
            .field("paused", &*self.paused.borrow())
            .field("in_progress", &self.in_progress.load(Ordering::Relaxed))
            .field("is_shutdown", &self.is_shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryTableStore {
    fn default() -> Self {
        Self {
            state: Default::default(),
            latency: None,
            paused: watch::Sender::new(false),
            fail_next_submissions: AtomicUsize::new(0),
            reject_row: None,
            reject_duplicates: false,
            record_rows: true,
            in_progress: AtomicUsize::new(0),
            peak_in_progress: AtomicUsize::new(0),
            is_shutdown: AtomicBool::new(false),
        }
    }
}

impl InMemoryTableStore {
    /// Delay every request by `latency` before applying it.
    pub fn with_latency(self, latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..self
        }
    }

    /// Reject every row for which `f` returns an error, leaving the rest of
    /// the batch to succeed.
    pub fn with_row_rejection<F>(self, f: F) -> Self
    where
        F: Fn(&RowChange) -> Option<RemoteRowError> + Send + Sync + 'static,
    {
        Self {
            reject_row: Some(Box::new(f)),
            ..self
        }
    }

    /// Fail every row of a request that changes the same row twice, as the
    /// remote `BatchWriteRow` API does.
    pub fn with_duplicate_rejection(self) -> Self {
        Self {
            reject_duplicates: true,
            ..self
        }
    }

    /// Keep only the size and timings of each request, not its rows.
    pub fn without_row_recording(self) -> Self {
        Self {
            record_rows: false,
            ..self
        }
    }

    /// Fail the next `n` requests with a transport error.
    pub fn fail_next_submissions(&self, n: usize) {
        self.fail_next_submissions.store(n, Ordering::SeqCst);
    }

    /// Hold every request (including ones already waiting) until
    /// [`Self::resume()`] is called.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    /// The row counts of every request received so far, in arrival order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state
            .lock()
            .requests
            .iter()
            .map(|r| r.n_rows)
            .collect()
    }

    /// The number of requests currently being processed.
    pub fn in_progress(&self) -> usize {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// The highest number of requests ever processed at once.
    pub fn peak_in_progress(&self) -> usize {
        self.peak_in_progress.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    /// The stored attribute columns of a row, if it exists.
    pub fn get_row(&self, table: &str, primary_key: &PrimaryKey) -> Option<StoredRowView> {
        self.state
            .lock()
            .tables
            .get(table)
            .and_then(|t| t.get(primary_key))
            .map(|r| StoredRowView(r.clone()))
    }

    /// The number of rows stored in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|t| t.len())
            .unwrap_or_default()
    }

    fn apply(&self, request: &BatchWriteRequest) -> Vec<Result<RowAck, RemoteRowError>> {
        let mut state = self.state.lock();

        if self.reject_duplicates && has_duplicates(request) {
            let err = RemoteRowError::new(PARAMETER_INVALID, "duplicated rows in one batch request");
            return vec![Err(err); request.len()];
        }

        request
            .rows()
            .iter()
            .map(|row| {
                if let Some(err) = self.reject_row.as_ref().and_then(|f| f(row)) {
                    return Err(err);
                }
                apply_row(&mut state, row)
            })
            .collect()
    }
}

fn has_duplicates(request: &BatchWriteRequest) -> bool {
    let mut seen = HashSet::with_capacity(request.len());
    !request
        .rows()
        .iter()
        .all(|r| seen.insert((r.table_name(), r.primary_key())))
}

/// A snapshot of a stored row's attribute columns.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRowView(StoredRow);

impl StoredRowView {
    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.0.get(column)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.keys().map(String::as_str)
    }
}

fn apply_row(state: &mut State, row: &RowChange) -> Result<RowAck, RemoteRowError> {
    let table = state
        .tables
        .entry_ref(row.table_name())
        .or_default();
    let exists = table.contains_key(row.primary_key());

    match (row.condition(), exists) {
        (RowExistenceExpectation::ExpectExist, false)
        | (RowExistenceExpectation::ExpectNotExist, true) => {
            return Err(RemoteRowError::new(
                CONDITION_CHECK_FAIL,
                "Condition check failed.",
            ));
        }
        _ => {}
    }

    match row.kind() {
        RowChangeKind::Put { columns } => {
            let stored = columns
                .iter()
                .map(|c| (c.name.clone(), c.value.clone()))
                .collect();
            table.insert(row.primary_key().clone(), stored);
        }
        RowChangeKind::Update { updates } => {
            let stored = table.entry(row.primary_key().clone()).or_default();
            for u in updates {
                match u {
                    ColumnUpdate::Put(c) => {
                        stored.insert(c.name.clone(), c.value.clone());
                    }
                    ColumnUpdate::Delete { name, .. } => {
                        stored.remove(name);
                    }
                }
            }
        }
        RowChangeKind::Delete => {
            table.remove(row.primary_key());
        }
    }

    Ok(RowAck {
        consumed_write_units: row.data_size().div_ceil(WRITE_UNIT_SIZE).max(1) as u64,
    })
}

#[async_trait]
impl WriteClient for InMemoryTableStore {
    async fn write_batch(
        &self,
        request: BatchWriteRequest,
    ) -> Result<BatchWriteResponse, SubmitError> {
        if self.is_shutdown() {
            return Err(SubmitError::ClientShutdown);
        }

        let now = self.in_progress.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_progress.fetch_max(now, Ordering::SeqCst);

        let idx = {
            let mut state = self.state.lock();
            state.requests.push(RecordedRequest {
                request_type: request.request_type(),
                n_rows: request.len(),
                rows: if self.record_rows {
                    request.rows().to_vec()
                } else {
                    vec![]
                },
                started: Instant::now(),
                finished: None,
            });
            state.requests.len() - 1
        };

        let mut paused = self.paused.subscribe();
        // The sender lives as long as self, so this cannot fail.
        let _ = paused.wait_for(|p| !*p).await;

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let failed = self
            .fail_next_submissions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let ret = if failed {
            Err(SubmitError::Transport("injected submission failure".to_string()))
        } else {
            Ok(BatchWriteResponse::new(self.apply(&request)))
        };

        self.state.lock().requests[idx].finished = Some(Instant::now());
        self.in_progress.fetch_sub(1, Ordering::SeqCst);

        debug!(n_rows = request.len(), failed, "in-memory store handled batch");

        ret
    }

    async fn shutdown(&self) {
        self.is_shutdown.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn pk(id: i64) -> PrimaryKey {
        PrimaryKey::new([("id", id)])
    }

    fn request(rows: Vec<RowChange>) -> BatchWriteRequest {
        BatchWriteRequest::new(
            BatchRequestType::BatchWriteRow,
            rows.into_iter().map(Arc::new).collect(),
        )
    }

    #[tokio::test]
    async fn test_put_update_delete() {
        let store = InMemoryTableStore::default();

        let resp = store
            .write_batch(request(vec![
                RowChange::put("t", pk(1)).with_column("a", 1_i64),
                RowChange::update("t", pk(2)).with_column("b", "x"),
            ]))
            .await
            .unwrap();
        assert!(resp.results().iter().all(Result::is_ok));
        assert_eq!(store.row_count("t"), 2);

        store
            .write_batch(request(vec![
                RowChange::update("t", pk(1))
                    .with_column("c", true)
                    .with_column_delete("a", None),
                RowChange::delete("t", pk(2)),
            ]))
            .await
            .unwrap();

        let row = store.get_row("t", &pk(1)).unwrap();
        assert_eq!(row.column_names().collect::<Vec<_>>(), ["c"]);
        assert_eq!(row.get("c"), Some(&ColumnValue::Boolean(true)));
        assert!(store.get_row("t", &pk(2)).is_none());
        assert_eq!(store.batch_sizes(), [2, 2]);
    }

    #[tokio::test]
    async fn test_conditions() {
        let store = InMemoryTableStore::default();
        let resp = store
            .write_batch(request(vec![
                RowChange::put("t", pk(1)).with_condition(RowExistenceExpectation::ExpectExist),
                RowChange::put("t", pk(2)).with_condition(RowExistenceExpectation::ExpectNotExist),
            ]))
            .await
            .unwrap();

        assert_matches!(&resp.results()[0], Err(e) if e.code == CONDITION_CHECK_FAIL);
        assert_matches!(&resp.results()[1], Ok(_));
    }

    #[tokio::test]
    async fn test_duplicate_rows() {
        let duplicated = || {
            request(vec![
                RowChange::put("t", pk(1)).with_column("v", 1_i64),
                RowChange::put("t", pk(2)),
                RowChange::put("t", pk(1)).with_column("v", 2_i64),
            ])
        };

        // Accepted and applied in order by default.
        let store = InMemoryTableStore::default();
        let resp = store.write_batch(duplicated()).await.unwrap();
        assert!(resp.results().iter().all(Result::is_ok));
        assert_eq!(store.row_count("t"), 2);
        assert_eq!(
            store.get_row("t", &pk(1)).unwrap().get("v"),
            Some(&ColumnValue::Integer(2))
        );

        let store = InMemoryTableStore::default().with_duplicate_rejection();
        let resp = store.write_batch(duplicated()).await.unwrap();
        assert_eq!(resp.len(), 3);
        assert!(resp
            .results()
            .iter()
            .all(|r| matches!(r, Err(e) if e.code == PARAMETER_INVALID)));
        assert_eq!(store.row_count("t"), 0);
    }

    #[tokio::test]
    async fn test_row_recording_can_be_disabled() {
        let store = InMemoryTableStore::default().without_row_recording();
        store
            .write_batch(request(vec![RowChange::put("t", pk(1)), RowChange::put("t", pk(2))]))
            .await
            .unwrap();

        let requests = store.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].rows.is_empty());
        assert!(requests[0].finished.is_some());
        assert_eq!(store.batch_sizes(), [2]);
    }

    #[tokio::test]
    async fn test_injected_failures_and_shutdown() {
        let store = InMemoryTableStore::default();
        store.fail_next_submissions(1);

        assert_matches!(
            store.write_batch(request(vec![RowChange::put("t", pk(1))])).await,
            Err(SubmitError::Transport(_))
        );
        assert_matches!(
            store.write_batch(request(vec![RowChange::put("t", pk(1))])).await,
            Ok(_)
        );

        store.shutdown().await;
        assert_matches!(
            store.write_batch(request(vec![RowChange::put("t", pk(1))])).await,
            Err(SubmitError::ClientShutdown)
        );
    }
}
