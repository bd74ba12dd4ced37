//! Per-row outcomes and the futures that resolve to them.

use std::{
    fmt::Debug,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use futures::{FutureExt, future::BoxFuture};
use tokio::sync::oneshot;

use crate::{
    client::{RemoteRowError, SubmitError},
    row::RowChange,
};

/// The acknowledgement of a successfully applied row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowAck {
    /// Write capacity units the remote store charged for the row.
    pub consumed_write_units: u64,
}

/// The reason an accepted row was not applied.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RowFailure {
    /// The remote store rejected this row.
    #[error("row rejected by the remote store: {0}")]
    Remote(#[from] RemoteRowError),

    /// The batch carrying this row could not be submitted. The same error is
    /// shared by every row of the batch.
    #[error("batch submission failed: {0}")]
    Submission(Arc<SubmitError>),

    /// The writer went away without ever producing a result for the row.
    #[error("the row result was dropped before completion")]
    Dropped,
}

pub type RowOutcome = Result<RowAck, RowFailure>;

/// A row paired with its outcome.
#[derive(Debug, Clone)]
pub struct RowResult {
    row: Arc<RowChange>,
    outcome: RowOutcome,
}

impl RowResult {
    pub fn new(row: Arc<RowChange>, outcome: RowOutcome) -> Self {
        Self { row, outcome }
    }

    pub fn row(&self) -> &RowChange {
        &self.row
    }

    pub fn outcome(&self) -> &RowOutcome {
        &self.outcome
    }

    pub fn is_succeeded(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn into_parts(self) -> (Arc<RowChange>, RowOutcome) {
        (self.row, self.outcome)
    }
}

/// Resolves to the [`RowResult`] of a single accepted row.
///
/// Dropping the future does not cancel the write.
#[derive(Debug)]
pub struct RowFuture {
    row: Option<Arc<RowChange>>,
    rx: oneshot::Receiver<RowOutcome>,
}

impl RowFuture {
    pub(crate) fn new(row: Arc<RowChange>, rx: oneshot::Receiver<RowOutcome>) -> Self {
        Self { row: Some(row), rx }
    }

    pub fn row(&self) -> Option<&RowChange> {
        self.row.as_deref()
    }
}

impl Future for RowFuture {
    type Output = RowResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = match ready!(self.rx.poll_unpin(cx)) {
            Ok(v) => v,
            Err(_) => Err(RowFailure::Dropped),
        };
        let row = self
            .row
            .take()
            .expect("row future polled after completion");
        Poll::Ready(RowResult::new(row, outcome))
    }
}

/// The combined outcome of a group of rows.
#[derive(Debug, Clone, Default)]
pub struct GroupResult {
    pub succeeded: Vec<(Arc<RowChange>, RowAck)>,
    pub failed: Vec<(Arc<RowChange>, RowFailure)>,
}

impl GroupResult {
    pub fn is_all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<RowResult> for GroupResult {
    fn from_iter<T: IntoIterator<Item = RowResult>>(iter: T) -> Self {
        iter.into_iter()
            .fold(Self::default(), |mut acc, r| {
                match r.outcome {
                    Ok(ack) => acc.succeeded.push((r.row, ack)),
                    Err(e) => acc.failed.push((r.row, e)),
                }
                acc
            })
    }
}

/// Resolves once every row of a group has a result.
pub struct GroupFuture {
    inner: BoxFuture<'static, GroupResult>,
}

impl Debug for GroupFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupFuture").finish_non_exhaustive()
    }
}

impl GroupFuture {
    pub(crate) fn new(rows: Vec<RowFuture>) -> Self {
        Self {
            inner: futures::future::join_all(rows)
                .map(GroupResult::from_iter)
                .boxed(),
        }
    }
}

impl Future for GroupFuture {
    type Output = GroupResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

/// A row waiting in a bucket queue or an open batch.
#[derive(Debug)]
pub(crate) struct PendingRow {
    pub(crate) row: Arc<RowChange>,
    pub(crate) size: usize,
    pub(crate) columns: usize,
    /// Set when the caller holds a [`RowFuture`] for this row.
    pub(crate) sink: Option<oneshot::Sender<RowOutcome>>,
}

impl PendingRow {
    pub(crate) fn new(row: Arc<RowChange>, sink: Option<oneshot::Sender<RowOutcome>>) -> Self {
        Self {
            size: row.data_size(),
            columns: row.column_count(),
            row,
            sink,
        }
    }
}
