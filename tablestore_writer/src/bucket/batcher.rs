//! Accumulation of queued rows into size-bounded batches.

use std::{fmt::Display, sync::Arc, time::Duration};

use hashbrown::HashSet;
use tokio::time::Instant;

use crate::{
    config::WriterConfig,
    result::PendingRow,
    row::{PrimaryKey, RowChange},
};

/// Why a batch was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    RowCount,
    ByteSize,
    ColumnCount,
    DuplicateKey,
    Barrier,
    Linger,
    Shutdown,
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RowCount => "row_count",
            Self::ByteSize => "byte_size",
            Self::ColumnCount => "column_count",
            Self::DuplicateKey => "duplicate_key",
            Self::Barrier => "barrier",
            Self::Linger => "linger",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BatchLimits {
    pub(crate) max_rows: usize,
    pub(crate) max_bytes: usize,
    pub(crate) max_columns: usize,
    pub(crate) allow_duplicate_keys: bool,
    pub(crate) max_linger: Option<Duration>,
}

impl From<&WriterConfig> for BatchLimits {
    fn from(c: &WriterConfig) -> Self {
        Self {
            max_rows: c.max_batch_rows,
            max_bytes: c.max_batch_bytes,
            max_columns: c.max_batch_columns,
            allow_duplicate_keys: c.allow_duplicate_keys_in_batch,
            max_linger: c.max_batch_linger,
        }
    }
}

/// A closed batch: a contiguous run of one bucket's queue.
#[derive(Debug)]
pub(crate) struct Batch {
    pub(crate) rows: Vec<PendingRow>,
    pub(crate) bytes: usize,
    pub(crate) columns: usize,
    pub(crate) reason: CloseReason,
}

/// The open batch of a bucket.
///
/// The caller checks [`BatchBuilder::must_close_before()`] before adding a
/// row, closing the open batch first if needed, and [`BatchBuilder::full()`]
/// after, so a batch never exceeds a limit and never closes later than it
/// has to.
#[derive(Debug)]
pub(crate) struct BatchBuilder {
    limits: BatchLimits,
    rows: Vec<PendingRow>,
    bytes: usize,
    columns: usize,
    keys: HashSet<(Arc<str>, PrimaryKey)>,
    opened_at: Option<Instant>,
}

impl BatchBuilder {
    pub(crate) fn new(limits: BatchLimits) -> Self {
        Self {
            limits,
            rows: Vec::new(),
            bytes: 0,
            columns: 0,
            keys: HashSet::new(),
            opened_at: None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Return the reason the open batch must be closed before `row` can be
    /// added, if any.
    ///
    /// An empty batch accepts any row: a row larger than a batch limit on its
    /// own is sent alone rather than never.
    pub(crate) fn must_close_before(&self, row: &PendingRow) -> Option<CloseReason> {
        if self.is_empty() {
            return None;
        }

        if !self.limits.allow_duplicate_keys && self.keys.contains(&key_of(&row.row)) {
            return Some(CloseReason::DuplicateKey);
        }
        if self.bytes + row.size > self.limits.max_bytes {
            return Some(CloseReason::ByteSize);
        }
        if self.columns + row.columns > self.limits.max_columns {
            return Some(CloseReason::ColumnCount);
        }
        None
    }

    pub(crate) fn push(&mut self, row: PendingRow) {
        if self.rows.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        if !self.limits.allow_duplicate_keys {
            self.keys.insert(key_of(&row.row));
        }
        self.bytes += row.size;
        self.columns += row.columns;
        self.rows.push(row);
    }

    /// Return the reason the open batch is full, if it is.
    pub(crate) fn full(&self) -> Option<CloseReason> {
        if self.rows.len() >= self.limits.max_rows {
            Some(CloseReason::RowCount)
        } else if self.bytes >= self.limits.max_bytes {
            Some(CloseReason::ByteSize)
        } else if self.columns >= self.limits.max_columns {
            Some(CloseReason::ColumnCount)
        } else {
            None
        }
    }

    /// The instant the open batch must be closed by, if linger is enabled and
    /// the batch is non-empty.
    pub(crate) fn linger_deadline(&self) -> Option<Instant> {
        Some(self.opened_at? + self.limits.max_linger?)
    }

    /// Close the open batch, returning it if it holds any rows.
    pub(crate) fn close(&mut self, reason: CloseReason) -> Option<Batch> {
        if self.rows.is_empty() {
            return None;
        }

        self.keys.clear();
        self.opened_at = None;
        Some(Batch {
            rows: std::mem::take(&mut self.rows),
            bytes: std::mem::take(&mut self.bytes),
            columns: std::mem::take(&mut self.columns),
            reason,
        })
    }
}

fn key_of(row: &RowChange) -> (Arc<str>, PrimaryKey) {
    (Arc::from(row.table_name()), row.primary_key().clone())
}
