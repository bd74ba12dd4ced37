//! A client-side batch writer for a remote table store.
//!
//! Callers hand individual row changes to a [`TableStoreWriter`], which
//! validates them, spreads them over a fixed set of ordered buckets and
//! micro-batches each bucket's rows into requests for an external
//! [`WriteClient`]. The number of outstanding requests is bounded across the
//! whole writer, producers are pushed back on through bounded bucket queues,
//! and every accepted row gets exactly one outcome through its
//! [`RowFuture`] and/or a shared [`ResultCallback`].
//!
//! [`TableStoreWriter::flush()`] is a barrier: it returns once every row
//! added before the call has an outcome.
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> Result<(), tablestore_writer::WriterError> {
//! use std::sync::Arc;
//!
//! use tablestore_writer::{
//!     PrimaryKey, RowChange, TableStoreWriter, WriterConfig,
//!     client::memory::InMemoryTableStore,
//! };
//!
//! let writer = TableStoreWriter::builder(WriterConfig::default())
//!     .with_client(Arc::new(InMemoryTableStore::default()))
//!     .build()?;
//!
//! writer
//!     .add_row(RowChange::put("orders", PrimaryKey::new([("id", 42_i64)])).with_column("total", 9.5))
//!     .await?;
//! writer.close().await?;
//! # Ok(())
//! # }
//! ```

mod barrier;
mod bucket;
pub mod callback;
pub mod client;
pub mod config;
pub mod dispatcher;
mod error;
mod fanout;
mod governor;
pub mod result;
pub mod row;
pub mod statistics;
pub mod validator;
mod writer;

pub use callback::{CallbackExecutor, FnCallback, ResultCallback};
pub use client::{BatchWriteRequest, BatchWriteResponse, RemoteRowError, SubmitError, WriteClient};
pub use config::{BatchRequestType, ConfigError, DispatchPolicy, WriteMode, WriterConfig};
pub use error::{Result, WriterError};
pub use result::{GroupFuture, GroupResult, RowAck, RowFailure, RowFuture, RowOutcome, RowResult};
pub use row::{
    Column, ColumnUpdate, ColumnValue, PrimaryKey, PrimaryKeyType, PrimaryKeyValue, RowChange,
    RowChangeKind, RowExistenceExpectation,
};
pub use statistics::{StatisticsSnapshot, WriterStatistics};
pub use validator::{TableSchema, ValidationError};
pub use writer::{DirtyRow, TableStoreWriter, WriterBuilder, WriterState};
