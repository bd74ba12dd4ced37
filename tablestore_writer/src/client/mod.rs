//! The seam between the writer and the remote table store.
//!
//! The writer never speaks the wire protocol itself. It hands each closed
//! batch to a [`WriteClient`], which owns encoding, transport, retries and
//! backoff, and reports a per-row outcome back.

pub mod memory;

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;

use crate::{config::BatchRequestType, result::RowAck, row::RowChange};

/// A per-row rejection reported by the remote store inside an otherwise
/// successful batch response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct RemoteRowError {
    pub code: String,
    pub message: String,
}

impl RemoteRowError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// A failure to hand a batch to the remote store at all.
///
/// Every row of the batch fails with the same error.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("failed to encode batch request: {0}")]
    Encode(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("the write client has been shut down")]
    ClientShutdown,

    #[error("response carried {got} row results for a batch of {want} rows")]
    ResponseMismatch { want: usize, got: usize },
}

/// A closed batch, in queue order, ready to be sent.
#[derive(Debug, Clone)]
pub struct BatchWriteRequest {
    request_type: BatchRequestType,
    rows: Vec<Arc<RowChange>>,
}

impl BatchWriteRequest {
    pub fn new(request_type: BatchRequestType, rows: Vec<Arc<RowChange>>) -> Self {
        Self { request_type, rows }
    }

    pub fn request_type(&self) -> BatchRequestType {
        self.request_type
    }

    pub fn rows(&self) -> &[Arc<RowChange>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn data_size(&self) -> usize {
        self.rows.iter().map(|r| r.data_size()).sum()
    }
}

/// The per-row results of a [`BatchWriteRequest`], positionally matching the
/// request rows.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchWriteResponse {
    results: Vec<Result<RowAck, RemoteRowError>>,
}

impl BatchWriteResponse {
    pub fn new(results: Vec<Result<RowAck, RemoteRowError>>) -> Self {
        Self { results }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn results(&self) -> &[Result<RowAck, RemoteRowError>] {
        &self.results
    }

    pub fn into_results(self) -> Vec<Result<RowAck, RemoteRowError>> {
        self.results
    }
}

/// An abstract client that pushes a batch of row changes to the remote store
/// and waits for the per-row response.
///
/// Implementations apply their own retry and timeout policy; the writer calls
/// [`WriteClient::write_batch()`] exactly once per batch.
#[async_trait]
pub trait WriteClient: Send + Sync + Debug {
    /// Write `request` and wait for a response.
    async fn write_batch(
        &self,
        request: BatchWriteRequest,
    ) -> Result<BatchWriteResponse, SubmitError>;

    /// Release any resources held by the client.
    ///
    /// Only called by a writer that owns the client.
    async fn shutdown(&self) {}
}

