use crate::{config::ConfigError, validator::ValidationError};

/// Errors returned synchronously by [`TableStoreWriter`] operations.
///
/// Failures of accepted rows are never returned here; they are delivered
/// through the row's future and the result callback as a
/// [`RowFailure`](crate::RowFailure).
///
/// [`TableStoreWriter`]: crate::TableStoreWriter
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    /// The row failed validation and was not accepted.
    #[error("invalid row: {0}")]
    Validation(#[from] ValidationError),

    /// A row of a group failed validation, so none of the group was
    /// accepted.
    #[error("invalid row at index {index} of group: {source}")]
    GroupValidation {
        index: usize,
        source: ValidationError,
    },

    #[error("the writer is closed")]
    Closed,

    #[error("the writer has already been closed")]
    AlreadyClosed,

    #[error("invalid writer configuration: {0}")]
    Config(#[from] ConfigError),
}

impl WriterError {
    /// Returns true if the error is the result of calling the writer in a
    /// state that does not allow the call.
    pub fn is_usage_error(&self) -> bool {
        matches!(self, Self::Closed | Self::AlreadyClosed)
    }
}

pub type Result<T, E = WriterError> = std::result::Result<T, E>;
