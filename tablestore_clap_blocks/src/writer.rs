//! CLI config for the table store writer.

use std::{num::NonZeroUsize, str::FromStr, time::Duration};

use tablestore_writer::{
    BatchRequestType, DispatchPolicy, WriteMode, WriterConfig,
    config::{
        DEFAULT_BUCKET_COUNT, DEFAULT_MAX_ATTRIBUTE_COLUMN_SIZE, DEFAULT_MAX_ATTRIBUTE_COLUMNS,
        DEFAULT_MAX_BATCH_BYTES, DEFAULT_MAX_BATCH_COLUMNS, DEFAULT_MAX_BATCH_ROWS,
        DEFAULT_MAX_IN_FLIGHT_BATCHES, DEFAULT_MAX_PRIMARY_KEY_COLUMN_SIZE,
        DEFAULT_QUEUE_CAPACITY,
    },
};

/// How a bucket paces its batch submissions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum WriteModeArg {
    /// Wait for each batch result before sending the next batch of a bucket.
    Sequential,

    /// Allow several batches per bucket in flight.
    #[default]
    Parallel,
}

impl From<WriteModeArg> for WriteMode {
    fn from(v: WriteModeArg) -> Self {
        match v {
            WriteModeArg::Sequential => Self::Sequential,
            WriteModeArg::Parallel => Self::Parallel,
        }
    }
}

/// How rows are mapped to buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum DispatchPolicyArg {
    /// Hash the table name and primary key.
    #[default]
    HashPrimaryKey,

    /// Hash the table name and the first primary key column.
    HashPartitionKey,

    /// Cycle through the buckets.
    RoundRobin,
}

impl From<DispatchPolicyArg> for DispatchPolicy {
    fn from(v: DispatchPolicyArg) -> Self {
        match v {
            DispatchPolicyArg::HashPrimaryKey => Self::HashPrimaryKey,
            DispatchPolicyArg::HashPartitionKey => Self::HashPartitionKey,
            DispatchPolicyArg::RoundRobin => Self::RoundRobin,
        }
    }
}

/// The remote batch API to send requests to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum BatchRequestTypeArg {
    #[default]
    BatchWriteRow,
    BulkImport,
}

impl From<BatchRequestTypeArg> for BatchRequestType {
    fn from(v: BatchRequestTypeArg) -> Self {
        match v {
            BatchRequestTypeArg::BatchWriteRow => Self::BatchWriteRow,
            BatchRequestTypeArg::BulkImport => Self::BulkImport,
        }
    }
}

/// A duration that can be switched off with `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionalDuration(pub Option<Duration>);

impl FromStr for OptionalDuration {
    type Err = humantime::DurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" | "none" => Ok(Self(None)),
            _ => humantime::parse_duration(s).map(|d| Self(Some(d))),
        }
    }
}

/// CLI config for a [`WriterConfig`].
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct WriterConfigArgs {
    /// Number of independent ordered buckets rows are spread over.
    #[clap(
        long = "writer-bucket-count",
        env = "TABLESTORE_WRITER_BUCKET_COUNT",
        default_value_t = DEFAULT_BUCKET_COUNT,
        action
    )]
    pub bucket_count: usize,

    /// How rows are mapped to buckets.
    #[clap(
        long = "writer-dispatch-policy",
        env = "TABLESTORE_WRITER_DISPATCH_POLICY",
        default_value_t = DispatchPolicyArg::default(),
        value_enum,
        action
    )]
    pub dispatch_policy: DispatchPolicyArg,

    /// How each bucket paces its batch submissions.
    #[clap(
        long = "writer-write-mode",
        env = "TABLESTORE_WRITER_WRITE_MODE",
        default_value_t = WriteModeArg::default(),
        value_enum,
        action
    )]
    pub write_mode: WriteModeArg,

    /// Maximum number of batches sent but not yet resolved, across all
    /// buckets.
    #[clap(
        long = "writer-max-in-flight-batches",
        env = "TABLESTORE_WRITER_MAX_IN_FLIGHT_BATCHES",
        default_value_t = DEFAULT_MAX_IN_FLIGHT_BATCHES,
        action
    )]
    pub max_in_flight_batches: usize,

    /// Maximum number of rows in one batch.
    #[clap(
        long = "writer-max-batch-rows",
        env = "TABLESTORE_WRITER_MAX_BATCH_ROWS",
        default_value_t = DEFAULT_MAX_BATCH_ROWS,
        action
    )]
    pub max_batch_rows: usize,

    /// Maximum size of one batch, in bytes.
    #[clap(
        long = "writer-max-batch-bytes",
        env = "TABLESTORE_WRITER_MAX_BATCH_BYTES",
        default_value_t = DEFAULT_MAX_BATCH_BYTES,
        action
    )]
    pub max_batch_bytes: usize,

    /// Maximum number of columns across all rows of one batch.
    #[clap(
        long = "writer-max-batch-columns",
        env = "TABLESTORE_WRITER_MAX_BATCH_COLUMNS",
        default_value_t = DEFAULT_MAX_BATCH_COLUMNS,
        action
    )]
    pub max_batch_columns: usize,

    /// Maximum number of attribute columns in one row.
    #[clap(
        long = "writer-max-attribute-columns",
        env = "TABLESTORE_WRITER_MAX_ATTRIBUTE_COLUMNS",
        default_value_t = DEFAULT_MAX_ATTRIBUTE_COLUMNS,
        action
    )]
    pub max_attribute_columns: usize,

    /// Maximum size of one attribute column value, in bytes.
    #[clap(
        long = "writer-max-attribute-column-size",
        env = "TABLESTORE_WRITER_MAX_ATTRIBUTE_COLUMN_SIZE",
        default_value_t = DEFAULT_MAX_ATTRIBUTE_COLUMN_SIZE,
        action
    )]
    pub max_attribute_column_size: usize,

    /// Maximum size of one primary key column value, in bytes.
    #[clap(
        long = "writer-max-primary-key-column-size",
        env = "TABLESTORE_WRITER_MAX_PRIMARY_KEY_COLUMN_SIZE",
        default_value_t = DEFAULT_MAX_PRIMARY_KEY_COLUMN_SIZE,
        action
    )]
    pub max_primary_key_column_size: usize,

    /// Capacity of each bucket queue. Producers wait once it is full.
    #[clap(
        long = "writer-queue-capacity",
        env = "TABLESTORE_WRITER_QUEUE_CAPACITY",
        default_value_t = DEFAULT_QUEUE_CAPACITY,
        action
    )]
    pub queue_capacity: usize,

    /// Interval between scheduled flushes.
    #[clap(
        long = "writer-flush-interval",
        env = "TABLESTORE_WRITER_FLUSH_INTERVAL",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub flush_interval: Duration,

    /// Close a batch once it has been open this long. Off by default.
    #[clap(
        long = "writer-max-batch-linger",
        env = "TABLESTORE_WRITER_MAX_BATCH_LINGER",
        value_parser = humantime::parse_duration
    )]
    pub max_batch_linger: Option<Duration>,

    /// Interval between statistics log lines, or `off`.
    #[clap(
        long = "writer-statistics-log-interval",
        env = "TABLESTORE_WRITER_STATISTICS_LOG_INTERVAL",
        default_value = "10s",
        action
    )]
    pub statistics_log_interval: OptionalDuration,

    /// Split batches so no batch holds two changes to the same row.
    #[clap(
        long = "writer-forbid-duplicate-keys-in-batch",
        env = "TABLESTORE_WRITER_FORBID_DUPLICATE_KEYS_IN_BATCH",
        default_value_t = false,
        action
    )]
    pub forbid_duplicate_keys_in_batch: bool,

    /// Number of threads running result callbacks.
    ///
    /// Defaults to the number of logical cores on the system plus one.
    #[clap(
        long = "writer-callback-pool-size",
        env = "TABLESTORE_WRITER_CALLBACK_POOL_SIZE",
        action
    )]
    pub callback_pool_size: Option<NonZeroUsize>,

    /// The remote batch API requests are meant for.
    #[clap(
        long = "writer-batch-request-type",
        env = "TABLESTORE_WRITER_BATCH_REQUEST_TYPE",
        default_value_t = BatchRequestTypeArg::default(),
        value_enum,
        action
    )]
    pub batch_request_type: BatchRequestTypeArg,
}

impl From<&WriterConfigArgs> for WriterConfig {
    fn from(args: &WriterConfigArgs) -> Self {
        let defaults = Self::default();
        Self {
            bucket_count: args.bucket_count,
            dispatch_policy: args.dispatch_policy.into(),
            write_mode: args.write_mode.into(),
            max_in_flight_batches: args.max_in_flight_batches,
            max_batch_rows: args.max_batch_rows,
            max_batch_bytes: args.max_batch_bytes,
            max_batch_columns: args.max_batch_columns,
            max_attribute_columns: args.max_attribute_columns,
            max_attribute_column_size: args.max_attribute_column_size,
            max_primary_key_column_size: args.max_primary_key_column_size,
            queue_capacity: args.queue_capacity,
            flush_interval: args.flush_interval,
            max_batch_linger: args.max_batch_linger,
            statistics_log_interval: args.statistics_log_interval.0,
            allow_duplicate_keys_in_batch: !args.forbid_duplicate_keys_in_batch,
            callback_pool_size: args
                .callback_pool_size
                .map(NonZeroUsize::get)
                .unwrap_or(defaults.callback_pool_size),
            batch_request_type: args.batch_request_type.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use clap::Parser;

    use super::*;

    #[test]
    fn test_defaults_match_writer_defaults() {
        let args = WriterConfigArgs::parse_from(std::iter::empty::<OsString>());
        assert_eq!(WriterConfig::from(&args), WriterConfig::default());
    }

    #[test]
    fn test_explicit_flags() {
        let args = WriterConfigArgs::parse_from([
            "writer",
            "--writer-bucket-count",
            "8",
            "--writer-write-mode",
            "sequential",
            "--writer-dispatch-policy",
            "round-robin",
            "--writer-flush-interval",
            "250ms",
            "--writer-max-batch-linger",
            "5ms",
            "--writer-statistics-log-interval",
            "off",
            "--writer-forbid-duplicate-keys-in-batch",
            "--writer-callback-pool-size",
            "3",
            "--writer-batch-request-type",
            "bulk-import",
        ]);

        let config = WriterConfig::from(&args);
        assert_eq!(config.bucket_count, 8);
        assert_eq!(config.write_mode, WriteMode::Sequential);
        assert_eq!(config.dispatch_policy, DispatchPolicy::RoundRobin);
        assert_eq!(config.flush_interval, Duration::from_millis(250));
        assert_eq!(config.max_batch_linger, Some(Duration::from_millis(5)));
        assert_eq!(config.statistics_log_interval, None);
        assert!(!config.allow_duplicate_keys_in_batch);
        assert_eq!(config.callback_pool_size, 3);
        assert_eq!(config.batch_request_type, BatchRequestType::BulkImport);
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let got = WriterConfigArgs::try_parse_from(["writer", "--writer-flush-interval", "soon"]);
        assert!(got.is_err());
    }
}
