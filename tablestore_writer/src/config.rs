//! Writer configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The default number of buckets.
pub const DEFAULT_BUCKET_COUNT: usize = 3;

/// The default maximum number of batches outstanding across all buckets.
pub const DEFAULT_MAX_IN_FLIGHT_BATCHES: usize = 10;

/// The default maximum number of rows in a single batch request.
pub const DEFAULT_MAX_BATCH_ROWS: usize = 200;

/// The default maximum serialised size of a single batch request.
pub const DEFAULT_MAX_BATCH_BYTES: usize = 4 * 1024 * 1024;

/// The default maximum number of columns across all rows of a batch.
pub const DEFAULT_MAX_BATCH_COLUMNS: usize = DEFAULT_MAX_BATCH_ROWS * DEFAULT_MAX_ATTRIBUTE_COLUMNS;

/// The default maximum number of attribute columns in a single row.
pub const DEFAULT_MAX_ATTRIBUTE_COLUMNS: usize = 128;

/// The default maximum size of a single attribute column value.
pub const DEFAULT_MAX_ATTRIBUTE_COLUMN_SIZE: usize = 2 * 1024 * 1024;

/// The default maximum size of a single primary key column value.
pub const DEFAULT_MAX_PRIMARY_KEY_COLUMN_SIZE: usize = 1024;

/// The default per-bucket queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// The default interval between scheduled flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// The default interval between statistics log lines.
pub const DEFAULT_STATISTICS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Errors found when validating a [`WriterConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },

    #[error("{name} must be a non-zero duration")]
    ZeroDuration { name: &'static str },

    #[error("the writer requires a write client")]
    MissingClient,
}

/// How a bucket consumer paces its batch submissions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Wait for the result of each batch before submitting the next one from
    /// the same bucket, preserving the applied order of rows in a bucket.
    Sequential,
    /// Allow several batches from one bucket to be outstanding at once,
    /// bounded by the shared in-flight limit. Only submission order is
    /// preserved.
    #[default]
    Parallel,
}

/// How rows are mapped to buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Hash the table name and the full primary key; every change to a row
    /// lands in the same bucket.
    #[default]
    HashPrimaryKey,
    /// Hash the table name and the partition key (the first primary key
    /// column); every change to a partition lands in the same bucket.
    HashPartitionKey,
    /// Cycle through the buckets with no data locality.
    RoundRobin,
}

/// The remote batch API a request is meant for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchRequestType {
    #[default]
    BatchWriteRow,
    BulkImport,
}

/// Configuration of a [`TableStoreWriter`].
///
/// The bucket count and dispatch policy are fixed for the life of a writer.
///
/// [`TableStoreWriter`]: crate::TableStoreWriter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub bucket_count: usize,
    pub dispatch_policy: DispatchPolicy,
    pub write_mode: WriteMode,
    /// Upper bound on batches submitted but not yet resolved, across all
    /// buckets.
    pub max_in_flight_batches: usize,
    pub max_batch_rows: usize,
    pub max_batch_bytes: usize,
    pub max_batch_columns: usize,
    pub max_attribute_columns: usize,
    pub max_attribute_column_size: usize,
    pub max_primary_key_column_size: usize,
    /// Capacity of each bucket's queue, in entries.
    pub queue_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// If set, a non-empty batch is closed once it has been open this long.
    #[serde(with = "humantime_serde")]
    pub max_batch_linger: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub statistics_log_interval: Option<Duration>,
    /// When false, a batch never holds two changes to the same row.
    pub allow_duplicate_keys_in_batch: bool,
    /// Number of threads the owned callback executor runs.
    pub callback_pool_size: usize,
    pub batch_request_type: BatchRequestType,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            bucket_count: DEFAULT_BUCKET_COUNT,
            dispatch_policy: DispatchPolicy::default(),
            write_mode: WriteMode::default(),
            max_in_flight_batches: DEFAULT_MAX_IN_FLIGHT_BATCHES,
            max_batch_rows: DEFAULT_MAX_BATCH_ROWS,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            max_batch_columns: DEFAULT_MAX_BATCH_COLUMNS,
            max_attribute_columns: DEFAULT_MAX_ATTRIBUTE_COLUMNS,
            max_attribute_column_size: DEFAULT_MAX_ATTRIBUTE_COLUMN_SIZE,
            max_primary_key_column_size: DEFAULT_MAX_PRIMARY_KEY_COLUMN_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_batch_linger: None,
            statistics_log_interval: Some(DEFAULT_STATISTICS_LOG_INTERVAL),
            allow_duplicate_keys_in_batch: true,
            callback_pool_size: num_cpus::get() + 1,
            batch_request_type: BatchRequestType::default(),
        }
    }
}

impl WriterConfig {
    /// Check every limit is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("bucket_count", self.bucket_count),
            ("max_in_flight_batches", self.max_in_flight_batches),
            ("max_batch_rows", self.max_batch_rows),
            ("max_batch_bytes", self.max_batch_bytes),
            ("max_batch_columns", self.max_batch_columns),
            ("max_attribute_columns", self.max_attribute_columns),
            ("max_attribute_column_size", self.max_attribute_column_size),
            ("max_primary_key_column_size", self.max_primary_key_column_size),
            ("queue_capacity", self.queue_capacity),
            ("callback_pool_size", self.callback_pool_size),
        ];
        if let Some((name, _)) = counts.into_iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero { name });
        }

        let durations = [
            ("flush_interval", Some(self.flush_interval)),
            ("max_batch_linger", self.max_batch_linger),
            ("statistics_log_interval", self.statistics_log_interval),
        ];
        if let Some((name, _)) = durations
            .into_iter()
            .find(|(_, d)| d.is_some_and(|d| d.is_zero()))
        {
            return Err(ConfigError::ZeroDuration { name });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_default_is_valid() {
        WriterConfig::default()
            .validate()
            .expect("default config must be valid");
    }

    #[test]
    fn test_zero_limits_rejected() {
        let config = WriterConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert_matches!(
            config.validate(),
            Err(ConfigError::Zero {
                name: "queue_capacity"
            })
        );

        let config = WriterConfig {
            max_batch_linger: Some(Duration::ZERO),
            ..Default::default()
        };
        assert_matches!(
            config.validate(),
            Err(ConfigError::ZeroDuration {
                name: "max_batch_linger"
            })
        );
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: WriterConfig = serde_json::from_str(
            r#"{
                "bucket_count": 8,
                "write_mode": "sequential",
                "dispatch_policy": "round_robin",
                "flush_interval": "250ms",
                "max_batch_linger": "5ms"
            }"#,
        )
        .expect("valid config json");

        assert_eq!(config.bucket_count, 8);
        assert_eq!(config.write_mode, WriteMode::Sequential);
        assert_eq!(config.dispatch_policy, DispatchPolicy::RoundRobin);
        assert_eq!(config.flush_interval, Duration::from_millis(250));
        assert_eq!(config.max_batch_linger, Some(Duration::from_millis(5)));
        assert_eq!(config.max_batch_rows, DEFAULT_MAX_BATCH_ROWS);
    }
}
