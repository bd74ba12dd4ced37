//! Drive a [`TableStoreWriter`] with concurrent producers against an
//! in-memory table store and print a JSON summary of the run.

use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, bail};
use clap::Parser;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tablestore_clap_blocks::{logging::LoggingConfig, writer::WriterConfigArgs};
use tablestore_writer::{
    FnCallback, RemoteRowError, TableStoreWriter, WriteClient, WriterConfig, WriterError,
    client::memory::InMemoryTableStore,
};
use tracing::{info, warn};

use crate::{
    generator::RowGenerator,
    report::{OutcomeTally, Report},
};

mod generator;
mod report;

const TABLE_NAME: &str = "load_test";

#[derive(Debug, Parser)]
#[clap(
    name = "tablestore_load_generator",
    about = "Generate write load through a table store writer"
)]
struct Config {
    #[clap(flatten)]
    logging: LoggingConfig,

    #[clap(flatten)]
    writer: WriterConfigArgs,

    /// A JSON writer config to use instead of the `--writer-*` flags. Fields
    /// left out take their defaults.
    #[clap(long = "writer-config-file", env = "TABLESTORE_LOAD_WRITER_CONFIG_FILE")]
    writer_config_file: Option<PathBuf>,

    /// Print the effective writer config as JSON and exit.
    #[clap(long = "print-config", default_value_t = false)]
    print_config: bool,

    /// Number of concurrent producer tasks.
    #[clap(
        short = 'p',
        long = "producers",
        env = "TABLESTORE_LOAD_PRODUCERS",
        default_value = "4"
    )]
    producers: usize,

    /// Number of rows each producer adds.
    #[clap(
        short = 'n',
        long = "rows-per-producer",
        env = "TABLESTORE_LOAD_ROWS_PER_PRODUCER",
        default_value = "10000"
    )]
    rows_per_producer: u64,

    /// Number of distinct primary keys rows are drawn from.
    #[clap(
        long = "key-cardinality",
        env = "TABLESTORE_LOAD_KEY_CARDINALITY",
        default_value = "100000"
    )]
    key_cardinality: u64,

    /// Number of attribute columns in each generated row.
    #[clap(
        long = "attribute-columns",
        env = "TABLESTORE_LOAD_ATTRIBUTE_COLUMNS",
        default_value = "6"
    )]
    attribute_columns: usize,

    /// Length of generated string values.
    #[clap(
        long = "value-size",
        env = "TABLESTORE_LOAD_VALUE_SIZE",
        default_value = "32"
    )]
    value_size: usize,

    /// Share of generated rows that are updates.
    #[clap(long = "update-ratio", default_value = "0.0")]
    update_ratio: f64,

    /// Share of generated rows that are deletes.
    #[clap(long = "delete-ratio", default_value = "0.0")]
    delete_ratio: f64,

    /// Latency the in-memory store adds to every request.
    #[clap(
        long = "store-latency",
        env = "TABLESTORE_LOAD_STORE_LATENCY",
        default_value = "2ms"
    )]
    store_latency: humantime::Duration,

    /// Share of rows the in-memory store rejects.
    #[clap(long = "reject-ratio", default_value = "0.0")]
    reject_ratio: f64,

    /// Make the store fail every row of a request that changes the same row
    /// twice, as the remote `BatchWriteRow` API does. Pair with
    /// `--writer-forbid-duplicate-keys-in-batch`.
    #[clap(long = "store-rejects-duplicates", default_value_t = false)]
    store_rejects_duplicates: bool,

    /// Number of requests, from the start of the run, the store fails as a
    /// whole.
    #[clap(long = "failed-submissions", default_value = "0")]
    failed_submissions: usize,

    /// Seed for the row generators. Random if not given.
    #[clap(long = "seed", env = "TABLESTORE_LOAD_SEED")]
    seed: Option<u64>,
}

impl Config {
    fn writer_config(&self) -> Result<WriterConfig, anyhow::Error> {
        let config = match &self.writer_config_file {
            Some(path) => load_writer_config(path)?,
            None => WriterConfig::from(&self.writer),
        };
        config.validate().context("invalid writer config")?;
        Ok(config)
    }
}

fn load_writer_config(path: &Path) -> Result<WriterConfig, anyhow::Error> {
    let file =
        File::open(path).with_context(|| format!("could not open {}", path.display()))?;
    serde_json::from_reader(file)
        .with_context(|| format!("could not parse writer config in {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::parse();
    config.logging.install_global_subscriber()?;

    let writer_config = config.writer_config()?;
    if config.print_config {
        println!("{}", serde_json::to_string_pretty(&writer_config)?);
        return Ok(());
    }

    if !(0.0..=1.0).contains(&config.reject_ratio) {
        bail!("--reject-ratio must be between 0 and 1");
    }
    if config.update_ratio + config.delete_ratio > 1.0 {
        bail!("--update-ratio and --delete-ratio must not add up to more than 1");
    }

    let seed = config.seed.unwrap_or_else(|| rand::thread_rng().r#gen());
    info!(seed, producers = config.producers, "starting load generation");

    let store = Arc::new(build_store(&config, seed));
    let tally = Arc::new(OutcomeTally::default());
    let callback = {
        let tally = Arc::clone(&tally);
        FnCallback::new(move |row, outcome| tally.record(row, outcome))
    };

    let writer = Arc::new(
        TableStoreWriter::builder(writer_config)
            .with_owned_client(Arc::clone(&store) as Arc<dyn WriteClient>)
            .with_result_callback(Arc::new(callback))
            .build()?,
    );

    let generator = RowGenerator::new(
        TABLE_NAME,
        config.key_cardinality,
        config.attribute_columns,
        config.value_size,
    )
    .with_mix(config.update_ratio, config.delete_ratio);
    let rejected = Arc::new(AtomicU64::new(0));

    let start = Instant::now();
    let mut tasks = Vec::with_capacity(config.producers);
    for producer in 0..config.producers {
        tasks.push(tokio::spawn(run_producer(
            Arc::clone(&writer),
            generator.clone(),
            config.rows_per_producer,
            StdRng::seed_from_u64(seed.wrapping_add(producer as u64)),
            Arc::clone(&rejected),
        )));
    }
    for task in tasks {
        task.await??;
    }

    writer.flush().await?;
    let elapsed = start.elapsed();
    let statistics = writer.statistics();
    writer.close().await?;

    let report = Report::new(
        writer_config,
        config.producers,
        config.rows_per_producer * config.producers as u64,
        rejected.load(Ordering::Relaxed),
        elapsed,
        &tally,
        &store.batch_sizes(),
        store.peak_in_progress(),
        statistics,
    );
    if !report.is_consistent() {
        warn!(?statistics, "row outcomes do not add up");
    }
    info!(
        rows = store.row_count(generator.table()),
        "rows stored at end of run"
    );
    println!("{}", report.to_json_string_pretty()?);

    Ok(())
}

fn build_store(config: &Config, seed: u64) -> InMemoryTableStore {
    // A long run must not hold on to every generated row.
    let mut store = InMemoryTableStore::default()
        .with_latency(Duration::from(config.store_latency))
        .without_row_recording();
    if config.store_rejects_duplicates {
        store = store.with_duplicate_rejection();
    }

    if config.reject_ratio > 0.0 {
        let ratio = config.reject_ratio;
        let rng = Mutex::new(StdRng::seed_from_u64(seed ^ 0x5eed));
        store = store.with_row_rejection(move |_| {
            (rng.lock().r#gen::<f64>() < ratio)
                .then(|| RemoteRowError::new("OTSServerBusy", "server is busy"))
        });
    }

    store.fail_next_submissions(config.failed_submissions);
    store
}

async fn run_producer(
    writer: Arc<TableStoreWriter>,
    generator: RowGenerator,
    rows: u64,
    mut rng: StdRng,
    rejected: Arc<AtomicU64>,
) -> Result<(), WriterError> {
    for _ in 0..rows {
        let row = generator.next_row(&mut rng);
        match writer.add_row(row).await {
            Ok(()) => {}
            Err(WriterError::Validation(e)) => {
                warn!(error = %e, "generated row rejected");
                rejected.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
