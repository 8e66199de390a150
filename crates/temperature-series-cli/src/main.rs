use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use temperature_series_api::{ReadingsQuery, TemperatureApi};
use temperature_series_core::{Reading, RetrievalConfig, DEFAULT_MAX_DATA_POINTS};
use temperature_series_store_sqlite::SqliteStore;
use time::OffsetDateTime;

const SEED_BATCH_SIZE: usize = 100;
const SEED_SPAN_SECONDS: i64 = 24 * 3600;
const SEED_TEMP_MIN: f64 = 20.0;
const SEED_TEMP_MAX: f64 = 30.0;
const SEED_ALARM_PROBABILITY: f64 = 0.1;

#[derive(Debug, Parser)]
#[command(name = "tsq")]
#[command(about = "Temperature series CLI")]
struct Cli {
    #[arg(long, env = "TEMPERATURE_DB", default_value = "./temperature_series.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Insert synthetic readings for one device.
    Seed(SeedArgs),
    /// Summarize the stored extent of one device.
    Inspect(InspectArgs),
    /// Run the readings query locally and print the response envelope.
    Query(QueryArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate,
}

#[derive(Debug, Args)]
struct SeedArgs {
    #[arg(long)]
    device: String,
    #[arg(long, default_value_t = 2500)]
    count: usize,
    /// Fixed RNG seed for reproducible data.
    #[arg(long)]
    seed: Option<u64>,
    /// End of the generated 24 hour span, epoch seconds. Defaults to now.
    #[arg(long)]
    now: Option<i64>,
}

#[derive(Debug, Args)]
struct InspectArgs {
    #[arg(long)]
    device: String,
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(long)]
    device: String,
    #[arg(long)]
    start: Option<String>,
    #[arg(long)]
    end: Option<String>,
    #[arg(long)]
    sampling_enabled: Option<String>,
    #[arg(long)]
    page: Option<String>,
    #[arg(long)]
    page_size: Option<String>,
    #[arg(long, default_value_t = DEFAULT_MAX_DATA_POINTS, value_parser = clap::value_parser!(u64).range(1..))]
    max_data_points: u64,
}

#[derive(Debug, Serialize)]
struct SeedSummary {
    device_id: String,
    inserted: usize,
    batches: usize,
    from_timestamp: i64,
    to_timestamp: i64,
}

#[derive(Debug, Serialize)]
struct InspectSummary {
    device_id: String,
    total_count: u64,
    first_timestamp: Option<i64>,
    last_timestamp: Option<i64>,
    duration_minutes: Option<i64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => run_db(&cli.db, &command),
        Command::Seed(args) => run_seed(&cli.db, &args),
        Command::Inspect(args) => run_inspect(&cli.db, &args),
        Command::Query(args) => run_query(&cli.db, args),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_db(db: &std::path::Path, command: &DbCommand) -> Result<()> {
    let api = TemperatureApi::new(db.to_path_buf(), RetrievalConfig::default());
    let status = match command {
        DbCommand::SchemaVersion => api.schema_status()?,
        DbCommand::Migrate => api.migrate()?,
    };
    print_json(&status)
}

fn run_seed(db: &std::path::Path, args: &SeedArgs) -> Result<()> {
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let now = args.now.unwrap_or_else(|| OffsetDateTime::now_utc().unix_timestamp());
    let readings = synthetic_readings(&mut rng, &args.device, args.count, now);

    let mut store = SqliteStore::open(db)?;
    store.migrate()?;

    let mut inserted = 0;
    let mut batches = 0;
    for batch in readings.chunks(SEED_BATCH_SIZE) {
        inserted += store
            .insert_readings(batch)
            .with_context(|| format!("failed to insert batch {}", batches + 1))?;
        batches += 1;
        tracing::info!(batch = batches, inserted, "seed batch committed");
    }

    print_json(&SeedSummary {
        device_id: args.device.clone(),
        inserted,
        batches,
        from_timestamp: now - SEED_SPAN_SECONDS,
        to_timestamp: now,
    })
}

/// Random readings spread over the 24 hours before `now`.
fn synthetic_readings<R: Rng>(rng: &mut R, device_id: &str, count: usize, now: i64) -> Vec<Reading> {
    (0..count)
        .map(|_| Reading {
            device_id: device_id.to_string(),
            timestamp: now - SEED_SPAN_SECONDS + rng.gen_range(0..SEED_SPAN_SECONDS),
            temperature: rng.gen_range(SEED_TEMP_MIN..SEED_TEMP_MAX),
            is_alarm: rng.gen_bool(SEED_ALARM_PROBABILITY),
        })
        .collect()
}

fn run_inspect(db: &std::path::Path, args: &InspectArgs) -> Result<()> {
    let api = TemperatureApi::new(db.to_path_buf(), RetrievalConfig::default());
    let span = api.device_span(&args.device)?;
    let duration_minutes = match (span.first_timestamp, span.last_timestamp) {
        (Some(first), Some(last)) => Some((last - first + 30) / 60),
        _ => None,
    };

    print_json(&InspectSummary {
        device_id: span.device_id,
        total_count: span.total_count,
        first_timestamp: span.first_timestamp,
        last_timestamp: span.last_timestamp,
        duration_minutes,
    })
}

fn run_query(db: &std::path::Path, args: QueryArgs) -> Result<()> {
    let config =
        RetrievalConfig { max_data_points: args.max_data_points, ..RetrievalConfig::default() };
    let api = TemperatureApi::new(db.to_path_buf(), config);
    let query = ReadingsQuery {
        start: args.start,
        end: args.end,
        sampling_enabled: args.sampling_enabled,
        page: args.page,
        page_size: args.page_size,
    };

    let envelope = api.fetch_readings(&args.device, &query)?;
    print_json(&envelope)
}
