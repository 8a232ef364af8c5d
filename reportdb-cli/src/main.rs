//! ReportDB CLI - offline queries against a data directory

use anyhow::{bail, Context};
use chrono::{DateTime, NaiveDate};
use clap::{Parser, Subcommand};
use reportdb_core::cache::TtlCache;
use reportdb_core::reader::{Reader, ReaderConfig};
use reportdb_core::storage::{shard_dir, StorageConfig, StorePool};
use reportdb_core::{ObjectId, Query, ReportConfig, Timestamp};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "reportdb-cli")]
#[command(about = "Inspect and query a ReportDB data directory", long_about = None)]
struct Cli {
    /// JSON configuration file (counter map and data directory)
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Override the data directory
    #[arg(short, long)]
    base_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an aggregated range query and print the result as JSON
    Query(QueryArgs),
    /// List the objects stored for a counter on one day
    Keys {
        #[arg(long)]
        counter: u16,
        /// Day as YYYY-MM-DD (UTC)
        #[arg(long)]
        date: String,
    },
}

#[derive(Parser, Debug)]
struct QueryArgs {
    #[arg(long)]
    counter: u16,

    /// Unix seconds or RFC 3339
    #[arg(long)]
    from: String,

    /// Unix seconds or RFC 3339
    #[arg(long)]
    to: String,

    /// Comma-separated object IDs; all objects when omitted
    #[arg(long, value_delimiter = ',')]
    objects: Vec<ObjectId>,

    #[arg(long, default_value = "")]
    aggregation: String,

    /// Histogram bucket width in seconds
    #[arg(long, default_value_t = 0)]
    interval: u32,

    /// One result per object
    #[arg(long)]
    group: bool,

    /// Leave samples at exactly `to` out of the last bucket
    #[arg(long)]
    half_open: bool,
}

fn parse_time(value: &str) -> anyhow::Result<Timestamp> {
    if let Ok(ts) = value.parse::<Timestamp>() {
        return Ok(ts);
    }
    let parsed = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid time {:?}", value))?;
    Timestamp::try_from(parsed.timestamp()).with_context(|| format!("time {:?} out of range", value))
}

fn parse_day(value: &str) -> anyhow::Result<u64> {
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("invalid date {:?}", value))?;
    let Some(midnight) = date.and_hms_opt(0, 0, 0) else {
        bail!("invalid date {:?}", value);
    };
    u64::try_from(midnight.and_utc().timestamp()).with_context(|| format!("date {:?} before 1970", value))
}

async fn run_query(config: &ReportConfig, pool: Arc<StorePool>, args: QueryArgs) -> anyhow::Result<()> {
    let from = parse_time(&args.from)?;
    let to = parse_time(&args.to)?;
    if from > to {
        bail!("--from must not be after --to");
    }

    let query = Query::new(args.counter, from, to)
        .with_objects(args.objects)
        .with_aggregation(args.aggregation)
        .with_interval(args.interval)
        .grouped(args.group)
        .with_inclusive_end(!args.half_open);

    let reader = Reader::new(
        0,
        pool,
        Arc::new(TtlCache::new(config.cache_capacity)),
        Arc::new(config.counters.clone()),
        &ReaderConfig {
            readers: 1,
            query_buffer: 1,
            day_workers: config.day_workers,
            query_timeout: config.query_timeout(),
            max_buckets: config.max_buckets,
            cache_ttl: config.cache_ttl(),
        },
    );

    let data = reader.query(&query).await?;
    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(())
}

fn list_keys(config: &ReportConfig, pool: &StorePool, counter: u16, date: &str) -> anyhow::Result<()> {
    let day = parse_day(date)?;
    let path = shard_dir(&config.base_dir, counter, day);
    let engine = pool.get_engine(&path, false)?;
    let keys = engine.get_keys()?;
    println!("{}", serde_json::to_string(&keys)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ReportConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(base_dir) = cli.base_dir {
        config.base_dir = base_dir;
    }

    // Read-only: no flusher, nothing is ever written
    let pool = Arc::new(StorePool::new(StorageConfig::from(&config)));

    match cli.command {
        Command::Query(args) => run_query(&config, pool, args).await,
        Command::Keys { counter, date } => list_keys(&config, &pool, counter, &date),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("1704153600").unwrap(), 1_704_153_600);
        assert_eq!(parse_time("2024-01-02T00:00:00Z").unwrap(), 1_704_153_600);
        assert!(parse_time("yesterday").is_err());
        assert!(parse_time("1960-01-01T00:00:00Z").is_err());
    }

    #[test]
    fn test_parse_day() {
        assert_eq!(parse_day("2024-01-02").unwrap(), 1_704_153_600);
        assert!(parse_day("2024-13-01").is_err());
    }
}
