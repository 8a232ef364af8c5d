//! ReportDB Core - Counter Storage and Reporting Engine
//!
//! Stores polled counter samples for monitored objects and answers
//! aggregated range queries over them.
//!
//! # Architecture
//!
//! - **Storage**: one shard per (day, counter), holding memory-mapped
//!   append-only partition files and a JSON offset index
//! - **Writers**: a broker fans event batches out to writer tasks keyed by
//!   `(counter + object) % writers`
//! - **Readers**: a broker fans queries out to reader tasks that read shards
//!   day by day, through a TTL cache of decoded series
//! - **Aggregator**: gauge, grid and histogram views with AVG, MIN, MAX,
//!   SUM and COUNT

pub mod cache;
pub mod config;
pub mod db;
pub mod query;
pub mod reader;
pub mod storage;
pub mod writer;

mod error;
mod types;

pub use config::{CounterConfig, CounterMap, LogFormat, ReportConfig};
pub use db::ReportDb;
pub use error::{ReportError, Result};
pub use types::*;

/// ReportDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
