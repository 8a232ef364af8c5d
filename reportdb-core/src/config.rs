//! Process configuration and counter metadata

use crate::{CounterId, DataType, ReportError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Number of writer workers
pub const WRITERS: usize = 4;

/// Number of reader workers
pub const READERS: usize = 4;

/// Partition files per shard
pub const PARTITIONS: u32 = 4;

/// Bytes added to a partition file on each growth (1MB)
pub const FILE_GROWTH_SIZE: u64 = 1024 * 1024;

/// Seconds between index flushes
pub const SAVE_INDEX_INTERVAL_SECS: u64 = 10;

/// Per-query deadline
pub const QUERY_TIMEOUT_SECS: u64 = 3;

/// Most histogram buckets one query may ask for
pub const MAX_BUCKETS: u64 = 1_000_000;

/// Maximum cached points (1M)
pub const CACHE_CAPACITY: usize = 1_000_000;

/// Cached decode lifetime
pub const CACHE_TTL_SECS: u64 = 3600;

/// Counter metadata from the counter map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterConfig {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    /// Polling cadence in seconds
    #[serde(default)]
    pub polling_interval: u32,
}

impl CounterConfig {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            polling_interval: 1,
        }
    }
}

/// Counter ID to metadata lookup, read-only after startup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CounterMap(HashMap<CounterId, CounterConfig>);

impl CounterMap {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn with_counter(mut self, id: CounterId, counter: CounterConfig) -> Self {
        self.0.insert(id, counter);
        self
    }

    pub fn get(&self, id: CounterId) -> Option<&CounterConfig> {
        self.0.get(&id)
    }

    /// Declared type of a counter, unknown IDs are an error
    pub fn data_type(&self, id: CounterId) -> Result<DataType> {
        self.0
            .get(&id)
            .map(|c| c.data_type)
            .ok_or(ReportError::UnknownCounter(id))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Load a standalone `counter.json` style map
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReportError::Config(format!("failed to read counters {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            ReportError::Config(format!("invalid counters {}: {}", path.display(), e))
        })
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// ReportDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Root of the `<YYYY>/<MM>/<DD>/counter_<id>` tree
    pub base_dir: PathBuf,
    pub writers: usize,
    pub readers: usize,
    pub partitions: u32,
    /// Shared ingestion queue capacity
    pub events_buffer: usize,
    /// Per-writer queue capacity
    pub writer_buffer: usize,
    /// Per-reader queue capacity
    pub query_buffer: usize,
    pub response_buffer: usize,
    /// Concurrent per-object fetches for one query
    pub day_workers: usize,
    pub file_growth_size: u64,
    pub save_index_interval_secs: u64,
    pub query_timeout_secs: u64,
    /// Histogram queries spanning more buckets are rejected
    pub max_buckets: u64,
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
    /// Drop engines untouched for this long, 0 keeps them forever
    pub engine_idle_secs: u64,
    pub listen_addr: String,
    pub log_level: String,
    pub log_format: LogFormat,
    /// Optional external counter map, merged over `counters`
    pub counters_file: Option<PathBuf>,
    pub counters: CounterMap,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("database"),
            writers: WRITERS,
            readers: READERS,
            partitions: PARTITIONS,
            events_buffer: 10_000,
            writer_buffer: 1_000,
            query_buffer: 100,
            response_buffer: 100,
            day_workers: 8,
            file_growth_size: FILE_GROWTH_SIZE,
            save_index_interval_secs: SAVE_INDEX_INTERVAL_SECS,
            query_timeout_secs: QUERY_TIMEOUT_SECS,
            max_buckets: MAX_BUCKETS,
            cache_capacity: CACHE_CAPACITY,
            cache_ttl_secs: CACHE_TTL_SECS,
            engine_idle_secs: 0,
            listen_addr: "0.0.0.0:6003".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            counters_file: None,
            counters: CounterMap::new(),
        }
    }
}

impl ReportConfig {
    /// Read a JSON config file, resolve the counter map and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReportError::Config(format!("failed to read config {}: {}", path.display(), e))
        })?;
        let mut config: ReportConfig = serde_json::from_str(&content).map_err(|e| {
            ReportError::Config(format!("invalid config {}: {}", path.display(), e))
        })?;

        if let Some(counters_file) = config.counters_file.clone() {
            let counters_path = match path.parent() {
                Some(dir) if counters_file.is_relative() => dir.join(&counters_file),
                _ => counters_file,
            };
            let external = CounterMap::load(counters_path)?;
            config.counters.0.extend(external.0);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the process cannot serve with
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("writers", self.writers),
            ("readers", self.readers),
            ("partitions", self.partitions as usize),
            ("events_buffer", self.events_buffer),
            ("writer_buffer", self.writer_buffer),
            ("query_buffer", self.query_buffer),
            ("response_buffer", self.response_buffer),
            ("day_workers", self.day_workers),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ReportError::Config(format!("{} must be greater than 0", name)));
            }
        }
        if self.file_growth_size == 0 {
            return Err(ReportError::Config("file_growth_size must be greater than 0".into()));
        }
        if self.save_index_interval_secs == 0 {
            return Err(ReportError::Config(
                "save_index_interval_secs must be greater than 0".into(),
            ));
        }
        if self.query_timeout_secs == 0 {
            return Err(ReportError::Config("query_timeout_secs must be greater than 0".into()));
        }
        if self.max_buckets == 0 {
            return Err(ReportError::Config("max_buckets must be greater than 0".into()));
        }
        if self.counters.is_empty() {
            return Err(ReportError::Config("no counters configured".into()));
        }
        Ok(())
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn with_workers(mut self, writers: usize, readers: usize) -> Self {
        self.writers = writers;
        self.readers = readers;
        self
    }

    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_file_growth_size(mut self, bytes: u64) -> Self {
        self.file_growth_size = bytes;
        self
    }

    pub fn with_counter(mut self, id: CounterId, counter: CounterConfig) -> Self {
        self.counters.0.insert(id, counter);
        self
    }

    pub fn with_query_timeout(mut self, secs: u64) -> Self {
        self.query_timeout_secs = secs;
        self
    }

    pub fn with_max_buckets(mut self, max: u64) -> Self {
        self.max_buckets = max;
        self
    }

    pub fn with_engine_idle(mut self, secs: u64) -> Self {
        self.engine_idle_secs = secs;
        self
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_index_interval_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn engine_idle(&self) -> Option<Duration> {
        (self.engine_idle_secs > 0).then(|| Duration::from_secs(self.engine_idle_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> ReportConfig {
        ReportConfig::default().with_counter(1, CounterConfig::new("cpu", DataType::Float64))
    }

    #[test]
    fn test_default_validates_with_counter() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_empty_counters_rejected() {
        let err = ReportConfig::default().validate().unwrap_err();
        assert!(matches!(err, ReportError::Config(_)));
    }

    #[test]
    fn test_zero_pool_rejected() {
        let err = sample().with_workers(0, 2).validate().unwrap_err();
        assert!(err.to_string().contains("writers"));

        let err = sample().with_partitions(0).validate().unwrap_err();
        assert!(err.to_string().contains("partitions"));

        let err = sample().with_max_buckets(0).validate().unwrap_err();
        assert!(err.to_string().contains("max_buckets"));
    }

    #[test]
    fn test_load_with_external_counters() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("counter.json"),
            r#"{"1": {"name": "uptime", "type": "uint64"}, "2": {"name": "host", "type": "string"}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"writers": 2, "partitions": 8, "counters_file": "counter.json"}"#,
        )
        .unwrap();

        let config = ReportConfig::load(dir.path().join("config.json")).unwrap();
        assert_eq!(config.writers, 2);
        assert_eq!(config.partitions, 8);
        assert_eq!(config.readers, READERS);
        assert_eq!(config.counters.data_type(1).unwrap(), DataType::Uint64);
        assert_eq!(config.counters.data_type(2).unwrap(), DataType::String);
        assert!(matches!(
            config.counters.data_type(3),
            Err(ReportError::UnknownCounter(3))
        ));
    }

    #[test]
    fn test_unknown_type_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"counters": {"1": {"type": "int32"}}}"#).unwrap();

        let err = ReportConfig::load(&path).unwrap_err();
        assert!(matches!(err, ReportError::Config(_)));
    }
}
