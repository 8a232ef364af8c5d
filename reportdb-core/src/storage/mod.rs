//! Storage - day/counter sharded, memory-mapped partition files
//!
//! Layout under the base directory:
//!
//! ```text
//! <base>/<YYYY>/<MM>/<DD>/counter_<id>/partition_<p>.bin
//! <base>/<YYYY>/<MM>/<DD>/counter_<id>/index.json
//! ```

pub mod codec;
mod file;
mod index;
mod pool;
mod store;

pub use file::{partition_for, partition_path, FileHandle, FileManager, FILE_HEADER_LEN};
pub use index::{IndexEntry, IndexManager, INDEX_FILE};
pub use pool::{PoolStats, StorePool};
pub use store::{GenerationClock, StoreEngine};

use crate::{CounterId, ReportConfig, Timestamp};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Seconds per shard day
pub const DAY_SECS: u64 = 86_400;

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root of the shard tree
    pub base_dir: PathBuf,
    /// Partition files per shard
    pub partitions: u32,
    /// Bytes added per file growth
    pub file_growth_size: u64,
    /// Periodic index flush interval
    pub save_interval: Duration,
    /// Idle engine eviction threshold
    pub engine_idle: Option<Duration>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("database"),
            partitions: crate::config::PARTITIONS,
            file_growth_size: crate::config::FILE_GROWTH_SIZE,
            save_interval: Duration::from_secs(crate::config::SAVE_INDEX_INTERVAL_SECS),
            engine_idle: None,
        }
    }
}

impl From<&ReportConfig> for StorageConfig {
    fn from(config: &ReportConfig) -> Self {
        Self {
            base_dir: config.base_dir.clone(),
            partitions: config.partitions,
            file_growth_size: config.file_growth_size,
            save_interval: config.save_interval(),
            engine_idle: config.engine_idle(),
        }
    }
}

/// Midnight UTC of the day containing `ts`
pub fn day_start(ts: Timestamp) -> u64 {
    let ts = u64::from(ts);
    ts - ts % DAY_SECS
}

/// Midnight UTC of every day touched by `[from, to]`
pub fn days_in_range(from: Timestamp, to: Timestamp) -> Vec<u64> {
    if from > to {
        return Vec::new();
    }
    (day_start(from)..=day_start(to))
        .step_by(DAY_SECS as usize)
        .collect()
}

/// Shard directory for a counter on the day starting at `day`
pub fn shard_dir(base: &Path, counter_id: CounterId, day: u64) -> PathBuf {
    let date = DateTime::<Utc>::from_timestamp(day as i64, 0).unwrap_or_default();
    base.join(date.format("%Y/%m/%d").to_string())
        .join(format!("counter_{}", counter_id))
}

/// Shard directory an event with timestamp `ts` belongs to
pub fn shard_path(base: &Path, counter_id: CounterId, ts: Timestamp) -> PathBuf {
    shard_dir(base, counter_id, day_start(ts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_path_layout() {
        // 2024-01-02T03:04:05Z
        let path = shard_path(Path::new("/data"), 12, 1_704_164_645);
        assert_eq!(path, PathBuf::from("/data/2024/01/02/counter_12"));
    }

    #[test]
    fn test_days_in_range() {
        let day = 1_704_153_600; // 2024-01-02T00:00:00Z
        assert_eq!(days_in_range(day, day + 10), vec![u64::from(day)]);
        assert_eq!(
            days_in_range(day - 1, day),
            vec![u64::from(day) - DAY_SECS, u64::from(day)]
        );
        assert_eq!(days_in_range(day + 3 * 86_400 - 1, day).len(), 0);
        assert_eq!(days_in_range(day, day + 2 * 86_400).len(), 3);
    }
}
