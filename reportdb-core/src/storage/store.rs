//! Store engine - one shard (counter, day) of partition files plus its index

use super::codec::{encode_record, row};
use super::file::{partition_for, FileManager};
use super::index::IndexManager;
use crate::{ObjectId, ReportError, Result, Timestamp};
use bytes::Bytes;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Write generations shared by every engine of one pool.
///
/// Values only ever grow, so an engine reopened after eviction can never
/// report a generation an earlier engine for the same shard already used.
#[derive(Debug, Clone, Default)]
pub struct GenerationClock(Arc<AtomicU64>);

impl GenerationClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Storage for one counter on one calendar day
pub struct StoreEngine {
    path: PathBuf,
    partitions: u32,
    files: FileManager,
    index: IndexManager,
    /// Set by the first put, never cleared
    used_put: AtomicBool,
    clock: GenerationClock,
    /// Stamped from `clock` after every completed put
    generation: AtomicU64,
    /// Generation covered by the last saved `index.json`
    saved_generation: AtomicU64,
    last_save: AtomicU64,
    last_access: AtomicU64,
}

impl StoreEngine {
    pub fn new(path: impl Into<PathBuf>, partitions: u32, growth: u64, clock: GenerationClock) -> Self {
        let path = path.into();
        let now = unix_now();
        let generation = clock.next();
        Self {
            files: FileManager::new(&path, growth),
            index: IndexManager::new(&path),
            path,
            partitions: partitions.max(1),
            used_put: AtomicBool::new(false),
            clock,
            generation: AtomicU64::new(generation),
            saved_generation: AtomicU64::new(generation),
            last_save: AtomicU64::new(now),
            last_access: AtomicU64::new(now),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn partition_of(&self, object_id: ObjectId) -> u32 {
        partition_for(object_id, self.partitions)
    }

    /// Append one encoded payload for `object_id`.
    ///
    /// The record is written before the index is updated, so a crash can
    /// leave unindexed bytes but never an index entry past written data.
    pub fn put(&self, object_id: ObjectId, timestamp: Timestamp, payload: &[u8]) -> Result<()> {
        self.touch();
        if let Some(last) = self.index.last_timestamp(object_id)? {
            if timestamp < last {
                return Err(ReportError::OutOfOrder {
                    object_id,
                    last,
                    got: timestamp,
                });
            }
        }

        self.used_put.store(true, Ordering::Release);

        let record = encode_record(timestamp, payload)?;
        let handle = self.files.get_handle(self.partition_of(object_id))?;
        self.files.ensure_capacity(&handle, record.len() as u64)?;
        let offset = handle.append(&record, self.files.growth())?;

        self.index.update(object_id, offset, timestamp)?;
        // Stamped after the index update: a save that snapshots the index
        // without this entry has already read an older generation.
        self.generation.fetch_max(self.clock.next(), Ordering::AcqRel);
        Ok(())
    }

    /// Raw `{ts}{payload}` rows of `object_id` within `[from, to]`
    pub fn get(&self, object_id: ObjectId, from: Timestamp, to: Timestamp) -> Result<Vec<Bytes>> {
        self.touch();
        let offsets = self.index.get_valid_offsets(object_id, from, to)?;
        if offsets.is_empty() {
            return Ok(Vec::new());
        }

        let handle = self.files.get_handle(self.partition_of(object_id))?;
        let mut rows = Vec::with_capacity(offsets.len());
        for offset in offsets {
            let (ts, payload) = handle.read_record(offset)?;
            rows.push(row(ts, &payload));
        }
        Ok(rows)
    }

    /// Every object with data in this shard
    pub fn get_keys(&self) -> Result<Vec<ObjectId>> {
        self.index.keys()
    }

    /// Persist the index; the engine stays dirty if a put lands meanwhile
    pub fn save_index(&self) -> Result<()> {
        let generation = self.write_generation();
        self.index.save()?;
        self.files.flush()?;
        self.saved_generation.fetch_max(generation, Ordering::AcqRel);
        self.last_save.store(unix_now(), Ordering::Release);
        Ok(())
    }

    pub fn is_used_put(&self) -> bool {
        self.used_put.load(Ordering::Acquire)
    }

    /// Writes not yet in `index.json`
    pub fn is_dirty(&self) -> bool {
        self.write_generation() != self.saved_generation.load(Ordering::Acquire)
    }

    /// Changes after every completed put, never repeats within a pool
    pub fn write_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn last_save(&self) -> u64 {
        self.last_save.load(Ordering::Acquire)
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Acquire)
    }

    fn touch(&self) {
        self.last_access.store(unix_now(), Ordering::Release);
    }

    /// Release partition files
    pub fn close(&self) -> Result<()> {
        self.files.close()
    }
}

impl fmt::Debug for StoreEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreEngine")
            .field("path", &self.path)
            .field("partitions", &self.partitions)
            .field("generation", &self.write_generation())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::{decode_row, encode_value};
    use crate::{DataPoint, DataType, Value};
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> StoreEngine {
        StoreEngine::new(dir.path().join("2024/01/02/counter_1"), 4, 256, GenerationClock::new())
    }

    #[test]
    fn test_put_then_get_single_float() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let payload = encode_value(1, DataType::Float64, &Value::F64(42.0)).unwrap();
        engine.put(3, 100, &payload).unwrap();

        let rows = engine.get(3, 100, 100).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            decode_row(&rows[0], DataType::Float64).unwrap(),
            DataPoint::new(100, 42.0)
        );
    }

    #[test]
    fn test_objects_share_partition_files() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        // 1 and 5 collide in partition 1 with four partitions
        for ts in 0..20u32 {
            engine.put(1, 1000 + ts, &u64::from(ts).to_le_bytes()).unwrap();
            engine.put(5, 1000 + ts, &u64::from(ts + 100).to_le_bytes()).unwrap();
        }
        assert_eq!(engine.partition_of(1), engine.partition_of(5));

        let rows = engine.get(5, 1005, 1007).unwrap();
        let points: Vec<_> = rows
            .iter()
            .map(|r| decode_row(r, DataType::Uint64).unwrap())
            .collect();
        assert_eq!(
            points,
            vec![
                DataPoint::new(1005, 105u64),
                DataPoint::new(1006, 106u64),
                DataPoint::new(1007, 107u64),
            ]
        );
        assert_eq!(engine.get_keys().unwrap(), vec![1, 5]);
    }

    #[test]
    fn test_get_errors_are_not_found() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine.put(1, 10, &[0; 8]).unwrap();

        let err = engine.get(2, 0, 100).unwrap_err();
        assert!(err.is_not_found());
        let err = engine.get(1, 11, 100).unwrap_err();
        assert!(matches!(err, ReportError::RangeNotCovered { .. }));
    }

    #[test]
    fn test_out_of_order_rejected_before_write() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine.put(1, 10, &[0; 8]).unwrap();
        engine.put(1, 10, &[1; 8]).unwrap();

        let generation = engine.write_generation();

        let err = engine.put(1, 9, &[2; 8]).unwrap_err();
        assert!(matches!(err, ReportError::OutOfOrder { last: 10, got: 9, .. }));
        assert_eq!(engine.get(1, 0, 100).unwrap().len(), 2);
        assert_eq!(engine.write_generation(), generation);
    }

    #[test]
    fn test_flags_and_save() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        assert!(!engine.is_used_put());
        assert!(!engine.is_dirty());

        engine.put(1, 10, &[0; 8]).unwrap();
        assert!(engine.is_used_put());
        assert!(engine.is_dirty());

        engine.save_index().unwrap();
        assert!(engine.is_used_put());
        assert!(!engine.is_dirty());
        assert!(engine.path().join("index.json").exists());
    }

    #[test]
    fn test_reopened_engine_never_reuses_generations() {
        let dir = TempDir::new().unwrap();
        let clock = GenerationClock::new();
        let path = dir.path().join("2024/01/02/counter_1");

        let first = StoreEngine::new(&path, 4, 256, clock.clone());
        first.put(1, 10, &[0; 8]).unwrap();
        let seen = first.write_generation();
        first.save_index().unwrap();
        first.close().unwrap();
        drop(first);

        let reopened = StoreEngine::new(&path, 4, 256, clock);
        assert!(reopened.write_generation() > seen);
        reopened.put(1, 20, &[1; 8]).unwrap();
        assert!(reopened.write_generation() > seen);
        assert_eq!(reopened.get(1, 0, 100).unwrap().len(), 2);
    }

    #[test]
    fn test_put_during_save_keeps_engine_dirty() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(engine(&dir));

        let writer = {
            let engine = engine.clone();
            std::thread::spawn(move || {
                for ts in 0..500u32 {
                    engine.put(ts % 7, ts, &u64::from(ts).to_le_bytes()).unwrap();
                }
            })
        };
        while !writer.is_finished() {
            engine.save_index().unwrap();
        }
        writer.join().unwrap();

        if engine.is_dirty() {
            engine.save_index().unwrap();
        }
        assert!(!engine.is_dirty());
        let path = engine.path().to_path_buf();
        engine.close().unwrap();

        let reopened = StoreEngine::new(&path, 4, 256, GenerationClock::new());
        let total: usize = (0..7).map(|object| reopened.get(object, 0, 500).unwrap().len()).sum();
        assert_eq!(total, 500);
    }

    #[test]
    fn test_debug_shows_shard() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let shown = format!("{:?}", engine);
        assert!(shown.contains("counter_1"));
        assert!(shown.contains("dirty: false"));
    }
}
