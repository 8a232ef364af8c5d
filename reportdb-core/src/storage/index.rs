//! Per-shard object index persisted as `index.json`

use crate::{ObjectId, ReportError, Result, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Index file name inside a shard directory
pub const INDEX_FILE: &str = "index.json";

/// Where one object's records live inside a shard
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(rename = "starttime")]
    pub start_time: Timestamp,
    #[serde(rename = "endtime")]
    pub end_time: Timestamp,
    /// Record offsets in write order
    pub offsets: Vec<u64>,
    /// Timestamp of each offset; absent in indexes written without them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timestamps: Vec<Timestamp>,
}

impl IndexEntry {
    fn first(offset: u64, timestamp: Timestamp) -> Self {
        Self {
            start_time: timestamp,
            end_time: timestamp,
            offsets: vec![offset],
            timestamps: vec![timestamp],
        }
    }

    fn push(&mut self, offset: u64, timestamp: Timestamp) {
        self.end_time = timestamp;
        self.offsets.push(offset);
        self.timestamps.push(timestamp);
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Offsets of the records with `from <= ts <= to`.
    ///
    /// Callers check the entry overlaps `[from, to]` first. With per-record timestamps
    /// this is two binary searches and tolerates gaps; entries without them
    /// fall back to assuming one record per second starting at `start_time`.
    pub fn valid_offsets(&self, from: Timestamp, to: Timestamp) -> &[u64] {
        if from > to {
            return &[];
        }
        if self.timestamps.len() == self.offsets.len() && !self.timestamps.is_empty() {
            let start = self.timestamps.partition_point(|&t| t < from);
            let end = self.timestamps.partition_point(|&t| t <= to);
            return &self.offsets[start..end.max(start)];
        }

        let start = from.saturating_sub(self.start_time) as usize;
        let end = self
            .offsets
            .len()
            .saturating_sub(self.end_time.saturating_sub(to) as usize);
        &self.offsets[start.min(end)..end]
    }
}

#[derive(Default)]
struct IndexState {
    entries: HashMap<ObjectId, IndexEntry>,
    loaded: bool,
}

/// In-memory object index for one shard
pub struct IndexManager {
    path: PathBuf,
    state: RwLock<IndexState>,
}

impl IndexManager {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(INDEX_FILE),
            state: RwLock::new(IndexState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted index once, if nothing is in memory yet
    fn ensure_loaded(&self) -> Result<()> {
        if self.state.read().loaded {
            return Ok(());
        }
        let mut state = self.state.write();
        if state.loaded {
            return Ok(());
        }
        if state.entries.is_empty() && self.path.exists() {
            let content = fs::read(&self.path)?;
            state.entries = serde_json::from_slice(&content).map_err(|e| {
                ReportError::Corruption(format!("{}: {}", self.path.display(), e))
            })?;
            debug!(path = %self.path.display(), objects = state.entries.len(), "loaded index");
        }
        state.loaded = true;
        Ok(())
    }

    /// Record that `object_id`'s sample at `timestamp` lives at `offset`
    pub fn update(&self, object_id: ObjectId, offset: u64, timestamp: Timestamp) -> Result<()> {
        self.ensure_loaded()?;
        let mut state = self.state.write();
        match state.entries.get_mut(&object_id) {
            Some(entry) => entry.push(offset, timestamp),
            None => {
                state.entries.insert(object_id, IndexEntry::first(offset, timestamp));
            }
        }
        Ok(())
    }

    /// Last indexed timestamp of an object
    pub fn last_timestamp(&self, object_id: ObjectId) -> Result<Option<Timestamp>> {
        self.ensure_loaded()?;
        Ok(self.state.read().entries.get(&object_id).map(|e| e.end_time))
    }

    /// Copy of an object's entry
    pub fn get_index_map(&self, object_id: ObjectId) -> Result<Option<IndexEntry>> {
        self.ensure_loaded()?;
        Ok(self.state.read().entries.get(&object_id).cloned())
    }

    /// Offsets for `[from, to]`, distinguishing "unknown object" from "no overlap"
    pub fn get_valid_offsets(
        &self,
        object_id: ObjectId,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<u64>> {
        self.ensure_loaded()?;
        let state = self.state.read();
        let entry = state
            .entries
            .get(&object_id)
            .ok_or(ReportError::NoDataForObject { object_id })?;
        if entry.end_time < from || entry.start_time > to {
            return Err(ReportError::RangeNotCovered { object_id, from, to });
        }
        Ok(entry.valid_offsets(from, to).to_vec())
    }

    /// Every object in the shard, ascending
    pub fn keys(&self) -> Result<Vec<ObjectId>> {
        self.ensure_loaded()?;
        let mut keys: Vec<_> = self.state.read().entries.keys().copied().collect();
        keys.sort_unstable();
        Ok(keys)
    }

    /// Overwrite `index.json` with the in-memory map
    pub fn save(&self) -> Result<()> {
        self.ensure_loaded()?;
        let state = self.state.read();
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_vec(&state.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, &self.path)?;
        info!(path = %self.path.display(), objects = state.entries.len(), "saved index");
        Ok(())
    }
}
