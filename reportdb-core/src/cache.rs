//! TTL cache of decoded per-shard, per-object series

use crate::{DataPoint, ObjectId, TimeRange};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cache key for one object in one shard
pub fn cache_key(shard: &Path, object_id: ObjectId) -> String {
    format!("{}_{}", shard.display(), object_id)
}

/// A decoded series and the conditions it is valid under
#[derive(Debug, Clone)]
pub struct CachedSeries {
    /// Shard write generation when the series was read
    pub generation: u64,
    /// Time window the series was read for
    pub covered: TimeRange,
    pub points: Arc<Vec<DataPoint>>,
}

impl CachedSeries {
    pub fn new(generation: u64, covered: TimeRange, points: Vec<DataPoint>) -> Self {
        Self {
            generation,
            covered,
            points: Arc::new(points),
        }
    }

    /// Reusable for `window` if nothing was written since and it covers the window
    pub fn serves(&self, generation: u64, window: &TimeRange) -> bool {
        self.generation == generation
            && self.covered.start <= window.start
            && self.covered.end >= window.end
    }

    fn cost(&self) -> usize {
        self.points.len().max(1)
    }
}

/// Cache hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
}

/// Series cache capability injected into readers
pub trait SeriesCache: Send + Sync {
    fn get(&self, key: &str) -> Option<CachedSeries>;

    /// Returns false when the value is rejected (larger than the cache)
    fn set_with_ttl(&self, key: String, value: CachedSeries, ttl: Duration) -> bool;

    fn delete(&self, key: &str);

    /// Block until pending sets are visible
    fn wait(&self);

    fn metrics(&self) -> CacheMetrics;
}

struct Slot {
    value: CachedSeries,
    expires_at: Instant,
}

struct Slots {
    map: HashMap<String, Slot>,
    used: usize,
}

/// Capacity-bounded TTL cache; cost is the number of cached points
pub struct TtlCache {
    capacity: usize,
    slots: Mutex<Slots>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TtlCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: Mutex::new(Slots {
                map: HashMap::new(),
                used: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Points currently held
    pub fn used(&self) -> usize {
        self.slots.lock().used
    }

    fn remove_slot(slots: &mut Slots, key: &str) {
        if let Some(slot) = slots.map.remove(key) {
            slots.used -= slot.value.cost();
        }
    }

    fn make_room(slots: &mut Slots, cost: usize, capacity: usize, now: Instant) {
        if slots.used + cost <= capacity {
            return;
        }
        let expired: Vec<String> = slots
            .map
            .iter()
            .filter(|(_, s)| s.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            Self::remove_slot(slots, &key);
        }

        while slots.used + cost > capacity {
            let victim = slots
                .map
                .iter()
                .min_by_key(|(_, s)| s.expires_at)
                .map(|(k, _)| k.clone());
            match victim {
                Some(key) => Self::remove_slot(slots, &key),
                None => break,
            }
        }
    }
}

impl SeriesCache for TtlCache {
    fn get(&self, key: &str) -> Option<CachedSeries> {
        let mut slots = self.slots.lock();
        let now = Instant::now();
        let found = slots
            .map
            .get(key)
            .map(|slot| (slot.expires_at > now).then(|| slot.value.clone()));
        let live = match found {
            Some(Some(value)) => Some(value),
            Some(None) => {
                Self::remove_slot(&mut slots, key);
                None
            }
            None => None,
        };
        match live {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        live
    }

    fn set_with_ttl(&self, key: String, value: CachedSeries, ttl: Duration) -> bool {
        let cost = value.cost();
        if cost > self.capacity {
            return false;
        }
        let now = Instant::now();
        let mut slots = self.slots.lock();
        Self::remove_slot(&mut slots, &key);
        Self::make_room(&mut slots, cost, self.capacity, now);
        slots.used += cost;
        slots.map.insert(
            key,
            Slot {
                value,
                expires_at: now + ttl,
            },
        );
        true
    }

    fn delete(&self, key: &str) {
        Self::remove_slot(&mut self.slots.lock(), key);
    }

    fn wait(&self) {}

    fn metrics(&self) -> CacheMetrics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheMetrics {
            hits,
            misses,
            hit_ratio: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}
