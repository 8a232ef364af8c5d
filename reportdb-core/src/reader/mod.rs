//! Reader pool - answers range queries across day shards

mod router;

pub use router::ResponseRouter;

use crate::cache::{cache_key, CachedSeries, SeriesCache};
use crate::query::{bucket_count, BucketPolicy, ObjectSeries, QueryAggregator, QueryData};
use crate::storage::codec::decode_rows;
use crate::storage::{days_in_range, shard_dir, StoreEngine, StorePool, DAY_SECS};
use crate::{
    CounterMap, DataPoint, DataType, ObjectId, Query, QueryReceive, ReportError, Response, Result,
    TimeRange,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Reader pool settings
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub readers: usize,
    pub query_buffer: usize,
    /// Concurrent object fetches per query
    pub day_workers: usize,
    pub query_timeout: Duration,
    pub max_buckets: u64,
    pub cache_ttl: Duration,
}

/// Reader responsible for a request
pub fn reader_index(request_id: u64, readers: usize) -> usize {
    (request_id % readers.max(1) as u64) as usize
}

/// The part of `range` that falls on the day starting at `day`
fn day_window(range: &TimeRange, day: u64) -> TimeRange {
    let day_end = day + DAY_SECS - 1;
    let start = u64::from(range.start).max(day);
    let end = u64::from(range.end).min(day_end);
    TimeRange::new(start as u32, end as u32)
}

fn is_full_day(window: &TimeRange, day: u64) -> bool {
    u64::from(window.start) == day && u64::from(window.end) == day + DAY_SECS - 1
}

/// Decoded series of one day, keyed by object
type DaySeries = BTreeMap<ObjectId, Arc<Vec<DataPoint>>>;

/// Result of one queued object read
type Fetched = Option<(u64, ObjectId, Arc<Vec<DataPoint>>)>;

/// One shard a query reads
struct DayShard {
    day: u64,
    path: PathBuf,
    engine: Arc<StoreEngine>,
    window: TimeRange,
    cacheable: bool,
}

/// One reader worker
pub struct Reader {
    id: usize,
    base_dir: PathBuf,
    pool: Arc<StorePool>,
    cache: Arc<dyn SeriesCache>,
    counters: Arc<CounterMap>,
    fetchers: Arc<Semaphore>,
    query_timeout: Duration,
    max_buckets: u64,
    cache_ttl: Duration,
    /// Object IDs per shard, refreshed while the shard is being written
    keys: Mutex<HashMap<PathBuf, Vec<ObjectId>>>,
}

impl Reader {
    pub fn new(
        id: usize,
        pool: Arc<StorePool>,
        cache: Arc<dyn SeriesCache>,
        counters: Arc<CounterMap>,
        config: &ReaderConfig,
    ) -> Self {
        Self {
            id,
            base_dir: pool.config().base_dir.clone(),
            pool,
            cache,
            counters,
            fetchers: Arc::new(Semaphore::new(config.day_workers.max(1))),
            query_timeout: config.query_timeout,
            max_buckets: config.max_buckets,
            cache_ttl: config.cache_ttl,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch, merge and aggregate
    pub async fn query(&self, query: &Query) -> Result<QueryData> {
        let data_type = self.counters.data_type(query.counter_id)?;
        if data_type.is_numeric() {
            let buckets = bucket_count(query.interval, query.from, query.to, BucketPolicy::for_query(query));
            if buckets > self.max_buckets {
                return Err(ReportError::TooManyBuckets {
                    buckets,
                    max: self.max_buckets,
                });
            }
        }
        let results = self.fetch(query).await?;
        QueryAggregator::execute(query, data_type, results)
    }

    /// Answer one request; failures become error responses
    pub async fn execute(&self, request: &QueryReceive) -> Response {
        match self.query(&request.query).await {
            Ok(data) => Response::ok(request.request_id, data),
            Err(e) => {
                if e.is_not_found() {
                    debug!(reader = self.id, request_id = request.request_id, error = %e, "query found no data");
                } else {
                    warn!(reader = self.id, request_id = request.request_id, error = %e, "query failed");
                }
                Response::err(request.request_id, e)
            }
        }
    }

    /// Merged per-object series for the query range, bounded by the query timeout
    pub async fn fetch(&self, query: &Query) -> Result<ObjectSeries> {
        match tokio::time::timeout(self.query_timeout, self.fetch_data(query)).await {
            Ok(result) => result,
            Err(_) => Err(ReportError::Timeout),
        }
    }

    async fn fetch_data(&self, query: &Query) -> Result<ObjectSeries> {
        let data_type = self.counters.data_type(query.counter_id)?;
        let range = query.range();
        let mut by_day: BTreeMap<u64, DaySeries> = BTreeMap::new();
        let mut fetches = JoinSet::new();

        // Every day is queued before any read is awaited
        for day in days_in_range(query.from, query.to) {
            let path = shard_dir(&self.base_dir, query.counter_id, day);
            let engine = match self.pool.get_engine(&path, false) {
                Ok(engine) => engine,
                Err(e) => {
                    debug!(reader = self.id, path = %path.display(), error = %e, "skipping day");
                    continue;
                }
            };

            let objects = if query.object_ids.is_empty() {
                self.object_keys(&path, &engine)
            } else {
                query.object_ids.clone()
            };
            let window = day_window(&range, day);
            let shard = DayShard {
                day,
                // Partial boundary days rarely match a later window, only whole days are cached
                cacheable: is_full_day(&window, day),
                path,
                engine,
                window,
            };
            let cached = self.schedule_day(&shard, &objects, data_type, &mut fetches).await?;
            by_day.insert(day, cached);
        }

        while let Some(joined) = fetches.join_next().await {
            match joined {
                Ok(Some((day, object_id, points))) => {
                    by_day.entry(day).or_default().insert(object_id, points);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "fetch task failed"),
            }
        }

        let mut merged = ObjectSeries::new();
        for day_series in by_day.into_values() {
            for (object_id, points) in day_series {
                merged
                    .entry(object_id)
                    .or_default()
                    .extend(points.iter().filter(|p| range.contains(p.timestamp)).cloned());
            }
        }
        merged.retain(|_, points| !points.is_empty());
        Ok(merged)
    }

    /// Serve a shard's objects from the cache and queue reads for the rest
    async fn schedule_day(
        &self,
        shard: &DayShard,
        objects: &[ObjectId],
        data_type: DataType,
        fetches: &mut JoinSet<Fetched>,
    ) -> Result<DaySeries> {
        let mut series = DaySeries::new();
        let (day, window, cacheable) = (shard.day, shard.window, shard.cacheable);

        for &object_id in objects {
            let key = cache_key(&shard.path, object_id);
            let generation = shard.engine.write_generation();
            if let Some(cached) = self.cache.get(&key) {
                if cached.serves(generation, &window) {
                    series.insert(object_id, cached.points);
                    continue;
                }
            }

            let permit = self
                .fetchers
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ReportError::Shutdown)?;
            let engine = shard.engine.clone();
            let cache = self.cache.clone();
            let ttl = self.cache_ttl;
            fetches.spawn_blocking(move || {
                let _permit = permit;
                let rows = match engine.get(object_id, window.start, window.end) {
                    Ok(rows) => rows,
                    Err(e) if e.is_not_found() => return None,
                    Err(e) => {
                        warn!(object_id, error = %e, "shard read failed");
                        return None;
                    }
                };
                let (points, _) = decode_rows(&rows, data_type);
                if !cacheable {
                    return Some((day, object_id, Arc::new(points)));
                }
                let cached = CachedSeries::new(generation, window, points);
                let points = cached.points.clone();
                cache.set_with_ttl(key, cached, ttl);
                Some((day, object_id, points))
            });
        }
        Ok(series)
    }

    fn object_keys(&self, path: &Path, engine: &StoreEngine) -> Vec<ObjectId> {
        let mut keys = self.keys.lock();
        if !self.pool.check_engine_used_put(path) {
            if let Some(known) = keys.get(path) {
                return known.clone();
            }
        }
        let fresh = match engine.get_keys() {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "object keys unavailable");
                Vec::new()
            }
        };
        keys.insert(path.to_path_buf(), fresh.clone());
        fresh
    }

    async fn run(self, mut requests: mpsc::Receiver<QueryReceive>, responses: mpsc::Sender<Response>) {
        debug!(reader = self.id, "reader started");
        while let Some(request) = requests.recv().await {
            let response = self.execute(&request).await;
            if responses.send(response).await.is_err() {
                break;
            }
        }
        debug!(reader = self.id, "reader stopped");
    }
}

/// Query queue, broker and reader workers
pub struct ReaderPool {
    queries: Mutex<Option<mpsc::Sender<QueryReceive>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReaderPool {
    /// Spawn the readers; their responses go to `responses`
    pub fn start(
        pool: Arc<StorePool>,
        cache: Arc<dyn SeriesCache>,
        counters: Arc<CounterMap>,
        config: ReaderConfig,
        responses: mpsc::Sender<Response>,
    ) -> Self {
        let readers = config.readers.max(1);
        let mut senders = Vec::with_capacity(readers);
        let mut tasks = Vec::with_capacity(readers + 1);

        for id in 0..readers {
            let (tx, rx) = mpsc::channel(config.query_buffer.max(1));
            let reader = Reader::new(id, pool.clone(), cache.clone(), counters.clone(), &config);
            senders.push(tx);
            tasks.push(tokio::spawn(reader.run(rx, responses.clone())));
        }

        let (queries, incoming) = mpsc::channel(config.query_buffer.max(1));
        tasks.push(tokio::spawn(broker(incoming, senders)));
        info!(readers, "reader pool started");

        Self {
            queries: Mutex::new(Some(queries)),
            tasks: Mutex::new(tasks),
        }
    }

    pub async fn submit(&self, request: QueryReceive) -> Result<()> {
        let sender = self
            .queries
            .lock()
            .clone()
            .ok_or(ReportError::QueueClosed("query"))?;
        sender
            .send(request)
            .await
            .map_err(|_| ReportError::QueueClosed("query"))
    }

    /// Close the query queue and wait for in-flight queries
    pub async fn shutdown(&self) {
        self.queries.lock().take();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "reader task ended abnormally");
            }
        }
        info!("reader pool stopped");
    }
}

async fn broker(mut incoming: mpsc::Receiver<QueryReceive>, readers: Vec<mpsc::Sender<QueryReceive>>) {
    while let Some(request) = incoming.recv().await {
        let index = reader_index(request.request_id, readers.len());
        let Some(reader) = readers.get(index) else {
            warn!(index, "no reader for request");
            continue;
        };
        if reader.send(request).await.is_err() {
            warn!(index, "reader queue closed, dropping request");
        }
    }
}
