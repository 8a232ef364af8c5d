//! ReportDb - wires storage, cache, writers and readers together

use crate::cache::{CacheMetrics, SeriesCache, TtlCache};
use crate::reader::{ReaderConfig, ReaderPool, ResponseRouter};
use crate::storage::{PoolStats, StorageConfig, StorePool};
use crate::writer::WriterPool;
use crate::{Event, QueryReceive, ReportConfig, ReportError, Response, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A running ReportDB instance.
///
/// Must be started inside a tokio runtime.
pub struct ReportDb {
    config: ReportConfig,
    pool: Arc<StorePool>,
    cache: Arc<TtlCache>,
    writers: WriterPool,
    readers: ReaderPool,
    router: Arc<ResponseRouter>,
    routing: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ReportDb {
    /// Validate the configuration and start every pipeline
    pub fn start(config: ReportConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.base_dir)?;

        let pool = Arc::new(StorePool::new(StorageConfig::from(&config)));
        pool.save_engine();

        let counters = Arc::new(config.counters.clone());
        let cache = Arc::new(TtlCache::new(config.cache_capacity));

        let writers = WriterPool::start(
            pool.clone(),
            counters.clone(),
            config.writers,
            config.events_buffer,
            config.writer_buffer,
        );

        let (responses_tx, responses_rx) = mpsc::channel(config.response_buffer.max(1));
        let router = Arc::new(ResponseRouter::new());
        let routing = router.spawn(responses_rx);

        let readers = ReaderPool::start(
            pool.clone(),
            cache.clone(),
            counters,
            ReaderConfig {
                readers: config.readers,
                query_buffer: config.query_buffer,
                day_workers: config.day_workers,
                query_timeout: config.query_timeout(),
                max_buckets: config.max_buckets,
                cache_ttl: config.cache_ttl(),
            },
            responses_tx,
        );

        info!(
            base_dir = %config.base_dir.display(),
            counters = config.counters.len(),
            writers = config.writers,
            readers = config.readers,
            "ReportDB started"
        );

        Ok(Self {
            config,
            pool,
            cache,
            writers,
            readers,
            router,
            routing: Mutex::new(Some(routing)),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ReportConfig {
        &self.config
    }

    /// Queue a batch of events for writing
    pub async fn ingest(&self, batch: Vec<Event>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.writers.ingest(batch).await
    }

    /// Run a query and wait for its response
    pub async fn query(&self, request: QueryReceive) -> Response {
        let request_id = request.request_id;
        let waiter = match self.router.register(request_id) {
            Ok(waiter) => waiter,
            Err(e) => return Response::err(request_id, e),
        };
        if let Err(e) = self.readers.submit(request).await {
            self.router.cancel(request_id);
            return Response::err(request_id, e);
        }
        waiter
            .await
            .unwrap_or_else(|_| Response::err(request_id, ReportError::Shutdown))
    }

    pub fn cache_metrics(&self) -> CacheMetrics {
        self.cache.metrics()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Events written so far
    pub fn events_written(&self) -> u64 {
        self.writers.written()
    }

    pub fn pending_queries(&self) -> usize {
        self.router.pending()
    }

    /// Drain writers, fail pending queries, then flush and close storage
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down ReportDB");

        self.writers.shutdown().await;
        self.router.shutdown();
        self.readers.shutdown().await;

        let routing = self.routing.lock().take();
        if let Some(task) = routing {
            if let Err(e) = task.await {
                warn!(error = %e, "response routing ended abnormally");
            }
        }

        self.pool.shutdown().await;
        info!("ReportDB stopped");
    }
}
