//! Store pool - lazily opened engines keyed by shard path

use super::store::{unix_now, GenerationClock, StoreEngine};
use super::StorageConfig;
use crate::{ReportError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Registry of open shard engines
pub struct StorePool {
    config: StorageConfig,
    engines: RwLock<HashMap<PathBuf, Arc<StoreEngine>>>,
    generations: GenerationClock,
    shutdown: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl StorePool {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            engines: RwLock::new(HashMap::new()),
            generations: GenerationClock::new(),
            shutdown: CancellationToken::new(),
            flusher: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Engine for a shard directory.
    ///
    /// Readers pass `is_for_put = false`; a shard directory that was never
    /// written then yields [`ReportError::EngineNotAvailable`] instead of an
    /// empty engine.
    pub fn get_engine(&self, path: &Path, is_for_put: bool) -> Result<Arc<StoreEngine>> {
        if let Some(engine) = self.engines.read().get(path) {
            return Ok(engine.clone());
        }

        let mut engines = self.engines.write();
        if let Some(engine) = engines.get(path) {
            return Ok(engine.clone());
        }

        if !is_for_put && !path.is_dir() {
            return Err(ReportError::EngineNotAvailable {
                path: path.display().to_string(),
            });
        }

        let engine = Arc::new(StoreEngine::new(
            path,
            self.config.partitions,
            self.config.file_growth_size,
            self.generations.clone(),
        ));
        engines.insert(path.to_path_buf(), engine.clone());
        Ok(engine)
    }

    /// Whether the shard has received writes in this process
    pub fn check_engine_used_put(&self, path: &Path) -> bool {
        self.engines
            .read()
            .get(path)
            .map(|e| e.is_used_put())
            .unwrap_or(false)
    }

    /// Start the periodic index flush (and idle eviction, if configured)
    pub fn save_engine(self: &Arc<Self>) {
        let mut flusher = self.flusher.lock();
        if flusher.is_some() {
            return;
        }

        let pool = Arc::clone(self);
        let token = self.shutdown.clone();
        let interval = self.config.save_interval;
        *flusher = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.flush_dirty_engines(false);
                        if let Some(idle) = pool.config.engine_idle {
                            pool.evict_idle(idle);
                        }
                    }
                }
            }
        }));
        info!(interval_secs = interval.as_secs(), "index flush scheduled");
    }

    /// Save every dirty engine; unless `force`, skip ones saved within the interval
    pub fn flush_dirty_engines(&self, force: bool) -> usize {
        let now = unix_now();
        let interval = self.config.save_interval.as_secs();
        let engines: Vec<_> = self.engines.read().values().cloned().collect();

        let mut saved = 0;
        for engine in engines {
            if !engine.is_dirty() {
                continue;
            }
            if !force && now.saturating_sub(engine.last_save()) < interval {
                continue;
            }
            match engine.save_index() {
                Ok(()) => saved += 1,
                Err(e) => error!(path = %engine.path().display(), error = %e, "index save failed"),
            }
        }
        saved
    }

    /// Drop engines untouched for `max_idle` that nobody else holds
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = unix_now();
        let evicted: Vec<(PathBuf, Arc<StoreEngine>)> = {
            let mut engines = self.engines.write();
            let idle: Vec<PathBuf> = engines
                .iter()
                .filter(|(_, e)| {
                    Arc::strong_count(e) == 1 && now.saturating_sub(e.last_access()) >= max_idle.as_secs()
                })
                .map(|(p, _)| p.clone())
                .collect();
            idle.into_iter()
                .filter_map(|path| engines.remove(&path).map(|engine| (path, engine)))
                .collect()
        };

        // Files are saved and released without holding the pool lock
        for (path, engine) in &evicted {
            if engine.is_dirty() {
                if let Err(e) = engine.save_index() {
                    warn!(path = %path.display(), error = %e, "index save before eviction failed");
                }
            }
            if let Err(e) = engine.close() {
                warn!(path = %path.display(), error = %e, "close on eviction failed");
            }
        }
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "evicted idle engines");
        }
        evicted.len()
    }

    /// Stop the flusher, save every dirty index and release all files
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let flusher = self.flusher.lock().take();
        if let Some(handle) = flusher {
            if let Err(e) = handle.await {
                warn!(error = %e, "index flusher ended abnormally");
            }
        }

        let saved = self.flush_dirty_engines(true);
        let mut engines = self.engines.write();
        for (path, engine) in engines.drain() {
            if let Err(e) = engine.close() {
                error!(path = %path.display(), error = %e, "close failed");
            }
        }
        info!(saved, "store pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        let engines = self.engines.read();
        PoolStats {
            engines: engines.len(),
            dirty: engines.values().filter(|e| e.is_dirty()).count(),
            written: engines.values().filter(|e| e.is_used_put()).count(),
        }
    }
}

/// Store pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub engines: usize,
    pub dirty: usize,
    pub written: usize,
}
