//! Writer pool - routes event batches to writer workers by shard affinity

use crate::storage::codec::encode_value;
use crate::storage::{shard_path, StorePool};
use crate::{CounterMap, Event, ReportError, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Writer responsible for an event.
///
/// Every sample of one (counter, object) pair lands on the same writer, so
/// puts to an object are applied in arrival order.
pub fn writer_index(event: &Event, writers: usize) -> usize {
    let key = u64::from(event.counter_id) + u64::from(event.object_id);
    (key % writers.max(1) as u64) as usize
}

/// One writer worker
pub struct Writer {
    id: usize,
    base_dir: PathBuf,
    pool: Arc<StorePool>,
    counters: Arc<CounterMap>,
    written: Arc<AtomicU64>,
}

impl Writer {
    pub fn new(id: usize, pool: Arc<StorePool>, counters: Arc<CounterMap>) -> Self {
        Self {
            id,
            base_dir: pool.config().base_dir.clone(),
            pool,
            counters,
            written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Encode and append one event to its shard
    pub fn write(&self, event: &Event) -> Result<()> {
        let data_type = self.counters.data_type(event.counter_id)?;
        let payload = encode_value(event.counter_id, data_type, &event.value)?;
        let path = shard_path(&self.base_dir, event.counter_id, event.timestamp);
        let engine = self.pool.get_engine(&path, true)?;
        engine.put(event.object_id, event.timestamp, &payload)?;
        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drain the queue until every sender is gone; failed events are dropped
    fn run(self, mut events: mpsc::Receiver<Event>) {
        debug!(writer = self.id, "writer started");
        while let Some(event) = events.blocking_recv() {
            if let Err(e) = self.write(&event) {
                warn!(
                    writer = self.id,
                    object_id = event.object_id,
                    counter_id = event.counter_id,
                    timestamp = event.timestamp,
                    error = %e,
                    "dropping event"
                );
            }
        }
        debug!(writer = self.id, "writer stopped");
    }
}

/// Ingestion queue, broker and writer workers
pub struct WriterPool {
    ingest: Mutex<Option<mpsc::Sender<Vec<Event>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    written: Vec<Arc<AtomicU64>>,
}

impl WriterPool {
    /// Spawn `writers` workers and the broker that feeds them
    pub fn start(
        pool: Arc<StorePool>,
        counters: Arc<CounterMap>,
        writers: usize,
        events_buffer: usize,
        writer_buffer: usize,
    ) -> Self {
        let writers = writers.max(1);
        let mut senders = Vec::with_capacity(writers);
        let mut tasks = Vec::with_capacity(writers + 1);
        let mut written = Vec::with_capacity(writers);

        for id in 0..writers {
            let (tx, rx) = mpsc::channel(writer_buffer.max(1));
            let writer = Writer::new(id, pool.clone(), counters.clone());
            written.push(writer.written.clone());
            senders.push(tx);
            tasks.push(tokio::task::spawn_blocking(move || writer.run(rx)));
        }

        let (ingest, batches) = mpsc::channel(events_buffer.max(1));
        tasks.push(tokio::spawn(broker(batches, senders)));
        info!(writers, "writer pool started");

        Self {
            ingest: Mutex::new(Some(ingest)),
            tasks: Mutex::new(tasks),
            written,
        }
    }

    /// Queue a batch; waits while the ingestion queue is full
    pub async fn ingest(&self, batch: Vec<Event>) -> Result<()> {
        let sender = self
            .ingest
            .lock()
            .clone()
            .ok_or(ReportError::QueueClosed("ingestion"))?;
        sender
            .send(batch)
            .await
            .map_err(|_| ReportError::QueueClosed("ingestion"))
    }

    /// Events applied so far, across all writers
    pub fn written(&self) -> u64 {
        self.written.iter().map(|w| w.load(Ordering::Relaxed)).sum()
    }

    /// Close ingestion and wait for queued events to be written
    pub async fn shutdown(&self) {
        self.ingest.lock().take();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "writer task ended abnormally");
            }
        }
        info!(written = self.written(), "writer pool stopped");
    }
}

async fn broker(mut batches: mpsc::Receiver<Vec<Event>>, writers: Vec<mpsc::Sender<Event>>) {
    while let Some(batch) = batches.recv().await {
        for event in batch {
            let index = writer_index(&event, writers.len());
            let Some(writer) = writers.get(index) else {
                warn!(index, "no writer for event");
                continue;
            };
            if writer.send(event).await.is_err() {
                warn!(index, "writer queue closed, dropping event");
            }
        }
    }
}
