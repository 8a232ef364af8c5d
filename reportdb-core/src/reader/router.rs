//! Response router - hands reader responses to the caller waiting on them

use crate::{ReportError, Response, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Request ID to waiter registry
#[derive(Default)]
pub struct ResponseRouter {
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    closed: AtomicBool,
}

impl ResponseRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter before the query is submitted
    pub fn register(&self, request_id: u64) -> Result<oneshot::Receiver<Response>> {
        let mut pending = self.pending.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(ReportError::Shutdown);
        }
        if pending.contains_key(&request_id) {
            return Err(ReportError::DuplicateRequest(request_id));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(request_id, tx);
        Ok(rx)
    }

    /// Forget a waiter whose query never reached a reader
    pub fn cancel(&self, request_id: u64) {
        self.pending.lock().remove(&request_id);
    }

    /// Deliver a response; false when nobody is waiting for it
    pub fn deliver(&self, response: Response) -> bool {
        let waiter = self.pending.lock().remove(&response.request_id);
        match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                debug!(request_id = response.request_id, "response without waiter");
                false
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Route responses from readers until the channel closes
    pub fn spawn(self: &Arc<Self>, mut responses: mpsc::Receiver<Response>) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(response) = responses.recv().await {
                router.deliver(response);
            }
        })
    }

    /// Reject new waiters and fail every pending one
    pub fn shutdown(&self) {
        let mut pending = self.pending.lock();
        self.closed.store(true, Ordering::Release);
        let count = pending.len();
        for (request_id, tx) in pending.drain() {
            let _ = tx.send(Response::err(request_id, ReportError::Shutdown));
        }
        info!(failed = count, "response router closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Aggregated, QueryData};

    #[tokio::test]
    async fn test_routes_by_request_id() {
        let router = Arc::new(ResponseRouter::new());
        let (tx, rx) = mpsc::channel(4);
        let task = router.spawn(rx);

        let first = router.register(1).unwrap();
        let second = router.register(2).unwrap();
        tx.send(Response::err(2, "boom")).await.unwrap();
        tx.send(Response::ok(1, QueryData::Gauge(Some(Aggregated::Number(1.0)))))
            .await
            .unwrap();

        assert!(!first.await.unwrap().is_error());
        assert_eq!(second.await.unwrap().error.as_deref(), Some("boom"));
        assert_eq!(router.pending(), 0);

        drop(tx);
        task.await.unwrap();
    }

    #[test]
    fn test_duplicate_and_cancel() {
        let router = ResponseRouter::new();
        let _rx = router.register(7).unwrap();
        assert!(matches!(router.register(7), Err(ReportError::DuplicateRequest(7))));
        router.cancel(7);
        assert!(router.register(7).is_ok());
        assert!(!router.deliver(Response::err(8, "late")));
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_waiters() {
        let router = ResponseRouter::new();
        let waiter = router.register(3).unwrap();
        router.shutdown();

        let response = waiter.await.unwrap();
        assert_eq!(response.request_id, 3);
        assert_eq!(response.error.as_deref(), Some("server shutdown"));
        assert!(matches!(router.register(4), Err(ReportError::Shutdown)));
    }
}
