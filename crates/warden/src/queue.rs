//! Degraded-mode alert queue.
//!
//! When the store is unavailable, attempt rows are held in a bounded
//! in-memory FIFO and drained in batches once the database recovers. While
//! the queue is non-empty the health endpoint reports `degraded`. On
//! overflow the oldest record is dropped (and counted) to make room.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::store::{RemediationAttempt, Store};

/// Maximum records held in memory.
const MAX_QUEUE_SIZE: usize = 500;
/// Seconds between drain attempts.
const DRAIN_INTERVAL: Duration = Duration::from_secs(30);
/// Records persisted per drain tick.
const DRAIN_BATCH_SIZE: usize = 100;

/// Queue statistics for the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub queue_depth: usize,
    pub total_queued: u64,
    pub total_drained: u64,
    pub total_dropped: u64,
    pub oldest_alert: Option<String>,
}

/// In-memory queue for attempt rows during database outages.
pub struct AlertQueue {
    store: Arc<Store>,
    queue: Mutex<VecDeque<RemediationAttempt>>,
    total_queued: AtomicU64,
    total_drained: AtomicU64,
    total_dropped: AtomicU64,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AlertQueue {
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            queue: Mutex::new(VecDeque::new()),
            total_queued: AtomicU64::new(0),
            total_drained: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Start the background drain task.
    pub fn start(self: &Arc<Self>) {
        let queue = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(DRAIN_INTERVAL).await;
                queue.drain().await;
            }
        });
        *self.task.lock().expect("queue task lock") = Some(handle);
        info!("Alert queue started");
    }

    /// Stop the background drain task.
    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().expect("queue task lock").take() {
            handle.abort();
        }
        let remaining = self.queue.lock().await.len();
        info!(queued = remaining, "Alert queue stopped");
    }

    /// Add an attempt to the queue. When the queue is full the oldest record
    /// is dropped (and counted) to make room for the new one.
    pub async fn enqueue(&self, attempt: RemediationAttempt) {
        let mut queue = self.queue.lock().await;

        if queue.len() >= MAX_QUEUE_SIZE {
            queue.pop_front();
            let dropped = self.total_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                queue_size = queue.len(),
                total_dropped = dropped,
                alert_name = %attempt.alert_name,
                "Queue full, oldest record dropped"
            );
        }

        let alert_name = attempt.alert_name.clone();
        queue.push_back(attempt);
        let total = self.total_queued.fetch_add(1, Ordering::Relaxed) + 1;

        info!(
            queue_depth = queue.len(),
            total_queued = total,
            alert_name = %alert_name,
            "Attempt queued for deferred persistence"
        );
    }

    /// Attempt to drain up to one batch to the store. Stops at the first
    /// failed insert, putting the record back at the head so nothing is lost
    /// and order is preserved.
    pub async fn drain(&self) {
        // Cheap emptiness probe before touching the database.
        if self.queue.lock().await.is_empty() {
            return;
        }

        if !self.store.health_check().await {
            let depth = self.queue.lock().await.len();
            warn!(queue_depth = depth, "Database still unavailable, skipping drain");
            return;
        }

        let mut drained: u64 = 0;

        for _ in 0..DRAIN_BATCH_SIZE {
            let attempt = {
                let mut queue = self.queue.lock().await;
                queue.pop_front()
            };
            let Some(attempt) = attempt else { break };

            match self.store.log_attempt(&attempt).await {
                Ok(_) => {
                    drained += 1;
                    self.total_drained.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    // Put it back at the head; halt until the next tick.
                    self.queue.lock().await.push_front(attempt);
                    error!(error = %e, drained, "Drain insert failed, re-queued at head");
                    break;
                }
            }
        }

        if drained > 0 {
            let remaining = self.queue.lock().await.len();
            info!(
                drained,
                remaining,
                total_drained = self.total_drained.load(Ordering::Relaxed),
                "Queue drained"
            );
        }
    }

    /// Persist an attempt row, falling back to the queue when the store is
    /// unavailable. Returns the row id when the insert went straight through.
    pub async fn persist_or_queue(&self, attempt: RemediationAttempt) -> Option<i64> {
        match self.store.log_attempt(&attempt).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(
                    error = %e,
                    alert_name = %attempt.alert_name,
                    "Store unavailable, queueing attempt"
                );
                self.enqueue(attempt).await;
                None
            }
        }
    }

    /// Whether the engine is in degraded mode (queue has items).
    pub async fn is_degraded(&self) -> bool {
        !self.queue.lock().await.is_empty()
    }

    /// Current queue statistics.
    pub async fn stats(&self) -> QueueStats {
        let queue = self.queue.lock().await;
        QueueStats {
            queue_depth: queue.len(),
            total_queued: self.total_queued.load(Ordering::Relaxed),
            total_drained: self.total_drained.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            oldest_alert: queue.front().map(|a| a.alert_name.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(name: &str) -> RemediationAttempt {
        RemediationAttempt::new(name, "forge:9100", "fp", "warning", 1)
    }

    #[tokio::test]
    async fn test_enqueue_and_stats() {
        let queue = AlertQueue::new(Arc::new(Store::disconnected()));

        queue.enqueue(attempt("A")).await;
        queue.enqueue(attempt("B")).await;

        assert!(queue.is_degraded().await);
        let stats = queue.stats().await;
        assert_eq!(stats.queue_depth, 2);
        assert_eq!(stats.total_queued, 2);
        assert_eq!(stats.total_dropped, 0);
        assert_eq!(stats.oldest_alert.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let queue = AlertQueue::new(Arc::new(Store::disconnected()));

        for i in 0..MAX_QUEUE_SIZE {
            queue.enqueue(attempt(&format!("alert-{i}"))).await;
        }
        queue.enqueue(attempt("newest")).await;

        let stats = queue.stats().await;
        assert_eq!(stats.queue_depth, MAX_QUEUE_SIZE);
        assert_eq!(stats.total_dropped, 1);
        // alert-0 fell off the front; the newest record is present.
        assert_eq!(stats.oldest_alert.as_deref(), Some("alert-1"));
    }

    #[tokio::test]
    async fn test_drain_with_dead_store_keeps_records() {
        let queue = AlertQueue::new(Arc::new(Store::disconnected()));
        queue.enqueue(attempt("A")).await;

        queue.drain().await;

        // Health check fails against the disconnected store, so nothing is
        // lost and nothing is drained.
        let stats = queue.stats().await;
        assert_eq!(stats.queue_depth, 1);
        assert_eq!(stats.total_drained, 0);
    }
}
