//! Pending alert buffer and flush controller
//!
//! Alerts are appended to an in-memory buffer. The buffer is drained either
//! inline, when it reaches the configured batch size, or by the periodic
//! flush loop. A flush swaps the buffer out under a short lock, squashes the
//! snapshot and delivers every group concurrently. Only one flush runs at a
//! time; appends never wait for a running flush.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SharedSettings;
use crate::models::AlertItem;

use super::dispatcher::{AlertDelivery, DeliveryOutcome};
use super::squash::squash;

/// Batch queue statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Alerts waiting for the next flush
    pub pending: usize,
    /// Flushes that delivered at least one group
    pub flushes: u64,
    /// Alerts drained by those flushes
    pub items_flushed: u64,
    /// Groups that were not delivered successfully
    pub failed_deliveries: u64,
}

/// Alert buffer with squash-and-deliver flushing
pub struct BatchQueue {
    buffer: Mutex<Vec<AlertItem>>,
    flush_lock: tokio::sync::Mutex<()>,
    delivery: Arc<dyn AlertDelivery>,
    settings: SharedSettings,
    periodic_started: AtomicBool,
    flushes: AtomicU64,
    items_flushed: AtomicU64,
    failed_deliveries: AtomicU64,
}

impl BatchQueue {
    /// Create an empty queue
    pub fn new(delivery: Arc<dyn AlertDelivery>, settings: SharedSettings) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            delivery,
            settings,
            periodic_started: AtomicBool::new(false),
            flushes: AtomicU64::new(0),
            items_flushed: AtomicU64::new(0),
            failed_deliveries: AtomicU64::new(0),
        }
    }

    /// Append an alert; flushes inline once the batch size is reached
    pub async fn enqueue(&self, item: AlertItem) {
        let batch_size = self.settings.current().batch_size;

        let should_flush = {
            let mut buffer = self.buffer.lock();
            buffer.push(item);
            buffer.len() >= batch_size
        };

        if should_flush {
            debug!(batch_size, "Batch size reached, flushing inline");
            self.flush().await;
        }
    }

    /// Drain the buffer and deliver every squashed group.
    ///
    /// Waits for any running flush first. Returns the number of groups
    /// attempted; delivery failures are counted and logged, never returned.
    pub async fn flush(&self) -> usize {
        let _guard = self.flush_lock.lock().await;

        let items = std::mem::take(&mut *self.buffer.lock());
        if items.is_empty() {
            return 0;
        }

        let groups = squash(&items);
        debug!(items = items.len(), groups = groups.len(), "Flushing alert queue");

        let deliveries = groups.values().map(|group| self.delivery.deliver(group));
        let outcomes = join_all(deliveries).await;

        let failed = outcomes
            .iter()
            .filter(|outcome| **outcome != DeliveryOutcome::Delivered)
            .count();

        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.items_flushed.fetch_add(items.len() as u64, Ordering::Relaxed);
        self.failed_deliveries.fetch_add(failed as u64, Ordering::Relaxed);

        if failed > 0 {
            debug!(failed, total = outcomes.len(), "Some alert deliveries failed");
        }

        outcomes.len()
    }

    /// Start the periodic flush loop. A second call is a no-op and returns `None`.
    pub fn start_periodic_flush(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if self
            .periodic_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Periodic flush already running");
            return None;
        }

        let queue = Arc::clone(self);
        Some(tokio::spawn(async move {
            queue.run_periodic_flush(shutdown).await;
        }))
    }

    /// Whether the periodic flush loop has been started
    pub fn periodic_flush_started(&self) -> bool {
        self.periodic_started.load(Ordering::Acquire)
    }

    async fn run_periodic_flush(&self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.settings.current().flush_interval.as_secs_f64(),
            "Periodic alert flush started"
        );

        loop {
            // Re-read every iteration so reconfiguration applies without a restart
            let interval = self.settings.current().flush_interval;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            self.flush().await;
        }

        info!("Periodic alert flush stopped");
    }

    /// Number of alerts waiting for the next flush
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Whether no alert is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue statistics
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.len(),
            flushes: self.flushes.load(Ordering::Relaxed),
            items_flushed: self.items_flushed.load(Ordering::Relaxed),
            failed_deliveries: self.failed_deliveries.load(Ordering::Relaxed),
        }
    }
}
