//! Conntrack cleanup: a bounded FIFO of rule predicates drained by one
//! background worker.
//!
//! Backpressure contract: when the queue is full the scheduler drops the
//! whole backlog and arms flush mode: the next worker cycle flushes the
//! entire IPv4 conntrack table instead of deleting per rule. Memory stays
//! bounded under policy churn while no session outlives the rule that
//! permitted it.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use domain::rule::entity::PolicyRule;
use ports::secondary::conntrack_port::ConntrackPort;
use ports::secondary::metrics_port::DatapathMetrics;

struct SchedulerInner {
    queue: Mutex<VecDeque<PolicyRule>>,
    capacity: usize,
    /// The flush flag; guarded separately from the queue so the worker can
    /// test it without contending with schedulers.
    need_flush: Mutex<bool>,
    notify: Notify,
}

/// Cheap handle the manager uses to queue cleanup work. Never blocks and
/// never takes the replay lock.
#[derive(Clone)]
pub struct ConntrackScheduler {
    inner: Arc<SchedulerInner>,
}

impl ConntrackScheduler {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                queue: Mutex::new(VecDeque::new()),
                capacity,
                need_flush: Mutex::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Queue one rule predicate for deletion. Under backpressure the queue
    /// is dropped and flush mode armed instead.
    pub fn schedule(&self, rule: PolicyRule) {
        if *self.inner.need_flush.lock() {
            // The pending flush already covers this rule.
            return;
        }
        let mut queue = self.inner.queue.lock();
        if queue.len() >= self.inner.capacity {
            info!("conntrack cleanup queue full, switching to flush mode");
            queue.clear();
            *self.inner.need_flush.lock() = true;
        } else {
            queue.push_back(rule);
        }
        drop(queue);
        self.inner.notify.notify_one();
    }

    /// Arm a full flush directly (used after policy-flow replay).
    pub fn request_flush(&self) {
        *self.inner.need_flush.lock() = true;
        self.inner.notify.notify_one();
    }

    pub fn flush_pending(&self) -> bool {
        *self.inner.need_flush.lock()
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

/// The background worker that owns the kernel-facing port.
pub struct ConntrackWorker {
    scheduler: ConntrackScheduler,
    port: Arc<dyn ConntrackPort>,
    metrics: Arc<dyn DatapathMetrics>,
}

impl ConntrackWorker {
    pub fn new(
        scheduler: ConntrackScheduler,
        port: Arc<dyn ConntrackPort>,
        metrics: Arc<dyn DatapathMetrics>,
    ) -> Self {
        Self {
            scheduler,
            port,
            metrics,
        }
    }

    /// Iterate until cancelled: flush when armed, otherwise drain and
    /// batch-delete.
    pub async fn run(self, token: CancellationToken) {
        loop {
            if self.scheduler.flush_pending() {
                match self.port.flush_all() {
                    Ok(()) => {
                        *self.scheduler.inner.need_flush.lock() = false;
                        self.metrics.record_conntrack_flush();
                        info!("flushed conntrack table");
                    }
                    Err(e) => {
                        error!(error = %e, "conntrack flush failed");
                    }
                }
                // Re-check the queue before sleeping; new work may have
                // arrived while flushing.
                continue;
            }

            let batch = self.take_batch();
            if batch.is_empty() {
                tokio::select! {
                    () = token.cancelled() => return,
                    () = self.scheduler.inner.notify.notified() => continue,
                }
            }

            let rule_ids: Vec<String> = batch.iter().map(|r| r.id.0.clone()).collect();
            match self.port.delete_matching(&batch) {
                Ok(matches) => {
                    self.metrics.record_conntrack_batch(batch.len() as u64);
                    info!(rules = ?rule_ids, matches, "cleared conntrack for rules");
                }
                Err(e) => {
                    error!(rules = ?rule_ids, error = %e, "conntrack delete failed");
                }
            }
        }
    }

    /// Drain everything queued, deduplicated by rule ID.
    fn take_batch(&self) -> Vec<PolicyRule> {
        let mut queue = self.scheduler.inner.queue.lock();
        let mut batch: Vec<PolicyRule> = Vec::with_capacity(queue.len());
        while let Some(rule) = queue.pop_front() {
            if !batch.iter().any(|r| r.id == rule.id) {
                batch.push(rule);
            }
        }
        batch
    }
}
