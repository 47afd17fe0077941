//! Reconciliation worker pool
//!
//! Each worker drains the dispatch transport into the Durable Store:
//!
//! ```text
//! start ─► prepare ─► recover ─► loop ───────────────────────────────┐
//!                                 │ every reclaim_interval: recover   │
//!                                 ▼                                   │
//!                            next_batch (blocks <= block)             │
//!                                 │ per delivery                      │
//!                                 ▼                                   │
//!        decode ──poison──► discard + warn                            │
//!           │                                                         │
//!           ▼                                                         │
//!        upsert (durable_timeout) ──ok──► ack ────────────────────────┤
//!           │ error                                                   │
//!           ▼                                                         │
//!        backoff ─► retry (requeue / leave pending) ─► end of batch ──┘
//! ```
//!
//! Workers never coordinate with each other. Cancellation is checked between
//! entries and every blocking read is bounded, so a worker finishes its
//! current entry and exits within one `block` of shutdown.

use super::transport::{Consumer, Delivery, DispatchTransport};
use crate::config::WorkerConfig;
use crate::store::{DurableDeposit, DurableStore, UpsertOutcome};
use crate::types::{DispatchEntry, DurableApplyError};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters shared by every worker of a pool
#[derive(Debug, Default)]
pub struct WorkerStats {
    applied: AtomicU64,
    duplicates: AtomicU64,
    retried: AtomicU64,
    poisoned: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    /// Entries applied to the durable store
    pub applied: u64,
    /// Redelivered entries the durable store had already applied
    pub duplicates: u64,
    /// Durable failures that were scheduled for retry
    pub retried: u64,
    /// Undecodable entries dropped
    pub poisoned: u64,
}

impl WorkerStats {
    /// Read every counter
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            poisoned: self.poisoned.load(Ordering::Relaxed),
        }
    }
}

/// Pool of reconciliation workers
#[derive(Clone)]
pub struct ReconciliationWorkers {
    transport: Arc<dyn DispatchTransport>,
    durable: Arc<dyn DurableStore>,
    config: WorkerConfig,
    reclaim_interval: Duration,
    instance: String,
    stats: Arc<WorkerStats>,
    running: Arc<AtomicUsize>,
}

impl ReconciliationWorkers {
    /// Create a worker pool
    ///
    /// # Arguments
    ///
    /// * `transport` - Source of dispatch entries
    /// * `durable` - System of record
    /// * `config` - Pool size, durable timeout and retry backoff
    /// * `reclaim_interval` - How often each worker reclaims stalled entries
    /// * `instance` - Prefix of consumer names (`<instance>-<index>`)
    pub fn new(
        transport: Arc<dyn DispatchTransport>,
        durable: Arc<dyn DurableStore>,
        config: WorkerConfig,
        reclaim_interval: Duration,
        instance: &str,
    ) -> Self {
        Self {
            transport,
            durable,
            config,
            reclaim_interval,
            instance: instance.to_string(),
            stats: Arc::new(WorkerStats::default()),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared counters
    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Workers currently running
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn `config.count` workers onto the current runtime
    ///
    /// Workers stop once `cancel` fires; await the returned set to wait for
    /// them to finish their current entry.
    pub fn spawn(&self, cancel: &CancellationToken) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        for index in 0..self.config.count {
            let worker = Worker {
                consumer: Consumer {
                    name: format!("{}-{}", self.instance, index),
                    index,
                },
                transport: Arc::clone(&self.transport),
                durable: Arc::clone(&self.durable),
                config: self.config.clone(),
                reclaim_interval: self.reclaim_interval,
                stats: Arc::clone(&self.stats),
            };
            let running = Arc::clone(&self.running);
            let cancel = cancel.clone();
            running.fetch_add(1, Ordering::SeqCst);
            tasks.spawn(async move {
                worker.run(cancel).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        tasks
    }

    /// Process whatever one consumer can see right now, without blocking
    /// for new work beyond one read
    ///
    /// Runs recovery followed by a single batch for `consumer`, as a worker
    /// loop iteration does. Returns the number of deliveries handled.
    pub async fn drain_once(&self, consumer: &Consumer) -> usize {
        let worker = Worker {
            consumer: consumer.clone(),
            transport: Arc::clone(&self.transport),
            durable: Arc::clone(&self.durable),
            config: self.config.clone(),
            reclaim_interval: self.reclaim_interval,
            stats: Arc::clone(&self.stats),
        };
        let cancel = CancellationToken::new();
        let recovered = worker.reclaim(&cancel).await;
        recovered + worker.poll(&cancel).await
    }
}

struct Worker {
    consumer: Consumer,
    transport: Arc<dyn DispatchTransport>,
    durable: Arc<dyn DurableStore>,
    config: WorkerConfig,
    reclaim_interval: Duration,
    stats: Arc<WorkerStats>,
}

impl Worker {
    async fn run(self, cancel: CancellationToken) {
        info!(consumer = %self.consumer.name, transport = %self.transport.kind(), "worker started");

        if let Err(error) = self.transport.prepare().await {
            warn!(consumer = %self.consumer.name, error = %error, "transport prepare failed");
        }
        self.reclaim(&cancel).await;
        let mut next_reclaim = Instant::now() + self.reclaim_interval;

        while !cancel.is_cancelled() {
            if Instant::now() >= next_reclaim {
                self.reclaim(&cancel).await;
                next_reclaim = Instant::now() + self.reclaim_interval;
            }
            self.poll(&cancel).await;
        }

        info!(consumer = %self.consumer.name, "worker stopped");
    }

    /// Take over stalled deliveries and process them before new work
    async fn reclaim(&self, cancel: &CancellationToken) -> usize {
        match self.transport.recover(&self.consumer).await {
            Ok(deliveries) => self.process(deliveries, cancel).await,
            Err(error) => {
                warn!(consumer = %self.consumer.name, error = %error, "reclaim failed");
                0
            }
        }
    }

    /// One bounded read plus processing of the batch
    async fn poll(&self, cancel: &CancellationToken) -> usize {
        match self.transport.next_batch(&self.consumer).await {
            Ok(deliveries) => self.process(deliveries, cancel).await,
            Err(error) => {
                warn!(consumer = %self.consumer.name, error = %error, "dispatch read failed");
                self.pause(self.config.backoff_initial, cancel).await;
                0
            }
        }
    }

    async fn process(&self, deliveries: Vec<Delivery>, cancel: &CancellationToken) -> usize {
        let mut handled = 0;
        for delivery in deliveries {
            handled += 1;
            if !self.handle(&delivery, cancel).await || cancel.is_cancelled() {
                // The rest stay pending and are recovered after min_idle.
                break;
            }
        }
        handled
    }

    /// Apply one delivery; returns false when the batch should stop
    async fn handle(&self, delivery: &Delivery, cancel: &CancellationToken) -> bool {
        let entry = match DispatchEntry::decode(&delivery.payload) {
            Ok(entry) => entry,
            Err(poison) => {
                warn!(
                    consumer = %self.consumer.name,
                    reason = %poison.reason,
                    payload = %poison.payload,
                    "dropping poison dispatch entry"
                );
                self.stats.poisoned.fetch_add(1, Ordering::Relaxed);
                if let Err(error) = self.transport.discard(&self.consumer, delivery).await {
                    warn!(consumer = %self.consumer.name, error = %error, "failed to discard poison entry");
                }
                return true;
            }
        };

        let deposit = DurableDeposit::from_entry(&entry);
        match self.upsert(&deposit).await {
            Ok(outcome) => {
                match outcome {
                    UpsertOutcome::Applied => {
                        self.stats.applied.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            consumer = %self.consumer.name,
                            account = %entry.account,
                            token = %entry.token,
                            amount = %deposit.amount,
                            "durable balance updated"
                        );
                    }
                    UpsertOutcome::Duplicate => {
                        self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            consumer = %self.consumer.name,
                            account = %entry.account,
                            token = %entry.token,
                            "redelivered entry already applied"
                        );
                    }
                }
                if let Err(error) = self.transport.ack(&self.consumer, delivery).await {
                    // Redelivery is harmless: the upsert journal drops it.
                    warn!(consumer = %self.consumer.name, error = %error, "ack failed");
                }
                true
            }
            Err(failure) => {
                self.stats.retried.fetch_add(1, Ordering::Relaxed);
                let delay = self.config.backoff(delivery.attempts);
                if delivery.attempts >= 10 {
                    error!(
                        consumer = %self.consumer.name,
                        account = %entry.account,
                        token = %entry.token,
                        attempts = delivery.attempts,
                        error = %failure,
                        "durable apply keeps failing"
                    );
                } else {
                    warn!(
                        consumer = %self.consumer.name,
                        account = %entry.account,
                        token = %entry.token,
                        attempts = delivery.attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %failure,
                        "durable apply failed, will retry"
                    );
                }
                self.pause(delay, cancel).await;
                if let Err(error) = self.transport.retry(&self.consumer, delivery).await {
                    warn!(consumer = %self.consumer.name, error = %error, "retry scheduling failed");
                }
                false
            }
        }
    }

    async fn upsert(&self, deposit: &DurableDeposit) -> Result<UpsertOutcome, DurableApplyError> {
        match tokio::time::timeout(self.config.durable_timeout, self.durable.upsert_deposit(deposit))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(DurableApplyError::Timeout {
                after_ms: self.config.durable_timeout.as_millis() as u64,
            }),
        }
    }

    async fn pause(&self, delay: Duration, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
