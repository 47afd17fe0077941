//! Dispatch transport
//!
//! Carries accepted deposits from the fast path to the reconciliation
//! workers with per-key ordering, at-least-once delivery and explicit
//! acknowledgment. Two interchangeable implementations:
//!
//! - [`ListTransport`]: one pending list per account plus a global ready list
//!   of account references. Only the head of an account's list is ever in
//!   flight, and it is removed only after the durable apply succeeded.
//! - [`LogTransport`]: partitioned append-only logs read through a consumer
//!   group. Unacknowledged entries are stolen by another consumer once they
//!   have been idle for `min_idle`.
//!
//! Both can redeliver after a crash; the durable upsert's token journal turns
//! that into an exactly-once effect.

pub mod list;
pub mod log;

pub use list::ListTransport;
pub use log::LogTransport;

use crate::config::DispatchConfig;
use crate::store::{DispatchTarget, EntryId, FastStore};
use crate::types::{AccountKey, StoreError};
use async_trait::async_trait;
use clap::ValueEnum;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Available dispatch transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum TransportKind {
    /// Per-key list plus ready signal
    List,
    /// Partitioned log with consumer groups
    Log,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::List => f.write_str("list"),
            TransportKind::Log => f.write_str("log"),
        }
    }
}

/// Identity of one reconciliation worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consumer {
    /// Name recorded as the owner of in-flight deliveries
    pub name: String,
    /// Position in the worker pool, used for partition assignment
    pub index: usize,
}

/// Where a delivery came from, needed to acknowledge it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryHandle {
    /// Head of a per-key list
    List {
        /// The per-key list
        list: String,
    },
    /// Entry of a log partition
    Log {
        /// Partition stream
        stream: String,
        /// Entry id
        id: EntryId,
    },
}

/// One dispatch entry handed to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Acknowledgment handle
    pub handle: DeliveryHandle,
    /// Encoded dispatch entry
    pub payload: String,
    /// Delivery count, this delivery included
    pub attempts: u32,
}

/// Transport contract shared by the list and log implementations
#[async_trait]
pub trait DispatchTransport: Send + Sync {
    /// Which implementation this is
    fn kind(&self) -> TransportKind;

    /// Where the apply script should emit entries for `account`
    fn target_for(&self, account: &AccountKey) -> DispatchTarget;

    /// Create any server-side structures (consumer groups); idempotent
    async fn prepare(&self) -> Result<(), StoreError>;

    /// Reclaim deliveries stalled for at least `min_idle`
    ///
    /// Returns the entries now owned by `consumer` that it must process
    /// before reading new work. Transports that re-signal stalled work
    /// instead return an empty batch.
    async fn recover(&self, consumer: &Consumer) -> Result<Vec<Delivery>, StoreError>;

    /// Block for up to the configured duration for new deliveries
    async fn next_batch(&self, consumer: &Consumer) -> Result<Vec<Delivery>, StoreError>;

    /// Mark a delivery as durably applied
    async fn ack(&self, consumer: &Consumer, delivery: &Delivery) -> Result<(), StoreError>;

    /// Make a failed delivery available again
    async fn retry(&self, consumer: &Consumer, delivery: &Delivery) -> Result<(), StoreError>;

    /// Remove a poison delivery without applying it
    async fn discard(&self, consumer: &Consumer, delivery: &Delivery) -> Result<(), StoreError>;

    /// Entries accepted but not yet acknowledged
    async fn backlog(&self) -> Result<usize, StoreError>;
}

/// Create a dispatch transport of the requested kind
///
/// # Arguments
///
/// * `store` - Shared Fast Store handle
/// * `config` - Transport settings
/// * `workers` - Size of the worker pool (partition assignment)
/// * `call_timeout` - Timeout added to every store call
pub fn create_transport(
    store: Arc<dyn FastStore>,
    config: DispatchConfig,
    workers: usize,
    call_timeout: Duration,
) -> Arc<dyn DispatchTransport> {
    match config.transport {
        TransportKind::List => Arc::new(ListTransport::new(store, config, call_timeout)),
        TransportKind::Log => Arc::new(LogTransport::new(store, config, workers, call_timeout)),
    }
}
