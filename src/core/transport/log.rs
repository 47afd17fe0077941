//! Partitioned log transport
//!
//! Accepted deposits are appended to one of `partitions` streams chosen by a
//! stable hash of the account, so every entry of an account lands in the
//! same partition in acceptance order. Workers read through a single
//! consumer group; each entry is delivered to exactly one live consumer.
//!
//! Partitions are assigned to workers by index: with `partitions >= workers`
//! worker `i` owns partitions `i, i + workers, ...`; with fewer partitions
//! than workers, worker `i` shares partition `i % partitions`. Entries a
//! consumer received but never acknowledged stay pending in the group and
//! are stolen by [`LogTransport::recover`] once idle for `min_idle`.

use super::{Consumer, Delivery, DeliveryHandle, DispatchTransport, TransportKind};
use crate::config::DispatchConfig;
use crate::store::{bounded, keys, DispatchTarget, EntryId, FastStore, StreamMessage};
use crate::types::{AccountKey, StoreError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Stable 64-bit FNV-1a hash; partition choice must agree across processes
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(PRIME))
}

/// Consumer-group log transport
#[derive(Clone)]
pub struct LogTransport {
    store: Arc<dyn FastStore>,
    config: DispatchConfig,
    workers: usize,
    call_timeout: Duration,
}

impl LogTransport {
    /// Create a log transport
    ///
    /// # Arguments
    ///
    /// * `store` - Shared Fast Store handle
    /// * `config` - Partition count, group name, batch size and idle threshold.
    ///   A partition count of zero is raised to one.
    /// * `workers` - Size of the worker pool reading the partitions
    /// * `call_timeout` - Timeout added to every store call
    pub fn new(
        store: Arc<dyn FastStore>,
        mut config: DispatchConfig,
        workers: usize,
        call_timeout: Duration,
    ) -> Self {
        config.partitions = config.partitions.max(1);
        Self {
            store,
            config,
            workers: workers.max(1),
            call_timeout,
        }
    }

    /// Partition holding `account`'s entries
    pub fn partition_of(&self, account: &AccountKey) -> usize {
        (fnv1a(account.as_str().as_bytes()) % self.config.partitions as u64) as usize
    }

    /// Streams read by the worker at `index`
    pub fn streams_for(&self, index: usize) -> Vec<String> {
        let partitions = self.config.partitions;
        if partitions >= self.workers {
            (index % self.workers..partitions)
                .step_by(self.workers)
                .map(keys::stream)
                .collect()
        } else {
            vec![keys::stream(index % partitions)]
        }
    }

    fn all_streams(&self) -> Vec<String> {
        (0..self.config.partitions).map(keys::stream).collect()
    }

    fn entry_of(delivery: &Delivery) -> Result<(&str, EntryId), StoreError> {
        match &delivery.handle {
            DeliveryHandle::Log { stream, id } => Ok((stream, *id)),
            DeliveryHandle::List { .. } => Err(StoreError::script(
                "log_transport",
                "list delivery handed to log transport",
            )),
        }
    }

    fn to_delivery(message: StreamMessage) -> Delivery {
        Delivery {
            handle: DeliveryHandle::Log {
                stream: message.stream,
                id: message.id,
            },
            payload: message.payload,
            attempts: message.deliveries,
        }
    }
}

#[async_trait]
impl DispatchTransport for LogTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Log
    }

    fn target_for(&self, account: &AccountKey) -> DispatchTarget {
        DispatchTarget::Log {
            stream: keys::stream(self.partition_of(account)),
        }
    }

    async fn prepare(&self) -> Result<(), StoreError> {
        for stream in self.all_streams() {
            let created = bounded(
                "create_group",
                self.call_timeout,
                self.store.create_group(&stream, &self.config.group),
            )
            .await?;
            if created {
                debug!(stream = %stream, group = %self.config.group, "consumer group created");
            }
        }
        Ok(())
    }

    async fn recover(&self, consumer: &Consumer) -> Result<Vec<Delivery>, StoreError> {
        let mut recovered = Vec::new();

        for stream in self.streams_for(consumer.index) {
            let mut cursor = EntryId::ZERO;
            loop {
                let (claimed, next) = bounded(
                    "auto_claim",
                    self.call_timeout,
                    self.store.auto_claim(
                        &stream,
                        &self.config.group,
                        &consumer.name,
                        self.config.min_idle,
                        cursor,
                        self.config.batch_size,
                    ),
                )
                .await?;
                recovered.extend(claimed.into_iter().map(Self::to_delivery));
                if next == EntryId::ZERO {
                    break;
                }
                cursor = next;
            }
        }

        if !recovered.is_empty() {
            info!(
                consumer = %consumer.name,
                reclaimed = recovered.len(),
                "claimed stalled log entries"
            );
        }
        Ok(recovered)
    }

    async fn next_batch(&self, consumer: &Consumer) -> Result<Vec<Delivery>, StoreError> {
        let streams = self.streams_for(consumer.index);
        let messages = bounded(
            "read_group",
            self.config.block + self.call_timeout,
            self.store.read_group(
                &streams,
                &self.config.group,
                &consumer.name,
                self.config.batch_size,
                self.config.block,
            ),
        )
        .await?;

        Ok(messages.into_iter().map(Self::to_delivery).collect())
    }

    async fn ack(&self, _consumer: &Consumer, delivery: &Delivery) -> Result<(), StoreError> {
        let (stream, id) = Self::entry_of(delivery)?;
        bounded(
            "ack",
            self.call_timeout,
            self.store.ack(stream, &self.config.group, id),
        )
        .await?;

        if self.config.trim_acked {
            bounded(
                "delete_entry",
                self.call_timeout,
                self.store.delete_entry(stream, id),
            )
            .await?;
        }
        Ok(())
    }

    async fn retry(&self, consumer: &Consumer, delivery: &Delivery) -> Result<(), StoreError> {
        // Left pending; recover() steals it back after min_idle.
        let (stream, id) = Self::entry_of(delivery)?;
        debug!(consumer = %consumer.name, stream, entry = %id, "entry left pending for retry");
        Ok(())
    }

    async fn discard(&self, consumer: &Consumer, delivery: &Delivery) -> Result<(), StoreError> {
        self.ack(consumer, delivery).await
    }

    async fn backlog(&self) -> Result<usize, StoreError> {
        let mut total = 0;
        for stream in self.all_streams() {
            total += bounded(
                "stream_backlog",
                self.call_timeout,
                self.store.stream_backlog(&stream, &self.config.group),
            )
            .await?;
        }
        Ok(total)
    }
}
