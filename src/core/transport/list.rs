//! List + ready-signal transport
//!
//! ```text
//! apply ──► dispatch:{A} [e1, e2, e3]      ready:deposits [dispatch:{B}, dispatch:{A}]
//!                 ▲ head                           │ blocking pop
//!                 │ peek                           ▼
//!             worker ◄──────────────────── claim (in flight: dispatch:{A} -> worker)
//!                 │ durable upsert ok
//!                 ▼
//!      pop head if unchanged, re-signal dispatch:{A} while entries remain
//! ```
//!
//! A list reference is either queued on the ready list or claimed by exactly
//! one worker, never both, so one account's entries are processed one at a
//! time and in order. A claim that is never settled (worker crash) is
//! re-signalled after `min_idle` by [`ListTransport::recover`].

use super::{Consumer, Delivery, DeliveryHandle, DispatchTransport, TransportKind};
use crate::config::DispatchConfig;
use crate::store::{bounded, keys, DispatchTarget, FastStore};
use crate::types::{AccountKey, StoreError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Per-key list transport
#[derive(Clone)]
pub struct ListTransport {
    store: Arc<dyn FastStore>,
    config: DispatchConfig,
    call_timeout: Duration,
}

impl ListTransport {
    /// Create a list transport
    pub fn new(store: Arc<dyn FastStore>, config: DispatchConfig, call_timeout: Duration) -> Self {
        Self {
            store,
            config,
            call_timeout,
        }
    }

    fn list_of(delivery: &Delivery) -> Result<&str, StoreError> {
        match &delivery.handle {
            DeliveryHandle::List { list } => Ok(list),
            DeliveryHandle::Log { .. } => Err(StoreError::script(
                "list_transport",
                "log delivery handed to list transport",
            )),
        }
    }
}

#[async_trait]
impl DispatchTransport for ListTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::List
    }

    fn target_for(&self, account: &AccountKey) -> DispatchTarget {
        DispatchTarget::List {
            list: keys::dispatch_list(account),
            ready: keys::READY_LIST.to_string(),
        }
    }

    async fn prepare(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn recover(&self, consumer: &Consumer) -> Result<Vec<Delivery>, StoreError> {
        let reclaimed = bounded(
            "reclaim_ready",
            self.call_timeout,
            self.store.reclaim_ready(keys::READY_LIST, self.config.min_idle),
        )
        .await?;

        if reclaimed > 0 {
            info!(consumer = %consumer.name, reclaimed, "re-signalled stalled dispatch lists");
        }
        Ok(Vec::new())
    }

    async fn next_batch(&self, consumer: &Consumer) -> Result<Vec<Delivery>, StoreError> {
        let claim = bounded(
            "claim_ready",
            self.config.block + self.call_timeout,
            self.store
                .claim_ready(keys::READY_LIST, &consumer.name, self.config.block),
        )
        .await?;
        let Some(claim) = claim else {
            return Ok(Vec::new());
        };

        let head = bounded(
            "list_head",
            self.call_timeout,
            self.store.list_head(&claim.list),
        )
        .await?;

        match head {
            Some(payload) => Ok(vec![Delivery {
                handle: DeliveryHandle::List { list: claim.list },
                payload,
                attempts: claim.attempts,
            }]),
            None => {
                // Stale reference: the list drained after it was signalled.
                debug!(consumer = %consumer.name, list = %claim.list, "ready list already empty");
                bounded(
                    "requeue_ready",
                    self.call_timeout,
                    self.store
                        .requeue_ready(&claim.list, keys::READY_LIST, &consumer.name),
                )
                .await?;
                Ok(Vec::new())
            }
        }
    }

    async fn ack(&self, consumer: &Consumer, delivery: &Delivery) -> Result<(), StoreError> {
        let list = Self::list_of(delivery)?;
        let removed = bounded(
            "ack_list_head",
            self.call_timeout,
            self.store
                .ack_list_head(list, &delivery.payload, keys::READY_LIST, &consumer.name),
        )
        .await?;

        if !removed {
            debug!(consumer = %consumer.name, list, "head already acknowledged elsewhere");
        }
        Ok(())
    }

    async fn retry(&self, consumer: &Consumer, delivery: &Delivery) -> Result<(), StoreError> {
        let list = Self::list_of(delivery)?;
        bounded(
            "requeue_ready",
            self.call_timeout,
            self.store
                .requeue_ready(list, keys::READY_LIST, &consumer.name),
        )
        .await
    }

    async fn discard(&self, consumer: &Consumer, delivery: &Delivery) -> Result<(), StoreError> {
        self.ack(consumer, delivery).await
    }

    async fn backlog(&self) -> Result<usize, StoreError> {
        bounded(
            "list_backlog",
            self.call_timeout,
            self.store.list_backlog(keys::DISPATCH_LIST_PREFIX),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryFastStore;

    fn transport(store: Arc<MemoryFastStore>, min_idle: Duration) -> ListTransport {
        ListTransport::new(
            store,
            DispatchConfig {
                block: Duration::from_millis(20),
                min_idle,
                ..DispatchConfig::default()
            },
            Duration::from_secs(1),
        )
    }

    fn consumer(name: &str) -> Consumer {
        Consumer {
            name: name.to_string(),
            index: 0,
        }
    }

    #[tokio::test]
    async fn test_entries_of_one_key_are_delivered_in_order() {
        let store = Arc::new(MemoryFastStore::new());
        let transport = transport(Arc::clone(&store), Duration::from_secs(30));
        let key = AccountKey::parse("7").unwrap();
        for payload in ["e1", "e2", "e3"] {
            store.inject_list_entry(&key, payload).unwrap();
        }

        let worker = consumer("w-0");
        let mut seen = Vec::new();
        for _ in 0..3 {
            let batch = transport.next_batch(&worker).await.unwrap();
            assert_eq!(batch.len(), 1);
            seen.push(batch[0].payload.clone());
            transport.ack(&worker, &batch[0]).await.unwrap();
        }

        assert_eq!(seen, vec!["e1", "e2", "e3"]);
        assert_eq!(transport.backlog().await.unwrap(), 0);
        assert!(transport.next_batch(&worker).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_key_is_not_delivered_twice_concurrently() {
        let store = Arc::new(MemoryFastStore::new());
        let transport = transport(Arc::clone(&store), Duration::from_secs(30));
        let key = AccountKey::parse("7").unwrap();
        store.inject_list_entry(&key, "e1").unwrap();
        store.inject_list_entry(&key, "e2").unwrap();

        let first = transport.next_batch(&consumer("w-0")).await.unwrap();
        let second = transport.next_batch(&consumer("w-1")).await.unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_retry_keeps_head_and_counts_attempts() {
        let store = Arc::new(MemoryFastStore::new());
        let transport = transport(Arc::clone(&store), Duration::from_secs(30));
        let key = AccountKey::parse("7").unwrap();
        store.inject_list_entry(&key, "e1").unwrap();
        let worker = consumer("w-0");

        let first = transport.next_batch(&worker).await.unwrap();
        transport.retry(&worker, &first[0]).await.unwrap();
        let again = transport.next_batch(&worker).await.unwrap();

        assert_eq!(again[0].payload, "e1");
        assert_eq!(again[0].attempts, 2);
        assert_eq!(transport.backlog().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_crashed_worker_claim_is_recovered() {
        let store = Arc::new(MemoryFastStore::new());
        let transport = transport(Arc::clone(&store), Duration::from_millis(30));
        let key = AccountKey::parse("7").unwrap();
        store.inject_list_entry(&key, "e1").unwrap();

        // w-crashed claims and disappears.
        assert_eq!(transport.next_batch(&consumer("w-crashed")).await.unwrap().len(), 1);
        let rescuer = consumer("w-1");
        assert!(transport.next_batch(&rescuer).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(transport.recover(&rescuer).await.unwrap().is_empty());
        let batch = transport.next_batch(&rescuer).await.unwrap();
        assert_eq!(batch[0].payload, "e1");
        transport.ack(&rescuer, &batch[0]).await.unwrap();
        assert_eq!(transport.backlog().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_late_ack_from_reclaimed_worker_does_not_strand_list() {
        let store = Arc::new(MemoryFastStore::new());
        let transport = transport(Arc::clone(&store), Duration::from_millis(30));
        let key = AccountKey::parse("7").unwrap();
        store.inject_list_entry(&key, "e1").unwrap();
        store.inject_list_entry(&key, "e2").unwrap();

        let slow = consumer("w-slow");
        let stalled = transport.next_batch(&slow).await.unwrap();
        assert_eq!(stalled[0].payload, "e1");

        tokio::time::sleep(Duration::from_millis(40)).await;
        let rescuer = consumer("w-1");
        assert!(transport.recover(&rescuer).await.unwrap().is_empty());
        let reclaimed = transport.next_batch(&rescuer).await.unwrap();
        assert_eq!(reclaimed[0].payload, "e1");

        // The slow worker wakes up and acks first, the rescuer acks a head that is gone.
        transport.ack(&slow, &stalled[0]).await.unwrap();
        transport.ack(&rescuer, &reclaimed[0]).await.unwrap();

        let next = transport.next_batch(&consumer("w-2")).await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].payload, "e2");
        assert_eq!(transport.backlog().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_target_names_account_list() {
        let transport = transport(Arc::new(MemoryFastStore::new()), Duration::from_secs(30));
        let target = transport.target_for(&AccountKey::parse("42").unwrap());
        assert_eq!(
            target,
            DispatchTarget::List {
                list: "dispatch:{42}".to_string(),
                ready: "ready:deposits".to_string(),
            }
        );
    }
}
