//! Store contracts
//!
//! This module defines the two external collaborators the core depends on:
//!
//! - [`FastStore`] - the Shared Fast Store. Every method is a single atomic
//!   server-executed step (a script, a blocking pop, or a log/consumer-group
//!   primitive). No client-side locking is ever correctness-bearing; all
//!   lease, queue, balance and dispatch state lives behind this trait.
//! - [`ledger::DurableStore`] - the system of record, consumed only through
//!   an idempotent-safe upsert-with-increment.
//!
//! In-process reference implementations live in [`memory`] and [`ledger`].
//! With the `postgres` feature, `postgres::PgLedger` is a Durable Store backed
//! by a Postgres pool.
//! Store handles are constructed once and passed into each component as
//! `Arc<dyn FastStore>` / `Arc<dyn DurableStore>`; there is no global client.

pub mod keys;
pub mod ledger;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::types::{AccountKey, Currency, IdempotencyToken, StoreError};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

pub use ledger::{DurableBalance, DurableDeposit, DurableStore, MemoryLedger, UpsertOutcome};
pub use memory::MemoryFastStore;

/// Arguments of the atomic apply script
#[derive(Debug, Clone)]
pub struct ApplyCommand<'a> {
    /// Account credited
    pub account: &'a AccountKey,
    /// Currency of the balance
    pub currency: &'a Currency,
    /// Token recorded in the dedup log
    pub token: &'a IdempotencyToken,
    /// Amount in minor units
    pub amount: i64,
    /// Encoded dispatch entry to emit when the deposit applies
    pub entry: Option<String>,
    /// How long the token stays in the dedup log
    pub dedup_ttl: Duration,
}

/// Where the apply script emits the dispatch entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchTarget {
    /// Mutate the balance only
    None,
    /// Append to a per-key list, signalling the ready list on empty -> non-empty
    List {
        /// Per-key pending list
        list: String,
        /// Global ready list
        ready: String,
    },
    /// Append to a shared log
    Log {
        /// Stream name
        stream: String,
    },
}

/// Outcome code of the apply script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyCode {
    /// Balance incremented, token recorded, entry emitted
    Applied,
    /// Token already recorded; nothing changed
    Idempotent,
    /// Non-positive amount or balance overflow; nothing changed
    Invalid,
}

/// Reply of the apply script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyReply {
    /// Outcome code
    pub code: ApplyCode,
    /// Balance after the call, in minor units
    pub balance: i64,
}

/// Log entry identifier: `<milliseconds>-<sequence>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EntryId {
    /// Milliseconds since the Unix epoch at append time
    pub ms: u64,
    /// Sequence within the millisecond
    pub seq: u64,
}

impl EntryId {
    /// The smallest id; a claim scan starting here covers the whole log
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    /// The id immediately after this one
    pub fn next(self) -> EntryId {
        EntryId {
            ms: self.ms,
            seq: self.seq + 1,
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s
            .split_once('-')
            .ok_or_else(|| format!("invalid entry id '{}'", s))?;
        Ok(EntryId {
            ms: ms.parse().map_err(|_| format!("invalid entry id '{}'", s))?,
            seq: seq.parse().map_err(|_| format!("invalid entry id '{}'", s))?,
        })
    }
}

/// A log entry delivered to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Stream the entry belongs to
    pub stream: String,
    /// Entry id
    pub id: EntryId,
    /// Encoded dispatch entry
    pub payload: String,
    /// How many times the entry has been delivered, this delivery included
    pub deliveries: u32,
}

/// A ready reference claimed by a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyClaim {
    /// Name of the per-key list that is ready
    pub list: String,
    /// How many times the current head has been claimed, this claim included
    pub attempts: u32,
}

/// The Shared Fast Store
///
/// Each method is executed by the store as one atomic step. Blocking methods
/// take an explicit `block` bound and return an empty result when it elapses.
#[async_trait]
pub trait FastStore: Send + Sync {
    /// Readiness check
    async fn ping(&self) -> Result<(), StoreError>;

    /// Create the lease for `request_id` if the key has no lease and an empty
    /// waiting queue; otherwise append `request_id` to the waiting queue.
    async fn enqueue_and_try_acquire(
        &self,
        account: &AccountKey,
        request_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Renew the lease if `request_id` holds it; claim it if `request_id` is
    /// the queue head and no live lease exists. Refreshes the waiter heartbeat
    /// and evicts heads whose heartbeat is older than `ttl`.
    async fn try_promote_if_head(
        &self,
        account: &AccountKey,
        request_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Delete the lease if owned by `request_id` and drop `request_id` from the
    /// waiting queue. Safe to call unconditionally. Returns whether a lease
    /// was deleted.
    async fn release_and_promote(
        &self,
        account: &AccountKey,
        request_id: &str,
    ) -> Result<bool, StoreError>;

    /// Delete the lease only if held by `expected_owner`
    async fn force_release(
        &self,
        account: &AccountKey,
        expected_owner: &str,
    ) -> Result<bool, StoreError>;

    /// Current live lease holder, if any
    async fn lease_holder(&self, account: &AccountKey) -> Result<Option<String>, StoreError>;

    /// Waiting queue contents, head first
    async fn waiting(&self, account: &AccountKey) -> Result<Vec<String>, StoreError>;

    /// Idempotent balance mutation plus dispatch emission, in one step
    async fn apply_deposit(
        &self,
        command: &ApplyCommand<'_>,
        target: &DispatchTarget,
    ) -> Result<ApplyReply, StoreError>;

    /// Fast-path balance in minor units (0 when absent)
    async fn balance(&self, account: &AccountKey, currency: &Currency) -> Result<i64, StoreError>;

    /// Blocking pop of a ready reference into the in-flight set of `consumer`
    async fn claim_ready(
        &self,
        ready: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<ReadyClaim>, StoreError>;

    /// Head of a list without removing it
    async fn list_head(&self, list: &str) -> Result<Option<String>, StoreError>;

    /// Pop the head of `list` if it still equals `expected` and settle
    /// `consumer`'s in-flight claim. The list is re-signalled whenever entries
    /// remain, popped or not. Returns whether the head was removed.
    async fn ack_list_head(
        &self,
        list: &str,
        expected: &str,
        ready: &str,
        consumer: &str,
    ) -> Result<bool, StoreError>;

    /// Settle `consumer`'s in-flight claim on `list` and signal it ready again
    async fn requeue_ready(&self, list: &str, ready: &str, consumer: &str)
        -> Result<(), StoreError>;

    /// Re-signal in-flight references idle for at least `min_idle`
    async fn reclaim_ready(&self, ready: &str, min_idle: Duration) -> Result<usize, StoreError>;

    /// Total entries across every list whose name starts with `prefix`
    async fn list_backlog(&self, prefix: &str) -> Result<usize, StoreError>;

    /// Create a consumer group (and the stream). Returns false if it existed.
    async fn create_group(&self, stream: &str, group: &str) -> Result<bool, StoreError>;

    /// Deliver up to `count` never-delivered entries per stream to `consumer`
    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, StoreError>;

    /// Acknowledge a delivered entry
    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, StoreError>;

    /// Transfer pending entries idle for at least `min_idle` to `consumer`,
    /// scanning from `start`. Returns the claimed entries and the cursor for
    /// the next scan ([`EntryId::ZERO`] once the scan is complete).
    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: EntryId,
        count: usize,
    ) -> Result<(Vec<StreamMessage>, EntryId), StoreError>;

    /// Remove an entry from the stream
    async fn delete_entry(&self, stream: &str, id: EntryId) -> Result<bool, StoreError>;

    /// Entries not yet delivered plus entries delivered but unacknowledged
    async fn stream_backlog(&self, stream: &str, group: &str) -> Result<usize, StoreError>;
}

/// Run a store call under an explicit timeout
pub async fn bounded<T, F>(operation: &str, limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::timeout(operation, limit.as_millis() as u64)),
    }
}
