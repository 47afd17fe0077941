//! In-process Shared Fast Store
//!
//! `MemoryFastStore` implements [`FastStore`] inside the current process. It
//! executes every operation under a single keyspace mutex, which gives the
//! same guarantee a scripting store gives: each call is one atomic step and
//! no two calls interleave. Blocking reads park on a [`Notify`] and re-check
//! after every append, bounded by the caller's `block` duration.
//!
//! Outage and latency can be injected with [`MemoryFastStore::set_available`]
//! and [`MemoryFastStore::set_latency`], so timeout and retry paths can be
//! exercised without a network.

use super::{
    keys, ApplyCode, ApplyCommand, ApplyReply, DispatchTarget, EntryId, FastStore, ReadyClaim,
    StreamMessage,
};
use crate::types::dispatch::now_millis;
use crate::types::{AccountKey, Currency, StoreError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct Lease {
    holder: String,
    expires_at: Instant,
}

#[derive(Debug)]
struct Waiter {
    request_id: String,
    last_seen: Instant,
}

#[derive(Debug)]
struct InFlight {
    consumer: String,
    since: Instant,
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<EntryId, String>,
    last_id: EntryId,
    groups: HashMap<String, Group>,
}

impl Stream {
    fn append(&mut self, payload: String) -> EntryId {
        let ms = now_millis();
        let id = if ms > self.last_id.ms {
            EntryId { ms, seq: 0 }
        } else {
            self.last_id.next()
        };
        self.entries.insert(id, payload);
        self.last_id = id;
        id
    }
}

/// Whole store state; only ever touched with the keyspace mutex held
#[derive(Debug, Default)]
struct Keyspace {
    balances: HashMap<String, i64>,
    dedup: HashMap<String, HashMap<String, Instant>>,
    leases: HashMap<String, Lease>,
    queues: HashMap<String, VecDeque<Waiter>>,
    lists: HashMap<String, VecDeque<String>>,
    in_flight: HashMap<String, HashMap<String, InFlight>>,
    head_attempts: HashMap<String, u32>,
    streams: HashMap<String, Stream>,
}

impl Keyspace {
    /// Holder of a live lease; an expired lease is deleted on observation
    fn live_holder(&mut self, lease_key: &str, now: Instant) -> Option<String> {
        let expired = matches!(self.leases.get(lease_key), Some(lease) if lease.expires_at <= now);
        if expired {
            self.leases.remove(lease_key);
        }
        self.leases.get(lease_key).map(|lease| lease.holder.clone())
    }

    fn grant_lease(&mut self, lease_key: &str, request_id: &str, now: Instant, ttl: Duration) {
        self.leases.insert(
            lease_key.to_string(),
            Lease {
                holder: request_id.to_string(),
                expires_at: now + ttl,
            },
        );
    }

    /// Drop queue heads whose heartbeat is older than `ttl`, except `keep`
    fn evict_stale_heads(&mut self, queue_key: &str, keep: &str, now: Instant, ttl: Duration) {
        if let Some(queue) = self.queues.get_mut(queue_key) {
            while let Some(head) = queue.front() {
                if head.request_id != keep && now.duration_since(head.last_seen) >= ttl {
                    queue.pop_front();
                } else {
                    break;
                }
            }
            if queue.is_empty() {
                self.queues.remove(queue_key);
            }
        }
    }

    fn balance_of(&self, key: &str) -> i64 {
        self.balances.get(key).copied().unwrap_or_default()
    }

    /// Push `list` onto `ready` unless it is already queued or in flight
    fn signal_ready(&mut self, ready: &str, list: &str) {
        let in_flight = self
            .in_flight
            .get(ready)
            .is_some_and(|claims| claims.contains_key(list));
        let ready_list = self.lists.entry(ready.to_string()).or_default();
        if !in_flight && !ready_list.iter().any(|queued| queued == list) {
            ready_list.push_front(list.to_string());
        }
    }

    fn settle(&mut self, ready: &str, list: &str, consumer: &str) {
        if let Some(claims) = self.in_flight.get_mut(ready) {
            if claims.get(list).is_some_and(|claim| claim.consumer == consumer) {
                claims.remove(list);
            }
        }
    }

    fn list_len(&self, list: &str) -> usize {
        self.lists.get(list).map_or(0, VecDeque::len)
    }

    /// Hand up to `count` never-delivered entries of `stream` to `consumer`
    fn deliver(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        now: Instant,
    ) -> Result<Vec<StreamMessage>, StoreError> {
        let Some(Stream { entries, groups, .. }) = self.streams.get_mut(stream) else {
            return Err(StoreError::script("read_group", format!("NOGROUP no such stream {}", stream)));
        };
        let Some(cursor) = groups.get_mut(group) else {
            return Err(StoreError::script("read_group", format!("NOGROUP no such group {}", group)));
        };

        let fresh: Vec<StreamMessage> = entries
            .range((Bound::Excluded(cursor.last_delivered), Bound::Unbounded))
            .take(count.max(1))
            .map(|(id, payload)| StreamMessage {
                stream: stream.to_string(),
                id: *id,
                payload: payload.clone(),
                deliveries: 1,
            })
            .collect();

        for message in &fresh {
            cursor.last_delivered = message.id;
            cursor.pending.insert(
                message.id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
        }
        Ok(fresh)
    }

    fn drop_if_empty(&mut self, list: &str) {
        if self.lists.get(list).is_some_and(VecDeque::is_empty) {
            self.lists.remove(list);
        }
    }
}

/// In-process [`FastStore`]
#[derive(Debug)]
pub struct MemoryFastStore {
    keyspace: Mutex<Keyspace>,
    appended: Notify,
    available: AtomicBool,
    latency_ms: AtomicU64,
    script_failures_left: AtomicUsize,
}

impl MemoryFastStore {
    /// Create an empty, reachable store
    pub fn new() -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            appended: Notify::new(),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            script_failures_left: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` calls fail with an uninterpretable script reply
    pub fn fail_next_scripts(&self, count: usize) {
        self.script_failures_left.store(count, Ordering::SeqCst);
    }

    /// Simulate the store going down (`false`) or coming back (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every call by `latency` before it executes
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Append a raw payload to an account's dispatch list and signal it ready
    ///
    /// Bypasses the apply script; used to plant corrupt entries.
    pub fn inject_list_entry(&self, account: &AccountKey, payload: &str) -> Result<(), StoreError> {
        let list = keys::dispatch_list(account);
        self.execute_now("inject_list_entry", |ks, _| {
            ks.lists
                .entry(list.clone())
                .or_default()
                .push_back(payload.to_string());
            ks.signal_ready(keys::READY_LIST, &list);
        })?;
        self.appended.notify_waiters();
        Ok(())
    }

    /// Append a raw payload to a stream, bypassing the apply script
    pub fn inject_stream_entry(&self, stream: &str, payload: &str) -> Result<EntryId, StoreError> {
        let id = self.execute_now("inject_stream_entry", |ks, _| {
            ks.streams
                .entry(stream.to_string())
                .or_default()
                .append(payload.to_string())
        })?;
        self.appended.notify_waiters();
        Ok(id)
    }

    fn execute_now<R>(
        &self,
        operation: &str,
        script: impl FnOnce(&mut Keyspace, Instant) -> R,
    ) -> Result<R, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(operation, "connection refused"));
        }
        if self
            .script_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::script(operation, "ERR unexpected reply"));
        }
        let mut keyspace = self
            .keyspace
            .lock()
            .map_err(|_| StoreError::script(operation, "keyspace lock poisoned"))?;
        Ok(script(&mut keyspace, Instant::now()))
    }

    /// Execute one atomic step, after the injected latency
    async fn execute<R, F>(&self, operation: &str, script: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Keyspace, Instant) -> R + Send,
    {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.execute_now(operation, script)
    }

    /// Repeat `attempt` until it yields something or `block` elapses
    async fn block_until<R, F>(&self, block: Duration, mut attempt: F) -> Result<Option<R>, StoreError>
    where
        F: FnMut(&Self) -> Result<Option<R>, StoreError> + Send,
        R: Send,
    {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(found) = attempt(self)? {
                return Ok(Some(found));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }
}

impl Default for MemoryFastStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FastStore for MemoryFastStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.execute("ping", |_, _| ()).await
    }

    async fn enqueue_and_try_acquire(
        &self,
        account: &AccountKey,
        request_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let lease_key = keys::lease(account);
        let queue_key = keys::wait_queue(account);

        self.execute("enqueue_and_try_acquire", |ks, now| {
            let holder = ks.live_holder(&lease_key, now);
            if holder.as_deref() == Some(request_id) {
                ks.grant_lease(&lease_key, request_id, now, ttl);
                return true;
            }

            ks.evict_stale_heads(&queue_key, request_id, now, ttl);
            let queue_empty = ks.queues.get(&queue_key).map_or(true, VecDeque::is_empty);
            if holder.is_none() && queue_empty {
                ks.grant_lease(&lease_key, request_id, now, ttl);
                return true;
            }

            let queue = ks.queues.entry(queue_key.clone()).or_default();
            match queue.iter_mut().find(|w| w.request_id == request_id) {
                Some(waiter) => waiter.last_seen = now,
                None => queue.push_back(Waiter {
                    request_id: request_id.to_string(),
                    last_seen: now,
                }),
            }
            false
        })
        .await
    }

    async fn try_promote_if_head(
        &self,
        account: &AccountKey,
        request_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let lease_key = keys::lease(account);
        let queue_key = keys::wait_queue(account);

        self.execute("try_promote_if_head", |ks, now| {
            let holder = ks.live_holder(&lease_key, now);
            if holder.as_deref() == Some(request_id) {
                ks.grant_lease(&lease_key, request_id, now, ttl);
                return true;
            }

            let queued = match ks.queues.get_mut(&queue_key) {
                Some(queue) => match queue.iter_mut().find(|w| w.request_id == request_id) {
                    Some(waiter) => {
                        waiter.last_seen = now;
                        true
                    }
                    None => false,
                },
                None => false,
            };
            if !queued {
                return false;
            }

            ks.evict_stale_heads(&queue_key, request_id, now, ttl);
            if holder.is_some() {
                return false;
            }

            let is_head = ks
                .queues
                .get(&queue_key)
                .and_then(VecDeque::front)
                .is_some_and(|head| head.request_id == request_id);
            if !is_head {
                return false;
            }

            if let Some(queue) = ks.queues.get_mut(&queue_key) {
                queue.pop_front();
                if queue.is_empty() {
                    ks.queues.remove(&queue_key);
                }
            }
            ks.grant_lease(&lease_key, request_id, now, ttl);
            true
        })
        .await
    }

    async fn release_and_promote(
        &self,
        account: &AccountKey,
        request_id: &str,
    ) -> Result<bool, StoreError> {
        let lease_key = keys::lease(account);
        let queue_key = keys::wait_queue(account);

        self.execute("release_and_promote", |ks, _| {
            let owned = ks
                .leases
                .get(&lease_key)
                .is_some_and(|lease| lease.holder == request_id);
            if owned {
                ks.leases.remove(&lease_key);
            }
            if let Some(queue) = ks.queues.get_mut(&queue_key) {
                queue.retain(|w| w.request_id != request_id);
                if queue.is_empty() {
                    ks.queues.remove(&queue_key);
                }
            }
            owned
        })
        .await
    }

    async fn force_release(
        &self,
        account: &AccountKey,
        expected_owner: &str,
    ) -> Result<bool, StoreError> {
        let lease_key = keys::lease(account);

        self.execute("force_release", |ks, _| {
            let owned = ks
                .leases
                .get(&lease_key)
                .is_some_and(|lease| lease.holder == expected_owner);
            if owned {
                ks.leases.remove(&lease_key);
            }
            owned
        })
        .await
    }

    async fn lease_holder(&self, account: &AccountKey) -> Result<Option<String>, StoreError> {
        let lease_key = keys::lease(account);
        self.execute("lease_holder", |ks, now| ks.live_holder(&lease_key, now))
            .await
    }

    async fn waiting(&self, account: &AccountKey) -> Result<Vec<String>, StoreError> {
        let queue_key = keys::wait_queue(account);
        self.execute("waiting", |ks, _| {
            ks.queues
                .get(&queue_key)
                .map(|queue| queue.iter().map(|w| w.request_id.clone()).collect())
                .unwrap_or_default()
        })
        .await
    }

    async fn apply_deposit(
        &self,
        command: &ApplyCommand<'_>,
        target: &DispatchTarget,
    ) -> Result<ApplyReply, StoreError> {
        let balance_key = keys::balance(command.account, command.currency);
        let dedup_key = keys::dedup(command.account);
        let token = command.token.as_str();

        let reply = self
            .execute("apply_deposit", |ks, now| {
                let current = ks.balance_of(&balance_key);
                if command.amount <= 0 {
                    return ApplyReply {
                        code: ApplyCode::Invalid,
                        balance: current,
                    };
                }

                let tokens = ks.dedup.entry(dedup_key.clone()).or_default();
                tokens.retain(|_, expires_at| *expires_at > now);
                if tokens.contains_key(token) {
                    return ApplyReply {
                        code: ApplyCode::Idempotent,
                        balance: current,
                    };
                }

                let Some(updated) = current.checked_add(command.amount) else {
                    return ApplyReply {
                        code: ApplyCode::Invalid,
                        balance: current,
                    };
                };
                tokens.insert(token.to_string(), now + command.dedup_ttl);
                ks.balances.insert(balance_key.clone(), updated);

                if let Some(entry) = &command.entry {
                    match target {
                        DispatchTarget::None => {}
                        DispatchTarget::List { list, ready } => {
                            ks.lists
                                .entry(list.clone())
                                .or_default()
                                .push_back(entry.clone());
                            ks.signal_ready(ready, list);
                        }
                        DispatchTarget::Log { stream } => {
                            ks.streams
                                .entry(stream.clone())
                                .or_default()
                                .append(entry.clone());
                        }
                    }
                }

                ApplyReply {
                    code: ApplyCode::Applied,
                    balance: updated,
                }
            })
            .await?;

        if reply.code == ApplyCode::Applied && command.entry.is_some() {
            self.appended.notify_waiters();
        }
        Ok(reply)
    }

    async fn balance(&self, account: &AccountKey, currency: &Currency) -> Result<i64, StoreError> {
        let balance_key = keys::balance(account, currency);
        self.execute("balance", |ks, _| ks.balance_of(&balance_key))
            .await
    }

    async fn claim_ready(
        &self,
        ready: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<ReadyClaim>, StoreError> {
        self.execute("claim_ready", |_, _| ()).await?;

        self.block_until(block, |store| {
            store.execute_now("claim_ready", |ks, now| {
                let list = ks.lists.get_mut(ready)?.pop_back()?;
                ks.drop_if_empty(ready);
                ks.in_flight.entry(ready.to_string()).or_default().insert(
                    list.clone(),
                    InFlight {
                        consumer: consumer.to_string(),
                        since: now,
                    },
                );
                let attempts = ks.head_attempts.entry(list.clone()).or_default();
                *attempts += 1;
                Some(ReadyClaim {
                    list,
                    attempts: *attempts,
                })
            })
        })
        .await
    }

    async fn list_head(&self, list: &str) -> Result<Option<String>, StoreError> {
        self.execute("list_head", |ks, _| {
            ks.lists.get(list).and_then(|entries| entries.front().cloned())
        })
        .await
    }

    async fn ack_list_head(
        &self,
        list: &str,
        expected: &str,
        ready: &str,
        consumer: &str,
    ) -> Result<bool, StoreError> {
        let removed = self.execute("ack_list_head", |ks, _| {
            let removed = match ks.lists.get_mut(list) {
                Some(entries) if entries.front().map(String::as_str) == Some(expected) => {
                    entries.pop_front();
                    true
                }
                _ => false,
            };
            ks.settle(ready, list, consumer);
            if removed {
                ks.head_attempts.remove(list);
            }
            // A stale ack after a reclaim must still hand the list back.
            if ks.list_len(list) > 0 {
                ks.signal_ready(ready, list);
            }
            ks.drop_if_empty(list);
            removed
        })
        .await?;
        self.appended.notify_waiters();
        Ok(removed)
    }

    async fn requeue_ready(
        &self,
        list: &str,
        ready: &str,
        consumer: &str,
    ) -> Result<(), StoreError> {
        self.execute("requeue_ready", |ks, _| {
            ks.settle(ready, list, consumer);
            if ks.list_len(list) > 0 {
                ks.signal_ready(ready, list);
            }
        })
        .await?;
        self.appended.notify_waiters();
        Ok(())
    }

    async fn reclaim_ready(&self, ready: &str, min_idle: Duration) -> Result<usize, StoreError> {
        let reclaimed = self
            .execute("reclaim_ready", |ks, now| {
                let stale: Vec<String> = ks
                    .in_flight
                    .get(ready)
                    .map(|claims| {
                        claims
                            .iter()
                            .filter(|(_, claim)| now.duration_since(claim.since) >= min_idle)
                            .map(|(list, _)| list.clone())
                            .collect()
                    })
                    .unwrap_or_default();

                for list in &stale {
                    if let Some(claims) = ks.in_flight.get_mut(ready) {
                        claims.remove(list);
                    }
                    if ks.list_len(list) > 0 {
                        ks.signal_ready(ready, list);
                    }
                }
                stale.len()
            })
            .await?;

        if reclaimed > 0 {
            self.appended.notify_waiters();
        }
        Ok(reclaimed)
    }

    async fn list_backlog(&self, prefix: &str) -> Result<usize, StoreError> {
        self.execute("list_backlog", |ks, _| {
            ks.lists
                .iter()
                .filter(|(name, _)| name.starts_with(prefix))
                .map(|(_, entries)| entries.len())
                .sum()
        })
        .await
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<bool, StoreError> {
        self.execute("create_group", |ks, _| {
            let log = ks.streams.entry(stream.to_string()).or_default();
            if log.groups.contains_key(group) {
                return false;
            }
            log.groups.insert(group.to_string(), Group::default());
            true
        })
        .await
    }

    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, StoreError> {
        self.execute("read_group", |_, _| ()).await?;

        let delivered = self
            .block_until(block, |store| {
                store
                    .execute_now("read_group", |ks, now| {
                        let mut fresh = Vec::new();
                        for stream in streams {
                            fresh.extend(ks.deliver(stream, group, consumer, count, now)?);
                        }
                        Ok::<_, StoreError>((!fresh.is_empty()).then_some(fresh))
                    })
                    .and_then(|result| result)
            })
            .await?;

        Ok(delivered.unwrap_or_default())
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, StoreError> {
        self.execute("ack", |ks, _| {
            ks.streams
                .get_mut(stream)
                .and_then(|log| log.groups.get_mut(group))
                .is_some_and(|cursor| cursor.pending.remove(&id).is_some())
        })
        .await
    }

    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: EntryId,
        count: usize,
    ) -> Result<(Vec<StreamMessage>, EntryId), StoreError> {
        self.execute("auto_claim", |ks, now| {
            let Some(Stream { entries, groups, .. }) = ks.streams.get_mut(stream) else {
                return Err(StoreError::script("auto_claim", "NOGROUP no such stream"));
            };
            let Some(cursor) = groups.get_mut(group) else {
                return Err(StoreError::script("auto_claim", "NOGROUP no such group"));
            };

            let candidates: Vec<EntryId> = cursor.pending.range(start..).map(|(id, _)| *id).collect();
            let mut claimed = Vec::new();
            let mut next = EntryId::ZERO;

            for id in candidates {
                if claimed.len() >= count.max(1) {
                    next = id;
                    break;
                }
                let Some(payload) = entries.get(&id) else {
                    cursor.pending.remove(&id);
                    continue;
                };
                let Some(pending) = cursor.pending.get_mut(&id) else {
                    continue;
                };
                if now.duration_since(pending.delivered_at) < min_idle {
                    continue;
                }
                pending.consumer = consumer.to_string();
                pending.delivered_at = now;
                pending.deliveries += 1;
                claimed.push(StreamMessage {
                    stream: stream.to_string(),
                    id,
                    payload: payload.clone(),
                    deliveries: pending.deliveries,
                });
            }

            Ok((claimed, next))
        })
        .await?
    }

    async fn delete_entry(&self, stream: &str, id: EntryId) -> Result<bool, StoreError> {
        self.execute("delete_entry", |ks, _| {
            ks.streams
                .get_mut(stream)
                .is_some_and(|log| log.entries.remove(&id).is_some())
        })
        .await
    }

    async fn stream_backlog(&self, stream: &str, group: &str) -> Result<usize, StoreError> {
        self.execute("stream_backlog", |ks, _| {
            let Some(log) = ks.streams.get(stream) else {
                return 0;
            };
            match log.groups.get(group) {
                Some(cursor) => {
                    let undelivered = log
                        .entries
                        .range((Bound::Excluded(cursor.last_delivered), Bound::Unbounded))
                        .count();
                    let unacked = cursor
                        .pending
                        .keys()
                        .filter(|id| log.entries.contains_key(id))
                        .count();
                    undelivered + unacked
                }
                None => log.entries.len(),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IdempotencyToken;

    const TTL: Duration = Duration::from_secs(5);

    fn account(raw: &str) -> AccountKey {
        AccountKey::parse(raw).unwrap()
    }

    fn one(stream: &str) -> Vec<String> {
        vec![stream.to_string()]
    }

    fn command<'a>(
        account: &'a AccountKey,
        currency: &'a Currency,
        token: &'a IdempotencyToken,
        amount: i64,
        entry: Option<&str>,
    ) -> ApplyCommand<'a> {
        ApplyCommand {
            account,
            currency,
            token,
            amount,
            entry: entry.map(str::to_string),
            dedup_ttl: Duration::from_secs(60),
        }
    }

    // Lease scripts

    #[tokio::test]
    async fn test_first_arrival_acquires_free_key() {
        let store = MemoryFastStore::new();
        let key = account("1");

        assert!(store.enqueue_and_try_acquire(&key, "a", TTL).await.unwrap());
        assert_eq!(store.lease_holder(&key).await.unwrap(), Some("a".to_string()));
        assert!(store.waiting(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_later_arrivals_queue_in_order() {
        let store = MemoryFastStore::new();
        let key = account("1");

        assert!(store.enqueue_and_try_acquire(&key, "a", TTL).await.unwrap());
        assert!(!store.enqueue_and_try_acquire(&key, "b", TTL).await.unwrap());
        assert!(!store.enqueue_and_try_acquire(&key, "c", TTL).await.unwrap());

        assert_eq!(store.waiting(&key).await.unwrap(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_only_head_is_promoted_after_release() {
        let store = MemoryFastStore::new();
        let key = account("1");
        store.enqueue_and_try_acquire(&key, "a", TTL).await.unwrap();
        store.enqueue_and_try_acquire(&key, "b", TTL).await.unwrap();
        store.enqueue_and_try_acquire(&key, "c", TTL).await.unwrap();

        assert!(!store.try_promote_if_head(&key, "b", TTL).await.unwrap());
        assert!(store.release_and_promote(&key, "a").await.unwrap());

        assert!(!store.try_promote_if_head(&key, "c", TTL).await.unwrap());
        assert!(store.try_promote_if_head(&key, "b", TTL).await.unwrap());
        assert_eq!(store.lease_holder(&key).await.unwrap(), Some("b".to_string()));
        assert_eq!(store.waiting(&key).await.unwrap(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_free_key_with_waiters_queues_newcomer() {
        let store = MemoryFastStore::new();
        let key = account("1");
        store.enqueue_and_try_acquire(&key, "a", TTL).await.unwrap();
        store.enqueue_and_try_acquire(&key, "b", TTL).await.unwrap();
        store.release_and_promote(&key, "a").await.unwrap();

        // Lease is free but "b" is waiting: "z" must not jump ahead.
        assert!(!store.enqueue_and_try_acquire(&key, "z", TTL).await.unwrap());
        assert!(store.try_promote_if_head(&key, "b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_holder_poll_renews_lease() {
        let store = MemoryFastStore::new();
        let key = account("1");
        let ttl = Duration::from_millis(80);
        store.enqueue_and_try_acquire(&key, "a", ttl).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            assert!(store.try_promote_if_head(&key, "a", ttl).await.unwrap());
        }
        assert_eq!(store.lease_holder(&key).await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_expired_lease_lets_head_in() {
        let store = MemoryFastStore::new();
        let key = account("1");
        let ttl = Duration::from_millis(50);
        store.enqueue_and_try_acquire(&key, "crashed", ttl).await.unwrap();
        store.enqueue_and_try_acquire(&key, "next", TTL).await.unwrap();

        assert!(!store.try_promote_if_head(&key, "next", TTL).await.unwrap());
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(store.try_promote_if_head(&key, "next", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_is_noop_for_non_holder() {
        let store = MemoryFastStore::new();
        let key = account("1");
        store.enqueue_and_try_acquire(&key, "a", TTL).await.unwrap();

        assert!(!store.release_and_promote(&key, "stranger").await.unwrap());
        assert!(!store.release_and_promote(&account("2"), "a").await.unwrap());
        assert_eq!(store.lease_holder(&key).await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_release_drops_abandoned_waiter() {
        let store = MemoryFastStore::new();
        let key = account("1");
        store.enqueue_and_try_acquire(&key, "a", TTL).await.unwrap();
        store.enqueue_and_try_acquire(&key, "gave-up", TTL).await.unwrap();
        store.enqueue_and_try_acquire(&key, "c", TTL).await.unwrap();

        assert!(!store.release_and_promote(&key, "gave-up").await.unwrap());
        assert_eq!(store.waiting(&key).await.unwrap(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_stale_head_is_evicted() {
        let store = MemoryFastStore::new();
        let key = account("1");
        let ttl = Duration::from_millis(50);
        store.enqueue_and_try_acquire(&key, "a", ttl).await.unwrap();
        store.enqueue_and_try_acquire(&key, "crashed-waiter", ttl).await.unwrap();
        store.enqueue_and_try_acquire(&key, "c", ttl).await.unwrap();
        store.release_and_promote(&key, "a").await.unwrap();

        // "c" keeps polling; "crashed-waiter" never does.
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            if store.try_promote_if_head(&key, "c", ttl).await.unwrap() {
                break;
            }
        }
        assert_eq!(store.lease_holder(&key).await.unwrap(), Some("c".to_string()));
    }

    #[tokio::test]
    async fn test_force_release_checks_owner() {
        let store = MemoryFastStore::new();
        let key = account("1");
        store.enqueue_and_try_acquire(&key, "a", TTL).await.unwrap();

        assert!(!store.force_release(&key, "b").await.unwrap());
        assert!(store.force_release(&key, "a").await.unwrap());
        assert_eq!(store.lease_holder(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let store = MemoryFastStore::new();
        assert!(store.enqueue_and_try_acquire(&account("1"), "a", TTL).await.unwrap());
        assert!(store.enqueue_and_try_acquire(&account("2"), "b", TTL).await.unwrap());
    }

    // Apply script

    #[tokio::test]
    async fn test_apply_is_idempotent_per_token() {
        let store = MemoryFastStore::new();
        let key = account("1");
        let currency = Currency::parse("IDR").unwrap();
        let token = IdempotencyToken::parse("t-1").unwrap();

        let first = store
            .apply_deposit(&command(&key, &currency, &token, 10, None), &DispatchTarget::None)
            .await
            .unwrap();
        let second = store
            .apply_deposit(&command(&key, &currency, &token, 10, None), &DispatchTarget::None)
            .await
            .unwrap();

        assert_eq!(first, ApplyReply { code: ApplyCode::Applied, balance: 10 });
        assert_eq!(second, ApplyReply { code: ApplyCode::Idempotent, balance: 10 });
    }

    #[tokio::test]
    async fn test_apply_rejects_non_positive_and_overflow() {
        let store = MemoryFastStore::new();
        let key = account("1");
        let currency = Currency::parse("IDR").unwrap();
        let t1 = IdempotencyToken::parse("t-1").unwrap();
        let t2 = IdempotencyToken::parse("t-2").unwrap();
        let t3 = IdempotencyToken::parse("t-3").unwrap();

        let zero = store
            .apply_deposit(&command(&key, &currency, &t1, 0, None), &DispatchTarget::None)
            .await
            .unwrap();
        assert_eq!(zero.code, ApplyCode::Invalid);

        store
            .apply_deposit(&command(&key, &currency, &t2, i64::MAX, None), &DispatchTarget::None)
            .await
            .unwrap();
        let overflow = store
            .apply_deposit(&command(&key, &currency, &t3, 1, None), &DispatchTarget::None)
            .await
            .unwrap();
        assert_eq!(overflow, ApplyReply { code: ApplyCode::Invalid, balance: i64::MAX });

        // A rejected token is not recorded and can be retried.
        let retried = store
            .apply_deposit(&command(&key, &currency, &t1, 5, None), &DispatchTarget::None)
            .await
            .unwrap();
        assert_eq!(retried.code, ApplyCode::Invalid);
    }

    #[tokio::test]
    async fn test_dedup_expires_after_retention() {
        let store = MemoryFastStore::new();
        let key = account("1");
        let currency = Currency::parse("IDR").unwrap();
        let token = IdempotencyToken::parse("t-1").unwrap();
        let mut cmd = command(&key, &currency, &token, 1, None);
        cmd.dedup_ttl = Duration::from_millis(30);

        store.apply_deposit(&cmd, &DispatchTarget::None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let reply = store.apply_deposit(&cmd, &DispatchTarget::None).await.unwrap();

        assert_eq!(reply, ApplyReply { code: ApplyCode::Applied, balance: 2 });
    }

    #[tokio::test]
    async fn test_apply_emits_only_when_applied() {
        let store = MemoryFastStore::new();
        let key = account("1");
        let currency = Currency::parse("IDR").unwrap();
        let token = IdempotencyToken::parse("t-1").unwrap();
        let target = DispatchTarget::List {
            list: keys::dispatch_list(&key),
            ready: keys::READY_LIST.to_string(),
        };

        for _ in 0..3 {
            store
                .apply_deposit(&command(&key, &currency, &token, 4, Some("entry")), &target)
                .await
                .unwrap();
        }

        assert_eq!(store.list_backlog(keys::DISPATCH_LIST_PREFIX).await.unwrap(), 1);
        assert_eq!(store.list_backlog(keys::READY_LIST).await.unwrap(), 1);
    }

    // List primitives

    #[tokio::test]
    async fn test_ready_signal_is_unique_per_list() {
        let store = MemoryFastStore::new();
        let key = account("1");
        let currency = Currency::parse("IDR").unwrap();
        let target = DispatchTarget::List {
            list: keys::dispatch_list(&key),
            ready: keys::READY_LIST.to_string(),
        };

        for i in 0..3 {
            let token = IdempotencyToken::parse(&format!("t-{}", i)).unwrap();
            let entry = format!("e-{}", i);
            store
                .apply_deposit(&command(&key, &currency, &token, 1, Some(&entry)), &target)
                .await
                .unwrap();
        }

        let claim = store
            .claim_ready(keys::READY_LIST, "w-0", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.list, "dispatch:{1}");
        assert_eq!(claim.attempts, 1);
        assert!(store
            .claim_ready(keys::READY_LIST, "w-1", Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());

        assert_eq!(store.list_head(&claim.list).await.unwrap(), Some("e-0".to_string()));
        assert!(store
            .ack_list_head(&claim.list, "e-0", keys::READY_LIST, "w-0")
            .await
            .unwrap());

        let again = store
            .claim_ready(keys::READY_LIST, "w-1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.list_head(&again.list).await.unwrap(), Some("e-1".to_string()));
    }

    #[tokio::test]
    async fn test_ack_with_stale_head_does_not_pop() {
        let store = MemoryFastStore::new();
        let key = account("1");
        store.inject_list_entry(&key, "e-0").unwrap();
        store.inject_list_entry(&key, "e-1").unwrap();
        let list = keys::dispatch_list(&key);

        assert!(!store
            .ack_list_head(&list, "e-1", keys::READY_LIST, "w-0")
            .await
            .unwrap());
        assert_eq!(store.list_head(&list).await.unwrap(), Some("e-0".to_string()));
    }

    #[tokio::test]
    async fn test_stale_ack_releases_list_for_next_claim() {
        let store = MemoryFastStore::new();
        let key = account("1");
        store.inject_list_entry(&key, "e-0").unwrap();
        store.inject_list_entry(&key, "e-1").unwrap();
        let list = keys::dispatch_list(&key);

        let claim = store
            .claim_ready(keys::READY_LIST, "w-0", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.list, list);
        store
            .ack_list_head(&list, "e-0", keys::READY_LIST, "w-1")
            .await
            .unwrap();

        // w-0 still owns the claim, so nothing is ready yet.
        assert!(store
            .claim_ready(keys::READY_LIST, "w-2", Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());

        assert!(!store
            .ack_list_head(&list, "e-0", keys::READY_LIST, "w-0")
            .await
            .unwrap());
        let next = store
            .claim_ready(keys::READY_LIST, "w-2", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.list_head(&next.list).await.unwrap(), Some("e-1".to_string()));
    }

    #[tokio::test]
    async fn test_claim_blocks_until_signal() {
        let store = std::sync::Arc::new(MemoryFastStore::new());
        let key = account("1");

        let waiter = {
            let store = std::sync::Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .claim_ready(keys::READY_LIST, "w-0", Duration::from_secs(2))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.inject_list_entry(&key, "e-0").unwrap();

        let claim = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(claim.list, "dispatch:{1}");
    }

    #[tokio::test]
    async fn test_stale_in_flight_claim_is_reclaimed() {
        let store = MemoryFastStore::new();
        let key = account("1");
        store.inject_list_entry(&key, "e-0").unwrap();

        store
            .claim_ready(keys::READY_LIST, "crashed", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.reclaim_ready(keys::READY_LIST, Duration::from_secs(60)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.reclaim_ready(keys::READY_LIST, Duration::from_millis(10)).await.unwrap(), 1);

        let claim = store
            .claim_ready(keys::READY_LIST, "w-1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.attempts, 2);
    }

    #[tokio::test]
    async fn test_requeue_resignals_list() {
        let store = MemoryFastStore::new();
        let key = account("1");
        store.inject_list_entry(&key, "e-0").unwrap();
        let claim = store
            .claim_ready(keys::READY_LIST, "w-0", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        store.requeue_ready(&claim.list, keys::READY_LIST, "w-0").await.unwrap();
        assert!(store
            .claim_ready(keys::READY_LIST, "w-0", Duration::from_millis(10))
            .await
            .unwrap()
            .is_some());
    }

    // Log primitives

    #[tokio::test]
    async fn test_group_delivers_each_entry_once() {
        let store = MemoryFastStore::new();
        assert!(store.create_group("s", "g").await.unwrap());
        assert!(!store.create_group("s", "g").await.unwrap());
        store.inject_stream_entry("s", "a").unwrap();
        store.inject_stream_entry("s", "b").unwrap();

        let first = store.read_group(&one("s"), "g", "c1", 1, Duration::from_millis(10)).await.unwrap();
        let second = store.read_group(&one("s"), "g", "c2", 10, Duration::from_millis(10)).await.unwrap();
        let third = store.read_group(&one("s"), "g", "c1", 10, Duration::from_millis(10)).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].payload, "a");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].payload, "b");
        assert!(third.is_empty());
        assert_eq!(store.stream_backlog("s", "g").await.unwrap(), 2);

        assert!(store.ack("s", "g", first[0].id).await.unwrap());
        assert!(!store.ack("s", "g", first[0].id).await.unwrap());
        assert_eq!(store.stream_backlog("s", "g").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_group_covers_every_stream() {
        let store = MemoryFastStore::new();
        let streams = vec!["s0".to_string(), "s1".to_string()];
        for stream in &streams {
            store.create_group(stream, "g").await.unwrap();
        }
        store.inject_stream_entry("s1", "b").unwrap();

        let delivered = store
            .read_group(&streams, "g", "c", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].stream, "s1");
    }

    #[tokio::test]
    async fn test_read_group_without_group_fails() {
        let store = MemoryFastStore::new();
        let result = store.read_group(&one("s"), "g", "c", 1, Duration::from_millis(5)).await;
        assert!(matches!(result, Err(StoreError::Script { .. })));
    }

    #[tokio::test]
    async fn test_auto_claim_respects_min_idle() {
        let store = MemoryFastStore::new();
        store.create_group("s", "g").await.unwrap();
        let id = store.inject_stream_entry("s", "a").unwrap();
        store.read_group(&one("s"), "g", "crashed", 10, Duration::from_millis(5)).await.unwrap();

        let (early, _) = store
            .auto_claim("s", "g", "rescuer", Duration::from_secs(60), EntryId::ZERO, 10)
            .await
            .unwrap();
        assert!(early.is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let (claimed, next) = store
            .auto_claim("s", "g", "rescuer", Duration::from_millis(10), EntryId::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].deliveries, 2);
        assert_eq!(next, EntryId::ZERO);
    }

    #[tokio::test]
    async fn test_auto_claim_pages_with_cursor() {
        let store = MemoryFastStore::new();
        store.create_group("s", "g").await.unwrap();
        for payload in ["a", "b", "c"] {
            store.inject_stream_entry("s", payload).unwrap();
        }
        store.read_group(&one("s"), "g", "crashed", 10, Duration::from_millis(5)).await.unwrap();

        let (page, next) = store
            .auto_claim("s", "g", "r", Duration::ZERO, EntryId::ZERO, 2)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_ne!(next, EntryId::ZERO);

        let (rest, done) = store.auto_claim("s", "g", "r", Duration::ZERO, next, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].payload, "c");
        assert_eq!(done, EntryId::ZERO);
    }

    #[tokio::test]
    async fn test_deleted_entries_leave_backlog() {
        let store = MemoryFastStore::new();
        store.create_group("s", "g").await.unwrap();
        let id = store.inject_stream_entry("s", "a").unwrap();
        store.read_group(&one("s"), "g", "c", 10, Duration::from_millis(5)).await.unwrap();

        assert!(store.delete_entry("s", id).await.unwrap());
        assert_eq!(store.stream_backlog("s", "g").await.unwrap(), 0);
    }

    // Fault injection

    #[tokio::test]
    async fn test_unavailable_store_fails_calls() {
        let store = MemoryFastStore::new();
        store.set_available(false);

        assert!(matches!(store.ping().await, Err(StoreError::Unavailable { .. })));
        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_latency_trips_bounded_timeout() {
        let store = MemoryFastStore::new();
        store.set_latency(Duration::from_millis(200));

        let result = crate::store::bounded("ping", Duration::from_millis(20), store.ping()).await;
        assert!(matches!(result, Err(StoreError::Timeout { .. })));
    }
}
