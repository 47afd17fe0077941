//! Durable Store contract and in-process ledger
//!
//! The Durable Store is the system of record. The core only ever calls one
//! operation on it: an upsert-with-increment keyed by
//! `(account, currency, network)`. The upsert is idempotent-safe: it receives
//! the idempotency token and ignores a token it has already applied for the
//! account, so at-least-once delivery from the dispatch transport has an
//! exactly-once effect on durable balances.
//!
//! Balances are exact fixed-point decimals. Amounts arrive in minor units and
//! are scaled per currency by [`minor_to_decimal`].

use crate::types::{
    AccountKey, Currency, DispatchEntry, DurableApplyError, IdempotencyToken, Network,
};
use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::warn;

/// Default time a journaled token is remembered, matching the fast-path dedup TTL
pub const DEFAULT_JOURNAL_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Largest decimal scale used for any currency
const MAX_SCALE: u32 = 8;

/// Number of decimal places of a currency's minor unit
///
/// Unknown currencies are treated as having no minor unit.
pub fn currency_scale(currency: &Currency) -> u32 {
    let scale = match currency.as_str() {
        "IDR" => 0,
        "USD" | "SGD" | "EUR" => 2,
        "USDT" => 6,
        "BTC" | "ETH" => 8,
        _ => 0,
    };
    scale.min(MAX_SCALE)
}

/// Convert an amount in minor units to its decimal value
///
/// # Examples
///
/// ```
/// use deposit_ledger::store::ledger::minor_to_decimal;
/// use deposit_ledger::types::Currency;
/// use rust_decimal::Decimal;
///
/// let usd = Currency::parse("usd").unwrap();
/// assert_eq!(minor_to_decimal(1250, &usd), Decimal::new(1250, 2));
/// ```
pub fn minor_to_decimal(amount: i64, currency: &Currency) -> Decimal {
    Decimal::new(amount, currency_scale(currency))
}

/// A deposit as applied to the Durable Store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableDeposit {
    /// Account credited
    pub account: AccountKey,
    /// Currency of the row
    pub currency: Currency,
    /// Network of the row
    pub network: Network,
    /// Idempotency token journaled with the increment
    pub token: IdempotencyToken,
    /// Decimal amount
    pub amount: Decimal,
}

impl DurableDeposit {
    /// Build the durable increment described by a dispatch entry
    pub fn from_entry(entry: &DispatchEntry) -> Self {
        DurableDeposit {
            account: entry.account.clone(),
            currency: entry.currency.clone(),
            network: entry.network.clone(),
            token: entry.token.clone(),
            amount: minor_to_decimal(entry.amount, &entry.currency),
        }
    }
}

/// One durable balance row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableBalance {
    /// Account of the row
    pub account: AccountKey,
    /// Currency of the row
    pub currency: Currency,
    /// Network of the row
    pub network: Network,
    /// Decimal balance
    pub balance: Decimal,
    /// Time of the last increment
    pub updated_at: SystemTime,
}

/// Effect of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The row was created or incremented
    Applied,
    /// The token was already applied for this account; nothing changed
    Duplicate,
}

/// The Durable Store
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Readiness check
    async fn ping(&self) -> Result<(), DurableApplyError>;

    /// Insert the row with `amount` as its balance, or add `amount` to the
    /// existing balance, unless `token` was already applied for the account
    async fn upsert_deposit(
        &self,
        deposit: &DurableDeposit,
    ) -> Result<UpsertOutcome, DurableApplyError>;

    /// Read one row
    async fn balance(
        &self,
        account: &AccountKey,
        currency: &Currency,
        network: &Network,
    ) -> Result<Option<DurableBalance>, DurableApplyError>;

    /// Read every row, ordered by account, currency and network
    async fn balances(&self) -> Result<Vec<DurableBalance>, DurableApplyError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RowKey {
    account: AccountKey,
    currency: Currency,
    network: Network,
}

/// In-process [`DurableStore`]
///
/// Rows live in a `DashMap`, so increments to different rows proceed in
/// parallel while increments to one row are serialized by its shard lock.
/// The token journal is a second `DashMap`, one token set per account, whose
/// insert doubles as the "on conflict do nothing" check. Journaled tokens
/// expire after the retention window, which should equal the fast-path dedup
/// TTL so a token the Fast Store has forgotten is also applied durably.
/// Expired tokens of an account are pruned on its next upsert.
///
/// Failures can be injected with [`MemoryLedger::fail_next`],
/// [`MemoryLedger::set_available`] and [`MemoryLedger::set_latency`].
#[derive(Debug)]
pub struct MemoryLedger {
    rows: DashMap<RowKey, DurableBalance>,
    journal: DashMap<AccountKey, HashMap<IdempotencyToken, Instant>>,
    retention: Duration,
    failures_left: AtomicUsize,
    available: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryLedger {
    /// Create an empty, reachable ledger with the default journal retention
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_JOURNAL_RETENTION)
    }

    /// Create an empty, reachable ledger whose journal forgets a token after
    /// `retention`
    ///
    /// # Arguments
    ///
    /// * `retention` - How long an applied token is remembered. Zero is
    ///   replaced with [`DEFAULT_JOURNAL_RETENTION`].
    pub fn with_retention(retention: Duration) -> Self {
        let retention = if retention.is_zero() {
            warn!("Journal retention of zero, using default");
            DEFAULT_JOURNAL_RETENTION
        } else {
            retention
        };
        Self {
            rows: DashMap::new(),
            journal: DashMap::new(),
            retention,
            failures_left: AtomicUsize::new(0),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Make the next `count` upserts fail with `Unavailable`
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Simulate the ledger going down (`false`) or coming back (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every upsert by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of journaled tokens, including expired ones not yet pruned
    pub fn journal_len(&self) -> usize {
        self.journal.iter().map(|tokens| tokens.len()).sum()
    }

    /// How long an applied token is remembered
    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn check_available(&self) -> Result<(), DurableApplyError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DurableApplyError::Unavailable {
                message: "connection refused".to_string(),
            })
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryLedger {
    async fn ping(&self) -> Result<(), DurableApplyError> {
        self.check_available()
    }

    async fn upsert_deposit(
        &self,
        deposit: &DurableDeposit,
    ) -> Result<UpsertOutcome, DurableApplyError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.check_available()?;
        if self.take_injected_failure() {
            return Err(DurableApplyError::Unavailable {
                message: "injected failure".to_string(),
            });
        }

        {
            let now = Instant::now();
            let mut tokens = self.journal.entry(deposit.account.clone()).or_default();
            tokens.retain(|_, expires_at| *expires_at > now);
            if tokens.contains_key(&deposit.token) {
                return Ok(UpsertOutcome::Duplicate);
            }
            tokens.insert(deposit.token.clone(), now + self.retention);
        }

        let key = RowKey {
            account: deposit.account.clone(),
            currency: deposit.currency.clone(),
            network: deposit.network.clone(),
        };
        let now = SystemTime::now();
        let mut row = self.rows.entry(key).or_insert_with(|| DurableBalance {
            account: deposit.account.clone(),
            currency: deposit.currency.clone(),
            network: deposit.network.clone(),
            balance: Decimal::ZERO,
            updated_at: now,
        });

        match row.balance.checked_add(deposit.amount) {
            Some(updated) => {
                row.balance = updated;
                row.updated_at = now;
                Ok(UpsertOutcome::Applied)
            }
            None => {
                drop(row);
                if let Some(mut tokens) = self.journal.get_mut(&deposit.account) {
                    tokens.remove(&deposit.token);
                }
                Err(DurableApplyError::Rejected {
                    account: deposit.account.to_string(),
                    currency: deposit.currency.to_string(),
                    message: "numeric overflow".to_string(),
                })
            }
        }
    }

    async fn balance(
        &self,
        account: &AccountKey,
        currency: &Currency,
        network: &Network,
    ) -> Result<Option<DurableBalance>, DurableApplyError> {
        self.check_available()?;
        let key = RowKey {
            account: account.clone(),
            currency: currency.clone(),
            network: network.clone(),
        };
        Ok(self.rows.get(&key).map(|row| row.value().clone()))
    }

    async fn balances(&self) -> Result<Vec<DurableBalance>, DurableApplyError> {
        self.check_available()?;
        let mut rows: Vec<DurableBalance> =
            self.rows.iter().map(|row| row.value().clone()).collect();
        rows.sort_by(|a, b| {
            (&a.account, &a.currency, &a.network).cmp(&(&b.account, &b.currency, &b.network))
        });
        Ok(rows)
    }
}
