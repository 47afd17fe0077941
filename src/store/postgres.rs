//! Postgres [`DurableStore`]
//!
//! Available with the `postgres` cargo feature. Rows live in `wallets`, keyed
//! by `(user_id, currency, network)`; applied tokens live in
//! `deposit_journal`, keyed by `(user_id, token)`. One upsert is one
//! transaction:
//!
//! 1. journal the token, reclaiming a journal row only once it is older than
//!    the retention window. No row affected means the token was already
//!    applied and the transaction is rolled back.
//! 2. insert the wallet row, or add the amount to its balance on conflict.

use super::ledger::{DurableBalance, DurableDeposit, DurableStore, UpsertOutcome};
use crate::types::{AccountKey, Currency, DurableApplyError, Network};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info};

/// Tables created by [`PgLedger::migrate`]
pub const SCHEMA: [&str; 2] = [
    "CREATE TABLE IF NOT EXISTS wallets (
        user_id TEXT NOT NULL,
        currency TEXT NOT NULL,
        network TEXT NOT NULL,
        balance NUMERIC(38, 8) NOT NULL DEFAULT 0,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (user_id, currency, network)
    )",
    "CREATE TABLE IF NOT EXISTS deposit_journal (
        user_id TEXT NOT NULL,
        token TEXT NOT NULL,
        applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (user_id, token)
    )",
];

const JOURNAL_TOKEN: &str = "INSERT INTO deposit_journal (user_id, token, applied_at) VALUES ($1, $2, NOW())
    ON CONFLICT (user_id, token) DO UPDATE SET applied_at = EXCLUDED.applied_at
    WHERE deposit_journal.applied_at < NOW() - make_interval(secs => $3)";

const UPSERT_WALLET: &str = "INSERT INTO wallets (user_id, currency, network, balance, is_active) VALUES ($1, $2, $3, $4, TRUE)
    ON CONFLICT (user_id, currency, network)
    DO UPDATE SET balance = wallets.balance + EXCLUDED.balance, updated_at = NOW()";

const SELECT_WALLETS: &str = "SELECT user_id, currency, network, balance,
    (EXTRACT(EPOCH FROM updated_at) * 1000)::BIGINT AS updated_ms FROM wallets";

const PURGE_JOURNAL: &str =
    "DELETE FROM deposit_journal WHERE applied_at < NOW() - make_interval(secs => $1)";

/// Whether a SQLSTATE code means the row itself was refused
///
/// Class 22 (data exception, e.g. numeric overflow) and class 23 (integrity
/// constraint violation) will fail again on every retry; anything else is
/// treated as the store being unavailable.
pub fn is_rejection(sqlstate: &str) -> bool {
    sqlstate.starts_with("22") || sqlstate.starts_with("23")
}

fn unavailable(error: sqlx::Error) -> DurableApplyError {
    DurableApplyError::Unavailable {
        message: error.to_string(),
    }
}

fn upsert_error(error: sqlx::Error, deposit: &DurableDeposit) -> DurableApplyError {
    let rejected = match &error {
        sqlx::Error::Database(db) => db.code().is_some_and(|code| is_rejection(&code)),
        _ => false,
    };
    if rejected {
        DurableApplyError::Rejected {
            account: deposit.account.to_string(),
            currency: deposit.currency.to_string(),
            message: error.to_string(),
        }
    } else {
        unavailable(error)
    }
}

fn malformed(column: &str, error: impl std::fmt::Display) -> DurableApplyError {
    DurableApplyError::Unavailable {
        message: format!("malformed wallet row ({}): {}", column, error),
    }
}

fn balance_from_row(row: &PgRow) -> Result<DurableBalance, DurableApplyError> {
    let user_id: String = row.try_get("user_id").map_err(unavailable)?;
    let currency: String = row.try_get("currency").map_err(unavailable)?;
    let network: String = row.try_get("network").map_err(unavailable)?;
    let balance: Decimal = row.try_get("balance").map_err(unavailable)?;
    let updated_ms: i64 = row.try_get("updated_ms").map_err(unavailable)?;

    Ok(DurableBalance {
        account: AccountKey::parse(&user_id).map_err(|e| malformed("user_id", e))?,
        currency: Currency::parse(&currency).map_err(|e| malformed("currency", e))?,
        network: Network::parse(&network).map_err(|e| malformed("network", e))?,
        balance,
        updated_at: UNIX_EPOCH + Duration::from_millis(updated_ms.max(0) as u64),
    })
}

/// Postgres-backed Durable Store
#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
    retention: Duration,
}

impl PgLedger {
    /// Connect a pool to `url`
    ///
    /// # Arguments
    ///
    /// * `url` - Postgres connection string
    /// * `max_connections` - Pool size
    /// * `retention` - How long an applied token is remembered; should equal
    ///   the fast-path dedup TTL
    pub async fn connect(
        url: &str,
        max_connections: u32,
        retention: Duration,
    ) -> Result<Self, DurableApplyError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(unavailable)?;
        info!(max_connections, retention_secs = retention.as_secs(), "connected to durable store");
        Ok(Self::from_pool(pool, retention))
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool, retention: Duration) -> Self {
        Self { pool, retention }
    }

    /// How long an applied token is remembered
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Create the wallet and journal tables if they do not exist
    pub async fn migrate(&self) -> Result<(), DurableApplyError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(unavailable)?;
        }
        Ok(())
    }

    /// Delete journal rows older than the retention window
    ///
    /// # Returns
    ///
    /// The number of rows deleted
    pub async fn purge_journal(&self) -> Result<u64, DurableApplyError> {
        let result = sqlx::query(PURGE_JOURNAL)
            .bind(self.retention.as_secs_f64())
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        if result.rows_affected() > 0 {
            debug!(purged = result.rows_affected(), "purged expired journal rows");
        }
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DurableStore for PgLedger {
    async fn ping(&self) -> Result<(), DurableApplyError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn upsert_deposit(
        &self,
        deposit: &DurableDeposit,
    ) -> Result<UpsertOutcome, DurableApplyError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let journaled = sqlx::query(JOURNAL_TOKEN)
            .bind(deposit.account.as_str())
            .bind(deposit.token.as_str())
            .bind(self.retention.as_secs_f64())
            .execute(&mut *tx)
            .await
            .map_err(|e| upsert_error(e, deposit))?;
        if journaled.rows_affected() == 0 {
            tx.rollback().await.map_err(unavailable)?;
            return Ok(UpsertOutcome::Duplicate);
        }

        sqlx::query(UPSERT_WALLET)
            .bind(deposit.account.as_str())
            .bind(deposit.currency.as_str())
            .bind(deposit.network.as_str())
            .bind(deposit.amount)
            .execute(&mut *tx)
            .await
            .map_err(|e| upsert_error(e, deposit))?;

        tx.commit().await.map_err(unavailable)?;
        Ok(UpsertOutcome::Applied)
    }

    async fn balance(
        &self,
        account: &AccountKey,
        currency: &Currency,
        network: &Network,
    ) -> Result<Option<DurableBalance>, DurableApplyError> {
        let query = format!(
            "{} WHERE user_id = $1 AND currency = $2 AND network = $3",
            SELECT_WALLETS
        );
        let row = sqlx::query(&query)
            .bind(account.as_str())
            .bind(currency.as_str())
            .bind(network.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        row.as_ref().map(balance_from_row).transpose()
    }

    async fn balances(&self) -> Result<Vec<DurableBalance>, DurableApplyError> {
        let query = format!("{} ORDER BY user_id, currency, network", SELECT_WALLETS);
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;
        rows.iter().map(balance_from_row).collect()
    }
}
