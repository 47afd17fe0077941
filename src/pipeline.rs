//! Deposit pipeline composition root
//!
//! Wires the four core components over one Shared Fast Store and one
//! Durable Store:
//!
//! ```text
//! DepositPipeline
//!     ├── Arc<dyn DepositService>       (strategy: admission + apply)
//!     │       ├── AdmissionSerializer
//!     │       └── IdempotentLedgerApply ──emits──► DispatchTransport
//!     └── ReconciliationWorkers ◄──drains── DispatchTransport
//!             └── Arc<dyn DurableStore>
//! ```
//!
//! The pipeline owns the shutdown token; cancelling it stops waiting
//! admissions and every worker.

use crate::config::PipelineConfig;
use crate::core::{
    create_transport, AdmissionSerializer, DispatchTransport, IdempotentLedgerApply,
    ReconciliationWorkers, WorkerStatsSnapshot,
};
use crate::io::BalanceRow;
use crate::store::ledger::minor_to_decimal;
use crate::store::{DurableBalance, DurableStore, FastStore};
use crate::strategy::{create_strategy, DepositService};
use crate::types::{
    AccountKey, Currency, DepositError, DepositInput, DepositReceipt, DepositResponse,
    DurableApplyError,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Readiness report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineHealth {
    /// Fast store answered a ping
    pub fast_store: bool,
    /// Durable store answered a ping
    pub durable_store: bool,
    /// Workers currently running
    pub workers_running: usize,
    /// Entries accepted but not yet reconciled, if the fast store answered
    pub backlog: Option<usize>,
}

impl PipelineHealth {
    /// Whether the pipeline can accept deposits
    ///
    /// Deposits only need the fast store. A durable outage delays
    /// reconciliation but does not stop admission.
    pub fn ready(&self) -> bool {
        self.fast_store
    }
}

/// A running deposit service
pub struct DepositPipeline {
    config: PipelineConfig,
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn DurableStore>,
    transport: Arc<dyn DispatchTransport>,
    apply: IdempotentLedgerApply,
    service: Arc<dyn DepositService>,
    workers: ReconciliationWorkers,
    shutdown: CancellationToken,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl DepositPipeline {
    /// Build a pipeline; workers are not started until [`Self::start`]
    ///
    /// # Arguments
    ///
    /// * `fast` - Shared Fast Store
    /// * `durable` - Durable Store
    /// * `config` - Strategy, transport and component settings
    pub fn new(
        fast: Arc<dyn FastStore>,
        durable: Arc<dyn DurableStore>,
        config: PipelineConfig,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let transport = create_transport(
            Arc::clone(&fast),
            config.dispatch.clone(),
            config.workers.count,
            config.apply.store_timeout,
        );
        let apply = IdempotentLedgerApply::new(
            Arc::clone(&fast),
            Arc::clone(&transport),
            config.apply.clone(),
        );
        let serializer = AdmissionSerializer::new(Arc::clone(&fast), config.lease.clone());
        let service = create_strategy(
            config.strategy,
            apply.clone(),
            serializer,
            shutdown.clone(),
        );
        let workers = ReconciliationWorkers::new(
            Arc::clone(&transport),
            Arc::clone(&durable),
            config.workers.clone(),
            config.dispatch.reclaim_interval,
            &config.instance,
        );

        Self {
            config,
            fast,
            durable,
            transport,
            apply,
            service,
            workers,
            shutdown,
            tasks: Mutex::new(None),
        }
    }

    /// Settings the pipeline was built with
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Name of the active admission strategy
    pub fn strategy_name(&self) -> &'static str {
        self.service.name()
    }

    /// Create transport structures and spawn the worker pool
    ///
    /// Calling it again while workers are running does nothing.
    pub async fn start(&self) -> Result<(), DepositError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return Ok(());
        }

        self.transport.prepare().await?;
        *tasks = Some(self.workers.spawn(&self.shutdown));
        info!(
            strategy = self.service.name(),
            transport = %self.transport.kind(),
            workers = self.config.workers.count,
            "pipeline started"
        );
        Ok(())
    }

    /// Validate, admit and apply one deposit
    pub async fn deposit(&self, input: DepositInput) -> Result<DepositReceipt, DepositError> {
        self.service.deposit(input).await
    }

    /// [`Self::deposit`] mapped to the wire response
    pub async fn submit(&self, input: DepositInput) -> DepositResponse {
        self.service.submit(input).await
    }

    /// Fast balance in minor units
    pub async fn fast_balance(
        &self,
        account: &AccountKey,
        currency: &Currency,
    ) -> Result<i64, DepositError> {
        self.apply.balance(account, currency).await
    }

    /// Every durable row
    pub async fn durable_balances(&self) -> Result<Vec<DurableBalance>, DurableApplyError> {
        self.durable.balances().await
    }

    /// Durable rows side by side with the fast balance of their account
    ///
    /// A row is in sync when the durable balances of every network of its
    /// account and currency add up to the fast balance.
    pub async fn balance_report(&self) -> Result<Vec<BalanceRow>, String> {
        let rows = self
            .durable_balances()
            .await
            .map_err(|e| format!("Failed to read durable balances: {}", e))?;

        let mut durable_totals: HashMap<(AccountKey, Currency), Decimal> = HashMap::new();
        for row in &rows {
            *durable_totals
                .entry((row.account.clone(), row.currency.clone()))
                .or_default() += row.balance;
        }

        let mut fast_balances = HashMap::new();
        for (account, currency) in durable_totals.keys() {
            let fast = self
                .fast_balance(account, currency)
                .await
                .map_err(|e| format!("Failed to read fast balance: {}", e))?;
            fast_balances.insert((account.clone(), currency.clone()), fast);
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let key = (row.account.clone(), row.currency.clone());
                let fast_minor = fast_balances.get(&key).copied().unwrap_or_default();
                let in_sync = durable_totals.get(&key).copied().unwrap_or_default()
                    == minor_to_decimal(fast_minor, &row.currency);
                BalanceRow {
                    account: row.account,
                    currency: row.currency,
                    network: row.network,
                    fast_minor,
                    durable: row.balance,
                    in_sync,
                }
            })
            .collect())
    }

    /// Entries accepted but not yet reconciled
    pub async fn backlog(&self) -> Result<usize, DepositError> {
        Ok(self.transport.backlog().await?)
    }

    /// Check both stores and the worker pool
    pub async fn health(&self) -> PipelineHealth {
        let fast_store = self.fast.ping().await.is_ok();
        let durable_store = self.durable.ping().await.is_ok();
        let backlog = if fast_store {
            self.transport.backlog().await.ok()
        } else {
            None
        };

        PipelineHealth {
            fast_store,
            durable_store,
            workers_running: self.workers.running(),
            backlog,
        }
    }

    /// Wait until the dispatch backlog is empty
    ///
    /// # Returns
    ///
    /// `true` if the backlog drained within `timeout`
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.transport.backlog().await {
                Ok(0) => return true,
                Ok(_) => {}
                Err(error) => warn!(error = %error, "backlog check failed"),
            }
            if Instant::now() + DRAIN_POLL > deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    /// Worker counters
    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.workers.stats().snapshot()
    }

    /// Cancel waiting admissions and stop the workers
    ///
    /// Returns once every worker has finished its current entry.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let Some(mut tasks) = self.tasks.lock().await.take() else {
            return;
        };
        while let Some(result) = tasks.join_next().await {
            if let Err(error) = result {
                warn!(error = %error, "worker task failed");
            }
        }
        info!(stats = ?self.stats(), "pipeline stopped");
    }
}
