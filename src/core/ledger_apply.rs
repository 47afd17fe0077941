//! Atomic idempotent balance mutation
//!
//! [`IdempotentLedgerApply`] wraps the fast store's apply script. In one
//! atomic step the script checks the token against the account's dedup log,
//! increments the fast balance, records the token and emits the dispatch
//! entry, so a dispatch entry never exists without its balance mutation and
//! vice versa.
//!
//! Amounts are integer minor units end to end; no floating point is used.

use super::transport::DispatchTransport;
use crate::config::ApplyConfig;
use crate::store::{bounded, ApplyCode, ApplyCommand, DispatchTarget, FastStore};
use crate::types::{
    AccountKey, Currency, DepositCode, DepositError, DepositReceipt, DepositRequest,
    DispatchEntry,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Idempotent apply against the Shared Fast Store
#[derive(Clone)]
pub struct IdempotentLedgerApply {
    store: Arc<dyn FastStore>,
    transport: Option<Arc<dyn DispatchTransport>>,
    config: ApplyConfig,
}

impl IdempotentLedgerApply {
    /// Create an apply step that emits a dispatch entry for every applied
    /// deposit
    ///
    /// # Arguments
    ///
    /// * `store` - Shared Fast Store handle
    /// * `transport` - Decides where entries are emitted
    /// * `config` - Call timeout and dedup retention
    pub fn new(
        store: Arc<dyn FastStore>,
        transport: Arc<dyn DispatchTransport>,
        config: ApplyConfig,
    ) -> Self {
        Self {
            store,
            transport: Some(transport),
            config,
        }
    }

    /// Create an apply step that only mutates the fast balance
    pub fn balance_only(store: Arc<dyn FastStore>, config: ApplyConfig) -> Self {
        Self {
            store,
            transport: None,
            config,
        }
    }

    /// Apply a deposit at most once per idempotency token
    ///
    /// # Returns
    ///
    /// * `Ok(receipt)` with [`DepositCode::Applied`] and the new balance, or
    ///   [`DepositCode::Idempotent`] and the unchanged balance
    /// * `Err(DepositError::Validation)` for a non-positive amount (the store
    ///   is not touched) or an increment that would overflow the balance
    /// * `Err(DepositError::Queue)` if the store is unavailable or times out
    /// * `Err(DepositError::Failed)` if the apply script reply cannot be
    ///   interpreted
    pub async fn apply(&self, request: &DepositRequest) -> Result<DepositReceipt, DepositError> {
        if request.amount <= 0 {
            return Err(DepositError::validation(
                "amount",
                format!("must be a positive integer, got {}", request.amount),
            ));
        }

        let (entry, target) = match &self.transport {
            Some(transport) => (
                Some(DispatchEntry::from_request(request).encode()),
                transport.target_for(&request.account),
            ),
            None => (None, DispatchTarget::None),
        };
        let command = ApplyCommand {
            account: &request.account,
            currency: &request.currency,
            token: &request.token,
            amount: request.amount,
            entry,
            dedup_ttl: self.config.dedup_ttl,
        };

        let reply = bounded(
            "apply_deposit",
            self.config.store_timeout,
            self.store.apply_deposit(&command, &target),
        )
        .await?;

        let code = match reply.code {
            ApplyCode::Applied => DepositCode::Applied,
            ApplyCode::Idempotent => DepositCode::Idempotent,
            ApplyCode::Invalid => {
                warn!(
                    account = %request.account,
                    token = %request.token,
                    amount = request.amount,
                    balance = reply.balance,
                    "deposit rejected by apply script"
                );
                return Err(DepositError::validation(
                    "amount",
                    format!(
                        "{} would overflow balance {}",
                        request.amount, reply.balance
                    ),
                ));
            }
        };

        debug!(
            account = %request.account,
            token = %request.token,
            currency = %request.currency,
            applied = code == DepositCode::Applied,
            balance = reply.balance,
            "deposit applied to fast store"
        );

        Ok(DepositReceipt {
            code,
            balance: reply.balance,
            currency: request.currency.clone(),
            network: request.network.clone(),
        })
    }

    /// Current fast balance in minor units
    pub async fn balance(
        &self,
        account: &AccountKey,
        currency: &Currency,
    ) -> Result<i64, DepositError> {
        Ok(bounded(
            "balance",
            self.config.store_timeout,
            self.store.balance(account, currency),
        )
        .await?)
    }
}
