//! Admission strategy module for deposit processing
//!
//! This module defines the Strategy pattern for the deposit contract. Every
//! strategy validates the request and applies it through
//! [`IdempotentLedgerApply`]; they differ in how concurrent deposits for one
//! account are admitted:
//!
//! - [`DirectStrategy`]: no admission step, relies solely on the atomic apply
//!   script and its dedup log
//! - [`SerializedStrategy`]: admits through the per-account FIFO lease lock
//!   first, so deposits for one account are applied in arrival order
//!
//! The transport carrying entries to the durable ledger is chosen
//! independently, so every strategy runs against both transports.

use crate::cli::StrategyType;
use crate::core::{AdmissionSerializer, IdempotentLedgerApply};
use crate::types::{DepositError, DepositInput, DepositReceipt, DepositResponse};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod direct;
pub mod serialized;

pub use direct::DirectStrategy;
pub use serialized::SerializedStrategy;

/// Deposit contract shared by every admission strategy
///
/// Implementations never surface a raw storage error: a caller only sees a
/// receipt (applied or idempotent) or a [`DepositError`].
#[async_trait]
pub trait DepositService: Send + Sync {
    /// Short strategy name for logs
    fn name(&self) -> &'static str;

    /// Validate and apply one deposit
    ///
    /// # Arguments
    ///
    /// * `input` - Raw request as received from the request transport
    ///
    /// # Returns
    ///
    /// * `Ok(receipt)` if the deposit was applied or had already been applied
    /// * `Err(DepositError)` for invalid input, backpressure or store failure
    async fn deposit(&self, input: DepositInput) -> Result<DepositReceipt, DepositError>;

    /// [`Self::deposit`] mapped to the wire response
    async fn submit(&self, input: DepositInput) -> DepositResponse {
        DepositResponse::from(self.deposit(input).await)
    }
}

/// Create a deposit strategy based on the specified strategy type
///
/// # Arguments
///
/// * `strategy_type` - Which admission strategy to build
/// * `apply` - Atomic apply step shared by every strategy
/// * `serializer` - Admission lock (ignored by the direct strategy)
/// * `shutdown` - Cancels in-flight admissions on shutdown
///
/// # Returns
///
/// A shared trait object implementing [`DepositService`]
pub fn create_strategy(
    strategy_type: StrategyType,
    apply: IdempotentLedgerApply,
    serializer: AdmissionSerializer,
    shutdown: CancellationToken,
) -> Arc<dyn DepositService> {
    match strategy_type {
        StrategyType::Direct => Arc::new(DirectStrategy::new(apply)),
        StrategyType::Serialized => Arc::new(SerializedStrategy::new(serializer, apply, shutdown)),
    }
}
