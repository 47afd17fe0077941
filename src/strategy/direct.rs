//! Direct deposit strategy
//!
//! Validates and applies without an admission step. Concurrent deposits for
//! one account are serialized only by the fast store executing one apply
//! script at a time, so arrival order between concurrent callers is not
//! preserved, but each token still has at most one effect.

use crate::core::IdempotentLedgerApply;
use crate::strategy::DepositService;
use crate::types::{DepositError, DepositInput, DepositReceipt};
use async_trait::async_trait;
use tracing::debug;

/// Apply-only strategy
#[derive(Clone)]
pub struct DirectStrategy {
    apply: IdempotentLedgerApply,
}

impl DirectStrategy {
    /// Create a DirectStrategy over a shared apply step
    pub fn new(apply: IdempotentLedgerApply) -> Self {
        Self { apply }
    }
}

#[async_trait]
impl DepositService for DirectStrategy {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn deposit(&self, input: DepositInput) -> Result<DepositReceipt, DepositError> {
        let request = input.validate()?;
        let receipt = self.apply.apply(&request).await?;
        debug!(
            strategy = self.name(),
            account = %request.account,
            code = receipt.code.as_i64(),
            "deposit processed"
        );
        Ok(receipt)
    }
}
