//! Serialized deposit strategy
//!
//! Admits each deposit through the per-account FIFO lease lock before
//! applying it, then releases the lease whatever the apply outcome. Deposits
//! for one account are therefore applied one at a time, in arrival order;
//! deposits for different accounts never wait on each other.

use crate::core::{AdmissionSerializer, IdempotentLedgerApply};
use crate::strategy::DepositService;
use crate::types::{DepositError, DepositInput, DepositReceipt};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lease-then-apply strategy
#[derive(Clone)]
pub struct SerializedStrategy {
    serializer: AdmissionSerializer,
    apply: IdempotentLedgerApply,
    shutdown: CancellationToken,
}

impl SerializedStrategy {
    /// Create a SerializedStrategy
    ///
    /// # Arguments
    ///
    /// * `serializer` - Per-account admission lock
    /// * `apply` - Atomic apply step
    /// * `shutdown` - Once cancelled, waiting callers get Busy
    pub fn new(
        serializer: AdmissionSerializer,
        apply: IdempotentLedgerApply,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            serializer,
            apply,
            shutdown,
        }
    }
}

#[async_trait]
impl DepositService for SerializedStrategy {
    fn name(&self) -> &'static str {
        "serialized"
    }

    async fn deposit(&self, input: DepositInput) -> Result<DepositReceipt, DepositError> {
        let request = input.validate()?;
        let admission = self.serializer.admit(&request.account, &self.shutdown).await?;

        let result = self.apply.apply(&request).await;

        if let Err(error) = self.serializer.release(&admission).await {
            // The lease TTL frees the key if this release was lost.
            warn!(
                account = %request.account,
                request_id = %admission.request_id,
                error = %error,
                "lease release failed"
            );
        }

        match &result {
            Ok(receipt) => debug!(
                strategy = self.name(),
                account = %request.account,
                code = receipt.code.as_i64(),
                waited_ms = admission.waited.as_millis() as u64,
                "deposit processed"
            ),
            Err(error) => debug!(
                strategy = self.name(),
                account = %request.account,
                error = %error,
                "deposit failed"
            ),
        }
        result
    }
}
