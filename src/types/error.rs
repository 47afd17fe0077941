//! Error types for the deposit ledger
//!
//! This module defines the error taxonomy shared by the admission path and the
//! reconciliation path. Errors are split by who gets to see them:
//!
//! # Error Categories
//!
//! - **Caller-facing** ([`DepositError`]): validation failures, fast-store
//!   failures surfaced as retryable queue errors, admission backpressure.
//! - **Fast store** ([`StoreError`]): raw failures of the shared store. These
//!   never reach a caller directly. Outages and timeouts become
//!   [`DepositError::Queue`]; a script reply that cannot be interpreted
//!   becomes [`DepositError::Failed`].
//! - **Durable store** ([`DurableApplyError`]): handled entirely inside the
//!   reconciliation workers via retry.
//! - **Poison** ([`PoisonMessage`]): a dispatch entry that cannot be decoded.
//!   Dropped with a warning, never retried.

use thiserror::Error;

/// Failure of a Shared Fast Store operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached
    #[error("fast store unavailable during {operation}: {message}")]
    Unavailable {
        /// Operation that was attempted
        operation: String,
        /// Transport-level description
        message: String,
    },

    /// The store did not answer within the configured call timeout
    #[error("fast store timed out during {operation} after {after_ms}ms")]
    Timeout {
        /// Operation that was attempted
        operation: String,
        /// Timeout that elapsed, in milliseconds
        after_ms: u64,
    },

    /// A scripted operation returned a reply the client could not interpret
    #[error("fast store script {operation} failed: {message}")]
    Script {
        /// Script name
        operation: String,
        /// Reply or decode failure
        message: String,
    },
}

impl StoreError {
    /// Create an Unavailable error
    pub fn unavailable(operation: &str, message: impl Into<String>) -> Self {
        StoreError::Unavailable {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Create a Timeout error
    pub fn timeout(operation: &str, after_ms: u64) -> Self {
        StoreError::Timeout {
            operation: operation.to_string(),
            after_ms,
        }
    }

    /// Create a Script error
    pub fn script(operation: &str, message: impl Into<String>) -> Self {
        StoreError::Script {
            operation: operation.to_string(),
            message: message.into(),
        }
    }
}

/// Caller-facing error for a deposit request
///
/// A caller only ever sees one of these (or a successful applied/idempotent
/// outcome). Raw storage errors are folded into [`DepositError::Queue`] or
/// [`DepositError::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DepositError {
    /// Malformed, missing or non-positive input
    ///
    /// Terminal: never retried, no store is touched.
    #[error("invalid {field}: {message}")]
    Validation {
        /// Offending field
        field: String,
        /// What is wrong with it
        message: String,
    },

    /// The fast store was unavailable or timed out during admission or apply
    ///
    /// Retryable by the caller.
    #[error("queue error: {message}")]
    Queue {
        /// Description of the underlying store failure
        message: String,
    },

    /// Admission wait bound exceeded, or the service is shutting down
    ///
    /// Retryable backpressure, distinct from [`DepositError::Queue`].
    #[error("account {account} is busy after waiting {waited_ms}ms")]
    Busy {
        /// Account whose admission timed out
        account: String,
        /// How long the caller waited
        waited_ms: u64,
    },

    /// The request was well-formed but the fast store script failed, so the
    /// outcome of the mutation is unknown
    ///
    /// Not retryable with the same request.
    #[error("deposit failed: {message}")]
    Failed {
        /// Description of the failure
        message: String,
    },
}

impl From<StoreError> for DepositError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Unavailable { .. } | StoreError::Timeout { .. } => DepositError::Queue {
                message: error.to_string(),
            },
            StoreError::Script { .. } => DepositError::failed(error.to_string()),
        }
    }
}

impl DepositError {
    /// Create a Validation error
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        DepositError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Create a Busy error
    pub fn busy(account: &str, waited_ms: u64) -> Self {
        DepositError::Busy {
            account: account.to_string(),
            waited_ms,
        }
    }

    /// Create a Failed error
    pub fn failed(message: impl Into<String>) -> Self {
        DepositError::Failed {
            message: message.into(),
        }
    }

    /// Whether the caller may retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(self, DepositError::Queue { .. } | DepositError::Busy { .. })
    }
}

/// Failure of the Durable Store upsert
///
/// Never surfaced to the original caller; the worker leaves the entry
/// unacknowledged and retries it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurableApplyError {
    /// The durable store could not be reached
    #[error("durable store unavailable: {message}")]
    Unavailable {
        /// Description of the failure
        message: String,
    },

    /// The upsert did not complete within the configured timeout
    #[error("durable upsert timed out after {after_ms}ms")]
    Timeout {
        /// Timeout that elapsed, in milliseconds
        after_ms: u64,
    },

    /// The durable store refused the row
    #[error("durable store rejected {account}/{currency}: {message}")]
    Rejected {
        /// Account of the rejected row
        account: String,
        /// Currency of the rejected row
        currency: String,
        /// Reason given by the store
        message: String,
    },
}

/// A dispatch entry that cannot be processed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("poison dispatch entry ({reason}): {payload}")]
pub struct PoisonMessage {
    /// Why the entry was rejected
    pub reason: String,
    /// The offending payload, truncated for logging
    pub payload: String,
}

impl PoisonMessage {
    const MAX_PAYLOAD_CHARS: usize = 256;

    /// Create a PoisonMessage, truncating oversized payloads
    pub fn new(reason: impl Into<String>, payload: &str) -> Self {
        let payload = if payload.chars().count() > Self::MAX_PAYLOAD_CHARS {
            let mut truncated: String = payload.chars().take(Self::MAX_PAYLOAD_CHARS).collect();
            truncated.push_str("...");
            truncated
        } else {
            payload.to_string()
        };

        PoisonMessage {
            reason: reason.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::validation(
        DepositError::validation("amount", "must be positive"),
        "invalid amount: must be positive"
    )]
    #[case::queue(
        DepositError::Queue { message: "connection refused".to_string() },
        "queue error: connection refused"
    )]
    #[case::busy(DepositError::busy("42", 3000), "account 42 is busy after waiting 3000ms")]
    #[case::failed(DepositError::failed("balance overflow"), "deposit failed: balance overflow")]
    fn test_deposit_error_display(#[case] error: DepositError, #[case] expected: &str) {
        assert_eq!(error.to_string(), expected);
    }

    #[rstest]
    #[case::unavailable(
        StoreError::unavailable("apply_deposit", "connection reset"),
        "fast store unavailable during apply_deposit: connection reset"
    )]
    #[case::timeout(
        StoreError::timeout("try_promote_if_head", 2000),
        "fast store timed out during try_promote_if_head after 2000ms"
    )]
    #[case::script(
        StoreError::script("read_group", "NOGROUP"),
        "fast store script read_group failed: NOGROUP"
    )]
    fn test_store_error_display(#[case] error: StoreError, #[case] expected: &str) {
        assert_eq!(error.to_string(), expected);
    }

    #[rstest]
    #[case::validation(DepositError::validation("currency", "required"), false)]
    #[case::queue(DepositError::Queue { message: "down".to_string() }, true)]
    #[case::busy(DepositError::busy("1", 10), true)]
    #[case::failed(DepositError::failed("overflow"), false)]
    fn test_retryable(#[case] error: DepositError, #[case] expected: bool) {
        assert_eq!(error.is_retryable(), expected);
    }

    #[rstest]
    #[case::timeout(
        StoreError::timeout("apply_deposit", 5),
        DepositError::Queue {
            message: "fast store timed out during apply_deposit after 5ms".to_string()
        }
    )]
    #[case::unavailable(
        StoreError::unavailable("apply_deposit", "connection refused"),
        DepositError::Queue {
            message: "fast store unavailable during apply_deposit: connection refused".to_string()
        }
    )]
    #[case::script(
        StoreError::script("apply_deposit", "ERR unexpected reply"),
        DepositError::Failed {
            message: "fast store script apply_deposit failed: ERR unexpected reply".to_string()
        }
    )]
    fn test_store_error_conversion(#[case] error: StoreError, #[case] expected: DepositError) {
        let converted: DepositError = error.into();
        assert_eq!(converted, expected);
    }

    #[test]
    fn test_poison_message_truncates_payload() {
        let payload = "x".repeat(1000);
        let poison = PoisonMessage::new("bad json", &payload);

        assert_eq!(poison.payload.len(), 259);
        assert!(poison.payload.ends_with("..."));
        assert_eq!(poison.reason, "bad json");
    }

    #[test]
    fn test_durable_error_display() {
        let error = DurableApplyError::Rejected {
            account: "7".to_string(),
            currency: "IDR".to_string(),
            message: "numeric overflow".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "durable store rejected 7/IDR: numeric overflow"
        );
    }
}
