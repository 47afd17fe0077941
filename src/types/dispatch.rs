//! Dispatch entry wire format
//!
//! A [`DispatchEntry`] is produced by the atomic apply step on the fast path
//! and consumed by the reconciliation workers. It travels through the Shared
//! Fast Store as a JSON document, so a corrupt or foreign payload surfaces as
//! a [`PoisonMessage`] at decode time instead of blocking a key forever.

use super::deposit::{AccountKey, Currency, DepositRequest, IdempotencyToken, Metadata, Network};
use super::error::PoisonMessage;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Kind of mutation described by an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    /// Balance credit
    Deposit,
}

/// An accepted deposit awaiting durable apply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchEntry {
    /// Mutation kind
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Account credited
    pub account: AccountKey,
    /// Normalized currency
    pub currency: Currency,
    /// Normalized network
    pub network: Network,
    /// Idempotency token of the originating request
    pub token: IdempotencyToken,
    /// Amount in minor units
    pub amount: i64,
    /// Metadata of the originating request
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    /// Acceptance time on the fast path, milliseconds since the Unix epoch
    pub accepted_at_ms: u64,
}

impl DispatchEntry {
    /// Build the entry describing an accepted deposit
    pub fn from_request(request: &DepositRequest) -> Self {
        DispatchEntry {
            kind: EntryKind::Deposit,
            account: request.account.clone(),
            currency: request.currency.clone(),
            network: request.network.clone(),
            token: request.token.clone(),
            amount: request.amount,
            metadata: request.metadata.clone(),
            accepted_at_ms: now_millis(),
        }
    }

    /// Encode for storage in the fast store
    pub fn encode(&self) -> String {
        // Every field serializes infallibly (strings, integers, JSON values).
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode and validate a stored payload
    ///
    /// Anything that does not describe a positive deposit for a non-blank
    /// account, currency and token is poison.
    pub fn decode(payload: &str) -> Result<Self, PoisonMessage> {
        let entry: DispatchEntry = serde_json::from_str(payload)
            .map_err(|e| PoisonMessage::new(format!("undecodable entry: {}", e), payload))?;

        if entry.amount <= 0 {
            return Err(PoisonMessage::new(
                format!("non-positive amount {}", entry.amount),
                payload,
            ));
        }
        if entry.account.as_str().trim().is_empty()
            || entry.currency.as_str().trim().is_empty()
            || entry.token.as_str().trim().is_empty()
        {
            return Err(PoisonMessage::new("blank identifier", payload));
        }

        Ok(entry)
    }
}

/// Wall-clock milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
