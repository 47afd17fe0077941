//! Deposit request and response types
//!
//! A deposit enters as a loosely-typed [`DepositInput`] (as decoded from the
//! request transport) and is validated into a [`DepositRequest`] before any
//! store is touched. The outcome of a deposit is reported back as a
//! [`DepositResponse`] carrying one of the [`DepositCode`] values.

use super::error::DepositError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Network used when neither the request nor its metadata names one
pub const DEFAULT_NETWORK: &str = "NATIVE";

/// Longest accepted currency or network code
const MAX_CODE_LEN: usize = 10;

/// Free-form deposit metadata, carried through to the dispatch entry
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Account/partition identifier
///
/// All ordering and mutual exclusion guarantees are scoped per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountKey(String);

impl AccountKey {
    /// Create an account key, rejecting blank identifiers and identifiers
    /// containing the hash-tag delimiters used in store key names
    pub fn parse(raw: &str) -> Result<Self, DepositError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DepositError::validation("account", "required"));
        }
        if trimmed.contains(|c: char| c == '{' || c == '}') {
            return Err(DepositError::validation(
                "account",
                format!("'{}' contains a reserved character", trimmed),
            ));
        }
        Ok(AccountKey(trimmed.to_string()))
    }

    /// The raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Upper-case normalized currency code
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    /// Normalize and validate a currency code
    pub fn parse(raw: &str) -> Result<Self, DepositError> {
        normalize_code("currency", raw).map(Currency)
    }

    /// The normalized code
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Upper-case normalized network code (part of the durable row key)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Network(String);

impl Network {
    /// Normalize and validate a network code
    pub fn parse(raw: &str) -> Result<Self, DepositError> {
        normalize_code("network", raw).map(Network)
    }

    /// The normalized code
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Network {
    fn default() -> Self {
        Network(DEFAULT_NETWORK.to_string())
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-supplied idempotency token
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    /// Validate a token (any non-blank string)
    pub fn parse(raw: &str) -> Result<Self, DepositError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DepositError::validation("token", "required"));
        }
        Ok(IdempotencyToken(trimmed.to_string()))
    }

    /// The raw token
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize_code(field: &str, raw: &str) -> Result<String, DepositError> {
    let code = raw.trim().to_ascii_uppercase();
    if code.is_empty() {
        return Err(DepositError::validation(field, "required"));
    }
    if code.len() > MAX_CODE_LEN || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(DepositError::validation(
            field,
            format!("'{}' is not a valid code", raw.trim()),
        ));
    }
    Ok(code)
}

/// Raw deposit request as received from the request transport
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DepositInput {
    /// Account identifier
    pub account: String,
    /// Currency code, any case
    pub currency: String,
    /// Optional network code; falls back to `metadata.network`
    #[serde(default)]
    pub network: Option<String>,
    /// Idempotency token
    pub token: String,
    /// Amount in minor units (IDR: 1 rupiah, USD: 1 cent, BTC: 1 sat)
    pub amount: i64,
    /// Optional free-form metadata
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl DepositInput {
    /// Validate the input into a [`DepositRequest`]
    ///
    /// Rejects a missing required field or a non-positive amount without
    /// touching any store.
    pub fn validate(self) -> Result<DepositRequest, DepositError> {
        let account = AccountKey::parse(&self.account)?;
        let currency = Currency::parse(&self.currency)?;
        let token = IdempotencyToken::parse(&self.token)?;

        if self.amount <= 0 {
            return Err(DepositError::validation(
                "amount",
                format!("must be a positive integer, got {}", self.amount),
            ));
        }

        let metadata = self.metadata.unwrap_or_default();
        let network = match self.network.as_deref().filter(|n| !n.trim().is_empty()) {
            Some(explicit) => Network::parse(explicit)?,
            None => match metadata.get("network").and_then(|v| v.as_str()) {
                Some(from_meta) if !from_meta.trim().is_empty() => Network::parse(from_meta)?,
                _ => Network::default(),
            },
        };

        Ok(DepositRequest {
            account,
            currency,
            network,
            token,
            amount: self.amount,
            metadata,
        })
    }
}

/// Validated deposit request
///
/// Fields are public so the apply path can still be exercised with a
/// non-positive amount; [`crate::core::IdempotentLedgerApply`] re-checks it.
#[derive(Debug, Clone, PartialEq)]
pub struct DepositRequest {
    /// Account the deposit is credited to
    pub account: AccountKey,
    /// Normalized currency
    pub currency: Currency,
    /// Normalized network
    pub network: Network,
    /// Idempotency token
    pub token: IdempotencyToken,
    /// Amount in minor units
    pub amount: i64,
    /// Metadata carried to the durable path
    pub metadata: Metadata,
}

/// Numeric response code of the deposit contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum DepositCode {
    /// The deposit mutated the balance
    Applied,
    /// The token was already applied; nothing changed
    Idempotent,
    /// The store failed or rejected the mutation
    Failed,
    /// The request was rejected before touching any store
    Invalid,
    /// Admission backpressure; retry later
    Busy,
}

impl DepositCode {
    /// Wire value of the code
    pub fn as_i64(self) -> i64 {
        match self {
            DepositCode::Applied => 1,
            DepositCode::Idempotent => 0,
            DepositCode::Failed => -1,
            DepositCode::Invalid => -2,
            DepositCode::Busy => -3,
        }
    }
}

impl From<DepositCode> for i64 {
    fn from(code: DepositCode) -> Self {
        code.as_i64()
    }
}

impl TryFrom<i64> for DepositCode {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(DepositCode::Applied),
            0 => Ok(DepositCode::Idempotent),
            -1 => Ok(DepositCode::Failed),
            -2 => Ok(DepositCode::Invalid),
            -3 => Ok(DepositCode::Busy),
            other => Err(format!("unknown deposit code {}", other)),
        }
    }
}

/// Successful (non-error) result of a deposit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositReceipt {
    /// Applied or Idempotent
    pub code: DepositCode,
    /// Fast-path balance after the call, in minor units
    pub balance: i64,
    /// Normalized currency
    pub currency: Currency,
    /// Normalized network
    pub network: Network,
}

impl DepositReceipt {
    /// Whether this call mutated the balance
    pub fn applied(&self) -> bool {
        self.code == DepositCode::Applied
    }
}

/// Deposit contract response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositResponse {
    /// Outcome code
    pub code: DepositCode,
    /// Human-readable message
    pub message: String,
    /// Whether the balance was mutated by this call
    pub applied: bool,
    /// Fast-path balance in minor units, when known
    pub balance: Option<i64>,
}

impl From<Result<DepositReceipt, DepositError>> for DepositResponse {
    fn from(result: Result<DepositReceipt, DepositError>) -> Self {
        match result {
            Ok(receipt) => DepositResponse {
                code: receipt.code,
                message: match receipt.code {
                    DepositCode::Applied => "deposit applied".to_string(),
                    _ => "deposit already applied".to_string(),
                },
                applied: receipt.applied(),
                balance: Some(receipt.balance),
            },
            Err(error) => {
                let code = match error {
                    DepositError::Validation { .. } => DepositCode::Invalid,
                    DepositError::Busy { .. } => DepositCode::Busy,
                    DepositError::Queue { .. } | DepositError::Failed { .. } => DepositCode::Failed,
                };
                DepositResponse {
                    code,
                    message: error.to_string(),
                    applied: false,
                    balance: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn input() -> DepositInput {
        DepositInput {
            account: "1".to_string(),
            currency: "idr".to_string(),
            network: None,
            token: "tx-1".to_string(),
            amount: 100,
            metadata: None,
        }
    }

    #[test]
    fn test_validate_normalizes_currency_and_defaults_network() {
        let request = input().validate().unwrap();

        assert_eq!(request.account.as_str(), "1");
        assert_eq!(request.currency.as_str(), "IDR");
        assert_eq!(request.network.as_str(), DEFAULT_NETWORK);
        assert_eq!(request.amount, 100);
    }

    #[rstest]
    #[case::explicit(Some("erc20"), None, "ERC20")]
    #[case::from_metadata(None, Some("trc20"), "TRC20")]
    #[case::explicit_wins(Some("bep20"), Some("trc20"), "BEP20")]
    #[case::blank_explicit_uses_metadata(Some("  "), Some("sol"), "SOL")]
    #[case::default(None, None, "NATIVE")]
    fn test_network_resolution(
        #[case] explicit: Option<&str>,
        #[case] meta: Option<&str>,
        #[case] expected: &str,
    ) {
        let mut raw = input();
        raw.network = explicit.map(str::to_string);
        raw.metadata = meta.map(|m| {
            json!({ "network": m })
                .as_object()
                .cloned()
                .unwrap_or_default()
        });

        let request = raw.validate().unwrap();
        assert_eq!(request.network.as_str(), expected);
    }

    #[rstest]
    #[case::missing_account(DepositInput { account: " ".into(), ..input() }, "account")]
    #[case::reserved_account(DepositInput { account: "a{b}".into(), ..input() }, "account")]
    #[case::missing_currency(DepositInput { currency: "".into(), ..input() }, "currency")]
    #[case::bad_currency(DepositInput { currency: "US-D".into(), ..input() }, "currency")]
    #[case::long_currency(DepositInput { currency: "ABCDEFGHIJK".into(), ..input() }, "currency")]
    #[case::missing_token(DepositInput { token: "".into(), ..input() }, "token")]
    #[case::zero_amount(DepositInput { amount: 0, ..input() }, "amount")]
    #[case::negative_amount(DepositInput { amount: -5, ..input() }, "amount")]
    fn test_validate_rejects(#[case] raw: DepositInput, #[case] field: &str) {
        match raw.validate() {
            Err(DepositError::Validation { field: actual, .. }) => assert_eq!(actual, field),
            other => panic!("expected validation error on {}, got {:?}", field, other),
        }
    }

    #[rstest]
    #[case(DepositCode::Applied, 1)]
    #[case(DepositCode::Idempotent, 0)]
    #[case(DepositCode::Failed, -1)]
    #[case(DepositCode::Invalid, -2)]
    #[case(DepositCode::Busy, -3)]
    fn test_code_wire_values(#[case] code: DepositCode, #[case] wire: i64) {
        assert_eq!(code.as_i64(), wire);
        assert_eq!(DepositCode::try_from(wire), Ok(code));
    }

    #[rstest]
    #[case::validation(DepositError::validation("amount", "must be positive"), DepositCode::Invalid)]
    #[case::busy(DepositError::busy("1", 3000), DepositCode::Busy)]
    #[case::queue(DepositError::Queue { message: "down".into() }, DepositCode::Failed)]
    #[case::failed(DepositError::failed("overflow"), DepositCode::Failed)]
    fn test_response_from_error(#[case] error: DepositError, #[case] expected: DepositCode) {
        let response = DepositResponse::from(Err(error));
        assert_eq!(response.code, expected);
        assert!(!response.applied);
        assert_eq!(response.balance, None);
    }

    #[test]
    fn test_response_from_receipt() {
        let receipt = DepositReceipt {
            code: DepositCode::Applied,
            balance: 250,
            currency: Currency::parse("IDR").unwrap(),
            network: Network::default(),
        };

        let response = DepositResponse::from(Ok(receipt));
        assert_eq!(response.code, DepositCode::Applied);
        assert!(response.applied);
        assert_eq!(response.balance, Some(250));
    }

    #[test]
    fn test_input_deserializes_from_json() {
        let raw: DepositInput = serde_json::from_value(json!({
            "account": "9",
            "currency": "usd",
            "token": "abc",
            "amount": 1250,
            "metadata": { "source": "bank" }
        }))
        .unwrap();

        let request = raw.validate().unwrap();
        assert_eq!(request.currency.as_str(), "USD");
        assert_eq!(request.metadata.get("source"), Some(&json!("bank")));
    }
}
