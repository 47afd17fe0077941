//! Types module
//!
//! Contains core data structures used throughout the crate.
//! This module organizes types into logical submodules:
//! - `deposit`: Deposit request/response types and identifiers
//! - `dispatch`: Dispatch entry wire format
//! - `error`: Error taxonomy

pub mod deposit;
pub mod dispatch;
pub mod error;

pub use deposit::{
    AccountKey, Currency, DepositCode, DepositInput, DepositReceipt, DepositRequest,
    DepositResponse, IdempotencyToken, Metadata, Network, DEFAULT_NETWORK,
};
pub use dispatch::{DispatchEntry, EntryKind};
pub use error::{DepositError, DurableApplyError, PoisonMessage, StoreError};
