//! Deposit Ledger Library
//! # Overview
//!
//! This library provides a per-account deposit service: concurrent deposits
//! are admitted in order per account, applied exactly once per idempotency
//! token against a fast shared store, and reconciled asynchronously into a
//! durable ledger.
//!
//! # Architecture
//!
//! The system is organized into several key components:
//!
//! - [`types`] - Domain types and error taxonomy (AccountKey, DepositRequest, etc.)
//! - [`store`] - Shared Fast Store and Durable Store contracts with in-process implementations
//! - [`core`] - The pipeline components:
//!   - [`core::serializer`] - Per-account FIFO admission with TTL-bound leases
//!   - [`core::ledger_apply`] - Atomic idempotent balance mutation and dispatch emission
//!   - [`core::transport`] - List and partitioned-log dispatch transports
//!   - [`core::workers`] - Reconciliation into the durable ledger
//! - [`strategy`] - Interchangeable admission strategies behind [`strategy::DepositService`]
//! - [`pipeline`] - Composition root wiring everything together
//! - [`config`] - Component settings
//! - [`cli`] - CLI arguments parsing
//! - [`io`] - CSV balance report
//! - [`telemetry`] - Logging setup
//!
//! # Response Codes
//!
//! Every deposit resolves to one of:
//!
//! - **1 applied**: the balance was incremented and a dispatch entry emitted
//! - **0 idempotent**: the token was already applied; nothing changed
//! - **-1 failed**: the fast store was unreachable or timed out
//! - **-2 invalid**: malformed input or a balance overflow
//! - **-3 busy**: admission was not granted within the wait budget
//!
//! # Consistency
//!
//! The fast balance is authoritative for the request path. The durable
//! balance converges to it once every dispatch entry has been reconciled;
//! redelivered entries are absorbed by the durable token journal.

// Module declarations
pub mod cli;
pub mod config;
pub mod core;
pub mod io;
pub mod pipeline;
pub mod store;
pub mod strategy;
pub mod telemetry;
pub mod types;

pub use config::PipelineConfig;
pub use core::{AdmissionSerializer, IdempotentLedgerApply, ReconciliationWorkers};
pub use io::write_balances_csv;
pub use pipeline::{DepositPipeline, PipelineHealth};
pub use store::{DurableStore, FastStore, MemoryFastStore, MemoryLedger};
pub use types::{
    AccountKey, Currency, DepositCode, DepositError, DepositInput, DepositReceipt,
    DepositResponse, IdempotencyToken, Network,
};
