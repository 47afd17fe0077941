//! Core coordination components
//!
//! This module contains the four components of the deposit pipeline:
//! - `serializer` - Per-account FIFO admission lock with TTL-bound leases
//! - `ledger_apply` - Atomic idempotent balance mutation plus dispatch emission
//! - `transport` - Ordered at-least-once delivery from the fast path to workers
//! - `workers` - Reconciliation pool draining the transport into the durable ledger
//!
//! All shared state lives in the stores; these components hold only handles
//! and configuration.

pub mod ledger_apply;
pub mod serializer;
pub mod transport;
pub mod workers;

pub use ledger_apply::IdempotentLedgerApply;
pub use serializer::{Admission, AdmissionSerializer};
pub use transport::{
    create_transport, Consumer, Delivery, DeliveryHandle, DispatchTransport, ListTransport,
    LogTransport, TransportKind,
};
pub use workers::{ReconciliationWorkers, WorkerStats, WorkerStatsSnapshot};
