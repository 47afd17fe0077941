//! I/O module
//!
//! Handles CSV output.
//!
//! # Components
//!
//! - `report` - Balance report combining fast and durable balances

pub mod report;

pub use report::{write_balances_csv, BalanceRow};
