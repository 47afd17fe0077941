//! Balance report output
//!
//! One CSV row per durable balance row, next to the fast-path balance of the
//! same account and currency, so drift between the two stores is visible at
//! a glance. Output is sorted for deterministic diffs.

use crate::store::ledger::minor_to_decimal;
use crate::types::{AccountKey, Currency, Network};
use rust_decimal::Decimal;
use std::io::Write;

/// One line of the balance report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceRow {
    /// Account
    pub account: AccountKey,
    /// Currency
    pub currency: Currency,
    /// Network of the durable row
    pub network: Network,
    /// Fast-path balance in minor units, summed over networks
    pub fast_minor: i64,
    /// Durable balance of this network
    pub durable: Decimal,
    /// Whether the durable balances of all networks add up to the fast balance
    pub in_sync: bool,
}

/// Write balance rows as CSV
///
/// Columns: `account,currency,network,fast,durable,in_sync`. The fast balance
/// is scaled to the currency's decimal places.
///
/// # Arguments
///
/// * `rows` - Report rows, in any order
/// * `output` - Destination writer
///
/// # Returns
///
/// * `Ok(())` once everything is flushed
/// * `Err(String)` describing the write failure
pub fn write_balances_csv(rows: &[BalanceRow], output: &mut dyn Write) -> Result<(), String> {
    use csv::Writer;

    let mut writer = Writer::from_writer(output);

    writer
        .write_record(["account", "currency", "network", "fast", "durable", "in_sync"])
        .map_err(|e| format!("Failed to write CSV header: {}", e))?;

    let mut sorted = rows.to_vec();
    sorted.sort_by(|a, b| {
        (&a.account, &a.currency, &a.network).cmp(&(&b.account, &b.currency, &b.network))
    });

    for row in sorted {
        writer
            .write_record(&[
                row.account.to_string(),
                row.currency.to_string(),
                row.network.to_string(),
                minor_to_decimal(row.fast_minor, &row.currency).to_string(),
                row.durable.to_string(),
                row.in_sync.to_string(),
            ])
            .map_err(|e| format!("Failed to write balance record: {}", e))?;
    }

    writer
        .flush()
        .map_err(|e| format!("Failed to flush output: {}", e))?;

    Ok(())
}
