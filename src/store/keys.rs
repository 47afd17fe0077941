//! Key naming in the Shared Fast Store
//!
//! Per-account keys wrap the account in a `{...}` hash tag so every key of one
//! account lands in the same cluster slot and can be touched by one script.

use crate::types::{AccountKey, Currency};

/// Global list of ready per-account dispatch lists
pub const READY_LIST: &str = "ready:deposits";

/// Prefix shared by every per-account dispatch list
pub const DISPATCH_LIST_PREFIX: &str = "dispatch:";

/// Prefix of the partitioned dispatch log
pub const STREAM_PREFIX: &str = "stream:deposits:";

/// `balance:{<account>}:<CUR>`
pub fn balance(account: &AccountKey, currency: &Currency) -> String {
    format!("balance:{{{}}}:{}", account, currency)
}

/// `dedup:{<account>}`
pub fn dedup(account: &AccountKey) -> String {
    format!("dedup:{{{}}}", account)
}

/// `lease:{<account>}`
pub fn lease(account: &AccountKey) -> String {
    format!("lease:{{{}}}", account)
}

/// `waitqueue:{<account>}`
pub fn wait_queue(account: &AccountKey) -> String {
    format!("waitqueue:{{{}}}", account)
}

/// `dispatch:{<account>}`
pub fn dispatch_list(account: &AccountKey) -> String {
    format!("{}{{{}}}", DISPATCH_LIST_PREFIX, account)
}

/// `stream:deposits:<partition>`
pub fn stream(partition: usize) -> String {
    format!("{}{}", STREAM_PREFIX, partition)
}

/// Extract the account from a hash-tagged key such as `dispatch:{42}`
pub fn account_of(key: &str) -> Option<&str> {
    let open = key.find('{')?;
    let close = key.rfind('}')?;
    if close <= open + 1 {
        return None;
    }
    Some(&key[open + 1..close])
}
