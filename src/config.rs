//! Pipeline configuration
//!
//! Each component gets its own config struct with a `Default` and a
//! validating `new` that replaces zero values with the default and logs a
//! warning. [`PipelineConfig`] bundles them for the composition root.

use crate::cli::StrategyType;
use crate::core::transport::TransportKind;
use std::time::Duration;
use tracing::warn;

/// Consumer group shared by every reconciliation worker
pub const DEFAULT_GROUP: &str = "ledger-reconcilers";

fn non_zero_duration(field: &str, value: Duration, default: Duration) -> Duration {
    if value.is_zero() {
        warn!(
            field,
            default_ms = default.as_millis() as u64,
            "invalid zero duration, using default"
        );
        default
    } else {
        value
    }
}

fn non_zero_count(field: &str, value: usize, default: usize) -> usize {
    if value == 0 {
        warn!(field, default, "invalid zero count, using default");
        default
    } else {
        value
    }
}

/// Admission lease settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseConfig {
    /// Lease lifetime; a crashed holder blocks its key for at most this long
    pub ttl: Duration,
    /// Delay between promotion attempts while waiting
    pub poll_interval: Duration,
    /// Longest a caller waits for admission before getting Busy
    pub max_wait: Duration,
    /// Timeout of each lease script call
    pub store_timeout: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            max_wait: Duration::from_secs(3),
            store_timeout: Duration::from_secs(2),
        }
    }
}

impl LeaseConfig {
    /// Create a LeaseConfig, replacing zero values with defaults
    pub fn new(
        ttl: Duration,
        poll_interval: Duration,
        max_wait: Duration,
        store_timeout: Duration,
    ) -> Self {
        let default = Self::default();
        let ttl = non_zero_duration("lease.ttl", ttl, default.ttl);
        let mut poll_interval =
            non_zero_duration("lease.poll_interval", poll_interval, default.poll_interval);
        if poll_interval >= ttl {
            warn!(
                poll_ms = poll_interval.as_millis() as u64,
                ttl_ms = ttl.as_millis() as u64,
                "poll interval must be shorter than the lease TTL, using TTL/4"
            );
            poll_interval = ttl / 4;
        }

        Self {
            ttl,
            poll_interval,
            max_wait: non_zero_duration("lease.max_wait", max_wait, default.max_wait),
            store_timeout: non_zero_duration(
                "lease.store_timeout",
                store_timeout,
                default.store_timeout,
            ),
        }
    }
}

/// Fast-path apply settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyConfig {
    /// Timeout of the apply script call
    pub store_timeout: Duration,
    /// How long an applied token is remembered
    pub dedup_ttl: Duration,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(2),
            dedup_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl ApplyConfig {
    /// Create an ApplyConfig, replacing zero values with defaults
    pub fn new(store_timeout: Duration, dedup_ttl: Duration) -> Self {
        let default = Self::default();
        Self {
            store_timeout: non_zero_duration(
                "apply.store_timeout",
                store_timeout,
                default.store_timeout,
            ),
            dedup_ttl: non_zero_duration("apply.dedup_ttl", dedup_ttl, default.dedup_ttl),
        }
    }
}

/// Dispatch transport settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Which transport carries entries to the workers
    pub transport: TransportKind,
    /// Consumer group name (log transport)
    pub group: String,
    /// Number of log partitions (log transport)
    pub partitions: usize,
    /// Longest a blocking read waits for new entries
    pub block: Duration,
    /// Entries read per batch
    pub batch_size: usize,
    /// Idle time after which an unacknowledged delivery may be reclaimed
    pub min_idle: Duration,
    /// How often a worker reclaims stale deliveries
    pub reclaim_interval: Duration,
    /// Delete log entries once acknowledged
    pub trim_acked: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::List,
            group: DEFAULT_GROUP.to_string(),
            partitions: num_cpus::get(),
            block: Duration::from_secs(1),
            batch_size: 100,
            min_idle: Duration::from_secs(30),
            reclaim_interval: Duration::from_secs(5),
            trim_acked: false,
        }
    }
}

impl DispatchConfig {
    /// Create a DispatchConfig, replacing zero values with defaults
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: TransportKind,
        group: &str,
        partitions: usize,
        block: Duration,
        batch_size: usize,
        min_idle: Duration,
        reclaim_interval: Duration,
        trim_acked: bool,
    ) -> Self {
        let default = Self::default();
        let group = if group.trim().is_empty() {
            warn!(default = %default.group, "empty consumer group, using default");
            default.group.clone()
        } else {
            group.trim().to_string()
        };

        Self {
            transport,
            group,
            partitions: non_zero_count("dispatch.partitions", partitions, default.partitions),
            block: non_zero_duration("dispatch.block", block, default.block),
            batch_size: non_zero_count("dispatch.batch_size", batch_size, default.batch_size),
            min_idle: non_zero_duration("dispatch.min_idle", min_idle, default.min_idle),
            reclaim_interval: non_zero_duration(
                "dispatch.reclaim_interval",
                reclaim_interval,
                default.reclaim_interval,
            ),
            trim_acked,
        }
    }
}

/// Reconciliation worker pool settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Number of concurrent workers
    pub count: usize,
    /// Timeout of each durable upsert
    pub durable_timeout: Duration,
    /// Delay before the first retry of a failed entry
    pub backoff_initial: Duration,
    /// Upper bound of the retry delay
    pub backoff_max: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: num_cpus::get(),
            durable_timeout: Duration::from_secs(2),
            backoff_initial: Duration::from_millis(200),
            backoff_max: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    /// Create a WorkerConfig, replacing zero values with defaults
    pub fn new(
        count: usize,
        durable_timeout: Duration,
        backoff_initial: Duration,
        backoff_max: Duration,
    ) -> Self {
        let default = Self::default();
        let backoff_initial = non_zero_duration(
            "workers.backoff_initial",
            backoff_initial,
            default.backoff_initial,
        );
        let backoff_max = non_zero_duration("workers.backoff_max", backoff_max, default.backoff_max)
            .max(backoff_initial);

        Self {
            count: non_zero_count("workers.count", count, default.count),
            durable_timeout: non_zero_duration(
                "workers.durable_timeout",
                durable_timeout,
                default.durable_timeout,
            ),
            backoff_initial,
            backoff_max,
        }
    }

    /// Retry delay after the `attempt`-th failure (1-based), doubling up to
    /// `backoff_max`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff_initial
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

/// Complete configuration of a [`crate::pipeline::DepositPipeline`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Instance name; worker `i` consumes as `<instance>-<i>`
    pub instance: String,
    /// Admission strategy
    pub strategy: StrategyType,
    /// Lease settings
    pub lease: LeaseConfig,
    /// Apply settings
    pub apply: ApplyConfig,
    /// Transport settings
    pub dispatch: DispatchConfig,
    /// Worker pool settings
    pub workers: WorkerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            instance: "instance".to_string(),
            strategy: StrategyType::Serialized,
            lease: LeaseConfig::default(),
            apply: ApplyConfig::default(),
            dispatch: DispatchConfig::default(),
            workers: WorkerConfig::default(),
        }
    }
}
