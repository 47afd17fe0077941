use crate::config::{
    ApplyConfig, DispatchConfig, LeaseConfig, PipelineConfig, WorkerConfig, DEFAULT_GROUP,
};
use crate::core::TransportKind;
use clap::{Parser, ValueEnum};
use std::time::Duration;

/// Drive concurrent deposits through an in-process deposit pipeline
#[derive(Parser, Debug)]
#[command(name = "deposit-ledger")]
#[command(
    about = "Drive concurrent deposits through the admission, apply and reconciliation pipeline",
    long_about = None
)]
pub struct CliArgs {
    /// Load-generation mode
    #[arg(
        value_enum,
        value_name = "MODE",
        default_value = "blast",
        env = "DEPOSIT_MODE",
        help = "Load mode: 'blast' sends unique tokens, 'idem' repeats one token"
    )]
    pub mode: LoadMode,

    /// Number of concurrent deposits
    #[arg(
        short = 'n',
        long = "count",
        value_name = "N",
        default_value_t = 200,
        env = "DEPOSIT_COUNT"
    )]
    pub count: usize,

    /// Target account
    #[arg(long, value_name = "KEY", default_value = "load-user", env = "DEPOSIT_ACCOUNT")]
    pub account: String,

    /// Deposit currency
    #[arg(long, value_name = "CUR", default_value = "IDR", env = "DEPOSIT_CURRENCY")]
    pub currency: String,

    /// Deposit network (default: NATIVE)
    #[arg(long, value_name = "NET", env = "DEPOSIT_NETWORK")]
    pub network: Option<String>,

    /// Amount of each deposit in minor units
    #[arg(long, value_name = "MINOR", default_value_t = 1, env = "DEPOSIT_AMOUNT")]
    pub amount: i64,

    /// Shared token in idem mode (default: a fresh token per run)
    #[arg(long, value_name = "TOKEN", env = "DEPOSIT_TOKEN")]
    pub token: Option<String>,

    /// Admission strategy
    #[arg(
        long = "strategy",
        value_name = "STRATEGY",
        default_value = "serialized",
        env = "DEPOSIT_STRATEGY",
        help = "Admission strategy: 'serialized' leases each account, 'direct' applies immediately"
    )]
    pub strategy: StrategyType,

    /// Dispatch transport
    #[arg(
        long = "transport",
        value_name = "TRANSPORT",
        default_value = "list",
        env = "DEPOSIT_TRANSPORT",
        help = "Dispatch transport: 'list' per-account lists or 'log' partitioned log"
    )]
    pub transport: TransportKind,

    /// Consumer name prefix
    #[arg(long, value_name = "NAME", default_value = "loadgen", env = "DEPOSIT_INSTANCE")]
    pub instance: String,

    /// Number of reconciliation workers
    #[arg(
        long = "workers",
        value_name = "COUNT",
        env = "DEPOSIT_WORKERS",
        help = "Number of reconciliation workers (default: CPU cores)"
    )]
    pub workers: Option<usize>,

    /// Number of log partitions
    #[arg(
        long = "partitions",
        value_name = "COUNT",
        env = "DEPOSIT_PARTITIONS",
        help = "Number of log partitions (default: worker count)"
    )]
    pub partitions: Option<usize>,

    /// Lease lifetime in milliseconds
    #[arg(long, value_name = "MS", env = "DEPOSIT_LEASE_TTL_MS")]
    pub lease_ttl_ms: Option<u64>,

    /// Delay between admission attempts in milliseconds
    #[arg(long, value_name = "MS", env = "DEPOSIT_POLL_MS")]
    pub poll_ms: Option<u64>,

    /// Longest admission wait before Busy, in milliseconds
    #[arg(long, value_name = "MS", env = "DEPOSIT_MAX_WAIT_MS")]
    pub max_wait_ms: Option<u64>,

    /// Timeout of each fast-store call in milliseconds
    #[arg(long, value_name = "MS", env = "DEPOSIT_STORE_TIMEOUT_MS")]
    pub store_timeout_ms: Option<u64>,

    /// Timeout of each durable upsert in milliseconds
    #[arg(long, value_name = "MS", env = "DEPOSIT_DURABLE_TIMEOUT_MS")]
    pub durable_timeout_ms: Option<u64>,

    /// Dedup retention in seconds
    #[arg(long, value_name = "SECS", env = "DEPOSIT_DEDUP_TTL_SECS")]
    pub dedup_ttl_secs: Option<u64>,

    /// Longest blocking read of a worker, in milliseconds
    #[arg(long, value_name = "MS", env = "DEPOSIT_BLOCK_MS")]
    pub block_ms: Option<u64>,

    /// Maximum entries per read
    #[arg(long, value_name = "SIZE", env = "DEPOSIT_BATCH_SIZE")]
    pub batch_size: Option<usize>,

    /// Idle time before an unacknowledged entry is reclaimed, in milliseconds
    #[arg(long, value_name = "MS", env = "DEPOSIT_MIN_IDLE_MS")]
    pub min_idle_ms: Option<u64>,

    /// Interval between reclaim passes, in milliseconds
    #[arg(long, value_name = "MS", env = "DEPOSIT_RECLAIM_MS")]
    pub reclaim_ms: Option<u64>,

    /// Delete log entries once acknowledged
    #[arg(long, env = "DEPOSIT_TRIM_ACKED")]
    pub trim_acked: bool,

    /// Longest wait for reconciliation to drain, in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 10_000, env = "DEPOSIT_DRAIN_TIMEOUT_MS")]
    pub drain_timeout_ms: u64,

    /// Emit logs as JSON
    #[arg(long, env = "DEPOSIT_JSON_LOGS")]
    pub json_logs: bool,

    /// Postgres connection string for the durable store (default: in-process ledger)
    #[cfg(feature = "postgres")]
    #[arg(long, value_name = "URL", env = "DATABASE_URL")]
    pub database_url: Option<String>,
}

/// Available admission strategies
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StrategyType {
    Direct,
    Serialized,
}

/// Load-generation modes
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LoadMode {
    /// Every deposit carries a unique token
    Blast,
    /// Every deposit carries the same token
    Idem,
}

fn millis(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

impl CliArgs {
    /// Create a PipelineConfig from CLI arguments
    ///
    /// Every option left unset falls back to the component default. Zero
    /// values are replaced with defaults by the component constructors,
    /// which log a warning for each.
    ///
    /// # Returns
    ///
    /// A `PipelineConfig` with values from CLI arguments or defaults.
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        let lease = LeaseConfig::default();
        let apply = ApplyConfig::default();
        let dispatch = DispatchConfig::default();
        let workers = WorkerConfig::default();

        let store_timeout = millis(self.store_timeout_ms, lease.store_timeout);
        let worker_count = self.workers.unwrap_or(workers.count);

        PipelineConfig {
            instance: self.instance.clone(),
            strategy: self.strategy,
            lease: LeaseConfig::new(
                millis(self.lease_ttl_ms, lease.ttl),
                millis(self.poll_ms, lease.poll_interval),
                millis(self.max_wait_ms, lease.max_wait),
                store_timeout,
            ),
            apply: ApplyConfig::new(
                store_timeout,
                self.dedup_ttl_secs
                    .map(Duration::from_secs)
                    .unwrap_or(apply.dedup_ttl),
            ),
            dispatch: DispatchConfig::new(
                self.transport,
                DEFAULT_GROUP,
                self.partitions.unwrap_or(worker_count),
                millis(self.block_ms, dispatch.block),
                self.batch_size.unwrap_or(dispatch.batch_size),
                millis(self.min_idle_ms, dispatch.min_idle),
                millis(self.reclaim_ms, dispatch.reclaim_interval),
                self.trim_acked,
            ),
            workers: WorkerConfig::new(
                worker_count,
                millis(self.durable_timeout_ms, workers.durable_timeout),
                workers.backoff_initial,
                workers.backoff_max,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::default_mode(&["program"], LoadMode::Blast)]
    #[case::explicit_blast(&["program", "blast"], LoadMode::Blast)]
    #[case::explicit_idem(&["program", "idem"], LoadMode::Idem)]
    fn test_mode_parsing(#[case] args: &[&str], #[case] expected: LoadMode) {
        let parsed = CliArgs::try_parse_from(args).unwrap();
        assert_eq!(parsed.mode, expected);
    }

    #[rstest]
    #[case::default_strategy(&["program"], StrategyType::Serialized)]
    #[case::explicit_direct(&["program", "--strategy", "direct"], StrategyType::Direct)]
    #[case::explicit_serialized(&["program", "--strategy", "serialized"], StrategyType::Serialized)]
    fn test_strategy_parsing(#[case] args: &[&str], #[case] expected: StrategyType) {
        let parsed = CliArgs::try_parse_from(args).unwrap();
        assert_eq!(parsed.strategy, expected);
    }

    #[rstest]
    #[case::default_transport(&["program"], TransportKind::List)]
    #[case::log(&["program", "--transport", "log"], TransportKind::Log)]
    fn test_transport_parsing(#[case] args: &[&str], #[case] expected: TransportKind) {
        let parsed = CliArgs::try_parse_from(args).unwrap();
        assert_eq!(parsed.transport, expected);
    }

    #[rstest]
    #[case::defaults(&["program"], 200, "load-user", 1)]
    #[case::short_count(&["program", "-n", "50"], 50, "load-user", 1)]
    #[case::all_options(
        &["program", "idem", "--count", "7", "--account", "U", "--amount", "25"],
        7,
        "U",
        25
    )]
    fn test_load_options(
        #[case] args: &[&str],
        #[case] count: usize,
        #[case] account: &str,
        #[case] amount: i64,
    ) {
        let parsed = CliArgs::try_parse_from(args).unwrap();
        assert_eq!(parsed.count, count);
        assert_eq!(parsed.account, account);
        assert_eq!(parsed.amount, amount);
        assert_eq!(parsed.currency, "IDR");
        assert_eq!(parsed.network, None);
    }

    #[test]
    fn test_pipeline_config_defaults() {
        let parsed = CliArgs::try_parse_from(["program"]).unwrap();
        let config = parsed.to_pipeline_config();

        assert_eq!(config.instance, "loadgen");
        assert_eq!(config.strategy, StrategyType::Serialized);
        assert_eq!(config.lease, LeaseConfig::default());
        assert_eq!(config.apply, ApplyConfig::default());
        assert_eq!(config.workers, WorkerConfig::default());
        assert_eq!(config.dispatch.transport, TransportKind::List);
        assert_eq!(config.dispatch.partitions, num_cpus::get());
        assert_eq!(config.dispatch.group, DEFAULT_GROUP);
    }

    #[test]
    fn test_pipeline_config_custom_values() {
        let parsed = CliArgs::try_parse_from([
            "program",
            "--transport",
            "log",
            "--workers",
            "3",
            "--lease-ttl-ms",
            "300",
            "--poll-ms",
            "5",
            "--max-wait-ms",
            "1000",
            "--store-timeout-ms",
            "250",
            "--dedup-ttl-secs",
            "60",
            "--batch-size",
            "10",
            "--trim-acked",
        ])
        .unwrap();
        let config = parsed.to_pipeline_config();

        assert_eq!(config.lease.ttl, Duration::from_millis(300));
        assert_eq!(config.lease.poll_interval, Duration::from_millis(5));
        assert_eq!(config.lease.max_wait, Duration::from_secs(1));
        assert_eq!(config.lease.store_timeout, Duration::from_millis(250));
        assert_eq!(config.apply.store_timeout, Duration::from_millis(250));
        assert_eq!(config.apply.dedup_ttl, Duration::from_secs(60));
        assert_eq!(config.workers.count, 3);
        assert_eq!(config.dispatch.partitions, 3);
        assert_eq!(config.dispatch.batch_size, 10);
        assert!(config.dispatch.trim_acked);
    }

    // Zero values should fall back to defaults
    #[rstest]
    #[case::zero_workers(&["program", "--workers", "0"], "workers", num_cpus::get())]
    #[case::zero_batch_size(&["program", "--batch-size", "0"], "batch_size", 100)]
    #[case::zero_partitions(&["program", "--partitions", "0"], "partitions", num_cpus::get())]
    fn test_pipeline_config_zero_values_fallback(
        #[case] args: &[&str],
        #[case] field: &str,
        #[case] expected_default: usize,
    ) {
        let parsed = CliArgs::try_parse_from(args).unwrap();
        let config = parsed.to_pipeline_config();

        match field {
            "workers" => assert_eq!(config.workers.count, expected_default),
            "batch_size" => assert_eq!(config.dispatch.batch_size, expected_default),
            "partitions" => assert_eq!(config.dispatch.partitions, expected_default),
            _ => panic!("Unknown field: {}", field),
        }
    }

    #[rstest]
    #[case::invalid_mode(&["program", "flood"])]
    #[case::invalid_strategy(&["program", "--strategy", "invalid"])]
    #[case::invalid_transport(&["program", "--transport", "pubsub"])]
    #[case::invalid_count(&["program", "-n", "many"])]
    fn test_parsing_errors(#[case] args: &[&str]) {
        let result = CliArgs::try_parse_from(args);
        assert!(result.is_err());
    }
}
