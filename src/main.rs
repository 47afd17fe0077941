//! Deposit Ledger CLI
//!
//! Load generator for the deposit pipeline. Fires N concurrent deposits at an
//! in-process pipeline, waits for reconciliation to drain and writes the
//! resulting balances to stdout.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- blast -n 200 > balances.csv
//! cargo run -- idem -n 50 --token idem-x > balances.csv
//! cargo run -- blast --strategy direct --transport log --workers 4 > balances.csv
//! ```
//!
//! # Modes
//!
//! - **blast**: every deposit carries a unique token; all should be applied
//! - **idem**: every deposit carries the same token; exactly one is applied
//!
//! # Exit Codes
//!
//! - 0: Success
//! - 1: Error (runtime setup, pipeline start, report write, etc.)

use deposit_ledger::cli::{self, CliArgs, LoadMode};
use deposit_ledger::io::write_balances_csv;
use deposit_ledger::config::PipelineConfig;
use deposit_ledger::store::{DurableStore, MemoryFastStore, MemoryLedger};
use deposit_ledger::telemetry;
use deposit_ledger::{DepositCode, DepositInput, DepositPipeline};
use futures::future::join_all;
use std::collections::HashMap;
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

fn main() {
    let args = cli::parse_args();

    if let Err(e) = telemetry::init_logging(args.json_logs) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: Failed to start runtime: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(args)) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(args: CliArgs) -> Result<(), String> {
    let config = args.to_pipeline_config();
    let durable = durable_store(&args, &config).await?;
    let pipeline = DepositPipeline::new(Arc::new(MemoryFastStore::new()), durable, config);
    pipeline
        .start()
        .await
        .map_err(|e| format!("Failed to start pipeline: {}", e))?;

    let shared_token = args
        .token
        .clone()
        .unwrap_or_else(|| format!("idem-{}", Uuid::new_v4()));
    let inputs = (0..args.count).map(|_| DepositInput {
        account: args.account.clone(),
        currency: args.currency.clone(),
        network: args.network.clone(),
        token: match args.mode {
            LoadMode::Blast => format!("blast-{}", Uuid::new_v4()),
            LoadMode::Idem => shared_token.clone(),
        },
        amount: args.amount,
        metadata: None,
    });

    let started = Instant::now();
    let responses = join_all(inputs.map(|input| pipeline.submit(input))).await;
    let elapsed = started.elapsed();

    let mut counts: HashMap<DepositCode, usize> = HashMap::new();
    for response in &responses {
        *counts.entry(response.code).or_default() += 1;
    }
    let count = |code: DepositCode| counts.get(&code).copied().unwrap_or_default();
    info!(
        mode = ?args.mode,
        strategy = pipeline.strategy_name(),
        transport = %pipeline.config().dispatch.transport,
        total = responses.len(),
        applied = count(DepositCode::Applied),
        idempotent = count(DepositCode::Idempotent),
        busy = count(DepositCode::Busy),
        failed = count(DepositCode::Failed),
        invalid = count(DepositCode::Invalid),
        elapsed_ms = elapsed.as_millis() as u64,
        "load finished"
    );

    if !pipeline
        .wait_drained(Duration::from_millis(args.drain_timeout_ms))
        .await
    {
        warn!(
            backlog = ?pipeline.backlog().await.ok(),
            "reconciliation did not drain in time"
        );
    }
    pipeline.shutdown().await;

    let stats = pipeline.stats();
    info!(
        reconciled = stats.applied,
        duplicates = stats.duplicates,
        retried = stats.retried,
        poisoned = stats.poisoned,
        "reconciliation finished"
    );

    let report = pipeline.balance_report().await?;
    let mut output = std::io::stdout();
    write_balances_csv(&report, &mut output)
}

/// Durable store whose journal retention matches the fast-path dedup TTL
#[cfg(not(feature = "postgres"))]
async fn durable_store(
    _args: &CliArgs,
    config: &PipelineConfig,
) -> Result<Arc<dyn DurableStore>, String> {
    Ok(Arc::new(MemoryLedger::with_retention(config.apply.dedup_ttl)))
}

/// Durable store whose journal retention matches the fast-path dedup TTL
#[cfg(feature = "postgres")]
async fn durable_store(
    args: &CliArgs,
    config: &PipelineConfig,
) -> Result<Arc<dyn DurableStore>, String> {
    use deposit_ledger::store::postgres::PgLedger;

    let Some(url) = args.database_url.as_deref() else {
        return Ok(Arc::new(MemoryLedger::with_retention(config.apply.dedup_ttl)));
    };
    let pool_size = u32::try_from(config.workers.count).unwrap_or(u32::MAX);
    let ledger = PgLedger::connect(url, pool_size, config.apply.dedup_ttl)
        .await
        .map_err(|e| format!("Failed to connect durable store: {}", e))?;
    ledger
        .migrate()
        .await
        .map_err(|e| format!("Failed to prepare durable store: {}", e))?;
    let purged = ledger
        .purge_journal()
        .await
        .map_err(|e| format!("Failed to purge durable journal: {}", e))?;
    info!(purged, "durable store ready");
    Ok(Arc::new(ledger))
}
