//! Benchmark suite for comparing admission strategies and transports
//!
//! This benchmark measures the deposit path of the in-process pipeline
//! using the divan benchmarking framework.
//!
//! # Running Benchmarks
//!
//! ```bash
//! # Run all benchmarks
//! cargo bench
//! ```
//!
//! # Workloads
//!
//! - `blast`: 100 concurrent deposits with unique tokens on one account
//! - `idem`: 100 concurrent deposits sharing one token
//! - `reconcile`: `blast` followed by draining the transport into the
//!   durable ledger

use deposit_ledger::cli::StrategyType;
use deposit_ledger::config::{DispatchConfig, LeaseConfig, PipelineConfig, WorkerConfig};
use deposit_ledger::core::TransportKind;
use deposit_ledger::store::{MemoryFastStore, MemoryLedger};
use deposit_ledger::{DepositInput, DepositPipeline};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

const DEPOSITS: usize = 100;

fn main() {
    divan::main();
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("Runtime failed")
}

fn pipeline(strategy: StrategyType, transport: TransportKind) -> DepositPipeline {
    let config = PipelineConfig {
        strategy,
        lease: LeaseConfig {
            poll_interval: Duration::from_millis(1),
            max_wait: Duration::from_secs(30),
            ..LeaseConfig::default()
        },
        dispatch: DispatchConfig {
            transport,
            partitions: 4,
            block: Duration::from_millis(10),
            ..DispatchConfig::default()
        },
        workers: WorkerConfig {
            count: 4,
            ..WorkerConfig::default()
        },
        ..PipelineConfig::default()
    };
    DepositPipeline::new(
        Arc::new(MemoryFastStore::new()),
        Arc::new(MemoryLedger::new()),
        config,
    )
}

fn input(token: String) -> DepositInput {
    DepositInput {
        account: "bench".to_string(),
        currency: "IDR".to_string(),
        network: None,
        token,
        amount: 1,
        metadata: None,
    }
}

fn blast(strategy: StrategyType, transport: TransportKind) {
    let runtime = runtime();
    runtime.block_on(async {
        let pipeline = pipeline(strategy, transport);
        join_all((0..DEPOSITS).map(|i| pipeline.submit(input(format!("blast-{}", i))))).await;
    });
}

/// Benchmark direct strategy, unique tokens, list transport
#[divan::bench]
fn direct_list_blast() {
    blast(StrategyType::Direct, TransportKind::List);
}

/// Benchmark serialized strategy, unique tokens, list transport
#[divan::bench]
fn serialized_list_blast() {
    blast(StrategyType::Serialized, TransportKind::List);
}

/// Benchmark direct strategy, unique tokens, log transport
#[divan::bench]
fn direct_log_blast() {
    blast(StrategyType::Direct, TransportKind::Log);
}

/// Benchmark serialized strategy, unique tokens, log transport
#[divan::bench]
fn serialized_log_blast() {
    blast(StrategyType::Serialized, TransportKind::Log);
}

/// Benchmark serialized strategy with one shared token
#[divan::bench]
fn serialized_idem() {
    let runtime = runtime();
    runtime.block_on(async {
        let pipeline = pipeline(StrategyType::Serialized, TransportKind::List);
        join_all((0..DEPOSITS).map(|_| pipeline.submit(input("idem-x".to_string())))).await;
    });
}

/// Benchmark deposits plus full reconciliation through the list transport
#[divan::bench(sample_count = 10)]
fn reconcile_list() {
    reconcile(TransportKind::List);
}

/// Benchmark deposits plus full reconciliation through the log transport
#[divan::bench(sample_count = 10)]
fn reconcile_log() {
    reconcile(TransportKind::Log);
}

fn reconcile(transport: TransportKind) {
    let runtime = runtime();
    runtime.block_on(async {
        let pipeline = pipeline(StrategyType::Direct, transport);
        pipeline.start().await.expect("Start failed");
        join_all((0..DEPOSITS).map(|i| pipeline.submit(input(format!("r-{}", i))))).await;
        assert!(pipeline.wait_drained(Duration::from_secs(30)).await);
        pipeline.shutdown().await;
    });
}
