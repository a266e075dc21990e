//! CLI driving the demo bank chain through the ABCI surface.
//!
//! Every workload is run twice, once with the sequential executor and once
//! with the OCC executor, and the two app hashes must agree.

use clap::Parser;
use eyre::ensure;
use occ_baseapp::app::types::{RequestFinalizeBlock, RequestInitChain};
use occ_baseapp::workload::{bank, Workload, WorkloadConfig};
use occ_baseapp::AppConfig;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "occ-baseapp", about = "Run transfer blocks sequentially and with OCC")]
struct Args {
    /// Number of funded accounts.
    #[arg(long, default_value_t = 1000)]
    accounts: usize,

    /// Transactions per workload.
    #[arg(long, default_value_t = 1000)]
    transactions: usize,

    /// Transactions per block.
    #[arg(long, default_value_t = 250)]
    block_size: usize,

    /// Conflict factors to run, comma separated.
    #[arg(long, value_delimiter = ',', default_values_t = vec![0.0, 0.25, 0.5, 0.75, 1.0])]
    conflicts: Vec<f64>,

    /// OCC worker threads.
    #[arg(long, default_value_t = 8)]
    workers: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Disable access-operation validation.
    #[arg(long)]
    no_validation: bool,
}

struct RunSummary {
    app_hash: [u8; 32],
    successful: usize,
    elapsed: Duration,
}

fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    println!(
        "Configuration: {} accounts, {} transactions, {} per block, {} workers\n",
        args.accounts, args.transactions, args.block_size, args.workers
    );

    for &conflict_factor in &args.conflicts {
        let workload = Workload::generate(WorkloadConfig {
            num_accounts: args.accounts,
            num_transactions: args.transactions,
            conflict_factor,
            seed: args.seed,
            chain_id: 1,
        })?;

        let sequential = run_chain(&workload, &args, 1)?;
        let occ = run_chain(&workload, &args, args.workers)?;
        ensure!(
            sequential.app_hash == occ.app_hash,
            "app hash mismatch at conflict factor {conflict_factor}: sequential {} occ {}",
            hex::encode(sequential.app_hash),
            hex::encode(occ.app_hash)
        );
        ensure!(
            sequential.successful == occ.successful,
            "successful transaction count differs: {} vs {}",
            sequential.successful,
            occ.successful
        );

        println!(
            "{:>5.0}% conflicts | {:5} successful | seq {:8.2} ms | occ {:8.2} ms | {:5.2}x | {}",
            conflict_factor * 100.0,
            occ.successful,
            sequential.elapsed.as_secs_f64() * 1000.0,
            occ.elapsed.as_secs_f64() * 1000.0,
            sequential.elapsed.as_secs_f64() / occ.elapsed.as_secs_f64().max(f64::EPSILON),
            &hex::encode(occ.app_hash)[..16],
        );
    }
    Ok(())
}

fn run_chain(workload: &Workload, args: &Args, workers: usize) -> eyre::Result<RunSummary> {
    let config = AppConfig {
        chain_id: "occ-demo".into(),
        concurrency_workers: workers,
        occ_enabled: workers > 1,
        access_validation: if args.no_validation {
            None
        } else {
            AppConfig::default().access_validation
        },
        ..AppConfig::default()
    };
    let mut app = bank::app_builder("occ-demo", config, workload.config.chain_id).build()?;
    app.init_chain(&RequestInitChain {
        chain_id: "occ-demo".into(),
        initial_height: 1,
        app_state_bytes: serde_json::to_vec(&workload.genesis())?,
        ..RequestInitChain::default()
    })?;

    let mut successful = 0;
    let mut elapsed = Duration::ZERO;
    for (i, block) in workload.blocks(args.block_size).enumerate() {
        let height = i as i64 + 1;
        let start = Instant::now();
        let res = app.finalize_block(&RequestFinalizeBlock {
            height,
            time: height as u64,
            txs: block.to_vec(),
            ..RequestFinalizeBlock::default()
        })?;
        app.commit()?;
        elapsed += start.elapsed();
        successful += res.tx_results.iter().filter(|r| r.is_ok()).count();
    }
    app.close();

    Ok(RunSummary {
        app_hash: app.last_commit_id().hash,
        successful,
        elapsed,
    })
}
