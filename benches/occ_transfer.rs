//! Benchmark for bank transfer blocks delivered sequentially and with OCC.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use occ_baseapp::app::types::{RequestFinalizeBlock, RequestInitChain};
use occ_baseapp::workload::{bank, Workload, WorkloadConfig};
use occ_baseapp::{AppConfig, BaseApp};

fn fresh_app(workload: &Workload, workers: usize, validation: bool) -> BaseApp {
    let config = AppConfig {
        chain_id: "bench".into(),
        concurrency_workers: workers,
        occ_enabled: workers > 1,
        access_validation: if validation {
            AppConfig::default().access_validation
        } else {
            None
        },
        ..AppConfig::default()
    };
    let mut app = bank::app_builder("bench", config, workload.config.chain_id)
        .build()
        .unwrap();
    app.init_chain(&RequestInitChain {
        chain_id: "bench".into(),
        initial_height: 1,
        app_state_bytes: serde_json::to_vec(&workload.genesis()).unwrap(),
        ..RequestInitChain::default()
    })
    .unwrap();
    app
}

fn deliver_block(app: &mut BaseApp, txs: &[Vec<u8>]) -> usize {
    let res = app
        .finalize_block(&RequestFinalizeBlock {
            height: 1,
            time: 1,
            txs: txs.to_vec(),
            ..RequestFinalizeBlock::default()
        })
        .unwrap();
    res.tx_results.iter().filter(|r| r.is_ok()).count()
}

fn workload(num_accounts: usize, num_transactions: usize, conflict_factor: f64) -> Workload {
    Workload::generate(WorkloadConfig {
        num_accounts,
        num_transactions,
        conflict_factor,
        seed: 42,
        chain_id: 1,
    })
    .unwrap()
}

/// Sequential vs OCC across conflict levels.
fn bench_conflict_levels(c: &mut Criterion) {
    let mut group = c.benchmark_group("occ_transfer/conflict_levels");
    group.sample_size(20);

    let num_transactions = 1000;
    for &conflict_factor in &[0.0, 0.25, 0.5, 0.75, 1.0] {
        let workload = workload(1000, num_transactions, conflict_factor);
        let label = format!("conflict_{:.0}%", conflict_factor * 100.0);

        group.throughput(Throughput::Elements(num_transactions as u64));
        for (name, workers) in [("sequential", 1), ("occ_8", 8)] {
            group.bench_with_input(BenchmarkId::new(name, &label), &workload, |b, workload| {
                b.iter_batched(
                    || fresh_app(workload, workers, true),
                    |mut app| deliver_block(&mut app, black_box(&workload.transactions)),
                    BatchSize::LargeInput,
                );
            });
        }
    }

    group.finish();
}

/// OCC scaling with the worker count on a low-conflict block.
fn bench_worker_counts(c: &mut Criterion) {
    let mut group = c.benchmark_group("occ_transfer/workers");
    group.sample_size(20);

    let num_transactions = 1000;
    let workload = workload(5000, num_transactions, 0.1);
    group.throughput(Throughput::Elements(num_transactions as u64));

    for &workers in &[1, 2, 4, 8, 16] {
        group.bench_with_input(BenchmarkId::new("occ", workers), &workload, |b, workload| {
            b.iter_batched(
                || fresh_app(workload, workers, true),
                |mut app| deliver_block(&mut app, black_box(&workload.transactions)),
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Cost of checking declared against observed access operations.
fn bench_access_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("occ_transfer/access_validation");
    group.sample_size(20);

    let num_transactions = 1000;
    let workload = workload(1000, num_transactions, 0.0);
    group.throughput(Throughput::Elements(num_transactions as u64));

    for (name, validation) in [("off", false), ("permissive", true)] {
        group.bench_with_input(BenchmarkId::new("occ_8", name), &workload, |b, workload| {
            b.iter_batched(
                || fresh_app(workload, 8, validation),
                |mut app| deliver_block(&mut app, black_box(&workload.transactions)),
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_conflict_levels,
    bench_worker_counts,
    bench_access_validation
);
criterion_main!(benches);
