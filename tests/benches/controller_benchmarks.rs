//! # Chain Controller Benchmarks
//!
//! | Group | Measures |
//! |-------|----------|
//! | cc-04 block production | start, push, finalize, sign, commit |
//! | cc-04 block validation | receiving blocks from another node |
//! | cc-02 block log | appending irreversible blocks |

use cc_02_block_log::{BlockLog, BlockLogCompression};
use cc_04_controller::test_utils::{key_of, TestChain};
use cc_tests::integration::fixtures::{install_token, issue_action, sync, token_chain};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use shared_types::{PackedTransaction, TimePoint, Transaction, TransactionMetadata, TrxType};
use std::sync::Arc;
use std::time::Duration;

/// A signed `issue` whose amount makes it unique.
fn issue_trx(chain: &TestChain, amount: u64) -> Arc<TransactionMetadata> {
    let mut trx = Transaction {
        actions: vec![issue_action("alice", amount)],
        ..Default::default()
    };
    trx.header.expiration = chain.controller.head_block_time().add_micros(60_000_000).into();
    trx.set_reference_block(&chain.controller.head_block_id());
    let chain_id = chain.controller.chain_id();
    let mut packed = PackedTransaction::new(trx);
    packed.sign(&key_of("token"), &chain_id);
    TransactionMetadata::recover_keys(Arc::new(packed), &chain_id, TrxType::Input).expect("recover keys")
}

fn fill_block(chain: &mut TestChain, size: u64, counter: &mut u64) {
    chain.start();
    for _ in 0..size {
        *counter += 1;
        let trx = issue_trx(chain, *counter);
        let deadline = TimePoint::now().add_micros(10_000_000);
        let trace = chain
            .controller
            .push_transaction(trx, deadline, 0, false)
            .expect("push");
        assert!(trace.except.is_none(), "{:?}", trace.except);
    }
    chain.finish();
}

fn bench_block_production(c: &mut Criterion) {
    let mut group = c.benchmark_group("cc-04-block-production");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("empty_block", |b| {
        let mut chain = TestChain::new();
        b.iter(|| black_box(chain.produce_block()))
    });

    for size in [10u64, 50] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::new("block_with_transactions", size), &size, |b, &size| {
            let mut chain = token_chain();
            let mut counter = 0;
            b.iter(|| fill_block(&mut chain, size, &mut counter))
        });
    }
    group.finish();
}

fn bench_block_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("cc-04-block-validation");
    group.sample_size(10);

    let blocks = 20u64;
    let mut producer = token_chain();
    let mut counter = 0;
    for _ in 0..blocks {
        fill_block(&mut producer, 10, &mut counter);
    }

    group.throughput(Throughput::Elements(blocks));
    group.bench_function("sync_20_blocks", |b| {
        b.iter_batched(
            || {
                let node = TestChain::new();
                install_token(&node.engine);
                node
            },
            |mut node| {
                sync(&producer.controller, &mut node.controller).expect("sync");
                node
            },
            BatchSize::PerIteration,
        )
    });
    group.finish();
}

fn bench_block_log_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("cc-02-block-log");

    let mut producer = token_chain();
    let mut counter = 0;
    fill_block(&mut producer, 20, &mut counter);
    let block = producer.controller.head_block_state().block.clone();

    for compression in [BlockLogCompression::None, BlockLogCompression::Zstd] {
        group.bench_with_input(
            BenchmarkId::new("append", format!("{compression:?}")),
            &compression,
            |b, &compression| {
                b.iter_batched(
                    || {
                        let dir = tempfile::tempdir().expect("tempdir");
                        let mut log = BlockLog::open(dir.path(), compression).expect("open");
                        log.reset(producer.controller.chain_id(), block.block_num())
                            .expect("reset");
                        (dir, log)
                    },
                    |(dir, mut log)| {
                        black_box(log.append(&block).expect("append"));
                        dir
                    },
                    BatchSize::PerIteration,
                )
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_block_production,
    bench_block_validation,
    bench_block_log_append
);
criterion_main!(benches);
