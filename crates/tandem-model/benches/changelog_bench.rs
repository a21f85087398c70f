//! Benchmarks for change log appends and the list merge rule.
//!
//! Run with: cargo bench -p tandem-model --bench changelog_bench

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use tandem_model::{ChangeLog, IdPolicy};

fn bench_merged_adds(c: &mut Criterion) {
    let mut group = c.benchmark_group("changelog/merged_adds");

    for n in [100u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(n));
        group.bench_with_input(BenchmarkId::new("append", n), &n, |b, &n| {
            b.iter(|| {
                let mut log = ChangeLog::new(IdPolicy::default());
                let owner = log.instance("Order", "1");
                for i in 0..n {
                    let item = log.instance("Line", i.to_string());
                    log.add_to_list(owner.clone(), "Lines", [item]);
                }
                black_box(log.len())
            });
        });
    }

    group.finish();
}

fn bench_alternating(c: &mut Criterion) {
    let mut group = c.benchmark_group("changelog/alternating");

    for n in [100u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(n));
        group.bench_with_input(BenchmarkId::new("append", n), &n, |b, &n| {
            b.iter(|| {
                let mut log = ChangeLog::new(IdPolicy::default());
                let owner = log.instance("Order", "1");
                for i in 0..n {
                    let item = log.instance("Line", i.to_string());
                    if i % 2 == 0 {
                        log.add_to_list(owner.clone(), "Lines", [item]);
                    } else {
                        log.remove_from_list(owner.clone(), "Lines", [item]);
                    }
                }
                black_box(log.build())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_merged_adds, bench_alternating);
criterion_main!(benches);
