//! Throughput of the metadata cache's hot path: insert under
//! contention-free conditions and steady-state lookup.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dds_dataplane::cache::{CuckooTable, OccupancyMode};

fn bench_insert(c: &mut Criterion) {
    c.bench_function("cuckoo_insert_64k", |b| {
        b.iter(|| {
            let mut table = CuckooTable::new(1 << 14, 4, OccupancyMode::PerItem);
            for k in 0..65536u64 {
                let _ = table.insert(black_box(k), black_box(k));
            }
        })
    });
}

fn bench_lookup(c: &mut Criterion) {
    let mut table = CuckooTable::new(1 << 14, 4, OccupancyMode::PerItem);
    for k in 0..32768u64 {
        let _ = table.insert(k, k);
    }
    c.bench_function("cuckoo_lookup_hit", |b| {
        b.iter(|| {
            for k in 0..32768u64 {
                black_box(table.lookup(black_box(k)));
            }
        })
    });
}

criterion_group!(benches, bench_insert, bench_lookup);
criterion_main!(benches);
