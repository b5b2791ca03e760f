use super::get_cache;
use criterion::{criterion_group, Criterion};

/// Number of slots in the cache (every lookup evicts one of them).
const CAPACITY: usize = 30;

fn bench_miss(c: &mut Criterion) {
    let cache = get_cache(CAPACITY, 13);
    let mut block = 0;
    c.bench_function(module_path!(), |b| {
        b.iter(|| {
            // Never repeat a block, so every read loads a victim slot from the disk
            let buf = cache.read(0, block).unwrap();
            block += 1;
            buf.release();
        })
    });
}

criterion_group!(benches, bench_miss);
