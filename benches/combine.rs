//! Hot-path throughput: allocate and combine as the instrumentation
//! framework would drive them.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tagflow::{Config, TagSystem};

fn hot_path(c: &mut Criterion) {
    let cfg = Config {
        max_producers: 2,
        block_size: 1 << 12,
        grow_threshold: 1 << 11,
        ..Config::default()
    };
    let sys = TagSystem::start(cfg);
    let mut p = sys.producer_start(0);

    c.bench_function("allocate_drop", |b| {
        let mut i = 0u32;
        b.iter(|| {
            i = (i + 1) & 0x3FF;
            black_box(p.allocate(i))
        })
    });

    c.bench_function("combine_cache_hit", |b| {
        let x = p.allocate(1);
        let y = p.allocate(2);
        let warm = p.combine(&x, &y);
        b.iter(|| black_box(p.combine(&x, &y)));
        drop((x, y, warm));
    });

    c.bench_function("combine_structural_sharing", |b| {
        let x = p.allocate(10);
        let y = p.allocate(11);
        let xy = p.combine(&x, &y);
        // Union with a subset: returns the existing handle, but misses the
        // single-entry cache every other iteration.
        b.iter(|| {
            black_box(p.combine(&xy, &x));
            black_box(p.combine(&xy, &y));
        });
        drop((x, y, xy));
    });

    p.stop();
    sys.shutdown();
}

criterion_group!(benches, hot_path);
criterion_main!(benches);
