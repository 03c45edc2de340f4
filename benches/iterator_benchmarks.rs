//! Iterator performance benchmarks: leaf scans, intersections, isa dedup.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use quiver::{
    AndIter, Budget, Direction, EngineConfig, ExecCtx, FixedIter, IsaIter, Iter, Linkage,
    LinkIter, LinkSource, MemStore, PrimId, PrimitiveSpec, PrimitiveStore, ResourceCache, Step,
};

/// A store with one link type and `n` typed links fanned over `targets`.
fn make_store(n: u64, targets: u64) -> (MemStore, quiver::Guid) {
    let mut store = MemStore::new();
    let t = store.add(PrimitiveSpec::default());
    let tg = store.guid_from_id(t).unwrap();
    let target_ids: Vec<PrimId> = (0..targets).map(|_| store.add(PrimitiveSpec::default())).collect();
    for i in 0..n {
        let right = store
            .guid_from_id(target_ids[(i % targets) as usize])
            .unwrap();
        store.add(PrimitiveSpec {
            typeguid: Some(tg),
            right: Some(right),
            ..Default::default()
        });
    }
    (store, tg)
}

fn drain(mut it: Iter, ctx: &ExecCtx<'_>) -> usize {
    let mut budget = Budget::unlimited();
    let mut n = 0;
    while let Step::Emit(_) = it.next(ctx, &mut budget) {
        n += 1;
    }
    n
}

fn bench_gmap_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("gmap_scan");
    for size in [1_000u64, 10_000, 100_000] {
        let (store, tg) = make_store(size, 16);
        let resources = ResourceCache::new(8 << 20);
        let config = EngineConfig::default();
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            let ctx = ExecCtx::new(&store, &resources, &config);
            b.iter(|| {
                let it = Iter::Link(LinkIter::new(
                    &store,
                    LinkSource::Gmap {
                        linkage: Linkage::Typeguid,
                        guid: tg,
                    },
                    0,
                    store.primitive_count(),
                    Direction::Forward,
                ));
                drain(it, &ctx)
            });
        });
    }
    group.finish();
}

fn bench_and_intersection(c: &mut Criterion) {
    let mut group = c.benchmark_group("and_intersection");
    for size in [1_000u64, 10_000] {
        let store = MemStore::new();
        let resources = ResourceCache::new(8 << 20);
        let config = EngineConfig::default();
        let evens: Vec<PrimId> = (0..size).map(|i| i * 2).collect();
        let thirds: Vec<PrimId> = (0..size).map(|i| i * 3).collect();
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            let ctx = ExecCtx::new(&store, &resources, &config);
            b.iter(|| {
                let a = Iter::Fixed(FixedIter::from_sorted_ids(
                    evens.clone(),
                    0,
                    u64::MAX >> 20,
                    Direction::Forward,
                ));
                let bsub = Iter::Fixed(FixedIter::from_sorted_ids(
                    thirds.clone(),
                    0,
                    u64::MAX >> 20,
                    Direction::Forward,
                ));
                let it = AndIter::compose(
                    vec![a, bsub],
                    0,
                    u64::MAX >> 20,
                    Direction::Forward,
                    None,
                )
                .unwrap();
                drain(it, &ctx)
            });
        });
    }
    group.finish();
}

fn bench_isa_storable(c: &mut Criterion) {
    let mut group = c.benchmark_group("isa_storable");
    for size in [1_000u64, 10_000] {
        let (store, _tg) = make_store(size, 64);
        let resources = ResourceCache::new(8 << 20);
        let mut config = EngineConfig::default();
        config.engine.isa_materialize_max_items = 0;
        let sources: Vec<PrimId> = (0..size).map(|i| 65 + i).collect();
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            let ctx = ExecCtx::new(&store, &resources, &config);
            b.iter(|| {
                let sub = Iter::Fixed(FixedIter::from_sorted_ids(
                    sources.clone(),
                    0,
                    store.primitive_count(),
                    Direction::Forward,
                ));
                let it = IsaIter::new(
                    sub,
                    Linkage::Right,
                    0,
                    store.primitive_count(),
                    Direction::Forward,
                );
                drain(it, &ctx)
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_gmap_scan,
    bench_and_intersection,
    bench_isa_storable
);
criterion_main!(benches);
