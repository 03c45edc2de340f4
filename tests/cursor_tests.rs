//! Freeze/thaw integration: cursors across round trips and lost state.

use quiver::{
    freeze_cursor, thaw, AndIter, Budget, Direction, EngineConfig, ExecCtx, FixedBuilder,
    FixedIter, IsaIter, Iter, Linkage, MemStore, PrimId, PrimitiveSpec, PrimitiveStore,
    ResourceCache, Step,
};

fn fixed(ids: Vec<PrimId>) -> Iter {
    Iter::Fixed(FixedIter::from_sorted_ids(
        ids,
        0,
        2_000_000,
        Direction::Forward,
    ))
}

fn collect(it: &mut Iter, ctx: &ExecCtx<'_>) -> Vec<PrimId> {
    let mut b = Budget::unlimited();
    let mut out = Vec::new();
    while let Step::Emit(id) = it.next(ctx, &mut b) {
        out.push(id);
    }
    out
}

fn s1_iter() -> Iter {
    AndIter::compose(
        vec![fixed(vec![2, 3, 5, 7, 11]), fixed(vec![3, 5, 9, 11, 13])],
        0,
        2_000_000,
        Direction::Forward,
        None,
    )
    .unwrap()
}

/// The remaining sequence after thaw must be the remaining ids, possibly
/// preceded by a re-emission of already-seen ids (never skipping any).
fn assert_resumes(mut got: Vec<PrimId>, seen: &[PrimId], remaining: &[PrimId]) {
    // Strip any re-emitted prefix of already-seen ids.
    while !got.is_empty() && !remaining.contains(&got[0]) {
        assert!(
            seen.contains(&got[0]),
            "unexpected id {} after thaw",
            got[0]
        );
        got.remove(0);
    }
    assert_eq!(got, remaining, "ids were skipped or duplicated after thaw");
}

#[test]
fn s1_freeze_without_state_resumes() {
    let store = MemStore::new();
    let resources = ResourceCache::new(1 << 20);
    let config = EngineConfig::default();
    let ctx = ExecCtx::new(&store, &resources, &config);

    let mut it = s1_iter();
    let mut b = Budget::unlimited();
    assert_eq!(it.next(&ctx, &mut b), Step::Emit(3));

    // STATE omitted: SET + POSITION only.
    let cursor = quiver::freeze(&it, quiver::FreezeFlags::SET_POSITION, 1024);
    let mut back = thaw(&cursor, &ctx).unwrap();
    assert_resumes(collect(&mut back, &ctx), &[3], &[5, 11]);
}

#[test]
fn s5_cursor_survives_resource_cache_eviction() {
    let store = MemStore::new();
    let resources = ResourceCache::new(1 << 20);
    let config = EngineConfig::default();
    let ctx = ExecCtx::new(&store, &resources, &config);

    let mut it = s1_iter();
    let mut b = Budget::unlimited();
    assert_eq!(it.next(&ctx, &mut b), Step::Emit(3));
    let cursor = freeze_cursor(&it, &ctx);
    drop(it);

    resources.evict_all();
    let mut back = thaw(&cursor, &ctx).unwrap();
    assert_resumes(collect(&mut back, &ctx), &[3], &[5, 11]);
}

#[test]
fn full_freeze_round_trips_mid_and() {
    let store = MemStore::new();
    let resources = ResourceCache::new(1 << 20);
    let config = EngineConfig::default();
    let ctx = ExecCtx::new(&store, &resources, &config);

    let a: Vec<PrimId> = (0..300).collect();
    let b: Vec<PrimId> = (0..300).filter(|x| x % 3 == 0).collect();
    let expect: Vec<PrimId> = b.clone();
    let mut it = AndIter::compose(
        vec![fixed(a), fixed(b)],
        0,
        2_000_000,
        Direction::Forward,
        None,
    )
    .unwrap();

    let mut budget = Budget::unlimited();
    let mut seen = Vec::new();
    for _ in 0..10 {
        if let Step::Emit(id) = it.next(&ctx, &mut budget) {
            seen.push(id);
        }
    }
    let cursor = freeze_cursor(&it, &ctx);

    // Original still alive: the thaw rebinds and continues exactly.
    let mut back = thaw(&cursor, &ctx).unwrap();
    let got = collect(&mut back, &ctx);
    assert_resumes(got, &seen, &expect[10..]);

    // Original gone and caches evicted: replay recovery, same contract.
    drop(it);
    resources.evict_all();
    let mut back = thaw(&cursor, &ctx).unwrap();
    let got = collect(&mut back, &ctx);
    assert_resumes(got, &seen, &expect[10..]);
}

#[test]
fn storable_isa_cursor_relinks_cache() {
    let mut store = MemStore::new();
    let t = store.add(PrimitiveSpec::default());
    let tg = store.guid_from_id(t).unwrap();
    let targets: Vec<PrimId> = (0..10).map(|_| store.add(PrimitiveSpec::default())).collect();
    let mut sources = Vec::new();
    for &target in &targets {
        let target_guid = store.guid_from_id(target).unwrap();
        sources.push(store.add(PrimitiveSpec {
            typeguid: Some(tg),
            right: Some(target_guid),
            ..Default::default()
        }));
    }
    let resources = ResourceCache::new(1 << 20);
    let mut config = EngineConfig::default();
    config.engine.isa_materialize_max_items = 0;
    let ctx = ExecCtx::new(&store, &resources, &config);

    // An unsorted source keeps the ISA on the storable method.
    let mut builder = FixedBuilder::new(0, store.primitive_count(), Direction::Forward);
    for &s in sources.iter().rev() {
        builder.add(s);
    }
    let sub = Iter::Fixed(builder.commit(false));
    let mut it = IsaIter::new(
        sub,
        Linkage::Right,
        0,
        store.primitive_count(),
        Direction::Forward,
    );

    let mut budget = Budget::unlimited();
    let mut seen = Vec::new();
    for _ in 0..4 {
        if let Step::Emit(id) = it.next(&ctx, &mut budget) {
            seen.push(id);
        }
    }
    let cursor = freeze_cursor(&it, &ctx);
    let expect_rest: Vec<PrimId> = targets.iter().rev().copied().filter(|id| !seen.contains(id)).collect();
    drop(it);

    // Cache survives in the resource cache: exact continuation.
    let mut back = thaw(&cursor, &ctx).unwrap();
    assert_resumes(collect(&mut back, &ctx), &seen, &expect_rest);

    // Cache evicted: replay from the resume id, distinctness intact.
    resources.evict_all();
    let mut back = thaw(&cursor, &ctx).unwrap();
    let got = collect(&mut back, &ctx);
    assert_resumes(got, &seen, &expect_rest);
}

#[test]
fn eof_cursor_stays_done() {
    let store = MemStore::new();
    let resources = ResourceCache::new(1 << 20);
    let config = EngineConfig::default();
    let ctx = ExecCtx::new(&store, &resources, &config);
    let mut it = fixed(vec![4, 5]);
    assert_eq!(collect(&mut it, &ctx), vec![4, 5]);
    let cursor = freeze_cursor(&it, &ctx);
    let mut back = thaw(&cursor, &ctx).unwrap();
    assert_eq!(back.next(&ctx, &mut Budget::unlimited()), Step::Done);
}

#[test]
fn stats_survive_freeze_thaw() {
    let store = MemStore::new();
    let resources = ResourceCache::new(1 << 20);
    let config = EngineConfig::default();
    let ctx = ExecCtx::new(&store, &resources, &config);
    let a: Vec<PrimId> = (0..100).collect();
    let b: Vec<PrimId> = (0..100).filter(|x| x % 2 == 0).collect();
    let mut it = AndIter::compose(
        vec![fixed(a), fixed(b)],
        0,
        2_000_000,
        Direction::Forward,
        None,
    )
    .unwrap();
    let mut budget = Budget::unlimited();
    assert_eq!(it.statistics(&ctx, &mut budget), quiver::StatStep::Ready);
    let before = it.stats().unwrap().clone();

    let cursor = freeze_cursor(&it, &ctx);
    drop(it);
    resources.evict_all();
    let back = thaw(&cursor, &ctx).unwrap();
    let after = back.stats().expect("stats travel in the cursor");
    assert_eq!(after.n, before.n);
    assert_eq!(after.next_cost, before.next_cost);
    assert_eq!(after.check_cost, before.check_cost);
    assert_eq!(after.find_cost, before.find_cost);
}
