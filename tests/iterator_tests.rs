//! Iterator kernel integration tests: composition, budgets, scenarios.

use quiver::{
    run_page, AllIter, AndIter, Budget, Direction, EngineConfig, ExecCtx, FixedBuilder, FixedIter,
    Found, Iter, MemStore, OrIter, PrimId, ResourceCache, Step,
};

fn fixed(ids: Vec<PrimId>) -> Iter {
    Iter::Fixed(FixedIter::from_sorted_ids(
        ids,
        0,
        2_000_000,
        Direction::Forward,
    ))
}

struct World {
    store: MemStore,
    resources: ResourceCache,
    config: EngineConfig,
}

impl World {
    fn new() -> Self {
        World {
            store: MemStore::new(),
            resources: ResourceCache::new(1 << 20),
            config: EngineConfig::default(),
        }
    }

    fn ctx(&self) -> ExecCtx<'_> {
        ExecCtx::new(&self.store, &self.resources, &self.config)
    }
}

fn collect(it: &mut Iter, ctx: &ExecCtx<'_>) -> Vec<PrimId> {
    let mut b = Budget::unlimited();
    let mut out = Vec::new();
    while let Step::Emit(id) = it.next(ctx, &mut b) {
        out.push(id);
    }
    out
}

#[test]
fn s1_fixed_intersection() {
    let w = World::new();
    let ctx = w.ctx();
    let mut it = AndIter::compose(
        vec![fixed(vec![2, 3, 5, 7, 11]), fixed(vec![3, 5, 9, 11, 13])],
        0,
        2_000_000,
        Direction::Forward,
        None,
    )
    .unwrap();
    assert_eq!(collect(&mut it, &ctx), vec![3, 5, 11]);
}

#[test]
fn s4_budgeted_resume_finds_needle() {
    let w = World::new();
    let ctx = w.ctx();
    let all = Iter::All(AllIter::new(0, 1_000_000, Direction::Forward));
    let needle = fixed(vec![999_999]);
    let mut it = AndIter::compose(
        vec![all, needle],
        0,
        1_000_000,
        Direction::Forward,
        None,
    )
    .unwrap();

    let mut out = Vec::new();
    let mut more_calls = 0u64;
    loop {
        let mut b = Budget::new(100);
        match it.next(&ctx, &mut b) {
            Step::Emit(id) => out.push(id),
            Step::Done => break,
            Step::More => {
                more_calls += 1;
                assert!(more_calls < 5_000_000, "More loop makes no progress");
            }
        }
    }
    assert_eq!(out, vec![999_999]);
}

#[test]
fn s6_or_dedup_with_sorted_children() {
    let w = World::new();
    let ctx = w.ctx();
    let mut it = OrIter::compose(
        vec![fixed(vec![1, 4, 7]), fixed(vec![4, 5, 7, 9])],
        0,
        2_000_000,
        Direction::Forward,
        None,
    )
    .unwrap();
    assert_eq!(collect(&mut it, &ctx), vec![1, 4, 5, 7, 9]);
}

#[test]
fn emitted_ids_stay_in_window() {
    let w = World::new();
    let ctx = w.ctx();
    let mut b = FixedBuilder::new(10, 20, Direction::Forward);
    for id in [3, 10, 15, 19, 20, 99] {
        b.add(id);
    }
    let mut it = Iter::Fixed(b.commit(true));
    for id in collect(&mut it, &ctx) {
        assert!((10..20).contains(&id));
    }
}

#[test]
fn sorted_sequences_are_strictly_monotone() {
    let w = World::new();
    let ctx = w.ctx();
    let mut it = OrIter::compose(
        vec![fixed(vec![2, 9, 40]), fixed(vec![2, 3, 40, 41])],
        0,
        2_000_000,
        Direction::Forward,
        None,
    )
    .unwrap();
    let ids = collect(&mut it, &ctx);
    assert!(ids.windows(2).all(|p| p[0] < p[1]));
}

#[test]
fn clone_emits_the_same_sequence() {
    let w = World::new();
    let ctx = w.ctx();
    let mut it = AndIter::compose(
        vec![
            fixed((0..200).collect()),
            fixed((0..200).filter(|x| x % 3 == 0).collect()),
        ],
        0,
        2_000_000,
        Direction::Forward,
        None,
    )
    .unwrap();
    let mut clone = it.clone_iter();
    it.reset();
    clone.reset();
    assert_eq!(collect(&mut it, &ctx), collect(&mut clone, &ctx));
}

#[test]
fn find_returns_the_id_just_emitted() {
    let w = World::new();
    let ctx = w.ctx();
    let mut it = OrIter::compose(
        vec![fixed(vec![5, 6, 10]), fixed(vec![6, 12])],
        0,
        2_000_000,
        Direction::Forward,
        None,
    )
    .unwrap();
    let mut b = Budget::unlimited();
    let Step::Emit(first) = it.next(&ctx, &mut b) else {
        panic!("expected an id");
    };
    assert_eq!(it.find(first, &ctx, &mut b), Found::At(first));
    // And the sequence carries on from there.
    assert_eq!(it.next(&ctx, &mut b), Step::Emit(6));
}

#[test]
fn next_after_done_stays_done() {
    let w = World::new();
    let ctx = w.ctx();
    let mut it = fixed(vec![1, 2]);
    let mut b = Budget::unlimited();
    assert_eq!(collect(&mut it, &ctx), vec![1, 2]);
    assert_eq!(it.next(&ctx, &mut b), Step::Done);
    assert_eq!(it.next(&ctx, &mut b), Step::Done);
    it.reset();
    assert_eq!(collect(&mut it, &ctx), vec![1, 2]);
}

#[test]
fn backward_and_intersects_backward() {
    let w = World::new();
    let ctx = w.ctx();
    let a = Iter::Fixed(FixedIter::from_sorted_ids(
        vec![2, 3, 5, 7, 11],
        0,
        100,
        Direction::Backward,
    ));
    let b = Iter::Fixed(FixedIter::from_sorted_ids(
        vec![3, 5, 9, 11],
        0,
        100,
        Direction::Backward,
    ));
    let mut it = AndIter::compose(vec![a, b], 0, 100, Direction::Backward, None).unwrap();
    assert_eq!(collect(&mut it, &ctx), vec![11, 5, 3]);
}

#[test]
fn run_page_pages_through_an_intersection() {
    let w = World::new();
    let mut config = EngineConfig::default();
    config.engine.page_size = 4;
    let ctx = ExecCtx::new(&w.store, &w.resources, &config);
    let mut it = AndIter::compose(
        vec![
            fixed((0..100).collect()),
            fixed((0..100).filter(|x| x % 2 == 0).collect()),
        ],
        0,
        2_000_000,
        Direction::Forward,
        None,
    )
    .unwrap();
    let mut got = Vec::new();
    loop {
        let mut budget = Budget::unlimited();
        let out = run_page(&mut it, &ctx, &mut budget).unwrap();
        got.extend(out.ids);
        if out.done {
            break;
        }
        // In-process continuation: the cursor is also valid, but the live
        // iterator keeps going without it.
    }
    let expect: Vec<PrimId> = (0..100).filter(|x| x % 2 == 0).collect();
    assert_eq!(got, expect);
}
