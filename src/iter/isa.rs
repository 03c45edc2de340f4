//! The `isa` composite: distinct destinations of one linkage slot.
//!
//! For every source id the sub-iterator produces, read the primitive,
//! follow the named linkage slot, and emit each distinct destination in
//! `[low, high)` exactly once. Output order is discovery order.
//!
//! Duplicate suppression runs in one of two methods, chosen by the
//! statistics experiment:
//!
//! - **STORABLE**: an append-only cache (log + id-set) shared with clones.
//!   Used when the source is unsorted or the expected output is small
//!   enough to hash.
//! - **INTERSECT**: a candidate is a duplicate iff some earlier source
//!   also points at it, which is an emptiness test on the intersection of
//!   the candidate's fan-in with the already-consumed prefix of the
//!   source. Three strategies, picked by cost: drain the fan-in and check
//!   the source, drain the source and check the linkage, or battle the two
//!   with mutual `find` and a two-step confirmation counter.

use crate::budget::{Budget, Found, StatStep, Step, Tri};
use crate::engine::ExecCtx;
use crate::ids::{Guid, Linkage, PrimId};
use crate::iter::{resume_admit, Direction, IdSet, IsaCache, Iter, LinkIter, LinkSource, Pos, PrimSummary};
use crate::stats::{scale_by_overlap, RangeEstimate, Stats};
use crate::store::{COST_FUNCTION_CALL, COST_GMAP_ARRAY, COST_PRIMITIVE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Below this many expected probes, draining beats the mutual-find battle.
const BATTLE_MIN: u64 = 8;

/// Outcome of the ISA statistics phase.
#[derive(Debug)]
pub(crate) enum IsaStat {
    Ready,
    More,
    /// The source was cheap enough to materialise outright.
    Substitute(super::FixedIter),
}

/// Duplicate-suppression method, fixed by the statistics experiment and
/// re-decidable at thaw when the cache was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupMethod {
    Storable,
    Intersect,
}

impl DedupMethod {
    pub fn token(self) -> &'static str {
        match self {
            DedupMethod::Storable => "s",
            DedupMethod::Intersect => "i",
        }
    }

    pub fn from_token(s: &str) -> Option<DedupMethod> {
        match s {
            "s" => Some(DedupMethod::Storable),
            "i" => Some(DedupMethod::Intersect),
            _ => None,
        }
    }
}

/// State shared between an original and its clones.
#[derive(Debug, Default)]
pub struct IsaShared {
    pub(crate) stats: Option<Stats>,
    pub(crate) method: Option<DedupMethod>,
    /// Source summary snapshot; a locked typeguid turns fan-ins into VIPs.
    pub(crate) summary: PrimSummary,
    pub(crate) cache: Option<Arc<Mutex<IsaCache>>>,
    /// Request-scoped `check` memo.
    pub(crate) check_memo: HashMap<PrimId, bool>,
    pub(crate) published: usize,
}

/// One dedup decision in flight (INTERSECT).
#[derive(Debug, Clone)]
struct IntersectSt {
    src: PrimId,
    cand: PrimId,
    alg: ProbeAlg,
}

/// Emptiness probe over fan-in × consumed-source-prefix.
#[derive(Debug, Clone)]
enum ProbeAlg {
    /// Drain the fan-in, `check` each hit against the source.
    FanNext { fan: Box<Iter> },
    /// Drain a source clone, compare each primitive's linkage.
    SrcNext {
        sclone: Box<Iter>,
        target_guid: Guid,
    },
    /// Mutual find with a two-step confirmation counter.
    Battle {
        fan: Box<Iter>,
        sclone: Box<Iter>,
        cand2: PrimId,
        streak: u32,
        turn: bool,
    },
}

#[derive(Debug, Clone)]
enum ProbeOut {
    Dup,
    Fresh,
    More,
}

#[derive(Debug, Clone, Default)]
enum IsaOp {
    #[default]
    Idle,
    Intersect(IntersectSt),
}

/// Suspended `check` pass.
#[derive(Debug, Clone)]
struct CheckSt {
    id: PrimId,
    alg: ProbeAlg,
}

/// Suspended statistics experiment.
#[derive(Debug, Clone, Default)]
struct Experiment {
    sub_stats_done: bool,
    sclone: Option<Box<Iter>>,
    k_trials: u64,
    k_distinct: u64,
    seen: Vec<PrimId>,
    mat: Option<MatSt>,
}

/// Suspended materialisation.
#[derive(Debug, Clone)]
struct MatSt {
    clone: Box<Iter>,
    outs: Vec<PrimId>,
    seen: IdSet,
}

#[derive(Debug, Clone)]
pub struct IsaIter {
    pub(crate) sub: Box<Iter>,
    pub(crate) linkage: Linkage,
    pub(crate) low: PrimId,
    pub(crate) high: PrimId,
    pub(crate) dir: Direction,
    pub(crate) shared: Arc<Mutex<IsaShared>>,
    /// Storable read offset.
    pub(crate) read_off: usize,
    /// Last source id this handle consumed, for freezing.
    pub(crate) last_src: Option<PrimId>,
    /// Source ids consumed so far (sizes the intersect probes).
    pub(crate) consumed: u64,
    pub(crate) pos: Pos,
    pub(crate) is_original: bool,
    pub(crate) method_local: Option<DedupMethod>,
    stats_local: Option<Stats>,
    op: IsaOp,
    experiment: Option<Experiment>,
    check_st: Option<CheckSt>,
}

impl IsaIter {
    pub fn new(sub: Iter, linkage: Linkage, low: PrimId, high: PrimId, dir: Direction) -> Iter {
        if sub.is_null() {
            return Iter::Null(super::NullIter);
        }
        Iter::Isa(Box::new(IsaIter {
            sub: Box::new(sub),
            linkage,
            low,
            high: high.max(low),
            dir,
            shared: Arc::new(Mutex::new(IsaShared::default())),
            read_off: 0,
            last_src: None,
            consumed: 0,
            pos: Pos::default(),
            is_original: true,
            method_local: None,
            stats_local: None,
            op: IsaOp::Idle,
            experiment: None,
            check_st: None,
        }))
    }

    pub(crate) fn mark_clone(&mut self) {
        self.is_original = false;
    }

    pub fn stats(&self) -> Option<&Stats> {
        self.stats_local.as_ref()
    }

    pub fn method(&self) -> Option<DedupMethod> {
        self.method_local
    }

    /// Number of ids logged in the storable cache, if one exists.
    pub fn cache_elems(&self) -> Option<usize> {
        let sh = self.shared.lock();
        sh.cache.as_ref().map(|c| c.lock().nelems())
    }

    fn adopt_shared(&mut self) -> bool {
        if self.stats_local.is_some() {
            return true;
        }
        let sh = self.shared.lock();
        if let (Some(stats), Some(method)) = (sh.stats.clone(), sh.method) {
            self.stats_local = Some(stats);
            self.method_local = Some(method);
            return true;
        }
        false
    }

    /// Read a source primitive and resolve its linkage target, skipping
    /// deletion holes, absent slots, and dangling guids.
    fn follow(&self, ctx: &ExecCtx<'_>, budget: &mut Budget, src: PrimId) -> Option<PrimId> {
        budget.charge(COST_PRIMITIVE);
        let prim = ctx.store.read_primitive(src)?;
        let guid = prim.linkage_guid(self.linkage)?;
        budget.charge(COST_FUNCTION_CALL);
        ctx.store.id_from_guid(guid)
    }

    /// Fan-in over primitives pointing at `target`, restricted to the
    /// source ids strictly before `before` in this direction. A typeguid
    /// locked on the source upgrades the fan-in to a VIP.
    fn fan_in(&self, ctx: &ExecCtx<'_>, target: PrimId, before: Option<PrimId>) -> Iter {
        let (mut lo, mut hi) = (self.sub.low(), self.sub.high());
        if let Some(b) = before {
            match self.dir {
                Direction::Forward => hi = hi.min(b),
                Direction::Backward => lo = lo.max(b + 1),
            }
        }
        let summary = self.shared.lock().summary;
        let source = match summary.locked_typeguid() {
            Some(typeguid) => LinkSource::Vip {
                endpoint: target,
                linkage: self.linkage,
                typeguid,
            },
            None => match ctx.store.guid_from_id(target) {
                Some(guid) => LinkSource::Gmap {
                    linkage: self.linkage,
                    guid,
                },
                // Target vanished: empty fan-in.
                None => {
                    return Iter::Null(super::NullIter);
                }
            },
        };
        Iter::Link(LinkIter::new(ctx.store, source, lo, hi, self.dir))
    }

    fn pick_probe(&self, ctx: &ExecCtx<'_>, target: PrimId, before: Option<PrimId>) -> ProbeAlg {
        let fan = self.fan_in(ctx, target, before);
        let n_fan = fan.range_estimate().n_max;
        let n_src = match before {
            Some(_) => self.consumed,
            None => self.sub.stats().map(|s| s.n).unwrap_or(u64::MAX),
        };
        if n_fan <= n_src && n_fan <= BATTLE_MIN {
            return ProbeAlg::FanNext { fan: Box::new(fan) };
        }
        let sclone = {
            let mut c = self.sub.clone_iter();
            c.reset();
            Box::new(c)
        };
        if n_src < n_fan && n_src <= BATTLE_MIN {
            let target_guid = ctx.store.guid_from_id(target).unwrap_or(Guid(0));
            return ProbeAlg::SrcNext {
                sclone,
                target_guid,
            };
        }
        if self.sub.sorted() {
            let cand2 = match self.dir {
                Direction::Forward => self.sub.low(),
                Direction::Backward => self.sub.high().saturating_sub(1),
            };
            ProbeAlg::Battle {
                fan: Box::new(fan),
                sclone,
                cand2,
                streak: 0,
                turn: true,
            }
        } else {
            ProbeAlg::FanNext { fan: Box::new(fan) }
        }
    }

    /// Advance one probe; `before` bounds the source prefix (None = whole
    /// source window, used by `check`).
    fn run_probe(
        &mut self,
        ctx: &ExecCtx<'_>,
        budget: &mut Budget,
        alg: &mut ProbeAlg,
        before: Option<PrimId>,
    ) -> ProbeOut {
        loop {
            if budget.exhausted() {
                return ProbeOut::More;
            }
            match alg {
                ProbeAlg::FanNext { fan } => match fan.next(ctx, budget) {
                    Step::Emit(f) => match self.sub.check(f, ctx, budget) {
                        Tri::Yes => return ProbeOut::Dup,
                        Tri::No => continue,
                        Tri::More => return ProbeOut::More,
                    },
                    Step::Done => return ProbeOut::Fresh,
                    Step::More => return ProbeOut::More,
                },
                ProbeAlg::SrcNext {
                    sclone,
                    target_guid,
                } => match sclone.next(ctx, budget) {
                    Step::Emit(f) => {
                        if let Some(b) = before {
                            if !self.dir.precedes(f, b) {
                                return ProbeOut::Fresh;
                            }
                        }
                        budget.charge(COST_PRIMITIVE);
                        match ctx.store.read_primitive(f) {
                            Some(p) if p.linkage_guid(self.linkage) == Some(*target_guid) => {
                                return ProbeOut::Dup;
                            }
                            _ => continue,
                        }
                    }
                    Step::Done => return ProbeOut::Fresh,
                    Step::More => return ProbeOut::More,
                },
                ProbeAlg::Battle {
                    fan,
                    sclone,
                    cand2,
                    streak,
                    turn,
                } => {
                    let r = if *turn {
                        fan.find(*cand2, ctx, budget)
                    } else {
                        sclone.find(*cand2, ctx, budget)
                    };
                    match r {
                        Found::At(x) => {
                            if let Some(b) = before {
                                if !self.dir.precedes(x, b) {
                                    return ProbeOut::Fresh;
                                }
                            }
                            if x == *cand2 {
                                *streak += 1;
                                if *streak >= 2 {
                                    return ProbeOut::Dup;
                                }
                            } else {
                                *cand2 = x;
                                *streak = 1;
                            }
                            *turn = !*turn;
                        }
                        Found::Done => return ProbeOut::Fresh,
                        Found::More => return ProbeOut::More,
                    }
                }
            }
        }
    }

    pub fn next(&mut self, ctx: &ExecCtx<'_>, budget: &mut Budget) -> Step {
        if self.pos.eof {
            return Step::Done;
        }
        match self.method_local.expect("isa production before election") {
            DedupMethod::Storable => self.next_storable(ctx, budget),
            DedupMethod::Intersect => self.next_intersect(ctx, budget),
        }
    }

    fn storable_cache(&self) -> Arc<Mutex<IsaCache>> {
        let mut sh = self.shared.lock();
        sh.cache
            .get_or_insert_with(|| Arc::new(Mutex::new(IsaCache::new())))
            .clone()
    }

    fn next_storable(&mut self, ctx: &ExecCtx<'_>, budget: &mut Budget) -> Step {
        let cache_arc = self.storable_cache();
        loop {
            if budget.exhausted() {
                return Step::More;
            }
            {
                let cache = cache_arc.lock();
                if self.read_off < cache.nelems() {
                    let id = cache
                        .offset_to_id(self.read_off)
                        .expect("offset below nelems");
                    drop(cache);
                    self.read_off += 1;
                    budget.charge(COST_FUNCTION_CALL);
                    self.pos.last = Some(id);
                    if resume_admit(&mut self.pos, self.dir, false, id) {
                        return Step::Emit(id);
                    }
                    continue;
                }
                if cache.eof() {
                    self.pos.eof = true;
                    return Step::Done;
                }
            }
            // Extend the frontier with our own source. A replaying clone
            // re-derives cached ids; the id-set swallows them.
            match self.sub.next(ctx, budget) {
                Step::Emit(src) => {
                    self.last_src = Some(src);
                    self.consumed += 1;
                    let Some(t) = self.follow(ctx, budget, src) else {
                        continue;
                    };
                    if t < self.low || t >= self.high {
                        continue;
                    }
                    let mut cache = cache_arc.lock();
                    let tail = cache.nelems();
                    if cache.check(t) {
                        continue;
                    }
                    match cache.add(tail, t) {
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, id = t, "isa cache append failed; skipping id");
                            continue;
                        }
                    }
                    let bytes = cache.byte_size();
                    drop(cache);
                    let delta = {
                        let mut sh = self.shared.lock();
                        let d = bytes as isize - sh.published as isize;
                        sh.published = bytes;
                        d
                    };
                    if delta != 0 {
                        ctx.resources.publish_transient(delta);
                    }
                }
                Step::Done => {
                    cache_arc.lock().set_eof();
                }
                Step::More => return Step::More,
            }
        }
    }

    fn next_intersect(&mut self, ctx: &ExecCtx<'_>, budget: &mut Budget) -> Step {
        loop {
            if budget.exhausted() {
                return Step::More;
            }
            match std::mem::take(&mut self.op) {
                IsaOp::Idle => match self.sub.next(ctx, budget) {
                    Step::Emit(src) => {
                        self.last_src = Some(src);
                        let Some(t) = self.follow(ctx, budget, src) else {
                            self.consumed += 1;
                            continue;
                        };
                        if t < self.low || t >= self.high {
                            self.consumed += 1;
                            continue;
                        }
                        let alg = self.pick_probe(ctx, t, Some(src));
                        self.consumed += 1;
                        self.op = IsaOp::Intersect(IntersectSt { src, cand: t, alg });
                    }
                    Step::Done => {
                        self.pos.eof = true;
                        return Step::Done;
                    }
                    Step::More => return Step::More,
                },
                IsaOp::Intersect(mut st) => {
                    let before = Some(st.src);
                    match self.run_probe(ctx, budget, &mut st.alg, before) {
                        ProbeOut::Dup => {}
                        ProbeOut::Fresh => {
                            self.pos.last = Some(st.cand);
                            if resume_admit(&mut self.pos, self.dir, false, st.cand) {
                                return Step::Emit(st.cand);
                            }
                        }
                        ProbeOut::More => {
                            self.op = IsaOp::Intersect(st);
                            return Step::More;
                        }
                    }
                }
            }
        }
    }

    pub fn check(&mut self, id: PrimId, ctx: &ExecCtx<'_>, budget: &mut Budget) -> Tri {
        if id < self.low || id >= self.high {
            return Tri::No;
        }
        if let Some(&hit) = self.shared.lock().check_memo.get(&id) {
            return if hit { Tri::Yes } else { Tri::No };
        }
        let mut st = match self.check_st.take() {
            Some(st) if st.id == id => st,
            _ => CheckSt {
                id,
                alg: self.pick_probe(ctx, id, None),
            },
        };
        match self.run_probe(ctx, budget, &mut st.alg, None) {
            ProbeOut::Dup => {
                // Some source points at id: it is a member.
                self.shared.lock().check_memo.insert(id, true);
                Tri::Yes
            }
            ProbeOut::Fresh => {
                self.shared.lock().check_memo.insert(id, false);
                Tri::No
            }
            ProbeOut::More => {
                self.check_st = Some(st);
                Tri::More
            }
        }
    }

    pub(crate) fn statistics(&mut self, ctx: &ExecCtx<'_>, budget: &mut Budget) -> IsaStat {
        if self.stats_local.is_some() || self.adopt_shared() {
            return IsaStat::Ready;
        }
        let cfg = &ctx.config.engine;
        let mut exp = self.experiment.take().unwrap_or_default();

        if !exp.sub_stats_done {
            match self.sub.statistics(ctx, budget) {
                StatStep::Ready => exp.sub_stats_done = true,
                StatStep::More => {
                    self.experiment = Some(exp);
                    return IsaStat::More;
                }
            }
        }
        let sub_stats = self.sub.stats().expect("sub statistics valid").clone();

        // Materialisation: a small, cheap source is read out entirely and
        // the ISA becomes a fixed iterator masquerading as this set.
        let total = sub_stats.n as i64 * (sub_stats.next_cost + COST_PRIMITIVE);
        if exp.mat.is_some()
            || (sub_stats.n <= cfg.isa_materialize_max_items
                && sub_stats.next_cost < cfg.isa_materialize_next_cost
                && total <= cfg.isa_materialize_total_cost)
        {
            if exp.mat.is_none() {
                let mut c = self.sub.clone_iter();
                c.reset();
                exp.mat = Some(MatSt {
                    clone: Box::new(c),
                    outs: Vec::new(),
                    seen: IdSet::new(),
                });
            }
            loop {
                if budget.exhausted() {
                    self.experiment = Some(exp);
                    return IsaStat::More;
                }
                let step = {
                    let mat = exp.mat.as_mut().expect("materialisation in flight");
                    mat.clone.next(ctx, budget)
                };
                match step {
                    Step::Emit(src) => {
                        budget.charge(COST_PRIMITIVE);
                        let target = ctx
                            .store
                            .read_primitive(src)
                            .and_then(|p| p.linkage_guid(self.linkage))
                            .and_then(|g| ctx.store.id_from_guid(g));
                        if let Some(t) = target {
                            let mat = exp.mat.as_mut().expect("materialisation in flight");
                            if t >= self.low && t < self.high && mat.seen.insert(t) {
                                mat.outs.push(t);
                            }
                        }
                    }
                    Step::Done => break,
                    Step::More => {
                        self.experiment = Some(exp);
                        return IsaStat::More;
                    }
                }
            }
            let mat = exp.mat.take().expect("materialisation finished");
            tracing::debug!(n = mat.outs.len(), "isa materialised into fixed iterator");
            let fixed =
                super::FixedIter::from_sorted_ids(mat.outs, self.low, self.high, self.dir);
            return IsaStat::Substitute(fixed);
        }

        // Sampling: a few sources, following linkage each time.
        if exp.sclone.is_none() {
            let mut c = self.sub.clone_iter();
            c.reset();
            exp.sclone = Some(Box::new(c));
        }
        while exp.k_trials < cfg.isa_sample {
            if budget.exhausted() {
                self.experiment = Some(exp);
                return IsaStat::More;
            }
            let step = exp
                .sclone
                .as_mut()
                .expect("sampling clone in flight")
                .next(ctx, budget);
            match step {
                Step::Emit(src) => {
                    budget.charge(COST_PRIMITIVE + COST_FUNCTION_CALL);
                    let target = ctx
                        .store
                        .read_primitive(src)
                        .and_then(|p| p.linkage_guid(self.linkage))
                        .and_then(|g| ctx.store.id_from_guid(g));
                    if let Some(t) = target {
                        exp.k_trials += 1;
                        if !exp.seen.contains(&t) {
                            exp.seen.push(t);
                            exp.k_distinct += 1;
                        }
                    }
                }
                Step::Done => break,
                Step::More => {
                    self.experiment = Some(exp);
                    return IsaStat::More;
                }
            }
        }

        let loss = (exp.k_trials / exp.k_distinct.max(1)).max(1);
        let dateline = ctx.store.primitive_count().max(1);
        let n0 = (sub_stats.n / loss).max(1);
        let n = scale_by_overlap(n0, (0, dateline), (self.low, self.high)).max(1);
        let next_cost =
            (sub_stats.next_cost + COST_PRIMITIVE + COST_FUNCTION_CALL) * loss as i64 + 2;
        let check_cost = COST_GMAP_ARRAY + sub_stats.check_cost;
        let stats = Stats::new(check_cost, next_cost, next_cost, n);

        let method = if !self.sub.sorted() {
            DedupMethod::Storable
        } else if n < cfg.isa_huge {
            DedupMethod::Storable
        } else {
            DedupMethod::Intersect
        };
        let summary = self.sub.primitive_summary();
        tracing::debug!(?method, n, loss, "isa experiment complete");
        {
            let mut sh = self.shared.lock();
            sh.stats = Some(stats.clone());
            sh.method = Some(method);
            sh.summary = summary;
            if method == DedupMethod::Storable && sh.cache.is_none() {
                sh.cache = Some(Arc::new(Mutex::new(IsaCache::new())));
            }
        }
        self.stats_local = Some(stats);
        self.method_local = Some(method);
        self.experiment = None;
        IsaStat::Ready
    }

    /// Rebind to a still-live original's shared state (cursor thaw).
    /// Returns true when statistics and method came along.
    pub(crate) fn rebind(&mut self, shared: Arc<Mutex<IsaShared>>, read_off: usize) -> bool {
        self.shared = shared;
        self.is_original = false;
        self.read_off = read_off;
        self.adopt_shared()
    }

    /// Adopt a storable cache recovered from the resource cache when the
    /// original itself is gone (cursor thaw).
    pub(crate) fn attach_cache(&mut self, cache: Arc<Mutex<IsaCache>>, read_off: usize) {
        {
            let mut sh = self.shared.lock();
            sh.cache = Some(cache);
        }
        self.read_off = read_off;
    }

    /// Override the dedup method (cursor STATE, or the thaw-time upgrade
    /// when a storable cache was lost).
    pub(crate) fn set_method(&mut self, method: DedupMethod) {
        self.method_local = Some(method);
        let mut sh = self.shared.lock();
        sh.method = Some(method);
        if method == DedupMethod::Storable && sh.cache.is_none() {
            sh.cache = Some(Arc::new(Mutex::new(IsaCache::new())));
        }
    }

    /// Install externally recovered statistics and method (cursor thaw).
    pub(crate) fn install(&mut self, stats: Stats, method: DedupMethod) {
        {
            let mut sh = self.shared.lock();
            if sh.stats.is_none() {
                sh.stats = Some(stats.clone());
                sh.method = Some(method);
                if method == DedupMethod::Storable && sh.cache.is_none() {
                    sh.cache = Some(Arc::new(Mutex::new(IsaCache::new())));
                }
            }
        }
        self.stats_local = Some(stats);
        self.method_local = Some(method);
    }

    pub fn reset(&mut self) {
        self.sub.reset();
        if self.is_original {
            let mut sh = self.shared.lock();
            if sh.cache.is_some() {
                sh.cache = Some(Arc::new(Mutex::new(IsaCache::new())));
            }
        }
        self.read_off = 0;
        self.last_src = None;
        self.consumed = 0;
        self.pos = Pos::default();
        self.op = IsaOp::Idle;
        self.check_st = None;
    }

    pub fn range_estimate(&self) -> RangeEstimate {
        let sh = self.shared.lock();
        if let Some(cache) = &sh.cache {
            let cache = cache.lock();
            if cache.eof() {
                return cache.range(self.read_off);
            }
        }
        let n_max = sh
            .stats
            .as_ref()
            .map(|s| s.n)
            .unwrap_or_else(|| self.sub.range_estimate().n_max);
        RangeEstimate::at_most(self.low, self.high, n_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::iter::{FixedBuilder, FixedIter};
    use crate::resource::ResourceCache;
    use crate::store::{MemStore, PrimitiveSpec, PrimitiveStore};

    /// Store with a type primitive T and n sources typed T.
    fn typed_sources(n: usize) -> (MemStore, PrimId, Vec<PrimId>) {
        let mut s = MemStore::new();
        let t = s.add(PrimitiveSpec::default());
        let tg = s.guid_from_id(t).unwrap();
        let sources = (0..n)
            .map(|_| {
                s.add(PrimitiveSpec {
                    typeguid: Some(tg),
                    ..Default::default()
                })
            })
            .collect();
        (s, t, sources)
    }

    fn no_materialise() -> EngineConfig {
        let mut c = EngineConfig::default();
        c.engine.isa_materialize_max_items = 0;
        c
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
    fn test_storable_dedups_unsorted_source() {
        // S2 shape: sources P1,P2,P3,P1 all typed T; the type destination
        // comes out exactly once and the cache logs one element.
        let (store, t, sources) = typed_sources(3);
        let resources = ResourceCache::new(1 << 20);
        let config = no_materialise();
        let ctx = ExecCtx {
            store: &store,
            resources: &resources,
            config: &config,
        };
        let mut b = FixedBuilder::new(0, store.primitive_count(), Direction::Forward);
        for id in [sources[0], sources[1], sources[2], sources[0]] {
            b.add(id);
        }
        let sub = Iter::Fixed(b.commit(false));
        assert!(!sub.sorted());
        let mut it = IsaIter::new(
            sub,
            Linkage::Typeguid,
            0,
            store.primitive_count(),
            Direction::Forward,
        );
        assert_eq!(collect(&mut it, &ctx), vec![t]);
        let Iter::Isa(isa) = &it else {
            panic!("still an isa");
        };
        assert_eq!(isa.method(), Some(DedupMethod::Storable));
        let sh = isa.shared.lock();
        let cache = sh.cache.as_ref().unwrap().lock();
        assert_eq!(cache.nelems(), 1);
    }

    #[test]
    fn test_intersect_emits_first_appearances() {
        // S3 shape: sorted sources -> A except one hole and one -> B.
        let mut store = MemStore::new();
        let t = store.add(PrimitiveSpec::default());
        let tg = store.guid_from_id(t).unwrap();
        let a = store.add(PrimitiveSpec::default());
        let ag = store.guid_from_id(a).unwrap();
        let b = store.add(PrimitiveSpec::default());
        let bg = store.guid_from_id(b).unwrap();
        let mut sources = Vec::new();
        for k in 0..5 {
            let right = match k {
                2 => None,
                3 => Some(bg),
                _ => Some(ag),
            };
            sources.push(store.add(PrimitiveSpec {
                typeguid: Some(tg),
                right,
                ..Default::default()
            }));
        }
        let resources = ResourceCache::new(1 << 20);
        let mut config = no_materialise();
        config.engine.isa_huge = 0; // force INTERSECT for sorted sources
        let ctx = ExecCtx {
            store: &store,
            resources: &resources,
            config: &config,
        };
        let sub = Iter::Fixed(FixedIter::from_sorted_ids(
            sources,
            0,
            store.primitive_count(),
            Direction::Forward,
        ));
        let mut it = IsaIter::new(
            sub,
            Linkage::Right,
            0,
            store.primitive_count(),
            Direction::Forward,
        );
        assert_eq!(collect(&mut it, &ctx), vec![a, b]);
        let Iter::Isa(isa) = &it else {
            panic!("still an isa");
        };
        assert_eq!(isa.method(), Some(DedupMethod::Intersect));
    }

    #[test]
    fn test_materialises_small_cheap_source() {
        let (store, t, sources) = typed_sources(4);
        let resources = ResourceCache::new(1 << 20);
        let config = EngineConfig::default();
        let ctx = ExecCtx {
            store: &store,
            resources: &resources,
            config: &config,
        };
        let sub = Iter::Fixed(FixedIter::from_sorted_ids(
            sources,
            0,
            store.primitive_count(),
            Direction::Forward,
        ));
        let mut it = IsaIter::new(
            sub,
            Linkage::Typeguid,
            0,
            store.primitive_count(),
            Direction::Forward,
        );
        assert_eq!(collect(&mut it, &ctx), vec![t]);
        assert!(matches!(it, Iter::Fixed(_)));
    }

    #[test]
    fn test_check_finds_membership_via_fan_in() {
        let (store, t, sources) = typed_sources(5);
        let resources = ResourceCache::new(1 << 20);
        let config = no_materialise();
        let ctx = ExecCtx {
            store: &store,
            resources: &resources,
            config: &config,
        };
        let sub = Iter::Fixed(FixedIter::from_sorted_ids(
            sources.clone(),
            0,
            store.primitive_count(),
            Direction::Forward,
        ));
        let mut it = IsaIter::new(
            sub,
            Linkage::Typeguid,
            0,
            store.primitive_count(),
            Direction::Forward,
        );
        let mut budget = Budget::unlimited();
        assert_eq!(it.statistics(&ctx, &mut budget), StatStep::Ready);
        assert_eq!(it.check(t, &ctx, &mut budget), Tri::Yes);
        assert_eq!(it.check(sources[0], &ctx, &mut budget), Tri::No);
        // Memoised result answers immediately even with a dry budget.
        let mut dry = Budget::new(0);
        assert_eq!(it.check(t, &ctx, &mut dry), Tri::Yes);
    }

    #[test]
    fn test_clone_shares_storable_cache() {
        let (store, t, sources) = typed_sources(3);
        let resources = ResourceCache::new(1 << 20);
        let config = no_materialise();
        let ctx = ExecCtx {
            store: &store,
            resources: &resources,
            config: &config,
        };
        let mut b = FixedBuilder::new(0, store.primitive_count(), Direction::Forward);
        for id in [sources[1], sources[0], sources[2]] {
            b.add(id);
        }
        let sub = Iter::Fixed(b.commit(false));
        let mut it = IsaIter::new(
            sub,
            Linkage::Typeguid,
            0,
            store.primitive_count(),
            Direction::Forward,
        );
        assert_eq!(collect(&mut it, &ctx), vec![t]);
        let mut clone = it.clone_iter();
        clone.reset();
        assert_eq!(collect(&mut clone, &ctx), vec![t]);
    }
}
