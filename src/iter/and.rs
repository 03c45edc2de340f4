//! The `and` composite: intersection of N sub-iterators.
//!
//! One sub-iterator is elected *producer* and emits candidates; the rest
//! `check` each candidate in cost order. Election happens in a statistics
//! *contest*: every competitor gets an equal slice of sampling, the sample
//! is verified against the other subs, and the cheapest projected producer
//! wins (first wins on ties, and the choice is serialised so it survives
//! thaw). A contest that proves the whole intersection tiny substitutes a
//! `fixed` iterator for the AND.
//!
//! The original owns an ordered cache of emitted ids, shared with clones;
//! a clone first replays the cache and only then drives its own
//! sub-iterators past the frontier.

use crate::budget::{Budget, Found, Step, Tri};
use crate::engine::ExecCtx;
use crate::error::{EngineError, EngineResult};
use crate::ids::PrimId;
use crate::iter::{resume_admit, Direction, Iter, NullIter, Pos};
use crate::stats::{RangeEstimate, Stats};
use crate::store::COST_FUNCTION_CALL;
use parking_lot::Mutex;
use std::sync::Arc;

/// Outcome of the AND statistics phase.
#[derive(Debug)]
pub(crate) enum AndStat {
    Ready,
    More,
    /// The contest enumerated the whole intersection; the caller replaces
    /// the AND with this fixed iterator.
    Substitute(super::FixedIter),
}

/// The elected execution plan.
#[derive(Debug, Clone)]
pub(crate) struct AndPlan {
    pub(crate) producer: usize,
    /// Non-producer subs in check order, cheapest first.
    pub(crate) check_order: Vec<usize>,
    /// Drive a find-against-find dual walk instead of produce-and-check.
    pub(crate) use_find: bool,
}

/// State shared between an original and its clones.
#[derive(Debug, Default)]
pub struct AndShared {
    pub(crate) stats: Option<Stats>,
    pub(crate) plan: Option<AndPlan>,
    /// Emitted ids in emission order; grows monotonically except on reset
    /// of the original.
    pub(crate) cache: Vec<PrimId>,
    pub(crate) cache_eof: bool,
}

/// In-flight sampling for one contest competitor.
#[derive(Debug, Clone)]
struct Trial {
    clones: Vec<Iter>,
    verified: Vec<PrimId>,
    trials: u64,
    accepts: u64,
    /// Pending candidate and position in the check sequence.
    chk: Option<(PrimId, usize)>,
    /// Producer clone ran dry: `verified` is the entire intersection.
    complete: bool,
}

#[derive(Debug, Clone)]
struct CandScore {
    idx: usize,
    n_est: u64,
    next_cost: i64,
    complete: Option<Vec<PrimId>>,
}

/// Suspended contest progress.
#[derive(Debug, Clone, Default)]
struct Contest {
    sub_stats_k: usize,
    i: usize,
    trial: Option<Trial>,
    results: Vec<CandScore>,
}

/// Call-state of the production machinery.
#[derive(Debug, Clone, Default, PartialEq)]
enum AndOp {
    #[default]
    Idle,
    /// Mid check-chain for a produced candidate.
    Checking { cand: PrimId, k: usize },
    /// Mid dual walk: current agreement target, next sub to ask, and how
    /// many subs in a row already agreed.
    Walk { cand: PrimId, k: usize, matched: usize },
}

#[derive(Debug, Clone)]
pub struct AndIter {
    pub(crate) subs: Vec<Iter>,
    pub(crate) low: PrimId,
    pub(crate) high: PrimId,
    pub(crate) dir: Direction,
    pub(crate) ordering_req: Option<String>,
    pub(crate) setsize_hint: Option<u64>,
    pub(crate) pagesize_hint: Option<u64>,
    pub(crate) shared: Arc<Mutex<AndShared>>,
    /// Read offset into the shared cache.
    pub(crate) read_off: usize,
    /// How many cache entries this handle's own subs are already past.
    pub(crate) produced: usize,
    pub(crate) pos: Pos,
    pub(crate) is_original: bool,
    stats_local: Option<Stats>,
    plan_local: Option<AndPlan>,
    op: AndOp,
    contest: Option<Contest>,
    check_at: Option<(PrimId, usize)>,
}

enum Produce {
    Got(PrimId),
    Exhausted,
    More,
}

impl AndIter {
    /// Compose an intersection. Any null sub collapses the whole AND; a
    /// single sub stands for itself; a sorted sub whose direction fights
    /// the AND's is rejected here, at compose time.
    pub fn compose(
        subs: Vec<Iter>,
        low: PrimId,
        high: PrimId,
        dir: Direction,
        ordering_req: Option<String>,
    ) -> EngineResult<Iter> {
        if subs.iter().any(Iter::is_null) {
            return Ok(Iter::Null(NullIter));
        }
        if subs.is_empty() {
            return Err(EngineError::Internal("and of zero sub-iterators".into()));
        }
        for s in &subs {
            if s.sorted() && s.direction() != dir {
                return Err(EngineError::Internal(format!(
                    "and sub direction mismatch ({:?} under {:?})",
                    s.direction(),
                    dir
                )));
            }
        }
        let mut subs = subs;
        if subs.len() == 1 {
            return Ok(subs.pop().unwrap());
        }
        Ok(Iter::And(Box::new(AndIter {
            subs,
            low,
            high,
            dir,
            ordering_req,
            setsize_hint: None,
            pagesize_hint: None,
            shared: Arc::new(Mutex::new(AndShared::default())),
            read_off: 0,
            produced: 0,
            pos: Pos::default(),
            is_original: true,
            stats_local: None,
            plan_local: None,
            op: AndOp::Idle,
            contest: None,
            check_at: None,
        })))
    }

    pub(crate) fn mark_clone(&mut self) {
        self.is_original = false;
    }

    pub fn sorted(&self) -> bool {
        // The emitted order is the producer's; the contest only elects
        // sorted producers while any exist.
        self.subs.iter().any(Iter::sorted)
    }

    pub fn stats(&self) -> Option<&Stats> {
        self.stats_local.as_ref()
    }

    /// Adopt previously shared statistics and plan (clone or thaw rebind).
    fn adopt_shared(&mut self) -> bool {
        if self.stats_local.is_some() {
            return true;
        }
        let sh = self.shared.lock();
        if let (Some(stats), Some(plan)) = (sh.stats.clone(), sh.plan.clone()) {
            self.stats_local = Some(stats);
            self.plan_local = Some(plan);
            return true;
        }
        false
    }

    pub fn next(&mut self, ctx: &ExecCtx<'_>, budget: &mut Budget) -> Step {
        if self.pos.eof {
            return Step::Done;
        }
        let sorted = self.sorted();
        loop {
            if budget.exhausted() {
                return Step::More;
            }
            // Serve the shared cache first.
            {
                let sh = self.shared.lock();
                if self.read_off > sh.cache.len() {
                    // The original was reset under us; fall back in.
                    self.read_off = sh.cache.len();
                }
                if self.read_off < sh.cache.len() {
                    let id = sh.cache[self.read_off];
                    drop(sh);
                    self.read_off += 1;
                    budget.charge(COST_FUNCTION_CALL);
                    self.pos.last = Some(id);
                    if resume_admit(&mut self.pos, self.dir, sorted, id) {
                        return Step::Emit(id);
                    }
                    continue;
                }
                if sh.cache_eof {
                    self.pos.eof = true;
                    return Step::Done;
                }
            }
            // Past the cache: extend it with our own subs.
            match self.produce_one(ctx, budget) {
                Produce::Got(v) => {
                    self.produced += 1;
                    let mut sh = self.shared.lock();
                    if self.produced > sh.cache.len() {
                        sh.cache.push(v);
                    }
                }
                Produce::Exhausted => {
                    let mut sh = self.shared.lock();
                    sh.cache_eof = true;
                }
                Produce::More => return Step::More,
            }
        }
    }

    /// Run the production machinery until one verified id falls out.
    fn produce_one(&mut self, ctx: &ExecCtx<'_>, budget: &mut Budget) -> Produce {
        let plan = self
            .plan_local
            .clone()
            .expect("and production before election");

        // A handle whose subs lag the cache fast-forwards a sorted
        // producer instead of replaying the whole prefix.
        if self.op == AndOp::Idle {
            let (cache_len, cache_last) = {
                let sh = self.shared.lock();
                (sh.cache.len(), sh.cache.last().copied())
            };
            if self.produced < cache_len && !plan.use_find {
                if let Some(target) = cache_last {
                    if self.subs[plan.producer].sorted() {
                        match self.subs[plan.producer].find(target, ctx, budget) {
                            Found::At(_) => self.produced = cache_len,
                            Found::Done => return Produce::Exhausted,
                            Found::More => return Produce::More,
                        }
                    }
                    // An unsorted producer replays; the cache-length guard
                    // in next() keeps the replayed ids from re-caching.
                }
            }
        }

        if plan.use_find {
            self.produce_walk(ctx, budget)
        } else {
            self.produce_check(ctx, budget, &plan)
        }
    }

    fn produce_check(
        &mut self,
        ctx: &ExecCtx<'_>,
        budget: &mut Budget,
        plan: &AndPlan,
    ) -> Produce {
        loop {
            if budget.exhausted() {
                return Produce::More;
            }
            let (cand, start_k) = match self.op {
                AndOp::Checking { cand, k } => (cand, k),
                _ => match self.subs[plan.producer].next(ctx, budget) {
                    Step::Emit(c) => {
                        if c < self.low || c >= self.high {
                            continue;
                        }
                        (c, 0)
                    }
                    Step::Done => {
                        self.op = AndOp::Idle;
                        return Produce::Exhausted;
                    }
                    Step::More => return Produce::More,
                },
            };
            let mut rejected = false;
            for ki in start_k..plan.check_order.len() {
                let j = plan.check_order[ki];
                match self.subs[j].check(cand, ctx, budget) {
                    Tri::Yes => {}
                    Tri::No => {
                        rejected = true;
                        break;
                    }
                    Tri::More => {
                        self.op = AndOp::Checking { cand, k: ki };
                        return Produce::More;
                    }
                }
            }
            self.op = AndOp::Idle;
            if !rejected {
                return Produce::Got(cand);
            }
        }
    }

    /// Dual walk: every sub repositions onto the current agreement target
    /// with `find`; a target all subs agree on is in the intersection.
    fn produce_walk(&mut self, ctx: &ExecCtx<'_>, budget: &mut Budget) -> Produce {
        let n = self.subs.len();
        let (mut cand, mut k, mut matched) = match self.op {
            AndOp::Walk { cand, k, matched } => (cand, k, matched),
            _ => {
                let base = {
                    let sh = self.shared.lock();
                    sh.cache.last().copied()
                };
                let start = match base {
                    None => match self.dir {
                        Direction::Forward => self.low,
                        Direction::Backward => self.high.saturating_sub(1),
                    },
                    Some(l) => match self.dir {
                        Direction::Forward => l + 1,
                        Direction::Backward => {
                            if l == 0 {
                                return Produce::Exhausted;
                            }
                            l - 1
                        }
                    },
                };
                (start, 0usize, 0usize)
            }
        };
        loop {
            if budget.exhausted() {
                self.op = AndOp::Walk { cand, k, matched };
                return Produce::More;
            }
            match self.subs[k].find(cand, ctx, budget) {
                Found::At(x) => {
                    if x == cand {
                        matched += 1;
                    } else {
                        cand = x;
                        matched = 1;
                    }
                    if matched >= n {
                        self.op = AndOp::Idle;
                        self.produced = self.produced.max({
                            let sh = self.shared.lock();
                            sh.cache.len()
                        });
                        return Produce::Got(cand);
                    }
                    k = (k + 1) % n;
                }
                Found::Done => {
                    self.op = AndOp::Idle;
                    return Produce::Exhausted;
                }
                Found::More => {
                    self.op = AndOp::Walk { cand, k, matched };
                    return Produce::More;
                }
            }
        }
    }

    pub fn find(&mut self, id: PrimId, ctx: &ExecCtx<'_>, budget: &mut Budget) -> Found {
        debug_assert!(self.sorted(), "find on unsorted and iterator");
        self.pos.resume = None;
        // The cached prefix is in emission order, hence sorted here.
        {
            let sh = self.shared.lock();
            let idx = match self.dir {
                Direction::Forward => sh.cache.partition_point(|&c| c < id),
                Direction::Backward => sh.cache.partition_point(|&c| c > id),
            };
            if idx < sh.cache.len() {
                let found = sh.cache[idx];
                drop(sh);
                budget.charge(COST_FUNCTION_CALL);
                self.read_off = idx + 1;
                self.pos.last = Some(found);
                self.pos.eof = false;
                return Found::At(found);
            }
            if sh.cache_eof {
                self.pos.eof = true;
                return Found::Done;
            }
        }
        // Beyond the cache: drive production until we reach the target.
        loop {
            match self.next(ctx, budget) {
                Step::Emit(x) => {
                    if x == id || self.dir.precedes(id, x) {
                        return Found::At(x);
                    }
                }
                Step::Done => return Found::Done,
                Step::More => return Found::More,
            }
        }
    }

    pub fn check(&mut self, id: PrimId, ctx: &ExecCtx<'_>, budget: &mut Budget) -> Tri {
        if id < self.low || id >= self.high {
            return Tri::No;
        }
        // Membership needs every sub to agree; resume a suspended pass.
        let order: Vec<usize> = match &self.plan_local {
            Some(plan) => {
                let mut o = plan.check_order.clone();
                o.push(plan.producer);
                o
            }
            None => (0..self.subs.len()).collect(),
        };
        let start = match self.check_at.take() {
            Some((saved, k)) if saved == id => k,
            _ => 0,
        };
        for ki in start..order.len() {
            match self.subs[order[ki]].check(id, ctx, budget) {
                Tri::Yes => {}
                Tri::No => return Tri::No,
                Tri::More => {
                    self.check_at = Some((id, ki));
                    return Tri::More;
                }
            }
        }
        Tri::Yes
    }

    pub(crate) fn statistics(&mut self, ctx: &ExecCtx<'_>, budget: &mut Budget) -> AndStat {
        if self.stats_local.is_some() || self.adopt_shared() {
            return AndStat::Ready;
        }
        let n = self.subs.len();
        let sample_max = ctx.config.engine.contest_sample as usize;
        let trial_cap = (ctx.config.engine.contest_sample * 4).max(8);

        let mut contest = self.contest.take().unwrap_or_default();

        // Phase 0: every sub needs valid statistics first. A sub may
        // substitute itself here (an ISA materialising, say).
        while contest.sub_stats_k < n {
            let k = contest.sub_stats_k;
            match self.subs[k].statistics(ctx, budget) {
                crate::budget::StatStep::Ready => contest.sub_stats_k += 1,
                crate::budget::StatStep::More => {
                    self.contest = Some(contest);
                    return AndStat::More;
                }
            }
        }

        // Phase 1: one bounded trial per competitor, in index order.
        while contest.i < n {
            let i = contest.i;
            let producer_sorted = self.subs[i].sorted();
            let any_sorted = self.subs.iter().any(Iter::sorted);
            // Unsorted producers only compete when nothing sorted exists:
            // the AND's emitted order is the producer's.
            if any_sorted && !producer_sorted {
                contest.results.push(CandScore {
                    idx: i,
                    n_est: u64::MAX,
                    next_cost: i64::MAX / 4,
                    complete: None,
                });
                contest.i += 1;
                continue;
            }
            let trial = contest.trial.get_or_insert_with(|| Trial {
                clones: self
                    .subs
                    .iter()
                    .map(|s| {
                        let mut c = s.clone_iter();
                        c.reset();
                        c
                    })
                    .collect(),
                verified: Vec::new(),
                trials: 0,
                accepts: 0,
                chk: None,
                complete: false,
            });
            let mut suspended = false;
            while trial.verified.len() < sample_max
                && trial.trials < trial_cap
                && !trial.complete
            {
                if budget.exhausted() {
                    suspended = true;
                    break;
                }
                let (cand, start_k) = match trial.chk.take() {
                    Some(pending) => pending,
                    None => match trial.clones[i].next(ctx, budget) {
                        Step::Emit(c) => {
                            if c < self.low || c >= self.high {
                                continue;
                            }
                            trial.trials += 1;
                            (c, 0)
                        }
                        Step::Done => {
                            trial.complete = true;
                            continue;
                        }
                        Step::More => {
                            suspended = true;
                            break;
                        }
                    },
                };
                let mut verdict = Some(true);
                let mut k = start_k;
                while k < n {
                    if k == i {
                        k += 1;
                        continue;
                    }
                    match trial.clones[k].check(cand, ctx, budget) {
                        Tri::Yes => k += 1,
                        Tri::No => {
                            verdict = Some(false);
                            break;
                        }
                        Tri::More => {
                            trial.chk = Some((cand, k));
                            verdict = None;
                            break;
                        }
                    }
                }
                match verdict {
                    Some(true) => {
                        trial.accepts += 1;
                        trial.verified.push(cand);
                    }
                    Some(false) => {}
                    None => {
                        suspended = true;
                        break;
                    }
                }
            }
            if suspended {
                self.contest = Some(contest);
                return AndStat::More;
            }
            // Score this competitor.
            let trial = contest.trial.take().expect("trial in flight");
            let ss = self.subs[i].stats().expect("sub statistics valid").clone();
            let check_sum: i64 = self
                .subs
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, s)| s.stats().map(|st| st.check_cost).unwrap_or(COST_FUNCTION_CALL))
                .sum();
            let (n_est, complete) = if trial.complete {
                (trial.accepts, Some(trial.verified.clone()))
            } else {
                let ratio_num = trial.accepts.max(1);
                let ratio_den = trial.trials.max(1);
                ((ss.n * ratio_num / ratio_den).max(trial.accepts), None)
            };
            let inflate_num = trial.trials.max(1) as i64;
            let inflate_den = trial.accepts.max(1) as i64;
            let next_cost = (ss.next_cost + check_sum) * inflate_num / inflate_den;
            contest.results.push(CandScore {
                idx: i,
                n_est,
                next_cost,
                complete,
            });
            contest.i += 1;
        }

        // Phase 2: election, first wins on ties.
        let winner = contest
            .results
            .iter()
            .min_by_key(|r| r.next_cost.saturating_mul(r.n_est.min(i64::MAX as u64) as i64))
            .expect("at least one competitor")
            .clone();

        if let Some(ids) = &winner.complete {
            if ids.len() as u64 <= ctx.config.engine.and_substitute_max {
                tracing::debug!(n = ids.len(), "and contest substituting fixed iterator");
                let fixed =
                    super::FixedIter::from_sorted_ids(ids.clone(), self.low, self.high, self.dir);
                return AndStat::Substitute(fixed);
            }
        }

        let mut check_order: Vec<usize> = (0..n).filter(|&j| j != winner.idx).collect();
        check_order.sort_by_key(|&j| {
            self.subs[j]
                .stats()
                .map(|s| s.check_cost)
                .unwrap_or(i64::MAX / 4)
        });
        let all_sorted = self.subs.iter().all(Iter::sorted);
        let find_sum: i64 = self
            .subs
            .iter()
            .filter_map(|s| s.stats().map(|st| st.find_cost))
            .sum();
        let use_find = all_sorted && find_sum * 2 < winner.next_cost;

        let check_cost: i64 = self
            .subs
            .iter()
            .filter_map(|s| s.stats().map(|st| st.check_cost))
            .sum();
        let ordering = match &self.ordering_req {
            Some(req) if self.subs[winner.idx].ordering() == Some(req.as_str()) => {
                Some(req.clone())
            }
            _ => None,
        };
        let stats = Stats::new(check_cost, winner.next_cost, find_sum, winner.n_est)
            .with_ordering(ordering);
        let plan = AndPlan {
            producer: winner.idx,
            check_order,
            use_find,
        };
        tracing::debug!(
            producer = plan.producer,
            use_find = plan.use_find,
            n = stats.n,
            "and contest elected producer"
        );
        {
            let mut sh = self.shared.lock();
            sh.stats = Some(stats.clone());
            sh.plan = Some(plan.clone());
        }
        self.stats_local = Some(stats);
        self.plan_local = Some(plan);
        self.contest = None;
        AndStat::Ready
    }

    /// Rebind to a still-live original's shared state (cursor thaw).
    /// Returns true when statistics and plan came along.
    pub(crate) fn rebind(&mut self, shared: Arc<Mutex<AndShared>>, read_off: usize) -> bool {
        self.shared = shared;
        self.is_original = false;
        self.read_off = read_off;
        self.produced = 0;
        self.adopt_shared()
    }

    /// Install an already-valid plan and statistics (cursor thaw).
    pub(crate) fn install_plan(&mut self, stats: Stats, producer: usize) {
        let mut check_order: Vec<usize> = (0..self.subs.len()).filter(|&j| j != producer).collect();
        check_order.sort_by_key(|&j| {
            self.subs[j]
                .stats()
                .map(|s| s.check_cost)
                .unwrap_or(i64::MAX / 4)
        });
        let plan = AndPlan {
            producer,
            check_order,
            use_find: false,
        };
        {
            let mut sh = self.shared.lock();
            if sh.stats.is_none() {
                sh.stats = Some(stats.clone());
                sh.plan = Some(plan.clone());
            }
        }
        self.stats_local = Some(stats);
        self.plan_local = Some(plan);
    }

    pub(crate) fn plan_producer(&self) -> Option<usize> {
        self.plan_local.as_ref().map(|p| p.producer)
    }

    /// Override the elected producer (cursor STATE carries the winner so
    /// the first-wins election survives thaw).
    pub(crate) fn set_producer(&mut self, producer: usize) {
        if producer >= self.subs.len() {
            return;
        }
        if let Some(plan) = &mut self.plan_local {
            if plan.producer != producer {
                let mut check_order: Vec<usize> =
                    (0..self.subs.len()).filter(|&j| j != producer).collect();
                check_order.sort_by_key(|&j| {
                    self.subs[j]
                        .stats()
                        .map(|s| s.check_cost)
                        .unwrap_or(i64::MAX / 4)
                });
                plan.producer = producer;
                plan.check_order = check_order;
                let mut sh = self.shared.lock();
                sh.plan = Some(plan.clone());
            }
        }
    }

    pub fn reset(&mut self) {
        for s in self.subs.iter_mut() {
            s.reset();
        }
        if self.is_original {
            let mut sh = self.shared.lock();
            sh.cache.clear();
            sh.cache_eof = false;
        }
        self.read_off = 0;
        self.produced = 0;
        self.pos = Pos::default();
        self.op = AndOp::Idle;
        self.check_at = None;
    }

    pub fn range_estimate(&self) -> RangeEstimate {
        let sh = self.shared.lock();
        if sh.cache_eof {
            return RangeEstimate::exact(
                self.low,
                self.high,
                (sh.cache.len() - self.read_off.min(sh.cache.len())) as u64,
            );
        }
        drop(sh);
        let n_max = self
            .subs
            .iter()
            .map(|s| s.range_estimate().n_max)
            .min()
            .unwrap_or(0);
        RangeEstimate::at_most(self.low, self.high, n_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::iter::{AllIter, FixedIter};
    use crate::resource::ResourceCache;
    use crate::store::MemStore;

    fn fixed(ids: Vec<PrimId>) -> Iter {
        Iter::Fixed(FixedIter::from_sorted_ids(
            ids,
            0,
            2_000_000,
            Direction::Forward,
        ))
    }

    fn with_ctx<R>(f: impl FnOnce(&ExecCtx<'_>) -> R) -> R {
        let store = MemStore::new();
        let resources = ResourceCache::new(1 << 20);
        let config = EngineConfig::default();
        let ctx = ExecCtx {
            store: &store,
            resources: &resources,
            config: &config,
        };
        f(&ctx)
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
    fn test_intersection_substitutes_when_tiny() {
        with_ctx(|ctx| {
            let mut it = AndIter::compose(
                vec![fixed(vec![2, 3, 5, 7, 11]), fixed(vec![3, 5, 9, 11, 13])],
                0,
                2_000_000,
                Direction::Forward,
                None,
            )
            .unwrap();
            assert_eq!(collect(&mut it, ctx), vec![3, 5, 11]);
            // 3 verified ids under the substitution cap: now a fixed.
            assert!(matches!(it, Iter::Fixed(_)));
        });
    }

    #[test]
    fn test_large_intersection_stays_and() {
        with_ctx(|ctx| {
            let a: Vec<PrimId> = (0..100).map(|i| i * 2).collect();
            let b: Vec<PrimId> = (0..100).map(|i| i * 3).collect();
            let expect: Vec<PrimId> = (0..34).map(|i| i * 6).filter(|&x| x < 200).collect();
            let mut it = AndIter::compose(
                vec![fixed(a), fixed(b)],
                0,
                2_000_000,
                Direction::Forward,
                None,
            )
            .unwrap();
            assert_eq!(collect(&mut it, ctx), expect);
            assert!(matches!(it, Iter::And(_)));
        });
    }

    #[test]
    fn test_null_sub_collapses() {
        let it = AndIter::compose(
            vec![fixed(vec![1]), Iter::Null(NullIter)],
            0,
            100,
            Direction::Forward,
            None,
        )
        .unwrap();
        assert!(it.is_null());
    }

    #[test]
    fn test_direction_mismatch_rejected() {
        let back = Iter::Fixed(FixedIter::from_sorted_ids(
            vec![1, 2],
            0,
            100,
            Direction::Backward,
        ));
        let err = AndIter::compose(
            vec![fixed(vec![1, 2]), back],
            0,
            100,
            Direction::Forward,
            None,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_budgeted_needle_in_haystack() {
        with_ctx(|ctx| {
            // S4: all[0..1_000_000] AND fixed{999_999}, budget 100 per call.
            let all = Iter::All(AllIter::new(0, 1_000_000, Direction::Forward));
            let needle = fixed(vec![999_999]);
            let mut it =
                AndIter::compose(vec![all, needle], 0, 1_000_000, Direction::Forward, None)
                    .unwrap();
            let mut out = Vec::new();
            let mut calls = 0u64;
            loop {
                let mut b = Budget::new(100);
                calls += 1;
                match it.next(ctx, &mut b) {
                    Step::Emit(id) => out.push(id),
                    Step::Done => break,
                    Step::More => {
                        assert!(calls < 10_000_000, "no progress under budget");
                    }
                }
            }
            assert_eq!(out, vec![999_999]);
        });
    }

    #[test]
    fn test_clone_replays_cache() {
        with_ctx(|ctx| {
            let a: Vec<PrimId> = (0..60).collect();
            let b: Vec<PrimId> = (0..60).filter(|x| x % 2 == 0).collect();
            let mut it = AndIter::compose(
                vec![fixed(a), fixed(b)],
                0,
                2_000_000,
                Direction::Forward,
                None,
            )
            .unwrap();
            let mut budget = Budget::unlimited();
            let mut first = Vec::new();
            for _ in 0..5 {
                if let Step::Emit(id) = it.next(ctx, &mut budget) {
                    first.push(id);
                }
            }
            let mut clone = it.clone_iter();
            clone.reset();
            let from_clone = collect(&mut clone, ctx);
            let mut rest = collect(&mut it, ctx);
            let mut full = first;
            full.append(&mut rest);
            assert_eq!(from_clone, full);
        });
    }

    #[test]
    fn test_find_after_emit_returns_same() {
        with_ctx(|ctx| {
            let a: Vec<PrimId> = (0..100).collect();
            let b: Vec<PrimId> = (0..100).filter(|x| x % 5 == 0).collect();
            let mut it = AndIter::compose(
                vec![fixed(a), fixed(b)],
                0,
                2_000_000,
                Direction::Forward,
                None,
            )
            .unwrap();
            let mut budget = Budget::unlimited();
            let Step::Emit(first) = it.next(ctx, &mut budget) else {
                panic!("expected an id");
            };
            assert_eq!(it.find(first, ctx, &mut budget), Found::At(first));
        });
    }
}
