//! The `linksto` composite: primitives whose linkage lands in a sub-set.
//!
//! The mirror image of `isa`: where `isa` follows pointers out of its
//! sub-iterator, `linksto` emits the pointers themselves. A candidate id
//! is a member iff its primitive's slot `L` resolves into the sub-set.
//!
//! Candidates come from a *driver*: the planner passes a hint iterator
//! (an OR of VIP posting lists, typically) when it knows the target GUIDs,
//! and the full id window otherwise. No dedup is needed: each driver id is
//! emitted at most once.

use crate::budget::{Budget, Found, StatStep, Step, Tri};
use crate::engine::ExecCtx;
use crate::ids::{Linkage, PrimId};
use crate::iter::{resume_admit, AllIter, Direction, Iter, NullIter, Pos};
use crate::stats::{RangeEstimate, Stats};
use crate::store::{COST_FUNCTION_CALL, COST_PRIMITIVE};

#[derive(Debug, Clone, Default, PartialEq)]
enum LinksOp {
    #[default]
    Idle,
    /// Candidate followed, membership test pending on the sub.
    Testing { cand: PrimId, target: PrimId },
}

#[derive(Debug, Clone)]
pub struct LinksToIter {
    pub(crate) sub: Box<Iter>,
    pub(crate) linkage: Linkage,
    pub(crate) driver: Box<Iter>,
    /// The driver is a planner hint, not the plain id window.
    pub(crate) hinted: bool,
    pub(crate) low: PrimId,
    pub(crate) high: PrimId,
    pub(crate) dir: Direction,
    pub(crate) pos: Pos,
    pub(crate) ordering: Option<String>,
    pub(crate) stats: Option<Stats>,
    op: LinksOp,
    /// Statistics experiment progress (candidates tried, accepted).
    probe: (u64, u64),
}

impl LinksToIter {
    pub fn new(
        sub: Iter,
        linkage: Linkage,
        hint: Option<Iter>,
        low: PrimId,
        high: PrimId,
        dir: Direction,
    ) -> Iter {
        if sub.is_null() {
            return Iter::Null(NullIter);
        }
        let (driver, hinted) = match hint {
            Some(h) if !h.is_null() => (h, true),
            _ => (Iter::All(AllIter::new(low, high, dir)), false),
        };
        Iter::LinksTo(Box::new(LinksToIter {
            sub: Box::new(sub),
            linkage,
            driver: Box::new(driver),
            hinted,
            low,
            high: high.max(low),
            dir,
            pos: Pos::default(),
            ordering: None,
            stats: None,
            op: LinksOp::Idle,
            probe: (0, 0),
        }))
    }

    pub fn sorted(&self) -> bool {
        self.driver.sorted()
    }

    /// Resolve a candidate's linkage slot to a target id.
    fn follow(&self, ctx: &ExecCtx<'_>, budget: &mut Budget, cand: PrimId) -> Option<PrimId> {
        budget.charge(COST_PRIMITIVE);
        let prim = ctx.store.read_primitive(cand)?;
        let guid = prim.linkage_guid(self.linkage)?;
        budget.charge(COST_FUNCTION_CALL);
        ctx.store.id_from_guid(guid)
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
            let (cand, target) = match std::mem::take(&mut self.op) {
                LinksOp::Testing { cand, target } => (cand, target),
                LinksOp::Idle => match self.driver.next(ctx, budget) {
                    Step::Emit(cand) => {
                        if cand < self.low || cand >= self.high {
                            continue;
                        }
                        let Some(target) = self.follow(ctx, budget, cand) else {
                            continue;
                        };
                        (cand, target)
                    }
                    Step::Done => {
                        self.pos.eof = true;
                        return Step::Done;
                    }
                    Step::More => return Step::More,
                },
            };
            match self.sub.check(target, ctx, budget) {
                Tri::Yes => {
                    self.pos.last = Some(cand);
                    if resume_admit(&mut self.pos, self.dir, sorted, cand) {
                        return Step::Emit(cand);
                    }
                }
                Tri::No => {}
                Tri::More => {
                    self.op = LinksOp::Testing { cand, target };
                    return Step::More;
                }
            }
        }
    }

    pub fn find(&mut self, id: PrimId, ctx: &ExecCtx<'_>, budget: &mut Budget) -> Found {
        debug_assert!(self.sorted(), "find on unsorted linksto iterator");
        match self.driver.find(id, ctx, budget) {
            Found::At(at) => {
                // The driver landed on the first candidate at-or-beyond
                // `id`; it still has to pass the membership test, and so do
                // its successors until one sticks.
                self.pos.eof = false;
                self.pos.resume = None;
                self.op = LinksOp::Idle;
                match self.check(at, ctx, budget) {
                    Tri::Yes => {
                        self.pos.last = Some(at);
                        return Found::At(at);
                    }
                    Tri::No => {}
                    Tri::More => return Found::More,
                }
                match self.next(ctx, budget) {
                    Step::Emit(found) => Found::At(found),
                    Step::Done => Found::Done,
                    Step::More => Found::More,
                }
            }
            Found::Done => {
                self.pos.eof = true;
                Found::Done
            }
            Found::More => Found::More,
        }
    }

    pub fn check(&mut self, id: PrimId, ctx: &ExecCtx<'_>, budget: &mut Budget) -> Tri {
        if id < self.low || id >= self.high {
            return Tri::No;
        }
        if budget.exhausted() {
            return Tri::More;
        }
        let Some(target) = self.follow(ctx, budget, id) else {
            return Tri::No;
        };
        self.sub.check(target, ctx, budget)
    }

    pub fn statistics(&mut self, ctx: &ExecCtx<'_>, budget: &mut Budget) -> StatStep {
        const TRIALS: u64 = 5;
        if self.stats.is_some() {
            return StatStep::Ready;
        }
        match self.sub.statistics(ctx, budget) {
            StatStep::Ready => {}
            StatStep::More => return StatStep::More,
        }
        match self.driver.statistics(ctx, budget) {
            StatStep::Ready => {}
            StatStep::More => return StatStep::More,
        }
        let driver_stats = self.driver.stats().expect("driver statistics valid").clone();
        let sub_stats = self.sub.stats().expect("sub statistics valid").clone();

        // Sample a few driver candidates for the acceptance ratio. A
        // suspended pass restarts from scratch, so the hit count does too.
        while self.probe.0 < TRIALS {
            if budget.exhausted() {
                return StatStep::More;
            }
            self.probe.1 = 0;
            let mut probe_iter = self.driver.clone_iter();
            probe_iter.reset();
            // A single bounded pass; clones are cheap against posting lists.
            let mut tried = 0;
            while tried < TRIALS {
                match probe_iter.next(ctx, budget) {
                    Step::Emit(cand) => {
                        tried += 1;
                        if let Some(t) = self.follow(ctx, budget, cand) {
                            match self.sub.check(t, ctx, budget) {
                                Tri::Yes => self.probe.1 += 1,
                                Tri::No => {}
                                Tri::More => return StatStep::More,
                            }
                        }
                    }
                    Step::Done => break,
                    Step::More => return StatStep::More,
                }
            }
            self.probe.0 = tried.max(1);
            break;
        }

        let (trials, hits) = self.probe;
        let n = (driver_stats.n * hits.max(1) / trials.max(1)).max(1);
        let follow_cost = COST_PRIMITIVE + COST_FUNCTION_CALL;
        let next_cost = (driver_stats.next_cost + follow_cost + sub_stats.check_cost)
            * trials.max(1) as i64
            / hits.max(1) as i64;
        let check_cost = follow_cost + sub_stats.check_cost;
        let find_cost = driver_stats.find_cost + next_cost;
        let ordering = if self.sorted() {
            self.ordering.clone()
        } else {
            None
        };
        self.stats = Some(Stats::new(check_cost, next_cost, find_cost, n).with_ordering(ordering));
        StatStep::Ready
    }

    pub fn reset(&mut self) {
        self.sub.reset();
        self.driver.reset();
        self.pos = Pos::default();
        self.op = LinksOp::Idle;
    }

    pub fn range_estimate(&self) -> RangeEstimate {
        RangeEstimate::at_most(self.low, self.high, self.driver.range_estimate().n_max)
    }
}
