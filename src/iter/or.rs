//! The `or` composite: union with duplicate suppression.
//!
//! Two regimes, fixed at compose time: when every branch is sorted in the
//! union's direction the branches are merged head-to-head and duplicates
//! collapse for free; otherwise branches drain sequentially through a
//! hashed seen-set.

use crate::budget::{Budget, Found, StatStep, Step, Tri};
use crate::engine::ExecCtx;
use crate::error::{EngineError, EngineResult};
use crate::ids::PrimId;
use crate::iter::{resume_admit, Direction, IdSet, Iter, NullIter, Pos};
use crate::stats::{RangeEstimate, Stats};
use crate::store::COST_FUNCTION_CALL;

#[derive(Debug, Clone)]
pub struct OrIter {
    pub(crate) subs: Vec<Iter>,
    pub(crate) low: PrimId,
    pub(crate) high: PrimId,
    pub(crate) dir: Direction,
    /// All branches sorted in `dir`: merge instead of hashing.
    pub(crate) merge: bool,
    pub(crate) seen: IdSet,
    /// Merge mode: pending head per branch (None = needs a load).
    pub(crate) heads: Vec<Option<PrimId>>,
    pub(crate) spent: Vec<bool>,
    /// Sequential mode: branch currently draining.
    pub(crate) active: usize,
    pub(crate) pos: Pos,
    pub(crate) ordering_req: Option<String>,
    pub(crate) masquerade: Option<String>,
    pub(crate) stats: Option<Stats>,
    /// Saved progress of a suspended `check`.
    pub(crate) check_at: Option<(PrimId, usize)>,
}

impl OrIter {
    /// Null branches vanish; no branches left means the union is null; a
    /// single branch stands for itself.
    pub fn compose(
        subs: Vec<Iter>,
        low: PrimId,
        high: PrimId,
        dir: Direction,
        ordering_req: Option<String>,
    ) -> EngineResult<Iter> {
        let mut subs: Vec<Iter> = subs.into_iter().filter(|s| !s.is_null()).collect();
        if subs.is_empty() {
            return Ok(Iter::Null(NullIter));
        }
        for s in &subs {
            if s.sorted() && s.direction() != dir {
                return Err(EngineError::Internal(format!(
                    "or branch direction mismatch ({:?} under {:?})",
                    s.direction(),
                    dir
                )));
            }
        }
        if subs.len() == 1 {
            return Ok(subs.pop().unwrap());
        }
        if ordering_req.is_some() {
            // Ordered branches drain first when the caller asked for an
            // ordering, so a prefix of the union comes out ordered even in
            // the hashed regime.
            subs.sort_by_key(|s| !s.sorted());
        }
        let merge = subs.iter().all(|s| s.sorted());
        let n = subs.len();
        Ok(Iter::Or(Box::new(OrIter {
            subs,
            low,
            high,
            dir,
            merge,
            seen: IdSet::new(),
            heads: vec![None; n],
            spent: vec![false; n],
            active: 0,
            pos: Pos::default(),
            ordering_req,
            masquerade: None,
            stats: None,
            check_at: None,
        })))
    }

    pub fn sorted(&self) -> bool {
        self.merge
    }

    pub fn set_masquerade(&mut self, recipe: String) {
        self.masquerade = Some(recipe);
    }

    fn in_window(&self, id: PrimId) -> bool {
        id >= self.low && id < self.high
    }

    pub fn next(&mut self, ctx: &ExecCtx<'_>, budget: &mut Budget) -> Step {
        if self.pos.eof {
            return Step::Done;
        }
        if self.merge {
            self.next_merge(ctx, budget)
        } else {
            self.next_hashed(ctx, budget)
        }
    }

    fn next_merge(&mut self, ctx: &ExecCtx<'_>, budget: &mut Budget) -> Step {
        loop {
            if budget.exhausted() {
                return Step::More;
            }
            // Load missing heads; window filtering happens here so heads
            // always hold admissible candidates.
            for i in 0..self.subs.len() {
                while !self.spent[i] && self.heads[i].is_none() {
                    match self.subs[i].next(ctx, budget) {
                        Step::Emit(id) if self.in_window(id) => self.heads[i] = Some(id),
                        Step::Emit(_) => continue,
                        Step::Done => self.spent[i] = true,
                        Step::More => return Step::More,
                    }
                }
            }
            let mut best: Option<PrimId> = None;
            for head in self.heads.iter().flatten() {
                best = Some(match best {
                    None => *head,
                    Some(b) if self.dir.precedes(*head, b) => *head,
                    Some(b) => b,
                });
            }
            let Some(id) = best else {
                self.pos.eof = true;
                return Step::Done;
            };
            budget.charge(COST_FUNCTION_CALL);
            // Consume every branch sitting on the winner: that is the
            // entire duplicate suppression in merge mode.
            for head in self.heads.iter_mut() {
                if *head == Some(id) {
                    *head = None;
                }
            }
            self.pos.last = Some(id);
            if resume_admit(&mut self.pos, self.dir, true, id) {
                return Step::Emit(id);
            }
        }
    }

    fn next_hashed(&mut self, ctx: &ExecCtx<'_>, budget: &mut Budget) -> Step {
        while self.active < self.subs.len() {
            if budget.exhausted() {
                return Step::More;
            }
            match self.subs[self.active].next(ctx, budget) {
                Step::Emit(id) => {
                    budget.charge(COST_FUNCTION_CALL);
                    if !self.in_window(id) || !self.seen.insert(id) {
                        continue;
                    }
                    self.pos.last = Some(id);
                    if resume_admit(&mut self.pos, self.dir, false, id) {
                        return Step::Emit(id);
                    }
                }
                Step::Done => self.active += 1,
                Step::More => return Step::More,
            }
        }
        self.pos.eof = true;
        Step::Done
    }

    pub fn find(&mut self, id: PrimId, ctx: &ExecCtx<'_>, budget: &mut Budget) -> Found {
        debug_assert!(self.merge, "find on unsorted or iterator");
        // Targets outside the window clamp to its admissible edge so a
        // wide-windowed branch is not mistaken for an exhausted one.
        let id = match self.dir {
            Direction::Forward => id.max(self.low),
            Direction::Backward => id.min(self.high.saturating_sub(1)),
        };
        // Reposition every branch, then serve the best head via next.
        for i in 0..self.subs.len() {
            match self.subs[i].find(id, ctx, budget) {
                Found::At(x) => {
                    self.heads[i] = self.in_window(x).then_some(x);
                    self.spent[i] = self.heads[i].is_none();
                }
                Found::Done => {
                    self.heads[i] = None;
                    self.spent[i] = true;
                }
                Found::More => return Found::More,
            }
        }
        self.pos.eof = false;
        self.pos.resume = None;
        match self.next_merge(ctx, budget) {
            Step::Emit(found) => Found::At(found),
            Step::Done => Found::Done,
            Step::More => Found::More,
        }
    }

    pub fn check(&mut self, id: PrimId, ctx: &ExecCtx<'_>, budget: &mut Budget) -> Tri {
        if !self.in_window(id) {
            return Tri::No;
        }
        let start = match self.check_at.take() {
            Some((saved, k)) if saved == id => k,
            _ => 0,
        };
        for k in start..self.subs.len() {
            match self.subs[k].check(id, ctx, budget) {
                Tri::Yes => return Tri::Yes,
                Tri::No => continue,
                Tri::More => {
                    self.check_at = Some((id, k));
                    return Tri::More;
                }
            }
        }
        Tri::No
    }

    pub fn statistics(&mut self, ctx: &ExecCtx<'_>, budget: &mut Budget) -> StatStep {
        if self.stats.is_some() {
            return StatStep::Ready;
        }
        for sub in self.subs.iter_mut() {
            match sub.statistics(ctx, budget) {
                StatStep::Ready => {}
                StatStep::More => return StatStep::More,
            }
        }
        let mut n = 0u64;
        let mut next_cost = COST_FUNCTION_CALL;
        let mut check_cost = 0;
        let mut find_cost = 0;
        for sub in &self.subs {
            let s = sub.stats().expect("branch statistics just completed");
            n = n.saturating_add(s.n);
            next_cost = next_cost.max(s.next_cost);
            check_cost += s.check_cost;
            find_cost += s.find_cost;
        }
        let ordering = match (&self.ordering_req, self.merge) {
            (Some(req), true)
                if self
                    .subs
                    .iter()
                    .all(|s| s.ordering() == Some(req.as_str())) =>
            {
                Some(req.clone())
            }
            _ => None,
        };
        self.stats = Some(Stats::new(check_cost, next_cost, find_cost, n).with_ordering(ordering));
        StatStep::Ready
    }

    pub fn reset(&mut self) {
        for s in self.subs.iter_mut() {
            s.reset();
        }
        self.seen = IdSet::new();
        self.heads = vec![None; self.subs.len()];
        self.spent = vec![false; self.subs.len()];
        self.active = 0;
        self.pos = Pos::default();
        self.check_at = None;
    }

    pub fn range_estimate(&self) -> RangeEstimate {
        let mut n_max = 0u64;
        for sub in &self.subs {
            n_max = n_max.saturating_add(sub.range_estimate().n_max);
        }
        RangeEstimate::at_most(self.low, self.high, n_max)
    }
}
