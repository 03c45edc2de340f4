//! The `all` leaf: every id in a window of the primitive id space.

use crate::budget::{Budget, Found, StatStep, Step, Tri};
use crate::ids::PrimId;
use crate::iter::{Direction, Pos};
use crate::stats::{RangeEstimate, Stats};
use crate::store::COST_FUNCTION_CALL;

/// Range iterator over `[low, high)`. Ids in the window are emitted whether
/// or not the primitive behind them still exists; downstream reads absorb
/// deletion holes by skipping.
#[derive(Debug, Clone)]
pub struct AllIter {
    pub(crate) low: PrimId,
    pub(crate) high: PrimId,
    pub(crate) dir: Direction,
    pub(crate) ordering: Option<String>,
    pub(crate) pos: Pos,
    pub(crate) stats: Option<Stats>,
}

impl AllIter {
    /// `high` is clamped to the store dateline by the planner before this
    /// is called.
    pub fn new(low: PrimId, high: PrimId, dir: Direction) -> Self {
        AllIter {
            low,
            high: high.max(low),
            dir,
            ordering: None,
            pos: Pos::default(),
            stats: None,
        }
    }

    pub fn with_ordering(mut self, ordering: Option<String>) -> Self {
        self.ordering = ordering;
        self
    }

    fn first(&self) -> Option<PrimId> {
        if self.low >= self.high {
            return None;
        }
        Some(match self.dir {
            Direction::Forward => self.low,
            Direction::Backward => self.high - 1,
        })
    }

    fn after(&self, id: PrimId) -> Option<PrimId> {
        match self.dir {
            Direction::Forward => {
                let next = id + 1;
                (next < self.high).then_some(next)
            }
            Direction::Backward => (id > self.low).then(|| id - 1),
        }
    }

    pub fn next(&mut self, budget: &mut Budget) -> Step {
        if self.pos.eof {
            return Step::Done;
        }
        if budget.exhausted() {
            return Step::More;
        }
        budget.charge(COST_FUNCTION_CALL);

        let cand = match self.pos.last {
            None => self.first(),
            Some(last) => self.after(last),
        };
        match cand {
            Some(id) => {
                self.pos.last = Some(id);
                Step::Emit(id)
            }
            None => {
                self.pos.eof = true;
                Step::Done
            }
        }
    }

    pub fn find(&mut self, id: PrimId, budget: &mut Budget) -> Found {
        if budget.exhausted() {
            return Found::More;
        }
        budget.charge(COST_FUNCTION_CALL);
        if self.low >= self.high {
            self.pos.eof = true;
            return Found::Done;
        }

        let hit = match self.dir {
            Direction::Forward => {
                let id = id.max(self.low);
                (id < self.high).then_some(id)
            }
            Direction::Backward => {
                let id = if id >= self.high { self.high - 1 } else { id };
                (id >= self.low && self.low < self.high).then_some(id)
            }
        };
        match hit {
            Some(id) => {
                self.pos.last = Some(id);
                self.pos.eof = false;
                Found::At(id)
            }
            None => {
                self.pos.eof = true;
                Found::Done
            }
        }
    }

    pub fn check(&mut self, id: PrimId, budget: &mut Budget) -> Tri {
        if budget.exhausted() {
            return Tri::More;
        }
        budget.charge(COST_FUNCTION_CALL);
        if id >= self.low && id < self.high {
            Tri::Yes
        } else {
            Tri::No
        }
    }

    pub fn statistics(&mut self, budget: &mut Budget) -> StatStep {
        if self.stats.is_none() {
            budget.charge(COST_FUNCTION_CALL);
            let n = self.high - self.low;
            self.stats = Some(
                Stats::new(COST_FUNCTION_CALL, COST_FUNCTION_CALL, COST_FUNCTION_CALL, n)
                    .with_ordering(self.ordering.clone()),
            );
        }
        StatStep::Ready
    }

    pub fn reset(&mut self) {
        self.pos = Pos::default();
    }

    pub fn range_estimate(&self) -> RangeEstimate {
        let n = match (self.pos.eof, self.pos.last) {
            (true, _) => 0,
            (false, None) => self.high - self.low,
            (false, Some(last)) => match self.dir {
                Direction::Forward => self.high - (last + 1),
                Direction::Backward => last - self.low,
            },
        };
        RangeEstimate::exact(self.low, self.high, n)
    }
}
