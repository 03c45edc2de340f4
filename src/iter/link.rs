//! Posting-list leaves: `gmap`, `vip` and `hmap`.
//!
//! All three walk a sorted posting list handed out by the store; they
//! differ only in how the list is addressed, which is also what their
//! frozen SET records.

use crate::budget::{Budget, Found, StatStep, Step, Tri};
use crate::ids::{Guid, Linkage, PrimId};
use crate::iter::{Direction, Pos, PrimSummary};
use crate::stats::{RangeEstimate, Stats};
use crate::store::{
    PostingList, PrimitiveStore, COST_FUNCTION_CALL, COST_GMAP_ARRAY, COST_GMAP_ELEMENT,
};

/// How the posting list was addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSource {
    /// All primitives whose slot `linkage` points at `guid`.
    Gmap { linkage: Linkage, guid: Guid },
    /// All primitives of type `typeguid` whose slot `linkage` points at
    /// `endpoint`.
    Vip {
        endpoint: PrimId,
        linkage: Linkage,
        typeguid: Guid,
    },
    /// All primitives named `name` (via the name hash).
    NameHash { name: String },
}

#[derive(Debug, Clone)]
pub struct LinkIter {
    pub(crate) source: LinkSource,
    pub(crate) postings: PostingList,
    /// Window into `postings` covering `[low, high)`.
    pub(crate) lo_idx: usize,
    pub(crate) hi_idx: usize,
    /// Next traversal offset within the window.
    pub(crate) idx: usize,
    pub(crate) low: PrimId,
    pub(crate) high: PrimId,
    pub(crate) dir: Direction,
    pub(crate) pos: Pos,
    pub(crate) touched: bool,
    pub(crate) ordering: Option<String>,
    pub(crate) stats: Option<Stats>,
}

impl LinkIter {
    pub fn new(
        store: &dyn PrimitiveStore,
        source: LinkSource,
        low: PrimId,
        high: PrimId,
        dir: Direction,
    ) -> Self {
        let postings = match &source {
            LinkSource::Gmap { linkage, guid } => store.linkage_postings(*linkage, *guid),
            LinkSource::Vip {
                endpoint,
                linkage,
                typeguid,
            } => store.vip_postings(*endpoint, *linkage, *typeguid),
            LinkSource::NameHash { name } => store.name_hash_postings(name),
        };
        let lo_idx = postings.partition_point(|&x| x < low);
        let hi_idx = postings.partition_point(|&x| x < high);
        LinkIter {
            source,
            postings,
            lo_idx,
            hi_idx,
            idx: 0,
            low,
            high,
            dir,
            pos: Pos::default(),
            touched: false,
            ordering: None,
            stats: None,
        }
    }

    pub fn with_ordering(mut self, ordering: Option<String>) -> Self {
        self.ordering = ordering;
        self
    }

    fn window_len(&self) -> usize {
        self.hi_idx - self.lo_idx
    }

    /// Posting slot for traversal offset `idx`.
    fn slot(&self, idx: usize) -> Option<PrimId> {
        if idx >= self.window_len() {
            return None;
        }
        let i = match self.dir {
            Direction::Forward => self.lo_idx + idx,
            Direction::Backward => self.hi_idx - 1 - idx,
        };
        Some(self.postings[i])
    }

    fn charge_touch(&mut self, budget: &mut Budget) {
        if !self.touched {
            self.touched = true;
            budget.charge(COST_GMAP_ARRAY);
        }
    }

    pub fn next(&mut self, budget: &mut Budget) -> Step {
        if self.pos.eof {
            return Step::Done;
        }
        if budget.exhausted() {
            return Step::More;
        }
        self.charge_touch(budget);
        budget.charge(COST_GMAP_ELEMENT);

        match self.slot(self.idx) {
            Some(id) => {
                self.idx += 1;
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
        self.charge_touch(budget);
        budget.charge(COST_GMAP_ARRAY);

        let win = &self.postings[self.lo_idx..self.hi_idx];
        let n = win.len();
        let hit = match self.dir {
            Direction::Forward => {
                let s = win.partition_point(|&x| x < id);
                (s < n).then(|| (s, win[s]))
            }
            Direction::Backward => {
                let past = win.partition_point(|&x| x <= id);
                (past > 0).then(|| (n - past, win[past - 1]))
            }
        };
        match hit {
            Some((trav_idx, found)) => {
                self.idx = trav_idx + 1;
                self.pos.last = Some(found);
                self.pos.eof = false;
                Found::At(found)
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
        self.charge_touch(budget);
        budget.charge(COST_GMAP_ARRAY);
        if id < self.low || id >= self.high {
            return Tri::No;
        }
        if self.postings[self.lo_idx..self.hi_idx]
            .binary_search(&id)
            .is_ok()
        {
            Tri::Yes
        } else {
            Tri::No
        }
    }

    pub fn statistics(&mut self, budget: &mut Budget) -> StatStep {
        if self.stats.is_none() {
            budget.charge(COST_FUNCTION_CALL);
            let n = self.window_len() as u64;
            self.stats = Some(
                Stats::new(
                    COST_GMAP_ARRAY,
                    COST_GMAP_ELEMENT + COST_FUNCTION_CALL,
                    COST_GMAP_ARRAY,
                    n,
                )
                .with_ordering(self.ordering.clone()),
            );
        }
        StatStep::Ready
    }

    pub fn reset(&mut self) {
        self.idx = 0;
        self.pos = Pos::default();
    }

    pub fn range_estimate(&self) -> RangeEstimate {
        let n = if self.pos.eof {
            0
        } else {
            (self.window_len() - self.idx) as u64
        };
        RangeEstimate::exact(self.low, self.high, n)
    }

    /// Which linkage slots every emitted primitive is known to share.
    pub fn primitive_summary(&self) -> PrimSummary {
        let mut s = PrimSummary::default();
        match &self.source {
            LinkSource::Gmap { linkage, guid } => {
                s.locked[linkage.index()] = Some(*guid);
            }
            LinkSource::Vip {
                linkage, typeguid, ..
            } => {
                s.locked[Linkage::Typeguid.index()] = Some(*typeguid);
                // The endpoint guid is known to the store, not to us; the
                // type lock is what fan-in selection needs.
                let _ = linkage;
            }
            LinkSource::NameHash { .. } => {}
        }
        s
    }
}
