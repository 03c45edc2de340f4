//! The iterator contract and its kernels.
//!
//! Every iterator kind lives behind the [`Iter`] sum type; call sites
//! dispatch by match, not by trait object, so kernels can substitute
//! themselves (an AND that proves its result tiny becomes a `fixed`;
//! an ISA that materialises does the same).
//!
//! ## Suspension model
//!
//! Single-threaded and cooperative. Each operation charges the budget it
//! was handed and returns `More` once the budget goes negative, after
//! saving a small call-state inside the iterator. Re-invoking the same
//! operation continues the same call; there is no preemption.

mod all;
mod and;
mod fixed;
mod isa;
mod isa_cache;
mod link;
mod linksto;
mod or;
mod vrange;

pub use all::AllIter;
pub use and::{AndIter, AndShared};
pub use fixed::{FixedBuilder, FixedIter, FixedOrder};
pub use isa::{DedupMethod, IsaIter, IsaShared};
pub use isa_cache::{IdSet, IsaCache, CACHE_CHUNK};
pub use link::{LinkIter, LinkSource};
pub use linksto::LinksToIter;
pub use or::OrIter;
pub use vrange::{Comparator, VRangeIter, ValueSpec};

use crate::budget::{Budget, Found, StatStep, Step, Tri};
use crate::engine::ExecCtx;
use crate::ids::{Guid, PrimId};
use crate::stats::{RangeEstimate, Stats};

/// Traversal direction of the id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

impl Direction {
    pub fn forward(self) -> bool {
        self == Direction::Forward
    }

    /// Cursor token: backward iterators carry a `~` before their low bound.
    pub fn token(self) -> &'static str {
        match self {
            Direction::Forward => "",
            Direction::Backward => "~",
        }
    }

    /// Does `a` strictly precede `b` in this direction?
    pub fn precedes(self, a: PrimId, b: PrimId) -> bool {
        match self {
            Direction::Forward => a < b,
            Direction::Backward => a > b,
        }
    }
}

/// Where an iterator is within its set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pos {
    /// Last id returned, if any.
    pub last: Option<PrimId>,
    /// Terminal until reset.
    pub eof: bool,
    /// Replay target installed by thaw when saved state was lost: suppress
    /// output until this id is re-emitted, then continue normally.
    pub resume: Option<PrimId>,
}

/// Resume-replay admission: true when `id` should be surfaced to the
/// caller. Clears the resume mark once the replay has caught up.
pub(crate) fn resume_admit(pos: &mut Pos, dir: Direction, sorted: bool, id: PrimId) -> bool {
    match pos.resume {
        None => true,
        Some(r) => {
            if id == r || (sorted && dir.precedes(r, id)) {
                pos.resume = None;
                true
            } else {
                false
            }
        }
    }
}

/// Which linkage slots of an iterator's output are locked to known GUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrimSummary {
    pub locked: [Option<Guid>; 4],
}

impl PrimSummary {
    pub fn locked_typeguid(&self) -> Option<Guid> {
        self.locked[crate::ids::Linkage::Typeguid.index()]
    }

    pub fn is_empty(&self) -> bool {
        self.locked.iter().all(Option::is_none)
    }
}

/// Which cursor pieces `freeze` serialises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreezeFlags {
    pub set: bool,
    pub position: bool,
    pub state: bool,
}

impl FreezeFlags {
    pub const SET: FreezeFlags = FreezeFlags {
        set: true,
        position: false,
        state: false,
    };
    pub const SET_POSITION: FreezeFlags = FreezeFlags {
        set: true,
        position: true,
        state: false,
    };
    pub const ALL: FreezeFlags = FreezeFlags {
        set: true,
        position: true,
        state: true,
    };
}

/// The empty iterator. Contradictory constraints collapse to this.
#[derive(Debug, Clone, Default)]
pub struct NullIter;

/// Polymorphic iterator over primitive ids.
#[derive(Debug, Clone)]
pub enum Iter {
    Null(NullIter),
    All(AllIter),
    Fixed(FixedIter),
    Link(LinkIter),
    VRange(VRangeIter),
    And(Box<AndIter>),
    Or(Box<OrIter>),
    Isa(Box<IsaIter>),
    LinksTo(Box<LinksToIter>),
}

impl Iter {
    /// Cursor token naming this kind. `gmap`/`vip`/`hmap` are distinct
    /// tokens of the same kernel.
    pub fn kind_token(&self) -> &'static str {
        match self {
            Iter::Null(_) => "null",
            Iter::All(_) => "all",
            Iter::Fixed(_) => "fixed",
            Iter::Link(l) => match l.source {
                LinkSource::Gmap { .. } => "gmap",
                LinkSource::Vip { .. } => "vip",
                LinkSource::NameHash { .. } => "hmap",
            },
            Iter::VRange(_) => "vrange",
            Iter::And(_) => "and",
            Iter::Or(_) => "or",
            Iter::Isa(_) => "isa",
            Iter::LinksTo(_) => "linksto",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Iter::Null(_))
    }

    pub fn low(&self) -> PrimId {
        match self {
            Iter::Null(_) => 0,
            Iter::All(i) => i.low,
            Iter::Fixed(i) => i.low,
            Iter::Link(i) => i.low,
            Iter::VRange(i) => i.low,
            Iter::And(i) => i.low,
            Iter::Or(i) => i.low,
            Iter::Isa(i) => i.low,
            Iter::LinksTo(i) => i.low,
        }
    }

    pub fn high(&self) -> PrimId {
        match self {
            Iter::Null(_) => 0,
            Iter::All(i) => i.high,
            Iter::Fixed(i) => i.high,
            Iter::Link(i) => i.high,
            Iter::VRange(i) => i.high,
            Iter::And(i) => i.high,
            Iter::Or(i) => i.high,
            Iter::Isa(i) => i.high,
            Iter::LinksTo(i) => i.high,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Iter::Null(_) => Direction::Forward,
            Iter::All(i) => i.dir,
            Iter::Fixed(i) => i.dir,
            Iter::Link(i) => i.dir,
            Iter::VRange(i) => i.dir,
            Iter::And(i) => i.dir,
            Iter::Or(i) => i.dir,
            Iter::Isa(i) => i.dir,
            Iter::LinksTo(i) => i.dir,
        }
    }

    /// Does this iterator emit ids in its direction's order?
    pub fn sorted(&self) -> bool {
        match self {
            Iter::Null(_) => true,
            Iter::All(_) => true,
            Iter::Fixed(i) => i.sorted(),
            Iter::Link(_) => true,
            Iter::VRange(_) => true,
            Iter::And(i) => i.sorted(),
            Iter::Or(i) => i.sorted(),
            Iter::Isa(_) => false,
            Iter::LinksTo(i) => i.sorted(),
        }
    }

    pub fn pos(&self) -> Pos {
        match self {
            Iter::Null(_) => Pos {
                last: None,
                eof: true,
                resume: None,
            },
            Iter::All(i) => i.pos,
            Iter::Fixed(i) => i.pos,
            Iter::Link(i) => i.pos,
            Iter::VRange(i) => i.pos,
            Iter::And(i) => i.pos,
            Iter::Or(i) => i.pos,
            Iter::Isa(i) => i.pos,
            Iter::LinksTo(i) => i.pos,
        }
    }

    /// Install a resume-replay target (thaw recovery).
    pub fn set_resume(&mut self, id: PrimId) {
        match self {
            Iter::Null(_) => {}
            Iter::All(i) => i.pos.resume = Some(id),
            Iter::Fixed(i) => i.pos.resume = Some(id),
            Iter::Link(i) => i.pos.resume = Some(id),
            Iter::VRange(i) => i.pos.resume = Some(id),
            Iter::And(i) => i.pos.resume = Some(id),
            Iter::Or(i) => i.pos.resume = Some(id),
            Iter::Isa(i) => i.pos.resume = Some(id),
            Iter::LinksTo(i) => i.pos.resume = Some(id),
        }
    }

    /// Force the terminal state (thawing a `*` position).
    pub fn set_eof(&mut self) {
        match self {
            Iter::Null(_) => {}
            Iter::All(i) => i.pos.eof = true,
            Iter::Fixed(i) => i.pos.eof = true,
            Iter::Link(i) => i.pos.eof = true,
            Iter::VRange(i) => i.pos.eof = true,
            Iter::And(i) => i.pos.eof = true,
            Iter::Or(i) => i.pos.eof = true,
            Iter::Isa(i) => i.pos.eof = true,
            Iter::LinksTo(i) => i.pos.eof = true,
        }
    }

    /// Has the position moved past `id` (id can no longer be emitted)?
    pub fn beyond(&self, id: PrimId) -> bool {
        let pos = self.pos();
        match pos.last {
            None => false,
            Some(last) => !self.direction().precedes(last, id),
        }
    }

    pub fn next(&mut self, ctx: &ExecCtx<'_>, budget: &mut Budget) -> Step {
        // Composites elect their plan before producing; election may
        // substitute `self`, so re-dispatch afterwards.
        if self.needs_stats_before_next() {
            match self.statistics(ctx, budget) {
                StatStep::More => return Step::More,
                StatStep::Ready => return self.next(ctx, budget),
            }
        }
        match self {
            Iter::Null(_) => Step::Done,
            Iter::All(i) => {
                loop {
                    match i.next(budget) {
                        Step::Emit(id) => {
                            if resume_admit(&mut i.pos, i.dir, true, id) {
                                return Step::Emit(id);
                            }
                        }
                        other => return other,
                    }
                }
            }
            Iter::Fixed(i) => {
                let sorted = i.sorted();
                loop {
                    match i.next(budget) {
                        Step::Emit(id) => {
                            if resume_admit(&mut i.pos, i.dir, sorted, id) {
                                return Step::Emit(id);
                            }
                        }
                        other => return other,
                    }
                }
            }
            Iter::Link(i) => {
                loop {
                    match i.next(budget) {
                        Step::Emit(id) => {
                            if resume_admit(&mut i.pos, i.dir, true, id) {
                                return Step::Emit(id);
                            }
                        }
                        other => return other,
                    }
                }
            }
            Iter::VRange(i) => {
                loop {
                    match i.next(ctx.store, budget) {
                        Step::Emit(id) => {
                            if resume_admit(&mut i.pos, i.dir, true, id) {
                                return Step::Emit(id);
                            }
                        }
                        other => return other,
                    }
                }
            }
            Iter::And(i) => i.next(ctx, budget),
            Iter::Or(i) => i.next(ctx, budget),
            Iter::Isa(i) => i.next(ctx, budget),
            Iter::LinksTo(i) => i.next(ctx, budget),
        }
    }

    /// Position onto the first set member at-or-beyond `id`. Only valid on
    /// sorted iterators.
    pub fn find(&mut self, id: PrimId, ctx: &ExecCtx<'_>, budget: &mut Budget) -> Found {
        if self.needs_stats_before_next() {
            match self.statistics(ctx, budget) {
                StatStep::More => return Found::More,
                StatStep::Ready => return self.find(id, ctx, budget),
            }
        }
        match self {
            Iter::Null(_) => Found::Done,
            Iter::All(i) => i.find(id, budget),
            Iter::Fixed(i) => i.find(id, budget),
            Iter::Link(i) => i.find(id, budget),
            Iter::VRange(i) => i.find(id, ctx.store, budget),
            Iter::And(i) => i.find(id, ctx, budget),
            Iter::Or(i) => i.find(id, ctx, budget),
            Iter::Isa(_) => {
                debug_assert!(false, "find on unsorted isa iterator");
                Found::Done
            }
            Iter::LinksTo(i) => i.find(id, ctx, budget),
        }
    }

    /// Membership test; never moves the position.
    pub fn check(&mut self, id: PrimId, ctx: &ExecCtx<'_>, budget: &mut Budget) -> Tri {
        match self {
            Iter::Null(_) => Tri::No,
            Iter::All(i) => i.check(id, budget),
            Iter::Fixed(i) => i.check(id, budget),
            Iter::Link(i) => i.check(id, budget),
            Iter::VRange(i) => i.check(id, ctx.store, budget),
            Iter::And(i) => i.check(id, ctx, budget),
            Iter::Or(i) => i.check(id, ctx, budget),
            Iter::Isa(i) => i.check(id, ctx, budget),
            Iter::LinksTo(i) => i.check(id, ctx, budget),
        }
    }

    /// Run the statistics experiment forward. On `Ready` the cost triple
    /// and cardinality are valid (and stay valid).
    pub fn statistics(&mut self, ctx: &ExecCtx<'_>, budget: &mut Budget) -> StatStep {
        let (result, substitute) = match self {
            Iter::Null(_) => (StatStep::Ready, None),
            Iter::All(i) => (i.statistics(budget), None),
            Iter::Fixed(i) => (i.statistics(budget), None),
            Iter::Link(i) => (i.statistics(budget), None),
            Iter::VRange(i) => (i.statistics(ctx.store, budget), None),
            Iter::And(i) => match i.statistics(ctx, budget) {
                and::AndStat::Ready => (StatStep::Ready, None),
                and::AndStat::More => (StatStep::More, None),
                and::AndStat::Substitute(f) => (StatStep::Ready, Some(f)),
            },
            Iter::Or(i) => (i.statistics(ctx, budget), None),
            Iter::Isa(i) => match i.statistics(ctx, budget) {
                isa::IsaStat::Ready => (StatStep::Ready, None),
                isa::IsaStat::More => (StatStep::More, None),
                isa::IsaStat::Substitute(f) => (StatStep::Ready, Some(f)),
            },
            Iter::LinksTo(i) => (i.statistics(ctx, budget), None),
        };
        if let Some(mut fixed) = substitute {
            // The replacement masquerades as the set it was derived from,
            // which keeps its frozen form short and its identity stable.
            fixed.set_masquerade(crate::cursor::set_string(self));
            *self = Iter::Fixed(fixed);
        }
        result
    }

    /// Valid statistics, if the experiment has completed.
    pub fn stats(&self) -> Option<&Stats> {
        match self {
            Iter::Null(_) => None,
            Iter::All(i) => i.stats.as_ref(),
            Iter::Fixed(i) => i.stats.as_ref(),
            Iter::Link(i) => i.stats.as_ref(),
            Iter::VRange(i) => i.stats.as_ref(),
            Iter::And(i) => i.stats(),
            Iter::Or(i) => i.stats.as_ref(),
            Iter::Isa(i) => i.stats(),
            Iter::LinksTo(i) => i.stats.as_ref(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            Iter::Null(_) => {}
            Iter::All(i) => i.reset(),
            Iter::Fixed(i) => i.reset(),
            Iter::Link(i) => i.reset(),
            Iter::VRange(i) => i.reset(),
            Iter::And(i) => i.reset(),
            Iter::Or(i) => i.reset(),
            Iter::Isa(i) => i.reset(),
            Iter::LinksTo(i) => i.reset(),
        }
    }

    /// Independent position over the same set, sharing the original's
    /// statistics and caches.
    pub fn clone_iter(&self) -> Iter {
        let mut c = self.clone();
        match &mut c {
            Iter::And(i) => i.mark_clone(),
            Iter::Isa(i) => i.mark_clone(),
            _ => {}
        }
        c
    }

    pub fn range_estimate(&self) -> RangeEstimate {
        match self {
            Iter::Null(_) => RangeEstimate::exact(0, 0, 0),
            Iter::All(i) => i.range_estimate(),
            Iter::Fixed(i) => i.range_estimate(),
            Iter::Link(i) => i.range_estimate(),
            Iter::VRange(i) => i.range_estimate(),
            Iter::And(i) => i.range_estimate(),
            Iter::Or(i) => i.range_estimate(),
            Iter::Isa(i) => i.range_estimate(),
            Iter::LinksTo(i) => i.range_estimate(),
        }
    }

    /// Which linkage slots of every emitted primitive are locked to known
    /// GUIDs. Enables VIP fan-in selection in ISA.
    pub fn primitive_summary(&self) -> PrimSummary {
        match self {
            Iter::Link(i) => i.primitive_summary(),
            Iter::And(i) => {
                // Any sub locking a slot locks the intersection's output.
                let mut s = PrimSummary::default();
                for sub in &i.subs {
                    let sub_s = sub.primitive_summary();
                    for k in 0..4 {
                        if s.locked[k].is_none() {
                            s.locked[k] = sub_s.locked[k];
                        }
                    }
                }
                s
            }
            Iter::Or(i) => {
                // A slot survives the union only if every branch locks it
                // to the same guid.
                let mut subs = i.subs.iter();
                let mut s = match subs.next() {
                    Some(first) => first.primitive_summary(),
                    None => return PrimSummary::default(),
                };
                for sub in subs {
                    let sub_s = sub.primitive_summary();
                    for k in 0..4 {
                        if s.locked[k] != sub_s.locked[k] {
                            s.locked[k] = None;
                        }
                    }
                }
                s
            }
            _ => PrimSummary::default(),
        }
    }

    /// The ordering tag this iterator's output honours, if any.
    pub fn ordering(&self) -> Option<&str> {
        self.stats().and_then(|s| s.ordering.as_deref())
    }

    fn needs_stats_before_next(&self) -> bool {
        match self {
            Iter::And(i) => i.stats().is_none(),
            Iter::Isa(i) => i.stats().is_none(),
            _ => false,
        }
    }
}
