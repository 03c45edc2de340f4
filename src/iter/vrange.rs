//! The `vrange` leaf: primitives whose value satisfies a comparator range.
//!
//! There is no value index at this seam; the iterator walks its id window
//! and reads each primitive, which is why the planner only adds it when a
//! constraint asks for it and why its statistics experiment samples before
//! promising a cost.

use crate::budget::{Budget, Found, StatStep, Step, Tri};
use crate::ids::PrimId;
use crate::iter::{Direction, Pos};
use crate::stats::{RangeEstimate, Stats};
use crate::store::{PrimitiveStore, COST_FUNCTION_CALL, COST_PRIMITIVE};
use std::cmp::Ordering;

/// Value comparison discipline, configured per constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    /// Raw byte order.
    Octet,
    /// Decimal prefix compared numerically; ties broken by byte order.
    Number,
    /// ASCII case-folded byte order.
    Casemap,
}

impl Comparator {
    pub fn token(self) -> &'static str {
        match self {
            Comparator::Octet => "octet",
            Comparator::Number => "number",
            Comparator::Casemap => "casemap",
        }
    }

    pub fn from_token(s: &str) -> Option<Comparator> {
        match s {
            "octet" => Some(Comparator::Octet),
            "number" => Some(Comparator::Number),
            "casemap" => Some(Comparator::Casemap),
            _ => None,
        }
    }

    pub fn compare(self, a: &str, b: &str) -> Ordering {
        match self {
            Comparator::Octet => a.as_bytes().cmp(b.as_bytes()),
            Comparator::Casemap => a
                .bytes()
                .map(|c| c.to_ascii_lowercase())
                .cmp(b.bytes().map(|c| c.to_ascii_lowercase())),
            Comparator::Number => {
                fn prefix_num(s: &str) -> Option<f64> {
                    let end = s
                        .find(|c: char| !(c.is_ascii_digit() || c == '-' || c == '.' || c == '+'))
                        .unwrap_or(s.len());
                    s[..end].parse().ok()
                }
                match (prefix_num(a), prefix_num(b)) {
                    (Some(x), Some(y)) => x
                        .partial_cmp(&y)
                        .unwrap_or(Ordering::Equal)
                        .then_with(|| a.as_bytes().cmp(b.as_bytes())),
                    _ => a.as_bytes().cmp(b.as_bytes()),
                }
            }
        }
    }
}

/// Value window; equality is a closed single-point range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueSpec {
    pub lo: Option<String>,
    pub lo_incl: bool,
    pub hi: Option<String>,
    pub hi_incl: bool,
}

impl ValueSpec {
    pub fn eq(v: String) -> Self {
        ValueSpec {
            lo: Some(v.clone()),
            lo_incl: true,
            hi: Some(v),
            hi_incl: true,
        }
    }

    pub fn admits(&self, cmp: Comparator, v: &str) -> bool {
        if let Some(lo) = &self.lo {
            match cmp.compare(v, lo) {
                Ordering::Less => return false,
                Ordering::Equal if !self.lo_incl => return false,
                _ => {}
            }
        }
        if let Some(hi) = &self.hi {
            match cmp.compare(v, hi) {
                Ordering::Greater => return false,
                Ordering::Equal if !self.hi_incl => return false,
                _ => {}
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct VRangeIter {
    pub(crate) cmp: Comparator,
    pub(crate) spec: ValueSpec,
    pub(crate) low: PrimId,
    pub(crate) high: PrimId,
    pub(crate) dir: Direction,
    /// Next id to examine, None before the first step.
    pub(crate) cur: Option<PrimId>,
    pub(crate) pos: Pos,
    pub(crate) ordering: Option<String>,
    pub(crate) stats: Option<Stats>,
    /// Statistics experiment progress (ids examined, matches seen).
    pub(crate) probe: (u64, u64),
}

impl VRangeIter {
    pub fn new(
        cmp: Comparator,
        spec: ValueSpec,
        low: PrimId,
        high: PrimId,
        dir: Direction,
    ) -> Self {
        VRangeIter {
            cmp,
            spec,
            low,
            high: high.max(low),
            dir,
            cur: None,
            pos: Pos::default(),
            ordering: None,
            stats: None,
            probe: (0, 0),
        }
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

    fn admits(&self, store: &dyn PrimitiveStore, id: PrimId) -> bool {
        match store.read_primitive(id) {
            Some(p) => match &p.value {
                Some(v) => self.spec.admits(self.cmp, v),
                None => false,
            },
            // Deleted primitive: skip.
            None => false,
        }
    }

    pub fn next(&mut self, store: &dyn PrimitiveStore, budget: &mut Budget) -> Step {
        if self.pos.eof {
            return Step::Done;
        }
        loop {
            if budget.exhausted() {
                return Step::More;
            }
            let cand = match self.cur {
                None => self.first(),
                Some(id) => Some(id),
            };
            let Some(id) = cand else {
                self.pos.eof = true;
                return Step::Done;
            };
            if id < self.low || id >= self.high {
                self.pos.eof = true;
                return Step::Done;
            }
            budget.charge(COST_PRIMITIVE);
            let admitted = self.admits(store, id);
            // Save the successor before returning so a later call resumes
            // past the id we just examined.
            self.cur = self.after(id);
            if admitted {
                self.pos.last = Some(id);
                return Step::Emit(id);
            }
            if self.cur.is_none() {
                self.pos.eof = true;
                return Step::Done;
            }
        }
    }

    pub fn find(&mut self, id: PrimId, store: &dyn PrimitiveStore, budget: &mut Budget) -> Found {
        // Reposition, then scan forward to the first admitted id.
        let clamped = match self.dir {
            Direction::Forward => id.max(self.low),
            Direction::Backward => {
                if id >= self.high {
                    self.high.saturating_sub(1)
                } else {
                    id
                }
            }
        };
        self.cur = Some(clamped);
        self.pos.eof = false;
        match self.next(store, budget) {
            Step::Emit(found) => Found::At(found),
            Step::Done => Found::Done,
            Step::More => Found::More,
        }
    }

    pub fn check(&mut self, id: PrimId, store: &dyn PrimitiveStore, budget: &mut Budget) -> Tri {
        if budget.exhausted() {
            return Tri::More;
        }
        budget.charge(COST_PRIMITIVE);
        if id < self.low || id >= self.high {
            return Tri::No;
        }
        if self.admits(store, id) {
            Tri::Yes
        } else {
            Tri::No
        }
    }

    /// Sample a handful of ids spread across the window, then extrapolate.
    pub fn statistics(&mut self, store: &dyn PrimitiveStore, budget: &mut Budget) -> StatStep {
        const TRIALS: u64 = 8;
        if self.stats.is_some() {
            return StatStep::Ready;
        }
        let span = self.high - self.low;
        while self.probe.0 < TRIALS.min(span) {
            if budget.exhausted() {
                return StatStep::More;
            }
            budget.charge(COST_PRIMITIVE);
            let step = (span / TRIALS.min(span).max(1)).max(1);
            let id = self.low + self.probe.0 * step;
            if id < self.high && self.admits(store, id) {
                self.probe.1 += 1;
            }
            self.probe.0 += 1;
        }
        let (trials, hits) = self.probe;
        let n = if trials == 0 {
            0
        } else {
            (span * hits.max(1)) / trials.max(1)
        };
        let next_cost = COST_PRIMITIVE * (trials.max(1) as i64) / (hits.max(1) as i64);
        self.stats = Some(
            Stats::new(COST_PRIMITIVE, next_cost, next_cost, n)
                .with_ordering(self.ordering.clone()),
        );
        StatStep::Ready
    }

    pub fn reset(&mut self) {
        self.cur = None;
        self.pos = Pos::default();
    }

    pub fn range_estimate(&self) -> RangeEstimate {
        let remaining = match (self.pos.eof, self.cur, self.pos.last) {
            (true, _, _) => 0,
            (false, None, _) => self.high - self.low,
            (false, Some(cur), _) => match self.dir {
                Direction::Forward => self.high - cur,
                Direction::Backward => cur + 1 - self.low,
            },
        };
        RangeEstimate::at_most(self.low, self.high, remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemStore, PrimitiveSpec};

    fn store_with_values(values: &[Option<&str>]) -> MemStore {
        let mut s = MemStore::new();
        for v in values {
            s.add(PrimitiveSpec {
                value: v.map(|x| x.to_string()),
                ..Default::default()
            });
        }
        s
    }

    fn collect(it: &mut VRangeIter, s: &MemStore) -> Vec<PrimId> {
        let mut b = Budget::unlimited();
        let mut out = Vec::new();
        while let Step::Emit(id) = it.next(s, &mut b) {
            out.push(id);
        }
        out
    }

    #[test]
    fn test_comparators() {
        assert_eq!(Comparator::Octet.compare("B", "a"), Ordering::Less);
        assert_eq!(Comparator::Casemap.compare("B", "a"), Ordering::Greater);
        assert_eq!(Comparator::Casemap.compare("ABC", "abc"), Ordering::Equal);
        assert_eq!(Comparator::Number.compare("9", "10"), Ordering::Less);
        assert_eq!(Comparator::Octet.compare("9", "10"), Ordering::Greater);
        assert_eq!(Comparator::Number.compare("10kg", "10m"), Ordering::Less);
    }

    #[test]
    fn test_equality_scan() {
        let s = store_with_values(&[Some("x"), Some("y"), None, Some("x")]);
        let mut it = VRangeIter::new(
            Comparator::Octet,
            ValueSpec::eq("x".into()),
            0,
            s.primitive_count(),
            Direction::Forward,
        );
        assert_eq!(collect(&mut it, &s), vec![0, 3]);
    }

    #[test]
    fn test_half_open_range() {
        let s = store_with_values(&[Some("a"), Some("b"), Some("c"), Some("d")]);
        let spec = ValueSpec {
            lo: Some("b".into()),
            lo_incl: true,
            hi: Some("d".into()),
            hi_incl: false,
        };
        let mut it = VRangeIter::new(
            Comparator::Octet,
            spec,
            0,
            s.primitive_count(),
            Direction::Forward,
        );
        assert_eq!(collect(&mut it, &s), vec![1, 2]);
    }

    #[test]
    fn test_suspension_mid_scan() {
        let s = store_with_values(&[Some("n"), Some("n"), Some("y"), Some("n"), Some("y")]);
        let mut it = VRangeIter::new(
            Comparator::Octet,
            ValueSpec::eq("y".into()),
            0,
            s.primitive_count(),
            Direction::Forward,
        );
        let mut out = Vec::new();
        loop {
            let mut b = Budget::new(COST_PRIMITIVE);
            match it.next(&s, &mut b) {
                Step::Emit(id) => out.push(id),
                Step::Done => break,
                Step::More => {}
            }
        }
        assert_eq!(out, vec![2, 4]);
    }

    #[test]
    fn test_check() {
        let s = store_with_values(&[Some("x"), Some("y")]);
        let mut it = VRangeIter::new(
            Comparator::Octet,
            ValueSpec::eq("y".into()),
            0,
            s.primitive_count(),
            Direction::Forward,
        );
        let mut b = Budget::unlimited();
        assert_eq!(it.check(1, &s, &mut b), Tri::Yes);
        assert_eq!(it.check(0, &s, &mut b), Tri::No);
        assert_eq!(it.check(7, &s, &mut b), Tri::No);
    }
}
