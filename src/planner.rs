//! Query-to-iterator planning.
//!
//! Translates a parsed constraint tree into an iterator tree in three
//! passes per node:
//!
//! 1. **Initialise**: settle range bounds (clamped to the store
//!    dateline), the traversal direction, and any cursor-pinned iterator
//!    carried over from a previous round trip.
//! 2. **Cheap**: push fixed knowledge both ways through the tree: a
//!    single-GUID constraint hardens neighbouring linkage slots, a unique
//!    name collapses to its id, and obvious contradictions collapse the
//!    node to `null` before anything is built.
//! 3. **Finish**: compose the node's AND from the sub-iterators it can
//!    justify: the fixed GUID set, per-slot posting lists (VIP where both
//!    endpoint and type are locked), value ranges, child constraints
//!    wrapped as `isa` or `linksto` (with a VIP hint where the child's
//!    GUIDs are known), OR'd alternatives, and a full-range fallback when
//!    nothing selective survived.

use crate::cursor;
use crate::engine::ExecCtx;
use crate::error::EngineResult;
use crate::ids::{Guid, Linkage, PrimId};
use crate::iter::{
    AllIter, AndIter, Comparator, Direction, FixedBuilder, Iter, IsaIter, LinkIter, LinkSource,
    LinksToIter, NullIter, OrIter, ValueSpec, VRangeIter,
};

/// Largest child GUID set that still earns a VIP/gmap hint on `linksto`.
const HINT_MAX_GUIDS: usize = 4;

/// Value constraint with its configured comparator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueConstraint {
    pub comparator: Comparator,
    pub spec: ValueSpec,
}

/// How a child constraint relates to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildRelation {
    /// The child's primitives point at the parent through this slot
    /// (planned as `isa`: follow the slot out of the child set).
    PointsToParent(Linkage),
    /// The parent's primitives point at the child through this slot
    /// (planned as `linksto`: emit the pointers).
    ParentPointsTo(Linkage),
}

#[derive(Debug, Clone)]
pub struct ChildConstraint {
    pub relation: ChildRelation,
    pub constraint: Constraint,
}

/// One node of the parsed constraint tree.
#[derive(Debug, Clone, Default)]
pub struct Constraint {
    /// Explicit GUID set; `Some(vec![])` is already a contradiction.
    pub guids: Option<Vec<Guid>>,
    /// Per-slot linkage equality sets, indexed by [`Linkage::index`].
    pub linkage: [Option<Vec<Guid>>; 4],
    pub name: Option<String>,
    pub value: Option<ValueConstraint>,
    pub low: Option<PrimId>,
    pub high: Option<PrimId>,
    /// Sort direction of the result (root constraint decides).
    pub backward: bool,
    /// Ordering tag the caller wants the result to honour.
    pub ordering: Option<String>,
    pub children: Vec<ChildConstraint>,
    /// OR alternatives, each a full constraint.
    pub alternatives: Vec<Constraint>,
    /// Cursor pinned by a previous round trip; overrides planning.
    pub cursor: Option<String>,
    pub pagesize: Option<u64>,
    /// Set by the cheap pass when the node cannot match anything.
    pub unsatisfiable: bool,
}

/// Plan a constraint tree into an iterator tree.
pub fn plan(constraint: &Constraint, ctx: &ExecCtx<'_>) -> EngineResult<Iter> {
    let mut c = constraint.clone();
    let it = build(&mut c, ctx, 0)?;
    tracing::debug!(kind = it.kind_token(), "planned iterator tree");
    Ok(it)
}

/// Re-enter a query from a frozen cursor.
pub fn thaw_cursor(text: &str, ctx: &ExecCtx<'_>) -> EngineResult<Iter> {
    cursor::thaw(text, ctx)
}

fn build(c: &mut Constraint, ctx: &ExecCtx<'_>, depth: usize) -> EngineResult<Iter> {
    // Pass 1: initialise.
    let dateline = ctx.store.primitive_count();
    let low = c.low.unwrap_or(0);
    let high = c.high.unwrap_or(dateline).min(dateline);
    let dir = if c.backward {
        Direction::Backward
    } else {
        Direction::Forward
    };
    if let Some(text) = &c.cursor {
        return cursor::thaw(text, ctx);
    }
    if low >= high {
        return Ok(Iter::Null(NullIter));
    }

    // Pass 2: cheap knowledge.
    cheap(c, ctx);
    if c.unsatisfiable {
        return Ok(Iter::Null(NullIter));
    }

    // Pass 3: finish.
    let mut subs: Vec<Iter> = Vec::new();

    if let Some(guids) = &c.guids {
        let mut b = FixedBuilder::new(low, high, dir);
        for g in guids {
            match ctx.store.id_from_guid(*g) {
                Some(id) => b.add(id),
                None => {}
            }
        }
        let fixed = b.commit(true);
        if fixed.is_empty() {
            return Ok(Iter::Null(NullIter));
        }
        subs.push(Iter::Fixed(fixed.with_ordering(c.ordering.clone())));
    }

    let single_typeguid = single(&c.linkage[Linkage::Typeguid.index()]);
    for l in Linkage::ALL {
        let Some(guids) = &c.linkage[l.index()] else {
            continue;
        };
        if guids.is_empty() {
            return Ok(Iter::Null(NullIter));
        }
        let mut branches = Vec::with_capacity(guids.len());
        for g in guids {
            branches.push(linkage_leaf(ctx, l, *g, single_typeguid, low, high, dir, c));
        }
        subs.push(OrIter::compose(branches, low, high, dir, c.ordering.clone())?);
    }

    if let Some(name) = &c.name {
        let postings = ctx.store.name_hash_postings(name);
        match postings.len() {
            0 => return Ok(Iter::Null(NullIter)),
            1 => {
                // A unique name collapses straight to its id.
                let mut b = FixedBuilder::new(low, high, dir);
                b.add(postings[0]);
                let fixed = b.commit(true);
                if fixed.is_empty() {
                    return Ok(Iter::Null(NullIter));
                }
                subs.push(Iter::Fixed(fixed));
            }
            _ => {
                subs.push(
                    Iter::Link(
                        LinkIter::new(
                            ctx.store,
                            LinkSource::NameHash { name: name.clone() },
                            low,
                            high,
                            dir,
                        )
                        .with_ordering(c.ordering.clone()),
                    ),
                );
            }
        }
    }

    if let Some(value) = &c.value {
        subs.push(Iter::VRange(VRangeIter::new(
            value.comparator,
            value.spec.clone(),
            low,
            high,
            dir,
        )));
    }

    for child in c.children.iter_mut() {
        let child_iter = build(&mut child.constraint, ctx, depth + 1)?;
        let wrapped = match child.relation {
            ChildRelation::PointsToParent(l) => IsaIter::new(child_iter, l, low, high, dir),
            ChildRelation::ParentPointsTo(l) => {
                let hint = linksto_hint(ctx, &child.constraint, l, single_typeguid, low, high, dir)?;
                LinksToIter::new(child_iter, l, hint, low, high, dir)
            }
        };
        if wrapped.is_null() {
            return Ok(Iter::Null(NullIter));
        }
        subs.push(wrapped);
    }

    if !c.alternatives.is_empty() {
        let mut branches = Vec::with_capacity(c.alternatives.len());
        for alt in c.alternatives.iter_mut() {
            // Alternatives inherit the node's window and direction.
            alt.low.get_or_insert(low);
            alt.high.get_or_insert(high);
            alt.backward = c.backward;
            branches.push(build(alt, ctx, depth + 1)?);
        }
        let or = OrIter::compose(branches, low, high, dir, c.ordering.clone())?;
        if or.is_null() {
            return Ok(Iter::Null(NullIter));
        }
        subs.push(or);
    }

    // Fallback: nothing selective, scan the window.
    if subs.is_empty() {
        return Ok(Iter::All(
            AllIter::new(low, high, dir).with_ordering(c.ordering.clone()),
        ));
    }
    let mut it = AndIter::compose(subs, low, high, dir, c.ordering.clone())?;
    if let (Iter::And(a), Some(pg)) = (&mut it, c.pagesize) {
        a.pagesize_hint = Some(pg);
    }
    Ok(it)
}

/// Push fixed knowledge bi-directionally through one node and its
/// children; set `unsatisfiable` on contradictions.
fn cheap(c: &mut Constraint, ctx: &ExecCtx<'_>) {
    if let Some(guids) = &c.guids {
        if guids.is_empty() {
            c.unsatisfiable = true;
            return;
        }
        // A single fixed GUID hardens every linkage slot from the record
        // itself, and hands knowledge to the children.
        if let [g] = guids.as_slice() {
            if let Some(prim) = ctx
                .store
                .id_from_guid(*g)
                .and_then(|id| ctx.store.read_primitive(id))
            {
                for l in Linkage::ALL {
                    if let Some(target) = prim.linkage_guid(l) {
                        if !intersect_slot(&mut c.linkage[l.index()], target) {
                            c.unsatisfiable = true;
                            return;
                        }
                    }
                }
                for child in c.children.iter_mut() {
                    match child.relation {
                        // Child points at this (single-guid) parent.
                        ChildRelation::PointsToParent(l) => {
                            if !intersect_slot(
                                &mut child.constraint.linkage[l.index()],
                                prim.guid,
                            ) {
                                c.unsatisfiable = true;
                                return;
                            }
                        }
                        // This parent points at the child: the slot names
                        // the child's GUID outright.
                        ChildRelation::ParentPointsTo(l) => {
                            if let Some(target) = prim.linkage_guid(l) {
                                if !intersect_guids(&mut child.constraint.guids, target) {
                                    c.unsatisfiable = true;
                                    return;
                                }
                            }
                        }
                    }
                }
            } else {
                // The GUID names nothing in this store.
                c.unsatisfiable = true;
                return;
            }
        }
    }
    // Push child knowledge up.
    for child in c.children.iter_mut() {
        if let Some([g]) = child.constraint.guids.as_deref() {
            match child.relation {
                ChildRelation::ParentPointsTo(l) => {
                    if !intersect_slot(&mut c.linkage[l.index()], *g) {
                        c.unsatisfiable = true;
                        return;
                    }
                }
                ChildRelation::PointsToParent(l) => {
                    // The child record itself knows whom it points at.
                    if let Some(parent_guid) = ctx
                        .store
                        .id_from_guid(*g)
                        .and_then(|id| ctx.store.read_primitive(id))
                        .and_then(|p| p.linkage_guid(l))
                    {
                        if !intersect_guids(&mut c.guids, parent_guid) {
                            c.unsatisfiable = true;
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Narrow a linkage slot to `guid`; false on contradiction.
fn intersect_slot(slot: &mut Option<Vec<Guid>>, guid: Guid) -> bool {
    match slot {
        None => {
            *slot = Some(vec![guid]);
            true
        }
        Some(set) => {
            if set.contains(&guid) {
                *set = vec![guid];
                true
            } else {
                false
            }
        }
    }
}

fn intersect_guids(guids: &mut Option<Vec<Guid>>, guid: Guid) -> bool {
    intersect_slot(guids, guid)
}

fn single(slot: &Option<Vec<Guid>>) -> Option<Guid> {
    match slot.as_deref() {
        Some([g]) => Some(*g),
        _ => None,
    }
}

/// One posting-list leaf for slot `l` pointing at `guid`. VIP when the
/// node also locks a type and the endpoint actually exists.
#[allow(clippy::too_many_arguments)]
fn linkage_leaf(
    ctx: &ExecCtx<'_>,
    l: Linkage,
    guid: Guid,
    typeguid: Option<Guid>,
    low: PrimId,
    high: PrimId,
    dir: Direction,
    c: &Constraint,
) -> Iter {
    let source = match (l, typeguid, ctx.store.id_from_guid(guid)) {
        (Linkage::Typeguid, _, _) | (_, None, _) | (_, _, None) => {
            LinkSource::Gmap { linkage: l, guid }
        }
        (_, Some(t), Some(endpoint)) => LinkSource::Vip {
            endpoint,
            linkage: l,
            typeguid: t,
        },
    };
    Iter::Link(LinkIter::new(ctx.store, source, low, high, dir).with_ordering(c.ordering.clone()))
}

/// A `linksto` hint: when the child's GUIDs are known and few, candidates
/// come from their posting lists instead of the whole window.
#[allow(clippy::too_many_arguments)]
fn linksto_hint(
    ctx: &ExecCtx<'_>,
    child: &Constraint,
    l: Linkage,
    typeguid: Option<Guid>,
    low: PrimId,
    high: PrimId,
    dir: Direction,
) -> EngineResult<Option<Iter>> {
    let Some(guids) = &child.guids else {
        return Ok(None);
    };
    if guids.is_empty() || guids.len() > HINT_MAX_GUIDS {
        return Ok(None);
    }
    let mut branches = Vec::with_capacity(guids.len());
    for g in guids {
        let source = match (typeguid, ctx.store.id_from_guid(*g)) {
            (Some(t), Some(endpoint)) => LinkSource::Vip {
                endpoint,
                linkage: l,
                typeguid: t,
            },
            _ => LinkSource::Gmap {
                linkage: l,
                guid: *g,
            },
        };
        branches.push(Iter::Link(LinkIter::new(ctx.store, source, low, high, dir)));
    }
    Ok(Some(OrIter::compose(branches, low, high, dir, None)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{Budget, Step};
    use crate::config::EngineConfig;
    use crate::resource::ResourceCache;
    use crate::store::{MemStore, PrimitiveSpec, PrimitiveStore};

    fn collect(it: &mut Iter, ctx: &ExecCtx<'_>) -> Vec<PrimId> {
        let mut b = Budget::unlimited();
        let mut out = Vec::new();
        while let Step::Emit(id) = it.next(ctx, &mut b) {
            out.push(id);
        }
        out
    }

    /// A small world: a type, two endpoints, typed links at each.
    fn world() -> MemStore {
        let mut s = MemStore::new();
        let t = s.add(PrimitiveSpec {
            name: Some("edge".into()),
            ..Default::default()
        });
        let tg = s.guid_from_id(t).unwrap();
        let x = s.add(PrimitiveSpec {
            name: Some("x".into()),
            ..Default::default()
        });
        let xg = s.guid_from_id(x).unwrap();
        let y = s.add(PrimitiveSpec {
            name: Some("y".into()),
            ..Default::default()
        });
        let yg = s.guid_from_id(y).unwrap();
        for (i, target) in [xg, yg, xg, xg].into_iter().enumerate() {
            s.add(PrimitiveSpec {
                typeguid: Some(tg),
                left: Some(target),
                value: Some(format!("v{i}")),
                ..Default::default()
            });
        }
        s
    }

    fn with_world<R>(f: impl FnOnce(&ExecCtx<'_>, &MemStore) -> R) -> R {
        let store = world();
        let resources = ResourceCache::new(1 << 20);
        let config = EngineConfig::default();
        let ctx = ExecCtx {
            store: &store,
            resources: &resources,
            config: &config,
        };
        f(&ctx, &store)
    }

    #[test]
    fn test_empty_constraint_scans_window() {
        with_world(|ctx, _| {
            let mut it = plan(&Constraint::default(), ctx).unwrap();
            assert!(matches!(it, Iter::All(_)));
            assert_eq!(collect(&mut it, ctx).len(), 7);
        });
    }

    #[test]
    fn test_single_guid_becomes_fixed() {
        with_world(|ctx, store| {
            let g = store.guid_from_id(3).unwrap();
            let c = Constraint {
                guids: Some(vec![g]),
                ..Default::default()
            };
            let mut it = plan(&c, ctx).unwrap();
            assert_eq!(collect(&mut it, ctx), vec![3]);
        });
    }

    #[test]
    fn test_unknown_guid_is_null() {
        with_world(|ctx, _| {
            let c = Constraint {
                guids: Some(vec![Guid(0xdead)]),
                ..Default::default()
            };
            let it = plan(&c, ctx).unwrap();
            assert!(it.is_null());
        });
    }

    #[test]
    fn test_typed_links_use_gmap() {
        with_world(|ctx, store| {
            let tg = store.guid_from_id(0).unwrap();
            let c = Constraint {
                linkage: [Some(vec![tg]), None, None, None],
                ..Default::default()
            };
            let mut it = plan(&c, ctx).unwrap();
            assert_eq!(collect(&mut it, ctx), vec![3, 4, 5, 6]);
        });
    }

    #[test]
    fn test_type_plus_endpoint_uses_vip() {
        with_world(|ctx, store| {
            let tg = store.guid_from_id(0).unwrap();
            let xg = store.guid_from_id(1).unwrap();
            let mut linkage: [Option<Vec<Guid>>; 4] = Default::default();
            linkage[Linkage::Typeguid.index()] = Some(vec![tg]);
            linkage[Linkage::Left.index()] = Some(vec![xg]);
            let c = Constraint {
                linkage,
                ..Default::default()
            };
            let mut it = plan(&c, ctx).unwrap();
            assert_eq!(collect(&mut it, ctx), vec![3, 5, 6]);
        });
    }

    #[test]
    fn test_unique_name_collapses_to_fixed() {
        with_world(|ctx, _| {
            let c = Constraint {
                name: Some("x".into()),
                ..Default::default()
            };
            let mut it = plan(&c, ctx).unwrap();
            assert_eq!(collect(&mut it, ctx), vec![1]);
        });
    }

    #[test]
    fn test_missing_name_is_null() {
        with_world(|ctx, _| {
            let c = Constraint {
                name: Some("nobody".into()),
                ..Default::default()
            };
            assert!(plan(&c, ctx).unwrap().is_null());
        });
    }

    #[test]
    fn test_child_points_to_parent_becomes_isa() {
        with_world(|ctx, store| {
            // Parents reached through `left` from the typed links: x, y.
            let tg = store.guid_from_id(0).unwrap();
            let child = Constraint {
                linkage: [Some(vec![tg]), None, None, None],
                ..Default::default()
            };
            let c = Constraint {
                children: vec![ChildConstraint {
                    relation: ChildRelation::PointsToParent(Linkage::Left),
                    constraint: child,
                }],
                ..Default::default()
            };
            let mut it = plan(&c, ctx).unwrap();
            let mut got = collect(&mut it, ctx);
            got.sort_unstable();
            assert_eq!(got, vec![1, 2]);
        });
    }

    #[test]
    fn test_parent_points_to_child_becomes_linksto_with_hint() {
        with_world(|ctx, store| {
            let xg = store.guid_from_id(1).unwrap();
            let child = Constraint {
                guids: Some(vec![xg]),
                ..Default::default()
            };
            let c = Constraint {
                children: vec![ChildConstraint {
                    relation: ChildRelation::ParentPointsTo(Linkage::Left),
                    constraint: child,
                }],
                ..Default::default()
            };
            let mut it = plan(&c, ctx).unwrap();
            assert_eq!(collect(&mut it, ctx), vec![3, 5, 6]);
        });
    }

    #[test]
    fn test_alternatives_or_together() {
        with_world(|ctx, store| {
            let xg = store.guid_from_id(1).unwrap();
            let yg = store.guid_from_id(2).unwrap();
            let alt = |g: Guid| Constraint {
                guids: Some(vec![g]),
                ..Default::default()
            };
            let c = Constraint {
                alternatives: vec![alt(xg), alt(yg)],
                ..Default::default()
            };
            let mut it = plan(&c, ctx).unwrap();
            assert_eq!(collect(&mut it, ctx), vec![1, 2]);
        });
    }

    #[test]
    fn test_value_constraint_adds_vrange() {
        with_world(|ctx, _| {
            let c = Constraint {
                value: Some(ValueConstraint {
                    comparator: Comparator::Octet,
                    spec: ValueSpec::eq("v2".into()),
                }),
                ..Default::default()
            };
            let mut it = plan(&c, ctx).unwrap();
            assert_eq!(collect(&mut it, ctx), vec![5]);
        });
    }

    #[test]
    fn test_contradictory_linkage_is_null() {
        with_world(|ctx, store| {
            // Fixed guid 3 has left = x; constraining left = y contradicts.
            let g3 = store.guid_from_id(3).unwrap();
            let yg = store.guid_from_id(2).unwrap();
            let mut linkage: [Option<Vec<Guid>>; 4] = Default::default();
            linkage[Linkage::Left.index()] = Some(vec![yg]);
            let c = Constraint {
                guids: Some(vec![g3]),
                linkage,
                ..Default::default()
            };
            assert!(plan(&c, ctx).unwrap().is_null());
        });
    }

    #[test]
    fn test_backward_direction_flows_down() {
        with_world(|ctx, store| {
            let tg = store.guid_from_id(0).unwrap();
            let c = Constraint {
                linkage: [Some(vec![tg]), None, None, None],
                backward: true,
                ..Default::default()
            };
            let mut it = plan(&c, ctx).unwrap();
            assert_eq!(collect(&mut it, ctx), vec![6, 5, 4, 3]);
        });
    }
}
