//! Request execution: budgets, pages, and cursor round trips.
//!
//! The engine is single-threaded and cooperative. A request drives its
//! iterator tree under a per-tick budget; when the budget runs out, when a
//! page fills, or when the soft deadline passes, the tree freezes into a
//! cursor and the request yields. The outer loop (not ours) reschedules
//! round-robin. A hard deadline aborts with a cost error instead.

use crate::budget::{Budget, RequestTimer, Step, TimerState};
use crate::config::EngineConfig;
use crate::cursor;
use crate::error::{EngineError, EngineResult};
use crate::ids::PrimId;
use crate::iter::{FreezeFlags, Iter};
use crate::resource::{Original, ResourceCache};
use crate::store::PrimitiveStore;
use std::sync::Arc;
use std::time::Duration;

/// Everything an iterator operation needs from its surroundings. Cheap to
/// construct per request; all fields are shared, read-only handles.
pub struct ExecCtx<'a> {
    pub store: &'a dyn PrimitiveStore,
    pub resources: &'a ResourceCache,
    pub config: &'a EngineConfig,
}

impl<'a> ExecCtx<'a> {
    pub fn new(
        store: &'a dyn PrimitiveStore,
        resources: &'a ResourceCache,
        config: &'a EngineConfig,
    ) -> Self {
        ExecCtx {
            store,
            resources,
            config,
        }
    }

    fn timer(&self) -> RequestTimer {
        let ms = |v: u64| (v > 0).then(|| Duration::from_millis(v));
        RequestTimer::new(
            ms(self.config.engine.soft_timeout_ms),
            ms(self.config.engine.hard_timeout_ms),
        )
    }
}

/// One tick's worth of results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOutcome {
    pub ids: Vec<PrimId>,
    /// Present iff the query has more to say: thaw it next round trip.
    pub cursor: Option<String>,
    pub done: bool,
}

/// Drive `it` until a page fills, the sequence ends, the budget runs out,
/// or the soft deadline passes. Anything but the end hands back a cursor.
pub fn run_page(it: &mut Iter, ctx: &ExecCtx<'_>, budget: &mut Budget) -> EngineResult<QueryOutcome> {
    let timer = ctx.timer();
    let page = ctx.config.engine.page_size;
    let mut ids = Vec::new();
    loop {
        match timer.state() {
            TimerState::Running => {}
            TimerState::SoftExpired => {
                tracing::debug!(collected = ids.len(), "soft deadline: yielding a cursor");
                return Ok(QueryOutcome {
                    ids,
                    cursor: Some(freeze_cursor(it, ctx)),
                    done: false,
                });
            }
            TimerState::HardExpired => {
                return Err(EngineError::TooHard {
                    spent: timer.elapsed().as_millis() as i64,
                    cap: ctx.config.engine.hard_timeout_ms as i64,
                });
            }
        }
        if ids.len() >= page {
            return Ok(QueryOutcome {
                ids,
                cursor: Some(freeze_cursor(it, ctx)),
                done: false,
            });
        }
        // Below the progress floor an operation may legitimately spin on
        // More; yield instead of burning dust.
        if !ids.is_empty() && budget.remaining() < ctx.config.engine.budget_min {
            return Ok(QueryOutcome {
                ids,
                cursor: Some(freeze_cursor(it, ctx)),
                done: false,
            });
        }
        match it.next(ctx, budget) {
            Step::Emit(id) => ids.push(id),
            Step::Done => {
                return Ok(QueryOutcome {
                    ids,
                    cursor: None,
                    done: true,
                });
            }
            Step::More => {
                return Ok(QueryOutcome {
                    ids,
                    cursor: Some(freeze_cursor(it, ctx)),
                    done: false,
                });
            }
        }
    }
}

/// Thaw a cursor and keep driving it.
pub fn resume_page(
    cursor_text: &str,
    ctx: &ExecCtx<'_>,
    budget: &mut Budget,
) -> EngineResult<QueryOutcome> {
    let mut it = cursor::thaw(cursor_text, ctx)?;
    run_page(&mut it, ctx, budget)
}

/// Freeze with full flags, registering live originals and storable caches
/// under their stamps first so the next thaw can rebind.
pub fn freeze_cursor(it: &Iter, ctx: &ExecCtx<'_>) -> String {
    register_originals(it, ctx.resources);
    cursor::freeze(it, FreezeFlags::ALL, ctx.config.engine.cursor_state_cap)
}

/// Walk the tree, registering every AND and ISA original by its SET stamp,
/// and parking ISA storable caches in the LRU so they outlive the request.
fn register_originals(it: &Iter, resources: &ResourceCache) {
    match it {
        Iter::And(a) => {
            let stamp = cursor::set_string(it);
            resources.register_original(&stamp, Original::And(Arc::downgrade(&a.shared)));
            for sub in &a.subs {
                register_originals(sub, resources);
            }
        }
        Iter::Isa(i) => {
            let stamp = cursor::set_string(it);
            resources.register_original(&stamp, Original::Isa(Arc::downgrade(&i.shared)));
            let cache = i.shared.lock().cache.clone();
            if let Some(cache) = cache {
                resources.store_cache(&stamp, cache);
            }
            register_originals(&i.sub, resources);
        }
        Iter::Or(o) => {
            for sub in &o.subs {
                register_originals(sub, resources);
            }
        }
        Iter::LinksTo(l) => {
            register_originals(&l.sub, resources);
            register_originals(&l.driver, resources);
        }
        _ => {}
    }
}
