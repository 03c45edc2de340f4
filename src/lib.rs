//! # Quiver Iterator Engine
//!
//! A budgeted, resumable iterator engine for evaluating read queries over
//! a graph of immutable *primitives*.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Constraint Tree
//!     ↓
//! [Planner]                 → iterator tree (and / or / isa / linksto / leaves)
//!     ↓
//! [Statistics]              → producer election, dedup method, cost model
//!     ↓
//! [Executor]                → next/check under a per-tick budget
//!     ↓
//! ids ... or a cursor (freeze) when the budget, page, or deadline runs out
//!     ↓
//! [Thaw]                    → rebind to live originals, or replay from a resume id
//! ```
//!
//! ## Usage
//!
//! ### Planning and draining a query
//! ```rust,ignore
//! use quiver::{plan, run_page, Budget, Constraint, EngineConfig, ExecCtx, MemStore, ResourceCache};
//!
//! let store = MemStore::new();
//! let resources = ResourceCache::new(8 << 20);
//! let config = EngineConfig::load()?;
//! let ctx = ExecCtx::new(&store, &resources, &config);
//!
//! let mut it = plan(&Constraint::default(), &ctx)?;
//! let mut budget = Budget::new(10_000);
//! let page = run_page(&mut it, &ctx, &mut budget)?;
//! if let Some(cursor) = page.cursor {
//!     // hand the cursor to the client; next round trip thaws it
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `ids` | 40-bit ids, GUIDs, linkage slots, 5-byte packing |
//! | `primitive` | the immutable record |
//! | `store` | primitive-store seam + in-memory reference store |
//! | `budget` | cooperative budgets, outcome enums, request timer |
//! | `stats` | cost triples and cardinality estimates |
//! | `iter` | the iterator contract and its kernels |
//! | `cursor` | freeze/thaw text grammar |
//! | `resource` | cross-request storable cache + original index |
//! | `planner` | constraint tree → iterator tree |
//! | `engine` | request loop: pages, budgets, deadlines |
//! | `config` | figment-backed configuration |

pub mod budget;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod ids;
pub mod iter;
pub mod planner;
pub mod primitive;
pub mod resource;
pub mod stats;
pub mod store;

// Re-export the working vocabulary
pub use budget::{Budget, Found, RequestTimer, StatStep, Step, TimerState, Tri, BUDGET_MIN};
pub use config::{EngineConfig, EngineTuning, LoggingConfig, ResourceConfig};
pub use cursor::{freeze, set_string, thaw};
pub use engine::{freeze_cursor, resume_page, run_page, ExecCtx, QueryOutcome};
pub use error::{EngineError, EngineResult};
pub use ids::{Guid, Linkage, PrimId, PRIM_ID_MAX, PRIM_ID_NONE};
pub use iter::{
    AllIter, AndIter, Comparator, DedupMethod, Direction, FixedBuilder, FixedIter, FreezeFlags,
    IdSet, IsaCache, IsaIter, Iter, LinkIter, LinkSource, LinksToIter, NullIter, OrIter, Pos,
    PrimSummary, VRangeIter, ValueSpec,
};
pub use planner::{
    plan, thaw_cursor, ChildConstraint, ChildRelation, Constraint, ValueConstraint,
};
pub use primitive::Primitive;
pub use resource::{LiveOriginal, Original, ResourceCache, ResourceCacheStats};
pub use stats::{RangeEstimate, Stats};
pub use store::{
    MemStore, PostingList, PrimitiveSpec, PrimitiveStore, COST_FUNCTION_CALL, COST_GMAP_ARRAY,
    COST_GMAP_ELEMENT, COST_PRIMITIVE,
};
