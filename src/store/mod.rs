//! The primitive-store seam.
//!
//! The engine never owns primitive storage; it consumes it through
//! [`PrimitiveStore`]. Posting lists handed out by a store are sorted,
//! distinct, and immutable for the life of a query, so they are shared
//! freely between an iterator and its clones.
//!
//! Cost constants are expressed in the same units budgets are charged in.

mod mem;

pub use mem::{MemStore, PrimitiveSpec};

use crate::ids::{Guid, Linkage, PrimId};
use crate::primitive::Primitive;
use std::sync::Arc;

/// Cost of reading one primitive record.
pub const COST_PRIMITIVE: i64 = 24;
/// Cost of locating a posting list (array lookup).
pub const COST_GMAP_ARRAY: i64 = 12;
/// Cost of stepping one element within a posting list.
pub const COST_GMAP_ELEMENT: i64 = 1;
/// Cost of a plain call that touches no storage.
pub const COST_FUNCTION_CALL: i64 = 1;

/// A sorted, distinct, shareable list of primitive ids.
pub type PostingList = Arc<Vec<PrimId>>;

/// Read-only access to the primitive store during a query.
///
/// Missing ids are `None`, never errors: deletions leave holes in the id
/// space and iterators skip them. Implementations must keep every live id
/// below [`crate::ids::PRIM_ID_NONE`]; the dedup log packs ids into 5
/// bytes and cannot represent anything wider.
pub trait PrimitiveStore {
    fn read_primitive(&self, id: PrimId) -> Option<Primitive>;

    fn id_from_guid(&self, guid: Guid) -> Option<PrimId>;
    fn guid_from_id(&self, id: PrimId) -> Option<Guid>;

    /// Ids of primitives whose slot `l` points at `guid`, ascending.
    fn linkage_postings(&self, l: Linkage, guid: Guid) -> PostingList;

    /// Ids of primitives whose slot `l` points at `endpoint`'s guid and
    /// whose type slot is `typeguid`, ascending.
    fn vip_postings(&self, endpoint: PrimId, l: Linkage, typeguid: Guid) -> PostingList;

    /// Ids of primitives whose name hashes like `name`, ascending.
    fn name_hash_postings(&self, name: &str) -> PostingList;

    /// One past the largest id ever written (the dateline).
    fn primitive_count(&self) -> u64;
}
