//! Duplicate-suppression cache for ISA iterators.
//!
//! Two halves, kept in sync:
//! - `offset_to_id`: an append-only byte buffer of 5-byte big-endian ids,
//!   indexed by 0-based offset. This is the emission log; clones replay it.
//! - `id_set`: a tile-based bitmap giving O(1) membership.
//!
//! Growth happens in fixed 64 KiB chunks so byte accounting stays coarse
//! and cheap to publish to the process-wide resource budget.

use crate::error::{EngineError, EngineResult};
use crate::ids::{pack5, unpack5, PrimId, PRIM_ID_NONE};
use crate::stats::RangeEstimate;
use std::collections::HashMap;

/// Allocation granularity for the emission log.
pub const CACHE_CHUNK: usize = 64 * 1024;

const TILE_SHIFT: u32 = 16;
const TILE_WORDS: usize = 1 << (TILE_SHIFT - 6); // 1024 u64s = 64 Ki ids

/// Sparse bitmap over the 40-bit id space, allocated tile by tile.
#[derive(Debug, Default, Clone)]
pub struct IdSet {
    tiles: HashMap<u64, Box<[u64; TILE_WORDS]>>,
    len: usize,
}

impl IdSet {
    pub fn new() -> Self {
        IdSet::default()
    }

    /// Insert; false if already present.
    pub fn insert(&mut self, id: PrimId) -> bool {
        let tile = self
            .tiles
            .entry(id >> TILE_SHIFT)
            .or_insert_with(|| Box::new([0u64; TILE_WORDS]));
        let bit = (id & ((1 << TILE_SHIFT) - 1)) as usize;
        let word = &mut tile[bit >> 6];
        let mask = 1u64 << (bit & 63);
        if *word & mask != 0 {
            return false;
        }
        *word |= mask;
        self.len += 1;
        true
    }

    pub fn contains(&self, id: PrimId) -> bool {
        match self.tiles.get(&(id >> TILE_SHIFT)) {
            Some(tile) => {
                let bit = (id & ((1 << TILE_SHIFT) - 1)) as usize;
                tile[bit >> 6] & (1u64 << (bit & 63)) != 0
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_size(&self) -> usize {
        self.tiles.len() * TILE_WORDS * 8
    }
}

/// The per-original ISA cache.
#[derive(Debug, Default, Clone)]
pub struct IsaCache {
    buf: Vec<u8>,
    set: IdSet,
    eof: bool,
}

impl IsaCache {
    pub fn new() -> Self {
        IsaCache::default()
    }

    /// Number of logged ids.
    pub fn nelems(&self) -> usize {
        self.buf.len() / 5
    }

    pub fn eof(&self) -> bool {
        self.eof
    }

    /// Append `id` at `position`, which must be the current tail. Returns
    /// true when the id was new (and therefore logged); a duplicate only
    /// refreshes the membership set.
    pub fn add(&mut self, position: usize, id: PrimId) -> EngineResult<bool> {
        if self.eof {
            return Err(EngineError::Internal(format!(
                "isa cache add at {position} after eof"
            )));
        }
        if position != self.nelems() {
            return Err(EngineError::Internal(format!(
                "isa cache add at {position}, tail is {}",
                self.nelems()
            )));
        }
        if id >= PRIM_ID_NONE {
            return Err(EngineError::OutOfRange {
                id,
                low: 0,
                high: PRIM_ID_NONE,
            });
        }
        if !self.set.insert(id) {
            return Ok(false);
        }
        if self.buf.len() == self.buf.capacity() {
            self.buf.reserve(CACHE_CHUNK);
        }
        pack5(id, &mut self.buf);
        Ok(true)
    }

    pub fn offset_to_id(&self, offset: usize) -> Option<PrimId> {
        let at = offset.checked_mul(5)?;
        unpack5(self.buf.get(at..at + 5)?)
    }

    pub fn check(&self, id: PrimId) -> bool {
        self.set.contains(id)
    }

    /// Linear scan of the packed log. Slow on purpose: only the thaw
    /// recovery path ever asks, and correctness beats an extra index.
    pub fn id_to_offset(&self, id: PrimId) -> Option<usize> {
        (0..self.nelems()).find(|&i| self.offset_to_id(i) == Some(id))
    }

    /// Seal the log; no further appends.
    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    /// Bounds and counts for the ids at or after `offset`, by a full pass
    /// over the tail.
    pub fn range(&self, offset: usize) -> RangeEstimate {
        let mut low = PrimId::MAX;
        let mut high = 0;
        let mut n = 0u64;
        for i in offset..self.nelems() {
            if let Some(id) = self.offset_to_id(i) {
                low = low.min(id);
                high = high.max(id + 1);
                n += 1;
            }
        }
        if n == 0 {
            return RangeEstimate::exact(0, 0, 0);
        }
        if self.eof {
            RangeEstimate::exact(low, high, n)
        } else {
            RangeEstimate {
                low,
                high,
                n_exact: None,
                n_max: n,
            }
        }
    }

    /// Bytes charged against the process-wide resource budget.
    pub fn byte_size(&self) -> usize {
        let log = self.buf.capacity().next_multiple_of(CACHE_CHUNK.max(1));
        log + self.set.byte_size()
    }
}
