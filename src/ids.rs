//! Primitive ids, GUIDs and linkage slots.
//!
//! Ids are dense 40-bit integers (smaller id = written earlier), the width
//! the on-wire 5-byte packing supports; stores must never hand out wider
//! ids. GUIDs are 128-bit and stable across replicas. A primitive has up
//! to four linkage slots, each optionally pointing at another primitive by
//! GUID.

use std::fmt;

/// Dense primitive id. Only the low 40 bits are meaningful.
pub type PrimId = u64;

/// Largest representable id (exclusive bound for live ids).
pub const PRIM_ID_MAX: PrimId = (1 << 40) - 1;

/// Sentinel meaning "no id". Rendered in cursors as its decimal value.
pub const PRIM_ID_NONE: PrimId = PRIM_ID_MAX;

/// 128-bit globally unique primitive identity.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Guid(pub u128);

impl Guid {
    /// Render as 32 lowercase hex digits.
    pub fn to_hex(self) -> String {
        format!("{:032x}", self.0)
    }

    /// Parse exactly 32 hex digits.
    pub fn from_hex(s: &str) -> Option<Guid> {
        if s.len() != 32 {
            return None;
        }
        u128::from_str_radix(s, 16).ok().map(Guid)
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self.to_hex())
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// One of the four linkage slots of a primitive.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Linkage {
    Typeguid = 0,
    Right = 1,
    Left = 2,
    Scope = 3,
}

impl Linkage {
    pub const ALL: [Linkage; 4] = [
        Linkage::Typeguid,
        Linkage::Right,
        Linkage::Left,
        Linkage::Scope,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: usize) -> Option<Linkage> {
        Linkage::ALL.get(i).copied()
    }

    /// Cursor token for this slot.
    pub fn token(self) -> &'static str {
        match self {
            Linkage::Typeguid => "type",
            Linkage::Right => "right",
            Linkage::Left => "left",
            Linkage::Scope => "scope",
        }
    }

    pub fn from_token(s: &str) -> Option<Linkage> {
        match s {
            "type" => Some(Linkage::Typeguid),
            "right" => Some(Linkage::Right),
            "left" => Some(Linkage::Left),
            "scope" => Some(Linkage::Scope),
            _ => None,
        }
    }
}

/// Append `id` to `out` as exactly 5 big-endian bytes.
///
/// Every representable id (sentinel included) fits; the assert guards
/// against a store handing out ids wider than it promised.
pub fn pack5(id: PrimId, out: &mut Vec<u8>) {
    debug_assert!(id < (1 << 40), "id {id} exceeds 5-byte range");
    out.push((id >> 32) as u8);
    out.push((id >> 24) as u8);
    out.push((id >> 16) as u8);
    out.push((id >> 8) as u8);
    out.push(id as u8);
}

/// Decode one 5-byte big-endian id. Returns None unless `buf` is exactly
/// 5 bytes long.
pub fn unpack5(buf: &[u8]) -> Option<PrimId> {
    if buf.len() != 5 {
        return None;
    }
    Some(
        ((buf[0] as u64) << 32)
            | ((buf[1] as u64) << 24)
            | ((buf[2] as u64) << 16)
            | ((buf[3] as u64) << 8)
            | (buf[4] as u64),
    )
}
