//! Values stored in object fields and program variables.

use std::fmt;

use crate::reference::ObjId;
use crate::shape::SegLen;
use crate::types::{Offset, PTR_SIZE};

/// Position of an element inside an object.
///
/// Concrete objects are always addressed with `Head(0)`. Pointers into an
/// abstract segment count hops either from its entry or back from its tail,
/// so a back-link into the tail of a segment of unknown length stays
/// expressible.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Hop {
    Head(u32),
    Tail(u32),
}

impl Hop {
    pub const ENTRY: Hop = Hop::Head(0);

    /// Normal form of position `pos` inside a segment of exact length `len`:
    /// positions in the first half count from the entry, the rest from the tail.
    pub fn at(pos: u32, len: u32) -> Hop {
        debug_assert!(pos < len);
        let back = len - 1 - pos;
        if pos <= back {
            Hop::Head(pos)
        } else {
            Hop::Tail(back)
        }
    }

    /// Hops from the entry, when the position can be resolved.
    pub fn from_entry(self, len: SegLen) -> Option<u32> {
        match (self, len) {
            (Hop::Head(k), _) => Some(k),
            (Hop::Tail(k), SegLen::Exact(n)) => n.checked_sub(k + 1),
            (Hop::Tail(_), SegLen::AtLeast(_)) => None,
        }
    }

    /// Checks whether the hop addresses an element the segment surely has.
    pub fn is_within(self, len: SegLen) -> bool {
        let k = match self {
            Hop::Head(k) | Hop::Tail(k) => k,
        };
        k < len.min()
    }
}

impl Default for Hop {
    fn default() -> Self {
        Hop::ENTRY
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hop::Head(k) => write!(f, "h{}", k),
            Hop::Tail(k) => write!(f, "t{}", k),
        }
    }
}

/// A pointer into the heap graph.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pointer {
    pub target: ObjId,
    pub hop: Hop,
    pub offset: Offset,
}

impl Pointer {
    /// A pointer to the base of a concrete object.
    pub fn to(target: ObjId) -> Self {
        Self {
            target,
            hop: Hop::ENTRY,
            offset: Offset::ZERO,
        }
    }

    pub fn with_offset(self, offset: Offset) -> Self {
        Self { offset, ..self }
    }

    pub fn with_hop(self, hop: Hop) -> Self {
        Self { hop, ..self }
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "&{}", self.target)?;
        if self.hop != Hop::ENTRY {
            write!(f, "@{}", self.hop)?;
        }
        if self.offset != Offset::ZERO {
            write!(f, "[{}]", self.offset)?;
        }
        Ok(())
    }
}

/// A scalar or pointer value.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Value {
    /// Never written.
    Undef,
    /// Some scalar we know nothing about.
    Unknown,
    Int(i64),
    Null,
    Ptr(Pointer),
}

impl Value {
    pub fn ptr(target: ObjId) -> Self {
        Value::Ptr(Pointer::to(target))
    }

    pub fn as_ptr(&self) -> Option<Pointer> {
        match self {
            Value::Ptr(p) => Some(*p),
            _ => None,
        }
    }

    pub fn target(&self) -> Option<ObjId> {
        self.as_ptr().map(|p| p.target)
    }

    /// Natural width of the value, `None` when any width fits.
    pub fn natural_width(&self) -> Option<u32> {
        match self {
            Value::Null | Value::Ptr(_) => Some(PTR_SIZE),
            Value::Undef | Value::Unknown | Value::Int(_) => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Undef
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undef => write!(f, "undef"),
            Value::Unknown => write!(f, "?"),
            Value::Int(x) => write!(f, "{}", x),
            Value::Null => write!(f, "NULL"),
            Value::Ptr(p) => write!(f, "{}", p),
        }
    }
}

/// A value stored at some offset, together with the width it was written with.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Field {
    pub width: u32,
    pub value: Value,
}

impl Field {
    pub fn new(width: u32, value: Value) -> Self {
        Self { width, value }
    }

    pub fn ptr(value: Value) -> Self {
        Self::new(PTR_SIZE, value)
    }
}
