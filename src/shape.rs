//! Container shapes: inductive descriptions of list segments.
//!
//! A [`Shape`] says "starting at `entry`, walking `length` objects through the
//! `next` field of the binding yields a run where every object matches
//! `props`". Shapes are plain values: a changed heap yields new shapes, a
//! published shape is never updated in place.
//!
//! # Ordering
//!
//! Shapes are totally ordered so that identical topologies sort identically no
//! matter in which order they were discovered: by entry, then kind, then
//! element size, then binding offsets, then length. Element size `0` means
//! "unknown"; the order keeps it distinct from known sizes (sorting first),
//! while [`ShapeProps::matches`] treats it as a wildcard.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use crate::reference::ObjId;
use crate::types::{Offset, Size};

/// Kind of a shape, or of the abstract object summarizing it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ShapeKind {
    /// A single concrete object.
    Region,
    /// Singly-linked list segment.
    Sls,
    /// Doubly-linked list segment.
    Dls,
}

impl fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeKind::Region => write!(f, "region"),
            ShapeKind::Sls => write!(f, "SLS"),
            ShapeKind::Dls => write!(f, "DLS"),
        }
    }
}

/// Layout of the pointer fields that link the nodes of a list.
///
/// `head` is the offset inside a node that list pointers point to (non-zero
/// for embedded list heads); `next` and `prev` are offsets of the link fields
/// relative to the node base.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Binding {
    pub head: Offset,
    pub next: Offset,
    pub prev: Option<Offset>,
}

impl Binding {
    pub fn sls(next: Offset) -> Self {
        Self {
            head: Offset::ZERO,
            next,
            prev: None,
        }
    }

    pub fn dls(next: Offset, prev: Offset) -> Self {
        Self {
            head: Offset::ZERO,
            next,
            prev: Some(prev),
        }
    }

    pub fn with_head(self, head: Offset) -> Self {
        Self { head, ..self }
    }

    /// Kind of the segments this binding produces.
    pub fn kind(&self) -> ShapeKind {
        if self.prev.is_some() {
            ShapeKind::Dls
        } else {
            ShapeKind::Sls
        }
    }

    /// Order candidate bindings by preference: doubly-linked first.
    pub fn sort_candidates(candidates: &mut [Binding]) {
        candidates.sort_by(|a, b| b.kind().cmp(&a.kind()).then(a.cmp(b)));
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "next={}", self.next)?;
        if let Some(prev) = self.prev {
            write!(f, " prev={}", prev)?;
        }
        if self.head != Offset::ZERO {
            write!(f, " head={}", self.head)?;
        }
        Ok(())
    }
}

/// Describes what every object of a shape looks like.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ShapeProps {
    pub kind: ShapeKind,
    pub binding: Binding,
    /// Element size, [`Size::UNKNOWN`] when not yet known.
    pub size: Size,
}

impl ShapeProps {
    pub fn new(kind: ShapeKind, binding: Binding, size: Size) -> Self {
        Self {
            kind,
            binding,
            size,
        }
    }

    /// Compatibility test: unknown sizes match anything.
    pub fn matches(&self, other: &ShapeProps) -> bool {
        self.kind == other.kind
            && self.binding == other.binding
            && self.size.is_compatible(other.size)
    }
}

impl Default for ShapeProps {
    fn default() -> Self {
        Self::new(ShapeKind::Region, Binding::default(), Size::UNKNOWN)
    }
}

impl Ord for ShapeProps {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .cmp(&other.kind)
            .then(self.size.cmp(&other.size))
            .then(self.binding.cmp(&other.binding))
    }
}

impl PartialOrd for ShapeProps {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ShapeProps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}, {})", self.kind, self.binding, self.size)
    }
}

/// Inductive description of a container shape.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Shape {
    pub entry: ObjId,
    pub props: ShapeProps,
    /// Count of objects in the run, concrete and abstract alike.
    pub length: u32,
}

impl Shape {
    pub fn new(entry: ObjId, props: ShapeProps, length: u32) -> Self {
        Self {
            entry,
            props,
            length,
        }
    }

    /// A default-constructed shape is invalid until discovery fills it in.
    pub fn is_valid(&self) -> bool {
        self.entry.is_valid() && self.length > 0
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x{} from {}", self.props, self.length, self.entry)
    }
}

/// Set of shapes of one heap snapshot.
pub type ShapeSet = BTreeSet<Shape>;

/// List of shapes of one heap snapshot.
pub type ShapeList = Vec<Shape>;

/// Length of an abstract segment, counted in concrete list nodes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SegLen {
    Exact(u32),
    AtLeast(u32),
}

impl SegLen {
    /// Guaranteed number of nodes.
    pub fn min(self) -> u32 {
        match self {
            SegLen::Exact(n) | SegLen::AtLeast(n) => n,
        }
    }

    pub fn is_exact(self) -> bool {
        matches!(self, SegLen::Exact(_))
    }

    /// Length of the concatenation of two segments.
    pub fn concat(self, other: SegLen) -> SegLen {
        let n = self.min() + other.min();
        if self.is_exact() && other.is_exact() {
            SegLen::Exact(n)
        } else {
            SegLen::AtLeast(n)
        }
    }

    /// Least length that covers both.
    pub fn join(self, other: SegLen) -> SegLen {
        if self == other {
            self
        } else {
            SegLen::AtLeast(self.min().min(other.min()))
        }
    }

    /// Checks whether every length described by `other` is described by `self`.
    pub fn covers(self, other: SegLen) -> bool {
        match (self, other) {
            (SegLen::Exact(a), SegLen::Exact(b)) => a == b,
            (SegLen::Exact(_), SegLen::AtLeast(_)) => false,
            (SegLen::AtLeast(a), other) => a <= other.min(),
        }
    }
}

impl fmt::Display for SegLen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegLen::Exact(n) => write!(f, "{}", n),
            SegLen::AtLeast(n) => write!(f, "{}+", n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(kind: ShapeKind, size: u32) -> ShapeProps {
        ShapeProps::new(
            kind,
            Binding::dls(Offset::new(0), Offset::new(8)),
            Size::new(size),
        )
    }

    #[test]
    fn test_props_order() {
        // kind first
        assert!(props(ShapeKind::Sls, 32) < props(ShapeKind::Dls, 16));
        // then size
        assert!(props(ShapeKind::Dls, 16) < props(ShapeKind::Dls, 32));
        // then binding
        let a = ShapeProps::new(ShapeKind::Sls, Binding::sls(Offset::new(0)), Size::new(16));
        let b = ShapeProps::new(ShapeKind::Sls, Binding::sls(Offset::new(8)), Size::new(16));
        assert!(a < b);
        assert_eq!(a.cmp(&a), Ordering::Equal);
    }

    #[test]
    fn test_props_unknown_size_matches() {
        let known = props(ShapeKind::Dls, 16);
        let unknown = props(ShapeKind::Dls, 0);
        assert!(known.matches(&unknown));
        assert!(unknown.matches(&known));
        assert_ne!(known, unknown);
        assert!(!known.matches(&props(ShapeKind::Dls, 24)));
    }

    #[test]
    fn test_shape_order_and_equality() {
        let p = props(ShapeKind::Dls, 16);
        let a = Shape::new(ObjId::new(1), p, 3);
        let b = Shape::new(ObjId::new(1), p, 5);
        let c = Shape::new(ObjId::new(2), p, 1);
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
        assert_eq!(a, Shape::new(ObjId::new(1), p, 3));
        assert!(!(a < a));

        let set: ShapeSet = [c, a, b, a].into_iter().collect();
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![a, b, c]);
    }

    #[test]
    fn test_default_shape_is_invalid() {
        let shape = Shape::default();
        assert!(!shape.is_valid());
        assert_eq!(shape.entry, ObjId::INVALID);
        assert_eq!(shape.length, 0);
    }

    #[test]
    fn test_candidate_preference() {
        let sls = Binding::sls(Offset::new(0));
        let dls = Binding::dls(Offset::new(0), Offset::new(8));
        let mut candidates = vec![sls, dls];
        Binding::sort_candidates(&mut candidates);
        assert_eq!(candidates, vec![dls, sls]);
    }

    #[test]
    fn test_seglen() {
        assert_eq!(SegLen::Exact(2).concat(SegLen::Exact(3)), SegLen::Exact(5));
        assert_eq!(SegLen::Exact(2).concat(SegLen::AtLeast(1)), SegLen::AtLeast(3));
        assert_eq!(SegLen::Exact(2).join(SegLen::Exact(3)), SegLen::AtLeast(2));
        assert_eq!(SegLen::Exact(4).join(SegLen::Exact(4)), SegLen::Exact(4));
        assert!(SegLen::AtLeast(2).covers(SegLen::Exact(7)));
        assert!(!SegLen::AtLeast(3).covers(SegLen::AtLeast(2)));
        assert!(!SegLen::Exact(3).covers(SegLen::AtLeast(3)));
        assert_eq!(SegLen::AtLeast(3).to_string(), "3+");
    }
}
