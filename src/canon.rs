//! # Canonicalization and comparison
//!
//! Two snapshots reached along different paths name their objects differently.
//! [`SymHeap::canonicalize`] renumbers the objects in the order they are first
//! reached from the program variables (variables by name, fields by offset),
//! so that snapshots with the same topology become structurally equal. Objects
//! no variable reaches any more are dropped on the way and reported as leaks.
//!
//! On canonical heaps:
//!
//! - [`SymHeap::same_state`] decides whether two snapshots denote the same
//!   symbolic state: equal shape sets and equal everything else.
//! - [`SymHeap::same_skeleton`] ignores the lengths of segments, and
//!   [`SymHeap::join`] merges two such snapshots by widening the lengths that
//!   differ. This is what lets the exploration of a loop terminate.

use std::collections::{BTreeSet, HashMap};

use log::debug;

use crate::heap::{HeapObject, ObjKind, SymHeap};
use crate::reference::ObjId;
use crate::shape::ShapeSet;
use crate::types::Size;
use crate::value::{Pointer, Value};

/// A renumbered heap together with what was left behind.
#[derive(Debug, Clone)]
pub struct Canonical {
    pub heap: SymHeap,
    /// Live objects that nothing reached, by their old handles.
    pub leaked: Vec<ObjId>,
}

impl PartialEq for SymHeap {
    fn eq(&self, other: &Self) -> bool {
        self.object_count() == other.object_count()
            && self.vars().eq(other.vars())
            && self.objects().eq(other.objects())
    }
}

impl Eq for SymHeap {}

impl SymHeap {
    /// Handles reachable from the variables, in canonical order.
    ///
    /// Handles of released objects are included when something still points
    /// to them.
    pub fn reachable(&self) -> Vec<ObjId> {
        let mut order = Vec::new();
        let mut seen = BTreeSet::new();
        let mut stack: Vec<ObjId> = Vec::new();

        for (_, value) in self.vars() {
            let Some(root) = value.target() else { continue };
            stack.push(root);
            while let Some(obj) = stack.pop() {
                if !self.is_allocated(obj) || !seen.insert(obj) {
                    continue;
                }
                order.push(obj);
                if let Some(o) = self.object(obj) {
                    let targets: Vec<ObjId> = o.fields().filter_map(|(_, f)| f.value.target()).collect();
                    // Lowest offset on top of the stack.
                    stack.extend(targets.into_iter().rev());
                }
            }
        }
        order
    }

    /// Release every object no variable reaches. Returns the released handles.
    pub fn collect_garbage(&mut self) -> Vec<ObjId> {
        let reachable: BTreeSet<ObjId> = self.reachable().into_iter().collect();
        let garbage: Vec<ObjId> = self
            .objects()
            .map(|(id, _)| id)
            .filter(|id| !reachable.contains(id))
            .collect();
        for &obj in &garbage {
            debug!("collect_garbage: {}", obj);
            self.discard(obj);
        }
        garbage
    }

    /// Renumber the reachable objects in canonical order into a fresh heap.
    pub fn canonicalize(&self) -> Canonical {
        let order = self.reachable();
        let renumber: HashMap<ObjId, ObjId> = order
            .iter()
            .enumerate()
            .map(|(i, &old)| (old, ObjId::new(i as u32 + 1)))
            .collect();
        let map = |value: Value| match value {
            Value::Ptr(p) => match renumber.get(&p.target) {
                Some(&target) => Value::Ptr(Pointer { target, ..p }),
                None => value,
            },
            _ => value,
        };

        let mut heap = SymHeap::new(self.max_objects());
        let mut released = Vec::new();
        for &old in &order {
            let new = match self.object(old) {
                Some(o) => {
                    let mut copy = match o.as_segment() {
                        Some(seg) => HeapObject::segment(o.size, seg),
                        None => HeapObject::region(o.size),
                    };
                    copy.set_proto(o.is_proto());
                    for (off, field) in o.fields() {
                        let mut field = *field;
                        field.value = map(field.value);
                        copy.set_field(off, field);
                    }
                    heap.insert(copy)
                }
                None => heap.insert(HeapObject::region(Size::UNKNOWN)).map(|id| {
                    released.push(id);
                    id
                }),
            };
            // The fresh heap has the same ceiling and fewer objects.
            assert!(new.is_ok(), "canonical heap ran out of capacity");
        }
        for id in released {
            heap.discard(id);
        }
        for (name, value) in self.vars() {
            heap.set_var(name, map(value));
        }

        let reached: BTreeSet<ObjId> = order.into_iter().collect();
        let leaked: Vec<ObjId> = self
            .objects()
            .map(|(id, _)| id)
            .filter(|id| !reached.contains(id))
            .collect();
        if !leaked.is_empty() {
            debug!("canonicalize: unreachable {:?}", leaked);
        }
        Canonical { heap, leaked }
    }

    /// All maximal shapes of the snapshot.
    pub fn shape_set(&self) -> ShapeSet {
        self.discover_all(&self.all_binding_candidates()).into_iter().collect()
    }

    /// Checks whether two canonical snapshots denote the same symbolic state.
    pub fn same_state(&self, other: &SymHeap) -> bool {
        self.shape_set() == other.shape_set() && self == other
    }

    /// Checks whether two canonical snapshots differ at most in segment lengths.
    pub fn same_skeleton(&self, other: &SymHeap) -> bool {
        if self.object_count() != other.object_count() || !self.vars().eq(other.vars()) {
            return false;
        }
        self.objects().zip(other.objects()).all(|((a, x), (b, y))| {
            a == b
                && x.size == y.size
                && x.is_proto() == y.is_proto()
                && x.fields().eq(y.fields())
                && match (x.kind, y.kind) {
                    (ObjKind::Region, ObjKind::Region) => true,
                    (ObjKind::Segment(s), ObjKind::Segment(t)) => s.binding == t.binding,
                    _ => false,
                }
        })
    }

    /// Checks whether every concrete heap `other` denotes is also denoted by `self`.
    pub fn covers(&self, other: &SymHeap) -> bool {
        self.same_skeleton(other)
            && self
                .objects()
                .zip(other.objects())
                .all(|((_, x), (_, y))| x.seg_len().covers(y.seg_len()))
    }

    /// Least snapshot covering both, if they share a skeleton.
    pub fn join(&self, other: &SymHeap) -> Option<SymHeap> {
        if !self.same_skeleton(other) {
            return None;
        }
        let mut joined = self.clone();
        for ((id, x), (_, y)) in self.objects().zip(other.objects()) {
            if x.is_abstract() {
                joined.set_seg_len(id, x.seg_len().join(y.seg_len()));
            }
        }
        Some(joined)
    }
}
