//! Shape discovery.
//!
//! Starting from a candidate entry, walk the `next` field of a binding for as
//! long as the objects keep matching. The walk stops at the first object that
//! has a different size or layout, breaks the back-links of a doubly-linked
//! candidate, belongs to another shape, or closes a cycle back to the entry.
//! Discovery never fails: an entry that matches nothing is a length-1 region.

use std::collections::{BTreeSet, HashMap};

use log::debug;

use crate::heap::{HeapObject, SymHeap};
use crate::reference::ObjId;
use crate::shape::{Binding, Shape, ShapeKind, ShapeList, ShapeProps};
use crate::types::{Size, PTR_SIZE};
use crate::value::{Hop, Value};

impl HeapObject {
    /// Checks whether the object may be a node of a list with `binding`.
    pub fn admits(&self, binding: &Binding, size: Size) -> bool {
        if self.size != size || self.is_proto() {
            return false;
        }
        match self.as_segment() {
            Some(seg) => seg.binding == *binding,
            None => {
                self.size.admits(binding.next, PTR_SIZE)
                    && binding
                        .prev
                        .map_or(true, |prev| self.size.admits(prev, PTR_SIZE))
            }
        }
    }

    /// Properties describing the object on its own.
    pub fn own_props(&self) -> ShapeProps {
        match self.as_segment() {
            Some(seg) => ShapeProps::new(seg.binding.kind(), seg.binding, self.size),
            None => ShapeProps::new(ShapeKind::Region, Binding::default(), self.size),
        }
    }

    /// Hop addressing the last node of the object.
    pub fn tail_hop(&self) -> Hop {
        if self.is_abstract() {
            Hop::Tail(0)
        } else {
            Hop::ENTRY
        }
    }
}

impl SymHeap {
    /// The object the `next` field of `obj` links to, if it is a list link.
    pub fn successor(&self, obj: ObjId, binding: &Binding) -> Option<ObjId> {
        let o = self.object(obj)?;
        match o.ptr_field(binding.next) {
            Value::Ptr(p) if p.offset == binding.head && p.hop == Hop::ENTRY => Some(p.target),
            _ => None,
        }
    }

    /// Checks whether the `prev` field of `obj` links back to the tail of `pred`.
    pub fn links_back(&self, obj: ObjId, pred: ObjId, binding: &Binding) -> bool {
        let Some(prev) = binding.prev else {
            return true;
        };
        let (Some(o), Some(p)) = (self.object(obj), self.object(pred)) else {
            return false;
        };
        match o.ptr_field(prev) {
            Value::Ptr(ptr) => {
                ptr.target == pred && ptr.offset == binding.head && ptr.hop == p.tail_hop()
            }
            _ => false,
        }
    }

    /// Discover the maximal run starting at `entry` with the given binding.
    pub fn discover(&self, entry: ObjId, binding: Binding) -> Shape {
        self.discover_excluding(entry, binding, &BTreeSet::new())
    }

    /// Try the candidate bindings in preference order (doubly-linked first) and
    /// return the first run longer than one object.
    pub fn discover_any(&self, entry: ObjId, candidates: &[Binding]) -> Shape {
        let mut candidates = candidates.to_vec();
        Binding::sort_candidates(&mut candidates);
        let mut best = Shape::default();
        for binding in candidates {
            let shape = self.discover(entry, binding);
            if shape.length >= 2 {
                return shape;
            }
            if !best.is_valid() {
                best = shape;
            }
        }
        best
    }

    fn discover_excluding(&self, entry: ObjId, binding: Binding, taken: &BTreeSet<ObjId>) -> Shape {
        let Some(first) = self.object(entry) else {
            return Shape::default();
        };
        let size = first.size;
        if !first.admits(&binding, size) {
            return Shape::new(entry, first.own_props(), 1);
        }

        let mut run = BTreeSet::from([entry]);
        let mut cur = entry;
        while let Some(next) = self.successor(cur, &binding) {
            if next == entry {
                debug!("discover: cycle back to {}", entry);
                break;
            }
            if run.contains(&next) || taken.contains(&next) {
                break;
            }
            match self.object(next) {
                Some(o) if o.admits(&binding, size) => {}
                _ => break,
            }
            if !self.links_back(next, cur, &binding) {
                break;
            }
            run.insert(next);
            cur = next;
        }

        let length = run.len() as u32;
        let kind = if length >= 2 {
            binding.kind()
        } else {
            first.shape_kind()
        };
        Shape::new(entry, ShapeProps::new(kind, binding, size), length)
    }

    /// Bindings under which `obj` is linked to a neighbour of the same size,
    /// in preference order.
    pub fn binding_candidates(&self, obj: ObjId) -> Vec<Binding> {
        let Some(o) = self.object(obj) else {
            return Vec::new();
        };
        let mut result = Vec::new();
        for (next, field) in o.fields() {
            let Value::Ptr(p) = field.value else { continue };
            if p.hop != Hop::ENTRY || p.target == obj {
                continue;
            }
            let Some(t) = self.object(p.target) else { continue };
            if t.size != o.size || t.is_proto() {
                continue;
            }
            let sls = Binding::sls(next).with_head(p.offset);
            if !result.contains(&sls) {
                result.push(sls);
            }
            for (prev, back) in t.fields() {
                if prev == next {
                    continue;
                }
                match back.value {
                    Value::Ptr(q) if q.target == obj && q.offset == p.offset => {
                        let dls = Binding::dls(next, prev).with_head(p.offset);
                        if !result.contains(&dls) {
                            result.push(dls);
                        }
                    }
                    _ => {}
                }
            }
        }
        if let Some(seg) = o.as_segment() {
            if !result.contains(&seg.binding) {
                result.push(seg.binding);
            }
        }
        Binding::sort_candidates(&mut result);
        result
    }

    /// Binding candidates of every object in the heap, in preference order.
    pub fn all_binding_candidates(&self) -> Vec<Binding> {
        let mut result: Vec<Binding> = Vec::new();
        for (id, _) in self.objects() {
            for b in self.binding_candidates(id) {
                if !result.contains(&b) {
                    result.push(b);
                }
            }
        }
        Binding::sort_candidates(&mut result);
        result
    }

    /// Discover all maximal, non-overlapping runs of at least two objects.
    ///
    /// Bindings are tried in preference order; an object claimed by a shape is
    /// not considered again.
    pub fn discover_all(&self, candidates: &[Binding]) -> ShapeList {
        let mut candidates = candidates.to_vec();
        Binding::sort_candidates(&mut candidates);

        let mut taken = BTreeSet::new();
        let mut shapes = ShapeList::new();
        for binding in candidates {
            let preds = self.predecessors(&binding);
            let ids: Vec<ObjId> = self.objects().map(|(id, _)| id).collect();

            // Entries without a matching predecessor first, then what is left
            // over: those are entries of cycles.
            for cyclic_pass in [false, true] {
                for &id in &ids {
                    if taken.contains(&id) || (!cyclic_pass && preds.contains_key(&id)) {
                        continue;
                    }
                    let shape = self.discover_excluding(id, binding, &taken);
                    if shape.length < 2 {
                        continue;
                    }
                    taken.extend(self.objects_of(&shape));
                    debug!("discover_all: {}", shape);
                    shapes.push(shape);
                }
            }
        }
        shapes.sort();
        shapes
    }

    /// Map every object to the object linking to it under `binding`.
    fn predecessors(&self, binding: &Binding) -> HashMap<ObjId, ObjId> {
        let mut preds = HashMap::new();
        for (id, o) in self.objects() {
            if !o.admits(binding, o.size) {
                continue;
            }
            let Some(next) = self.successor(id, binding) else { continue };
            if next == id {
                continue;
            }
            match self.object(next) {
                Some(n) if n.admits(binding, o.size) && self.links_back(next, id, binding) => {
                    preds.insert(next, id);
                }
                _ => {}
            }
        }
        preds
    }

    /// Checks whether the run of the shape closes back on its entry.
    pub fn is_cyclic(&self, shape: &Shape) -> bool {
        let tail = self.tail_of(shape);
        self.successor(tail, &shape.props.binding) == Some(shape.entry)
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::heap::Segment;
    use crate::shape::SegLen;
    use crate::types::Offset;

    const NEXT: Offset = Offset::new(0);
    const PREV: Offset = Offset::new(8);

    fn dll(heap: &mut SymHeap, n: usize) -> Vec<ObjId> {
        let nodes: Vec<ObjId> = (0..n).map(|_| heap.alloc(Size::new(16)).unwrap()).collect();
        for (i, &node) in nodes.iter().enumerate() {
            let next = nodes.get(i + 1).map_or(Value::Null, |&n| Value::ptr(n));
            let prev = if i == 0 { Value::Null } else { Value::ptr(nodes[i - 1]) };
            heap.write(node, NEXT, PTR_SIZE, next).unwrap();
            heap.write(node, PREV, PTR_SIZE, prev).unwrap();
        }
        nodes
    }

    #[test]
    fn test_discover_dll() {
        let mut heap = SymHeap::default();
        let nodes = dll(&mut heap, 5);

        let shape = heap.discover(nodes[0], Binding::dls(NEXT, PREV));
        assert_eq!(shape.entry, nodes[0]);
        assert_eq!(shape.length, 5);
        assert_eq!(shape.props.kind, ShapeKind::Dls);
        assert_eq!(shape.props.size, Size::new(16));

        // From the middle, the run is shorter.
        let shape = heap.discover(nodes[2], Binding::dls(NEXT, PREV));
        assert_eq!(shape.length, 3);
    }

    #[test]
    fn test_discover_single_object_is_region() {
        let mut heap = SymHeap::default();
        let a = heap.alloc(Size::new(16)).unwrap();
        heap.write(a, NEXT, PTR_SIZE, Value::Null).unwrap();
        let shape = heap.discover(a, Binding::sls(NEXT));
        assert_eq!(shape.length, 1);
        assert_eq!(shape.props.kind, ShapeKind::Region);
    }

    #[test]
    fn test_mismatched_entry_keeps_own_props() {
        let mut heap = SymHeap::default();
        let sls = Binding::sls(NEXT);
        let seg = heap
            .insert(HeapObject::segment(
                Size::new(16),
                Segment {
                    binding: sls,
                    len: SegLen::AtLeast(2),
                },
            ))
            .unwrap();
        let shape = heap.discover(seg, Binding::dls(NEXT, PREV));
        assert_eq!(shape.length, 1);
        assert_eq!(shape.props, ShapeProps::new(ShapeKind::Sls, sls, Size::new(16)));

        // Too small to hold the link field.
        let tiny = heap.alloc(Size::new(4)).unwrap();
        let shape = heap.discover(tiny, sls);
        assert_eq!(shape.length, 1);
        assert_eq!(
            shape.props,
            ShapeProps::new(ShapeKind::Region, Binding::default(), Size::new(4))
        );
    }

    #[test]
    fn test_discover_invalid_entry() {
        let heap = SymHeap::default();
        let shape = heap.discover(ObjId::new(3), Binding::sls(NEXT));
        assert!(!shape.is_valid());
    }

    #[test]
    fn test_discover_broken_back_link_truncates() {
        let mut heap = SymHeap::default();
        let nodes = dll(&mut heap, 4);
        heap.write(nodes[2], PREV, PTR_SIZE, Value::Null).unwrap();
        let shape = heap.discover(nodes[0], Binding::dls(NEXT, PREV));
        assert_eq!(shape.length, 2);

        // The same run is still a singly-linked list.
        let shape = heap.discover(nodes[0], Binding::sls(NEXT));
        assert_eq!(shape.length, 4);
        assert_eq!(shape.props.kind, ShapeKind::Sls);
    }

    #[test]
    fn test_discover_size_mismatch_truncates() {
        let mut heap = SymHeap::default();
        let a = heap.alloc(Size::new(16)).unwrap();
        let b = heap.alloc(Size::new(16)).unwrap();
        let c = heap.alloc(Size::new(32)).unwrap();
        heap.write(a, NEXT, PTR_SIZE, Value::ptr(b)).unwrap();
        heap.write(b, NEXT, PTR_SIZE, Value::ptr(c)).unwrap();
        heap.write(c, NEXT, PTR_SIZE, Value::Null).unwrap();
        let shape = heap.discover(a, Binding::sls(NEXT));
        assert_eq!(shape.length, 2);
    }

    #[test]
    fn test_discover_cycle() {
        let mut heap = SymHeap::default();
        let nodes: Vec<ObjId> = (0..3).map(|_| heap.alloc(Size::new(8)).unwrap()).collect();
        for i in 0..3 {
            heap.write(nodes[i], NEXT, PTR_SIZE, Value::ptr(nodes[(i + 1) % 3]))
                .unwrap();
        }
        let shape = heap.discover(nodes[0], Binding::sls(NEXT));
        assert_eq!(shape.length, 3);
        assert!(heap.is_cyclic(&shape));

        let shapes = heap.discover_all(&[Binding::sls(NEXT)]);
        assert_eq!(shapes.len(), 1);
        assert_eq!(shapes[0].length, 3);
    }

    #[test]
    fn test_discover_any_prefers_dls() {
        let mut heap = SymHeap::default();
        let nodes = dll(&mut heap, 3);
        let shape = heap.discover_any(nodes[0], &[Binding::sls(NEXT), Binding::dls(NEXT, PREV)]);
        assert_eq!(shape.props.kind, ShapeKind::Dls);
        assert_eq!(shape.length, 3);
    }

    #[test]
    fn test_binding_candidates() {
        let mut heap = SymHeap::default();
        let nodes = dll(&mut heap, 3);
        let candidates = heap.binding_candidates(nodes[0]);
        assert_eq!(candidates[0], Binding::dls(NEXT, PREV));
        assert!(candidates.contains(&Binding::sls(NEXT)));
    }

    #[test]
    fn test_discover_all_is_maximal() {
        let mut heap = SymHeap::default();
        let nodes = dll(&mut heap, 4);
        let other = dll(&mut heap, 2);
        let shapes = heap.discover_all(&[Binding::dls(NEXT, PREV)]);
        assert_eq!(
            shapes,
            vec![
                Shape::new(
                    nodes[0],
                    ShapeProps::new(ShapeKind::Dls, Binding::dls(NEXT, PREV), Size::new(16)),
                    4
                ),
                Shape::new(
                    other[0],
                    ShapeProps::new(ShapeKind::Dls, Binding::dls(NEXT, PREV), Size::new(16)),
                    2
                ),
            ]
        );
        for shape in &shapes {
            // No predecessor extends the run.
            let binding = shape.props.binding;
            assert!(heap
                .objects()
                .all(|(id, _)| heap.successor(id, &binding) != Some(shape.entry)));
        }
    }
}
