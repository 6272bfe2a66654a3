//! Object enumeration: which objects a shape consists of.
//!
//! These are pure queries. Abstract objects of a run are returned as
//! themselves; callers that need every concrete node enumerate those again
//! after concretization.

use std::collections::BTreeSet;

use crate::heap::SymHeap;
use crate::reference::ObjId;
use crate::shape::Shape;

impl SymHeap {
    /// Objects of the shape, from entry to tail.
    ///
    /// A stale shape (the heap changed since discovery) yields a shorter list.
    pub fn objects_of(&self, shape: &Shape) -> Vec<ObjId> {
        let mut result = Vec::with_capacity(shape.length as usize);
        if !shape.is_valid() || !self.is_valid(shape.entry) {
            return result;
        }
        let binding = shape.props.binding;
        let mut cur = shape.entry;
        result.push(cur);
        for _ in 1..shape.length {
            match self.successor(cur, &binding) {
                Some(next) if next != shape.entry => {
                    result.push(next);
                    cur = next;
                }
                _ => break,
            }
        }
        result
    }

    /// Objects of the shape, for membership tests.
    pub fn object_set_of(&self, shape: &Shape) -> BTreeSet<ObjId> {
        self.objects_of(shape).into_iter().collect()
    }

    /// The last object of the shape (the opposite of its entry).
    pub fn tail_of(&self, shape: &Shape) -> ObjId {
        if !shape.is_valid() {
            return ObjId::INVALID;
        }
        let binding = shape.props.binding;
        let mut cur = shape.entry;
        for _ in 1..shape.length {
            match self.successor(cur, &binding) {
                Some(next) => cur = next,
                None => break,
            }
        }
        cur
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Binding;
    use crate::types::{Offset, Size, PTR_SIZE};
    use crate::value::Value;

    fn sll(heap: &mut SymHeap, n: usize) -> Vec<ObjId> {
        let nodes: Vec<ObjId> = (0..n).map(|_| heap.alloc(Size::new(8)).unwrap()).collect();
        for (i, &node) in nodes.iter().enumerate() {
            let next = nodes.get(i + 1).map_or(Value::Null, |&n| Value::ptr(n));
            heap.write(node, Offset::ZERO, PTR_SIZE, next).unwrap();
        }
        nodes
    }

    #[test]
    fn test_objects_of() {
        let mut heap = SymHeap::default();
        let nodes = sll(&mut heap, 4);
        let shape = heap.discover(nodes[0], Binding::sls(Offset::ZERO));
        assert_eq!(heap.objects_of(&shape), nodes);
        assert_eq!(heap.tail_of(&shape), nodes[3]);
        assert_eq!(
            heap.object_set_of(&shape),
            nodes.iter().copied().collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn test_single_object() {
        let mut heap = SymHeap::default();
        let nodes = sll(&mut heap, 1);
        let shape = heap.discover(nodes[0], Binding::sls(Offset::ZERO));
        assert_eq!(heap.objects_of(&shape), nodes);
        assert_eq!(heap.tail_of(&shape), nodes[0]);
    }

    #[test]
    fn test_invalid_shape() {
        let heap = SymHeap::default();
        let shape = Shape::default();
        assert!(heap.objects_of(&shape).is_empty());
        assert_eq!(heap.tail_of(&shape), ObjId::INVALID);
    }

    #[test]
    fn test_queries_are_pure() {
        let mut heap = SymHeap::default();
        let nodes = sll(&mut heap, 3);
        let shape = heap.discover(nodes[0], Binding::sls(Offset::ZERO));
        let before = heap.object_count();
        let _ = heap.objects_of(&shape);
        let _ = heap.tail_of(&shape);
        assert_eq!(heap.object_count(), before);
        assert_eq!(heap.discover(nodes[0], Binding::sls(Offset::ZERO)), shape);
    }
}
