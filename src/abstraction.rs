//! # Shape abstraction and concretization
//!
//! **Abstraction** folds the run of a discovered [`Shape`] into a single
//! abstract object (a list segment) that records the binding, the element size
//! and the number of nodes it stands for. The entry keeps its handle, the other
//! run objects are released, and every pointer that targeted a run object is
//! redirected to the segment together with the [`Hop`] of the node it meant.
//!
//! **Concretization** is the inverse for a single node: it materializes the
//! node at a given hop as a concrete object and splits what remains into (up
//! to) two segments before and after it. Empty remainders are dropped.
//!
//! Nodes may each own a private object (a data record only that node points
//! to). Folding merges those into one *prototype* the segment points to, and
//! concretization hands every part a copy of it again. Pointer fields that
//! differ across a run in any other way cannot be summarized, and such a run
//! is not folded.
//!
//! Segments of unknown length (`AtLeast(n)`) may be too short to tell apart
//! the nodes that pointers refer to. Concretization then first splits the
//! state: each shorter exact length becomes a separate alternative heap that
//! the caller has to explore on its own.
//!
//! ## Opportunistic folding
//!
//! [`SymHeap::fold_shapes`] discovers all shapes and folds them, except that a
//! node with a pointer into it from outside its run (other than to the entry,
//! or the back-link of the node following the tail) is *distinguished*: it is
//! never buried inside a segment, so errors involving it can still be reported
//! precisely.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::debug;

use crate::error::{HeapError, Result};
use crate::heap::{HeapObject, ObjKind, Segment, Slot, SymHeap};
use crate::reference::ObjId;
use crate::shape::{Binding, SegLen, Shape, ShapeProps};
use crate::types::Offset;
use crate::value::{Field, Hop, Pointer, Value};

/// Result of materializing one node of a segment.
#[derive(Debug, Clone)]
pub struct Concretized {
    /// The materialized node.
    pub object: ObjId,
    /// What is left of the segment before the node, if anything.
    pub before: Option<ObjId>,
    /// What is left of the segment after the node, if anything.
    pub after: Option<ObjId>,
    /// States the segment was too short for, still to be explored.
    pub alternatives: Vec<SymHeap>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Part {
    Before,
    Object,
    After,
}

/// How the field at one offset of the pieces of a run is summarized.
enum Merge {
    /// Every piece holds the same field.
    Keep(Field),
    /// Scalars of one width that differ.
    Widen(u32),
    /// Scalars that do not line up.
    Drop,
    /// Every piece points to a private object of its own.
    Own { targets: Vec<ObjId>, proto: HeapObject },
}

/// Fields of the segment folding a run, and the private objects it takes over.
struct Summary {
    fields: BTreeMap<Offset, Field>,
    /// Prototypes replacing the private object of the first piece.
    protos: Vec<(ObjId, HeapObject)>,
    /// Private objects of the other pieces.
    released: Vec<ObjId>,
}

/// Lengths of the parts left before and after the node at `at`.
fn split_len(len: SegLen, at: Hop) -> (SegLen, SegLen) {
    match (len, at) {
        (SegLen::Exact(n), Hop::Head(k)) => (SegLen::Exact(k), SegLen::Exact(n - k - 1)),
        (SegLen::Exact(n), Hop::Tail(k)) => (SegLen::Exact(n - k - 1), SegLen::Exact(k)),
        (SegLen::AtLeast(m), Hop::Head(k)) => (SegLen::Exact(k), SegLen::AtLeast(m - k - 1)),
        (SegLen::AtLeast(m), Hop::Tail(k)) => (SegLen::AtLeast(m - k - 1), SegLen::Exact(k)),
    }
}

/// Part of the split segment the node at `hop` ends up in, and its hop there.
fn locate(hop: Hop, len: SegLen, at: Hop) -> Option<(Part, Hop)> {
    if let SegLen::Exact(_) = len {
        let pos = hop.from_entry(len)?;
        let k = at.from_entry(len)?;
        return Some(match pos.cmp(&k) {
            std::cmp::Ordering::Less => (Part::Before, Hop::Head(pos)),
            std::cmp::Ordering::Equal => (Part::Object, Hop::ENTRY),
            std::cmp::Ordering::Greater => (Part::After, Hop::Head(pos - k - 1)),
        });
    }
    Some(match (at, hop) {
        (Hop::Head(k), Hop::Head(j)) if j < k => (Part::Before, Hop::Head(j)),
        (Hop::Head(k), Hop::Head(j)) if j == k => (Part::Object, Hop::ENTRY),
        (Hop::Head(k), Hop::Head(j)) => (Part::After, Hop::Head(j - k - 1)),
        (Hop::Head(_), Hop::Tail(j)) => (Part::After, Hop::Tail(j)),
        (Hop::Tail(k), Hop::Tail(j)) if j < k => (Part::After, Hop::Tail(j)),
        (Hop::Tail(k), Hop::Tail(j)) if j == k => (Part::Object, Hop::ENTRY),
        (Hop::Tail(k), Hop::Tail(j)) => (Part::Before, Hop::Tail(j - k - 1)),
        (Hop::Tail(_), Hop::Head(j)) => (Part::Before, Hop::Head(j)),
    })
}

/// Normal form of a hop inside an object standing for `len` nodes.
fn normalize(hop: Hop, len: SegLen) -> Hop {
    match (len, hop) {
        (SegLen::Exact(1), _) => Hop::ENTRY,
        (SegLen::Exact(n), Hop::Head(k)) => Hop::at(k, n),
        (SegLen::Exact(n), Hop::Tail(k)) => Hop::at(n - 1 - k, n),
        (SegLen::AtLeast(_), hop) => hop,
    }
}

/// Checks that in every segment of at least `m` nodes, the nodes addressed by
/// head hops are distinct from those addressed by tail hops, and that the
/// remainder on the far side of `at` is not empty.
fn is_unambiguous(m: u32, at: Hop, hops: &[Hop]) -> bool {
    let (mut max_head, mut max_tail) = match at {
        Hop::Head(k) => (k, 0),
        Hop::Tail(k) => (0, k),
    };
    for hop in hops {
        match *hop {
            Hop::Head(k) => max_head = max_head.max(k),
            Hop::Tail(k) => max_tail = max_tail.max(k),
        }
    }
    max_head + max_tail + 2 <= m
}

fn mk_link(target: ObjId, hop: Hop, binding: &Binding) -> Field {
    Field::ptr(Value::Ptr(Pointer {
        target,
        hop,
        offset: binding.head,
    }))
}

impl SymHeap {
    pub(crate) fn set_seg_len(&mut self, obj: ObjId, len: SegLen) {
        if let Some(o) = self.object_mut(obj) {
            if let ObjKind::Segment(seg) = &mut o.kind {
                seg.len = len;
            }
        }
    }

    /// Fold the run of `shape` into one abstract object and return it.
    ///
    /// Shapes of length one are left alone. The entry keeps its handle.
    pub fn abstract_shape(&mut self, shape: &Shape) -> Result<ObjId> {
        if shape.length < 2 {
            return Ok(shape.entry);
        }
        let run = self.objects_of(shape);
        if run.len() != shape.length as usize {
            return Err(HeapError::integrity(format!("stale shape {}", shape)));
        }
        let binding = shape.props.binding;
        let size = self.get(shape.entry)?.size;

        let mut pieces = Vec::with_capacity(run.len());
        for &id in &run {
            let o = self.get(id)?;
            if !o.admits(&binding, size) {
                return Err(HeapError::integrity(format!(
                    "{} does not match {}",
                    id, shape.props
                )));
            }
            pieces.push((id, o.seg_len()));
        }
        let total = pieces
            .iter()
            .skip(1)
            .fold(pieces[0].1, |acc, &(_, len)| acc.concat(len));

        // Known offsets of each piece from the entry and from the tail.
        let mut head_off = Vec::with_capacity(pieces.len());
        let mut acc = Some(0u32);
        for &(_, len) in &pieces {
            head_off.push(acc);
            acc = acc.filter(|_| len.is_exact()).map(|a| a + len.min());
        }
        let mut tail_off = vec![None; pieces.len()];
        let mut acc = Some(0u32);
        for (i, &(_, len)) in pieces.iter().enumerate().rev() {
            tail_off[i] = acc;
            acc = acc.filter(|_| len.is_exact()).map(|a| a + len.min());
        }
        let index: HashMap<ObjId, usize> = pieces.iter().enumerate().map(|(i, &(id, _))| (id, i)).collect();

        let rebase = |target: ObjId, hop: Hop| -> Option<Hop> {
            let i = index[&target];
            let len = pieces[i].1;
            if let (Some(off), Some(pos)) = (head_off[i], hop.from_entry(len)) {
                let p = off + pos;
                return Some(match total {
                    SegLen::Exact(n) => Hop::at(p, n),
                    SegLen::AtLeast(_) => Hop::Head(p),
                });
            }
            let back = match (hop, len) {
                (Hop::Tail(k), _) => Some(k),
                (Hop::Head(k), SegLen::Exact(n)) => n.checked_sub(k + 1),
                (Hop::Head(_), SegLen::AtLeast(_)) => None,
            };
            match (tail_off[i], back) {
                (Some(off), Some(b)) => Some(match total {
                    SegLen::Exact(n) => Hop::at(n - 1 - (off + b), n),
                    SegLen::AtLeast(_) => Hop::Tail(off + b),
                }),
                _ => None,
            }
        };

        let ids: Vec<ObjId> = pieces.iter().map(|&(id, _)| id).collect();
        let summary = self.summarize(&ids, &binding)?;

        // Every pointer into the run must stay expressible after the fold.
        let mut table = HashMap::new();
        let targets = self
            .pointers()
            .into_iter()
            .filter(|(slot, _)| match slot {
                Slot::Field(obj, _) => !index.contains_key(obj),
                Slot::Var(_) => true,
            })
            .map(|(_, p)| p)
            .chain(summary.fields.values().filter_map(|f| f.value.as_ptr()))
            .filter(|p| index.contains_key(&p.target));
        for p in targets {
            let hop = rebase(p.target, p.hop).ok_or_else(|| {
                HeapError::integrity(format!("pointer {} cannot be rebased into {}", p, shape))
            })?;
            table.insert((p.target, p.hop), hop);
        }

        let entry = shape.entry;
        let mut folded = HeapObject::segment(size, Segment { binding, len: total });
        for (off, field) in summary.fields {
            folded.set_field(off, field);
        }
        for &(id, _) in &pieces[1..] {
            self.discard(id);
        }
        for (id, proto) in summary.protos {
            if let Some(o) = self.object_mut(id) {
                *o = proto;
            }
        }
        for id in summary.released {
            self.discard(id);
        }
        if let Some(o) = self.object_mut(entry) {
            *o = folded;
        }
        self.rewrite_pointers(|p| match table.get(&(p.target, p.hop)) {
            Some(&hop) => Value::Ptr(Pointer {
                target: entry,
                hop,
                offset: p.offset,
            }),
            None => Value::Ptr(p),
        });

        debug!("abstract_shape({}) -> {} of length {}", shape, entry, total);
        Ok(entry)
    }

    /// Fields of the segment summarizing `pieces`: the exits of the run plus
    /// the data fields the pieces agree on.
    fn summarize(&self, pieces: &[ObjId], binding: &Binding) -> Result<Summary> {
        let owners = self.owners();
        let mut summary = Summary {
            fields: BTreeMap::new(),
            protos: Vec::new(),
            released: Vec::new(),
        };

        for off in self.data_offsets(pieces, binding) {
            let merge = self.merge_field(pieces, off, &owners).ok_or_else(|| {
                HeapError::integrity(format!("pointers at {} differ across the run", off))
            })?;
            match merge {
                Merge::Keep(field) => {
                    summary.fields.insert(off, field);
                }
                Merge::Widen(width) => {
                    summary.fields.insert(off, Field::new(width, Value::Unknown));
                }
                Merge::Drop => {}
                Merge::Own { targets, proto } => {
                    if let Some(field) = self.object(pieces[0]).and_then(|o| o.field(off)) {
                        summary.fields.insert(off, *field);
                    }
                    summary.protos.push((targets[0], proto));
                    summary.released.extend_from_slice(&targets[1..]);
                }
            }
        }

        let objects: Vec<&HeapObject> = pieces.iter().filter_map(|&id| self.object(id)).collect();
        if let Some(tail) = objects.last() {
            if let Some(next) = tail.field(binding.next) {
                summary.fields.insert(binding.next, *next);
            }
        }
        if let (Some(prev), Some(entry)) = (binding.prev, objects.first()) {
            if let Some(field) = entry.field(prev) {
                summary.fields.insert(prev, *field);
            }
        }
        Ok(summary)
    }

    /// Offsets of the fields of `pieces` other than the links.
    fn data_offsets(&self, pieces: &[ObjId], binding: &Binding) -> BTreeSet<Offset> {
        pieces
            .iter()
            .filter_map(|&id| self.object(id))
            .flat_map(|o| o.fields().map(|(off, _)| off))
            .filter(|&off| off != binding.next && Some(off) != binding.prev)
            .collect()
    }

    /// Locations pointing to each object.
    fn owners(&self) -> HashMap<ObjId, Vec<Slot>> {
        let mut owners: HashMap<ObjId, Vec<Slot>> = HashMap::new();
        for (slot, p) in self.pointers() {
            owners.entry(p.target).or_default().push(slot);
        }
        owners
    }

    /// Summarize the field at `off` across `pieces`, `None` when it cannot be.
    fn merge_field(&self, pieces: &[ObjId], off: Offset, owners: &HashMap<ObjId, Vec<Slot>>) -> Option<Merge> {
        let fields: Vec<Option<&Field>> = pieces
            .iter()
            .map(|&id| self.object(id).and_then(|o| o.field(off)))
            .collect();
        let first = fields.first().copied().flatten();
        if let Some(first) = first {
            if fields.iter().all(|f| *f == Some(first)) {
                return Some(Merge::Keep(*first));
            }
        }
        if !fields.iter().flatten().any(|f| matches!(f.value, Value::Ptr(_))) {
            return Some(match first {
                Some(first) if fields.iter().all(|f| f.map_or(false, |f| f.width == first.width)) => {
                    Merge::Widen(first.width)
                }
                _ => Merge::Drop,
            });
        }

        let mut targets = Vec::with_capacity(pieces.len());
        let mut target_offset = None;
        for (&piece, field) in pieces.iter().zip(&fields) {
            let Value::Ptr(p) = (*field)?.value else {
                return None;
            };
            if p.hop != Hop::ENTRY
                || pieces.contains(&p.target)
                || target_offset.map_or(false, |o| o != p.offset)
                || !self.is_private(piece, off, p.target, owners)
            {
                return None;
            }
            target_offset = Some(p.offset);
            targets.push(p.target);
        }
        let proto = self.merge_private(&targets)?;
        Some(Merge::Own { targets, proto })
    }

    /// Checks whether `target` is a region only the field at `off` of `owner`
    /// points to. A segment owns a prototype, a concrete node a plain region.
    fn is_private(&self, owner: ObjId, off: Offset, target: ObjId, owners: &HashMap<ObjId, Vec<Slot>>) -> bool {
        let (Some(o), Some(t)) = (self.object(owner), self.object(target)) else {
            return false;
        };
        target != owner
            && !t.is_abstract()
            && t.is_proto() == o.is_abstract()
            && owners
                .get(&target)
                .map_or(false, |slots| slots[..] == [Slot::Field(owner, off)])
    }

    /// One prototype standing for all of `targets`, if their contents line up.
    fn merge_private(&self, targets: &[ObjId]) -> Option<HeapObject> {
        let objects: Vec<&HeapObject> = targets.iter().map(|&id| self.object(id)).collect::<Option<_>>()?;
        let size = objects.first()?.size;
        if objects.iter().any(|o| o.size != size) {
            return None;
        }
        let offsets: BTreeSet<Offset> = objects
            .iter()
            .flat_map(|o| o.fields().map(|(off, _)| off))
            .collect();

        let mut proto = HeapObject::region(size);
        proto.set_proto(true);
        for off in offsets {
            let fields: Vec<&Field> = objects.iter().map(|o| o.field(off)).collect::<Option<_>>()?;
            let first = *fields[0];
            if fields.iter().all(|f| **f == first) {
                proto.set_field(off, first);
            } else if fields
                .iter()
                .all(|f| f.width == first.width && !matches!(f.value, Value::Ptr(_)))
            {
                proto.set_field(off, Field::new(first.width, Value::Unknown));
            } else {
                return None;
            }
        }
        Some(proto)
    }

    /// Checks whether two neighbouring run objects can be folded together.
    fn foldable(&self, a: ObjId, b: ObjId, binding: &Binding, owners: &HashMap<ObjId, Vec<Slot>>) -> bool {
        self.data_offsets(&[a, b], binding)
            .into_iter()
            .all(|off| self.merge_field(&[a, b], off, owners).is_some())
    }

    /// Materialize the node `hop` hops from the entry of `obj`.
    pub fn concretize(&mut self, obj: ObjId, hop: u32) -> Result<Concretized> {
        self.concretize_at(obj, Hop::Head(hop))
    }

    /// Materialize the node of `obj` addressed by `at`.
    pub fn concretize_at(&mut self, obj: ObjId, at: Hop) -> Result<Concretized> {
        let o = self.get(obj)?;
        let Some(seg) = o.as_segment() else {
            if at.is_within(SegLen::Exact(1)) {
                return Ok(Concretized {
                    object: obj,
                    before: None,
                    after: None,
                    alternatives: Vec::new(),
                });
            }
            return Err(HeapError::integrity(format!("hop {} into concrete object {}", at, obj)));
        };
        if !at.is_within(seg.len) {
            return Err(HeapError::integrity(format!(
                "hop {} exceeds length {} of {}",
                at, seg.len, obj
            )));
        }
        let binding = seg.binding;

        let mut alternatives = Vec::new();
        let mut len = seg.len;
        let at = match len {
            SegLen::Exact(_) => Hop::Head(at.from_entry(len).unwrap_or(0)),
            SegLen::AtLeast(_) => {
                let hops: Vec<Hop> = self.incoming(obj).into_iter().map(|(_, p)| p.hop).collect();
                while !is_unambiguous(len.min(), at, &hops) {
                    let mut alt = self.clone();
                    let exact = SegLen::Exact(len.min());
                    alt.set_seg_len(obj, exact);
                    alt.rewrite_pointers(|p| {
                        if p.target == obj {
                            Value::Ptr(p.with_hop(normalize(p.hop, exact)))
                        } else {
                            Value::Ptr(p)
                        }
                    });
                    debug!("concretize: split off {} of exact length {}", obj, len.min());
                    alternatives.push(alt);
                    len = SegLen::AtLeast(len.min() + 1);
                    self.set_seg_len(obj, len);
                }
                at
            }
        };
        let (before_len, after_len) = split_len(len, at);

        // Where every pointer into the segment ends up.
        let mut table = HashMap::new();
        for (_, p) in self.incoming(obj) {
            let (part, hop) = locate(p.hop, len, at).ok_or_else(|| {
                HeapError::integrity(format!("pointer {} outside of {} ({})", p, obj, len))
            })?;
            let hop = match part {
                Part::Before => normalize(hop, before_len),
                Part::Object => Hop::ENTRY,
                Part::After => normalize(hop, after_len),
            };
            table.insert(p.hop, (part, hop));
        }

        let template = self.get(obj)?.clone();
        let mut parts: Vec<(Part, SegLen)> = Vec::with_capacity(3);
        if before_len.min() > 0 {
            parts.push((Part::Before, before_len));
        }
        parts.push((Part::Object, SegLen::Exact(1)));
        if after_len.min() > 0 {
            parts.push((Part::After, after_len));
        }

        let protos: Vec<(Offset, Field, Pointer)> = template
            .fields()
            .filter_map(|(off, f)| f.value.as_ptr().map(|p| (off, *f, p)))
            .filter(|(_, _, p)| self.object(p.target).map_or(false, |t| t.is_proto()))
            .collect();

        let mut ids: Vec<(Part, ObjId, SegLen)> = Vec::with_capacity(parts.len());
        let mut fresh = Vec::new();
        for &(part, len) in &parts {
            match self.insert_piece(&template, binding, len, &protos, &mut fresh) {
                Ok(id) => ids.push((part, id, len)),
                Err(e) => {
                    for &id in &fresh {
                        self.discard(id);
                    }
                    return Err(e);
                }
            }
        }

        // Chain the parts together; the outer ends keep the exits of the segment.
        for w in ids.windows(2) {
            let (_, a, a_len) = w[0];
            let (_, b, _) = w[1];
            let a_tail = if a_len == SegLen::Exact(1) { Hop::ENTRY } else { Hop::Tail(0) };
            if let Some(o) = self.object_mut(a) {
                o.set_field(binding.next, mk_link(b, Hop::ENTRY, &binding));
            }
            if let (Some(prev), Some(o)) = (binding.prev, self.object_mut(b)) {
                o.set_field(prev, mk_link(a, normalize(a_tail, a_len), &binding));
            }
        }

        let id_of = |part: Part| ids.iter().find(|(p, _, _)| *p == part).map(|&(_, id, _)| id);
        let object = id_of(Part::Object).unwrap_or(ObjId::INVALID);
        let before = id_of(Part::Before);
        let after = id_of(Part::After);
        self.rewrite_pointers(|p| {
            if p.target != obj {
                return Value::Ptr(p);
            }
            match table.get(&p.hop).and_then(|&(part, hop)| id_of(part).map(|id| (id, hop))) {
                Some((target, hop)) => Value::Ptr(Pointer {
                    target,
                    hop,
                    offset: p.offset,
                }),
                None => Value::Ptr(p),
            }
        });
        self.discard(obj);
        for (_, _, p) in protos {
            self.discard(p.target);
        }

        debug!(
            "concretize({} at {}) -> {} (before: {:?}, after: {:?}, alternatives: {})",
            obj,
            at,
            object,
            before,
            after,
            alternatives.len()
        );
        Ok(Concretized {
            object,
            before,
            after,
            alternatives,
        })
    }

    /// Insert a part cut out of `template`, with its own copies of the
    /// prototypes the template points to.
    fn insert_piece(
        &mut self,
        template: &HeapObject,
        binding: Binding,
        len: SegLen,
        protos: &[(Offset, Field, Pointer)],
        fresh: &mut Vec<ObjId>,
    ) -> Result<ObjId> {
        let mut piece = piece_of(template, binding, len);
        for &(off, field, p) in protos {
            let mut copy = self.get(p.target)?.clone();
            copy.set_proto(len != SegLen::Exact(1));
            let id = self.insert(copy)?;
            fresh.push(id);
            piece.set_field(off, Field::new(field.width, Value::Ptr(Pointer { target: id, ..p })));
        }
        let id = self.insert(piece)?;
        fresh.push(id);
        Ok(id)
    }

    /// Resolve a pointer to a concrete node, concretizing its target if needed.
    ///
    /// Returns the rewritten pointer and the alternative states that the
    /// concretization split off.
    pub fn materialize(&mut self, ptr: Pointer) -> Result<(Pointer, Vec<SymHeap>)> {
        if !self.get(ptr.target)?.is_abstract() {
            return Ok((ptr, Vec::new()));
        }
        let c = self.concretize_at(ptr.target, ptr.hop)?;
        Ok((Pointer::to(c.object).with_offset(ptr.offset), c.alternatives))
    }

    /// Discover every shape in the heap and fold the parts of them that hold no
    /// distinguished node. Returns the number of segments created or grown.
    pub fn fold_shapes(&mut self) -> Result<usize> {
        let bindings = self.all_binding_candidates();
        if bindings.is_empty() {
            return Ok(0);
        }

        let mut folds = 0;
        for shape in self.discover_all(&bindings) {
            for run in self.undistinguished_runs(&shape) {
                if run.len() < 2 {
                    continue;
                }
                let sub = Shape::new(
                    run[0],
                    ShapeProps::new(shape.props.binding.kind(), shape.props.binding, shape.props.size),
                    run.len() as u32,
                );
                self.abstract_shape(&sub)?;
                folds += 1;
            }
        }
        Ok(folds)
    }

    /// Split the run of `shape` at its distinguished nodes and between
    /// neighbours whose fields cannot be summarized together.
    fn undistinguished_runs(&self, shape: &Shape) -> Vec<Vec<ObjId>> {
        let binding = shape.props.binding;
        let run = self.objects_of(shape);
        let members: BTreeSet<ObjId> = run.iter().copied().collect();
        let tail = run.last().copied();
        let beyond = tail.and_then(|t| self.successor(t, &binding));

        let owners = self.owners();
        let mut incoming: HashMap<ObjId, Vec<(Slot, Pointer)>> = HashMap::new();
        for (slot, p) in self.pointers() {
            if members.contains(&p.target) {
                incoming.entry(p.target).or_default().push((slot, p));
            }
        }

        let mut runs = Vec::new();
        let mut current = Vec::new();
        for (i, &id) in run.iter().enumerate() {
            let external: Vec<&Pointer> = incoming
                .get(&id)
                .into_iter()
                .flatten()
                .filter(|(slot, p)| match slot {
                    Slot::Field(src, off) => {
                        if members.contains(src) {
                            return false;
                        }
                        let back_link = Some(id) == tail
                            && Some(*src) == beyond
                            && Some(*off) == binding.prev
                            && self.object(id).map(|o| o.tail_hop()) == Some(p.hop);
                        !back_link
                    }
                    Slot::Var(_) => true,
                })
                .map(|(_, p)| p)
                .collect();
            let isolated = external.iter().any(|p| p.hop != Hop::ENTRY);
            let starts = i > 0 && !external.is_empty();
            let apart = current
                .last()
                .map_or(false, |&prev| !self.foldable(prev, id, &binding, &owners));
            if (starts || isolated || apart) && !current.is_empty() {
                runs.push(std::mem::take(&mut current));
            }
            current.push(id);
            if isolated {
                runs.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            runs.push(current);
        }
        runs
    }
}

/// A concrete node or a shorter segment cut out of `template`.
fn piece_of(template: &HeapObject, binding: Binding, len: SegLen) -> HeapObject {
    let mut piece = if len == SegLen::Exact(1) {
        HeapObject::region(template.size)
    } else {
        HeapObject::segment(template.size, Segment { binding, len })
    };
    for (off, field) in template.fields() {
        piece.set_field(off, *field);
    }
    piece
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::error::ErrorClass;
    use crate::types::{Size, PTR_SIZE};

    const NEXT: Offset = Offset::new(0);
    const PREV: Offset = Offset::new(8);
    const DATA: Offset = Offset::new(8);

    fn dls() -> Binding {
        Binding::dls(NEXT, PREV)
    }

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

    fn sll(heap: &mut SymHeap, n: usize) -> Vec<ObjId> {
        let nodes: Vec<ObjId> = (0..n).map(|_| heap.alloc(Size::new(16)).unwrap()).collect();
        for (i, &node) in nodes.iter().enumerate() {
            let next = nodes.get(i + 1).map_or(Value::Null, |&n| Value::ptr(n));
            heap.write(node, NEXT, PTR_SIZE, next).unwrap();
            heap.write(node, Offset::new(8), 4, Value::Int(7)).unwrap();
        }
        nodes
    }

    /// A singly-linked list whose nodes each own an 8-byte record at `DATA`.
    fn owning_sll(heap: &mut SymHeap, n: usize) -> (Vec<ObjId>, Vec<ObjId>) {
        let nodes = sll(heap, n);
        let mut records = Vec::with_capacity(n);
        for (i, &node) in nodes.iter().enumerate() {
            let record = heap.alloc(Size::new(8)).unwrap();
            heap.write(record, Offset::ZERO, 4, Value::Int(i as i64)).unwrap();
            heap.write(node, DATA, PTR_SIZE, Value::ptr(record)).unwrap();
            records.push(record);
        }
        (nodes, records)
    }

    fn ptr_at(target: ObjId, hop: Hop) -> Value {
        Value::Ptr(Pointer::to(target).with_hop(hop))
    }

    #[test]
    fn test_abstract_dll() {
        let mut heap = SymHeap::default();
        let nodes = dll(&mut heap, 5);
        heap.set_var("head", Value::ptr(nodes[0]));
        heap.set_var("tail", Value::ptr(nodes[4]));

        let shape = heap.discover(nodes[0], dls());
        assert_eq!(shape.length, 5);
        let abs = heap.abstract_shape(&shape).unwrap();
        assert_eq!(abs, nodes[0]);
        assert_eq!(heap.object_count(), 1);

        let o = heap.object(abs).unwrap();
        assert_eq!(o.seg_len(), SegLen::Exact(5));
        assert_eq!(o.ptr_field(NEXT), Value::Null);
        assert_eq!(o.ptr_field(PREV), Value::Null);
        assert_eq!(heap.var("head"), Ok(ptr_at(abs, Hop::ENTRY)));
        assert_eq!(heap.var("tail"), Ok(ptr_at(abs, Hop::Tail(0))));
    }

    #[test]
    fn test_concretize_both_ends_and_free() {
        let mut heap = SymHeap::default();
        let nodes = dll(&mut heap, 5);
        heap.set_var("head", Value::ptr(nodes[0]));
        heap.set_var("tail", Value::ptr(nodes[4]));
        let shape = heap.discover(nodes[0], dls());
        let abs = heap.abstract_shape(&shape).unwrap();

        let first = heap.concretize(abs, 0).unwrap();
        assert!(first.before.is_none());
        assert!(first.alternatives.is_empty());
        let rest = first.after.unwrap();
        assert_eq!(heap.object(rest).unwrap().seg_len(), SegLen::Exact(4));
        assert_eq!(heap.var("head"), Ok(Value::ptr(first.object)));
        assert_eq!(heap.var("tail"), Ok(ptr_at(rest, Hop::Tail(0))));

        let last = heap.concretize(rest, 3).unwrap();
        assert!(last.after.is_none());
        let middle = last.before.unwrap();
        assert_eq!(heap.var("tail"), Ok(Value::ptr(last.object)));

        // The three objects are chained up again.
        assert_eq!(
            heap.read(first.object, NEXT, PTR_SIZE),
            Ok(Value::ptr(middle))
        );
        assert_eq!(
            heap.read(last.object, PREV, PTR_SIZE),
            Ok(ptr_at(middle, Hop::Tail(0)))
        );
        let m = heap.object(middle).unwrap();
        assert_eq!(m.ptr_field(PREV), Value::ptr(first.object));
        assert_eq!(m.ptr_field(NEXT), Value::ptr(last.object));

        heap.free(first.object).unwrap();
        heap.free(last.object).unwrap();
        assert_eq!(heap.object_count(), 1);
        let m = heap.object(middle).unwrap();
        assert!(m.is_abstract());
        assert_eq!(m.seg_len(), SegLen::Exact(3));
    }

    #[test]
    fn test_round_trip_keeps_data() {
        let mut heap = SymHeap::default();
        let nodes = sll(&mut heap, 3);
        heap.set_var("p", Value::ptr(nodes[0]));
        let shape = heap.discover(nodes[0], Binding::sls(NEXT));
        let abs = heap.abstract_shape(&shape).unwrap();

        let mut cur = abs;
        let mut seen = 0;
        loop {
            let c = heap.concretize(cur, 0).unwrap();
            seen += 1;
            assert_eq!(heap.read(c.object, Offset::new(8), 4), Ok(Value::Int(7)));
            match c.after {
                Some(after) => cur = after,
                None => {
                    assert_eq!(heap.read(c.object, NEXT, PTR_SIZE), Ok(Value::Null));
                    break;
                }
            }
        }
        assert_eq!(seen, 3);
        assert_eq!(heap.object_count(), 3);
        assert!(heap.objects().all(|(_, o)| !o.is_abstract()));
    }

    #[test]
    fn test_concretize_out_of_range() {
        let mut heap = SymHeap::default();
        let nodes = dll(&mut heap, 5);
        let shape = heap.discover(nodes[0], dls());
        let abs = heap.abstract_shape(&shape).unwrap();
        let err = heap.concretize(abs, 5).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Integrity);
        assert!(heap.object(abs).unwrap().is_abstract());
    }

    #[test]
    fn test_abstraction_is_idempotent() {
        let mut heap = SymHeap::default();
        let nodes = dll(&mut heap, 4);
        let shape = heap.discover(nodes[0], dls());
        let abs = heap.abstract_shape(&shape).unwrap();

        let again = heap.discover(abs, dls());
        assert_eq!(again.length, 1);
        assert_eq!(heap.abstract_shape(&again), Ok(abs));
        assert_eq!(heap.object_count(), 1);
        assert_eq!(heap.object(abs).unwrap().seg_len(), SegLen::Exact(4));
    }

    #[test]
    fn test_private_records_round_trip() {
        let mut heap = SymHeap::default();
        let (nodes, _) = owning_sll(&mut heap, 3);
        heap.set_var("p", Value::ptr(nodes[0]));

        assert_eq!(heap.fold_shapes(), Ok(1));
        // The segment and one prototype for the three records.
        assert_eq!(heap.object_count(), 2);
        assert!(heap.canonicalize().leaked.is_empty());
        let seg = heap.object(nodes[0]).unwrap();
        assert_eq!(seg.seg_len(), SegLen::Exact(3));
        let proto = heap.deref(seg.ptr_field(DATA)).unwrap();
        assert!(heap.object(proto).unwrap().is_proto());

        let mut cur = nodes[0];
        let mut records = BTreeSet::new();
        loop {
            let c = heap.concretize(cur, 0).unwrap();
            let record = heap.deref(heap.read(c.object, DATA, PTR_SIZE).unwrap()).unwrap();
            let r = heap.object(record).unwrap();
            assert!(!r.is_proto());
            assert_eq!(r.size, Size::new(8));
            assert_eq!(heap.read(record, Offset::ZERO, 4), Ok(Value::Unknown));
            records.insert(record);
            match c.after {
                Some(after) => cur = after,
                None => break,
            }
        }
        assert_eq!(records.len(), 3);
        assert_eq!(heap.object_count(), 6);
        assert!(heap.canonicalize().leaked.is_empty());
        for record in records {
            heap.free(record).unwrap();
        }
    }

    #[test]
    fn test_shared_target_is_kept() {
        let mut heap = SymHeap::default();
        let nodes = sll(&mut heap, 3);
        let header = heap.alloc(Size::new(8)).unwrap();
        for &node in &nodes {
            heap.write(node, DATA, PTR_SIZE, Value::ptr(header)).unwrap();
        }
        heap.set_var("p", Value::ptr(nodes[0]));

        assert_eq!(heap.fold_shapes(), Ok(1));
        assert_eq!(heap.object_count(), 2);
        assert!(!heap.object(header).unwrap().is_proto());
        let c = heap.concretize(nodes[0], 1).unwrap();
        assert_eq!(heap.read(c.object, DATA, PTR_SIZE), Ok(Value::ptr(header)));
        assert_eq!(heap.object_count(), 4);
    }

    #[test]
    fn test_shared_record_splits_run() {
        let mut heap = SymHeap::default();
        let (nodes, records) = owning_sll(&mut heap, 4);
        heap.set_var("p", Value::ptr(nodes[0]));
        heap.set_var("r", Value::ptr(records[2]));

        let shape = heap.discover(nodes[0], Binding::sls(NEXT));
        assert_eq!(shape.length, 4);
        let err = heap.abstract_shape(&shape).unwrap_err();
        assert!(matches!(err, HeapError::ShapeIntegrity(_)));
        assert_eq!(heap.object_count(), 8);

        // Only the first two nodes fold; the records stay reachable.
        assert_eq!(heap.fold_shapes(), Ok(1));
        assert_eq!(heap.object_count(), 6);
        assert_eq!(heap.object(nodes[0]).unwrap().seg_len(), SegLen::Exact(2));
        assert_eq!(heap.read(nodes[2], DATA, PTR_SIZE), Ok(Value::ptr(records[2])));
        assert!(heap.canonicalize().leaked.is_empty());
    }

    #[test]
    fn test_differing_scalars_become_unknown() {
        let mut heap = SymHeap::default();
        let nodes = sll(&mut heap, 3);
        heap.write(nodes[1], Offset::new(8), 4, Value::Int(8)).unwrap();
        let shape = heap.discover(nodes[0], Binding::sls(NEXT));
        let abs = heap.abstract_shape(&shape).unwrap();
        let c = heap.concretize(abs, 0).unwrap();
        assert_eq!(heap.read(c.object, Offset::new(8), 4), Ok(Value::Unknown));
    }

    #[test]
    fn test_unknown_length_splits() {
        let mut heap = SymHeap::default();
        let mut seg = HeapObject::segment(
            Size::new(16),
            Segment {
                binding: dls(),
                len: SegLen::AtLeast(1),
            },
        );
        seg.set_field(NEXT, Field::ptr(Value::Null));
        seg.set_field(PREV, Field::ptr(Value::Null));
        let seg = heap.insert(seg).unwrap();
        heap.set_var("p", ptr_at(seg, Hop::ENTRY));
        heap.set_var("q", ptr_at(seg, Hop::Tail(0)));

        let c = heap.concretize(seg, 0).unwrap();
        assert_eq!(c.alternatives.len(), 1);
        let after = c.after.unwrap();
        assert_eq!(heap.object(after).unwrap().seg_len(), SegLen::AtLeast(1));
        assert_eq!(heap.var("p"), Ok(Value::ptr(c.object)));
        assert_eq!(heap.var("q"), Ok(ptr_at(after, Hop::Tail(0))));

        // In the alternative the segment held exactly one node.
        let mut alt = c.alternatives.into_iter().next().unwrap();
        assert_eq!(alt.object(seg).unwrap().seg_len(), SegLen::Exact(1));
        let single = alt.concretize(seg, 0).unwrap();
        assert!(single.before.is_none() && single.after.is_none());
        assert_eq!(alt.var("p"), Ok(Value::ptr(single.object)));
        assert_eq!(alt.var("q"), Ok(Value::ptr(single.object)));
    }

    #[test]
    fn test_unrebasable_pointer_is_rejected() {
        let mut heap = SymHeap::default();
        let binding = Binding::sls(NEXT);
        let mk = |heap: &mut SymHeap| {
            heap.insert(HeapObject::segment(
                Size::new(16),
                Segment {
                    binding,
                    len: SegLen::AtLeast(2),
                },
            ))
            .unwrap()
        };
        let s1 = mk(&mut heap);
        let r = heap.alloc(Size::new(16)).unwrap();
        let s2 = mk(&mut heap);
        heap.object_mut(s1).unwrap().set_field(NEXT, Field::ptr(Value::ptr(r)));
        heap.write(r, NEXT, PTR_SIZE, Value::ptr(s2)).unwrap();
        heap.object_mut(s2).unwrap().set_field(NEXT, Field::ptr(Value::Null));
        heap.set_var("x", Value::ptr(r));

        let shape = heap.discover(s1, binding);
        assert_eq!(shape.length, 3);
        let err = heap.abstract_shape(&shape).unwrap_err();
        assert!(matches!(err, HeapError::ShapeIntegrity(_)));
        assert_eq!(heap.object_count(), 3);
    }

    #[test]
    fn test_fold_shapes_keeps_distinguished_nodes() {
        let mut heap = SymHeap::default();
        let nodes = sll(&mut heap, 4);
        heap.set_var("head", Value::ptr(nodes[0]));
        heap.set_var("mid", Value::ptr(nodes[2]));

        assert_eq!(heap.fold_shapes(), Ok(2));
        assert_eq!(heap.object_count(), 2);
        assert_eq!(heap.var("mid"), Ok(Value::ptr(nodes[2])));
        let first = heap.object(nodes[0]).unwrap();
        assert_eq!(first.seg_len(), SegLen::Exact(2));
        assert_eq!(first.ptr_field(NEXT), Value::ptr(nodes[2]));
    }

    #[test]
    fn test_fold_shapes_whole_dll() {
        let mut heap = SymHeap::default();
        let nodes = dll(&mut heap, 6);
        heap.set_var("head", Value::ptr(nodes[0]));
        assert_eq!(heap.fold_shapes(), Ok(1));
        assert_eq!(heap.object_count(), 1);
        assert_eq!(heap.object(nodes[0]).unwrap().seg_len(), SegLen::Exact(6));
        // Nothing left to fold.
        assert_eq!(heap.fold_shapes(), Ok(0));
    }

    #[test]
    fn test_materialize() {
        let mut heap = SymHeap::default();
        let nodes = dll(&mut heap, 3);
        heap.set_var("tail", Value::ptr(nodes[2]));
        let shape = heap.discover(nodes[0], dls());
        heap.abstract_shape(&shape).unwrap();

        let Value::Ptr(p) = heap.var("tail").unwrap() else {
            panic!("tail is not a pointer");
        };
        let (q, alternatives) = heap.materialize(p).unwrap();
        assert!(alternatives.is_empty());
        assert!(!heap.object(q.target).unwrap().is_abstract());
        assert_eq!(heap.var("tail"), Ok(Value::Ptr(q)));
        assert_eq!(heap.deref(Value::Ptr(q)), Ok(q.target));
    }
}
