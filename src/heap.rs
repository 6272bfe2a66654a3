//! # Symbolic heap graph
//!
//! [`SymHeap`] owns the object arena and the points-to graph of one program
//! state. Objects are addressed by arena handles ([`ObjId`]) rather than owning
//! references, so cyclic and shared structures need no reference counting.
//! Released objects stay behind as tombstones: a pointer to one is detected as
//! dangling instead of silently aliasing a newer allocation.
//!
//! Every object is either a concrete region or an abstract list segment
//! ([`ObjKind`]). Field reads and writes only ever touch concrete objects;
//! resolving a pointer into a segment to a concrete element is the job of
//! [concretization][crate::abstraction].
//!
//! Exploration branches clone the whole heap (`SymHeap: Clone`); two live
//! snapshots never alias.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::Bound;

use log::debug;

use crate::error::{HeapError, Result};
use crate::reference::ObjId;
use crate::shape::{Binding, SegLen, ShapeKind};
use crate::table::Table;
use crate::types::{Offset, Size, PTR_SIZE};
use crate::value::{Field, Pointer, Value};

/// Default ceiling on the number of objects of one heap.
pub const DEFAULT_MAX_OBJECTS: usize = 1 << 16;

/// Summary carried by an abstract object.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Segment {
    pub binding: Binding,
    pub len: SegLen,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ObjKind {
    Region,
    Segment(Segment),
}

/// A block of memory in the symbolic heap.
///
/// For a segment, `fields` describe every node at once: the `next` field holds
/// the pointer leaving the tail, the `prev` field the pointer leaving the
/// entry, and the remaining fields the values all summarized nodes share.
///
/// A *prototype* is a region only a segment points to. It stands for the
/// private object each node of the segment owns, one copy per node.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HeapObject {
    pub size: Size,
    pub kind: ObjKind,
    fields: BTreeMap<Offset, Field>,
    proto: bool,
}

impl HeapObject {
    pub fn region(size: Size) -> Self {
        Self {
            size,
            kind: ObjKind::Region,
            fields: BTreeMap::new(),
            proto: false,
        }
    }

    pub fn segment(size: Size, segment: Segment) -> Self {
        Self {
            size,
            kind: ObjKind::Segment(segment),
            fields: BTreeMap::new(),
            proto: false,
        }
    }

    pub fn is_abstract(&self) -> bool {
        matches!(self.kind, ObjKind::Segment(_))
    }

    pub fn is_proto(&self) -> bool {
        self.proto
    }

    pub(crate) fn set_proto(&mut self, proto: bool) {
        self.proto = proto;
    }

    pub fn as_segment(&self) -> Option<Segment> {
        match self.kind {
            ObjKind::Segment(seg) => Some(seg),
            ObjKind::Region => None,
        }
    }

    pub fn shape_kind(&self) -> ShapeKind {
        match self.kind {
            ObjKind::Region => ShapeKind::Region,
            ObjKind::Segment(seg) => seg.binding.kind(),
        }
    }

    /// Number of concrete list nodes the object stands for.
    pub fn seg_len(&self) -> SegLen {
        match self.kind {
            ObjKind::Region => SegLen::Exact(1),
            ObjKind::Segment(seg) => seg.len,
        }
    }

    pub fn field(&self, offset: Offset) -> Option<&Field> {
        self.fields.get(&offset)
    }

    pub fn fields(&self) -> impl Iterator<Item = (Offset, &Field)> {
        self.fields.iter().map(|(&off, f)| (off, f))
    }

    pub(crate) fn fields_mut(&mut self) -> impl Iterator<Item = (Offset, &mut Field)> {
        self.fields.iter_mut().map(|(&off, f)| (off, f))
    }

    /// Value of the pointer field at `offset`, `Undef` when absent.
    pub fn ptr_field(&self, offset: Offset) -> Value {
        match self.fields.get(&offset) {
            Some(f) if f.width == PTR_SIZE => f.value,
            _ => Value::Undef,
        }
    }

    /// Store a field, dropping every field it overlaps.
    pub(crate) fn set_field(&mut self, offset: Offset, field: Field) {
        let end = offset.get() + field.width as i64;
        let overlapping: Vec<Offset> = self
            .fields
            .range((Bound::Unbounded, Bound::Excluded(Offset::new(end))))
            .filter(|(off, f)| off.get() + f.width as i64 > offset.get())
            .map(|(&off, _)| off)
            .collect();
        for off in overlapping {
            self.fields.remove(&off);
        }
        self.fields.insert(offset, field);
    }

    /// Field starting before `offset` and reaching past it, if any.
    fn overlapping(&self, offset: Offset) -> Option<(Offset, &Field)> {
        self.fields
            .range(..offset)
            .next_back()
            .filter(|(off, f)| off.get() + f.width as i64 > offset.get())
            .map(|(&off, f)| (off, f))
    }
}

/// Location a value is stored at.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Slot {
    Var(String),
    Field(ObjId, Offset),
}

/// Symbolic heap of one program state.
#[derive(Clone)]
pub struct SymHeap {
    objects: Table<HeapObject>,
    vars: BTreeMap<String, Value>,
}

impl SymHeap {
    pub fn new(max_objects: usize) -> Self {
        Self {
            // The sentinel occupies one cell.
            objects: Table::new(max_objects + 1),
            vars: BTreeMap::new(),
        }
    }
}

impl Default for SymHeap {
    fn default() -> Self {
        SymHeap::new(DEFAULT_MAX_OBJECTS)
    }
}

impl Debug for SymHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymHeap")
            .field("capacity", &(self.objects.capacity() - 1))
            .field("objects", &self.objects.real_size())
            .field("vars", &self.vars.len())
            .finish()
    }
}

impl SymHeap {
    pub fn max_objects(&self) -> usize {
        self.objects.capacity() - 1
    }

    /// Number of live objects.
    pub fn object_count(&self) -> usize {
        self.objects.real_size()
    }

    pub fn is_valid(&self, obj: ObjId) -> bool {
        self.objects.is_occupied(obj.index())
    }

    /// Checks whether `obj` was ever allocated in this heap.
    pub fn is_allocated(&self, obj: ObjId) -> bool {
        self.objects.is_allocated(obj.index())
    }

    pub fn object(&self, obj: ObjId) -> Option<&HeapObject> {
        self.objects.get(obj.index())
    }

    pub(crate) fn object_mut(&mut self, obj: ObjId) -> Option<&mut HeapObject> {
        self.objects.get_mut(obj.index())
    }

    /// Look up a live object, classifying why it is missing otherwise.
    pub fn get(&self, obj: ObjId) -> Result<&HeapObject> {
        match self.objects.get(obj.index()) {
            Some(o) => Ok(o),
            None if self.is_allocated(obj) => Err(HeapError::DanglingPointer(obj)),
            None => Err(HeapError::InvalidTarget(obj)),
        }
    }

    fn get_mut(&mut self, obj: ObjId) -> Result<&mut HeapObject> {
        if !self.is_valid(obj) {
            return Err(self.get(obj).err().unwrap_or(HeapError::InvalidTarget(obj)));
        }
        Ok(&mut self.objects[obj.index()])
    }

    fn get_concrete_mut(&mut self, obj: ObjId) -> Result<&mut HeapObject> {
        let o = self.get_mut(obj)?;
        if o.is_abstract() {
            return Err(HeapError::integrity(format!(
                "access to abstract object {} without concretization",
                obj
            )));
        }
        Ok(o)
    }

    /// Live objects in handle order.
    pub fn objects(&self) -> impl Iterator<Item = (ObjId, &HeapObject)> {
        self.objects
            .iter()
            .map(|(i, o)| (ObjId::new(i as u32), o))
    }

    /// Allocate a fresh concrete object of the given size.
    pub fn alloc(&mut self, size: Size) -> Result<ObjId> {
        let obj = self.insert(HeapObject::region(size))?;
        debug!("alloc({}) -> {}", size, obj);
        Ok(obj)
    }

    pub(crate) fn insert(&mut self, object: HeapObject) -> Result<ObjId> {
        let capacity = self.max_objects();
        self.objects
            .add(object)
            .map(|i| ObjId::new(i as u32))
            .ok_or(HeapError::OutOfCapacity { capacity })
    }

    /// Release a concrete object.
    ///
    /// Pointers to it are left in place and become dangling.
    pub fn free(&mut self, obj: ObjId) -> Result<()> {
        debug!("free({})", obj);
        match self.object(obj) {
            None if self.is_allocated(obj) => Err(HeapError::DoubleFree(obj)),
            None => Err(HeapError::InvalidTarget(obj)),
            Some(o) if o.is_abstract() => Err(HeapError::integrity(format!(
                "free of abstract object {} without concretization",
                obj
            ))),
            Some(_) => {
                self.objects.drop(obj.index());
                Ok(())
            }
        }
    }

    /// Drop an object without any checks, as part of a heap rewrite.
    pub(crate) fn discard(&mut self, obj: ObjId) -> Option<HeapObject> {
        self.objects.drop(obj.index())
    }

    /// Read `width` bytes at `offset` of a concrete object.
    pub fn read(&self, obj: ObjId, offset: Offset, width: u32) -> Result<Value> {
        let o = self.get(obj)?;
        if o.is_abstract() {
            return Err(HeapError::integrity(format!(
                "read from abstract object {} without concretization",
                obj
            )));
        }
        if !o.size.admits(offset, width) {
            return Err(HeapError::OutOfBounds { obj, offset, width });
        }
        match o.field(offset) {
            Some(f) if f.width != width => Err(HeapError::TypeMismatch {
                obj,
                offset,
                width,
                stored: f.width,
            }),
            Some(Field { value: Value::Undef, .. }) => {
                Err(HeapError::UninitializedRead { obj, offset })
            }
            Some(f) => Ok(f.value),
            None => match o.overlapping(offset) {
                Some((_, f)) => Err(HeapError::TypeMismatch {
                    obj,
                    offset,
                    width,
                    stored: f.width,
                }),
                None => Err(HeapError::UninitializedRead { obj, offset }),
            },
        }
    }

    /// Write `value` as `width` bytes at `offset` of a concrete object.
    pub fn write(&mut self, obj: ObjId, offset: Offset, width: u32, value: Value) -> Result<()> {
        if let Some(natural) = value.natural_width() {
            if natural != width {
                return Err(HeapError::TypeMismatch {
                    obj,
                    offset,
                    width,
                    stored: natural,
                });
            }
        }
        let o = self.get_concrete_mut(obj)?;
        if !o.size.admits(offset, width) {
            return Err(HeapError::OutOfBounds { obj, offset, width });
        }
        debug!("write({}[{}] := {})", obj, offset, value);
        o.set_field(offset, Field::new(width, value));
        Ok(())
    }

    /// Resolve a pointer value to the concrete object it targets.
    ///
    /// Pointers into abstract segments must be concretized first.
    pub fn deref(&self, value: Value) -> Result<ObjId> {
        let ptr = match value {
            Value::Ptr(p) => p,
            Value::Null => return Err(HeapError::NullDeref),
            Value::Undef => return Err(HeapError::UninitializedRead {
                obj: ObjId::INVALID,
                offset: Offset::ZERO,
            }),
            Value::Unknown | Value::Int(_) => return Err(HeapError::InvalidDeref),
        };
        let o = self.get(ptr.target)?;
        if o.is_abstract() {
            return Err(HeapError::integrity(format!(
                "dereference into abstract object {} at {} without concretization",
                ptr.target, ptr.hop
            )));
        }
        Ok(ptr.target)
    }

    pub fn var(&self, name: &str) -> Result<Value> {
        self.vars
            .get(name)
            .copied()
            .ok_or_else(|| HeapError::UnknownVariable(name.to_string()))
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn remove_var(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }

    pub fn vars(&self) -> impl Iterator<Item = (&str, Value)> {
        self.vars.iter().map(|(k, &v)| (k.as_str(), v))
    }

    /// Every pointer stored anywhere, with its location.
    pub fn pointers(&self) -> Vec<(Slot, Pointer)> {
        let mut result = Vec::new();
        for (name, value) in &self.vars {
            if let Value::Ptr(p) = value {
                result.push((Slot::Var(name.clone()), *p));
            }
        }
        for (obj, o) in self.objects() {
            for (off, f) in o.fields() {
                if let Value::Ptr(p) = f.value {
                    result.push((Slot::Field(obj, off), p));
                }
            }
        }
        result
    }

    /// Locations holding a pointer to `obj`.
    pub fn incoming(&self, obj: ObjId) -> Vec<(Slot, Pointer)> {
        self.pointers()
            .into_iter()
            .filter(|(_, p)| p.target == obj)
            .collect()
    }

    /// Apply `f` to every stored pointer, in variables and fields alike.
    pub(crate) fn rewrite_pointers(&mut self, mut f: impl FnMut(Pointer) -> Value) {
        for value in self.vars.values_mut() {
            if let Value::Ptr(p) = *value {
                *value = f(p);
            }
        }
        for (_, o) in self.objects.iter_mut() {
            for (_, field) in o.fields_mut() {
                if let Value::Ptr(p) = field.value {
                    field.value = f(p);
                }
            }
        }
    }
}
