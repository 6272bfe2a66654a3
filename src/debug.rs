//! Debug utilities for inspecting heap snapshots.
//!
//! These render a [`SymHeap`] in a compact text form, for logs and tests.

use std::fmt::Write;

use crate::heap::SymHeap;
use crate::reference::ObjId;
use crate::shape::{SegLen, ShapeKind};
use crate::types::{Offset, Size};
use crate::value::Field;

/// Detailed information about a single heap object.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub id: ObjId,
    pub kind: ShapeKind,
    pub proto: bool,
    pub size: Size,
    /// Number of list nodes (1 for a region)
    pub len: SegLen,
    pub fields: Vec<(Offset, Field)>,
}

impl std::fmt::Display for ObjectInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.proto {
            write!(f, "{} proto", self.id)?;
        } else {
            write!(f, "{} {}", self.id, self.kind)?;
        }
        if self.kind != ShapeKind::Region {
            write!(f, "[{}]", self.len)?;
        }
        write!(f, " {} {{", self.size)?;
        for (i, (off, field)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " {}: {}", off, field.value)?;
        }
        write!(f, " }}")
    }
}

/// All objects and variables of a heap.
#[derive(Debug, Clone)]
pub struct HeapDump {
    pub vars: Vec<(String, String)>,
    pub objects: Vec<ObjectInfo>,
}

impl std::fmt::Display for HeapDump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap ({} objects):", self.objects.len())?;
        for (name, value) in &self.vars {
            writeln!(f, "  {} = {}", name, value)?;
        }
        for object in &self.objects {
            writeln!(f, "  {}", object)?;
        }
        Ok(())
    }
}

impl SymHeap {
    /// Get detailed information about a single object.
    pub fn object_info(&self, id: ObjId) -> Option<ObjectInfo> {
        let o = self.object(id)?;
        Some(ObjectInfo {
            id,
            kind: o.shape_kind(),
            proto: o.is_proto(),
            size: o.size,
            len: o.seg_len(),
            fields: o.fields().map(|(off, f)| (off, *f)).collect(),
        })
    }

    pub fn debug_dump(&self) -> HeapDump {
        HeapDump {
            vars: self.vars().map(|(name, v)| (name.to_string(), v.to_string())).collect(),
            objects: self.objects().filter_map(|(id, _)| self.object_info(id)).collect(),
        }
    }

    pub fn debug_string(&self) -> String {
        self.debug_dump().to_string()
    }

    /// One line per maximal shape.
    pub fn debug_shapes(&self) -> String {
        let mut result = String::new();
        for shape in self.shape_set() {
            let cyclic = if self.is_cyclic(&shape) { " (cyclic)" } else { "" };
            writeln!(&mut result, "{}{}", shape, cyclic).unwrap();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PTR_SIZE;
    use crate::value::Value;

    #[test]
    fn test_object_info() {
        let mut heap = SymHeap::default();
        let a = heap.alloc(Size::new(16)).unwrap();
        heap.write(a, Offset::ZERO, PTR_SIZE, Value::Null).unwrap();
        heap.write(a, Offset::new(8), 4, Value::Int(3)).unwrap();
        let info = heap.object_info(a).unwrap();
        assert_eq!(info.to_string(), "#1 region 16B { +0: NULL, +8: 3 }");
        assert!(heap.object_info(ObjId::new(7)).is_none());
    }

    #[test]
    fn test_dump() {
        let mut heap = SymHeap::default();
        let nodes: Vec<ObjId> = (0..3).map(|_| heap.alloc(Size::new(8)).unwrap()).collect();
        for (i, &n) in nodes.iter().enumerate() {
            let next = nodes.get(i + 1).map_or(Value::Null, |&m| Value::ptr(m));
            heap.write(n, Offset::ZERO, PTR_SIZE, next).unwrap();
        }
        heap.set_var("list", Value::ptr(nodes[0]));
        assert_eq!(heap.debug_shapes(), "SLS(next=+0, 8B) x3 from #1\n");

        heap.fold_shapes().unwrap();
        let dump = heap.debug_string();
        assert_eq!(dump, "Heap (1 objects):\n  list = &#1\n  #1 SLS[3] 8B { +0: NULL }\n");
    }
}
