//! Error taxonomy of the shape engine.
//!
//! Errors fall into three classes that decide how far they propagate:
//!
//! - [`ErrorClass::Integrity`]: an invariant of the engine itself was broken.
//!   The whole analysis run is aborted.
//! - [`ErrorClass::Program`]: a memory error of the analyzed program. Only the
//!   current exploration branch is terminated and the error is reported.
//! - [`ErrorClass::Resource`]: a resource ceiling was hit. The branch is
//!   abandoned with a warning and exploration continues elsewhere.

use thiserror::Error;

use crate::reference::ObjId;
use crate::types::Offset;

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum HeapError {
    #[error("object arena is full ({capacity} objects)")]
    OutOfCapacity { capacity: usize },

    #[error("double free of {0}")]
    DoubleFree(ObjId),

    #[error("{0} was never allocated")]
    InvalidTarget(ObjId),

    #[error("read of uninitialized value at {obj}[{offset}]")]
    UninitializedRead { obj: ObjId, offset: Offset },

    #[error("{width}-byte access at {obj}[{offset}] does not match the stored {stored}-byte value")]
    TypeMismatch {
        obj: ObjId,
        offset: Offset,
        width: u32,
        stored: u32,
    },

    #[error("dereference of NULL")]
    NullDeref,

    #[error("dereference of dangling pointer to {0}")]
    DanglingPointer(ObjId),

    #[error("dereference of a non-pointer value")]
    InvalidDeref,

    #[error("{width}-byte access at {obj}[{offset}] is out of bounds")]
    OutOfBounds { obj: ObjId, offset: Offset, width: u32 },

    #[error("free of {obj} at non-zero offset {offset}")]
    FreeOffset { obj: ObjId, offset: Offset },

    #[error("shape integrity violated: {0}")]
    ShapeIntegrity(String),

    #[error("main() not declared at global scope")]
    NoEntryFunction,

    #[error("unknown variable `{0}`")]
    UnknownVariable(String),

    #[error("unknown block `{0}`")]
    UnknownBlock(String),

    #[error("unhandled config string: \"{0}\"")]
    InvalidConfig(String),
}

/// How far an error propagates.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorClass {
    Integrity,
    Program,
    Resource,
}

impl HeapError {
    pub fn class(&self) -> ErrorClass {
        match self {
            HeapError::OutOfCapacity { .. } => ErrorClass::Resource,
            HeapError::DoubleFree(_)
            | HeapError::InvalidTarget(_)
            | HeapError::ShapeIntegrity(_)
            | HeapError::NoEntryFunction
            | HeapError::UnknownVariable(_)
            | HeapError::UnknownBlock(_)
            | HeapError::InvalidConfig(_) => ErrorClass::Integrity,
            HeapError::UninitializedRead { .. }
            | HeapError::TypeMismatch { .. }
            | HeapError::NullDeref
            | HeapError::DanglingPointer(_)
            | HeapError::InvalidDeref
            | HeapError::OutOfBounds { .. }
            | HeapError::FreeOffset { .. } => ErrorClass::Program,
        }
    }

    pub(crate) fn integrity(msg: impl Into<String>) -> Self {
        HeapError::ShapeIntegrity(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, HeapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes() {
        assert_eq!(HeapError::NullDeref.class(), ErrorClass::Program);
        assert_eq!(
            HeapError::DoubleFree(ObjId::new(1)).class(),
            ErrorClass::Integrity
        );
        assert_eq!(
            HeapError::OutOfCapacity { capacity: 4 }.class(),
            ErrorClass::Resource
        );
    }

    #[test]
    fn test_messages() {
        let err = HeapError::UninitializedRead {
            obj: ObjId::new(3),
            offset: Offset::new(8),
        };
        assert_eq!(err.to_string(), "read of uninitialized value at #3[+8]");
        assert_eq!(
            HeapError::NoEntryFunction.to_string(),
            "main() not declared at global scope"
        );
    }
}
