use std::fmt::{Display, Formatter};

/// Handle of an object in the heap arena.
///
/// Index `0` is reserved as the sentinel "no object" value, mirroring the
/// occupied 0th cell of the arena.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ObjId(u32);

impl ObjId {
    pub const INVALID: ObjId = ObjId(0);

    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Return the index of the object in the arena.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Return the internal representation of the handle.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl Default for ObjId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl Display for ObjId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "#{}", self.0)
        } else {
            write!(f, "#invalid")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_is_default() {
        assert_eq!(ObjId::default(), ObjId::INVALID);
        assert!(!ObjId::INVALID.is_valid());
        assert!(ObjId::new(1).is_valid());
    }

    #[test]
    fn test_display() {
        assert_eq!(ObjId::new(7).to_string(), "#7");
        assert_eq!(ObjId::INVALID.to_string(), "#invalid");
    }
}
