//! Type-safe wrappers for field offsets and object sizes.
//!
//! These newtypes keep byte offsets inside an object apart from object sizes,
//! which are easy to mix up when walking binding descriptors.
use std::fmt;
use std::ops::Add;

/// Width of a pointer field in bytes.
pub const PTR_SIZE: u32 = 8;

/// A byte offset of a field inside a heap object.
///
/// Offsets are signed: pointers to an embedded list head may point into the
/// middle of a node, and the node base is then reached with a negative offset.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Offset(i64);

impl Offset {
    pub const ZERO: Offset = Offset(0);

    pub const fn new(value: i64) -> Self {
        Offset(value)
    }

    /// Returns the raw offset.
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl Add for Offset {
    type Output = Offset;

    fn add(self, rhs: Self) -> Self::Output {
        Offset(self.0 + rhs.0)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 0 {
            write!(f, "{}", self.0)
        } else {
            write!(f, "+{}", self.0)
        }
    }
}

impl From<i64> for Offset {
    fn from(value: i64) -> Self {
        Offset(value)
    }
}

/// Size of an object in bytes.
///
/// # Invariants
///
/// - Size `0` means "unknown" and is compatible with every other size
/// - Two non-zero sizes are compatible only when they are equal
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size(u32);

impl Size {
    pub const UNKNOWN: Size = Size(0);

    pub const fn new(bytes: u32) -> Self {
        Size(bytes)
    }

    /// Returns the raw size in bytes.
    pub const fn bytes(self) -> u32 {
        self.0
    }

    pub const fn is_unknown(self) -> bool {
        self.0 == 0
    }

    /// Checks whether two sizes may describe the same object.
    pub fn is_compatible(self, other: Size) -> bool {
        self.is_unknown() || other.is_unknown() || self == other
    }

    /// Checks whether `width` bytes at `offset` fit in an object of this size.
    pub fn admits(self, offset: Offset, width: u32) -> bool {
        if self.is_unknown() {
            return offset.get() >= 0;
        }
        offset.get() >= 0 && offset.get() + width as i64 <= self.0 as i64
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            write!(f, "?B")
        } else {
            write!(f, "{}B", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_display() {
        assert_eq!(Offset::new(8).to_string(), "+8");
        assert_eq!(Offset::new(-16).to_string(), "-16");
        assert_eq!(Offset::new(8) + Offset::new(-8), Offset::ZERO);
    }

    #[test]
    fn test_size_compatibility() {
        let s16 = Size::new(16);
        let s24 = Size::new(24);
        assert!(s16.is_compatible(s16));
        assert!(!s16.is_compatible(s24));
        assert!(Size::UNKNOWN.is_compatible(s24));
        assert!(s16.is_compatible(Size::UNKNOWN));
    }

    #[test]
    fn test_size_admits() {
        let s16 = Size::new(16);
        assert!(s16.admits(Offset::new(8), PTR_SIZE));
        assert!(!s16.admits(Offset::new(12), PTR_SIZE));
        assert!(!s16.admits(Offset::new(-8), PTR_SIZE));
        assert!(Size::UNKNOWN.admits(Offset::new(1024), PTR_SIZE));
    }
}
