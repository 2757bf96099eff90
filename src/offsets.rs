//! Strongly typed byte offsets.
//!
//! Frame, object-field and thread-structure offsets are kept apart so a
//! frame slot can never be handed to an instruction expecting a field.

use std::fmt;

macro_rules! offset_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub usize);

        impl $name {
            pub const fn new(value: usize) -> Self {
                Self(value)
            }

            pub const fn value(self) -> usize {
                self.0
            }

            /// Offset as a signed displacement for instruction encoding.
            pub fn int32_value(self) -> i32 {
                i32::try_from(self.0).expect("offset does not fit in a 32-bit displacement")
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

offset_type!(
    /// Untyped offset, used for `[base + offset]` calls and jumps.
    Offset
);
offset_type!(
    /// Offset relative to the stack pointer of the current frame.
    FrameOffset
);
offset_type!(
    /// Offset of a field inside a managed object or runtime structure.
    MemberOffset
);
offset_type!(
    /// Offset inside the per-thread control block.
    ThreadOffset
);

impl FrameOffset {
    /// Marks a non-reference argument in `move_arguments`.
    pub const INVALID_REFERENCE: FrameOffset = FrameOffset(0);

    pub fn is_valid_reference(self) -> bool {
        self != Self::INVALID_REFERENCE
    }

    pub fn plus(self, delta: usize) -> FrameOffset {
        FrameOffset(self.0 + delta)
    }
}

impl From<FrameOffset> for MemberOffset {
    fn from(offs: FrameOffset) -> Self {
        MemberOffset(offs.0)
    }
}

impl From<MemberOffset> for Offset {
    fn from(offs: MemberOffset) -> Self {
        Offset(offs.0)
    }
}

impl From<ThreadOffset> for Offset {
    fn from(offs: ThreadOffset) -> Self {
        Offset(offs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_reference_is_zero() {
        assert_eq!(FrameOffset::INVALID_REFERENCE.value(), 0);
        assert!(!FrameOffset::INVALID_REFERENCE.is_valid_reference());
        assert!(FrameOffset(16).is_valid_reference());
    }

    #[test]
    #[should_panic(expected = "32-bit displacement")]
    fn test_int32_value_overflow() {
        MemberOffset(usize::MAX).int32_value();
    }
}
