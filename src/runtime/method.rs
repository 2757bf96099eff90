//! Method records as seen by generated code.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::isa::PointerSize;
use crate::offsets::MemberOffset;
use crate::runtime::object::{Class, HeapReference};

/// Java access flags relevant to native stubs.
pub mod access_flags {
    pub const STATIC: u32 = 0x0008;
    pub const SYNCHRONIZED: u32 = 0x0020;
    pub const NATIVE: u32 = 0x0100;
    /// `@FastNative`: no thread state transitions.
    pub const FAST_NATIVE: u32 = 0x0008_0000;
    /// `@CriticalNative`: no transitions, no `JNIEnv*`, no `jclass`.
    pub const CRITICAL_NATIVE: u32 = 0x0020_0000;
}

/// A method. The declaring class root comes first so that the stub can load
/// it with `load_gc_root_without_read_barrier(method, 0)`.
#[repr(C)]
pub struct Method {
    declaring_class: AtomicU32,
    access_flags: AtomicU32,
    /// Native code registered for this method, called by the JNI stub.
    entry_point_from_jni: AtomicUsize,
    /// Compiled code, or 0 while interpreted.
    entry_point_from_quick: AtomicUsize,
    method_index: u32,
}

impl Method {
    pub const DECLARING_CLASS_OFFSET: MemberOffset = MemberOffset(0);

    pub fn new(declaring_class: HeapReference, access_flags: u32, method_index: u32) -> Self {
        Self {
            declaring_class: AtomicU32::new(declaring_class.0),
            access_flags: AtomicU32::new(access_flags),
            entry_point_from_jni: AtomicUsize::new(0),
            entry_point_from_quick: AtomicUsize::new(0),
            method_index,
        }
    }

    /// Offset of the JNI entry point for the given pointer width.
    pub fn entry_point_from_jni_offset(_pointer_size: PointerSize) -> MemberOffset {
        // Two 32-bit fields, then pointer-sized slots.
        MemberOffset(8)
    }

    pub fn entry_point_from_quick_offset(pointer_size: PointerSize) -> MemberOffset {
        MemberOffset(8 + pointer_size.bytes())
    }

    pub fn declaring_class(&self) -> HeapReference {
        HeapReference(self.declaring_class.load(Ordering::Acquire))
    }

    /// The declaring class, if it has been set.
    pub fn declaring_class_object(&self) -> Option<&Class> {
        let klass = self.declaring_class();
        // SAFETY: class roots point at live classes.
        (!klass.is_null()).then(|| unsafe { &*klass.as_ptr::<Class>() })
    }

    pub fn access_flags(&self) -> u32 {
        self.access_flags.load(Ordering::Relaxed)
    }

    pub fn is_static(&self) -> bool {
        self.access_flags() & access_flags::STATIC != 0
    }

    pub fn is_native(&self) -> bool {
        self.access_flags() & access_flags::NATIVE != 0
    }

    pub fn method_index(&self) -> u32 {
        self.method_index
    }

    pub fn entry_point_from_jni(&self) -> usize {
        self.entry_point_from_jni.load(Ordering::Acquire)
    }

    /// Register the native implementation (`RegisterNatives`).
    pub fn set_entry_point_from_jni(&self, entry: usize) {
        self.entry_point_from_jni.store(entry, Ordering::Release);
    }

    pub fn entry_point_from_quick(&self) -> usize {
        self.entry_point_from_quick.load(Ordering::Acquire)
    }

    pub fn set_entry_point_from_quick(&self, entry: usize) {
        self.entry_point_from_quick.store(entry, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_matches_offsets() {
        assert_eq!(std::mem::offset_of!(Method, declaring_class), 0);
        assert_eq!(
            std::mem::offset_of!(Method, entry_point_from_jni),
            Method::entry_point_from_jni_offset(PointerSize::host()).value()
        );
        assert_eq!(
            std::mem::offset_of!(Method, entry_point_from_quick),
            Method::entry_point_from_quick_offset(PointerSize::host()).value()
        );
    }

    #[test]
    fn test_flags() {
        let m = Method::new(HeapReference::NULL, access_flags::STATIC | access_flags::NATIVE, 3);
        assert!(m.is_static());
        assert!(m.is_native());
        assert!(m.declaring_class_object().is_none());
        m.set_entry_point_from_jni(0x1234);
        assert_eq!(m.entry_point_from_jni(), 0x1234);
    }
}
