//! Managed object layout.
//!
//! Only the parts generated code and the entrypoints touch are modelled:
//! the two-word object header (class reference and lock word), a class with a
//! superclass chain, and strings. References between objects are 32-bit
//! ("compressed"), so every object lives in a heap mapped below 4 GiB.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use thiserror::Error;

use crate::offsets::MemberOffset;

/// Size of a heap reference stored in an object or frame slot.
pub const OBJECT_REFERENCE_SIZE: usize = 4;

/// Lock word bit layout.
pub struct LockWord;

impl LockWord {
    pub const MARK_BIT_SHIFT: u32 = 29;
    pub const MARK_BIT_STATE_SIZE: u32 = 1;
    pub const MARK_BIT_MASK_SHIFTED: u32 = 1 << Self::MARK_BIT_SHIFT;
}

/// A 32-bit reference to a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct HeapReference(pub u32);

impl HeapReference {
    pub const NULL: HeapReference = HeapReference(0);

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        let addr = ptr as usize;
        assert!(addr <= u32::MAX as usize, "object at {:#x} is outside the 32-bit heap", addr);
        HeapReference(addr as u32)
    }

    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Object header shared by every managed object.
#[repr(C)]
pub struct Object {
    klass: AtomicU32,
    monitor: AtomicU32,
}

impl Object {
    pub const CLASS_OFFSET: MemberOffset = MemberOffset(0);
    pub const MONITOR_OFFSET: MemberOffset = MemberOffset(4);

    pub fn new(klass: HeapReference) -> Self {
        Self {
            klass: AtomicU32::new(klass.0),
            monitor: AtomicU32::new(0),
        }
    }

    pub fn class_ref(&self) -> HeapReference {
        HeapReference(self.klass.load(Ordering::Relaxed))
    }

    /// The object's class, or `None` for a header without one.
    pub fn class(&self) -> Option<&Class> {
        let klass = self.class_ref();
        if klass.is_null() {
            return None;
        }
        // SAFETY: non-null class references always point at a live `Class`
        // allocated from the same heap.
        Some(unsafe { &*klass.as_ptr::<Class>() })
    }

    pub fn lock_word(&self) -> u32 {
        self.monitor.load(Ordering::Relaxed)
    }

    pub fn is_marked(&self) -> bool {
        self.lock_word() & LockWord::MARK_BIT_MASK_SHIFTED != 0
    }

    /// Set the mark bit. Returns true if this call set it.
    pub fn set_mark_bit(&self) -> bool {
        let old = self
            .monitor
            .fetch_or(LockWord::MARK_BIT_MASK_SHIFTED, Ordering::AcqRel);
        old & LockWord::MARK_BIT_MASK_SHIFTED == 0
    }

    pub fn clear_mark_bit(&self) {
        self.monitor
            .fetch_and(!LockWord::MARK_BIT_MASK_SHIFTED, Ordering::AcqRel);
    }

    pub fn as_reference(&self) -> HeapReference {
        HeapReference::from_ptr(self as *const Object)
    }
}

/// A class object. Instance-of checks walk `super_class`.
#[repr(C)]
pub struct Class {
    object: Object,
    super_class: HeapReference,
    _reserved: u32,
}

impl Class {
    pub fn as_object(&self) -> &Object {
        &self.object
    }

    pub fn super_class(&self) -> Option<&Class> {
        if self.super_class.is_null() {
            None
        } else {
            // SAFETY: superclass references point at live classes.
            Some(unsafe { &*self.super_class.as_ptr::<Class>() })
        }
    }

    /// Whether `self` is `other` or one of its subclasses.
    pub fn is_subclass_of(&self, other: &Class) -> bool {
        let mut current = Some(self);
        while let Some(klass) = current {
            if std::ptr::eq(klass, other) {
                return true;
            }
            current = klass.super_class();
        }
        false
    }
}

/// A UTF-16 string. The characters follow the header in memory.
#[repr(C)]
pub struct StringObject {
    object: Object,
    count: u32,
    _reserved: u32,
}

impl StringObject {
    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn chars(&self) -> &[u16] {
        // SAFETY: strings are only created by `Heap::alloc_string`, which
        // reserves `count` UTF-16 units right after the header.
        unsafe {
            let data = (self as *const StringObject).add(1) as *const u16;
            std::slice::from_raw_parts(data, self.len())
        }
    }

    pub fn as_object(&self) -> &Object {
        &self.object
    }
}

#[derive(Debug, Error)]
pub enum HeapError {
    #[error("could not reserve {0} bytes below 4 GiB")]
    NoLowMemory(usize),
    #[error("heap exhausted: {requested} bytes requested, {remaining} remaining")]
    Exhausted { requested: usize, remaining: usize },
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
const LOW_MAP_FLAGS: libc::c_int = libc::MAP_32BIT;
#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
const LOW_MAP_FLAGS: libc::c_int = 0;

const LOW_MAP_HINT: usize = 0x4000_0000;
const OBJECT_ALIGNMENT: usize = 8;

/// A bump-allocated heap mapped below 4 GiB.
///
/// Objects are never freed individually; the whole heap goes away on drop.
pub struct Heap {
    base: NonNull<u8>,
    capacity: usize,
    top: AtomicUsize,
}

impl Heap {
    pub fn new(capacity: usize) -> Result<Self, HeapError> {
        // SAFETY: anonymous mapping; the hint is not MAP_FIXED.
        let ptr = unsafe {
            libc::mmap(
                LOW_MAP_HINT as *mut libc::c_void,
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | LOW_MAP_FLAGS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(HeapError::NoLowMemory(capacity));
        }
        if (ptr as usize).saturating_add(capacity) > u32::MAX as usize {
            // SAFETY: unmapping what was just mapped.
            unsafe { libc::munmap(ptr, capacity) };
            return Err(HeapError::NoLowMemory(capacity));
        }
        let base = NonNull::new(ptr as *mut u8).ok_or(HeapError::NoLowMemory(capacity))?;
        Ok(Self {
            base,
            capacity,
            // Keep offset 0 unused so that no object has the null reference.
            top: AtomicUsize::new(OBJECT_ALIGNMENT),
        })
    }

    pub fn contains(&self, addr: usize) -> bool {
        let start = self.base.as_ptr() as usize;
        (start..start + self.capacity).contains(&addr)
    }

    pub fn used(&self) -> usize {
        self.top.load(Ordering::Relaxed)
    }

    fn alloc_raw(&self, size: usize) -> Result<*mut u8, HeapError> {
        let size = (size + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1);
        let offset = self
            .top
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |top| {
                top.checked_add(size).filter(|end| *end <= self.capacity)
            })
            .map_err(|top| HeapError::Exhausted {
                requested: size,
                remaining: self.capacity - top,
            })?;
        // SAFETY: `offset + size <= capacity`, checked above.
        Ok(unsafe { self.base.as_ptr().add(offset) })
    }

    /// Allocate a class. Its own class reference is left null.
    pub fn alloc_class(&self, super_class: Option<&Class>) -> Result<&Class, HeapError> {
        let ptr = self.alloc_raw(std::mem::size_of::<Class>())? as *mut Class;
        let class = Class {
            object: Object::new(HeapReference::NULL),
            super_class: super_class
                .map(|c| HeapReference::from_ptr(c as *const Class))
                .unwrap_or(HeapReference::NULL),
            _reserved: 0,
        };
        // SAFETY: freshly allocated, suitably aligned and sized.
        unsafe {
            ptr.write(class);
            Ok(&*ptr)
        }
    }

    pub fn alloc_object(&self, klass: &Class) -> Result<&Object, HeapError> {
        let ptr = self.alloc_raw(std::mem::size_of::<Object>())? as *mut Object;
        // SAFETY: as above.
        unsafe {
            ptr.write(Object::new(HeapReference::from_ptr(klass as *const Class)));
            Ok(&*ptr)
        }
    }

    pub fn alloc_string(&self, klass: &Class, value: &str) -> Result<&StringObject, HeapError> {
        let units: Vec<u16> = value.encode_utf16().collect();
        let size = std::mem::size_of::<StringObject>() + units.len() * 2;
        let ptr = self.alloc_raw(size)? as *mut StringObject;
        // SAFETY: the allocation covers the header plus `units.len()` chars.
        unsafe {
            ptr.write(StringObject {
                object: Object::new(HeapReference::from_ptr(klass as *const Class)),
                count: units.len() as u32,
                _reserved: 0,
            });
            let data = ptr.add(1) as *mut u16;
            std::ptr::copy_nonoverlapping(units.as_ptr(), data, units.len());
            Ok(&*ptr)
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // SAFETY: unmapping the region created in `new`.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.capacity);
        }
    }
}

// Allocation is a lock-free bump; objects use atomics for mutable state.
unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(std::mem::offset_of!(Object, monitor), Object::MONITOR_OFFSET.value());
        assert_eq!(std::mem::offset_of!(Object, klass), Object::CLASS_OFFSET.value());
        assert_eq!(std::mem::size_of::<Object>(), 8);
    }

    #[test]
    fn test_mark_bit() {
        let obj = Object::new(HeapReference::NULL);
        assert!(!obj.is_marked());
        assert!(obj.set_mark_bit());
        assert!(!obj.set_mark_bit());
        assert_eq!(obj.lock_word(), 1 << 29);
        obj.clear_mark_bit();
        assert!(!obj.is_marked());
    }

    #[test]
    fn test_heap_class_chain_and_strings() {
        let Ok(heap) = Heap::new(64 * 1024) else {
            return; // no low memory on this host
        };
        let object_class = heap.alloc_class(None).unwrap();
        let string_class = heap.alloc_class(Some(object_class)).unwrap();
        assert!(string_class.is_subclass_of(object_class));
        assert!(!object_class.is_subclass_of(string_class));

        let s = heap.alloc_string(string_class, "héllo").unwrap();
        assert_eq!(s.len(), 5);
        assert_eq!(String::from_utf16(s.chars()).unwrap(), "héllo");
        assert!(std::ptr::eq(s.as_object().class().unwrap(), string_class));
        assert!(heap.contains(s as *const StringObject as usize));
    }

    #[test]
    fn test_heap_exhaustion() {
        let Ok(heap) = Heap::new(4096) else {
            return;
        };
        let klass = heap.alloc_class(None).unwrap();
        let mut result = Ok(());
        for _ in 0..1024 {
            if let Err(e) = heap.alloc_object(klass) {
                result = Err(e);
                break;
            }
        }
        assert!(matches!(result, Err(HeapError::Exhausted { .. })));
    }
}
