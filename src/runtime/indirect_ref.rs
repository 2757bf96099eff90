//! `jobject` encoding.
//!
//! The low two bits of a `jobject` give its kind. JNI-transition and local
//! references point straight at a 32-bit reference slot (a spill slot in the
//! stub frame, or a local table entry), which is what lets generated code
//! decode them inline. Globals are table indices and need the slow path.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::RwLock;

use thiserror::Error;

use crate::runtime::object::HeapReference;

pub const KIND_MASK: usize = 3;

/// Bit tested by generated code: set for global and weak global references.
pub const GLOBAL_OR_WEAK_GLOBAL_MASK: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndirectRefKind {
    JniTransition = 0,
    Local = 1,
    Global = 2,
    WeakGlobal = 3,
}

pub fn kind_of(jobject: usize) -> IndirectRefKind {
    match jobject & KIND_MASK {
        0 => IndirectRefKind::JniTransition,
        1 => IndirectRefKind::Local,
        2 => IndirectRefKind::Global,
        _ => IndirectRefKind::WeakGlobal,
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndirectRefError {
    #[error("local reference table full ({0} entries)")]
    LocalTableFull(usize),
    #[error("stale or invalid global reference {0:#x}")]
    InvalidGlobal(usize),
}

/// Per-thread local references with stable slot addresses.
pub struct LocalReferenceTable {
    slots: Box<[AtomicU32]>,
    top: AtomicUsize,
}

impl LocalReferenceTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            top: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.top.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a local reference and return its `jobject`. Null stays null.
    pub fn add(&self, obj: HeapReference) -> Result<usize, IndirectRefError> {
        if obj.is_null() {
            return Ok(0);
        }
        let index = self.top.load(Ordering::Relaxed);
        let slot = self
            .slots
            .get(index)
            .ok_or(IndirectRefError::LocalTableFull(self.slots.len()))?;
        slot.store(obj.0, Ordering::Relaxed);
        self.top.store(index + 1, Ordering::Relaxed);
        Ok(slot as *const AtomicU32 as usize | IndirectRefKind::Local as usize)
    }

    /// Drop every local reference created since `cookie`.
    pub fn pop_frame(&self, cookie: usize) {
        let top = self.len();
        for slot in &self.slots[cookie.min(top)..top] {
            slot.store(0, Ordering::Relaxed);
        }
        self.top.store(cookie.min(top), Ordering::Relaxed);
    }
}

/// Process-wide global references.
pub struct GlobalReferenceTable {
    slots: RwLock<Vec<HeapReference>>,
}

impl GlobalReferenceTable {
    pub const fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, obj: HeapReference, weak: bool) -> usize {
        if obj.is_null() {
            return 0;
        }
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        slots.push(obj);
        let kind = if weak {
            IndirectRefKind::WeakGlobal
        } else {
            IndirectRefKind::Global
        };
        (slots.len() - 1) << 2 | kind as usize
    }

    pub fn get(&self, jobject: usize) -> Result<HeapReference, IndirectRefError> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots
            .get(jobject >> 2)
            .copied()
            .ok_or(IndirectRefError::InvalidGlobal(jobject))
    }
}

impl Default for GlobalReferenceTable {
    fn default() -> Self {
        Self::new()
    }
}

pub static GLOBALS: GlobalReferenceTable = GlobalReferenceTable::new();

/// Decode any `jobject` to the reference it names.
///
/// # Safety
///
/// Local and JNI-transition references must point at a live 32-bit slot.
pub unsafe fn decode(jobject: usize) -> Result<HeapReference, IndirectRefError> {
    if jobject == 0 {
        return Ok(HeapReference::NULL);
    }
    match kind_of(jobject) {
        IndirectRefKind::JniTransition | IndirectRefKind::Local => {
            let slot = (jobject & !KIND_MASK) as *const u32;
            // SAFETY: guaranteed by the caller.
            Ok(HeapReference(unsafe { slot.read() }))
        }
        IndirectRefKind::Global | IndirectRefKind::WeakGlobal => GLOBALS.get(jobject),
    }
}
