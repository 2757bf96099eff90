//! Quick entrypoint table.
//!
//! Each thread carries one `QuickEntryPoints`; generated code calls through
//! `[thread + quick_entrypoints_offset + slot * pointer_size]`. The fixed
//! slots are populated once from the per-ISA defaults. The trailing
//! read-barrier mark slots are the only ones that change afterwards, and only
//! while mutators are suspended.

pub mod quick;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::isa::{InstructionSet, PointerSize};
use crate::offsets::Offset;

/// Number of per-register read-barrier mark slots.
pub const READ_BARRIER_MARK_SLOTS: usize = 30;

macro_rules! quick_entrypoints {
    ($($name:ident),* $(,)?) => {
        /// Fixed entrypoint slots, in table order.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum QuickEntrypoint {
            $($name),*
        }

        impl QuickEntrypoint {
            pub const ALL: &'static [QuickEntrypoint] = &[$(QuickEntrypoint::$name),*];
        }
    };
}

quick_entrypoints!(
    InstanceofNonTrivial,
    CheckInstanceOf,
    Cos,
    Sin,
    Acos,
    Asin,
    Atan,
    Atan2,
    Pow,
    Cbrt,
    Cosh,
    Exp,
    Expm1,
    Hypot,
    Log,
    Log10,
    NextAfter,
    Sinh,
    Tan,
    Tanh,
    Fmod,
    Fmodf,
    Idivmod,
    D2l,
    F2l,
    Ldiv,
    Lmod,
    Lmul,
    ShlLong,
    ShrLong,
    UshrLong,
    StringCompareTo,
    Memcpy,
    JniMethodStart,
    JniMethodEnd,
    ReadBarrierJni,
    JniDecodeReferenceResult,
    TestSuspend,
    DeliverException,
    ThrowNullPointerFromSignal,
    ThrowStackOverflow,
    ReadBarrierSlow,
    ReadBarrierForRootSlow,
);

pub const FIXED_ENTRYPOINT_COUNT: usize = QuickEntrypoint::ALL.len();
pub const QUICK_ENTRYPOINT_COUNT: usize = FIXED_ENTRYPOINT_COUNT + READ_BARRIER_MARK_SLOTS;

impl QuickEntrypoint {
    pub fn index(self) -> usize {
        self as usize
    }

    /// Byte offset of the slot inside the table.
    pub fn offset(self, pointer_size: PointerSize) -> Offset {
        Offset(self.index() * pointer_size.bytes())
    }
}

/// Conventional `p`-prefixed slot name, e.g. `pTestSuspend`.
impl fmt::Display for QuickEntrypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{:?}", self)
    }
}

pub fn read_barrier_mark_index(reg: usize) -> usize {
    assert!(reg < READ_BARRIER_MARK_SLOTS, "no mark slot for register {}", reg);
    FIXED_ENTRYPOINT_COUNT + reg
}

pub fn read_barrier_mark_offset(pointer_size: PointerSize, reg: usize) -> Offset {
    Offset(read_barrier_mark_index(reg) * pointer_size.bytes())
}

/// Capability proving that no mutator is executing compiled code, so an
/// entrypoint table may be rewritten.
///
/// Obtained from `SuspendAllGuard::mutators_suspended`, or internally for a
/// table that no thread can see yet.
pub struct MutatorsSuspended {
    _private: (),
}

impl MutatorsSuspended {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }

    pub(crate) fn for_unpublished_table() -> Self {
        Self::new()
    }
}

/// The entrypoint table. Slot value 0 is null.
#[repr(C)]
pub struct QuickEntryPoints {
    slots: [AtomicUsize; QUICK_ENTRYPOINT_COUNT],
}

impl QuickEntryPoints {
    /// A table with every slot null.
    pub fn empty() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }

    /// A table with the defaults for `isa`; every mark slot is null.
    pub fn new(isa: InstructionSet) -> Self {
        let table = Self::empty();
        let token = MutatorsSuspended::for_unpublished_table();
        for &ep in QuickEntrypoint::ALL {
            table.set(ep, quick::default_entrypoint(isa, ep), &token);
        }
        table
    }

    pub fn get(&self, ep: QuickEntrypoint) -> usize {
        self.slots[ep.index()].load(Ordering::Acquire)
    }

    pub fn set(&self, ep: QuickEntrypoint, value: usize, _suspended: &MutatorsSuspended) {
        self.slots[ep.index()].store(value, Ordering::Release);
    }

    pub fn read_barrier_mark(&self, reg: usize) -> usize {
        self.slots[read_barrier_mark_index(reg)].load(Ordering::Acquire)
    }

    fn set_read_barrier_mark(&self, reg: usize, value: usize, _suspended: &MutatorsSuspended) {
        self.slots[read_barrier_mark_index(reg)].store(value, Ordering::Release);
    }

    /// Raw copy of every slot, fixed slots first.
    pub fn snapshot(&self) -> Vec<usize> {
        self.slots.iter().map(|s| s.load(Ordering::Acquire)).collect()
    }
}

impl fmt::Debug for QuickEntryPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for &ep in QuickEntrypoint::ALL {
            map.entry(&ep, &format_args!("{:#x}", self.get(ep)));
        }
        map.finish()
    }
}

/// Whether mark slot `slot` can ever carry a routine on `isa`.
///
/// Slots for the stack pointer, reserved and platform registers, and
/// registers the ISA does not have stay null.
pub fn is_usable_mark_slot(isa: InstructionSet, slot: usize) -> bool {
    match isa {
        InstructionSet::X86 => matches!(slot, 0..=3 | 5..=7),
        InstructionSet::X86_64 => matches!(slot, 0..=3 | 5..=15),
        InstructionSet::Arm => matches!(slot, 0..=11),
        InstructionSet::Arm64 => matches!(slot, 0..=15 | 17 | 19..=29),
        InstructionSet::Riscv64 => matches!(slot, 0 | 1 | 5..=8 | 10..=29),
    }
}

/// The register whose mark routine lives in `slot`.
///
/// RISC-V has no slots for x30 and x31, so their routines reuse slots 0 and
/// 1, which belong to the zero and return-address registers.
pub fn mark_slot_register(isa: InstructionSet, slot: usize) -> usize {
    match (isa, slot) {
        (InstructionSet::Riscv64, 0) => 30,
        (InstructionSet::Riscv64, 1) => 31,
        _ => slot,
    }
}

/// Point every usable mark slot at its routine when `is_active`, or at null.
/// No other slot is touched.
pub fn update_read_barrier_entrypoints(
    table: &QuickEntryPoints,
    isa: InstructionSet,
    is_active: bool,
    suspended: &MutatorsSuspended,
) {
    for slot in 0..READ_BARRIER_MARK_SLOTS {
        if !is_usable_mark_slot(isa, slot) {
            continue;
        }
        let value = if is_active {
            quick::read_barrier_mark_routine(mark_slot_register(isa, slot))
        } else {
            0
        };
        table.set_read_barrier_mark(slot, value, suspended);
    }
}
