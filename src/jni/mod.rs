//! JNI macro-assembler.
//!
//! The stub compiler describes a native-method bridge as a sequence of
//! high-level operations (build a frame, switch thread state, marshal
//! arguments, call through the method's JNI entry point). Each supported
//! ISA implements `JniMacroAssembler` and turns those requests into machine
//! code inside its own `CodeBuffer`.

pub mod arm64;
pub mod calling_convention;
pub mod managed_register;
pub mod move_args;
pub mod stub_compiler;
pub mod x86_64;

use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;
use tracing::debug;

use crate::isa::{InstructionSet, InstructionSetFeatures};
use crate::jit::codebuf::{CodeBuffer, LabelId};
use crate::offsets::{FrameOffset, MemberOffset, Offset, ThreadOffset};

pub use managed_register::{Arm64ManagedRegister, ManagedRegister, X86_64ManagedRegister};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JniAsmError {
    #[error("no JNI macro-assembler for {0}")]
    UnsupportedInstructionSet(InstructionSet),
    #[error("invalid instruction set features: {0}")]
    InvalidFeatures(String),
}

/// Where one argument lives: a register, or a slot in the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentLocation {
    Register { reg: ManagedRegister, size: usize },
    Stack { offset: FrameOffset, size: usize },
}

impl ArgumentLocation {
    pub fn register(reg: ManagedRegister, size: usize) -> Self {
        assert!(reg.is_register(), "argument location needs a real register");
        ArgumentLocation::Register { reg, size }
    }

    pub fn stack(offset: FrameOffset, size: usize) -> Self {
        ArgumentLocation::Stack { offset, size }
    }

    pub fn is_register(&self) -> bool {
        matches!(self, ArgumentLocation::Register { .. })
    }

    pub fn reg(&self) -> ManagedRegister {
        match *self {
            ArgumentLocation::Register { reg, .. } => reg,
            ArgumentLocation::Stack { offset, .. } => {
                panic!("argument at {} has no register", offset)
            }
        }
    }

    pub fn frame_offset(&self) -> FrameOffset {
        match *self {
            ArgumentLocation::Stack { offset, .. } => offset,
            ArgumentLocation::Register { reg, .. } => {
                panic!("argument in {:?} has no frame offset", reg)
            }
        }
    }

    pub fn size(&self) -> usize {
        match *self {
            ArgumentLocation::Register { size, .. } | ArgumentLocation::Stack { size, .. } => size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JniMacroUnaryCondition {
    Zero,
    NotZero,
}

/// Branch target handle. Only valid with the assembler that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JniMacroLabel {
    isa: InstructionSet,
    owner: u32,
    index: LabelId,
}

impl JniMacroLabel {
    pub fn instruction_set(&self) -> InstructionSet {
        self.isa
    }
}

static NEXT_ASSEMBLER_ID: AtomicU32 = AtomicU32::new(1);

/// State every backend shares: the code buffer, label ownership and the
/// finalize latch.
pub(crate) struct AsmCore {
    isa: InstructionSet,
    owner: u32,
    pub(crate) buf: CodeBuffer,
    finalized: bool,
    pub(crate) cfa_offset: usize,
}

impl AsmCore {
    pub(crate) fn new(isa: InstructionSet) -> Self {
        Self {
            isa,
            owner: NEXT_ASSEMBLER_ID.fetch_add(1, Ordering::Relaxed),
            buf: CodeBuffer::new(),
            finalized: false,
            cfa_offset: 0,
        }
    }

    pub(crate) fn create_label(&mut self) -> JniMacroLabel {
        JniMacroLabel {
            isa: self.isa,
            owner: self.owner,
            index: self.buf.new_label(),
        }
    }

    /// The arena index of `label`, after checking it belongs here.
    pub(crate) fn label(&self, label: JniMacroLabel) -> LabelId {
        assert_eq!(
            label.isa, self.isa,
            "label created for {} used with a {} assembler",
            label.isa, self.isa
        );
        assert_eq!(label.owner, self.owner, "label used with an assembler that did not create it");
        label.index
    }

    pub(crate) fn bind(&mut self, label: JniMacroLabel) {
        let id = self.label(label);
        self.buf.bind_label(id);
    }

    pub(crate) fn finalize(&mut self) {
        assert!(!self.finalized, "finalize_code called twice");
        if let Err(e) = self.buf.resolve_label_refs() {
            panic!("cannot finalize {} JNI stub: {}", self.isa, e);
        }
        self.finalized = true;
        debug!(isa = %self.isa, size = self.buf.len(), "finalized JNI code");
    }

    pub(crate) fn code_size(&self) -> usize {
        assert!(self.finalized, "code_size before finalize_code");
        self.buf.len()
    }

    pub(crate) fn copy_instructions(&self, region: &mut [u8]) {
        let size = self.code_size();
        assert!(
            region.len() >= size,
            "region of {} bytes cannot hold {} bytes of code",
            region.len(),
            size
        );
        region[..size].copy_from_slice(self.buf.code());
    }
}

/// Emission requests for one JNI stub.
///
/// Sizes are in bytes. Offsets into the frame are relative to the current
/// stack pointer. Contract violations (wrong register class, unsupported
/// size, foreign label) panic.
pub trait JniMacroAssembler: Send {
    fn instruction_set(&self) -> InstructionSet;

    /// Resolve branches. Must be called exactly once, before `code_size`.
    fn finalize_code(&mut self);
    fn code_size(&self) -> usize;
    /// Copy exactly `code_size` bytes to the start of `region`.
    fn copy_instructions(&self, region: &mut [u8]);

    /// Bytes between the stack pointer and the canonical frame address.
    fn current_cfa_offset(&self) -> usize;

    fn build_frame(
        &mut self,
        frame_size: usize,
        method_reg: ManagedRegister,
        callee_save_regs: &[ManagedRegister],
    );
    fn remove_frame(
        &mut self,
        frame_size: usize,
        callee_save_regs: &[ManagedRegister],
        may_suspend: bool,
    );
    fn increase_frame_size(&mut self, adjust: usize);
    fn decrease_frame_size(&mut self, adjust: usize);

    /// The view of `src` that holds `size` bytes (W or X on ARM64).
    fn core_register_with_size(&self, src: ManagedRegister, size: usize) -> ManagedRegister;

    fn store(&mut self, offs: FrameOffset, src: ManagedRegister, size: usize);
    fn store_to_member(
        &mut self,
        base: ManagedRegister,
        offs: MemberOffset,
        src: ManagedRegister,
        size: usize,
    );
    fn store_raw_ptr(&mut self, offs: FrameOffset, src: ManagedRegister);
    /// Record SP in the thread, with bit 1 set when `tag_sp`.
    fn store_stack_pointer_to_thread(&mut self, thr_offs: ThreadOffset, tag_sp: bool);

    fn load(&mut self, dest: ManagedRegister, src: FrameOffset, size: usize);
    fn load_from_member(
        &mut self,
        dest: ManagedRegister,
        base: ManagedRegister,
        offs: MemberOffset,
        size: usize,
    );
    fn load_raw_ptr_from_thread(&mut self, dest: ManagedRegister, offs: ThreadOffset);
    fn load_gc_root_without_read_barrier(
        &mut self,
        dest: ManagedRegister,
        base: ManagedRegister,
        offs: MemberOffset,
    );

    /// Move managed arguments to their native locations. `refs[i]` is the
    /// spill slot of argument `i` when it is a reference, otherwise
    /// `FrameOffset::INVALID_REFERENCE`.
    fn move_arguments(
        &mut self,
        dests: &[ArgumentLocation],
        srcs: &[ArgumentLocation],
        refs: &[FrameOffset],
    );
    fn move_reg(&mut self, dest: ManagedRegister, src: ManagedRegister, size: usize);
    fn move_immediate(&mut self, dest: ManagedRegister, value: usize);
    fn copy(&mut self, dest: FrameOffset, src: FrameOffset, size: usize);
    fn sign_extend(&mut self, reg: ManagedRegister, size: usize);
    fn zero_extend(&mut self, reg: ManagedRegister, size: usize);

    fn get_current_thread(&mut self, dest: ManagedRegister);
    fn get_current_thread_to_frame(&mut self, dest: FrameOffset);

    /// Decode a local or transition `jobject` in `reg` in place. Globals and
    /// weak globals branch to `slow_path`; null branches to `resume`.
    fn decode_jni_transition_or_local_jobject(
        &mut self,
        reg: ManagedRegister,
        slow_path: JniMacroLabel,
        resume: JniMacroLabel,
    );

    fn verify_object(&mut self, _src: ManagedRegister, _could_be_null: bool) {}

    fn jump_to_address(&mut self, base: ManagedRegister, offs: Offset);
    fn call(&mut self, base: ManagedRegister, offs: Offset);
    fn call_from_thread(&mut self, offs: ThreadOffset);

    fn try_to_transition_from_runnable_to_native(
        &mut self,
        label: JniMacroLabel,
        scratch_regs: &[ManagedRegister],
    );
    fn try_to_transition_from_native_to_runnable(
        &mut self,
        label: JniMacroLabel,
        scratch_regs: &[ManagedRegister],
        return_reg: ManagedRegister,
    );

    fn suspend_check(&mut self, label: JniMacroLabel);
    fn exception_poll(&mut self, label: JniMacroLabel);
    fn deliver_pending_exception(&mut self);

    fn create_label(&mut self) -> JniMacroLabel;
    fn jump(&mut self, label: JniMacroLabel);
    fn test_gc_marking(&mut self, label: JniMacroLabel, cond: JniMacroUnaryCondition);
    fn test_mark_bit(
        &mut self,
        reference: ManagedRegister,
        label: JniMacroLabel,
        cond: JniMacroUnaryCondition,
    );
    fn test_byte_and_jump_if_not_zero(&mut self, address: usize, label: JniMacroLabel);
    fn bind(&mut self, label: JniMacroLabel);
}

/// The macro-assembler for `isa`.
pub fn create(
    isa: InstructionSet,
    features: &InstructionSetFeatures,
) -> Result<Box<dyn JniMacroAssembler>, JniAsmError> {
    match isa {
        InstructionSet::X86_64 => Ok(Box::new(x86_64::X86_64JniMacroAssembler::new())),
        InstructionSet::Arm64 => Ok(Box::new(arm64::Arm64JniMacroAssembler::new(features))),
        other => Err(JniAsmError::UnsupportedInstructionSet(other)),
    }
}

/// Like `create`, parsing a feature string such as `"lse"` first.
pub fn create_with_variant(
    isa: InstructionSet,
    variant: &str,
) -> Result<Box<dyn JniMacroAssembler>, JniAsmError> {
    let features =
        InstructionSetFeatures::from_variant_string(isa, variant).map_err(JniAsmError::InvalidFeatures)?;
    create(isa, &features)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::x86_64::Reg;

    fn x86() -> Box<dyn JniMacroAssembler> {
        create(InstructionSet::X86_64, &InstructionSetFeatures::default()).unwrap()
    }

    #[test]
    fn test_create_supported_and_unsupported() {
        let features = InstructionSetFeatures::default();
        assert!(create(InstructionSet::X86_64, &features).is_ok());
        assert!(create(InstructionSet::Arm64, &features).is_ok());
        for isa in [InstructionSet::X86, InstructionSet::Arm, InstructionSet::Riscv64] {
            assert_eq!(
                create(isa, &features).err(),
                Some(JniAsmError::UnsupportedInstructionSet(isa))
            );
        }
        assert!(matches!(
            create_with_variant(InstructionSet::X86_64, "lse"),
            Err(JniAsmError::InvalidFeatures(_))
        ));
        assert!(create_with_variant(InstructionSet::Arm64, "lse").is_ok());
    }

    #[test]
    fn test_argument_location_accessors() {
        let rdi = X86_64ManagedRegister::from_cpu(Reg::Rdi);
        let reg = ArgumentLocation::register(rdi, 8);
        assert!(reg.is_register());
        assert_eq!(reg.reg(), rdi);
        assert_eq!(reg.size(), 8);
        let stack = ArgumentLocation::stack(FrameOffset(16), 4);
        assert!(!stack.is_register());
        assert_eq!(stack.frame_offset(), FrameOffset(16));
    }

    #[test]
    #[should_panic(expected = "needs a real register")]
    fn test_argument_location_rejects_no_register() {
        ArgumentLocation::register(ManagedRegister::no_register(), 4);
    }

    #[test]
    #[should_panic(expected = "has no register")]
    fn test_stack_location_has_no_register() {
        ArgumentLocation::stack(FrameOffset(8), 4).reg();
    }

    #[test]
    #[should_panic(expected = "did not create it")]
    fn test_label_from_other_assembler_panics() {
        let mut a = x86();
        let mut b = x86();
        let label = a.create_label();
        b.jump(label);
    }

    #[test]
    #[should_panic(expected = "used with a")]
    fn test_label_from_other_isa_panics() {
        let mut a = x86();
        let mut b = create(InstructionSet::Arm64, &InstructionSetFeatures::default()).unwrap();
        let label = b.create_label();
        a.bind(label);
    }

    #[test]
    #[should_panic(expected = "bound twice")]
    fn test_double_bind_panics() {
        let mut a = x86();
        let label = a.create_label();
        a.bind(label);
        a.bind(label);
    }

    #[test]
    fn test_finalize_then_copy_exact_size() {
        let mut a = x86();
        let label = a.create_label();
        a.jump(label);
        a.bind(label);
        a.finalize_code();
        let size = a.code_size();
        assert!(size > 0);
        let mut region = vec![0xAAu8; size + 4];
        a.copy_instructions(&mut region);
        assert_ne!(&region[..size], &vec![0xAAu8; size][..]);
        assert_eq!(&region[size..], &[0xAA; 4]);
    }

    #[test]
    #[should_panic(expected = "finalize_code called twice")]
    fn test_finalize_twice_panics() {
        let mut a = x86();
        a.finalize_code();
        a.finalize_code();
    }

    #[test]
    #[should_panic(expected = "code_size before finalize_code")]
    fn test_code_size_before_finalize_panics() {
        x86().code_size();
    }

    #[test]
    #[should_panic(expected = "cannot hold")]
    fn test_copy_into_small_region_panics() {
        let mut a = x86();
        a.deliver_pending_exception();
        a.finalize_code();
        let mut region = [0u8; 2];
        a.copy_instructions(&mut region);
    }

    #[test]
    #[should_panic(expected = "never bound")]
    fn test_unbound_label_panics_on_finalize() {
        let mut a = x86();
        let label = a.create_label();
        a.jump(label);
        a.finalize_code();
    }
}
