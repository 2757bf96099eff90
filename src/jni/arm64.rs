//! ARM64 JNI macro-assembler.
//!
//! X19 holds the current thread and X20 mirrors `is_gc_marking` for managed
//! code. IP0/IP1 (X16/X17) are the backend's scratch registers.

use crate::isa::{InstructionSet, InstructionSetFeatures, PointerSize};
use crate::jit::aarch64::{AArch64Assembler, Cond, Reg, VReg};
use crate::jit::codebuf::LabelId;
use crate::jni::move_args::{plan_moves, ArgMove, RegisterModel};
use crate::jni::{
    Arm64ManagedRegister, ArgumentLocation, AsmCore, JniMacroAssembler, JniMacroLabel,
    JniMacroUnaryCondition, ManagedRegister,
};
use crate::offsets::{FrameOffset, MemberOffset, Offset, ThreadOffset};
use crate::runtime::entrypoints::QuickEntrypoint;
use crate::runtime::indirect_ref::GLOBAL_OR_WEAK_GLOBAL_MASK;
use crate::runtime::object::{LockWord, Object};
use crate::runtime::thread::{ManagedThread, ThreadFlag, ThreadState};

const PS: PointerSize = PointerSize::K64;
const STACK_ALIGNMENT: usize = 16;
const TR: Reg = Reg::TR;
const MR: Reg = Reg::X20;
const IP0: Reg = Reg::IP0;
const IP1: Reg = Reg::IP1;

fn core(reg: ManagedRegister) -> Reg {
    reg.as_arm64().as_core()
}

fn off(offs: usize) -> u32 {
    u32::try_from(offs).expect("offset does not fit in an ARM64 immediate")
}

struct Arm64Registers;

impl RegisterModel for Arm64Registers {
    fn mask(&self, reg: ManagedRegister) -> u64 {
        let reg = reg.as_arm64();
        if reg.is_core_register() {
            1 << reg.as_core().code()
        } else {
            1 << (32 + reg.as_vreg().0 as u32)
        }
    }

    fn pointer_register(&self, reg: ManagedRegister) -> ManagedRegister {
        reg.as_arm64().as_overlapping_x()
    }

    fn pointer_size(&self) -> usize {
        PS.bytes()
    }
}

pub struct Arm64JniMacroAssembler {
    core: AsmCore,
    has_lse_atomics: bool,
}

impl Arm64JniMacroAssembler {
    pub fn new(features: &InstructionSetFeatures) -> Self {
        Self {
            core: AsmCore::new(InstructionSet::Arm64),
            has_lse_atomics: features.has_lse_atomics,
        }
    }

    fn asm(&mut self) -> AArch64Assembler<'_> {
        AArch64Assembler::new(&mut self.core.buf)
    }

    fn new_local_label(&mut self) -> LabelId {
        self.core.buf.new_label()
    }

    fn adjust_sp(&mut self, adjust: usize, grow: bool) {
        if adjust == 0 {
            return;
        }
        if grow {
            self.asm().sub_large_imm(Reg::Sp, Reg::Sp, off(adjust));
        } else {
            self.asm().add_large_imm(Reg::Sp, Reg::Sp, off(adjust));
        }
    }

    fn store_to(&mut self, base: Reg, offset: usize, src: ManagedRegister, size: usize) {
        let src = src.as_arm64();
        let offset = off(offset);
        if src.is_no_register() {
            assert_eq!(size, 0, "store of {} bytes from no register", size);
        } else if src.is_core_register() {
            let rt = src.as_core();
            let mut asm = self.asm();
            match size {
                1 => asm.strb(rt, base, offset),
                2 => asm.strh(rt, base, offset),
                4 => asm.str_w(rt, base, offset),
                8 => asm.str_x(rt, base, offset),
                _ => panic!("unsupported store size {} for a core register", size),
            }
        } else {
            let rt = src.as_vreg();
            match size {
                4 => self.asm().str_s(rt, base, offset),
                8 => self.asm().str_d(rt, base, offset),
                _ => panic!("unsupported store size {} for an FP register", size),
            }
        }
    }

    fn load_from(&mut self, dest: ManagedRegister, base: Reg, offset: usize, size: usize) {
        let dest = dest.as_arm64();
        let offset = off(offset);
        if dest.is_no_register() {
            assert_eq!(size, 0, "load of {} bytes into no register", size);
        } else if dest.is_core_register() {
            let rt = dest.as_core();
            let mut asm = self.asm();
            match size {
                1 => asm.ldrb(rt, base, offset),
                2 => asm.ldrh(rt, base, offset),
                4 => asm.ldr_w(rt, base, offset),
                8 => asm.ldr_x(rt, base, offset),
                _ => panic!("unsupported load size {} for a core register", size),
            }
        } else {
            let rt = dest.as_vreg();
            match size {
                4 => self.asm().ldr_s(rt, base, offset),
                8 => self.asm().ldr_d(rt, base, offset),
                _ => panic!("unsupported load size {} for an FP register", size),
            }
        }
    }

    /// Store `regs` in pairs from `[sp + offset]` upward.
    fn spill_core(&mut self, regs: &[Reg], offset: usize) {
        let mut offset = offset;
        for pair in regs.chunks(2) {
            match *pair {
                [a, b] => self.asm().stp(a, b, Reg::Sp, offset as i32),
                [a] => self.asm().str_x(a, Reg::Sp, off(offset)),
                _ => unreachable!(),
            }
            offset += 8 * pair.len();
        }
    }

    fn unspill_core(&mut self, regs: &[Reg], offset: usize) {
        let mut offset = offset;
        for pair in regs.chunks(2) {
            match *pair {
                [a, b] => self.asm().ldp(a, b, Reg::Sp, offset as i32),
                [a] => self.asm().ldr_x(a, Reg::Sp, off(offset)),
                _ => unreachable!(),
            }
            offset += 8 * pair.len();
        }
    }

    fn spill_fp(&mut self, regs: &[VReg], offset: usize) {
        let mut offset = offset;
        for pair in regs.chunks(2) {
            match *pair {
                [a, b] => self.asm().stp_d(a, b, Reg::Sp, offset as i32),
                [a] => self.asm().str_d(a, Reg::Sp, off(offset)),
                _ => unreachable!(),
            }
            offset += 8 * pair.len();
        }
    }

    fn unspill_fp(&mut self, regs: &[VReg], offset: usize) {
        let mut offset = offset;
        for pair in regs.chunks(2) {
            match *pair {
                [a, b] => self.asm().ldp_d(a, b, Reg::Sp, offset as i32),
                [a] => self.asm().ldr_d(a, Reg::Sp, off(offset)),
                _ => unreachable!(),
            }
            offset += 8 * pair.len();
        }
    }

    fn split_callee_saves(regs: &[ManagedRegister]) -> (Vec<Reg>, Vec<VReg>) {
        let mut core_regs = Vec::new();
        let mut fp_regs = Vec::new();
        for reg in regs.iter().map(|r| r.as_arm64()) {
            if reg.is_x_register() {
                core_regs.push(reg.as_x());
            } else if reg.is_d_register() {
                fp_regs.push(reg.as_vreg());
            } else {
                panic!("callee-save {:?} must be an X or D register", reg);
            }
        }
        (core_regs, fp_regs)
    }

    fn create_jobject_in_register(
        &mut self,
        out: ManagedRegister,
        spill: FrameOffset,
        in_reg: ManagedRegister,
        null_allowed: bool,
    ) {
        let out = core(out);
        let spill = off(spill.value());
        let input = if in_reg.is_no_register() {
            self.asm().ldr_w(out, Reg::Sp, spill);
            out
        } else {
            core(in_reg)
        };
        if null_allowed {
            let non_null = self.new_local_label();
            let done = self.new_local_label();
            let mut asm = self.asm();
            // Only the low 32 bits of a reference are meaningful.
            asm.cbnz_label(input, false, non_null);
            asm.movz(out, 0, 0);
            asm.b_label(done);
            asm.bind(non_null);
            asm.add_imm(out, Reg::Sp, spill);
            asm.bind(done);
        } else {
            self.asm().add_imm(out, Reg::Sp, spill);
        }
    }

    fn create_jobject_in_frame(&mut self, out: FrameOffset, spill: FrameOffset, null_allowed: bool) {
        let spill = off(spill.value());
        if null_allowed {
            let null_arg = self.new_local_label();
            let mut asm = self.asm();
            asm.ldr_w(IP0, Reg::Sp, spill);
            asm.cbz_label(IP0, false, null_arg);
            asm.add_imm(IP0, Reg::Sp, spill);
            asm.bind(null_arg);
        } else {
            self.asm().add_imm(IP0, Reg::Sp, spill);
        }
        self.asm().str_x(IP0, Reg::Sp, off(out.value()));
    }

    fn emit_move(&mut self, mv: ArgMove) {
        match mv {
            ArgMove::SpillReference { reg, offset } => {
                self.asm().str_w(core(reg), Reg::Sp, off(offset.value()))
            }
            ArgMove::StoreToStack { dest, src, size } => self.store_to(Reg::Sp, dest.value(), src, size),
            ArgMove::JObjectToStack { dest, spill, null_allowed } => {
                self.create_jobject_in_frame(dest, spill, null_allowed)
            }
            ArgMove::CopyToStack { dest, src, size } => self.copy(dest, src, size),
            ArgMove::MoveToRegister { dest, src, size } => self.move_reg(dest, src, size),
            ArgMove::JObjectToRegister { dest, spill, in_reg, null_allowed } => {
                self.create_jobject_in_register(dest, spill, in_reg, null_allowed)
            }
            ArgMove::LoadToRegister { dest, src, size } => {
                self.load_from(dest, Reg::Sp, src.value(), size)
            }
        }
    }

    fn thread_flags(&self) -> Reg {
        assert_eq!(
            ManagedThread::thread_flags_offset(PS).value(),
            0,
            "exclusive access needs the flags at the thread base"
        );
        TR
    }
}

impl JniMacroAssembler for Arm64JniMacroAssembler {
    fn instruction_set(&self) -> InstructionSet {
        InstructionSet::Arm64
    }

    fn finalize_code(&mut self) {
        self.core.finalize();
    }

    fn code_size(&self) -> usize {
        self.core.code_size()
    }

    fn copy_instructions(&self, region: &mut [u8]) {
        self.core.copy_instructions(region);
    }

    fn current_cfa_offset(&self) -> usize {
        self.core.cfa_offset
    }

    fn build_frame(
        &mut self,
        frame_size: usize,
        method_reg: ManagedRegister,
        callee_save_regs: &[ManagedRegister],
    ) {
        assert_eq!(frame_size % STACK_ALIGNMENT, 0, "frame size {} is not aligned", frame_size);
        let (core_regs, fp_regs) = Self::split_callee_saves(callee_save_regs);
        let core_size = core_regs.len() * 8;
        let fp_size = fp_regs.len() * 8;
        assert!(core_size + fp_size <= frame_size, "callee saves do not fit the frame");

        self.increase_frame_size(frame_size);
        self.spill_core(&core_regs, frame_size - core_size);
        self.spill_fp(&fp_regs, frame_size - core_size - fp_size);
        if method_reg.is_register() {
            let method = method_reg.as_arm64().as_x();
            self.asm().str_x(method, Reg::Sp, 0);
        }
    }

    fn remove_frame(
        &mut self,
        frame_size: usize,
        callee_save_regs: &[ManagedRegister],
        may_suspend: bool,
    ) {
        assert_eq!(frame_size % STACK_ALIGNMENT, 0, "frame size {} is not aligned", frame_size);
        let (core_regs, fp_regs) = Self::split_callee_saves(callee_save_regs);
        let core_size = core_regs.len() * 8;
        let fp_size = fp_regs.len() * 8;
        self.unspill_core(&core_regs, frame_size - core_size);
        self.unspill_fp(&fp_regs, frame_size - core_size - fp_size);
        if may_suspend {
            // Marking may have flipped while the thread was suspended.
            let marking = off(ManagedThread::is_gc_marking_offset(PS).value());
            self.asm().ldr_w(MR, TR, marking);
        }
        self.adjust_sp(frame_size, false);
        self.asm().ret();
        self.core.cfa_offset = frame_size;
    }

    fn increase_frame_size(&mut self, adjust: usize) {
        assert_eq!(adjust % STACK_ALIGNMENT, 0, "frame adjustment {} is not aligned", adjust);
        self.adjust_sp(adjust, true);
        self.core.cfa_offset += adjust;
    }

    fn decrease_frame_size(&mut self, adjust: usize) {
        assert_eq!(adjust % STACK_ALIGNMENT, 0, "frame adjustment {} is not aligned", adjust);
        self.adjust_sp(adjust, false);
        self.core.cfa_offset -= adjust;
    }

    fn core_register_with_size(&self, src: ManagedRegister, size: usize) -> ManagedRegister {
        let reg = src.as_arm64();
        assert!(reg.is_core_register(), "{:?} is not a core register", src);
        match size {
            8 => reg.as_overlapping_x(),
            1 | 2 | 4 => reg.as_overlapping_w(),
            _ => panic!("unsupported register size {}", size),
        }
    }

    fn store(&mut self, offs: FrameOffset, src: ManagedRegister, size: usize) {
        self.store_to(Reg::Sp, offs.value(), src, size);
    }

    fn store_to_member(
        &mut self,
        base: ManagedRegister,
        offs: MemberOffset,
        src: ManagedRegister,
        size: usize,
    ) {
        self.store_to(core(base), offs.value(), src, size);
    }

    fn store_raw_ptr(&mut self, offs: FrameOffset, src: ManagedRegister) {
        self.asm().str_x(core(src), Reg::Sp, off(offs.value()));
    }

    fn store_stack_pointer_to_thread(&mut self, thr_offs: ThreadOffset, tag_sp: bool) {
        let mut asm = self.asm();
        asm.mov(IP0, Reg::Sp);
        if tag_sp {
            asm.orr_bit(IP0, IP0, 1);
        }
        asm.str_x(IP0, TR, off(thr_offs.value()));
    }

    fn load(&mut self, dest: ManagedRegister, src: FrameOffset, size: usize) {
        self.load_from(dest, Reg::Sp, src.value(), size);
    }

    fn load_from_member(
        &mut self,
        dest: ManagedRegister,
        base: ManagedRegister,
        offs: MemberOffset,
        size: usize,
    ) {
        self.load_from(dest, core(base), offs.value(), size);
    }

    fn load_raw_ptr_from_thread(&mut self, dest: ManagedRegister, offs: ThreadOffset) {
        self.asm().ldr_x(core(dest), TR, off(offs.value()));
    }

    fn load_gc_root_without_read_barrier(
        &mut self,
        dest: ManagedRegister,
        base: ManagedRegister,
        offs: MemberOffset,
    ) {
        self.asm().ldr_w(core(dest), core(base), off(offs.value()));
    }

    fn move_arguments(
        &mut self,
        dests: &[ArgumentLocation],
        srcs: &[ArgumentLocation],
        refs: &[FrameOffset],
    ) {
        for mv in plan_moves(&Arm64Registers, dests, srcs, refs) {
            self.emit_move(mv);
        }
    }

    fn move_reg(&mut self, dest: ManagedRegister, src: ManagedRegister, size: usize) {
        let (d, s) = (dest.as_arm64(), src.as_arm64());
        if d.is_core_register() && s.is_core_register() {
            if d.as_core() == s.as_core() {
                return;
            }
            if size == 8 {
                self.asm().mov(d.as_core(), s.as_core());
            } else {
                self.asm().mov_w(d.as_core(), s.as_core());
            }
        } else if d.is_fp_register() && s.is_fp_register() {
            if d.as_vreg() == s.as_vreg() {
                return;
            }
            if size == 8 {
                self.asm().fmov_d(d.as_vreg(), s.as_vreg());
            } else {
                self.asm().fmov_s(d.as_vreg(), s.as_vreg());
            }
        } else {
            panic!("unsupported move from {:?} to {:?}", src, dest);
        }
    }

    fn move_immediate(&mut self, dest: ManagedRegister, value: usize) {
        self.asm().mov_imm64(core(dest), value as u64);
    }

    fn copy(&mut self, dest: FrameOffset, src: FrameOffset, size: usize) {
        let (dest, src) = (off(dest.value()), off(src.value()));
        let mut asm = self.asm();
        match size {
            4 => {
                asm.ldr_w(IP0, Reg::Sp, src);
                asm.str_w(IP0, Reg::Sp, dest);
            }
            8 => {
                asm.ldr_x(IP0, Reg::Sp, src);
                asm.str_x(IP0, Reg::Sp, dest);
            }
            _ => panic!("unsupported copy size {}", size),
        }
    }

    fn sign_extend(&mut self, reg: ManagedRegister, size: usize) {
        let reg = core(reg);
        match size {
            1 => self.asm().sxtb(reg, reg),
            2 => self.asm().sxth(reg, reg),
            _ => panic!("unsupported sign extension from {} bytes", size),
        }
    }

    fn zero_extend(&mut self, reg: ManagedRegister, size: usize) {
        let reg = core(reg);
        match size {
            1 => self.asm().uxtb(reg, reg),
            2 => self.asm().uxth(reg, reg),
            _ => panic!("unsupported zero extension from {} bytes", size),
        }
    }

    fn get_current_thread(&mut self, dest: ManagedRegister) {
        self.asm().mov(core(dest), TR);
    }

    fn get_current_thread_to_frame(&mut self, dest: FrameOffset) {
        self.asm().str_x(TR, Reg::Sp, off(dest.value()));
    }

    fn decode_jni_transition_or_local_jobject(
        &mut self,
        reg: ManagedRegister,
        slow_path: JniMacroLabel,
        resume: JniMacroLabel,
    ) {
        let (slow_path, resume) = (self.core.label(slow_path), self.core.label(resume));
        let reg = core(reg);
        let mut asm = self.asm();
        asm.tst_bit(reg, GLOBAL_OR_WEAK_GLOBAL_MASK.trailing_zeros());
        asm.b_cond_label(Cond::Ne, slow_path);
        asm.and_clear_low(reg, reg, 2);
        asm.cbz_label(reg, true, resume);
        asm.ldr_w(reg, reg, 0);
    }

    fn jump_to_address(&mut self, base: ManagedRegister, offs: Offset) {
        let mut asm = AArch64Assembler::new(&mut self.core.buf);
        asm.ldr_x(IP0, core(base), off(offs.value()));
        asm.br(IP0);
    }

    fn call(&mut self, base: ManagedRegister, offs: Offset) {
        let base = core(base);
        let mut asm = self.asm();
        asm.ldr_x(Reg::Lr, base, off(offs.value()));
        asm.blr(Reg::Lr);
    }

    fn call_from_thread(&mut self, offs: ThreadOffset) {
        let mut asm = self.asm();
        asm.ldr_x(Reg::Lr, TR, off(offs.value()));
        asm.blr(Reg::Lr);
    }

    fn try_to_transition_from_runnable_to_native(
        &mut self,
        label: JniMacroLabel,
        _scratch_regs: &[ManagedRegister],
    ) {
        let label = self.core.label(label);
        let flags = self.thread_flags();
        let native = ThreadState::Native.state_and_flags_value();
        let held = off(ManagedThread::held_mutex_mutator_lock_offset(PS).value());
        if self.has_lse_atomics {
            let mut asm = self.asm();
            asm.mov_imm32(IP0, 0);
            asm.mov_imm32(IP1, native);
            asm.casal_w(IP0, IP1, flags);
            asm.cbnz_label(IP0, false, label);
        } else {
            let retry = self.new_local_label();
            let mut asm = self.asm();
            asm.bind(retry);
            asm.ldaxr_w(IP0, flags);
            asm.mov_imm32(IP1, native);
            asm.cbnz_label(IP0, false, label);
            asm.stlxr_w(IP0, IP1, flags);
            asm.cbnz_label(IP0, false, retry);
        }
        self.asm().str_x(Reg::XZR, TR, held);
    }

    fn try_to_transition_from_native_to_runnable(
        &mut self,
        label: JniMacroLabel,
        _scratch_regs: &[ManagedRegister],
        return_reg: ManagedRegister,
    ) {
        let label = self.core.label(label);
        if return_reg.is_register() {
            let ret = return_reg.as_arm64();
            assert!(
                !ret.is_core_register() || !matches!(ret.as_core(), Reg::X16 | Reg::X17),
                "return register {:?} overlaps IP0/IP1",
                return_reg
            );
        }
        let flags = self.thread_flags();
        let native = ThreadState::Native.state_and_flags_value();
        if self.has_lse_atomics {
            let mut asm = self.asm();
            asm.mov_imm32(IP0, native);
            asm.casal_w(IP0, Reg::XZR, flags);
            asm.mov_imm32(IP1, native);
            asm.cmp_w(IP0, IP1);
            asm.b_cond_label(Cond::Ne, label);
        } else {
            let retry = self.new_local_label();
            let mut asm = self.asm();
            asm.bind(retry);
            asm.ldaxr_w(IP0, flags);
            asm.mov_imm32(IP1, native);
            asm.cmp_w(IP0, IP1);
            asm.b_cond_label(Cond::Ne, label);
            asm.stxr_w(IP0, Reg::XZR, flags);
            asm.cbnz_label(IP0, false, retry);
        }
        let mutator_lock = off(ManagedThread::mutator_lock_offset(PS).value());
        let held = off(ManagedThread::held_mutex_mutator_lock_offset(PS).value());
        let mut asm = self.asm();
        asm.ldr_x(IP0, TR, mutator_lock);
        asm.str_x(IP0, TR, held);
    }

    fn suspend_check(&mut self, label: JniMacroLabel) {
        let label = self.core.label(label);
        let mask = ThreadFlag::SUSPEND_OR_CHECKPOINT_REQUEST;
        assert!((mask + 1).is_power_of_two(), "suspend flags must be the low bits");
        let flags = off(ManagedThread::thread_flags_offset(PS).value());
        let mut asm = self.asm();
        asm.ldr_w(IP0, TR, flags);
        asm.tst_w_low_bits(IP0, mask.count_ones());
        asm.b_cond_label(Cond::Ne, label);
    }

    fn exception_poll(&mut self, label: JniMacroLabel) {
        let label = self.core.label(label);
        let exception = off(ManagedThread::exception_offset(PS).value());
        let mut asm = self.asm();
        asm.ldr_x(IP0, TR, exception);
        asm.cbnz_label(IP0, true, label);
    }

    fn deliver_pending_exception(&mut self) {
        let exception = off(ManagedThread::exception_offset(PS).value());
        let entry = off(ThreadOffset::quick_entrypoint(PS, QuickEntrypoint::DeliverException).value());
        let mut asm = self.asm();
        asm.ldr_x(Reg::X0, TR, exception);
        asm.ldr_x(Reg::Lr, TR, entry);
        asm.blr(Reg::Lr);
        asm.brk(0);
    }

    fn create_label(&mut self) -> JniMacroLabel {
        self.core.create_label()
    }

    fn jump(&mut self, label: JniMacroLabel) {
        let label = self.core.label(label);
        self.asm().b_label(label);
    }

    fn test_gc_marking(&mut self, label: JniMacroLabel, cond: JniMacroUnaryCondition) {
        let label = self.core.label(label);
        let marking = off(ManagedThread::is_gc_marking_offset(PS).value());
        let mut asm = self.asm();
        asm.ldr_w(IP0, TR, marking);
        match cond {
            JniMacroUnaryCondition::Zero => asm.cbz_label(IP0, false, label),
            JniMacroUnaryCondition::NotZero => asm.cbnz_label(IP0, false, label),
        }
    }

    fn test_mark_bit(
        &mut self,
        reference: ManagedRegister,
        label: JniMacroLabel,
        cond: JniMacroUnaryCondition,
    ) {
        let label = self.core.label(label);
        let base = core(reference);
        let mut asm = self.asm();
        asm.ldr_w(IP0, base, off(Object::MONITOR_OFFSET.value()));
        asm.tst_w_bit(IP0, LockWord::MARK_BIT_SHIFT);
        let cond = match cond {
            JniMacroUnaryCondition::Zero => Cond::Eq,
            JniMacroUnaryCondition::NotZero => Cond::Ne,
        };
        asm.b_cond_label(cond, label);
    }

    fn test_byte_and_jump_if_not_zero(&mut self, address: usize, label: JniMacroLabel) {
        let label = self.core.label(label);
        let mut asm = self.asm();
        asm.mov_imm64(IP0, address as u64);
        asm.ldrb(IP0, IP0, 0);
        asm.cbnz_label(IP0, false, label);
    }

    fn bind(&mut self, label: JniMacroLabel) {
        self.core.bind(label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x(reg: Reg) -> ManagedRegister {
        Arm64ManagedRegister::from_x(reg)
    }

    fn w(reg: Reg) -> ManagedRegister {
        Arm64ManagedRegister::from_w(reg)
    }

    fn words(mut asm: Arm64JniMacroAssembler) -> Vec<u32> {
        asm.finalize_code();
        let mut code = vec![0; asm.code_size()];
        asm.copy_instructions(&mut code);
        code.chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn lse() -> InstructionSetFeatures {
        InstructionSetFeatures {
            has_lse_atomics: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_suspend_check_tests_low_flag_bits() {
        let mut asm = Arm64JniMacroAssembler::new(&InstructionSetFeatures::default());
        let label = asm.create_label();
        asm.suspend_check(label);
        asm.bind(label);
        let code = words(asm);
        // ldr w16, [x19]; tst w16, #7; b.ne
        assert_eq!(code[0], 0xB940_0270);
        assert_eq!(code[1], 0x7200_0A1F);
        assert_eq!(code[2] & 0xFF00_001F, 0x5400_0001);
    }

    #[test]
    fn test_runnable_to_native_with_lse_uses_casal() {
        let mut asm = Arm64JniMacroAssembler::new(&lse());
        let slow = asm.create_label();
        asm.try_to_transition_from_runnable_to_native(slow, &[]);
        asm.bind(slow);
        let code = words(asm);
        assert_eq!(&code[..3], &[0x5280_0010, 0x52A0_2011, 0x88F0_FE71]);
        // cbnz w16
        assert_eq!(code[3] & 0xFF00_001F, 0x3500_0010);
    }

    #[test]
    fn test_runnable_to_native_without_lse_loops() {
        let mut asm = Arm64JniMacroAssembler::new(&InstructionSetFeatures::default());
        let slow = asm.create_label();
        asm.try_to_transition_from_runnable_to_native(slow, &[]);
        asm.bind(slow);
        let code = words(asm);
        // ldaxr w16, [x19]
        assert_eq!(code[0], 0x885F_FE70);
        // stlxr w16, w17, [x19]
        assert!(code.contains(&0x8810_FE71));
        assert!(!code.iter().any(|&i| i & 0xFFE0_FC00 == 0x88E0_FC00));
    }

    #[test]
    fn test_native_to_runnable_without_lse_compares_state() {
        let mut asm = Arm64JniMacroAssembler::new(&InstructionSetFeatures::default());
        let slow = asm.create_label();
        asm.try_to_transition_from_native_to_runnable(slow, &[], x(Reg::X0));
        asm.bind(slow);
        let code = words(asm);
        // cmp w16, w17
        assert!(code.contains(&0x6B11_021F));
        // stxr w16, wzr, [x19]
        assert!(code.contains(&0x8810_7E7F));
    }

    #[test]
    fn test_frame_layout() {
        let saves = [x(Reg::X19), x(Reg::X20), x(Reg::X21), Arm64ManagedRegister::from_d(VReg(8))];
        let mut asm = Arm64JniMacroAssembler::new(&InstructionSetFeatures::default());
        asm.build_frame(48, x(Reg::X0), &saves);
        assert_eq!(asm.current_cfa_offset(), 48);
        asm.remove_frame(48, &saves, false);
        let code = words(asm);
        // sub sp, sp, #48
        assert_eq!(code[0], 0xD100_C3FF);
        // stp x19, x20, [sp, #24]; str x21, [sp, #40]; str d8, [sp, #16]; str x0, [sp]
        assert_eq!(code[1], 0xA901_D3F3);
        assert_eq!(code[2], 0xF900_17F5);
        assert_eq!(code[3], 0xFD00_0BE8);
        assert_eq!(code[4], 0xF900_03E0);
        // add sp, sp, #48; ret
        assert_eq!(&code[code.len() - 2..], &[0x9100_C3FF, 0xD65F_03C0]);
    }

    #[test]
    fn test_core_register_with_size_picks_width() {
        let asm = Arm64JniMacroAssembler::new(&InstructionSetFeatures::default());
        assert_eq!(asm.core_register_with_size(x(Reg::X3), 4), w(Reg::X3));
        assert_eq!(asm.core_register_with_size(w(Reg::X3), 8), x(Reg::X3));
    }

    #[test]
    fn test_move_arguments_null_checks_non_receiver() {
        let mut asm = Arm64JniMacroAssembler::new(&InstructionSetFeatures::default());
        asm.move_arguments(
            &[ArgumentLocation::register(x(Reg::X2), 8)],
            &[ArgumentLocation::register(w(Reg::X2), 4)],
            &[FrameOffset(0x40)],
        );
        asm.move_arguments(
            &[ArgumentLocation::register(x(Reg::X1), 8), ArgumentLocation::register(x(Reg::X3), 8)],
            &[ArgumentLocation::register(w(Reg::X1), 4), ArgumentLocation::register(w(Reg::X3), 4)],
            &[FrameOffset(0x48), FrameOffset(0x4C)],
        );
        let code = words(asm);
        // First call: receiver, no null check. str w2, [sp, #0x40]; add x2, sp, #0x40
        assert_eq!(&code[..2], &[0xB900_43E2, 0x9101_03E2]);
        // Second call, argument 1: cbnz w3 ... movz x3, #0
        assert!(code.contains(&0xD280_0003));
    }

    #[test]
    fn test_decode_sequence() {
        let mut asm = Arm64JniMacroAssembler::new(&InstructionSetFeatures::default());
        let slow = asm.create_label();
        let resume = asm.create_label();
        asm.decode_jni_transition_or_local_jobject(x(Reg::X0), slow, resume);
        asm.bind(slow);
        asm.bind(resume);
        let code = words(asm);
        // tst x0, #2
        assert_eq!(code[0], 0xF27F_001F);
        // and x0, x0, #~3
        assert_eq!(code[2], 0x927E_F400);
        // ldr w0, [x0]
        assert_eq!(code[4], 0xB940_0000);
    }
}
