//! x86-64 JNI macro-assembler.
//!
//! The current thread is addressed through `gs`. R11 is the backend's
//! scratch register; RAX is clobbered by the state transitions.

use crate::isa::{InstructionSet, PointerSize};
use crate::jit::codebuf::LabelId;
use crate::jit::x86_64::{Cond, Mem, Reg, X86_64Assembler};
use crate::jni::move_args::{plan_moves, ArgMove, RegisterModel};
use crate::jni::{
    ArgumentLocation, AsmCore, JniMacroAssembler, JniMacroLabel, JniMacroUnaryCondition,
    ManagedRegister, X86_64ManagedRegister,
};
use crate::offsets::{FrameOffset, MemberOffset, Offset, ThreadOffset};
use crate::runtime::entrypoints::QuickEntrypoint;
use crate::runtime::indirect_ref::{GLOBAL_OR_WEAK_GLOBAL_MASK, KIND_MASK};
use crate::runtime::object::{LockWord, Object};
use crate::runtime::thread::{ManagedThread, ThreadFlag, ThreadState};

const PS: PointerSize = PointerSize::K64;
const FRAME_POINTER_SIZE: usize = 8;
const STACK_ALIGNMENT: usize = 16;
const SCRATCH: Reg = Reg::R11;

fn cpu(reg: ManagedRegister) -> Reg {
    reg.as_x86_64().as_cpu()
}

fn thread(offs: ThreadOffset) -> Mem {
    Mem::GsAbs(offs.int32_value() as u32)
}

fn frame(offs: FrameOffset) -> Mem {
    Mem::base(Reg::Rsp, offs.int32_value())
}

fn cond(c: JniMacroUnaryCondition) -> Cond {
    match c {
        JniMacroUnaryCondition::Zero => Cond::ZERO,
        JniMacroUnaryCondition::NotZero => Cond::NOT_ZERO,
    }
}

struct X86_64Registers;

impl RegisterModel for X86_64Registers {
    fn mask(&self, reg: ManagedRegister) -> u64 {
        reg.as_x86_64().mask_bit() as u64
    }

    fn pointer_register(&self, reg: ManagedRegister) -> ManagedRegister {
        reg
    }

    fn pointer_size(&self) -> usize {
        PS.bytes()
    }
}

pub struct X86_64JniMacroAssembler {
    core: AsmCore,
}

impl X86_64JniMacroAssembler {
    pub fn new() -> Self {
        Self {
            core: AsmCore::new(InstructionSet::X86_64),
        }
    }

    fn asm(&mut self) -> X86_64Assembler<'_> {
        X86_64Assembler::new(&mut self.core.buf)
    }

    fn new_local_label(&mut self) -> LabelId {
        self.core.buf.new_label()
    }

    fn store_to(&mut self, mem: Mem, src: ManagedRegister, size: usize) {
        let src = src.as_x86_64();
        if src.is_no_register() {
            assert_eq!(size, 0, "store of {} bytes from no register", size);
        } else if src.is_cpu_register() {
            let reg = src.as_cpu();
            let mut asm = self.asm();
            match size {
                1 => asm.movb_store(mem, reg),
                2 => asm.movw_store(mem, reg),
                4 => asm.movl_store(mem, reg),
                8 => asm.movq_store(mem, reg),
                _ => panic!("unsupported store size {} for a CPU register", size),
            }
        } else {
            let xmm = src.as_xmm();
            match size {
                4 => self.asm().movss_store(mem, xmm),
                8 => self.asm().movsd_store(mem, xmm),
                _ => panic!("unsupported store size {} for an XMM register", size),
            }
        }
    }

    fn load_from(&mut self, dest: ManagedRegister, mem: Mem, size: usize) {
        let dest = dest.as_x86_64();
        if dest.is_no_register() {
            assert_eq!(size, 0, "load of {} bytes into no register", size);
        } else if dest.is_cpu_register() {
            let reg = dest.as_cpu();
            let mut asm = self.asm();
            match size {
                1 => asm.movzxb_load(reg, mem),
                2 => asm.movzxw_load(reg, mem),
                4 => asm.movl_load(reg, mem),
                8 => asm.movq_load(reg, mem),
                _ => panic!("unsupported load size {} for a CPU register", size),
            }
        } else {
            let xmm = dest.as_xmm();
            match size {
                4 => self.asm().movss_load(xmm, mem),
                8 => self.asm().movsd_load(xmm, mem),
                _ => panic!("unsupported load size {} for an XMM register", size),
            }
        }
    }

    /// `out = ref == null ? null : &spill`, reading the reference from
    /// `in_reg` or, when that is `no_register()`, from the spill slot.
    fn create_jobject_in_register(
        &mut self,
        out: ManagedRegister,
        spill: FrameOffset,
        in_reg: ManagedRegister,
        null_allowed: bool,
    ) {
        let out = cpu(out);
        let input = if in_reg.is_no_register() {
            self.asm().movl_load(out, frame(spill));
            out
        } else {
            cpu(in_reg)
        };
        if null_allowed {
            let null_arg = self.new_local_label();
            let mut asm = self.asm();
            if out != input {
                asm.xorl_rr(out, out);
            }
            asm.testl_rr(input, input);
            asm.jcc_label(Cond::ZERO, null_arg);
            asm.leaq(out, frame(spill));
            asm.bind(null_arg);
        } else {
            self.asm().leaq(out, frame(spill));
        }
    }

    fn create_jobject_in_frame(&mut self, out: FrameOffset, spill: FrameOffset, null_allowed: bool) {
        if null_allowed {
            let null_arg = self.new_local_label();
            let mut asm = self.asm();
            asm.movl_load(SCRATCH, frame(spill));
            asm.testl_rr(SCRATCH, SCRATCH);
            asm.jcc_label(Cond::ZERO, null_arg);
            asm.leaq(SCRATCH, frame(spill));
            asm.bind(null_arg);
        } else {
            self.asm().leaq(SCRATCH, frame(spill));
        }
        self.asm().movq_store(frame(out), SCRATCH);
    }

    fn emit_move(&mut self, mv: ArgMove) {
        match mv {
            ArgMove::SpillReference { reg, offset } => self.asm().movl_store(frame(offset), cpu(reg)),
            ArgMove::StoreToStack { dest, src, size } => self.store_to(frame(dest), src, size),
            ArgMove::JObjectToStack { dest, spill, null_allowed } => {
                self.create_jobject_in_frame(dest, spill, null_allowed)
            }
            ArgMove::CopyToStack { dest, src, size } => self.copy(dest, src, size),
            ArgMove::MoveToRegister { dest, src, size } => self.move_reg(dest, src, size),
            ArgMove::JObjectToRegister { dest, spill, in_reg, null_allowed } => {
                self.create_jobject_in_register(dest, spill, in_reg, null_allowed)
            }
            ArgMove::LoadToRegister { dest, src, size } => self.load_from(dest, frame(src), size),
        }
    }
}

impl Default for X86_64JniMacroAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl JniMacroAssembler for X86_64JniMacroAssembler {
    fn instruction_set(&self) -> InstructionSet {
        InstructionSet::X86_64
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
        // The return address is already on the stack.
        self.core.cfa_offset = FRAME_POINTER_SIZE;
        let mut gpr_count = 0;
        for reg in callee_save_regs.iter().rev().map(|r| r.as_x86_64()) {
            if reg.is_cpu_register() {
                self.asm().push(reg.as_cpu());
                gpr_count += 1;
                self.core.cfa_offset += FRAME_POINTER_SIZE;
            }
        }
        let rest = frame_size - gpr_count * FRAME_POINTER_SIZE - FRAME_POINTER_SIZE;
        if rest != 0 {
            self.asm().subq_ri(Reg::Rsp, rest as i32);
            self.core.cfa_offset += rest;
        }
        let mut offset = rest;
        for reg in callee_save_regs.iter().rev().map(|r| r.as_x86_64()) {
            if reg.is_xmm_register() {
                offset -= 8;
                self.asm().movsd_store(Mem::base(Reg::Rsp, offset as i32), reg.as_xmm());
            }
        }
        if method_reg.is_register() {
            self.asm().movq_store(Mem::base(Reg::Rsp, 0), cpu(method_reg));
        }
        debug_assert_eq!(self.core.cfa_offset, frame_size);
    }

    fn remove_frame(
        &mut self,
        frame_size: usize,
        callee_save_regs: &[ManagedRegister],
        _may_suspend: bool,
    ) {
        assert_eq!(frame_size % STACK_ALIGNMENT, 0, "frame size {} is not aligned", frame_size);
        let mut offset =
            frame_size - callee_save_regs.len() * FRAME_POINTER_SIZE - FRAME_POINTER_SIZE;
        for reg in callee_save_regs.iter().map(|r| r.as_x86_64()) {
            if reg.is_xmm_register() {
                self.asm().movsd_load(reg.as_xmm(), Mem::base(Reg::Rsp, offset as i32));
                offset += 8;
            }
        }
        let gpr_count = callee_save_regs.iter().filter(|r| r.as_x86_64().is_cpu_register()).count();
        let adjust = frame_size - gpr_count * FRAME_POINTER_SIZE - FRAME_POINTER_SIZE;
        if adjust != 0 {
            self.asm().addq_ri(Reg::Rsp, adjust as i32);
        }
        for reg in callee_save_regs.iter().map(|r| r.as_x86_64()) {
            if reg.is_cpu_register() {
                self.asm().pop(reg.as_cpu());
            }
        }
        self.asm().ret();
        // Code after the return (slow paths) still runs inside the frame.
        self.core.cfa_offset = frame_size;
    }

    fn increase_frame_size(&mut self, adjust: usize) {
        assert_eq!(adjust % STACK_ALIGNMENT, 0, "frame adjustment {} is not aligned", adjust);
        if adjust != 0 {
            self.asm().subq_ri(Reg::Rsp, adjust as i32);
            self.core.cfa_offset += adjust;
        }
    }

    fn decrease_frame_size(&mut self, adjust: usize) {
        assert_eq!(adjust % STACK_ALIGNMENT, 0, "frame adjustment {} is not aligned", adjust);
        if adjust != 0 {
            self.asm().addq_ri(Reg::Rsp, adjust as i32);
            self.core.cfa_offset -= adjust;
        }
    }

    fn core_register_with_size(&self, src: ManagedRegister, size: usize) -> ManagedRegister {
        assert!(src.as_x86_64().is_cpu_register(), "{:?} is not a CPU register", src);
        assert!(matches!(size, 1 | 2 | 4 | 8), "unsupported register size {}", size);
        src
    }

    fn store(&mut self, offs: FrameOffset, src: ManagedRegister, size: usize) {
        self.store_to(frame(offs), src, size);
    }

    fn store_to_member(
        &mut self,
        base: ManagedRegister,
        offs: MemberOffset,
        src: ManagedRegister,
        size: usize,
    ) {
        self.store_to(Mem::base(cpu(base), offs.int32_value()), src, size);
    }

    fn store_raw_ptr(&mut self, offs: FrameOffset, src: ManagedRegister) {
        self.asm().movq_store(frame(offs), cpu(src));
    }

    fn store_stack_pointer_to_thread(&mut self, thr_offs: ThreadOffset, tag_sp: bool) {
        let mut asm = self.asm();
        if tag_sp {
            asm.movq_rr(SCRATCH, Reg::Rsp);
            asm.orq_ri(SCRATCH, 0x2);
            asm.movq_store(thread(thr_offs), SCRATCH);
        } else {
            asm.movq_store(thread(thr_offs), Reg::Rsp);
        }
    }

    fn load(&mut self, dest: ManagedRegister, src: FrameOffset, size: usize) {
        self.load_from(dest, frame(src), size);
    }

    fn load_from_member(
        &mut self,
        dest: ManagedRegister,
        base: ManagedRegister,
        offs: MemberOffset,
        size: usize,
    ) {
        self.load_from(dest, Mem::base(cpu(base), offs.int32_value()), size);
    }

    fn load_raw_ptr_from_thread(&mut self, dest: ManagedRegister, offs: ThreadOffset) {
        self.asm().movq_load(cpu(dest), thread(offs));
    }

    fn load_gc_root_without_read_barrier(
        &mut self,
        dest: ManagedRegister,
        base: ManagedRegister,
        offs: MemberOffset,
    ) {
        self.asm().movl_load(cpu(dest), Mem::base(cpu(base), offs.int32_value()));
    }

    fn move_arguments(
        &mut self,
        dests: &[ArgumentLocation],
        srcs: &[ArgumentLocation],
        refs: &[FrameOffset],
    ) {
        for mv in plan_moves(&X86_64Registers, dests, srcs, refs) {
            self.emit_move(mv);
        }
    }

    fn move_reg(&mut self, dest: ManagedRegister, src: ManagedRegister, size: usize) {
        if dest == src {
            return;
        }
        let (d, s) = (dest.as_x86_64(), src.as_x86_64());
        if d.is_cpu_register() && s.is_cpu_register() {
            if size == 8 {
                self.asm().movq_rr(d.as_cpu(), s.as_cpu());
            } else {
                self.asm().movl_rr(d.as_cpu(), s.as_cpu());
            }
        } else if d.is_xmm_register() && s.is_xmm_register() {
            self.asm().movaps(d.as_xmm(), s.as_xmm());
        } else {
            panic!("unsupported move from {:?} to {:?}", src, dest);
        }
    }

    fn move_immediate(&mut self, dest: ManagedRegister, value: usize) {
        self.asm().mov_ri(cpu(dest), value as u64);
    }

    fn copy(&mut self, dest: FrameOffset, src: FrameOffset, size: usize) {
        let mut asm = self.asm();
        match size {
            4 => {
                asm.movl_load(SCRATCH, frame(src));
                asm.movl_store(frame(dest), SCRATCH);
            }
            8 => {
                asm.movq_load(SCRATCH, frame(src));
                asm.movq_store(frame(dest), SCRATCH);
            }
            _ => panic!("unsupported copy size {}", size),
        }
    }

    fn sign_extend(&mut self, reg: ManagedRegister, size: usize) {
        let reg = cpu(reg);
        match size {
            1 => self.asm().movsxb(reg, reg),
            2 => self.asm().movsxw(reg, reg),
            _ => panic!("unsupported sign extension from {} bytes", size),
        }
    }

    fn zero_extend(&mut self, reg: ManagedRegister, size: usize) {
        let reg = cpu(reg);
        match size {
            1 => self.asm().movzxb(reg, reg),
            2 => self.asm().movzxw(reg, reg),
            _ => panic!("unsupported zero extension from {} bytes", size),
        }
    }

    fn get_current_thread(&mut self, dest: ManagedRegister) {
        self.asm().movq_load(cpu(dest), thread(ManagedThread::self_offset(PS)));
    }

    fn get_current_thread_to_frame(&mut self, dest: FrameOffset) {
        let mut asm = self.asm();
        asm.movq_load(SCRATCH, thread(ManagedThread::self_offset(PS)));
        asm.movq_store(frame(dest), SCRATCH);
    }

    fn decode_jni_transition_or_local_jobject(
        &mut self,
        reg: ManagedRegister,
        slow_path: JniMacroLabel,
        resume: JniMacroLabel,
    ) {
        let (slow_path, resume) = (self.core.label(slow_path), self.core.label(resume));
        let reg = cpu(reg);
        let mut asm = self.asm();
        asm.testl_ri(reg, GLOBAL_OR_WEAK_GLOBAL_MASK as u32);
        asm.jcc_label(Cond::NOT_ZERO, slow_path);
        asm.andq_ri(reg, !(KIND_MASK as i32));
        asm.jcc_label(Cond::ZERO, resume);
        asm.movl_load(reg, Mem::base(reg, 0));
    }

    fn jump_to_address(&mut self, base: ManagedRegister, offs: Offset) {
        self.asm().jmp_mem(Mem::base(cpu(base), offs.int32_value()));
    }

    fn call(&mut self, base: ManagedRegister, offs: Offset) {
        self.asm().call_mem(Mem::base(cpu(base), offs.int32_value()));
    }

    fn call_from_thread(&mut self, offs: ThreadOffset) {
        self.asm().call_mem(thread(offs));
    }

    fn try_to_transition_from_runnable_to_native(
        &mut self,
        label: JniMacroLabel,
        _scratch_regs: &[ManagedRegister],
    ) {
        let label = self.core.label(label);
        let native = ThreadState::Native.state_and_flags_value();
        let mut asm = self.asm();
        // Expect Runnable with no flags in EAX.
        asm.xorl_rr(Reg::Rax, Reg::Rax);
        asm.mov_ri(SCRATCH, native as u64);
        asm.lock_cmpxchgl(thread(ManagedThread::thread_flags_offset(PS)), SCRATCH);
        asm.jcc_label(Cond::NOT_ZERO, label);
        asm.movq_store_imm(thread(ManagedThread::held_mutex_mutator_lock_offset(PS)), 0);
    }

    fn try_to_transition_from_native_to_runnable(
        &mut self,
        label: JniMacroLabel,
        scratch_regs: &[ManagedRegister],
        return_reg: ManagedRegister,
    ) {
        let label = self.core.label(label);
        assert!(scratch_regs.len() >= 2, "Native->Runnable needs two scratch registers");
        let scratch = cpu(scratch_regs[0]);
        let saved_rax = cpu(scratch_regs[1]);
        assert!(scratch != Reg::Rax && saved_rax != Reg::Rax, "scratch registers must not be RAX");
        let preserve_rax = return_reg.is_register()
            && return_reg
                .as_x86_64()
                .overlaps(X86_64ManagedRegister::from_cpu(Reg::Rax).as_x86_64());
        let native = ThreadState::Native.state_and_flags_value();
        let mut asm = self.asm();
        if preserve_rax {
            asm.movq_rr(saved_rax, Reg::Rax);
        }
        asm.mov_ri(Reg::Rax, native as u64);
        asm.xorl_rr(scratch, scratch);
        asm.lock_cmpxchgl(thread(ManagedThread::thread_flags_offset(PS)), scratch);
        if preserve_rax {
            // MOV leaves the flags from CMPXCHG intact.
            asm.movq_rr(Reg::Rax, saved_rax);
        }
        asm.jcc_label(Cond::NOT_ZERO, label);
        asm.movq_load(scratch, thread(ManagedThread::mutator_lock_offset(PS)));
        asm.movq_store(thread(ManagedThread::held_mutex_mutator_lock_offset(PS)), scratch);
    }

    fn suspend_check(&mut self, label: JniMacroLabel) {
        let label = self.core.label(label);
        let mut asm = self.asm();
        asm.testl_mi(
            thread(ManagedThread::thread_flags_offset(PS)),
            ThreadFlag::SUSPEND_OR_CHECKPOINT_REQUEST,
        );
        asm.jcc_label(Cond::NOT_ZERO, label);
    }

    fn exception_poll(&mut self, label: JniMacroLabel) {
        let label = self.core.label(label);
        let mut asm = self.asm();
        asm.cmpl_mi(thread(ManagedThread::exception_offset(PS)), 0);
        asm.jcc_label(Cond::NOT_ZERO, label);
    }

    fn deliver_pending_exception(&mut self) {
        let mut asm = self.asm();
        asm.movq_load(Reg::Rdi, thread(ManagedThread::exception_offset(PS)));
        asm.call_mem(thread(ThreadOffset::quick_entrypoint(PS, QuickEntrypoint::DeliverException)));
        // The entrypoint does not return.
        asm.int3();
    }

    fn create_label(&mut self) -> JniMacroLabel {
        self.core.create_label()
    }

    fn jump(&mut self, label: JniMacroLabel) {
        let label = self.core.label(label);
        self.asm().jmp_label(label);
    }

    fn test_gc_marking(&mut self, label: JniMacroLabel, c: JniMacroUnaryCondition) {
        let label = self.core.label(label);
        let mut asm = self.asm();
        asm.cmpl_mi(thread(ManagedThread::is_gc_marking_offset(PS)), 0);
        asm.jcc_label(cond(c), label);
    }

    fn test_mark_bit(
        &mut self,
        reference: ManagedRegister,
        label: JniMacroLabel,
        c: JniMacroUnaryCondition,
    ) {
        let label = self.core.label(label);
        let mut asm = self.asm();
        asm.testl_mi(
            Mem::base(cpu(reference), Object::MONITOR_OFFSET.int32_value()),
            LockWord::MARK_BIT_MASK_SHIFTED,
        );
        asm.jcc_label(cond(c), label);
    }

    fn test_byte_and_jump_if_not_zero(&mut self, address: usize, label: JniMacroLabel) {
        let label = self.core.label(label);
        let mut asm = self.asm();
        asm.mov_ri(SCRATCH, address as u64);
        asm.cmpb_mi(Mem::base(SCRATCH, 0), 0);
        asm.jcc_label(Cond::NOT_ZERO, label);
    }

    fn bind(&mut self, label: JniMacroLabel) {
        self.core.bind(label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::x86_64::Xmm;

    fn reg(r: Reg) -> ManagedRegister {
        X86_64ManagedRegister::from_cpu(r)
    }

    fn finish(mut asm: X86_64JniMacroAssembler) -> Vec<u8> {
        asm.finalize_code();
        let mut code = vec![0; asm.code_size()];
        asm.copy_instructions(&mut code);
        code
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn test_store_stack_pointer_untagged_and_tagged() {
        let offs = ManagedThread::top_of_managed_stack_offset(PS);
        let disp = (offs.value() as u32).to_le_bytes();

        let mut asm = X86_64JniMacroAssembler::new();
        asm.store_stack_pointer_to_thread(offs, false);
        let mut expected = vec![0x65, 0x48, 0x89, 0x24, 0x25];
        expected.extend_from_slice(&disp);
        assert_eq!(finish(asm), expected);

        let mut asm = X86_64JniMacroAssembler::new();
        asm.store_stack_pointer_to_thread(offs, true);
        let code = finish(asm);
        // mov r11, rsp; or r11, 2
        assert!(code.starts_with(&[0x49, 0x89, 0xE3, 0x49, 0x83, 0xCB, 0x02]));
    }

    #[test]
    fn test_runnable_to_native_uses_lock_cmpxchg() {
        let mut asm = X86_64JniMacroAssembler::new();
        let slow = asm.create_label();
        asm.try_to_transition_from_runnable_to_native(slow, &[]);
        asm.bind(slow);
        let code = finish(asm);
        assert!(code.starts_with(&[0x31, 0xC0, 0x41, 0xBB, 0x00, 0x00, 0x00, 0x01]));
        assert!(contains(&code, &[0x65, 0xF0, 0x44, 0x0F, 0xB1, 0x1C, 0x25, 0, 0, 0, 0]));
        assert!(contains(&code, &[0x0F, 0x85]));
    }

    #[test]
    fn test_native_to_runnable_preserves_rax_before_branch() {
        let mut asm = X86_64JniMacroAssembler::new();
        let slow = asm.create_label();
        asm.try_to_transition_from_native_to_runnable(
            slow,
            &[reg(Reg::Rbx), reg(Reg::Rbp)],
            reg(Reg::Rax),
        );
        asm.bind(slow);
        let code = finish(asm);
        // mov rbp, rax
        assert!(code.starts_with(&[0x48, 0x89, 0xC5]));
        let restore = code.windows(3).position(|w| w == [0x48, 0x89, 0xE8]).unwrap();
        let branch = code.windows(2).position(|w| w == [0x0F, 0x85]).unwrap();
        assert!(restore < branch);
    }

    #[test]
    fn test_frame_roundtrip_and_cfa() {
        let callee_saves = [
            reg(Reg::Rbx),
            reg(Reg::Rbp),
            reg(Reg::R12),
            X86_64ManagedRegister::from_xmm(Xmm(12)),
        ];
        let mut asm = X86_64JniMacroAssembler::new();
        asm.build_frame(48, reg(Reg::Rdi), &callee_saves);
        assert_eq!(asm.current_cfa_offset(), 48);
        asm.increase_frame_size(32);
        assert_eq!(asm.current_cfa_offset(), 80);
        asm.decrease_frame_size(32);
        asm.remove_frame(48, &callee_saves, true);
        assert_eq!(asm.current_cfa_offset(), 48);
        let code = finish(asm);
        // push r12; push rbp; push rbx
        assert!(code.starts_with(&[0x41, 0x54, 0x55, 0x53]));
        // pop rbx; pop rbp; pop r12; ret
        assert!(code.ends_with(&[0x5B, 0x5D, 0x41, 0x5C, 0xC3]));
    }

    #[test]
    fn test_decode_jobject_sequence() {
        let mut asm = X86_64JniMacroAssembler::new();
        let slow = asm.create_label();
        let resume = asm.create_label();
        asm.decode_jni_transition_or_local_jobject(reg(Reg::Rax), slow, resume);
        asm.bind(slow);
        asm.bind(resume);
        let code = finish(asm);
        // test eax, 2
        assert!(code.starts_with(&[0xF7, 0xC0, 0x02, 0x00, 0x00, 0x00]));
        // and rax, -4
        assert!(contains(&code, &[0x48, 0x83, 0xE0, 0xFC]));
        // mov eax, [rax]
        assert!(code.ends_with(&[0x8B, 0x00]));
    }

    #[test]
    fn test_move_arguments_converts_receiver() {
        let mut asm = X86_64JniMacroAssembler::new();
        // this in ESI -> native arg 1 (RSI) as jobject, never null-checked.
        asm.move_arguments(
            &[ArgumentLocation::register(reg(Reg::Rsi), 8)],
            &[ArgumentLocation::register(reg(Reg::Rsi), 4)],
            &[FrameOffset(0x80)],
        );
        let code = finish(asm);
        // mov [rsp+0x80], esi; lea rsi, [rsp+0x80]
        assert_eq!(
            code,
            vec![0x89, 0xB4, 0x24, 0x80, 0, 0, 0, 0x48, 0x8D, 0xB4, 0x24, 0x80, 0, 0, 0]
        );
    }

    #[test]
    #[should_panic(expected = "unsupported store size")]
    fn test_bad_store_size_panics() {
        let mut asm = X86_64JniMacroAssembler::new();
        asm.store(FrameOffset(8), reg(Reg::Rax), 3);
    }

    #[test]
    fn test_exception_delivery_calls_entrypoint() {
        let mut asm = X86_64JniMacroAssembler::new();
        asm.deliver_pending_exception();
        let code = finish(asm);
        let ep = ThreadOffset::quick_entrypoint(PS, QuickEntrypoint::DeliverException);
        let mut call = vec![0x65, 0xFF, 0x14, 0x25];
        call.extend_from_slice(&(ep.value() as u32).to_le_bytes());
        assert!(contains(&code, &call));
        assert_eq!(code.last(), Some(&0xCC));
    }
}
