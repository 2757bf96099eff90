//! JNI stub generation.
//!
//! A stub is the compiled entry point of a native method. Managed code calls
//! it like any other method; the stub builds a frame, leaves the Runnable
//! state, converts references to `jobject`s, calls the native function,
//! returns to Runnable and hands the result back. Everything unlikely (GC
//! marking, pending suspension, global references, exceptions) is handled in
//! out-of-line slow paths after the frame-removal `ret`.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace};

use crate::isa::{InstructionSet, InstructionSetFeatures};
use crate::jni::calling_convention::{
    managed_arguments, native_arguments, native_size, Abi, JniKind, ManagedArgs, Shorty,
    ShortyError,
};
use crate::jni::{
    create, ArgumentLocation, JniAsmError, JniMacroAssembler, JniMacroLabel,
    JniMacroUnaryCondition, ManagedRegister,
};
use crate::offsets::{FrameOffset, Offset, ThreadOffset};
use crate::runtime::entrypoints::QuickEntrypoint;
use crate::runtime::method::Method;
use crate::runtime::thread::ManagedThread;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StubError {
    #[error(transparent)]
    Asm(#[from] JniAsmError),
    #[error(transparent)]
    Shorty(#[from] ShortyError),
    #[error("@CriticalNative methods must be static")]
    CriticalNotStatic,
    #[error("@CriticalNative methods cannot take or return references")]
    CriticalWithReferences,
}

#[derive(Debug, Clone, Copy)]
pub struct StubOptions {
    pub kind: JniKind,
    pub is_static: bool,
    /// Tag the published SP as a JIT frame. Only debuggable runtimes walk
    /// JIT frames differently, so the tag is omitted otherwise.
    pub tag_sp: bool,
}

impl Default for StubOptions {
    fn default() -> Self {
        Self {
            kind: JniKind::Normal,
            is_static: false,
            tag_sp: false,
        }
    }
}

/// Finalized stub code.
#[derive(Debug, Clone, Serialize)]
pub struct CompiledStub {
    pub isa: InstructionSet,
    pub shorty: String,
    pub kind: JniKind,
    pub is_static: bool,
    pub frame_size: usize,
    pub out_args_size: usize,
    #[serde(serialize_with = "hex")]
    pub code: Vec<u8>,
}

fn hex<S: serde::Serializer>(code: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&code.iter().map(|b| format!("{:02x}", b)).collect::<String>())
}

enum SlowPath {
    ClassReadBarrier { entry: JniMacroLabel, resume: JniMacroLabel },
    MethodStart { entry: JniMacroLabel, resume: JniMacroLabel },
    MethodEnd { entry: JniMacroLabel, resume: JniMacroLabel },
    DecodeReference { entry: JniMacroLabel, resume: JniMacroLabel },
    SuspendCheck { entry: JniMacroLabel, resume: JniMacroLabel },
    Exception { entry: JniMacroLabel },
}

struct StubBuilder<'a> {
    asm: Box<dyn JniMacroAssembler>,
    abi: &'a Abi,
    managed: ManagedArgs,
    method_slot: FrameOffset,
    return_slot: FrameOffset,
    ret: char,
    return_reg: ManagedRegister,
}

impl StubBuilder<'_> {
    fn entrypoint(&self, ep: QuickEntrypoint) -> ThreadOffset {
        ThreadOffset::quick_entrypoint(self.abi.isa.pointer_size(), ep)
    }

    /// Save managed argument registers to their home slots around a runtime
    /// call that does not preserve them.
    fn spill_managed_args(&mut self) {
        let regs: Vec<_> = self.managed.in_registers().collect();
        for (reg, slot, size) in regs {
            self.asm.store(slot, reg, size);
        }
    }

    fn reload_managed_args(&mut self) {
        let regs: Vec<_> = self.managed.in_registers().collect();
        for (reg, slot, size) in regs {
            self.asm.load(reg, slot, size);
        }
        self.asm.load(self.abi.method_register, self.method_slot, 8);
    }

    fn save_return(&mut self) {
        if self.return_reg.is_register() {
            self.asm.store(self.return_slot, self.return_reg, native_size(self.ret));
        }
    }

    fn restore_return(&mut self) {
        if self.return_reg.is_register() {
            self.asm.load(self.return_reg, self.return_slot, native_size(self.ret));
        }
    }

    fn emit_slow_path(&mut self, path: SlowPath) {
        match path {
            SlowPath::ClassReadBarrier { entry, resume } => {
                self.asm.bind(entry);
                let tmp = self.abi.callee_save_scratch[2];
                let tmp_ref = self.asm.core_register_with_size(tmp, 4);
                self.asm.load(tmp, self.method_slot, 8);
                self.asm
                    .load_gc_root_without_read_barrier(tmp_ref, tmp, Method::DECLARING_CLASS_OFFSET);
                self.asm.test_mark_bit(tmp, resume, JniMacroUnaryCondition::NotZero);
                self.spill_managed_args();
                // The method is still in the first argument register.
                let ep = self.entrypoint(QuickEntrypoint::ReadBarrierJni);
                self.asm.call_from_thread(ep);
                self.reload_managed_args();
                self.asm.jump(resume);
            }
            SlowPath::MethodStart { entry, resume } => {
                self.asm.bind(entry);
                self.spill_managed_args();
                let ep = self.entrypoint(QuickEntrypoint::JniMethodStart);
                self.asm.call_from_thread(ep);
                self.reload_managed_args();
                self.asm.jump(resume);
            }
            SlowPath::MethodEnd { entry, resume } => {
                self.asm.bind(entry);
                self.save_return();
                let ep = self.entrypoint(QuickEntrypoint::JniMethodEnd);
                self.asm.call_from_thread(ep);
                self.restore_return();
                self.asm.jump(resume);
            }
            SlowPath::DecodeReference { entry, resume } => {
                self.asm.bind(entry);
                let arg0 = self.abi.first_native_arg();
                self.asm.move_reg(arg0, self.return_reg, 8);
                let ep = self.entrypoint(QuickEntrypoint::JniDecodeReferenceResult);
                self.asm.call_from_thread(ep);
                self.asm.jump(resume);
            }
            SlowPath::SuspendCheck { entry, resume } => {
                self.asm.bind(entry);
                self.save_return();
                let ep = self.entrypoint(QuickEntrypoint::TestSuspend);
                self.asm.call_from_thread(ep);
                self.restore_return();
                self.asm.jump(resume);
            }
            SlowPath::Exception { entry } => {
                self.asm.bind(entry);
                self.asm.deliver_pending_exception();
            }
        }
    }
}

/// Compile a JNI stub for a native method with signature `shorty`.
pub fn compile_jni_stub(
    isa: InstructionSet,
    features: &InstructionSetFeatures,
    shorty: &str,
    options: StubOptions,
) -> Result<CompiledStub, StubError> {
    let parsed = Shorty::parse(shorty)?;
    let kind = options.kind;
    let critical = kind == JniKind::Critical;
    if critical && !options.is_static {
        return Err(StubError::CriticalNotStatic);
    }
    if critical && parsed.has_references() {
        return Err(StubError::CriticalWithReferences);
    }
    let asm = create(isa, features)?;
    let abi = Abi::for_isa(isa).ok_or(JniAsmError::UnsupportedInstructionSet(isa))?;
    let ps = isa.pointer_size();

    let frame_size = abi.frame_size;
    let native = native_arguments(&abi, &parsed, options.is_static, kind);
    let out_args = native.out_args_size;
    let ret = parsed.return_type();
    let mut b = StubBuilder {
        asm,
        abi: &abi,
        managed: managed_arguments(&abi, &parsed, options.is_static, frame_size + out_args),
        method_slot: FrameOffset(out_args),
        return_slot: FrameOffset(out_args + 8),
        ret,
        return_reg: abi.return_register(ret),
    };
    let mut slow_paths = Vec::new();
    trace!(%isa, shorty, ?kind, frame_size, out_args, "building JNI stub");

    // Frame, with the method at [sp] so the stack walker can find it.
    let method_reg = if critical { ManagedRegister::no_register() } else { abi.method_register };
    b.asm.build_frame(frame_size, method_reg, &abi.callee_save_registers);
    if !critical {
        b.asm.store_stack_pointer_to_thread(
            ManagedThread::top_of_managed_stack_offset(ps),
            options.tag_sp,
        );
    }
    b.asm.increase_frame_size(out_args);

    // The class of a static method must be marked before native code sees it.
    if options.is_static && !critical {
        let entry = b.asm.create_label();
        let resume = b.asm.create_label();
        b.asm.test_gc_marking(entry, JniMacroUnaryCondition::NotZero);
        b.asm.bind(resume);
        slow_paths.push(SlowPath::ClassReadBarrier { entry, resume });
    }

    if kind == JniKind::Normal {
        let entry = b.asm.create_label();
        let resume = b.asm.create_label();
        b.asm.try_to_transition_from_runnable_to_native(entry, &abi.callee_save_scratch);
        b.asm.bind(resume);
        slow_paths.push(SlowPath::MethodStart { entry, resume });
    }

    // Arguments: jclass (the method's declaring-class root), the managed
    // arguments, then the hidden method argument of critical natives.
    let mut dests = Vec::new();
    let mut srcs = Vec::new();
    let mut refs = Vec::new();
    if let Some(class) = native.class {
        dests.push(class);
        srcs.push(ArgumentLocation::register(abi.method_register, 8));
        refs.push(FrameOffset::INVALID_REFERENCE);
    }
    dests.extend_from_slice(&native.args);
    srcs.extend_from_slice(&b.managed.locations);
    refs.extend_from_slice(&b.managed.refs);
    if let Some(hidden) = native.hidden {
        dests.push(hidden);
        srcs.push(ArgumentLocation::register(abi.method_register, 8));
        refs.push(FrameOffset::INVALID_REFERENCE);
    }
    b.asm.move_arguments(&dests, &srcs, &refs);

    match native.env {
        Some(ArgumentLocation::Register { reg, .. }) => {
            b.asm.load_raw_ptr_from_thread(reg, ManagedThread::jni_env_offset(ps));
        }
        Some(ArgumentLocation::Stack { offset, .. }) => {
            let tmp = abi.callee_save_scratch[0];
            b.asm.load_raw_ptr_from_thread(tmp, ManagedThread::jni_env_offset(ps));
            b.asm.store_raw_ptr(offset, tmp);
        }
        None => {}
    }

    // Call through the method's JNI entry point.
    let jni_entry = Offset::from(Method::entry_point_from_jni_offset(ps));
    if critical {
        b.asm.call(abi.hidden_arg_register, jni_entry);
    } else {
        let target = abi.callee_save_scratch[2];
        b.asm.load(target, b.method_slot, 8);
        b.asm.call(target, jni_entry);
    }
    debug_assert_eq!(b.asm.current_cfa_offset(), frame_size + out_args);

    match ret {
        'B' => b.asm.sign_extend(b.return_reg, 1),
        'S' => b.asm.sign_extend(b.return_reg, 2),
        'Z' => b.asm.zero_extend(b.return_reg, 1),
        'C' => b.asm.zero_extend(b.return_reg, 2),
        _ => {}
    }

    if kind == JniKind::Normal {
        let entry = b.asm.create_label();
        let resume = b.asm.create_label();
        b.asm.try_to_transition_from_native_to_runnable(entry, &abi.callee_save_scratch, b.return_reg);
        b.asm.bind(resume);
        slow_paths.push(SlowPath::MethodEnd { entry, resume });
    }

    if ret == 'L' {
        let entry = b.asm.create_label();
        let resume = b.asm.create_label();
        b.asm.decode_jni_transition_or_local_jobject(b.return_reg, entry, resume);
        b.asm.bind(resume);
        slow_paths.push(SlowPath::DecodeReference { entry, resume });
    }

    if kind == JniKind::Fast {
        let entry = b.asm.create_label();
        let resume = b.asm.create_label();
        b.asm.suspend_check(entry);
        b.asm.bind(resume);
        slow_paths.push(SlowPath::SuspendCheck { entry, resume });
    }

    b.asm.decrease_frame_size(out_args);
    if !critical {
        let entry = b.asm.create_label();
        b.asm.exception_poll(entry);
        slow_paths.push(SlowPath::Exception { entry });
    }
    b.asm.remove_frame(frame_size, &abi.callee_save_registers, !critical);

    // Every slow path but the exception one resumes before the outgoing
    // area is released.
    for path in slow_paths {
        b.emit_slow_path(path);
    }

    b.asm.finalize_code();
    let mut code = vec![0; b.asm.code_size()];
    b.asm.copy_instructions(&mut code);
    debug!(%isa, shorty, ?kind, size = code.len(), "compiled JNI stub");
    Ok(CompiledStub {
        isa,
        shorty: shorty.to_string(),
        kind,
        is_static: options.is_static,
        frame_size,
        out_args_size: out_args,
        code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(isa: InstructionSet, shorty: &str, kind: JniKind, is_static: bool) -> CompiledStub {
        compile_jni_stub(
            isa,
            &InstructionSetFeatures::default(),
            shorty,
            StubOptions { kind, is_static, tag_sp: true },
        )
        .unwrap()
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    fn gs_call(ep: QuickEntrypoint) -> Vec<u8> {
        let offs = ThreadOffset::quick_entrypoint(InstructionSet::X86_64.pointer_size(), ep);
        let mut call = vec![0x65, 0xFF, 0x14, 0x25];
        call.extend_from_slice(&(offs.value() as u32).to_le_bytes());
        call
    }

    #[test]
    fn test_x86_64_normal_stub_calls_expected_entrypoints() {
        let stub = compile(InstructionSet::X86_64, "LIL", JniKind::Normal, true);
        assert_eq!(stub.frame_size, 112);
        for ep in [
            QuickEntrypoint::ReadBarrierJni,
            QuickEntrypoint::JniMethodStart,
            QuickEntrypoint::JniMethodEnd,
            QuickEntrypoint::JniDecodeReferenceResult,
            QuickEntrypoint::DeliverException,
        ] {
            assert!(contains(&stub.code, &gs_call(ep)), "missing call to {}", ep);
        }
        assert!(!contains(&stub.code, &gs_call(QuickEntrypoint::TestSuspend)));
        // Frame removal ends in `ret` before the slow paths.
        assert!(stub.code.contains(&0xC3));
    }

    #[test]
    fn test_x86_64_fast_native_polls_suspend_instead_of_transitions() {
        let stub = compile(InstructionSet::X86_64, "VI", JniKind::Fast, false);
        assert!(contains(&stub.code, &gs_call(QuickEntrypoint::TestSuspend)));
        assert!(!contains(&stub.code, &gs_call(QuickEntrypoint::JniMethodStart)));
        assert!(!contains(&stub.code, &gs_call(QuickEntrypoint::ReadBarrierJni)));
    }

    #[test]
    fn test_critical_native_has_no_runtime_calls() {
        let stub = compile(InstructionSet::X86_64, "IIJ", JniKind::Critical, true);
        for ep in QuickEntrypoint::ALL {
            assert!(!contains(&stub.code, &gs_call(*ep)), "unexpected call to {}", ep);
        }
        // call [rax + 8]
        assert!(contains(&stub.code, &[0xFF, 0x50, 0x08]));
    }

    #[test]
    fn test_arm64_stubs_compile_for_every_kind() {
        for (shorty, kind, is_static) in [
            ("LLIJFD", JniKind::Normal, false),
            ("DLIIIIIIIIII", JniKind::Normal, true),
            ("ZB", JniKind::Fast, true),
            ("JIIIIIIIIIJ", JniKind::Critical, true),
        ] {
            let stub = compile(InstructionSet::Arm64, shorty, kind, is_static);
            assert_eq!(stub.code.len() % 4, 0);
            assert_eq!(stub.frame_size, 176);
            // ret
            let words: Vec<u32> = stub
                .code
                .chunks(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            assert!(words.contains(&0xD65F_03C0), "{} has no ret", shorty);
        }
    }

    #[test]
    fn test_stack_arguments_reserve_out_area() {
        let stub = compile(InstructionSet::X86_64, "VIIIIIIII", JniKind::Normal, true);
        assert_eq!(stub.out_args_size, 32);
    }

    #[test]
    fn test_rejected_signatures() {
        let features = InstructionSetFeatures::default();
        let critical = StubOptions { kind: JniKind::Critical, is_static: true, tag_sp: false };
        assert_eq!(
            compile_jni_stub(InstructionSet::X86_64, &features, "LI", critical).unwrap_err(),
            StubError::CriticalWithReferences
        );
        let instance = StubOptions { is_static: false, ..critical };
        assert_eq!(
            compile_jni_stub(InstructionSet::X86_64, &features, "II", instance).unwrap_err(),
            StubError::CriticalNotStatic
        );
        assert!(matches!(
            compile_jni_stub(InstructionSet::X86_64, &features, "IX", StubOptions::default()),
            Err(StubError::Shorty(ShortyError::InvalidChar('X')))
        ));
        assert_eq!(
            compile_jni_stub(InstructionSet::Riscv64, &features, "V", StubOptions::default()).unwrap_err(),
            StubError::Asm(JniAsmError::UnsupportedInstructionSet(InstructionSet::Riscv64))
        );
    }

    #[test]
    fn test_stub_serializes_code_as_hex() {
        let stub = compile(InstructionSet::X86_64, "V", JniKind::Critical, true);
        let json = serde_json::to_value(&stub).unwrap();
        assert_eq!(json["kind"], "critical");
        let hex = json["code"].as_str().unwrap();
        assert_eq!(hex.len(), stub.code.len() * 2);
    }
}
