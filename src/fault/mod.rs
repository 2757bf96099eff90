//! Fault-based recovery for implicit checks in generated code.
//!
//! Compiled code leaves out explicit branches for null checks, stack
//! overflow checks and (optionally) suspend checks and lets the hardware
//! trap instead. The handlers here recognize those traps from the faulting
//! context and rewrite it to continue in the matching runtime entrypoint.
//! Everything else is left alone so the default crash path runs.
//!
//! Handlers run in signal context: they neither allocate nor log, and they
//! only see the trap frame through [`FaultContext`].

pub mod arm64;
#[cfg(all(
    feature = "signals",
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
pub mod signal;
pub mod x86;

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::RwLock;

use serde::Serialize;
use tracing::debug;

use crate::isa::InstructionSet;
use crate::runtime::entrypoints::QuickEntrypoint;
use crate::runtime::thread::{ManagedThread, ThreadState};

/// Faults at or above this address are not null dereferences.
pub const MAX_NULL_FAULT_ADDRESS: usize = 4096;

/// How far the compiler may hoist the trigger load above its `test`.
pub const SUSPEND_CHECK_WINDOW: usize = 100;

/// View of a trapped thread's register state.
pub trait FaultContext {
    fn pc(&self) -> usize;
    fn sp(&self) -> usize;
    fn fault_address(&self) -> usize;
    /// Pointer-sized word at `addr`, if readable.
    fn read_word(&self, addr: usize) -> Option<usize>;
    /// Copy code bytes starting at `addr` into `buf`; returns the count copied.
    fn read_code(&self, addr: usize, buf: &mut [u8]) -> usize;
    /// Push a word onto the trapped stack.
    fn push(&mut self, value: usize);
    fn set_link_register(&mut self, value: usize);
    /// Set native argument register `index`.
    fn set_argument(&mut self, index: usize, value: usize);
    /// Resume at `pc` when the handler returns.
    fn redirect(&mut self, pc: usize);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    NullPointer,
    SuspendCheck,
    StackOverflow,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FaultKind::NullPointer => "null pointer",
            FaultKind::SuspendCheck => "suspend check",
            FaultKind::StackOverflow => "stack overflow",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    Handled(FaultKind),
    NotHandled,
}

/// Generated code belonging to one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRange {
    pub start: usize,
    pub end: usize,
    /// Address of the `Method` the code was compiled for.
    pub method: usize,
}

impl CodeRange {
    pub fn contains(&self, pc: usize) -> bool {
        (self.start..self.end).contains(&pc)
    }
}

/// What a handler knows besides the trap frame.
pub struct FaultEnv<'a> {
    pub isa: InstructionSet,
    pub thread: &'a ManagedThread,
    /// The code range containing the faulting PC.
    pub code: CodeRange,
}

impl FaultEnv<'_> {
    fn entrypoint(&self, ep: QuickEntrypoint) -> Option<usize> {
        let target = self.thread.entrypoint(ep);
        (target != 0).then_some(target)
    }
}

pub trait FaultHandler: Send + Sync {
    fn kind(&self) -> FaultKind;
    /// Rewrite `ctx` and return true if the fault is recognized.
    fn action(&self, ctx: &mut dyn FaultContext, env: &FaultEnv<'_>) -> bool;
}

/// Implicit null checks: a load or store through a null base register.
pub struct NullPointerHandler;

impl FaultHandler for NullPointerHandler {
    fn kind(&self) -> FaultKind {
        FaultKind::NullPointer
    }

    fn action(&self, ctx: &mut dyn FaultContext, env: &FaultEnv<'_>) -> bool {
        let fault_address = ctx.fault_address();
        if fault_address >= MAX_NULL_FAULT_ADDRESS {
            return false;
        }
        // Inside compiled code [sp] holds the method of the current frame.
        if ctx.read_word(ctx.sp()) != Some(env.code.method) {
            return false;
        }
        let Some(target) = env.entrypoint(QuickEntrypoint::ThrowNullPointerFromSignal) else {
            return false;
        };
        let pc = ctx.pc();
        match env.isa {
            InstructionSet::X86 | InstructionSet::X86_64 => {
                let mut buf = [0u8; 16];
                let len = (env.code.end - pc).min(buf.len());
                let len = ctx.read_code(pc, &mut buf[..len]);
                let size = x86::instruction_size(&buf[..len], env.isa.is_64bit());
                if size == 0 {
                    return false;
                }
                ctx.push(pc + size);
                ctx.push(fault_address);
            }
            InstructionSet::Arm64 => {
                ctx.set_link_register(pc + arm64::INSTRUCTION_SIZE);
                ctx.set_argument(0, fault_address);
            }
            InstructionSet::Arm | InstructionSet::Riscv64 => return false,
        }
        ctx.redirect(target);
        true
    }
}

/// Implicit suspend checks: a load through the thread's suspend trigger,
/// which faults once another thread has nulled it.
pub struct SuspensionHandler;

impl SuspensionHandler {
    /// The trigger load on x86 (`mov eax, fs:[t]`) or x86-64
    /// (`movq rax, gs:[t]`), and its length.
    fn trigger_load(isa: InstructionSet) -> ([u8; 9], usize) {
        let offset = ManagedThread::suspend_trigger_offset(isa.pointer_size()).value() as u32;
        let le = offset.to_le_bytes();
        if isa.is_64bit() {
            ([0x65, 0x48, 0x8B, 0x04, 0x25, le[0], le[1], le[2], le[3]], 9)
        } else {
            ([0x64, 0x8B, 0x05, le[0], le[1], le[2], le[3], 0, 0], 7)
        }
    }

    fn x86_action(ctx: &mut dyn FaultContext, env: &FaultEnv<'_>, target: usize) -> bool {
        let pc = ctx.pc();
        let mut test = [0u8; 2];
        // test eax, [eax]
        if ctx.read_code(pc, &mut test) != 2 || test != [0x85, 0x00] {
            return false;
        }
        let start = pc.saturating_sub(SUSPEND_CHECK_WINDOW).max(env.code.start);
        let mut window = [0u8; SUSPEND_CHECK_WINDOW];
        let len = ctx.read_code(start, &mut window[..pc - start]);
        let (pattern, pattern_len) = Self::trigger_load(env.isa);
        let pattern = &pattern[..pattern_len];
        if !window[..len].windows(pattern_len).any(|w| w == pattern) {
            return false;
        }
        ctx.push(pc + 2);
        ctx.redirect(target);
        true
    }
}

impl FaultHandler for SuspensionHandler {
    fn kind(&self) -> FaultKind {
        FaultKind::SuspendCheck
    }

    fn action(&self, ctx: &mut dyn FaultContext, env: &FaultEnv<'_>) -> bool {
        let Some(target) = env.entrypoint(QuickEntrypoint::TestSuspend) else {
            return false;
        };
        let handled = match env.isa {
            InstructionSet::X86 | InstructionSet::X86_64 => Self::x86_action(ctx, env, target),
            InstructionSet::Arm64 => {
                let pc = ctx.pc();
                let mut word = [0u8; 4];
                let matched = ctx.read_code(pc, &mut word) == 4
                    && arm64::is_suspend_check(u32::from_le_bytes(word));
                if matched {
                    ctx.set_link_register(pc + arm64::INSTRUCTION_SIZE);
                    ctx.redirect(target);
                }
                matched
            }
            InstructionSet::Arm | InstructionSet::Riscv64 => false,
        };
        if handled {
            env.thread.remove_suspend_trigger();
        }
        handled
    }
}

/// Implicit stack overflow checks: a probe of the guard region below the
/// stack pointer, emitted before the method builds its frame.
pub struct StackOverflowHandler;

impl FaultHandler for StackOverflowHandler {
    fn kind(&self) -> FaultKind {
        FaultKind::StackOverflow
    }

    fn action(&self, ctx: &mut dyn FaultContext, env: &FaultEnv<'_>) -> bool {
        let expected = ctx.sp().wrapping_sub(env.isa.stack_overflow_reserved_bytes());
        if ctx.fault_address() != expected {
            return false;
        }
        let Some(target) = env.entrypoint(QuickEntrypoint::ThrowStackOverflow) else {
            return false;
        };
        // The caller's frame is reused, so the stack is left as it is.
        ctx.redirect(target);
        true
    }
}

/// Which implicit checks compiled code relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImplicitChecks {
    pub null: bool,
    pub suspend: bool,
    pub stack_overflow: bool,
}

impl Default for ImplicitChecks {
    fn default() -> Self {
        Self { null: true, suspend: false, stack_overflow: true }
    }
}

/// Generated-code ranges plus the handlers to try on a fault inside them.
pub struct FaultManager {
    isa: InstructionSet,
    ranges: RwLock<Vec<CodeRange>>,
    handlers: Vec<Box<dyn FaultHandler>>,
}

impl FaultManager {
    pub fn new(isa: InstructionSet, checks: ImplicitChecks) -> Self {
        let mut handlers: Vec<Box<dyn FaultHandler>> = Vec::new();
        if checks.suspend {
            handlers.push(Box::new(SuspensionHandler));
        }
        if checks.stack_overflow {
            handlers.push(Box::new(StackOverflowHandler));
        }
        if checks.null {
            handlers.push(Box::new(NullPointerHandler));
        }
        Self {
            isa,
            ranges: RwLock::new(Vec::new()),
            handlers,
        }
    }

    pub fn instruction_set(&self) -> InstructionSet {
        self.isa
    }

    pub fn add_handler(&mut self, handler: Box<dyn FaultHandler>) {
        self.handlers.push(handler);
    }

    pub fn handler_kinds(&self) -> Vec<FaultKind> {
        self.handlers.iter().map(|h| h.kind()).collect()
    }

    pub fn register_code(&self, code: Range<usize>, method: usize) {
        debug!(start = code.start, end = code.end, method, "registered generated code");
        let mut ranges = self.ranges.write().unwrap_or_else(|e| e.into_inner());
        ranges.push(CodeRange { start: code.start, end: code.end, method });
    }

    /// Forget the range starting at `start`. Returns whether it was known.
    pub fn unregister_code(&self, start: usize) -> bool {
        let mut ranges = self.ranges.write().unwrap_or_else(|e| e.into_inner());
        let before = ranges.len();
        ranges.retain(|r| r.start != start);
        ranges.len() != before
    }

    /// The range containing `pc`. A writer holding the lock means the range
    /// set is changing; the fault is then treated as foreign.
    fn find_code(&self, pc: usize) -> Option<CodeRange> {
        let ranges = self.ranges.try_read().ok()?;
        ranges.iter().find(|r| r.contains(pc)).copied()
    }

    pub fn is_in_generated_code(&self, pc: usize) -> bool {
        self.find_code(pc).is_some()
    }

    /// Run the handlers for a fault taken by `thread`.
    ///
    /// Only a `Runnable` thread can be executing generated code, so any
    /// other state (or no thread at all) is not handled.
    pub fn handle_fault(
        &self,
        ctx: &mut dyn FaultContext,
        thread: Option<&ManagedThread>,
    ) -> FaultOutcome {
        let Some(thread) = thread else {
            return FaultOutcome::NotHandled;
        };
        if thread.state() != ThreadState::Runnable || ctx.sp() == 0 {
            return FaultOutcome::NotHandled;
        }
        let Some(code) = self.find_code(ctx.pc()) else {
            return FaultOutcome::NotHandled;
        };
        let env = FaultEnv { isa: self.isa, thread, code };
        for handler in &self.handlers {
            if handler.action(ctx, &env) {
                return FaultOutcome::Handled(handler.kind());
            }
        }
        FaultOutcome::NotHandled
    }
}

/// An in-memory trap frame, for driving the handlers without a signal.
#[derive(Debug, Clone)]
pub struct SyntheticContext {
    pub pc: usize,
    pub sp: usize,
    pub fault_address: usize,
    pub link_register: usize,
    pub arguments: [usize; 8],
    word_size: usize,
    code_base: usize,
    code: Vec<u8>,
    stack: BTreeMap<usize, usize>,
}

impl SyntheticContext {
    pub fn new(isa: InstructionSet) -> Self {
        Self {
            pc: 0,
            sp: 0,
            fault_address: 0,
            link_register: 0,
            arguments: [0; 8],
            word_size: isa.pointer_size().bytes(),
            code_base: 0,
            code: Vec::new(),
            stack: BTreeMap::new(),
        }
    }

    /// Place `code` at `base`.
    pub fn with_code(mut self, base: usize, code: Vec<u8>) -> Self {
        self.code_base = base;
        self.code = code;
        self
    }

    pub fn write_word(&mut self, addr: usize, value: usize) {
        self.stack.insert(addr, value);
    }
}

impl FaultContext for SyntheticContext {
    fn pc(&self) -> usize {
        self.pc
    }

    fn sp(&self) -> usize {
        self.sp
    }

    fn fault_address(&self) -> usize {
        self.fault_address
    }

    fn read_word(&self, addr: usize) -> Option<usize> {
        self.stack.get(&addr).copied()
    }

    fn read_code(&self, addr: usize, buf: &mut [u8]) -> usize {
        let Some(start) = addr.checked_sub(self.code_base) else {
            return 0;
        };
        let available = self.code.get(start..).unwrap_or(&[]);
        let len = buf.len().min(available.len());
        buf[..len].copy_from_slice(&available[..len]);
        len
    }

    fn push(&mut self, value: usize) {
        self.sp -= self.word_size;
        self.stack.insert(self.sp, value);
    }

    fn set_link_register(&mut self, value: usize) {
        self.link_register = value;
    }

    fn set_argument(&mut self, index: usize, value: usize) {
        self.arguments[index] = value;
    }

    fn redirect(&mut self, pc: usize) {
        self.pc = pc;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::thread_list::ThreadList;

    const CODE: usize = 0x1000;
    const METHOD: usize = 0xABC0;
    const SP: usize = 0x7000_0000;

    /// Run `f` on a fresh thread attached as `Runnable`.
    fn on_runnable_thread<R: Send>(
        isa: InstructionSet,
        f: impl FnOnce(&ManagedThread) -> R + Send,
    ) -> R {
        let list = ThreadList::new(isa);
        std::thread::scope(|s| {
            s.spawn(|| {
                let thread = list.attach_current("fault-test").unwrap();
                let result = f(&thread);
                list.detach_current().unwrap();
                result
            })
            .join()
            .unwrap()
        })
    }

    fn manager(isa: InstructionSet, code_len: usize) -> FaultManager {
        let checks = ImplicitChecks { null: true, suspend: true, stack_overflow: true };
        let manager = FaultManager::new(isa, checks);
        manager.register_code(CODE..CODE + code_len, METHOD);
        manager
    }

    fn x86_null_fault(code: Vec<u8>, pc: usize) -> SyntheticContext {
        let mut ctx = SyntheticContext::new(InstructionSet::X86_64).with_code(CODE, code);
        ctx.pc = pc;
        ctx.sp = SP;
        ctx.fault_address = 8;
        ctx.write_word(SP, METHOD);
        ctx
    }

    #[test]
    fn test_null_check_resumes_after_faulting_instruction() {
        // mov rax, [rdi + disp32] ; test eax, [eax]
        let code = vec![0x48, 0x8B, 0x87, 0x10, 0, 0, 0, 0x85, 0x00];
        let pc = CODE + 7;
        let manager = manager(InstructionSet::X86_64, code.len());
        let mut ctx = x86_null_fault(code, pc);
        on_runnable_thread(InstructionSet::X86_64, |thread| {
            let outcome = manager.handle_fault(&mut ctx, Some(thread));
            assert_eq!(outcome, FaultOutcome::Handled(FaultKind::NullPointer));
            assert_eq!(ctx.pc, thread.entrypoint(QuickEntrypoint::ThrowNullPointerFromSignal));
        });
        assert_eq!(ctx.sp, SP - 16);
        assert_eq!(ctx.read_word(SP - 16), Some(8));
        assert_eq!(ctx.read_word(SP - 8), Some(pc + 2));
    }

    #[test]
    fn test_null_check_declines_when_instruction_runs_past_method_end() {
        // Only one byte of `test eax, [eax]` is inside the method.
        let code = vec![0x90, 0x85];
        let manager = manager(InstructionSet::X86_64, code.len());
        let mut ctx = x86_null_fault(code, CODE + 1);
        on_runnable_thread(InstructionSet::X86_64, |thread| {
            assert_eq!(manager.handle_fault(&mut ctx, Some(thread)), FaultOutcome::NotHandled);
        });
        assert_eq!(ctx.sp, SP);
    }

    #[test]
    fn test_null_check_needs_low_address_and_known_method() {
        let code = vec![0x85, 0x00];
        let manager = manager(InstructionSet::X86_64, code.len());
        on_runnable_thread(InstructionSet::X86_64, |thread| {
            let mut ctx = x86_null_fault(code.clone(), CODE);
            ctx.fault_address = MAX_NULL_FAULT_ADDRESS;
            assert_eq!(manager.handle_fault(&mut ctx, Some(thread)), FaultOutcome::NotHandled);

            let mut ctx = x86_null_fault(code.clone(), CODE);
            ctx.write_word(SP, METHOD + 8);
            assert_eq!(manager.handle_fault(&mut ctx, Some(thread)), FaultOutcome::NotHandled);
        });
    }

    #[test]
    fn test_faults_outside_generated_code_or_not_runnable_are_ignored() {
        let code = vec![0x85, 0x00];
        let manager = manager(InstructionSet::X86_64, code.len());
        let mut ctx = x86_null_fault(code.clone(), CODE + 0x100);
        on_runnable_thread(InstructionSet::X86_64, |thread| {
            assert_eq!(manager.handle_fault(&mut ctx, Some(thread)), FaultOutcome::NotHandled);
        });
        let mut ctx = x86_null_fault(code, CODE);
        assert_eq!(manager.handle_fault(&mut ctx, None), FaultOutcome::NotHandled);
        assert!(manager.unregister_code(CODE));
        assert!(!manager.is_in_generated_code(CODE));
    }

    #[test]
    fn test_arm64_null_check_sets_link_register() {
        let manager = manager(InstructionSet::Arm64, 16);
        let mut ctx = SyntheticContext::new(InstructionSet::Arm64).with_code(CODE, vec![0; 16]);
        ctx.pc = CODE + 8;
        ctx.sp = SP;
        ctx.fault_address = 0x10;
        ctx.write_word(SP, METHOD);
        on_runnable_thread(InstructionSet::Arm64, |thread| {
            let outcome = manager.handle_fault(&mut ctx, Some(thread));
            assert_eq!(outcome, FaultOutcome::Handled(FaultKind::NullPointer));
        });
        assert_eq!(ctx.link_register, CODE + 12);
        assert_eq!(ctx.arguments[0], 0x10);
        assert_eq!(ctx.sp, SP);
    }

    fn suspend_code(gap: usize) -> Vec<u8> {
        let (load, len) = SuspensionHandler::trigger_load(InstructionSet::X86_64);
        let mut code = load[..len].to_vec();
        code.extend(std::iter::repeat_n(0x90, gap));
        code.extend([0x85, 0x00]);
        code
    }

    #[test]
    fn test_suspend_check_redirects_and_clears_trigger() {
        let code = suspend_code(20);
        let pc = CODE + code.len() - 2;
        let manager = manager(InstructionSet::X86_64, code.len());
        let mut ctx = SyntheticContext::new(InstructionSet::X86_64).with_code(CODE, code);
        ctx.pc = pc;
        ctx.sp = SP;
        on_runnable_thread(InstructionSet::X86_64, |thread| {
            thread.trigger_suspend();
            let outcome = manager.handle_fault(&mut ctx, Some(thread));
            assert_eq!(outcome, FaultOutcome::Handled(FaultKind::SuspendCheck));
            assert_eq!(ctx.pc, thread.entrypoint(QuickEntrypoint::TestSuspend));
            assert_ne!(thread.suspend_trigger(), 0);
        });
        assert_eq!(ctx.read_word(SP - 8), Some(pc + 2));
    }

    #[test]
    fn test_suspend_check_window_is_bounded() {
        // The load starts 101 bytes before the test, one byte outside the window.
        let code = suspend_code(SUSPEND_CHECK_WINDOW - 8);
        let pc = CODE + code.len() - 2;
        let manager = manager(InstructionSet::X86_64, code.len());
        let mut ctx = SyntheticContext::new(InstructionSet::X86_64).with_code(CODE, code);
        ctx.pc = pc;
        ctx.sp = SP;
        on_runnable_thread(InstructionSet::X86_64, |thread| {
            assert_eq!(manager.handle_fault(&mut ctx, Some(thread)), FaultOutcome::NotHandled);
        });
    }

    #[test]
    fn test_stack_overflow_matches_exact_address() {
        let isa = InstructionSet::X86_64;
        let manager = manager(isa, 16);
        on_runnable_thread(isa, |thread| {
            let mut ctx = SyntheticContext::new(isa).with_code(CODE, vec![0; 16]);
            ctx.pc = CODE;
            ctx.sp = SP;
            ctx.fault_address = SP - isa.stack_overflow_reserved_bytes() + 8;
            assert_eq!(manager.handle_fault(&mut ctx, Some(thread)), FaultOutcome::NotHandled);

            ctx.fault_address = SP - isa.stack_overflow_reserved_bytes();
            let outcome = manager.handle_fault(&mut ctx, Some(thread));
            assert_eq!(outcome, FaultOutcome::Handled(FaultKind::StackOverflow));
            assert_eq!(ctx.pc, thread.entrypoint(QuickEntrypoint::ThrowStackOverflow));
            assert_eq!(ctx.sp, SP);
        });
    }

    #[test]
    fn test_handler_order_follows_enabled_checks() {
        let manager = FaultManager::new(InstructionSet::Arm64, ImplicitChecks::default());
        assert_eq!(
            manager.handler_kinds(),
            vec![FaultKind::StackOverflow, FaultKind::NullPointer]
        );
    }
}
