//! SIGSEGV installation on Linux.
//!
//! The handler forwards every fault to the installed [`FaultManager`]. A
//! fault the manager does not recognize is chained to the action that was
//! installed before us, or re-raised with the default action so the process
//! crashes the usual way.

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::info;

use crate::fault::{FaultContext, FaultManager, FaultOutcome};
use crate::runtime::thread::ManagedThread;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("a fault handler is already installed")]
    AlreadyInstalled,
    #[error("no fault handler is installed")]
    NotInstalled,
    #[error("sigaction failed: {0}")]
    Sigaction(#[source] io::Error),
}

/// Installed manager. Never freed once published: a handler on another
/// thread may still be reading it after `uninstall`.
static MANAGER: AtomicPtr<FaultManager> = AtomicPtr::new(ptr::null_mut());

/// SIGSEGV action in place before `install`, written under `INSTALL_LOCK`
/// before the handler can run.
static mut PREVIOUS: libc::sigaction = unsafe { std::mem::zeroed() };

static INSTALL_LOCK: Mutex<()> = Mutex::new(());

pub fn install(manager: Arc<FaultManager>) -> Result<(), SignalError> {
    let _guard = INSTALL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if !MANAGER.load(Ordering::Acquire).is_null() {
        return Err(SignalError::AlreadyInstalled);
    }
    let isa = manager.instruction_set();
    let raw = Arc::into_raw(manager) as *mut FaultManager;
    MANAGER.store(raw, Ordering::Release);

    // SAFETY: the action struct is fully initialized before use and
    // PREVIOUS is only written while holding INSTALL_LOCK.
    let rc = unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_signal as *const () as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGSEGV, &action, ptr::addr_of_mut!(PREVIOUS))
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        MANAGER.store(ptr::null_mut(), Ordering::Release);
        // SAFETY: the handler was never installed, so nothing else saw `raw`.
        drop(unsafe { Arc::from_raw(raw) });
        return Err(SignalError::Sigaction(err));
    }
    info!(%isa, "installed SIGSEGV fault handler");
    Ok(())
}

/// Restore the action that was in place before `install`.
pub fn uninstall() -> Result<(), SignalError> {
    let _guard = INSTALL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if MANAGER.load(Ordering::Acquire).is_null() {
        return Err(SignalError::NotInstalled);
    }
    // SAFETY: PREVIOUS was filled by the matching `install`.
    let rc = unsafe { libc::sigaction(libc::SIGSEGV, ptr::addr_of!(PREVIOUS), ptr::null_mut()) };
    if rc != 0 {
        return Err(SignalError::Sigaction(io::Error::last_os_error()));
    }
    MANAGER.store(ptr::null_mut(), Ordering::Release);
    info!("removed SIGSEGV fault handler");
    Ok(())
}

pub fn is_installed() -> bool {
    !MANAGER.load(Ordering::Acquire).is_null()
}

extern "C" fn handle_signal(sig: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    let manager = MANAGER.load(Ordering::Acquire);
    if !manager.is_null() {
        // SAFETY: published managers are never freed; the thread pointer is
        // either null or the live record of the faulting thread; the kernel
        // hands us a valid siginfo and ucontext.
        let handled = unsafe {
            let thread = ManagedThread::current_ptr().as_ref();
            let mut ctx = UcontextFault::new(info, context);
            matches!((*manager).handle_fault(&mut ctx, thread), FaultOutcome::Handled(_))
        };
        if handled {
            return;
        }
    }
    // SAFETY: forwarding the kernel-provided arguments unchanged.
    unsafe { chain_to_previous(sig, info, context) };
}

unsafe fn chain_to_previous(sig: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    // SAFETY: PREVIOUS is not written while the handler is installed.
    let previous = unsafe { ptr::addr_of!(PREVIOUS).read() };
    if previous.sa_flags & libc::SA_SIGINFO != 0 {
        // SAFETY: SA_SIGINFO means sa_sigaction holds a three-argument handler.
        let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            unsafe { std::mem::transmute(previous.sa_sigaction) };
        handler(sig, info, context);
    } else if previous.sa_sigaction == libc::SIG_DFL {
        // SAFETY: restoring the default action and re-raising is async-signal-safe.
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
            libc::raise(sig);
        }
    } else if previous.sa_sigaction != libc::SIG_IGN {
        // SAFETY: without SA_SIGINFO the slot holds a one-argument handler.
        let handler: extern "C" fn(libc::c_int) = unsafe { std::mem::transmute(previous.sa_sigaction) };
        handler(sig);
    }
}

/// [`FaultContext`] over the kernel's `ucontext_t`.
struct UcontextFault {
    uc: *mut libc::ucontext_t,
    fault_address: usize,
}

impl UcontextFault {
    /// # Safety
    /// `info` and `context` must be the arguments of a running SA_SIGINFO
    /// handler.
    unsafe fn new(info: *mut libc::siginfo_t, context: *mut libc::c_void) -> Self {
        Self {
            uc: context.cast(),
            // SAFETY: guaranteed by the caller.
            fault_address: unsafe { (*info).si_addr() as usize },
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl UcontextFault {
    const ARGUMENT_REGISTERS: [libc::c_int; 6] = [
        libc::REG_RDI,
        libc::REG_RSI,
        libc::REG_RDX,
        libc::REG_RCX,
        libc::REG_R8,
        libc::REG_R9,
    ];

    fn reg(&self, reg: libc::c_int) -> usize {
        // SAFETY: `uc` is valid for the duration of the handler.
        unsafe { (*self.uc).uc_mcontext.gregs[reg as usize] as usize }
    }

    fn set_reg(&mut self, reg: libc::c_int, value: usize) {
        // SAFETY: as in `reg`; the kernel reloads registers from here.
        unsafe { (*self.uc).uc_mcontext.gregs[reg as usize] = value as libc::greg_t };
    }

    fn pc_value(&self) -> usize {
        self.reg(libc::REG_RIP)
    }

    fn sp_value(&self) -> usize {
        self.reg(libc::REG_RSP)
    }

    fn set_pc_value(&mut self, pc: usize) {
        self.set_reg(libc::REG_RIP, pc);
    }

    fn set_sp_value(&mut self, sp: usize) {
        self.set_reg(libc::REG_RSP, sp);
    }

    fn set_lr_value(&mut self, _value: usize) {}

    fn set_argument_value(&mut self, index: usize, value: usize) {
        self.set_reg(Self::ARGUMENT_REGISTERS[index], value);
    }
}

#[cfg(target_arch = "aarch64")]
impl UcontextFault {
    fn pc_value(&self) -> usize {
        // SAFETY: `uc` is valid for the duration of the handler.
        unsafe { (*self.uc).uc_mcontext.pc as usize }
    }

    fn sp_value(&self) -> usize {
        // SAFETY: as above.
        unsafe { (*self.uc).uc_mcontext.sp as usize }
    }

    fn set_pc_value(&mut self, pc: usize) {
        // SAFETY: the kernel reloads registers from the context on return.
        unsafe { (*self.uc).uc_mcontext.pc = pc as u64 };
    }

    fn set_sp_value(&mut self, sp: usize) {
        // SAFETY: as above.
        unsafe { (*self.uc).uc_mcontext.sp = sp as u64 };
    }

    fn set_lr_value(&mut self, value: usize) {
        // SAFETY: as above.
        unsafe { (*self.uc).uc_mcontext.regs[30] = value as u64 };
    }

    fn set_argument_value(&mut self, index: usize, value: usize) {
        assert!(index < 8, "no argument register {}", index);
        // SAFETY: as above.
        unsafe { (*self.uc).uc_mcontext.regs[index] = value as u64 };
    }
}

impl FaultContext for UcontextFault {
    fn pc(&self) -> usize {
        self.pc_value()
    }

    fn sp(&self) -> usize {
        self.sp_value()
    }

    fn fault_address(&self) -> usize {
        self.fault_address
    }

    fn read_word(&self, addr: usize) -> Option<usize> {
        if addr == 0 || addr % std::mem::align_of::<usize>() != 0 {
            return None;
        }
        // SAFETY: only called with the stack pointer of a thread that is
        // running generated code, which is mapped.
        Some(unsafe { ptr::read(addr as *const usize) })
    }

    fn read_code(&self, addr: usize, buf: &mut [u8]) -> usize {
        // SAFETY: callers stay inside a registered code range.
        unsafe { ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len()) };
        buf.len()
    }

    fn push(&mut self, value: usize) {
        let sp = self.sp_value() - std::mem::size_of::<usize>();
        // SAFETY: the slot below SP is inside the thread's stack.
        unsafe { ptr::write(sp as *mut usize, value) };
        self.set_sp_value(sp);
    }

    fn set_link_register(&mut self, value: usize) {
        self.set_lr_value(value);
    }

    fn set_argument(&mut self, index: usize, value: usize) {
        self.set_argument_value(index, value);
    }

    fn redirect(&mut self, pc: usize) {
        self.set_pc_value(pc);
    }
}
