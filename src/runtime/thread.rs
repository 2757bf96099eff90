//! Per-thread control block.
//!
//! Generated code reaches this structure through the thread register (`gs`
//! on x86-64, `x19` on ARM64), so the first part of `ManagedThread` has a
//! fixed `#[repr(C)]` layout:
//!
//! - `tls32`: `state_and_flags` at 0, `is_gc_marking` at 4
//! - `tls_ptr`: eight pointer-sized slots starting at 8
//! - the `QuickEntryPoints` table right after them
//!
//! Everything after the entrypoint table is private to the runtime.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::trace;

use crate::isa::{InstructionSet, PointerSize};
use crate::offsets::ThreadOffset;
use crate::runtime::entrypoints::{self, QuickEntryPoints, QuickEntrypoint};
use crate::runtime::indirect_ref::LocalReferenceTable;
use crate::runtime::object::HeapReference;
use crate::runtime::thread_list::ThreadList;

/// Thread ID counter for generating unique IDs.
static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

fn next_thread_id() -> usize {
    NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed)
}

/// The state lives in the top byte of `state_and_flags`.
pub const STATE_SHIFT: u32 = 24;
const FLAGS_MASK: u32 = (1 << STATE_SHIFT) - 1;

/// Bit 1 of a published stack pointer marks a JIT-compiled frame.
pub const JIT_FRAME_TAG: usize = 0x2;
const FRAME_TAG_MASK: usize = 0x3;

const LOCAL_REFERENCE_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Runnable = 0,
    Native = 1,
    Suspended = 2,
    Terminated = 3,
}

impl ThreadState {
    fn from_bits(bits: u32) -> Self {
        match bits >> STATE_SHIFT {
            0 => ThreadState::Runnable,
            1 => ThreadState::Native,
            2 => ThreadState::Suspended,
            _ => ThreadState::Terminated,
        }
    }

    /// The state as it appears in `state_and_flags` with no flags set.
    pub fn state_and_flags_value(self) -> u32 {
        (self as u32) << STATE_SHIFT
    }
}

/// Request flags in the low bits of `state_and_flags`.
pub struct ThreadFlag;

impl ThreadFlag {
    pub const SUSPEND_REQUEST: u32 = 1 << 0;
    pub const CHECKPOINT_REQUEST: u32 = 1 << 1;
    pub const EMPTY_CHECKPOINT_REQUEST: u32 = 1 << 2;
    pub const ACTIVE_SUSPEND_BARRIER: u32 = 1 << 3;
    pub const PENDING_FLIP_FUNCTION: u32 = 1 << 4;

    /// Flags tested by the inline suspend check.
    pub const SUSPEND_OR_CHECKPOINT_REQUEST: u32 =
        Self::SUSPEND_REQUEST | Self::CHECKPOINT_REQUEST | Self::EMPTY_CHECKPOINT_REQUEST;
    const ANY_CHECKPOINT: u32 = Self::CHECKPOINT_REQUEST | Self::EMPTY_CHECKPOINT_REQUEST;
}

#[repr(C)]
struct Tls32 {
    state_and_flags: AtomicU32,
    is_gc_marking: AtomicU32,
}

#[repr(C)]
struct TlsPtr {
    self_ptr: AtomicUsize,
    exception: AtomicUsize,
    top_quick_frame: AtomicUsize,
    jni_env: AtomicUsize,
    suspend_trigger: AtomicUsize,
    held_mutex_mutator_lock: AtomicUsize,
    mutator_lock: AtomicUsize,
    stack_end: AtomicUsize,
}

/// Slot order inside `TlsPtr`.
#[derive(Clone, Copy)]
enum TlsPtrSlot {
    SelfPtr,
    Exception,
    TopQuickFrame,
    JniEnv,
    SuspendTrigger,
    HeldMutexMutatorLock,
    MutatorLock,
    StackEnd,
}

const TLS32_SIZE: usize = 8;
const TLS_PTR_SLOTS: usize = 8;

/// A managed stack pointer published at a native transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuickFrame {
    pub sp: usize,
    /// Set when the frame belongs to JIT-compiled code.
    pub is_jit: bool,
}

/// Deferred work run by a thread at its next suspend point.
pub type Checkpoint = Box<dyn FnOnce(&ManagedThread) + Send>;

/// JNI environment handed to native code as `JNIEnv*`.
pub struct JniEnv {
    thread: AtomicUsize,
    pub locals: LocalReferenceTable,
}

impl JniEnv {
    pub fn thread_address(&self) -> usize {
        self.thread.load(Ordering::Relaxed)
    }
}

#[repr(C)]
pub struct ManagedThread {
    tls32: Tls32,
    tls_ptr: TlsPtr,
    entrypoints: QuickEntryPoints,
    id: usize,
    name: String,
    isa: InstructionSet,
    jni_env: Box<JniEnv>,
    checkpoints: Mutex<Vec<Checkpoint>>,
    /// Outstanding suspend requests; `SUSPEND_REQUEST` is set while nonzero.
    /// Only changed under the thread list lock.
    suspend_count: AtomicU32,
    list: Weak<ThreadList>,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<ManagedThread>>> = const { RefCell::new(None) };
    // Raw copy for signal handlers, which must not touch the RefCell.
    static CURRENT_PTR: Cell<*const ManagedThread> = const { Cell::new(std::ptr::null()) };
}

impl ManagedThread {
    /// Create a detached thread record in the `Native` state.
    pub(crate) fn new(name: &str, isa: InstructionSet, list: Weak<ThreadList>) -> Arc<Self> {
        let thread = Arc::new(Self {
            tls32: Tls32 {
                state_and_flags: AtomicU32::new(ThreadState::Native.state_and_flags_value()),
                is_gc_marking: AtomicU32::new(0),
            },
            tls_ptr: TlsPtr {
                self_ptr: AtomicUsize::new(0),
                exception: AtomicUsize::new(0),
                top_quick_frame: AtomicUsize::new(0),
                jni_env: AtomicUsize::new(0),
                suspend_trigger: AtomicUsize::new(0),
                held_mutex_mutator_lock: AtomicUsize::new(0),
                mutator_lock: AtomicUsize::new(crate::runtime::thread_list::mutator_lock_address()),
                stack_end: AtomicUsize::new(0),
            },
            entrypoints: QuickEntryPoints::new(isa),
            id: next_thread_id(),
            name: name.to_string(),
            isa,
            jni_env: Box::new(JniEnv {
                thread: AtomicUsize::new(0),
                locals: LocalReferenceTable::new(LOCAL_REFERENCE_CAPACITY),
            }),
            checkpoints: Mutex::new(Vec::new()),
            suspend_count: AtomicU32::new(0),
            list,
        });
        let addr = Arc::as_ptr(&thread) as usize;
        thread.tls_ptr.self_ptr.store(addr, Ordering::Relaxed);
        thread.jni_env.thread.store(addr, Ordering::Relaxed);
        thread
            .tls_ptr
            .jni_env
            .store(&*thread.jni_env as *const JniEnv as usize, Ordering::Relaxed);
        thread.remove_suspend_trigger();
        if let Some((low, _high)) = current_stack_bounds() {
            thread
                .tls_ptr
                .stack_end
                .store(low + isa.stack_overflow_reserved_bytes(), Ordering::Relaxed);
        }
        thread
    }

    // ---- Layout ----

    pub fn thread_flags_offset(_pointer_size: PointerSize) -> ThreadOffset {
        ThreadOffset(0)
    }

    pub fn is_gc_marking_offset(_pointer_size: PointerSize) -> ThreadOffset {
        ThreadOffset(4)
    }

    fn tls_ptr_offset(pointer_size: PointerSize, slot: TlsPtrSlot) -> ThreadOffset {
        ThreadOffset(TLS32_SIZE + slot as usize * pointer_size.bytes())
    }

    pub fn self_offset(ps: PointerSize) -> ThreadOffset {
        Self::tls_ptr_offset(ps, TlsPtrSlot::SelfPtr)
    }

    pub fn exception_offset(ps: PointerSize) -> ThreadOffset {
        Self::tls_ptr_offset(ps, TlsPtrSlot::Exception)
    }

    pub fn top_of_managed_stack_offset(ps: PointerSize) -> ThreadOffset {
        Self::tls_ptr_offset(ps, TlsPtrSlot::TopQuickFrame)
    }

    pub fn jni_env_offset(ps: PointerSize) -> ThreadOffset {
        Self::tls_ptr_offset(ps, TlsPtrSlot::JniEnv)
    }

    pub fn suspend_trigger_offset(ps: PointerSize) -> ThreadOffset {
        Self::tls_ptr_offset(ps, TlsPtrSlot::SuspendTrigger)
    }

    pub fn held_mutex_mutator_lock_offset(ps: PointerSize) -> ThreadOffset {
        Self::tls_ptr_offset(ps, TlsPtrSlot::HeldMutexMutatorLock)
    }

    pub fn mutator_lock_offset(ps: PointerSize) -> ThreadOffset {
        Self::tls_ptr_offset(ps, TlsPtrSlot::MutatorLock)
    }

    pub fn stack_end_offset(ps: PointerSize) -> ThreadOffset {
        Self::tls_ptr_offset(ps, TlsPtrSlot::StackEnd)
    }

    pub fn quick_entrypoints_offset(ps: PointerSize) -> ThreadOffset {
        ThreadOffset(TLS32_SIZE + TLS_PTR_SLOTS * ps.bytes())
    }

    // ---- Identity ----

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instruction_set(&self) -> InstructionSet {
        self.isa
    }

    /// Address generated code uses as the thread register value.
    pub fn address(&self) -> usize {
        self as *const ManagedThread as usize
    }

    pub fn entrypoints(&self) -> &QuickEntryPoints {
        &self.entrypoints
    }

    /// Current value of an entrypoint slot in this thread's table.
    pub fn entrypoint(&self, ep: QuickEntrypoint) -> usize {
        self.entrypoints.get(ep)
    }

    pub fn jni_env(&self) -> &JniEnv {
        &self.jni_env
    }

    pub fn current() -> Option<Arc<ManagedThread>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// The current thread without touching reference counts.
    ///
    /// Safe to call from a signal handler.
    pub fn current_ptr() -> *const ManagedThread {
        CURRENT_PTR.try_with(|c| c.get()).unwrap_or(std::ptr::null())
    }

    pub(crate) fn set_current(thread: Option<Arc<ManagedThread>>) {
        let ptr = thread.as_ref().map_or(std::ptr::null(), Arc::as_ptr);
        CURRENT_PTR.with(|c| c.set(ptr));
        CURRENT.with(|c| *c.borrow_mut() = thread);
    }

    // ---- State ----

    pub fn state_and_flags(&self) -> u32 {
        self.tls32.state_and_flags.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_bits(self.state_and_flags())
    }

    pub fn flags(&self) -> u32 {
        self.state_and_flags() & FLAGS_MASK
    }

    pub fn is_suspended_or_native(&self) -> bool {
        matches!(
            self.state(),
            ThreadState::Native | ThreadState::Suspended | ThreadState::Terminated
        )
    }

    pub fn is_gc_marking(&self) -> bool {
        self.tls32.is_gc_marking.load(Ordering::Acquire) != 0
    }

    pub(crate) fn set_is_gc_marking(&self, marking: bool) {
        self.tls32
            .is_gc_marking
            .store(marking as u32, Ordering::Release);
    }

    pub fn stack_end(&self) -> usize {
        self.tls_ptr.stack_end.load(Ordering::Relaxed)
    }

    pub fn set_stack_end(&self, stack_end: usize) {
        self.tls_ptr.stack_end.store(stack_end, Ordering::Relaxed);
    }

    pub fn held_mutator_lock(&self) -> bool {
        self.tls_ptr.held_mutex_mutator_lock.load(Ordering::Relaxed) != 0
    }

    // ---- Exceptions ----

    pub fn exception(&self) -> HeapReference {
        HeapReference(self.tls_ptr.exception.load(Ordering::Acquire) as u32)
    }

    pub fn set_exception(&self, exception: HeapReference) {
        self.tls_ptr
            .exception
            .store(exception.0 as usize, Ordering::Release);
    }

    pub fn clear_exception(&self) {
        self.tls_ptr.exception.store(0, Ordering::Release);
    }

    pub fn is_exception_pending(&self) -> bool {
        !self.exception().is_null()
    }

    // ---- Managed stack ----

    pub fn set_top_quick_frame(&self, sp: usize, tag_jit: bool) {
        let value = if tag_jit { sp | JIT_FRAME_TAG } else { sp };
        self.tls_ptr.top_quick_frame.store(value, Ordering::Release);
    }

    /// Decode the published stack pointer.
    pub fn top_quick_frame(&self) -> Option<QuickFrame> {
        let raw = self.tls_ptr.top_quick_frame.load(Ordering::Acquire);
        (raw != 0).then_some(QuickFrame {
            sp: raw & !FRAME_TAG_MASK,
            is_jit: raw & JIT_FRAME_TAG != 0,
        })
    }

    // ---- Implicit suspend checks ----

    pub fn suspend_trigger(&self) -> usize {
        self.tls_ptr.suspend_trigger.load(Ordering::Relaxed)
    }

    /// Make the next implicit suspend check fault.
    pub fn trigger_suspend(&self) {
        self.tls_ptr.suspend_trigger.store(0, Ordering::Release);
    }

    /// Restore the trigger to a readable address (itself).
    pub fn remove_suspend_trigger(&self) {
        let addr = &self.tls_ptr.suspend_trigger as *const AtomicUsize as usize;
        self.tls_ptr.suspend_trigger.store(addr, Ordering::Release);
    }

    // ---- Transitions ----

    fn set_state(&self, state: ThreadState) {
        let _ = self
            .tls32
            .state_and_flags
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |old| {
                Some((old & FLAGS_MASK) | state.state_and_flags_value())
            });
    }

    /// Publish `sp` and leave managed code.
    pub fn transition_from_runnable_to_native(&self, sp: usize, tag_jit: bool) {
        self.set_top_quick_frame(sp, tag_jit);
        self.transition_to_native();
    }

    /// Slow path of the inline Runnable -> Native CAS. The stack pointer has
    /// already been published by the caller.
    pub(crate) fn transition_to_native(&self) {
        loop {
            let old = self.tls32.state_and_flags.load(Ordering::Relaxed);
            assert_eq!(
                ThreadState::from_bits(old),
                ThreadState::Runnable,
                "thread {} must be Runnable to enter native code",
                self.id
            );
            if old & ThreadFlag::SUSPEND_OR_CHECKPOINT_REQUEST != 0 {
                self.check_suspend();
                continue;
            }
            let new = (old & FLAGS_MASK) | ThreadState::Native.state_and_flags_value();
            if self
                .tls32
                .state_and_flags
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        self.tls_ptr
            .held_mutex_mutator_lock
            .store(0, Ordering::Release);
        self.notify_state_change();
    }

    /// Return to managed code. Blocks while a suspend request is pending.
    pub fn transition_from_native_to_runnable(&self) {
        loop {
            let old = self.tls32.state_and_flags.load(Ordering::Acquire);
            assert_eq!(
                ThreadState::from_bits(old),
                ThreadState::Native,
                "thread {} must be Native to return to managed code",
                self.id
            );
            if old & ThreadFlag::SUSPEND_REQUEST != 0 {
                self.wait_for_resume();
                continue;
            }
            if old & ThreadFlag::ANY_CHECKPOINT != 0 {
                self.run_checkpoints();
                continue;
            }
            let new = old & FLAGS_MASK;
            if self
                .tls32
                .state_and_flags
                .compare_exchange_weak(old, new, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        let lock = self.tls_ptr.mutator_lock.load(Ordering::Relaxed);
        self.tls_ptr
            .held_mutex_mutator_lock
            .store(lock, Ordering::Release);
    }

    /// Honour pending checkpoint and suspend requests from `Runnable`.
    pub fn check_suspend(&self) {
        loop {
            let flags = self.flags();
            if flags & ThreadFlag::ANY_CHECKPOINT != 0 {
                self.run_checkpoints();
            } else if flags & ThreadFlag::SUSPEND_REQUEST != 0 {
                self.suspend_self();
            } else {
                break;
            }
        }
    }

    fn suspend_self(&self) {
        trace!(thread = self.id, "suspending at suspend point");
        self.set_state(ThreadState::Suspended);
        self.tls_ptr
            .held_mutex_mutator_lock
            .store(0, Ordering::Release);
        self.notify_state_change();
        self.wait_for_resume();
        self.set_state(ThreadState::Runnable);
        let lock = self.tls_ptr.mutator_lock.load(Ordering::Relaxed);
        self.tls_ptr
            .held_mutex_mutator_lock
            .store(lock, Ordering::Release);
    }

    fn wait_for_resume(&self) {
        match self.list.upgrade() {
            Some(list) => list.wait_while_suspend_requested(self),
            None => {
                while self.flags() & ThreadFlag::SUSPEND_REQUEST != 0 {
                    std::thread::yield_now();
                }
            }
        }
    }

    fn notify_state_change(&self) {
        if let Some(list) = self.list.upgrade() {
            list.notify_state_change();
        }
    }

    fn run_checkpoints(&self) {
        let work = {
            let mut pending = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
            self.tls32
                .state_and_flags
                .fetch_and(!ThreadFlag::ANY_CHECKPOINT, Ordering::AcqRel);
            std::mem::take(&mut *pending)
        };
        for checkpoint in work {
            checkpoint(self);
        }
    }

    /// Queue `checkpoint` to run at this thread's next suspend point.
    pub fn request_checkpoint(&self, checkpoint: Checkpoint) {
        let mut pending = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        pending.push(checkpoint);
        self.tls32
            .state_and_flags
            .fetch_or(ThreadFlag::CHECKPOINT_REQUEST, Ordering::AcqRel);
    }

    pub(crate) fn suspend_count(&self) -> u32 {
        self.suspend_count.load(Ordering::Acquire)
    }

    /// Add `delta` suspend requests.
    pub(crate) fn increment_suspend_count(&self, delta: u32) {
        if delta == 0 {
            return;
        }
        self.suspend_count.fetch_add(delta, Ordering::AcqRel);
        self.tls32
            .state_and_flags
            .fetch_or(ThreadFlag::SUSPEND_REQUEST, Ordering::AcqRel);
    }

    /// Drop one suspend request; the flag clears with the last one.
    pub(crate) fn decrement_suspend_count(&self) {
        let previous = self.suspend_count.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "thread {} has no suspend request to remove", self.id);
        if previous == 1 {
            self.tls32
                .state_and_flags
                .fetch_and(!ThreadFlag::SUSPEND_REQUEST, Ordering::AcqRel);
        }
    }

    pub(crate) fn mark_terminated(&self) {
        self.set_state(ThreadState::Terminated);
        self.notify_state_change();
    }
}

impl ThreadOffset {
    /// Thread-relative offset of an entrypoint slot.
    pub fn quick_entrypoint(pointer_size: PointerSize, ep: QuickEntrypoint) -> ThreadOffset {
        ThreadOffset(
            ManagedThread::quick_entrypoints_offset(pointer_size).value()
                + ep.offset(pointer_size).value(),
        )
    }

    /// Thread-relative offset of the read-barrier mark slot for `reg`.
    pub fn read_barrier_mark_entrypoint(pointer_size: PointerSize, reg: usize) -> ThreadOffset {
        ThreadOffset(
            ManagedThread::quick_entrypoints_offset(pointer_size).value()
                + entrypoints::read_barrier_mark_offset(pointer_size, reg).value(),
        )
    }
}

/// Low and high address of the calling thread's stack.
#[cfg(target_os = "linux")]
fn current_stack_bounds() -> Option<(usize, usize)> {
    // SAFETY: the attribute object is initialized by pthread_getattr_np and
    // destroyed before returning.
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        (rc == 0).then(|| (addr as usize, addr as usize + size))
    }
}

#[cfg(not(target_os = "linux"))]
fn current_stack_bounds() -> Option<(usize, usize)> {
    None
}
