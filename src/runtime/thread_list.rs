//! Registry of attached threads and the suspend-all protocol.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::isa::InstructionSet;
use crate::runtime::entrypoints::{update_read_barrier_entrypoints, MutatorsSuspended};
use crate::runtime::thread::{ManagedThread, ThreadState};

/// Stand-in for the global mutator lock; generated code only stores its
/// address into `held_mutex_mutator_lock`.
static MUTATOR_LOCK: u64 = 0;

pub fn mutator_lock_address() -> usize {
    &MUTATOR_LOCK as *const u64 as usize
}

const WAIT_SLICE: Duration = Duration::from_millis(1);
const SLOW_SUSPEND_WARNING: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ThreadError {
    #[error("the current OS thread is already attached as thread {0}")]
    AlreadyAttached(usize),
    #[error("the current OS thread is not attached")]
    NotAttached,
}

pub struct ThreadList {
    isa: InstructionSet,
    threads: Mutex<Vec<Arc<ManagedThread>>>,
    suspend_all_lock: Mutex<()>,
    suspend_all_count: AtomicUsize,
    state_lock: Mutex<()>,
    state_changed: Condvar,
    /// Marking state handed to newly attached threads.
    gc_marking: AtomicBool,
    implicit_suspend_checks: AtomicBool,
}

impl ThreadList {
    pub fn new(isa: InstructionSet) -> Arc<Self> {
        Arc::new(Self {
            isa,
            threads: Mutex::new(Vec::new()),
            suspend_all_lock: Mutex::new(()),
            suspend_all_count: AtomicUsize::new(0),
            state_lock: Mutex::new(()),
            state_changed: Condvar::new(),
            gc_marking: AtomicBool::new(false),
            implicit_suspend_checks: AtomicBool::new(false),
        })
    }

    pub fn instruction_set(&self) -> InstructionSet {
        self.isa
    }

    /// Also arm each thread's suspend trigger when suspending.
    pub fn set_implicit_suspend_checks(&self, enabled: bool) {
        self.implicit_suspend_checks.store(enabled, Ordering::Relaxed);
    }

    fn lock_threads(&self) -> MutexGuard<'_, Vec<Arc<ManagedThread>>> {
        self.threads.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn threads(&self) -> Vec<Arc<ManagedThread>> {
        self.lock_threads().clone()
    }

    pub fn len(&self) -> usize {
        self.lock_threads().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attach the calling OS thread and make it `Runnable`.
    pub fn attach_current(self: &Arc<Self>, name: &str) -> Result<Arc<ManagedThread>, ThreadError> {
        if let Some(existing) = ManagedThread::current() {
            return Err(ThreadError::AlreadyAttached(existing.id()));
        }
        let thread = ManagedThread::new(name, self.isa, Arc::downgrade(self));
        {
            let mut threads = self.lock_threads();
            if self.gc_marking.load(Ordering::Acquire) {
                thread.set_is_gc_marking(true);
                // Not yet running managed code, so nothing reads its table.
                let token = MutatorsSuspended::for_unpublished_table();
                update_read_barrier_entrypoints(thread.entrypoints(), self.isa, true, &token);
            }
            // One request per suspend-all in progress, released by its guard.
            thread.increment_suspend_count(self.suspend_all_count.load(Ordering::Acquire) as u32);
            threads.push(thread.clone());
        }
        ManagedThread::set_current(Some(thread.clone()));
        thread.transition_from_native_to_runnable();
        debug!(thread = thread.id(), name, "attached thread");
        Ok(thread)
    }

    /// Detach the calling OS thread.
    pub fn detach_current(&self) -> Result<(), ThreadError> {
        let thread = ManagedThread::current().ok_or(ThreadError::NotAttached)?;
        if thread.state() == ThreadState::Runnable {
            let sp = thread.top_quick_frame().map_or(0, |f| f.sp);
            thread.transition_from_runnable_to_native(sp, false);
        }
        thread.mark_terminated();
        self.lock_threads().retain(|t| !Arc::ptr_eq(t, &thread));
        ManagedThread::set_current(None);
        debug!(thread = thread.id(), "detached thread");
        Ok(())
    }

    /// Stop every other thread at a suspend point or in native code.
    pub fn suspend_all(&self, cause: &str) -> SuspendAllGuard<'_> {
        let lock = self.suspend_all_lock.lock().unwrap_or_else(|e| e.into_inner());
        let start = Instant::now();
        let me = ManagedThread::current_ptr();
        let implicit = self.implicit_suspend_checks.load(Ordering::Relaxed);

        let targets: Vec<Arc<ManagedThread>> = {
            let threads = self.lock_threads();
            self.suspend_all_count.fetch_add(1, Ordering::AcqRel);
            let targets: Vec<_> = threads
                .iter()
                .filter(|t| !std::ptr::eq(Arc::as_ptr(t), me))
                .cloned()
                .collect();
            for thread in &targets {
                thread.increment_suspend_count(1);
                if implicit {
                    thread.trigger_suspend();
                }
            }
            targets
        };

        let mut warned = false;
        let mut guard = self.state_lock.lock().unwrap_or_else(|e| e.into_inner());
        while !targets.iter().all(|t| t.is_suspended_or_native()) {
            if !warned && start.elapsed() > SLOW_SUSPEND_WARNING {
                warn!(cause, "suspend all is taking longer than {:?}", SLOW_SUSPEND_WARNING);
                warned = true;
            }
            guard = self
                .state_changed
                .wait_timeout(guard, WAIT_SLICE)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        drop(guard);

        debug!(
            cause,
            threads = targets.len(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "suspended all threads"
        );
        SuspendAllGuard {
            list: self,
            suspender: me as usize,
            targets,
            token: MutatorsSuspended::new(),
            _lock: lock,
        }
    }

    /// Queue `checkpoint` on every attached thread.
    pub fn request_checkpoint_all<F>(&self, checkpoint: F) -> usize
    where
        F: Fn(&ManagedThread) + Send + Sync + Clone + 'static,
    {
        let threads = self.threads();
        for thread in &threads {
            let f = checkpoint.clone();
            thread.request_checkpoint(Box::new(move |t| f(t)));
        }
        threads.len()
    }

    pub(crate) fn set_gc_marking(&self, marking: bool) {
        self.gc_marking.store(marking, Ordering::Release);
    }

    pub(crate) fn notify_state_change(&self) {
        let _guard = self.state_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.state_changed.notify_all();
    }

    pub(crate) fn wait_while_suspend_requested(&self, thread: &ManagedThread) {
        use crate::runtime::thread::ThreadFlag;
        let mut guard = self.state_lock.lock().unwrap_or_else(|e| e.into_inner());
        while thread.flags() & ThreadFlag::SUSPEND_REQUEST != 0 {
            guard = self
                .state_changed
                .wait_timeout(guard, WAIT_SLICE)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }
}

/// Held while all other threads are suspended. Dropping it resumes them.
pub struct SuspendAllGuard<'a> {
    list: &'a ThreadList,
    /// Address of the suspending thread's record, 0 when unattached.
    suspender: usize,
    targets: Vec<Arc<ManagedThread>>,
    token: MutatorsSuspended,
    _lock: MutexGuard<'a, ()>,
}

impl SuspendAllGuard<'_> {
    pub fn mutators_suspended(&self) -> &MutatorsSuspended {
        &self.token
    }

    /// Threads that were suspended by this guard.
    pub fn suspended_threads(&self) -> &[Arc<ManagedThread>] {
        &self.targets
    }
}

impl Drop for SuspendAllGuard<'_> {
    fn drop(&mut self) {
        // Every listed thread but the suspender holds one request from this
        // suspension: the targets, and anything that attached meanwhile.
        let resumed = {
            let threads = self.list.lock_threads();
            self.list.suspend_all_count.fetch_sub(1, Ordering::AcqRel);
            let mut resumed = 0;
            for thread in threads.iter() {
                if Arc::as_ptr(thread) as usize == self.suspender {
                    continue;
                }
                thread.decrement_suspend_count();
                if thread.suspend_count() == 0 {
                    thread.remove_suspend_trigger();
                }
                resumed += 1;
            }
            resumed
        };
        self.list.notify_state_change();
        debug!(threads = resumed, "resumed all threads");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::thread::ThreadFlag;
    use std::sync::mpsc;

    #[test]
    fn test_attach_detach() {
        let list = ThreadList::new(InstructionSet::X86_64);
        std::thread::spawn({
            let list = list.clone();
            move || {
                let t = list.attach_current("worker").unwrap();
                assert_eq!(t.state(), ThreadState::Runnable);
                assert_eq!(
                    list.attach_current("again").err(),
                    Some(ThreadError::AlreadyAttached(t.id()))
                );
                assert_eq!(list.len(), 1);
                list.detach_current().unwrap();
                assert_eq!(list.detach_current(), Err(ThreadError::NotAttached));
            }
        })
        .join()
        .unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn test_suspend_all_waits_for_runnable_thread() {
        let list = ThreadList::new(InstructionSet::X86_64);
        let (ready_tx, ready_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let polls = Arc::new(AtomicUsize::new(0));

        let worker = std::thread::spawn({
            let list = list.clone();
            let stop = stop.clone();
            let polls = polls.clone();
            move || {
                let t = list.attach_current("spinner").unwrap();
                ready_tx.send(()).unwrap();
                while !stop.load(Ordering::Acquire) {
                    if t.flags() & ThreadFlag::SUSPEND_OR_CHECKPOINT_REQUEST != 0 {
                        t.check_suspend();
                    }
                    polls.fetch_add(1, Ordering::Relaxed);
                    std::thread::yield_now();
                }
                list.detach_current().unwrap();
            }
        });
        ready_rx.recv().unwrap();

        {
            let guard = list.suspend_all("test");
            assert_eq!(guard.suspended_threads().len(), 1);
            let t = &guard.suspended_threads()[0];
            assert_eq!(t.state(), ThreadState::Suspended);
            let before = polls.load(Ordering::Relaxed);
            std::thread::sleep(Duration::from_millis(10));
            assert_eq!(polls.load(Ordering::Relaxed), before);
        }
        // Resumed: the loop makes progress again.
        let before = polls.load(Ordering::Relaxed);
        while polls.load(Ordering::Relaxed) == before {
            std::thread::yield_now();
        }
        stop.store(true, Ordering::Release);
        worker.join().unwrap();
    }

    #[test]
    fn test_native_threads_count_as_suspended() {
        let list = ThreadList::new(InstructionSet::Arm64);
        let (tx, rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let worker = std::thread::spawn({
            let list = list.clone();
            move || {
                let t = list.attach_current("native").unwrap();
                t.transition_from_runnable_to_native(0, false);
                ready_tx.send(()).unwrap();
                rx.recv().unwrap();
                t.transition_from_native_to_runnable();
                list.detach_current().unwrap();
            }
        });
        ready_rx.recv().unwrap();
        let guard = list.suspend_all("native");
        assert_eq!(guard.suspended_threads()[0].state(), ThreadState::Native);
        drop(guard);
        tx.send(()).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_implicit_suspend_trigger_armed_and_removed() {
        let list = ThreadList::new(InstructionSet::X86_64);
        list.set_implicit_suspend_checks(true);
        let (ready_tx, ready_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let worker = std::thread::spawn({
            let list = list.clone();
            move || {
                let t = list.attach_current("native").unwrap();
                t.transition_from_runnable_to_native(0, false);
                ready_tx.send(t.clone()).unwrap();
                done_rx.recv().unwrap();
                t.transition_from_native_to_runnable();
                list.detach_current().unwrap();
            }
        });
        let t = ready_rx.recv().unwrap();
        {
            let _guard = list.suspend_all("trigger");
            assert_eq!(t.suspend_trigger(), 0);
        }
        assert_ne!(t.suspend_trigger(), 0);
        done_tx.send(()).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_thread_attached_during_suspend_all_resumes() {
        let list = ThreadList::new(InstructionSet::X86_64);
        let (attached_tx, attached_rx) = mpsc::channel();
        let guard = list.suspend_all("attach race");

        let worker = std::thread::spawn({
            let list = list.clone();
            move || {
                let t = list.attach_current("late").unwrap();
                attached_tx.send(t.state()).unwrap();
                list.detach_current().unwrap();
            }
        });
        while list.is_empty() {
            std::thread::yield_now();
        }
        let late = list.threads()[0].clone();
        assert_eq!(late.suspend_count(), 1);
        assert!(late.flags() & ThreadFlag::SUSPEND_REQUEST != 0);
        assert!(attached_rx.recv_timeout(Duration::from_millis(20)).is_err());

        drop(guard);
        let state = attached_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(state, ThreadState::Runnable);
        assert_eq!(late.suspend_count(), 0);
        worker.join().unwrap();
    }

    #[test]
    fn test_consecutive_suspensions_balance_requests() {
        let list = ThreadList::new(InstructionSet::Arm64);
        let (ready_tx, ready_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let worker = std::thread::spawn({
            let list = list.clone();
            move || {
                let t = list.attach_current("native").unwrap();
                t.transition_from_runnable_to_native(0, false);
                ready_tx.send(t.clone()).unwrap();
                done_rx.recv().unwrap();
                t.transition_from_native_to_runnable();
                list.detach_current().unwrap();
            }
        });
        let t = ready_rx.recv().unwrap();
        for _ in 0..3 {
            let _guard = list.suspend_all("repeat");
            assert_eq!(t.suspend_count(), 1);
        }
        assert_eq!(t.suspend_count(), 0);
        assert_eq!(t.flags() & ThreadFlag::SUSPEND_REQUEST, 0);
        done_tx.send(()).unwrap();
        worker.join().unwrap();
    }
}
