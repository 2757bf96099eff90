//! Read-barrier collector hooks.
//!
//! The collector itself is outside this crate. What is modelled here is the
//! part compiled code observes: the per-thread `is_gc_marking` flag, the
//! read-barrier mark entrypoints, and the lock-word mark bit those entrypoints
//! set. Flipping marking on or off happens with every mutator suspended so
//! that each thread sees its flag and its entrypoints change together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, info};

use crate::runtime::entrypoints::update_read_barrier_entrypoints;
use crate::runtime::object::Object;
use crate::runtime::thread_list::ThreadList;

/// Objects marked since the current cycle began.
static MARK_STACK: Mutex<Vec<usize>> = Mutex::new(Vec::new());

/// Serializes tests that mark objects or finish a cycle.
#[cfg(test)]
pub(crate) static MARK_TEST_LOCK: Mutex<()> = Mutex::new(());

/// Set the mark bit of `obj` and remember newly marked objects.
pub fn mark_object(obj: *mut Object) -> *mut Object {
    if obj.is_null() {
        return obj;
    }
    // SAFETY: mark routines are only handed live objects.
    let newly_marked = unsafe { (*obj).set_mark_bit() };
    if newly_marked {
        MARK_STACK
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(obj as usize);
    }
    obj
}

/// What compiled code and the runtime ask the collector.
pub trait GcMarkingState {
    fn is_marking(&self) -> bool;
    fn is_marked(&self, obj: &Object) -> bool;
}

/// GC phase states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// No GC in progress
    Idle,
    /// Read barriers active
    Marking,
}

/// Statistics for GC operations.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Completed marking cycles
    pub cycles: usize,
    /// Objects marked through read barriers
    pub objects_marked: usize,
    /// Longest flip pause (microseconds)
    pub max_pause_us: u64,
}

pub struct ReadBarrierCollector {
    marking: AtomicBool,
    stats: Mutex<GcStats>,
}

impl ReadBarrierCollector {
    pub fn new() -> Self {
        Self {
            marking: AtomicBool::new(false),
            stats: Mutex::new(GcStats::default()),
        }
    }

    pub fn phase(&self) -> GcPhase {
        if self.is_marking() {
            GcPhase::Marking
        } else {
            GcPhase::Idle
        }
    }

    pub fn stats(&self) -> GcStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Turn read barriers on in every thread.
    pub fn start_marking(&self, threads: &ThreadList) {
        assert!(!self.is_marking(), "marking already in progress");
        self.flip(threads, true);
        info!(threads = threads.len(), "read barriers enabled");
    }

    /// Turn read barriers off, clear mark bits and return the number of
    /// objects marked during the cycle.
    pub fn finish_marking(&self, threads: &ThreadList) -> usize {
        assert!(self.is_marking(), "no marking in progress");
        self.flip(threads, false);

        let marked = std::mem::take(&mut *MARK_STACK.lock().unwrap_or_else(|e| e.into_inner()));
        for &addr in &marked {
            // SAFETY: only live objects are pushed by `mark_object`.
            unsafe { (*(addr as *const Object)).clear_mark_bit() };
        }
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.cycles += 1;
        stats.objects_marked += marked.len();
        info!(objects = marked.len(), "marking finished");
        marked.len()
    }

    fn flip(&self, threads: &ThreadList, marking: bool) {
        let start = Instant::now();
        let isa = threads.instruction_set();
        {
            let guard = threads.suspend_all("gc flip");
            for thread in threads.threads() {
                thread.set_is_gc_marking(marking);
                update_read_barrier_entrypoints(
                    thread.entrypoints(),
                    isa,
                    marking,
                    guard.mutators_suspended(),
                );
            }
            threads.set_gc_marking(marking);
            self.marking.store(marking, Ordering::Release);
        }
        let pause = start.elapsed().as_micros() as u64;
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.max_pause_us = stats.max_pause_us.max(pause);
        debug!(marking, pause_us = pause, "flipped read barrier state");
    }
}

impl Default for ReadBarrierCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMarkingState for ReadBarrierCollector {
    fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Acquire)
    }

    fn is_marked(&self, obj: &Object) -> bool {
        obj.is_marked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::InstructionSet;
    use crate::runtime::entrypoints::{is_usable_mark_slot, READ_BARRIER_MARK_SLOTS};
    use crate::runtime::object::Heap;

    #[test]
    fn test_flip_updates_flag_and_entrypoints_together() {
        let _serial = MARK_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let list = ThreadList::new(InstructionSet::Arm64);
        let gc = ReadBarrierCollector::new();
        std::thread::spawn({
            let list = list.clone();
            move || {
                let t = list.attach_current("mutator").unwrap();
                assert!(!t.is_gc_marking());

                gc.start_marking(&list);
                assert_eq!(gc.phase(), GcPhase::Marking);
                assert!(t.is_gc_marking());
                for slot in 0..READ_BARRIER_MARK_SLOTS {
                    let set = t.entrypoints().read_barrier_mark(slot) != 0;
                    assert_eq!(set, is_usable_mark_slot(InstructionSet::Arm64, slot));
                }

                gc.finish_marking(&list);
                assert!(!t.is_gc_marking());
                assert!((0..READ_BARRIER_MARK_SLOTS).all(|s| t.entrypoints().read_barrier_mark(s) == 0));
                assert_eq!(gc.stats().cycles, 1);
                list.detach_current().unwrap();
            }
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_threads_attached_during_marking_get_barriers() {
        let _serial = MARK_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let list = ThreadList::new(InstructionSet::X86_64);
        let gc = ReadBarrierCollector::new();
        gc.start_marking(&list);
        std::thread::spawn({
            let list = list.clone();
            move || {
                let t = list.attach_current("late").unwrap();
                assert!(t.is_gc_marking());
                assert_ne!(t.entrypoints().read_barrier_mark(0), 0);
                list.detach_current().unwrap();
            }
        })
        .join()
        .unwrap();
        gc.finish_marking(&list);
    }

    #[test]
    fn test_finish_clears_mark_bits() {
        let _serial = MARK_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let Ok(heap) = Heap::new(16 * 1024) else {
            return;
        };
        // Leaked: other tests may drain the mark stack later.
        let heap: &'static Heap = Box::leak(Box::new(heap));
        let klass = heap.alloc_class(None).unwrap();
        let obj = heap.alloc_object(klass).unwrap();
        let list = ThreadList::new(InstructionSet::X86_64);
        let gc = ReadBarrierCollector::new();
        gc.start_marking(&list);
        mark_object(obj as *const Object as *mut Object);
        assert!(gc.is_marked(obj));
        gc.finish_marking(&list);
        assert!(!obj.is_marked());
    }
}
