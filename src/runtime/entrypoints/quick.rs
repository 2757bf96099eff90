//! Bodies behind the default entrypoint slots.
//!
//! Everything here is `extern "C"` and called from generated code. The
//! throwing entrypoints never return: they hand the exception to the
//! installed throw hook and abort if the hook returns.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use tracing::error;

use super::QuickEntrypoint;
use crate::isa::InstructionSet;
use crate::runtime::gc;
use crate::runtime::indirect_ref;
use crate::runtime::method::Method;
use crate::runtime::object::{Class, HeapReference, Object, StringObject};
use crate::runtime::thread::ManagedThread;

/// An exception raised by an entrypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrowKind {
    NullPointer { fault_address: usize },
    StackOverflow,
    Arithmetic,
    ClassCast,
    /// The thread's pending exception, delivered by compiled code.
    Pending { exception: u32 },
}

pub type ThrowHook = fn(ThrowKind);

fn default_throw_hook(kind: ThrowKind) {
    error!(?kind, "uncaught exception raised from compiled code");
}

static THROW_HOOK: RwLock<ThrowHook> = RwLock::new(default_throw_hook);

/// Install the handler that unwinds to managed catch blocks.
pub fn set_throw_hook(hook: ThrowHook) {
    *THROW_HOOK.write().unwrap_or_else(|e| e.into_inner()) = hook;
}

fn raise(kind: ThrowKind) -> ! {
    let hook = *THROW_HOOK.read().unwrap_or_else(|e| e.into_inner());
    hook(kind);
    std::process::abort()
}

// ---- Type checks ----

pub extern "C" fn instanceof_non_trivial(obj: *const Object, klass: *const Class) -> u32 {
    if obj.is_null() || klass.is_null() {
        return 0;
    }
    // SAFETY: compiled code passes live objects.
    let (obj, klass) = unsafe { (&*obj, &*klass) };
    obj.class().is_some_and(|c| c.is_subclass_of(klass)) as u32
}

pub extern "C" fn check_instance_of(obj: *const Object, klass: *const Class) {
    if !obj.is_null() && instanceof_non_trivial(obj, klass) == 0 {
        raise(ThrowKind::ClassCast);
    }
}

// ---- Math ----

macro_rules! unary_math {
    ($($name:ident => $method:ident),* $(,)?) => {
        $(pub extern "C" fn $name(x: f64) -> f64 { x.$method() })*
    };
}

unary_math!(
    cos => cos, sin => sin, acos => acos, asin => asin, atan => atan,
    cbrt => cbrt, cosh => cosh, exp => exp, expm1 => exp_m1, log => ln,
    log10 => log10, sinh => sinh, tan => tan, tanh => tanh,
);

pub extern "C" fn atan2(y: f64, x: f64) -> f64 {
    y.atan2(x)
}

pub extern "C" fn pow(x: f64, y: f64) -> f64 {
    x.powf(y)
}

pub extern "C" fn hypot(x: f64, y: f64) -> f64 {
    x.hypot(y)
}

pub extern "C" fn next_after(x: f64, y: f64) -> f64 {
    if x.is_nan() || y.is_nan() {
        return x + y;
    }
    if x == y {
        return y;
    }
    if x == 0.0 {
        let tiny = f64::from_bits(1);
        return if y > 0.0 { tiny } else { -tiny };
    }
    let bits = x.to_bits();
    let bits = if (y > x) == (x > 0.0) { bits + 1 } else { bits - 1 };
    f64::from_bits(bits)
}

pub extern "C" fn fmod(a: f64, b: f64) -> f64 {
    a % b
}

pub extern "C" fn fmodf(a: f32, b: f32) -> f32 {
    a % b
}

// ---- Integer arithmetic with Java semantics ----

/// Quotient in the low word, remainder in the high word.
pub extern "C" fn idivmod(a: i32, b: i32) -> i64 {
    if b == 0 {
        raise(ThrowKind::Arithmetic);
    }
    let q = a.wrapping_div(b) as u32 as u64;
    let r = a.wrapping_rem(b) as u32 as u64;
    ((r << 32) | q) as i64
}

/// Saturating; NaN converts to 0.
pub extern "C" fn d2l(x: f64) -> i64 {
    x as i64
}

pub extern "C" fn f2l(x: f32) -> i64 {
    x as i64
}

pub extern "C" fn ldiv(a: i64, b: i64) -> i64 {
    if b == 0 {
        raise(ThrowKind::Arithmetic);
    }
    a.wrapping_div(b)
}

pub extern "C" fn lmod(a: i64, b: i64) -> i64 {
    if b == 0 {
        raise(ThrowKind::Arithmetic);
    }
    a.wrapping_rem(b)
}

pub extern "C" fn lmul(a: i64, b: i64) -> i64 {
    a.wrapping_mul(b)
}

// Shift counts are taken modulo 64.
pub extern "C" fn shl_long(value: i64, shift: u32) -> i64 {
    value.wrapping_shl(shift)
}

pub extern "C" fn shr_long(value: i64, shift: u32) -> i64 {
    value.wrapping_shr(shift)
}

pub extern "C" fn ushr_long(value: i64, shift: u32) -> i64 {
    (value as u64).wrapping_shr(shift) as i64
}

// ---- Strings and memory ----

pub extern "C" fn string_compare_to(lhs: *const StringObject, rhs: *const StringObject) -> i32 {
    if rhs.is_null() {
        raise(ThrowKind::NullPointer { fault_address: 0 });
    }
    // SAFETY: the receiver is null-checked by the caller, the argument above.
    let (a, b) = unsafe { ((*lhs).chars(), (*rhs).chars()) };
    for (x, y) in a.iter().zip(b) {
        if x != y {
            return *x as i32 - *y as i32;
        }
    }
    a.len() as i32 - b.len() as i32
}

/// # Safety
///
/// Same contract as C `memcpy`.
pub unsafe extern "C" fn memcpy(dst: *mut u8, src: *const u8, len: usize) -> *mut u8 {
    // SAFETY: forwarded to the caller.
    unsafe { std::ptr::copy_nonoverlapping(src, dst, len) };
    dst
}

// ---- JNI transitions ----

fn with_current_thread(f: impl FnOnce(&ManagedThread)) {
    match ManagedThread::current() {
        Some(thread) => f(&thread),
        None => {
            error!("JNI transition on an unattached thread");
            std::process::abort();
        }
    }
}

/// Slow path of the inline Runnable -> Native transition.
pub extern "C" fn jni_method_start() {
    with_current_thread(|t| t.transition_to_native());
}

/// Slow path of the inline Native -> Runnable transition.
pub extern "C" fn jni_method_end() {
    with_current_thread(|t| t.transition_from_native_to_runnable());
}

/// Mark the declaring class of a static native method.
pub extern "C" fn read_barrier_jni(method: *const Method) {
    if method.is_null() {
        return;
    }
    // SAFETY: the stub passes its own method.
    let klass = unsafe { (*method).declaring_class() };
    if !klass.is_null() {
        gc::mark_object(klass.as_ptr());
    }
}

/// Decode a returned `jobject` that the inline path could not handle.
pub extern "C" fn jni_decode_reference_result(jobject: usize) -> *mut Object {
    // SAFETY: native code returned a valid reference or null.
    match unsafe { indirect_ref::decode(jobject) } {
        Ok(reference) => reference.as_ptr(),
        Err(e) => {
            error!(%e, "native method returned an invalid reference");
            std::process::abort();
        }
    }
}

pub extern "C" fn test_suspend() {
    with_current_thread(|t| t.check_suspend());
}

// ---- Exceptions ----

pub extern "C" fn deliver_exception(exception: *mut Object) -> ! {
    let exception = if exception.is_null() {
        0
    } else {
        HeapReference::from_ptr(exception).0
    };
    raise(ThrowKind::Pending { exception })
}

pub extern "C" fn throw_null_pointer_from_signal(fault_address: usize) -> ! {
    raise(ThrowKind::NullPointer { fault_address })
}

pub extern "C" fn throw_stack_overflow() -> ! {
    raise(ThrowKind::StackOverflow)
}

// ---- Read barriers ----

/// Load the reference at `obj + offset` and mark it.
pub extern "C" fn read_barrier_slow(_ref: *mut Object, obj: *mut Object, offset: u32) -> *mut Object {
    // SAFETY: compiled code passes a live holder and a field offset inside it.
    let field = unsafe { ((obj as *const u8).add(offset as usize) as *const u32).read() };
    gc::mark_object(HeapReference(field).as_ptr())
}

pub extern "C" fn read_barrier_for_root_slow(root: *const HeapReference) -> *mut Object {
    // SAFETY: roots are valid 32-bit slots.
    let reference = unsafe { root.read() };
    gc::mark_object(reference.as_ptr())
}

static MARK_CALLS: [AtomicUsize; 32] = [const { AtomicUsize::new(0) }; 32];

/// Per-register mark routine; the register number is baked in so every
/// slot has a distinct target.
extern "C" fn read_barrier_mark_reg<const N: usize>(obj: *mut Object) -> *mut Object {
    MARK_CALLS[N].fetch_add(1, Ordering::Relaxed);
    gc::mark_object(obj)
}

type MarkRoutine = extern "C" fn(*mut Object) -> *mut Object;

static MARK_ROUTINES: [MarkRoutine; 32] = [
    read_barrier_mark_reg::<0>, read_barrier_mark_reg::<1>, read_barrier_mark_reg::<2>,
    read_barrier_mark_reg::<3>, read_barrier_mark_reg::<4>, read_barrier_mark_reg::<5>,
    read_barrier_mark_reg::<6>, read_barrier_mark_reg::<7>, read_barrier_mark_reg::<8>,
    read_barrier_mark_reg::<9>, read_barrier_mark_reg::<10>, read_barrier_mark_reg::<11>,
    read_barrier_mark_reg::<12>, read_barrier_mark_reg::<13>, read_barrier_mark_reg::<14>,
    read_barrier_mark_reg::<15>, read_barrier_mark_reg::<16>, read_barrier_mark_reg::<17>,
    read_barrier_mark_reg::<18>, read_barrier_mark_reg::<19>, read_barrier_mark_reg::<20>,
    read_barrier_mark_reg::<21>, read_barrier_mark_reg::<22>, read_barrier_mark_reg::<23>,
    read_barrier_mark_reg::<24>, read_barrier_mark_reg::<25>, read_barrier_mark_reg::<26>,
    read_barrier_mark_reg::<27>, read_barrier_mark_reg::<28>, read_barrier_mark_reg::<29>,
    read_barrier_mark_reg::<30>, read_barrier_mark_reg::<31>,
];

/// Address of the mark routine for register `reg`.
pub fn read_barrier_mark_routine(reg: usize) -> usize {
    MARK_ROUTINES[reg] as *const () as usize
}

/// How often the mark routine for `reg` has run.
pub fn mark_calls(reg: usize) -> usize {
    MARK_CALLS[reg].load(Ordering::Relaxed)
}

// ---- Defaults ----

/// Default value of a fixed slot on `isa`, 0 when the ISA has an
/// instruction for it.
pub fn default_entrypoint(isa: InstructionSet, ep: QuickEntrypoint) -> usize {
    use InstructionSet::*;
    use QuickEntrypoint as E;

    let x86 = matches!(isa, X86 | X86_64);
    let has_long_helpers = matches!(isa, X86 | X86_64 | Arm);
    match ep {
        E::InstanceofNonTrivial => instanceof_non_trivial as *const () as usize,
        E::CheckInstanceOf => check_instance_of as *const () as usize,
        E::Cos => cos as *const () as usize,
        E::Sin => sin as *const () as usize,
        E::Acos => acos as *const () as usize,
        E::Asin => asin as *const () as usize,
        E::Atan => atan as *const () as usize,
        E::Atan2 => atan2 as *const () as usize,
        E::Pow => pow as *const () as usize,
        E::Cbrt => cbrt as *const () as usize,
        E::Cosh => cosh as *const () as usize,
        E::Exp => exp as *const () as usize,
        E::Expm1 => expm1 as *const () as usize,
        E::Hypot => hypot as *const () as usize,
        E::Log => log as *const () as usize,
        E::Log10 => log10 as *const () as usize,
        E::NextAfter => next_after as *const () as usize,
        E::Sinh => sinh as *const () as usize,
        E::Tan => tan as *const () as usize,
        E::Tanh => tanh as *const () as usize,
        // x86 has fprem.
        E::Fmod if x86 => 0,
        E::Fmod => fmod as *const () as usize,
        E::Fmodf if x86 => 0,
        E::Fmodf => fmodf as *const () as usize,
        E::Idivmod if isa == Arm => idivmod as *const () as usize,
        E::Idivmod => 0,
        E::D2l if has_long_helpers => d2l as *const () as usize,
        E::F2l if has_long_helpers => f2l as *const () as usize,
        E::Ldiv if has_long_helpers => ldiv as *const () as usize,
        E::Lmod if has_long_helpers => lmod as *const () as usize,
        E::Lmul if has_long_helpers => lmul as *const () as usize,
        E::ShlLong if has_long_helpers => shl_long as *const () as usize,
        E::ShrLong if has_long_helpers => shr_long as *const () as usize,
        E::UshrLong if has_long_helpers => ushr_long as *const () as usize,
        E::D2l | E::F2l | E::Ldiv | E::Lmod | E::Lmul | E::ShlLong | E::ShrLong | E::UshrLong => 0,
        E::StringCompareTo if x86 => string_compare_to as *const () as usize,
        E::StringCompareTo => 0,
        E::Memcpy => memcpy as *const () as usize,
        E::JniMethodStart => jni_method_start as *const () as usize,
        E::JniMethodEnd => jni_method_end as *const () as usize,
        E::ReadBarrierJni => read_barrier_jni as *const () as usize,
        E::JniDecodeReferenceResult => jni_decode_reference_result as *const () as usize,
        E::TestSuspend => test_suspend as *const () as usize,
        E::DeliverException => deliver_exception as *const () as usize,
        E::ThrowNullPointerFromSignal => throw_null_pointer_from_signal as *const () as usize,
        E::ThrowStackOverflow => throw_stack_overflow as *const () as usize,
        E::ReadBarrierSlow => read_barrier_slow as *const () as usize,
        E::ReadBarrierForRootSlow => read_barrier_for_root_slow as *const () as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::object::Heap;

    #[test]
    fn test_java_long_semantics() {
        assert_eq!(d2l(f64::NAN), 0);
        assert_eq!(d2l(1e300), i64::MAX);
        assert_eq!(f2l(-1e30), i64::MIN);
        assert_eq!(ldiv(i64::MIN, -1), i64::MIN);
        assert_eq!(lmod(i64::MIN, -1), 0);
        assert_eq!(lmod(-7, 2), -1);
        assert_eq!(shl_long(1, 65), 2);
        assert_eq!(shr_long(-8, 1), -4);
        assert_eq!(ushr_long(-1, 60), 0xF);
    }

    #[test]
    fn test_idivmod_packs_quotient_and_remainder() {
        let packed = idivmod(-7, 2);
        assert_eq!(packed as u32 as i32, -3);
        assert_eq!((packed >> 32) as i32, -1);
    }

    #[test]
    fn test_math() {
        assert_eq!(fmod(7.5, 2.0), 1.5);
        assert_eq!(fmodf(-7.5, 2.0), -1.5);
        assert_eq!(next_after(1.0, 2.0), 1.0 + f64::EPSILON);
        assert!(next_after(1.0, 0.0) < 1.0);
        assert_eq!(next_after(0.0, -1.0), -f64::from_bits(1));
        assert!(next_after(f64::NAN, 1.0).is_nan());
        assert_eq!(hypot(3.0, 4.0), 5.0);
        assert_eq!(cbrt(27.0), 3.0);
    }

    #[test]
    fn test_memcpy() {
        let src = [1u8, 2, 3, 4];
        let mut dst = [0u8; 4];
        let ret = unsafe { memcpy(dst.as_mut_ptr(), src.as_ptr(), 4) };
        assert_eq!(ret, dst.as_mut_ptr());
        assert_eq!(dst, src);
    }

    #[test]
    fn test_mark_routines_are_distinct_and_mark() {
        let _serial = gc::MARK_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut routines: Vec<usize> = (0..32).map(read_barrier_mark_routine).collect();
        routines.sort();
        routines.dedup();
        assert_eq!(routines.len(), 32);

        // Leaked: the global mark stack may still hold it after this test.
        let obj: &'static Object = Box::leak(Box::new(Object::new(HeapReference::NULL)));
        let ptr = obj as *const Object as *mut Object;
        let before = mark_calls(7);
        assert_eq!(MARK_ROUTINES[7](ptr), ptr);
        assert!(obj.is_marked());
        assert_eq!(mark_calls(7), before + 1);
        assert!(MARK_ROUTINES[3](std::ptr::null_mut()).is_null());
        obj.clear_mark_bit();
    }

    #[test]
    fn test_instanceof_and_compare_on_heap() {
        let Ok(heap) = Heap::new(64 * 1024) else {
            return;
        };
        let base = heap.alloc_class(None).unwrap();
        let derived = heap.alloc_class(Some(base)).unwrap();
        let obj = heap.alloc_object(derived).unwrap();
        assert_eq!(instanceof_non_trivial(obj, base), 1);
        assert_eq!(instanceof_non_trivial(heap.alloc_object(base).unwrap(), derived), 0);
        assert_eq!(instanceof_non_trivial(std::ptr::null(), base), 0);
        check_instance_of(obj, base);

        let a = heap.alloc_string(base, "apple").unwrap();
        let b = heap.alloc_string(base, "apply").unwrap();
        let c = heap.alloc_string(base, "app").unwrap();
        assert_eq!(string_compare_to(a, b), 'e' as i32 - 'y' as i32);
        assert_eq!(string_compare_to(a, c), 2);
        assert_eq!(string_compare_to(a, a), 0);
    }

    #[test]
    fn test_decode_reference_result() {
        let slot: u32 = 0x5000;
        let jobject = &slot as *const u32 as usize | 1;
        assert_eq!(jni_decode_reference_result(jobject) as usize, 0x5000);
        assert!(jni_decode_reference_result(0).is_null());
    }

    #[test]
    fn test_defaults_cover_every_slot_on_x86_64() {
        for &ep in QuickEntrypoint::ALL {
            let value = default_entrypoint(InstructionSet::X86_64, ep);
            let expect_null = matches!(
                ep,
                QuickEntrypoint::Fmod | QuickEntrypoint::Fmodf | QuickEntrypoint::Idivmod
            );
            assert_eq!(value == 0, expect_null, "{}", ep);
        }
    }
}
