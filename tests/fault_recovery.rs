//! Fault recovery against code installed in the code cache.

use std::sync::Arc;

use jnibridge::fault::{
    FaultContext, FaultKind, FaultManager, FaultOutcome, ImplicitChecks, SyntheticContext,
};
use jnibridge::isa::{InstructionSet, InstructionSetFeatures};
use jnibridge::jit::CodeCache;
use jnibridge::jni::stub_compiler::{compile_jni_stub, StubOptions};
use jnibridge::runtime::method::{access_flags, Method};
use jnibridge::runtime::object::HeapReference;
use jnibridge::runtime::{ManagedThread, QuickEntrypoint, ThreadList};

const SP: usize = 0x7fff_0000;

fn on_runnable_thread<R: Send>(
    isa: InstructionSet,
    f: impl FnOnce(&ManagedThread) -> R + Send,
) -> R {
    let list = ThreadList::new(isa);
    std::thread::scope(|s| {
        s.spawn(|| {
            let thread = list.attach_current("fault-recovery").unwrap();
            let result = f(&thread);
            list.detach_current().unwrap();
            result
        })
        .join()
        .unwrap()
    })
}

fn native_method() -> Method {
    Method::new(HeapReference::NULL, access_flags::NATIVE, 7)
}

/// Install an "IL" stub for `method`; the cache records `method`'s address.
fn installed(
    isa: InstructionSet,
    manager: &Arc<FaultManager>,
    method: &Method,
) -> (CodeCache, usize, Vec<u8>) {
    let mut cache = CodeCache::new(isa).with_fault_manager(manager.clone());
    let stub = compile_jni_stub(isa, &InstructionSetFeatures::default(), "IL", StubOptions::default())
        .unwrap();
    let entry = cache.install(method, &stub).unwrap();
    (cache, entry, stub.code)
}

#[test]
fn test_stack_overflow_in_installed_stub() {
    let isa = InstructionSet::X86_64;
    let manager = Arc::new(FaultManager::new(isa, ImplicitChecks::default()));
    let method = native_method();
    let (_cache, entry, code) = installed(isa, &manager, &method);

    let mut ctx = SyntheticContext::new(isa).with_code(entry, code);
    ctx.pc = entry + 4;
    ctx.sp = SP;
    ctx.fault_address = SP - isa.stack_overflow_reserved_bytes();

    on_runnable_thread(isa, |thread| {
        let outcome = manager.handle_fault(&mut ctx, Some(thread));
        assert_eq!(outcome, FaultOutcome::Handled(FaultKind::StackOverflow));
        assert_eq!(ctx.pc, thread.entrypoint(QuickEntrypoint::ThrowStackOverflow));
    });
    assert_eq!(ctx.sp, SP);
}

#[test]
fn test_fault_one_word_off_is_not_a_stack_overflow() {
    let isa = InstructionSet::Arm64;
    let manager = Arc::new(FaultManager::new(isa, ImplicitChecks::default()));
    let method = native_method();
    let (_cache, entry, code) = installed(isa, &manager, &method);

    let mut ctx = SyntheticContext::new(isa).with_code(entry, code);
    ctx.pc = entry;
    ctx.sp = SP;
    ctx.fault_address = SP - isa.stack_overflow_reserved_bytes() - 8;
    on_runnable_thread(isa, |thread| {
        assert_eq!(manager.handle_fault(&mut ctx, Some(thread)), FaultOutcome::NotHandled);
    });
    assert_eq!(ctx.pc, entry);
}

#[test]
fn test_arm64_null_check_in_registered_code() {
    let isa = InstructionSet::Arm64;
    let manager = Arc::new(FaultManager::new(isa, ImplicitChecks::default()));
    let method = native_method();
    let (_cache, entry, code) = installed(isa, &manager, &method);
    let method_ptr = &method as *const Method as usize;

    let mut ctx = SyntheticContext::new(isa).with_code(entry, code);
    ctx.pc = entry + 8;
    ctx.sp = SP;
    ctx.fault_address = 0x10;
    ctx.write_word(SP, method_ptr);

    on_runnable_thread(isa, |thread| {
        let outcome = manager.handle_fault(&mut ctx, Some(thread));
        assert_eq!(outcome, FaultOutcome::Handled(FaultKind::NullPointer));
        assert_eq!(ctx.pc, thread.entrypoint(QuickEntrypoint::ThrowNullPointerFromSignal));
    });
    assert_eq!(ctx.link_register, entry + 12);
    assert_eq!(ctx.arguments[0], 0x10);
}

#[test]
fn test_replaced_stub_no_longer_recovers() {
    let isa = InstructionSet::X86_64;
    let manager = Arc::new(FaultManager::new(isa, ImplicitChecks::default()));
    let method = native_method();
    let (mut cache, old_entry, _) = installed(isa, &manager, &method);
    let stub = compile_jni_stub(isa, &InstructionSetFeatures::default(), "V", StubOptions::default())
        .unwrap();
    let new_entry = cache.install(&method, &stub).unwrap();

    assert!(!manager.is_in_generated_code(old_entry));
    assert!(manager.is_in_generated_code(new_entry));

    let mut ctx = SyntheticContext::new(isa);
    ctx.pc = old_entry;
    ctx.sp = SP;
    ctx.fault_address = SP - isa.stack_overflow_reserved_bytes();
    on_runnable_thread(isa, |thread| {
        assert_eq!(manager.handle_fault(&mut ctx, Some(thread)), FaultOutcome::NotHandled);
    });
    assert_eq!(ctx.pc(), old_entry);
}
