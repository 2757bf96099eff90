//! jnibridge - the native-method bridge of a managed runtime's JIT.
//!
//! This library provides the JNI macro-assembler, the quick entrypoint table
//! with read-barrier dispatch, the Runnable/Native thread protocol, and
//! fault-based recovery of implicit checks in generated code.

pub mod compiler;
pub mod config;
pub mod fault;
pub mod isa;
pub mod jit;
pub mod jni;
pub mod logging;
pub mod offsets;
pub mod runtime;

// Re-export commonly used types
pub use compiler::{CompileError, Compiler, JniStubCompiler, VerificationVerdict};
pub use config::{ConfigError, GcMode, RuntimeConfig};
pub use fault::{FaultContext, FaultKind, FaultManager, FaultOutcome, ImplicitChecks};
pub use isa::{InstructionSet, InstructionSetFeatures, PointerSize};
pub use jit::{CodeCache, ExecutableMemory};
pub use jni::stub_compiler::{compile_jni_stub, CompiledStub, StubOptions};
pub use jni::{JniAsmError, JniMacroAssembler, ManagedRegister};
pub use offsets::{FrameOffset, MemberOffset, Offset, ThreadOffset};
pub use runtime::{ManagedThread, QuickEntryPoints, QuickEntrypoint, ThreadList, ThreadState};
