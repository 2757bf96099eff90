//! Compiler contract and the JNI-stub compiler driver.
//!
//! Managed bytecode is compiled by an external optimizing compiler; this
//! crate only owns the native-method bridge. `JniStubCompiler` therefore
//! answers `compile` with `Ok(None)` for anything that is not native.

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::config::{ConfigError, RuntimeConfig};
use crate::isa::{InstructionSet, InstructionSetFeatures};
use crate::jit::code_cache::{CodeCache, CodeCacheError};
use crate::jni::calling_convention::JniKind;
use crate::jni::stub_compiler::{compile_jni_stub, CompiledStub, StubError, StubOptions};
use crate::runtime::method::{access_flags, Method};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("method {method} failed verification: {diagnostic}")]
    Verification { method: u32, diagnostic: String },
    #[error("synchronized native methods are not supported")]
    Synchronized,
    #[error("method {0} is not native")]
    NotNative(u32),
    #[error(transparent)]
    Stub(#[from] StubError),
    #[error(transparent)]
    Install(#[from] CodeCacheError),
}

/// Result of bytecode verification, produced by the verifier before a method
/// may be compiled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationVerdict {
    pub passed: bool,
    pub diagnostic: Option<String>,
}

impl VerificationVerdict {
    pub fn passed() -> Self {
        Self { passed: true, diagnostic: None }
    }

    pub fn failed(diagnostic: impl Into<String>) -> Self {
        Self {
            passed: false,
            diagnostic: Some(diagnostic.into()),
        }
    }
}

pub trait Compiler {
    fn instruction_set(&self) -> InstructionSet;

    /// Whether this compiler produces code for `method` at all.
    fn can_compile_method(&self, method: &Method) -> bool;

    /// Ahead-of-time compilation. `None` means the method stays with the
    /// interpreter or another compiler.
    fn compile(
        &self,
        method: &Method,
        shorty: &str,
        verdict: &VerificationVerdict,
    ) -> Result<Option<CompiledStub>, CompileError>;

    /// Compile the JNI stub for a native method with `access_flags`.
    fn jni_compile(&self, access_flags: u32, shorty: &str) -> Result<CompiledStub, CompileError>;

    /// Compile `method` and install the result. `Ok(false)` when the method
    /// is not something this compiler handles.
    fn jit_compile(
        &self,
        code_cache: &mut CodeCache,
        method: &Method,
        shorty: &str,
    ) -> Result<bool, CompileError>;

    fn get_entry_point_of(&self, method: &Method) -> usize {
        method.entry_point_from_quick()
    }
}

pub struct JniStubCompiler {
    isa: InstructionSet,
    features: InstructionSetFeatures,
    jit_threshold: u32,
    trace: bool,
    debuggable: bool,
}

impl JniStubCompiler {
    pub fn new(isa: InstructionSet, features: InstructionSetFeatures) -> Self {
        let defaults = RuntimeConfig::default();
        Self {
            isa,
            features,
            jit_threshold: defaults.jit_threshold,
            trace: defaults.trace_jit,
            debuggable: defaults.debuggable,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            isa: config.resolved_instruction_set()?,
            features: config.features.clone(),
            jit_threshold: config.jit_threshold,
            trace: config.trace_jit,
            debuggable: config.debuggable,
        })
    }

    pub fn features(&self) -> &InstructionSetFeatures {
        &self.features
    }

    /// Whether a method invoked `invocations` times is hot enough to JIT.
    pub fn is_hot(&self, invocations: u32) -> bool {
        invocations >= self.jit_threshold
    }

    pub fn is_debuggable(&self) -> bool {
        self.debuggable
    }

    fn kind_of(flags: u32) -> JniKind {
        if flags & access_flags::CRITICAL_NATIVE != 0 {
            JniKind::Critical
        } else if flags & access_flags::FAST_NATIVE != 0 {
            JniKind::Fast
        } else {
            JniKind::Normal
        }
    }

    fn build(&self, flags: u32, shorty: &str, jit: bool) -> Result<CompiledStub, CompileError> {
        if flags & access_flags::SYNCHRONIZED != 0 {
            return Err(CompileError::Synchronized);
        }
        let options = StubOptions {
            kind: Self::kind_of(flags),
            is_static: flags & access_flags::STATIC != 0,
            // Only a debuggable runtime distinguishes JIT frames on the stack.
            tag_sp: self.debuggable && jit,
        };
        trace!(shorty, ?options, "compiling JNI stub");
        let stub = compile_jni_stub(self.isa, &self.features, shorty, options)?;
        if self.trace {
            info!(
                isa = %self.isa,
                shorty,
                kind = ?stub.kind,
                frame = stub.frame_size,
                size = stub.code.len(),
                "JNI stub"
            );
        }
        Ok(stub)
    }
}

impl Compiler for JniStubCompiler {
    fn instruction_set(&self) -> InstructionSet {
        self.isa
    }

    fn can_compile_method(&self, method: &Method) -> bool {
        method.is_native() && method.access_flags() & access_flags::SYNCHRONIZED == 0
    }

    fn compile(
        &self,
        method: &Method,
        shorty: &str,
        verdict: &VerificationVerdict,
    ) -> Result<Option<CompiledStub>, CompileError> {
        if !verdict.passed {
            return Err(CompileError::Verification {
                method: method.method_index(),
                diagnostic: verdict
                    .diagnostic
                    .clone()
                    .unwrap_or_else(|| "no diagnostic".to_string()),
            });
        }
        if !method.is_native() {
            debug!(method = method.method_index(), "leaving managed method to the optimizing compiler");
            return Ok(None);
        }
        self.build(method.access_flags(), shorty, false).map(Some)
    }

    fn jni_compile(&self, access_flags: u32, shorty: &str) -> Result<CompiledStub, CompileError> {
        self.build(access_flags, shorty, false)
    }

    fn jit_compile(
        &self,
        code_cache: &mut CodeCache,
        method: &Method,
        shorty: &str,
    ) -> Result<bool, CompileError> {
        if !self.can_compile_method(method) {
            return Ok(false);
        }
        let stub = self.build(method.access_flags(), shorty, true)?;
        code_cache.install(method, &stub)?;
        Ok(true)
    }
}

/// Compile and install `method`'s stub, rejecting anything that is not native.
pub fn compile_native_method(
    compiler: &dyn Compiler,
    code_cache: &mut CodeCache,
    method: &Method,
    shorty: &str,
) -> Result<usize, CompileError> {
    if !method.is_native() {
        return Err(CompileError::NotNative(method.method_index()));
    }
    if !compiler.jit_compile(code_cache, method, shorty)? {
        return Err(CompileError::Synchronized);
    }
    Ok(compiler.get_entry_point_of(method))
}
