//! Machine-code infrastructure behind the JNI stubs.
//!
//! - Code buffer with label fix-ups
//! - x86-64 and AArch64 instruction encoders
//! - Executable memory and the installed-stub code cache

pub mod aarch64;
pub mod code_cache;
pub mod codebuf;
pub mod memory;
pub mod x86_64;

pub use code_cache::{CodeCache, CodeCacheError};
pub use memory::{ExecutableMemory, MemoryError};
