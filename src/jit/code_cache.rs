//! Installed JNI stubs.
//!
//! Each stub gets its own executable mapping. The cache maps a method index
//! to the stub's entry point, points the method's quick entry at it, and
//! registers the code range with the fault manager so implicit checks inside
//! the stub are recognized.
//!
//! Replaced stubs are not unmapped right away: another thread may still be
//! executing them. They are retired and only released once mutators are
//! suspended.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::fault::FaultManager;
use crate::isa::InstructionSet;
use crate::jit::memory::{ExecutableMemory, MemoryError};
use crate::jni::calling_convention::JniKind;
use crate::jni::stub_compiler::CompiledStub;
use crate::runtime::entrypoints::MutatorsSuspended;
use crate::runtime::method::Method;

#[derive(Debug, Error)]
pub enum CodeCacheError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("stub compiled for {found} cannot be installed in a {expected} code cache")]
    IsaMismatch {
        expected: InstructionSet,
        found: InstructionSet,
    },
}

/// A stub in executable memory.
pub struct InstalledStub {
    memory: ExecutableMemory,
    code_size: usize,
    method: usize,
    pub shorty: String,
    pub kind: JniKind,
}

impl InstalledStub {
    pub fn entry_point(&self) -> usize {
        self.memory.as_ptr() as usize
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }

    pub fn contains(&self, pc: usize) -> bool {
        (self.entry_point()..self.entry_point() + self.code_size).contains(&pc)
    }
}

pub struct CodeCache {
    isa: InstructionSet,
    stubs: HashMap<u32, InstalledStub>,
    retired: Vec<InstalledStub>,
    fault_manager: Option<Arc<FaultManager>>,
}

impl CodeCache {
    pub fn new(isa: InstructionSet) -> Self {
        Self {
            isa,
            stubs: HashMap::new(),
            retired: Vec::new(),
            fault_manager: None,
        }
    }

    /// Report installed code ranges to `manager` from now on.
    pub fn with_fault_manager(mut self, manager: Arc<FaultManager>) -> Self {
        for stub in self.stubs.values() {
            let start = stub.entry_point();
            manager.register_code(start..start + stub.code_size, stub.method);
        }
        self.fault_manager = Some(manager);
        self
    }

    pub fn instruction_set(&self) -> InstructionSet {
        self.isa
    }

    /// Copy `stub` into executable memory and make it `method`'s entry point.
    pub fn install(&mut self, method: &Method, stub: &CompiledStub) -> Result<usize, CodeCacheError> {
        if stub.isa != self.isa {
            return Err(CodeCacheError::IsaMismatch {
                expected: self.isa,
                found: stub.isa,
            });
        }
        let memory = ExecutableMemory::with_code(&stub.code)?;
        let installed = InstalledStub {
            memory,
            code_size: stub.code.len(),
            method: method as *const Method as usize,
            shorty: stub.shorty.clone(),
            kind: stub.kind,
        };
        let entry = installed.entry_point();
        if let Some(manager) = &self.fault_manager {
            manager.register_code(entry..entry + installed.code_size, installed.method);
        }
        if let Some(old) = self.stubs.insert(method.method_index(), installed) {
            debug!(method = method.method_index(), old = old.entry_point(), "retiring replaced stub");
            if let Some(manager) = &self.fault_manager {
                manager.unregister_code(old.entry_point());
            }
            self.retired.push(old);
        }
        method.set_entry_point_from_quick(entry);
        info!(
            method = method.method_index(),
            shorty = %stub.shorty,
            kind = ?stub.kind,
            entry = format_args!("{:#x}", entry),
            size = stub.code.len(),
            "installed JNI stub"
        );
        Ok(entry)
    }

    pub fn entry_point(&self, method_index: u32) -> Option<usize> {
        self.stubs.get(&method_index).map(InstalledStub::entry_point)
    }

    pub fn stub(&self, method_index: u32) -> Option<&InstalledStub> {
        self.stubs.get(&method_index)
    }

    /// The method index whose live stub contains `pc`.
    pub fn lookup_pc(&self, pc: usize) -> Option<u32> {
        self.stubs
            .iter()
            .find(|(_, stub)| stub.contains(pc))
            .map(|(&index, _)| index)
    }

    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Unmap replaced stubs. No mutator can be inside one while all of them
    /// are suspended.
    pub fn release_retired(&mut self, _suspended: &MutatorsSuspended) -> usize {
        let released = self.retired.len();
        self.retired.clear();
        if released > 0 {
            debug!(released, "released retired stubs");
        }
        released
    }
}
