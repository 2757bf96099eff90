//! Code buffer for building machine code.
//!
//! Bytes are appended as instructions are encoded. Branch targets are
//! labels kept in an index-addressed arena; every branch records a fix-up
//! that is resolved by `resolve_label_refs` once all labels are bound.

use thiserror::Error;

/// Index of a label inside one `CodeBuffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(pub u32);

/// Kind of branch displacement to patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceSize {
    /// x86 32-bit displacement relative to the end of the field.
    Rel32,
    /// AArch64 B/BL: 26-bit word offset in bits 25:0.
    AArch64Imm26,
    /// AArch64 B.cond/CBZ/CBNZ: 19-bit word offset in bits 23:5.
    AArch64Imm19,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodeBufferError {
    #[error("label {0} referenced but never bound")]
    UnboundLabel(u32),
    #[error("branch to label {0} out of range")]
    OutOfRange(u32),
}

/// A buffer for building machine code.
pub struct CodeBuffer {
    code: Vec<u8>,
    /// Bound position of each label, `None` while unbound.
    labels: Vec<Option<usize>>,
    /// Pending references: (field offset, label, kind)
    label_refs: Vec<(usize, LabelId, ReferenceSize)>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
            labels: Vec::new(),
            label_refs: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Current emission offset.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Allocate a new unbound label.
    pub fn new_label(&mut self) -> LabelId {
        let id = LabelId(self.labels.len() as u32);
        self.labels.push(None);
        id
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    /// Bind a label to the current position.
    ///
    /// Panics if the label is already bound.
    pub fn bind_label(&mut self, label: LabelId) {
        let pos = self.code.len();
        let slot = &mut self.labels[label.0 as usize];
        assert!(slot.is_none(), "label {} bound twice", label.0);
        *slot = Some(pos);
    }

    pub fn label_position(&self, label: LabelId) -> Option<usize> {
        self.labels.get(label.0 as usize).copied().flatten()
    }

    /// Record a reference to `label` at the current offset.
    ///
    /// For `Rel32` four placeholder bytes are emitted. For the AArch64 kinds
    /// the instruction word (with a zero offset field) must be emitted by the
    /// caller right after this call.
    pub fn emit_label_ref(&mut self, label: LabelId, size: ReferenceSize) {
        let offset = self.code.len();
        self.label_refs.push((offset, label, size));
        if size == ReferenceSize::Rel32 {
            self.emit_u32(0);
        }
    }

    /// Patch all label references.
    pub fn resolve_label_refs(&mut self) -> Result<(), CodeBufferError> {
        for (offset, label, size) in std::mem::take(&mut self.label_refs) {
            let target = self
                .label_position(label)
                .ok_or(CodeBufferError::UnboundLabel(label.0))?;

            match size {
                ReferenceSize::Rel32 => {
                    let rel = (target as i64) - (offset as i64 + 4);
                    let rel = i32::try_from(rel).map_err(|_| CodeBufferError::OutOfRange(label.0))?;
                    self.code[offset..offset + 4].copy_from_slice(&rel.to_le_bytes());
                }
                ReferenceSize::AArch64Imm26 => {
                    let rel = ((target as i64) - (offset as i64)) / 4;
                    if !(-(1 << 25)..(1 << 25)).contains(&rel) {
                        return Err(CodeBufferError::OutOfRange(label.0));
                    }
                    let inst = self.read_u32(offset);
                    let inst = (inst & 0xFC00_0000) | ((rel as u32) & 0x03FF_FFFF);
                    self.code[offset..offset + 4].copy_from_slice(&inst.to_le_bytes());
                }
                ReferenceSize::AArch64Imm19 => {
                    let rel = ((target as i64) - (offset as i64)) / 4;
                    if !(-(1 << 18)..(1 << 18)).contains(&rel) {
                        return Err(CodeBufferError::OutOfRange(label.0));
                    }
                    let inst = self.read_u32(offset);
                    let inst = (inst & 0xFF00_001F) | (((rel as u32) & 0x7FFFF) << 5);
                    self.code[offset..offset + 4].copy_from_slice(&inst.to_le_bytes());
                }
            }
        }
        Ok(())
    }

    fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.code[offset],
            self.code[offset + 1],
            self.code[offset + 2],
            self.code[offset + 3],
        ])
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Consume the buffer and return the raw code bytes.
    /// Label references are not patched; call `resolve_label_refs` first.
    pub fn into_code(self) -> Vec<u8> {
        self.code
    }

    /// Pad with `fill` up to the given power-of-two boundary.
    pub fn align(&mut self, alignment: usize, fill: u8) {
        let current = self.code.len();
        let aligned = (current + alignment - 1) & !(alignment - 1);
        self.code.resize(aligned, fill);
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}
