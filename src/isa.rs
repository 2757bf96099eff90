//! Instruction sets, pointer widths and per-ISA capability descriptors.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stack bytes reserved below the stack end for implicit overflow checks.
const STACK_OVERFLOW_RESERVED_BYTES: usize = 8 * 1024;

/// Target instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionSet {
    Arm,
    Arm64,
    X86,
    X86_64,
    Riscv64,
}

/// Width of a native pointer in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum PointerSize {
    K32 = 4,
    K64 = 8,
}

impl PointerSize {
    pub fn bytes(self) -> usize {
        self as usize
    }

    /// Pointer size of the machine running this process.
    pub fn host() -> Self {
        if cfg!(target_pointer_width = "64") {
            PointerSize::K64
        } else {
            PointerSize::K32
        }
    }
}

impl InstructionSet {
    pub const ALL: [InstructionSet; 5] = [
        InstructionSet::Arm,
        InstructionSet::Arm64,
        InstructionSet::X86,
        InstructionSet::X86_64,
        InstructionSet::Riscv64,
    ];

    /// The instruction set this binary was built for, if supported.
    pub fn runtime() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(InstructionSet::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(InstructionSet::Arm64)
        } else if cfg!(target_arch = "x86") {
            Some(InstructionSet::X86)
        } else if cfg!(target_arch = "arm") {
            Some(InstructionSet::Arm)
        } else if cfg!(target_arch = "riscv64") {
            Some(InstructionSet::Riscv64)
        } else {
            None
        }
    }

    pub fn pointer_size(self) -> PointerSize {
        match self {
            InstructionSet::Arm | InstructionSet::X86 => PointerSize::K32,
            InstructionSet::Arm64 | InstructionSet::X86_64 | InstructionSet::Riscv64 => {
                PointerSize::K64
            }
        }
    }

    pub fn is_64bit(self) -> bool {
        self.pointer_size() == PointerSize::K64
    }

    /// Number of general-purpose registers visible to the register allocator.
    pub fn core_register_count(self) -> usize {
        match self {
            InstructionSet::X86 => 8,
            InstructionSet::Arm | InstructionSet::X86_64 => 16,
            InstructionSet::Arm64 | InstructionSet::Riscv64 => 32,
        }
    }

    /// Bytes below the stack pointer probed by the implicit stack overflow check.
    pub fn stack_overflow_reserved_bytes(self) -> usize {
        STACK_OVERFLOW_RESERVED_BYTES
    }

    /// Required alignment of a managed frame.
    pub fn stack_alignment(self) -> usize {
        16
    }

    pub fn name(self) -> &'static str {
        match self {
            InstructionSet::Arm => "arm",
            InstructionSet::Arm64 => "arm64",
            InstructionSet::X86 => "x86",
            InstructionSet::X86_64 => "x86_64",
            InstructionSet::Riscv64 => "riscv64",
        }
    }
}

impl fmt::Display for InstructionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for InstructionSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "arm" | "thumb2" => Ok(InstructionSet::Arm),
            "arm64" | "aarch64" => Ok(InstructionSet::Arm64),
            "x86" => Ok(InstructionSet::X86),
            "x86_64" | "x86-64" => Ok(InstructionSet::X86_64),
            "riscv64" => Ok(InstructionSet::Riscv64),
            other => Err(format!("unknown instruction set: {}", other)),
        }
    }
}

/// Optional capabilities that change which fast paths a backend may emit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionSetFeatures {
    /// ARMv8.1 Large System Extensions (`cas*` instructions).
    #[serde(default)]
    pub has_lse_atomics: bool,
    /// AVX/AVX2 on x86 (no effect on JNI glue today).
    #[serde(default)]
    pub has_avx2: bool,
    /// Zbb bit-manipulation extension on RISC-V.
    #[serde(default)]
    pub has_zbb: bool,
}

impl InstructionSetFeatures {
    /// Parse a comma-separated feature list such as `"lse,avx2"`.
    ///
    /// `"default"` and the empty string produce the baseline feature set.
    pub fn from_variant_string(isa: InstructionSet, s: &str) -> Result<Self, String> {
        let mut features = InstructionSetFeatures::default();
        for item in s.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match (isa, item) {
                (_, "default") => {}
                (InstructionSet::Arm64, "lse" | "atomics") => features.has_lse_atomics = true,
                (InstructionSet::X86 | InstructionSet::X86_64, "avx2") => features.has_avx2 = true,
                (InstructionSet::Riscv64, "zbb") => features.has_zbb = true,
                (isa, other) => {
                    return Err(format!("unknown feature '{}' for {}", other, isa));
                }
            }
        }
        Ok(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_sizes() {
        assert_eq!(InstructionSet::X86.pointer_size().bytes(), 4);
        assert_eq!(InstructionSet::X86_64.pointer_size().bytes(), 8);
        assert_eq!(InstructionSet::Arm64.pointer_size(), PointerSize::K64);
    }

    #[test]
    fn test_parse_roundtrip_names() {
        for isa in InstructionSet::ALL {
            assert_eq!(isa.name().parse::<InstructionSet>().unwrap(), isa);
        }
        assert!("mips".parse::<InstructionSet>().is_err());
    }

    #[test]
    fn test_feature_strings() {
        let f = InstructionSetFeatures::from_variant_string(InstructionSet::Arm64, "lse").unwrap();
        assert!(f.has_lse_atomics);
        let f = InstructionSetFeatures::from_variant_string(InstructionSet::X86_64, "default")
            .unwrap();
        assert_eq!(f, InstructionSetFeatures::default());
        assert!(InstructionSetFeatures::from_variant_string(InstructionSet::X86_64, "lse").is_err());
    }
}
