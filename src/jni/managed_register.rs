//! ISA-independent register handles and their per-ISA views.
//!
//! A `ManagedRegister` is just an id. The id ranges below give it meaning
//! for a particular backend:
//!
//! - x86-64: `0..16` CPU registers, `16..32` XMM registers
//! - ARM64: `0..32` X registers (31 is SP), `32..64` W registers,
//!   `64..96` D registers, `96..128` S registers

use std::fmt;

use crate::jit::aarch64::{self, VReg};
use crate::jit::x86_64::{self, Xmm};

const NO_REGISTER: i32 = -1;

/// Opaque register handle shared by every backend.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManagedRegister {
    id: i32,
}

impl ManagedRegister {
    pub const fn new(id: i32) -> Self {
        Self { id }
    }

    /// The universal "no register" sentinel.
    pub const fn no_register() -> Self {
        Self { id: NO_REGISTER }
    }

    pub fn is_register(self) -> bool {
        self.id != NO_REGISTER
    }

    pub fn is_no_register(self) -> bool {
        self.id == NO_REGISTER
    }

    pub fn id(self) -> i32 {
        self.id
    }

    pub fn as_x86_64(self) -> X86_64ManagedRegister {
        assert!(
            self.is_no_register() || (0..X86_64ManagedRegister::COUNT).contains(&self.id),
            "{:?} is not an x86-64 register",
            self
        );
        X86_64ManagedRegister(self)
    }

    pub fn as_arm64(self) -> Arm64ManagedRegister {
        assert!(
            self.is_no_register() || (0..Arm64ManagedRegister::COUNT).contains(&self.id),
            "{:?} is not an ARM64 register",
            self
        );
        Arm64ManagedRegister(self)
    }
}

impl fmt::Debug for ManagedRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_no_register() {
            write!(f, "NoRegister")
        } else {
            write!(f, "ManagedRegister({})", self.id)
        }
    }
}

/// x86-64 view of a `ManagedRegister`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X86_64ManagedRegister(ManagedRegister);

impl X86_64ManagedRegister {
    const CPU_COUNT: i32 = 16;
    const XMM_COUNT: i32 = 16;
    const COUNT: i32 = Self::CPU_COUNT + Self::XMM_COUNT;

    pub fn from_cpu(reg: x86_64::Reg) -> ManagedRegister {
        ManagedRegister::new(reg as i32)
    }

    pub fn from_xmm(reg: Xmm) -> ManagedRegister {
        assert!((reg.0 as i32) < Self::XMM_COUNT);
        ManagedRegister::new(Self::CPU_COUNT + reg.0 as i32)
    }

    pub fn is_no_register(self) -> bool {
        self.0.is_no_register()
    }

    pub fn is_cpu_register(self) -> bool {
        (0..Self::CPU_COUNT).contains(&self.0.id)
    }

    pub fn is_xmm_register(self) -> bool {
        (Self::CPU_COUNT..Self::COUNT).contains(&self.0.id)
    }

    pub fn as_cpu(self) -> x86_64::Reg {
        assert!(self.is_cpu_register(), "{:?} is not a CPU register", self.0);
        x86_64::Reg::from_index(self.0.id as usize)
    }

    pub fn as_xmm(self) -> Xmm {
        assert!(self.is_xmm_register(), "{:?} is not an XMM register", self.0);
        Xmm((self.0.id - Self::CPU_COUNT) as u8)
    }

    /// Register number inside its class, used for move bitmasks.
    pub fn mask_bit(self) -> u32 {
        if self.is_cpu_register() {
            1 << self.0.id
        } else {
            (1 << 16) << (self.0.id - Self::CPU_COUNT)
        }
    }

    /// x86-64 makes no distinction between sub-registers, so overlap is equality.
    pub fn overlaps(self, other: X86_64ManagedRegister) -> bool {
        self.0.is_register() && self.0 == other.0
    }
}

/// ARM64 view of a `ManagedRegister`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arm64ManagedRegister(ManagedRegister);

impl Arm64ManagedRegister {
    const X_BASE: i32 = 0;
    const W_BASE: i32 = 32;
    const D_BASE: i32 = 64;
    const S_BASE: i32 = 96;
    const COUNT: i32 = 128;

    pub fn from_x(reg: aarch64::Reg) -> ManagedRegister {
        ManagedRegister::new(Self::X_BASE + reg.code() as i32)
    }

    pub fn from_w(reg: aarch64::Reg) -> ManagedRegister {
        ManagedRegister::new(Self::W_BASE + reg.code() as i32)
    }

    pub fn from_d(reg: VReg) -> ManagedRegister {
        ManagedRegister::new(Self::D_BASE + reg.0 as i32)
    }

    pub fn from_s(reg: VReg) -> ManagedRegister {
        ManagedRegister::new(Self::S_BASE + reg.0 as i32)
    }

    fn in_class(self, base: i32) -> bool {
        (base..base + 32).contains(&self.0.id)
    }

    pub fn is_no_register(self) -> bool {
        self.0.is_no_register()
    }

    pub fn is_x_register(self) -> bool {
        self.in_class(Self::X_BASE)
    }

    pub fn is_w_register(self) -> bool {
        self.in_class(Self::W_BASE)
    }

    pub fn is_d_register(self) -> bool {
        self.in_class(Self::D_BASE)
    }

    pub fn is_s_register(self) -> bool {
        self.in_class(Self::S_BASE)
    }

    pub fn is_core_register(self) -> bool {
        self.is_x_register() || self.is_w_register()
    }

    pub fn is_fp_register(self) -> bool {
        self.is_d_register() || self.is_s_register()
    }

    /// The underlying core register, whichever width this handle names.
    pub fn as_core(self) -> aarch64::Reg {
        assert!(self.is_core_register(), "{:?} is not a core register", self.0);
        aarch64::Reg::from_index((self.0.id % 32) as u8)
    }

    pub fn as_x(self) -> aarch64::Reg {
        assert!(self.is_x_register(), "{:?} is not an X register", self.0);
        self.as_core()
    }

    pub fn as_w(self) -> aarch64::Reg {
        assert!(self.is_w_register(), "{:?} is not a W register", self.0);
        self.as_core()
    }

    pub fn as_vreg(self) -> VReg {
        assert!(self.is_fp_register(), "{:?} is not an FP register", self.0);
        VReg((self.0.id % 32) as u8)
    }

    pub fn as_overlapping_x(self) -> ManagedRegister {
        Self::from_x(self.as_core())
    }

    pub fn as_overlapping_w(self) -> ManagedRegister {
        Self::from_w(self.as_core())
    }

    /// Two handles overlap when they name the same physical register.
    pub fn overlaps(self, other: Arm64ManagedRegister) -> bool {
        if self.0.is_no_register() || other.0.is_no_register() {
            return false;
        }
        let same_class = (self.is_core_register() && other.is_core_register())
            || (self.is_fp_register() && other.is_fp_register());
        same_class && self.0.id % 32 == other.0.id % 32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_register_predicate() {
        assert!(!ManagedRegister::no_register().is_register());
        for id in 0..128 {
            assert!(ManagedRegister::new(id).is_register());
        }
        assert_eq!(ManagedRegister::no_register(), ManagedRegister::new(-1));
    }

    #[test]
    fn test_x86_64_views() {
        let rdi = X86_64ManagedRegister::from_cpu(x86_64::Reg::Rdi);
        assert!(rdi.as_x86_64().is_cpu_register());
        assert_eq!(rdi.as_x86_64().as_cpu(), x86_64::Reg::Rdi);
        let xmm3 = X86_64ManagedRegister::from_xmm(Xmm(3));
        assert!(xmm3.as_x86_64().is_xmm_register());
        assert_eq!(xmm3.as_x86_64().as_xmm(), Xmm(3));
        assert_eq!(xmm3.as_x86_64().mask_bit(), 1 << 19);
        assert!(!rdi.as_x86_64().overlaps(xmm3.as_x86_64()));
    }

    #[test]
    fn test_arm64_width_views_overlap() {
        let x1 = Arm64ManagedRegister::from_x(aarch64::Reg::X1);
        let w1 = Arm64ManagedRegister::from_w(aarch64::Reg::X1);
        let d1 = Arm64ManagedRegister::from_d(VReg(1));
        assert_ne!(x1, w1);
        assert!(x1.as_arm64().overlaps(w1.as_arm64()));
        assert!(!x1.as_arm64().overlaps(d1.as_arm64()));
        assert_eq!(w1.as_arm64().as_overlapping_x(), x1);
        assert!(Arm64ManagedRegister::from_s(VReg(1)).as_arm64().overlaps(d1.as_arm64()));
    }

    #[test]
    #[should_panic(expected = "not a CPU register")]
    fn test_wrong_accessor_panics() {
        X86_64ManagedRegister::from_xmm(Xmm(0)).as_x86_64().as_cpu();
    }
}
