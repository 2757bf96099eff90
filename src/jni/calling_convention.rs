//! Managed and native calling conventions for JNI stubs.
//!
//! Managed code passes the method in a fixed register and the arguments in
//! registers, and reserves an 8-byte home slot for every argument in the
//! caller's outgoing area, right after the method slot. Native code follows
//! the platform C ABI (System V on x86-64, AAPCS64 on ARM64).

use thiserror::Error;

use crate::isa::InstructionSet;
use crate::jit::aarch64::{self, VReg};
use crate::jit::x86_64::{self, Xmm};
use crate::jni::{ArgumentLocation, Arm64ManagedRegister, ManagedRegister, X86_64ManagedRegister};
use crate::offsets::FrameOffset;

/// Bytes per managed home slot and per native stack argument.
const SLOT_SIZE: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShortyError {
    #[error("empty shorty")]
    Empty,
    #[error("invalid type character '{0}' in shorty")]
    InvalidChar(char),
    #[error("void is only valid as a return type")]
    VoidParameter,
}

/// Which native-method flavor a stub serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JniKind {
    /// Full transition to Native and back.
    Normal,
    /// `@FastNative`: stays Runnable, polls for suspension on return.
    Fast,
    /// `@CriticalNative`: static, primitive-only, no `JNIEnv` or class.
    Critical,
}

/// Method signature in shorty form: return type, then parameter types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shorty {
    ret: char,
    params: Vec<char>,
}

impl Shorty {
    pub fn parse(s: &str) -> Result<Self, ShortyError> {
        let mut chars = s.chars();
        let ret = chars.next().ok_or(ShortyError::Empty)?;
        if !is_type_char(ret) && ret != 'V' {
            return Err(ShortyError::InvalidChar(ret));
        }
        let params = chars
            .map(|c| match c {
                'V' => Err(ShortyError::VoidParameter),
                c if is_type_char(c) => Ok(c),
                c => Err(ShortyError::InvalidChar(c)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Shorty { ret, params })
    }

    pub fn return_type(&self) -> char {
        self.ret
    }

    pub fn params(&self) -> &[char] {
        &self.params
    }

    pub fn has_references(&self) -> bool {
        self.ret == 'L' || self.params.contains(&'L')
    }
}

fn is_type_char(c: char) -> bool {
    matches!(c, 'Z' | 'B' | 'C' | 'S' | 'I' | 'J' | 'F' | 'D' | 'L')
}

fn is_fp(c: char) -> bool {
    matches!(c, 'F' | 'D')
}

/// Size of a value of type `c` in managed code.
pub fn managed_size(c: char) -> usize {
    match c {
        'J' | 'D' => 8,
        'V' => 0,
        _ => 4,
    }
}

/// Size of a value of type `c` in native code; references become `jobject`.
pub fn native_size(c: char) -> usize {
    match c {
        'J' | 'D' | 'L' => 8,
        'V' => 0,
        _ => 4,
    }
}

/// Per-ISA register assignment and frame shape of a JNI stub.
#[derive(Debug, Clone)]
pub struct Abi {
    pub isa: InstructionSet,
    pub method_register: ManagedRegister,
    managed_core_args: Vec<ManagedRegister>,
    managed_fp_args: Vec<ManagedRegister>,
    native_core_args: Vec<ManagedRegister>,
    native_fp_args: Vec<ManagedRegister>,
    pub callee_save_registers: Vec<ManagedRegister>,
    /// Callee-saves the stub may clobber between frame build and removal.
    pub callee_save_scratch: [ManagedRegister; 3],
    /// Carries the method to `@CriticalNative` code.
    pub hidden_arg_register: ManagedRegister,
    pub frame_size: usize,
}

impl Abi {
    pub fn for_isa(isa: InstructionSet) -> Option<Abi> {
        match isa {
            InstructionSet::X86_64 => Some(Self::x86_64()),
            InstructionSet::Arm64 => Some(Self::arm64()),
            _ => None,
        }
    }

    fn x86_64() -> Abi {
        use x86_64::Reg::*;
        let cpu = X86_64ManagedRegister::from_cpu;
        let xmm = |n| X86_64ManagedRegister::from_xmm(Xmm(n));
        let mut callee_saves: Vec<_> = [Rbx, Rbp, R12, R13, R14, R15].into_iter().map(cpu).collect();
        callee_saves.extend((12..16).map(xmm));
        Abi {
            isa: InstructionSet::X86_64,
            method_register: cpu(Rdi),
            managed_core_args: [Rsi, Rdx, Rcx, R8, R9].into_iter().map(cpu).collect(),
            managed_fp_args: (0..8).map(xmm).collect(),
            native_core_args: [Rdi, Rsi, Rdx, Rcx, R8, R9].into_iter().map(cpu).collect(),
            native_fp_args: (0..8).map(xmm).collect(),
            callee_save_registers: callee_saves,
            callee_save_scratch: [cpu(Rbx), cpu(Rbp), cpu(R12)],
            hidden_arg_register: cpu(Rax),
            // Return address, six pushes, four XMM spills, method and
            // return-value slots, padded to 16.
            frame_size: 112,
        }
    }

    fn arm64() -> Abi {
        let x = |n: u8| Arm64ManagedRegister::from_x(aarch64::Reg::from_index(n));
        let d = |n: u8| Arm64ManagedRegister::from_d(VReg(n));
        let mut callee_saves: Vec<_> = (19..=30).map(x).collect();
        callee_saves.extend((8..16).map(d));
        Abi {
            isa: InstructionSet::Arm64,
            method_register: x(0),
            managed_core_args: (1..8).map(x).collect(),
            managed_fp_args: (0..8).map(d).collect(),
            native_core_args: (0..8).map(x).collect(),
            native_fp_args: (0..8).map(d).collect(),
            callee_save_registers: callee_saves,
            callee_save_scratch: [x(21), x(22), x(23)],
            hidden_arg_register: x(15),
            // Method and return-value slots, X19-X30, D8-D15.
            frame_size: 176,
        }
    }

    /// The view of `reg` for a `size`-byte value.
    pub fn sized(&self, reg: ManagedRegister, size: usize) -> ManagedRegister {
        match self.isa {
            InstructionSet::Arm64 => {
                let view = reg.as_arm64();
                match (view.is_core_register(), size) {
                    (true, 8) => view.as_overlapping_x(),
                    (true, _) => view.as_overlapping_w(),
                    (false, 8) => Arm64ManagedRegister::from_d(view.as_vreg()),
                    (false, _) => Arm64ManagedRegister::from_s(view.as_vreg()),
                }
            }
            _ => reg,
        }
    }

    /// First native integer argument register.
    pub fn first_native_arg(&self) -> ManagedRegister {
        self.native_core_args[0]
    }

    /// Where native code returns a value of type `ret`, sized for it.
    pub fn return_register(&self, ret: char) -> ManagedRegister {
        let size = native_size(ret);
        match ret {
            'V' => ManagedRegister::no_register(),
            'F' | 'D' => self.sized(self.native_fp_args[0], size),
            _ => match self.isa {
                InstructionSet::X86_64 => X86_64ManagedRegister::from_cpu(x86_64::Reg::Rax),
                _ => self.sized(self.native_core_args[0], size),
            },
        }
    }
}

/// Managed arguments of a method, receiver first.
#[derive(Debug, Clone)]
pub struct ManagedArgs {
    pub types: Vec<char>,
    pub locations: Vec<ArgumentLocation>,
    /// Home slot of each argument.
    pub slots: Vec<FrameOffset>,
    /// Home slot for references, `INVALID_REFERENCE` otherwise.
    pub refs: Vec<FrameOffset>,
}

impl ManagedArgs {
    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Arguments that arrive in registers, with their home slots.
    pub fn in_registers(&self) -> impl Iterator<Item = (ManagedRegister, FrameOffset, usize)> + '_ {
        self.locations.iter().zip(&self.slots).filter_map(|(loc, &slot)| match *loc {
            ArgumentLocation::Register { reg, size } => Some((reg, slot, size)),
            ArgumentLocation::Stack { .. } => None,
        })
    }
}

/// Lay out the managed arguments. `caller_area` is the offset, from the
/// stub's current SP, of the caller's outgoing area (the method slot).
pub fn managed_arguments(abi: &Abi, shorty: &Shorty, is_static: bool, caller_area: usize) -> ManagedArgs {
    let mut types = Vec::new();
    if !is_static {
        types.push('L');
    }
    types.extend_from_slice(shorty.params());

    let (mut core, mut fp) = (0, 0);
    let mut locations = Vec::with_capacity(types.len());
    let mut slots = Vec::with_capacity(types.len());
    let mut refs = Vec::with_capacity(types.len());
    for (i, &c) in types.iter().enumerate() {
        let size = managed_size(c);
        let slot = FrameOffset(caller_area + SLOT_SIZE * (i + 1));
        let reg = if is_fp(c) {
            fp += 1;
            abi.managed_fp_args.get(fp - 1)
        } else {
            core += 1;
            abi.managed_core_args.get(core - 1)
        };
        locations.push(match reg {
            Some(&reg) => ArgumentLocation::register(abi.sized(reg, size), size),
            None => ArgumentLocation::stack(slot, size),
        });
        slots.push(slot);
        refs.push(if c == 'L' { slot } else { FrameOffset::INVALID_REFERENCE });
    }
    ManagedArgs { types, locations, slots, refs }
}

/// Native argument locations for one stub.
#[derive(Debug, Clone)]
pub struct NativeArgs {
    pub env: Option<ArgumentLocation>,
    /// `jclass` of a static method.
    pub class: Option<ArgumentLocation>,
    /// One per managed argument, in the same order.
    pub args: Vec<ArgumentLocation>,
    pub hidden: Option<ArgumentLocation>,
    /// Stack space for native arguments, 16-byte aligned.
    pub out_args_size: usize,
}

pub fn native_arguments(abi: &Abi, shorty: &Shorty, is_static: bool, kind: JniKind) -> NativeArgs {
    let mut types = Vec::new();
    if !is_static {
        types.push('L');
    }
    types.extend_from_slice(shorty.params());

    let (mut core, mut fp, mut stack) = (0, 0, 0);
    let mut next = |c: char| {
        let size = native_size(c);
        let reg = if is_fp(c) {
            fp += 1;
            abi.native_fp_args.get(fp - 1)
        } else {
            core += 1;
            abi.native_core_args.get(core - 1)
        };
        match reg {
            Some(&reg) => ArgumentLocation::register(abi.sized(reg, size), size),
            None => {
                stack += 1;
                ArgumentLocation::stack(FrameOffset(SLOT_SIZE * (stack - 1)), size)
            }
        }
    };

    let critical = kind == JniKind::Critical;
    let env = (!critical).then(|| next('J'));
    let class = (is_static && !critical).then(|| next('J'));
    let args: Vec<_> = types.iter().map(|&c| next(c)).collect();
    let hidden = critical.then(|| ArgumentLocation::register(abi.hidden_arg_register, 8));
    let out_args_size = (SLOT_SIZE * stack).next_multiple_of(16);
    NativeArgs { env, class, args, hidden, out_args_size }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shorty_parse() {
        let s = Shorty::parse("ILJ").unwrap();
        assert_eq!(s.return_type(), 'I');
        assert_eq!(s.params(), &['L', 'J']);
        assert!(s.has_references());
        assert_eq!(Shorty::parse(""), Err(ShortyError::Empty));
        assert_eq!(Shorty::parse("IV"), Err(ShortyError::VoidParameter));
        assert_eq!(Shorty::parse("IQ"), Err(ShortyError::InvalidChar('Q')));
        assert!(!Shorty::parse("VIDF").unwrap().has_references());
    }

    #[test]
    fn test_x86_64_managed_layout() {
        let abi = Abi::for_isa(InstructionSet::X86_64).unwrap();
        let shorty = Shorty::parse("VIJLDIII").unwrap();
        let args = managed_arguments(&abi, &shorty, false, 200);
        assert_eq!(args.len(), 8);
        // this, I, J, L, D go to RSI, RDX, RCX, R8, XMM0.
        assert_eq!(args.locations[0], ArgumentLocation::register(X86_64ManagedRegister::from_cpu(x86_64::Reg::Rsi), 4));
        assert_eq!(args.locations[4], ArgumentLocation::register(X86_64ManagedRegister::from_xmm(Xmm(0)), 8));
        // The sixth core argument is out of registers.
        assert_eq!(args.locations[6], ArgumentLocation::stack(FrameOffset(200 + 7 * 8), 4));
        assert_eq!(args.refs[0], FrameOffset(208));
        assert_eq!(args.refs[3], FrameOffset(232));
        assert_eq!(args.refs[1], FrameOffset::INVALID_REFERENCE);
        assert_eq!(args.in_registers().count(), 6);
    }

    #[test]
    fn test_x86_64_native_layout() {
        let abi = Abi::for_isa(InstructionSet::X86_64).unwrap();
        let shorty = Shorty::parse("LIIIIIJ").unwrap();
        let native = native_arguments(&abi, &shorty, true, JniKind::Normal);
        let cpu = X86_64ManagedRegister::from_cpu;
        assert_eq!(native.env, Some(ArgumentLocation::register(cpu(x86_64::Reg::Rdi), 8)));
        assert_eq!(native.class, Some(ArgumentLocation::register(cpu(x86_64::Reg::Rsi), 8)));
        assert_eq!(native.args[3], ArgumentLocation::register(cpu(x86_64::Reg::R9), 4));
        assert_eq!(native.args[4], ArgumentLocation::stack(FrameOffset(0), 4));
        assert_eq!(native.args[5], ArgumentLocation::stack(FrameOffset(8), 8));
        assert_eq!(native.out_args_size, 16);
        assert!(native.hidden.is_none());
    }

    #[test]
    fn test_arm64_views_and_critical() {
        let abi = Abi::for_isa(InstructionSet::Arm64).unwrap();
        let shorty = Shorty::parse("FIFJ").unwrap();
        let native = native_arguments(&abi, &shorty, true, JniKind::Critical);
        assert!(native.env.is_none() && native.class.is_none());
        let w0 = Arm64ManagedRegister::from_w(aarch64::Reg::X0);
        let s0 = Arm64ManagedRegister::from_s(VReg(0));
        let x1 = Arm64ManagedRegister::from_x(aarch64::Reg::X1);
        assert_eq!(native.args, vec![
            ArgumentLocation::register(w0, 4),
            ArgumentLocation::register(s0, 4),
            ArgumentLocation::register(x1, 8),
        ]);
        assert_eq!(native.hidden, Some(ArgumentLocation::register(Arm64ManagedRegister::from_x(aarch64::Reg::X15), 8)));
        assert_eq!(native.out_args_size, 0);
        assert_eq!(abi.return_register('F'), s0);
        assert_eq!(abi.return_register('L'), Arm64ManagedRegister::from_x(aarch64::Reg::X0));
        assert_eq!(abi.return_register('I'), w0);
    }

    #[test]
    fn test_frame_sizes_hold_callee_saves() {
        for isa in [InstructionSet::X86_64, InstructionSet::Arm64] {
            let abi = Abi::for_isa(isa).unwrap();
            assert_eq!(abi.frame_size % 16, 0);
            // Method and return-value slots stay below the callee saves.
            assert!(abi.callee_save_registers.len() * 8 + 16 <= abi.frame_size);
        }
        assert!(Abi::for_isa(InstructionSet::Riscv64).is_none());
    }
}
