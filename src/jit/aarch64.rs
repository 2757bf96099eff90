//! AArch64 instruction encoding.
//!
//! Each method emits one fixed-width 32-bit instruction. Load/store
//! offsets use the scaled unsigned-immediate forms, so callers must pass
//! offsets that are multiples of the access size.

use super::codebuf::{CodeBuffer, LabelId, ReferenceSize};

/// AArch64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    X0 = 0, X1 = 1, X2 = 2, X3 = 3,
    X4 = 4, X5 = 5, X6 = 6, X7 = 7,
    X8 = 8, X9 = 9, X10 = 10, X11 = 11,
    X12 = 12, X13 = 13, X14 = 14, X15 = 15,
    X16 = 16, X17 = 17, X18 = 18, X19 = 19,
    X20 = 20, X21 = 21, X22 = 22, X23 = 23,
    X24 = 24, X25 = 25, X26 = 26, X27 = 27,
    X28 = 28,
    Fp = 29,  // Frame pointer
    Lr = 30,  // Link register
    Sp = 31,  // Stack pointer / Zero register (XZR in some contexts)
}

impl Reg {
    /// Alias for SP when used as zero register
    pub const XZR: Reg = Reg::Sp;
    /// Intra-procedure-call scratch registers.
    pub const IP0: Reg = Reg::X16;
    pub const IP1: Reg = Reg::X17;
    /// Holds the current `ManagedThread*` in managed code.
    pub const TR: Reg = Reg::X19;

    const ALL: [Reg; 32] = [
        Reg::X0, Reg::X1, Reg::X2, Reg::X3, Reg::X4, Reg::X5, Reg::X6, Reg::X7,
        Reg::X8, Reg::X9, Reg::X10, Reg::X11, Reg::X12, Reg::X13, Reg::X14, Reg::X15,
        Reg::X16, Reg::X17, Reg::X18, Reg::X19, Reg::X20, Reg::X21, Reg::X22, Reg::X23,
        Reg::X24, Reg::X25, Reg::X26, Reg::X27, Reg::X28, Reg::Fp, Reg::Lr, Reg::Sp,
    ];

    pub fn from_index(index: u8) -> Reg {
        Self::ALL[index as usize]
    }

    pub fn code(self) -> u32 {
        self as u32
    }
}

/// SIMD/FP register v0..v31, used as Dn or Sn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VReg(pub u8);

impl VReg {
    fn code(self) -> u32 {
        self.0 as u32
    }
}

/// AArch64 condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Eq = 0b0000,  // Equal
    Ne = 0b0001,  // Not equal
    Cs = 0b0010,  // Carry set / unsigned higher or same
    Cc = 0b0011,  // Carry clear / unsigned lower
    Mi = 0b0100,  // Minus / negative
    Pl = 0b0101,  // Plus / positive or zero
    Hi = 0b1000,  // Unsigned higher
    Ls = 0b1001,  // Unsigned lower or same
    Ge = 0b1010,  // Signed greater than or equal
    Lt = 0b1011,  // Signed less than
    Gt = 0b1100,  // Signed greater than
    Le = 0b1101,  // Signed less than or equal
}

/// AArch64 assembler.
pub struct AArch64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

fn scaled(offset: u32, scale: u32) -> u32 {
    assert!(
        offset % scale == 0 && offset / scale < 4096,
        "offset {} not encodable with scale {}",
        offset,
        scale
    );
    (offset / scale) << 10
}

fn pair_imm(offset: i32) -> u32 {
    assert!(
        offset % 8 == 0 && (-512..=504).contains(&offset),
        "pair offset {} not encodable",
        offset
    );
    (((offset / 8) as u32) & 0x7F) << 15
}

impl<'a> AArch64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    /// Emit a raw 32-bit instruction.
    pub fn emit_raw(&mut self, inst: u32) {
        self.buf.emit_u32(inst);
    }

    // ==================== Data Processing ====================

    /// ADD Xd, Xn, #imm12 (SP allowed for both operands)
    pub fn add_imm(&mut self, rd: Reg, rn: Reg, imm12: u32) {
        assert!(imm12 < 4096);
        self.emit_raw(0x9100_0000 | (imm12 << 10) | (rn.code() << 5) | rd.code());
    }

    /// SUB Xd, Xn, #imm12
    pub fn sub_imm(&mut self, rd: Reg, rn: Reg, imm12: u32) {
        assert!(imm12 < 4096);
        self.emit_raw(0xD100_0000 | (imm12 << 10) | (rn.code() << 5) | rd.code());
    }

    /// ADD Xd, Xn, #imm for any imm below 2^24, split into shifted halves.
    pub fn add_large_imm(&mut self, rd: Reg, rn: Reg, imm: u32) {
        assert!(imm < (1 << 24), "immediate {} too large", imm);
        let (hi, lo) = (imm >> 12, imm & 0xFFF);
        let mut src = rn;
        if hi != 0 {
            // ADD Xd, Xn, #hi, LSL #12
            self.emit_raw(0x9140_0000 | (hi << 10) | (src.code() << 5) | rd.code());
            src = rd;
        }
        if lo != 0 || hi == 0 {
            self.add_imm(rd, src, lo);
        }
    }

    /// SUB Xd, Xn, #imm for any imm below 2^24.
    pub fn sub_large_imm(&mut self, rd: Reg, rn: Reg, imm: u32) {
        assert!(imm < (1 << 24), "immediate {} too large", imm);
        let (hi, lo) = (imm >> 12, imm & 0xFFF);
        let mut src = rn;
        if hi != 0 {
            self.emit_raw(0xD140_0000 | (hi << 10) | (src.code() << 5) | rd.code());
            src = rd;
        }
        if lo != 0 || hi == 0 {
            self.sub_imm(rd, src, lo);
        }
    }

    /// AND Xd, Xn, Xm
    pub fn and(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit_raw(0x8A00_0000 | (rm.code() << 16) | (rn.code() << 5) | rd.code());
    }

    /// ORR Xd, Xn, Xm
    pub fn orr(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit_raw(0xAA00_0000 | (rm.code() << 16) | (rn.code() << 5) | rd.code());
    }

    /// ORR Xd, Xn, #(1 << bit)
    pub fn orr_bit(&mut self, rd: Reg, rn: Reg, bit: u32) {
        assert!(bit < 64);
        let immr = (64 - bit) % 64;
        self.emit_raw(0xB240_0000 | (immr << 16) | (rn.code() << 5) | rd.code());
    }

    /// AND Xd, Xn, #~((1 << bits) - 1): clear the low `bits` bits.
    pub fn and_clear_low(&mut self, rd: Reg, rn: Reg, bits: u32) {
        assert!((1..64).contains(&bits));
        let immr = 64 - bits;
        let imms = 63 - bits;
        self.emit_raw(0x9240_0000 | (immr << 16) | (imms << 10) | (rn.code() << 5) | rd.code());
    }

    /// MOV Xd, Xm (register to register)
    pub fn mov(&mut self, rd: Reg, rm: Reg) {
        if rd == Reg::Sp || rm == Reg::Sp {
            // ORR treats 31 as XZR; moves to or from SP go through ADD.
            self.add_imm(rd, rm, 0);
        } else {
            self.orr(rd, Reg::XZR, rm);
        }
    }

    /// MOV Wd, Wm
    pub fn mov_w(&mut self, rd: Reg, rm: Reg) {
        self.emit_raw(0x2A00_03E0 | (rm.code() << 16) | rd.code());
    }

    /// MOVZ Xd, #imm16, LSL #(hw * 16)
    pub fn movz(&mut self, rd: Reg, imm16: u16, hw: u32) {
        self.emit_raw(0xD280_0000 | (hw << 21) | ((imm16 as u32) << 5) | rd.code());
    }

    /// MOVK Xd, #imm16, LSL #(hw * 16)
    pub fn movk(&mut self, rd: Reg, imm16: u16, hw: u32) {
        self.emit_raw(0xF280_0000 | (hw << 21) | ((imm16 as u32) << 5) | rd.code());
    }

    /// MOVZ Wd, #imm16, LSL #(hw * 16)
    pub fn movz_w(&mut self, rd: Reg, imm16: u16, hw: u32) {
        assert!(hw < 2);
        self.emit_raw(0x5280_0000 | (hw << 21) | ((imm16 as u32) << 5) | rd.code());
    }

    /// Materialize a 32-bit constant that has at most one non-zero half.
    pub fn mov_imm32(&mut self, rd: Reg, value: u32) {
        if value & 0xFFFF == 0 && value != 0 {
            self.movz_w(rd, (value >> 16) as u16, 1);
        } else {
            self.movz_w(rd, value as u16, 0);
            if value >> 16 != 0 {
                // MOVK Wd, #imm16, LSL #16
                self.emit_raw(0x72A0_0000 | ((value >> 16) << 5) | rd.code());
            }
        }
    }

    /// Materialize a 64-bit constant with MOVZ + MOVK.
    pub fn mov_imm64(&mut self, rd: Reg, value: u64) {
        let mut first = true;
        for hw in 0..4 {
            let half = ((value >> (hw * 16)) & 0xFFFF) as u16;
            if half == 0 {
                continue;
            }
            if first {
                self.movz(rd, half, hw);
                first = false;
            } else {
                self.movk(rd, half, hw);
            }
        }
        if first {
            self.movz(rd, 0, 0);
        }
    }

    /// SXTB Xd, Wn
    pub fn sxtb(&mut self, rd: Reg, rn: Reg) {
        self.emit_raw(0x9340_1C00 | (rn.code() << 5) | rd.code());
    }

    /// SXTH Xd, Wn
    pub fn sxth(&mut self, rd: Reg, rn: Reg) {
        self.emit_raw(0x9340_3C00 | (rn.code() << 5) | rd.code());
    }

    /// UXTB Wd, Wn
    pub fn uxtb(&mut self, rd: Reg, rn: Reg) {
        self.emit_raw(0x5300_1C00 | (rn.code() << 5) | rd.code());
    }

    /// UXTH Wd, Wn
    pub fn uxth(&mut self, rd: Reg, rn: Reg) {
        self.emit_raw(0x5300_3C00 | (rn.code() << 5) | rd.code());
    }

    /// FMOV Dd, Dn
    pub fn fmov_d(&mut self, rd: VReg, rn: VReg) {
        self.emit_raw(0x1E60_4000 | (rn.code() << 5) | rd.code());
    }

    /// FMOV Sd, Sn
    pub fn fmov_s(&mut self, rd: VReg, rn: VReg) {
        self.emit_raw(0x1E20_4000 | (rn.code() << 5) | rd.code());
    }

    // ==================== Comparison ====================

    /// CMP Wn, #imm12
    pub fn cmp_w_imm(&mut self, rn: Reg, imm12: u32) {
        assert!(imm12 < 4096);
        self.emit_raw(0x7100_001F | (imm12 << 10) | (rn.code() << 5));
    }

    /// CMP Wn, Wm
    pub fn cmp_w(&mut self, rn: Reg, rm: Reg) {
        self.emit_raw(0x6B00_001F | (rm.code() << 16) | (rn.code() << 5));
    }

    /// TST Wn, Wm
    pub fn tst_w(&mut self, rn: Reg, rm: Reg) {
        self.emit_raw(0x6A00_001F | (rm.code() << 16) | (rn.code() << 5));
    }

    /// TST Xn, Xm
    pub fn tst(&mut self, rn: Reg, rm: Reg) {
        self.emit_raw(0xEA00_001F | (rm.code() << 16) | (rn.code() << 5));
    }

    /// TST Wn, #(1 << bit)
    pub fn tst_w_bit(&mut self, rn: Reg, bit: u32) {
        assert!(bit < 32);
        let immr = (32 - bit) % 32;
        self.emit_raw(0x7200_001F | (immr << 16) | (rn.code() << 5));
    }

    /// TST Wn, #((1 << count) - 1)
    pub fn tst_w_low_bits(&mut self, rn: Reg, count: u32) {
        assert!((1..32).contains(&count));
        self.emit_raw(0x7200_001F | ((count - 1) << 10) | (rn.code() << 5));
    }

    /// TST Xn, #(1 << bit)
    pub fn tst_bit(&mut self, rn: Reg, bit: u32) {
        assert!(bit < 64);
        let immr = (64 - bit) % 64;
        self.emit_raw(0xF240_001F | (immr << 16) | (rn.code() << 5));
    }

    // ==================== Memory ====================

    /// STP Xt1, Xt2, [Xn, #imm]!
    pub fn stp_pre(&mut self, rt1: Reg, rt2: Reg, rn: Reg, imm: i32) {
        self.emit_raw(0xA980_0000 | pair_imm(imm) | (rt2.code() << 10) | (rn.code() << 5) | rt1.code());
    }

    /// LDP Xt1, Xt2, [Xn], #imm
    pub fn ldp_post(&mut self, rt1: Reg, rt2: Reg, rn: Reg, imm: i32) {
        self.emit_raw(0xA8C0_0000 | pair_imm(imm) | (rt2.code() << 10) | (rn.code() << 5) | rt1.code());
    }

    /// STP Xt1, Xt2, [Xn, #imm]
    pub fn stp(&mut self, rt1: Reg, rt2: Reg, rn: Reg, imm: i32) {
        self.emit_raw(0xA900_0000 | pair_imm(imm) | (rt2.code() << 10) | (rn.code() << 5) | rt1.code());
    }

    /// LDP Xt1, Xt2, [Xn, #imm]
    pub fn ldp(&mut self, rt1: Reg, rt2: Reg, rn: Reg, imm: i32) {
        self.emit_raw(0xA940_0000 | pair_imm(imm) | (rt2.code() << 10) | (rn.code() << 5) | rt1.code());
    }

    /// STR Xt, [Xn, #offset]
    pub fn str_x(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit_raw(0xF900_0000 | scaled(offset, 8) | (rn.code() << 5) | rt.code());
    }

    /// LDR Xt, [Xn, #offset]
    pub fn ldr_x(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit_raw(0xF940_0000 | scaled(offset, 8) | (rn.code() << 5) | rt.code());
    }

    /// STR Wt, [Xn, #offset]
    pub fn str_w(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit_raw(0xB900_0000 | scaled(offset, 4) | (rn.code() << 5) | rt.code());
    }

    /// LDR Wt, [Xn, #offset]
    pub fn ldr_w(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit_raw(0xB940_0000 | scaled(offset, 4) | (rn.code() << 5) | rt.code());
    }

    /// STRH Wt, [Xn, #offset]
    pub fn strh(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit_raw(0x7900_0000 | scaled(offset, 2) | (rn.code() << 5) | rt.code());
    }

    /// LDRH Wt, [Xn, #offset]
    pub fn ldrh(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit_raw(0x7940_0000 | scaled(offset, 2) | (rn.code() << 5) | rt.code());
    }

    /// STRB Wt, [Xn, #offset]
    pub fn strb(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit_raw(0x3900_0000 | scaled(offset, 1) | (rn.code() << 5) | rt.code());
    }

    /// LDRB Wt, [Xn, #offset]
    pub fn ldrb(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit_raw(0x3940_0000 | scaled(offset, 1) | (rn.code() << 5) | rt.code());
    }

    /// STR Dt, [Xn, #offset]
    pub fn str_d(&mut self, rt: VReg, rn: Reg, offset: u32) {
        self.emit_raw(0xFD00_0000 | scaled(offset, 8) | (rn.code() << 5) | rt.code());
    }

    /// LDR Dt, [Xn, #offset]
    pub fn ldr_d(&mut self, rt: VReg, rn: Reg, offset: u32) {
        self.emit_raw(0xFD40_0000 | scaled(offset, 8) | (rn.code() << 5) | rt.code());
    }

    /// STR St, [Xn, #offset]
    pub fn str_s(&mut self, rt: VReg, rn: Reg, offset: u32) {
        self.emit_raw(0xBD00_0000 | scaled(offset, 4) | (rn.code() << 5) | rt.code());
    }

    /// LDR St, [Xn, #offset]
    pub fn ldr_s(&mut self, rt: VReg, rn: Reg, offset: u32) {
        self.emit_raw(0xBD40_0000 | scaled(offset, 4) | (rn.code() << 5) | rt.code());
    }

    /// STP Dt1, Dt2, [Xn, #imm]
    pub fn stp_d(&mut self, rt1: VReg, rt2: VReg, rn: Reg, imm: i32) {
        self.emit_raw(0x6D00_0000 | pair_imm(imm) | (rt2.code() << 10) | (rn.code() << 5) | rt1.code());
    }

    /// LDP Dt1, Dt2, [Xn, #imm]
    pub fn ldp_d(&mut self, rt1: VReg, rt2: VReg, rn: Reg, imm: i32) {
        self.emit_raw(0x6D40_0000 | pair_imm(imm) | (rt2.code() << 10) | (rn.code() << 5) | rt1.code());
    }

    // ==================== Atomics ====================

    /// LDAXR Wt, [Xn]
    pub fn ldaxr_w(&mut self, rt: Reg, rn: Reg) {
        self.emit_raw(0x885F_FC00 | (rn.code() << 5) | rt.code());
    }

    /// STLXR Ws, Wt, [Xn]
    pub fn stlxr_w(&mut self, rs: Reg, rt: Reg, rn: Reg) {
        self.emit_raw(0x8800_FC00 | (rs.code() << 16) | (rn.code() << 5) | rt.code());
    }

    /// STXR Ws, Wt, [Xn]
    pub fn stxr_w(&mut self, rs: Reg, rt: Reg, rn: Reg) {
        self.emit_raw(0x8800_7C00 | (rs.code() << 16) | (rn.code() << 5) | rt.code());
    }

    /// CASAL Ws, Wt, [Xn] (ARMv8.1 LSE)
    pub fn casal_w(&mut self, rs: Reg, rt: Reg, rn: Reg) {
        self.emit_raw(0x88E0_FC00 | (rs.code() << 16) | (rn.code() << 5) | rt.code());
    }

    // ==================== Branches ====================

    /// B label
    pub fn b_label(&mut self, label: LabelId) {
        self.buf.emit_label_ref(label, ReferenceSize::AArch64Imm26);
        self.emit_raw(0x1400_0000);
    }

    /// B.cond label
    pub fn b_cond_label(&mut self, cond: Cond, label: LabelId) {
        self.buf.emit_label_ref(label, ReferenceSize::AArch64Imm19);
        self.emit_raw(0x5400_0000 | cond as u32);
    }

    /// CBZ Xt / Wt, label
    pub fn cbz_label(&mut self, rt: Reg, is_64: bool, label: LabelId) {
        let base = if is_64 { 0xB400_0000 } else { 0x3400_0000 };
        self.buf.emit_label_ref(label, ReferenceSize::AArch64Imm19);
        self.emit_raw(base | rt.code());
    }

    /// CBNZ Xt / Wt, label
    pub fn cbnz_label(&mut self, rt: Reg, is_64: bool, label: LabelId) {
        let base = if is_64 { 0xB500_0000 } else { 0x3500_0000 };
        self.buf.emit_label_ref(label, ReferenceSize::AArch64Imm19);
        self.emit_raw(base | rt.code());
    }

    /// BLR Xn
    pub fn blr(&mut self, rn: Reg) {
        self.emit_raw(0xD63F_0000 | (rn.code() << 5));
    }

    /// BR Xn
    pub fn br(&mut self, rn: Reg) {
        self.emit_raw(0xD61F_0000 | (rn.code() << 5));
    }

    /// RET (to LR)
    pub fn ret(&mut self) {
        self.emit_raw(0xD65F_03C0);
    }

    /// BRK #imm16
    pub fn brk(&mut self, imm16: u16) {
        self.emit_raw(0xD420_0000 | ((imm16 as u32) << 5));
    }

    pub fn bind(&mut self, label: LabelId) {
        self.buf.bind_label(label);
    }
}
