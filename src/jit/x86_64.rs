//! x86-64 instruction encoding.
//!
//! Only the forms used by the JNI glue are provided. Memory operands are
//! either `[base + disp]` or a `gs:`-relative absolute address (the thread
//! control block is reached through the `gs` segment).

use super::codebuf::{CodeBuffer, LabelId, ReferenceSize};

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    pub const ALL: [Reg; 16] = [
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rbx,
        Reg::Rsp,
        Reg::Rbp,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ];

    pub fn from_index(index: usize) -> Reg {
        Self::ALL[index]
    }

    /// Low three bits of the encoding.
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }
}

/// SSE register xmm0..xmm15.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Xmm(pub u8);

/// x86-64 condition codes (for Jcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cond {
    pub const ZERO: Cond = Cond::E;
    pub const NOT_ZERO: Cond = Cond::Ne;
}

/// Memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mem {
    /// `[base + disp]`
    Base { base: Reg, disp: i32 },
    /// `gs:[disp32]` with no base or index.
    GsAbs(u32),
}

impl Mem {
    pub fn base(base: Reg, disp: i32) -> Mem {
        Mem::Base { base, disp }
    }

    fn rex_b(self) -> u8 {
        match self {
            Mem::Base { base, .. } if base.needs_rex_ext() => 0x01,
            _ => 0,
        }
    }
}

/// Either operand of a ModRM `r/m` field.
#[derive(Clone, Copy)]
enum Rm {
    Reg(u8),
    Mem(Mem),
}

/// x86-64 assembler writing into a borrowed `CodeBuffer`.
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// Emit `[gs] [mandatory prefix] [REX] opcode ModRM [SIB] [disp]`.
    ///
    /// `reg` is the full 4-bit register number (or opcode extension) for the
    /// ModRM reg field. `byte_regs` forces a REX prefix so that codes 4..7
    /// select spl/bpl/sil/dil rather than ah/ch/dh/bh.
    fn emit_op(&mut self, w: bool, prefix: Option<u8>, opcode: &[u8], reg: u8, rm: Rm, byte_regs: bool) {
        if let Rm::Mem(Mem::GsAbs(_)) = rm {
            self.buf.emit_u8(0x65);
        }
        if let Some(p) = prefix {
            self.buf.emit_u8(p);
        }
        let rex_r = if reg >= 8 { 0x04 } else { 0 };
        let rex_b = match rm {
            Rm::Reg(r) if r >= 8 => 0x01,
            Rm::Reg(_) => 0,
            Rm::Mem(m) => m.rex_b(),
        };
        let rex = 0x40 | if w { 0x08 } else { 0 } | rex_r | rex_b;
        let low_byte_reg = |r: u8| (4..8).contains(&r);
        let force = byte_regs
            && (low_byte_reg(reg) || matches!(rm, Rm::Reg(r) if low_byte_reg(r)));
        if rex != 0x40 || force {
            self.buf.emit_u8(rex);
        }
        self.buf.emit_bytes(opcode);
        self.emit_rm(reg, rm);
    }

    fn emit_rm(&mut self, reg: u8, rm: Rm) {
        match rm {
            Rm::Reg(r) => self.buf.emit_u8(Self::modrm(0b11, reg, r)),
            Rm::Mem(Mem::GsAbs(disp)) => {
                self.buf.emit_u8(Self::modrm(0b00, reg, 0b100));
                self.buf.emit_u8(0x25);
                self.buf.emit_u32(disp);
            }
            Rm::Mem(Mem::Base { base, disp }) => {
                let needs_sib = base.code() == 0b100;
                let mode = if disp == 0 && base.code() != 0b101 {
                    0b00
                } else if (-128..=127).contains(&disp) {
                    0b01
                } else {
                    0b10
                };
                self.buf.emit_u8(Self::modrm(mode, reg, base.code()));
                if needs_sib {
                    self.buf.emit_u8(0x24);
                }
                match mode {
                    0b01 => self.buf.emit_u8(disp as u8),
                    0b10 => self.buf.emit_u32(disp as u32),
                    _ => {}
                }
            }
        }
    }

    fn emit_short_reg(&mut self, base_opcode: u8, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(base_opcode + reg.code());
    }

    // ==================== Stack ====================

    pub fn push(&mut self, reg: Reg) {
        self.emit_short_reg(0x50, reg);
    }

    pub fn pop(&mut self, reg: Reg) {
        self.emit_short_reg(0x58, reg);
    }

    // ==================== Data Movement ====================

    /// MOV r64, r64
    pub fn movq_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_op(true, None, &[0x89], src as u8, Rm::Reg(dst as u8), false);
    }

    /// MOV r32, r32 (zero-extends into the upper half)
    pub fn movl_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_op(false, None, &[0x89], src as u8, Rm::Reg(dst as u8), false);
    }

    /// MOV r64, [mem]
    pub fn movq_load(&mut self, dst: Reg, mem: Mem) {
        self.emit_op(true, None, &[0x8B], dst as u8, Rm::Mem(mem), false);
    }

    /// MOV r32, [mem]
    pub fn movl_load(&mut self, dst: Reg, mem: Mem) {
        self.emit_op(false, None, &[0x8B], dst as u8, Rm::Mem(mem), false);
    }

    /// MOVZX r32, byte [mem]
    pub fn movzxb_load(&mut self, dst: Reg, mem: Mem) {
        self.emit_op(false, None, &[0x0F, 0xB6], dst as u8, Rm::Mem(mem), false);
    }

    /// MOVZX r32, word [mem]
    pub fn movzxw_load(&mut self, dst: Reg, mem: Mem) {
        self.emit_op(false, None, &[0x0F, 0xB7], dst as u8, Rm::Mem(mem), false);
    }

    /// MOV [mem], r64
    pub fn movq_store(&mut self, mem: Mem, src: Reg) {
        self.emit_op(true, None, &[0x89], src as u8, Rm::Mem(mem), false);
    }

    /// MOV [mem], r32
    pub fn movl_store(&mut self, mem: Mem, src: Reg) {
        self.emit_op(false, None, &[0x89], src as u8, Rm::Mem(mem), false);
    }

    /// MOV [mem], r16
    pub fn movw_store(&mut self, mem: Mem, src: Reg) {
        self.emit_op(false, Some(0x66), &[0x89], src as u8, Rm::Mem(mem), false);
    }

    /// MOV [mem], r8
    pub fn movb_store(&mut self, mem: Mem, src: Reg) {
        self.emit_op(false, None, &[0x88], src as u8, Rm::Mem(mem), true);
    }

    /// MOV qword [mem], imm32 (sign-extended)
    pub fn movq_store_imm(&mut self, mem: Mem, imm: i32) {
        self.emit_op(true, None, &[0xC7], 0, Rm::Mem(mem), false);
        self.buf.emit_u32(imm as u32);
    }

    /// MOV r64, imm64 (shortest form that preserves the value)
    pub fn mov_ri(&mut self, dst: Reg, imm: u64) {
        if imm <= u32::MAX as u64 {
            // MOV r32, imm32 zero-extends.
            self.emit_short_reg(0xB8, dst);
            self.buf.emit_u32(imm as u32);
        } else {
            self.buf.emit_u8(0x48 | if dst.needs_rex_ext() { 0x01 } else { 0 });
            self.buf.emit_u8(0xB8 + dst.code());
            self.buf.emit_u64(imm);
        }
    }

    /// LEA r64, [mem]
    pub fn leaq(&mut self, dst: Reg, mem: Mem) {
        self.emit_op(true, None, &[0x8D], dst as u8, Rm::Mem(mem), false);
    }

    /// MOVSX r64, r8
    pub fn movsxb(&mut self, dst: Reg, src: Reg) {
        self.emit_op(true, None, &[0x0F, 0xBE], dst as u8, Rm::Reg(src as u8), true);
    }

    /// MOVSX r64, r16
    pub fn movsxw(&mut self, dst: Reg, src: Reg) {
        self.emit_op(true, None, &[0x0F, 0xBF], dst as u8, Rm::Reg(src as u8), false);
    }

    /// MOVZX r32, r8
    pub fn movzxb(&mut self, dst: Reg, src: Reg) {
        self.emit_op(false, None, &[0x0F, 0xB6], dst as u8, Rm::Reg(src as u8), true);
    }

    /// MOVZX r32, r16
    pub fn movzxw(&mut self, dst: Reg, src: Reg) {
        self.emit_op(false, None, &[0x0F, 0xB7], dst as u8, Rm::Reg(src as u8), false);
    }

    // ==================== SSE ====================

    /// MOVSS xmm, [mem]
    pub fn movss_load(&mut self, dst: Xmm, mem: Mem) {
        self.emit_op(false, Some(0xF3), &[0x0F, 0x10], dst.0, Rm::Mem(mem), false);
    }

    /// MOVSD xmm, [mem]
    pub fn movsd_load(&mut self, dst: Xmm, mem: Mem) {
        self.emit_op(false, Some(0xF2), &[0x0F, 0x10], dst.0, Rm::Mem(mem), false);
    }

    /// MOVSS [mem], xmm
    pub fn movss_store(&mut self, mem: Mem, src: Xmm) {
        self.emit_op(false, Some(0xF3), &[0x0F, 0x11], src.0, Rm::Mem(mem), false);
    }

    /// MOVSD [mem], xmm
    pub fn movsd_store(&mut self, mem: Mem, src: Xmm) {
        self.emit_op(false, Some(0xF2), &[0x0F, 0x11], src.0, Rm::Mem(mem), false);
    }

    /// MOVAPS xmm, xmm
    pub fn movaps(&mut self, dst: Xmm, src: Xmm) {
        self.emit_op(false, None, &[0x0F, 0x28], dst.0, Rm::Reg(src.0), false);
    }

    // ==================== Arithmetic / logic ====================

    fn group1_ri(&mut self, ext: u8, dst: Reg, imm: i32) {
        if (-128..=127).contains(&imm) {
            self.emit_op(true, None, &[0x83], ext, Rm::Reg(dst as u8), false);
            self.buf.emit_u8(imm as u8);
        } else {
            self.emit_op(true, None, &[0x81], ext, Rm::Reg(dst as u8), false);
            self.buf.emit_u32(imm as u32);
        }
    }

    /// ADD r64, imm
    pub fn addq_ri(&mut self, dst: Reg, imm: i32) {
        self.group1_ri(0, dst, imm);
    }

    /// SUB r64, imm
    pub fn subq_ri(&mut self, dst: Reg, imm: i32) {
        self.group1_ri(5, dst, imm);
    }

    /// AND r64, imm (sign-extended)
    pub fn andq_ri(&mut self, dst: Reg, imm: i32) {
        self.group1_ri(4, dst, imm);
    }

    /// OR r64, imm (sign-extended)
    pub fn orq_ri(&mut self, dst: Reg, imm: i32) {
        self.group1_ri(1, dst, imm);
    }

    /// XOR r32, r32
    pub fn xorl_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_op(false, None, &[0x31], src as u8, Rm::Reg(dst as u8), false);
    }

    /// TEST r32, r32
    pub fn testl_rr(&mut self, a: Reg, b: Reg) {
        self.emit_op(false, None, &[0x85], b as u8, Rm::Reg(a as u8), false);
    }

    /// TEST r32, imm32
    pub fn testl_ri(&mut self, reg: Reg, imm: u32) {
        self.emit_op(false, None, &[0xF7], 0, Rm::Reg(reg as u8), false);
        self.buf.emit_u32(imm);
    }

    /// TEST dword [mem], imm32
    pub fn testl_mi(&mut self, mem: Mem, imm: u32) {
        self.emit_op(false, None, &[0xF7], 0, Rm::Mem(mem), false);
        self.buf.emit_u32(imm);
    }

    /// TEST r32, dword [mem]
    pub fn testl_rm(&mut self, reg: Reg, mem: Mem) {
        self.emit_op(false, None, &[0x85], reg as u8, Rm::Mem(mem), false);
    }

    /// CMP dword [mem], imm
    pub fn cmpl_mi(&mut self, mem: Mem, imm: i32) {
        if (-128..=127).contains(&imm) {
            self.emit_op(false, None, &[0x83], 7, Rm::Mem(mem), false);
            self.buf.emit_u8(imm as u8);
        } else {
            self.emit_op(false, None, &[0x81], 7, Rm::Mem(mem), false);
            self.buf.emit_u32(imm as u32);
        }
    }

    /// CMP byte [mem], imm8
    pub fn cmpb_mi(&mut self, mem: Mem, imm: u8) {
        self.emit_op(false, None, &[0x80], 7, Rm::Mem(mem), false);
        self.buf.emit_u8(imm);
    }

    /// LOCK CMPXCHG dword [mem], r32 (compares with EAX)
    pub fn lock_cmpxchgl(&mut self, mem: Mem, src: Reg) {
        if let Mem::GsAbs(_) = mem {
            // Segment override goes before LOCK, as in the runtime's own stubs.
            self.buf.emit_u8(0x65);
            self.buf.emit_u8(0xF0);
            let rex = 0x40 | if src.needs_rex_ext() { 0x04 } else { 0 };
            if rex != 0x40 {
                self.buf.emit_u8(rex);
            }
            self.buf.emit_bytes(&[0x0F, 0xB1]);
            self.emit_rm(src as u8, Rm::Mem(mem));
        } else {
            self.buf.emit_u8(0xF0);
            self.emit_op(false, None, &[0x0F, 0xB1], src as u8, Rm::Mem(mem), false);
        }
    }

    // ==================== Control Flow ====================

    /// JMP rel32 to a label.
    pub fn jmp_label(&mut self, label: LabelId) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_label_ref(label, ReferenceSize::Rel32);
    }

    /// Jcc rel32 to a label.
    pub fn jcc_label(&mut self, cond: Cond, label: LabelId) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        self.buf.emit_label_ref(label, ReferenceSize::Rel32);
    }

    /// JMP qword [mem]
    pub fn jmp_mem(&mut self, mem: Mem) {
        self.emit_op(false, None, &[0xFF], 4, Rm::Mem(mem), false);
    }

    /// CALL qword [mem]
    pub fn call_mem(&mut self, mem: Mem) {
        self.emit_op(false, None, &[0xFF], 2, Rm::Mem(mem), false);
    }

    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    pub fn int3(&mut self) {
        self.buf.emit_u8(0xCC);
    }

    pub fn bind(&mut self, label: LabelId) {
        self.buf.bind_label(label);
    }
}
