//! Length decoding for the x86 instructions compiled code uses as implicit
//! null checks.
//!
//! Only the opcodes below are recognized; anything else decodes to 0 so the
//! fault falls through to the default crash path. Extending the list to an
//! instruction whose length is computed wrongly would resume execution in
//! the middle of an instruction, so new opcodes need a matching test.

/// Byte cursor that reports exhaustion instead of panicking.
struct Cursor<'a> {
    code: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn next(&mut self) -> Option<u8> {
        let byte = *self.code.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }
}

fn is_prefix(byte: u8) -> bool {
    matches!(
        byte,
        0x66 | 0xF0 | 0xF2 | 0xF3 | 0x2E | 0x36 | 0x3E | 0x26 | 0x64 | 0x65 | 0x67
    )
}

/// Length of the instruction at the start of `code`, or 0 when it is not one
/// of the recognized forms or `code` ends before the instruction does.
pub fn instruction_size(code: &[u8], is_64bit: bool) -> usize {
    decode(code, is_64bit).unwrap_or(0)
}

fn decode(code: &[u8], is_64bit: bool) -> Option<usize> {
    let mut cur = Cursor { code, pos: 0 };
    let mut opcode = cur.next()?;
    let mut operand_size_prefix = false;
    while is_prefix(opcode) {
        operand_size_prefix |= opcode == 0x66;
        opcode = cur.next()?;
    }
    if is_64bit && (0x40..=0x4F).contains(&opcode) {
        opcode = cur.next()?;
    }
    let word_immediate = if operand_size_prefix { 2 } else { 4 };

    // Every recognized form has a ModRM byte.
    let (immediate, modrm) = if opcode == 0x0F {
        let opcode = cur.next()?;
        match opcode {
            // movss/movsd, movzx, movsx
            0x10 | 0x11 | 0xB6 | 0xB7 | 0xBE | 0xBF => (0, cur.next()?),
            _ => return None,
        }
    } else {
        match opcode {
            // mov, cmp and test with a memory operand
            0x88 | 0x89 | 0x8B | 0x38..=0x3D | 0x85 => (0, cur.next()?),
            0x80 | 0x83 | 0xC6 => (1, cur.next()?),
            0x81 | 0xC7 => (word_immediate, cur.next()?),
            0xF6 | 0xF7 => {
                let modrm = cur.next()?;
                let immediate = match (modrm >> 3) & 7 {
                    0 if opcode == 0xF6 => 1,
                    0 => word_immediate,
                    // not, neg, mul, imul, div, idiv
                    2..=7 => 0,
                    _ => return None,
                };
                (immediate, modrm)
            }
            _ => return None,
        }
    };

    let mode = modrm >> 6;
    if mode != 3 && modrm & 7 == 4 {
        cur.next()?; // SIB
    }
    let displacement = match mode {
        1 => 1,
        2 => 4,
        _ => 0,
    };
    let size = cur.pos + displacement + immediate;
    (size <= code.len()).then_some(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_buffer_is_not_an_instruction() {
        assert_eq!(instruction_size(&[], true), 0);
        assert_eq!(instruction_size(&[], false), 0);
    }

    #[test]
    fn test_implicit_check_sequence() {
        // test eax, [eax]
        assert_eq!(instruction_size(&[0x85, 0x00], true), 2);
        assert_eq!(instruction_size(&[0x85, 0x00], false), 2);
        // mov eax, [rdi + 8]
        assert_eq!(instruction_size(&[0x8B, 0x47, 0x08], true), 3);
        // Only the bytes left in the method count.
        assert_eq!(instruction_size(&[0x8B, 0x47], true), 0);
    }

    #[test]
    fn test_prefixes_and_rex() {
        // mov dword [rdi + 0x10], 7 with REX.W
        assert_eq!(instruction_size(&[0x48, 0xC7, 0x47, 0x10, 7, 0, 0, 0], true), 8);
        // 16-bit immediate under the operand-size prefix
        assert_eq!(instruction_size(&[0x66, 0xC7, 0x47, 0x10, 7, 0], true), 6);
        // REX is an inc/dec opcode in 32-bit mode, not a prefix
        assert_eq!(instruction_size(&[0x48, 0x8B, 0x07], false), 0);
    }

    #[test]
    fn test_two_byte_and_sib_forms() {
        // movzx eax, word [rsp + 0x100]
        assert_eq!(instruction_size(&[0x0F, 0xB7, 0x84, 0x24, 0, 1, 0, 0], true), 8);
        // movsd xmm0, [rax]
        assert_eq!(instruction_size(&[0xF2, 0x0F, 0x10, 0x00], true), 4);
    }

    #[test]
    fn test_group3() {
        // test byte [rax], 1
        assert_eq!(instruction_size(&[0xF6, 0x00, 0x01], true), 3);
        // neg dword [rax]
        assert_eq!(instruction_size(&[0xF7, 0x18], true), 2);
        // /1 is undefined
        assert_eq!(instruction_size(&[0xF7, 0x08], true), 0);
    }

    #[test]
    fn test_unknown_or_truncated() {
        assert_eq!(instruction_size(&[0xE8, 0, 0, 0, 0], true), 0);
        assert_eq!(instruction_size(&[0x0F, 0x05], true), 0);
        assert_eq!(instruction_size(&[0x65, 0x48], true), 0);
        assert_eq!(instruction_size(&[0x8B], true), 0);
    }
}
