//! ARM64 implicit-check instruction patterns.

/// Every A64 instruction is one word.
pub const INSTRUCTION_SIZE: usize = 4;

/// Register holding the suspend trigger in compiled code.
pub const SUSPEND_CHECK_REGISTER: u32 = 21;

/// `ldr x21, [x21]`: faults once the trigger has been nulled.
pub const SUSPEND_CHECK_INSTRUCTION: u32 =
    0xF940_0000 | (SUSPEND_CHECK_REGISTER << 5) | SUSPEND_CHECK_REGISTER;

pub fn is_suspend_check(word: u32) -> bool {
    word == SUSPEND_CHECK_INSTRUCTION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suspend_check_encoding() {
        assert_eq!(SUSPEND_CHECK_INSTRUCTION, 0xF940_02B5);
        assert!(is_suspend_check(0xF940_02B5));
        // ldr x21, [x21, #8]
        assert!(!is_suspend_check(0xF940_06B5));
    }
}
