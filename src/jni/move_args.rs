//! Argument marshalling shared by the backends.
//!
//! `plan_moves` turns `(dests, srcs, refs)` into an ordered list of
//! primitive moves; each backend then encodes the list. Stack destinations
//! are written first while every source register is still intact. Register
//! destinations are then filled in rounds: a destination is only written
//! once no pending move still reads it.

use crate::jni::{ArgumentLocation, ManagedRegister};
use crate::offsets::FrameOffset;

/// What the planner needs to know about a backend's registers.
pub trait RegisterModel {
    /// Bit identifying the physical register, shared by all its views.
    fn mask(&self, reg: ManagedRegister) -> u64;
    /// The view of `reg` that holds a native pointer.
    fn pointer_register(&self, reg: ManagedRegister) -> ManagedRegister;
    fn pointer_size(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgMove {
    /// 32-bit store of a register-resident reference to its slot.
    SpillReference { reg: ManagedRegister, offset: FrameOffset },
    StoreToStack { dest: FrameOffset, src: ManagedRegister, size: usize },
    /// `jobject` for the reference at `spill` written to a stack slot.
    JObjectToStack { dest: FrameOffset, spill: FrameOffset, null_allowed: bool },
    CopyToStack { dest: FrameOffset, src: FrameOffset, size: usize },
    MoveToRegister { dest: ManagedRegister, src: ManagedRegister, size: usize },
    /// `jobject` for the reference at `spill`. `in_reg` already holds the
    /// reference, or is `no_register()` when it must be loaded from `spill`.
    JObjectToRegister {
        dest: ManagedRegister,
        spill: FrameOffset,
        in_reg: ManagedRegister,
        null_allowed: bool,
    },
    LoadToRegister { dest: ManagedRegister, src: FrameOffset, size: usize },
}

pub fn plan_moves(
    model: &dyn RegisterModel,
    dests: &[ArgumentLocation],
    srcs: &[ArgumentLocation],
    refs: &[FrameOffset],
) -> Vec<ArgMove> {
    assert_eq!(dests.len(), srcs.len(), "move_arguments: dests and srcs differ in length");
    assert_eq!(dests.len(), refs.len(), "move_arguments: dests and refs differ in length");

    let mut moves = Vec::new();
    let mut srcs = srcs.to_vec();
    let mut src_regs = 0u64;
    let mut dest_regs = 0u64;

    for i in 0..dests.len() {
        let dest = dests[i];
        let is_ref = refs[i].is_valid_reference();
        // The receiver or class of a call is never null.
        let null_allowed = i != 0;

        if is_ref && srcs[i].is_register() {
            let reg = srcs[i].reg();
            moves.push(ArgMove::SpillReference { reg, offset: refs[i] });
            let wide = model.pointer_register(reg);
            moves.push(ArgMove::JObjectToRegister {
                dest: wide,
                spill: refs[i],
                in_reg: reg,
                null_allowed,
            });
            srcs[i] = ArgumentLocation::register(wide, model.pointer_size());
        }
        let src = srcs[i];

        match dest {
            ArgumentLocation::Register { reg, .. } => {
                if src.is_register() && model.mask(src.reg()) == model.mask(reg) {
                    continue;
                }
                if src.is_register() {
                    src_regs |= model.mask(src.reg());
                }
                dest_regs |= model.mask(reg);
            }
            ArgumentLocation::Stack { offset, size } => {
                let mv = if src.is_register() {
                    ArgMove::StoreToStack { dest: offset, src: src.reg(), size }
                } else if is_ref {
                    ArgMove::JObjectToStack { dest: offset, spill: refs[i], null_allowed }
                } else {
                    ArgMove::CopyToStack { dest: offset, src: src.frame_offset(), size }
                };
                moves.push(mv);
            }
        }
    }

    while dest_regs != 0 {
        let before = dest_regs;
        for i in 0..dests.len() {
            let ArgumentLocation::Register { reg: dest, size } = dests[i] else {
                continue;
            };
            let dest_mask = model.mask(dest);
            if dest_regs & dest_mask == 0 || src_regs & dest_mask != 0 {
                continue;
            }
            let src = srcs[i];
            let mv = if src.is_register() {
                src_regs &= !model.mask(src.reg());
                ArgMove::MoveToRegister { dest, src: src.reg(), size }
            } else if refs[i].is_valid_reference() {
                ArgMove::JObjectToRegister {
                    dest,
                    spill: refs[i],
                    in_reg: ManagedRegister::no_register(),
                    null_allowed: i != 0,
                }
            } else {
                ArgMove::LoadToRegister { dest, src: src.frame_offset(), size }
            };
            moves.push(mv);
            dest_regs &= !dest_mask;
        }
        assert_ne!(before, dest_regs, "move_arguments: register cycle, no progress possible");
    }
    moves
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Registers are plain ids; every register already holds a pointer.
    struct Flat;

    impl RegisterModel for Flat {
        fn mask(&self, reg: ManagedRegister) -> u64 {
            1 << reg.id()
        }
        fn pointer_register(&self, reg: ManagedRegister) -> ManagedRegister {
            reg
        }
        fn pointer_size(&self) -> usize {
            8
        }
    }

    fn r(id: i32) -> ManagedRegister {
        ManagedRegister::new(id)
    }

    fn reg(id: i32, size: usize) -> ArgumentLocation {
        ArgumentLocation::register(r(id), size)
    }

    fn stack(offset: usize, size: usize) -> ArgumentLocation {
        ArgumentLocation::stack(FrameOffset(offset), size)
    }

    const NOREF: FrameOffset = FrameOffset::INVALID_REFERENCE;

    #[test]
    fn test_shift_chain_is_ordered() {
        // r1 -> r2 -> r3: r3 must be written before r2, r2 before r1's move out.
        let moves = plan_moves(
            &Flat,
            &[reg(2, 8), reg(3, 8)],
            &[reg(1, 8), reg(2, 8)],
            &[NOREF, NOREF],
        );
        assert_eq!(
            moves,
            vec![
                ArgMove::MoveToRegister { dest: r(3), src: r(2), size: 8 },
                ArgMove::MoveToRegister { dest: r(2), src: r(1), size: 8 },
            ]
        );
    }

    #[test]
    fn test_same_register_is_skipped() {
        let moves = plan_moves(&Flat, &[reg(4, 4)], &[reg(4, 4)], &[NOREF]);
        assert!(moves.is_empty());
    }

    #[test]
    fn test_references_plan() {
        // Argument 0 is a reference in r1 going to r2; argument 1 is a stack
        // reference going to a stack slot; argument 2 is a stack reference
        // going to r1.
        let moves = plan_moves(
            &Flat,
            &[reg(2, 8), stack(0, 8), reg(1, 8)],
            &[reg(1, 4), stack(64, 4), stack(68, 4)],
            &[FrameOffset(56), FrameOffset(64), FrameOffset(68)],
        );
        assert_eq!(
            moves,
            vec![
                ArgMove::SpillReference { reg: r(1), offset: FrameOffset(56) },
                ArgMove::JObjectToRegister {
                    dest: r(1),
                    spill: FrameOffset(56),
                    in_reg: r(1),
                    null_allowed: false,
                },
                ArgMove::JObjectToStack {
                    dest: FrameOffset(0),
                    spill: FrameOffset(64),
                    null_allowed: true,
                },
                ArgMove::MoveToRegister { dest: r(2), src: r(1), size: 8 },
                ArgMove::JObjectToRegister {
                    dest: r(1),
                    spill: FrameOffset(68),
                    in_reg: ManagedRegister::no_register(),
                    null_allowed: true,
                },
            ]
        );
    }

    #[test]
    fn test_stack_destinations_come_first() {
        let moves = plan_moves(
            &Flat,
            &[reg(1, 8), stack(8, 8), stack(16, 4)],
            &[reg(2, 8), reg(1, 8), stack(40, 4)],
            &[NOREF, NOREF, NOREF],
        );
        assert_eq!(
            moves,
            vec![
                ArgMove::StoreToStack { dest: FrameOffset(8), src: r(1), size: 8 },
                ArgMove::CopyToStack { dest: FrameOffset(16), src: FrameOffset(40), size: 4 },
                ArgMove::MoveToRegister { dest: r(1), src: r(2), size: 8 },
            ]
        );
    }

    #[test]
    #[should_panic(expected = "no progress possible")]
    fn test_swap_cycle_panics() {
        plan_moves(&Flat, &[reg(1, 8), reg(2, 8)], &[reg(2, 8), reg(1, 8)], &[NOREF, NOREF]);
    }
}
