//! Instruction decoder: raw 32-bit words into [`Instruction`] values.
//!
//! Returns `None` for anything outside the implemented subset or with
//! nonzero bits in a fixed field; the machine turns that into an
//! invalid-instruction exception.

use crate::instruction::{ClearMode, Instruction};
use crate::registers::{Condition, Register, Size, ALWAYS_CONDITION, NULL_REGISTER};

fn reg4(bits: u32) -> Register {
    // 4-bit fields cover exactly the 16 registers.
    Register::from_index(bits & 0xf).unwrap()
}

fn reg5(bits: u32) -> Option<Option<Register>> {
    match bits & 0x1f {
        NULL_REGISTER => Some(None),
        value => Register::from_index(value).map(Some),
    }
}

fn cond4(bits: u32) -> Option<Option<Condition>> {
    match bits & 0xf {
        ALWAYS_CONDITION => Some(None),
        value => Condition::from_bits(value).map(Some),
    }
}

fn sign_extend(field: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((field << shift) as i32) >> shift
}

/// Decodes one instruction word.
pub fn decode(word: u32) -> Option<Instruction> {
    let size = |shift: u32| Size::from_bits(word >> shift);
    let fixed_zero = |mask: u32| (word & mask) == 0;

    match word >> 26 {
        // ===== opcode group 00 =====
        0b000000 if word == 0 => Some(Instruction::Udf),
        0b000001 if fixed_zero(0x03ff_ffff) => Some(Instruction::Nop),
        0b000010 if fixed_zero(0x03ff_ffff) => Some(Instruction::Dbg),
        0b000011 if fixed_zero(0x03ff_0000) => Some(Instruction::UserTrap {
            value: (word & 0xffff) as u16,
        }),
        0b000100 => Some(Instruction::ReadMachine {
            dst: reg4(word >> 22),
            id: word & 0x3f_ffff,
        }),
        0b000101 => Some(Instruction::WriteMachine {
            id: word & 0x3f_ffff,
            src: reg4(word >> 22),
        }),
        0b000110 if fixed_zero(0x03ff_ffff) => Some(Instruction::Eret),
        0b000111 if fixed_zero(0x03ff_ffff) => Some(Instruction::Ret),
        0b001000 => Some(Instruction::CallRel {
            cond: cond4(word >> 22)?,
            offset_words: sign_extend(word & 0x3f_ffff, 22),
        }),
        0b001011 => Some(Instruction::CompareJumpRel {
            cond: Condition::from_bits((word >> 23) & 0x7)?,
            size: size(21),
            lhs: reg4(word >> 17),
            rhs: reg4(word >> 13),
            offset_words: sign_extend(word & 0x1fff, 13),
        }),
        0b001100 => Some(Instruction::LoadRel {
            dst: reg4(word >> 22),
            offset: sign_extend(word & 0x3f_ffff, 22),
        }),
        0b010001 => Some(Instruction::JumpRel {
            cond: cond4(word >> 22)?,
            offset_words: sign_extend(word & 0x3f_ffff, 22),
        }),

        // ===== shifts and division (fixed 12-bit prefixes) =====
        0b011001 if fixed_zero(0x03f0_0000) => Some(Instruction::ShrImm {
            size: size(18),
            dst: reg5(word >> 11)?,
            lhs: reg4(word >> 7),
            amount: (word & 0x7f) as u8,
            signed: word & (1 << 17) != 0,
            set_flags: word & (1 << 16) != 0,
        }),
        0b100010 if fixed_zero(0x03f0_0000) => Some(Instruction::Div {
            size: size(18),
            quot: reg4(word >> 12),
            rem: reg4(word >> 8),
            lhs: reg4(word >> 4),
            rhs: reg4(word),
            signed: word & (1 << 17) != 0,
            set_flags: word & (1 << 16) != 0,
        }),

        // ===== immediate ALU =====
        0b100000 => Some(Instruction::AndImm {
            size: size(24),
            dst: reg5(word >> 18)?,
            lhs: reg4(word >> 14),
            value: ((word >> 3) & 0x7ff) as u16,
            shift_factor: (word & 0x7) as u8,
            set_flags: word & (1 << 23) != 0,
        }),
        0b100100..=0b100111 => Some(Instruction::SubImm {
            size: size(26),
            dst: reg5(word >> 19)?,
            lhs: reg4(word >> 15),
            value: (word & 0x7ff) as u16,
            shift_factor: ((word >> 11) & 0x7) as u8,
            sign_extend: word & (1 << 14) != 0,
            borrow: word & (1 << 25) != 0,
            set_flags: word & (1 << 24) != 0,
        }),
        0b101100..=0b101111 => Some(Instruction::AddImm {
            size: size(26),
            dst: reg5(word >> 19)?,
            lhs: reg4(word >> 15),
            value: (word & 0x7ff) as u16,
            shift_factor: ((word >> 11) & 0x7) as u8,
            sign_extend: word & (1 << 14) != 0,
            carry: word & (1 << 25) != 0,
            set_flags: word & (1 << 24) != 0,
        }),

        // ===== register moves and memory =====
        0b101010 if fixed_zero(0x03ff_fc00) => Some(Instruction::Copy {
            size: size(8),
            dst: reg4(word >> 4),
            src: reg4(word),
        }),
        0b110001 if fixed_zero(0x03ff_fc00) => Some(Instruction::Store {
            size: size(8),
            addr: reg4(word >> 4),
            src: reg4(word),
        }),
        0b110011 if fixed_zero(0x03ff_fc00) => Some(Instruction::Load {
            size: size(8),
            dst: reg4(word >> 4),
            addr: reg4(word),
        }),

        // ===== stack =====
        0b110100 if fixed_zero(0x03ff_fc00) => Some(Instruction::PopPair {
            size: size(8),
            dst1: reg4(word >> 4),
            dst2: reg4(word),
        }),
        0b110101 if fixed_zero(0x03ff_ff80) => Some(Instruction::PopSingle {
            size: size(5),
            dst: reg5(word)?,
        }),
        0b110110 if fixed_zero(0x03ff_f000) => Some(Instruction::PushPair {
            size: size(10),
            src1: reg5(word >> 5)?,
            src2: reg5(word)?,
        }),
        0b110111 if fixed_zero(0x03ff_ff80) => Some(Instruction::PushSingle {
            size: size(5),
            src: reg5(word)?,
        }),

        // ===== ldi (4-bit opcode) =====
        0b111000..=0b111011 => Some(Instruction::LoadImm {
            dst: reg4(word),
            value: ((word >> 10) & 0xffff) as u16,
            shift: ((word >> 4) & 0x3f) as u8,
            clear: ClearMode::from_bits(word >> 26),
        }),

        _ => None,
    }
}
