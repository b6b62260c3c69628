//! Instruction encoder.
//!
//! The trap framework builds its vector patches, trampolines and boot code
//! by encoding [`Instruction`] values into raw words, so the encoder is
//! checked: any field that does not fit its bit width is an error, never a
//! silent truncation. A truncated branch displacement in a vector slot
//! would send the hardware to a wrong, likely unmapped, address with no
//! way to observe what went wrong.

use core::fmt;

use crate::instruction::Instruction;
use crate::registers::{Condition, Register, ALWAYS_CONDITION, NULL_REGISTER};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// An immediate field does not fit its bit width.
    ImmediateOverflow { value: u32, bits: u32 },
    /// A relative displacement does not fit its signed bit width.
    DisplacementOverflow { offset_words: i64, bits: u32 },
    /// A branch source or target is not 4-byte aligned.
    Misaligned { address: u64 },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::ImmediateOverflow { value, bits } => {
                write!(f, "immediate {:#x} does not fit in {} bits", value, bits)
            }
            EncodeError::DisplacementOverflow { offset_words, bits } => write!(
                f,
                "displacement of {} words does not fit in signed {} bits",
                offset_words, bits
            ),
            EncodeError::Misaligned { address } => {
                write!(f, "address {:#x} is not 4-byte aligned", address)
            }
        }
    }
}

impl std::error::Error for EncodeError {}

fn reg4(reg: Register) -> u32 {
    reg.index() as u32
}

fn reg5(reg: Option<Register>) -> u32 {
    match reg {
        Some(r) => r.index() as u32,
        None => NULL_REGISTER,
    }
}

fn cond4(cond: Option<Condition>) -> u32 {
    match cond {
        Some(c) => c as u32,
        None => ALWAYS_CONDITION,
    }
}

fn unsigned(value: u32, bits: u32) -> Result<u32, EncodeError> {
    if value >> bits != 0 {
        Err(EncodeError::ImmediateOverflow { value, bits })
    } else {
        Ok(value)
    }
}

fn signed(offset_words: i64, bits: u32) -> Result<u32, EncodeError> {
    let limit = 1i64 << (bits - 1);
    if offset_words < -limit || offset_words >= limit {
        Err(EncodeError::DisplacementOverflow { offset_words, bits })
    } else {
        Ok((offset_words as u32) & ((1 << bits) - 1))
    }
}

/// Word displacement from `source` to `target`, as carried in relative
/// control-flow instructions: measured from the address after the
/// instruction at `source`, in units of instruction words.
pub fn relative_words(source: u64, target: u64) -> Result<i64, EncodeError> {
    for address in [source, target] {
        if address % 4 != 0 {
            return Err(EncodeError::Misaligned { address });
        }
    }
    Ok((target as i64).wrapping_sub(source as i64 + 4) / 4)
}

/// Encodes the vector-slot patch: an always-taken relative branch from the
/// slot at `source_address` to the trampoline at `target_address`.
///
/// The displacement must fit the signed 22-bit word field (±2^23 bytes);
/// anything larger is an error, caught at table-installation time. The
/// "link" is the hardware-saved exception state: the patched branch itself
/// carries no return address, the trampoline resumes via `eret`.
pub fn encode_branch_link(source_address: u64, target_address: u64) -> Result<u32, EncodeError> {
    let words = relative_words(source_address, target_address)?;
    encode(&Instruction::JumpRel {
        cond: None,
        offset_words: i32::try_from(words).map_err(|_| EncodeError::DisplacementOverflow {
            offset_words: words,
            bits: 22,
        })?,
    })
}

/// Encodes one instruction into its 32-bit word.
pub fn encode(instr: &Instruction) -> Result<u32, EncodeError> {
    use Instruction::*;
    Ok(match *instr {
        PushSingle { size, src } => 0xdc00_0000 | (size as u32) << 5 | reg5(src),
        PopSingle { size, dst } => 0xd400_0000 | (size as u32) << 5 | reg5(dst),
        PushPair { size, src1, src2 } => {
            0xd800_0000 | (size as u32) << 10 | reg5(src1) << 5 | reg5(src2)
        }
        PopPair { size, dst1, dst2 } => {
            0xd000_0000 | (size as u32) << 8 | reg4(dst1) << 4 | reg4(dst2)
        }
        Load { size, dst, addr } => 0xcc00_0000 | (size as u32) << 8 | reg4(dst) << 4 | reg4(addr),
        Store { size, addr, src } => 0xc400_0000 | (size as u32) << 8 | reg4(addr) << 4 | reg4(src),
        LoadImm {
            dst,
            value,
            shift,
            clear,
        } => {
            0xe000_0000
                | (clear as u32) << 26
                | (value as u32) << 10
                | unsigned(shift as u32, 6)? << 4
                | reg4(dst)
        }
        LoadRel { dst, offset } => {
            0x3000_0000 | reg4(dst) << 22 | signed(offset as i64, 22)?
        }
        Copy { size, dst, src } => 0xa800_0000 | (size as u32) << 8 | reg4(dst) << 4 | reg4(src),
        AddImm {
            size,
            dst,
            lhs,
            value,
            shift_factor,
            sign_extend,
            carry,
            set_flags,
        } => {
            0xb000_0000
                | (size as u32) << 26
                | (carry as u32) << 25
                | (set_flags as u32) << 24
                | reg5(dst) << 19
                | reg4(lhs) << 15
                | (sign_extend as u32) << 14
                | unsigned(shift_factor as u32, 3)? << 11
                | unsigned(value as u32, 11)?
        }
        SubImm {
            size,
            dst,
            lhs,
            value,
            shift_factor,
            sign_extend,
            borrow,
            set_flags,
        } => {
            0x9000_0000
                | (size as u32) << 26
                | (borrow as u32) << 25
                | (set_flags as u32) << 24
                | reg5(dst) << 19
                | reg4(lhs) << 15
                | (sign_extend as u32) << 14
                | unsigned(shift_factor as u32, 3)? << 11
                | unsigned(value as u32, 11)?
        }
        AndImm {
            size,
            dst,
            lhs,
            value,
            shift_factor,
            set_flags,
        } => {
            0x8000_0000
                | (size as u32) << 24
                | (set_flags as u32) << 23
                | reg5(dst) << 18
                | reg4(lhs) << 14
                | unsigned(value as u32, 11)? << 3
                | unsigned(shift_factor as u32, 3)?
        }
        ShrImm {
            size,
            dst,
            lhs,
            amount,
            signed: arithmetic,
            set_flags,
        } => {
            0x6400_0000
                | (size as u32) << 18
                | (arithmetic as u32) << 17
                | (set_flags as u32) << 16
                | reg5(dst) << 11
                | reg4(lhs) << 7
                | unsigned(amount as u32, 7)?
        }
        Div {
            size,
            quot,
            rem,
            lhs,
            rhs,
            signed: is_signed,
            set_flags,
        } => {
            0x8800_0000
                | (size as u32) << 18
                | (is_signed as u32) << 17
                | (set_flags as u32) << 16
                | reg4(quot) << 12
                | reg4(rem) << 8
                | reg4(lhs) << 4
                | reg4(rhs)
        }
        JumpRel { cond, offset_words } => {
            0x4400_0000 | cond4(cond) << 22 | signed(offset_words as i64, 22)?
        }
        CompareJumpRel {
            cond,
            size,
            lhs,
            rhs,
            offset_words,
        } => {
            0x2c00_0000
                | (cond as u32) << 23
                | (size as u32) << 21
                | reg4(lhs) << 17
                | reg4(rhs) << 13
                | signed(offset_words as i64, 13)?
        }
        CallRel { cond, offset_words } => {
            0x2000_0000 | cond4(cond) << 22 | signed(offset_words as i64, 22)?
        }
        Ret => 0x1c00_0000,
        Eret => 0x1800_0000,
        Udf => 0x0000_0000,
        Dbg => 0x0800_0000,
        UserTrap { value } => 0x0c00_0000 | value as u32,
        Nop => 0x0400_0000,
        ReadMachine { dst, id } => 0x1000_0000 | reg4(dst) << 22 | unsigned(id, 22)?,
        WriteMachine { id, src } => 0x1400_0000 | reg4(src) << 22 | unsigned(id, 22)?,
    })
}

/// Encodes a sequence of instructions into little-endian bytes.
pub fn encode_all(instrs: &[Instruction]) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(instrs.len() * 4);
    for instr in instrs {
        out.extend_from_slice(&encode(instr)?.to_le_bytes());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Size;

    #[test]
    fn branch_link_forward_and_backward() {
        // slot at 0x1000, trampoline at 0x2000: 0xffc bytes past slot+4
        let word = encode_branch_link(0x1000, 0x2000).unwrap();
        assert_eq!(word & 0xfc00_0000, 0x4400_0000);
        assert_eq!((word >> 22) & 0xf, ALWAYS_CONDITION);
        assert_eq!(word & 0x3f_ffff, 0xffc / 4);

        // backward branch: displacement is sign-masked, not rejected
        let word = encode_branch_link(0x2000, 0x1000).unwrap();
        assert_eq!(word & 0x3f_ffff, ((-0x1004i32 / 4) as u32) & 0x3f_ffff);
    }

    #[test]
    fn branch_link_rejects_out_of_range_displacement() {
        // +2^23 bytes is one word past the end of the signed 22-bit range
        assert!(encode_branch_link(0, 4 + (1 << 23)).is_err());
        assert!(encode_branch_link(1 << 24, 0).is_err());
        // the last representable targets on either side still encode
        assert!(encode_branch_link(0, 4 + (1 << 23) - 4).is_ok());
        assert!(encode_branch_link(1 << 23, 4).is_ok());
    }

    #[test]
    fn branch_link_rejects_misaligned_addresses() {
        assert_eq!(
            encode_branch_link(0x1001, 0x2000),
            Err(EncodeError::Misaligned { address: 0x1001 })
        );
        assert_eq!(
            encode_branch_link(0x1000, 0x2002),
            Err(EncodeError::Misaligned { address: 0x2002 })
        );
    }

    #[test]
    fn immediate_overflow_is_an_error() {
        let instr = Instruction::AddImm {
            size: Size::Word,
            dst: Some(Register::R0),
            lhs: Register::R0,
            value: 0x800, // 11-bit field
            shift_factor: 0,
            sign_extend: false,
            carry: false,
            set_flags: false,
        };
        assert!(matches!(
            encode(&instr),
            Err(EncodeError::ImmediateOverflow { .. })
        ));
    }

    #[test]
    fn fixed_encodings() {
        assert_eq!(encode(&Instruction::Eret).unwrap(), 0x1800_0000);
        assert_eq!(encode(&Instruction::Ret).unwrap(), 0x1c00_0000);
        assert_eq!(encode(&Instruction::Nop).unwrap(), 0x0400_0000);
        assert_eq!(encode(&Instruction::Udf).unwrap(), 0);
        assert_eq!(
            encode(&Instruction::UserTrap { value: 0x1234 }).unwrap(),
            0x0c00_1234
        );
    }
}
