use core::fmt;

use crate::registers::{Condition, Register, Size};

/// How `ldi` treats the destination bits outside the shifted immediate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClearMode {
    /// Keep everything outside the 16-bit window.
    None = 0,
    /// Clear the bits below the window.
    Lower = 1,
    /// Clear the bits above the window.
    Upper = 2,
    /// Clear the whole register first.
    All = 3,
}

impl ClearMode {
    pub fn from_bits(bits: u32) -> ClearMode {
        match bits & 0b11 {
            0 => ClearMode::None,
            1 => ClearMode::Lower,
            2 => ClearMode::Upper,
            _ => ClearMode::All,
        }
    }
}

/// The instruction subset the trap framework, its handlers and the demos
/// require. Every instruction is one little-endian 32-bit word.
///
/// Relative control-flow displacements are measured in instruction words
/// from the address *after* the instruction (pc + 4), which is also the
/// convention the vector-slot patcher has to honor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Instruction {
    // ===== stack =====
    /// Push one register (or zero, for a null source).
    PushSingle { size: Size, src: Option<Register> },
    /// Pop one value into a register (or discard it).
    PopSingle { size: Size, dst: Option<Register> },
    /// Push a register pair; `src1` lands at the lower address.
    PushPair {
        size: Size,
        src1: Option<Register>,
        src2: Option<Register>,
    },
    /// Pop a register pair; `dst1` reads from the lower address.
    PopPair {
        size: Size,
        dst1: Register,
        dst2: Register,
    },

    // ===== memory =====
    /// Sized load through a register-held address.
    Load {
        size: Size,
        dst: Register,
        addr: Register,
    },
    /// Sized store through a register-held address.
    Store {
        size: Size,
        addr: Register,
        src: Register,
    },
    /// Place a 16-bit immediate at a bit offset within the destination.
    LoadImm {
        dst: Register,
        value: u16,
        shift: u8,
        clear: ClearMode,
    },
    /// Materialize pc + 4 + offset (a pc-relative address) in a register.
    LoadRel { dst: Register, offset: i32 },
    /// Sized register-to-register copy.
    Copy {
        size: Size,
        dst: Register,
        src: Register,
    },

    // ===== arithmetic and logic =====
    /// Add an 11-bit immediate (optionally shifted by multiples of 11 bits).
    AddImm {
        size: Size,
        dst: Option<Register>,
        lhs: Register,
        value: u16,
        shift_factor: u8,
        sign_extend: bool,
        carry: bool,
        set_flags: bool,
    },
    /// Subtract an 11-bit immediate.
    SubImm {
        size: Size,
        dst: Option<Register>,
        lhs: Register,
        value: u16,
        shift_factor: u8,
        sign_extend: bool,
        borrow: bool,
        set_flags: bool,
    },
    /// AND with an 11-bit immediate.
    AndImm {
        size: Size,
        dst: Option<Register>,
        lhs: Register,
        value: u16,
        shift_factor: u8,
        set_flags: bool,
    },
    /// Shift right by an immediate amount.
    ShrImm {
        size: Size,
        dst: Option<Register>,
        lhs: Register,
        amount: u8,
        signed: bool,
        set_flags: bool,
    },
    /// Divide, producing quotient and remainder.
    Div {
        size: Size,
        quot: Register,
        rem: Register,
        lhs: Register,
        rhs: Register,
        signed: bool,
        set_flags: bool,
    },

    // ===== control flow =====
    /// Relative jump, optionally conditional (`None` = always).
    JumpRel {
        cond: Option<Condition>,
        offset_words: i32,
    },
    /// Compare two registers and jump on the condition (13-bit range).
    CompareJumpRel {
        cond: Condition,
        size: Size,
        lhs: Register,
        rhs: Register,
        offset_words: i32,
    },
    /// Relative call: like `JumpRel` but links the return address in `lr`.
    CallRel {
        cond: Option<Condition>,
        offset_words: i32,
    },
    /// Return through `lr`.
    Ret,
    /// Return from exception: restores ip/flags/sp from the hardware-saved
    /// exception state. Privileged.
    Eret,
    /// Architecturally undefined; always raises invalid-instruction.
    Udf,
    /// Raise a debug exception.
    Dbg,
    /// Software-triggered `user` exception carrying a 16-bit value.
    UserTrap { value: u16 },
    Nop,

    // ===== machine registers =====
    /// Read a machine control register.
    ReadMachine { dst: Register, id: u32 },
    /// Write a machine control register.
    WriteMachine { id: u32, src: Register },
}

fn opt_reg(reg: Option<Register>) -> String {
    match reg {
        Some(r) => format!("r{}", r.index()),
        None => "null".into(),
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Instruction::*;
        match self {
            PushSingle { size, src } => write!(f, "pushs.{:?} {}", size, opt_reg(*src)),
            PopSingle { size, dst } => write!(f, "pops.{:?} {}", size, opt_reg(*dst)),
            PushPair { size, src1, src2 } => {
                write!(f, "pushp.{:?} {}, {}", size, opt_reg(*src1), opt_reg(*src2))
            }
            PopPair { size, dst1, dst2 } => {
                write!(f, "popp.{:?} r{}, r{}", size, dst1.index(), dst2.index())
            }
            Load { size, dst, addr } => {
                write!(f, "lds.{:?} r{}, [r{}]", size, dst.index(), addr.index())
            }
            Store { size, addr, src } => {
                write!(f, "sts.{:?} [r{}], r{}", size, addr.index(), src.index())
            }
            LoadImm {
                dst,
                value,
                shift,
                clear,
            } => write!(
                f,
                "ldi r{}, {:#x}, {}, {:?}",
                dst.index(),
                value,
                shift,
                clear
            ),
            LoadRel { dst, offset } => write!(f, "ldr r{}, pc{:+}", dst.index(), offset + 4),
            Copy { size, dst, src } => {
                write!(f, "copy.{:?} r{}, r{}", size, dst.index(), src.index())
            }
            AddImm {
                dst, lhs, value, ..
            } => write!(f, "add {}, r{}, {:#x}", opt_reg(*dst), lhs.index(), value),
            SubImm {
                dst, lhs, value, ..
            } => write!(f, "sub {}, r{}, {:#x}", opt_reg(*dst), lhs.index(), value),
            AndImm {
                dst, lhs, value, ..
            } => write!(f, "and {}, r{}, {:#x}", opt_reg(*dst), lhs.index(), value),
            ShrImm {
                dst, lhs, amount, ..
            } => write!(f, "shr {}, r{}, {}", opt_reg(*dst), lhs.index(), amount),
            Div {
                quot,
                rem,
                lhs,
                rhs,
                ..
            } => write!(
                f,
                "div r{}, r{}, r{}, r{}",
                quot.index(),
                rem.index(),
                lhs.index(),
                rhs.index()
            ),
            JumpRel { cond, offset_words } => {
                write!(f, "jmpr{} {:+} words", cond_suffix(*cond), offset_words)
            }
            CompareJumpRel {
                cond,
                lhs,
                rhs,
                offset_words,
                ..
            } => write!(
                f,
                "cjmpr.{:?} r{}, r{}, {:+} words",
                cond,
                lhs.index(),
                rhs.index(),
                offset_words
            ),
            CallRel { cond, offset_words } => {
                write!(f, "callr{} {:+} words", cond_suffix(*cond), offset_words)
            }
            Ret => write!(f, "ret"),
            Eret => write!(f, "eret"),
            Udf => write!(f, "udf"),
            Dbg => write!(f, "dbg"),
            UserTrap { value } => write!(f, "exc {:#x}", value),
            Nop => write!(f, "nop"),
            ReadMachine { dst, id } => write!(f, "ldm r{}, mreg {:#x}", dst.index(), id),
            WriteMachine { id, src } => write!(f, "stm mreg {:#x}, r{}", id, src.index()),
        }
    }
}

fn cond_suffix(cond: Option<Condition>) -> String {
    match cond {
        Some(c) => format!(".{:?}", c),
        None => String::new(),
    }
}
