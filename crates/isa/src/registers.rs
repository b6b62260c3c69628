use bitflags::bitflags;

/// General-purpose registers.
///
/// The machine has 16 general-purpose 64-bit registers. The top three have
/// fixed roles in the calling convention; everything else is free for
/// ordinary code. Register fields in instruction words are 4 bits wide
/// (5 bits where a "null" register is allowed, see [`NULL_REGISTER`]).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Register {
    R0 = 0,
    R1 = 1,
    R2 = 2,
    R3 = 3,
    R4 = 4,
    R5 = 5,
    R6 = 6,
    R7 = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    Sp = 13, // r13: stack pointer
    Fp = 14, // r14: frame pointer
    Lr = 15, // r15: link register
}

/// Encoding of "no register" in 5-bit nullable register fields.
///
/// Push-style instructions accept a null source (push a zero / discard a
/// pop) and encode it as 31 in the wide register field.
pub const NULL_REGISTER: u32 = 31;

impl Register {
    /// All registers in index order. Handy for iterating the register file.
    pub const ALL: [Register; 16] = [
        Register::R0,
        Register::R1,
        Register::R2,
        Register::R3,
        Register::R4,
        Register::R5,
        Register::R6,
        Register::R7,
        Register::R8,
        Register::R9,
        Register::R10,
        Register::R11,
        Register::R12,
        Register::Sp,
        Register::Fp,
        Register::Lr,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(value: u32) -> Option<Register> {
        Register::ALL.get(value as usize).copied()
    }
}

/// Operand sizes carried in 2-bit `ss` instruction fields.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Size {
    Byte = 0,
    DoubleByte = 1,
    QuadByte = 2,
    Word = 3,
}

impl Size {
    pub fn from_bits(bits: u32) -> Size {
        match bits & 0b11 {
            0 => Size::Byte,
            1 => Size::DoubleByte,
            2 => Size::QuadByte,
            _ => Size::Word,
        }
    }

    pub const fn byte_size(self) -> u64 {
        match self {
            Size::Byte => 1,
            Size::DoubleByte => 2,
            Size::QuadByte => 4,
            Size::Word => 8,
        }
    }

    pub const fn bit_size(self) -> u32 {
        self.byte_size() as u32 * 8
    }

    pub const fn mask(self) -> u64 {
        match self {
            Size::Word => u64::MAX,
            _ => (1u64 << self.bit_size()) - 1,
        }
    }

    pub const fn msb_index(self) -> u32 {
        self.bit_size() - 1
    }
}

/// Branch conditions. 4-bit fields may also carry "always" (encoded 15);
/// the 3-bit compare-and-jump field only fits the first eight.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Condition {
    Carry = 0,
    NotCarry = 1,
    Zero = 2,
    NotZero = 3,
    Overflow = 4,
    NotOverflow = 5,
    Sign = 6,
    NotSign = 7,
}

/// Encoding of "no condition" (unconditional) in 4-bit condition fields.
pub const ALWAYS_CONDITION: u32 = 15;

impl Condition {
    pub fn from_bits(bits: u32) -> Option<Condition> {
        match bits {
            0 => Some(Condition::Carry),
            1 => Some(Condition::NotCarry),
            2 => Some(Condition::Zero),
            3 => Some(Condition::NotZero),
            4 => Some(Condition::Overflow),
            5 => Some(Condition::NotOverflow),
            6 => Some(Condition::Sign),
            7 => Some(Condition::NotSign),
            _ => None,
        }
    }
}

/// Execution modes. `Pl0` is the privileged level: machine-register access
/// and `eret` require it, and the hardware drops to it on every trap.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PrivilegeLevel {
    Pl0 = 0,
    Pl1 = 1,
}

bitflags! {
    /// The CPU flags word. Only the low six bits are architecturally
    /// defined; writing anything outside [`Flags::all()`] to the `flags`
    /// machine register is an invalid-operation fault.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct Flags: u64 {
        const CARRY = 1 << 0;
        const ZERO = 1 << 1;
        const OVERFLOW = 1 << 2;
        const SIGN = 1 << 3;
        const EXCEPTIONS_ENABLED = 1 << 4;
        const PL1 = 1 << 5;
    }
}

impl Flags {
    pub fn privilege_level(self) -> PrivilegeLevel {
        if self.contains(Flags::PL1) {
            PrivilegeLevel::Pl1
        } else {
            PrivilegeLevel::Pl0
        }
    }

    pub fn set_privilege_level(&mut self, level: PrivilegeLevel) {
        self.set(Flags::PL1, matches!(level, PrivilegeLevel::Pl1));
    }

    pub fn test(self, cond: Condition) -> bool {
        match cond {
            Condition::Carry => self.contains(Flags::CARRY),
            Condition::NotCarry => !self.contains(Flags::CARRY),
            Condition::Zero => self.contains(Flags::ZERO),
            Condition::NotZero => !self.contains(Flags::ZERO),
            Condition::Overflow => self.contains(Flags::OVERFLOW),
            Condition::NotOverflow => !self.contains(Flags::OVERFLOW),
            Condition::Sign => self.contains(Flags::SIGN),
            Condition::NotSign => !self.contains(Flags::SIGN),
        }
    }
}

/// Machine control registers, addressed by the 22-bit id field of the
/// `ldm`/`stm` instructions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MachineReg {
    Flags = 0,
    /// Exception link register: resumption address consumed by `eret`.
    Elr = 1,
    /// Exception-mode stack pointer: sp of the interrupted context.
    Esp = 2,
    /// Flags of the interrupted context, restored by `eret`.
    Eflags = 3,
    /// Cause of the most recent trap. Read-only, refreshed per trap.
    Einfo = 4,
    /// Faulting address for memory-access exceptions. Read-only.
    Eaddr = 5,
    /// Exception vector table base. Installed once at boot.
    Evtable = 6,
    /// Exception context table base. Installed once at boot; the hardware
    /// snapshots and validates the table on the write.
    Ectable = 7,
    /// Memory-mapped console: accepts one byte per write, fire-and-forget.
    /// Out-of-scope collaborator; the only machine register writable from
    /// either privilege level.
    Console = 0xc0de,
}

impl MachineReg {
    pub fn from_id(id: u32) -> Option<MachineReg> {
        match id {
            0 => Some(MachineReg::Flags),
            1 => Some(MachineReg::Elr),
            2 => Some(MachineReg::Esp),
            3 => Some(MachineReg::Eflags),
            4 => Some(MachineReg::Einfo),
            5 => Some(MachineReg::Eaddr),
            6 => Some(MachineReg::Evtable),
            7 => Some(MachineReg::Ectable),
            0xc0de => Some(MachineReg::Console),
            _ => None,
        }
    }

    pub const fn id(self) -> u32 {
        self as u32
    }

    /// Whether `level` may perform the given access. The exception machinery
    /// is pl0-only; `einfo`/`eaddr` are read-only; the console is
    /// write-only.
    pub fn allows(self, level: PrivilegeLevel, write: bool) -> bool {
        match self {
            MachineReg::Flags => !write || level == PrivilegeLevel::Pl0,
            MachineReg::Elr
            | MachineReg::Esp
            | MachineReg::Eflags
            | MachineReg::Evtable
            | MachineReg::Ectable => level == PrivilegeLevel::Pl0,
            MachineReg::Einfo | MachineReg::Eaddr => !write && level == PrivilegeLevel::Pl0,
            MachineReg::Console => write,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_word_validity() {
        assert_eq!(Flags::all().bits(), 0x3f);
        assert!(Flags::from_bits(0x40).is_none());
    }

    #[test]
    fn privilege_round_trip() {
        let mut flags = Flags::default();
        assert_eq!(flags.privilege_level(), PrivilegeLevel::Pl0);
        flags.set_privilege_level(PrivilegeLevel::Pl1);
        assert_eq!(flags.privilege_level(), PrivilegeLevel::Pl1);
    }

    #[test]
    fn exception_registers_are_pl0_only() {
        for mreg in [
            MachineReg::Elr,
            MachineReg::Esp,
            MachineReg::Eflags,
            MachineReg::Evtable,
            MachineReg::Ectable,
        ] {
            assert!(mreg.allows(PrivilegeLevel::Pl0, true));
            assert!(!mreg.allows(PrivilegeLevel::Pl1, false));
        }
        assert!(!MachineReg::Einfo.allows(PrivilegeLevel::Pl0, true));
        assert!(MachineReg::Console.allows(PrivilegeLevel::Pl1, true));
        assert!(!MachineReg::Console.allows(PrivilegeLevel::Pl0, false));
    }
}
