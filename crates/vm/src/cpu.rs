use isa::einfo::{self, ExceptionKind};
use isa::tables::{self, ContextTable, ContextFlags, CONTEXT_TABLE_SIZE};
use isa::{
    decode, Condition, Flags, Instruction, MachineReg, PrivilegeLevel, Register, Size,
    RESET_VECTOR,
};

use crate::host::HostInterface;
use crate::memory::Memory;

/// An architectural exception, with its hardware-produced payload.
///
/// This is the machine-internal shape; on dispatch it is flattened into
/// the `einfo` register using the codec in [`isa::einfo`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Exception {
    Unknown,
    InvalidInstruction,
    Debug,
    User(u16),
    InvalidOperation,
    InstructionLoadError,
    DataLoadError {
        address: u64,
        write: bool,
        byte_size: u16,
    },
    Interrupt(u64),
}

impl Exception {
    pub fn kind(&self) -> ExceptionKind {
        match self {
            Exception::Unknown => ExceptionKind::Unknown,
            Exception::InvalidInstruction => ExceptionKind::InvalidInstruction,
            Exception::Debug => ExceptionKind::Debug,
            Exception::User(_) => ExceptionKind::User,
            Exception::InvalidOperation => ExceptionKind::InvalidOperation,
            Exception::InstructionLoadError => ExceptionKind::InstructionLoadError,
            Exception::DataLoadError { .. } => ExceptionKind::DataLoadError,
            Exception::Interrupt(_) => ExceptionKind::Interrupt,
        }
    }

    fn to_einfo(self) -> u64 {
        match self {
            Exception::User(value) => einfo::user(value),
            Exception::DataLoadError {
                write, byte_size, ..
            } => einfo::data_fault(write, byte_size),
            Exception::Interrupt(line) => einfo::interrupt(line),
            other => einfo::plain(other.kind()),
        }
    }
}

/// Where control goes after one instruction.
enum Flow {
    /// Fall through to the next word.
    Continue,
    /// Transfer to an absolute address (jump, call, trap vector, eret).
    Jump(u64),
    /// Stop the machine (harness convention: `ret` with a zero link
    /// register).
    Halt,
}

/// The processor: instruction pointer, the 16-register file, the flags
/// word, and the machine control registers backing the trap contract.
#[derive(Debug)]
pub struct Cpu {
    pub ip: u64,
    pub regs: [u64; 16],
    pub flags: Flags,

    // Exception state. `elr`/`eflags`/`esp` snapshot the interrupted
    // context on trap entry and feed `eret`; `einfo`/`eaddr` describe the
    // cause; `evtable`/`ectable` are installed once at boot.
    elr: u64,
    esp: u64,
    eflags: Flags,
    einfo: u64,
    eaddr: u64,
    evtable: u64,
    ectable: u64,
    /// The hardware's snapshot of the ECT, taken and validated when the
    /// `ectable` register is written.
    ect: ContextTable,
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            ip: RESET_VECTOR,
            regs: [0; 16],
            flags: Flags::default(),
            elr: 0,
            esp: 0,
            eflags: Flags::default(),
            einfo: 0,
            eaddr: 0,
            evtable: 0,
            ectable: 0,
            ect: ContextTable::default(),
        }
    }

    pub fn elr(&self) -> u64 {
        self.elr
    }

    pub fn esp(&self) -> u64 {
        self.esp
    }

    pub fn einfo(&self) -> u64 {
        self.einfo
    }

    pub fn eaddr(&self) -> u64 {
        self.eaddr
    }

    pub fn evtable(&self) -> u64 {
        self.evtable
    }

    pub fn ectable(&self) -> u64 {
        self.ectable
    }

    pub fn sp(&self) -> u64 {
        self.regs[Register::Sp.index()]
    }

    fn read_unsigned(&self, reg: Register, size: Size) -> u64 {
        self.regs[reg.index()] & size.mask()
    }

    fn read_signed(&self, reg: Register, size: Size) -> i64 {
        let value = self.read_unsigned(reg, size);
        if size != Size::Word && value & (1 << size.msb_index()) != 0 {
            (value | !size.mask()) as i64
        } else {
            value as i64
        }
    }

    /// Sized register write: bits above the operand size are preserved.
    fn write_sized(&mut self, reg: Register, size: Size, value: u64) {
        let slot = &mut self.regs[reg.index()];
        *slot = (*slot & !size.mask()) | (value & size.mask());
    }

    /// Executes one fetch/decode/execute cycle. Returns `false` once the
    /// machine has halted.
    pub fn step(&mut self, memory: &mut Memory, host: &mut dyn HostInterface) -> bool {
        let word = match memory.load_word(self.ip) {
            Some(word) => word,
            None => {
                self.ip = self.take_exception(Exception::InstructionLoadError);
                return true;
            }
        };

        let instr = match decode(word) {
            Some(instr) => instr,
            None => {
                self.ip = self.take_exception(Exception::InvalidInstruction);
                return true;
            }
        };

        log::trace!("ip={:#010x} word={:08x} {}", self.ip, word, instr);

        match self.execute(instr, memory, host) {
            Ok(Flow::Continue) => {
                self.ip += 4;
                true
            }
            Ok(Flow::Jump(dest)) => {
                if dest % 4 != 0 {
                    self.ip = self.take_exception(Exception::InvalidOperation);
                } else {
                    self.ip = dest;
                }
                true
            }
            Ok(Flow::Halt) => false,
            Err(exception) => {
                self.ip = self.take_exception(exception);
                true
            }
        }
    }

    /// Delivers an exception to the current context, exactly as a trap
    /// taken at the current instruction pointer. Test harnesses use this
    /// to synthesize causes the guest cannot raise directly (interrupts,
    /// or specific kinds without their usual trigger).
    pub fn inject(&mut self, exception: Exception) {
        self.ip = self.take_exception(exception);
    }

    /// The hardware trap-entry sequence.
    ///
    /// Snapshots the interrupted context (flags, ip, sp), disables
    /// exception delivery, drops to pl0, produces `einfo`/`eaddr`,
    /// performs the ECT trap-stack switch for the interrupted privilege
    /// level, and returns the EVT slot address control vectors through.
    fn take_exception(&mut self, exception: Exception) -> u64 {
        let kind = exception.kind();
        log::debug!("exception {:?} at ip={:#x}", exception, self.ip);

        self.eflags = self.flags;
        self.elr = self.ip;
        self.esp = self.sp();
        self.flags.remove(Flags::EXCEPTIONS_ENABLED);
        self.flags.set_privilege_level(PrivilegeLevel::Pl0);

        self.einfo = exception.to_einfo();
        self.eaddr = match exception {
            Exception::DataLoadError { address, .. } => address,
            _ => 0,
        };

        let level = self.eflags.privilege_level();
        let entry = self.ect.entry(level, kind);
        let sp = self.sp();
        let stack_base = entry.stack_pointer;
        let stack_top = entry.stack_pointer.wrapping_add(entry.stack_size);
        if entry.flags.contains(ContextFlags::USE_STACK) && (sp < stack_base || sp > stack_top) {
            self.regs[Register::Sp.index()] = stack_top;
        }

        self.evtable + tables::vector_offset(level, kind)
    }

    fn execute(
        &mut self,
        instr: Instruction,
        memory: &mut Memory,
        host: &mut dyn HostInterface,
    ) -> Result<Flow, Exception> {
        use Instruction::*;
        match instr {
            // ===== stack =====
            PushSingle { size, src } => {
                let value = src.map(|r| self.read_unsigned(r, size)).unwrap_or(0);
                self.push(memory, size, &[value])?;
            }
            PushPair { size, src1, src2 } => {
                let value1 = src1.map(|r| self.read_unsigned(r, size)).unwrap_or(0);
                let value2 = src2.map(|r| self.read_unsigned(r, size)).unwrap_or(0);
                self.push(memory, size, &[value1, value2])?;
            }
            PopSingle { size, dst } => {
                let ([value], new_sp) = self.pop(memory, size)?;
                if let Some(dst) = dst {
                    self.write_sized(dst, size, value);
                }
                self.regs[Register::Sp.index()] = new_sp;
            }
            PopPair { size, dst1, dst2 } => {
                let ([value1, value2], new_sp) = self.pop(memory, size)?;
                self.write_sized(dst1, size, value1);
                self.write_sized(dst2, size, value2);
                self.regs[Register::Sp.index()] = new_sp;
            }

            // ===== memory =====
            Load { size, dst, addr } => {
                let address = self.regs[addr.index()];
                let value = memory
                    .load_sized(address, size)
                    .ok_or(Exception::DataLoadError {
                        address,
                        write: false,
                        byte_size: size.byte_size() as u16,
                    })?;
                self.write_sized(dst, size, value);
            }
            Store { size, addr, src } => {
                let address = self.regs[addr.index()];
                let value = self.regs[src.index()];
                memory
                    .store_sized(address, size, value)
                    .ok_or(Exception::DataLoadError {
                        address,
                        write: true,
                        byte_size: size.byte_size() as u16,
                    })?;
            }
            LoadImm {
                dst,
                value,
                shift,
                clear,
            } => {
                use isa::instruction::ClearMode;
                let shift = shift as u32;
                let old = self.regs[dst.index()];
                let mask = (0xffffu64).checked_shl(shift).unwrap_or(0);
                let shifted = (value as u64).checked_shl(shift).unwrap_or(0);
                let cleared = (old & !mask)
                    & match clear {
                        ClearMode::None => u64::MAX,
                        ClearMode::Lower => u64::MAX.checked_shl(shift).unwrap_or(0),
                        ClearMode::Upper => !(u64::MAX.checked_shl(shift + 16).unwrap_or(0)),
                        ClearMode::All => 0,
                    };
                self.regs[dst.index()] = cleared | shifted;
            }
            LoadRel { dst, offset } => {
                self.regs[dst.index()] = (self.ip + 4).wrapping_add(offset as i64 as u64);
            }
            Copy { size, dst, src } => {
                let value = self.read_unsigned(src, size);
                self.write_sized(dst, size, value);
            }

            // ===== arithmetic and logic =====
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
                let lhs_val = self.read_signed(lhs, size) as u64;
                let rhs_val = imm11_shifted(value, shift_factor, sign_extend);
                let carry_in = (carry && self.flags.contains(Flags::CARRY)) as u64;
                let result = lhs_val.wrapping_add(rhs_val).wrapping_add(carry_in);
                if let Some(dst) = dst {
                    self.write_sized(dst, size, result);
                }
                if set_flags {
                    self.set_add_flags(size, lhs_val, rhs_val, result);
                }
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
                let lhs_val = self.read_signed(lhs, size) as u64;
                let rhs_val = imm11_shifted(value, shift_factor, sign_extend);
                let borrow_in = (borrow && self.flags.contains(Flags::CARRY)) as u64;
                let result = lhs_val.wrapping_sub(rhs_val).wrapping_sub(borrow_in);
                if let Some(dst) = dst {
                    self.write_sized(dst, size, result);
                }
                if set_flags {
                    self.set_sub_flags(size, lhs_val, rhs_val, result);
                }
            }
            AndImm {
                size,
                dst,
                lhs,
                value,
                shift_factor,
                set_flags,
            } => {
                let result = self.read_unsigned(lhs, size) & imm11_shifted(value, shift_factor, false);
                if let Some(dst) = dst {
                    self.write_sized(dst, size, result);
                }
                if set_flags {
                    self.flags.remove(Flags::OVERFLOW);
                    self.flags.set(Flags::ZERO, result & size.mask() == 0);
                    self.flags
                        .set(Flags::SIGN, result & (1 << size.msb_index()) != 0);
                }
            }
            ShrImm {
                size,
                dst,
                lhs,
                amount,
                signed,
                set_flags,
            } => {
                let lhs_val = self.read_unsigned(lhs, size);
                let amount = amount as u32;
                let too_big = amount >= size.bit_size();
                let msb_set = lhs_val & (1 << size.msb_index()) != 0;
                let result = if too_big {
                    if signed && msb_set { u64::MAX } else { 0 }
                } else if signed {
                    ((lhs_val as i64) >> amount) as u64
                } else {
                    lhs_val >> amount
                };
                if let Some(dst) = dst {
                    self.write_sized(dst, size, result);
                }
                if set_flags {
                    if amount != 0 {
                        let carry_bit = if too_big { size.msb_index() } else { amount - 1 };
                        self.flags
                            .set(Flags::CARRY, lhs_val & (1u64 << carry_bit) != 0);
                    }
                    self.flags.remove(Flags::OVERFLOW);
                    self.flags.set(Flags::ZERO, result & size.mask() == 0);
                    self.flags
                        .set(Flags::SIGN, result & (1 << size.msb_index()) != 0);
                }
            }
            Div {
                size,
                quot,
                rem,
                lhs,
                rhs,
                signed,
                set_flags,
            } => {
                // Division by zero has no architected result; it faults.
                let (quotient, remainder) = if signed {
                    let lhs_val = self.read_signed(lhs, size);
                    let rhs_val = self.read_signed(rhs, size);
                    if rhs_val == 0 {
                        return Err(Exception::InvalidOperation);
                    }
                    (
                        lhs_val.wrapping_div(rhs_val) as u64,
                        lhs_val.wrapping_rem(rhs_val) as u64,
                    )
                } else {
                    let lhs_val = self.read_unsigned(lhs, size);
                    let rhs_val = self.read_unsigned(rhs, size);
                    if rhs_val == 0 {
                        return Err(Exception::InvalidOperation);
                    }
                    (lhs_val / rhs_val, lhs_val % rhs_val)
                };
                if quot != rem {
                    self.write_sized(rem, size, remainder);
                }
                self.write_sized(quot, size, quotient);
                if set_flags {
                    self.flags.set(Flags::ZERO, quotient & size.mask() == 0);
                    self.flags
                        .set(Flags::SIGN, quotient & (1 << size.msb_index()) != 0);
                }
            }

            // ===== control flow =====
            JumpRel { cond, offset_words } => {
                if self.condition_passes(cond) {
                    return Ok(Flow::Jump(self.relative_target(offset_words)));
                }
            }
            CompareJumpRel {
                cond,
                size,
                lhs,
                rhs,
                offset_words,
            } => {
                if self.compare(size, lhs, rhs, cond) {
                    return Ok(Flow::Jump(self.relative_target(offset_words)));
                }
            }
            CallRel { cond, offset_words } => {
                if self.condition_passes(cond) {
                    self.regs[Register::Lr.index()] = self.ip + 4;
                    return Ok(Flow::Jump(self.relative_target(offset_words)));
                }
            }
            Ret => {
                let target = self.regs[Register::Lr.index()];
                if target == 0 {
                    return Ok(Flow::Halt);
                }
                return Ok(Flow::Jump(target));
            }
            Eret => {
                if self.flags.privilege_level() != PrivilegeLevel::Pl0 {
                    return Err(Exception::InvalidOperation);
                }
                let target = self.elr;
                self.flags = self.eflags;
                self.regs[Register::Sp.index()] = self.esp;
                return Ok(Flow::Jump(target));
            }
            Udf => return Err(Exception::InvalidInstruction),
            Dbg => return Err(Exception::Debug),
            UserTrap { value } => {
                // The trap instruction retires first: elr resumes after it.
                self.ip += 4;
                let vector = self.take_exception(Exception::User(value));
                return Ok(Flow::Jump(vector));
            }
            Nop => {}

            // ===== machine registers =====
            ReadMachine { dst, id } => {
                let mreg = MachineReg::from_id(id).ok_or(Exception::InvalidOperation)?;
                if !mreg.allows(self.flags.privilege_level(), false) {
                    return Err(Exception::InvalidOperation);
                }
                self.regs[dst.index()] = match mreg {
                    MachineReg::Flags => self.flags.bits(),
                    MachineReg::Elr => self.elr,
                    MachineReg::Esp => self.esp,
                    MachineReg::Eflags => self.eflags.bits(),
                    MachineReg::Einfo => self.einfo,
                    MachineReg::Eaddr => self.eaddr,
                    MachineReg::Evtable => self.evtable,
                    MachineReg::Ectable => self.ectable,
                    // Console reads are rejected by the access check.
                    MachineReg::Console => unreachable!(),
                };
            }
            WriteMachine { id, src } => {
                let mreg = MachineReg::from_id(id).ok_or(Exception::InvalidOperation)?;
                if !mreg.allows(self.flags.privilege_level(), true) {
                    return Err(Exception::InvalidOperation);
                }
                let value = self.regs[src.index()];
                match mreg {
                    MachineReg::Flags => {
                        self.flags =
                            Flags::from_bits(value).ok_or(Exception::InvalidOperation)?;
                    }
                    MachineReg::Elr => {
                        if value % 4 != 0 {
                            return Err(Exception::InvalidOperation);
                        }
                        self.elr = value;
                    }
                    MachineReg::Esp => self.esp = value,
                    MachineReg::Eflags => {
                        self.eflags =
                            Flags::from_bits(value).ok_or(Exception::InvalidOperation)?;
                    }
                    MachineReg::Evtable => {
                        if value % 4 != 0 {
                            return Err(Exception::InvalidOperation);
                        }
                        self.evtable = value;
                    }
                    MachineReg::Ectable => {
                        // The hardware snapshots the table at install time,
                        // validating every entry's flag word.
                        let bytes = memory.slice(value, CONTEXT_TABLE_SIZE).ok_or(
                            Exception::DataLoadError {
                                address: value,
                                write: false,
                                byte_size: CONTEXT_TABLE_SIZE as u16,
                            },
                        )?;
                        let table = ContextTable::from_bytes(bytes)
                            .ok_or(Exception::InvalidOperation)?;
                        self.ectable = value;
                        self.ect = table;
                    }
                    MachineReg::Console => host.put_char(value as u8),
                    // einfo/eaddr writes are rejected by the access check.
                    MachineReg::Einfo | MachineReg::Eaddr => unreachable!(),
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// The whole window is claimed before any byte is written, so a push
    /// that faults leaves memory untouched.
    fn push(&mut self, memory: &mut Memory, size: Size, values: &[u64]) -> Result<(), Exception> {
        let byte_size = size.byte_size();
        let total = byte_size * values.len() as u64;
        let new_sp = self.sp().wrapping_sub(total);
        let window = memory
            .slice_mut(new_sp, total)
            .ok_or(Exception::DataLoadError {
                address: new_sp,
                write: true,
                byte_size: total as u16,
            })?;
        for (chunk, &value) in window.chunks_mut(byte_size as usize).zip(values) {
            chunk.copy_from_slice(&value.to_le_bytes()[..byte_size as usize]);
        }
        self.regs[Register::Sp.index()] = new_sp;
        Ok(())
    }

    /// Reads `N` stack slots and returns them with the post-pop stack
    /// pointer. The caller writes sp last, after the destination
    /// registers, so a pop that names sp as a destination ends with the
    /// adjusted stack pointer.
    fn pop<const N: usize>(
        &self,
        memory: &Memory,
        size: Size,
    ) -> Result<([u64; N], u64), Exception> {
        let byte_size = size.byte_size();
        let total = byte_size * N as u64;
        let sp = self.sp();
        let mut values = [0u64; N];
        for (i, value) in values.iter_mut().enumerate() {
            *value = memory
                .load_sized(sp + byte_size * i as u64, size)
                .ok_or(Exception::DataLoadError {
                    address: sp,
                    write: false,
                    byte_size: total as u16,
                })?;
        }
        Ok((values, sp + total))
    }

    fn relative_target(&self, offset_words: i32) -> u64 {
        (self.ip + 4).wrapping_add((offset_words as i64 * 4) as u64)
    }

    fn condition_passes(&self, cond: Option<Condition>) -> bool {
        cond.map(|c| self.flags.test(c)).unwrap_or(true)
    }

    /// Compare-and-jump condition check: computes the subtraction flags
    /// without storing them.
    fn compare(&self, size: Size, lhs: Register, rhs: Register, cond: Condition) -> bool {
        let lhs_val = self.read_signed(lhs, size) as u64;
        let rhs_val = self.read_signed(rhs, size) as u64;
        let result = lhs_val.wrapping_sub(rhs_val);
        let msb = 1u64 << size.msb_index();

        let lhs_msb = lhs_val & msb != 0;
        let rhs_msb = rhs_val & msb != 0;
        let res_msb = result & msb != 0;

        let carry = (!lhs_msb && rhs_msb) || (res_msb && rhs_msb) || (res_msb && !lhs_msb);
        let zero = result & size.mask() == 0;
        let overflow = (lhs_msb && !rhs_msb && !res_msb) || (!lhs_msb && rhs_msb && res_msb);
        let sign = res_msb;

        match cond {
            Condition::Carry => carry,
            Condition::NotCarry => !carry,
            Condition::Zero => zero,
            Condition::NotZero => !zero,
            Condition::Overflow => overflow,
            Condition::NotOverflow => !overflow,
            Condition::Sign => sign,
            Condition::NotSign => !sign,
        }
    }

    fn set_add_flags(&mut self, size: Size, lhs: u64, rhs: u64, result: u64) {
        let msb = 1u64 << size.msb_index();
        let (l, r, res) = (lhs & msb != 0, rhs & msb != 0, result & msb != 0);
        self.flags
            .set(Flags::CARRY, (l && r) || ((l || r) && !res));
        self.flags.set(Flags::ZERO, result & size.mask() == 0);
        self.flags
            .set(Flags::OVERFLOW, (l && r && !res) || (!l && !r && res));
        self.flags.set(Flags::SIGN, res);
    }

    fn set_sub_flags(&mut self, size: Size, lhs: u64, rhs: u64, result: u64) {
        let msb = 1u64 << size.msb_index();
        let (l, r, res) = (lhs & msb != 0, rhs & msb != 0, result & msb != 0);
        self.flags
            .set(Flags::CARRY, (!l && r) || (res && r) || (res && !l));
        self.flags.set(Flags::ZERO, result & size.mask() == 0);
        self.flags
            .set(Flags::OVERFLOW, (l && !r && !res) || (!l && r && res));
        self.flags.set(Flags::SIGN, res);
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

/// Expands an 11-bit immediate by the 3-bit shift factor (multiples of 11
/// bits), optionally sign-extending from the shifted field's top bit.
fn imm11_shifted(value: u16, shift_factor: u8, sign_extend: bool) -> u64 {
    // shift_factor is a 3-bit field, so the shift can exceed the word
    let shift = shift_factor as u32 * 11;
    let mut imm = (value as u64).checked_shl(shift).unwrap_or(0);
    let msb = shift + 10;
    if sign_extend && msb < 63 && imm & (1u64 << msb) != 0 {
        imm |= u64::MAX << (msb + 1);
    }
    imm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imm11_shift_and_sign_extension() {
        assert_eq!(imm11_shifted(0x7ff, 0, false), 0x7ff);
        assert_eq!(imm11_shifted(0x7ff, 0, true), u64::MAX);
        assert_eq!(imm11_shifted(1, 1, false), 1 << 11);
        assert_eq!(imm11_shifted(0x400, 1, true), u64::MAX << 21);
    }
}
