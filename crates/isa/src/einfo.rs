//! Codec for the `einfo` machine register.
//!
//! `einfo` is a single 64-bit value the hardware produces on every trap
//! entry, describing why the trap occurred. Layout, low to high:
//!
//! - bits[0:3)  exception kind (all eight 3-bit values are defined)
//! - bit[3]     write-access flag (memory faults only)
//! - bits[4:20) access size in bytes (memory faults only)
//!
//! For `user` exceptions the 16-bit software-supplied value sits at
//! bits[3:19) instead: the write flag carries no meaning for a software
//! trap, so the value field starts one bit lower. The asymmetry is part of
//! the hardware encoding and is preserved here exactly; decode with the
//! accessor that matches the kind.

/// The eight architectural exception kinds, as found in bits[0:3) of
/// `einfo` and as indices into the vector and context tables.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExceptionKind {
    Unknown = 0,
    InvalidInstruction = 1,
    Debug = 2,
    User = 3,
    InvalidOperation = 4,
    InstructionLoadError = 5,
    DataLoadError = 6,
    Interrupt = 7,
}

impl ExceptionKind {
    pub const ALL: [ExceptionKind; 8] = [
        ExceptionKind::Unknown,
        ExceptionKind::InvalidInstruction,
        ExceptionKind::Debug,
        ExceptionKind::User,
        ExceptionKind::InvalidOperation,
        ExceptionKind::InstructionLoadError,
        ExceptionKind::DataLoadError,
        ExceptionKind::Interrupt,
    ];

    pub const fn id(self) -> u64 {
        self as u64
    }
}

/// Extracts the exception kind from bits[0:3).
///
/// The field is 3 bits wide and all eight values are enumerated, so this
/// is total; there is no unrecognized-kind error path at this layer.
pub fn kind(einfo: u64) -> ExceptionKind {
    match einfo & 0x7 {
        0 => ExceptionKind::Unknown,
        1 => ExceptionKind::InvalidInstruction,
        2 => ExceptionKind::Debug,
        3 => ExceptionKind::User,
        4 => ExceptionKind::InvalidOperation,
        5 => ExceptionKind::InstructionLoadError,
        6 => ExceptionKind::DataLoadError,
        _ => ExceptionKind::Interrupt,
    }
}

/// Extracts the 16-bit software value of a `user` exception, bits[3:19).
/// Meaningful only when [`kind`] is [`ExceptionKind::User`].
pub fn user_value(einfo: u64) -> u16 {
    ((einfo >> 3) & 0xffff) as u16
}

/// Whether a memory fault was a write, bit[3]. Meaningful only for
/// [`ExceptionKind::DataLoadError`].
pub fn is_write(einfo: u64) -> bool {
    (einfo & (1 << 3)) != 0
}

/// Byte size of the faulting access, bits[4:20). Meaningful only for
/// [`ExceptionKind::DataLoadError`].
pub fn access_size(einfo: u64) -> u16 {
    ((einfo >> 4) & 0xffff) as u16
}

/// Packs a payload-free exception kind.
pub fn plain(kind: ExceptionKind) -> u64 {
    kind.id()
}

/// Packs a `user` exception with its 16-bit software value.
pub fn user(value: u16) -> u64 {
    ExceptionKind::User.id() | ((value as u64) << 3)
}

/// Packs a data-load fault with the write flag and access size.
pub fn data_fault(write: bool, byte_size: u16) -> u64 {
    ExceptionKind::DataLoadError.id()
        | (if write { 1 << 3 } else { 0 })
        | ((byte_size as u64) << 4)
}

/// Packs an interrupt with its line number.
pub fn interrupt(line: u64) -> u64 {
    ExceptionKind::Interrupt.id() | (line << 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_round_trip() {
        for value in [0u16, 1, 0x1234, 0xffff] {
            let einfo = user(value);
            assert_eq!(kind(einfo), ExceptionKind::User);
            assert_eq!(user_value(einfo), value);
        }
    }

    #[test]
    fn data_fault_round_trip() {
        for (write, size) in [(false, 1u16), (true, 8), (true, 0xffff)] {
            let einfo = data_fault(write, size);
            assert_eq!(kind(einfo), ExceptionKind::DataLoadError);
            assert_eq!(is_write(einfo), write);
            assert_eq!(access_size(einfo), size);
        }
    }

    // The user-value field starts at bit 3 while the access-size field
    // starts at bit 4; the same bit pattern decodes differently depending
    // on the kind accessor used.
    #[test]
    fn user_and_fault_fields_are_offset_by_one_bit() {
        let einfo = user(0x1234);
        assert_eq!(user_value(einfo), 0x1234);
        assert_eq!(access_size(einfo), (0x1234 << 3) >> 4);

        let einfo = data_fault(false, 0x1234);
        assert_eq!(access_size(einfo), 0x1234);
        assert_eq!(user_value(einfo) as u32, (0x1234u32 << 4 >> 3) & 0xffff);
    }

    #[test]
    fn kind_decode_is_total() {
        for k in ExceptionKind::ALL {
            assert_eq!(kind(plain(k)), k);
        }
    }

    #[test]
    fn interrupt_carries_line() {
        let einfo = interrupt(5);
        assert_eq!(kind(einfo), ExceptionKind::Interrupt);
        assert_eq!(einfo >> 3, 5);
    }
}
