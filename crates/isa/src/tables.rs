//! Exception vector table (EVT) and exception context table (ECT) layouts.
//!
//! Both tables live at fixed, hardware-visible memory addresses and share
//! the same shape: one section per privilege level, eight entries per
//! section, one entry per exception kind. The hardware consumes them raw,
//! so the byte layout here is normative: little-endian, no padding.
//!
//! - EVT entry: 8 instruction words (32 bytes). On a trap the hardware
//!   jumps to the entry's first word, so a reachable entry must hold a
//!   valid branch before its exception kind can occur.
//! - ECT entry: `flags`, `stack_pointer`, `stack_size` (24 bytes),
//!   consulted by the hardware when switching into the trap.

use bitflags::bitflags;

use crate::einfo::ExceptionKind;
use crate::registers::PrivilegeLevel;

/// Instruction words per vector entry. Only the first word is executed by
/// the patching scheme in use; the rest is slack for longer thunks.
pub const VECTOR_ENTRY_WORDS: usize = 8;

/// Byte size of one vector entry.
pub const VECTOR_ENTRY_SIZE: u64 = (VECTOR_ENTRY_WORDS * 4) as u64;

/// Byte size of one privilege-level section of the EVT.
pub const VECTOR_SECTION_SIZE: u64 = VECTOR_ENTRY_SIZE * 8;

/// Byte size of the whole EVT.
pub const VECTOR_TABLE_SIZE: u64 = VECTOR_SECTION_SIZE * 2;

/// Byte size of one ECT entry.
pub const CONTEXT_ENTRY_SIZE: u64 = 24;

/// Byte size of the whole ECT.
pub const CONTEXT_TABLE_SIZE: u64 = CONTEXT_ENTRY_SIZE * 8 * 2;

/// Byte offset of a vector entry from the EVT base.
pub fn vector_offset(level: PrivilegeLevel, kind: ExceptionKind) -> u64 {
    (level as u64) * VECTOR_SECTION_SIZE + kind.id() * VECTOR_ENTRY_SIZE
}

/// Byte offset of a context entry from the ECT base.
pub fn context_offset(level: PrivilegeLevel, kind: ExceptionKind) -> u64 {
    (level as u64) * CONTEXT_ENTRY_SIZE * 8 + kind.id() * CONTEXT_ENTRY_SIZE
}

/// One EVT slot: a fixed-size instruction word buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VectorEntry {
    pub words: [u32; VECTOR_ENTRY_WORDS],
}

impl Default for VectorEntry {
    fn default() -> Self {
        Self {
            words: [0; VECTOR_ENTRY_WORDS],
        }
    }
}

/// The exception vector table: per-privilege-level, per-kind branch slots.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct VectorTable {
    pub pl0: [VectorEntry; 8],
    pub pl1: [VectorEntry; 8],
}

impl VectorTable {
    pub fn entry_mut(&mut self, level: PrivilegeLevel, kind: ExceptionKind) -> &mut VectorEntry {
        let section = match level {
            PrivilegeLevel::Pl0 => &mut self.pl0,
            PrivilegeLevel::Pl1 => &mut self.pl1,
        };
        &mut section[kind.id() as usize]
    }

    pub fn entry(&self, level: PrivilegeLevel, kind: ExceptionKind) -> &VectorEntry {
        let section = match level {
            PrivilegeLevel::Pl0 => &self.pl0,
            PrivilegeLevel::Pl1 => &self.pl1,
        };
        &section[kind.id() as usize]
    }

    /// Serializes the table exactly as the hardware expects it in memory.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(VECTOR_TABLE_SIZE as usize);
        for entry in self.pl0.iter().chain(self.pl1.iter()) {
            for word in entry.words {
                out.extend_from_slice(&word.to_le_bytes());
            }
        }
        out
    }
}

bitflags! {
    /// ECT entry flags. Unknown bits are rejected by the hardware when the
    /// table is installed.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct ContextFlags: u64 {
        /// Switch to the entry's trap stack on entry, unless the
        /// interrupted stack pointer already lies inside it.
        const USE_STACK = 1 << 0;
    }
}

/// One ECT entry: trap-handling context for a `(level, kind)` pair.
///
/// When `USE_STACK` is set, `stack_pointer`/`stack_size` describe the trap
/// stack region: `stack_pointer` is the base, the hardware switches sp to
/// `stack_pointer + stack_size` (the top). The region must be disjoint
/// from the application's own stack.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ContextEntry {
    pub flags: ContextFlags,
    pub stack_pointer: u64,
    pub stack_size: u64,
}

/// The exception context table, mirroring the EVT's shape.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ContextTable {
    pub pl0: [ContextEntry; 8],
    pub pl1: [ContextEntry; 8],
}

impl ContextTable {
    pub fn entry_mut(&mut self, level: PrivilegeLevel, kind: ExceptionKind) -> &mut ContextEntry {
        let section = match level {
            PrivilegeLevel::Pl0 => &mut self.pl0,
            PrivilegeLevel::Pl1 => &mut self.pl1,
        };
        &mut section[kind.id() as usize]
    }

    pub fn entry(&self, level: PrivilegeLevel, kind: ExceptionKind) -> &ContextEntry {
        let section = match level {
            PrivilegeLevel::Pl0 => &self.pl0,
            PrivilegeLevel::Pl1 => &self.pl1,
        };
        &section[kind.id() as usize]
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CONTEXT_TABLE_SIZE as usize);
        for entry in self.pl0.iter().chain(self.pl1.iter()) {
            out.extend_from_slice(&entry.flags.bits().to_le_bytes());
            out.extend_from_slice(&entry.stack_pointer.to_le_bytes());
            out.extend_from_slice(&entry.stack_size.to_le_bytes());
        }
        out
    }

    /// Parses a table from raw memory, as the machine does when software
    /// writes the `ectable` register. Returns `None` if the bytes are too
    /// short or any entry carries unknown flag bits.
    pub fn from_bytes(bytes: &[u8]) -> Option<ContextTable> {
        if bytes.len() < CONTEXT_TABLE_SIZE as usize {
            return None;
        }
        let mut table = ContextTable::default();
        for (i, entry) in table
            .pl0
            .iter_mut()
            .chain(table.pl1.iter_mut())
            .enumerate()
        {
            let base = i * CONTEXT_ENTRY_SIZE as usize;
            let word = |offset: usize| {
                u64::from_le_bytes(bytes[base + offset..base + offset + 8].try_into().unwrap())
            };
            entry.flags = ContextFlags::from_bits(word(0))?;
            entry.stack_pointer = word(8);
            entry.stack_size = word(16);
        }
        Some(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_sizes() {
        assert_eq!(VECTOR_TABLE_SIZE, 512);
        assert_eq!(CONTEXT_TABLE_SIZE, 384);
        assert_eq!(
            vector_offset(PrivilegeLevel::Pl1, ExceptionKind::Unknown),
            256
        );
        assert_eq!(vector_offset(PrivilegeLevel::Pl0, ExceptionKind::User), 96);
        assert_eq!(
            context_offset(PrivilegeLevel::Pl1, ExceptionKind::Interrupt),
            192 + 7 * 24
        );
    }

    #[test]
    fn context_table_round_trip() {
        let mut table = ContextTable::default();
        *table.entry_mut(PrivilegeLevel::Pl0, ExceptionKind::DataLoadError) = ContextEntry {
            flags: ContextFlags::USE_STACK,
            stack_pointer: 0x8000,
            stack_size: 0x1000,
        };
        let parsed = ContextTable::from_bytes(&table.to_bytes()).unwrap();
        assert_eq!(parsed, table);
    }

    #[test]
    fn context_table_rejects_unknown_flags() {
        let mut bytes = ContextTable::default().to_bytes();
        bytes[0] = 0x02; // undefined flag bit in the first entry
        assert!(ContextTable::from_bytes(&bytes).is_none());
    }
}
