//! Boot-image builder.
//!
//! An image is a flat little-endian byte vector loaded at address zero.
//! The region below the reset vector is reserved; the boot sequence
//! occupies the words starting at [`RESET_VECTOR`]; tables, trampolines,
//! handlers and application code are appended behind it in whatever order
//! the caller allocates them.

use core::fmt;

use isa::encode::{encode_all, encode_branch_link, EncodeError};
use isa::tables::{
    self, ContextEntry, CONTEXT_TABLE_SIZE, VECTOR_TABLE_SIZE,
};
use isa::{ExceptionKind, Instruction, PrivilegeLevel, RESET_VECTOR};

use crate::boot::BOOT_WORDS;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// An instruction or branch displacement failed to encode.
    Encode(EncodeError),
    /// A vector was installed before the vector table was allocated.
    NoVectorTable,
    /// A context entry was set before the context table was allocated.
    NoContextTable,
    /// The boot stack top cannot be materialized by the single-word load
    /// the boot sequence uses (it must be a 16-bit value shifted left 16).
    BadStackTop { value: u64 },
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::Encode(err) => write!(f, "encoding failed: {}", err),
            BuildError::NoVectorTable => write!(f, "vector table has not been allocated"),
            BuildError::NoContextTable => write!(f, "context table has not been allocated"),
            BuildError::BadStackTop { value } => {
                write!(f, "stack top {:#x} is not a 16-bit value shifted left 16", value)
            }
        }
    }
}

impl std::error::Error for BuildError {}

impl From<EncodeError> for BuildError {
    fn from(err: EncodeError) -> Self {
        BuildError::Encode(err)
    }
}

/// Builds one boot image: reserved low region, boot words, then appended
/// allocations. Addresses handed out are final; nothing moves once placed.
#[derive(Debug)]
pub struct ImageBuilder {
    bytes: Vec<u8>,
    vector_table: Option<u64>,
    context_table: Option<u64>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        // Reserve up to the end of the boot sequence. The reserved bytes
        // are zero, which decodes as `udf`, so a stray jump into them
        // faults instead of executing garbage.
        Self {
            bytes: vec![0; RESET_VECTOR as usize + BOOT_WORDS * 4],
            vector_table: None,
            context_table: None,
        }
    }

    /// The address the next allocation will land at.
    pub fn cursor(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn vector_table(&self) -> Option<u64> {
        self.vector_table
    }

    pub fn context_table(&self) -> Option<u64> {
        self.context_table
    }

    fn align(&mut self) {
        while self.bytes.len() % 4 != 0 {
            self.bytes.push(0);
        }
    }

    /// Appends zero-filled space and returns its address.
    pub fn reserve(&mut self, len: u64) -> u64 {
        let addr = self.cursor();
        self.bytes.resize(self.bytes.len() + len as usize, 0);
        self.align();
        addr
    }

    /// Appends encoded instructions and returns the address of the first.
    pub fn append_code(&mut self, code: &[Instruction]) -> Result<u64, BuildError> {
        let addr = self.cursor();
        self.bytes.extend_from_slice(&encode_all(code)?);
        Ok(addr)
    }

    /// Appends raw data, padded to word alignment, and returns its address.
    pub fn append_data(&mut self, data: &[u8]) -> u64 {
        let addr = self.cursor();
        self.bytes.extend_from_slice(data);
        self.align();
        addr
    }

    /// Allocates the exception vector table. Every slot starts zeroed, so
    /// an exception kind that was never installed faults on arrival rather
    /// than running whatever happens to be there.
    pub fn alloc_vector_table(&mut self) -> u64 {
        let addr = self.reserve(VECTOR_TABLE_SIZE);
        self.vector_table = Some(addr);
        addr
    }

    /// Allocates the exception context table, all entries zeroed (no trap
    /// stacks).
    pub fn alloc_context_table(&mut self) -> u64 {
        let addr = self.reserve(CONTEXT_TABLE_SIZE);
        self.context_table = Some(addr);
        addr
    }

    /// Points the vector slot for `(level, kind)` at `handler` by patching
    /// a relative branch into the slot's first word.
    ///
    /// Re-installing the same pair overwrites the previous branch; with the
    /// same handler the patch is byte-identical, so installation is
    /// idempotent.
    pub fn install_vector(
        &mut self,
        level: PrivilegeLevel,
        kind: ExceptionKind,
        handler: u64,
    ) -> Result<(), BuildError> {
        let base = self.vector_table.ok_or(BuildError::NoVectorTable)?;
        let slot = base + tables::vector_offset(level, kind);
        let word = encode_branch_link(slot, handler)?;
        log::debug!(
            "vector {:?}/{:?}: slot {:#x} -> handler {:#x}",
            level,
            kind,
            slot,
            handler
        );
        self.patch_word(slot, word);
        Ok(())
    }

    /// Writes the context entry for `(level, kind)` into the allocated
    /// context table.
    pub fn set_context(
        &mut self,
        level: PrivilegeLevel,
        kind: ExceptionKind,
        entry: ContextEntry,
    ) -> Result<(), BuildError> {
        let base = self.context_table.ok_or(BuildError::NoContextTable)?;
        let offset = (base + tables::context_offset(level, kind)) as usize;
        self.bytes[offset..offset + 8].copy_from_slice(&entry.flags.bits().to_le_bytes());
        self.bytes[offset + 8..offset + 16].copy_from_slice(&entry.stack_pointer.to_le_bytes());
        self.bytes[offset + 16..offset + 24].copy_from_slice(&entry.stack_size.to_le_bytes());
        Ok(())
    }

    pub(crate) fn patch_word(&mut self, addr: u64, word: u32) {
        let offset = addr as usize;
        self.bytes[offset..offset + 4].copy_from_slice(&word.to_le_bytes());
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isa::tables::ContextFlags;

    #[test]
    fn allocations_are_word_aligned() {
        let mut builder = ImageBuilder::new();
        assert_eq!(builder.cursor() % 4, 0);
        builder.append_data(b"abc");
        assert_eq!(builder.cursor() % 4, 0);
        let table = builder.alloc_vector_table();
        assert_eq!(table % 4, 0);
    }

    #[test]
    fn install_before_alloc_is_an_error() {
        let mut builder = ImageBuilder::new();
        assert_eq!(
            builder.install_vector(PrivilegeLevel::Pl0, ExceptionKind::User, 0x1000),
            Err(BuildError::NoVectorTable)
        );
        let entry = ContextEntry::default();
        assert_eq!(
            builder.set_context(PrivilegeLevel::Pl0, ExceptionKind::User, entry),
            Err(BuildError::NoContextTable)
        );
    }

    #[test]
    fn vector_installation_is_idempotent() {
        let mut a = ImageBuilder::new();
        a.alloc_vector_table();
        a.install_vector(PrivilegeLevel::Pl1, ExceptionKind::User, 0x2000)
            .unwrap();
        let once = a.bytes().to_vec();
        a.install_vector(PrivilegeLevel::Pl1, ExceptionKind::User, 0x2000)
            .unwrap();
        assert_eq!(a.bytes(), &once[..]);
    }

    #[test]
    fn install_rejects_out_of_range_handler() {
        let mut builder = ImageBuilder::new();
        builder.alloc_vector_table();
        let far = 1 << 24;
        assert!(matches!(
            builder.install_vector(PrivilegeLevel::Pl0, ExceptionKind::Debug, far),
            Err(BuildError::Encode(EncodeError::DisplacementOverflow { .. }))
        ));
    }

    #[test]
    fn context_entry_lands_at_its_offset() {
        let mut builder = ImageBuilder::new();
        let base = builder.alloc_context_table();
        let entry = ContextEntry {
            flags: ContextFlags::USE_STACK,
            stack_pointer: 0x8000,
            stack_size: 0x1000,
        };
        builder
            .set_context(PrivilegeLevel::Pl1, ExceptionKind::Interrupt, entry)
            .unwrap();
        let offset =
            (base + tables::context_offset(PrivilegeLevel::Pl1, ExceptionKind::Interrupt)) as usize;
        let bytes = builder.bytes();
        assert_eq!(bytes[offset], 0x01);
        assert_eq!(
            u64::from_le_bytes(bytes[offset + 8..offset + 16].try_into().unwrap()),
            0x8000
        );
    }
}
