//! The boot sequence.
//!
//! Six words at the reset vector: set the stack pointer, point the
//! hardware at both exception tables, and branch to the application entry.
//! Until the table registers are written every trap vectors through
//! address zero, so the boot sequence installs them before anything that
//! could fault.

use isa::encode::{encode, encode_branch_link};
use isa::instruction::ClearMode;
use isa::{Instruction, MachineReg, Register, RESET_VECTOR};

use crate::image::{BuildError, ImageBuilder};

/// Instruction words in the boot sequence.
pub const BOOT_WORDS: usize = 6;

/// What the boot sequence establishes before handing over to `entry`.
#[derive(Debug, Copy, Clone)]
pub struct BootSpec {
    /// Initial stack pointer. Must be a 16-bit value shifted left 16 so a
    /// single immediate load can materialize it.
    pub stack_top: u64,
    /// Application entry point, branched to as the last boot word.
    pub entry: u64,
}

/// Patches the boot sequence into the image's reserved words at the reset
/// vector. Both tables must already be allocated.
pub fn write_boot(builder: &mut ImageBuilder, spec: &BootSpec) -> Result<(), BuildError> {
    let evt = builder.vector_table().ok_or(BuildError::NoVectorTable)?;
    let ect = builder.context_table().ok_or(BuildError::NoContextTable)?;

    if spec.stack_top & 0xffff != 0 || spec.stack_top >> 32 != 0 {
        return Err(BuildError::BadStackTop {
            value: spec.stack_top,
        });
    }

    log::debug!(
        "boot: sp={:#x} evt={:#x} ect={:#x} entry={:#x}",
        spec.stack_top,
        evt,
        ect,
        spec.entry
    );

    let mut addr = RESET_VECTOR;
    let mut emit = |builder: &mut ImageBuilder, word: u32| {
        builder.patch_word(addr, word);
        addr += 4;
    };

    emit(
        builder,
        encode(&Instruction::LoadImm {
            dst: Register::Sp,
            value: (spec.stack_top >> 16) as u16,
            shift: 16,
            clear: ClearMode::All,
        })?,
    );
    emit(
        builder,
        encode(&Instruction::LoadRel {
            dst: Register::R0,
            offset: pc_relative(RESET_VECTOR + 4, evt)?,
        })?,
    );
    emit(
        builder,
        encode(&Instruction::WriteMachine {
            id: MachineReg::Evtable.id(),
            src: Register::R0,
        })?,
    );
    emit(
        builder,
        encode(&Instruction::LoadRel {
            dst: Register::R0,
            offset: pc_relative(RESET_VECTOR + 12, ect)?,
        })?,
    );
    emit(
        builder,
        encode(&Instruction::WriteMachine {
            id: MachineReg::Ectable.id(),
            src: Register::R0,
        })?,
    );
    emit(builder, encode_branch_link(RESET_VECTOR + 20, spec.entry)?);

    Ok(())
}

/// Byte displacement for a pc-relative address load at `at`.
fn pc_relative(at: u64, target: u64) -> Result<i32, BuildError> {
    let offset = (target as i64).wrapping_sub(at as i64 + 4);
    i32::try_from(offset).map_err(|_| {
        BuildError::Encode(isa::EncodeError::DisplacementOverflow {
            offset_words: offset / 4,
            bits: 22,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use isa::decode;

    fn boot_words(builder: &ImageBuilder) -> Vec<u32> {
        builder.bytes()[RESET_VECTOR as usize..]
            .chunks(4)
            .take(BOOT_WORDS)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn boot_requires_allocated_tables() {
        let mut builder = ImageBuilder::new();
        let spec = BootSpec {
            stack_top: 0x0100_0000,
            entry: 0x1000,
        };
        assert_eq!(write_boot(&mut builder, &spec), Err(BuildError::NoVectorTable));
        builder.alloc_vector_table();
        assert_eq!(write_boot(&mut builder, &spec), Err(BuildError::NoContextTable));
    }

    #[test]
    fn boot_rejects_unencodable_stack_top() {
        let mut builder = ImageBuilder::new();
        builder.alloc_vector_table();
        builder.alloc_context_table();
        let spec = BootSpec {
            stack_top: 0x0100_0008,
            entry: 0x1000,
        };
        assert_eq!(
            write_boot(&mut builder, &spec),
            Err(BuildError::BadStackTop { value: 0x0100_0008 })
        );
    }

    #[test]
    fn boot_sequence_decodes() {
        let mut builder = ImageBuilder::new();
        let evt = builder.alloc_vector_table();
        let entry = builder.append_code(&[Instruction::Ret]).unwrap();
        builder.alloc_context_table();
        write_boot(
            &mut builder,
            &BootSpec {
                stack_top: 0x0100_0000,
                entry,
            },
        )
        .unwrap();

        let words = boot_words(&builder);
        assert_eq!(
            decode(words[0]),
            Some(Instruction::LoadImm {
                dst: Register::Sp,
                value: 0x0100,
                shift: 16,
                clear: ClearMode::All,
            })
        );
        let Some(Instruction::LoadRel { dst: Register::R0, offset }) = decode(words[1]) else {
            panic!("expected a pc-relative load at word 1");
        };
        assert_eq!(RESET_VECTOR + 4 + 4 + offset as u64, evt);
        assert_eq!(
            decode(words[2]),
            Some(Instruction::WriteMachine {
                id: MachineReg::Evtable.id(),
                src: Register::R0,
            })
        );
        let Some(Instruction::JumpRel { cond: None, offset_words }) = decode(words[5]) else {
            panic!("expected the entry branch at word 5");
        };
        assert_eq!(
            RESET_VECTOR + 20 + 4 + (offset_words as i64 * 4) as u64,
            entry
        );
    }
}
