//! Handler trampolines.
//!
//! A vector slot branches here with the interrupted context still live in
//! the register file. The trampoline saves all sixteen registers, calls
//! the handler routine, restores them and resumes via `eret`. The handler
//! therefore sees an ordinary call and may clobber anything.

use isa::encode::relative_words;
use isa::{Instruction, Register, Size};

use crate::image::{BuildError, ImageBuilder};

/// Length of one trampoline: 8 pair pushes, the call, 8 pair pops, `eret`.
pub const TRAMPOLINE_WORDS: usize = 18;

/// Appends a trampoline that wraps the handler routine at `handler`, and
/// returns the trampoline's address (the value to install in the vector
/// slot).
pub fn append_trampoline(
    builder: &mut ImageBuilder,
    handler: u64,
) -> Result<u64, BuildError> {
    let base = builder.cursor();
    // The call sits after the eight pushes.
    let call_at = base + 8 * 4;
    let offset_words = relative_words(call_at, handler)?;
    let offset_words = i32::try_from(offset_words).map_err(|_| {
        BuildError::Encode(isa::EncodeError::DisplacementOverflow {
            offset_words,
            bits: 22,
        })
    })?;

    let mut code = Vec::with_capacity(TRAMPOLINE_WORDS);
    for pair in Register::ALL.chunks(2) {
        code.push(Instruction::PushPair {
            size: Size::Word,
            src1: Some(pair[0]),
            src2: Some(pair[1]),
        });
    }
    code.push(Instruction::CallRel {
        cond: None,
        offset_words,
    });
    for pair in Register::ALL.chunks(2).rev() {
        code.push(Instruction::PopPair {
            size: Size::Word,
            dst1: pair[0],
            dst2: pair[1],
        });
    }
    code.push(Instruction::Eret);

    builder.append_code(&code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use isa::decode;

    #[test]
    fn trampoline_shape() {
        let mut builder = ImageBuilder::new();
        let handler = builder.append_code(&[Instruction::Ret]).unwrap();
        let addr = append_trampoline(&mut builder, handler).unwrap();

        let words: Vec<u32> = builder.bytes()[addr as usize..]
            .chunks(4)
            .take(TRAMPOLINE_WORDS)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
            .collect();
        assert_eq!(words.len(), TRAMPOLINE_WORDS);

        // save r0/r1 first, restore r14/r15 first, resume last
        assert_eq!(
            decode(words[0]),
            Some(Instruction::PushPair {
                size: Size::Word,
                src1: Some(Register::R0),
                src2: Some(Register::R1),
            })
        );
        assert!(matches!(
            decode(words[8]),
            Some(Instruction::CallRel { cond: None, .. })
        ));
        assert_eq!(
            decode(words[9]),
            Some(Instruction::PopPair {
                size: Size::Word,
                dst1: Register::Fp,
                dst2: Register::Lr,
            })
        );
        assert_eq!(decode(words[17]), Some(Instruction::Eret));
    }

    #[test]
    fn call_targets_the_handler() {
        let mut builder = ImageBuilder::new();
        let handler = builder.append_code(&[Instruction::Ret]).unwrap();
        let addr = append_trampoline(&mut builder, handler).unwrap();

        let call_at = addr + 8 * 4;
        let word = u32::from_le_bytes(
            builder.bytes()[call_at as usize..call_at as usize + 4]
                .try_into()
                .unwrap(),
        );
        let Some(Instruction::CallRel { offset_words, .. }) = decode(word) else {
            panic!("expected a call at word 8");
        };
        assert_eq!(
            (call_at + 4).wrapping_add((offset_words as i64 * 4) as u64),
            handler
        );
    }
}
