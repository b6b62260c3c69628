//! Demo guest programs: small routines assembled from [`isa::Instruction`]
//! values and composed into bootable images with the `traps` builder.
//!
//! The routines follow the machine's calling convention: arguments in
//! r0/r1, scratch in the low registers, return via `lr`. Emitters return
//! the address
//! the routine landed at so call sites can compute their displacements.

use isa::encode::relative_words;
use isa::instruction::ClearMode;
use isa::{
    Condition, EncodeError, ExceptionKind, Instruction, MachineReg, PrivilegeLevel, Register,
    Size,
};
use traps::{append_trampoline, write_boot, BootSpec, BuildError, ImageBuilder};

use Instruction::*;

/// The value the demo passes through its software trap.
pub const DEMO_TRAP_VALUE: u16 = 0x1234;

/// Initial stack pointer for demo images.
pub const STACK_TOP: u64 = 0x0100_0000;

/// Everything the demo prints, in order: greeting, the trap handler's
/// report (decimal and hex), and the line proving execution resumed.
pub const EXPECTED_OUTPUT: &str = "Hello, world!\nuser trap 4660 0x1234\nAfter exc\n";

fn ldi(dst: Register, value: u16) -> Instruction {
    LoadImm {
        dst,
        value,
        shift: 0,
        clear: ClearMode::All,
    }
}

fn add(dst: Register, lhs: Register, value: u16) -> Instruction {
    AddImm {
        size: Size::Word,
        dst: Some(dst),
        lhs,
        value,
        shift_factor: 0,
        sign_extend: false,
        carry: false,
        set_flags: false,
    }
}

fn put_char(src: Register) -> Instruction {
    WriteMachine {
        id: MachineReg::Console.id(),
        src,
    }
}

/// A pc-relative address load for the instruction at `at`.
fn ldr_to(at: u64, dst: Register, target: u64) -> Result<Instruction, BuildError> {
    let offset = (target as i64).wrapping_sub(at as i64 + 4);
    let offset = i32::try_from(offset).map_err(|_| {
        BuildError::Encode(EncodeError::DisplacementOverflow {
            offset_words: offset / 4,
            bits: 22,
        })
    })?;
    Ok(LoadRel { dst, offset })
}

/// A call from the instruction at `at`.
fn call_to(at: u64, target: u64) -> Result<Instruction, BuildError> {
    let offset_words = relative_words(at, target)?;
    let offset_words = i32::try_from(offset_words).map_err(|_| {
        BuildError::Encode(EncodeError::DisplacementOverflow {
            offset_words,
            bits: 22,
        })
    })?;
    Ok(CallRel {
        cond: None,
        offset_words,
    })
}

/// Routine: print `r1` bytes starting at the address in `r0`.
/// Clobbers r0, r1, r2.
pub fn emit_print_str(builder: &mut ImageBuilder) -> Result<u64, BuildError> {
    builder.append_code(&[
        // loop:
        Load {
            size: Size::Byte,
            dst: Register::R2,
            addr: Register::R0,
        },
        put_char(Register::R2),
        add(Register::R0, Register::R0, 1),
        SubImm {
            size: Size::Word,
            dst: Some(Register::R1),
            lhs: Register::R1,
            value: 1,
            shift_factor: 0,
            sign_extend: false,
            borrow: false,
            set_flags: true,
        },
        JumpRel {
            cond: Some(Condition::NotZero),
            offset_words: -5,
        },
        Ret,
    ])
}

/// Routine: print the value in `r0` in decimal. Digits are pushed as they
/// come off the division loop and popped back in printing order.
/// Clobbers r0..r5 and uses the active stack.
pub fn emit_print_u64(builder: &mut ImageBuilder) -> Result<u64, BuildError> {
    builder.append_code(&[
        ldi(Register::R1, 10),
        ldi(Register::R4, 0),
        ldi(Register::R5, 0),
        // divide:
        Div {
            size: Size::Word,
            quot: Register::R2,
            rem: Register::R3,
            lhs: Register::R0,
            rhs: Register::R1,
            signed: false,
            set_flags: false,
        },
        add(Register::R3, Register::R3, b'0' as u16),
        PushSingle {
            size: Size::Word,
            src: Some(Register::R3),
        },
        add(Register::R5, Register::R5, 1),
        Copy {
            size: Size::Word,
            dst: Register::R0,
            src: Register::R2,
        },
        CompareJumpRel {
            cond: Condition::NotZero,
            size: Size::Word,
            lhs: Register::R0,
            rhs: Register::R4,
            offset_words: -6,
        },
        // drain:
        PopSingle {
            size: Size::Word,
            dst: Some(Register::R3),
        },
        put_char(Register::R3),
        SubImm {
            size: Size::Word,
            dst: Some(Register::R5),
            lhs: Register::R5,
            value: 1,
            shift_factor: 0,
            sign_extend: false,
            borrow: false,
            set_flags: true,
        },
        JumpRel {
            cond: Some(Condition::NotZero),
            offset_words: -4,
        },
        Ret,
    ])
}

/// Routine: print the low 16 bits of `r0` as four lowercase hex digits.
/// Clobbers r2, r3.
pub fn emit_print_hex16(builder: &mut ImageBuilder) -> Result<u64, BuildError> {
    let mut code = vec![ldi(Register::R3, 10)];
    for shift in [12u8, 8, 4, 0] {
        code.extend_from_slice(&[
            ShrImm {
                size: Size::Word,
                dst: Some(Register::R2),
                lhs: Register::R0,
                amount: shift,
                signed: false,
                set_flags: false,
            },
            AndImm {
                size: Size::Word,
                dst: Some(Register::R2),
                lhs: Register::R2,
                value: 0xf,
                shift_factor: 0,
                set_flags: false,
            },
            // nibble < 10: decimal digit, otherwise a letter
            CompareJumpRel {
                cond: Condition::Sign,
                size: Size::Word,
                lhs: Register::R2,
                rhs: Register::R3,
                offset_words: 2,
            },
            add(Register::R2, Register::R2, b'a' as u16 - 10),
            JumpRel {
                cond: None,
                offset_words: 1,
            },
            add(Register::R2, Register::R2, b'0' as u16),
            put_char(Register::R2),
        ]);
    }
    code.push(Ret);
    builder.append_code(&code)
}

/// Routine: the demo's `user` trap handler. Reads the cause and prints the
/// software value as `user trap <decimal> 0x<hex>`, then returns to the
/// trampoline.
pub fn emit_user_trap_handler(
    builder: &mut ImageBuilder,
    print_str: u64,
    print_u64: u64,
    print_hex16: u64,
) -> Result<u64, BuildError> {
    let prefix = builder.append_data(b"user trap ");
    let mid = builder.append_data(b" 0x");
    let base = builder.cursor();
    builder.append_code(&[
        // this routine calls out, so its own return address must survive
        PushSingle {
            size: Size::Word,
            src: Some(Register::Lr),
        },
        // the software value sits above the kind field; r6 survives the
        // print routines' scratch registers
        ReadMachine {
            dst: Register::R6,
            id: MachineReg::Einfo.id(),
        },
        ShrImm {
            size: Size::Word,
            dst: Some(Register::R6),
            lhs: Register::R6,
            amount: 3,
            signed: false,
            set_flags: false,
        },
        ldr_to(base + 12, Register::R0, prefix)?,
        ldi(Register::R1, 10),
        call_to(base + 20, print_str)?,
        Copy {
            size: Size::Word,
            dst: Register::R0,
            src: Register::R6,
        },
        call_to(base + 28, print_u64)?,
        ldr_to(base + 32, Register::R0, mid)?,
        ldi(Register::R1, 3),
        call_to(base + 40, print_str)?,
        Copy {
            size: Size::Word,
            dst: Register::R0,
            src: Register::R6,
        },
        call_to(base + 48, print_hex16)?,
        ldi(Register::R0, b'\n' as u16),
        put_char(Register::R0),
        PopSingle {
            size: Size::Word,
            dst: Some(Register::Lr),
        },
        Ret,
    ])
}

/// Builds the complete demo image: greeting, a software trap handled
/// through the full vector/trampoline path, and a resumption message.
pub fn build_demo_image() -> Result<Vec<u8>, BuildError> {
    let mut builder = ImageBuilder::new();
    builder.alloc_vector_table();
    builder.alloc_context_table();

    let print_str = emit_print_str(&mut builder)?;
    let print_u64 = emit_print_u64(&mut builder)?;
    let print_hex16 = emit_print_hex16(&mut builder)?;
    let handler = emit_user_trap_handler(&mut builder, print_str, print_u64, print_hex16)?;
    let trampoline = append_trampoline(&mut builder, handler)?;
    builder.install_vector(PrivilegeLevel::Pl0, ExceptionKind::User, trampoline)?;

    let greeting = builder.append_data(b"Hello, world!\n");
    let after = builder.append_data(b"After exc\n");

    let main = builder.cursor();
    builder.append_code(&[
        ldr_to(main, Register::R0, greeting)?,
        ldi(Register::R1, 14),
        call_to(main + 8, print_str)?,
        UserTrap {
            value: DEMO_TRAP_VALUE,
        },
        ldr_to(main + 16, Register::R0, after)?,
        ldi(Register::R1, 10),
        call_to(main + 24, print_str)?,
        // a zero link register makes the final ret halt the machine
        ldi(Register::Lr, 0),
        Ret,
    ])?;

    write_boot(
        &mut builder,
        &BootSpec {
            stack_top: STACK_TOP,
            entry: main,
        },
    )?;

    let image = builder.build();
    log::info!("demo image: {} bytes", image.len());
    Ok(image)
}
