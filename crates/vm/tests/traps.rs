//! Trap dispatch tests: exception tables installed by guest code, hand
//! assembled at fixed addresses.

use isa::encode::{encode_all, encode_branch_link};
use isa::instruction::ClearMode;
use isa::tables::{self, ContextEntry, ContextFlags, ContextTable};
use isa::{
    einfo, ExceptionKind, Flags, Instruction, MachineReg, PrivilegeLevel, Register, Size,
    RESET_VECTOR,
};
use vm::{BufferConsole, Vm};

use Instruction::*;

const EVT: u64 = 0x800;
const ECT: u64 = 0xa00;
const HANDLER: u64 = 0x500;
const STACK_TOP: u64 = 0x0010_0000;

/// Entry code at the reset vector: stack, both tables, then the body.
fn setup_code() -> Vec<Instruction> {
    vec![
        LoadImm {
            dst: Register::Sp,
            value: (STACK_TOP >> 16) as u16,
            shift: 16,
            clear: ClearMode::All,
        },
        LoadRel {
            dst: Register::R0,
            offset: (EVT - (RESET_VECTOR + 4 + 4)) as i32,
        },
        WriteMachine {
            id: MachineReg::Evtable.id(),
            src: Register::R0,
        },
        LoadRel {
            dst: Register::R0,
            offset: (ECT - (RESET_VECTOR + 12 + 4)) as i32,
        },
        WriteMachine {
            id: MachineReg::Ectable.id(),
            src: Register::R0,
        },
    ]
}

/// Image with setup + body at the reset vector, a handler at [`HANDLER`],
/// and the tables behind them. The `(pl0, user)` and `(pl1, user)` vector
/// slots both branch to the handler.
fn build_image(body: &[Instruction], handler: &[Instruction], ect: &ContextTable) -> Vec<u8> {
    let mut image = vec![0u8; (ECT + tables::CONTEXT_TABLE_SIZE) as usize];

    let mut code = setup_code();
    code.extend_from_slice(body);
    let code = encode_all(&code).unwrap();
    image[RESET_VECTOR as usize..RESET_VECTOR as usize + code.len()].copy_from_slice(&code);

    let handler = encode_all(handler).unwrap();
    image[HANDLER as usize..HANDLER as usize + handler.len()].copy_from_slice(&handler);

    for level in [PrivilegeLevel::Pl0, PrivilegeLevel::Pl1] {
        let slot = EVT + tables::vector_offset(level, ExceptionKind::User);
        let word = encode_branch_link(slot, HANDLER).unwrap();
        image[slot as usize..slot as usize + 4].copy_from_slice(&word.to_le_bytes());
    }

    image[ECT as usize..].copy_from_slice(&ect.to_bytes());
    image
}

fn run_image(image: Vec<u8>) -> Vm<BufferConsole> {
    let mut vm = Vm::new(1 << 20, BufferConsole::new());
    vm.load_image(&image).unwrap();
    assert!(vm.run(10_000), "program did not halt");
    vm
}

#[test]
fn user_trap_dispatches_and_resumes() {
    let body = [
        UserTrap { value: 0x42 },
        LoadImm {
            dst: Register::R5,
            value: 0x77,
            shift: 0,
            clear: ClearMode::All,
        },
        Ret,
    ];
    // No restore sequence here: r6 carries the cause out of the handler.
    let handler = [
        ReadMachine {
            dst: Register::R6,
            id: MachineReg::Einfo.id(),
        },
        Eret,
    ];
    let vm = run_image(build_image(&body, &handler, &ContextTable::default()));

    assert_eq!(einfo::kind(vm.cpu.regs[6]), ExceptionKind::User);
    assert_eq!(einfo::user_value(vm.cpu.regs[6]), 0x42);
    assert_eq!(vm.cpu.regs[5], 0x77, "execution did not resume after the trap");
}

#[test]
fn dispatch_switches_to_the_trap_stack() {
    let mut ect = ContextTable::default();
    *ect.entry_mut(PrivilegeLevel::Pl0, ExceptionKind::User) = ContextEntry {
        flags: ContextFlags::USE_STACK,
        stack_pointer: 0x8000,
        stack_size: 0x1000,
    };
    let body = [UserTrap { value: 1 }, Ret];
    let handler = [
        Copy {
            size: Size::Word,
            dst: Register::R7,
            src: Register::Sp,
        },
        Eret,
    ];
    let vm = run_image(build_image(&body, &handler, &ect));

    // handler ran on the trap stack's top, the interrupted sp came back
    assert_eq!(vm.cpu.regs[7], 0x9000);
    assert_eq!(vm.cpu.sp(), STACK_TOP);
}

#[test]
fn trap_stack_is_not_reentered() {
    // sp already inside the trap stack region: the hardware leaves it alone
    let mut ect = ContextTable::default();
    *ect.entry_mut(PrivilegeLevel::Pl0, ExceptionKind::User) = ContextEntry {
        flags: ContextFlags::USE_STACK,
        stack_pointer: 0x8000,
        stack_size: 0x1000,
    };
    let body = [
        LoadImm {
            dst: Register::Sp,
            value: 0x8800,
            shift: 0,
            clear: ClearMode::All,
        },
        UserTrap { value: 1 },
        Ret,
    ];
    let handler = [
        Copy {
            size: Size::Word,
            dst: Register::R7,
            src: Register::Sp,
        },
        Eret,
    ];
    let vm = run_image(build_image(&body, &handler, &ect));
    assert_eq!(vm.cpu.regs[7], 0x8800);
}

#[test]
fn traps_from_pl1_use_the_pl1_section_and_eret_returns_there() {
    let body = [
        // drop to pl1, then trap from there
        LoadImm {
            dst: Register::R2,
            value: Flags::PL1.bits() as u16,
            shift: 0,
            clear: ClearMode::All,
        },
        WriteMachine {
            id: MachineReg::Flags.id(),
            src: Register::R2,
        },
        UserTrap { value: 9 },
        Ret,
    ];
    let handler = [
        ReadMachine {
            dst: Register::R6,
            id: MachineReg::Einfo.id(),
        },
        ReadMachine {
            dst: Register::R8,
            id: MachineReg::Flags.id(),
        },
        Eret,
    ];
    let vm = run_image(build_image(&body, &handler, &ContextTable::default()));

    assert_eq!(einfo::user_value(vm.cpu.regs[6]), 9);
    // the handler itself ran at pl0
    assert_eq!(
        Flags::from_bits(vm.cpu.regs[8]).unwrap().privilege_level(),
        PrivilegeLevel::Pl0
    );
    // eret put the machine back at pl1
    assert_eq!(vm.cpu.flags.privilege_level(), PrivilegeLevel::Pl1);
}

#[test]
fn eret_outside_pl0_is_an_invalid_operation() {
    let mut vm = Vm::new(1 << 20, BufferConsole::new());
    let mut image = vec![0u8; RESET_VECTOR as usize];
    image.extend_from_slice(
        &encode_all(&[
            LoadImm {
                dst: Register::R2,
                value: Flags::PL1.bits() as u16,
                shift: 0,
                clear: ClearMode::All,
            },
            WriteMachine {
                id: MachineReg::Flags.id(),
                src: Register::R2,
            },
            Eret,
        ])
        .unwrap(),
    );
    vm.load_image(&image).unwrap();
    vm.step();
    vm.step();
    vm.step();
    assert_eq!(
        einfo::kind(vm.cpu.einfo()),
        ExceptionKind::InvalidOperation
    );
}

#[test]
fn installing_a_context_table_with_undefined_flags_faults() {
    let mut bytes = ContextTable::default().to_bytes();
    bytes[0] = 0x04; // undefined flag bit
    let mut image = vec![0u8; RESET_VECTOR as usize];
    image.extend_from_slice(
        &encode_all(&[
            LoadRel {
                dst: Register::R0,
                offset: (ECT - (RESET_VECTOR + 4)) as i32,
            },
            WriteMachine {
                id: MachineReg::Ectable.id(),
                src: Register::R0,
            },
        ])
        .unwrap(),
    );
    image.resize(ECT as usize, 0);
    image.extend_from_slice(&bytes);

    let mut vm = Vm::new(1 << 20, BufferConsole::new());
    vm.load_image(&image).unwrap();
    vm.step();
    vm.step();
    assert_eq!(
        einfo::kind(vm.cpu.einfo()),
        ExceptionKind::InvalidOperation
    );
    // the register was left untouched
    assert_eq!(vm.cpu.ectable(), 0);
}
