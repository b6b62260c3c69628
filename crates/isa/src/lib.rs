//! Architecture definitions for the VM: register and flag layouts, the
//! exception-info codec, the exception table shapes and the instruction
//! set with its encoder/decoder.
//!
//! Everything in this crate is pure data and pure functions. The machine
//! model (`vm`) and the image builder (`traps`) both depend on it, which is
//! what keeps the two sides of the trap contract in agreement: the encoder
//! used to patch a vector slot is the same code the decoder tests against.

/// Address of the first instruction executed after reset. Boot images must
/// place their entry code here; everything below is reserved.
pub const RESET_VECTOR: u64 = 0x400;

pub mod registers;
pub use registers::{Condition, Flags, MachineReg, PrivilegeLevel, Register, Size};

pub mod einfo;
pub use einfo::ExceptionKind;

pub mod tables;
pub use tables::{ContextEntry, ContextFlags, ContextTable, VectorTable};

pub mod instruction;
pub use instruction::Instruction;

pub mod encode;
pub use encode::{encode, encode_branch_link, EncodeError};

pub mod decode;
pub use decode::decode;
