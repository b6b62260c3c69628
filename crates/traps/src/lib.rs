//! Trap-dispatch framework: builds boot images whose exception plumbing
//! is wired before the application runs.
//!
//! The pieces compose in one direction. [`image::ImageBuilder`] lays out
//! the flat image and owns the two exception tables;
//! [`trampoline::append_trampoline`] wraps a handler routine in
//! save/call/restore/`eret`; [`boot::write_boot`] patches the reset-vector
//! words that install the tables and branch to the entry point. A typical
//! image is built as: allocate tables, append handlers and their
//! trampolines, install vectors, write boot.

pub mod boot;
pub mod image;
pub mod trampoline;

pub use boot::{write_boot, BootSpec, BOOT_WORDS};
pub use image::{BuildError, ImageBuilder};
pub use trampoline::{append_trampoline, TRAMPOLINE_WORDS};
