//! The machine model: a flat-memory interpretive core for the trap
//! architecture defined in `isa`.
//!
//! The crate is split the obvious way. [`cpu`] owns the register file, the
//! machine control registers and the trap-entry sequence; [`memory`] is a
//! bounds-checked flat byte array; [`host`] is the seam the console escapes
//! through, so tests can capture output instead of printing it.

pub mod cpu;
pub mod host;
pub mod memory;

pub use cpu::{Cpu, Exception};
pub use isa::RESET_VECTOR;
pub use host::{BufferConsole, HostInterface, StdoutConsole};
pub use memory::Memory;

/// Default memory size: 32 MiB, plenty for the tables, the handlers and a
/// demo program.
pub const DEFAULT_MEMORY_SIZE: usize = 32 * 1024 * 1024;

/// A complete machine: one CPU, one flat memory, one host.
#[derive(Debug)]
pub struct Vm<H: HostInterface> {
    pub cpu: Cpu,
    pub memory: Memory,
    pub host: H,
}

impl<H: HostInterface> Vm<H> {
    pub fn new(memory_size: usize, host: H) -> Self {
        Self {
            cpu: Cpu::new(),
            memory: Memory::new(memory_size),
            host,
        }
    }

    /// Loads a boot image at address zero. Execution will begin at the
    /// reset vector, so the image must place its entry code there.
    pub fn load_image(&mut self, image: &[u8]) -> Result<(), memory::ImageTooLarge> {
        self.memory.load_image(0, image)
    }

    /// Runs one instruction. Returns `false` once the machine has halted.
    pub fn step(&mut self) -> bool {
        self.cpu.step(&mut self.memory, &mut self.host)
    }

    /// Runs until the machine halts, up to `max_steps` instructions.
    /// Returns `true` if the machine halted on its own.
    pub fn run(&mut self, max_steps: u64) -> bool {
        for _ in 0..max_steps {
            if !self.step() {
                return true;
            }
        }
        false
    }

    /// Delivers a synthetic exception, as if the hardware raised it at the
    /// current instruction pointer.
    pub fn inject(&mut self, exception: Exception) {
        self.cpu.inject(exception);
    }
}
