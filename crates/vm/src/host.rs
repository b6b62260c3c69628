use std::fmt::Debug;
use std::io::Write;

/// Host side of the memory-mapped console.
///
/// The machine forwards every byte written to the console machine register
/// here. Writes are fire-and-forget: no acknowledgment, no error path back
/// into the guest.
pub trait HostInterface: Debug {
    fn put_char(&mut self, byte: u8);
}

/// Console that writes straight to the host's stdout.
#[derive(Debug, Default)]
pub struct StdoutConsole;

impl HostInterface for StdoutConsole {
    fn put_char(&mut self, byte: u8) {
        print!("{}", byte as char);
        // A trap handler may emit a partial line before the guest idles.
        let _ = std::io::stdout().flush();
    }
}

/// Console that records output for inspection. Used by tests and anywhere
/// the guest's output needs to be asserted on.
#[derive(Debug, Default)]
pub struct BufferConsole {
    bytes: Vec<u8>,
}

impl BufferConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

impl HostInterface for BufferConsole {
    fn put_char(&mut self, byte: u8) {
        self.bytes.push(byte);
    }
}
