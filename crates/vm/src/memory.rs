//! Flat, byte-addressed machine memory.
//!
//! Accessors are checked and return `Option`: the CPU turns a miss into an
//! architectural data-load or instruction-load exception instead of
//! panicking, because a bad guest address is guest misbehavior, not a bug
//! in the machine model.

use isa::Size;

pub struct Memory {
    mem: Vec<u8>,
}

impl core::fmt::Debug for Memory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Memory").field("size", &self.mem.len()).finish()
    }
}

impl Memory {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0u8; size],
        }
    }

    pub fn size(&self) -> usize {
        self.mem.len()
    }

    /// Copies an image into memory at `addr`. Host-side loader interface;
    /// an image that does not fit is a configuration error.
    pub fn load_image(&mut self, addr: u64, image: &[u8]) -> Result<(), ImageTooLarge> {
        let start = addr as usize;
        let end = start.checked_add(image.len()).ok_or(ImageTooLarge)?;
        let dest = self.mem.get_mut(start..end).ok_or(ImageTooLarge)?;
        dest.copy_from_slice(image);
        Ok(())
    }

    pub fn slice(&self, addr: u64, len: u64) -> Option<&[u8]> {
        let start = usize::try_from(addr).ok()?;
        let end = start.checked_add(usize::try_from(len).ok()?)?;
        self.mem.get(start..end)
    }

    pub fn slice_mut(&mut self, addr: u64, len: u64) -> Option<&mut [u8]> {
        let start = usize::try_from(addr).ok()?;
        let end = start.checked_add(usize::try_from(len).ok()?)?;
        self.mem.get_mut(start..end)
    }

    /// Fetches one instruction word.
    pub fn load_word(&self, addr: u64) -> Option<u32> {
        let bytes = self.slice(addr, 4)?;
        Some(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Sized little-endian load, zero-extended to 64 bits.
    pub fn load_sized(&self, addr: u64, size: Size) -> Option<u64> {
        let bytes = self.slice(addr, size.byte_size())?;
        let mut value = [0u8; 8];
        value[..bytes.len()].copy_from_slice(bytes);
        Some(u64::from_le_bytes(value))
    }

    /// Sized little-endian store of the low bytes of `value`.
    pub fn store_sized(&mut self, addr: u64, size: Size, value: u64) -> Option<()> {
        let len = size.byte_size() as usize;
        let bytes = self.slice_mut(addr, size.byte_size())?;
        bytes.copy_from_slice(&value.to_le_bytes()[..len]);
        Some(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ImageTooLarge;

impl core::fmt::Display for ImageTooLarge {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "image does not fit in machine memory")
    }
}

impl std::error::Error for ImageTooLarge {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sized_round_trip() {
        let mut memory = Memory::new(64);
        memory.store_sized(8, Size::Word, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(memory.load_sized(8, Size::Word), Some(0x1122_3344_5566_7788));
        assert_eq!(memory.load_sized(8, Size::DoubleByte), Some(0x7788));
    }

    #[test]
    fn out_of_range_access_is_none() {
        let mut memory = Memory::new(16);
        assert_eq!(memory.load_sized(13, Size::QuadByte), None);
        assert_eq!(memory.store_sized(u64::MAX - 2, Size::Word, 0), None);
    }
}
