//! Read-only memory holding firmware images.

use crate::system_bus::{Device, MemoryAccessError};

/// A read-only byte-addressable device.
///
/// Writes are ignored, matching flash that has not been put into programming mode.
#[derive(Debug)]
pub struct Rom {
    data: Vec<u8>,
}

impl Rom {
    /// Create a ROM of `size` bytes holding a copy of `image`, zero-padded.
    ///
    /// Returns `None` if `image` does not fit.
    pub fn new(size: usize, image: &[u8]) -> Option<Self> {
        if size == 0 || image.len() > size {
            return None;
        }
        let mut data = vec![0; size];
        data[..image.len()].copy_from_slice(image);
        Some(Self { data })
    }
}

impl Device for Rom {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn load(&mut self, offset: u64, size_log2: u32) -> Result<u64, MemoryAccessError> {
        let size = 1usize << size_log2;
        let start = usize::try_from(offset).map_err(|_| MemoryAccessError::OutOfBounds)?;
        if start + size > self.data.len() {
            return Err(MemoryAccessError::OutOfBounds);
        }
        let mut buf = [0u8; 8];
        buf[..size].copy_from_slice(&self.data[start..start + size]);
        Ok(u64::from_le_bytes(buf))
    }

    fn store(&mut self, _offset: u64, _value: u64, _size_log2: u32) -> Result<(), MemoryAccessError> {
        // Writes to ROM are silently ignored.
        Ok(())
    }
}
