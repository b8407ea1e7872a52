//! Core-local interruptor: machine-level software and timer interrupts.

use crate::interrupt::{mip, HartInterrupts};
use crate::system_bus::{Device, MemoryAccessError, SystemBus};
use std::sync::Arc;

const MSIP_ADDR: u64 = 0x0;
const MTIMECMP_ADDR: u64 = 0x4000;
const MTIMECMP_ADDR_HI: u64 = MTIMECMP_ADDR + 4;
const MTIME_ADDR: u64 = 0xBFF8;
const MTIME_ADDR_HI: u64 = MTIME_ADDR + 4;

/// CLINT for a single hart.
///
/// `mtime` advances by the cycle budget granted on every step, so guest time tracks retired
/// instructions rather than wall-clock time.
#[derive(Debug)]
pub struct Clint {
    interrupts: Arc<HartInterrupts>,
    mtime: u64,
    mtimecmp: u64,
    msip: bool,
}

impl Clint {
    pub fn new(interrupts: Arc<HartInterrupts>) -> Self {
        Self {
            interrupts,
            mtime: 0,
            mtimecmp: u64::MAX,
            msip: false,
        }
    }

    pub fn mtime(&self) -> u64 {
        self.mtime
    }

    fn update_lines(&self) {
        match self.mtime >= self.mtimecmp {
            true => self.interrupts.raise(mip::MTIP),
            false => self.interrupts.lower(mip::MTIP),
        }
        match self.msip {
            true => self.interrupts.raise(mip::MSIP),
            false => self.interrupts.lower(mip::MSIP),
        }
    }
}

impl Device for Clint {
    fn size(&self) -> u64 {
        0x10000
    }

    fn load(&mut self, offset: u64, size_log2: u32) -> Result<u64, MemoryAccessError> {
        let value = match offset {
            MSIP_ADDR => self.msip as u64,
            MTIMECMP_ADDR => self.mtimecmp,
            MTIMECMP_ADDR_HI if size_log2 == 2 => self.mtimecmp >> 32,
            MTIME_ADDR => self.mtime,
            MTIME_ADDR_HI if size_log2 == 2 => self.mtime >> 32,
            _ => return Err(MemoryAccessError::OutOfBounds),
        };
        // The registers may be read as their low word too.
        match size_log2 {
            2 => Ok(value & 0xFFFF_FFFF),
            3 => Ok(value),
            _ => Err(MemoryAccessError::UnsupportedSize),
        }
    }

    fn store(&mut self, offset: u64, value: u64, size_log2: u32) -> Result<(), MemoryAccessError> {
        if !matches!(size_log2, 2 | 3) {
            return Err(MemoryAccessError::UnsupportedSize);
        }
        match offset {
            MSIP_ADDR => self.msip = value & 1 != 0,
            MTIMECMP_ADDR if size_log2 == 3 => self.mtimecmp = value,
            MTIMECMP_ADDR => self.mtimecmp = (self.mtimecmp & !0xFFFF_FFFF) | (value & 0xFFFF_FFFF),
            MTIMECMP_ADDR_HI => {
                self.mtimecmp = (self.mtimecmp & 0xFFFF_FFFF) | (value << 32);
            }
            MTIME_ADDR if size_log2 == 3 => self.mtime = value,
            MTIME_ADDR => self.mtime = (self.mtime & !0xFFFF_FFFF) | (value & 0xFFFF_FFFF),
            MTIME_ADDR_HI => self.mtime = (self.mtime & 0xFFFF_FFFF) | (value << 32),
            _ => return Err(MemoryAccessError::OutOfBounds),
        }
        self.update_lines();
        Ok(())
    }

    fn needs_step(&self) -> bool {
        true
    }

    fn step(&mut self, _bus: &mut SystemBus, cycles: u64) {
        self.mtime = self.mtime.wrapping_add(cycles);
        self.update_lines();
    }

    fn reset(&mut self) {
        self.mtime = 0;
        self.mtimecmp = u64::MAX;
        self.msip = false;
        self.update_lines();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_interrupt() {
        let interrupts = HartInterrupts::new();
        let mut clint = Clint::new(Arc::clone(&interrupts));
        let mut bus = SystemBus::new();
        clint.store(MTIMECMP_ADDR, 100, 3).unwrap();
        clint.step(&mut bus, 99);
        assert_eq!(0, interrupts.pending() & mip::MTIP);
        clint.step(&mut bus, 1);
        assert_ne!(0, interrupts.pending() & mip::MTIP);
        // Pushing mtimecmp into the future clears the line.
        clint.store(MTIMECMP_ADDR, 200, 3).unwrap();
        assert_eq!(0, interrupts.pending() & mip::MTIP);
    }

    #[test]
    fn test_software_interrupt() {
        let interrupts = HartInterrupts::new();
        let mut clint = Clint::new(Arc::clone(&interrupts));
        clint.store(MSIP_ADDR, 1, 2).unwrap();
        assert_ne!(0, interrupts.pending() & mip::MSIP);
        assert_eq!(1, clint.load(MSIP_ADDR, 2).unwrap());
        clint.store(MSIP_ADDR, 0, 2).unwrap();
        assert_eq!(0, interrupts.pending() & mip::MSIP);
    }
}
