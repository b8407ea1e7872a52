//! System controller: the guest's handle for requesting reset and poweroff.

use crate::system_bus::{Device, MemoryAccessError};
use log::info;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const POWEROFF_MAGIC: u64 = 0x5555;
const REBOOT_MAGIC: u64 = 0x7777;

/// Out-of-band signal raised by the SYSCON device towards the board.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PowerEvent {
    Reset,
    Poweroff,
}

/// Latch for the most recent [`PowerEvent`], shared between the SYSCON device and the board.
#[derive(Debug, Default)]
pub struct PowerSignal(AtomicU8);

impl PowerSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn signal(&self, event: PowerEvent) {
        self.0.store(
            match event {
                PowerEvent::Reset => 1,
                PowerEvent::Poweroff => 2,
            },
            Ordering::SeqCst,
        );
    }

    /// Consume the pending event, if any.
    pub fn take(&self) -> Option<PowerEvent> {
        match self.0.swap(0, Ordering::SeqCst) {
            1 => Some(PowerEvent::Reset),
            2 => Some(PowerEvent::Poweroff),
            _ => None,
        }
    }
}

/// Memory-mapped system controller accepting the conventional poweroff/reboot magic values.
#[derive(Debug)]
pub struct Syscon {
    signal: Arc<PowerSignal>,
}

impl Syscon {
    pub fn new(signal: Arc<PowerSignal>) -> Self {
        Self { signal }
    }
}

impl Device for Syscon {
    fn size(&self) -> u64 {
        0x1000
    }

    fn load(&mut self, _offset: u64, _size_log2: u32) -> Result<u64, MemoryAccessError> {
        Ok(0)
    }

    fn store(&mut self, offset: u64, value: u64, _size_log2: u32) -> Result<(), MemoryAccessError> {
        if offset == 0 {
            match value {
                POWEROFF_MAGIC => {
                    info!("Guest requested poweroff");
                    self.signal.signal(PowerEvent::Poweroff);
                }
                REBOOT_MAGIC => {
                    info!("Guest requested reset");
                    self.signal.signal(PowerEvent::Reset);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_values() {
        let signal = PowerSignal::new();
        let mut syscon = Syscon::new(Arc::clone(&signal));
        assert_eq!(None, signal.take());
        syscon.store(0, POWEROFF_MAGIC, 2).unwrap();
        assert_eq!(Some(PowerEvent::Poweroff), signal.take());
        // The latch is cleared by take.
        assert_eq!(None, signal.take());
        syscon.store(0, REBOOT_MAGIC, 2).unwrap();
        assert_eq!(Some(PowerEvent::Reset), signal.take());
        syscon.store(0, 0x1234, 2).unwrap();
        assert_eq!(None, signal.take());
    }
}
