//! Platform-level interrupt controller

use crate::interrupt::IrqLine;
use crate::system_bus::{Device, MemoryAccessError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Number of interrupt sources, including the reserved source 0 ("no interrupt").
pub const SOURCE_COUNT: usize = 32;

const PRIORITY_BASE_ADDR: u64 = 0x0;
const PRIORITY_LAST_ADDR: u64 = PRIORITY_BASE_ADDR + 4 * (SOURCE_COUNT as u64 - 1);

const PENDING_ADDR: u64 = 0x1000;

const ENABLES_BASE_ADDR: u64 = 0x2000;
/// Stride between the enable words of consecutive contexts.
const ENABLES_STRIDE: u64 = 0x80;

const CONTEXT_BASE_ADDR: u64 = 0x20_0000;
/// Stride between the threshold/claim register pairs of consecutive contexts.
const CONTEXT_STRIDE: u64 = 0x1000;

const ENABLES_BASE_ADDR_CTX1: u64 = ENABLES_BASE_ADDR + ENABLES_STRIDE;
const CONTEXT_BASE_ADDR_CTX1: u64 = CONTEXT_BASE_ADDR + CONTEXT_STRIDE;
const CLAIM_ADDR_CTX0: u64 = CONTEXT_BASE_ADDR + 4;
const CLAIM_ADDR_CTX1: u64 = CONTEXT_BASE_ADDR_CTX1 + 4;

/// Context 0 targets the hart's M-mode external interrupt, context 1 its S-mode one.
const CONTEXT_COUNT: usize = 2;

/// Handle through which devices raise their interrupt source.
///
/// The pending word is shared atomically so that device models running on other threads (e.g. a
/// host I/O pump feeding the UART) can raise sources directly.
#[derive(Debug, Clone)]
pub struct PlicSource {
    pending: Arc<AtomicU32>,
    index: u8,
}

impl PlicSource {
    pub fn raise(&self) {
        self.pending.fetch_or(1 << self.index, Ordering::SeqCst);
    }

    pub fn lower(&self) {
        self.pending.fetch_and(!(1 << self.index), Ordering::SeqCst);
    }

    pub fn set(&self, raised: bool) {
        match raised {
            true => self.raise(),
            false => self.lower(),
        }
    }
}

/// Platform-level interrupt controller routing device interrupts to the hart's M- and S-mode
/// external interrupt lines.
#[derive(Debug)]
pub struct Plic {
    priorities: [u32; SOURCE_COUNT],
    pending: Arc<AtomicU32>,
    /// Sources currently claimed and not yet completed; these are masked from dispatch.
    claimed: u32,
    enabled: [u32; CONTEXT_COUNT],
    threshold: [u32; CONTEXT_COUNT],
    lines: [IrqLine; CONTEXT_COUNT],
}

impl Plic {
    /// Create a new PLIC in reset state.
    ///
    /// `m_external` and `s_external` are the hart's MEIP and SEIP lines.
    pub fn new(m_external: IrqLine, s_external: IrqLine) -> Self {
        Self {
            priorities: [0; SOURCE_COUNT],
            pending: Arc::new(AtomicU32::new(0)),
            claimed: 0,
            enabled: [0; CONTEXT_COUNT],
            threshold: [0; CONTEXT_COUNT],
            lines: [m_external, s_external],
        }
    }

    /// Returns the raise/lower handle for interrupt source `index`.
    ///
    /// Source 0 is reserved by the PLIC specification and cannot be used.
    pub fn source(&self, index: u8) -> Option<PlicSource> {
        (1..SOURCE_COUNT as u8).contains(&index).then(|| PlicSource {
            pending: Arc::clone(&self.pending),
            index,
        })
    }

    /// Returns the highest-priority pending source for `context`, or 0 if none qualifies.
    fn best_pending(&self, context: usize) -> u32 {
        let dispatchable = self.pending.load(Ordering::SeqCst) & !self.claimed;
        let mut best = 0;
        let mut best_priority = self.threshold[context];
        for index in 1..SOURCE_COUNT {
            let bit = 1u32 << index;
            if dispatchable & self.enabled[context] & bit != 0
                && self.priorities[index] > best_priority
            {
                best = index as u32;
                best_priority = self.priorities[index];
            }
        }
        best
    }

    fn update_lines(&self) {
        for context in 0..CONTEXT_COUNT {
            self.lines[context].set(self.best_pending(context) != 0);
        }
    }
}

impl Device for Plic {
    fn size(&self) -> u64 {
        0x400_0000
    }

    fn load(&mut self, offset: u64, size_log2: u32) -> Result<u64, MemoryAccessError> {
        if size_log2 != 2 {
            return Err(MemoryAccessError::UnsupportedSize);
        }
        let value = match offset {
            PRIORITY_BASE_ADDR..=PRIORITY_LAST_ADDR => {
                self.priorities[(offset / 4) as usize]
            }
            PENDING_ADDR => self.pending.load(Ordering::SeqCst),
            ENABLES_BASE_ADDR | ENABLES_BASE_ADDR_CTX1 => {
                let context = ((offset - ENABLES_BASE_ADDR) / ENABLES_STRIDE) as usize;
                self.enabled[context]
            }
            CONTEXT_BASE_ADDR | CONTEXT_BASE_ADDR_CTX1 => {
                let context = ((offset - CONTEXT_BASE_ADDR) / CONTEXT_STRIDE) as usize;
                self.threshold[context]
            }
            CLAIM_ADDR_CTX0 | CLAIM_ADDR_CTX1 => {
                let context = ((offset - 4 - CONTEXT_BASE_ADDR) / CONTEXT_STRIDE) as usize;
                let index = self.best_pending(context);
                if index != 0 {
                    // Claiming clears pending and masks the source until completion.
                    self.pending.fetch_and(!(1 << index), Ordering::SeqCst);
                    self.claimed |= 1 << index;
                    self.update_lines();
                }
                index
            }
            _ => 0,
        };
        Ok(value as u64)
    }

    fn store(&mut self, offset: u64, value: u64, size_log2: u32) -> Result<(), MemoryAccessError> {
        if size_log2 != 2 {
            return Err(MemoryAccessError::UnsupportedSize);
        }
        let value = value as u32;
        match offset {
            PRIORITY_BASE_ADDR..=PRIORITY_LAST_ADDR => {
                let index = (offset / 4) as usize;
                if index != 0 {
                    self.priorities[index] = value.min(7);
                }
            }
            ENABLES_BASE_ADDR | ENABLES_BASE_ADDR_CTX1 => {
                let context = ((offset - ENABLES_BASE_ADDR) / ENABLES_STRIDE) as usize;
                // Source 0 can never be enabled.
                self.enabled[context] = value & !1;
            }
            CONTEXT_BASE_ADDR | CONTEXT_BASE_ADDR_CTX1 => {
                let context = ((offset - CONTEXT_BASE_ADDR) / CONTEXT_STRIDE) as usize;
                self.threshold[context] = value.min(7);
            }
            CLAIM_ADDR_CTX0 | CLAIM_ADDR_CTX1 => {
                if (1..SOURCE_COUNT as u32).contains(&value) {
                    self.claimed &= !(1 << value);
                }
            }
            _ => {}
        }
        self.update_lines();
        Ok(())
    }

    fn needs_step(&self) -> bool {
        true
    }

    fn step(&mut self, _bus: &mut crate::system_bus::SystemBus, _cycles: u64) {
        // Pending bits may have been raised from other threads since the last access.
        self.update_lines();
    }

    fn reset(&mut self) {
        self.priorities = [0; SOURCE_COUNT];
        self.pending.store(0, Ordering::SeqCst);
        self.claimed = 0;
        self.enabled = [0; CONTEXT_COUNT];
        self.threshold = [0; CONTEXT_COUNT];
        self.update_lines();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::{mip, HartInterrupts};

    fn plic_with_lines() -> (Plic, Arc<HartInterrupts>) {
        let interrupts = HartInterrupts::new();
        let plic = Plic::new(
            IrqLine::new(Arc::clone(&interrupts), mip::MEIP),
            IrqLine::new(Arc::clone(&interrupts), mip::SEIP),
        );
        (plic, interrupts)
    }

    #[test]
    fn test_claim_complete_cycle() {
        let (mut plic, interrupts) = plic_with_lines();
        // Priority 3 for source 5, enabled for context 0 (M-mode).
        plic.store(5 * 4, 3, 2).unwrap();
        plic.store(ENABLES_BASE_ADDR, 1 << 5, 2).unwrap();
        plic.source(5).unwrap().raise();
        plic.step(&mut crate::system_bus::SystemBus::new(), 0);
        assert_ne!(0, interrupts.pending() & mip::MEIP);
        // Claim returns the source and lowers the line.
        assert_eq!(5, plic.load(CLAIM_ADDR_CTX0, 2).unwrap());
        assert_eq!(0, interrupts.pending() & mip::MEIP);
        // A second claim finds nothing.
        assert_eq!(0, plic.load(CLAIM_ADDR_CTX0, 2).unwrap());
        plic.store(CLAIM_ADDR_CTX0, 5, 2).unwrap();
        assert_eq!(0, interrupts.pending() & mip::MEIP);
    }

    #[test]
    fn test_threshold_masks_low_priority() {
        let (mut plic, interrupts) = plic_with_lines();
        plic.store(7 * 4, 2, 2).unwrap();
        plic.store(ENABLES_BASE_ADDR, 1 << 7, 2).unwrap();
        plic.store(CONTEXT_BASE_ADDR, 2, 2).unwrap();
        plic.source(7).unwrap().raise();
        plic.step(&mut crate::system_bus::SystemBus::new(), 0);
        // Priority must exceed the threshold to dispatch.
        assert_eq!(0, interrupts.pending() & mip::MEIP);
        plic.store(CONTEXT_BASE_ADDR, 1, 2).unwrap();
        assert_ne!(0, interrupts.pending() & mip::MEIP);
    }

    #[test]
    fn test_supervisor_context() {
        let (mut plic, interrupts) = plic_with_lines();
        plic.store(3 * 4, 1, 2).unwrap();
        plic.store(ENABLES_BASE_ADDR_CTX1, 1 << 3, 2).unwrap();
        plic.source(3).unwrap().raise();
        plic.step(&mut crate::system_bus::SystemBus::new(), 0);
        assert_eq!(0, interrupts.pending() & mip::MEIP);
        assert_ne!(0, interrupts.pending() & mip::SEIP);
        assert_eq!(3, plic.load(CLAIM_ADDR_CTX1, 2).unwrap());
    }
}
