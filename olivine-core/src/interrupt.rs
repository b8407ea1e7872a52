//! Cross-thread interrupt signalling towards the hart.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Bit positions of the standard interrupts in the `mip`/`mie` registers.
pub mod mip {
    /// Supervisor software interrupt pending.
    pub const SSIP: u64 = 1 << 1;
    /// Machine software interrupt pending.
    pub const MSIP: u64 = 1 << 3;
    /// Supervisor timer interrupt pending.
    pub const STIP: u64 = 1 << 5;
    /// Machine timer interrupt pending.
    pub const MTIP: u64 = 1 << 7;
    /// Supervisor external interrupt pending.
    pub const SEIP: u64 = 1 << 9;
    /// Machine external interrupt pending.
    pub const MEIP: u64 = 1 << 11;

    /// All interrupts that may be delegated to S-mode.
    pub const SUPERVISOR: u64 = SSIP | STIP | SEIP;
    /// All implemented interrupt bits.
    pub const ALL: u64 = SSIP | MSIP | STIP | MTIP | SEIP | MEIP;
}

/// The interrupt-pending state of a hart, shared between the emulator thread and any thread that
/// raises interrupts (timer devices, interrupt controllers, host I/O threads).
///
/// `mip` is updated with atomic fetch-or / fetch-and-not so that concurrent raise/lower sequences
/// never lose bits. Raising also clears the hart's waiting-for-interrupt flag; a spurious wake-up
/// from this is benign, since the hart re-checks pending bits on its next step.
#[derive(Debug, Default)]
pub struct HartInterrupts {
    mip: AtomicU64,
    waiting_for_interrupt: AtomicBool,
}

impl HartInterrupts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Set the interrupt-pending bits in `mask`, waking the hart if it is waiting.
    pub fn raise(&self, mask: u64) {
        self.mip.fetch_or(mask & mip::ALL, Ordering::SeqCst);
        self.waiting_for_interrupt.store(false, Ordering::SeqCst);
    }

    /// Clear the interrupt-pending bits in `mask`.
    pub fn lower(&self, mask: u64) {
        self.mip.fetch_and(!mask, Ordering::SeqCst);
    }

    /// Read the current `mip` value.
    pub fn pending(&self) -> u64 {
        self.mip.load(Ordering::SeqCst)
    }

    /// Replace the bits selected by `mask` with those of `value`. Used by CSR writes to `mip`.
    pub fn write_masked(&self, value: u64, mask: u64) {
        let mask = mask & mip::ALL;
        self.mip.fetch_and(!mask | value, Ordering::SeqCst);
        self.mip.fetch_or(value & mask, Ordering::SeqCst);
    }

    pub(crate) fn set_waiting_for_interrupt(&self, value: bool) {
        self.waiting_for_interrupt.store(value, Ordering::SeqCst);
    }

    pub(crate) fn waiting_for_interrupt(&self) -> bool {
        self.waiting_for_interrupt.load(Ordering::SeqCst)
    }
}

/// A single interrupt line towards a hart, bound to a fixed set of `mip` bits.
///
/// Devices hold one of these instead of a reference to the CPU, which keeps the device arena free
/// of ownership cycles.
#[derive(Debug, Clone)]
pub struct IrqLine {
    interrupts: Arc<HartInterrupts>,
    mask: u64,
}

impl IrqLine {
    pub fn new(interrupts: Arc<HartInterrupts>, mask: u64) -> Self {
        Self { interrupts, mask }
    }

    pub fn raise(&self) {
        self.interrupts.raise(self.mask);
    }

    pub fn lower(&self) {
        self.interrupts.lower(self.mask);
    }

    pub fn set(&self, raised: bool) {
        match raised {
            true => self.raise(),
            false => self.lower(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_lower() {
        let interrupts = HartInterrupts::new();
        interrupts.raise(mip::MTIP | mip::SSIP);
        assert_eq!(mip::MTIP | mip::SSIP, interrupts.pending());
        interrupts.lower(mip::MTIP);
        assert_eq!(mip::SSIP, interrupts.pending());
        // Bits outside the implemented set are ignored.
        interrupts.raise(1 << 0);
        assert_eq!(mip::SSIP, interrupts.pending());
    }

    #[test]
    fn test_raise_wakes_hart() {
        let interrupts = HartInterrupts::new();
        interrupts.set_waiting_for_interrupt(true);
        interrupts.raise(mip::MEIP);
        assert!(!interrupts.waiting_for_interrupt());
    }

    #[test]
    fn test_write_masked() {
        let interrupts = HartInterrupts::new();
        interrupts.raise(mip::MTIP | mip::SSIP);
        interrupts.write_masked(mip::STIP, mip::STIP | mip::SSIP);
        assert_eq!(mip::MTIP | mip::STIP, interrupts.pending());
    }

    #[test]
    fn test_concurrent_raises_are_not_lost() {
        let interrupts = HartInterrupts::new();
        let threads: Vec<_> = [mip::MTIP, mip::MSIP, mip::SEIP]
            .into_iter()
            .map(|bit| {
                let interrupts = std::sync::Arc::clone(&interrupts);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        interrupts.raise(bit);
                        interrupts.lower(bit);
                        interrupts.raise(bit);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        // Each thread's final operation was a raise of its own bit.
        assert_eq!(mip::MTIP | mip::MSIP | mip::SEIP, interrupts.pending());
    }
}
