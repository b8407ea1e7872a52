//! The software MMU: virtual-to-physical translation with page-table walking and a three-way
//! translation cache.

use super::Core;
use crate::system_bus::{Device, DeviceHandle, SystemBus};
use crate::{PrivilegeLevel, Xlen};
use log::{debug, trace};
use thiserror::Error;

pub(super) const PAGE_SHIFT: u32 = 12;
pub(super) const PAGE_MASK: u64 = (1 << PAGE_SHIFT) - 1;

const TLB_ENTRIES: usize = 256;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessType {
    /// Regular reads.
    Read,
    /// Regular writes.
    Write,
    /// Instruction fetches.
    Execute,
}

#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum MemoryError {
    #[error("misaligned access")]
    MisalignedAccess,
    #[error("access fault")]
    AccessFault,
    #[error("page fault")]
    PageFault,
}

/// A cached translation.
///
/// `hash` is the virtual page address of the accesses this entry serves; an entry only exists
/// for pages backed by a physical-memory device, so hits bypass bus dispatch entirely. `delta`
/// maps a virtual address to its offset within the backing device
/// (`device_offset = vaddr + delta`, wrapping).
#[derive(Debug, Copy, Clone)]
struct TlbEntry {
    hash: u64,
    delta: u64,
    device: DeviceHandle,
}

const INVALID_HASH: u64 = u64::MAX;

impl TlbEntry {
    const fn invalid() -> Self {
        Self {
            hash: INVALID_HASH,
            delta: 0,
            device: DeviceHandle::invalid(),
        }
    }
}

/// One direct-mapped translation cache. The core keeps three: fetch, load, and store.
#[derive(Debug)]
pub(super) struct Tlb {
    entries: Vec<TlbEntry>,
}

impl Tlb {
    pub(super) fn new() -> Self {
        Self {
            entries: vec![TlbEntry::invalid(); TLB_ENTRIES],
        }
    }

    fn flush(&mut self) {
        self.entries.fill(TlbEntry::invalid());
    }

    fn slot(&mut self, vaddr: u64) -> &mut TlbEntry {
        &mut self.entries[((vaddr >> PAGE_SHIFT) as usize) & (TLB_ENTRIES - 1)]
    }
}

/// The paging modes selectable through `satp`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) enum SatpMode {
    Bare,
    Sv32,
    Sv39,
    Sv48,
}

impl SatpMode {
    /// (page-table levels, VPN bits per level, log2 of the PTE size)
    fn geometry(self) -> (u32, u32, u32) {
        match self {
            SatpMode::Bare => unreachable!(),
            SatpMode::Sv32 => (2, 10, 2),
            SatpMode::Sv39 => (3, 9, 3),
            SatpMode::Sv48 => (4, 9, 3),
        }
    }
}

mod pte {
    pub const V: u64 = 1 << 0;
    pub const R: u64 = 1 << 1;
    pub const W: u64 = 1 << 2;
    pub const X: u64 = 1 << 3;
    pub const U: u64 = 1 << 4;
    pub const A: u64 = 1 << 6;
    pub const D: u64 = 1 << 7;

    pub fn ppn(entry: u64) -> u64 {
        (entry >> 10) & 0xFFF_FFFF_FFFF
    }
}

impl Core {
    /// Drop every cached translation.
    ///
    /// Must be called whenever the privilege level, `satp`, or the translation-relevant status
    /// bits (`MPRV`, `SUM`, `MXR`, `MPP`, `MPV`) change. Also invalidates any LR reservation,
    /// since the reservation's translation may no longer hold.
    pub fn flush_tlb(&mut self) {
        trace!("Flushing TLBs");
        self.tlb_fetch.flush();
        self.tlb_load.flush();
        self.tlb_store.flush();
        self.reservation = None;
    }

    /// The privilege level at which loads and stores execute.
    ///
    /// > When MPRV=1, load and store memory addresses are translated and protected, and
    /// > endianness is applied, as though the current privilege mode were set to MPP.
    pub fn effective_privilege(&self) -> PrivilegeLevel {
        match self.status.mprv() {
            true => self.status.mpp(),
            false => self.privilege,
        }
    }

    /// Invoke a load of `1 << size_log2` bytes for the virtual address `vaddr`.
    pub(super) fn virt_load(
        &mut self,
        bus: &mut SystemBus,
        vaddr: u64,
        size_log2: u32,
    ) -> Result<u64, MemoryError> {
        let vaddr = self.config.xlen.truncate(vaddr);
        let size = 1u64 << size_log2;
        if vaddr & (size - 1) != 0 {
            return Err(MemoryError::MisalignedAccess);
        }
        let hash = vaddr & !PAGE_MASK;
        let entry = *self.tlb_load.slot(vaddr);
        if entry.hash == hash {
            if let Some(memory) = bus.memory_mut(entry.device) {
                return Ok(memory
                    .load(vaddr.wrapping_add(entry.delta), size_log2)
                    .map_err(|_| MemoryError::AccessFault)?);
            }
        }
        let privilege = self.effective_privilege();
        let paddr = self.translate(bus, vaddr, AccessType::Read, privilege)?;
        self.fill_tlb(bus, TlbKind::Load, vaddr, paddr);
        bus.load(paddr, size_log2)
            .map_err(|_| MemoryError::AccessFault)
    }

    /// Invoke a store of `1 << size_log2` bytes for the virtual address `vaddr`.
    pub(super) fn virt_store(
        &mut self,
        bus: &mut SystemBus,
        vaddr: u64,
        value: u64,
        size_log2: u32,
    ) -> Result<(), MemoryError> {
        let vaddr = self.config.xlen.truncate(vaddr);
        let size = 1u64 << size_log2;
        if vaddr & (size - 1) != 0 {
            return Err(MemoryError::MisalignedAccess);
        }
        // A store to the reserved address breaks the reservation.
        if self
            .reservation
            .is_some_and(|reserved| reserved & !0b111 == vaddr & !0b111)
        {
            self.reservation = None;
        }
        let hash = vaddr & !PAGE_MASK;
        let entry = *self.tlb_store.slot(vaddr);
        if entry.hash == hash {
            if let Some(memory) = bus.memory_mut(entry.device) {
                return memory
                    .store(vaddr.wrapping_add(entry.delta), value, size_log2)
                    .map_err(|_| MemoryError::AccessFault);
            }
        }
        let privilege = self.effective_privilege();
        let paddr = self.translate(bus, vaddr, AccessType::Write, privilege)?;
        self.fill_tlb(bus, TlbKind::Store, vaddr, paddr);
        bus.store(paddr, value, size_log2)
            .map_err(|_| MemoryError::AccessFault)
    }

    /// Perform an atomic read-modify-write of `1 << size_log2` bytes at `vaddr`, returning the
    /// old value.
    ///
    /// Both halves execute under store permissions, so a denied access reports as a store
    /// fault, as the A extension requires.
    pub(super) fn virt_amo(
        &mut self,
        bus: &mut SystemBus,
        vaddr: u64,
        size_log2: u32,
        f: impl FnOnce(u64) -> u64,
    ) -> Result<u64, MemoryError> {
        let vaddr = self.config.xlen.truncate(vaddr);
        let size = 1u64 << size_log2;
        if vaddr & (size - 1) != 0 {
            return Err(MemoryError::MisalignedAccess);
        }
        if self
            .reservation
            .is_some_and(|reserved| reserved & !0b111 == vaddr & !0b111)
        {
            self.reservation = None;
        }
        let privilege = self.effective_privilege();
        let paddr = self.translate(bus, vaddr, AccessType::Write, privilege)?;
        let old = bus
            .load(paddr, size_log2)
            .map_err(|_| MemoryError::AccessFault)?;
        bus.store(paddr, f(old), size_log2)
            .map_err(|_| MemoryError::AccessFault)?;
        Ok(old)
    }

    /// Fetch the 16-bit instruction parcel at `vaddr`.
    ///
    /// > Instructions are stored in memory as a sequence of 16-bit little-endian parcels,
    /// > regardless of memory system endianness.
    pub(super) fn fetch_parcel(
        &mut self,
        bus: &mut SystemBus,
        vaddr: u64,
    ) -> Result<u16, MemoryError> {
        let vaddr = self.config.xlen.truncate(vaddr);
        if vaddr & 0b1 != 0 {
            return Err(MemoryError::MisalignedAccess);
        }
        let hash = vaddr & !PAGE_MASK;
        let entry = *self.tlb_fetch.slot(vaddr);
        if entry.hash == hash {
            if let Some(memory) = bus.memory_mut(entry.device) {
                return Ok(memory
                    .load(vaddr.wrapping_add(entry.delta), 1)
                    .map_err(|_| MemoryError::AccessFault)? as u16);
            }
        }
        // Fetches use the core's privilege level, never the effective one.
        let privilege = self.privilege;
        let paddr = self.translate(bus, vaddr, AccessType::Execute, privilege)?;
        self.fill_tlb(bus, TlbKind::Fetch, vaddr, paddr);
        Ok(bus.load(paddr, 1).map_err(|_| MemoryError::AccessFault)? as u16)
    }

    /// Map the page containing `vaddr` for fetching: returns the backing device, the
    /// virtual-to-device-offset delta, and the last virtual address at which a fully contained
    /// 32-bit instruction can start.
    pub(super) fn map_fetch_page(
        &mut self,
        bus: &mut SystemBus,
        vaddr: u64,
    ) -> Result<Option<(DeviceHandle, u64, u64)>, MemoryError> {
        // Populate the fetch TLB for this page (also validates the access).
        self.fetch_parcel(bus, vaddr)?;
        let entry = *self.tlb_fetch.slot(vaddr);
        if entry.hash != vaddr & !PAGE_MASK {
            // The page is not backed by physical memory (MMIO fetch); no window available.
            return Ok(None);
        }
        let page_end = vaddr | PAGE_MASK;
        Ok(Some((entry.device, entry.delta, page_end - 3)))
    }

    fn fill_tlb(&mut self, bus: &mut SystemBus, kind: TlbKind, vaddr: u64, paddr: u64) {
        // Only physical-memory devices may be mapped directly; MMIO always takes the slow path.
        let Some((range, device)) = bus.memory_map().lookup(paddr) else {
            return;
        };
        if !bus.is_memory(device) {
            return;
        }
        // The whole page must fall within the device so every future hit stays in bounds.
        let page_start = paddr & !PAGE_MASK;
        if page_start < range.start() || range.end() < page_start + PAGE_MASK {
            return;
        }
        let delta = paddr.wrapping_sub(range.start()).wrapping_sub(vaddr);
        let hash = vaddr & !PAGE_MASK;
        let tlb = match kind {
            TlbKind::Fetch => &mut self.tlb_fetch,
            TlbKind::Load => &mut self.tlb_load,
            TlbKind::Store => &mut self.tlb_store,
        };
        *tlb.slot(vaddr) = TlbEntry {
            hash,
            delta,
            device,
        };
    }

    /// Map a virtual byte address to the corresponding physical byte address.
    ///
    /// Follows the page-table walk of the privileged spec for the mode selected by `satp`;
    /// M-mode and bare mode map one-to-one.
    pub(super) fn translate(
        &mut self,
        bus: &mut SystemBus,
        vaddr: u64,
        access_type: AccessType,
        privilege: PrivilegeLevel,
    ) -> Result<u64, MemoryError> {
        // Satp must be active (privilege U or S) for translation to apply.
        let user_mode = match privilege {
            PrivilegeLevel::Machine => return Ok(vaddr),
            PrivilegeLevel::User => true,
            PrivilegeLevel::Supervisor => false,
        };
        let mode = self.satp_mode();
        if mode == SatpMode::Bare {
            return Ok(vaddr);
        }
        let (levels, vpn_bits, pte_size_log2) = mode.geometry();

        // The virtual address must be canonical: bits above the VA range equal the top VA bit.
        let va_bits = PAGE_SHIFT + levels * vpn_bits;
        if mode != SatpMode::Sv32 {
            let extension = (vaddr as i64) << (64 - va_bits) >> (64 - va_bits);
            if extension as u64 != vaddr {
                return Err(MemoryError::PageFault);
            }
        }

        let vpn_mask = (1u64 << vpn_bits) - 1;
        // STEP 1
        let mut page_table = self.satp_ppn() << PAGE_SHIFT;
        for level in (0..levels).rev() {
            // STEP 2
            let vpn = (vaddr >> (PAGE_SHIFT + level * vpn_bits)) & vpn_mask;
            let entry_address = page_table + (vpn << pte_size_log2);
            // A page-table address that is not backed by memory faults the same way as an
            // invalid entry would.
            let mut entry = bus
                .load(entry_address, pte_size_log2)
                .map_err(|_| MemoryError::PageFault)?;
            // STEP 3
            if entry & pte::V == 0 || (entry & pte::R == 0 && entry & pte::W != 0) {
                return Err(MemoryError::PageFault);
            }
            // STEP 4
            if entry & (pte::R | pte::X) == 0 {
                // This PTE is a pointer to the next level of the page table.
                // But if we're at the last level, this is a page fault.
                if level == 0 {
                    return Err(MemoryError::PageFault);
                }
                page_table = pte::ppn(entry) << PAGE_SHIFT;
                continue;
            }
            // STEP 5
            let allowed = match access_type {
                AccessType::Read => entry & pte::R != 0 || (self.status.mxr() && entry & pte::X != 0),
                AccessType::Write => entry & pte::W != 0,
                AccessType::Execute => entry & pte::X != 0,
            } && match (user_mode, entry & pte::U != 0) {
                (true, u) => u,
                // S-mode may touch U pages only with SUM set, and may never execute them.
                (false, true) => self.status.sum() && access_type != AccessType::Execute,
                (false, false) => true,
            };
            if !allowed {
                debug!(
                    vaddr, privilege:%;
                    "Page permissions deny access"
                );
                return Err(MemoryError::PageFault);
            }
            // STEP 6 & 8
            let mut ppn = pte::ppn(entry);
            if level != 0 {
                // STEP 6: superpages must be aligned to their size.
                let mask = (1u64 << (level * vpn_bits)) - 1;
                if ppn & mask != 0 {
                    return Err(MemoryError::PageFault);
                }
                // STEP 8
                ppn |= (vaddr >> PAGE_SHIFT) & mask;
            }
            // STEP 7: update the A and D bits as needed.
            let wants_d = access_type == AccessType::Write;
            if entry & pte::A == 0 || (wants_d && entry & pte::D == 0) {
                entry |= pte::A;
                if wants_d {
                    entry |= pte::D;
                }
                bus.store(entry_address, entry, pte_size_log2)
                    .map_err(|_| MemoryError::PageFault)?;
            }
            return Ok((ppn << PAGE_SHIFT) | (vaddr & PAGE_MASK));
        }
        // The loop always returns or faults; satp modes have at least one level.
        unreachable!()
    }

    pub(super) fn satp_mode(&self) -> SatpMode {
        match self.config.xlen {
            Xlen::Rv32 => match self.satp >> 31 & 1 {
                0 => SatpMode::Bare,
                _ => SatpMode::Sv32,
            },
            Xlen::Rv64 => match self.satp >> 60 {
                8 => SatpMode::Sv39,
                9 => SatpMode::Sv48,
                _ => SatpMode::Bare,
            },
        }
    }

    fn satp_ppn(&self) -> u64 {
        match self.config.xlen {
            Xlen::Rv32 => self.satp & 0x3F_FFFF,
            Xlen::Rv64 => self.satp & 0xFFF_FFFF_FFFF,
        }
    }
}

#[derive(Debug, Copy, Clone)]
enum TlbKind {
    Fetch,
    Load,
    Store,
}
