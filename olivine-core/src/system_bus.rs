//! The system bus: a physical memory map routing loads and stores to memory-mapped devices.

use crate::devices::memory::Memory;
use crate::memory_map::{MemoryMap, MemoryMapError};
use crate::AddressRange;
use downcast_rs::{impl_downcast, Downcast};
use log::trace;
use std::fmt;
use std::fmt::Debug;
use thiserror::Error;

/// A device attached to the system bus.
///
/// Devices expose a byte-addressable window of `size()` bytes, accessed with naturally-aligned
/// loads and stores of 1, 2, 4, or 8 bytes (`size_log2` in `0..=3`). The bus hands devices the
/// offset of the access relative to the start of their claimed range.
///
/// All values cross this interface in little-endian byte order, i.e. as plain integers.
pub trait Device: Debug + Downcast {
    /// Size in bytes of this device's address window. Must be non-zero and constant.
    fn size(&self) -> u64;

    /// Invoke a read access at `offset` of `1 << size_log2` bytes.
    fn load(&mut self, offset: u64, size_log2: u32) -> Result<u64, MemoryAccessError>;

    /// Invoke a write access at `offset` of `1 << size_log2` bytes.
    fn store(&mut self, offset: u64, value: u64, size_log2: u32) -> Result<(), MemoryAccessError>;

    /// Returns `true` if this device wants [`step`](Self::step) to be called by the board loop.
    fn needs_step(&self) -> bool {
        false
    }

    /// Let the device make progress. `cycles` is the budget the board granted the CPU.
    ///
    /// The device is detached from `bus` while stepping, so it can freely access other devices
    /// (e.g. walk virtqueue descriptors in main memory).
    fn step(&mut self, bus: &mut SystemBus, cycles: u64) {
        let _ = (bus, cycles);
    }

    /// Force the device back to its reset state.
    fn reset(&mut self) {}
}

impl_downcast!(Device);

/// Stable identifier of a device attached to a [`SystemBus`].
///
/// Handles are never reused; a handle stays valid (but dangling) after its device is removed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct DeviceHandle(u32);

impl DeviceHandle {
    pub(crate) fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// A handle that never resolves to a device.
    pub(crate) const fn invalid() -> Self {
        Self(u32::MAX)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Owner of all devices and of the [`MemoryMap`] routing addresses to them.
///
/// Devices are stored in an arena indexed by [`DeviceHandle`]; the map and all other components
/// refer to devices by handle only, which breaks the ownership cycles between board, CPU, and
/// interrupt-raising devices.
#[derive(Debug, Default)]
pub struct SystemBus {
    devices: Vec<Option<Box<dyn Device>>>,
    map: MemoryMap,
}

impl SystemBus {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            map: MemoryMap::new(),
        }
    }

    /// Attach `device` at the fixed physical address `address`.
    pub fn add_device(
        &mut self,
        address: u64,
        device: Box<dyn Device>,
    ) -> Result<DeviceHandle, MemoryMapError> {
        let range = AddressRange::with_size(address, device.size())
            .map_err(|_| MemoryMapError::OverlappingAddressRanges)?;
        let handle = DeviceHandle(self.devices.len() as u32);
        self.map.add(range, handle)?;
        self.devices.push(Some(device));
        Ok(handle)
    }

    /// Attach `device` at the first free address within `region`.
    ///
    /// See [`MemoryMap::allocate`] for the scan strategy.
    pub fn allocate_device(
        &mut self,
        region: AddressRange,
        device: Box<dyn Device>,
    ) -> Option<DeviceHandle> {
        let address = self.map.allocate(device.size(), region)?;
        self.add_device(address, device).ok()
    }

    /// Detach the device behind `handle`, returning it.
    pub fn remove_device(&mut self, handle: DeviceHandle) -> Option<Box<dyn Device>> {
        self.map.remove(handle);
        self.devices.get_mut(handle.index())?.take()
    }

    /// The memory map routing addresses to attached devices.
    pub fn memory_map(&self) -> &MemoryMap {
        &self.map
    }

    /// Returns the range claimed by `handle`, if it is attached.
    pub fn range_of(&self, handle: DeviceHandle) -> Option<AddressRange> {
        self.map.range_for(handle)
    }

    pub fn device_mut(&mut self, handle: DeviceHandle) -> Option<&mut dyn Device> {
        self.devices
            .get_mut(handle.index())
            .and_then(|slot| slot.as_deref_mut())
    }

    /// Returns the device behind `handle` if it is a physical-memory device.
    pub fn memory_mut(&mut self, handle: DeviceHandle) -> Option<&mut Memory> {
        self.device_mut(handle)?.downcast_mut::<Memory>()
    }

    /// Returns `true` if `handle` refers to a physical-memory device.
    ///
    /// Only such devices may be entered into the TLB for direct access.
    pub fn is_memory(&self, handle: DeviceHandle) -> bool {
        self.devices
            .get(handle.index())
            .and_then(|slot| slot.as_deref())
            .is_some_and(|device| device.is::<Memory>())
    }

    /// Invoke a read access for the physical address `address` of `1 << size_log2` bytes.
    pub fn load(&mut self, address: u64, size_log2: u32) -> Result<u64, MemoryAccessError> {
        trace!("Loading {} bytes at paddr {address:#x}", 1u32 << size_log2);
        let (range, handle) = self
            .map
            .lookup(address)
            .ok_or(MemoryAccessError::Unmapped)?;
        let device = self
            .device_mut(handle)
            .ok_or(MemoryAccessError::Unmapped)?;
        device.load(range.offset_of(address), size_log2)
    }

    /// Invoke a write access for the physical address `address` of `1 << size_log2` bytes.
    pub fn store(
        &mut self,
        address: u64,
        value: u64,
        size_log2: u32,
    ) -> Result<(), MemoryAccessError> {
        trace!(value; "Storing {} bytes at paddr {address:#x}", 1u32 << size_log2);
        let (range, handle) = self
            .map
            .lookup(address)
            .ok_or(MemoryAccessError::Unmapped)?;
        let device = self
            .device_mut(handle)
            .ok_or(MemoryAccessError::Unmapped)?;
        device.store(range.offset_of(address), value, size_log2)
    }

    /// Mark the byte at physical address `address` dirty if it belongs to a physical-memory
    /// device.
    ///
    /// Dirtiness monotonically reflects committed writes; see [`Memory::dirty_bitmap`] for the
    /// cross-thread variant.
    pub fn set_dirty(&mut self, address: u64) {
        if let Some((range, handle)) = self.map.lookup(address) {
            let offset = range.offset_of(address);
            if let Some(memory) = self.memory_mut(handle) {
                memory.dirty_bitmap().set_dirty(offset);
            }
        }
    }

    /// Step every device that asked for it, granting each the full `cycles` budget.
    pub fn step_devices(&mut self, cycles: u64) {
        for index in 0..self.devices.len() {
            let needs_step = self.devices[index]
                .as_deref()
                .is_some_and(|device| device.needs_step());
            if !needs_step {
                continue;
            }
            // Detach while stepping so the device can access the rest of the bus.
            let mut device = self.devices[index].take().unwrap();
            device.step(self, cycles);
            self.devices[index] = Some(device);
        }
    }

    /// Reset every attached device.
    pub fn reset_devices(&mut self) {
        for slot in &mut self.devices {
            if let Some(device) = slot.as_deref_mut() {
                device.reset();
            }
        }
    }
}

/// Errors that a physical memory access can produce.
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum MemoryAccessError {
    /// The address is not claimed by any device.
    #[error("access to unmapped physical address")]
    Unmapped,
    /// The offset lies outside the device's window.
    #[error("device access out of bounds")]
    OutOfBounds,
    /// The device does not support accesses of the requested width.
    #[error("unsupported access width")]
    UnsupportedSize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::memory::Memory;
    use crate::memory_map::RAM_WINDOW;

    #[test]
    fn test_route_to_memory() {
        let mut bus = SystemBus::new();
        let handle = bus
            .allocate_device(RAM_WINDOW, Box::new(Memory::new(0x1000)))
            .unwrap();
        let base = bus.range_of(handle).unwrap().start();
        assert_eq!(0x8000_0000, base);
        bus.store(base + 8, 0x1122_3344_5566_7788, 3).unwrap();
        assert_eq!(0x1122_3344_5566_7788, bus.load(base + 8, 3).unwrap());
        assert_eq!(0x5566_7788, bus.load(base + 8, 2).unwrap());
        assert_eq!(0x1122, bus.load(base + 14, 1).unwrap());
    }

    #[test]
    fn test_unmapped_access() {
        let mut bus = SystemBus::new();
        assert_eq!(Err(MemoryAccessError::Unmapped), bus.load(0x4000, 2));
        assert_eq!(
            Err(MemoryAccessError::Unmapped),
            bus.store(0x4000, 0xFF, 0)
        );
    }

    #[test]
    fn test_remove_unmaps() {
        let mut bus = SystemBus::new();
        let handle = bus
            .allocate_device(RAM_WINDOW, Box::new(Memory::new(0x1000)))
            .unwrap();
        let base = bus.range_of(handle).unwrap().start();
        bus.remove_device(handle).unwrap();
        assert_eq!(Err(MemoryAccessError::Unmapped), bus.load(base, 2));
    }
}
