//! Bookkeeping of the physical memory layout: which address ranges are claimed by which devices.

use crate::system_bus::DeviceHandle;
use crate::AddressRange;
use log::debug;
use std::cmp::Ordering;
use thiserror::Error;

/// The physical address window in which memory-mapped I/O devices are allocated.
pub const DEVICE_WINDOW: AddressRange = AddressRange::from_const(0x1000_0000, 0x7FFF_FFFF);

/// The physical address window in which main memory is allocated.
pub const RAM_WINDOW: AddressRange = AddressRange::from_const(0x8000_0000, 0xFFFF_FFFF);

/// Map of non-overlapping 64-bit address ranges to device handles.
///
/// The ranges are kept sorted by start address so that lookups are a binary search. Mutations are
/// expected to be rare (board setup and teardown); lookups happen on every memory access that
/// misses the TLB.
#[derive(Debug, Default)]
pub struct MemoryMap {
    ordered_ranges: Vec<(AddressRange, DeviceHandle)>,
}

impl MemoryMap {
    /// Create a new empty map.
    pub fn new() -> Self {
        Self {
            ordered_ranges: Vec::new(),
        }
    }

    /// Claim `range` for `device`.
    ///
    /// Fails if `range` overlaps any previously added range, or if `device` already claimed a
    /// range (each device may appear at most once).
    pub fn add(&mut self, range: AddressRange, device: DeviceHandle) -> Result<(), MemoryMapError> {
        if self.range_for(device).is_some() {
            return Err(MemoryMapError::DeviceAlreadyMapped);
        }
        let index = self
            .ordered_ranges
            .partition_point(|(r, _)| r.start() < range.start());
        let overlaps_prev = index
            .checked_sub(1)
            .and_then(|i| self.ordered_ranges.get(i))
            .is_some_and(|(r, _)| r.end() >= range.start());
        let overlaps_next = self
            .ordered_ranges
            .get(index)
            .is_some_and(|(r, _)| r.start() <= range.end());
        if overlaps_prev || overlaps_next {
            return Err(MemoryMapError::OverlappingAddressRanges);
        }
        debug!("Mapping device {device:?} at {range}");
        self.ordered_ranges.insert(index, (range, device));
        Ok(())
    }

    /// Release the range claimed by `device`, returning it.
    pub fn remove(&mut self, device: DeviceHandle) -> Option<AddressRange> {
        let index = self
            .ordered_ranges
            .iter()
            .position(|&(_, handle)| handle == device)?;
        let (range, _) = self.ordered_ranges.remove(index);
        debug!("Unmapping device {device:?} from {range}");
        Some(range)
    }

    /// Returns the range containing `address` and the device it is claimed by, in O(log n).
    pub fn lookup(&self, address: u64) -> Option<(AddressRange, DeviceHandle)> {
        self.ordered_ranges
            .binary_search_by(|(range, _)| {
                if address < range.start() {
                    Ordering::Greater
                } else if address <= range.end() {
                    Ordering::Equal
                } else {
                    Ordering::Less
                }
            })
            .ok()
            .map(|index| self.ordered_ranges[index])
    }

    /// Returns the first claimed range that shares at least one address with `range`.
    pub fn lookup_intersecting(&self, range: AddressRange) -> Option<(AddressRange, DeviceHandle)> {
        let index = self
            .ordered_ranges
            .partition_point(|(r, _)| r.end() < range.start());
        self.ordered_ranges
            .get(index)
            .filter(|(r, _)| r.start() <= range.end())
            .copied()
    }

    /// Returns the range claimed by `device`, if any.
    pub fn range_for(&self, device: DeviceHandle) -> Option<AddressRange> {
        self.ordered_ranges
            .iter()
            .find(|&&(_, handle)| handle == device)
            .map(|&(range, _)| range)
    }

    /// Iterate over all claimed ranges in address order.
    pub fn iter(&self) -> impl Iterator<Item = (AddressRange, DeviceHandle)> + '_ {
        self.ordered_ranges.iter().copied()
    }

    /// Find a free start address for a device of `size` bytes within `region`.
    ///
    /// The start address is rounded up to an 8-byte boundary. The scan walks forward from the
    /// start of the region, skipping past every claimed range it collides with. Returns `None` if
    /// `size` is zero or the region cannot fit the device.
    pub fn allocate(&self, size: u64, region: AddressRange) -> Option<u64> {
        if size == 0 || size > (1 << 32) {
            return None;
        }
        let mut start = align_up(region.start());
        loop {
            let candidate = AddressRange::with_size(start, size).ok()?;
            if candidate.end() > region.end() {
                return None;
            }
            match self.lookup_intersecting(candidate) {
                None => return Some(start),
                Some((conflict, _)) => {
                    start = align_up(conflict.end().checked_add(1)?);
                }
            }
        }
    }
}

fn align_up(address: u64) -> u64 {
    (address + 7) & !7
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum MemoryMapError {
    /// Attempt to add an address range that overlaps with a previously added address range.
    #[error("address range overlaps with previously added address range")]
    OverlappingAddressRanges,
    /// Attempt to add a device that already claimed a range.
    #[error("device is already mapped")]
    DeviceAlreadyMapped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_range;

    fn handle(index: u32) -> DeviceHandle {
        DeviceHandle::from_index(index)
    }

    #[test]
    fn test_add_rejects_overlap() {
        let mut map = MemoryMap::new();
        map.add(address_range![0x1000, 0x1FFF], handle(0)).unwrap();
        map.add(address_range![0x3000, 0x3FFF], handle(1)).unwrap();
        assert_eq!(
            Err(MemoryMapError::OverlappingAddressRanges),
            map.add(address_range![0x1FFF, 0x2FFF], handle(2))
        );
        assert_eq!(
            Err(MemoryMapError::OverlappingAddressRanges),
            map.add(address_range![0x0, 0x1000], handle(2))
        );
        assert_eq!(
            Err(MemoryMapError::OverlappingAddressRanges),
            map.add(address_range![0x0, 0xFFFF], handle(2))
        );
        // The gap between the two claimed ranges is still free.
        map.add(address_range![0x2000, 0x2FFF], handle(2)).unwrap();
    }

    #[test]
    fn test_add_rejects_duplicate_device() {
        let mut map = MemoryMap::new();
        map.add(address_range![0x1000, 0x1FFF], handle(0)).unwrap();
        assert_eq!(
            Err(MemoryMapError::DeviceAlreadyMapped),
            map.add(address_range![0x5000, 0x5FFF], handle(0))
        );
    }

    #[test]
    fn test_lookup() {
        let mut map = MemoryMap::new();
        map.add(address_range![0x1000, 0x1FFF], handle(0)).unwrap();
        map.add(address_range![0x8000_0000, 0x8FFF_FFFF], handle(1))
            .unwrap();
        assert_eq!(None, map.lookup(0xFFF));
        assert_eq!(None, map.lookup(0x2000));
        let (range, device) = map.lookup(0x1234).unwrap();
        assert_eq!(address_range![0x1000, 0x1FFF], range);
        assert_eq!(handle(0), device);
        let (range, device) = map.lookup(0x8123_4567).unwrap();
        assert_eq!(address_range![0x8000_0000, 0x8FFF_FFFF], range);
        assert_eq!(handle(1), device);
    }

    #[test]
    fn test_remove() {
        let mut map = MemoryMap::new();
        map.add(address_range![0x1000, 0x1FFF], handle(0)).unwrap();
        assert_eq!(Some(address_range![0x1000, 0x1FFF]), map.remove(handle(0)));
        assert_eq!(None, map.remove(handle(0)));
        assert_eq!(None, map.lookup(0x1000));
        // The released range can be claimed again.
        map.add(address_range![0x1000, 0x1FFF], handle(0)).unwrap();
    }

    #[test]
    fn test_allocate_skips_claimed_ranges() {
        let mut map = MemoryMap::new();
        map.add(address_range![0x1000_0000, 0x1000_0FFF], handle(0))
            .unwrap();
        // First fit lands right after the claimed range, 8-byte aligned.
        assert_eq!(Some(0x1000_1000), map.allocate(0x100, DEVICE_WINDOW));
        map.add(address_range![0x1000_1000, 0x1000_1003], handle(1))
            .unwrap();
        assert_eq!(Some(0x1000_1008), map.allocate(0x100, DEVICE_WINDOW));
    }

    #[test]
    fn test_allocate_rejects_empty_and_exhausted() {
        let mut map = MemoryMap::new();
        assert_eq!(None, map.allocate(0, DEVICE_WINDOW));
        let window = address_range![0x1000_0000, 0x1000_0FFF];
        map.add(window, handle(0)).unwrap();
        assert_eq!(None, map.allocate(0x1000, window));
    }
}
