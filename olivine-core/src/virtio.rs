//! Device-side virtio-MMIO transport (revision 2) with split virtqueues.

use crate::devices::plic::PlicSource;
use crate::system_bus::{MemoryAccessError, SystemBus};
use log::{debug, trace, warn};
use thiserror::Error;

const MAGIC: u32 = 0x7472_6976; // "virt"
const VERSION: u32 = 2;
const VENDOR_ID: u32 = 0x4f4c_5653;

/// Feature bit common to all devices: the device accepts the VIRTIO_F_VERSION_1 layout.
pub const F_VERSION_1: u64 = 1 << 32;

mod reg {
    pub const MAGIC: u64 = 0x000;
    pub const VERSION: u64 = 0x004;
    pub const DEVICE_ID: u64 = 0x008;
    pub const VENDOR_ID: u64 = 0x00C;
    pub const DEVICE_FEATURES: u64 = 0x010;
    pub const DEVICE_FEATURES_SEL: u64 = 0x014;
    pub const DRIVER_FEATURES: u64 = 0x020;
    pub const DRIVER_FEATURES_SEL: u64 = 0x024;
    pub const QUEUE_SEL: u64 = 0x030;
    pub const QUEUE_NUM_MAX: u64 = 0x034;
    pub const QUEUE_NUM: u64 = 0x038;
    pub const QUEUE_READY: u64 = 0x044;
    pub const QUEUE_NOTIFY: u64 = 0x050;
    pub const INTERRUPT_STATUS: u64 = 0x060;
    pub const INTERRUPT_ACK: u64 = 0x064;
    pub const STATUS: u64 = 0x070;
    pub const QUEUE_DESC_LOW: u64 = 0x080;
    pub const QUEUE_DESC_HIGH: u64 = 0x084;
    pub const QUEUE_DRIVER_LOW: u64 = 0x090;
    pub const QUEUE_DRIVER_HIGH: u64 = 0x094;
    pub const QUEUE_DEVICE_LOW: u64 = 0x0A0;
    pub const QUEUE_DEVICE_HIGH: u64 = 0x0A4;
    pub const CONFIG: u64 = 0x100;
}

mod statusbits {
    pub const DRIVER_OK: u32 = 4;
    pub const FAILED: u32 = 128;
}

const QUEUE_NUM_MAX_VALUE: u32 = 256;

/// This marks a buffer as continuing via the next field.
const DESC_F_NEXT: u16 = 1;
/// This marks a buffer as device write-only (otherwise device read-only).
const DESC_F_WRITE: u16 = 2;

/// The common MMIO register window of a virtio device, plus its split virtqueues.
///
/// Concrete devices embed this and route their [`Device`](crate::system_bus::Device) register
/// accesses through [`load`](Self::load)/[`store`](Self::store); queue servicing happens in
/// their `step`.
#[derive(Debug)]
pub struct VirtioMmio {
    device_id: u32,
    device_features: u64,
    device_features_sel: u32,
    driver_features: u64,
    driver_features_sel: u32,
    status: u32,
    queue_sel: u32,
    queues: Vec<Virtqueue>,
    interrupt_status: u32,
    config: Vec<u8>,
    notified: bool,
    irq: Option<PlicSource>,
}

impl VirtioMmio {
    /// Create a transport for device type `device_id` advertising `features` (in addition to
    /// VIRTIO_F_VERSION_1) and exposing `config` as its configuration space.
    pub fn new(
        device_id: u32,
        features: u64,
        queue_count: usize,
        config: Vec<u8>,
        irq: Option<PlicSource>,
    ) -> Self {
        Self {
            device_id,
            device_features: features | F_VERSION_1,
            device_features_sel: 0,
            driver_features: 0,
            driver_features_sel: 0,
            status: 0,
            queue_sel: 0,
            queues: (0..queue_count).map(|_| Virtqueue::new()).collect(),
            interrupt_status: 0,
            config,
            notified: false,
            irq,
        }
    }

    /// Returns `true` once the driver completed initialization and the device has not failed.
    pub fn is_running(&self) -> bool {
        self.status & statusbits::DRIVER_OK != 0 && self.status & statusbits::FAILED == 0
    }

    /// Latch a fatal device error: sets FAILED and stops queue servicing until reset.
    pub fn fail(&mut self) {
        warn!("Virtio device {:#x} failed", self.device_id);
        self.status |= statusbits::FAILED;
        self.notified = false;
    }

    /// Consume a pending queue notification.
    pub fn take_notification(&mut self) -> bool {
        std::mem::take(&mut self.notified)
    }

    pub(crate) fn renotify(&mut self) {
        self.notified = true;
    }

    pub fn queue_mut(&mut self, index: usize) -> &mut Virtqueue {
        &mut self.queues[index]
    }

    /// Signal a used-buffer notification to the driver.
    pub fn interrupt_used(&mut self) {
        self.interrupt_status |= 1;
        if let Some(irq) = &self.irq {
            irq.raise();
        }
    }

    pub fn load(&mut self, offset: u64, size_log2: u32) -> Result<u64, MemoryAccessError> {
        if offset >= reg::CONFIG {
            return self.load_config(offset - reg::CONFIG, size_log2);
        }
        if size_log2 != 2 {
            return Err(MemoryAccessError::UnsupportedSize);
        }
        let value = match offset {
            reg::MAGIC => MAGIC,
            reg::VERSION => VERSION,
            reg::DEVICE_ID => self.device_id,
            reg::VENDOR_ID => VENDOR_ID,
            reg::DEVICE_FEATURES => match self.device_features_sel {
                0 => self.device_features as u32,
                1 => (self.device_features >> 32) as u32,
                _ => 0,
            },
            reg::QUEUE_NUM_MAX => match self.queues.get(self.queue_sel as usize) {
                Some(_) => QUEUE_NUM_MAX_VALUE,
                None => 0,
            },
            reg::QUEUE_READY => self
                .queues
                .get(self.queue_sel as usize)
                .map(|queue| queue.ready as u32)
                .unwrap_or(0),
            reg::INTERRUPT_STATUS => self.interrupt_status,
            reg::STATUS => self.status,
            _ => 0,
        };
        Ok(value as u64)
    }

    pub fn store(
        &mut self,
        offset: u64,
        value: u64,
        size_log2: u32,
    ) -> Result<(), MemoryAccessError> {
        if offset >= reg::CONFIG {
            // The configuration space of the devices we model is read-only.
            return Ok(());
        }
        if size_log2 != 2 {
            return Err(MemoryAccessError::UnsupportedSize);
        }
        let value = value as u32;
        match offset {
            reg::DEVICE_FEATURES_SEL => self.device_features_sel = value,
            reg::DRIVER_FEATURES => match self.driver_features_sel {
                0 => {
                    self.driver_features =
                        (self.driver_features & !0xFFFF_FFFF) | value as u64;
                }
                1 => {
                    self.driver_features =
                        (self.driver_features & 0xFFFF_FFFF) | (value as u64) << 32;
                }
                _ => {}
            },
            reg::DRIVER_FEATURES_SEL => self.driver_features_sel = value,
            reg::QUEUE_SEL => self.queue_sel = value,
            reg::QUEUE_NUM => {
                if let Some(queue) = self.queues.get_mut(self.queue_sel as usize) {
                    queue.size = value.min(QUEUE_NUM_MAX_VALUE);
                }
            }
            reg::QUEUE_READY => {
                if let Some(queue) = self.queues.get_mut(self.queue_sel as usize) {
                    queue.ready = value & 1 != 0;
                }
            }
            reg::QUEUE_NOTIFY => {
                trace!("Virtio queue {value} notified");
                self.notified = true;
            }
            reg::INTERRUPT_ACK => {
                self.interrupt_status &= !value;
                if self.interrupt_status == 0 {
                    if let Some(irq) = &self.irq {
                        irq.lower();
                    }
                }
            }
            reg::STATUS => match value {
                0 => self.reset(),
                _ => self.status = value,
            },
            reg::QUEUE_DESC_LOW => self.queue_address(|queue| &mut queue.desc, value, false),
            reg::QUEUE_DESC_HIGH => self.queue_address(|queue| &mut queue.desc, value, true),
            reg::QUEUE_DRIVER_LOW => self.queue_address(|queue| &mut queue.driver, value, false),
            reg::QUEUE_DRIVER_HIGH => self.queue_address(|queue| &mut queue.driver, value, true),
            reg::QUEUE_DEVICE_LOW => self.queue_address(|queue| &mut queue.device, value, false),
            reg::QUEUE_DEVICE_HIGH => self.queue_address(|queue| &mut queue.device, value, true),
            _ => {}
        }
        Ok(())
    }

    fn load_config(&self, offset: u64, size_log2: u32) -> Result<u64, MemoryAccessError> {
        let size = 1usize << size_log2;
        let start = usize::try_from(offset).map_err(|_| MemoryAccessError::OutOfBounds)?;
        let mut buf = [0u8; 8];
        for (i, slot) in buf[..size].iter_mut().enumerate() {
            *slot = self.config.get(start + i).copied().unwrap_or(0);
        }
        Ok(u64::from_le_bytes(buf))
    }

    fn queue_address(
        &mut self,
        select: impl FnOnce(&mut Virtqueue) -> &mut u64,
        value: u32,
        high: bool,
    ) {
        if let Some(queue) = self.queues.get_mut(self.queue_sel as usize) {
            let address = select(queue);
            *address = match high {
                false => (*address & !0xFFFF_FFFF) | value as u64,
                true => (*address & 0xFFFF_FFFF) | (value as u64) << 32,
            };
        }
    }

    /// Force the transport back to its reset state. Queue state and negotiated features are
    /// dropped; the configuration space is kept.
    pub fn reset(&mut self) {
        debug!("Virtio device {:#x} reset", self.device_id);
        let queue_count = self.queues.len();
        self.driver_features = 0;
        self.device_features_sel = 0;
        self.driver_features_sel = 0;
        self.status = 0;
        self.queue_sel = 0;
        self.queues = (0..queue_count).map(|_| Virtqueue::new()).collect();
        self.interrupt_status = 0;
        self.notified = false;
        if let Some(irq) = &self.irq {
            irq.lower();
        }
    }
}

/// Driver-facing state of one split virtqueue.
#[derive(Debug)]
pub struct Virtqueue {
    pub ready: bool,
    size: u32,
    /// Guest-physical address of the descriptor table.
    desc: u64,
    /// Guest-physical address of the driver (available) ring.
    driver: u64,
    /// Guest-physical address of the device (used) ring.
    device: u64,
    last_avail: u16,
}

/// One descriptor chain popped from the available ring: the readable (driver→device) and
/// writable (device→driver) buffer segments, in order.
#[derive(Debug)]
pub struct DescriptorChain {
    pub head: u16,
    pub readable: Vec<(u64, u32)>,
    pub writable: Vec<(u64, u32)>,
}

impl DescriptorChain {
    pub fn readable_len(&self) -> u64 {
        self.readable.iter().map(|&(_, len)| len as u64).sum()
    }

    pub fn writable_len(&self) -> u64 {
        self.writable.iter().map(|&(_, len)| len as u64).sum()
    }
}

impl Virtqueue {
    fn new() -> Self {
        Self {
            ready: false,
            size: QUEUE_NUM_MAX_VALUE,
            desc: 0,
            driver: 0,
            device: 0,
            last_avail: 0,
        }
    }

    /// Pop the next descriptor chain from the available ring, if any.
    pub fn pop_chain(&mut self, bus: &mut SystemBus) -> Result<Option<DescriptorChain>, VirtioError> {
        if !self.ready || self.size == 0 {
            return Ok(None);
        }
        let avail_idx = self.read_u16(bus, self.driver + 2)?;
        if avail_idx == self.last_avail {
            return Ok(None);
        }
        let slot = (self.last_avail as u32 % self.size) as u64;
        let head = self.read_u16(bus, self.driver + 4 + 2 * slot)?;
        self.last_avail = self.last_avail.wrapping_add(1);

        let mut chain = DescriptorChain {
            head,
            readable: Vec::new(),
            writable: Vec::new(),
        };
        let mut index = head;
        // A chain longer than the queue size means the descriptor table is corrupt.
        for _ in 0..=self.size {
            if index as u32 >= self.size {
                return Err(VirtioError::BadDescriptor(index));
            }
            let base = self.desc + 16 * index as u64;
            let addr = self.read_u64(bus, base)?;
            let len = self.read_u32(bus, base + 8)?;
            let flags = self.read_u16(bus, base + 12)?;
            let next = self.read_u16(bus, base + 14)?;
            match flags & DESC_F_WRITE {
                0 if !chain.writable.is_empty() => {
                    // Readable segments may not follow writable ones.
                    return Err(VirtioError::BadDescriptor(index));
                }
                0 => chain.readable.push((addr, len)),
                _ => chain.writable.push((addr, len)),
            }
            if flags & DESC_F_NEXT == 0 {
                return Ok(Some(chain));
            }
            index = next;
        }
        Err(VirtioError::ChainTooLong)
    }

    /// Return a serviced chain to the used ring.
    pub fn push_used(
        &mut self,
        bus: &mut SystemBus,
        head: u16,
        written: u32,
    ) -> Result<(), VirtioError> {
        let used_idx = self.read_u16(bus, self.device + 2)?;
        let slot = (used_idx as u32 % self.size) as u64;
        let base = self.device + 4 + 8 * slot;
        self.write_u32(bus, base, head as u32)?;
        self.write_u32(bus, base + 4, written)?;
        self.write_u16(bus, self.device + 2, used_idx.wrapping_add(1))?;
        Ok(())
    }

    fn read_u16(&self, bus: &mut SystemBus, address: u64) -> Result<u16, VirtioError> {
        Ok(bus
            .load(address, 1)
            .map_err(|_| VirtioError::BadQueueAddress(address))? as u16)
    }

    fn read_u32(&self, bus: &mut SystemBus, address: u64) -> Result<u32, VirtioError> {
        Ok(bus
            .load(address, 2)
            .map_err(|_| VirtioError::BadQueueAddress(address))? as u32)
    }

    fn read_u64(&self, bus: &mut SystemBus, address: u64) -> Result<u64, VirtioError> {
        bus.load(address, 3)
            .map_err(|_| VirtioError::BadQueueAddress(address))
    }

    fn write_u16(&self, bus: &mut SystemBus, address: u64, value: u16) -> Result<(), VirtioError> {
        bus.store(address, value as u64, 1)
            .map_err(|_| VirtioError::BadQueueAddress(address))
    }

    fn write_u32(&self, bus: &mut SystemBus, address: u64, value: u32) -> Result<(), VirtioError> {
        bus.store(address, value as u64, 2)
            .map_err(|_| VirtioError::BadQueueAddress(address))
    }
}

/// Read up to `max` bytes from a chain's buffer segments into a vector.
pub fn read_segments(
    bus: &mut SystemBus,
    segments: &[(u64, u32)],
    max: usize,
) -> Result<Vec<u8>, VirtioError> {
    let mut data = Vec::new();
    for &(addr, len) in segments {
        for i in 0..len as u64 {
            if data.len() >= max {
                return Ok(data);
            }
            let byte = bus
                .load(addr + i, 0)
                .map_err(|_| VirtioError::BadQueueAddress(addr + i))?;
            data.push(byte as u8);
        }
    }
    Ok(data)
}

/// Scatter `data` across a chain's buffer segments, returning the number of bytes written.
pub fn write_segments(
    bus: &mut SystemBus,
    segments: &[(u64, u32)],
    data: &[u8],
) -> Result<u32, VirtioError> {
    let mut written = 0usize;
    for &(addr, len) in segments {
        for i in 0..len as u64 {
            let Some(&byte) = data.get(written) else {
                return Ok(written as u32);
            };
            bus.store(addr + i, byte as u64, 0)
                .map_err(|_| VirtioError::BadQueueAddress(addr + i))?;
            written += 1;
        }
    }
    Ok(written as u32)
}

/// Fatal transport errors; the owning device latches FAILED on any of these.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum VirtioError {
    #[error("descriptor index {0} out of range")]
    BadDescriptor(u16),
    #[error("descriptor chain exceeds the queue size")]
    ChainTooLong,
    #[error("virtqueue memory at {0:#x} is not accessible")]
    BadQueueAddress(u64),
}
