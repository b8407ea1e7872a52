//! A generic virt-style board around a single core: SYSCON, CLINT, PLIC, UART, main memory,
//! and an optional 9P file-system export.

use crate::core::{Config as CoreConfig, Core};
use crate::devices::clint::Clint;
use crate::devices::memory::Memory;
use crate::devices::plic::Plic;
use crate::devices::rom::Rom;
use crate::devices::syscon::{PowerEvent, PowerSignal, Syscon};
use crate::devices::uart::Uart;
use crate::interrupt::{mip, IrqLine};
use crate::isa::compile::DecoderProgram;
use crate::isa::schema::InstructionSet;
use crate::memory_map::DEVICE_WINDOW;
use crate::plan9::fs::FileSystem;
use crate::plan9::NinePDevice;
use crate::system_bus::{DeviceHandle, SystemBus};
use crate::Xlen;
use log::info;
use std::sync::Arc;

pub const SYSCON_ADDRESS: u64 = 0x0100_0000;
pub const CLINT_ADDRESS: u64 = 0x0200_0000;
pub const PLIC_ADDRESS: u64 = 0x0C00_0000;
pub const FIRMWARE_ADDRESS: u64 = 0x1000;
pub const RAM_ADDRESS: u64 = 0x8000_0000;

/// PLIC source of the UART interrupt.
const UART_IRQ: u8 = 1;
/// PLIC source of the 9P device interrupt.
const NINE_P_IRQ: u8 = 2;

const FIRMWARE_SIZE: usize = 256;

#[derive(Debug)]
pub struct Config {
    pub xlen: Xlen,
    /// Size of main memory in bytes.
    pub ram_size: usize,
    /// Physical address the firmware stub jumps to.
    pub program_start: u64,
    /// Device-tree blob handed to the guest in `a1`. Producing one is the host's business.
    pub dtb: Vec<u8>,
    /// Optional 9P export: mount tag and backing file system.
    pub nine_p: Option<(String, Box<dyn FileSystem>)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            xlen: Xlen::Rv64,
            ram_size: 64 << 20,
            program_start: RAM_ADDRESS,
            dtb: Vec::new(),
            nine_p: None,
        }
    }
}

/// Event surfaced by [`Board::step`] that the host must act on.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StepEvent {
    /// The guest requested poweroff; stop running the board.
    Poweroff,
}

/// A single-core board with the default physical memory map.
#[derive(Debug)]
pub struct Board {
    core: Core,
    bus: SystemBus,
    power: Arc<PowerSignal>,
    ram: DeviceHandle,
    uart: DeviceHandle,
}

impl Board {
    /// Build the board, compiling the instruction-set decoder and wiring all devices.
    ///
    /// A malformed instruction description is a startup bug, not a guest condition, and panics.
    pub fn new(config: Config) -> Self {
        let set = InstructionSet::parse(crate::isa::RISCV_ISA).expect("instruction schema");
        let decoder = Arc::new(DecoderProgram::compile(&set).expect("decoder program"));
        let core = Core::new(
            decoder,
            CoreConfig {
                xlen: config.xlen,
                hart_id: 0,
                reset_vector: FIRMWARE_ADDRESS,
                mtime_address: CLINT_ADDRESS + 0xBFF8,
            },
        );
        let interrupts = Arc::clone(core.interrupts());

        let mut bus = SystemBus::new();
        let power = PowerSignal::new();
        bus.add_device(SYSCON_ADDRESS, Box::new(Syscon::new(Arc::clone(&power))))
            .unwrap();
        bus.add_device(
            CLINT_ADDRESS,
            Box::new(Clint::new(Arc::clone(&interrupts))),
        )
        .unwrap();
        let plic = Plic::new(
            IrqLine::new(Arc::clone(&interrupts), mip::MEIP),
            IrqLine::new(Arc::clone(&interrupts), mip::SEIP),
        );
        let uart_irq = plic.source(UART_IRQ);
        let nine_p_irq = plic.source(NINE_P_IRQ);
        bus.add_device(PLIC_ADDRESS, Box::new(plic)).unwrap();
        let uart = bus
            .allocate_device(DEVICE_WINDOW, Box::new(Uart::new(uart_irq)))
            .expect("device window exhausted");
        if let Some((mount_tag, file_system)) = config.nine_p {
            bus.allocate_device(
                DEVICE_WINDOW,
                Box::new(NinePDevice::new(&mount_tag, file_system, nine_p_irq)),
            )
            .expect("device window exhausted");
        }

        let mut ram_device = Memory::new(config.ram_size);
        // The DTB sits near the end of the first memory region, aligned down to 8 bytes.
        let dtb_offset = (config.ram_size - config.dtb.len()) & !7;
        ram_device.write(dtb_offset as u64, &config.dtb);
        let ram = bus.add_device(RAM_ADDRESS, Box::new(ram_device)).unwrap();

        let firmware = firmware_stub(
            config.xlen,
            RAM_ADDRESS + dtb_offset as u64,
            config.program_start,
        );
        bus.add_device(
            FIRMWARE_ADDRESS,
            Box::new(Rom::new(FIRMWARE_SIZE, &firmware).unwrap()),
        )
        .unwrap();

        info!(
            ram_size = config.ram_size, program_start = config.program_start;
            "Board assembled"
        );
        Self {
            core,
            bus,
            power,
            ram,
            uart,
        }
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut Core {
        &mut self.core
    }

    pub fn bus_mut(&mut self) -> &mut SystemBus {
        &mut self.bus
    }

    pub fn uart_mut(&mut self) -> &mut Uart {
        self.bus
            .device_mut(self.uart)
            .and_then(|device| device.downcast_mut::<Uart>())
            .unwrap()
    }

    /// Copy `image` into main memory at `offset`.
    pub fn load_image(&mut self, offset: u64, image: &[u8]) {
        let ram = self.bus.memory_mut(self.ram).unwrap();
        ram.write(offset, image);
    }

    /// Step the whole board: the core first, then every steppable device.
    ///
    /// SYSCON requests are converted here: a reset becomes a soft core reset back to the
    /// firmware entry, a poweroff is surfaced to the caller.
    pub fn step(&mut self, cycles: u64) -> Option<StepEvent> {
        self.core.step(&mut self.bus, cycles);
        self.bus.step_devices(cycles);
        match self.power.take() {
            Some(PowerEvent::Reset) => {
                info!("Board reset requested by guest");
                self.core.reset(false, FIRMWARE_ADDRESS);
                self.bus.reset_devices();
                None
            }
            Some(PowerEvent::Poweroff) => Some(StepEvent::Poweroff),
            None => None,
        }
    }
}

/// The firmware stub at the reset vector: four instructions loading the DTB address into `a1`
/// and jumping to the program start, followed by those two 64-bit data words.
fn firmware_stub(xlen: Xlen, dtb_address: u64, program_start: u64) -> Vec<u8> {
    // auipc t0, 0x0
    // l[dw] a1, 16(t0)
    // l[dw] t0, 24(t0)
    // jr    t0
    let load = |rd: u32, offset: u32| -> u32 {
        let funct3 = match xlen {
            Xlen::Rv32 => 0b010,
            Xlen::Rv64 => 0b011,
        };
        offset << 20 | 5 << 15 | funct3 << 12 | rd << 7 | 0b0000011
    };
    let mut stub = Vec::with_capacity(32);
    stub.extend_from_slice(&0x0000_0297u32.to_le_bytes());
    stub.extend_from_slice(&load(11, 16).to_le_bytes());
    stub.extend_from_slice(&load(5, 24).to_le_bytes());
    stub.extend_from_slice(&0x0002_8067u32.to_le_bytes());
    stub.extend_from_slice(&dtb_address.to_le_bytes());
    stub.extend_from_slice(&program_start.to_le_bytes());
    stub
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firmware_stub_layout() {
        let stub = firmware_stub(Xlen::Rv64, 0x87FF_F000, 0x8000_0000);
        assert_eq!(32, stub.len());
        // ld a1, 16(t0)
        assert_eq!(
            0x0102_B583,
            u32::from_le_bytes(stub[4..8].try_into().unwrap())
        );
        // jr t0
        assert_eq!(
            0x0002_8067,
            u32::from_le_bytes(stub[12..16].try_into().unwrap())
        );
        assert_eq!(
            0x87FF_F000,
            u64::from_le_bytes(stub[16..24].try_into().unwrap())
        );
        assert_eq!(
            0x8000_0000,
            u64::from_le_bytes(stub[24..32].try_into().unwrap())
        );
    }

    #[test]
    fn test_boot_runs_firmware_into_ram() {
        let mut board = Board::new(Config::default());
        // Park an infinite loop (j .) at the program start.
        board.load_image(0, &0x0000_006Fu32.to_le_bytes());
        assert_eq!(FIRMWARE_ADDRESS, board.core().registers().pc());
        board.step(16);
        // The stub ran: a1 holds the DTB address near the end of RAM, pc reached the loop.
        assert_eq!(RAM_ADDRESS, board.core().registers().pc());
        assert_eq!(RAM_ADDRESS + (64u64 << 20), board.core().registers().x(11));
    }
}
