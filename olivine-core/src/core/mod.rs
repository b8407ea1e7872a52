//! Provides a simulatable RV64 core implementation, with RV32 as a strict projection.

pub mod csr;
mod execute;
mod mmu;
mod status;
mod trap;

pub use mmu::{AccessType, MemoryError};

use crate::interrupt::{mip, HartInterrupts};
use crate::isa::compile::{DecoderProgram, Dispatch};
use crate::registers::Registers;
use crate::system_bus::{Device, DeviceHandle, SystemBus};
use crate::{PrivilegeLevel, RawPrivilegeLevel, Xlen};
use execute::Executor;
use log::{debug, trace};
use mmu::Tlb;
use status::Status;
use std::sync::Arc;
use thiserror::Error;
use trap::{Trap, VectorMode};

pub use csr::CsrSpecifier;

#[derive(Debug, Clone)]
pub struct Config {
    /// Base-ISA width of this core.
    pub xlen: Xlen,
    /// > The mhartid CSR is an MXLEN-bit read-only register containing the integer ID of the
    /// > hardware thread running the code. [...] Hart IDs must be unique within the execution
    /// > environment.
    pub hart_id: u64,
    /// Address to which the core's PC register is reset.
    pub reset_vector: u64,
    /// Physical memory address of the memory-mapped mtime register.
    /// The register should be 64 bits wide, and the address must support reads of 8 bytes.
    pub mtime_address: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            xlen: Xlen::Rv64,
            hart_id: 0,
            reset_vector: 0x1000,
            mtime_address: 0x0200_BFF8,
        }
    }
}

/// RISC-V core implementing the RV64 IMAC ISA with M/S/U privilege levels.
///
/// As we don't support hardware multithreading, every core always only has a single hart.
/// We therefore don't model RISC-V harts explicitly, but rather consider [`Core`] to be the
/// whole of a core with a single hart.
///
/// > A component is termed a core if it contains an independent instruction fetch unit.
/// > A RISC-V-compatible core might support multiple RISC-V-compatible hardware threads, or
/// > harts, through multithreading.
///
/// # Execution model
///
/// The core is driven cooperatively: [`step`](Self::step) runs until the cycle budget is spent
/// or the hart starts waiting for an interrupt. Interrupts may be raised from any thread through
/// the shared [`HartInterrupts`] word; everything else belongs to the emulator thread.
#[derive(Debug)]
pub struct Core {
    /// Configuration options for this core. See [`Config`].
    config: Config,
    /// The compiled dispatch program driving the interpreter.
    decoder: Arc<DecoderProgram>,
    /// General purpose registers: x and pc registers.
    registers: Registers,
    /// The core's current privilege mode.
    privilege: PrivilegeLevel,
    /// Status (mstatus, mstatush, sstatus) registers.
    status: Status,
    /// Trap handling registers of both privilege levels.
    trap: Trap,
    /// Interrupt-pending state, shared with interrupt-raising devices and threads.
    interrupts: Arc<HartInterrupts>,
    /// The mie CSR.
    mie: u64,
    /// The mcounteren CSR.
    mcounteren: u32,
    /// The scounteren CSR.
    scounteren: u32,
    /// The satp CSR.
    satp: u64,
    /// The mcycle CSR.
    mcycle: u64,
    /// The LR/SC reservation set: the reserved virtual address, if any.
    reservation: Option<u64>,
    tlb_fetch: Tlb,
    tlb_load: Tlb,
    tlb_store: Tlb,
}

impl Core {
    /// The mvendorid CSR is set to 0 to indicate this is a non-commercial implementation.
    pub const MVENDORID: u64 = 0;
    /// The marchid CSR is set to 0 to indicate it is not implemented.
    pub const MARCHID: u64 = 0;
    /// The mimpid CSR is set to 0 to indicate it is not implemented.
    pub const MIMPID: u64 = 0;

    pub fn new(decoder: Arc<DecoderProgram>, config: Config) -> Self {
        let reset_vector = config.reset_vector;
        Self {
            config,
            decoder,
            registers: Registers::new(reset_vector),
            privilege: PrivilegeLevel::Machine,
            status: Status::new(),
            trap: Trap::new(),
            interrupts: HartInterrupts::new(),
            mie: 0,
            mcounteren: 0,
            scounteren: 0,
            satp: 0,
            mcycle: 0,
            reservation: None,
            tlb_fetch: Tlb::new(),
            tlb_load: Tlb::new(),
            tlb_store: Tlb::new(),
        }
    }

    /// The misa CSR value: MXL per the configured width, extensions I, M, A, C, S, and U.
    ///
    /// > The misa CSR is a WARL read-write register reporting the ISA supported by the hart.
    pub fn misa(&self) -> u64 {
        let extensions = (1 << 0) | (1 << 2) | (1 << 8) | (1 << 12) | (1 << 18) | (1 << 20);
        match self.config.xlen {
            Xlen::Rv32 => (1 << 30) | extensions,
            Xlen::Rv64 => (2 << 62) | extensions,
        }
    }

    /// Provide a read-only view of this core's configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The shared interrupt lines of this hart. Clone the `Arc` to raise interrupts from
    /// devices or other threads.
    pub fn interrupts(&self) -> &Arc<HartInterrupts> {
        &self.interrupts
    }

    /// Provides immutable access to the general purpose (x) registers, and the pc register.
    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    /// Provides mutable access to the general purpose (x) registers, and the pc register.
    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    /// Returns the current privilege mode.
    ///
    /// Note that loads and stores execute at the
    /// [`effective_privilege`](Self::effective_privilege).
    pub fn privilege_mode(&self) -> PrivilegeLevel {
        self.privilege
    }

    pub fn mcycle(&self) -> u64 {
        self.mcycle
    }

    /// Force the core back to a reset state.
    ///
    /// A hard reset zeroes all architectural state; a soft reset (as requested through SYSCON)
    /// only rewrites the machine-level trap state, like a trap into a fresh M-mode would.
    pub fn reset(&mut self, hard: bool, pc: u64) {
        debug!(hard; "Resetting core");
        if hard {
            self.registers = Registers::new(pc);
            self.status = Status::new();
            self.trap = Trap::new();
            self.mie = 0;
            self.mcounteren = 0;
            self.scounteren = 0;
            self.satp = 0;
            self.mcycle = 0;
        } else {
            *self.registers.pc_mut() = pc;
            self.trap.write_mcause(0, u64::MAX);
        }
        self.privilege = PrivilegeLevel::Machine;
        self.status.set_mie(false);
        self.status.set_mprv(false);
        self.interrupts.set_waiting_for_interrupt(false);
        self.flush_tlb();
    }

    /// Run the core for up to `cycles` cycles.
    ///
    /// Returns early when the hart starts waiting for an interrupt; in that case the remaining
    /// budget is still accounted to `mcycle`, so guest time keeps moving while the hart idles.
    pub fn step(&mut self, bus: &mut SystemBus, cycles: u64) {
        if self.interrupts.waiting_for_interrupt() {
            self.mcycle = self.mcycle.wrapping_add(cycles);
            return;
        }
        let mut remaining = cycles;
        while remaining > 0 {
            if let Some(code) = self.pending_interrupt() {
                self.trap(TrapCause::Interrupt(code));
            }
            if self.interrupts.waiting_for_interrupt() {
                self.mcycle = self.mcycle.wrapping_add(remaining);
                return;
            }
            let executed = self.run_trace(bus, remaining);
            remaining = remaining.saturating_sub(executed.max(1));
        }
    }

    /// Execute instructions sequentially starting at the architectural PC, until the budget is
    /// spent, the fetch window is left, or a handler requests a trace exit.
    ///
    /// The PC is advanced in a local and only written back to the register file when the trace
    /// exits, so exception paths must (and do) patch it to the faulting instruction first.
    fn run_trace(&mut self, bus: &mut SystemBus, budget: u64) -> u64 {
        let mut pc = self.registers.pc();
        let mut executed = 0u64;

        let window = match self.fetch_window(bus, pc) {
            Ok(window) => window,
            Err(error) => {
                self.mcycle = self.mcycle.wrapping_add(1);
                let exception = fetch_error_to_exception(error, pc);
                self.raise_exception(exception);
                return 1;
            }
        };

        let decoder = Arc::clone(&self.decoder);
        loop {
            let word = match self.fetch_in_window(bus, pc, window) {
                Ok(word) => word,
                Err(error) => {
                    *self.registers.pc_mut() = pc;
                    self.mcycle = self.mcycle.wrapping_add(1);
                    self.raise_exception(error);
                    return executed + 1;
                }
            };
            self.mcycle = self.mcycle.wrapping_add(1);
            executed += 1;

            let dispatch = {
                let mut executor = Executor { core: self, bus };
                decoder.dispatch(word, pc, &mut executor)
            };
            match dispatch {
                Dispatch::Continue { size } => {
                    pc = self.config.xlen.truncate(pc.wrapping_add(size as u64));
                    let in_window = window.is_some_and(|(_, _, start, last)| {
                        pc >= start && pc <= last
                    });
                    if executed >= budget || !in_window {
                        *self.registers.pc_mut() = pc;
                        return executed;
                    }
                }
                Dispatch::Exit => {
                    // The handler wrote the PC through its update capability.
                    return executed;
                }
                Dispatch::ExitAdvance { size } => {
                    *self.registers.pc_mut() =
                        self.config.xlen.truncate(pc.wrapping_add(size as u64));
                    return executed;
                }
                Dispatch::Illegal => {
                    *self.registers.pc_mut() = pc;
                    self.raise_exception(Exception::IllegalInstruction(Some(word)));
                    return executed;
                }
                Dispatch::Fault(exception) => {
                    *self.registers.pc_mut() = pc;
                    let exception = match exception {
                        // Handlers don't see the raw word; patch it in for mtval.
                        Exception::IllegalInstruction(None) => {
                            Exception::IllegalInstruction(Some(word))
                        }
                        other => other,
                    };
                    self.raise_exception(exception);
                    return executed;
                }
            }
        }
    }

    /// The per-trace fetch window: `(device, delta, window_start, last_32bit_start)`, or `None`
    /// when the page is not backed by physical memory.
    fn fetch_window(
        &mut self,
        bus: &mut SystemBus,
        pc: u64,
    ) -> Result<Option<(DeviceHandle, u64, u64, u64)>, MemoryError> {
        Ok(self
            .map_fetch_page(bus, pc)?
            .map(|(device, delta, last)| (device, delta, pc & !mmu::PAGE_MASK, last)))
    }

    /// Fetch the instruction word at `pc`, preferring the direct window.
    ///
    /// A 32-bit instruction whose upper parcel lies beyond the window is stitched together from
    /// two fetches; the second one translates the following page and may fault on its own.
    fn fetch_in_window(
        &mut self,
        bus: &mut SystemBus,
        pc: u64,
        window: Option<(DeviceHandle, u64, u64, u64)>,
    ) -> Result<u32, Exception> {
        if let Some((device, delta, start, last)) = window {
            if pc >= start && pc <= last {
                if let Some(memory) = bus.memory_mut(device) {
                    if let Ok(word) = memory.load(pc.wrapping_add(delta), 2) {
                        return Ok(word as u32);
                    }
                }
            }
        }
        let lo = self
            .fetch_parcel(bus, pc)
            .map_err(|error| fetch_error_to_exception(error, pc))? as u32;
        if lo & 0b11 != 0b11 {
            return Ok(lo);
        }
        let hi = self
            .fetch_parcel(bus, pc.wrapping_add(2))
            .map_err(|error| fetch_error_to_exception(error, pc.wrapping_add(2)))?
            as u32;
        Ok(lo | hi << 16)
    }

    /// Execute a single raw instruction at the current PC, bypassing instruction fetch.
    ///
    /// Performs the same per-instruction work as [`step`](Self::step): `mcycle` advances, the
    /// PC moves (or a trap is taken), but no fetch happens and interrupts are not sampled.
    /// Useful for hosts injecting instructions (debug stubs, tests).
    pub fn step_with_raw(&mut self, bus: &mut SystemBus, word: u32) {
        let pc = self.registers.pc();
        self.mcycle = self.mcycle.wrapping_add(1);
        let decoder = Arc::clone(&self.decoder);
        let dispatch = {
            let mut executor = Executor { core: self, bus };
            decoder.dispatch(word, pc, &mut executor)
        };
        match dispatch {
            Dispatch::Continue { size } | Dispatch::ExitAdvance { size } => {
                *self.registers.pc_mut() = self.config.xlen.truncate(pc.wrapping_add(size as u64));
            }
            Dispatch::Exit => {}
            Dispatch::Illegal => {
                self.raise_exception(Exception::IllegalInstruction(Some(word)));
            }
            Dispatch::Fault(exception) => {
                let exception = match exception {
                    Exception::IllegalInstruction(None) => {
                        Exception::IllegalInstruction(Some(word))
                    }
                    other => other,
                };
                self.raise_exception(exception);
            }
        }
    }

    /// Force the core into a privilege mode, flushing cached translations.
    ///
    /// This is a host-level operation (tests, debug stubs); guests change privilege through
    /// traps and xRET only.
    pub fn set_privilege_mode(&mut self, privilege: PrivilegeLevel) {
        if self.privilege != privilege {
            self.privilege = privilege;
            self.flush_tlb();
        }
    }

    /// Returns the code of the highest-priority pending-and-enabled interrupt, if any.
    ///
    /// Machine-level interrupts beat supervisor-level ones; within each level the order is
    /// external, software, timer.
    fn pending_interrupt(&self) -> Option<u64> {
        let pending = self.interrupts.pending() & self.mie;
        if pending == 0 {
            return None;
        }
        let machine = pending & !self.trap.mideleg;
        let machine_enabled = self.privilege < PrivilegeLevel::Machine || self.status.mie();
        if machine_enabled && machine != 0 {
            for (bit, code) in [(mip::MEIP, 11), (mip::MSIP, 3), (mip::MTIP, 7)] {
                if machine & bit != 0 {
                    return Some(code);
                }
            }
        }
        let supervisor = pending & self.trap.mideleg;
        let supervisor_enabled = self.privilege < PrivilegeLevel::Supervisor
            || (self.privilege == PrivilegeLevel::Supervisor && self.status.sie());
        if supervisor_enabled && supervisor != 0 {
            for (bit, code) in [(mip::SEIP, 9), (mip::SSIP, 1), (mip::STIP, 5)] {
                if supervisor & bit != 0 {
                    return Some(code);
                }
            }
        }
        None
    }

    /// Raise an exception at the current architectural PC.
    pub fn raise_exception(&mut self, exception: Exception) {
        trace!("Raising exception {exception:?}");
        self.trap(TrapCause::Exception(exception));
    }

    fn trap(&mut self, cause: TrapCause) {
        self.mcycle = self.mcycle.wrapping_add(1);
        self.reservation = None;
        let pc = self.registers.pc();
        let privilege = self.privilege;
        // Determine if we should be delegating. Note that `delegate == true` does not
        // necessarily mean the trap will be handled in S-mode, since traps that occur while
        // running in M-mode are always handled in M-mode.
        let delegate = match cause {
            TrapCause::Exception(exception) => self.trap.medeleg >> exception.code() & 1 != 0,
            TrapCause::Interrupt(code) => self.trap.mideleg >> code & 1 != 0,
        };
        let trap_to_s_mode = privilege != PrivilegeLevel::Machine && delegate;
        let interrupt_flag = 1u64 << (self.config.xlen.bits() - 1);
        let (code, cause_value, tval) = match cause {
            TrapCause::Exception(exception) => {
                (exception.code(), exception.code(), exception.tval())
            }
            TrapCause::Interrupt(code) => (code, interrupt_flag | code, 0),
        };
        match trap_to_s_mode {
            true => {
                self.trap.write_scause(cause_value, u64::MAX);
                self.trap.write_sepc(pc, u64::MAX);
                self.trap.write_stval(tval, u64::MAX);
            }
            false => {
                self.trap.write_mcause(cause_value, u64::MAX);
                self.trap.write_mepc(pc, u64::MAX);
                self.trap.write_mtval(tval, u64::MAX);
            }
        }
        // Determine the trap handler address from the xtvec register and cause type.
        let tvec = match trap_to_s_mode {
            true => &self.trap.stvec,
            false => &self.trap.mtvec,
        };
        let handler = match (tvec.mode(), &cause) {
            (VectorMode::Vectored, TrapCause::Interrupt(_)) => tvec.base() + 4 * code,
            _ => tvec.base(),
        };
        *self.registers.pc_mut() = handler;
        // Update the interrupt stack in the status register.
        match trap_to_s_mode {
            true => {
                self.status.set_spie(self.status.sie());
                self.status.set_sie(false);
                self.status.set_spp(privilege);
                self.privilege = PrivilegeLevel::Supervisor;
            }
            false => {
                self.status.set_mpie(self.status.mie());
                self.status.set_mie(false);
                self.status.set_mpp(privilege);
                self.privilege = PrivilegeLevel::Machine;
            }
        }
        debug!(
            cause = cause_value, tval, handler, to_s_mode = trap_to_s_mode;
            "Trap taken"
        );
        if self.privilege != privilege {
            self.flush_tlb();
        }
    }

    /// Read the value of a CSR by its specifier.
    ///
    /// `privilege` indicates at what privilege level the read is performed. If the CSR that is
    /// being read requires a higher privilege level, a [`CsrError::Privileged`] is given.
    pub fn read_csr(
        &mut self,
        bus: &mut SystemBus,
        specifier: CsrSpecifier,
        privilege: PrivilegeLevel,
    ) -> Result<u64, CsrError> {
        self.check_csr_access(specifier, privilege)?;
        let xlen = self.config.xlen;
        let value = match specifier {
            //
            // Machine info registers
            //
            csr::MISA => self.misa(),
            csr::MVENDORID => Self::MVENDORID,
            csr::MARCHID => Self::MARCHID,
            csr::MIMPID => Self::MIMPID,
            csr::MHARTID => self.config.hart_id,
            //
            // Status registers
            //
            csr::MSTATUS => self.status.read_mstatus(xlen),
            csr::MSTATUSH if xlen == Xlen::Rv32 => self.status.read_mstatush() as u64,
            csr::SSTATUS => self.status.read_sstatus(xlen),
            //
            // Trap setup and handling
            //
            csr::MTVEC => self.trap.mtvec.read(),
            csr::MEDELEG => self.trap.medeleg,
            csr::MIDELEG => self.trap.mideleg,
            csr::MIE => self.mie,
            csr::MIP => self.interrupts.pending(),
            csr::MSCRATCH => self.trap.read_mscratch(),
            csr::MEPC => self.trap.read_mepc(),
            csr::MCAUSE => self.trap.read_mcause(),
            csr::MTVAL => self.trap.read_mtval(),
            csr::MCOUNTEREN => self.mcounteren as u64,
            csr::STVEC => self.trap.stvec.read(),
            csr::SIE => self.mie & self.trap.mideleg,
            csr::SIP => self.interrupts.pending() & self.trap.mideleg,
            csr::SSCRATCH => self.trap.read_sscratch(),
            csr::SEPC => self.trap.read_sepc(),
            csr::SCAUSE => self.trap.read_scause(),
            csr::STVAL => self.trap.read_stval(),
            csr::SCOUNTEREN => self.scounteren as u64,
            //
            // Address translation
            //
            csr::SATP => {
                self.check_satp_access(privilege)?;
                self.satp
            }
            //
            // Counters
            //
            csr::MCYCLE | csr::MINSTRET => self.mcycle,
            csr::MCYCLEH | csr::MINSTRETH if xlen == Xlen::Rv32 => self.mcycle >> 32,
            csr::CYCLE => self.counter_read(privilege, 0, self.mcycle)?,
            csr::TIME => {
                let mtime = self.read_mtime(bus);
                self.counter_read(privilege, 1, mtime)?
            }
            csr::INSTRET => self.counter_read(privilege, 2, self.mcycle)?,
            csr::CYCLEH if xlen == Xlen::Rv32 => self.counter_read(privilege, 0, self.mcycle)? >> 32,
            csr::TIMEH if xlen == Xlen::Rv32 => {
                let mtime = self.read_mtime(bus);
                self.counter_read(privilege, 1, mtime)? >> 32
            }
            csr::INSTRETH if xlen == Xlen::Rv32 => {
                self.counter_read(privilege, 2, self.mcycle)? >> 32
            }
            _ => return Err(CsrError::Unsupported(specifier)),
        };
        Ok(xlen.truncate(value))
    }

    /// Write a (masked) value to a CSR by its specifier.
    ///
    /// Returns `true` if the write invalidated cached translation state, in which case the
    /// running trace must exit.
    ///
    /// Only the bits of `value` for which the corresponding bit in `mask` is `1` will be
    /// written. However, even if `mask == 0`, write side-effects are still performed.
    pub fn write_csr(
        &mut self,
        specifier: CsrSpecifier,
        privilege: PrivilegeLevel,
        value: u64,
        mask: u64,
    ) -> Result<bool, CsrError> {
        self.check_csr_access(specifier, privilege)?;
        if csr::is_read_only(specifier) {
            return Err(CsrError::WriteToReadOnly);
        }
        let xlen = self.config.xlen;
        let (value, mask) = (xlen.truncate(value), xlen.truncate(mask));
        match specifier {
            // The machine info registers and misa are read-only WARL in this implementation.
            csr::MISA => {}
            //
            // Status registers
            //
            csr::MSTATUS => {
                let before = self.status.translation_bits();
                self.status.write_mstatus(value, mask);
                if self.status.translation_bits() != before {
                    self.flush_tlb();
                }
            }
            csr::MSTATUSH if xlen == Xlen::Rv32 => {
                let before = self.status.mpv();
                self.status.write_mstatush(value as u32, mask as u32);
                if self.status.mpv() != before {
                    self.flush_tlb();
                }
            }
            csr::SSTATUS => {
                let before = self.status.translation_bits();
                self.status.write_sstatus(value, mask, xlen);
                if self.status.translation_bits() != before {
                    self.flush_tlb();
                }
            }
            //
            // Trap setup and handling. mtvec and mcounteren are independent registers; a write
            // to one never touches the other.
            //
            csr::MTVEC => self.trap.mtvec.write(value, mask),
            csr::MEDELEG => {
                // Environment calls from M-mode cannot be delegated.
                let writable = 0xFFFF & !(1 << Exception::ENVIRONMENT_CALL_FROM_M_MODE);
                self.trap.medeleg = self.trap.medeleg & !(mask & writable) | value & mask & writable;
            }
            csr::MIDELEG => {
                let writable = mip::SUPERVISOR | mip::SSIP;
                self.trap.mideleg = self.trap.mideleg & !(mask & writable) | value & mask & writable;
            }
            csr::MIE => self.mie = self.mie & !(mask & mip::ALL) | value & mask & mip::ALL,
            csr::MIP => {
                // Only the supervisor bits are writable through the CSR interface; the machine
                // bits are wired to the CLINT and PLIC.
                self.interrupts
                    .write_masked(value, mask & (mip::SSIP | mip::STIP | mip::SEIP));
            }
            csr::MSCRATCH => self.trap.write_mscratch(value, mask),
            csr::MEPC => self.trap.write_mepc(value, mask),
            csr::MCAUSE => self.trap.write_mcause(value, mask),
            csr::MTVAL => self.trap.write_mtval(value, mask),
            csr::MCOUNTEREN => {
                self.mcounteren = (self.mcounteren & !(mask as u32)) | (value & mask) as u32;
            }
            csr::STVEC => self.trap.stvec.write(value, mask),
            csr::SIE => {
                let writable = mask & self.trap.mideleg;
                self.mie = self.mie & !writable | value & writable;
            }
            csr::SIP => {
                self.interrupts
                    .write_masked(value, mask & mip::SSIP & self.trap.mideleg);
            }
            csr::SSCRATCH => self.trap.write_sscratch(value, mask),
            csr::SEPC => self.trap.write_sepc(value, mask),
            csr::SCAUSE => self.trap.write_scause(value, mask),
            csr::STVAL => self.trap.write_stval(value, mask),
            csr::SCOUNTEREN => {
                self.scounteren = (self.scounteren & !(mask as u32)) | (value & mask) as u32;
            }
            //
            // Address translation
            //
            csr::SATP => {
                self.check_satp_access(privilege)?;
                let value = self.satp & !mask | value & mask;
                if self.satp_write_supported(value) {
                    self.satp = value;
                }
                self.flush_tlb();
                return Ok(true);
            }
            //
            // Counters
            //
            csr::MCYCLE | csr::MINSTRET => {
                self.mcycle = self.mcycle & !mask | value & mask;
            }
            csr::MCYCLEH | csr::MINSTRETH if xlen == Xlen::Rv32 => {
                let mask = mask << 32;
                self.mcycle = self.mcycle & !mask | value << 32 & mask;
            }
            _ => return Err(CsrError::Unsupported(specifier)),
        }
        Ok(false)
    }

    fn check_csr_access(
        &self,
        specifier: CsrSpecifier,
        privilege: PrivilegeLevel,
    ) -> Result<(), CsrError> {
        if !csr::is_valid(specifier) {
            return Err(CsrError::Unsupported(specifier));
        }
        let required_level = csr::required_privilege_level(specifier);
        if privilege < required_level {
            return Err(CsrError::Privileged {
                specifier,
                required_level,
                actual_level: privilege,
            });
        }
        Ok(())
    }

    /// Accesses to satp from S-mode trap when `mstatus.TVM` is set.
    fn check_satp_access(&self, privilege: PrivilegeLevel) -> Result<(), CsrError> {
        match privilege == PrivilegeLevel::Supervisor && self.status.tvm() {
            true => Err(CsrError::TrapVirtualMemory),
            false => Ok(()),
        }
    }

    /// Returns whether the mode field of a satp write is supported; unsupported modes leave the
    /// register unchanged (WARL).
    fn satp_write_supported(&self, value: u64) -> bool {
        match self.config.xlen {
            Xlen::Rv32 => true,
            Xlen::Rv64 => matches!(value >> 60, 0 | 8 | 9),
        }
    }

    fn counter_read(
        &self,
        privilege: PrivilegeLevel,
        bit: u32,
        value: u64,
    ) -> Result<u64, CsrError> {
        if privilege < PrivilegeLevel::Machine && self.mcounteren >> bit & 1 == 0 {
            return Err(CsrError::CounterNotEnabled);
        }
        if privilege == PrivilegeLevel::User && self.scounteren >> bit & 1 == 0 {
            return Err(CsrError::CounterNotEnabled);
        }
        Ok(value)
    }

    /// Performs a read of the memory-mapped mtime register.
    pub fn read_mtime(&self, bus: &mut SystemBus) -> u64 {
        bus.load(self.config.mtime_address, 3).unwrap_or(0)
    }
}

#[derive(Debug, Copy, Clone)]
enum TrapCause {
    Exception(Exception),
    Interrupt(u64),
}

/// Result of executing a single instruction. [`Ok`] if execution went normal, [`Err`] if an
/// exception occurred.
pub type ExecutionResult<T = ()> = Result<T, Exception>;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Exception {
    /// Instruction address is not aligned to a parcel boundary.
    ///
    /// The inner value is the faulting virtual address.
    InstructionAddressMisaligned(u64),
    /// The inner value is the faulting virtual address.
    InstructionAccessFault(u64),
    /// Attempt to execute an encoding no declaration matches, or a privileged operation from an
    /// insufficient privilege level.
    ///
    /// The inner value is the raw instruction (for mtval) if that data was available; handlers
    /// raise `None` and the trace loop patches in the word.
    IllegalInstruction(Option<u32>),
    Breakpoint(u64),
    /// The inner value is the faulting virtual address.
    LoadAddressMisaligned(u64),
    /// The inner value is the faulting virtual address.
    LoadAccessFault(u64),
    /// The inner value is the faulting virtual address.
    StoreOrAmoAddressMisaligned(u64),
    /// The inner value is the faulting virtual address.
    StoreOrAmoAccessFault(u64),
    EnvironmentCallFromUMode,
    EnvironmentCallFromSMode,
    EnvironmentCallFromMMode,
    /// The inner value is the faulting virtual address.
    InstructionPageFault(u64),
    /// The inner value is the faulting virtual address.
    LoadPageFault(u64),
    /// The inner value is the faulting virtual address.
    StoreOrAmoPageFault(u64),
}

impl Exception {
    pub const INSTRUCTION_ADDRESS_MISALIGNED: u64 = 0;
    pub const INSTRUCTION_ACCESS_FAULT: u64 = 1;
    pub const ILLEGAL_INSTRUCTION: u64 = 2;
    pub const BREAKPOINT: u64 = 3;
    pub const LOAD_ADDRESS_MISALIGNED: u64 = 4;
    pub const LOAD_ACCESS_FAULT: u64 = 5;
    pub const STORE_OR_AMO_ADDRESS_MISALIGNED: u64 = 6;
    pub const STORE_OR_AMO_ACCESS_FAULT: u64 = 7;
    pub const ENVIRONMENT_CALL_FROM_U_MODE: u64 = 8;
    pub const ENVIRONMENT_CALL_FROM_S_MODE: u64 = 9;
    pub const ENVIRONMENT_CALL_FROM_M_MODE: u64 = 11;
    pub const INSTRUCTION_PAGE_FAULT: u64 = 12;
    pub const LOAD_PAGE_FAULT: u64 = 13;
    pub const STORE_OR_AMO_PAGE_FAULT: u64 = 15;

    /// Returns the exception code (cause) for this exception.
    pub const fn code(&self) -> u64 {
        match self {
            Self::InstructionAddressMisaligned(_) => Self::INSTRUCTION_ADDRESS_MISALIGNED,
            Self::InstructionAccessFault(_) => Self::INSTRUCTION_ACCESS_FAULT,
            Self::IllegalInstruction(_) => Self::ILLEGAL_INSTRUCTION,
            Self::Breakpoint(_) => Self::BREAKPOINT,
            Self::LoadAddressMisaligned(_) => Self::LOAD_ADDRESS_MISALIGNED,
            Self::LoadAccessFault(_) => Self::LOAD_ACCESS_FAULT,
            Self::StoreOrAmoAddressMisaligned(_) => Self::STORE_OR_AMO_ADDRESS_MISALIGNED,
            Self::StoreOrAmoAccessFault(_) => Self::STORE_OR_AMO_ACCESS_FAULT,
            Self::EnvironmentCallFromUMode => Self::ENVIRONMENT_CALL_FROM_U_MODE,
            Self::EnvironmentCallFromSMode => Self::ENVIRONMENT_CALL_FROM_S_MODE,
            Self::EnvironmentCallFromMMode => Self::ENVIRONMENT_CALL_FROM_M_MODE,
            Self::InstructionPageFault(_) => Self::INSTRUCTION_PAGE_FAULT,
            Self::LoadPageFault(_) => Self::LOAD_PAGE_FAULT,
            Self::StoreOrAmoPageFault(_) => Self::STORE_OR_AMO_PAGE_FAULT,
        }
    }

    /// The value written to xtval when this exception is taken.
    pub const fn tval(&self) -> u64 {
        match self {
            Self::IllegalInstruction(Some(raw)) => *raw as u64,
            Self::IllegalInstruction(None) => 0,
            Self::Breakpoint(pc) => *pc,
            Self::InstructionAddressMisaligned(vaddr)
            | Self::InstructionAccessFault(vaddr)
            | Self::LoadAddressMisaligned(vaddr)
            | Self::LoadAccessFault(vaddr)
            | Self::StoreOrAmoAddressMisaligned(vaddr)
            | Self::StoreOrAmoAccessFault(vaddr)
            | Self::InstructionPageFault(vaddr)
            | Self::LoadPageFault(vaddr)
            | Self::StoreOrAmoPageFault(vaddr) => *vaddr,
            Self::EnvironmentCallFromUMode
            | Self::EnvironmentCallFromSMode
            | Self::EnvironmentCallFromMMode => 0,
        }
    }
}

fn fetch_error_to_exception(error: MemoryError, vaddr: u64) -> Exception {
    match error {
        MemoryError::MisalignedAccess => Exception::InstructionAddressMisaligned(vaddr),
        MemoryError::AccessFault => Exception::InstructionAccessFault(vaddr),
        MemoryError::PageFault => Exception::InstructionPageFault(vaddr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::memory::Memory;
    use crate::isa::schema::InstructionSet;

    const RAM_BASE: u64 = 0x8000_0000;

    // Page-table scaffolding used by the Sv39 tests: tables at fixed offsets into RAM.
    const ROOT_TABLE: u64 = RAM_BASE + 0x1000;
    const L1_TABLE: u64 = RAM_BASE + 0x2000;
    const L0_TABLE: u64 = RAM_BASE + 0x3000;
    const PAGE_0: u64 = RAM_BASE + 0x4000;
    const PAGE_1: u64 = RAM_BASE + 0x5000;

    const PTE_V: u64 = 1 << 0;
    const PTE_LEAF_U: u64 = 0xDF; // V|R|W|X|U|A|D
    const PTE_LEAF_S: u64 = 0xCF; // V|R|W|X|A|D

    fn decoder() -> Arc<DecoderProgram> {
        let set = InstructionSet::parse(crate::isa::RISCV_ISA).unwrap();
        Arc::new(DecoderProgram::compile(&set).unwrap())
    }

    fn machine(reset_vector: u64) -> (Core, SystemBus) {
        let core = Core::new(
            decoder(),
            Config {
                reset_vector,
                ..Config::default()
            },
        );
        let mut bus = SystemBus::new();
        bus.add_device(0x1000, Box::new(Memory::new(0x3000))).unwrap();
        bus.add_device(RAM_BASE, Box::new(Memory::new(0x2_0000)))
            .unwrap();
        (core, bus)
    }

    fn machine_with_sv39(leaf0: u64, leaf1: u64) -> (Core, SystemBus) {
        let (mut core, mut bus) = machine(RAM_BASE);
        bus.store(ROOT_TABLE, (L1_TABLE >> 12) << 10 | PTE_V, 3).unwrap();
        bus.store(L1_TABLE, (L0_TABLE >> 12) << 10 | PTE_V, 3).unwrap();
        bus.store(L0_TABLE, leaf0, 3).unwrap();
        bus.store(L0_TABLE + 8, leaf1, 3).unwrap();
        let satp = 8 << 60 | (ROOT_TABLE >> 12);
        core.write_csr(csr::SATP, PrivilegeLevel::Machine, satp, u64::MAX)
            .unwrap();
        (core, bus)
    }

    fn mcause(core: &mut Core, bus: &mut SystemBus) -> u64 {
        core.read_csr(bus, csr::MCAUSE, PrivilegeLevel::Machine)
            .unwrap()
    }

    #[test]
    fn test_addi_retires() {
        let (mut core, mut bus) = machine(0x1000);
        // ADDI x1, x0, 5
        bus.store(0x1000, 0x0050_0093, 2).unwrap();
        core.step(&mut bus, 1);
        assert_eq!(5, core.registers().x(1));
        assert_eq!(0x1004, core.registers().pc());
        assert_eq!(1, core.mcycle());
    }

    #[test]
    fn test_illegal_instruction_traps_to_machine() {
        let (mut core, mut bus) = machine(RAM_BASE);
        core.write_csr(csr::MTVEC, PrivilegeLevel::Machine, 0x8000_0100, u64::MAX)
            .unwrap();
        // The all-zero word at the reset vector decodes as the canonical illegal instruction.
        core.step(&mut bus, 1);
        assert_eq!(0x8000_0100, core.registers().pc());
        assert_eq!(2, mcause(&mut core, &mut bus));
        assert_eq!(
            0,
            core.read_csr(&mut bus, csr::MTVAL, PrivilegeLevel::Machine)
                .unwrap()
        );
        assert_eq!(
            RAM_BASE,
            core.read_csr(&mut bus, csr::MEPC, PrivilegeLevel::Machine)
                .unwrap()
        );
        assert_eq!(PrivilegeLevel::Machine, core.privilege_mode());
    }

    #[test]
    fn test_load_page_fault_delegated_to_supervisor() {
        let (mut core, mut bus) = machine(RAM_BASE);
        // Sv39 with the root page table in unmapped physical memory.
        core.write_csr(
            csr::SATP,
            PrivilegeLevel::Machine,
            8 << 60 | 0x4_0000,
            u64::MAX,
        )
        .unwrap();
        core.write_csr(
            csr::MEDELEG,
            PrivilegeLevel::Machine,
            1 << Exception::LOAD_PAGE_FAULT,
            u64::MAX,
        )
        .unwrap();
        core.write_csr(csr::STVEC, PrivilegeLevel::Machine, 0x8000_0200, u64::MAX)
            .unwrap();
        core.registers_mut().set_x(1, 0x1000);
        core.set_privilege_mode(PrivilegeLevel::User);
        // LW x2, 0(x1)
        core.step_with_raw(&mut bus, 0x0000_A103);
        assert_eq!(PrivilegeLevel::Supervisor, core.privilege_mode());
        assert_eq!(0x8000_0200, core.registers().pc());
        assert_eq!(
            13,
            core.read_csr(&mut bus, csr::SCAUSE, PrivilegeLevel::Machine)
                .unwrap()
        );
        assert_eq!(
            0x1000,
            core.read_csr(&mut bus, csr::STVAL, PrivilegeLevel::Machine)
                .unwrap()
        );
        assert_eq!(
            RAM_BASE,
            core.read_csr(&mut bus, csr::SEPC, PrivilegeLevel::Machine)
                .unwrap()
        );
    }

    #[test]
    fn test_lr_sc_success() {
        let (mut core, mut bus) = machine(RAM_BASE);
        core.registers_mut().set_x(10, RAM_BASE + 0x1000);
        core.registers_mut().set_x(7, 0xDEAD_BEEF);
        // LR.W t0, (a0); SC.W t1, t2, (a0)
        core.step_with_raw(&mut bus, 0x1005_22AF);
        core.step_with_raw(&mut bus, 0x1875_232F);
        assert_eq!(0, core.registers().x(6));
        assert_eq!(0xDEAD_BEEF, bus.load(RAM_BASE + 0x1000, 2).unwrap());
    }

    #[test]
    fn test_sc_without_reservation_fails() {
        let (mut core, mut bus) = machine(RAM_BASE);
        core.registers_mut().set_x(10, RAM_BASE + 0x1000);
        core.registers_mut().set_x(7, 0xDEAD_BEEF);
        core.step_with_raw(&mut bus, 0x1875_232F);
        assert_eq!(1, core.registers().x(6));
        assert_eq!(0, bus.load(RAM_BASE + 0x1000, 2).unwrap());
    }

    #[test]
    fn test_sc_fails_after_intervening_store() {
        let (mut core, mut bus) = machine(RAM_BASE);
        core.registers_mut().set_x(10, RAM_BASE + 0x1000);
        core.registers_mut().set_x(7, 42);
        core.step_with_raw(&mut bus, 0x1005_22AF); // LR.W t0, (a0)
        core.step_with_raw(&mut bus, 0x0075_2023); // SW t2, 0(a0)
        core.step_with_raw(&mut bus, 0x1875_232F); // SC.W t1, t2, (a0)
        assert_eq!(1, core.registers().x(6));
    }

    #[test]
    fn test_sc_with_different_address_fails() {
        let (mut core, mut bus) = machine(RAM_BASE);
        core.registers_mut().set_x(10, RAM_BASE + 0x1000);
        core.step_with_raw(&mut bus, 0x1005_22AF); // LR.W t0, (a0)
        core.registers_mut().set_x(10, RAM_BASE + 0x2000);
        core.registers_mut().set_x(7, 42);
        core.step_with_raw(&mut bus, 0x1875_232F); // SC.W t1, t2, (a0)
        assert_eq!(1, core.registers().x(6));
        assert_eq!(0, bus.load(RAM_BASE + 0x2000, 2).unwrap());
    }

    #[test]
    fn test_wfi_waits_and_timer_interrupt_wakes() {
        let (mut core, mut bus) = machine(RAM_BASE);
        core.write_csr(csr::MIE, PrivilegeLevel::Machine, mip::MTIP, u64::MAX)
            .unwrap();
        core.write_csr(csr::MSTATUS, PrivilegeLevel::Machine, 1 << 3, 1 << 3)
            .unwrap();
        // Vectored mtvec: the timer handler lands at base + 4 * 7.
        core.write_csr(
            csr::MTVEC,
            PrivilegeLevel::Machine,
            0x8000_0100 | 0b01,
            u64::MAX,
        )
        .unwrap();
        // Park an infinite loop at the timer vector so the budget drains there.
        bus.store(0x8000_0100 + 4 * 7, 0x0000_006F, 2).unwrap();

        core.step_with_raw(&mut bus, 0x1050_0073); // WFI
        assert!(core.interrupts().waiting_for_interrupt());
        let wfi_next = core.registers().pc();

        // A full step while waiting just burns the budget.
        let before = core.mcycle();
        core.step(&mut bus, 100);
        assert_eq!(before + 100, core.mcycle());

        core.interrupts().raise(mip::MTIP);
        assert!(!core.interrupts().waiting_for_interrupt());
        core.step(&mut bus, 1);
        assert_eq!(0x8000_0100 + 4 * 7, core.registers().pc());
        assert_eq!(1 << 63 | 7, mcause(&mut core, &mut bus));
        assert_eq!(
            wfi_next,
            core.read_csr(&mut bus, csr::MEPC, PrivilegeLevel::Machine)
                .unwrap()
        );
    }

    #[test]
    fn test_ecall_cause_per_privilege() {
        for (privilege, cause) in [
            (PrivilegeLevel::User, 8),
            (PrivilegeLevel::Supervisor, 9),
            (PrivilegeLevel::Machine, 11),
        ] {
            let (mut core, mut bus) = machine(RAM_BASE);
            core.set_privilege_mode(privilege);
            core.step_with_raw(&mut bus, 0x0000_0073);
            assert_eq!(cause, mcause(&mut core, &mut bus));
        }
    }

    #[test]
    fn test_misaligned_load() {
        let (mut core, mut bus) = machine(RAM_BASE);
        core.registers_mut().set_x(1, RAM_BASE + 0x1001);
        core.step_with_raw(&mut bus, 0x0000_A103); // LW x2, 0(x1)
        assert_eq!(Exception::LOAD_ADDRESS_MISALIGNED, mcause(&mut core, &mut bus));
        assert_eq!(
            RAM_BASE + 0x1001,
            core.read_csr(&mut bus, csr::MTVAL, PrivilegeLevel::Machine)
                .unwrap()
        );
    }

    #[test]
    fn test_write_to_read_only_csr_is_illegal() {
        let (mut core, mut bus) = machine(RAM_BASE);
        // CSRRW x1, mvendorid, x0
        core.step_with_raw(&mut bus, 0xF110_10F3);
        assert_eq!(Exception::ILLEGAL_INSTRUCTION, mcause(&mut core, &mut bus));
    }

    #[test]
    fn test_x0_stays_zero() {
        let (mut core, mut bus) = machine(RAM_BASE);
        // ADDI x0, x0, 5
        core.step_with_raw(&mut bus, 0x0050_0013);
        assert_eq!(0, core.registers().x(0));
    }

    #[test]
    fn test_mret_restores_privilege() {
        let (mut core, mut bus) = machine(RAM_BASE);
        core.write_csr(csr::MEPC, PrivilegeLevel::Machine, 0x8000_0010, u64::MAX)
            .unwrap();
        // MPP = Supervisor
        core.write_csr(csr::MSTATUS, PrivilegeLevel::Machine, 1 << 11, 0b11 << 11)
            .unwrap();
        core.step_with_raw(&mut bus, 0x3020_0073); // MRET
        assert_eq!(PrivilegeLevel::Supervisor, core.privilege_mode());
        assert_eq!(0x8000_0010, core.registers().pc());
    }

    #[test]
    fn test_wfi_illegal_in_user_mode() {
        let (mut core, mut bus) = machine(RAM_BASE);
        core.set_privilege_mode(PrivilegeLevel::User);
        core.step_with_raw(&mut bus, 0x1050_0073);
        assert_eq!(Exception::ILLEGAL_INSTRUCTION, mcause(&mut core, &mut bus));
    }

    #[test]
    fn test_cross_page_fetch_succeeds_when_both_pages_map() {
        let (mut core, mut bus) = machine_with_sv39(
            (PAGE_0 >> 12) << 10 | PTE_LEAF_U,
            (PAGE_1 >> 12) << 10 | PTE_LEAF_U,
        );
        // ADDI x1, x0, 5 straddling the first page boundary.
        bus.store(PAGE_0 + 0xFFE, 0x0093, 1).unwrap();
        bus.store(PAGE_1, 0x0050, 1).unwrap();
        core.set_privilege_mode(PrivilegeLevel::User);
        *core.registers_mut().pc_mut() = 0xFFE;
        core.step(&mut bus, 1);
        assert_eq!(5, core.registers().x(1));
        assert_eq!(0x1002, core.registers().pc());
    }

    #[test]
    fn test_cross_page_fetch_faults_on_second_page() {
        let (mut core, mut bus) = machine_with_sv39((PAGE_0 >> 12) << 10 | PTE_LEAF_U, 0);
        core.write_csr(csr::MTVEC, PrivilegeLevel::Machine, 0x8000_0300, u64::MAX)
            .unwrap();
        bus.store(PAGE_0 + 0xFFE, 0x0093, 1).unwrap();
        core.set_privilege_mode(PrivilegeLevel::User);
        *core.registers_mut().pc_mut() = 0xFFE;
        core.step(&mut bus, 1);
        assert_eq!(Exception::INSTRUCTION_PAGE_FAULT, mcause(&mut core, &mut bus));
        // The faulting half lives on the second page.
        assert_eq!(
            0x1000,
            core.read_csr(&mut bus, csr::MTVAL, PrivilegeLevel::Machine)
                .unwrap()
        );
        assert_eq!(
            0xFFE,
            core.read_csr(&mut bus, csr::MEPC, PrivilegeLevel::Machine)
                .unwrap()
        );
    }

    #[test]
    fn test_sfence_vma_flushes_stale_translations() {
        let (mut core, mut bus) = machine_with_sv39((PAGE_0 >> 12) << 10 | PTE_LEAF_S, 0);
        bus.store(PAGE_0 + 8, 0x1111, 2).unwrap();
        bus.store(PAGE_1 + 8, 0x2222, 2).unwrap();
        core.set_privilege_mode(PrivilegeLevel::Supervisor);
        core.registers_mut().set_x(1, 8);
        core.step_with_raw(&mut bus, 0x0000_A103); // LW x2, 0(x1)
        assert_eq!(0x1111, core.registers().x(2));
        // Repoint the leaf PTE; the cached translation still serves the old page.
        bus.store(L0_TABLE, (PAGE_1 >> 12) << 10 | PTE_LEAF_S, 3)
            .unwrap();
        core.step_with_raw(&mut bus, 0x0000_A103);
        assert_eq!(0x1111, core.registers().x(2));
        // SFENCE.VMA drops the cached translation.
        core.step_with_raw(&mut bus, 0x1200_0073);
        core.step_with_raw(&mut bus, 0x0000_A103);
        assert_eq!(0x2222, core.registers().x(2));
    }

    #[test]
    fn test_supervisor_cannot_touch_user_page_without_sum() {
        let (mut core, mut bus) = machine_with_sv39((PAGE_0 >> 12) << 10 | PTE_LEAF_U, 0);
        core.write_csr(csr::MTVEC, PrivilegeLevel::Machine, 0x8000_0300, u64::MAX)
            .unwrap();
        core.set_privilege_mode(PrivilegeLevel::Supervisor);
        core.registers_mut().set_x(1, 8);
        core.step_with_raw(&mut bus, 0x0000_A103); // LW x2, 0(x1)
        assert_eq!(Exception::LOAD_PAGE_FAULT, mcause(&mut core, &mut bus));
        // With SUM set the same load goes through.
        let (mut core, mut bus) = machine_with_sv39((PAGE_0 >> 12) << 10 | PTE_LEAF_U, 0);
        core.write_csr(csr::MSTATUS, PrivilegeLevel::Machine, 1 << 18, 1 << 18)
            .unwrap();
        core.set_privilege_mode(PrivilegeLevel::Supervisor);
        core.registers_mut().set_x(1, 8);
        bus.store(PAGE_0 + 8, 0x77, 2).unwrap();
        core.step_with_raw(&mut bus, 0x0000_A103);
        assert_eq!(0x77, core.registers().x(2));
    }

    #[test]
    fn test_compressed_and_full_width_mix() {
        let (mut core, mut bus) = machine(0x1000);
        // C.LI x8, 3; C.ADDI x8, 1; ADDI x9, x8, 2
        bus.store(0x1000, 0x440D, 1).unwrap();
        bus.store(0x1002, 0x0405, 1).unwrap();
        bus.store(0x1004, 0x0024_0493, 2).unwrap();
        core.step(&mut bus, 3);
        assert_eq!(4, core.registers().x(8));
        assert_eq!(6, core.registers().x(9));
        assert_eq!(0x1008, core.registers().pc());
        assert_eq!(3, core.mcycle());
    }
}

/// Errors that can occur when attempting to access a CSR.
#[derive(Error, Debug)]
pub enum CsrError {
    #[error("unsupported CSR: {0:#05X}")]
    Unsupported(CsrSpecifier),
    /// Attempt to access a CSR that requires a higher privilege level.
    #[error(
        "cannot access specifier {specifier:#05X} from privilege level {actual_level}, \
             since it requires privilege level {required_level}"
    )]
    Privileged {
        /// The CSR for which access was requested.
        specifier: CsrSpecifier,
        /// The minimum required privilege level to access that CSR.
        required_level: RawPrivilegeLevel,
        /// The actual privilege level from which the access was performed.
        actual_level: PrivilegeLevel,
    },
    /// Attempt to write to a read-only register.
    #[error("writing to read-only CSR is invalid")]
    WriteToReadOnly,
    /// Counter access without the corresponding counter-enable bit.
    #[error("counter is not enabled for this privilege level")]
    CounterNotEnabled,
    /// satp access from S-mode while `mstatus.TVM` is set.
    #[error("satp access trapped by TVM")]
    TrapVirtualMemory,
}
