//! Instruction handlers: the interpreter side of the compiled dispatch program.
//!
//! Handlers receive the program counter as an argument and never read the architectural PC
//! register. PC writes go through [`Executor::jump`], and the fact that a jump happened is
//! reported back as [`Progress::Jumped`]; this replaces the original design's build-time scan
//! for handlers touching the PC field.

use super::mmu::MemoryError;
use super::{Core, Exception, ExecutionResult};
use crate::isa::compile::{DispatchHost, Progress};
use crate::isa::handlers::{AmoOp, CsrOp, Handler};
use crate::system_bus::SystemBus;
use crate::{PrivilegeLevel, Xlen};

pub(super) struct Executor<'a> {
    pub core: &'a mut Core,
    pub bus: &'a mut SystemBus,
}

impl DispatchHost for Executor<'_> {
    type Fault = Exception;

    fn execute(
        &mut self,
        handler: Handler,
        args: &[u64],
        pc: u64,
        _size: u32,
    ) -> Result<Progress, Exception> {
        let a = |i: usize| args[i];
        match handler {
            Handler::Lui => self.op(a(0), imm(a(1)) as u64),
            Handler::Auipc => self.op(a(0), a(2).wrapping_add(imm(a(1)) as u64)),
            Handler::Jal => {
                self.set_x(a(0), a(2).wrapping_add(a(3)));
                self.jump(a(2).wrapping_add(imm(a(1)) as u64))
            }
            Handler::Jalr => {
                let target = self.x(a(1)).wrapping_add(imm(a(2)) as u64) & !0b1;
                self.set_x(a(0), a(3).wrapping_add(a(4)));
                self.jump(target)
            }
            Handler::Beq => self.branch(self.x(a(0)) == self.x(a(1)), a(3), a(2)),
            Handler::Bne => self.branch(self.x(a(0)) != self.x(a(1)), a(3), a(2)),
            Handler::Blt => {
                self.branch((self.x(a(0)) as i64) < self.x(a(1)) as i64, a(3), a(2))
            }
            Handler::Bge => {
                self.branch(self.x(a(0)) as i64 >= self.x(a(1)) as i64, a(3), a(2))
            }
            Handler::Bltu => self.branch(self.x(a(0)) < self.x(a(1)), a(3), a(2)),
            Handler::Bgeu => self.branch(self.x(a(0)) >= self.x(a(1)), a(3), a(2)),
            Handler::Lb => {
                let value = self.load(a(1), a(2), 0)? as i8 as i64 as u64;
                self.op(a(0), value)
            }
            Handler::Lh => {
                let value = self.load(a(1), a(2), 1)? as i16 as i64 as u64;
                self.op(a(0), value)
            }
            Handler::Lw => {
                let value = self.load(a(1), a(2), 2)? as i32 as i64 as u64;
                self.op(a(0), value)
            }
            Handler::Lbu => {
                let value = self.load(a(1), a(2), 0)?;
                self.op(a(0), value)
            }
            Handler::Lhu => {
                let value = self.load(a(1), a(2), 1)?;
                self.op(a(0), value)
            }
            Handler::Lwu => {
                self.require_rv64()?;
                let value = self.load(a(1), a(2), 2)?;
                self.op(a(0), value)
            }
            Handler::Ld => {
                self.require_rv64()?;
                let value = self.load(a(1), a(2), 3)?;
                self.op(a(0), value)
            }
            Handler::Sb => self.store(a(1), a(2), self.x(a(0)), 0),
            Handler::Sh => self.store(a(1), a(2), self.x(a(0)), 1),
            Handler::Sw => self.store(a(1), a(2), self.x(a(0)), 2),
            Handler::Sd => {
                self.require_rv64()?;
                self.store(a(1), a(2), self.x(a(0)), 3)
            }
            Handler::Addi => self.op(a(0), self.x(a(1)).wrapping_add(imm(a(2)) as u64)),
            Handler::Slti => self.op(a(0), ((self.x(a(1)) as i64) < imm(a(2))) as u64),
            Handler::Sltiu => self.op(a(0), (self.x(a(1)) < imm(a(2)) as u64) as u64),
            Handler::Xori => self.op(a(0), self.x(a(1)) ^ imm(a(2)) as u64),
            Handler::Ori => self.op(a(0), self.x(a(1)) | imm(a(2)) as u64),
            Handler::Andi => self.op(a(0), self.x(a(1)) & imm(a(2)) as u64),
            Handler::Slli => {
                let shamt = self.shamt(a(2))?;
                let value = match self.xlen() {
                    Xlen::Rv32 => ((self.x(a(1)) as u32) << shamt) as u64,
                    Xlen::Rv64 => self.x(a(1)) << shamt,
                };
                self.op(a(0), value)
            }
            Handler::Srli => {
                let shamt = self.shamt(a(2))?;
                let value = match self.xlen() {
                    Xlen::Rv32 => (self.x(a(1)) as u32 >> shamt) as u64,
                    Xlen::Rv64 => self.x(a(1)) >> shamt,
                };
                self.op(a(0), value)
            }
            Handler::Srai => {
                let shamt = self.shamt(a(2))?;
                let value = match self.xlen() {
                    Xlen::Rv32 => (self.x(a(1)) as i32 >> shamt) as u64,
                    Xlen::Rv64 => (self.x(a(1)) as i64 >> shamt) as u64,
                };
                self.op(a(0), value)
            }
            Handler::Add => self.op(a(0), self.x(a(1)).wrapping_add(self.x(a(2)))),
            Handler::Sub => self.op(a(0), self.x(a(1)).wrapping_sub(self.x(a(2)))),
            Handler::Sll => {
                let shamt = self.x(a(2)) & self.shamt_mask();
                let value = match self.xlen() {
                    Xlen::Rv32 => ((self.x(a(1)) as u32) << shamt) as u64,
                    Xlen::Rv64 => self.x(a(1)) << shamt,
                };
                self.op(a(0), value)
            }
            Handler::Slt => self.op(a(0), ((self.x(a(1)) as i64) < self.x(a(2)) as i64) as u64),
            Handler::Sltu => self.op(a(0), (self.x(a(1)) < self.x(a(2))) as u64),
            Handler::Xor => self.op(a(0), self.x(a(1)) ^ self.x(a(2))),
            Handler::Srl => {
                let shamt = self.x(a(2)) & self.shamt_mask();
                let value = match self.xlen() {
                    Xlen::Rv32 => (self.x(a(1)) as u32 >> shamt) as u64,
                    Xlen::Rv64 => self.x(a(1)) >> shamt,
                };
                self.op(a(0), value)
            }
            Handler::Sra => {
                let shamt = self.x(a(2)) & self.shamt_mask();
                let value = match self.xlen() {
                    Xlen::Rv32 => (self.x(a(1)) as i32 >> shamt) as u64,
                    Xlen::Rv64 => (self.x(a(1)) as i64 >> shamt) as u64,
                };
                self.op(a(0), value)
            }
            Handler::Or => self.op(a(0), self.x(a(1)) | self.x(a(2))),
            Handler::And => self.op(a(0), self.x(a(1)) & self.x(a(2))),
            // Memory accesses are globally ordered by the emulator thread; fences are no-ops.
            Handler::Fence | Handler::FenceI => Ok(Progress::Next),
            Handler::Ecall => Err(match self.core.privilege {
                PrivilegeLevel::User => Exception::EnvironmentCallFromUMode,
                PrivilegeLevel::Supervisor => Exception::EnvironmentCallFromSMode,
                PrivilegeLevel::Machine => Exception::EnvironmentCallFromMMode,
            }),
            Handler::Ebreak => Err(Exception::Breakpoint(pc)),
            Handler::Addiw => {
                self.require_rv64()?;
                let value = (self.x(a(1)) as i32).wrapping_add(imm(a(2)) as i32);
                self.op(a(0), value as i64 as u64)
            }
            Handler::Slliw => {
                self.require_rv64()?;
                self.op(a(0), ((self.x(a(1)) as u32) << a(2)) as i32 as i64 as u64)
            }
            Handler::Srliw => {
                self.require_rv64()?;
                self.op(a(0), (self.x(a(1)) as u32 >> a(2)) as i32 as i64 as u64)
            }
            Handler::Sraiw => {
                self.require_rv64()?;
                self.op(a(0), (self.x(a(1)) as i32 >> a(2)) as i64 as u64)
            }
            Handler::Addw => {
                self.require_rv64()?;
                let value = (self.x(a(1)) as i32).wrapping_add(self.x(a(2)) as i32);
                self.op(a(0), value as i64 as u64)
            }
            Handler::Subw => {
                self.require_rv64()?;
                let value = (self.x(a(1)) as i32).wrapping_sub(self.x(a(2)) as i32);
                self.op(a(0), value as i64 as u64)
            }
            Handler::Sllw => {
                self.require_rv64()?;
                let shamt = self.x(a(2)) & 0x1F;
                self.op(a(0), ((self.x(a(1)) as u32) << shamt) as i32 as i64 as u64)
            }
            Handler::Srlw => {
                self.require_rv64()?;
                let shamt = self.x(a(2)) & 0x1F;
                self.op(a(0), (self.x(a(1)) as u32 >> shamt) as i32 as i64 as u64)
            }
            Handler::Sraw => {
                self.require_rv64()?;
                let shamt = self.x(a(2)) & 0x1F;
                self.op(a(0), (self.x(a(1)) as i32 >> shamt) as i64 as u64)
            }
            Handler::Mul => self.op(a(0), self.x(a(1)).wrapping_mul(self.x(a(2)))),
            Handler::Mulh => {
                let value = match self.xlen() {
                    Xlen::Rv32 => {
                        ((self.x(a(1)) as i32 as i64 * self.x(a(2)) as i32 as i64) >> 32) as u64
                    }
                    Xlen::Rv64 => {
                        ((self.x(a(1)) as i64 as i128 * self.x(a(2)) as i64 as i128) >> 64) as u64
                    }
                };
                self.op(a(0), value)
            }
            Handler::Mulhsu => {
                let value = match self.xlen() {
                    Xlen::Rv32 => {
                        ((self.x(a(1)) as i32 as i64 * self.x(a(2)) as u32 as i64) >> 32) as u64
                    }
                    Xlen::Rv64 => {
                        ((self.x(a(1)) as i64 as i128 * self.x(a(2)) as u128 as i128) >> 64) as u64
                    }
                };
                self.op(a(0), value)
            }
            Handler::Mulhu => {
                let value = match self.xlen() {
                    Xlen::Rv32 => {
                        ((self.x(a(1)) as u32 as u64 * self.x(a(2)) as u32 as u64) >> 32) as u64
                    }
                    Xlen::Rv64 => ((self.x(a(1)) as u128 * self.x(a(2)) as u128) >> 64) as u64,
                };
                self.op(a(0), value)
            }
            Handler::Div => {
                let value = match self.xlen() {
                    Xlen::Rv32 => div_signed(self.x(a(1)) as i32 as i64, self.x(a(2)) as i32 as i64),
                    Xlen::Rv64 => div_signed(self.x(a(1)) as i64, self.x(a(2)) as i64),
                };
                self.op(a(0), value as u64)
            }
            Handler::Divu => {
                let (n, d) = (self.x(a(1)), self.x(a(2)));
                let value = match self.xlen() {
                    Xlen::Rv32 => div_unsigned(n as u32 as u64, d as u32 as u64),
                    Xlen::Rv64 => div_unsigned(n, d),
                };
                self.op(a(0), value)
            }
            Handler::Rem => {
                let value = match self.xlen() {
                    Xlen::Rv32 => rem_signed(self.x(a(1)) as i32 as i64, self.x(a(2)) as i32 as i64),
                    Xlen::Rv64 => rem_signed(self.x(a(1)) as i64, self.x(a(2)) as i64),
                };
                self.op(a(0), value as u64)
            }
            Handler::Remu => {
                let (n, d) = (self.x(a(1)), self.x(a(2)));
                let value = match self.xlen() {
                    Xlen::Rv32 => rem_unsigned(n as u32 as u64, d as u32 as u64),
                    Xlen::Rv64 => rem_unsigned(n, d),
                };
                self.op(a(0), value)
            }
            Handler::Mulw => {
                self.require_rv64()?;
                let value = (self.x(a(1)) as i32).wrapping_mul(self.x(a(2)) as i32);
                self.op(a(0), value as i64 as u64)
            }
            Handler::Divw => {
                self.require_rv64()?;
                let value = div_signed(self.x(a(1)) as i32 as i64, self.x(a(2)) as i32 as i64);
                self.op(a(0), value as i32 as i64 as u64)
            }
            Handler::Divuw => {
                self.require_rv64()?;
                let value = div_unsigned(self.x(a(1)) as u32 as u64, self.x(a(2)) as u32 as u64);
                self.op(a(0), value as i32 as i64 as u64)
            }
            Handler::Remw => {
                self.require_rv64()?;
                let value = rem_signed(self.x(a(1)) as i32 as i64, self.x(a(2)) as i32 as i64);
                self.op(a(0), value as i32 as i64 as u64)
            }
            Handler::Remuw => {
                self.require_rv64()?;
                let value = rem_unsigned(self.x(a(1)) as u32 as u64, self.x(a(2)) as u32 as u64);
                self.op(a(0), value as i32 as i64 as u64)
            }
            Handler::Lr { double } => self.lr(a(0), a(1), double),
            Handler::Sc { double } => self.sc(a(0), a(1), a(2), double),
            Handler::Amo { op, double } => self.amo(op, a(0), a(1), a(2), double),
            Handler::Csr { op, immediate } => self.csr_op(op, immediate, a(0), a(1), a(2)),
            Handler::Sret => self.sret(),
            Handler::Mret => self.mret(),
            Handler::Wfi => self.wfi(),
            Handler::SfenceVma => self.sfence_vma(),
            Handler::CAddi4spn => self.op(a(0), self.x(2).wrapping_add(a(1))),
            Handler::CLi => self.op(a(0), imm(a(1)) as u64),
            Handler::CLui => self.op(a(0), imm(a(1)) as u64),
            Handler::CAddi16sp => {
                let value = self.x(2).wrapping_add(imm(a(0)) as u64);
                self.set_x(2, value);
                Ok(Progress::Next)
            }
            Handler::CJ => self.jump(a(1).wrapping_add(imm(a(0)) as u64)),
            Handler::CJr => {
                let target = self.x(a(0)) & !0b1;
                self.jump(target)
            }
            Handler::CJalr => {
                let target = self.x(a(0)) & !0b1;
                self.set_x(1, a(1).wrapping_add(a(2)));
                self.jump(target)
            }
            Handler::CBeqz => self.branch(self.x(a(0)) == 0, a(2), a(1)),
            Handler::CBnez => self.branch(self.x(a(0)) != 0, a(2), a(1)),
            Handler::CMv => self.op(a(0), self.x(a(1))),
            Handler::CLwsp => {
                let value = self.load(2, a(1), 2)? as i32 as i64 as u64;
                self.op(a(0), value)
            }
            Handler::CLdsp => {
                self.require_rv64()?;
                let value = self.load(2, a(1), 3)?;
                self.op(a(0), value)
            }
            Handler::CSwsp => self.store(2, a(1), self.x(a(0)), 2),
            Handler::CSdsp => {
                self.require_rv64()?;
                self.store(2, a(1), self.x(a(0)), 3)
            }
        }
    }
}

impl Executor<'_> {
    fn xlen(&self) -> Xlen {
        self.core.config.xlen
    }

    fn x(&self, specifier: u64) -> u64 {
        self.core.registers.x(specifier as usize)
    }

    /// Write an `x` register, canonicalizing the value to the configured register width.
    fn set_x(&mut self, specifier: u64, value: u64) {
        let value = self.xlen().sign_extend(value);
        self.core.registers.set_x(specifier as usize, value);
    }

    /// The common tail of computational handlers: write the destination and fall through.
    fn op(&mut self, dest: u64, value: u64) -> Result<Progress, Exception> {
        self.set_x(dest, value);
        Ok(Progress::Next)
    }

    /// Write the PC through the update capability and report the jump.
    fn jump(&mut self, target: u64) -> Result<Progress, Exception> {
        *self.core.registers.pc_mut() = self.xlen().truncate(target);
        Ok(Progress::Jumped)
    }

    fn branch(&mut self, taken: bool, pc: u64, offset: u64) -> Result<Progress, Exception> {
        match taken {
            true => self.jump(pc.wrapping_add(imm(offset) as u64)),
            false => Ok(Progress::Next),
        }
    }

    fn shamt_mask(&self) -> u64 {
        self.xlen().bits() as u64 - 1
    }

    /// Validate an immediate shift amount: on RV32, a shamt with bit 5 set is an illegal
    /// encoding.
    fn shamt(&self, shamt: u64) -> ExecutionResult<u64> {
        if self.xlen() == Xlen::Rv32 && shamt & 0x20 != 0 {
            return Err(Exception::IllegalInstruction(None));
        }
        Ok(shamt & self.shamt_mask())
    }

    fn require_rv64(&self) -> ExecutionResult<()> {
        match self.xlen() {
            Xlen::Rv64 => Ok(()),
            Xlen::Rv32 => Err(Exception::IllegalInstruction(None)),
        }
    }

    fn load(&mut self, base: u64, offset: u64, size_log2: u32) -> ExecutionResult<u64> {
        let vaddr = self.x(base).wrapping_add(imm(offset) as u64);
        self.core
            .virt_load(self.bus, vaddr, size_log2)
            .map_err(|error| load_fault(error, vaddr))
    }

    fn store(
        &mut self,
        base: u64,
        offset: u64,
        value: u64,
        size_log2: u32,
    ) -> Result<Progress, Exception> {
        let vaddr = self.x(base).wrapping_add(imm(offset) as u64);
        self.core
            .virt_store(self.bus, vaddr, value, size_log2)
            .map_err(|error| store_fault(error, vaddr))?;
        Ok(Progress::Next)
    }

    fn lr(&mut self, dest: u64, addr: u64, double: bool) -> Result<Progress, Exception> {
        if double {
            self.require_rv64()?;
        }
        let vaddr = self.x(addr);
        let size_log2 = if double { 3 } else { 2 };
        let value = self
            .core
            .virt_load(self.bus, vaddr, size_log2)
            .map_err(|error| load_fault(error, vaddr))?;
        let value = match double {
            true => value,
            false => value as i32 as i64 as u64,
        };
        self.core.reservation = Some(self.xlen().truncate(vaddr));
        self.op(dest, value)
    }

    fn sc(&mut self, dest: u64, addr: u64, src: u64, double: bool) -> Result<Progress, Exception> {
        if double {
            self.require_rv64()?;
        }
        let vaddr = self.xlen().truncate(self.x(addr));
        let size_log2 = if double { 3 } else { 2 };
        // The reservation is consumed no matter the outcome.
        let reserved = self.core.reservation.take() == Some(vaddr);
        if !reserved {
            return self.op(dest, 1);
        }
        self.core
            .virt_store(self.bus, vaddr, self.x(src), size_log2)
            .map_err(|error| store_fault(error, vaddr))?;
        self.op(dest, 0)
    }

    fn amo(
        &mut self,
        op: AmoOp,
        dest: u64,
        addr: u64,
        src: u64,
        double: bool,
    ) -> Result<Progress, Exception> {
        if double {
            self.require_rv64()?;
        }
        let vaddr = self.x(addr);
        let size_log2 = if double { 3 } else { 2 };
        let rhs = self.x(src);
        let old = self
            .core
            .virt_amo(self.bus, vaddr, size_log2, |old| {
                amo_result(op, old, rhs, double)
            })
            .map_err(|error| store_fault(error, vaddr))?;
        let old = match double {
            true => old,
            false => old as i32 as i64 as u64,
        };
        self.op(dest, old)
    }

    fn csr_op(
        &mut self,
        op: CsrOp,
        immediate: bool,
        dest: u64,
        src: u64,
        specifier: u64,
    ) -> Result<Progress, Exception> {
        let specifier = specifier as u16;
        let privilege = self.core.privilege;
        let src_value = match immediate {
            true => src,
            false => self.x(src),
        };
        // CSRRW with rd=x0 performs no read; CSRRS/CSRRC with rs1=x0 (or a zero immediate
        // specifier) perform no write.
        let reads = !(op == CsrOp::ReadWrite && dest == 0);
        let writes = op == CsrOp::ReadWrite || src != 0;
        let old = match reads {
            true => Some(
                self.core
                    .read_csr(self.bus, specifier, privilege)
                    .map_err(|_| Exception::IllegalInstruction(None))?,
            ),
            false => None,
        };
        let exit = match writes {
            true => {
                let (value, mask) = match op {
                    CsrOp::ReadWrite => (src_value, u64::MAX),
                    CsrOp::ReadSet => (u64::MAX, src_value),
                    CsrOp::ReadClear => (0, src_value),
                };
                self.core
                    .write_csr(specifier, privilege, value, mask)
                    .map_err(|_| Exception::IllegalInstruction(None))?
            }
            false => false,
        };
        if let Some(old) = old {
            self.set_x(dest, old);
        }
        Ok(match exit {
            true => Progress::NextExit,
            false => Progress::Next,
        })
    }

    fn sret(&mut self) -> Result<Progress, Exception> {
        if self.core.privilege < PrivilegeLevel::Supervisor
            || (self.core.privilege == PrivilegeLevel::Supervisor && self.core.status.tsr())
        {
            return Err(Exception::IllegalInstruction(None));
        }
        let previous = self.core.privilege;
        let status = &mut self.core.status;
        status.set_sie(status.spie());
        status.set_spie(true);
        let target = status.spp();
        status.set_spp(PrivilegeLevel::User);
        status.set_mprv(false);
        self.core.privilege = target;
        if target != previous {
            self.core.flush_tlb();
        }
        let sepc = self.core.trap.read_sepc();
        self.jump(sepc)
    }

    fn mret(&mut self) -> Result<Progress, Exception> {
        if self.core.privilege != PrivilegeLevel::Machine {
            return Err(Exception::IllegalInstruction(None));
        }
        let status = &mut self.core.status;
        status.set_mie(status.mpie());
        status.set_mpie(true);
        let target = status.mpp();
        status.set_mpp(PrivilegeLevel::User);
        if target != PrivilegeLevel::Machine {
            status.set_mprv(false);
        }
        self.core.privilege = target;
        if target != PrivilegeLevel::Machine {
            self.core.flush_tlb();
        }
        let mepc = self.core.trap.read_mepc();
        self.jump(mepc)
    }

    fn wfi(&mut self) -> Result<Progress, Exception> {
        match self.core.privilege {
            PrivilegeLevel::User => return Err(Exception::IllegalInstruction(None)),
            PrivilegeLevel::Supervisor if self.core.status.tw() => {
                return Err(Exception::IllegalInstruction(None));
            }
            _ => {}
        }
        // If an enabled interrupt is already pending, WFI completes immediately.
        if self.core.interrupts.pending() & self.core.mie != 0 {
            return Ok(Progress::Next);
        }
        self.core.interrupts.set_waiting_for_interrupt(true);
        Ok(Progress::NextExit)
    }

    fn sfence_vma(&mut self) -> Result<Progress, Exception> {
        match self.core.privilege {
            PrivilegeLevel::User => return Err(Exception::IllegalInstruction(None)),
            PrivilegeLevel::Supervisor if self.core.status.tvm() => {
                return Err(Exception::IllegalInstruction(None));
            }
            _ => {}
        }
        // A full flush is always a correct implementation of the per-ASID variants.
        self.core.flush_tlb();
        Ok(Progress::NextExit)
    }
}

/// Interpret an extracted field value as a sign-extended immediate.
fn imm(arg: u64) -> i64 {
    arg as u32 as i32 as i64
}

fn amo_result(op: AmoOp, old: u64, rhs: u64, double: bool) -> u64 {
    if double {
        match op {
            AmoOp::Swap => rhs,
            AmoOp::Add => old.wrapping_add(rhs),
            AmoOp::Xor => old ^ rhs,
            AmoOp::And => old & rhs,
            AmoOp::Or => old | rhs,
            AmoOp::Min => (old as i64).min(rhs as i64) as u64,
            AmoOp::Max => (old as i64).max(rhs as i64) as u64,
            AmoOp::Minu => old.min(rhs),
            AmoOp::Maxu => old.max(rhs),
        }
    } else {
        let (old, rhs) = (old as u32, rhs as u32);
        let value = match op {
            AmoOp::Swap => rhs,
            AmoOp::Add => old.wrapping_add(rhs),
            AmoOp::Xor => old ^ rhs,
            AmoOp::And => old & rhs,
            AmoOp::Or => old | rhs,
            AmoOp::Min => (old as i32).min(rhs as i32) as u32,
            AmoOp::Max => (old as i32).max(rhs as i32) as u32,
            AmoOp::Minu => old.min(rhs),
            AmoOp::Maxu => old.max(rhs),
        };
        value as u64
    }
}

/// > Division by zero gives all bits set; overflow of the most negative value gives the
/// > dividend back.
fn div_signed(n: i64, d: i64) -> i64 {
    match d {
        0 => -1,
        -1 if n == i64::MIN => n,
        _ => n.wrapping_div(d),
    }
}

fn div_unsigned(n: u64, d: u64) -> u64 {
    match d {
        0 => u64::MAX,
        _ => n / d,
    }
}

fn rem_signed(n: i64, d: i64) -> i64 {
    match d {
        0 => n,
        -1 if n == i64::MIN => 0,
        _ => n.wrapping_rem(d),
    }
}

fn rem_unsigned(n: u64, d: u64) -> u64 {
    match d {
        0 => n,
        _ => n % d,
    }
}

fn load_fault(error: MemoryError, vaddr: u64) -> Exception {
    match error {
        MemoryError::MisalignedAccess => Exception::LoadAddressMisaligned(vaddr),
        MemoryError::AccessFault => Exception::LoadAccessFault(vaddr),
        MemoryError::PageFault => Exception::LoadPageFault(vaddr),
    }
}

fn store_fault(error: MemoryError, vaddr: u64) -> Exception {
    match error {
        MemoryError::MisalignedAccess => Exception::StoreOrAmoAddressMisaligned(vaddr),
        MemoryError::AccessFault => Exception::StoreOrAmoAccessFault(vaddr),
        MemoryError::PageFault => Exception::StoreOrAmoPageFault(vaddr),
    }
}
