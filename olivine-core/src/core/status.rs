use crate::{PrivilegeLevel, RawPrivilegeLevel, Xlen};
use bitvec::field::BitField;
use bitvec::order::Lsb0;
use bitvec::view::BitView;

// Mask to be applied to mstatus to get sstatus (RV64 layout).
const SSTATUS_MASK: u64 = 0x8000_0003_000D_E762;

mod idx {
    pub const SIE: usize = 1;
    pub const MIE: usize = 3;
    pub const SPIE: usize = 5;
    pub const MPIE: usize = 7;
    pub const SPP: usize = 8;
    pub const MPP: usize = 11;
    pub const MPRV: usize = 17;
    pub const SUM: usize = 18;
    pub const MXR: usize = 19;
    pub const TVM: usize = 20;
    pub const TW: usize = 21;
    pub const TSR: usize = 22;
    pub const UXL: usize = 32;
    pub const SXL: usize = 34;
    /// In mstatush (RV32 only).
    pub const MPV: usize = 7;
}

/// Writable mstatus bits in this implementation: SIE, MIE, SPIE, MPIE, SPP, MPP, MPRV, SUM,
/// MXR, TVM, TW, TSR.
const MSTATUS_WRITE_MASK: u64 = 0x007E_19AA;
/// Writable mstatush bits (RV32 only).
const MSTATUSH_WRITE_MASK: u32 = 1 << idx::MPV;

/// Provides the mstatus, mstatush, and sstatus registers.
///
/// > The mstatus register is an MXLEN-bit read/write register [...]. The mstatus register keeps
/// > track of and controls the hart’s current operating state. A restricted view of mstatus
/// > appears as the sstatus register in the S-level ISA.
/// >
/// > For RV32 only, mstatush is a 32-bit read/write register [...].
#[derive(Debug, Clone)]
pub struct Status {
    mstatus: u64,
    mstatush: u32,
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

impl Status {
    pub fn new() -> Self {
        Self {
            mstatus: 0,
            mstatush: 0,
        }
    }

    /// Returns `true` if the MIE (M-mode Interrupt Enable) bit is set.
    pub fn mie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MIE]
    }

    /// Sets the MIE (M-mode Interrupt Enable) bit to `value`.
    pub fn set_mie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MIE, value);
    }

    /// Returns `true` if the SIE (S-mode Interrupt Enable) bit is set.
    pub fn sie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SIE]
    }

    /// Sets the SIE (S-mode Interrupt Enable) bit to `value`.
    pub fn set_sie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::SIE, value);
    }

    /// Returns `true` if the MPIE (M-mode Previous Interrupt Enable) bit is set.
    pub fn mpie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MPIE]
    }

    /// Sets the MPIE (M-mode Previous Interrupt Enable) bit to `value`.
    pub fn set_mpie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MPIE, value);
    }

    /// Returns `true` if the SPIE (S-mode Previous Interrupt Enable) bit is set.
    pub fn spie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SPIE]
    }

    /// Sets the SPIE (S-mode Previous Interrupt Enable) bit to `value`.
    pub fn set_spie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::SPIE, value);
    }

    /// Returns the privilege level encoded by the MPP (M-mode Previous Privilege level) field.
    ///
    /// The MPP field is **WARL**, so this always holds a valid level.
    pub fn mpp(&self) -> PrivilegeLevel {
        RawPrivilegeLevel::from_u2(
            self.mstatus.view_bits::<Lsb0>()[idx::MPP..(idx::MPP + 2)].load_le(),
        )
        .try_into()
        .unwrap()
    }

    /// Sets the MPP (M-mode Previous Privilege level) field to `value`.
    pub fn set_mpp(&mut self, value: PrivilegeLevel) {
        self.mstatus.view_bits_mut::<Lsb0>()[idx::MPP..(idx::MPP + 2)].store_le(value as u8);
    }

    /// Returns the privilege level encoded by the SPP (S-mode Previous Privilege level) field.
    pub fn spp(&self) -> PrivilegeLevel {
        match self.mstatus.view_bits::<Lsb0>()[idx::SPP] {
            false => PrivilegeLevel::User,
            true => PrivilegeLevel::Supervisor,
        }
    }

    /// Sets the SPP (S-mode Previous Privilege level) field to `value`.
    ///
    /// Values above Supervisor are ignored (the field is **WARL**).
    pub fn set_spp(&mut self, value: PrivilegeLevel) {
        if value <= PrivilegeLevel::Supervisor {
            let bit = value == PrivilegeLevel::Supervisor;
            self.mstatus.view_bits_mut::<Lsb0>().set(idx::SPP, bit);
        }
    }

    /// Returns `true` if the MPRV (Modify PRiVilege) bit is set.
    pub fn mprv(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MPRV]
    }

    /// Sets the MPRV (Modify PRiVilege) bit to `value`.
    pub fn set_mprv(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MPRV, value);
    }

    /// Returns `true` if the SUM (permit Supervisor User Memory access) bit is set.
    pub fn sum(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SUM]
    }

    /// Returns `true` if the MXR (Make eXecutable Readable) bit is set.
    pub fn mxr(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MXR]
    }

    /// Returns `true` if the TVM (Trap Virtual Memory) bit is set.
    pub fn tvm(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::TVM]
    }

    /// Returns `true` if the TW (Timeout Wait) bit is set.
    pub fn tw(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::TW]
    }

    /// Returns `true` if the TSR (Trap SRet) bit is set.
    pub fn tsr(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::TSR]
    }

    /// Read the mstatus register.
    ///
    /// On RV64, UXL and SXL read as fixed `2` (64-bit); on RV32 they do not exist.
    pub fn read_mstatus(&self, xlen: Xlen) -> u64 {
        match xlen {
            Xlen::Rv32 => self.mstatus & 0xFFFF_FFFF,
            Xlen::Rv64 => self.mstatus | (2 << idx::UXL) | (2 << idx::SXL),
        }
    }

    /// Write the bits of mstatus selected by `mask`.
    ///
    /// WARL fields are sanitized: an MPP value of `2` leaves the old value in place.
    pub fn write_mstatus(&mut self, value: u64, mask: u64) {
        let mask = mask & MSTATUS_WRITE_MASK;
        let old_mpp = self.mpp();
        self.mstatus = self.mstatus & !mask | value & mask;
        if RawPrivilegeLevel::from_u2(
            self.mstatus.view_bits::<Lsb0>()[idx::MPP..(idx::MPP + 2)].load_le(),
        )
        .is_reserved()
        {
            self.set_mpp(old_mpp);
        }
    }

    /// Read the mstatush register (RV32 only).
    pub fn read_mstatush(&self) -> u32 {
        self.mstatush
    }

    /// Write the bits of mstatush selected by `mask`.
    pub fn write_mstatush(&mut self, value: u32, mask: u32) {
        let mask = mask & MSTATUSH_WRITE_MASK;
        self.mstatush = self.mstatush & !mask | value & mask;
    }

    /// Returns `true` if the MPV bit of mstatush is set.
    pub fn mpv(&self) -> bool {
        self.mstatush.view_bits::<Lsb0>()[idx::MPV]
    }

    /// Read the sstatus projection of mstatus.
    pub fn read_sstatus(&self, xlen: Xlen) -> u64 {
        self.read_mstatus(xlen) & sstatus_mask(xlen)
    }

    /// Write the bits of the sstatus projection selected by `mask`.
    pub fn write_sstatus(&mut self, value: u64, mask: u64, xlen: Xlen) {
        self.write_mstatus(value, mask & sstatus_mask(xlen));
    }

    /// The bits of mstatus a trap into M-mode or S-mode rewrites, plus the translation-relevant
    /// bits whose change must flush the TLBs.
    pub fn translation_bits(&self) -> u64 {
        let translation_mask = (1 << idx::MPRV) | (1 << idx::SUM) | (1 << idx::MXR)
            | (0b11 << idx::MPP);
        self.mstatus & translation_mask
    }
}

fn sstatus_mask(xlen: Xlen) -> u64 {
    match xlen {
        Xlen::Rv32 => SSTATUS_MASK & 0xFFFF_FFFF,
        Xlen::Rv64 => SSTATUS_MASK,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mpp_warl() {
        let mut status = Status::new();
        status.set_mpp(PrivilegeLevel::Supervisor);
        assert_eq!(PrivilegeLevel::Supervisor, status.mpp());
        // Writing the reserved level 2 through the raw interface keeps the old value.
        status.write_mstatus(2 << 11, 0b11 << 11);
        assert_eq!(PrivilegeLevel::Supervisor, status.mpp());
        status.write_mstatus(3 << 11, 0b11 << 11);
        assert_eq!(PrivilegeLevel::Machine, status.mpp());
    }

    #[test]
    fn test_sstatus_projection() {
        let mut status = Status::new();
        status.set_mie(true);
        status.set_sie(true);
        let sstatus = status.read_sstatus(Xlen::Rv64);
        // SIE is visible through sstatus, MIE is not.
        assert_ne!(0, sstatus & (1 << 1));
        assert_eq!(0, sstatus & (1 << 3));
        // Writing MIE through sstatus has no effect.
        status.write_sstatus(0, !0, Xlen::Rv64);
        assert!(status.mie());
        assert!(!status.sie());
    }

    #[test]
    fn test_translation_bits_capture_mprv_sum_mxr_mpp() {
        let mut status = Status::new();
        let before = status.translation_bits();
        status.set_mprv(true);
        assert_ne!(before, status.translation_bits());
        let before = status.translation_bits();
        status.write_mstatus(1 << 18, 1 << 18);
        assert_ne!(before, status.translation_bits());
    }
}
