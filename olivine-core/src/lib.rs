#[macro_use]
extern crate static_assertions;

use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

pub mod address_range;
pub mod bits;
pub mod board;
pub mod core;
pub mod devices;
pub mod interrupt;
pub mod isa;
pub mod memory_map;
pub mod plan9;
pub mod registers;
pub mod system_bus;
pub mod virtio;

/// Re-export of [`AddressRange`] for convenience.
pub use address_range::AddressRange;

/// List of all possible privilege levels for RISC-V.
///
/// Same as [`PrivilegeLevel`] except that it allows specifying the reserved privilege level `2`.
/// This can be useful in case a minimum required privilege level is specified as a 2-bit value,
/// since that value itself may be a reserved privilege level.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum RawPrivilegeLevel {
    User = 0,
    Supervisor = 1,
    /// Privilege level `0b10` is reserved in the base ISA. When using the hypervisor extension,
    /// this becomes the Hypervisor privilege level.
    Reserved = 2,
    Machine = 3,
}

impl RawPrivilegeLevel {
    /// Convert a 2-bit value into a [`RawPrivilegeLevel`].
    /// Panics if the value doesn't fit in 2 bits (`0..=3`).
    pub fn from_u2(value_u2: u8) -> Self {
        match value_u2 {
            0 => Self::User,
            1 => Self::Supervisor,
            2 => Self::Reserved,
            3 => Self::Machine,
            _ => panic!("out of range u2 used"),
        }
    }

    pub fn is_reserved(self) -> bool {
        matches!(self, Self::Reserved)
    }
}

impl fmt::Display for RawPrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            RawPrivilegeLevel::User => "U",
            RawPrivilegeLevel::Supervisor => "S",
            RawPrivilegeLevel::Reserved => "2",
            RawPrivilegeLevel::Machine => "M",
        })
    }
}

/// List of defined privilege levels for RISC-V.
///
/// A privilege level is always referenced by two bits, so only `0`, `1`, `2`, and `3` are valid
/// privilege levels. However, only levels `0`, `1`, and `3` are defined; level `2` is considered
/// *reserved* for now.
///
/// > The machine level has the highest privileges and is the only mandatory privilege level for a
/// > RISC-V hardware platform. Code run in machine-mode (M-mode) is usually inherently trusted, as
/// > it has low-level access to the machine implementation. M-mode can be used to manage secure
/// > execution environments on RISC-V. User-mode (U-mode) and supervisor-mode (S-mode) are intended
/// > for conventional application and operating system usage respectively.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum PrivilegeLevel {
    /// User/application (abbreviated `U`) is the lower privilege level.
    User = 0,
    /// Supervisor (abbreviated `S`) is an intermediate privilege level,
    /// that allows protection from OS.
    Supervisor = 1,
    // Level 2 is reserved
    /// Machine (abbreviated `M`) is the highest privilege level.
    /// It is the only mandatory privilege level for a RISC-V hardware platform.
    Machine = 3,
}

impl PartialEq<PrivilegeLevel> for RawPrivilegeLevel {
    fn eq(&self, other: &PrivilegeLevel) -> bool {
        *self as usize == *other as usize
    }
}

impl PartialEq<RawPrivilegeLevel> for PrivilegeLevel {
    fn eq(&self, other: &RawPrivilegeLevel) -> bool {
        *self as usize == *other as usize
    }
}

impl PartialOrd<PrivilegeLevel> for RawPrivilegeLevel {
    fn partial_cmp(&self, other: &PrivilegeLevel) -> Option<Ordering> {
        (*self as usize).partial_cmp(&(*other as usize))
    }
}

impl PartialOrd<RawPrivilegeLevel> for PrivilegeLevel {
    fn partial_cmp(&self, other: &RawPrivilegeLevel) -> Option<Ordering> {
        (*self as usize).partial_cmp(&(*other as usize))
    }
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            PrivilegeLevel::User => "U",
            PrivilegeLevel::Supervisor => "S",
            PrivilegeLevel::Machine => "M",
        })
    }
}

impl From<PrivilegeLevel> for RawPrivilegeLevel {
    fn from(value: PrivilegeLevel) -> Self {
        match value {
            PrivilegeLevel::User => Self::User,
            PrivilegeLevel::Supervisor => Self::Supervisor,
            PrivilegeLevel::Machine => Self::Machine,
        }
    }
}

impl TryFrom<RawPrivilegeLevel> for PrivilegeLevel {
    type Error = ReservedPrivilegeLevelError;
    fn try_from(value: RawPrivilegeLevel) -> Result<Self, Self::Error> {
        match value {
            RawPrivilegeLevel::User => Ok(Self::User),
            RawPrivilegeLevel::Supervisor => Ok(Self::Supervisor),
            RawPrivilegeLevel::Reserved => Err(ReservedPrivilegeLevelError(value)),
            RawPrivilegeLevel::Machine => Ok(Self::Machine),
        }
    }
}

#[derive(Error, Debug)]
#[error("privilege level {0} is reserved")]
pub struct ReservedPrivilegeLevelError(RawPrivilegeLevel);

/// The two supported base-ISA widths.
///
/// The RV32 state of a hart is a strict projection of its RV64 state: the `x` registers and CSRs
/// are truncated to their low 32 bits, and Sv39/Sv48 address translation is unavailable.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Xlen {
    Rv32,
    Rv64,
}

impl Xlen {
    /// The width of the `x` registers in bits.
    pub const fn bits(self) -> u32 {
        match self {
            Xlen::Rv32 => 32,
            Xlen::Rv64 => 64,
        }
    }

    /// Truncate `value` to this register width, zero-extending the result.
    pub const fn truncate(self, value: u64) -> u64 {
        match self {
            Xlen::Rv32 => value & 0xFFFF_FFFF,
            Xlen::Rv64 => value,
        }
    }

    /// Truncate `value` to this register width, sign-extending the result.
    pub const fn sign_extend(self, value: u64) -> u64 {
        match self {
            Xlen::Rv32 => value as u32 as i32 as i64 as u64,
            Xlen::Rv64 => value,
        }
    }
}

/// Address alignment ranging from no alignment (`1`) to `1 << 31` alignment.
// Maintains the invariant that self.0 is a power of two.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Alignment(u64);

impl Alignment {
    /// Byte alignment is equivalent to no alignment.
    pub const BYTE: Self = Self(1);

    /// Halfword alignment means the address is a multiple of 2 (`address & 0b1 == 0`).
    pub const HALFWORD: Self = Self(2);

    /// Word alignment means the address is a multiple of 4 (`address & 0b11 == 0`).
    pub const WORD: Self = Self(4);

    /// Doubleword alignment means the address is a multiple of 8 (`address & 0b111 == 0`).
    pub const DOUBLEWORD: Self = Self(8);

    /// Creates the natural alignment for a unit of size `size`. Returns `None` if `size` is not a
    /// power of two.
    ///
    /// If `size` is a power of two, the alignment will be equal to the size.
    pub fn natural_for_size(size: u64) -> Option<Self> {
        size.is_power_of_two().then_some(Self(size))
    }

    /// Returns the alignment corresponding to `1 << exponent`.
    pub fn from_exponent(exponent: u8) -> Option<Self> {
        (exponent < 32).then_some(Self(1u64 << exponent))
    }

    /// Returns the alignment as a power of two.
    pub fn as_power_of_two(self) -> u64 {
        self.0
    }

    /// Returns a mask that is non-zero for a misaligned address when ANDed with it.
    pub fn as_mask(self) -> u64 {
        self.0 - 1
    }

    /// Returns `true` if `address` is aligned to this alignment.
    pub fn is_aligned(self, address: u64) -> bool {
        address & (self.0 - 1) == 0
    }
}
