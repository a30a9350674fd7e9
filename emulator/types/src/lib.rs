/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    Shared address types, access widths and guest status codes for the
    PSP emulator.

--*/

mod consts;

pub use consts::*;

use strum_macros::{Display, EnumString};

/// An address in the PSP address space.
pub type PspAddr = u32;

/// An address on the System Management Network fabric.
pub type SmnAddr = u32;

/// A physical address in the x86 address space.
pub type X86PhysAddr = u64;

/// Marks an x86 mapping slot as unused.
pub const NIL_X86_PHYS_ADDR: X86PhysAddr = u64::MAX;

/// Width of a single guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessSize {
    Byte = 1,
    HalfWord = 2,
    Word = 4,
    DoubleWord = 8,
}

impl AccessSize {
    /// Number of bytes transferred by an access of this width.
    pub fn bytes(self) -> usize {
        self as usize
    }

    pub fn from_bytes(len: usize) -> Option<Self> {
        match len {
            1 => Some(AccessSize::Byte),
            2 => Some(AccessSize::HalfWord),
            4 => Some(AccessSize::Word),
            8 => Some(AccessSize::DoubleWord),
            _ => None,
        }
    }
}

/// Emulation mode a PSP core operates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum EmuMode {
    /// A single usermode application is executed and the svc interface is emulated.
    #[strum(serialize = "app")]
    App,
    /// Full system emulation with the supervisor code being executed as well.
    #[strum(serialize = "sys")]
    System,
    /// Full system emulation including the on chip bootloader.
    #[strum(serialize = "on-chip-bl")]
    SystemOnChipBl,
}

/// Micro architecture the PSP is emulated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum MicroArch {
    #[strum(serialize = "zen")]
    Zen,
    #[strum(serialize = "zen+")]
    ZenPlus,
    #[strum(serialize = "zen2")]
    Zen2,
}

impl MicroArch {
    /// SRAM size of the PSP for this micro architecture.
    pub fn sram_len(self) -> u32 {
        match self {
            MicroArch::Zen | MicroArch::ZenPlus => PSP_SRAM_LEN_ZEN,
            MicroArch::Zen2 => PSP_SRAM_LEN_ZEN2,
        }
    }

    /// Location of the boot ROM service page.
    pub fn brsp_addr(self) -> PspAddr {
        match self {
            MicroArch::Zen | MicroArch::ZenPlus => PSP_BRSP_ADDR_ZEN,
            MicroArch::Zen2 => PSP_BRSP_ADDR_ZEN2,
        }
    }

    /// SMN address the flash ROM is mapped at.
    pub fn flash_smn_addr(self) -> SmnAddr {
        match self {
            MicroArch::Zen | MicroArch::ZenPlus => SMN_FLASH_ADDR_ZEN,
            MicroArch::Zen2 => SMN_FLASH_ADDR_ZEN2,
        }
    }
}

/// AMD CPU segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum CpuSegment {
    #[strum(serialize = "ryzen")]
    Ryzen,
    #[strum(serialize = "ryzen-pro")]
    RyzenPro,
    #[strum(serialize = "threadripper")]
    Threadripper,
    #[strum(serialize = "epyc")]
    Epyc,
}

/// ACPI sleep state the emulated system starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum AcpiState {
    #[strum(serialize = "s0")]
    S0,
    #[strum(serialize = "s1")]
    S1,
    #[strum(serialize = "s2")]
    S2,
    #[strum(serialize = "s3")]
    S3,
    #[strum(serialize = "s4")]
    S4,
    #[strum(serialize = "s5")]
    S5,
}

/// Success status returned to the guest in R0.
pub const SVC_STATUS_SUCCESS: u32 = 0;

/// General memory error, also used for unimplemented syscalls and failed
/// proxy round trips.
pub const SVC_STATUS_GENERAL_MEMORY_ERROR: u32 = 0x9;

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_access_size_round_trip() {
        for len in [1usize, 2, 4, 8] {
            assert_eq!(AccessSize::from_bytes(len).unwrap().bytes(), len);
        }
        assert!(AccessSize::from_bytes(3).is_none());
        assert!(AccessSize::from_bytes(16).is_none());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(EmuMode::from_str("app").unwrap(), EmuMode::App);
        assert_eq!(EmuMode::from_str("sys").unwrap(), EmuMode::System);
        assert_eq!(
            EmuMode::from_str("on-chip-bl").unwrap(),
            EmuMode::SystemOnChipBl
        );
        assert!(EmuMode::from_str("bogus").is_err());
    }

    #[test]
    fn test_micro_arch_layout() {
        assert_eq!(MicroArch::Zen.sram_len(), 256 * 1024);
        assert_eq!(MicroArch::Zen2.sram_len(), 320 * 1024);
        assert_eq!(MicroArch::Zen.brsp_addr(), 0x3f000);
        assert_eq!(MicroArch::Zen2.brsp_addr(), 0x4f000);
    }
}
