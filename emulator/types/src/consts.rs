/*++

Licensed under the Apache-2.0 license.

File Name:

    consts.rs

Abstract:

    Memory map constants of the emulated PSP.

--*/

use crate::{PspAddr, SmnAddr};

/// SRAM size for Zen and Zen+ parts.
pub const PSP_SRAM_LEN_ZEN: u32 = 256 * 1024;

/// SRAM size for Zen2 parts.
pub const PSP_SRAM_LEN_ZEN2: u32 = 320 * 1024;

/// Base of the window the 32 SMN mapping slots are accessed through.
pub const SMN_WINDOW_BASE: PspAddr = 0x0100_0000;

/// Number of SMN mapping slots.
pub const SMN_SLOT_COUNT: u32 = 32;

/// Size of a single SMN mapping slot.
pub const SMN_SLOT_LEN: u32 = 1024 * 1024;

/// Base of the standard MMIO region.
pub const MMIO_WINDOW_BASE: PspAddr = 0x0300_0000;

/// Exclusive end of the standard MMIO region.
pub const MMIO_WINDOW_END: PspAddr = 0x0400_0000;

/// Base of the window x86 memory mappings appear in.
pub const X86_WINDOW_BASE: PspAddr = 0x0400_0000;

/// Number of x86 mapping control slots visible through the window.
pub const X86_WINDOW_SLOT_COUNT: u32 = 15;

/// Size of a single x86 mapping slot.
pub const X86_SLOT_LEN: u32 = 64 * 1024 * 1024;

/// Number of concurrent x86 mappings the hardware supports.
pub const X86_MAPPING_SLOTS: usize = 8;

/// MMIO base of the SMN slot control register interface.
pub const SMN_CTRL_BASE: PspAddr = 0x0322_0000;

/// MMIO base of the x86 mapping control register interface.
pub const X86_MAP_CTRL_BASE: PspAddr = 0x0323_0000;

/// MMIO base of the second x86 mapping control register bank.
pub const X86_MAP_CTRL2_BASE: PspAddr = 0x0323_03e0;

/// MMIO base of the third x86 mapping control register bank.
pub const X86_MAP_CTRL3_BASE: PspAddr = 0x0323_04d8;

/// The on chip bootloader ROM location.
pub const PSP_ON_CHIP_BL_ADDR: PspAddr = 0xffff_0000;

/// Boot ROM service page location for Zen and Zen+.
pub const PSP_BRSP_ADDR_ZEN: PspAddr = 0x3f000;

/// Boot ROM service page location for Zen2.
pub const PSP_BRSP_ADDR_ZEN2: PspAddr = 0x4f000;

/// Load address of the off chip bootloader / supervisor part.
pub const PSP_SYS_LOAD_ADDR: PspAddr = 0x0;

/// Entry point of the supervisor part.
pub const PSP_SYS_ENTRY: PspAddr = 0x100;

/// Load address of a usermode application.
pub const PSP_APP_LOAD_ADDR: PspAddr = 0x15000;

/// Entry point of a usermode application.
pub const PSP_APP_ENTRY: PspAddr = 0x15100;

/// Size of the firmware header preceding loadable binaries.
pub const PSP_FW_HDR_LEN: u32 = 256;

/// Bottom of the stack region handed to applications by svc 0x1.
pub const PSP_APP_STACK_BASE: PspAddr = 0x50000;

/// Size of the application stack region (two pages).
pub const PSP_APP_STACK_LEN: u32 = 2 * 4096;

/// Initial application stack top.
pub const PSP_APP_STACK_TOP: PspAddr = 0x52000;

/// SMN address of the flash ROM on Zen and Zen+.
pub const SMN_FLASH_ADDR_ZEN: SmnAddr = 0x0a00_0000;

/// SMN address of the flash ROM on Zen2.
pub const SMN_FLASH_ADDR_ZEN2: SmnAddr = 0x4400_0000;

/// SMN address of the CCD ID register.
pub const SMN_CCD_ID_ADDR: SmnAddr = 0x5a870;

/// Primary scratch buffer on the proxied PSP used for syscall argument
/// marshaling.
pub const PROXY_SCRATCH_ADDR: PspAddr = 0x20000;

/// Secondary scratch buffer on the proxied PSP.
pub const PROXY_SCRATCH_ADDR_2: PspAddr = 0x21000;

/// Scratch address used by syscall 0x33 request marshaling.
pub const PROXY_SCRATCH_ADDR_0X33: PspAddr = 0x21e2c;

/// Scratch buffer the ECDH/ECDSA curve constants are synced to.
pub const PROXY_CURVE_SCRATCH_ADDR: PspAddr = 0x22000;

/// Auxiliary scratch buffer for off-stack curve operation buffers.
pub const PROXY_CURVE_AUX_SCRATCH_ADDR: PspAddr = 0x22500;

/// Scratch address request structures are marshaled to.
pub const PROXY_REQ_SCRATCH_ADDR: PspAddr = 0x23000;

/// Stack window of the proxied supervisor synced around curve operations.
pub const PSP_SVC_STACK_BASE: PspAddr = 0x60000;

/// Size of the proxied supervisor stack window.
pub const PSP_SVC_STACK_LEN: u32 = 2 * 4096;

/// PSP address of the in-SRAM ECDH/ECDSA curve constants.
pub const PSP_CURVE_CONST_ADDR: PspAddr = 0x1c6ac;
