/*++

Licensed under the Apache-2.0 license.

File Name:

    smn_unknown.rs

Abstract:

    The table of known SMN registers the bootloaders poll, with the values
    observed to make them progress.

--*/

use crate::{DeviceCtx, DeviceDescriptor, DeviceError, DeviceInstance};
use pspemu_bus::IoManager;
use pspemu_cpu::ExecCtx;
use pspemu_types::{AccessSize, SmnAddr};

/// Read-only SMN registers and their values. Each entry is 4 bytes wide.
const SMN_REGS: &[(SmnAddr, u32)] = &[
    // The on chip bootloader waits for bit 0 to go 1.
    (0x0005_e000, 0x1),
    // The off chip bootloader wants bit 5 to be one, otherwise it reports
    // PSPSTATUS_CCX_SEC_BISI_EN_NOT_SET_IN_FUSE_RAM.
    (0x0005_d0cc, 1 << 5),
    // Read by the on chip bootloader and acted upon.
    (0x0102_5034, 0x1e113),
    (0x0100_4034, 0x1e112),
    (0x0100_3034, 0x1e112),
    (0x0101_8034, 0x1e113),
    (0x0102_e034, 0x1e312),
    (0x0103_0034, 0x1e312),
    (0x0104_6034, 0x1e103),
    (0x0104_7034, 0x1e103),
    (0x0106_c034, 0x1e113),
    (0x0106_d034, 0x1e113),
    (0x0106_e034, 0x1e312),
    (0x0108_0034, 0x1e113),
    (0x0108_1034, 0x1e113),
    (0x0109_6034, 0x1e312),
    (0x0109_7034, 0x1e312),
    (0x010a_8034, 0x1e312),
    (0x010d_8034, 0x1e312),
    // The actual value is not known so far (Ryzen on chip bootloader).
    (0x0101_0034, 0x1e113),
    // The on chip bootloader waits for bits 9 and 10 to become set.
    (0x1808_0064, (1 << 10) | (1 << 9)),
    (0x1848_0064, (1 << 10) | (1 << 9)),
    // The Ryzen on chip bootloader waits for bit 13 to become set.
    (0x0100_2034, 1 << 13),
    // The Ryzen on chip bootloader waits for bit 4 to become set.
    (0x0005_b310, 1 << 4),
    (0x0005_bb10, 1 << 4),
    (0x0005_c310, 1 << 4),
    (0x0005_fb10, 1 << 4),
    // The Ryzen on chip bootloader waits for the first bit to become 1.
    (0x0005_a088, 0x1),
    (0x0005_a098, 0x1),
    // Magic to enable debug logging through x86 port 80h.
    (0x0005_1050, 0x5a33_5a33),
    // Magic to make ABL1 go further.
    (0x0005_105c, 0xc001_c001),
    // Physical die and socket ID 0 for now (master PSP).
    (0x0005_a078, 0x10),
];

pub static DEVICE: DeviceDescriptor = DeviceDescriptor {
    name: "smn-unknown",
    description: "Unknown SMN registers",
    instantiate,
};

fn instantiate(iom: &mut IoManager, _ctx: &DeviceCtx) -> Result<DeviceInstance, DeviceError> {
    let mut regions = Vec::with_capacity(SMN_REGS.len());
    for &(addr, value) in SMN_REGS {
        let read = Box::new(move |_ctx: &mut dyn ExecCtx, _off: u64, _size: AccessSize| value);
        regions.push(iom.smn_register(addr, 4, Some(read), None)?);
    }
    Ok(DeviceInstance::new(&DEVICE, regions))
}
