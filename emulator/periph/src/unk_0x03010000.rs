/*++

Licensed under the Apache-2.0 license.

File Name:

    unk_0x03010000.rs

Abstract:

    Unknown device at 0x03010000 the on chip bootloader polls at boot.

--*/

use crate::{DeviceCtx, DeviceDescriptor, DeviceError, DeviceInstance};
use pspemu_bus::IoManager;
use pspemu_cpu::ExecCtx;
use pspemu_types::{AccessSize, PspAddr};

const MMIO_BASE: PspAddr = 0x0301_0000;
const MMIO_LEN: u64 = 4096;

/// The timer occupies 36 bytes in the middle of this window; the device
/// claims the 4KiB around that hole.
const TIMER_HOLE_START: u64 = 0x424;
const TIMER_HOLE_END: u64 = 0x448;

pub static DEVICE: DeviceDescriptor = DeviceDescriptor {
    name: "unk-0x03010000",
    description: "Unknown device starting at 0x03010000",
    instantiate,
};

fn mmio_read(off: u64, size: AccessSize) -> u32 {
    log::trace!("unk-0x03010000: read off={:#x} len={}", off, size.bytes());
    match off {
        // The on chip bootloader waits in on_chip_bl_main() until bit 8 is
        // set.
        0x104 => 0x100,
        _ => 0,
    }
}

fn mmio_write(off: u64, size: AccessSize, val: u32) {
    log::trace!(
        "unk-0x03010000: write off={:#x} len={} val={:#x}",
        off,
        size.bytes(),
        val
    );
}

fn instantiate(iom: &mut IoManager, _ctx: &DeviceCtx) -> Result<DeviceInstance, DeviceError> {
    let low = iom.mmio_register(
        MMIO_BASE,
        TIMER_HOLE_START,
        Some(Box::new(|_ctx: &mut dyn ExecCtx, off, size| {
            mmio_read(off, size)
        })),
        Some(Box::new(|_ctx: &mut dyn ExecCtx, off, size, val| {
            mmio_write(off, size, val)
        })),
    )?;
    let high = iom.mmio_register(
        MMIO_BASE + TIMER_HOLE_END as PspAddr,
        MMIO_LEN - TIMER_HOLE_END,
        Some(Box::new(|_ctx: &mut dyn ExecCtx, off, size| {
            mmio_read(off + TIMER_HOLE_END, size)
        })),
        Some(Box::new(|_ctx: &mut dyn ExecCtx, off, size, val| {
            mmio_write(off + TIMER_HOLE_END, size, val)
        })),
    )?;
    Ok(DeviceInstance::new(&DEVICE, vec![low, high]))
}
