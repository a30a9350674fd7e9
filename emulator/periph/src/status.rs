/*++

Licensed under the Apache-2.0 license.

File Name:

    status.rs

Abstract:

    POST code collector: MMIO status register at 0x032000e8 and the x86
    port 80h alias at 0xfffdfc000080.

--*/

use crate::{DeviceCtx, DeviceDescriptor, DeviceError, DeviceInstance};
use pspemu_bus::IoManager;
use pspemu_cpu::ExecCtx;
use pspemu_types::{AccessSize, PspAddr, X86PhysAddr};

const MMIO_BASE: PspAddr = 0x0320_00e8;
const X86_PORT80_ADDR: X86PhysAddr = 0xfffd_fc00_0080;

/// Valid bit of a PSP side status write.
const STS_PSP_VALID: u32 = 1 << 8;

/// Valid bit of an x86 side status write.
const STS_X86_VALID: u32 = 1 << 26;

pub static DEVICE: DeviceDescriptor = DeviceDescriptor {
    name: "status",
    description: "Status collector device",
    instantiate,
};

fn log_post_code(x86: bool, val: u32) {
    log::info!(
        "POST CODE ({}): {:#04x}",
        if x86 { "X86" } else { "PSP" },
        val & 0xff
    );
}

fn instantiate(iom: &mut IoManager, _ctx: &DeviceCtx) -> Result<DeviceInstance, DeviceError> {
    let read = Box::new(|_ctx: &mut dyn ExecCtx, _off: u64, size: AccessSize| {
        if size != AccessSize::Word {
            log::warn!("status: invalid register read size {}", size.bytes());
        }
        0
    });
    let write = Box::new(|_ctx: &mut dyn ExecCtx, _off: u64, size: AccessSize, val: u32| {
        if size != AccessSize::Word {
            log::warn!("status: invalid register write size {}", size.bytes());
            return;
        }
        if val & STS_PSP_VALID != 0 {
            log_post_code(false, val);
        }
    });
    let mmio = iom.mmio_register(MMIO_BASE, 4, Some(read), Some(write))?;

    let read = Box::new(|_ctx: &mut dyn ExecCtx, _off: u64, size: AccessSize| {
        if size != AccessSize::Word {
            log::warn!("status: invalid register read size {}", size.bytes());
        }
        0
    });
    let write = Box::new(|_ctx: &mut dyn ExecCtx, _off: u64, size: AccessSize, val: u32| {
        if size != AccessSize::Word {
            log::warn!("status: invalid register write size {}", size.bytes());
            return;
        }
        if val & STS_X86_VALID != 0 {
            log_post_code(true, val);
        }
    });
    let x86 = iom.x86_mmio_register(X86_PORT80_ADDR, 4, Some(read), Some(write))?;

    Ok(DeviceInstance::new(&DEVICE, vec![mmio, x86]))
}
