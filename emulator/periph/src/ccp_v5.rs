/*++

Licensed under the Apache-2.0 license.

File Name:

    ccp_v5.rs

Abstract:

    Stub for the CCPv5 crypto co-processor. Enough to let firmware observe
    an idle engine; real crypto never happens here.

--*/

use crate::{DeviceCtx, DeviceDescriptor, DeviceError, DeviceInstance};
use pspemu_bus::IoManager;
use pspemu_cpu::ExecCtx;
use pspemu_types::{AccessSize, PspAddr};

const MMIO_BASE: PspAddr = 0x0300_0000;
const MMIO_LEN: u64 = 2 * 4096;

/// Control register offset within the queue register block.
const REG_CTRL: u64 = 0x1000;

/// Halt bit of the control register.
const CTRL_HALT: u32 = 0x2;

pub static DEVICE: DeviceDescriptor = DeviceDescriptor {
    name: "ccp-v5",
    description: "CCPv5",
    instantiate,
};

fn instantiate(iom: &mut IoManager, _ctx: &DeviceCtx) -> Result<DeviceInstance, DeviceError> {
    let read = Box::new(|_ctx: &mut dyn ExecCtx, off: u64, size: AccessSize| {
        log::trace!("ccp-v5: read off={:#x} len={}", off, size.bytes());
        match off {
            REG_CTRL => CTRL_HALT,
            _ => 0,
        }
    });
    let write = Box::new(|_ctx: &mut dyn ExecCtx, off: u64, size: AccessSize, val: u32| {
        log::trace!(
            "ccp-v5: write off={:#x} len={} val={:#x}",
            off,
            size.bytes(),
            val
        );
    });
    let region = iom.mmio_register(MMIO_BASE, MMIO_LEN, Some(read), Some(write))?;
    Ok(DeviceInstance::new(&DEVICE, vec![region]))
}

#[cfg(test)]
mod test {
    use super::*;
    use pspemu_bus::UnassignedPolicy;
    use pspemu_cpu::testing::{ExecState, TestCtx};
    use pspemu_types::MMIO_WINDOW_BASE;

    #[test]
    fn test_halt_bit() {
        let iom = IoManager::detached(UnassignedPolicy::ZeroRead).unwrap();
        let ctx = DeviceCtx::new(pspemu_types::MicroArch::Zen, Vec::new());
        instantiate(&mut iom.borrow_mut(), &ctx).unwrap();

        let mut state = ExecState::default();
        let off = (MMIO_BASE - MMIO_WINDOW_BASE) as u64 + REG_CTRL;
        let val = IoManager::mmio_window_read(&iom, &mut TestCtx(&mut state), off, AccessSize::Word);
        assert_eq!(val, CTRL_HALT);
    }
}
