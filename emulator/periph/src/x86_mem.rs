/*++

Licensed under the Apache-2.0 license.

File Name:

    x86_mem.rs

Abstract:

    Plain x86 DRAM so System mode firmware can use x86 windows without a
    proxy. Lazily allocated, zero filled.

--*/

use crate::{DeviceCtx, DeviceDescriptor, DeviceError, DeviceInstance};
use pspemu_bus::IoManager;
use pspemu_types::X86PhysAddr;

const DRAM_BASE: X86PhysAddr = 0;

/// 4 GiB of low memory.
const DRAM_LEN: u64 = 0x1_0000_0000;

pub static DEVICE: DeviceDescriptor = DeviceDescriptor {
    name: "x86-mem",
    description: "x86 DRAM",
    instantiate,
};

fn instantiate(iom: &mut IoManager, _ctx: &DeviceCtx) -> Result<DeviceInstance, DeviceError> {
    let region = iom.x86_mem_register(DRAM_BASE, DRAM_LEN, None)?;
    Ok(DeviceInstance::new(&DEVICE, vec![region]))
}

#[cfg(test)]
mod test {
    use super::*;
    use pspemu_bus::UnassignedPolicy;

    #[test]
    fn test_dram_round_trip() {
        let iom = IoManager::detached(UnassignedPolicy::ZeroRead).unwrap();
        let ctx = DeviceCtx::new(pspemu_types::MicroArch::Zen, Vec::new());
        let instance = instantiate(&mut iom.borrow_mut(), &ctx).unwrap();

        let handle = instance.regions.first().unwrap().clone();
        iom.borrow_mut()
            .x86_mem_write(&handle, 0x8000, &[1, 2, 3])
            .unwrap();
        let mut buf = [0u8; 3];
        iom.borrow_mut()
            .x86_mem_read(&handle, 0x8000, &mut buf)
            .unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }
}
