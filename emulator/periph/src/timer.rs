/*++

Licensed under the Apache-2.0 license.

File Name:

    timer.rs

Abstract:

    Timer device at 0x03010424 with a 100MHz counter.

--*/

use crate::{DeviceCtx, DeviceDescriptor, DeviceError, DeviceInstance};
use pspemu_bus::IoManager;
use pspemu_cpu::ExecCtx;
use pspemu_types::{AccessSize, PspAddr};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

const MMIO_BASE: PspAddr = 0x0301_0424;
const MMIO_LEN: u64 = 36;

const REG_CTRL: u64 = 0;
const REG_CNT_100MHZ: u64 = 32;

/// Could be the enable bit, 0x100 is another candidate.
const CTRL_ENABLE: u32 = 0x1;

struct Timer {
    reg_ctrl: u32,
    reg_cnt_100mhz: u32,
    /// Wall-clock epoch when ticking in real time.
    epoch: Option<Instant>,
}

impl Timer {
    fn count(&mut self) -> u32 {
        match self.epoch {
            Some(epoch) => {
                if self.reg_ctrl & CTRL_ENABLE != 0 {
                    // 100MHz ticks since the counter was enabled.
                    self.reg_cnt_100mhz =
                        (epoch.elapsed().as_nanos() / 10) as u32;
                }
                self.reg_cnt_100mhz
            }
            None => {
                let val = self.reg_cnt_100mhz;
                if self.reg_ctrl & CTRL_ENABLE != 0 {
                    self.reg_cnt_100mhz = self.reg_cnt_100mhz.wrapping_add(1);
                }
                val
            }
        }
    }
}

pub static DEVICE: DeviceDescriptor = DeviceDescriptor {
    name: "timer",
    description: "Timer device starting at 0x03010424",
    instantiate,
};

fn instantiate(iom: &mut IoManager, ctx: &DeviceCtx) -> Result<DeviceInstance, DeviceError> {
    let timer = Rc::new(RefCell::new(Timer {
        reg_ctrl: 0,
        reg_cnt_100mhz: 0,
        epoch: ctx.timer_realtime.then(Instant::now),
    }));

    let dev = timer.clone();
    let read = Box::new(move |_ctx: &mut dyn ExecCtx, off: u64, size: AccessSize| {
        if size != AccessSize::Word {
            log::warn!("timer: unsupported access width {}", size.bytes());
            return 0;
        }
        let mut dev = dev.borrow_mut();
        match off {
            REG_CTRL => dev.reg_ctrl,
            REG_CNT_100MHZ => dev.count(),
            _ => 0,
        }
    });
    let dev = timer;
    let write = Box::new(move |_ctx: &mut dyn ExecCtx, off: u64, size: AccessSize, val: u32| {
        if size != AccessSize::Word {
            log::warn!("timer: unsupported access width {}", size.bytes());
            return;
        }
        let mut dev = dev.borrow_mut();
        match off {
            REG_CTRL => dev.reg_ctrl = val,
            REG_CNT_100MHZ => dev.reg_cnt_100mhz = val,
            _ => {}
        }
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

    fn reg_off(reg: u64) -> u64 {
        (MMIO_BASE - MMIO_WINDOW_BASE) as u64 + reg
    }

    #[test]
    fn test_counter_ticks_when_enabled() {
        let iom = IoManager::detached(UnassignedPolicy::ZeroRead).unwrap();
        let ctx = DeviceCtx::new(pspemu_types::MicroArch::Zen, Vec::new());
        instantiate(&mut iom.borrow_mut(), &ctx).unwrap();
        let mut state = ExecState::default();

        // Disabled: reads do not advance the counter.
        let a = IoManager::mmio_window_read(
            &iom,
            &mut TestCtx(&mut state),
            reg_off(REG_CNT_100MHZ),
            AccessSize::Word,
        );
        let b = IoManager::mmio_window_read(
            &iom,
            &mut TestCtx(&mut state),
            reg_off(REG_CNT_100MHZ),
            AccessSize::Word,
        );
        assert_eq!(a, 0);
        assert_eq!(b, 0);

        // Enable and observe the counter move.
        IoManager::mmio_window_write(
            &iom,
            &mut TestCtx(&mut state),
            reg_off(REG_CTRL),
            AccessSize::Word,
            CTRL_ENABLE,
        );
        let a = IoManager::mmio_window_read(
            &iom,
            &mut TestCtx(&mut state),
            reg_off(REG_CNT_100MHZ),
            AccessSize::Word,
        );
        let b = IoManager::mmio_window_read(
            &iom,
            &mut TestCtx(&mut state),
            reg_off(REG_CNT_100MHZ),
            AccessSize::Word,
        );
        assert_eq!(b, a + 1);
    }
}
