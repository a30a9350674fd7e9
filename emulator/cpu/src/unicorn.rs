/*++

Licensed under the Apache-2.0 license.

File Name:

    unicorn.rs

Abstract:

    ArmExecutor backend on top of the unicorn engine.

--*/

use crate::executor::{
    ArmExecutor, CoreError, CoreReg, ExecCtx, IntrHook, MmioReadHook, MmioWriteHook, StopReason,
};
use pspemu_types::{AccessSize, PspAddr};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use unicorn_engine::unicorn_const::{uc_error, Arch, Mode, Permission};
use unicorn_engine::{RegisterARM, Unicorn};

const PAGE_LEN: usize = 4096;

fn align_up_page(len: usize) -> usize {
    (len + PAGE_LEN - 1) & !(PAGE_LEN - 1)
}

fn uc_reg(reg: CoreReg) -> Result<RegisterARM, CoreError> {
    Ok(match reg {
        CoreReg::Invalid => return Err(CoreError::InvalidRegister),
        CoreReg::R0 => RegisterARM::R0,
        CoreReg::R1 => RegisterARM::R1,
        CoreReg::R2 => RegisterARM::R2,
        CoreReg::R3 => RegisterARM::R3,
        CoreReg::R4 => RegisterARM::R4,
        CoreReg::R5 => RegisterARM::R5,
        CoreReg::R6 => RegisterARM::R6,
        CoreReg::R7 => RegisterARM::R7,
        CoreReg::R8 => RegisterARM::R8,
        CoreReg::R9 => RegisterARM::R9,
        CoreReg::R10 => RegisterARM::R10,
        CoreReg::R11 => RegisterARM::R11,
        CoreReg::R12 => RegisterARM::R12,
        CoreReg::Sp => RegisterARM::SP,
        CoreReg::Lr => RegisterARM::LR,
        CoreReg::Pc => RegisterARM::PC,
    })
}

fn uc_err(err: uc_error) -> CoreError {
    CoreError::Executor(format!("{:?}", err))
}

/// Hook view over the running unicorn instance.
struct UcCtx<'u, 'uc> {
    uc: &'u mut Unicorn<'uc, ()>,
    stop: Rc<Cell<bool>>,
}

impl ExecCtx for UcCtx<'_, '_> {
    fn reg_read(&mut self, reg: CoreReg) -> Result<u32, CoreError> {
        Ok(self.uc.reg_read(uc_reg(reg)?).map_err(uc_err)? as u32)
    }

    fn reg_write(&mut self, reg: CoreReg, val: u32) -> Result<(), CoreError> {
        self.uc.reg_write(uc_reg(reg)?, val as u64).map_err(uc_err)
    }

    fn mem_read(&mut self, addr: PspAddr, buf: &mut [u8]) -> Result<(), CoreError> {
        let len = buf.len();
        self.uc
            .mem_read(addr as u64, buf)
            .map_err(|_| CoreError::MemoryAccess { addr, len })
    }

    fn mem_write(&mut self, addr: PspAddr, data: &[u8]) -> Result<(), CoreError> {
        self.uc
            .mem_write(addr as u64, data)
            .map_err(|_| CoreError::MemoryAccess {
                addr,
                len: data.len(),
            })
    }

    fn map_ram(&mut self, base: PspAddr, len: usize) -> Result<(), CoreError> {
        self.uc
            .mem_map(base as u64, align_up_page(len), Permission::ALL)
            .map_err(|_| CoreError::RegionOverlap { base, len })
    }

    fn request_stop(&mut self) {
        self.stop.set(true);
        if let Err(err) = self.uc.emu_stop() {
            log::error!("stopping the engine failed: {:?}", err);
        }
    }
}

/// ArmExecutor implementation backed by unicorn in ARM mode.
pub struct UnicornExecutor {
    uc: Unicorn<'static, ()>,
    stop: Rc<Cell<bool>>,
    /// Replaceable interrupt hook; the engine-level hook is installed once.
    intr: Rc<RefCell<Option<IntrHook>>>,
    intr_registered: bool,
}

impl UnicornExecutor {
    pub fn new() -> Result<Self, CoreError> {
        let uc = Unicorn::new(Arch::ARM, Mode::ARM)
            .map_err(|err| CoreError::ExecutorInit(format!("{:?}", err)))?;
        Ok(Self {
            uc,
            stop: Rc::new(Cell::new(false)),
            intr: Rc::new(RefCell::new(None)),
            intr_registered: false,
        })
    }
}

impl ArmExecutor for UnicornExecutor {
    fn map_ram(&mut self, base: PspAddr, len: usize) -> Result<(), CoreError> {
        self.uc
            .mem_map(base as u64, align_up_page(len), Permission::ALL)
            .map_err(|_| CoreError::RegionOverlap { base, len })
    }

    fn unmap(&mut self, base: PspAddr, len: usize) -> Result<(), CoreError> {
        self.uc
            .mem_unmap(base as u64, align_up_page(len))
            .map_err(|_| CoreError::RegionNotFound)
    }

    fn map_mmio(
        &mut self,
        base: PspAddr,
        len: usize,
        mut read: MmioReadHook,
        mut write: MmioWriteHook,
    ) -> Result<(), CoreError> {
        let stop_rd = self.stop.clone();
        let stop_wr = self.stop.clone();

        // The engine may issue 64-bit accesses; devices only support up to
        // word width, so those get split into two word halves here.
        let rd = move |uc: &mut Unicorn<'_, ()>, off: u64, size: usize| -> u64 {
            let mut ctx = UcCtx {
                uc,
                stop: stop_rd.clone(),
            };
            match AccessSize::from_bytes(size) {
                Some(AccessSize::DoubleWord) => {
                    let lo = read(&mut ctx, off, AccessSize::Word) as u64;
                    let hi = read(&mut ctx, off + 4, AccessSize::Word) as u64;
                    hi << 32 | lo
                }
                Some(size) => read(&mut ctx, off, size) as u64,
                None => {
                    log::error!("unsupported MMIO read width {} at {:#x}", size, off);
                    0
                }
            }
        };
        let wr = move |uc: &mut Unicorn<'_, ()>, off: u64, size: usize, val: u64| {
            let mut ctx = UcCtx {
                uc,
                stop: stop_wr.clone(),
            };
            match AccessSize::from_bytes(size) {
                Some(AccessSize::DoubleWord) => {
                    write(&mut ctx, off, AccessSize::Word, val as u32);
                    write(&mut ctx, off + 4, AccessSize::Word, (val >> 32) as u32);
                }
                Some(size) => write(&mut ctx, off, size, val as u32),
                None => {
                    log::error!("unsupported MMIO write width {} at {:#x}", size, off);
                }
            }
        };

        self.uc
            .mmio_map(base as u64, align_up_page(len), Some(rd), Some(wr))
            .map_err(|_| CoreError::RegionOverlap { base, len })
    }

    fn reg_read(&mut self, reg: CoreReg) -> Result<u32, CoreError> {
        Ok(self.uc.reg_read(uc_reg(reg)?).map_err(uc_err)? as u32)
    }

    fn reg_write(&mut self, reg: CoreReg, val: u32) -> Result<(), CoreError> {
        self.uc.reg_write(uc_reg(reg)?, val as u64).map_err(uc_err)
    }

    fn mem_read(&mut self, addr: PspAddr, buf: &mut [u8]) -> Result<(), CoreError> {
        let len = buf.len();
        self.uc
            .mem_read(addr as u64, buf)
            .map_err(|_| CoreError::MemoryAccess { addr, len })
    }

    fn mem_write(&mut self, addr: PspAddr, data: &[u8]) -> Result<(), CoreError> {
        self.uc
            .mem_write(addr as u64, data)
            .map_err(|_| CoreError::MemoryAccess {
                addr,
                len: data.len(),
            })
    }

    fn set_intr_hook(&mut self, hook: IntrHook) -> Result<(), CoreError> {
        *self.intr.borrow_mut() = Some(hook);
        if !self.intr_registered {
            let intr = self.intr.clone();
            let stop = self.stop.clone();
            self.uc
                .add_intr_hook(move |uc, intno| {
                    if let Some(hook) = intr.borrow_mut().as_mut() {
                        let mut ctx = UcCtx {
                            uc,
                            stop: stop.clone(),
                        };
                        hook(&mut ctx, intno);
                    }
                })
                .map_err(uc_err)?;
            self.intr_registered = true;
        }
        Ok(())
    }

    fn emu_start(
        &mut self,
        start: PspAddr,
        insn_limit: u64,
        ms_timeout: u64,
    ) -> Result<StopReason, CoreError> {
        self.stop.set(false);
        self.uc
            .emu_start(
                start as u64,
                0xffff_ffff,
                ms_timeout * 1000,
                insn_limit as usize,
            )
            .map_err(uc_err)?;
        Ok(if self.stop.get() {
            StopReason::Stopped
        } else {
            StopReason::Completed
        })
    }

    fn emu_stop(&mut self) -> Result<(), CoreError> {
        self.stop.set(true);
        self.uc.emu_stop().map_err(uc_err)
    }
}
