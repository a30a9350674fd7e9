/*++

Licensed under the Apache-2.0 license.

File Name:

    testing.rs

Abstract:

    Scripted ArmExecutor backend so the layers above the core can be tested
    without the real instruction engine.

--*/

use crate::executor::{
    ArmExecutor, CoreError, CoreReg, ExecCtx, IntrHook, MmioReadHook, MmioWriteHook, StopReason,
};
use pspemu_types::{AccessSize, PspAddr};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// One scripted "instruction".
#[derive(Debug, Clone)]
pub enum ScriptOp {
    /// Load from an MMIO window (or RAM).
    MmioRead { addr: PspAddr, size: AccessSize },
    /// Store to an MMIO window (or RAM).
    MmioWrite {
        addr: PspAddr,
        size: AccessSize,
        val: u32,
    },
    /// A Thumb `svc #imm` at the given address.
    Svc { at: PspAddr, imm: u8 },
}

struct Ram {
    base: PspAddr,
    data: Vec<u8>,
}

/// Register file and memory of the scripted engine, doubling as the
/// `ExecCtx` backing for tests of device callbacks and SVC handlers.
#[derive(Default)]
pub struct ExecState {
    regs: [u32; 17],
    rams: Vec<Ram>,
    stop: bool,
}

impl ExecState {
    fn reg_index(reg: CoreReg) -> Result<usize, CoreError> {
        match reg {
            CoreReg::Invalid => Err(CoreError::InvalidRegister),
            reg => Ok(reg as usize),
        }
    }

    pub fn reg(&self, reg: CoreReg) -> u32 {
        self.regs[reg as usize]
    }

    pub fn set_reg(&mut self, reg: CoreReg, val: u32) {
        self.regs[reg as usize] = val;
    }

    pub fn add_ram(&mut self, base: PspAddr, len: usize) -> Result<(), CoreError> {
        let end = base as u64 + len as u64;
        for ram in &self.rams {
            let ram_end = ram.base as u64 + ram.data.len() as u64;
            if (base as u64) < ram_end && (ram.base as u64) < end {
                return Err(CoreError::RegionOverlap { base, len });
            }
        }
        self.rams.push(Ram {
            base,
            data: vec![0; len],
        });
        Ok(())
    }

    pub fn read(&self, addr: PspAddr, buf: &mut [u8]) -> Result<(), CoreError> {
        let ram = self.find(addr, buf.len())?;
        let off = (addr - ram.base) as usize;
        buf.copy_from_slice(&ram.data[off..off + buf.len()]);
        Ok(())
    }

    pub fn write(&mut self, addr: PspAddr, data: &[u8]) -> Result<(), CoreError> {
        let len = data.len();
        let ram = self
            .rams
            .iter_mut()
            .find(|ram| {
                addr >= ram.base && addr as u64 + len as u64 <= ram.base as u64 + ram.data.len() as u64
            })
            .ok_or(CoreError::MemoryAccess { addr, len })?;
        let off = (addr - ram.base) as usize;
        ram.data[off..off + len].copy_from_slice(data);
        Ok(())
    }

    fn find(&self, addr: PspAddr, len: usize) -> Result<&Ram, CoreError> {
        self.rams
            .iter()
            .find(|ram| {
                addr >= ram.base && addr as u64 + len as u64 <= ram.base as u64 + ram.data.len() as u64
            })
            .ok_or(CoreError::MemoryAccess { addr, len })
    }

    pub fn stop_requested(&self) -> bool {
        self.stop
    }
}

/// `ExecCtx` over a bare `ExecState`, for tests that drive callbacks
/// directly without an engine run.
pub struct TestCtx<'a>(pub &'a mut ExecState);

impl ExecCtx for TestCtx<'_> {
    fn reg_read(&mut self, reg: CoreReg) -> Result<u32, CoreError> {
        ExecState::reg_index(reg).map(|idx| self.0.regs[idx])
    }

    fn reg_write(&mut self, reg: CoreReg, val: u32) -> Result<(), CoreError> {
        let idx = ExecState::reg_index(reg)?;
        self.0.regs[idx] = val;
        Ok(())
    }

    fn mem_read(&mut self, addr: PspAddr, buf: &mut [u8]) -> Result<(), CoreError> {
        self.0.read(addr, buf)
    }

    fn mem_write(&mut self, addr: PspAddr, data: &[u8]) -> Result<(), CoreError> {
        self.0.write(addr, data)
    }

    fn map_ram(&mut self, base: PspAddr, len: usize) -> Result<(), CoreError> {
        self.0.add_ram(base, len)
    }

    fn request_stop(&mut self) {
        self.0.stop = true;
    }
}

struct Window {
    base: PspAddr,
    len: usize,
    read: MmioReadHook,
    write: MmioWriteHook,
}

/// Scripted engine: `emu_start` drains the queued operations, honoring the
/// instruction ceiling and cooperative stop exactly like the real engine.
#[derive(Default)]
pub struct ScriptedExecutor {
    pub state: ExecState,
    windows: Vec<Window>,
    intr: Option<IntrHook>,
    script: VecDeque<ScriptOp>,
    /// Operations retired across all runs.
    pub retired: u64,
    /// Values produced by scripted MMIO reads, observable after the
    /// executor moved into a core.
    read_log: Rc<RefCell<Vec<(PspAddr, u32)>>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_op(&mut self, op: ScriptOp) {
        self.script.push_back(op);
    }

    pub fn script_remaining(&self) -> usize {
        self.script.len()
    }

    pub fn read_log_handle(&self) -> Rc<RefCell<Vec<(PspAddr, u32)>>> {
        self.read_log.clone()
    }

    fn dispatch(&mut self, op: ScriptOp) -> Result<(), CoreError> {
        match op {
            ScriptOp::MmioRead { addr, size } => {
                if let Some(win) = self
                    .windows
                    .iter_mut()
                    .find(|win| addr >= win.base && (addr as u64) < win.base as u64 + win.len as u64)
                {
                    let off = (addr - win.base) as u64;
                    let val = (win.read)(&mut TestCtx(&mut self.state), off, size);
                    self.read_log.borrow_mut().push((addr, val));
                } else {
                    let mut buf = vec![0; size.bytes()];
                    self.state.read(addr, &mut buf)?;
                }
            }
            ScriptOp::MmioWrite { addr, size, val } => {
                if let Some(win) = self
                    .windows
                    .iter_mut()
                    .find(|win| addr >= win.base && (addr as u64) < win.base as u64 + win.len as u64)
                {
                    let off = (addr - win.base) as u64;
                    (win.write)(&mut TestCtx(&mut self.state), off, size, val);
                } else {
                    let bytes = val.to_le_bytes();
                    self.state.write(addr, &bytes[..size.bytes()])?;
                }
            }
            ScriptOp::Svc { at, imm } => {
                // Thumb encoding so the interrupt hook can recover the
                // immediate from memory, like on the real engine.
                let insn: u16 = 0xdf00 | imm as u16;
                self.state.write(at, &insn.to_le_bytes())?;
                self.state.set_reg(CoreReg::Pc, at.wrapping_add(2));
                if let Some(hook) = self.intr.as_mut() {
                    hook(&mut TestCtx(&mut self.state), 2);
                }
            }
        }
        Ok(())
    }
}

impl ArmExecutor for ScriptedExecutor {
    fn map_ram(&mut self, base: PspAddr, len: usize) -> Result<(), CoreError> {
        self.state.add_ram(base, len)
    }

    fn unmap(&mut self, base: PspAddr, _len: usize) -> Result<(), CoreError> {
        if let Some(idx) = self.windows.iter().position(|win| win.base == base) {
            self.windows.remove(idx);
            return Ok(());
        }
        if let Some(idx) = self.state.rams.iter().position(|ram| ram.base == base) {
            self.state.rams.remove(idx);
            return Ok(());
        }
        Err(CoreError::RegionNotFound)
    }

    fn map_mmio(
        &mut self,
        base: PspAddr,
        len: usize,
        read: MmioReadHook,
        write: MmioWriteHook,
    ) -> Result<(), CoreError> {
        if self
            .windows
            .iter()
            .any(|win| {
                (base as u64) < win.base as u64 + win.len as u64
                    && (win.base as u64) < base as u64 + len as u64
            })
        {
            return Err(CoreError::RegionOverlap { base, len });
        }
        self.windows.push(Window {
            base,
            len,
            read,
            write,
        });
        Ok(())
    }

    fn reg_read(&mut self, reg: CoreReg) -> Result<u32, CoreError> {
        ExecState::reg_index(reg).map(|idx| self.state.regs[idx])
    }

    fn reg_write(&mut self, reg: CoreReg, val: u32) -> Result<(), CoreError> {
        let idx = ExecState::reg_index(reg)?;
        self.state.regs[idx] = val;
        Ok(())
    }

    fn mem_read(&mut self, addr: PspAddr, buf: &mut [u8]) -> Result<(), CoreError> {
        self.state.read(addr, buf)
    }

    fn mem_write(&mut self, addr: PspAddr, data: &[u8]) -> Result<(), CoreError> {
        self.state.write(addr, data)
    }

    fn set_intr_hook(&mut self, hook: IntrHook) -> Result<(), CoreError> {
        self.intr = Some(hook);
        Ok(())
    }

    fn emu_start(
        &mut self,
        start: PspAddr,
        insn_limit: u64,
        _ms_timeout: u64,
    ) -> Result<StopReason, CoreError> {
        self.state.set_reg(CoreReg::Pc, start);
        self.state.stop = false;
        let mut executed = 0u64;
        while let Some(op) = self.script.pop_front() {
            if insn_limit != 0 && executed >= insn_limit {
                self.script.push_front(op);
                break;
            }
            self.dispatch(op)?;
            executed += 1;
            self.retired += 1;
            if self.state.stop {
                return Ok(StopReason::Stopped);
            }
        }
        Ok(StopReason::Completed)
    }

    fn emu_stop(&mut self) -> Result<(), CoreError> {
        self.state.stop = true;
        Ok(())
    }
}
