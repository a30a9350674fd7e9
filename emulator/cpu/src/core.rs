/*++

Licensed under the Apache-2.0 license.

File Name:

    core.rs

Abstract:

    A single emulated PSP core on top of the ArmExecutor abstraction.

--*/

use crate::executor::{
    ArmExecutor, CoreError, CoreReg, IntrHook, MmioReadHook, MmioWriteHook, StopReason,
};
use crate::unicorn::UnicornExecutor;
use pspemu_types::{EmuMode, PspAddr, PSP_ON_CHIP_BL_ADDR};

/// A single PSP core executing.
pub struct PspCore {
    mode: EmuMode,
    exec: Box<dyn ArmExecutor>,
    sram_len: u32,
    ccd_id: u32,
    /// The next address to execute instructions from.
    exec_next: PspAddr,
}

impl PspCore {
    /// Creates a core with the default engine; SRAM is mapped R/W at
    /// address 0.
    pub fn new(mode: EmuMode, sram_len: u32) -> Result<Self, CoreError> {
        Self::with_executor(mode, sram_len, Box::new(UnicornExecutor::new()?))
    }

    /// Creates a core on a caller-provided engine (tests, embedders).
    pub fn with_executor(
        mode: EmuMode,
        sram_len: u32,
        mut exec: Box<dyn ArmExecutor>,
    ) -> Result<Self, CoreError> {
        exec.map_ram(0, sram_len as usize)?;
        Ok(Self {
            mode,
            exec,
            sram_len,
            ccd_id: 0,
            exec_next: 0,
        })
    }

    pub fn mode(&self) -> EmuMode {
        self.mode
    }

    pub fn sram_len(&self) -> u32 {
        self.sram_len
    }

    pub fn set_ccd_id(&mut self, id: u32) {
        self.ccd_id = id;
    }

    pub fn ccd_id(&self) -> u32 {
        self.ccd_id
    }

    pub fn mem_read(&mut self, addr: PspAddr, buf: &mut [u8]) -> Result<(), CoreError> {
        self.exec.mem_read(addr, buf)
    }

    pub fn mem_write(&mut self, addr: PspAddr, data: &[u8]) -> Result<(), CoreError> {
        self.exec.mem_write(addr, data)
    }

    /// Adds a region of memory not initially backed on the real PSP (used by
    /// the emulated syscall interface for the stack mapping).
    pub fn mem_add_region(&mut self, base: PspAddr, len: usize) -> Result<(), CoreError> {
        self.exec.map_ram(base, len)
    }

    /// Initializes the on chip bootloader ROM region with the given image.
    pub fn set_on_chip_bl(&mut self, image: &[u8]) -> Result<(), CoreError> {
        self.exec.map_ram(PSP_ON_CHIP_BL_ADDR, image.len())?;
        self.exec.mem_write(PSP_ON_CHIP_BL_ADDR, image)
    }

    pub fn reg(&mut self, reg: CoreReg) -> Result<u32, CoreError> {
        self.exec.reg_read(reg)
    }

    pub fn set_reg(&mut self, reg: CoreReg, val: u32) -> Result<(), CoreError> {
        self.exec.reg_write(reg, val)
    }

    /// Sets the address the next `exec_run` starts from.
    pub fn exec_set_start_addr(&mut self, addr: PspAddr) {
        self.exec_next = addr;
    }

    /// Executes until a ceiling is hit, a fault occurs or a hook requests a
    /// stop. Zero ceilings mean unbounded. The next-execute address is
    /// refreshed from PC on the way out, so consecutive runs resume
    /// seamlessly.
    pub fn exec_run(&mut self, max_insns: u32, max_ms: u32) -> Result<StopReason, CoreError> {
        let res = self
            .exec
            .emu_start(self.exec_next, max_insns as u64, max_ms as u64);
        if let Ok(pc) = self.exec.reg_read(CoreReg::Pc) {
            self.exec_next = pc;
        }
        res
    }

    /// Cooperative cancellation from outside a run.
    pub fn exec_stop(&mut self) -> Result<(), CoreError> {
        self.exec.emu_stop()
    }

    /// Maps an MMIO window routed through the given hooks. Used by the I/O
    /// manager to claim its dispatch windows.
    pub fn mmio_register(
        &mut self,
        base: PspAddr,
        len: usize,
        read: MmioReadHook,
        write: MmioWriteHook,
    ) -> Result<(), CoreError> {
        self.exec.map_mmio(base, len, read, write)
    }

    pub fn mmio_deregister(&mut self, base: PspAddr, len: usize) -> Result<(), CoreError> {
        self.exec.unmap(base, len)
    }

    /// Installs the interrupt hook SVC traps are delivered through.
    pub fn set_intr_hook(&mut self, hook: IntrHook) -> Result<(), CoreError> {
        self.exec.set_intr_hook(hook)
    }

    /// Dumps the register file to the log.
    pub fn state_dump(&mut self) {
        let mut vals = [0u32; 16];
        for (idx, reg) in CoreReg::ALL.iter().enumerate() {
            vals[idx] = self.exec.reg_read(*reg).unwrap_or(0);
        }
        log::info!(
            "R0 > {:#010x} | R1 > {:#010x} | R2 > {:#010x} | R3 > {:#010x}",
            vals[0],
            vals[1],
            vals[2],
            vals[3]
        );
        log::info!(
            "R4 > {:#010x} | R5 > {:#010x} | R6 > {:#010x} | R7 > {:#010x}",
            vals[4],
            vals[5],
            vals[6],
            vals[7]
        );
        log::info!(
            "R8 > {:#010x} | R9 > {:#010x} | R10> {:#010x} | R11> {:#010x}",
            vals[8],
            vals[9],
            vals[10],
            vals[11]
        );
        log::info!(
            "R12> {:#010x} | SP > {:#010x} | LR > {:#010x} | PC > {:#010x}",
            vals[12],
            vals[13],
            vals[14],
            vals[15]
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{ScriptOp, ScriptedExecutor};
    use pspemu_types::AccessSize;

    fn app_core() -> PspCore {
        PspCore::with_executor(EmuMode::App, 256 * 1024, Box::new(ScriptedExecutor::new()))
            .unwrap()
    }

    #[test]
    fn test_reg_round_trip() {
        let mut core = app_core();
        for (idx, reg) in CoreReg::ALL.iter().enumerate() {
            core.set_reg(*reg, 0x1000 + idx as u32).unwrap();
        }
        for (idx, reg) in CoreReg::ALL.iter().enumerate() {
            assert_eq!(core.reg(*reg).unwrap(), 0x1000 + idx as u32);
        }
        assert!(core.reg(CoreReg::Invalid).is_err());
    }

    #[test]
    fn test_mem_round_trip() {
        let mut core = app_core();
        let data = [0xde, 0xad, 0xbe, 0xef];
        core.mem_write(0x1000, &data).unwrap();
        let mut buf = [0u8; 4];
        core.mem_read(0x1000, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn test_unmapped_access_fails() {
        let mut core = app_core();
        let mut buf = [0u8; 4];
        assert!(core.mem_read(0x8000_0000, &mut buf).is_err());
    }

    #[test]
    fn test_mem_add_region() {
        let mut core = app_core();
        let mut buf = [0u8; 4];
        assert!(core.mem_read(0x50000, &mut buf).is_err());
        core.mem_add_region(0x50000, 2 * 4096).unwrap();
        core.mem_write(0x50000, &[1, 2, 3, 4]).unwrap();
        core.mem_read(0x50000, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        // Overlapping the SRAM must fail.
        assert!(core.mem_add_region(0x1000, 4096).is_err());
    }

    #[test]
    fn test_ccd_id() {
        let mut core = app_core();
        assert_eq!(core.ccd_id(), 0);
        core.set_ccd_id(3);
        assert_eq!(core.ccd_id(), 3);
    }

    #[test]
    fn test_stop_from_device_callback() {
        // A device whose read callback requests a stop must end the run at
        // the current instruction boundary.
        let mut exec = Box::new(ScriptedExecutor::new());
        for _ in 0..4 {
            exec.push_op(ScriptOp::MmioRead {
                addr: 0x0301_0000,
                size: AccessSize::Word,
            });
        }
        let mut core = PspCore::with_executor(EmuMode::System, 256 * 1024, exec).unwrap();
        core.mmio_register(
            0x0301_0000,
            4096,
            Box::new(|ctx, _off, _size| {
                ctx.request_stop();
                0
            }),
            Box::new(|_ctx, _off, _size, _val| {}),
        )
        .unwrap();
        assert_eq!(core.exec_run(0, 0).unwrap(), StopReason::Stopped);
    }

    #[test]
    fn test_insn_ceiling() {
        let mut exec = Box::new(ScriptedExecutor::new());
        core_ops(&mut exec, 8);
        let mut core = PspCore::with_executor(EmuMode::System, 256 * 1024, exec).unwrap();
        assert_eq!(core.exec_run(3, 0).unwrap(), StopReason::Completed);
    }

    fn core_ops(exec: &mut ScriptedExecutor, count: usize) {
        for idx in 0..count {
            exec.push_op(ScriptOp::MmioWrite {
                addr: 0x100 + idx as u32 * 4,
                size: AccessSize::Word,
                val: idx as u32,
            });
        }
    }
}
