/*++

Licensed under the Apache-2.0 license.

File Name:

    executor.rs

Abstract:

    Narrow trait hiding the concrete ARM instruction engine, plus the hook
    view handed to MMIO and interrupt callbacks while the engine runs.

--*/

use pspemu_types::{AccessSize, PspAddr};
use thiserror::Error;

/// Errors surfaced by the executor and the core built on top of it.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("initializing the instruction engine failed: {0}")]
    ExecutorInit(String),

    /// Opaque failure of the underlying engine, preserved as text.
    #[error("instruction engine error: {0}")]
    Executor(String),

    #[error("guest memory access failed at {addr:#010x} ({len} bytes)")]
    MemoryAccess { addr: PspAddr, len: usize },

    #[error("region {base:#010x}+{len:#x} overlaps an existing mapping")]
    RegionOverlap { base: PspAddr, len: usize },

    #[error("no such region mapped")]
    RegionNotFound,

    #[error("the invalid register sentinel cannot be accessed")]
    InvalidRegister,
}

/// PSP core register file. Index 0 is the unused sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreReg {
    Invalid,
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    Sp,
    Lr,
    Pc,
}

impl CoreReg {
    /// All architecturally visible registers, in file order.
    pub const ALL: [CoreReg; 16] = [
        CoreReg::R0,
        CoreReg::R1,
        CoreReg::R2,
        CoreReg::R3,
        CoreReg::R4,
        CoreReg::R5,
        CoreReg::R6,
        CoreReg::R7,
        CoreReg::R8,
        CoreReg::R9,
        CoreReg::R10,
        CoreReg::R11,
        CoreReg::R12,
        CoreReg::Sp,
        CoreReg::Lr,
        CoreReg::Pc,
    ];
}

/// Why `emu_start` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A hook requested a cooperative stop.
    Stopped,
    /// The instruction or time ceiling was reached (or the engine ran dry).
    Completed,
}

/// View into the running engine handed to MMIO and interrupt hooks.
///
/// Hooks mutate core state exclusively through this view; they never see the
/// core itself, which is what makes recursive `exec_run` unrepresentable.
pub trait ExecCtx {
    fn reg_read(&mut self, reg: CoreReg) -> Result<u32, CoreError>;
    fn reg_write(&mut self, reg: CoreReg, val: u32) -> Result<(), CoreError>;
    fn mem_read(&mut self, addr: PspAddr, buf: &mut [u8]) -> Result<(), CoreError>;
    fn mem_write(&mut self, addr: PspAddr, data: &[u8]) -> Result<(), CoreError>;

    /// Adds a plain RAM region while the engine runs (svc 0x1 stack setup).
    fn map_ram(&mut self, base: PspAddr, len: usize) -> Result<(), CoreError>;

    /// Cooperative cancellation, honored at the next instruction boundary.
    fn request_stop(&mut self);
}

/// MMIO read hook: offset is relative to the mapped window.
pub type MmioReadHook = Box<dyn FnMut(&mut dyn ExecCtx, u64, AccessSize) -> u32>;

/// MMIO write hook, fire and forget.
pub type MmioWriteHook = Box<dyn FnMut(&mut dyn ExecCtx, u64, AccessSize, u32)>;

/// Interrupt hook, invoked with the engine interrupt number (SVC traps
/// surface as interrupt 2 on ARM).
pub type IntrHook = Box<dyn FnMut(&mut dyn ExecCtx, u32)>;

/// The black-box ARM instruction engine.
pub trait ArmExecutor {
    fn map_ram(&mut self, base: PspAddr, len: usize) -> Result<(), CoreError>;
    fn unmap(&mut self, base: PspAddr, len: usize) -> Result<(), CoreError>;
    fn map_mmio(
        &mut self,
        base: PspAddr,
        len: usize,
        read: MmioReadHook,
        write: MmioWriteHook,
    ) -> Result<(), CoreError>;

    fn reg_read(&mut self, reg: CoreReg) -> Result<u32, CoreError>;
    fn reg_write(&mut self, reg: CoreReg, val: u32) -> Result<(), CoreError>;
    fn mem_read(&mut self, addr: PspAddr, buf: &mut [u8]) -> Result<(), CoreError>;
    fn mem_write(&mut self, addr: PspAddr, data: &[u8]) -> Result<(), CoreError>;

    fn set_intr_hook(&mut self, hook: IntrHook) -> Result<(), CoreError>;

    /// Runs from `start`. A zero `insn_limit` or `ms_timeout` means
    /// unbounded.
    fn emu_start(
        &mut self,
        start: PspAddr,
        insn_limit: u64,
        ms_timeout: u64,
    ) -> Result<StopReason, CoreError>;

    fn emu_stop(&mut self) -> Result<(), CoreError>;
}
