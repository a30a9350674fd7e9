/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    ARM executor abstraction and the emulated PSP core.

--*/

mod core;
mod executor;
pub mod testing;
mod unicorn;

pub use crate::core::PspCore;
pub use executor::{
    ArmExecutor, CoreError, CoreReg, ExecCtx, IntrHook, MmioReadHook, MmioWriteHook, StopReason,
};
pub use unicorn::UnicornExecutor;
