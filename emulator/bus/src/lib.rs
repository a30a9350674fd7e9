/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    I/O manager for the PSP emulator.

--*/

mod iom;

pub use iom::{
    IoManager, IoReadFn, IoWriteFn, IomError, MemFetchFn, RegionHandle, UnassignedPolicy,
    X86MapCtrlSlot,
};
