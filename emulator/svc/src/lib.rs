/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    Emulated supervisor call interface of the PSP, including the proxy
    bridge to a real PSP and the cached x86 memory mappings.

--*/

mod mapping;
mod proxy;
mod state;

pub use mapping::X86CachedMapping;
pub use proxy::{NullProxy, ProxyClient, ProxyError};
pub use state::{read_guest_cstring, svc_immediate, SvcState};

/// Syscall numbers of the supervisor interface (only the named ones).
pub mod svc_id {
    pub const SVC_APP_EXIT: u32 = 0x00;
    pub const SVC_APP_INIT: u32 = 0x01;
    pub const SVC_SMN_MAP_EX: u32 = 0x03;
    pub const SVC_SMN_MAP: u32 = 0x04;
    pub const SVC_SMN_UNMAP: u32 = 0x05;
    pub const SVC_DBG_LOG: u32 = 0x06;
    pub const SVC_X86_MEM_MAP: u32 = 0x07;
    pub const SVC_X86_MEM_UNMAP: u32 = 0x08;
    pub const SVC_X86_COPY_TO_PSP: u32 = 0x09;
    pub const SVC_X86_COPY_FROM_PSP: u32 = 0x0a;
    pub const SVC_X86_MEM_MAP_EX: u32 = 0x25;
    pub const SVC_SMU_MSG: u32 = 0x28;
    pub const SVC_RNG: u32 = 0x39;
    pub const SVC_QUERY_SAVE_STATE_REGION: u32 = 0x3c;
    pub const SVC_ECC_CURVE_OP: u32 = 0x41;
    pub const SVC_QUERY_FUSES: u32 = 0x42;
    pub const SVC_QUERY_SMM_REGION: u32 = 0x48;
}
