/*++

Licensed under the Apache-2.0 license.

File Name:

    proxy.rs

Abstract:

    Client interface for forwarding syscalls and memory accesses to a real
    PSP. The concrete wire transport lives outside this crate.

--*/

use pspemu_types::PspAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no proxy connection configured")]
    NotConnected,

    #[error("proxy transport failed: {0}")]
    Transport(String),
}

/// Connection to a real PSP. These are the only egress operations of the
/// SVC layer.
pub trait ProxyClient {
    /// Executes a syscall on the proxied PSP and returns its output value.
    fn svc_call(
        &mut self,
        idx: u32,
        r0: u32,
        r1: u32,
        r2: u32,
        r3: u32,
    ) -> Result<u32, ProxyError>;

    /// Reads memory of the proxied PSP.
    fn mem_read(&mut self, addr: PspAddr, buf: &mut [u8]) -> Result<(), ProxyError>;

    /// Writes memory of the proxied PSP.
    fn mem_write(&mut self, addr: PspAddr, data: &[u8]) -> Result<(), ProxyError>;
}

/// Stand-in when no proxy is configured; every operation fails, which the
/// dispatcher lowers to the general memory error in R0.
pub struct NullProxy;

impl ProxyClient for NullProxy {
    fn svc_call(
        &mut self,
        _idx: u32,
        _r0: u32,
        _r1: u32,
        _r2: u32,
        _r3: u32,
    ) -> Result<u32, ProxyError> {
        Err(ProxyError::NotConnected)
    }

    fn mem_read(&mut self, _addr: PspAddr, _buf: &mut [u8]) -> Result<(), ProxyError> {
        Err(ProxyError::NotConnected)
    }

    fn mem_write(&mut self, _addr: PspAddr, _data: &[u8]) -> Result<(), ProxyError> {
        Err(ProxyError::NotConnected)
    }
}
