/*++

Licensed under the Apache-2.0 license.

File Name:

    state.rs

Abstract:

    Emulated supervisor state: the syscall dispatcher table and every
    handler, forwarding through the proxy where the call cannot be served
    locally.

--*/

use crate::mapping::X86CachedMapping;
use crate::proxy::ProxyClient;
use crate::svc_id::*;
use pspemu_bus::{IoManager, IoReadFn, IoWriteFn, RegionHandle};
use pspemu_cpu::{CoreError, CoreReg, ExecCtx};
use pspemu_types::{
    PspAddr, PROXY_CURVE_AUX_SCRATCH_ADDR, PROXY_CURVE_SCRATCH_ADDR, PROXY_REQ_SCRATCH_ADDR,
    PROXY_SCRATCH_ADDR, PROXY_SCRATCH_ADDR_0X33, PROXY_SCRATCH_ADDR_2, PSP_APP_STACK_BASE,
    PSP_APP_STACK_LEN, PSP_APP_STACK_TOP, PSP_CURVE_CONST_ADDR, PSP_SVC_STACK_BASE,
    PSP_SVC_STACK_LEN, SVC_STATUS_GENERAL_MEMORY_ERROR, SVC_STATUS_SUCCESS, X86_MAPPING_SLOTS,
};
use std::cell::RefCell;
use std::rc::Rc;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Maximum length of a string logged through svc 0x6.
const DBG_LOG_MAX: usize = 512;

/// Syscall handler.
type SvcHandler = fn(&mut SvcState, &mut dyn ExecCtx, u32);

/// The syscall handler table. Null entries fail the call with the general
/// memory error.
const SVC_HANDLERS: [Option<SvcHandler>; 0x49] = [
    Some(svc_app_exit),               // 0x00: Application exit.
    Some(svc_app_init),               // 0x01: Initialize application stack.
    None,                             // 0x02: Load entry from flash.
    Some(svc_smn_map_ex),             // 0x03: Map SMN address into memory.
    Some(svc_smn_map),                // 0x04: Map SMN address into memory, extended version.
    Some(svc_smn_unmap),              // 0x05: Unmap previously mapped SMN address.
    Some(svc_dbg_log),                // 0x06: Debug log.
    Some(svc_x86_mem_map),            // 0x07: Map x86 memory address into PSP memory space.
    Some(svc_x86_mem_unmap),          // 0x08: Unmap previously mapped x86 memory address.
    Some(svc_x86_copy_to_psp),        // 0x09: Copy data from physical x86 memory space to PSP.
    Some(svc_x86_copy_from_psp),      // 0x0a: Write data from PSP to physical x86 memory space.
    None,                             // 0x0b: Invalidate/Clean memory.
    None,                             // 0x0c: Crypto request interfacing with CCP.
    None,                             // 0x0d: Unknown.
    None,                             // 0x0e: Unknown.
    None,                             // 0x0f: Unknown.
    None,                             // 0x10: Unknown.
    None,                             // 0x11:
    None,                             // 0x12:
    None,                             // 0x13:
    None,                             // 0x14:
    None,                             // 0x15:
    None,                             // 0x16:
    None,                             // 0x17:
    None,                             // 0x18:
    None,                             // 0x19:
    None,                             // 0x1a:
    None,                             // 0x1b:
    None,                             // 0x1c:
    None,                             // 0x1d:
    None,                             // 0x1e:
    None,                             // 0x1f:
    None,                             // 0x20:
    None,                             // 0x21:
    None,                             // 0x22:
    None,                             // 0x23:
    None,                             // 0x24:
    Some(svc_x86_mem_map_ex),         // 0x25: Map physical x86 memory into PSP address space.
    None,                             // 0x26:
    None,                             // 0x27:
    Some(svc_smu_msg),                // 0x28: Execute request on SMU.
    None,                             // 0x29:
    None,                             // 0x2a:
    None,                             // 0x2b:
    None,                             // 0x2c:
    None,                             // 0x2d:
    None,                             // 0x2e:
    None,                             // 0x2f:
    None,                             // 0x30:
    None,                             // 0x31:
    Some(svc_unk_0x32),               // 0x32:
    Some(svc_unk_0x33),               // 0x33:
    None,                             // 0x34:
    Some(svc_unk_0x35),               // 0x35:
    Some(svc_unk_0x36),               // 0x36:
    None,                             // 0x37:
    Some(svc_ccp_req_0x38),           // 0x38:
    Some(svc_rng),                    // 0x39:
    None,                             // 0x3a:
    None,                             // 0x3b:
    Some(svc_query_save_state_region), // 0x3c:
    None,                             // 0x3d:
    None,                             // 0x3e:
    None,                             // 0x3f:
    None,                             // 0x40:
    Some(svc_ecc_curve_op),           // 0x41:
    Some(svc_query_fuses),            // 0x42:
    None,                             // 0x43:
    None,                             // 0x44:
    None,                             // 0x45:
    None,                             // 0x46:
    None,                             // 0x47:
    Some(svc_query_smm_region),       // 0x48:
];

/// Emulated supervisor firmware state, one per App-mode core.
pub struct SvcState {
    iom: Rc<RefCell<IoManager>>,
    proxy: Rc<RefCell<dyn ProxyClient>>,
    /// Cached temporary x86 mappings, one per hardware slot.
    mappings: Vec<Rc<RefCell<X86CachedMapping>>>,
    /// Window regions registered for occupied slots.
    region_handles: Vec<Option<RegionHandle>>,
    /// The privileged DRAM mapping the SEV app state is saved to.
    priv_state: X86CachedMapping,
    /// Size of the state region, recorded by syscall 0x3c.
    state_region_size: u32,
    trace_svcs: bool,
}

impl SvcState {
    pub fn new(
        iom: Rc<RefCell<IoManager>>,
        proxy: Rc<RefCell<dyn ProxyClient>>,
        trace_svcs: bool,
    ) -> Self {
        Self {
            iom,
            proxy,
            mappings: (0..X86_MAPPING_SLOTS)
                .map(|_| Rc::new(RefCell::new(X86CachedMapping::free())))
                .collect(),
            region_handles: (0..X86_MAPPING_SLOTS).map(|_| None).collect(),
            priv_state: X86CachedMapping::free(),
            state_region_size: 0,
            trace_svcs,
        }
    }

    /// Dispatches one intercepted syscall.
    pub fn call(&mut self, ctx: &mut dyn ExecCtx, idx: u32) {
        if self.trace_svcs {
            log::info!(
                "svc {:#04x} (r0={:#x} r1={:#x} r2={:#x} r3={:#x})",
                idx,
                reg(ctx, CoreReg::R0),
                reg(ctx, CoreReg::R1),
                reg(ctx, CoreReg::R2),
                reg(ctx, CoreReg::R3)
            );
        }
        match SVC_HANDLERS.get(idx as usize).copied().flatten() {
            Some(handler) => handler(self, ctx, idx),
            None => {
                log::warn!("syscall {:#x} not implemented -> error", idx);
                set_r0(ctx, SVC_STATUS_GENERAL_MEMORY_ERROR);
            }
        }
        if self.trace_svcs {
            log::info!("svc {:#04x} -> r0={:#x}", idx, reg(ctx, CoreReg::R0));
        }
    }

    /// Whether a handler slot is populated.
    pub fn is_implemented(idx: u32) -> bool {
        SVC_HANDLERS
            .get(idx as usize)
            .copied()
            .flatten()
            .is_some()
    }

    /// The cached mapping slots, for inspection.
    pub fn mapping_slots(&self) -> &[Rc<RefCell<X86CachedMapping>>] {
        &self.mappings
    }

    /// Number of currently occupied mapping slots.
    pub fn allocated_slot_count(&self) -> usize {
        self.mappings
            .iter()
            .filter(|mapping| !mapping.borrow().is_free())
            .count()
    }
}

fn reg(ctx: &mut dyn ExecCtx, r: CoreReg) -> u32 {
    ctx.reg_read(r).unwrap_or(0)
}

fn set_r0(ctx: &mut dyn ExecCtx, val: u32) {
    if let Err(err) = ctx.reg_write(CoreReg::R0, val) {
        log::error!("writing R0 failed: {}", err);
    }
}

fn guest_read(ctx: &mut dyn ExecCtx, addr: PspAddr, len: usize) -> Result<Vec<u8>, CoreError> {
    let mut buf = vec![0u8; len];
    ctx.mem_read(addr, &mut buf)?;
    Ok(buf)
}

fn read_words<const N: usize>(
    ctx: &mut dyn ExecCtx,
    addr: PspAddr,
) -> Result<[u32; N], CoreError> {
    let buf = guest_read(ctx, addr, N * 4)?;
    let mut words = [0u32; N];
    for (word, chunk) in words.iter_mut().zip(buf.chunks_exact(4)) {
        *word = u32::from_le_bytes(chunk.try_into().unwrap());
    }
    Ok(words)
}

fn words_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|word| word.to_le_bytes()).collect()
}

/// Copies a guest buffer to a scratch address on the proxied PSP.
fn sync_to_proxy(
    proxy: &mut dyn ProxyClient,
    ctx: &mut dyn ExecCtx,
    guest: PspAddr,
    scratch: PspAddr,
    len: u32,
) -> Result<(), ()> {
    let buf = guest_read(ctx, guest, len as usize)
        .map_err(|err| log::error!("reading guest memory at {:#010x} failed: {}", guest, err))?;
    proxy
        .mem_write(scratch, &buf)
        .map_err(|err| log::error!("writing proxy memory at {:#010x} failed: {}", scratch, err))
}

/// Copies proxied PSP memory back into a guest buffer.
fn sync_from_proxy(
    proxy: &mut dyn ProxyClient,
    ctx: &mut dyn ExecCtx,
    scratch: PspAddr,
    guest: PspAddr,
    len: u32,
) -> Result<(), ()> {
    let mut buf = vec![0u8; len as usize];
    proxy
        .mem_read(scratch, &mut buf)
        .map_err(|err| log::error!("reading proxy memory at {:#010x} failed: {}", scratch, err))?;
    ctx.mem_write(guest, &buf)
        .map_err(|err| log::error!("writing guest memory at {:#010x} failed: {}", guest, err))
}

/// Reads the NUL terminated string svc 0x6 logs (termination is forced).
pub fn read_guest_cstring(ctx: &mut dyn ExecCtx, addr: PspAddr) -> String {
    let mut buf = [0u8; DBG_LOG_MAX];
    if let Err(err) = ctx.mem_read(addr, &mut buf) {
        log::error!("reading log string at {:#010x} failed: {}", addr, err);
        return String::new();
    }
    buf[DBG_LOG_MAX - 1] = 0;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(0);
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Extracts the SVC immediate from the instruction preceding PC, handling
/// both Thumb and ARM encodings.
pub fn svc_immediate(ctx: &mut dyn ExecCtx) -> Option<u32> {
    let pc = ctx.reg_read(CoreReg::Pc).ok()?;
    let mut half = [0u8; 2];
    if ctx.mem_read(pc.wrapping_sub(2), &mut half).is_ok() {
        let insn = u16::from_le_bytes(half);
        if insn >> 8 == 0xdf {
            return Some((insn & 0xff) as u32);
        }
    }
    let mut word = [0u8; 4];
    if ctx.mem_read(pc.wrapping_sub(4), &mut word).is_ok() {
        let insn = u32::from_le_bytes(word);
        if insn & 0x0f00_0000 == 0x0f00_0000 {
            return Some(insn & 0x00ff_ffff);
        }
    }
    None
}

fn svc_app_exit(s: &mut SvcState, ctx: &mut dyn ExecCtx, _idx: u32) {
    let addr = match s.proxy.borrow_mut().svc_call(
        SVC_QUERY_SAVE_STATE_REGION,
        s.state_region_size,
        0,
        0,
        0,
    ) {
        Ok(addr) => addr,
        Err(err) => {
            log::error!("querying the state buffer failed: {}", err);
            0
        }
    };

    // Flush the SEV app state back to privileged DRAM if it was mapped.
    if addr != 0 && !s.priv_state.is_free() && s.state_region_size != 0 {
        match guest_read(ctx, s.priv_state.psp_base, s.state_region_size as usize) {
            Ok(state) => {
                if let Err(err) = s.proxy.borrow_mut().mem_write(addr, &state) {
                    log::error!("syncing SEV state to privileged DRAM failed: {}", err);
                }
            }
            Err(err) => log::error!("reading the SEV state region failed: {}", err),
        }
    }

    log::info!("application exited");
    set_r0(ctx, SVC_STATUS_SUCCESS);
    ctx.request_stop();
}

fn svc_app_init(_s: &mut SvcState, ctx: &mut dyn ExecCtx, _idx: u32) {
    let usr_ptr_stack = reg(ctx, CoreReg::R2);
    let mut sts = SVC_STATUS_SUCCESS;

    if ctx
        .map_ram(PSP_APP_STACK_BASE, PSP_APP_STACK_LEN as usize)
        .is_err()
        || ctx
            .mem_write(usr_ptr_stack, &PSP_APP_STACK_TOP.to_le_bytes())
            .is_err()
    {
        sts = SVC_STATUS_GENERAL_MEMORY_ERROR;
    }
    set_r0(ctx, sts);
}

fn svc_smn_map_ex(s: &mut SvcState, ctx: &mut dyn ExecCtx, idx: u32) {
    let smn_addr = reg(ctx, CoreReg::R0);
    let ccd_tgt = reg(ctx, CoreReg::R1);
    log::debug!("mapping SMN address {:#x} on CCD {:#x}", smn_addr, ccd_tgt);
    let mapped = match s.proxy.borrow_mut().svc_call(idx, smn_addr, ccd_tgt, 0, 0) {
        Ok(mapped) => mapped,
        Err(err) => {
            log::error!("mapping SMN address failed: {}", err);
            0
        }
    };
    set_r0(ctx, mapped);
}

fn svc_smn_map(s: &mut SvcState, ctx: &mut dyn ExecCtx, idx: u32) {
    let smn_addr = reg(ctx, CoreReg::R0);
    log::debug!("mapping SMN address {:#x}", smn_addr);
    let mapped = match s.proxy.borrow_mut().svc_call(idx, smn_addr, 0, 0, 0) {
        Ok(mapped) => mapped,
        Err(err) => {
            log::error!("mapping SMN address failed: {}", err);
            0
        }
    };
    set_r0(ctx, mapped);
}

fn svc_smn_unmap(s: &mut SvcState, ctx: &mut dyn ExecCtx, idx: u32) {
    let addr = reg(ctx, CoreReg::R0);
    log::debug!("unmapping SMN address {:#x}", addr);
    let sts = match s.proxy.borrow_mut().svc_call(idx, addr, 0, 0, 0) {
        Ok(sts) => sts,
        Err(err) => {
            log::error!("unmapping SMN address failed: {}", err);
            SVC_STATUS_GENERAL_MEMORY_ERROR
        }
    };
    set_r0(ctx, sts);
}

fn svc_dbg_log(_s: &mut SvcState, ctx: &mut dyn ExecCtx, _idx: u32) {
    let addr = reg(ctx, CoreReg::R0);
    log::info!("PSP Log: {}", read_guest_cstring(ctx, addr));
}

/// Shared worker for syscalls 0x7 and 0x25: forward the mapping request,
/// occupy a slot and surface the window through the I/O manager.
fn x86_mem_map_worker(s: &mut SvcState, ctx: &mut dyn ExecCtx, idx: u32) {
    let phys_lo = reg(ctx, CoreReg::R0);
    let phys_hi = reg(ctx, CoreReg::R1);
    let mem_type = reg(ctx, CoreReg::R2);
    let phys = (phys_hi as u64) << 32 | phys_lo as u64;
    log::debug!("mapping x86 address {:#x} (memory target {})", phys, mem_type);

    let mut addr = match s
        .proxy
        .borrow_mut()
        .svc_call(idx, phys_lo, phys_hi, mem_type, 0)
    {
        Ok(addr) => addr,
        Err(err) => {
            log::error!("mapping x86 address failed: {}", err);
            0
        }
    };

    if addr != 0 {
        match s.mappings.iter().position(|m| m.borrow().is_free()) {
            Some(slot) => {
                s.mappings[slot].borrow_mut().map(phys, addr);
                let (base_4k, len_4k) = {
                    let mapping = s.mappings[slot].borrow();
                    (mapping.psp_base_4k, mapping.mapped_len_4k)
                };

                let mapping = s.mappings[slot].clone();
                let proxy = s.proxy.clone();
                let read: IoReadFn = Box::new(move |_ctx, off, size| {
                    mapping.borrow_mut().read(&mut *proxy.borrow_mut(), off, size)
                });
                let mapping = s.mappings[slot].clone();
                let proxy = s.proxy.clone();
                let write: IoWriteFn = Box::new(move |_ctx, off, size, val| {
                    mapping
                        .borrow_mut()
                        .write(&mut *proxy.borrow_mut(), off, size, val)
                });

                match s.iom.borrow_mut().x86_window_register(
                    base_4k,
                    len_4k as u64,
                    Some(read),
                    Some(write),
                ) {
                    Ok(handle) => s.region_handles[slot] = Some(handle),
                    Err(err) => {
                        log::error!("registering the x86 window failed: {}", err);
                        s.mappings[slot].borrow_mut().clear();
                        if let Err(err) =
                            s.proxy.borrow_mut().svc_call(SVC_X86_MEM_UNMAP, addr, 0, 0, 0)
                        {
                            log::error!("undoing the proxied mapping failed: {}", err);
                        }
                        addr = 0;
                    }
                }
            }
            None => {
                // The hardware has only eight slots, so the proxied PSP just
                // handed out a mapping we cannot track. Undo it.
                log::error!("ran out of x86 mapping slots");
                if let Err(err) = s.proxy.borrow_mut().svc_call(SVC_X86_MEM_UNMAP, addr, 0, 0, 0) {
                    log::error!("undoing the proxied mapping failed: {}", err);
                }
                addr = 0;
            }
        }
    }

    set_r0(ctx, addr);
}

fn svc_x86_mem_map(s: &mut SvcState, ctx: &mut dyn ExecCtx, idx: u32) {
    x86_mem_map_worker(s, ctx, idx);
}

fn svc_x86_mem_map_ex(s: &mut SvcState, ctx: &mut dyn ExecCtx, idx: u32) {
    x86_mem_map_worker(s, ctx, idx);
}

fn svc_x86_mem_unmap(s: &mut SvcState, ctx: &mut dyn ExecCtx, idx: u32) {
    let addr = reg(ctx, CoreReg::R0);
    log::debug!("unmapping x86 address mapped at {:#x}", addr);

    // Sync the cached mapping back before the real unmapping call.
    if let Some(slot) = s.mappings.iter().position(|m| {
        let mapping = m.borrow();
        !mapping.is_free() && mapping.psp_base == addr
    }) {
        {
            let mapping = s.mappings[slot].borrow();
            if let Err(err) = mapping.flush(&mut *s.proxy.borrow_mut()) {
                log::error!("writing back x86 mapping at {:#010x} failed: {}", addr, err);
            }
        }
        s.mappings[slot].borrow_mut().clear();
        if let Some(handle) = s.region_handles[slot].take() {
            if let Err(err) = s.iom.borrow_mut().deregister(&handle) {
                log::error!("removing the x86 window failed: {}", err);
            }
        }
    }

    let sts = match s.proxy.borrow_mut().svc_call(idx, addr, 0, 0, 0) {
        Ok(sts) => sts,
        Err(err) => {
            log::error!("unmapping x86 address failed: {}", err);
            SVC_STATUS_GENERAL_MEMORY_ERROR
        }
    };
    set_r0(ctx, sts);
}

fn svc_x86_copy_to_psp(s: &mut SvcState, ctx: &mut dyn ExecCtx, idx: u32) {
    let psp_dst = reg(ctx, CoreReg::R0);
    let phys_lo = reg(ctx, CoreReg::R1);
    let phys_hi = reg(ctx, CoreReg::R2);
    let len = reg(ctx, CoreReg::R3);

    let sts = match s
        .proxy
        .borrow_mut()
        .svc_call(idx, PROXY_SCRATCH_ADDR, phys_lo, phys_hi, len)
    {
        Ok(sts) => sts,
        Err(err) => {
            log::error!("copying from x86 memory failed: {}", err);
            SVC_STATUS_GENERAL_MEMORY_ERROR
        }
    };
    if sts == SVC_STATUS_SUCCESS {
        let mut proxy = s.proxy.borrow_mut();
        let _ = sync_from_proxy(&mut *proxy, ctx, PROXY_SCRATCH_ADDR, psp_dst, len);
    }
    set_r0(ctx, sts);
}

fn svc_x86_copy_from_psp(s: &mut SvcState, ctx: &mut dyn ExecCtx, idx: u32) {
    let psp_src = reg(ctx, CoreReg::R0);
    let phys_lo = reg(ctx, CoreReg::R1);
    let phys_hi = reg(ctx, CoreReg::R2);
    let len = reg(ctx, CoreReg::R3);

    let mut sts = SVC_STATUS_GENERAL_MEMORY_ERROR;
    let synced = {
        let mut proxy = s.proxy.borrow_mut();
        sync_to_proxy(&mut *proxy, ctx, psp_src, PROXY_SCRATCH_ADDR, len).is_ok()
    };
    if synced {
        sts = match s
            .proxy
            .borrow_mut()
            .svc_call(idx, PROXY_SCRATCH_ADDR, phys_lo, phys_hi, len)
        {
            Ok(sts) => sts,
            Err(err) => {
                log::error!("copying to x86 memory failed: {}", err);
                SVC_STATUS_GENERAL_MEMORY_ERROR
            }
        };
    }
    set_r0(ctx, sts);
}

fn svc_smu_msg(s: &mut SvcState, ctx: &mut dyn ExecCtx, idx: u32) {
    let msg_id = reg(ctx, CoreReg::R0);
    let arg0 = reg(ctx, CoreReg::R1);
    let usr_ptr_ret = reg(ctx, CoreReg::R2);

    let scratch = if usr_ptr_ret != 0 {
        PROXY_SCRATCH_ADDR
    } else {
        0
    };
    let sts = match s.proxy.borrow_mut().svc_call(idx, msg_id, arg0, scratch, 0) {
        Ok(sts) => sts,
        Err(err) => {
            log::error!("executing SMU request failed: {}", err);
            SVC_STATUS_GENERAL_MEMORY_ERROR
        }
    };

    if usr_ptr_ret != 0 {
        let mut proxy = s.proxy.borrow_mut();
        let _ = sync_from_proxy(&mut *proxy, ctx, PROXY_SCRATCH_ADDR, usr_ptr_ret, 4);
    }
    set_r0(ctx, sts);
}

/// Shared worker for the opaque blob syscalls 0x32 and 0x33: marshal the
/// guest buffer through a scratch address, forward, sync the result back.
fn blob_round_trip(s: &mut SvcState, ctx: &mut dyn ExecCtx, idx: u32, scratch: PspAddr) {
    let guest_addr = reg(ctx, CoreReg::R0);
    let len = reg(ctx, CoreReg::R1);

    let synced = {
        let mut proxy = s.proxy.borrow_mut();
        sync_to_proxy(&mut *proxy, ctx, guest_addr, scratch, len).is_ok()
    };
    let mut sts = SVC_STATUS_GENERAL_MEMORY_ERROR;
    if synced {
        sts = match s.proxy.borrow_mut().svc_call(idx, scratch, len, 0, 0) {
            Ok(sts) => sts,
            Err(err) => {
                log::error!("syscall {:#x} failed: {}", idx, err);
                SVC_STATUS_GENERAL_MEMORY_ERROR
            }
        };
        if sts == SVC_STATUS_SUCCESS {
            let mut proxy = s.proxy.borrow_mut();
            let _ = sync_from_proxy(&mut *proxy, ctx, scratch, guest_addr, len);
        }
    }
    set_r0(ctx, sts);
}

fn svc_unk_0x32(s: &mut SvcState, ctx: &mut dyn ExecCtx, idx: u32) {
    blob_round_trip(s, ctx, idx, PROXY_SCRATCH_ADDR);
}

fn svc_unk_0x33(s: &mut SvcState, ctx: &mut dyn ExecCtx, idx: u32) {
    blob_round_trip(s, ctx, idx, PROXY_SCRATCH_ADDR_0X33);
}

fn svc_unk_0x35(s: &mut SvcState, ctx: &mut dyn ExecCtx, idx: u32) {
    let req_addr = reg(ctx, CoreReg::R0);
    let req = match read_words::<8>(ctx, req_addr) {
        Ok(req) => req,
        Err(err) => {
            log::error!("reading the syscall 0x35 request failed: {}", err);
            set_r0(ctx, SVC_STATUS_GENERAL_MEMORY_ERROR);
            return;
        }
    };
    log::debug!("syscall 0x35 request: {:x?}", req);

    let mut sts = SVC_STATUS_GENERAL_MEMORY_ERROR;
    if req[2] == 0 && req[3] == 0 {
        let proxy1 = PROXY_SCRATCH_ADDR;
        let proxy2 = proxy1.wrapping_add(req[1]);
        let proxy3 = proxy2.wrapping_add(req[5]);

        let synced = {
            let mut proxy = s.proxy.borrow_mut();
            sync_to_proxy(&mut *proxy, ctx, req[0], proxy1, req[1]).is_ok()
                && sync_to_proxy(&mut *proxy, ctx, req[4], proxy2, req[5]).is_ok()
                && sync_to_proxy(&mut *proxy, ctx, req[6], proxy3, req[7]).is_ok()
                && proxy
                    .mem_write(
                        PROXY_REQ_SCRATCH_ADDR,
                        &words_bytes(&[
                            proxy1, req[1], req[2], req[3], proxy2, req[5], proxy3, req[7],
                        ]),
                    )
                    .is_ok()
        };
        if synced {
            sts = match s
                .proxy
                .borrow_mut()
                .svc_call(idx, PROXY_REQ_SCRATCH_ADDR, 0, 0, 0)
            {
                Ok(sts) => sts,
                Err(err) => {
                    log::error!("syscall 0x35 failed: {}", err);
                    SVC_STATUS_GENERAL_MEMORY_ERROR
                }
            };
            if sts == SVC_STATUS_SUCCESS {
                let mut proxy = s.proxy.borrow_mut();
                let _ = sync_from_proxy(&mut *proxy, ctx, proxy1, req[0], req[1]);
                let _ = sync_from_proxy(&mut *proxy, ctx, proxy2, req[4], req[5]);
                let _ = sync_from_proxy(&mut *proxy, ctx, proxy3, req[6], req[7]);
            }
        }
    } else {
        log::warn!("syscall 0x35 request variant not implemented");
    }
    set_r0(ctx, sts);
}

fn svc_unk_0x36(s: &mut SvcState, ctx: &mut dyn ExecCtx, idx: u32) {
    let req_addr = reg(ctx, CoreReg::R0);
    let req = match read_words::<13>(ctx, req_addr) {
        Ok(req) => req,
        Err(err) => {
            log::error!("reading the syscall 0x36 request failed: {}", err);
            set_r0(ctx, SVC_STATUS_GENERAL_MEMORY_ERROR);
            return;
        }
    };
    log::debug!("syscall 0x36 request: {:x?}", req);

    let proxy1 = PROXY_SCRATCH_ADDR;
    let proxy2 = proxy1.wrapping_add(req[1]);
    let proxy3 = proxy2.wrapping_add(req[3]);
    let proxy4 = proxy3.wrapping_add(req[6]);
    let req_proxy_addr = proxy4.wrapping_add(req[9]);

    let mut sts = SVC_STATUS_GENERAL_MEMORY_ERROR;
    let synced = {
        let mut proxy = s.proxy.borrow_mut();
        sync_to_proxy(&mut *proxy, ctx, req[0], proxy1, req[1]).is_ok()
            && sync_to_proxy(&mut *proxy, ctx, req[2], proxy2, req[3]).is_ok()
            && sync_to_proxy(&mut *proxy, ctx, req[5], proxy3, req[6]).is_ok()
            && sync_to_proxy(&mut *proxy, ctx, req[8], proxy4, req[9]).is_ok()
            && proxy
                .mem_write(
                    req_proxy_addr,
                    &words_bytes(&[
                        proxy1, req[1], proxy2, req[3], req[4], proxy3, req[6], req[7], proxy4,
                        req[9], req[10], req[11], req[12],
                    ]),
                )
                .is_ok()
    };
    if synced {
        sts = match s.proxy.borrow_mut().svc_call(idx, req_proxy_addr, 0, 0, 0) {
            Ok(sts) => sts,
            Err(err) => {
                log::error!("syscall 0x36 failed: {}", err);
                SVC_STATUS_GENERAL_MEMORY_ERROR
            }
        };
        if sts == SVC_STATUS_SUCCESS {
            let mut proxy = s.proxy.borrow_mut();
            let _ = sync_from_proxy(&mut *proxy, ctx, proxy1, req[0], req[1]);
            let _ = sync_from_proxy(&mut *proxy, ctx, proxy2, req[2], req[3]);
            let _ = sync_from_proxy(&mut *proxy, ctx, proxy3, req[5], req[6]);
            let _ = sync_from_proxy(&mut *proxy, ctx, proxy4, req[8], req[9]);
        }
    }
    set_r0(ctx, sts);
}

/// CCP request structure handed to syscall 0x38, layout preserved bit
/// exact for the proxied PSP.
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
struct CcpReq0x38 {
    psp_addr_buf0: u32,
    cb_buf0: u32,
    unk1: u32,
    psp_addr_buf1: u32,
    cb_buf1: u32,
    psp_addr_buf2: u32,
    unk3: u32,
    unk4: u32,
    unk5: u32,
}

fn svc_ccp_req_0x38(s: &mut SvcState, ctx: &mut dyn ExecCtx, idx: u32) {
    let req_addr = reg(ctx, CoreReg::R0);
    let buf = match guest_read(ctx, req_addr, core::mem::size_of::<CcpReq0x38>()) {
        Ok(buf) => buf,
        Err(err) => {
            log::error!("reading the CCP request failed: {}", err);
            set_r0(ctx, SVC_STATUS_GENERAL_MEMORY_ERROR);
            return;
        }
    };
    let req = match CcpReq0x38::read_from(buf.as_slice()) {
        Some(req) => req,
        None => {
            set_r0(ctx, SVC_STATUS_GENERAL_MEMORY_ERROR);
            return;
        }
    };
    log::debug!("CCP request: {:x?}", req);

    let mut sts = SVC_STATUS_GENERAL_MEMORY_ERROR;
    if req.unk1 == 0x2 && req.cb_buf1 == 0x20 {
        let mut req_proxy = req;
        if req.psp_addr_buf0 != 0 {
            req_proxy.psp_addr_buf0 = PROXY_CURVE_SCRATCH_ADDR;
        }
        req_proxy.psp_addr_buf1 = 0x21100;
        if req.psp_addr_buf2 != 0 {
            req_proxy.psp_addr_buf2 = 0x21200;
        }

        let synced = {
            let mut proxy = s.proxy.borrow_mut();
            let mut ok = proxy
                .mem_write(PROXY_SCRATCH_ADDR, req_proxy.as_bytes())
                .is_ok();
            if ok && req.psp_addr_buf0 != 0 {
                ok = sync_to_proxy(
                    &mut *proxy,
                    ctx,
                    req.psp_addr_buf0,
                    req_proxy.psp_addr_buf0,
                    req.cb_buf0,
                )
                .is_ok();
            }
            if ok && req.psp_addr_buf1 != 0 {
                ok = sync_to_proxy(
                    &mut *proxy,
                    ctx,
                    req.psp_addr_buf1,
                    req_proxy.psp_addr_buf1,
                    req.cb_buf1,
                )
                .is_ok();
            }
            if ok && req.psp_addr_buf2 != 0 {
                ok = sync_to_proxy(
                    &mut *proxy,
                    ctx,
                    req.psp_addr_buf2,
                    req_proxy.psp_addr_buf2,
                    0x20,
                )
                .is_ok();
            }
            ok
        };
        if synced {
            sts = match s.proxy.borrow_mut().svc_call(idx, PROXY_SCRATCH_ADDR, 0, 0, 0) {
                Ok(sts) => sts,
                Err(err) => {
                    log::error!("syscall 0x38 failed: {}", err);
                    SVC_STATUS_GENERAL_MEMORY_ERROR
                }
            };
            if sts == SVC_STATUS_SUCCESS {
                let mut proxy = s.proxy.borrow_mut();
                if req.psp_addr_buf0 != 0 {
                    let _ = sync_from_proxy(
                        &mut *proxy,
                        ctx,
                        req_proxy.psp_addr_buf0,
                        req.psp_addr_buf0,
                        req.cb_buf0,
                    );
                }
                if req.psp_addr_buf1 != 0 {
                    let _ = sync_from_proxy(
                        &mut *proxy,
                        ctx,
                        req_proxy.psp_addr_buf1,
                        req.psp_addr_buf1,
                        req.cb_buf1,
                    );
                }
                if req.psp_addr_buf2 != 0 {
                    let _ = sync_from_proxy(
                        &mut *proxy,
                        ctx,
                        req_proxy.psp_addr_buf2,
                        req.psp_addr_buf2,
                        0x20,
                    );
                }
            }
        }
    } else {
        log::warn!("CCP request variant not implemented, failing");
    }
    set_r0(ctx, sts);
}

fn svc_rng(s: &mut SvcState, ctx: &mut dyn ExecCtx, idx: u32) {
    let guest_buf = reg(ctx, CoreReg::R0);
    let len = reg(ctx, CoreReg::R1);
    log::debug!("filling {:#x} with {:#x} bytes of random data", guest_buf, len);

    let sts = match s
        .proxy
        .borrow_mut()
        .svc_call(idx, PROXY_SCRATCH_ADDR, len, 0, 0)
    {
        Ok(sts) => sts,
        Err(err) => {
            log::error!("random number generation failed: {}", err);
            SVC_STATUS_GENERAL_MEMORY_ERROR
        }
    };
    if sts == SVC_STATUS_SUCCESS {
        let mut proxy = s.proxy.borrow_mut();
        let _ = sync_from_proxy(&mut *proxy, ctx, PROXY_SCRATCH_ADDR, guest_buf, len);
    }
    set_r0(ctx, sts);
}

fn svc_query_save_state_region(s: &mut SvcState, ctx: &mut dyn ExecCtx, idx: u32) {
    let region_len = reg(ctx, CoreReg::R0);
    log::debug!("querying state region of size {:#x}", region_len);

    let addr = match s.proxy.borrow_mut().svc_call(idx, region_len, 0, 0, 0) {
        Ok(addr) => addr,
        Err(err) => {
            log::error!("querying the state address failed: {}", err);
            0
        }
    };
    log::debug!("SEV app state address: {:#x}", addr);

    // Initialize the privileged DRAM mapping if not done already. It is
    // backed by engine RAM, no proxy round trips on access.
    if addr != 0 && s.priv_state.is_free() {
        s.priv_state.map_priv_state(addr);
        if let Err(err) = ctx.map_ram(
            s.priv_state.psp_base_4k,
            s.priv_state.mapped_len_4k as usize,
        ) {
            log::error!("mapping the state region failed: {}", err);
        }
        s.state_region_size = region_len;
    }

    set_r0(ctx, addr);
}

fn svc_ecc_curve_op(s: &mut SvcState, ctx: &mut dyn ExecCtx, idx: u32) {
    let req_addr = reg(ctx, CoreReg::R0);
    let req = match read_words::<8>(ctx, req_addr) {
        Ok(req) => req,
        Err(err) => {
            log::error!("reading the curve operation request failed: {}", err);
            set_r0(ctx, SVC_STATUS_GENERAL_MEMORY_ERROR);
            return;
        }
    };
    log::debug!("syscall 0x41 request: {:x?}", req);

    // Rebases a pointer living in the supervisor stack window.
    let stack = |addr: u32| PROXY_SCRATCH_ADDR.wrapping_add(addr.wrapping_sub(PSP_SVC_STACK_BASE));
    // Rebases a pointer into the synced curve constants.
    let curve = |addr: u32| {
        PROXY_CURVE_SCRATCH_ADDR.wrapping_add(addr.wrapping_sub(PSP_CURVE_CONST_ADDR))
    };

    let mut sts = SVC_STATUS_GENERAL_MEMORY_ERROR;
    if matches!(req[0], 1 | 2 | 3 | 5) {
        let mut req_proxy = [0u32; 8];
        let synced = {
            let mut proxy = s.proxy.borrow_mut();

            // Sync the stack the request buffers live on.
            let mut ok = sync_to_proxy(
                &mut *proxy,
                ctx,
                PSP_SVC_STACK_BASE,
                PROXY_SCRATCH_ADDR,
                PSP_SVC_STACK_LEN,
            )
            .is_ok();

            if ok {
                match req[0] {
                    1 => {
                        // Curve constants are passed by pointer here.
                        ok = sync_to_proxy(&mut *proxy, ctx, req[2], PROXY_CURVE_SCRATCH_ADDR, 144)
                            .is_ok();
                        req_proxy[0] = 1;
                        req_proxy[1] = stack(req[1]);
                        req_proxy[2] = PROXY_CURVE_SCRATCH_ADDR;
                        req_proxy[3] = stack(req[3]);
                        req_proxy[4] = stack(req[4]);
                    }
                    5 => {
                        ok = sync_to_proxy(
                            &mut *proxy,
                            ctx,
                            PSP_CURVE_CONST_ADDR,
                            PROXY_CURVE_SCRATCH_ADDR,
                            508,
                        )
                        .is_ok();
                        req_proxy[0] = 5;
                        req_proxy[1] = stack(req[1]);
                        req_proxy[2] = curve(req[2]);
                        req_proxy[3] = curve(req[3]);
                        req_proxy[4] = stack(req[4]);
                        req_proxy[5] = curve(req[5]);
                    }
                    3 => {
                        ok = sync_to_proxy(
                            &mut *proxy,
                            ctx,
                            PSP_CURVE_CONST_ADDR,
                            PROXY_CURVE_SCRATCH_ADDR,
                            508,
                        )
                        .is_ok();
                        req_proxy[0] = 3;
                        req_proxy[1] = stack(req[1]);
                        req_proxy[2] = curve(req[2]);
                        req_proxy[3] = stack(req[3]);
                    }
                    2 => {
                        ok = sync_to_proxy(
                            &mut *proxy,
                            ctx,
                            PSP_CURVE_CONST_ADDR,
                            PROXY_CURVE_SCRATCH_ADDR,
                            508,
                        )
                        .is_ok();
                        if req[3] < PSP_SVC_STACK_BASE {
                            // Does not live on the stack.
                            ok = ok
                                && sync_to_proxy(
                                    &mut *proxy,
                                    ctx,
                                    req[3],
                                    PROXY_CURVE_AUX_SCRATCH_ADDR,
                                    1024,
                                )
                                .is_ok();
                            req_proxy[3] = PROXY_CURVE_AUX_SCRATCH_ADDR;
                        } else {
                            req_proxy[3] = stack(req[3]);
                        }
                        req_proxy[0] = 2;
                        req_proxy[1] = stack(req[1]);
                        req_proxy[2] = curve(req[2]);
                        req_proxy[4] = stack(req[4]);
                    }
                    _ => {}
                }
            }

            ok && proxy
                .mem_write(PROXY_REQ_SCRATCH_ADDR, &words_bytes(&req_proxy))
                .is_ok()
        };
        log::debug!("proxied request: {:x?}", req_proxy);

        if synced {
            sts = match s
                .proxy
                .borrow_mut()
                .svc_call(idx, PROXY_REQ_SCRATCH_ADDR, 0, 0, 0)
            {
                Ok(sts) => sts,
                Err(err) => {
                    log::error!("syscall 0x41 failed: {}", err);
                    SVC_STATUS_GENERAL_MEMORY_ERROR
                }
            };
            if sts == SVC_STATUS_SUCCESS {
                let mut proxy = s.proxy.borrow_mut();
                let _ = sync_from_proxy(
                    &mut *proxy,
                    ctx,
                    PROXY_SCRATCH_ADDR,
                    PSP_SVC_STACK_BASE,
                    PSP_SVC_STACK_LEN,
                );
                if req[0] == 2 && req[3] < PSP_SVC_STACK_BASE {
                    let _ = sync_from_proxy(
                        &mut *proxy,
                        ctx,
                        PROXY_CURVE_AUX_SCRATCH_ADDR,
                        req[3],
                        1024,
                    );
                }
            }
        }
    } else {
        log::warn!("curve operation {} not implemented, failing", req[0]);
    }
    set_r0(ctx, sts);
}

fn svc_query_fuses(s: &mut SvcState, ctx: &mut dyn ExecCtx, idx: u32) {
    let guest_buf = reg(ctx, CoreReg::R0);
    let guest_len_ptr = reg(ctx, CoreReg::R1);

    let len = match read_words::<1>(ctx, guest_len_ptr) {
        Ok([len]) => len,
        Err(err) => {
            log::error!("reading the fuse buffer size failed: {}", err);
            set_r0(ctx, SVC_STATUS_GENERAL_MEMORY_ERROR);
            return;
        }
    };

    let synced = {
        let mut proxy = s.proxy.borrow_mut();
        sync_to_proxy(&mut *proxy, ctx, guest_buf, PROXY_SCRATCH_ADDR, len).is_ok()
            && proxy
                .mem_write(PROXY_SCRATCH_ADDR_2, &len.to_le_bytes())
                .is_ok()
    };
    let mut sts = SVC_STATUS_GENERAL_MEMORY_ERROR;
    if synced {
        sts = match s
            .proxy
            .borrow_mut()
            .svc_call(idx, PROXY_SCRATCH_ADDR, PROXY_SCRATCH_ADDR_2, 0, 0)
        {
            Ok(sts) => sts,
            Err(err) => {
                log::error!("querying fuses failed: {}", err);
                SVC_STATUS_GENERAL_MEMORY_ERROR
            }
        };

        // Sync size and buffer back.
        let mut proxy = s.proxy.borrow_mut();
        let mut len_out = [0u8; 4];
        if proxy.mem_read(PROXY_SCRATCH_ADDR_2, &mut len_out).is_ok() {
            let len_out = u32::from_le_bytes(len_out);
            let _ = ctx.mem_write(guest_len_ptr, &len_out.to_le_bytes());
            let _ = sync_from_proxy(&mut *proxy, ctx, PROXY_SCRATCH_ADDR, guest_buf, len_out);
        }
    }
    set_r0(ctx, sts);
}

fn svc_query_smm_region(s: &mut SvcState, ctx: &mut dyn ExecCtx, idx: u32) {
    let usr_ptr_start = reg(ctx, CoreReg::R0);
    let usr_ptr_len = reg(ctx, CoreReg::R1);

    let sts = match s
        .proxy
        .borrow_mut()
        .svc_call(idx, PROXY_SCRATCH_ADDR, PROXY_SCRATCH_ADDR_2, 0, 0)
    {
        Ok(sts) => sts,
        Err(err) => {
            log::error!("querying SMM region boundaries failed: {}", err);
            set_r0(ctx, SVC_STATUS_GENERAL_MEMORY_ERROR);
            return;
        }
    };

    let mut proxy = s.proxy.borrow_mut();
    let _ = sync_from_proxy(&mut *proxy, ctx, PROXY_SCRATCH_ADDR, usr_ptr_start, 8);
    let _ = sync_from_proxy(&mut *proxy, ctx, PROXY_SCRATCH_ADDR_2, usr_ptr_len, 8);
    set_r0(ctx, sts);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::proxy::ProxyError;
    use pspemu_bus::UnassignedPolicy;
    use pspemu_cpu::testing::{ExecState, TestCtx};
    use pspemu_types::{AccessSize, X86_SLOT_LEN, X86_WINDOW_BASE};
    use std::collections::{BTreeMap, VecDeque};

    #[derive(Default)]
    struct RecordingProxy {
        mem: BTreeMap<u32, u8>,
        calls: Vec<(u32, [u32; 4])>,
        writes: Vec<(u32, Vec<u8>)>,
        svc_results: VecDeque<u32>,
    }

    impl RecordingProxy {
        fn push_result(&mut self, res: u32) {
            self.svc_results.push_back(res);
        }

        fn preload(&mut self, addr: u32, data: &[u8]) {
            for (idx, byte) in data.iter().enumerate() {
                self.mem.insert(addr + idx as u32, *byte);
            }
        }
    }

    impl ProxyClient for RecordingProxy {
        fn svc_call(
            &mut self,
            idx: u32,
            r0: u32,
            r1: u32,
            r2: u32,
            r3: u32,
        ) -> Result<u32, ProxyError> {
            self.calls.push((idx, [r0, r1, r2, r3]));
            Ok(self.svc_results.pop_front().unwrap_or(0))
        }

        fn mem_read(&mut self, addr: PspAddr, buf: &mut [u8]) -> Result<(), ProxyError> {
            for (idx, byte) in buf.iter_mut().enumerate() {
                *byte = self.mem.get(&(addr + idx as u32)).copied().unwrap_or(0);
            }
            Ok(())
        }

        fn mem_write(&mut self, addr: PspAddr, data: &[u8]) -> Result<(), ProxyError> {
            for (idx, byte) in data.iter().enumerate() {
                self.mem.insert(addr + idx as u32, *byte);
            }
            self.writes.push((addr, data.to_vec()));
            Ok(())
        }
    }

    struct Harness {
        iom: Rc<RefCell<IoManager>>,
        proxy: Rc<RefCell<RecordingProxy>>,
        svc: SvcState,
        state: ExecState,
    }

    fn harness() -> Harness {
        let iom = IoManager::detached(UnassignedPolicy::ZeroRead).unwrap();
        let proxy = Rc::new(RefCell::new(RecordingProxy::default()));
        let svc = SvcState::new(iom.clone(), proxy.clone(), false);
        let mut state = ExecState::default();
        state.add_ram(0, 256 * 1024).unwrap();
        Harness {
            iom,
            proxy,
            svc,
            state,
        }
    }

    /// Maps one x86 region, the proxied PSP answering with `psp_addr`.
    fn map_x86(h: &mut Harness, phys: u64, psp_addr: u32) -> u32 {
        h.proxy.borrow_mut().push_result(psp_addr);
        h.state.set_reg(CoreReg::R0, phys as u32);
        h.state.set_reg(CoreReg::R1, (phys >> 32) as u32);
        h.state.set_reg(CoreReg::R2, 4);
        h.svc.call(&mut TestCtx(&mut h.state), SVC_X86_MEM_MAP_EX);
        h.state.reg(CoreReg::R0)
    }

    #[test]
    fn test_app_init_stack_setup() {
        let mut h = harness();
        h.state.set_reg(CoreReg::R2, 0x10000);
        h.svc.call(&mut TestCtx(&mut h.state), SVC_APP_INIT);

        assert_eq!(h.state.reg(CoreReg::R0), SVC_STATUS_SUCCESS);
        let mut buf = [0u8; 4];
        h.state.read(0x10000, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), PSP_APP_STACK_TOP);
        // The stack region exists now.
        assert!(h.state.write(PSP_APP_STACK_BASE, &[1, 2, 3, 4]).is_ok());
        assert!(h
            .state
            .write(PSP_APP_STACK_TOP - 4, &[5, 6, 7, 8])
            .is_ok());
    }

    #[test]
    fn test_unknown_svc_leaves_other_registers() {
        let mut h = harness();
        for (idx, reg) in CoreReg::ALL.iter().enumerate() {
            h.state.set_reg(*reg, 0x4000 + idx as u32);
        }
        h.svc.call(&mut TestCtx(&mut h.state), 0x02);
        assert_eq!(h.state.reg(CoreReg::R0), SVC_STATUS_GENERAL_MEMORY_ERROR);
        for (idx, reg) in CoreReg::ALL.iter().enumerate().skip(1) {
            assert_eq!(h.state.reg(*reg), 0x4000 + idx as u32);
        }
    }

    #[test]
    fn test_every_null_slot_fails_with_memory_error() {
        for idx in 0..=0x48u32 {
            if SvcState::is_implemented(idx) {
                continue;
            }
            let mut h = harness();
            for (pos, reg) in CoreReg::ALL.iter().enumerate() {
                h.state.set_reg(*reg, 0x8000 + pos as u32);
            }
            h.svc.call(&mut TestCtx(&mut h.state), idx);
            assert_eq!(h.state.reg(CoreReg::R0), SVC_STATUS_GENERAL_MEMORY_ERROR);
            for (pos, reg) in CoreReg::ALL.iter().enumerate().skip(1) {
                assert_eq!(h.state.reg(*reg), 0x8000 + pos as u32);
            }
        }
        // Out of range numbers behave like null slots.
        let mut h = harness();
        h.svc.call(&mut TestCtx(&mut h.state), 0x49);
        assert_eq!(h.state.reg(CoreReg::R0), SVC_STATUS_GENERAL_MEMORY_ERROR);
    }

    #[test]
    fn test_mapping_slot_exhaustion() {
        let mut h = harness();
        for slot in 0..8u32 {
            let phys = 0x1_0000_0000u64 + slot as u64 * X86_SLOT_LEN as u64 + 0x100;
            let psp_addr = X86_WINDOW_BASE + slot * X86_SLOT_LEN + 0x100;
            assert_eq!(map_x86(&mut h, phys, psp_addr), psp_addr);
            assert_eq!(h.svc.allocated_slot_count(), slot as usize + 1);
        }

        // The ninth mapping finds no slot: R0 is zero and the proxied
        // mapping gets undone.
        let addr9 = X86_WINDOW_BASE + 8 * X86_SLOT_LEN + 0x100;
        assert_eq!(map_x86(&mut h, 0x2_0000_0000, addr9), 0);
        assert_eq!(h.svc.allocated_slot_count(), 8);
        let calls = h.proxy.borrow().calls.clone();
        let last = calls.last().unwrap();
        assert_eq!(last.0, SVC_X86_MEM_UNMAP);
        assert_eq!(last.1[0], addr9);
    }

    #[test]
    fn test_map_unmap_slot_balance() {
        let mut h = harness();
        assert_eq!(h.svc.allocated_slot_count(), 0);
        let psp_addr = map_x86(&mut h, 0x1_0000_0000, X86_WINDOW_BASE + 0x100);
        assert_eq!(h.svc.allocated_slot_count(), 1);

        h.state.set_reg(CoreReg::R0, psp_addr);
        h.svc.call(&mut TestCtx(&mut h.state), SVC_X86_MEM_UNMAP);
        assert_eq!(h.state.reg(CoreReg::R0), SVC_STATUS_SUCCESS);
        assert_eq!(h.svc.allocated_slot_count(), 0);

        // Free slots have the NIL sentinel and no backing.
        for mapping in h.svc.mapping_slots() {
            let mapping = mapping.borrow();
            assert!(mapping.is_free());
            assert!(!mapping.has_backing());
        }
    }

    #[test]
    fn test_write_back_prefix_on_unmap() {
        let mut h = harness();
        let base = map_x86(&mut h, 0x1_0000_0000, X86_WINDOW_BASE);
        assert_eq!(base, X86_WINDOW_BASE);

        // 16 bytes at base + 0x40, through the registered window.
        for idx in 0..4u32 {
            IoManager::x86_window_write(
                &h.iom,
                &mut TestCtx(&mut h.state),
                0x40 + idx as u64 * 4,
                AccessSize::Word,
                0xa0a0_a000 + idx,
            );
        }

        h.state.set_reg(CoreReg::R0, base);
        h.svc.call(&mut TestCtx(&mut h.state), SVC_X86_MEM_UNMAP);

        // Exactly the written prefix went back through the proxy.
        let proxy = h.proxy.borrow();
        assert_eq!(proxy.writes.len(), 1);
        let (addr, data) = &proxy.writes[0];
        assert_eq!(*addr, base);
        assert_eq!(data.len(), 0x50);
        assert_eq!(&data[0x40..0x44], &0xa0a0_a000u32.to_le_bytes());
        assert_eq!(&data[0x4c..0x50], &0xa0a0_a003u32.to_le_bytes());
        drop(proxy);

        // The window is gone, reads fall through to unassigned.
        let val =
            IoManager::x86_window_read(&h.iom, &mut TestCtx(&mut h.state), 0x40, AccessSize::Word);
        assert_eq!(val, 0);
    }

    #[test]
    fn test_smu_msg_with_readback() {
        let mut h = harness();
        h.proxy.borrow_mut().push_result(0);
        h.proxy
            .borrow_mut()
            .preload(PROXY_SCRATCH_ADDR, &0xcafe_f00du32.to_le_bytes());

        h.state.set_reg(CoreReg::R0, 0x42);
        h.state.set_reg(CoreReg::R1, 7);
        h.state.set_reg(CoreReg::R2, 0x11000);
        h.svc.call(&mut TestCtx(&mut h.state), SVC_SMU_MSG);

        assert_eq!(h.state.reg(CoreReg::R0), 0);
        let mut buf = [0u8; 4];
        h.state.read(0x11000, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 0xcafe_f00d);
        assert_eq!(
            h.proxy.borrow().calls[0],
            (SVC_SMU_MSG, [0x42, 7, PROXY_SCRATCH_ADDR, 0])
        );
    }

    #[test]
    fn test_smu_msg_without_return_pointer() {
        let mut h = harness();
        h.svc.call(&mut TestCtx(&mut h.state), SVC_SMU_MSG);
        // No return pointer: the scratch argument stays zero.
        assert_eq!(h.proxy.borrow().calls[0].1[2], 0);
    }

    #[test]
    fn test_rng_fills_guest_buffer() {
        let mut h = harness();
        h.proxy.borrow_mut().push_result(0);
        h.proxy
            .borrow_mut()
            .preload(PROXY_SCRATCH_ADDR, &[9, 8, 7, 6, 5, 4, 3, 2]);

        h.state.set_reg(CoreReg::R0, 0x12000);
        h.state.set_reg(CoreReg::R1, 8);
        h.svc.call(&mut TestCtx(&mut h.state), SVC_RNG);

        assert_eq!(h.state.reg(CoreReg::R0), 0);
        let mut buf = [0u8; 8];
        h.state.read(0x12000, &mut buf).unwrap();
        assert_eq!(buf, [9, 8, 7, 6, 5, 4, 3, 2]);
    }

    #[test]
    fn test_dbg_log_reads_string() {
        let mut h = harness();
        h.state.write(0x9000, b"hello world\0").unwrap();
        h.state.set_reg(CoreReg::R0, 0x9000);
        h.state.set_reg(CoreReg::R1, 0x1234);
        h.svc.call(&mut TestCtx(&mut h.state), SVC_DBG_LOG);
        // The call only logs; registers stay put.
        assert_eq!(h.state.reg(CoreReg::R0), 0x9000);
        assert_eq!(h.state.reg(CoreReg::R1), 0x1234);
    }

    #[test]
    fn test_query_fuses_syncs_size_and_buffer() {
        let mut h = harness();
        h.state.write(0x3000, &[0xde, 0xad, 0xbe, 0xef]).unwrap();
        h.state.write(0x2000, &4u32.to_le_bytes()).unwrap();
        h.proxy.borrow_mut().push_result(0);

        h.state.set_reg(CoreReg::R0, 0x3000);
        h.state.set_reg(CoreReg::R1, 0x2000);
        h.svc.call(&mut TestCtx(&mut h.state), SVC_QUERY_FUSES);

        assert_eq!(h.state.reg(CoreReg::R0), 0);
        assert_eq!(
            h.proxy.borrow().calls[0],
            (
                SVC_QUERY_FUSES,
                [PROXY_SCRATCH_ADDR, PROXY_SCRATCH_ADDR_2, 0, 0]
            )
        );
        // Size and buffer survived the round trip.
        let mut buf = [0u8; 4];
        h.state.read(0x2000, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 4);
        h.state.read(0x3000, &mut buf).unwrap();
        assert_eq!(buf, [0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_query_smm_region() {
        let mut h = harness();
        h.proxy
            .borrow_mut()
            .preload(PROXY_SCRATCH_ADDR, &0x0000_0001_2345_6780u64.to_le_bytes());
        h.proxy
            .borrow_mut()
            .preload(PROXY_SCRATCH_ADDR_2, &0x0080_0000u64.to_le_bytes());
        h.proxy.borrow_mut().push_result(0);

        h.state.set_reg(CoreReg::R0, 0x4000);
        h.state.set_reg(CoreReg::R1, 0x4008);
        h.svc.call(&mut TestCtx(&mut h.state), SVC_QUERY_SMM_REGION);

        let mut buf = [0u8; 8];
        h.state.read(0x4000, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 0x0000_0001_2345_6780);
        h.state.read(0x4008, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 0x0080_0000);
    }

    #[test]
    fn test_save_state_region_and_app_exit_flush() {
        let mut h = harness();
        // The proxied PSP reports the state region near the end of a slot.
        h.proxy.borrow_mut().push_result(0x07ff_f000);
        h.state.set_reg(CoreReg::R0, 0x100);
        h.svc
            .call(&mut TestCtx(&mut h.state), SVC_QUERY_SAVE_STATE_REGION);
        assert_eq!(h.state.reg(CoreReg::R0), 0x07ff_f000);
        // The privileged mapping is RAM backed now.
        assert!(h.state.write(0x07ff_f000, &[0x5a; 0x100]).is_ok());

        // app_exit queries the state buffer and flushes the state into it.
        h.proxy.borrow_mut().push_result(0x60000);
        h.svc.call(&mut TestCtx(&mut h.state), SVC_APP_EXIT);
        assert_eq!(h.state.reg(CoreReg::R0), SVC_STATUS_SUCCESS);
        assert!(h.state.stop_requested());

        let proxy = h.proxy.borrow();
        let flush = proxy
            .writes
            .iter()
            .find(|(addr, _)| *addr == 0x60000)
            .unwrap();
        assert_eq!(flush.1.len(), 0x100);
        assert_eq!(flush.1[0], 0x5a);
    }

    #[test]
    fn test_blob_round_trip_0x32() {
        let mut h = harness();
        h.state.write(0x5000, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        h.proxy.borrow_mut().push_result(0);

        h.state.set_reg(CoreReg::R0, 0x5000);
        h.state.set_reg(CoreReg::R1, 8);
        h.svc.call(&mut TestCtx(&mut h.state), 0x32);

        assert_eq!(h.state.reg(CoreReg::R0), 0);
        assert_eq!(
            h.proxy.borrow().calls[0],
            (0x32, [PROXY_SCRATCH_ADDR, 8, 0, 0])
        );
        // The blob reached the scratch buffer bit exact.
        assert_eq!(h.proxy.borrow().writes[0].1, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_transport_failure_lowers_to_memory_error() {
        let iom = IoManager::detached(UnassignedPolicy::ZeroRead).unwrap();
        let mut svc = SvcState::new(iom, Rc::new(RefCell::new(crate::NullProxy)), false);
        let mut state = ExecState::default();
        state.add_ram(0, 256 * 1024).unwrap();

        let mut ctx = TestCtx(&mut state);
        svc.call(&mut ctx, SVC_SMU_MSG);
        assert_eq!(state.reg(CoreReg::R0), SVC_STATUS_GENERAL_MEMORY_ERROR);
    }

    #[test]
    fn test_svc_immediate_decoding() {
        let mut state = ExecState::default();
        state.add_ram(0, 0x1000).unwrap();

        // Thumb encoding: svc #7 at 0x100.
        state.write(0x100, &0xdf07u16.to_le_bytes()).unwrap();
        state.set_reg(CoreReg::Pc, 0x102);
        assert_eq!(svc_immediate(&mut TestCtx(&mut state)), Some(7));

        // ARM encoding: svc #0x42 at 0x200.
        state.write(0x200, &0xef00_0042u32.to_le_bytes()).unwrap();
        state.set_reg(CoreReg::Pc, 0x204);
        assert_eq!(svc_immediate(&mut TestCtx(&mut state)), Some(0x42));
    }
}
