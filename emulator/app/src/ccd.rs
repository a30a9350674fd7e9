/*++

Licensed under the Apache-2.0 license.

File Name:

    ccd.rs

Abstract:

    A single emulated CCD: one PSP core, its I/O manager, the instantiated
    devices and, in app mode, the emulated supervisor state.

--*/

use crate::cfg::PspEmuCfg;
use pspemu_bus::{IoManager, IoReadFn, IomError, UnassignedPolicy};
use pspemu_cpu::{CoreError, CoreReg, ExecCtx, PspCore, StopReason};
use pspemu_periph::{find_device, DeviceCtx, DeviceError, DeviceInstance, DEVICE_REGISTRY};
use pspemu_svc::{read_guest_cstring, svc_immediate, NullProxy, ProxyClient, SvcState};
use pspemu_types::{
    EmuMode, PspAddr, PSP_APP_ENTRY, PSP_APP_LOAD_ADDR, PSP_FW_HDR_LEN, PSP_ON_CHIP_BL_ADDR,
    PSP_SYS_ENTRY, PSP_SYS_LOAD_ADDR, SMN_CCD_ID_ADDR,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Instructions executed per run loop iteration, between checks of the
/// external stop flag.
const RUN_CHUNK_INSNS: u32 = 0x10000;

#[derive(Debug, Error)]
pub enum CcdError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("I/O manager error: {0}")]
    Iom(#[from] IomError),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// A single CCD instance.
pub struct Ccd {
    socket_id: u32,
    ccd_id: u32,
    cfg: Rc<PspEmuCfg>,
    core: Rc<RefCell<PspCore>>,
    iom: Rc<RefCell<IoManager>>,
    dev_ctx: DeviceCtx,
    devices: Vec<DeviceInstance>,
    /// Emulated supervisor state, app mode only.
    svc: Option<Rc<RefCell<SvcState>>>,
    entry: PspAddr,
}

impl Ccd {
    /// Creates a CCD on the default instruction engine.
    pub fn create(socket_id: u32, ccd_id: u32, cfg: Rc<PspEmuCfg>) -> Result<Self, CcdError> {
        let core = PspCore::new(cfg.mode, cfg.micro_arch.sram_len())?;
        Self::compose(socket_id, ccd_id, cfg, core)
    }

    /// Creates a CCD around a caller-provided core (tests, embedders).
    #[allow(dead_code)]
    pub fn with_core(
        socket_id: u32,
        ccd_id: u32,
        cfg: Rc<PspEmuCfg>,
        core: PspCore,
    ) -> Result<Self, CcdError> {
        Self::compose(socket_id, ccd_id, cfg, core)
    }

    fn compose(
        socket_id: u32,
        ccd_id: u32,
        cfg: Rc<PspEmuCfg>,
        mut core: PspCore,
    ) -> Result<Self, CcdError> {
        core.set_ccd_id(ccd_id);
        let iom = IoManager::attach(&mut core, UnassignedPolicy::ZeroRead)?;

        if cfg.mode == EmuMode::SystemOnChipBl {
            core.set_on_chip_bl(&cfg.on_chip_bl)?;
        }

        let mut dev_ctx = DeviceCtx::new(cfg.micro_arch, cfg.flash_rom.clone());
        dev_ctx.timer_realtime = cfg.timer_realtime;
        dev_ctx.em100_port = cfg.em100_flash_emu_port;

        let devices = Self::instantiate_devices(&iom, &dev_ctx, &cfg)?;
        Self::memory_init(&mut core, &cfg)?;

        // The CCD ID register exposed over SMN.
        let id_read: IoReadFn =
            Box::new(move |_ctx, _off, _size| ccd_id_reg_value(socket_id, ccd_id));
        iom.borrow_mut()
            .smn_register(SMN_CCD_ID_ADDR, 4, Some(id_read), None)?;

        let core = Rc::new(RefCell::new(core));
        let entry = match cfg.mode {
            EmuMode::SystemOnChipBl => PSP_ON_CHIP_BL_ADDR,
            EmuMode::System => PSP_SYS_ENTRY,
            EmuMode::App => PSP_APP_ENTRY,
        };

        let mut svc = None;
        match cfg.mode {
            EmuMode::App => {
                let proxy: Rc<RefCell<dyn ProxyClient>> = Rc::new(RefCell::new(NullProxy));
                if let Some(addr) = &cfg.psp_proxy_addr {
                    // The wire transport is an external collaborator.
                    log::warn!(
                        "proxy transport to {} is not part of this build; forwarded syscalls will fail",
                        addr
                    );
                }
                let state = Rc::new(RefCell::new(SvcState::new(
                    iom.clone(),
                    proxy,
                    cfg.trace_svcs,
                )));
                svc = Some(state.clone());
                core.borrow_mut().set_intr_hook(Box::new(move |ctx, intno| {
                    if intno != 2 {
                        return;
                    }
                    match svc_immediate(ctx) {
                        Some(imm) => state.borrow_mut().call(ctx, imm),
                        None => log::warn!("interrupt 2 without a decodable svc instruction"),
                    }
                }))?;
            }
            _ if cfg.incpt_svc6 || cfg.trace_svcs => {
                let trace_svcs = cfg.trace_svcs;
                let incpt_svc6 = cfg.incpt_svc6;
                core.borrow_mut().set_intr_hook(Box::new(move |ctx, intno| {
                    if intno != 2 {
                        return;
                    }
                    if let Some(imm) = svc_immediate(ctx) {
                        if trace_svcs {
                            log::info!("svc {:#04x}", imm);
                        }
                        if incpt_svc6 && imm == 6 {
                            let addr = ctx.reg_read(CoreReg::R0).unwrap_or(0);
                            log::info!("PSP Log: {}", read_guest_cstring(ctx, addr));
                        }
                    }
                }))?;
            }
            _ => {}
        }

        core.borrow_mut().exec_set_start_addr(entry);

        if cfg.dbg_port != 0 {
            let port = cfg.dbg_port + ccd_id as u16;
            log::info!(
                "debugger for [socket:{}]:[id:{}] expected on port {}; attach an external stub through the exposed core",
                socket_id,
                ccd_id,
                port
            );
        }

        Ok(Self {
            socket_id,
            ccd_id,
            cfg,
            core,
            iom,
            dev_ctx,
            devices,
            svc,
            entry,
        })
    }

    fn instantiate_devices(
        iom: &Rc<RefCell<IoManager>>,
        dev_ctx: &DeviceCtx,
        cfg: &PspEmuCfg,
    ) -> Result<Vec<DeviceInstance>, CcdError> {
        let mut devices = Vec::new();
        let result = (|| -> Result<(), DeviceError> {
            match &cfg.devices {
                Some(names) => {
                    for name in names {
                        let desc = find_device(name)
                            .ok_or_else(|| DeviceError::UnknownDevice(name.clone()))?;
                        devices.push((desc.instantiate)(&mut iom.borrow_mut(), dev_ctx)?);
                    }
                }
                None => {
                    for desc in DEVICE_REGISTRY {
                        devices.push((desc.instantiate)(&mut iom.borrow_mut(), dev_ctx)?);
                    }
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => Ok(devices),
            Err(err) => {
                // Rollback time.
                for device in devices.drain(..) {
                    device.destroy(&mut iom.borrow_mut());
                }
                Err(err.into())
            }
        }
    }

    /// Populates the initial SRAM contents from the configured images.
    fn memory_init(core: &mut PspCore, cfg: &PspEmuCfg) -> Result<(), CcdError> {
        if !cfg.boot_rom_svc_page.is_empty() {
            if cfg.boot_rom_svc_page.len() != 4096 {
                return Err(CcdError::Config(
                    "the boot ROM service page must be exactly 4KiB".into(),
                ));
            }
            if cfg.psp_dbg_mode || cfg.load_psp_dir {
                // Service page construction lives with the external tool.
                log::warn!(
                    "the boot ROM service page is placed as provided; rebuild it with the debug mode / PSP directory fields set"
                );
            }
            core.mem_write(cfg.micro_arch.brsp_addr(), &cfg.boot_rom_svc_page)?;
        }

        if !cfg.bin_load.is_empty() {
            let mut addr = match cfg.mode {
                EmuMode::System => PSP_SYS_LOAD_ADDR,
                EmuMode::App => PSP_APP_LOAD_ADDR,
                EmuMode::SystemOnChipBl => {
                    return Err(CcdError::Config(
                        "a binary cannot be loaded in on-chip-bl mode".into(),
                    ))
                }
            };
            if !cfg.bin_contains_hdr {
                // Skip the header part.
                addr += PSP_FW_HDR_LEN;
            }
            core.mem_write(addr, &cfg.bin_load)?;
        }

        if !cfg.app_preload.is_empty() {
            core.mem_write(PSP_APP_LOAD_ADDR, &cfg.app_preload)?;
        }
        Ok(())
    }

    /// Drops per-device state, re-runs every device init, repopulates the
    /// initial memory and rewinds to the configured entry point.
    #[allow(dead_code)]
    pub fn reset(&mut self) -> Result<(), CcdError> {
        for device in self.devices.drain(..) {
            device.destroy(&mut self.iom.borrow_mut());
        }
        self.devices = Self::instantiate_devices(&self.iom, &self.dev_ctx, &self.cfg)?;
        Self::memory_init(&mut self.core.borrow_mut(), &self.cfg)?;
        self.core.borrow_mut().exec_set_start_addr(self.entry);
        Ok(())
    }

    /// Runs until the guest halts, a fault occurs or `running` goes false.
    pub fn run(&mut self, running: &AtomicBool) -> Result<(), CcdError> {
        log::info!(
            "starting execution of [socket:{}]:[id:{}]",
            self.socket_id,
            self.ccd_id
        );
        loop {
            let reason = self.core.borrow_mut().exec_run(RUN_CHUNK_INSNS, 0);
            match reason {
                Ok(StopReason::Stopped) => break,
                Ok(StopReason::Completed) => {
                    if !running.load(Ordering::Relaxed) {
                        break;
                    }
                }
                Err(err) => {
                    self.core.borrow_mut().state_dump();
                    return Err(err.into());
                }
            }
        }
        self.core.borrow_mut().state_dump();
        Ok(())
    }

    #[allow(dead_code)]
    pub fn socket_id(&self) -> u32 {
        self.socket_id
    }

    #[allow(dead_code)]
    pub fn ccd_id(&self) -> u32 {
        self.ccd_id
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// The underlying core, for debugger integration.
    #[allow(dead_code)]
    pub fn query_core(&self) -> Rc<RefCell<PspCore>> {
        self.core.clone()
    }

    /// The emulated supervisor state, app mode only.
    #[allow(dead_code)]
    pub fn query_svc(&self) -> Option<Rc<RefCell<SvcState>>> {
        self.svc.clone()
    }

    /// The flash contents backing this CCD's flash device (shared with the
    /// EM100 service).
    #[allow(dead_code)]
    pub fn flash(&self) -> Arc<Mutex<Vec<u8>>> {
        self.dev_ctx.flash.clone()
    }
}

impl Drop for Ccd {
    fn drop(&mut self) {
        for device in self.devices.drain(..) {
            device.destroy(&mut self.iom.borrow_mut());
        }
    }
}

/// Value of the read-only CCD ID register:
///
///    [Bits]            [Purpose]
///     0-1          The physical die ID (CCD)
///     2-4          Some enumeration, maximum values supported (0x4 on EPYC)
///      5           Socket ID (0 or 1)
fn ccd_id_reg_value(socket_id: u32, ccd_id: u32) -> u32 {
    let mut val = ccd_id & 0x3;
    if socket_id != 0 {
        val |= 1 << 5;
    }
    val | 0x4 << 2
}

#[cfg(test)]
mod test {
    use super::*;
    use pspemu_cpu::testing::{ScriptOp, ScriptedExecutor};
    use pspemu_types::{AccessSize, PSP_SRAM_LEN_ZEN};

    fn scripted_ccd(
        cfg: PspEmuCfg,
        ops: &[ScriptOp],
    ) -> (Ccd, Rc<RefCell<Vec<(PspAddr, u32)>>>) {
        let mut exec = Box::new(ScriptedExecutor::new());
        for op in ops {
            exec.push_op(op.clone());
        }
        let read_log = exec.read_log_handle();
        let core = PspCore::with_executor(cfg.mode, PSP_SRAM_LEN_ZEN, exec).unwrap();
        let ccd = Ccd::with_core(0, 0, Rc::new(cfg), core).unwrap();
        (ccd, read_log)
    }

    #[test]
    fn test_device_read_sentinel() {
        // The on chip bootloader spin-wait register must read 0x100.
        let cfg = PspEmuCfg {
            mode: EmuMode::System,
            devices: Some(vec!["unk-0x03010000".to_string()]),
            ..Default::default()
        };
        let (mut ccd, read_log) = scripted_ccd(
            cfg,
            &[ScriptOp::MmioRead {
                addr: 0x0301_0104,
                size: AccessSize::Word,
            }],
        );
        assert_eq!(ccd.device_count(), 1);
        ccd.run(&AtomicBool::new(false)).unwrap();
        assert_eq!(read_log.borrow().as_slice(), &[(0x0301_0104, 0x100)]);
    }

    #[test]
    fn test_default_device_set() {
        let cfg = PspEmuCfg {
            mode: EmuMode::System,
            ..Default::default()
        };
        let (ccd, _) = scripted_ccd(cfg, &[]);
        assert_eq!(ccd.device_count(), DEVICE_REGISTRY.len());
    }

    #[test]
    fn test_unknown_device_name_fails() {
        let cfg = PspEmuCfg {
            devices: Some(vec!["definitely-not-real".to_string()]),
            ..Default::default()
        };
        let core = PspCore::with_executor(
            cfg.mode,
            PSP_SRAM_LEN_ZEN,
            Box::new(ScriptedExecutor::new()),
        )
        .unwrap();
        assert!(matches!(
            Ccd::with_core(0, 0, Rc::new(cfg), core),
            Err(CcdError::Device(DeviceError::UnknownDevice(_)))
        ));
    }

    #[test]
    fn test_reset_reinstantiates_devices() {
        let cfg = PspEmuCfg {
            mode: EmuMode::System,
            devices: Some(vec!["timer".to_string(), "unk-0x03010000".to_string()]),
            ..Default::default()
        };
        let (mut ccd, _) = scripted_ccd(cfg, &[]);
        assert_eq!(ccd.device_count(), 2);
        ccd.reset().unwrap();
        assert_eq!(ccd.device_count(), 2);
    }

    #[test]
    fn test_memory_population() {
        let cfg = PspEmuCfg {
            mode: EmuMode::App,
            bin_load: vec![0xaa; 16],
            app_preload: vec![0xbb; 8],
            boot_rom_svc_page: vec![0xcc; 4096],
            ..Default::default()
        };
        let (ccd, _) = scripted_ccd(cfg, &[]);
        let core = ccd.query_core();
        let mut core = core.borrow_mut();

        // The app binary lands past the 256 byte header slot.
        let mut buf = [0u8; 16];
        core.mem_read(PSP_APP_LOAD_ADDR + PSP_FW_HDR_LEN, &mut buf)
            .unwrap();
        assert_eq!(buf, [0xaa; 16]);

        // The preload overwrote the header area at the load address.
        let mut buf = [0u8; 8];
        core.mem_read(PSP_APP_LOAD_ADDR, &mut buf).unwrap();
        assert_eq!(buf, [0xbb; 8]);

        // The service page sits at the Zen location.
        let mut buf = [0u8; 4];
        core.mem_read(0x3f000, &mut buf).unwrap();
        assert_eq!(buf, [0xcc; 4]);
    }

    #[test]
    fn test_ccd_id_register_encoding() {
        assert_eq!(ccd_id_reg_value(0, 0), 0x10);
        assert_eq!(ccd_id_reg_value(0, 2), 0x12);
        assert_eq!(ccd_id_reg_value(1, 1), 0x31);
    }

    #[test]
    fn test_app_mode_has_svc_state() {
        let cfg = PspEmuCfg {
            mode: EmuMode::App,
            devices: Some(Vec::new()),
            ..Default::default()
        };
        let (ccd, _) = scripted_ccd(cfg, &[]);
        assert!(ccd.query_svc().is_some());

        let cfg = PspEmuCfg {
            mode: EmuMode::System,
            devices: Some(Vec::new()),
            ..Default::default()
        };
        let (ccd, _) = scripted_ccd(cfg, &[]);
        assert!(ccd.query_svc().is_none());
    }
}
