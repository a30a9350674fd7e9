/*++

Licensed under the Apache-2.0 license.

File Name:

    cfg.rs

Abstract:

    The frozen emulator configuration handed to every CCD.

--*/

use pspemu_types::{AcpiState, CpuSegment, EmuMode, MicroArch};
use std::path::PathBuf;

/// Emulator configuration, frozen before the first CCD is created.
pub struct PspEmuCfg {
    pub mode: EmuMode,
    pub micro_arch: MicroArch,
    pub cpu_segment: CpuSegment,
    /// ACPI system state the emulation starts from.
    pub acpi_state: AcpiState,
    /// The flash ROM contents.
    pub flash_rom: Vec<u8>,
    /// On chip bootloader ROM (on-chip-bl mode).
    pub on_chip_bl: Vec<u8>,
    /// Binary to load, overriding the one from the flash image.
    pub bin_load: Vec<u8>,
    /// Boot ROM service page to place (4 KiB).
    pub boot_rom_svc_page: Vec<u8>,
    /// App binary preloaded alongside the main binary.
    pub app_preload: Vec<u8>,
    /// Whether loaded binaries come with the 256 byte header prepended.
    pub bin_contains_hdr: bool,
    /// Whether to load the PSP directory from flash into the service page.
    pub load_psp_dir: bool,
    /// Whether the PSP firmware debug mode is requested.
    pub psp_dbg_mode: bool,
    /// Intercept svc 6 in on chip bootloader and system mode.
    pub incpt_svc6: bool,
    /// Trace all svc calls.
    pub trace_svcs: bool,
    /// Whether the timer ticks in wall-clock time.
    pub timer_realtime: bool,
    /// Debugger port, 0 disables the debugger.
    pub dbg_port: u16,
    /// EM100 flash emulation port, 0 disables the service.
    pub em100_flash_emu_port: u16,
    /// Address of the PSP proxy, if any.
    pub psp_proxy_addr: Option<String>,
    /// Trace log path, if any.
    pub trace_log: Option<PathBuf>,
    /// Number of sockets to emulate.
    pub sockets: u32,
    /// Number of CCDs per socket to emulate.
    pub ccds_per_socket: u32,
    /// Devices to instantiate; `None` means everything emulated.
    pub devices: Option<Vec<String>>,
}

impl Default for PspEmuCfg {
    fn default() -> Self {
        Self {
            mode: EmuMode::App,
            micro_arch: MicroArch::Zen,
            cpu_segment: CpuSegment::Ryzen,
            acpi_state: AcpiState::S5,
            flash_rom: Vec::new(),
            on_chip_bl: Vec::new(),
            bin_load: Vec::new(),
            boot_rom_svc_page: Vec::new(),
            app_preload: Vec::new(),
            bin_contains_hdr: false,
            load_psp_dir: false,
            psp_dbg_mode: false,
            incpt_svc6: false,
            trace_svcs: false,
            timer_realtime: false,
            dbg_port: 0,
            em100_flash_emu_port: 0,
            psp_proxy_addr: None,
            trace_log: None,
            sockets: 1,
            ccds_per_socket: 1,
            devices: None,
        }
    }
}

impl PspEmuCfg {
    /// Sanity checks before any CCD is created.
    pub fn validate(&self) -> Result<(), String> {
        if self.mode == EmuMode::SystemOnChipBl && self.on_chip_bl.is_empty() {
            return Err(
                "the on chip bootloader binary is required for the selected emulation mode".into(),
            );
        }
        if !self.boot_rom_svc_page.is_empty() && self.boot_rom_svc_page.len() != 4096 {
            return Err("the boot ROM service page must be exactly 4KiB".into());
        }
        if !self.bin_load.is_empty() && self.mode == EmuMode::SystemOnChipBl {
            return Err("a binary cannot be loaded in on-chip-bl mode".into());
        }
        if self.sockets == 0 || self.ccds_per_socket == 0 {
            return Err("the topology needs at least one socket and one CCD".into());
        }
        Ok(())
    }
}
