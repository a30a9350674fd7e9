/*++

Licensed under the Apache-2.0 license.

File Name:

    main.rs

Abstract:

    Entry point of the AMD Platform Secure Processor emulator.

--*/

mod ccd;
mod cfg;
mod flash;
mod logger;

use ccd::Ccd;
use cfg::PspEmuCfg;
use clap::Parser;
use clap_num::maybe_hex;
use pspemu_types::{AcpiState, CpuSegment, EmuMode, MicroArch};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(version, about, long_about = None, name = "AMD Platform Secure Processor emulator")]
struct Args {
    /// Emulation mode.
    #[arg(short = 'm', long, value_name = "app|sys|on-chip-bl")]
    emulation_mode: EmuMode,

    /// Flash ROM path.
    #[arg(short = 'f', long)]
    flash_rom: PathBuf,

    /// On chip bootloader binary (on-chip-bl mode).
    #[arg(short = 'o', long)]
    on_chip_bl: Option<PathBuf>,

    /// Binary to load, overriding the one from the flash image.
    #[arg(long)]
    bin_load: Option<PathBuf>,

    /// Boot ROM service page to place into SRAM.
    #[arg(long)]
    boot_rom_svc_page: Option<PathBuf>,

    /// Preload the given app binary.
    #[arg(long)]
    app_preload: Option<PathBuf>,

    /// Micro architecture to emulate.
    #[arg(long, default_value = "zen")]
    micro_arch: MicroArch,

    /// CPU segment to emulate.
    #[arg(long, default_value = "ryzen")]
    cpu_segment: CpuSegment,

    /// ACPI state the system starts from.
    #[arg(long, default_value = "s5")]
    acpi_state: AcpiState,

    /// Loaded binaries come with the 256 byte header prepended.
    #[arg(long)]
    bin_contains_hdr: bool,

    /// Load the PSP directory from the flash image into the service page.
    #[arg(long)]
    load_psp_dir: bool,

    /// Enable the debug mode inside the PSP firmware.
    #[arg(long)]
    psp_dbg_mode: bool,

    /// Intercept svc 6 in on chip bootloader and system mode.
    #[arg(long)]
    intercept_svc6: bool,

    /// Trace all svc calls.
    #[arg(long)]
    trace_svcs: bool,

    /// Let the timer tick in wall-clock time.
    #[arg(long)]
    timer_realtime: bool,

    /// Debugger port, 0 disables the debugger.
    #[arg(long, value_parser = maybe_hex::<u16>, default_value_t = 0)]
    dbg_port: u16,

    /// EM100 flash emulation port, 0 disables the service.
    #[arg(long, value_parser = maybe_hex::<u16>, default_value_t = 0)]
    em100_flash_emu_port: u16,

    /// Address of the PSP proxy to forward unhandled syscalls to.
    #[arg(long)]
    psp_proxy_addr: Option<String>,

    /// Append a trace of emulation events to this file.
    #[arg(long)]
    trace_log: Option<PathBuf>,

    /// Number of sockets to emulate.
    #[arg(long, default_value_t = 1)]
    sockets: u32,

    /// Number of CCDs per socket to emulate.
    #[arg(long, default_value_t = 1)]
    ccds_per_socket: u32,

    /// Device to instantiate (repeatable); default is everything emulated.
    #[arg(long = "device")]
    devices: Vec<String>,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

fn build_cfg(args: Args) -> std::io::Result<PspEmuCfg> {
    Ok(PspEmuCfg {
        mode: args.emulation_mode,
        micro_arch: args.micro_arch,
        cpu_segment: args.cpu_segment,
        acpi_state: args.acpi_state,
        flash_rom: flash::load_file(&args.flash_rom)?,
        on_chip_bl: flash::load_optional(args.on_chip_bl.as_ref())?,
        bin_load: flash::load_optional(args.bin_load.as_ref())?,
        boot_rom_svc_page: flash::load_optional(args.boot_rom_svc_page.as_ref())?,
        app_preload: flash::load_optional(args.app_preload.as_ref())?,
        bin_contains_hdr: args.bin_contains_hdr,
        load_psp_dir: args.load_psp_dir,
        psp_dbg_mode: args.psp_dbg_mode,
        incpt_svc6: args.intercept_svc6,
        trace_svcs: args.trace_svcs,
        timer_realtime: args.timer_realtime,
        dbg_port: args.dbg_port,
        em100_flash_emu_port: args.em100_flash_emu_port,
        psp_proxy_addr: args.psp_proxy_addr,
        trace_log: args.trace_log,
        sockets: args.sockets,
        ccds_per_socket: args.ccds_per_socket,
        devices: if args.devices.is_empty() {
            None
        } else {
            Some(args.devices)
        },
    })
}

fn run() -> Result<(), String> {
    let args = Args::parse();
    logger::init(args.trace_log.as_deref(), args.verbose).map_err(|err| err.to_string())?;

    let cfg = build_cfg(args).map_err(|err| err.to_string())?;
    cfg.validate()?;
    log::info!(
        "emulating a {} {} PSP in {} mode, ACPI state {}",
        cfg.micro_arch,
        cfg.cpu_segment,
        cfg.mode,
        cfg.acpi_state
    );
    if let Some(path) = &cfg.trace_log {
        log::info!("tracing to {}", path.display());
    }
    let cfg = Rc::new(cfg);

    let mut ccds = Vec::new();
    for socket_id in 0..cfg.sockets {
        for ccd_id in 0..cfg.ccds_per_socket {
            ccds.push(
                Ccd::create(socket_id, ccd_id, cfg.clone())
                    .map_err(|err| format!("creating CCD {}/{} failed: {}", socket_id, ccd_id, err))?,
            );
        }
    }

    // Translate Ctrl-C into a cooperative stop of the run loop.
    let running = Arc::new(AtomicBool::new(true));
    let running_sig = running.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        running_sig.store(false, Ordering::Relaxed);
    }) {
        log::warn!("installing the Ctrl-C handler failed: {}", err);
    }

    ccds[0]
        .run(&running)
        .map_err(|err| format!("emulation runloop failed: {}", err))
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
