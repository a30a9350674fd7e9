/*++

Licensed under the Apache-2.0 license.

File Name:

    flash.rs

Abstract:

    Flash ROM mapped into SMN space, with an optional EM100 style network
    service to read and patch the flash contents at runtime.

--*/

use crate::{DeviceCtx, DeviceDescriptor, DeviceError, DeviceInstance};
use pspemu_bus::IoManager;
use pspemu_cpu::ExecCtx;
use pspemu_types::AccessSize;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Magic of an EM100 service request header.
const EM100_REQ_MAGIC: u32 = 0xebad_c0de;

const EM100_CMD_READ: u32 = 0;
const EM100_CMD_WRITE: u32 = 1;

pub static DEVICE: DeviceDescriptor = DeviceDescriptor {
    name: "flash",
    description: "Flash device",
    instantiate,
};

fn instantiate(iom: &mut IoManager, ctx: &DeviceCtx) -> Result<DeviceInstance, DeviceError> {
    let smn_base = ctx.micro_arch.flash_smn_addr();
    let flash_len = ctx.flash.lock().unwrap().len() as u64;

    let flash = ctx.flash.clone();
    let read = Box::new(move |_ctx: &mut dyn ExecCtx, off: u64, size: AccessSize| {
        let flash = flash.lock().unwrap();
        let off = off as usize;
        let len = size.bytes().min(4);
        let mut buf = [0u8; 4];
        if off + len <= flash.len() {
            buf[..len].copy_from_slice(&flash[off..off + len]);
        }
        u32::from_le_bytes(buf)
    });
    let write = Box::new(|_ctx: &mut dyn ExecCtx, off: u64, size: AccessSize, val: u32| {
        log::warn!(
            "flash: ignoring write of {:#x} at {:#x} ({} bytes)",
            val,
            off,
            size.bytes()
        );
    });
    let region = iom.smn_register(smn_base, flash_len, Some(read), Some(write))?;

    let mut instance = DeviceInstance::new(&DEVICE, vec![region]);
    if ctx.em100_port != 0 {
        instance.shutdown = Some(start_em100_service(ctx.em100_port, ctx.flash.clone())?);
    }
    Ok(instance)
}

/// Starts the EM100 network service; the returned closure stops it.
fn start_em100_service(
    port: u16,
    flash: Arc<Mutex<Vec<u8>>>,
) -> Result<Box<dyn FnOnce()>, DeviceError> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    listener.set_nonblocking(true)?;
    log::info!("EM100 flash emulation listening on port {}", port);

    let running = Arc::new(AtomicBool::new(true));
    let running_io = running.clone();
    let handle = std::thread::spawn(move || {
        while running_io.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    log::info!("EM100: connection from {}", peer);
                    if let Err(err) = serve_connection(stream, &running_io, &flash) {
                        log::warn!("EM100: connection ended: {}", err);
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(err) => {
                    log::error!("EM100: accept failed: {}", err);
                    break;
                }
            }
        }
    });

    Ok(Box::new(move || {
        running.store(false, Ordering::Relaxed);
        let _ = handle.join();
    }))
}

fn serve_connection(
    mut stream: TcpStream,
    running: &AtomicBool,
    flash: &Mutex<Vec<u8>>,
) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_millis(100)))?;

    let mut hdr = [0u8; 16];
    while running.load(Ordering::Relaxed) {
        match stream.read_exact(&mut hdr) {
            Ok(()) => {}
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => return Err(err),
        }

        let magic = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
        let cmd = u32::from_le_bytes(hdr[4..8].try_into().unwrap());
        let addr = u32::from_le_bytes(hdr[8..12].try_into().unwrap()) as usize;
        let len = u32::from_le_bytes(hdr[12..16].try_into().unwrap()) as usize;
        if magic != EM100_REQ_MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "bad request magic",
            ));
        }

        match cmd {
            EM100_CMD_WRITE => {
                let mut data = vec![0u8; len];
                stream.read_exact(&mut data)?;
                let mut flash = flash.lock().unwrap();
                if addr + len <= flash.len() {
                    flash[addr..addr + len].copy_from_slice(&data);
                }
                stream.write_all(&0i32.to_le_bytes())?;
            }
            EM100_CMD_READ => {
                let data = {
                    let flash = flash.lock().unwrap();
                    if addr + len <= flash.len() {
                        flash[addr..addr + len].to_vec()
                    } else {
                        vec![0u8; len]
                    }
                };
                stream.write_all(&0i32.to_le_bytes())?;
                stream.write_all(&data)?;
            }
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "unknown command",
                ))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use pspemu_bus::UnassignedPolicy;
    use pspemu_cpu::testing::{ExecState, TestCtx};
    use pspemu_types::{MicroArch, MMIO_WINDOW_BASE, SMN_CTRL_BASE};

    #[test]
    fn test_flash_reads_serve_image() {
        let iom = IoManager::detached(UnassignedPolicy::ZeroRead).unwrap();
        let mut image = vec![0u8; 0x1000];
        image[0x200..0x204].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd]);
        let ctx = DeviceCtx::new(MicroArch::Zen, image);
        instantiate(&mut iom.borrow_mut(), &ctx).unwrap();

        let mut state = ExecState::default();
        // Flash lives at SMN 0x0a000000; map it into slot 0.
        let ctrl_off = (SMN_CTRL_BASE - MMIO_WINDOW_BASE) as u64;
        IoManager::mmio_window_write(
            &iom,
            &mut TestCtx(&mut state),
            ctrl_off,
            AccessSize::Word,
            0x0a0,
        );
        let val = IoManager::smn_window_read(&iom, &mut TestCtx(&mut state), 0x200, AccessSize::Word);
        assert_eq!(val, 0xddcc_bbaa);
        // Reads beyond the image are zero filled.
        let val =
            IoManager::smn_window_read(&iom, &mut TestCtx(&mut state), 0xffc, AccessSize::Word);
        assert_eq!(val, 0);
    }

    #[test]
    fn test_em100_round_trip() {
        let iom = IoManager::detached(UnassignedPolicy::ZeroRead).unwrap();
        let mut ctx = DeviceCtx::new(MicroArch::Zen, vec![0x55u8; 0x100]);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        ctx.em100_port = listener.local_addr().unwrap().port();
        drop(listener);
        let instance = instantiate(&mut iom.borrow_mut(), &ctx).unwrap();

        let mut stream = loop {
            match TcpStream::connect(("127.0.0.1", ctx.em100_port)) {
                Ok(stream) => break stream,
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        };

        // Patch four bytes, then read them back.
        let mut req = Vec::new();
        req.extend_from_slice(&EM100_REQ_MAGIC.to_le_bytes());
        req.extend_from_slice(&EM100_CMD_WRITE.to_le_bytes());
        req.extend_from_slice(&0x10u32.to_le_bytes());
        req.extend_from_slice(&4u32.to_le_bytes());
        req.extend_from_slice(&[1, 2, 3, 4]);
        stream.write_all(&req).unwrap();
        let mut sts = [0u8; 4];
        stream.read_exact(&mut sts).unwrap();
        assert_eq!(i32::from_le_bytes(sts), 0);

        let mut req = Vec::new();
        req.extend_from_slice(&EM100_REQ_MAGIC.to_le_bytes());
        req.extend_from_slice(&EM100_CMD_READ.to_le_bytes());
        req.extend_from_slice(&0x10u32.to_le_bytes());
        req.extend_from_slice(&4u32.to_le_bytes());
        stream.write_all(&req).unwrap();
        stream.read_exact(&mut sts).unwrap();
        assert_eq!(i32::from_le_bytes(sts), 0);
        let mut data = [0u8; 4];
        stream.read_exact(&mut data).unwrap();
        assert_eq!(data, [1, 2, 3, 4]);

        assert_eq!(&ctx.flash.lock().unwrap()[0x10..0x14], &[1, 2, 3, 4]);
        drop(stream);
        instance.destroy(&mut iom.borrow_mut());
    }
}
