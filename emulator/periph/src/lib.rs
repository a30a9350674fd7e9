/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    Emulated PSP peripherals and the device registry the CCD instantiates
    from.

--*/

mod ccp_v5;
mod flash;
mod smn_unknown;
mod status;
mod timer;
mod unk_0x03010000;
mod x86_mem;
mod x86_uart;

use pspemu_bus::{IoManager, IomError, RegionHandle};
use pspemu_types::MicroArch;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no device named {0:?}")]
    UnknownDevice(String),

    #[error("registering device regions failed: {0}")]
    Iom(#[from] IomError),

    #[error("device backend failed: {0}")]
    Backend(#[from] std::io::Error),
}

/// Shared context handed to devices at instantiation.
#[derive(Clone)]
pub struct DeviceCtx {
    pub micro_arch: MicroArch,
    /// Whether the timer ticks in wall-clock time.
    pub timer_realtime: bool,
    /// The flash ROM contents, shared with the EM100 service thread.
    pub flash: Arc<Mutex<Vec<u8>>>,
    /// TCP port of the EM100 flash emulation service, 0 disables it.
    pub em100_port: u16,
}

impl DeviceCtx {
    pub fn new(micro_arch: MicroArch, flash: Vec<u8>) -> Self {
        Self {
            micro_arch,
            timer_realtime: false,
            flash: Arc::new(Mutex::new(flash)),
            em100_port: 0,
        }
    }
}

/// Constructor of a device: registers its regions and returns the instance.
pub type InstantiateFn = fn(&mut IoManager, &DeviceCtx) -> Result<DeviceInstance, DeviceError>;

/// Immutable description of an emulated device.
pub struct DeviceDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub instantiate: InstantiateFn,
}

/// A live device: the regions it registered, torn down on destroy.
pub struct DeviceInstance {
    desc: &'static DeviceDescriptor,
    regions: Vec<RegionHandle>,
    /// Backend shutdown (EM100 service thread).
    shutdown: Option<Box<dyn FnOnce()>>,
}

impl DeviceInstance {
    fn new(desc: &'static DeviceDescriptor, regions: Vec<RegionHandle>) -> Self {
        Self {
            desc,
            regions,
            shutdown: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.desc.name
    }

    pub fn descriptor(&self) -> &'static DeviceDescriptor {
        self.desc
    }

    /// Removes the device's regions from the I/O manager and stops any
    /// backends.
    pub fn destroy(mut self, iom: &mut IoManager) {
        for region in self.regions.drain(..) {
            if let Err(err) = iom.deregister(&region) {
                log::error!("removing a region of {} failed: {}", self.desc.name, err);
            }
        }
        if let Some(shutdown) = self.shutdown.take() {
            shutdown();
        }
    }
}

/// Every known device. The CCD instantiates all of them by default, or the
/// subset selected by name.
pub static DEVICE_REGISTRY: &[&DeviceDescriptor] = &[
    &ccp_v5::DEVICE,
    &timer::DEVICE,
    &flash::DEVICE,
    &status::DEVICE,
    &unk_0x03010000::DEVICE,
    &smn_unknown::DEVICE,
    &x86_uart::DEVICE,
    &x86_mem::DEVICE,
];

/// Looks a device up by its registry name.
pub fn find_device(name: &str) -> Option<&'static DeviceDescriptor> {
    DEVICE_REGISTRY
        .iter()
        .copied()
        .find(|desc| desc.name == name)
}
