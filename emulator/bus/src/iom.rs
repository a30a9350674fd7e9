/*++

Licensed under the Apache-2.0 license.

File Name:

    iom.rs

Abstract:

    The I/O manager. Claims the fixed SMN/MMIO/x86 dispatch windows of the
    PSP address space once at construction and routes every guest access to
    the region registered for it.

--*/

use pspemu_cpu::{ExecCtx, PspCore};
use pspemu_types::{
    AccessSize, PspAddr, SmnAddr, X86PhysAddr, MMIO_WINDOW_BASE, MMIO_WINDOW_END, SMN_CTRL_BASE,
    SMN_SLOT_COUNT, SMN_SLOT_LEN, SMN_WINDOW_BASE, X86_MAP_CTRL2_BASE, X86_MAP_CTRL3_BASE,
    X86_MAP_CTRL_BASE, X86_SLOT_LEN, X86_WINDOW_BASE, X86_WINDOW_SLOT_COUNT,
};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use thiserror::Error;

/// Region read callback; the offset is relative to the region start.
pub type IoReadFn = Box<dyn FnMut(&mut dyn ExecCtx, u64, AccessSize) -> u32>;

/// Region write callback, fire and forget.
pub type IoWriteFn = Box<dyn FnMut(&mut dyn ExecCtx, u64, AccessSize, u32)>;

/// Fetch callback initializing x86 memory region contents on first access.
pub type MemFetchFn = Box<dyn FnMut(u64, &mut [u8])>;

#[derive(Debug, Error)]
pub enum IomError {
    #[error("region {base:#x}+{len:#x} overlaps an existing region")]
    RegionOverlap { base: u64, len: u64 },

    #[error("no such region")]
    RegionNotFound,

    #[error("region is not memory backed")]
    NotMemRegion,

    #[error("core error: {0}")]
    Core(#[from] pspemu_cpu::CoreError),
}

/// Behavior for accesses hitting no registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnassignedPolicy {
    /// Log, reads return zero, writes are dropped.
    ZeroRead,
    /// Log and stop the core.
    Fault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Space {
    Mmio,
    Smn,
    X86Phys,
    X86Window,
}

/// Opaque handle to a registered region.
#[derive(Debug, Clone)]
pub struct RegionHandle {
    space: Space,
    base: u64,
    id: u64,
}

/// Backing of an x86 memory region, fetched on demand.
struct X86MemBacking {
    backing: Vec<u8>,
    /// Bytes initialized with valid data so far.
    valid: usize,
    /// High-water mark of writes (exclusive), the range to sync back.
    written: usize,
    fetch: Option<MemFetchFn>,
}

impl X86MemBacking {
    fn ensure(&mut self, end: usize) {
        if end > self.valid {
            let start = self.valid;
            let fetch_len = end - self.valid;
            self.backing.resize(start + fetch_len, 0);
            if let Some(fetch) = self.fetch.as_mut() {
                fetch(start as u64, &mut self.backing[start..start + fetch_len]);
            }
            self.valid += fetch_len;
        }
    }

    fn read(&mut self, off: u64, buf: &mut [u8]) {
        let off = off as usize;
        self.ensure(off + buf.len());
        buf.copy_from_slice(&self.backing[off..off + buf.len()]);
    }

    fn write(&mut self, off: u64, data: &[u8]) {
        let off = off as usize;
        self.ensure(off + data.len());
        self.backing[off..off + data.len()].copy_from_slice(data);
        if off + data.len() > self.written {
            self.written = off + data.len();
        }
    }
}

enum RegionKind {
    Io {
        read: Option<Rc<RefCell<IoReadFn>>>,
        write: Option<Rc<RefCell<IoWriteFn>>>,
    },
    Mem(Rc<RefCell<X86MemBacking>>),
}

struct IoRegion {
    id: u64,
    len: u64,
    kind: RegionKind,
}

enum ReadTarget {
    Io(Rc<RefCell<IoReadFn>>, u64),
    Mem(Rc<RefCell<X86MemBacking>>, u64),
    None,
}

enum WriteTarget {
    Io(Rc<RefCell<IoWriteFn>>, u64),
    Mem(Rc<RefCell<X86MemBacking>>, u64),
    None,
}

/// One x86 mapping control slot as programmed by the firmware.
#[derive(Debug, Clone, Copy, Default)]
pub struct X86MapCtrlSlot {
    pub base_addr: u32,
    pub unk1: u32,
    pub unk2: u32,
    pub unk3: u32,
    pub unk4: u32,
    pub unk5: u32,
}

impl X86MapCtrlSlot {
    /// Decodes the programmed x86 physical base address.
    pub fn phys_base(&self) -> X86PhysAddr {
        ((self.base_addr & 0x3f) as u64) << 26 | ((self.base_addr >> 6) as u64) << 32
    }
}

/// The I/O manager state.
pub struct IoManager {
    mmio: BTreeMap<u64, IoRegion>,
    smn: BTreeMap<u64, IoRegion>,
    x86_phys: BTreeMap<u64, IoRegion>,
    x86_win: BTreeMap<u64, IoRegion>,
    /// SMN base currently mapped into each 1 MiB slot.
    smn_slots: Rc<RefCell<[SmnAddr; SMN_SLOT_COUNT as usize]>>,
    /// x86 mapping control registers.
    x86_slots: Rc<RefCell<[X86MapCtrlSlot; X86_WINDOW_SLOT_COUNT as usize]>>,
    unassigned: UnassignedPolicy,
    next_id: u64,
}

impl IoManager {
    /// Creates an I/O manager with the built-in control regions registered
    /// but no dispatch windows claimed on a core. Dispatch is driven
    /// through the `*_window_*` entry points; tests use this directly.
    pub fn detached(unassigned: UnassignedPolicy) -> Result<Rc<RefCell<IoManager>>, IomError> {
        let iom = Rc::new(RefCell::new(IoManager {
            mmio: BTreeMap::new(),
            smn: BTreeMap::new(),
            x86_phys: BTreeMap::new(),
            x86_win: BTreeMap::new(),
            smn_slots: Rc::new(RefCell::new([0; SMN_SLOT_COUNT as usize])),
            x86_slots: Rc::new(RefCell::new(
                [X86MapCtrlSlot::default(); X86_WINDOW_SLOT_COUNT as usize],
            )),
            unassigned,
            next_id: 1,
        }));
        iom.borrow_mut().register_ctrl_regions()?;
        Ok(iom)
    }

    /// Creates the I/O manager and claims the fixed dispatch windows on the
    /// core. Device registration never touches the core afterwards.
    pub fn attach(
        core: &mut PspCore,
        unassigned: UnassignedPolicy,
    ) -> Result<Rc<RefCell<IoManager>>, IomError> {
        let iom = Self::detached(unassigned)?;

        let read = {
            let iom = iom.clone();
            Box::new(move |ctx: &mut dyn ExecCtx, off: u64, size: AccessSize| {
                IoManager::smn_window_read(&iom, ctx, off, size)
            })
        };
        let write = {
            let iom = iom.clone();
            Box::new(move |ctx: &mut dyn ExecCtx, off: u64, size: AccessSize, val: u32| {
                IoManager::smn_window_write(&iom, ctx, off, size, val)
            })
        };
        core.mmio_register(
            SMN_WINDOW_BASE,
            (SMN_SLOT_COUNT * SMN_SLOT_LEN) as usize,
            read,
            write,
        )?;

        let read = {
            let iom = iom.clone();
            Box::new(move |ctx: &mut dyn ExecCtx, off: u64, size: AccessSize| {
                IoManager::mmio_window_read(&iom, ctx, off, size)
            })
        };
        let write = {
            let iom = iom.clone();
            Box::new(move |ctx: &mut dyn ExecCtx, off: u64, size: AccessSize, val: u32| {
                IoManager::mmio_window_write(&iom, ctx, off, size, val)
            })
        };
        core.mmio_register(
            MMIO_WINDOW_BASE,
            (MMIO_WINDOW_END - MMIO_WINDOW_BASE) as usize,
            read,
            write,
        )?;

        let read = {
            let iom = iom.clone();
            Box::new(move |ctx: &mut dyn ExecCtx, off: u64, size: AccessSize| {
                IoManager::x86_window_read(&iom, ctx, off, size)
            })
        };
        let write = {
            let iom = iom.clone();
            Box::new(move |ctx: &mut dyn ExecCtx, off: u64, size: AccessSize, val: u32| {
                IoManager::x86_window_write(&iom, ctx, off, size, val)
            })
        };
        core.mmio_register(
            X86_WINDOW_BASE,
            (X86_WINDOW_SLOT_COUNT * X86_SLOT_LEN) as usize,
            read,
            write,
        )?;

        Ok(iom)
    }

    /// Registers the SMN slot and x86 mapping control register interfaces.
    fn register_ctrl_regions(&mut self) -> Result<(), IomError> {
        let slots = self.smn_slots.clone();
        let read: IoReadFn = Box::new(move |_ctx, off, size| {
            if size != AccessSize::Word {
                log::error!("MMIO/SMN: invalid control read size {}", size.bytes());
                return 0;
            }
            let idx = ((off / 4) * 2) as usize;
            let slots = slots.borrow();
            (slots[idx + 1] >> 20) << 16 | (slots[idx] >> 20)
        });
        let slots = self.smn_slots.clone();
        let write: IoWriteFn = Box::new(move |_ctx, off, size, val| {
            let mut slots = slots.borrow_mut();
            match size {
                AccessSize::Word => {
                    // Each 4 byte access programs two slots.
                    let idx = ((off / 4) * 2) as usize;
                    log::debug!(
                        "MMIO/SMN: mapping slot {} and {} to {:#010x}",
                        idx,
                        idx + 1,
                        val
                    );
                    slots[idx] = (val & 0xffff) << 20;
                    slots[idx + 1] = (val >> 16) << 20;
                }
                AccessSize::HalfWord => {
                    let idx = (off / 2) as usize;
                    log::debug!("MMIO/SMN: mapping slot {} to {:#010x}", idx, val);
                    slots[idx] = (val & 0xffff) << 20;
                }
                _ => log::error!("MMIO/SMN: invalid control write size {}", size.bytes()),
            }
        });
        self.mmio_register(SMN_CTRL_BASE, 16 * 4, Some(read), Some(write))?;

        let slots = self.x86_slots.clone();
        let read: IoReadFn = Box::new(move |_ctx, off, size| {
            if size != AccessSize::Word {
                log::error!("MMIO/X86: mapping control read size {}", size.bytes());
                return 0;
            }
            let idx = (off / 16) as usize;
            let slot = slots.borrow()[idx];
            match off % 16 {
                0 => slot.base_addr,
                4 => slot.unk1,
                8 => slot.unk2,
                12 => slot.unk3,
                off_slot => {
                    log::error!("MMIO/X86: impossible slot offset {:#x}", off_slot);
                    0
                }
            }
        });
        let slots = self.x86_slots.clone();
        let write: IoWriteFn = Box::new(move |_ctx, off, size, val| {
            if size != AccessSize::Word {
                log::error!("MMIO/X86: mapping control write size {}", size.bytes());
                return;
            }
            let idx = (off / 16) as usize;
            let slot = &mut slots.borrow_mut()[idx];
            match off % 16 {
                0 => slot.base_addr = val,
                4 => slot.unk1 = val,
                8 => slot.unk2 = val,
                12 => slot.unk3 = val,
                off_slot => log::error!("MMIO/X86: impossible slot offset {:#x}", off_slot),
            }
        });
        self.mmio_register(
            X86_MAP_CTRL_BASE,
            X86_WINDOW_SLOT_COUNT as u64 * 16,
            Some(read),
            Some(write),
        )?;

        let slots = self.x86_slots.clone();
        let read: IoReadFn = Box::new(move |_ctx, off, size| {
            if size != AccessSize::Word {
                log::error!("MMIO/X86: mapping control 2 read size {}", size.bytes());
                return 0;
            }
            slots.borrow()[(off / 4) as usize].unk4
        });
        let slots = self.x86_slots.clone();
        let write: IoWriteFn = Box::new(move |_ctx, off, size, val| {
            if size != AccessSize::Word {
                log::error!("MMIO/X86: mapping control 2 write size {}", size.bytes());
                return;
            }
            slots.borrow_mut()[(off / 4) as usize].unk4 = val;
        });
        self.mmio_register(
            X86_MAP_CTRL2_BASE,
            X86_WINDOW_SLOT_COUNT as u64 * 4,
            Some(read),
            Some(write),
        )?;

        let slots = self.x86_slots.clone();
        let read: IoReadFn = Box::new(move |_ctx, off, size| {
            if size != AccessSize::Word {
                log::error!("MMIO/X86: mapping control 3 read size {}", size.bytes());
                return 0;
            }
            slots.borrow()[(off / 4) as usize].unk5
        });
        let slots = self.x86_slots.clone();
        let write: IoWriteFn = Box::new(move |_ctx, off, size, val| {
            if size != AccessSize::Word {
                log::error!("MMIO/X86: mapping control 3 write size {}", size.bytes());
                return;
            }
            let idx = (off / 4) as usize;
            let mut slots = slots.borrow_mut();
            slots[idx].unk5 = val;
            // Last register written in the mapping sequence, dump the slot.
            let slot = slots[idx];
            log::debug!(
                "MMIO/X86: slot {} base_addr={:#010x} ({:#014x}) unk1={:#x} unk2={:#x} unk3={:#x} unk4={:#x} unk5={:#x}",
                idx,
                slot.base_addr,
                slot.phys_base(),
                slot.unk1,
                slot.unk2,
                slot.unk3,
                slot.unk4,
                slot.unk5
            );
        });
        self.mmio_register(
            X86_MAP_CTRL3_BASE,
            X86_WINDOW_SLOT_COUNT as u64 * 4,
            Some(read),
            Some(write),
        )?;

        Ok(())
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn insert(
        table: &mut BTreeMap<u64, IoRegion>,
        base: u64,
        region: IoRegion,
    ) -> Result<(), IomError> {
        let len = region.len;
        if let Some((prev_base, prev)) = table.range(..=base).next_back() {
            if base < prev_base + prev.len {
                return Err(IomError::RegionOverlap { base, len });
            }
        }
        if let Some((next_base, _)) = table.range(base..).next() {
            if base + len > *next_base {
                return Err(IomError::RegionOverlap { base, len });
            }
        }
        table.insert(base, region);
        Ok(())
    }

    fn register_io(
        &mut self,
        space: Space,
        base: u64,
        len: u64,
        read: Option<IoReadFn>,
        write: Option<IoWriteFn>,
    ) -> Result<RegionHandle, IomError> {
        let id = self.alloc_id();
        let region = IoRegion {
            id,
            len,
            kind: RegionKind::Io {
                read: read.map(|cb| Rc::new(RefCell::new(cb))),
                write: write.map(|cb| Rc::new(RefCell::new(cb))),
            },
        };
        Self::insert(self.table_mut(space), base, region)?;
        Ok(RegionHandle { space, base, id })
    }

    /// Registers read/write handlers for the given MMIO region.
    pub fn mmio_register(
        &mut self,
        base: PspAddr,
        len: u64,
        read: Option<IoReadFn>,
        write: Option<IoWriteFn>,
    ) -> Result<RegionHandle, IomError> {
        self.register_io(Space::Mmio, base as u64, len, read, write)
    }

    /// Registers read/write handlers for the given SMN region.
    pub fn smn_register(
        &mut self,
        base: SmnAddr,
        len: u64,
        read: Option<IoReadFn>,
        write: Option<IoWriteFn>,
    ) -> Result<RegionHandle, IomError> {
        self.register_io(Space::Smn, base as u64, len, read, write)
    }

    /// Registers read/write handlers for the given x86 MMIO region.
    pub fn x86_mmio_register(
        &mut self,
        base: X86PhysAddr,
        len: u64,
        read: Option<IoReadFn>,
        write: Option<IoWriteFn>,
    ) -> Result<RegionHandle, IomError> {
        self.register_io(Space::X86Phys, base, len, read, write)
    }

    /// Registers an x86 memory backed region. The contents are initialized
    /// on first access through the fetch callback (zero filled without one).
    pub fn x86_mem_register(
        &mut self,
        base: X86PhysAddr,
        len: u64,
        fetch: Option<MemFetchFn>,
    ) -> Result<RegionHandle, IomError> {
        let id = self.alloc_id();
        let region = IoRegion {
            id,
            len,
            kind: RegionKind::Mem(Rc::new(RefCell::new(X86MemBacking {
                backing: Vec::new(),
                valid: 0,
                written: 0,
                fetch,
            }))),
        };
        Self::insert(&mut self.x86_phys, base, region)?;
        Ok(RegionHandle {
            space: Space::X86Phys,
            base,
            id,
        })
    }

    /// Registers a dynamically mapped x86 window at its PSP side address
    /// (one of the eight hardware mapping slots).
    pub fn x86_window_register(
        &mut self,
        base: PspAddr,
        len: u64,
        read: Option<IoReadFn>,
        write: Option<IoWriteFn>,
    ) -> Result<RegionHandle, IomError> {
        self.register_io(Space::X86Window, base as u64, len, read, write)
    }

    /// Removes a registered region; x86 memory regions drop their backing.
    pub fn deregister(&mut self, handle: &RegionHandle) -> Result<(), IomError> {
        let table = self.table_mut(handle.space);
        match table.get(&handle.base) {
            Some(region) if region.id == handle.id => {
                table.remove(&handle.base);
                Ok(())
            }
            _ => Err(IomError::RegionNotFound),
        }
    }

    /// Reads from an x86 memory backed region, fetching as needed.
    pub fn x86_mem_read(
        &mut self,
        handle: &RegionHandle,
        off: u64,
        buf: &mut [u8],
    ) -> Result<(), IomError> {
        let mem = self.mem_backing(handle)?;
        mem.borrow_mut().read(off, buf);
        Ok(())
    }

    /// Writes to an x86 memory backed region.
    pub fn x86_mem_write(
        &mut self,
        handle: &RegionHandle,
        off: u64,
        data: &[u8],
    ) -> Result<(), IomError> {
        let mem = self.mem_backing(handle)?;
        mem.borrow_mut().write(off, data);
        Ok(())
    }

    /// High-water mark of writes into an x86 memory backed region.
    pub fn x86_mem_written(&self, handle: &RegionHandle) -> Result<u64, IomError> {
        match self.x86_phys.get(&handle.base) {
            Some(IoRegion {
                kind: RegionKind::Mem(mem),
                id,
                ..
            }) if *id == handle.id => Ok(mem.borrow().written as u64),
            Some(_) => Err(IomError::NotMemRegion),
            None => Err(IomError::RegionNotFound),
        }
    }

    fn mem_backing(
        &mut self,
        handle: &RegionHandle,
    ) -> Result<Rc<RefCell<X86MemBacking>>, IomError> {
        match self.x86_phys.get(&handle.base) {
            Some(IoRegion {
                kind: RegionKind::Mem(mem),
                id,
                ..
            }) if *id == handle.id => Ok(mem.clone()),
            Some(_) => Err(IomError::NotMemRegion),
            None => Err(IomError::RegionNotFound),
        }
    }

    fn table_mut(&mut self, space: Space) -> &mut BTreeMap<u64, IoRegion> {
        match space {
            Space::Mmio => &mut self.mmio,
            Space::Smn => &mut self.smn,
            Space::X86Phys => &mut self.x86_phys,
            Space::X86Window => &mut self.x86_win,
        }
    }

    /// Current value of an x86 mapping control slot.
    pub fn x86_map_ctrl_slot(&self, idx: usize) -> X86MapCtrlSlot {
        self.x86_slots.borrow()[idx]
    }

    /// SMN base currently programmed into a mapping slot.
    pub fn smn_slot(&self, idx: usize) -> SmnAddr {
        self.smn_slots.borrow()[idx]
    }

    fn find(table: &BTreeMap<u64, IoRegion>, addr: u64) -> Option<(u64, &IoRegion)> {
        table
            .range(..=addr)
            .next_back()
            .filter(|&(base, region)| addr < *base + region.len)
            .map(|(base, region)| (*base, region))
    }

    fn resolve_read(table: &BTreeMap<u64, IoRegion>, addr: u64) -> ReadTarget {
        match Self::find(table, addr) {
            Some((base, region)) => match &region.kind {
                RegionKind::Io {
                    read: Some(read), ..
                } => ReadTarget::Io(read.clone(), addr - base),
                RegionKind::Io { .. } => ReadTarget::None,
                RegionKind::Mem(mem) => ReadTarget::Mem(mem.clone(), addr - base),
            },
            None => ReadTarget::None,
        }
    }

    fn resolve_write(table: &BTreeMap<u64, IoRegion>, addr: u64) -> WriteTarget {
        match Self::find(table, addr) {
            Some((base, region)) => match &region.kind {
                RegionKind::Io {
                    write: Some(write), ..
                } => WriteTarget::Io(write.clone(), addr - base),
                RegionKind::Io { .. } => WriteTarget::None,
                RegionKind::Mem(mem) => WriteTarget::Mem(mem.clone(), addr - base),
            },
            None => WriteTarget::None,
        }
    }

    fn unassigned_read(
        iom: &Rc<RefCell<IoManager>>,
        ctx: &mut dyn ExecCtx,
        origin: &str,
        addr: u64,
        size: AccessSize,
    ) -> u32 {
        log::warn!(
            "{}: unassigned read at {:#x} ({} bytes) -> returning 0",
            origin,
            addr,
            size.bytes()
        );
        if iom.borrow().unassigned == UnassignedPolicy::Fault {
            ctx.request_stop();
        }
        0
    }

    fn unassigned_write(
        iom: &Rc<RefCell<IoManager>>,
        ctx: &mut dyn ExecCtx,
        origin: &str,
        addr: u64,
        size: AccessSize,
        val: u32,
    ) {
        log::warn!(
            "{}: unassigned write of {:#x} at {:#x} ({} bytes) -> ignored",
            origin,
            val,
            addr,
            size.bytes()
        );
        if iom.borrow().unassigned == UnassignedPolicy::Fault {
            ctx.request_stop();
        }
    }

    fn mem_read_val(mem: &Rc<RefCell<X86MemBacking>>, off: u64, size: AccessSize) -> u32 {
        let mut buf = [0u8; 4];
        let len = size.bytes().min(4);
        mem.borrow_mut().read(off, &mut buf[..len]);
        u32::from_le_bytes(buf)
    }

    fn mem_write_val(mem: &Rc<RefCell<X86MemBacking>>, off: u64, size: AccessSize, val: u32) {
        let bytes = val.to_le_bytes();
        let len = size.bytes().min(4);
        mem.borrow_mut().write(off, &bytes[..len]);
    }

    /// Dispatch for the standard MMIO window.
    pub fn mmio_window_read(
        iom: &Rc<RefCell<IoManager>>,
        ctx: &mut dyn ExecCtx,
        off: u64,
        size: AccessSize,
    ) -> u32 {
        let addr = MMIO_WINDOW_BASE as u64 + off;
        let target = {
            let iom = iom.borrow();
            Self::resolve_read(&iom.mmio, addr)
        };
        match target {
            ReadTarget::Io(cb, rel) => {
                let mut cb = cb.borrow_mut();
                (&mut *cb)(ctx, rel, size)
            }
            _ => Self::unassigned_read(iom, ctx, "MMIO", addr, size),
        }
    }

    pub fn mmio_window_write(
        iom: &Rc<RefCell<IoManager>>,
        ctx: &mut dyn ExecCtx,
        off: u64,
        size: AccessSize,
        val: u32,
    ) {
        let addr = MMIO_WINDOW_BASE as u64 + off;
        let target = {
            let iom = iom.borrow();
            Self::resolve_write(&iom.mmio, addr)
        };
        match target {
            WriteTarget::Io(cb, rel) => {
                let mut cb = cb.borrow_mut();
                (&mut *cb)(ctx, rel, size, val)
            }
            _ => Self::unassigned_write(iom, ctx, "MMIO", addr, size, val),
        }
    }

    fn smn_addr_from_slot(&self, off: u64) -> SmnAddr {
        // Each slot is 1MB big, the upper bits select the slot.
        let idx = (off >> 20) as usize;
        let off_slot = off as u32 & (SMN_SLOT_LEN - 1);
        self.smn_slots.borrow()[idx] | off_slot
    }

    /// Dispatch for the window the SMN mapping slots live in.
    pub fn smn_window_read(
        iom: &Rc<RefCell<IoManager>>,
        ctx: &mut dyn ExecCtx,
        off: u64,
        size: AccessSize,
    ) -> u32 {
        let (addr, target) = {
            let iom = iom.borrow();
            let addr = iom.smn_addr_from_slot(off);
            (addr, Self::resolve_read(&iom.smn, addr as u64))
        };
        match target {
            ReadTarget::Io(cb, rel) => {
                let mut cb = cb.borrow_mut();
                (&mut *cb)(ctx, rel, size)
            }
            _ => Self::unassigned_read(iom, ctx, "SMN", addr as u64, size),
        }
    }

    pub fn smn_window_write(
        iom: &Rc<RefCell<IoManager>>,
        ctx: &mut dyn ExecCtx,
        off: u64,
        size: AccessSize,
        val: u32,
    ) {
        let (addr, target) = {
            let iom = iom.borrow();
            let addr = iom.smn_addr_from_slot(off);
            (addr, Self::resolve_write(&iom.smn, addr as u64))
        };
        match target {
            WriteTarget::Io(cb, rel) => {
                let mut cb = cb.borrow_mut();
                (&mut *cb)(ctx, rel, size, val)
            }
            _ => Self::unassigned_write(iom, ctx, "SMN", addr as u64, size, val),
        }
    }

    fn x86_phys_from_slot(&self, off: u64) -> X86PhysAddr {
        // Each slot is 64MB big, the upper bits select the slot.
        let idx = (off >> 26) as usize;
        let off_slot = off & (X86_SLOT_LEN as u64 - 1);
        self.x86_slots.borrow()[idx].phys_base() | off_slot
    }

    /// Dispatch for the window x86 mappings appear in: dynamically mapped
    /// windows take precedence, everything else goes through the mapping
    /// control slot translation into the x86 physical space.
    pub fn x86_window_read(
        iom: &Rc<RefCell<IoManager>>,
        ctx: &mut dyn ExecCtx,
        off: u64,
        size: AccessSize,
    ) -> u32 {
        let psp_addr = X86_WINDOW_BASE as u64 + off;
        let win = {
            let iom = iom.borrow();
            Self::resolve_read(&iom.x86_win, psp_addr)
        };
        if let ReadTarget::Io(cb, rel) = win {
            let mut cb = cb.borrow_mut();
            return (&mut *cb)(ctx, rel, size);
        }

        let (phys, target) = {
            let iom = iom.borrow();
            let phys = iom.x86_phys_from_slot(off);
            (phys, Self::resolve_read(&iom.x86_phys, phys))
        };
        match target {
            ReadTarget::Io(cb, rel) => {
                let mut cb = cb.borrow_mut();
                (&mut *cb)(ctx, rel, size)
            }
            ReadTarget::Mem(mem, rel) => Self::mem_read_val(&mem, rel, size),
            ReadTarget::None => Self::unassigned_read(iom, ctx, "X86", phys, size),
        }
    }

    pub fn x86_window_write(
        iom: &Rc<RefCell<IoManager>>,
        ctx: &mut dyn ExecCtx,
        off: u64,
        size: AccessSize,
        val: u32,
    ) {
        let psp_addr = X86_WINDOW_BASE as u64 + off;
        let win = {
            let iom = iom.borrow();
            Self::resolve_write(&iom.x86_win, psp_addr)
        };
        if let WriteTarget::Io(cb, rel) = win {
            let mut cb = cb.borrow_mut();
            return (&mut *cb)(ctx, rel, size, val);
        }

        let (phys, target) = {
            let iom = iom.borrow();
            let phys = iom.x86_phys_from_slot(off);
            (phys, Self::resolve_write(&iom.x86_phys, phys))
        };
        match target {
            WriteTarget::Io(cb, rel) => {
                let mut cb = cb.borrow_mut();
                (&mut *cb)(ctx, rel, size, val)
            }
            WriteTarget::Mem(mem, rel) => Self::mem_write_val(&mem, rel, size, val),
            WriteTarget::None => Self::unassigned_write(iom, ctx, "X86", phys, size, val),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pspemu_cpu::testing::{ExecState, TestCtx};

    fn iom() -> Rc<RefCell<IoManager>> {
        IoManager::detached(UnassignedPolicy::ZeroRead).unwrap()
    }

    #[test]
    fn test_overlap_rejected() {
        let iom = iom();
        let mut iom = iom.borrow_mut();
        iom.mmio_register(0x0301_0000, 4096, None, None).unwrap();
        assert!(matches!(
            iom.mmio_register(0x0301_0800, 4096, None, None),
            Err(IomError::RegionOverlap { .. })
        ));
        assert!(matches!(
            iom.mmio_register(0x0300_f000, 0x1001, None, None),
            Err(IomError::RegionOverlap { .. })
        ));
        // Adjacent regions are fine.
        iom.mmio_register(0x0301_1000, 4096, None, None).unwrap();
    }

    #[test]
    fn test_mmio_routing() {
        let iom = iom();
        iom.borrow_mut()
            .mmio_register(
                0x0301_0000,
                4096,
                Some(Box::new(|_ctx, off, _size| {
                    if off == 0x104 {
                        0x100
                    } else {
                        0
                    }
                })),
                None,
            )
            .unwrap();

        let mut state = ExecState::default();
        let off = (0x0301_0104u32 - MMIO_WINDOW_BASE) as u64;
        let val = IoManager::mmio_window_read(&iom, &mut TestCtx(&mut state), off, AccessSize::Word);
        assert_eq!(val, 0x100);

        // Unassigned access reads as zero.
        let val =
            IoManager::mmio_window_read(&iom, &mut TestCtx(&mut state), 0x4000, AccessSize::Word);
        assert_eq!(val, 0);
    }

    #[test]
    fn test_deregister_stops_routing() {
        let iom = iom();
        let handle = iom
            .borrow_mut()
            .mmio_register(
                0x0301_0000,
                4096,
                Some(Box::new(|_ctx, _off, _size| 0xabcd)),
                None,
            )
            .unwrap();

        let mut state = ExecState::default();
        let off = (0x0301_0000u32 - MMIO_WINDOW_BASE) as u64;
        assert_eq!(
            IoManager::mmio_window_read(&iom, &mut TestCtx(&mut state), off, AccessSize::Word),
            0xabcd
        );
        iom.borrow_mut().deregister(&handle).unwrap();
        assert_eq!(
            IoManager::mmio_window_read(&iom, &mut TestCtx(&mut state), off, AccessSize::Word),
            0
        );
        assert!(iom.borrow_mut().deregister(&handle).is_err());
    }

    #[test]
    fn test_smn_slot_translation() {
        let iom = iom();
        iom.borrow_mut()
            .smn_register(
                0x0005_e000,
                4,
                Some(Box::new(|_ctx, _off, _size| 0x1)),
                None,
            )
            .unwrap();

        let mut state = ExecState::default();
        // Program slots 0 and 1: slot 0 gets SMN base 0, slot 1 gets 0x100000.
        let ctrl_off = (SMN_CTRL_BASE - MMIO_WINDOW_BASE) as u64;
        IoManager::mmio_window_write(
            &iom,
            &mut TestCtx(&mut state),
            ctrl_off,
            AccessSize::Word,
            0x0001_0000,
        );
        assert_eq!(iom.borrow().smn_slot(0), 0);
        assert_eq!(iom.borrow().smn_slot(1), 1 << 20);

        // Slot 0 covers SMN 0x0 - 0xfffff, so the device is visible there.
        let val =
            IoManager::smn_window_read(&iom, &mut TestCtx(&mut state), 0x5e000, AccessSize::Word);
        assert_eq!(val, 0x1);
        // Slot 1 points elsewhere, nothing assigned.
        let val = IoManager::smn_window_read(
            &iom,
            &mut TestCtx(&mut state),
            (1 << 20) + 0x5e000,
            AccessSize::Word,
        );
        assert_eq!(val, 0);
    }

    #[test]
    fn test_x86_map_ctrl_decode() {
        let iom = iom();
        let mut state = ExecState::default();
        // Slot 2, base address register: select 64MB slot 0x12 and high bits 0x3.
        let reg: u32 = (0x3 << 6) | 0x12;
        let off = (X86_MAP_CTRL_BASE - MMIO_WINDOW_BASE) as u64 + 2 * 16;
        IoManager::mmio_window_write(&iom, &mut TestCtx(&mut state), off, AccessSize::Word, reg);
        let slot = iom.borrow().x86_map_ctrl_slot(2);
        assert_eq!(slot.base_addr, reg);
        assert_eq!(slot.phys_base(), (0x3u64 << 32) | (0x12u64 << 26));
    }

    #[test]
    fn test_x86_window_translation_to_mem_region() {
        let iom = iom();
        let handle = iom
            .borrow_mut()
            .x86_mem_register(0, 0x1000_0000, None)
            .unwrap();

        let mut state = ExecState::default();
        // Without programming any control slot, slot 0 decodes to base 0.
        IoManager::x86_window_write(
            &iom,
            &mut TestCtx(&mut state),
            0x40,
            AccessSize::Word,
            0xdeadbeef,
        );
        let val = IoManager::x86_window_read(&iom, &mut TestCtx(&mut state), 0x40, AccessSize::Word);
        assert_eq!(val, 0xdeadbeef);
        assert_eq!(iom.borrow().x86_mem_written(&handle).unwrap(), 0x44);
    }

    #[test]
    fn test_x86_mem_lazy_fetch() {
        let iom = iom();
        let handle = iom
            .borrow_mut()
            .x86_mem_register(
                0x1000,
                0x1000,
                Some(Box::new(|off, buf| {
                    for (idx, byte) in buf.iter_mut().enumerate() {
                        *byte = (off as u8).wrapping_add(idx as u8);
                    }
                })),
            )
            .unwrap();

        let mut buf = [0u8; 4];
        iom.borrow_mut().x86_mem_read(&handle, 8, &mut buf).unwrap();
        // Fetch starts at offset 0, so offset 8 holds 8..12.
        assert_eq!(buf, [8, 9, 10, 11]);
        assert_eq!(iom.borrow().x86_mem_written(&handle).unwrap(), 0);

        iom.borrow_mut().x86_mem_write(&handle, 4, &[1, 2]).unwrap();
        assert_eq!(iom.borrow().x86_mem_written(&handle).unwrap(), 6);
    }

    #[test]
    fn test_x86_window_region_takes_precedence() {
        let iom = iom();
        iom.borrow_mut()
            .x86_mem_register(0, 0x1000_0000, None)
            .unwrap();
        iom.borrow_mut()
            .x86_window_register(
                X86_WINDOW_BASE + 0x2000,
                0x1000,
                Some(Box::new(|_ctx, off, _size| 0x5000 + off as u32)),
                None,
            )
            .unwrap();

        let mut state = ExecState::default();
        let val =
            IoManager::x86_window_read(&iom, &mut TestCtx(&mut state), 0x2004, AccessSize::Word);
        assert_eq!(val, 0x5004);
    }
}
