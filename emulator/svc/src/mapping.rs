/*++

Licensed under the Apache-2.0 license.

File Name:

    mapping.rs

Abstract:

    Cached x86 memory mappings. The backing is populated lazily by proxy
    reads; only the written prefix is synced back on unmap.

--*/

use crate::proxy::{ProxyClient, ProxyError};
use pspemu_types::{AccessSize, PspAddr, X86PhysAddr, NIL_X86_PHYS_ADDR, X86_SLOT_LEN};

/// Granularity the backing is fetched at.
const FETCH_CHUNK: u32 = 1024;

/// One cached x86 memory mapping slot.
pub struct X86CachedMapping {
    /// Mapped x86 base address, NIL when the slot is unused.
    pub phys_x86_base: X86PhysAddr,
    /// 4K aligned PSP side base of the mapping.
    pub psp_base_4k: PspAddr,
    /// Unaligned PSP side base returned to the guest.
    pub psp_base: PspAddr,
    /// Highest cached address so far (exclusive); the initialized span.
    pub psp_cached_end: PspAddr,
    /// Highest address written so far (exclusive); the span synced back on
    /// unmap.
    pub psp_highest_written: PspAddr,
    /// Size of the mapped area up to the end of its 64 MiB slot.
    pub mapped_len: u32,
    /// 4K aligned mapping size.
    pub mapped_len_4k: u32,
    backing: Option<Vec<u8>>,
}

impl X86CachedMapping {
    pub fn free() -> Self {
        Self {
            phys_x86_base: NIL_X86_PHYS_ADDR,
            psp_base_4k: 0,
            psp_base: 0,
            psp_cached_end: 0,
            psp_highest_written: 0,
            mapped_len: 0,
            mapped_len_4k: 0,
            backing: None,
        }
    }

    pub fn is_free(&self) -> bool {
        self.phys_x86_base == NIL_X86_PHYS_ADDR
    }

    pub fn has_backing(&self) -> bool {
        self.backing.is_some()
    }

    pub fn backing(&self) -> Option<&[u8]> {
        self.backing.as_deref()
    }

    /// Length of the enclosing 64 MiB slot remaining from `addr`.
    fn slot_remainder(addr: u64) -> u32 {
        let slot_len = X86_SLOT_LEN as u64;
        (((addr & !(slot_len - 1)) + slot_len) - addr) as u32
    }

    /// Occupies the slot for the given x86 base, visible at the PSP address
    /// the proxied PSP returned. The window extends to the end of the
    /// enclosing 64 MiB slot.
    pub fn map(&mut self, phys: X86PhysAddr, psp_addr: PspAddr) {
        self.phys_x86_base = phys;
        self.psp_base_4k = psp_addr & !0xfff;
        self.psp_base = psp_addr;
        self.psp_cached_end = self.psp_base_4k;
        self.psp_highest_written = 0;
        self.mapped_len = Self::slot_remainder(phys);
        self.mapped_len_4k = (self.mapped_len + 4096) & !0xfff;
        self.backing = Some(Vec::new());
    }

    /// Sets up the privileged DRAM mapping for the SEV app state. The x86
    /// base is unknown, a fake value keeps the slot occupied; the backing
    /// is engine RAM, so no cache bookkeeping applies.
    pub fn map_priv_state(&mut self, psp_addr: PspAddr) {
        self.phys_x86_base = 0xdeadd0d0;
        self.psp_base_4k = psp_addr & !0xfff;
        self.psp_base = psp_addr;
        self.psp_cached_end = 0;
        self.psp_highest_written = 0;
        self.mapped_len = Self::slot_remainder(psp_addr as u64);
        self.mapped_len_4k = (self.mapped_len + 4096) & !0xfff;
        self.backing = None;
    }

    pub fn clear(&mut self) {
        *self = Self::free();
    }

    /// Extends the cached span to cover up to `end` (absolute PSP address,
    /// exclusive), fetching from the proxied PSP in chunks.
    fn ensure_cached(
        &mut self,
        proxy: &mut dyn ProxyClient,
        end: PspAddr,
    ) -> Result<(), ProxyError> {
        if end > self.psp_cached_end {
            let mut fetch_len = end - self.psp_cached_end;
            fetch_len = (fetch_len + FETCH_CHUNK) & !(FETCH_CHUNK - 1);
            let off = (self.psp_cached_end - self.psp_base_4k) as usize;
            let backing = self.backing.get_or_insert_with(Vec::new);
            backing.resize(off + fetch_len as usize, 0);
            proxy.mem_read(
                self.psp_cached_end,
                &mut backing[off..off + fetch_len as usize],
            )?;
            self.psp_cached_end += fetch_len;
        }
        Ok(())
    }

    /// Serves a guest read from the window; offset is relative to the 4K
    /// aligned base.
    pub fn read(&mut self, proxy: &mut dyn ProxyClient, off: u64, size: AccessSize) -> u32 {
        let end = self.psp_base_4k.wrapping_add(off as u32 + size.bytes() as u32);
        if let Err(err) = self.ensure_cached(proxy, end) {
            log::error!(
                "fetching x86 mapping contents at {:#010x} failed: {}",
                self.psp_cached_end,
                err
            );
            return 0;
        }
        let off = off as usize;
        let len = size.bytes().min(4);
        let mut buf = [0u8; 4];
        match self.backing.as_ref() {
            Some(backing) => buf[..len].copy_from_slice(&backing[off..off + len]),
            None => return 0,
        }
        u32::from_le_bytes(buf)
    }

    /// Serves a guest write into the window and raises the written
    /// high-water mark.
    pub fn write(&mut self, proxy: &mut dyn ProxyClient, off: u64, size: AccessSize, val: u32) {
        let end = self.psp_base_4k.wrapping_add(off as u32 + size.bytes() as u32);
        if let Err(err) = self.ensure_cached(proxy, end) {
            log::error!(
                "fetching x86 mapping contents at {:#010x} failed: {}",
                self.psp_cached_end,
                err
            );
            return;
        }
        let len = size.bytes().min(4);
        if let Some(backing) = self.backing.as_mut() {
            backing[off as usize..off as usize + len].copy_from_slice(&val.to_le_bytes()[..len]);
        }
        if end > self.psp_highest_written {
            self.psp_highest_written = end;
        }
    }

    /// Syncs the written prefix back through the proxy. Called on unmap
    /// before the slot is reclaimed.
    pub fn flush(&self, proxy: &mut dyn ProxyClient) -> Result<(), ProxyError> {
        if self.psp_highest_written == 0 {
            return Ok(());
        }
        let len = (self.psp_highest_written - self.psp_base) as usize;
        let off = (self.psp_base - self.psp_base_4k) as usize;
        match self.backing.as_ref() {
            Some(backing) => proxy.mem_write(self.psp_base, &backing[off..off + len]),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct MemProxy {
        mem: BTreeMap<u32, u8>,
        writes: Vec<(u32, Vec<u8>)>,
    }

    impl ProxyClient for MemProxy {
        fn svc_call(
            &mut self,
            _idx: u32,
            _r0: u32,
            _r1: u32,
            _r2: u32,
            _r3: u32,
        ) -> Result<u32, ProxyError> {
            Ok(0)
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

    #[test]
    fn test_slot_geometry() {
        let mut mapping = X86CachedMapping::free();
        assert!(mapping.is_free());
        mapping.map(0x1_0000_0000, 0x0400_0100);
        assert!(!mapping.is_free());
        assert_eq!(mapping.psp_base_4k, 0x0400_0000);
        assert_eq!(mapping.psp_base, 0x0400_0100);
        assert_eq!(mapping.psp_cached_end, 0x0400_0000);
        // Base is 64 MiB aligned, so the whole slot remains.
        assert_eq!(mapping.mapped_len, X86_SLOT_LEN);

        mapping.clear();
        assert!(mapping.is_free());
        assert!(!mapping.has_backing());
    }

    #[test]
    fn test_lazy_fetch_and_read() {
        let mut proxy = MemProxy::default();
        proxy.mem.insert(0x0400_0040, 0xaa);
        proxy.mem.insert(0x0400_0041, 0xbb);

        let mut mapping = X86CachedMapping::free();
        mapping.map(0x1_0000_0000, 0x0400_0000);
        let val = mapping.read(&mut proxy, 0x40, AccessSize::HalfWord);
        assert_eq!(val, 0xbbaa);
        // Fetches are chunk aligned.
        assert!(mapping.psp_cached_end >= 0x0400_0042);
        assert_eq!(mapping.psp_cached_end % FETCH_CHUNK, 0);
    }

    #[test]
    fn test_write_back_prefix() {
        let mut proxy = MemProxy::default();
        let mut mapping = X86CachedMapping::free();
        mapping.map(0x1_0000_0000, 0x0400_0000);

        for (idx, word) in [0x11111111u32, 0x22222222, 0x33333333, 0x44444444]
            .iter()
            .enumerate()
        {
            mapping.write(&mut proxy, 0x40 + idx as u64 * 4, AccessSize::Word, *word);
        }
        assert_eq!(mapping.psp_highest_written, 0x0400_0050);

        mapping.flush(&mut proxy).unwrap();
        assert_eq!(proxy.writes.len(), 1);
        let (addr, data) = &proxy.writes[0];
        assert_eq!(*addr, 0x0400_0000);
        assert_eq!(data.len(), 0x50);
        assert_eq!(&data[0x40..0x44], &0x11111111u32.to_le_bytes());
        assert_eq!(&data[0x4c..0x50], &0x44444444u32.to_le_bytes());
    }

    #[test]
    fn test_flush_without_writes_is_noop() {
        let mut proxy = MemProxy::default();
        let mut mapping = X86CachedMapping::free();
        mapping.map(0x1_0000_0000, 0x0400_0000);
        mapping.read(&mut proxy, 0x10, AccessSize::Word);
        mapping.flush(&mut proxy).unwrap();
        assert!(proxy.writes.is_empty());
    }
}
