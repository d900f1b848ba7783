//! RAII (Resource Acquisition Is Initialization) patterns for GPU resources
//!
//! Temporary page mappings, partially built page-table allocations and
//! vblank references all have to be released on every exit path, including
//! early returns from `?`. The guards here make that automatic.

use alloc::vec::Vec;
use core::ops::Deref;

use crate::{
    drivers::i915::{
        page::{DmaAddr, Page, PageAllocator},
        sg::DmaMapper,
    },
    drm::{object::CrtcId, vblank::VblankService},
};

/// Scoped CPU mapping of one page-table page.
///
/// The mapping is never cached: callers map a page, fill it, and drop the
/// guard before moving on to the next page. On hardware without a shared
/// LLC the page's cache lines are flushed before the mapping is released.
pub struct KmapAtomic<'a> {
    page: &'a mut Page,
    mem: &'a dyn PageAllocator,
    flush: bool,
}

impl<'a> KmapAtomic<'a> {
    /// Map `page`; `flush` requests a cache flush on release.
    pub fn new(page: &'a mut Page, mem: &'a dyn PageAllocator, flush: bool) -> Self {
        mem.kmap(page);
        Self { page, mem, flush }
    }

    pub fn read_u32(&self, index: usize) -> u32 {
        self.page.entry_u32(index)
    }

    pub fn write_u32(&mut self, index: usize, val: u32) {
        self.page.set_entry_u32(index, val);
    }

    pub fn write_u64(&mut self, index: usize, val: u64) {
        self.page.set_entry_u64(index, val);
    }
}

impl Drop for KmapAtomic<'_> {
    fn drop(&mut self) {
        if self.flush {
            self.mem.clflush(self.page);
        }
        self.mem.kunmap(self.page);
    }
}

/// Pages owned by an allocation that has not completed yet.
///
/// Dropping the guard hands every page back to the allocator.
pub struct PagesGuard<'a> {
    pages: Vec<Page>,
    mem: &'a dyn PageAllocator,
}

impl<'a> PagesGuard<'a> {
    pub fn new(mem: &'a dyn PageAllocator) -> Self {
        Self {
            pages: Vec::new(),
            mem,
        }
    }

    pub fn push(&mut self, page: Page) {
        self.pages.push(page);
    }

    pub fn extend(&mut self, pages: Vec<Page>) {
        self.pages.extend(pages);
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Release ownership of the pages without freeing them
    pub fn leak(mut self) -> Vec<Page> {
        core::mem::take(&mut self.pages)
    }
}

impl Deref for PagesGuard<'_> {
    type Target = [Page];

    fn deref(&self) -> &Self::Target {
        &self.pages
    }
}

impl Drop for PagesGuard<'_> {
    fn drop(&mut self) {
        for page in self.pages.drain(..) {
            self.mem.free_page(page);
        }
    }
}

/// DMA mappings made by an allocation that has not completed yet.
///
/// Dropping the guard unmaps every recorded address in reverse order.
pub struct DmaMappingsGuard<'a> {
    addrs: Vec<DmaAddr>,
    dma: &'a dyn DmaMapper,
}

impl<'a> DmaMappingsGuard<'a> {
    pub fn new(dma: &'a dyn DmaMapper) -> Self {
        Self {
            addrs: Vec::new(),
            dma,
        }
    }

    pub fn push(&mut self, addr: DmaAddr) {
        self.addrs.push(addr);
    }

    /// Release ownership of the mappings without unmapping
    pub fn leak(mut self) -> Vec<DmaAddr> {
        core::mem::take(&mut self.addrs)
    }
}

impl Drop for DmaMappingsGuard<'_> {
    fn drop(&mut self) {
        while let Some(addr) = self.addrs.pop() {
            self.dma.unmap_page(addr);
        }
    }
}

/// Vblank reference held on a crtc; released when dropped.
pub struct VblankReference<'a> {
    vblank: &'a dyn VblankService,
    crtc: CrtcId,
}

impl<'a> VblankReference<'a> {
    /// Take a reference, or `None` when the crtc's vblank interrupt is off.
    pub fn get(vblank: &'a dyn VblankService, crtc: CrtcId) -> Option<Self> {
        vblank.get(crtc).ok()?;
        Some(Self { vblank, crtc })
    }

    pub fn crtc(&self) -> CrtcId {
        self.crtc
    }
}

impl Drop for VblankReference<'_> {
    fn drop(&mut self) {
        self.vblank.put(self.crtc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{HostPageAllocator, RecordingDmaMapper};

    #[test]
    fn test_kmap_flushes_on_release() {
        let mem = HostPageAllocator::new();
        let mut page = mem.alloc_page().unwrap();
        {
            let mut map = KmapAtomic::new(&mut page, &mem, true);
            map.write_u32(3, 0xdead_beef);
            assert_eq!(mem.mapped_now(), 1);
        }
        assert_eq!(mem.mapped_now(), 0);
        assert_eq!(mem.flushes(), 1);
        assert_eq!(page.entry_u32(3), 0xdead_beef);
    }

    #[test]
    fn test_pages_guard_frees_unless_leaked() {
        let mem = HostPageAllocator::new();
        {
            let mut guard = PagesGuard::new(&mem);
            guard.push(mem.alloc_page().unwrap());
            guard.push(mem.alloc_page().unwrap());
            assert_eq!(mem.outstanding(), 2);
        }
        assert_eq!(mem.outstanding(), 0);

        let mut guard = PagesGuard::new(&mem);
        guard.push(mem.alloc_page().unwrap());
        let pages = guard.leak();
        assert_eq!(pages.len(), 1);
        assert_eq!(mem.outstanding(), 1);
    }

    #[test]
    fn test_dma_guard_unmaps() {
        let mem = HostPageAllocator::new();
        let dma = RecordingDmaMapper::new();
        let page = mem.alloc_page().unwrap();
        {
            let mut guard = DmaMappingsGuard::new(&dma);
            guard.push(dma.map_page(&page).unwrap());
            assert_eq!(dma.live_mappings(), 1);
        }
        assert_eq!(dma.live_mappings(), 0);
    }
}
