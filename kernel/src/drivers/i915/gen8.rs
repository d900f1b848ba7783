//! Gen8 legacy 32-bit PPGTT
//!
//! Up to four page directories, each selected by one of the engine's PDP
//! registers, each with 512 page tables of 512 64-bit PTEs. The directory
//! pages are allocated as one power-of-two block even when fewer are used.

use alloc::{sync::Arc, vec::Vec};

use super::{
    address_space::{AddressSpace, ScratchPage, VmKind},
    gtt::GttServices,
    page::{get_order, DmaAddr, Page, PageAllocator},
    pte::{gen8_pde_encode, BindFlags, CacheLevel, Gen8Pte, PteEncoder},
    range::RangeManager,
    sg::{DmaMapper, SgTable},
    switch::{gen8_mm_switch, Engine, GEN8_LEGACY_PDPS},
    DeviceInfo, PAGE_SHIFT, PAGE_SIZE,
};
use crate::{
    error::{GfxError, GfxResult},
    raii::{DmaMappingsGuard, KmapAtomic, PagesGuard},
};

/// Entries in one directory page.
pub const GEN8_PDES_PER_PAGE: usize = (PAGE_SIZE / 8) as usize;
/// Entries in one table page.
pub const GEN8_PTES_PER_PAGE: usize = (PAGE_SIZE / 8) as usize;

const GEN8_PDPE_SHIFT: u32 = 30;
const GEN8_PDPE_MASK: u64 = 0x3;
const GEN8_PDE_SHIFT: u32 = 21;
const GEN8_PDE_MASK: u64 = 0x1ff;
const GEN8_PTE_MASK: u64 = 0x1ff;

/// Address space one directory pointer covers.
const PDP_SPAN: u64 = 1 << GEN8_PDPE_SHIFT;

pub struct Gen8Ppgtt {
    /// Directory pages as allocated; only the first `used_pd` are live.
    pd_pages: Vec<Page>,
    pd_dma_addr: Vec<DmaAddr>,
    /// Table pages, `GEN8_PDES_PER_PAGE` per directory, in address order.
    pt_pages: Vec<Page>,
    pt_dma_addr: Vec<DmaAddr>,
    used_pd: usize,
    total: u64,
    scratch: ScratchPage,
    has_llc: bool,
    mm: RangeManager,
    mem: Arc<dyn PageAllocator>,
    dma: Arc<dyn DmaMapper>,
}

impl Gen8Ppgtt {
    /// Build a PPGTT covering at least `size` bytes.
    pub fn init(
        size: u64,
        scratch: ScratchPage,
        info: &DeviceInfo,
        services: &GttServices,
    ) -> GfxResult<Self> {
        let max_pdp = size.div_ceil(PDP_SPAN) as usize;
        if max_pdp == 0 || max_pdp > GEN8_LEGACY_PDPS {
            return Err(GfxError::InvalidArgument {
                name: "size",
                value: "gen8 PPGTT must span 1 to 4GiB",
            });
        }
        if size % PDP_SPAN != 0 {
            log::info!(
                "Pages will be wasted unless GTT size ({}) is divisible by 1GB",
                size
            );
        }

        let mem = services.mem.as_ref();
        let dma = services.dma.as_ref();

        let order = get_order(max_pdp as u64 * PAGE_SIZE);
        let mut pd_pages = PagesGuard::new(mem);
        pd_pages.extend(mem.alloc_pages(order).ok_or(GfxError::ResourceExhausted {
            resource: "PPGTT page directories",
        })?);

        let mut pt_pages = PagesGuard::new(mem);
        for _ in 0..max_pdp * GEN8_PDES_PER_PAGE {
            let page = mem.alloc_page().ok_or(GfxError::ResourceExhausted {
                resource: "PPGTT page tables",
            })?;
            pt_pages.push(page);
        }

        let mut pd_maps = DmaMappingsGuard::new(dma);
        for page in pd_pages.iter().take(max_pdp) {
            pd_maps.push(map_table_page(dma, page)?);
        }
        let mut pt_maps = DmaMappingsGuard::new(dma);
        for page in pt_pages.iter() {
            pt_maps.push(map_table_page(dma, page)?);
        }

        let num_pd_pages = pd_pages.len();
        let pt_dma_addr = pt_maps.leak();
        let mut ppgtt = Self {
            pd_dma_addr: pd_maps.leak(),
            pd_pages: pd_pages.leak(),
            pt_pages: pt_pages.leak(),
            pt_dma_addr,
            used_pd: max_pdp,
            total: (max_pdp * GEN8_PDES_PER_PAGE * GEN8_PTES_PER_PAGE) as u64 * PAGE_SIZE,
            scratch,
            has_llc: info.has_llc,
            mm: RangeManager::new(),
            mem: services.mem.clone(),
            dma: services.dma.clone(),
        };

        ppgtt.write_directories();
        ppgtt.clear_range(0, ppgtt.total, true);

        log::debug!(
            "Allocated {} pages for page directories ({} wasted)",
            num_pd_pages,
            num_pd_pages - max_pdp
        );
        log::debug!(
            "Allocated {} pages for page tables ({} wasted)",
            ppgtt.pt_pages.len(),
            (GEN8_LEGACY_PDPS - max_pdp) * GEN8_PDES_PER_PAGE
        );

        Ok(ppgtt)
    }

    /// Directories in use, one per PDP register loaded on a switch.
    pub fn used_pd(&self) -> usize {
        self.used_pd
    }

    pub fn pd_dma_addr(&self) -> &[DmaAddr] {
        &self.pd_dma_addr
    }

    pub fn page_directory(&self, pdpe: usize) -> Option<&Page> {
        self.pd_pages.get(pdpe)
    }

    pub fn page_table(&self, pdpe: usize, pde: usize) -> Option<&Page> {
        self.pt_pages.get(pdpe * GEN8_PDES_PER_PAGE + pde)
    }

    pub fn switch_mm(&self, engine: &mut dyn Engine) -> GfxResult<()> {
        gen8_mm_switch(engine, &self.pd_dma_addr[..self.used_pd])
    }

    fn write_directories(&mut self) {
        let flush = !self.has_llc;
        for (pdpe, pd) in self.pd_pages.iter_mut().take(self.used_pd).enumerate() {
            let mut map = KmapAtomic::new(pd, self.mem.as_ref(), flush);
            for pde in 0..GEN8_PDES_PER_PAGE {
                let pt_addr = self.pt_dma_addr[pdpe * GEN8_PDES_PER_PAGE + pde];
                map.write_u64(pde, gen8_pde_encode(pt_addr, CacheLevel::Llc));
            }
        }
    }
}

/// Split a virtual address into (directory, table, entry) indices.
fn gen8_indices(addr: u64) -> (usize, usize, usize) {
    (
        ((addr >> GEN8_PDPE_SHIFT) & GEN8_PDPE_MASK) as usize,
        ((addr >> GEN8_PDE_SHIFT) & GEN8_PDE_MASK) as usize,
        ((addr >> PAGE_SHIFT) & GEN8_PTE_MASK) as usize,
    )
}

impl AddressSpace for Gen8Ppgtt {
    fn kind(&self) -> VmKind {
        VmKind::Ppgtt
    }

    fn start(&self) -> u64 {
        0
    }

    fn total(&self) -> u64 {
        self.total
    }

    fn scratch(&self) -> ScratchPage {
        self.scratch
    }

    fn mm(&mut self) -> &mut RangeManager {
        &mut self.mm
    }

    fn clear_range(&mut self, start: u64, length: u64, use_scratch: bool) {
        let scratch_pte =
            Gen8Pte.encode(self.scratch.addr, CacheLevel::Llc, use_scratch, BindFlags::empty());
        let (mut pdpe, mut pde, mut pte) = gen8_indices(start);
        let mut num_entries = (length >> PAGE_SHIFT) as usize;
        let flush = !self.has_llc;

        while num_entries > 0 {
            if pdpe >= self.used_pd {
                log::warn!("PPGTT clear past the last directory ({})", pdpe);
                break;
            }
            let last_pte = (pte + num_entries).min(GEN8_PTES_PER_PAGE);
            let page = &mut self.pt_pages[pdpe * GEN8_PDES_PER_PAGE + pde];

            let mut map = KmapAtomic::new(page, self.mem.as_ref(), flush);
            for i in pte..last_pte {
                map.write_u64(i, scratch_pte);
            }
            drop(map);

            num_entries -= last_pte - pte;
            pte = 0;
            pde += 1;
            if pde == GEN8_PDES_PER_PAGE {
                pdpe += 1;
                pde = 0;
            }
        }
    }

    fn insert_entries(&mut self, pages: &SgTable, start: u64, level: CacheLevel, flags: BindFlags) {
        let (mut pdpe, mut pde, mut pte) = gen8_indices(start);
        let flush = !self.has_llc;
        let mut addrs = pages.dma_pages().peekable();

        while addrs.peek().is_some() {
            if pdpe >= self.used_pd {
                log::warn!("PPGTT insert past the last directory ({})", pdpe);
                break;
            }
            let page = &mut self.pt_pages[pdpe * GEN8_PDES_PER_PAGE + pde];

            let mut map = KmapAtomic::new(page, self.mem.as_ref(), flush);
            while pte < GEN8_PTES_PER_PAGE {
                let Some(addr) = addrs.next() else {
                    break;
                };
                map.write_u64(pte, Gen8Pte.encode(addr, level, true, flags));
                pte += 1;
            }
            drop(map);

            pte = 0;
            pde += 1;
            if pde == GEN8_PDES_PER_PAGE {
                pdpe += 1;
                pde = 0;
            }
        }
    }

    fn cleanup(&mut self) {
        for addr in self.pt_dma_addr.drain(..).chain(self.pd_dma_addr.drain(..)) {
            self.dma.unmap_page(addr);
        }
        for page in self.pt_pages.drain(..).chain(self.pd_pages.drain(..)) {
            self.mem.free_page(page);
        }
        self.used_pd = 0;
    }
}

fn map_table_page(dma: &dyn DmaMapper, page: &Page) -> GfxResult<DmaAddr> {
    dma.map_page(page).map_err(|_| GfxError::ResourceExhausted {
        resource: "PPGTT DMA mapping",
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
