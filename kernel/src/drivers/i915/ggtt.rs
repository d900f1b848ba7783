//! Global graphics translation table
//!
//! The GGTT is a flat array of PTEs living in the second half of the GPU's
//! register BAR (the "GSM"). Gen6 and gen7 use 32-bit entries, gen8+ 64-bit
//! ones; gen2 to gen5 hand the table to the chipset's AGP-style helper. The
//! flavour is picked at probe time and hidden behind [`GgttBackend`].

use alloc::{boxed::Box, sync::Arc};

use super::{
    address_space::{AddressSpace, ScratchPage, ScratchStorage, VmKind},
    gtt::GttServices,
    mib,
    page::{DmaAddr, PageAllocator},
    pte::{self, BindFlags, CacheLevel, PteEncoder},
    range::RangeManager,
    regs,
    sg::{DmaMapper, SgTable},
    DeviceInfo, PAGE_SHIFT,
};
use crate::error::{GfxError, GfxResult};

// ---------------------------------------------------------------------------
// Hardware access
// ---------------------------------------------------------------------------

/// Register BAR of the GPU: MMIO registers plus the GSM entry array.
pub trait GttMmio: Send + Sync {
    fn write_gsm32(&self, index: u64, val: u32);
    fn read_gsm32(&self, index: u64) -> u32;
    fn write_gsm64(&self, index: u64, val: u64);
    fn read_gsm64(&self, index: u64) -> u64;

    fn write_reg(&self, reg: u32, val: u32);
    fn read_reg(&self, reg: u32) -> u32;

    /// Read back a register so earlier writes have landed.
    fn posting_read(&self, reg: u32) {
        let _ = self.read_reg(reg);
    }
}

/// `intel_gtt` flags for gen2-gen5 inserts
pub const AGP_USER_MEMORY: u32 = 1 << 16;
pub const AGP_USER_CACHED_MEMORY: u32 = AGP_USER_MEMORY + 1;

/// What the chipset helper found on a gen2-gen5 part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GmchInfo {
    pub gtt_total: u64,
    pub stolen_size: u64,
    pub mappable_base: u64,
    pub mappable_end: u64,
}

/// The GMCH/AGP GTT helper that owns the table before gen6.
pub trait GmchChipset: Send + Sync {
    fn probe(&self) -> Option<GmchInfo>;
    fn insert_sg_entries(&self, pages: &SgTable, first_entry: u64, flags: u32);
    fn clear_range(&self, first_entry: u64, num_entries: u64);
    fn chipset_flush(&self);
    fn remove(&self);
}

/// PCI facts the probe needs: the graphics control word and BAR 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciGttConfig {
    pub gmch_ctl: u16,
    pub gmadr_base: u64,
    pub gmadr_len: u64,
}

// ---------------------------------------------------------------------------
// Size decoding
// ---------------------------------------------------------------------------

fn gen6_get_total_gtt_size(ctl: u16) -> u64 {
    let ggms = (ctl >> regs::SNB_GMCH_GGMS_SHIFT) & regs::SNB_GMCH_GGMS_MASK;
    (ggms as u64) << 20
}

fn gen8_get_total_gtt_size(ctl: u16) -> u64 {
    let mut ggms = (ctl >> regs::BDW_GMCH_GGMS_SHIFT) & regs::BDW_GMCH_GGMS_MASK;
    if ggms != 0 {
        ggms = 1 << ggms;
    }
    (ggms as u64) << 20
}

fn chv_get_total_gtt_size(ctl: u16) -> u64 {
    let ggms = (ctl >> regs::SNB_GMCH_GGMS_SHIFT) & regs::SNB_GMCH_GGMS_MASK;
    if ggms != 0 {
        1 << (20 + ggms as u64)
    } else {
        0
    }
}

fn gen6_get_stolen_size(ctl: u16) -> u64 {
    let gms = (ctl >> regs::SNB_GMCH_GMS_SHIFT) & regs::SNB_GMCH_GMS_MASK;
    (gms as u64) << 25
}

fn gen8_get_stolen_size(ctl: u16) -> u64 {
    let gms = (ctl >> regs::BDW_GMCH_GMS_SHIFT) & regs::BDW_GMCH_GMS_MASK;
    (gms as u64) << 25
}

fn chv_get_stolen_size(ctl: u16) -> u64 {
    let gms = ((ctl >> regs::SNB_GMCH_GMS_SHIFT) & regs::SNB_GMCH_GMS_MASK) as u64;
    // 32MiB steps up to 0x10, then two 4MiB ranges starting at 8MiB and 36MiB
    if gms < 0x11 {
        gms << 25
    } else if gms < 0x17 {
        (gms - 0x11 + 2) << 22
    } else {
        (gms - 0x17 + 9) << 22
    }
}

fn gen9_get_stolen_size(ctl: u16) -> u64 {
    let gms = ((ctl >> regs::BDW_GMCH_GMS_SHIFT) & regs::BDW_GMCH_GMS_MASK) as u64;
    if gms < 0xf0 {
        gms << 25
    } else {
        (gms - 0xf0 + 1) << 22
    }
}

// ---------------------------------------------------------------------------
// Private PAT (gen8)
// ---------------------------------------------------------------------------

const GEN8_PPAT_WB: u64 = 3;
const GEN8_PPAT_WT: u64 = 2;
const GEN8_PPAT_WC: u64 = 1;
const GEN8_PPAT_UC: u64 = 0;
const GEN8_PPAT_LLC: u64 = 1 << 2;
const GEN8_PPAT_LLCELLC: u64 = 2 << 2;
const CHV_PPAT_SNOOP: u64 = 1 << 6;

const fn gen8_ppat_age(x: u64) -> u64 {
    x << 4
}

const fn gen8_ppat(i: u32, x: u64) -> u64 {
    x << (i * 8)
}

/// PAT value matching the PPAT indices the gen8 encoder emits.
pub fn private_ppat_value(info: &DeviceInfo) -> u64 {
    if info.is_cherryview() {
        // only the snoop bit means anything on CHV
        gen8_ppat(0, CHV_PPAT_SNOOP)
            | gen8_ppat(1, 0)
            | gen8_ppat(2, 0)
            | gen8_ppat(3, 0)
            | gen8_ppat(4, CHV_PPAT_SNOOP)
            | gen8_ppat(5, CHV_PPAT_SNOOP)
            | gen8_ppat(6, CHV_PPAT_SNOOP)
            | gen8_ppat(7, CHV_PPAT_SNOOP)
    } else {
        gen8_ppat(0, GEN8_PPAT_WB | GEN8_PPAT_LLC)
            | gen8_ppat(1, GEN8_PPAT_WC | GEN8_PPAT_LLCELLC)
            | gen8_ppat(2, GEN8_PPAT_WT | GEN8_PPAT_LLCELLC)
            | gen8_ppat(3, GEN8_PPAT_UC)
            | gen8_ppat(4, GEN8_PPAT_WB | GEN8_PPAT_LLCELLC | gen8_ppat_age(0))
            | gen8_ppat(5, GEN8_PPAT_WB | GEN8_PPAT_LLCELLC | gen8_ppat_age(1))
            | gen8_ppat(6, GEN8_PPAT_WB | GEN8_PPAT_LLCELLC | gen8_ppat_age(2))
            | gen8_ppat(7, GEN8_PPAT_WB | GEN8_PPAT_LLCELLC | gen8_ppat_age(3))
    }
}

/// Program the private PAT. It is two distinct dword registers.
pub fn setup_private_ppat(info: &DeviceInfo, mmio: &dyn GttMmio) {
    let pat = private_ppat_value(info);
    mmio.write_reg(regs::GEN8_PRIVATE_PAT, pat as u32);
    mmio.write_reg(regs::GEN8_PRIVATE_PAT + 4, (pat >> 32) as u32);
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Generation specific half of the GGTT.
pub trait GgttBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Encoder for gen6+ tables, shared with aliasing PPGTTs.
    fn pte_encoder(&self) -> Option<&'static dyn PteEncoder>;

    fn clear_range(&self, scratch: ScratchPage, first_entry: u64, num_entries: u64, use_scratch: bool);

    fn insert_entries(&self, pages: &SgTable, first_entry: u64, level: CacheLevel, flags: BindFlags);

    /// Invalidate the GGTT TLBs.
    fn flush(&self);

    fn remove(&self);
}

/// Gen6+ table written directly through the GSM.
pub struct GsmGgtt {
    mmio: Arc<dyn GttMmio>,
    encoder: &'static dyn PteEncoder,
    total_entries: u64,
}

impl GsmGgtt {
    pub fn new(mmio: Arc<dyn GttMmio>, encoder: &'static dyn PteEncoder, total_entries: u64) -> Self {
        Self {
            mmio,
            encoder,
            total_entries,
        }
    }

    fn write(&self, index: u64, val: u64) {
        if self.encoder.entry_size() == 8 {
            self.mmio.write_gsm64(index, val);
        } else {
            self.mmio.write_gsm32(index, val as u32);
        }
    }

    fn read(&self, index: u64) -> u64 {
        if self.encoder.entry_size() == 8 {
            self.mmio.read_gsm64(index)
        } else {
            self.mmio.read_gsm32(index) as u64
        }
    }
}

impl GgttBackend for GsmGgtt {
    fn name(&self) -> &'static str {
        self.encoder.name()
    }

    fn pte_encoder(&self) -> Option<&'static dyn PteEncoder> {
        Some(self.encoder)
    }

    fn clear_range(&self, scratch: ScratchPage, first_entry: u64, num_entries: u64, use_scratch: bool) {
        let max_entries = self.total_entries.saturating_sub(first_entry);
        let num_entries = if num_entries > max_entries {
            log::warn!(
                "GGTT clear past the end: first entry = {}; num entries = {} (max={})",
                first_entry,
                num_entries,
                max_entries
            );
            max_entries
        } else {
            num_entries
        };

        let scratch_pte =
            self.encoder
                .encode(scratch.addr, CacheLevel::Llc, use_scratch, BindFlags::empty());
        for i in 0..num_entries {
            self.write(first_entry + i, scratch_pte);
        }
        let _ = self.read(first_entry);
    }

    fn insert_entries(&self, pages: &SgTable, first_entry: u64, level: CacheLevel, flags: BindFlags) {
        let mut written = 0u64;
        let mut last: Option<DmaAddr> = None;
        for addr in pages.dma_pages() {
            self.write(first_entry + written, self.encoder.encode(addr, level, true, flags));
            written += 1;
            last = Some(addr);
        }

        // Posting read: the PTE writes must land before the TLB flush.
        if let Some(addr) = last {
            let expected = self.encoder.encode(addr, level, true, flags);
            let actual = self.read(first_entry + written - 1);
            if actual != expected {
                log::warn!(
                    "GGTT posting read mismatch at entry {}: {:#x} != {:#x}",
                    first_entry + written - 1,
                    actual,
                    expected
                );
            }
        }

        self.flush();
    }

    fn flush(&self) {
        self.mmio
            .write_reg(regs::GFX_FLSH_CNTL_GEN6, regs::GFX_FLSH_CNTL_EN);
        self.mmio.posting_read(regs::GFX_FLSH_CNTL_GEN6);
    }

    fn remove(&self) {}
}

/// Gen2-gen5 table owned by the chipset helper.
pub struct GmchGgtt {
    chipset: Arc<dyn GmchChipset>,
}

impl GmchGgtt {
    pub fn new(chipset: Arc<dyn GmchChipset>) -> Self {
        Self { chipset }
    }
}

impl GgttBackend for GmchGgtt {
    fn name(&self) -> &'static str {
        "gmch"
    }

    fn pte_encoder(&self) -> Option<&'static dyn PteEncoder> {
        None
    }

    fn clear_range(&self, _scratch: ScratchPage, first_entry: u64, num_entries: u64, _use_scratch: bool) {
        self.chipset.clear_range(first_entry, num_entries);
    }

    fn insert_entries(&self, pages: &SgTable, first_entry: u64, level: CacheLevel, _flags: BindFlags) {
        let flags = if level == CacheLevel::None {
            AGP_USER_MEMORY
        } else {
            AGP_USER_CACHED_MEMORY
        };
        self.chipset.insert_sg_entries(pages, first_entry, flags);
    }

    fn flush(&self) {
        self.chipset.chipset_flush();
    }

    fn remove(&self) {
        self.chipset.remove();
    }
}

// ---------------------------------------------------------------------------
// The global GTT
// ---------------------------------------------------------------------------

/// Global GTT address space.
pub struct Ggtt {
    start: u64,
    total: u64,
    pub mappable_base: u64,
    pub mappable_end: u64,
    pub stolen_size: u64,
    /// gen2-gen5 with VT-d: idle the GPU around unmaps.
    pub do_idle_maps: bool,
    scratch: Option<ScratchStorage>,
    mm: RangeManager,
    backend: Box<dyn GgttBackend>,
    mem: Arc<dyn PageAllocator>,
    dma: Arc<dyn DmaMapper>,
}

impl Ggtt {
    /// Probe the hardware and build the GGTT for `info`'s generation.
    pub fn probe(info: &DeviceInfo, pci: &PciGttConfig, services: &GttServices) -> GfxResult<Self> {
        let ggtt = if info.gen <= 5 {
            Self::gmch_probe(info, services)?
        } else if info.gen < 8 {
            Self::gen6_probe(info, pci, services)?
        } else {
            Self::gen8_probe(info, pci, services)?
        };

        log::info!("Memory usable by graphics device = {}M", ggtt.total >> 20);
        log::debug!("GMADR size = {}M", ggtt.mappable_end >> 20);
        log::debug!("GTT stolen size = {}M", ggtt.stolen_size >> 20);
        if info.iommu_gfx_mapped {
            log::info!("VT-d active for gfx access");
        }
        Ok(ggtt)
    }

    fn gmch_probe(info: &DeviceInfo, services: &GttServices) -> GfxResult<Self> {
        let chipset = services.gmch.clone().ok_or(GfxError::NotFound {
            resource: "GMCH chipset helper",
            id: info.device_id as u64,
        })?;
        let found = chipset.probe().ok_or_else(|| {
            log::error!("failed to set up gmch");
            GfxError::HardwareFault {
                device: "gmch",
                code: info.device_id as u32,
            }
        })?;

        let do_idle_maps = needs_idle_maps(info);
        if do_idle_maps {
            log::info!("applying Ironlake quirks for intel_iommu");
        }

        Ok(Self {
            start: 0,
            total: found.gtt_total,
            mappable_base: found.mappable_base,
            mappable_end: found.mappable_end,
            stolen_size: found.stolen_size,
            do_idle_maps,
            scratch: None,
            mm: RangeManager::new(),
            backend: Box::new(GmchGgtt::new(chipset)),
            mem: services.mem.clone(),
            dma: services.dma.clone(),
        })
    }

    fn gen6_probe(info: &DeviceInfo, pci: &PciGttConfig, services: &GttServices) -> GfxResult<Self> {
        // 64M/512M is the known range; anything else is a bad BAR read.
        if pci.gmadr_len < mib(64) || pci.gmadr_len > mib(512) {
            log::error!("Unknown GMADR size ({:#x})", pci.gmadr_len);
            return Err(GfxError::HardwareFault {
                device: "GMADR",
                code: (pci.gmadr_len >> 20) as u32,
            });
        }

        let gtt_size = gen6_get_total_gtt_size(pci.gmch_ctl);
        let stolen_size = gen6_get_stolen_size(pci.gmch_ctl);
        let encoder = pte::gen6_encoder_for(info);
        Self::probe_common(pci, services, gtt_size, 4, stolen_size, encoder)
    }

    fn gen8_probe(info: &DeviceInfo, pci: &PciGttConfig, services: &GttServices) -> GfxResult<Self> {
        let (stolen_size, gtt_size) = if info.gen >= 9 {
            (
                gen9_get_stolen_size(pci.gmch_ctl),
                gen8_get_total_gtt_size(pci.gmch_ctl),
            )
        } else if info.is_cherryview() {
            (
                chv_get_stolen_size(pci.gmch_ctl),
                chv_get_total_gtt_size(pci.gmch_ctl),
            )
        } else {
            (
                gen8_get_stolen_size(pci.gmch_ctl),
                gen8_get_total_gtt_size(pci.gmch_ctl),
            )
        };

        setup_private_ppat(info, services.mmio.as_ref());
        Self::probe_common(pci, services, gtt_size, 8, stolen_size, &pte::Gen8Pte)
    }

    fn probe_common(
        pci: &PciGttConfig,
        services: &GttServices,
        gtt_size: u64,
        entry_size: u64,
        stolen_size: u64,
        encoder: &'static dyn PteEncoder,
    ) -> GfxResult<Self> {
        let total_entries = gtt_size / entry_size;
        let scratch = setup_scratch_page(services.mem.as_ref(), services.dma.as_ref())?;

        Ok(Self {
            start: 0,
            total: total_entries << PAGE_SHIFT,
            mappable_base: pci.gmadr_base,
            mappable_end: pci.gmadr_len,
            stolen_size,
            do_idle_maps: false,
            scratch: Some(scratch),
            mm: RangeManager::new(),
            backend: Box::new(GsmGgtt::new(services.mmio.clone(), encoder, total_entries)),
            mem: services.mem.clone(),
            dma: services.dma.clone(),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn pte_encoder(&self) -> Option<&'static dyn PteEncoder> {
        self.backend.pte_encoder()
    }

    /// Number of entries the table holds.
    pub fn total_entries(&self) -> u64 {
        self.total >> PAGE_SHIFT
    }

    /// Restrict the space to `[start, end)` once the range allocator is set up.
    pub(crate) fn set_bounds(&mut self, start: u64, end: u64) {
        self.start = start;
        self.total = end - start;
    }

    /// GGTT TLB flush (chipset flush before gen6).
    pub fn flush(&self) {
        self.backend.flush();
    }
}

impl AddressSpace for Ggtt {
    fn kind(&self) -> VmKind {
        VmKind::Ggtt
    }

    fn start(&self) -> u64 {
        self.start
    }

    fn total(&self) -> u64 {
        self.total
    }

    fn scratch(&self) -> ScratchPage {
        self.scratch.as_ref().map(|s| s.scratch).unwrap_or_default()
    }

    fn mm(&mut self) -> &mut RangeManager {
        &mut self.mm
    }

    fn clear_range(&mut self, start: u64, length: u64, use_scratch: bool) {
        let scratch = self.scratch();
        self.backend
            .clear_range(scratch, start >> PAGE_SHIFT, length >> PAGE_SHIFT, use_scratch);
    }

    fn insert_entries(&mut self, pages: &SgTable, start: u64, level: CacheLevel, flags: BindFlags) {
        self.backend
            .insert_entries(pages, start >> PAGE_SHIFT, level, flags);
    }

    fn cleanup(&mut self) {
        if self.mm.is_initialized() {
            self.mm.takedown();
        }
        self.backend.remove();
        if let Some(storage) = self.scratch.take() {
            self.dma.unmap_page(storage.scratch.addr);
            self.mem.free_page(storage.page);
        }
    }
}

/// gen5 mobile behind VT-d needs the GPU idle around GTT unmaps.
pub fn needs_idle_maps(info: &DeviceInfo) -> bool {
    info.gen == 5 && info.is_mobile && info.iommu_gfx_mapped
}

fn setup_scratch_page(mem: &dyn PageAllocator, dma: &dyn DmaMapper) -> GfxResult<ScratchStorage> {
    let page = mem.alloc_page().ok_or(GfxError::ResourceExhausted {
        resource: "scratch page",
    })?;
    match dma.map_page(&page) {
        Ok(addr) => Ok(ScratchStorage {
            page,
            scratch: ScratchPage { addr },
        }),
        Err(err) => {
            log::error!("Scratch setup failed");
            mem.free_page(page);
            Err(err)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::i915::device_ids;

    #[test]
    fn test_gen6_size_decode() {
        // GGMS = 2 (2MiB of PTEs), GMS = 5 (160MiB stolen)
        let ctl = (2 << 8) | (5 << 3);
        assert_eq!(gen6_get_total_gtt_size(ctl), 2 << 20);
        assert_eq!(gen6_get_stolen_size(ctl), 160 << 20);
    }

    #[test]
    fn test_gen8_size_decode() {
        // GGMS = 3 -> 8MiB of PTEs, GMS = 2 -> 64MiB stolen
        let ctl = (3 << 6) | (2 << 8);
        assert_eq!(gen8_get_total_gtt_size(ctl), 8 << 20);
        assert_eq!(gen8_get_stolen_size(ctl), 64 << 20);
        assert_eq!(gen8_get_total_gtt_size(0), 0);
    }

    #[test]
    fn test_chv_and_gen9_stolen_granularity() {
        assert_eq!(chv_get_stolen_size(0x10 << 3), 0x10 << 25);
        assert_eq!(chv_get_stolen_size(0x11 << 3), 8 << 20);
        assert_eq!(chv_get_stolen_size(0x17 << 3), 36 << 20);
        assert_eq!(chv_get_total_gtt_size(1 << 8), 2 << 20);
        assert_eq!(gen9_get_stolen_size(0xf0 << 8), 4 << 20);
        assert_eq!(gen9_get_stolen_size(0x02 << 8), 64 << 20);
    }

    #[test]
    fn test_private_ppat_values() {
        let bdw = DeviceInfo::from_device_id(device_ids::BROADWELL_M_GT2, 0).unwrap();
        assert_eq!(private_ppat_value(&bdw), 0x3b2b_1b0b_000a_0907);
        let chv = DeviceInfo::from_device_id(device_ids::CHERRYVIEW, 0).unwrap();
        assert_eq!(private_ppat_value(&chv), 0x4040_4040_0000_0040);
    }

    #[test]
    fn test_idle_maps_quirk() {
        let mut ilk = DeviceInfo::from_device_id(device_ids::IRONLAKE_M, 0).unwrap();
        assert!(!needs_idle_maps(&ilk));
        ilk.iommu_gfx_mapped = true;
        assert!(needs_idle_maps(&ilk));
    }
}
