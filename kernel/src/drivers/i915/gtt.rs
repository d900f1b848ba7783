//! Device-level GTT management
//!
//! [`I915Gtt`] owns the global GTT, the optional aliasing PPGTT and the list
//! of full PPGTTs. It decides which address space a binding writes to,
//! brings page tables back after suspend, and keeps buffer objects' DMA
//! mappings in step with their GTT lifetime.

use alloc::{
    sync::{Arc, Weak},
    vec::Vec,
};

use spin::Mutex;

use super::{
    address_space::{AddressSpace, Evictor},
    ggtt::{self, Ggtt, GmchChipset, GttMmio, PciGttConfig},
    page::PageAllocator,
    ppgtt::HwPpgtt,
    pte::{BindFlags, CacheLevel},
    range::{RangeManager, RangeNode},
    regs,
    sg::DmaMapper,
    switch::{self, Engine, EngineId},
    vma::{BindStrategy, GemObject, VmRef},
    DeviceInfo, PAGE_SIZE,
};
use crate::error::{GfxError, GfxResult};

// ---------------------------------------------------------------------------
// Collaborators and configuration
// ---------------------------------------------------------------------------

/// Waits for the GPU to finish all outstanding work.
pub trait GpuIdle: Send + Sync {
    fn gpu_idle(&self) -> GfxResult<()>;
}

/// Platform services the GTT code calls into.
#[derive(Clone)]
pub struct GttServices {
    pub mem: Arc<dyn PageAllocator>,
    pub dma: Arc<dyn DmaMapper>,
    pub mmio: Arc<dyn GttMmio>,
    pub evictor: Arc<dyn Evictor>,
    /// Chipset GTT helper, required on gen2-gen5 only.
    pub gmch: Option<Arc<dyn GmchChipset>>,
    pub idle: Arc<dyn GpuIdle>,
}

/// Driver options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct I915Params {
    /// -1 picks per platform, 0 disables, 1 aliasing only, 2 full PPGTT.
    pub enable_ppgtt: i32,
    /// Execlist submission loads page directories itself.
    pub enable_execlists: bool,
}

impl Default for I915Params {
    fn default() -> Self {
        Self {
            enable_ppgtt: -1,
            enable_execlists: false,
        }
    }
}

/// Clamp the requested PPGTT mode to what `info` supports.
pub fn sanitize_enable_ppgtt(info: &DeviceInfo, enable_ppgtt: i32) -> i32 {
    let has_aliasing_ppgtt = info.has_aliasing_ppgtt();
    let has_full_ppgtt = info.has_full_ppgtt();

    if enable_ppgtt == 0 || !has_aliasing_ppgtt {
        return 0;
    }
    if enable_ppgtt == 1 {
        return 1;
    }
    if enable_ppgtt == 2 && has_full_ppgtt {
        return 2;
    }

    // Disable PPGTT on SNB when VT-d is on.
    if info.gen == 6 && info.iommu_gfx_mapped {
        log::info!("Disabling PPGTT because VT-d is on");
        return 0;
    }

    // Early VLV doesn't have this
    if info.is_valleyview() && info.revision < 0xb {
        log::debug!("disabling PPGTT on pre-B3 step VLV");
        return 0;
    }

    1
}

/// Range allocator colour of a cache level.
fn cache_color(level: CacheLevel) -> u64 {
    match level {
        CacheLevel::None => 0,
        CacheLevel::Llc => 1,
        CacheLevel::L3Llc => 2,
        CacheLevel::Wt => 3,
    }
}

// ---------------------------------------------------------------------------
// Device GTT state
// ---------------------------------------------------------------------------

pub struct I915Gtt {
    info: DeviceInfo,
    params: I915Params,
    ggtt: Ggtt,
    aliasing_ppgtt: Option<Arc<Mutex<HwPpgtt>>>,
    ppgtts: Vec<Weak<Mutex<HwPpgtt>>>,
    services: GttServices,
    /// Waits may be interrupted; cleared while idling around unmaps.
    interruptible: bool,
}

impl I915Gtt {
    /// Probe the GGTT without touching its contents.
    pub fn probe(
        info: DeviceInfo,
        params: I915Params,
        pci: &PciGttConfig,
        services: GttServices,
    ) -> GfxResult<Self> {
        let params = I915Params {
            enable_ppgtt: sanitize_enable_ppgtt(&info, params.enable_ppgtt),
            ..params
        };
        let ggtt = Ggtt::probe(&info, pci, &services)?;
        log::debug!(
            "{} GGTT, PPGTT mode {}",
            ggtt.backend_name(),
            params.enable_ppgtt
        );

        Ok(Self {
            info,
            params,
            ggtt,
            aliasing_ppgtt: None,
            ppgtts: Vec::new(),
            services,
            interruptible: true,
        })
    }

    /// Probe, set up the whole GGTT and create the aliasing PPGTT if the
    /// configuration calls for one.
    pub fn init(
        info: DeviceInfo,
        params: I915Params,
        pci: &PciGttConfig,
        services: GttServices,
    ) -> GfxResult<Self> {
        let mut gtt = Self::probe(info, params, pci, services)?;
        gtt.init_global_gtt(&mut [])?;
        Ok(gtt)
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn params(&self) -> &I915Params {
        &self.params
    }

    pub fn uses_ppgtt(&self) -> bool {
        self.params.enable_ppgtt != 0
    }

    pub fn uses_full_ppgtt(&self) -> bool {
        self.params.enable_ppgtt == 2
    }

    pub fn ggtt(&self) -> &Ggtt {
        &self.ggtt
    }

    pub fn ggtt_mut(&mut self) -> &mut Ggtt {
        &mut self.ggtt
    }

    pub fn aliasing_ppgtt(&self) -> Option<&Arc<Mutex<HwPpgtt>>> {
        self.aliasing_ppgtt.as_ref()
    }

    pub fn is_interruptible(&self) -> bool {
        self.interruptible
    }

    /// Full PPGTTs still referenced somewhere.
    pub fn ppgtts(&self) -> impl Iterator<Item = Arc<Mutex<HwPpgtt>>> + '_ {
        self.ppgtts.iter().filter_map(Weak::upgrade)
    }

    // -----------------------------------------------------------------------
    // Global GTT setup
    // -----------------------------------------------------------------------

    /// Manage `[start, end)` of the GGTT, keeping the last page as a guard.
    ///
    /// Objects in `preallocated` that already carry a GGTT node (firmware
    /// framebuffers, stolen memory) get their ranges reserved; everything
    /// else is pointed at scratch.
    pub fn setup_global_gtt(
        &mut self,
        start: u64,
        mappable_end: u64,
        end: u64,
        preallocated: &mut [GemObject],
    ) -> GfxResult<()> {
        if end <= start + PAGE_SIZE {
            return Err(GfxError::InvalidArgument {
                name: "end",
                value: "GGTT range smaller than the guard page",
            });
        }
        if mappable_end > end {
            log::warn!(
                "mappable end {:#x} beyond GGTT end {:#x}",
                mappable_end,
                end
            );
        }

        // Subtract the guard page
        let mm = self.ggtt.mm();
        mm.init(start, end - start - PAGE_SIZE);
        if !self.info.has_llc {
            mm.set_color_adjust(true);
        }

        for obj in preallocated.iter_mut() {
            let Some(node) = obj.ggtt_vma().and_then(|vma| vma.node) else {
                continue;
            };
            log::debug!("reserving preallocated space: {:x} + {:x}", node.start, node.size);
            if let Err(err) = self.ggtt.mm().reserve_node(node) {
                log::debug!("Reservation failed: {}", err);
                return Err(err);
            }
            obj.has_global_gtt_mapping = true;
        }

        self.ggtt.set_bounds(start, end);

        for (hole_start, hole_end) in self.ggtt.mm().holes() {
            log::debug!("clearing unused GTT space: [{:x}, {:x}]", hole_start, hole_end);
            self.ggtt.clear_range(hole_start, hole_end - hole_start, true);
        }

        // And finally clear the reserved guard page
        self.ggtt.clear_range(end - PAGE_SIZE, PAGE_SIZE, true);

        if self.uses_ppgtt() && !self.uses_full_ppgtt() {
            let ppgtt = HwPpgtt::create(&mut self.ggtt, &self.info, &self.services)?;
            self.aliasing_ppgtt = Some(Arc::new(Mutex::new(ppgtt)));
        }

        Ok(())
    }

    /// Set up the entire probed GGTT.
    pub fn init_global_gtt(&mut self, preallocated: &mut [GemObject]) -> GfxResult<()> {
        let mappable_end = self.ggtt.mappable_end;
        let end = self.ggtt.start() + self.ggtt.total();
        let start = self.ggtt.start();
        self.setup_global_gtt(start, mappable_end, end, preallocated)
    }

    /// Release the aliasing PPGTT and the GGTT itself.
    pub fn cleanup(&mut self) {
        if let Some(ppgtt) = self.aliasing_ppgtt.take() {
            self.ppgtt_put(ppgtt);
        }
        self.ggtt.cleanup();
    }

    // -----------------------------------------------------------------------
    // PPGTTs
    // -----------------------------------------------------------------------

    /// Create a full PPGTT.
    pub fn ppgtt_create(&mut self) -> GfxResult<Arc<Mutex<HwPpgtt>>> {
        let ppgtt = Arc::new(Mutex::new(HwPpgtt::create(
            &mut self.ggtt,
            &self.info,
            &self.services,
        )?));
        self.ppgtts.push(Arc::downgrade(&ppgtt));
        log::debug!("created PPGTT {:p}", Arc::as_ptr(&ppgtt));
        Ok(ppgtt)
    }

    /// Drop one reference; the last one gives the directory slot back to
    /// the GGTT and frees the tables.
    pub fn ppgtt_put(&mut self, ppgtt: Arc<Mutex<HwPpgtt>>) {
        let ptr = Arc::as_ptr(&ppgtt);
        if let Ok(last) = Arc::try_unwrap(ppgtt) {
            log::debug!("releasing PPGTT {:p}", ptr);
            last.into_inner().release(&mut self.ggtt);
        }
        self.ppgtts.retain(|weak| weak.strong_count() > 0);
    }

    /// Enable PPGTT translation and load the aliasing PPGTT into every
    /// engine.
    pub fn ppgtt_init_hw(&mut self, engines: &mut [&mut dyn Engine]) -> GfxResult<()> {
        // In the case of execlists, PPGTT is enabled by the context descriptor
        // and the PDPs are contained within the context itself.
        if self.params.enable_execlists {
            return Ok(());
        }
        if !self.uses_ppgtt() {
            return Ok(());
        }

        let ids: Vec<EngineId> = engines.iter().map(|e| e.id()).collect();
        switch::ppgtt_enable(&self.info, self.services.mmio.as_ref(), &ids);

        if let Some(ppgtt) = &self.aliasing_ppgtt {
            let ppgtt = ppgtt.lock();
            for engine in engines.iter_mut() {
                ppgtt.switch_mm(&mut **engine)?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Faults, suspend and resume
    // -----------------------------------------------------------------------

    /// Log and clear any latched page fault on `engines`.
    pub fn check_and_clear_faults(&self, engines: &[EngineId]) {
        if self.info.gen < 6 {
            return;
        }

        let mmio = self.services.mmio.as_ref();
        for engine in engines {
            let reg = regs::ring_fault_reg(engine.index());
            let fault = mmio.read_reg(reg);
            if fault & regs::RING_FAULT_VALID != 0 {
                log::debug!(
                    "Unexpected fault\n\tAddr: 0x{:08x}\n\tAddress space: {}\n\tSource ID: {}\n\tType: {}",
                    fault & !(PAGE_SIZE as u32 - 1),
                    if fault & regs::RING_FAULT_GTTSEL_MASK != 0 {
                        "GGTT"
                    } else {
                        "PPGTT"
                    },
                    regs::ring_fault_srcid(fault),
                    regs::ring_fault_fault_type(fault)
                );
                mmio.write_reg(reg, fault & !regs::RING_FAULT_VALID);
            }
        }
        mmio.posting_read(regs::ring_fault_reg(EngineId::Rcs.index()));
    }

    /// Point the whole GGTT at scratch before the device loses power.
    pub fn suspend_mappings(&mut self, engines: &[EngineId]) {
        // Don't bother messing with faults pre GEN6 as we have little
        // documentation supporting that it's a good idea.
        if self.info.gen < 6 {
            return;
        }

        self.check_and_clear_faults(engines);

        let (start, total) = (self.ggtt.start(), self.ggtt.total());
        self.ggtt.clear_range(start, total, true);
        self.ggtt.flush();
    }

    /// Rebuild GGTT entries for every object in `bound` and reload PPGTT
    /// directories after resume.
    pub fn restore_mappings(&mut self, engines: &[EngineId], bound: &mut [GemObject]) {
        self.check_and_clear_faults(engines);

        // First fill our portion of the GTT with scratch pages
        let (start, total) = (self.ggtt.start(), self.ggtt.total());
        self.ggtt.clear_range(start, total, true);

        for obj in bound.iter_mut() {
            if !obj.ggtt_vma().is_some_and(|vma| vma.is_bound()) {
                continue;
            }
            obj.has_global_gtt_mapping = false;
            let level = obj.cache_level;
            if let Err(err) = self.bind_vma(obj, &VmRef::Ggtt, level, BindFlags::GLOBAL_BIND) {
                log::warn!("failed to restore GGTT binding: {}", err);
            }
        }

        if self.info.gen >= 8 {
            ggtt::setup_private_ppat(&self.info, self.services.mmio.as_ref());
            return;
        }

        if let Some(ppgtt) = &self.aliasing_ppgtt {
            ppgtt.lock().write_pdes();
        }
        for ppgtt in self.ppgtts() {
            ppgtt.lock().write_pdes();
        }

        self.ggtt.flush();
    }

    // -----------------------------------------------------------------------
    // Object DMA mappings
    // -----------------------------------------------------------------------

    /// DMA-map an object's pages before its first binding.
    pub fn prepare_object(&self, obj: &mut GemObject) -> GfxResult<()> {
        if obj.has_dma_mapping {
            return Ok(());
        }
        self.services
            .dma
            .map_sg(&mut obj.pages)
            .map_err(|_| GfxError::ResourceExhausted {
                resource: "object DMA mapping",
            })
    }

    /// Drop an object's DMA mapping after its last unbinding.
    pub fn finish_object(&mut self, obj: &mut GemObject) {
        let saved = self.do_idling();

        if !obj.has_dma_mapping {
            self.services.dma.unmap_sg(&mut obj.pages);
        }

        self.undo_idling(saved);
    }

    /// On parts needing idle maps, wait for the GPU and make waits
    /// uninterruptible. Returns the interruptible flag to restore.
    fn do_idling(&mut self) -> Option<bool> {
        if !self.ggtt.do_idle_maps {
            return None;
        }

        let saved = self.interruptible;
        self.interruptible = false;
        if self.services.idle.gpu_idle().is_err() {
            log::error!("Couldn't idle GPU");
        }
        Some(saved)
    }

    fn undo_idling(&mut self, saved: Option<bool>) {
        if let Some(interruptible) = saved {
            self.interruptible = interruptible;
        }
    }

    // -----------------------------------------------------------------------
    // VMA binding
    // -----------------------------------------------------------------------

    fn with_vm_mm<R>(&mut self, vm: &VmRef, f: impl FnOnce(&mut RangeManager) -> R) -> R {
        match vm {
            VmRef::Ggtt => f(self.ggtt.mm()),
            VmRef::Ppgtt(ppgtt) => f(ppgtt.lock().mm()),
        }
    }

    /// Reserve address space for `obj` in `vm`, creating the VMA if needed.
    pub fn insert_vma_node(
        &mut self,
        obj: &mut GemObject,
        vm: &VmRef,
        alignment: u64,
    ) -> GfxResult<RangeNode> {
        if let Some(node) = obj.vma(vm).and_then(|vma| vma.node) {
            return Ok(node);
        }

        let (size, color) = (obj.size, cache_color(obj.cache_level));
        let node = self.with_vm_mm(vm, |mm| mm.insert_node(size, alignment.max(PAGE_SIZE), color))?;
        obj.lookup_or_create_vma(&self.info, vm).node = Some(node);
        Ok(node)
    }

    /// Write PTEs for `obj`'s VMA in `vm`.
    pub fn bind_vma(
        &mut self,
        obj: &mut GemObject,
        vm: &VmRef,
        level: CacheLevel,
        flags: BindFlags,
    ) -> GfxResult<()> {
        let vma = obj.vma(vm).ok_or(GfxError::NotFound {
            resource: "VMA",
            id: 0,
        })?;
        let node = vma.node.ok_or(GfxError::InvalidArgument {
            name: "vma",
            value: "no address space reserved",
        })?;
        let strategy = vma.strategy;

        let mut flags = flags;
        if obj.gt_ro {
            flags |= BindFlags::PTE_READ_ONLY;
        }

        match (strategy, vm) {
            (BindStrategy::Ppgtt, VmRef::Ppgtt(ppgtt)) => {
                ppgtt
                    .lock()
                    .insert_entries(&obj.pages, node.start, level, flags);
            }
            (BindStrategy::Ggtt, _) => self.ggtt_bind(obj, node, level, flags),
            (BindStrategy::Gmch, _) => {
                self.ggtt.insert_entries(&obj.pages, node.start, level, flags);
                obj.has_global_gtt_mapping = true;
            }
            (BindStrategy::Ppgtt, VmRef::Ggtt) => {
                return Err(GfxError::InvalidArgument {
                    name: "vm",
                    value: "PPGTT binding on the global GTT",
                });
            }
        }
        Ok(())
    }

    fn ggtt_bind(&mut self, obj: &mut GemObject, node: RangeNode, level: CacheLevel, flags: BindFlags) {
        // Without an aliasing PPGTT every GGTT binding is global. With one,
        // only explicit global binds (display, fences) reach the GGTT.
        if self.aliasing_ppgtt.is_none() || flags.contains(BindFlags::GLOBAL_BIND) {
            if !obj.has_global_gtt_mapping || level != obj.cache_level {
                self.ggtt.insert_entries(&obj.pages, node.start, level, flags);
                obj.has_global_gtt_mapping = true;
            }
        }

        if let Some(appgtt) = &self.aliasing_ppgtt {
            if !obj.has_aliasing_ppgtt_mapping || level != obj.cache_level {
                appgtt
                    .lock()
                    .insert_entries(&obj.pages, node.start, level, flags);
                obj.has_aliasing_ppgtt_mapping = true;
            }
        }
    }

    /// Point `obj`'s VMA in `vm` back at scratch. Unbinding an unbound VMA
    /// does nothing.
    pub fn unbind_vma(&mut self, obj: &mut GemObject, vm: &VmRef) {
        let Some((node, strategy)) = obj
            .vma(vm)
            .and_then(|vma| vma.node.map(|node| (node, vma.strategy)))
        else {
            return;
        };

        match (strategy, vm) {
            (BindStrategy::Ppgtt, VmRef::Ppgtt(ppgtt)) => {
                ppgtt.lock().clear_range(node.start, obj.size, true);
            }
            (BindStrategy::Ggtt, _) => {
                if obj.has_global_gtt_mapping {
                    self.ggtt.clear_range(node.start, obj.size, true);
                    obj.has_global_gtt_mapping = false;
                }
                if obj.has_aliasing_ppgtt_mapping {
                    if let Some(appgtt) = &self.aliasing_ppgtt {
                        appgtt.lock().clear_range(node.start, obj.size, true);
                    }
                    obj.has_aliasing_ppgtt_mapping = false;
                }
            }
            (BindStrategy::Gmch, _) => {
                obj.has_global_gtt_mapping = false;
                self.ggtt.clear_range(node.start, obj.size, true);
            }
            (BindStrategy::Ppgtt, VmRef::Ggtt) => {}
        }
    }

    /// Unbind, release the address range and drop the VMA. The VMA's PPGTT
    /// reference goes with it.
    pub fn destroy_vma(&mut self, obj: &mut GemObject, vm: &VmRef) {
        self.unbind_vma(obj, vm);
        let Some(vma) = obj.remove_vma(vm) else {
            return;
        };
        if let Some(node) = vma.node {
            self.with_vm_mm(&vma.vm, |mm| mm.remove_node(&node));
        }
        if let VmRef::Ppgtt(ppgtt) = vma.vm {
            self.ppgtt_put(ppgtt);
        }
    }
}

impl Drop for I915Gtt {
    fn drop(&mut self) {
        if let Some(ppgtt) = self.aliasing_ppgtt.take() {
            self.ppgtt_put(ppgtt);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        drivers::i915::{device_ids, sg::SgTable},
        testing::{FakeEngine, GttHarness},
    };

    fn info(id: u16) -> DeviceInfo {
        DeviceInfo::from_device_id(id, 0).unwrap()
    }

    #[test]
    fn test_sanitize_enable_ppgtt() {
        let snb = info(device_ids::SANDYBRIDGE_GT2);
        let ivb = info(device_ids::IVYBRIDGE_GT2);
        let bdw = info(device_ids::BROADWELL_M_GT2);
        let ilk = info(device_ids::IRONLAKE_M);

        assert_eq!(sanitize_enable_ppgtt(&ilk, -1), 0);
        assert_eq!(sanitize_enable_ppgtt(&snb, 0), 0);
        assert_eq!(sanitize_enable_ppgtt(&snb, 1), 1);
        assert_eq!(sanitize_enable_ppgtt(&snb, 2), 1);
        assert_eq!(sanitize_enable_ppgtt(&ivb, 2), 2);
        assert_eq!(sanitize_enable_ppgtt(&bdw, 2), 1);
        assert_eq!(sanitize_enable_ppgtt(&ivb, -1), 1);

        let mut snb_vtd = snb;
        snb_vtd.iommu_gfx_mapped = true;
        assert_eq!(sanitize_enable_ppgtt(&snb_vtd, -1), 0);
        // explicit requests win over the VT-d quirk
        assert_eq!(sanitize_enable_ppgtt(&snb_vtd, 1), 1);

        let vlv_a0 = DeviceInfo::from_device_id(device_ids::VALLEYVIEW, 0x3).unwrap();
        assert_eq!(sanitize_enable_ppgtt(&vlv_a0, -1), 0);
        let vlv_b3 = DeviceInfo::from_device_id(device_ids::VALLEYVIEW, 0xb).unwrap();
        assert_eq!(sanitize_enable_ppgtt(&vlv_b3, -1), 1);
    }

    #[test]
    fn test_init_creates_aliasing_ppgtt() {
        let harness = GttHarness::new();
        let mut gtt = I915Gtt::init(
            info(device_ids::SANDYBRIDGE_GT2),
            I915Params::default(),
            &GttHarness::gen6_pci(),
            harness.services(),
        )
        .unwrap();

        assert!(gtt.uses_ppgtt());
        assert!(!gtt.uses_full_ppgtt());
        assert!(gtt.aliasing_ppgtt().is_some());
        // only the aliasing directory occupies the GGTT
        assert_eq!(gtt.ggtt_mut().mm().nodes().len(), 1);
    }

    #[test]
    fn test_full_ppgtt_has_no_aliasing() {
        let harness = GttHarness::new();
        let params = I915Params {
            enable_ppgtt: 2,
            ..Default::default()
        };
        let mut gtt = I915Gtt::init(
            info(device_ids::IVYBRIDGE_GT2),
            params,
            &GttHarness::gen6_pci(),
            harness.services(),
        )
        .unwrap();
        assert!(gtt.aliasing_ppgtt().is_none());

        let ppgtt = gtt.ppgtt_create().unwrap();
        let extra = ppgtt.clone();
        assert_eq!(gtt.ppgtts().count(), 1);

        gtt.ppgtt_put(ppgtt);
        assert_eq!(gtt.ggtt_mut().mm().nodes().len(), 1);
        gtt.ppgtt_put(extra);
        assert_eq!(gtt.ppgtts().count(), 0);
        assert!(gtt.ggtt_mut().mm().nodes().is_empty());
    }

    #[test]
    fn test_guard_page_and_color_adjust() {
        let harness = GttHarness::new();
        let params = I915Params {
            enable_ppgtt: 0,
            ..Default::default()
        };
        let mut gtt = I915Gtt::init(
            info(device_ids::VALLEYVIEW),
            params,
            &GttHarness::gen6_pci(),
            harness.services(),
        )
        .unwrap();

        let total = gtt.ggtt().total() + gtt.ggtt().start();
        assert_eq!(gtt.ggtt_mut().mm().end(), total - PAGE_SIZE);

        let mut a = GttHarness::object(0x10_0000, 1);
        let mut b = GttHarness::object(0x20_0000, 1);
        b.cache_level = CacheLevel::Llc;
        let na = gtt.insert_vma_node(&mut a, &VmRef::Ggtt, 0).unwrap();
        let nb = gtt.insert_vma_node(&mut b, &VmRef::Ggtt, 0).unwrap();
        // VLV has no LLC: differing colours are kept a page apart
        assert_eq!(nb.start, na.end() + PAGE_SIZE);
    }

    #[test]
    fn test_preallocated_nodes_are_reserved() {
        let harness = GttHarness::new();
        let snb = info(device_ids::SANDYBRIDGE_GT2);
        let params = I915Params {
            enable_ppgtt: 0,
            ..Default::default()
        };
        let mut gtt = I915Gtt::probe(snb, params, &GttHarness::gen6_pci(), harness.services()).unwrap();

        let mut fb = GttHarness::object(0x30_0000, 4);
        fb.lookup_or_create_vma(&snb, &VmRef::Ggtt).node = Some(RangeNode {
            start: 16 * PAGE_SIZE,
            size: 4 * PAGE_SIZE,
            color: 0,
        });
        gtt.init_global_gtt(core::slice::from_mut(&mut fb)).unwrap();

        assert!(fb.has_global_gtt_mapping);
        assert_eq!(gtt.ggtt_mut().mm().nodes().len(), 1);
        assert_eq!(gtt.ggtt_mut().mm().holes()[0], (0, 16 * PAGE_SIZE));
    }

    #[test]
    fn test_init_hw_switches_every_engine() {
        let harness = GttHarness::new();
        let mut gtt = I915Gtt::init(
            info(device_ids::HASWELL_GT2),
            I915Params::default(),
            &GttHarness::gen6_pci(),
            harness.services(),
        )
        .unwrap();

        let mut rcs = FakeEngine::new(EngineId::Rcs);
        let mut bcs = FakeEngine::new(EngineId::Bcs);
        gtt.ppgtt_init_hw(&mut [&mut rcs, &mut bcs]).unwrap();
        assert_eq!(rcs.emitted().len(), 6);
        assert_eq!(bcs.emitted().len(), 6);
        assert_eq!(
            harness.mmio.reg(regs::ring_mode_gen7(regs::BLT_RING_BASE)),
            regs::masked_bit_enable(regs::GFX_PPGTT_ENABLE)
        );

        let mut execlists = I915Gtt::init(
            info(device_ids::BROADWELL_M_GT2),
            I915Params {
                enable_execlists: true,
                ..Default::default()
            },
            &GttHarness::gen8_pci(),
            GttHarness::new().services(),
        )
        .unwrap();
        let mut rcs = FakeEngine::new(EngineId::Rcs);
        execlists.ppgtt_init_hw(&mut [&mut rcs]).unwrap();
        assert!(rcs.emitted().is_empty());
    }

    #[test]
    fn test_faults_are_cleared() {
        let harness = GttHarness::new();
        let gtt = I915Gtt::init(
            info(device_ids::SANDYBRIDGE_GT2),
            I915Params::default(),
            &GttHarness::gen6_pci(),
            harness.services(),
        )
        .unwrap();

        let vcs_fault = regs::ring_fault_reg(EngineId::Vcs.index());
        harness
            .mmio
            .set_reg(vcs_fault, 0x1234_5000 | regs::RING_FAULT_VALID);
        gtt.check_and_clear_faults(&[EngineId::Rcs, EngineId::Vcs]);
        assert_eq!(harness.mmio.reg(vcs_fault), 0x1234_5000);
    }

    #[test]
    fn test_prepare_and_finish_object() {
        let harness = GttHarness::new();
        let mut gtt = I915Gtt::init(
            info(device_ids::SANDYBRIDGE_GT2),
            I915Params::default(),
            &GttHarness::gen6_pci(),
            harness.services(),
        )
        .unwrap();

        let mut sg = SgTable::new();
        sg.add_entry(0x40_0000, 2 * PAGE_SIZE);
        let mut obj = GemObject::new(sg, CacheLevel::Llc);
        gtt.prepare_object(&mut obj).unwrap();
        assert!(obj.pages.is_mapped());
        gtt.finish_object(&mut obj);
        assert!(!obj.pages.is_mapped());

        harness.dma.fail_after(0);
        assert!(matches!(
            gtt.prepare_object(&mut obj),
            Err(GfxError::ResourceExhausted { .. })
        ));

        obj.has_dma_mapping = true;
        assert!(gtt.prepare_object(&mut obj).is_ok());
    }

    #[test]
    fn test_idle_maps_quirk_idles_gpu() {
        let harness = GttHarness::new();
        let mut ilk = info(device_ids::IRONLAKE_M);
        ilk.iommu_gfx_mapped = true;
        let mut gtt = I915Gtt::init(ilk, I915Params::default(), &GttHarness::gen6_pci(), harness.services()).unwrap();
        assert!(gtt.ggtt().do_idle_maps);

        let mut obj = GttHarness::object(0x50_0000, 1);
        gtt.prepare_object(&mut obj).unwrap();
        harness.idle.fail(true);
        gtt.finish_object(&mut obj);
        assert_eq!(harness.idle.calls(), 1);
        assert!(gtt.is_interruptible());
    }
}
