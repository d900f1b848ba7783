//! Host-side test doubles
//!
//! In-memory stand-ins for the platform services both cores call into:
//! page allocation, DMA mapping, the register BAR, command rings and the
//! display driver callbacks. They keep counters instead of touching
//! hardware, so unit and integration tests can assert on what was done.
//! Failure injection is available wherever an error path needs
//! exercising.

use alloc::{
    collections::BTreeMap,
    format,
    string::String,
    sync::Arc,
    vec,
    vec::Vec,
};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use spin::Mutex;

use crate::{
    drivers::i915::{
        address_space::Evictor,
        ggtt::{GmchChipset, GmchInfo, GttMmio, PciGttConfig},
        gtt::{GpuIdle, GttServices},
        mib,
        page::{DmaAddr, Page, PageAllocator},
        pte::CacheLevel,
        range::{RangeManager, RangeNode},
        sg::{DmaMapper, SgTable},
        switch::{Engine, EngineId, GpuDomains},
        vma::GemObject,
        PAGE_SIZE,
    },
    drm::{
        funcs::{
            BridgeFuncs, ConnectorHelperFuncs, CrtcHelperFuncs, EncoderHelperFuncs, Fence, Framebuffer,
            PlaneHelperFuncs,
        },
        helper::legacy::{self, ModeSet},
        lock::{AcquireCtx, ModesetLockDomain, ModesetLockId, SpinLockDomain},
        mode::{fixed16, DisplayMode, DpmsMode},
        object::{ConnectorId, CrtcId, DrmDevice, EncoderId, PlaneId, PlaneType, PropertyId},
        state::{ConnectorState, CrtcState, PlaneState},
        vblank::VblankService,
        AtomicState,
    },
    error::{GfxError, GfxResult},
};

// ---------------------------------------------------------------------------
// Page allocation
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct HostMemState {
    next_pfn: u64,
    outstanding: usize,
    /// Pages that may still be handed out before allocation fails.
    budget: Option<usize>,
    mapped: usize,
    kmaps: usize,
    flushes: usize,
}

/// Page allocator backed by the host heap.
#[derive(Debug)]
pub struct HostPageAllocator {
    state: Mutex<HostMemState>,
}

impl HostPageAllocator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostMemState {
                next_pfn: 0x100,
                outstanding: 0,
                budget: None,
                mapped: 0,
                kmaps: 0,
                flushes: 0,
            }),
        }
    }

    /// Let `pages` more pages through, then fail every allocation.
    pub fn fail_after(&self, pages: usize) {
        self.state.lock().budget = Some(pages);
    }

    /// Pages allocated and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    /// CPU mappings currently open.
    pub fn mapped_now(&self) -> usize {
        self.state.lock().mapped
    }

    pub fn kmaps(&self) -> usize {
        self.state.lock().kmaps
    }

    pub fn flushes(&self) -> usize {
        self.state.lock().flushes
    }

    pub fn reset_counters(&self) {
        let mut state = self.state.lock();
        state.kmaps = 0;
        state.flushes = 0;
    }

    fn take(&self, count: usize) -> Option<u64> {
        let mut state = self.state.lock();
        if let Some(budget) = state.budget.as_mut() {
            if *budget < count {
                return None;
            }
            *budget -= count;
        }
        let first = state.next_pfn;
        state.next_pfn += count as u64;
        state.outstanding += count;
        Some(first)
    }
}

impl Default for HostPageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PageAllocator for HostPageAllocator {
    fn alloc_page(&self) -> Option<Page> {
        self.take(1).map(Page::new)
    }

    fn alloc_pages(&self, order: u32) -> Option<Vec<Page>> {
        let count = 1usize << order;
        let first = self.take(count)?;
        Some((0..count as u64).map(|i| Page::new(first + i)).collect())
    }

    fn free_page(&self, _page: Page) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
    }

    fn kmap(&self, _page: &Page) {
        let mut state = self.state.lock();
        state.mapped += 1;
        state.kmaps += 1;
    }

    fn kunmap(&self, _page: &Page) {
        let mut state = self.state.lock();
        state.mapped = state.mapped.saturating_sub(1);
    }

    fn clflush(&self, _page: &Page) {
        self.state.lock().flushes += 1;
    }
}

// ---------------------------------------------------------------------------
// DMA mapping
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct DmaState {
    /// Live single-page mappings, counted per bus address.
    pages: BTreeMap<DmaAddr, usize>,
    sg_entries: usize,
    /// Mapping operations that may still succeed.
    budget: Option<usize>,
}

impl DmaState {
    fn consume(&mut self) -> GfxResult<()> {
        match self.budget.as_mut() {
            Some(0) => Err(GfxError::ResourceExhausted {
                resource: "DMA mapping",
            }),
            Some(budget) => {
                *budget -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Identity DMA mapper that remembers what is mapped.
#[derive(Debug, Default)]
pub struct RecordingDmaMapper {
    state: Mutex<DmaState>,
}

impl RecordingDmaMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `ops` more map operations through; a whole table counts as one.
    pub fn fail_after(&self, ops: usize) {
        self.state.lock().budget = Some(ops);
    }

    /// Page mappings plus mapped table segments.
    pub fn live_mappings(&self) -> usize {
        let state = self.state.lock();
        state.pages.values().sum::<usize>() + state.sg_entries
    }

    /// Bus address of `page` if it is mapped.
    pub fn mapping_of(&self, page: &Page) -> Option<DmaAddr> {
        let addr = page.phys_addr();
        self.state.lock().pages.contains_key(&addr).then_some(addr)
    }
}

impl DmaMapper for RecordingDmaMapper {
    fn map_page(&self, page: &Page) -> GfxResult<DmaAddr> {
        let mut state = self.state.lock();
        state.consume()?;
        let addr = page.phys_addr();
        *state.pages.entry(addr).or_insert(0) += 1;
        Ok(addr)
    }

    fn unmap_page(&self, addr: DmaAddr) {
        let mut state = self.state.lock();
        let remaining = match state.pages.get_mut(&addr) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => {
                log::warn!("unmapping unknown DMA address {:#x}", addr);
                return;
            }
        };
        if remaining == 0 {
            state.pages.remove(&addr);
        }
    }

    fn map_sg(&self, sg: &mut SgTable) -> GfxResult<()> {
        let mut state = self.state.lock();
        state.consume()?;
        for entry in sg.entries.iter_mut() {
            if entry.dma_addr.replace(entry.phys_addr).is_none() {
                state.sg_entries += 1;
            }
        }
        Ok(())
    }

    fn unmap_sg(&self, sg: &mut SgTable) {
        let mut state = self.state.lock();
        for entry in sg.entries.iter_mut() {
            if entry.dma_addr.take().is_some() {
                state.sg_entries = state.sg_entries.saturating_sub(1);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Register BAR
// ---------------------------------------------------------------------------

/// One logged register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegWrite {
    pub reg: u32,
    pub val: u32,
}

impl RegWrite {
    pub fn new(reg: u32, val: u32) -> Self {
        Self { reg, val }
    }
}

/// Register file and GSM held in memory.
#[derive(Debug)]
pub struct MemoryGttMmio {
    gsm: Mutex<Vec<u8>>,
    regs: Mutex<BTreeMap<u32, u32>>,
    writes: Mutex<Vec<RegWrite>>,
}

impl MemoryGttMmio {
    /// A BAR whose GSM holds `gsm_bytes` bytes of entries.
    pub fn new(gsm_bytes: usize) -> Self {
        Self {
            gsm: Mutex::new(vec![0u8; gsm_bytes]),
            regs: Mutex::new(BTreeMap::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn reg(&self, reg: u32) -> u32 {
        self.regs.lock().get(&reg).copied().unwrap_or(0)
    }

    /// Preset a register without logging a write.
    pub fn set_reg(&self, reg: u32, val: u32) {
        self.regs.lock().insert(reg, val);
    }

    pub fn reg_writes(&self) -> Vec<RegWrite> {
        self.writes.lock().clone()
    }

    fn store(&self, offset: usize, bytes: &[u8]) {
        let mut gsm = self.gsm.lock();
        if let Some(slot) = gsm.get_mut(offset..offset + bytes.len()) {
            slot.copy_from_slice(bytes);
        }
    }

    fn load<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut raw = [0u8; N];
        if let Some(slot) = self.gsm.lock().get(offset..offset + N) {
            raw.copy_from_slice(slot);
        }
        raw
    }
}

impl GttMmio for MemoryGttMmio {
    fn write_gsm32(&self, index: u64, val: u32) {
        self.store(index as usize * 4, &val.to_le_bytes());
    }

    fn read_gsm32(&self, index: u64) -> u32 {
        u32::from_le_bytes(self.load(index as usize * 4))
    }

    fn write_gsm64(&self, index: u64, val: u64) {
        self.store(index as usize * 8, &val.to_le_bytes());
    }

    fn read_gsm64(&self, index: u64) -> u64 {
        u64::from_le_bytes(self.load(index as usize * 8))
    }

    fn write_reg(&self, reg: u32, val: u32) {
        self.regs.lock().insert(reg, val);
        self.writes.lock().push(RegWrite::new(reg, val));
    }

    fn read_reg(&self, reg: u32) -> u32 {
        self.reg(reg)
    }

    fn posting_read(&self, _reg: u32) {}
}

// ---------------------------------------------------------------------------
// Engines, eviction, chipset, idling
// ---------------------------------------------------------------------------

/// Command ring that records what was emitted.
#[derive(Debug)]
pub struct FakeEngine {
    id: EngineId,
    emitted: Vec<u32>,
    flushes: usize,
    begins: usize,
    fail_begin: bool,
}

impl FakeEngine {
    pub fn new(id: EngineId) -> Self {
        Self {
            id,
            emitted: Vec::new(),
            flushes: 0,
            begins: 0,
            fail_begin: false,
        }
    }

    pub fn emitted(&self) -> &[u32] {
        &self.emitted
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }

    pub fn begins(&self) -> usize {
        self.begins
    }

    /// Make ring space reservation fail.
    pub fn fail_begin(&mut self, fail: bool) {
        self.fail_begin = fail;
    }
}

impl Engine for FakeEngine {
    fn id(&self) -> EngineId {
        self.id
    }

    fn flush(&mut self, _invalidate: GpuDomains, _flush: GpuDomains) -> GfxResult<()> {
        self.flushes += 1;
        Ok(())
    }

    fn begin(&mut self, _dwords: usize) -> GfxResult<()> {
        self.begins += 1;
        if self.fail_begin {
            return Err(GfxError::ResourceExhausted {
                resource: "ring space",
            });
        }
        Ok(())
    }

    fn emit(&mut self, dword: u32) {
        self.emitted.push(dword);
    }

    fn advance(&mut self) {}
}

/// Evictor with a scripted list of idle nodes.
#[derive(Debug, Default)]
pub struct FakeEvictor {
    victims: Mutex<Vec<RangeNode>>,
    calls: AtomicUsize,
}

impl FakeEvictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `node` as evictable.
    pub fn add_victim(&self, node: RangeNode) {
        self.victims.lock().push(node);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Evictor for FakeEvictor {
    fn evict_something(
        &self,
        mm: &mut RangeManager,
        _size: u64,
        _alignment: u64,
        _level: CacheLevel,
        start: u64,
        end: u64,
    ) -> GfxResult<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let mut victims = self.victims.lock();
        let before = victims.len();
        victims.retain(|node| {
            let inside = node.start >= start && node.end() <= end;
            !(inside && mm.remove_node(node))
        });
        if victims.len() == before {
            return Err(GfxError::ResourceExhausted {
                resource: "GGTT space",
            });
        }
        Ok(())
    }
}

/// A call into the chipset GTT helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipsetCall {
    Insert { first_entry: u64, pages: u64, flags: u32 },
    Clear { first_entry: u64, num_entries: u64 },
    Flush,
    Remove,
}

/// Gen2-gen5 chipset helper with a 256MiB aperture.
#[derive(Debug, Default)]
pub struct FakeChipset {
    calls: Mutex<Vec<ChipsetCall>>,
}

impl FakeChipset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ChipsetCall> {
        self.calls.lock().clone()
    }
}

impl GmchChipset for FakeChipset {
    fn probe(&self) -> Option<GmchInfo> {
        Some(GmchInfo {
            gtt_total: mib(256),
            stolen_size: mib(32),
            mappable_base: 0xd000_0000,
            mappable_end: mib(256),
        })
    }

    fn insert_sg_entries(&self, pages: &SgTable, first_entry: u64, flags: u32) {
        self.calls.lock().push(ChipsetCall::Insert {
            first_entry,
            pages: pages.page_count(),
            flags,
        });
    }

    fn clear_range(&self, first_entry: u64, num_entries: u64) {
        self.calls.lock().push(ChipsetCall::Clear {
            first_entry,
            num_entries,
        });
    }

    fn chipset_flush(&self) {
        self.calls.lock().push(ChipsetCall::Flush);
    }

    fn remove(&self) {
        self.calls.lock().push(ChipsetCall::Remove);
    }
}

#[derive(Debug, Default)]
pub struct FakeGpuIdle {
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl FakeGpuIdle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl GpuIdle for FakeGpuIdle {
    fn gpu_idle(&self) -> GfxResult<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.fail.load(Ordering::Relaxed) {
            return Err(GfxError::HardwareFault {
                device: "render ring",
                code: 0,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GTT harness
// ---------------------------------------------------------------------------

/// GSM size of the harness BAR, enough for a 2GiB gen6 or 1GiB gen8 GGTT.
const HARNESS_GSM_BYTES: usize = 2 << 20;

/// Every platform service the GTT code needs, as inspectable doubles.
pub struct GttHarness {
    pub mem: Arc<HostPageAllocator>,
    pub dma: Arc<RecordingDmaMapper>,
    pub mmio: Arc<MemoryGttMmio>,
    pub evictor: Arc<FakeEvictor>,
    pub chipset: Arc<FakeChipset>,
    pub idle: Arc<FakeGpuIdle>,
}

impl GttHarness {
    pub fn new() -> Self {
        Self {
            mem: Arc::new(HostPageAllocator::new()),
            dma: Arc::new(RecordingDmaMapper::new()),
            mmio: Arc::new(MemoryGttMmio::new(HARNESS_GSM_BYTES)),
            evictor: Arc::new(FakeEvictor::new()),
            chipset: Arc::new(FakeChipset::new()),
            idle: Arc::new(FakeGpuIdle::new()),
        }
    }

    pub fn services(&self) -> GttServices {
        GttServices {
            mem: self.mem.clone(),
            dma: self.dma.clone(),
            mmio: self.mmio.clone(),
            evictor: self.evictor.clone(),
            gmch: Some(self.chipset.clone() as Arc<dyn GmchChipset>),
            idle: self.idle.clone(),
        }
    }

    /// Gen6/7 config space: 2MiB of PTEs (a 2GiB GGTT), 64MiB stolen and a
    /// 256MiB aperture.
    pub fn gen6_pci() -> PciGttConfig {
        PciGttConfig {
            gmch_ctl: (2 << 8) | (2 << 3),
            gmadr_base: 0xe000_0000,
            gmadr_len: mib(256),
        }
    }

    /// Gen8 config space: 2MiB of PTEs (a 1GiB GGTT), 64MiB stolen.
    pub fn gen8_pci() -> PciGttConfig {
        PciGttConfig {
            gmch_ctl: (1 << 6) | (2 << 8),
            gmadr_base: 0xe000_0000,
            gmadr_len: mib(256),
        }
    }

    /// Uncached object of `pages` contiguous pages starting at `phys`.
    pub fn object(phys: u64, pages: u64) -> GemObject {
        let mut sg = SgTable::new();
        sg.add_entry(phys, pages * PAGE_SIZE);
        GemObject::new(sg, CacheLevel::None)
    }
}

impl Default for GttHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Display callbacks
// ---------------------------------------------------------------------------

/// Ordered record of driver callbacks, shared by every mock of a harness.
#[derive(Debug, Default)]
pub struct CallLog {
    calls: Mutex<Vec<String>>,
}

impl CallLog {
    pub fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Index of the first occurrence of `call`.
    pub fn position(&self, call: &str) -> Option<usize> {
        self.calls.lock().iter().position(|c| c == call)
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

/// The one property a mock object takes; every other is unsupported.
#[derive(Debug, Default)]
pub struct PropertyFilter {
    accepted: Mutex<Option<PropertyId>>,
}

impl PropertyFilter {
    pub fn accept(&self, property: Option<PropertyId>) {
        *self.accepted.lock() = property;
    }

    fn check(&self, property: PropertyId) -> GfxResult<()> {
        if *self.accepted.lock() == Some(property) {
            Ok(())
        } else {
            Err(GfxError::OperationNotSupported {
                operation: "atomic property",
            })
        }
    }
}

pub struct MockCrtcFuncs {
    index: u32,
    log: Arc<CallLog>,
    pub properties: PropertyFilter,
}

impl MockCrtcFuncs {
    fn note(&self, hook: &str) {
        self.log.record(format!("crtc:{} {}", self.index, hook));
    }
}

impl CrtcHelperFuncs for MockCrtcFuncs {
    fn mode_fixup(&self, _crtc: CrtcId, _mode: &DisplayMode, _adjusted: &mut DisplayMode) -> bool {
        self.note("mode_fixup");
        true
    }

    fn mode_set_nofb(&self, _crtc: CrtcId, _state: &CrtcState) {
        self.note("mode_set_nofb");
    }

    fn prepare(&self, _crtc: CrtcId) {
        self.note("prepare");
    }

    fn commit(&self, _crtc: CrtcId) {
        self.note("commit");
    }

    fn disable(&self, _crtc: CrtcId) {
        self.note("disable");
    }

    fn dpms(&self, _crtc: CrtcId, mode: DpmsMode) {
        self.log.record(format!("crtc:{} dpms {:?}", self.index, mode));
    }

    fn atomic_begin(&self, _crtc: CrtcId) {
        self.note("atomic_begin");
    }

    fn atomic_flush(&self, _crtc: CrtcId) {
        self.note("atomic_flush");
    }

    fn atomic_set_property(
        &self,
        _crtc: CrtcId,
        _state: &mut CrtcState,
        property: PropertyId,
        value: u64,
    ) -> GfxResult<()> {
        self.properties.check(property)?;
        self.log
            .record(format!("crtc:{} set_property {}={}", self.index, property, value));
        Ok(())
    }
}

pub struct MockEncoderFuncs {
    index: u32,
    log: Arc<CallLog>,
    reject: AtomicBool,
}

impl MockEncoderFuncs {
    /// Make the next fixups fail.
    pub fn reject_fixup(&self, reject: bool) {
        self.reject.store(reject, Ordering::Relaxed);
    }

    fn note(&self, hook: &str) {
        self.log.record(format!("encoder:{} {}", self.index, hook));
    }
}

impl EncoderHelperFuncs for MockEncoderFuncs {
    fn mode_fixup(&self, _encoder: EncoderId, _mode: &DisplayMode, _adjusted: &mut DisplayMode) -> bool {
        self.note("mode_fixup");
        !self.reject.load(Ordering::Relaxed)
    }

    fn mode_set(&self, _encoder: EncoderId, _mode: &DisplayMode, _adjusted: &DisplayMode) {
        self.note("mode_set");
    }

    fn prepare(&self, _encoder: EncoderId) {
        self.note("prepare");
    }

    fn commit(&self, _encoder: EncoderId) {
        self.note("commit");
    }

    fn disable(&self, _encoder: EncoderId) {
        self.note("disable");
    }

    fn dpms(&self, _encoder: EncoderId, mode: DpmsMode) {
        self.log.record(format!("encoder:{} dpms {:?}", self.index, mode));
    }
}

pub struct MockBridgeFuncs {
    index: u32,
    log: Arc<CallLog>,
}

impl MockBridgeFuncs {
    fn note(&self, hook: &str) {
        self.log.record(format!("bridge:{} {}", self.index, hook));
    }
}

impl BridgeFuncs for MockBridgeFuncs {
    fn mode_fixup(&self, _mode: &DisplayMode, _adjusted: &mut DisplayMode) -> bool {
        self.note("mode_fixup");
        true
    }

    fn mode_set(&self, _mode: &DisplayMode, _adjusted: &DisplayMode) {
        self.note("mode_set");
    }

    fn disable(&self) {
        self.note("disable");
    }

    fn post_disable(&self) {
        self.note("post_disable");
    }

    fn pre_enable(&self) {
        self.note("pre_enable");
    }

    fn enable(&self) {
        self.note("enable");
    }
}

pub struct MockConnectorFuncs {
    index: u32,
    log: Arc<CallLog>,
    route: Mutex<Option<EncoderId>>,
    pub properties: PropertyFilter,
}

impl MockConnectorFuncs {
    /// Encoder `best_encoder` answers with from now on.
    pub fn route_to(&self, encoder: Option<EncoderId>) {
        *self.route.lock() = encoder;
    }
}

impl ConnectorHelperFuncs for MockConnectorFuncs {
    fn best_encoder(&self, _connector: ConnectorId) -> Option<EncoderId> {
        *self.route.lock()
    }

    fn atomic_set_property(
        &self,
        _connector: ConnectorId,
        _state: &mut ConnectorState,
        property: PropertyId,
        value: u64,
    ) -> GfxResult<()> {
        self.properties.check(property)?;
        self.log
            .record(format!("connector:{} set_property {}={}", self.index, property, value));
        Ok(())
    }
}

pub struct MockPlaneFuncs {
    index: u32,
    log: Arc<CallLog>,
    fail_check: AtomicBool,
    fail_prepare: AtomicBool,
    /// Accepted property moves the plane horizontally.
    pub properties: PropertyFilter,
}

impl MockPlaneFuncs {
    /// Fail `atomic_check` with `-EINVAL`.
    pub fn fail_check(&self, fail: bool) {
        self.fail_check.store(fail, Ordering::Relaxed);
    }

    /// Fail `prepare_fb` with `-ENOMEM`.
    pub fn fail_prepare(&self, fail: bool) {
        self.fail_prepare.store(fail, Ordering::Relaxed);
    }

    fn note(&self, hook: &str) {
        self.log.record(format!("plane:{} {}", self.index, hook));
    }
}

impl PlaneHelperFuncs for MockPlaneFuncs {
    fn prepare_fb(&self, _plane: PlaneId, _fb: &Arc<Framebuffer>) -> GfxResult<()> {
        self.note("prepare_fb");
        if self.fail_prepare.load(Ordering::Relaxed) {
            return Err(GfxError::Driver { code: -12 });
        }
        Ok(())
    }

    fn cleanup_fb(&self, _plane: PlaneId, _fb: &Arc<Framebuffer>) {
        self.note("cleanup_fb");
    }

    fn atomic_check(&self, _plane: PlaneId, _state: &PlaneState) -> GfxResult<()> {
        self.note("atomic_check");
        if self.fail_check.load(Ordering::Relaxed) {
            return Err(GfxError::Driver { code: -22 });
        }
        Ok(())
    }

    fn atomic_update(&self, _plane: PlaneId, _state: &PlaneState) {
        self.note("atomic_update");
    }

    fn atomic_set_property(
        &self,
        _plane: PlaneId,
        state: &mut PlaneState,
        property: PropertyId,
        value: u64,
    ) -> GfxResult<()> {
        self.properties.check(property)?;
        state.crtc_x = value as i32;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Display services
// ---------------------------------------------------------------------------

/// Vblank counter that ticks whenever someone waits on it.
#[derive(Debug, Default)]
pub struct FakeVblank {
    counts: Mutex<BTreeMap<CrtcId, u32>>,
    refs: AtomicUsize,
    waits: AtomicUsize,
    stalled: AtomicBool,
}

impl FakeVblank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::Relaxed)
    }

    /// References taken and not yet put back.
    pub fn outstanding(&self) -> usize {
        self.refs.load(Ordering::Relaxed)
    }

    /// Stop the counter so every wait times out.
    pub fn stall(&self, stall: bool) {
        self.stalled.store(stall, Ordering::Relaxed);
    }
}

impl VblankService for FakeVblank {
    fn get(&self, _crtc: CrtcId) -> GfxResult<()> {
        self.refs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn put(&self, _crtc: CrtcId) {
        self.refs.fetch_sub(1, Ordering::Relaxed);
    }

    fn count(&self, crtc: CrtcId) -> u32 {
        self.counts.lock().get(&crtc).copied().unwrap_or(0)
    }

    fn wait_for_change(&self, crtc: CrtcId, last: u32, _timeout_ms: u32) -> bool {
        self.waits.fetch_add(1, Ordering::Relaxed);
        if self.stalled.load(Ordering::Relaxed) {
            return false;
        }
        let mut counts = self.counts.lock();
        let count = counts.entry(crtc).or_insert(0);
        *count = count.wrapping_add(1);
        *count != last
    }
}

/// Spinlock domain that can be told to report contention.
#[derive(Debug, Default)]
pub struct FakeLockDomain {
    inner: SpinLockDomain,
    contend: AtomicUsize,
    backoffs: AtomicUsize,
}

impl FakeLockDomain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` lock attempts with contention.
    pub fn contend(&self, times: usize) {
        self.contend.store(times, Ordering::Relaxed);
    }

    pub fn backoffs(&self) -> usize {
        self.backoffs.load(Ordering::Relaxed)
    }
}

impl ModesetLockDomain for FakeLockDomain {
    fn new_ctx(&self) -> AcquireCtx {
        self.inner.new_ctx()
    }

    fn lock(&self, ctx: &mut AcquireCtx, lock: ModesetLockId) -> GfxResult<()> {
        let injected = self
            .contend
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            ctx.note_contended(lock);
            return Err(GfxError::LockContention);
        }
        self.inner.lock(ctx, lock)
    }

    fn release_all(&self, ctx: &mut AcquireCtx) {
        self.inner.release_all(ctx);
    }

    fn backoff(&self, ctx: &mut AcquireCtx) {
        self.backoffs.fetch_add(1, Ordering::Relaxed);
        self.inner.backoff(ctx);
    }

    fn is_locked(&self, lock: ModesetLockId) -> bool {
        self.inner.is_locked(lock)
    }
}

/// Fence that is signaled by the first wait.
#[derive(Debug, Default)]
pub struct TestFence {
    signaled: AtomicBool,
    waits: AtomicU32,
}

impl TestFence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn waits(&self) -> u32 {
        self.waits.load(Ordering::Relaxed)
    }
}

impl Fence for TestFence {
    fn wait(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
        self.signaled.store(true, Ordering::Relaxed);
    }

    fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Display harness
// ---------------------------------------------------------------------------

/// `XR24` fourcc
const FORMAT_XRGB8888: u32 = 0x3432_5258;

/// A display device built from mocks.
///
/// Crtc `i` owns primary plane `i`. Encoder `i` sits behind bridge `i`, and
/// connector `i` routes to encoder `i` unless told otherwise.
pub struct DisplayHarness {
    pub dev: DrmDevice,
    pub log: Arc<CallLog>,
    pub vblank: Arc<FakeVblank>,
    pub locks: Arc<FakeLockDomain>,
    pub crtcs: Vec<CrtcId>,
    pub planes: Vec<PlaneId>,
    pub encoders: Vec<EncoderId>,
    pub connectors: Vec<ConnectorId>,
    pub crtc_funcs: Vec<Arc<MockCrtcFuncs>>,
    pub encoder_funcs: Vec<Arc<MockEncoderFuncs>>,
    pub bridge_funcs: Vec<Arc<MockBridgeFuncs>>,
    pub connector_funcs: Vec<Arc<MockConnectorFuncs>>,
    pub plane_funcs: Vec<Arc<MockPlaneFuncs>>,
}

impl DisplayHarness {
    pub fn new(n_crtcs: usize, n_encoders: usize, n_connectors: usize) -> Self {
        let log = Arc::new(CallLog::default());
        let vblank = Arc::new(FakeVblank::new());
        let locks = Arc::new(FakeLockDomain::new());
        let mut dev = DrmDevice::new(locks.clone(), vblank.clone());
        let config = &mut dev.mode_config;

        let mut harness_planes = Vec::new();
        let mut crtcs = Vec::new();
        let mut crtc_funcs = Vec::new();
        let mut plane_funcs = Vec::new();
        for i in 0..n_crtcs as u32 {
            let plane_helper = Arc::new(MockPlaneFuncs {
                index: i,
                log: log.clone(),
                fail_check: AtomicBool::new(false),
                fail_prepare: AtomicBool::new(false),
                properties: PropertyFilter::default(),
            });
            let plane = config.add_plane(PlaneType::Primary, plane_helper.clone());

            let crtc_helper = Arc::new(MockCrtcFuncs {
                index: i,
                log: log.clone(),
                properties: PropertyFilter::default(),
            });
            let name = format!("crtc-{}", i);
            crtcs.push(config.add_crtc(&name, Some(plane), crtc_helper.clone()));

            harness_planes.push(plane);
            plane_funcs.push(plane_helper);
            crtc_funcs.push(crtc_helper);
        }

        let mut encoders = Vec::new();
        let mut encoder_funcs = Vec::new();
        let mut bridge_funcs = Vec::new();
        for i in 0..n_encoders as u32 {
            let helper = Arc::new(MockEncoderFuncs {
                index: i,
                log: log.clone(),
                reject: AtomicBool::new(false),
            });
            let bridge = Arc::new(MockBridgeFuncs {
                index: i,
                log: log.clone(),
            });
            let name = format!("encoder-{}", i);
            encoders.push(config.add_encoder(&name, helper.clone(), Some(bridge.clone())));
            encoder_funcs.push(helper);
            bridge_funcs.push(bridge);
        }

        let mut connectors = Vec::new();
        let mut connector_funcs = Vec::new();
        for i in 0..n_connectors {
            let helper = Arc::new(MockConnectorFuncs {
                index: i as u32,
                log: log.clone(),
                route: Mutex::new(encoders.get(i).copied()),
                properties: PropertyFilter::default(),
            });
            let name = format!("connector-{}", i);
            connectors.push(config.add_connector(&name, helper.clone()));
            connector_funcs.push(helper);
        }

        Self {
            dev,
            log,
            vblank,
            locks,
            crtcs,
            planes: harness_planes,
            encoders,
            connectors,
            crtc_funcs,
            encoder_funcs,
            bridge_funcs,
            connector_funcs,
            plane_funcs,
        }
    }

    /// 1920x1080@60
    pub fn mode() -> DisplayMode {
        DisplayMode::new(1920, 1080, 60)
    }

    pub fn fb(id: u32) -> Arc<Framebuffer> {
        Arc::new(Framebuffer {
            id,
            width: 1920,
            height: 1080,
            pitch: 1920 * 4,
            format: FORMAT_XRGB8888,
        })
    }

    /// Commit crtc `crtc` driving `connectors` through the legacy path.
    pub fn light_up(&mut self, crtc: usize, connectors: &[usize]) -> GfxResult<()> {
        let set = ModeSet {
            crtc: self.crtcs[crtc],
            mode: Some(Self::mode()),
            fb: Some(Self::fb(crtc as u32 + 1)),
            x: 0,
            y: 0,
            connectors: connectors.iter().map(|&i| self.connectors[i]).collect(),
        };
        legacy::set_config(&mut self.dev, &set)
    }

    /// Stage crtc `crtc` scanning out a fresh framebuffer to `connectors`.
    pub fn stage_output(&self, state: &mut AtomicState, crtc: usize, connectors: &[usize]) -> GfxResult<()> {
        let config = &self.dev.mode_config;
        let crtc_id = self.crtcs[crtc];
        let mode = Self::mode();

        let crtc_state = state.get_crtc_state(config, crtc_id)?;
        crtc_state.enable = true;
        crtc_state.mode = mode;

        for &i in connectors {
            state.set_crtc_for_connector(config, self.connectors[i], Some(crtc_id))?;
        }

        let plane = self.planes[crtc];
        state.set_crtc_for_plane(config, plane, Some(crtc_id))?;
        state.set_fb_for_plane(config, plane, Some(Self::fb(crtc as u32 + 1)))?;
        let (w, h) = (u32::from(mode.hdisplay), u32::from(mode.vdisplay));
        let plane_state = state.get_plane_state(config, plane)?;
        plane_state.crtc_w = w;
        plane_state.crtc_h = h;
        plane_state.src_w = fixed16(w);
        plane_state.src_h = fixed16(h);
        Ok(())
    }
}

