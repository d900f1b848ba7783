//! GPU address space scenarios
//!
//! Exercises the GTT code through the in-memory platform doubles: binding
//! life cycles on the global GTT, suspend and resume, table boundaries in
//! both page table layouts, and the chipset path of old parts.

use proptest::prelude::*;
use veridian_gfx::{
    drivers::i915::{
        address_space::{AddressSpace, ScratchPage},
        device_ids,
        gen6::{Gen6Ppgtt, GEN6_PTES_PER_PT},
        gen8::{Gen8Ppgtt, GEN8_PTES_PER_PAGE},
        ggtt::{Ggtt, GttMmio, AGP_USER_MEMORY},
        gtt::{I915Gtt, I915Params},
        pte::{BindFlags, CacheLevel},
        sg::{DmaMapper, SgTable},
        vma::VmRef,
        DeviceInfo, EngineId, PAGE_SIZE,
    },
    testing::{ChipsetCall, GttHarness},
};

fn info(id: u16) -> DeviceInfo {
    DeviceInfo::from_device_id(id, 0).unwrap()
}

fn ggtt_only() -> I915Params {
    I915Params {
        enable_ppgtt: 0,
        ..Default::default()
    }
}

/// GSM entries backing `[start, start + pages * 4KiB)` of a gen6 GGTT.
fn gsm_entries(harness: &GttHarness, start: u64, pages: u64) -> Vec<u32> {
    let first = start / PAGE_SIZE;
    (first..first + pages).map(|i| harness.mmio.read_gsm32(i)).collect()
}

#[test]
fn test_unbinding_twice_matches_unbinding_once() {
    let harness = GttHarness::new();
    let mut gtt = I915Gtt::init(
        info(device_ids::SANDYBRIDGE_GT2),
        I915Params::default(),
        &GttHarness::gen6_pci(),
        harness.services(),
    )
    .unwrap();

    let mut obj = GttHarness::object(0x10_0000, 2);
    gtt.prepare_object(&mut obj).unwrap();
    let node = gtt.insert_vma_node(&mut obj, &VmRef::Ggtt, 0).unwrap();
    gtt.bind_vma(&mut obj, &VmRef::Ggtt, CacheLevel::Llc, BindFlags::GLOBAL_BIND)
        .unwrap();

    let encoder = gtt.ggtt().pte_encoder().unwrap();
    let live = |addr| encoder.encode(addr, CacheLevel::Llc, true, BindFlags::empty()) as u32;
    assert_eq!(
        gsm_entries(&harness, node.start, 2),
        [live(0x10_0000), live(0x10_1000)]
    );
    assert!(obj.has_global_gtt_mapping);
    assert!(obj.has_aliasing_ppgtt_mapping);

    gtt.unbind_vma(&mut obj, &VmRef::Ggtt);
    let once = gsm_entries(&harness, node.start, 2);
    let writes = harness.mmio.reg_writes().len();

    gtt.unbind_vma(&mut obj, &VmRef::Ggtt);
    assert_eq!(gsm_entries(&harness, node.start, 2), once);
    assert_eq!(harness.mmio.reg_writes().len(), writes);

    let scratch = encoder.encode(gtt.ggtt().scratch().addr, CacheLevel::Llc, true, BindFlags::empty()) as u32;
    assert_eq!(once, [scratch, scratch]);
    assert!(!obj.has_global_gtt_mapping);
    assert!(!obj.has_aliasing_ppgtt_mapping);

    gtt.destroy_vma(&mut obj, &VmRef::Ggtt);
    assert!(obj.vmas().is_empty());
    gtt.finish_object(&mut obj);
    assert!(!obj.pages.is_mapped());
}

#[test]
fn test_resume_restores_bound_objects_over_scratch() {
    let harness = GttHarness::new();
    let mut gtt = I915Gtt::init(
        info(device_ids::SANDYBRIDGE_GT2),
        ggtt_only(),
        &GttHarness::gen6_pci(),
        harness.services(),
    )
    .unwrap();

    let mut obj = GttHarness::object(0x20_0000, 3);
    gtt.prepare_object(&mut obj).unwrap();
    let node = gtt.insert_vma_node(&mut obj, &VmRef::Ggtt, 0).unwrap();
    let level = obj.cache_level;
    gtt.bind_vma(&mut obj, &VmRef::Ggtt, level, BindFlags::GLOBAL_BIND)
        .unwrap();
    let bound = gsm_entries(&harness, node.start, 3);

    let encoder = gtt.ggtt().pte_encoder().unwrap();
    let scratch = encoder.encode(gtt.ggtt().scratch().addr, CacheLevel::Llc, true, BindFlags::empty()) as u32;

    let engines = [EngineId::Rcs, EngineId::Bcs];
    gtt.suspend_mappings(&engines);
    assert_eq!(gsm_entries(&harness, node.start, 3), [scratch; 3]);

    gtt.restore_mappings(&engines, core::slice::from_mut(&mut obj));
    assert_eq!(gsm_entries(&harness, node.start, 3), bound);
    assert!(obj.has_global_gtt_mapping);
    // space around the object stays on scratch
    assert_eq!(gsm_entries(&harness, node.end(), 1), [scratch]);
}

#[test]
fn test_gen6_insert_straddles_two_tables() {
    let harness = GttHarness::new();
    let vlv = DeviceInfo::from_device_id(device_ids::VALLEYVIEW, 0xb).unwrap();
    let mut ggtt = Ggtt::probe(&vlv, &GttHarness::gen6_pci(), &harness.services()).unwrap();
    let total = ggtt.total();
    ggtt.mm().init(0, total - PAGE_SIZE);
    let mut ppgtt = Gen6Ppgtt::init(&mut ggtt, &vlv, &harness.services()).unwrap();

    let mut sg = SgTable::new();
    sg.add_entry(0x300_0000, 4 * PAGE_SIZE);
    harness.dma.map_sg(&mut sg).unwrap();

    // two pages at the tail of table 7, two at the head of table 8
    let start = (8 * GEN6_PTES_PER_PT as u64 - 2) * PAGE_SIZE;
    harness.mem.reset_counters();
    ppgtt.insert_entries(&sg, start, CacheLevel::Llc, BindFlags::empty());
    assert_eq!(harness.mem.kmaps(), 2);
    // gen6 tables are never clflushed, not even without an LLC
    assert_eq!(harness.mem.flushes(), 0);

    let encoder = ggtt.pte_encoder().unwrap();
    let encode = |addr| encoder.encode(addr, CacheLevel::Llc, true, BindFlags::empty()) as u32;
    let tail = GEN6_PTES_PER_PT - 1;
    assert_eq!(ppgtt.page_table(7).unwrap().entry_u32(tail - 1), encode(0x300_0000));
    assert_eq!(ppgtt.page_table(7).unwrap().entry_u32(tail), encode(0x300_1000));
    assert_eq!(ppgtt.page_table(8).unwrap().entry_u32(0), encode(0x300_2000));
    assert_eq!(ppgtt.page_table(8).unwrap().entry_u32(1), encode(0x300_3000));

    ppgtt.clear_range(start, 4 * PAGE_SIZE, true);
    let scratch = encode(ggtt.scratch().addr);
    for (pde, pte) in [(7, tail - 1), (7, tail), (8, 0), (8, 1)] {
        assert_eq!(ppgtt.page_table(pde).unwrap().entry_u32(pte), scratch);
    }
}

#[test]
fn test_chipset_gtt_bind_and_unbind() {
    let harness = GttHarness::new();
    let mut gtt = I915Gtt::init(
        info(device_ids::I945G),
        I915Params::default(),
        &GttHarness::gen6_pci(),
        harness.services(),
    )
    .unwrap();
    assert!(!gtt.uses_ppgtt());

    let mut obj = GttHarness::object(0x40_0000, 2);
    let node = gtt.insert_vma_node(&mut obj, &VmRef::Ggtt, 0).unwrap();
    let before = harness.chipset.calls().len();
    gtt.bind_vma(&mut obj, &VmRef::Ggtt, CacheLevel::None, BindFlags::empty())
        .unwrap();
    gtt.unbind_vma(&mut obj, &VmRef::Ggtt);
    gtt.unbind_vma(&mut obj, &VmRef::Ggtt);

    let first_entry = node.start / PAGE_SIZE;
    let clear = ChipsetCall::Clear {
        first_entry,
        num_entries: 2,
    };
    assert_eq!(
        harness.chipset.calls()[before..],
        [
            ChipsetCall::Insert {
                first_entry,
                pages: 2,
                flags: AGP_USER_MEMORY,
            },
            clear,
            clear,
        ]
    );
    assert!(!obj.has_global_gtt_mapping);
}

// ---------------------------------------------------------------------------
// Boundary splitting
// ---------------------------------------------------------------------------

const SCRATCH: ScratchPage = ScratchPage { addr: 0x7000 };
const TABLES: usize = 5;
const PHYS_BASE: u64 = 0x1000_0000;

fn gen8_space(harness: &GttHarness) -> Gen8Ppgtt {
    let bdw = info(device_ids::BROADWELL_M_GT2);
    Gen8Ppgtt::init(1 << 30, SCRATCH, &bdw, &harness.services()).unwrap()
}

fn mapped_sg(harness: &GttHarness, phys: u64, pages: u64) -> SgTable {
    let mut sg = SgTable::new();
    sg.add_entry(phys, pages * PAGE_SIZE);
    harness.dma.map_sg(&mut sg).unwrap();
    sg
}

fn tables(ppgtt: &Gen8Ppgtt) -> Vec<u64> {
    (0..TABLES)
        .flat_map(|pde| {
            let table = ppgtt.page_table(0, pde).unwrap();
            (0..GEN8_PTES_PER_PAGE).map(move |pte| table.entry_u64(pte))
        })
        .collect()
}

/// Where a range starting at page `first` with `pages` pages is split: at
/// the first table boundary inside it, or halfway when it fits one table.
fn split_point(first: u64, pages: u64) -> u64 {
    let per_table = GEN8_PTES_PER_PAGE as u64;
    let boundary = (first / per_table + 1) * per_table;
    if boundary < first + pages {
        boundary - first
    } else {
        pages.div_ceil(2)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_split_at_boundary_matches_single_call(
        first in 0u64..(3 * GEN8_PTES_PER_PAGE as u64),
        pages in 1u64..(GEN8_PTES_PER_PAGE as u64 + 64),
        clear_valid in any::<bool>(),
    ) {
        let whole_harness = GttHarness::new();
        let split_harness = GttHarness::new();
        let mut whole = gen8_space(&whole_harness);
        let mut split = gen8_space(&split_harness);

        let start = first * PAGE_SIZE;
        let at = split_point(first, pages);

        let sg = mapped_sg(&whole_harness, PHYS_BASE, pages);
        whole.insert_entries(&sg, start, CacheLevel::Llc, BindFlags::empty());

        let head = mapped_sg(&split_harness, PHYS_BASE, at);
        split.insert_entries(&head, start, CacheLevel::Llc, BindFlags::empty());
        if pages > at {
            let tail = mapped_sg(&split_harness, PHYS_BASE + at * PAGE_SIZE, pages - at);
            split.insert_entries(&tail, start + at * PAGE_SIZE, CacheLevel::Llc, BindFlags::empty());
        }
        prop_assert_eq!(tables(&whole), tables(&split));

        whole.clear_range(start, pages * PAGE_SIZE, clear_valid);
        split.clear_range(start, at * PAGE_SIZE, clear_valid);
        split.clear_range(start + at * PAGE_SIZE, (pages - at) * PAGE_SIZE, clear_valid);
        prop_assert_eq!(tables(&whole), tables(&split));
    }
}
