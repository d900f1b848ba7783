//! The operations every GPU address space supports
//!
//! The global GTT and every PPGTT implement [`AddressSpace`]; which
//! generation's page table format sits behind it is decided once, when the
//! space is created.

use super::{
    page::{DmaAddr, Page},
    pte::{BindFlags, CacheLevel},
    range::RangeManager,
    sg::SgTable,
};
use crate::error::GfxResult;

/// Global or per-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmKind {
    Ggtt,
    Ppgtt,
}

/// Page every unused entry points at, so stray GPU accesses hit harmless
/// memory instead of faulting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScratchPage {
    pub addr: DmaAddr,
}

/// Backing page of the scratch entry, owned by the global GTT.
#[derive(Debug)]
pub struct ScratchStorage {
    pub page: Page,
    pub scratch: ScratchPage,
}

/// A GPU virtual address space.
pub trait AddressSpace {
    fn kind(&self) -> VmKind;

    /// First usable address.
    fn start(&self) -> u64;

    /// Size in bytes.
    fn total(&self) -> u64;

    fn scratch(&self) -> ScratchPage;

    /// Allocator for the space's virtual addresses.
    fn mm(&mut self) -> &mut RangeManager;

    /// Point `[start, start + length)` at the scratch page. With
    /// `use_scratch` false the entries are written invalid instead.
    fn clear_range(&mut self, start: u64, length: u64, use_scratch: bool);

    /// Map every page of `pages` starting at `start`.
    fn insert_entries(&mut self, pages: &SgTable, start: u64, level: CacheLevel, flags: BindFlags);

    /// Release page-table storage and DMA mappings.
    fn cleanup(&mut self);
}

/// Frees GGTT space by unbinding idle objects.
pub trait Evictor: Send + Sync {
    /// Make room for a `size` byte node with `alignment` somewhere in
    /// `[start, end)` of `mm`.
    fn evict_something(
        &self,
        mm: &mut RangeManager,
        size: u64,
        alignment: u64,
        level: CacheLevel,
        start: u64,
        end: u64,
    ) -> GfxResult<()>;
}
