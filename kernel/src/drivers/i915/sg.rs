//! Scatter-gather tables and the DMA mapping service
//!
//! A buffer object's backing store is a list of physically contiguous
//! segments. Before the GPU can see it, every segment is given a bus address
//! by the platform's [`DmaMapper`]; the page tables are then filled one 4KiB
//! page at a time from [`SgTable::dma_pages`].

use alloc::vec::Vec;

use super::{
    page::{DmaAddr, Page},
    PAGE_SIZE,
};
use crate::error::GfxResult;

// ---------------------------------------------------------------------------
// Scatter-Gather Table
// ---------------------------------------------------------------------------

/// A single physically contiguous segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    /// Physical address of the segment.
    pub phys_addr: u64,
    /// Length in bytes, a multiple of the page size.
    pub length: u64,
    /// Bus address once mapped.
    pub dma_addr: Option<DmaAddr>,
}

/// Scatter-gather table describing a buffer object's pages.
#[derive(Debug, Clone, Default)]
pub struct SgTable {
    /// Entries in the table.
    pub entries: Vec<SgEntry>,
    /// Total byte length across all entries.
    pub total_length: u64,
}

impl SgTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a physical segment.
    pub fn add_entry(&mut self, phys_addr: u64, length: u64) {
        self.entries.push(SgEntry {
            phys_addr,
            length,
            dma_addr: None,
        });
        self.total_length += length;
    }

    /// Number of segments.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of 4KiB pages covered.
    pub fn page_count(&self) -> u64 {
        self.total_length / PAGE_SIZE
    }

    pub fn is_mapped(&self) -> bool {
        !self.entries.is_empty() && self.entries.iter().all(|e| e.dma_addr.is_some())
    }

    /// Bus address of every page, in order. Unmapped segments are skipped.
    pub fn dma_pages(&self) -> impl Iterator<Item = DmaAddr> + '_ {
        self.entries.iter().flat_map(|e| {
            let pages = match e.dma_addr {
                Some(_) => e.length / PAGE_SIZE,
                None => 0,
            };
            let base = e.dma_addr.unwrap_or(0);
            (0..pages).map(move |i| base + i * PAGE_SIZE)
        })
    }
}

// ---------------------------------------------------------------------------
// DMA mapping service
// ---------------------------------------------------------------------------

/// Bus address translation provided by the platform (IOMMU or identity).
pub trait DmaMapper: Send + Sync {
    /// Map one page bidirectionally.
    fn map_page(&self, page: &Page) -> GfxResult<DmaAddr>;

    fn unmap_page(&self, addr: DmaAddr);

    /// Map every segment of `sg`, filling in `dma_addr`. On failure nothing
    /// stays mapped.
    fn map_sg(&self, sg: &mut SgTable) -> GfxResult<()>;

    fn unmap_sg(&self, sg: &mut SgTable);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dma_pages_walks_segments() {
        let mut sg = SgTable::new();
        sg.add_entry(0x10_0000, 2 * PAGE_SIZE);
        sg.add_entry(0x40_0000, PAGE_SIZE);
        assert_eq!(sg.entry_count(), 2);
        assert_eq!(sg.page_count(), 3);
        assert!(!sg.is_mapped());
        assert_eq!(sg.dma_pages().count(), 0);

        sg.entries[0].dma_addr = Some(0x8000_0000);
        sg.entries[1].dma_addr = Some(0x9000_0000);
        assert!(sg.is_mapped());
        let pages: Vec<_> = sg.dma_pages().collect();
        assert_eq!(pages, [0x8000_0000, 0x8000_1000, 0x9000_0000]);
    }
}
