//! Page-table storage pages
//!
//! Page directories and page tables live in ordinary 4KiB pages handed out
//! by a [`PageAllocator`]. Entries are little-endian words inside those
//! pages; nothing outside a page holds entry values. CPU access goes through
//! [`crate::raii::KmapAtomic`].

use alloc::{boxed::Box, vec, vec::Vec};

use super::{PAGE_SHIFT, PAGE_SIZE};

/// Bus address of a page as seen by the GPU.
pub type DmaAddr = u64;

/// One 4KiB page of memory.
pub struct Page {
    pfn: u64,
    data: Box<[u8]>,
}

impl Page {
    /// A zero-filled page backing physical frame `pfn`.
    pub fn new(pfn: u64) -> Self {
        Self {
            pfn,
            data: vec![0u8; PAGE_SIZE as usize].into_boxed_slice(),
        }
    }

    pub fn pfn(&self) -> u64 {
        self.pfn
    }

    /// Physical address of the first byte.
    pub fn phys_addr(&self) -> u64 {
        self.pfn << PAGE_SHIFT
    }

    /// Read the `index`th 32-bit entry.
    pub fn entry_u32(&self, index: usize) -> u32 {
        let off = index * 4;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.data[off..off + 4]);
        u32::from_le_bytes(raw)
    }

    /// Read the `index`th 64-bit entry.
    pub fn entry_u64(&self, index: usize) -> u64 {
        let off = index * 8;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.data[off..off + 8]);
        u64::from_le_bytes(raw)
    }

    pub(crate) fn set_entry_u32(&mut self, index: usize, val: u32) {
        let off = index * 4;
        self.data[off..off + 4].copy_from_slice(&val.to_le_bytes());
    }

    pub(crate) fn set_entry_u64(&mut self, index: usize, val: u64) {
        let off = index * 8;
        self.data[off..off + 8].copy_from_slice(&val.to_le_bytes());
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Page").field("pfn", &self.pfn).finish()
    }
}

/// Source of page-table pages and the CPU-side operations on them.
pub trait PageAllocator: Send + Sync {
    /// One zeroed page, or `None` when memory is exhausted.
    fn alloc_page(&self) -> Option<Page>;

    /// `1 << order` physically contiguous zeroed pages.
    fn alloc_pages(&self, order: u32) -> Option<Vec<Page>>;

    fn free_page(&self, page: Page);

    /// Start a short-lived CPU mapping of `page`.
    fn kmap(&self, _page: &Page) {}

    /// End the mapping started by [`PageAllocator::kmap`].
    fn kunmap(&self, _page: &Page) {}

    /// Write back the CPU cache lines covering `page`.
    fn clflush(&self, _page: &Page) {}
}

/// Smallest order such that `1 << order` pages cover `size` bytes.
pub fn get_order(size: u64) -> u32 {
    let pages = size.div_ceil(PAGE_SIZE).max(1);
    pages.next_power_of_two().trailing_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_are_little_endian() {
        let mut page = Page::new(7);
        page.set_entry_u32(1, 0x1122_3344);
        assert_eq!(&page.as_bytes()[4..8], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(page.entry_u32(1), 0x1122_3344);

        page.set_entry_u64(2, 0x0102_0304_0506_0708);
        assert_eq!(page.entry_u64(2), 0x0102_0304_0506_0708);
        assert_eq!(page.phys_addr(), 7 * 4096);
    }

    #[test]
    fn test_get_order() {
        assert_eq!(get_order(1), 0);
        assert_eq!(get_order(PAGE_SIZE), 0);
        assert_eq!(get_order(2 * PAGE_SIZE), 1);
        assert_eq!(get_order(3 * PAGE_SIZE), 2);
        assert_eq!(get_order(4 * PAGE_SIZE), 2);
    }
}
