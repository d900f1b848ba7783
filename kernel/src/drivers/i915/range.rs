//! GPU virtual address range allocator
//!
//! Every address space hands out non-overlapping, aligned ranges of its
//! virtual addresses to buffer objects and page directories. Nodes are kept
//! sorted by start address; holes are whatever lies between them.
//!
//! On hardware without a shared LLC neighbouring nodes of different cache
//! "colours" must be separated by a guard page, because the GPU prefetches
//! across page boundaries.

use alloc::vec::Vec;

use super::PAGE_SIZE;
use crate::error::{GfxError, GfxResult};

/// An allocated range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeNode {
    pub start: u64,
    pub size: u64,
    /// Cache colour of the mapping, see [`RangeManager::set_color_adjust`].
    pub color: u64,
}

impl RangeNode {
    pub fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// Where in a hole a new node goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Lowest fitting address
    BottomUp,
    /// Highest fitting address
    TopDown,
}

/// Free space between two nodes (or a node and the range edge).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hole {
    start: u64,
    end: u64,
    prev_color: Option<u64>,
    next_color: Option<u64>,
}

/// Sorted-list range allocator.
#[derive(Debug, Default)]
pub struct RangeManager {
    start: u64,
    size: u64,
    nodes: Vec<RangeNode>,
    color_adjust: bool,
    initialized: bool,
}

const NO_SPACE: GfxError = GfxError::ResourceExhausted {
    resource: "GTT address space",
};

impl RangeManager {
    pub const fn new() -> Self {
        Self {
            start: 0,
            size: 0,
            nodes: Vec::new(),
            color_adjust: false,
            initialized: false,
        }
    }

    /// Manage `[start, start + size)`.
    pub fn init(&mut self, start: u64, size: u64) {
        self.start = start;
        self.size = size;
        self.nodes.clear();
        self.initialized = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Forget the range. Nodes still allocated at this point are leaked by
    /// their owners.
    pub fn takedown(&mut self) {
        if !self.nodes.is_empty() {
            log::warn!(
                "range allocator torn down with {} nodes still allocated",
                self.nodes.len()
            );
        }
        self.nodes.clear();
        self.initialized = false;
    }

    /// Keep a guard page between nodes of different colours.
    pub fn set_color_adjust(&mut self, enabled: bool) {
        self.color_adjust = enabled;
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    pub fn nodes(&self) -> &[RangeNode] {
        &self.nodes
    }

    /// Claim exactly `node`'s range, e.g. for memory the firmware already
    /// placed.
    pub fn reserve_node(&mut self, node: RangeNode) -> GfxResult<()> {
        if node.size == 0 || node.start < self.start || node.end() > self.end() {
            return Err(NO_SPACE);
        }
        let idx = self.nodes.partition_point(|n| n.start < node.start);
        let overlaps_prev = idx > 0 && self.nodes[idx - 1].end() > node.start;
        let overlaps_next = idx < self.nodes.len() && self.nodes[idx].start < node.end();
        if overlaps_prev || overlaps_next {
            return Err(NO_SPACE);
        }
        self.nodes.insert(idx, node);
        Ok(())
    }

    /// Allocate `size` bytes anywhere in the managed range.
    pub fn insert_node(&mut self, size: u64, alignment: u64, color: u64) -> GfxResult<RangeNode> {
        let (start, end) = (self.start, self.end());
        self.insert_node_in_range(size, alignment, color, start, end, Placement::BottomUp)
    }

    /// Allocate `size` bytes aligned to `alignment` inside
    /// `[range_start, range_end)`.
    pub fn insert_node_in_range(
        &mut self,
        size: u64,
        alignment: u64,
        color: u64,
        range_start: u64,
        range_end: u64,
        placement: Placement,
    ) -> GfxResult<RangeNode> {
        if size == 0 {
            return Err(GfxError::InvalidArgument {
                name: "size",
                value: "zero-sized range node",
            });
        }
        let alignment = alignment.max(1);
        let holes = self.holes_with_colors();

        let fit = |hole: &Hole| -> Option<u64> {
            let mut adj_start = hole.start.max(range_start);
            let mut adj_end = hole.end.min(range_end);
            if self.color_adjust {
                if hole.prev_color.is_some_and(|c| c != color) {
                    adj_start += PAGE_SIZE;
                }
                if hole.next_color.is_some_and(|c| c != color) {
                    adj_end = adj_end.saturating_sub(PAGE_SIZE);
                }
            }
            if adj_end <= adj_start || adj_end - adj_start < size {
                return None;
            }
            match placement {
                Placement::BottomUp => {
                    let start = adj_start.div_ceil(alignment) * alignment;
                    (start + size <= adj_end).then_some(start)
                }
                Placement::TopDown => {
                    let start = (adj_end - size) / alignment * alignment;
                    (start >= adj_start).then_some(start)
                }
            }
        };

        let found = match placement {
            Placement::BottomUp => holes.iter().find_map(fit),
            Placement::TopDown => holes.iter().rev().find_map(fit),
        };

        let start = found.ok_or(NO_SPACE)?;
        let node = RangeNode { start, size, color };
        let idx = self.nodes.partition_point(|n| n.start < start);
        self.nodes.insert(idx, node);
        Ok(node)
    }

    /// Release `node`. Returns whether it was allocated.
    pub fn remove_node(&mut self, node: &RangeNode) -> bool {
        match self.nodes.iter().position(|n| n == node) {
            Some(idx) => {
                self.nodes.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Unallocated `(start, end)` ranges, ascending.
    pub fn holes(&self) -> Vec<(u64, u64)> {
        self.holes_with_colors()
            .into_iter()
            .map(|h| (h.start, h.end))
            .collect()
    }

    fn holes_with_colors(&self) -> Vec<Hole> {
        let mut holes = Vec::new();
        let mut prev_end = self.start;
        let mut prev_color = None;
        for node in &self.nodes {
            if node.start > prev_end {
                holes.push(Hole {
                    start: prev_end,
                    end: node.start,
                    prev_color,
                    next_color: Some(node.color),
                });
            }
            prev_end = node.end();
            prev_color = Some(node.color);
        }
        if prev_end < self.end() {
            holes.push(Hole {
                start: prev_end,
                end: self.end(),
                prev_color,
                next_color: None,
            });
        }
        holes
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_bottom_up_and_top_down() {
        let mut mm = RangeManager::new();
        mm.init(0, 64 * PAGE_SIZE);

        let low = mm.insert_node(PAGE_SIZE, PAGE_SIZE, 0).unwrap();
        assert_eq!(low.start, 0);

        let high = mm
            .insert_node_in_range(
                4 * PAGE_SIZE,
                16 * PAGE_SIZE,
                0,
                0,
                64 * PAGE_SIZE,
                Placement::TopDown,
            )
            .unwrap();
        assert_eq!(high.start, 48 * PAGE_SIZE);

        assert_eq!(
            mm.holes(),
            [(PAGE_SIZE, 48 * PAGE_SIZE), (52 * PAGE_SIZE, 64 * PAGE_SIZE)]
        );
        assert!(mm.remove_node(&high));
        assert!(!mm.remove_node(&high));
        assert_eq!(mm.holes(), [(PAGE_SIZE, 64 * PAGE_SIZE)]);
    }

    #[test]
    fn test_exhaustion() {
        let mut mm = RangeManager::new();
        mm.init(0, 2 * PAGE_SIZE);
        mm.insert_node(2 * PAGE_SIZE, PAGE_SIZE, 0).unwrap();
        assert!(matches!(
            mm.insert_node(PAGE_SIZE, PAGE_SIZE, 0),
            Err(GfxError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn test_reserve_rejects_overlap() {
        let mut mm = RangeManager::new();
        mm.init(0, 16 * PAGE_SIZE);
        let node = RangeNode {
            start: 4 * PAGE_SIZE,
            size: 2 * PAGE_SIZE,
            color: 0,
        };
        mm.reserve_node(node).unwrap();
        let clash = RangeNode {
            start: 5 * PAGE_SIZE,
            ..node
        };
        assert!(mm.reserve_node(clash).is_err());
        let outside = RangeNode {
            start: 15 * PAGE_SIZE,
            ..node
        };
        assert!(mm.reserve_node(outside).is_err());
    }

    #[test]
    fn test_color_guard_pages() {
        let mut mm = RangeManager::new();
        mm.init(0, 16 * PAGE_SIZE);
        mm.set_color_adjust(true);

        let a = mm.insert_node(PAGE_SIZE, PAGE_SIZE, 0).unwrap();
        assert_eq!(a.start, 0);
        // different colour: one guard page after `a`
        let b = mm.insert_node(PAGE_SIZE, PAGE_SIZE, 1).unwrap();
        assert_eq!(b.start, 2 * PAGE_SIZE);
        // same colour as `b`: packed right behind it
        let c = mm.insert_node(PAGE_SIZE, PAGE_SIZE, 1).unwrap();
        assert_eq!(c.start, 3 * PAGE_SIZE);
    }

    #[test]
    fn test_color_adjust_only_next_to_nodes() {
        let mut mm = RangeManager::new();
        mm.init(0, 16 * PAGE_SIZE);
        mm.set_color_adjust(true);

        // nothing sits before the start of the range
        let a = mm.insert_node(PAGE_SIZE, PAGE_SIZE, 3).unwrap();
        assert_eq!(a.start, 0);

        let top = mm
            .insert_node_in_range(PAGE_SIZE, PAGE_SIZE, 5, 0, 16 * PAGE_SIZE, Placement::TopDown)
            .unwrap();
        assert_eq!(top.end(), 16 * PAGE_SIZE);
    }

    proptest! {
        #[test]
        fn prop_nodes_never_overlap(
            sizes in proptest::collection::vec((1u64..8, 0u8..4, any::<bool>()), 1..40)
        ) {
            let mut mm = RangeManager::new();
            mm.init(0, 128 * PAGE_SIZE);
            for (pages, align_shift, top_down) in sizes {
                let placement = if top_down { Placement::TopDown } else { Placement::BottomUp };
                let align = PAGE_SIZE << align_shift;
                if let Ok(node) = mm.insert_node_in_range(
                    pages * PAGE_SIZE, align, 0, 0, 128 * PAGE_SIZE, placement,
                ) {
                    prop_assert_eq!(node.start % align, 0);
                }
            }
            for pair in mm.nodes().windows(2) {
                prop_assert!(pair[0].end() <= pair[1].start);
            }
        }
    }
}
