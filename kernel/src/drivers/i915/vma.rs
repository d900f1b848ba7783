//! Buffer objects and their address space bindings
//!
//! A [`GemObject`] can be mapped into several address spaces at once; each
//! mapping is a [`Vma`] owned by the object. The global GTT mapping, when
//! present, is always first in the list so display and fence code find it
//! without a search.

use alloc::{sync::Arc, vec::Vec};

use spin::Mutex;

use super::{ppgtt::HwPpgtt, pte::CacheLevel, range::RangeNode, sg::SgTable, DeviceInfo};

/// Address space a VMA lives in.
#[derive(Clone)]
pub enum VmRef {
    Ggtt,
    /// Keeps the PPGTT alive for as long as the VMA exists.
    Ppgtt(Arc<Mutex<HwPpgtt>>),
}

impl VmRef {
    pub fn is_ggtt(&self) -> bool {
        matches!(self, Self::Ggtt)
    }

    /// Same address space, not merely the same kind.
    pub fn same_vm(&self, other: &VmRef) -> bool {
        match (self, other) {
            (Self::Ggtt, Self::Ggtt) => true,
            (Self::Ppgtt(a), Self::Ppgtt(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl core::fmt::Debug for VmRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Ggtt => write!(f, "Ggtt"),
            Self::Ppgtt(ppgtt) => write!(f, "Ppgtt({:p})", Arc::as_ptr(ppgtt)),
        }
    }
}

/// How PTEs get written for a VMA, fixed when the VMA is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStrategy {
    /// gen6+ global GTT, possibly mirrored into the aliasing PPGTT
    Ggtt,
    /// Full PPGTT
    Ppgtt,
    /// gen2-gen5 chipset GTT
    Gmch,
}

impl BindStrategy {
    fn select(info: &DeviceInfo, vm: &VmRef) -> Self {
        match vm {
            VmRef::Ppgtt(_) => Self::Ppgtt,
            VmRef::Ggtt if info.gen < 6 => Self::Gmch,
            VmRef::Ggtt => Self::Ggtt,
        }
    }
}

/// One object's mapping in one address space.
#[derive(Debug)]
pub struct Vma {
    pub vm: VmRef,
    /// Range reserved in the address space, if any.
    pub node: Option<RangeNode>,
    pub strategy: BindStrategy,
}

impl Vma {
    pub fn is_bound(&self) -> bool {
        self.node.is_some()
    }
}

/// A GPU buffer object as far as the GTT code cares.
#[derive(Debug)]
pub struct GemObject {
    /// Size in bytes, a multiple of the page size.
    pub size: u64,
    pub pages: SgTable,
    pub cache_level: CacheLevel,
    /// Map read-only on hardware that supports it.
    pub gt_ro: bool,
    pub has_global_gtt_mapping: bool,
    pub has_aliasing_ppgtt_mapping: bool,
    /// Pages are DMA-mapped by their owner (e.g. imported dma-bufs).
    pub has_dma_mapping: bool,
    vmas: Vec<Vma>,
}

impl GemObject {
    pub fn new(pages: SgTable, cache_level: CacheLevel) -> Self {
        Self {
            size: pages.total_length,
            pages,
            cache_level,
            gt_ro: false,
            has_global_gtt_mapping: false,
            has_aliasing_ppgtt_mapping: false,
            has_dma_mapping: false,
            vmas: Vec::new(),
        }
    }

    pub fn vmas(&self) -> &[Vma] {
        &self.vmas
    }

    pub fn vma(&self, vm: &VmRef) -> Option<&Vma> {
        self.vmas.iter().find(|v| v.vm.same_vm(vm))
    }

    pub fn vma_mut(&mut self, vm: &VmRef) -> Option<&mut Vma> {
        self.vmas.iter_mut().find(|v| v.vm.same_vm(vm))
    }

    /// The global GTT mapping, if any.
    pub fn ggtt_vma(&self) -> Option<&Vma> {
        self.vmas.first().filter(|v| v.vm.is_ggtt())
    }

    pub fn is_bound(&self) -> bool {
        self.vmas.iter().any(Vma::is_bound)
    }

    /// Existing VMA for `vm`, or a fresh unbound one.
    pub fn lookup_or_create_vma(&mut self, info: &DeviceInfo, vm: &VmRef) -> &mut Vma {
        let idx = match self.vmas.iter().position(|v| v.vm.same_vm(vm)) {
            Some(idx) => idx,
            None => self.create_vma(info, vm),
        };
        &mut self.vmas[idx]
    }

    fn create_vma(&mut self, info: &DeviceInfo, vm: &VmRef) -> usize {
        let vma = Vma {
            vm: vm.clone(),
            node: None,
            strategy: BindStrategy::select(info, vm),
        };
        if vm.is_ggtt() {
            self.vmas.insert(0, vma);
            0
        } else {
            self.vmas.push(vma);
            self.vmas.len() - 1
        }
    }

    /// Drop the VMA for `vm`. Returns its node so the caller can release the
    /// range.
    pub(crate) fn remove_vma(&mut self, vm: &VmRef) -> Option<Vma> {
        let idx = self.vmas.iter().position(|v| v.vm.same_vm(vm))?;
        Some(self.vmas.remove(idx))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::i915::{device_ids, PAGE_SIZE};

    fn object() -> GemObject {
        let mut sg = SgTable::new();
        sg.add_entry(0x20_0000, 2 * PAGE_SIZE);
        GemObject::new(sg, CacheLevel::None)
    }

    #[test]
    fn test_lookup_reuses_existing_vma() {
        let snb = DeviceInfo::from_device_id(device_ids::SANDYBRIDGE_GT2, 0).unwrap();
        let mut obj = object();
        assert_eq!(obj.size, 2 * PAGE_SIZE);

        obj.lookup_or_create_vma(&snb, &VmRef::Ggtt).node = Some(RangeNode {
            start: 0,
            size: 2 * PAGE_SIZE,
            color: 0,
        });
        let vma = obj.lookup_or_create_vma(&snb, &VmRef::Ggtt);
        assert!(vma.is_bound());
        assert_eq!(vma.strategy, BindStrategy::Ggtt);
        assert_eq!(obj.vmas().len(), 1);
        assert!(obj.ggtt_vma().is_some());

        assert!(obj.remove_vma(&VmRef::Ggtt).is_some());
        assert!(obj.ggtt_vma().is_none());
        assert!(!obj.is_bound());
    }

    #[test]
    fn test_pre_gen6_uses_chipset_strategy() {
        let ilk = DeviceInfo::from_device_id(device_ids::IRONLAKE_M, 0).unwrap();
        let mut obj = object();
        assert_eq!(
            obj.lookup_or_create_vma(&ilk, &VmRef::Ggtt).strategy,
            BindStrategy::Gmch
        );
    }
}
