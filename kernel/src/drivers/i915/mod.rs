//! Intel i915 GPU address translation
//!
//! Device classification plus the global GTT and per-process PPGTT page
//! table machinery for gen2 through gen9 integrated graphics. Register
//! access, DMA mapping and page allocation are supplied by the platform
//! through the traits in [`page`], [`sg`], [`ggtt`] and [`switch`].

pub mod address_space;
pub mod gen6;
pub mod gen8;
pub mod ggtt;
pub mod gtt;
pub mod page;
pub mod ppgtt;
pub mod pte;
pub mod range;
pub mod regs;
pub mod sg;
pub mod switch;
pub mod vma;

use core::fmt;

pub use address_space::{AddressSpace, ScratchPage, VmKind};
pub use ggtt::{Ggtt, PciGttConfig};
pub use gtt::{GttServices, I915Gtt, I915Params};
pub use page::{DmaAddr, Page, PageAllocator};
pub use ppgtt::HwPpgtt;
pub use pte::{BindFlags, CacheLevel, PteEncoder};
pub use sg::{DmaMapper, SgTable};
pub use switch::{Engine, EngineId};
pub use vma::{GemObject, Vma, VmRef};

/// Size of a GPU page and of every page-table storage page.
pub const PAGE_SIZE: u64 = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

const MIB: u64 = 1 << 20;

// ---------------------------------------------------------------------------
// PCI Device IDs
// ---------------------------------------------------------------------------

/// Intel GPU PCI device IDs used by the tests and the default probe path
pub mod device_ids {
    /// 945G (gen3 desktop)
    pub const I945G: u16 = 0x2772;
    /// Ironlake mobile (gen5)
    pub const IRONLAKE_M: u16 = 0x0046;
    /// Sandy Bridge GT2 desktop
    pub const SANDYBRIDGE_GT2: u16 = 0x0112;
    /// Sandy Bridge GT2 mobile
    pub const SANDYBRIDGE_M_GT2: u16 = 0x0116;
    /// Ivy Bridge GT2 desktop
    pub const IVYBRIDGE_GT2: u16 = 0x0162;
    /// Valleyview (Bay Trail)
    pub const VALLEYVIEW: u16 = 0x0f31;
    /// Haswell GT2 desktop
    pub const HASWELL_GT2: u16 = 0x0412;
    /// Haswell CRW GT3 (Iris Pro, with eLLC)
    pub const HASWELL_CRW_GT3: u16 = 0x0d22;
    /// Broadwell GT2 mobile
    pub const BROADWELL_M_GT2: u16 = 0x1616;
    /// Cherryview (Braswell)
    pub const CHERRYVIEW: u16 = 0x22b0;
    /// Skylake GT2 mobile
    pub const SKYLAKE_M_GT2: u16 = 0x1916;
}

// ---------------------------------------------------------------------------
// GPU Generation Classification
// ---------------------------------------------------------------------------

/// Platform families that need special casing in the GTT code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// gen2 to gen4 parts driven through the GMCH chipset helper
    Legacy,
    Ironlake,
    SandyBridge,
    IvyBridge,
    Valleyview,
    Haswell,
    Broadwell,
    Cherryview,
    Skylake,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => write!(f, "Legacy"),
            Self::Ironlake => write!(f, "Ironlake"),
            Self::SandyBridge => write!(f, "Sandy Bridge"),
            Self::IvyBridge => write!(f, "Ivy Bridge"),
            Self::Valleyview => write!(f, "Valleyview"),
            Self::Haswell => write!(f, "Haswell"),
            Self::Broadwell => write!(f, "Broadwell"),
            Self::Cherryview => write!(f, "Cherryview"),
            Self::Skylake => write!(f, "Skylake"),
        }
    }
}

/// Static capabilities of one GPU, decided at probe time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: u16,
    pub revision: u8,
    pub gen: u8,
    pub platform: Platform,
    pub is_mobile: bool,
    /// CPU and GPU share the last level cache.
    pub has_llc: bool,
    /// Size of the embedded DRAM cache in MiB (Iris Pro).
    pub ellc_size: u32,
    /// The graphics device sits behind an active VT-d unit.
    pub iommu_gfx_mapped: bool,
}

impl DeviceInfo {
    /// Classify a device from its PCI id.
    ///
    /// Ranges follow the i915 PCI id tables; unknown ids are rejected so the
    /// GTT code never guesses a page table layout.
    pub fn from_device_id(device_id: u16, revision: u8) -> Option<Self> {
        let (gen, platform) = match device_id {
            // i830 / 845G / 855GM / 865G
            0x3577 | 0x2562 | 0x3582 | 0x2572 => (2, Platform::Legacy),
            // 915 / 945 / G33 / Pineview
            0x2582 | 0x258a | 0x2592 | 0x2772 | 0x27a2 | 0x27ae | 0x29b2 | 0x29c2
            | 0x29d2 | 0xa001 | 0xa011 => (3, Platform::Legacy),
            // 965 / G45 / GM45
            0x2972 | 0x2982 | 0x2992 | 0x29a2 | 0x2a02 | 0x2a12 | 0x2a42 | 0x2e02..=0x2e92 => {
                (4, Platform::Legacy)
            }
            0x0042 | 0x0046 => (5, Platform::Ironlake),
            0x0102..=0x0126 => (6, Platform::SandyBridge),
            0x0152..=0x016a => (7, Platform::IvyBridge),
            0x0f30..=0x0f33 => (7, Platform::Valleyview),
            0x0402..=0x042e | 0x0a02..=0x0a2e | 0x0c02..=0x0c2e | 0x0d02..=0x0d2e => (7, Platform::Haswell),
            0x1602..=0x163e => (8, Platform::Broadwell),
            0x22b0..=0x22b3 => (8, Platform::Cherryview),
            0x1902..=0x193d => (9, Platform::Skylake),
            _ => return None,
        };

        let is_mobile = matches!(
            device_id,
            0x2592 | 0x27a2 | 0x27ae | 0x2a02 | 0x2a12 | 0x2a42 | 0x3582 | 0xa011
        ) || matches!(device_id, 0x0046 | 0x0106 | 0x0116 | 0x0126 | 0x0156 | 0x0166)
            || (platform == Platform::Haswell && (device_id & 0x000f) == 0x6)
            || (platform == Platform::Broadwell && (device_id & 0x000f) == 0x6)
            || (platform == Platform::Skylake && (device_id & 0x000f) == 0x6)
            || matches!(platform, Platform::Valleyview | Platform::Cherryview);

        let has_llc = gen >= 6 && !matches!(platform, Platform::Valleyview | Platform::Cherryview);

        // Crystal Well parts carry 128MiB of eDRAM.
        let ellc_size = if (0x0d02..=0x0d2e).contains(&device_id) { 128 } else { 0 };

        Some(Self {
            device_id,
            revision,
            gen,
            platform,
            is_mobile,
            has_llc,
            ellc_size,
            iommu_gfx_mapped: false,
        })
    }

    pub fn is_haswell(&self) -> bool {
        self.platform == Platform::Haswell
    }

    pub fn is_valleyview(&self) -> bool {
        self.platform == Platform::Valleyview
    }

    pub fn is_cherryview(&self) -> bool {
        self.platform == Platform::Cherryview
    }

    pub fn is_broadwell(&self) -> bool {
        self.platform == Platform::Broadwell
    }

    /// The hardware has a per-process address space at all.
    pub fn has_aliasing_ppgtt(&self) -> bool {
        self.gen >= 6
    }

    /// Full per-context PPGTT; gen8 is excluded until its context switch
    /// path is trusted.
    pub fn has_full_ppgtt(&self) -> bool {
        self.gen >= 7 && self.gen != 8
    }
}

/// Size in bytes of one stolen-memory / GGTT granule, handy for probe maths.
pub(crate) const fn mib(n: u64) -> u64 {
    n * MIB
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_generations() {
        let snb = DeviceInfo::from_device_id(device_ids::SANDYBRIDGE_GT2, 0).unwrap();
        assert_eq!(snb.gen, 6);
        assert!(snb.has_llc);
        assert!(!snb.is_mobile);

        let vlv = DeviceInfo::from_device_id(device_ids::VALLEYVIEW, 0).unwrap();
        assert_eq!(vlv.gen, 7);
        assert!(vlv.is_valleyview());
        assert!(!vlv.has_llc);

        let crw = DeviceInfo::from_device_id(device_ids::HASWELL_CRW_GT3, 0).unwrap();
        assert!(crw.is_haswell());
        assert_eq!(crw.ellc_size, 128);

        let bdw = DeviceInfo::from_device_id(device_ids::BROADWELL_M_GT2, 0).unwrap();
        assert_eq!(bdw.gen, 8);
        assert!(bdw.is_mobile);

        let ilk = DeviceInfo::from_device_id(device_ids::IRONLAKE_M, 0).unwrap();
        assert_eq!(ilk.gen, 5);
        assert!(ilk.is_mobile);
        assert!(!ilk.has_aliasing_ppgtt());
    }

    #[test]
    fn test_unknown_device_rejected() {
        assert!(DeviceInfo::from_device_id(0x9a49, 0).is_none());
    }
}
