//! Page table entry encoders
//!
//! Each hardware generation packs a DMA address, a cache policy and a valid
//! bit into a GTT entry differently. The encoders here are pure functions of
//! their inputs; the address spaces pick one at construction time and never
//! look at the generation again.

use core::fmt;

use bitflags::bitflags;

use super::{page::DmaAddr, DeviceInfo};

/// Cache policy of a GPU mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLevel {
    /// Uncached, snooping disabled
    None,
    /// Snooped / cached in the CPU's last level cache
    Llc,
    /// Cached in L3 and LLC (gen7+)
    L3Llc,
    /// Write-through (eLLC capable parts, used for scanout)
    Wt,
}

impl fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "uncached"),
            Self::Llc => write!(f, "snooped or LLC"),
            Self::L3Llc => write!(f, "L3+LLC"),
            Self::Wt => write!(f, "eLLC write-through"),
        }
    }
}

bitflags! {
    /// Flags accompanying a bind request
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BindFlags: u32 {
        /// Also write the global GTT when an aliasing PPGTT is in use.
        const GLOBAL_BIND = 1 << 0;
        /// Map the pages read-only where the hardware supports it.
        const PTE_READ_ONLY = 1 << 1;
    }
}

// ---------------------------------------------------------------------------
// Entry bit layouts
// ---------------------------------------------------------------------------

pub const GEN6_PTE_VALID: u32 = 1 << 0;
pub const GEN6_PTE_UNCACHED: u32 = 1 << 1;
pub const GEN6_PTE_CACHE_LLC: u32 = 2 << 1;
pub const GEN7_PTE_CACHE_L3_LLC: u32 = 3 << 1;
pub const GEN6_PDE_VALID: u32 = 1 << 0;

pub const BYT_PTE_WRITEABLE: u32 = 1 << 1;
pub const BYT_PTE_SNOOPED_BY_CPU_CACHES: u32 = 1 << 2;

const fn hsw_cacheability_control(bits: u32) -> u32 {
    ((bits & 0x7) << 1) | ((bits & 0x8) << (11 - 3))
}

pub const HSW_WB_LLC_AGE3: u32 = hsw_cacheability_control(0x2);
pub const HSW_WB_ELLC_LLC_AGE3: u32 = hsw_cacheability_control(0x8);
pub const HSW_WT_ELLC_LLC_AGE3: u32 = hsw_cacheability_control(0x7);

const PAGE_PRESENT: u64 = 1 << 0;
const PAGE_RW: u64 = 1 << 1;
const PAGE_PWT: u64 = 1 << 3;
const PAGE_PCD: u64 = 1 << 4;
const PAGE_PAT: u64 = 1 << 7;

pub const PPAT_UNCACHED_INDEX: u64 = PAGE_PWT | PAGE_PCD;
pub const PPAT_CACHED_PDE_INDEX: u64 = 0;
pub const PPAT_CACHED_INDEX: u64 = PAGE_PAT;
pub const PPAT_DISPLAY_ELLC_INDEX: u64 = PAGE_PCD;

/// Address bits 39:32 fold into entry bits 11:4 on gen6 style entries.
pub const fn gen6_addr_encode(addr: DmaAddr) -> u32 {
    ((addr & 0xffff_f000) | ((addr >> 28) & 0xff0)) as u32
}

/// Haswell only has room for address bits 38:32.
pub const fn hsw_addr_encode(addr: DmaAddr) -> u32 {
    ((addr & 0xffff_f000) | ((addr >> 28) & 0x7f0)) as u32
}

/// Page directory entry of a gen6/gen7 PPGTT.
pub const fn gen6_pde_encode(addr: DmaAddr) -> u32 {
    gen6_addr_encode(addr) | GEN6_PDE_VALID
}

/// Page directory entry of a gen8 PPGTT.
pub const fn gen8_pde_encode(addr: DmaAddr, level: CacheLevel) -> u64 {
    let pde = PAGE_PRESENT | PAGE_RW | addr;
    match level {
        CacheLevel::None => pde | PPAT_UNCACHED_INDEX,
        _ => pde | PPAT_CACHED_PDE_INDEX,
    }
}

// ---------------------------------------------------------------------------
// Encoders
// ---------------------------------------------------------------------------

/// Per-generation PTE layout.
pub trait PteEncoder: Send + Sync {
    /// Short name for logs and dumps
    fn name(&self) -> &'static str;

    /// Width of one entry in bytes (4 for gen6 style, 8 for gen8)
    fn entry_size(&self) -> usize;

    /// Encode one entry. Gen6 style encoders only use the low 32 bits.
    fn encode(&self, addr: DmaAddr, level: CacheLevel, valid: bool, flags: BindFlags) -> u64;
}

fn unhandled_level(encoder: &str, level: CacheLevel) -> u32 {
    log::warn!(
        "{} PTE: unhandled cache level {}, mapping uncached",
        encoder,
        level
    );
    GEN6_PTE_UNCACHED
}

fn valid_bit(valid: bool) -> u32 {
    if valid {
        GEN6_PTE_VALID
    } else {
        0
    }
}

/// Sandy Bridge
#[derive(Debug, Clone, Copy)]
pub struct SnbPte;

impl PteEncoder for SnbPte {
    fn name(&self) -> &'static str {
        "snb"
    }

    fn entry_size(&self) -> usize {
        4
    }

    fn encode(&self, addr: DmaAddr, level: CacheLevel, valid: bool, _flags: BindFlags) -> u64 {
        let mut pte = valid_bit(valid) | gen6_addr_encode(addr);
        pte |= match level {
            CacheLevel::L3Llc | CacheLevel::Llc => GEN6_PTE_CACHE_LLC,
            CacheLevel::None => GEN6_PTE_UNCACHED,
            CacheLevel::Wt => unhandled_level(self.name(), level),
        };
        pte as u64
    }
}

/// Ivy Bridge
#[derive(Debug, Clone, Copy)]
pub struct IvbPte;

impl PteEncoder for IvbPte {
    fn name(&self) -> &'static str {
        "ivb"
    }

    fn entry_size(&self) -> usize {
        4
    }

    fn encode(&self, addr: DmaAddr, level: CacheLevel, valid: bool, _flags: BindFlags) -> u64 {
        let mut pte = valid_bit(valid) | gen6_addr_encode(addr);
        pte |= match level {
            CacheLevel::L3Llc => GEN7_PTE_CACHE_L3_LLC,
            CacheLevel::Llc => GEN6_PTE_CACHE_LLC,
            CacheLevel::None => GEN6_PTE_UNCACHED,
            CacheLevel::Wt => unhandled_level(self.name(), level),
        };
        pte as u64
    }
}

/// Valleyview (Bay Trail). The only gen7 part with a writeable bit.
#[derive(Debug, Clone, Copy)]
pub struct BytPte;

impl PteEncoder for BytPte {
    fn name(&self) -> &'static str {
        "byt"
    }

    fn entry_size(&self) -> usize {
        4
    }

    fn encode(&self, addr: DmaAddr, level: CacheLevel, valid: bool, flags: BindFlags) -> u64 {
        let mut pte = valid_bit(valid) | gen6_addr_encode(addr);

        // Other platforms have no read-only bit, so writeable is the norm.
        if !flags.contains(BindFlags::PTE_READ_ONLY) {
            pte |= BYT_PTE_WRITEABLE;
        }
        if level != CacheLevel::None {
            pte |= BYT_PTE_SNOOPED_BY_CPU_CACHES;
        }
        pte as u64
    }
}

/// Haswell without eLLC
#[derive(Debug, Clone, Copy)]
pub struct HswPte;

impl PteEncoder for HswPte {
    fn name(&self) -> &'static str {
        "hsw"
    }

    fn entry_size(&self) -> usize {
        4
    }

    fn encode(&self, addr: DmaAddr, level: CacheLevel, valid: bool, _flags: BindFlags) -> u64 {
        let mut pte = valid_bit(valid) | hsw_addr_encode(addr);
        if level != CacheLevel::None {
            pte |= HSW_WB_LLC_AGE3;
        }
        pte as u64
    }
}

/// Haswell with eLLC (Iris Pro)
#[derive(Debug, Clone, Copy)]
pub struct IrisPte;

impl PteEncoder for IrisPte {
    fn name(&self) -> &'static str {
        "iris"
    }

    fn entry_size(&self) -> usize {
        4
    }

    fn encode(&self, addr: DmaAddr, level: CacheLevel, valid: bool, _flags: BindFlags) -> u64 {
        let mut pte = valid_bit(valid) | hsw_addr_encode(addr);
        pte |= match level {
            CacheLevel::None => 0,
            CacheLevel::Wt => HSW_WT_ELLC_LLC_AGE3,
            _ => HSW_WB_ELLC_LLC_AGE3,
        };
        pte as u64
    }
}

/// Broadwell and later: x86-like entries with a private PAT index.
#[derive(Debug, Clone, Copy)]
pub struct Gen8Pte;

impl PteEncoder for Gen8Pte {
    fn name(&self) -> &'static str {
        "gen8"
    }

    fn entry_size(&self) -> usize {
        8
    }

    fn encode(&self, addr: DmaAddr, level: CacheLevel, valid: bool, _flags: BindFlags) -> u64 {
        let mut pte = if valid { PAGE_PRESENT | PAGE_RW } else { 0 };
        pte |= addr;
        pte |= match level {
            CacheLevel::None => PPAT_UNCACHED_INDEX,
            CacheLevel::Wt => PPAT_DISPLAY_ELLC_INDEX,
            _ => PPAT_CACHED_INDEX,
        };
        pte
    }
}

/// Pick the encoder for a gen6/gen7 device.
pub fn gen6_encoder_for(info: &DeviceInfo) -> &'static dyn PteEncoder {
    if info.is_haswell() && info.ellc_size > 0 {
        &IrisPte
    } else if info.is_haswell() {
        &HswPte
    } else if info.is_valleyview() {
        &BytPte
    } else if info.gen >= 7 {
        &IvbPte
    } else {
        &SnbPte
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
