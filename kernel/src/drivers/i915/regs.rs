//! MMIO register offsets and command encodings used by the GTT code
//!
//! Offsets are relative to the start of the GPU's register BAR. Per-engine
//! registers take the engine's ring base (see [`super::switch::EngineId`]).

// ---------------------------------------------------------------------------
// Engine ring bases
// ---------------------------------------------------------------------------

/// Render ring base
pub const RENDER_RING_BASE: u32 = 0x02000;
/// Video decode ring base (gen6+)
pub const GEN6_BSD_RING_BASE: u32 = 0x12000;
/// Second video decode ring base (gen8)
pub const GEN8_BSD2_RING_BASE: u32 = 0x1c000;
/// Video enhancement ring base
pub const VEBOX_RING_BASE: u32 = 0x1a000;
/// Blitter ring base
pub const BLT_RING_BASE: u32 = 0x22000;

// ---------------------------------------------------------------------------
// PPGTT directory registers
// ---------------------------------------------------------------------------

pub const fn ring_pp_dir_base(ring_base: u32) -> u32 {
    ring_base + 0x228
}

pub const fn ring_pp_dir_dclv(ring_base: u32) -> u32 {
    ring_base + 0x220
}

/// Directory cacheline valid mask covering the full 2GiB.
pub const PP_DIR_DCLV_2G: u32 = 0xffff_ffff;

pub const fn gen8_ring_pdp_udw(ring_base: u32, n: u32) -> u32 {
    ring_base + 0x270 + n * 8 + 4
}

pub const fn gen8_ring_pdp_ldw(ring_base: u32, n: u32) -> u32 {
    ring_base + 0x270 + n * 8
}

pub const fn ring_mode_gen7(ring_base: u32) -> u32 {
    ring_base + 0x29c
}

pub const GFX_MODE: u32 = 0x2520;
pub const GFX_PPGTT_ENABLE: u32 = 1 << 9;

/// Masked register write: the high half selects which low bits change.
pub const fn masked_bit_enable(bits: u32) -> u32 {
    (bits << 16) | bits
}

// ---------------------------------------------------------------------------
// PPGTT enable / ECO bits
// ---------------------------------------------------------------------------

pub const GAC_ECO_BITS: u32 = 0x14090;
pub const ECOBITS_SNB_BIT: u32 = 1 << 13;
pub const ECOBITS_PPGTT_CACHE64B: u32 = 3 << 8;

pub const GAB_CTL: u32 = 0x24000;
pub const GAB_CTL_CONT_AFTER_PAGEFAULT: u32 = 1 << 8;

pub const GAM_ECOCHK: u32 = 0x4090;
pub const ECOCHK_SNB_BIT: u32 = 1 << 10;
pub const ECOCHK_PPGTT_CACHE64B: u32 = 0x3 << 3;
pub const ECOCHK_PPGTT_WB_HSW: u32 = 0x3 << 3;
pub const ECOCHK_PPGTT_LLC_IVB: u32 = 0x1 << 3;
pub const ECOCHK_PPGTT_GFDT_IVB: u32 = 0x1 << 4;
pub const ECOCHK_PPGTT_CACHE_MASK: u32 = 0x3 << 3;

// ---------------------------------------------------------------------------
// Faults and flushing
// ---------------------------------------------------------------------------

pub const fn ring_fault_reg(engine_index: u32) -> u32 {
    0x4094 + 0x100 * engine_index
}

pub const RING_FAULT_VALID: u32 = 1 << 0;
pub const RING_FAULT_GTTSEL_MASK: u32 = 1 << 11;

pub const fn ring_fault_srcid(val: u32) -> u32 {
    (val >> 3) & 0xff
}

pub const fn ring_fault_fault_type(val: u32) -> u32 {
    (val >> 1) & 0x3
}

/// GGTT TLB invalidate
pub const GFX_FLSH_CNTL_GEN6: u32 = 0x101008;
pub const GFX_FLSH_CNTL_EN: u32 = 1 << 0;

/// Private PAT (gen8), two consecutive dwords
pub const GEN8_PRIVATE_PAT: u32 = 0x40e0;

// ---------------------------------------------------------------------------
// PCI config space: GMCH graphics control word
// ---------------------------------------------------------------------------

pub const SNB_GMCH_CTRL: u32 = 0x50;
pub const SNB_GMCH_GGMS_SHIFT: u16 = 8;
pub const SNB_GMCH_GGMS_MASK: u16 = 0x3;
pub const SNB_GMCH_GMS_SHIFT: u16 = 3;
pub const SNB_GMCH_GMS_MASK: u16 = 0x1f;
pub const BDW_GMCH_GGMS_SHIFT: u16 = 6;
pub const BDW_GMCH_GGMS_MASK: u16 = 0x3;
pub const BDW_GMCH_GMS_SHIFT: u16 = 8;
pub const BDW_GMCH_GMS_MASK: u16 = 0xff;

// ---------------------------------------------------------------------------
// Command streamer
// ---------------------------------------------------------------------------

const fn mi_instr(opcode: u32, flags: u32) -> u32 {
    (opcode << 23) | flags
}

pub const MI_NOOP: u32 = mi_instr(0, 0);

/// Load `count` register/value pairs.
pub const fn mi_load_register_imm(count: u32) -> u32 {
    mi_instr(0x22, 2 * count - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_relative_registers() {
        assert_eq!(ring_pp_dir_base(RENDER_RING_BASE), 0x2228);
        assert_eq!(ring_pp_dir_dclv(BLT_RING_BASE), 0x22220);
        assert_eq!(gen8_ring_pdp_ldw(RENDER_RING_BASE, 3), 0x2288);
        assert_eq!(gen8_ring_pdp_udw(RENDER_RING_BASE, 3), 0x228c);
        assert_eq!(mi_load_register_imm(2), 0x1100_0003);
        assert_eq!(masked_bit_enable(GFX_PPGTT_ENABLE), 0x0200_0200);
    }
}
