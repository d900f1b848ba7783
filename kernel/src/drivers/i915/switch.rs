//! Pointing the hardware at a PPGTT
//!
//! Gen6 loads the directory base registers over MMIO, gen7 emits register
//! loads into the engine's command ring, and gen8 loads up to four page
//! directory pointers. Enabling PPGTT mode itself is a handful of ECO and
//! mode bits that differ per generation.

use bitflags::bitflags;

use super::{ggtt::GttMmio, page::DmaAddr, regs, DeviceInfo};
use crate::error::{GfxError, GfxResult};

// ---------------------------------------------------------------------------
// Engines
// ---------------------------------------------------------------------------

/// Hardware command streamers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EngineId {
    /// Render
    Rcs,
    /// Video decode
    Vcs,
    /// Blitter
    Bcs,
    /// Video enhancement
    Vecs,
    /// Second video decode (gen8)
    Vcs2,
}

impl EngineId {
    /// Index used by per-engine register banks such as the fault registers.
    pub fn index(self) -> u32 {
        match self {
            Self::Rcs => 0,
            Self::Vcs => 1,
            Self::Bcs => 2,
            Self::Vecs => 3,
            Self::Vcs2 => 4,
        }
    }

    pub fn mmio_base(self) -> u32 {
        match self {
            Self::Rcs => regs::RENDER_RING_BASE,
            Self::Vcs => regs::GEN6_BSD_RING_BASE,
            Self::Bcs => regs::BLT_RING_BASE,
            Self::Vecs => regs::VEBOX_RING_BASE,
            Self::Vcs2 => regs::GEN8_BSD2_RING_BASE,
        }
    }
}

bitflags! {
    /// GPU cache domains for flush/invalidate requests
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GpuDomains: u32 {
        const CPU = 1 << 0;
        const RENDER = 1 << 1;
        const SAMPLER = 1 << 2;
        const COMMAND = 1 << 3;
        const INSTRUCTION = 1 << 4;
        const VERTEX = 1 << 5;
        const GTT = 1 << 6;
        /// Every domain the GPU itself caches
        const GPU = Self::RENDER.bits()
            | Self::SAMPLER.bits()
            | Self::COMMAND.bits()
            | Self::INSTRUCTION.bits()
            | Self::VERTEX.bits();
    }
}

/// A command ring the driver can emit into.
pub trait Engine {
    fn id(&self) -> EngineId;

    fn mmio_base(&self) -> u32 {
        self.id().mmio_base()
    }

    /// Flush and invalidate GPU caches and TLBs.
    fn flush(&mut self, invalidate: GpuDomains, flush: GpuDomains) -> GfxResult<()>;

    /// Reserve space for `dwords` commands.
    fn begin(&mut self, dwords: usize) -> GfxResult<()>;

    fn emit(&mut self, dword: u32);

    /// Publish everything emitted since [`Engine::begin`].
    fn advance(&mut self);
}

// ---------------------------------------------------------------------------
// Gen6/Gen7 directory switch
// ---------------------------------------------------------------------------

/// How a gen6-style PPGTT is loaded into an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gen6Switch {
    /// Direct MMIO writes
    Gen6,
    /// Ring LRI, plus an extra TLB flush on non-render engines
    Gen7,
    /// Ring LRI
    Hsw,
}

impl Gen6Switch {
    pub fn for_device(info: &DeviceInfo) -> GfxResult<Self> {
        match info.gen {
            6 => Ok(Self::Gen6),
            7 if info.is_haswell() => Ok(Self::Hsw),
            7 => Ok(Self::Gen7),
            _ => Err(GfxError::OperationNotSupported {
                operation: "gen6 PPGTT on this generation",
            }),
        }
    }

    /// Point `engine` at the directory whose GSM byte offset is `pd_offset`.
    pub fn switch_mm(
        self,
        mmio: &dyn GttMmio,
        engine: &mut dyn Engine,
        pd_offset: u32,
    ) -> GfxResult<()> {
        let base = engine.mmio_base();
        let dir = get_pd_offset(pd_offset)?;

        match self {
            Self::Gen6 => {
                mmio.write_reg(regs::ring_pp_dir_dclv(base), regs::PP_DIR_DCLV_2G);
                mmio.write_reg(regs::ring_pp_dir_base(base), dir);
                mmio.posting_read(regs::ring_pp_dir_dclv(base));
            }
            Self::Gen7 | Self::Hsw => {
                // TLBs must be flushed and invalidated before a switch
                engine.flush(GpuDomains::GPU, GpuDomains::GPU)?;
                emit_dir_load(engine, base, dir)?;

                // only the render ring invalidates its TLBs by itself
                if self == Self::Gen7 && engine.id() != EngineId::Rcs {
                    engine.flush(GpuDomains::GPU, GpuDomains::GPU)?;
                }
            }
        }
        Ok(())
    }
}

fn emit_dir_load(engine: &mut dyn Engine, base: u32, dir: u32) -> GfxResult<()> {
    engine.begin(6)?;
    engine.emit(regs::mi_load_register_imm(2));
    engine.emit(regs::ring_pp_dir_dclv(base));
    engine.emit(regs::PP_DIR_DCLV_2G);
    engine.emit(regs::ring_pp_dir_base(base));
    engine.emit(dir);
    engine.emit(regs::MI_NOOP);
    engine.advance();
    Ok(())
}

/// Value for `PP_DIR_BASE`: the directory's cacheline index in the upper half.
pub fn get_pd_offset(pd_offset: u32) -> GfxResult<u32> {
    if pd_offset & 0x3f != 0 {
        return Err(GfxError::InvalidArgument {
            name: "pd_offset",
            value: "not cacheline aligned",
        });
    }
    Ok((pd_offset / 64) << 16)
}

// ---------------------------------------------------------------------------
// Gen8 directory pointers
// ---------------------------------------------------------------------------

/// Number of PDP registers per engine.
pub const GEN8_LEGACY_PDPS: usize = 4;

/// Load directory pointer `entry` with `addr`.
pub fn gen8_write_pdp(engine: &mut dyn Engine, entry: usize, addr: DmaAddr) -> GfxResult<()> {
    if entry >= GEN8_LEGACY_PDPS {
        return Err(GfxError::InvalidArgument {
            name: "pdp entry",
            value: "only four directory pointers exist",
        });
    }
    let base = engine.mmio_base();
    let entry = entry as u32;

    engine.begin(6)?;
    engine.emit(regs::mi_load_register_imm(1));
    engine.emit(regs::gen8_ring_pdp_udw(base, entry));
    engine.emit((addr >> 32) as u32);
    engine.emit(regs::mi_load_register_imm(1));
    engine.emit(regs::gen8_ring_pdp_ldw(base, entry));
    engine.emit(addr as u32);
    engine.advance();
    Ok(())
}

/// Load every used directory pointer, highest first.
pub fn gen8_mm_switch(engine: &mut dyn Engine, pd_dma_addr: &[DmaAddr]) -> GfxResult<()> {
    for (i, &addr) in pd_dma_addr.iter().enumerate().rev() {
        gen8_write_pdp(engine, i, addr)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Enabling PPGTT mode
// ---------------------------------------------------------------------------

/// Turn on PPGTT translation for the device and each of `engines`.
pub fn ppgtt_enable(info: &DeviceInfo, mmio: &dyn GttMmio, engines: &[EngineId]) {
    match info.gen {
        6 => {
            let ecobits = mmio.read_reg(regs::GAC_ECO_BITS);
            mmio.write_reg(
                regs::GAC_ECO_BITS,
                ecobits | regs::ECOBITS_SNB_BIT | regs::ECOBITS_PPGTT_CACHE64B,
            );

            let gab_ctl = mmio.read_reg(regs::GAB_CTL);
            mmio.write_reg(regs::GAB_CTL, gab_ctl | regs::GAB_CTL_CONT_AFTER_PAGEFAULT);

            let ecochk = mmio.read_reg(regs::GAM_ECOCHK);
            mmio.write_reg(
                regs::GAM_ECOCHK,
                ecochk | regs::ECOCHK_SNB_BIT | regs::ECOCHK_PPGTT_CACHE64B,
            );

            mmio.write_reg(regs::GFX_MODE, regs::masked_bit_enable(regs::GFX_PPGTT_ENABLE));
        }
        7 => {
            let ecobits = mmio.read_reg(regs::GAC_ECO_BITS);
            mmio.write_reg(regs::GAC_ECO_BITS, ecobits | regs::ECOBITS_PPGTT_CACHE64B);

            let mut ecochk = mmio.read_reg(regs::GAM_ECOCHK);
            if info.is_haswell() {
                ecochk |= regs::ECOCHK_PPGTT_WB_HSW;
            } else {
                ecochk |= regs::ECOCHK_PPGTT_LLC_IVB;
                ecochk &= !regs::ECOCHK_PPGTT_GFDT_IVB;
            }
            mmio.write_reg(regs::GAM_ECOCHK, ecochk);

            // GFX_MODE is per-ring from gen7 on
            enable_per_ring(mmio, engines);
        }
        gen if gen >= 8 => enable_per_ring(mmio, engines),
        gen => log::warn!("PPGTT enable requested on gen{}", gen),
    }
}

fn enable_per_ring(mmio: &dyn GttMmio, engines: &[EngineId]) {
    for engine in engines {
        mmio.write_reg(
            regs::ring_mode_gen7(engine.mmio_base()),
            regs::masked_bit_enable(regs::GFX_PPGTT_ENABLE),
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        drivers::i915::device_ids,
        testing::{FakeEngine, MemoryGttMmio, RegWrite},
    };

    #[test]
    fn test_pd_offset_encoding() {
        assert_eq!(get_pd_offset(0x1000).unwrap(), (0x1000 / 64) << 16);
        assert!(get_pd_offset(0x1004).is_err());
    }

    #[test]
    fn test_gen6_switch_uses_mmio() {
        let mmio = MemoryGttMmio::new(16);
        let mut engine = FakeEngine::new(EngineId::Bcs);
        Gen6Switch::Gen6.switch_mm(&mmio, &mut engine, 0x40).unwrap();

        assert!(engine.emitted().is_empty());
        assert_eq!(
            mmio.reg_writes(),
            [
                RegWrite::new(regs::ring_pp_dir_dclv(regs::BLT_RING_BASE), regs::PP_DIR_DCLV_2G),
                RegWrite::new(regs::ring_pp_dir_base(regs::BLT_RING_BASE), 1 << 16),
            ]
        );
    }

    #[test]
    fn test_gen7_switch_flushes_non_render_rings_twice() {
        let mmio = MemoryGttMmio::new(16);
        let mut vcs = FakeEngine::new(EngineId::Vcs);
        Gen6Switch::Gen7.switch_mm(&mmio, &mut vcs, 0x80).unwrap();
        assert_eq!(vcs.flushes(), 2);
        assert_eq!(
            vcs.emitted(),
            [
                regs::mi_load_register_imm(2),
                regs::ring_pp_dir_dclv(regs::GEN6_BSD_RING_BASE),
                regs::PP_DIR_DCLV_2G,
                regs::ring_pp_dir_base(regs::GEN6_BSD_RING_BASE),
                2 << 16,
                regs::MI_NOOP,
            ]
        );

        let mut rcs = FakeEngine::new(EngineId::Rcs);
        Gen6Switch::Gen7.switch_mm(&mmio, &mut rcs, 0x80).unwrap();
        assert_eq!(rcs.flushes(), 1);

        let mut hsw_vcs = FakeEngine::new(EngineId::Vcs);
        Gen6Switch::Hsw.switch_mm(&mmio, &mut hsw_vcs, 0x80).unwrap();
        assert_eq!(hsw_vcs.flushes(), 1);
    }

    #[test]
    fn test_gen8_switch_loads_pdps_top_down() {
        let mut rcs = FakeEngine::new(EngineId::Rcs);
        gen8_mm_switch(&mut rcs, &[0x1_0000_1000, 0x2000]).unwrap();
        let base = regs::RENDER_RING_BASE;
        assert_eq!(
            rcs.emitted(),
            [
                regs::mi_load_register_imm(1),
                regs::gen8_ring_pdp_udw(base, 1),
                0,
                regs::mi_load_register_imm(1),
                regs::gen8_ring_pdp_ldw(base, 1),
                0x2000,
                regs::mi_load_register_imm(1),
                regs::gen8_ring_pdp_udw(base, 0),
                1,
                regs::mi_load_register_imm(1),
                regs::gen8_ring_pdp_ldw(base, 0),
                0x1000,
            ]
        );
        assert!(gen8_write_pdp(&mut rcs, 4, 0).is_err());
    }

    #[test]
    fn test_ring_failure_propagates() {
        let mmio = MemoryGttMmio::new(16);
        let mut rcs = FakeEngine::new(EngineId::Rcs);
        rcs.fail_begin(true);
        assert!(Gen6Switch::Hsw.switch_mm(&mmio, &mut rcs, 0x40).is_err());
    }

    #[test]
    fn test_gen7_enable_sets_per_ring_mode() {
        let ivb = DeviceInfo::from_device_id(device_ids::IVYBRIDGE_GT2, 0).unwrap();
        let mmio = MemoryGttMmio::new(16);
        mmio.set_reg(regs::GAM_ECOCHK, regs::ECOCHK_PPGTT_GFDT_IVB);
        ppgtt_enable(&ivb, &mmio, &[EngineId::Rcs, EngineId::Bcs]);

        assert_eq!(
            mmio.reg(regs::GAM_ECOCHK),
            regs::ECOCHK_PPGTT_LLC_IVB
        );
        let mode = regs::masked_bit_enable(regs::GFX_PPGTT_ENABLE);
        assert_eq!(mmio.reg(regs::ring_mode_gen7(regs::RENDER_RING_BASE)), mode);
        assert_eq!(mmio.reg(regs::ring_mode_gen7(regs::BLT_RING_BASE)), mode);
        assert_eq!(mmio.reg(regs::GFX_MODE), 0);
    }

    #[test]
    fn test_gen6_enable_sets_global_mode() {
        let snb = DeviceInfo::from_device_id(device_ids::SANDYBRIDGE_GT2, 0).unwrap();
        let mmio = MemoryGttMmio::new(16);
        ppgtt_enable(&snb, &mmio, &[EngineId::Rcs]);
        assert_eq!(
            mmio.reg(regs::GAC_ECO_BITS),
            regs::ECOBITS_SNB_BIT | regs::ECOBITS_PPGTT_CACHE64B
        );
        assert_eq!(mmio.reg(regs::GAB_CTL), regs::GAB_CTL_CONT_AFTER_PAGEFAULT);
        assert_eq!(
            mmio.reg(regs::GFX_MODE),
            regs::masked_bit_enable(regs::GFX_PPGTT_ENABLE)
        );
    }
}
