//! Per-process GTTs
//!
//! [`HwPpgtt`] wraps whichever page table layout the generation uses. An
//! aliasing PPGTT mirrors the global GTT for engines that always translate
//! through a PPGTT; full PPGTTs are private to a context and shared through
//! `Arc<spin::Mutex<HwPpgtt>>`.

use alloc::boxed::Box;
#[cfg(feature = "ppgtt-dump")]
use core::fmt;
use core::ops::{Deref, DerefMut};

use super::{
    address_space::AddressSpace,
    gen6::Gen6Ppgtt,
    gen8::Gen8Ppgtt,
    ggtt::Ggtt,
    gtt::GttServices,
    range::RangeNode,
    switch::Engine,
    DeviceInfo,
};
use crate::error::GfxResult;

/// Operations every PPGTT layout adds on top of [`AddressSpace`].
pub trait Ppgtt: AddressSpace + Send {
    /// Point `engine` at this address space.
    fn switch_mm(&self, engine: &mut dyn Engine) -> GfxResult<()>;

    /// Rewrite directory entries that live in the global GTT.
    fn write_pdes(&self) {}

    /// Give up the directory slot borrowed from the global GTT.
    fn take_pd_node(&mut self) -> Option<RangeNode> {
        None
    }

    #[cfg(feature = "ppgtt-dump")]
    fn dump(&mut self, out: &mut dyn fmt::Write) -> fmt::Result;
}

impl Ppgtt for Gen6Ppgtt {
    fn switch_mm(&self, engine: &mut dyn Engine) -> GfxResult<()> {
        Gen6Ppgtt::switch_mm(self, engine)
    }

    fn write_pdes(&self) {
        Gen6Ppgtt::write_pdes(self)
    }

    fn take_pd_node(&mut self) -> Option<RangeNode> {
        Gen6Ppgtt::take_pd_node(self)
    }

    #[cfg(feature = "ppgtt-dump")]
    fn dump(&mut self, out: &mut dyn fmt::Write) -> fmt::Result {
        Gen6Ppgtt::dump(self, out)
    }
}

impl Ppgtt for Gen8Ppgtt {
    fn switch_mm(&self, engine: &mut dyn Engine) -> GfxResult<()> {
        Gen8Ppgtt::switch_mm(self, engine)
    }

    #[cfg(feature = "ppgtt-dump")]
    fn dump(&mut self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "  VM: gen8, {} directories", self.used_pd())
    }
}

/// A hardware PPGTT of either layout.
pub struct HwPpgtt {
    inner: Box<dyn Ppgtt>,
}

impl HwPpgtt {
    /// Allocate a PPGTT for `info` and set up its range allocator.
    ///
    /// Gen6/7 directories are carved out of `ggtt`; gen8 tables are sized
    /// to match the global GTT.
    pub fn create(ggtt: &mut Ggtt, info: &DeviceInfo, services: &GttServices) -> GfxResult<Self> {
        let mut inner: Box<dyn Ppgtt> = if info.gen < 8 {
            Box::new(Gen6Ppgtt::init(ggtt, info, services)?)
        } else {
            Box::new(Gen8Ppgtt::init(ggtt.total(), ggtt.scratch(), info, services)?)
        };

        let (start, total) = (inner.start(), inner.total());
        inner.mm().init(start, total);
        Ok(Self { inner })
    }

    /// Tear down: return the directory slot to `ggtt` and free the tables.
    pub fn release(mut self, ggtt: &mut Ggtt) {
        if let Some(node) = self.inner.take_pd_node() {
            ggtt.mm().remove_node(&node);
        }
        self.inner.mm().takedown();
        self.inner.cleanup();
    }
}

impl Deref for HwPpgtt {
    type Target = dyn Ppgtt;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl DerefMut for HwPpgtt {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut()
    }
}

impl Drop for HwPpgtt {
    fn drop(&mut self) {
        if let Some(node) = self.inner.take_pd_node() {
            log::warn!(
                "PPGTT dropped without release, leaking GGTT range {:#x}+{:#x}",
                node.start,
                node.size
            );
        }
        self.inner.cleanup();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
