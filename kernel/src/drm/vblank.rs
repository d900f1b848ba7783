//! Vertical blank accounting

use super::object::CrtcId;
use crate::error::GfxResult;

/// How long a commit waits for the next vblank before moving on.
pub const VBLANK_TIMEOUT_MS: u32 = 50;

/// Per-crtc vblank interrupt bookkeeping provided by the driver.
pub trait VblankService: Send + Sync {
    /// Take a reference, enabling the interrupt if needed. Fails when the
    /// crtc's vblank is off.
    fn get(&self, crtc: CrtcId) -> GfxResult<()>;

    fn put(&self, crtc: CrtcId);

    /// Vblanks seen so far.
    fn count(&self, crtc: CrtcId) -> u32;

    /// Sleep until the counter differs from `last` or `timeout_ms` passes.
    /// Returns whether the counter moved.
    fn wait_for_change(&self, crtc: CrtcId, last: u32, timeout_ms: u32) -> bool;
}
