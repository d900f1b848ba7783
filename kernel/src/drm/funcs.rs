//! Driver callbacks
//!
//! Drivers plug into the helpers by implementing these traits for their
//! crtcs, encoders, bridges, connectors and planes. Every hook except
//! [`ConnectorHelperFuncs::best_encoder`] has a default, so a driver only
//! writes the ones its hardware needs.

use alloc::sync::Arc;

use super::{
    atomic::AtomicState,
    helper,
    mode::{DisplayMode, DpmsMode},
    object::{ConnectorId, CrtcId, DrmDevice, EncoderId, PlaneId, PropertyId},
    state::{ConnectorState, CrtcState, PlaneState},
};
use crate::error::{GfxError, GfxResult};

const NO_PROPERTY: GfxError = GfxError::OperationNotSupported {
    operation: "atomic property",
};

// ---------------------------------------------------------------------------
// Shared objects
// ---------------------------------------------------------------------------

/// Scanout buffer. Planes hold it through `Arc`; dropping the last
/// reference releases it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framebuffer {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub format: u32,
}

/// Completion fence of a pending rendering job.
pub trait Fence: Send + Sync {
    /// Block until signaled.
    fn wait(&self);

    fn is_signaled(&self) -> bool;
}

/// Userspace event delivered when a flip completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEvent {
    pub user_data: u64,
}

// ---------------------------------------------------------------------------
// Per-object hooks
// ---------------------------------------------------------------------------

pub trait CrtcHelperFuncs: Send + Sync {
    /// Adjust `adjusted` for the hardware; `false` rejects the mode.
    fn mode_fixup(&self, _crtc: CrtcId, _mode: &DisplayMode, _adjusted: &mut DisplayMode) -> bool {
        true
    }

    /// Program timings, without touching the framebuffer.
    fn mode_set_nofb(&self, _crtc: CrtcId, _state: &CrtcState) {}

    fn prepare(&self, _crtc: CrtcId) {}

    fn commit(&self, _crtc: CrtcId) {}

    fn disable(&self, crtc: CrtcId) {
        self.dpms(crtc, DpmsMode::Off);
    }

    fn dpms(&self, _crtc: CrtcId, _mode: DpmsMode) {}

    fn atomic_check(&self, _crtc: CrtcId, _state: &CrtcState) -> GfxResult<()> {
        Ok(())
    }

    fn atomic_begin(&self, _crtc: CrtcId) {}

    fn atomic_flush(&self, _crtc: CrtcId) {}

    fn atomic_set_property(
        &self,
        _crtc: CrtcId,
        _state: &mut CrtcState,
        _property: PropertyId,
        _value: u64,
    ) -> GfxResult<()> {
        Err(NO_PROPERTY)
    }
}

pub trait EncoderHelperFuncs: Send + Sync {
    fn mode_fixup(&self, _encoder: EncoderId, _mode: &DisplayMode, _adjusted: &mut DisplayMode) -> bool {
        true
    }

    fn mode_set(&self, _encoder: EncoderId, _mode: &DisplayMode, _adjusted: &DisplayMode) {}

    fn prepare(&self, _encoder: EncoderId) {}

    fn commit(&self, _encoder: EncoderId) {}

    fn disable(&self, encoder: EncoderId) {
        self.dpms(encoder, DpmsMode::Off);
    }

    fn dpms(&self, _encoder: EncoderId, _mode: DpmsMode) {}
}

/// Chip sitting between an encoder and the connector (e.g. a DSI to HDMI
/// converter).
pub trait BridgeFuncs: Send + Sync {
    fn mode_fixup(&self, _mode: &DisplayMode, _adjusted: &mut DisplayMode) -> bool {
        true
    }

    fn mode_set(&self, _mode: &DisplayMode, _adjusted: &DisplayMode) {}

    fn disable(&self) {}

    fn post_disable(&self) {}

    fn pre_enable(&self) {}

    fn enable(&self) {}
}

pub trait ConnectorHelperFuncs: Send + Sync {
    /// Encoder this connector should be driven by, if any can.
    fn best_encoder(&self, connector: ConnectorId) -> Option<EncoderId>;

    fn atomic_set_property(
        &self,
        _connector: ConnectorId,
        _state: &mut ConnectorState,
        _property: PropertyId,
        _value: u64,
    ) -> GfxResult<()> {
        Err(NO_PROPERTY)
    }
}

pub trait PlaneHelperFuncs: Send + Sync {
    /// Pin `fb` for scanout. Runs before the point of no return.
    fn prepare_fb(&self, _plane: PlaneId, _fb: &Arc<Framebuffer>) -> GfxResult<()> {
        Ok(())
    }

    fn cleanup_fb(&self, _plane: PlaneId, _fb: &Arc<Framebuffer>) {}

    fn atomic_check(&self, _plane: PlaneId, _state: &PlaneState) -> GfxResult<()> {
        Ok(())
    }

    fn atomic_update(&self, _plane: PlaneId, _state: &PlaneState) {}

    fn atomic_set_property(
        &self,
        _plane: PlaneId,
        _state: &mut PlaneState,
        _property: PropertyId,
        _value: u64,
    ) -> GfxResult<()> {
        Err(NO_PROPERTY)
    }
}

// ---------------------------------------------------------------------------
// Device hooks
// ---------------------------------------------------------------------------

/// How a device validates and applies transactions.
pub trait ModeConfigFuncs: Send + Sync {
    fn atomic_check(&self, dev: &DrmDevice, state: &mut AtomicState) -> GfxResult<()> {
        helper::check(dev, state)
    }

    fn atomic_commit(&self, dev: &mut DrmDevice, state: &mut AtomicState, nonblock: bool) -> GfxResult<()> {
        helper::commit(dev, state, nonblock)
    }
}

/// Check and commit through the stock helpers.
pub struct HelperModeConfig;

impl ModeConfigFuncs for HelperModeConfig {}
