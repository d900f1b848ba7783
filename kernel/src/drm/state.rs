//! Per-object state snapshots
//!
//! Each crtc, connector and plane has exactly one committed state. A
//! transaction works on duplicates; reset produces the power-on state and
//! destroying a state is simply dropping it, which releases the
//! framebuffer reference a plane state holds.

use alloc::{boxed::Box, sync::Arc};
use core::fmt;

use super::{
    funcs::{Fence, Framebuffer, PendingEvent},
    mode::DisplayMode,
    object::{CrtcId, EncoderId},
};

#[derive(Debug, Clone, Default)]
pub struct CrtcState {
    pub enable: bool,
    pub mode: DisplayMode,
    /// `mode` after encoder and crtc fixups, what the hardware gets.
    pub adjusted_mode: DisplayMode,
    pub mode_changed: bool,
    pub planes_changed: bool,
    pub event: Option<PendingEvent>,
    pub last_vblank_count: u32,
}

impl CrtcState {
    pub fn reset() -> Box<Self> {
        Box::default()
    }

    /// Copy for a new transaction. Per-transaction flags and the event
    /// start out clear.
    pub fn duplicate(&self) -> Box<Self> {
        Box::new(Self {
            mode_changed: false,
            planes_changed: false,
            event: None,
            ..self.clone()
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectorState {
    pub crtc: Option<CrtcId>,
    pub best_encoder: Option<EncoderId>,
}

impl ConnectorState {
    pub fn reset() -> Box<Self> {
        Box::default()
    }

    pub fn duplicate(&self) -> Box<Self> {
        Box::new(*self)
    }
}

#[derive(Clone, Default)]
pub struct PlaneState {
    pub crtc: Option<CrtcId>,
    pub fb: Option<Arc<Framebuffer>>,
    /// Signaled when rendering into `fb` is done.
    pub fence: Option<Arc<dyn Fence>>,
    pub crtc_x: i32,
    pub crtc_y: i32,
    pub crtc_w: u32,
    pub crtc_h: u32,
    /// Source rectangle, 16.16 fixed point
    pub src_x: u32,
    pub src_y: u32,
    pub src_w: u32,
    pub src_h: u32,
}

impl PlaneState {
    pub fn reset() -> Box<Self> {
        Box::default()
    }

    /// Copy for a new transaction. Takes its own framebuffer reference;
    /// the fence belongs to the commit that set it and is not carried over.
    pub fn duplicate(&self) -> Box<Self> {
        Box::new(Self {
            fence: None,
            ..self.clone()
        })
    }
}

impl fmt::Debug for PlaneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaneState")
            .field("crtc", &self.crtc)
            .field("fb", &self.fb.as_ref().map(|fb| fb.id))
            .field("fence", &self.fence.is_some())
            .field("crtc_rect", &(self.crtc_x, self.crtc_y, self.crtc_w, self.crtc_h))
            .field("src_rect", &(self.src_x, self.src_y, self.src_w, self.src_h))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crtc_duplicate_clears_transient_flags() {
        let mut state = CrtcState::reset();
        state.enable = true;
        state.mode = DisplayMode::new(1024, 768, 60);
        state.mode_changed = true;
        state.planes_changed = true;
        state.event = Some(PendingEvent { user_data: 7 });

        let dup = state.duplicate();
        assert!(dup.enable);
        assert_eq!(dup.mode, state.mode);
        assert!(!dup.mode_changed);
        assert!(!dup.planes_changed);
        assert!(dup.event.is_none());
    }

    #[test]
    fn test_plane_duplicate_references_fb() {
        let fb = Arc::new(Framebuffer {
            id: 1,
            width: 64,
            height: 64,
            pitch: 256,
            format: 0,
        });
        let mut state = PlaneState::reset();
        state.fb = Some(fb.clone());
        assert_eq!(Arc::strong_count(&fb), 2);

        let dup = state.duplicate();
        assert_eq!(Arc::strong_count(&fb), 3);
        drop(dup);
        drop(state);
        assert_eq!(Arc::strong_count(&fb), 1);
    }
}
