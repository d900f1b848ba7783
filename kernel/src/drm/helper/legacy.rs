//! Legacy modeset entry points
//!
//! Each request becomes a one-shot transaction that is checked and
//! committed through the device hooks. Lock contention is not an error
//! here: the transaction is cleared, every lock dropped, and the request
//! rebuilt from scratch until it goes through.

use alloc::{sync::Arc, vec::Vec};

use bitflags::bitflags;

use crate::{
    drm::{
        atomic::{self, AtomicState},
        funcs::{Framebuffer, PendingEvent},
        lock::ModesetLockId,
        mode::{fixed16, DisplayMode},
        object::{ConnectorId, CrtcId, DrmDevice, ModeConfig, PlaneId, PropertyId},
    },
    error::{GfxError, GfxResult, ObjectKind, ValidationError},
};

bitflags! {
    /// Page flip request flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlipFlags: u32 {
        /// Deliver an event on completion
        const EVENT = 0x01;
        /// Flip without waiting for vblank
        const ASYNC = 0x02;
    }
}

/// Placement of a framebuffer on a plane.
#[derive(Debug, Clone)]
pub struct PlaneUpdate {
    pub crtc: CrtcId,
    pub fb: Arc<Framebuffer>,
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

/// A full crtc configuration: mode, scanout buffer and outputs.
///
/// No mode means the crtc is switched off.
#[derive(Debug, Clone)]
pub struct ModeSet {
    pub crtc: CrtcId,
    pub mode: Option<DisplayMode>,
    pub fb: Option<Arc<Framebuffer>>,
    pub x: u32,
    pub y: u32,
    pub connectors: Vec<ConnectorId>,
}

type CommitFn = fn(&mut DrmDevice, &mut AtomicState) -> GfxResult<()>;

/// Build and commit a transaction, starting over on lock contention.
///
/// `plane` is the plane whose legacy framebuffer the request replaces; its
/// `old_fb` tracks the buffer on screen across retries.
fn build_and_commit<F>(dev: &mut DrmDevice, plane: Option<PlaneId>, commit: CommitFn, mut build: F) -> GfxResult<()>
where
    F: FnMut(&ModeConfig, &mut AtomicState) -> GfxResult<()>,
{
    set_old_fb(dev, plane);
    let mut state = AtomicState::new(dev);

    let result = loop {
        let result = match build(&dev.mode_config, &mut state) {
            Ok(()) => commit(dev, &mut state),
            Err(err) => Err(err),
        };
        match result {
            Err(GfxError::LockContention) => {
                log::debug!("modeset lock contention, retrying from a clean transaction");
                state.clear();
                state.backoff();
                set_old_fb(dev, plane);
            }
            other => break other,
        }
    };

    if let Some(object) = plane.and_then(|p| dev.mode_config.plane_mut(p)) {
        if result.is_ok() {
            object.crtc = object.state.crtc;
            object.fb = object.state.fb.clone();
        }
        object.old_fb = None;
    }
    result
}

fn set_old_fb(dev: &mut DrmDevice, plane: Option<PlaneId>) {
    if let Some(object) = plane.and_then(|p| dev.mode_config.plane_mut(p)) {
        object.old_fb = object.fb.clone();
    }
}

fn primary_plane(config: &ModeConfig, crtc: CrtcId) -> GfxResult<PlaneId> {
    let object = config.crtc(crtc).ok_or(ValidationError::UnknownObject {
        kind: ObjectKind::Crtc,
        id: crtc.0,
    })?;
    object.primary.ok_or(GfxError::NotFound {
        resource: "primary plane",
        id: crtc.0 as u64,
    })
}

// ---------------------------------------------------------------------------
// Planes
// ---------------------------------------------------------------------------

/// Show `update.fb` on `plane`.
pub fn update_plane(dev: &mut DrmDevice, plane: PlaneId, update: &PlaneUpdate) -> GfxResult<()> {
    build_and_commit(dev, Some(plane), atomic::commit, |config, state| {
        state.set_crtc_for_plane(config, plane, Some(update.crtc))?;
        state.set_fb_for_plane(config, plane, Some(update.fb.clone()))?;

        let staged = state.get_plane_state(config, plane)?;
        staged.crtc_x = update.crtc_x;
        staged.crtc_y = update.crtc_y;
        staged.crtc_w = update.crtc_w;
        staged.crtc_h = update.crtc_h;
        staged.src_x = update.src_x;
        staged.src_y = update.src_y;
        staged.src_w = update.src_w;
        staged.src_h = update.src_h;
        Ok(())
    })
}

/// Take `plane` off its crtc.
pub fn disable_plane(dev: &mut DrmDevice, plane: PlaneId) -> GfxResult<()> {
    build_and_commit(dev, Some(plane), atomic::commit, |config, state| {
        state.set_crtc_for_plane(config, plane, None)?;
        state.set_fb_for_plane(config, plane, None)?;

        let staged = state.get_plane_state(config, plane)?;
        staged.crtc_x = 0;
        staged.crtc_y = 0;
        staged.crtc_w = 0;
        staged.crtc_h = 0;
        staged.src_x = 0;
        staged.src_y = 0;
        staged.src_w = 0;
        staged.src_h = 0;
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Crtc configuration
// ---------------------------------------------------------------------------

/// Apply a complete crtc configuration.
pub fn set_config(dev: &mut DrmDevice, set: &ModeSet) -> GfxResult<()> {
    let primary = primary_plane(&dev.mode_config, set.crtc)?;

    build_and_commit(dev, Some(primary), atomic::commit, |config, state| {
        let crtc_state = state.get_crtc_state(config, set.crtc)?;
        match set.mode {
            None => {
                if set.fb.is_some() || !set.connectors.is_empty() {
                    log::warn!("disabling [CRTC:{}] with a framebuffer or connectors", set.crtc.0);
                }
                crtc_state.enable = false;
            }
            Some(mode) => {
                if set.fb.is_none() || set.connectors.is_empty() {
                    log::warn!("enabling [CRTC:{}] without a framebuffer or connectors", set.crtc.0);
                }
                crtc_state.enable = true;
                crtc_state.mode = mode;

                state.set_crtc_for_plane(config, primary, Some(set.crtc))?;
                state.set_fb_for_plane(config, primary, set.fb.clone())?;

                let (w, h) = (u32::from(mode.hdisplay), u32::from(mode.vdisplay));
                let staged = state.get_plane_state(config, primary)?;
                staged.crtc_x = 0;
                staged.crtc_y = 0;
                staged.crtc_w = w;
                staged.crtc_h = h;
                staged.src_x = fixed16(set.x);
                staged.src_y = fixed16(set.y);
                staged.src_w = fixed16(w);
                staged.src_h = fixed16(h);
            }
        }
        update_output_state(config, state, set)
    })
}

/// Stage the connector moves of `set` and recompute `enable` of every
/// other crtc they touch.
fn update_output_state(config: &ModeConfig, state: &mut AtomicState, set: &ModeSet) -> GfxResult<()> {
    state.lock(ModesetLockId::ConnectionMutex)?;

    for &connector in &set.connectors {
        state.get_connector_state(config, connector)?;
        // The crtc the connector leaves has to drop its enable flag too.
        if let Some(crtc) = config.connector(connector).and_then(|c| c.state.crtc) {
            state.get_crtc_state(config, crtc)?;
        }
    }

    for crtc in state.crtc_ids() {
        state.add_affected_connectors(config, crtc)?;
    }

    for connector in state.connector_ids() {
        if state.connector_state(connector).and_then(|s| s.crtc) == Some(set.crtc) {
            state.set_crtc_for_connector(config, connector, None)?;
        }
        if set.connectors.contains(&connector) {
            state.set_crtc_for_connector(config, connector, Some(set.crtc))?;
        }
    }

    // A mismatch on the requested crtc is a caller bug the check reports.
    for crtc in state.crtc_ids() {
        if crtc == set.crtc {
            continue;
        }
        let routed = state.connectors_for_crtc(crtc);
        if let Some(staged) = state.crtc_state_mut(crtc) {
            staged.enable = routed > 0;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

pub fn crtc_set_property(dev: &mut DrmDevice, crtc: CrtcId, property: PropertyId, value: u64) -> GfxResult<()> {
    build_and_commit(dev, None, atomic::commit, |config, state| {
        state.lock_all(config)?;
        let object = config.crtc(crtc).ok_or(ValidationError::UnknownObject {
            kind: ObjectKind::Crtc,
            id: crtc.0,
        })?;
        let staged = state.get_crtc_state(config, crtc)?;
        object.helper.atomic_set_property(crtc, staged, property, value)
    })
}

pub fn plane_set_property(dev: &mut DrmDevice, plane: PlaneId, property: PropertyId, value: u64) -> GfxResult<()> {
    build_and_commit(dev, None, atomic::commit, |config, state| {
        state.lock_all(config)?;
        let object = config.plane(plane).ok_or(ValidationError::UnknownObject {
            kind: ObjectKind::Plane,
            id: plane.0,
        })?;
        let staged = state.get_plane_state(config, plane)?;
        object.helper.atomic_set_property(plane, staged, property, value)
    })
}

pub fn connector_set_property(
    dev: &mut DrmDevice,
    connector: ConnectorId,
    property: PropertyId,
    value: u64,
) -> GfxResult<()> {
    build_and_commit(dev, None, atomic::commit, |config, state| {
        state.lock_all(config)?;
        let object = config.connector(connector).ok_or(ValidationError::UnknownObject {
            kind: ObjectKind::Connector,
            id: connector.0,
        })?;
        let staged = state.get_connector_state(config, connector)?;
        object.helper.atomic_set_property(connector, staged, property, value)
    })
}

// ---------------------------------------------------------------------------
// Page flip
// ---------------------------------------------------------------------------

/// Queue `fb` on the primary plane of `crtc` for the next vblank.
///
/// Flips go through the nonblocking commit hook; with the stock commit
/// helper that is [`GfxError::Busy`].
pub fn page_flip(
    dev: &mut DrmDevice,
    crtc: CrtcId,
    fb: Arc<Framebuffer>,
    event: Option<PendingEvent>,
    flags: PageFlipFlags,
) -> GfxResult<()> {
    if flags.contains(PageFlipFlags::ASYNC) {
        return Err(ValidationError::AsyncFlip.into());
    }
    let primary = primary_plane(&dev.mode_config, crtc)?;

    build_and_commit(dev, Some(primary), atomic::async_commit, |config, state| {
        state.get_crtc_state(config, crtc)?.event = event;
        state.set_crtc_for_plane(config, primary, Some(crtc))?;
        state.set_fb_for_plane(config, primary, Some(fb.clone()))
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::DisplayHarness;

    #[test]
    fn test_set_config_lights_up_and_switches_off() {
        let mut harness = DisplayHarness::new(1, 1, 1);
        harness.light_up(0, &[0]).unwrap();

        let config = &harness.dev.mode_config;
        let crtc = config.crtc(harness.crtcs[0]).unwrap();
        assert!(crtc.state.enable);
        let primary = config.plane(harness.planes[0]).unwrap();
        assert_eq!(primary.crtc, Some(harness.crtcs[0]));
        assert_eq!(primary.state.src_w, fixed16(1920));
        assert!(primary.fb.is_some());
        assert!(primary.old_fb.is_none());

        let off = ModeSet {
            crtc: harness.crtcs[0],
            mode: None,
            fb: None,
            x: 0,
            y: 0,
            connectors: Vec::new(),
        };
        set_config(&mut harness.dev, &off).unwrap();
        let config = &harness.dev.mode_config;
        assert!(!config.crtc(harness.crtcs[0]).unwrap().state.enable);
        let connector = config.connector(harness.connectors[0]).unwrap();
        assert_eq!(connector.state.crtc, None);
        assert_eq!(connector.encoder, None);
        assert!(harness.log.position("encoder:0 disable").is_some());
    }

    #[test]
    fn test_moving_a_connector_disables_its_old_crtc() {
        let mut harness = DisplayHarness::new(2, 2, 1);
        harness.light_up(0, &[0]).unwrap();
        harness.light_up(1, &[0]).unwrap();

        let config = &harness.dev.mode_config;
        assert!(!config.crtc(harness.crtcs[0]).unwrap().state.enable);
        assert!(config.crtc(harness.crtcs[1]).unwrap().state.enable);
        assert_eq!(
            config.connector(harness.connectors[0]).unwrap().state.crtc,
            Some(harness.crtcs[1])
        );
    }

    #[test]
    fn test_contention_is_retried() {
        let mut harness = DisplayHarness::new(1, 1, 1);
        harness.locks.contend(2);
        harness.light_up(0, &[0]).unwrap();
        assert_eq!(harness.locks.backoffs(), 2);
        assert!(harness.dev.mode_config.crtc(harness.crtcs[0]).unwrap().state.enable);
    }

    #[test]
    fn test_update_and_disable_plane() {
        let mut harness = DisplayHarness::new(1, 1, 1);
        harness.light_up(0, &[0]).unwrap();
        let plane = harness.planes[0];
        let fb = DisplayHarness::fb(9);

        let update = PlaneUpdate {
            crtc: harness.crtcs[0],
            fb: fb.clone(),
            crtc_x: 10,
            crtc_y: 20,
            crtc_w: 640,
            crtc_h: 480,
            src_x: 0,
            src_y: 0,
            src_w: fixed16(640),
            src_h: fixed16(480),
        };
        update_plane(&mut harness.dev, plane, &update).unwrap();
        drop(update);
        let object = harness.dev.mode_config.plane(plane).unwrap();
        assert_eq!(object.state.crtc_x, 10);
        assert!(Arc::ptr_eq(object.fb.as_ref().unwrap(), &fb));

        disable_plane(&mut harness.dev, plane).unwrap();
        let object = harness.dev.mode_config.plane(plane).unwrap();
        assert!(object.state.fb.is_none());
        assert_eq!(object.crtc, None);
        assert_eq!(object.state.src_w, 0);
        assert_eq!(Arc::strong_count(&fb), 1);
    }

    #[test]
    fn test_page_flip() {
        let mut harness = DisplayHarness::new(1, 1, 1);
        harness.light_up(0, &[0]).unwrap();
        let crtc = harness.crtcs[0];

        assert_eq!(
            page_flip(&mut harness.dev, crtc, DisplayHarness::fb(4), None, PageFlipFlags::ASYNC),
            Err(ValidationError::AsyncFlip.into())
        );

        let before = harness.dev.mode_config.plane(harness.planes[0]).unwrap().fb.clone();
        let event = Some(PendingEvent { user_data: 1 });
        assert!(matches!(
            page_flip(&mut harness.dev, crtc, DisplayHarness::fb(4), event, PageFlipFlags::EVENT),
            Err(GfxError::Busy { .. })
        ));
        let after = &harness.dev.mode_config.plane(harness.planes[0]).unwrap().fb;
        assert!(Arc::ptr_eq(before.as_ref().unwrap(), after.as_ref().unwrap()));
    }

    #[test]
    fn test_unsupported_property() {
        let mut harness = DisplayHarness::new(1, 1, 1);
        assert!(matches!(
            crtc_set_property(&mut harness.dev, harness.crtcs[0], PropertyId(1), 0),
            Err(GfxError::OperationNotSupported { .. })
        ));
        assert!(!harness.dev.locks.is_locked(ModesetLockId::Crtc(harness.crtcs[0])));
    }

    #[test]
    fn test_connector_property_on_lit_output() {
        let mut harness = DisplayHarness::new(1, 1, 1);
        harness.light_up(0, &[0]).unwrap();
        let property = PropertyId(3);
        harness.connector_funcs[0].properties.accept(Some(property));
        let waits = harness.vblank.waits();
        harness.log.clear();

        connector_set_property(&mut harness.dev, harness.connectors[0], property, 1).unwrap();

        assert!(harness.log.position("connector:0 set_property [PROP:3]=1").is_some());
        let config = &harness.dev.mode_config;
        let connector = config.connector(harness.connectors[0]).unwrap();
        assert_eq!(connector.state.crtc, Some(harness.crtcs[0]));
        assert_eq!(connector.encoder, Some(harness.encoders[0]));
        assert!(config.crtc(harness.crtcs[0]).unwrap().state.enable);
        assert_eq!(harness.vblank.waits(), waits + 1);
        assert!(!harness.dev.locks.is_locked(ModesetLockId::ConnectionMutex));
        assert!(!harness.dev.locks.is_locked(ModesetLockId::Crtc(harness.crtcs[0])));
    }

    #[test]
    fn test_crtc_property_on_lit_output() {
        let mut harness = DisplayHarness::new(1, 1, 1);
        harness.light_up(0, &[0]).unwrap();
        let property = PropertyId(5);
        harness.crtc_funcs[0].properties.accept(Some(property));

        crtc_set_property(&mut harness.dev, harness.crtcs[0], property, 2).unwrap();

        assert!(harness.log.position("crtc:0 set_property [PROP:5]=2").is_some());
        let config = &harness.dev.mode_config;
        assert!(config.crtc(harness.crtcs[0]).unwrap().state.enable);
        assert_eq!(
            config.connector(harness.connectors[0]).unwrap().state.crtc,
            Some(harness.crtcs[0])
        );
        // a property on one crtc leaves the other property hooks alone
        assert!(matches!(
            crtc_set_property(&mut harness.dev, harness.crtcs[0], PropertyId(6), 2),
            Err(GfxError::OperationNotSupported { .. })
        ));
    }

    #[test]
    fn test_plane_property_is_committed() {
        let mut harness = DisplayHarness::new(1, 1, 1);
        harness.light_up(0, &[0]).unwrap();
        let property = PropertyId(9);
        harness.plane_funcs[0].properties.accept(Some(property));
        harness.log.clear();

        plane_set_property(&mut harness.dev, harness.planes[0], property, 16).unwrap();

        let plane = harness.dev.mode_config.plane(harness.planes[0]).unwrap();
        assert_eq!(plane.state.crtc_x, 16);
        assert_eq!(plane.state.crtc, Some(harness.crtcs[0]));
        assert!(harness.log.position("plane:0 atomic_update").is_some());
        assert!(!harness.dev.locks.is_locked(ModesetLockId::Plane(harness.planes[0])));
    }
}
