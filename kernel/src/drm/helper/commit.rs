//! Commit phase
//!
//! Only framebuffer preparation can fail. Once the staged states are
//! swapped in, the sequence runs to completion: outputs that change are
//! shut down, routing links and timings are programmed, planes are
//! updated, outputs come back up, and after one vblank the framebuffers
//! that left the screen are released.

use alloc::vec::Vec;

use crate::{
    drm::{
        atomic::AtomicState,
        mode::fixed16_to_int,
        object::DrmDevice,
        vblank::VBLANK_TIMEOUT_MS,
    },
    error::{GfxError, GfxResult},
    raii::VblankReference,
};

/// Apply a checked transaction.
///
/// Nonblocking commits are not implemented and return
/// [`GfxError::Busy`] before anything is touched. On success `state` holds
/// the previously committed states.
pub fn commit(dev: &mut DrmDevice, state: &mut AtomicState, nonblock: bool) -> GfxResult<()> {
    if nonblock {
        return Err(GfxError::Busy {
            operation: "nonblocking atomic commit",
        });
    }

    prepare_planes(dev, state)?;

    // Point of no return.
    state.swap_into(&mut dev.mode_config);

    wait_for_fences(dev, state);
    commit_pre_planes(dev, state);
    commit_planes(dev, state);
    commit_post_planes(dev, state);
    wait_for_vblanks(dev, state);
    cleanup_planes(dev, state);

    Ok(())
}

/// Pin the new framebuffer of every plane. On failure the planes prepared
/// so far are cleaned up again, in reverse.
pub fn prepare_planes(dev: &DrmDevice, state: &AtomicState) -> GfxResult<()> {
    let config = &dev.mode_config;
    let planes = state.plane_ids();

    for (i, &plane) in planes.iter().enumerate() {
        let (Some(object), Some(fb)) = (
            config.plane(plane),
            state.plane_state(plane).and_then(|s| s.fb.as_ref()),
        ) else {
            continue;
        };
        if let Err(err) = object.helper.prepare_fb(plane, fb) {
            log::debug!("[PLANE:{}] prepare_fb failed", plane.0);
            for &prepared in planes[..i].iter().rev() {
                let (Some(object), Some(fb)) = (
                    config.plane(prepared),
                    state.plane_state(prepared).and_then(|s| s.fb.as_ref()),
                ) else {
                    continue;
                };
                object.helper.cleanup_fb(prepared, fb);
            }
            return Err(err);
        }
    }
    Ok(())
}

/// Wait for rendering into the new framebuffers and drop the fences.
fn wait_for_fences(dev: &mut DrmDevice, old: &AtomicState) {
    for plane in old.plane_ids() {
        let Some(object) = dev.mode_config.plane_mut(plane) else {
            continue;
        };
        let Some(fence) = object.state.fence.take() else {
            continue;
        };
        if object.state.fb.is_none() {
            log::warn!("[PLANE:{}] fence without a framebuffer", plane.0);
        }
        fence.wait();
    }
}

// ---------------------------------------------------------------------------
// Modeset
// ---------------------------------------------------------------------------

/// Shut down changing outputs, update routing links and program timings.
pub fn commit_pre_planes(dev: &mut DrmDevice, old: &AtomicState) {
    disable_outputs(dev, old);
    set_routing_links(dev, old);
    crtc_set_mode(dev, old);
}

fn disable_outputs(dev: &DrmDevice, old: &AtomicState) {
    let config = &dev.mode_config;

    for connector in old.connector_ids() {
        let Some(old_conn) = old.connector_state(connector) else {
            continue;
        };
        if old_conn.crtc.is_none() {
            continue;
        }
        let Some(encoder_id) = old_conn.best_encoder else {
            log::warn!("[CONNECTOR:{}] had a crtc but no encoder", connector.0);
            continue;
        };
        let Some(encoder) = config.encoder(encoder_id) else {
            continue;
        };
        let staying_on = config.connector(connector).and_then(|c| c.state.crtc).is_some();

        log::debug!("disabling [ENCODER:{}:{}]", encoder_id.0, encoder.name);

        if let Some(bridge) = &encoder.bridge {
            bridge.disable();
        }
        // Encoders that keep a crtc are only prepared for the new mode.
        if staying_on {
            encoder.helper.prepare(encoder_id);
        } else {
            encoder.helper.disable(encoder_id);
        }
        if let Some(bridge) = &encoder.bridge {
            bridge.post_disable();
        }
    }

    for crtc in old.crtc_ids() {
        let Some(object) = config.crtc(crtc) else {
            continue;
        };
        if !object.state.mode_changed {
            continue;
        }
        log::debug!("disabling [CRTC:{}:{}]", crtc.0, object.name);
        if object.state.enable {
            object.helper.prepare(crtc);
        } else {
            object.helper.disable(crtc);
        }
    }
}

/// Mirror the committed routing into the legacy encoder/crtc links and
/// crtc fields.
fn set_routing_links(dev: &mut DrmDevice, old: &AtomicState) {
    let config = &mut dev.mode_config;

    for connector in old.connector_ids() {
        let Some(object) = config.connectors.get_mut(connector.index()) else {
            continue;
        };
        if let Some(encoder) = object.encoder.take() {
            if let Some(encoder) = config.encoders.get_mut(encoder.index()) {
                encoder.crtc = None;
            }
        }
    }

    for connector in old.connector_ids() {
        let Some(object) = config.connectors.get_mut(connector.index()) else {
            continue;
        };
        let Some(crtc) = object.state.crtc else {
            continue;
        };
        let Some(encoder) = object.state.best_encoder else {
            log::warn!("[CONNECTOR:{}] has a crtc but no encoder", connector.0);
            continue;
        };
        object.encoder = Some(encoder);
        if let Some(encoder) = config.encoders.get_mut(encoder.index()) {
            encoder.crtc = Some(crtc);
        }
    }

    for crtc in old.crtc_ids() {
        let Some(object) = config.crtcs.get_mut(crtc.index()) else {
            continue;
        };
        object.mode = object.state.mode;
        object.enabled = object.state.enable;
        if let Some(primary) = object.primary.and_then(|p| config.planes.get(p.index())) {
            object.x = fixed16_to_int(primary.state.src_x);
            object.y = fixed16_to_int(primary.state.src_y);
        }
    }
}

fn crtc_set_mode(dev: &DrmDevice, old: &AtomicState) {
    let config = &dev.mode_config;

    for crtc in old.crtc_ids() {
        let Some(object) = config.crtc(crtc) else {
            continue;
        };
        if object.state.mode_changed && object.state.enable {
            log::debug!("modeset on [CRTC:{}:{}]", crtc.0, object.name);
            object.helper.mode_set_nofb(crtc, &object.state);
        }
    }

    for connector in old.connector_ids() {
        let Some(object) = config.connector(connector) else {
            continue;
        };
        let Some(encoder_id) = object.state.best_encoder else {
            continue;
        };
        let (Some(encoder), Some(crtc)) = (
            config.encoder(encoder_id),
            object.state.crtc.and_then(|c| config.crtc(c)),
        ) else {
            continue;
        };
        let (mode, adjusted) = (&crtc.state.mode, &crtc.state.adjusted_mode);

        log::debug!("modeset on [ENCODER:{}:{}]", encoder_id.0, encoder.name);
        encoder.helper.mode_set(encoder_id, mode, adjusted);
        if let Some(bridge) = &encoder.bridge {
            bridge.mode_set(mode, adjusted);
        }
    }
}

// ---------------------------------------------------------------------------
// Planes
// ---------------------------------------------------------------------------

/// Update every plane between the begin and flush of every crtc.
pub fn commit_planes(dev: &DrmDevice, old: &AtomicState) {
    let config = &dev.mode_config;

    for crtc in old.crtc_ids() {
        if let Some(object) = config.crtc(crtc) {
            object.helper.atomic_begin(crtc);
        }
    }
    for plane in old.plane_ids() {
        if let Some(object) = config.plane(plane) {
            object.helper.atomic_update(plane, &object.state);
        }
    }
    for crtc in old.crtc_ids() {
        if let Some(object) = config.crtc(crtc) {
            object.helper.atomic_flush(crtc);
        }
    }
}

// ---------------------------------------------------------------------------
// Enable
// ---------------------------------------------------------------------------

/// Bring up crtcs that took a new mode, then every routed output.
pub fn commit_post_planes(dev: &DrmDevice, old: &AtomicState) {
    let config = &dev.mode_config;

    for crtc in old.crtc_ids() {
        let Some(object) = config.crtc(crtc) else {
            continue;
        };
        if object.state.mode_changed && object.state.enable {
            log::debug!("enabling [CRTC:{}:{}]", crtc.0, object.name);
            object.helper.commit(crtc);
        }
    }

    for connector in old.connector_ids() {
        let Some(encoder_id) = config.connector(connector).and_then(|c| c.state.best_encoder) else {
            continue;
        };
        let Some(encoder) = config.encoder(encoder_id) else {
            continue;
        };

        log::debug!("enabling [ENCODER:{}:{}]", encoder_id.0, encoder.name);
        if let Some(bridge) = &encoder.bridge {
            bridge.pre_enable();
        }
        encoder.helper.commit(encoder_id);
        if let Some(bridge) = &encoder.bridge {
            bridge.enable();
        }
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Wait one vblank on every crtc of the transaction that is still lit, so
/// new timings have latched and the old framebuffers are off screen before
/// they are released.
///
/// The vblank reference is dropped whether or not the wait timed out.
pub fn wait_for_vblanks(dev: &DrmDevice, old: &mut AtomicState) {
    let vblank = dev.vblank.as_ref();
    let mut pending = Vec::new();

    for crtc in old.crtc_ids() {
        let Some(object) = dev.mode_config.crtc(crtc) else {
            continue;
        };
        if !object.state.enable {
            continue;
        }
        let Some(reference) = VblankReference::get(vblank, crtc) else {
            continue;
        };
        let count = vblank.count(crtc);
        if let Some(old_state) = old.crtc_state_mut(crtc) {
            old_state.last_vblank_count = count;
        }
        pending.push((reference, count));
    }

    for (reference, last) in &pending {
        let crtc = reference.crtc();
        if !vblank.wait_for_change(crtc, *last, VBLANK_TIMEOUT_MS) {
            log::debug!(
                "[CRTC:{}:{}] vblank wait timed out",
                crtc.0,
                dev.mode_config.crtc_name(crtc)
            );
        }
    }
}

/// Release the framebuffers the old plane states pinned.
pub fn cleanup_planes(dev: &DrmDevice, old: &AtomicState) {
    for plane in old.plane_ids() {
        let (Some(object), Some(fb)) = (
            dev.mode_config.plane(plane),
            old.plane_state(plane).and_then(|s| s.fb.as_ref()),
        ) else {
            continue;
        };
        object.helper.cleanup_fb(plane, fb);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
