//! Check phase
//!
//! Everything here works on staged state only; a failure leaves the
//! committed configuration exactly as it was.

use crate::{
    drm::{
        atomic::AtomicState,
        object::{ConnectorId, DrmDevice, EncoderId, ModeConfig, PlaneId},
    },
    error::{GfxError, GfxResult, ObjectKind, ValidationError},
};

const NOT_STAGED: GfxError = GfxError::InvalidArgument {
    name: "state",
    value: "object not part of the transaction",
};

/// Validate a whole transaction: modeset first, then planes and crtcs.
pub fn check(dev: &DrmDevice, state: &mut AtomicState) -> GfxResult<()> {
    check_modeset(dev, state)?;
    check_planes(dev, state)
}

/// Resolve routing and validate modes.
///
/// Crtcs whose mode or enable changed are flagged, every connector in the
/// transaction is routed, each flagged crtc is checked for a consistent
/// enable state against the connectors routed to it, and finally the
/// fixup chain runs.
pub fn check_modeset(dev: &DrmDevice, state: &mut AtomicState) -> GfxResult<()> {
    let config = &dev.mode_config;

    for crtc in state.crtc_ids() {
        let Some(committed) = config.crtc(crtc) else {
            continue;
        };
        let Some(staged) = state.crtc_state_mut(crtc) else {
            continue;
        };
        if staged.mode != committed.state.mode || staged.enable != committed.state.enable {
            log::debug!("[CRTC:{}:{}] mode changed", crtc.0, committed.name);
            staged.mode_changed = true;
        }
    }

    // Routing may pull more connectors in; they get routed as well.
    for index in 0..config.connectors().len() {
        let connector = ConnectorId(index as u32);
        if state.connector_state(connector).is_none() {
            continue;
        }
        update_connector_routing(config, state, connector)?;
    }

    for crtc in state.crtc_ids() {
        if !state.crtc_state(crtc).is_some_and(|s| s.mode_changed) {
            continue;
        }
        state.add_affected_connectors(config, crtc)?;

        let routed = state.connectors_for_crtc(crtc);
        let enable = state.crtc_state(crtc).is_some_and(|s| s.enable);
        if enable != (routed > 0) {
            log::debug!(
                "[CRTC:{}:{}] enabled/connectors mismatch",
                crtc.0,
                config.crtc_name(crtc)
            );
            return Err(ValidationError::Consistency { crtc: crtc.0 }.into());
        }
    }

    mode_fixup(config, state)
}

/// Work out which encoder drives `connector` under the staged state.
pub fn update_connector_routing(
    config: &ModeConfig,
    state: &mut AtomicState,
    connector: ConnectorId,
) -> GfxResult<()> {
    let object = config.connector(connector).ok_or(ValidationError::UnknownObject {
        kind: ObjectKind::Connector,
        id: connector.0,
    })?;
    let staged = *state.connector_state(connector).ok_or(NOT_STAGED)?;

    log::debug!("Updating routing for [CONNECTOR:{}:{}]", connector.0, object.name);

    if object.state.crtc != staged.crtc {
        if let Some(old) = object.state.crtc {
            state.get_crtc_state(config, old)?.mode_changed = true;
        }
        if let Some(new) = staged.crtc {
            state.get_crtc_state(config, new)?.mode_changed = true;
        }
    }

    let Some(crtc) = staged.crtc else {
        log::debug!("Disabling [CONNECTOR:{}:{}]", connector.0, object.name);
        return state.set_best_encoder(connector, None);
    };

    let Some(encoder) = object.helper.best_encoder(connector) else {
        log::debug!(
            "No suitable encoder found for [CONNECTOR:{}:{}]",
            connector.0,
            object.name
        );
        return Err(ValidationError::Routing { connector: connector.0 }.into());
    };
    if config.encoder(encoder).is_none() {
        return Err(ValidationError::UnknownObject {
            kind: ObjectKind::Encoder,
            id: encoder.0,
        }
        .into());
    }

    if staged.best_encoder == Some(encoder) {
        log::debug!(
            "no encoder change for [CONNECTOR:{}:{}]",
            connector.0,
            object.name
        );
        return Ok(());
    }

    steal_encoder(config, state, encoder, connector)?;

    state.set_best_encoder(connector, Some(encoder))?;
    state.get_crtc_state(config, crtc)?.mode_changed = true;

    log::debug!(
        "[CONNECTOR:{}:{}] using [ENCODER:{}:{}] on [CRTC:{}:{}]",
        connector.0,
        object.name,
        encoder.0,
        config.encoder_name(encoder),
        crtc.0,
        config.crtc_name(crtc)
    );
    Ok(())
}

/// Detach whichever connector holds `encoder` so `thief` can have it.
///
/// The holder's crtcs, committed and staged, are flagged for a modeset.
pub fn steal_encoder(
    config: &ModeConfig,
    state: &mut AtomicState,
    encoder: EncoderId,
    thief: ConnectorId,
) -> GfxResult<()> {
    let Some(victim) = state.effective_owner(config, encoder) else {
        return Ok(());
    };
    if victim == thief {
        return Ok(());
    }

    log::debug!(
        "[ENCODER:{}:{}] in use on [CONNECTOR:{}:{}], stealing it",
        encoder.0,
        config.encoder_name(encoder),
        victim.0,
        config.connector_name(victim)
    );

    if let Some(crtc) = config.current_crtc_for_encoder(encoder) {
        state.get_crtc_state(config, crtc)?.mode_changed = true;
    }
    let victim_crtc = state.get_connector_state(config, victim)?.crtc;
    if let Some(crtc) = victim_crtc {
        state.get_crtc_state(config, crtc)?.mode_changed = true;
    }

    state.set_crtc_for_connector(config, victim, None)?;
    state.set_best_encoder(victim, None)
}

/// Run the bridge, encoder and crtc fixups on `adjusted_mode`.
///
/// Encoders go first since the crtc may depend on the timings they
/// adjusted. Each encoder is routed to at most one connector, so none is
/// visited twice.
pub fn mode_fixup(config: &ModeConfig, state: &mut AtomicState) -> GfxResult<()> {
    for crtc in state.crtc_ids() {
        if let Some(staged) = state.crtc_state_mut(crtc) {
            if staged.mode_changed {
                staged.adjusted_mode = staged.mode;
            }
        }
    }

    for connector in state.connector_ids() {
        let Some(&staged) = state.connector_state(connector) else {
            continue;
        };
        if staged.crtc.is_some() != staged.best_encoder.is_some() {
            log::warn!(
                "[CONNECTOR:{}:{}] routed half way",
                connector.0,
                config.connector_name(connector)
            );
        }
        let (Some(crtc), Some(encoder_id)) = (staged.crtc, staged.best_encoder) else {
            continue;
        };
        let encoder = config.encoder(encoder_id).ok_or(ValidationError::UnknownObject {
            kind: ObjectKind::Encoder,
            id: encoder_id.0,
        })?;
        let crtc_state = state.crtc_state_mut(crtc).ok_or(NOT_STAGED)?;
        let mode = crtc_state.mode;

        if let Some(bridge) = &encoder.bridge {
            if !bridge.mode_fixup(&mode, &mut crtc_state.adjusted_mode) {
                log::debug!("Bridge fixup failed");
                return Err(ValidationError::Fixup {
                    kind: ObjectKind::Bridge,
                    id: encoder_id.0,
                }
                .into());
            }
        }

        if !encoder
            .helper
            .mode_fixup(encoder_id, &mode, &mut crtc_state.adjusted_mode)
        {
            log::debug!(
                "[ENCODER:{}:{}] fixup failed",
                encoder_id.0,
                encoder.name
            );
            return Err(ValidationError::Fixup {
                kind: ObjectKind::Encoder,
                id: encoder_id.0,
            }
            .into());
        }
    }

    for crtc in state.crtc_ids() {
        let Some(object) = config.crtc(crtc) else {
            continue;
        };
        let Some(staged) = state.crtc_state_mut(crtc) else {
            continue;
        };
        if !staged.mode_changed {
            continue;
        }
        let mode = staged.mode;
        if !object.helper.mode_fixup(crtc, &mode, &mut staged.adjusted_mode) {
            log::debug!("[CRTC:{}:{}] fixup failed", crtc.0, object.name);
            return Err(ValidationError::Fixup {
                kind: ObjectKind::Crtc,
                id: crtc.0,
            }
            .into());
        }
    }

    Ok(())
}

/// Flag the crtcs a plane leaves and lands on.
fn plane_changed(config: &ModeConfig, state: &mut AtomicState, plane: PlaneId) -> GfxResult<()> {
    if let Some(old) = config.plane(plane).and_then(|p| p.state.crtc) {
        state.get_crtc_state(config, old)?.planes_changed = true;
    }
    if let Some(new) = state.plane_state(plane).and_then(|p| p.crtc) {
        state.get_crtc_state(config, new)?.planes_changed = true;
    }
    Ok(())
}

/// Per-plane then per-crtc driver checks. The first failure wins.
pub fn check_planes(dev: &DrmDevice, state: &mut AtomicState) -> GfxResult<()> {
    let config = &dev.mode_config;

    for plane in state.plane_ids() {
        plane_changed(config, state, plane)?;

        let (Some(object), Some(staged)) = (config.plane(plane), state.plane_state(plane)) else {
            continue;
        };
        if let Err(err) = object.helper.atomic_check(plane, staged) {
            log::debug!("[PLANE:{}] atomic driver check failed", plane.0);
            return Err(err);
        }
    }

    for crtc in state.crtc_ids() {
        let (Some(object), Some(staged)) = (config.crtc(crtc), state.crtc_state(crtc)) else {
            continue;
        };
        if let Err(err) = object.helper.atomic_check(crtc, staged) {
            log::debug!("[CRTC:{}:{}] atomic check failed", crtc.0, object.name);
            return Err(err);
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{drm::object::CrtcId, testing::DisplayHarness};

    #[test]
    fn test_disable_clears_encoder() {
        let mut harness = DisplayHarness::new(1, 1, 1);
        harness.light_up(0, &[0]).unwrap();
        let dev = &harness.dev;
        let (crtc, connector) = (harness.crtcs[0], harness.connectors[0]);

        let mut state = AtomicState::new(dev);
        state.set_crtc_for_connector(&dev.mode_config, connector, None).unwrap();
        state.get_crtc_state(&dev.mode_config, crtc).unwrap().enable = false;
        check(dev, &mut state).unwrap();

        assert_eq!(state.connector_state(connector).unwrap().best_encoder, None);
        assert!(state.crtc_state(crtc).unwrap().mode_changed);
    }

    #[test]
    fn test_missing_encoder_fails_routing() {
        let harness = DisplayHarness::new(1, 1, 1);
        let dev = &harness.dev;
        harness.connector_funcs[0].route_to(None);

        let mut state = AtomicState::new(dev);
        state
            .set_crtc_for_connector(&dev.mode_config, harness.connectors[0], Some(harness.crtcs[0]))
            .unwrap();
        assert_eq!(
            check(dev, &mut state),
            Err(ValidationError::Routing { connector: 0 }.into())
        );
    }

    #[test]
    fn test_enable_without_connectors_is_inconsistent() {
        let harness = DisplayHarness::new(1, 1, 1);
        let dev = &harness.dev;

        let mut state = AtomicState::new(dev);
        let crtc_state = state.get_crtc_state(&dev.mode_config, CrtcId(0)).unwrap();
        crtc_state.enable = true;
        crtc_state.mode = DisplayHarness::mode();
        assert_eq!(
            check(dev, &mut state),
            Err(ValidationError::Consistency { crtc: 0 }.into())
        );
        // nothing committed changed
        assert!(!dev.mode_config.crtc(CrtcId(0)).unwrap().state.enable);
    }

    #[test]
    fn test_fixups_run_bridge_encoder_then_crtc() {
        let harness = DisplayHarness::new(1, 1, 1);
        let dev = &harness.dev;

        let mut state = AtomicState::new(dev);
        harness.stage_output(&mut state, 0, &[0]).unwrap();
        check(dev, &mut state).unwrap();

        let log = harness.log.calls();
        let bridge = harness.log.position("bridge:0 mode_fixup").unwrap();
        let encoder = harness.log.position("encoder:0 mode_fixup").unwrap();
        let crtc = harness.log.position("crtc:0 mode_fixup").unwrap();
        assert!(bridge < encoder && encoder < crtc, "{:?}", log);
        assert_eq!(
            state.crtc_state(CrtcId(0)).unwrap().adjusted_mode,
            DisplayHarness::mode()
        );
    }

    #[test]
    fn test_rejected_fixup_names_the_object() {
        let harness = DisplayHarness::new(1, 1, 1);
        let dev = &harness.dev;
        harness.encoder_funcs[0].reject_fixup(true);

        let mut state = AtomicState::new(dev);
        harness.stage_output(&mut state, 0, &[0]).unwrap();
        assert_eq!(
            check(dev, &mut state),
            Err(ValidationError::Fixup {
                kind: ObjectKind::Encoder,
                id: 0
            }
            .into())
        );
        assert!(harness.log.position("crtc:0 mode_fixup").is_none());
    }

    #[test]
    fn test_plane_move_flags_both_crtcs() {
        let mut harness = DisplayHarness::new(2, 2, 2);
        harness.light_up(0, &[0]).unwrap();
        harness.light_up(1, &[1]).unwrap();
        let dev = &harness.dev;
        let plane = harness.planes[0];

        let mut state = AtomicState::new(dev);
        state
            .set_crtc_for_plane(&dev.mode_config, plane, Some(harness.crtcs[1]))
            .unwrap();
        check(dev, &mut state).unwrap();
        assert!(state.crtc_state(harness.crtcs[0]).unwrap().planes_changed);
        assert!(state.crtc_state(harness.crtcs[1]).unwrap().planes_changed);
        assert!(!state.crtc_state(harness.crtcs[1]).unwrap().mode_changed);
    }

    #[test]
    fn test_plane_check_error_is_returned() {
        let mut harness = DisplayHarness::new(1, 1, 1);
        harness.light_up(0, &[0]).unwrap();
        harness.plane_funcs[0].fail_check(true);
        let dev = &harness.dev;

        let mut state = AtomicState::new(dev);
        state.get_plane_state(&dev.mode_config, harness.planes[0]).unwrap();
        assert_eq!(check(dev, &mut state), Err(GfxError::Driver { code: -22 }));
    }
}
