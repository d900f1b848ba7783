//! Atomic transactions
//!
//! An [`AtomicState`] collects staged states for the objects a request
//! touches. Pulling an object in takes its modeset lock and duplicates its
//! committed state; nothing live changes until the commit swaps the staged
//! states into the objects. From then on the transaction holds the states
//! that *were* committed, which the commit helpers use to tear down the
//! old configuration.

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec};

use super::{
    funcs::Framebuffer,
    lock::{AcquireCtx, ModesetLockDomain, ModesetLockId},
    object::{ConnectorId, CrtcId, DrmDevice, EncoderId, ModeConfig, PlaneId},
    state::{ConnectorState, CrtcState, PlaneState},
};
use crate::error::{GfxError, GfxResult, ObjectKind, ValidationError};

fn unknown(kind: ObjectKind, id: u32) -> GfxError {
    ValidationError::UnknownObject { kind, id }.into()
}

fn slot<T>(states: &mut Vec<Option<T>>, index: usize) -> &mut Option<T> {
    if index >= states.len() {
        states.resize_with(index + 1, || None);
    }
    &mut states[index]
}

/// One modeset or page flip in the making.
pub struct AtomicState {
    crtc_states: Vec<Option<Box<CrtcState>>>,
    connector_states: Vec<Option<Box<ConnectorState>>>,
    plane_states: Vec<Option<Box<PlaneState>>>,
    /// Staged encoder routing, kept in step with every connector state in
    /// the transaction.
    encoder_owner: BTreeMap<EncoderId, ConnectorId>,
    locks: Arc<dyn ModesetLockDomain>,
    ctx: AcquireCtx,
    swapped: bool,
}

impl AtomicState {
    pub fn new(dev: &DrmDevice) -> Self {
        let config = &dev.mode_config;
        let mut crtc_states = Vec::new();
        crtc_states.resize_with(config.crtcs().len(), || None);
        let mut connector_states = Vec::new();
        connector_states.resize_with(config.connectors().len(), || None);
        let mut plane_states = Vec::new();
        plane_states.resize_with(config.planes().len(), || None);

        Self {
            crtc_states,
            connector_states,
            plane_states,
            encoder_owner: BTreeMap::new(),
            locks: dev.locks.clone(),
            ctx: dev.locks.new_ctx(),
            swapped: false,
        }
    }

    pub fn ctx(&self) -> &AcquireCtx {
        &self.ctx
    }

    /// Whether the commit has swapped the staged states in.
    pub fn is_swapped(&self) -> bool {
        self.swapped
    }

    fn check_open(&self) -> GfxResult<()> {
        if self.swapped {
            return Err(GfxError::InvalidArgument {
                name: "state",
                value: "transaction already committed",
            });
        }
        Ok(())
    }

    pub fn lock(&mut self, lock: ModesetLockId) -> GfxResult<()> {
        self.locks.lock(&mut self.ctx, lock)
    }

    /// Take every modeset lock of the device.
    pub fn lock_all(&mut self, config: &ModeConfig) -> GfxResult<()> {
        self.lock(ModesetLockId::ConnectionMutex)?;
        for crtc in config.crtcs() {
            self.lock(ModesetLockId::Crtc(crtc.id))?;
        }
        for plane in config.planes() {
            self.lock(ModesetLockId::Plane(plane.id))?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pulling objects in
    // -----------------------------------------------------------------------

    /// Staged state of `crtc`, adding it to the transaction if needed.
    pub fn get_crtc_state(&mut self, config: &ModeConfig, crtc: CrtcId) -> GfxResult<&mut CrtcState> {
        self.check_open()?;
        let committed = config.crtc(crtc).ok_or_else(|| unknown(ObjectKind::Crtc, crtc.0))?;
        if slot(&mut self.crtc_states, crtc.index()).is_none() {
            self.lock(ModesetLockId::Crtc(crtc))?;
            log::debug!("Added [CRTC:{}:{}] state to transaction", crtc.0, committed.name);
        }
        Ok(self.crtc_states[crtc.index()]
            .get_or_insert_with(|| committed.state.duplicate())
            .as_mut())
    }

    pub fn get_plane_state(&mut self, config: &ModeConfig, plane: PlaneId) -> GfxResult<&mut PlaneState> {
        self.check_open()?;
        let committed = config.plane(plane).ok_or_else(|| unknown(ObjectKind::Plane, plane.0))?;
        if slot(&mut self.plane_states, plane.index()).is_none() {
            self.lock(ModesetLockId::Plane(plane))?;
            log::debug!("Added [PLANE:{}] state to transaction", plane.0);
        }
        Ok(self.plane_states[plane.index()]
            .get_or_insert_with(|| committed.state.duplicate())
            .as_mut())
    }

    /// Staged state of `connector`. A connector that is lit pulls its crtc
    /// in as well.
    pub fn get_connector_state(
        &mut self,
        config: &ModeConfig,
        connector: ConnectorId,
    ) -> GfxResult<&mut ConnectorState> {
        self.check_open()?;
        let committed = config
            .connector(connector)
            .ok_or_else(|| unknown(ObjectKind::Connector, connector.0))?;
        if slot(&mut self.connector_states, connector.index()).is_none() {
            self.lock(ModesetLockId::ConnectionMutex)?;
            if let Some(encoder) = committed.state.best_encoder {
                self.encoder_owner.entry(encoder).or_insert(connector);
            }
            self.connector_states[connector.index()] = Some(committed.state.duplicate());
            log::debug!(
                "Added [CONNECTOR:{}:{}] state to transaction",
                connector.0,
                committed.name
            );
            // the crtc driving the connector comes along
            if let Some(crtc) = committed.state.crtc {
                self.get_crtc_state(config, crtc)?;
            }
        }
        Ok(self.connector_states[connector.index()]
            .get_or_insert_with(|| committed.state.duplicate())
            .as_mut())
    }

    // -----------------------------------------------------------------------
    // Staged state accessors
    // -----------------------------------------------------------------------
    //
    // Before the swap these return staged states, afterwards the old ones.

    pub fn crtc_state(&self, crtc: CrtcId) -> Option<&CrtcState> {
        self.crtc_states.get(crtc.index())?.as_deref()
    }

    pub fn crtc_state_mut(&mut self, crtc: CrtcId) -> Option<&mut CrtcState> {
        self.crtc_states.get_mut(crtc.index())?.as_deref_mut()
    }

    pub fn connector_state(&self, connector: ConnectorId) -> Option<&ConnectorState> {
        self.connector_states.get(connector.index())?.as_deref()
    }

    pub fn plane_state(&self, plane: PlaneId) -> Option<&PlaneState> {
        self.plane_states.get(plane.index())?.as_deref()
    }

    pub fn plane_state_mut(&mut self, plane: PlaneId) -> Option<&mut PlaneState> {
        self.plane_states.get_mut(plane.index())?.as_deref_mut()
    }

    /// Crtcs in the transaction, in index order.
    pub fn crtc_ids(&self) -> Vec<CrtcId> {
        ids(&self.crtc_states, CrtcId)
    }

    pub fn connector_ids(&self) -> Vec<ConnectorId> {
        ids(&self.connector_states, ConnectorId)
    }

    pub fn plane_ids(&self) -> Vec<PlaneId> {
        ids(&self.plane_states, PlaneId)
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    pub fn set_crtc_for_connector(
        &mut self,
        config: &ModeConfig,
        connector: ConnectorId,
        crtc: Option<CrtcId>,
    ) -> GfxResult<()> {
        if let Some(crtc) = crtc {
            self.get_crtc_state(config, crtc)?;
        }
        self.get_connector_state(config, connector)?.crtc = crtc;
        match crtc {
            Some(crtc) => log::debug!(
                "Link [CONNECTOR:{}:{}] to [CRTC:{}:{}]",
                connector.0,
                config.connector_name(connector),
                crtc.0,
                config.crtc_name(crtc)
            ),
            None => log::debug!(
                "Link [CONNECTOR:{}:{}] to [NOCRTC]",
                connector.0,
                config.connector_name(connector)
            ),
        }
        Ok(())
    }

    /// Route `connector` through `encoder`, keeping the reverse index in
    /// step. The connector must already be in the transaction.
    pub fn set_best_encoder(&mut self, connector: ConnectorId, encoder: Option<EncoderId>) -> GfxResult<()> {
        let state = self
            .connector_states
            .get_mut(connector.index())
            .and_then(Option::as_deref_mut)
            .ok_or(GfxError::InvalidArgument {
                name: "connector",
                value: "not part of the transaction",
            })?;
        let previous = core::mem::replace(&mut state.best_encoder, encoder);

        if let Some(previous) = previous {
            if self.encoder_owner.get(&previous) == Some(&connector) {
                self.encoder_owner.remove(&previous);
            }
        }
        if let Some(encoder) = encoder {
            self.encoder_owner.insert(encoder, connector);
        }
        Ok(())
    }

    /// Staged owner of `encoder` recorded in the reverse index.
    pub fn encoder_owner(&self, encoder: EncoderId) -> Option<ConnectorId> {
        self.encoder_owner.get(&encoder).copied()
    }

    /// Connector that drives `encoder` once this transaction is applied as
    /// it stands: the staged owner, or the committed one if that connector
    /// hasn't been pulled in.
    pub fn effective_owner(&self, config: &ModeConfig, encoder: EncoderId) -> Option<ConnectorId> {
        if let Some(owner) = self.encoder_owner(encoder) {
            return Some(owner);
        }
        let committed = config.committed_owner(encoder)?;
        self.connector_state(committed).is_none().then_some(committed)
    }

    /// Pull in every connector currently driven by `crtc`.
    pub fn add_affected_connectors(&mut self, config: &ModeConfig, crtc: CrtcId) -> GfxResult<()> {
        self.lock(ModesetLockId::ConnectionMutex)?;
        log::debug!(
            "Adding all current connectors for [CRTC:{}:{}] to transaction",
            crtc.0,
            config.crtc_name(crtc)
        );
        for connector in config.connectors() {
            if connector.state.crtc == Some(crtc) {
                self.get_connector_state(config, connector.id)?;
            }
        }
        Ok(())
    }

    /// Connectors of the transaction staged onto `crtc`.
    pub fn connectors_for_crtc(&self, crtc: CrtcId) -> usize {
        self.connector_states
            .iter()
            .flatten()
            .filter(|s| s.crtc == Some(crtc))
            .count()
    }

    // -----------------------------------------------------------------------
    // Planes
    // -----------------------------------------------------------------------

    pub fn set_crtc_for_plane(
        &mut self,
        config: &ModeConfig,
        plane: PlaneId,
        crtc: Option<CrtcId>,
    ) -> GfxResult<()> {
        if let Some(crtc) = crtc {
            self.get_crtc_state(config, crtc)?;
        }
        self.get_plane_state(config, plane)?.crtc = crtc;
        Ok(())
    }

    pub fn set_fb_for_plane(
        &mut self,
        config: &ModeConfig,
        plane: PlaneId,
        fb: Option<Arc<Framebuffer>>,
    ) -> GfxResult<()> {
        self.get_plane_state(config, plane)?.fb = fb;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Exchange staged and committed states object by object: connectors,
    /// then crtcs, then planes.
    pub(crate) fn swap_into(&mut self, config: &mut ModeConfig) {
        for (state, connector) in self.connector_states.iter_mut().zip(&mut config.connectors) {
            if let Some(state) = state {
                core::mem::swap(state, &mut connector.state);
            }
        }
        for (state, crtc) in self.crtc_states.iter_mut().zip(&mut config.crtcs) {
            if let Some(state) = state {
                core::mem::swap(state, &mut crtc.state);
            }
        }
        for (state, plane) in self.plane_states.iter_mut().zip(&mut config.planes) {
            if let Some(state) = state {
                core::mem::swap(state, &mut plane.state);
            }
        }
        self.swapped = true;
    }

    /// Drop every staged state. Locks stay held.
    pub fn clear(&mut self) {
        self.crtc_states.iter_mut().for_each(|s| *s = None);
        self.connector_states.iter_mut().for_each(|s| *s = None);
        self.plane_states.iter_mut().for_each(|s| *s = None);
        self.encoder_owner.clear();
        self.swapped = false;
    }

    /// Release every lock and wait for the one that caused contention.
    pub fn backoff(&mut self) {
        self.locks.backoff(&mut self.ctx);
    }
}

impl Drop for AtomicState {
    fn drop(&mut self) {
        self.locks.release_all(&mut self.ctx);
    }
}

fn ids<T, I>(states: &[Option<T>], make: impl Fn(u32) -> I) -> Vec<I> {
    states
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_some())
        .map(|(i, _)| make(i as u32))
        .collect()
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Validate `state` through the device's check hook without applying it.
pub fn check_only(dev: &DrmDevice, state: &mut AtomicState) -> GfxResult<()> {
    let funcs = dev.funcs.clone();
    funcs.atomic_check(dev, state)
}

/// Check and apply `state`, blocking until the hardware has it.
pub fn commit(dev: &mut DrmDevice, state: &mut AtomicState) -> GfxResult<()> {
    let funcs = dev.funcs.clone();
    funcs.atomic_check(dev, state)?;
    funcs.atomic_commit(dev, state, false)
}

/// Check and queue `state` without waiting.
pub fn async_commit(dev: &mut DrmDevice, state: &mut AtomicState) -> GfxResult<()> {
    let funcs = dev.funcs.clone();
    funcs.atomic_check(dev, state)?;
    funcs.atomic_commit(dev, state, true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
