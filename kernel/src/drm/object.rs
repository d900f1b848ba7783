//! Display objects and the device that owns them
//!
//! Objects reference each other through typed indices into the
//! [`ModeConfig`] tables, never through pointers. Each object carries its
//! committed state; a transaction stages duplicates of those states and
//! swaps them in on commit.

use alloc::{boxed::Box, string::String, sync::Arc, vec::Vec};
use core::fmt;

use super::{
    funcs::{
        BridgeFuncs, ConnectorHelperFuncs, CrtcHelperFuncs, EncoderHelperFuncs, Framebuffer,
        HelperModeConfig, ModeConfigFuncs, PlaneHelperFuncs,
    },
    lock::ModesetLockDomain,
    mode::DisplayMode,
    state::{ConnectorState, CrtcState, PlaneState},
    vblank::VblankService,
};

macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident, $tag:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl $name {
            /// Position in the owning table.
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!("[", $tag, ":{}]"), self.0)
            }
        }
    };
}

object_id!(
    /// Scanout engine
    CrtcId,
    "CRTC"
);
object_id!(
    /// Output signal generator
    EncoderId,
    "ENCODER"
);
object_id!(
    /// Physical output
    ConnectorId,
    "CONNECTOR"
);
object_id!(
    /// Framebuffer source
    PlaneId,
    "PLANE"
);
object_id!(
    /// Driver-defined object property
    PropertyId,
    "PROP"
);

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

pub struct Crtc {
    pub id: CrtcId,
    pub name: String,
    pub primary: Option<PlaneId>,
    pub helper: Arc<dyn CrtcHelperFuncs>,
    pub state: Box<CrtcState>,
    /// Legacy mirror of the committed mode, kept for old-style callers.
    pub mode: DisplayMode,
    pub enabled: bool,
    pub x: u32,
    pub y: u32,
}

pub struct Encoder {
    pub id: EncoderId,
    pub name: String,
    pub helper: Arc<dyn EncoderHelperFuncs>,
    pub bridge: Option<Arc<dyn BridgeFuncs>>,
    /// Legacy routing link
    pub crtc: Option<CrtcId>,
}

pub struct Connector {
    pub id: ConnectorId,
    pub name: String,
    pub helper: Arc<dyn ConnectorHelperFuncs>,
    pub state: Box<ConnectorState>,
    /// Legacy routing link
    pub encoder: Option<EncoderId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneType {
    Primary,
    Overlay,
    Cursor,
}

pub struct Plane {
    pub id: PlaneId,
    pub kind: PlaneType,
    pub helper: Arc<dyn PlaneHelperFuncs>,
    pub state: Box<PlaneState>,
    /// Legacy crtc and framebuffer as seen by old-style callers.
    pub crtc: Option<CrtcId>,
    pub fb: Option<Arc<Framebuffer>>,
    /// Framebuffer being replaced by an in-flight legacy update.
    pub old_fb: Option<Arc<Framebuffer>>,
}

// ---------------------------------------------------------------------------
// Object tables
// ---------------------------------------------------------------------------

/// Every display object of one device.
#[derive(Default)]
pub struct ModeConfig {
    pub(crate) crtcs: Vec<Crtc>,
    pub(crate) encoders: Vec<Encoder>,
    pub(crate) connectors: Vec<Connector>,
    pub(crate) planes: Vec<Plane>,
}

impl ModeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_plane(&mut self, kind: PlaneType, helper: Arc<dyn PlaneHelperFuncs>) -> PlaneId {
        let id = PlaneId(self.planes.len() as u32);
        self.planes.push(Plane {
            id,
            kind,
            helper,
            state: PlaneState::reset(),
            crtc: None,
            fb: None,
            old_fb: None,
        });
        id
    }

    pub fn add_crtc(
        &mut self,
        name: &str,
        primary: Option<PlaneId>,
        helper: Arc<dyn CrtcHelperFuncs>,
    ) -> CrtcId {
        let id = CrtcId(self.crtcs.len() as u32);
        self.crtcs.push(Crtc {
            id,
            name: String::from(name),
            primary,
            helper,
            state: CrtcState::reset(),
            mode: DisplayMode::default(),
            enabled: false,
            x: 0,
            y: 0,
        });
        id
    }

    pub fn add_encoder(
        &mut self,
        name: &str,
        helper: Arc<dyn EncoderHelperFuncs>,
        bridge: Option<Arc<dyn BridgeFuncs>>,
    ) -> EncoderId {
        let id = EncoderId(self.encoders.len() as u32);
        self.encoders.push(Encoder {
            id,
            name: String::from(name),
            helper,
            bridge,
            crtc: None,
        });
        id
    }

    pub fn add_connector(&mut self, name: &str, helper: Arc<dyn ConnectorHelperFuncs>) -> ConnectorId {
        let id = ConnectorId(self.connectors.len() as u32);
        self.connectors.push(Connector {
            id,
            name: String::from(name),
            helper,
            state: ConnectorState::reset(),
            encoder: None,
        });
        id
    }

    pub fn crtc(&self, id: CrtcId) -> Option<&Crtc> {
        self.crtcs.get(id.index())
    }

    pub fn crtc_mut(&mut self, id: CrtcId) -> Option<&mut Crtc> {
        self.crtcs.get_mut(id.index())
    }

    pub fn encoder(&self, id: EncoderId) -> Option<&Encoder> {
        self.encoders.get(id.index())
    }

    pub fn connector(&self, id: ConnectorId) -> Option<&Connector> {
        self.connectors.get(id.index())
    }

    pub fn connector_mut(&mut self, id: ConnectorId) -> Option<&mut Connector> {
        self.connectors.get_mut(id.index())
    }

    pub fn plane(&self, id: PlaneId) -> Option<&Plane> {
        self.planes.get(id.index())
    }

    pub fn plane_mut(&mut self, id: PlaneId) -> Option<&mut Plane> {
        self.planes.get_mut(id.index())
    }

    pub fn crtcs(&self) -> &[Crtc] {
        &self.crtcs
    }

    pub fn encoders(&self) -> &[Encoder] {
        &self.encoders
    }

    pub fn connectors(&self) -> &[Connector] {
        &self.connectors
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    /// Put every object back into its power-on state.
    pub fn reset(&mut self) {
        for crtc in &mut self.crtcs {
            crtc.state = CrtcState::reset();
        }
        for connector in &mut self.connectors {
            connector.state = ConnectorState::reset();
        }
        for plane in &mut self.planes {
            plane.state = PlaneState::reset();
        }
    }

    /// Connector whose committed state routes through `encoder`.
    pub fn committed_owner(&self, encoder: EncoderId) -> Option<ConnectorId> {
        self.connectors
            .iter()
            .find(|c| c.state.best_encoder == Some(encoder))
            .map(|c| c.id)
    }

    /// Crtc `encoder` drives in the committed configuration.
    pub fn current_crtc_for_encoder(&self, encoder: EncoderId) -> Option<CrtcId> {
        let owner = self.committed_owner(encoder)?;
        self.connectors[owner.index()].state.crtc
    }

    pub fn crtc_name(&self, id: CrtcId) -> &str {
        self.crtc(id).map_or("?", |c| c.name.as_str())
    }

    pub fn encoder_name(&self, id: EncoderId) -> &str {
        self.encoder(id).map_or("?", |e| e.name.as_str())
    }

    pub fn connector_name(&self, id: ConnectorId) -> &str {
        self.connector(id).map_or("?", |c| c.name.as_str())
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// A display device: its objects plus the services the helpers use.
pub struct DrmDevice {
    pub mode_config: ModeConfig,
    pub locks: Arc<dyn ModesetLockDomain>,
    pub vblank: Arc<dyn VblankService>,
    pub funcs: Arc<dyn ModeConfigFuncs>,
}

impl DrmDevice {
    /// A device whose check and commit are the stock helpers.
    pub fn new(locks: Arc<dyn ModesetLockDomain>, vblank: Arc<dyn VblankService>) -> Self {
        Self::with_funcs(locks, vblank, Arc::new(HelperModeConfig))
    }

    pub fn with_funcs(
        locks: Arc<dyn ModesetLockDomain>,
        vblank: Arc<dyn VblankService>,
        funcs: Arc<dyn ModeConfigFuncs>,
    ) -> Self {
        Self {
            mode_config: ModeConfig::new(),
            locks,
            vblank,
            funcs,
        }
    }
}
