//! Kernel mode setting
//!
//! Display objects (crtcs, encoders, bridges, connectors, planes), their
//! per-object state snapshots, and the atomic transaction machinery used to
//! move a display pipeline from one validated configuration to the next.
//! The check and commit sequencing lives in [`helper`].

pub mod atomic;
pub mod funcs;
pub mod helper;
pub mod lock;
pub mod mode;
pub mod object;
pub mod state;
pub mod vblank;

pub use atomic::AtomicState;
pub use funcs::{Fence, Framebuffer, PendingEvent};
pub use mode::{DisplayMode, DpmsMode};
pub use object::{ConnectorId, CrtcId, DrmDevice, EncoderId, ModeConfig, PlaneId, PropertyId};
pub use state::{ConnectorState, CrtcState, PlaneState};
