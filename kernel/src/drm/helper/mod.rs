//! Atomic modeset helpers
//!
//! Stock implementations of the device check and commit hooks, built only
//! on the per-object callbacks in [`crate::drm::funcs`]:
//!
//! - [`check`] resolves connector routing, validates modes through the
//!   bridge, encoder and crtc fixups and runs the per-object checks.
//! - [`commit`] applies a checked transaction synchronously: disable what
//!   changes, program the new configuration, update planes, enable, then
//!   wait for the next vblank before releasing old framebuffers.
//! - [`legacy`] maps the single-object requests of the old modeset API
//!   onto one-shot transactions.

pub mod check;
pub mod commit;
pub mod legacy;

pub use check::{check, check_modeset, check_planes};
pub use commit::commit;
