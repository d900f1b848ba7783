//! Hardware drivers
//!
//! Only the Intel integrated GPU address translation layer lives here for
//! now; display-side helpers are in [`crate::drm`].

pub mod i915;
