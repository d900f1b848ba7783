//! VeridianOS Graphics Library
//!
//! Display modesetting (atomic commit helpers) and the Intel GPU address
//! translation layer (GGTT/PPGTT), usable from the kernel and testable on
//! the host.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod drivers;
pub mod drm;
pub mod error;
pub mod raii;
pub mod testing;

pub use error::{GfxError, GfxResult, ObjectKind, ValidationError};
