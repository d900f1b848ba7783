//! Error types for the VeridianOS graphics stack
//!
//! Both the atomic modeset helpers and the i915 GTT code report failures
//! through [`GfxError`]. The taxonomy mirrors how callers are expected to
//! react: validation failures are returned before any live state changes,
//! resource exhaustion is fully unwound, lock contention is a retry signal,
//! and hardware faults are logged and not recovered.

use core::fmt;

/// Main graphics error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GfxError {
    /// The staged configuration was rejected during the check phase.
    Validation(ValidationError),

    /// Allocation or DMA mapping failure (page tables, GGTT space, ...).
    ResourceExhausted {
        resource: &'static str,
    },

    /// Deadlock-avoidance signal from the modeset lock domain. The caller
    /// must drop every lock, clear its transaction and start again.
    LockContention,

    /// Unexpected hardware behaviour.
    HardwareFault {
        device: &'static str,
        code: u32,
    },

    /// Request cannot be serviced right now (asynchronous commit).
    Busy {
        operation: &'static str,
    },

    /// Generic errors
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    NotFound {
        resource: &'static str,
        id: u64,
    },
    OperationNotSupported {
        operation: &'static str,
    },

    /// Error code handed back by a driver callback (prepare_fb,
    /// atomic_check, set_property, ...).
    Driver {
        code: i32,
    },
}

/// Kinds of display objects, used to tag validation failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Crtc,
    Connector,
    Encoder,
    Bridge,
    Plane,
}

/// Check-phase failures. None of these leave side effects on live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    /// No suitable encoder for a connector that requested a crtc.
    Routing { connector: u32 },
    /// A bridge, encoder or crtc refused the requested mode.
    Fixup { kind: ObjectKind, id: u32 },
    /// A crtc's enable flag disagrees with the number of routed connectors.
    Consistency { crtc: u32 },
    /// A staged reference points at an object the device doesn't have.
    UnknownObject { kind: ObjectKind, id: u32 },
    /// Page flips that are not synchronized to vblank.
    AsyncFlip,
}

/// Result type alias for graphics operations
pub type GfxResult<T> = Result<T, GfxError>;

impl GfxError {
    /// Whether the error is the lock domain's backoff signal.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Self::LockContention)
    }
}

impl fmt::Display for GfxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "Validation failed: {}", e),
            Self::ResourceExhausted { resource } => write!(f, "Resource exhausted: {}", resource),
            Self::LockContention => write!(f, "Modeset lock contention, backoff required"),
            Self::HardwareFault { device, code } => {
                write!(f, "Hardware fault on {}: code 0x{:x}", device, code)
            }
            Self::Busy { operation } => write!(f, "Busy: {}", operation),
            Self::InvalidArgument { name, value } => {
                write!(f, "Invalid argument '{}': {}", name, value)
            }
            Self::NotFound { resource, id } => write!(f, "{} with id {} not found", resource, id),
            Self::OperationNotSupported { operation } => {
                write!(f, "Operation not supported: {}", operation)
            }
            Self::Driver { code } => write!(f, "Driver callback failed with code {}", code),
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crtc => write!(f, "CRTC"),
            Self::Connector => write!(f, "CONNECTOR"),
            Self::Encoder => write!(f, "ENCODER"),
            Self::Bridge => write!(f, "BRIDGE"),
            Self::Plane => write!(f, "PLANE"),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Routing { connector } => {
                write!(f, "no suitable encoder for [CONNECTOR:{}]", connector)
            }
            Self::Fixup { kind, id } => write!(f, "[{}:{}] mode fixup failed", kind, id),
            Self::Consistency { crtc } => {
                write!(f, "[CRTC:{}] enabled/connectors mismatch", crtc)
            }
            Self::UnknownObject { kind, id } => write!(f, "unknown [{}:{}]", kind, id),
            Self::AsyncFlip => write!(f, "async page flips are not supported"),
        }
    }
}

// Conversion implementations
impl From<ValidationError> for GfxError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}
