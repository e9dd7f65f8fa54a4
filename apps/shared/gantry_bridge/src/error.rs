use thiserror::Error;

use crate::handle::{ForeignPtr, ProxyId};
use crate::type_tag::TypeTag;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failures reported by the engine through the `ForeignEngine` seam
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Object {0} was destroyed by the engine")]
    Destroyed(ForeignPtr),

    #[error("Object {0} is not known to the engine")]
    UnknownObject(ForeignPtr),

    #[error("Engine cannot construct objects of type {0}")]
    Unsupported(TypeTag),

    #[error("Engine call '{method}' failed: {reason}")]
    CallFailed { method: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Type tag {tag} is already registered for '{existing}' (while registering '{name}')")]
    DuplicateTypeTag {
        tag: TypeTag,
        existing: String,
        name: String,
    },

    #[error("On-create hook registered for type tag {0} which has no factory")]
    HookWithoutFactory(TypeTag),

    #[error("No factory registered for type tag {tag} (pointer {ptr})")]
    UnknownTypeTag { tag: TypeTag, ptr: ForeignPtr },

    #[error("Engine could not resolve the type of pointer {0}")]
    UnresolvedPointer(ForeignPtr),

    #[error("Null pointer passed across the boundary")]
    NullPointer,

    #[error("Pointer {ptr} is already bound to {existing}")]
    AlreadyBound { ptr: ForeignPtr, existing: ProxyId },

    #[error("Cannot attach with mode Unbound; use unbind instead")]
    UnboundAttach,

    #[error("{0} has been disposed")]
    Disposed(ProxyId),

    #[error("{0} is not attached to a foreign object")]
    Detached(ProxyId),

    #[error("Foreign object {0} no longer exists")]
    ObjectDestroyed(ForeignPtr),

    #[error("Re-entrant creation of a proxy for {0} on the creating thread")]
    ReentrantCreation(ForeignPtr),

    #[error("Proxy for {ptr} is a {actual}, not a {expected}")]
    TypeMismatch {
        ptr: ForeignPtr,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Unexpected value returned by '{method}': {reason}")]
    BadReturn { method: String, reason: String },

    #[error("The bridge has been shut down")]
    BridgeShutdown,

    #[error("Boundary callbacks are already installed")]
    AlreadyInstalled,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl BridgeError {
    /// Errors that must abort the process when raised inside a boundary callback
    ///
    /// Dropping an object the bridge cannot type would leave the engine and
    /// the control layer disagreeing about which objects exist.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::DuplicateTypeTag { .. }
                | BridgeError::UnknownTypeTag { .. }
                | BridgeError::UnresolvedPointer(_)
        )
    }
}
