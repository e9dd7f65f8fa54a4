//! The seam through which the bridge talks to the foreign engine
//!
//! Everything the bridge knows about an engine object it learns through this
//! trait. Implementations are the C vtable adapter (`ffi::FfiEngine`) for a
//! real native loader and, behind the `sim` feature, the in-process
//! `sim::SimEngine`.

use serde_json::Value;

use crate::error::EngineError;
use crate::handle::{CallbackId, ForeignPtr, HandleToken};
use crate::type_tag::TypeTag;

/// Operations the bridge issues against engine-owned objects
///
/// # Re-entrancy
///
/// `set_handle`, `retain`, `release` and `delete` are called while the
/// bridge holds its handle-table lock. Implementations must not call back
/// into the bridge from inside them; an engine that wants to react (for
/// example by releasing a handle) has to defer the reaction to its own next
/// safe point.
///
/// # Threads
///
/// Every method may be called from any thread, including engine worker
/// threads that are themselves inside a boundary callback.
pub trait ForeignEngine: Send + Sync {
    /// Declared type of the object at `ptr`, or `None` if the engine does not know it
    fn type_tag(&self, ptr: ForeignPtr) -> Option<TypeTag>;

    /// Liveness flag of the object; unknown pointers count as destroyed
    fn is_destroyed(&self, ptr: ForeignPtr) -> bool;

    /// Install (`token`) or clear (`HandleToken::NONE`) the cross-reference
    /// the engine keeps from its object back to the proxy
    fn set_handle(&self, ptr: ForeignPtr, token: HandleToken);

    /// The first ownership token for `ptr` was issued
    fn retain(&self, ptr: ForeignPtr);

    /// The last outstanding ownership token for `ptr` was retired
    fn release(&self, ptr: ForeignPtr);

    /// Request deletion of the object; the engine frees it once no holds remain
    fn delete(&self, ptr: ForeignPtr);

    /// Construct a new engine object of the given type for the control layer
    fn create(&self, tag: TypeTag) -> Result<ForeignPtr, EngineError>;

    /// Invoke a method on the object
    fn invoke(&self, ptr: ForeignPtr, method: &str, args: &Value) -> Result<Value, EngineError>;

    /// Register an engine-side callback for `event` on the object
    fn subscribe(&self, ptr: ForeignPtr, event: &str) -> Result<CallbackId, EngineError>;

    /// Remove a callback installed by `subscribe`
    fn unsubscribe(&self, ptr: ForeignPtr, callback: CallbackId);
}
