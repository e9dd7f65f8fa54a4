//! Built-in proxy types
//!
//! Each type registers itself under its own name; hosts call
//! [`register_builtin`] once while building the factory.

mod actor;
mod component;
mod pawn;

pub use actor::ActorProxy;
pub use component::ComponentProxy;
pub use pawn::PawnProxy;

use serde_json::Value;
use std::sync::Arc;

use crate::error::{BridgeError, Result};
use crate::factory::FactoryBuilder;
use crate::handle::ForeignPtr;
use crate::proxy::{Proxy, ProxyCore};

/// Register every built-in proxy type
pub fn register_builtin(builder: &mut FactoryBuilder) -> Result<()> {
    builder
        .register_type::<ActorProxy>()?
        .register_type::<PawnProxy>()?
        .register_type::<ComponentProxy>()?;
    Ok(())
}

/// Interpret a method's return value as an object reference and resolve it
///
/// The engine returns references as integer addresses, with `null` or `0`
/// meaning "none".
pub(crate) fn resolve_returned(core: &ProxyCore, method: &str, value: Value) -> Result<Option<Arc<dyn Proxy>>> {
    let addr = match value {
        Value::Null => return Ok(None),
        Value::Number(n) => n.as_u64().ok_or_else(|| BridgeError::BadReturn {
            method: method.to_string(),
            reason: format!("{} is not an address", n),
        })?,
        other => {
            return Err(BridgeError::BadReturn {
                method: method.to_string(),
                reason: format!("expected an address, got {}", other),
            })
        }
    };

    let ptr = ForeignPtr::from_addr(addr as usize);
    if ptr.is_null() {
        return Ok(None);
    }
    let bridge = core.bridge().ok_or(BridgeError::BridgeShutdown)?;
    bridge.resolve(ptr).map(Some)
}
