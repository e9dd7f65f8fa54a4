use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::Result;
use crate::proxies::{resolve_returned, ActorProxy};
use crate::proxy::{downcast_proxy, Proxy, ProxyCore, ProxyType};

/// An actor that can be possessed by a controller
pub struct PawnProxy {
    core: ProxyCore,
}

impl PawnProxy {
    /// The actor currently controlling this pawn, if any
    pub fn controller(&self) -> Result<Option<Arc<ActorProxy>>> {
        let value = self.core.call("get_controller", Value::Null)?;
        let controller = resolve_returned(&self.core, "get_controller", value)?;
        Ok(controller.and_then(|proxy| downcast_proxy::<ActorProxy>(&proxy)))
    }

    pub fn possess(&self, controller: &ActorProxy) -> Result<()> {
        let ptr = controller.core().require_pointer()?;
        self.core.call("set_controller", json!(ptr.addr()))?;
        Ok(())
    }

    pub fn health(&self) -> Result<f64> {
        let health: Option<f64> = self.core.call_as("get_health", Value::Null)?;
        Ok(health.unwrap_or(0.0))
    }
}

impl Proxy for PawnProxy {
    fn core(&self) -> &ProxyCore {
        &self.core
    }

    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }
}

impl ProxyType for PawnProxy {
    const TYPE_NAME: &'static str = "Pawn";

    fn from_core(core: ProxyCore) -> Self {
        Self { core }
    }
}
