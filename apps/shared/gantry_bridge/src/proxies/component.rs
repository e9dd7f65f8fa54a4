use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::proxies::resolve_returned;
use crate::proxy::{Proxy, ProxyCore, ProxyType};

/// A component attached to some owning actor
pub struct ComponentProxy {
    core: ProxyCore,
}

impl ComponentProxy {
    /// Owning object, resolved to whatever proxy type the engine declares
    pub fn owner(&self) -> Result<Option<Arc<dyn Proxy>>> {
        let value = self.core.call("get_owner", Value::Null)?;
        resolve_returned(&self.core, "get_owner", value)
    }

    pub fn is_active(&self) -> Result<bool> {
        let active: Option<bool> = self.core.call_as("get_active", Value::Null)?;
        Ok(active.unwrap_or(true))
    }
}

impl Proxy for ComponentProxy {
    fn core(&self) -> &ProxyCore {
        &self.core
    }

    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }
}

impl ProxyType for ComponentProxy {
    const TYPE_NAME: &'static str = "Component";

    fn from_core(core: ProxyCore) -> Self {
        Self { core }
    }
}
