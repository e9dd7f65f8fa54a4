use serde_json::{json, Value};

use crate::error::Result;
use crate::proxy::{Proxy, ProxyCore, ProxyType};

/// Any placeable engine object
pub struct ActorProxy {
    core: ProxyCore,
}

impl ActorProxy {
    pub fn name(&self) -> Result<String> {
        let name: Option<String> = self.core.call_as("get_name", Value::Null)?;
        Ok(name.unwrap_or_default())
    }

    pub fn set_name(&self, name: &str) -> Result<()> {
        self.core.call("set_name", json!(name))?;
        Ok(())
    }

    /// World position, origin when the engine has none recorded
    pub fn position(&self) -> Result<[f64; 3]> {
        let position: Option<[f64; 3]> = self.core.call_as("get_position", Value::Null)?;
        Ok(position.unwrap_or([0.0; 3]))
    }

    pub fn set_position(&self, position: [f64; 3]) -> Result<()> {
        self.core.call("set_position", json!(position))?;
        Ok(())
    }

    /// Remove the actor from the world
    pub fn despawn(&self) -> bool {
        self.core.destroy()
    }
}

impl Proxy for ActorProxy {
    fn core(&self) -> &ProxyCore {
        &self.core
    }

    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }
}

impl ProxyType for ActorProxy {
    const TYPE_NAME: &'static str = "Actor";

    fn from_core(core: ProxyCore) -> Self {
        Self { core }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Bridge;
    use crate::config::BridgeConfig;
    use crate::factory::FactoryTable;
    use crate::sim::SimEngine;
    use std::sync::Arc;

    fn bridge() -> (Arc<SimEngine>, Bridge) {
        let engine = Arc::new(SimEngine::new());
        let mut builder = FactoryTable::builder();
        builder.register_type::<ActorProxy>().unwrap();
        (engine.clone(), Bridge::new(engine, builder.build(), BridgeConfig::default()))
    }

    #[test]
    fn test_properties_round_trip_through_engine() {
        let (engine, bridge) = bridge();
        let actor = bridge.create::<ActorProxy>().unwrap();
        let ptr = actor.core().pointer().unwrap();

        actor.set_name("lamp").unwrap();
        actor.set_position([1.0, 2.0, 3.5]).unwrap();

        assert_eq!(actor.name().unwrap(), "lamp");
        assert_eq!(actor.position().unwrap(), [1.0, 2.0, 3.5]);
        assert_eq!(engine.property(ptr, "name"), Some(json!("lamp")));
    }

    #[test]
    fn test_defaults_when_engine_has_no_value() {
        let (_engine, bridge) = bridge();
        let actor = bridge.create::<ActorProxy>().unwrap();
        assert_eq!(actor.name().unwrap(), "");
        assert_eq!(actor.position().unwrap(), [0.0; 3]);
    }

    #[test]
    fn test_despawn_deletes_engine_object() {
        let (engine, bridge) = bridge();
        let actor = bridge.create::<ActorProxy>().unwrap();
        let ptr = actor.core().pointer().unwrap();

        assert!(actor.despawn());
        assert!(engine.is_freed(ptr));
        assert!(!actor.despawn());
    }
}
