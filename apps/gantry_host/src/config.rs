use gantry_bridge::BridgeConfig;
use gantry_schema::{SchemaError, Validatable};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::plugins::BUILTIN_PLUGINS;

/// Host configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[schemars(title = "Gantry Host Configuration")]
#[schemars(description = "Configuration for the Gantry bridge host")]
pub struct Config {
    /// Host name
    #[serde(default = "default_name")]
    #[schemars(description = "Human-readable name shown in the startup banner")]
    pub name: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[schemars(description = "Log level: trace, debug, info, warn, error")]
    #[schemars(regex(pattern = r"^(trace|debug|info|warn|error)$"))]
    pub log_level: String,

    /// Control-layer tick rate in Hz
    #[serde(default = "default_tick_rate")]
    #[schemars(description = "Control-layer update frequency in ticks per second", range(min = 1, max = 1000))]
    pub tick_rate: u64,

    /// Ticks to run before shutting down
    #[serde(default)]
    #[schemars(description = "Stop after this many ticks; 0 runs until Ctrl+C")]
    pub run_ticks: u64,

    /// Engine worker threads
    #[serde(default = "default_engine_workers")]
    #[schemars(description = "Number of engine worker threads calling into the bridge", range(min = 1, max = 64))]
    pub engine_workers: usize,

    /// Objects each worker spawns per tick
    #[serde(default = "default_spawns_per_tick")]
    #[schemars(description = "Engine objects each worker creates per tick", range(max = 10000))]
    pub spawns_per_tick: usize,

    /// Share of a worker's objects destroyed engine-side per tick
    #[serde(default = "default_despawn_ratio")]
    #[schemars(description = "Fraction (0.0 to 1.0) of each worker's objects the engine destroys per tick", range(min = 0.0, max = 1.0))]
    pub despawn_ratio: f64,

    /// Reclamation cadence
    #[serde(default = "default_collect_every")]
    #[schemars(description = "Engine calls collect_garbage_now every this many ticks; 0 disables it")]
    pub collect_every: u64,

    /// Plugins to load, in order
    #[serde(default = "default_plugins")]
    #[schemars(description = "Control-layer plugins to load, in load order")]
    pub plugins: Vec<String>,

    /// Bridge settings
    #[serde(default)]
    pub bridge: BridgeConfig,
}

fn default_name() -> String {
    "Gantry Host".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tick_rate() -> u64 {
    20
}

fn default_engine_workers() -> usize {
    2
}

fn default_spawns_per_tick() -> usize {
    4
}

fn default_despawn_ratio() -> f64 {
    0.25
}

fn default_collect_every() -> u64 {
    10
}

fn default_plugins() -> Vec<String> {
    vec!["census".to_string(), "janitor".to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            tick_rate: default_tick_rate(),
            run_ticks: 0,
            engine_workers: default_engine_workers(),
            spawns_per_tick: default_spawns_per_tick(),
            despawn_ratio: default_despawn_ratio(),
            collect_every: default_collect_every(),
            plugins: default_plugins(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl Validatable for Config {
    fn check(&self) -> gantry_schema::Result<()> {
        let mut seen = HashSet::new();
        for plugin in &self.plugins {
            if !BUILTIN_PLUGINS.contains(&plugin.as_str()) {
                return Err(SchemaError::InvalidValue {
                    field: "plugins".to_string(),
                    reason: format!("unknown plugin '{}' (available: {})", plugin, BUILTIN_PLUGINS.join(", ")),
                });
            }
            if !seen.insert(plugin.as_str()) {
                return Err(SchemaError::InvalidValue {
                    field: "plugins".to_string(),
                    reason: format!("plugin '{}' listed twice", plugin),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_json_str("{}").unwrap();
        assert_eq!(config.name, "Gantry Host");
        assert_eq!(config.tick_rate, 20);
        assert_eq!(config.plugins, vec!["census", "janitor"]);
        assert_eq!(config.bridge, BridgeConfig::default());
    }

    #[test]
    fn test_nested_bridge_settings() {
        let config = Config::from_json_str(
            r#"{ "engine_workers": 4, "bridge": { "record_owners": true, "reclaim_warn_threshold": 10 } }"#,
        )
        .unwrap();
        assert_eq!(config.engine_workers, 4);
        assert!(config.bridge.record_owners);
        assert_eq!(config.bridge.reclaim_warn_threshold, 10);
    }

    #[test]
    fn test_schema_rejects_out_of_range_values() {
        assert!(matches!(
            Config::from_json_str(r#"{ "tick_rate": 0 }"#),
            Err(SchemaError::ValidationError(_))
        ));
        assert!(matches!(
            Config::from_json_str(r#"{ "despawn_ratio": 1.5 }"#),
            Err(SchemaError::ValidationError(_))
        ));
        assert!(matches!(
            Config::from_json_str(r#"{ "log_level": "loud" }"#),
            Err(SchemaError::ValidationError(_))
        ));
    }

    #[test]
    fn test_unknown_and_duplicate_plugins() {
        let err = Config::from_json_str(r#"{ "plugins": ["census", "weather"] }"#).unwrap_err();
        assert!(err.to_string().contains("weather"));

        let err = Config::from_json_str(r#"{ "plugins": ["census", "census"] }"#).unwrap_err();
        assert!(err.to_string().contains("listed twice"));
    }

    #[test]
    fn test_schema_is_generated() {
        let schema = Config::schema_json().unwrap();
        assert!(schema.contains("Gantry Host Configuration"));
        assert!(schema.contains("record_owners"));
    }
}
