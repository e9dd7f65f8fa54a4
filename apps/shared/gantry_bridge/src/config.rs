use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Runtime switches of the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// Record who asked for each ownership token
    #[serde(default)]
    #[schemars(description = "Record the source location or boundary label of every ownership token for leak reports")]
    pub record_owners: bool,

    /// Pending finalizations above which a warning is logged
    #[serde(default = "default_reclaim_warn_threshold")]
    #[schemars(description = "Number of queued finalizations that triggers a warning; 0 disables the warning")]
    pub reclaim_warn_threshold: usize,

    /// Run a reclamation pass after every engine-initiated release
    #[serde(default)]
    #[schemars(description = "Run a reclamation pass after every release_handle call from the engine")]
    pub collect_on_release: bool,

    /// Ask the engine for liveness before each proxy call
    #[serde(default)]
    #[schemars(description = "Query the engine's destroyed flag before every proxy method call instead of relying on the call's own error")]
    pub verify_destroyed_on_call: bool,
}

fn default_reclaim_warn_threshold() -> usize {
    1024
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            record_owners: false,
            reclaim_warn_threshold: default_reclaim_warn_threshold(),
            collect_on_release: false,
            verify_destroyed_on_call: false,
        }
    }
}
