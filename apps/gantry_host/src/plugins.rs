//! Control-layer plugins
//!
//! A plugin registers on-create hooks while the factory table is being
//! built, then gets a call on every host tick. Plugins only ever touch
//! engine objects through proxies.

use std::collections::VecDeque;
use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use gantry_bridge::proxies::ActorProxy;
use gantry_bridge::sync::lock;
use gantry_bridge::{Bridge, FactoryBuilder, Proxy};
use tracing::{debug, error, info, warn};

/// Names accepted in the `plugins` config list
pub const BUILTIN_PLUGINS: &[&str] = &["census", "janitor"];

pub trait Plugin: Send {
    fn name(&self) -> &'static str;

    /// Called once, before the bridge exists
    fn register(&mut self, _factory: &mut FactoryBuilder) -> gantry_bridge::Result<()> {
        Ok(())
    }

    fn on_load(&mut self, _bridge: &Bridge) -> Result<(), Box<dyn Error>> {
        Ok(())
    }

    fn on_tick(&mut self, bridge: &Bridge, tick: u64) -> Result<(), Box<dyn Error>>;

    fn on_unload(&mut self, _bridge: &Bridge) {}
}

/// Instantiate a built-in plugin by name
pub fn builtin(name: &str) -> Option<Box<dyn Plugin>> {
    match name {
        "census" => Some(Box::new(CensusPlugin::default())),
        "janitor" => Some(Box::new(JanitorPlugin::default())),
        _ => None,
    }
}

struct LoadedPlugin {
    plugin: Box<dyn Plugin>,
    active: bool,
}

/// Owns the plugins and fans host events out to them, in load order
pub struct PluginHost {
    plugins: Vec<LoadedPlugin>,
}

impl PluginHost {
    pub fn new() -> Self {
        Self { plugins: Vec::new() }
    }

    /// Build a host from plugin names
    pub fn from_names(names: &[String]) -> Result<Self, String> {
        let mut host = Self::new();
        for name in names {
            let plugin = builtin(name).ok_or_else(|| format!("Unknown plugin '{}'", name))?;
            host.add(plugin);
        }
        Ok(host)
    }

    pub fn add(&mut self, plugin: Box<dyn Plugin>) {
        debug!("Plugin '{}' added", plugin.name());
        self.plugins.push(LoadedPlugin { plugin, active: true });
    }

    /// Let every plugin register its hooks
    pub fn register_all(&mut self, factory: &mut FactoryBuilder) -> gantry_bridge::Result<()> {
        for entry in &mut self.plugins {
            entry.plugin.register(factory)?;
        }
        Ok(())
    }

    /// Load every plugin; one that fails to load stays inactive
    pub fn load_all(&mut self, bridge: &Bridge) -> usize {
        let mut loaded = 0;
        for entry in &mut self.plugins {
            match entry.plugin.on_load(bridge) {
                Ok(()) => {
                    info!("Plugin '{}' loaded", entry.plugin.name());
                    loaded += 1;
                }
                Err(e) => {
                    error!("Failed to load plugin '{}': {}", entry.plugin.name(), e);
                    entry.active = false;
                }
            }
        }
        loaded
    }

    /// Tick active plugins; a plugin whose tick fails is deactivated
    pub fn tick_all(&mut self, bridge: &Bridge, tick: u64) {
        for entry in self.plugins.iter_mut().filter(|e| e.active) {
            if let Err(e) = entry.plugin.on_tick(bridge, tick) {
                error!("Plugin '{}' failed on tick {}: {}", entry.plugin.name(), tick, e);
                entry.active = false;
            }
        }
    }

    pub fn unload_all(&mut self, bridge: &Bridge) {
        for entry in self.plugins.iter_mut().rev() {
            entry.plugin.on_unload(bridge);
            entry.active = false;
            debug!("Plugin '{}' unloaded", entry.plugin.name());
        }
    }

    /// Names of the plugins still receiving ticks
    pub fn loaded_plugins(&self) -> Vec<&str> {
        self.plugins
            .iter()
            .filter(|e| e.active)
            .map(|e| e.plugin.name())
            .collect()
    }
}

impl Default for PluginHost {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters shared between the census hooks and the plugin
#[derive(Debug, Default)]
pub struct CensusCounts {
    created: AtomicU64,
    despawned: AtomicU64,
}

impl CensusCounts {
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn despawned(&self) -> u64 {
        self.despawned.load(Ordering::Relaxed)
    }
}

/// Counts actors as proxies are created for them and watches each one
/// for its `despawned` event
pub struct CensusPlugin {
    counts: Arc<CensusCounts>,
    report_every: u64,
}

impl CensusPlugin {
    pub fn new(report_every: u64) -> Self {
        Self {
            counts: Arc::new(CensusCounts::default()),
            report_every: report_every.max(1),
        }
    }

    pub fn counts(&self) -> Arc<CensusCounts> {
        self.counts.clone()
    }
}

impl Default for CensusPlugin {
    fn default() -> Self {
        Self::new(100)
    }
}

impl Plugin for CensusPlugin {
    fn name(&self) -> &'static str {
        "census"
    }

    fn register(&mut self, factory: &mut FactoryBuilder) -> gantry_bridge::Result<()> {
        let counts = self.counts.clone();
        factory.on_create_type::<ActorProxy, _>(move |actor| {
            counts.created.fetch_add(1, Ordering::Relaxed);
            let counts = counts.clone();
            let watched = actor.core().subscribe("despawned", move |_| {
                counts.despawned.fetch_add(1, Ordering::Relaxed);
            });
            if let Err(e) = watched {
                warn!(plugin = "census", "Could not watch {}: {}", actor.core().id(), e);
            }
        })?;
        Ok(())
    }

    fn on_tick(&mut self, bridge: &Bridge, tick: u64) -> Result<(), Box<dyn Error>> {
        if tick % self.report_every == 0 {
            info!(
                plugin = "census",
                "tick {}: {} actors seen, {} despawned, {} proxies bound",
                tick,
                self.counts.created(),
                self.counts.despawned(),
                bridge.bound_count()
            );
        }
        Ok(())
    }

    fn on_unload(&mut self, _bridge: &Bridge) {
        info!(
            plugin = "census",
            "{} actors seen, {} despawned",
            self.counts.created(),
            self.counts.despawned()
        );
    }
}

/// Destroys the oldest actors it has seen, a few per tick, and creates one
/// short-lived probe actor per tick from the control layer
pub struct JanitorPlugin {
    seen: Arc<Mutex<VecDeque<Weak<ActorProxy>>>>,
    per_tick: usize,
    swept: u64,
    probes: u64,
}

impl JanitorPlugin {
    pub fn new(per_tick: usize) -> Self {
        Self {
            seen: Arc::new(Mutex::new(VecDeque::new())),
            per_tick,
            swept: 0,
            probes: 0,
        }
    }

    pub fn swept(&self) -> u64 {
        self.swept
    }

    pub fn probes(&self) -> u64 {
        self.probes
    }

    fn next_seen(&self) -> Option<Weak<ActorProxy>> {
        lock(&self.seen).pop_front()
    }
}

impl Default for JanitorPlugin {
    fn default() -> Self {
        Self::new(2)
    }
}

impl Plugin for JanitorPlugin {
    fn name(&self) -> &'static str {
        "janitor"
    }

    fn register(&mut self, factory: &mut FactoryBuilder) -> gantry_bridge::Result<()> {
        let seen = self.seen.clone();
        factory.on_create_type::<ActorProxy, _>(move |actor| {
            lock(&seen).push_back(Arc::downgrade(actor));
        })?;
        Ok(())
    }

    fn on_tick(&mut self, bridge: &Bridge, tick: u64) -> Result<(), Box<dyn Error>> {
        // The queue lock is never held across a bridge call: creating the
        // probe runs this plugin's own hook.
        let mut destroyed = 0;
        while destroyed < self.per_tick {
            let Some(weak) = self.next_seen() else {
                break;
            };
            let Some(actor) = weak.upgrade() else {
                continue;
            };
            if actor.despawn() {
                destroyed += 1;
            }
        }
        self.swept += destroyed as u64;

        let probe = bridge.create::<ActorProxy>()?;
        probe.set_name(&format!("probe-{}", tick))?;
        probe.set_position([tick as f64, 0.0, 0.0])?;
        self.probes += 1;

        if destroyed > 0 {
            debug!(plugin = "janitor", "tick {}: despawned {} actors", tick, destroyed);
        }
        Ok(())
    }

    fn on_unload(&mut self, _bridge: &Bridge) {
        info!(
            plugin = "janitor",
            "{} actors despawned, {} probes created",
            self.swept,
            self.probes
        );
    }
}
