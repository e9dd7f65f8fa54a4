//! Engine-side simulation
//!
//! Worker threads play the part of the native engine: every tick they spawn
//! objects, ask the bridge for handles through the boundary callbacks, fire
//! `despawned` at a share of their objects and destroy them natively.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use gantry_bridge::proxies::{ActorProxy, ComponentProxy, PawnProxy};
use gantry_bridge::sim::SimEngine;
use gantry_bridge::{BoundaryCallbacks, Bridge, ForeignPtr, ProxyType, TypeTag};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, trace};

use crate::config::Config;

#[derive(Debug, Clone, Copy)]
pub struct DriverSettings {
    pub workers: usize,
    pub spawns_per_tick: usize,
    pub despawn_ratio: f64,
    pub collect_every: u64,
}

impl DriverSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.engine_workers,
            spawns_per_tick: config.spawns_per_tick,
            despawn_ratio: config.despawn_ratio.clamp(0.0, 1.0),
            collect_every: config.collect_every,
        }
    }
}

/// What the engine side did, summed over workers
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub spawned: u64,
    pub attached: u64,
    pub rejected: u64,
    pub despawned: u64,
    pub released: u64,
    pub events: u64,
    pub collections: u64,
}

impl WorkerStats {
    fn merge(&mut self, other: &WorkerStats) {
        self.spawned += other.spawned;
        self.attached += other.attached;
        self.rejected += other.rejected;
        self.despawned += other.despawned;
        self.released += other.released;
        self.events += other.events;
        self.collections += other.collections;
    }
}

fn spawn_tag(n: u64) -> TypeTag {
    match n % 3 {
        0 => ActorProxy::TYPE_TAG,
        1 => PawnProxy::TYPE_TAG,
        _ => ComponentProxy::TYPE_TAG,
    }
}

struct Worker {
    index: usize,
    engine: Arc<SimEngine>,
    bridge: Bridge,
    callbacks: BoundaryCallbacks,
    settings: DriverSettings,
    owned: VecDeque<ForeignPtr>,
    stats: WorkerStats,
}

impl Worker {
    fn run(mut self, ticks: Receiver<u64>) -> WorkerStats {
        while let Ok(tick) = ticks.recv() {
            self.step(tick);
        }
        debug!(
            "Engine worker {} stopping with {} objects still alive",
            self.index,
            self.owned.len()
        );
        self.stats
    }

    fn step(&mut self, tick: u64) {
        for _ in 0..self.settings.spawns_per_tick {
            let ptr = self.engine.spawn(spawn_tag(self.stats.spawned));
            self.stats.spawned += 1;

            let token = (self.callbacks.allocate_for_pointer)(ptr.as_raw());
            if token == 0 {
                self.stats.rejected += 1;
                continue;
            }
            self.stats.attached += 1;
            self.owned.push_back(ptr);
        }

        let despawn = (self.owned.len() as f64 * self.settings.despawn_ratio).floor() as usize;
        let payload = json!({ "tick": tick, "worker": self.index });
        for _ in 0..despawn {
            let Some(ptr) = self.owned.pop_front() else {
                break;
            };
            for callback in self.engine.fire(ptr, "despawned") {
                if self.bridge.dispatch_event(callback, &payload) {
                    self.stats.events += 1;
                }
            }
            // None when the control layer destroyed it first or detached it
            if let Some(handle) = self.engine.destroy_natively(ptr) {
                (self.callbacks.release_handle)(handle.as_raw());
                self.stats.released += 1;
            }
            self.stats.despawned += 1;
        }

        if self.index == 0 && self.settings.collect_every > 0 && tick % self.settings.collect_every == 0 {
            (self.callbacks.collect_garbage_now)();
            self.stats.collections += 1;
        }

        trace!(worker = self.index, tick, owned = self.owned.len(), "engine tick done");
    }
}

struct WorkerHandle {
    index: usize,
    ticks: Sender<u64>,
    thread: JoinHandle<WorkerStats>,
}

/// Owns the engine worker threads
pub struct EngineDriver {
    workers: Vec<WorkerHandle>,
}

impl EngineDriver {
    pub fn start(
        engine: Arc<SimEngine>,
        bridge: Bridge,
        callbacks: BoundaryCallbacks,
        settings: DriverSettings,
    ) -> io::Result<Self> {
        let mut workers = Vec::with_capacity(settings.workers);
        for index in 0..settings.workers {
            let (tx, rx) = mpsc::channel();
            let worker = Worker {
                index,
                engine: engine.clone(),
                bridge: bridge.clone(),
                callbacks,
                settings,
                owned: VecDeque::new(),
                stats: WorkerStats::default(),
            };
            let thread = thread::Builder::new()
                .name(format!("engine-{}", index))
                .spawn(move || worker.run(rx))?;
            workers.push(WorkerHandle {
                index,
                ticks: tx,
                thread,
            });
        }
        debug!("Started {} engine workers", workers.len());
        Ok(Self { workers })
    }

    /// Queue a tick on every worker; returns how many accepted it
    pub fn tick(&self, tick: u64) -> usize {
        self.workers
            .iter()
            .filter(|w| w.ticks.send(tick).is_ok())
            .count()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Let queued ticks drain, join the workers and sum their stats
    pub fn stop(self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for worker in self.workers {
            drop(worker.ticks);
            match worker.thread.join() {
                Ok(stats) => total.merge(&stats),
                Err(_) => error!("Engine worker {} panicked", worker.index),
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_bridge::proxies::register_builtin;
    use gantry_bridge::{BridgeConfig, FactoryTable, boundary};

    // The only test in this binary that installs the process-wide bridge.
    #[test]
    fn test_workers_drive_the_boundary() {
        let engine = Arc::new(SimEngine::new());
        let mut builder = FactoryTable::builder();
        register_builtin(&mut builder).unwrap();
        let bridge = Bridge::new(engine.clone(), builder.build(), BridgeConfig::default());
        let callbacks = boundary::install(bridge.clone()).unwrap();

        let settings = DriverSettings {
            workers: 2,
            spawns_per_tick: 4,
            despawn_ratio: 0.5,
            collect_every: 1,
        };
        let driver = EngineDriver::start(engine.clone(), bridge.clone(), callbacks, settings).unwrap();
        assert_eq!(driver.worker_count(), 2);
        for tick in 1..=5 {
            assert_eq!(driver.tick(tick), 2);
        }
        let stats = driver.stop();

        // per worker: owned 4→2, 6→3, 7→4, 8→4, 8→4
        assert_eq!(stats.spawned, 40);
        assert_eq!(stats.attached, 40);
        assert_eq!(stats.rejected, 0);
        assert_eq!(stats.despawned, 32);
        assert_eq!(stats.released, 32);
        assert_eq!(stats.collections, 5);
        assert_eq!(bridge.bound_count(), 8);
        assert_eq!(engine.object_count(), 8);

        let report = bridge.shutdown();
        assert_eq!(report.disposed, 8);
        assert!(report.leaked.is_empty());
    }

    #[test]
    fn test_spawn_tags_rotate() {
        assert_eq!(spawn_tag(0), ActorProxy::TYPE_TAG);
        assert_eq!(spawn_tag(1), PawnProxy::TYPE_TAG);
        assert_eq!(spawn_tag(5), ComponentProxy::TYPE_TAG);
    }
}
