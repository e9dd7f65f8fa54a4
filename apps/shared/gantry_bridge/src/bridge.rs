//! The bridge
//!
//! [`Bridge`] ties the factory, the handle table and the ownership tracker
//! together and is what both sides of the boundary talk to: the engine
//! through the four boundary callbacks, control-layer code through
//! `resolve`, `create` and the proxy API.
//!
//! # Creation
//!
//! Materializing proxies is serialized globally behind a reentrant creation
//! section. The thread inside it marks each pointer it is creating, allocates
//! and attaches the proxy and runs the on-create hooks with the mark still
//! set. Hooks may create proxies for other pointers on the same thread; other
//! threads wait on a condition variable until the section is empty and then
//! reuse whatever was built. A hook asking again for a pointer whose creation
//! it is part of gets `ReentrantCreation`. An engine release for a pointer
//! still being created is applied once its mark clears.

use serde::Serialize;
use serde_json::Value;
use std::mem;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use crate::binding::{BindingMode, Detach, HandleTable};
use crate::config::BridgeConfig;
use crate::engine::ForeignEngine;
use crate::error::{BridgeError, Result};
use crate::events::EventDispatcher;
use crate::factory::FactoryTable;
use crate::handle::{CallbackId, ForeignPtr, HandleToken};
use crate::lifecycle::{CollectReport, Finalization};
use crate::proxy::{downcast_proxy, Proxy, ProxyCore, ProxyType};
use crate::sync::lock;
use crate::tracker::{OwnershipTracker, Owner, TokenRecord, TrackerStats};

pub(crate) struct Shared {
    pub(crate) engine: Arc<dyn ForeignEngine>,
    pub(crate) factory: FactoryTable,
    pub(crate) tracker: OwnershipTracker,
    pub(crate) table: Mutex<HandleTable>,
    pub(crate) created: Condvar,
    pub(crate) events: EventDispatcher,
    pub(crate) reclaim_tx: Sender<Finalization>,
    pub(crate) reclaim_rx: Mutex<Receiver<Finalization>>,
    pub(crate) pending: AtomicUsize,
    pub(crate) config: BridgeConfig,
}

/// Clears a creation mark and wakes waiting threads, also on unwind
struct CreationGuard<'a> {
    shared: &'a Shared,
    ptr: ForeignPtr,
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        let ready: Vec<HandleToken> = {
            let mut table = lock(&self.shared.table);
            table.creating.remove(&self.ptr);
            if table.creating.is_empty() {
                table.creator = None;
            }
            let (ready, waiting): (Vec<_>, Vec<_>) = mem::take(&mut table.deferred_releases)
                .into_iter()
                .partition(|(ptr, _)| *ptr == self.ptr);
            table.deferred_releases = waiting;
            ready.into_iter().map(|(_, token)| token).collect()
        };
        self.shared.created.notify_all();

        for token in ready {
            self.shared.release_handle(token);
        }
    }
}

impl Shared {
    /// Block while another thread is inside the creation section
    ///
    /// The thread inside it never waits, so hooks creating further proxies
    /// cannot deadlock against each other.
    pub(crate) fn wait_for_creation<'a>(
        &self,
        mut table: MutexGuard<'a, HandleTable>,
        ptr: ForeignPtr,
    ) -> Result<MutexGuard<'a, HandleTable>> {
        let me = thread::current().id();
        while table.created_elsewhere(me) {
            table = self
                .created
                .wait(table)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if table.creating.contains(&ptr) {
            return Err(BridgeError::ReentrantCreation(ptr));
        }
        Ok(table)
    }

    /// Return the live proxy for `ptr`, or build one with `allocate` and attach it
    fn materialize<F>(
        self: &Arc<Self>,
        ptr: ForeignPtr,
        mode: BindingMode,
        owner: Owner,
        allocate: F,
    ) -> Result<(Arc<dyn Proxy>, HandleToken)>
    where
        F: FnOnce(&Arc<Self>) -> Result<Arc<dyn Proxy>>,
    {
        if ptr.is_null() {
            return Err(BridgeError::NullPointer);
        }

        let mut released = Vec::new();
        {
            let mut table = self.wait_for_creation(lock(&self.table), ptr)?;
            if let Some(entry) = table.entries.get(&ptr) {
                if let Some(proxy) = entry.reference.upgrade() {
                    return Ok((proxy, entry.token));
                }
                released.extend(self.reap_locked(&mut table, ptr, Detach::Notify));
            }
            table.creating.insert(ptr);
            table.creator = Some(thread::current().id());
        }
        drop(released);

        let guard = CreationGuard { shared: self, ptr };
        let proxy = allocate(self)?;

        let mut released = Vec::new();
        let attached = {
            let mut table = lock(&self.table);
            self.attach_locked(&mut table, &proxy, ptr, mode, owner, &mut released)
        };
        drop(released);
        let token = attached?;

        self.factory.notify_created(proxy.core().type_tag(), &proxy);
        drop(guard);
        Ok((proxy, token))
    }

    pub(crate) fn allocate_for_pointer(
        self: &Arc<Self>,
        ptr: ForeignPtr,
        owner: Owner,
    ) -> Result<(Arc<dyn Proxy>, HandleToken)> {
        self.materialize(ptr, BindingMode::Pinned, owner, |shared| {
            let tag = shared
                .engine
                .type_tag(ptr)
                .ok_or(BridgeError::UnresolvedPointer(ptr))?;
            shared.factory.allocate(tag, ptr, Arc::downgrade(shared))
        })
    }

    fn is_handle_valid(&self, token: HandleToken) -> bool {
        if token.is_none() {
            return false;
        }
        let Some(ptr) = self.tracker.pointer_of(token) else {
            tracing::debug!(%token, "validity probe for unknown token");
            return false;
        };

        let live = lock(&self.table)
            .entries
            .get(&ptr)
            .is_some_and(|e| e.token == token && e.reference.is_live());
        live && !self.tracker.is_destroyed(ptr)
    }

    fn release_handle(&self, token: HandleToken) {
        let Some(ptr) = self.tracker.pointer_of(token) else {
            tracing::warn!(%token, "release of unknown or stale handle ignored");
            return;
        };

        let (removed, proxy) = {
            let mut table = lock(&self.table);
            if table.creator == Some(thread::current().id()) && table.creating.contains(&ptr) {
                table.deferred_releases.push((ptr, token));
                tracing::debug!(%token, %ptr, "release deferred until creation finishes");
                return;
            }
            let mut table = match self.wait_for_creation(table, ptr) {
                Ok(table) => table,
                Err(err) => {
                    tracing::warn!(%token, %ptr, "release ignored: {}", err);
                    return;
                }
            };

            let upgraded = match table.entries.get(&ptr) {
                Some(entry) if entry.token == token => entry.reference.upgrade(),
                _ => {
                    tracing::warn!(%token, %ptr, "release of superseded handle ignored");
                    return;
                }
            };

            match upgraded {
                Some(proxy) => {
                    let core = proxy.core();
                    let mut state = lock(&core.state);
                    let removed = self.detach_locked(&mut table, core.id(), &mut state, Detach::Silent);
                    drop(state);
                    (removed, Some(proxy))
                }
                None => (self.reap_locked(&mut table, ptr, Detach::Silent), None),
            }
        };
        drop(removed);
        drop(proxy);

        tracing::debug!(%token, %ptr, "handle released by engine");
        if self.config.collect_on_release {
            self.collect();
        }
    }
}

/// Summary produced by [`Bridge::shutdown`]
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub disposed: usize,
    pub collect: CollectReport,
    pub stats: TrackerStats,
    /// Tokens still outstanding after every proxy was disposed
    pub leaked: Vec<TokenRecord>,
}

/// Handle to a running bridge; cheap to clone
#[derive(Clone)]
pub struct Bridge {
    shared: Arc<Shared>,
}

impl Bridge {
    pub fn new(engine: Arc<dyn ForeignEngine>, factory: FactoryTable, config: BridgeConfig) -> Self {
        let (reclaim_tx, reclaim_rx) = mpsc::channel();
        let tracker = OwnershipTracker::new(engine.clone(), config.record_owners);

        tracing::debug!(
            types = factory.len(),
            record_owners = config.record_owners,
            "bridge created"
        );

        Self {
            shared: Arc::new(Shared {
                engine,
                factory,
                tracker,
                table: Mutex::new(HandleTable::default()),
                created: Condvar::new(),
                events: EventDispatcher::new(),
                reclaim_tx,
                reclaim_rx: Mutex::new(reclaim_rx),
                pending: AtomicUsize::new(0),
                config,
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn engine(&self) -> &Arc<dyn ForeignEngine> {
        &self.shared.engine
    }

    pub fn factory(&self) -> &FactoryTable {
        &self.shared.factory
    }

    pub fn tracker(&self) -> &OwnershipTracker {
        &self.shared.tracker
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.shared.events
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    /// Boundary entry: build or find the proxy for `ptr` and return its token
    ///
    /// Proxies created here are Pinned.
    pub fn allocate_for_pointer(&self, ptr: ForeignPtr) -> Result<HandleToken> {
        self.shared
            .allocate_for_pointer(ptr, Owner::Label("allocate_for_pointer"))
            .map(|(_, token)| token)
    }

    /// Proxy for an engine-originated object, creating it if needed
    #[track_caller]
    pub fn resolve(&self, ptr: ForeignPtr) -> Result<Arc<dyn Proxy>> {
        let owner = Owner::Caller(Location::caller());
        self.shared.allocate_for_pointer(ptr, owner).map(|(proxy, _)| proxy)
    }

    /// `resolve` narrowed to a concrete proxy type
    #[track_caller]
    pub fn resolve_as<T: ProxyType>(&self, ptr: ForeignPtr) -> Result<Arc<T>> {
        let proxy = self.resolve(ptr)?;
        downcast_proxy::<T>(&proxy).ok_or(BridgeError::TypeMismatch {
            ptr,
            expected: T::TYPE_NAME,
            actual: proxy.type_name(),
        })
    }

    /// Existing live proxy for `ptr`, without creating one
    pub fn lookup(&self, ptr: ForeignPtr) -> Option<Arc<dyn Proxy>> {
        // the creating thread itself may look at its own proxy
        let me = thread::current().id();
        let mut table = lock(&self.shared.table);
        while table.creating.contains(&ptr) && table.created_elsewhere(me) {
            table = self
                .shared
                .created
                .wait(table)
                .unwrap_or_else(PoisonError::into_inner);
        }
        table.entries.get(&ptr).and_then(|e| e.reference.upgrade())
    }

    /// Live proxy currently holding `token`
    pub fn proxy_for_token(&self, token: HandleToken) -> Option<Arc<dyn Proxy>> {
        let ptr = self.shared.tracker.pointer_of(token)?;
        lock(&self.shared.table)
            .entries
            .get(&ptr)
            .filter(|e| e.token == token)
            .and_then(|e| e.reference.upgrade())
    }

    /// Construct a new engine object of type `T` and bind a Weak proxy to it
    #[track_caller]
    pub fn create<T: ProxyType>(&self) -> Result<Arc<T>> {
        let owner = Owner::Caller(Location::caller());
        let ptr = self.shared.engine.create(T::TYPE_TAG)?;

        let materialized = self.shared.materialize(ptr, BindingMode::Weak, owner, |shared| {
            let core = ProxyCore::new(T::TYPE_TAG, Arc::downgrade(shared));
            Ok(Arc::new(T::from_core(core)) as Arc<dyn Proxy>)
        });
        let proxy = match materialized {
            Ok((proxy, _)) => proxy,
            Err(err) => {
                self.shared.engine.delete(ptr);
                return Err(err);
            }
        };

        downcast_proxy::<T>(&proxy).ok_or(BridgeError::TypeMismatch {
            ptr,
            expected: T::TYPE_NAME,
            actual: proxy.type_name(),
        })
    }

    /// A proxy of type `T` that is not attached to anything yet
    pub fn create_unbound<T: ProxyType>(&self) -> Arc<T> {
        Arc::new(T::from_core(ProxyCore::new(
            T::TYPE_TAG,
            Arc::downgrade(&self.shared),
        )))
    }

    /// Attach `proxy` to `ptr`, detaching it from any previous pointer first
    #[track_caller]
    pub fn attach(&self, proxy: &Arc<dyn Proxy>, ptr: ForeignPtr, mode: BindingMode) -> Result<HandleToken> {
        let owner = Owner::Caller(Location::caller());
        let mut released = Vec::new();
        let attached = {
            let table = lock(&self.shared.table);
            let mut table = self.shared.wait_for_creation(table, ptr)?;
            self.shared
                .attach_locked(&mut table, proxy, ptr, mode, owner, &mut released)
        };
        drop(released);
        attached
    }

    /// Boundary entry: is `token` the current handle of a live object
    ///
    /// Never panics; any failure reads as `false`.
    pub fn is_handle_valid(&self, token: HandleToken) -> bool {
        panic::catch_unwind(AssertUnwindSafe(|| self.shared.is_handle_valid(token))).unwrap_or(false)
    }

    /// Boundary entry: the engine lets go of `token`
    ///
    /// Detaches the proxy without any further engine call. Stale tokens
    /// are logged and ignored.
    pub fn release_handle(&self, token: HandleToken) {
        if panic::catch_unwind(AssertUnwindSafe(|| self.shared.release_handle(token))).is_err() {
            tracing::error!(%token, "panic while releasing handle");
        }
    }

    /// Boundary entry: run a reclamation pass now
    pub fn collect_garbage_now(&self) -> CollectReport {
        self.shared.collect()
    }

    /// Number of pointers with a table entry, live or not yet reaped
    pub fn bound_count(&self) -> usize {
        lock(&self.shared.table).entries.len()
    }

    pub fn pending_finalizations(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Deliver an engine event to the handler registered for `callback`
    pub fn dispatch_event(&self, callback: CallbackId, payload: &Value) -> bool {
        self.shared.events.dispatch(callback, payload)
    }

    /// Dispose every bound proxy, collect, and report what is left
    pub fn shutdown(&self) -> ShutdownReport {
        let proxies: Vec<Arc<dyn Proxy>> = lock(&self.shared.table)
            .entries
            .values()
            .filter_map(|e| e.reference.upgrade())
            .collect();

        let disposed = proxies.iter().filter(|p| p.core().dispose()).count();
        drop(proxies);

        let collect = self.collect_garbage_now();
        let leaked = self.shared.tracker.snapshot();
        if !leaked.is_empty() {
            tracing::warn!(count = leaked.len(), "ownership tokens outstanding at shutdown");
        }

        ShutdownReport {
            disposed,
            collect,
            stats: self.shared.tracker.stats(),
            leaked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleState;
    use crate::proxies::{ActorProxy, PawnProxy};
    use crate::sim::SimEngine;
    use crate::type_tag::TypeTag;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::time::Duration;

    fn setup_with<F>(configure: F) -> (Arc<SimEngine>, Bridge)
    where
        F: FnOnce(&mut crate::factory::FactoryBuilder),
    {
        let engine = Arc::new(SimEngine::new());
        let mut builder = FactoryTable::builder();
        builder.register_type::<ActorProxy>().unwrap();
        builder.register_type::<PawnProxy>().unwrap();
        configure(&mut builder);
        let bridge = Bridge::new(engine.clone(), builder.build(), BridgeConfig::default());
        (engine, bridge)
    }

    fn setup() -> (Arc<SimEngine>, Bridge) {
        setup_with(|_| {})
    }

    #[test]
    fn test_allocate_same_pointer_twice_returns_same_instance() {
        let scenario_tag = TypeTag::from_raw(0x1234_ABCD);
        let (engine, bridge) = setup_with(|builder| {
            builder
                .register(scenario_tag, "AllocateActorProxy", |core| {
                    Arc::new(ActorProxy::from_core(core)) as Arc<dyn Proxy>
                })
                .unwrap();
        });
        let ptr = ForeignPtr::from_addr(0xAABB);
        engine.spawn_at(ptr, scenario_tag);

        let first = bridge.allocate_for_pointer(ptr).unwrap();
        let proxy = bridge.lookup(ptr).unwrap();
        let second = bridge.allocate_for_pointer(ptr).unwrap();
        let again = bridge.lookup(ptr).unwrap();

        assert_eq!(first, second);
        assert_eq!(proxy.core().id(), again.core().id());
        assert_eq!(proxy.core().type_tag(), scenario_tag);
        assert_eq!(engine.handle_of(ptr), Some(first));
        assert_eq!(bridge.tracker().stats().issued, 1);
    }

    #[test]
    fn test_concurrent_allocation_yields_one_proxy() {
        let created = Arc::new(AtomicUsize::new(0));
        let hook_count = created.clone();
        let (engine, bridge) = setup_with(move |builder| {
            builder
                .on_create(ActorProxy::TYPE_TAG, move |_| {
                    hook_count.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                })
                .unwrap();
        });
        let ptr = engine.spawn(ActorProxy::TYPE_TAG);

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let bridge = bridge.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let token = bridge.allocate_for_pointer(ptr).unwrap();
                    let proxy = bridge.lookup(ptr).unwrap();
                    (token, proxy.core().id())
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let tokens: HashSet<_> = results.iter().map(|(t, _)| *t).collect();
        let ids: HashSet<_> = results.iter().map(|(_, id)| *id).collect();

        assert_eq!(tokens.len(), 1);
        assert_eq!(ids.len(), 1);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.bound_count(), 1);
    }

    #[test]
    fn test_hooks_see_attached_proxy_before_publication() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = seen.clone();
        let second = seen.clone();
        let (engine, bridge) = setup_with(move |builder| {
            builder
                .on_create(ActorProxy::TYPE_TAG, move |proxy| {
                    first.lock().unwrap().push(("first", proxy.core().pointer()));
                })
                .unwrap()
                .on_create(ActorProxy::TYPE_TAG, move |proxy| {
                    second.lock().unwrap().push(("second", proxy.core().pointer()));
                })
                .unwrap();
        });
        let ptr = engine.spawn(ActorProxy::TYPE_TAG);

        bridge.resolve(ptr).unwrap();
        bridge.resolve(ptr).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![("first", Some(ptr)), ("second", Some(ptr))]);
    }

    #[test]
    fn test_reentrant_creation_is_rejected() {
        let outcome = Arc::new(Mutex::new(None));
        let slot = outcome.clone();
        let (engine, bridge) = setup_with(move |builder| {
            builder
                .on_create(ActorProxy::TYPE_TAG, move |proxy| {
                    let bridge = proxy.core().bridge().unwrap();
                    let ptr = proxy.core().pointer().unwrap();
                    *slot.lock().unwrap() = Some(bridge.resolve(ptr).err());
                })
                .unwrap();
        });
        let ptr = engine.spawn(ActorProxy::TYPE_TAG);

        bridge.resolve(ptr).unwrap();
        assert_eq!(
            outcome.lock().unwrap().clone(),
            Some(Some(BridgeError::ReentrantCreation(ptr)))
        );
        // the mark is cleared afterwards
        assert!(bridge.resolve(ptr).is_ok());
    }

    #[test]
    fn test_hooks_resolving_each_other_across_threads() {
        let engine = Arc::new(SimEngine::new());
        let actor_ptr = engine.spawn(ActorProxy::TYPE_TAG);
        let pawn_ptr = engine.spawn(PawnProxy::TYPE_TAG);

        let mut builder = FactoryTable::builder();
        builder.register_type::<ActorProxy>().unwrap();
        builder.register_type::<PawnProxy>().unwrap();
        builder
            .on_create(ActorProxy::TYPE_TAG, move |proxy| {
                thread::sleep(Duration::from_millis(50));
                let bridge = proxy.core().bridge().unwrap();
                let _ = bridge.resolve(pawn_ptr);
            })
            .unwrap()
            .on_create(PawnProxy::TYPE_TAG, move |proxy| {
                thread::sleep(Duration::from_millis(50));
                let bridge = proxy.core().bridge().unwrap();
                let _ = bridge.resolve(actor_ptr);
            })
            .unwrap();
        let bridge = Bridge::new(engine.clone(), builder.build(), BridgeConfig::default());

        let barrier = Arc::new(Barrier::new(2));
        let (tx, rx) = mpsc::channel();
        for ptr in [actor_ptr, pawn_ptr] {
            let bridge = bridge.clone();
            let barrier = barrier.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                barrier.wait();
                let _ = tx.send(bridge.allocate_for_pointer(ptr));
            });
        }

        for _ in 0..2 {
            let result = rx.recv_timeout(Duration::from_secs(5)).expect("creation deadlocked");
            assert!(result.is_ok());
        }
        assert_eq!(bridge.bound_count(), 2);
        assert!(bridge.lookup(actor_ptr).is_some());
        assert!(bridge.lookup(pawn_ptr).is_some());
        assert_eq!(bridge.tracker().stats().issued, 2);
    }

    #[test]
    fn test_nested_creation_on_the_creating_thread() {
        let engine = Arc::new(SimEngine::new());
        let pawn_ptr = engine.spawn(PawnProxy::TYPE_TAG);
        let nested = Arc::new(Mutex::new(None));
        let slot = nested.clone();

        let mut builder = FactoryTable::builder();
        builder.register_type::<ActorProxy>().unwrap();
        builder.register_type::<PawnProxy>().unwrap();
        builder
            .on_create(ActorProxy::TYPE_TAG, move |proxy| {
                let bridge = proxy.core().bridge().unwrap();
                *slot.lock().unwrap() = Some(bridge.resolve(pawn_ptr).map(|p| p.core().id()));
            })
            .unwrap();
        let bridge = Bridge::new(engine.clone(), builder.build(), BridgeConfig::default());
        let actor_ptr = engine.spawn(ActorProxy::TYPE_TAG);

        bridge.resolve(actor_ptr).unwrap();
        let pawn_id = nested.lock().unwrap().clone().unwrap().unwrap();
        assert_eq!(bridge.lookup(pawn_ptr).unwrap().core().id(), pawn_id);
        assert_eq!(bridge.bound_count(), 2);
    }

    #[test]
    fn test_release_during_creation_is_applied_afterwards() {
        let bound_in_hook = Arc::new(Mutex::new(None));
        let slot = bound_in_hook.clone();
        let (engine, bridge) = setup_with(move |builder| {
            builder
                .on_create(ActorProxy::TYPE_TAG, move |proxy| {
                    let bridge = proxy.core().bridge().unwrap();
                    bridge.release_handle(proxy.core().token());
                    *slot.lock().unwrap() = Some(proxy.core().is_bound());
                })
                .unwrap();
        });
        let ptr = engine.spawn(ActorProxy::TYPE_TAG);

        let token = bridge.allocate_for_pointer(ptr).unwrap();

        // still attached inside the hook, released once creation finished
        assert_eq!(*bound_in_hook.lock().unwrap(), Some(true));
        assert!(!bridge.is_handle_valid(token));
        assert!(bridge.lookup(ptr).is_none());
        assert_eq!(bridge.bound_count(), 0);
        assert_eq!(bridge.tracker().outstanding(ptr), 0);
        assert_eq!(bridge.tracker().stats().outstanding, 0);
        assert_eq!(engine.counters().deletes, 0);
    }

    #[test]
    fn test_unknown_and_unresolved_pointers() {
        let (engine, bridge) = setup();
        let stray = engine.spawn(TypeTag::of("Vehicle"));

        let err = bridge.allocate_for_pointer(stray).unwrap_err();
        assert!(matches!(err, BridgeError::UnknownTypeTag { .. }));
        assert!(err.is_fatal());

        let nowhere = ForeignPtr::from_addr(0xDEAD_0000);
        assert_eq!(
            bridge.allocate_for_pointer(nowhere).unwrap_err(),
            BridgeError::UnresolvedPointer(nowhere)
        );
        assert_eq!(
            bridge.allocate_for_pointer(ForeignPtr::NULL).unwrap_err(),
            BridgeError::NullPointer
        );
        assert_eq!(bridge.bound_count(), 0);
    }

    #[test]
    fn test_pinned_survives_collection_weak_does_not() {
        let (engine, bridge) = setup();
        let pinned_ptr = engine.spawn(ActorProxy::TYPE_TAG);
        let pinned_id = bridge.resolve(pinned_ptr).unwrap().core().id();

        let weak = bridge.create::<ActorProxy>().unwrap();
        let weak_ptr = weak.core().pointer().unwrap();
        let weak_id = weak.core().id();
        assert_eq!(weak.core().mode(), BindingMode::Weak);
        drop(weak);

        let report = bridge.collect_garbage_now();
        assert_eq!(report.finalized, 1);

        assert_eq!(bridge.lookup(pinned_ptr).unwrap().core().id(), pinned_id);
        assert!(bridge.lookup(weak_ptr).is_none());

        // the engine object is still there, so asking for it builds a new proxy
        let again = bridge.resolve(weak_ptr).unwrap();
        assert_ne!(again.core().id(), weak_id);
        assert_eq!(again.core().mode(), BindingMode::Pinned);

        // a pinned proxy is reclaimed once unbound and its last holder is gone
        let pinned = bridge.lookup(pinned_ptr).unwrap();
        let held = Arc::downgrade(&pinned);
        assert!(pinned.core().unbind());
        drop(pinned);
        assert!(held.upgrade().is_none());
        assert!(bridge.lookup(pinned_ptr).is_none());
        assert_eq!(bridge.bound_count(), 1);

        // same after the engine releases its handle
        let token = again.core().token();
        let held = Arc::downgrade(&again);
        bridge.release_handle(token);
        drop(again);
        assert!(held.upgrade().is_none());
        assert!(bridge.lookup(weak_ptr).is_none());
        assert_eq!(bridge.bound_count(), 0);
        assert_eq!(bridge.tracker().stats().outstanding, 0);
    }

    #[test]
    fn test_dead_weak_entry_is_reaped_on_lookup() {
        let (engine, bridge) = setup();
        let weak = bridge.create::<ActorProxy>().unwrap();
        let ptr = weak.core().pointer().unwrap();
        drop(weak);

        // no reclamation pass yet; resolving replaces the dead entry directly
        let fresh = bridge.resolve(ptr).unwrap();
        assert_eq!(fresh.core().pointer(), Some(ptr));
        assert_eq!(engine.holds(ptr), 1);
        assert_eq!(bridge.tracker().outstanding(ptr), 1);
    }

    #[test]
    fn test_handle_validity() {
        let (engine, bridge) = setup();
        let ptr = engine.spawn(ActorProxy::TYPE_TAG);
        let token = bridge.allocate_for_pointer(ptr).unwrap();

        assert!(bridge.is_handle_valid(token));
        assert!(!bridge.is_handle_valid(HandleToken::NONE));
        assert!(!bridge.is_handle_valid(HandleToken::from_raw(987_654)));

        engine.destroy_natively(ptr);
        assert!(!bridge.is_handle_valid(token));
    }

    #[test]
    fn test_release_handle_detaches_silently() {
        let (engine, bridge) = setup();
        let ptr = engine.spawn(ActorProxy::TYPE_TAG);
        let token = bridge.allocate_for_pointer(ptr).unwrap();
        let proxy = bridge.lookup(ptr).unwrap();
        let before = engine.counters();

        bridge.release_handle(token);

        assert_eq!(proxy.core().state(), LifecycleState::Unbound);
        assert_eq!(engine.counters().deletes, before.deletes);
        assert_eq!(engine.counters().releases, before.releases);
        assert!(bridge.proxy_for_token(token).is_none());
        assert!(!bridge.is_handle_valid(token));
    }

    #[test]
    fn test_release_handle_after_dispose_is_noop() {
        let (engine, bridge) = setup();
        let ptr = engine.spawn(ActorProxy::TYPE_TAG);
        let token = bridge.allocate_for_pointer(ptr).unwrap();
        let proxy = bridge.lookup(ptr).unwrap();

        proxy.core().dispose();
        let after_dispose = engine.counters();
        bridge.release_handle(token);

        assert_eq!(engine.counters(), after_dispose);
        assert_eq!(after_dispose.deletes, 0);
        assert_eq!(proxy.core().state(), LifecycleState::Disposed);
    }

    #[test]
    fn test_release_of_superseded_token_keeps_new_binding() {
        let (engine, bridge) = setup();
        let first = engine.spawn(ActorProxy::TYPE_TAG);
        let second = engine.spawn(ActorProxy::TYPE_TAG);
        let proxy: Arc<dyn Proxy> = bridge.create_unbound::<ActorProxy>();

        let old = bridge.attach(&proxy, first, BindingMode::Pinned).unwrap();
        let new = bridge.attach(&proxy, second, BindingMode::Pinned).unwrap();
        bridge.release_handle(old);

        assert_eq!(proxy.core().token(), new);
        assert!(bridge.is_handle_valid(new));
    }

    #[test]
    fn test_tracking_is_balanced_after_dispose() {
        let (engine, bridge) = setup();
        let ptrs: Vec<_> = (0..4).map(|_| engine.spawn(ActorProxy::TYPE_TAG)).collect();
        let proxy: Arc<dyn Proxy> = bridge.create_unbound::<ActorProxy>();

        for ptr in &ptrs {
            bridge.attach(&proxy, *ptr, BindingMode::Weak).unwrap();
        }
        let others: Vec<_> = ptrs[..3].iter().map(|p| bridge.resolve(*p).unwrap()).collect();

        proxy.core().dispose();
        for other in &others {
            other.core().dispose();
        }

        let stats = bridge.tracker().stats();
        assert_eq!(stats.issued, stats.retired);
        assert_eq!(stats.outstanding, 0);
        for ptr in &ptrs {
            assert_eq!(engine.holds(*ptr), 0);
        }
    }

    #[test]
    fn test_detached_call_fails_fast() {
        let (engine, bridge) = setup();
        let actor = bridge.create_unbound::<ActorProxy>();
        assert_eq!(actor.name().unwrap_err(), BridgeError::Detached(actor.core().id()));
        assert_eq!(engine.counters().invokes, 0);
    }

    #[test]
    fn test_resolve_as_checks_type() {
        let (engine, bridge) = setup();
        let ptr = engine.spawn(PawnProxy::TYPE_TAG);

        assert!(bridge.resolve_as::<PawnProxy>(ptr).is_ok());
        let err = bridge.resolve_as::<ActorProxy>(ptr).err().unwrap();
        assert_eq!(
            err,
            BridgeError::TypeMismatch {
                ptr,
                expected: "Actor",
                actual: "Pawn"
            }
        );
    }

    #[test]
    fn test_uniqueness_under_mixed_operations() {
        let (engine, bridge) = setup();
        let ptrs: Vec<_> = (0..16).map(|_| engine.spawn(ActorProxy::TYPE_TAG)).collect();

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let bridge = bridge.clone();
                let ptrs = ptrs.clone();
                thread::spawn(move || {
                    for round in 0..50 {
                        let ptr = ptrs[(worker * 7 + round) % ptrs.len()];
                        let token = bridge.allocate_for_pointer(ptr).unwrap();
                        if round % 5 == 0 {
                            bridge.release_handle(token);
                        }
                        if round % 11 == 0 {
                            bridge.collect_garbage_now();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut seen = HashSet::new();
        for ptr in &ptrs {
            if let Some(proxy) = bridge.lookup(*ptr) {
                assert_eq!(proxy.core().pointer(), Some(*ptr));
                assert!(seen.insert(proxy.core().id()));
            }
        }
    }

    #[test]
    fn test_owner_locations_are_recorded() {
        let engine = Arc::new(SimEngine::new());
        let mut builder = FactoryTable::builder();
        builder.register_type::<ActorProxy>().unwrap();
        let config = BridgeConfig {
            record_owners: true,
            ..BridgeConfig::default()
        };
        let bridge = Bridge::new(engine.clone(), builder.build(), config);

        let ptr = engine.spawn(ActorProxy::TYPE_TAG);
        bridge.resolve(ptr).unwrap();
        let other = engine.spawn(ActorProxy::TYPE_TAG);
        bridge.allocate_for_pointer(other).unwrap();

        let snapshot = bridge.tracker().snapshot();
        assert!(snapshot[0].owner.as_deref().unwrap().contains("bridge.rs"));
        assert_eq!(snapshot[1].owner.as_deref(), Some("allocate_for_pointer"));
    }

    #[test]
    fn test_collect_on_release() {
        let engine = Arc::new(SimEngine::new());
        let mut builder = FactoryTable::builder();
        builder.register_type::<ActorProxy>().unwrap();
        let config = BridgeConfig {
            collect_on_release: true,
            ..BridgeConfig::default()
        };
        let bridge = Bridge::new(engine.clone(), builder.build(), config);

        let weak = bridge.create::<ActorProxy>().unwrap();
        drop(weak);
        assert_eq!(bridge.pending_finalizations(), 1);

        let ptr = engine.spawn(ActorProxy::TYPE_TAG);
        let token = bridge.allocate_for_pointer(ptr).unwrap();
        bridge.release_handle(token);
        assert_eq!(bridge.pending_finalizations(), 0);
    }

    #[test]
    fn test_verify_destroyed_on_call() {
        let engine = Arc::new(SimEngine::new());
        let mut builder = FactoryTable::builder();
        builder.register_type::<ActorProxy>().unwrap();
        let config = BridgeConfig {
            verify_destroyed_on_call: true,
            ..BridgeConfig::default()
        };
        let bridge = Bridge::new(engine.clone(), builder.build(), config);

        let actor = bridge.create::<ActorProxy>().unwrap();
        let ptr = actor.core().pointer().unwrap();
        engine.destroy_natively(ptr);

        assert_eq!(actor.name().unwrap_err(), BridgeError::ObjectDestroyed(ptr));
        assert_eq!(engine.counters().invokes, 0);
        assert!(!actor.core().is_bound());
    }

    #[test]
    fn test_event_dispatch_reaches_subscriber() {
        let (engine, bridge) = setup();
        let actor = bridge.create::<ActorProxy>().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        actor
            .core()
            .subscribe("hit", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let ptr = actor.core().pointer().unwrap();
        for callback in engine.fire(ptr, "hit") {
            bridge.dispatch_event(callback, &Value::Null);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_reports_no_leaks() {
        let (engine, bridge) = setup();
        for _ in 0..3 {
            let ptr = engine.spawn(ActorProxy::TYPE_TAG);
            bridge.allocate_for_pointer(ptr).unwrap();
        }
        let kept = bridge.create::<ActorProxy>().unwrap();

        let report = bridge.shutdown();
        assert_eq!(report.disposed, 4);
        assert!(report.leaked.is_empty());
        assert_eq!(report.stats.issued, report.stats.retired);
        assert_eq!(bridge.bound_count(), 0);
        assert_eq!(kept.core().state(), LifecycleState::Disposed);
    }
}
