//! Proxy objects
//!
//! A proxy is the control-layer mirror of one engine object. Concrete proxy
//! types embed a [`ProxyCore`], which carries the binding state shared by all
//! of them, and implement [`Proxy`] (object-safe, used behind
//! `Arc<dyn Proxy>`) plus [`ProxyType`] (static type information the factory
//! registers).
//!
//! Dropping the last `Arc` of a proxy is its finalizer: the core queues a
//! finalization record for the next reclamation pass instead of touching the
//! engine from whatever thread the drop happened on.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::mem;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::binding::BindingMode;
use crate::bridge::{Bridge, Shared};
use crate::error::{BridgeError, EngineError, Result};
use crate::events::Subscription;
use crate::handle::{CallbackId, ForeignPtr, HandleToken, ProxyId};
use crate::lifecycle::{Finalization, LifecycleState};
use crate::sync::lock;
use crate::type_tag::TypeTag;

/// Upcast helper so `Arc<dyn Proxy>` can be downcast to its concrete type
pub trait AsAnyArc: Any + Send + Sync {
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync> AsAnyArc for T {
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Object-safe view of any proxy
pub trait Proxy: AsAnyArc {
    fn core(&self) -> &ProxyCore;

    /// Registered type name of the concrete proxy
    fn type_name(&self) -> &'static str;
}

/// Static information about a concrete proxy type
pub trait ProxyType: Proxy + Sized {
    const TYPE_NAME: &'static str;
    const TYPE_TAG: TypeTag = TypeTag::of(Self::TYPE_NAME);

    /// Build the proxy around a fresh, unbound core
    fn from_core(core: ProxyCore) -> Self;
}

/// Downcast a type-erased proxy to its concrete type
pub fn downcast_proxy<T: ProxyType>(proxy: &Arc<dyn Proxy>) -> Option<Arc<T>> {
    AsAnyArc::into_any_arc(Arc::clone(proxy)).downcast::<T>().ok()
}

pub(crate) struct BindingState {
    pub(crate) attached: Option<ForeignPtr>,
    pub(crate) mode: BindingMode,
    pub(crate) token: HandleToken,
    pub(crate) disposed: bool,
    pub(crate) subscriptions: Vec<Subscription>,
}

impl BindingState {
    fn new() -> Self {
        Self {
            attached: None,
            mode: BindingMode::Unbound,
            token: HandleToken::NONE,
            disposed: false,
            subscriptions: Vec::new(),
        }
    }
}

/// Binding state shared by every proxy type
pub struct ProxyCore {
    id: ProxyId,
    tag: TypeTag,
    pub(crate) state: Mutex<BindingState>,
    bridge: Weak<Shared>,
}

impl ProxyCore {
    pub(crate) fn new(tag: TypeTag, bridge: Weak<Shared>) -> Self {
        Self {
            id: ProxyId::next(),
            tag,
            state: Mutex::new(BindingState::new()),
            bridge,
        }
    }

    pub fn id(&self) -> ProxyId {
        self.id
    }

    pub fn type_tag(&self) -> TypeTag {
        self.tag
    }

    /// Currently attached pointer
    pub fn pointer(&self) -> Option<ForeignPtr> {
        lock(&self.state).attached
    }

    pub fn mode(&self) -> BindingMode {
        lock(&self.state).mode
    }

    /// Token of the current attachment, `HandleToken::NONE` when detached
    pub fn token(&self) -> HandleToken {
        lock(&self.state).token
    }

    pub fn state(&self) -> LifecycleState {
        let state = lock(&self.state);
        if state.disposed {
            LifecycleState::Disposed
        } else if state.attached.is_some() {
            LifecycleState::Bound(state.mode)
        } else {
            LifecycleState::Unbound
        }
    }

    pub fn is_bound(&self) -> bool {
        self.pointer().is_some()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        lock(&self.state).subscriptions.clone()
    }

    /// The bridge this proxy belongs to, if it is still running
    pub fn bridge(&self) -> Option<Bridge> {
        self.bridge.upgrade().map(Bridge::from_shared)
    }

    pub(crate) fn shared(&self) -> Result<Arc<Shared>> {
        self.bridge.upgrade().ok_or(BridgeError::BridgeShutdown)
    }

    /// Attached pointer, or `Detached` when there is none
    pub fn require_pointer(&self) -> Result<ForeignPtr> {
        self.pointer().ok_or(BridgeError::Detached(self.id))
    }

    /// Invoke an engine method on the attached object
    ///
    /// If the engine reports the object destroyed, the proxy is unbound
    /// silently and `ObjectDestroyed` is returned.
    pub fn call(&self, method: &str, args: Value) -> Result<Value> {
        let shared = self.shared()?;
        let ptr = self.require_pointer()?;

        if shared.config.verify_destroyed_on_call && shared.tracker.is_destroyed(ptr) {
            return Err(self.object_gone(&shared, ptr));
        }

        match shared.engine.invoke(ptr, method, &args) {
            Ok(value) => Ok(value),
            Err(EngineError::Destroyed(_)) => Err(self.object_gone(&shared, ptr)),
            Err(err) => Err(err.into()),
        }
    }

    /// `call` followed by deserialization of the returned value
    pub fn call_as<R: DeserializeOwned>(&self, method: &str, args: Value) -> Result<R> {
        let value = self.call(method, args)?;
        serde_json::from_value(value).map_err(|err| BridgeError::BadReturn {
            method: method.to_string(),
            reason: err.to_string(),
        })
    }

    fn object_gone(&self, shared: &Shared, ptr: ForeignPtr) -> BridgeError {
        if shared.unbind(self, Some(ptr)) {
            tracing::debug!(proxy_id = %self.id, %ptr, "engine object gone, proxy unbound");
        }
        BridgeError::ObjectDestroyed(ptr)
    }

    /// Subscribe to an engine event on the attached object
    ///
    /// The subscription is owned by this proxy and removed on Dispose.
    pub fn subscribe<F>(&self, event: &str, handler: F) -> Result<CallbackId>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let shared = self.shared()?;
        let ptr = self.require_pointer()?;

        let id = match shared.engine.subscribe(ptr, event) {
            Ok(id) => id,
            Err(EngineError::Destroyed(_)) => return Err(self.object_gone(&shared, ptr)),
            Err(err) => return Err(err.into()),
        };

        {
            let mut state = lock(&self.state);
            if state.disposed || state.attached != Some(ptr) {
                drop(state);
                shared.engine.unsubscribe(ptr, id);
                return Err(BridgeError::Detached(self.id));
            }
            state.subscriptions.push(Subscription {
                id,
                ptr,
                event: event.to_string(),
            });
        }

        shared.events.register(id, self.id, event, Arc::new(handler));
        tracing::trace!(proxy_id = %self.id, %ptr, callback = %id, event, "subscribed");
        Ok(id)
    }

    /// Remove one subscription; false if this proxy does not own it
    pub fn unsubscribe(&self, id: CallbackId) -> bool {
        let removed = {
            let mut state = lock(&self.state);
            let position = state.subscriptions.iter().position(|s| s.id == id);
            position.map(|i| state.subscriptions.remove(i))
        };

        let Some(subscription) = removed else {
            return false;
        };
        if let Some(shared) = self.bridge.upgrade() {
            shared.engine.unsubscribe(subscription.ptr, subscription.id);
            shared.events.unregister(subscription.id);
        }
        true
    }

    /// Detach without telling the engine anything
    ///
    /// Returns false when the proxy was not bound.
    pub fn unbind(&self) -> bool {
        match self.bridge.upgrade() {
            Some(shared) => shared.unbind(self, None),
            None => {
                let mut state = lock(&self.state);
                state.mode = BindingMode::Unbound;
                state.token = HandleToken::NONE;
                state.attached.take().is_some()
            }
        }
    }

    /// Ask the engine to delete the object, then detach
    ///
    /// Returns false (and issues no delete) when the proxy is not bound.
    pub fn destroy(&self) -> bool {
        match self.bridge.upgrade() {
            Some(shared) => shared.destroy(self),
            None => false,
        }
    }

    /// Detach and drop every subscription; idempotent
    ///
    /// Returns true only for the call that performed the disposal.
    pub fn dispose(&self) -> bool {
        match self.bridge.upgrade() {
            Some(shared) => shared.dispose(self),
            None => {
                let mut state = lock(&self.state);
                let first = !state.disposed;
                state.disposed = true;
                state.attached = None;
                state.mode = BindingMode::Unbound;
                state.token = HandleToken::NONE;
                state.subscriptions.clear();
                first
            }
        }
    }
}

impl std::fmt::Debug for ProxyCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("ProxyCore")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("attached", &state.attached)
            .field("mode", &state.mode)
            .field("token", &state.token)
            .field("disposed", &state.disposed)
            .finish()
    }
}

impl Drop for ProxyCore {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.disposed {
            return;
        }

        let ptr = state.attached.take();
        let token = mem::take(&mut state.token);
        let subscriptions = mem::take(&mut state.subscriptions);
        if ptr.is_none() && subscriptions.is_empty() {
            return;
        }

        if let Some(shared) = self.bridge.upgrade() {
            shared.enqueue_finalization(Finalization {
                proxy: self.id,
                ptr,
                token,
                subscriptions,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::factory::FactoryTable;
    use crate::proxies::ActorProxy;
    use crate::sim::SimEngine;

    fn setup() -> (Arc<SimEngine>, Bridge) {
        let engine = Arc::new(SimEngine::new());
        let mut builder = FactoryTable::builder();
        builder.register_type::<ActorProxy>().unwrap();
        let bridge = Bridge::new(engine.clone(), builder.build(), BridgeConfig::default());
        (engine, bridge)
    }

    #[test]
    fn test_unbind_after_bridge_shutdown_resets_binding() {
        let (_engine, bridge) = setup();
        let actor = bridge.create::<ActorProxy>().unwrap();
        assert!(actor.core().is_bound());
        assert_ne!(actor.core().token(), HandleToken::NONE);

        drop(bridge);
        assert!(actor.core().bridge().is_none());

        assert!(actor.core().unbind());
        assert_eq!(actor.core().mode(), BindingMode::Unbound);
        assert_eq!(actor.core().token(), HandleToken::NONE);
        assert_eq!(actor.core().state(), LifecycleState::Unbound);
        assert!(!actor.core().unbind());
    }

    #[test]
    fn test_dispose_after_bridge_shutdown_clears_token() {
        let (_engine, bridge) = setup();
        let actor = bridge.create::<ActorProxy>().unwrap();
        drop(bridge);

        assert!(actor.core().dispose());
        assert_eq!(actor.core().token(), HandleToken::NONE);
        assert_eq!(actor.core().state(), LifecycleState::Disposed);
    }
}
