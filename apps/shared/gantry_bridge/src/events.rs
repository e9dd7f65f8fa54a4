//! Engine event dispatch
//!
//! Proxies subscribe to engine events through `ProxyCore::subscribe`. The
//! engine hands back a `CallbackId` and later fires that id; the dispatcher
//! maps it to the control-layer handler that was registered with it.
//!
//! # Lifetime
//!
//! - **Registration**: when the engine accepts a subscription.
//! - **Removal**: on explicit unsubscribe, on Dispose, or when the proxy's
//!   finalization is processed by a reclamation pass.
//! - **Dispatch**: the handler is cloned out of the table before it runs, so
//!   a handler may subscribe or unsubscribe without deadlocking.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::handle::{CallbackId, ForeignPtr, ProxyId};
use crate::sync::{read, write};

/// Control-layer function run when the engine fires a callback
pub type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// One engine-side callback owned by a proxy
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub id: CallbackId,
    pub ptr: ForeignPtr,
    pub event: String,
}

/// Handler registration information
#[derive(Clone)]
pub struct EventHandler {
    /// Proxy that owns the subscription
    pub proxy: ProxyId,
    /// Engine event name
    pub event: String,
    callback: EventCallback,
}

#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<HashMap<CallbackId, EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for an engine callback id
    ///
    /// A second registration for the same id replaces the first; the engine
    /// never reuses an id while it is subscribed.
    pub fn register(
        &self,
        id: CallbackId,
        proxy: ProxyId,
        event: impl Into<String>,
        callback: EventCallback,
    ) {
        let handler = EventHandler {
            proxy,
            event: event.into(),
            callback,
        };
        write(&self.handlers).insert(id, handler);
    }

    /// Unregister a handler by its callback id
    pub fn unregister(&self, id: CallbackId) -> bool {
        write(&self.handlers).remove(&id).is_some()
    }

    /// Unregister all handlers owned by a proxy
    pub fn unregister_proxy(&self, proxy: ProxyId) -> usize {
        let mut handlers = write(&self.handlers);
        let before = handlers.len();
        handlers.retain(|_, h| h.proxy != proxy);
        before - handlers.len()
    }

    /// Run the handler registered for `id`
    ///
    /// Returns false when nothing is registered, which happens routinely for
    /// callbacks fired by the engine just before they were unsubscribed.
    pub fn dispatch(&self, id: CallbackId, payload: &Value) -> bool {
        let callback = match read(&self.handlers).get(&id) {
            Some(handler) => handler.callback.clone(),
            None => {
                tracing::trace!(callback = %id, "event for unregistered callback");
                return false;
            }
        };
        callback(payload);
        true
    }

    /// Number of registered handlers for an event name
    pub fn handler_count(&self, event: &str) -> usize {
        read(&self.handlers)
            .values()
            .filter(|h| h.event == event)
            .count()
    }

    pub fn len(&self) -> usize {
        read(&self.handlers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
