//! Identity binding
//!
//! The handle table maps each foreign pointer to the one proxy attached to
//! it. A Pinned entry owns the proxy; a Weak entry lets it be reclaimed once
//! control-layer code lets go, after which the entry is dead until a
//! reclamation pass (or the next lookup of the pointer) reaps it.
//!
//! All functions here run with the table lock held and take proxy state
//! locks after it. Removed table references are handed back to the caller so
//! proxies are dropped after the locks are released.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use crate::bridge::Shared;
use crate::error::{BridgeError, Result};
use crate::handle::{ForeignPtr, HandleToken, ProxyId};
use crate::proxy::{BindingState, Proxy};
use crate::sync::lock;
use crate::tracker::Owner;

/// How the handle table references a proxy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindingMode {
    Unbound,
    /// The table holds a strong reference; the proxy outlives its holders
    Pinned,
    /// The table holds a weak reference; the proxy is collectible
    Weak,
}

pub(crate) enum TableRef {
    Pinned(Arc<dyn Proxy>),
    Weak(Weak<dyn Proxy>),
}

impl TableRef {
    pub(crate) fn new(proxy: &Arc<dyn Proxy>, mode: BindingMode) -> Self {
        match mode {
            BindingMode::Weak => TableRef::Weak(Arc::downgrade(proxy)),
            _ => TableRef::Pinned(Arc::clone(proxy)),
        }
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<dyn Proxy>> {
        match self {
            TableRef::Pinned(proxy) => Some(Arc::clone(proxy)),
            TableRef::Weak(proxy) => proxy.upgrade(),
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        match self {
            TableRef::Pinned(_) => true,
            TableRef::Weak(proxy) => proxy.strong_count() > 0,
        }
    }

    pub(crate) fn mode(&self) -> BindingMode {
        match self {
            TableRef::Pinned(_) => BindingMode::Pinned,
            TableRef::Weak(_) => BindingMode::Weak,
        }
    }
}

pub(crate) struct Entry {
    pub(crate) proxy_id: ProxyId,
    pub(crate) token: HandleToken,
    pub(crate) reference: TableRef,
}

#[derive(Default)]
pub(crate) struct HandleTable {
    pub(crate) entries: HashMap<ForeignPtr, Entry>,
    /// Pointers whose proxy is being created by `creator`
    pub(crate) creating: HashSet<ForeignPtr>,
    /// Thread inside the creation section; nested creation stays on it
    pub(crate) creator: Option<ThreadId>,
    /// Engine releases that arrived while their pointer was being created
    pub(crate) deferred_releases: Vec<(ForeignPtr, HandleToken)>,
}

impl HandleTable {
    pub(crate) fn owned_by(&self, ptr: ForeignPtr, proxy: ProxyId) -> bool {
        self.entries.get(&ptr).is_some_and(|e| e.proxy_id == proxy)
    }

    /// Another thread is inside the creation section
    pub(crate) fn created_elsewhere(&self, me: ThreadId) -> bool {
        self.creator.is_some_and(|creator| creator != me)
    }

    pub(crate) fn dead_pointers(&self) -> Vec<ForeignPtr> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.reference.is_live())
            .map(|(ptr, _)| *ptr)
            .collect()
    }
}

/// Whether detaching tells the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Detach {
    /// Object already gone or the engine initiated the release
    Silent,
    /// Clear the engine's cross-reference and release its hold
    Notify,
}

impl Shared {
    /// Attach `proxy` to `ptr` in `mode`; returns the attachment's token
    pub(crate) fn attach_locked(
        &self,
        table: &mut HandleTable,
        proxy: &Arc<dyn Proxy>,
        ptr: ForeignPtr,
        mode: BindingMode,
        owner: Owner,
        released: &mut Vec<TableRef>,
    ) -> Result<HandleToken> {
        if mode == BindingMode::Unbound {
            return Err(BridgeError::UnboundAttach);
        }
        if ptr.is_null() {
            return Err(BridgeError::NullPointer);
        }

        let core = proxy.core();
        let id = core.id();

        if let Some(entry) = table.entries.get(&ptr) {
            if entry.proxy_id != id {
                if entry.reference.is_live() {
                    return Err(BridgeError::AlreadyBound {
                        ptr,
                        existing: entry.proxy_id,
                    });
                }
                released.extend(self.reap_locked(table, ptr, Detach::Notify));
            }
        }

        let mut state = lock(&core.state);
        if state.disposed {
            return Err(BridgeError::Disposed(id));
        }

        if state.attached == Some(ptr) {
            if let Some(entry) = table.entries.get_mut(&ptr).filter(|e| e.proxy_id == id) {
                if entry.reference.mode() != mode {
                    released.push(mem::replace(&mut entry.reference, TableRef::new(proxy, mode)));
                    state.mode = mode;
                    tracing::debug!(proxy_id = %id, %ptr, ?mode, "binding mode switched");
                }
                return Ok(state.token);
            }
        }

        if state.attached.is_some() {
            released.extend(self.detach_locked(table, id, &mut state, Detach::Notify));
        }

        let token = self.tracker.track(ptr, owner);
        self.engine.set_handle(ptr, token);
        table.entries.insert(
            ptr,
            Entry {
                proxy_id: id,
                token,
                reference: TableRef::new(proxy, mode),
            },
        );
        state.attached = Some(ptr);
        state.mode = mode;
        state.token = token;

        tracing::debug!(proxy_id = %id, %ptr, %token, ?mode, tag = %core.type_tag(), "proxy attached");
        Ok(token)
    }

    /// Detach the proxy whose state is `state`
    pub(crate) fn detach_locked(
        &self,
        table: &mut HandleTable,
        id: ProxyId,
        state: &mut BindingState,
        how: Detach,
    ) -> Option<TableRef> {
        let ptr = state.attached.take()?;
        let token = mem::take(&mut state.token);
        state.mode = BindingMode::Unbound;

        let removed = if table.owned_by(ptr, id) {
            table.entries.remove(&ptr).map(|e| e.reference)
        } else {
            None
        };

        match how {
            Detach::Notify => {
                if removed.is_some() {
                    self.engine.set_handle(ptr, HandleToken::NONE);
                }
                self.tracker.untrack(ptr, token);
            }
            Detach::Silent => {
                self.tracker.retire(ptr, token, false);
            }
        }

        tracing::debug!(proxy_id = %id, %ptr, %token, ?how, "proxy detached");
        removed
    }

    /// Remove the entry for `ptr` without going through its proxy
    ///
    /// Used for dead Weak entries, whose proxy state no longer exists.
    pub(crate) fn reap_locked(
        &self,
        table: &mut HandleTable,
        ptr: ForeignPtr,
        how: Detach,
    ) -> Option<TableRef> {
        let entry = table.entries.remove(&ptr)?;
        match how {
            Detach::Notify => {
                self.engine.set_handle(ptr, HandleToken::NONE);
                self.tracker.untrack(ptr, entry.token);
            }
            Detach::Silent => {
                self.tracker.retire(ptr, entry.token, false);
            }
        }

        tracing::debug!(proxy_id = %entry.proxy_id, %ptr, token = %entry.token, ?how, "dead entry reaped");
        Some(entry.reference)
    }
}
