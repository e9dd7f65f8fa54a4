//! Proxy lifecycle transitions and reclamation
//!
//! ```text
//! Unbound --attach--> Bound(Pinned | Weak) --unbind/destroy--> Unbound
//!    |                        |
//!    +------dispose-----------+--dispose / finalizer--> Disposed
//! ```
//!
//! Dispose is terminal and idempotent. The finalizer path (a proxy dropped
//! without being disposed) is deferred: `ProxyCore::drop` queues a
//! [`Finalization`] and the next reclamation pass applies it.

use serde::Serialize;
use std::sync::atomic::Ordering;

use crate::binding::{BindingMode, Detach};
use crate::bridge::Shared;
use crate::events::Subscription;
use crate::handle::{ForeignPtr, HandleToken, ProxyId};
use crate::proxy::ProxyCore;
use crate::sync::lock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    Unbound,
    Bound(BindingMode),
    Disposed,
}

/// What a dropped proxy left behind for the reclamation pass
#[derive(Debug)]
pub(crate) struct Finalization {
    pub(crate) proxy: ProxyId,
    pub(crate) ptr: Option<ForeignPtr>,
    pub(crate) token: HandleToken,
    pub(crate) subscriptions: Vec<Subscription>,
}

/// Outcome of one reclamation pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CollectReport {
    /// Queued finalizations applied
    pub finalized: usize,
    /// Dead Weak entries removed without a finalization
    pub swept: usize,
}

impl Shared {
    /// Silent detach; with `expected` set, only if still attached to that pointer
    pub(crate) fn unbind(&self, core: &ProxyCore, expected: Option<ForeignPtr>) -> bool {
        let removed = {
            let mut table = lock(&self.table);
            let mut state = lock(&core.state);
            if state.attached.is_none() || (expected.is_some() && state.attached != expected) {
                return false;
            }
            self.detach_locked(&mut table, core.id(), &mut state, Detach::Silent)
        };
        drop(removed);
        true
    }

    /// Request engine deletion, then detach
    pub(crate) fn destroy(&self, core: &ProxyCore) -> bool {
        let removed = {
            let mut table = lock(&self.table);
            let mut state = lock(&core.state);
            let Some(ptr) = state.attached else {
                return false;
            };
            self.engine.delete(ptr);
            tracing::debug!(proxy_id = %core.id(), %ptr, "delete requested");
            self.detach_locked(&mut table, core.id(), &mut state, Detach::Notify)
        };
        drop(removed);
        true
    }

    pub(crate) fn dispose(&self, core: &ProxyCore) -> bool {
        let (removed, subscriptions) = {
            let mut table = lock(&self.table);
            let mut state = lock(&core.state);
            if state.disposed {
                return false;
            }
            let removed = self.detach_locked(&mut table, core.id(), &mut state, Detach::Notify);
            state.disposed = true;
            (removed, std::mem::take(&mut state.subscriptions))
        };
        drop(removed);

        self.drop_subscriptions(core.id(), subscriptions);
        tracing::debug!(proxy_id = %core.id(), "proxy disposed");
        true
    }

    fn drop_subscriptions(&self, proxy: ProxyId, subscriptions: Vec<Subscription>) {
        for subscription in &subscriptions {
            self.engine.unsubscribe(subscription.ptr, subscription.id);
        }
        self.events.unregister_proxy(proxy);
    }

    /// Called from `ProxyCore::drop`; never blocks
    pub(crate) fn enqueue_finalization(&self, finalization: Finalization) {
        let pending = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        let threshold = self.config.reclaim_warn_threshold;
        if threshold > 0 && pending == threshold {
            tracing::warn!(pending, "finalization queue is growing; is collect_garbage_now being called?");
        }
        if self.reclaim_tx.send(finalization).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn finalize(&self, finalization: Finalization) {
        let Finalization {
            proxy,
            ptr,
            token,
            subscriptions,
        } = finalization;

        if let Some(ptr) = ptr {
            let removed = {
                let mut table = lock(&self.table);
                let removed = if table.owned_by(ptr, proxy) {
                    let entry = table.entries.remove(&ptr);
                    self.engine.set_handle(ptr, HandleToken::NONE);
                    entry
                } else {
                    None
                };
                self.tracker.untrack(ptr, token);
                removed
            };
            drop(removed);
        }

        self.drop_subscriptions(proxy, subscriptions);
        tracing::trace!(proxy_id = %proxy, ?ptr, "proxy finalized");
    }

    /// Drain queued finalizations, then sweep dead Weak entries
    pub(crate) fn collect(&self) -> CollectReport {
        let drained: Vec<Finalization> = lock(&self.reclaim_rx).try_iter().collect();
        self.pending.fetch_sub(drained.len(), Ordering::AcqRel);

        let mut report = CollectReport {
            finalized: drained.len(),
            swept: 0,
        };
        for finalization in drained {
            self.finalize(finalization);
        }

        let removed = {
            let mut table = lock(&self.table);
            let mut removed = Vec::new();
            for ptr in table.dead_pointers() {
                removed.extend(self.reap_locked(&mut table, ptr, Detach::Notify));
            }
            removed
        };
        report.swept = removed.len();
        drop(removed);

        if report.finalized > 0 || report.swept > 0 {
            tracing::debug!(finalized = report.finalized, swept = report.swept, "reclamation pass");
        }
        report
    }
}
