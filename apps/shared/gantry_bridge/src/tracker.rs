//! Ownership tracking
//!
//! Every attachment of a proxy to a foreign pointer holds exactly one
//! ownership token. The tracker is the single source of truth for "is anyone
//! on the control-layer side still using this pointer": the engine is told to
//! hold the object when the first token for it is issued and may free it once
//! the last one is retired.

use serde::Serialize;
use std::collections::HashMap;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::engine::ForeignEngine;
use crate::handle::{ForeignPtr, HandleToken};
use crate::sync::lock;

/// Diagnostic description of who asked for a token
#[derive(Clone, Copy, Debug)]
pub enum Owner {
    /// Source location of a control-layer call
    Caller(&'static Location<'static>),
    /// Fixed label, used for boundary entry points
    Label(&'static str),
    /// Diagnostics disabled
    Unknown,
}

impl Owner {
    fn describe(self) -> Option<String> {
        match self {
            Owner::Caller(location) => Some(location.to_string()),
            Owner::Label(label) => Some(label.to_string()),
            Owner::Unknown => None,
        }
    }
}

/// One outstanding token, as reported in leak diagnostics
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TokenRecord {
    pub token: HandleToken,
    pub ptr: ForeignPtr,
    pub owner: Option<String>,
}

/// Lifetime counters of the tracker
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub issued: u64,
    pub retired: u64,
    pub outstanding: usize,
}

#[derive(Default)]
struct TrackerState {
    tokens: HashMap<HandleToken, TokenRecord>,
    per_pointer: HashMap<ForeignPtr, usize>,
    issued: u64,
    retired: u64,
}

pub struct OwnershipTracker {
    engine: Arc<dyn ForeignEngine>,
    next_token: AtomicU64,
    record_owners: bool,
    state: Mutex<TrackerState>,
}

impl OwnershipTracker {
    pub fn new(engine: Arc<dyn ForeignEngine>, record_owners: bool) -> Self {
        Self {
            engine,
            next_token: AtomicU64::new(1),
            record_owners,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Issue a new token for `ptr`
    ///
    /// The engine is asked to retain the object when this is the first
    /// outstanding token for it.
    pub fn track(&self, ptr: ForeignPtr, owner: Owner) -> HandleToken {
        let token = HandleToken::from_raw(self.next_token.fetch_add(1, Ordering::Relaxed));
        let owner = if self.record_owners { owner.describe() } else { None };

        let mut state = lock(&self.state);
        state.tokens.insert(token, TokenRecord { token, ptr, owner });
        state.issued += 1;
        let count = state.per_pointer.entry(ptr).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.engine.retain(ptr);
        }

        tracing::trace!(%ptr, %token, "token issued");
        token
    }

    /// Retire `token` and notify the engine when it was the last one for `ptr`
    pub fn untrack(&self, ptr: ForeignPtr, token: HandleToken) -> bool {
        self.retire(ptr, token, true)
    }

    /// Retire `token`; with `notify == false` the engine is not told
    ///
    /// Silent retirement is for objects the engine already considers gone.
    /// Unknown tokens and tokens issued for a different pointer are a logged
    /// no-op, so counts never go negative.
    pub fn retire(&self, ptr: ForeignPtr, token: HandleToken, notify: bool) -> bool {
        let mut state = lock(&self.state);

        match state.tokens.get(&token) {
            Some(record) if record.ptr == ptr => {}
            Some(record) => {
                tracing::warn!(%token, %ptr, actual = %record.ptr, "token retired against the wrong pointer");
                return false;
            }
            None => {
                tracing::debug!(%token, %ptr, "token already retired");
                return false;
            }
        }

        state.tokens.remove(&token);
        state.retired += 1;

        let remaining = match state.per_pointer.get_mut(&ptr) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            state.per_pointer.remove(&ptr);
            if notify {
                self.engine.release(ptr);
            }
        }

        tracing::trace!(%ptr, %token, notify, "token retired");
        true
    }

    /// Pass-through to the engine's liveness flag; never cached
    pub fn is_destroyed(&self, ptr: ForeignPtr) -> bool {
        self.engine.is_destroyed(ptr)
    }

    /// Number of outstanding tokens for `ptr`
    pub fn outstanding(&self, ptr: ForeignPtr) -> usize {
        lock(&self.state).per_pointer.get(&ptr).copied().unwrap_or(0)
    }

    /// Pointer a still-outstanding token was issued for
    pub fn pointer_of(&self, token: HandleToken) -> Option<ForeignPtr> {
        lock(&self.state).tokens.get(&token).map(|record| record.ptr)
    }

    pub fn stats(&self) -> TrackerStats {
        let state = lock(&self.state);
        TrackerStats {
            issued: state.issued,
            retired: state.retired,
            outstanding: state.tokens.len(),
        }
    }

    /// All outstanding tokens ordered by issue
    pub fn snapshot(&self) -> Vec<TokenRecord> {
        let mut records: Vec<TokenRecord> = lock(&self.state).tokens.values().cloned().collect();
        records.sort_by_key(|record| record.token);
        records
    }
}
