//! In-process simulated engine
//!
//! Behaves like a native engine as far as the bridge can tell: objects have
//! a declared type, a handle slot, a hold count and a destroyed flag.
//! Deletion is deferred until the last hold is released. Engine-side
//! destruction (`destroy_natively`) frees the object immediately and forgets
//! its hold, the way an engine tears down a level.
//!
//! Methods named `get_<property>` and `set_<property>` read and write a
//! per-object JSON property bag.

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::engine::ForeignEngine;
use crate::error::EngineError;
use crate::handle::{CallbackId, ForeignPtr, HandleToken};
use crate::sync::lock;
use crate::type_tag::TypeTag;

const FIRST_ADDRESS: usize = 0x1000_0000;
const OBJECT_STRIDE: usize = 0x40;

/// Call counters, for asserting what the bridge asked for
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SimCounters {
    pub set_handles: u64,
    pub retains: u64,
    pub releases: u64,
    pub deletes: u64,
    pub creates: u64,
    pub invokes: u64,
    pub subscribes: u64,
    pub unsubscribes: u64,
}

struct SimObject {
    tag: TypeTag,
    handle: HandleToken,
    holds: u32,
    destroyed: bool,
    delete_requested: bool,
    properties: Map<String, Value>,
    callbacks: HashMap<CallbackId, String>,
}

impl SimObject {
    fn new(tag: TypeTag) -> Self {
        Self {
            tag,
            handle: HandleToken::NONE,
            holds: 0,
            destroyed: false,
            delete_requested: false,
            properties: Map::new(),
            callbacks: HashMap::new(),
        }
    }
}

struct SimState {
    objects: HashMap<ForeignPtr, SimObject>,
    /// Addresses handed out by `spawn_at`; sequential ones are implied by `next_address`
    placed: HashSet<ForeignPtr>,
    next_address: usize,
    next_callback: u64,
    counters: SimCounters,
}

impl SimState {
    fn free(&mut self, ptr: ForeignPtr) {
        if self.objects.remove(&ptr).is_some() {
            tracing::trace!(%ptr, "sim object freed");
        }
    }

    fn issued(&self, ptr: ForeignPtr) -> bool {
        let addr = ptr.addr();
        let sequential = (FIRST_ADDRESS..self.next_address).contains(&addr)
            && (addr - FIRST_ADDRESS) % OBJECT_STRIDE == 0;
        sequential || self.placed.contains(&ptr)
    }
}

pub struct SimEngine {
    state: Mutex<SimState>,
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                objects: HashMap::new(),
                placed: HashSet::new(),
                next_address: FIRST_ADDRESS,
                next_callback: 1,
                counters: SimCounters::default(),
            }),
        }
    }

    /// Create an object the way engine code would, without the bridge knowing
    pub fn spawn(&self, tag: TypeTag) -> ForeignPtr {
        let mut state = lock(&self.state);
        let ptr = ForeignPtr::from_addr(state.next_address);
        state.next_address += OBJECT_STRIDE;
        state.objects.insert(ptr, SimObject::new(tag));
        ptr
    }

    /// Create an object at a fixed address
    pub fn spawn_at(&self, ptr: ForeignPtr, tag: TypeTag) {
        let mut state = lock(&self.state);
        state.placed.insert(ptr);
        state.objects.insert(ptr, SimObject::new(tag));
    }

    /// Engine-side destruction; returns the handle the object carried
    pub fn destroy_natively(&self, ptr: ForeignPtr) -> Option<HandleToken> {
        let mut state = lock(&self.state);
        let handle = state.objects.get(&ptr).map(|o| o.handle)?;
        state.free(ptr);
        Some(handle).filter(|h| !h.is_none())
    }

    pub fn handle_of(&self, ptr: ForeignPtr) -> Option<HandleToken> {
        lock(&self.state).objects.get(&ptr).map(|o| o.handle)
    }

    pub fn holds(&self, ptr: ForeignPtr) -> u32 {
        lock(&self.state).objects.get(&ptr).map_or(0, |o| o.holds)
    }

    /// The address was handed out and its object no longer exists
    pub fn is_freed(&self, ptr: ForeignPtr) -> bool {
        let state = lock(&self.state);
        state.issued(ptr) && !state.objects.contains_key(&ptr)
    }

    pub fn set_property(&self, ptr: ForeignPtr, name: &str, value: Value) {
        if let Some(object) = lock(&self.state).objects.get_mut(&ptr) {
            object.properties.insert(name.to_string(), value);
        }
    }

    pub fn property(&self, ptr: ForeignPtr, name: &str) -> Option<Value> {
        lock(&self.state)
            .objects
            .get(&ptr)
            .and_then(|o| o.properties.get(name).cloned())
    }

    /// Callbacks the engine would fire for `event` on `ptr`
    pub fn fire(&self, ptr: ForeignPtr, event: &str) -> Vec<CallbackId> {
        let state = lock(&self.state);
        let mut callbacks: Vec<CallbackId> = state
            .objects
            .get(&ptr)
            .map(|o| {
                o.callbacks
                    .iter()
                    .filter(|(_, e)| e.as_str() == event)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default();
        callbacks.sort();
        callbacks
    }

    /// Objects not yet destroyed, in address order
    pub fn live_objects(&self) -> Vec<ForeignPtr> {
        let state = lock(&self.state);
        let mut live: Vec<ForeignPtr> = state
            .objects
            .iter()
            .filter(|(_, o)| !o.destroyed)
            .map(|(ptr, _)| *ptr)
            .collect();
        live.sort();
        live
    }

    pub fn object_count(&self) -> usize {
        lock(&self.state).objects.len()
    }

    pub fn counters(&self) -> SimCounters {
        lock(&self.state).counters
    }
}

impl ForeignEngine for SimEngine {
    fn type_tag(&self, ptr: ForeignPtr) -> Option<TypeTag> {
        lock(&self.state).objects.get(&ptr).map(|o| o.tag)
    }

    fn is_destroyed(&self, ptr: ForeignPtr) -> bool {
        lock(&self.state).objects.get(&ptr).is_none_or(|o| o.destroyed)
    }

    fn set_handle(&self, ptr: ForeignPtr, token: HandleToken) {
        let mut state = lock(&self.state);
        state.counters.set_handles += 1;
        if let Some(object) = state.objects.get_mut(&ptr) {
            object.handle = token;
        }
    }

    fn retain(&self, ptr: ForeignPtr) {
        let mut state = lock(&self.state);
        state.counters.retains += 1;
        if let Some(object) = state.objects.get_mut(&ptr) {
            object.holds += 1;
        }
    }

    fn release(&self, ptr: ForeignPtr) {
        let mut state = lock(&self.state);
        state.counters.releases += 1;
        let free = match state.objects.get_mut(&ptr) {
            Some(object) => {
                object.holds = object.holds.saturating_sub(1);
                object.holds == 0 && object.delete_requested
            }
            None => false,
        };
        if free {
            state.free(ptr);
        }
    }

    fn delete(&self, ptr: ForeignPtr) {
        let mut state = lock(&self.state);
        state.counters.deletes += 1;
        let free = match state.objects.get_mut(&ptr) {
            Some(object) => {
                object.destroyed = true;
                object.delete_requested = true;
                object.holds == 0
            }
            None => false,
        };
        if free {
            state.free(ptr);
        }
    }

    fn create(&self, tag: TypeTag) -> Result<ForeignPtr, EngineError> {
        lock(&self.state).counters.creates += 1;
        Ok(self.spawn(tag))
    }

    fn invoke(&self, ptr: ForeignPtr, method: &str, args: &Value) -> Result<Value, EngineError> {
        let mut state = lock(&self.state);
        state.counters.invokes += 1;

        let object = match state.objects.get_mut(&ptr) {
            Some(object) if !object.destroyed => object,
            _ => return Err(EngineError::Destroyed(ptr)),
        };

        if let Some(property) = method.strip_prefix("get_") {
            return Ok(object.properties.get(property).cloned().unwrap_or(Value::Null));
        }
        if let Some(property) = method.strip_prefix("set_") {
            object.properties.insert(property.to_string(), args.clone());
            return Ok(Value::Null);
        }

        Err(EngineError::CallFailed {
            method: method.to_string(),
            reason: "no such method".to_string(),
        })
    }

    fn subscribe(&self, ptr: ForeignPtr, event: &str) -> Result<CallbackId, EngineError> {
        let mut state = lock(&self.state);
        state.counters.subscribes += 1;
        let id = CallbackId(state.next_callback);
        match state.objects.get_mut(&ptr) {
            Some(object) if !object.destroyed => {
                object.callbacks.insert(id, event.to_string());
            }
            _ => return Err(EngineError::Destroyed(ptr)),
        }
        state.next_callback += 1;
        Ok(id)
    }

    fn unsubscribe(&self, ptr: ForeignPtr, callback: CallbackId) {
        let mut state = lock(&self.state);
        state.counters.unsubscribes += 1;
        if let Some(object) = state.objects.get_mut(&ptr) {
            object.callbacks.remove(&callback);
        }
    }
}
