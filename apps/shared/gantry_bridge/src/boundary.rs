//! Boundary callback surface
//!
//! The four entry points the engine calls into, as `extern "C"` functions
//! over a process-wide bridge installed once at startup. None of them lets a
//! panic unwind into engine frames. A fatal error inside
//! `allocate_for_pointer` aborts the process: an object the bridge cannot
//! type would leave both sides disagreeing about what exists.

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::OnceLock;

use crate::bridge::Bridge;
use crate::error::{BridgeError, Result};
use crate::handle::{ForeignPtr, HandleToken};

static BRIDGE: OnceLock<Bridge> = OnceLock::new();

/// Function table handed to the engine
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BoundaryCallbacks {
    pub collect_garbage_now: extern "C" fn(),
    pub is_handle_valid: extern "C" fn(token: u64) -> bool,
    pub allocate_for_pointer: extern "C" fn(object: *mut c_void) -> u64,
    pub release_handle: extern "C" fn(token: u64),
}

pub const CALLBACKS: BoundaryCallbacks = BoundaryCallbacks {
    collect_garbage_now: gantry_collect_garbage_now,
    is_handle_valid: gantry_is_handle_valid,
    allocate_for_pointer: gantry_allocate_for_pointer,
    release_handle: gantry_release_handle,
};

/// Make `bridge` the target of the boundary callbacks; succeeds once per process
pub fn install(bridge: Bridge) -> Result<BoundaryCallbacks> {
    BRIDGE
        .set(bridge)
        .map_err(|_| BridgeError::AlreadyInstalled)?;
    tracing::info!("boundary callbacks installed");
    Ok(CALLBACKS)
}

/// The installed bridge, if any
pub fn installed() -> Option<&'static Bridge> {
    BRIDGE.get()
}

fn bridge_or_log(entry: &str) -> Option<&'static Bridge> {
    let bridge = BRIDGE.get();
    if bridge.is_none() {
        tracing::error!("{} called before the bridge was installed", entry);
    }
    bridge
}

fn fatal(message: &str) -> ! {
    tracing::error!("fatal boundary error: {}", message);
    std::process::abort()
}

#[unsafe(no_mangle)]
pub extern "C" fn gantry_collect_garbage_now() {
    let Some(bridge) = bridge_or_log("collect_garbage_now") else {
        return;
    };
    if panic::catch_unwind(AssertUnwindSafe(|| bridge.collect_garbage_now())).is_err() {
        tracing::error!("panic during reclamation pass");
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn gantry_is_handle_valid(token: u64) -> bool {
    match BRIDGE.get() {
        Some(bridge) => bridge.is_handle_valid(HandleToken::from_raw(token)),
        None => false,
    }
}

/// Returns the handle token, or `0` when no proxy could be attached
#[unsafe(no_mangle)]
pub extern "C" fn gantry_allocate_for_pointer(object: *mut c_void) -> u64 {
    let Some(bridge) = bridge_or_log("allocate_for_pointer") else {
        return HandleToken::NONE.as_raw();
    };
    let ptr = ForeignPtr::from_raw(object);

    match panic::catch_unwind(AssertUnwindSafe(|| bridge.allocate_for_pointer(ptr))) {
        Ok(Ok(token)) => token.as_raw(),
        Ok(Err(err)) if err.is_fatal() => fatal(&err.to_string()),
        Ok(Err(err)) => {
            tracing::warn!(%ptr, "allocate_for_pointer failed: {}", err);
            HandleToken::NONE.as_raw()
        }
        Err(_) => fatal(&format!("panic while allocating a proxy for {}", ptr)),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn gantry_release_handle(token: u64) {
    if let Some(bridge) = bridge_or_log("release_handle") {
        bridge.release_handle(HandleToken::from_raw(token));
    }
}
