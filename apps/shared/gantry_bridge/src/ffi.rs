//! C ABI engine adapter
//!
//! A native engine hands the bridge an [`EngineVTable`]: an opaque context
//! pointer plus one function pointer per [`ForeignEngine`] operation.
//! Method arguments and results cross as UTF-8 JSON.
//!
//! `invoke` status codes: `0` ok, `1` object destroyed, `2` object unknown,
//! anything else a failure whose message (if any) is in the out buffer.
//! Buffers written by the engine are always returned through `free_buffer`.

use serde_json::Value;
use std::ffi::{c_char, c_void, CString};
use std::ptr;

use crate::engine::ForeignEngine;
use crate::error::EngineError;
use crate::handle::{CallbackId, ForeignPtr, HandleToken};
use crate::type_tag::TypeTag;

pub const STATUS_OK: i32 = 0;
pub const STATUS_DESTROYED: i32 = 1;
pub const STATUS_UNKNOWN_OBJECT: i32 = 2;

/// Engine-owned byte buffer
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EngineBuffer {
    pub data: *mut u8,
    pub len: usize,
}

impl EngineBuffer {
    pub const fn empty() -> Self {
        Self {
            data: ptr::null_mut(),
            len: 0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct EngineVTable {
    pub context: *mut c_void,
    pub type_tag: unsafe extern "C" fn(context: *mut c_void, object: *mut c_void, out_tag: *mut u32) -> bool,
    pub is_destroyed: unsafe extern "C" fn(context: *mut c_void, object: *mut c_void) -> bool,
    pub set_handle: unsafe extern "C" fn(context: *mut c_void, object: *mut c_void, token: u64),
    pub retain: unsafe extern "C" fn(context: *mut c_void, object: *mut c_void),
    pub release: unsafe extern "C" fn(context: *mut c_void, object: *mut c_void),
    pub delete: unsafe extern "C" fn(context: *mut c_void, object: *mut c_void),
    pub create: unsafe extern "C" fn(context: *mut c_void, tag: u32) -> *mut c_void,
    pub invoke: unsafe extern "C" fn(
        context: *mut c_void,
        object: *mut c_void,
        method: *const c_char,
        args_json: *const c_char,
        out: *mut EngineBuffer,
    ) -> i32,
    pub subscribe: unsafe extern "C" fn(context: *mut c_void, object: *mut c_void, event: *const c_char) -> u64,
    pub unsubscribe: unsafe extern "C" fn(context: *mut c_void, object: *mut c_void, callback: u64),
    pub free_buffer: unsafe extern "C" fn(context: *mut c_void, buffer: EngineBuffer),
}

/// [`ForeignEngine`] over a native vtable
pub struct FfiEngine {
    vtable: EngineVTable,
}

// The vtable contract requires every entry to be callable from any thread.
unsafe impl Send for FfiEngine {}
unsafe impl Sync for FfiEngine {}

impl FfiEngine {
    /// # Safety
    ///
    /// Every function pointer must be valid for the lifetime of the returned
    /// engine, callable from any thread with `vtable.context`, and must
    /// honour the re-entrancy rules documented on [`ForeignEngine`].
    pub unsafe fn new(vtable: EngineVTable) -> Self {
        Self { vtable }
    }

    fn take_buffer(&self, buffer: EngineBuffer) -> Vec<u8> {
        if buffer.data.is_null() {
            return Vec::new();
        }
        // SAFETY: the engine wrote `len` initialized bytes at `data` and keeps
        // them alive until `free_buffer` is called below.
        let bytes = unsafe { std::slice::from_raw_parts(buffer.data, buffer.len) }.to_vec();
        unsafe { (self.vtable.free_buffer)(self.vtable.context, buffer) };
        bytes
    }
}

fn c_string(method: &str, text: &str) -> Result<CString, EngineError> {
    CString::new(text).map_err(|_| EngineError::CallFailed {
        method: method.to_string(),
        reason: "interior NUL byte".to_string(),
    })
}

impl ForeignEngine for FfiEngine {
    fn type_tag(&self, ptr: ForeignPtr) -> Option<TypeTag> {
        let mut raw = 0u32;
        let known = unsafe { (self.vtable.type_tag)(self.vtable.context, ptr.as_raw(), &mut raw) };
        known.then(|| TypeTag::from_raw(raw))
    }

    fn is_destroyed(&self, ptr: ForeignPtr) -> bool {
        unsafe { (self.vtable.is_destroyed)(self.vtable.context, ptr.as_raw()) }
    }

    fn set_handle(&self, ptr: ForeignPtr, token: HandleToken) {
        unsafe { (self.vtable.set_handle)(self.vtable.context, ptr.as_raw(), token.as_raw()) }
    }

    fn retain(&self, ptr: ForeignPtr) {
        unsafe { (self.vtable.retain)(self.vtable.context, ptr.as_raw()) }
    }

    fn release(&self, ptr: ForeignPtr) {
        unsafe { (self.vtable.release)(self.vtable.context, ptr.as_raw()) }
    }

    fn delete(&self, ptr: ForeignPtr) {
        unsafe { (self.vtable.delete)(self.vtable.context, ptr.as_raw()) }
    }

    fn create(&self, tag: TypeTag) -> Result<ForeignPtr, EngineError> {
        let raw = unsafe { (self.vtable.create)(self.vtable.context, tag.raw()) };
        if raw.is_null() {
            return Err(EngineError::Unsupported(tag));
        }
        Ok(ForeignPtr::from_raw(raw))
    }

    fn invoke(&self, ptr: ForeignPtr, method: &str, args: &Value) -> Result<Value, EngineError> {
        let method_c = c_string(method, method)?;
        let args_c = c_string(method, &args.to_string())?;

        let mut out = EngineBuffer::empty();
        let status = unsafe {
            (self.vtable.invoke)(
                self.vtable.context,
                ptr.as_raw(),
                method_c.as_ptr(),
                args_c.as_ptr(),
                &mut out,
            )
        };
        let payload = self.take_buffer(out);

        match status {
            STATUS_OK if payload.is_empty() => Ok(Value::Null),
            STATUS_OK => serde_json::from_slice(&payload).map_err(|err| EngineError::CallFailed {
                method: method.to_string(),
                reason: format!("invalid JSON result: {}", err),
            }),
            STATUS_DESTROYED => Err(EngineError::Destroyed(ptr)),
            STATUS_UNKNOWN_OBJECT => Err(EngineError::UnknownObject(ptr)),
            other => Err(EngineError::CallFailed {
                method: method.to_string(),
                reason: if payload.is_empty() {
                    format!("status {}", other)
                } else {
                    String::from_utf8_lossy(&payload).into_owned()
                },
            }),
        }
    }

    fn subscribe(&self, ptr: ForeignPtr, event: &str) -> Result<CallbackId, EngineError> {
        let event_c = c_string("subscribe", event)?;
        let id = unsafe { (self.vtable.subscribe)(self.vtable.context, ptr.as_raw(), event_c.as_ptr()) };
        if id != 0 {
            return Ok(CallbackId(id));
        }
        if self.is_destroyed(ptr) {
            return Err(EngineError::Destroyed(ptr));
        }
        Err(EngineError::CallFailed {
            method: "subscribe".to_string(),
            reason: format!("engine rejected event '{}'", event),
        })
    }

    fn unsubscribe(&self, ptr: ForeignPtr, callback: CallbackId) {
        unsafe { (self.vtable.unsubscribe)(self.vtable.context, ptr.as_raw(), callback.0) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimEngine;
    use serde_json::json;
    use std::ffi::CStr;
    use std::sync::Arc;

    unsafe fn sim<'a>(context: *mut c_void) -> &'a SimEngine {
        unsafe { &*(context as *const SimEngine) }
    }

    unsafe extern "C" fn sim_type_tag(context: *mut c_void, object: *mut c_void, out: *mut u32) -> bool {
        match unsafe { sim(context) }.type_tag(ForeignPtr::from_raw(object)) {
            Some(tag) => {
                unsafe { *out = tag.raw() };
                true
            }
            None => false,
        }
    }

    unsafe extern "C" fn sim_is_destroyed(context: *mut c_void, object: *mut c_void) -> bool {
        unsafe { sim(context) }.is_destroyed(ForeignPtr::from_raw(object))
    }

    unsafe extern "C" fn sim_set_handle(context: *mut c_void, object: *mut c_void, token: u64) {
        unsafe { sim(context) }.set_handle(ForeignPtr::from_raw(object), HandleToken::from_raw(token))
    }

    unsafe extern "C" fn sim_retain(context: *mut c_void, object: *mut c_void) {
        unsafe { sim(context) }.retain(ForeignPtr::from_raw(object))
    }

    unsafe extern "C" fn sim_release(context: *mut c_void, object: *mut c_void) {
        unsafe { sim(context) }.release(ForeignPtr::from_raw(object))
    }

    unsafe extern "C" fn sim_delete(context: *mut c_void, object: *mut c_void) {
        unsafe { sim(context) }.delete(ForeignPtr::from_raw(object))
    }

    unsafe extern "C" fn sim_create(context: *mut c_void, tag: u32) -> *mut c_void {
        match unsafe { sim(context) }.create(TypeTag::from_raw(tag)) {
            Ok(ptr) => ptr.as_raw(),
            Err(_) => ptr::null_mut(),
        }
    }

    fn write_buffer(out: *mut EngineBuffer, bytes: Vec<u8>) {
        let len = bytes.len();
        let data = Box::into_raw(bytes.into_boxed_slice()) as *mut u8;
        unsafe { *out = EngineBuffer { data, len } };
    }

    unsafe extern "C" fn sim_invoke(
        context: *mut c_void,
        object: *mut c_void,
        method: *const c_char,
        args_json: *const c_char,
        out: *mut EngineBuffer,
    ) -> i32 {
        let method = unsafe { CStr::from_ptr(method) }.to_str().unwrap();
        let args: Value = serde_json::from_slice(unsafe { CStr::from_ptr(args_json) }.to_bytes()).unwrap();
        match unsafe { sim(context) }.invoke(ForeignPtr::from_raw(object), method, &args) {
            Ok(Value::Null) => STATUS_OK,
            Ok(value) => {
                write_buffer(out, value.to_string().into_bytes());
                STATUS_OK
            }
            Err(EngineError::Destroyed(_)) => STATUS_DESTROYED,
            Err(err) => {
                write_buffer(out, err.to_string().into_bytes());
                7
            }
        }
    }

    unsafe extern "C" fn sim_subscribe(context: *mut c_void, object: *mut c_void, event: *const c_char) -> u64 {
        let event = unsafe { CStr::from_ptr(event) }.to_str().unwrap();
        unsafe { sim(context) }
            .subscribe(ForeignPtr::from_raw(object), event)
            .map_or(0, |id| id.0)
    }

    unsafe extern "C" fn sim_unsubscribe(context: *mut c_void, object: *mut c_void, callback: u64) {
        unsafe { sim(context) }.unsubscribe(ForeignPtr::from_raw(object), CallbackId(callback))
    }

    unsafe extern "C" fn free_buffer(_context: *mut c_void, buffer: EngineBuffer) {
        drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(buffer.data, buffer.len)) });
    }

    fn ffi_over(engine: &Arc<SimEngine>) -> FfiEngine {
        let vtable = EngineVTable {
            context: Arc::as_ptr(engine) as *mut c_void,
            type_tag: sim_type_tag,
            is_destroyed: sim_is_destroyed,
            set_handle: sim_set_handle,
            retain: sim_retain,
            release: sim_release,
            delete: sim_delete,
            create: sim_create,
            invoke: sim_invoke,
            subscribe: sim_subscribe,
            unsubscribe: sim_unsubscribe,
            free_buffer,
        };
        unsafe { FfiEngine::new(vtable) }
    }

    #[test]
    fn test_vtable_round_trip() {
        let sim = Arc::new(SimEngine::new());
        let engine = ffi_over(&sim);
        let tag = TypeTag::of("Actor");

        let ptr = engine.create(tag).unwrap();
        assert_eq!(engine.type_tag(ptr), Some(tag));
        assert!(!engine.is_destroyed(ptr));

        engine.set_handle(ptr, HandleToken::from_raw(3));
        engine.retain(ptr);
        assert_eq!(sim.handle_of(ptr), Some(HandleToken::from_raw(3)));
        assert_eq!(sim.holds(ptr), 1);

        engine.invoke(ptr, "set_name", &json!("probe")).unwrap();
        assert_eq!(engine.invoke(ptr, "get_name", &Value::Null).unwrap(), json!("probe"));

        let callback = engine.subscribe(ptr, "hit").unwrap();
        assert_eq!(sim.fire(ptr, "hit"), vec![callback]);
        engine.unsubscribe(ptr, callback);
        assert!(sim.fire(ptr, "hit").is_empty());

        engine.delete(ptr);
        engine.release(ptr);
        assert!(sim.is_freed(ptr));
    }

    #[test]
    fn test_status_codes_map_to_errors() {
        let sim = Arc::new(SimEngine::new());
        let engine = ffi_over(&sim);
        let ptr = sim.spawn(TypeTag::of("Actor"));

        let err = engine.invoke(ptr, "explode", &Value::Null).unwrap_err();
        assert!(matches!(err, EngineError::CallFailed { ref reason, .. } if reason.contains("no such method")));

        sim.destroy_natively(ptr);
        assert_eq!(engine.invoke(ptr, "get_name", &Value::Null), Err(EngineError::Destroyed(ptr)));
        assert_eq!(engine.subscribe(ptr, "hit"), Err(EngineError::Destroyed(ptr)));
        assert_eq!(engine.type_tag(ptr), None);
    }
}
