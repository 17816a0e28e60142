//! Context lifecycle FFI functions: start, run, resume, consume, fork,
//! cancel and scoped access.
//!
//! Handles are passed as non-zero `uint64_t` values. Functions returning a
//! handle return 0 on failure and record the error on the engine.

#![allow(unsafe_op_in_unsafe_fn)]

use std::ffi::{CStr, CString, c_char, c_void};

use super::engine_ffi::get_wrapper;
use super::types::{CallbackScope, EngineWrapper, StrandEngine, StrandOpFn, StrandResult, StrandWithFn};
use crate::vm::{Handle, HostError, OpContext, OpHandler, Operation};

/// Adapts a C operation callback to [`OpHandler`].
struct CHandler {
    callback: StrandOpFn,
    userdata: *mut c_void,
}

impl OpHandler for CHandler {
    fn handle(&mut self, ctx: &mut OpContext<'_>, op: &Operation<'_>) -> Result<(), HostError> {
        let Some(callback) = self.callback else {
            return Err(HostError::from("operation callback is NULL"));
        };
        let name = CString::new(op.name).map_err(|_| HostError::from("operation name contains a NUL byte"))?;
        let mut scope = CallbackScope::Op(ctx);
        let result = unsafe {
            callback(
                scope.as_ptr(),
                name.as_ptr(),
                op.params.as_ptr(),
                op.params.len(),
                op.targets.as_ptr(),
                op.targets.len(),
                self.userdata,
            )
        };
        if result.is_ok() {
            Ok(())
        } else {
            Err(HostError(format!("operation callback returned {:?}", result)))
        }
    }
}

fn parse_handle(wrapper: &EngineWrapper, raw: u64) -> Option<Handle> {
    let handle = Handle::from_raw(raw);
    if handle.is_none() {
        wrapper.set_error(format!("invalid context handle {}", raw));
    }
    handle
}

unsafe fn parse_str<'a>(wrapper: &EngineWrapper, value: *const c_char, what: &str) -> Option<&'a str> {
    if value.is_null() {
        wrapper.set_error(format!("{} is NULL", what));
        return None;
    }
    match CStr::from_ptr(value).to_str() {
        Ok(value) => Some(value),
        Err(_) => {
            wrapper.set_error(format!("{} is not valid UTF-8", what));
            None
        }
    }
}

/// Load `bytecode` and start a context at the exported function `entry`.
///
/// Returns the new handle, or 0 on failure (see `strand_get_error`).
///
/// # Safety
///
/// `bytecode` must point to `len` readable bytes and `entry` to a
/// NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_start(
    engine: *mut StrandEngine,
    bytecode: *const u8,
    len: usize,
    entry: *const c_char,
    memory_size: usize,
    stack_size: usize,
) -> u64 {
    let Some(wrapper) = get_wrapper(engine) else {
        return 0;
    };
    if bytecode.is_null() {
        wrapper.set_error("bytecode is NULL");
        return 0;
    }
    let Some(entry) = parse_str(wrapper, entry, "entry") else {
        return 0;
    };
    let bytes = std::slice::from_raw_parts(bytecode, len);
    match wrapper.engine.start(bytes, entry, memory_size, stack_size) {
        Ok(handle) => handle.to_raw(),
        Err(err) => {
            wrapper.report(&err);
            0
        }
    }
}

/// Load `bytecode` and run `entry` to completion without registering a
/// context. `callback` receives every operation; `strand_context_pause` is
/// ignored.
///
/// # Safety
///
/// `bytecode` must point to `len` readable bytes and `entry` to a
/// NUL-terminated string.
#[allow(clippy::too_many_arguments)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_run(
    engine: *mut StrandEngine,
    bytecode: *const u8,
    len: usize,
    entry: *const c_char,
    memory_size: usize,
    stack_size: usize,
    callback: StrandOpFn,
    userdata: *mut c_void,
) -> StrandResult {
    let Some(wrapper) = get_wrapper(engine) else {
        return StrandResult::ErrorInvalidArg;
    };
    if bytecode.is_null() {
        wrapper.set_error("bytecode is NULL");
        return StrandResult::ErrorInvalidArg;
    }
    if callback.is_none() {
        wrapper.set_error("operation callback is NULL");
        return StrandResult::ErrorInvalidArg;
    }
    let Some(entry) = parse_str(wrapper, entry, "entry") else {
        return StrandResult::ErrorInvalidArg;
    };
    let bytes = std::slice::from_raw_parts(bytecode, len);
    let handler = CHandler { callback, userdata };
    match wrapper.engine.run(bytes, entry, memory_size, stack_size, handler) {
        Ok(()) => StrandResult::Ok,
        Err(err) => wrapper.report(&err),
    }
}

/// Run the context until one operation has been dispatched to `callback`.
///
/// `*more` receives false once the context has finished; the handle is
/// invalid afterwards.
///
/// # Safety
///
/// `more` must be NULL or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_resume(
    engine: *mut StrandEngine,
    handle: u64,
    callback: StrandOpFn,
    userdata: *mut c_void,
    more: *mut bool,
) -> StrandResult {
    run(engine, handle, callback, userdata, more, false)
}

/// Run the context until it finishes (`*more` = false) or a callback calls
/// `strand_context_pause` (`*more` = true).
///
/// # Safety
///
/// `more` must be NULL or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_consume(
    engine: *mut StrandEngine,
    handle: u64,
    callback: StrandOpFn,
    userdata: *mut c_void,
    more: *mut bool,
) -> StrandResult {
    run(engine, handle, callback, userdata, more, true)
}

unsafe fn run(
    engine: *mut StrandEngine,
    handle: u64,
    callback: StrandOpFn,
    userdata: *mut c_void,
    more: *mut bool,
    consume: bool,
) -> StrandResult {
    let Some(wrapper) = get_wrapper(engine) else {
        return StrandResult::ErrorInvalidArg;
    };
    if callback.is_none() {
        wrapper.set_error("operation callback is NULL");
        return StrandResult::ErrorInvalidArg;
    }
    let Some(handle) = parse_handle(wrapper, handle) else {
        return StrandResult::ErrorUnknownHandle;
    };

    let handler = CHandler { callback, userdata };
    let outcome = if consume {
        wrapper.engine.consume(handle, handler)
    } else {
        wrapper.engine.resume(handle, handler)
    };

    match outcome {
        Ok(value) => {
            if !more.is_null() {
                *more = value;
            }
            StrandResult::Ok
        }
        Err(err) => wrapper.report(&err),
    }
}

/// Start a new context running `entry` of the same bytecode as `parent`,
/// with a fresh arena. May be called from inside `parent`'s own callback.
///
/// Returns the new handle, or 0 on failure.
///
/// # Safety
///
/// `entry` must be a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_fork(
    engine: *mut StrandEngine,
    parent: u64,
    entry: *const c_char,
    memory_size: usize,
    stack_size: usize,
) -> u64 {
    let Some(wrapper) = get_wrapper(engine) else {
        return 0;
    };
    let Some(parent) = parse_handle(wrapper, parent) else {
        return 0;
    };
    let Some(entry) = parse_str(wrapper, entry, "entry") else {
        return 0;
    };
    match wrapper.engine.fork(parent, entry, memory_size, stack_size) {
        Ok(child) => child.to_raw(),
        Err(err) => {
            wrapper.report(&err);
            0
        }
    }
}

/// Cancel a context. Unknown and already cancelled handles are ignored.
///
/// # Safety
///
/// `engine` must be NULL or a valid engine pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_cancel(engine: *mut StrandEngine, handle: u64) -> StrandResult {
    let Some(wrapper) = get_wrapper(engine) else {
        return StrandResult::ErrorInvalidArg;
    };
    if let Some(handle) = Handle::from_raw(handle) {
        wrapper.engine.cancel(handle);
    }
    StrandResult::Ok
}

/// Call `callback` with exclusive access to a context that is not running.
///
/// # Safety
///
/// The context pointer passed to `callback` must not escape it.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_with(
    engine: *mut StrandEngine,
    handle: u64,
    callback: StrandWithFn,
    userdata: *mut c_void,
) -> StrandResult {
    let Some(wrapper) = get_wrapper(engine) else {
        return StrandResult::ErrorInvalidArg;
    };
    let Some(callback) = callback else {
        wrapper.set_error("callback is NULL");
        return StrandResult::ErrorInvalidArg;
    };
    let Some(handle) = parse_handle(wrapper, handle) else {
        return StrandResult::ErrorUnknownHandle;
    };
    let outcome = wrapper.engine.with(handle, |context| {
        let mut scope = CallbackScope::Plain(context);
        callback(scope.as_ptr(), userdata);
    });
    match outcome {
        Ok(()) => StrandResult::Ok,
        Err(err) => wrapper.report(&err),
    }
}

/// Whether `handle` names a registered context.
///
/// # Safety
///
/// `engine` must be NULL or a valid engine pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_context_alive(engine: *const StrandEngine, handle: u64) -> bool {
    match (get_wrapper(engine), Handle::from_raw(handle)) {
        (Some(wrapper), Some(handle)) => wrapper.engine.contains(handle),
        _ => false,
    }
}
