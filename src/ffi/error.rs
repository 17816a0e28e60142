//! Error handling FFI functions.

#![allow(unsafe_op_in_unsafe_fn)]

use std::ffi::c_char;

use super::engine_ffi::get_wrapper;
use super::types::StrandEngine;

/// Get the last error message.
///
/// Returns a pointer to the error message string, or NULL if no error.
/// The returned pointer is valid until the next API call that may set an error.
///
/// # Example (C)
/// ```c
/// uint64_t h = strand_start(engine, code, len, "main", 4096, 4096);
/// if (h == 0) {
///     printf("Error: %s\n", strand_get_error(engine));
/// }
/// ```
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_get_error(engine: *const StrandEngine) -> *const c_char {
    get_wrapper(engine)
        .and_then(|wrapper| wrapper.last_error.lock().as_ref().map(|error| error.as_ptr()))
        .unwrap_or(std::ptr::null())
}

/// Clear the last error.
///
/// After calling this, `strand_get_error` will return NULL until
/// another error occurs.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_clear_error(engine: *const StrandEngine) {
    if let Some(wrapper) = get_wrapper(engine) {
        wrapper.clear_error();
    }
}

/// Check if there is a pending error.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_has_error(engine: *const StrandEngine) -> bool {
    get_wrapper(engine).is_some_and(|wrapper| wrapper.last_error.lock().is_some())
}
