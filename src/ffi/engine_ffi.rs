//! Engine lifecycle FFI functions.

#![allow(unsafe_op_in_unsafe_fn)]

use std::ffi::{CStr, c_char, c_void};

use super::types::{EngineWrapper, StrandEngine, StrandErrorFn};
use crate::config::EngineConfig;
use crate::vm::Engine;

/// Create a new engine with the default configuration.
///
/// The returned engine must be freed with `strand_engine_free()`.
///
/// # Example (C)
/// ```c
/// StrandEngine *engine = strand_engine_new();
/// // ... start and resume contexts ...
/// strand_engine_free(engine);
/// ```
#[unsafe(no_mangle)]
pub extern "C" fn strand_engine_new() -> *mut StrandEngine {
    into_raw(EngineWrapper::new(Engine::default()))
}

/// Create a new engine from a TOML configuration string.
///
/// Returns NULL if `config` is NULL, not UTF-8 or not a valid configuration.
///
/// # Safety
///
/// `config` must be NULL or point to a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_engine_new_with_config(config: *const c_char) -> *mut StrandEngine {
    if config.is_null() {
        return std::ptr::null_mut();
    }
    let Ok(text) = CStr::from_ptr(config).to_str() else {
        return std::ptr::null_mut();
    };
    match EngineConfig::from_toml_str(text) {
        Ok(config) => into_raw(EngineWrapper::new(Engine::new(config))),
        Err(err) => {
            tracing::debug!(%err, "rejected engine config");
            std::ptr::null_mut()
        }
    }
}

/// Free an engine and every context it still owns.
///
/// # Safety
///
/// - `engine` must be a valid pointer returned by `strand_engine_new*()`
/// - `engine` must not have been freed already
/// - No call may be in progress on this engine
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_engine_free(engine: *mut StrandEngine) {
    if engine.is_null() {
        return;
    }
    let _ = Box::from_raw(engine as *mut EngineWrapper);
}

/// Set the error callback function.
///
/// The callback will be invoked whenever an error is recorded.
///
/// # Arguments
/// - `engine`: Valid engine instance
/// - `callback`: Error callback function (or NULL to disable)
/// - `userdata`: User data passed to callback
///
/// # Safety
///
/// Must not be called from inside a callback of the same engine.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_set_error_callback(
    engine: *mut StrandEngine,
    callback: StrandErrorFn,
    userdata: *mut c_void,
) {
    if let Some(wrapper) = get_wrapper_mut(engine) {
        wrapper.error_callback = callback;
        wrapper.error_userdata = userdata;
    }
}

/// Number of contexts currently registered with the engine.
///
/// # Safety
///
/// `engine` must be NULL or a valid engine pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_engine_context_count(engine: *const StrandEngine) -> usize {
    get_wrapper(engine).map_or(0, |wrapper| wrapper.engine.len())
}

fn into_raw(wrapper: EngineWrapper) -> *mut StrandEngine {
    Box::into_raw(Box::new(wrapper)) as *mut StrandEngine
}

/// Helper to get a mutable reference to the wrapper from a raw pointer.
///
/// Returns None if the pointer is null.
pub(crate) unsafe fn get_wrapper_mut<'a>(engine: *mut StrandEngine) -> Option<&'a mut EngineWrapper> {
    if engine.is_null() {
        None
    } else {
        Some(&mut *(engine as *mut EngineWrapper))
    }
}

/// Helper to get a shared reference to the wrapper from a raw pointer.
///
/// Returns None if the pointer is null.
pub(crate) unsafe fn get_wrapper<'a>(engine: *const StrandEngine) -> Option<&'a EngineWrapper> {
    if engine.is_null() {
        None
    } else {
        Some(&*(engine as *const EngineWrapper))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn test_engine_new_free() {
        let engine = strand_engine_new();
        assert!(!engine.is_null());
        unsafe {
            assert_eq!(strand_engine_context_count(engine), 0);
            strand_engine_free(engine);
        }
    }

    #[test]
    fn test_engine_free_null() {
        unsafe {
            strand_engine_free(std::ptr::null_mut());
        }
    }

    #[test]
    fn test_engine_with_config() {
        let good = CString::new("max_contexts = 2").unwrap();
        let bad = CString::new("max_contexts = \"two\"").unwrap();
        unsafe {
            let engine = strand_engine_new_with_config(good.as_ptr());
            assert!(!engine.is_null());
            assert_eq!(
                get_wrapper(engine).unwrap().engine.config().max_contexts,
                Some(2)
            );
            strand_engine_free(engine);

            assert!(strand_engine_new_with_config(bad.as_ptr()).is_null());
            assert!(strand_engine_new_with_config(std::ptr::null()).is_null());
        }
    }

    #[test]
    fn test_error_callback() {
        use std::sync::atomic::{AtomicBool, Ordering};

        static CALLBACK_CALLED: AtomicBool = AtomicBool::new(false);

        unsafe extern "C" fn test_callback(_message: *const c_char, _userdata: *mut c_void) {
            CALLBACK_CALLED.store(true, Ordering::SeqCst);
        }

        let engine = strand_engine_new();
        unsafe {
            strand_set_error_callback(engine, Some(test_callback), std::ptr::null_mut());

            get_wrapper(engine).unwrap().set_error("test error");

            assert!(CALLBACK_CALLED.load(Ordering::SeqCst));
            strand_engine_free(engine);
        }
    }
}
