//! Context control FFI functions.
//!
//! These act on the context suspended in the current operation callback and
//! fail with `STRAND_ERROR_INVALID_ARG` when called from `strand_with`.

#![allow(unsafe_op_in_unsafe_fn)]

use std::ffi::{CStr, c_char};

use super::types::{StrandContext, StrandResult, get_scope};

/// Continue at `label` of the function that issued the operation once the
/// callback returns.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_context_go_to(ctx: *mut StrandContext, label: *const c_char) -> StrandResult {
    let Some(op) = get_scope(ctx).and_then(|scope| scope.op()) else {
        return StrandResult::ErrorInvalidArg;
    };
    if label.is_null() {
        return StrandResult::ErrorInvalidArg;
    }
    let Ok(label) = CStr::from_ptr(label).to_str() else {
        return StrandResult::ErrorInvalidArg;
    };
    match op.go_to(label) {
        Ok(()) => StrandResult::Ok,
        Err(err) => (&err).into(),
    }
}

/// Return from the function that issued the operation once the callback
/// returns.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_context_return(ctx: *mut StrandContext) -> StrandResult {
    match get_scope(ctx).and_then(|scope| scope.op()) {
        Some(op) => {
            op.force_return();
            StrandResult::Ok
        }
        None => StrandResult::ErrorInvalidArg,
    }
}

/// Make an enclosing `strand_consume` return after this operation.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_context_pause(ctx: *mut StrandContext) -> StrandResult {
    match get_scope(ctx).and_then(|scope| scope.op()) {
        Some(op) => {
            op.pause();
            StrandResult::Ok
        }
        None => StrandResult::ErrorInvalidArg,
    }
}

/// Handle of the context behind `ctx`, or 0 for NULL.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_context_handle(ctx: *mut StrandContext) -> u64 {
    get_scope(ctx).map_or(0, |scope| scope.context().handle().to_raw())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::types::CallbackScope;
    use crate::vm::{Engine, Function, Module};
    use std::sync::Arc;

    #[test]
    fn test_control_requires_operation_scope() {
        let engine = Engine::default();
        let mut module = Module::new();
        module.function(Function::new("main").exported().label("top"));
        let handle = engine.start_module(Arc::new(module), "main", 64, 64).unwrap();
        engine
            .with(handle, |context| {
                let mut scope = CallbackScope::Plain(context);
                let ctx = scope.as_ptr();
                let label = std::ffi::CString::new("top").unwrap();
                unsafe {
                    assert_eq!(strand_context_go_to(ctx, label.as_ptr()), StrandResult::ErrorInvalidArg);
                    assert_eq!(strand_context_return(ctx), StrandResult::ErrorInvalidArg);
                    assert_eq!(strand_context_pause(ctx), StrandResult::ErrorInvalidArg);
                    assert_eq!(strand_context_handle(ctx), handle.to_raw());
                }
            })
            .unwrap();
    }

    #[test]
    fn test_null_context() {
        unsafe {
            assert_eq!(strand_context_return(std::ptr::null_mut()), StrandResult::ErrorInvalidArg);
            assert_eq!(strand_context_handle(std::ptr::null_mut()), 0);
        }
    }
}
