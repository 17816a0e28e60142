//! Arena access FFI functions.
//!
//! Every function takes the context pointer handed to an operation or
//! `strand_with` callback. Addresses are arena offsets; no function ever
//! exposes a native pointer into the arena.

#![allow(unsafe_op_in_unsafe_fn)]

use std::ffi::{CStr, c_char};

use super::types::{StrandContext, StrandResult, StrandStateInfo, get_scope};
use crate::vm::{Address, Context, Primitive, VmError};

/// Run `f` on the context behind `ctx` and collapse the outcome to a code.
unsafe fn with_context<T>(
    ctx: *mut StrandContext,
    f: impl FnOnce(&mut Context) -> Result<T, VmError>,
    out: *mut T,
) -> StrandResult {
    let Some(scope) = get_scope(ctx) else {
        return StrandResult::ErrorInvalidArg;
    };
    match f(scope.context()) {
        Ok(value) => {
            if !out.is_null() {
                *out = value;
            }
            StrandResult::Ok
        }
        Err(err) => (&err).into(),
    }
}

unsafe fn load_typed<T: Primitive>(ctx: *mut StrandContext, address: Address, out: *mut T) -> StrandResult {
    if out.is_null() {
        return StrandResult::ErrorInvalidArg;
    }
    with_context(ctx, |context| context.load::<T>(address), out)
}

unsafe fn store_typed<T: Primitive>(ctx: *mut StrandContext, address: Address, value: T) -> StrandResult {
    with_context(ctx, |context| context.store(address, value), std::ptr::null_mut())
}

// =============================================================================
// Capacity
// =============================================================================

/// Total arena capacity in bytes, or 0 if the context has been released.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_size(ctx: *mut StrandContext) -> usize {
    let mut size = 0;
    with_context(ctx, |context| context.state_size(), &mut size);
    size
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_info(ctx: *mut StrandContext, out: *mut StrandStateInfo) -> StrandResult {
    if out.is_null() {
        return StrandResult::ErrorInvalidArg;
    }
    with_context(ctx, |context| context.info().map(StrandStateInfo::from), out)
}

// =============================================================================
// Raw bytes
// =============================================================================

/// Copy `len` bytes at `address` into `out`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_load(
    ctx: *mut StrandContext,
    address: usize,
    out: *mut u8,
    len: usize,
) -> StrandResult {
    if out.is_null() && len > 0 {
        return StrandResult::ErrorInvalidArg;
    }
    with_context(
        ctx,
        |context| {
            let bytes = context.load_bytes(address, len)?;
            if len > 0 {
                std::slice::from_raw_parts_mut(out, len).copy_from_slice(bytes);
            }
            Ok(())
        },
        std::ptr::null_mut(),
    )
}

/// Copy `len` bytes from `data` to `address`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_store(
    ctx: *mut StrandContext,
    address: usize,
    data: *const u8,
    len: usize,
) -> StrandResult {
    if data.is_null() && len > 0 {
        return StrandResult::ErrorInvalidArg;
    }
    let bytes: &[u8] = if len == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(data, len)
    };
    with_context(ctx, |context| context.store_bytes(address, bytes), std::ptr::null_mut())
}

// =============================================================================
// Typed access
// =============================================================================

#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_load_u8(ctx: *mut StrandContext, address: usize, out: *mut u8) -> StrandResult {
    load_typed(ctx, address, out)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_load_i32(ctx: *mut StrandContext, address: usize, out: *mut i32) -> StrandResult {
    load_typed(ctx, address, out)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_load_i64(ctx: *mut StrandContext, address: usize, out: *mut i64) -> StrandResult {
    load_typed(ctx, address, out)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_load_f32(ctx: *mut StrandContext, address: usize, out: *mut f32) -> StrandResult {
    load_typed(ctx, address, out)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_load_f64(ctx: *mut StrandContext, address: usize, out: *mut f64) -> StrandResult {
    load_typed(ctx, address, out)
}

/// Read the address stored in the 8-byte cell at `address`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_load_address(
    ctx: *mut StrandContext,
    address: usize,
    out: *mut usize,
) -> StrandResult {
    if out.is_null() {
        return StrandResult::ErrorInvalidArg;
    }
    with_context(ctx, |context| context.load_address(address), out)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_store_u8(ctx: *mut StrandContext, address: usize, value: u8) -> StrandResult {
    store_typed(ctx, address, value)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_store_i32(ctx: *mut StrandContext, address: usize, value: i32) -> StrandResult {
    store_typed(ctx, address, value)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_store_i64(ctx: *mut StrandContext, address: usize, value: i64) -> StrandResult {
    store_typed(ctx, address, value)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_store_f32(ctx: *mut StrandContext, address: usize, value: f32) -> StrandResult {
    store_typed(ctx, address, value)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_store_f64(ctx: *mut StrandContext, address: usize, value: f64) -> StrandResult {
    store_typed(ctx, address, value)
}

/// Write `value` into the 8-byte address cell at `address`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_store_address(
    ctx: *mut StrandContext,
    address: usize,
    value: usize,
) -> StrandResult {
    with_context(ctx, |context| context.store_address(address, value), std::ptr::null_mut())
}

// =============================================================================
// Strings
// =============================================================================

/// Copy the NUL-terminated string referenced by the cell at `address` into
/// `buf` (at most `cap` bytes including the terminator). `*len` receives the
/// full string length; a string that does not fit yields
/// `STRAND_ERROR_INVALID_ARG` with `*len` still set.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_load_cstring(
    ctx: *mut StrandContext,
    address: usize,
    buf: *mut c_char,
    cap: usize,
    len: *mut usize,
) -> StrandResult {
    let mut text = String::new();
    let result = with_context(ctx, |context| context.load_cstring(address), &mut text);
    if result.is_err() {
        return result;
    }
    if !len.is_null() {
        *len = text.len();
    }
    if buf.is_null() || text.len() + 1 > cap {
        return StrandResult::ErrorInvalidArg;
    }
    let out = std::slice::from_raw_parts_mut(buf as *mut u8, text.len() + 1);
    out[..text.len()].copy_from_slice(text.as_bytes());
    out[text.len()] = 0;
    StrandResult::Ok
}

/// Push `value` onto the stack and store its address in the cell at
/// `address`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_store_cstring(
    ctx: *mut StrandContext,
    value: *const c_char,
    address: usize,
) -> StrandResult {
    if value.is_null() {
        return StrandResult::ErrorInvalidArg;
    }
    let Ok(value) = CStr::from_ptr(value).to_str() else {
        return StrandResult::ErrorInvalidArg;
    };
    with_context(ctx, |context| context.store_cstring(value, address), std::ptr::null_mut())
}

// =============================================================================
// Allocation
// =============================================================================

#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_alloc_stack(ctx: *mut StrandContext, size: usize, out: *mut usize) -> StrandResult {
    with_context(ctx, |context| context.alloc_stack(size), out)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_pop_stack(ctx: *mut StrandContext, size: usize) -> StrandResult {
    with_context(ctx, |context| context.pop_stack(size), std::ptr::null_mut())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_stack_address(ctx: *mut StrandContext, out: *mut usize) -> StrandResult {
    if out.is_null() {
        return StrandResult::ErrorInvalidArg;
    }
    with_context(ctx, |context| context.stack_address(), out)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_alloc_memory(ctx: *mut StrandContext, size: usize, out: *mut usize) -> StrandResult {
    with_context(ctx, |context| context.alloc_memory(size), out)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn strand_state_dealloc_memory(ctx: *mut StrandContext, address: usize) -> StrandResult {
    with_context(ctx, |context| context.dealloc_memory(address), std::ptr::null_mut())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::types::CallbackScope;
    use crate::vm::{Engine, Function, Module};
    use std::ffi::CString;
    use std::sync::Arc;

    /// Run `f` against a fresh context through a `strand_with`-style scope.
    fn with_scope(f: impl FnOnce(*mut StrandContext)) {
        let engine = Engine::default();
        let mut module = Module::new();
        module.function(Function::new("main").exported());
        let handle = engine.start_module(Arc::new(module), "main", 64, 64).unwrap();
        engine
            .with(handle, |context| {
                let mut scope = CallbackScope::Plain(context);
                f(scope.as_ptr());
            })
            .unwrap();
    }

    #[test]
    fn test_typed_roundtrip() {
        with_scope(|ctx| unsafe {
            assert_eq!(strand_state_size(ctx), 128);
            assert_eq!(strand_state_store_i32(ctx, 4, -7), StrandResult::Ok);
            let mut value = 0i32;
            assert_eq!(strand_state_load_i32(ctx, 4, &mut value), StrandResult::Ok);
            assert_eq!(value, -7);

            assert_eq!(strand_state_store_f64(ctx, 8, 2.5), StrandResult::Ok);
            let mut value = 0f64;
            assert_eq!(strand_state_load_f64(ctx, 8, &mut value), StrandResult::Ok);
            assert_eq!(value, 2.5);

            assert_eq!(strand_state_load_i32(ctx, 4, std::ptr::null_mut()), StrandResult::ErrorInvalidArg);
        });
    }

    #[test]
    fn test_out_of_bounds() {
        with_scope(|ctx| unsafe {
            assert_eq!(strand_state_store_i64(ctx, 124, 1), StrandResult::ErrorOutOfBounds);
            let mut buf = [0u8; 4];
            assert_eq!(
                strand_state_load(ctx, usize::MAX, buf.as_mut_ptr(), buf.len()),
                StrandResult::ErrorOutOfBounds
            );
        });
    }

    #[test]
    fn test_bytes() {
        with_scope(|ctx| unsafe {
            let data = [1u8, 2, 3, 4];
            assert_eq!(strand_state_store(ctx, 100, data.as_ptr(), 4), StrandResult::Ok);
            let mut out = [0u8; 4];
            assert_eq!(strand_state_load(ctx, 100, out.as_mut_ptr(), 4), StrandResult::Ok);
            assert_eq!(out, data);
        });
    }

    #[test]
    fn test_allocation() {
        with_scope(|ctx| unsafe {
            let mut top = 0usize;
            assert_eq!(strand_state_stack_address(ctx, &mut top), StrandResult::Ok);
            let mut address = usize::MAX;
            assert_eq!(strand_state_alloc_stack(ctx, 16, &mut address), StrandResult::Ok);
            assert_eq!(address, top);
            assert_eq!(strand_state_pop_stack(ctx, 16), StrandResult::Ok);

            let mut block = 0usize;
            assert_eq!(strand_state_alloc_memory(ctx, 8, &mut block), StrandResult::Ok);
            assert_eq!(block, 64);
            assert_eq!(strand_state_dealloc_memory(ctx, block), StrandResult::Ok);
            assert_eq!(strand_state_dealloc_memory(ctx, block), StrandResult::ErrorInvalidAddress);

            assert_eq!(strand_state_alloc_stack(ctx, 1024, &mut address), StrandResult::ErrorOutOfStack);

            let mut info = StrandStateInfo::default();
            assert_eq!(strand_state_info(ctx, &mut info), StrandResult::Ok);
            assert_eq!(info.total_capacity, 128);
            assert_eq!(info.memory_free, 64);
        });
    }

    #[test]
    fn test_cstring() {
        with_scope(|ctx| unsafe {
            let mut cell = 0usize;
            assert_eq!(strand_state_alloc_memory(ctx, 8, &mut cell), StrandResult::Ok);
            let hello = CString::new("hello").unwrap();
            assert_eq!(strand_state_store_cstring(ctx, hello.as_ptr(), cell), StrandResult::Ok);

            let mut buf = [0 as c_char; 16];
            let mut len = 0usize;
            assert_eq!(
                strand_state_load_cstring(ctx, cell, buf.as_mut_ptr(), buf.len(), &mut len),
                StrandResult::Ok
            );
            assert_eq!(len, 5);
            assert_eq!(CStr::from_ptr(buf.as_ptr()).to_str().unwrap(), "hello");

            assert_eq!(
                strand_state_load_cstring(ctx, cell, buf.as_mut_ptr(), 3, &mut len),
                StrandResult::ErrorInvalidArg
            );
        });
    }

    #[test]
    fn test_null_context() {
        unsafe {
            assert_eq!(strand_state_size(std::ptr::null_mut()), 0);
            assert_eq!(
                strand_state_store_i32(std::ptr::null_mut(), 0, 1),
                StrandResult::ErrorInvalidArg
            );
        }
    }
}
