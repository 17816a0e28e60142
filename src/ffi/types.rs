//! FFI type definitions for the C API.

use std::ffi::{CString, c_char, c_void};

use parking_lot::Mutex;

use crate::vm::{ArenaError, ArenaInfo, Context, Engine, OpContext, VmError};

/// Result codes for FFI operations.
///
/// These map to the `StrandResult` enum in C.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrandResult {
    /// Operation succeeded
    Ok = 0,
    /// Malformed or unverifiable bytecode
    ErrorLoad = 1,
    /// Entry function or label not found
    ErrorNotFound = 2,
    /// Stale or unknown context handle
    ErrorUnknownHandle = 3,
    /// Context is currently executing
    ErrorBusy = 4,
    /// Arena access outside of its capacity
    ErrorOutOfBounds = 5,
    /// Stack segment exhausted
    ErrorOutOfStack = 6,
    /// Heap segment exhausted
    ErrorOutOfMemory = 7,
    /// Address is not a live heap allocation
    ErrorInvalidAddress = 8,
    /// Context terminated by a runtime fault
    ErrorRuntime = 9,
    /// Invalid argument passed to function
    ErrorInvalidArg = 10,
    /// Context has been released
    ErrorNoStackFrame = 11,
    /// A configured engine limit was hit
    ErrorLimit = 12,
}

impl StrandResult {
    pub fn is_ok(self) -> bool {
        self == StrandResult::Ok
    }

    pub fn is_err(self) -> bool {
        self != StrandResult::Ok
    }
}

impl From<&ArenaError> for StrandResult {
    fn from(err: &ArenaError) -> Self {
        match err {
            ArenaError::OutOfBounds { .. } | ArenaError::InvalidUtf8(_) => StrandResult::ErrorOutOfBounds,
            ArenaError::OutOfStack { .. } | ArenaError::StackUnderflow { .. } => StrandResult::ErrorOutOfStack,
            ArenaError::OutOfMemory { .. } | ArenaError::Unallocatable { .. } => StrandResult::ErrorOutOfMemory,
            ArenaError::InvalidAddress(_) => StrandResult::ErrorInvalidAddress,
            ArenaError::InvalidStackPosition { .. } | ArenaError::InteriorNul => StrandResult::ErrorInvalidArg,
        }
    }
}

impl From<&VmError> for StrandResult {
    fn from(err: &VmError) -> Self {
        match err {
            VmError::Load(_) => StrandResult::ErrorLoad,
            VmError::EntryNotFound(_) | VmError::LabelNotFound(_) => StrandResult::ErrorNotFound,
            VmError::InvalidEntry(_) | VmError::InvalidArenaSize { .. } => StrandResult::ErrorInvalidArg,
            VmError::ArenaTooLarge { .. } | VmError::TooManyContexts(_) => StrandResult::ErrorLimit,
            VmError::UnknownHandle(_) => StrandResult::ErrorUnknownHandle,
            VmError::ContextBusy(_) => StrandResult::ErrorBusy,
            VmError::Arena(err) => err.into(),
            VmError::NoStackFrame => StrandResult::ErrorNoStackFrame,
            VmError::RuntimeFault { .. } => StrandResult::ErrorRuntime,
        }
    }
}

impl<T> From<&Result<T, VmError>> for StrandResult {
    fn from(result: &Result<T, VmError>) -> Self {
        match result {
            Ok(_) => StrandResult::Ok,
            Err(err) => err.into(),
        }
    }
}

/// Error callback function type.
///
/// Called when an error occurs, with the error message and user data.
pub type StrandErrorFn = Option<unsafe extern "C" fn(message: *const c_char, userdata: *mut c_void)>;

/// Operation callback.
///
/// Invoked once per dispatched operation with the suspended context, the
/// operation name and its parameter and target addresses. Use the
/// `strand_state_*` functions on `ctx` to read parameters and write
/// targets. Any result other than `STRAND_OK` terminates the context.
pub type StrandOpFn = Option<
    unsafe extern "C" fn(
        ctx: *mut StrandContext,
        name: *const c_char,
        params: *const usize,
        params_len: usize,
        targets: *const usize,
        targets_len: usize,
        userdata: *mut c_void,
    ) -> StrandResult,
>;

/// Callback for `strand_with`.
pub type StrandWithFn = Option<unsafe extern "C" fn(ctx: *mut StrandContext, userdata: *mut c_void)>;

/// Opaque engine instance type.
///
/// All operations require a valid `StrandEngine` pointer created by
/// `strand_engine_new()`.
#[repr(C)]
pub struct StrandEngine {
    _private: [u8; 0],
}

/// Opaque context scope.
///
/// Only valid for the duration of the callback it was passed to. It never
/// points into the arena.
#[repr(C)]
pub struct StrandContext {
    _private: [u8; 0],
}

/// Arena capacity snapshot.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StrandStateInfo {
    pub stack_capacity: usize,
    pub memory_capacity: usize,
    pub total_capacity: usize,
    pub stack_free: usize,
    pub memory_free: usize,
    pub total_free: usize,
}

impl From<ArenaInfo> for StrandStateInfo {
    fn from(info: ArenaInfo) -> Self {
        Self {
            stack_capacity: info.stack_capacity,
            memory_capacity: info.memory_capacity,
            total_capacity: info.total_capacity,
            stack_free: info.stack_free,
            memory_free: info.memory_free,
            total_free: info.total_free,
        }
    }
}

/// Internal engine wrapper that holds the Rust engine and FFI state.
///
/// Accessed through shared references only, so callbacks may re-enter the
/// API with the same engine pointer.
pub(crate) struct EngineWrapper {
    pub engine: Engine,
    /// Last error message (as CString for FFI compatibility)
    pub last_error: Mutex<Option<CString>>,
    pub error_callback: StrandErrorFn,
    pub error_userdata: *mut c_void,
}

impl EngineWrapper {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            last_error: Mutex::new(None),
            error_callback: None,
            error_userdata: std::ptr::null_mut(),
        }
    }

    /// Set an error message and optionally call the error callback.
    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        let c_msg = CString::new(message.replace('\0', "\\0")).unwrap_or_default();

        if let Some(callback) = self.error_callback {
            unsafe {
                callback(c_msg.as_ptr(), self.error_userdata);
            }
        }

        *self.last_error.lock() = Some(c_msg);
    }

    pub fn clear_error(&self) {
        *self.last_error.lock() = None;
    }

    /// Record `err` and translate it into a result code.
    pub fn report(&self, err: &VmError) -> StrandResult {
        self.set_error(err.to_string());
        err.into()
    }
}

/// What a `*mut StrandContext` handed to C actually points at.
pub(crate) enum CallbackScope<'a, 'b> {
    /// Inside an operation callback; control functions are available.
    Op(&'a mut OpContext<'b>),
    /// Inside `strand_with`.
    Plain(&'a mut Context),
}

impl<'b> CallbackScope<'_, 'b> {
    pub fn context(&mut self) -> &mut Context {
        match self {
            CallbackScope::Op(op) => &mut ***op,
            CallbackScope::Plain(context) => &mut **context,
        }
    }

    pub fn op(&mut self) -> Option<&mut OpContext<'b>> {
        match self {
            CallbackScope::Op(op) => Some(&mut **op),
            CallbackScope::Plain(_) => None,
        }
    }

    pub fn as_ptr(&mut self) -> *mut StrandContext {
        self as *mut Self as *mut StrandContext
    }
}

/// Resolve a context pointer handed to a callback.
///
/// Returns None if the pointer is null.
pub(crate) unsafe fn get_scope<'a>(ctx: *mut StrandContext) -> Option<&'a mut CallbackScope<'a, 'a>> {
    if ctx.is_null() {
        None
    } else {
        unsafe { Some(&mut *(ctx as *mut CallbackScope<'a, 'a>)) }
    }
}
