//! Strand - an embeddable, resumable bytecode VM
//!
//! Every host-defined operation suspends the running context and is handed
//! to the embedder, who reads and writes the context's linear arena by
//! address. Contexts can be resumed, consumed, forked, cancelled and
//! redirected from inside operation callbacks.
//! For C/C++ embedding, use the FFI module functions.

pub mod config;
pub mod ffi;
pub mod vm;

// Re-export commonly used types
pub use config::EngineConfig;
pub use vm::{Context, Engine, Handle, Module, OpContext, OpHandler, Operation, VmError, handler_fn};

// Re-export FFI types for C bindings
pub use ffi::*;
