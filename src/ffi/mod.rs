//! C FFI for embedding strand
//!
//! This module provides a C-compatible API for embedding the strand engine
//! in host applications. All public functions use `extern "C"` ABI.
//!
//! # Safety
//!
//! All FFI functions that take raw pointers require:
//! - Non-null pointers (unless documented otherwise)
//! - Valid engines created by `strand_engine_new()`
//! - Context pointers used only inside the callback they were passed to

pub(crate) mod control;
pub(crate) mod engine_ffi;
pub(crate) mod error;
pub(crate) mod run;
pub(crate) mod state;
pub(crate) mod types;

// Re-export all FFI types and functions for public use
pub use control::*;
pub use engine_ffi::*;
pub use error::*;
pub use run::*;
pub use state::*;
pub use types::{StrandContext, StrandEngine, StrandErrorFn, StrandOpFn, StrandResult, StrandStateInfo, StrandWithFn};

/// Version information
pub const STRAND_VERSION_MAJOR: u32 = 0;
pub const STRAND_VERSION_MINOR: u32 = 1;
pub const STRAND_VERSION_PATCH: u32 = 0;

/// Get the version string
#[unsafe(no_mangle)]
pub extern "C" fn strand_version() -> *const std::ffi::c_char {
    static VERSION: &[u8] = b"0.1.0\0";
    VERSION.as_ptr() as *const std::ffi::c_char
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(STRAND_VERSION_MAJOR, 0);
        assert_eq!(STRAND_VERSION_MINOR, 1);
        assert_eq!(STRAND_VERSION_PATCH, 0);

        let version = unsafe { std::ffi::CStr::from_ptr(strand_version()).to_str().unwrap() };
        assert_eq!(version, env!("CARGO_PKG_VERSION"));
    }
}
