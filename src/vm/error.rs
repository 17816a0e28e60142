//! Error taxonomy for the VM.

use thiserror::Error;

use super::bytecode::BytecodeError;
use super::handle::Handle;
use super::primitive::Address;

/// Result type used throughout the VM.
pub type Result<T> = std::result::Result<T, VmError>;

/// Capacity violations reported by an [`Arena`](super::Arena).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArenaError {
    #[error("access of {size} bytes at address {address} exceeds arena capacity {capacity}")]
    OutOfBounds {
        address: Address,
        size: usize,
        capacity: usize,
    },

    #[error("stack overflow: cannot allocate {requested} bytes, {available} free")]
    OutOfStack { requested: usize, available: usize },

    #[error("stack underflow: cannot pop {requested} bytes, {available} in use")]
    StackUnderflow { requested: usize, available: usize },

    #[error("out of memory: cannot allocate {requested} bytes, {available} free")]
    OutOfMemory { requested: usize, available: usize },

    #[error("cannot allocate an arena with stack={stack}, memory={memory}")]
    Unallocatable { stack: usize, memory: usize },

    #[error("no live heap allocation at address {0}")]
    InvalidAddress(Address),

    #[error("stack position {position} is beyond the stack segment ({stack_size} bytes)")]
    InvalidStackPosition { position: usize, stack_size: usize },

    #[error("string at address {0} is not valid UTF-8")]
    InvalidUtf8(Address),

    #[error("string contains an interior NUL byte")]
    InteriorNul,
}

/// Interpreter-detected invariant violations. Always fatal to the context.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Fault {
    #[error("address stack underflow at pc {pc}")]
    AddressUnderflow { pc: usize },

    #[error("function `{0}` has no result slot")]
    NoResultSlot(String),

    #[error("function `{0}` has no locals")]
    NoLocals(String),

    #[error("program has no data segment")]
    NoDataSegment,

    #[error("program has no globals")]
    NoGlobals,

    #[error("jump to invalid target {target} (function has {len} instructions)")]
    InvalidJump { target: usize, len: usize },

    #[error("unknown function index {0}")]
    UnknownFunction(usize),

    #[error("unknown operation index {0}")]
    UnknownOperation(usize),

    #[error("operation end at pc {pc} without a matching begin")]
    UnbalancedOperation { pc: usize },

    #[error("parameter or target outside of an operation at pc {pc}")]
    NotInOperation { pc: usize },

    #[error("call depth exceeded {0}")]
    CallDepthExceeded(usize),

    #[error("step limit of {0} instructions exceeded")]
    StepLimitExceeded(u64),

    #[error("return with an empty call stack")]
    CallStackUnderflow,

    #[error("arena fault: {0}")]
    Arena(#[from] ArenaError),

    #[error("operation `{op}` failed: {message}")]
    Host { op: String, message: String },
}

/// Errors surfaced to the host.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("failed to load bytecode: {0}")]
    Load(#[from] BytecodeError),

    #[error("entry function `{0}` not found")]
    EntryNotFound(String),

    #[error("entry function `{0}` must take no parameters and produce no result")]
    InvalidEntry(String),

    #[error("arena sizes must be multiples of 4 with a non-empty stack: stack={stack}, memory={memory}")]
    InvalidArenaSize { stack: usize, memory: usize },

    #[error("arena of {requested} bytes exceeds the configured limit of {limit} bytes")]
    ArenaTooLarge { requested: usize, limit: usize },

    #[error("engine already holds the configured maximum of {0} contexts")]
    TooManyContexts(usize),

    #[error("unknown context handle {0}")]
    UnknownHandle(Handle),

    #[error("context {0} is currently executing")]
    ContextBusy(Handle),

    #[error(transparent)]
    Arena(#[from] ArenaError),

    #[error("context has no live stack frame")]
    NoStackFrame,

    #[error("label `{0}` not found in the current function")]
    LabelNotFound(String),

    #[error("runtime fault in context {handle}: {fault}")]
    RuntimeFault { handle: Handle, fault: Fault },
}
