pub mod arena;
pub mod bytecode;
mod context;
mod dispatch;
pub mod dump;
mod engine;
mod error;
pub mod handle;
pub mod ops;
pub mod primitive;
pub mod verifier;

pub use arena::{ARENA_ALIGNMENT, Arena, ArenaInfo};
pub use bytecode::{BytecodeError, DataItem, Function, Module};
pub use context::{Context, Status};
pub use dispatch::{FnHandler, HostError, OpContext, OpHandler, Operation, handler_fn};
pub use engine::Engine;
pub use error::{ArenaError, Fault, Result, VmError};
pub use handle::Handle;
pub use ops::Instruction;
pub use primitive::{ADDRESS_SIZE, Address, Primitive};
pub use verifier::VerifyError;
