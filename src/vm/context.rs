//! Execution context and the interpreter loop.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, trace};

use super::arena::{Arena, ArenaInfo};
use super::bytecode::{DataItem, Module};
use super::dispatch::{Control, OpContext, OpHandler, Operation};
use super::error::{ArenaError, Fault, Result, VmError};
use super::handle::Handle;
use super::ops::Instruction;
use super::primitive::{ADDRESS_SIZE, Address, Primitive};

/// Lifecycle state of a [`Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Created,
    Running,
    Suspended,
    Finished,
    Cancelled,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Finished | Status::Cancelled)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Created => "created",
            Status::Running => "running",
            Status::Suspended => "suspended",
            Status::Finished => "finished",
            Status::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// An operation between `OpBegin` and `OpEnd`.
#[derive(Debug, Default)]
struct PendingOp {
    /// Stack position at `OpBegin`.
    scratch: Address,
    params: Vec<Address>,
    targets: Vec<Address>,
}

#[derive(Debug)]
struct Frame {
    function: usize,
    pc: usize,
    params_base: Address,
    result: Option<Address>,
    locals_base: Address,
    /// Length of the address stack when the frame was entered.
    address_base: usize,
    pending: Vec<PendingOp>,
}

/// Outcome of [`Context::run_until_dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Dispatched { paused: bool },
    Finished,
}

/// Instruction budget for one resume/consume call.
#[derive(Debug)]
pub(crate) struct StepBudget {
    limit: Option<u64>,
    used: u64,
}

impl StepBudget {
    pub(crate) fn new(limit: Option<u64>) -> Self {
        Self { limit, used: 0 }
    }

    fn charge(&mut self) -> std::result::Result<(), Fault> {
        self.used += 1;
        if let Some(limit) = self.limit {
            if self.used > limit {
                return Err(Fault::StepLimitExceeded(limit));
            }
        }
        Ok(())
    }
}

/// A single strand of execution with its own arena.
pub struct Context {
    handle: Handle,
    module: Arc<Module>,
    arena: Option<Arena>,
    frames: Vec<Frame>,
    addresses: Vec<Address>,
    data_base: Option<Address>,
    globals_base: Option<Address>,
    status: Status,
    max_call_depth: usize,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("handle", &self.handle)
            .field("status", &self.status)
            .field("frames", &self.frames.len())
            .field("addresses", &self.addresses)
            .field("arena", &self.arena)
            .finish()
    }
}

impl Context {
    /// Build a context positioned at the start of `entry`. The data segment
    /// and the globals block are placed in the heap segment.
    pub(crate) fn new(
        handle: Handle,
        module: Arc<Module>,
        entry: usize,
        stack_size: usize,
        memory_size: usize,
        max_call_depth: usize,
    ) -> Result<Self> {
        let mut arena = Arena::new(stack_size, memory_size)?;

        let data_size = module.data_size();
        let data_base = if data_size > 0 {
            let base = arena.alloc_memory(data_size)?;
            write_data(&mut arena, base, &module.data)?;
            Some(base)
        } else {
            None
        };

        let globals_base = if module.globals_size > 0 {
            Some(arena.alloc_memory(module.globals_size as usize)?)
        } else {
            None
        };

        let mut context = Self {
            handle,
            module,
            arena: Some(arena),
            frames: Vec::new(),
            addresses: Vec::new(),
            data_base,
            globals_base,
            status: Status::Created,
            max_call_depth,
        };
        context.enter(entry, Vec::new()).map_err(|fault| match fault {
            Fault::Arena(err) => VmError::Arena(err),
            fault => VmError::RuntimeFault { handle, fault },
        })?;
        context.status = Status::Running;
        Ok(context)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    pub fn is_finished(&self) -> bool {
        self.status == Status::Finished
    }

    /// Number of active call frames.
    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    /// Name of the function executing in the top frame.
    pub fn current_function(&self) -> Option<&str> {
        let frame = self.frames.last()?;
        self.module
            .functions
            .get(frame.function)
            .map(|f| f.name.as_str())
    }

    /// Index of the next instruction in the top frame.
    pub fn pc(&self) -> Option<usize> {
        self.frames.last().map(|f| f.pc)
    }

    /// Arena address of byte `offset` of the data segment.
    pub fn data_address(&self, offset: usize) -> Option<Address> {
        self.data_base.map(|base| base + offset)
    }

    /// Arena address of byte `offset` of the globals block.
    pub fn globals_address(&self, offset: usize) -> Option<Address> {
        self.globals_base.map(|base| base + offset)
    }

    // ------------------------------------------------------------------
    // Arena surface
    // ------------------------------------------------------------------

    pub fn arena(&self) -> Result<&Arena> {
        self.arena.as_ref().ok_or(VmError::NoStackFrame)
    }

    pub fn arena_mut(&mut self) -> Result<&mut Arena> {
        self.arena.as_mut().ok_or(VmError::NoStackFrame)
    }

    /// Total arena capacity in bytes.
    pub fn state_size(&self) -> Result<usize> {
        Ok(self.arena()?.capacity())
    }

    pub fn info(&self) -> Result<ArenaInfo> {
        Ok(self.arena()?.info())
    }

    pub fn load<T: Primitive>(&self, address: Address) -> Result<T> {
        Ok(self.arena()?.load(address)?)
    }

    pub fn store<T: Primitive>(&mut self, address: Address, value: T) -> Result<()> {
        Ok(self.arena_mut()?.store(address, value)?)
    }

    pub fn load_bytes(&self, address: Address, size: usize) -> Result<&[u8]> {
        Ok(self.arena()?.load_bytes(address, size)?)
    }

    pub fn store_bytes(&mut self, address: Address, value: &[u8]) -> Result<()> {
        Ok(self.arena_mut()?.store_bytes(address, value)?)
    }

    pub fn copy(&mut self, source: Address, size: usize, destination: Address) -> Result<()> {
        Ok(self.arena_mut()?.copy_within(source, size, destination)?)
    }

    pub fn load_address(&self, address: Address) -> Result<Address> {
        Ok(self.arena()?.load_address(address)?)
    }

    pub fn store_address(&mut self, address: Address, value: Address) -> Result<()> {
        Ok(self.arena_mut()?.store_address(address, value)?)
    }

    pub fn load_cstring(&self, address: Address) -> Result<String> {
        Ok(self.arena()?.load_cstring(address)?)
    }

    pub fn store_cstring(&mut self, value: &str, address: Address) -> Result<()> {
        Ok(self.arena_mut()?.store_cstring(value, address)?)
    }

    pub fn alloc_stack(&mut self, size: usize) -> Result<Address> {
        Ok(self.arena_mut()?.alloc_stack(size)?)
    }

    pub fn pop_stack(&mut self, size: usize) -> Result<()> {
        Ok(self.arena_mut()?.pop_stack(size)?)
    }

    pub fn stack_address(&self) -> Result<Address> {
        Ok(self.arena()?.stack_address())
    }

    pub fn alloc_memory(&mut self, size: usize) -> Result<Address> {
        Ok(self.arena_mut()?.alloc_memory(size)?)
    }

    pub fn dealloc_memory(&mut self, address: Address) -> Result<()> {
        Ok(self.arena_mut()?.dealloc_memory(address)?)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Drop the arena and control state. Later arena access fails with
    /// `NoStackFrame`.
    pub(crate) fn release(&mut self, status: Status) {
        self.arena = None;
        self.frames.clear();
        self.addresses.clear();
        self.data_base = None;
        self.globals_base = None;
        self.status = status;
        debug!(handle = %self.handle, %status, "context released");
    }

    pub(crate) fn mark_suspended(&mut self) {
        if !self.status.is_terminal() {
            self.status = Status::Suspended;
        }
    }

    // ------------------------------------------------------------------
    // Interpreter
    // ------------------------------------------------------------------

    /// Interpret until one operation has been dispatched and its control
    /// action applied, or until the context finishes. Trailing returns are
    /// unwound before returning.
    pub(crate) fn run_until_dispatch(
        &mut self,
        handler: &mut dyn OpHandler,
        budget: &mut StepBudget,
    ) -> std::result::Result<Step, Fault> {
        self.status = Status::Running;
        self.settle()?;
        while !self.frames.is_empty() {
            budget.charge()?;
            let dispatched = self.step(handler)?;
            self.settle()?;
            if let Some(paused) = dispatched {
                return Ok(Step::Dispatched { paused });
            }
        }
        Ok(Step::Finished)
    }

    /// Unwind every frame whose pc has run off the end of its code.
    fn settle(&mut self) -> std::result::Result<(), Fault> {
        while let Some(frame) = self.frames.last() {
            let len = self
                .module
                .functions
                .get(frame.function)
                .map_or(0, |f| f.code.len());
            if frame.pc < len {
                return Ok(());
            }
            self.return_from_frame()?;
        }
        if self.status != Status::Finished {
            self.status = Status::Finished;
            info!(handle = %self.handle, "context finished");
        }
        Ok(())
    }

    /// Execute one instruction. Returns `Some(paused)` when an operation was
    /// dispatched.
    fn step(&mut self, handler: &mut dyn OpHandler) -> std::result::Result<Option<bool>, Fault> {
        let module = Arc::clone(&self.module);
        let frame_index = self
            .frames
            .len()
            .checked_sub(1)
            .ok_or(Fault::CallStackUnderflow)?;
        let (function, pc) = {
            let frame = &self.frames[frame_index];
            (frame.function, frame.pc)
        };
        let func = module
            .functions
            .get(function)
            .ok_or(Fault::UnknownFunction(function))?;
        let Some(instruction) = func.code.get(pc) else {
            self.return_from_frame()?;
            return Ok(None);
        };
        self.frames[frame_index].pc = pc + 1;

        match instruction {
            Instruction::DataAddress(offset) => {
                let base = self.data_base.ok_or(Fault::NoDataSegment)?;
                self.addresses.push(base + *offset as usize);
            }
            Instruction::ParamsAddress(offset) => {
                let base = self.frames[frame_index].params_base;
                self.addresses.push(base + *offset as usize);
            }
            Instruction::ResultAddress => {
                let slot = self.frames[frame_index]
                    .result
                    .ok_or_else(|| Fault::NoResultSlot(func.name.clone()))?;
                self.addresses.push(slot);
            }
            Instruction::LocalsAddress(offset) => {
                if func.locals.is_empty() {
                    return Err(Fault::NoLocals(func.name.clone()));
                }
                let base = self.frames[frame_index].locals_base;
                self.addresses.push(base + *offset as usize);
            }
            Instruction::GlobalsAddress(offset) => {
                let base = self.globals_base.ok_or(Fault::NoGlobals)?;
                self.addresses.push(base + *offset as usize);
            }
            Instruction::Offset(offset) => {
                let address = self.pop_address(pc)?;
                let displaced = address.checked_add(*offset as usize).ok_or_else(|| {
                    Fault::Arena(ArenaError::OutOfBounds {
                        address,
                        size: *offset as usize,
                        capacity: self.capacity(),
                    })
                })?;
                self.addresses.push(displaced);
            }
            Instruction::Reference => {
                let address = self.pop_address(pc)?;
                let cell = self.live_arena()?.push_address(address)?;
                self.addresses.push(cell);
            }
            Instruction::Dereference => {
                let cell = self.pop_address(pc)?;
                let address = self.live_arena()?.load_address(cell)?;
                self.addresses.push(address);
            }
            Instruction::Tuple(sizes) => {
                let sources = self.pop_addresses(sizes.len(), pc)?;
                let base = self.copy_to_stack(&sources, sizes)?;
                self.addresses.push(base);
            }
            Instruction::Copy(size) => {
                let destination = self.pop_address(pc)?;
                let source = self.pop_address(pc)?;
                self.live_arena()?
                    .copy_within(source, *size as usize, destination)?;
            }
            Instruction::OpBegin => {
                let scratch = self.live_arena()?.stack_address();
                self.frames[frame_index].pending.push(PendingOp {
                    scratch,
                    ..PendingOp::default()
                });
            }
            Instruction::Param => {
                let address = self.pop_address(pc)?;
                self.frames[frame_index]
                    .pending
                    .last_mut()
                    .ok_or(Fault::NotInOperation { pc })?
                    .params
                    .push(address);
            }
            Instruction::Target => {
                let address = self.pop_address(pc)?;
                self.frames[frame_index]
                    .pending
                    .last_mut()
                    .ok_or(Fault::NotInOperation { pc })?
                    .targets
                    .push(address);
            }
            Instruction::OpEnd { op, result } => {
                return self
                    .dispatch(handler, &module, frame_index, pc, *op as usize, *result as usize)
                    .map(Some);
            }
            Instruction::Call(index) => {
                let index = *index as usize;
                let callee = module
                    .functions
                    .get(index)
                    .ok_or(Fault::UnknownFunction(index))?;
                if self.frames.len() >= self.max_call_depth {
                    return Err(Fault::CallDepthExceeded(self.max_call_depth));
                }
                let args = self.pop_addresses(callee.params.len(), pc)?;
                self.enter(index, args)?;
            }
            Instruction::Jump(target) => {
                self.jump(frame_index, *target as usize, func.code.len())?;
            }
            Instruction::BranchIf(target) => {
                let condition = self.pop_address(pc)?;
                if self.live_arena()?.load::<u8>(condition)? != 0 {
                    self.jump(frame_index, *target as usize, func.code.len())?;
                }
            }
            Instruction::Return => {
                self.return_from_frame()?;
            }
        }

        Ok(None)
    }

    fn dispatch(
        &mut self,
        handler: &mut dyn OpHandler,
        module: &Module,
        frame_index: usize,
        pc: usize,
        op: usize,
        result: usize,
    ) -> std::result::Result<bool, Fault> {
        let pending = self.frames[frame_index]
            .pending
            .pop()
            .ok_or(Fault::UnbalancedOperation { pc })?;
        let name = module
            .ops
            .get(op)
            .ok_or(Fault::UnknownOperation(op))?
            .as_str();

        let mut targets = pending.targets;
        let slot = if result > 0 {
            let slot = self.live_arena()?.alloc_stack(result)?;
            targets.push(slot);
            Some(slot)
        } else {
            None
        };

        let operation = Operation {
            name,
            params: &pending.params,
            targets: &targets,
        };
        trace!(
            handle = %self.handle,
            op = name,
            params = ?operation.params,
            targets = ?operation.targets,
            "dispatch"
        );

        let function = self.frames[frame_index].function;
        self.status = Status::Suspended;
        let mut op_ctx = OpContext::new(self, function);
        let outcome = handler.handle(&mut op_ctx, &operation);
        let (control, paused) = op_ctx.finish();
        self.status = Status::Running;

        outcome.map_err(|err| Fault::Host {
            op: name.to_string(),
            message: err.0,
        })?;

        match slot {
            Some(slot) => self.addresses.push(slot),
            None => self.live_arena()?.reset_stack(pending.scratch)?,
        }
        self.apply_control(frame_index, control, pending.scratch)?;
        Ok(paused)
    }

    /// `scratch` is the stack position recorded by the dispatched operation's
    /// `OpBegin`.
    fn apply_control(
        &mut self,
        frame_index: usize,
        control: Control,
        scratch: Address,
    ) -> std::result::Result<(), Fault> {
        match control {
            Control::Continue => Ok(()),
            Control::GoTo(pc) => {
                // A jump abandons every operation still being assembled,
                // including the expression slot of the one just dispatched.
                let frame = &mut self.frames[frame_index];
                frame.pc = pc;
                let scratch = frame.pending.first().map_or(scratch, |outer| outer.scratch);
                frame.pending.clear();
                let address_base = frame.address_base;
                self.addresses.truncate(address_base);
                self.live_arena()?.reset_stack(scratch)?;
                Ok(())
            }
            Control::Return => self.return_from_frame(),
        }
    }

    fn jump(&mut self, frame_index: usize, target: usize, len: usize) -> std::result::Result<(), Fault> {
        if target > len {
            return Err(Fault::InvalidJump { target, len });
        }
        self.frames[frame_index].pc = target;
        Ok(())
    }

    /// Push a frame for `function`, copying `args` into its parameter block.
    fn enter(&mut self, function: usize, args: Vec<Address>) -> std::result::Result<(), Fault> {
        let module = Arc::clone(&self.module);
        let func = module
            .functions
            .get(function)
            .ok_or(Fault::UnknownFunction(function))?;

        let params_base = self.copy_to_stack(&args, &func.params)?;
        let arena = self.live_arena()?;
        let result = match func.result {
            Some(size) => Some(arena.alloc_stack(size as usize)?),
            None => None,
        };
        let locals_base = arena.alloc_stack(func.locals_size())?;

        trace!(handle = %self.handle, function = %func.name, depth = self.frames.len() + 1, "enter");
        self.frames.push(Frame {
            function,
            pc: 0,
            params_base,
            result,
            locals_base,
            address_base: self.addresses.len(),
            pending: Vec::new(),
        });
        Ok(())
    }

    /// Pop the top frame. The result, if any, is moved down to the frame's
    /// parameter base and its address pushed for the caller.
    fn return_from_frame(&mut self) -> std::result::Result<(), Fault> {
        let frame = self.frames.pop().ok_or(Fault::CallStackUnderflow)?;
        self.addresses.truncate(frame.address_base);
        let size = self
            .module
            .functions
            .get(frame.function)
            .map_or(0, |f| f.result_size());

        let arena = self.live_arena()?;
        match frame.result {
            Some(slot) => {
                arena.copy_within(slot, size, frame.params_base)?;
                arena.reset_stack(frame.params_base + size)?;
                if !self.frames.is_empty() {
                    self.addresses.push(frame.params_base);
                }
            }
            None => arena.reset_stack(frame.params_base)?,
        }
        Ok(())
    }

    /// Copy each `(source, size)` pair into one fresh stack block and return
    /// the block's address.
    fn copy_to_stack(&mut self, sources: &[Address], sizes: &[u32]) -> std::result::Result<Address, Fault> {
        let arena = self.live_arena()?;
        let base = arena.stack_address();
        for (&source, &size) in sources.iter().zip(sizes) {
            let size = size as usize;
            let destination = arena.alloc_stack(size)?;
            arena.copy_within(source, size, destination)?;
        }
        Ok(base)
    }

    fn pop_address(&mut self, pc: usize) -> std::result::Result<Address, Fault> {
        let base = self.frames.last().map_or(0, |f| f.address_base);
        if self.addresses.len() <= base {
            return Err(Fault::AddressUnderflow { pc });
        }
        self.addresses.pop().ok_or(Fault::AddressUnderflow { pc })
    }

    /// Pop the topmost `count` addresses, in push order.
    fn pop_addresses(&mut self, count: usize, pc: usize) -> std::result::Result<Vec<Address>, Fault> {
        let base = self.frames.last().map_or(0, |f| f.address_base);
        if self.addresses.len() < base + count {
            return Err(Fault::AddressUnderflow { pc });
        }
        Ok(self.addresses.split_off(self.addresses.len() - count))
    }

    fn live_arena(&mut self) -> std::result::Result<&mut Arena, Fault> {
        self.arena.as_mut().ok_or(Fault::CallStackUnderflow)
    }

    fn capacity(&self) -> usize {
        self.arena.as_ref().map_or(0, Arena::capacity)
    }
}

/// Lay out the data segment items back to back starting at `base`.
fn write_data(arena: &mut Arena, base: Address, items: &[DataItem]) -> std::result::Result<(), ArenaError> {
    let mut at = base;
    for item in items {
        match item {
            DataItem::I8(v) => arena.store(at, *v)?,
            DataItem::U8(v) => arena.store(at, *v)?,
            DataItem::I16(v) => arena.store(at, *v)?,
            DataItem::U16(v) => arena.store(at, *v)?,
            DataItem::I32(v) => arena.store(at, *v)?,
            DataItem::U32(v) => arena.store(at, *v)?,
            DataItem::I64(v) => arena.store(at, *v)?,
            DataItem::U64(v) => arena.store(at, *v)?,
            DataItem::F32(v) => arena.store(at, *v)?,
            DataItem::F64(v) => arena.store(at, *v)?,
            DataItem::Bool(v) => arena.store(at, *v)?,
            DataItem::Bytes(bytes) => arena.store_bytes(at, bytes)?,
            DataItem::Str(text) => {
                let start = at + ADDRESS_SIZE;
                arena.store_address(at, start)?;
                arena.store_bytes(start, text.as_bytes())?;
                arena.store::<u8>(start + text.len(), 0)?;
            }
        }
        at += item.size();
    }
    Ok(())
}
