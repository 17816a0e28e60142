//! Engine: context lifecycle and the handle registry.
//!
//! The handle table is locked only for insert, lookup and removal. Each
//! context sits behind its own mutex that is only ever acquired with
//! `try_lock`, so re-entrant or concurrent use of one handle reports
//! `ContextBusy` instead of blocking. Handlers may freely start, fork,
//! resume or cancel other handles of the same engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::arena::ARENA_ALIGNMENT;
use super::bytecode::Module;
use super::context::{Context, Status, Step, StepBudget};
use super::dispatch::OpHandler;
use super::error::{Fault, Result, VmError};
use super::handle::{Handle, HandleTable};
use crate::config::EngineConfig;

struct Slot {
    module: Arc<Module>,
    cancelled: AtomicBool,
    context: Mutex<Context>,
}

/// Owns every live context, keyed by [`Handle`].
pub struct Engine {
    config: EngineConfig,
    table: Mutex<HandleTable<Arc<Slot>>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            table: Mutex::new(HandleTable::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Parse and verify a bytecode buffer.
    pub fn load(&self, bytecode: &[u8]) -> Result<Arc<Module>> {
        Ok(Arc::new(Module::from_bytes(bytecode)?))
    }

    /// Load `bytecode` and start a context at the exported function `entry`.
    pub fn start(&self, bytecode: &[u8], entry: &str, memory_size: usize, stack_size: usize) -> Result<Handle> {
        let module = self.load(bytecode)?;
        self.start_module(module, entry, memory_size, stack_size)
    }

    /// Start a context from an already loaded module.
    ///
    /// Instructions are not stepped here; the first `resume` or `consume`
    /// runs the context up to its first operation.
    pub fn start_module(
        &self,
        module: Arc<Module>,
        entry: &str,
        memory_size: usize,
        stack_size: usize,
    ) -> Result<Handle> {
        self.check_arena_size(stack_size, memory_size)?;
        let function = entry_function(&module, entry)?;

        let mut table = self.table.lock();
        if let Some(max) = self.config.max_contexts {
            if table.len() >= max {
                return Err(VmError::TooManyContexts(max));
            }
        }
        let handle = table.insert_with(|handle| {
            let context = Context::new(
                handle,
                Arc::clone(&module),
                function,
                stack_size,
                memory_size,
                self.config.max_call_depth,
            )?;
            Ok::<_, VmError>(Arc::new(Slot {
                module: Arc::clone(&module),
                cancelled: AtomicBool::new(false),
                context: Mutex::new(context),
            }))
        })?;
        drop(table);

        info!(%handle, entry, stack_size, memory_size, "context started");
        Ok(handle)
    }

    /// Start a new context running `entry` of `parent`'s module with a fresh
    /// arena. The parent is left untouched; this works from inside the
    /// parent's own operation callback.
    pub fn fork(&self, parent: Handle, entry: &str, memory_size: usize, stack_size: usize) -> Result<Handle> {
        let module = Arc::clone(&self.lookup(parent)?.module);
        let child = self.start_module(module, entry, memory_size, stack_size)?;
        info!(%parent, %child, entry, "context forked");
        Ok(child)
    }

    /// Run until one operation has been dispatched to `handler`.
    ///
    /// Returns `false` once the context has finished; the handle is then
    /// deregistered and further calls fail with `UnknownHandle`.
    pub fn resume<H: OpHandler>(&self, handle: Handle, mut handler: H) -> Result<bool> {
        let slot = self.lookup(handle)?;
        let mut context = slot.context.try_lock().ok_or(VmError::ContextBusy(handle))?;

        if context.is_finished() {
            drop(context);
            self.deregister(handle);
            return Ok(false);
        }

        let mut budget = StepBudget::new(self.config.step_limit);
        let outcome = context.run_until_dispatch(&mut handler, &mut budget);

        if slot.cancelled.load(Ordering::Acquire) {
            context.release(Status::Cancelled);
            return Ok(false);
        }

        match outcome {
            Err(fault) => {
                drop(context);
                Err(self.fail(handle, &slot, fault))
            }
            Ok(Step::Finished) => {
                drop(context);
                self.deregister(handle);
                Ok(false)
            }
            Ok(Step::Dispatched { .. }) => {
                context.mark_suspended();
                Ok(true)
            }
        }
    }

    /// Run operation after operation until the context finishes (returns
    /// `false`, handle deregistered) or a handler calls
    /// [`pause`](super::OpContext::pause) (returns `true`).
    pub fn consume<H: OpHandler>(&self, handle: Handle, mut handler: H) -> Result<bool> {
        let slot = self.lookup(handle)?;
        let mut context = slot.context.try_lock().ok_or(VmError::ContextBusy(handle))?;
        let mut budget = StepBudget::new(self.config.step_limit);

        loop {
            if context.is_finished() {
                drop(context);
                self.deregister(handle);
                return Ok(false);
            }

            let outcome = context.run_until_dispatch(&mut handler, &mut budget);

            if slot.cancelled.load(Ordering::Acquire) {
                context.release(Status::Cancelled);
                return Ok(false);
            }

            match outcome {
                Err(fault) => {
                    drop(context);
                    return Err(self.fail(handle, &slot, fault));
                }
                Ok(Step::Finished) => continue,
                Ok(Step::Dispatched { paused: true }) if !context.is_finished() => {
                    debug!(%handle, "consume paused");
                    context.mark_suspended();
                    return Ok(true);
                }
                Ok(Step::Dispatched { .. }) => continue,
            }
        }
    }

    /// Run `entry` to completion on a context that is never registered.
    ///
    /// The handler sees every operation; `pause` has no effect. A fault
    /// releases the context and is returned as `RuntimeFault` with
    /// [`Handle::DETACHED`].
    pub fn run<H: OpHandler>(
        &self,
        bytecode: &[u8],
        entry: &str,
        memory_size: usize,
        stack_size: usize,
        mut handler: H,
    ) -> Result<()> {
        let module = self.load(bytecode)?;
        self.check_arena_size(stack_size, memory_size)?;
        let function = entry_function(&module, entry)?;
        let handle = Handle::DETACHED;
        let mut context = Context::new(
            handle,
            module,
            function,
            stack_size,
            memory_size,
            self.config.max_call_depth,
        )?;
        info!(entry, stack_size, memory_size, "running detached context");

        let mut budget = StepBudget::new(self.config.step_limit);
        loop {
            match context.run_until_dispatch(&mut handler, &mut budget) {
                Ok(Step::Finished) => return Ok(()),
                Ok(Step::Dispatched { .. }) => {}
                Err(fault) => {
                    warn!(%fault, "runtime fault in detached context");
                    context.release(Status::Finished);
                    return Err(VmError::RuntimeFault { handle, fault });
                }
            }
        }
    }

    /// Cancel a context. Unknown or already cancelled handles are ignored.
    ///
    /// A context that is currently executing (cancel issued from one of its
    /// own callbacks) is released as soon as that callback returns.
    pub fn cancel(&self, handle: Handle) {
        let Some(slot) = self.table.lock().remove(handle) else {
            return;
        };
        slot.cancelled.store(true, Ordering::Release);
        match slot.context.try_lock() {
            Some(mut context) => context.release(Status::Cancelled),
            None => debug!(%handle, "cancel deferred until the running callback returns"),
        }
        debug!(%handle, "context cancelled");
    }

    /// Run `action` with exclusive access to the context.
    pub fn with<R>(&self, handle: Handle, action: impl FnOnce(&mut Context) -> R) -> Result<R> {
        let slot = self.lookup(handle)?;
        let mut context = slot.context.try_lock().ok_or(VmError::ContextBusy(handle))?;
        Ok(action(&mut context))
    }

    pub fn status(&self, handle: Handle) -> Result<Status> {
        self.with(handle, |context| context.status())
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.table.lock().contains(handle)
    }

    /// Number of registered contexts.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.table.lock().iter().map(|(handle, _)| handle).collect()
    }

    fn lookup(&self, handle: Handle) -> Result<Arc<Slot>> {
        self.table
            .lock()
            .get(handle)
            .cloned()
            .ok_or(VmError::UnknownHandle(handle))
    }

    fn deregister(&self, handle: Handle) {
        if self.table.lock().remove(handle).is_some() {
            debug!(%handle, "context deregistered");
        }
    }

    /// Terminate a faulted context: release its arena, then invalidate the
    /// handle.
    fn fail(&self, handle: Handle, slot: &Slot, fault: Fault) -> VmError {
        warn!(%handle, %fault, "runtime fault");
        if let Some(mut context) = slot.context.try_lock() {
            context.release(Status::Finished);
        }
        self.deregister(handle);
        VmError::RuntimeFault { handle, fault }
    }

    fn check_arena_size(&self, stack_size: usize, memory_size: usize) -> Result<()> {
        let invalid = VmError::InvalidArenaSize {
            stack: stack_size,
            memory: memory_size,
        };
        if stack_size == 0 || stack_size % ARENA_ALIGNMENT != 0 || memory_size % ARENA_ALIGNMENT != 0 {
            return Err(invalid);
        }
        let requested = stack_size.checked_add(memory_size).ok_or(invalid)?;
        if let Some(limit) = self.config.max_arena_size {
            if requested > limit {
                return Err(VmError::ArenaTooLarge { requested, limit });
            }
        }
        Ok(())
    }
}

/// Index of the exported, argument-less function `entry`.
fn entry_function(module: &Module, entry: &str) -> Result<usize> {
    let function = module
        .find_export(entry)
        .ok_or_else(|| VmError::EntryNotFound(entry.to_string()))?;
    let func = &module.functions[function];
    if !func.params.is_empty() || func.result.is_some() {
        return Err(VmError::InvalidEntry(entry.to_string()));
    }
    Ok(function)
}
