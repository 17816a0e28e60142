//! Operation dispatch channel and the context control surface.
//!
//! When the interpreter reaches `OpEnd` it suspends the context and hands an
//! [`Operation`] to the host's [`OpHandler`] together with an [`OpContext`],
//! through which the handler reads and writes the arena and may redirect
//! the suspended context before it resumes.

use std::ops::{Deref, DerefMut};

use thiserror::Error;

use super::context::Context;
use super::error::{ArenaError, VmError};
use super::primitive::Address;

/// One operation invocation. Valid only for the duration of a callback.
#[derive(Debug, Clone, Copy)]
pub struct Operation<'a> {
    pub name: &'a str,
    pub params: &'a [Address],
    pub targets: &'a [Address],
}

impl Operation<'_> {
    pub fn param(&self, index: usize) -> Option<Address> {
        self.params.get(index).copied()
    }

    pub fn target(&self, index: usize) -> Option<Address> {
        self.targets.get(index).copied()
    }
}

/// Failure reported by an operation handler. Fatal to the context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HostError(pub String);

impl From<String> for HostError {
    fn from(message: String) -> Self {
        HostError(message)
    }
}

impl From<&str> for HostError {
    fn from(message: &str) -> Self {
        HostError(message.to_string())
    }
}

impl From<VmError> for HostError {
    fn from(err: VmError) -> Self {
        HostError(err.to_string())
    }
}

impl From<ArenaError> for HostError {
    fn from(err: ArenaError) -> Self {
        HostError(err.to_string())
    }
}

/// Host seam invoked once per dispatched operation.
pub trait OpHandler {
    fn handle(&mut self, ctx: &mut OpContext<'_>, op: &Operation<'_>) -> Result<(), HostError>;
}

impl<H: OpHandler + ?Sized> OpHandler for &mut H {
    fn handle(&mut self, ctx: &mut OpContext<'_>, op: &Operation<'_>) -> Result<(), HostError> {
        (**self).handle(ctx, op)
    }
}

impl<H: OpHandler + ?Sized> OpHandler for Box<H> {
    fn handle(&mut self, ctx: &mut OpContext<'_>, op: &Operation<'_>) -> Result<(), HostError> {
        (**self).handle(ctx, op)
    }
}

/// Closure adapter returned by [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap a closure as an [`OpHandler`].
///
/// ```
/// use strand::vm::{handler_fn, OpContext, Operation};
///
/// let mut seen = Vec::new();
/// let _handler = handler_fn(|_ctx: &mut OpContext<'_>, op: &Operation<'_>| {
///     seen.push(op.name.to_string());
///     Ok(())
/// });
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: FnMut(&mut OpContext<'_>, &Operation<'_>) -> Result<(), HostError>,
{
    FnHandler(f)
}

impl<F> OpHandler for FnHandler<F>
where
    F: FnMut(&mut OpContext<'_>, &Operation<'_>) -> Result<(), HostError>,
{
    fn handle(&mut self, ctx: &mut OpContext<'_>, op: &Operation<'_>) -> Result<(), HostError> {
        (self.0)(ctx, op)
    }
}

/// Control action requested by a handler, applied once it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Continue,
    GoTo(usize),
    Return,
}

/// The suspended context as seen from inside an operation callback.
///
/// Dereferences to [`Context`] for arena access.
pub struct OpContext<'a> {
    context: &'a mut Context,
    function: usize,
    control: Control,
    paused: bool,
}

impl<'a> OpContext<'a> {
    pub(crate) fn new(context: &'a mut Context, function: usize) -> Self {
        Self {
            context,
            function,
            control: Control::Continue,
            paused: false,
        }
    }

    pub(crate) fn finish(self) -> (Control, bool) {
        (self.control, self.paused)
    }

    /// Continue at `label` of the function that issued the operation.
    pub fn go_to(&mut self, label: &str) -> Result<(), VmError> {
        let pc = self
            .context
            .module()
            .functions
            .get(self.function)
            .and_then(|f| f.label_pc(label))
            .ok_or_else(|| VmError::LabelNotFound(label.to_string()))?;
        tracing::trace!(handle = %self.context.handle(), label, pc, "go_to");
        self.control = Control::GoTo(pc);
        Ok(())
    }

    /// Return from the function that issued the operation as soon as the
    /// callback completes.
    pub fn force_return(&mut self) {
        tracing::trace!(handle = %self.context.handle(), "force_return");
        self.control = Control::Return;
    }

    /// Stop an enclosing `consume` after this operation. No effect on
    /// `resume`, which always stops after one operation.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

impl Deref for OpContext<'_> {
    type Target = Context;

    fn deref(&self) -> &Context {
        self.context
    }
}

impl DerefMut for OpContext<'_> {
    fn deref_mut(&mut self) -> &mut Context {
        self.context
    }
}
