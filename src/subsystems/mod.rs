//! Built-in archivable subsystems.
//!
//! These are the default participants every [`ExecutionContext`](crate::ExecutionContext)
//! registers, in this fixed order:
//!
//! 1. [`HandleScopes`] - the handle/scope stack; archived first so data containing GC roots
//!    sits at the front of each thread-state buffer
//! 2. [`StackGuard`] - interrupt flags and stack-limit bookkeeping; the delivery point for
//!    cooperative preemption and termination requests
//! 3. [`RegexpStack`] - the regular-expression backtracking stack's archive/restore contract
//!
//! Embedders add their own subsystems after these through
//! [`ContextBuilder::subsystem`](crate::ContextBuilder::subsystem).

mod handle_scopes;
mod regexp_stack;
mod stack_guard;

pub use handle_scopes::HandleScopes;
pub use regexp_stack::RegexpStack;
pub use stack_guard::{InterruptFlags, Interrupts, StackGuard};
