//! RAII guards for entering and leaving the runtime.
//!
//! # Architecture
//!
//! [`Locker`] is the embedder's entry point: constructing one acquires the context's big
//! lock (blocking without bound), restores the calling thread's archived state if it has
//! one, and assigns the thread an interpreter id. Dropping it steps the thread out again.
//! Lockers nest on one thread; only the outermost one owns the lock, and only the
//! outermost top-level one releases live subsystem resources on exit.
//!
//! [`Unlocker`] is the inverse, used inside a locked region to let other threads run
//! during a blocking operation. Constructing one archives the calling thread's state
//! eagerly and releases the lock; dropping it reacquires the lock and restores the state.
//!
//! # Examples
//!
//! ```rust
//! use lockstep::{ExecutionContext, Locker, Unlocker};
//!
//! let ctx = ExecutionContext::new();
//! let locker = Locker::new(&ctx);
//! // ... run interpreter work ...
//! {
//!     let _unlocker = Unlocker::new(&ctx);
//!     // ... blocking I/O; other threads may enter the runtime ...
//! }
//! // lock reacquired, state restored
//! drop(locker);
//! ```

use std::{marker::PhantomData, sync::Arc, time::Duration};

use log::trace;

use crate::context::ExecutionContext;

/// RAII guard serializing interpreter access: the calling thread is the only one inside
/// the runtime while a `Locker` for the context is alive.
///
/// Nestable on one thread; reentrant construction is cheap and does not deadlock. Must be
/// dropped on the thread that created it.
pub struct Locker {
    ctx: Arc<ExecutionContext>,
    /// Whether this guard is the outermost one and owns the big lock
    has_lock: bool,
    /// Whether this thread entered with no archived state to restore
    top_level: bool,
    _not_send: PhantomData<*const ()>,
}

impl Locker {
    /// Enter the runtime: acquire the big lock (blocking without bound if another thread
    /// holds it), restore the calling thread's archived state if it has one, and assign
    /// the thread an id.
    #[must_use]
    pub fn new(ctx: &Arc<ExecutionContext>) -> Self {
        ctx.set_active();
        let mut has_lock = false;
        let mut top_level = true;
        if !ctx.thread_manager().is_locked_by_current_thread() {
            ctx.thread_manager().lock();
            has_lock = true;
            if ctx
                .restore_thread()
                .expect("subsystem restore failed; archived state is corrupt")
            {
                top_level = false;
            }
        }
        debug_assert!(ctx.thread_manager().is_locked_by_current_thread());
        ctx.thread_manager().assign_id();
        trace!("locker entered (outermost: {has_lock})");
        Locker {
            ctx: Arc::clone(ctx),
            has_lock,
            top_level,
            _not_send: PhantomData,
        }
    }

    /// Returns `true` if locking has ever been used on `ctx`.
    ///
    /// Embedders that support both locked and unlocked operation use this to decide
    /// whether a `Locker` is required.
    #[must_use]
    pub fn is_active(ctx: &ExecutionContext) -> bool {
        ctx.is_active()
    }

    /// Returns `true` if the calling thread holds `ctx`'s big lock.
    #[must_use]
    pub fn is_locked(ctx: &ExecutionContext) -> bool {
        ctx.thread_manager().is_locked_by_current_thread()
    }

    /// Start (or retune) cooperative preemption on the guarded context.
    pub fn start_preemption(&self, interval: Duration) {
        self.ctx.start_preemption(interval);
    }

    /// Stop cooperative preemption on the guarded context and join the worker.
    pub fn stop_preemption(&self) {
        self.ctx.stop_preemption();
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        if self.has_lock {
            if self.top_level {
                // No earlier state existed, so nothing will ever restore this thread:
                // release its live resources instead of parking them.
                self.ctx.free_thread_resources();
            } else {
                self.ctx.archive_thread();
            }
            self.ctx.thread_manager().unlock();
            trace!("locker exited");
        }
    }
}

/// RAII guard temporarily stepping the calling thread out of a locked region.
///
/// Construction archives the thread's state eagerly and releases the big lock; drop
/// reacquires the lock and restores the state. Must be dropped on the thread that created
/// it, strictly nested inside the `Locker` it suspends.
pub struct Unlocker {
    ctx: Arc<ExecutionContext>,
    _not_send: PhantomData<*const ()>,
}

impl Unlocker {
    /// Step out of the runtime: archive the calling thread's state and release the lock.
    ///
    /// The archive is committed eagerly before the lock is released, so the next thread
    /// entering pays no forced-archive cost.
    ///
    /// # Panics
    /// If the calling thread does not hold `ctx`'s big lock.
    #[must_use]
    pub fn new(ctx: &Arc<ExecutionContext>) -> Self {
        contract!(
            ctx.thread_manager().is_locked_by_current_thread(),
            "Unlocker requires the big lock"
        );
        ctx.archive_thread();
        ctx.eagerly_archive_thread()
            .expect("subsystem archive failed; thread state cannot be parked");
        ctx.thread_manager().unlock();
        trace!("unlocker entered");
        Unlocker {
            ctx: Arc::clone(ctx),
            _not_send: PhantomData,
        }
    }
}

impl Drop for Unlocker {
    fn drop(&mut self) {
        self.ctx.thread_manager().lock();
        let restored = self
            .ctx
            .restore_thread()
            .expect("subsystem restore failed; archived state is corrupt");
        debug_assert!(restored, "unlocked thread must have archived state");
        trace!("unlocker exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_lockers_share_the_lock() {
        let ctx = ExecutionContext::new();
        let outer = Locker::new(&ctx);
        assert!(Locker::is_locked(&ctx));
        {
            let _inner = Locker::new(&ctx);
            assert!(Locker::is_locked(&ctx));
        }
        // Inner drop must not release the outer guard's lock.
        assert!(Locker::is_locked(&ctx));
        drop(outer);
        assert!(!Locker::is_locked(&ctx));
    }

    #[test]
    fn test_activity_flag() {
        let ctx = ExecutionContext::new();
        assert!(!Locker::is_active(&ctx));
        drop(Locker::new(&ctx));
        assert!(Locker::is_active(&ctx));
    }

    #[test]
    fn test_unlocker_releases_and_restores() {
        let ctx = ExecutionContext::new();
        let _locker = Locker::new(&ctx);
        let id = ctx.thread_manager().current_id();
        {
            let _unlocker = Unlocker::new(&ctx);
            assert!(!Locker::is_locked(&ctx));
            assert_eq!(ctx.thread_manager().archived_count(), 1);
        }
        assert!(Locker::is_locked(&ctx));
        assert_eq!(ctx.thread_manager().archived_count(), 0);
        assert_eq!(ctx.thread_manager().current_id(), id);
    }

    #[test]
    #[should_panic(expected = "Unlocker requires the big lock")]
    fn test_unlocker_without_lock_panics() {
        let ctx = ExecutionContext::new();
        let _unlocker = Unlocker::new(&ctx);
    }
}
