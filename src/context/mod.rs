//! The execution context: the per-runtime-instance state container and its binding.
//!
//! # Architecture
//!
//! An [`ExecutionContext`] owns one instance of every subsystem's state: the sealed
//! [`SubsystemRegistry`](crate::SubsystemRegistry), the
//! [`ThreadManager`](crate::ThreadManager), the shared interrupt word and the preemption
//! worker slot. Exactly one context is "current" for a given accessing thread at any
//! instant.
//!
//! # Binding
//!
//! A process-wide [`ContextMode`] chooses one of two binding disciplines, fixed before the
//! first context is created:
//!
//! - [`ContextMode::Single`] - every access resolves to the process default context; no
//!   thread-local lookup cost
//! - [`ContextMode::PerThread`] - each accessing thread consults a thread-local slot set
//!   through [`ContextScope`], falling back to the process default when unset (so helper
//!   threads without their own context still function)
//!
//! The first context created becomes the process default. Rebinding through
//! [`ContextScope`] is nestable and restores the previous binding on scope exit.
//!
//! # Examples
//!
//! ```rust
//! use lockstep::{ContextBuilder, ExecutionContext};
//!
//! let ctx = ExecutionContext::new();
//! assert!(!ctx.is_active());
//! ```

use std::{
    cell::RefCell,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, OnceLock,
    },
    time::Duration,
};

use log::debug;

use crate::{
    archive::{Archivable, RootVisitor, SubsystemRegistry},
    subsystems::{HandleScopes, InterruptFlags, Interrupts, RegexpStack, StackGuard},
    threads::{switcher::ContextSwitcher, ThreadManager},
    Result,
};

/// The process-wide context binding discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    /// Every access resolves to the single process default context.
    Single,
    /// Each thread resolves its own bound context, falling back to the default.
    PerThread,
}

static MODE: OnceLock<ContextMode> = OnceLock::new();
static DEFAULT: OnceLock<Arc<ExecutionContext>> = OnceLock::new();

thread_local! {
    static CURRENT: RefCell<Option<Arc<ExecutionContext>>> = const { RefCell::new(None) };
}

/// Fix the process-wide binding mode.
///
/// Must be called before the first context is created; creating a context without calling
/// this first fixes the mode to [`ContextMode::Single`].
///
/// # Panics
/// If the mode has already been fixed to a different value.
pub fn set_context_mode(mode: ContextMode) {
    let fixed = *MODE.get_or_init(|| mode);
    contract!(
        fixed == mode,
        "context binding mode is already fixed to {fixed:?}"
    );
}

/// The binding mode in effect. Fixes [`ContextMode::Single`] if nothing chose one yet.
#[must_use]
pub fn context_mode() -> ContextMode {
    *MODE.get_or_init(|| ContextMode::Single)
}

/// The process default context: the first one created.
///
/// # Panics
/// If no context has been created yet.
#[must_use]
pub fn default_context() -> Arc<ExecutionContext> {
    Arc::clone(
        DEFAULT
            .get()
            .expect("no execution context has been created yet"),
    )
}

/// Resolve the context the calling thread should use.
///
/// In [`ContextMode::Single`] this is always the process default. In
/// [`ContextMode::PerThread`] it is the thread's bound context, or the default when the
/// thread has none bound.
#[must_use]
pub fn current_context() -> Arc<ExecutionContext> {
    match context_mode() {
        ContextMode::Single => default_context(),
        ContextMode::PerThread => CURRENT
            .with(|slot| slot.borrow().clone())
            .unwrap_or_else(default_context),
    }
}

/// Binds a context as the calling thread's current one for a lexical scope.
///
/// Nestable: the previous binding is saved on entry and restored on drop, matching stack
/// discipline. Only meaningful in [`ContextMode::PerThread`]; harmless otherwise.
pub struct ContextScope {
    previous: Option<Arc<ExecutionContext>>,
    /// Scopes are per-thread bindings; keep the guard on the thread that opened it.
    _not_send: PhantomData<*const ()>,
}

impl ContextScope {
    /// Bind `ctx` as current for the calling thread until the scope is dropped.
    #[must_use]
    pub fn enter(ctx: &Arc<ExecutionContext>) -> Self {
        let previous = CURRENT.with(|slot| slot.borrow_mut().replace(Arc::clone(ctx)));
        ContextScope {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        CURRENT.with(|slot| *slot.borrow_mut() = self.previous.take());
    }
}

/// Scoped acquisition of a shared-state mutex that only pays for locking when multiple
/// contexts can exist.
///
/// In [`ContextMode::Single`] there is exactly one context and the big lock already
/// serializes everything, so the guard skips the acquisition entirely; in
/// [`ContextMode::PerThread`] it takes the lock for the scope. Release is automatic and
/// unconditional on drop.
pub struct SharedStateGuard<'a> {
    _guard: Option<MutexGuard<'a, ()>>,
}

impl<'a> SharedStateGuard<'a> {
    /// Acquire `lock` if the binding mode requires it.
    #[must_use]
    pub fn new(lock: &'a Mutex<()>) -> Self {
        let guard = match context_mode() {
            ContextMode::Single => None,
            ContextMode::PerThread => Some(lock!(lock)),
        };
        SharedStateGuard { _guard: guard }
    }
}

/// Builder for an [`ExecutionContext`] with embedder-supplied subsystems.
///
/// The built-in subsystems (handle scopes, stack guard, regexp stack) are always
/// registered first, in that fixed order; extras follow in the order given.
///
/// # Examples
///
/// ```rust,ignore
/// let ctx = ContextBuilder::new()
///     .subsystem(Box::new(MyInterpreterState::new()))
///     .build();
/// ```
pub struct ContextBuilder {
    extra: Vec<Box<dyn Archivable>>,
}

impl ContextBuilder {
    /// Start a builder with only the built-in subsystems.
    #[must_use]
    pub fn new() -> Self {
        ContextBuilder { extra: Vec::new() }
    }

    /// Append an embedder subsystem to the archive order.
    #[must_use]
    pub fn subsystem(mut self, subsystem: Box<dyn Archivable>) -> Self {
        self.extra.push(subsystem);
        self
    }

    /// Create the context. The first context created becomes the process default and
    /// fixes the binding mode if nothing chose one yet.
    #[must_use]
    pub fn build(self) -> Arc<ExecutionContext> {
        let interrupts = Arc::new(InterruptFlags::new());
        let mut registry = SubsystemRegistry::new();
        registry
            .register(Box::new(HandleScopes::new()))
            .expect("fresh registry cannot be sealed");
        registry
            .register(Box::new(StackGuard::new(Arc::clone(&interrupts))))
            .expect("fresh registry cannot be sealed");
        registry
            .register(Box::new(RegexpStack::new()))
            .expect("fresh registry cannot be sealed");
        for subsystem in self.extra {
            registry
                .register(subsystem)
                .expect("fresh registry cannot be sealed");
        }
        registry.seal();

        let ctx = Arc::new(ExecutionContext {
            registry: Mutex::new(registry),
            thread_manager: ThreadManager::new(Arc::clone(&interrupts)),
            interrupts,
            active: AtomicBool::new(false),
            switcher: Mutex::new(None),
        });

        // Creating a context fixes the binding mode; the first one is the default.
        let _ = context_mode();
        if DEFAULT.set(Arc::clone(&ctx)).is_ok() {
            debug!("process default execution context created");
        }
        ctx
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The per-runtime-instance state container.
///
/// Owns the thread manager and every registered subsystem's state. Create explicitly
/// through [`ExecutionContext::new`] or [`ContextBuilder`]; OS-level resources (the lock,
/// the preemption worker) are released when the last handle drops.
pub struct ExecutionContext {
    registry: Mutex<SubsystemRegistry>,
    thread_manager: ThreadManager,
    interrupts: Arc<InterruptFlags>,
    /// Whether the guard API has ever been used on this context
    active: AtomicBool,
    switcher: Mutex<Option<ContextSwitcher>>,
}

impl ExecutionContext {
    /// Create a context with the built-in subsystems only.
    #[must_use]
    pub fn new() -> Arc<Self> {
        ContextBuilder::new().build()
    }

    /// The thread manager serializing execution on this context.
    #[must_use]
    pub fn thread_manager(&self) -> &ThreadManager {
        &self.thread_manager
    }

    /// Whether locking has ever been used on this context.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Returns `true` if the context switcher has asked the running thread to yield.
    ///
    /// Lock-free; meant to be polled from the interpreter's safe points.
    #[must_use]
    pub fn preemption_requested(&self) -> bool {
        self.interrupts.check(Interrupts::PREEMPT)
    }

    /// Acknowledge a preemption request, clearing it.
    ///
    /// # Panics
    /// If the calling thread does not hold the big lock.
    pub fn acknowledge_preemption(&self) {
        contract!(
            self.thread_manager.is_locked_by_current_thread(),
            "acknowledge_preemption requires the big lock"
        );
        self.interrupts.clear(Interrupts::PREEMPT);
    }

    /// Returns `true` if interpreter execution should terminate once it resumes.
    #[must_use]
    pub fn terminate_requested(&self) -> bool {
        self.interrupts.check(Interrupts::TERMINATE)
    }

    /// Clear a termination request, typically after the interpreter has unwound.
    pub fn clear_terminate(&self) {
        self.interrupts.clear(Interrupts::TERMINATE);
    }

    pub(crate) fn interrupts(&self) -> &Arc<InterruptFlags> {
        &self.interrupts
    }

    /// Lazily archive the calling thread's state.
    ///
    /// See [`ThreadManager::archive_thread`]; requires the big lock.
    pub fn archive_thread(&self) {
        self.thread_manager.archive_thread(&lock!(self.registry));
    }

    /// Commit the pending lazy archive.
    ///
    /// See [`ThreadManager::eagerly_archive_thread`]; requires the big lock.
    ///
    /// # Errors
    /// Propagates subsystem serialization errors.
    pub fn eagerly_archive_thread(&self) -> Result<()> {
        self.thread_manager
            .eagerly_archive_thread(&mut lock!(self.registry))
    }

    /// Restore the calling thread's archived state; `false` means a brand-new thread.
    ///
    /// See [`ThreadManager::restore_thread`]; requires the big lock.
    ///
    /// # Errors
    /// Propagates subsystem serialization errors.
    pub fn restore_thread(&self) -> Result<bool> {
        self.thread_manager
            .restore_thread(&mut lock!(self.registry))
    }

    /// Release the calling thread's live subsystem resources.
    ///
    /// See [`ThreadManager::free_thread_resources`]; requires the big lock.
    pub fn free_thread_resources(&self) {
        self.thread_manager
            .free_thread_resources(&mut lock!(self.registry));
    }

    /// Report every GC root held by archived (parked) threads to `visitor`.
    ///
    /// # Errors
    /// Propagates subsystem serialization errors.
    pub fn iterate(&self, visitor: &mut dyn RootVisitor) -> Result<()> {
        self.thread_manager.iterate(&lock!(self.registry), visitor)
    }

    /// Mark the archived thread with the given id to terminate on its next restore.
    ///
    /// Returns `true` if a matching archived thread was found.
    pub fn terminate_execution(&self, thread_id: u32) -> bool {
        self.thread_manager.terminate_execution(thread_id)
    }

    /// Run `f` with typed access to the registered subsystem of type `T`.
    ///
    /// Returns `None` if no subsystem of that type is registered. The registry lock is
    /// held for the duration of `f`; the big lock should be held too, since `f` sees the
    /// running thread's live state.
    pub fn with_subsystem<T: Archivable, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut registry = lock!(self.registry);
        registry.find_mut::<T>().map(f)
    }

    /// Start (or retune) cooperative preemption with the given interval.
    ///
    /// At most one worker exists per context; starting while one is running only updates
    /// its interval.
    ///
    /// # Panics
    /// If the calling thread does not hold the big lock.
    pub fn start_preemption(&self, interval: Duration) {
        contract!(
            self.thread_manager.is_locked_by_current_thread(),
            "start_preemption requires the big lock"
        );
        let mut slot = lock!(self.switcher);
        match slot.as_ref() {
            Some(switcher) => switcher.set_interval(interval),
            None => *slot = Some(ContextSwitcher::spawn(interval, Arc::clone(&self.interrupts))),
        }
    }

    /// Stop cooperative preemption and join the worker.
    ///
    /// After this returns, no preemption request will be issued and none is left pending.
    ///
    /// # Panics
    /// If the calling thread does not hold the big lock.
    pub fn stop_preemption(&self) {
        contract!(
            self.thread_manager.is_locked_by_current_thread(),
            "stop_preemption requires the big lock"
        );
        if let Some(switcher) = lock!(self.switcher).take() {
            switcher.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::RootRef;

    #[test]
    fn test_context_owns_default_subsystems() {
        let ctx = ExecutionContext::new();
        assert!(ctx.with_subsystem::<HandleScopes, _>(|_| ()).is_some());
        assert!(ctx.with_subsystem::<StackGuard, _>(|_| ()).is_some());
        assert!(ctx.with_subsystem::<RegexpStack, _>(|_| ()).is_some());
    }

    #[test]
    fn test_iterate_on_idle_context_is_empty() {
        let ctx = ExecutionContext::new();
        let mut roots = Vec::new();
        let mut visitor = |root: RootRef| roots.push(root);
        ctx.iterate(&mut visitor).unwrap();
        assert!(roots.is_empty());
    }

    #[test]
    fn test_shared_state_guard_skips_lock_in_single_mode() {
        // The lib test binary runs in the default binding mode.
        let _ = ExecutionContext::new();
        assert_eq!(context_mode(), ContextMode::Single);

        let lock = Mutex::new(());
        let guard = SharedStateGuard::new(&lock);
        // No acquisition happened, so the mutex is still free.
        assert!(lock.try_lock().is_ok());
        drop(guard);
    }

    #[test]
    fn test_interrupt_queries() {
        let ctx = ExecutionContext::new();
        assert!(!ctx.preemption_requested());
        assert!(!ctx.terminate_requested());

        ctx.interrupts().request(Interrupts::TERMINATE);
        assert!(ctx.terminate_requested());
        ctx.clear_terminate();
        assert!(!ctx.terminate_requested());
    }
}
