//! The thread manager: big-lock ownership and the archive/restore lifecycle.
//!
//! # Architecture
//!
//! One [`ThreadManager`] per execution context serializes interpreter execution across OS
//! threads. The big lock is the only blocking operation in this crate; everything else -
//! archive, restore, id assignment, list manipulation - runs synchronously while the lock
//! is held, so the lock is the single writer-exclusion mechanism for all shared structures.
//!
//! Archiving is lazy: [`archive_thread`](ThreadManager::archive_thread) only reserves a
//! state buffer and records the thread as the pending lazy-archive candidate. The actual
//! serialization is deferred until it is proven necessary - another thread restoring, or a
//! second archive request - at which point
//! [`eagerly_archive_thread`](ThreadManager::eagerly_archive_thread) commits it. If the
//! same thread re-enters the runtime before that happens,
//! [`restore_thread`](ThreadManager::restore_thread) just hands the untouched buffer back
//! to the free list: no subsystem serialization ever ran.
//!
//! # Failure Policy
//!
//! Calling these operations out of order is an embedder bug: double-archive, restore
//! without the lock, or a second lazy archive while one is pending all panic with a
//! diagnostic naming the violated invariant. There is deliberately no recoverable-error
//! path for them.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
};

use dashmap::DashMap;
use log::{debug, trace, warn};

use crate::{
    archive::{RootVisitor, SubsystemRegistry},
    subsystems::{InterruptFlags, Interrupts},
    threads::state::{
        StateList, ThreadHandle, ThreadStateId, ThreadStateSet, INVALID_THREAD_ID,
    },
    Result,
};

/// The big lock: a mutual-exclusion primitive whose acquisition can outlive any lexical
/// scope, with an owner record for `is_locked_by_current_thread`.
struct BigLock {
    owner: Mutex<ThreadHandle>,
    available: Condvar,
}

impl BigLock {
    fn new() -> Self {
        BigLock {
            owner: Mutex::new(ThreadHandle::Invalid),
            available: Condvar::new(),
        }
    }

    /// Block until the lock is free, then take it. Unbounded wait, no timeout.
    fn lock(&self) {
        let mut owner = lock!(self.owner);
        while owner.is_valid() {
            owner = self
                .available
                .wait(owner)
                .expect("Failed to wait for the big lock");
        }
        *owner = ThreadHandle::current();
    }

    /// Release the lock and wake one waiter.
    fn unlock(&self) {
        let mut owner = lock!(self.owner);
        contract!(
            owner.is_current(),
            "unlock by a thread that does not hold the big lock"
        );
        *owner = ThreadHandle::Invalid;
        drop(owner);
        self.available.notify_one();
    }

    fn is_held_by_current_thread(&self) -> bool {
        lock!(self.owner).is_current()
    }
}

/// Per-OS-thread bookkeeping, keyed by OS thread identity instead of thread-local storage
/// so any thread can inspect another's entry while holding the big lock.
struct PerThread {
    /// Interpreter thread id, or [`INVALID_THREAD_ID`] until assigned
    id: u32,
    /// This thread's archived state, if it currently has one
    state: Option<ThreadStateId>,
}

/// The outstanding lazy-archive candidate. At most one thread per context may be in this
/// state; it is resolved before any other thread may lazily archive or restore.
struct LazySlot {
    thread: ThreadHandle,
    state: Option<ThreadStateId>,
}

/// Serializes interpreter execution across threads and manages archive/restore.
///
/// Owned by an [`ExecutionContext`](crate::ExecutionContext). All operations except
/// [`lock`](ThreadManager::lock) are non-blocking and require the big lock to be held by
/// the calling thread.
pub struct ThreadManager {
    lock: BigLock,
    states: Mutex<ThreadStateSet>,
    threads: DashMap<thread::ThreadId, PerThread>,
    /// Last id handed out; ids start at 1 because 0 doubles as "unset"
    last_id: AtomicU32,
    lazy: Mutex<LazySlot>,
    interrupts: Arc<InterruptFlags>,
}

impl ThreadManager {
    /// Create a manager wired to the context's shared interrupt word.
    #[must_use]
    pub fn new(interrupts: Arc<InterruptFlags>) -> Self {
        ThreadManager {
            lock: BigLock::new(),
            states: Mutex::new(ThreadStateSet::new()),
            threads: DashMap::new(),
            last_id: AtomicU32::new(0),
            lazy: Mutex::new(LazySlot {
                thread: ThreadHandle::Invalid,
                state: None,
            }),
            interrupts,
        }
    }

    /// Acquire the big lock, blocking without bound, and record the caller as owner.
    pub fn lock(&self) {
        self.lock.lock();
        trace!("big lock acquired");
    }

    /// Release the big lock.
    ///
    /// # Panics
    /// If the calling thread does not hold the lock.
    pub fn unlock(&self) {
        trace!("big lock released");
        self.lock.unlock();
    }

    /// Returns `true` iff the lock-owner record equals the calling thread's identity.
    #[must_use]
    pub fn is_locked_by_current_thread(&self) -> bool {
        self.lock.is_held_by_current_thread()
    }

    /// Assign the calling thread the next sequential id if it has none yet, and return its id.
    ///
    /// Ids are unique and monotonically increasing per context, starting at 1.
    ///
    /// # Panics
    /// If a fresh id is needed and the calling thread does not hold the lock.
    pub fn assign_id(&self) -> u32 {
        let key = thread::current().id();
        let mut entry = self.threads.entry(key).or_insert_with(|| PerThread {
            id: INVALID_THREAD_ID,
            state: None,
        });
        if entry.id == INVALID_THREAD_ID {
            contract!(
                self.is_locked_by_current_thread(),
                "assign_id requires the big lock"
            );
            entry.id = self.last_id.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("assigned interpreter thread id {}", entry.id);
        }
        entry.id
    }

    /// Returns `true` if the calling thread has been assigned an id.
    #[must_use]
    pub fn has_id(&self) -> bool {
        self.current_id() != INVALID_THREAD_ID
    }

    /// The calling thread's id, or [`INVALID_THREAD_ID`] if none was assigned.
    #[must_use]
    pub fn current_id(&self) -> u32 {
        self.threads
            .get(&thread::current().id())
            .map_or(INVALID_THREAD_ID, |entry| entry.id)
    }

    /// Returns `true` if the calling thread currently has an archived (or lazily archived)
    /// thread state.
    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.threads
            .get(&thread::current().id())
            .is_some_and(|entry| entry.state.is_some())
    }

    /// Lazily archive the calling thread: reserve a state buffer and mark the thread as
    /// the pending candidate, without running any subsystem serialization.
    ///
    /// The cost of a real archive is paid only if another thread needs to run before this
    /// one returns; see [`restore_thread`](ThreadManager::restore_thread).
    ///
    /// # Panics
    /// If the lock is not held, the thread is already archived, the thread has no id, or
    /// another thread is already the pending lazy-archive candidate.
    pub fn archive_thread(&self, registry: &SubsystemRegistry) {
        contract!(
            self.is_locked_by_current_thread(),
            "archive_thread requires the big lock"
        );
        let mut lazy = lock!(self.lazy);
        contract!(
            !lazy.thread.is_valid(),
            "a lazily archived thread is already pending"
        );
        contract!(!self.is_archived(), "thread is already archived");

        let id = self.current_id();
        contract!(
            id != INVALID_THREAD_ID,
            "archive_thread requires an assigned thread id"
        );

        let state = {
            let mut states = lock!(self.states);
            let state = states.get_free(registry.total_footprint());
            states.unlink(state);
            debug_assert_eq!(states.state(state).id(), INVALID_THREAD_ID);
            states.state_mut(state).set_id(id);
            state
        };

        self.threads
            .get_mut(&thread::current().id())
            .expect("thread with an id must have a registry entry")
            .state = Some(state);
        lazy.thread = ThreadHandle::current();
        lazy.state = Some(state);
        debug!("thread {id} lazily archived");
    }

    /// Commit the pending lazy archive: link its state into the in-use list and run every
    /// subsystem's `archive` over the buffer, in registration order.
    ///
    /// # Errors
    /// Propagates subsystem serialization errors; these indicate a subsystem that violates
    /// its own footprint contract and leave the context unusable.
    ///
    /// # Panics
    /// If no lazy-archive candidate is pending.
    pub fn eagerly_archive_thread(&self, registry: &mut SubsystemRegistry) -> Result<()> {
        let mut lazy = lock!(self.lazy);
        self.eagerly_archive_locked(&mut lazy, registry)
    }

    fn eagerly_archive_locked(
        &self,
        lazy: &mut LazySlot,
        registry: &mut SubsystemRegistry,
    ) -> Result<()> {
        contract!(
            lazy.thread.is_valid(),
            "eager archive without a pending lazily archived thread"
        );
        let state = lazy
            .state
            .take()
            .expect("pending lazy archive must have a reserved state");

        let mut states = lock!(self.states);
        states.link_into(state, StateList::InUse);
        let state = states.state_mut(state);
        registry.archive_all(state.data_mut())?;
        debug!("thread {} eagerly archived", state.id());

        lazy.thread = ThreadHandle::Invalid;
        Ok(())
    }

    /// Restore the calling thread's archived state, if any.
    ///
    /// Three paths, in order:
    ///
    /// 1. The caller is the pending lazy-archive candidate: reclaim the untouched buffer
    ///    onto the free list; no subsystem `archive` or `restore` ever ran. Returns `true`.
    /// 2. Some *other* thread is the pending candidate: commit it eagerly first (only one
    ///    thread may be pending at a time), then continue.
    /// 3. The caller has a committed state: run every subsystem's `restore` in registration
    ///    order, honor the terminate-on-restore flag, and recycle the buffer. Returns
    ///    `true`. With no state at all this is a brand-new thread: initialize fresh
    ///    subsystem state and return `false`.
    ///
    /// # Errors
    /// Propagates subsystem serialization errors.
    ///
    /// # Panics
    /// If the calling thread does not hold the lock.
    pub fn restore_thread(&self, registry: &mut SubsystemRegistry) -> Result<bool> {
        contract!(
            self.is_locked_by_current_thread(),
            "restore_thread requires the big lock"
        );
        let key = thread::current().id();

        {
            let mut lazy = lock!(self.lazy);
            if lazy.thread.is_current() {
                // Lazily archived and nothing intervened: the buffer was never written,
                // so just put it back.
                let state = lazy
                    .state
                    .take()
                    .expect("pending lazy archive must have a reserved state");
                let mut states = lock!(self.states);
                states.state_mut(state).set_id(INVALID_THREAD_ID);
                states.link_into(state, StateList::Free);
                drop(states);
                lazy.thread = ThreadHandle::Invalid;
                self.threads
                    .get_mut(&key)
                    .expect("lazily archived thread must have a registry entry")
                    .state = None;
                trace!("lazy archive elided for thread {}", self.current_id());
                return Ok(true);
            }
            if lazy.thread.is_valid() {
                self.eagerly_archive_locked(&mut lazy, registry)?;
            }
        }

        let state = match self.threads.get(&key).and_then(|entry| entry.state) {
            Some(state) => state,
            None => {
                // Brand-new thread: nothing to restore.
                registry.init_thread_all();
                return Ok(false);
            }
        };

        let mut states = lock!(self.states);
        {
            let state = states.state_mut(state);
            registry.restore_all(state.data())?;
            if state.terminate_on_restore() {
                debug!("honoring terminate-on-restore for thread {}", state.id());
                self.interrupts.request(Interrupts::TERMINATE);
                state.set_terminate_on_restore(false);
            }
            state.set_id(INVALID_THREAD_ID);
        }
        states.unlink(state);
        states.link_into(state, StateList::Free);
        drop(states);

        self.threads
            .get_mut(&key)
            .expect("archived thread must have a registry entry")
            .state = None;
        Ok(true)
    }

    /// Call every subsystem's `release` for the calling thread's live state.
    ///
    /// Used on top-level guard exit, when there is no future restore to preserve state for.
    pub fn free_thread_resources(&self, registry: &mut SubsystemRegistry) {
        trace!("freeing live thread resources");
        registry.release_all();
    }

    /// Run every subsystem's `scan_roots` over every archived thread state, so a collector
    /// can see references owned by threads parked outside the runtime.
    ///
    /// # Errors
    /// Propagates subsystem serialization errors.
    pub fn iterate(
        &self,
        registry: &SubsystemRegistry,
        visitor: &mut dyn RootVisitor,
    ) -> Result<()> {
        let states = lock!(self.states);
        let mut cursor = states.first_in_use();
        while let Some(state) = cursor {
            registry.scan_all(visitor, states.state(state).data())?;
            cursor = states.next_in_use(state);
        }
        Ok(())
    }

    /// Mark the archived thread with the given id to terminate interpreter execution the
    /// next time it restores. Returns `true` if a matching archived thread was found.
    pub fn terminate_execution(&self, thread_id: u32) -> bool {
        let mut states = lock!(self.states);
        let mut found = false;
        let mut cursor = states.first_in_use();
        while let Some(state) = cursor {
            if states.state(state).id() == thread_id {
                states.state_mut(state).set_terminate_on_restore(true);
                found = true;
            }
            cursor = states.next_in_use(state);
        }
        if !found {
            warn!("terminate_execution: no archived thread with id {thread_id}");
        }
        found
    }

    /// Number of committed archived thread states.
    #[must_use]
    pub fn archived_count(&self) -> usize {
        lock!(self.states).in_use_count()
    }
}
