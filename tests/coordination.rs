//! End-to-end coordination tests: many OS threads sharing one interpreter context.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    thread,
};

use lockstep::{
    subsystems::HandleScopes, ContextBuilder, ExecutionContext, Locker, RootRef, Unlocker,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Spec of the whole crate in one test: N threads hammer a shared counter through the
/// guard API, and mutual exclusion alone must keep every increment intact.
#[test]
fn test_single_owner_across_threads() {
    init_logging();
    let ctx = ExecutionContext::new();
    let counter = Arc::new(AtomicU32::new(0));
    const THREADS: usize = 8;
    const ROUNDS: usize = 50;

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let ctx = Arc::clone(&ctx);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let _locker = Locker::new(&ctx);
                    // Unsynchronized read-modify-write: only the big lock protects it.
                    let seen = counter.load(Ordering::Relaxed);
                    thread::yield_now();
                    counter.store(seen + 1, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::Relaxed), (THREADS * ROUNDS) as u32);
}

/// A blocked Locker acquires the lock once the holder drops its guard.
#[test]
fn test_blocked_locker_handoff() {
    init_logging();
    let ctx = ExecutionContext::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = Locker::new(&ctx);
    let waiter = {
        let ctx = Arc::clone(&ctx);
        let order = Arc::clone(&order);
        thread::spawn(move || {
            let _locker = Locker::new(&ctx);
            order.lock().unwrap().push("waiter");
        })
    };

    // Give the waiter time to block on the lock.
    thread::sleep(std::time::Duration::from_millis(50));
    order.lock().unwrap().push("holder");
    drop(first);

    waiter.join().unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["holder", "waiter"]);
}

/// Interpreter state set up under a Locker survives an Unlocker window in which another
/// thread runs its own interpreter work.
#[test]
fn test_unlocker_preserves_state_across_other_thread() {
    init_logging();
    let ctx = ContextBuilder::new().build();

    let _locker = Locker::new(&ctx);
    ctx.with_subsystem::<HandleScopes, _>(|scopes| {
        scopes.open_scope();
        scopes.push_handle(RootRef(0xA11CE));
    })
    .unwrap();

    {
        let _unlocker = Unlocker::new(&ctx);

        // While we are unlocked, another thread enters, uses the same subsystem, and
        // leaves. Its state must not bleed into ours.
        let ctx2 = Arc::clone(&ctx);
        thread::spawn(move || {
            let _locker = Locker::new(&ctx2);
            ctx2.with_subsystem::<HandleScopes, _>(|scopes| {
                assert_eq!(scopes.handle_count(), 0, "fresh thread sees fresh state");
                scopes.open_scope();
                scopes.push_handle(RootRef(0xB0B));
            })
            .unwrap();
        })
        .join()
        .unwrap();
    }

    ctx.with_subsystem::<HandleScopes, _>(|scopes| {
        assert_eq!(scopes.handles(), &[RootRef(0xA11CE)]);
        assert_eq!(scopes.scope_depth(), 1);
        scopes.close_scope();
    })
    .unwrap();
}

/// A Locker opened inside an Unlocker window restores the suspended state, runs as a
/// nested (non-top-level) entry, and re-archives on drop so the enclosing Unlocker can
/// restore everything on its way out.
#[test]
fn test_locker_within_unlocker_round_trip() {
    init_logging();
    let ctx = ExecutionContext::new();

    let _locker = Locker::new(&ctx);
    ctx.with_subsystem::<HandleScopes, _>(|scopes| {
        scopes.open_scope();
        scopes.push_handle(RootRef(0x5C3A));
    })
    .unwrap();

    {
        let _unlocker = Unlocker::new(&ctx);
        {
            // Same thread re-enters during its own unlock window: the inner guard must
            // restore the suspended state rather than initialize a fresh thread.
            let _inner = Locker::new(&ctx);
            ctx.with_subsystem::<HandleScopes, _>(|scopes| {
                assert_eq!(scopes.handles(), &[RootRef(0x5C3A)]);
                scopes.push_handle(RootRef(0xF00D));
            })
            .unwrap();
            // Inner drop archives lazily instead of releasing live resources.
        }
        assert!(!Locker::is_locked(&ctx));
    }

    // The Unlocker's restore sees everything the inner guard left behind.
    ctx.with_subsystem::<HandleScopes, _>(|scopes| {
        assert_eq!(scopes.handles(), &[RootRef(0x5C3A), RootRef(0xF00D)]);
        assert_eq!(scopes.scope_depth(), 1);
    })
    .unwrap();
}

/// While a thread sits inside an Unlocker its archived roots stay visible to a collector.
#[test]
fn test_parked_thread_roots_visible() {
    init_logging();
    let ctx = ExecutionContext::new();

    let _locker = Locker::new(&ctx);
    ctx.with_subsystem::<HandleScopes, _>(|scopes| {
        scopes.open_scope();
        scopes.push_handle(RootRef(0xDEAD));
    })
    .unwrap();

    let _unlocker = Unlocker::new(&ctx);
    let roots = {
        let ctx = Arc::clone(&ctx);
        thread::spawn(move || {
            let _locker = Locker::new(&ctx);
            let mut roots = Vec::new();
            let mut visitor = |root: RootRef| roots.push(root);
            ctx.iterate(&mut visitor).unwrap();
            roots
        })
        .join()
        .unwrap()
    };
    assert_eq!(roots, vec![RootRef(0xDEAD)]);
}

/// Thread ids are assigned once per thread, sequentially from 1.
#[test]
fn test_sequential_thread_ids() {
    init_logging();
    let ctx = ExecutionContext::new();
    let mut ids = Vec::new();
    for _ in 0..3 {
        let ctx = Arc::clone(&ctx);
        ids.push(
            thread::spawn(move || {
                let _locker = Locker::new(&ctx);
                let first = ctx.thread_manager().current_id();
                drop(Locker::new(&ctx));
                assert_eq!(ctx.thread_manager().current_id(), first);
                first
            })
            .join()
            .unwrap(),
        );
    }
    assert_eq!(ids, vec![1, 2, 3]);
}

/// Terminating a parked thread raises the termination request when it resumes.
#[test]
fn test_terminate_parked_thread() {
    init_logging();
    let ctx = ExecutionContext::new();
    let (victim_tx, victim_rx) = std::sync::mpsc::channel();
    let (resume_tx, resume_rx) = std::sync::mpsc::channel::<()>();

    let victim = {
        let ctx = Arc::clone(&ctx);
        thread::spawn(move || {
            let _locker = Locker::new(&ctx);
            victim_tx.send(ctx.thread_manager().current_id()).unwrap();
            assert!(!ctx.terminate_requested());
            {
                let _unlocker = Unlocker::new(&ctx);
                resume_rx.recv().unwrap();
                // Unlocker drop restores and must raise the termination request.
            }
            assert!(ctx.terminate_requested());
            ctx.clear_terminate();
        })
    };

    let victim_id = victim_rx.recv().unwrap();
    {
        let _locker = Locker::new(&ctx);
        assert!(ctx.terminate_execution(victim_id));
        assert!(!ctx.terminate_execution(victim_id + 100));
    }
    resume_tx.send(()).unwrap();
    victim.join().unwrap();
}
