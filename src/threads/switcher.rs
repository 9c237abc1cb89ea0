//! Cooperative preemption: the background context-switcher worker.
//!
//! The switcher is a single background thread that periodically sets the shared
//! [`Interrupts::PREEMPT`] bit, asking the currently running interpreter thread to yield
//! at its next safe point. The request is advisory and lock-free: the worker never
//! touches the big lock, since blocking on it would deadlock against the very thread it
//! is trying to interrupt.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use log::{debug, trace};

use crate::subsystems::{InterruptFlags, Interrupts};

/// Handle to the running preemption worker. At most one per context.
pub(crate) struct ContextSwitcher {
    keep_going: Arc<AtomicBool>,
    interval_ms: Arc<AtomicU64>,
    interrupts: Arc<InterruptFlags>,
    worker: Option<thread::JoinHandle<()>>,
}

impl ContextSwitcher {
    /// Spawn the worker. Resource exhaustion spawning a thread is fatal.
    pub(crate) fn spawn(interval: Duration, interrupts: Arc<InterruptFlags>) -> Self {
        let keep_going = Arc::new(AtomicBool::new(true));
        let interval_ms = Arc::new(AtomicU64::new(interval.as_millis().max(1) as u64));
        debug!(
            "starting preemption worker, interval {}ms",
            interval_ms.load(Ordering::Relaxed)
        );

        let worker = {
            let keep_going = Arc::clone(&keep_going);
            let interval_ms = Arc::clone(&interval_ms);
            let interrupts = Arc::clone(&interrupts);
            thread::Builder::new()
                .name("lockstep-preempt".to_string())
                .spawn(move || {
                    while keep_going.load(Ordering::Acquire) {
                        thread::sleep(Duration::from_millis(interval_ms.load(Ordering::Relaxed)));
                        if !keep_going.load(Ordering::Acquire) {
                            break;
                        }
                        trace!("requesting preemption");
                        interrupts.request(Interrupts::PREEMPT);
                    }
                })
                .expect("Failed to spawn the preemption worker")
        };

        ContextSwitcher {
            keep_going,
            interval_ms,
            interrupts,
            worker: Some(worker),
        }
    }

    /// Change the scheduling interval of the running worker.
    pub(crate) fn set_interval(&self, interval: Duration) {
        self.interval_ms
            .store(interval.as_millis().max(1) as u64, Ordering::Relaxed);
    }

    /// Stop the worker and join it.
    ///
    /// After this returns no further preemption request will be issued, and any request
    /// the worker raced in while stopping has been withdrawn.
    pub(crate) fn stop(mut self) {
        debug!("stopping preemption worker");
        self.keep_going.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.interrupts.clear(Interrupts::PREEMPT);
    }
}

impl Drop for ContextSwitcher {
    fn drop(&mut self) {
        // Covers the context being dropped with preemption still enabled.
        self.keep_going.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
