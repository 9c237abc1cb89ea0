//! Execution stack guard: interrupt delivery and stack-limit bookkeeping.
//!
//! The stack guard is the subsystem through which asynchronous requests reach the running
//! thread. Requests are bits in a shared atomic word ([`InterruptFlags`]): the context
//! switcher sets [`Interrupts::PREEMPT`] without holding the big lock, and the thread
//! manager raises [`Interrupts::TERMINATE`] when a restored thread state carries the
//! terminate-on-restore flag. The running thread inspects the word at its own safe points;
//! nothing here ever forces it to stop.
//!
//! Like every other subsystem, the guard's per-thread state (the interrupt word and the
//! stack limit) is archived when its thread steps out of the runtime and restored when it
//! steps back in.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use bitflags::bitflags;
use log::trace;

use crate::{
    archive::{Archivable, ArchiveReader, ArchiveWriter},
    Result,
};

bitflags! {
    /// Asynchronous interrupt requests delivered to the running thread.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interrupts: u32 {
        /// The context switcher asks the running thread to yield at its next safe point.
        const PREEMPT = 1 << 0;
        /// Interpreter execution should terminate once it resumes.
        const TERMINATE = 1 << 1;
    }
}

/// The shared interrupt word.
///
/// One instance per [`ExecutionContext`](crate::ExecutionContext), shared between the
/// stack guard, the thread manager and the context switcher. Setting a bit is lock-free
/// and advisory; the running thread decides when to honor it.
pub struct InterruptFlags {
    word: AtomicU32,
}

impl InterruptFlags {
    /// Create a cleared interrupt word.
    #[must_use]
    pub fn new() -> Self {
        InterruptFlags {
            word: AtomicU32::new(0),
        }
    }

    /// Set the given interrupt bits. Never blocks.
    pub fn request(&self, interrupts: Interrupts) {
        self.word.fetch_or(interrupts.bits(), Ordering::Release);
    }

    /// Returns `true` if any of the given bits are currently set.
    #[must_use]
    pub fn check(&self, interrupts: Interrupts) -> bool {
        self.word.load(Ordering::Acquire) & interrupts.bits() != 0
    }

    /// Clear the given bits, returning `true` if any of them were set.
    pub fn clear(&self, interrupts: Interrupts) -> bool {
        self.word.fetch_and(!interrupts.bits(), Ordering::AcqRel) & interrupts.bits() != 0
    }

    /// Atomically take the whole word, leaving it cleared.
    fn take_word(&self) -> u32 {
        self.word.swap(0, Ordering::AcqRel)
    }

    /// Merge a previously archived word back in.
    ///
    /// ORed rather than stored, so a request delivered while the thread was parked is
    /// not lost.
    fn merge_word(&self, word: u32) {
        self.word.fetch_or(word, Ordering::AcqRel);
    }
}

impl Default for InterruptFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Default logical stack capacity tracked per thread, in bytes.
const DEFAULT_STACK_CAPACITY: usize = 512 * 1024;

/// The archivable execution stack guard.
///
/// Holds the running thread's interrupt word (shared through [`InterruptFlags`]) and its
/// stack-limit bookkeeping. Fresh threads get their limits initialized through
/// [`Archivable::init_thread`]; threads re-entering the runtime get their archived word
/// merged back into the live one.
pub struct StackGuard {
    interrupts: Arc<InterruptFlags>,
    /// Logical stack limit for the thread currently inside the runtime
    stack_limit: usize,
    /// Whether the live state belongs to an initialized thread
    initialized: bool,
}

impl StackGuard {
    /// Archived layout: interrupt word (4) + stack limit (8) + initialized flag (1).
    const FOOTPRINT: usize = 4 + 8 + 1;

    /// Create a stack guard wired to the context's shared interrupt word.
    #[must_use]
    pub fn new(interrupts: Arc<InterruptFlags>) -> Self {
        StackGuard {
            interrupts,
            stack_limit: 0,
            initialized: false,
        }
    }

    /// The live thread's logical stack limit.
    #[must_use]
    pub fn stack_limit(&self) -> usize {
        self.stack_limit
    }

    /// Whether the live state belongs to an initialized thread.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

impl Archivable for StackGuard {
    fn name(&self) -> &'static str {
        "stack-guard"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn footprint_per_thread(&self) -> usize {
        Self::FOOTPRINT
    }

    fn archive(&mut self, writer: &mut ArchiveWriter<'_>) -> Result<()> {
        // Capture and clear the live word; the next thread to run starts clean.
        writer.write_u32(self.interrupts.take_word())?;
        writer.write_usize(self.stack_limit)?;
        writer.write_bool(self.initialized)?;
        self.stack_limit = 0;
        self.initialized = false;
        Ok(())
    }

    fn restore(&mut self, reader: &mut ArchiveReader<'_>) -> Result<()> {
        self.interrupts.merge_word(reader.read_u32()?);
        self.stack_limit = reader.read_usize()?;
        self.initialized = reader.read_bool()?;
        Ok(())
    }

    fn init_thread(&mut self) {
        trace!("stack guard: initializing fresh thread state");
        self.stack_limit = DEFAULT_STACK_CAPACITY;
        self.initialized = true;
    }

    fn release(&mut self) {
        self.interrupts.take_word();
        self.stack_limit = 0;
        self.initialized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_check_clear() {
        let flags = InterruptFlags::new();
        assert!(!flags.check(Interrupts::PREEMPT));

        flags.request(Interrupts::PREEMPT);
        assert!(flags.check(Interrupts::PREEMPT));
        assert!(!flags.check(Interrupts::TERMINATE));

        assert!(flags.clear(Interrupts::PREEMPT));
        assert!(!flags.check(Interrupts::PREEMPT));
        assert!(!flags.clear(Interrupts::PREEMPT));
    }

    #[test]
    fn test_archive_clears_live_word() {
        let flags = Arc::new(InterruptFlags::new());
        let mut guard = StackGuard::new(Arc::clone(&flags));
        guard.init_thread();
        flags.request(Interrupts::TERMINATE);

        let mut buffer = [0u8; StackGuard::FOOTPRINT];
        let mut writer = ArchiveWriter::new(&mut buffer);
        guard.archive(&mut writer).unwrap();
        assert_eq!(writer.pos(), StackGuard::FOOTPRINT);

        // Archiving moved the word out of the live state.
        assert!(!flags.check(Interrupts::TERMINATE));
        assert!(!guard.is_initialized());

        let mut reader = ArchiveReader::new(&buffer);
        guard.restore(&mut reader).unwrap();
        assert_eq!(reader.pos(), StackGuard::FOOTPRINT);
        assert!(flags.check(Interrupts::TERMINATE));
        assert!(guard.is_initialized());
        assert_eq!(guard.stack_limit(), DEFAULT_STACK_CAPACITY);
    }

    #[test]
    fn test_restore_merges_pending_request() {
        let flags = Arc::new(InterruptFlags::new());
        let mut guard = StackGuard::new(Arc::clone(&flags));
        guard.init_thread();

        let mut buffer = [0u8; StackGuard::FOOTPRINT];
        let mut writer = ArchiveWriter::new(&mut buffer);
        guard.archive(&mut writer).unwrap();

        // A preempt request delivered while the thread was parked survives the restore.
        flags.request(Interrupts::PREEMPT);
        let mut reader = ArchiveReader::new(&buffer);
        guard.restore(&mut reader).unwrap();
        assert!(flags.check(Interrupts::PREEMPT));
    }
}
