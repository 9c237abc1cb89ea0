//! The [`Archivable`] subsystem contract and the ordered [`SubsystemRegistry`].
//!
//! # Architecture
//!
//! The registry is an explicit, ordered list of boxed [`Archivable`] objects. Registration
//! order is a correctness-relevant invariant, not a configuration knob: `archive`, `restore`
//! and `scan_roots` walk the same order, so the byte layout of a thread-state buffer is the
//! concatenation of the subsystems' regions in registration order. The registry is sealed
//! before the first thread state is sized; afterwards the order and the total footprint are
//! frozen for the life of the context.
//!
//! After each subsystem call the registry verifies that the cursor advanced by exactly the
//! footprint that subsystem declared, and reports [`crate::Error::FootprintMismatch`]
//! otherwise. This is the guard that keeps one misbehaving subsystem from corrupting the
//! regions of everything registered after it.

use log::trace;

use crate::{
    archive::{ArchiveReader, ArchiveWriter},
    Error, Result,
};

/// An opaque reference to an interpreter-managed object.
///
/// Archived thread states can contain references the garbage collector must treat as roots
/// even though their owning thread is parked outside the runtime. Subsystems report such
/// references as `RootRef` values through a [`RootVisitor`].
///
/// The value itself is opaque to this crate; the embedding runtime decides what the word
/// means (a tagged pointer, a handle index, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootRef(pub u64);

/// Visitor for garbage-collection roots found in archived thread states.
///
/// Implemented by the embedding collector and passed to
/// [`ThreadManager::iterate`](crate::threads::ThreadManager::iterate), which feeds it every
/// root every archived thread still holds.
pub trait RootVisitor {
    /// Report one interpreter object reference found in an archived buffer.
    fn visit_root(&mut self, root: RootRef);
}

impl<F: FnMut(RootRef)> RootVisitor for F {
    fn visit_root(&mut self, root: RootRef) {
        self(root)
    }
}

/// The capability set every stateful subsystem exposes so its per-thread state can
/// participate in archiving.
///
/// All five serialization-facing operations on a given subsystem must agree on byte layout
/// and total size: `restore` must consume exactly the bytes `archive` wrote, `scan_roots`
/// must walk the same region without fully restoring it, and all of them must match
/// [`footprint_per_thread`](Archivable::footprint_per_thread).
///
/// # Examples
///
/// A minimal counter subsystem:
///
/// ```rust
/// use lockstep::{Archivable, ArchiveReader, ArchiveWriter, Result};
///
/// struct Counter {
///     value: u64,
/// }
///
/// impl Archivable for Counter {
///     fn name(&self) -> &'static str {
///         "counter"
///     }
///
///     fn as_any(&self) -> &dyn std::any::Any {
///         self
///     }
///
///     fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
///         self
///     }
///
///     fn footprint_per_thread(&self) -> usize {
///         8
///     }
///
///     fn archive(&mut self, writer: &mut ArchiveWriter<'_>) -> Result<()> {
///         writer.write_u64(self.value)?;
///         self.value = 0;
///         Ok(())
///     }
///
///     fn restore(&mut self, reader: &mut ArchiveReader<'_>) -> Result<()> {
///         self.value = reader.read_u64()?;
///         Ok(())
///     }
///
///     fn release(&mut self) {
///         self.value = 0;
///     }
/// }
/// ```
pub trait Archivable: std::any::Any + Send {
    /// A stable name identifying this subsystem in diagnostics.
    fn name(&self) -> &'static str;

    /// Upcast for typed access through
    /// [`SubsystemRegistry::find`](crate::SubsystemRegistry::find).
    fn as_any(&self) -> &dyn std::any::Any;

    /// Mutable upcast for typed access through
    /// [`SubsystemRegistry::find_mut`](crate::SubsystemRegistry::find_mut).
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;

    /// The number of bytes this subsystem needs per archived thread.
    ///
    /// Computed once when the registry is sealed; must not change afterwards.
    fn footprint_per_thread(&self) -> usize;

    /// Serialize the current thread's live state into `writer`.
    ///
    /// Must write exactly [`footprint_per_thread`](Archivable::footprint_per_thread) bytes.
    /// After a successful archive the live state is considered moved out; the subsystem
    /// should reset itself to a neutral state ready for another thread.
    ///
    /// # Errors
    /// [`crate::Error::BufferExhausted`] or [`crate::Error::CapacityExceeded`] if the live
    /// state no longer fits the declared footprint.
    fn archive(&mut self, writer: &mut ArchiveWriter<'_>) -> Result<()>;

    /// Deserialize state from `reader` back into this subsystem's live state.
    ///
    /// Must consume exactly the bytes [`archive`](Archivable::archive) wrote.
    ///
    /// # Errors
    /// [`crate::Error::BufferExhausted`] if the buffer is shorter than the declared layout.
    fn restore(&mut self, reader: &mut ArchiveReader<'_>) -> Result<()>;

    /// Prepare fresh live state for a brand-new thread that has nothing to restore.
    ///
    /// The default does nothing; subsystems with per-thread setup (the stack guard's limit
    /// bookkeeping, for instance) override it.
    fn init_thread(&mut self) {}

    /// Drop any heap resources owned by the current thread's live state.
    ///
    /// Called on top-level guard exit, when there is no future restore to preserve state
    /// for. Never called on archive.
    fn release(&mut self);

    /// Walk an archived buffer region and report interpreter object references, without
    /// fully restoring it.
    ///
    /// Must advance `reader` by exactly the declared footprint. The default implementation
    /// reports nothing and skips the region, which is correct for subsystems whose state
    /// contains no object references.
    ///
    /// # Errors
    /// [`crate::Error::BufferExhausted`] if the buffer is shorter than the declared layout.
    fn scan_roots(
        &self,
        _visitor: &mut dyn RootVisitor,
        reader: &mut ArchiveReader<'_>,
    ) -> Result<()> {
        reader.skip(self.footprint_per_thread())
    }
}

/// An ordered, sealable registry of [`Archivable`] subsystems.
///
/// Owned by an [`ExecutionContext`](crate::ExecutionContext); the thread manager drives it
/// to archive, restore, release and scan thread state. The registration order is fixed at
/// seal time and identical for every operation.
pub struct SubsystemRegistry {
    /// Registered subsystems, in archive order
    subsystems: Vec<Box<dyn Archivable>>,
    /// Per-subsystem footprints, cached at seal time
    footprints: Vec<usize>,
    /// Sum of all footprints, cached at seal time
    total_footprint: usize,
    /// Whether the registry has been sealed
    sealed: bool,
}

impl SubsystemRegistry {
    /// Create an empty, unsealed registry.
    #[must_use]
    pub fn new() -> Self {
        SubsystemRegistry {
            subsystems: Vec::new(),
            footprints: Vec::new(),
            total_footprint: 0,
            sealed: false,
        }
    }

    /// Append a subsystem to the archive order.
    ///
    /// # Errors
    /// Returns [`crate::Error::RegistrySealed`] if the registry has already been sealed.
    pub fn register(&mut self, subsystem: Box<dyn Archivable>) -> Result<()> {
        if self.sealed {
            return Err(Error::RegistrySealed(subsystem.name()));
        }
        trace!("registering archivable subsystem '{}'", subsystem.name());
        self.subsystems.push(subsystem);
        Ok(())
    }

    /// Freeze the registration order and compute the total per-thread footprint.
    ///
    /// Idempotent; called by the context before the first thread state is sized.
    pub fn seal(&mut self) {
        if self.sealed {
            return;
        }
        self.footprints = self
            .subsystems
            .iter()
            .map(|s| s.footprint_per_thread())
            .collect();
        self.total_footprint = self.footprints.iter().sum();
        self.sealed = true;
        trace!(
            "subsystem registry sealed: {} subsystems, {} bytes per thread",
            self.subsystems.len(),
            self.total_footprint
        );
    }

    /// Whether [`seal`](SubsystemRegistry::seal) has been called.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Number of registered subsystems.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subsystems.len()
    }

    /// Returns `true` if no subsystems are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subsystems.is_empty()
    }

    /// The total number of bytes one archived thread occupies.
    ///
    /// # Panics
    /// If the registry has not been sealed yet.
    #[must_use]
    pub fn total_footprint(&self) -> usize {
        contract!(self.sealed, "total_footprint requires a sealed registry");
        self.total_footprint
    }

    fn check_consumed(
        name: &'static str,
        expected: usize,
        before: usize,
        after: usize,
    ) -> Result<()> {
        let actual = after - before;
        if actual != expected {
            return Err(Error::FootprintMismatch {
                subsystem: name,
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Run every subsystem's `archive` over `buffer`, in registration order.
    ///
    /// # Errors
    /// Propagates subsystem errors; returns [`crate::Error::FootprintMismatch`] if a
    /// subsystem writes a different number of bytes than it declared.
    ///
    /// # Panics
    /// If the registry has not been sealed.
    pub fn archive_all(&mut self, buffer: &mut [u8]) -> Result<()> {
        contract!(self.sealed, "archive_all requires a sealed registry");
        let mut writer = ArchiveWriter::new(buffer);
        for (subsystem, &footprint) in self.subsystems.iter_mut().zip(&self.footprints) {
            let before = writer.pos();
            subsystem.archive(&mut writer)?;
            Self::check_consumed(subsystem.name(), footprint, before, writer.pos())?;
        }
        Ok(())
    }

    /// Run every subsystem's `restore` over `buffer`, in registration order.
    ///
    /// # Errors
    /// Propagates subsystem errors; returns [`crate::Error::FootprintMismatch`] if a
    /// subsystem reads a different number of bytes than it declared.
    ///
    /// # Panics
    /// If the registry has not been sealed.
    pub fn restore_all(&mut self, buffer: &[u8]) -> Result<()> {
        contract!(self.sealed, "restore_all requires a sealed registry");
        let mut reader = ArchiveReader::new(buffer);
        for (subsystem, &footprint) in self.subsystems.iter_mut().zip(&self.footprints) {
            let before = reader.pos();
            subsystem.restore(&mut reader)?;
            Self::check_consumed(subsystem.name(), footprint, before, reader.pos())?;
        }
        Ok(())
    }

    /// Run every subsystem's `init_thread`, for a brand-new thread with nothing to restore.
    pub fn init_thread_all(&mut self) {
        for subsystem in &mut self.subsystems {
            subsystem.init_thread();
        }
    }

    /// Run every subsystem's `release`, dropping the current thread's live resources.
    pub fn release_all(&mut self) {
        for subsystem in &mut self.subsystems {
            subsystem.release();
        }
    }

    /// Borrow the first registered subsystem of concrete type `T`, if any.
    #[must_use]
    pub fn find<T: Archivable>(&self) -> Option<&T> {
        self.subsystems
            .iter()
            .find_map(|s| s.as_any().downcast_ref::<T>())
    }

    /// Mutably borrow the first registered subsystem of concrete type `T`, if any.
    pub fn find_mut<T: Archivable>(&mut self) -> Option<&mut T> {
        self.subsystems
            .iter_mut()
            .find_map(|s| s.as_any_mut().downcast_mut::<T>())
    }

    /// Run every subsystem's `scan_roots` over `buffer`, in registration order.
    ///
    /// # Errors
    /// Propagates subsystem errors; returns [`crate::Error::FootprintMismatch`] if a
    /// subsystem consumes a different number of bytes than it declared.
    ///
    /// # Panics
    /// If the registry has not been sealed.
    pub fn scan_all(&self, visitor: &mut dyn RootVisitor, buffer: &[u8]) -> Result<()> {
        contract!(self.sealed, "scan_all requires a sealed registry");
        let mut reader = ArchiveReader::new(buffer);
        for (subsystem, &footprint) in self.subsystems.iter().zip(&self.footprints) {
            let before = reader.pos();
            subsystem.scan_roots(visitor, &mut reader)?;
            Self::check_consumed(subsystem.name(), footprint, before, reader.pos())?;
        }
        Ok(())
    }
}

impl Default for SubsystemRegistry {
    fn default() -> Self {
        Self::new()
    }
}
