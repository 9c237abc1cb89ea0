use thiserror::Error;

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Only the serialization layer produces recoverable errors: every other failure mode in this
/// crate - acquiring out of order, double-archiving, restoring without the lock - is an embedder
/// contract violation and panics with a diagnostic instead (see the crate-level failure model).
///
/// # Error Categories
///
/// ## Cursor Errors
/// - [`Error::BufferExhausted`] - a read or write would run past the end of a state buffer
///
/// ## Subsystem Contract Errors
/// - [`Error::FootprintMismatch`] - a subsystem consumed a different number of bytes than it declared
/// - [`Error::CapacityExceeded`] - a subsystem's live state no longer fits its fixed footprint
/// - [`Error::RegistrySealed`] - an attempt to register a subsystem after the registry was sealed
///
/// # Examples
///
/// ```rust
/// use lockstep::{ArchiveWriter, Error};
///
/// let mut buffer = [0u8; 2];
/// let mut writer = ArchiveWriter::new(&mut buffer);
/// match writer.write_u32(7) {
///     Err(Error::BufferExhausted { requested, remaining }) => {
///         assert_eq!(requested, 4);
///         assert_eq!(remaining, 2);
///     }
///     other => panic!("expected BufferExhausted, got {:?}", other),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// A cursor operation would have read or written past the end of the buffer.
    ///
    /// Thread-state buffers are sized once, at creation, to the sum of every registered
    /// subsystem's declared footprint. This error is the bounds check that turns what would
    /// be a silent overrun into a reportable failure.
    #[error("state buffer exhausted: needed {requested} bytes, {remaining} remaining")]
    BufferExhausted {
        /// Number of bytes the operation needed
        requested: usize,
        /// Number of bytes left in the buffer
        remaining: usize,
    },

    /// A subsystem consumed a different number of bytes than its declared footprint.
    ///
    /// `archive`, `restore` and `scan_roots` must all agree on byte layout and total size
    /// with `footprint_per_thread`. A mismatch means the subsystem's serialization code is
    /// out of sync with its own size report.
    #[error("subsystem '{subsystem}' consumed {actual} bytes, declared footprint is {expected}")]
    FootprintMismatch {
        /// Name of the offending subsystem
        subsystem: &'static str,
        /// The footprint the subsystem declared
        expected: usize,
        /// The number of bytes actually consumed
        actual: usize,
    },

    /// A subsystem's live state grew past what its fixed footprint can hold.
    ///
    /// Built-in subsystems archive into a fixed-capacity region; if the live state
    /// (for example, the number of open handles) exceeds that capacity at archive time,
    /// the archive is refused rather than truncated.
    #[error("subsystem '{subsystem}' live state needs {needed} bytes, capacity is {capacity}")]
    CapacityExceeded {
        /// Name of the offending subsystem
        subsystem: &'static str,
        /// Bytes required to archive the live state
        needed: usize,
        /// Fixed capacity available
        capacity: usize,
    },

    /// A subsystem registration was attempted after the registry was sealed.
    ///
    /// Registration order is a correctness-relevant invariant: the concatenation of all
    /// subsystem outputs, in registration order, forms the thread-state buffer layout.
    /// Once the first thread state has been sized the order can no longer change.
    #[error("subsystem registry is sealed; '{0}' cannot be registered")]
    RegistrySealed(&'static str),
}
