//! Thread-state serialization: the [`Archivable`] contract, the ordered subsystem
//! registry and the buffer cursors.
//!
//! Every stateful subsystem of the runtime - execution stack guard, handle scopes, regexp
//! backtracking stack, or anything an embedder registers - implements [`Archivable`] so its
//! per-thread state can be sized, serialized, deserialized, released and scanned for
//! garbage-collection roots. The [`SubsystemRegistry`] drives those operations in one fixed
//! registration order; the concatenation of all subsystem outputs, in that order, is the
//! thread-state buffer layout.
//!
//! # Key Components
//!
//! - [`Archivable`] - the capability set every participating subsystem exposes
//! - [`SubsystemRegistry`] - the ordered, sealable registry the thread manager drives
//! - [`ArchiveWriter`] / [`ArchiveReader`] - bounds-checked cursors over state buffers
//! - [`RootVisitor`] / [`RootRef`] - the channel through which archived buffers report
//!   interpreter object references to a collector

mod cursor;
mod subsystem;

pub use cursor::{ArchiveReader, ArchiveWriter};
pub use subsystem::{Archivable, RootRef, RootVisitor, SubsystemRegistry};
