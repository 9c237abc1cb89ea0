//! Handle/scope stack: the primary holder of garbage-collection roots.
//!
//! The handle scopes subsystem tracks the interpreter object references the running thread
//! has open, grouped into nestable scopes. It is registered first in archive order so that
//! data containing GC roots sits at the front of every thread-state buffer, and its
//! [`scan_roots`](crate::Archivable::scan_roots) implementation is what lets a collector
//! see references owned by threads that are parked outside the runtime.

use crate::{
    archive::{Archivable, ArchiveReader, ArchiveWriter, RootRef, RootVisitor},
    Error, Result,
};

/// Maximum number of open handles one archived thread may carry.
const MAX_ARCHIVED_HANDLES: usize = 64;
/// Maximum scope nesting depth one archived thread may carry.
const MAX_ARCHIVED_SCOPES: usize = 16;

/// The archivable handle/scope stack.
///
/// Live state is a stack of [`RootRef`] handles plus the start index of each open scope.
/// Closing a scope drops every handle opened inside it.
///
/// # Examples
///
/// ```rust
/// use lockstep::{subsystems::HandleScopes, RootRef};
///
/// let mut scopes = HandleScopes::new();
/// scopes.open_scope();
/// scopes.push_handle(RootRef(0x1000));
/// scopes.push_handle(RootRef(0x2000));
/// assert_eq!(scopes.handle_count(), 2);
/// scopes.close_scope();
/// assert_eq!(scopes.handle_count(), 0);
/// ```
pub struct HandleScopes {
    handles: Vec<RootRef>,
    scopes: Vec<usize>,
}

impl HandleScopes {
    /// Archived layout: handle count (8) + handle slots + scope count (8) + scope slots.
    const FOOTPRINT: usize = 8 + MAX_ARCHIVED_HANDLES * 8 + 8 + MAX_ARCHIVED_SCOPES * 8;

    /// Create an empty handle/scope stack.
    #[must_use]
    pub fn new() -> Self {
        HandleScopes {
            handles: Vec::new(),
            scopes: Vec::new(),
        }
    }

    /// Open a new handle scope.
    pub fn open_scope(&mut self) {
        self.scopes.push(self.handles.len());
    }

    /// Close the innermost scope, dropping every handle opened inside it.
    ///
    /// # Panics
    /// If no scope is open.
    pub fn close_scope(&mut self) {
        contract!(!self.scopes.is_empty(), "close_scope with no open scope");
        let start = self.scopes.pop().unwrap();
        self.handles.truncate(start);
    }

    /// Register an object reference in the current scope.
    pub fn push_handle(&mut self, root: RootRef) {
        self.handles.push(root);
    }

    /// Number of live handles.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Current scope nesting depth.
    #[must_use]
    pub fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    /// The live handles, innermost last.
    #[must_use]
    pub fn handles(&self) -> &[RootRef] {
        &self.handles
    }
}

impl Default for HandleScopes {
    fn default() -> Self {
        Self::new()
    }
}

impl Archivable for HandleScopes {
    fn name(&self) -> &'static str {
        "handle-scopes"
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
        if self.handles.len() > MAX_ARCHIVED_HANDLES {
            return Err(Error::CapacityExceeded {
                subsystem: self.name(),
                needed: self.handles.len() * 8,
                capacity: MAX_ARCHIVED_HANDLES * 8,
            });
        }
        if self.scopes.len() > MAX_ARCHIVED_SCOPES {
            return Err(Error::CapacityExceeded {
                subsystem: self.name(),
                needed: self.scopes.len() * 8,
                capacity: MAX_ARCHIVED_SCOPES * 8,
            });
        }

        writer.write_usize(self.handles.len())?;
        for handle in &self.handles {
            writer.write_u64(handle.0)?;
        }
        writer.pad((MAX_ARCHIVED_HANDLES - self.handles.len()) * 8)?;

        writer.write_usize(self.scopes.len())?;
        for &scope in &self.scopes {
            writer.write_usize(scope)?;
        }
        writer.pad((MAX_ARCHIVED_SCOPES - self.scopes.len()) * 8)?;

        self.handles.clear();
        self.scopes.clear();
        Ok(())
    }

    fn restore(&mut self, reader: &mut ArchiveReader<'_>) -> Result<()> {
        let handle_count = reader.read_usize()?;
        if handle_count > MAX_ARCHIVED_HANDLES {
            // A count above the cap can only come from a corrupt buffer.
            return Err(Error::CapacityExceeded {
                subsystem: self.name(),
                needed: handle_count.saturating_mul(8),
                capacity: MAX_ARCHIVED_HANDLES * 8,
            });
        }
        self.handles = (0..handle_count)
            .map(|_| reader.read_u64().map(RootRef))
            .collect::<Result<_>>()?;
        reader.skip((MAX_ARCHIVED_HANDLES - handle_count) * 8)?;

        let scope_count = reader.read_usize()?;
        if scope_count > MAX_ARCHIVED_SCOPES {
            return Err(Error::CapacityExceeded {
                subsystem: self.name(),
                needed: scope_count.saturating_mul(8),
                capacity: MAX_ARCHIVED_SCOPES * 8,
            });
        }
        self.scopes = (0..scope_count)
            .map(|_| reader.read_usize())
            .collect::<Result<_>>()?;
        reader.skip((MAX_ARCHIVED_SCOPES - scope_count) * 8)?;
        Ok(())
    }

    fn release(&mut self) {
        self.handles = Vec::new();
        self.scopes = Vec::new();
    }

    fn scan_roots(
        &self,
        visitor: &mut dyn RootVisitor,
        reader: &mut ArchiveReader<'_>,
    ) -> Result<()> {
        let handle_count = reader.read_usize()?;
        if handle_count > MAX_ARCHIVED_HANDLES {
            return Err(Error::CapacityExceeded {
                subsystem: self.name(),
                needed: handle_count.saturating_mul(8),
                capacity: MAX_ARCHIVED_HANDLES * 8,
            });
        }
        for _ in 0..handle_count {
            visitor.visit_root(RootRef(reader.read_u64()?));
        }
        reader.skip((MAX_ARCHIVED_HANDLES - handle_count) * 8)?;
        // Scope indices carry no object references.
        reader.skip(8 + MAX_ARCHIVED_SCOPES * 8)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_discipline() {
        let mut scopes = HandleScopes::new();
        scopes.open_scope();
        scopes.push_handle(RootRef(1));
        scopes.open_scope();
        scopes.push_handle(RootRef(2));
        scopes.push_handle(RootRef(3));
        assert_eq!(scopes.handle_count(), 3);
        assert_eq!(scopes.scope_depth(), 2);

        scopes.close_scope();
        assert_eq!(scopes.handles(), &[RootRef(1)]);
        scopes.close_scope();
        assert_eq!(scopes.handle_count(), 0);
    }

    #[test]
    fn test_archive_round_trip() {
        let mut scopes = HandleScopes::new();
        scopes.open_scope();
        scopes.push_handle(RootRef(0xAA));
        scopes.open_scope();
        scopes.push_handle(RootRef(0xBB));

        let mut buffer = [0u8; HandleScopes::FOOTPRINT];
        let mut writer = ArchiveWriter::new(&mut buffer);
        scopes.archive(&mut writer).unwrap();
        assert_eq!(writer.pos(), HandleScopes::FOOTPRINT);

        // Archiving moved the state out.
        assert_eq!(scopes.handle_count(), 0);
        assert_eq!(scopes.scope_depth(), 0);

        let mut reader = ArchiveReader::new(&buffer);
        scopes.restore(&mut reader).unwrap();
        assert_eq!(reader.pos(), HandleScopes::FOOTPRINT);
        assert_eq!(scopes.handles(), &[RootRef(0xAA), RootRef(0xBB)]);
        assert_eq!(scopes.scope_depth(), 2);
    }

    #[test]
    fn test_scan_roots_reports_archived_handles() {
        let mut scopes = HandleScopes::new();
        scopes.open_scope();
        scopes.push_handle(RootRef(7));
        scopes.push_handle(RootRef(8));

        let mut buffer = [0u8; HandleScopes::FOOTPRINT];
        let mut writer = ArchiveWriter::new(&mut buffer);
        scopes.archive(&mut writer).unwrap();

        let mut roots = Vec::new();
        let mut visitor = |root: RootRef| roots.push(root);
        let mut reader = ArchiveReader::new(&buffer);
        scopes.scan_roots(&mut visitor, &mut reader).unwrap();
        assert_eq!(reader.pos(), HandleScopes::FOOTPRINT);
        assert_eq!(roots, vec![RootRef(7), RootRef(8)]);
    }

    #[test]
    fn test_corrupt_count_rejected() {
        // A buffer whose leading count exceeds the cap must decode to an error,
        // not underflow the padding arithmetic.
        let mut buffer = [0u8; HandleScopes::FOOTPRINT];
        let mut writer = ArchiveWriter::new(&mut buffer);
        writer.write_usize(MAX_ARCHIVED_HANDLES + 1).unwrap();

        let mut scopes = HandleScopes::new();
        let mut reader = ArchiveReader::new(&buffer);
        assert!(matches!(
            scopes.restore(&mut reader),
            Err(Error::CapacityExceeded {
                subsystem: "handle-scopes",
                ..
            })
        ));

        let mut roots = Vec::new();
        let mut visitor = |root: RootRef| roots.push(root);
        let mut reader = ArchiveReader::new(&buffer);
        assert!(matches!(
            scopes.scan_roots(&mut visitor, &mut reader),
            Err(Error::CapacityExceeded {
                subsystem: "handle-scopes",
                ..
            })
        ));
        assert!(roots.is_empty());

        // Same check for the scope count, behind a valid handle region.
        let mut buffer = [0u8; HandleScopes::FOOTPRINT];
        let mut writer = ArchiveWriter::new(&mut buffer);
        writer.write_usize(0).unwrap();
        writer.pad(MAX_ARCHIVED_HANDLES * 8).unwrap();
        writer.write_usize(MAX_ARCHIVED_SCOPES + 1).unwrap();

        let mut reader = ArchiveReader::new(&buffer);
        assert!(matches!(
            scopes.restore(&mut reader),
            Err(Error::CapacityExceeded {
                subsystem: "handle-scopes",
                ..
            })
        ));
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut scopes = HandleScopes::new();
        scopes.open_scope();
        for i in 0..(MAX_ARCHIVED_HANDLES + 1) {
            scopes.push_handle(RootRef(i as u64));
        }

        let mut buffer = [0u8; HandleScopes::FOOTPRINT];
        let mut writer = ArchiveWriter::new(&mut buffer);
        assert!(matches!(
            scopes.archive(&mut writer),
            Err(Error::CapacityExceeded {
                subsystem: "handle-scopes",
                ..
            })
        ));
    }
}
