//! Regular-expression backtracking stack: archive/restore contract only.
//!
//! The regexp engine's own growth policy is out of scope here; this subsystem exists so a
//! thread suspended in the middle of a backtracking match keeps its stack across an
//! archive/restore cycle. Archiving detaches the live backtrack data into the thread-state
//! buffer; restoring re-attaches it; releasing drops the backing allocation outright.

use crate::{
    archive::{Archivable, ArchiveReader, ArchiveWriter},
    Error, Result,
};

/// Bytes of backtrack data one archived thread may carry.
const ARCHIVED_STACK_BYTES: usize = 256;

/// The archivable backtracking-stack descriptor.
pub struct RegexpStack {
    data: Vec<u8>,
}

impl RegexpStack {
    /// Archived layout: length (8) + fixed data region.
    const FOOTPRINT: usize = 8 + ARCHIVED_STACK_BYTES;

    /// Create an empty, detached backtracking stack.
    #[must_use]
    pub fn new() -> Self {
        RegexpStack { data: Vec::new() }
    }

    /// Append backtrack data to the live stack.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Pop the topmost `len` bytes.
    ///
    /// # Panics
    /// If the stack holds fewer than `len` bytes.
    pub fn pop_bytes(&mut self, len: usize) {
        contract!(
            len <= self.data.len(),
            "regexp stack pop of {} bytes, only {} present",
            len,
            self.data.len()
        );
        self.data.truncate(self.data.len() - len);
    }

    /// The live backtrack data, bottom first.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Number of live backtrack bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the live stack is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for RegexpStack {
    fn default() -> Self {
        Self::new()
    }
}

impl Archivable for RegexpStack {
    fn name(&self) -> &'static str {
        "regexp-stack"
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
        if self.data.len() > ARCHIVED_STACK_BYTES {
            return Err(Error::CapacityExceeded {
                subsystem: self.name(),
                needed: self.data.len(),
                capacity: ARCHIVED_STACK_BYTES,
            });
        }
        writer.write_usize(self.data.len())?;
        writer.write_bytes(&self.data)?;
        writer.pad(ARCHIVED_STACK_BYTES - self.data.len())?;
        self.data.clear();
        Ok(())
    }

    fn restore(&mut self, reader: &mut ArchiveReader<'_>) -> Result<()> {
        let len = reader.read_usize()?;
        if len > ARCHIVED_STACK_BYTES {
            // A length above the cap can only come from a corrupt buffer.
            return Err(Error::CapacityExceeded {
                subsystem: self.name(),
                needed: len,
                capacity: ARCHIVED_STACK_BYTES,
            });
        }
        self.data = reader.read_bytes(len)?.to_vec();
        reader.skip(ARCHIVED_STACK_BYTES - len)?;
        Ok(())
    }

    fn release(&mut self) {
        // Drop the backing allocation, not just the contents.
        self.data = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_preserves_backtrack_data() {
        let mut stack = RegexpStack::new();
        stack.push_bytes(&[1, 2, 3, 4, 5]);
        stack.pop_bytes(2);
        assert_eq!(stack.as_slice(), &[1, 2, 3]);

        let mut buffer = [0u8; RegexpStack::FOOTPRINT];
        let mut writer = ArchiveWriter::new(&mut buffer);
        stack.archive(&mut writer).unwrap();
        assert_eq!(writer.pos(), RegexpStack::FOOTPRINT);
        assert!(stack.is_empty());

        let mut reader = ArchiveReader::new(&buffer);
        stack.restore(&mut reader).unwrap();
        assert_eq!(reader.pos(), RegexpStack::FOOTPRINT);
        assert_eq!(stack.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_corrupt_length_rejected() {
        // A buffer whose leading length exceeds the cap must decode to an error,
        // not underflow the padding arithmetic.
        let mut buffer = [0u8; RegexpStack::FOOTPRINT];
        let mut writer = ArchiveWriter::new(&mut buffer);
        writer.write_usize(ARCHIVED_STACK_BYTES + 1).unwrap();

        let mut stack = RegexpStack::new();
        let mut reader = ArchiveReader::new(&buffer);
        assert!(matches!(
            stack.restore(&mut reader),
            Err(Error::CapacityExceeded {
                subsystem: "regexp-stack",
                ..
            })
        ));
    }

    #[test]
    fn test_oversized_stack_refused() {
        let mut stack = RegexpStack::new();
        stack.push_bytes(&vec![0xAB; ARCHIVED_STACK_BYTES + 1]);

        let mut buffer = [0u8; RegexpStack::FOOTPRINT];
        let mut writer = ArchiveWriter::new(&mut buffer);
        assert!(matches!(
            stack.archive(&mut writer),
            Err(Error::CapacityExceeded {
                subsystem: "regexp-stack",
                ..
            })
        ));
    }
}
