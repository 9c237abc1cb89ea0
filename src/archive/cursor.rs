//! Bounds-checked buffer cursors for thread-state serialization.
//!
//! This module provides [`crate::archive::cursor::ArchiveWriter`] and
//! [`crate::archive::cursor::ArchiveReader`], the cursor pair every archivable subsystem uses to
//! move its state into and out of a thread-state buffer. The cursors replace raw pointer
//! arithmetic with position-tracked, bounds-checked access: an operation that would run past the
//! end of the buffer returns [`crate::Error::BufferExhausted`] instead of overrunning.
//!
//! # Architecture
//!
//! Both cursors maintain a position within a byte slice and advance it by exactly the number of
//! bytes each operation touches. The subsystem registry uses the positions to verify that every
//! subsystem consumes exactly the footprint it declared:
//!
//! - **Position tracking** - `pos()` before and after a subsystem call yields the bytes consumed
//! - **Bounds checking** - every read and write validates availability first
//! - **Fixed-width encoding** - all integers are stored little-endian at fixed width, so a
//!   reader always consumes exactly the bytes the matching writer produced
//!
//! # Usage Examples
//!
//! ```rust
//! use lockstep::{ArchiveReader, ArchiveWriter};
//!
//! let mut buffer = [0u8; 16];
//!
//! let mut writer = ArchiveWriter::new(&mut buffer);
//! writer.write_u32(0xC0FFEE)?;
//! writer.write_u64(42)?;
//! writer.write_bool(true)?;
//! assert_eq!(writer.pos(), 13);
//!
//! let mut reader = ArchiveReader::new(&buffer);
//! assert_eq!(reader.read_u32()?, 0xC0FFEE);
//! assert_eq!(reader.read_u64()?, 42);
//! assert!(reader.read_bool()?);
//! assert_eq!(reader.pos(), 13);
//! # Ok::<(), lockstep::Error>(())
//! ```

use crate::{Error, Result};

/// A position-tracked, bounds-checked writer over a thread-state buffer.
///
/// Subsystems receive an `ArchiveWriter` in [`Archivable::archive`](crate::Archivable::archive)
/// and must write exactly the bytes their declared footprint covers. Integers are encoded
/// little-endian at fixed width.
///
/// # Examples
///
/// ```rust
/// use lockstep::ArchiveWriter;
///
/// let mut buffer = [0u8; 8];
/// let mut writer = ArchiveWriter::new(&mut buffer);
/// writer.write_u64(0x0102_0304)?;
/// assert_eq!(writer.remaining(), 0);
/// # Ok::<(), lockstep::Error>(())
/// ```
pub struct ArchiveWriter<'a> {
    /// The buffer being written
    data: &'a mut [u8],
    /// Current position within the buffer
    position: usize,
}

impl<'a> ArchiveWriter<'a> {
    /// Create a new [`crate::archive::cursor::ArchiveWriter`] over a mutable byte slice.
    ///
    /// # Arguments
    /// * `data` - The buffer to write into
    #[must_use]
    pub fn new(data: &'a mut [u8]) -> Self {
        ArchiveWriter { data, position: 0 }
    }

    /// Returns the current write position.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Returns the number of bytes still available for writing.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    fn reserve(&mut self, len: usize) -> Result<&mut [u8]> {
        if len > self.remaining() {
            return Err(Error::BufferExhausted {
                requested: len,
                remaining: self.remaining(),
            });
        }
        let start = self.position;
        self.position += len;
        Ok(&mut self.data[start..start + len])
    }

    /// Write a single byte.
    ///
    /// # Errors
    /// Returns [`crate::Error::BufferExhausted`] if the buffer is full.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.reserve(1)?[0] = value;
        Ok(())
    }

    /// Write a `u32` in little-endian encoding.
    ///
    /// # Errors
    /// Returns [`crate::Error::BufferExhausted`] if fewer than 4 bytes remain.
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.reserve(4)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Write a `u64` in little-endian encoding.
    ///
    /// # Errors
    /// Returns [`crate::Error::BufferExhausted`] if fewer than 8 bytes remain.
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.reserve(8)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Write a `usize` as a little-endian `u64`.
    ///
    /// Stored at fixed width so buffer layouts do not depend on the platform word size.
    ///
    /// # Errors
    /// Returns [`crate::Error::BufferExhausted`] if fewer than 8 bytes remain.
    pub fn write_usize(&mut self, value: usize) -> Result<()> {
        self.write_u64(value as u64)
    }

    /// Write a `bool` as a single byte (`0` or `1`).
    ///
    /// # Errors
    /// Returns [`crate::Error::BufferExhausted`] if the buffer is full.
    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u8(u8::from(value))
    }

    /// Copy a byte slice into the buffer.
    ///
    /// # Errors
    /// Returns [`crate::Error::BufferExhausted`] if the slice does not fit.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Write `len` zero bytes.
    ///
    /// Subsystems with variable live state but a fixed declared footprint use this to pad
    /// their region so the exact-consumption check holds.
    ///
    /// # Errors
    /// Returns [`crate::Error::BufferExhausted`] if fewer than `len` bytes remain.
    pub fn pad(&mut self, len: usize) -> Result<()> {
        self.reserve(len)?.fill(0);
        Ok(())
    }
}

/// A position-tracked, bounds-checked reader over a thread-state buffer.
///
/// The mirror of [`ArchiveWriter`]: subsystems receive an `ArchiveReader` in
/// [`Archivable::restore`](crate::Archivable::restore) and
/// [`Archivable::scan_roots`](crate::Archivable::scan_roots), and must consume exactly the bytes
/// the matching `archive` produced.
///
/// # Examples
///
/// ```rust
/// use lockstep::ArchiveReader;
///
/// let data = [0x2A, 0, 0, 0];
/// let mut reader = ArchiveReader::new(&data);
/// assert_eq!(reader.read_u32()?, 42);
/// # Ok::<(), lockstep::Error>(())
/// ```
pub struct ArchiveReader<'a> {
    /// The buffer being read
    data: &'a [u8],
    /// Current position within the buffer
    position: usize,
}

impl<'a> ArchiveReader<'a> {
    /// Create a new [`crate::archive::cursor::ArchiveReader`] over a byte slice.
    ///
    /// # Arguments
    /// * `data` - The buffer to read from
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        ArchiveReader { data, position: 0 }
    }

    /// Returns the current read position.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Returns the number of unread bytes.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    /// Returns `true` if there is more data available to read.
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::BufferExhausted {
                requested: len,
                remaining: self.remaining(),
            });
        }
        let start = self.position;
        self.position += len;
        Ok(&self.data[start..start + len])
    }

    /// Read a single byte.
    ///
    /// # Errors
    /// Returns [`crate::Error::BufferExhausted`] if no data remains.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a little-endian `u32`.
    ///
    /// # Errors
    /// Returns [`crate::Error::BufferExhausted`] if fewer than 4 bytes remain.
    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Read a little-endian `u64`.
    ///
    /// # Errors
    /// Returns [`crate::Error::BufferExhausted`] if fewer than 8 bytes remain.
    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Read a `usize` stored as a little-endian `u64`.
    ///
    /// # Errors
    /// Returns [`crate::Error::BufferExhausted`] if fewer than 8 bytes remain.
    pub fn read_usize(&mut self) -> Result<usize> {
        Ok(self.read_u64()? as usize)
    }

    /// Read a `bool` stored as a single byte.
    ///
    /// Any non-zero byte reads as `true`.
    ///
    /// # Errors
    /// Returns [`crate::Error::BufferExhausted`] if no data remains.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Read `len` bytes as a slice borrowed from the buffer.
    ///
    /// # Errors
    /// Returns [`crate::Error::BufferExhausted`] if fewer than `len` bytes remain.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    /// Advance the position by `len` bytes without interpreting them.
    ///
    /// The counterpart of [`ArchiveWriter::pad`].
    ///
    /// # Errors
    /// Returns [`crate::Error::BufferExhausted`] if fewer than `len` bytes remain.
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut buffer = [0u8; 64];
        {
            let mut writer = ArchiveWriter::new(&mut buffer);
            writer.write_u8(0xAB).unwrap();
            writer.write_u32(0xDEAD_BEEF).unwrap();
            writer.write_u64(u64::MAX - 1).unwrap();
            writer.write_usize(1234).unwrap();
            writer.write_bool(true).unwrap();
            writer.write_bool(false).unwrap();
            writer.write_bytes(&[1, 2, 3]).unwrap();
            assert_eq!(writer.pos(), 1 + 4 + 8 + 8 + 1 + 1 + 3);
        }

        let mut reader = ArchiveReader::new(&buffer);
        assert_eq!(reader.read_u8().unwrap(), 0xAB);
        assert_eq!(reader.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(reader.read_usize().unwrap(), 1234);
        assert!(reader.read_bool().unwrap());
        assert!(!reader.read_bool().unwrap());
        assert_eq!(reader.read_bytes(3).unwrap(), &[1, 2, 3]);
        assert_eq!(reader.pos(), 26);
    }

    #[test]
    fn test_writer_bounds() {
        let mut buffer = [0u8; 3];
        let mut writer = ArchiveWriter::new(&mut buffer);
        assert!(matches!(
            writer.write_u32(1),
            Err(Error::BufferExhausted {
                requested: 4,
                remaining: 3
            })
        ));
        // A failed write must not advance the position.
        assert_eq!(writer.pos(), 0);
        writer.write_u8(1).unwrap();
        assert_eq!(writer.remaining(), 2);
    }

    #[test]
    fn test_reader_bounds() {
        let data = [0u8; 2];
        let mut reader = ArchiveReader::new(&data);
        assert!(matches!(
            reader.read_u64(),
            Err(Error::BufferExhausted {
                requested: 8,
                remaining: 2
            })
        ));
        assert_eq!(reader.pos(), 0);
        assert!(reader.has_more_data());
        reader.skip(2).unwrap();
        assert!(!reader.has_more_data());
    }

    #[test]
    fn test_pad_and_skip_agree() {
        let mut buffer = [0xFFu8; 16];
        {
            let mut writer = ArchiveWriter::new(&mut buffer);
            writer.write_u32(7).unwrap();
            writer.pad(12).unwrap();
            assert_eq!(writer.remaining(), 0);
        }
        assert_eq!(&buffer[4..], &[0u8; 12]);

        let mut reader = ArchiveReader::new(&buffer);
        assert_eq!(reader.read_u32().unwrap(), 7);
        reader.skip(12).unwrap();
        assert_eq!(reader.remaining(), 0);
    }
}
