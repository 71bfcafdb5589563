//! Byte-stream helpers for snapshot payloads.
//!
//! Thin wrappers around `io::Read`/`io::Write` carrying the endianness
//! conventions of the snapshot format: multi-byte counters are little-endian,
//! pipe identifiers are big-endian, strings and blobs are length-prefixed
//! with a little-endian u32.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};

/// Upper bound for a single length-prefixed field read back from a snapshot.
/// Guards against allocating from a corrupted length before the payload is
/// validated.
pub const MAX_FIELD_LEN: usize = 64 << 20;

/// Writes snapshot fields to an underlying output stream.
pub struct SnapshotWriter<'a> {
    inner: &'a mut dyn Write,
}

impl<'a> SnapshotWriter<'a> {
    /// Wraps an output stream.
    pub fn new(inner: &'a mut dyn Write) -> Self {
        SnapshotWriter { inner }
    }

    pub fn put_byte(&mut self, value: u8) -> io::Result<()> {
        self.inner.write_u8(value)
    }

    pub fn put_le32(&mut self, value: u32) -> io::Result<()> {
        self.inner.write_u32::<LittleEndian>(value)
    }

    pub fn put_le64(&mut self, value: u64) -> io::Result<()> {
        self.inner.write_u64::<LittleEndian>(value)
    }

    pub fn put_be64(&mut self, value: u64) -> io::Result<()> {
        self.inner.write_u64::<BigEndian>(value)
    }

    /// Writes raw bytes with no length prefix.
    pub fn put_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)
    }

    /// Writes a little-endian u32 length followed by the bytes.
    pub fn put_sized(&mut self, bytes: &[u8]) -> io::Result<()> {
        debug_assert!(bytes.len() <= u32::MAX as usize);
        self.put_le32(bytes.len() as u32)?;
        self.inner.write_all(bytes)
    }

    /// Writes a string as a sized byte field.
    pub fn put_string(&mut self, value: &str) -> io::Result<()> {
        self.put_sized(value.as_bytes())
    }
}

/// Reads snapshot fields from an underlying input stream.
pub struct SnapshotReader<'a> {
    inner: &'a mut dyn Read,
}

impl<'a> SnapshotReader<'a> {
    /// Wraps an input stream.
    pub fn new(inner: &'a mut dyn Read) -> Self {
        SnapshotReader { inner }
    }

    pub fn get_byte(&mut self) -> io::Result<u8> {
        self.inner.read_u8()
    }

    pub fn get_le32(&mut self) -> io::Result<u32> {
        self.inner.read_u32::<LittleEndian>()
    }

    pub fn get_le64(&mut self) -> io::Result<u64> {
        self.inner.read_u64::<LittleEndian>()
    }

    pub fn get_be64(&mut self) -> io::Result<u64> {
        self.inner.read_u64::<BigEndian>()
    }

    /// Reads exactly `len` raw bytes.
    pub fn get_raw(&mut self, len: usize) -> io::Result<Vec<u8>> {
        if len > MAX_FIELD_LEN {
            return Err(oversized(len));
        }
        let mut bytes = vec![0u8; len];
        self.inner.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// Reads a little-endian u32 length followed by that many bytes.
    pub fn get_sized(&mut self) -> io::Result<Vec<u8>> {
        let len = self.get_le32()? as usize;
        self.get_raw(len)
    }

    /// Reads a sized byte field and decodes it as UTF-8.
    pub fn get_string(&mut self) -> io::Result<String> {
        let bytes = self.get_sized()?;
        String::from_utf8(bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
}

fn oversized(len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("snapshot field length {} exceeds limit", len),
    )
}
