//! Byte sources: positioned reads of integers, byte arrays and strings.
//!
//! A source keeps a single cursor, so one source must only serve one decode
//! at a time. Absolute reads reposition the cursor before reading.

use crate::errors::SourceError;

/// Byte order for multi-byte integer reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

/// A positioned, cursor-based source of bytes.
pub trait ByteSource: Send {
    /// Total length of the source in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn position(&self) -> u64;

    /// Moves the cursor. Positions up to and including the end are valid.
    fn set_position(&mut self, pos: u64) -> Result<(), SourceError>;

    /// Reads `len` bytes at the cursor, advancing it.
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, SourceError>;

    /// Reads `len` bytes at an absolute offset, leaving the cursor after them.
    fn read_bytes_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, SourceError> {
        self.set_position(offset)?;
        self.read_bytes(len)
    }

    /// Reads an unsigned integer of `len` bytes (1..=8) at the cursor.
    fn read_uint(&mut self, len: usize, endian: Endian) -> Result<u64, SourceError> {
        if len == 0 || len > 8 {
            return Err(SourceError::UnsupportedWidth(len));
        }
        let bytes = self.read_bytes(len)?;
        Ok(assemble_uint(&bytes, endian))
    }

    /// Reads a signed integer of `len` bytes (1..=8) at the cursor.
    fn read_int(&mut self, len: usize, endian: Endian) -> Result<i64, SourceError> {
        let value = self.read_uint(len, endian)?;
        Ok(sign_extend(value, len * 8))
    }

    /// Reads bytes up to the next NUL, consuming the NUL, and decodes UTF-8.
    fn read_cstr(&mut self) -> Result<String, SourceError> {
        let start = self.position();
        let mut out = Vec::new();
        loop {
            if self.position() >= self.len() {
                return Err(SourceError::UnterminatedString { offset: start });
            }
            let byte = self.read_bytes(1)?[0];
            if byte == 0 {
                break;
            }
            out.push(byte);
        }
        String::from_utf8(out).map_err(|_| SourceError::InvalidUtf8 { offset: start })
    }
}

/// Assembles an unsigned integer from up to 8 bytes.
pub fn assemble_uint(bytes: &[u8], endian: Endian) -> u64 {
    let mut value = 0u64;
    match endian {
        Endian::Big => {
            for &byte in bytes {
                value = (value << 8) | byte as u64;
            }
        }
        Endian::Little => {
            for &byte in bytes.iter().rev() {
                value = (value << 8) | byte as u64;
            }
        }
    }
    value
}

/// Sign-extends the low `bits` of `value` to a full `i64`.
pub fn sign_extend(value: u64, bits: usize) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

/// In-memory [`ByteSource`] over an owned byte buffer.
#[derive(Debug, Clone)]
pub struct SliceSource {
    data: Vec<u8>,
    pos: u64,
}

impl SliceSource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        SliceSource {
            data: data.into(),
            pos: 0,
        }
    }
}

impl ByteSource for SliceSource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn set_position(&mut self, pos: u64) -> Result<(), SourceError> {
        if pos > self.len() {
            return Err(SourceError::OutOfBounds {
                offset: pos,
                len: 0,
                source_len: self.len(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, SourceError> {
        let end = self
            .pos
            .checked_add(len as u64)
            .filter(|&end| end <= self.len())
            .ok_or(SourceError::OutOfBounds {
                offset: self.pos,
                len,
                source_len: self.len(),
            })?;
        let bytes = self.data[self.pos as usize..end as usize].to_vec();
        self.pos = end;
        Ok(bytes)
    }
}
