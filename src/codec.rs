//! Primitive codec.
//!
//! Every integer on the wire is unsigned little-endian. Decoding goes through
//! [`WireReader`], which tracks how many bytes it has consumed so the higher
//! codecs can be checked against the sizes their headers declare.

use std::io::{self, ErrorKind, Read, Write};
use std::thread;
use std::time::Duration;

use thiserror::Error;

/// Largest single allocation made up front for a length read from the wire.
const READ_CHUNK: usize = 64 * 1024;

const WOULD_BLOCK_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("truncated input: needed {needed} bytes, stream ended after {available}")]
    TruncatedInput { needed: usize, available: usize },

    #[error("unknown {field} discriminant: {value}")]
    UnknownDiscriminant { field: &'static str, value: u32 },

    #[error("inconsistent record: {0}")]
    InconsistentRecord(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Decodes a `width`-byte little-endian unsigned integer at `offset`.
///
/// Slice-window entry point; [`WireReader`] integer reads go through it too.
pub fn decode_le(buf: &[u8], offset: usize, width: usize) -> Result<u64, ProtocolError> {
    if width > 8 {
        return Err(ProtocolError::InconsistentRecord(format!(
            "integer width {width} exceeds 8 bytes"
        )));
    }
    let available = buf.len().saturating_sub(offset);
    if available < width {
        return Err(ProtocolError::TruncatedInput {
            needed: width,
            available,
        });
    }
    let value = buf[offset..offset + width]
        .iter()
        .rev()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
    Ok(value)
}

/// Sequential decoder over a byte stream.
pub struct WireReader<R> {
    inner: R,
    consumed: u64,
}

impl<R: Read> WireReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, consumed: 0 }
    }

    /// Total bytes consumed since construction.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Reads until `buf` is full or the stream ends, returning the count read.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(WOULD_BLOCK_BACKOFF),
                Err(e) => return Err(e.into()),
            }
        }
        self.consumed += filled as u64;
        Ok(filled)
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        let got = self.fill(buf)?;
        if got < buf.len() {
            return Err(ProtocolError::TruncatedInput {
                needed: buf.len(),
                available: got,
            });
        }
        Ok(())
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Like [`read_array`](Self::read_array), but a stream that ends before
    /// the first byte yields `None` instead of an error.
    pub fn try_read_array<const N: usize>(&mut self) -> Result<Option<[u8; N]>, ProtocolError> {
        let mut buf = [0u8; N];
        match self.fill(&mut buf)? {
            0 => Ok(None),
            got if got == N => Ok(Some(buf)),
            got => Err(ProtocolError::TruncatedInput {
                needed: N,
                available: got,
            }),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let buf = self.read_array::<4>()?;
        Ok(decode_le(&buf, 0, 4)? as u32)
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        let buf = self.read_array::<8>()?;
        decode_le(&buf, 0, 8)
    }

    /// Reads exactly `len` bytes. Lengths come from the wire, so the buffer
    /// grows in chunks instead of trusting `len` for one allocation.
    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::with_capacity(len.min(READ_CHUNK));
        while out.len() < len {
            let start = out.len();
            let step = (len - start).min(READ_CHUNK);
            out.resize(start + step, 0);
            let got = self.fill(&mut out[start..])?;
            if got < step {
                return Err(ProtocolError::TruncatedInput {
                    needed: len,
                    available: start + got,
                });
            }
        }
        Ok(out)
    }
}

/// Little-endian writers for any [`Write`].
pub trait WireWrite: Write {
    fn put_u8(&mut self, value: u8) -> io::Result<()> {
        self.write_all(&[value])
    }

    fn put_u32(&mut self, value: u32) -> io::Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    fn put_u64(&mut self, value: u64) -> io::Result<()> {
        self.write_all(&value.to_le_bytes())
    }
}

impl<W: Write + ?Sized> WireWrite for W {}

/// Converts a wire length to `usize`, failing on targets where it cannot fit.
pub(crate) fn wire_len(value: u64, field: &str) -> Result<usize, ProtocolError> {
    usize::try_from(value)
        .map_err(|_| ProtocolError::InconsistentRecord(format!("{field} {value} exceeds address space")))
}
