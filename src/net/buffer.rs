use bytes::{Buf, BytesMut};
use std::io;

const CHUNK_SIZE: usize = 16384;

/// A byte FIFO between a non-blocking stream and the protocol engine. Data is
/// appended at the tail and consumed from the head; `ingress`/`egress` move
/// bytes to and from a socket until it would block.
pub struct Buffer {
    data: BytesMut,
}

impl Buffer {
    #[inline]
    pub fn new(capacity: usize) -> Buffer {
        Buffer {
            data: BytesMut::with_capacity(capacity),
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Slice containing the buffered data.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..]
    }

    /// Consumes `count` bytes from the head.
    #[inline]
    pub fn advance(&mut self, count: usize) {
        self.data.advance(count);
    }

    /// Appends raw bytes at the tail.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Reads from the supplied reader until it would block, appending at the
    /// tail. Returns the bytes transferred; a clean end-of-stream surfaces as
    /// `UnexpectedEof` so callers can tell a closed peer from an idle one.
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut chunk = [0u8; CHUNK_SIZE];
        let mut total = 0;

        loop {
            match reader.read(&mut chunk) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(count) => {
                    self.data.extend_from_slice(&chunk[..count]);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Writes buffered data to the supplied writer until it would block or
    /// the buffer empties, consuming what was written. Returns the bytes
    /// transferred; unwritten data stays buffered.
    pub fn egress<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;

        while !self.data.is_empty() {
            match writer.write(&self.data[..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.data.advance(count);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }
}
