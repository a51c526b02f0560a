// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Vecbuild Authors

//! Byte streams over a [`VectorCursor`].
//!
//! Both streams are synchronous [`std::io::Read`] implementations: the cursor
//! is an in-process iterator, so producing bytes never blocks on IO. The
//! repository layer decides how the bytes move over the network.

use std::io::Read;

use byteorder::{ByteOrder, LittleEndian};
use snafu::location;
use vecbuild_core::{Error, Result, VectorCursor, DOC_ID_WIDTH};

/// Presents the vectors of one cursor as a contiguous little-endian byte
/// stream in cursor order.
///
/// Total readable length is `total_live_docs * bytes_per_vector`, or the
/// configured read limit if smaller. [`skip`] positions a fresh stream at an
/// arbitrary byte offset so that multipart uploads can carve the payload into
/// parts, each backed by its own cursor.
///
/// [`skip`]: VectorByteStream::skip
pub struct VectorByteStream {
    cursor: Box<dyn VectorCursor>,
    bytes_per_vector: usize,
    current: Vec<u8>,
    position: usize,
    bytes_remaining: u64,
    exhausted: bool,
}

impl std::fmt::Debug for VectorByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorByteStream")
            .field("bytes_per_vector", &self.bytes_per_vector)
            .field("position", &self.position)
            .field("bytes_remaining", &self.bytes_remaining)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl VectorByteStream {
    pub fn new(cursor: Box<dyn VectorCursor>) -> Self {
        Self::with_limit(cursor, u64::MAX)
    }

    /// A stream that yields at most `limit` bytes.
    pub fn with_limit(cursor: Box<dyn VectorCursor>, limit: u64) -> Self {
        let bytes_per_vector = cursor.bytes_per_vector() as usize;
        debug_assert!(bytes_per_vector > 0);
        Self {
            cursor,
            bytes_per_vector,
            current: Vec::with_capacity(bytes_per_vector),
            position: 0,
            bytes_remaining: limit,
            exhausted: false,
        }
    }

    /// A fresh stream advanced to `position` and bounded to `len` bytes: the
    /// part-supplier building block for multipart uploads.
    pub fn for_range(cursor: Box<dyn VectorCursor>, position: u64, len: u64) -> Result<Self> {
        let mut stream = Self::new(cursor);
        let skipped = stream.skip(position)?;
        if skipped != position {
            return Err(Error::Upload {
                message: format!("skipped {skipped} bytes, expected to skip {position}"),
                location: location!(),
            });
        }
        stream.bytes_remaining = len;
        Ok(stream)
    }

    /// Advance the stream by `n` bytes, whole vectors first, then within the
    /// vector the target offset lands in. Returns the bytes actually skipped,
    /// which is less than `n` only when the cursor runs out.
    pub fn skip(&mut self, n: u64) -> Result<u64> {
        let mut skipped = 0u64;

        // Consume what is left of the current vector first.
        let buffered = (self.current.len() - self.position) as u64;
        if buffered > 0 {
            let take = buffered.min(n);
            self.position += take as usize;
            skipped += take;
            if skipped == n {
                return Ok(n);
            }
        }

        // Whole vectors are skipped without copying their bytes.
        let mut vectors_to_skip = (n - skipped) / self.bytes_per_vector as u64;
        while vectors_to_skip > 0 {
            if self.cursor.next_doc()?.is_none() {
                self.exhausted = true;
                return Ok(skipped);
            }
            skipped += self.bytes_per_vector as u64;
            vectors_to_skip -= 1;
        }

        let remainder = n - skipped;
        if remainder > 0 {
            if !self.load_next_vector()? {
                return Ok(skipped);
            }
            self.position = remainder as usize;
            skipped += remainder;
        }
        Ok(skipped)
    }

    fn load_next_vector(&mut self) -> Result<bool> {
        if self.cursor.next_doc()?.is_none() {
            self.exhausted = true;
            return Ok(false);
        }
        self.current.clear();
        self.current.extend_from_slice(self.cursor.current_vector());
        self.position = 0;
        Ok(true)
    }
}

impl Read for VectorByteStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.bytes_remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        if self.position >= self.current.len() {
            if self.exhausted {
                return Ok(0);
            }
            match self.load_next_vector() {
                Ok(true) => {}
                Ok(false) => return Ok(0),
                Err(e) => return Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
            }
        }
        let available = self.current.len() - self.position;
        let len = available
            .min(buf.len())
            .min(self.bytes_remaining.min(usize::MAX as u64) as usize);
        buf[..len].copy_from_slice(&self.current[self.position..self.position + len]);
        self.position += len;
        self.bytes_remaining -= len as u64;
        Ok(len)
    }
}

/// Emits exactly four little-endian bytes per cursor entry: the doc id.
///
/// Total readable length is `total_live_docs * 4`.
pub struct DocIdByteStream {
    cursor: Box<dyn VectorCursor>,
    current: [u8; DOC_ID_WIDTH as usize],
    position: usize,
    exhausted: bool,
}

impl DocIdByteStream {
    pub fn new(cursor: Box<dyn VectorCursor>) -> Self {
        Self {
            cursor,
            current: [0; DOC_ID_WIDTH as usize],
            position: DOC_ID_WIDTH as usize,
            exhausted: false,
        }
    }
}

impl Read for DocIdByteStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.position >= self.current.len() {
            if self.exhausted {
                return Ok(0);
            }
            match self.cursor.next_doc() {
                Ok(Some(doc_id)) => {
                    LittleEndian::write_u32(&mut self.current, doc_id);
                    self.position = 0;
                }
                Ok(None) => {
                    self.exhausted = true;
                    return Ok(0);
                }
                Err(e) => return Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
            }
        }
        let len = (self.current.len() - self.position).min(buf.len());
        buf[..len].copy_from_slice(&self.current[self.position..self.position + len]);
        self.position += len;
        Ok(len)
    }
}
