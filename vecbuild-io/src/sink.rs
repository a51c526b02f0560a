// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Vecbuild Authors

//! Buffered writes into the segment output.

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use vecbuild_core::Result;

/// Wraps the segment output with one reusable write buffer.
///
/// The sink is created once per flush/merge and reused if the build falls
/// back to the local strategy, so the buffer is allocated exactly once per
/// segment field.
pub struct BufferedSink {
    output: Box<dyn AsyncWrite + Send + Unpin>,
    buffer: Vec<u8>,
}

impl BufferedSink {
    pub fn new(output: Box<dyn AsyncWrite + Send + Unpin>, buffer_bytes: usize) -> Self {
        Self {
            output,
            buffer: vec![0u8; buffer_bytes.max(1)],
        }
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Copy an arbitrary chunk stream into the segment output through the
    /// reusable buffer. Returns the number of bytes written.
    pub async fn write_from_stream(
        &mut self,
        stream: &mut BoxStream<'_, Result<Bytes>>,
    ) -> Result<u64> {
        let mut buffer = std::mem::take(&mut self.buffer);
        let result = self.copy_stream(stream, &mut buffer).await;
        self.buffer = buffer;
        result
    }

    /// Same as [`write_from_stream`], but copying through a caller-provided
    /// buffer. Downloads use this to honor the configured upload buffer
    /// size; the sink's own buffer stays untouched for a possible fallback
    /// build.
    ///
    /// [`write_from_stream`]: BufferedSink::write_from_stream
    pub async fn write_from_stream_with_buffer(
        &mut self,
        stream: &mut BoxStream<'_, Result<Bytes>>,
        buffer: &mut [u8],
    ) -> Result<u64> {
        self.copy_stream(stream, buffer).await
    }

    async fn copy_stream(
        &mut self,
        stream: &mut BoxStream<'_, Result<Bytes>>,
        buffer: &mut [u8],
    ) -> Result<u64> {
        let mut total = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for piece in chunk.chunks(buffer.len()) {
                buffer[..piece.len()].copy_from_slice(piece);
                self.output.write_all(&buffer[..piece.len()]).await?;
                total += piece.len() as u64;
            }
        }
        self.output.flush().await?;
        Ok(total)
    }

    /// Direct write path used by the local build strategy.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.output.write_all(data).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.output.flush().await?;
        Ok(())
    }
}

impl std::fmt::Debug for BufferedSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BufferedSink {{ buffer_bytes: {} }}", self.buffer.len())
    }
}
