//! Async frame codec over any `AsyncRead` / `AsyncWrite`.
//!
//! `decode` pulls exactly one frame off a reader; `encode` writes exactly one
//! frame as a single contiguous buffer so that a lone writer never produces
//! interleaved partial frames.
//!
//! A declared length above the configured maximum fails decode *before* any
//! payload byte is read. The stream is left unsynchronized at that point and
//! the owning session is expected to terminate.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::frame::Frame;
use super::wire_format::{Header, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
use crate::error::{FramelinkError, Result};

/// Frame encoder/decoder bound to a maximum payload size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_size: u32,
}

impl FrameCodec {
    /// Create a codec. A `max_frame_size` of 0 selects [`DEFAULT_MAX_FRAME_SIZE`].
    pub fn new(max_frame_size: u32) -> Self {
        let max_frame_size = if max_frame_size == 0 {
            DEFAULT_MAX_FRAME_SIZE
        } else {
            max_frame_size
        };
        Self { max_frame_size }
    }

    /// Configured maximum payload size.
    #[inline]
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Fail with `OversizedFrame` if `len` exceeds the maximum.
    pub fn check_len(&self, len: usize) -> Result<()> {
        if len > self.max_frame_size as usize {
            return Err(FramelinkError::OversizedFrame {
                size: len as u64,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }

    /// Read exactly one frame.
    pub async fn decode<R>(&self, reader: &mut R) -> Result<Frame>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut head = [0u8; HEADER_SIZE];
        reader
            .read_exact(&mut head)
            .await
            .map_err(FramelinkError::read)?;

        let header = Header::from_bytes(&head);
        header.validate(self.max_frame_size)?;

        if header.payload_length == 0 {
            return Ok(Frame::new(header.id, Bytes::new()));
        }

        let mut payload = vec![0u8; header.payload_length as usize];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(FramelinkError::read)?;

        Ok(Frame::new(header.id, Bytes::from(payload)))
    }

    /// Write exactly one frame as a single contiguous buffer, then flush.
    pub async fn encode<W>(&self, writer: &mut W, id: u32, payload: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.check_len(payload.len())?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.extend_from_slice(&Header::new(id, payload.len() as u32).encode());
        buf.extend_from_slice(payload);

        // write_all reports a zero-length write as WriteZero
        writer.write_all(&buf).await.map_err(FramelinkError::write)?;
        writer.flush().await.map_err(FramelinkError::write)?;
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}
