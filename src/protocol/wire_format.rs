//! Wire format encoding and decoding.
//!
//! Implements the 8-byte header format:
//! ```text
//! ┌──────────┬──────────┬─────────────────┐
//! │ Msg ID   │ Length   │ Payload         │
//! │ 4 bytes  │ 4 bytes  │ Length bytes    │
//! │ uint32 BE│ uint32 BE│                 │
//! └──────────┴──────────┴─────────────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

use crate::error::{FramelinkError, Result};

/// Size of the message id field in bytes.
pub const ID_SIZE: usize = 4;

/// Size of the length field in bytes.
pub const LENGTH_SIZE: usize = 4;

/// Header size in bytes (fixed, exactly 8).
pub const HEADER_SIZE: usize = ID_SIZE + LENGTH_SIZE;

/// Default maximum payload size (8 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 8 * 1024;

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Message type identifier.
    pub id: u32,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(id: u32, payload_length: u32) -> Self {
        Self { id, payload_length }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use framelink::protocol::Header;
    ///
    /// let bytes = Header::new(1, 100).encode();
    /// assert_eq!(bytes, [0, 0, 0, 1, 0, 0, 0, 100]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into the first `HEADER_SIZE` bytes of `buf`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[..ID_SIZE].copy_from_slice(&self.id.to_be_bytes());
        buf[ID_SIZE..HEADER_SIZE].copy_from_slice(&self.payload_length.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let head: &[u8; HEADER_SIZE] = buf.get(..HEADER_SIZE)?.try_into().ok()?;
        Some(Self::from_bytes(head))
    }

    /// Decode a complete header.
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            id: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            payload_length: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }

    /// Check the declared payload length against `max_frame_size`.
    pub fn validate(&self, max_frame_size: u32) -> Result<()> {
        if self.payload_length > max_frame_size {
            return Err(FramelinkError::OversizedFrame {
                size: u64::from(self.payload_length),
                max: max_frame_size,
            });
        }
        Ok(())
    }

    /// Total encoded frame size (header + payload).
    #[inline]
    pub fn frame_size(&self) -> usize {
        HEADER_SIZE + self.payload_length as usize
    }
}
