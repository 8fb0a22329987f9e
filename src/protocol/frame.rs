//! Frame struct.
//!
//! Represents one decoded `(id, payload)` unit. Uses `bytes::Bytes` so the
//! payload can be handed to handlers without copying.
//!
//! # Example
//!
//! ```
//! use framelink::protocol::Frame;
//! use bytes::Bytes;
//!
//! let frame = Frame::new(1, Bytes::from_static(b"hello"));
//! assert_eq!(frame.id(), 1);
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{Header, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type identifier.
    pub id: u32,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(id: u32, payload: Bytes) -> Self {
        Self { id, payload }
    }

    /// Create a frame from a raw slice (copies data).
    pub fn from_slice(id: u32, payload: &[u8]) -> Self {
        Self {
            id,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    /// Get the message id.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Header describing this frame.
    #[inline]
    pub fn header(&self) -> Header {
        Header::new(self.id, self.payload.len() as u32)
    }
}

/// Build a complete frame as a single contiguous byte vector.
///
/// ```
/// use framelink::protocol::{build_frame, HEADER_SIZE};
///
/// let bytes = build_frame(1, b"hello");
/// assert_eq!(bytes.len(), HEADER_SIZE + 5);
/// ```
pub fn build_frame(id: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&Header::new(id, payload.len() as u32).encode());
    buf.extend_from_slice(payload);
    buf
}
